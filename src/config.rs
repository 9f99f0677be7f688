// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The immutable, process-lived configuration shared read-only by every worker.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::AtomicI64;

use crate::cli::Cli;

/// A request URL, already validated down to a numeric address, port, and path.
#[derive(Debug, Clone)]
struct Url {
    host_text: String,
    addr: IpAddr,
    port: u16,
    path: String,
}

/// Failure turning CLI input into a runnable [`Config`].
#[derive(Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// No URL was given on the command line.
    NoUrl,
    /// A URL's host was not a numeric IPv4 or IPv6 address.
    BadHost(String),
    /// A URL's port was missing, zero, or out of range.
    BadPort(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::NoUrl => write!(f, "at least one URL is required"),
            ConfigError::BadHost(h) => write!(f, "bad IP address: {h}"),
            ConfigError::BadPort(p) => write!(f, "bad port: {p}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Parses a URL of the form `HOST[:PORT][/PATH]`. `HOST` must be a numeric IPv4 or
/// bracketed IPv6 literal; DNS names are rejected, per spec.
fn parse_url(raw: &str) -> Result<Url, ConfigError> {
    let (authority, path) = match raw.find('/') {
        Some(i) => (&raw[..i], &raw[i..]),
        None => (raw, "/"),
    };

    let (host_text, port_text) = if let Some(rest) = authority.strip_prefix('[') {
        let close = rest
            .find(']')
            .ok_or_else(|| ConfigError::BadHost(authority.to_string()))?;
        let host = &rest[..close];
        let after = &rest[close + 1..];
        let port = after.strip_prefix(':').unwrap_or("");
        (host, port)
    } else if let Ok(addr) = authority.parse::<IpAddr>() {
        let _ = addr; // bare multi-colon IPv6 literal with no port suffix
        (authority, "")
    } else {
        match authority.rsplit_once(':') {
            Some((h, p)) => (h, p),
            None => (authority, ""),
        }
    };

    let addr: IpAddr = host_text
        .parse()
        .map_err(|_| ConfigError::BadHost(host_text.to_string()))?;

    let port = if port_text.is_empty() {
        80
    } else {
        port_text
            .parse::<u16>()
            .ok()
            .filter(|&p| p != 0)
            .ok_or_else(|| ConfigError::BadPort(port_text.to_string()))?
    };

    Ok(Url {
        host_text: host_text.to_string(),
        addr,
        port,
        path: path.to_string(),
    })
}

/// Renders one wire-ready HTTP/1.1 request: request line, `Host` header, the
/// caller-supplied headers verbatim, and the terminating blank line. Byte-exact, and
/// reused verbatim for every request sent against this buffer's slot in the table.
fn render_request(method: &str, url: &Url, headers: &[String]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(128);
    buf.extend_from_slice(method.as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(url.path.as_bytes());
    buf.extend_from_slice(b" HTTP/1.1\r\n");
    buf.extend_from_slice(format!("Host: {}:{}\r\n", url.host_text, url.port).as_bytes());
    for h in headers {
        buf.extend_from_slice(h.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"\r\n");
    buf
}

/// Immutable run configuration, shared read-only by every worker thread behind an
/// `Arc`. [`Config::remaining_requests`] is the one piece of run-time shared mutable
/// state: every worker decrements it with a relaxed fetch-sub as requests are issued.
#[derive(Debug)]
pub struct Config {
    /// The numeric target address. Per spec.md §9, when multiple URLs are given, only
    /// the last one's address is used to open connections — a preserved quirk of the
    /// original implementation, not a bug introduced here. See DESIGN.md.
    pub addr: SocketAddr,
    /// Total concurrent connections across all workers.
    pub concurrency: usize,
    /// Worker thread count (one runs inline on the calling thread).
    pub threads: usize,
    /// Requests per connection before it is closed and reopened.
    pub keepalive: u64,
    /// Receive buffer size per connection, in bytes.
    pub rbuf_size: usize,
    /// Reactor event buffer capacity per worker.
    pub events_capacity: usize,
    /// CPU affinity bitmask; 0 disables pinning.
    pub affinity_mask: u32,
    /// Enables debug-level logging.
    pub debug: bool,
    /// The prepared, wire-ready request buffers, cycled round-robin per worker.
    pub requests: Vec<Vec<u8>>,
    /// Requests remaining to be issued across the whole run; decremented by every
    /// worker via a relaxed atomic fetch-sub.
    pub remaining_requests: AtomicI64,
}

impl Config {
    /// Builds a [`Config`] from parsed CLI arguments, validating URLs and rendering
    /// the request table.
    pub fn from_cli(cli: &Cli) -> Result<Config, ConfigError> {
        if cli.urls.is_empty() {
            return Err(ConfigError::NoUrl);
        }

        let mut requests = Vec::with_capacity(cli.urls.len());
        let mut addr = None;
        for raw in &cli.urls {
            let url = parse_url(raw)?;
            addr = Some(SocketAddr::new(url.addr, url.port));
            requests.push(render_request(&cli.method, &url, &cli.headers));
        }

        let threads = if cli.threads == 0 {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        } else {
            cli.threads
        };

        Ok(Config {
            addr: addr.expect("at least one URL was validated above"),
            concurrency: cli.concurrency,
            threads,
            keepalive: cli.keepalive,
            rbuf_size: cli.rbuf_size,
            events_capacity: cli.events_capacity,
            affinity_mask: cli.affinity,
            debug: cli.debug,
            requests,
            remaining_requests: AtomicI64::new(cli.number),
        })
    }

    /// Number of slots each worker should allocate: `concurrency / threads`, truncated.
    /// Surplus connections beyond `threads * slots_per_worker` are dropped, per spec.
    pub fn slots_per_worker(&self) -> usize {
        self.concurrency / self.threads
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_url_defaults_port_and_path() {
        let u = parse_url("127.0.0.1").unwrap();
        assert_eq!(80, u.port);
        assert_eq!("/", u.path);
    }

    #[test]
    fn parse_url_reads_port_and_path() {
        let u = parse_url("127.0.0.1:8080/file").unwrap();
        assert_eq!(8080, u.port);
        assert_eq!("/file", u.path);
    }

    #[test]
    fn parse_url_accepts_bracketed_ipv6_with_port() {
        let u = parse_url("[::1]:8080/x").unwrap();
        assert_eq!(IpAddr::from([0, 0, 0, 0, 0, 0, 0, 1]), u.addr);
        assert_eq!(8080, u.port);
    }

    #[test]
    fn parse_url_accepts_bare_ipv6_without_port() {
        let u = parse_url("::1/x").unwrap();
        assert_eq!(80, u.port);
        assert_eq!("/x", u.path);
    }

    #[test]
    fn parse_url_rejects_dns_names() {
        assert_eq!(
            Err(ConfigError::BadHost("example.com".to_string())),
            parse_url("example.com/")
        );
    }

    #[test]
    fn parse_url_rejects_zero_port() {
        assert!(matches!(parse_url("127.0.0.1:0"), Err(ConfigError::BadPort(_))));
    }

    #[test]
    fn render_request_is_byte_exact() {
        let url = parse_url("127.0.0.1:8080/file").unwrap();
        let req = render_request("GET", &url, &["X-Test: 1".to_string()]);
        assert_eq!(
            b"GET /file HTTP/1.1\r\nHost: 127.0.0.1:8080\r\nX-Test: 1\r\n\r\n".as_slice(),
            req.as_slice()
        );
    }
}
