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

//! Command-line schema: `aggressor [OPTIONS] URL...`.

use clap::Parser;

fn parse_hex_mask(s: &str) -> Result<u32, String> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u32::from_str_radix(digits, 16).map_err(|e| format!("invalid hex affinity mask: {e}"))
}

/// HTTP/1 load generator: opens a pool of pipelined keep-alive connections against one
/// or more numeric-address URLs and reports aggregate throughput and latency.
#[derive(Parser, Debug)]
#[command(name = "aggressor", version, about, long_about = None)]
pub struct Cli {
    /// Request URLs: HOST[:PORT][/PATH]. Host names are NOT supported; use a numeric
    /// IPv4 or bracketed IPv6 address.
    #[arg(required = true)]
    pub urls: Vec<String>,

    /// Total number of requests across the run.
    #[arg(short = 'n', long = "number", default_value_t = i32::MAX as i64)]
    pub number: i64,

    /// Total concurrent connections.
    #[arg(short = 'c', long = "concurrency", default_value_t = 100)]
    pub concurrency: usize,

    /// Worker threads (default: online CPU count).
    #[arg(short = 't', long = "threads", default_value_t = 0)]
    pub threads: usize,

    /// CPU affinity bitmask, as a hexadecimal integer (e.g. `f` for CPUs 0-3).
    #[arg(short = 'a', long = "affinity", default_value_t = 0, value_parser = parse_hex_mask)]
    pub affinity: u32,

    /// Maximum keep-alive requests per connection before it is closed and reopened.
    #[arg(short = 'k', long = "keepalive", default_value_t = 64)]
    pub keepalive: u64,

    /// HTTP request method.
    #[arg(short = 'm', long = "method", default_value = "GET")]
    pub method: String,

    /// Extra request header, appended verbatim to every request. May be repeated.
    #[arg(short = 'H', long = "header")]
    pub headers: Vec<String>,

    /// Enable debug logging on stderr.
    #[arg(short = 'D', long = "debug", default_value_t = false)]
    pub debug: bool,

    /// Per-connection receive buffer size, in bytes.
    #[arg(long = "rbuf", default_value_t = 4096, hide = true)]
    pub rbuf_size: usize,

    /// Reactor event buffer capacity per worker.
    #[arg(long = "events", default_value_t = 512, hide = true)]
    pub events_capacity: usize,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_hex_mask_accepts_bare_hex() {
        assert_eq!(Ok(0xf), parse_hex_mask("f"));
    }

    #[test]
    fn parse_hex_mask_accepts_0x_prefix() {
        assert_eq!(Ok(0xf), parse_hex_mask("0xf"));
    }

    #[test]
    fn cli_parses_minimal_invocation() {
        let cli = Cli::parse_from(["aggressor", "127.0.0.1:8080"]);
        assert_eq!(vec!["127.0.0.1:8080".to_string()], cli.urls);
        assert_eq!(100, cli.concurrency);
        assert_eq!(64, cli.keepalive);
        assert_eq!("GET", cli.method);
        assert!(!cli.debug);
    }

    #[test]
    fn cli_collects_repeated_headers() {
        let cli = Cli::parse_from([
            "aggressor",
            "-H",
            "Accept: */*",
            "-H",
            "X-Test: 1",
            "127.0.0.1",
        ]);
        assert_eq!(vec!["Accept: */*", "X-Test: 1"], cli.headers);
    }
}
