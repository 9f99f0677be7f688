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

//! End-to-end scenarios against a loopback HTTP/1 responder, mirroring the original
//! design's documented test scenarios.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::AtomicI64;
use std::sync::Arc;

use aggressor::config::Config;
use aggressor::driver;

fn make_config(addr: std::net::SocketAddr, number: i64, concurrency: usize, threads: usize, keepalive: u64) -> Arc<Config> {
    Arc::new(Config {
        addr,
        concurrency,
        threads,
        keepalive,
        rbuf_size: 4096,
        events_capacity: 64,
        affinity_mask: 0,
        debug: false,
        requests: vec![b"GET / HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n".to_vec()],
        remaining_requests: AtomicI64::new(number),
    })
}

/// Reads one pipelined HTTP/1 request off `stream` (up to the blank line) and
/// discards it; returns `false` on EOF.
fn read_one_request(stream: &mut TcpStream) -> bool {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 512];
    loop {
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            return true;
        }
        match stream.read(&mut chunk) {
            Ok(0) => return false,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(_) => return false,
        }
    }
}

/// Spawns a background thread that accepts `conns` sequential connections, serving
/// `per_conn` canned responses on each before moving to the next.
fn spawn_responder(listener: TcpListener, conns: usize, per_conn: usize, response: &'static [u8]) {
    std::thread::spawn(move || {
        for _ in 0..conns {
            let Ok((mut stream, _)) = listener.accept() else { return };
            for _ in 0..per_conn {
                if !read_one_request(&mut stream) {
                    break;
                }
                if stream.write_all(response).is_err() {
                    break;
                }
            }
        }
    });
}

#[test]
fn single_fast_response() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let response = b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n";
    spawn_responder(listener, 1, 1, response);

    let config = make_config(addr, 1, 1, 1, 64);
    let report = driver::run(config).expect("run succeeds");

    assert_eq!(1, report.stats.connections_ok);
    assert_eq!(0, report.stats.connections_failed);
    assert_eq!(1, report.stats.resp_ok);
    assert_eq!(0, report.stats.resp_err);
    assert_eq!(
        b"GET / HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n".len() as u64,
        report.stats.total_sent
    );
    assert_eq!(response.len() as u64, report.stats.total_recv);
}

#[test]
fn keepalive_cap_reopens_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let response = b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n";
    spawn_responder(listener, 2, 2, response);

    let config = make_config(addr, 4, 1, 1, 2);
    let report = driver::run(config).expect("run succeeds");

    assert_eq!(2, report.stats.connections_ok);
    assert_eq!(4, report.stats.resp_ok);
    assert_eq!(0, report.stats.resp_err);
}

#[test]
fn server_error_counts_as_resp_err() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let response = b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 3\r\n\r\nfoo";
    spawn_responder(listener, 1, 1, response);

    let config = make_config(addr, 1, 1, 1, 64);
    let report = driver::run(config).expect("run succeeds");

    assert_eq!(1, report.stats.connections_ok);
    assert_eq!(1, report.stats.resp_err);
    assert_eq!(0, report.stats.resp_ok);
}

#[test]
fn malformed_response_does_not_count_as_connection_failure() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    spawn_responder(listener, 1, 1, b"GARBAGE\r\n");

    let config = make_config(addr, 1, 1, 1, 64);
    let report = driver::run(config).expect("run succeeds");

    assert_eq!(1, report.stats.connections_ok);
    assert_eq!(0, report.stats.connections_failed);
    assert_eq!(0, report.stats.resp_ok);
    assert_eq!(0, report.stats.resp_err);
}

#[test]
fn oversize_response_recycles_and_still_shuts_down() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    // Headers alone exceed the default 4096-byte receive buffer and never terminate
    // with a blank line, forcing the "too large" path.
    let oversize: Vec<u8> = std::iter::once(b"HTTP/1.1 200 OK\r\n".to_vec())
        .chain(std::iter::repeat(b"X-Pad: aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\r\n".to_vec()).take(100))
        .flatten()
        .collect();
    let oversize: &'static [u8] = Box::leak(oversize.into_boxed_slice());
    spawn_responder(listener, 1, 1, oversize);

    let config = make_config(addr, 1, 1, 1, 64);
    let report = driver::run(config).expect("run terminates even on a malformed connection");

    assert_eq!(1, report.stats.connections_ok);
    assert_eq!(0, report.stats.resp_ok);
    assert_eq!(0, report.stats.resp_err);
}

#[test]
fn zero_slots_when_concurrency_below_thread_count() {
    // Per spec, workers with zero slots run their loop and never issue I/O; they only
    // exit on an external shutdown trigger (SIGINT), so this case is checked at the
    // configuration level rather than by running the driver to completion.
    let config = make_config("127.0.0.1:1".parse().unwrap(), 0, 1, 4, 64);
    assert_eq!(0, config.slots_per_worker());
}
