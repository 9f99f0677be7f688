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

//! The per-connection state machine: a fixed slot, reused socket-lifetime after
//! socket-lifetime, advancing through connect, send, and receive phases.

use std::fmt;
use std::io::{self, ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::time::Instant;

use mio::event::Source;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};

use crate::config::Config;
use crate::httpparse::{self, Parsed};
use crate::stats::{RecordLatency, Stats};

/// Which readiness interest the slot is currently waiting on, replacing the original
/// design's pair of `rhandler`/`whandler` function pointers with a tagged variant —
/// exactly one interest is live per phase, so dispatch is a single match rather than
/// two independent checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Slot holds no socket; either never started, or its request budget ran out.
    Idle,
    /// Waiting for the non-blocking `connect()` to complete (write-readiness).
    Connecting,
    /// Waiting to finish writing the request buffer (write-readiness).
    Sending,
    /// Waiting for status line and headers (read-readiness).
    RecvHeaders,
    /// Waiting to drain the remainder of the response body (read-readiness).
    RecvBody,
}

/// Everything a slot needs to advance that it does not own itself: the shared
/// configuration, the reactor registry to (idempotently) register sockets with, this
/// worker's statistics block, its round-robin request cursor, and the means to
/// request a process-wide shutdown once the last request completes.
pub struct SlotCtx<'a> {
    /// Immutable, shared run configuration.
    pub config: &'a Config,
    /// The reactor this worker's sockets register with.
    pub registry: &'a Registry,
    /// This worker's monotonic counters.
    pub stats: &'a mut Stats,
    /// Worker-local round-robin cursor into `config.requests`.
    pub next_req: &'a mut usize,
    /// Called exactly once, from whichever slot observes the final request complete.
    pub request_shutdown: &'a dyn Fn(),
}

impl fmt::Debug for SlotCtx<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotCtx")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("stats", &self.stats)
            .field("next_req", &self.next_req)
            .field("request_shutdown", &"<fn>")
            .finish_non_exhaustive()
    }
}

/// A reusable connection slot: one socket lifetime at a time, recycled in place for
/// the next one.
#[derive(Debug)]
pub struct Slot {
    index: usize,
    /// Generation bit. Toggled every time this slot's socket is replaced so that
    /// readiness events queued against the previous socket incarnation are dropped
    /// instead of misdispatched to the new one's handlers.
    side: bool,
    phase: Phase,
    stream: Option<TcpStream>,
    registered: bool,
    keepalive: u64,
    last: bool,
    request_idx: usize,
    sent: usize,
    start: Instant,
    cont_len: u64,
    resp_line_ok: bool,
    resp_err: bool,
    bufn: usize,
    buf: Box<[u8]>,
}

impl Slot {
    /// Creates a fresh, idle slot with a `rbuf_size`-byte receive buffer.
    pub fn new(index: usize, rbuf_size: usize) -> Slot {
        Slot {
            index,
            side: false,
            phase: Phase::Idle,
            stream: None,
            registered: false,
            keepalive: 0,
            last: false,
            request_idx: 0,
            sent: 0,
            start: Instant::now(),
            cont_len: 0,
            resp_line_ok: false,
            resp_err: false,
            bufn: 0,
            buf: vec![0u8; rbuf_size].into_boxed_slice(),
        }
    }

    /// The reactor token this slot currently registers (or would register) under: the
    /// slot's array index with the generation bit folded into the low bit, matching
    /// spec.md's "tagged pointer" scheme adapted to a `Token`-keyed reactor.
    pub fn token(&self) -> Token {
        Token(self.index * 2 + usize::from(self.side))
    }

    /// Whether `event_side` (the generation bit recovered from an event's token) still
    /// matches this slot's current socket incarnation.
    pub fn matches_side(&self, event_side: bool) -> bool {
        event_side == self.side
    }

    /// True whenever a handler would run for this slot, i.e. the socket is open.
    fn is_active(&self) -> bool {
        !matches!(self.phase, Phase::Idle)
    }

    fn reset_per_request(&mut self) {
        self.sent = 0;
        self.start_time_usec_mark();
        self.cont_len = 0;
        self.resp_line_ok = false;
        self.resp_err = false;
        self.bufn = 0;
    }

    fn start_time_usec_mark(&mut self) {
        self.start = Instant::now();
    }

    fn elapsed_usec(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }

    fn try_reserve_request(&mut self, config: &Config) -> bool {
        let prior = config.remaining_requests.fetch_sub(1, Ordering::Relaxed);
        if prior <= 0 {
            false
        } else {
            self.last = prior == 1;
            true
        }
    }

    fn register_if_needed(&mut self, registry: &Registry) -> io::Result<()> {
        if self.registered {
            return Ok(());
        }
        let stream = self.stream.as_mut().expect("socket open while registering");
        registry.register(stream, self.token(), Interest::READABLE | Interest::WRITABLE)?;
        self.registered = true;
        Ok(())
    }

    /// Entry point for a fresh connection attempt on this slot: reserves a request
    /// budget slot, opens a new non-blocking socket, and enters the connect phase. If
    /// the global request budget is already exhausted, the slot is left idle and no
    /// socket is opened.
    pub fn start(&mut self, addr: SocketAddr, ctx: &mut SlotCtx<'_>) {
        self.reset_per_request();
        self.keepalive = 0;
        self.registered = false;
        self.last = false;

        if !self.try_reserve_request(ctx.config) {
            self.phase = Phase::Idle;
            return;
        }

        match TcpStream::connect(addr) {
            Ok(stream) => {
                self.stream = Some(stream);
                self.phase = Phase::Connecting;
                self.start_time_usec_mark();
                if let Err(e) = self.register_if_needed(ctx.registry) {
                    tracing::error!(slot = self.index, error = %e, "sock register");
                    ctx.stats.connections_failed += 1;
                    self.end(ctx);
                }
            }
            Err(e) => {
                tracing::error!(slot = self.index, error = %e, "sock connect");
                ctx.stats.connections_failed += 1;
                self.phase = Phase::Idle;
                self.stream = None;
            }
        }
    }

    /// Dispatches a read-readiness event to the handler for the current phase.
    pub fn on_readable(&mut self, ctx: &mut SlotCtx<'_>) {
        match self.phase {
            Phase::RecvHeaders => self.advance_recv_headers(ctx),
            Phase::RecvBody => self.advance_recv_body(ctx),
            _ => {}
        }
    }

    /// Dispatches a write-readiness event to the handler for the current phase.
    pub fn on_writable(&mut self, ctx: &mut SlotCtx<'_>) {
        match self.phase {
            Phase::Connecting => self.advance_connect(ctx),
            Phase::Sending => self.advance_send(ctx),
            _ => {}
        }
    }

    fn advance_connect(&mut self, ctx: &mut SlotCtx<'_>) {
        let stream = self.stream.as_ref().expect("socket open in Connecting phase");
        match stream.take_error() {
            Ok(None) => {}
            Ok(Some(e)) | Err(e) => {
                tracing::error!(slot = self.index, error = %e, "sock connect");
                ctx.stats.connections_failed += 1;
                self.end(ctx);
                return;
            }
        }
        if stream.peer_addr().is_err() {
            // Still connecting; wait for the next write-readiness event.
            return;
        }

        ctx.stats.connections_ok += 1;
        ctx.stats.on_connect(self.elapsed_usec());
        self.phase = Phase::Sending;
        self.advance_send(ctx);
    }

    fn advance_send(&mut self, ctx: &mut SlotCtx<'_>) {
        if self.sent == 0 {
            self.request_idx = *ctx.next_req;
            *ctx.next_req = (*ctx.next_req + 1) % ctx.config.requests.len();
            if let Some(stream) = &self.stream {
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::debug!(slot = self.index, error = %e, "set TCP_NODELAY");
                }
            }
        }

        let body = &ctx.config.requests[self.request_idx];
        while self.sent < body.len() {
            let stream = self.stream.as_mut().expect("socket open in Sending phase");
            match stream.write(&body[self.sent..]) {
                Ok(n) => {
                    self.sent += n;
                    ctx.stats.total_sent += n as u64;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    self.phase = Phase::Sending;
                    if let Err(e) = self.register_if_needed(ctx.registry) {
                        tracing::error!(slot = self.index, error = %e, "sock send");
                        self.end(ctx);
                    }
                    return;
                }
                Err(e) => {
                    tracing::error!(slot = self.index, error = %e, "sock send");
                    self.end(ctx);
                    return;
                }
            }
        }

        self.start_time_usec_mark();
        self.phase = Phase::RecvHeaders;
        self.advance_recv_headers(ctx);
    }

    fn advance_recv_headers(&mut self, ctx: &mut SlotCtx<'_>) {
        loop {
            let stream = self.stream.as_mut().expect("socket open in RecvHeaders phase");
            match stream.read(&mut self.buf[self.bufn..]) {
                Ok(0) => {
                    tracing::error!(slot = self.index, "server closed connection");
                    self.end(ctx);
                    return;
                }
                Ok(n) => {
                    self.bufn += n;
                    ctx.stats.total_recv += n as u64;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    self.phase = Phase::RecvHeaders;
                    if let Err(e) = self.register_if_needed(ctx.registry) {
                        tracing::error!(slot = self.index, error = %e, "sock recv");
                        self.end(ctx);
                    }
                    return;
                }
                Err(e) => {
                    tracing::error!(slot = self.index, error = %e, "sock recv");
                    self.end(ctx);
                    return;
                }
            }

            match self.parse_response(ctx) {
                ParseOutcome::NeedMore => {
                    if self.bufn == self.buf.len() {
                        tracing::error!(slot = self.index, "too large HTTP response");
                        self.end(ctx);
                        return;
                    }
                }
                ParseOutcome::Malformed => {
                    self.end(ctx);
                    return;
                }
                ParseOutcome::HeadersDone => {
                    self.phase = Phase::RecvBody;
                    self.advance_recv_body(ctx);
                    return;
                }
            }
        }
    }

    /// Parses as much of `self.buf[..self.bufn]` as is available. Restartable: on
    /// `NeedMore` the caller reads more bytes and calls again; no parser state is
    /// retained beyond `bufn`, `resp_line_ok`, and `cont_len`.
    fn parse_response(&mut self, ctx: &mut SlotCtx<'_>) -> ParseOutcome {
        let data = &self.buf[..self.bufn];

        let (proto_consumed, code) = match httpparse::parse_status_line(data) {
            Ok(Parsed::Incomplete) => return ParseOutcome::NeedMore,
            Ok(Parsed::Complete { value, consumed }) => (consumed, value.code),
            Err(_) => {
                tracing::error!(slot = self.index, "bad HTTP response line");
                return ParseOutcome::Malformed;
            }
        };

        if !self.resp_line_ok {
            self.resp_line_ok = true;
            ctx.stats.on_response(self.elapsed_usec());
        }

        let mut pos = proto_consumed;
        loop {
            match httpparse::parse_header(&data[pos..]) {
                Ok(Parsed::Incomplete) => return ParseOutcome::NeedMore,
                Ok(Parsed::Complete { value, consumed }) => {
                    pos += consumed;
                    if value.name.is_empty() {
                        break;
                    }
                    if httpparse::header_name_eq(value.name, "Content-Length") {
                        match std::str::from_utf8(value.value).ok().and_then(|s| s.parse().ok()) {
                            Some(n) => self.cont_len = n,
                            None => {
                                tracing::error!(slot = self.index, "bad Content-Length");
                                return ParseOutcome::Malformed;
                            }
                        }
                    }
                }
                Err(_) => {
                    tracing::error!(slot = self.index, "bad HTTP header");
                    return ParseOutcome::Malformed;
                }
            }
        }

        let already_read = (self.bufn - pos) as u64;
        if already_read > self.cont_len {
            tracing::error!(
                slot = self.index,
                already_read,
                cont_len = self.cont_len,
                "received data is larger than Content-Length"
            );
            return ParseOutcome::Malformed;
        }
        self.cont_len -= already_read;

        if code / 100 == 4 || code / 100 == 5 {
            self.resp_err = true;
        }

        self.bufn = 0;
        ParseOutcome::HeadersDone
    }

    fn advance_recv_body(&mut self, ctx: &mut SlotCtx<'_>) {
        while self.cont_len != 0 {
            let n = (self.cont_len as usize).min(self.buf.len());
            let stream = self.stream.as_mut().expect("socket open in RecvBody phase");
            match stream.read(&mut self.buf[..n]) {
                Ok(0) => {
                    tracing::error!(slot = self.index, "server closed connection");
                    self.end(ctx);
                    return;
                }
                Ok(read) => {
                    self.cont_len -= read as u64;
                    ctx.stats.total_recv += read as u64;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    self.phase = Phase::RecvBody;
                    if let Err(e) = self.register_if_needed(ctx.registry) {
                        tracing::error!(slot = self.index, error = %e, "sock recv");
                        self.end(ctx);
                    }
                    return;
                }
                Err(e) => {
                    tracing::error!(slot = self.index, error = %e, "sock recv");
                    self.end(ctx);
                    return;
                }
            }
        }

        if self.resp_err {
            ctx.stats.resp_err += 1;
        } else {
            ctx.stats.resp_ok += 1;
        }

        self.keepalive += 1;
        if self.keepalive == ctx.config.keepalive || self.last {
            // Either the keep-alive cap was hit (close and let the worker restart this
            // slot on a new socket) or this was the last request in the whole run
            // (close and request shutdown); `end` tells the two apart via `self.last`.
            self.end(ctx);
            return;
        }

        if !self.try_reserve_request(ctx.config) {
            self.phase = Phase::Idle;
            return;
        }

        self.reset_per_request();
        self.phase = Phase::Sending;
        self.advance_send(ctx);
    }

    /// Closes the socket (if still open), flips the generation bit so any readiness
    /// events already queued against it are dropped rather than misdispatched, and
    /// either requests shutdown (if this was the last request) or restarts the slot
    /// on a new socket.
    fn end(&mut self, ctx: &mut SlotCtx<'_>) {
        self.close_socket(ctx.registry);
        self.side = !self.side;
        if self.last {
            (ctx.request_shutdown)();
            return;
        }
        // Leaves the slot idle; the worker's restart pass calls `start` again with a
        // fresh socket once it notices `awaiting_restart`.
        self.phase = Phase::Idle;
    }

    fn close_socket(&mut self, registry: &Registry) {
        if let Some(mut stream) = self.stream.take() {
            if self.registered {
                let _ = Source::deregister(&mut stream, registry);
            }
        }
        self.registered = false;
    }

    /// True once `end()` has left this slot idle and ready to be restarted by the
    /// worker on a fresh socket.
    pub fn awaiting_restart(&self) -> bool {
        matches!(self.phase, Phase::Idle) && !self.last
    }
}

enum ParseOutcome {
    NeedMore,
    Malformed,
    HeadersDone,
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_ctx<'a>(
        config: &'a Config,
        registry: &'a Registry,
        stats: &'a mut Stats,
        next_req: &'a mut usize,
        request_shutdown: &'a dyn Fn(),
    ) -> SlotCtx<'a> {
        SlotCtx { config, registry, stats, next_req, request_shutdown }
    }

    #[test]
    fn token_folds_generation_into_low_bit() {
        let mut slot = Slot::new(5, 4096);
        assert_eq!(Token(10), slot.token());
        slot.side = true;
        assert_eq!(Token(11), slot.token());
    }

    #[test]
    fn matches_side_detects_stale_generation() {
        let slot = Slot::new(0, 4096);
        assert!(slot.matches_side(false));
        assert!(!slot.matches_side(true));
    }

    #[test]
    fn fresh_slot_is_idle() {
        let slot = Slot::new(0, 4096);
        assert!(!slot.is_active());
    }

    #[test]
    fn parse_response_rejects_4xx_and_5xx() {
        let mut slot = Slot::new(0, 256);
        let poll = mio::Poll::new().unwrap();
        let cfg = test_config();
        let mut stats = Stats::default();
        let mut next_req = 0usize;
        let noop = || {};
        let mut ctx = test_ctx(&cfg, poll.registry(), &mut stats, &mut next_req, &noop);

        let resp = b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 3\r\n\r\nfoo";
        slot.buf[..resp.len()].copy_from_slice(resp);
        slot.bufn = resp.len();
        assert!(matches!(slot.parse_response(&mut ctx), ParseOutcome::HeadersDone));
        assert!(slot.resp_err);
        assert_eq!(0, slot.cont_len);
    }

    #[test]
    fn parse_response_accepts_2xx() {
        let mut slot = Slot::new(0, 256);
        let poll = mio::Poll::new().unwrap();
        let cfg = test_config();
        let mut stats = Stats::default();
        let mut next_req = 0usize;
        let noop = || {};
        let mut ctx = test_ctx(&cfg, poll.registry(), &mut stats, &mut next_req, &noop);

        let resp = b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n";
        slot.buf[..resp.len()].copy_from_slice(resp);
        slot.bufn = resp.len();
        assert!(matches!(slot.parse_response(&mut ctx), ParseOutcome::HeadersDone));
        assert!(!slot.resp_err);
    }

    #[test]
    fn parse_response_needs_more_without_blank_line() {
        let mut slot = Slot::new(0, 256);
        let poll = mio::Poll::new().unwrap();
        let cfg = test_config();
        let mut stats = Stats::default();
        let mut next_req = 0usize;
        let noop = || {};
        let mut ctx = test_ctx(&cfg, poll.registry(), &mut stats, &mut next_req, &noop);

        let resp = b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n";
        slot.buf[..resp.len()].copy_from_slice(resp);
        slot.bufn = resp.len();
        assert!(matches!(slot.parse_response(&mut ctx), ParseOutcome::NeedMore));
    }

    #[test]
    fn parse_response_rejects_oversize_body_claim() {
        let mut slot = Slot::new(0, 256);
        let poll = mio::Poll::new().unwrap();
        let cfg = test_config();
        let mut stats = Stats::default();
        let mut next_req = 0usize;
        let noop = || {};
        let mut ctx = test_ctx(&cfg, poll.registry(), &mut stats, &mut next_req, &noop);

        let resp = b"HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\ntoolong";
        slot.buf[..resp.len()].copy_from_slice(resp);
        slot.bufn = resp.len();
        assert!(matches!(slot.parse_response(&mut ctx), ParseOutcome::Malformed));
    }

    fn test_config() -> Config {
        Config {
            addr: "127.0.0.1:0".parse().unwrap(),
            concurrency: 1,
            threads: 1,
            keepalive: 64,
            rbuf_size: 4096,
            events_capacity: 8,
            affinity_mask: 0,
            debug: false,
            requests: vec![b"GET / HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n".to_vec()],
            remaining_requests: std::sync::atomic::AtomicI64::new(1),
        }
    }
}
