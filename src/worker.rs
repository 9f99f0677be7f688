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

//! The reactor loop: one per worker thread, each owning a fixed slot pool and polling
//! its own `mio::Poll` instance until told to stop.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mio::{Events, Poll, Token, Waker};

use crate::config::Config;
use crate::driver::Shutdown;
use crate::slot::{Slot, SlotCtx};
use crate::stats::Stats;
use crate::sys;

/// Reserved token for the cross-thread wake endpoint; real slot tokens are always
/// even/odd pairs below `2 * slots_per_worker`, which never reaches `usize::MAX`.
const WAKE_TOKEN: Token = Token(usize::MAX);

/// One reactor: a `Poll`, its slot pool, and this worker's running statistics.
#[derive(Debug)]
pub struct Worker {
    id: usize,
    poll: Poll,
    events: Events,
    stop: Arc<AtomicBool>,
    /// Kept alive for the worker's lifetime; dropping a `Waker` invalidates its
    /// registration.
    _waker: Arc<Waker>,
    slots: Vec<Slot>,
    next_req: usize,
    stats: Stats,
    config: Arc<Config>,
    shutdown: Arc<Shutdown>,
    cpu: Option<usize>,
}

impl Worker {
    /// Builds a worker's reactor and slot pool. The returned `Waker` must be handed to
    /// the driver before any worker runs, so a process-wide [`Shutdown`] can be built
    /// from every worker's `(stop, waker)` pair up front.
    pub fn new(
        id: usize,
        config: Arc<Config>,
        stop: Arc<AtomicBool>,
        cpu: Option<usize>,
    ) -> io::Result<(Worker, Arc<Waker>)> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        let slots = (0..config.slots_per_worker())
            .map(|i| Slot::new(i, config.rbuf_size))
            .collect();

        let worker = Worker {
            id,
            poll,
            events: Events::with_capacity(config.events_capacity),
            stop,
            _waker: Arc::clone(&waker),
            slots,
            next_req: 0,
            stats: Stats::default(),
            config,
            // Replaced by `with_shutdown` once the driver has built it; every worker
            // needs every other worker's waker to exist first, so it cannot be known
            // at construction time.
            shutdown: Arc::new(Shutdown::empty()),
            cpu,
        };
        Ok((worker, waker))
    }

    /// Finishes wiring this worker to the process-wide shutdown registry, once the
    /// driver has assembled it from every worker's waker.
    pub fn with_shutdown(mut self, shutdown: Arc<Shutdown>) -> Worker {
        self.shutdown = shutdown;
        self
    }

    /// Runs the reactor loop to completion: opens every slot's first connection, then
    /// polls until `stop` is observed, dispatching readiness events and restarting
    /// slots that finished a socket's lifetime. Returns this worker's final counters.
    pub fn run(mut self) -> Stats {
        if let Some(cpu) = self.cpu {
            sys::pin_current_thread(cpu);
        }

        let addr = self.config.addr;
        tracing::debug!(worker = self.id, slots = self.slots.len(), "worker starting");

        {
            let request_shutdown = || self.shutdown.trigger();
            for slot in &mut self.slots {
                let mut ctx = SlotCtx {
                    config: &self.config,
                    registry: self.poll.registry(),
                    stats: &mut self.stats,
                    next_req: &mut self.next_req,
                    request_shutdown: &request_shutdown,
                };
                slot.start(addr, &mut ctx);
            }
        }

        while !self.stop.load(Ordering::Acquire) {
            if let Err(e) = self.poll.poll(&mut self.events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                tracing::error!(worker = self.id, error = %e, "poll failed");
                break;
            }

            let request_shutdown = || self.shutdown.trigger();
            for event in self.events.iter() {
                let token = event.token();
                if token == WAKE_TOKEN {
                    continue;
                }
                let idx = token.0 / 2;
                let side = token.0 % 2 == 1;
                if idx >= self.slots.len() || !self.slots[idx].matches_side(side) {
                    continue;
                }

                let mut ctx = SlotCtx {
                    config: &self.config,
                    registry: self.poll.registry(),
                    stats: &mut self.stats,
                    next_req: &mut self.next_req,
                    request_shutdown: &request_shutdown,
                };
                if event.is_writable() {
                    self.slots[idx].on_writable(&mut ctx);
                }
                if event.is_readable() {
                    self.slots[idx].on_readable(&mut ctx);
                }
            }

            for slot in &mut self.slots {
                if slot.awaiting_restart() {
                    let mut ctx = SlotCtx {
                        config: &self.config,
                        registry: self.poll.registry(),
                        stats: &mut self.stats,
                        next_req: &mut self.next_req,
                        request_shutdown: &request_shutdown,
                    };
                    slot.start(addr, &mut ctx);
                }
            }
        }

        tracing::debug!(worker = self.id, "worker stopping");
        self.stats
    }
}
