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

//! Ties the worker pool together: spawns `threads - 1` workers, runs one inline on the
//! calling thread, and wires up the two triggers that end a run — SIGINT and the last
//! request completing.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use mio::Waker;

use crate::config::Config;
use crate::stats::Report;
use crate::sys;
use crate::worker::Worker;

/// Raises the file-descriptor limit once concurrency is high enough that the
/// platform default (commonly 1024) would otherwise start rejecting connects.
const FD_LIMIT_THRESHOLD: usize = 1024;

/// Failure starting the worker pool.
#[derive(Debug)]
pub enum DriverError {
    /// A reactor, waker, or thread could not be created.
    Io(io::Error),
    /// The SIGINT handler could not be installed.
    SignalHandler(ctrlc::Error),
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverError::Io(e) => write!(f, "{e}"),
            DriverError::SignalHandler(e) => write!(f, "failed to install SIGINT handler: {e}"),
        }
    }
}

impl std::error::Error for DriverError {}

impl From<io::Error> for DriverError {
    fn from(e: io::Error) -> Self {
        DriverError::Io(e)
    }
}

impl From<ctrlc::Error> for DriverError {
    fn from(e: ctrlc::Error) -> Self {
        DriverError::SignalHandler(e)
    }
}

/// The process-wide shutdown registry: every worker's `(stop flag, wake endpoint)`
/// pair. `trigger` is called from exactly two sites — the SIGINT handler and whichever
/// slot observes the globally last request complete — and is safe to call more than
/// once or concurrently from multiple workers.
#[derive(Debug)]
pub struct Shutdown {
    handles: Vec<(Arc<AtomicBool>, Arc<Waker>)>,
}

impl Shutdown {
    /// A registry with no workers wired in yet; placeholder until [`Shutdown::new`]
    /// replaces it once every worker's waker exists.
    pub fn empty() -> Shutdown {
        Shutdown { handles: Vec::new() }
    }

    fn new(handles: Vec<(Arc<AtomicBool>, Arc<Waker>)>) -> Shutdown {
        Shutdown { handles }
    }

    /// Stops every worker: sets each one's flag before waking it, so the woken poll
    /// call always observes the flag set.
    pub fn trigger(&self) {
        for (stop, waker) in &self.handles {
            stop.store(true, Ordering::Release);
            let _ = waker.wake();
        }
    }
}

/// Assigns CPU indices to workers in order, highest CPU number to worker 0, or `None`
/// for every worker when no affinity mask was given.
fn cpu_assignments(config: &Config) -> Vec<Option<usize>> {
    if config.affinity_mask == 0 {
        return vec![None; config.threads];
    }
    let cpus = sys::cpu_indices_high_to_low(config.affinity_mask);
    (0..config.threads)
        .map(|i| cpus.get(i).copied())
        .collect()
}

/// Builds the worker pool, runs it to completion, and returns the aggregated report.
///
/// One worker runs inline on the calling thread; the rest run on spawned threads. This
/// mirrors the original design's choice to avoid idling the thread that started the
/// run.
pub fn run(config: Arc<Config>) -> Result<Report, DriverError> {
    if config.concurrency > FD_LIMIT_THRESHOLD {
        sys::raise_fd_limit(2 * config.concurrency as u64);
    }

    let cpus = cpu_assignments(&config);
    let mut workers = Vec::with_capacity(config.threads);
    let mut handles = Vec::with_capacity(config.threads);
    for (id, cpu) in cpus.into_iter().enumerate() {
        let stop = Arc::new(AtomicBool::new(false));
        let (worker, waker) = Worker::new(id, Arc::clone(&config), Arc::clone(&stop), cpu)?;
        handles.push((stop, waker));
        workers.push(worker);
    }

    let shutdown = Arc::new(Shutdown::new(handles));
    let workers: Vec<Worker> = workers
        .into_iter()
        .map(|w| w.with_shutdown(Arc::clone(&shutdown)))
        .collect();

    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            tracing::info!("received SIGINT, stopping");
            shutdown.trigger();
        })?;
    }

    let start = Instant::now();

    let mut iter = workers.into_iter();
    let inline_worker = iter.next().expect("at least one worker thread is always created");

    let join_handles: Vec<_> = iter
        .enumerate()
        .map(|(i, worker)| {
            std::thread::Builder::new()
                .name(format!("aggressor-worker-{}", i + 1))
                .spawn(move || worker.run())
                .expect("failed to spawn worker thread")
        })
        .collect();

    let mut all_stats = vec![inline_worker.run()];
    for handle in join_handles {
        match handle.join() {
            Ok(stats) => all_stats.push(stats),
            Err(_) => tracing::error!("a worker thread panicked"),
        }
    }

    let elapsed = start.elapsed();
    Ok(Report::aggregate(&all_stats, elapsed))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cpu_assignments_is_none_without_affinity() {
        let config = test_config(0, 3);
        assert_eq!(vec![None, None, None], cpu_assignments(&config));
    }

    #[test]
    fn cpu_assignments_uses_highest_cpu_first() {
        let config = test_config(0b1011, 2);
        assert_eq!(vec![Some(3), Some(1)], cpu_assignments(&config));
    }

    fn test_config(affinity_mask: u32, threads: usize) -> Config {
        Config {
            addr: "127.0.0.1:0".parse().unwrap(),
            concurrency: threads,
            threads,
            keepalive: 64,
            rbuf_size: 4096,
            events_capacity: 8,
            affinity_mask,
            debug: false,
            requests: vec![b"GET / HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n".to_vec()],
            remaining_requests: std::sync::atomic::AtomicI64::new(0),
        }
    }
}
