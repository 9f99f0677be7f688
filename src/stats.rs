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

//! Per-worker counters and the aggregated final report.

use std::fmt;
use std::time::Duration;

/// Monotonic counters and running latency averages owned by a single worker.
///
/// A worker is the sole writer of its own `Stats`; the driver only reads these after
/// every worker thread has been joined, so no synchronization is needed here.
#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
    /// Bytes successfully written to sockets.
    pub total_sent: u64,
    /// Bytes successfully read from sockets.
    pub total_recv: u64,
    /// Connections that reached a fully-established state.
    pub connections_ok: u64,
    /// Connections that failed to establish (create or connect error).
    pub connections_failed: u64,
    /// Responses whose status code was not 4xx/5xx.
    pub resp_ok: u64,
    /// Responses whose status code was 4xx or 5xx.
    pub resp_err: u64,
    /// Running two-sample average of connect latency, in microseconds.
    pub connect_latency_usec: u64,
    /// Running two-sample average of time-to-first-response-byte, in microseconds.
    pub resp_latency_usec: u64,
}

impl Stats {
    /// Folds `sample` into `avg` using the rule `avg = (avg + sample) / 2`.
    ///
    /// This is a running two-sample average, not an arithmetic mean: recent samples
    /// dominate, and the very first sample sets `avg` to roughly half its own value.
    /// The rule is preserved exactly as the original implementation defines it so that
    /// observed latency numbers match across reimplementations.
    #[inline]
    pub fn update_avg(avg: &mut u64, sample: u64) {
        *avg = (*avg + sample) / 2;
    }

    #[inline]
    fn record_connect_latency(&mut self, usec: u64) {
        Self::update_avg(&mut self.connect_latency_usec, usec);
    }

    #[inline]
    fn record_resp_latency(&mut self, usec: u64) {
        Self::update_avg(&mut self.resp_latency_usec, usec);
    }
}

/// Connect-latency and response-latency recording, split out so [`crate::slot::Slot`]
/// doesn't need to reach into private fields.
pub trait RecordLatency {
    /// Records a sample of connect latency.
    fn on_connect(&mut self, usec: u64);
    /// Records a sample of time-to-first-response-byte.
    fn on_response(&mut self, usec: u64);
}

impl RecordLatency for Stats {
    fn on_connect(&mut self, usec: u64) {
        self.record_connect_latency(usec);
    }

    fn on_response(&mut self, usec: u64) {
        self.record_resp_latency(usec);
    }
}

/// The aggregated, run-final report: the sum of every worker's [`Stats`], plus the
/// wall-clock elapsed time of the run.
#[derive(Debug, Default, Clone, Copy)]
pub struct Report {
    /// Sum of all workers' counters.
    pub stats: Stats,
    /// Wall-clock time from driver startup to shutdown.
    pub elapsed: Duration,
    /// Number of workers the two latency averages were divided across.
    pub worker_count: u64,
}

impl Report {
    /// Sums `per_worker`'s counters and divides the latency averages across them,
    /// matching the original's `stats()` aggregation: a plain sum for every counter,
    /// a plain sum-then-divide for the two latency averages.
    pub fn aggregate(per_worker: &[Stats], elapsed: Duration) -> Self {
        let mut stats = Stats::default();
        for w in per_worker {
            stats.total_sent += w.total_sent;
            stats.total_recv += w.total_recv;
            stats.connections_ok += w.connections_ok;
            stats.connections_failed += w.connections_failed;
            stats.resp_ok += w.resp_ok;
            stats.resp_err += w.resp_err;
            stats.connect_latency_usec += w.connect_latency_usec;
            stats.resp_latency_usec += w.resp_latency_usec;
        }
        let worker_count = per_worker.len().max(1) as u64;
        stats.connect_latency_usec /= worker_count;
        stats.resp_latency_usec /= worker_count;

        Report { stats, elapsed, worker_count }
    }

    fn elapsed_ms(&self) -> u64 {
        self.elapsed.as_millis() as u64
    }

    fn responses_per_sec(&self) -> u64 {
        let ms = self.elapsed_ms();
        if ms == 0 {
            return 0;
        }
        (self.stats.resp_ok + self.stats.resp_err) * 1000 / ms
    }

    fn bps(&self, bytes: u64) -> u64 {
        let ms = self.elapsed_ms();
        if ms == 0 {
            return 0;
        }
        bytes * 8 * 1000 / ms
    }
}

impl fmt::Display for Report {
    /// Prints the twelve-line final report consumed by the process's stdout.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "elapsed:                {} msec", self.elapsed_ms())?;
        writeln!(f, "successful connections:  {}", self.stats.connections_ok)?;
        writeln!(f, "failed connections:      {}", self.stats.connections_failed)?;
        writeln!(f, "successful responses:    {}", self.stats.resp_ok)?;
        writeln!(f, "failed responses:        {}", self.stats.resp_err)?;
        writeln!(f, "responses/sec:           {}", self.responses_per_sec())?;
        writeln!(f, "total bytes sent:        {}", self.stats.total_sent)?;
        writeln!(f, "total bytes received:    {}", self.stats.total_recv)?;
        writeln!(f, "send bps:                {}", self.bps(self.stats.total_sent))?;
        writeln!(f, "receive bps:             {}", self.bps(self.stats.total_recv))?;
        writeln!(f, "connect latency:         {} usec", self.stats.connect_latency_usec)?;
        writeln!(f, "response latency:        {} usec", self.stats.resp_latency_usec)?;
        Ok(())
    }
}
