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

#![deny(missing_debug_implementations, rust_2018_idioms, unused_imports)]

//! `aggressor` is an HTTP/1 load generator: it opens a fixed pool of non-blocking
//! TCP connections, pipelines keep-alive requests across them as fast as each server
//! accepts them, and reports aggregate throughput and latency once the run ends.
//!
//! The library is organized the way the request flows through it:
//!
//! - [`cli`] and [`config`] turn command-line arguments into an immutable [`config::Config`].
//! - [`httpparse`] tokenizes HTTP/1 response lines and headers.
//! - [`slot`] is the per-connection state machine that drives one socket through
//!   connect, send, and receive phases.
//! - [`worker`] runs a population of slots on one reactor, one thread per worker.
//! - [`driver`] spawns the workers, waits for shutdown, and aggregates [`stats::Stats`].

pub mod cli;
pub mod config;
pub mod driver;
pub mod httpparse;
pub mod slot;
pub mod stats;
pub mod sys;
pub mod worker;
