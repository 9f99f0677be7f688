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

//! Platform glue that has no home in the reactor: fd-limit raising and CPU pinning.

/// Raises the process's soft and hard `RLIMIT_NOFILE` to `limit`, best-effort.
///
/// A failure here is not fatal to the run: it only means the configured
/// concurrency may exceed what the process can actually open sockets for, which
/// will surface later as ordinary connection-create failures.
pub fn raise_fd_limit(limit: u64) {
    let rlim = libc::rlimit {
        rlim_cur: limit,
        rlim_max: limit,
    };
    // SAFETY: `rlim` is a valid, fully-initialized `rlimit` for the duration of the call.
    let rc = unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &rlim) };
    if rc != 0 {
        tracing::debug!(
            limit,
            error = %std::io::Error::last_os_error(),
            "failed to raise RLIMIT_NOFILE"
        );
    }
}

/// Pins the calling thread to a single CPU core, best-effort.
///
/// On non-Linux targets this is a no-op; the original design treats pinning as an
/// optimization workers can run correctly without.
pub fn pin_current_thread(cpu: usize) {
    #[cfg(target_os = "linux")]
    {
        // SAFETY: `set` is zeroed then only ever mutated through the provided macros,
        // and is passed by pointer with its own exact size.
        unsafe {
            let mut set: libc::cpu_set_t = std::mem::zeroed();
            libc::CPU_ZERO(&mut set);
            libc::CPU_SET(cpu, &mut set);
            let rc = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
            if rc != 0 {
                tracing::debug!(
                    cpu,
                    error = %std::io::Error::last_os_error(),
                    "failed to pin worker thread to CPU"
                );
            }
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        tracing::debug!(cpu, "CPU affinity is not supported on this platform");
    }
}

/// Returns the CPU indices set in `mask`, highest bit first — the order the driver
/// assigns affinity to workers in, so the lowest-indexed worker gets the
/// highest-numbered CPU.
pub fn cpu_indices_high_to_low(mut mask: u32) -> Vec<usize> {
    let mut cpus = Vec::new();
    while mask != 0 {
        let bit = 31 - mask.leading_zeros();
        cpus.push(bit as usize);
        mask &= !(1 << bit);
    }
    cpus
}
