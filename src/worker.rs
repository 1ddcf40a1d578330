// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-process worker runtime state (§3 `Worker`).
//!
//! Ties together the reactor, buffer pool, and client map behind a single
//! struct that owns exactly one OS thread's worth of state, per §5. The
//! HTTP accept loop, ingress dispatch, and timer handling live here rather
//! than in `main.rs` so `main.rs` stays a thin CLI/startup shim, mirroring
//! how the teacher's binaries (`tools/hdds-latency-probe/src/main.rs`)
//! keep `main()` to argument parsing plus a call into library code.

use crate::buffer::BufferPool;
use crate::client::{Client, ClientId};
use crate::config::GlobalConfig;
use crate::reactor::{Reactor, TimerWheel};
use std::collections::HashMap;

/// Per-worker counters surfaced to the (out-of-scope) status endpoint
/// (§3: "total bytes sent, total send completions, EAGAIN and ENOBUFS
/// counts, batch-send counts, timeout-flush counts").
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerCounters {
    pub total_bytes_sent: u64,
    pub send_completions: u64,
    pub eagain: u64,
    pub enobufs: u64,
    pub batches: u64,
    pub timeout_flushes: u64,
}

/// Everything owned by exactly one worker process (§3, §5: "touched by
/// exactly one OS thread and requires no locks").
pub struct Worker {
    pub pid: u32,
    pub reactor: Reactor,
    pub timers: TimerWheel,
    pub buffer_pool: BufferPool,
    pub clients: HashMap<ClientId, Client>,
    pub next_client_id: ClientId,
    pub counters: WorkerCounters,
    pub log_level: crate::logging::Verbosity,
}

impl Worker {
    pub fn new(config: &GlobalConfig) -> std::io::Result<Self> {
        Ok(Worker {
            pid: std::process::id(),
            reactor: Reactor::new(1024)?,
            timers: TimerWheel::new(),
            buffer_pool: BufferPool::new(config.buffer_pool_initial_size, config.buffer_pool_max_size),
            clients: HashMap::new(),
            next_client_id: 0,
            counters: WorkerCounters::default(),
            log_level: crate::logging::Verbosity(config.verbosity),
        })
    }

    pub fn allocate_client_id(&mut self) -> ClientId {
        let id = self.next_client_id;
        self.next_client_id += 1;
        id
    }

    /// Remove a client, cooperatively tearing it down in one step: drain
    /// its egress queue, then drop the record (its sockets are closed and
    /// its mio registrations lapse with it) — §4.1's "same reactor tick"
    /// cancellation guarantee.
    pub fn remove_client(&mut self, id: ClientId) {
        if let Some(mut client) = self.clients.remove(&id) {
            client.tombstone();
            log::debug!("client {id} removed, {} bytes sent", client.bytes_sent);
        }
    }

    /// Apply the supervisor's "set log level" command (§6.4, §7).
    pub fn set_log_level(&mut self, verbosity: crate::logging::Verbosity) {
        self.log_level = verbosity;
        crate::logging::set_level(verbosity);
    }

    /// Run once per bandwidth-sample tick (§4.1, ~1s): roll every client's
    /// bandwidth EWMA forward, identify clients under sustained egress
    /// saturation, and opportunistically shrink the buffer pool. Returns the
    /// clients that must be torn down; unlike a plain `remove_client` this
    /// leaves full clean-up (FCC leave, RTSP teardown, multicast unsubscribe,
    /// socket deregistration) to the caller, which has the socket maps this
    /// function does not.
    pub fn on_bandwidth_tick(&mut self) -> Vec<ClientId> {
        let now = std::time::Instant::now();
        let mut to_remove = Vec::new();
        for (id, client) in self.clients.iter_mut() {
            client.bandwidth.tick(now);
            if client.egress.tick() {
                to_remove.push(*id);
            }
        }
        self.buffer_pool.tick();
        to_remove
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_client_id_is_monotonic() {
        let config = GlobalConfig::default();
        let mut worker = Worker::new(&config).unwrap();
        let a = worker.allocate_client_id();
        let b = worker.allocate_client_id();
        assert_eq!(b, a + 1);
    }

    #[test]
    fn bandwidth_tick_shrinks_pool_when_idle_and_removes_no_clients() {
        let config = GlobalConfig::default();
        let mut worker = Worker::new(&config).unwrap();
        worker.on_bandwidth_tick();
        assert!(worker.clients.is_empty());
    }
}
