// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-HTTP-connection client record (§3 `Client`).

use crate::egress::{EgressQueue, ZeroCopySender};
use crate::fcc::FccEngine;
use crate::rtsp::RtspEngine;
use crate::service::Service;
use crate::snapshot::SnapshotCapture;
use std::net::SocketAddr;
use std::time::Instant;

pub type ClientId = u64;

/// Which protocol engine, if any, is driving this client's upstream.
pub enum Engine {
    None,
    Fcc(FccEngine),
    Rtsp(RtspEngine),
}

/// Rolling bandwidth estimate over a 1 s window (§3: "instantaneous
/// bandwidth (EWMA over a 1 s window)").
pub struct BandwidthEstimator {
    alpha: f64,
    bits_per_second: f64,
    window_bytes: u64,
    window_started: Instant,
}

impl BandwidthEstimator {
    pub fn new() -> Self {
        BandwidthEstimator {
            alpha: 0.3,
            bits_per_second: 0.0,
            window_bytes: 0,
            window_started: Instant::now(),
        }
    }

    pub fn record_bytes(&mut self, bytes: u64) {
        self.window_bytes += bytes;
    }

    /// Roll the 1 s window forward, producing a fresh EWMA sample. Called
    /// from the bandwidth-sample-tick timer (§4.1).
    pub fn tick(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.window_started).as_secs_f64();
        if elapsed <= 0.0 {
            return;
        }
        let sample = (self.window_bytes as f64 * 8.0) / elapsed;
        self.bits_per_second = self.alpha * sample + (1.0 - self.alpha) * self.bits_per_second;
        self.window_bytes = 0;
        self.window_started = now;
    }

    pub fn bits_per_second(&self) -> f64 {
        self.bits_per_second
    }
}

impl Default for BandwidthEstimator {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Client {
    pub id: ClientId,
    pub worker_pid: u32,
    pub remote_addr: SocketAddr,
    pub service: Service,
    pub engine: Engine,
    pub egress: EgressQueue,
    pub sender: ZeroCopySender,
    pub bandwidth: BandwidthEstimator,
    pub bytes_sent: u64,
    pub dropped_bytes: u64,
    pub backpressure_events: u64,
    pub slow: bool,
    pub tombstoned: bool,
    /// Set once this client's entire response is queued and no further
    /// data will ever be enqueued (a completed snapshot capture, §4.6): the
    /// reactor tears it down as soon as the egress queue fully drains.
    pub done: bool,
    /// Present while this client is buffering media toward a single JPEG
    /// snapshot (§4.6, §6.1 `snapshot=1`) instead of being forwarded frame
    /// by frame; taken and replaced with `done` once the capture window
    /// fills.
    pub snapshot: Option<SnapshotCapture>,
}

impl Client {
    pub fn new(
        id: ClientId,
        worker_pid: u32,
        remote_addr: SocketAddr,
        service: Service,
        engine: Engine,
        queue_limit_bytes: usize,
    ) -> Self {
        Client {
            id,
            worker_pid,
            remote_addr,
            service,
            engine,
            egress: EgressQueue::new(queue_limit_bytes),
            sender: ZeroCopySender::default(),
            bandwidth: BandwidthEstimator::new(),
            bytes_sent: 0,
            dropped_bytes: 0,
            backpressure_events: 0,
            slow: false,
            tombstoned: false,
            done: false,
            snapshot: None,
        }
    }

    /// Mark this client for removal; the reactor tombstones, cancels
    /// timers, drains the egress queue, and unregisters descriptors in the
    /// same tick (§4.1).
    pub fn tombstone(&mut self) {
        self.tombstoned = true;
        self.egress.drain();
    }

    /// Copy `bytes` into a fresh pool slot and enqueue it for send. Used
    /// for payloads an engine has already copied out of their original
    /// datagram (the FCC reorder window, a unicast burst with no other
    /// subscriber to share the buffer with) — unlike the plain multicast
    /// fan-out path, there is exactly one consumer here, so paying one
    /// copy to get back into the shared-buffer egress path is cheaper than
    /// plumbing a second, buffer-less send path through `EgressQueue`.
    pub fn enqueue_bytes(&mut self, pool: &crate::buffer::BufferPool, bytes: &[u8]) -> bool {
        match pool.acquire(bytes) {
            Some(buf) => {
                let len = buf.len();
                self.egress.enqueue(buf, 0, len)
            }
            None => {
                self.dropped_bytes += bytes.len() as u64;
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::time::Duration;

    fn dummy_client(id: ClientId) -> Client {
        Client::new(
            id,
            1234,
            SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 2), 9000)),
            Service::from_udp_path(Ipv4Addr::new(239, 1, 1, 1), 5000),
            Engine::None,
            1 << 20,
        )
    }

    #[test]
    fn tombstone_drains_queue() {
        let mut client = dummy_client(1);
        let pool = crate::buffer::BufferPool::new(4, 4);
        let buf = pool.acquire(&[1, 2, 3]).unwrap();
        client.egress.enqueue(buf, 0, 3);
        assert!(client.egress.queue_bytes() > 0);
        client.tombstone();
        assert!(client.tombstoned);
        assert_eq!(client.egress.queue_bytes(), 0);
    }

    #[test]
    fn bandwidth_estimator_converges_toward_steady_rate() {
        let mut bw = BandwidthEstimator::new();
        let mut now = Instant::now();
        for _ in 0..20 {
            bw.record_bytes(125_000); // 1 Mbit/s over 1s
            now += Duration::from_secs(1);
            bw.tick(now);
        }
        let rate = bw.bits_per_second();
        assert!((rate - 1_000_000.0).abs() < 50_000.0, "rate={rate}");
    }
}
