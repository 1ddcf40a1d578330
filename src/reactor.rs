// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Single-threaded cooperative reactor (§4.1, §5).
//!
//! Grounded on the teacher's mio poll loop
//! (`core::discovery::multicast::listener::MulticastListener::run_loop`),
//! generalized from "one socket, one dedicated thread" to "every socket
//! and timer a worker owns, multiplexed on one `mio::Poll` with no thread
//! at all" — the defining constraint of §5 ("single-threaded cooperative
//! within each worker... requires no locks").
//!
//! Timers are a min-heap ordered by deadline; the poll wait is capped by
//! the earliest one so a timer never fires late by more than one spurious
//! wakeup's worth of scheduling slack.

use mio::{Events, Poll, Token};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io;
use std::time::{Duration, Instant};

/// What a fired timer means to the worker driving this reactor (§4.1:
/// "multicast rejoin, FCC response timeout, RTSP keepalive, bandwidth
/// sample tick, send-batch flush").
#[derive(Debug, Clone)]
pub enum TimerKind {
    MulticastRejoin { ingress_token: Token },
    FccResponseTimeout { client_id: u64 },
    RtspKeepalive { client_id: u64 },
    RtspResponseTimeout { client_id: u64 },
    BandwidthSampleTick,
    SendBatchFlush { client_id: u64 },
    ControlStatusPush,
}

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    kind: TimerKind,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; we want the earliest deadline first.
        (Reverse(self.deadline), Reverse(self.seq)).cmp(&(Reverse(other.deadline), Reverse(other.seq)))
    }
}

/// Min-heap of pending timers, ordered earliest-first.
pub struct TimerWheel {
    heap: BinaryHeap<TimerEntry>,
    next_seq: u64,
}

impl TimerWheel {
    pub fn new() -> Self {
        TimerWheel {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    pub fn schedule(&mut self, after: Duration, kind: TimerKind) {
        self.schedule_at(Instant::now() + after, kind);
    }

    pub fn schedule_at(&mut self, deadline: Instant, kind: TimerKind) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(TimerEntry { deadline, seq, kind });
    }

    /// Duration until the earliest timer, or `None` if no timers are
    /// pending (the poll wait should then block indefinitely, capped only
    /// by readiness events).
    pub fn next_wait(&self, now: Instant) -> Option<Duration> {
        self.heap
            .peek()
            .map(|e| e.deadline.saturating_duration_since(now))
    }

    /// Pop every timer whose deadline has passed.
    pub fn drain_expired(&mut self, now: Instant) -> Vec<TimerKind> {
        let mut fired = Vec::new();
        while let Some(entry) = self.heap.peek() {
            if entry.deadline > now {
                break;
            }
            fired.push(self.heap.pop().unwrap().kind);
        }
        fired
    }
}

impl Default for TimerWheel {
    fn default() -> Self {
        Self::new()
    }
}

/// Identifies what a registered `mio` token refers to, so the dispatch loop
/// can route a readiness event to the right handler without storing a raw
/// pointer in the event's `data` field (§9: "re-expressed as a tagged
/// variant over handler identities").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    HttpListener,
    HttpClient { client_id: u64 },
    MulticastIngress { service_index: usize },
    UnicastIngress { client_id: u64 },
    RtspControl { client_id: u64 },
    HttpProxyUpstream { client_id: u64 },
    ControlSocket,
}

/// Owns the `mio::Poll` instance and the token-to-source map. Registration
/// and deregistration are cooperative: a client removal must unregister its
/// tokens in the same tick it is torn down (§4.1).
pub struct Reactor {
    poll: Poll,
    events: Events,
    next_token: usize,
}

impl Reactor {
    pub fn new(event_capacity: usize) -> io::Result<Self> {
        Ok(Reactor {
            poll: Poll::new()?,
            events: Events::with_capacity(event_capacity),
            next_token: 0,
        })
    }

    pub fn allocate_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    pub fn registry(&self) -> &mio::Registry {
        self.poll.registry()
    }

    /// Block until at least one event is ready or `timeout` elapses
    /// (capped by the timer wheel's earliest deadline per §4.1), then hand
    /// back an iterator of ready tokens in poller order.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<(Token, bool, bool)>> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(e) => return Err(e),
        }
        Ok(self
            .events
            .iter()
            .map(|e| (e.token(), e.is_readable(), e.is_writable()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timers_drain_in_deadline_order() {
        let mut wheel = TimerWheel::new();
        let base = Instant::now();
        wheel.schedule_at(base + Duration::from_millis(30), TimerKind::BandwidthSampleTick);
        wheel.schedule_at(
            base + Duration::from_millis(10),
            TimerKind::FccResponseTimeout { client_id: 1 },
        );
        wheel.schedule_at(
            base + Duration::from_millis(20),
            TimerKind::RtspKeepalive { client_id: 2 },
        );

        let fired = wheel.drain_expired(base + Duration::from_millis(25));
        assert_eq!(fired.len(), 2);
        assert!(matches!(fired[0], TimerKind::FccResponseTimeout { client_id: 1 }));
        assert!(matches!(fired[1], TimerKind::RtspKeepalive { client_id: 2 }));
    }

    #[test]
    fn next_wait_reflects_earliest_pending_timer() {
        let mut wheel = TimerWheel::new();
        let base = Instant::now();
        assert!(wheel.next_wait(base).is_none());
        wheel.schedule_at(base + Duration::from_millis(80), TimerKind::BandwidthSampleTick);
        let wait = wheel.next_wait(base).unwrap();
        assert!(wait <= Duration::from_millis(80));
    }

    #[test]
    fn token_allocation_is_monotonic_and_unique() {
        let mut reactor = Reactor::new(16).unwrap();
        let a = reactor.allocate_token();
        let b = reactor.allocate_token();
        assert_ne!(a, b);
    }
}
