// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Cross-module FCC hand-off: drives the state machine through an unicast
//! burst into a multicast join using out-of-order multicast arrivals, the
//! way a real reactor would see them off the wire (§8 scenario 1, exercised
//! here end to end through the reorder merger rather than in isolation).

use rtp2httpd::fcc::{FccAction, FccEngine, FccState, FccType};
use std::net::{Ipv4Addr, SocketAddrV4};

fn rtp_packet(seq: u16) -> Vec<u8> {
    let mut p = vec![0x80, 33];
    p.extend_from_slice(&seq.to_be_bytes());
    p.extend_from_slice(&[0u8; 4]);
    p.extend_from_slice(&[0u8; 4]);
    p.extend_from_slice(b"payload");
    p
}

#[test]
fn unicast_burst_hands_off_to_multicast_despite_reordered_arrivals() {
    let target = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 15970);
    let group = SocketAddrV4::new(Ipv4Addr::new(239, 253, 64, 120), 5140);
    let mut engine = FccEngine::new(target, group, FccType::Telecom);

    assert!(matches!(engine.start(), FccAction::SendJoin { .. }));
    engine.on_ack().expect("ack while requested");
    assert_eq!(engine.state(), FccState::UnicastPending);

    for seq in 1000..1010 {
        let actions = engine.on_unicast_packet(&rtp_packet(seq));
        assert!(actions.iter().any(|a| matches!(a, FccAction::Forward(_))));
    }
    assert_eq!(engine.state(), FccState::UnicastActive);

    engine.begin_multicast_join().expect("active -> requested");
    assert_eq!(engine.state(), FccState::McastRequested);

    // Multicast packets arrive out of order around the hand-off point; the
    // merger must still emit them in sequence and only flip to McastActive
    // once the gap at seq 1010 is filled.
    let mut forwarded = Vec::new();
    for a in engine.on_multicast_packet(&rtp_packet(1012)) {
        if let FccAction::Forward(p) = a {
            forwarded.push(p);
        }
    }
    assert!(forwarded.is_empty(), "1012 arrives before the gap at 1010 closes");
    assert_eq!(engine.state(), FccState::McastRequested);

    for a in engine.on_multicast_packet(&rtp_packet(1011)) {
        if let FccAction::Forward(p) = a {
            forwarded.push(p);
        }
    }
    assert!(forwarded.is_empty(), "1011 still waits on 1010");

    let mut saw_close = false;
    for a in engine.on_multicast_packet(&rtp_packet(1010)) {
        match a {
            FccAction::CloseUnicastSocket => saw_close = true,
            FccAction::Forward(p) => forwarded.push(p),
            _ => {}
        }
    }
    assert!(saw_close, "filling the gap should close the unicast socket exactly once");
    assert_eq!(engine.state(), FccState::McastActive);
    // All three buffered multicast packets (1010, 1011, 1012) are now
    // released in order.
    assert_eq!(forwarded.len(), 3);

    let actions = engine.terminate();
    assert!(actions.is_empty(), "already fully switched, no leave needed");
}
