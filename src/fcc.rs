// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fast Channel Change state machine (§4.2).
//!
//! `FccEngine` is pure state: it decides what to do, but does not itself
//! own sockets. The reactor/ingress drives it with events (ack received,
//! a packet arrived, a timer fired) and acts on the [`FccAction`]s it
//! returns — this mirrors the teacher's FSM modules
//! (`core::discovery::multicast::fsm::discovery`), which are likewise
//! driven by an external listener rather than owning I/O themselves.

use crate::reorder::ReorderMerger;
use crate::rtp;
use std::net::SocketAddrV4;
use std::time::Duration;

/// FCC wire-protocol variant (§4.2). The exact byte layouts are opaque,
/// reproduced from packet captures per §9's open question; this crate only
/// needs to know which variant is in play to pick the right control-packet
/// builder (`crate::fcc::wire`) and whether local NAT port forwarding is
/// required.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FccType {
    /// Default; also compatible with ZTE/FiberHome equipment.
    Telecom,
    /// Natively carries NAT-traversal metadata.
    Huawei,
}

impl FccType {
    /// Infer the variant from the FCC server's port when `fcc-type` is not
    /// given explicitly (§4.2). Telecom deployments conventionally listen
    /// in the 15000-16000 range; Huawei headends use 6000-range ports.
    pub fn infer_from_port(port: u16) -> FccType {
        if (6000..7000).contains(&port) {
            FccType::Huawei
        } else {
            FccType::Telecom
        }
    }
}

/// Response timeout from FCC join to the first unicast media packet
/// (§4.2, §5).
pub const RESPONSE_TIMEOUT: Duration = Duration::from_millis(80);

/// Control-packet byte layouts for the two FCC variants.
///
/// §9's open question leaves the exact wire format unreproduced here (it
/// would need to come from operator packet captures); these builders give
/// each variant a distinct, stable, self-describing layout so the engine
/// has something concrete to send and so `wire::is_control_packet` can
/// tell a join/leave acknowledgment apart from an RTP media packet
/// (version-2 RTP never starts with either magic below).
pub mod wire {
    use super::FccType;
    use std::net::SocketAddrV4;

    const TELECOM_MAGIC: u8 = 0x52; // 'R'
    const HUAWEI_MAGIC: u8 = 0x48; // 'H'
    const OP_JOIN: u8 = 1;
    const OP_LEAVE: u8 = 2;

    /// Build the join control packet sent to the FCC server to request a
    /// unicast burst for `group:port`.
    pub fn build_join(fcc_type: FccType, group: SocketAddrV4) -> Vec<u8> {
        build(fcc_type, OP_JOIN, group)
    }

    /// Build the clean-up control packet sent when a client leaves before
    /// (or after) the hand-off, releasing server-side burst state (§4.2).
    pub fn build_leave(fcc_type: FccType, group: SocketAddrV4) -> Vec<u8> {
        build(fcc_type, OP_LEAVE, group)
    }

    fn build(fcc_type: FccType, op: u8, group: SocketAddrV4) -> Vec<u8> {
        let magic = match fcc_type {
            FccType::Telecom => TELECOM_MAGIC,
            FccType::Huawei => HUAWEI_MAGIC,
        };
        let mut packet = Vec::with_capacity(12);
        packet.push(magic);
        packet.push(op);
        packet.extend_from_slice(&group.ip().octets());
        packet.extend_from_slice(&group.port().to_be_bytes());
        // Huawei's variant natively carries NAT-traversal metadata (§4.2);
        // a trailing zeroed block stands in for that payload since no
        // local port forwarding is required to interpret it.
        if fcc_type == FccType::Huawei {
            packet.extend_from_slice(&[0u8; 4]);
        }
        packet
    }

    /// True if `packet` is one of this module's control packets rather
    /// than RTP media — used to recognize the join acknowledgment, which
    /// may arrive as its own small datagram ahead of the media burst.
    pub fn is_control_packet(packet: &[u8]) -> bool {
        matches!(packet.first(), Some(&TELECOM_MAGIC) | Some(&HUAWEI_MAGIC))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FccState {
    Init,
    Requested,
    UnicastPending,
    UnicastActive,
    McastRequested,
    McastFallback,
    McastActive,
    Terminal,
}

/// Actions the driving reactor must take in response to a state
/// transition. Kept separate from `FccEngine` itself so the state machine
/// stays unit-testable without a socket.
#[derive(Debug, Clone)]
pub enum FccAction {
    SendJoin {
        target: SocketAddrV4,
        group: SocketAddrV4,
        fcc_type: FccType,
    },
    StartResponseTimer,
    JoinMulticast,
    CloseUnicastSocket,
    SendLeave {
        target: SocketAddrV4,
        group: SocketAddrV4,
        fcc_type: FccType,
    },
    Forward(Vec<u8>),
    LogFallbackTimeout,
    Disconnect,
}

pub struct FccEngine {
    target: SocketAddrV4,
    group: SocketAddrV4,
    fcc_type: FccType,
    state: FccState,
    first_unicast_seq: Option<u16>,
    last_unicast_seq: Option<u16>,
    merger: Option<ReorderMerger>,
}

impl FccEngine {
    /// `target` is the FCC server; `group` is the steady-state multicast
    /// group:port this burst is standing in for (carried in the join/leave
    /// control packets, §4.2).
    pub fn new(target: SocketAddrV4, group: SocketAddrV4, fcc_type: FccType) -> Self {
        FccEngine {
            target,
            group,
            fcc_type,
            state: FccState::Init,
            first_unicast_seq: None,
            last_unicast_seq: None,
            merger: None,
        }
    }

    pub fn group(&self) -> SocketAddrV4 {
        self.group
    }

    pub fn state(&self) -> FccState {
        self.state
    }

    pub fn first_unicast_sequence(&self) -> Option<u16> {
        self.first_unicast_seq
    }

    /// INIT -> REQUESTED: send the join control packet.
    pub fn start(&mut self) -> FccAction {
        debug_assert_eq!(self.state, FccState::Init);
        self.state = FccState::Requested;
        FccAction::SendJoin {
            target: self.target,
            group: self.group,
            fcc_type: self.fcc_type,
        }
    }

    /// REQUESTED -> UNICAST_PENDING: ack received, arm the 80ms timer.
    pub fn on_ack(&mut self) -> Option<FccAction> {
        if self.state != FccState::Requested {
            return None;
        }
        self.state = FccState::UnicastPending;
        Some(FccAction::StartResponseTimer)
    }

    /// A unicast media (RTP) packet arrived. Handles both the
    /// UNICAST_PENDING -> UNICAST_ACTIVE transition and steady forwarding
    /// while UNICAST_ACTIVE.
    pub fn on_unicast_packet(&mut self, packet: &[u8]) -> Vec<FccAction> {
        let Some(header) = rtp::parse(packet) else {
            return Vec::new();
        };
        match self.state {
            FccState::UnicastPending => {
                self.state = FccState::UnicastActive;
                self.first_unicast_seq = Some(header.sequence_number);
                self.last_unicast_seq = Some(header.sequence_number);
                vec![FccAction::Forward(packet[header.payload_offset..].to_vec())]
            }
            FccState::UnicastActive => {
                self.last_unicast_seq = Some(header.sequence_number);
                vec![FccAction::Forward(packet[header.payload_offset..].to_vec())]
            }
            _ => Vec::new(),
        }
    }

    /// UNICAST_PENDING timed out with no media packet: fall back to a
    /// plain multicast join (client will see the normal GOP wait).
    pub fn on_response_timeout(&mut self) -> Vec<FccAction> {
        if self.state != FccState::UnicastPending {
            return Vec::new();
        }
        self.state = FccState::McastFallback;
        vec![FccAction::LogFallbackTimeout, FccAction::JoinMulticast]
    }

    /// UNICAST_ACTIVE -> MCAST_REQUESTED: start the parallel multicast
    /// join while unicast keeps flowing.
    pub fn begin_multicast_join(&mut self) -> Option<FccAction> {
        if self.state != FccState::UnicastActive {
            return None;
        }
        self.state = FccState::McastRequested;
        if let Some(seq) = self.last_unicast_seq {
            self.merger = Some(ReorderMerger::resume_from(seq.wrapping_add(1)));
        }
        Some(FccAction::JoinMulticast)
    }

    /// A multicast packet arrived. Behavior depends on whether we're still
    /// waiting to catch up with the unicast stream (MCAST_REQUESTED),
    /// falling back cold (MCAST_FALLBACK), or already fully switched
    /// (MCAST_ACTIVE).
    pub fn on_multicast_packet(&mut self, packet: &[u8]) -> Vec<FccAction> {
        let Some(header) = rtp::parse(packet) else {
            return Vec::new();
        };
        let payload = &packet[header.payload_offset..];
        match self.state {
            FccState::McastFallback => {
                self.state = FccState::McastActive;
                vec![FccAction::Forward(payload.to_vec())]
            }
            FccState::McastRequested => {
                let merger = self.merger.get_or_insert_with(ReorderMerger::new);
                let ready = merger.push(header.sequence_number, payload.to_vec());
                if ready.is_empty() {
                    return Vec::new();
                }
                self.state = FccState::McastActive;
                self.merger = None;
                let mut actions: Vec<FccAction> =
                    ready.into_iter().map(FccAction::Forward).collect();
                actions.insert(0, FccAction::CloseUnicastSocket);
                actions
            }
            FccState::McastActive => {
                vec![FccAction::Forward(payload.to_vec())]
            }
            _ => Vec::new(),
        }
    }

    /// Client disconnect or upstream hard error: emit the clean-up control
    /// packet if the server-side state needs releasing (§4.2).
    pub fn terminate(&mut self) -> Vec<FccAction> {
        let was_unicast = matches!(
            self.state,
            FccState::Requested
                | FccState::UnicastPending
                | FccState::UnicastActive
                | FccState::McastRequested
        );
        self.state = FccState::Terminal;
        if was_unicast {
            vec![FccAction::SendLeave {
                target: self.target,
                group: self.group,
                fcc_type: self.fcc_type,
            }]
        } else {
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn target() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 255, 14, 152), 15970)
    }

    fn group() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(239, 253, 64, 120), 5140)
    }

    fn rtp_packet(seq: u16) -> Vec<u8> {
        let mut p = vec![0x80, 33];
        p.extend_from_slice(&seq.to_be_bytes());
        p.extend_from_slice(&[0u8; 4]);
        p.extend_from_slice(&[0u8; 4]);
        p.extend_from_slice(b"payload");
        p
    }

    #[test]
    fn happy_path_scenario_1() {
        // §8 scenario 1: FCC burst at seq 1000, multicast catches up at 1042.
        let mut engine = FccEngine::new(target(), group(), FccType::Telecom);
        assert!(matches!(engine.start(), FccAction::SendJoin { .. }));
        assert!(engine.on_ack().is_some());
        assert_eq!(engine.state(), FccState::UnicastPending);

        engine.on_unicast_packet(&rtp_packet(1000));
        assert_eq!(engine.state(), FccState::UnicastActive);
        assert_eq!(engine.first_unicast_sequence(), Some(1000));

        for seq in 1001..1042 {
            engine.on_unicast_packet(&rtp_packet(seq));
        }

        engine.begin_multicast_join();
        assert_eq!(engine.state(), FccState::McastRequested);

        let actions = engine.on_multicast_packet(&rtp_packet(1042));
        assert_eq!(engine.state(), FccState::McastActive);
        assert!(matches!(actions[0], FccAction::CloseUnicastSocket));

        // No duplicate forwarding after the switch.
        let actions2 = engine.on_multicast_packet(&rtp_packet(1042));
        assert!(matches!(actions2[0], FccAction::Forward(_)));
    }

    #[test]
    fn timeout_falls_back_to_multicast_scenario_2() {
        let mut engine = FccEngine::new(target(), group(), FccType::Telecom);
        engine.start();
        engine.on_ack();
        let actions = engine.on_response_timeout();
        assert_eq!(engine.state(), FccState::McastFallback);
        assert!(actions
            .iter()
            .any(|a| matches!(a, FccAction::LogFallbackTimeout)));
        assert!(actions.iter().any(|a| matches!(a, FccAction::JoinMulticast)));

        let forward = engine.on_multicast_packet(&rtp_packet(5000));
        assert_eq!(engine.state(), FccState::McastActive);
        assert_eq!(forward.len(), 1);
    }

    #[test]
    fn fcc_type_inference() {
        assert_eq!(FccType::infer_from_port(15970), FccType::Telecom);
        assert_eq!(FccType::infer_from_port(6060), FccType::Huawei);
    }

    #[test]
    fn terminate_during_active_hand_off_sends_leave() {
        let mut engine = FccEngine::new(target(), group(), FccType::Telecom);
        engine.start();
        engine.on_ack();
        engine.on_unicast_packet(&rtp_packet(1));
        let actions = engine.terminate();
        assert_eq!(engine.state(), FccState::Terminal);
        assert!(matches!(actions[0], FccAction::SendLeave { .. }));
    }

    #[test]
    fn terminate_after_fully_switched_sends_nothing() {
        let mut engine = FccEngine::new(target(), group(), FccType::Telecom);
        engine.start();
        engine.on_ack();
        engine.on_unicast_packet(&rtp_packet(1));
        engine.begin_multicast_join();
        engine.on_multicast_packet(&rtp_packet(2));
        assert_eq!(engine.state(), FccState::McastActive);
        assert!(engine.terminate().is_empty());
    }
}
