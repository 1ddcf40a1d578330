// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Upstream service specifications (§3 `Service`).
//!
//! A `Service` is immutable once built: either named in the config file, or
//! synthesized on the fly from a udpxy-compatible request path when that
//! policy is enabled (`SPEC_FULL.md` §1).

use crate::fcc::FccType;
use std::net::{Ipv4Addr, SocketAddrV4};

/// One upstream this gateway knows how to bridge to HTTP clients.
#[derive(Debug, Clone)]
pub enum Service {
    /// Multicast RTP, optionally with an FCC server for fast channel
    /// change and/or an FEC sibling port.
    MulticastRtp {
        group: Ipv4Addr,
        port: u16,
        fcc: Option<FccTarget>,
        fec_port: Option<u16>,
    },
    /// Raw multicast UDP, no RTP framing (the `/udp/` udpxy alias, §6.1).
    MulticastUdp { group: Ipv4Addr, port: u16 },
    /// RTSP unicast, optionally time-shifted (§4.3).
    Rtsp {
        host: String,
        port: u16,
        path: String,
        seek: Option<RtspSeek>,
    },
    /// An HTTP reverse-proxy target (`/http/<host>[:<port>]/<path>`, §6.1):
    /// relayed verbatim except for M3U bodies, which are rewritten the same
    /// way a local playlist is.
    Http { host: String, port: u16, path: String },
}

#[derive(Debug, Clone, Copy)]
pub struct FccTarget {
    pub addr: SocketAddrV4,
    pub fcc_type: FccType,
}

#[derive(Debug, Clone)]
pub struct RtspSeek {
    pub start: String,
    pub end: Option<String>,
}

impl Service {
    /// Build a `Service` for `/rtp/<mcast>:<port>` with optional
    /// `fcc=host:port`, `fcc-type=telecom|huawei`, and `fec=port` query
    /// parameters (§6.1).
    pub fn from_rtp_path(
        group: Ipv4Addr,
        port: u16,
        fcc_addr: Option<SocketAddrV4>,
        fcc_type: Option<FccType>,
        fec_port: Option<u16>,
    ) -> Service {
        let fcc = fcc_addr.map(|addr| FccTarget {
            addr,
            fcc_type: fcc_type.unwrap_or_else(|| FccType::infer_from_port(addr.port())),
        });
        Service::MulticastRtp {
            group,
            port,
            fcc,
            fec_port,
        }
    }

    pub fn from_udp_path(group: Ipv4Addr, port: u16) -> Service {
        Service::MulticastUdp { group, port }
    }

    pub fn from_rtsp_path(
        host: String,
        port: u16,
        path: String,
        seek: Option<RtspSeek>,
    ) -> Service {
        Service::Rtsp {
            host,
            port,
            path,
            seek,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtp_service_without_fcc_infers_nothing() {
        let svc = Service::from_rtp_path(Ipv4Addr::new(239, 253, 64, 120), 5140, None, None, None);
        match svc {
            Service::MulticastRtp { fcc, .. } => assert!(fcc.is_none()),
            _ => panic!("expected MulticastRtp"),
        }
    }

    #[test]
    fn rtp_service_with_fcc_infers_type_from_port() {
        let addr = SocketAddrV4::new(Ipv4Addr::new(10, 255, 14, 152), 15970);
        let svc = Service::from_rtp_path(Ipv4Addr::new(239, 253, 64, 120), 5140, Some(addr), None, None);
        match svc {
            Service::MulticastRtp { fcc: Some(f), .. } => {
                assert_eq!(f.fcc_type, FccType::Telecom);
            }
            _ => panic!("expected FCC target"),
        }
    }
}
