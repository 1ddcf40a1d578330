// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Supervisor control-socket protocol (§6.4).
//!
//! The supervisor itself (forking workers, restarting them, aggregating
//! status) is explicitly out of scope (§1, §9); this module is just the
//! worker-side boundary: decode the two commands a supervisor may send,
//! and encode the status snapshot a worker pushes back periodically.

use crate::buffer::BufferPoolStats;
use crate::logging::Verbosity;

/// A command the supervisor pushes down the control socket (§6.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    ForceDisconnectClient { client_id: u64 },
    SetLogLevel { verbosity: u8 },
}

/// Parse one newline-terminated control-socket line. The wire format is
/// deliberately plain text (`disconnect <id>`, `loglevel <0-4>`) since the
/// control socket is a local, trusted, low-volume channel — nothing here
/// is on the hot data path that would justify a binary framing.
pub fn parse_command(line: &str) -> Option<ControlCommand> {
    let line = line.trim();
    let mut parts = line.split_whitespace();
    match parts.next()? {
        "disconnect" => {
            let client_id = parts.next()?.parse().ok()?;
            Some(ControlCommand::ForceDisconnectClient { client_id })
        }
        "loglevel" => {
            let verbosity = parts.next()?.parse().ok()?;
            Some(ControlCommand::SetLogLevel { verbosity })
        }
        _ => None,
    }
}

/// One row of the per-client status this worker pushes periodically
/// (§6.4: "per-worker send/pool stats, per-client rows, log ring" — the
/// JSON rendering and the ring buffer itself belong to the out-of-scope
/// status-page collaborator; this is the data worth pushing).
#[derive(Debug, Clone)]
pub struct ClientStatusRow {
    pub client_id: u64,
    pub remote_addr: String,
    pub bytes_sent: u64,
    pub bandwidth_bits_per_second: f64,
    pub slow: bool,
    pub backpressure_events: u64,
}

#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub worker_pid: u32,
    pub verbosity: Verbosity,
    pub pool: BufferPoolStats,
    pub clients: Vec<ClientStatusRow>,
}

impl StatusSnapshot {
    /// Render in the same plain-text line style as the command side of
    /// this channel (§6.4) — a `worker` summary line followed by one
    /// `client` line per connected client. A real status page would parse
    /// and re-render this as JSON; that layer is out of scope here.
    pub fn render(&self) -> String {
        let mut out = format!(
            "worker pid={} verbosity={} pool_used={} pool_total={} pool_exhaustions={}\n",
            self.worker_pid, self.verbosity.0, self.pool.used, self.pool.total, self.pool.exhaustions,
        );
        for row in &self.clients {
            out.push_str(&format!(
                "client id={} addr={} bytes_sent={} bw_bps={:.0} slow={} backpressure={}\n",
                row.client_id,
                row.remote_addr,
                row.bytes_sent,
                row.bandwidth_bits_per_second,
                row.slow,
                row.backpressure_events,
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_disconnect_command() {
        assert_eq!(
            parse_command("disconnect 42\n"),
            Some(ControlCommand::ForceDisconnectClient { client_id: 42 })
        );
    }

    #[test]
    fn parses_loglevel_command() {
        assert_eq!(
            parse_command("loglevel 4"),
            Some(ControlCommand::SetLogLevel { verbosity: 4 })
        );
    }

    #[test]
    fn rejects_unknown_command() {
        assert_eq!(parse_command("frobnicate"), None);
    }

    #[test]
    fn rejects_malformed_arguments() {
        assert_eq!(parse_command("disconnect not-a-number"), None);
        assert_eq!(parse_command("disconnect"), None);
    }

    #[test]
    fn renders_worker_and_client_lines() {
        let snapshot = StatusSnapshot {
            worker_pid: 123,
            verbosity: Verbosity(2),
            pool: BufferPoolStats {
                total: 10,
                free: 7,
                used: 3,
                high_water_mark: 4,
                expansions: 0,
                exhaustions: 0,
            },
            clients: vec![ClientStatusRow {
                client_id: 9,
                remote_addr: "192.0.2.1:5000".to_string(),
                bytes_sent: 4096,
                bandwidth_bits_per_second: 1_000_000.0,
                slow: false,
                backpressure_events: 0,
            }],
        };
        let rendered = snapshot.render();
        assert!(rendered.starts_with("worker pid=123 verbosity=2 pool_used=3 pool_total=10"));
        assert!(rendered.contains("client id=9 addr=192.0.2.1:5000"));
    }
}
