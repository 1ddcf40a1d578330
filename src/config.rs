// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Flat INI-style configuration file and CLI flag merging
//! (`SPEC_FULL.md` §0, §6.3).
//!
//! Sections `[global]`, `[bind]`, `[services]`; `key = value` lines;
//! `#` or `;` starts a comment; blank lines ignored. This is a small,
//! fully specified grammar, so it is hand-parsed rather than pulled in
//! through a general TOML/YAML crate — the same reasoning behind
//! hand-parsing RTP headers, FCC packets, and M3U elsewhere in this crate.

use crate::error::ConfigError;
use crate::fcc::FccType;
use crate::service::Service;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::Path;

#[derive(Debug, Clone)]
pub struct GlobalConfig {
    pub listen_addr: Ipv4Addr,
    pub listen_port: u16,
    pub max_clients: usize,
    pub worker_count: usize,
    pub buffer_pool_initial_size: usize,
    pub buffer_pool_max_size: usize,
    pub queue_limit_bytes: usize,
    pub fcc_listen_port_range: Option<(u16, u16)>,
    pub multicast_rejoin_interval_secs: Option<u64>,
    /// Interface multicast joins are issued on (§6.3: "upstream interfaces
    /// (multicast, unicast, http split)"). `UNSPECIFIED` lets the kernel
    /// pick the default route's interface.
    pub multicast_interface: Ipv4Addr,
    /// Local interface FCC/FEC unicast sockets bind to; may differ from
    /// `multicast_interface` on multi-homed gateways.
    pub unicast_interface: Ipv4Addr,
    pub token: Option<String>,
    pub hostname: Option<String>,
    pub status_page_path: String,
    pub player_page_path: String,
    pub udpxy_compat: bool,
    pub video_snapshot: bool,
    pub ffmpeg_path: Option<String>,
    pub ffmpeg_args: Option<String>,
    pub external_m3u_url: Option<String>,
    pub external_m3u_update_interval_secs: u64,
    pub control_socket_path: Option<String>,
    /// Query parameter name carrying a time-shift request, in place of the
    /// default `playseek` (§4.3).
    pub seek_param_name: String,
    /// Fallback time-shift offset in seconds relative to "now", used when a
    /// client requests time-shift without an explicit `playseek` value.
    pub seek_offset_seconds: Option<i64>,
    pub verbosity: u8,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        GlobalConfig {
            listen_addr: Ipv4Addr::UNSPECIFIED,
            listen_port: 7088,
            max_clients: 100,
            worker_count: 1,
            buffer_pool_initial_size: 512,
            buffer_pool_max_size: 65536,
            queue_limit_bytes: 4 * 1024 * 1024,
            fcc_listen_port_range: None,
            multicast_rejoin_interval_secs: None,
            multicast_interface: Ipv4Addr::UNSPECIFIED,
            unicast_interface: Ipv4Addr::UNSPECIFIED,
            token: None,
            hostname: None,
            status_page_path: "/status".to_string(),
            player_page_path: "/player".to_string(),
            udpxy_compat: false,
            video_snapshot: false,
            ffmpeg_path: None,
            ffmpeg_args: None,
            external_m3u_url: None,
            external_m3u_update_interval_secs: 3600,
            control_socket_path: None,
            seek_param_name: "playseek".to_string(),
            seek_offset_seconds: None,
            verbosity: 3,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub global: GlobalConfig,
    pub services: Vec<(String, Service)>,
}

/// Parse the flat INI grammar into `(section, key, value, line_number)`
/// tuples, leaving interpretation of keys to the caller (who knows which
/// section they belong to and what type each value should be).
fn lex(text: &str) -> Result<Vec<(String, String, String, usize)>, ConfigError> {
    let mut section = String::from("global");
    let mut out = Vec::new();
    for (idx, raw_line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            section = name.trim().to_string();
            continue;
        }
        match line.split_once('=') {
            Some((key, value)) => {
                out.push((
                    section.clone(),
                    key.trim().to_string(),
                    value.trim().to_string(),
                    line_no,
                ));
            }
            None => {
                return Err(ConfigError::Syntax {
                    line: line_no,
                    text: line.to_string(),
                });
            }
        }
    }
    Ok(out)
}

pub fn load_from_str(text: &str) -> Result<Config, ConfigError> {
    let entries = lex(text)?;
    let mut config = Config::default();

    for (section, key, value, line) in entries {
        match section.as_str() {
            "global" | "bind" => apply_global(&mut config.global, &key, &value, line)?,
            "services" => {
                let service = parse_service_line(&key, &value, line)?;
                config.services.push((key, service));
            }
            other => {
                return Err(ConfigError::UnknownKey {
                    line,
                    section: other.to_string(),
                    key,
                })
            }
        }
    }
    Ok(config)
}

pub fn load_from_path(path: &Path) -> Result<Config, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    load_from_str(&text)
}

fn apply_global(
    cfg: &mut GlobalConfig,
    key: &str,
    value: &str,
    line: usize,
) -> Result<(), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    };
    match key {
        "listen-addr" => cfg.listen_addr = value.parse().map_err(|_| invalid("not an IPv4 address"))?,
        "listen-port" => cfg.listen_port = value.parse().map_err(|_| invalid("not a port number"))?,
        "max-clients" => cfg.max_clients = value.parse().map_err(|_| invalid("not a number"))?,
        "worker-count" => cfg.worker_count = value.parse().map_err(|_| invalid("not a number"))?,
        "buffer-pool-initial-size" => {
            cfg.buffer_pool_initial_size = value.parse().map_err(|_| invalid("not a number"))?
        }
        "buffer-pool-max-size" => {
            cfg.buffer_pool_max_size = value.parse().map_err(|_| invalid("not a number"))?
        }
        "queue-limit-bytes" => {
            cfg.queue_limit_bytes = value.parse().map_err(|_| invalid("not a number"))?
        }
        "fcc-listen-port-range" => {
            let (lo, hi) = value.split_once('-').ok_or_else(|| invalid("expected lo-hi"))?;
            let lo: u16 = lo.parse().map_err(|_| invalid("bad range low"))?;
            let hi: u16 = hi.parse().map_err(|_| invalid("bad range high"))?;
            cfg.fcc_listen_port_range = Some((lo, hi));
        }
        "multicast-rejoin-interval" => {
            cfg.multicast_rejoin_interval_secs =
                Some(value.parse().map_err(|_| invalid("not a number"))?)
        }
        "multicast-interface" => {
            cfg.multicast_interface = value.parse().map_err(|_| invalid("not an IPv4 address"))?
        }
        "unicast-interface" => {
            cfg.unicast_interface = value.parse().map_err(|_| invalid("not an IPv4 address"))?
        }
        "control-socket-path" => cfg.control_socket_path = Some(value.to_string()),
        "token" => cfg.token = Some(value.to_string()),
        "hostname" => cfg.hostname = Some(value.to_string()),
        "status-page-path" => cfg.status_page_path = value.to_string(),
        "player-page-path" => cfg.player_page_path = value.to_string(),
        "udpxy-compat" => cfg.udpxy_compat = parse_bool(value, &invalid)?,
        "video-snapshot" => cfg.video_snapshot = parse_bool(value, &invalid)?,
        "ffmpeg-path" => cfg.ffmpeg_path = Some(value.to_string()),
        "ffmpeg-args" => cfg.ffmpeg_args = Some(value.to_string()),
        "external-m3u-url" => cfg.external_m3u_url = Some(value.to_string()),
        "external-m3u-update-interval" => {
            cfg.external_m3u_update_interval_secs =
                value.parse().map_err(|_| invalid("not a number"))?
        }
        "r2h-seek-name" => cfg.seek_param_name = value.to_string(),
        "r2h-seek-offset" => {
            cfg.seek_offset_seconds = Some(value.parse().map_err(|_| invalid("not a number"))?)
        }
        "verbosity" => cfg.verbosity = value.parse().map_err(|_| invalid("not 0-4"))?,
        _ => {
            return Err(ConfigError::UnknownKey {
                line,
                section: "global".to_string(),
                key: key.to_string(),
            })
        }
    }
    Ok(())
}

fn parse_bool(value: &str, invalid: &impl Fn(&str) -> ConfigError) -> Result<bool, ConfigError> {
    match value {
        "yes" | "true" | "1" => Ok(true),
        "no" | "false" | "0" => Ok(false),
        _ => Err(invalid("expected yes/no")),
    }
}

/// Parse one `[services]` line:
/// `rtp://addr:port[,fcc=host:port][,fcc-type=telecom|huawei][,fec=port]`
/// or `rtsp://host:port/path`.
fn parse_service_line(name: &str, value: &str, line: usize) -> Result<Service, ConfigError> {
    let bad = |reason: &str| ConfigError::InvalidService {
        name: name.to_string(),
        reason: reason.to_string(),
    };
    if let Some(rest) = value.strip_prefix("rtp://") {
        let mut parts = rest.split(',');
        let addr_port = parts.next().ok_or_else(|| bad("missing address"))?;
        let (group, port) = split_addr_port(addr_port)?;
        let mut fcc_addr = None;
        let mut fcc_type = None;
        let mut fec_port = None;
        for opt in parts {
            match opt.split_once('=') {
                Some(("fcc", v)) => fcc_addr = Some(v.parse::<SocketAddrV4>()?),
                Some(("fcc-type", "telecom")) => fcc_type = Some(FccType::Telecom),
                Some(("fcc-type", "huawei")) => fcc_type = Some(FccType::Huawei),
                Some(("fec", v)) => {
                    fec_port = Some(v.parse().map_err(|_| bad("bad fec port"))?)
                }
                _ => return Err(bad("unrecognized rtp:// option")),
            }
        }
        Ok(Service::from_rtp_path(group, port, fcc_addr, fcc_type, fec_port))
    } else if let Some(rest) = value.strip_prefix("rtsp://") {
        let (host_port, path) = rest.split_once('/').unwrap_or((rest, ""));
        let (host, port) = host_port
            .rsplit_once(':')
            .map(|(h, p)| (h.to_string(), p.parse().unwrap_or(554)))
            .unwrap_or((host_port.to_string(), 554));
        Ok(Service::from_rtsp_path(host, port, path.to_string(), None))
    } else {
        let _ = line;
        Err(bad("expected rtp:// or rtsp:// scheme"))
    }
}

fn split_addr_port(addr_port: &str) -> Result<(Ipv4Addr, u16), ConfigError> {
    let (addr, port) = addr_port.rsplit_once(':').ok_or_else(|| ConfigError::InvalidService {
        name: addr_port.to_string(),
        reason: "missing port".to_string(),
    })?;
    let group = addr.parse().map_err(ConfigError::Addr)?;
    let port: u16 = port.parse().map_err(|_| ConfigError::InvalidService {
        name: addr_port.to_string(),
        reason: "bad port".to_string(),
    })?;
    Ok((group, port))
}

/// Recognized request-path static endpoints (`status-page-path`,
/// `player-page-path`), used by the HTTP router.
pub fn static_path_map(cfg: &GlobalConfig) -> HashMap<String, &'static str> {
    let mut map = HashMap::new();
    map.insert(cfg.status_page_path.clone(), "status");
    map.insert(cfg.player_page_path.clone(), "player");
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_global_section_with_defaults_for_omitted_keys() {
        let text = "[global]\nlisten-port = 8080\nverbosity = 4\n";
        let config = load_from_str(text).unwrap();
        assert_eq!(config.global.listen_port, 8080);
        assert_eq!(config.global.verbosity, 4);
        assert_eq!(config.global.max_clients, 100); // default
    }

    #[test]
    fn parses_services_section_with_fcc_and_fec() {
        let text = "[services]\n\
            news1 = rtp://239.1.1.1:5000,fcc=10.0.0.1:15970,fec=5001\n";
        let config = load_from_str(text).unwrap();
        assert_eq!(config.services.len(), 1);
        assert_eq!(config.services[0].0, "news1");
        match &config.services[0].1 {
            Service::MulticastRtp { fcc: Some(f), fec_port: Some(5001), .. } => {
                assert_eq!(f.addr.port(), 15970);
            }
            other => panic!("unexpected service: {other:?}"),
        }
    }

    #[test]
    fn rejects_malformed_line() {
        let text = "[global]\nnot-a-kv-line\n";
        assert!(matches!(load_from_str(text), Err(ConfigError::Syntax { line: 2, .. })));
    }

    #[test]
    fn rejects_unknown_key() {
        let text = "[global]\nbogus-key = 1\n";
        assert!(matches!(load_from_str(text), Err(ConfigError::UnknownKey { .. })));
    }

    #[test]
    fn loads_from_a_real_file_via_tempfile() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[global]\nlisten-port = 9000\n").unwrap();
        let config = load_from_path(file.path()).unwrap();
        assert_eq!(config.global.listen_port, 9000);
    }

    #[test]
    fn comments_and_blank_lines_are_ignored() {
        let text = "# comment\n\n; also a comment\n[global]\nlisten-port = 1234\n";
        let config = load_from_str(text).unwrap();
        assert_eq!(config.global.listen_port, 1234);
    }
}
