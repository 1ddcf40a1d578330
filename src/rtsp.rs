// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! RTSP 1.0 control-plane engine (§4.3).
//!
//! Drives a single MPEG-TS stream over RTSP: DESCRIBE/SETUP/PLAY/TEARDOWN,
//! time-shift ("catch-up") query rewriting, and keepalive. Like
//! [`crate::fcc::FccEngine`] this is pure state plus emitted
//! [`RtspAction`]s; the reactor owns the TCP socket and timers.

use std::time::Duration;

/// Response deadline for any outstanding RTSP request (§5).
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);
/// Interval between keepalive requests while PLAYING (§4.3, §5).
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtspState {
    Init,
    Connecting,
    Connected,
    DescribeSent,
    Described,
    SetupSent,
    Setup,
    PlaySent,
    Playing,
    TeardownSent,
    TeardownComplete,
    Reconnecting,
    Paused,
    Error,
}

#[derive(Debug, Clone)]
pub enum RtspAction {
    Connect,
    SendDescribe { url: String },
    SendSetup { session: Option<String> },
    SendPlay { session: String },
    SendTeardown { session: String },
    SendKeepalive { session: String },
    Forward(Vec<u8>),
    Reconnect,
    LogError(String),
}

/// A time-shift request as parsed from the incoming client query string
/// (`playseek=<start>-<end>`, a custom name via `r2h-seek-name`, or a plain
/// second offset via `r2h-seek-offset`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeekRequest {
    pub start: TimeLiteral,
    pub end: Option<TimeLiteral>,
}

/// One of the two literal formats §4.3 recognizes: a 14-digit local
/// timestamp (format preserved across re-encoding) or a bare Unix epoch
/// (always UTC).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeLiteral {
    /// `yyyyMMddHHmmss`, interpreted using the `tz_offset_minutes` carried
    /// alongside it; `unix_seconds` is the UTC instant this literal names.
    Local {
        unix_seconds: i64,
        tz_offset_minutes: i32,
    },
    /// Bare Unix epoch seconds (<=10 digits), always UTC.
    Epoch { unix_seconds: i64 },
}

impl TimeLiteral {
    pub fn unix_seconds(&self) -> i64 {
        match self {
            TimeLiteral::Local { unix_seconds, .. } => *unix_seconds,
            TimeLiteral::Epoch { unix_seconds } => *unix_seconds,
        }
    }

    /// Re-render in the same literal format this value was parsed in,
    /// after shifting `unix_seconds` by some delta (used to convert a
    /// local-time literal to the timezone the upstream DESCRIBE URL
    /// expects — UTC, per §4.3/§8 scenario 5).
    pub fn render_in_tz(&self, tz_offset_minutes: i32) -> String {
        match self {
            TimeLiteral::Epoch { unix_seconds } => unix_seconds.to_string(),
            TimeLiteral::Local { unix_seconds, .. } => {
                format_14digit(*unix_seconds, tz_offset_minutes)
            }
        }
    }
}

/// Parse a `TZ/UTC±N` token out of a User-Agent string (§4.3). Defaults to
/// UTC (offset 0) when absent or malformed.
pub fn parse_tz_offset_minutes(user_agent: &str) -> i32 {
    for token in user_agent.split_whitespace() {
        if let Some(rest) = token.strip_prefix("TZ/UTC") {
            if rest.is_empty() {
                return 0;
            }
            let (sign, digits) = match rest.as_bytes()[0] {
                b'+' => (1, &rest[1..]),
                b'-' => (-1, &rest[1..]),
                _ => return 0,
            };
            if let Ok(hours) = digits.parse::<i32>() {
                return sign * hours * 60;
            }
        }
    }
    0
}

/// Parse one literal per §4.3: 14-digit `yyyyMMddHHmmss` (local, using
/// `tz_offset_minutes`) or <=10-digit Unix epoch seconds (UTC).
pub fn parse_time_literal(literal: &str, tz_offset_minutes: i32) -> Option<TimeLiteral> {
    if !literal.bytes().all(|b| b.is_ascii_digit()) || literal.is_empty() {
        return None;
    }
    if literal.len() == 14 {
        let year: i32 = literal[0..4].parse().ok()?;
        let month: u32 = literal[4..6].parse().ok()?;
        let day: u32 = literal[6..8].parse().ok()?;
        let hour: i64 = literal[8..10].parse().ok()?;
        let minute: i64 = literal[10..12].parse().ok()?;
        let second: i64 = literal[12..14].parse().ok()?;
        let days = days_since_epoch(year, month, day)?;
        let local_seconds =
            days * 86_400 + hour * 3600 + minute * 60 + second;
        let unix_seconds = local_seconds - i64::from(tz_offset_minutes) * 60;
        Some(TimeLiteral::Local {
            unix_seconds,
            tz_offset_minutes,
        })
    } else if literal.len() <= 10 {
        let unix_seconds: i64 = literal.parse().ok()?;
        Some(TimeLiteral::Epoch { unix_seconds })
    } else {
        None
    }
}

/// Days from the Unix epoch (1970-01-01) to the given civil date, via
/// Howard Hinnant's days_from_civil algorithm (avoids pulling in a full
/// calendar crate for one conversion used only by time-shift parsing).
fn days_since_epoch(year: i32, month: u32, day: u32) -> Option<i64> {
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return None;
    }
    let y = if month <= 2 { year as i64 - 1 } else { year as i64 };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = (y - era * 400) as i64;
    let mp = ((month as i64 + 9) % 12) as i64;
    let doy = (153 * mp + 2) / 5 + day as i64 - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    Some(era * 146097 + doe - 719468)
}

fn civil_from_days(z: i64) -> (i32, u32, u32) {
    let z = z + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = z - era * 146097;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let year = if m <= 2 { y + 1 } else { y } as i32;
    (year, m, d)
}

fn format_14digit(unix_seconds: i64, tz_offset_minutes: i32) -> String {
    let local_seconds = unix_seconds + i64::from(tz_offset_minutes) * 60;
    let days = local_seconds.div_euclid(86_400);
    let mut remainder = local_seconds.rem_euclid(86_400);
    let hour = remainder / 3600;
    remainder %= 3600;
    let minute = remainder / 60;
    let second = remainder % 60;
    let (year, month, day) = civil_from_days(days);
    format!(
        "{:04}{:02}{:02}{:02}{:02}{:02}",
        year, month, day, hour, minute, second
    )
}

/// Parse the time-shift query parameter set per §4.3: `playseek=start-end`
/// (or a custom name via `seek_param_name`), otherwise a plain second
/// offset via `seek_offset_seconds` relative to "now".
pub fn parse_seek(
    query_value: Option<&str>,
    seek_offset_seconds: Option<i64>,
    now_unix_seconds: i64,
    tz_offset_minutes: i32,
) -> Option<SeekRequest> {
    if let Some(value) = query_value {
        let (start_str, end_str) = match value.split_once('-') {
            Some((s, e)) => (s, Some(e)),
            None => (value, None),
        };
        let start = parse_time_literal(start_str, tz_offset_minutes)?;
        let end = match end_str {
            Some(e) if !e.is_empty() => parse_time_literal(e, tz_offset_minutes),
            _ => None,
        };
        return Some(SeekRequest { start, end });
    }
    let offset = seek_offset_seconds?;
    Some(SeekRequest {
        start: TimeLiteral::Epoch {
            unix_seconds: now_unix_seconds + offset,
        },
        end: None,
    })
}

/// Rewrite a DESCRIBE URL's seek query parameter to the upstream's
/// expected format (UTC, §8 scenario 5), preserving whichever literal
/// format the client used.
pub fn render_seek_param(seek: &SeekRequest) -> String {
    let start = seek.start.render_in_tz(0);
    match &seek.end {
        Some(end) => format!("{}-{}", start, end.render_in_tz(0)),
        None => start,
    }
}

/// RTSP 1.0 request/response text framing (§4.3, §6.2).
///
/// RTSP's request line and header block are plain CRLF-terminated text,
/// the same shape HTTP/1.0 uses; this module hand-rolls that framing the
/// same way `http.rs` hand-rolls the HTTP side, rather than pulling in an
/// HTTP-shaped crate for a protocol that only superficially resembles one
/// (different verbs, a `Session`/`Transport`/`CSeq` header vocabulary, and
/// an interleaved binary-frame mode HTTP has no equivalent of).
pub mod wire {
    use std::collections::HashMap;

    /// One parsed RTSP response: status code, reason phrase, and headers
    /// (lower-cased names), plus how many bytes of `buf` it consumed.
    #[derive(Debug, Clone)]
    pub struct Response {
        pub status: u16,
        pub reason: String,
        pub headers: HashMap<String, String>,
    }

    impl Response {
        pub fn header(&self, name: &str) -> Option<&str> {
            self.headers.get(&name.to_ascii_lowercase()).map(|s| s.as_str())
        }

        /// `Session: <id>[;timeout=N]` with the `;timeout=` suffix, if
        /// any, stripped.
        pub fn session_id(&self) -> Option<String> {
            self.header("session")
                .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
        }
    }

    fn next_cseq() -> u32 {
        use std::sync::atomic::{AtomicU32, Ordering};
        static CSEQ: AtomicU32 = AtomicU32::new(1);
        CSEQ.fetch_add(1, Ordering::Relaxed)
    }

    pub fn build_describe(url: &str) -> Vec<u8> {
        format!(
            "DESCRIBE {url} RTSP/1.0\r\nCSeq: {}\r\nAccept: application/sdp\r\n\r\n",
            next_cseq()
        )
        .into_bytes()
    }

    /// `interleaved` selects `RTP/AVP/TCP;interleaved=0-1` transport
    /// (behind-NAT default, §4.3); otherwise a client-chosen UDP port pair
    /// is offered.
    pub fn build_setup(url: &str, interleaved: bool, session: Option<&str>, rtp_port: u16) -> Vec<u8> {
        let transport = if interleaved {
            "RTP/AVP/TCP;unicast;interleaved=0-1".to_string()
        } else {
            format!("RTP/AVP;unicast;client_port={rtp_port}-{}", rtp_port + 1)
        };
        let mut req = format!(
            "SETUP {url} RTSP/1.0\r\nCSeq: {}\r\nTransport: {transport}\r\n",
            next_cseq()
        );
        if let Some(session) = session {
            req.push_str(&format!("Session: {session}\r\n"));
        }
        req.push_str("\r\n");
        req.into_bytes()
    }

    pub fn build_play(url: &str, session: &str) -> Vec<u8> {
        format!(
            "PLAY {url} RTSP/1.0\r\nCSeq: {}\r\nSession: {session}\r\nRange: npt=0.000-\r\n\r\n",
            next_cseq()
        )
        .into_bytes()
    }

    pub fn build_teardown(url: &str, session: &str) -> Vec<u8> {
        format!(
            "TEARDOWN {url} RTSP/1.0\r\nCSeq: {}\r\nSession: {session}\r\n\r\n",
            next_cseq()
        )
        .into_bytes()
    }

    pub fn build_keepalive(url: &str, session: &str) -> Vec<u8> {
        format!(
            "OPTIONS {url} RTSP/1.0\r\nCSeq: {}\r\nSession: {session}\r\n\r\n",
            next_cseq()
        )
        .into_bytes()
    }

    /// Parse one RTSP response (status line + headers, body ignored —
    /// this crate never needs the SDP body beyond DESCRIBE succeeding).
    /// Returns `None` if the header block is not yet fully buffered.
    pub fn parse_response(buf: &[u8]) -> Option<(Response, usize)> {
        let header_end = find_subslice(buf, b"\r\n\r\n")? + 4;
        let text = std::str::from_utf8(&buf[..header_end]).ok()?;
        let mut lines = text.split("\r\n");
        let status_line = lines.next()?;
        let mut parts = status_line.splitn(3, ' ');
        let _version = parts.next()?;
        let status: u16 = parts.next()?.parse().ok()?;
        let reason = parts.next().unwrap_or("").to_string();

        let mut headers = HashMap::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            if let Some((name, value)) = line.split_once(':') {
                headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
            }
        }
        Some((
            Response {
                status,
                reason,
                headers,
            },
            header_end,
        ))
    }

    /// Extract one interleaved frame (`'$' <channel:u8> <len:u16be>
    /// <payload>`, RFC 2326 §10.12) from the front of `buf`. Returns the
    /// channel, the payload, and total bytes consumed, or `None` if a full
    /// frame is not yet buffered. A leading byte other than `$` means the
    /// stream is carrying a plain RTSP response instead (`parse_response`
    /// handles that case); callers check for `$` first.
    pub fn parse_interleaved_frame(buf: &[u8]) -> Option<(u8, &[u8], usize)> {
        if buf.first() != Some(&b'$') || buf.len() < 4 {
            return None;
        }
        let channel = buf[1];
        let len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if buf.len() < 4 + len {
            return None;
        }
        Some((channel, &buf[4..4 + len], 4 + len))
    }

    fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack
            .windows(needle.len())
            .position(|window| window == needle)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn builds_describe_request_with_cseq() {
            let req = String::from_utf8(build_describe("rtsp://host/path")).unwrap();
            assert!(req.starts_with("DESCRIBE rtsp://host/path RTSP/1.0\r\n"));
            assert!(req.contains("CSeq:"));
        }

        #[test]
        fn parses_response_status_and_session() {
            let raw = b"RTSP/1.0 200 OK\r\nCSeq: 2\r\nSession: 12345;timeout=60\r\n\r\n";
            let (resp, consumed) = parse_response(raw).unwrap();
            assert_eq!(resp.status, 200);
            assert_eq!(consumed, raw.len());
            assert_eq!(resp.session_id().as_deref(), Some("12345"));
        }

        #[test]
        fn parse_response_returns_none_until_header_block_complete() {
            let raw = b"RTSP/1.0 200 OK\r\nCSeq: 2\r\n";
            assert!(parse_response(raw).is_none());
        }

        #[test]
        fn parses_interleaved_frame() {
            let mut buf = vec![b'$', 0, 0, 3];
            buf.extend_from_slice(b"abc");
            buf.extend_from_slice(b"trailing");
            let (channel, payload, consumed) = parse_interleaved_frame(&buf).unwrap();
            assert_eq!(channel, 0);
            assert_eq!(payload, b"abc");
            assert_eq!(consumed, 7);
        }

        #[test]
        fn interleaved_frame_waits_for_full_payload() {
            let buf = vec![b'$', 0, 0, 10, b'a', b'b'];
            assert!(parse_interleaved_frame(&buf).is_none());
        }
    }
}

pub struct RtspEngine {
    state: RtspState,
    session: Option<String>,
    interleaved: bool,
}

impl RtspEngine {
    pub fn new(interleaved: bool) -> Self {
        RtspEngine {
            state: RtspState::Init,
            session: None,
            interleaved,
        }
    }

    pub fn state(&self) -> RtspState {
        self.state
    }

    pub fn interleaved(&self) -> bool {
        self.interleaved
    }

    pub fn start(&mut self) -> RtspAction {
        debug_assert_eq!(self.state, RtspState::Init);
        self.state = RtspState::Connecting;
        RtspAction::Connect
    }

    pub fn on_connected(&mut self, url: String) -> RtspAction {
        self.state = RtspState::Connected;
        self.state = RtspState::DescribeSent;
        RtspAction::SendDescribe { url }
    }

    pub fn on_describe_ok(&mut self) -> RtspAction {
        self.state = RtspState::Described;
        self.state = RtspState::SetupSent;
        RtspAction::SendSetup { session: None }
    }

    pub fn on_setup_ok(&mut self, session: String) -> RtspAction {
        self.session = Some(session.clone());
        self.state = RtspState::Setup;
        self.state = RtspState::PlaySent;
        RtspAction::SendPlay { session }
    }

    pub fn on_play_ok(&mut self) {
        self.state = RtspState::Playing;
    }

    pub fn on_media_packet(&mut self, payload: Vec<u8>) -> Option<RtspAction> {
        if self.state == RtspState::Playing {
            Some(RtspAction::Forward(payload))
        } else {
            None
        }
    }

    pub fn on_keepalive_timer(&mut self) -> Option<RtspAction> {
        if self.state != RtspState::Playing {
            return None;
        }
        self.session
            .clone()
            .map(|session| RtspAction::SendKeepalive { session })
    }

    /// Loss of keepalive ack or of media for the configured interval
    /// (§4.3): restart SETUP on the same session if the server still
    /// recognizes it, else fall back to DESCRIBE.
    pub fn on_connection_lost(&mut self) -> RtspAction {
        self.state = RtspState::Reconnecting;
        RtspAction::Reconnect
    }

    pub fn on_server_error(&mut self, code: u16, reason: String) -> RtspAction {
        self.state = RtspState::Error;
        RtspAction::LogError(format!("rtsp error {code}: {reason}"))
    }

    pub fn teardown(&mut self) -> Option<RtspAction> {
        let session = self.session.take()?;
        self.state = RtspState::TeardownSent;
        Some(RtspAction::SendTeardown { session })
    }

    pub fn on_teardown_ok(&mut self) {
        self.state = RtspState::TeardownComplete;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_state_sequence() {
        let mut engine = RtspEngine::new(true);
        assert!(matches!(engine.start(), RtspAction::Connect));
        assert!(matches!(
            engine.on_connected("rtsp://host/path".into()),
            RtspAction::SendDescribe { .. }
        ));
        assert_eq!(engine.state(), RtspState::DescribeSent);
        assert!(matches!(engine.on_describe_ok(), RtspAction::SendSetup { .. }));
        assert_eq!(engine.state(), RtspState::SetupSent);
        assert!(matches!(
            engine.on_setup_ok("12345".into()),
            RtspAction::SendPlay { .. }
        ));
        engine.on_play_ok();
        assert_eq!(engine.state(), RtspState::Playing);
        assert!(engine.on_media_packet(vec![1, 2, 3]).is_some());
        assert!(engine.on_keepalive_timer().is_some());
    }

    #[test]
    fn connection_lost_triggers_reconnect() {
        let mut engine = RtspEngine::new(false);
        engine.start();
        engine.on_connected("rtsp://host/path".into());
        engine.on_describe_ok();
        engine.on_setup_ok("1".into());
        engine.on_play_ok();
        assert!(matches!(engine.on_connection_lost(), RtspAction::Reconnect));
        assert_eq!(engine.state(), RtspState::Reconnecting);
    }

    #[test]
    fn tz_offset_parses_plus_and_minus() {
        assert_eq!(parse_tz_offset_minutes("Player/1.0 TZ/UTC+8"), 480);
        assert_eq!(parse_tz_offset_minutes("Player/1.0 TZ/UTC-5"), -300);
        assert_eq!(parse_tz_offset_minutes("Player/1.0"), 0);
    }

    #[test]
    fn scenario_5_playseek_shifts_to_utc() {
        // §8 scenario 5: playseek=20240101120000-20240101130000, TZ/UTC+8
        // -> upstream carries 20240101040000-20240101050000.
        let tz = parse_tz_offset_minutes("Player/1.0 TZ/UTC+8");
        let seek = parse_seek(
            Some("20240101120000-20240101130000"),
            None,
            0,
            tz,
        )
        .expect("should parse");
        let rendered = render_seek_param(&seek);
        assert_eq!(rendered, "20240101040000-20240101050000");
    }

    #[test]
    fn epoch_literal_round_trips_without_shift() {
        let seek = parse_seek(Some("1700000000"), None, 0, 0).unwrap();
        assert_eq!(render_seek_param(&seek), "1700000000");
    }

    #[test]
    fn offset_form_uses_now_plus_delta() {
        let seek = parse_seek(None, Some(-60), 1_700_000_000, 0).unwrap();
        assert_eq!(seek.start.unix_seconds(), 1_699_999_940);
    }

    #[test]
    fn fourteen_digit_round_trips_through_unix_seconds() {
        let literal = parse_time_literal("20240101120000", 0).unwrap();
        assert_eq!(literal.render_in_tz(0), "20240101120000");
    }
}
