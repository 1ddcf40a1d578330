// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Minimal HTTP/1.1 front end: request parsing, routing, auth, and
//! response framing (§6.1).
//!
//! Deliberately not a general-purpose HTTP server (§1 Non-goals): only
//! `GET`/`HEAD`, no chunked transfer encoding, no keep-alive.

use crate::error::HttpError;
use std::collections::HashMap;
use std::net::Ipv4Addr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
}

/// A parsed, routed HTTP request, ready to be matched against a
/// [`Route`] (§6.1's path table).
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub query: HashMap<String, String>,
    /// The query string exactly as received, before percent-decoding into
    /// [`Request::query`] — kept around for the HTTP proxy route, which
    /// relays it to the upstream verbatim rather than re-encoding it.
    pub raw_query: Option<String>,
    pub headers: HashMap<String, String>,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(|s| s.as_str())
    }

    /// Snapshot was requested via any of the three signals in §6.1/§4.6.
    pub fn wants_snapshot(&self) -> bool {
        self.query_param("snapshot") == Some("1")
            || self.header("Accept") == Some("image/jpeg")
            || self.header("X-Request-Snapshot") == Some("1")
    }
}

/// Parse one HTTP/1.1 request from a byte buffer containing at least the
/// full request line and headers (terminated by `\r\n\r\n`). Returns the
/// request and the number of bytes consumed, so the reactor can leave any
/// trailing body bytes (there never are any for the GET/HEAD-only surface
/// here) in the socket's read buffer.
pub fn parse_request(buf: &[u8]) -> Result<Option<(Request, usize)>, HttpError> {
    let Some(header_end) = find_header_end(buf) else {
        return Ok(None);
    };
    let text = std::str::from_utf8(&buf[..header_end])
        .map_err(|_| HttpError::MalformedRequest)?;
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or(HttpError::MalformedRequest)?;
    let mut parts = request_line.split(' ');
    let method_str = parts.next().ok_or(HttpError::MalformedRequest)?;
    let target = parts.next().ok_or(HttpError::MalformedRequest)?;
    let method = match method_str {
        "GET" => Method::Get,
        "HEAD" => Method::Head,
        _ => return Err(HttpError::UnsupportedMethod),
    };

    let (path, query, raw_query) = split_target(target);

    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_string(), value.trim().to_string());
        }
    }

    Ok(Some((
        Request {
            method,
            path,
            query,
            raw_query,
            headers,
        },
        header_end + 4,
    )))
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn split_target(target: &str) -> (String, HashMap<String, String>, Option<String>) {
    match target.split_once('?') {
        Some((path, query_str)) => (
            path.to_string(),
            parse_query(query_str),
            Some(query_str.to_string()),
        ),
        None => (target.to_string(), HashMap::new(), None),
    }
}

fn parse_query(query_str: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for pair in query_str.split('&') {
        if pair.is_empty() {
            continue;
        }
        match pair.split_once('=') {
            Some((k, v)) => {
                map.insert(percent_decode(k), percent_decode(v));
            }
            None => {
                map.insert(percent_decode(pair), String::new());
            }
        }
    }
    map
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                if let Some(value) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    out.push(value);
                    i += 3;
                    continue;
                }
                out.push(bytes[i]);
                i += 1;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// The routed shape of a request, per §6.1's path table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Rtp {
        group: Ipv4Addr,
        port: u16,
        fcc: Option<String>,
        fcc_type: Option<String>,
        fec: Option<u16>,
    },
    Udp {
        group: Ipv4Addr,
        port: u16,
    },
    Rtsp {
        host: String,
        port: u16,
        path: String,
        seek: Option<String>,
    },
    HttpProxy {
        host: String,
        port: u16,
        path: String,
    },
    NamedService {
        name: String,
    },
    Playlist,
    Static {
        name: &'static str,
    },
}

/// Route a request path against §6.1's table. `static_paths` maps a
/// configured status/player path to its logical name, since those are
/// configurable (`status-page-path`, `player-page-path`).
pub fn route(path: &str, static_paths: &HashMap<String, &'static str>) -> Result<Route, HttpError> {
    if let Some(name) = static_paths.get(path) {
        return Ok(Route::Static { name: *name });
    }
    if path == "/playlist.m3u" {
        return Ok(Route::Playlist);
    }
    if let Some(rest) = path.strip_prefix("/rtp/") {
        let (group, port) = parse_addr_port(rest)?;
        return Ok(Route::Rtp {
            group,
            port,
            fcc: None,
            fcc_type: None,
            fec: None,
        });
    }
    if let Some(rest) = path.strip_prefix("/udp/") {
        let (group, port) = parse_addr_port(rest)?;
        return Ok(Route::Udp { group, port });
    }
    if let Some(rest) = path.strip_prefix("/rtsp/") {
        let mut segments = rest.splitn(2, '/');
        let host_port = segments.next().ok_or_else(|| no_route(path))?;
        let inner_path = segments.next().unwrap_or("").to_string();
        let (host, port) = split_host_port(host_port, 554)?;
        return Ok(Route::Rtsp {
            host,
            port,
            path: inner_path,
            seek: None,
        });
    }
    if let Some(rest) = path.strip_prefix("/http/") {
        let mut segments = rest.splitn(2, '/');
        let host_port = segments.next().ok_or_else(|| no_route(path))?;
        let inner_path = segments.next().unwrap_or("").to_string();
        let (host, port) = split_host_port(host_port, 80)?;
        return Ok(Route::HttpProxy {
            host,
            port,
            path: inner_path,
        });
    }
    if path.len() > 1 && !path.contains('/') {
        return Ok(Route::NamedService {
            name: path[1..].to_string(),
        });
    }
    Err(no_route(path))
}

fn no_route(path: &str) -> HttpError {
    HttpError::NoRoute {
        path: path.to_string(),
    }
}

fn parse_addr_port(rest: &str) -> Result<(Ipv4Addr, u16), HttpError> {
    let (host, port) = split_host_port(rest, 0)?;
    let group = host.parse().map_err(|_| no_route(rest))?;
    Ok((group, port))
}

fn split_host_port(host_port: &str, default_port: u16) -> Result<(String, u16), HttpError> {
    match host_port.rsplit_once(':') {
        Some((host, port_str)) => {
            let port = port_str.parse().map_err(|_| no_route(host_port))?;
            Ok((host.to_string(), port))
        }
        None if default_port != 0 => Ok((host_port.to_string(), default_port)),
        None => Err(no_route(host_port)),
    }
}

/// Check the `r2h-token` credential against the three carrying mechanisms
/// §6.1 allows: query parameter, cookie, or a token embedded in the
/// User-Agent as `R2HTOKEN/<value>`.
pub fn check_token(request: &Request, expected: Option<&str>) -> Result<(), HttpError> {
    let Some(expected) = expected else {
        return Ok(());
    };
    if request.query_param("r2h-token") == Some(expected) {
        return Ok(());
    }
    if let Some(cookie) = request.header("Cookie") {
        if cookie
            .split(';')
            .map(str::trim)
            .any(|kv| kv == format!("r2h-token={expected}"))
        {
            return Ok(());
        }
    }
    if let Some(ua) = request.header("User-Agent") {
        if ua
            .split_whitespace()
            .any(|tok| tok == format!("R2HTOKEN/{expected}"))
        {
            return Ok(());
        }
    }
    Err(HttpError::Forbidden)
}

pub fn check_hostname(request: &Request, expected: Option<&str>) -> Result<(), HttpError> {
    match expected {
        None => Ok(()),
        Some(expected) => match request.header("Host") {
            Some(host) if host.eq_ignore_ascii_case(expected) => Ok(()),
            _ => Err(HttpError::HostMismatch),
        },
    }
}

/// Render a response status line and headers for a stream (§6.1 framing:
/// `video/mp2t`, identity transfer-encoding, connection closed on
/// termination).
pub fn stream_response_headers(content_type: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: {content_type}\r\n\
         Transfer-Encoding: identity\r\n\
         Connection: close\r\n\
         \r\n"
    )
}

/// One upstream response's status line and headers, for the `/http/`
/// reverse-proxy path (§6.1) — the only place this front end ever needs to
/// parse an HTTP *response* rather than a request.
#[derive(Debug, Clone)]
pub struct UpstreamResponseHead {
    pub status: u16,
    pub headers: HashMap<String, String>,
}

impl UpstreamResponseHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_length(&self) -> Option<usize> {
        self.header("Content-Length").and_then(|v| v.parse().ok())
    }

    /// Whether the body is an M3U playlist worth rewriting, going by
    /// Content-Type first and falling back to the requested path's
    /// extension (some upstreams serve playlists as `text/plain`).
    pub fn looks_like_playlist(&self, requested_path: &str) -> bool {
        if let Some(ct) = self.header("Content-Type") {
            let ct = ct.to_ascii_lowercase();
            if ct.contains("mpegurl") || ct.contains("x-mpegurl") {
                return true;
            }
        }
        requested_path.ends_with(".m3u") || requested_path.ends_with(".m3u8")
    }
}

/// Parse one upstream HTTP response's status line and headers out of `buf`.
/// Returns `None` if the full header block hasn't arrived yet.
pub fn parse_response_head(buf: &[u8]) -> Result<Option<(UpstreamResponseHead, usize)>, HttpError> {
    let Some(header_end) = find_header_end(buf) else {
        return Ok(None);
    };
    let text = std::str::from_utf8(&buf[..header_end]).map_err(|_| HttpError::MalformedRequest)?;
    let mut lines = text.split("\r\n");
    let status_line = lines.next().ok_or(HttpError::MalformedRequest)?;
    let mut parts = status_line.split(' ');
    let _version = parts.next().ok_or(HttpError::MalformedRequest)?;
    let status: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or(HttpError::MalformedRequest)?;

    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_string(), value.trim().to_string());
        }
    }

    Ok(Some((UpstreamResponseHead { status, headers }, header_end + 4)))
}

/// Build the GET request this gateway relays to an `/http/` proxy target.
pub fn build_proxy_request(host: &str, path_and_query: &str) -> Vec<u8> {
    format!(
        "GET /{path_and_query} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Connection: close\r\n\
         \r\n"
    )
    .into_bytes()
}

pub fn error_response_headers(error: &HttpError) -> String {
    let (code, reason) = error.status();
    format!("HTTP/1.1 {code} {reason}\r\nConnection: close\r\n\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_get_request_with_query_and_headers() {
        let raw = b"GET /rtp/239.253.64.120:5140?fcc=1&snapshot=1 HTTP/1.1\r\nHost: gw\r\nAccept: image/jpeg\r\n\r\n";
        let (req, consumed) = parse_request(raw).unwrap().unwrap();
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.path, "/rtp/239.253.64.120:5140");
        assert_eq!(req.query_param("fcc"), Some("1"));
        assert!(req.wants_snapshot());
        assert_eq!(consumed, raw.len());
    }

    #[test]
    fn incomplete_header_returns_none() {
        let raw = b"GET / HTTP/1.1\r\nHost: gw\r\n";
        assert!(parse_request(raw).unwrap().is_none());
    }

    #[test]
    fn head_is_supported_but_other_verbs_rejected() {
        let raw = b"HEAD / HTTP/1.1\r\n\r\n";
        let (req, _) = parse_request(raw).unwrap().unwrap();
        assert_eq!(req.method, Method::Head);

        let raw = b"POST / HTTP/1.1\r\n\r\n";
        assert!(matches!(parse_request(raw), Err(HttpError::UnsupportedMethod)));
    }

    #[test]
    fn routes_rtp_udp_rtsp_and_named_service() {
        let statics = HashMap::new();
        assert!(matches!(
            route("/rtp/239.1.1.1:5000", &statics).unwrap(),
            Route::Rtp { port: 5000, .. }
        ));
        assert!(matches!(
            route("/udp/239.1.1.1:6000", &statics).unwrap(),
            Route::Udp { port: 6000, .. }
        ));
        assert!(matches!(
            route("/rtsp/10.0.0.1:554/live/ch1", &statics).unwrap(),
            Route::Rtsp { ref path, .. } if path == "live/ch1"
        ));
        assert!(matches!(
            route("/news1", &statics).unwrap(),
            Route::NamedService { name } if name == "news1"
        ));
    }

    #[test]
    fn parses_upstream_response_head_and_detects_playlist() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: application/vnd.apple.mpegurl\r\nContent-Length: 42\r\n\r\nbody";
        let (head, consumed) = parse_response_head(raw).unwrap().unwrap();
        assert_eq!(head.status, 200);
        assert_eq!(head.content_length(), Some(42));
        assert!(head.looks_like_playlist("channels.m3u8"));
        assert_eq!(consumed, raw.len() - 4);
    }

    #[test]
    fn playlist_detection_falls_back_to_path_extension() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\n";
        let (head, _) = parse_response_head(raw).unwrap().unwrap();
        assert!(head.looks_like_playlist("list.m3u"));
        assert!(!head.looks_like_playlist("video.ts"));
    }

    #[test]
    fn token_accepted_via_query_cookie_or_user_agent() {
        let mut req = Request {
            method: Method::Get,
            path: "/x".into(),
            query: HashMap::new(),
            raw_query: None,
            headers: HashMap::new(),
        };
        assert!(check_token(&req, Some("secret")).is_err());

        req.query.insert("r2h-token".into(), "secret".into());
        assert!(check_token(&req, Some("secret")).is_ok());

        req.query.clear();
        req.headers.insert("Cookie".into(), "r2h-token=secret".into());
        assert!(check_token(&req, Some("secret")).is_ok());

        req.headers.clear();
        req.headers
            .insert("User-Agent".into(), "Player/1.0 R2HTOKEN/secret".into());
        assert!(check_token(&req, Some("secret")).is_ok());
    }
}
