// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Typed error enums for the worker's fallible boundaries.
//!
//! Internal hot-path code (reactor dispatch, buffer pool, egress queue)
//! deals in `io::Result` and sentinel enums rather than these types; they
//! exist for the boundaries a human or the supervisor can observe:
//! startup, config parsing, and per-request HTTP failures.

use std::io;
use std::net::AddrParseError;

/// Errors that can occur while loading the INI config file or merging CLI
/// overrides. All are fatal at startup (§6.3: non-zero exit).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io { path: String, source: io::Error },

    #[error("line {line}: expected `key = value`, found {text:?}")]
    Syntax { line: usize, text: String },

    #[error("line {line}: unknown key {key:?} in section [{section}]")]
    UnknownKey {
        line: usize,
        section: String,
        key: String,
    },

    #[error("invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("service {name:?}: {reason}")]
    InvalidService { name: String, reason: String },

    #[error("invalid address: {0}")]
    Addr(#[from] AddrParseError),
}

/// Errors surfaced while parsing or routing one HTTP request. These map to
/// HTTP status codes at the front end (§6.1, §7); they never propagate past
/// the client connection that triggered them.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("malformed request line")]
    MalformedRequest,

    #[error("unsupported method")]
    UnsupportedMethod,

    #[error("no route matches {path:?}")]
    NoRoute { path: String },

    #[error("missing or invalid r2h-token")]
    Forbidden,

    #[error("Host header does not match configured hostname")]
    HostMismatch,

    #[error("upstream unavailable: {0}")]
    Upstream(#[from] UpstreamError),
}

impl HttpError {
    /// Status line this error should be answered with, per §7's mapping of
    /// upstream/auth failures onto HTTP status classes.
    pub fn status(&self) -> (u16, &'static str) {
        match self {
            HttpError::MalformedRequest | HttpError::UnsupportedMethod => (400, "Bad Request"),
            HttpError::NoRoute { .. } => (404, "Not Found"),
            HttpError::Forbidden | HttpError::HostMismatch => (403, "Forbidden"),
            HttpError::Upstream(UpstreamError::Refused(_)) => (502, "Bad Gateway"),
            HttpError::Upstream(UpstreamError::Timeout) => (504, "Gateway Timeout"),
            HttpError::Upstream(_) => (502, "Bad Gateway"),
        }
    }
}

/// Upstream (FCC/RTSP/multicast) hard errors (§7).
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream refused: {0}")]
    Refused(String),

    #[error("upstream response timeout")]
    Timeout,

    #[error("socket error: {0}")]
    Io(#[from] io::Error),

    #[error("rtsp error {code}: {reason}")]
    RtspStatus { code: u16, reason: String },
}
