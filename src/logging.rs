// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Worker logging.
//!
//! A single global [`log::Log`] implementation writing to stderr, with a
//! verbosity level that can be changed at runtime (§6.4: the supervisor may
//! push a "set log level" command to a running worker). Verbosity follows
//! §7's five levels: 0 fatal, 1 error, 2 warn, 3 info, 4 debug.

use log::{Level, LevelFilter, Log, Metadata, Record};
use std::io::Write;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Verbosity as configured (§7): 0=fatal .. 4=debug.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Verbosity(pub u8);

impl Verbosity {
    fn to_filter(self) -> LevelFilter {
        match self.0.min(4) {
            0 => LevelFilter::Error, // "fatal" has no stdlib equivalent; map to Error floor
            1 => LevelFilter::Error,
            2 => LevelFilter::Warn,
            3 => LevelFilter::Info,
            4 => LevelFilter::Debug,
            _ => unreachable!(),
        }
    }
}

struct WorkerLogger {
    level: AtomicU8,
}

static LOGGER: WorkerLogger = WorkerLogger {
    level: AtomicU8::new(3), // info by default
};

impl Log for WorkerLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        let filter = Verbosity(self.level.load(Ordering::Relaxed)).to_filter();
        metadata.level() <= filter
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let secs = now.as_secs() % 86400;
        let millis = now.subsec_millis();
        let (h, m, s) = (secs / 3600, (secs / 60) % 60, secs % 60);
        let tag = match record.level() {
            Level::Error => "ERROR",
            Level::Warn => "WARN ",
            Level::Info => "INFO ",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };
        let mut stderr = std::io::stderr();
        let _ = writeln!(
            stderr,
            "[{tag} {h:02}:{m:02}:{s:02}.{millis:03}] {}",
            record.args()
        );
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

/// Install the global logger. Idempotent past the first call, like the
/// teacher's `OnceLock`-backed logger init.
pub fn init(verbosity: Verbosity) {
    set_level(verbosity);
    // `set_logger` fails if already installed (e.g. re-exec in tests); that
    // is not an error for us, the level atomic still takes effect.
    let _ = log::set_logger(&LOGGER).map(|()| log::set_max_level(LevelFilter::Trace));
}

/// Change the running worker's verbosity (the supervisor's runtime
/// "set log level" command, §6.4).
pub fn set_level(verbosity: Verbosity) {
    LOGGER.level.store(verbosity.0.min(4), Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_clamps_above_debug() {
        assert_eq!(Verbosity(9).to_filter(), LevelFilter::Debug);
    }

    #[test]
    fn verbosity_zero_maps_to_error_floor() {
        assert_eq!(Verbosity(0).to_filter(), LevelFilter::Error);
    }
}
