// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Single-frame JPEG snapshot capture (§4.6, §6.1 `snapshot=1`).
//!
//! The payload this gateway forwards is otherwise opaque bytes
//! (`crate::rtp` parses only the fixed header, never the media itself);
//! snapshot capture is the one named exception, allowed to look for the
//! first I-frame boundary. The H.264 Annex-B byte stream embeds NAL unit
//! boundaries as plain start codes (`00 00 01` or `00 00 00 01`), so finding
//! one needs no real MPEG-TS demux or H.264 parse — just a scan for a start
//! code followed by a NAL header byte whose type is 5 (IDR slice). Once
//! found, bytes from that point on are buffered up to
//! [`CAPTURE_WINDOW_BYTES`], then piped through an external decoder
//! (`ffmpeg-path`, §6.3) once, synchronously, and served back as whatever
//! single JPEG frame it produces. This blocks the worker for the decoder's
//! run time, unlike every other code path in this crate — acceptable
//! because it happens once per snapshot request rather than once per
//! packet, and because there is no decoder in this crate capable of
//! producing a frame any other way.

use std::io::{self, Read, Write};
use std::process::{Command, Stdio};

/// How much of the incoming MPEG-TS stream to buffer, starting at the first
/// IDR frame found, before attempting a capture. Large enough to almost
/// certainly contain a handful of decodable frames at typical IPTV
/// bitrates, without holding the worker's buffer pool hostage indefinitely
/// if the decoder never gets a usable frame.
pub const CAPTURE_WINDOW_BYTES: usize = 1024 * 1024;

/// Accumulates a client's media bytes, discarding everything before the
/// first I-frame boundary, until [`CAPTURE_WINDOW_BYTES`] past that point
/// is reached — at which point the caller should hand the buffer to
/// [`capture_jpeg`] and stop forwarding ordinary media to this client.
pub struct SnapshotCapture {
    buffered: Vec<u8>,
    ready: bool,
    found_idr: bool,
    /// Last few bytes of the most recent chunk that didn't contain an IDR,
    /// carried forward so a start code split across two `push` calls is
    /// still found.
    scan_tail: Vec<u8>,
}

impl SnapshotCapture {
    pub fn new() -> Self {
        SnapshotCapture {
            buffered: Vec::with_capacity(CAPTURE_WINDOW_BYTES.min(64 * 1024)),
            ready: false,
            found_idr: false,
            scan_tail: Vec::new(),
        }
    }

    /// Append more stream bytes. Returns `true` once the capture window is
    /// full and the caller should invoke the capture. Bytes that arrive
    /// before the first IDR slice is found are scanned but not buffered.
    pub fn push(&mut self, bytes: &[u8]) -> bool {
        if self.ready {
            return true;
        }
        if !self.found_idr {
            let mut scan = std::mem::take(&mut self.scan_tail);
            scan.extend_from_slice(bytes);
            match find_idr_start(&scan) {
                Some(idr_pos) => {
                    self.found_idr = true;
                    self.buffered.extend_from_slice(&scan[idr_pos..]);
                }
                None => {
                    let keep = scan.len().min(3);
                    self.scan_tail = scan[scan.len() - keep..].to_vec();
                    return false;
                }
            }
        } else {
            self.buffered.extend_from_slice(bytes);
        }
        if self.buffered.len() >= CAPTURE_WINDOW_BYTES {
            self.ready = true;
        }
        self.ready
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffered
    }
}

impl Default for SnapshotCapture {
    fn default() -> Self {
        Self::new()
    }
}

/// Find the first H.264 IDR slice NAL unit (an Annex-B start code followed
/// by a NAL header byte with type 5) in `scan`, returning the offset of its
/// start code.
fn find_idr_start(scan: &[u8]) -> Option<usize> {
    let mut i = 0;
    while i < scan.len() {
        let three = scan.get(i..i + 3) == Some(&[0, 0, 1][..]);
        let four = !three && scan.get(i..i + 4) == Some(&[0, 0, 0, 1][..]);
        if !three && !four {
            i += 1;
            continue;
        }
        let nal_idx = i + if three { 3 } else { 4 };
        match scan.get(nal_idx) {
            Some(&b) if b & 0x1F == 5 => return Some(i),
            Some(_) => i = nal_idx,
            None => break,
        }
    }
    None
}

/// Spawn `ffmpeg_path` to decode one JPEG frame out of `mpegts`, extra
/// `ffmpeg_args` (whitespace-split, §6.3) appended after the fixed flags.
/// Feeds stdin from a writer thread so a decoder that starts producing
/// output before it has consumed the whole input cannot deadlock the pipe.
pub fn capture_jpeg(ffmpeg_path: &str, ffmpeg_args: Option<&str>, mpegts: Vec<u8>) -> io::Result<Vec<u8>> {
    let mut cmd = Command::new(ffmpeg_path);
    cmd.args(["-i", "pipe:0", "-frames:v", "1", "-f", "image2", "-vcodec", "mjpeg"]);
    if let Some(extra) = ffmpeg_args {
        cmd.args(extra.split_whitespace());
    }
    cmd.arg("pipe:1")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    let mut child = cmd.spawn()?;
    let mut stdin = child.stdin.take().expect("stdin piped above");
    let writer = std::thread::spawn(move || {
        let _ = stdin.write_all(&mpegts);
    });

    let mut jpeg = Vec::new();
    child
        .stdout
        .take()
        .expect("stdout piped above")
        .read_to_end(&mut jpeg)?;
    let _ = writer.join();
    let status = child.wait()?;

    if !status.success() || jpeg.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            "ffmpeg produced no snapshot frame",
        ));
    }
    Ok(jpeg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idr_nal(payload_len: usize) -> Vec<u8> {
        let mut nal = vec![0, 0, 0, 1, 0x65];
        nal.extend(std::iter::repeat(0xAAu8).take(payload_len));
        nal
    }

    #[test]
    fn capture_window_fills_exactly_once_from_idr() {
        let mut cap = SnapshotCapture::new();
        let idr = idr_nal(CAPTURE_WINDOW_BYTES / 4 - 5);
        let chunk = vec![0u8; CAPTURE_WINDOW_BYTES / 4];
        assert!(!cap.push(&idr));
        assert!(!cap.push(&chunk));
        assert!(!cap.push(&chunk));
        assert!(cap.push(&chunk));
        assert!(cap.is_ready());
        assert_eq!(cap.into_bytes().len(), CAPTURE_WINDOW_BYTES);
    }

    #[test]
    fn bytes_before_idr_are_discarded_not_buffered() {
        let mut cap = SnapshotCapture::new();
        let junk = vec![0x42u8; 4096];
        assert!(!cap.push(&junk));
        assert!(!cap.push(&junk));
        let idr = idr_nal(CAPTURE_WINDOW_BYTES);
        assert!(cap.push(&idr));
        let bytes = cap.into_bytes();
        assert!(bytes.len() >= CAPTURE_WINDOW_BYTES);
        assert_eq!(&bytes[..5], &[0, 0, 0, 1, 0x65]);
    }

    #[test]
    fn start_code_split_across_pushes_is_still_found() {
        let mut cap = SnapshotCapture::new();
        let idr = idr_nal(CAPTURE_WINDOW_BYTES);
        let (first, second) = idr.split_at(2);
        assert!(!cap.push(first));
        assert!(cap.push(second));
        assert!(cap.into_bytes().len() >= CAPTURE_WINDOW_BYTES);
    }

    #[test]
    fn no_idr_never_becomes_ready() {
        let mut cap = SnapshotCapture::new();
        let junk = vec![0x42u8; CAPTURE_WINDOW_BYTES * 2];
        assert!(!cap.push(&junk));
        assert!(!cap.is_ready());
    }

    #[test]
    fn missing_ffmpeg_binary_errors_instead_of_panicking() {
        let result = capture_jpeg("/nonexistent/ffmpeg-binary-for-tests", None, vec![0u8; 16]);
        assert!(result.is_err());
    }
}
