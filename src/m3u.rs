// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! M3U playlist parsing and proxy-URL rewriting (§6.1 `/playlist.m3u`,
//! §8 round-trip property, §9 "external collaborators").
//!
//! Only the subset of the M3U/M3U8 grammar this gateway needs is handled:
//! `#EXTM3U` header, `#EXTINF:<duration>,<title>` entries, and a URL line.
//! Anything else (additional `#EXT-X-*` tags) is passed through verbatim
//! attached to the following channel entry, since rewriting only ever
//! touches the URL line itself.

use std::fmt::Write as _;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub extinf_duration: String,
    pub title: String,
    pub extra_tags: Vec<String>,
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Playlist {
    pub channels: Vec<Channel>,
}

/// Parse an M3U document. Lines this gateway doesn't recognize inside an
/// entry (extra `#EXT-X-*` tags) are kept verbatim and re-emitted ahead of
/// the URL line on rewrite.
pub fn parse(input: &str) -> Playlist {
    let mut channels = Vec::new();
    let mut pending_extinf: Option<(String, String)> = None;
    let mut pending_extra: Vec<String> = Vec::new();

    for raw_line in input.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line == "#EXTM3U" {
            continue;
        }
        if let Some(rest) = line.strip_prefix("#EXTINF:") {
            let (duration, title) = match rest.split_once(',') {
                Some((d, t)) => (d.to_string(), t.to_string()),
                None => (rest.to_string(), String::new()),
            };
            pending_extinf = Some((duration, title));
        } else if let Some(stripped) = line.strip_prefix('#') {
            pending_extra.push(format!("#{stripped}"));
        } else {
            // URL line: finalize the pending entry.
            let (duration, title) = pending_extinf.take().unwrap_or_default();
            channels.push(Channel {
                extinf_duration: duration,
                title,
                extra_tags: std::mem::take(&mut pending_extra),
                url: line.to_string(),
            });
        }
    }

    Playlist { channels }
}

/// Render a playlist back to M3U text.
pub fn render(playlist: &Playlist) -> String {
    let mut out = String::from("#EXTM3U\n");
    for channel in &playlist.channels {
        for tag in &channel.extra_tags {
            let _ = writeln!(out, "{tag}");
        }
        let _ = writeln!(out, "#EXTINF:{},{}", channel.extinf_duration, channel.title);
        let _ = writeln!(out, "{}", channel.url);
    }
    out
}

/// Rewrite every upstream URL this gateway knows how to proxy
/// (`rtp://`, `udp://`, `rtsp://`) into a `/rtp/`, `/udp/`, or `/rtsp/`
/// path under `base_url`. URLs in any other scheme (already `http(s)://`,
/// or something this gateway doesn't bridge) are left untouched, per §8's
/// "external URLs preserved verbatim".
pub fn rewrite_proxied(playlist: &Playlist, base_url: &str) -> Playlist {
    let channels = playlist
        .channels
        .iter()
        .map(|c| Channel {
            url: proxy_url(&c.url, base_url),
            ..c.clone()
        })
        .collect();
    Playlist { channels }
}

fn proxy_url(url: &str, base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if let Some(rest) = url.strip_prefix("rtp://") {
        format!("{base}/rtp/{rest}")
    } else if let Some(rest) = url.strip_prefix("udp://") {
        format!("{base}/udp/{rest}")
    } else if let Some(rest) = url.strip_prefix("rtsp://") {
        format!("{base}/rtsp/{rest}")
    } else {
        url.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "#EXTM3U\n\
#EXTINF:-1,Channel One\n\
rtp://239.1.1.1:5000\n\
#EXTINF:-1,Channel Two\n\
http://example.com/already-external.m3u8\n";

    #[test]
    fn parses_entries_with_titles_and_urls() {
        let playlist = parse(SAMPLE);
        assert_eq!(playlist.channels.len(), 2);
        assert_eq!(playlist.channels[0].title, "Channel One");
        assert_eq!(playlist.channels[0].url, "rtp://239.1.1.1:5000");
    }

    #[test]
    fn round_trip_preserves_channel_set_after_proxy_rewrite() {
        let original = parse(SAMPLE);
        let proxied = rewrite_proxied(&original, "http://gateway.local:8080");
        let rendered = render(&proxied);
        let reparsed = parse(&rendered);

        assert_eq!(reparsed.channels.len(), original.channels.len());
        assert_eq!(
            reparsed.channels[0].url,
            "http://gateway.local:8080/rtp/239.1.1.1:5000"
        );
        // External (already-http) URL preserved verbatim.
        assert_eq!(
            reparsed.channels[1].url,
            "http://example.com/already-external.m3u8"
        );
        assert_eq!(reparsed.channels[1].title, original.channels[1].title);
    }

    #[test]
    fn extra_tags_survive_rewrite() {
        let input = "#EXTM3U\n#EXTGRP:News\n#EXTINF:-1,Ch\nudp://239.1.1.1:6000\n";
        let playlist = parse(input);
        assert_eq!(playlist.channels[0].extra_tags, vec!["#EXTGRP:News"]);
        let rendered = render(&playlist);
        assert!(rendered.contains("#EXTGRP:News"));
    }
}
