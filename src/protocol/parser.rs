//! Incremental line scanner for worker stdout.
//!
//! Pipe reads deliver arbitrary byte chunks: a chunk may end in the middle
//! of a line, in the middle of a marker token, or in the middle of a UTF-8
//! code point.  [`StreamProtocolParser`] buffers the unterminated tail and
//! only scans complete lines, so the decoded events do not depend on where
//! the chunk boundaries fell.
//!
//! Malformed marker payloads are dropped (with a log line) rather than
//! reported as errors: a noisy worker must never fail its own job.

use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::Value;

use super::event::ProtocolEvent;

// ---------------------------------------------------------------------------
// Marker table
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Marker {
    Progress,
    Partial,
    DepsInstalling,
    DepsDone,
}

struct MarkerRule {
    marker: Marker,
    pattern: Regex,
}

/// Markers may appear anywhere in a line so that log prefixes such as
/// `2024-01-01 12:00:00 INFO [PROGRESS] 40` still match.
fn marker_table() -> &'static [MarkerRule] {
    static TABLE: OnceLock<Vec<MarkerRule>> = OnceLock::new();
    TABLE.get_or_init(|| {
        [
            (Marker::Progress, r"\[PROGRESS\]\s*(\d+)?"),
            (Marker::Partial, r"\[PARTIAL\]\s*(.*)"),
            (Marker::DepsInstalling, r"\[DEPS_INSTALLING\]\s*(.*)"),
            (Marker::DepsDone, r"\[DEPS_DONE\]"),
        ]
        .into_iter()
        .map(|(marker, pattern)| MarkerRule {
            marker,
            pattern: Regex::new(pattern).expect("marker patterns are valid regexes"),
        })
        .collect()
    })
}

// ---------------------------------------------------------------------------
// StreamProtocolParser
// ---------------------------------------------------------------------------

/// Converts raw stdout/stderr chunks into [`ProtocolEvent`]s and accumulates
/// the complete output for envelope extraction and failure reports.
///
/// ```
/// use dubbing_pipeline::protocol::{ProtocolEvent, StreamProtocolParser};
///
/// let mut parser = StreamProtocolParser::new();
/// assert!(parser.push_stdout(b"[PROG").is_empty());
/// let events = parser.push_stdout(b"RESS] 42\n");
/// assert_eq!(events, vec![ProtocolEvent::Progress { percent: 42 }]);
/// assert_eq!(parser.stdout_text(), "[PROGRESS] 42\n");
/// ```
#[derive(Debug, Default)]
pub struct StreamProtocolParser {
    /// Bytes after the last newline seen so far.
    pending: Vec<u8>,
    /// Everything written to stdout, verbatim.
    stdout: Vec<u8>,
    /// Everything written to stderr, verbatim.
    stderr: Vec<u8>,
}

impl StreamProtocolParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one stdout chunk; returns the events for every line it completed.
    pub fn push_stdout(&mut self, chunk: &[u8]) -> Vec<ProtocolEvent> {
        self.stdout.extend_from_slice(chunk);

        // Only the newly appended bytes can contain a fresh newline.
        let mut search_from = self.pending.len();
        self.pending.extend_from_slice(chunk);

        let mut events = Vec::new();
        let mut consumed = 0;
        while let Some(rel) = self.pending[search_from..].iter().position(|&b| b == b'\n') {
            let end = search_from + rel;
            if let Some(event) = scan_line(&self.pending[consumed..end]) {
                events.push(event);
            }
            consumed = end + 1;
            search_from = consumed;
        }
        self.pending.drain(..consumed);
        events
    }

    /// Feed one stderr chunk.  Stderr is never scanned for markers.
    pub fn push_stderr(&mut self, chunk: &[u8]) {
        self.stderr.extend_from_slice(chunk);
    }

    /// Flush a trailing line that was never newline-terminated.
    ///
    /// Call once, after stdout reached EOF.
    pub fn finish(&mut self) -> Vec<ProtocolEvent> {
        let tail = std::mem::take(&mut self.pending);
        scan_line(&tail).into_iter().collect()
    }

    /// Accumulated stdout (lossy UTF-8).
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Accumulated stderr (lossy UTF-8).
    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

// ---------------------------------------------------------------------------
// Line decoding
// ---------------------------------------------------------------------------

fn scan_line(bytes: &[u8]) -> Option<ProtocolEvent> {
    let text = String::from_utf8_lossy(bytes);
    let line = text.trim_end_matches('\r');
    if line.trim().is_empty() {
        return None;
    }

    // When several markers appear on one line the left-most one wins.
    let found = marker_table()
        .iter()
        .filter_map(|rule| rule.pattern.captures(line).map(|caps| (rule.marker, caps)))
        .min_by_key(|(_, caps)| caps.get(0).map_or(usize::MAX, |m| m.start()));

    match found {
        None => Some(ProtocolEvent::Raw {
            text: line.to_string(),
        }),
        Some((marker, caps)) => decode_marker(marker, &caps),
    }
}

fn decode_marker(marker: Marker, caps: &Captures<'_>) -> Option<ProtocolEvent> {
    let payload = caps.get(1).map(|m| m.as_str().trim()).unwrap_or("");

    match marker {
        Marker::Progress => match payload.parse::<u64>() {
            Ok(value) => Some(ProtocolEvent::Progress {
                percent: value.min(100) as u8,
            }),
            Err(_) => {
                log::debug!("protocol: dropping malformed progress marker {payload:?}");
                None
            }
        },
        Marker::Partial => decode_partial(payload),
        Marker::DepsInstalling => Some(ProtocolEvent::DepsInstalling {
            package: payload.to_string(),
        }),
        Marker::DepsDone => Some(ProtocolEvent::DepsDone),
    }
}

fn decode_partial(payload: &str) -> Option<ProtocolEvent> {
    let fields = match serde_json::from_str::<Value>(payload) {
        Ok(Value::Object(fields)) => fields,
        Ok(other) => {
            log::warn!("protocol: partial result is not a JSON object: {other}");
            return None;
        }
        Err(e) => {
            log::warn!("protocol: failed to parse partial result ({e}): {payload}");
            return None;
        }
    };

    match fields.get("index").and_then(Value::as_u64) {
        Some(index) => Some(ProtocolEvent::PartialResult {
            index: index as usize,
            fields,
        }),
        None => {
            log::warn!("protocol: partial result without a usable index: {payload}");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const STREAM: &str = "loading weights\n\
                          [DEPS_INSTALLING] soundfile\n\
                          [DEPS_DONE]\n\
                          [PROGRESS] 10\n\
                          [PARTIAL] {\"index\": 1, \"text\": \"hola\"}\n\
                          INFO 12:00:01 [PROGRESS] 55\n\
                          __JSON_START__[]__JSON_END__\n";

    fn markers(events: Vec<ProtocolEvent>) -> Vec<ProtocolEvent> {
        events.into_iter().filter(ProtocolEvent::is_marker).collect()
    }

    fn parse_in_chunks(stream: &[u8], sizes: impl Iterator<Item = usize>) -> Vec<ProtocolEvent> {
        let mut parser = StreamProtocolParser::new();
        let mut events = Vec::new();
        let mut rest = stream;
        for size in sizes {
            if rest.is_empty() {
                break;
            }
            let (chunk, tail) = rest.split_at(size.min(rest.len()));
            events.extend(parser.push_stdout(chunk));
            rest = tail;
        }
        events.extend(parser.push_stdout(rest));
        events.extend(parser.finish());
        events
    }

    fn whole(stream: &[u8]) -> Vec<ProtocolEvent> {
        parse_in_chunks(stream, std::iter::empty())
    }

    // ---- chunk-boundary independence ---

    #[test]
    fn whole_stream_yields_expected_markers() {
        let events = markers(whole(STREAM.as_bytes()));
        assert_eq!(
            events,
            vec![
                ProtocolEvent::DepsInstalling {
                    package: "soundfile".into()
                },
                ProtocolEvent::DepsDone,
                ProtocolEvent::Progress { percent: 10 },
                ProtocolEvent::PartialResult {
                    index: 1,
                    fields: json!({"index": 1, "text": "hola"})
                        .as_object()
                        .cloned()
                        .unwrap(),
                },
                ProtocolEvent::Progress { percent: 55 },
            ]
        );
    }

    #[test]
    fn every_two_way_split_yields_the_same_events() {
        let bytes = STREAM.as_bytes();
        let expected = whole(bytes);
        for split in 0..=bytes.len() {
            let got = parse_in_chunks(bytes, std::iter::once(split));
            assert_eq!(got, expected, "split at byte {split}");
        }
    }

    #[test]
    fn byte_by_byte_yields_the_same_events() {
        let bytes = STREAM.as_bytes();
        let got = parse_in_chunks(bytes, std::iter::repeat(1));
        assert_eq!(got, whole(bytes));
    }

    #[test]
    fn split_inside_marker_token() {
        let mut parser = StreamProtocolParser::new();
        assert!(parser.push_stdout(b"[PROGR").is_empty());
        assert!(parser.push_stdout(b"ESS]").is_empty());
        assert_eq!(
            parser.push_stdout(b" 77\n"),
            vec![ProtocolEvent::Progress { percent: 77 }]
        );
    }

    #[test]
    fn split_inside_utf8_code_point_is_not_mangled() {
        let line = "[DEPS_INSTALLING] 依赖包\n".as_bytes();
        let mid = line.len() - 3; // inside the last CJK character
        let mut parser = StreamProtocolParser::new();
        let mut events = parser.push_stdout(&line[..mid]);
        events.extend(parser.push_stdout(&line[mid..]));
        assert_eq!(
            events,
            vec![ProtocolEvent::DepsInstalling {
                package: "依赖包".into()
            }]
        );
        assert_eq!(parser.stdout_text(), "[DEPS_INSTALLING] 依赖包\n");
    }

    // ---- individual markers ---

    #[test]
    fn malformed_progress_is_dropped() {
        let events = whole(b"[PROGRESS] abc\n[PROGRESS]\n");
        assert!(events.is_empty(), "got {events:?}");
    }

    #[test]
    fn progress_is_clamped_to_100() {
        assert_eq!(
            whole(b"[PROGRESS] 250\n"),
            vec![ProtocolEvent::Progress { percent: 100 }]
        );
    }

    #[test]
    fn progress_with_trailing_percent_sign() {
        assert_eq!(
            whole(b"[PROGRESS] 30%\n"),
            vec![ProtocolEvent::Progress { percent: 30 }]
        );
    }

    #[test]
    fn malformed_partial_is_dropped() {
        let events = whole(b"[PARTIAL] {not json\n[PARTIAL] [1,2]\n[PARTIAL] {\"text\":\"x\"}\n");
        assert!(events.is_empty(), "got {events:?}");
    }

    #[test]
    fn negative_partial_index_is_dropped() {
        assert!(whole(b"[PARTIAL] {\"index\": -1}\n").is_empty());
    }

    #[test]
    fn deps_done_ignores_trailing_text() {
        assert_eq!(whole(b"[DEPS_DONE] soundfile\n"), vec![ProtocolEvent::DepsDone]);
    }

    #[test]
    fn leftmost_marker_wins() {
        let events = whole(b"[PARTIAL] {\"index\": 0, \"text\": \"[PROGRESS] 5\"}\n");
        assert!(matches!(
            events.as_slice(),
            [ProtocolEvent::PartialResult { index: 0, .. }]
        ));
    }

    #[test]
    fn markers_are_case_sensitive() {
        assert_eq!(
            whole(b"[progress] 10\n"),
            vec![ProtocolEvent::Raw {
                text: "[progress] 10".into()
            }]
        );
    }

    #[test]
    fn crlf_line_endings_are_tolerated() {
        assert_eq!(
            whole(b"[PROGRESS] 12\r\nhello\r\n"),
            vec![
                ProtocolEvent::Progress { percent: 12 },
                ProtocolEvent::Raw {
                    text: "hello".into()
                },
            ]
        );
    }

    #[test]
    fn blank_lines_produce_nothing() {
        assert!(whole(b"\n\n   \n").is_empty());
    }

    // ---- accumulation ---

    #[test]
    fn finish_flushes_unterminated_line() {
        let mut parser = StreamProtocolParser::new();
        assert!(parser.push_stdout(b"[PROGRESS] 99").is_empty());
        assert_eq!(parser.finish(), vec![ProtocolEvent::Progress { percent: 99 }]);
        assert!(parser.finish().is_empty());
    }

    #[test]
    fn stdout_and_stderr_accumulate_separately() {
        let mut parser = StreamProtocolParser::new();
        parser.push_stdout(b"out [PROGRESS] 1\n");
        parser.push_stderr(b"Traceback\n");
        parser.push_stdout(b"tail");
        assert_eq!(parser.stdout_text(), "out [PROGRESS] 1\ntail");
        assert_eq!(parser.stderr_text(), "Traceback\n");
    }
}
