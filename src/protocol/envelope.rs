//! Final-result envelope extraction.

use serde_json::Value;

/// Opening sentinel of the final JSON payload.
pub const JSON_START: &str = "__JSON_START__";
/// Closing sentinel of the final JSON payload.
pub const JSON_END: &str = "__JSON_END__";

/// What [`extract_envelope`] found in a worker's stdout.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// Both sentinels present and the text between them parsed as JSON.
    Payload(Value),
    /// One or both sentinels are missing (e.g. the worker crashed mid-output).
    Missing,
    /// Both sentinels present but the enclosed text is not valid JSON.
    Malformed { error: String },
}

/// Locate the first `__JSON_START__` and the first `__JSON_END__` after it,
/// and parse the trimmed text in between.
///
/// ```
/// use dubbing_pipeline::protocol::{extract_envelope, Envelope};
/// use serde_json::json;
///
/// let out = "log line\n__JSON_START__{\"ok\": true}__JSON_END__\n";
/// assert_eq!(extract_envelope(out), Envelope::Payload(json!({"ok": true})));
/// assert_eq!(extract_envelope("no sentinels here"), Envelope::Missing);
/// ```
pub fn extract_envelope(stdout: &str) -> Envelope {
    let Some(start) = stdout.find(JSON_START) else {
        return Envelope::Missing;
    };
    let body_start = start + JSON_START.len();
    let Some(len) = stdout[body_start..].find(JSON_END) else {
        return Envelope::Missing;
    };

    let body = stdout[body_start..body_start + len].trim();
    match serde_json::from_str(body) {
        Ok(value) => Envelope::Payload(value),
        Err(e) => Envelope::Malformed {
            error: e.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payload_between_sentinels_is_parsed() {
        let out = "[PROGRESS] 100\n__JSON_START__\n[{\"start\":0,\"end\":1,\"text\":\"hi\"}]\n__JSON_END__\n";
        assert_eq!(
            extract_envelope(out),
            Envelope::Payload(json!([{"start": 0, "end": 1, "text": "hi"}]))
        );
    }

    #[test]
    fn missing_start_is_missing() {
        assert_eq!(extract_envelope("{}__JSON_END__"), Envelope::Missing);
    }

    #[test]
    fn missing_end_is_missing() {
        assert_eq!(extract_envelope("__JSON_START__{}"), Envelope::Missing);
    }

    #[test]
    fn end_before_start_is_missing() {
        assert_eq!(
            extract_envelope("__JSON_END__ junk __JSON_START__{}"),
            Envelope::Missing
        );
    }

    #[test]
    fn invalid_json_is_malformed() {
        assert!(matches!(
            extract_envelope("__JSON_START__{oops__JSON_END__"),
            Envelope::Malformed { .. }
        ));
    }

    #[test]
    fn first_envelope_wins() {
        let out = "__JSON_START__1__JSON_END__ __JSON_START__2__JSON_END__";
        assert_eq!(extract_envelope(out), Envelope::Payload(json!(1)));
    }
}
