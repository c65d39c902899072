//! Server-sent-event relay helpers for the Messages dialect (§4.5, §6).
//!
//! Streaming is a pure passthrough: one SSE event per upstream chunk, with
//! the event name equal to the chunk's `type` field and the data payload the
//! chunk verbatim. This module only owns framing — the pipeline owns the
//! upstream byte stream itself.

use provider::ErrorTaxonomy;

/// Frame a single upstream chunk as `event: <type>\ndata: <json>\n\n`.
///
/// Chunks with no recognizable `type` field fall back to a bare `data:`
/// line (valid SSE without a named event).
pub fn frame_chunk(chunk: &serde_json::Value) -> String {
    match chunk.get("type").and_then(|t| t.as_str()) {
        Some(event_type) => format!("event: {event_type}\ndata: {chunk}\n\n"),
        None => format!("data: {chunk}\n\n"),
    }
}

/// Frame a mid-stream failure: an optional `retry:` hint followed by an
/// `event: error` carrying the classified error envelope.
pub fn frame_error(error: &ErrorTaxonomy) -> String {
    let mut out = String::new();
    if let ErrorTaxonomy::Overloaded {
        retry_after_secs, ..
    } = error
    {
        out.push_str(&format!("retry: {}\n", retry_after_secs * 1000));
    }
    let body = serde_json::json!({
        "type": "error",
        "error": error.to_envelope(),
    });
    out.push_str(&format!("event: error\ndata: {body}\n\n"));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_chunk_uses_type_as_event_name() {
        let chunk = serde_json::json!({"type": "content_block_delta", "index": 0});
        let framed = frame_chunk(&chunk);
        assert!(framed.starts_with("event: content_block_delta\n"));
        assert!(framed.ends_with("\n\n"));
    }

    #[test]
    fn frame_chunk_without_type_is_bare_data() {
        let chunk = serde_json::json!({"foo": "bar"});
        let framed = frame_chunk(&chunk);
        assert!(framed.starts_with("data: "));
        assert!(!framed.contains("event:"));
    }

    #[test]
    fn frame_error_includes_retry_for_overloaded() {
        let error = ErrorTaxonomy::Overloaded {
            message: "reset after 2m0s".to_string(),
            retry_after_secs: 120,
        };
        let framed = frame_error(&error);
        assert!(framed.starts_with("retry: 120000\n"));
        assert!(framed.contains("event: error"));
        assert!(framed.contains("overloaded_error"));
    }

    #[test]
    fn frame_error_without_retry_for_non_overloaded() {
        let error = ErrorTaxonomy::Api {
            message: "boom".to_string(),
            status: 500,
        };
        let framed = frame_error(&error);
        assert!(!framed.contains("retry:"));
        assert!(framed.starts_with("event: error"));
    }
}
