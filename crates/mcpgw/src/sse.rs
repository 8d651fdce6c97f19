//! Shared SSE wire-format helpers used by both the per-service reverse proxy
//! and the fan-in session subscriber. Both read an upstream `text/event-stream`
//! body line by line and react to `event: ` / `data: ` prefixes; they differ
//! only in what happens to the parsed line (forward-and-rewrite vs.
//! record-and-enqueue), so the line classification lives here once.

#[derive(Debug, PartialEq, Eq)]
pub enum SseLine {
    /// `event: <name>`
    Event(String),
    /// `data: <payload>`
    Data(String),
    /// Any other non-empty line, emitted verbatim by callers that forward it.
    Other(String),
    /// A blank line (record separator); callers typically skip these since
    /// the `\n\n` terminator is re-synthesized on `data:` emission.
    Blank,
}

pub fn classify_line(raw: &str) -> SseLine {
    let line = raw.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
        return SseLine::Blank;
    }
    if let Some(name) = line.strip_prefix("event: ") {
        return SseLine::Event(name.to_string());
    }
    if let Some(payload) = line.strip_prefix("data: ") {
        return SseLine::Data(payload.to_string());
    }
    SseLine::Other(line.to_string())
}

/// Whether a response's `Content-Type` header value denotes an SSE stream.
pub fn is_event_stream(content_type: Option<&str>) -> bool {
    content_type
        .map(|ct| ct.contains("text/event-stream"))
        .unwrap_or(false)
}

/// If `event` is `"endpoint"` and `data` begins with `/message`, rewrite it to
/// be reachable through the gateway under `/<service_name>/...`. Otherwise
/// return `data` unchanged.
pub fn rewrite_endpoint_data(service_name: &str, event: Option<&str>, data: &str) -> String {
    if event == Some("endpoint") && data.starts_with("/message") {
        format!("/{service_name}{data}")
    } else {
        data.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_event_line() {
        assert_eq!(
            classify_line("event: endpoint\n"),
            SseLine::Event("endpoint".to_string())
        );
    }

    #[test]
    fn classifies_data_line() {
        assert_eq!(
            classify_line("data: {\"k\":1}\n"),
            SseLine::Data("{\"k\":1}".to_string())
        );
    }

    #[test]
    fn classifies_blank_line() {
        assert_eq!(classify_line("\n"), SseLine::Blank);
        assert_eq!(classify_line(""), SseLine::Blank);
    }

    #[test]
    fn classifies_other_line_verbatim() {
        assert_eq!(
            classify_line(": keepalive\n"),
            SseLine::Other(": keepalive".to_string())
        );
    }

    #[test]
    fn is_event_stream_matches_substring() {
        assert!(is_event_stream(Some("text/event-stream; charset=utf-8")));
        assert!(!is_event_stream(Some("application/json")));
        assert!(!is_event_stream(None));
    }

    #[test]
    fn rewrite_endpoint_data_adds_service_prefix() {
        assert_eq!(
            rewrite_endpoint_data("svc", Some("endpoint"), "/message?sessionId=abc"),
            "/svc/message?sessionId=abc"
        );
    }

    #[test]
    fn rewrite_endpoint_data_leaves_non_endpoint_events_alone() {
        assert_eq!(
            rewrite_endpoint_data("svc", Some("tool"), "{\"k\":1}"),
            "{\"k\":1}"
        );
    }

    #[test]
    fn rewrite_endpoint_data_leaves_non_message_paths_alone() {
        assert_eq!(
            rewrite_endpoint_data("svc", Some("endpoint"), "/other"),
            "/other"
        );
    }
}
