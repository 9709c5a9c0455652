//! SSE line parsing, generalized from the teacher's Anthropic-dialect
//! accumulator (`proxy/sse/mod.rs`) to OpenAI-dialect `usage` objects: every
//! back-end this crate fronts speaks OpenAI-shaped streaming chunks, each
//! carrying its own `usage` field on the final chunk rather than a single
//! terminal `message_delta` event.

use serde_json::Value;

pub fn is_sse_content_type(content_type: Option<&str>) -> bool {
    content_type
        .map(|ct| ct.contains("text/event-stream"))
        .unwrap_or(false)
}

/// Parse one `data: {...}` SSE line into its JSON payload. `data: [DONE]`
/// and non-`data:` lines yield `None`.
pub fn parse_data_line(line: &str) -> Option<Value> {
    let json_str = line.trim().strip_prefix("data:")?.trim();
    if json_str.is_empty() || json_str == "[DONE]" {
        return None;
    }
    serde_json::from_str(json_str).ok()
}

/// Token usage pulled from an OpenAI-dialect streamed or buffered response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    fn from_value(usage: &Value) -> Option<Self> {
        let prompt_tokens = usage.get("prompt_tokens")?.as_u64()?;
        let completion_tokens = usage.get("completion_tokens")?.as_u64()?;
        Some(Self {
            prompt_tokens,
            completion_tokens,
        })
    }
}

/// Scan a full SSE body for the last chunk that carries a non-null `usage`
/// object (most OpenAI-compatible back-ends only populate it on the final
/// chunk when `stream_options.include_usage` is set, but scanning for the
/// last occurrence is robust to back-ends that repeat it).
pub fn extract_usage_from_stream(body: &str) -> Option<TokenUsage> {
    let mut found = None;
    for line in body.lines() {
        let Some(data) = parse_data_line(line) else {
            continue;
        };
        if let Some(usage) = data.get("usage").filter(|u| !u.is_null()) {
            if let Some(parsed) = TokenUsage::from_value(usage) {
                found = Some(parsed);
            }
        }
    }
    found
}

/// Extract usage from a single buffered (non-streaming) JSON response body.
pub fn extract_usage_from_json(body: &Value) -> Option<TokenUsage> {
    body.get("usage").and_then(TokenUsage::from_value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_data_line() {
        let line = r#"data: {"id":"1","usage":null}"#;
        let value = parse_data_line(line).unwrap();
        assert_eq!(value["id"], "1");
    }

    #[test]
    fn ignores_done_sentinel() {
        assert!(parse_data_line("data: [DONE]").is_none());
    }

    #[test]
    fn extracts_usage_from_final_chunk() {
        let body = concat!(
            "data: {\"id\":\"1\",\"usage\":null}\n\n",
            "data: {\"id\":\"1\",\"usage\":{\"prompt_tokens\":10,\"completion_tokens\":5}}\n\n",
            "data: [DONE]\n\n",
        );
        let usage = extract_usage_from_stream(body).unwrap();
        assert_eq!(usage.prompt_tokens, 10);
        assert_eq!(usage.completion_tokens, 5);
    }

    #[test]
    fn extracts_usage_from_buffered_json() {
        let body = serde_json::json!({"usage": {"prompt_tokens": 3, "completion_tokens": 7}});
        let usage = extract_usage_from_json(&body).unwrap();
        assert_eq!(usage.prompt_tokens, 3);
        assert_eq!(usage.completion_tokens, 7);
    }
}
