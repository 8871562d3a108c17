//! Structured output extraction from worker text.
//!
//! Workers emit human-readable markdown plus an optional machine-readable
//! JSON block between `===JSON_OUTPUT===` and `===JSON_OUTPUT_END===`.
//! Extraction is forgiving: a missing end marker, markdown code fences
//! around the block, or malformed JSON all degrade to `None` rather than
//! failing the phase.

pub const JSON_OUTPUT_START: &str = "===JSON_OUTPUT===";
pub const JSON_OUTPUT_END: &str = "===JSON_OUTPUT_END===";

/// Pull the structured JSON block out of raw worker output.
pub fn extract_json_output(raw: &str) -> Option<serde_json::Value> {
    let start = raw.find(JSON_OUTPUT_START)? + JSON_OUTPUT_START.len();
    let rest = &raw[start..];
    let body = match rest.find(JSON_OUTPUT_END) {
        Some(end) => &rest[..end],
        None => rest,
    };

    let body = strip_code_fence(body.trim());
    serde_json::from_str(body).ok()
}

/// Everything before the JSON delimiter, trimmed. Output with no block is
/// returned whole.
pub fn extract_markdown_output(raw: &str) -> &str {
    match raw.find(JSON_OUTPUT_START) {
        Some(idx) => raw[..idx].trim(),
        None => raw.trim(),
    }
}

fn strip_code_fence(body: &str) -> &str {
    let mut out = body;
    if let Some(rest) = out.strip_prefix("```") {
        // Drop the fence line, including an optional language tag.
        out = match rest.split_once('\n') {
            Some((_, after)) => after,
            None => rest.trim_start_matches("json"),
        };
    }
    out = out.trim_end();
    if let Some(rest) = out.strip_suffix("```") {
        out = rest.trim_end();
    }
    out.trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn extracts_delimited_json_block() {
        let raw = "## Findings\n\nroot cause X\n\n===JSON_OUTPUT===\n{\"confidence\": 0.8}\n===JSON_OUTPUT_END===\n";
        let value = extract_json_output(raw).unwrap();
        assert_eq!(value["confidence"], 0.8);
        assert_eq!(extract_markdown_output(raw), "## Findings\n\nroot cause X");
    }

    #[test]
    fn missing_end_marker_falls_back_to_tail() {
        let raw = "text\n===JSON_OUTPUT===\n[1, 2, 3]";
        let value = extract_json_output(raw).unwrap();
        assert_eq!(value, serde_json::json!([1, 2, 3]));
    }

    #[test]
    fn tolerates_markdown_code_fences() {
        let raw = "===JSON_OUTPUT===\n```json\n{\"ok\": true}\n```\n===JSON_OUTPUT_END===";
        let value = extract_json_output(raw).unwrap();
        assert_eq!(value["ok"], true);
    }

    #[test]
    fn absent_or_malformed_block_yields_none() {
        assert!(extract_json_output("plain markdown only").is_none());
        assert!(extract_json_output("===JSON_OUTPUT===\nnot json at all").is_none());
        assert_eq!(extract_markdown_output("  plain  "), "plain");
    }
}
