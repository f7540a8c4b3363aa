use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

// ── Defensive JSON recovery from completion text ───────────────────────────
//
// Completion endpoints do not reliably emit pure JSON even when instructed
// to. Responses arrive as plain JSON, JSON inside a markdown fence, JSON
// after a label like "Output:", or buried under reasoning wrapped in
// <think>...</think> tags. The ladder below tries the strictest reading
// first and loosens one step at a time.

/// No strategy in the extraction ladder produced parseable JSON.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Could not extract valid JSON from response")]
pub struct ExtractionFailure;

/// Matches one complete reasoning block, across newlines, non-greedy so
/// sibling blocks are removed independently.
static REASONING_BLOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<think>.*?</think>").expect("reasoning block regex"));

/// Matches a code fence (optionally tagged `json`) wrapping the first
/// object-looking span inside it.
static FENCED_OBJECT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("fenced object regex")
});

/// Labels some models put in front of their final answer. Checked in this
/// order; the first label present in the text wins.
const OUTPUT_MARKERS: [&str; 4] = ["Output:", "Result:", "Response:", "JSON:"];

/// Remove every paired `<think>...</think>` block and trim the result.
///
/// Unpaired or malformed delimiters are left alone, and a string with no
/// blocks comes back unchanged, so the function is idempotent.
pub fn strip_reasoning_blocks(text: &str) -> String {
    if !text.contains("<think>") {
        return text.to_string();
    }
    let stripped = REASONING_BLOCK_RE.replace_all(text, "");
    tracing::debug!(
        removed = text.len() - stripped.len(),
        "stripped reasoning blocks"
    );
    stripped.trim().to_string()
}

/// Recover a JSON value from completion text.
///
/// Strategies, first success wins:
/// 1. parse the trimmed text whole
/// 2. parse the contents of a ```json fence
/// 3. parse the first balanced `{...}`/`[...]` span (string-aware scan)
/// 4. parse what follows an output marker, retrying the balanced scan on
///    that tail
pub fn extract_json(text: &str) -> Result<Value, ExtractionFailure> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ExtractionFailure);
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }

    if let Some(caps) = FENCED_OBJECT_RE.captures(trimmed) {
        if let Ok(value) = serde_json::from_str::<Value>(&caps[1]) {
            tracing::debug!(strategy = "fenced_block", "recovered JSON from code fence");
            return Ok(value);
        }
    }

    if let Some(span) = first_balanced_span(trimmed) {
        if let Ok(value) = serde_json::from_str::<Value>(span) {
            tracing::debug!(strategy = "brace_scan", "recovered JSON from balanced span");
            return Ok(value);
        }
    }

    if let Some(tail) = text_after_marker(trimmed) {
        let tail = tail.trim();
        if let Ok(value) = serde_json::from_str::<Value>(tail) {
            tracing::debug!(strategy = "marker", "recovered JSON after output marker");
            return Ok(value);
        }
        if let Some(span) = first_balanced_span(tail) {
            if let Ok(value) = serde_json::from_str::<Value>(span) {
                tracing::debug!(strategy = "marker_brace_scan", "recovered JSON after marker");
                return Ok(value);
            }
        }
    }

    tracing::debug!(len = text.len(), "no extraction strategy produced JSON");
    Err(ExtractionFailure)
}

/// Extraction for model families that emit explicit reasoning blocks.
///
/// Runs the ladder on the raw text first (some models produce clean JSON
/// even with reasoning elsewhere in the output), then strips reasoning
/// blocks and tries again: direct parse first, full ladder second.
pub fn extract_json_with_reasoning(text: &str) -> Result<Value, ExtractionFailure> {
    if let Ok(value) = extract_json(text) {
        return Ok(value);
    }

    let stripped = strip_reasoning_blocks(text);
    if let Ok(value) = serde_json::from_str::<Value>(&stripped) {
        return Ok(value);
    }
    extract_json(&stripped)
}

/// Non-throwing variant: extraction failure yields the caller's fallback.
///
/// The parsed value is returned as-is on success; shape validation against
/// the fallback is the caller's job.
pub fn extract_json_or(text: &str, fallback: Value) -> Value {
    match extract_json(text) {
        Ok(value) => value,
        Err(_) => {
            tracing::debug!("extraction failed, returning fallback value");
            fallback
        }
    }
}

/// Find the first balanced top-level `{...}` or `[...]` span.
///
/// Tracks quoted strings and backslash escapes so brace characters inside
/// string values do not throw off the depth count. A mismatched closer
/// resets the scan rather than aborting it.
fn first_balanced_span(text: &str) -> Option<&str> {
    let mut stack: Vec<char> = Vec::new();
    let mut start: Option<usize> = None;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }

        match ch {
            // Quotes only matter inside a candidate span; prose quotes
            // before the first bracket must not swallow it.
            '"' if !stack.is_empty() => in_string = true,
            '{' | '[' => {
                if stack.is_empty() {
                    start = Some(i);
                }
                stack.push(ch);
            }
            '}' | ']' => {
                let Some(open) = stack.pop() else {
                    continue;
                };
                let matched = (open == '{' && ch == '}') || (open == '[' && ch == ']');
                if !matched {
                    stack.clear();
                    start = None;
                    continue;
                }
                if stack.is_empty() {
                    if let Some(s) = start {
                        return Some(&text[s..i + ch.len_utf8()]);
                    }
                }
            }
            _ => {}
        }
    }

    None
}

/// Everything after the first output marker present in the text, checked
/// in `OUTPUT_MARKERS` order.
fn text_after_marker(text: &str) -> Option<&str> {
    OUTPUT_MARKERS
        .iter()
        .find_map(|marker| text.find(marker).map(|i| &text[i + marker.len()..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_direct_parse_with_whitespace() {
        let value = extract_json("  \n {\"a\": 1} \n ").unwrap();
        assert_eq!(value, json!({"a": 1}));
    }

    #[test]
    fn test_direct_parse_array_and_primitives() {
        assert_eq!(extract_json("[1, 2, 3]").unwrap(), json!([1, 2, 3]));
        assert_eq!(extract_json("42").unwrap(), json!(42));
        assert_eq!(extract_json("\"hi\"").unwrap(), json!("hi"));
    }

    #[test]
    fn test_fenced_block_with_json_tag() {
        let text = "Here you go:\n```json\n{\"a\":1}\n```";
        assert_eq!(extract_json(text).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn test_fenced_block_without_tag() {
        let text = "Sure:\n```\n{\"ok\": true}\n```\nLet me know!";
        assert_eq!(extract_json(text).unwrap(), json!({"ok": true}));
    }

    #[test]
    fn test_brace_scan_ignores_braces_in_strings() {
        let text = "The result is {\"text\": \"use { and } freely\", \"n\": 2} as requested";
        let value = extract_json(text).unwrap();
        assert_eq!(value, json!({"text": "use { and } freely", "n": 2}));
    }

    #[test]
    fn test_brace_scan_nested_object() {
        let text = "prefix {\"outer\": {\"inner\": [1, 2]}} suffix";
        assert_eq!(
            extract_json(text).unwrap(),
            json!({"outer": {"inner": [1, 2]}})
        );
    }

    #[test]
    fn test_brace_scan_picks_first_of_multiple_objects() {
        let text = "a {\"first\": 1} b {\"second\": 2}";
        assert_eq!(extract_json(text).unwrap(), json!({"first": 1}));
    }

    #[test]
    fn test_marker_prefixed_output() {
        let text = "Reasoning...\nOutput: {\"score\":5}";
        assert_eq!(extract_json(text).unwrap(), json!({"score": 5}));
    }

    #[test]
    fn test_marker_without_braces() {
        // No object anywhere, so only the marker strategy can recover this.
        let text = "Reasoning without any braces\nOutput: 42";
        assert_eq!(extract_json(text).unwrap(), json!(42));
    }

    #[test]
    fn test_marker_order_prefers_output_label() {
        // Both labels present; "Output:" is checked first regardless of
        // which appears earlier in the text.
        let text = "Response: nope\nOutput: 7";
        assert_eq!(extract_json(text).unwrap(), json!(7));
    }

    #[test]
    fn test_no_json_fails_with_fixed_message() {
        let err = extract_json("I cannot help with that.").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Could not extract valid JSON from response"
        );
    }

    #[test]
    fn test_empty_input_fails() {
        assert!(extract_json("").is_err());
        assert!(extract_json("   \n\t ").is_err());
    }

    #[test]
    fn test_strip_reasoning_blocks() {
        let text = "<think>let me consider...</think>\n{\"ok\":true}";
        assert_eq!(strip_reasoning_blocks(text), "{\"ok\":true}");
    }

    #[test]
    fn test_strip_is_noop_without_blocks() {
        let text = "{\"ok\":true}";
        assert_eq!(strip_reasoning_blocks(text), text);
    }

    #[test]
    fn test_strip_is_idempotent() {
        let text = "<think>a</think>keep<think>b\nmultiline</think>";
        let once = strip_reasoning_blocks(text);
        assert_eq!(once, "keep");
        assert_eq!(strip_reasoning_blocks(&once), once);
    }

    #[test]
    fn test_strip_leaves_unpaired_delimiters() {
        let text = "<think>never closed {\"a\": 1}";
        assert_eq!(strip_reasoning_blocks(text), text);
    }

    #[test]
    fn test_reasoning_aware_extraction() {
        let text = "<think>let me consider...</think>\n{\"ok\":true}";
        assert_eq!(
            extract_json_with_reasoning(text).unwrap(),
            json!({"ok": true})
        );
    }

    #[test]
    fn test_reasoning_aware_fails_when_nothing_left() {
        let text = "<think>no json here at all</think>\nThe answer is plain text.";
        assert!(extract_json_with_reasoning(text).is_err());
    }

    #[test]
    fn test_reasoning_aware_needs_strip_to_succeed() {
        // The unbalanced brace inside the reasoning block defeats the raw
        // ladder; stripping the block first recovers the payload.
        let text = "<think>consider {\"a\": broken</think> {\"ok\": true}";
        assert!(extract_json(text).is_err());
        assert_eq!(
            extract_json_with_reasoning(text).unwrap(),
            json!({"ok": true})
        );
    }

    #[test]
    fn test_safe_parse_returns_fallback() {
        let value = extract_json_or("not json", json!([]));
        assert_eq!(value, json!([]));
    }

    #[test]
    fn test_safe_parse_returns_parsed_value() {
        let value = extract_json_or("{\"a\": [1, 2]}", json!([]));
        assert_eq!(value, json!({"a": [1, 2]}));
    }

    #[test]
    fn test_round_trip() {
        let original = json!({
            "title": "Cell biology",
            "cards": [{"front": "ATP?", "back": "energy currency"}],
            "count": 3,
            "nested": {"deep": [true, null, 1.5]}
        });
        let text = serde_json::to_string(&original).unwrap();
        assert_eq!(extract_json(&text).unwrap(), original);
    }
}
