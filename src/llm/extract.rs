//! JSON extraction from free-text LLM responses.
//!
//! Models wrap JSON in markdown fences, preamble prose, or nothing at all.
//! Extraction accepts a fenced ```json block, a bare ``` fence, or the first
//! brace-balanced `{...}` block in the raw text.

/// Extract the first JSON object from an LLM response, or `None` if the
/// response contains no parseable-looking block.
pub fn extract_json_block(response: &str) -> Option<String> {
    if let Some(fenced) = extract_fenced(response) {
        return Some(fenced);
    }
    extract_balanced(response)
}

/// Pull the contents of the first ```json (or bare ```) fence.
fn extract_fenced(response: &str) -> Option<String> {
    let fence_start = response.find("```")?;
    let after_fence = &response[fence_start + 3..];
    // Skip an optional language tag up to the end of the line.
    let content_start = after_fence.find('\n').map(|i| i + 1).unwrap_or(0);
    let content = &after_fence[content_start..];
    let fence_end = content.find("```")?;
    let inner = content[..fence_end].trim();
    if inner.starts_with('{') {
        Some(inner.to_string())
    } else {
        // Fenced block holds something else; fall back to balanced scan.
        None
    }
}

/// Scan for the first balanced `{...}` block, respecting JSON strings and
/// escape sequences.
fn extract_balanced(response: &str) -> Option<String> {
    let start = response.find('{')?;
    let bytes = response.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(response[start..start + offset + 1].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_raw_json() {
        let raw = r#"{"summary": "ok", "findings": []}"#;
        assert_eq!(extract_json_block(raw).unwrap(), raw);
    }

    #[test]
    fn extracts_json_with_preamble_and_trailer() {
        let response = "Here is the diagnosis:\n{\"summary\": \"ok\"}\nLet me know.";
        assert_eq!(extract_json_block(response).unwrap(), "{\"summary\": \"ok\"}");
    }

    #[test]
    fn extracts_fenced_json_block() {
        let response = "Sure!\n```json\n{\"summary\": \"ok\"}\n```\ndone";
        assert_eq!(extract_json_block(response).unwrap(), "{\"summary\": \"ok\"}");
    }

    #[test]
    fn extracts_bare_fence() {
        let response = "```\n{\"a\": 1}\n```";
        assert_eq!(extract_json_block(response).unwrap(), "{\"a\": 1}");
    }

    #[test]
    fn handles_nested_objects() {
        let response = r#"prefix {"a": {"b": {"c": 1}}, "d": 2} suffix"#;
        assert_eq!(
            extract_json_block(response).unwrap(),
            r#"{"a": {"b": {"c": 1}}, "d": 2}"#
        );
    }

    #[test]
    fn braces_inside_strings_do_not_close() {
        let response = r#"{"note": "brace } inside", "x": 1}"#;
        assert_eq!(extract_json_block(response).unwrap(), response);
    }

    #[test]
    fn escaped_quotes_inside_strings() {
        let response = r#"{"note": "a \"quoted\" } brace", "x": 1}"#;
        assert_eq!(extract_json_block(response).unwrap(), response);
    }

    #[test]
    fn no_json_returns_none() {
        assert!(extract_json_block("I cannot help with that.").is_none());
        assert!(extract_json_block("").is_none());
    }

    #[test]
    fn unbalanced_json_returns_none() {
        assert!(extract_json_block(r#"{"summary": "truncated"#).is_none());
    }

    #[test]
    fn fenced_non_object_falls_back_to_balanced_scan() {
        let response = "```\n[1, 2]\n```\nbut also {\"a\": 1}";
        assert_eq!(extract_json_block(response).unwrap(), "{\"a\": 1}");
    }
}
