//! Structured (JSON object) answers.

use serde_json::{Map, Value};

use flotilla_core::error::FlotillaError;

/// Corrective follow-up sent when an answer does not parse as JSON.
pub const JSON_RETRY_PROMPT: &str = "Your previous response was not valid JSON. Return ONLY valid JSON that matches the required output_schema. No prose, no markdown, no code fences.";

const PREVIEW_CHARS: usize = 220;

/// Parse a trimmed answer as a JSON object.
pub fn parse_structured_object(raw: &str) -> serde_json::Result<Map<String, Value>> {
    serde_json::from_str(raw.trim())
}

/// The first 220 characters of a trimmed answer, for diagnostics.
pub fn preview_response(raw: &str) -> String {
    let trimmed = raw.trim();
    match trimmed.char_indices().nth(PREVIEW_CHARS) {
        Some((cut, _)) => format!("{}...", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}

/// Error for an answer that still fails to parse after the retry.
pub fn structured_output_error(
    owner: &str,
    cause: &serde_json::Error,
    response: &str,
) -> FlotillaError {
    FlotillaError::invalid_input(format!(
        "{} must return structured json output: {} (response preview: {})",
        owner,
        cause,
        preview_response(response)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_trims_whitespace() {
        let obj = parse_structured_object("\n  {\"a\": 1}\n").unwrap();
        assert_eq!(obj["a"], 1);
    }

    #[test]
    fn test_non_object_rejected() {
        assert!(parse_structured_object("[1, 2]").is_err());
        assert!(parse_structured_object("```json\n{}\n```").is_err());
    }

    #[test]
    fn test_preview_truncates() {
        let long = "x".repeat(300);
        let preview = preview_response(&long);
        assert_eq!(preview.len(), 223);
        assert!(preview.ends_with("..."));
        assert_eq!(preview_response("  short  "), "short");
    }
}
