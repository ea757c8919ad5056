use serde_json::Value;

use crate::error::{RefineError, RefineResult};

pub type Keyword = String;

pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.8;

/// Cosine-similarity cut-off for keyword deduplication. Pairs at or above the
/// threshold are treated as near-duplicates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityThreshold(f32);

impl SimilarityThreshold {
    pub fn new(value: f32) -> RefineResult<Self> {
        if value.is_nan() || !(-1.0..=1.0).contains(&value) {
            return Err(RefineError::config(format!(
                "similarity threshold must be within [-1, 1], got {value}"
            )));
        }
        Ok(Self(value))
    }

    pub fn value(&self) -> f32 {
        self.0
    }
}

impl Default for SimilarityThreshold {
    fn default() -> Self {
        Self(DEFAULT_SIMILARITY_THRESHOLD)
    }
}

/// Pulls the keyword list out of a chat completion's text content.
///
/// Models are asked for a bare JSON array but often wrap it in prose, so the
/// whole text is tried first and the first bracketed array second.
pub fn parse_keyword_payload(content: &str) -> RefineResult<Vec<Keyword>> {
    let trimmed = content.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return keywords_from_value(&value, content);
    }

    let Some(candidate) = first_bracketed_array(trimmed) else {
        return Err(RefineError::parse(
            "no JSON array found in keyword response",
            content,
        ));
    };
    let value: Value = serde_json::from_str(candidate).map_err(|err| {
        RefineError::parse(format!("keyword array is not valid JSON: {err}"), content)
    })?;
    keywords_from_value(&value, content)
}

fn keywords_from_value(value: &Value, raw: &str) -> RefineResult<Vec<Keyword>> {
    let items = match value {
        Value::Array(items) => items,
        Value::Object(obj) => match obj.get("keywords") {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(RefineError::parse(
                    "keyword response is a JSON object without a `keywords` array",
                    raw,
                ))
            }
        },
        // A JSON string may itself hold the array, e.g. "\"[\\\"a\\\"]\"".
        Value::String(inner) if inner.trim_start().starts_with('[') => {
            return parse_keyword_payload(inner).map_err(|_| {
                RefineError::parse("keyword response string does not hold an array", raw)
            });
        }
        _ => {
            return Err(RefineError::parse(
                "keyword response is not a JSON array",
                raw,
            ))
        }
    };

    let mut keywords = Vec::with_capacity(items.len());
    for item in items {
        let Some(text) = item.as_str() else {
            return Err(RefineError::parse(
                format!("keyword array holds a non-string item: {item}"),
                raw,
            ));
        };
        let text = text.trim();
        if !text.is_empty() {
            keywords.push(text.to_string());
        }
    }
    Ok(keywords)
}

/// Returns the first `[ ... ]` span whose brackets balance, skipping brackets
/// inside JSON string literals.
fn first_bracketed_array(text: &str) -> Option<&str> {
    let start = text.find('[')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
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
    fn bare_array_parses_directly() -> anyhow::Result<()> {
        let keywords = parse_keyword_payload(r#"["golden hour", "bokeh", "35mm film"]"#)?;
        assert_eq!(keywords, vec!["golden hour", "bokeh", "35mm film"]);
        Ok(())
    }

    #[test]
    fn array_wrapped_in_prose_falls_back_to_bracket_extraction() -> anyhow::Result<()> {
        let keywords =
            parse_keyword_payload("Here are some keywords: [\"a\", \"b\", \"c\"] enjoy!")?;
        assert_eq!(keywords, vec!["a", "b", "c"]);
        Ok(())
    }

    #[test]
    fn markdown_fenced_array_is_recovered() -> anyhow::Result<()> {
        let content = "```json\n[\"misty forest\", \"volumetric light\"]\n```";
        let keywords = parse_keyword_payload(content)?;
        assert_eq!(keywords, vec!["misty forest", "volumetric light"]);
        Ok(())
    }

    #[test]
    fn brackets_inside_strings_do_not_end_the_array() -> anyhow::Result<()> {
        let content = r#"Sure: ["wide [cinematic] shot", "rim light"] and more [notes]"#;
        let keywords = parse_keyword_payload(content)?;
        assert_eq!(keywords, vec!["wide [cinematic] shot", "rim light"]);
        Ok(())
    }

    #[test]
    fn object_with_keywords_field_is_accepted() -> anyhow::Result<()> {
        let keywords = parse_keyword_payload(r#"{"keywords": ["matte", " pastel "]}"#)?;
        assert_eq!(keywords, vec!["matte", "pastel"]);
        Ok(())
    }

    #[test]
    fn blank_items_are_dropped() -> anyhow::Result<()> {
        let keywords = parse_keyword_payload(r#"["", "  ", "grain"]"#)?;
        assert_eq!(keywords, vec!["grain"]);
        Ok(())
    }

    #[test]
    fn prose_without_array_is_a_parse_error_carrying_raw_text() {
        let content = "I cannot help with that.";
        match parse_keyword_payload(content) {
            Err(RefineError::Parse { raw, .. }) => assert_eq!(raw, content),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn unbalanced_array_is_a_parse_error() {
        let err = parse_keyword_payload("keywords: [\"a\", \"b\"").err();
        assert!(matches!(err, Some(RefineError::Parse { .. })));
    }

    #[test]
    fn non_string_items_are_rejected() {
        let err = parse_keyword_payload("[\"a\", 3]").err();
        assert!(matches!(err, Some(RefineError::Parse { .. })));
    }

    #[test]
    fn threshold_rejects_out_of_range_values() {
        assert!(SimilarityThreshold::new(0.8).is_ok());
        assert!(SimilarityThreshold::new(-1.0).is_ok());
        assert!(SimilarityThreshold::new(1.5).is_err());
        assert!(SimilarityThreshold::new(f32::NAN).is_err());
        assert_eq!(SimilarityThreshold::default().value(), 0.8);
    }
}
