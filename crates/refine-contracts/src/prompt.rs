use serde::{Deserialize, Serialize};

use crate::keywords::Keyword;

pub const KEYWORD_SEPARATOR: &str = ", ";

/// Builds the prompt sent to the image model from the user's text and the
/// surviving keywords. An empty keyword list keeps the template intact.
///
/// At most one trailing period is folded into the template's own, so the
/// original text always appears verbatim in the result.
pub fn compose(original_prompt: &str, keywords: &[Keyword]) -> String {
    let trimmed = original_prompt.trim();
    let original = trimmed.strip_suffix('.').unwrap_or(trimmed);
    format!(
        "{original}. Refine with these details: {}",
        keywords.join(KEYWORD_SEPARATOR)
    )
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefinedPrompt {
    pub refined_prompt: String,
    pub keywords: Vec<Keyword>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extracted_keywords: Vec<Keyword>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageReference {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revised_prompt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedImage {
    #[serde(flatten)]
    pub prompt: RefinedPrompt,
    pub image: ImageReference,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compose_keeps_original_text_and_joins_keywords() {
        let refined = compose(
            "A cat on a mat",
            &["blue eyes".to_string(), "soft lighting".to_string()],
        );
        assert!(refined.contains("A cat on a mat"));
        assert!(refined.contains("blue eyes, soft lighting"));
        assert_eq!(
            refined,
            "A cat on a mat. Refine with these details: blue eyes, soft lighting"
        );
    }

    #[test]
    fn compose_with_no_keywords_keeps_template() {
        assert_eq!(
            compose("A lighthouse at dusk", &[]),
            "A lighthouse at dusk. Refine with these details: "
        );
    }

    #[test]
    fn compose_does_not_double_trailing_period() {
        assert_eq!(
            compose("  A red fox.  ", &["snow".to_string()]),
            "A red fox. Refine with these details: snow"
        );
    }

    #[test]
    fn compose_keeps_ellipsis_intact() {
        let refined = compose("Wait...", &["fog".to_string()]);
        assert!(refined.contains("Wait..."));
        assert_eq!(refined, "Wait... Refine with these details: fog");
    }

    #[test]
    fn generated_image_serializes_flat() -> anyhow::Result<()> {
        let generated = GeneratedImage {
            prompt: RefinedPrompt {
                refined_prompt: "p".to_string(),
                keywords: vec!["k".to_string()],
                extracted_keywords: Vec::new(),
            },
            image: ImageReference {
                url: "https://img.example/1.png".to_string(),
                revised_prompt: None,
            },
        };
        let value = serde_json::to_value(&generated)?;
        assert_eq!(value["refined_prompt"], "p");
        assert_eq!(value["image"]["url"], "https://img.example/1.png");
        assert!(value.get("extracted_keywords").is_none());
        Ok(())
    }
}
