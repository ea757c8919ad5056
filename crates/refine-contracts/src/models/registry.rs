use std::fmt;

use indexmap::IndexMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Chat completion used for keyword extraction.
    Keywords,
    /// Image generation from a text prompt.
    Image,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Keywords => "keywords",
            Self::Image => "image",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed request parameters for an image model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageParams {
    pub size: String,
    pub quality: Option<String>,
    pub response_format: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: String,
    pub capability: Capability,
    pub image: Option<ImageParams>,
}

impl ModelSpec {
    pub fn supports(&self, capability: Capability) -> bool {
        self.capability == capability
    }
}

#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<String, ModelSpec>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ModelRegistry {
    pub fn new(models: Option<IndexMap<String, ModelSpec>>) -> Self {
        Self {
            models: models.unwrap_or_else(default_models),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.get(name)
    }

    pub fn list(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.values()
    }

    pub fn by_capability(&self, capability: Capability) -> Vec<ModelSpec> {
        self.models
            .values()
            .filter(|model| model.supports(capability))
            .cloned()
            .collect()
    }

    pub fn ensure(&self, name: &str, capability: Capability) -> Option<ModelSpec> {
        self.get(name)
            .filter(|model| model.supports(capability))
            .cloned()
    }
}

// Registration order is the fallback order: the first model of a capability
// is its default.
fn default_models() -> IndexMap<String, ModelSpec> {
    let mut map = IndexMap::new();

    for name in ["gpt-3.5-turbo", "gpt-4o-mini", "gpt-4o"] {
        map.insert(
            name.to_string(),
            ModelSpec {
                name: name.to_string(),
                capability: Capability::Keywords,
                image: None,
            },
        );
    }

    let mut insert_image = |name: &str, size: &str, quality: Option<&str>, url_format: bool| {
        map.insert(
            name.to_string(),
            ModelSpec {
                name: name.to_string(),
                capability: Capability::Image,
                image: Some(ImageParams {
                    size: size.to_string(),
                    quality: quality.map(str::to_string),
                    response_format: url_format.then(|| "url".to_string()),
                }),
            },
        );
    };
    insert_image("dall-e-3", "1024x1024", Some("standard"), true);
    insert_image("dall-e-2", "1024x1024", None, true);
    // gpt-image-1 always answers with b64_json and rejects `response_format`.
    insert_image("gpt-image-1", "1024x1024", Some("medium"), false);

    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_lead_each_capability() {
        let registry = ModelRegistry::default();
        assert_eq!(
            registry.by_capability(Capability::Keywords)[0].name,
            "gpt-3.5-turbo"
        );
        assert_eq!(registry.by_capability(Capability::Image)[0].name, "dall-e-3");
    }

    #[test]
    fn dall_e_3_carries_fixed_generation_params() {
        let registry = ModelRegistry::default();
        let spec = registry
            .ensure("dall-e-3", Capability::Image)
            .and_then(|model| model.image);
        assert_eq!(
            spec,
            Some(ImageParams {
                size: "1024x1024".to_string(),
                quality: Some("standard".to_string()),
                response_format: Some("url".to_string()),
            })
        );
    }

    #[test]
    fn ensure_rejects_capability_mismatch() {
        let registry = ModelRegistry::default();
        assert!(registry.ensure("gpt-4o", Capability::Image).is_none());
        assert!(registry.ensure("gpt-4o", Capability::Keywords).is_some());
        assert!(registry.ensure("missing", Capability::Keywords).is_none());
    }
}
