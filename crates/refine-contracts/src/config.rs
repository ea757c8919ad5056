use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{RefineError, RefineResult};
use crate::keywords::SimilarityThreshold;

pub const API_KEY_ENV: &str = "OPENAI_API_KEY";
pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";
pub const DEFAULT_EMBEDDING_MODEL_DIR: &str = "resources/models/all-minilm-l6-v2";

/// Bearer credential. Debug output never shows the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(value: impl Into<String>) -> RefineResult<Self> {
        let value = value.into().trim().to_string();
        if value.is_empty() {
            return Err(missing_key());
        }
        Ok(Self(value))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ApiKey(len={})", self.0.len())
    }
}

fn missing_key() -> RefineError {
    RefineError::config(format!(
        "{API_KEY_ENV} is not set; export it or add it to your environment before running"
    ))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub initial_delay: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1000),
        }
    }
}

/// Everything the pipeline needs apart from the credential.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub api_base: String,
    pub text_model: Option<String>,
    pub image_model: Option<String>,
    pub keyword_count: u32,
    pub temperature: f32,
    pub threshold: SimilarityThreshold,
    pub retry: RetrySettings,
    pub request_timeout: Duration,
    pub embedding_model_dir: PathBuf,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            text_model: None,
            image_model: None,
            keyword_count: 10,
            temperature: 0.7,
            threshold: SimilarityThreshold::default(),
            retry: RetrySettings::default(),
            request_timeout: Duration::from_secs(120),
            embedding_model_dir: PathBuf::from(DEFAULT_EMBEDDING_MODEL_DIR),
        }
    }
}

impl PipelineSettings {
    pub fn from_env() -> RefineResult<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Reads settings through `lookup`, falling back to defaults for unset or
    /// blank variables. Values that are set but unparseable are errors.
    pub fn from_lookup<F>(lookup: F) -> RefineResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let defaults = Self::default();

        let threshold = match parse_var::<f32>(&read, "REFINE_SIMILARITY_THRESHOLD")? {
            Some(value) => SimilarityThreshold::new(value)?,
            None => defaults.threshold,
        };
        let initial_delay = parse_var::<u64>(&read, "REFINE_INITIAL_DELAY_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.retry.initial_delay);

        Ok(Self {
            api_base: read("OPENAI_API_BASE")
                .map(|value| value.trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or(defaults.api_base),
            text_model: read("REFINE_TEXT_MODEL"),
            image_model: read("REFINE_IMAGE_MODEL"),
            keyword_count: parse_var(&read, "REFINE_KEYWORD_COUNT")?
                .unwrap_or(defaults.keyword_count),
            temperature: parse_var(&read, "REFINE_TEMPERATURE")?.unwrap_or(defaults.temperature),
            threshold,
            retry: RetrySettings {
                max_retries: parse_var(&read, "REFINE_MAX_RETRIES")?
                    .unwrap_or(defaults.retry.max_retries),
                initial_delay,
            },
            request_timeout: parse_var::<u64>(&read, "REFINE_REQUEST_TIMEOUT_S")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.request_timeout),
            embedding_model_dir: read("REFINE_EMBEDDING_MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.embedding_model_dir),
        })
    }
}

/// Settings plus the credential; building one fails fast when the key is
/// missing.
#[derive(Debug, Clone)]
pub struct RefineConfig {
    pub api_key: ApiKey,
    pub settings: PipelineSettings,
}

impl RefineConfig {
    pub fn from_env() -> RefineResult<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> RefineResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_key = lookup(API_KEY_ENV).ok_or_else(missing_key)?;
        Ok(Self {
            api_key: ApiKey::new(api_key)?,
            settings: PipelineSettings::from_lookup(lookup)?,
        })
    }
}

fn parse_var<T>(read: &impl Fn(&str) -> Option<String>, key: &str) -> RefineResult<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let Some(raw) = read(key) else {
        return Ok(None);
    };
    raw.parse::<T>()
        .map(Some)
        .map_err(|err| RefineError::config(format!("{key}={raw:?} is invalid: {err}")))
}
