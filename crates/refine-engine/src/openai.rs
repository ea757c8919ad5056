use std::fs;
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use refine_contracts::config::{ApiKey, PipelineSettings};
use refine_contracts::keywords::parse_keyword_payload;
use refine_contracts::models::ModelSpec;
use refine_contracts::prompt::ImageReference;
use refine_contracts::{Keyword, RefineError, RefineResult, TransportErrorKind};
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Map, Value};
use tracing::debug;

const KEYWORD_SYSTEM_PROMPT: &str = "You are a helpful assistant that generates relevant keywords for image refinement. Return only a JSON array of keywords.";

/// One attempt at pulling refinement keywords for a prompt.
pub trait KeywordExtractor: Send + Sync {
    fn extract_keywords(&self, prompt: &str) -> RefineResult<Vec<Keyword>>;
}

/// One attempt at generating an image for a prompt.
pub trait ImageGenerator: Send + Sync {
    fn generate_image(&self, prompt: &str) -> RefineResult<ImageReference>;
}

#[derive(Debug, Clone)]
pub struct OpenAiClient {
    api_base: String,
    api_key: ApiKey,
    http: HttpClient,
    text_model: ModelSpec,
    image_model: ModelSpec,
    keyword_count: u32,
    temperature: f32,
}

impl OpenAiClient {
    pub fn new(
        api_key: ApiKey,
        settings: &PipelineSettings,
        text_model: ModelSpec,
        image_model: ModelSpec,
    ) -> RefineResult<Self> {
        let http = HttpClient::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|err| RefineError::config(format!("failed to build HTTP client: {err}")))?;
        Ok(Self::with_http(api_key, settings, text_model, image_model, http))
    }

    pub fn with_http(
        api_key: ApiKey,
        settings: &PipelineSettings,
        text_model: ModelSpec,
        image_model: ModelSpec,
        http: HttpClient,
    ) -> Self {
        Self {
            api_base: settings.api_base.trim_end_matches('/').to_string(),
            api_key,
            http,
            text_model,
            image_model,
            keyword_count: settings.keyword_count,
            temperature: settings.temperature,
        }
    }

    pub fn text_model(&self) -> &ModelSpec {
        &self.text_model
    }

    pub fn image_model(&self) -> &ModelSpec {
        &self.image_model
    }

    fn keyword_request(&self, prompt: &str) -> Value {
        json!({
            "model": self.text_model.name,
            "messages": [
                { "role": "system", "content": KEYWORD_SYSTEM_PROMPT },
                {
                    "role": "user",
                    "content": format!(
                        "Generate {} relevant keywords for refining this image prompt: {prompt}",
                        self.keyword_count
                    ),
                },
            ],
            "temperature": self.temperature,
        })
    }

    fn image_request(&self, prompt: &str) -> Value {
        let mut payload = Map::new();
        payload.insert("model".to_string(), json!(self.image_model.name));
        payload.insert("prompt".to_string(), json!(prompt));
        payload.insert("n".to_string(), json!(1));
        if let Some(params) = &self.image_model.image {
            payload.insert("size".to_string(), json!(params.size));
            if let Some(quality) = &params.quality {
                payload.insert("quality".to_string(), json!(quality));
            }
            if let Some(format) = &params.response_format {
                payload.insert("response_format".to_string(), json!(format));
            }
        }
        Value::Object(payload)
    }

    fn post_json(&self, endpoint: &str, payload: &Value) -> RefineResult<Value> {
        debug!(endpoint, "POST");
        let response = self
            .http
            .post(endpoint)
            .bearer_auth(self.api_key.expose())
            .json(payload)
            .send()
            .map_err(|err| {
                RefineError::transport(
                    TransportErrorKind::Unknown,
                    None,
                    format!("request to {endpoint} failed: {err}"),
                )
            })?;
        let status = response.status();
        let body = response.text().map_err(|err| {
            RefineError::transport(
                TransportErrorKind::Unknown,
                Some(status.as_u16()),
                format!("failed reading response body from {endpoint}: {err}"),
            )
        })?;
        if !status.is_success() {
            return Err(status_error(status.as_u16(), &body));
        }
        serde_json::from_str(&body).map_err(|err| {
            RefineError::parse(format!("{endpoint} returned invalid JSON: {err}"), body)
        })
    }

    /// Fetches the image behind `image` and writes it to `path`. Handles both
    /// hosted URLs and inline `data:` URLs.
    pub fn download_image(&self, image: &ImageReference, path: &Path) -> RefineResult<u64> {
        let bytes = if let Some(inline) = image.url.strip_prefix("data:") {
            let (_, encoded) = inline.split_once(";base64,").ok_or_else(|| {
                RefineError::parse("inline image URL is not base64 encoded", truncate_text(&image.url, 64))
            })?;
            BASE64.decode(encoded.as_bytes()).map_err(|err| {
                RefineError::parse(
                    format!("inline image base64 decode failed: {err}"),
                    truncate_text(encoded, 64),
                )
            })?
        } else {
            let response = self.http.get(&image.url).send().map_err(|err| {
                RefineError::transport(
                    TransportErrorKind::Unknown,
                    None,
                    format!("failed downloading image ({}): {err}", image.url),
                )
            })?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().unwrap_or_default();
                return Err(status_error(status.as_u16(), &body));
            }
            response
                .bytes()
                .map_err(|err| {
                    RefineError::transport(
                        TransportErrorKind::Unknown,
                        Some(status.as_u16()),
                        format!("failed reading image bytes: {err}"),
                    )
                })?
                .to_vec()
        };

        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| {
                RefineError::config(format!("cannot create {}: {err}", parent.display()))
            })?;
        }
        fs::write(path, &bytes)
            .map_err(|err| RefineError::config(format!("cannot write {}: {err}", path.display())))?;
        Ok(bytes.len() as u64)
    }
}

impl KeywordExtractor for OpenAiClient {
    fn extract_keywords(&self, prompt: &str) -> RefineResult<Vec<Keyword>> {
        let endpoint = format!("{}/chat/completions", self.api_base);
        let response = self.post_json(&endpoint, &self.keyword_request(prompt))?;
        let content = response
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                RefineError::parse(
                    "chat completion has no choices[0].message.content",
                    response.to_string(),
                )
            })?;
        debug!(content, "keyword completion");
        parse_keyword_payload(content)
    }
}

impl ImageGenerator for OpenAiClient {
    fn generate_image(&self, prompt: &str) -> RefineResult<ImageReference> {
        let endpoint = format!("{}/images/generations", self.api_base);
        let response = self.post_json(&endpoint, &self.image_request(prompt))?;
        image_reference_from_response(&response)
    }
}

fn image_reference_from_response(response: &Value) -> RefineResult<ImageReference> {
    let first = response.pointer("/data/0");
    let revised_prompt = first
        .and_then(|item| item.get("revised_prompt"))
        .and_then(Value::as_str)
        .map(str::to_string);

    if let Some(url) = first.and_then(|item| item.get("url")).and_then(Value::as_str) {
        return Ok(ImageReference {
            url: url.to_string(),
            revised_prompt,
        });
    }
    if let Some(b64) = first
        .and_then(|item| item.get("b64_json"))
        .and_then(Value::as_str)
    {
        return Ok(ImageReference {
            url: format!("data:image/png;base64,{b64}"),
            revised_prompt,
        });
    }
    Err(RefineError::parse(
        "No image URL in response",
        truncate_text(&response.to_string(), 512),
    ))
}

fn status_error(code: u16, body: &str) -> RefineError {
    let kind = TransportErrorKind::from_status(code);
    let api_message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| {
            value
                .pointer("/error/message")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .filter(|message| !message.trim().is_empty());

    let message = match (kind, api_message) {
        (TransportErrorKind::BadRequest, _) => truncate_text(body, 512),
        (_, Some(message)) => message,
        (_, None) if body.trim().is_empty() => format!("HTTP {code}"),
        (_, None) => format!("HTTP {code}: {}", truncate_text(body, 512)),
    };
    RefineError::transport(kind, Some(code), message)
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
