use std::fmt;

use thiserror::Error;

/// Which way a remote call failed. Only `RateLimited` is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    RateLimited,
    Unauthorized,
    BadRequest,
    Unknown,
}

impl TransportErrorKind {
    pub fn from_status(code: u16) -> Self {
        match code {
            401 => Self::Unauthorized,
            429 => Self::RateLimited,
            400 => Self::BadRequest,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::Unauthorized => "unauthorized",
            Self::BadRequest => "bad_request",
            Self::Unknown => "unknown",
        }
    }

    fn headline(&self) -> &'static str {
        match self {
            Self::RateLimited => "rate limit exceeded; retry later",
            Self::Unauthorized => "invalid API key; check OPENAI_API_KEY",
            Self::BadRequest => "invalid request",
            Self::Unknown => "request failed",
        }
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum RefineError {
    #[error("configuration error: {message}")]
    Config { message: String },

    #[error("{}: {message}", .kind.headline())]
    Transport {
        kind: TransportErrorKind,
        status: Option<u16>,
        message: String,
    },

    #[error("malformed model response: {reason}")]
    Parse { reason: String, raw: String },

    #[error("embedding failure: {message}")]
    Embedding { message: String },
}

pub type RefineResult<T> = Result<T, RefineError>;

impl RefineError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn transport(kind: TransportErrorKind, status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Transport {
            kind,
            status,
            message: message.into(),
        }
    }

    pub fn parse(reason: impl Into<String>, raw: impl Into<String>) -> Self {
        Self::Parse {
            reason: reason.into(),
            raw: raw.into(),
        }
    }

    /// Flattens an `anyhow` chain (as produced by the embedding backends) into
    /// an embedding failure.
    pub fn embedding(err: &anyhow::Error) -> Self {
        Self::Embedding {
            message: format!("{err:#}"),
        }
    }

    pub fn transport_kind(&self) -> Option<TransportErrorKind> {
        match self {
            Self::Transport { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Short machine-readable label, used in run logs.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config",
            Self::Transport { kind, .. } => kind.as_str(),
            Self::Parse { .. } => "parse",
            Self::Embedding { .. } => "embedding",
        }
    }
}

/// Implemented by error types that can carry an HTTP 429 style signal.
pub trait RateLimitSignal {
    fn is_rate_limited(&self) -> bool;
}

impl RateLimitSignal for RefineError {
    fn is_rate_limited(&self) -> bool {
        self.transport_kind() == Some(TransportErrorKind::RateLimited)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_transport_kinds() {
        assert_eq!(TransportErrorKind::from_status(401), TransportErrorKind::Unauthorized);
        assert_eq!(TransportErrorKind::from_status(429), TransportErrorKind::RateLimited);
        assert_eq!(TransportErrorKind::from_status(400), TransportErrorKind::BadRequest);
        assert_eq!(TransportErrorKind::from_status(500), TransportErrorKind::Unknown);
        assert_eq!(TransportErrorKind::from_status(403), TransportErrorKind::Unknown);
    }

    #[test]
    fn only_rate_limited_transport_errors_signal_rate_limit() {
        let limited = RefineError::transport(TransportErrorKind::RateLimited, Some(429), "slow down");
        let unauthorized =
            RefineError::transport(TransportErrorKind::Unauthorized, Some(401), "bad key");
        let parse = RefineError::parse("no array", "hello");

        assert!(limited.is_rate_limited());
        assert!(!unauthorized.is_rate_limited());
        assert!(!parse.is_rate_limited());
    }

    #[test]
    fn display_distinguishes_user_facing_failures() {
        let unauthorized =
            RefineError::transport(TransportErrorKind::Unauthorized, Some(401), "Incorrect API key");
        let limited = RefineError::transport(TransportErrorKind::RateLimited, Some(429), "quota");
        let parse = RefineError::parse("no JSON array found", "Sure!");
        let unknown = RefineError::transport(TransportErrorKind::Unknown, Some(503), "overloaded");

        assert!(unauthorized.to_string().starts_with("invalid API key"));
        assert!(limited.to_string().starts_with("rate limit exceeded"));
        assert!(parse.to_string().starts_with("malformed model response"));
        assert_eq!(unknown.to_string(), "request failed: overloaded");
    }

    #[test]
    fn embedding_error_keeps_context_chain() {
        let err = anyhow::anyhow!("out of memory").context("failed to load ONNX model");
        let mapped = RefineError::embedding(&err);
        assert_eq!(
            mapped.to_string(),
            "embedding failure: failed to load ONNX model: out of memory"
        );
        assert_eq!(mapped.category(), "embedding");
    }
}
