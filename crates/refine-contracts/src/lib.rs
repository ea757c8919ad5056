pub mod config;
pub mod error;
pub mod keywords;
pub mod models;
pub mod prompt;
pub mod run_log;

pub use error::{RateLimitSignal, RefineError, RefineResult, TransportErrorKind};
pub use keywords::{Keyword, SimilarityThreshold};
