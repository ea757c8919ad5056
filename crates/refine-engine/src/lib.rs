pub mod backoff;
pub mod dedupe;
pub mod embedding;
pub mod openai;
pub mod pipeline;

#[cfg(test)]
mod stub_server;

pub use backoff::{BackoffExecutor, RetryNotice};
pub use dedupe::{cosine_similarity, DedupReport, KeywordDeduplicator, Suppressed};
pub use embedding::{EmbeddingEngine, EmbeddingProvider, OnnxEmbedder};
pub use openai::{ImageGenerator, KeywordExtractor, OpenAiClient};
pub use pipeline::{KeywordSet, RefinePipeline};

/// Fresh identifier for a pipeline run, used to tag run-log lines.
pub fn new_run_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
