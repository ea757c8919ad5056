use std::sync::Arc;

use refine_contracts::prompt::{compose, GeneratedImage, ImageReference, RefinedPrompt};
use refine_contracts::run_log::{RunEvent, RunLog};
use refine_contracts::{Keyword, RefineResult, SimilarityThreshold};
use tracing::{info, warn};

use crate::backoff::{BackoffExecutor, RetryNotice};
use crate::dedupe::{DedupReport, KeywordDeduplicator};
use crate::embedding::EmbeddingProvider;
use crate::openai::{ImageGenerator, KeywordExtractor};

/// Keywords as the text model returned them, and what survived deduplication.
#[derive(Debug, Clone, PartialEq)]
pub struct KeywordSet {
    pub extracted: Vec<Keyword>,
    pub report: DedupReport,
}

/// Extraction, deduplication, composition and generation, run strictly in
/// that order for one prompt at a time.
pub struct RefinePipeline<'a> {
    extractor: Arc<dyn KeywordExtractor>,
    generator: Arc<dyn ImageGenerator>,
    deduplicator: KeywordDeduplicator<'a>,
    backoff: BackoffExecutor,
    threshold: SimilarityThreshold,
    run_log: Option<RunLog>,
}

impl<'a> RefinePipeline<'a> {
    pub fn new(
        extractor: Arc<dyn KeywordExtractor>,
        generator: Arc<dyn ImageGenerator>,
        provider: &'a EmbeddingProvider,
    ) -> Self {
        Self {
            extractor,
            generator,
            deduplicator: KeywordDeduplicator::new(provider),
            backoff: BackoffExecutor::default(),
            threshold: SimilarityThreshold::default(),
            run_log: None,
        }
    }

    pub fn with_threshold(mut self, threshold: SimilarityThreshold) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffExecutor) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_run_log(mut self, run_log: RunLog) -> Self {
        self.run_log = Some(run_log);
        self
    }

    pub fn threshold(&self) -> SimilarityThreshold {
        self.threshold
    }

    pub fn run_log(&self) -> Option<&RunLog> {
        self.run_log.as_ref()
    }

    /// Raw keywords from the text model, retried on rate limits.
    pub fn extract_keywords(&self, prompt: &str) -> RefineResult<Vec<Keyword>> {
        let keywords = self.backoff.execute_notifying(
            "extract_keywords",
            |notice| self.record_retry(notice),
            || self.extractor.extract_keywords(prompt),
        )?;
        info!(count = keywords.len(), "keywords extracted");
        self.record(RunEvent::KeywordsExtracted {
            keywords: keywords.clone(),
        });
        Ok(keywords)
    }

    pub fn deduplicate(&self, keywords: &[Keyword]) -> RefineResult<DedupReport> {
        let report = self.deduplicator.report(keywords, self.threshold)?;
        info!(
            kept = report.kept.len(),
            suppressed = report.suppressed.len(),
            "keywords deduplicated"
        );
        self.record(RunEvent::KeywordsDeduplicated {
            kept: report.kept.clone(),
            suppressed: report.suppressed_keywords(),
            threshold: self.threshold.value(),
        });
        Ok(report)
    }

    /// Extraction and deduplication as one logged run, without composing.
    pub fn collect_keywords(&self, prompt: &str) -> RefineResult<KeywordSet> {
        self.run(prompt, || self.keywords(prompt))
    }

    /// Prompt plus keywords, ready for the image model. Nothing is generated.
    pub fn generate_refined_prompt(&self, prompt: &str) -> RefineResult<RefinedPrompt> {
        self.run(prompt, || self.refine(prompt))
    }

    /// Generates an image for an already refined prompt, retried on rate limits.
    pub fn generate_image(&self, refined_prompt: &str) -> RefineResult<ImageReference> {
        let image = self.backoff.execute_notifying(
            "generate_image",
            |notice| self.record_retry(notice),
            || self.generator.generate_image(refined_prompt),
        )?;
        info!(url = %image.url, "image generated");
        self.record(RunEvent::ImageGenerated {
            url: image.url.clone(),
        });
        Ok(image)
    }

    pub fn refine_and_generate(&self, prompt: &str) -> RefineResult<GeneratedImage> {
        self.run(prompt, || {
            let refined = self.refine(prompt)?;
            let image = self.generate_image(&refined.refined_prompt)?;
            Ok(GeneratedImage {
                prompt: refined,
                image,
            })
        })
    }

    fn keywords(&self, prompt: &str) -> RefineResult<KeywordSet> {
        let extracted = self.extract_keywords(prompt)?;
        let report = self.deduplicate(&extracted)?;
        Ok(KeywordSet { extracted, report })
    }

    fn refine(&self, prompt: &str) -> RefineResult<RefinedPrompt> {
        let KeywordSet { extracted, report } = self.keywords(prompt)?;
        let refined_prompt = compose(prompt, &report.kept);
        info!(refined_prompt = %refined_prompt, "prompt refined");
        self.record(RunEvent::PromptRefined {
            refined_prompt: refined_prompt.clone(),
        });
        Ok(RefinedPrompt {
            refined_prompt,
            keywords: report.kept,
            extracted_keywords: extracted,
        })
    }

    fn run<T, F>(&self, prompt: &str, body: F) -> RefineResult<T>
    where
        F: FnOnce() -> RefineResult<T>,
    {
        info!(prompt, "run started");
        self.record(RunEvent::RunStarted {
            prompt: prompt.to_string(),
        });
        body().map_err(|err| {
            warn!(category = err.category(), "run failed: {err}");
            self.record(RunEvent::RunFailed {
                category: err.category().to_string(),
                message: err.to_string(),
            });
            err
        })
    }

    fn record_retry(&self, notice: &RetryNotice<'_>) {
        self.record(RunEvent::RetryScheduled {
            operation: notice.operation.to_string(),
            attempt: notice.attempt,
            max_retries: notice.max_retries,
            delay_ms: notice.delay.as_millis() as u64,
        });
    }

    // The run log is best effort; a full disk must not fail the run.
    fn record(&self, event: RunEvent) {
        let Some(log) = &self.run_log else {
            return;
        };
        if let Err(err) = log.record(&event) {
            warn!(path = %log.path().display(), "failed to write run event: {err:#}");
        }
    }
}
