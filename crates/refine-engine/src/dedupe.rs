use std::collections::HashSet;

use refine_contracts::{Keyword, RefineError, RefineResult, SimilarityThreshold};
use serde_json::{json, Value};
use tracing::debug;

use crate::embedding::EmbeddingProvider;

/// Cosine of the angle between `a` and `b`, clamped to [-1, 1].
///
/// A zero-magnitude vector has no direction; its similarity to anything is
/// 0.0 rather than NaN. Equal non-zero vectors are exactly 1.0, so identical
/// keywords merge even at a threshold of 1.0. Callers check that both vectors
/// have the same length.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let magnitude_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let magnitude_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if magnitude_a == 0.0 || magnitude_b == 0.0 {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }
    (dot / (magnitude_a * magnitude_b)).clamp(-1.0, 1.0)
}

/// A keyword dropped because an earlier kept keyword was similar enough.
#[derive(Debug, Clone, PartialEq)]
pub struct Suppressed {
    pub keyword: Keyword,
    pub representative: Keyword,
    pub similarity: f32,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DedupReport {
    pub kept: Vec<Keyword>,
    pub suppressed: Vec<Suppressed>,
}

impl DedupReport {
    pub fn suppressed_keywords(&self) -> Vec<Keyword> {
        self.suppressed
            .iter()
            .map(|entry| entry.keyword.clone())
            .collect()
    }

    pub fn to_json(&self) -> Value {
        json!({
            "kept": self.kept,
            "suppressed": self
                .suppressed
                .iter()
                .map(|entry| json!({
                    "keyword": entry.keyword,
                    "representative": entry.representative,
                    "similarity": entry.similarity,
                }))
                .collect::<Vec<Value>>(),
        })
    }
}

/// Greedy first-occurrence-wins clustering over precomputed vectors.
///
/// Each keyword not yet suppressed becomes a representative and suppresses
/// every later, unsuppressed keyword whose similarity to it reaches
/// `threshold`. Suppressed keywords never suppress anything themselves.
pub fn dedupe_report(
    keywords: &[Keyword],
    embeddings: &[Vec<f32>],
    threshold: SimilarityThreshold,
) -> RefineResult<DedupReport> {
    if keywords.len() != embeddings.len() {
        return Err(RefineError::Embedding {
            message: format!(
                "{} keywords but {} embeddings",
                keywords.len(),
                embeddings.len()
            ),
        });
    }
    if let Some(first) = embeddings.first() {
        if embeddings.iter().any(|vector| vector.len() != first.len()) {
            return Err(RefineError::Embedding {
                message: "embeddings have mixed dimensions".to_string(),
            });
        }
    }

    let threshold = threshold.value();
    let mut suppressed: HashSet<usize> = HashSet::new();
    let mut report = DedupReport::default();

    for i in 0..keywords.len() {
        if suppressed.contains(&i) {
            continue;
        }
        report.kept.push(keywords[i].clone());
        for j in (i + 1)..keywords.len() {
            if suppressed.contains(&j) {
                continue;
            }
            let similarity = cosine_similarity(&embeddings[i], &embeddings[j]);
            if similarity >= threshold {
                suppressed.insert(j);
                report.suppressed.push(Suppressed {
                    keyword: keywords[j].clone(),
                    representative: keywords[i].clone(),
                    similarity,
                });
            }
        }
    }
    Ok(report)
}

pub fn dedupe_by_embeddings(
    keywords: &[Keyword],
    embeddings: &[Vec<f32>],
    threshold: SimilarityThreshold,
) -> RefineResult<Vec<Keyword>> {
    dedupe_report(keywords, embeddings, threshold).map(|report| report.kept)
}

/// Drops near-duplicate keywords using vectors from `provider`.
pub struct KeywordDeduplicator<'a> {
    provider: &'a EmbeddingProvider,
}

impl<'a> KeywordDeduplicator<'a> {
    pub fn new(provider: &'a EmbeddingProvider) -> Self {
        Self { provider }
    }

    pub fn report(
        &self,
        keywords: &[Keyword],
        threshold: SimilarityThreshold,
    ) -> RefineResult<DedupReport> {
        let embeddings = self.provider.embed(keywords)?;
        let report = dedupe_report(keywords, &embeddings, threshold)?;
        debug!(
            input = keywords.len(),
            kept = report.kept.len(),
            threshold = threshold.value(),
            "deduplicated keywords"
        );
        Ok(report)
    }

    pub fn dedupe(
        &self,
        keywords: &[Keyword],
        threshold: SimilarityThreshold,
    ) -> RefineResult<Vec<Keyword>> {
        self.report(keywords, threshold).map(|report| report.kept)
    }
}
