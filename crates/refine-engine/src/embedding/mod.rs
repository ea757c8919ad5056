//! Sentence embeddings behind a lazily loaded, process-wide model.

mod onnx;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Instant;

use anyhow::Result;
use refine_contracts::{RefineError, RefineResult};
use tracing::{debug, info};

pub use onnx::{OnnxEmbedder, MINILM_DIMENSION};

/// A loaded sentence-embedding model.
pub trait EmbeddingEngine: Send {
    /// One vector per input, in input order.
    fn embed_batch(&mut self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    fn dimension(&self) -> usize;

    fn model_name(&self) -> &str;
}

pub type SharedEngine = Arc<Mutex<Box<dyn EmbeddingEngine>>>;

type EngineLoader = Box<dyn Fn() -> Result<Box<dyn EmbeddingEngine>> + Send + Sync>;

/// Owns the one model instance for its lifetime. The first `load` runs the
/// loader; concurrent first callers wait on that load and share its result.
/// A failed load leaves the provider empty so a later call can try again.
pub struct EmbeddingProvider {
    loader: EngineLoader,
    engine: OnceLock<SharedEngine>,
    load_lock: Mutex<()>,
}

static GLOBAL_PROVIDER: OnceLock<EmbeddingProvider> = OnceLock::new();

impl EmbeddingProvider {
    pub fn new<F>(loader: F) -> Self
    where
        F: Fn() -> Result<Box<dyn EmbeddingEngine>> + Send + Sync + 'static,
    {
        Self {
            loader: Box::new(loader),
            engine: OnceLock::new(),
            load_lock: Mutex::new(()),
        }
    }

    /// Provider for the ONNX export in `model_dir`. Nothing is read until
    /// the first `load`.
    pub fn onnx(model_dir: impl Into<PathBuf>) -> Self {
        let model_dir = model_dir.into();
        Self::new(move || Ok(Box::new(OnnxEmbedder::from_dir(&model_dir)?) as Box<dyn EmbeddingEngine>))
    }

    /// The process-wide provider. The first call fixes its model directory;
    /// later calls return the same provider whatever `model_dir` they pass.
    pub fn global_with(model_dir: &Path) -> &'static EmbeddingProvider {
        GLOBAL_PROVIDER.get_or_init(|| EmbeddingProvider::onnx(model_dir))
    }

    pub fn is_loaded(&self) -> bool {
        self.engine.get().is_some()
    }

    pub fn load(&self) -> RefineResult<SharedEngine> {
        if let Some(engine) = self.engine.get() {
            return Ok(Arc::clone(engine));
        }

        let _guard = self.load_lock.lock().map_err(|_| RefineError::Embedding {
            message: "embedding model load lock poisoned".to_string(),
        })?;
        if let Some(engine) = self.engine.get() {
            return Ok(Arc::clone(engine));
        }

        let started = Instant::now();
        let engine = (self.loader)().map_err(|err| RefineError::embedding(&err))?;
        info!(
            model = engine.model_name(),
            dimension = engine.dimension(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "embedding model loaded"
        );
        let shared: SharedEngine = Arc::new(Mutex::new(engine));
        Ok(Arc::clone(self.engine.get_or_init(|| shared)))
    }

    /// Embeds `texts` in order. Every vector in the result has the same length.
    pub fn embed(&self, texts: &[String]) -> RefineResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let shared = self.load()?;
        let mut engine = lock_engine(&shared);
        let vectors = engine
            .embed_batch(texts)
            .map_err(|err| RefineError::embedding(&err))?;
        debug!(count = vectors.len(), model = engine.model_name(), "embedded batch");

        if vectors.len() != texts.len() {
            return Err(RefineError::Embedding {
                message: format!(
                    "{} returned {} vectors for {} inputs",
                    engine.model_name(),
                    vectors.len(),
                    texts.len()
                ),
            });
        }
        if let Some(first) = vectors.first() {
            let dimension = first.len();
            if let Some(bad) = vectors.iter().position(|vector| vector.len() != dimension) {
                return Err(RefineError::Embedding {
                    message: format!(
                        "mixed embedding dimensions: vector 0 has {dimension}, vector {bad} has {}",
                        vectors[bad].len()
                    ),
                });
            }
        }
        Ok(vectors)
    }
}

// A batch that panicked leaves the engine usable; later calls take the guard
// back from the poisoned lock.
fn lock_engine(shared: &SharedEngine) -> MutexGuard<'_, Box<dyn EmbeddingEngine>> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}
