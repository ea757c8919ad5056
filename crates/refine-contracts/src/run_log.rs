use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::keywords::Keyword;

/// One pipeline milestone. Serialized with its `type` tag next to the
/// run-level fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        prompt: String,
    },
    ModelSelected {
        capability: String,
        model: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        fallback_reason: Option<String>,
    },
    RetryScheduled {
        operation: String,
        attempt: u32,
        max_retries: u32,
        delay_ms: u64,
    },
    KeywordsExtracted {
        keywords: Vec<Keyword>,
    },
    KeywordsDeduplicated {
        kept: Vec<Keyword>,
        suppressed: Vec<Keyword>,
        threshold: f32,
    },
    PromptRefined {
        refined_prompt: String,
    },
    ImageGenerated {
        url: String,
    },
    RunFailed {
        category: String,
        message: String,
    },
}

/// Append-only JSONL writer. Clones share the same file and lock.
#[derive(Debug, Clone)]
pub struct RunLog {
    inner: Arc<RunLogInner>,
}

#[derive(Debug)]
struct RunLogInner {
    path: PathBuf,
    run_id: String,
    lock: Mutex<()>,
}

impl RunLog {
    pub fn new(path: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(RunLogInner {
                path: path.into(),
                run_id: run_id.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    pub fn record(&self, event: &RunEvent) -> anyhow::Result<Value> {
        let Value::Object(body) = serde_json::to_value(event)? else {
            anyhow::bail!("run event did not serialize to an object");
        };
        let mut line = Map::new();
        line.insert("run_id".to_string(), Value::String(self.inner.run_id.clone()));
        line.insert("ts".to_string(), Value::String(now_utc_iso()));
        line.extend(body);

        let encoded = serde_json::to_string(&line)?;
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("run log lock poisoned"))?;
        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        file.write_all(encoded.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(line))
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
