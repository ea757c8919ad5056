//! ONNX Runtime sentence encoder (all-MiniLM-L6-v2 export layout).

use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use ndarray::Array2;
use ort::{inputs, session::Session, value::Value};
use tokenizers::{PaddingParams, PaddingStrategy, Tokenizer, TruncationParams};

use super::EmbeddingEngine;

const MAX_TOKENS: usize = 512;
pub const MINILM_DIMENSION: usize = 384;

pub struct OnnxEmbedder {
    session: Session,
    tokenizer: Tokenizer,
    dimension: usize,
    model_name: String,
}

impl OnnxEmbedder {
    /// Loads `model_quantized.onnx` (or `model.onnx`) and `tokenizer.json`
    /// from `model_dir`. The directory name doubles as the model name.
    pub fn from_dir(model_dir: &Path) -> Result<Self> {
        let quantized = model_dir.join("model_quantized.onnx");
        let model_path = if quantized.exists() {
            quantized
        } else {
            model_dir.join("model.onnx")
        };
        let model_name = model_dir
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("sentence-encoder")
            .to_string();

        Self::new_from_paths(
            &model_path,
            &model_dir.join("tokenizer.json"),
            &model_name,
            MINILM_DIMENSION,
        )
    }

    pub fn new_from_paths(
        model_path: &Path,
        tokenizer_path: &Path,
        model_name: &str,
        dimension: usize,
    ) -> Result<Self> {
        if !model_path.exists() {
            bail!(
                "ONNX model not found at: {}\n\n\
                Download it with:\n  \
                mkdir -p $(dirname {}) && \\\n  \
                curl -L -o {} \\\n  \
                https://huggingface.co/Xenova/all-MiniLM-L6-v2/resolve/main/onnx/model_quantized.onnx",
                model_path.display(),
                model_path.display(),
                model_path.display()
            );
        }
        if !tokenizer_path.exists() {
            bail!(
                "Tokenizer not found at: {}\n\n\
                Download it with:\n  \
                curl -L -o {} \\\n  \
                https://huggingface.co/sentence-transformers/all-MiniLM-L6-v2/resolve/main/tokenizer.json",
                tokenizer_path.display(),
                tokenizer_path.display()
            );
        }

        let session = Session::builder()
            .context("Failed to create ONNX session builder")?
            .commit_from_file(model_path)
            .with_context(|| format!("Failed to load ONNX model {}", model_path.display()))?;

        let mut tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: MAX_TOKENS,
                ..Default::default()
            }))
            .map_err(|e| anyhow!("Failed to configure truncation: {}", e))?;
        // Batches are padded to their longest member; the attention mask keeps
        // padding out of the pooled vector.
        tokenizer.with_padding(Some(PaddingParams {
            strategy: PaddingStrategy::BatchLongest,
            ..Default::default()
        }));

        Ok(Self {
            session,
            tokenizer,
            dimension,
            model_name: model_name.to_string(),
        })
    }

    fn tokenize_batch(&self, texts: &[String]) -> Result<(Array2<i64>, Array2<i64>)> {
        let inputs: Vec<&str> = texts.iter().map(String::as_str).collect();
        let encodings = self
            .tokenizer
            .encode_batch(inputs, true)
            .map_err(|e| anyhow!("Tokenization failed: {}", e))?;

        let batch = encodings.len();
        let seq_len = encodings
            .iter()
            .map(|encoding| encoding.get_ids().len())
            .max()
            .unwrap_or(0);

        let mut input_ids = Array2::<i64>::zeros((batch, seq_len));
        let mut attention_mask = Array2::<i64>::zeros((batch, seq_len));
        for (row, encoding) in encodings.iter().enumerate() {
            for (col, (&id, &mask)) in encoding
                .get_ids()
                .iter()
                .zip(encoding.get_attention_mask())
                .enumerate()
            {
                input_ids[[row, col]] = id as i64;
                attention_mask[[row, col]] = mask as i64;
            }
        }
        Ok((input_ids, attention_mask))
    }
}

impl EmbeddingEngine for OnnxEmbedder {
    fn embed_batch(&mut self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let (input_ids, attention_mask) = self.tokenize_batch(texts)?;
        let (batch, seq_len) = input_ids.dim();
        let token_type_ids = Array2::<i64>::zeros((batch, seq_len));

        let (hidden_dim, hidden) = {
            let outputs = self
                .session
                .run(inputs![
                    "input_ids" => Value::from_array(input_ids)?,
                    "attention_mask" => Value::from_array(attention_mask.clone())?,
                    "token_type_ids" => Value::from_array(token_type_ids)?
                ])
                .context("ONNX inference failed")?;

            let (shape, data) = outputs["last_hidden_state"]
                .try_extract_tensor::<f32>()
                .context("Failed to extract last_hidden_state tensor")?;

            // [batch, seq_len, hidden_dim]
            let dims = shape.as_ref();
            if dims.len() != 3 || dims[0] as usize != batch || dims[1] as usize != seq_len {
                bail!("Unexpected last_hidden_state shape: {:?}", dims);
            }
            (dims[2] as usize, data.to_vec())
        };
        if hidden_dim != self.dimension {
            bail!(
                "{} produced {}-dimensional vectors, expected {}",
                self.model_name,
                hidden_dim,
                self.dimension
            );
        }

        let mut embeddings = Vec::with_capacity(batch);
        for row in 0..batch {
            let row_tokens = &hidden[row * seq_len * hidden_dim..(row + 1) * seq_len * hidden_dim];
            let mask = attention_mask.row(row);
            embeddings.push(normalize(mean_pool(row_tokens, mask.as_slice(), hidden_dim)));
        }
        Ok(embeddings)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}

/// Average of the token vectors the attention mask keeps.
fn mean_pool(tokens: &[f32], mask: Option<&[i64]>, hidden_dim: usize) -> Vec<f32> {
    let mut pooled = vec![0.0f32; hidden_dim];
    let mut kept = 0.0f32;
    for (position, token) in tokens.chunks_exact(hidden_dim).enumerate() {
        let keep = mask.map(|mask| mask[position] == 1).unwrap_or(true);
        if !keep {
            continue;
        }
        kept += 1.0;
        for (acc, value) in pooled.iter_mut().zip(token) {
            *acc += value;
        }
    }
    if kept == 0.0 {
        return pooled;
    }
    pooled.iter().map(|value| value / kept).collect()
}

fn normalize(vector: Vec<f32>) -> Vec<f32> {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 {
        return vector;
    }
    vector.into_iter().map(|x| x / norm).collect()
}
