//! Local embeddings with fastembed (BGE-Small-EN-v1.5, 384 dimensions)
//!
//! The model is loaded lazily on first use; inference runs on the blocking
//! pool since fastembed is synchronous.

use std::sync::Arc;

use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use tokio::sync::OnceCell;

use super::EmbeddingProvider;
use crate::error::{MemoryError, Result};

/// Output width of BGE-Small-EN-v1.5
pub const BGE_SMALL_DIMENSION: usize = 384;

/// Provider backed by a local ONNX model. Every facet shares the model; the
/// facet name is prepended to the input so facets embed differently.
pub struct FastEmbedProvider {
    model: OnceCell<Arc<TextEmbedding>>,
}

impl FastEmbedProvider {
    pub fn new() -> Self {
        Self {
            model: OnceCell::new(),
        }
    }

    async fn model(&self) -> Result<Arc<TextEmbedding>> {
        self.model
            .get_or_try_init(|| async {
                log::info!("Loading fastembed model BGE-Small-EN-v1.5");
                let model = tokio::task::spawn_blocking(|| {
                    TextEmbedding::try_new(InitOptions::new(EmbeddingModel::BGESmallENV15))
                })
                .await
                .map_err(|e| MemoryError::embedding(e.to_string()))?
                .map_err(|e| MemoryError::embedding(format!("Failed to load model: {}", e)))?;
                log::info!("fastembed ready ({}d)", BGE_SMALL_DIMENSION);
                Ok::<_, MemoryError>(Arc::new(model))
            })
            .await
            .cloned()
    }
}

impl Default for FastEmbedProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmbeddingProvider for FastEmbedProvider {
    fn name(&self) -> &str {
        "fastembed"
    }

    async fn embed(&self, input: &str, facet: &str) -> Result<Vec<f32>> {
        let model = self.model().await?;
        let text = format!("{}: {}", facet, input);
        let embeddings = tokio::task::spawn_blocking(move || model.embed(vec![text], None))
            .await
            .map_err(|e| MemoryError::embedding(e.to_string()))?
            .map_err(|e| MemoryError::embedding(format!("Failed to encode text: {}", e)))?;
        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| MemoryError::embedding("Empty embedding result"))
    }
}
