//! Embedding providers
//!
//! The engine never trains or hosts models itself; it asks an
//! [`EmbeddingProvider`] for one vector per (text, facet) and caches the
//! answers in a [`FacetEmbedder`].

mod engine;
mod hashing;
#[cfg(feature = "fastembed")]
mod local;

use async_trait::async_trait;

use crate::error::Result;

pub use engine::FacetEmbedder;
pub use hashing::HashingEmbedder;
#[cfg(feature = "fastembed")]
pub use local::FastEmbedProvider;

/// Source of facet embeddings
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Embed `input` for `facet`. Providers may ignore the facet or use it to
    /// pick a model or instruction prefix.
    async fn embed(&self, input: &str, facet: &str) -> Result<Vec<f32>>;
}
