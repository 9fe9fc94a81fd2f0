//! Embedding generation: fastembed locally, or token hashing when no model is wanted

use std::sync::Arc;

use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use tokio::sync::Mutex;

use crate::config::Config;
use crate::error::{Error, Result, StorageError, StorageResult};

/// Turns text into fixed-size vectors. Identical text gives identical vectors.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Generate an embedding for a single text
    async fn embed(&self, text: &str) -> StorageResult<Vec<f32>>;

    /// Length of every vector this embedder returns
    fn dimensions(&self) -> usize;
}

/// Embedding service backed by a local fastembed model
pub struct FastEmbedder {
    model: Arc<Mutex<TextEmbedding>>,
    dimensions: usize,
}

/// fastembed model and its vector length for a configured model name
fn resolve_model(name: &str) -> Result<(EmbeddingModel, usize)> {
    match name.to_ascii_lowercase().as_str() {
        "all-minilm-l6-v2" => Ok((EmbeddingModel::AllMiniLML6V2, 384)),
        "all-minilm-l12-v2" => Ok((EmbeddingModel::AllMiniLML12V2, 384)),
        "bge-small-en-v1.5" => Ok((EmbeddingModel::BGESmallENV15, 384)),
        "bge-base-en-v1.5" => Ok((EmbeddingModel::BGEBaseENV15, 768)),
        "nomic-embed-text-v1.5" => Ok((EmbeddingModel::NomicEmbedTextV15, 768)),
        other => Err(Error::config(format!("Unknown embedding model: {}", other))),
    }
}

impl FastEmbedder {
    /// Load the configured model; it downloads to ~/.cache/fastembed on first use
    pub fn new(config: &Config) -> Result<Self> {
        let (model, dimensions) = resolve_model(&config.embedding_model)?;
        if dimensions != config.embedding_dimensions {
            return Err(Error::config(format!(
                "{} produces {} dimensions, config expects {}",
                config.embedding_model, dimensions, config.embedding_dimensions
            )));
        }

        let model = TextEmbedding::try_new(
            InitOptions::new(model).with_show_download_progress(true),
        )
        .map_err(|e| Error::embedding(format!("Failed to load embedding model: {}", e)))?;

        Ok(Self {
            model: Arc::new(Mutex::new(model)),
            dimensions,
        })
    }
}

#[async_trait]
impl Embedder for FastEmbedder {
    async fn embed(&self, text: &str) -> StorageResult<Vec<f32>> {
        let mut guard = self.model.lock().await;
        let embeddings = guard
            .embed(vec![text.to_string()], None)
            .map_err(|e| StorageError::embedding(format!("Embedding failed: {}", e)))?;

        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| StorageError::embedding("No embedding returned"))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Signed FNV-1a token hashing into a normalized vector.
///
/// Texts sharing words land close together, which is enough for offline use
/// and tests; it has no notion of synonyms.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimensions: usize,
}

impl HashEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        for raw in text.split(|c: char| !c.is_alphanumeric()) {
            if raw.is_empty() {
                continue;
            }
            let hash = fnv1a(raw.to_lowercase().as_bytes());
            let index = (hash % self.dimensions as u64) as usize;
            let sign = if hash & (1 << 63) == 0 { 1.0 } else { -1.0 };
            vector[index] += sign;
        }

        let magnitude = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for v in &mut vector {
                *v /= magnitude;
            }
        }
        vector
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> StorageResult<Vec<f32>> {
        Ok(self.embed_sync(text))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

pub(crate) fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    bytes.iter().fold(OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(PRIME)
    })
}

/// Token counter using tiktoken
pub struct TokenCounter {
    bpe: tiktoken_rs::CoreBPE,
}

impl TokenCounter {
    /// Create a new token counter for a specific model
    pub fn new(model: &str) -> Result<Self> {
        let bpe = tiktoken_rs::get_bpe_from_model(model)
            .map_err(|e| Error::config(format!("Failed to load tokenizer for {}: {}", model, e)))?;

        Ok(Self { bpe })
    }

    /// Create a token counter for Claude models (cl100k_base is close enough)
    pub fn for_claude() -> Result<Self> {
        Self::new("gpt-4")
    }

    /// Count tokens in a text
    pub fn count(&self, text: &str) -> u32 {
        self.bpe.encode_with_special_tokens(text).len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[tokio::test]
    async fn hash_embeddings_are_deterministic_and_normalized() {
        let embedder = HashEmbedder::new(64);
        let a = embedder.embed("Shard writer for the knowledge store").await.unwrap();
        let b = embedder.embed("Shard writer for the knowledge store").await.unwrap();

        assert_eq!(a.len(), 64);
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn shared_words_score_higher() {
        let embedder = HashEmbedder::new(256);
        let query = embedder.embed_sync("vector storage retry");
        let close = embedder.embed_sync("retry logic for vector storage writes");
        let far = embedder.embed_sync("dashboard colour palette");
        assert!(cosine(&query, &close) > cosine(&query, &far));
    }

    #[test]
    fn empty_text_is_the_zero_vector() {
        let v = HashEmbedder::new(8).embed_sync("  ...  ");
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn model_names_resolve_with_their_dimensions() {
        let (model, dims) = resolve_model("all-MiniLM-L6-v2").unwrap();
        assert!(matches!(model, EmbeddingModel::AllMiniLML6V2));
        assert_eq!(dims, 384);
        assert_eq!(resolve_model("bge-base-en-v1.5").unwrap().1, 768);
        assert!(resolve_model("word2vec").is_err());
    }

    #[test]
    fn mismatched_dimensions_are_rejected_before_loading() {
        let mut config = Config::default();
        config.embedding_model = "bge-base-en-v1.5".to_string();
        assert!(matches!(FastEmbedder::new(&config), Err(Error::Config(_))));
    }
}
