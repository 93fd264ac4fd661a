//! Embedding model capability contract.

use async_trait::async_trait;
use flowllm_core::FlowResult;

/// Contract for text embedding models.
#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    /// Embed a batch of texts. The output is parallel to the input.
    async fn embed(&self, texts: &[&str]) -> FlowResult<Vec<Vec<f32>>>;

    /// Embed a single text.
    async fn embed_one(&self, text: &str) -> FlowResult<Vec<f32>> {
        let mut embeddings = self.embed(&[text]).await?;
        Ok(embeddings.pop().unwrap_or_default())
    }

    /// Embedding dimension.
    fn dimension(&self) -> usize;
}

/// Deterministic hash-based embedder for tests and offline configs.
///
/// Each token increments a bucket chosen by a simple FNV-style hash, then the
/// vector is L2-normalized. Identical texts embed identically; overlapping
/// texts land near each other, which is all the in-memory store needs.
pub struct MockEmbedding {
    dimension: usize,
}

impl MockEmbedding {
    pub fn new(dimension: usize) -> Self {
        MockEmbedding {
            dimension: dimension.max(1),
        }
    }

    fn bucket(&self, token: &str) -> usize {
        let mut hash: u64 = 0xcbf29ce484222325;
        for byte in token.bytes() {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(0x100000001b3);
        }
        (hash % self.dimension as u64) as usize
    }
}

impl Default for MockEmbedding {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl EmbeddingModel for MockEmbedding {
    async fn embed(&self, texts: &[&str]) -> FlowResult<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            let mut vector = vec![0.0f32; self.dimension];
            for token in text.split_whitespace() {
                vector[self.bucket(&token.to_lowercase())] += 1.0;
            }
            let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
            if norm > 0.0 {
                for x in &mut vector {
                    *x /= norm;
                }
            }
            out.push(vector);
        }
        Ok(out)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
