//! Vector store capability contract and the in-memory reference store.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use flowllm_core::{FlowError, FlowResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::embedding::EmbeddingModel;

/// A stored document with its embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorNode {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    /// Filled by the store at insert time when absent.
    #[serde(default)]
    pub vector: Vec<f32>,
}

impl VectorNode {
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        VectorNode {
            id: id.into(),
            content: content.into(),
            metadata: HashMap::new(),
            vector: Vec::new(),
        }
    }
}

/// A search hit with its similarity score.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredNode {
    pub node: VectorNode,
    pub score: f32,
}

/// Contract for vector stores.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or replace nodes by id, embedding content when no vector is
    /// attached.
    async fn insert(&self, nodes: Vec<VectorNode>) -> FlowResult<()>;

    /// Top-k nodes by similarity to the query.
    async fn search(&self, query: &str, top_k: usize) -> FlowResult<Vec<ScoredNode>>;

    /// Delete nodes by id. Unknown ids are ignored.
    async fn delete(&self, ids: &[String]) -> FlowResult<()>;

    /// Number of stored nodes.
    async fn len(&self) -> usize;

    async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Cosine similarity of two equal-length vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// In-memory store ranked by cosine similarity.
pub struct MemoryVectorStore {
    embedder: Arc<dyn EmbeddingModel>,
    nodes: RwLock<HashMap<String, VectorNode>>,
}

impl MemoryVectorStore {
    pub fn new(embedder: Arc<dyn EmbeddingModel>) -> Self {
        MemoryVectorStore {
            embedder,
            nodes: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn insert(&self, mut incoming: Vec<VectorNode>) -> FlowResult<()> {
        for node in &mut incoming {
            if node.id.is_empty() {
                return Err(FlowError::invalid("vector node id must not be empty"));
            }
            if node.vector.is_empty() {
                node.vector = self.embedder.embed_one(&node.content).await?;
            }
        }
        let mut nodes = self.nodes.write().await;
        for node in incoming {
            nodes.insert(node.id.clone(), node);
        }
        Ok(())
    }

    async fn search(&self, query: &str, top_k: usize) -> FlowResult<Vec<ScoredNode>> {
        if top_k == 0 || query.is_empty() {
            return Ok(Vec::new());
        }
        let query_vector = self.embedder.embed_one(query).await?;
        let nodes = self.nodes.read().await;

        let mut scored: Vec<ScoredNode> = nodes
            .values()
            .map(|node| ScoredNode {
                score: cosine_similarity(&query_vector, &node.vector),
                node: node.clone(),
            })
            .collect();
        // Sort by score descending, then id for a deterministic tie-break.
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.node.id.cmp(&b.node.id))
        });
        scored.truncate(top_k);
        Ok(scored)
    }

    async fn delete(&self, ids: &[String]) -> FlowResult<()> {
        let mut nodes = self.nodes.write().await;
        for id in ids {
            nodes.remove(id);
        }
        Ok(())
    }

    async fn len(&self) -> usize {
        self.nodes.read().await.len()
    }
}
