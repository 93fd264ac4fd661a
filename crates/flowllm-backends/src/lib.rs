//! Opaque capabilities consumed by ops: LLMs, embedding models, vector
//! stores, token counters, and the prompt-file library.
//!
//! The runtime resolves these through the registry by name and treats them
//! as re-entrant shared handles; nothing here knows about flows or
//! transports. Concrete provider wiring lives outside this repository; the
//! in-tree implementations are the mock LLM (deterministic, used by tests
//! and as the default config) and an in-memory vector store.

pub mod embedding;
pub mod llm;
pub mod prompts;
pub mod token_counter;
pub mod vector_store;

pub use embedding::{EmbeddingModel, MockEmbedding};
pub use llm::{Llm, LlmChunk, LlmChunkKind, LlmResponse, MockLlm};
pub use prompts::PromptLibrary;
pub use token_counter::{SimpleTokenCounter, TokenCounter};
pub use vector_store::{MemoryVectorStore, VectorNode, VectorStore};
