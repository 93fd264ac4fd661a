//! Core types shared across the FlowLLM crates.
//!
//! This crate defines the error taxonomy, the wire-level data model
//! (stream chunks, messages, tool schemas, flow responses), the service
//! configuration model, and the tracing bootstrap. It has no knowledge of
//! ops, flows, or transports; those live in `flowllm-runtime` and
//! `flowllm-server`.

pub mod error;
pub mod logging;
pub mod types;

pub use error::{FlowError, FlowResult};
pub use types::chunk::{ChunkKind, StreamChunk};
pub use types::config::{
    EmbeddingConfig, FlowConfig, HttpConfig, LlmConfig, McpConfig, OpConfig, ServiceConfig,
    VectorStoreConfig,
};
pub use types::message::{Message, Role};
pub use types::response::FlowResponse;
pub use types::tool_call::{ParamAttrs, ParamType, ToolCall};
