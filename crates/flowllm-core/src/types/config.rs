//! Service configuration model.
//!
//! Field names here are the contract the rest of the system reads; the
//! loader in `flowllm-config` only fills this tree in. Unknown keys in a
//! config file are ignored.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::tool_call::ParamAttrs;

fn default_workers() -> usize {
    128
}

fn default_stream_capacity() -> usize {
    64
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    8001
}

fn default_mcp_port() -> u16 {
    8002
}

fn default_transport() -> String {
    "sse".to_string()
}

fn default_max_retries() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

/// Top-level service configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ServiceConfig {
    /// Which service to start: `http`, `mcp`, or `cmd`.
    pub backend: String,

    /// Prompt locale; `foo_{language}` prompt entries win over `foo`.
    pub language: String,

    /// Size of the blocking worker pool.
    #[serde(default = "default_workers")]
    pub thread_pool_max_workers: usize,

    /// Bound of each streaming outbox channel.
    #[serde(default = "default_stream_capacity")]
    pub stream_capacity: usize,

    /// Default per-request deadline in seconds; 0 = none.
    pub timeout_seconds: u64,

    /// Directory for file-backed op cache persistence; empty = in-memory.
    pub cache_dir: String,

    pub http: HttpConfig,
    pub mcp: McpConfig,

    /// Flows exposed by the service, keyed by flow name.
    pub flow: BTreeMap<String, FlowConfig>,

    /// Per-op construction overrides, keyed by the name used in expressions.
    pub op: BTreeMap<String, OpConfig>,

    pub llm: BTreeMap<String, LlmConfig>,
    pub embedding_model: BTreeMap<String, EmbeddingConfig>,
    pub vector_store: BTreeMap<String, VectorStoreConfig>,
}

impl ServiceConfig {
    /// Deadline as a `Duration`, when configured.
    pub fn request_timeout(&self) -> Option<std::time::Duration> {
        (self.timeout_seconds > 0).then(|| std::time::Duration::from_secs(self.timeout_seconds))
    }
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            host: default_host(),
            port: default_http_port(),
        }
    }
}

/// MCP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct McpConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_mcp_port")]
    pub port: u16,
    /// Only `sse` is supported.
    #[serde(default = "default_transport")]
    pub transport: String,
}

impl Default for McpConfig {
    fn default() -> Self {
        McpConfig {
            host: default_host(),
            port: default_mcp_port(),
            transport: default_transport(),
        }
    }
}

/// One flow: an expression over registered ops plus service-facing metadata.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FlowConfig {
    /// The flow expression, e.g. `"search_op >> (summarize_op | cite_op)"`.
    /// May be multi-line; the last line must be the flow expression.
    pub flow_content: String,
    pub description: String,
    /// Expose as SSE instead of a single JSON response.
    pub stream: bool,
    /// Request schema. Mandatory for flows exposed over MCP.
    pub input_schema: BTreeMap<String, ParamAttrs>,
}

/// Construction overrides for an op name used in flow expressions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpConfig {
    /// Registered op this name is an instance of; empty = the name itself.
    pub backend: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_true")]
    pub raise_on_failure: bool,
    pub llm: String,
    pub embedding_model: String,
    pub vector_store: String,
    /// Free-form parameters handed to the op constructor.
    pub params: BTreeMap<String, Value>,
}

impl Default for OpConfig {
    fn default() -> Self {
        OpConfig {
            backend: String::new(),
            max_retries: default_max_retries(),
            raise_on_failure: true,
            llm: String::new(),
            embedding_model: String::new(),
            vector_store: String::new(),
            params: BTreeMap::new(),
        }
    }
}

/// An LLM capability entry.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LlmConfig {
    pub backend: String,
    pub model_name: String,
    pub params: BTreeMap<String, Value>,
}

/// An embedding model capability entry.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub backend: String,
    pub model_name: String,
    pub params: BTreeMap<String, Value>,
}

/// A vector store capability entry.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct VectorStoreConfig {
    pub backend: String,
    /// Name of the embedding model entry this store embeds with.
    pub embedding_model: String,
    pub params: BTreeMap<String, Value>,
}
