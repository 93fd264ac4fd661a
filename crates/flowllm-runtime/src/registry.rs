//! Name → constructor indirection for ops and resource capabilities.
//!
//! The registry is populated during service bootstrap and frozen before the
//! first request; lookups after that are read-only. Duplicate registration
//! under the same (category, name) is an error, lookups are case-sensitive,
//! and the resource categories honor the `default` entry convention.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use flowllm_backends::{EmbeddingModel, Llm, TokenCounter, VectorStore};
use flowllm_core::{EmbeddingConfig, FlowError, FlowResult, LlmConfig, VectorStoreConfig};

use crate::op::{BoxedOp, OpSpec};

/// Constructor signatures per category.
pub type OpCtor = Arc<dyn Fn(OpSpec) -> FlowResult<BoxedOp> + Send + Sync>;
pub type LlmCtor = Arc<dyn Fn(&LlmConfig) -> FlowResult<Arc<dyn Llm>> + Send + Sync>;
pub type EmbeddingCtor =
    Arc<dyn Fn(&EmbeddingConfig) -> FlowResult<Arc<dyn EmbeddingModel>> + Send + Sync>;
pub type VectorStoreCtor = Arc<
    dyn Fn(&VectorStoreConfig, Arc<dyn EmbeddingModel>) -> FlowResult<Arc<dyn VectorStore>>
        + Send
        + Sync,
>;
pub type TokenCounterCtor = Arc<dyn Fn() -> Arc<dyn TokenCounter> + Send + Sync>;

/// The frozen-after-startup constructor index.
#[derive(Default)]
pub struct Registry {
    ops: DashMap<String, OpCtor>,
    llms: DashMap<String, LlmCtor>,
    embeddings: DashMap<String, EmbeddingCtor>,
    vector_stores: DashMap<String, VectorStoreCtor>,
    token_counters: DashMap<String, TokenCounterCtor>,
    frozen: AtomicBool,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_mutable(&self, category: &str, name: &str) -> FlowResult<()> {
        if self.frozen.load(Ordering::SeqCst) {
            return Err(FlowError::execution(
                "registry",
                format!("cannot register {category} `{name}` after freeze"),
            ));
        }
        Ok(())
    }

    fn duplicate(category: &str, name: &str) -> FlowError {
        FlowError::execution(
            "registry",
            format!("{category} `{name}` is already registered"),
        )
    }

    /// Freeze the registry; all registration fails afterwards.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::SeqCst);
    }

    pub fn register_op(&self, name: impl Into<String>, ctor: OpCtor) -> FlowResult<()> {
        let name = name.into();
        self.check_mutable("op", &name)?;
        if self.ops.contains_key(&name) {
            return Err(Self::duplicate("op", &name));
        }
        tracing::debug!(op = %name, "registered op");
        self.ops.insert(name, ctor);
        Ok(())
    }

    pub fn register_llm(&self, name: impl Into<String>, ctor: LlmCtor) -> FlowResult<()> {
        let name = name.into();
        self.check_mutable("llm", &name)?;
        if self.llms.contains_key(&name) {
            return Err(Self::duplicate("llm", &name));
        }
        self.llms.insert(name, ctor);
        Ok(())
    }

    pub fn register_embedding(
        &self,
        name: impl Into<String>,
        ctor: EmbeddingCtor,
    ) -> FlowResult<()> {
        let name = name.into();
        self.check_mutable("embedding_model", &name)?;
        if self.embeddings.contains_key(&name) {
            return Err(Self::duplicate("embedding_model", &name));
        }
        self.embeddings.insert(name, ctor);
        Ok(())
    }

    pub fn register_vector_store(
        &self,
        name: impl Into<String>,
        ctor: VectorStoreCtor,
    ) -> FlowResult<()> {
        let name = name.into();
        self.check_mutable("vector_store", &name)?;
        if self.vector_stores.contains_key(&name) {
            return Err(Self::duplicate("vector_store", &name));
        }
        self.vector_stores.insert(name, ctor);
        Ok(())
    }

    pub fn register_token_counter(
        &self,
        name: impl Into<String>,
        ctor: TokenCounterCtor,
    ) -> FlowResult<()> {
        let name = name.into();
        self.check_mutable("token_counter", &name)?;
        if self.token_counters.contains_key(&name) {
            return Err(Self::duplicate("token_counter", &name));
        }
        self.token_counters.insert(name, ctor);
        Ok(())
    }

    pub fn has_op(&self, name: &str) -> bool {
        self.ops.contains_key(name)
    }

    pub fn op(&self, name: &str) -> FlowResult<OpCtor> {
        self.ops
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| FlowError::UnknownOp { name: name.into() })
    }

    pub fn llm(&self, name: &str) -> FlowResult<LlmCtor> {
        self.llms
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| unknown("llm", name))
    }

    pub fn embedding(&self, name: &str) -> FlowResult<EmbeddingCtor> {
        self.embeddings
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| unknown("embedding_model", name))
    }

    pub fn vector_store(&self, name: &str) -> FlowResult<VectorStoreCtor> {
        self.vector_stores
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| unknown("vector_store", name))
    }

    pub fn token_counter(&self, name: &str) -> FlowResult<TokenCounterCtor> {
        self.token_counters
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| unknown("token_counter", name))
    }

    /// Registered op names, for the parser's name check.
    pub fn op_names(&self) -> Vec<String> {
        self.ops.iter().map(|entry| entry.key().clone()).collect()
    }
}

/// Resolve an effective resource name: empty means `default`.
pub fn effective_name(name: &str) -> &str {
    if name.is_empty() { "default" } else { name }
}

fn unknown(category: &str, name: &str) -> FlowError {
    FlowError::UnknownResource {
        category: category.into(),
        name: name.into(),
    }
}
