//! Frozen per-service state shared by every invocation.
//!
//! One [`ServiceHandle`] is built at startup from the loaded config and the
//! populated registry, then never mutated. It owns the worker pool, the op
//! cache, and the memoized resource instances: LLMs, embedding models, and
//! vector stores are constructed once per name and shared by reference, so
//! they are required to be re-entrant.

use std::sync::Arc;

use dashmap::DashMap;
use flowllm_backends::{EmbeddingModel, Llm, TokenCounter, VectorStore};
use flowllm_core::{
    EmbeddingConfig, FlowError, FlowResult, LlmConfig, ServiceConfig, VectorStoreConfig,
};

use crate::cache::OpCache;
use crate::registry::{Registry, effective_name};
use crate::scheduler::WorkerPool;

pub struct ServiceHandle {
    config: ServiceConfig,
    registry: Arc<Registry>,
    pool: WorkerPool,
    cache: OpCache,
    llms: DashMap<String, Arc<dyn Llm>>,
    embeddings: DashMap<String, Arc<dyn EmbeddingModel>>,
    vector_stores: DashMap<String, Arc<dyn VectorStore>>,
    token_counters: DashMap<String, Arc<dyn TokenCounter>>,
}

impl ServiceHandle {
    /// Build the frozen service state. The registry is frozen here; no
    /// further registration is possible while serving.
    pub fn new(config: ServiceConfig, registry: Arc<Registry>) -> Arc<Self> {
        registry.freeze();
        let pool = WorkerPool::new(config.thread_pool_max_workers);
        let cache = if config.cache_dir.is_empty() {
            OpCache::in_memory()
        } else {
            OpCache::with_dir(&config.cache_dir)
        };
        Arc::new(ServiceHandle {
            pool,
            cache,
            config,
            registry,
            llms: DashMap::new(),
            embeddings: DashMap::new(),
            vector_stores: DashMap::new(),
            token_counters: DashMap::new(),
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Submit a blocking closure to the worker pool as an owned future.
    ///
    /// Same backpressure semantics as [`WorkerPool::submit`], but the
    /// returned future is `'static`, so callers can gather several
    /// submissions without borrowing the handle.
    pub fn submit_blocking<T, F>(
        self: &Arc<Self>,
        f: F,
    ) -> impl Future<Output = FlowResult<T>> + Send + 'static
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let service = Arc::clone(self);
        async move { service.pool.submit(f).await }
    }

    pub fn cache(&self) -> &OpCache {
        &self.cache
    }

    /// Resolve an LLM by config name (empty = `default`), memoizing the
    /// constructed instance.
    pub fn llm(&self, name: &str) -> FlowResult<Arc<dyn Llm>> {
        let name = effective_name(name);
        if let Some(instance) = self.llms.get(name) {
            return Ok(Arc::clone(instance.value()));
        }
        let instance = match self.config.llm.get(name) {
            Some(config) => (self.registry.llm(&config.backend)?)(config)?,
            // No config entry: allow a backend registered under this name
            // directly, with default settings (used by tests and minimal
            // setups).
            None => (self.registry.llm(name).map_err(|_| not_configured("llm", name))?)(
                &LlmConfig::default(),
            )?,
        };
        self.llms.insert(name.to_string(), Arc::clone(&instance));
        Ok(instance)
    }

    /// Resolve an embedding model by config name (empty = `default`).
    pub fn embedding_model(&self, name: &str) -> FlowResult<Arc<dyn EmbeddingModel>> {
        let name = effective_name(name);
        if let Some(instance) = self.embeddings.get(name) {
            return Ok(Arc::clone(instance.value()));
        }
        let instance = match self.config.embedding_model.get(name) {
            Some(config) => (self.registry.embedding(&config.backend)?)(config)?,
            None => (self
                .registry
                .embedding(name)
                .map_err(|_| not_configured("embedding_model", name))?)(
                &EmbeddingConfig::default(),
            )?,
        };
        self.embeddings
            .insert(name.to_string(), Arc::clone(&instance));
        Ok(instance)
    }

    /// Resolve a vector store by config name (empty = `default`). The
    /// store's embedding model is resolved first and handed to the ctor.
    pub fn vector_store(&self, name: &str) -> FlowResult<Arc<dyn VectorStore>> {
        let name = effective_name(name);
        if let Some(instance) = self.vector_stores.get(name) {
            return Ok(Arc::clone(instance.value()));
        }
        let instance = match self.config.vector_store.get(name) {
            Some(config) => {
                let embedder = self.embedding_model(&config.embedding_model)?;
                (self.registry.vector_store(&config.backend)?)(config, embedder)?
            }
            None => {
                let ctor = self
                    .registry
                    .vector_store(name)
                    .map_err(|_| not_configured("vector_store", name))?;
                let embedder = self.embedding_model("")?;
                ctor(&VectorStoreConfig::default(), embedder)?
            }
        };
        self.vector_stores
            .insert(name.to_string(), Arc::clone(&instance));
        Ok(instance)
    }

    /// Resolve a token counter by registry name (empty = `default`).
    pub fn token_counter(&self, name: &str) -> FlowResult<Arc<dyn TokenCounter>> {
        let name = effective_name(name);
        if let Some(instance) = self.token_counters.get(name) {
            return Ok(Arc::clone(instance.value()));
        }
        let instance = (self.registry.token_counter(name)?)();
        self.token_counters
            .insert(name.to_string(), Arc::clone(&instance));
        Ok(instance)
    }
}

fn not_configured(category: &str, name: &str) -> FlowError {
    FlowError::UnknownResource {
        category: category.into(),
        name: name.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowllm_backends::MockLlm;

    fn registry_with_mock() -> Arc<Registry> {
        let registry = Registry::new();
        registry
            .register_llm(
                "mock",
                Arc::new(|config: &LlmConfig| {
                    let model = if config.model_name.is_empty() {
                        "mock".to_string()
                    } else {
                        config.model_name.clone()
                    };
                    Ok(Arc::new(MockLlm::new(model)) as Arc<dyn Llm>)
                }),
            )
            .unwrap();
        Arc::new(registry)
    }

    #[test]
    fn test_llm_resolution_via_config() {
        let mut config = ServiceConfig::default();
        config.llm.insert(
            "default".to_string(),
            LlmConfig {
                backend: "mock".to_string(),
                model_name: "mock-large".to_string(),
                ..Default::default()
            },
        );
        let service = ServiceHandle::new(config, registry_with_mock());

        let llm = service.llm("").unwrap();
        assert_eq!(llm.model_name(), "mock-large");
        // Memoized: same Arc on second resolution.
        let again = service.llm("default").unwrap();
        assert!(Arc::ptr_eq(&llm, &again));
    }

    #[test]
    fn test_unknown_resource() {
        let service = ServiceHandle::new(ServiceConfig::default(), Arc::new(Registry::new()));
        assert!(matches!(
            service.llm("nope"),
            Err(FlowError::UnknownResource { .. })
        ));
    }

    #[test]
    fn test_handle_freezes_registry() {
        let registry = registry_with_mock();
        let _service = ServiceHandle::new(ServiceConfig::default(), Arc::clone(&registry));
        assert!(
            registry
                .register_llm("late", Arc::new(|_| unreachable!()))
                .is_err()
        );
    }
}
