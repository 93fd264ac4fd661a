//! Service layer: exposes the dispatcher's flows over HTTP (JSON + SSE)
//! and MCP (SSE transport).

pub mod http;
pub mod mcp;

use std::sync::Arc;

use flowllm_core::{FlowResult, ServiceConfig};
use flowllm_runtime::{Dispatcher, Registry, ServiceHandle, register_builtins};

/// Build the frozen service state and flow table from a loaded config.
///
/// Registers the built-in ops and capability backends, freezes the
/// registry, and parses every configured flow. Startup fails on the first
/// invalid flow or duplicate registration.
pub fn bootstrap(config: ServiceConfig) -> FlowResult<Arc<Dispatcher>> {
    let registry = Registry::new();
    register_builtins(&registry)?;
    let service = ServiceHandle::new(config, Arc::new(registry));
    Ok(Arc::new(Dispatcher::new(service)?))
}

/// Like [`bootstrap`], but lets the caller register additional ops and
/// backends before the registry freezes.
pub fn bootstrap_with<F>(config: ServiceConfig, register: F) -> FlowResult<Arc<Dispatcher>>
where
    F: FnOnce(&Registry) -> FlowResult<()>,
{
    let registry = Registry::new();
    register_builtins(&registry)?;
    register(&registry)?;
    let service = ServiceHandle::new(config, Arc::new(registry));
    Ok(Arc::new(Dispatcher::new(service)?))
}

/// Start the configured backend and serve until shutdown.
pub async fn serve(dispatcher: Arc<Dispatcher>) -> anyhow::Result<()> {
    let config = dispatcher.service().config().clone();
    match config.backend.as_str() {
        "mcp" => mcp::serve(dispatcher, &config.mcp).await,
        "cmd" => anyhow::bail!("the cmd backend is driven by `flowllm run`, not `serve`"),
        // HTTP is the default backend.
        _ => http::serve(dispatcher, &config.http).await,
    }
}
