//! Built-in ops and default capability backends.
//!
//! `register_builtins` is called once during service bootstrap, before the
//! registry freezes. It installs the gallery ops plus the in-process
//! capability backends (`mock` LLM, `mock` embeddings, `memory` vector
//! store, the default token counter) so a config with no external
//! providers is fully runnable.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flowllm_backends::llm::LlmChunkKind;
use flowllm_backends::{
    EmbeddingModel, Llm, MemoryVectorStore, MockEmbedding, MockLlm, PromptLibrary,
    SimpleTokenCounter, TokenCounter, VectorStore,
};
use flowllm_core::{
    ChunkKind, FlowResult, Message, ParamAttrs, ParamType, StreamChunk, ToolCall,
};

use crate::context::Context;
use crate::op::{BoxedOp, Op, OpIo, OpSpec};
use crate::registry::Registry;

/// Register the gallery ops and default capability backends.
pub fn register_builtins(registry: &Registry) -> FlowResult<()> {
    registry.register_op(
        "mock_op",
        Arc::new(|spec| Ok(Box::new(MockOp { spec }) as BoxedOp)),
    )?;
    registry.register_op(
        "stream_chat_op",
        Arc::new(|mut spec| {
            // Chat ops publish their final text as the flow answer.
            spec.save_answer = true;
            Ok(Box::new(StreamChatOp { spec, prompts: None }) as BoxedOp)
        }),
    )?;

    registry.register_op(
        "router_op",
        Arc::new(|spec| {
            Ok(Box::new(RouterOp {
                spec,
                routes: std::collections::BTreeMap::new(),
            }) as BoxedOp)
        }),
    )?;

    registry.register_llm(
        "mock",
        Arc::new(|config| {
            let model = if config.model_name.is_empty() {
                "mock".to_string()
            } else {
                config.model_name.clone()
            };
            let mut llm = MockLlm::new(model);
            if let Some(prefix) = config.params.get("prefix").and_then(|v| v.as_str()) {
                llm = llm.with_prefix(prefix);
            }
            if let Some(think) = config.params.get("think").and_then(|v| v.as_str()) {
                llm = llm.with_think(think);
            }
            Ok(Arc::new(llm) as Arc<dyn Llm>)
        }),
    )?;
    registry.register_embedding(
        "mock",
        Arc::new(|config| {
            let dimension = config
                .params
                .get("dimension")
                .and_then(|v| v.as_u64())
                .unwrap_or(256) as usize;
            Ok(Arc::new(MockEmbedding::new(dimension)) as Arc<dyn EmbeddingModel>)
        }),
    )?;
    registry.register_vector_store(
        "memory",
        Arc::new(|_config, embedder| {
            Ok(Arc::new(MemoryVectorStore::new(embedder)) as Arc<dyn VectorStore>)
        }),
    )?;
    registry.register_token_counter(
        "default",
        Arc::new(|| Arc::new(SimpleTokenCounter) as Arc<dyn TokenCounter>),
    )?;
    Ok(())
}

/// Dispatches to one of its named children (`router_op << {name: op, ...}`)
/// based on the `route` context value.
struct RouterOp {
    spec: OpSpec,
    routes: std::collections::BTreeMap<String, BoxedOp>,
}

#[async_trait]
impl Op for RouterOp {
    fn spec(&self) -> &OpSpec {
        &self.spec
    }

    fn spec_mut(&mut self) -> &mut OpSpec {
        &mut self.spec
    }

    fn tool_call(&self) -> Option<ToolCall> {
        Some(ToolCall::new("Route to a named child op.").with_input(
            "route",
            ParamAttrs::new(ParamType::String, "Name of the child to run").required(),
        ))
    }

    async fn async_execute(&mut self, ctx: &Context, io: &mut OpIo) -> FlowResult<()> {
        let route = io.require_str("route")?.to_string();
        let child = self.routes.get_mut(&route).ok_or_else(|| {
            flowllm_core::FlowError::execution(
                self.spec.name.clone(),
                format!("no child registered for route `{route}`"),
            )
        })?;
        let outputs = crate::op::runtime::async_call(child.as_mut(), ctx, &BTreeMap::new()).await?;
        io.outputs = outputs;
        Ok(())
    }

    fn attach_child(&mut self, name: String, child: BoxedOp) -> FlowResult<()> {
        if self.routes.contains_key(&name) {
            return Err(flowllm_core::FlowError::Parse {
                message: format!("route `{name}` is already attached"),
            });
        }
        self.routes.insert(name, child);
        Ok(())
    }

    fn boxed_clone(&self) -> BoxedOp {
        Box::new(RouterOp {
            spec: self.spec.clone(),
            routes: self
                .routes
                .iter()
                .map(|(name, child)| (name.clone(), child.boxed_clone()))
                .collect(),
        })
    }
}

/// Deterministic gallery op.
///
/// Echoes its `query` input (or the configured `value` param) behind a
/// prefix, optionally sleeping `delay_ms` first to simulate latency.
struct MockOp {
    spec: OpSpec,
}

#[async_trait]
impl Op for MockOp {
    fn spec(&self) -> &OpSpec {
        &self.spec
    }

    fn spec_mut(&mut self) -> &mut OpSpec {
        &mut self.spec
    }

    fn tool_call(&self) -> Option<ToolCall> {
        Some(
            ToolCall::new("Echo the query behind a configurable prefix.").with_input(
                "query",
                ParamAttrs::new(ParamType::String, "Text to echo back"),
            ),
        )
    }

    async fn async_execute(&mut self, ctx: &Context, io: &mut OpIo) -> FlowResult<()> {
        if let Some(delay) = self.spec.param_u64("delay_ms") {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            ctx.check_active()?;
        }
        let prefix = self.spec.param_str("prefix").unwrap_or("mock: ");
        let query = io
            .input_str("query")
            .or_else(|| self.spec.param_str("value"))
            .unwrap_or_default();
        io.set_result(format!("{prefix}{query}").into());
        Ok(())
    }

    fn boxed_clone(&self) -> BoxedOp {
        Box::new(MockOp {
            spec: self.spec.clone(),
        })
    }
}

/// Streams a chat completion from the configured LLM.
///
/// Forwards answer deltas (and think deltas, unless `enable_think=false`)
/// into the invocation's outbox and stores the assembled text as its
/// result. Always saves the final answer. The system prompt comes from the
/// `prompt_path` YAML file (entry `system`, with locale fallback) or the
/// `system_prompt` param.
struct StreamChatOp {
    spec: OpSpec,
    prompts: Option<PromptLibrary>,
}

impl StreamChatOp {
    /// Prompt file is loaded once per op lifetime.
    fn system_prompt(&mut self, query: &str) -> FlowResult<Option<String>> {
        let path = self.spec.param_str("prompt_path").map(str::to_string);
        if let Some(path) = path {
            if self.prompts.is_none() {
                self.prompts = Some(PromptLibrary::load(
                    std::path::Path::new(&path),
                    &self.spec.language,
                )?);
            }
            let vars = BTreeMap::from([("query".to_string(), query.to_string())]);
            if let Some(library) = &self.prompts {
                return library.format("system", &vars).map(Some);
            }
        }
        Ok(self.spec.param_str("system_prompt").map(str::to_string))
    }
}

#[async_trait]
impl Op for StreamChatOp {
    fn spec(&self) -> &OpSpec {
        &self.spec
    }

    fn spec_mut(&mut self) -> &mut OpSpec {
        &mut self.spec
    }

    fn tool_call(&self) -> Option<ToolCall> {
        Some(
            ToolCall::new("Chat with the configured model, streaming the reply.")
                .with_input(
                    "query",
                    ParamAttrs::new(ParamType::String, "User message").required(),
                )
                .with_output(
                    "answer",
                    ParamAttrs::new(ParamType::String, "Assembled model reply"),
                ),
        )
    }

    async fn async_execute(&mut self, ctx: &Context, io: &mut OpIo) -> FlowResult<()> {
        let query = io.require_str("query")?.to_string();
        let llm = ctx.service().llm(&self.spec.llm)?;
        let forward_think = self.spec.param_bool("enable_think").unwrap_or(true);

        let mut messages = Vec::new();
        if let Some(system) = self.system_prompt(&query)? {
            messages.push(Message::system(system));
        }
        messages.push(Message::user(&query));

        let mut stream = llm.chat_stream(&messages, &BTreeMap::new()).await?;
        let mut answer = String::new();
        while let Some(chunk) = stream.recv().await {
            ctx.check_active()?;
            let chunk = chunk?;
            match chunk.kind {
                LlmChunkKind::Answer => {
                    answer.push_str(&chunk.delta);
                    ctx.emit(StreamChunk::answer(chunk.delta)).await?;
                }
                LlmChunkKind::Think if forward_think => {
                    ctx.emit(StreamChunk::text(ChunkKind::Think, chunk.delta))
                        .await?;
                }
                LlmChunkKind::Think => {}
            }
        }

        let counter = ctx.service().token_counter("")?;
        let usage = counter.count_messages(&messages) + counter.count(&answer);
        ctx.set_response_field("usage", serde_json::json!({ "total_tokens": usage }));

        ctx.push_message(Message::user(query));
        ctx.push_message(Message::assistant(&answer));
        io.set_output("answer", answer.into());
        Ok(())
    }

    fn boxed_clone(&self) -> BoxedOp {
        Box::new(StreamChatOp {
            spec: self.spec.clone(),
            prompts: None,
        })
    }
}
