//! The op invocation state machine.
//!
//! Both entry points drive the same lifecycle:
//!
//! 1. bind call kwargs into the context,
//! 2. probe the cache (fingerprint = short name + cache-affecting inputs),
//! 3. extract tool inputs from the context (mappings and tool index applied),
//! 4. execute with retries (transient errors only, while budget remains),
//! 5. on exhaustion either surface the error or take the default output,
//! 6. write tool outputs back to the context and the response record,
//! 7. store to cache (skipped for cache hits and default outputs),
//! 8. return the outputs.
//!
//! Cancellation and deadline expiry short-circuit everything after the
//! failing point: no after-execute, no cache store.

use std::collections::BTreeMap;

use flowllm_core::{FlowError, FlowResult, ToolCall};
use serde_json::Value;

use crate::cache::OpCache;
use crate::context::Context;
use crate::op::{Op, OpIo, OpSpec, outputs_to_value, value_to_outputs};

/// Invoke a cooperative op.
pub async fn async_call(
    op: &mut dyn Op,
    ctx: &Context,
    kwargs: &BTreeMap<String, Value>,
) -> FlowResult<BTreeMap<String, Value>> {
    bind(ctx, kwargs);
    ctx.check_active()?;

    let spec = op.spec().clone();
    if !spec.async_mode {
        return Err(FlowError::execution(
            spec.name,
            "blocking op invoked on the cooperative path",
        ));
    }
    let tool_call = resolved_tool_call(op);
    let mut io = OpIo::new(default_output_key(&tool_call));

    // Cache probe, with single-flight on miss.
    let mut build_guard = None;
    let cache_key = cache_key(&spec, tool_call.as_ref(), ctx, kwargs);
    if let Some(key) = &cache_key {
        let cache = ctx.service().cache();
        if let Some(hit) = cache.get(key) {
            return cache_hit(&spec, hit);
        }
        let guard = cache.build_lock(key).await;
        if let Some(hit) = cache.get(key) {
            return cache_hit(&spec, hit);
        }
        build_guard = Some(guard);
    }

    if let Some(tool_call) = &tool_call {
        extract_inputs(&spec, tool_call, ctx, &mut io)?;
    }

    let mut attempt = 0;
    loop {
        attempt += 1;
        ctx.check_active()?;
        match op.async_execute(ctx, &mut io).await {
            Ok(()) => break,
            Err(error) => {
                if !retry_or_fallback(op, &spec, attempt, error, &mut io)? {
                    break;
                }
            }
        }
    }

    finish(&spec, &tool_call, ctx, &mut io, cache_key.as_deref())?;
    drop(build_guard);
    Ok(io.outputs)
}

/// Invoke a blocking op. Runs on a worker-pool thread.
pub fn call(
    op: &mut dyn Op,
    ctx: &Context,
    kwargs: &BTreeMap<String, Value>,
) -> FlowResult<BTreeMap<String, Value>> {
    bind(ctx, kwargs);
    ctx.check_active()?;

    let spec = op.spec().clone();
    if spec.async_mode {
        return Err(FlowError::execution(
            spec.name,
            "cooperative op invoked on the blocking path",
        ));
    }
    let tool_call = resolved_tool_call(op);
    let mut io = OpIo::new(default_output_key(&tool_call));

    let mut build_guard = None;
    let cache_key = cache_key(&spec, tool_call.as_ref(), ctx, kwargs);
    if let Some(key) = &cache_key {
        let cache = ctx.service().cache();
        if let Some(hit) = cache.get(key) {
            return cache_hit(&spec, hit);
        }
        let guard = cache.build_lock_blocking(key);
        if let Some(hit) = cache.get(key) {
            return cache_hit(&spec, hit);
        }
        build_guard = Some(guard);
    }

    if let Some(tool_call) = &tool_call {
        extract_inputs(&spec, tool_call, ctx, &mut io)?;
    }

    let mut attempt = 0;
    loop {
        attempt += 1;
        ctx.check_active()?;
        match op.execute(ctx, &mut io) {
            Ok(()) => break,
            Err(error) => {
                if !retry_or_fallback(op, &spec, attempt, error, &mut io)? {
                    break;
                }
            }
        }
    }

    finish(&spec, &tool_call, ctx, &mut io, cache_key.as_deref())?;
    drop(build_guard);
    Ok(io.outputs)
}

/// Handle one failed attempt. Returns `Ok(true)` to retry, `Ok(false)` when
/// the default fallback was taken, `Err` to surface.
fn retry_or_fallback(
    op: &mut dyn Op,
    spec: &OpSpec,
    attempt: u32,
    error: FlowError,
    io: &mut OpIo,
) -> FlowResult<bool> {
    // Cancellation and timeouts pass straight through: the deadline that
    // produced them still stands, and cleanup must not run.
    if matches!(error, FlowError::Cancelled | FlowError::Timeout { .. }) {
        return Err(error);
    }

    tracing::warn!(
        op = %spec.name,
        attempt,
        max_retries = spec.max_retries,
        error = %error,
        "op execute failed"
    );

    if error.is_retryable() && attempt < spec.max_retries {
        io.outputs.clear();
        return Ok(true);
    }

    if spec.raise_on_failure {
        return Err(error);
    }

    io.outputs.clear();
    op.default_execute(io);
    io.output_is_default = true;
    Ok(false)
}

/// After-execute and cache store.
fn finish(
    spec: &OpSpec,
    tool_call: &Option<ToolCall>,
    ctx: &Context,
    io: &mut OpIo,
    cache_key: Option<&str>,
) -> FlowResult<()> {
    // A cancellation that raced the last attempt skips all cleanup.
    ctx.check_active()?;

    if let Some(tool_call) = tool_call {
        write_outputs(spec, tool_call, ctx, io);
    }

    if let Some(key) = cache_key
        && !io.output_is_default
        && let Some(policy) = &spec.cache
    {
        ctx.service()
            .cache()
            .put(key, outputs_to_value(&io.outputs), policy.expire)?;
    }
    Ok(())
}

fn bind(ctx: &Context, kwargs: &BTreeMap<String, Value>) {
    for (key, value) in kwargs {
        ctx.insert(key.clone(), value.clone());
    }
}

/// The op's tool schema with the default output schema filled in.
fn resolved_tool_call(op: &dyn Op) -> Option<ToolCall> {
    let mut call = op.tool_call()?;
    call.ensure_output_schema(op.spec().short_name());
    if call.name.is_empty() {
        call.name = op.spec().short_name().to_string();
    }
    Some(call)
}

fn default_output_key(tool_call: &Option<ToolCall>) -> Option<String> {
    tool_call
        .as_ref()
        .and_then(|call| call.output_schema.keys().next().cloned())
}

/// Context key for a schema input/output name: mapping first, then the
/// `.{tool_index}` suffix.
fn mapped_key(name: &str, mapping: &BTreeMap<String, String>, tool_index: u32) -> String {
    let base = mapping.get(name).cloned().unwrap_or_else(|| name.to_string());
    if tool_index == 0 {
        base
    } else {
        format!("{base}.{tool_index}")
    }
}

/// The fingerprint for a cache-enabled op: declared schema inputs when a
/// tool schema exists, otherwise the raw call kwargs.
fn cache_key(
    spec: &OpSpec,
    tool_call: Option<&ToolCall>,
    ctx: &Context,
    kwargs: &BTreeMap<String, Value>,
) -> Option<String> {
    let policy = spec.cache.as_ref()?;
    if !policy.enabled {
        return None;
    }
    let inputs = match tool_call {
        Some(call) => {
            let mut inputs = BTreeMap::new();
            for name in call.input_schema.keys() {
                let key = mapped_key(name, &spec.input_schema_mapping, spec.tool_index);
                if let Some(value) = ctx.get(&key) {
                    inputs.insert(name.clone(), value);
                }
            }
            inputs
        }
        None => kwargs.clone(),
    };
    Some(OpCache::fingerprint(spec.short_name(), &inputs))
}

fn cache_hit(spec: &OpSpec, hit: Value) -> FlowResult<BTreeMap<String, Value>> {
    tracing::debug!(op = %spec.name, "loaded op output from cache");
    Ok(value_to_outputs(hit))
}

/// Pull declared inputs out of the context into `io.inputs`.
fn extract_inputs(
    spec: &OpSpec,
    tool_call: &ToolCall,
    ctx: &Context,
    io: &mut OpIo,
) -> FlowResult<()> {
    for (name, attrs) in &tool_call.input_schema {
        let key = mapped_key(name, &spec.input_schema_mapping, spec.tool_index);
        if let Some(value) = ctx.get(&key) {
            io.inputs.insert(name.clone(), value);
        } else if let Some(default) = &attrs.default {
            io.inputs.insert(name.clone(), default.clone());
        } else if attrs.required {
            return Err(FlowError::invalid(format!(
                "{}: `{name}` is required",
                spec.name
            )));
        }
    }
    Ok(())
}

/// Write `io.outputs` back to the context and the response record.
fn write_outputs(spec: &OpSpec, tool_call: &ToolCall, ctx: &Context, io: &OpIo) {
    for (name, value) in &io.outputs {
        let key = mapped_key(name, &spec.output_schema_mapping, spec.tool_index);
        ctx.insert(key.clone(), value.clone());
        ctx.set_response_field(key, value.clone());
    }

    if spec.save_answer {
        let keys = tool_call.output_keys();
        let answer = if keys.len() == 1 {
            match io.outputs.get(keys[0]) {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            }
        } else {
            outputs_to_value(&io.outputs).to_string()
        };
        ctx.set_answer(answer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::BoxedOp;
    use crate::registry::Registry;
    use crate::service::ServiceHandle;
    use async_trait::async_trait;
    use flowllm_core::{ParamAttrs, ParamType, ServiceConfig};
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_context() -> Context {
        let service = ServiceHandle::new(ServiceConfig::default(), Arc::new(Registry::new()));
        Context::builder(service).build()
    }

    /// Tool op that fails a configurable number of times before succeeding.
    struct FlakyOp {
        spec: OpSpec,
        fail_first: u32,
        calls: Arc<AtomicU32>,
        retryable: bool,
    }

    impl FlakyOp {
        fn new(fail_first: u32, retryable: bool) -> Self {
            let mut spec = OpSpec::new("flaky_op");
            spec.max_retries = 3;
            FlakyOp {
                spec,
                fail_first,
                calls: Arc::new(AtomicU32::new(0)),
                retryable,
            }
        }
    }

    #[async_trait]
    impl Op for FlakyOp {
        fn spec(&self) -> &OpSpec {
            &self.spec
        }
        fn spec_mut(&mut self) -> &mut OpSpec {
            &mut self.spec
        }
        fn tool_call(&self) -> Option<ToolCall> {
            Some(ToolCall::new("flaky test tool").with_input(
                "text",
                ParamAttrs::new(ParamType::String, "input text").required(),
            ))
        }
        async fn async_execute(&mut self, _ctx: &Context, io: &mut OpIo) -> FlowResult<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_first {
                if self.retryable {
                    return Err(FlowError::transient("rate limited"));
                }
                return Err(FlowError::execution("flaky_op", "deterministic failure"));
            }
            let text = io.require_str("text")?.to_string();
            io.set_result(json!(format!("ok: {text}")));
            Ok(())
        }
        fn boxed_clone(&self) -> BoxedOp {
            Box::new(FlakyOp {
                spec: self.spec.clone(),
                fail_first: self.fail_first,
                calls: Arc::clone(&self.calls),
                retryable: self.retryable,
            })
        }
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let mut op = FlakyOp::new(2, true);
        let ctx = test_context();
        ctx.insert("text", json!("hello"));

        let outputs = async_call(&mut op, &ctx, &BTreeMap::new()).await.unwrap();
        assert_eq!(outputs["flaky_result"], json!("ok: hello"));
        assert_eq!(op.calls.load(Ordering::SeqCst), 3);
        // Outputs are mirrored into the context and the response record.
        assert_eq!(ctx.get("flaky_result"), Some(json!("ok: hello")));
        assert_eq!(ctx.response().metadata["flaky_result"], json!("ok: hello"));
    }

    #[tokio::test]
    async fn test_deterministic_errors_are_not_retried() {
        let mut op = FlakyOp::new(2, false);
        let ctx = test_context();
        ctx.insert("text", json!("hello"));

        let error = async_call(&mut op, &ctx, &BTreeMap::new()).await.unwrap_err();
        assert!(matches!(error, FlowError::Execution { .. }));
        assert_eq!(op.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_with_default_fallback() {
        let mut op = FlakyOp::new(10, true);
        op.spec.raise_on_failure = false;
        let ctx = test_context();
        ctx.insert("text", json!("hello"));

        let outputs = async_call(&mut op, &ctx, &BTreeMap::new()).await.unwrap();
        assert_eq!(op.calls.load(Ordering::SeqCst), 3);
        assert_eq!(outputs["flaky_result"], json!("flaky_op execution failed!"));
    }

    #[tokio::test]
    async fn test_missing_required_input() {
        let mut op = FlakyOp::new(0, true);
        let ctx = test_context();

        let error = async_call(&mut op, &ctx, &BTreeMap::new()).await.unwrap_err();
        assert!(matches!(error, FlowError::InputValidation { .. }));
        assert_eq!(op.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_kwargs_bind_into_context() {
        let mut op = FlakyOp::new(0, true);
        let ctx = test_context();
        let kwargs = BTreeMap::from([("text".to_string(), json!("bound"))]);

        let outputs = async_call(&mut op, &ctx, &kwargs).await.unwrap();
        assert_eq!(outputs["flaky_result"], json!("ok: bound"));
    }

    #[tokio::test]
    async fn test_tool_index_suffixes_keys() {
        let mut op = FlakyOp::new(0, true);
        op.spec.tool_index = 2;
        let ctx = test_context();
        ctx.insert("text.2", json!("indexed"));

        let outputs = async_call(&mut op, &ctx, &BTreeMap::new()).await.unwrap();
        assert_eq!(outputs["flaky_result"], json!("ok: indexed"));
        assert_eq!(ctx.get("flaky_result.2"), Some(json!("ok: indexed")));
        assert!(ctx.get("flaky_result").is_none());
    }

    #[tokio::test]
    async fn test_schema_mappings_rename_keys() {
        let mut op = FlakyOp::new(0, true);
        op.spec
            .input_schema_mapping
            .insert("text".to_string(), "raw_text".to_string());
        op.spec
            .output_schema_mapping
            .insert("flaky_result".to_string(), "renamed".to_string());
        let ctx = test_context();
        ctx.insert("raw_text", json!("mapped"));

        async_call(&mut op, &ctx, &BTreeMap::new()).await.unwrap();
        assert_eq!(ctx.get("renamed"), Some(json!("ok: mapped")));
    }

    #[tokio::test]
    async fn test_save_answer_single_output() {
        let mut op = FlakyOp::new(0, true);
        op.spec.save_answer = true;
        let ctx = test_context();
        ctx.insert("text", json!("hi"));

        async_call(&mut op, &ctx, &BTreeMap::new()).await.unwrap();
        assert_eq!(ctx.response().answer, "ok: hi");
    }

    #[tokio::test]
    async fn test_cache_law_second_call_skips_execute() {
        let mut op = FlakyOp::new(0, true);
        op.spec.cache = Some(crate::cache::CachePolicy {
            enabled: true,
            expire: std::time::Duration::from_secs(60),
        });
        let ctx = test_context();
        ctx.insert("text", json!("hello"));

        let first = async_call(&mut op, &ctx, &BTreeMap::new()).await.unwrap();
        let second = async_call(&mut op, &ctx, &BTreeMap::new()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(op.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cache_single_flight_under_concurrency() {
        let template = {
            let mut op = FlakyOp::new(0, true);
            op.spec.cache = Some(crate::cache::CachePolicy {
                enabled: true,
                expire: std::time::Duration::from_secs(60),
            });
            op
        };
        let calls = Arc::clone(&template.calls);
        let service = ServiceHandle::new(ServiceConfig::default(), Arc::new(Registry::new()));
        let ctx = Context::builder(service).request(json!({"text": "same"})).build();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let mut op = template.boxed_clone();
            let ctx = ctx.clone();
            handles.push(tokio::spawn(async move {
                async_call(op.as_mut(), &ctx, &BTreeMap::new()).await
            }));
        }
        for handle in handles {
            let outputs = handle.await.unwrap().unwrap();
            assert_eq!(outputs["flaky_result"], json!("ok: same"));
        }
        // The execute body ran exactly once across concurrent duplicates.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_context_skips_execution() {
        let mut op = FlakyOp::new(0, true);
        let ctx = test_context();
        ctx.insert("text", json!("hello"));
        ctx.cancel();

        let error = async_call(&mut op, &ctx, &BTreeMap::new()).await.unwrap_err();
        assert!(matches!(error, FlowError::Cancelled));
        assert_eq!(op.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_blocking_op_runs_on_the_worker_pool() {
        struct UpperOp {
            spec: OpSpec,
        }
        #[async_trait]
        impl Op for UpperOp {
            fn spec(&self) -> &OpSpec {
                &self.spec
            }
            fn spec_mut(&mut self) -> &mut OpSpec {
                &mut self.spec
            }
            fn execute(&mut self, ctx: &Context, io: &mut OpIo) -> FlowResult<()> {
                let text = ctx.get_str("text").unwrap_or_default();
                io.set_result(json!(text.to_uppercase()));
                Ok(())
            }
            fn boxed_clone(&self) -> BoxedOp {
                Box::new(UpperOp {
                    spec: self.spec.clone(),
                })
            }
        }

        let service = ServiceHandle::new(ServiceConfig::default(), Arc::new(Registry::new()));
        let ctx = Context::builder(Arc::clone(&service))
            .request(json!({"text": "abc"}))
            .build();

        let mut op: BoxedOp = Box::new(UpperOp {
            spec: OpSpec::blocking("upper_op"),
        });
        let run_ctx = ctx.clone();
        let outputs = service
            .submit_blocking(move || call(op.as_mut(), &run_ctx, &BTreeMap::new()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outputs["result"], json!("ABC"));
    }

    #[tokio::test]
    async fn test_mode_mismatch_is_rejected() {
        let mut op = FlakyOp::new(0, true);
        op.spec.async_mode = false;
        let ctx = test_context();
        ctx.insert("text", json!("x"));
        assert!(async_call(&mut op, &ctx, &BTreeMap::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_max_retries_one_means_single_attempt() {
        let mut op = FlakyOp::new(1, true);
        op.spec.max_retries = 1;
        let ctx = test_context();
        ctx.insert("text", json!("hello"));

        let error = async_call(&mut op, &ctx, &BTreeMap::new()).await.unwrap_err();
        assert!(matches!(error, FlowError::Transient { .. }));
        assert_eq!(op.calls.load(Ordering::SeqCst), 1);
    }
}
