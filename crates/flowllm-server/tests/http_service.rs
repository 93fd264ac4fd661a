//! End-to-end HTTP service tests against a real listener.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use flowllm_core::{
    FlowConfig, FlowResult, ParamAttrs, ParamType, ServiceConfig, StreamChunk, ToolCall,
};
use flowllm_runtime::op::runtime as op_runtime;
use flowllm_runtime::{BoxedOp, Context, Op, OpIo, OpSpec, Registry};
use serde_json::{Value, json};

struct EchoOp {
    spec: OpSpec,
}

#[async_trait]
impl Op for EchoOp {
    fn spec(&self) -> &OpSpec {
        &self.spec
    }
    fn spec_mut(&mut self) -> &mut OpSpec {
        &mut self.spec
    }
    async fn async_execute(&mut self, ctx: &Context, _io: &mut OpIo) -> FlowResult<()> {
        let text = ctx.get_str("text").unwrap_or_default();
        ctx.set_answer(format!("echo: {text}"));
        Ok(())
    }
    fn boxed_clone(&self) -> BoxedOp {
        Box::new(EchoOp {
            spec: self.spec.clone(),
        })
    }
}

struct AddOneOp {
    spec: OpSpec,
}

#[async_trait]
impl Op for AddOneOp {
    fn spec(&self) -> &OpSpec {
        &self.spec
    }
    fn spec_mut(&mut self) -> &mut OpSpec {
        &mut self.spec
    }
    fn tool_call(&self) -> Option<ToolCall> {
        Some(
            ToolCall::new("increment n")
                .with_input("n", ParamAttrs::new(ParamType::Integer, "counter").required())
                .with_output("n", ParamAttrs::new(ParamType::Integer, "incremented")),
        )
    }
    async fn async_execute(&mut self, _ctx: &Context, io: &mut OpIo) -> FlowResult<()> {
        let n = io.input("n").and_then(Value::as_i64).unwrap_or(0);
        io.set_output("n", json!(n + 1));
        Ok(())
    }
    fn boxed_clone(&self) -> BoxedOp {
        Box::new(AddOneOp {
            spec: self.spec.clone(),
        })
    }
}

struct LenOp {
    spec: OpSpec,
}

#[async_trait]
impl Op for LenOp {
    fn spec(&self) -> &OpSpec {
        &self.spec
    }
    fn spec_mut(&mut self) -> &mut OpSpec {
        &mut self.spec
    }
    fn tool_call(&self) -> Option<ToolCall> {
        Some(
            ToolCall::new("text length")
                .with_input("text", ParamAttrs::new(ParamType::String, "input").required())
                .with_output("len", ParamAttrs::new(ParamType::Integer, "length")),
        )
    }
    async fn async_execute(&mut self, _ctx: &Context, io: &mut OpIo) -> FlowResult<()> {
        tokio::time::sleep(Duration::from_millis(60)).await;
        let text = io.require_str("text")?;
        io.set_output("len", json!(text.len()));
        Ok(())
    }
    fn boxed_clone(&self) -> BoxedOp {
        Box::new(LenOp {
            spec: self.spec.clone(),
        })
    }
}

struct CountStreamOp {
    spec: OpSpec,
}

#[async_trait]
impl Op for CountStreamOp {
    fn spec(&self) -> &OpSpec {
        &self.spec
    }
    fn spec_mut(&mut self) -> &mut OpSpec {
        &mut self.spec
    }
    async fn async_execute(&mut self, ctx: &Context, _io: &mut OpIo) -> FlowResult<()> {
        for i in 1..=3 {
            ctx.emit(StreamChunk::answer(i.to_string())).await?;
        }
        Ok(())
    }
    fn boxed_clone(&self) -> BoxedOp {
        Box::new(CountStreamOp {
            spec: self.spec.clone(),
        })
    }
}

struct SlowOp {
    spec: OpSpec,
}

#[async_trait]
impl Op for SlowOp {
    fn spec(&self) -> &OpSpec {
        &self.spec
    }
    fn spec_mut(&mut self) -> &mut OpSpec {
        &mut self.spec
    }
    async fn async_execute(&mut self, ctx: &Context, _io: &mut OpIo) -> FlowResult<()> {
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            ctx.check_active()?;
        }
        Ok(())
    }
    fn boxed_clone(&self) -> BoxedOp {
        Box::new(SlowOp {
            spec: self.spec.clone(),
        })
    }
}

fn register_test_ops(registry: &Registry) -> FlowResult<()> {
    registry.register_op("echo_op", Arc::new(|spec| Ok(Box::new(EchoOp { spec }) as BoxedOp)))?;
    registry.register_op(
        "add_one_op",
        Arc::new(|spec| Ok(Box::new(AddOneOp { spec }) as BoxedOp)),
    )?;
    registry.register_op("len_op", Arc::new(|spec| Ok(Box::new(LenOp { spec }) as BoxedOp)))?;
    registry.register_op(
        "count_stream_op",
        Arc::new(|spec| Ok(Box::new(CountStreamOp { spec }) as BoxedOp)),
    )?;
    registry.register_op("slow_op", Arc::new(|spec| Ok(Box::new(SlowOp { spec }) as BoxedOp)))?;
    Ok(())
}

fn flow(content: &str, stream: bool) -> FlowConfig {
    FlowConfig {
        flow_content: content.to_string(),
        stream,
        ..Default::default()
    }
}

fn test_config() -> ServiceConfig {
    let mut config = ServiceConfig::default();
    config.timeout_seconds = 1;
    config.flow.insert("demo_echo".to_string(), flow("echo_op", false));
    config.flow.insert(
        "inc3".to_string(),
        flow("add_one_op >> add_one_op >> add_one_op", false),
    );
    config.flow.insert(
        "lens".to_string(),
        flow("len_op(tool_index=1) | len_op(tool_index=2)", false),
    );
    config.flow.insert("count".to_string(), flow("count_stream_op", true));
    config.flow.insert("slow".to_string(), flow("slow_op", false));
    config
}

async fn start_server() -> SocketAddr {
    let dispatcher = flowllm_server::bootstrap_with(test_config(), register_test_ops).unwrap();
    let app = flowllm_server::http::router(dispatcher);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn post(addr: SocketAddr, path: &str, body: Value) -> reqwest::Response {
    reqwest::Client::new()
        .post(format!("http://{addr}{path}"))
        .json(&body)
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_health() {
    let addr = start_server().await;
    let response = reqwest::get(format!("http://{addr}/health")).await.unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_openapi_lists_flows() {
    let addr = start_server().await;
    let body: Value = reqwest::get(format!("http://{addr}/openapi.json"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(body["paths"]["/demo_echo"]["post"].is_object());
    assert!(body["paths"]["/count"]["post"].is_object());
}

#[tokio::test]
async fn test_echo_over_http() {
    let addr = start_server().await;
    let response = post(addr, "/demo_echo", json!({"text": "hi"})).await;
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["answer"], "echo: hi");
    assert_eq!(body["messages"], json!([]));
}

#[tokio::test]
async fn test_sequential_composition_over_http() {
    let addr = start_server().await;
    let body: Value = post(addr, "/inc3", json!({"n": 0})).await.json().await.unwrap();
    assert_eq!(body["n"], 3);
}

#[tokio::test]
async fn test_parallel_aggregation_over_http() {
    let addr = start_server().await;
    let started = Instant::now();
    let body: Value = post(addr, "/lens", json!({"text.1": "ab", "text.2": "xyz"}))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(body["len.1"], 2);
    assert_eq!(body["len.2"], 3);
    // Both 60ms ops ran concurrently.
    assert!(started.elapsed() < Duration::from_millis(115));
}

#[tokio::test]
async fn test_streaming_flow_over_sse() {
    let addr = start_server().await;
    let response = post(addr, "/count", json!({})).await;
    assert_eq!(response.status(), 200);
    let content_type = response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(content_type.starts_with("text/event-stream"));

    let body = response.text().await.unwrap();
    let events: Vec<&str> = body
        .lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .collect();
    assert_eq!(events.len(), 4);
    for (event, expected) in events.iter().take(3).zip(["1", "2", "3"]) {
        let parsed: Value = serde_json::from_str(event).unwrap();
        assert_eq!(parsed["type"], "answer");
        assert_eq!(parsed["content"], expected);
    }
    assert_eq!(events[3], "[DONE]");
}

#[tokio::test]
async fn test_timeout_returns_408_and_settles() {
    let addr = start_server().await;
    let started = Instant::now();
    let response = post(addr, "/slow", json!({})).await;
    assert_eq!(response.status(), 408);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "timeout");
    // 1s configured deadline, generous scheduling margin.
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_unknown_flow_is_404() {
    let addr = start_server().await;
    let response = post(addr, "/missing_flow", json!({})).await;
    assert_eq!(response.status(), 404);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "unknown_flow");
}

#[tokio::test]
async fn test_non_object_body_is_400() {
    let addr = start_server().await;
    let response = post(addr, "/demo_echo", json!([1, 2, 3])).await;
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_unknown_fields_pass_through() {
    let addr = start_server().await;
    // `text` is consumed by the op; `trace_id` simply flows through.
    let body: Value = post(addr, "/demo_echo", json!({"text": "x", "trace_id": "abc"}))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(body["answer"], "echo: x");
}

/// The schema law: inputs extracted before execute equal the kwargs bound
/// into the context, and outputs written back equal the context slice.
#[tokio::test]
async fn test_tool_io_round_trip() {
    let dispatcher = flowllm_server::bootstrap_with(test_config(), register_test_ops).unwrap();
    let service = Arc::clone(dispatcher.service());
    let ctor = service.registry().op("add_one_op").unwrap();
    let mut op = ctor(OpSpec::new("add_one_op")).unwrap();

    let ctx = Context::builder(service).build();
    let kwargs = BTreeMap::from([("n".to_string(), json!(41))]);
    let outputs = op_runtime::async_call(op.as_mut(), &ctx, &kwargs).await.unwrap();
    assert_eq!(outputs["n"], json!(42));
    assert_eq!(ctx.get("n"), Some(json!(42)));
}

#[tokio::test]
async fn test_dispatcher_reuse_under_concurrency() {
    let addr = start_server().await;
    let mut handles = Vec::new();
    for i in 0..8 {
        handles.push(tokio::spawn(async move {
            let body: Value = post(addr, "/demo_echo", json!({"text": i.to_string()}))
                .await
                .json()
                .await
                .unwrap();
            assert_eq!(body["answer"], format!("echo: {i}"));
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
}
