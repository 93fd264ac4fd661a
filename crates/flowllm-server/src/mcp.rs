//! MCP service over SSE.
//!
//! `GET /sse` opens a session: the first event is `endpoint` carrying the
//! session's message URL, then JSON-RPC responses flow back as `message`
//! events. `POST /messages?session_id=...` accepts JSON-RPC requests
//! (`initialize`, `ping`, `tools/list`, `tools/call`) and is acknowledged
//! with 202; results arrive on the SSE channel.
//!
//! One tool per flow, named after the flow; flows without an input schema
//! are not exposed. Tool responses are not streamed: stream flows collapse
//! into their final text, and think chunks are suppressed.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use dashmap::DashMap;
use flowllm_core::{FlowError, McpConfig};
use flowllm_runtime::{CancelToken, DispatchOptions, Dispatcher, FlowOutcome};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

const PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Clone)]
struct McpState {
    dispatcher: Arc<Dispatcher>,
    sessions: Arc<DashMap<String, Session>>,
}

struct Session {
    tx: mpsc::Sender<Value>,
    /// Cancellation tokens of in-flight tool calls; fired on disconnect.
    inflight: Arc<std::sync::Mutex<Vec<CancelToken>>>,
}

/// Build the MCP router for a dispatcher.
pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    let state = McpState {
        dispatcher,
        sessions: Arc::new(DashMap::new()),
    };
    Router::new()
        .route("/sse", get(open_session))
        .route("/messages", post(handle_message))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Bind and serve until shutdown. Only the SSE transport is supported.
pub async fn serve(dispatcher: Arc<Dispatcher>, config: &McpConfig) -> anyhow::Result<()> {
    if config.transport != "sse" {
        anyhow::bail!("unsupported mcp transport: {}", config.transport);
    }
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let app = router(dispatcher);
    info!(%addr, "starting flowllm mcp service");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Removes the session and cancels its in-flight calls when the SSE stream
/// is dropped (client disconnect).
struct SessionGuard {
    id: String,
    sessions: Arc<DashMap<String, Session>>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some((_, session)) = self.sessions.remove(&self.id) {
            if let Ok(tokens) = session.inflight.lock() {
                for token in tokens.iter() {
                    token.cancel();
                }
            }
            info!(session = %self.id, "mcp session closed");
        }
    }
}

async fn open_session(State(state): State<McpState>) -> impl IntoResponse {
    let id = uuid::Uuid::new_v4().simple().to_string();
    let (tx, mut rx) = mpsc::channel::<Value>(64);
    state.sessions.insert(
        id.clone(),
        Session {
            tx,
            inflight: Arc::new(std::sync::Mutex::new(Vec::new())),
        },
    );
    info!(session = %id, "mcp session opened");

    let guard = SessionGuard {
        id: id.clone(),
        sessions: Arc::clone(&state.sessions),
    };
    let stream = async_stream::stream! {
        let _guard = guard;
        yield Ok::<_, std::convert::Infallible>(
            Event::default()
                .event("endpoint")
                .data(format!("/messages?session_id={id}")),
        );
        while let Some(message) = rx.recv().await {
            yield Ok(Event::default().event("message").data(message.to_string()));
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn handle_message(
    State(state): State<McpState>,
    Query(query): Query<HashMap<String, String>>,
    Json(request): Json<Value>,
) -> impl IntoResponse {
    let Some(session_id) = query.get("session_id").cloned() else {
        return (StatusCode::BAD_REQUEST, "missing session_id").into_response();
    };
    if !state.sessions.contains_key(&session_id) {
        return (StatusCode::NOT_FOUND, "unknown session").into_response();
    }

    let method = request
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let id = request.get("id").cloned().unwrap_or(Value::Null);

    // Notifications expect no response.
    if method.starts_with("notifications/") {
        return StatusCode::ACCEPTED.into_response();
    }

    let params = request.get("params").cloned().unwrap_or(Value::Null);
    tokio::spawn(dispatch_rpc(state, session_id, id, method, params));
    StatusCode::ACCEPTED.into_response()
}

/// Evaluate one request and push the response onto the session channel.
async fn dispatch_rpc(
    state: McpState,
    session_id: String,
    id: Value,
    method: String,
    params: Value,
) {
    let response = match method.as_str() {
        "initialize" => rpc_result(
            &id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "serverInfo": {
                    "name": "flowllm",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
        ),
        "ping" => rpc_result(&id, json!({})),
        "tools/list" => rpc_result(&id, list_tools(&state.dispatcher)),
        "tools/call" => match call_tool(&state, &session_id, params).await {
            Ok(result) => rpc_result(&id, result),
            Err(error) => rpc_result(
                &id,
                json!({
                    "content": [{ "type": "text", "text": error.to_string() }],
                    "isError": true,
                }),
            ),
        },
        other => json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": -32601, "message": format!("method not found: {other}") },
        }),
    };

    // Clone the sender out so no map guard is held across the await.
    let Some(tx) = state.sessions.get(&session_id).map(|s| s.tx.clone()) else {
        return;
    };
    if tx.send(response).await.is_err() {
        warn!(session = %session_id, "mcp session channel closed before response");
    }
}

fn rpc_result(id: &Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

/// The tool table: one tool per flow with a declared input schema.
fn list_tools(dispatcher: &Dispatcher) -> Value {
    let tools: Vec<Value> = dispatcher
        .flows()
        .filter(|flow| {
            if !flow.has_input_schema() {
                warn!(flow = %flow.name, "flow has no input schema; not exposed over mcp");
                return false;
            }
            true
        })
        .map(|flow| {
            json!({
                "name": flow.name,
                "description": flow.description,
                "inputSchema": flow.input_json_schema(),
            })
        })
        .collect();
    json!({ "tools": tools })
}

async fn call_tool(state: &McpState, session_id: &str, params: Value) -> Result<Value, FlowError> {
    let name = params
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| FlowError::invalid("tools/call requires a tool name"))?
        .to_string();
    let arguments = match params.get("arguments") {
        None | Some(Value::Null) => serde_json::Map::new(),
        Some(Value::Object(object)) => object.clone(),
        Some(_) => return Err(FlowError::invalid("arguments must be an object")),
    };

    // Tie the invocation to the session so a disconnect cancels it.
    let token = CancelToken::new();
    if let Some(session) = state.sessions.get(session_id)
        && let Ok(mut inflight) = session.inflight.lock()
    {
        inflight.push(token.clone());
    }

    let options = DispatchOptions {
        strict: true,
        collapse_stream: true,
        cancel: Some(token),
        ..Default::default()
    };
    let outcome = state.dispatcher.execute(&name, arguments, options).await?;
    let FlowOutcome::Response(response) = outcome else {
        return Err(FlowError::execution(name, "tool call produced a stream"));
    };

    let mut result = json!({
        "content": [{ "type": "text", "text": response.answer }],
        "isError": false,
    });
    if !response.metadata.is_empty() {
        result["structuredContent"] = serde_json::to_value(&response.metadata)?;
    }
    Ok(result)
}
