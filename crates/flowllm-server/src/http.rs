//! HTTP service: one POST endpoint per flow, JSON or SSE.
//!
//! Non-stream flows answer with the flat response body (`answer`,
//! `messages`, plus any extensible fields). Stream flows answer with
//! `text/event-stream`: each event is `data: {"type": ..., "content": ...}`
//! and the terminal event is `data: [DONE]`, sent exactly once (after an
//! `error` event when the flow failed).

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use flowllm_core::{ChunkKind, FlowError, HttpConfig};
use flowllm_runtime::{DispatchOptions, Dispatcher, FlowOutcome};
use futures::Stream;
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

#[derive(Clone)]
struct AppState {
    dispatcher: Arc<Dispatcher>,
}

/// Build the router for a dispatcher.
pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    let state = AppState { dispatcher };
    Router::new()
        .route("/health", get(health))
        .route("/openapi.json", get(openapi))
        .route("/docs", get(openapi))
        .route("/{flow_name}", post(run_flow))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Bind and serve until shutdown.
pub async fn serve(dispatcher: Arc<Dispatcher>, config: &HttpConfig) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let app = router(dispatcher);
    info!(%addr, "starting flowllm http service");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Minimal OpenAPI document: one POST operation per flow.
async fn openapi(State(state): State<AppState>) -> Json<Value> {
    let mut paths = serde_json::Map::new();
    for flow in state.dispatcher.flows() {
        let request_schema = if flow.has_input_schema() {
            flow.input_json_schema()
        } else {
            json!({ "type": "object", "additionalProperties": true })
        };
        paths.insert(
            format!("/{}", flow.name),
            json!({
                "post": {
                    "operationId": flow.name,
                    "description": flow.description,
                    "requestBody": {
                        "content": { "application/json": { "schema": request_schema } }
                    },
                    "responses": {
                        "200": {
                            "description": if flow.stream {
                                "server-sent event stream"
                            } else {
                                "flow response"
                            }
                        }
                    }
                }
            }),
        );
    }
    Json(json!({
        "openapi": "3.1.0",
        "info": { "title": "FlowLLM", "version": env!("CARGO_PKG_VERSION") },
        "paths": paths,
    }))
}

async fn run_flow(
    State(state): State<AppState>,
    Path(flow_name): Path<String>,
    body: Option<Json<Value>>,
) -> Result<Response, ApiError> {
    let kwargs = match body {
        None | Some(Json(Value::Null)) => serde_json::Map::new(),
        Some(Json(Value::Object(object))) => object,
        Some(_) => {
            return Err(ApiError::from(FlowError::invalid(
                "request body must be a JSON object",
            )));
        }
    };

    let streaming = state
        .dispatcher
        .get(&flow_name)
        .ok_or_else(|| {
            ApiError::from(FlowError::UnknownFlow {
                name: flow_name.clone(),
            })
        })?
        .stream;

    let outcome = state
        .dispatcher
        .execute(&flow_name, kwargs, DispatchOptions::default())
        .await
        .map_err(ApiError::from)?;

    match outcome {
        FlowOutcome::Response(response) => Ok(Json(response.to_body()).into_response()),
        FlowOutcome::Stream(rx) => {
            debug_assert!(streaming);
            Ok(Sse::new(sse_events(rx))
                .keep_alive(KeepAlive::default())
                .into_response())
        }
    }
}

/// Convert the chunk receiver into SSE events, mapping the terminal chunk
/// to the literal `[DONE]` payload.
fn sse_events(
    mut rx: tokio::sync::mpsc::Receiver<flowllm_core::StreamChunk>,
) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    async_stream::stream! {
        while let Some(chunk) = rx.recv().await {
            if chunk.kind == ChunkKind::Done {
                yield Ok(Event::default().data("[DONE]"));
                break;
            }
            let payload = json!({
                "type": chunk.kind.as_str(),
                "content": chunk.content,
            });
            yield Ok(Event::default().data(payload.to_string()));
        }
    }
}

/// Transport error: the taxonomy's status mapping plus a stable code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl From<FlowError> for ApiError {
    fn from(error: FlowError) -> Self {
        let status = match &error {
            FlowError::InputValidation { .. } => StatusCode::BAD_REQUEST,
            FlowError::UnknownFlow { .. }
            | FlowError::UnknownOp { .. }
            | FlowError::UnknownResource { .. } => StatusCode::NOT_FOUND,
            FlowError::Timeout { .. } => StatusCode::REQUEST_TIMEOUT,
            // 499: client closed request (nginx convention).
            FlowError::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError {
            status,
            code: error.code(),
            message: error.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "code": self.code,
        }));
        (self.status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            ApiError::from(FlowError::invalid("x")).status,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(FlowError::UnknownFlow { name: "f".into() }).status,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(FlowError::Timeout {
                waited: std::time::Duration::from_secs(1)
            })
            .status,
            StatusCode::REQUEST_TIMEOUT
        );
        assert_eq!(ApiError::from(FlowError::Cancelled).status.as_u16(), 499);
        assert_eq!(
            ApiError::from(FlowError::transient("x")).status,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
