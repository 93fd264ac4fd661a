//! Per-invocation shared state.
//!
//! One `Context` is created per request and shared (by cheap clone) with
//! every op in the flow's tree, including parallel children. The data map
//! is not locked per key: parallel writers must use disjoint keys, which
//! the combinator contract guarantees for well-formed flows.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use flowllm_core::{FlowError, FlowResult, FlowResponse, Message, StreamChunk};
use serde_json::Value;

use crate::scheduler::CancelToken;
use crate::service::ServiceHandle;
use crate::stream::StreamOutbox;

/// Shared handle to one invocation's state.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    id: String,
    data: DashMap<String, Value>,
    request: Value,
    response: Mutex<FlowResponse>,
    outbox: Option<StreamOutbox>,
    cancel: CancelToken,
    deadline: Option<Instant>,
    service: Arc<ServiceHandle>,
}

/// Builder for [`Context`]; used by the dispatcher and by tests.
pub struct ContextBuilder {
    service: Arc<ServiceHandle>,
    request: Value,
    outbox: Option<StreamOutbox>,
    cancel: Option<CancelToken>,
    deadline: Option<Instant>,
}

impl ContextBuilder {
    pub fn new(service: Arc<ServiceHandle>) -> Self {
        ContextBuilder {
            service,
            request: Value::Null,
            outbox: None,
            cancel: None,
            deadline: None,
        }
    }

    /// Attach the raw request snapshot and seed the data map from its
    /// top-level object fields.
    pub fn request(mut self, request: Value) -> Self {
        self.request = request;
        self
    }

    pub fn outbox(mut self, outbox: StreamOutbox) -> Self {
        self.outbox = Some(outbox);
        self
    }

    /// Use an externally owned token (e.g. tied to a transport session).
    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn deadline_in(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn build(self) -> Context {
        let data = DashMap::new();
        if let Some(object) = self.request.as_object() {
            for (key, value) in object {
                data.insert(key.clone(), value.clone());
            }
        }
        Context {
            inner: Arc::new(ContextInner {
                id: uuid::Uuid::new_v4().simple().to_string(),
                data,
                request: self.request,
                response: Mutex::new(FlowResponse::default()),
                outbox: self.outbox,
                cancel: self.cancel.unwrap_or_default(),
                deadline: self.deadline,
                service: self.service,
            }),
        }
    }
}

impl Context {
    pub fn builder(service: Arc<ServiceHandle>) -> ContextBuilder {
        ContextBuilder::new(service)
    }

    /// Unique invocation id (uuid hex).
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn service(&self) -> &ServiceHandle {
        &self.inner.service
    }

    pub fn service_arc(&self) -> Arc<ServiceHandle> {
        Arc::clone(&self.inner.service)
    }

    /// The raw request snapshot.
    pub fn request(&self) -> &Value {
        &self.inner.request
    }

    // ---- data map ----

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.data.get(key).map(|entry| entry.value().clone())
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        self.get(key)
            .and_then(|v| v.as_str().map(|s| s.to_string()))
    }

    pub fn insert(&self, key: impl Into<String>, value: Value) {
        self.inner.data.insert(key.into(), value);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.data.contains_key(key)
    }

    // ---- response record ----

    /// Clone the current response record.
    pub fn response(&self) -> FlowResponse {
        self.inner
            .response
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn set_answer(&self, answer: impl Into<String>) {
        if let Ok(mut response) = self.inner.response.lock() {
            response.answer = answer.into();
        }
    }

    pub fn push_message(&self, message: Message) {
        if let Ok(mut response) = self.inner.response.lock() {
            response.messages.push(message);
        }
    }

    /// Write one extensible response field.
    pub fn set_response_field(&self, key: impl Into<String>, value: Value) {
        if let Ok(mut response) = self.inner.response.lock() {
            response.metadata.insert(key.into(), value);
        }
    }

    // ---- streaming ----

    pub fn is_streaming(&self) -> bool {
        self.inner.outbox.is_some()
    }

    /// Emit a chunk into the outbox, applying backpressure.
    ///
    /// A no-op for non-streaming invocations. A closed outbox (client gone)
    /// fires the cancellation token and yields `Cancelled`.
    pub async fn emit(&self, chunk: StreamChunk) -> FlowResult<()> {
        let Some(outbox) = &self.inner.outbox else {
            return Ok(());
        };
        match outbox.emit(chunk).await {
            Ok(()) => Ok(()),
            Err(error) => {
                self.inner.cancel.cancel();
                Err(error)
            }
        }
    }

    /// Blocking-thread variant of [`Context::emit`].
    pub fn emit_blocking(&self, chunk: StreamChunk) -> FlowResult<()> {
        let Some(outbox) = &self.inner.outbox else {
            return Ok(());
        };
        match outbox.emit_blocking(chunk) {
            Ok(()) => Ok(()),
            Err(error) => {
                self.inner.cancel.cancel();
                Err(error)
            }
        }
    }

    // ---- cancellation & deadline ----

    pub fn cancel_token(&self) -> &CancelToken {
        &self.inner.cancel
    }

    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Remaining time until the deadline, if one is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.inner
            .deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Fail with `Cancelled`/`Timeout` when the token fired or the deadline
    /// passed. Ops call this at their I/O boundaries; the runtime calls it
    /// around each execute attempt.
    pub fn check_active(&self) -> FlowResult<()> {
        if let Some(deadline) = self.inner.deadline
            && Instant::now() >= deadline
        {
            self.inner.cancel.cancel();
            return Err(FlowError::Timeout {
                waited: Duration::ZERO,
            });
        }
        self.inner.cancel.check()
    }
}
