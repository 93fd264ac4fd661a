//! Request → flow invocation.
//!
//! The dispatcher owns the flow table and turns one incoming request into
//! one op-tree execution: look the flow up, validate inputs against the
//! flow's schema, build a fresh context (cancellation token, deadline,
//! outbox for stream flows), run the tree, and hand back either the
//! response record or the chunk receiver.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use flowllm_core::{FlowError, FlowResult, FlowResponse, StreamChunk};
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::context::Context;
use crate::flow::Flow;
use crate::op::{BoxedOp, runtime};
use crate::scheduler::CancelToken;
use crate::service::ServiceHandle;
use crate::stream::StreamOutbox;

/// Per-invocation options set by the transport.
#[derive(Default, Clone)]
pub struct DispatchOptions {
    /// Strict schema validation: unknown fields are rejected and a schema
    /// is mandatory (MCP mode). Loose mode (HTTP) passes unknown fields
    /// through into the context.
    pub strict: bool,
    /// Request deadline; falls back to the configured service timeout.
    pub deadline: Option<Duration>,
    /// Run a stream flow without an outbox, returning only the final
    /// response (MCP mode).
    pub collapse_stream: bool,
    /// Externally owned cancellation token (e.g. tied to a transport
    /// session), so the transport can cancel in-flight work.
    pub cancel: Option<CancelToken>,
}

/// What an invocation produced.
#[derive(Debug)]
pub enum FlowOutcome {
    Response(FlowResponse),
    /// Ordered chunk stream; ends with exactly one `Done`, preceded by an
    /// `Error` chunk when the flow failed.
    Stream(mpsc::Receiver<StreamChunk>),
}

/// The service-facing flow table and executor.
pub struct Dispatcher {
    service: Arc<ServiceHandle>,
    flows: BTreeMap<String, Arc<Flow>>,
}

impl Dispatcher {
    /// Parse every configured flow. Fails startup on the first bad flow.
    pub fn new(service: Arc<ServiceHandle>) -> FlowResult<Self> {
        let mut flows = BTreeMap::new();
        for (name, config) in &service.config().flow {
            let flow = Flow::from_config(name.clone(), config, &service)?;
            tracing::info!(flow = %name, stream = flow.stream, "registered flow");
            flows.insert(name.clone(), Arc::new(flow));
        }
        Ok(Dispatcher { service, flows })
    }

    pub fn service(&self) -> &Arc<ServiceHandle> {
        &self.service
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Flow>> {
        self.flows.get(name)
    }

    pub fn flows(&self) -> impl Iterator<Item = &Arc<Flow>> {
        self.flows.values()
    }

    /// Execute one flow invocation.
    pub async fn execute(
        &self,
        name: &str,
        kwargs: Map<String, Value>,
        options: DispatchOptions,
    ) -> FlowResult<FlowOutcome> {
        let flow = self
            .flows
            .get(name)
            .ok_or_else(|| FlowError::UnknownFlow { name: name.into() })?;

        let mut kwargs = kwargs;
        validate_inputs(flow, &mut kwargs, options.strict)?;

        let deadline = options
            .deadline
            .or_else(|| self.service.config().request_timeout());
        let streaming = flow.stream && !options.collapse_stream;

        let mut builder = Context::builder(Arc::clone(&self.service)).request(Value::Object(kwargs));
        if let Some(token) = options.cancel {
            builder = builder.cancel_token(token);
        }
        if let Some(deadline) = deadline {
            builder = builder.deadline_in(deadline);
        }

        let receiver = if streaming {
            let (outbox, receiver) = StreamOutbox::channel(self.service.config().stream_capacity);
            builder = builder.outbox(outbox);
            Some(receiver)
        } else {
            None
        };
        let ctx = builder.build();
        let root = flow.build_op(&self.service)?;

        match receiver {
            Some(receiver) => {
                // Drive the flow in the background; the caller consumes the
                // stream. The terminal chunk is appended here, exactly once,
                // after completion or failure.
                let service = Arc::clone(&self.service);
                let flow_name = flow.name.clone();
                let driver_ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(error) = run_root(&service, root, &driver_ctx, deadline).await {
                        tracing::warn!(flow = %flow_name, error = %error, "stream flow failed");
                        let _ = driver_ctx.emit(StreamChunk::error(error.to_string())).await;
                    }
                    let _ = driver_ctx.emit(StreamChunk::done()).await;
                });
                Ok(FlowOutcome::Stream(receiver))
            }
            None => {
                run_root(&self.service, root, &ctx, deadline).await?;
                Ok(FlowOutcome::Response(ctx.response()))
            }
        }
    }
}

/// Run the root op on the tier its mode demands, bounded by the deadline.
async fn run_root(
    service: &Arc<ServiceHandle>,
    root: BoxedOp,
    ctx: &Context,
    deadline: Option<Duration>,
) -> FlowResult<()> {
    let service = Arc::clone(service);
    let run_ctx = ctx.clone();
    let execution = async move {
        let mut root = root;
        if root.spec().async_mode {
            runtime::async_call(root.as_mut(), &run_ctx, &BTreeMap::new())
                .await
                .map(|_| ())
        } else {
            service
                .submit_blocking(move || {
                    runtime::call(root.as_mut(), &run_ctx, &BTreeMap::new()).map(|_| ())
                })
                .await?
        }
    };

    match deadline {
        Some(deadline) => match tokio::time::timeout(deadline, execution).await {
            Ok(result) => result,
            Err(_) => {
                // Force the cooperative tier to stop and the blocking tier
                // to observe cancellation at its next poll.
                ctx.cancel();
                Err(FlowError::Timeout { waited: deadline })
            }
        },
        None => execution.await,
    }
}

/// Strict mode rejects unknown fields and requires a schema; loose mode
/// validates declared fields and passes the rest through. Defaults are
/// injected for absent optional fields.
fn validate_inputs(
    flow: &Flow,
    kwargs: &mut Map<String, Value>,
    strict: bool,
) -> FlowResult<()> {
    if strict && flow.input_schema.is_empty() {
        return Err(FlowError::invalid(format!(
            "flow `{}` declares no input schema",
            flow.name
        )));
    }
    if strict {
        for key in kwargs.keys() {
            if !flow.input_schema.contains_key(key) {
                return Err(FlowError::invalid(format!(
                    "unknown field `{key}` for flow `{}`",
                    flow.name
                )));
            }
        }
    }
    for (name, attrs) in &flow.input_schema {
        match kwargs.get(name) {
            Some(value) => {
                if !attrs.param_type.matches(value) {
                    return Err(FlowError::invalid(format!(
                        "field `{name}` expects {}",
                        attrs.param_type.json_type()
                    )));
                }
            }
            None => {
                if let Some(default) = &attrs.default {
                    kwargs.insert(name.clone(), default.clone());
                } else if attrs.required {
                    return Err(FlowError::invalid(format!(
                        "missing required field `{name}`",
                    )));
                }
            }
        }
    }
    Ok(())
}
