//! A named, composed op tree exposed by the service.

use std::collections::BTreeMap;

use flowllm_core::{FlowConfig, FlowResult, ParamAttrs, ToolCall};
use serde_json::Value;

use crate::op::BoxedOp;
use crate::parser::OpExpr;
use crate::service::ServiceHandle;

/// A flow: parsed once at startup, immutable, invoked many times
/// concurrently. Each invocation builds a fresh op tree from the expression.
pub struct Flow {
    pub name: String,
    pub description: String,
    /// Whether the HTTP service exposes this flow as SSE.
    pub stream: bool,
    pub input_schema: BTreeMap<String, ParamAttrs>,
    expr: OpExpr,
}

impl Flow {
    /// Parse a flow from its configuration. Names resolve against the
    /// registry snapshot plus the configured op instances.
    pub fn from_config(
        name: impl Into<String>,
        config: &FlowConfig,
        service: &ServiceHandle,
    ) -> FlowResult<Flow> {
        let expr = OpExpr::parse(&config.flow_content, |op_name| {
            service.registry().has_op(op_name) || service.config().op.contains_key(op_name)
        })?;
        Ok(Flow {
            name: name.into(),
            description: config.description.clone(),
            stream: config.stream,
            input_schema: config.input_schema.clone(),
            expr,
        })
    }

    pub fn expr(&self) -> &OpExpr {
        &self.expr
    }

    /// Build a fresh op tree for one invocation.
    pub fn build_op(&self, service: &ServiceHandle) -> FlowResult<BoxedOp> {
        self.expr.build(service)
    }

    /// The flow's input schema as a JSON-schema object (MCP `inputSchema`).
    pub fn input_json_schema(&self) -> Value {
        flowllm_core::types::tool_call::json_schema_for(&self.input_schema)
    }

    /// Whether the flow can be exposed as an MCP tool.
    pub fn has_input_schema(&self) -> bool {
        !self.input_schema.is_empty()
    }

    /// Tool-shaped view of this flow (used by MCP listings).
    pub fn as_tool(&self) -> ToolCall {
        ToolCall {
            name: self.name.clone(),
            description: self.description.clone(),
            input_schema: self.input_schema.clone(),
            output_schema: BTreeMap::new(),
        }
    }
}
