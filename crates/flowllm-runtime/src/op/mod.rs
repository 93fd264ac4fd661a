//! The op model: specs, per-invocation I/O, and the `Op` trait.
//!
//! An op is a named unit of computation. Its [`OpSpec`] carries everything
//! the runtime needs to drive it (mode, retry budget, failure policy, cache
//! policy, resource names, free-form params); the behavior lives in
//! `execute` (blocking) or `async_execute` (cooperative). Op instances are
//! built fresh for every invocation from the flow's parsed expression, so
//! no instance is ever shared between concurrent requests; under a parallel
//! combinator each child is additionally `boxed_clone`d before spawning.

pub mod combinators;
pub mod gallery;
pub mod runtime;

use std::collections::BTreeMap;

use async_trait::async_trait;
use flowllm_core::{FlowError, FlowResult, ToolCall};
use serde_json::Value;

use crate::cache::CachePolicy;
use crate::context::Context;

pub type BoxedOp = Box<dyn Op>;

/// Everything the runtime knows about one op instance.
#[derive(Debug, Clone)]
pub struct OpSpec {
    /// Instance name as used in flow expressions.
    pub name: String,
    /// Cooperative (`true`) or blocking (`false`).
    pub async_mode: bool,
    /// Total attempts, including the first. Always at least 1.
    pub max_retries: u32,
    /// On exhaustion: surface the error (`true`) or fall back to
    /// `default_execute` (`false`).
    pub raise_on_failure: bool,
    /// Result caching, when enabled.
    pub cache: Option<CachePolicy>,
    /// Mirror the op's output into `response.answer` after execution.
    pub save_answer: bool,
    /// Disambiguates multiple instances of the same tool; a non-zero index
    /// suffixes context keys with `.{index}`.
    pub tool_index: u32,
    /// Renames schema input keys to context keys.
    pub input_schema_mapping: BTreeMap<String, String>,
    /// Renames schema output keys to context keys.
    pub output_schema_mapping: BTreeMap<String, String>,
    /// Registry names for lazily bound resources; empty means `default`.
    pub llm: String,
    pub embedding_model: String,
    pub vector_store: String,
    /// Prompt locale override; empty inherits the service language.
    pub language: String,
    /// Free-form constructor parameters.
    pub params: BTreeMap<String, Value>,
}

impl OpSpec {
    /// A cooperative op spec with defaults.
    pub fn new(name: impl Into<String>) -> Self {
        OpSpec {
            name: name.into(),
            async_mode: true,
            max_retries: 1,
            raise_on_failure: true,
            cache: None,
            save_answer: false,
            tool_index: 0,
            input_schema_mapping: BTreeMap::new(),
            output_schema_mapping: BTreeMap::new(),
            llm: String::new(),
            embedding_model: String::new(),
            vector_store: String::new(),
            language: String::new(),
            params: BTreeMap::new(),
        }
    }

    /// A blocking op spec with defaults.
    pub fn blocking(name: impl Into<String>) -> Self {
        let mut spec = Self::new(name);
        spec.async_mode = false;
        spec
    }

    /// Name without the `_op` suffix.
    pub fn short_name(&self) -> &str {
        self.name.strip_suffix("_op").unwrap_or(&self.name)
    }

    /// Interpret one constructor argument. Well-known keys land in spec
    /// fields; everything else goes to `params`.
    pub fn apply_arg(&mut self, key: &str, value: Value) -> FlowResult<()> {
        fn expect_bool(key: &str, value: &Value) -> FlowResult<bool> {
            value
                .as_bool()
                .ok_or_else(|| FlowError::invalid(format!("`{key}` expects a bool")))
        }
        fn expect_u64(key: &str, value: &Value) -> FlowResult<u64> {
            value
                .as_u64()
                .ok_or_else(|| FlowError::invalid(format!("`{key}` expects a non-negative integer")))
        }
        fn expect_str(key: &str, value: &Value) -> FlowResult<String> {
            value
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| FlowError::invalid(format!("`{key}` expects a string")))
        }

        match key {
            "async_mode" => self.async_mode = expect_bool(key, &value)?,
            "max_retries" => self.max_retries = (expect_u64(key, &value)? as u32).max(1),
            "raise_on_failure" => self.raise_on_failure = expect_bool(key, &value)?,
            "save_answer" => self.save_answer = expect_bool(key, &value)?,
            "tool_index" => self.tool_index = expect_u64(key, &value)? as u32,
            "llm" => self.llm = expect_str(key, &value)?,
            "embedding_model" => self.embedding_model = expect_str(key, &value)?,
            "vector_store" => self.vector_store = expect_str(key, &value)?,
            "language" => self.language = expect_str(key, &value)?,
            "enable_cache" => {
                let enabled = expect_bool(key, &value)?;
                self.cache.get_or_insert_with(CachePolicy::default).enabled = enabled;
            }
            "cache_expire_seconds" => {
                let seconds = expect_u64(key, &value)?;
                self.cache.get_or_insert_with(CachePolicy::default).expire =
                    std::time::Duration::from_secs(seconds);
            }
            _ => {
                self.params.insert(key.to_string(), value);
            }
        }
        Ok(())
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    pub fn param_u64(&self, key: &str) -> Option<u64> {
        self.params.get(key).and_then(Value::as_u64)
    }

    pub fn param_bool(&self, key: &str) -> Option<bool> {
        self.params.get(key).and_then(Value::as_bool)
    }
}

/// Per-invocation inputs and outputs, managed by the runtime.
#[derive(Debug, Default, Clone)]
pub struct OpIo {
    /// Values extracted from the context per the tool input schema.
    pub inputs: BTreeMap<String, Value>,
    /// Values the op produced; written back per the output schema.
    pub outputs: BTreeMap<String, Value>,
    /// Set when the outputs came from `default_execute` after exhaustion.
    pub output_is_default: bool,
    /// Set when the outputs were loaded from cache; execute did not run.
    pub from_cache: bool,
    default_output_key: Option<String>,
}

impl OpIo {
    pub fn new(default_output_key: Option<String>) -> Self {
        OpIo {
            default_output_key,
            ..Default::default()
        }
    }

    pub fn input(&self, name: &str) -> Option<&Value> {
        self.inputs.get(name)
    }

    pub fn input_str(&self, name: &str) -> Option<&str> {
        self.inputs.get(name).and_then(Value::as_str)
    }

    /// Required string input; the runtime validated presence for required
    /// schema fields, so a miss here is an op bug or a type mismatch.
    pub fn require_str(&self, name: &str) -> FlowResult<&str> {
        self.input_str(name)
            .ok_or_else(|| FlowError::invalid(format!("`{name}` expects a string value")))
    }

    /// Write the op's single result under its declared output key.
    pub fn set_result(&mut self, value: Value) {
        let key = self
            .default_output_key
            .clone()
            .unwrap_or_else(|| "result".to_string());
        self.outputs.insert(key, value);
    }

    pub fn set_output(&mut self, key: impl Into<String>, value: Value) {
        self.outputs.insert(key.into(), value);
    }

    /// Collapse the outputs into a single value: one entry yields the entry
    /// itself, several yield an object, none yields null.
    pub fn output_value(&self) -> Value {
        match self.outputs.len() {
            0 => Value::Null,
            1 => self.outputs.values().next().cloned().unwrap_or(Value::Null),
            _ => Value::Object(
                self.outputs
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ),
        }
    }
}

/// Outputs map as a JSON object.
pub(crate) fn outputs_to_value(outputs: &BTreeMap<String, Value>) -> Value {
    Value::Object(outputs.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
}

/// JSON object back into an outputs map. Non-objects land under `result`.
pub(crate) fn value_to_outputs(value: Value) -> BTreeMap<String, Value> {
    match value {
        Value::Object(object) => object.into_iter().collect(),
        other => BTreeMap::from([("result".to_string(), other)]),
    }
}

/// A unit of computation driven by the op runtime.
#[async_trait]
pub trait Op: Send {
    fn spec(&self) -> &OpSpec;

    fn spec_mut(&mut self) -> &mut OpSpec;

    /// Schema for tool ops. The runtime fills the default output schema in.
    fn tool_call(&self) -> Option<ToolCall> {
        None
    }

    /// Blocking behavior; runs on the worker pool. Override for
    /// `async_mode=false` ops.
    fn execute(&mut self, _ctx: &Context, _io: &mut OpIo) -> FlowResult<()> {
        Err(FlowError::execution(
            self.spec().name.clone(),
            "op does not implement blocking execution",
        ))
    }

    /// Cooperative behavior. Override for `async_mode=true` ops.
    async fn async_execute(&mut self, _ctx: &Context, _io: &mut OpIo) -> FlowResult<()> {
        Err(FlowError::execution(
            self.spec().name.clone(),
            "op does not implement cooperative execution",
        ))
    }

    /// Fallback output when all attempts failed and `raise_on_failure` is
    /// off. Writes placeholders for every declared output key.
    fn default_execute(&mut self, io: &mut OpIo) {
        let message = Value::String(format!("{} execution failed!", self.spec().name));
        let keys: Vec<String> = match self.tool_call() {
            Some(mut call) => {
                call.ensure_output_schema(self.spec().short_name());
                call.output_schema.keys().cloned().collect()
            }
            None => vec![format!("{}_result", self.spec().short_name())],
        };
        io.outputs.clear();
        for key in keys {
            io.outputs.insert(key, message.clone());
        }
    }

    /// Store a named child op (the `<<` combinator / `op.ops.NAME = ...`).
    /// Only container-style ops accept children.
    fn attach_child(&mut self, _name: String, _child: BoxedOp) -> FlowResult<()> {
        Err(FlowError::Parse {
            message: format!("op `{}` does not accept children", self.spec().name),
        })
    }

    /// Deep copy, used before concurrent re-execution.
    fn boxed_clone(&self) -> BoxedOp;
}

#[cfg(test)]
pub mod test_support {
    use super::*;

    /// Minimal cooperative op that produces nothing.
    pub struct NoopOp {
        spec: OpSpec,
    }

    impl NoopOp {
        pub fn new(spec: OpSpec) -> Self {
            NoopOp { spec }
        }
    }

    #[async_trait]
    impl Op for NoopOp {
        fn spec(&self) -> &OpSpec {
            &self.spec
        }

        fn spec_mut(&mut self) -> &mut OpSpec {
            &mut self.spec
        }

        async fn async_execute(&mut self, _ctx: &Context, _io: &mut OpIo) -> FlowResult<()> {
            Ok(())
        }

        fn boxed_clone(&self) -> BoxedOp {
            Box::new(NoopOp {
                spec: self.spec.clone(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_name() {
        assert_eq!(OpSpec::new("search_op").short_name(), "search");
        assert_eq!(OpSpec::new("search").short_name(), "search");
    }

    #[test]
    fn test_apply_arg_routing() {
        let mut spec = OpSpec::new("demo_op");
        spec.apply_arg("max_retries", serde_json::json!(3)).unwrap();
        spec.apply_arg("save_answer", serde_json::json!(true)).unwrap();
        spec.apply_arg("enable_cache", serde_json::json!(true)).unwrap();
        spec.apply_arg("top_k", serde_json::json!(5)).unwrap();

        assert_eq!(spec.max_retries, 3);
        assert!(spec.save_answer);
        assert!(spec.cache.as_ref().unwrap().enabled);
        assert_eq!(spec.param_u64("top_k"), Some(5));
    }

    #[test]
    fn test_apply_arg_type_errors() {
        let mut spec = OpSpec::new("demo_op");
        assert!(spec.apply_arg("max_retries", serde_json::json!("three")).is_err());
        assert!(spec.apply_arg("save_answer", serde_json::json!(1)).is_err());
    }

    #[test]
    fn test_output_value_shapes() {
        let mut io = OpIo::new(Some("demo_result".to_string()));
        assert_eq!(io.output_value(), Value::Null);

        io.set_result(serde_json::json!("one"));
        assert_eq!(io.output_value(), serde_json::json!("one"));

        io.set_output("extra", serde_json::json!(2));
        assert_eq!(
            io.output_value(),
            serde_json::json!({"demo_result": "one", "extra": 2})
        );
    }
}
