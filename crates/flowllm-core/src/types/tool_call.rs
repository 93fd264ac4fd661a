//! Tool schemas.
//!
//! A tool op carries a [`ToolCall`]: a description plus typed input/output
//! parameter maps. The runtime uses the input schema to pull arguments out
//! of the context before execute and the output schema to write results
//! back after; the services export the same schema to HTTP docs and MCP
//! `tools/list`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Parameter type, mirroring JSON schema primitive names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    #[default]
    #[serde(alias = "str")]
    String,
    #[serde(alias = "int")]
    Integer,
    #[serde(alias = "float")]
    Number,
    #[serde(alias = "boolean")]
    Bool,
    Array,
    Object,
}

impl ParamType {
    /// JSON-schema type name.
    pub fn json_type(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Number => "number",
            ParamType::Bool => "boolean",
            ParamType::Array => "array",
            ParamType::Object => "object",
        }
    }

    /// Whether `value` inhabits this type. Integers are accepted where a
    /// number is expected.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Integer => value.is_i64() || value.is_u64(),
            ParamType::Number => value.is_number(),
            ParamType::Bool => value.is_boolean(),
            ParamType::Array => value.is_array(),
            ParamType::Object => value.is_object(),
        }
    }
}

/// Attributes of one schema parameter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParamAttrs {
    #[serde(rename = "type", default)]
    pub param_type: ParamType,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl ParamAttrs {
    pub fn new(param_type: ParamType, description: impl Into<String>) -> Self {
        ParamAttrs {
            param_type,
            description: description.into(),
            required: false,
            default: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }
}

/// Input/output schema carried by a tool op (and by flows, for validation).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_schema: BTreeMap<String, ParamAttrs>,
    #[serde(default)]
    pub output_schema: BTreeMap<String, ParamAttrs>,
}

impl ToolCall {
    pub fn new(description: impl Into<String>) -> Self {
        ToolCall {
            description: description.into(),
            ..Default::default()
        }
    }

    pub fn with_input(mut self, name: impl Into<String>, attrs: ParamAttrs) -> Self {
        self.input_schema.insert(name.into(), attrs);
        self
    }

    pub fn with_output(mut self, name: impl Into<String>, attrs: ParamAttrs) -> Self {
        self.output_schema.insert(name.into(), attrs);
        self
    }

    /// Fill in the default single-string output schema when the op declared
    /// none: `{short_name}_result`.
    pub fn ensure_output_schema(&mut self, short_name: &str) {
        if self.output_schema.is_empty() {
            self.output_schema.insert(
                format!("{short_name}_result"),
                ParamAttrs::new(
                    ParamType::String,
                    format!("The execution result of the {short_name}"),
                ),
            );
        }
    }

    /// Declared output keys, in schema order.
    pub fn output_keys(&self) -> Vec<&str> {
        self.output_schema.keys().map(String::as_str).collect()
    }

    /// Export the input schema as a JSON-schema object (MCP `inputSchema`,
    /// OpenAPI request body).
    pub fn input_json_schema(&self) -> Value {
        json_schema_for(&self.input_schema)
    }
}

/// JSON-schema object for an arbitrary parameter map.
pub fn json_schema_for(params: &BTreeMap<String, ParamAttrs>) -> Value {
    let mut properties = serde_json::Map::new();
    let mut required = Vec::new();
    for (name, attrs) in params {
        let mut prop = serde_json::Map::new();
        prop.insert("type".into(), json!(attrs.param_type.json_type()));
        if !attrs.description.is_empty() {
            prop.insert("description".into(), json!(attrs.description));
        }
        if let Some(default) = &attrs.default {
            prop.insert("default".into(), default.clone());
        }
        properties.insert(name.clone(), Value::Object(prop));
        if attrs.required {
            required.push(json!(name));
        }
    }
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}
