//! Flow response record.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::message::Message;

/// What a non-streaming flow invocation returns to the client.
///
/// `answer` and `messages` are always present; everything else an op writes
/// for the caller lands in `metadata` and is flattened into the response
/// body by the HTTP layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowResponse {
    #[serde(default)]
    pub answer: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl FlowResponse {
    /// Serialize as a flat JSON object: `answer`, `messages`, then each
    /// metadata entry at the top level (metadata never shadows the two
    /// fixed fields).
    pub fn to_body(&self) -> Value {
        let mut body = serde_json::Map::new();
        body.insert("answer".into(), Value::String(self.answer.clone()));
        body.insert(
            "messages".into(),
            serde_json::to_value(&self.messages).unwrap_or_else(|_| Value::Array(vec![])),
        );
        for (key, value) in &self.metadata {
            if key != "answer" && key != "messages" {
                body.insert(key.clone(), value.clone());
            }
        }
        Value::Object(body)
    }
}
