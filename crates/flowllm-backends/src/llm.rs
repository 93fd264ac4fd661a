//! LLM capability contract.
//!
//! Ops talk to models through [`Llm`] only; which provider sits behind a
//! given registry name is a deployment concern. Streaming generation hands
//! back a bounded channel of [`LlmChunk`]s so slow consumers apply
//! backpressure to the producer.

use std::collections::BTreeMap;
use std::collections::HashMap;

use async_trait::async_trait;
use flowllm_core::{FlowError, FlowResult, Message};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// What a streamed delta carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmChunkKind {
    /// Answer text.
    Answer,
    /// Reasoning text, not part of the answer.
    Think,
}

/// One streamed generation delta.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmChunk {
    pub kind: LlmChunkKind,
    pub delta: String,
}

/// Completed generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub text: String,
    pub model: String,
    /// Provider extras (usage counts, finish reason, ...).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

/// Contract for all chat-capable models.
#[async_trait]
pub trait Llm: Send + Sync {
    /// Single-shot chat completion.
    async fn chat(&self, messages: &[Message], params: &BTreeMap<String, Value>)
    -> FlowResult<LlmResponse>;

    /// Streaming chat completion. The receiver yields deltas in generation
    /// order; the channel closing without an error means the generation
    /// finished.
    async fn chat_stream(
        &self,
        messages: &[Message],
        params: &BTreeMap<String, Value>,
    ) -> FlowResult<mpsc::Receiver<FlowResult<LlmChunk>>>;

    /// Model identifier, for logging.
    fn model_name(&self) -> &str;
}

/// Deterministic in-process model.
///
/// Echoes the last user message (prefixed), optionally preceded by a
/// scripted "thinking" line. Used by tests and as the `mock` backend in
/// configs with no real provider.
pub struct MockLlm {
    model: String,
    prefix: String,
    think: Option<String>,
}

impl MockLlm {
    pub fn new(model: impl Into<String>) -> Self {
        MockLlm {
            model: model.into(),
            prefix: "echo: ".to_string(),
            think: None,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_think(mut self, think: impl Into<String>) -> Self {
        self.think = Some(think.into());
        self
    }

    fn reply_for(&self, messages: &[Message]) -> String {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == flowllm_core::Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        format!("{}{last_user}", self.prefix)
    }
}

#[async_trait]
impl Llm for MockLlm {
    async fn chat(
        &self,
        messages: &[Message],
        _params: &BTreeMap<String, Value>,
    ) -> FlowResult<LlmResponse> {
        if messages.is_empty() {
            return Err(FlowError::invalid("chat requires at least one message"));
        }
        Ok(LlmResponse {
            text: self.reply_for(messages),
            model: self.model.clone(),
            metadata: HashMap::new(),
        })
    }

    async fn chat_stream(
        &self,
        messages: &[Message],
        params: &BTreeMap<String, Value>,
    ) -> FlowResult<mpsc::Receiver<FlowResult<LlmChunk>>> {
        let response = self.chat(messages, params).await?;
        let think = self.think.clone();
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            if let Some(think) = think {
                let _ = tx
                    .send(Ok(LlmChunk {
                        kind: LlmChunkKind::Think,
                        delta: think,
                    }))
                    .await;
            }
            // Emit word-by-word so stream consumers see real interleaving.
            let words: Vec<String> = response.text.split_inclusive(' ').map(String::from).collect();
            for delta in words {
                if tx
                    .send(Ok(LlmChunk {
                        kind: LlmChunkKind::Answer,
                        delta,
                    }))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });
        Ok(rx)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_chat() {
        let llm = MockLlm::new("mock-1");
        let reply = llm
            .chat(&[Message::user("hi")], &BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(reply.text, "echo: hi");
        assert_eq!(reply.model, "mock-1");
    }

    #[tokio::test]
    async fn test_mock_stream_reassembles() {
        let llm = MockLlm::new("mock-1").with_think("let me see");
        let mut rx = llm
            .chat_stream(&[Message::user("one two three")], &BTreeMap::new())
            .await
            .unwrap();

        let mut answer = String::new();
        let mut thinks = 0;
        while let Some(chunk) = rx.recv().await {
            let chunk = chunk.unwrap();
            match chunk.kind {
                LlmChunkKind::Answer => answer.push_str(&chunk.delta),
                LlmChunkKind::Think => thinks += 1,
            }
        }
        assert_eq!(answer, "echo: one two three");
        assert_eq!(thinks, 1);
    }

    #[tokio::test]
    async fn test_empty_messages_rejected() {
        let llm = MockLlm::new("mock-1");
        assert!(llm.chat(&[], &BTreeMap::new()).await.is_err());
    }
}
