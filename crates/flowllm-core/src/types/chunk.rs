//! Streaming chunk types.
//!
//! Ops emit [`StreamChunk`]s into the invocation's outbox; the service layer
//! forwards them to the client in order. `Done` is synthesized by the service
//! and is always the final event of a stream.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of a streamed chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    /// Final-answer content, delivered incrementally.
    Answer,
    /// Model reasoning that is not part of the answer.
    Think,
    /// A tool invocation or tool result surfaced mid-flow.
    Tool,
    /// A failure; followed only by `Done`.
    Error,
    /// Terminal marker. At most one per stream, nothing after it.
    Done,
}

impl ChunkKind {
    /// Lowercase wire name, as used in SSE event payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkKind::Answer => "answer",
            ChunkKind::Think => "think",
            ChunkKind::Tool => "tool",
            ChunkKind::Error => "error",
            ChunkKind::Done => "done",
        }
    }
}

/// One unit of streamed output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    /// What this chunk carries.
    #[serde(rename = "type")]
    pub kind: ChunkKind,
    /// String content for answer/think chunks; structured for tool chunks.
    pub content: Value,
}

impl StreamChunk {
    /// Build a chunk from a kind and a plain string.
    pub fn text(kind: ChunkKind, content: impl Into<String>) -> Self {
        StreamChunk {
            kind,
            content: Value::String(content.into()),
        }
    }

    /// Build an answer chunk.
    pub fn answer(content: impl Into<String>) -> Self {
        Self::text(ChunkKind::Answer, content)
    }

    /// Build an error chunk.
    pub fn error(message: impl Into<String>) -> Self {
        Self::text(ChunkKind::Error, message)
    }

    /// The terminal marker.
    pub fn done() -> Self {
        StreamChunk {
            kind: ChunkKind::Done,
            content: Value::String(String::new()),
        }
    }

    /// Content as a string slice, when the content is textual.
    pub fn content_str(&self) -> Option<&str> {
        self.content.as_str()
    }
}
