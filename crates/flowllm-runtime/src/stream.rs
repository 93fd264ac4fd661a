//! The streaming outbox.
//!
//! A streaming invocation owns one bounded, ordered chunk channel. Ops
//! produce through [`StreamOutbox::emit`], which waits when the channel is
//! full; that wait is the backpressure path back into the op. The service
//! layer holds the receiver, forwards chunks in order, and appends the
//! terminal `Done`. Once the receiver is gone (client disconnect), every
//! further emit fails with `Cancelled`.

use flowllm_core::{FlowError, FlowResult, StreamChunk};
use tokio::sync::mpsc;

/// Producer half of an invocation's chunk channel.
#[derive(Clone)]
pub struct StreamOutbox {
    tx: mpsc::Sender<StreamChunk>,
}

impl StreamOutbox {
    /// Create a bounded outbox and its receiver.
    pub fn channel(capacity: usize) -> (StreamOutbox, mpsc::Receiver<StreamChunk>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (StreamOutbox { tx }, rx)
    }

    /// Emit a chunk, waiting for channel capacity.
    pub async fn emit(&self, chunk: StreamChunk) -> FlowResult<()> {
        self.tx.send(chunk).await.map_err(|_| FlowError::Cancelled)
    }

    /// Emit from a blocking (worker-pool) thread.
    pub fn emit_blocking(&self, chunk: StreamChunk) -> FlowResult<()> {
        self.tx
            .blocking_send(chunk)
            .map_err(|_| FlowError::Cancelled)
    }

    /// Whether the receiver is still attached.
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}
