//! The FlowLLM execution core.
//!
//! Ops are units of computation; flows compose them sequentially (`>>`),
//! in parallel (`|`), or as named children (`<<`) and are invoked through
//! the [`dispatcher::Dispatcher`]. One invocation owns one [`context::Context`]
//! shared by every op in the tree; cooperative ops run on the async runtime
//! while blocking ops go through the bounded [`scheduler::WorkerPool`].

pub mod cache;
pub mod context;
pub mod dispatcher;
pub mod flow;
pub mod op;
pub mod parser;
pub mod registry;
pub mod scheduler;
pub mod service;
pub mod stream;

pub use cache::{CachePolicy, OpCache};
pub use context::Context;
pub use dispatcher::{DispatchOptions, Dispatcher, FlowOutcome};
pub use flow::Flow;
pub use op::gallery::register_builtins;
pub use op::{BoxedOp, Op, OpIo, OpSpec};
pub use parser::{OpExpr, ParseError};
pub use registry::Registry;
pub use scheduler::{CancelToken, TaskGroup, WorkerPool};
pub use service::ServiceHandle;
pub use stream::StreamOutbox;
