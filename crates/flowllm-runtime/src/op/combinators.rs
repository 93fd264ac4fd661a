//! Sequential and parallel composition.
//!
//! Both combinators are ops themselves and agree in `async_mode` with every
//! child; the parser and the constructors reject misaligned or empty
//! compositions. The container combinator (`<<`) is not a node type: it
//! attaches named children to a parent op via [`crate::op::Op::attach_child`],
//! and is rejected on sequential/parallel nodes.

use std::collections::BTreeMap;

use async_trait::async_trait;
use flowllm_core::{FlowError, FlowResult};
use serde_json::Value;

use crate::context::Context;
use crate::op::{BoxedOp, Op, OpIo, OpSpec, outputs_to_value, runtime};
use crate::scheduler::TaskGroup;

fn mode_of(children: &[BoxedOp], combinator: &str) -> FlowResult<bool> {
    let Some(first) = children.first() else {
        return Err(FlowError::Parse {
            message: format!("{combinator} composition requires at least one op"),
        });
    };
    let mode = first.spec().async_mode;
    for child in children {
        if child.spec().async_mode != mode {
            return Err(FlowError::Parse {
                message: format!(
                    "{combinator} composition mixes async modes: `{}` is {} but `{}` is {}",
                    children[0].spec().name,
                    mode_name(mode),
                    child.spec().name,
                    mode_name(child.spec().async_mode),
                ),
            });
        }
    }
    Ok(mode)
}

fn mode_name(async_mode: bool) -> &'static str {
    if async_mode { "async" } else { "blocking" }
}

/// Runs children in declared order on the shared context; fails fast.
pub struct SequentialOp {
    spec: OpSpec,
    children: Vec<BoxedOp>,
}

impl SequentialOp {
    pub fn new(children: Vec<BoxedOp>) -> FlowResult<Self> {
        let async_mode = mode_of(&children, "sequential")?;
        let mut spec = OpSpec::new("sequential_op");
        spec.async_mode = async_mode;
        Ok(SequentialOp { spec, children })
    }

    pub fn children(&self) -> &[BoxedOp] {
        &self.children
    }
}

#[async_trait]
impl Op for SequentialOp {
    fn spec(&self) -> &OpSpec {
        &self.spec
    }

    fn spec_mut(&mut self) -> &mut OpSpec {
        &mut self.spec
    }

    async fn async_execute(&mut self, ctx: &Context, io: &mut OpIo) -> FlowResult<()> {
        let kwargs = BTreeMap::new();
        for child in self.children.iter_mut() {
            io.outputs = runtime::async_call(child.as_mut(), ctx, &kwargs).await?;
        }
        Ok(())
    }

    fn execute(&mut self, ctx: &Context, io: &mut OpIo) -> FlowResult<()> {
        let kwargs = BTreeMap::new();
        for child in self.children.iter_mut() {
            io.outputs = runtime::call(child.as_mut(), ctx, &kwargs)?;
        }
        Ok(())
    }

    fn attach_child(&mut self, _name: String, _child: BoxedOp) -> FlowResult<()> {
        Err(FlowError::Parse {
            message: "`<<` is not supported on a sequential composition".to_string(),
        })
    }

    fn boxed_clone(&self) -> BoxedOp {
        Box::new(SequentialOp {
            spec: self.spec.clone(),
            children: self.children.iter().map(|c| c.boxed_clone()).collect(),
        })
    }
}

/// Runs children concurrently on the shared context.
///
/// Async-mode children become cooperative tasks; blocking children go
/// through the worker pool. The aggregated output is a list in declared
/// child order. A failing child cancels its siblings through the context
/// token; with `raise_on_failure=false` the completed children's results
/// are kept and failed children contribute their default output.
pub struct ParallelOp {
    spec: OpSpec,
    children: Vec<BoxedOp>,
}

impl ParallelOp {
    pub fn new(children: Vec<BoxedOp>) -> FlowResult<Self> {
        let async_mode = mode_of(&children, "parallel")?;
        let mut spec = OpSpec::new("parallel_op");
        spec.async_mode = async_mode;
        Ok(ParallelOp { spec, children })
    }

    pub fn children(&self) -> &[BoxedOp] {
        &self.children
    }

    /// A child's fallback output, computed on a fresh clone.
    fn fallback_for(child: &dyn Op) -> BTreeMap<String, Value> {
        let mut clone = child.boxed_clone();
        let mut io = OpIo::default();
        clone.default_execute(&mut io);
        io.outputs
    }

    fn collect(
        &self,
        results: Vec<FlowResult<BTreeMap<String, Value>>>,
        fallbacks: Vec<BTreeMap<String, Value>>,
        io: &mut OpIo,
    ) {
        let list: Vec<Value> = results
            .into_iter()
            .zip(fallbacks)
            .map(|(result, fallback)| match result {
                Ok(outputs) => outputs_to_value(&outputs),
                Err(_) => outputs_to_value(&fallback),
            })
            .collect();
        io.set_output(
            format!("{}_result", self.spec.short_name()),
            Value::Array(list),
        );
    }
}

#[async_trait]
impl Op for ParallelOp {
    fn spec(&self) -> &OpSpec {
        &self.spec
    }

    fn spec_mut(&mut self) -> &mut OpSpec {
        &mut self.spec
    }

    async fn async_execute(&mut self, ctx: &Context, io: &mut OpIo) -> FlowResult<()> {
        let raise = self.spec.raise_on_failure;
        let fallbacks: Vec<_> = self
            .children
            .iter()
            .map(|child| Self::fallback_for(child.as_ref()))
            .collect();

        let mut group = TaskGroup::new();
        for child in &self.children {
            // Deep copy: no op instance is shared across concurrent tasks.
            let mut child = child.boxed_clone();
            let ctx = ctx.clone();
            group.submit(async move {
                let result = runtime::async_call(child.as_mut(), &ctx, &BTreeMap::new()).await;
                if result.is_err() && raise {
                    ctx.cancel();
                }
                result
            });
        }

        let results = group.join(None, !raise).await?;
        self.collect(results, fallbacks, io);
        Ok(())
    }

    fn execute(&mut self, ctx: &Context, io: &mut OpIo) -> FlowResult<()> {
        let raise = self.spec.raise_on_failure;
        let fallbacks: Vec<_> = self
            .children
            .iter()
            .map(|child| Self::fallback_for(child.as_ref()))
            .collect();

        // Blocking children run on the worker pool; this thread (itself a
        // pool thread) waits for all of them. Blocking tasks cannot be
        // aborted mid-run, so sibling cancellation is carried entirely by
        // the context token, which children poll at their I/O boundaries.
        let service = ctx.service_arc();
        let pool_futures: Vec<_> = self
            .children
            .iter()
            .map(|child| {
                let mut child = child.boxed_clone();
                let ctx = ctx.clone();
                service.submit_blocking(move || {
                    let result = runtime::call(child.as_mut(), &ctx, &BTreeMap::new());
                    if result.is_err() && raise {
                        ctx.cancel();
                    }
                    result
                })
            })
            .collect();
        let results: Vec<FlowResult<BTreeMap<String, Value>>> =
            futures::executor::block_on(futures::future::join_all(pool_futures))
                .into_iter()
                .map(|submitted| submitted.and_then(|inner| inner))
                .collect();

        if raise && results.iter().any(|r| r.is_err()) {
            let error = results
                .into_iter()
                .find_map(Result::err)
                .unwrap_or(FlowError::Cancelled);
            return Err(error);
        }
        self.collect(results, fallbacks, io);
        Ok(())
    }

    fn attach_child(&mut self, _name: String, _child: BoxedOp) -> FlowResult<()> {
        Err(FlowError::Parse {
            message: "`<<` is not supported on a parallel composition".to_string(),
        })
    }

    fn boxed_clone(&self) -> BoxedOp {
        Box::new(ParallelOp {
            spec: self.spec.clone(),
            children: self.children.iter().map(|c| c.boxed_clone()).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use crate::service::ServiceHandle;
    use flowllm_core::ServiceConfig;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::{Duration, Instant};

    fn test_context() -> Context {
        let service = ServiceHandle::new(ServiceConfig::default(), Arc::new(Registry::new()));
        Context::builder(service).build()
    }

    /// Reads `n`, sleeps, writes `n + 1`.
    struct AddOneOp {
        spec: OpSpec,
        delay: Duration,
    }

    impl AddOneOp {
        fn boxed(delay: Duration) -> BoxedOp {
            Box::new(AddOneOp {
                spec: OpSpec::new("add_one_op"),
                delay,
            })
        }
    }

    #[async_trait]
    impl Op for AddOneOp {
        fn spec(&self) -> &OpSpec {
            &self.spec
        }
        fn spec_mut(&mut self) -> &mut OpSpec {
            &mut self.spec
        }
        async fn async_execute(&mut self, ctx: &Context, io: &mut OpIo) -> FlowResult<()> {
            tokio::time::sleep(self.delay).await;
            let n = ctx.get("n").and_then(|v| v.as_i64()).unwrap_or(0);
            ctx.insert("n", json!(n + 1));
            io.set_output("n", json!(n + 1));
            Ok(())
        }
        fn boxed_clone(&self) -> BoxedOp {
            AddOneOp::boxed(self.delay)
        }
    }

    /// Fails, or sleeps long and records survival.
    struct FailOrHangOp {
        spec: OpSpec,
        fail: bool,
        survived: Arc<AtomicBool>,
    }

    impl FailOrHangOp {
        fn boxed(fail: bool, survived: Arc<AtomicBool>) -> BoxedOp {
            Box::new(FailOrHangOp {
                spec: OpSpec::new(if fail { "fail_op" } else { "hang_op" }),
                fail,
                survived,
            })
        }
    }

    #[async_trait]
    impl Op for FailOrHangOp {
        fn spec(&self) -> &OpSpec {
            &self.spec
        }
        fn spec_mut(&mut self) -> &mut OpSpec {
            &mut self.spec
        }
        async fn async_execute(&mut self, ctx: &Context, io: &mut OpIo) -> FlowResult<()> {
            if self.fail {
                tokio::time::sleep(Duration::from_millis(5)).await;
                return Err(FlowError::execution("fail_op", "boom"));
            }
            for _ in 0..100 {
                tokio::time::sleep(Duration::from_millis(10)).await;
                ctx.check_active()?;
            }
            self.survived.store(true, Ordering::SeqCst);
            io.set_result(json!("survived"));
            Ok(())
        }
        fn boxed_clone(&self) -> BoxedOp {
            FailOrHangOp::boxed(self.fail, Arc::clone(&self.survived))
        }
    }

    #[tokio::test]
    async fn test_sequential_happens_before() {
        let mut op = SequentialOp::new(vec![
            AddOneOp::boxed(Duration::ZERO),
            AddOneOp::boxed(Duration::ZERO),
            AddOneOp::boxed(Duration::ZERO),
        ])
        .unwrap();
        let ctx = test_context();
        ctx.insert("n", json!(0));

        let outputs = runtime::async_call(&mut op, &ctx, &BTreeMap::new())
            .await
            .unwrap();
        // Each child observed the previous child's write.
        assert_eq!(ctx.get("n"), Some(json!(3)));
        // The composition returns the last child's output.
        assert_eq!(outputs["n"], json!(3));
    }

    #[tokio::test]
    async fn test_sequential_fails_fast() {
        let survived = Arc::new(AtomicBool::new(false));
        let mut op = SequentialOp::new(vec![
            FailOrHangOp::boxed(true, Arc::clone(&survived)),
            AddOneOp::boxed(Duration::ZERO),
        ])
        .unwrap();
        let ctx = test_context();
        ctx.insert("n", json!(0));

        assert!(
            runtime::async_call(&mut op, &ctx, &BTreeMap::new())
                .await
                .is_err()
        );
        // The second child never started.
        assert_eq!(ctx.get("n"), Some(json!(0)));
    }

    #[tokio::test]
    async fn test_parallel_children_overlap() {
        let mut op = ParallelOp::new(vec![
            AddOneOp::boxed(Duration::from_millis(60)),
            AddOneOp::boxed(Duration::from_millis(60)),
        ])
        .unwrap();
        let ctx = test_context();
        ctx.insert("n", json!(0));

        let started = Instant::now();
        runtime::async_call(&mut op, &ctx, &BTreeMap::new())
            .await
            .unwrap();
        // Two 60ms children that overlap finish well under the 120ms a
        // sequential run would need.
        assert!(started.elapsed() < Duration::from_millis(110));
    }

    #[tokio::test]
    async fn test_parallel_sibling_failure_cancels_and_settles() {
        let survived = Arc::new(AtomicBool::new(false));
        let mut op = ParallelOp::new(vec![
            FailOrHangOp::boxed(true, Arc::clone(&survived)),
            FailOrHangOp::boxed(false, Arc::clone(&survived)),
        ])
        .unwrap();
        let ctx = test_context();

        let error = runtime::async_call(&mut op, &ctx, &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            FlowError::Execution { .. } | FlowError::Cancelled
        ));
        assert!(ctx.cancel_token().is_cancelled());
        // After the combinator returned, no child is still running.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!survived.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_parallel_collects_defaults_when_not_raising() {
        let survived = Arc::new(AtomicBool::new(false));
        let mut op = ParallelOp::new(vec![
            AddOneOp::boxed(Duration::ZERO),
            FailOrHangOp::boxed(true, Arc::clone(&survived)),
        ])
        .unwrap();
        op.spec_mut().raise_on_failure = false;
        let ctx = test_context();
        ctx.insert("n", json!(0));

        let outputs = runtime::async_call(&mut op, &ctx, &BTreeMap::new())
            .await
            .unwrap();
        let list = outputs["parallel_result"].as_array().unwrap();
        assert_eq!(list.len(), 2);
        // Declared order: the successful child first, then the failed
        // child's default output.
        assert_eq!(list[0]["n"], json!(1));
        assert_eq!(list[1]["fail_result"], json!("fail_op execution failed!"));
        assert!(!ctx.cancel_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_mode_mismatch_rejected() {
        struct BlockingNoop {
            spec: OpSpec,
        }
        #[async_trait]
        impl Op for BlockingNoop {
            fn spec(&self) -> &OpSpec {
                &self.spec
            }
            fn spec_mut(&mut self) -> &mut OpSpec {
                &mut self.spec
            }
            fn execute(&mut self, _ctx: &Context, _io: &mut OpIo) -> FlowResult<()> {
                Ok(())
            }
            fn boxed_clone(&self) -> BoxedOp {
                Box::new(BlockingNoop {
                    spec: self.spec.clone(),
                })
            }
        }

        let result = SequentialOp::new(vec![
            AddOneOp::boxed(Duration::ZERO),
            Box::new(BlockingNoop {
                spec: OpSpec::blocking("blocking_noop_op"),
            }),
        ]);
        assert!(matches!(result, Err(FlowError::Parse { .. })));
    }

    #[tokio::test]
    async fn test_empty_composition_rejected() {
        assert!(SequentialOp::new(vec![]).is_err());
        assert!(ParallelOp::new(vec![]).is_err());
    }

    #[tokio::test]
    async fn test_combinators_reject_attach() {
        let mut op = SequentialOp::new(vec![AddOneOp::boxed(Duration::ZERO)]).unwrap();
        assert!(
            op.attach_child("x".into(), AddOneOp::boxed(Duration::ZERO))
                .is_err()
        );
    }
}
