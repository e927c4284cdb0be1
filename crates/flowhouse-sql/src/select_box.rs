//! The select box: a stream operator driven by a compiled SELECT plan
//!
//! Each input tuple is fed into the physical plan; every result value is
//! emitted as a new tuple inheriting the input's timestamps, batch id, and a
//! copy of its trace. Emission is shaped by the statement's LIMIT and
//! sampling clauses:
//!
//! - count-based: one of every k generated rows is emitted
//! - randomized: each row is emitted with probability p/100
//! - time-based: `process` never writes; a periodic worker emits the most
//!   recently generated row on a fixed cadence
//!
//! When the LIMIT is reached the box detaches itself from its topology
//! through a single-shot removal hook injected at insertion time.

use std::sync::Arc;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::Mutex;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};
use tracing::{debug, error};

use flowhouse_core::{BoxOp, Context, Error as CoreError, Result as CoreResult, Tuple, Writer};

use crate::ast::SelectStmt;
use crate::plan::{
    DefaultPlanCompiler, EmissionShaping, PhysicalPlan, PlanCompiler, Sampling,
};
use crate::registry::FunctionRegistry;

/// Removes this box from its topology. Captures a weak topology handle and
/// the node name by value; it must hold neither the box itself nor a strong
/// topology handle, as either would form a reference cycle.
pub type DetachHook = Box<dyn FnOnce() + Send>;

/// State shared with the time-based emitter worker. Everything the periodic
/// worker touches lives under this one lock.
struct EmitterState {
    /// The most recently generated tuple, waiting for the next tick.
    last_tuple: Option<Tuple>,
    /// The writer that last tuple should be written to.
    last_writer: Option<Arc<dyn Writer>>,
    /// Set by `terminate`, or by the periodic worker once the limit is hit.
    stopped: bool,
    /// Number of tuples emitted so far.
    emit_count: i64,
    /// Single-shot removal hook; `take()`n so it can never fire twice.
    remove_me: Option<DetachHook>,
}

/// A box executing a SELECT statement per input tuple.
pub struct SelectBox {
    stmt: SelectStmt,
    functions: FunctionRegistry,
    compiler: Arc<dyn PlanCompiler>,
    plan: Option<Box<dyn PhysicalPlan>>,
    shaping: EmissionShaping,
    /// Rows generated so far; drives count-based sampling.
    gen_count: i64,
    rng: StdRng,
    emitter: Arc<Mutex<EmitterState>>,
}

impl SelectBox {
    /// Create a select box using the built-in plan compiler.
    pub fn new(stmt: SelectStmt, functions: FunctionRegistry) -> Self {
        Self::with_compiler(stmt, functions, Arc::new(DefaultPlanCompiler))
    }

    /// Create a select box with an external plan compiler.
    pub fn with_compiler(
        stmt: SelectStmt,
        functions: FunctionRegistry,
        compiler: Arc<dyn PlanCompiler>,
    ) -> Self {
        Self {
            stmt,
            functions,
            compiler,
            plan: None,
            shaping: EmissionShaping {
                limit: None,
                sampling: Sampling::None,
            },
            gen_count: 0,
            rng: StdRng::from_entropy(),
            emitter: Arc::new(Mutex::new(EmitterState {
                last_tuple: None,
                last_writer: None,
                stopped: false,
                emit_count: 0,
                remove_me: None,
            })),
        }
    }

    /// Install the removal hook. Must be called before the box is inserted
    /// into a topology.
    pub async fn set_remove_hook(&self, hook: DetachHook) {
        let mut em = self.emitter.lock().await;
        em.remove_me = Some(hook);
    }

    fn spawn_time_emitter(&self, ctx: Context, interval_ms: u64, limit: Option<i64>) {
        let state = self.emitter.clone();
        tokio::spawn(async move {
            let period = Duration::from_millis(interval_ms);
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let mut em = state.lock().await;
                // `stopped` is set either by `terminate` (we must not write
                // anything further) or by this worker when it hits the limit.
                if em.stopped {
                    debug!("time emitter stopped");
                    return;
                }
                let pending = em.last_tuple.take();
                let writer = em.last_writer.clone();
                if let (Some(tuple), Some(writer)) = (pending, writer) {
                    if let Err(e) = writer.write(&ctx, tuple).await {
                        error!(node_type = "box", error = %e, "cannot write tuple");
                    }
                    em.emit_count += 1;
                    if matches!(limit, Some(l) if em.emit_count >= l) {
                        em.stopped = true;
                        // Hitting the limit here means this worker is also
                        // responsible for removing the box.
                        if let Some(hook) = em.remove_me.take() {
                            hook();
                        }
                        return;
                    }
                }
            }
        });
    }
}

#[async_trait]
impl BoxOp for SelectBox {
    async fn init(&mut self, ctx: &Context) -> CoreResult<()> {
        self.shaping = EmissionShaping::from_stmt(&self.stmt).map_err(CoreError::process)?;
        let plan = self
            .compiler
            .compile(&self.stmt, &self.functions)
            .map_err(CoreError::process)?;
        self.plan = Some(plan);
        if let Sampling::TimeBased { interval_ms } = self.shaping.sampling {
            self.spawn_time_emitter(ctx.clone(), interval_ms as u64, self.shaping.limit);
        }
        Ok(())
    }

    async fn process(
        &mut self,
        ctx: &Context,
        tuple: Tuple,
        writer: &Arc<dyn Writer>,
    ) -> CoreResult<()> {
        let mut em = self.emitter.lock().await;

        // Already over the limit: nothing to do.
        if self.shaping.limit_reached(em.emit_count) {
            return Ok(());
        }

        let plan = self.plan.as_mut().ok_or_else(|| {
            CoreError::process(crate::error::SqlError::Plan(
                "select box was not initialized".to_string(),
            ))
        })?;
        let rows = plan.process(&tuple).map_err(CoreError::process)?;

        for data in rows {
            let out = Tuple {
                data,
                timestamp: tuple.timestamp,
                proc_timestamp: tuple.proc_timestamp,
                batch_id: tuple.batch_id,
                trace: tuple.trace.clone(),
            };

            let should_write = match self.shaping.sampling {
                Sampling::None => true,
                Sampling::CountBased { every_nth } => {
                    let emit = self.gen_count % every_nth == 0;
                    self.gen_count += 1;
                    emit
                }
                Sampling::Randomized { probability } => self.rng.gen_range(0..100) < probability,
                Sampling::TimeBased { .. } => {
                    // Nothing is ever emitted from here; the periodic worker
                    // picks up the latest pending tuple.
                    em.last_tuple = Some(out);
                    em.last_writer = Some(writer.clone());
                    continue;
                }
            };

            if should_write {
                writer.write(ctx, out).await?;
                em.emit_count += 1;
            }
            if self.shaping.limit_reached(em.emit_count) {
                break;
            }
        }

        if self.shaping.limit_reached(em.emit_count) {
            if let Some(hook) = em.remove_me.take() {
                hook();
            }
        }

        Ok(())
    }

    async fn terminate(&mut self, _ctx: &Context) -> CoreResult<()> {
        // Signal the time-based emitter to exit. Any pending tuple is
        // dropped, not flushed.
        let mut em = self.emitter.lock().await;
        em.stopped = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::SamplingClause;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct VecWriter {
        tuples: Arc<Mutex<Vec<Tuple>>>,
    }

    impl VecWriter {
        fn new() -> (Arc<dyn Writer>, Arc<Mutex<Vec<Tuple>>>) {
            let tuples = Arc::new(Mutex::new(Vec::new()));
            (
                Arc::new(Self {
                    tuples: tuples.clone(),
                }),
                tuples,
            )
        }
    }

    #[async_trait]
    impl Writer for VecWriter {
        async fn write(&self, _ctx: &Context, tuple: Tuple) -> CoreResult<()> {
            self.tuples.lock().await.push(tuple);
            Ok(())
        }
    }

    async fn feed(select_box: &mut SelectBox, writer: &Arc<dyn Writer>, values: Vec<Value>) {
        let ctx = Context::default();
        for (i, v) in values.into_iter().enumerate() {
            select_box
                .process(&ctx, Tuple::new(v, i as u64), writer)
                .await
                .unwrap();
        }
    }

    fn counted_hook() -> (DetachHook, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let hook_count = count.clone();
        (
            Box::new(move || {
                hook_count.fetch_add(1, Ordering::SeqCst);
            }),
            count,
        )
    }

    #[tokio::test]
    async fn test_passthrough_unlimited() {
        let ctx = Context::default();
        let mut sb = SelectBox::new(SelectStmt::wildcard_over("s"), FunctionRegistry::new());
        sb.init(&ctx).await.unwrap();
        let (writer, tuples) = VecWriter::new();
        feed(&mut sb, &writer, (0..5).map(|i| json!(i)).collect()).await;
        assert_eq!(tuples.lock().await.len(), 5);
    }

    #[tokio::test]
    async fn test_process_before_init_fails() {
        let ctx = Context::default();
        let mut sb = SelectBox::new(SelectStmt::wildcard_over("s"), FunctionRegistry::new());
        let (writer, _tuples) = VecWriter::new();
        let result = sb.process(&ctx, Tuple::new(json!(1), 0), &writer).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_limit_caps_emissions_and_detaches_once() {
        let ctx = Context::default();
        let mut sb = SelectBox::new(
            SelectStmt::wildcard_over("s").with_limit(2),
            FunctionRegistry::new(),
        );
        let (hook, fired) = counted_hook();
        sb.set_remove_hook(hook).await;
        sb.init(&ctx).await.unwrap();

        let (writer, tuples) = VecWriter::new();
        feed(&mut sb, &writer, (0..5).map(|i| json!(i)).collect()).await;

        let emitted = tuples.lock().await;
        assert_eq!(emitted.len(), 2);
        assert_eq!(emitted[0].data, json!(0));
        assert_eq!(emitted[1].data, json!(1));
        // The hook fired exactly once despite repeated over-limit calls.
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_limit_zero_never_emits() {
        let ctx = Context::default();
        let mut sb = SelectBox::new(
            SelectStmt::wildcard_over("s").with_limit(0),
            FunctionRegistry::new(),
        );
        sb.init(&ctx).await.unwrap();
        let (writer, tuples) = VecWriter::new();
        feed(&mut sb, &writer, (0..3).map(|i| json!(i)).collect()).await;
        assert!(tuples.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_count_based_sampling_is_deterministic() {
        let ctx = Context::default();
        let mut sb = SelectBox::new(
            SelectStmt::wildcard_over("s")
                .with_sampling(SamplingClause::CountBased { every_nth: 3 }),
            FunctionRegistry::new(),
        );
        sb.init(&ctx).await.unwrap();
        let (writer, tuples) = VecWriter::new();
        feed(&mut sb, &writer, (0..10).map(|i| json!(i)).collect()).await;

        // Among the first 10 generated rows, exactly ceil(10/3) are emitted:
        // generation indices 0, 3, 6, 9.
        let emitted: Vec<i64> = tuples
            .lock()
            .await
            .iter()
            .map(|t| t.data.as_i64().unwrap())
            .collect();
        assert_eq!(emitted, vec![0, 3, 6, 9]);
    }

    #[tokio::test]
    async fn test_randomized_sampling_extremes() {
        let ctx = Context::default();
        let mut never = SelectBox::new(
            SelectStmt::wildcard_over("s")
                .with_sampling(SamplingClause::Randomized { probability: 0 }),
            FunctionRegistry::new(),
        );
        never.init(&ctx).await.unwrap();
        let (writer, tuples) = VecWriter::new();
        feed(&mut never, &writer, (0..50).map(|i| json!(i)).collect()).await;
        assert!(tuples.lock().await.is_empty());

        let mut always = SelectBox::new(
            SelectStmt::wildcard_over("s")
                .with_sampling(SamplingClause::Randomized { probability: 100 }),
            FunctionRegistry::new(),
        );
        always.init(&ctx).await.unwrap();
        let (writer, tuples) = VecWriter::new();
        feed(&mut always, &writer, (0..50).map(|i| json!(i)).collect()).await;
        assert_eq!(tuples.lock().await.len(), 50);
    }

    #[tokio::test]
    async fn test_time_based_never_emits_from_process() {
        let ctx = Context::default();
        let mut sb = SelectBox::new(
            SelectStmt::wildcard_over("s")
                .with_sampling(SamplingClause::TimeBased { interval_ms: 40 }),
            FunctionRegistry::new(),
        );
        sb.init(&ctx).await.unwrap();
        let (writer, tuples) = VecWriter::new();
        feed(&mut sb, &writer, (0..10).map(|i| json!(i)).collect()).await;

        // Synchronously, nothing was written.
        assert!(tuples.lock().await.is_empty());

        // After a tick the periodic worker has flushed the latest tuple.
        tokio::time::sleep(Duration::from_millis(80)).await;
        let emitted = tuples.lock().await;
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].data, json!(9));
    }

    #[tokio::test]
    async fn test_time_based_limit_detaches_from_worker() {
        let ctx = Context::default();
        let mut sb = SelectBox::new(
            SelectStmt::wildcard_over("s")
                .with_limit(1)
                .with_sampling(SamplingClause::TimeBased { interval_ms: 30 }),
            FunctionRegistry::new(),
        );
        let (hook, fired) = counted_hook();
        sb.set_remove_hook(hook).await;
        sb.init(&ctx).await.unwrap();

        let (writer, tuples) = VecWriter::new();
        feed(&mut sb, &writer, vec![json!(1), json!(2)]).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(tuples.lock().await.len(), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // The worker has stopped; further tuples are never flushed.
        feed(&mut sb, &writer, vec![json!(3)]).await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(tuples.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_terminate_drops_pending_tuple() {
        let ctx = Context::default();
        let mut sb = SelectBox::new(
            SelectStmt::wildcard_over("s")
                .with_sampling(SamplingClause::TimeBased { interval_ms: 60 }),
            FunctionRegistry::new(),
        );
        sb.init(&ctx).await.unwrap();
        let (writer, tuples) = VecWriter::new();
        feed(&mut sb, &writer, vec![json!(1)]).await;

        // Terminate before the first tick: the pending tuple is dropped.
        sb.terminate(&ctx).await.unwrap();
        sb.terminate(&ctx).await.unwrap(); // idempotent
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(tuples.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_emitted_tuple_copies_trace_and_metadata() {
        let ctx = Context::default();
        let mut sb = SelectBox::new(SelectStmt::wildcard_over("s"), FunctionRegistry::new());
        sb.init(&ctx).await.unwrap();
        let (writer, tuples) = VecWriter::new();

        let mut input = Tuple::new(json!({"v": 1}), 42);
        input.add_event(flowhouse_core::TraceEvent::now(
            flowhouse_core::EventKind::Output,
            "s",
        ));
        sb.process(&ctx, input.clone(), &writer).await.unwrap();

        let emitted = tuples.lock().await;
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].batch_id, 42);
        assert_eq!(emitted[0].timestamp, input.timestamp);
        assert_eq!(emitted[0].trace, input.trace);
    }

    #[tokio::test]
    async fn test_invalid_sampling_fails_at_init() {
        let ctx = Context::default();
        let mut sb = SelectBox::new(
            SelectStmt::wildcard_over("s")
                .with_sampling(SamplingClause::Randomized { probability: 200 }),
            FunctionRegistry::new(),
        );
        assert!(sb.init(&ctx).await.is_err());
    }
}
