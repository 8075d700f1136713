//! The executor (component C6, `spec.md` section 4.6).
//!
//! Turns a built [`Pipeline`] into a running set of [`ExecutionNode`]s and
//! drives them to completion through the [`Scheduler`], enforcing the
//! five-step contract `spec.md` section 4.6 describes:
//!
//! 1. Type-check the pipeline as `void -> void`; a mismatch aborts before
//!    anything is spawned.
//! 2. Flatten nested pipelines, then run the optimizer pass.
//! 3. Spawn one execution node per remaining operator, wiring a bounded
//!    mailbox between each adjacent pair.
//! 4. Start every node, sink first, so back-pressure exists before the
//!    source produces its first batch.
//! 5. Monitor every node to completion. When a node reports `down` with a
//!    failure, the executor stops every node from the source up to (and
//!    including) that one (`SPEC_FULL.md` section 4.6 supplement); nodes
//!    downstream of the failure are left alone -- the failed node already
//!    closed its own downstream mailbox, so they observe end-of-input
//!    naturally rather than being force-cancelled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use crate::channel::{bounded, Mailbox, MailboxReceiver};
use crate::config::RuntimeConfig;
use crate::control::{ControlPlane, NodeDirectory, NodeHandle};
use crate::diagnostic::{ChannelDiagnosticHandler, SharedDiagnosticHandle, SourceId, Span};
use crate::element::ElementType;
use crate::error::PipelineError;
use crate::metrics::{MetricReceiver, MetricSink};
use crate::node::{ExecutionNode, NodeIdentity};
use crate::operator::{BoxedOperator, Location, Operator};
use crate::pipeline::Pipeline;
use crate::scheduler::{NodeOutcome, Scheduler};

/// Where, walking the operator chain left to right, this process's
/// location changes from the previous operator's (`spec.md` section 4.6
/// step 3): `index` is the position of the first operator on the new
/// side, `produces` is the element type the wire must carry across it, and
/// `operator_name` is the operator that forced the change, for the
/// diagnostic raised when bridging isn't permitted.
struct LocationBoundary {
    index: usize,
    produces: ElementType,
    operator_name: String,
}

/// Finds every point where an operator's declared [`Location`] forces a
/// change of side. An [`Location::Anywhere`] operator simply sticks with
/// whichever side the pipeline is already on, so a boundary is only
/// reported where a `must-be-local`/`must-be-remote` requirement actually
/// conflicts with the side carried forward from the previous operator --
/// minimizing the number of bridge pairs inserted.
fn find_location_boundaries(operators: &[BoxedOperator]) -> Vec<LocationBoundary> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Side {
        Local,
        Remote,
    }

    let mut boundaries = Vec::new();
    // The executor's own process is always the starting side (`spec.md`
    // section 4.6 step 3: "differs from the local process location"), not
    // whichever side the first operator happens to declare -- a pipeline
    // that is `MustBeRemote` from its very first operator still needs a
    // bridge ahead of it.
    let mut current_side = Side::Local;
    let mut input_type = ElementType::Void;

    for (index, op) in operators.iter().enumerate() {
        let side = match op.location() {
            Location::MustBeLocal => Side::Local,
            Location::MustBeRemote => Side::Remote,
            Location::Anywhere => current_side,
        };
        if side != current_side {
            boundaries.push(LocationBoundary {
                index,
                produces: input_type,
                operator_name: op.name().to_string(),
            });
        }
        current_side = side;
        input_type = op
            .infer_type(input_type)
            .expect("operator chain already passed check_types");
    }
    boundaries
}

/// Replaces each detected location boundary with an [`crate::bridge::Egress`]/
/// [`crate::bridge::Ingress`] pair, wired to a freshly allocated loopback
/// address (`spec.md` section 4.6 step 3 / section 5).
#[cfg(feature = "tokio")]
fn splice_location_bridges(
    operators: Vec<BoxedOperator>,
    boundaries: Vec<LocationBoundary>,
) -> Vec<BoxedOperator> {
    let mut result = Vec::with_capacity(operators.len() + boundaries.len() * 2);
    let mut boundaries = boundaries.into_iter().peekable();
    for (index, op) in operators.into_iter().enumerate() {
        if boundaries.peek().is_some_and(|b| b.index == index) {
            let boundary = boundaries.next().unwrap();
            let addr = crate::bridge::allocate_loopback_addr();
            debug!(
                "executor: inserting a bridge pair at {addr} ahead of operator '{}' ({} crossing a location boundary)",
                boundary.operator_name, boundary.produces
            );
            result.push(Box::new(crate::bridge::Egress::new(addr)) as BoxedOperator);
            result.push(Box::new(crate::bridge::Ingress::new(addr, boundary.produces)) as BoxedOperator);
        }
        result.push(op);
    }
    result
}

/// Everything the executor needs that isn't carried by the pipeline itself:
/// where diagnostics and metrics go, the shared node directory, and the
/// tunables from `RuntimeConfig`. One instance is built per pipeline run.
pub struct Executor {
    config: RuntimeConfig,
    diagnostics: Arc<ChannelDiagnosticHandler>,
    shared_diagnostics: SharedDiagnosticHandle,
    metrics: Arc<dyn MetricReceiver>,
    directory: Arc<NodeDirectory>,
}

impl Executor {
    pub fn new(
        config: RuntimeConfig,
        diagnostics: Arc<ChannelDiagnosticHandler>,
        metrics: Arc<dyn MetricReceiver>,
        directory: Arc<NodeDirectory>,
    ) -> Self {
        let shared_diagnostics = diagnostics.shared_handle();
        Self {
            config,
            diagnostics,
            shared_diagnostics,
            metrics,
            directory,
        }
    }

    /// Detects location boundaries in `operators` and, if any are found,
    /// either splices in a bridge pair for each one (when
    /// `allow_unsafe_pipelines` permits it) or rejects the pipeline
    /// (`spec.md` section 4.6 step 3 / section 4.7).
    fn apply_location_boundaries(
        &self,
        operators: Vec<BoxedOperator>,
    ) -> Result<Vec<BoxedOperator>, PipelineError> {
        let boundaries = find_location_boundaries(&operators);
        if boundaries.is_empty() {
            return Ok(operators);
        }
        if !self.config.allow_unsafe_pipelines {
            return Err(PipelineError::InvalidConfiguration {
                message: format!(
                    "operator '{}' requires crossing a location boundary, but this deployment \
                     does not allow it (allow_unsafe_pipelines is false)",
                    boundaries[0].operator_name
                ),
                span: Span::unknown(),
            });
        }
        #[cfg(feature = "tokio")]
        {
            Ok(splice_location_bridges(operators, boundaries))
        }
        #[cfg(not(feature = "tokio"))]
        {
            Err(PipelineError::InvalidConfiguration {
                message: format!(
                    "operator '{}' requires a cross-process bridge, but this build was compiled \
                     without the `tokio` feature",
                    boundaries[0].operator_name
                ),
                span: Span::unknown(),
            })
        }
    }

    /// Runs `pipeline` to completion, blocking the caller. Convenience
    /// wrapper around [`Executor::spawn`] plus [`RunningPipeline::join`]
    /// for callers that don't need to `stop` a run early.
    pub fn run(&self, pipeline: Pipeline, pipeline_id: SourceId, definition: &str) -> Result<(), PipelineError> {
        self.spawn(pipeline, pipeline_id, definition)?.join()
    }

    /// Type-checks, flattens and optimizes `pipeline`, then spawns one
    /// execution node per remaining operator and returns a handle to the
    /// running pipeline. Returns before any node has necessarily finished;
    /// callers that just want the final result can call
    /// [`RunningPipeline::join`] immediately.
    pub fn spawn(
        &self,
        pipeline: Pipeline,
        pipeline_id: SourceId,
        definition: &str,
    ) -> Result<RunningPipeline, PipelineError> {
        let flattened = pipeline.flatten();
        flattened.check_types(ElementType::Void, ElementType::Void)?;
        let optimized = flattened.optimize();

        // S1: an empty pipeline (or one optimized away to nothing) does
        // nothing and succeeds immediately -- there is no sink to start and
        // no source to produce.
        if optimized.is_empty() {
            return Ok(RunningPipeline::already_done());
        }

        let operators = self.apply_location_boundaries(optimized.into_operators())?;
        let n = operators.len();
        let max_inflight = self.config.max_inflight.get();

        // `senders[i]` is operator `i`'s downstream mailbox (`None` for the
        // sink); `inputs[i]` is operator `i`'s upstream receiver (`None`
        // for the source).
        let mut senders: Vec<Option<Mailbox>> = Vec::with_capacity(n);
        let mut inputs: Vec<Option<MailboxReceiver>> = Vec::with_capacity(n);
        inputs.push(None);
        for _ in 0..n.saturating_sub(1) {
            let (tx, rx) = bounded(max_inflight);
            senders.push(Some(tx));
            inputs.push(Some(rx));
        }
        senders.push(None);

        let mut nodes = Vec::with_capacity(n);
        let mut control_planes = Vec::with_capacity(n);
        let mut waiting_flags = Vec::with_capacity(n);

        for (i, op) in operators.into_iter().enumerate() {
            let op_name = op.name().to_string();
            let is_hidden = op.internal();
            let identity = NodeIdentity {
                pipeline_id,
                operator_index: i,
                definition: format!("{definition}[{i}]: {op_name}"),
            };
            let definition_label = identity.definition.clone();
            let downstream = senders[i].take();
            let node = ExecutionNode::new(identity, op, downstream);
            let waiting = Arc::new(AtomicBool::new(false));
            let ctrl = ControlPlane::new(
                self.diagnostics.clone(),
                self.shared_diagnostics.clone(),
                Arc::new(MetricSink::new(pipeline_id, i, self.metrics.clone())),
                self.directory.clone(),
                NodeHandle {
                    pipeline_id,
                    operator_index: i,
                },
                node.cancel_token(),
                waiting.clone(),
                self.config.allow_unsafe_pipelines,
                definition_label,
                Span::unknown(),
                is_hidden,
                op_name,
            );
            waiting_flags.push(waiting);
            control_planes.push(ctrl);
            nodes.push(node);
        }

        // Start sink-first, then walk upstream (`spec.md` section 4.6 step
        // 4): in this synchronous model `start` never blocks, but the
        // iteration order still mirrors the spec's "back-pressure exists
        // before the source produces" narrative for operators whose
        // `instantiate` has observable side effects.
        for i in (0..n).rev() {
            let input = inputs[i].take();
            nodes[i].start(input, control_planes[i].clone(), waiting_flags[i].clone());
        }

        let cancel_tokens: Vec<_> = nodes.iter().map(|node| node.cancel_token()).collect();

        let scheduler = Scheduler::new(self.config);
        let (rx, handles) = scheduler.spawn(nodes);

        Ok(RunningPipeline {
            total: n,
            cancel_tokens,
            outcomes: Some(rx),
            handles,
            stopped: Arc::new(AtomicBool::new(false)),
            diagnostics: Some(self.diagnostics.clone()),
        })
    }
}

/// A handle to a spawned pipeline run. Dropping this without calling
/// [`join`](RunningPipeline::join) leaves the nodes running in the
/// background; call `stop` first if that isn't wanted.
pub struct RunningPipeline {
    total: usize,
    cancel_tokens: Vec<Arc<AtomicBool>>,
    outcomes: Option<mpsc::Receiver<NodeOutcome>>,
    handles: Vec<thread::JoinHandle<()>>,
    stopped: Arc<AtomicBool>,
    diagnostics: Option<Arc<ChannelDiagnosticHandler>>,
}

impl RunningPipeline {
    fn already_done() -> Self {
        Self {
            total: 0,
            cancel_tokens: Vec::new(),
            outcomes: None,
            handles: Vec::new(),
            stopped: Arc::new(AtomicBool::new(false)),
            diagnostics: None,
        }
    }

    /// Requests cancellation of every node. Idempotent (testable property
    /// 8 / `SPEC_FULL.md` scenario S8): a second call observes `stopped`
    /// already set and does nothing further.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        for token in &self.cancel_tokens {
            token.store(true, Ordering::SeqCst);
        }
    }

    /// Blocks until every node has terminated, applying the from-source-
    /// up-to-the-failure stop propagation (`SPEC_FULL.md` section 4.6
    /// supplement) as failures are observed. Returns the first fatal
    /// failure seen, if any.
    pub fn join(mut self) -> Result<(), PipelineError> {
        let mut first_failure: Option<PipelineError> = None;
        if let Some(rx) = self.outcomes.take() {
            let mut remaining = self.total;
            while remaining > 0 {
                let Ok(outcome) = rx.recv() else { break };
                remaining -= 1;
                let Some(err) = outcome.failure else { continue };
                if !err.is_fatal() || matches!(err, PipelineError::Cancelled) {
                    continue;
                }
                if first_failure.is_none() {
                    first_failure = Some(err);
                }
                // Stop every node from the source up to and including the
                // one that failed; downstream nodes see their upstream
                // mailbox close and drain naturally.
                let failed_at = outcome.identity.operator_index;
                for token in self.cancel_tokens.iter().take(failed_at + 1) {
                    token.store(true, Ordering::SeqCst);
                }
            }
        }

        for handle in self.handles {
            let _ = handle.join();
        }

        // `node.rs`'s `has_seen_error` check observes one pipeline-wide
        // flag, so whichever node happens to poll it next after the flag
        // flips can self-report as the failure even though it never
        // emitted anything itself. Prefer the operator named by the first
        // fatal diagnostic actually emitted, which is always correct
        // (`spec.md` section 7).
        if let (Some(PipelineError::RuntimeError { span, .. }), Some(diagnostics)) =
            (&first_failure, &self.diagnostics)
        {
            if let Some(diag) = diagnostics.first_fatal() {
                if let Some(operator) = diag.operator {
                    first_failure = Some(PipelineError::RuntimeError {
                        operator,
                        message: diag.message,
                        span: *span,
                    });
                }
            }
        }

        match first_failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::CollectingMetricReceiver;
    use crate::operator::testing::{FailOnRow, Identity, OpSlow, SinkCollect, SourceConst, SourceFast};
    use crate::row::{events_batch_from_rows, Scalar};
    use crate::schema::{Field, LeafType, Schema};
    use std::num::NonZeroUsize;

    fn schema() -> Arc<Schema> {
        Arc::new(Schema::new("t", vec![Field::new("x", LeafType::Int64)]))
    }

    fn executor() -> (Executor, Arc<ChannelDiagnosticHandler>) {
        let diagnostics = Arc::new(ChannelDiagnosticHandler::new());
        let executor = Executor::new(
            RuntimeConfig::default(),
            diagnostics.clone(),
            Arc::new(CollectingMetricReceiver::default()),
            Arc::new(NodeDirectory::default()),
        );
        (executor, diagnostics)
    }

    #[test]
    fn empty_pipeline_succeeds_without_spawning_anything() {
        let (executor, _diagnostics) = executor();
        let result = executor.run(Pipeline::empty(), SourceId(1), "empty");
        assert!(result.is_ok());
    }

    #[test]
    fn source_to_sink_forwards_batches_in_order() {
        let (executor, _diagnostics) = executor();
        let schema = schema();
        let rows: Vec<_> = (1..=3)
            .map(|x| events_batch_from_rows(schema.clone(), vec![vec![Scalar::Int64(x)]], 0).unwrap())
            .collect();
        let sink = SinkCollect::new();
        let collected = sink.collected();
        let pipeline = Pipeline::new(vec![
            Box::new(SourceConst::new(rows)),
            Box::new(Identity::new()),
            Box::new(sink),
        ]);
        let result = executor.run(pipeline, SourceId(2), "pass_through");
        assert!(result.is_ok());
        let collected = collected.lock();
        assert_eq!(collected.len(), 3);
        for (i, batch) in collected.iter().enumerate() {
            assert_eq!(crate::row::first_row_int64(batch, "x"), Some(i as i64 + 1));
        }
    }

    #[test]
    fn type_mismatch_is_rejected_before_anything_runs() {
        let (executor, _diagnostics) = executor();
        // A lone source never reduces void -> void.
        let pipeline = Pipeline::new(vec![Box::new(SourceConst::new(vec![]))]);
        let result = executor.run(pipeline, SourceId(3), "bad");
        assert!(matches!(result, Err(PipelineError::TypeMismatch { .. })));
    }

    #[test]
    fn runtime_failure_cancels_the_pipeline_and_is_returned() {
        let (executor, diagnostics) = executor();
        let schema = schema();
        let rows: Vec<_> = (1..=5)
            .map(|x| events_batch_from_rows(schema.clone(), vec![vec![Scalar::Int64(x)]], 0).unwrap())
            .collect();
        let pipeline = Pipeline::new(vec![
            Box::new(SourceConst::new(rows)),
            Box::new(FailOnRow::new(2, "boom")),
            Box::new(SinkCollect::new()),
        ]);
        let result = executor.run(pipeline, SourceId(4), "fails");
        // `op_fail_on_row` is the only operator that ever emits a fatal
        // diagnostic here; the returned error must name it, not whichever
        // node happens to next observe the pipeline-wide error flag.
        match result {
            Err(PipelineError::RuntimeError { operator, .. }) => {
                assert_eq!(operator, "op_fail_on_row");
            }
            other => panic!("expected a RuntimeError naming op_fail_on_row, got {other:?}"),
        }
        assert!(diagnostics.drain().iter().any(|d| d.is_fatal()));
    }

    #[test]
    fn forwarding_batches_emits_a_per_schema_metric() {
        let diagnostics = Arc::new(ChannelDiagnosticHandler::new());
        let metrics = Arc::new(CollectingMetricReceiver::default());
        let executor = Executor::new(
            RuntimeConfig::default(),
            diagnostics,
            metrics.clone(),
            Arc::new(NodeDirectory::default()),
        );
        let schema = schema();
        let rows: Vec<_> = (1..=3)
            .map(|x| events_batch_from_rows(schema.clone(), vec![vec![Scalar::Int64(x)]], 0).unwrap())
            .collect();
        let pipeline = Pipeline::new(vec![Box::new(SourceConst::new(rows)), Box::new(SinkCollect::new())]);
        let result = executor.run(pipeline, SourceId(7), "metrics");
        assert!(result.is_ok());

        // `source_const` (operator index 0) is the only node that produces
        // `events` batches here; `sink_collect` converts them to ticks and
        // reports nothing. One record per forwarded batch (`spec.md`
        // section 4.5: "at least once per processed batch").
        let records = metrics.snapshot();
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.operator_index == 0));
        assert_eq!(records.iter().map(|r| r.events).sum::<u64>(), 3);
        assert!(records.iter().all(|r| r.bytes > 0));
    }

    #[test]
    fn location_boundary_is_rejected_when_unsafe_pipelines_are_disallowed() {
        use crate::operator::location::LocationWrapper;

        let (executor, _diagnostics) = executor(); // allow_unsafe_pipelines defaults to false
        let schema = schema();
        let rows = vec![events_batch_from_rows(schema, vec![vec![Scalar::Int64(1)]], 0).unwrap()];
        let pipeline = Pipeline::new(vec![
            Box::new(SourceConst::new(rows)),
            Box::new(LocationWrapper::new(Box::new(Identity::new()), Location::MustBeRemote)),
            Box::new(SinkCollect::new()),
        ]);
        let result = executor.run(pipeline, SourceId(8), "unsafe");
        assert!(matches!(result, Err(PipelineError::InvalidConfiguration { .. })));
    }

    #[test]
    #[cfg(feature = "tokio")]
    fn location_boundary_is_spliced_with_a_bridge_pair_when_allowed() {
        use crate::operator::location::LocationWrapper;

        let diagnostics = Arc::new(ChannelDiagnosticHandler::new());
        let config = RuntimeConfig::default().with_allow_unsafe_pipelines(true);
        let executor = Executor::new(
            config,
            diagnostics,
            Arc::new(CollectingMetricReceiver::default()),
            Arc::new(NodeDirectory::default()),
        );
        let schema = schema();
        let rows: Vec<_> = (1..=3)
            .map(|x| events_batch_from_rows(schema.clone(), vec![vec![Scalar::Int64(x)]], 0).unwrap())
            .collect();
        let sink = SinkCollect::new();
        let collected = sink.collected();
        let pipeline = Pipeline::new(vec![
            Box::new(SourceConst::new(rows)),
            Box::new(LocationWrapper::new(Box::new(Identity::new()), Location::MustBeRemote)),
            Box::new(sink),
        ]);
        let result = executor.run(pipeline, SourceId(9), "bridged");
        assert!(result.is_ok(), "bridged pipeline should run to completion: {result:?}");
        assert_eq!(collected.lock().len(), 3);
    }

    #[test]
    fn stopping_a_running_pipeline_twice_is_idempotent() {
        let (executor, _diagnostics) = executor();
        let schema = schema();
        let pipeline = Pipeline::new(vec![
            Box::new(SourceFast::new(schema, 1_000_000)),
            Box::new(OpSlow::new(std::time::Duration::from_millis(5))),
            Box::new(SinkCollect::new()),
        ]);
        let running = executor.spawn(pipeline, SourceId(5), "slow").unwrap();
        running.stop();
        running.stop();
        let result = running.join();
        assert!(result.is_ok());
    }

    #[test]
    fn back_pressure_bound_is_respected_by_a_fast_producer() {
        let diagnostics = Arc::new(ChannelDiagnosticHandler::new());
        let config = RuntimeConfig::default().with_max_inflight(NonZeroUsize::new(4).unwrap());
        let executor = Executor::new(
            config,
            diagnostics,
            Arc::new(CollectingMetricReceiver::default()),
            Arc::new(NodeDirectory::default()),
        );
        let schema = schema();
        let sink = SinkCollect::new();
        let collected = sink.collected();
        let pipeline = Pipeline::new(vec![
            Box::new(SourceFast::new(schema, 50)),
            Box::new(OpSlow::new(std::time::Duration::from_micros(500))),
            Box::new(sink),
        ]);
        let result = executor.run(pipeline, SourceId(6), "backpressure");
        assert!(result.is_ok());
        assert_eq!(collected.lock().len(), 50);
    }
}
