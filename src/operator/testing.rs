//! Reference operators used by this crate's own unit and integration
//! tests. Not part of the public operator library; gated behind
//! `#[cfg(any(test, feature = "testing"))]` so downstream crates can reuse
//! them to exercise their own pipelines without re-implementing
//! boilerplate sources and sinks.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::control::ControlPlane;
use crate::diagnostic::{Diagnostic, Severity, Span};
use crate::element::{AnyBatch, BytesBatch, EventsBatch, VoidBatch};
use crate::error::PipelineError;
use crate::operator::{BatchSeq, Filter, Location, Operator, OptimizeResult, Order, Step};
use crate::element::ElementType;

/// Passes every batch through unchanged, for whatever element type it's
/// given. The canonical no-op operator: used both as a literal pipeline
/// step and as the replacement an optimizer elision produces.
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl Identity {
    pub fn new() -> Self {
        Self
    }
}

impl Operator for Identity {
    fn name(&self) -> &str {
        "identity"
    }

    fn infer_type(&self, input: ElementType) -> Result<ElementType, PipelineError> {
        Ok(input)
    }

    fn is_identity(&self) -> bool {
        true
    }

    fn instantiate(&self, input: BatchSeq<AnyBatch>, _ctrl: ControlPlane) -> BatchSeq<AnyBatch> {
        input
    }
}

/// Produces a fixed, finite sequence of event batches, then terminates.
///
/// Advertises filter push-down (`spec.md` section 4.4 / `SPEC_FULL.md`
/// scenario S3): when the optimizer hands it a pending filter, it wraps
/// itself together with the filter's reinstated operator into a two-stage
/// pipeline fragment rather than leaving the filter to be re-applied
/// downstream. A source that can't filter its own rows (e.g.
/// [`SourceBytes`]) simply doesn't override `optimize` and the filter
/// rides along unabsorbed, per the default `OptimizeResult::noop`.
#[derive(Debug, Clone)]
pub struct SourceConst {
    batches: Vec<EventsBatch>,
}

impl SourceConst {
    pub fn new(batches: Vec<EventsBatch>) -> Self {
        Self { batches }
    }
}

struct SourceConstIter {
    remaining: std::vec::IntoIter<EventsBatch>,
    ctrl: ControlPlane,
    done: bool,
}

impl Iterator for SourceConstIter {
    type Item = Step<AnyBatch>;

    fn next(&mut self) -> Option<Step<AnyBatch>> {
        if self.done {
            return None;
        }
        if self.ctrl.is_cancelled() {
            self.done = true;
            return Some(Step::Done);
        }
        match self.remaining.next() {
            Some(batch) => Some(Step::Batch(AnyBatch::Events(batch))),
            None => {
                self.done = true;
                Some(Step::Done)
            }
        }
    }
}

impl Operator for SourceConst {
    fn name(&self) -> &str {
        "source_const"
    }

    fn infer_type(&self, input: ElementType) -> Result<ElementType, PipelineError> {
        if input != ElementType::Void {
            return Err(PipelineError::TypeMismatch {
                operator: self.name().into(),
                expected: ElementType::Void.to_string(),
                found: input.to_string(),
                span: Span::unknown(),
            });
        }
        Ok(ElementType::Events)
    }

    fn optimize(&self, pending_filter: Filter, required_order: Order) -> OptimizeResult {
        match pending_filter {
            Filter::True => OptimizeResult {
                replacement: None,
                residual_filter: Filter::True,
                realized_order: required_order,
            },
            predicate @ Filter::Predicate { .. } => {
                let Filter::Predicate { reinstate, .. } = predicate else {
                    unreachable!()
                };
                let fused = crate::pipeline::Pipeline::new(vec![Box::new(self.clone()), reinstate]);
                OptimizeResult {
                    replacement: Some(Box::new(fused)),
                    residual_filter: Filter::True,
                    realized_order: required_order,
                }
            }
        }
    }

    fn instantiate(&self, _input: BatchSeq<AnyBatch>, ctrl: ControlPlane) -> BatchSeq<AnyBatch> {
        Box::new(SourceConstIter {
            remaining: self.batches.clone().into_iter(),
            ctrl,
            done: false,
        })
    }
}

/// A source that produces `count` single-row event batches back to back,
/// never ticking, used to drive a downstream consumer into back-pressure
/// (testable property 6).
#[derive(Debug, Clone)]
pub struct SourceFast {
    schema: Arc<crate::schema::Schema>,
    count: usize,
}

impl SourceFast {
    pub fn new(schema: Arc<crate::schema::Schema>, count: usize) -> Self {
        Self { schema, count }
    }
}

struct SourceFastIter {
    schema: Arc<crate::schema::Schema>,
    remaining: usize,
    ctrl: ControlPlane,
    done: bool,
}

impl Iterator for SourceFastIter {
    type Item = Step<AnyBatch>;

    fn next(&mut self) -> Option<Step<AnyBatch>> {
        if self.done {
            return None;
        }
        if self.ctrl.is_cancelled() || self.remaining == 0 {
            self.done = true;
            return Some(Step::Done);
        }
        self.remaining -= 1;
        let schema = self.schema.clone();
        // A real single-row batch, not an empty one: `spec.md` section 4.5's
        // back-pressure bound only counts non-empty batches, so a
        // zero-row "fast source" would never actually produce the
        // back-pressure this operator exists to exercise (testable
        // property 4). The row's content is irrelevant to the scenario, so
        // every leaf column gets a single null value.
        let columns = schema
            .leaf_types()
            .iter()
            .map(|t| arrow::array::new_null_array(&t.arrow_type(), 1))
            .collect();
        let batch = EventsBatch::try_new(schema, columns, 1, crate::clock::now_nanos())
            .expect("a one-row batch with one array per leaf always satisfies the invariant");
        Some(Step::Batch(AnyBatch::Events(batch)))
    }
}

impl Operator for SourceFast {
    fn name(&self) -> &str {
        "source_fast"
    }

    fn infer_type(&self, input: ElementType) -> Result<ElementType, PipelineError> {
        if input != ElementType::Void {
            return Err(PipelineError::TypeMismatch {
                operator: self.name().into(),
                expected: ElementType::Void.to_string(),
                found: input.to_string(),
                span: Span::unknown(),
            });
        }
        Ok(ElementType::Events)
    }

    fn instantiate(&self, _input: BatchSeq<AnyBatch>, ctrl: ControlPlane) -> BatchSeq<AnyBatch> {
        Box::new(SourceFastIter {
            schema: self.schema.clone(),
            remaining: self.count,
            ctrl,
            done: false,
        })
    }
}

/// An events pass-through that sleeps `delay` before forwarding each
/// batch, standing in for a slow downstream consumer in back-pressure
/// tests.
#[derive(Debug, Clone)]
pub struct OpSlow {
    delay: Duration,
}

impl OpSlow {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Operator for OpSlow {
    fn name(&self) -> &str {
        "op_slow"
    }

    fn detached(&self) -> bool {
        true
    }

    fn infer_type(&self, input: ElementType) -> Result<ElementType, PipelineError> {
        Ok(input)
    }

    fn instantiate(&self, input: BatchSeq<AnyBatch>, _ctrl: ControlPlane) -> BatchSeq<AnyBatch> {
        let delay = self.delay;
        Box::new(input.map(move |step| {
            if !matches!(step, Step::Done) {
                std::thread::sleep(delay);
            }
            step
        }))
    }
}

/// A source that asks its execution node to wait before it has anything
/// to emit, then delivers its batches once an external event wakes it
/// back up.
///
/// Demonstrates the waiting/suspension contract (`spec.md` section 4.5,
/// `SPEC_FULL.md` scenario S7): the first poll calls
/// `ctrl.set_waiting(true)` and yields a tick; a background thread (the
/// "external event" -- a completed I/O read, in a real operator) clears
/// the flag again after `wake_after`. Nothing about this operator's own
/// sequence checks the flag itself: whether its execution node honors
/// "don't poll me while I'm waiting" is entirely the node's
/// responsibility, which is exactly what [`WaitThenEmit::poll_count`]
/// lets a test verify.
#[derive(Debug, Clone)]
pub struct WaitThenEmit {
    batches: Vec<EventsBatch>,
    wake_after: Duration,
    poll_count: Arc<AtomicUsize>,
}

impl WaitThenEmit {
    pub fn new(batches: Vec<EventsBatch>, wake_after: Duration) -> Self {
        Self {
            batches,
            wake_after,
            poll_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// How many times this operator's output sequence has actually been
    /// polled. A node that honors the waiting contract polls it exactly
    /// once to learn it should wait, and once more per batch (plus a
    /// final call to observe `Done`) -- never again in between.
    pub fn poll_count(&self) -> Arc<AtomicUsize> {
        self.poll_count.clone()
    }
}

struct WaitThenEmitIter {
    remaining: std::vec::IntoIter<EventsBatch>,
    ctrl: ControlPlane,
    waited: bool,
    poll_count: Arc<AtomicUsize>,
    done: bool,
}

impl Iterator for WaitThenEmitIter {
    type Item = Step<AnyBatch>;

    fn next(&mut self) -> Option<Step<AnyBatch>> {
        self.poll_count.fetch_add(1, Ordering::SeqCst);
        if self.done {
            return None;
        }
        if self.ctrl.is_cancelled() {
            self.done = true;
            return Some(Step::Done);
        }
        if !self.waited {
            self.waited = true;
            self.ctrl.set_waiting(true);
            return Some(Step::Tick(AnyBatch::Void(VoidBatch)));
        }
        match self.remaining.next() {
            Some(batch) => Some(Step::Batch(AnyBatch::Events(batch))),
            None => {
                self.done = true;
                Some(Step::Done)
            }
        }
    }
}

impl Operator for WaitThenEmit {
    fn name(&self) -> &str {
        "wait_then_emit"
    }

    fn infer_type(&self, input: ElementType) -> Result<ElementType, PipelineError> {
        if input != ElementType::Void {
            return Err(PipelineError::TypeMismatch {
                operator: self.name().into(),
                expected: ElementType::Void.to_string(),
                found: input.to_string(),
                span: Span::unknown(),
            });
        }
        Ok(ElementType::Events)
    }

    fn instantiate(&self, _input: BatchSeq<AnyBatch>, ctrl: ControlPlane) -> BatchSeq<AnyBatch> {
        let wake_after = self.wake_after;
        let waker = ctrl.clone();
        std::thread::spawn(move || {
            std::thread::sleep(wake_after);
            waker.set_waiting(false);
        });
        Box::new(WaitThenEmitIter {
            remaining: self.batches.clone().into_iter(),
            ctrl,
            waited: false,
            poll_count: self.poll_count.clone(),
            done: false,
        })
    }
}

/// An opaque row-level predicate applied to event batches. Dropped
/// (pass-through) batches are not forwarded at all; this is deliberately
/// coarse (whole-batch, not per-row) since the optimizer only needs to
/// move a [`Filter`] around, never evaluate one.
///
/// `predicate` is a trait-object closure, so the derived `Debug`/`Clone`
/// need `derivative` the same way the teacher's operator structs do for
/// their boxed closures: `Clone` forwards to `Arc::clone`, `Debug` prints
/// the label instead of trying (and failing) to format the closure.
#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub struct Where {
    label: Arc<str>,
    #[derivative(Debug = "ignore")]
    predicate: Arc<dyn Fn(&EventsBatch) -> bool + Send + Sync>,
}

impl Where {
    pub fn new(label: impl Into<Arc<str>>, predicate: Arc<dyn Fn(&EventsBatch) -> bool + Send + Sync>) -> Self {
        Self {
            label: label.into(),
            predicate,
        }
    }
}

impl Operator for Where {
    fn name(&self) -> &str {
        "where"
    }

    fn infer_type(&self, input: ElementType) -> Result<ElementType, PipelineError> {
        if input != ElementType::Events {
            return Err(PipelineError::TypeMismatch {
                operator: self.name().into(),
                expected: ElementType::Events.to_string(),
                found: input.to_string(),
                span: Span::unknown(),
            });
        }
        Ok(ElementType::Events)
    }

    /// Elides itself unconditionally: the residual filter carries its
    /// predicate upstream for the optimizer to push further or, failing
    /// that, re-apply at the front of the pipeline (`spec.md` section 4.4).
    fn optimize(&self, pending_filter: Filter, _required_order: Order) -> OptimizeResult {
        let mine = Filter::predicate(self.label.clone(), Box::new(self.clone()));
        OptimizeResult {
            replacement: Some(Box::new(Identity::new())),
            residual_filter: pending_filter.and(mine),
            realized_order: Order::Ordered,
        }
    }

    fn instantiate(&self, input: BatchSeq<AnyBatch>, _ctrl: ControlPlane) -> BatchSeq<AnyBatch> {
        let predicate = self.predicate.clone();
        Box::new(input.filter_map(move |step| match step {
            Step::Batch(AnyBatch::Events(b)) => {
                if predicate(&b) {
                    Some(Step::Batch(AnyBatch::Events(b)))
                } else {
                    None
                }
            }
            other => Some(other),
        }))
    }

    fn inspect(&self) -> serde_json::Value {
        serde_json::json!({ "predicate": self.label.as_ref() })
    }
}

/// Fails after forwarding `after` non-empty batches, by emitting a fatal
/// diagnostic and then terminating -- the reference operator for the
/// runtime-error-cancellation scenario (testable property 5).
#[derive(Debug, Clone)]
pub struct FailOnRow {
    after: usize,
    message: Arc<str>,
}

impl FailOnRow {
    pub fn new(after: usize, message: impl Into<Arc<str>>) -> Self {
        Self {
            after,
            message: message.into(),
        }
    }
}

impl Operator for FailOnRow {
    fn name(&self) -> &str {
        "op_fail_on_row"
    }

    fn infer_type(&self, input: ElementType) -> Result<ElementType, PipelineError> {
        Ok(input)
    }

    fn instantiate(&self, mut input: BatchSeq<AnyBatch>, ctrl: ControlPlane) -> BatchSeq<AnyBatch> {
        let mut seen = 0usize;
        let after = self.after;
        let message = self.message.clone();
        let mut failed = false;
        Box::new(std::iter::from_fn(move || {
            if failed {
                return None;
            }
            match input.next() {
                Some(Step::Batch(batch)) => {
                    seen += 1;
                    if seen > after {
                        ctrl.emit(Diagnostic::new(Severity::Error, message.to_string(), Span::unknown()));
                        failed = true;
                        Some(Step::Done)
                    } else {
                        Some(Step::Batch(batch))
                    }
                }
                Some(other) => Some(other),
                None => {
                    failed = true;
                    Some(Step::Done)
                }
            }
        }))
    }

    fn inspect(&self) -> serde_json::Value {
        serde_json::json!({ "after": self.after, "message": self.message.as_ref() })
    }
}

/// Accumulates every non-tick event batch it sees into a shared buffer,
/// for exact-equality assertions in tests.
#[derive(Debug, Clone)]
pub struct SinkCollect {
    collected: Arc<Mutex<Vec<EventsBatch>>>,
}

impl SinkCollect {
    pub fn new() -> Self {
        Self {
            collected: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn collected(&self) -> Arc<Mutex<Vec<EventsBatch>>> {
        self.collected.clone()
    }
}

impl Default for SinkCollect {
    fn default() -> Self {
        Self::new()
    }
}

impl Operator for SinkCollect {
    fn name(&self) -> &str {
        "sink_collect"
    }

    fn infer_type(&self, input: ElementType) -> Result<ElementType, PipelineError> {
        if input != ElementType::Events {
            return Err(PipelineError::TypeMismatch {
                operator: self.name().into(),
                expected: ElementType::Events.to_string(),
                found: input.to_string(),
                span: Span::unknown(),
            });
        }
        Ok(ElementType::Void)
    }

    fn instantiate(&self, input: BatchSeq<AnyBatch>, _ctrl: ControlPlane) -> BatchSeq<AnyBatch> {
        let collected = self.collected.clone();
        Box::new(input.map(move |step| match step {
            Step::Batch(AnyBatch::Events(b)) => {
                collected.lock().push(b);
                Step::Tick(AnyBatch::Void(VoidBatch))
            }
            Step::Tick(_) => Step::Tick(AnyBatch::Void(VoidBatch)),
            Step::Done => Step::Done,
            Step::Batch(other) => {
                debug_assert!(false, "sink_collect given a non-events batch: {other:?}");
                Step::Tick(AnyBatch::Void(VoidBatch))
            }
        }))
    }
}

/// A lightweight sink that only accumulates row/byte counters, for tests
/// that push large volumes through and only care about aggregates.
#[derive(Debug, Clone, Default)]
pub struct SinkEvents {
    rows: Arc<AtomicU64>,
    batches: Arc<AtomicUsize>,
}

impl SinkEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> u64 {
        self.rows.load(Ordering::Relaxed)
    }

    pub fn batches(&self) -> usize {
        self.batches.load(Ordering::Relaxed)
    }
}

impl Operator for SinkEvents {
    fn name(&self) -> &str {
        "sink_events"
    }

    fn infer_type(&self, input: ElementType) -> Result<ElementType, PipelineError> {
        if input != ElementType::Events {
            return Err(PipelineError::TypeMismatch {
                operator: self.name().into(),
                expected: ElementType::Events.to_string(),
                found: input.to_string(),
                span: Span::unknown(),
            });
        }
        Ok(ElementType::Void)
    }

    fn instantiate(&self, input: BatchSeq<AnyBatch>, _ctrl: ControlPlane) -> BatchSeq<AnyBatch> {
        let rows = self.rows.clone();
        let batches = self.batches.clone();
        Box::new(input.map(move |step| match step {
            Step::Batch(AnyBatch::Events(b)) => {
                rows.fetch_add(b.row_count() as u64, Ordering::Relaxed);
                batches.fetch_add(1, Ordering::Relaxed);
                Step::Tick(AnyBatch::Void(VoidBatch))
            }
            Step::Tick(_) => Step::Tick(AnyBatch::Void(VoidBatch)),
            Step::Done => Step::Done,
            other => other,
        }))
    }
}

/// A bytes source that yields a fixed sequence of byte chunks, then
/// terminates.
#[derive(Debug, Clone)]
pub struct SourceBytes {
    chunks: Vec<Arc<[u8]>>,
}

impl SourceBytes {
    pub fn new(chunks: Vec<Arc<[u8]>>) -> Self {
        Self { chunks }
    }
}

impl Operator for SourceBytes {
    fn name(&self) -> &str {
        "source_bytes"
    }

    fn location(&self) -> Location {
        Location::Anywhere
    }

    fn infer_type(&self, input: ElementType) -> Result<ElementType, PipelineError> {
        if input != ElementType::Void {
            return Err(PipelineError::TypeMismatch {
                operator: self.name().into(),
                expected: ElementType::Void.to_string(),
                found: input.to_string(),
                span: Span::unknown(),
            });
        }
        Ok(ElementType::Bytes)
    }

    fn instantiate(&self, _input: BatchSeq<AnyBatch>, ctrl: ControlPlane) -> BatchSeq<AnyBatch> {
        let mut remaining = self.chunks.clone().into_iter();
        let mut done = false;
        Box::new(std::iter::from_fn(move || {
            if done {
                return None;
            }
            if ctrl.is_cancelled() {
                done = true;
                return Some(Step::Done);
            }
            match remaining.next() {
                Some(chunk) => Some(Step::Batch(AnyBatch::Bytes(BytesBatch::new(chunk)))),
                None => {
                    done = true;
                    Some(Step::Done)
                }
            }
        }))
    }
}
