//! The execution node (component C5, `spec.md` section 4.5).
//!
//! One execution node corresponds to one operator in a running pipeline.
//! It drives the operator's lazy output sequence, forwards results
//! downstream, and walks the state machine documented in `spec.md`
//! section 4.5:
//!
//! ```text
//!         start
//!  idle ─────────▶ running ───────────▶ draining ───────▶ terminated
//!                   │  ▲                     │                ▲
//!           waiting │  │ resumed             │ input-closed   │
//!                   ▼  │                     ▼                │
//!                 waiting ──── cancel ─────▶ cancelling ──────┘
//!                                            │   fatal
//!                                            ▼
//!                                          failed (terminal)
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::channel::{Mailbox, MailboxReceiver};
use crate::control::ControlPlane;
use crate::diagnostic::SourceId;
use crate::element::{AnyBatch, VoidBatch};
use crate::error::PipelineError;
use crate::operator::{BatchSeq, BoxedOperator, Step};

/// How long a cooperative (non-detached) node's input reader waits for the
/// next message before yielding a tick back to the round-robin scheduler
/// and giving other nodes on the same worker a turn. This is an
/// implementation detail of the cooperative scheduler, not part of the
/// public contract: it only bounds *worker responsiveness*, never the
/// data the pipeline sees.
pub const COOPERATIVE_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// The execution node's lifecycle state (`spec.md` section 4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Idle,
    Running,
    Waiting,
    Draining,
    Cancelling,
    Failed,
    Terminated,
}

impl NodeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, NodeState::Failed | NodeState::Terminated)
    }
}

/// Adapts an upstream [`MailboxReceiver`] into the [`BatchSeq`] an
/// operator's `instantiate` consumes, per the standard Rust `Iterator`
/// protocol: the operator pulls from this as it needs, exactly as it would
/// pull from any other iterator.
struct MailboxIter {
    receiver: MailboxReceiver,
    blocking: bool,
    cancelled: Arc<AtomicBool>,
    closed: bool,
}

impl Iterator for MailboxIter {
    type Item = Step<AnyBatch>;

    fn next(&mut self) -> Option<Step<AnyBatch>> {
        if self.closed || self.cancelled.load(Ordering::SeqCst) {
            return None;
        }
        if self.blocking {
            // Detached nodes own a dedicated OS thread; blocking here is
            // exactly the "blocking calls allowed" contract of `spec.md`
            // section 4.5.
            match self.receiver.recv() {
                Some(batch) => Some(wrap(batch)),
                None => {
                    self.closed = true;
                    Some(Step::Done)
                }
            }
        } else {
            match self.receiver.recv_timeout(COOPERATIVE_POLL_INTERVAL) {
                Ok(Some(batch)) => Some(wrap(batch)),
                Ok(None) => Some(Step::Tick(AnyBatch::Void(VoidBatch))),
                Err(_) => {
                    self.closed = true;
                    Some(Step::Done)
                }
            }
        }
    }
}

fn wrap(batch: AnyBatch) -> Step<AnyBatch> {
    if batch.is_tick() {
        Step::Tick(batch)
    } else {
        Step::Batch(batch)
    }
}

/// A source's driver: there is no upstream mailbox, so its input sequence
/// is a void-tick generator that the source's `instantiate` can pull from
/// purely to observe cancellation between yields.
struct VoidDriver {
    cancelled: Arc<AtomicBool>,
    done: bool,
}

impl Iterator for VoidDriver {
    type Item = Step<AnyBatch>;

    fn next(&mut self) -> Option<Step<AnyBatch>> {
        if self.done {
            return None;
        }
        if self.cancelled.load(Ordering::SeqCst) {
            self.done = true;
            return Some(Step::Done);
        }
        Some(Step::Tick(AnyBatch::Void(VoidBatch)))
    }
}

/// Identity of one operator's placement in a running pipeline, used for
/// logs, diagnostics and metric labels.
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    pub pipeline_id: SourceId,
    pub operator_index: usize,
    pub definition: String,
}

/// One running operator. Exclusively owned by the [`crate::executor::Executor`]
/// that spawned it (`spec.md` section 3, Ownership).
pub struct ExecutionNode {
    identity: NodeIdentity,
    operator: BoxedOperator,
    output_seq: Option<BatchSeq<AnyBatch>>,
    downstream: Option<Mailbox>,
    state: NodeState,
    cancelled: Arc<AtomicBool>,
    waiting_flag: Arc<AtomicBool>,
    pending: Option<AnyBatch>,
    failure: Option<PipelineError>,
    /// A clone of the control plane handed to the operator at `start`,
    /// retained so `step` can notice a fatal diagnostic the operator
    /// emitted and transition to `failed` on its behalf (`spec.md` section
    /// 7: "the execution node transitions to failed; the executor cancels
    /// the rest of the pipeline"). Reference operators are not required to
    /// call `fail` themselves -- emitting a fatal diagnostic is enough.
    ctrl: Option<ControlPlane>,
}

impl ExecutionNode {
    pub fn new(identity: NodeIdentity, operator: BoxedOperator, downstream: Option<Mailbox>) -> Self {
        Self {
            identity,
            operator,
            output_seq: None,
            downstream,
            state: NodeState::Idle,
            cancelled: Arc::new(AtomicBool::new(false)),
            waiting_flag: Arc::new(AtomicBool::new(false)),
            pending: None,
            failure: None,
            ctrl: None,
        }
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    /// Whether the operator driving this node requires a dedicated OS
    /// thread (`spec.md` section 4.5), used by the scheduler to decide
    /// placement.
    pub fn is_detached(&self) -> bool {
        self.operator.detached()
    }

    pub fn cancel_token(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    /// Starts the node: builds the operator's lazy output sequence from
    /// its input and the control plane. Idempotent -- a second call is a
    /// no-op, satisfying testable property 8 (idempotent stop) at the node
    /// level as well as the executor level.
    pub fn start(&mut self, input: Option<MailboxReceiver>, ctrl: ControlPlane, waiting: Arc<AtomicBool>) {
        if self.state != NodeState::Idle {
            return;
        }
        self.waiting_flag = waiting;
        let input_seq: BatchSeq<AnyBatch> = match input {
            Some(receiver) => Box::new(MailboxIter {
                receiver,
                blocking: self.operator.detached(),
                cancelled: self.cancelled.clone(),
                closed: false,
            }),
            None => Box::new(VoidDriver {
                cancelled: self.cancelled.clone(),
                done: false,
            }),
        };
        self.ctrl = Some(ctrl.clone());
        self.output_seq = Some(self.operator.instantiate(input_seq, ctrl));
        self.state = NodeState::Running;
    }

    /// Requests cancellation. Safe to call more than once (testable
    /// property 8): subsequent calls observe the flag already set and do
    /// nothing further.
    pub fn stop(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if matches!(self.state, NodeState::Running | NodeState::Waiting) {
            self.state = NodeState::Cancelling;
        }
    }

    /// Advances the node by exactly one step. Returns `true` if the node
    /// made progress (the worker may call again immediately), `false` if
    /// it is blocked on downstream capacity or waiting on external I/O
    /// (the round-robin scheduler should move on to another node).
    pub fn step(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }

        if self
            .ctrl
            .as_ref()
            .is_some_and(|ctrl| ctrl.has_seen_error())
        {
            self.fail(PipelineError::RuntimeError {
                operator: self.operator.name().to_string(),
                message: "operator emitted a fatal diagnostic".into(),
                span: crate::diagnostic::Span::unknown(),
            });
            return false;
        }

        if let Some(pending) = self.pending.take() {
            match self.try_forward(pending) {
                Ok(()) => {}
                Err(batch) => {
                    self.pending = Some(batch);
                    return false;
                }
            }
        }

        if self.cancelled.load(Ordering::SeqCst) && self.state != NodeState::Cancelling {
            self.state = NodeState::Cancelling;
        } else if self.waiting_flag.load(Ordering::SeqCst) {
            // A waiting yield is an instruction not to reschedule until an
            // external event arrives (`spec.md` section 4.5): the operator
            // already told us, via `ctrl.set_waiting(true)`, that calling
            // its sequence again right now would be wasted work. Report no
            // progress and let the scheduler move on, without touching
            // `output_seq` at all.
            self.state = NodeState::Waiting;
            return false;
        } else if self.state == NodeState::Waiting {
            self.state = NodeState::Running;
        }

        let Some(seq) = self.output_seq.as_mut() else {
            return false;
        };

        match seq.next() {
            Some(Step::Batch(batch)) | Some(Step::Tick(batch)) => {
                match self.try_forward(batch) {
                    Ok(()) => true,
                    Err(batch) => {
                        self.pending = Some(batch);
                        false
                    }
                }
            }
            Some(Step::Done) | None => {
                self.state = NodeState::Draining;
                self.close_downstream();
                self.state = NodeState::Terminated;
                false
            }
        }
    }

    /// Forwards `batch` downstream (or drops it, for a sink), emitting the
    /// per-schema events/bytes metric exactly once per successfully
    /// forwarded non-tick `events` batch (`spec.md` section 4.5). Computed
    /// before the send so a retried forward (`step`'s `pending` mechanism)
    /// never double-counts a batch that was already accepted.
    fn try_forward(&mut self, batch: AnyBatch) -> Result<(), AnyBatch> {
        let metric = if !batch.is_tick() && !self.ctrl.as_ref().is_some_and(ControlPlane::is_hidden) {
            match &batch {
                AnyBatch::Events(events) => {
                    Some((events.schema().fingerprint(), events.row_count() as u64, events.byte_size() as u64))
                }
                _ => None,
            }
        } else {
            None
        };

        let result = match &self.downstream {
            None => Ok(()), // sink: nothing further downstream
            Some(mailbox) => {
                if batch.is_tick() {
                    mailbox.send_tick(batch)
                } else {
                    crate::channel::try_send_batch(mailbox, batch).map_err(|e| match e {
                        flume::TrySendError::Full(b) => b,
                        flume::TrySendError::Disconnected(b) => b,
                    })
                }
            }
        };

        if result.is_ok() {
            if let (Some(ctrl), Some((schema, events, bytes))) = (self.ctrl.as_ref(), metric) {
                ctrl.metrics(schema).emit(schema, events, bytes);
            }
        }

        result
    }

    fn close_downstream(&mut self) {
        self.downstream = None;
    }

    /// Marks the node failed with a fatal error, surfaced to the executor
    /// via its `down` report.
    pub fn fail(&mut self, error: PipelineError) {
        self.failure = Some(error);
        self.state = NodeState::Failed;
        self.close_downstream();
    }

    pub fn failure(&self) -> Option<&PipelineError> {
        self.failure.as_ref()
    }

    /// Runs this node to completion on the calling thread. Used both for
    /// detached nodes (their dedicated OS thread) and, in tests, to drive
    /// a node synchronously without a scheduler.
    pub fn run_to_completion(&mut self) {
        while !self.state.is_terminal() {
            self.step();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::testing::Identity;

    #[test]
    fn idle_node_cannot_be_stepped() {
        let mut node = ExecutionNode::new(
            NodeIdentity {
                pipeline_id: SourceId(1),
                operator_index: 0,
                definition: "identity".into(),
            },
            Box::new(Identity::new()),
            None,
        );
        assert!(!node.step());
        assert_eq!(node.state(), NodeState::Idle);
    }

    #[test]
    fn stop_is_idempotent() {
        let mut node = ExecutionNode::new(
            NodeIdentity {
                pipeline_id: SourceId(1),
                operator_index: 0,
                definition: "identity".into(),
            },
            Box::new(Identity::new()),
            None,
        );
        node.stop();
        node.stop();
        assert!(node.cancel_token().load(Ordering::SeqCst));
    }
}
