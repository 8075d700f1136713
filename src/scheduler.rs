//! The cooperative/detached scheduler backing execution nodes (`spec.md`
//! section 5).
//!
//! Non-detached execution nodes share a small pool of cooperative worker
//! threads; each node is pinned to one worker for its lifetime and the
//! worker round-robins its assigned nodes, exactly as `spec.md` section 5
//! describes ("single-threaded per scheduler worker; multiple workers
//! allowed, each node pinned to one worker for its lifetime"). Detached
//! nodes (`spec.md` section 4.5) get a dedicated OS thread on top of the
//! pool and are allowed to block.
//!
//! This replaces the teacher's actor-system-backed scheduler (`spec.md`
//! section 9, "actor system with typed messaging") with the small
//! purpose-built task runtime the design notes call for: every execution
//! node is a task driven by `ExecutionNode::step`, grouped onto worker
//! threads instead of spawned as individually-scheduled actors.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use crate::config::RuntimeConfig;
use crate::error::PipelineError;
use crate::node::{ExecutionNode, NodeIdentity};

/// How long a cooperative worker sleeps after a round where none of its
/// nodes made progress, to avoid busy-spinning while every node is
/// waiting on downstream capacity or external I/O.
const IDLE_BACKOFF: Duration = Duration::from_micros(200);

/// Reported once per node, when it reaches a terminal state.
pub struct NodeOutcome {
    pub identity: NodeIdentity,
    pub failure: Option<PipelineError>,
}

/// Spawns every node either onto its own OS thread (`detached`) or onto
/// one of `config.worker_threads` cooperative worker threads (round-robin
/// assignment), then returns immediately with a receiver the caller polls
/// for each node's terminal outcome, plus the join handles so the caller
/// can wait for clean shutdown.
pub struct Scheduler {
    config: RuntimeConfig,
}

impl Scheduler {
    pub fn new(config: RuntimeConfig) -> Self {
        Self { config }
    }

    pub fn spawn(&self, nodes: Vec<ExecutionNode>) -> (mpsc::Receiver<NodeOutcome>, Vec<thread::JoinHandle<()>>) {
        let (tx, rx) = mpsc::channel();
        let mut detached = Vec::new();
        let mut cooperative = Vec::new();
        for node in nodes {
            if node.is_detached() {
                detached.push(node);
            } else {
                cooperative.push(node);
            }
        }

        let mut handles = Vec::new();

        for node in detached {
            let tx = tx.clone();
            handles.push(thread::spawn(move || run_detached(node, tx)));
        }

        let worker_count = self.config.worker_threads.get().max(1);
        let mut buckets: Vec<Vec<ExecutionNode>> = (0..worker_count).map(|_| Vec::new()).collect();
        for (i, node) in cooperative.into_iter().enumerate() {
            buckets[i % worker_count].push(node);
        }
        for bucket in buckets {
            if bucket.is_empty() {
                continue;
            }
            let tx = tx.clone();
            handles.push(thread::spawn(move || run_cooperative(bucket, tx)));
        }

        (rx, handles)
    }
}

fn run_detached(mut node: ExecutionNode, tx: mpsc::Sender<NodeOutcome>) {
    node.run_to_completion();
    let _ = tx.send(NodeOutcome {
        identity: node.identity().clone(),
        failure: node.failure().cloned(),
    });
}

fn run_cooperative(mut nodes: Vec<ExecutionNode>, tx: mpsc::Sender<NodeOutcome>) {
    let mut reported = vec![false; nodes.len()];
    let mut remaining = nodes.len();
    while remaining > 0 {
        let mut progressed = false;
        for (i, node) in nodes.iter_mut().enumerate() {
            if reported[i] {
                continue;
            }
            if node.state().is_terminal() {
                reported[i] = true;
                remaining -= 1;
                let _ = tx.send(NodeOutcome {
                    identity: node.identity().clone(),
                    failure: node.failure().cloned(),
                });
                continue;
            }
            if node.step() {
                progressed = true;
            }
        }
        if !progressed && remaining > 0 {
            thread::sleep(IDLE_BACKOFF);
        }
    }
    drop(nodes);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostic::SourceId;
    use crate::operator::testing::{Identity, SinkCollect, SourceConst};
    use std::num::NonZeroUsize;

    #[test]
    fn cooperative_nodes_all_report_terminal_outcomes() {
        let scheduler = Scheduler::new(RuntimeConfig {
            worker_threads: NonZeroUsize::new(2).unwrap(),
            ..RuntimeConfig::default()
        });

        let mut source = ExecutionNode::new(
            NodeIdentity {
                pipeline_id: SourceId(1),
                operator_index: 0,
                definition: "source_const".into(),
            },
            Box::new(SourceConst::new(vec![])),
            None,
        );
        let ctrl = crate::test_support::noop_control_plane();
        source.start(None, ctrl, std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false)));

        let (rx, handles) = scheduler.spawn(vec![source]);
        let outcome = rx.recv().unwrap();
        assert!(outcome.failure.is_none());
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    #[allow(unused)]
    fn names_are_unused_directly_but_exercised_via_executor() {
        let _ = Identity::new();
        let _ = SinkCollect::new();
    }
}
