//! The control plane (component C7, `spec.md` section 4.7).
//!
//! A per-execution-node facade, borrowed (non-owning) by the operator's
//! running instance, exposing diagnostics, metrics, node-directory lookup,
//! self-identification and suspension/cancellation control.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::diagnostic::{Diagnostic, DiagnosticHandler, SharedDiagnosticHandle, Span, SourceId};
use crate::metrics::{MetricEmitter, MetricReceiver, MetricSink};
use crate::schema::SchemaFingerprint;

/// The executor's per-run lookup from a symbolic component name (storage,
/// catalog, importer, ...) to a typed handle. The core treats every entry
/// opaquely (`Any`) and only forwards it through the control plane
/// (`spec.md` section 6); it never inspects the concrete type itself.
///
/// Read-mostly; updates are serialized by the executor's worker (`spec.md`
/// section 5), which is naturally satisfied here since only the executor
/// holds a mutable reference while building the directory, before any node
/// starts. Backed by an [`IndexMap`] rather than a hash map so `names()`
/// reports components in registration order -- `SPEC_FULL.md` section 2
/// calls for deterministic iteration here, for stable metric labels and
/// logs across runs.
#[derive(Default)]
pub struct NodeDirectory {
    components: RwLock<IndexMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl NodeDirectory {
    pub fn register(&self, name: impl Into<String>, handle: Arc<dyn Any + Send + Sync>) {
        self.components.write().insert(name.into(), handle);
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.components.read().get(name).cloned()
    }

    /// Registered component names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.components.read().keys().cloned().collect()
    }
}

/// A handle identifying the current execution node, used to address
/// replies from components looked up through the node directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeHandle {
    pub pipeline_id: SourceId,
    pub operator_index: usize,
}

/// Per-execution-node facade passed to an operator's `instantiate`
/// (`spec.md` section 4.2/4.7).
///
/// `Clone` is used only by composite operators that embed several other
/// operators under one execution node (a nested pipeline instantiated
/// directly, without flattening) and need to hand each inner operator its
/// own handle to the same underlying diagnostics/metrics/waiting state.
#[derive(Clone)]
pub struct ControlPlane {
    diagnostics: Arc<dyn DiagnosticHandler>,
    shared_diagnostics: SharedDiagnosticHandle,
    metrics: Arc<MetricSink>,
    directory: Arc<NodeDirectory>,
    self_handle: NodeHandle,
    waiting: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
    allow_unsafe_pipelines: bool,
    definition: String,
    span: Span,
    is_hidden: bool,
    operator_name: String,
}

impl ControlPlane {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        diagnostics: Arc<dyn DiagnosticHandler>,
        shared_diagnostics: SharedDiagnosticHandle,
        metrics: Arc<MetricSink>,
        directory: Arc<NodeDirectory>,
        self_handle: NodeHandle,
        cancelled: Arc<AtomicBool>,
        waiting: Arc<AtomicBool>,
        allow_unsafe_pipelines: bool,
        definition: String,
        span: Span,
        is_hidden: bool,
        operator_name: String,
    ) -> Self {
        Self {
            diagnostics,
            shared_diagnostics,
            metrics,
            directory,
            self_handle,
            waiting,
            cancelled,
            allow_unsafe_pipelines,
            definition,
            span,
            is_hidden,
            operator_name,
        }
    }

    /// Emits a diagnostic; the span and operator of the current operator
    /// invocation are attached automatically if the diagnostic doesn't
    /// already carry them -- this is what lets `RunningPipeline::join`
    /// (`spec.md` section 7) recover the true origin of a fatal diagnostic
    /// even when a different node later self-reports the failure.
    pub fn emit(&self, mut diagnostic: Diagnostic) {
        if diagnostic.span == Span::unknown() {
            diagnostic.span = self.span;
        }
        if diagnostic.operator.is_none() {
            diagnostic.operator = Some(self.operator_name.clone());
        }
        self.diagnostics.emit(diagnostic);
    }

    pub fn has_seen_error(&self) -> bool {
        self.diagnostics.has_seen_error()
    }

    /// A clonable handle to the diagnostic sink, for background tasks the
    /// operator spawns itself.
    pub fn shared_diagnostics(&self) -> SharedDiagnosticHandle {
        self.shared_diagnostics.clone()
    }

    /// Obtains a metric emitter bound to `schema`; emitted records are
    /// typed to that schema only.
    pub fn metrics(&self, schema: SchemaFingerprint) -> Arc<MetricEmitter> {
        self.metrics.for_schema(schema)
    }

    /// A handle to the local node directory, for cross-component lookups.
    pub fn node(&self) -> &NodeDirectory {
        &self.directory
    }

    /// A handle to the current execution node.
    pub fn self_handle(&self) -> NodeHandle {
        self.self_handle
    }

    /// Advertises that the operator is blocked/unblocked on external I/O.
    /// Calling `set_waiting(true)` without a later call that clears it is
    /// a deadlock (`spec.md` section 4.7) -- the operator's responsibility
    /// to arrange, not the control plane's.
    pub fn set_waiting(&self, waiting: bool) {
        self.waiting.store(waiting, Ordering::SeqCst);
    }

    pub fn is_waiting(&self) -> bool {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Whether the deployment permits explicit location overrides.
    pub fn allow_unsafe_pipelines(&self) -> bool {
        self.allow_unsafe_pipelines
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// The pipeline's defining text for this operator's invocation, used
    /// by metric labels and log context.
    pub fn definition(&self) -> &str {
        &self.definition
    }

    pub fn pipeline_id(&self) -> SourceId {
        self.self_handle.pipeline_id
    }

    pub fn operator_index(&self) -> usize {
        self.self_handle.operator_index
    }

    pub fn is_hidden(&self) -> bool {
        self.is_hidden
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostic::{ChannelDiagnosticHandler, Severity};
    use crate::metrics::CollectingMetricReceiver;

    fn make_control_plane() -> (ControlPlane, Arc<ChannelDiagnosticHandler>) {
        let diagnostics = Arc::new(ChannelDiagnosticHandler::new());
        let shared = diagnostics.shared_handle();
        let metrics = Arc::new(MetricSink::new(
            SourceId(1),
            0,
            Arc::new(CollectingMetricReceiver::default()),
        ));
        let ctrl = ControlPlane::new(
            diagnostics.clone(),
            shared,
            metrics,
            Arc::new(NodeDirectory::default()),
            NodeHandle {
                pipeline_id: SourceId(1),
                operator_index: 0,
            },
            Arc::new(AtomicBool::new(false)),
            Arc::new(AtomicBool::new(false)),
            false,
            "map(...)".into(),
            Span::unknown(),
            false,
            "map".into(),
        );
        (ctrl, diagnostics)
    }

    #[test]
    fn emit_attaches_operator_span_when_missing() {
        let (ctrl, diagnostics) = make_control_plane();
        let span = Span {
            source: SourceId(1),
            start: 10,
            end: 20,
        };
        let ctrl = ControlPlane { span, ..ctrl };
        ctrl.emit(Diagnostic::new(Severity::Warning, "oops", Span::unknown()));
        let drained = diagnostics.drain();
        assert_eq!(drained[0].span, span);
    }

    #[test]
    fn set_waiting_round_trips() {
        let (ctrl, _) = make_control_plane();
        assert!(!ctrl.is_waiting());
        ctrl.set_waiting(true);
        assert!(ctrl.is_waiting());
        ctrl.set_waiting(false);
        assert!(!ctrl.is_waiting());
    }

    #[test]
    fn node_directory_lookup() {
        let dir = NodeDirectory::default();
        dir.register("storage", Arc::new(42i32));
        let looked_up = dir.lookup("storage").unwrap();
        assert_eq!(*looked_up.downcast_ref::<i32>().unwrap(), 42);
        assert!(dir.lookup("missing").is_none());
    }

    #[test]
    fn node_directory_names_preserve_registration_order() {
        let dir = NodeDirectory::default();
        dir.register("catalog", Arc::new(1i32));
        dir.register("storage", Arc::new(2i32));
        dir.register("importer", Arc::new(3i32));
        assert_eq!(dir.names(), vec!["catalog", "storage", "importer"]);
    }
}
