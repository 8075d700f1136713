//! Shared test fixtures used across this crate's unit tests and by
//! `tests/` integration tests.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::control::{ControlPlane, NodeDirectory, NodeHandle};
use crate::diagnostic::{ChannelDiagnosticHandler, SourceId, Span};
use crate::metrics::{CollectingMetricReceiver, MetricSink};

/// A [`ControlPlane`] wired to fresh, empty collaborators: a channel-backed
/// diagnostic handler nobody drains, an empty node directory, and metrics
/// that accumulate into a [`CollectingMetricReceiver`] the caller never
/// inspects. Good enough for any test that needs *a* control plane but
/// doesn't care what it reports.
pub fn noop_control_plane() -> ControlPlane {
    let diagnostics = Arc::new(ChannelDiagnosticHandler::new());
    let shared = diagnostics.shared_handle();
    let metrics = Arc::new(MetricSink::new(
        SourceId(0),
        0,
        Arc::new(CollectingMetricReceiver::default()),
    ));
    ControlPlane::new(
        diagnostics,
        shared,
        metrics,
        Arc::new(NodeDirectory::default()),
        NodeHandle {
            pipeline_id: SourceId(0),
            operator_index: 0,
        },
        Arc::new(AtomicBool::new(false)),
        Arc::new(AtomicBool::new(false)),
        false,
        "test".into(),
        Span::unknown(),
        false,
        "test_operator".into(),
    )
}
