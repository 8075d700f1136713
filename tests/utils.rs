#![allow(dead_code)] // not every scenario test uses every helper

use std::sync::Arc;

use flowline::config::RuntimeConfig;
use flowline::control::NodeDirectory;
use flowline::diagnostic::{ChannelDiagnosticHandler, SourceId};
use flowline::executor::Executor;
use flowline::metrics::CollectingMetricReceiver;
use flowline::row::Scalar;
use flowline::schema::{Field, LeafType, Schema};

/// The next pipeline id to hand a fresh executor run, so scenario tests run
/// in the same process without colliding on diagnostics/metrics labels.
static NEXT_PIPELINE_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

pub fn next_pipeline_id() -> SourceId {
    SourceId(NEXT_PIPELINE_ID.fetch_add(1, std::sync::atomic::Ordering::SeqCst))
}

/// Builds an [`Executor`] wired to fresh, inspectable collaborators: a
/// channel-backed diagnostic handler the test can drain, and a metric
/// receiver that just accumulates records.
pub fn test_executor(config: RuntimeConfig) -> (Executor, Arc<ChannelDiagnosticHandler>) {
    let diagnostics = Arc::new(ChannelDiagnosticHandler::new());
    let executor = Executor::new(
        config,
        diagnostics.clone(),
        Arc::new(CollectingMetricReceiver::default()),
        Arc::new(NodeDirectory::default()),
    );
    (executor, diagnostics)
}

/// A single-field `{x: int64}` schema, used across scenario tests.
pub fn xyz_schema() -> Arc<Schema> {
    Arc::new(Schema::new("t", vec![Field::new("x", LeafType::Int64)]))
}

/// Builds `count` single-row `{x: int64}` batches with `x` taking values
/// `1..=count`.
pub fn rows_1_to_n(count: i64) -> Vec<flowline::element::EventsBatch> {
    let schema = xyz_schema();
    (1..=count)
        .map(|x| {
            flowline::row::events_batch_from_rows(schema.clone(), vec![vec![Scalar::Int64(x)]], 0)
                .expect("a single-row batch always satisfies the column/row-count invariant")
        })
        .collect()
}
