//! Scenario S4 (`spec.md` section 8): `source_bytes | sink_events` is
//! rejected with a `type-mismatch` diagnostic naming `sink_events`; no node
//! is ever spawned.

mod utils;

use flowline::config::RuntimeConfig;
use flowline::error::PipelineError;
use flowline::operator::testing::{SinkEvents, SourceBytes};
use flowline::pipeline::Pipeline;

#[test]
fn bytes_source_into_events_sink_is_rejected_before_spawning() {
    let (executor, _diagnostics) = utils::test_executor(RuntimeConfig::default());
    let pipeline = Pipeline::new(vec![
        Box::new(SourceBytes::new(vec![])),
        Box::new(SinkEvents::new()),
    ]);
    let result = executor.run(pipeline, utils::next_pipeline_id(), "s4_type_mismatch");
    match result {
        Err(PipelineError::TypeMismatch { operator, .. }) => {
            assert_eq!(operator, "sink_events");
        }
        other => panic!("expected a type-mismatch error, got {other:?}"),
    }
}
