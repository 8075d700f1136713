//! Scenario S8 (`spec.md` section 8): calling `stop` twice on a running
//! pipeline is idempotent -- the second call observes the cancellation
//! already in flight and does nothing further, and the run still
//! completes (successfully or with `Cancelled`, never a panic or hang).

mod utils;

use std::time::Duration;

use flowline::config::RuntimeConfig;
use flowline::operator::testing::{OpSlow, SinkCollect, SourceFast};
use flowline::pipeline::Pipeline;

#[test]
fn stopping_a_spawned_pipeline_twice_is_idempotent() {
    let (executor, _diagnostics) = utils::test_executor(RuntimeConfig::default());
    let schema = utils::xyz_schema();
    let pipeline = Pipeline::new(vec![
        Box::new(SourceFast::new(schema, 1_000_000)),
        Box::new(OpSlow::new(Duration::from_millis(5))),
        Box::new(SinkCollect::new()),
    ]);
    let running = executor
        .spawn(pipeline, utils::next_pipeline_id(), "s8_idempotent_stop")
        .unwrap();
    running.stop();
    running.stop();
    assert!(running.join().is_ok());
}
