//! Scenario S7 (`SPEC_FULL.md` section 8): an operator that sets
//! `ctrl.set_waiting(true)` and yields a tick, then clears it on a later
//! external wake, must not be polled again by its execution node between
//! the two yields.

mod utils;

use std::time::Duration;

use flowline::config::RuntimeConfig;
use flowline::operator::testing::{SinkCollect, WaitThenEmit};
use flowline::pipeline::Pipeline;
use flowline::row::first_row_int64;

#[test]
fn the_node_does_not_poll_a_waiting_operator_until_it_is_woken() {
    let (executor, _diagnostics) = utils::test_executor(RuntimeConfig::default());
    let batches = utils::rows_1_to_n(2);
    let source = WaitThenEmit::new(batches, Duration::from_millis(20));
    let poll_count = source.poll_count();
    let sink = SinkCollect::new();
    let collected = sink.collected();

    let pipeline = Pipeline::new(vec![Box::new(source), Box::new(sink)]);
    let result = executor.run(pipeline, utils::next_pipeline_id(), "s7_waiting_suspension");
    assert!(result.is_ok());

    let collected = collected.lock();
    let values: Vec<_> = collected
        .iter()
        .map(|b| first_row_int64(b, "x").unwrap())
        .collect();
    assert_eq!(values, vec![1, 2]);

    // One poll to learn it should wait, one per batch, one to observe
    // `Done` -- and nothing in between while the flag was still set.
    assert_eq!(poll_count.load(std::sync::atomic::Ordering::SeqCst), 4);
}
