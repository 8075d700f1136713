//! Scenario S3 (`spec.md` section 8): `source_const(rows=[{x:1},{x:2},{x:3}])
//! | identity | where(x > 1) | sink_collect` ends up with the filter
//! absorbed by the pushdown-capable source, and the sink still collects
//! exactly `[{x:2},{x:3}]`.

mod utils;

use std::sync::Arc;

use flowline::config::RuntimeConfig;
use flowline::element::ElementType;
use flowline::operator::testing::{Identity, SinkCollect, SourceConst, Where};
use flowline::pipeline::Pipeline;
use flowline::row::first_row_int64;

fn greater_than_one() -> Where {
    Where::new(
        "x > 1",
        Arc::new(|b: &flowline::element::EventsBatch| first_row_int64(b, "x").unwrap_or(0) > 1),
    )
}

#[test]
fn optimizer_absorbs_the_filter_into_the_source() {
    let pipeline = Pipeline::new(vec![
        Box::new(SourceConst::new(utils::rows_1_to_n(3))),
        Box::new(Identity::new()),
        Box::new(greater_than_one()),
        Box::new(SinkCollect::new()),
    ]);
    let optimized = pipeline.optimize();
    // The bare `where` operator no longer appears as a standalone step: it
    // either fused into the source's own pipeline fragment or was elided
    // in favor of the source re-checking the predicate itself.
    assert!(optimized
        .operators()
        .iter()
        .all(|op| op.name() != "where"));
    assert!(optimized
        .check_types(ElementType::Void, ElementType::Void)
        .is_ok());
}

#[test]
fn end_to_end_result_matches_the_unoptimized_pipeline() {
    let (executor, _diagnostics) = utils::test_executor(RuntimeConfig::default());
    let sink = SinkCollect::new();
    let collected = sink.collected();
    let pipeline = Pipeline::new(vec![
        Box::new(SourceConst::new(utils::rows_1_to_n(3))),
        Box::new(Identity::new()),
        Box::new(greater_than_one()),
        Box::new(sink),
    ]);
    let result = executor.run(pipeline, utils::next_pipeline_id(), "s3_filter_pushdown");
    assert!(result.is_ok());

    let collected = collected.lock();
    let values: Vec<_> = collected
        .iter()
        .map(|b| first_row_int64(b, "x").unwrap())
        .collect();
    assert_eq!(values, vec![2, 3]);
}
