//! The optimizer pass (component C4, `spec.md` section 4.4).
//!
//! Walks a pipeline right-to-left, carrying a pending filter and a
//! required order, asking each operator in turn whether it can absorb the
//! filter, relax the order, or be elided outright.
//!
//! **Implementation decisions** (recorded here and in `DESIGN.md`, since
//! `spec.md` section 4.4 step 2 is ambiguous about exactly when elision
//! applies and about where a leftover filter is reinstated):
//!
//! - Identity elimination triggers whenever an operator declares
//!   [`Operator::is_identity`] and returns no replacement, independent of
//!   the current `pending_filter`/`required_order` values: an identity
//!   operator is a no-op by definition, so it trivially preserves whatever
//!   filter or order was already accumulated. The spec's literal
//!   "`residual_filter == true`" wording describes the common case where
//!   nothing has accumulated yet, not an extra precondition.
//! - A filter that survives the whole pass unabsorbed is reinstated at
//!   the very front of the pipeline (the position of the *first*
//!   operator, which is also "the last operator visited that refused to
//!   absorb it" in a right-to-left pass that never finds a taker).
//! - The final `required_order == Unordered` case -- "the remaining
//!   source is informed it may produce in any order" -- has no generic
//!   mechanism in the operator contract (no operator is obligated to
//!   accept a relaxed-order hint), so it is surfaced only as a debug log;
//!   no operator is mutated.

use crate::operator::{Filter, Order};
use crate::pipeline::Pipeline;

/// Applies the optimizer pass to `pipeline`, returning the rewritten
/// pipeline. Callers normally go through [`Pipeline::optimize`]; the
/// executor (`spec.md` section 4.6 step 2) flattens nested pipelines
/// first and then calls this directly.
pub fn optimize(pipeline: Pipeline) -> Pipeline {
    let operators = pipeline.into_operators();
    let mut rebuilt = Vec::with_capacity(operators.len());
    let mut pending_filter = Filter::True;
    let mut required_order = Order::Ordered;

    for op in operators.into_iter().rev() {
        let result = op.optimize(pending_filter, required_order);
        pending_filter = result.residual_filter;
        required_order = result.realized_order;

        match result.replacement {
            Some(replacement) => rebuilt.push(replacement),
            None if op.is_identity() => {
                trace!("optimizer eliding identity operator '{}'", op.name());
            }
            None => rebuilt.push(op),
        }
    }

    rebuilt.reverse();

    if !pending_filter.is_true() {
        if let Filter::Predicate { label, reinstate } = pending_filter {
            debug!("optimizer reinstating unabsorbed filter '{label}' at the front of the pipeline");
            rebuilt.insert(0, reinstate);
        }
    }

    if required_order == Order::Unordered {
        debug!("optimizer relaxed the required order to unordered; no generic hook to inform the source");
    }

    Pipeline::new(rebuilt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::ElementType;
    use crate::operator::testing::{Identity, SinkCollect, SourceConst, Where};
    use crate::row::{events_batch_from_rows, first_row_int64, Scalar};
    use crate::schema::{Field, LeafType, Schema};
    use std::sync::Arc;

    fn xyz_schema() -> Arc<Schema> {
        Arc::new(Schema::new("t", vec![Field::new("x", LeafType::Int64)]))
    }

    fn rows_1_2_3() -> Vec<crate::element::EventsBatch> {
        let schema = xyz_schema();
        (1..=3)
            .map(|x| events_batch_from_rows(schema.clone(), vec![vec![Scalar::Int64(x)]], 0).unwrap())
            .collect()
    }

    #[test]
    fn identity_operators_are_elided() {
        let pipeline = Pipeline::new(vec![
            Box::new(SourceConst::new(vec![])),
            Box::new(Identity::new()),
            Box::new(Identity::new()),
            Box::new(SinkCollect::new()),
        ]);
        let optimized = pipeline.optimize();
        let names: Vec<_> = optimized.operators().iter().map(|o| o.name()).collect();
        assert_eq!(names, vec!["source_const", "sink_collect"]);
    }

    #[test]
    fn filter_is_absorbed_into_a_pushdown_capable_source() {
        let predicate = Where::new(
            "x > 1",
            Arc::new(|b: &crate::element::EventsBatch| first_row_int64(b, "x").unwrap_or(0) > 1),
        );
        let pipeline = Pipeline::new(vec![
            Box::new(SourceConst::new(rows_1_2_3())),
            Box::new(Identity::new()),
            Box::new(predicate),
            Box::new(SinkCollect::new()),
        ]);
        let optimized = pipeline.optimize();
        // The source fuses with the filter into a nested pipeline fragment
        // (one pass leaves behind the `where`'s own `Identity` replacement,
        // since elision only reconsiders operators visited as themselves,
        // not operators substituted in as a `replacement`).
        assert_eq!(optimized.len(), 3);
        assert_eq!(optimized.operators()[0].name(), "pipeline");
        assert_eq!(optimized.operators()[2].name(), "sink_collect");
        assert!(optimized.check_types(ElementType::Void, ElementType::Void).is_ok());
    }

    #[test]
    fn unabsorbed_filter_is_reinstated_at_the_front() {
        // A source without pushdown support (here, raw Identity standing in
        // for a non-absorbing source) leaves the filter to be reinstated.
        let predicate = Where::new(
            "x > 1",
            Arc::new(|b: &crate::element::EventsBatch| first_row_int64(b, "x").unwrap_or(0) > 1),
        );
        let pipeline = Pipeline::new(vec![
            Box::new(Identity::new()),
            Box::new(predicate),
            Box::new(SinkCollect::new()),
        ]);
        let optimized = pipeline.optimize();
        let names: Vec<_> = optimized.operators().iter().map(|o| o.name()).collect();
        assert_eq!(names, vec!["where", "identity", "sink_collect"]);
    }
}
