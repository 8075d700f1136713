//! The pipeline (component C3, `spec.md` section 4.3).
//!
//! An ordered sequence of operators. Verifies adjacent-type compatibility,
//! supports `prepend`/`append`/`unwrap`, and delegates optimization to its
//! operators via the pass implemented in [`crate::optimizer`].

use crate::control::ControlPlane;
use crate::diagnostic::Span;
use crate::element::{AnyBatch, ElementType};
use crate::error::PipelineError;
use crate::operator::{BatchSeq, BoxedOperator, Filter, Location, Operator, OptimizeResult, Order};

/// An ordered sequence of operators (`spec.md` section 3/4.3).
///
/// Cloning a pipeline clones every operator it contains (`dyn_clone`),
/// matching the ownership rule that operators are exclusively owned by the
/// pipeline containing them (`spec.md` section 3).
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    operators: Vec<BoxedOperator>,
}

impl Pipeline {
    pub fn new(operators: Vec<BoxedOperator>) -> Self {
        Self { operators }
    }

    pub fn empty() -> Self {
        Self { operators: Vec::new() }
    }

    pub fn operators(&self) -> &[BoxedOperator] {
        &self.operators
    }

    pub fn into_operators(self) -> Vec<BoxedOperator> {
        self.operators
    }

    pub fn len(&self) -> usize {
        self.operators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }

    pub fn prepend(&mut self, operator: BoxedOperator) {
        self.operators.insert(0, operator);
    }

    pub fn append(&mut self, operator: BoxedOperator) {
        self.operators.push(operator);
    }

    /// Returns the pipeline's single operator directly. `SPEC_FULL.md`
    /// section 4.3 supplement: a pipeline of zero or more than one
    /// operator is a programming error at this call site -- the optimizer
    /// only calls `unwrap` once it has fused a fragment down to exactly
    /// one operator.
    pub fn unwrap(self) -> BoxedOperator {
        let mut operators = self.operators;
        if operators.len() != 1 {
            panic!(
                "internal invariant violated: Pipeline::unwrap called on a pipeline with {} operators, expected exactly 1",
                operators.len()
            );
        }
        operators.pop().unwrap()
    }

    /// Replaces every nested-pipeline operator by its own (recursively
    /// flattened) contents (`spec.md` section 4.3).
    pub fn flatten(self) -> Pipeline {
        let mut flat = Vec::with_capacity(self.operators.len());
        for op in self.operators {
            match op.as_pipeline() {
                Some(nested) => {
                    let nested = nested.clone().flatten();
                    flat.extend(nested.into_operators());
                }
                None => flat.push(op),
            }
        }
        Pipeline { operators: flat }
    }

    /// Walks the chain left-to-right calling `infer_type`, verifying it
    /// reduces to `input -> output`. On mismatch, names the first
    /// offending operator: either the one whose `infer_type` rejected its
    /// input, or -- if every call succeeded but the final type disagrees
    /// with `output` -- the last operator in the chain.
    pub fn check_types(&self, input: ElementType, output: ElementType) -> Result<(), PipelineError> {
        let mut current = input;
        let mut last_name = "<source>".to_string();
        for op in &self.operators {
            current = op.infer_type(current)?;
            last_name = op.name().to_string();
        }
        if current != output {
            return Err(PipelineError::TypeMismatch {
                operator: last_name,
                expected: output.to_string(),
                found: current.to_string(),
                span: Span::unknown(),
            });
        }
        Ok(())
    }

    /// Applies the optimizer pass (`spec.md` section 4.4) to this
    /// pipeline, returning the rewritten pipeline.
    pub fn optimize(self) -> Pipeline {
        crate::optimizer::optimize(self)
    }

    /// A stable, serializable representation of this pipeline (`spec.md`
    /// section 6): round-trips each operator's identity (its index and
    /// name) plus its [`Operator::inspect`] output. Used for pipeline
    /// snapshots in logs/diagnostics, not for reconstructing a runnable
    /// pipeline -- an operator's `instantiate` closures aren't themselves
    /// serializable.
    pub fn to_stable_repr(&self) -> serde_json::Value {
        serde_json::Value::Array(
            self.operators
                .iter()
                .enumerate()
                .map(|(index, op)| {
                    serde_json::json!({
                        "index": index,
                        "name": op.name(),
                        "location": format!("{:?}", op.location()),
                        "detached": op.detached(),
                        "internal": op.internal(),
                        "inspect": op.inspect(),
                    })
                })
                .collect(),
        )
    }
}

impl IntoIterator for Pipeline {
    type Item = BoxedOperator;
    type IntoIter = std::vec::IntoIter<BoxedOperator>;

    fn into_iter(self) -> Self::IntoIter {
        self.operators.into_iter()
    }
}

impl FromIterator<BoxedOperator> for Pipeline {
    fn from_iter<T: IntoIterator<Item = BoxedOperator>>(iter: T) -> Self {
        Pipeline {
            operators: iter.into_iter().collect(),
        }
    }
}

/// A pipeline is itself an operator (`spec.md` section 4.3, nested
/// pipelines), so a fragment can be embedded inside a larger pipeline and
/// later flattened away by [`Pipeline::flatten`].
impl Operator for Pipeline {
    fn name(&self) -> &str {
        "pipeline"
    }

    fn location(&self) -> Location {
        // A nested pipeline's location is only meaningful once flattened;
        // until then it imposes no constraint of its own.
        Location::Anywhere
    }

    fn infer_type(&self, input: ElementType) -> Result<ElementType, PipelineError> {
        let mut current = input;
        for op in &self.operators {
            current = op.infer_type(current)?;
        }
        Ok(current)
    }

    fn optimize(&self, pending_filter: Filter, required_order: Order) -> OptimizeResult {
        // Nested pipelines are flattened before the optimizer pass ever
        // walks them (`spec.md` section 4.6 step 2); a direct call here
        // (e.g. from a test that optimizes a fragment standalone) is a
        // no-op forward to flattening plus a fresh pass.
        let flattened = self.clone().flatten().optimize();
        OptimizeResult {
            replacement: Some(Box::new(flattened)),
            residual_filter: pending_filter,
            realized_order: required_order,
        }
    }

    fn instantiate(&self, input: BatchSeq<AnyBatch>, ctrl: ControlPlane) -> BatchSeq<AnyBatch> {
        // Only reachable if a caller instantiates a nested pipeline
        // directly without flattening first; chain every operator's
        // `instantiate` using the same control plane. Production runs
        // always go through the executor, which flattens first.
        let mut seq = input;
        for op in &self.operators {
            seq = op.instantiate(seq, ctrl.clone());
        }
        seq
    }

    fn as_pipeline(&self) -> Option<&Pipeline> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::testing::{Identity, SinkCollect, SourceConst};

    #[test]
    fn check_types_accepts_matching_chain() {
        let pipeline = Pipeline::new(vec![
            Box::new(SourceConst::new(vec![])),
            Box::new(SinkCollect::new()),
        ]);
        assert!(pipeline
            .check_types(ElementType::Void, ElementType::Void)
            .is_ok());
    }

    #[test]
    fn check_types_rejects_mismatched_chain() {
        let pipeline = Pipeline::new(vec![Box::new(SourceConst::new(vec![]))]);
        let err = pipeline
            .check_types(ElementType::Void, ElementType::Void)
            .unwrap_err();
        assert!(matches!(err, PipelineError::TypeMismatch { .. }));
    }

    #[test]
    fn flatten_inlines_nested_pipeline() {
        let inner = Pipeline::new(vec![Box::new(Identity::new()), Box::new(Identity::new())]);
        let outer = Pipeline::new(vec![Box::new(inner), Box::new(Identity::new())]);
        let flat = outer.flatten();
        assert_eq!(flat.len(), 3);
    }

    #[test]
    fn prepend_and_append_order_operators() {
        let mut pipeline = Pipeline::new(vec![Box::new(Identity::new())]);
        pipeline.prepend(Box::new(SourceConst::new(vec![])));
        pipeline.append(Box::new(SinkCollect::new()));
        assert_eq!(pipeline.operators()[0].name(), "source_const");
        assert_eq!(pipeline.operators()[2].name(), "sink_collect");
    }

    #[test]
    #[should_panic(expected = "internal invariant")]
    fn unwrap_panics_on_non_singleton_pipeline() {
        let pipeline = Pipeline::new(vec![Box::new(Identity::new()), Box::new(Identity::new())]);
        let _ = pipeline.unwrap();
    }

    #[test]
    fn stable_repr_round_trips_operator_identity() {
        let pipeline = Pipeline::new(vec![
            Box::new(SourceConst::new(vec![])),
            Box::new(SinkCollect::new()),
        ]);
        let repr = pipeline.to_stable_repr();
        let entries = repr.as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["index"], 0);
        assert_eq!(entries[0]["name"], "source_const");
        assert_eq!(entries[1]["name"], "sink_collect");

        // The representation must be stable byte-for-byte across rebuilds
        // of an equivalent pipeline (testable property 9's schema analog
        // applied to pipeline identity).
        let pipeline2 = Pipeline::new(vec![
            Box::new(SourceConst::new(vec![])),
            Box::new(SinkCollect::new()),
        ]);
        assert_eq!(
            serde_json::to_string(&repr).unwrap(),
            serde_json::to_string(&pipeline2.to_stable_repr()).unwrap()
        );
    }
}
