//! Location wrappers (`spec.md` section 4.3).
//!
//! A location wrapper augments a pipeline fragment so every inner operator
//! inherits an explicit location -- used when a user forces "run this
//! fragment locally/remotely". It is transparent to optimization: it
//! forwards every call to the wrapped operator and re-wraps any produced
//! replacement, so the optimizer never needs to know wrappers exist.

use crate::control::ControlPlane;
use crate::element::{AnyBatch, ElementType};
use crate::error::PipelineError;
use crate::operator::{BatchSeq, BoxedOperator, Filter, Location, Operator, OptimizeResult, Order};

/// Wraps `inner`, pinning its effective [`Location`] to `pin` per Open
/// Question 4 (`DESIGN.md`): the pin applies transitively unless `inner`
/// itself declares a hard requirement.
#[derive(Debug, Clone)]
pub struct LocationWrapper {
    inner: BoxedOperator,
    pin: Location,
}

impl LocationWrapper {
    pub fn new(inner: BoxedOperator, pin: Location) -> Self {
        Self { inner, pin }
    }
}

impl Operator for LocationWrapper {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn location(&self) -> Location {
        self.inner.location().resolve_under_wrapper(self.pin)
    }

    fn detached(&self) -> bool {
        self.inner.detached()
    }

    fn internal(&self) -> bool {
        self.inner.internal()
    }

    fn infer_type(&self, input: ElementType) -> Result<ElementType, PipelineError> {
        self.inner.infer_type(input)
    }

    fn optimize(&self, pending_filter: Filter, required_order: Order) -> OptimizeResult {
        let inner_result = self.inner.optimize(pending_filter, required_order);
        let pin = self.pin;
        OptimizeResult {
            replacement: inner_result
                .replacement
                .map(|op| Box::new(LocationWrapper::new(op, pin)) as BoxedOperator),
            residual_filter: inner_result.residual_filter,
            realized_order: inner_result.realized_order,
        }
    }

    fn instantiate(&self, input: BatchSeq<AnyBatch>, ctrl: ControlPlane) -> BatchSeq<AnyBatch> {
        self.inner.instantiate(input, ctrl)
    }
}
