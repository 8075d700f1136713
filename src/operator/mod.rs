//! The operator contract (component C2, `spec.md` section 4.2).

pub mod location;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

use dyn_clone::DynClone;

use crate::control::ControlPlane;
use crate::element::ElementType;
use crate::error::PipelineError;

/// Where an operator is allowed or required to run.
///
/// Defaults to [`Anywhere`](Location::Anywhere). A location wrapper
/// (`spec.md` section 4.3) can pin every operator inside a pipeline
/// fragment to [`Local`](Location::Local) or [`Remote`](Location::Remote);
/// per Open Question 4 (see `DESIGN.md`), that pin applies transitively to
/// every operator not itself pinned to [`MustBeLocal`](Location::MustBeLocal)
/// or [`MustBeRemote`](Location::MustBeRemote).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Location {
    #[default]
    Anywhere,
    MustBeLocal,
    MustBeRemote,
}

impl Location {
    /// Reconciles a wrapper's requested location with this operator's own
    /// declared location. A hard requirement (`MustBeLocal`/`MustBeRemote`)
    /// always wins over the wrapper.
    pub fn resolve_under_wrapper(self, wrapper: Location) -> Location {
        match self {
            Location::Anywhere => wrapper,
            hard => hard,
        }
    }

    pub fn is_local(self) -> bool {
        matches!(self, Location::Anywhere | Location::MustBeLocal)
    }

    pub fn is_remote(self) -> bool {
        matches!(self, Location::Anywhere | Location::MustBeRemote)
    }
}

/// A required event order, carried by the optimizer pass (`spec.md`
/// section 4.4) and reported back by `optimize` as `realized_order`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Ordered,
    Unordered,
}

/// A boolean predicate over output events, used by the optimizer's filter
/// push-down (`spec.md` section 4.4). The core treats this opaquely: it
/// only needs to combine predicates (`and`), test for the trivial `true`
/// predicate, and -- if nothing upstream absorbs it -- reinstate it as a
/// concrete operator; it never evaluates a predicate against a batch
/// itself. `reinstate` carries the operator that originally produced the
/// filter (e.g. a `where` operator) so the optimizer can splice it back
/// into the pipeline structurally, without knowing anything about how it
/// evaluates rows.
#[derive(Debug, Clone)]
pub enum Filter {
    /// The predicate that accepts everything; the optimizer's initial
    /// accumulator.
    True,
    /// An opaque predicate, labeled for diagnostics/logs, carrying the
    /// operator that reinstates it if no operator upstream absorbs it.
    Predicate {
        label: std::sync::Arc<str>,
        reinstate: BoxedOperator,
    },
}

impl Filter {
    pub fn predicate(label: impl Into<std::sync::Arc<str>>, reinstate: BoxedOperator) -> Self {
        Filter::Predicate {
            label: label.into(),
            reinstate,
        }
    }

    pub fn is_true(&self) -> bool {
        matches!(self, Filter::True)
    }

    pub fn label(&self) -> Option<&str> {
        match self {
            Filter::True => None,
            Filter::Predicate { label, .. } => Some(label),
        }
    }

    /// Combines two predicates conjunctively. Since the reference `where`
    /// operator filters whole batches (`spec.md` section 4.2's coarse
    /// filter contract), chaining two filtering operators in sequence
    /// realizes logical AND: a batch survives only if both stages keep it.
    pub fn and(self, other: Filter) -> Filter {
        match (self, other) {
            (Filter::True, f) | (f, Filter::True) => f,
            (
                Filter::Predicate { label: la, reinstate: ra },
                Filter::Predicate { label: lb, reinstate: rb },
            ) => Filter::Predicate {
                label: std::sync::Arc::from(format!("({la}) and ({lb})")),
                reinstate: Box::new(crate::pipeline::Pipeline::new(vec![ra, rb])),
            },
        }
    }
}

/// The result of calling `optimize` on one operator (`spec.md` section
/// 4.2/4.4).
pub struct OptimizeResult {
    /// If present, this operator should be replaced by `replacement` in
    /// the pipeline.
    pub replacement: Option<BoxedOperator>,
    /// The filter the operator did *not* absorb; passed to the operator's
    /// predecessor on the next step of the right-to-left pass.
    pub residual_filter: Filter,
    /// The order the operator actually realizes for its output, given the
    /// order that was required of it.
    pub realized_order: Order,
}

impl OptimizeResult {
    /// The "no-op" response mandated by `spec.md` section 4.4: operators
    /// that cannot be optimized return themselves unchanged, pass the
    /// filter through untouched, and claim `Ordered` (the safest claim,
    /// since an operator that does not reorder trivially preserves
    /// whatever order it was asked for).
    pub fn noop(pending_filter: Filter) -> Self {
        Self {
            replacement: None,
            residual_filter: pending_filter,
            realized_order: Order::Ordered,
        }
    }
}

/// One yielded item from an operator's lazy output sequence (`spec.md`
/// section 4.2). This is the concrete replacement for the source's
/// coroutine/generator machinery (`spec.md` section 9): the execution node
/// drives this instead of resuming a generator.
pub enum Step<B> {
    /// A non-empty batch of data.
    Batch(B),
    /// An empty batch of the correct element type: a liveness/suspension
    /// signal. Required whenever the operator would otherwise block.
    Tick(B),
    /// The sequence is exhausted; end-of-stream for the next operator.
    Done,
}

/// The lazy sequence of batches an operator's running instance produces or
/// consumes. A boxed, object-safe iterator so the execution node can drive
/// heterogeneous operator chains without monomorphizing per pipeline.
pub type BatchSeq<B> = Box<dyn Iterator<Item = Step<B>> + Send>;

/// The polymorphic operator abstraction (`spec.md` section 4.2): element-
/// typed inputs/outputs resolved dynamically through `infer_type`, a
/// location constraint, a detached flag, the optimizer hook, and the
/// `instantiate` entry point that returns a lazy output sequence from a
/// lazy input sequence plus a control-plane handle.
///
/// This replaces the deep polymorphic class hierarchies of the original
/// system (`spec.md` section 9) with a single object-safe trait; concrete
/// operators are free to use generics internally (as the reference
/// operators in [`testing`] do) as long as the public object is `dyn
/// Operator`.
pub trait Operator: DynClone + Send + std::fmt::Debug {
    /// A stable identifier, used in logs and diagnostics. Not necessarily
    /// unique within a pipeline (two `map` invocations share a name); the
    /// execution node's `(pipeline_id, operator_index)` pair is what's
    /// unique.
    fn name(&self) -> &str;

    /// Where this operator must or may run. Defaults to
    /// [`Location::Anywhere`].
    fn location(&self) -> Location {
        Location::Anywhere
    }

    /// Whether the execution node running this operator must use its own
    /// OS thread (blocking calls allowed) rather than share the
    /// cooperative scheduler. Defaults to `false`.
    fn detached(&self) -> bool {
        false
    }

    /// Whether this operator is excluded from user-visible metrics.
    /// Defaults to `false`.
    fn internal(&self) -> bool {
        false
    }

    /// Resolves this operator's output element type given its input
    /// element type. Pure and deterministic (`spec.md` section 4.2): the
    /// same `input` must always produce the same result, since both the
    /// optimizer and the executor's type-check call it independently
    /// (see `SPEC_FULL.md` section 4.2 supplement).
    fn infer_type(&self, input: ElementType) -> Result<ElementType, PipelineError>;

    /// The optimizer hook (`spec.md` section 4.2/4.4). Operators that
    /// cannot usefully optimize must return [`OptimizeResult::noop`],
    /// never fail.
    fn optimize(&self, pending_filter: Filter, _required_order: Order) -> OptimizeResult {
        OptimizeResult::noop(pending_filter)
    }

    /// Declares this operator a pure pass-through that can always be
    /// dropped from the pipeline without changing behavior, for the
    /// optimizer's identity-elimination rewrite (`spec.md` section 4.4).
    /// Defaults to `false`; only operators like
    /// [`testing::Identity`](crate::operator::testing::Identity) override
    /// it.
    fn is_identity(&self) -> bool {
        false
    }

    /// Produces this operator's lazy output sequence from its lazy input
    /// sequence and a control-plane handle. Called exactly once per
    /// pipeline run. Any fatal condition must be reported through
    /// `ctrl`'s diagnostics, never by panicking (except for
    /// `internal-invariant` violations, which are never recoverable by
    /// design -- `spec.md` section 7).
    fn instantiate(
        &self,
        input: BatchSeq<crate::element::AnyBatch>,
        ctrl: ControlPlane,
    ) -> BatchSeq<crate::element::AnyBatch>;

    /// Returns `Some(&Pipeline)` if this operator is itself a nested
    /// pipeline (`spec.md` section 4.3, nested-pipeline flattening).
    /// Overridden only by [`crate::pipeline::Pipeline`]'s own `Operator`
    /// impl; every other operator keeps the default.
    fn as_pipeline(&self) -> Option<&crate::pipeline::Pipeline> {
        None
    }

    /// This operator's contribution to a pipeline's stable, serializable
    /// representation (`spec.md` section 6: "serializable via a stable
    /// representation that round-trips operator identity plus each
    /// operator's inspect output"). Operators with no interesting
    /// parameters can leave the default; ones that carry configuration
    /// (a predicate label, a delay, a row count) should surface it here so
    /// a dumped pipeline can be told apart from another instance of the
    /// same operator.
    fn inspect(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
}

dyn_clone::clone_trait_object!(Operator);

/// `Operator` carries `Debug` as a supertrait bound on every implementer,
/// but that alone doesn't make `dyn Operator` itself `Debug` -- the vtable
/// for a trait object only holds entries for the trait's own methods.
/// Forward through `name`/`location`/`detached` instead of deriving: it's
/// enough for logs and diagnostics and avoids requiring every operator
/// struct to hand-write a `Debug` impl just to appear behind a `Box`.
impl std::fmt::Debug for dyn Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operator")
            .field("name", &self.name())
            .field("location", &self.location())
            .field("detached", &self.detached())
            .finish()
    }
}

/// A boxed operator value, exclusively owned by the pipeline that contains
/// it (`spec.md` section 3, Ownership).
pub type BoxedOperator = Box<dyn Operator>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_wrapper_only_overrides_anywhere() {
        assert_eq!(
            Location::Anywhere.resolve_under_wrapper(Location::MustBeLocal),
            Location::MustBeLocal
        );
        assert_eq!(
            Location::MustBeRemote.resolve_under_wrapper(Location::MustBeLocal),
            Location::MustBeRemote
        );
    }

    #[test]
    fn filter_and_absorbs_true() {
        let predicate = Filter::predicate("x > 1", Box::new(crate::operator::testing::Identity::new()));
        let f = Filter::True.and(predicate);
        assert!(matches!(f, Filter::Predicate { .. }));
        assert_eq!(f.label(), Some("x > 1"));
        let f = Filter::True.and(Filter::True);
        assert!(f.is_true());
    }
}
