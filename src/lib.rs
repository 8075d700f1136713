/*!
# flowline

The pipeline execution engine at the core of a security-telemetry data
platform: a typed operator graph, the execution-node actor machinery that
runs one operator each, the scheduling/back-pressure/suspension/cancellation
contract between adjacent operators, the location constraint system that
lets an operator declare where it must run, the columnar batch data model,
and the optimizer pass applied before a pipeline runs.

Concrete operators, connectors, codecs, the storage engine, the query
language surface, the CLI and config loading are out of scope: this crate
only depends on the minimal interfaces those collaborators would implement
(see [`operator`], [`diagnostic`], [`metrics`]).

## Layout

- [`element`] -- the three batch element types (`void`/`bytes`/`events`)
  and the type-erased runtime batch.
- [`schema`] -- schemas, their leaf types, and the content-derived
  fingerprint used for routing and metric labels.
- [`operator`] -- the polymorphic operator contract every pipeline step
  implements.
- [`pipeline`] -- an ordered sequence of operators.
- [`optimizer`] -- the filter push-down / order-relaxation / identity-
  elimination pass run before execution.
- [`node`] -- the per-operator execution node and its lifecycle state
  machine.
- [`scheduler`] -- the cooperative/detached task runtime execution nodes
  run on.
- [`executor`] -- spawns, wires and drives a pipeline's execution nodes to
  completion.
- [`control`] -- the per-node facade (diagnostics, metrics, suspension,
  cancellation) handed to a running operator.
- [`channel`] -- the bounded mailbox abstraction between adjacent nodes.
- [`diagnostic`] -- structured, user-visible pipeline messages.
- [`error`] -- the engine's error taxonomy.
- [`metrics`] -- per-schema event/byte counters emitted by execution nodes.
- [`config`] -- the tunables the engine itself consumes.
- [`bridge`] -- the cross-process egress/ingress pair used when a pipeline
  spans a location boundary (requires the `tokio` feature).
- [`clock`] -- the monotonic clock backing import timestamps.
- [`row`] -- row-oriented convenience builders on top of the columnar
  batch model, used by tests and the in-tree reference operators.

```
use flowline::config::RuntimeConfig;
use flowline::control::NodeDirectory;
use flowline::diagnostic::{ChannelDiagnosticHandler, SourceId};
use flowline::executor::Executor;
use flowline::metrics::CollectingMetricReceiver;
use flowline::operator::testing::{Identity, SinkCollect, SourceConst};
use flowline::pipeline::Pipeline;
use std::sync::Arc;

let diagnostics = Arc::new(ChannelDiagnosticHandler::new());
let executor = Executor::new(
    RuntimeConfig::default(),
    diagnostics,
    Arc::new(CollectingMetricReceiver::default()),
    Arc::new(NodeDirectory::default()),
);
let pipeline = Pipeline::new(vec![
    Box::new(SourceConst::new(vec![])),
    Box::new(Identity::new()),
    Box::new(SinkCollect::new()),
]);
executor.run(pipeline, SourceId(1), "example").unwrap();
```
*/
#[macro_use]
extern crate derivative;
#[macro_use]
extern crate tracing;

#[cfg(feature = "tokio")]
pub mod bridge;
pub mod channel;
pub mod clock;
pub mod config;
pub mod control;
pub mod diagnostic;
pub mod element;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod node;
pub mod operator;
pub mod optimizer;
pub mod pipeline;
pub mod row;
pub mod schema;
#[cfg(any(test, feature = "testing"))]
pub mod test_support;

pub use element::{AnyBatch, ElementType};
pub use error::PipelineError;
pub use executor::{Executor, RunningPipeline};
pub use operator::{BoxedOperator, Operator};
pub use pipeline::Pipeline;
