//! The error taxonomy (`spec.md` section 7).

use thiserror::Error;

use crate::diagnostic::Span;

/// A fatal or recoverable condition raised by the engine or by an
/// operator, classified per `spec.md` section 7. Every variant except
/// [`Cancelled`](PipelineError::Cancelled) carries a [`Span`] so a
/// [`Diagnostic`](crate::diagnostic::Diagnostic) can always be built from it
/// without a placeholder location.
#[derive(Debug, Error, Clone)]
pub enum PipelineError {
    /// Adjacent operators disagree on element type, or `infer_type`
    /// rejected its input. Reported at pipeline-build time; the pipeline
    /// is never started.
    #[error("type mismatch at operator '{operator}': expected {expected}, found {found}")]
    TypeMismatch {
        operator: String,
        expected: String,
        found: String,
        span: Span,
    },

    /// An operator's `make` rejected its invocation.
    #[error("failed to construct operator '{operator}': {message}")]
    ParseError {
        operator: String,
        message: String,
        span: Span,
    },

    /// A referenced plugin or node-directory component is missing.
    #[error("unknown component '{name}'")]
    LookupError { name: String, span: Span },

    /// The deployment disallows a requested capability (e.g. an explicit
    /// location override while `allow_unsafe_pipelines` is false).
    #[error("invalid configuration: {message}")]
    InvalidConfiguration { message: String, span: Span },

    /// A recoverable condition inside a running operator (a bad row, a
    /// transient I/O error). Execution continues.
    #[error("warning from '{operator}': {message}")]
    RuntimeWarning {
        operator: String,
        message: String,
        span: Span,
    },

    /// An unrecoverable condition inside a running operator. The
    /// execution node transitions to `failed`; the executor cancels the
    /// rest of the pipeline.
    #[error("error from '{operator}': {message}")]
    RuntimeError {
        operator: String,
        message: String,
        span: Span,
    },

    /// Downstream closed, or the executor requested a stop. Not an error:
    /// nodes exit cleanly and no diagnostic is emitted for it.
    #[error("cancelled")]
    Cancelled,

    /// A core invariant was violated (e.g. a batch column length
    /// mismatch). Never caught and re-raised as a warning; fatal to the
    /// executor's isolation unit.
    #[error("internal invariant violated: {message}")]
    InternalInvariant { message: String },
}

impl PipelineError {
    /// The severity this error maps to when surfaced as a diagnostic.
    pub fn severity(&self) -> crate::diagnostic::Severity {
        match self {
            PipelineError::RuntimeWarning { .. } => crate::diagnostic::Severity::Warning,
            PipelineError::Cancelled => crate::diagnostic::Severity::Note,
            _ => crate::diagnostic::Severity::Error,
        }
    }

    /// Whether this error is fatal to the pipeline run (section 7's
    /// propagation policy): everything except warnings and cancellation.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            PipelineError::RuntimeWarning { .. } | PipelineError::Cancelled
        )
    }
}
