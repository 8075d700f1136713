//! Diagnostics: structured, user-visible messages with severity, source
//! span, annotations and notes (`spec.md` section 3).

use std::sync::Arc;

use flume::{Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Severity of a [`Diagnostic`]. An `Error` is fatal to the pipeline
/// (`spec.md` section 7); `Warning` and `Note` are not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Note,
    Warning,
    Error,
}

/// An opaque identifier for one pipeline's defining text, so a [`Span`]
/// from a cross-process bridge still addresses the right source even when
/// several pipelines run concurrently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceId(pub u64);

/// A byte offset range inside a pipeline's defining text, identified by
/// [`SourceId`]. Used both by [`Diagnostic`] and by an operator's identity
/// (`spec.md` section 4.5), so a diagnostic's primary annotation can point
/// at the exact operator invocation, not merely name it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub source: SourceId,
    pub start: u32,
    pub end: u32,
}

impl Span {
    pub const fn unknown() -> Self {
        Self {
            source: SourceId(0),
            start: 0,
            end: 0,
        }
    }
}

/// One annotation attached to a diagnostic: a span plus an explanatory
/// label, e.g. "this operator expects `events`".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Annotation {
    pub span: Span,
    pub label: String,
}

/// A structured, user-visible diagnostic message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub span: Span,
    pub annotations: Vec<Annotation>,
    pub notes: Vec<String>,
    /// The operator that raised this diagnostic, if known. Left `None` by
    /// callers that build a bare diagnostic; [`ControlPlane::emit`]
    /// (`spec.md` section 4.7) fills it in with the emitting node's own
    /// operator when absent, the same way it fills in a missing span.
    #[serde(default)]
    pub operator: Option<String>,
}

impl Diagnostic {
    pub fn new(severity: Severity, message: impl Into<String>, span: Span) -> Self {
        Self {
            severity,
            message: message.into(),
            span,
            annotations: Vec::new(),
            notes: Vec::new(),
            operator: None,
        }
    }

    pub fn with_operator(mut self, operator: impl Into<String>) -> Self {
        self.operator = Some(operator.into());
        self
    }

    pub fn with_annotation(mut self, span: Span, label: impl Into<String>) -> Self {
        self.annotations.push(Annotation {
            span,
            label: label.into(),
        });
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    pub fn is_fatal(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl From<&PipelineError> for Diagnostic {
    fn from(err: &PipelineError) -> Self {
        let severity = err.severity();
        let span = match err {
            PipelineError::TypeMismatch { span, .. }
            | PipelineError::ParseError { span, .. }
            | PipelineError::LookupError { span, .. }
            | PipelineError::InvalidConfiguration { span, .. }
            | PipelineError::RuntimeWarning { span, .. }
            | PipelineError::RuntimeError { span, .. } => *span,
            PipelineError::Cancelled | PipelineError::InternalInvariant { .. } => Span::unknown(),
        };
        let mut diag = Diagnostic::new(severity, err.to_string(), span);
        if let PipelineError::TypeMismatch { operator, .. }
        | PipelineError::ParseError { operator, .. }
        | PipelineError::RuntimeWarning { operator, .. }
        | PipelineError::RuntimeError { operator, .. } = err
        {
            diag = diag.with_operator(operator.clone());
        }
        if let PipelineError::TypeMismatch { operator, .. } = err {
            diag = diag.with_annotation(span, format!("operator '{operator}' rejects this input"));
        }
        diag
    }
}

/// The interface any diagnostic sink must implement (`spec.md` section 6).
/// The engine only consumes this; the concrete rendering/shipping
/// (terminal output, log aggregation) is an external collaborator's
/// concern.
pub trait DiagnosticHandler: Send + Sync {
    fn emit(&self, diagnostic: Diagnostic);
    fn has_seen_error(&self) -> bool;
}

/// A multi-producer, single-consumer diagnostic sink: concurrent `emit`
/// calls from several execution nodes are serialized into one channel, as
/// required by the shared-resource policy in `spec.md` section 5.
pub struct ChannelDiagnosticHandler {
    sender: Sender<Diagnostic>,
    receiver: Receiver<Diagnostic>,
    seen_error: Arc<Mutex<bool>>,
    /// The first fatal diagnostic emitted so far, naming the operator that
    /// actually raised it. Tracked separately from the drainable channel
    /// (never consumed by `drain`/`recv`) so a node that merely observes
    /// `has_seen_error()` -- a flag shared by every node in the pipeline --
    /// can still recover the true origin instead of self-reporting
    /// (`spec.md` section 7).
    first_fatal: Arc<Mutex<Option<Diagnostic>>>,
}

impl ChannelDiagnosticHandler {
    pub fn new() -> Self {
        let (sender, receiver) = flume::unbounded();
        Self {
            sender,
            receiver,
            seen_error: Arc::new(Mutex::new(false)),
            first_fatal: Arc::new(Mutex::new(None)),
        }
    }

    /// A clonable handle usable by background tasks an operator spawns,
    /// per the control plane's `shared_diagnostics()` (section 4.7).
    pub fn shared_handle(&self) -> SharedDiagnosticHandle {
        SharedDiagnosticHandle {
            sender: self.sender.clone(),
            seen_error: self.seen_error.clone(),
            first_fatal: self.first_fatal.clone(),
        }
    }

    /// Drains every diagnostic emitted so far, in emission order.
    pub fn drain(&self) -> Vec<Diagnostic> {
        self.receiver.drain().collect()
    }

    /// Blocks until at least one diagnostic is available, or the sink is
    /// closed (all senders dropped).
    pub fn recv(&self) -> Option<Diagnostic> {
        self.receiver.recv().ok()
    }

    /// The first fatal diagnostic emitted so far, if any. Does not consume
    /// the channel `drain`/`recv` read from.
    pub fn first_fatal(&self) -> Option<Diagnostic> {
        self.first_fatal.lock().clone()
    }
}

impl Default for ChannelDiagnosticHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl DiagnosticHandler for ChannelDiagnosticHandler {
    fn emit(&self, diagnostic: Diagnostic) {
        if diagnostic.is_fatal() {
            *self.seen_error.lock() = true;
            let mut first_fatal = self.first_fatal.lock();
            if first_fatal.is_none() {
                *first_fatal = Some(diagnostic.clone());
            }
        }
        // The receiver outlives every sender for the run's duration; a
        // send error here would mean the executor already dropped its
        // receiver, which only happens after the run has concluded.
        let _ = self.sender.send(diagnostic);
    }

    fn has_seen_error(&self) -> bool {
        *self.seen_error.lock()
    }
}

/// A clonable handle to a [`ChannelDiagnosticHandler`], given to a
/// background task spawned by an operator so it can keep reporting after
/// `instantiate` returns.
#[derive(Clone)]
pub struct SharedDiagnosticHandle {
    sender: Sender<Diagnostic>,
    seen_error: Arc<Mutex<bool>>,
    first_fatal: Arc<Mutex<Option<Diagnostic>>>,
}

impl DiagnosticHandler for SharedDiagnosticHandle {
    fn emit(&self, diagnostic: Diagnostic) {
        if diagnostic.is_fatal() {
            *self.seen_error.lock() = true;
            let mut first_fatal = self.first_fatal.lock();
            if first_fatal.is_none() {
                *first_fatal = Some(diagnostic.clone());
            }
        }
        let _ = self.sender.send(diagnostic);
    }

    fn has_seen_error(&self) -> bool {
        *self.seen_error.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_diagnostic_marks_seen_error() {
        let handler = ChannelDiagnosticHandler::new();
        assert!(!handler.has_seen_error());
        handler.emit(Diagnostic::new(Severity::Warning, "hm", Span::unknown()));
        assert!(!handler.has_seen_error());
        handler.emit(Diagnostic::new(Severity::Error, "bad", Span::unknown()));
        assert!(handler.has_seen_error());
    }

    #[test]
    fn drain_preserves_emission_order() {
        let handler = ChannelDiagnosticHandler::new();
        handler.emit(Diagnostic::new(Severity::Note, "one", Span::unknown()));
        handler.emit(Diagnostic::new(Severity::Note, "two", Span::unknown()));
        let drained = handler.drain();
        assert_eq!(drained[0].message, "one");
        assert_eq!(drained[1].message, "two");
    }

    #[test]
    fn type_mismatch_error_converts_to_fatal_diagnostic() {
        let err = PipelineError::TypeMismatch {
            operator: "sink_events".into(),
            expected: "bytes".into(),
            found: "events".into(),
            span: Span::unknown(),
        };
        let diag: Diagnostic = (&err).into();
        assert!(diag.is_fatal());
        assert!(diag.annotations.iter().any(|a| a.label.contains("sink_events")));
    }
}
