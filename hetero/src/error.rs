//! Typed errors (§7) and the pluggable diagnostic reporter.
//!
//! Job-level failures attach to the job's `status` field and reach the
//! client through `Planner::wait`/`finished_job`; only `RuntimeError`
//! represents a component-level failure that surfaces to the caller as
//! `Err`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("config parse error: {0}")]
    ConfigParseError(String),
    #[error("model load error: {0}")]
    ModelLoadError(String),
    #[error("register failure for model {model_id}")]
    RegisterFailure { model_id: usize },
    #[error("no viable worker for subgraph")]
    NoViableWorker,
    #[error("input copy failure")]
    InputCopyFailure,
    #[error("output copy failure")]
    OutputCopyFailure,
    #[error("invoke failure")]
    InvokeFailure,
    #[error("delegate error")]
    DelegateError,
    #[error("slo violation")]
    SloViolation,
    #[error("tensor shape mismatch: expected {expected}, got {actual}")]
    TensorShapeMismatch { expected: usize, actual: usize },
    #[error("path invalid: {0}")]
    PathInvalid(String),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Printf-style diagnostic sink for component-level errors that don't abort
/// the calling operation — §7's "pluggable ErrorReporter". The default
/// implementation below forwards to `tracing`; tests can inject a collecting
/// reporter.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, error: &RuntimeError);
}

pub struct TracingErrorReporter;

impl ErrorReporter for TracingErrorReporter {
    fn report(&self, error: &RuntimeError) {
        tracing::error!(%error, "runtime error");
    }
}
