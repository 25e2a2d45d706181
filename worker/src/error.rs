use std::any::Any;
use std::fmt;

use thiserror::Error;

/// Errors surfaced by a [`Backend`](crate::backend::Backend).
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// The caller no longer holds the lease for this job: it was reclaimed,
    /// timed out past the grace period, or already reported.
    #[error("lease on job {jid} is no longer held")]
    LostLock { jid: String },
    #[error("job {0} does not exist")]
    NotFound(String),
    #[error("job {jid} is {state}, which does not allow this operation")]
    InvalidState { jid: String, state: String },
    #[error("transient backend error: {0}")]
    Transient(String),
    #[error("backend unavailable: {0}")]
    Fatal(String),
}

impl BackendError {
    pub fn lost_lock(jid: impl Into<String>) -> Self {
        BackendError::LostLock { jid: jid.into() }
    }

    /// Errors a worker may swallow and retry on its next cycle. Everything
    /// except `Fatal` leaves the backend reachable.
    pub fn is_transient(&self) -> bool {
        !matches!(self, BackendError::Fatal(_))
    }

    pub fn is_lost_lock(&self) -> bool {
        matches!(self, BackendError::LostLock { .. })
    }
}

impl From<redis::RedisError> for BackendError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_refusal() || err.is_unrecoverable_error() {
            BackendError::Fatal(err.to_string())
        } else {
            BackendError::Transient(err.to_string())
        }
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(err: serde_json::Error) -> Self {
        BackendError::Transient(format!("malformed job data: {err}"))
    }
}

/// A classification tag for handler errors.
///
/// Kinds form a tree through `parent`; a retry rule naming a kind matches
/// that kind and all of its descendants.
#[derive(Debug)]
pub struct ErrorKind {
    name: &'static str,
    parent: Option<&'static ErrorKind>,
}

impl ErrorKind {
    pub const fn root(name: &'static str) -> Self {
        Self { name, parent: None }
    }

    pub const fn child(name: &'static str, parent: &'static ErrorKind) -> Self {
        Self {
            name,
            parent: Some(parent),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn parent(&self) -> Option<&'static ErrorKind> {
        self.parent
    }

    /// This kind followed by each of its ancestors, nearest first.
    pub fn lineage(&self) -> impl Iterator<Item = &ErrorKind> {
        std::iter::successors(Some(self), |kind| kind.parent)
    }

    pub fn is_a(&self, other: &ErrorKind) -> bool {
        self.lineage().any(|kind| kind.name == other.name)
    }
}

impl PartialEq for ErrorKind {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for ErrorKind {}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

pub static STANDARD_ERROR: ErrorKind = ErrorKind::root("StandardError");
pub static HANDLER_NOT_FOUND: ErrorKind = ErrorKind::child("HandlerNotFound", &STANDARD_ERROR);
pub static BACKEND_ERROR: ErrorKind = ErrorKind::child("BackendError", &STANDARD_ERROR);
pub static PANIC: ErrorKind = ErrorKind::root("Panic");

/// The error type handlers and middleware return.
#[derive(Debug, Clone)]
pub struct JobError {
    kind: &'static ErrorKind,
    message: String,
}

impl JobError {
    pub fn new(kind: &'static ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn standard(message: impl Into<String>) -> Self {
        Self::new(&STANDARD_ERROR, message)
    }

    pub fn handler_not_found(class: &str) -> Self {
        Self::new(
            &HANDLER_NOT_FOUND,
            format!("no handler registered for class '{class}'"),
        )
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(text) = payload.downcast_ref::<&str>() {
            (*text).to_string()
        } else if let Some(text) = payload.downcast_ref::<String>() {
            text.clone()
        } else {
            "handler panicked".to_string()
        };
        Self::new(&PANIC, message)
    }

    pub fn kind(&self) -> &'static ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Failure group recorded with the backend when this error fails a job.
    pub fn group(&self) -> &'static str {
        self.kind.name()
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.name, self.message)
    }
}

impl std::error::Error for JobError {}

impl From<BackendError> for JobError {
    fn from(err: BackendError) -> Self {
        JobError::new(&BACKEND_ERROR, err.to_string())
    }
}

impl From<anyhow::Error> for JobError {
    fn from(err: anyhow::Error) -> Self {
        JobError::standard(format!("{err:#}"))
    }
}
