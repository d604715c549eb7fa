//! Error taxonomy and processing outcomes
//!
//! Every failure in the runtime is classified by an [`ErrorKind`]. The
//! Retry and CircuitBreaker decorators consult the classification; the
//! Idempotency decorator caches either side per configuration. Background
//! processors never surface failures to producers — they record them and
//! continue.

use serde::{Deserialize, Serialize};

/// Failure classification shared across the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Message failed precondition checks. Permanent.
    Validation,
    /// No registered handler for the message type. Permanent.
    NoHandler,
    /// Network blip, storage timeout, transient conflict. Retried.
    Transient,
    /// Business-logic failure, unrecoverable.
    Permanent,
    /// Optimistic-concurrency clash on saga save or outbox claim.
    Concurrency,
    /// Circuit breaker is Open; fail-fast.
    CircuitOpen,
    /// Inbox observed a prior entry for this MessageId.
    Duplicate,
    /// Caller cancellation signal fired.
    Cancelled,
    /// Deadline elapsed.
    Timeout,
    /// Composite of multiple handler failures in parallel event dispatch.
    Aggregate,
    /// Invalid or incomplete configuration detected at startup.
    Configuration,
}

impl ErrorKind {
    /// Whether the Retry decorator may re-attempt this failure.
    /// Concurrency clashes are retried with bounded attempts by the
    /// components that own them (saga orchestrator, outbox claim).
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorKind::Transient | ErrorKind::Timeout)
    }

    /// Whether this kind is terminal for the message (no path retries it).
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ErrorKind::Validation
                | ErrorKind::NoHandler
                | ErrorKind::Permanent
                | ErrorKind::Duplicate
                | ErrorKind::Configuration
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NoHandler => "no-handler",
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Concurrency => "concurrency",
            ErrorKind::CircuitOpen => "circuit-open",
            ErrorKind::Duplicate => "duplicate",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Aggregate => "aggregate",
            ErrorKind::Configuration => "configuration",
        };
        write!(f, "{}", name)
    }
}

/// A classified processing failure. `causes` carries the individual
/// member failures when `kind` is [`ErrorKind::Aggregate`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingFailure {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub causes: Vec<ProcessingFailure>,
}

impl ProcessingFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), cause: None, causes: Vec::new() }
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permanent, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "operation cancelled")
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn no_handler(message_type: &str) -> Self {
        Self::new(ErrorKind::NoHandler, format!("no handler registered for '{}'", message_type))
    }

    pub fn aggregate(causes: Vec<ProcessingFailure>) -> Self {
        Self {
            kind: ErrorKind::Aggregate,
            message: format!("{} handler(s) failed", causes.len()),
            cause: None,
            causes,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

impl std::fmt::Display for ProcessingFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ProcessingFailure {}

/// Result of one processor invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Outcome {
    /// Handler completed; queries and responding commands carry a result.
    Success(Option<serde_json::Value>),
    Failure(ProcessingFailure),
    /// The message was deliberately not processed (e.g. batch aborted).
    Skipped { reason: String },
}

impl Outcome {
    pub fn success() -> Self {
        Outcome::Success(None)
    }

    pub fn success_with(result: serde_json::Value) -> Self {
        Outcome::Success(Some(result))
    }

    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        Outcome::Failure(ProcessingFailure::new(kind, message))
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Outcome::Skipped { reason: reason.into() }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failure(_))
    }

    pub fn failure_kind(&self) -> Option<ErrorKind> {
        match self {
            Outcome::Failure(failure) => Some(failure.kind),
            _ => None,
        }
    }

    pub fn result(&self) -> Option<&serde_json::Value> {
        match self {
            Outcome::Success(result) => result.as_ref(),
            _ => None,
        }
    }
}

/// Top-level error for fallible library operations that are not part of a
/// processing pipeline (construction, configuration, storage plumbing).
#[derive(Debug, thiserror::Error)]
pub enum HeraldError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("scheduler error: {0}")]
    Scheduler(String),

    #[error("saga error: {0}")]
    Saga(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("operation cancelled")]
    Cancelled,

    #[error("shutdown in progress")]
    ShutdownInProgress,
}

pub type Result<T> = std::result::Result<T, HeraldError>;
