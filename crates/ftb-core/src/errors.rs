use std::time::Duration;

use crate::domain::{JobKind, Subject};

/// Classification tag for a failed outbound call.
///
/// Adapters pick the tag when mapping their own errors; the backoff executor
/// only ever looks at the tag, never at adapter error types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Timeout,
    Connection,
    RateLimited,
    ServerError,
    BadRequest,
    NotFound,
    Unauthorized,
    Malformed,
    Other,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::Connection => "connection",
            FailureKind::RateLimited => "rate_limited",
            FailureKind::ServerError => "server_error",
            FailureKind::BadRequest => "bad_request",
            FailureKind::NotFound => "not_found",
            FailureKind::Unauthorized => "unauthorized",
            FailureKind::Malformed => "malformed",
            FailureKind::Other => "other",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Core error type.
///
/// Adapter crates map their specific errors into this type so jobs and command
/// handlers can treat failures uniformly (retry, deny, log, crash).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("transient {kind} failure: {message}")]
    Transient {
        kind: FailureKind,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("permanent {kind} failure: {message}")]
    Permanent { kind: FailureKind, message: String },

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("gave up after {attempts} attempts in {elapsed:?}: {last}")]
    RetryExhausted {
        attempts: u32,
        elapsed: Duration,
        last: Box<Error>,
    },

    #[error("{kind} job already running for {subject}")]
    AlreadyRunning { subject: Subject, kind: JobKind },

    #[error("no {kind} job running for {subject}")]
    JobNotFound { subject: Subject, kind: JobKind },

    #[error("job registry is shut down")]
    RegistryClosed,

    #[error("invariant violated: {0}")]
    FatalInvariant(String),

    #[error("external error: {0}")]
    External(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn transient(kind: FailureKind, message: impl Into<String>) -> Self {
        Error::Transient {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    /// A callee-mandated wait ("retry after N seconds").
    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Error::Transient {
            kind: FailureKind::RateLimited,
            message: message.into(),
            retry_after,
        }
    }

    pub fn permanent(kind: FailureKind, message: impl Into<String>) -> Self {
        Error::Permanent {
            kind,
            message: message.into(),
        }
    }

    /// Failure tag inspected by the backoff executor.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Error::Transient { kind, .. } | Error::Permanent { kind, .. } => *kind,
            Error::StoreUnavailable(_) => FailureKind::Connection,
            Error::Json(_) => FailureKind::Malformed,
            Error::Config(_) => FailureKind::BadRequest,
            _ => FailureKind::Other,
        }
    }

    /// Wait duration mandated by the callee, if the failure carries one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::Transient { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::FatalInvariant(_))
    }

    /// Stable label stored in error records.
    pub fn label(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Transient { .. } => "transient_network",
            Error::Permanent { .. } => "permanent_request",
            Error::StoreUnavailable(_) => "store_unavailable",
            Error::RetryExhausted { .. } => "retry_exhausted",
            Error::AlreadyRunning { .. } => "job_conflict",
            Error::JobNotFound { .. } => "job_not_found",
            Error::RegistryClosed => "registry_closed",
            Error::FatalInvariant(_) => "fatal",
            Error::External(_) => "external",
        }
    }
}
