use ulid::Ulid;

use crate::model::AuditAction;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Malformed input: bad time range, empty interviewer, ...
    Validation(String),
    /// The slot is already taken by `existing`.
    Conflict {
        interviewer: String,
        slot: String,
        existing: Ulid,
    },
    Forbidden {
        actor: String,
        action: AuditAction,
    },
    NotFound(Ulid),
    LimitExceeded(&'static str),
    /// The WAL could not durably commit. Nothing was applied.
    StorageUnavailable(String),
}

/// Coarse classification clients act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Conflict,
    Forbidden,
    NotFound,
    StorageUnavailable,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::NotFound => "not_found",
            ErrorKind::StorageUnavailable => "storage_unavailable",
        }
    }
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_) | EngineError::LimitExceeded(_) => ErrorKind::Validation,
            EngineError::Conflict { .. } => ErrorKind::Conflict,
            EngineError::Forbidden { .. } => ErrorKind::Forbidden,
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::StorageUnavailable(_) => ErrorKind::StorageUnavailable,
        }
    }

    /// Only storage failures may be retried; everything else would fail the
    /// same way again.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::StorageUnavailable
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "invalid: {msg}"),
            EngineError::Conflict {
                interviewer,
                slot,
                existing,
            } => write!(f, "{interviewer} is already booked at {slot} (event {existing})"),
            EngineError::Forbidden { actor, action } => {
                write!(f, "{actor} is not allowed to {action}")
            }
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::StorageUnavailable(e) => write!(f, "storage unavailable: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
