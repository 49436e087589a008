use std::error::Error;
use std::fmt::{Display, Formatter};

/// Status codes shared by the backend RPC layer and the local components.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FirestoreErrorCode {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    Unauthenticated,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
}

impl FirestoreErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FirestoreErrorCode::Cancelled => "firestore/cancelled",
            FirestoreErrorCode::Unknown => "firestore/unknown",
            FirestoreErrorCode::InvalidArgument => "firestore/invalid-argument",
            FirestoreErrorCode::DeadlineExceeded => "firestore/deadline-exceeded",
            FirestoreErrorCode::NotFound => "firestore/not-found",
            FirestoreErrorCode::AlreadyExists => "firestore/already-exists",
            FirestoreErrorCode::PermissionDenied => "firestore/permission-denied",
            FirestoreErrorCode::Unauthenticated => "firestore/unauthenticated",
            FirestoreErrorCode::ResourceExhausted => "firestore/resource-exhausted",
            FirestoreErrorCode::FailedPrecondition => "firestore/failed-precondition",
            FirestoreErrorCode::Aborted => "firestore/aborted",
            FirestoreErrorCode::OutOfRange => "firestore/out-of-range",
            FirestoreErrorCode::Unimplemented => "firestore/unimplemented",
            FirestoreErrorCode::Internal => "firestore/internal",
            FirestoreErrorCode::Unavailable => "firestore/unavailable",
            FirestoreErrorCode::DataLoss => "firestore/data-loss",
        }
    }

    /// Maps a numeric RPC status code onto the client taxonomy.
    pub fn from_rpc_code(code: i32) -> Self {
        match code {
            1 => FirestoreErrorCode::Cancelled,
            2 => FirestoreErrorCode::Unknown,
            3 => FirestoreErrorCode::InvalidArgument,
            4 => FirestoreErrorCode::DeadlineExceeded,
            5 => FirestoreErrorCode::NotFound,
            6 => FirestoreErrorCode::AlreadyExists,
            7 => FirestoreErrorCode::PermissionDenied,
            8 => FirestoreErrorCode::ResourceExhausted,
            9 => FirestoreErrorCode::FailedPrecondition,
            10 => FirestoreErrorCode::Aborted,
            11 => FirestoreErrorCode::OutOfRange,
            12 => FirestoreErrorCode::Unimplemented,
            13 => FirestoreErrorCode::Internal,
            14 => FirestoreErrorCode::Unavailable,
            15 => FirestoreErrorCode::DataLoss,
            16 => FirestoreErrorCode::Unauthenticated,
            _ => FirestoreErrorCode::Unknown,
        }
    }
}

/// Returns `true` when an RPC failing with `code` must not be retried.
///
/// Cancelled, unknown, deadline-exceeded, resource-exhausted, internal,
/// unavailable and unauthenticated are all handled by stream backoff.
pub fn is_permanent_error(code: FirestoreErrorCode) -> bool {
    match code {
        FirestoreErrorCode::Cancelled
        | FirestoreErrorCode::Unknown
        | FirestoreErrorCode::DeadlineExceeded
        | FirestoreErrorCode::ResourceExhausted
        | FirestoreErrorCode::Internal
        | FirestoreErrorCode::Unavailable
        | FirestoreErrorCode::Unauthenticated => false,
        FirestoreErrorCode::InvalidArgument
        | FirestoreErrorCode::NotFound
        | FirestoreErrorCode::AlreadyExists
        | FirestoreErrorCode::PermissionDenied
        | FirestoreErrorCode::FailedPrecondition
        | FirestoreErrorCode::Aborted
        | FirestoreErrorCode::OutOfRange
        | FirestoreErrorCode::Unimplemented
        | FirestoreErrorCode::DataLoss => true,
    }
}

/// Write-stream variant of [`is_permanent_error`]: an aborted commit is retried.
pub fn is_permanent_write_error(code: FirestoreErrorCode) -> bool {
    is_permanent_error(code) && code != FirestoreErrorCode::Aborted
}

pub const PRIMARY_LEASE_LOST_ERROR_MSG: &str =
    "The current client is no longer the primary owner of the persistent store.";

#[derive(Clone, Debug, PartialEq)]
pub struct FirestoreError {
    pub code: FirestoreErrorCode,
    message: String,
    storage_failure: bool,
}

impl FirestoreError {
    pub fn new(code: FirestoreErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            storage_failure: false,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code.as_str()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether the error was raised by the storage engine while running a transaction.
    pub fn is_storage_failure(&self) -> bool {
        self.storage_failure
    }

    pub fn is_primary_lease_lost(&self) -> bool {
        self.code == FirestoreErrorCode::FailedPrecondition
            && self.message == PRIMARY_LEASE_LOST_ERROR_MSG
    }
}

impl Display for FirestoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code_str())
    }
}

impl Error for FirestoreError {}

impl From<rusqlite::Error> for FirestoreError {
    fn from(err: rusqlite::Error) -> Self {
        storage_failure(format!("sqlite: {err}"))
    }
}

impl From<serde_json::Error> for FirestoreError {
    fn from(err: serde_json::Error) -> Self {
        storage_failure(format!("corrupt record: {err}"))
    }
}

pub type FirestoreResult<T> = Result<T, FirestoreError>;

pub fn cancelled(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Cancelled, message)
}

pub fn invalid_argument(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::InvalidArgument, message)
}

pub fn internal_error(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Internal, message)
}

pub fn not_found(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::NotFound, message)
}

pub fn permission_denied(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::PermissionDenied, message)
}

pub fn unauthenticated(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Unauthenticated, message)
}

pub fn unavailable(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Unavailable, message)
}

pub fn deadline_exceeded(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::DeadlineExceeded, message)
}

pub fn resource_exhausted(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::ResourceExhausted, message)
}

pub fn failed_precondition(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::FailedPrecondition, message)
}

pub fn aborted(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Aborted, message)
}

pub fn primary_lease_lost() -> FirestoreError {
    failed_precondition(PRIMARY_LEASE_LOST_ERROR_MSG)
}

/// Wraps a storage-engine failure. These are retried by the async queue instead
/// of surfacing to listeners.
pub fn storage_failure(message: impl Into<String>) -> FirestoreError {
    FirestoreError {
        code: FirestoreErrorCode::Unavailable,
        message: message.into(),
        storage_failure: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aborted_is_permanent_except_for_writes() {
        assert!(is_permanent_error(FirestoreErrorCode::Aborted));
        assert!(!is_permanent_write_error(FirestoreErrorCode::Aborted));
        assert!(is_permanent_write_error(FirestoreErrorCode::PermissionDenied));
    }

    #[test]
    fn transient_codes_are_retried() {
        for code in [
            FirestoreErrorCode::Cancelled,
            FirestoreErrorCode::Unknown,
            FirestoreErrorCode::DeadlineExceeded,
            FirestoreErrorCode::ResourceExhausted,
            FirestoreErrorCode::Internal,
            FirestoreErrorCode::Unavailable,
            FirestoreErrorCode::Unauthenticated,
        ] {
            assert!(!is_permanent_error(code), "{code:?}");
        }
    }

    #[test]
    fn maps_rpc_codes() {
        assert_eq!(
            FirestoreErrorCode::from_rpc_code(16),
            FirestoreErrorCode::Unauthenticated
        );
        assert_eq!(
            FirestoreErrorCode::from_rpc_code(8),
            FirestoreErrorCode::ResourceExhausted
        );
        assert_eq!(FirestoreErrorCode::from_rpc_code(99), FirestoreErrorCode::Unknown);
    }

    #[test]
    fn storage_failures_are_flagged() {
        let err = storage_failure("disk full");
        assert!(err.is_storage_failure());
        assert_eq!(err.code_str(), "firestore/unavailable");
        assert!(!unavailable("offline").is_storage_failure());
    }

    #[test]
    fn recognises_lease_loss() {
        assert!(primary_lease_lost().is_primary_lease_lost());
        assert!(!failed_precondition("other").is_primary_lease_lost());
    }
}
