use std::error::Error;
use std::fmt::{Display, Formatter};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FirestoreErrorCode {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
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
            FirestoreErrorCode::ResourceExhausted => "firestore/resource-exhausted",
            FirestoreErrorCode::FailedPrecondition => "firestore/failed-precondition",
            FirestoreErrorCode::Aborted => "firestore/aborted",
            FirestoreErrorCode::OutOfRange => "firestore/out-of-range",
            FirestoreErrorCode::Unimplemented => "firestore/unimplemented",
            FirestoreErrorCode::Internal => "firestore/internal",
            FirestoreErrorCode::Unavailable => "firestore/unavailable",
            FirestoreErrorCode::DataLoss => "firestore/data-loss",
            FirestoreErrorCode::Unauthenticated => "firestore/unauthenticated",
        }
    }

    /// Maps a numeric gRPC status code as carried by stream close frames.
    pub fn from_grpc_status(code: i32) -> Self {
        match code {
            1 => FirestoreErrorCode::Cancelled,
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

    /// Maps a textual status name such as `FAILED_PRECONDITION`.
    pub fn from_status_name(status: &str) -> Self {
        match status {
            "CANCELLED" => FirestoreErrorCode::Cancelled,
            "INVALID_ARGUMENT" => FirestoreErrorCode::InvalidArgument,
            "DEADLINE_EXCEEDED" => FirestoreErrorCode::DeadlineExceeded,
            "NOT_FOUND" => FirestoreErrorCode::NotFound,
            "ALREADY_EXISTS" => FirestoreErrorCode::AlreadyExists,
            "PERMISSION_DENIED" => FirestoreErrorCode::PermissionDenied,
            "RESOURCE_EXHAUSTED" => FirestoreErrorCode::ResourceExhausted,
            "FAILED_PRECONDITION" => FirestoreErrorCode::FailedPrecondition,
            "ABORTED" => FirestoreErrorCode::Aborted,
            "OUT_OF_RANGE" => FirestoreErrorCode::OutOfRange,
            "UNIMPLEMENTED" => FirestoreErrorCode::Unimplemented,
            "INTERNAL" => FirestoreErrorCode::Internal,
            "UNAVAILABLE" => FirestoreErrorCode::Unavailable,
            "DATA_LOSS" => FirestoreErrorCode::DataLoss,
            "UNAUTHENTICATED" => FirestoreErrorCode::Unauthenticated,
            _ => FirestoreErrorCode::Unknown,
        }
    }

    /// Codes that only indicate a transient connectivity problem.
    pub fn is_retryable_network(&self) -> bool {
        matches!(
            self,
            FirestoreErrorCode::Unavailable
                | FirestoreErrorCode::DeadlineExceeded
                | FirestoreErrorCode::ResourceExhausted
                | FirestoreErrorCode::Internal
                | FirestoreErrorCode::Unknown
                | FirestoreErrorCode::Cancelled
        )
    }

    /// Codes for which retrying the same request cannot succeed.
    pub fn is_permanent(&self) -> bool {
        !self.is_retryable_network() && *self != FirestoreErrorCode::Unauthenticated
    }

    /// A write rejected with one of these codes is dropped from the queue and reported
    /// to the caller. `Aborted` is retried because the backend uses it for contention.
    pub fn is_permanent_write_error(&self) -> bool {
        self.is_permanent() && *self != FirestoreErrorCode::Aborted
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FirestoreError {
    pub code: FirestoreErrorCode,
    message: String,
}

impl FirestoreError {
    pub fn new(code: FirestoreErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code.as_str()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_retryable_network(&self) -> bool {
        self.code.is_retryable_network()
    }

    pub fn is_permanent_error(&self) -> bool {
        self.code.is_permanent()
    }

    pub fn is_permanent_write_error(&self) -> bool {
        self.code.is_permanent_write_error()
    }
}

impl Display for FirestoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code_str())
    }
}

impl Error for FirestoreError {}

pub type FirestoreResult<T> = Result<T, FirestoreError>;

pub fn map_grpc_status(code: i32, message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::from_grpc_status(code), message)
}

pub fn map_status_name(status: &str, message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::from_status_name(status), message)
}

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

pub fn already_exists(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::AlreadyExists, message)
}

pub fn failed_precondition(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::FailedPrecondition, message)
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

/// Raised when an internal invariant is broken. These indicate a bug, not a
/// recoverable condition.
pub fn assertion_failure(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(
        FirestoreErrorCode::Internal,
        format!("INTERNAL ASSERTION FAILED: {}", message.into()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grpc_codes_round_trip_to_names() {
        assert_eq!(
            map_grpc_status(9, "precondition").code,
            FirestoreErrorCode::FailedPrecondition
        );
        assert_eq!(map_grpc_status(42, "???").code, FirestoreErrorCode::Unknown);
        assert_eq!(
            map_status_name("ALREADY_EXISTS", "dup").code_str(),
            "firestore/already-exists"
        );
    }

    #[test]
    fn classifies_write_errors() {
        assert!(permission_denied("nope").is_permanent_write_error());
        assert!(failed_precondition("stale").is_permanent_write_error());
        assert!(!unavailable("offline").is_permanent_write_error());
        assert!(!resource_exhausted("quota").is_permanent_write_error());
        assert!(!FirestoreError::new(FirestoreErrorCode::Aborted, "contention").is_permanent_write_error());
        assert!(!unauthenticated("token").is_permanent_write_error());
    }

    #[test]
    fn display_includes_code() {
        let err = not_found("missing doc");
        assert_eq!(err.to_string(), "missing doc (firestore/not-found)");
    }
}
