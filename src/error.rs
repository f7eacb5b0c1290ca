use std::error::Error;
use std::fmt::{Display, Formatter};

/// Error codes used across the sync engine, mirroring the gRPC status space
/// the backend speaks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncErrorCode {
    Cancelled,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    Internal,
    Unavailable,
    Unauthenticated,
}

impl SyncErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncErrorCode::Cancelled => "cancelled",
            SyncErrorCode::InvalidArgument => "invalid-argument",
            SyncErrorCode::DeadlineExceeded => "deadline-exceeded",
            SyncErrorCode::NotFound => "not-found",
            SyncErrorCode::PermissionDenied => "permission-denied",
            SyncErrorCode::ResourceExhausted => "resource-exhausted",
            SyncErrorCode::FailedPrecondition => "failed-precondition",
            SyncErrorCode::Aborted => "aborted",
            SyncErrorCode::Internal => "internal",
            SyncErrorCode::Unavailable => "unavailable",
            SyncErrorCode::Unauthenticated => "unauthenticated",
        }
    }

    pub fn from_grpc_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(SyncErrorCode::Cancelled),
            3 => Some(SyncErrorCode::InvalidArgument),
            4 => Some(SyncErrorCode::DeadlineExceeded),
            5 => Some(SyncErrorCode::NotFound),
            7 => Some(SyncErrorCode::PermissionDenied),
            8 => Some(SyncErrorCode::ResourceExhausted),
            9 => Some(SyncErrorCode::FailedPrecondition),
            10 => Some(SyncErrorCode::Aborted),
            13 => Some(SyncErrorCode::Internal),
            14 => Some(SyncErrorCode::Unavailable),
            16 => Some(SyncErrorCode::Unauthenticated),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SyncError {
    pub code: SyncErrorCode,
    message: String,
}

impl SyncError {
    pub fn new(code: SyncErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code.as_str()
    }

    /// Whether a stream error should stop retries. Transient network errors
    /// and auth errors are retried; everything else tears the stream down
    /// for good.
    pub fn is_permanent_stream_error(&self) -> bool {
        !matches!(
            self.code,
            SyncErrorCode::Unavailable
                | SyncErrorCode::DeadlineExceeded
                | SyncErrorCode::ResourceExhausted
                | SyncErrorCode::Internal
                | SyncErrorCode::Unauthenticated
                | SyncErrorCode::Aborted
        )
    }

    /// Persistence transaction failures with this code are re-run instead of
    /// propagated (lost-lease style failures).
    pub fn is_retryable_transaction_error(&self) -> bool {
        self.code == SyncErrorCode::Aborted
    }
}

impl Display for SyncError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code_str())
    }
}

impl Error for SyncError {}

pub type SyncResult<T> = Result<T, SyncError>;

pub fn cancelled(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::Cancelled, message)
}

pub fn invalid_argument(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::InvalidArgument, message)
}

pub fn deadline_exceeded(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::DeadlineExceeded, message)
}

pub fn not_found(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::NotFound, message)
}

pub fn permission_denied(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::PermissionDenied, message)
}

pub fn resource_exhausted(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::ResourceExhausted, message)
}

pub fn failed_precondition(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::FailedPrecondition, message)
}

pub fn aborted(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::Aborted, message)
}

pub fn internal_error(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::Internal, message)
}

pub fn unavailable(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::Unavailable, message)
}

pub fn unauthenticated(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::Unauthenticated, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_stream_errors() {
        assert!(!unavailable("down").is_permanent_stream_error());
        assert!(!unauthenticated("stale token").is_permanent_stream_error());
        assert!(permission_denied("nope").is_permanent_stream_error());
        assert!(invalid_argument("bad").is_permanent_stream_error());
    }

    #[test]
    fn maps_grpc_codes() {
        assert_eq!(
            SyncErrorCode::from_grpc_code(14),
            Some(SyncErrorCode::Unavailable)
        );
        assert_eq!(SyncErrorCode::from_grpc_code(99), None);
    }
}
