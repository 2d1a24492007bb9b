use std::error::Error;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Status categories shared by local failures and errors reported by the remote authority.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncErrorCode {
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

impl SyncErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncErrorCode::Cancelled => "docsync/cancelled",
            SyncErrorCode::Unknown => "docsync/unknown",
            SyncErrorCode::InvalidArgument => "docsync/invalid-argument",
            SyncErrorCode::DeadlineExceeded => "docsync/deadline-exceeded",
            SyncErrorCode::NotFound => "docsync/not-found",
            SyncErrorCode::AlreadyExists => "docsync/already-exists",
            SyncErrorCode::PermissionDenied => "docsync/permission-denied",
            SyncErrorCode::ResourceExhausted => "docsync/resource-exhausted",
            SyncErrorCode::FailedPrecondition => "docsync/failed-precondition",
            SyncErrorCode::Aborted => "docsync/aborted",
            SyncErrorCode::OutOfRange => "docsync/out-of-range",
            SyncErrorCode::Unimplemented => "docsync/unimplemented",
            SyncErrorCode::Internal => "docsync/internal",
            SyncErrorCode::Unavailable => "docsync/unavailable",
            SyncErrorCode::DataLoss => "docsync/data-loss",
            SyncErrorCode::Unauthenticated => "docsync/unauthenticated",
        }
    }

    /// Maps a numeric status code as carried on the wire.
    pub fn from_status(code: i64) -> Self {
        match code {
            1 => SyncErrorCode::Cancelled,
            2 => SyncErrorCode::Unknown,
            3 => SyncErrorCode::InvalidArgument,
            4 => SyncErrorCode::DeadlineExceeded,
            5 => SyncErrorCode::NotFound,
            6 => SyncErrorCode::AlreadyExists,
            7 => SyncErrorCode::PermissionDenied,
            8 => SyncErrorCode::ResourceExhausted,
            9 => SyncErrorCode::FailedPrecondition,
            10 => SyncErrorCode::Aborted,
            11 => SyncErrorCode::OutOfRange,
            12 => SyncErrorCode::Unimplemented,
            13 => SyncErrorCode::Internal,
            14 => SyncErrorCode::Unavailable,
            15 => SyncErrorCode::DataLoss,
            16 => SyncErrorCode::Unauthenticated,
            _ => SyncErrorCode::Unknown,
        }
    }

    pub fn to_status(&self) -> i64 {
        match self {
            SyncErrorCode::Cancelled => 1,
            SyncErrorCode::Unknown => 2,
            SyncErrorCode::InvalidArgument => 3,
            SyncErrorCode::DeadlineExceeded => 4,
            SyncErrorCode::NotFound => 5,
            SyncErrorCode::AlreadyExists => 6,
            SyncErrorCode::PermissionDenied => 7,
            SyncErrorCode::ResourceExhausted => 8,
            SyncErrorCode::FailedPrecondition => 9,
            SyncErrorCode::Aborted => 10,
            SyncErrorCode::OutOfRange => 11,
            SyncErrorCode::Unimplemented => 12,
            SyncErrorCode::Internal => 13,
            SyncErrorCode::Unavailable => 14,
            SyncErrorCode::DataLoss => 15,
            SyncErrorCode::Unauthenticated => 16,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
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

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Errors raised by an aborted persistence transaction. The serial queue
    /// retries these transparently for operations enqueued as retryable.
    pub fn is_transient_persistence_error(&self) -> bool {
        matches!(self.code, SyncErrorCode::Aborted | SyncErrorCode::Unavailable)
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

pub fn internal_error(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::Internal, message)
}

pub fn not_found(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::NotFound, message)
}

pub fn failed_precondition(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::FailedPrecondition, message)
}

pub fn permission_denied(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::PermissionDenied, message)
}

pub fn unauthenticated(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::Unauthenticated, message)
}

pub fn unavailable(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::Unavailable, message)
}

pub fn aborted(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::Aborted, message)
}

pub fn resource_exhausted(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::ResourceExhausted, message)
}

pub fn deadline_exceeded(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::DeadlineExceeded, message)
}
