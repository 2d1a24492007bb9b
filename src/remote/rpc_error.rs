use crate::error::{SyncError, SyncErrorCode};

/// Whether an error ends the operation for good. Transient categories are
/// retried by the stream machinery.
pub fn is_permanent_error(code: SyncErrorCode) -> bool {
    match code {
        SyncErrorCode::Cancelled
        | SyncErrorCode::Unknown
        | SyncErrorCode::DeadlineExceeded
        | SyncErrorCode::ResourceExhausted
        | SyncErrorCode::Internal
        | SyncErrorCode::Unavailable
        | SyncErrorCode::Unauthenticated => false,
        SyncErrorCode::InvalidArgument
        | SyncErrorCode::NotFound
        | SyncErrorCode::AlreadyExists
        | SyncErrorCode::PermissionDenied
        | SyncErrorCode::FailedPrecondition
        | SyncErrorCode::Aborted
        | SyncErrorCode::OutOfRange
        | SyncErrorCode::Unimplemented
        | SyncErrorCode::DataLoss => true,
    }
}

/// Write failures that reject the batch. An aborted commit is retried even
/// though aborts are otherwise permanent.
pub fn is_permanent_write_error(code: SyncErrorCode) -> bool {
    is_permanent_error(code) && code != SyncErrorCode::Aborted
}

/// Maps a numeric status received on the wire.
pub fn map_status(code: i64, message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::from_status(code), message)
}

/// Maps a textual status such as `"UNAVAILABLE"`.
pub fn map_status_name(status: &str, message: impl Into<String>) -> SyncError {
    let code = match status {
        "OK" | "CANCELLED" => SyncErrorCode::Cancelled,
        "INVALID_ARGUMENT" => SyncErrorCode::InvalidArgument,
        "DEADLINE_EXCEEDED" => SyncErrorCode::DeadlineExceeded,
        "NOT_FOUND" => SyncErrorCode::NotFound,
        "ALREADY_EXISTS" => SyncErrorCode::AlreadyExists,
        "PERMISSION_DENIED" => SyncErrorCode::PermissionDenied,
        "RESOURCE_EXHAUSTED" => SyncErrorCode::ResourceExhausted,
        "FAILED_PRECONDITION" => SyncErrorCode::FailedPrecondition,
        "ABORTED" => SyncErrorCode::Aborted,
        "OUT_OF_RANGE" => SyncErrorCode::OutOfRange,
        "UNIMPLEMENTED" => SyncErrorCode::Unimplemented,
        "INTERNAL" => SyncErrorCode::Internal,
        "UNAVAILABLE" => SyncErrorCode::Unavailable,
        "DATA_LOSS" => SyncErrorCode::DataLoss,
        "UNAUTHENTICATED" => SyncErrorCode::Unauthenticated,
        _ => SyncErrorCode::Unknown,
    };
    SyncError::new(code, message)
}
