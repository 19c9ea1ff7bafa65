use std::io;

use thiserror::Error;

use crate::method::CallType;
use crate::native::{CallError, EngineError};
use crate::status::StatusCode;
use crate::tag::Tag;

/// Errors returned by tagline.
#[derive(Debug, Error)]
pub enum Error {
    /// The engine rejected a batch at submission. Not retried.
    #[error("batch submission failed: {0}")]
    BatchSubmissionFailed(#[from] CallError),
    /// The pluck deadline elapsed before the batch completed.
    #[error("timed out waiting for completion")]
    TimedOut,
    /// The completion queue left `Active` while the operation was pending.
    #[error("completion queue is shutting down")]
    QueueShuttingDown,
    /// The completion queue has fully shut down.
    #[error("completion queue is shut down")]
    QueueShutdown,
    /// Shutdown was already requested on this queue.
    #[error("completion queue shutdown already requested")]
    AlreadyShuttingDown,
    /// A batch is still outstanding on the call.
    #[error("a batch is already outstanding on this call")]
    BatchOutstanding,
    /// The batch completed but the engine reported failure.
    #[error("batch completed unsuccessfully")]
    BatchFailed,
    /// No waiter is registered for the tag.
    #[error("unknown tag {0}")]
    UnknownTag(Tag),
    /// The peer finished the call with a non-OK status.
    #[error("call finished with status {status}: {details}")]
    BadStatusCode { status: StatusCode, details: String },
    /// Decoded results did not match the requested operations.
    #[error("unexpected result shape: {0}")]
    Unknown(String),
    /// Only unary calls are supported.
    #[error("unsupported call type: {0:?}")]
    UnsupportedCallType(CallType),
    /// Invalid client or server configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Channel or server setup failed.
    #[error("engine: {0}")]
    Engine(#[from] EngineError),
    /// Thread spawn or other OS failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Status code carried by a [`BadStatusCode`](Self::BadStatusCode) error.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::BadStatusCode { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display() {
        let err = Error::BadStatusCode {
            status: StatusCode::PermissionDenied,
            details: "TestStatus".into(),
        };
        assert_eq!(
            err.to_string(),
            "call finished with status PERMISSION_DENIED: TestStatus"
        );
        assert_eq!(err.status(), Some(StatusCode::PermissionDenied));

        let err = Error::from(CallError::AlreadyFinished);
        assert_eq!(err.to_string(), "batch submission failed: call already finished");
        assert_eq!(err.status(), None);
    }
}
