//! Error taxonomy shared across the commit pipeline.

use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    // Client-visible commit outcomes.
    #[error("transaction not committed due to conflict with another transaction")]
    NotCommitted,
    #[error("transaction is too old to perform reads or be committed")]
    TransactionTooOld,
    #[error("batch-priority transaction throttled")]
    BatchTransactionThrottled,
    #[error("commit proxy memory limit exceeded")]
    ProxyMemoryLimitExceeded,

    // Transport / lifecycle.
    #[error("peer endpoint dropped before replying")]
    BrokenPromise,
    #[error("operation cancelled")]
    OperationCancelled,
    #[error("request is superseded by a newer one in the same stream")]
    OperationObsolete,
    #[error("operation timed out")]
    Timeout,

    // Recovery-fatal.
    #[error("master terminated because a transaction log failed")]
    MasterTlogFailed,
    #[error("worker removed from the cluster")]
    WorkerRemoved,
    #[error("transaction log was stopped")]
    TlogStopped,
    #[error("coordinators changed")]
    CoordinatorsChanged,

    // Data.
    #[error("end of stream")]
    EndOfStream,
    #[error("commit version already applied")]
    DuplicateVersion,
    #[error("internal error: {0}")]
    Internal(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Errors that terminate the proxy rather than a single request.
    pub fn is_recovery_fatal(&self) -> bool {
        matches!(
            self,
            Error::MasterTlogFailed
                | Error::WorkerRemoved
                | Error::TlogStopped
                | Error::CoordinatorsChanged
        )
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::BrokenPromise
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for Error {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Error::BrokenPromise
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(Error::MasterTlogFailed.is_recovery_fatal());
        assert!(Error::TlogStopped.is_recovery_fatal());
        assert!(!Error::NotCommitted.is_recovery_fatal());
        assert!(!Error::OperationObsolete.is_recovery_fatal());
    }
}
