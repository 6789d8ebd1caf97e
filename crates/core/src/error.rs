use thiserror::Error;

/// Error kinds surfaced across the worker.
///
/// Transport errors are absorbed inside the transport layer and only reach
/// callers as `false` send results or `is_connected() == false`; executor
/// errors become [`crate::models::ExecResult`] fields. These variants exist
/// for the seams where a typed error is the contract.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Recoverable network failure; callers retry with backoff.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// The peer violated the wire contract; the driver logs and closes.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An inbound message could not be understood; dropped and counted.
    #[error("bad message: {0}")]
    BadMessage(String),

    /// A per-run resource cap was exceeded; fatal for the run only.
    #[error("resource limit exceeded: {0}")]
    ResourceLimitExceeded(String),

    /// The run's wall-clock budget expired.
    #[error("timed out")]
    Timeout,

    /// The run was cancelled cooperatively.
    #[error("cancelled")]
    Cancelled,

    /// Unexpected internal failure; logged, surfaced as a FAILED result.
    #[error("internal error: {0}")]
    Internal(String),
}

impl WorkerError {
    /// Whether retrying the operation can help.
    pub fn is_transient(&self) -> bool {
        matches!(self, WorkerError::TransientNetwork(_))
    }
}
