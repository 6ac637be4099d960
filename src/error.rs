use thiserror::Error;

/// Failures of the batching transform. Raised before any window is cut.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BatchError {
    #[error("batch size must be positive")]
    InvalidBatchSize,

    #[error("cannot batchify an empty token stream")]
    EmptyStream,

    #[error("window length must be positive")]
    InvalidWindowLength,
}
