//! Cadence error type.

/// Convenience alias used across all Cadence crates.
pub type Result<T> = std::result::Result<T, CadenceError>;

/// Errors surfaced by the engine and its collaborators.
///
/// Per-entity failures (recipient resolution, spawn) are recoverable:
/// the controller logs them and moves on to the next entity rather
/// than aborting a batch.
#[derive(Debug, thiserror::Error)]
pub enum CadenceError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Recipient not found: {0}")]
    RecipientNotFound(String),

    #[error("Spawn failed: {0}")]
    Spawn(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
