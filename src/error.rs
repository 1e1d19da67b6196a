use thiserror::Error;

/// Any failure coming back from the store: connection, constraint or timeout.
#[derive(Debug, Error)]
#[error("persistence failure")]
pub struct PersistenceError(#[from] pub sqlx::Error);
