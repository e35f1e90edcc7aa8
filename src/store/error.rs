use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("query timed out after {0:?}")]
    Timeout(Duration),

    #[error("query rejected: {0}")]
    Rejected(String),

    #[error("snapshot requires a file-backed store")]
    InMemoryStore,

    #[error("store is closed")]
    Closed,
}

impl StoreError {
    /// True for overload-shaped failures that a caller should retry later.
    pub fn is_overload(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Db(sqlx::Error::PoolTimedOut))
    }

    /// Message safe to expose on the wire; engine internals stay in the logs.
    pub fn wire_message(&self) -> String {
        match self {
            Self::Rejected(msg) => format!("query rejected: {msg}"),
            Self::Timeout(_) | Self::Db(sqlx::Error::PoolTimedOut) => {
                "query overloaded, retry later".to_string()
            }
            Self::InMemoryStore => self.to_string(),
            _ => "query failed".to_string(),
        }
    }
}
