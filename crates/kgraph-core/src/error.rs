//! Error types for kgraph

use thiserror::Error;

/// Result type alias using kgraph's Error
pub type Result<T> = std::result::Result<T, Error>;

/// kgraph error types with stable codes and suggestions
#[derive(Error, Debug)]
pub enum Error {
    // Entity errors (E001-E099)
    #[error("Entity '{0}' not found for this agent. Run `kgraph stats` to check what is stored.")]
    EntityNotFound(String),

    // Input errors (E100-E199)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // Write errors (E200-E299)
    #[error("Write of exchange '{exchange}' aborted and rolled back: {reason}")]
    WriteFailed { exchange: String, reason: String },

    // Pattern errors (E300-E399)
    #[error("Invalid meta-path: {0}")]
    InvalidPattern(String),

    // Database errors (E400-E499)
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    // Config errors (E600-E699)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    // Cancellation (E700-E799)
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    // Generic errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::EntityNotFound(_) => "E001",
            Self::InvalidInput(_) => "E100",
            Self::WriteFailed { .. } => "E200",
            Self::InvalidPattern(_) => "E300",
            Self::DatabaseError(_) => "E400",
            Self::MigrationFailed(_) => "E401",
            Self::ConfigError(_) => "E600",
            Self::Cancelled(_) => "E700",
            Self::Serialization(_) | Self::Other(_) | Self::Io(_) => "E9999",
        }
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::EntityNotFound(name) => Some(format!("kgraph resolve \"{}\"", name)),
            Self::WriteFailed { .. } => Some("Retry the whole exchange".to_string()),
            Self::InvalidPattern(_) => {
                Some("Meta-paths take 2 or 3 canonical predicates".to_string())
            }
            Self::ConfigError(_) => Some("kgraph config list".to_string()),
            Self::MigrationFailed(_) => Some("Check the database file permissions".to_string()),
            _ => None,
        }
    }

    /// Whether the caller may retry the operation unchanged
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::WriteFailed { .. } => true,
            Self::DatabaseError(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
            ),
            _ => false,
        }
    }

    /// Wrap a storage failure that aborted an exchange batch
    pub fn write_failed(exchange: impl Into<String>, source: impl std::fmt::Display) -> Self {
        Self::WriteFailed {
            exchange: exchange.into(),
            reason: source.to_string(),
        }
    }
}
