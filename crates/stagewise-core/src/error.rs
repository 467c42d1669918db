//! Error types for Stagewise

use thiserror::Error;

/// Result type alias using Stagewise's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Stagewise error types with stable codes and suggestions
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors (E001-E099)
    #[error("Configuration error: {0}")]
    Configuration(String),

    // Backend errors (E100-E199)
    #[error("Transient backend error from '{backend}': {message}")]
    TransientBackend { backend: String, message: String },

    #[error("Permanent backend error from '{backend}': {message}")]
    PermanentBackend { backend: String, message: String },

    #[error("Circuit open for backend '{0}'. Calls are rejected until the cooldown elapses.")]
    CircuitOpen(String),

    // Budget errors (E200-E299)
    #[error("Budget exceeded for tenant '{tenant}' (requested ${requested:.4}, available ${available:.4})")]
    BudgetExceeded {
        tenant: String,
        requested: f64,
        available: f64,
    },

    // Cache errors (E300-E399)
    #[error("Cache unavailable: {0}")]
    CacheUnavailable(String),

    #[error("Cache population for '{key}' failed: {reason}")]
    PopulationFailed { key: String, reason: String },

    // Persistence errors (E400-E499)
    #[error("Persistence unavailable: {0}")]
    PersistenceUnavailable(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Run control errors (E500-E599)
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Deadline exceeded")]
    DeadlineExceeded,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Shorthand for a persistence error
    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::PersistenceUnavailable(msg.into())
    }

    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "E001",
            Self::TransientBackend { .. } => "E100",
            Self::PermanentBackend { .. } => "E101",
            Self::CircuitOpen(_) => "E102",
            Self::BudgetExceeded { .. } => "E200",
            Self::CacheUnavailable(_) => "E300",
            Self::PopulationFailed { .. } => "E301",
            Self::PersistenceUnavailable(_) => "E400",
            Self::Database(_) => "E401",
            Self::Serialization(_) => "E402",
            Self::Cancelled => "E500",
            Self::DeadlineExceeded => "E501",
            Self::Io(_) => "E9999",
        }
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::Configuration(_) => Some("stagewise config list".to_string()),
            Self::BudgetExceeded { tenant, .. } => Some(format!(
                "stagewise config set tenants.{}.budget_ceiling <amount>",
                tenant
            )),
            Self::CircuitOpen(_) => Some("Wait for the breaker cooldown or route to another arm".to_string()),
            Self::PersistenceUnavailable(_) | Self::Database(_) => {
                Some("Check the durable store; in-memory state keeps serving".to_string())
            }
            _ => None,
        }
    }

    /// Whether the error is worth retrying at the backend call level
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientBackend { .. })
    }

    /// Whether the error stops the whole pipeline rather than a single stage
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}
