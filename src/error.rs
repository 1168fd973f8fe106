use thiserror::Error;

use crate::construct::TagId;

#[derive(Error, Debug)]
pub enum TagDbError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Persistence error: {0}")]
    Persistence(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Multiple tags found for '{keyword}': {matches:?}")]
    Ambiguous { keyword: String, matches: Vec<TagId> },
    #[error("Lock poisoned: {0}")]
    Lock(String),
    #[error("Operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, TagDbError>;

impl TagDbError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
    /// Maps storage-engine constraint failures onto the domain taxonomy.
    /// Anything else stays a persistence error.
    pub fn from_write(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::SqliteFailure(ref err, ref message)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Self::Validation(format!(
                    "constraint violated: {}",
                    message.clone().unwrap_or_else(|| err.to_string())
                ))
            }
            other => Self::Persistence(other.to_string()),
        }
    }
}

// Helper conversions
impl From<rusqlite::Error> for TagDbError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Persistence(e.to_string())
    }
}

impl From<serde_json::Error> for TagDbError {
    fn from(e: serde_json::Error) -> Self {
        Self::Persistence(e.to_string())
    }
}

impl From<config::ConfigError> for TagDbError {
    fn from(e: config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}
