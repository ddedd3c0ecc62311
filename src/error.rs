use thiserror::Error;

/// Engine-wide error surface. Every public call fails with exactly one of
/// these kinds; nothing else escapes the crate boundary.
#[derive(Error, Debug)]
pub enum EntwineError {
    #[error("Schema error: {0}")]
    Schema(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Constraint error: {0}")]
    Constraint(String),
    #[error("Transaction error: {0}")]
    Transaction(String),
    #[error("Resolution error: {0}")]
    Resolution(String),
    #[error("Storage error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, EntwineError>;

// Helper conversions
impl From<rusqlite::Error> for EntwineError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(inner, _)
                if inner.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Self::Constraint(e.to_string())
            }
            _ => Self::Storage(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for EntwineError {
    fn from(e: serde_json::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<std::io::Error> for EntwineError {
    fn from(e: std::io::Error) -> Self {
        Self::Storage(e.to_string())
    }
}
