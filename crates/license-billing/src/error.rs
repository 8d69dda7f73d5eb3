use thiserror::Error;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Validation failed for {field}: {message}")]
    ValidationError { field: String, message: String },

    #[error("Concurrent modification during {operation}: {message}")]
    ConcurrencyConflict { operation: String, message: String },

    #[error("License not found: {id}")]
    LicenseNotFound { id: String },

    #[error("Usage group {group} is not defined for license {license}")]
    UsageGroupNotFound { license: String, group: String },

    #[error("Plan not found: {id}")]
    PlanNotFound { id: String },

    #[error("Invalid license status transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Database error during {operation}: {source}")]
    DatabaseError {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },
}

impl BillingError {
    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        Self::ValidationError {
            field: field.to_string(),
            message: message.into(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, BillingError::ConcurrencyConflict { .. })
    }

    /// Classifies a sqlx error raised by `operation`.
    ///
    /// Unique violations, lock timeouts, serialization failures and deadlocks
    /// are reported as conflicts so callers can retry with a fresh read.
    pub fn from_sqlx(operation: &str, error: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_error) = &error {
            if let Some(code) = db_error.code() {
                if matches!(code.as_ref(), "23505" | "55P03" | "40001" | "40P01") {
                    return BillingError::ConcurrencyConflict {
                        operation: operation.to_string(),
                        message: db_error.message().to_string(),
                    };
                }
            }
        }

        BillingError::DatabaseError {
            operation: operation.to_string(),
            source: Box::new(error),
        }
    }
}

pub type Result<T> = std::result::Result<T, BillingError>;
