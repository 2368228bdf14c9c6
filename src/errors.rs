use http::StatusCode;
use sea_orm::error::DbErr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sub-kind for a declined card charge, as reported by the payment processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeclineKind {
    FraudBlocked,
    CardDeclined,
    ExpiredCard,
    Other,
}

impl std::fmt::Display for DeclineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeclineKind::FraudBlocked => "fraud-blocked",
            DeclineKind::CardDeclined => "card-declined",
            DeclineKind::ExpiredCard => "expired-card",
            DeclineKind::Other => "other-processor-error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sea_orm::error::DbErr),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Quantity out of range: {0}")]
    QuantityOutOfRange(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Duplicate subscription: {0}")]
    DuplicateSubscription(String),

    #[error("Payment declined ({kind}): {message}")]
    PaymentDeclined { kind: DeclineKind, message: String },

    #[error("Refund failed: {0}")]
    RefundFailed(String),

    #[error("Insufficient wallet balance: {0}")]
    InsufficientWalletBalance(String),

    #[error("Tax lookup failed: {0}")]
    TaxLookupFailed(String),

    #[error("External service error: {0}")]
    ExternalServiceError(String),

    #[error("Concurrent modification: {0}")]
    ConcurrentModification(Uuid),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

pub trait IntoDbErr {
    fn into_db_err(self) -> DbErr;
}

impl IntoDbErr for DbErr {
    fn into_db_err(self) -> DbErr {
        self
    }
}

impl IntoDbErr for String {
    fn into_db_err(self) -> DbErr {
        DbErr::Custom(self)
    }
}

impl IntoDbErr for &str {
    fn into_db_err(self) -> DbErr {
        DbErr::Custom(self.to_string())
    }
}

impl ServiceError {
    /// Generic constructor that normalizes any supported database error input.
    pub fn db_error<E: IntoDbErr>(error: E) -> Self {
        ServiceError::DatabaseError(error.into_db_err())
    }

    /// Returns the HTTP status code for this error.
    /// This is the single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::DatabaseError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ValidationError(_) | Self::QuantityOutOfRange(_) | Self::InvalidOperation(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::Conflict(_) | Self::DuplicateSubscription(_) | Self::ConcurrentModification(_) => {
                StatusCode::CONFLICT
            }
            Self::PaymentDeclined { .. } => StatusCode::PAYMENT_REQUIRED,
            Self::InsufficientWalletBalance(_) | Self::RefundFailed(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Self::TaxLookupFailed(_) | Self::ExternalServiceError(_) => StatusCode::BAD_GATEWAY,
            Self::InternalError(_) | Self::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns the error message suitable for caller-facing responses.
    /// Internal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::InternalError(_) | Self::Other(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}
