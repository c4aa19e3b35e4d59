//! Domain error taxonomy for the booking/escrow/wallet core.
//!
//! Services return these as structured failures; the HTTP layer turns them
//! into the uniform `{success, message, data}` body, and workers log and
//! defer to the next tick. Gateway internals never leak through `message`.

use axum::http::StatusCode;
use thiserror::Error;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Authorization(String),

    /// Transition precondition no longer holds (optimistic check lost).
    #[error("{0}")]
    InvalidState(String),

    /// Unit already held by another pending/active booking.
    #[error("{0}")]
    Conflict(String),

    #[error("Insufficient balance")]
    InsufficientBalance,

    /// Gateway mismatch or failure; the operation is safe to retry.
    #[error("{0}")]
    PaymentVerification(String),

    /// DB/network blip, retryable by the caller or the next worker tick.
    #[error("{0}")]
    Transient(String),
}

impl CoreError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::Authorization(_) => StatusCode::FORBIDDEN,
            CoreError::InvalidState(_) | CoreError::Conflict(_) => StatusCode::CONFLICT,
            CoreError::InsufficientBalance => StatusCode::BAD_REQUEST,
            CoreError::PaymentVerification(_) => StatusCode::BAD_GATEWAY,
            CoreError::Transient(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        CoreError::NotFound(what.into())
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        CoreError::InvalidState(message.into())
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => CoreError::NotFound("Record not found".to_string()),
            other => {
                tracing::error!(error = %other, "database error");
                CoreError::Transient("Database error".to_string())
            }
        }
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(err: reqwest::Error) -> Self {
        tracing::warn!(error = %err, "gateway request failed");
        if err.is_timeout() {
            CoreError::Transient("Payment gateway timed out".to_string())
        } else {
            CoreError::Transient("Payment gateway unreachable".to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_taxonomy() {
        assert_eq!(
            CoreError::not_found("x").status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            CoreError::Authorization("no".into()).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            CoreError::Conflict("held".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            CoreError::InsufficientBalance.status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn db_errors_do_not_leak_internals() {
        let err: CoreError = sqlx::Error::PoolTimedOut.into();
        assert_eq!(err.to_string(), "Database error");
    }
}
