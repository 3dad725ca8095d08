use axum::{
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde_json::json;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(sqlx::Error),

    #[error("Validation error: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Cannot transition attempt from '{from}' to '{to}'")]
    InvalidTransition { from: String, to: String },

    #[error("An attempt already exists for exam {exam_id} and user {user_id}")]
    DuplicateAttempt { exam_id: i64, user_id: i64 },

    #[error("Concurrent modification: {0}")]
    ConcurrentModification(String),

    #[error("Attempt not found: {0}")]
    AttemptNotFound(String),

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Exam {0} does not exist")]
    ExamNotFound(i64),

    #[error("Exam {0} is not active")]
    ExamNotActive(i64),

    #[error("Invalid value '{value}' for allowance '{key}'")]
    InvalidAllowanceValue { key: String, value: String },

    #[error("Operation not supported: {0}")]
    OperationNotSupported(String),

    #[error("Notification delivery failed after {attempts} attempts: {last_error}")]
    NotificationDeliveryFailed { attempts: u32, last_error: String },

    #[error("Proctoring provider error: {0}")]
    ProviderError(String),

    #[error("A review already exists for attempt code {0}")]
    ReviewAlreadyExists(String),
}

impl Error {
    /// Stable machine-readable reason. Safe to hand to unauthenticated callers.
    pub fn reason(&self) -> &'static str {
        match self {
            Error::Config(_) => "configuration_error",
            Error::BadRequest(_) => "bad_request",
            Error::Unauthorized(_) => "unauthorized",
            Error::NotFound(_) => "not_found",
            Error::Database(_) => "storage_error",
            Error::Validation(_) => "validation_failed",
            Error::Json(_) => "malformed_payload",
            Error::Reqwest(_) => "upstream_error",
            Error::Internal(_) => "internal_error",
            Error::Conflict(_) => "conflict",
            Error::InvalidTransition { .. } => "invalid_transition",
            Error::DuplicateAttempt { .. } => "duplicate_attempt",
            Error::ConcurrentModification(_) => "concurrent_modification",
            Error::AttemptNotFound(_) => "attempt_not_found",
            Error::UserNotFound(_) => "user_not_found",
            Error::ExamNotFound(_) => "exam_not_found",
            Error::ExamNotActive(_) => "exam_not_active",
            Error::InvalidAllowanceValue { .. } => "invalid_allowance_value",
            Error::OperationNotSupported(_) => "operation_not_supported",
            Error::NotificationDeliveryFailed { .. } => "notification_delivery_failed",
            Error::ProviderError(_) => "provider_error",
            Error::ReviewAlreadyExists(_) => "review_already_exists",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::BadRequest(_)
            | Error::Validation(_)
            | Error::Json(_)
            | Error::InvalidAllowanceValue { .. }
            | Error::ProviderError(_) => StatusCode::BAD_REQUEST,
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::NotFound(_)
            | Error::AttemptNotFound(_)
            | Error::UserNotFound(_)
            | Error::ExamNotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_)
            | Error::InvalidTransition { .. }
            | Error::DuplicateAttempt { .. }
            | Error::ConcurrentModification(_)
            | Error::ReviewAlreadyExists(_) => StatusCode::CONFLICT,
            Error::ExamNotActive(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::OperationNotSupported(_) => StatusCode::METHOD_NOT_ALLOWED,
            Error::Reqwest(_) | Error::NotificationDeliveryFailed { .. } => StatusCode::BAD_GATEWAY,
            Error::Config(_) | Error::Database(_) | Error::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let error_message = match &self {
            Error::Config(_) | Error::Database(_) | Error::Internal(_) => {
                tracing::error!(error = %self, "request failed");
                "An unexpected error occurred".to_string()
            }
            other => other.to_string(),
        };

        let body = Json(json!({ "error": error_message, "reason": self.reason() }));
        (status, body).into_response()
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Error::NotFound("Resource not found".to_string()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Error::Conflict(db.message().to_string())
            }
            other => Error::Database(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasons_are_stable_for_unauthenticated_callers() {
        assert_eq!(
            Error::AttemptNotFound("abc".into()).reason(),
            "attempt_not_found"
        );
        assert_eq!(
            Error::ProviderError("bad locator".into()).reason(),
            "provider_error"
        );
    }

    #[test]
    fn state_errors_map_to_conflict() {
        let err = Error::InvalidTransition {
            from: "verified".into(),
            to: "started".into(),
        };
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
        assert_eq!(
            Error::ConcurrentModification("attempt 1".into()).status_code(),
            StatusCode::CONFLICT
        );
    }
}
