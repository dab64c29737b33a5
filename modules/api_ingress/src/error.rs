use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use extkit::ExtError;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("internal error")]
    Internal(#[source] anyhow::Error),
}

impl AppError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            AppError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            AppError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        }
    }

    /// Attach the request id so the error body can be correlated with logs.
    pub fn with_request_id(self, request_id: impl Into<String>) -> ErrorResponse {
        ErrorResponse::from_error(self, Some(request_id.into()))
    }
}

impl From<ExtError> for AppError {
    fn from(err: ExtError) -> Self {
        match err {
            ExtError::NotFound(_) | ExtError::NotLoaded(_) | ExtError::RecordNotFound(_) => {
                AppError::NotFound(err.to_string())
            }
            ExtError::AlreadyLoaded(_) => AppError::Conflict(err.to_string()),
            ExtError::InvalidName(_) => AppError::BadRequest(err.to_string()),
            other => AppError::Internal(other.into()),
        }
    }
}

/// JSON body of every error the ingress produces.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    #[serde(skip)]
    status: StatusCode,
    pub code: &'static str,
    pub message: String,
    /// RFC3339
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[cfg(feature = "debug-errors")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    fn from_error(err: AppError, request_id: Option<String>) -> Self {
        let (status, code) = err.status_and_code();
        let rid = request_id.as_deref().unwrap_or("n/a");
        match &err {
            AppError::Internal(source) => {
                tracing::error!(request_id = %rid, error = %source, status = status.as_u16(), "request failed")
            }
            other => {
                tracing::warn!(request_id = %rid, error = %other, status = status.as_u16(), "request failed")
            }
        }
        Self {
            status,
            code,
            message: err.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            request_id,
            #[cfg(feature = "debug-errors")]
            details: match &err {
                AppError::Internal(source) => Some(format!("{source:#}")),
                _ => None,
            },
        }
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        ErrorResponse::from_error(self, None).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_errors_map_to_statuses() {
        let cases = [
            (ExtError::NotLoaded("a".into()), StatusCode::NOT_FOUND),
            (ExtError::AlreadyLoaded("a".into()), StatusCode::CONFLICT),
            (ExtError::InvalidName("../a".into()), StatusCode::BAD_REQUEST),
            (ExtError::SchedulerStopped, StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).into_response().status(), status);
        }
    }

    #[test]
    fn internal_message_is_not_leaked() {
        let err = AppError::Internal(anyhow::anyhow!("db password wrong"));
        let body = serde_json::to_value(err.with_request_id("r-1")).unwrap();
        assert_eq!(body["message"], "internal error");
        assert_eq!(body["code"], "internal_error");
        assert_eq!(body["request_id"], "r-1");
    }
}
