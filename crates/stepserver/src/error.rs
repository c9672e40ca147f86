use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde::Serialize;
use stepcore::{sanitize, FlowError, ValidationIssue};

/// Error body returned by every endpoint.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<ValidationIssue>>,
}

/// Wraps engine errors so handlers can use `?`.
#[derive(Debug)]
pub struct ApiError(pub FlowError);

impl From<FlowError> for ApiError {
    fn from(e: FlowError) -> Self {
        ApiError(e)
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", sanitize(&self.0.to_string()))
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match &self.0 {
            FlowError::NotFound(_) => StatusCode::NOT_FOUND,
            FlowError::Validation(_) | FlowError::Serialization(_) => StatusCode::BAD_REQUEST,
            FlowError::Duplicate(_) | FlowError::Conflict(_) => StatusCode::CONFLICT,
            FlowError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            FlowError::Action(_) | FlowError::Execution(_) | FlowError::Config(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        let errors = match &self.0 {
            FlowError::Validation(report) => Some(report.errors.clone()),
            _ => None,
        };
        HttpResponse::build(self.status_code()).json(ErrorResponse {
            error: self.0.kind(),
            message: self.to_string(),
            errors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepcore::NotFoundError;

    #[test]
    fn maps_kinds_to_status_codes() {
        let missing = ApiError(NotFoundError::Workflow("nightly".into()).into());
        assert_eq!(missing.status_code(), StatusCode::NOT_FOUND);

        let taken = ApiError(FlowError::Duplicate("nightly".into()));
        assert_eq!(taken.status_code(), StatusCode::CONFLICT);
    }

    #[test]
    fn messages_are_redacted() {
        let err = ApiError(FlowError::Execution("connect postgres://app:hunter2@db/prod".into()));
        assert!(!err.to_string().contains("hunter2"));
    }
}
