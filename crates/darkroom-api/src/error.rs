//! Error envelope returned by the API server
//!
//! Every failure is answered with `{"message": ..., "error": ...}` where
//! `message` says what the handler was doing and `error` carries the cause.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use darkroom_common::Error;

/// A failed API request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    /// HTTP status of the response
    pub status: StatusCode,
    /// What the handler was trying to do
    pub message: String,
    /// Why it failed
    pub error: String,
}

#[derive(Serialize)]
struct Envelope<'a> {
    message: &'a str,
    error: &'a str,
}

impl ApiError {
    /// Wrap a store or validation error
    ///
    /// Rejected specs map to 422, missing objects to 404, API server errors
    /// keep their own status, and everything else is a failed dependency.
    pub fn new(message: impl Into<String>, err: &Error) -> Self {
        let status = match err {
            Error::Invalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            other => other
                .api_status_code()
                .and_then(|code| StatusCode::from_u16(code).ok())
                .unwrap_or(StatusCode::FAILED_DEPENDENCY),
        };
        Self {
            status,
            message: message.into(),
            error: store_message(err),
        }
    }

    /// The request body could not be decoded
    pub fn malformed(message: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            message: message.into(),
            error: detail.into(),
        }
    }
}

// API server errors carry a human readable message of their own; prefer it
// over the wrapped Display, which adds our prefixes.
fn store_message(err: &Error) -> String {
    match err {
        Error::Kube {
            source: kube::Error::Api(ae),
        } => ae.message.clone(),
        other => other.to_string(),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Envelope {
            message: &self.message,
            error: &self.error,
        };
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use darkroom_common::validation::{ErrorList, FieldError, FieldPath, InvalidError};
    use kube::core::ErrorResponse;

    fn api_error(code: u16, message: &str) -> Error {
        Error::from(kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: message.to_string(),
            reason: "Reason".to_string(),
            code,
        }))
    }

    #[test]
    fn api_server_errors_keep_their_status_and_message() {
        let err = ApiError::new(
            "Unable to create instance",
            &api_error(409, r#"darkrooms.deployments.gojek.io "gallery" already exists"#),
        );
        assert_eq!(err.status, StatusCode::CONFLICT);
        assert_eq!(
            err.error,
            r#"darkrooms.deployments.gojek.io "gallery" already exists"#
        );
    }

    #[test]
    fn unstructured_errors_are_failed_dependencies() {
        let err = ApiError::new(
            "Unable to list darkrooms instances",
            &Error::internal("connection reset"),
        );
        assert_eq!(err.status, StatusCode::FAILED_DEPENDENCY);
        assert!(err.error.contains("connection reset"));
    }

    #[test]
    fn rejected_specs_are_unprocessable() {
        let mut errors = ErrorList::default();
        errors.push(FieldError::required(
            &FieldPath::new("spec").child("source").child("bucket"),
            "field required with Type S3",
        ));
        let invalid = Error::from(InvalidError {
            name: "gallery".to_string(),
            errors,
        });

        let err = ApiError::new("Unable to create instance", &invalid);
        assert_eq!(err.status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(
            err.error,
            r#"Darkroom.deployments.gojek.io "gallery" is invalid: spec.source.bucket: Required value: field required with Type S3"#
        );
    }

    #[test]
    fn missing_objects_are_not_found() {
        let err = ApiError::new(
            "Unable to get instance gallery",
            &Error::not_found("darkrooms", "default", "gallery"),
        );
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn envelope_has_message_and_error() {
        let response = ApiError::malformed("Unable to create instance", "expected value").into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "message": "Unable to create instance",
                "error": "expected value"
            })
        );
    }
}
