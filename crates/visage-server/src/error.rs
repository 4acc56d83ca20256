//! API error handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// API error type for the HTTP endpoints.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: msg.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "message": self.message,
                "type": match self.status {
                    StatusCode::BAD_REQUEST => "invalid_request_error",
                    StatusCode::NOT_FOUND => "not_found_error",
                    StatusCode::TOO_MANY_REQUESTS => "capacity_error",
                    _ => "server_error",
                },
                "code": self.status.as_str()
            }
        }));
        (self.status, body).into_response()
    }
}

impl From<visage_core::Error> for ApiError {
    fn from(err: visage_core::Error) -> Self {
        use visage_core::Error;
        match &err {
            Error::Validation(_) => ApiError::bad_request(err.to_string()),
            Error::Capacity(_) => ApiError {
                status: StatusCode::TOO_MANY_REQUESTS,
                message: err.to_string(),
            },
            _ => ApiError::internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_error_status_mapping() {
        let err: ApiError = visage_core::Error::Validation("bad".into()).into();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);

        let err: ApiError = visage_core::Error::Capacity("full".into()).into();
        assert_eq!(err.status, StatusCode::TOO_MANY_REQUESTS);

        let err: ApiError = visage_core::Error::Internal("boom".into()).into();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
