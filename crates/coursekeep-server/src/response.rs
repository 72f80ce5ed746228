use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use coursekeep_engine::EngineError;

/// Wire envelope for every endpoint: `{ success, data?, error?: { code, message } }`.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}

pub const NOT_FOUND: &str = "NOT_FOUND";
pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
pub const SINK_ERROR: &str = "SINK_ERROR";
pub const CAPACITY_EXCEEDED: &str = "CAPACITY_EXCEEDED";
pub const STORE_ERROR: &str = "STORE_ERROR";
pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";

/// Error half of the envelope, with the HTTP status it is sent with.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, VALIDATION_ERROR, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, NOT_FOUND, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR, message)
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let (status, code) = match &err {
            EngineError::NotFound(_) => (StatusCode::NOT_FOUND, NOT_FOUND),
            EngineError::Validation(_) => (StatusCode::BAD_REQUEST, VALIDATION_ERROR),
            EngineError::Sink(_) => (StatusCode::BAD_GATEWAY, SINK_ERROR),
            EngineError::Capacity(_) => (StatusCode::PAYLOAD_TOO_LARGE, CAPACITY_EXCEEDED),
            EngineError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, STORE_ERROR),
        };
        if status.is_server_error() {
            tracing::error!(error = %err, "request failed");
        }
        Self::new(status, code, err.to_string())
    }
}

/// Malformed or oversized JSON bodies keep the envelope shape.
impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        let status = rejection.status();
        if status == StatusCode::PAYLOAD_TOO_LARGE {
            Self::new(status, CAPACITY_EXCEEDED, rejection.body_text())
        } else {
            Self::new(StatusCode::BAD_REQUEST, VALIDATION_ERROR, rejection.body_text())
        }
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::validation(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(ErrorBody {
                code: self.code.to_string(),
                message: self.message,
            }),
        };
        (self.status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<ApiResponse<T>, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_omits_error() {
        let json = serde_json::to_value(ApiResponse::ok(serde_json::json!({"a": 1}))).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["data"]["a"], 1);
        assert!(json.get("error").is_none());
    }

    #[test]
    fn engine_errors_map_to_status() {
        let cases = [
            (EngineError::NotFound("session x".into()), StatusCode::NOT_FOUND, NOT_FOUND),
            (EngineError::Validation("bad".into()), StatusCode::BAD_REQUEST, VALIDATION_ERROR),
            (EngineError::Sink("down".into()), StatusCode::BAD_GATEWAY, SINK_ERROR),
            (
                EngineError::Capacity("too many".into()),
                StatusCode::PAYLOAD_TOO_LARGE,
                CAPACITY_EXCEEDED,
            ),
        ];
        for (err, status, code) in cases {
            let api: ApiError = err.into();
            assert_eq!(api.status, status);
            assert_eq!(api.code, code);
        }
    }

    #[tokio::test]
    async fn error_response_body_shape() {
        let resp = ApiError::not_found("session sess_1").into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["success"], false);
        assert_eq!(parsed["error"]["code"], "NOT_FOUND");
        assert_eq!(parsed["error"]["message"], "session sess_1");
        assert!(parsed.get("data").is_none());
    }
}
