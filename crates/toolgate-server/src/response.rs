//! Maps [`GatewayError`] onto HTTP responses, the way the
//! teacher's `ServerError`/`McpError` carry their own status mapping
//! instead of leaving it to callers.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::json;

use toolgate_core::error::GatewayError;

/// Newtype around [`GatewayError`] so this crate can implement the foreign
/// `IntoResponse` trait for it.
pub struct ApiError(pub GatewayError);

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut body = json!({ "error": self.0.to_string() });
        if let GatewayError::RateLimited { retry_after_ms } = &self.0
            && let Some(obj) = body.as_object_mut()
        {
            obj.insert("retry_after_ms".to_string(), json!(retry_after_ms));
        }
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Wraps a success payload so handlers have a single uniform return type,
/// mirroring `ApiResult`'s error half.
pub fn ok<T: Serialize>(status: StatusCode, body: T) -> Response {
    (status, Json(body)).into_response()
}
