//! The error taxonomy shared by every component of the gateway core.
//!
//! One variant per row of the spec's error table; `http_status` is the
//! single source of truth the server crate uses to map a [`GatewayError`]
//! onto a response, mirroring how the teacher's `ServerError`/`McpError`
//! carry their own status mapping instead of leaving it to callers.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("{0}")]
    Unauthenticated(String),

    #[error("{0}")]
    ForbiddenScope(String),

    #[error("{0}")]
    ForbiddenPolicy(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    QuotaExceeded(String),

    #[error("{0}")]
    SessionError(String),

    #[error("{0}")]
    RateLimited { retry_after_ms: u64 },

    #[error("circuit open for {server_id}")]
    CircuitOpen { server_id: String },

    #[error("{0}")]
    UpstreamError(String),

    #[error("request timed out")]
    Timeout,

    #[error("{0}")]
    NotImplemented(String),

    #[error("{0}")]
    Internal(String),
}

impl GatewayError {
    /// HTTP status this error maps to, per spec §7.
    pub fn http_status(&self) -> u16 {
        match self {
            GatewayError::Unauthenticated(_) => 401,
            GatewayError::ForbiddenScope(_) | GatewayError::ForbiddenPolicy(_) => 403,
            GatewayError::BadRequest(_)
            | GatewayError::QuotaExceeded(_)
            | GatewayError::SessionError(_) => 400,
            GatewayError::NotFound(_) => 404,
            GatewayError::RateLimited { .. } => 429,
            GatewayError::CircuitOpen { .. } => 503,
            GatewayError::UpstreamError(_) => 502,
            GatewayError::Timeout => 504,
            GatewayError::NotImplemented(_) => 501,
            GatewayError::Internal(_) => 500,
        }
    }

    /// The error "kind" label used in audit entries and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Unauthenticated(_) => "UNAUTHENTICATED",
            GatewayError::ForbiddenScope(_) => "FORBIDDEN_SCOPE",
            GatewayError::ForbiddenPolicy(_) => "FORBIDDEN_POLICY",
            GatewayError::BadRequest(_) => "BAD_REQUEST",
            GatewayError::NotFound(_) => "NOT_FOUND",
            GatewayError::QuotaExceeded(_) => "QUOTA_EXCEEDED",
            GatewayError::SessionError(_) => "SESSION_ERROR",
            GatewayError::RateLimited { .. } => "RATE_LIMITED",
            GatewayError::CircuitOpen { .. } => "CIRCUIT_OPEN",
            GatewayError::UpstreamError(_) => "UPSTREAM_ERROR",
            GatewayError::Timeout => "TIMEOUT",
            GatewayError::NotImplemented(_) => "NOT_IMPLEMENTED",
            GatewayError::Internal(_) => "INTERNAL",
        }
    }
}

impl From<sqlx::Error> for GatewayError {
    fn from(e: sqlx::Error) -> Self {
        GatewayError::Internal(format!("datastore error: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_spec_table() {
        assert_eq!(
            GatewayError::Unauthenticated("x".into()).http_status(),
            401
        );
        assert_eq!(GatewayError::ForbiddenScope("x".into()).http_status(), 403);
        assert_eq!(GatewayError::BadRequest("x".into()).http_status(), 400);
        assert_eq!(GatewayError::NotFound("x".into()).http_status(), 404);
        assert_eq!(
            GatewayError::RateLimited { retry_after_ms: 100 }.http_status(),
            429
        );
        assert_eq!(
            GatewayError::CircuitOpen { server_id: "s".into() }.http_status(),
            503
        );
        assert_eq!(GatewayError::UpstreamError("x".into()).http_status(), 502);
        assert_eq!(GatewayError::Timeout.http_status(), 504);
        assert_eq!(GatewayError::NotImplemented("x".into()).http_status(), 501);
        assert_eq!(GatewayError::Internal("x".into()).http_status(), 500);
    }
}
