//! Gateway-level error type (§4.7, §7) — wraps the closed upstream taxonomy
//! plus the handful of local conditions (empty pool, malformed request body)
//! that never reach the upstream at all, and renders both as the same
//! client-visible `{type, message}` envelope.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use provider::ErrorTaxonomy;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("upstream: {0}")]
    Upstream(#[from] ErrorTaxonomy),

    /// §8 boundary behavior: an empty pool surfaces as authentication_error,
    /// not overloaded_error — there is nothing to retry into.
    #[error("no accounts enrolled")]
    NoAccountsEnrolled,

    /// §4.3 Rule 3: the wait would exceed MAX_WAIT_BEFORE_ERROR.
    #[error("pool exhausted, no account available within the wait budget")]
    PoolExhausted,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    fn taxonomy(&self) -> ErrorTaxonomy {
        match self {
            GatewayError::Upstream(t) => t.clone(),
            GatewayError::NoAccountsEnrolled => ErrorTaxonomy::Authentication {
                message: "No accounts are enrolled in the pool.".to_string(),
            },
            GatewayError::PoolExhausted => ErrorTaxonomy::Overloaded {
                message: "All accounts are rate-limited.".to_string(),
                retry_after_secs: 60,
            },
            GatewayError::InvalidRequest(message) => ErrorTaxonomy::InvalidRequest {
                message: message.clone(),
            },
            GatewayError::Internal(message) => ErrorTaxonomy::Api {
                message: message.clone(),
                status: 500,
            },
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let taxonomy = self.taxonomy();
        let status =
            StatusCode::from_u16(taxonomy.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = serde_json::json!({ "error": taxonomy.to_envelope() });
        (status, axum::Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_accounts_enrolled_maps_to_authentication_status() {
        let err = GatewayError::NoAccountsEnrolled;
        assert_eq!(err.taxonomy().http_status(), 401);
    }

    #[test]
    fn pool_exhausted_maps_to_overloaded_status() {
        let err = GatewayError::PoolExhausted;
        assert_eq!(err.taxonomy().http_status(), 503);
    }

    #[test]
    fn invalid_request_maps_to_400() {
        let err = GatewayError::InvalidRequest("messages must be a non-empty array".to_string());
        assert_eq!(err.taxonomy().http_status(), 400);
    }
}
