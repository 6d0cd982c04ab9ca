// =============================================================================
// Bearer Token Authentication — Axum Extractor
// =============================================================================
//
// Validates `Authorization: Bearer <token>` against the token held in
// `AppState` (loaded from `AURORA_FUSION_TOKEN` at startup). Comparison runs
// in constant time.
//
//   async fn handler(_auth: AuthBearer, ...) { ... }
//
// A missing, malformed or wrong token short-circuits with 401 before the
// handler body runs; an unconfigured server answers 403.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::warn;

use crate::app_state::AppState;

/// Compare two byte slices in constant time. A length mismatch returns early;
/// the expected token length is not secret.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// Proof that the request carried the configured token.
pub struct AuthBearer;

pub struct AuthRejection {
    status: StatusCode,
    message: &'static str,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, axum::Json(body)).into_response()
    }
}

#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for AuthBearer {
    type Rejection = AuthRejection;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let Some(expected) = state.api_token.as_deref() else {
            warn!("AURORA_FUSION_TOKEN is not set, rejecting authenticated request");
            return Err(AuthRejection {
                status: StatusCode::FORBIDDEN,
                message: "Server authentication not configured",
            });
        };

        let token = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));

        let Some(token) = token else {
            warn!("Missing or malformed Authorization header");
            return Err(AuthRejection {
                status: StatusCode::UNAUTHORIZED,
                message: "Missing or invalid authorization token",
            });
        };

        if !constant_time_eq(token.as_bytes(), expected.as_bytes()) {
            warn!("Invalid API token presented");
            return Err(AuthRejection {
                status: StatusCode::UNAUTHORIZED,
                message: "Invalid authorization token",
            });
        }

        Ok(AuthBearer)
    }
}
