//! Device-server webhook callback handler

use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
};

use subtle::ConstantTimeEq;

use super::ApiState;
use crate::webhook::SECRET_HEADER;

/// Accept one webhook body on any of GET/PUT/POST/DELETE
///
/// - 200: processed (including empty validation probes)
/// - 400: body could not be parsed
/// - 403: configured secret missing or wrong
pub async fn handle(State(state): State<Arc<ApiState>>, headers: HeaderMap, body: String) -> StatusCode {
    if let Some(expected) = &state.callback_secret {
        let presented = headers.get(SECRET_HEADER).and_then(|v| v.to_str().ok());
        let matches = presented.is_some_and(|p| bool::from(p.as_bytes().ct_eq(expected.as_bytes())));
        if !matches {
            tracing::warn!(presented = presented.is_some(), "webhook call rejected: bad secret");
            return StatusCode::FORBIDDEN;
        }
    }

    match state.core.dispatcher.handle(&body) {
        Ok(_) => StatusCode::OK,
        Err(_) => StatusCode::BAD_REQUEST,
    }
}
