//! Health check endpoint

use std::sync::Arc;

use axum::{Json, Router, extract::State, routing::get};
use serde::Serialize;

use super::ApiState;
use crate::dispatcher::DispatchStats;
use crate::peer::OutboxStats;
use crate::webhook::WebhookRegistration;

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    /// `ok` when the webhook is active and the peer bus connected
    pub status: &'static str,
    pub version: &'static str,
    pub webhook: WebhookRegistration,
    pub endpoints: usize,
    pub pending_operations: usize,
    pub peer: OutboxStats,
    pub dispatch: DispatchStats,
}

/// Liveness probe with component state
async fn health(State(state): State<Arc<ApiState>>) -> Json<HealthResponse> {
    let core = &state.core;
    let webhook = core.webhook.snapshot();
    let peer = core.outbox.stats();

    let healthy = core.webhook.is_active() && peer.connected;

    Json(HealthResponse {
        status: if healthy { "ok" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        webhook,
        endpoints: core.registry.len(),
        pending_operations: core.correlator.len(),
        peer,
        dispatch: core.dispatcher.stats(),
    })
}

/// Build health router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new().route("/health", get(health)).with_state(state)
}
