//! HTTP API server for the connector bridge
//!
//! - `{callback_path}`: webhook messages from the device server
//! - `/health`: component state

pub mod callback;
pub mod health;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::get;
use tokio::net::TcpListener;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::Result;
use crate::bridge::BridgeCore;
use crate::config::ServerConfig;

/// Shared state for API handlers
pub struct ApiState {
    pub core: Arc<BridgeCore>,
    /// Secret every inbound webhook call must present
    pub callback_secret: Option<String>,
}

/// API server
pub struct ApiServer {
    state: Arc<ApiState>,
    port: u16,
    callback_path: String,
    max_concurrent_requests: usize,
    request_timeout: Duration,
}

impl ApiServer {
    /// Create a server for `core` using the listener settings in `config`
    #[must_use]
    pub fn new(core: Arc<BridgeCore>, config: &ServerConfig) -> Self {
        Self {
            state: Arc::new(ApiState {
                core,
                callback_secret: config.callback_secret.clone(),
            }),
            port: config.port,
            callback_path: config.callback_path.clone(),
            max_concurrent_requests: config.max_concurrent_requests,
            request_timeout: config.request_timeout,
        }
    }

    /// Build the router with all routes
    #[must_use]
    pub fn router(&self) -> Router {
        let callback = get(callback::handle)
            .put(callback::handle)
            .post(callback::handle)
            .delete(callback::handle);

        Router::new()
            .route(&self.callback_path, callback)
            .with_state(Arc::clone(&self.state))
            .merge(health::router(Arc::clone(&self.state)))
            .layer(TimeoutLayer::with_status_code(
                StatusCode::REQUEST_TIMEOUT,
                self.request_timeout,
            ))
            .layer(ConcurrencyLimitLayer::new(self.max_concurrent_requests))
            .layer(TraceLayer::new_for_http())
    }

    /// Run the API server until `shutdown` resolves
    ///
    /// # Errors
    ///
    /// Returns error if server fails to bind or run
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = format!("0.0.0.0:{}", self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| crate::Error::Config(format!("failed to bind API server on {addr}: {e}")))?;

        tracing::info!(port = self.port, callback_path = %self.callback_path, "API server listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;

        tracing::info!("API server stopped");
        Ok(())
    }
}
