//! Bridge daemon: startup sequence, background tasks and ordered shutdown

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::api::ApiServer;
use crate::bridge::{BridgeCore, BridgeSettings};
use crate::connector::{EndpointFilter, HttpConnector};
use crate::peer::{IggyBus, IggyConfig};
use crate::webhook::ValidationOutcome;
use crate::{Config, Error, Result};

/// Timeout for individual device-server HTTP calls
const DEVICE_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// The connector bridge daemon
pub struct Daemon {
    config: Config,
    core: Arc<BridgeCore>,
}

impl Daemon {
    /// Create a daemon talking to the configured device server and Iggy
    ///
    /// # Errors
    ///
    /// Returns error if the API key is missing or a client cannot be built
    pub fn new(config: Config) -> Result<Self> {
        let connector = Arc::new(HttpConnector::new(
            &config.device_server.base_url,
            config.require_api_key()?,
            DEVICE_HTTP_TIMEOUT,
        )?);
        let bus = Arc::new(IggyBus::new(IggyConfig {
            base_url: config.peer.base_url.clone(),
            username: config.peer.username.clone(),
            password: config.peer.password.clone(),
            stream: config.peer.stream.clone(),
            poll_interval: config.peer.poll_interval,
        })?);

        let core = Arc::new(BridgeCore::new(
            BridgeSettings::from(&config),
            connector.clone(),
            connector,
            bus,
        ));

        Ok(Self::with_core(config, core))
    }

    /// Create a daemon around an already wired core
    #[must_use]
    pub const fn with_core(config: Config, core: Arc<BridgeCore>) -> Self {
        Self { config, core }
    }

    #[must_use]
    pub const fn core(&self) -> &Arc<BridgeCore> {
        &self.core
    }

    /// Run the daemon until interrupted
    ///
    /// # Errors
    ///
    /// Returns error if the webhook cannot be activated or the HTTP server
    /// fails
    pub async fn run(self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Run the daemon until `signal` resolves
    ///
    /// # Errors
    ///
    /// Returns error if the webhook cannot be activated or the HTTP server
    /// fails
    #[allow(clippy::too_many_lines)]
    pub async fn run_until<S>(self, signal: S) -> Result<()>
    where
        S: Future<Output = ()> + Send,
    {
        let core = Arc::clone(&self.core);
        let timing = self.config.timing.clone();
        let callback_url = self.config.callback_url();

        tracing::info!(
            callback_url = %callback_url,
            device_server = %self.config.device_server.base_url,
            peer = %self.config.peer.base_url,
            "daemon starting"
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let (http_stop_tx, http_stop_rx) = oneshot::channel::<()>();

        // Listener first so the server can reach the callback while we register it
        let server = ApiServer::new(Arc::clone(&core), &self.config.server);
        let mut http = tokio::spawn(server.run(async move {
            let _ = http_stop_rx.await;
        }));

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        tasks.push(tokio::spawn(
            Arc::clone(&core.outbox).run(stop_rx.clone()),
        ));

        let activation = tokio::select! {
            result = core.webhook.activate(&callback_url) => result,
            exited = &mut http => Err(server_exit(exited)),
        };
        if let Err(e) = activation {
            tracing::error!(error = %e, "webhook activation failed, shutting down");
            let _ = http_stop_tx.send(());
            let _ = stop_tx.send(true);
            await_all(tasks, timing.shutdown_grace).await;
            return Err(e);
        }

        let filter = EndpointFilter {
            endpoint_type: self.config.device_server.endpoint_type.clone(),
        };
        if let Err(e) = core.seed_registry(&filter).await {
            tracing::warn!(error = %e, "startup discovery failed, continuing with empty registry");
        }

        tasks.push(tokio::spawn(run_sweeper(
            Arc::clone(&core),
            timing.sweep_interval,
            stop_rx.clone(),
        )));
        tasks.push(tokio::spawn(run_validator(
            Arc::clone(&core),
            timing.validation_interval,
            stop_rx.clone(),
        )));
        tasks.push(tokio::spawn(Arc::clone(&core.translator).run_commands(
            core.bus(),
            timing.reconnect_policy(),
            stop_rx,
        )));

        tracing::info!(endpoints = core.registry.len(), "connector bridge ready");

        let mut result = Ok(());
        tokio::select! {
            () = signal => tracing::info!("shutdown requested"),
            exited = &mut http => {
                let e = server_exit(exited);
                tracing::error!(error = %e, "API server exited unexpectedly");
                result = Err(e);
            }
        }

        // Stop accepting webhook calls, letting in-flight ones finish
        let _ = http_stop_tx.send(());
        if !http.is_finished() {
            match tokio::time::timeout(timing.shutdown_grace, &mut http).await {
                Ok(Ok(Err(e))) => tracing::warn!(error = %e, "API server stopped with error"),
                Ok(_) => {}
                Err(_) => {
                    tracing::warn!("API server did not drain in time");
                    http.abort();
                }
            }
        }

        core.webhook.deactivate().await;

        let _ = stop_tx.send(true);
        await_all(tasks, timing.shutdown_grace).await;

        tracing::info!(
            pending_dropped = core.correlator.len(),
            peer = ?core.outbox.stats(),
            "daemon stopped"
        );
        result
    }
}

/// Time out expired async operations periodically
async fn run_sweeper(core: Arc<BridgeCore>, period: Duration, mut stop: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = interval.tick() => {
                let expired = core.sweep_once();
                if expired > 0 {
                    tracing::debug!(expired, pending = core.correlator.len(), "sweep complete");
                }
            }
        }
    }
    tracing::debug!("sweeper stopped");
}

/// Re-check the webhook registration periodically
async fn run_validator(core: Arc<BridgeCore>, period: Duration, mut stop: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // Skip the first immediate tick; activation just happened
    interval.tick().await;

    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = interval.tick() => match core.webhook.validate().await {
                Ok(ValidationOutcome::Reactivated) => tracing::info!("webhook re-registered"),
                Ok(ValidationOutcome::Unreachable) => {
                    tracing::warn!("device server unreachable during webhook validation");
                }
                Ok(ValidationOutcome::Valid | ValidationOutcome::Skipped) => {}
                Err(e) => tracing::error!(error = %e, "webhook re-registration failed"),
            },
        }
    }
    tracing::debug!("webhook validator stopped");
}

async fn await_all(tasks: Vec<JoinHandle<()>>, grace: Duration) {
    let aborts: Vec<_> = tasks.iter().map(JoinHandle::abort_handle).collect();
    if tokio::time::timeout(grace, futures::future::join_all(tasks))
        .await
        .is_err()
    {
        tracing::warn!("background tasks did not stop in time, aborting");
        for handle in aborts {
            handle.abort();
        }
    }
}

fn server_exit(exited: std::result::Result<Result<()>, tokio::task::JoinError>) -> Error {
    match exited {
        Ok(Ok(())) => Error::Config("API server exited".to_string()),
        Ok(Err(e)) => e,
        Err(e) => Error::Config(format!("API server task failed: {e}")),
    }
}
