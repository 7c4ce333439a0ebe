//! Assembly of the bridge components
//!
//! [`BridgeCore`] wires the registry, correlator, webhook manager, executor,
//! outbox, translator and dispatcher around the three external capabilities
//! (device API, webhook API, peer bus). It owns no tasks; the daemon drives
//! the periodic work through [`BridgeCore::sweep_once`] and friends.

use std::sync::Arc;
use std::time::Duration;

use crate::connector::{DeviceApi, EndpointFilter, WebhookApi};
use crate::correlator::{AsyncCorrelator, OperationOutcome};
use crate::dispatcher::NotificationDispatcher;
use crate::executor::ResourceExecutor;
use crate::peer::{Outbox, PeerBus, PeerTranslator, TopicScheme};
use crate::registry::{EndpointRegistration, EndpointRegistry, EndpointStatus};
use crate::retry::RetryPolicy;
use crate::webhook::WebhookManager;
use crate::{Config, Result};

/// Settings the core needs, independent of where they came from
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub async_timeout: Duration,
    pub registration_policy: RetryPolicy,
    pub queue_capacity: usize,
    pub reconnect_policy: RetryPolicy,
    pub topic_prefix: String,
    pub auto_subscribe: bool,
    pub callback_secret: Option<String>,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            async_timeout: Duration::from_secs(30),
            registration_policy: RetryPolicy::default(),
            queue_capacity: 1024,
            reconnect_policy: RetryPolicy {
                max_attempts: u32::MAX,
                ..RetryPolicy::default()
            },
            topic_prefix: "connector".to_string(),
            auto_subscribe: false,
            callback_secret: None,
        }
    }
}

impl From<&Config> for BridgeSettings {
    fn from(config: &Config) -> Self {
        Self {
            async_timeout: config.timing.async_timeout,
            registration_policy: config.timing.registration_policy(),
            queue_capacity: config.peer.queue_capacity,
            reconnect_policy: config.timing.reconnect_policy(),
            topic_prefix: config.peer.topic_prefix.clone(),
            auto_subscribe: config.auto_subscribe,
            callback_secret: config.server.callback_secret.clone(),
        }
    }
}

/// The wired-up bridge
pub struct BridgeCore {
    pub registry: Arc<EndpointRegistry>,
    pub correlator: Arc<AsyncCorrelator>,
    pub webhook: Arc<WebhookManager>,
    pub executor: Arc<ResourceExecutor>,
    pub outbox: Arc<Outbox>,
    pub translator: Arc<PeerTranslator>,
    pub dispatcher: Arc<NotificationDispatcher>,
    bus: Arc<dyn PeerBus>,
    settings: BridgeSettings,
}

impl BridgeCore {
    /// Wire the components around the given capabilities
    #[must_use]
    pub fn new(
        settings: BridgeSettings,
        device: Arc<dyn DeviceApi>,
        webhook_api: Arc<dyn WebhookApi>,
        bus: Arc<dyn PeerBus>,
    ) -> Self {
        let registry = Arc::new(EndpointRegistry::new());
        let correlator = Arc::new(AsyncCorrelator::new());
        let webhook = Arc::new(
            WebhookManager::new(webhook_api, settings.registration_policy.clone())
                .with_secret(settings.callback_secret.clone()),
        );
        let executor = Arc::new(ResourceExecutor::new(
            Arc::clone(&registry),
            Arc::clone(&correlator),
            device,
            settings.async_timeout,
        ));
        let outbox = Arc::new(Outbox::new(
            Arc::clone(&bus),
            settings.queue_capacity,
            settings.reconnect_policy.clone(),
        ));
        let translator = Arc::new(
            PeerTranslator::new(
                Arc::clone(&executor),
                Arc::clone(&outbox),
                TopicScheme::new(settings.topic_prefix.clone()),
            )
            .with_auto_subscribe(settings.auto_subscribe),
        );
        let dispatcher = Arc::new(NotificationDispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&correlator),
            Arc::clone(&translator),
            Arc::clone(&webhook),
        ));

        Self {
            registry,
            correlator,
            webhook,
            executor,
            outbox,
            translator,
            dispatcher,
            bus,
            settings,
        }
    }

    /// Peer bus shared by the outbox and the command consumer
    #[must_use]
    pub fn bus(&self) -> Arc<dyn PeerBus> {
        Arc::clone(&self.bus)
    }

    #[must_use]
    pub const fn settings(&self) -> &BridgeSettings {
        &self.settings
    }

    /// Time out every expired pending operation; returns how many
    pub fn sweep_once(&self) -> usize {
        let expired = self.correlator.sweep_expired();
        let count = expired.len();
        for operation in expired {
            tracing::warn!(
                token = %operation.token,
                endpoint = %operation.endpoint,
                uri = %operation.uri,
                verb = %operation.verb,
                waited_ms = u64::try_from(operation.created_at.elapsed().as_millis()).unwrap_or(u64::MAX),
                "async operation timed out"
            );
            self.translator.settle(operation, OperationOutcome::Timeout);
        }
        count
    }

    /// Seed the registry with endpoints the server already knows
    ///
    /// Endpoints whose resources cannot be listed are skipped. Returns the
    /// number of endpoints registered.
    ///
    /// # Errors
    ///
    /// Returns error if the endpoint listing itself fails
    pub async fn seed_registry(&self, filter: &EndpointFilter) -> Result<usize> {
        let discovered = self.executor.discover_endpoints(filter).await?;
        let mut seeded = 0;

        for found in discovered {
            let resources = match self.executor.discover_resources(&found.name).await {
                Ok(resources) => resources,
                Err(e) => {
                    tracing::warn!(endpoint = %found.name, error = %e, "resource discovery failed");
                    continue;
                }
            };

            let registration = EndpointRegistration {
                name: found.name,
                endpoint_type: found.endpoint_type,
                queue_mode: found.queue_mode,
                resources,
            };
            let endpoint = self
                .registry
                .register_or_update(&registration, EndpointStatus::Registered);
            self.translator.endpoint_online(&endpoint, false);
            seeded += 1;
        }

        tracing::info!(endpoints = seeded, "registry seeded from discovery");
        Ok(seeded)
    }
}
