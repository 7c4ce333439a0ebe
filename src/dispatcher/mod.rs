//! Inbound webhook dispatch
//!
//! [`NotificationDispatcher::handle`] classifies one webhook body and routes
//! each message kind to its handler:
//!
//! - registrations and updates: merged into the registry, announced online
//! - de-registrations and expirations: removed, announced offline
//! - async responses: settled through the correlator, or held until the
//!   operation they answer is tracked
//! - notifications: forwarded when the endpoint and resource are known
//!
//! Handling is synchronous and never waits on the peer bus, so the HTTP
//! handler can acknowledge the server as soon as it returns.

pub mod types;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

pub use types::{InboundMessage, WebhookPayload};

use crate::correlator::{AsyncCorrelator, Delivery};
use crate::peer::PeerTranslator;
use crate::peer::events::ResourceValue;
use crate::registry::{EndpointRegistration, EndpointRegistry, EndpointStatus};
use crate::webhook::WebhookManager;
use crate::Result;

/// What one webhook body amounted to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HandledResult {
    pub registered: usize,
    pub updated: usize,
    pub deregistered: usize,
    pub expired: usize,
    pub resolved: usize,
    pub unknown_tokens: usize,
    pub forwarded: usize,
    pub dropped: usize,
}

/// Running totals across all handled bodies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub payloads: u64,
    pub malformed: u64,
    pub forwarded: u64,
    pub dropped: u64,
    pub resolved: u64,
    pub unknown_tokens: u64,
}

#[derive(Default)]
struct Counters {
    payloads: AtomicU64,
    malformed: AtomicU64,
    forwarded: AtomicU64,
    dropped: AtomicU64,
    resolved: AtomicU64,
    unknown_tokens: AtomicU64,
}

/// Routes inbound webhook messages
pub struct NotificationDispatcher {
    registry: Arc<EndpointRegistry>,
    correlator: Arc<AsyncCorrelator>,
    translator: Arc<PeerTranslator>,
    webhook: Arc<WebhookManager>,
    counters: Counters,
}

impl NotificationDispatcher {
    #[must_use]
    pub fn new(
        registry: Arc<EndpointRegistry>,
        correlator: Arc<AsyncCorrelator>,
        translator: Arc<PeerTranslator>,
        webhook: Arc<WebhookManager>,
    ) -> Self {
        Self {
            registry,
            correlator,
            translator,
            webhook,
            counters: Counters::default(),
        }
    }

    /// Process one webhook body
    ///
    /// An empty body is a server reachability probe and does nothing.
    ///
    /// # Errors
    ///
    /// Returns `MalformedPayload` if the body cannot be parsed; no state is
    /// changed in that case
    pub fn handle(&self, raw: &str) -> Result<HandledResult> {
        if raw.trim().is_empty() {
            tracing::debug!("empty webhook body, treating as validation probe");
            return Ok(HandledResult::default());
        }

        let payload = match WebhookPayload::parse(raw) {
            Ok(payload) => payload,
            Err(e) => {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, bytes = raw.len(), "malformed webhook payload");
                return Err(e);
            }
        };
        self.counters.payloads.fetch_add(1, Ordering::Relaxed);

        if !self.webhook.is_active() {
            tracing::warn!(state = ?self.webhook.state(), "webhook message received while not active");
        }

        let mut result = HandledResult::default();
        for message in payload.into_messages() {
            match message {
                InboundMessage::NewRegistrations(regs) => {
                    result.registered += self.register(&regs, EndpointStatus::Registered);
                }
                InboundMessage::ReRegistrations(regs) => {
                    result.updated += self.register(&regs, EndpointStatus::ReRegistered);
                }
                InboundMessage::Deregistrations(names) => {
                    for name in names {
                        match self.registry.remove(&name) {
                            Some(endpoint) => {
                                result.deregistered += 1;
                                self.translator.endpoint_offline(&endpoint);
                            }
                            None => {
                                tracing::debug!(endpoint = %name, "deregistration for unknown endpoint");
                            }
                        }
                    }
                }
                InboundMessage::RegistrationsExpired(names) => {
                    for endpoint in self.registry.mark_expired(&names) {
                        result.expired += 1;
                        self.translator.endpoint_offline(&endpoint);
                    }
                }
                InboundMessage::AsyncResponses(responses) => {
                    for response in responses {
                        match self.correlator.deliver(&response.id, response.outcome()) {
                            Delivery::Matched(operation, outcome) => {
                                result.resolved += 1;
                                self.translator.settle(operation, outcome);
                            }
                            Delivery::Held => {
                                // Late or replayed, or the reply carrying the token is still in flight
                                result.unknown_tokens += 1;
                                tracing::warn!(token = %response.id, "async response for unknown token held");
                            }
                        }
                    }
                }
                InboundMessage::Notifications(notifications) => {
                    for entry in notifications {
                        if !self.registry.has_resource(&entry.ep, &entry.path) {
                            result.dropped += 1;
                            tracing::warn!(
                                endpoint = %entry.ep,
                                uri = %entry.path,
                                known_endpoint = self.registry.contains(&entry.ep),
                                "notification for unknown resource dropped"
                            );
                            continue;
                        }
                        result.forwarded += 1;
                        self.translator.resource_value(&ResourceValue {
                            value: entry.payload.as_deref().map(types::decode_value),
                            endpoint: entry.ep,
                            uri: entry.path,
                            content_type: entry.ct,
                            max_age: entry.max_age,
                        });
                    }
                }
            }
        }

        self.counters
            .forwarded
            .fetch_add(result.forwarded as u64, Ordering::Relaxed);
        self.counters
            .dropped
            .fetch_add(result.dropped as u64, Ordering::Relaxed);
        self.counters
            .resolved
            .fetch_add(result.resolved as u64, Ordering::Relaxed);
        self.counters
            .unknown_tokens
            .fetch_add(result.unknown_tokens as u64, Ordering::Relaxed);

        tracing::debug!(result = ?result, "webhook payload handled");
        Ok(result)
    }

    fn register(&self, registrations: &[EndpointRegistration], status: EndpointStatus) -> usize {
        for registration in registrations {
            let endpoint = self.registry.register_or_update(registration, status);
            self.translator
                .endpoint_online(&endpoint, status == EndpointStatus::ReRegistered);
        }
        registrations.len()
    }

    /// Running totals
    #[must_use]
    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            payloads: self.counters.payloads.load(Ordering::Relaxed),
            malformed: self.counters.malformed.load(Ordering::Relaxed),
            forwarded: self.counters.forwarded.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            resolved: self.counters.resolved.load(Ordering::Relaxed),
            unknown_tokens: self.counters.unknown_tokens.load(Ordering::Relaxed),
        }
    }
}
