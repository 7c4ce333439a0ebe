//! Translation between bridge events and peer bus messages
//!
//! Outbound: registry and notification events become envelopes queued on the
//! [`Outbox`]. Inbound: peer commands become resource operations whose
//! outcome is published back as a `command.result`, echoing the peer token.

use std::sync::Arc;

use tokio::sync::{Semaphore, watch};

use super::command::{self, ParsedCommand, PeerCommand};
use super::events::{self, ResourceValue, TopicScheme};
use super::{Outbox, PeerBus};
use crate::correlator::{Continuation, OperationOutcome, PendingOperation, Verb};
use crate::executor::{Dispatched, ResourceExecutor};
use crate::registry::Endpoint;
use crate::retry::{self, RetryPolicy};
use crate::Error;

/// Peer commands processed concurrently
const MAX_IN_FLIGHT_COMMANDS: usize = 32;

/// Bridges the device side and the peer bus
pub struct PeerTranslator {
    executor: Arc<ResourceExecutor>,
    outbox: Arc<Outbox>,
    topics: TopicScheme,
    auto_subscribe: bool,
}

impl PeerTranslator {
    /// Create a translator publishing through `outbox`
    #[must_use]
    pub fn new(executor: Arc<ResourceExecutor>, outbox: Arc<Outbox>, topics: TopicScheme) -> Self {
        Self {
            executor,
            outbox,
            topics,
            auto_subscribe: false,
        }
    }

    /// Subscribe to every observable resource of newly registered endpoints
    #[must_use]
    pub const fn with_auto_subscribe(mut self, enabled: bool) -> Self {
        self.auto_subscribe = enabled;
        self
    }

    /// Topic naming in use
    #[must_use]
    pub const fn topics(&self) -> &TopicScheme {
        &self.topics
    }

    /// Announce a registered or re-registered endpoint
    pub fn endpoint_online(&self, endpoint: &Endpoint, reregistered: bool) {
        tracing::info!(
            endpoint = %endpoint.name,
            resources = endpoint.resources.len(),
            reregistered,
            "endpoint online"
        );
        self.outbox
            .enqueue(events::endpoint_online(endpoint, reregistered, &self.topics));

        if self.auto_subscribe {
            self.subscribe_observables(endpoint);
        }
    }

    /// Announce a deregistered or expired endpoint
    pub fn endpoint_offline(&self, endpoint: &Endpoint) {
        tracing::info!(endpoint = %endpoint.name, status = ?endpoint.status, "endpoint offline");
        self.outbox
            .enqueue(events::endpoint_offline(endpoint, &self.topics));
    }

    /// Forward a resource value notification
    pub fn resource_value(&self, notification: &ResourceValue) {
        tracing::debug!(
            endpoint = %notification.endpoint,
            uri = %notification.uri,
            "forwarding notification"
        );
        self.outbox
            .enqueue(events::resource_value(notification, &self.topics));
    }

    /// Finish a pending operation that resolved or timed out
    ///
    /// Subscription flags are confirmed or rolled back first, then the
    /// continuation runs.
    pub fn settle(&self, operation: PendingOperation, outcome: OperationOutcome) {
        self.executor
            .apply_subscription_outcome(&operation, &outcome);

        tracing::debug!(
            token = %operation.token,
            endpoint = %operation.endpoint,
            uri = %operation.uri,
            verb = %operation.verb,
            success = outcome.is_success(),
            "operation settled"
        );

        match operation.continuation {
            Continuation::ReplyToPeer { reply_token } => {
                self.publish_result(
                    &reply_token,
                    Some(operation.verb),
                    Some(&operation.endpoint),
                    Some(&operation.uri),
                    &outcome,
                );
            }
            Continuation::Waiter(sender) => {
                if sender.send(outcome).is_err() {
                    tracing::debug!(token = %operation.token, "waiter went away before settlement");
                }
            }
            Continuation::Discard => {
                if let OperationOutcome::Failure { error, .. } = &outcome {
                    tracing::warn!(
                        endpoint = %operation.endpoint,
                        uri = %operation.uri,
                        verb = %operation.verb,
                        error = %error,
                        "background operation failed"
                    );
                } else if outcome == OperationOutcome::Timeout {
                    tracing::warn!(
                        endpoint = %operation.endpoint,
                        uri = %operation.uri,
                        verb = %operation.verb,
                        "background operation timed out"
                    );
                }
            }
        }
    }

    /// Execute one raw peer command and publish its result
    ///
    /// Every command gets exactly one `command.result`, either now or once
    /// its async reply settles.
    pub async fn handle_command(&self, raw: &[u8]) {
        let ParsedCommand {
            reply_token,
            mut request,
        } = match PeerCommand::parse(raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                let (token, endpoint) = command::salvage(raw);
                tracing::warn!(error = %e, token = ?token, "rejected peer command");
                if let Some(token) = token {
                    self.publish_result(
                        &token,
                        None,
                        endpoint.as_deref(),
                        None,
                        &failure(None, &e),
                    );
                }
                return;
            }
        };

        let verb = request.verb;
        let uri = request.address.uri.clone();
        // Resolved up front so the result names the endpoint even for
        // URI-only addresses
        let endpoint = match self.executor.resolve_endpoint(&request.address) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                tracing::warn!(uri = %uri, error = %e, "peer command address not resolvable");
                self.publish_result(
                    &reply_token,
                    Some(verb),
                    request.address.endpoint.as_deref(),
                    Some(&uri),
                    &failure(Some(address_status(&e)), &e),
                );
                return;
            }
        };

        request.address.endpoint = Some(endpoint.clone());

        let continuation = Continuation::ReplyToPeer {
            reply_token: reply_token.clone(),
        };
        match self.executor.perform(request, continuation).await {
            Ok(Dispatched::Pending { token }) => {
                tracing::debug!(
                    reply_token = %reply_token,
                    token = %token,
                    "peer command awaiting async response"
                );
            }
            Ok(Dispatched::Completed(outcome)) => {
                self.publish_result(&reply_token, Some(verb), Some(&endpoint), Some(&uri), &outcome);
            }
            Err(e) => {
                tracing::warn!(endpoint = %endpoint, uri = %uri, error = %e, "peer command failed");
                self.publish_result(
                    &reply_token,
                    Some(verb),
                    Some(&endpoint),
                    Some(&uri),
                    &failure(None, &e),
                );
            }
        }
    }

    /// Consume peer commands until shutdown, resubscribing when the feed ends
    pub async fn run_commands(
        self: Arc<Self>,
        bus: Arc<dyn PeerBus>,
        policy: RetryPolicy,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let channel = self.topics.command_channel();
        let permits = Arc::new(Semaphore::new(MAX_IN_FLIGHT_COMMANDS));
        let mut attempt: u32 = 0;

        tracing::info!(channel = %channel, "peer command consumer started");

        loop {
            let mut rx = match bus.subscribe(&channel).await {
                Ok(rx) => {
                    attempt = 0;
                    rx
                }
                Err(e) => {
                    tracing::warn!(channel = %channel, attempt, error = %e, "command subscription failed");
                    let delay = retry::delay_for_attempt(&policy, attempt.min(10));
                    attempt = attempt.saturating_add(1);
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        () = tokio::time::sleep(delay) => continue,
                    }
                }
            };

            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        tracing::info!("peer command consumer stopped");
                        return;
                    }
                    raw = rx.recv() => {
                        let Some(raw) = raw else {
                            tracing::warn!(channel = %channel, "command feed closed, resubscribing");
                            break;
                        };
                        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                            return;
                        };
                        let translator = Arc::clone(&self);
                        tokio::spawn(async move {
                            translator.handle_command(&raw).await;
                            drop(permit);
                        });
                    }
                }
            }
        }

        tracing::info!("peer command consumer stopped");
    }

    fn publish_result(
        &self,
        reply_token: &str,
        verb: Option<Verb>,
        endpoint: Option<&str>,
        uri: Option<&str>,
        outcome: &OperationOutcome,
    ) {
        self.outbox.enqueue(events::command_result(
            reply_token,
            verb,
            endpoint,
            uri,
            outcome,
            &self.topics,
        ));
    }

    fn subscribe_observables(&self, endpoint: &Endpoint) {
        let pending: Vec<String> = endpoint
            .resources
            .iter()
            .filter(|r| r.observable && !r.subscribed)
            .map(|r| r.uri.clone())
            .collect();
        if pending.is_empty() {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(endpoint = %endpoint.name, "no runtime for auto-subscribe");
            return;
        };

        let executor = Arc::clone(&self.executor);
        let name = endpoint.name.clone();
        runtime.spawn(async move {
            for uri in pending {
                match executor.observe(&name, &uri, Continuation::Discard).await {
                    Ok(Dispatched::Completed(outcome)) if !outcome.is_success() => {
                        tracing::warn!(endpoint = %name, uri = %uri, outcome = ?outcome, "auto-subscribe rejected");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(endpoint = %name, uri = %uri, error = %e, "auto-subscribe failed");
                    }
                }
            }
        });
    }
}

/// HTTP-style status reported for an unresolvable address
const fn address_status(error: &Error) -> u16 {
    match error {
        Error::AmbiguousAddress { .. } => 409,
        _ => 404,
    }
}

fn failure(status: Option<u16>, error: &Error) -> OperationOutcome {
    OperationOutcome::Failure {
        status,
        error: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::{mpsc, oneshot};
    use tokio::time::Instant;

    use super::*;
    use crate::Result;
    use crate::connector::{
        DeviceApi, DeviceReply, DeviceRequest, DiscoveredEndpoint, EndpointFilter,
    };
    use crate::correlator::AsyncCorrelator;
    use crate::peer::PeerMessage;
    use crate::registry::{
        EndpointRegistration, EndpointRegistry, EndpointStatus, ResourceDescriptor,
    };

    struct AsyncDevice;

    #[async_trait]
    impl DeviceApi for AsyncDevice {
        async fn resource_operation(&self, request: &DeviceRequest) -> Result<DeviceReply> {
            Ok(DeviceReply::Async {
                token: format!("tok-{}", request.uri),
            })
        }

        async fn list_endpoints(&self, _filter: &EndpointFilter) -> Result<Vec<DiscoveredEndpoint>> {
            Ok(Vec::new())
        }

        async fn list_resources(&self, _endpoint: &str) -> Result<Vec<ResourceDescriptor>> {
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct NullBus {
        published: Mutex<Vec<PeerMessage>>,
    }

    #[async_trait]
    impl PeerBus for NullBus {
        async fn connect(&self) -> Result<()> {
            Ok(())
        }

        async fn publish(&self, message: &PeerMessage) -> Result<()> {
            self.published.lock().unwrap().push(message.clone());
            Ok(())
        }

        async fn subscribe(&self, _channel: &str) -> Result<mpsc::Receiver<Vec<u8>>> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }
    }

    struct Fixture {
        translator: PeerTranslator,
        registry: Arc<EndpointRegistry>,
        correlator: Arc<AsyncCorrelator>,
        outbox: Arc<Outbox>,
        bus: Arc<NullBus>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(EndpointRegistry::new());
        let correlator = Arc::new(AsyncCorrelator::new());
        registry.register_or_update(
            &EndpointRegistration::new(
                "dev1",
                vec![ResourceDescriptor::new("/3311/0/5850").observable()],
            ),
            EndpointStatus::Registered,
        );
        let executor = Arc::new(ResourceExecutor::new(
            Arc::clone(&registry),
            Arc::clone(&correlator),
            Arc::new(AsyncDevice),
            Duration::from_secs(30),
        ));
        let bus = Arc::new(NullBus::default());
        let outbox = Arc::new(Outbox::new(bus.clone(), 16, RetryPolicy::default()));
        let translator = PeerTranslator::new(executor, Arc::clone(&outbox), TopicScheme::default());
        Fixture {
            translator,
            registry,
            correlator,
            outbox,
            bus,
        }
    }

    #[tokio::test]
    async fn command_result_echoes_peer_token() {
        let f = fixture();

        f.translator
            .handle_command(br#"{"verb":"get","path":"/3311/0/5850","token":"peer-7"}"#)
            .await;
        assert!(f.correlator.is_pending("tok-/3311/0/5850"));
        assert!(f.outbox.is_empty());

        let op = f.correlator.resolve("tok-/3311/0/5850").unwrap();
        f.translator.settle(
            op,
            OperationOutcome::Success {
                status: 200,
                content_type: Some("text/plain".into()),
                value: Some("1".into()),
            },
        );

        f.outbox.flush().await.unwrap();
        let published = f.bus.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        let data = &published[0].payload["data"];
        assert_eq!(data["token"], "peer-7");
        assert_eq!(data["ep"], "dev1");
        assert_eq!(data["ok"], true);
        assert_eq!(data["value"], "1");
    }

    #[tokio::test]
    async fn rejected_command_is_answered_when_token_known() {
        let f = fixture();

        f.translator
            .handle_command(br#"{"verb":"get","ep":"ghost","path":"/1/0/0","token":"t1"}"#)
            .await;
        f.translator
            .handle_command(br#"{"verb":"explode","path":"/1/0/0","token":"t2"}"#)
            .await;
        f.translator.handle_command(b"not json").await;

        f.outbox.flush().await.unwrap();
        let published = f.bus.published.lock().unwrap();
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].payload["data"]["token"], "t1");
        assert_eq!(published[0].payload["data"]["ok"], false);
        assert_eq!(published[1].payload["data"]["token"], "t2");
    }

    #[tokio::test]
    async fn timed_out_observe_restores_flag() {
        let f = fixture();

        f.translator
            .handle_command(br#"{"verb":"observe","ep":"dev1","path":"/3311/0/5850"}"#)
            .await;
        assert_eq!(f.registry.is_subscribed("dev1", "/3311/0/5850"), Some(true));

        let expired = f
            .correlator
            .sweep_expired_at(Instant::now() + Duration::from_secs(31));
        assert_eq!(expired.len(), 1);
        for op in expired {
            f.translator.settle(op, OperationOutcome::Timeout);
        }

        assert_eq!(f.registry.is_subscribed("dev1", "/3311/0/5850"), Some(false));
        f.outbox.flush().await.unwrap();
        assert_eq!(
            f.bus.published.lock().unwrap()[0].payload["data"]["error"],
            "timeout"
        );
    }

    #[tokio::test]
    async fn waiter_receives_outcome() {
        let f = fixture();
        let (tx, rx) = oneshot::channel();
        let op = PendingOperation::new(
            "w1",
            Verb::Read,
            "dev1",
            "/3311/0/5850",
            Instant::now() + Duration::from_secs(1),
            Continuation::Waiter(tx),
        );

        f.translator.settle(op, OperationOutcome::Timeout);
        assert_eq!(rx.await.unwrap(), OperationOutcome::Timeout);
        assert!(f.outbox.is_empty());
    }

    #[tokio::test]
    async fn auto_subscribe_observes_new_endpoints() {
        let f = fixture();
        let translator = f.translator.with_auto_subscribe(true);
        let endpoint = f.registry.get("dev1").unwrap();

        translator.endpoint_online(&endpoint, false);
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(f.correlator.is_pending("tok-/3311/0/5850"));
        assert_eq!(f.outbox.len(), 1);
    }
}
