//! Resource operations against registered devices
//!
//! The executor resolves a resource address to one endpoint, issues the
//! operation through the [`DeviceApi`], and either returns the immediate
//! result or tracks the async token with the correlator. Subscription verbs
//! set the registry flag optimistically when dispatched asynchronously; the
//! previous flag travels with the pending operation so a failure or timeout
//! can restore it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::connector::{DeviceApi, DeviceReply, DeviceRequest, DiscoveredEndpoint, EndpointFilter};
use crate::correlator::{
    AsyncCorrelator, Continuation, OperationOutcome, PendingOperation, Tracked, Verb,
};
use crate::registry::{EndpointRegistry, ResourceDescriptor};
use crate::{Error, Result};

/// Target of a resource operation
///
/// Without an endpoint the URI must be exposed by exactly one registered
/// endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceAddress {
    pub endpoint: Option<String>,
    pub uri: String,
}

impl ResourceAddress {
    /// Address a resource on a named endpoint
    #[must_use]
    pub fn new(endpoint: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            uri: uri.into(),
        }
    }

    /// Address a resource by URI alone
    #[must_use]
    pub fn uri_only(uri: impl Into<String>) -> Self {
        Self {
            endpoint: None,
            uri: uri.into(),
        }
    }
}

/// Per-operation options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationOptions {
    /// Deadline for an async reply, overriding the default
    pub timeout: Option<Duration>,
    /// Extra query parameters passed to the device server
    pub query: BTreeMap<String, String>,
}

/// A requested resource operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationRequest {
    pub verb: Verb,
    pub address: ResourceAddress,
    pub value: Option<String>,
    pub options: OperationOptions,
}

impl OperationRequest {
    /// Request without value or options
    #[must_use]
    pub fn new(verb: Verb, address: ResourceAddress) -> Self {
        Self {
            verb,
            address,
            value: None,
            options: OperationOptions::default(),
        }
    }

    #[must_use]
    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    #[must_use]
    pub fn with_options(mut self, options: OperationOptions) -> Self {
        self.options = options;
        self
    }
}

/// How a dispatched operation proceeded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
    /// The server answered synchronously; the continuation was not stored
    Completed(OperationOutcome),
    /// The reply will arrive as an async response with this token
    Pending { token: String },
}

/// Issues resource operations and keeps registry subscription flags honest
pub struct ResourceExecutor {
    registry: Arc<EndpointRegistry>,
    correlator: Arc<AsyncCorrelator>,
    device: Arc<dyn DeviceApi>,
    default_timeout: Duration,
}

impl ResourceExecutor {
    /// Create an executor
    #[must_use]
    pub fn new(
        registry: Arc<EndpointRegistry>,
        correlator: Arc<AsyncCorrelator>,
        device: Arc<dyn DeviceApi>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            correlator,
            device,
            default_timeout,
        }
    }

    /// Default deadline for async replies
    #[must_use]
    pub const fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Resolve an address to the endpoint that owns it
    ///
    /// # Errors
    ///
    /// Returns `UnknownEndpoint` if the named endpoint is not registered or
    /// no endpoint exposes the URI, `AmbiguousAddress` if several do
    pub fn resolve_endpoint(&self, address: &ResourceAddress) -> Result<String> {
        if let Some(endpoint) = &address.endpoint {
            if !self.registry.contains(endpoint) {
                return Err(Error::UnknownEndpoint(endpoint.clone()));
            }
            return Ok(endpoint.clone());
        }

        let mut owners = self.registry.endpoints_exposing(&address.uri);
        match owners.len() {
            0 => Err(Error::UnknownEndpoint(format!(
                "no endpoint exposes {}",
                address.uri
            ))),
            1 => Ok(owners.remove(0)),
            count => Err(Error::AmbiguousAddress {
                uri: address.uri.clone(),
                count,
            }),
        }
    }

    /// Issue an operation
    ///
    /// The continuation is stored with the pending operation when the server
    /// answers asynchronously. For immediate answers it is dropped and the
    /// caller reads the outcome from [`Dispatched::Completed`].
    ///
    /// # Errors
    ///
    /// Returns error if the address cannot be resolved, the server is
    /// unreachable, or the server reuses an outstanding token
    pub async fn perform(
        &self,
        request: OperationRequest,
        continuation: Continuation,
    ) -> Result<Dispatched> {
        let endpoint = self.resolve_endpoint(&request.address)?;
        let uri = request.address.uri;
        let verb = request.verb;

        let previous = if verb.is_subscription() {
            self.registry.is_subscribed(&endpoint, &uri)
        } else {
            None
        };

        let device_request = DeviceRequest {
            verb,
            endpoint: endpoint.clone(),
            uri: uri.clone(),
            value: request.value,
            query: request.options.query,
        };

        tracing::debug!(endpoint = %endpoint, uri = %uri, verb = %verb, "dispatching resource operation");

        let reply = match self.device.resource_operation(&device_request).await {
            Ok(reply) => reply,
            Err(Error::DeviceServer { status, message }) => {
                tracing::warn!(
                    endpoint = %endpoint,
                    uri = %uri,
                    verb = %verb,
                    status,
                    "device server rejected operation"
                );
                return Ok(Dispatched::Completed(OperationOutcome::Failure {
                    status: Some(status),
                    error: message,
                }));
            }
            Err(e) => return Err(e),
        };

        match reply {
            DeviceReply::Immediate {
                status,
                content_type,
                value,
            } => {
                let outcome = if (200..300).contains(&status) {
                    OperationOutcome::Success {
                        status,
                        content_type,
                        value,
                    }
                } else {
                    OperationOutcome::Failure {
                        status: Some(status),
                        error: value.unwrap_or_else(|| format!("status {status}")),
                    }
                };
                if verb.is_subscription() && outcome.is_success() {
                    self.reconcile_subscription(&endpoint, &uri, verb, previous, &outcome);
                }
                Ok(Dispatched::Completed(outcome))
            }
            DeviceReply::Async { token } => {
                if verb.is_subscription() {
                    self.set_flag(&endpoint, &uri, verb == Verb::Observe);
                }

                let timeout = request.options.timeout.unwrap_or(self.default_timeout);
                let operation = PendingOperation::new(
                    token.clone(),
                    verb,
                    &endpoint,
                    &uri,
                    Instant::now() + timeout,
                    continuation,
                )
                .with_previous_subscription(previous);

                match self.correlator.track(operation) {
                    Ok(Tracked::Pending) => Ok(Dispatched::Pending { token }),
                    Ok(Tracked::Settled(operation, outcome)) => {
                        // The continuation is dropped; the caller reads Completed
                        self.apply_subscription_outcome(&operation, &outcome);
                        Ok(Dispatched::Completed(outcome))
                    }
                    Err(e) => {
                        tracing::warn!(token = %token, error = %e, "server reused an outstanding token");
                        if let Some(previous) = previous.filter(|_| verb.is_subscription()) {
                            self.set_flag(&endpoint, &uri, previous);
                        }
                        Err(e)
                    }
                }
            }
        }
    }

    /// Confirm or roll back the subscription flag of a settled operation
    ///
    /// A successful subscription verb sets the flag it asked for; anything
    /// else restores the flag recorded at dispatch time. While another
    /// change on the same resource is in flight the flag is left to it.
    pub fn apply_subscription_outcome(&self, operation: &PendingOperation, outcome: &OperationOutcome) {
        if !operation.verb.is_subscription() {
            return;
        }
        self.reconcile_subscription(
            &operation.endpoint,
            &operation.uri,
            operation.verb,
            operation.previous_subscription,
            outcome,
        );
    }

    fn reconcile_subscription(
        &self,
        endpoint: &str,
        uri: &str,
        verb: Verb,
        previous: Option<bool>,
        outcome: &OperationOutcome,
    ) {
        let confirmed = outcome.is_success().then_some(verb == Verb::Observe);
        if self.correlator.rebase_subscription(endpoint, uri, confirmed) {
            tracing::debug!(
                endpoint = %endpoint,
                uri = %uri,
                verb = %verb,
                "subscription change settled with another in flight"
            );
            return;
        }

        if let Some(flag) = confirmed {
            self.set_flag(endpoint, uri, flag);
        } else if let Some(previous) = previous {
            tracing::info!(
                endpoint = %endpoint,
                uri = %uri,
                verb = %verb,
                restored = previous,
                "subscription change failed, flag restored"
            );
            self.set_flag(endpoint, uri, previous);
        }
    }

    /// Read a resource value
    ///
    /// # Errors
    ///
    /// See [`Self::perform`]
    pub async fn read(&self, endpoint: &str, uri: &str, continuation: Continuation) -> Result<Dispatched> {
        self.perform(
            OperationRequest::new(Verb::Read, ResourceAddress::new(endpoint, uri)),
            continuation,
        )
        .await
    }

    /// Write a resource value
    ///
    /// # Errors
    ///
    /// See [`Self::perform`]
    pub async fn write(
        &self,
        endpoint: &str,
        uri: &str,
        value: &str,
        continuation: Continuation,
    ) -> Result<Dispatched> {
        self.perform(
            OperationRequest::new(Verb::Write, ResourceAddress::new(endpoint, uri)).with_value(value),
            continuation,
        )
        .await
    }

    /// Subscribe to change notifications on a resource
    ///
    /// # Errors
    ///
    /// See [`Self::perform`]
    pub async fn observe(&self, endpoint: &str, uri: &str, continuation: Continuation) -> Result<Dispatched> {
        self.perform(
            OperationRequest::new(Verb::Observe, ResourceAddress::new(endpoint, uri)),
            continuation,
        )
        .await
    }

    /// Cancel a subscription
    ///
    /// # Errors
    ///
    /// See [`Self::perform`]
    pub async fn stop_observe(
        &self,
        endpoint: &str,
        uri: &str,
        continuation: Continuation,
    ) -> Result<Dispatched> {
        self.perform(
            OperationRequest::new(Verb::StopObserve, ResourceAddress::new(endpoint, uri)),
            continuation,
        )
        .await
    }

    /// List endpoints known to the server
    ///
    /// # Errors
    ///
    /// Returns error if the server call fails
    pub async fn discover_endpoints(&self, filter: &EndpointFilter) -> Result<Vec<DiscoveredEndpoint>> {
        self.device.list_endpoints(filter).await
    }

    /// List resources of one endpoint
    ///
    /// # Errors
    ///
    /// Returns error if the server call fails
    pub async fn discover_resources(&self, endpoint: &str) -> Result<Vec<ResourceDescriptor>> {
        self.device.list_resources(endpoint).await
    }

    fn set_flag(&self, endpoint: &str, uri: &str, subscribed: bool) {
        // The endpoint may have deregistered while the operation was in flight
        if let Err(e) = self.registry.set_subscribed(endpoint, uri, subscribed) {
            tracing::debug!(endpoint, uri, error = %e, "subscription flag not updated");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::registry::{EndpointRegistration, EndpointStatus};

    /// Device double answering every operation with a fixed reply
    struct FixedDevice {
        reply: Mutex<Option<Result<DeviceReply>>>,
        seen: Mutex<Vec<DeviceRequest>>,
    }

    impl FixedDevice {
        fn new(reply: Result<DeviceReply>) -> Arc<Self> {
            Arc::new(Self {
                reply: Mutex::new(Some(reply)),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl DeviceApi for FixedDevice {
        async fn resource_operation(&self, request: &DeviceRequest) -> Result<DeviceReply> {
            self.seen.lock().unwrap().push(request.clone());
            self.reply
                .lock()
                .unwrap()
                .take()
                .unwrap_or(Ok(DeviceReply::Immediate {
                    status: 200,
                    content_type: None,
                    value: None,
                }))
        }

        async fn list_endpoints(&self, _filter: &EndpointFilter) -> Result<Vec<DiscoveredEndpoint>> {
            Ok(Vec::new())
        }

        async fn list_resources(&self, _endpoint: &str) -> Result<Vec<ResourceDescriptor>> {
            Ok(Vec::new())
        }
    }

    fn setup(reply: Result<DeviceReply>) -> (ResourceExecutor, Arc<EndpointRegistry>, Arc<AsyncCorrelator>, Arc<FixedDevice>) {
        let registry = Arc::new(EndpointRegistry::new());
        let correlator = Arc::new(AsyncCorrelator::new());
        let device = FixedDevice::new(reply);
        registry.register_or_update(
            &EndpointRegistration::new(
                "dev1",
                vec![ResourceDescriptor::new("/3311/0/5850").observable()],
            ),
            EndpointStatus::Registered,
        );
        let executor = ResourceExecutor::new(
            Arc::clone(&registry),
            Arc::clone(&correlator),
            device.clone(),
            Duration::from_secs(30),
        );
        (executor, registry, correlator, device)
    }

    #[test]
    fn resolves_uri_only_addresses() {
        let (executor, registry, _, _) = setup(Ok(DeviceReply::Async { token: "t".into() }));

        let owner = executor
            .resolve_endpoint(&ResourceAddress::uri_only("/3311/0/5850"))
            .unwrap();
        assert_eq!(owner, "dev1");

        assert!(matches!(
            executor.resolve_endpoint(&ResourceAddress::uri_only("/9/9/9")),
            Err(Error::UnknownEndpoint(_))
        ));

        registry.register_or_update(
            &EndpointRegistration::new("dev2", vec![ResourceDescriptor::new("/3311/0/5850")]),
            EndpointStatus::Registered,
        );
        assert!(matches!(
            executor.resolve_endpoint(&ResourceAddress::uri_only("/3311/0/5850")),
            Err(Error::AmbiguousAddress { count: 2, .. })
        ));
    }

    #[tokio::test]
    async fn unknown_endpoint_is_rejected_before_dispatch() {
        let (executor, _, _, device) = setup(Ok(DeviceReply::Async { token: "t".into() }));

        let result = executor.read("ghost", "/3/0/0", Continuation::Discard).await;
        assert!(matches!(result, Err(Error::UnknownEndpoint(_))));
        assert!(device.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn async_observe_is_tracked_with_optimistic_flag() {
        let (executor, registry, correlator, _) =
            setup(Ok(DeviceReply::Async { token: "tok-1".into() }));

        let dispatched = executor
            .observe("dev1", "/3311/0/5850", Continuation::Discard)
            .await
            .unwrap();
        assert_eq!(dispatched, Dispatched::Pending { token: "tok-1".into() });
        assert!(correlator.is_pending("tok-1"));
        assert_eq!(registry.is_subscribed("dev1", "/3311/0/5850"), Some(true));

        let op = correlator.resolve("tok-1").unwrap();
        assert_eq!(op.previous_subscription, Some(false));

        executor.apply_subscription_outcome(&op, &OperationOutcome::Timeout);
        assert_eq!(registry.is_subscribed("dev1", "/3311/0/5850"), Some(false));
    }

    #[tokio::test]
    async fn immediate_reply_completes_without_tracking() {
        let (executor, _, correlator, device) = setup(Ok(DeviceReply::Immediate {
            status: 200,
            content_type: Some("text/plain".into()),
            value: Some("42".into()),
        }));

        let request = OperationRequest::new(Verb::Write, ResourceAddress::uri_only("/3311/0/5850"))
            .with_value("1")
            .with_options(OperationOptions {
                timeout: None,
                query: BTreeMap::from([("noResp".to_string(), "true".to_string())]),
            });
        let dispatched = executor.perform(request, Continuation::Discard).await.unwrap();

        assert!(matches!(
            dispatched,
            Dispatched::Completed(OperationOutcome::Success { status: 200, .. })
        ));
        assert!(correlator.is_empty());

        let seen = device.seen.lock().unwrap();
        assert_eq!(seen[0].endpoint, "dev1");
        assert_eq!(seen[0].value.as_deref(), Some("1"));
        assert_eq!(seen[0].query.get("noResp").map(String::as_str), Some("true"));
    }

    #[tokio::test]
    async fn server_rejection_becomes_failure_outcome() {
        let (executor, registry, correlator, _) = setup(Err(Error::DeviceServer {
            status: 410,
            message: "endpoint gone".into(),
        }));

        let dispatched = executor
            .observe("dev1", "/3311/0/5850", Continuation::Discard)
            .await
            .unwrap();
        assert_eq!(
            dispatched,
            Dispatched::Completed(OperationOutcome::Failure {
                status: Some(410),
                error: "endpoint gone".into(),
            })
        );
        assert!(correlator.is_empty());
        assert_eq!(registry.is_subscribed("dev1", "/3311/0/5850"), Some(false));
    }

    #[tokio::test]
    async fn response_held_before_reply_completes_the_operation() {
        let (executor, registry, correlator, _) =
            setup(Ok(DeviceReply::Async { token: "tok-1".into() }));
        correlator.deliver(
            "tok-1",
            OperationOutcome::Success {
                status: 200,
                content_type: None,
                value: None,
            },
        );

        let dispatched = executor
            .observe("dev1", "/3311/0/5850", Continuation::Discard)
            .await
            .unwrap();
        assert!(matches!(
            dispatched,
            Dispatched::Completed(OperationOutcome::Success { status: 200, .. })
        ));
        assert!(correlator.is_empty());
        assert_eq!(correlator.held_len(), 0);
        assert_eq!(registry.is_subscribed("dev1", "/3311/0/5850"), Some(true));
    }

    #[tokio::test]
    async fn overlapping_observes_roll_back_to_confirmed_flag() {
        let (executor, registry, correlator, device) =
            setup(Ok(DeviceReply::Async { token: "tok-1".into() }));
        executor
            .observe("dev1", "/3311/0/5850", Continuation::Discard)
            .await
            .unwrap();
        *device.reply.lock().unwrap() = Some(Ok(DeviceReply::Async { token: "tok-2".into() }));
        executor
            .observe("dev1", "/3311/0/5850", Continuation::Discard)
            .await
            .unwrap();

        let first = correlator.resolve("tok-1").unwrap();
        executor.apply_subscription_outcome(&first, &OperationOutcome::Timeout);
        // Still in flight through tok-2
        assert_eq!(registry.is_subscribed("dev1", "/3311/0/5850"), Some(true));

        let second = correlator.resolve("tok-2").unwrap();
        executor.apply_subscription_outcome(&second, &OperationOutcome::Timeout);
        assert_eq!(registry.is_subscribed("dev1", "/3311/0/5850"), Some(false));
    }
}
