//! Shared test utilities

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use connector_bridge::connector::{
    DeviceApi, DeviceReply, DeviceRequest, DiscoveredEndpoint, EndpointFilter, WebhookApi,
};
use connector_bridge::registry::ResourceDescriptor;
use connector_bridge::retry::RetryPolicy;
use connector_bridge::{BridgeCore, BridgeSettings, Error, PeerBus, PeerMessage, Result};
use tokio::sync::mpsc;

/// Device server double: replies are scripted per call, defaulting to an
/// async token derived from a counter
#[derive(Default)]
pub struct FakeDevice {
    pub requests: Mutex<Vec<DeviceRequest>>,
    pub replies: Mutex<VecDeque<Result<DeviceReply>>>,
    pub endpoints: Mutex<Vec<DiscoveredEndpoint>>,
    pub resources: Mutex<HashMap<String, Vec<ResourceDescriptor>>>,
    counter: Mutex<u32>,
}

impl FakeDevice {
    pub fn push_reply(&self, reply: Result<DeviceReply>) {
        self.replies.lock().unwrap().push_back(reply);
    }

    pub fn requests(&self) -> Vec<DeviceRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn add_endpoint(&self, name: &str, resources: Vec<ResourceDescriptor>) {
        self.endpoints.lock().unwrap().push(DiscoveredEndpoint {
            name: name.to_string(),
            endpoint_type: Some("test".to_string()),
            status: Some("ACTIVE".to_string()),
            queue_mode: false,
        });
        self.resources
            .lock()
            .unwrap()
            .insert(name.to_string(), resources);
    }
}

#[async_trait]
impl DeviceApi for FakeDevice {
    async fn resource_operation(&self, request: &DeviceRequest) -> Result<DeviceReply> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(reply) = self.replies.lock().unwrap().pop_front() {
            return reply;
        }
        let mut counter = self.counter.lock().unwrap();
        *counter += 1;
        Ok(DeviceReply::Async {
            token: format!("async-{counter}"),
        })
    }

    async fn list_endpoints(&self, filter: &EndpointFilter) -> Result<Vec<DiscoveredEndpoint>> {
        Ok(self
            .endpoints
            .lock()
            .unwrap()
            .iter()
            .filter(|e| {
                filter.endpoint_type.is_none() || e.endpoint_type == filter.endpoint_type
            })
            .cloned()
            .collect())
    }

    async fn list_resources(&self, endpoint: &str) -> Result<Vec<ResourceDescriptor>> {
        self.resources
            .lock()
            .unwrap()
            .get(endpoint)
            .cloned()
            .ok_or_else(|| Error::NotFound(endpoint.to_string()))
    }
}

/// Webhook API double holding the server-side callback
#[derive(Default)]
pub struct FakeWebhookApi {
    pub callback: Mutex<Option<String>>,
    pub headers: Mutex<HashMap<String, String>>,
    /// Number of upcoming `set_callback` calls that fail with 503
    pub failures: Mutex<u32>,
    pub set_calls: Mutex<u32>,
}

#[async_trait]
impl WebhookApi for FakeWebhookApi {
    async fn set_callback(&self, url: &str, headers: &HashMap<String, String>) -> Result<()> {
        *self.set_calls.lock().unwrap() += 1;
        let mut failures = self.failures.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return Err(Error::DeviceServer {
                status: 503,
                message: "unavailable".to_string(),
            });
        }
        *self.callback.lock().unwrap() = Some(url.to_string());
        *self.headers.lock().unwrap() = headers.clone();
        Ok(())
    }

    async fn get_callback(&self) -> Result<Option<String>> {
        Ok(self.callback.lock().unwrap().clone())
    }

    async fn clear_callback(&self) -> Result<()> {
        *self.callback.lock().unwrap() = None;
        Ok(())
    }
}

/// Peer bus double recording every publication
#[derive(Default)]
pub struct RecordingBus {
    pub published: Mutex<Vec<PeerMessage>>,
    pub commands: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
}

impl RecordingBus {
    pub fn published(&self) -> Vec<PeerMessage> {
        self.published.lock().unwrap().clone()
    }

    /// Envelope `type` of every published message, in order
    pub fn event_types(&self) -> Vec<String> {
        self.published()
            .iter()
            .map(|m| m.payload["type"].as_str().unwrap_or_default().to_string())
            .collect()
    }
}

#[async_trait]
impl PeerBus for RecordingBus {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn publish(&self, message: &PeerMessage) -> Result<()> {
        self.published.lock().unwrap().push(message.clone());
        Ok(())
    }

    async fn subscribe(&self, _channel: &str) -> Result<mpsc::Receiver<Vec<u8>>> {
        let (tx, rx) = mpsc::channel(16);
        *self.commands.lock().unwrap() = Some(tx);
        Ok(rx)
    }
}

/// A core wired to in-memory doubles
pub struct TestBridge {
    pub core: Arc<BridgeCore>,
    pub device: Arc<FakeDevice>,
    pub webhook_api: Arc<FakeWebhookApi>,
    pub bus: Arc<RecordingBus>,
}

impl TestBridge {
    /// Publish everything queued and return what the bus saw
    pub async fn drain(&self) -> Vec<PeerMessage> {
        self.core.outbox.flush().await.unwrap();
        self.bus.published()
    }
}

/// Settings with fast retries
pub fn test_settings() -> BridgeSettings {
    BridgeSettings {
        async_timeout: Duration::from_secs(5),
        registration_policy: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        },
        ..BridgeSettings::default()
    }
}

/// Build a bridge with default test settings
pub fn test_bridge() -> TestBridge {
    test_bridge_with(test_settings())
}

/// Build a bridge with the given settings
pub fn test_bridge_with(settings: BridgeSettings) -> TestBridge {
    let device = Arc::new(FakeDevice::default());
    let webhook_api = Arc::new(FakeWebhookApi::default());
    let bus = Arc::new(RecordingBus::default());
    let core = Arc::new(BridgeCore::new(
        settings,
        device.clone(),
        webhook_api.clone(),
        bus.clone(),
    ));
    TestBridge {
        core,
        device,
        webhook_api,
        bus,
    }
}

/// Registration webhook body for one endpoint
pub fn registration(kind: &str, endpoint: &str, resources: &[(&str, bool)]) -> String {
    let resources: Vec<serde_json::Value> = resources
        .iter()
        .map(|(path, obs)| serde_json::json!({ "path": path, "obs": obs }))
        .collect();
    serde_json::json!({ kind: [{ "ep": endpoint, "ept": "light", "resources": resources }] })
        .to_string()
}
