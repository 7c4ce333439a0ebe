//! Endpoint registry types

use serde::{Deserialize, Serialize};

/// Liveness of a registered endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointStatus {
    Registered,
    ReRegistered,
    DeregisterPending,
    Expired,
}

/// An addressable data item exposed by an endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    /// URI path, e.g. `/3311/0/5850`
    pub uri: String,
    /// Content-type hint advertised by the device
    pub content_type: Option<String>,
    /// Resource type advertised by the device
    pub resource_type: Option<String>,
    /// Whether the resource supports async notifications
    pub observable: bool,
    /// Whether the bridge holds a subscription on it
    pub subscribed: bool,
}

/// A device known to the device-management server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub name: String,
    pub endpoint_type: Option<String>,
    pub status: EndpointStatus,
    /// Queue-mode devices are only reachable after they wake up
    pub queue_mode: bool,
    pub resources: Vec<Resource>,
    pub registered_at: chrono::DateTime<chrono::Utc>,
}

impl Endpoint {
    /// Find a resource by URI
    #[must_use]
    pub fn resource(&self, uri: &str) -> Option<&Resource> {
        self.resources.iter().find(|r| r.uri == uri)
    }

    /// URIs of all subscribed resources, in registration order
    #[must_use]
    pub fn subscriptions(&self) -> Vec<String> {
        self.resources
            .iter()
            .filter(|r| r.subscribed)
            .map(|r| r.uri.clone())
            .collect()
    }
}

/// Resource as announced in a registration (no subscription state)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub uri: String,
    pub content_type: Option<String>,
    pub resource_type: Option<String>,
    pub observable: bool,
}

impl ResourceDescriptor {
    /// Descriptor for a plain, non-observable resource
    #[must_use]
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            content_type: None,
            resource_type: None,
            observable: false,
        }
    }

    /// Mark the descriptor observable
    #[must_use]
    pub const fn observable(mut self) -> Self {
        self.observable = true;
        self
    }
}

/// Registration message for one endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointRegistration {
    pub name: String,
    pub endpoint_type: Option<String>,
    pub queue_mode: bool,
    pub resources: Vec<ResourceDescriptor>,
}

impl EndpointRegistration {
    /// Registration with the given name and resources
    #[must_use]
    pub fn new(name: impl Into<String>, resources: Vec<ResourceDescriptor>) -> Self {
        Self {
            name: name.into(),
            endpoint_type: None,
            queue_mode: false,
            resources,
        }
    }
}
