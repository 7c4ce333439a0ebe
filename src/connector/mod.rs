//! Device-management server capability contracts
//!
//! The bridge talks to the server through two independent traits so either
//! side can be replaced by a test double: [`WebhookApi`] for the callback
//! configuration and [`DeviceApi`] for resource operations and discovery.

mod client;

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use client::HttpConnector;

use crate::Result;
use crate::correlator::Verb;
use crate::registry::ResourceDescriptor;

/// Server-side webhook configuration
#[async_trait]
pub trait WebhookApi: Send + Sync {
    /// Register the callback URL with optional headers the server must send back
    async fn set_callback(&self, url: &str, headers: &HashMap<String, String>) -> Result<()>;

    /// Read the currently registered callback URL, if any
    async fn get_callback(&self) -> Result<Option<String>>;

    /// Remove the registered callback
    async fn clear_callback(&self) -> Result<()>;
}

/// Resource operations and discovery against registered devices
#[async_trait]
pub trait DeviceApi: Send + Sync {
    /// Issue a resource operation
    async fn resource_operation(&self, request: &DeviceRequest) -> Result<DeviceReply>;

    /// List endpoints known to the server
    async fn list_endpoints(&self, filter: &EndpointFilter) -> Result<Vec<DiscoveredEndpoint>>;

    /// List the resources of one endpoint
    async fn list_resources(&self, endpoint: &str) -> Result<Vec<ResourceDescriptor>>;
}

/// A single resource operation addressed to one endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRequest {
    pub verb: Verb,
    pub endpoint: String,
    pub uri: String,
    pub value: Option<String>,
    /// Extra query options passed through to the server
    pub query: BTreeMap<String, String>,
}

/// Server reply to a resource operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceReply {
    /// The result is available now
    Immediate {
        status: u16,
        content_type: Option<String>,
        value: Option<String>,
    },
    /// The result will arrive as an async response carrying this token
    Async { token: String },
}

/// Endpoint discovery filter
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointFilter {
    /// Only endpoints of this device type
    pub endpoint_type: Option<String>,
}

/// Endpoint as listed by the discovery API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredEndpoint {
    pub name: String,
    #[serde(rename = "type", default)]
    pub endpoint_type: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(rename = "q", default)]
    pub queue_mode: bool,
}
