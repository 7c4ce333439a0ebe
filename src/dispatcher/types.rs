//! Inbound webhook payload types
//!
//! The device server batches several message kinds in one JSON object; each
//! top-level key selects a kind and unknown keys are ignored.
//!
//! Object keys carry no order, so a batch is always applied in a fixed one:
//!
//! 1. `registrations`
//! 2. `reg-updates`
//! 3. `de-registrations`
//! 4. `registrations-expired`
//! 5. `async-responses`
//! 6. `notifications`
//!
//! A name that is both registered and de-registered in one batch therefore
//! ends up removed.

use base64::Engine as _;
use serde::Deserialize;

use crate::correlator::OperationOutcome;
use crate::registry::{EndpointRegistration, ResourceDescriptor};
use crate::{Error, Result};

/// Raw webhook body
#[derive(Debug, Default, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub notifications: Vec<NotificationEntry>,
    #[serde(default)]
    pub registrations: Vec<RegistrationEntry>,
    #[serde(default, rename = "reg-updates")]
    pub reg_updates: Vec<RegistrationEntry>,
    #[serde(default, rename = "de-registrations")]
    pub de_registrations: Vec<String>,
    #[serde(default, rename = "registrations-expired")]
    pub registrations_expired: Vec<String>,
    #[serde(default, rename = "async-responses")]
    pub async_responses: Vec<AsyncResponseEntry>,
}

/// Resource value change
#[derive(Debug, Clone, Deserialize)]
pub struct NotificationEntry {
    pub ep: String,
    pub path: String,
    #[serde(default)]
    pub ct: Option<String>,
    /// Base64-encoded value
    #[serde(default)]
    pub payload: Option<String>,
    #[serde(default, rename = "max-age")]
    pub max_age: Option<u64>,
}

/// Endpoint registration or registration update
#[derive(Debug, Clone, Deserialize)]
pub struct RegistrationEntry {
    pub ep: String,
    #[serde(default)]
    pub ept: Option<String>,
    #[serde(default)]
    pub q: bool,
    #[serde(default)]
    pub resources: Vec<RegistrationResource>,
}

/// Resource announced in a registration
#[derive(Debug, Clone, Deserialize)]
pub struct RegistrationResource {
    pub path: String,
    #[serde(default)]
    pub ct: Option<String>,
    #[serde(default)]
    pub rt: Option<String>,
    #[serde(default)]
    pub obs: bool,
}

/// Reply to an operation the server accepted asynchronously
#[derive(Debug, Clone, Deserialize)]
pub struct AsyncResponseEntry {
    pub id: String,
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub ct: Option<String>,
    /// Base64-encoded value
    #[serde(default)]
    pub payload: Option<String>,
}

/// One kind of inbound message, in processing order
#[derive(Debug, Clone)]
pub enum InboundMessage {
    NewRegistrations(Vec<EndpointRegistration>),
    ReRegistrations(Vec<EndpointRegistration>),
    Deregistrations(Vec<String>),
    RegistrationsExpired(Vec<String>),
    AsyncResponses(Vec<AsyncResponseEntry>),
    Notifications(Vec<NotificationEntry>),
}

impl WebhookPayload {
    /// Parse a raw body
    ///
    /// # Errors
    ///
    /// Returns `MalformedPayload` if the body is not a JSON object or a known
    /// key has the wrong shape
    pub fn parse(raw: &str) -> Result<Self> {
        let value: serde_json::Value =
            serde_json::from_str(raw).map_err(|e| Error::MalformedPayload(e.to_string()))?;
        if !value.is_object() {
            return Err(Error::MalformedPayload(
                "expected a JSON object".to_string(),
            ));
        }
        serde_json::from_value(value).map_err(|e| Error::MalformedPayload(e.to_string()))
    }

    /// Split into messages in the fixed batch order described above
    #[must_use]
    pub fn into_messages(self) -> Vec<InboundMessage> {
        let mut messages = Vec::new();
        if !self.registrations.is_empty() {
            messages.push(InboundMessage::NewRegistrations(
                self.registrations.into_iter().map(Into::into).collect(),
            ));
        }
        if !self.reg_updates.is_empty() {
            messages.push(InboundMessage::ReRegistrations(
                self.reg_updates.into_iter().map(Into::into).collect(),
            ));
        }
        if !self.de_registrations.is_empty() {
            messages.push(InboundMessage::Deregistrations(self.de_registrations));
        }
        if !self.registrations_expired.is_empty() {
            messages.push(InboundMessage::RegistrationsExpired(
                self.registrations_expired,
            ));
        }
        if !self.async_responses.is_empty() {
            messages.push(InboundMessage::AsyncResponses(self.async_responses));
        }
        if !self.notifications.is_empty() {
            messages.push(InboundMessage::Notifications(self.notifications));
        }
        messages
    }
}

impl From<RegistrationEntry> for EndpointRegistration {
    fn from(entry: RegistrationEntry) -> Self {
        Self {
            name: entry.ep,
            endpoint_type: entry.ept,
            queue_mode: entry.q,
            resources: entry
                .resources
                .into_iter()
                .map(|r| ResourceDescriptor {
                    uri: r.path,
                    content_type: r.ct,
                    resource_type: r.rt,
                    observable: r.obs,
                })
                .collect(),
        }
    }
}

impl AsyncResponseEntry {
    /// Outcome carried by this response
    ///
    /// A missing status counts as success unless an error is present.
    #[must_use]
    pub fn outcome(&self) -> OperationOutcome {
        let value = self.payload.as_deref().map(decode_value);
        let status = self.status.unwrap_or(200);

        if self.error.is_none() && (200..300).contains(&status) {
            return OperationOutcome::Success {
                status,
                content_type: self.ct.clone(),
                value,
            };
        }

        OperationOutcome::Failure {
            status: Some(status),
            error: self
                .error
                .clone()
                .or(value)
                .unwrap_or_else(|| format!("status {status}")),
        }
    }
}

/// Decode a base64 value to text, replacing invalid UTF-8
///
/// Values that are not base64 pass through unchanged.
#[must_use]
pub fn decode_value(raw: &str) -> String {
    base64::engine::general_purpose::STANDARD
        .decode(raw.trim())
        .map_or_else(
            |_| raw.to_string(),
            |bytes| String::from_utf8_lossy(&bytes).into_owned(),
        )
}
