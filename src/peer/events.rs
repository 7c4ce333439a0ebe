//! Bridge event envelopes published to the peer bus

use serde::Serialize;
use uuid::Uuid;

use super::PeerMessage;
use crate::correlator::{OperationOutcome, Verb};
use crate::registry::{Endpoint, EndpointStatus};

/// Source identifier stamped on every envelope
const SOURCE: &str = "connector-bridge";

/// Kind of event published to the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Registered,
    Updated,
    Deregistered,
    Expired,
    Notification,
    CommandResult,
}

impl EventKind {
    /// Envelope `type` field
    #[must_use]
    pub const fn event_type(self) -> &'static str {
        match self {
            Self::Registered => "endpoint.registered",
            Self::Updated => "endpoint.updated",
            Self::Deregistered => "endpoint.deregistered",
            Self::Expired => "endpoint.expired",
            Self::Notification => "resource.notification",
            Self::CommandResult => "command.result",
        }
    }

    /// Last segment of the logical topic
    #[must_use]
    pub const fn segment(self) -> &'static str {
        match self {
            Self::Registered => "registered",
            Self::Updated => "updated",
            Self::Deregistered => "deregistered",
            Self::Expired => "expired",
            Self::Notification => "notify",
            Self::CommandResult => "result",
        }
    }
}

/// Topic naming for a topic prefix
#[derive(Debug, Clone)]
pub struct TopicScheme {
    prefix: String,
}

impl Default for TopicScheme {
    fn default() -> Self {
        Self::new("connector")
    }
}

impl TopicScheme {
    /// Scheme rooted at `prefix`
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into().trim_matches('/').to_string(),
        }
    }

    /// Logical topic for an endpoint event: `{prefix}/{endpoint}/{kind}`
    #[must_use]
    pub fn topic(&self, endpoint: &str, kind: EventKind) -> String {
        format!("{}/{endpoint}/{}", self.prefix, kind.segment())
    }

    /// Bus channel for an event kind: `{prefix}.{kind}`
    #[must_use]
    pub fn channel(&self, kind: EventKind) -> String {
        format!("{}.{}", self.prefix, kind.segment())
    }

    /// Bus channel carrying peer commands
    #[must_use]
    pub fn command_channel(&self) -> String {
        format!("{}.commands", self.prefix)
    }
}

/// Envelope of every message the bridge publishes
#[derive(Debug, Clone, Serialize)]
pub struct BridgeEvent {
    /// Unique event ID (UUID v4)
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Endpoint name
    pub subject: String,
    pub source: String,
    pub topic: String,
    pub data: serde_json::Value,
    /// RFC 3339 timestamp
    pub timestamp: String,
}

impl BridgeEvent {
    /// Create an event with generated `id` and `timestamp`
    #[must_use]
    pub fn new(kind: EventKind, endpoint: &str, topics: &TopicScheme, data: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type: kind.event_type().to_string(),
            subject: endpoint.to_string(),
            source: SOURCE.to_string(),
            topic: topics.topic(endpoint, kind),
            data,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Wrap into a bus message
    #[must_use]
    pub fn into_message(self, kind: EventKind, topics: &TopicScheme) -> PeerMessage {
        PeerMessage {
            topic: self.topic.clone(),
            channel: topics.channel(kind),
            key: self.subject.clone(),
            payload: serde_json::to_value(&self).unwrap_or(serde_json::Value::Null),
        }
    }
}

/// Build an `endpoint.registered` or `endpoint.updated` message
#[must_use]
pub fn endpoint_online(endpoint: &Endpoint, reregistered: bool, topics: &TopicScheme) -> PeerMessage {
    let kind = if reregistered {
        EventKind::Updated
    } else {
        EventKind::Registered
    };
    let resources: Vec<serde_json::Value> = endpoint
        .resources
        .iter()
        .map(|r| {
            serde_json::json!({
                "path": r.uri,
                "ct": r.content_type,
                "rt": r.resource_type,
                "obs": r.observable,
                "subscribed": r.subscribed,
            })
        })
        .collect();

    BridgeEvent::new(
        kind,
        &endpoint.name,
        topics,
        serde_json::json!({
            "ep": endpoint.name,
            "ept": endpoint.endpoint_type,
            "q": endpoint.queue_mode,
            "resources": resources,
        }),
    )
    .into_message(kind, topics)
}

/// Build an `endpoint.deregistered` or `endpoint.expired` message
///
/// The endpoint status decides which: `Expired` marks timeout loss, anything
/// else a graceful deregistration.
#[must_use]
pub fn endpoint_offline(endpoint: &Endpoint, topics: &TopicScheme) -> PeerMessage {
    let kind = if endpoint.status == EndpointStatus::Expired {
        EventKind::Expired
    } else {
        EventKind::Deregistered
    };
    BridgeEvent::new(
        kind,
        &endpoint.name,
        topics,
        serde_json::json!({ "ep": endpoint.name, "ept": endpoint.endpoint_type }),
    )
    .into_message(kind, topics)
}

/// Decoded resource value notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceValue {
    pub endpoint: String,
    pub uri: String,
    pub content_type: Option<String>,
    pub value: Option<String>,
    pub max_age: Option<u64>,
}

/// Build a `resource.notification` message
#[must_use]
pub fn resource_value(notification: &ResourceValue, topics: &TopicScheme) -> PeerMessage {
    BridgeEvent::new(
        EventKind::Notification,
        &notification.endpoint,
        topics,
        serde_json::json!({
            "ep": notification.endpoint,
            "path": notification.uri,
            "ct": notification.content_type,
            "value": notification.value,
            "max_age": notification.max_age,
        }),
    )
    .into_message(EventKind::Notification, topics)
}

/// Build a `command.result` message for a peer command
#[must_use]
pub fn command_result(
    reply_token: &str,
    verb: Option<Verb>,
    endpoint: Option<&str>,
    uri: Option<&str>,
    outcome: &OperationOutcome,
    topics: &TopicScheme,
) -> PeerMessage {
    let mut data = serde_json::json!({
        "token": reply_token,
        "ep": endpoint,
        "path": uri,
        "verb": verb.map(Verb::as_str),
    });

    match outcome {
        OperationOutcome::Success {
            status,
            content_type,
            value,
        } => {
            data["ok"] = true.into();
            data["status"] = (*status).into();
            data["ct"] = serde_json::json!(content_type);
            data["value"] = serde_json::json!(value);
        }
        OperationOutcome::Failure { status, error } => {
            data["ok"] = false.into();
            data["status"] = serde_json::json!(status);
            data["error"] = error.clone().into();
        }
        OperationOutcome::Timeout => {
            data["ok"] = false.into();
            data["error"] = "timeout".into();
        }
    }

    // Rejected commands may not name an endpoint
    let subject = endpoint.unwrap_or("_");
    BridgeEvent::new(EventKind::CommandResult, subject, topics, data)
        .into_message(EventKind::CommandResult, topics)
}
