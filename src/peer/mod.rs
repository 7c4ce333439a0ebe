//! Peer message bus side of the bridge
//!
//! - [`PeerBus`]: publish/subscribe capability implemented by bus adapters
//! - [`Outbox`]: bounded, non-blocking outbound queue with reconnection
//! - [`PeerTranslator`]: bridge events to envelopes and peer commands to
//!   resource operations

pub mod command;
pub mod events;
mod iggy;
mod outbox;
mod translator;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub use command::PeerCommand;
pub use events::{BridgeEvent, EventKind, TopicScheme};
pub use iggy::{IggyBus, IggyConfig};
pub use outbox::{Outbox, OutboxStats};
pub use translator::PeerTranslator;

use crate::Result;

/// A message ready to be published on the peer bus
#[derive(Debug, Clone, PartialEq)]
pub struct PeerMessage {
    /// Logical topic, e.g. `connector/dev1/registered`
    pub topic: String,
    /// Bus-level channel the adapter publishes to, e.g. `connector.registered`
    pub channel: String,
    /// Partitioning key (the endpoint name)
    pub key: String,
    /// Serialized envelope
    pub payload: serde_json::Value,
}

/// Publish/subscribe primitive offered by the peer bus
#[async_trait]
pub trait PeerBus: Send + Sync {
    /// Establish or re-establish the connection
    async fn connect(&self) -> Result<()>;

    /// Publish one message
    async fn publish(&self, message: &PeerMessage) -> Result<()>;

    /// Subscribe to a channel, receiving raw message payloads
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<Vec<u8>>>;
}
