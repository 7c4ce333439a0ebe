//! Connector Bridge - device-server webhooks to a peer message bus
//!
//! This library provides the core functionality for the bridge:
//! - Endpoint registry with subscription state
//! - Webhook registration lifecycle with the device-management server
//! - Correlation of asynchronous device responses
//! - Translation to and from peer bus messages
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │            Device-management server                  │
//! │   webhook callbacks  │  REST resource operations    │
//! └──────────┬───────────────────────▲──────────────────┘
//!            │                       │
//! ┌──────────▼───────────────────────┴──────────────────┐
//! │                 Connector Bridge                     │
//! │  Dispatcher │ Registry │ Correlator │ Executor      │
//! └──────────┬───────────────────────▲──────────────────┘
//!            │ events                │ commands
//! ┌──────────▼───────────────────────┴──────────────────┐
//! │                  Peer message bus                    │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod bridge;
pub mod config;
pub mod connector;
pub mod correlator;
pub mod daemon;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod peer;
pub mod registry;
pub mod retry;
pub mod webhook;

pub use bridge::{BridgeCore, BridgeSettings};
pub use config::Config;
pub use correlator::{AsyncCorrelator, Continuation, OperationOutcome, PendingOperation, Verb};
pub use daemon::Daemon;
pub use dispatcher::{HandledResult, NotificationDispatcher};
pub use error::{Error, Result};
pub use executor::{
    Dispatched, OperationOptions, OperationRequest, ResourceAddress, ResourceExecutor,
};
pub use peer::{Outbox, PeerBus, PeerMessage, PeerTranslator};
pub use registry::{Endpoint, EndpointRegistry, EndpointStatus, Resource};
pub use webhook::{WebhookManager, WebhookState};
