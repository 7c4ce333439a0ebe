//! Pending async operation types

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Resource operation verb
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verb {
    Read,
    Write,
    Execute,
    Delete,
    Observe,
    StopObserve,
}

impl Verb {
    /// Parse a verb as spelled in peer commands
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "get" | "read" => Some(Self::Read),
            "put" | "write" => Some(Self::Write),
            "post" | "execute" => Some(Self::Execute),
            "delete" => Some(Self::Delete),
            "observe" | "subscribe" => Some(Self::Observe),
            "unobserve" | "unsubscribe" | "stop_observe" => Some(Self::StopObserve),
            _ => None,
        }
    }

    /// Whether the verb toggles a subscription flag
    #[must_use]
    pub const fn is_subscription(self) -> bool {
        matches!(self, Self::Observe | Self::StopObserve)
    }

    /// Canonical lowercase name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Read => "get",
            Self::Write => "put",
            Self::Execute => "post",
            Self::Delete => "delete",
            Self::Observe => "observe",
            Self::StopObserve => "unobserve",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final result of a resource operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutcome {
    /// Device answered with a success status
    Success {
        status: u16,
        content_type: Option<String>,
        value: Option<String>,
    },
    /// Device or server reported an error
    Failure { status: Option<u16>, error: String },
    /// No answer arrived before the deadline
    Timeout,
}

impl OperationOutcome {
    /// Whether the operation succeeded
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// What to do once a pending operation resolves or times out
#[derive(Debug)]
pub enum Continuation {
    /// Publish a command result to the peer, echoing the peer's token
    ReplyToPeer { reply_token: String },
    /// Hand the outcome to a local awaiting caller
    Waiter(oneshot::Sender<OperationOutcome>),
    /// Nothing beyond logging
    Discard,
}

/// An operation dispatched to the device server whose reply arrives later
#[derive(Debug)]
pub struct PendingOperation {
    /// Correlation token
    pub token: String,
    pub verb: Verb,
    pub endpoint: String,
    pub uri: String,
    pub created_at: Instant,
    pub deadline: Instant,
    /// Subscription flag before an optimistic update, restored on failure
    pub previous_subscription: Option<bool>,
    pub continuation: Continuation,
}

impl PendingOperation {
    /// Create a pending operation created now with the given deadline
    #[must_use]
    pub fn new(
        token: impl Into<String>,
        verb: Verb,
        endpoint: impl Into<String>,
        uri: impl Into<String>,
        deadline: Instant,
        continuation: Continuation,
    ) -> Self {
        Self {
            token: token.into(),
            verb,
            endpoint: endpoint.into(),
            uri: uri.into(),
            created_at: Instant::now(),
            deadline,
            previous_subscription: None,
            continuation,
        }
    }

    /// Record the subscription flag to restore if the operation fails
    #[must_use]
    pub const fn with_previous_subscription(mut self, previous: Option<bool>) -> Self {
        self.previous_subscription = previous;
        self
    }

    /// Whether this is a subscription change on the given resource
    #[must_use]
    pub fn touches_subscription(&self, endpoint: &str, uri: &str) -> bool {
        self.verb.is_subscription() && self.endpoint == endpoint && self.uri == uri
    }
}
