//! Async correlator matching server async-response tokens to pending callers
//!
//! Deadlines use [`tokio::time::Instant`], which is monotonic and follows
//! the runtime clock, so wall-clock adjustments never expire an operation.
//!
//! The server may deliver an async response before the reply carrying its
//! token reaches us. Such responses are held for a short while and settle
//! the operation as soon as it is tracked.

pub mod types;

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

pub use types::{Continuation, OperationOutcome, PendingOperation, Verb};

use crate::{Error, Result};

/// How long an unmatched async response waits for its operation
const UNMATCHED_TTL: Duration = Duration::from_secs(30);

/// Unmatched responses held at once; the oldest is evicted beyond this
const UNMATCHED_CAPACITY: usize = 256;

/// Outcome of [`AsyncCorrelator::track`]
#[derive(Debug)]
pub enum Tracked {
    /// Waiting for its async response
    Pending,
    /// The response had already arrived; the operation was not stored
    Settled(PendingOperation, OperationOutcome),
}

/// Outcome of [`AsyncCorrelator::deliver`]
#[derive(Debug)]
pub enum Delivery {
    /// The response matched a pending operation, which is removed
    Matched(PendingOperation, OperationOutcome),
    /// No operation is pending yet; the response is held
    Held,
}

#[derive(Debug)]
struct Unmatched {
    outcome: OperationOutcome,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct State {
    pending: HashMap<String, PendingOperation>,
    unmatched: HashMap<String, Unmatched>,
}

/// Outstanding async operations keyed by correlation token
#[derive(Debug, Default)]
pub struct AsyncCorrelator {
    state: Mutex<State>,
}

impl AsyncCorrelator {
    /// Create an empty correlator
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start tracking an operation under its token
    ///
    /// A subscription change on a resource that already has one in flight
    /// inherits that operation's rollback flag, so the flag it restores is
    /// the last confirmed one rather than an optimistic value.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateToken` if the token is already live; the existing
    /// entry is kept and the new operation is dropped
    pub fn track(&self, mut operation: PendingOperation) -> Result<Tracked> {
        let mut state = self.lock();
        if state.pending.contains_key(&operation.token) {
            return Err(Error::DuplicateToken(operation.token));
        }

        if operation.verb.is_subscription() {
            let inflight = state
                .pending
                .values()
                .find(|op| op.touches_subscription(&operation.endpoint, &operation.uri))
                .map(|op| op.previous_subscription);
            if let Some(previous) = inflight {
                operation.previous_subscription = previous;
            }
        }

        let now = Instant::now();
        if let Some(early) = state
            .unmatched
            .remove(&operation.token)
            .filter(|u| u.expires_at > now)
        {
            tracing::debug!(
                token = %operation.token,
                endpoint = %operation.endpoint,
                uri = %operation.uri,
                "async response arrived before its operation"
            );
            return Ok(Tracked::Settled(operation, early.outcome));
        }

        tracing::debug!(
            token = %operation.token,
            verb = %operation.verb,
            endpoint = %operation.endpoint,
            uri = %operation.uri,
            "tracking async operation"
        );
        state.pending.insert(operation.token.clone(), operation);
        Ok(Tracked::Pending)
    }

    /// Remove and return the operation matching the token
    ///
    /// # Errors
    ///
    /// Returns `UnknownToken` if nothing is pending under the token. This is
    /// expected for late, duplicated or replayed responses.
    pub fn resolve(&self, token: &str) -> Result<PendingOperation> {
        self.lock()
            .pending
            .remove(token)
            .ok_or_else(|| Error::UnknownToken(token.to_string()))
    }

    /// Hand an async response to its pending operation, or hold it until
    /// the operation is tracked
    pub fn deliver(&self, token: &str, outcome: OperationOutcome) -> Delivery {
        let mut state = self.lock();
        if let Some(operation) = state.pending.remove(token) {
            return Delivery::Matched(operation, outcome);
        }

        if state.unmatched.len() >= UNMATCHED_CAPACITY && !state.unmatched.contains_key(token) {
            let oldest = state
                .unmatched
                .iter()
                .min_by_key(|(_, u)| u.expires_at)
                .map(|(t, _)| t.clone());
            if let Some(oldest) = oldest {
                state.unmatched.remove(&oldest);
            }
        }
        state.unmatched.insert(
            token.to_string(),
            Unmatched {
                outcome,
                expires_at: Instant::now() + UNMATCHED_TTL,
            },
        );
        Delivery::Held
    }

    /// Whether other subscription changes on the resource are in flight
    ///
    /// With `confirmed` set, their rollback flag becomes the confirmed one.
    pub fn rebase_subscription(&self, endpoint: &str, uri: &str, confirmed: Option<bool>) -> bool {
        let mut state = self.lock();
        let mut inflight = false;
        for op in state
            .pending
            .values_mut()
            .filter(|op| op.touches_subscription(endpoint, uri))
        {
            inflight = true;
            if let Some(flag) = confirmed {
                op.previous_subscription = Some(flag);
            }
        }
        inflight
    }

    /// Remove and return every operation whose deadline has passed
    pub fn sweep_expired(&self) -> Vec<PendingOperation> {
        self.sweep_expired_at(Instant::now())
    }

    /// Remove and return every operation whose deadline is at or before `now`
    ///
    /// Held responses past their lifetime are discarded as well.
    pub fn sweep_expired_at(&self, now: Instant) -> Vec<PendingOperation> {
        let mut state = self.lock();

        let held = state.unmatched.len();
        state.unmatched.retain(|_, u| u.expires_at > now);
        let discarded = held - state.unmatched.len();
        if discarded > 0 {
            tracing::debug!(discarded, "unmatched async responses expired");
        }

        let expired: Vec<String> = state
            .pending
            .iter()
            .filter(|(_, op)| op.deadline <= now)
            .map(|(token, _)| token.clone())
            .collect();

        let mut swept: Vec<PendingOperation> = expired
            .iter()
            .filter_map(|token| state.pending.remove(token))
            .collect();
        swept.sort_by_key(|op| op.deadline);
        swept
    }

    /// Whether a token is currently live
    #[must_use]
    pub fn is_pending(&self, token: &str) -> bool {
        self.lock().pending.contains_key(token)
    }

    /// Number of live operations
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Whether nothing is pending
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().pending.is_empty()
    }

    /// Async responses waiting for their operation
    #[must_use]
    pub fn held_len(&self) -> usize {
        self.lock().unmatched.len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn op(token: &str, deadline: Instant) -> PendingOperation {
        PendingOperation::new(
            token,
            Verb::Read,
            "dev1",
            "/3311/0/5850",
            deadline,
            Continuation::Discard,
        )
    }

    #[tokio::test]
    async fn track_then_resolve() {
        let correlator = AsyncCorrelator::new();
        let deadline = Instant::now() + Duration::from_secs(30);
        correlator.track(op("tokenA", deadline)).unwrap();

        let resolved = correlator.resolve("tokenA").unwrap();
        assert_eq!(resolved.token, "tokenA");
        assert_eq!(resolved.endpoint, "dev1");
        assert!(correlator.is_empty());

        assert!(matches!(
            correlator.resolve("tokenA"),
            Err(Error::UnknownToken(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_token_rejected() {
        let correlator = AsyncCorrelator::new();
        let deadline = Instant::now() + Duration::from_secs(30);
        correlator.track(op("tokenA", deadline)).unwrap();

        let err = correlator.track(op("tokenA", deadline)).unwrap_err();
        assert!(matches!(err, Error::DuplicateToken(t) if t == "tokenA"));
        assert_eq!(correlator.len(), 1);
    }

    #[tokio::test]
    async fn sweep_removes_only_expired() {
        let correlator = AsyncCorrelator::new();
        let now = Instant::now();
        correlator.track(op("old", now + Duration::from_millis(10))).unwrap();
        correlator.track(op("fresh", now + Duration::from_secs(60))).unwrap();

        let swept = correlator.sweep_expired_at(now + Duration::from_secs(1));
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].token, "old");
        assert!(!correlator.is_pending("old"));
        assert!(correlator.is_pending("fresh"));

        assert!(correlator.sweep_expired_at(now + Duration::from_secs(1)).is_empty());
    }

    fn observe(token: &str, previous: Option<bool>) -> PendingOperation {
        PendingOperation::new(
            token,
            Verb::Observe,
            "dev1",
            "/3311/0/5850",
            Instant::now() + Duration::from_secs(30),
            Continuation::Discard,
        )
        .with_previous_subscription(previous)
    }

    fn changed() -> OperationOutcome {
        OperationOutcome::Success {
            status: 200,
            content_type: None,
            value: None,
        }
    }

    #[tokio::test]
    async fn response_before_track_settles_on_track() {
        let correlator = AsyncCorrelator::new();
        assert!(matches!(correlator.deliver("early", changed()), Delivery::Held));
        assert_eq!(correlator.held_len(), 1);

        let deadline = Instant::now() + Duration::from_secs(30);
        match correlator.track(op("early", deadline)).unwrap() {
            Tracked::Settled(operation, outcome) => {
                assert_eq!(operation.token, "early");
                assert!(outcome.is_success());
            }
            Tracked::Pending => panic!("held response was not applied"),
        }
        assert!(correlator.is_empty());
        assert_eq!(correlator.held_len(), 0);
    }

    #[tokio::test]
    async fn deliver_matches_pending_operation() {
        let correlator = AsyncCorrelator::new();
        let deadline = Instant::now() + Duration::from_secs(30);
        assert!(matches!(
            correlator.track(op("tokenA", deadline)).unwrap(),
            Tracked::Pending
        ));

        match correlator.deliver("tokenA", changed()) {
            Delivery::Matched(operation, _) => assert_eq!(operation.token, "tokenA"),
            Delivery::Held => panic!("pending operation was not matched"),
        }
        assert_eq!(correlator.held_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn held_responses_expire() {
        let correlator = AsyncCorrelator::new();
        correlator.deliver("stray", changed());

        tokio::time::advance(UNMATCHED_TTL + Duration::from_millis(1)).await;
        assert!(correlator.sweep_expired().is_empty());
        assert_eq!(correlator.held_len(), 0);

        let deadline = Instant::now() + Duration::from_secs(30);
        assert!(matches!(
            correlator.track(op("stray", deadline)).unwrap(),
            Tracked::Pending
        ));
    }

    #[tokio::test]
    async fn held_responses_are_bounded() {
        let correlator = AsyncCorrelator::new();
        for i in 0..=UNMATCHED_CAPACITY {
            correlator.deliver(&format!("stray-{i}"), changed());
        }
        assert_eq!(correlator.held_len(), UNMATCHED_CAPACITY);
    }

    #[tokio::test]
    async fn overlapping_subscription_inherits_rollback_flag() {
        let correlator = AsyncCorrelator::new();
        correlator.track(observe("first", Some(false))).unwrap();
        // The second change saw the optimistic flag set by the first
        correlator.track(observe("second", Some(true))).unwrap();

        let second = correlator.resolve("second").unwrap();
        assert_eq!(second.previous_subscription, Some(false));
    }

    #[tokio::test]
    async fn rebase_rewrites_inflight_rollback_flag() {
        let correlator = AsyncCorrelator::new();
        correlator.track(observe("first", Some(false))).unwrap();

        assert!(correlator.rebase_subscription("dev1", "/3311/0/5850", Some(true)));
        assert!(!correlator.rebase_subscription("dev1", "/3311/0/5700", Some(true)));
        assert_eq!(
            correlator.resolve("first").unwrap().previous_subscription,
            Some(true)
        );
        assert!(!correlator.rebase_subscription("dev1", "/3311/0/5850", None));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_follows_runtime_clock() {
        let correlator = AsyncCorrelator::new();
        correlator
            .track(op("tokenB", Instant::now() + Duration::from_secs(1)))
            .unwrap();

        assert!(correlator.sweep_expired().is_empty());
        tokio::time::advance(Duration::from_millis(1001)).await;

        let swept = correlator.sweep_expired();
        assert_eq!(swept.len(), 1);
        assert!(matches!(
            correlator.resolve("tokenB"),
            Err(Error::UnknownToken(_))
        ));
    }
}
