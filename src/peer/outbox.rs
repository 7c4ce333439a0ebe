//! Bounded outbound queue in front of the peer bus
//!
//! Producers call [`Outbox::enqueue`], which never blocks: when the queue is
//! full the oldest message is dropped and counted. A single background task
//! ([`Outbox::run`]) drains the queue in order, backing off after every
//! failed publish and reconnecting while the bus is down. A message the bus
//! keeps rejecting is dropped after a few attempts so it cannot hold back
//! the ones queued behind it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::{Notify, watch};

use super::{PeerBus, PeerMessage};
use crate::Result;
use crate::retry::{self, RetryPolicy};

/// Reconnect attempts between repeated "still disconnected" warnings
const WARN_EVERY: u32 = 10;

/// Highest backoff exponent used while reconnecting
const MAX_BACKOFF_EXPONENT: u32 = 10;

/// Publish attempts before a rejected message is dropped
const MAX_PUBLISH_ATTEMPTS: u32 = 5;

/// Queue counters for health reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OutboxStats {
    pub connected: bool,
    pub queued: usize,
    pub published: u64,
    pub dropped: u64,
}

struct Queued {
    message: PeerMessage,
    failures: u32,
}

/// Bounded, ordered queue of messages awaiting publication
pub struct Outbox {
    bus: Arc<dyn PeerBus>,
    queue: Mutex<VecDeque<Queued>>,
    capacity: usize,
    policy: RetryPolicy,
    connected: AtomicBool,
    published: AtomicU64,
    dropped: AtomicU64,
    wake: Notify,
}

impl Outbox {
    /// Create an outbox holding at most `capacity` messages
    #[must_use]
    pub fn new(bus: Arc<dyn PeerBus>, capacity: usize, policy: RetryPolicy) -> Self {
        Self {
            bus,
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            policy,
            connected: AtomicBool::new(false),
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            wake: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Queued>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a message for publication without blocking
    pub fn enqueue(&self, message: PeerMessage) {
        let evicted = {
            let mut queue = self.lock();
            let evicted = if queue.len() >= self.capacity {
                queue.pop_front()
            } else {
                None
            };
            queue.push_back(Queued {
                message,
                failures: 0,
            });
            evicted
        };

        if let Some(evicted) = evicted {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::warn!(
                topic = %evicted.message.topic,
                dropped,
                capacity = self.capacity,
                "peer outbox full, dropped oldest message"
            );
        }
        self.wake.notify_one();
    }

    /// Publish queued messages in order until the queue is empty
    ///
    /// On failure the message is put back at the front, or dropped once it
    /// has failed [`MAX_PUBLISH_ATTEMPTS`] times, and the outbox is marked
    /// disconnected.
    ///
    /// # Errors
    ///
    /// Returns the bus error that interrupted the drain
    pub async fn flush(&self) -> Result<usize> {
        let mut sent = 0;
        loop {
            let Some(mut queued) = self.lock().pop_front() else {
                return Ok(sent);
            };

            match self.bus.publish(&queued.message).await {
                Ok(()) => {
                    sent += 1;
                    self.published.fetch_add(1, Ordering::Relaxed);
                    self.connected.store(true, Ordering::Relaxed);
                }
                Err(e) => {
                    queued.failures += 1;
                    if queued.failures >= MAX_PUBLISH_ATTEMPTS {
                        let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                        tracing::warn!(
                            topic = %queued.message.topic,
                            attempts = queued.failures,
                            dropped,
                            error = %e,
                            "peer bus keeps rejecting message, dropped"
                        );
                    } else {
                        self.requeue_front(queued);
                    }
                    self.connected.store(false, Ordering::Relaxed);
                    return Err(e);
                }
            }
        }
    }

    fn requeue_front(&self, queued: Queued) {
        let mut queue = self.lock();
        // Newer messages win if producers filled the queue meanwhile
        if queue.len() >= self.capacity {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        queue.push_front(queued);
    }

    /// Whether the last bus interaction succeeded
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Messages waiting for publication
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing is waiting
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Messages discarded because the queue was full or the bus kept
    /// rejecting them
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Current counters
    #[must_use]
    pub fn stats(&self) -> OutboxStats {
        OutboxStats {
            connected: self.is_connected(),
            queued: self.len(),
            published: self.published.load(Ordering::Relaxed),
            dropped: self.dropped_count(),
        }
    }

    /// Drain the queue until shutdown, reconnecting whenever the bus fails
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(capacity = self.capacity, "peer outbox started");

        let mut failures: u32 = 0;
        loop {
            if !self.is_connected() && !self.reconnect(&mut shutdown).await {
                break;
            }

            if let Err(e) = self.flush().await {
                failures += 1;
                tracing::warn!(error = %e, attempt = failures, queued = self.len(), "peer publish failed");

                // Back off even when the next reconnect succeeds at once
                let delay = retry::delay_for_attempt(&self.policy, (failures - 1).min(MAX_BACKOFF_EXPONENT));
                tokio::select! {
                    _ = shutdown.changed() => break,
                    () = tokio::time::sleep(delay) => {}
                }
                continue;
            }
            failures = 0;

            tokio::select! {
                _ = shutdown.changed() => break,
                () = self.wake.notified() => {}
            }
        }

        // Last chance for queued messages while the bus is still reachable
        if self.is_connected() {
            if let Err(e) = self.flush().await {
                tracing::warn!(error = %e, lost = self.len(), "final peer flush failed");
            }
        }
        tracing::info!(stats = ?self.stats(), "peer outbox stopped");
    }

    /// Reconnect with backoff; returns `false` if shutdown came first
    async fn reconnect(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let mut attempt: u32 = 0;
        loop {
            match self.bus.connect().await {
                Ok(()) => {
                    self.connected.store(true, Ordering::Relaxed);
                    if attempt > 0 {
                        tracing::info!(attempts = attempt + 1, queued = self.len(), "peer bus reconnected");
                    }
                    return true;
                }
                Err(e) => {
                    attempt += 1;
                    if attempt == 1 || attempt % WARN_EVERY == 0 {
                        tracing::warn!(
                            attempt,
                            error = %e,
                            queued = self.len(),
                            dropped = self.dropped_count(),
                            "peer bus unreachable"
                        );
                    }
                }
            }

            let delay = retry::delay_for_attempt(&self.policy, (attempt - 1).min(MAX_BACKOFF_EXPONENT));
            tokio::select! {
                _ = shutdown.changed() => return false,
                () = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use super::*;
    use crate::Error;

    /// Bus double that records publications and can be switched off
    #[derive(Default)]
    struct SwitchBus {
        down: AtomicBool,
        published: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PeerBus for SwitchBus {
        async fn connect(&self) -> Result<()> {
            if self.down.load(Ordering::SeqCst) {
                return Err(Error::PeerUnavailable("down".into()));
            }
            Ok(())
        }

        async fn publish(&self, message: &PeerMessage) -> Result<()> {
            if self.down.load(Ordering::SeqCst) {
                return Err(Error::PeerUnavailable("down".into()));
            }
            self.published.lock().unwrap().push(message.topic.clone());
            Ok(())
        }

        async fn subscribe(&self, _channel: &str) -> Result<mpsc::Receiver<Vec<u8>>> {
            Err(Error::PeerUnavailable("no subscriptions".into()))
        }
    }

    fn message(topic: &str) -> PeerMessage {
        PeerMessage {
            topic: topic.to_string(),
            channel: "connector.notify".to_string(),
            key: "dev1".to_string(),
            payload: serde_json::json!({}),
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: u32::MAX,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        }
    }

    #[test]
    fn overflow_drops_oldest() {
        let bus = Arc::new(SwitchBus::default());
        let outbox = Outbox::new(bus, 2, fast_policy());

        outbox.enqueue(message("a"));
        outbox.enqueue(message("b"));
        outbox.enqueue(message("c"));

        assert_eq!(outbox.len(), 2);
        assert_eq!(outbox.dropped_count(), 1);
        let queued: Vec<String> = outbox
            .lock()
            .iter()
            .map(|q| q.message.topic.clone())
            .collect();
        assert_eq!(queued, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn flush_preserves_order_and_requeues_on_failure() {
        let bus = Arc::new(SwitchBus::default());
        let outbox = Outbox::new(bus.clone(), 8, fast_policy());

        outbox.enqueue(message("a"));
        outbox.enqueue(message("b"));
        assert_eq!(outbox.flush().await.unwrap(), 2);
        assert!(outbox.is_connected());

        bus.down.store(true, Ordering::SeqCst);
        outbox.enqueue(message("c"));
        assert!(outbox.flush().await.is_err());
        assert!(!outbox.is_connected());
        assert_eq!(outbox.len(), 1);

        bus.down.store(false, Ordering::SeqCst);
        outbox.enqueue(message("d"));
        assert_eq!(outbox.flush().await.unwrap(), 2);
        assert_eq!(*bus.published.lock().unwrap(), vec!["a", "b", "c", "d"]);
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_reconnects_and_drains() {
        let bus = Arc::new(SwitchBus::default());
        bus.down.store(true, Ordering::SeqCst);
        let outbox = Arc::new(Outbox::new(bus.clone(), 8, fast_policy()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        outbox.enqueue(message("queued-while-down"));
        let task = tokio::spawn(Arc::clone(&outbox).run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(outbox.len(), 1);

        bus.down.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(outbox.is_empty());
        assert!(outbox.is_connected());

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
        assert_eq!(*bus.published.lock().unwrap(), vec!["queued-while-down"]);
    }

    /// Bus that accepts connections but rejects one topic
    #[derive(Default)]
    struct RejectingBus {
        attempts: AtomicU64,
        published: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PeerBus for RejectingBus {
        async fn connect(&self) -> Result<()> {
            Ok(())
        }

        async fn publish(&self, message: &PeerMessage) -> Result<()> {
            if message.topic == "oversized" {
                self.attempts.fetch_add(1, Ordering::SeqCst);
                return Err(Error::PeerUnavailable("message too large".into()));
            }
            self.published.lock().unwrap().push(message.topic.clone());
            Ok(())
        }

        async fn subscribe(&self, _channel: &str) -> Result<mpsc::Receiver<Vec<u8>>> {
            Err(Error::PeerUnavailable("no subscriptions".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_drops_message_the_bus_keeps_rejecting() {
        let bus = Arc::new(RejectingBus::default());
        let outbox = Arc::new(Outbox::new(bus.clone(), 8, fast_policy()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        outbox.enqueue(message("oversized"));
        outbox.enqueue(message("behind"));
        let task = tokio::spawn(Arc::clone(&outbox).run(shutdown_rx));

        // First retry waits for the base delay
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(bus.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(outbox.len(), 2);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(bus.attempts.load(Ordering::SeqCst), u64::from(MAX_PUBLISH_ATTEMPTS));
        assert_eq!(outbox.dropped_count(), 1);
        assert!(outbox.is_empty());
        assert_eq!(*bus.published.lock().unwrap(), vec!["behind"]);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
