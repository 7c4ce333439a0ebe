//! Peer bus adapter over the Iggy HTTP REST API
//!
//! Bridge channels map to Iggy topics inside one stream. Event channels are
//! partitioned by endpoint name (`messages_key`); the command channel has a
//! single partition read by a polling consumer.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, mpsc};

use super::{PeerBus, PeerMessage};
use crate::{Error, Result};

/// Number of partitions per event topic
const TOPIC_PARTITIONS: u32 = 3;

/// 7-day message retention in seconds
const RETENTION_SECS: u64 = 7 * 24 * 60 * 60;

/// Consumer ID used by the command poller
const CONSUMER_ID: u32 = 1;

/// Messages fetched per poll
const POLL_BATCH: u32 = 32;

/// Buffered command payloads per subscription
const SUBSCRIPTION_BUFFER: usize = 256;

/// Connection settings for the Iggy HTTP API
#[derive(Debug, Clone)]
pub struct IggyConfig {
    /// Iggy HTTP base URL (e.g., `http://localhost:3000`)
    pub base_url: String,
    pub username: String,
    pub password: String,
    /// Stream holding all bridge topics
    pub stream: String,
    /// Delay between command polls
    pub poll_interval: Duration,
}

impl Default for IggyConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            username: "iggy".to_string(),
            password: "iggy".to_string(),
            stream: "connector-bridge".to_string(),
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Iggy-backed [`PeerBus`]
#[derive(Clone)]
pub struct IggyBus {
    inner: Arc<Inner>,
}

struct Inner {
    config: IggyConfig,
    client: reqwest::Client,
    /// Cached bearer token shared by publishers and the poller
    token: RwLock<Option<String>>,
    /// Topics already provisioned in this session
    topics: Mutex<HashSet<String>>,
}

impl IggyBus {
    /// Create an adapter; no network traffic happens until [`PeerBus::connect`]
    ///
    /// # Errors
    ///
    /// Returns error if the base URL is invalid or the HTTP client cannot be built
    pub fn new(config: IggyConfig) -> Result<Self> {
        url::Url::parse(&config.base_url)
            .map_err(|e| Error::Config(format!("invalid Iggy URL '{}': {e}", config.base_url)))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            inner: Arc::new(Inner {
                config: IggyConfig {
                    base_url: config.base_url.trim_end_matches('/').to_string(),
                    ..config
                },
                client,
                token: RwLock::new(None),
                topics: Mutex::new(HashSet::new()),
            }),
        })
    }
}

impl Inner {
    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url)
    }

    fn stream_path(&self) -> String {
        format!("/streams/{}", urlencoding::encode(&self.config.stream))
    }

    fn topic_path(&self, topic: &str) -> String {
        format!("{}/topics/{}", self.stream_path(), urlencoding::encode(topic))
    }

    /// Retrieve the cached token, authenticating if the cache is empty
    async fn cached_token(&self) -> Result<String> {
        {
            let r = self.token.read().await;
            if let Some(t) = r.as_ref() {
                return Ok(t.clone());
            }
        }
        let mut w = self.token.write().await;
        // Another task may have authenticated meanwhile
        if let Some(t) = w.as_ref() {
            return Ok(t.clone());
        }
        let t = self.login().await?;
        *w = Some(t.clone());
        Ok(t)
    }

    async fn invalidate(&self) {
        *self.token.write().await = None;
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    async fn login(&self) -> Result<String> {
        let resp = self
            .client
            .post(self.url("/users/login"))
            .json(&LoginRequest {
                username: &self.config.username,
                password: &self.config.password,
            })
            .send()
            .await
            .map_err(unavailable)?;
        let resp: LoginResponse = check(resp).await?.json().await?;
        Ok(resp.tokens.access.token)
    }

    async fn ensure_stream(&self, token: &str) -> Result<()> {
        let resp = self
            .client
            .get(self.url(&self.stream_path()))
            .bearer_auth(token)
            .send()
            .await
            .map_err(unavailable)?;
        if resp.status().is_success() {
            return Ok(());
        }

        let resp = self
            .client
            .post(self.url("/streams"))
            .bearer_auth(token)
            .json(&CreateStreamRequest {
                name: &self.config.stream,
            })
            .send()
            .await
            .map_err(unavailable)?;
        check(resp).await?;
        tracing::info!(stream = %self.config.stream, "created Iggy stream");
        Ok(())
    }

    async fn ensure_topic(&self, token: &str, topic: &str, partitions: u32) -> Result<()> {
        if self
            .topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(topic)
        {
            return Ok(());
        }

        let resp = self
            .client
            .get(self.url(&self.topic_path(topic)))
            .bearer_auth(token)
            .send()
            .await
            .map_err(unavailable)?;
        if !resp.status().is_success() {
            let resp = self
                .client
                .post(self.url(&format!("{}/topics", self.stream_path())))
                .bearer_auth(token)
                .json(&CreateTopicRequest {
                    name: topic,
                    partitions_count: partitions,
                    message_expiry: RETENTION_SECS,
                })
                .send()
                .await
                .map_err(unavailable)?;
            check(resp).await?;
            tracing::info!(topic, partitions, "created Iggy topic");
        }

        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(topic.to_string());
        Ok(())
    }

    async fn send(&self, message: &PeerMessage) -> Result<()> {
        let token = self.cached_token().await?;
        self.ensure_topic(&token, &message.channel, TOPIC_PARTITIONS)
            .await?;

        let engine = base64::engine::general_purpose::STANDARD;
        let body = SendMessagesRequest {
            partitioning: Partitioning {
                kind: "messages_key",
                value: engine.encode(message.key.as_bytes()),
            },
            messages: vec![IggyMessage {
                payload: engine.encode(serde_json::to_vec(&message.payload)?),
            }],
        };

        let resp = self
            .client
            .post(self.url(&format!("{}/messages", self.topic_path(&message.channel))))
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await
            .map_err(unavailable)?;
        check(resp).await?;
        Ok(())
    }

    async fn poll(&self, channel: &str) -> Result<Vec<Vec<u8>>> {
        let token = self.cached_token().await?;
        let resp = self
            .client
            .get(self.url(&format!("{}/messages", self.topic_path(channel))))
            .bearer_auth(&token)
            .query(&[
                ("consumer_id", CONSUMER_ID.to_string()),
                ("partition_id", "1".to_string()),
                ("kind", "next".to_string()),
                ("count", POLL_BATCH.to_string()),
                ("auto_commit", "true".to_string()),
            ])
            .send()
            .await
            .map_err(unavailable)?;
        let polled: PolledMessages = check(resp).await?.json().await?;

        let engine = base64::engine::general_purpose::STANDARD;
        Ok(polled
            .messages
            .into_iter()
            .filter_map(|m| match engine.decode(m.payload.as_bytes()) {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    tracing::warn!(channel, error = %e, "skipping undecodable Iggy message");
                    None
                }
            })
            .collect())
    }
}

#[async_trait]
impl PeerBus for IggyBus {
    async fn connect(&self) -> Result<()> {
        self.inner.invalidate().await;
        let token = self.inner.cached_token().await?;
        if let Err(e) = self.inner.ensure_stream(&token).await {
            self.inner.invalidate().await;
            return Err(e);
        }
        tracing::info!(base_url = %self.inner.config.base_url, "connected to Iggy");
        Ok(())
    }

    async fn publish(&self, message: &PeerMessage) -> Result<()> {
        if let Err(e) = self.inner.send(message).await {
            // Re-authenticate on the next call
            self.inner.invalidate().await;
            return Err(e);
        }
        tracing::debug!(topic = %message.topic, channel = %message.channel, "published to Iggy");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<Vec<u8>>> {
        let token = self.inner.cached_token().await?;
        self.inner.ensure_topic(&token, channel, 1).await?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let inner = Arc::clone(&self.inner);
        let channel = channel.to_string();
        tokio::spawn(async move {
            poll_loop(inner, channel, tx).await;
        });
        Ok(rx)
    }
}

/// Poll a channel until the receiver is dropped
async fn poll_loop(inner: Arc<Inner>, channel: String, tx: mpsc::Sender<Vec<u8>>) {
    let interval = inner.config.poll_interval;
    tracing::debug!(channel = %channel, "command poller started");

    loop {
        match inner.poll(&channel).await {
            Ok(batch) => {
                let drained = batch.len() == POLL_BATCH as usize;
                for payload in batch {
                    if tx.send(payload).await.is_err() {
                        tracing::debug!(channel = %channel, "command poller stopped");
                        return;
                    }
                }
                // Keep draining a backlog without sleeping
                if drained {
                    continue;
                }
            }
            Err(e) => {
                tracing::warn!(channel = %channel, error = %e, "Iggy poll failed");
                inner.invalidate().await;
            }
        }

        if tx.is_closed() {
            return;
        }
        tokio::time::sleep(interval).await;
    }
}

fn unavailable(e: reqwest::Error) -> Error {
    Error::PeerUnavailable(e.to_string())
}

async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(Error::PeerUnavailable(format!("Iggy returned {status}: {body}")))
}

// -- Wire types --

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    tokens: LoginTokens,
}

#[derive(Debug, Deserialize)]
struct LoginTokens {
    access: AccessToken,
}

#[derive(Debug, Deserialize)]
struct AccessToken {
    token: String,
}

#[derive(Debug, Serialize)]
struct CreateStreamRequest<'a> {
    name: &'a str,
}

#[derive(Debug, Serialize)]
struct CreateTopicRequest<'a> {
    name: &'a str,
    partitions_count: u32,
    message_expiry: u64,
}

#[derive(Debug, Serialize)]
struct SendMessagesRequest {
    partitioning: Partitioning,
    messages: Vec<IggyMessage>,
}

#[derive(Debug, Serialize)]
struct Partitioning {
    kind: &'static str,
    /// Base64-encoded partition key
    value: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct IggyMessage {
    /// Base64-encoded JSON payload
    payload: String,
}

#[derive(Debug, Deserialize)]
struct PolledMessages {
    #[serde(default)]
    messages: Vec<IggyMessage>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_url() {
        let config = IggyConfig {
            base_url: "::nope".to_string(),
            ..IggyConfig::default()
        };
        assert!(IggyBus::new(config).is_err());
    }

    #[test]
    fn builds_topic_paths() {
        let bus = IggyBus::new(IggyConfig {
            base_url: "http://iggy:3000/".to_string(),
            ..IggyConfig::default()
        })
        .unwrap();
        assert_eq!(bus.inner.url("/users/login"), "http://iggy:3000/users/login");
        assert_eq!(
            bus.inner.topic_path("connector.notify"),
            "/streams/connector-bridge/topics/connector.notify"
        );
    }

    #[test]
    fn send_request_uses_key_partitioning() {
        let body = SendMessagesRequest {
            partitioning: Partitioning {
                kind: "messages_key",
                value: "ZGV2MQ==".to_string(),
            },
            messages: vec![IggyMessage {
                payload: "e30=".to_string(),
            }],
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["partitioning"]["kind"], "messages_key");
        assert_eq!(json["partitioning"]["value"], "ZGV2MQ==");
        assert_eq!(json["messages"][0]["payload"], "e30=");
    }

    #[test]
    fn parses_polled_messages() {
        let json = r#"{"partition_id":1,"current_offset":4,"messages":[{"offset":4,"payload":"e30="}]}"#;
        let polled: PolledMessages = serde_json::from_str(json).unwrap();
        assert_eq!(polled.messages.len(), 1);
        assert_eq!(polled.messages[0].payload, "e30=");
    }
}
