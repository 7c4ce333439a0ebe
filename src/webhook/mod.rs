//! Webhook lifecycle with the device-management server
//!
//! State machine:
//!
//! ```text
//! Unset ──activate──▶ Registering ──ok──▶ Active
//!   ▲                     │                 │
//!   └──attempts exhausted─┘     mismatch ──▶ Invalid ──▶ Registering
//! ```
//!
//! Activation gates outbound registration only. Inbound notifications are
//! processed whatever the state is.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use crate::connector::WebhookApi;
use crate::retry::{self, RetryPolicy};
use crate::{Error, Result};

/// Header carrying the shared callback secret
pub const SECRET_HEADER: &str = "x-bridge-secret";

/// Registration state of the webhook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookState {
    Unset,
    Registering,
    Active,
    Invalid,
}

/// Snapshot of the process-wide webhook registration
#[derive(Debug, Clone, Serialize)]
pub struct WebhookRegistration {
    pub callback_url: Option<String>,
    pub state: WebhookState,
    pub last_validated: Option<chrono::DateTime<chrono::Utc>>,
    pub retry_count: u32,
}

impl Default for WebhookRegistration {
    fn default() -> Self {
        Self {
            callback_url: None,
            state: WebhookState::Unset,
            last_validated: None,
            retry_count: 0,
        }
    }
}

/// Result of one validation pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationOutcome {
    /// Server still points at our callback
    Valid,
    /// Callback was missing or changed and has been registered again
    Reactivated,
    /// Server could not be reached; state left unchanged
    Unreachable,
    /// Nothing to validate in the current state
    Skipped,
}

/// Owns the webhook registration state
pub struct WebhookManager {
    api: Arc<dyn WebhookApi>,
    policy: RetryPolicy,
    headers: HashMap<String, String>,
    registration: Mutex<WebhookRegistration>,
    /// Serializes activation and validation so they never interleave
    transition: tokio::sync::Mutex<()>,
}

impl WebhookManager {
    /// Create a manager in the `Unset` state
    #[must_use]
    pub fn new(api: Arc<dyn WebhookApi>, policy: RetryPolicy) -> Self {
        Self {
            api,
            policy,
            headers: HashMap::new(),
            registration: Mutex::new(WebhookRegistration::default()),
            transition: tokio::sync::Mutex::new(()),
        }
    }

    /// Send `secret` in [`SECRET_HEADER`] on every callback
    #[must_use]
    pub fn with_secret(mut self, secret: Option<String>) -> Self {
        if let Some(secret) = secret {
            self.headers.insert(SECRET_HEADER.to_string(), secret);
        }
        self
    }

    fn lock(&self) -> MutexGuard<'_, WebhookRegistration> {
        self.registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> WebhookState {
        self.lock().state
    }

    /// Whether the webhook is registered and validated
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state() == WebhookState::Active
    }

    /// Snapshot of the registration
    #[must_use]
    pub fn snapshot(&self) -> WebhookRegistration {
        self.lock().clone()
    }

    /// Register the callback URL, retrying with backoff
    ///
    /// # Errors
    ///
    /// Returns `RegistrationFailure` once the attempt budget is spent or the
    /// server rejects the request outright; the state is then `Unset`
    pub async fn activate(&self, callback_url: &str) -> Result<()> {
        let _transition = self.transition.lock().await;
        self.register(callback_url).await
    }

    async fn register(&self, callback_url: &str) -> Result<()> {
        {
            let mut reg = self.lock();
            reg.callback_url = Some(callback_url.to_string());
            reg.state = WebhookState::Registering;
            reg.retry_count = 0;
        }
        tracing::info!(url = callback_url, "registering webhook");

        let mut attempts = 0;
        loop {
            let err = match self.api.set_callback(callback_url, &self.headers).await {
                Ok(()) => {
                    let mut reg = self.lock();
                    reg.state = WebhookState::Active;
                    reg.last_validated = Some(chrono::Utc::now());
                    tracing::info!(url = callback_url, attempts = attempts + 1, "webhook active");
                    return Ok(());
                }
                Err(e) => e,
            };

            attempts += 1;
            self.lock().retry_count = attempts;

            let recoverable = match &err {
                Error::DeviceServer { status, .. } => retry::is_recoverable(*status),
                _ => true,
            };
            if !recoverable || !self.policy.allows(attempts) {
                self.lock().state = WebhookState::Unset;
                tracing::error!(
                    url = callback_url,
                    attempts,
                    error = %err,
                    "webhook registration failed"
                );
                return Err(Error::RegistrationFailure {
                    attempts,
                    reason: err.to_string(),
                });
            }

            let delay = retry::delay_for_attempt(&self.policy, attempts - 1);
            tracing::warn!(
                attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "webhook registration failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Check that the server still points at our callback
    ///
    /// Mismatch or absence re-registers. After an earlier activation gave up
    /// (`Unset` with a remembered URL) this retries the registration.
    ///
    /// # Errors
    ///
    /// Returns `RegistrationFailure` if re-registration is exhausted
    pub async fn validate(&self) -> Result<ValidationOutcome> {
        let _transition = self.transition.lock().await;
        let (state, expected) = {
            let reg = self.lock();
            (reg.state, reg.callback_url.clone())
        };
        let Some(expected) = expected else {
            return Ok(ValidationOutcome::Skipped);
        };

        match state {
            WebhookState::Active => match self.api.get_callback().await {
                Ok(Some(found)) if same_url(&found, &expected) => {
                    self.lock().last_validated = Some(chrono::Utc::now());
                    tracing::debug!(url = %expected, "webhook validated");
                    Ok(ValidationOutcome::Valid)
                }
                Ok(found) => {
                    tracing::warn!(
                        expected = %expected,
                        found = ?found,
                        "webhook callback changed on server, re-registering"
                    );
                    self.lock().state = WebhookState::Invalid;
                    self.register(&expected).await?;
                    Ok(ValidationOutcome::Reactivated)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "webhook validation request failed");
                    Ok(ValidationOutcome::Unreachable)
                }
            },
            WebhookState::Unset => {
                tracing::info!(url = %expected, "retrying webhook registration");
                self.register(&expected).await?;
                Ok(ValidationOutcome::Reactivated)
            }
            WebhookState::Registering | WebhookState::Invalid => Ok(ValidationOutcome::Skipped),
        }
    }

    /// Clear the server-side callback (best effort, no retries)
    pub async fn deactivate(&self) {
        let _transition = self.transition.lock().await;
        if let Err(e) = self.api.clear_callback().await {
            tracing::warn!(error = %e, "failed to clear webhook callback");
        }
        let mut reg = self.lock();
        reg.state = WebhookState::Unset;
        reg.callback_url = None;
    }
}

fn same_url(a: &str, b: &str) -> bool {
    a.trim_end_matches('/') == b.trim_end_matches('/')
}
