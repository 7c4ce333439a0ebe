//! HTTP adapter for the device-management server REST API

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{DeviceApi, DeviceReply, DeviceRequest, DiscoveredEndpoint, EndpointFilter, WebhookApi};
use crate::correlator::Verb;
use crate::registry::ResourceDescriptor;
use crate::{Error, Result};

/// Callback registration body
#[derive(Debug, Serialize, Deserialize)]
struct CallbackBody {
    url: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    headers: HashMap<String, String>,
}

/// Body of a `202 Accepted` resource operation
#[derive(Debug, Deserialize)]
struct AsyncAccepted {
    #[serde(rename = "async-response-id")]
    async_response_id: String,
}

/// Resource entry returned by endpoint resource discovery
#[derive(Debug, Deserialize)]
struct ResourceEntry {
    uri: String,
    #[serde(rename = "rt", default)]
    resource_type: Option<String>,
    #[serde(rename = "type", default)]
    content_type: Option<String>,
    #[serde(default)]
    obs: bool,
}

/// Client for the device-management server
#[derive(Clone)]
pub struct HttpConnector {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl HttpConnector {
    /// Create a connector for the server at `base_url`
    ///
    /// # Errors
    ///
    /// Returns error if the base URL is invalid or the HTTP client cannot be built
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self> {
        let parsed = url::Url::parse(base_url)
            .map_err(|e| Error::Config(format!("invalid device server URL '{base_url}': {e}")))?;

        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            base_url: parsed.as_str().trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            client,
        })
    }

    fn callback_url(&self) -> String {
        format!("{}/v2/notification/callback", self.base_url)
    }

    fn resource_url(&self, collection: &str, endpoint: &str, uri: &str) -> String {
        let uri = uri.trim_start_matches('/');
        format!(
            "{}/v2/{collection}/{}/{uri}",
            self.base_url,
            urlencoding::encode(endpoint)
        )
    }

    /// Turn a non-success response into a `DeviceServer` error
    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(Error::DeviceServer {
            status: status.as_u16(),
            message: body,
        })
    }
}

#[async_trait]
impl WebhookApi for HttpConnector {
    async fn set_callback(&self, url: &str, headers: &HashMap<String, String>) -> Result<()> {
        let body = CallbackBody {
            url: url.to_string(),
            headers: headers.clone(),
        };

        let response = self
            .client
            .put(self.callback_url())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        Self::check(response).await?;

        tracing::info!(url, "webhook callback set");
        Ok(())
    }

    async fn get_callback(&self) -> Result<Option<String>> {
        let response = self
            .client
            .get(self.callback_url())
            .bearer_auth(&self.api_key)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let body: CallbackBody = Self::check(response).await?.json().await?;
        Ok(Some(body.url).filter(|u| !u.is_empty()))
    }

    async fn clear_callback(&self) -> Result<()> {
        let response = self
            .client
            .delete(self.callback_url())
            .bearer_auth(&self.api_key)
            .send()
            .await?;

        if response.status() != reqwest::StatusCode::NOT_FOUND {
            Self::check(response).await?;
        }

        tracing::info!("webhook callback cleared");
        Ok(())
    }
}

#[async_trait]
impl DeviceApi for HttpConnector {
    async fn resource_operation(&self, request: &DeviceRequest) -> Result<DeviceReply> {
        let endpoint = &request.endpoint;
        let uri = &request.uri;

        let builder = match request.verb {
            Verb::Read => self.client.get(self.resource_url("endpoints", endpoint, uri)),
            Verb::Write => self.client.put(self.resource_url("endpoints", endpoint, uri)),
            Verb::Execute => self.client.post(self.resource_url("endpoints", endpoint, uri)),
            Verb::Delete => self.client.delete(self.resource_url("endpoints", endpoint, uri)),
            Verb::Observe => self
                .client
                .put(self.resource_url("subscriptions", endpoint, uri)),
            Verb::StopObserve => self
                .client
                .delete(self.resource_url("subscriptions", endpoint, uri)),
        };

        let mut builder = builder.bearer_auth(&self.api_key).query(&request.query);
        if let Some(value) = &request.value {
            builder = builder
                .header(reqwest::header::CONTENT_TYPE, "text/plain")
                .body(value.clone());
        }

        let response = Self::check(builder.send().await?).await?;
        let status = response.status();

        if status == reqwest::StatusCode::ACCEPTED {
            let accepted: AsyncAccepted = response.json().await?;
            tracing::debug!(
                endpoint = %endpoint,
                uri = %uri,
                verb = %request.verb,
                token = %accepted.async_response_id,
                "operation accepted asynchronously"
            );
            return Ok(DeviceReply::Async {
                token: accepted.async_response_id,
            });
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let body = response.text().await?;

        Ok(DeviceReply::Immediate {
            status: status.as_u16(),
            content_type,
            value: Some(body).filter(|b| !b.is_empty()),
        })
    }

    async fn list_endpoints(&self, filter: &EndpointFilter) -> Result<Vec<DiscoveredEndpoint>> {
        let mut builder = self
            .client
            .get(format!("{}/v2/endpoints", self.base_url))
            .bearer_auth(&self.api_key);
        if let Some(endpoint_type) = &filter.endpoint_type {
            builder = builder.query(&[("type", endpoint_type)]);
        }

        let endpoints: Vec<DiscoveredEndpoint> = Self::check(builder.send().await?).await?.json().await?;
        tracing::debug!(count = endpoints.len(), "discovered endpoints");
        Ok(endpoints)
    }

    async fn list_resources(&self, endpoint: &str) -> Result<Vec<ResourceDescriptor>> {
        let url = format!(
            "{}/v2/endpoints/{}",
            self.base_url,
            urlencoding::encode(endpoint)
        );
        let response = self.client.get(url).bearer_auth(&self.api_key).send().await?;
        let entries: Vec<ResourceEntry> = Self::check(response).await?.json().await?;

        Ok(entries
            .into_iter()
            .map(|e| ResourceDescriptor {
                uri: e.uri,
                content_type: e.content_type,
                resource_type: e.resource_type,
                observable: e.obs,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connector() -> HttpConnector {
        HttpConnector::new("https://api.example.com/", "key", Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn rejects_invalid_base_url() {
        assert!(HttpConnector::new("not a url", "key", Duration::from_secs(5)).is_err());
    }

    #[test]
    fn builds_resource_urls() {
        let c = connector();
        assert_eq!(
            c.resource_url("endpoints", "dev1", "/3311/0/5850"),
            "https://api.example.com/v2/endpoints/dev1/3311/0/5850"
        );
        assert_eq!(
            c.resource_url("subscriptions", "dev 2", "3/0/0"),
            "https://api.example.com/v2/subscriptions/dev%202/3/0/0"
        );
    }

    #[test]
    fn parses_resource_entries() {
        let json = r#"[{"uri":"/3311/0/5850","rt":"light","type":"text/plain","obs":true},{"uri":"/3/0/0"}]"#;
        let entries: Vec<ResourceEntry> = serde_json::from_str(json).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].obs);
        assert_eq!(entries[0].content_type.as_deref(), Some("text/plain"));
        assert!(!entries[1].obs);
    }

    #[test]
    fn parses_discovered_endpoints() {
        let json = r#"[{"name":"dev1","type":"light","status":"ACTIVE","q":true}]"#;
        let endpoints: Vec<DiscoveredEndpoint> = serde_json::from_str(json).unwrap();
        assert_eq!(endpoints[0].name, "dev1");
        assert_eq!(endpoints[0].endpoint_type.as_deref(), Some("light"));
        assert!(endpoints[0].queue_mode);
    }
}
