//! Thin client for the local node's HTTP RPC API (`/api/v0/*`).
//!
//! Every RPC is a `POST`. Topic arguments are multibase-encoded with
//! [`crate::codec::encode_topic`] before they go on the wire.

use crate::codec::encode_topic;
use crate::error::{BridgeError, Result};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response};
use serde::Deserialize;
use std::time::Duration;

pub const DEFAULT_API_HOST: &str = "127.0.0.1";
pub const DEFAULT_API_PORT: u16 = 5001;

/// Upper bound for short request/response calls. Streaming subscriptions
/// are not bounded.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Response of `/api/v0/id`.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeIdentity {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "AgentVersion", default)]
    pub agent_version: Option<String>,
    #[serde(rename = "Addresses", default)]
    pub addresses: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct StringList {
    #[serde(rename = "Strings", default)]
    strings: Option<Vec<String>>,
}

#[derive(Clone)]
pub struct NodeApi {
    client: Client,
    base_url: String,
}

impl NodeApi {
    pub fn new(host: &str, port: u16) -> Result<Self> {
        Self::with_base_url(format!("http://{}:{}", host, port))
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| BridgeError::InternalError(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v0/{}", self.base_url, path)
    }

    /// Liveness and identity probe.
    pub async fn id(&self) -> Result<NodeIdentity> {
        let resp = self
            .client
            .post(self.url("id"))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        let resp = ensure_success("id", resp).await?;
        Ok(resp.json().await?)
    }

    /// Whether anything answers on the identity endpoint.
    pub async fn is_reachable(&self) -> bool {
        self.id().await.is_ok()
    }

    /// Topics the node is currently subscribed to, as emitted by the node
    /// (multibase on newer versions).
    pub async fn pubsub_ls(&self) -> Result<Vec<String>> {
        let resp = self
            .client
            .post(self.url("pubsub/ls"))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        let resp = ensure_success("pubsub/ls", resp).await?;
        let list: StringList = resp.json().await?;
        Ok(list.strings.unwrap_or_default())
    }

    /// A node started without pubsub answers `pubsub/ls` with an error status.
    pub async fn pubsub_enabled(&self) -> bool {
        match self
            .client
            .post(self.url("pubsub/ls"))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    /// Open a long-lived subscription stream. The caller reads the body as
    /// newline-delimited JSON.
    pub async fn pubsub_sub(&self, topic: &str) -> Result<Response> {
        let resp = self
            .client
            .post(self.url("pubsub/sub"))
            .query(&[("arg", encode_topic(topic))])
            .send()
            .await?;
        ensure_success("pubsub/sub", resp).await
    }

    pub async fn pubsub_pub(&self, topic: &str, data: &[u8]) -> Result<()> {
        let form = Form::new().part("data", Part::bytes(data.to_vec()).file_name("data"));
        let resp = self
            .client
            .post(self.url("pubsub/pub"))
            .query(&[("arg", encode_topic(topic))])
            .multipart(form)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        ensure_success("pubsub/pub", resp).await?;
        Ok(())
    }

    pub async fn pubsub_peers(&self, topic: &str) -> Result<Vec<String>> {
        let resp = self
            .client
            .post(self.url("pubsub/peers"))
            .query(&[("arg", encode_topic(topic))])
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        let resp = ensure_success("pubsub/peers", resp).await?;
        let list: StringList = resp.json().await?;
        Ok(list.strings.unwrap_or_default())
    }

    /// Ask the node to shut down gracefully.
    pub async fn shutdown(&self) -> Result<()> {
        let resp = self
            .client
            .post(self.url("shutdown"))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        ensure_success("shutdown", resp).await?;
        Ok(())
    }
}

async fn ensure_success(call: &str, resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(BridgeError::NodeApiError(format!(
        "{} returned {}: {}",
        call,
        status,
        body.trim()
    )))
}
