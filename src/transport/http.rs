//! Default HTTP transport for the converse RPC.
//!
//! Blocking calls POST JSON to `{endpoint}/model/{model_id}/converse`;
//! streaming calls POST to `.../converse-stream` and decode a
//! newline-delimited JSON event stream, handling events split across TCP
//! chunk boundaries.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use super::{
    Authenticator, ClientCache, ConverseArgs, EventStream, RawConverseOutput, RpcClient,
    RpcFailure,
};
use crate::assembler::StreamEvent;
use crate::config::AuthConfig;
use crate::error::{RelayError, Result};

/// Buffered decoder for the newline-delimited JSON event stream.
///
/// Accumulates raw bytes, splits on newline boundaries, and yields complete
/// events. A single event split across multiple network chunks is buffered
/// until its closing newline arrives. Non-JSON lines are skipped.
#[derive(Debug, Default)]
pub struct EventStreamDecoder {
    buffer: String,
}

impl EventStreamDecoder {
    /// A new empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a raw chunk; returns any complete events.
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        // Everything up to the last newline is complete; the tail stays
        // buffered until its terminator arrives.
        let Some(boundary) = self.buffer.rfind('\n') else {
            return Vec::new();
        };
        let tail = self.buffer.split_off(boundary + 1);
        let complete = std::mem::replace(&mut self.buffer, tail);

        complete
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .filter_map(|line| match serde_json::from_str::<StreamEvent>(line) {
                Ok(event) => Some(event),
                Err(error) => {
                    debug!(%error, "skipping undecodable stream line");
                    None
                }
            })
            .collect()
    }

    /// Flush trailing data not terminated by a newline.
    pub fn flush(&mut self) -> Option<StreamEvent> {
        let tail = std::mem::take(&mut self.buffer);
        serde_json::from_str(tail.trim()).ok()
    }
}

/// Default converse RPC client for one region.
pub struct HttpRpcClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    region: String,
}

impl std::fmt::Debug for HttpRpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRpcClient")
            .field("base_url", &self.base_url)
            .field("region", &self.region)
            .field("has_api_key", &self.api_key.is_some())
            .finish()
    }
}

impl HttpRpcClient {
    /// Build a client for one region from the transport configuration.
    pub fn new(http: Client, config: &AuthConfig, region: impl Into<String>) -> Self {
        let region = region.into();
        Self {
            base_url: config.endpoint_for(&region).trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            http,
            region,
        }
    }

    fn request(&self, url: &str, body: &Value) -> reqwest::RequestBuilder {
        let mut req = self.http.post(url).json(body);
        if let Some(ref key) = self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }
        req
    }

    /// Map a non-success HTTP response into a structured failure, pulling
    /// the provider error code out of the body when present.
    async fn failure_from_response(response: reqwest::Response) -> RpcFailure {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let (code, message) = match serde_json::from_str::<Value>(&body) {
            Ok(parsed) => {
                let code = parsed
                    .get("__type")
                    .or_else(|| parsed.get("code"))
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                let message = parsed
                    .get("message")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .unwrap_or(body);
                (code, message)
            }
            Err(_) => (None, body),
        };
        RpcFailure {
            code,
            message,
            status: Some(status),
        }
    }
}

#[async_trait]
impl RpcClient for HttpRpcClient {
    async fn converse(
        &self,
        args: &ConverseArgs,
    ) -> std::result::Result<RawConverseOutput, RpcFailure> {
        let url = format!("{}/model/{}/converse", self.base_url, args.model_id);
        let body = serde_json::to_value(args)
            .map_err(|e| RpcFailure::new(format!("failed to encode request: {e}")))?;

        let response = self
            .request(&url, &body)
            .send()
            .await
            .map_err(|e| RpcFailure::new(format!("failed to reach {}: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(Self::failure_from_response(response).await);
        }

        response
            .json::<RawConverseOutput>()
            .await
            .map_err(|e| RpcFailure::new(format!("failed to decode response: {e}")))
    }

    async fn converse_stream(
        &self,
        args: &ConverseArgs,
    ) -> std::result::Result<EventStream, RpcFailure> {
        let url = format!("{}/model/{}/converse-stream", self.base_url, args.model_id);
        let body = serde_json::to_value(args)
            .map_err(|e| RpcFailure::new(format!("failed to encode request: {e}")))?;

        let response = self
            .request(&url, &body)
            .send()
            .await
            .map_err(|e| RpcFailure::new(format!("failed to reach {}: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(Self::failure_from_response(response).await);
        }

        let mut decoder = EventStreamDecoder::new();
        let stream = response
            .bytes_stream()
            .map(move |chunk| match chunk {
                Ok(bytes) => decoder.decode(&bytes).into_iter().map(Ok).collect::<Vec<_>>(),
                Err(error) => vec![Err(RpcFailure::new(format!(
                    "stream transport error: {error}"
                )))],
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(stream))
    }

    fn region(&self) -> &str {
        &self.region
    }
}

/// Default authenticator: builds [`HttpRpcClient`]s per region from an
/// [`AuthConfig`], caching them behind a per-region single-flight guard.
#[derive(Debug)]
pub struct HttpAuthenticator {
    http: Client,
    config: AuthConfig,
    cache: ClientCache,
}

impl HttpAuthenticator {
    /// Build an authenticator from the transport configuration.
    pub fn new(config: AuthConfig) -> Result<Self> {
        config.validate()?;
        let http = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(RelayError::Http)?;
        Ok(Self {
            http,
            config,
            cache: ClientCache::new(),
        })
    }
}

#[async_trait]
impl Authenticator for HttpAuthenticator {
    async fn client_for(&self, region: &str) -> Result<Arc<dyn RpcClient>> {
        self.cache
            .get_or_init(region, || async {
                Ok(Arc::new(HttpRpcClient::new(
                    self.http.clone(),
                    &self.config,
                    region,
                )) as Arc<dyn RpcClient>)
            })
            .await
    }
}
