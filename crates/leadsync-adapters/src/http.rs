//! Shared JSON-over-HTTPS transport for every adapter.

use std::time::Duration;

use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;
use tracing::{debug, info_span, Instrument};

use crate::AdapterError;

const ERROR_BODY_LIMIT: usize = 512;

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

/// Thin wrapper over `reqwest::Client`. No retries: a failed call is final.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: reqwest::Client,
}

impl ApiClient {
    pub fn new(config: &HttpClientConfig) -> Result<Self, AdapterError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().map_err(AdapterError::Client)?;
        Ok(Self { client })
    }

    pub fn inner(&self) -> &reqwest::Client {
        &self.client
    }

    /// Send a request and decode a JSON body, mapping non-2xx statuses to
    /// [`AdapterError::HttpStatus`].
    pub async fn send_json<T: DeserializeOwned>(
        &self,
        context: &'static str,
        request: RequestBuilder,
    ) -> Result<T, AdapterError> {
        let span = info_span!("api_call", context);
        async move {
            let resp = request
                .send()
                .await
                .map_err(|source| AdapterError::Request { context, source })?;
            let status = resp.status();
            let url = redact_query(resp.url());

            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(AdapterError::HttpStatus {
                    status: status.as_u16(),
                    url,
                    body: truncate(&body, ERROR_BODY_LIMIT),
                });
            }

            let bytes = resp
                .bytes()
                .await
                .map_err(|source| AdapterError::Request { context, source })?;
            debug!(%url, bytes = bytes.len(), "response received");
            serde_json::from_slice(&bytes).map_err(|e| AdapterError::decode(context, e.to_string()))
        }
        .instrument(span)
        .await
    }
}

fn redact_query(url: &reqwest::Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.to_string()
}

fn truncate(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}
