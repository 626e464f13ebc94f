//! Elasticsearch-compatible HTTP client.

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;

use super::SearchBackend;

pub struct EsClient {
    client: Client,
    endpoint: String,
}

impl std::fmt::Debug for EsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EsClient")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl EsClient {
    pub fn new(endpoint: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    async fn handle_error(&self, response: reqwest::Response) -> anyhow::Error {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        match status {
            StatusCode::NOT_FOUND => anyhow::anyhow!("Index not found ({}): {}", status, body),
            StatusCode::BAD_REQUEST => {
                anyhow::anyhow!("Search backend rejected the query ({}): {}", status, body)
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                anyhow::anyhow!("Search backend authentication failed ({}): {}", status, body)
            }
            _ => anyhow::anyhow!("Search backend error ({}): {}", status, body),
        }
    }
}

#[async_trait]
impl SearchBackend for EsClient {
    async fn ping(&self) -> anyhow::Result<()> {
        let response = self
            .client
            .get(self.url("/"))
            .send()
            .await
            .with_context(|| format!("Failed to reach search backend at {}", self.endpoint))?;

        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        Ok(())
    }

    async fn mapping(&self, index: &str) -> anyhow::Result<Value> {
        let response = self
            .client
            .get(self.url(&format!("/{}/_mapping", index)))
            .send()
            .await
            .with_context(|| format!("Failed to send mapping request for {}", index))?;

        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }

        response
            .json()
            .await
            .with_context(|| format!("Failed to parse mapping response for {}", index))
    }

    async fn search(&self, index: &str, body: Value) -> anyhow::Result<Value> {
        tracing::debug!("POST /{}/_search {}", index, body);
        let response = self
            .client
            .post(self.url(&format!("/{}/_search", index)))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Failed to send search request for {}", index))?;

        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }

        response
            .json()
            .await
            .with_context(|| format!("Failed to parse search response for {}", index))
    }
}
