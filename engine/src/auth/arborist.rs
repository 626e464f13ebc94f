use super::{Grant, PolicyOracle};
use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::collections::HashMap;
use std::time::Duration;

/// Policy service client resolving a bearer token to per-resource grants.
pub struct ArboristClient {
    client: Client,
    endpoint: String,
}

impl std::fmt::Debug for ArboristClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArboristClient")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl ArboristClient {
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
}

#[async_trait]
impl PolicyOracle for ArboristClient {
    async fn auth_mapping(&self, token: &str) -> anyhow::Result<HashMap<String, Vec<Grant>>> {
        let url = format!("{}/auth/mapping", self.endpoint);
        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .with_context(|| format!("Failed to reach policy service at {}", self.endpoint))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    anyhow::anyhow!("Policy service rejected the token ({}): {}", status, body)
                }
                _ => anyhow::anyhow!("Policy service error ({}): {}", status, body),
            });
        }

        response
            .json()
            .await
            .context("Failed to parse auth mapping response")
    }
}
