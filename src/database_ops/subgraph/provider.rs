use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;

const TOKENS_QUERY: &str = r#"query Tokens($lastTokenId: BigInt!, $first: Int!) {
  tokens(
    where: { revealed: true, tokenId_gt: $lastTokenId }
    orderBy: tokenId
    orderDirection: asc
    first: $first
  ) {
    id
    tokenId
    owner
  }
}"#;

/// One revealed token as reported by the index.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IndexedToken {
    pub id: String,
    #[serde(rename = "tokenId")]
    pub token_id: String,
    pub owner: String,
}

/// Blockchain index paged by ascending numeric token id.
#[async_trait]
pub trait TokenIndex: Send + Sync {
    /// Up to `first` revealed tokens with id strictly greater than `last_token_id`.
    async fn tokens_after(&self, last_token_id: i64, first: usize) -> Result<Vec<IndexedToken>>;
}

#[derive(Debug, Deserialize)]
struct GraphResponse {
    data: Option<TokensData>,
    #[serde(default)]
    errors: Vec<GraphError>,
}

#[derive(Debug, Deserialize)]
struct TokensData {
    tokens: Vec<IndexedToken>,
}

#[derive(Debug, Deserialize)]
struct GraphError {
    message: String,
}

/// GraphQL client for the hosted token subgraph.
pub struct SubgraphClient {
    http: Client,
    endpoint: String,
    max_retries: u32,
    backoff_ms: u64,
}

impl SubgraphClient {
    /// `endpoint_template` may contain `{api_key}`, which is substituted here.
    pub fn new(http: Client, endpoint_template: &str, api_key: &str) -> Self {
        Self {
            http,
            endpoint: endpoint_template.replace("{api_key}", api_key),
            max_retries: 2,
            backoff_ms: 500,
        }
    }

    pub fn with_retries(mut self, max_retries: u32, backoff_ms: u64) -> Self {
        self.max_retries = max_retries;
        self.backoff_ms = backoff_ms;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl TokenIndex for SubgraphClient {
    async fn tokens_after(&self, last_token_id: i64, first: usize) -> Result<Vec<IndexedToken>> {
        let body = json!({
            "query": TOKENS_QUERY,
            "variables": { "lastTokenId": last_token_id.to_string(), "first": first },
        });
        let mut attempt = 0u32;
        loop {
            let resp = self.http.post(&self.endpoint).json(&body).send().await;
            let retryable = match resp {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let parsed: GraphResponse =
                            resp.json().await.context("invalid subgraph response")?;
                        if let Some(err) = parsed.errors.first() {
                            return Err(anyhow!("subgraph query failed: {}", err.message));
                        }
                        return parsed
                            .data
                            .map(|d| d.tokens)
                            .ok_or_else(|| anyhow!("subgraph response without data"));
                    }
                    if !(status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()) {
                        let text = resp.text().await.unwrap_or_default();
                        return Err(anyhow!("subgraph request failed (status={status}): {text}"));
                    }
                    anyhow!("subgraph request failed (status={status})")
                }
                Err(err) => anyhow::Error::from(err),
            };
            if attempt >= self.max_retries {
                return Err(retryable.context("subgraph request failed after retries"));
            }
            let wait = self.backoff_ms * (attempt as u64 + 1);
            tokio::time::sleep(Duration::from_millis(wait)).await;
            attempt += 1;
        }
    }
}
