//! Source document generator: fetch every per-entity document from the
//! content-addressed origin and persist it as one envelope file per entity.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::future::join_all;
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::database_ops::codex::envelope::{Envelope, TokenAddress};

use super::gateway_file_url;

/// Origin of the raw per-entity documents.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn fetch_document(&self, filename: &str) -> Result<Value>;
}

/// Single-attempt GET against `<gateway>/ipfs/<hash>/<filename>`.
pub struct GatewaySource {
    http: Client,
    gateway: String,
    hash: String,
}

impl GatewaySource {
    pub fn new(http: Client, gateway: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            http,
            gateway: gateway.into(),
            hash: hash.into(),
        }
    }
}

#[async_trait]
impl DocumentSource for GatewaySource {
    async fn fetch_document(&self, filename: &str) -> Result<Value> {
        let url = gateway_file_url(&self.gateway, &self.hash, filename);
        let resp = self.http.get(&url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!("gateway returned {status} for {url}"));
        }
        resp.json::<Value>()
            .await
            .with_context(|| format!("invalid JSON at {url}"))
    }
}

#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub output_dir: PathBuf,
    pub collection: String,
    pub id_start: u32,
    pub id_end: u32,
    pub pad_width: usize,
    pub batch_size: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GenerateSummary {
    pub processed: usize,
    pub created: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Created,
    Skipped,
    Failed,
}

pub struct SourceGenerator<S> {
    source: S,
    cfg: GeneratorConfig,
}

impl<S: DocumentSource> SourceGenerator<S> {
    pub fn new(source: S, cfg: GeneratorConfig) -> Self {
        Self { source, cfg }
    }

    pub fn addresses(&self) -> impl Iterator<Item = TokenAddress> + '_ {
        (self.cfg.id_start..=self.cfg.id_end)
            .map(|i| TokenAddress::new(i, self.cfg.pad_width, &self.cfg.output_dir))
    }

    /// Generate every missing envelope, `batch_size` fetches at a time.
    pub async fn run(&self) -> Result<GenerateSummary> {
        tokio::fs::create_dir_all(&self.cfg.output_dir)
            .await
            .with_context(|| format!("creating {}", self.cfg.output_dir.display()))?;

        let addresses: Vec<TokenAddress> = self.addresses().collect();
        let mut summary = GenerateSummary::default();
        for batch in addresses.chunks(self.cfg.batch_size.max(1)) {
            let outcomes = join_all(batch.iter().map(|addr| self.generate_one(addr))).await;
            for outcome in outcomes {
                summary.processed += 1;
                match outcome {
                    Outcome::Created => summary.created += 1,
                    Outcome::Skipped => summary.skipped += 1,
                    Outcome::Failed => summary.failed += 1,
                }
            }
            info!(
                target = "generator",
                processed = summary.processed,
                created = summary.created,
                skipped = summary.skipped,
                failed = summary.failed,
                total = addresses.len(),
                "batch complete"
            );
        }
        Ok(summary)
    }

    async fn generate_one(&self, addr: &TokenAddress) -> Outcome {
        if tokio::fs::try_exists(&addr.output_path).await.unwrap_or(false) {
            return Outcome::Skipped;
        }
        let document = match self.source.fetch_document(&addr.source_filename).await {
            Ok(doc) => doc,
            Err(err) => {
                warn!(target = "generator", token = %addr.token, error = %err, "fetch failed");
                return Outcome::Failed;
            }
        };
        let envelope = Envelope::wrap(&self.cfg.collection, document, addr.index);
        let written = match serde_json::to_vec_pretty(&envelope) {
            Ok(bytes) => tokio::fs::write(&addr.output_path, bytes).await.map_err(anyhow::Error::from),
            Err(err) => Err(err.into()),
        };
        match written {
            Ok(()) => {
                debug!(target = "generator", path = %addr.output_path.display(), "envelope written");
                Outcome::Created
            }
            Err(err) => {
                warn!(target = "generator", token = %addr.token, error = %err, "write failed");
                Outcome::Failed
            }
        }
    }
}
