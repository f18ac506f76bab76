//! Runtime configuration assembled from the environment.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::{Client, ClientBuilder};

use crate::database_ops::codex::{AssetConfig, SeedConfig};
use crate::database_ops::ipfs::generator::GeneratorConfig;
use crate::database_ops::subgraph::OwnerSyncConfig;
use crate::util::env::{env_opt, env_parse};

pub const DEFAULT_GATEWAY: &str = "https://ipfs.io";
pub const DEFAULT_SUBGRAPH_ENDPOINT: &str =
    "https://gateway.thegraph.com/api/{api_key}/subgraphs/name/codex";

/// Every key read by [`CodexConfig::from_env`], for preflight snapshots.
pub const CONFIG_KEYS: &[&str] = &[
    "DATABASE_URL",
    "DB_MAX_CONNS",
    "CODEX_COLLECTION",
    "CODEX_SEED_DIR",
    "CODEX_SOURCE_GATEWAY",
    "CODEX_SOURCE_HASH",
    "CODEX_ID_START",
    "CODEX_ID_END",
    "CODEX_ID_PAD",
    "CODEX_GENERATE_BATCH",
    "IPFS_GATEWAY",
    "CODEX_ASSET_FOLDER",
    "CODEX_ASSET_FOLDER_ID",
    "CODEX_STORAGE",
    "CODEX_FILES_ROOT",
    "CODEX_FETCH_TIMEOUT_MS",
    "CODEX_FETCH_RETRIES",
    "CODEX_REPAIR_LIMIT",
    "SUBGRAPH_API_KEY",
    "SUBGRAPH_ENDPOINT",
    "OWNER_PAGE_SIZE",
    "MARKETPLACE_BASE_URL",
    "OWNER_SYNC_INTERVAL_SECS",
    "PRICE_SYNC_INTERVAL_SECS",
    "HTTP_TIMEOUT_SECS",
    "HTTP_CONNECT_TIMEOUT_SECS",
];

/// Bounds applied to every outbound HTTP request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpConfig {
    pub timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

fn http_builder(cfg: &HttpConfig) -> ClientBuilder {
    Client::builder()
        .user_agent(concat!("codex-sync/", env!("CARGO_PKG_VERSION")))
        .timeout(cfg.timeout)
        .connect_timeout(cfg.connect_timeout)
}

/// Shared client for the gateway, subgraph and marketplace calls.
pub fn build_http_client(cfg: &HttpConfig) -> Result<Client> {
    http_builder(cfg).build().context("building http client")
}

#[derive(Debug, Clone)]
pub struct OwnerJobConfig {
    /// Owner sync is skipped while unset.
    pub api_key: Option<String>,
    pub endpoint: String,
    pub sync: OwnerSyncConfig,
    pub interval: Duration,
}

#[derive(Debug, Clone)]
pub struct PriceJobConfig {
    /// Price sync is skipped while unset.
    pub base_url: Option<String>,
    pub interval: Duration,
}

#[derive(Debug, Clone)]
pub struct CodexConfig {
    pub db_max_conns: u32,
    pub collection: String,
    pub seed_dir: PathBuf,
    pub source_gateway: String,
    pub source_hash: Option<String>,
    pub id_start: u32,
    pub id_end: u32,
    pub id_pad: usize,
    pub generate_batch: usize,
    pub files_root: PathBuf,
    pub repair_limit: usize,
    pub assets: AssetConfig,
    pub owners: OwnerJobConfig,
    pub prices: PriceJobConfig,
    pub http: HttpConfig,
}

impl CodexConfig {
    pub fn from_env() -> Self {
        let id_start = env_parse("CODEX_ID_START", 1u32);
        let id_end = env_parse("CODEX_ID_END", 10_000u32).max(id_start);
        let page_size = env_parse("OWNER_PAGE_SIZE", 1000usize).max(1);
        Self {
            db_max_conns: env_parse("DB_MAX_CONNS", 5u32),
            collection: env_opt("CODEX_COLLECTION").unwrap_or_else(|| "codex".into()),
            seed_dir: env_opt("CODEX_SEED_DIR")
                .unwrap_or_else(|| "./seed/codex".into())
                .into(),
            source_gateway: env_opt("CODEX_SOURCE_GATEWAY")
                .unwrap_or_else(|| DEFAULT_GATEWAY.into()),
            source_hash: env_opt("CODEX_SOURCE_HASH"),
            id_start,
            id_end,
            id_pad: env_parse("CODEX_ID_PAD", 5usize),
            generate_batch: env_parse("CODEX_GENERATE_BATCH", 50usize).max(1),
            files_root: env_opt("CODEX_FILES_ROOT")
                .unwrap_or_else(|| "./uploads".into())
                .into(),
            repair_limit: env_parse("CODEX_REPAIR_LIMIT", 1000usize),
            assets: AssetConfig {
                ipfs_gateway: env_opt("IPFS_GATEWAY").unwrap_or_else(|| DEFAULT_GATEWAY.into()),
                folder_name: env_opt("CODEX_ASSET_FOLDER")
                    .unwrap_or_else(|| "Codex Images".into()),
                folder_id: env_opt("CODEX_ASSET_FOLDER_ID"),
                storage: env_opt("CODEX_STORAGE").unwrap_or_else(|| "local".into()),
                fetch_timeout: Duration::from_millis(env_parse("CODEX_FETCH_TIMEOUT_MS", 10_000u64)),
                fetch_retries: env_parse("CODEX_FETCH_RETRIES", 3u32),
            },
            owners: OwnerJobConfig {
                api_key: env_opt("SUBGRAPH_API_KEY"),
                endpoint: env_opt("SUBGRAPH_ENDPOINT")
                    .unwrap_or_else(|| DEFAULT_SUBGRAPH_ENDPOINT.into()),
                sync: OwnerSyncConfig {
                    page_size,
                    max_token_id: i64::from(id_end),
                    error_pause: Duration::from_secs(1),
                },
                interval: Duration::from_secs(env_parse("OWNER_SYNC_INTERVAL_SECS", 3600u64).max(1)),
            },
            prices: PriceJobConfig {
                base_url: env_opt("MARKETPLACE_BASE_URL"),
                interval: Duration::from_secs(env_parse("PRICE_SYNC_INTERVAL_SECS", 60u64).max(1)),
            },
            http: HttpConfig {
                timeout: Duration::from_secs(env_parse("HTTP_TIMEOUT_SECS", 30u64).max(1)),
                connect_timeout: Duration::from_secs(
                    env_parse("HTTP_CONNECT_TIMEOUT_SECS", 10u64).max(1),
                ),
            },
        }
    }

    pub fn http_client(&self) -> Result<Client> {
        build_http_client(&self.http)
    }

    /// Number of items a fully seeded collection holds.
    pub fn expected_total(&self) -> usize {
        (self.id_end - self.id_start) as usize + 1
    }

    pub fn seed(&self) -> SeedConfig {
        SeedConfig {
            seed_dir: self.seed_dir.clone(),
            expected_total: self.expected_total(),
        }
    }

    /// Content hash of the source documents; only `generate` needs it.
    pub fn require_source_hash(&self) -> Result<&str> {
        self.source_hash
            .as_deref()
            .ok_or_else(|| anyhow!("missing env var CODEX_SOURCE_HASH"))
    }

    pub fn generator(&self) -> GeneratorConfig {
        GeneratorConfig {
            output_dir: self.seed_dir.clone(),
            collection: self.collection.clone(),
            id_start: self.id_start,
            id_end: self.id_end,
            pad_width: self.id_pad,
            batch_size: self.generate_batch,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CodexConfig {
        CodexConfig {
            db_max_conns: 5,
            collection: "codex".into(),
            seed_dir: "./seed".into(),
            source_gateway: DEFAULT_GATEWAY.into(),
            source_hash: None,
            id_start: 1,
            id_end: 10_000,
            id_pad: 5,
            generate_batch: 50,
            files_root: "./uploads".into(),
            repair_limit: 1000,
            assets: AssetConfig::default(),
            owners: OwnerJobConfig {
                api_key: None,
                endpoint: DEFAULT_SUBGRAPH_ENDPOINT.into(),
                sync: OwnerSyncConfig::default(),
                interval: Duration::from_secs(3600),
            },
            prices: PriceJobConfig {
                base_url: None,
                interval: Duration::from_secs(60),
            },
            http: HttpConfig::default(),
        }
    }

    #[test]
    fn expected_total_spans_the_inclusive_id_range() {
        let mut cfg = sample();
        assert_eq!(cfg.expected_total(), 10_000);
        assert_eq!(cfg.seed().expected_total, 10_000);
        cfg.id_start = 101;
        cfg.id_end = 200;
        assert_eq!(cfg.expected_total(), 100);
    }

    #[test]
    fn generate_requires_a_source_hash() {
        let mut cfg = sample();
        assert!(cfg.require_source_hash().is_err());
        cfg.source_hash = Some("QmHash".into());
        assert_eq!(cfg.require_source_hash().unwrap(), "QmHash");
        assert_eq!(cfg.generator().batch_size, 50);
    }

    #[tokio::test]
    async fn http_client_gives_up_on_a_silent_server() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // accept and hold connections without ever answering
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let http = http_builder(&HttpConfig {
            timeout: Duration::from_millis(200),
            connect_timeout: Duration::from_millis(200),
        })
        .no_proxy()
        .build()
        .unwrap();
        let request = http.get(format!("http://{addr}/items/settings")).send();
        let outcome = tokio::time::timeout(Duration::from_secs(5), request).await;

        let err = outcome.expect("request should not hang").unwrap_err();
        assert!(err.is_timeout());
        server.abort();
    }
}
