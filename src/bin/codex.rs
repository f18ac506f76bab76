use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use codex_sync::config::{CodexConfig, CONFIG_KEYS};
use codex_sync::database_ops::codex::{
    collection_counts, repair_character_assets, AssetMigrator, LogProgress, SeedLoader,
    SeedOutcome,
};
use codex_sync::database_ops::db::Db;
use codex_sync::database_ops::ipfs::{GatewaySource, RetryingFetcher, SourceGenerator};
use codex_sync::database_ops::marketplace::{MarketplaceFeed, PriceSync};
use codex_sync::database_ops::pg_store::{PgFileStore, PgFolderStore, PgItemStore};
use codex_sync::database_ops::subgraph::{OwnerSync, SubgraphClient};
use codex_sync::logging::{init_tracing, DEFAULT_FILTER};
use codex_sync::util::env;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "codex", version, about = "Codex metadata seed and sync CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Fetch source documents and write one envelope file per token
    Generate {
        /// First token id (defaults to CODEX_ID_START)
        #[arg(long)]
        start: Option<u32>,
        /// Last token id, inclusive (defaults to CODEX_ID_END)
        #[arg(long)]
        end: Option<u32>,
        /// Concurrent fetches per batch (defaults to CODEX_GENERATE_BATCH)
        #[arg(long)]
        batch: Option<usize>,
        /// Output directory (defaults to CODEX_SEED_DIR)
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Load envelope files into the codex collection
    Seed {
        /// Seed directory (defaults to CODEX_SEED_DIR)
        #[arg(long)]
        dir: Option<PathBuf>,
        /// Run the character asset repair pass afterwards
        #[arg(long, default_value_t = false)]
        repair: bool,
    },
    /// Retry character images for items that are missing them
    Repair {
        /// Maximum items to repair (defaults to CODEX_REPAIR_LIMIT)
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Run the owner reconciliation job once
    SyncOwners,
    /// Run the price reconciliation job once
    SyncPrices,
    /// Print collection population counts
    Counts {
        /// Emit JSON instead of text
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Log the effective configuration (secrets redacted)
    ValidateEnv,
}

#[tokio::main]
async fn main() -> Result<()> {
    env::init_env();
    init_tracing(DEFAULT_FILTER)?;
    let cli = Cli::parse();
    let mut cfg = CodexConfig::from_env();

    match cli.command {
        Commands::Generate {
            start,
            end,
            batch,
            dir,
        } => {
            let hash = cfg.require_source_hash()?.to_string();
            let mut gen_cfg = cfg.generator();
            if let Some(s) = start {
                gen_cfg.id_start = s;
            }
            if let Some(e) = end {
                gen_cfg.id_end = e;
            }
            if let Some(b) = batch {
                gen_cfg.batch_size = b.max(1);
            }
            if let Some(d) = dir {
                gen_cfg.output_dir = d;
            }
            if gen_cfg.id_end < gen_cfg.id_start {
                bail!("--end must not be below --start");
            }
            let http = cfg.http_client()?;
            let source = GatewaySource::new(http, &cfg.source_gateway, hash);
            let summary = SourceGenerator::new(source, gen_cfg).run().await?;
            println!(
                "generate: processed={} created={} skipped={} failed={}",
                summary.processed, summary.created, summary.skipped, summary.failed
            );
        }
        Commands::Seed { dir, repair } => {
            if let Some(d) = dir {
                cfg.seed_dir = d;
            }
            let db = connect(&cfg).await?;
            let items = PgItemStore::new(db.clone(), cfg.collection.clone());
            let files = PgFileStore::new(db.clone(), cfg.files_root.clone());
            let folders = PgFolderStore::new(db);
            let fetcher = RetryingFetcher::with_client(cfg.http_client()?);
            let assets = AssetMigrator::new(&files, &folders, &fetcher, cfg.assets.clone());
            let progress = LogProgress::default();

            let summary = SeedLoader::new(&items, &assets, &progress, cfg.seed())
                .run()
                .await?;
            println!(
                "seed: files={}/{} inserted={} skipped={} errors={} soft_errors={} asset_failures={} outcome={:?}",
                summary.files_processed,
                summary.files,
                summary.inserted,
                summary.skipped,
                summary.errors,
                summary.soft_errors,
                summary.asset_failures,
                summary.outcome
            );
            if repair && summary.outcome == SeedOutcome::Completed {
                let r = repair_character_assets(&items, &assets, cfg.repair_limit).await?;
                println!(
                    "repair: candidates={} repaired={} failed={}",
                    r.candidates, r.repaired, r.failed
                );
            }
            if let SeedOutcome::Aborted { file, reason } = summary.outcome {
                bail!("seed aborted at {file}: {reason}");
            }
        }
        Commands::Repair { limit } => {
            let db = connect(&cfg).await?;
            let items = PgItemStore::new(db.clone(), cfg.collection.clone());
            let files = PgFileStore::new(db.clone(), cfg.files_root.clone());
            let folders = PgFolderStore::new(db);
            let fetcher = RetryingFetcher::with_client(cfg.http_client()?);
            let assets = AssetMigrator::new(&files, &folders, &fetcher, cfg.assets.clone());
            let r = repair_character_assets(&items, &assets, limit.unwrap_or(cfg.repair_limit))
                .await?;
            println!(
                "repair: candidates={} repaired={} failed={}",
                r.candidates, r.repaired, r.failed
            );
        }
        Commands::SyncOwners => {
            let api_key = cfg
                .owners
                .api_key
                .clone()
                .context("SUBGRAPH_API_KEY is required for sync-owners")?;
            let db = connect(&cfg).await?;
            let items = PgItemStore::new(db, cfg.collection.clone());
            let index = SubgraphClient::new(cfg.http_client()?, &cfg.owners.endpoint, &api_key);
            let s = OwnerSync::new(&items, &index, cfg.owners.sync.clone())
                .run()
                .await?;
            println!(
                "sync-owners: pages={} tokens={} updated={} unchanged={} missing={} errors={} stopped={:?}",
                s.pages, s.tokens, s.updated, s.unchanged, s.missing, s.errors, s.stopped
            );
        }
        Commands::SyncPrices => {
            let base_url = cfg
                .prices
                .base_url
                .clone()
                .context("MARKETPLACE_BASE_URL is required for sync-prices")?;
            let db = connect(&cfg).await?;
            let items = PgItemStore::new(db, cfg.collection.clone());
            let feed = MarketplaceFeed::new(cfg.http_client()?, base_url);
            let s = PriceSync::new(&items, &feed).run().await?;
            println!(
                "sync-prices: cleared={} listings={} rejected={} updated={} missing={} errors={} stopped={:?}",
                s.cleared, s.listings, s.rejected, s.updated, s.missing, s.errors, s.stopped
            );
        }
        Commands::Counts { json } => {
            let db = connect(&cfg).await?;
            let items = PgItemStore::new(db, cfg.collection.clone());
            let counts = collection_counts(&items).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&counts)?);
            } else {
                println!(
                    "{}: total={} with_owner={} with_price={} missing_character={}",
                    cfg.collection,
                    counts.total,
                    counts.with_owner,
                    counts.with_price,
                    counts.missing_character
                );
            }
        }
        Commands::ValidateEnv => {
            env::preflight_check("codex validate-env", &[], CONFIG_KEYS)?;
            env::db_url().context("no database configured (DATABASE_URL or DB_*)")?;
            info!(
                collection = %cfg.collection,
                seed_dir = %cfg.seed_dir.display(),
                expected_total = cfg.expected_total(),
                "configuration ok"
            );
        }
    }
    Ok(())
}

async fn connect(cfg: &CodexConfig) -> Result<Db> {
    let url = env::db_url()?;
    Db::connect(&url, cfg.db_max_conns)
        .await
        .context("connecting to item store database")
}
