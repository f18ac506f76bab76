//! Idempotent bulk loader for the generated envelope files.
//!
//! Items that already exist are never touched. A file that cannot be read or
//! parsed aborts the run; inserts committed before that point stay in place and
//! the next run picks up where this one stopped through the existence check.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::database_ops::store::{value_as_id, Item, ItemStore, Query, StoreError};
use crate::normalization::timestamp::parse_created_timestamp;

use super::assets::AssetMigrator;
use super::envelope::SYNC_ID_FIELD;
use super::progress::{ItemProgress, SeedProgress};

pub const TIMESTAMP_FIELD: &str = "timestamp_created";

#[derive(Debug, Clone)]
pub struct SeedConfig {
    pub seed_dir: PathBuf,
    /// Item count at which the collection is treated as fully seeded.
    pub expected_total: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeedOutcome {
    Completed,
    CollectionMissing,
    AlreadySeeded { count: usize },
    NoSeedFiles,
    Aborted { file: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedSummary {
    pub files: usize,
    pub files_processed: usize,
    pub inserted: usize,
    pub skipped: usize,
    /// Malformed files or items, skipped individually.
    pub errors: usize,
    /// Missing-field or connection failures on single items.
    pub soft_errors: usize,
    pub asset_failures: usize,
    pub outcome: SeedOutcome,
}

impl SeedSummary {
    fn empty(outcome: SeedOutcome) -> Self {
        Self {
            files: 0,
            files_processed: 0,
            inserted: 0,
            skipped: 0,
            errors: 0,
            soft_errors: 0,
            asset_failures: 0,
            outcome,
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self.outcome, SeedOutcome::Aborted { .. })
    }
}

/// Run-fatal failure while processing one seed file.
#[derive(Debug)]
struct SeedAbort(anyhow::Error);

impl From<anyhow::Error> for SeedAbort {
    fn from(err: anyhow::Error) -> Self {
        Self(err)
    }
}

pub struct SeedLoader<'a> {
    items: &'a dyn ItemStore,
    assets: &'a AssetMigrator<'a>,
    progress: &'a dyn SeedProgress,
    cfg: SeedConfig,
}

impl<'a> SeedLoader<'a> {
    pub fn new(
        items: &'a dyn ItemStore,
        assets: &'a AssetMigrator<'a>,
        progress: &'a dyn SeedProgress,
        cfg: SeedConfig,
    ) -> Self {
        Self {
            items,
            assets,
            progress,
            cfg,
        }
    }

    /// Load every seed file. Errors are only returned for failures that
    /// happen before any file is processed and are not schema related.
    pub async fn run(&self) -> Result<SeedSummary> {
        let collection = self.items.collection();
        if !self.items.collection_exists().await? {
            warn!(target = "seed", collection, "collection not provisioned yet; skipping seed");
            return Ok(SeedSummary::empty(SeedOutcome::CollectionMissing));
        }

        let probe = Query::new()
            .fields(["id"])
            .limit(self.cfg.expected_total + 1);
        let existing = match self.items.read_by_query(&probe).await {
            Ok(rows) => rows.len(),
            Err(err) if err.is_not_provisioned() => {
                warn!(target = "seed", collection, error = %err, "collection not readable yet; skipping seed");
                return Ok(SeedSummary::empty(SeedOutcome::CollectionMissing));
            }
            Err(err) => return Err(err.into()),
        };
        if existing >= self.cfg.expected_total {
            info!(target = "seed", collection, existing, "collection already seeded");
            return Ok(SeedSummary::empty(SeedOutcome::AlreadySeeded { count: existing }));
        }

        let files = list_seed_files(&self.cfg.seed_dir).await?;
        if files.is_empty() {
            info!(target = "seed", dir = %self.cfg.seed_dir.display(), "no seed files found");
            return Ok(SeedSummary::empty(SeedOutcome::NoSeedFiles));
        }

        // resolve once, before any item work
        let folder = self.assets.folder().await;
        info!(
            target = "seed",
            collection,
            existing,
            files = files.len(),
            folder = folder.as_deref().unwrap_or("<root>"),
            "starting seed"
        );

        let mut summary = SeedSummary::empty(SeedOutcome::Completed);
        summary.files = files.len();
        let mut items_done = 0usize;
        for (file_index, path) in files.iter().enumerate() {
            let name = file_label(path);
            if let Err(SeedAbort(err)) = self
                .load_file(path, file_index, &mut items_done, &mut summary)
                .await
            {
                error!(
                    target = "seed",
                    file = %name,
                    error = %err,
                    inserted = summary.inserted,
                    skipped = summary.skipped,
                    errors = summary.errors,
                    "aborting seed run"
                );
                summary.outcome = SeedOutcome::Aborted {
                    file: name,
                    reason: format!("{err:#}"),
                };
                return Ok(summary);
            }
            summary.files_processed += 1;
            self.progress
                .on_file_progress(file_index + 1, files.len(), &name);
        }

        info!(
            target = "seed",
            inserted = summary.inserted,
            skipped = summary.skipped,
            errors = summary.errors,
            soft_errors = summary.soft_errors,
            asset_failures = summary.asset_failures,
            "seed complete"
        );
        Ok(summary)
    }

    async fn load_file(
        &self,
        path: &Path,
        file_index: usize,
        items_done: &mut usize,
        summary: &mut SeedSummary,
    ) -> Result<(), SeedAbort> {
        let raw = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let doc: Value = serde_json::from_slice(&raw)
            .with_context(|| format!("parsing {}", path.display()))?;

        let Some(entries) = doc.get("data").and_then(Value::as_array) else {
            warn!(target = "seed", file = %path.display(), "seed file has no data array");
            summary.errors += 1;
            return Ok(());
        };

        let items_in_file = entries.len();
        for (item_index, entry) in entries.iter().enumerate() {
            self.load_item(entry, summary).await?;
            *items_done += 1;
            self.progress.on_item_progress(ItemProgress {
                file_index,
                item_index,
                items_in_file,
                items_done: *items_done,
            });
        }
        Ok(())
    }

    async fn load_item(&self, entry: &Value, summary: &mut SeedSummary) -> Result<(), SeedAbort> {
        let Some(mut item) = entry.as_object().cloned() else {
            warn!(target = "seed", "seed entry is not an object");
            summary.errors += 1;
            return Ok(());
        };
        let Some(id) = item.get("id").and_then(value_as_id) else {
            warn!(target = "seed", "seed entry has no usable id");
            summary.errors += 1;
            return Ok(());
        };
        prepare_item(&mut item);

        match self.items.read_one(id, &["id"]).await {
            Ok(Some(_)) => {
                debug!(target = "seed", id, "already present");
                summary.skipped += 1;
                return Ok(());
            }
            Ok(None) => {}
            Err(err) => return self.item_failure(id, err, summary),
        }

        let report = self.assets.migrate(id, &mut item).await;
        summary.asset_failures += report.failed;

        match self.items.create_one(item).await {
            Ok(_) => {
                summary.inserted += 1;
                Ok(())
            }
            Err(err) => self.item_failure(id, err, summary),
        }
    }

    fn item_failure(
        &self,
        id: i64,
        err: StoreError,
        summary: &mut SeedSummary,
    ) -> Result<(), SeedAbort> {
        match err {
            StoreError::FieldNotFound { .. } | StoreError::NotConnected(_) => {
                warn!(target = "seed", id, error = %err, "item skipped");
                summary.soft_errors += 1;
                Ok(())
            }
            other => Err(SeedAbort(anyhow::Error::new(other).context(format!("item {id}")))),
        }
    }
}

/// Drop envelope-only fields and normalize the creation timestamp.
///
/// An unparseable timestamp is removed rather than defaulted.
pub fn prepare_item(item: &mut Item) {
    item.remove(SYNC_ID_FIELD);
    let Some(raw) = item.remove(TIMESTAMP_FIELD) else {
        return;
    };
    let parsed = raw.as_str().and_then(parse_created_timestamp);
    match parsed {
        Some(ts) => {
            item.insert(TIMESTAMP_FIELD.to_string(), Value::String(ts.to_rfc3339()));
        }
        None if raw.is_null() => {}
        None => debug!(target = "seed", value = %raw, "dropping unparseable timestamp"),
    }
}

/// `.json` files directly inside `dir`, sorted by name. A missing directory
/// yields an empty list.
pub async fn list_seed_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(rd) => rd,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("listing {}", dir.display())),
    };
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "json") && entry.file_type().await?.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::codex::assets::AssetConfig;
    use crate::database_ops::codex::envelope::Envelope;
    use crate::database_ops::codex::progress::NoProgress;
    use crate::database_ops::ipfs::BinaryFetch;
    use crate::database_ops::memory_store::{MemoryStore, WriteCall};
    use async_trait::async_trait;
    use bytes::Bytes;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    struct NoFetch;

    #[async_trait]
    impl BinaryFetch for NoFetch {
        async fn fetch_binary(&self, _url: &str, _t: Duration, _r: u32) -> Option<Bytes> {
            None
        }
    }

    #[derive(Default)]
    struct Recorder {
        files: Mutex<Vec<(usize, usize)>>,
        items: Mutex<Vec<usize>>,
    }

    impl SeedProgress for Recorder {
        fn on_file_progress(&self, done: usize, total: usize, _file: &str) {
            self.files.lock().unwrap().push((done, total));
        }
        fn on_item_progress(&self, p: ItemProgress) {
            self.items.lock().unwrap().push(p.items_done);
        }
    }

    fn write_envelope(dir: &Path, id: i64, extra: Value) {
        let mut doc = json!({"id": id, "name": format!("Codex {id}")});
        if let (Value::Object(d), Value::Object(e)) = (&mut doc, extra) {
            d.extend(e);
        }
        let env = Envelope::wrap("codex", doc, id as u32);
        let path = dir.join(format!("codex-{id:05}.json"));
        std::fs::write(path, serde_json::to_vec(&env).unwrap()).unwrap();
    }

    fn cfg(dir: &Path, expected_total: usize) -> SeedConfig {
        SeedConfig {
            seed_dir: dir.to_path_buf(),
            expected_total,
        }
    }

    async fn run_seed(store: &MemoryStore, dir: &Path, expected: usize) -> SeedSummary {
        let assets = AssetMigrator::new(store, store, &NoFetch, AssetConfig::default());
        SeedLoader::new(store, &assets, &NoProgress, cfg(dir, expected))
            .run()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn second_run_inserts_nothing() {
        let dir = tempfile::tempdir().unwrap();
        for id in 1..=3 {
            write_envelope(dir.path(), id, json!({"timestamp_created": "2025-10-11 16:46:41 EDT"}));
        }
        let store = MemoryStore::new("codex");

        let first = run_seed(&store, dir.path(), 10).await;
        assert_eq!(first.outcome, SeedOutcome::Completed);
        assert_eq!((first.inserted, first.skipped), (3, 0));

        let second = run_seed(&store, dir.path(), 10).await;
        assert_eq!((second.inserted, second.skipped), (0, 3));
        assert_eq!(store.create_count(), 3);

        let stored = store.item(2).unwrap();
        assert!(!stored.contains_key("_sync_id"));
        assert_eq!(stored["timestamp_created"], "2025-10-11T20:46:41+00:00");
    }

    #[tokio::test]
    async fn missing_collection_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        write_envelope(dir.path(), 1, json!({}));
        let store = MemoryStore::without_collection("codex");
        let summary = run_seed(&store, dir.path(), 10).await;
        assert_eq!(summary.outcome, SeedOutcome::CollectionMissing);
        assert!(store.writes().is_empty());
    }

    #[tokio::test]
    async fn full_collection_and_missing_dir_short_circuit() {
        let store = MemoryStore::new("codex");
        for id in 1..=3 {
            store.insert(id, Item::new());
        }
        let dir = tempfile::tempdir().unwrap();
        let summary = run_seed(&store, dir.path(), 3).await;
        assert_eq!(summary.outcome, SeedOutcome::AlreadySeeded { count: 3 });

        let empty = MemoryStore::new("codex");
        let summary = run_seed(&empty, &dir.path().join("nope"), 3).await;
        assert_eq!(summary.outcome, SeedOutcome::NoSeedFiles);
    }

    #[tokio::test]
    async fn malformed_thumbnail_does_not_fail_the_item() {
        let dir = tempfile::tempdir().unwrap();
        write_envelope(
            dir.path(),
            7,
            json!({"thumbnail": "data:image/jpeg;base64,###", "timestamp_created": "whenever"}),
        );
        let store = MemoryStore::new("codex");
        let summary = run_seed(&store, dir.path(), 10).await;
        assert_eq!(summary.outcome, SeedOutcome::Completed);
        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.errors, 0);
        assert_eq!(summary.asset_failures, 1);
        let stored = store.item(7).unwrap();
        assert!(!stored.contains_key("thumbnail"));
        assert!(!stored.contains_key("timestamp_created"));
    }

    #[tokio::test]
    async fn corrupt_file_aborts_but_keeps_earlier_inserts() {
        let dir = tempfile::tempdir().unwrap();
        write_envelope(dir.path(), 1, json!({}));
        std::fs::write(dir.path().join("codex-00002.json"), b"{not json").unwrap();
        write_envelope(dir.path(), 3, json!({}));
        let store = MemoryStore::new("codex");
        let summary = run_seed(&store, dir.path(), 10).await;
        assert!(summary.is_aborted());
        assert!(matches!(&summary.outcome, SeedOutcome::Aborted { file, .. } if file == "codex-00002.json"));
        assert_eq!(summary.inserted, 1);
        assert_eq!(store.writes(), vec![WriteCall::Create(1)]);
    }

    #[tokio::test]
    async fn format_errors_and_missing_fields_are_counted_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("codex-00001.json"), br#"{"collection":"codex"}"#).unwrap();
        std::fs::write(
            dir.path().join("codex-00002.json"),
            br#"{"data":[{"name":"no id"}, 5]}"#,
        )
        .unwrap();
        write_envelope(dir.path(), 3, json!({"owner": "0xabc"}));
        write_envelope(dir.path(), 4, json!({}));
        let store = MemoryStore::new("codex").with_fields(["id", "name"]);
        let progress = Recorder::default();
        let assets = AssetMigrator::new(&store, &store, &NoFetch, AssetConfig::default());
        let summary = SeedLoader::new(&store, &assets, &progress, cfg(dir.path(), 10))
            .run()
            .await
            .unwrap();
        assert_eq!(summary.outcome, SeedOutcome::Completed);
        assert_eq!(summary.errors, 3);
        assert_eq!(summary.soft_errors, 1);
        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.files_processed, 4);
        assert_eq!(*progress.files.lock().unwrap(), vec![(1, 4), (2, 4), (3, 4), (4, 4)]);
        assert_eq!(*progress.items.lock().unwrap(), vec![1, 2, 3, 4]);
    }
}
