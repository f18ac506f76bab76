//! Owner reconciliation: copy on-chain ownership from the token index onto
//! codex items, touching only the `owner` field and only when it changed.

pub mod provider;

pub use provider::{IndexedToken, SubgraphClient, TokenIndex};

use std::time::Duration;

use anyhow::Result;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::database_ops::store::{ItemStore, StoreError};

pub const OWNER_FIELD: &str = "owner";

#[derive(Debug, Clone)]
pub struct OwnerSyncConfig {
    pub page_size: usize,
    /// Highest token id in the collection; paging stops once the cursor reaches it.
    pub max_token_id: i64,
    /// Pause after a failed page before skipping past it.
    pub error_pause: Duration,
}

impl Default for OwnerSyncConfig {
    fn default() -> Self {
        Self {
            page_size: 1000,
            max_token_id: 10_000,
            error_pause: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OwnerSyncSummary {
    pub pages: usize,
    pub tokens: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub missing: usize,
    pub errors: usize,
    /// Set when the job stopped early because the schema is not provisioned.
    pub stopped: Option<String>,
}

enum Applied {
    Updated,
    Unchanged,
    Missing,
}

pub struct OwnerSync<'a> {
    items: &'a dyn ItemStore,
    index: &'a dyn TokenIndex,
    cfg: OwnerSyncConfig,
}

impl<'a> OwnerSync<'a> {
    pub fn new(items: &'a dyn ItemStore, index: &'a dyn TokenIndex, cfg: OwnerSyncConfig) -> Self {
        Self { items, index, cfg }
    }

    pub async fn run(&self) -> Result<OwnerSyncSummary> {
        let mut summary = OwnerSyncSummary::default();
        if !self.items.collection_exists().await? {
            warn!(target = "owners", collection = self.items.collection(), "collection not provisioned; skipping owner sync");
            summary.stopped = Some(format!("collection `{}` missing", self.items.collection()));
            return Ok(summary);
        }

        let page_size = self.cfg.page_size.max(1);
        let step = page_size as i64;
        let mut cursor = 0i64;
        while cursor < self.cfg.max_token_id {
            let page = match self.index.tokens_after(cursor, page_size).await {
                Ok(page) => page,
                Err(err) => {
                    summary.errors += 1;
                    warn!(target = "owners", cursor, error = %err, "page fetch failed; skipping ahead");
                    tokio::time::sleep(self.cfg.error_pause).await;
                    cursor += step;
                    continue;
                }
            };
            summary.pages += 1;
            debug!(target = "owners", cursor, tokens = page.len(), "page fetched");

            let mut highest = cursor;
            for token in &page {
                summary.tokens += 1;
                let Ok(id) = token.token_id.trim().parse::<i64>() else {
                    warn!(target = "owners", token_id = %token.token_id, "non-numeric token id");
                    summary.errors += 1;
                    continue;
                };
                highest = highest.max(id);
                match self.apply(id, &token.owner).await {
                    Ok(Applied::Updated) => summary.updated += 1,
                    Ok(Applied::Unchanged) => summary.unchanged += 1,
                    Ok(Applied::Missing) => summary.missing += 1,
                    Err(err) if err.is_not_provisioned() => {
                        warn!(target = "owners", error = %err, "schema not provisioned; stopping owner sync");
                        summary.stopped = Some(err.to_string());
                        return Ok(summary);
                    }
                    Err(err) => {
                        warn!(target = "owners", id, error = %err, "owner update failed");
                        summary.errors += 1;
                    }
                }
            }

            if page.len() < page_size {
                break;
            }
            // a full page that did not move the cursor would repeat forever
            cursor = if highest > cursor { highest } else { cursor + step };
        }

        info!(
            target = "owners",
            pages = summary.pages,
            tokens = summary.tokens,
            updated = summary.updated,
            unchanged = summary.unchanged,
            missing = summary.missing,
            errors = summary.errors,
            "owner sync complete"
        );
        Ok(summary)
    }

    async fn apply(&self, id: i64, owner: &str) -> Result<Applied, StoreError> {
        let Some(current) = self.items.read_one(id, &["id", OWNER_FIELD]).await? else {
            return Ok(Applied::Missing);
        };
        if current.get(OWNER_FIELD).and_then(Value::as_str) == Some(owner) {
            return Ok(Applied::Unchanged);
        }
        let mut patch = Map::new();
        patch.insert(OWNER_FIELD.to_string(), Value::String(owner.to_string()));
        self.items.update_one(id, patch).await?;
        Ok(Applied::Updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::memory_store::{MemoryStore, WriteCall};
    use anyhow::anyhow;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    /// Serves a fixed token list; cursors listed in `failing` return an error.
    struct FakeIndex {
        tokens: Vec<IndexedToken>,
        failing: Vec<i64>,
        calls: Mutex<Vec<i64>>,
    }

    impl FakeIndex {
        fn new(ids: impl IntoIterator<Item = i64>) -> Self {
            Self {
                tokens: ids
                    .into_iter()
                    .map(|i| IndexedToken {
                        id: format!("0x{i:x}"),
                        token_id: i.to_string(),
                        owner: format!("0xowner{i}"),
                    })
                    .collect(),
                failing: Vec::new(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<i64> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TokenIndex for FakeIndex {
        async fn tokens_after(&self, last: i64, first: usize) -> Result<Vec<IndexedToken>> {
            self.calls.lock().unwrap().push(last);
            if self.failing.contains(&last) {
                return Err(anyhow!("gateway timeout"));
            }
            Ok(self
                .tokens
                .iter()
                .filter(|t| t.token_id.parse::<i64>().map_or(true, |id| id > last))
                .take(first)
                .cloned()
                .collect())
        }
    }

    fn cfg(page_size: usize, max_token_id: i64) -> OwnerSyncConfig {
        OwnerSyncConfig { page_size, max_token_id, error_pause: Duration::ZERO }
    }

    fn seeded(ids: impl IntoIterator<Item = i64>) -> MemoryStore {
        let store = MemoryStore::new("codex");
        for id in ids {
            store.insert(id, Map::new());
        }
        store
    }

    #[tokio::test]
    async fn short_page_ends_pagination() {
        let store = seeded(1..=5);
        let index = FakeIndex::new(1..=5);
        let summary = OwnerSync::new(&store, &index, cfg(10, 10_000)).run().await.unwrap();
        assert_eq!(index.calls(), vec![0]);
        assert_eq!(summary.updated, 5);
        assert_eq!(store.item(3).unwrap()["owner"], "0xowner3");
    }

    #[tokio::test]
    async fn pages_by_highest_token_id_and_only_writes_changes() {
        let store = seeded(1..=6);
        store.insert(2, json!({"owner": "0xowner2"}).as_object().cloned().unwrap());
        let index = FakeIndex::new(1..=7);
        let summary = OwnerSync::new(&store, &index, cfg(3, 10_000)).run().await.unwrap();
        assert_eq!(index.calls(), vec![0, 3, 6]);
        assert_eq!(summary.unchanged, 1);
        assert_eq!(summary.updated, 5);
        assert_eq!(summary.missing, 1);
        assert!(!store.writes().contains(&WriteCall::Update(2, json!({"owner": "0xowner2"}).as_object().cloned().unwrap())));
    }

    #[tokio::test]
    async fn failed_page_skips_ahead_by_page_size() {
        let store = seeded(1..=8);
        let mut index = FakeIndex::new(1..=8);
        index.failing = vec![0];
        let summary = OwnerSync::new(&store, &index, cfg(4, 10_000)).run().await.unwrap();
        assert_eq!(index.calls(), vec![0, 4, 8]);
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.updated, 4);
        assert!(!store.item(1).unwrap().contains_key("owner"));
    }

    #[tokio::test]
    async fn persistent_failures_stop_at_the_id_bound() {
        let store = seeded(1..=2);
        let mut index = FakeIndex::new(1..=2);
        index.failing = vec![0, 2, 4];
        let summary = OwnerSync::new(&store, &index, cfg(2, 6)).run().await.unwrap();
        assert_eq!(index.calls(), vec![0, 2, 4]);
        assert_eq!(summary.errors, 3);
    }

    #[tokio::test]
    async fn missing_owner_field_stops_the_job() {
        let store = MemoryStore::new("codex").with_fields(["id", "name"]);
        store.insert(1, Map::new());
        let index = FakeIndex::new(1..=3);
        let summary = OwnerSync::new(&store, &index, cfg(10, 10_000)).run().await.unwrap();
        assert!(summary.stopped.is_some());
        assert_eq!(summary.tokens, 1);
        assert!(store.writes().is_empty());
    }

    #[tokio::test]
    async fn non_numeric_ids_are_counted() {
        let store = seeded(1..=2);
        let mut index = FakeIndex::new(1..=2);
        index.tokens.push(IndexedToken {
            id: "0xz".into(),
            token_id: "abc".into(),
            owner: "0xz".into(),
        });
        let summary = OwnerSync::new(&store, &index, cfg(10, 10_000)).run().await.unwrap();
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.updated, 2);
    }
}
