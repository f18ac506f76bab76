use anyhow::Result;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::database_ops::store::{value_as_id, Filter, ItemStore, Query};

use super::assets::{AssetMigrator, CHARACTER_FIELD, CHARACTER_HASH_FIELD};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepairSummary {
    pub candidates: usize,
    pub repaired: usize,
    pub failed: usize,
}

/// Retry the character image for items that have a hash but no uploaded file.
pub async fn repair_character_assets(
    items: &dyn ItemStore,
    assets: &AssetMigrator<'_>,
    limit: usize,
) -> Result<RepairSummary> {
    let query = Query::new()
        .filter(Filter::And(vec![
            Filter::not_null(CHARACTER_HASH_FIELD),
            Filter::null(CHARACTER_FIELD),
        ]))
        .fields(["id", CHARACTER_HASH_FIELD])
        .limit(limit);
    let rows = match items.read_by_query(&query).await {
        Ok(rows) => rows,
        Err(err) if err.is_not_provisioned() => {
            warn!(target = "assets", error = %err, "repair skipped: schema not provisioned");
            return Ok(RepairSummary::default());
        }
        Err(err) => return Err(err.into()),
    };

    let mut summary = RepairSummary {
        candidates: rows.len(),
        ..RepairSummary::default()
    };
    info!(target = "assets", candidates = summary.candidates, "repairing character assets");

    for row in rows {
        let id = row.get("id").and_then(value_as_id);
        let hash = row.get(CHARACTER_HASH_FIELD).and_then(Value::as_str);
        let (Some(id), Some(hash)) = (id, hash) else {
            summary.failed += 1;
            continue;
        };
        let Some(file_id) = assets.migrate_character(id, hash).await else {
            summary.failed += 1;
            continue;
        };
        let mut patch = Map::new();
        patch.insert(CHARACTER_FIELD.to_string(), Value::String(file_id));
        match items.update_one(id, patch).await {
            Ok(()) => summary.repaired += 1,
            Err(err) => {
                warn!(target = "assets", id, error = %err, "failed to store repaired asset");
                summary.failed += 1;
            }
        }
    }

    info!(
        target = "assets",
        repaired = summary.repaired,
        failed = summary.failed,
        "character repair complete"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::codex::assets::AssetConfig;
    use crate::database_ops::ipfs::BinaryFetch;
    use crate::database_ops::memory_store::MemoryStore;
    use crate::database_ops::store::Item;
    use async_trait::async_trait;
    use bytes::Bytes;
    use serde_json::json;
    use std::time::Duration;

    /// Serves bytes for every hash except `QmBroken`.
    struct HashFetch;

    #[async_trait]
    impl BinaryFetch for HashFetch {
        async fn fetch_binary(&self, url: &str, _t: Duration, _r: u32) -> Option<Bytes> {
            (!url.ends_with("QmBroken")).then(|| Bytes::copy_from_slice(url.as_bytes()))
        }
    }

    fn item(v: Value) -> Item {
        v.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn only_items_missing_the_character_are_repaired() {
        let store = MemoryStore::new("codex");
        store.insert(1, item(json!({"ipfs_character": "QmOne"})));
        store.insert(2, item(json!({"ipfs_character": "QmTwo", "thumbnail_character": "f-2"})));
        store.insert(3, item(json!({"ipfs_character": "QmBroken"})));
        store.insert(4, item(json!({"name": "no hash"})));

        let assets = AssetMigrator::new(&store, &store, &HashFetch, AssetConfig::default());
        let summary = repair_character_assets(&store, &assets, 1000).await.unwrap();

        assert_eq!(summary, RepairSummary { candidates: 2, repaired: 1, failed: 1 });
        assert_eq!(store.update_count(), 1);
        let repaired = store.item(1).unwrap();
        assert_eq!(repaired["thumbnail_character"], json!(store.files()[0].id));
        assert_eq!(store.item(2).unwrap()["thumbnail_character"], "f-2");
        assert!(!store.item(3).unwrap().contains_key("thumbnail_character"));
    }

    #[tokio::test]
    async fn limit_caps_candidates() {
        let store = MemoryStore::new("codex");
        for id in 1..=5 {
            store.insert(id, item(json!({"ipfs_character": format!("Qm{id}")})));
        }
        let assets = AssetMigrator::new(&store, &store, &HashFetch, AssetConfig::default());
        let summary = repair_character_assets(&store, &assets, 2).await.unwrap();
        assert_eq!(summary.candidates, 2);
        assert_eq!(summary.repaired, 2);
    }
}
