pub mod assets;
pub mod envelope;
pub mod progress;
pub mod repair;
pub mod seed;

pub use assets::{AssetConfig, AssetMigrator};
pub use progress::{ItemProgress, LogProgress, NoProgress, SeedProgress};
pub use repair::{repair_character_assets, RepairSummary};
pub use seed::{SeedConfig, SeedLoader, SeedOutcome, SeedSummary};

use anyhow::Result;
use serde::Serialize;

use crate::database_ops::store::{Filter, ItemStore, Query};

/// Population snapshot of the codex collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CollectionCounts {
    pub total: usize,
    pub with_owner: usize,
    pub with_price: usize,
    pub missing_character: usize,
}

pub async fn collection_counts(items: &dyn ItemStore) -> Result<CollectionCounts> {
    Ok(CollectionCounts {
        total: count_where(items, None).await?,
        with_owner: count_where(items, Some(Filter::not_null("owner"))).await?,
        with_price: count_where(items, Some(Filter::not_null("price"))).await?,
        missing_character: count_where(
            items,
            Some(Filter::And(vec![
                Filter::not_null(assets::CHARACTER_HASH_FIELD),
                Filter::null(assets::CHARACTER_FIELD),
            ])),
        )
        .await?,
    })
}

async fn count_where(items: &dyn ItemStore, filter: Option<Filter>) -> Result<usize> {
    let mut query = Query::new().fields(["id"]);
    if let Some(f) = filter {
        query = query.filter(f);
    }
    Ok(items.read_by_query(&query).await?.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::memory_store::MemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn counts_reflect_reconciled_fields() {
        let store = MemoryStore::new("codex");
        let rows = [
            json!({"owner": "0xa", "price": "1 ETH", "ipfs_character": "Qm1"}),
            json!({"owner": "0xb", "ipfs_character": "Qm2", "thumbnail_character": "f"}),
            json!({}),
        ];
        for (i, row) in rows.iter().enumerate() {
            store.insert(i as i64 + 1, row.as_object().cloned().unwrap());
        }
        let counts = collection_counts(&store).await.unwrap();
        assert_eq!(
            counts,
            CollectionCounts { total: 3, with_owner: 2, with_price: 1, missing_character: 1 }
        );
    }
}
