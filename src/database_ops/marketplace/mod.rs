//! Price reconciliation: clear recorded prices, then write the lowest current
//! listing for every token back onto its item.

pub mod provider;

pub use provider::{ListingBatch, ListingFeed, MarketplaceFeed};

use anyhow::Result;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::database_ops::store::{value_as_id, Filter, ItemStore, Query, StoreError};
use crate::normalization::price::{format_price, lowest_by_token};

pub const PRICE_FIELD: &str = "price";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PriceSyncSummary {
    pub cleared: usize,
    pub clear_failed: usize,
    pub listings: usize,
    pub rejected: usize,
    pub updated: usize,
    pub missing: usize,
    pub errors: usize,
    /// Set when the job stopped early because the schema is not provisioned.
    pub stopped: Option<String>,
}

pub struct PriceSync<'a> {
    items: &'a dyn ItemStore,
    feed: &'a dyn ListingFeed,
}

fn price_patch(price: Value) -> Map<String, Value> {
    let mut patch = Map::new();
    patch.insert(PRICE_FIELD.to_string(), price);
    patch
}

impl<'a> PriceSync<'a> {
    pub fn new(items: &'a dyn ItemStore, feed: &'a dyn ListingFeed) -> Self {
        Self { items, feed }
    }

    pub async fn run(&self) -> Result<PriceSyncSummary> {
        let mut summary = PriceSyncSummary::default();
        if !self.items.collection_exists().await? {
            warn!(target = "prices", collection = self.items.collection(), "collection not provisioned; skipping price sync");
            summary.stopped = Some(format!("collection `{}` missing", self.items.collection()));
            return Ok(summary);
        }

        if let Err(err) = self.clear_prices(&mut summary).await {
            warn!(target = "prices", error = %err, "schema not provisioned; stopping price sync");
            summary.stopped = Some(err.to_string());
            return Ok(summary);
        }

        let batch = match self.feed.listings().await {
            Ok(batch) => batch,
            Err(err) => {
                error!(target = "prices", error = %err, "failed to fetch listings");
                summary.errors += 1;
                return Ok(summary);
            }
        };
        summary.listings = batch.listings.len() + batch.malformed;
        let (lowest, rejected) = lowest_by_token(batch.listings);
        summary.rejected = batch.malformed + rejected.len();
        for listing in &rejected {
            warn!(
                target = "prices",
                token_id = %listing.token_id,
                value = %listing.price.value,
                decimals = listing.price.decimals,
                "unusable listing price"
            );
        }

        for listing in lowest {
            let Some(id) = value_as_id(&Value::String(listing.token_id.clone())) else {
                warn!(target = "prices", token_id = %listing.token_id, "non-numeric token id");
                summary.errors += 1;
                continue;
            };
            let formatted = match format_price(
                &listing.price.value,
                listing.price.decimals,
                &listing.price.currency,
            ) {
                Ok(s) => s,
                Err(err) => {
                    warn!(target = "prices", id, error = %err, "could not format price");
                    summary.errors += 1;
                    continue;
                }
            };
            match self.write_price(id, formatted).await {
                Ok(true) => summary.updated += 1,
                Ok(false) => summary.missing += 1,
                Err(err @ (StoreError::FieldNotFound { .. } | StoreError::CollectionNotFound(_))) => {
                    warn!(target = "prices", error = %err, "schema not provisioned; aborting price updates");
                    summary.stopped = Some(err.to_string());
                    break;
                }
                Err(err) => {
                    warn!(target = "prices", id, error = %err, "price update failed");
                    summary.errors += 1;
                }
            }
        }

        info!(
            target = "prices",
            cleared = summary.cleared,
            listings = summary.listings,
            rejected = summary.rejected,
            updated = summary.updated,
            missing = summary.missing,
            errors = summary.errors,
            "price sync complete"
        );
        Ok(summary)
    }

    /// Null out every recorded price. Per-item failures are counted; only a
    /// schema gap is returned as an error.
    async fn clear_prices(&self, summary: &mut PriceSyncSummary) -> Result<(), StoreError> {
        let query = Query::new()
            .filter(Filter::not_null(PRICE_FIELD))
            .fields(["id"]);
        let rows = match self.items.read_by_query(&query).await {
            Ok(rows) => rows,
            Err(err) if err.is_not_provisioned() => return Err(err),
            Err(err) => {
                warn!(target = "prices", error = %err, "could not list priced items; skipping clear");
                summary.clear_failed += 1;
                return Ok(());
            }
        };
        for row in rows {
            let Some(id) = row.get("id").and_then(value_as_id) else {
                summary.clear_failed += 1;
                continue;
            };
            match self.items.update_one(id, price_patch(Value::Null)).await {
                Ok(()) => summary.cleared += 1,
                Err(err) if err.is_not_provisioned() => return Err(err),
                Err(err) => {
                    debug!(target = "prices", id, error = %err, "failed to clear price");
                    summary.clear_failed += 1;
                }
            }
        }
        Ok(())
    }

    async fn write_price(&self, id: i64, price: String) -> Result<bool, StoreError> {
        if self.items.read_one(id, &["id"]).await?.is_none() {
            return Ok(false);
        }
        self.items
            .update_one(id, price_patch(Value::String(price)))
            .await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::memory_store::{MemoryStore, WriteCall};
    use crate::normalization::price::{AdoptionPrice, ListingPrice};
    use anyhow::anyhow;
    use async_trait::async_trait;
    use serde_json::json;

    struct FakeFeed(Result<Vec<AdoptionPrice>, String>);

    #[async_trait]
    impl ListingFeed for FakeFeed {
        async fn listings(&self) -> Result<ListingBatch> {
            self.0.clone().map(ListingBatch::from).map_err(|e| anyhow!(e))
        }
    }

    /// Serves a raw settings payload through the real decoder.
    struct RawFeed(&'static str);

    #[async_trait]
    impl ListingFeed for RawFeed {
        async fn listings(&self) -> Result<ListingBatch> {
            provider::parse_settings(self.0)
        }
    }

    fn listing(token: &str, value: &str) -> AdoptionPrice {
        AdoptionPrice {
            token_id: token.into(),
            price: ListingPrice {
                value: value.into(),
                currency: "ETH".into(),
                decimals: 18,
            },
        }
    }

    fn priced(price: &str) -> Map<String, Value> {
        json!({ "price": price }).as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn clears_then_writes_lowest_formatted_price() {
        let store = MemoryStore::new("codex");
        store.insert(1, priced("9 ETH"));
        store.insert(5, Map::new());
        store.insert(8, priced("3 ETH"));
        let feed = FakeFeed(Ok(vec![
            listing("5", "2000000000000000000"),
            listing("5", "1500000000000000000"),
            listing("9", "1000000000000000000"),
        ]));
        let summary = PriceSync::new(&store, &feed).run().await.unwrap();

        assert_eq!(summary.cleared, 2);
        assert_eq!(summary.updated, 1);
        assert_eq!(summary.missing, 1);
        assert_eq!(store.item(5).unwrap()["price"], "1.5 ETH");
        assert_eq!(store.item(1).unwrap()["price"], Value::Null);
        assert_eq!(store.item(8).unwrap()["price"], Value::Null);
    }

    #[tokio::test]
    async fn empty_feed_only_clears() {
        let store = MemoryStore::new("codex");
        store.insert(2, priced("1 ETH"));
        let summary = PriceSync::new(&store, &FakeFeed(Ok(vec![]))).run().await.unwrap();
        assert_eq!(summary, PriceSyncSummary { cleared: 1, ..PriceSyncSummary::default() });
    }

    #[tokio::test]
    async fn feed_error_ends_the_run_after_clearing() {
        let store = MemoryStore::new("codex");
        store.insert(2, priced("1 ETH"));
        let summary = PriceSync::new(&store, &FakeFeed(Err("502".into()))).run().await.unwrap();
        assert_eq!(summary.cleared, 1);
        assert_eq!(summary.errors, 1);
        assert_eq!(store.update_count(), 1);
    }

    #[tokio::test]
    async fn missing_price_field_stops_without_writes() {
        let store = MemoryStore::new("codex").with_fields(["id", "owner"]);
        store.insert(1, Map::new());
        let feed = FakeFeed(Ok(vec![listing("1", "1"), listing("2", "2")]));
        let summary = PriceSync::new(&store, &feed).run().await.unwrap();
        assert!(summary.stopped.is_some());
        assert!(store.writes().is_empty());
    }

    #[tokio::test]
    async fn bad_listing_values_are_rejected_not_written() {
        let store = MemoryStore::new("codex");
        store.insert(3, Map::new());
        let feed = FakeFeed(Ok(vec![listing("3", "0x10"), listing("3", "50000000000000000")]));
        let summary = PriceSync::new(&store, &feed).run().await.unwrap();
        assert_eq!(summary.rejected, 1);
        assert_eq!(
            store.writes(),
            vec![WriteCall::Update(3, json!({"price": "0.05 ETH"}).as_object().cloned().unwrap())]
        );
    }

    #[tokio::test]
    async fn one_broken_record_does_not_block_the_rest() {
        let store = MemoryStore::new("codex");
        store.insert(1, priced("9 ETH"));
        store.insert(2, Map::new());
        store.insert(3, priced("4 ETH"));
        let feed = RawFeed(
            r#"{"data":[{"key":"adoption_details","value":[
                {"tokenId":"1","price":{"value":"1500000000000000000","currency":"ETH","decimals":18}},
                {"tokenId":"2","price":{"value":"250000000000000000","currency":"ETH","decimals":18}},
                {"tokenId":"3","price":{"value":"1000000000000000000","currency":"ETH"}}
            ]}]}"#,
        );
        let summary = PriceSync::new(&store, &feed).run().await.unwrap();

        assert_eq!(summary.listings, 3);
        assert_eq!(summary.rejected, 1);
        assert_eq!(summary.updated, 2);
        assert_eq!(summary.errors, 0);
        assert_eq!(store.item(1).unwrap()["price"], "1.5 ETH");
        assert_eq!(store.item(2).unwrap()["price"], "0.25 ETH");
        assert_eq!(store.item(3).unwrap()["price"], Value::Null);
    }
}
