use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::database_ops::store::Filter;
use crate::normalization::price::AdoptionPrice;

pub const ADOPTION_SETTINGS_KEY: &str = "adoption_details";

/// Listings decoded from one feed read, plus how many records were skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListingBatch {
    pub listings: Vec<AdoptionPrice>,
    pub malformed: usize,
}

impl From<Vec<AdoptionPrice>> for ListingBatch {
    fn from(listings: Vec<AdoptionPrice>) -> Self {
        Self {
            listings,
            malformed: 0,
        }
    }
}

/// Source of current marketplace listings.
#[async_trait]
pub trait ListingFeed: Send + Sync {
    /// Every active listing. An empty feed is a valid answer.
    async fn listings(&self) -> Result<ListingBatch>;
}

#[derive(Debug, Deserialize)]
struct SettingsResponse {
    #[serde(default)]
    data: Vec<SettingRow>,
}

#[derive(Debug, Deserialize)]
struct SettingRow {
    #[serde(default)]
    value: Value,
}

/// Reads listings from the marketplace's settings collection.
pub struct MarketplaceFeed {
    http: Client,
    base_url: String,
}

impl MarketplaceFeed {
    pub fn new(http: Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    pub fn settings_url(&self) -> String {
        let filter = Filter::eq("key", ADOPTION_SETTINGS_KEY).to_rest_json();
        format!(
            "{}/items/settings?filter={}",
            self.base_url.trim_end_matches('/'),
            urlencoding::encode(&filter.to_string())
        )
    }
}

#[async_trait]
impl ListingFeed for MarketplaceFeed {
    async fn listings(&self) -> Result<ListingBatch> {
        let url = self.settings_url();
        let resp = self.http.get(&url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("marketplace settings request failed (status={status}): {text}"));
        }
        let body = resp.text().await?;
        parse_settings(&body)
    }
}

/// Decode the settings payload. The listing array is usually stored as a
/// JSON-encoded string inside `value`. Records that do not decode as a
/// listing are skipped and counted; only a broken envelope is an error.
pub fn parse_settings(body: &str) -> Result<ListingBatch> {
    if body.trim().is_empty() {
        return Ok(ListingBatch::default());
    }
    let parsed: SettingsResponse =
        serde_json::from_str(body).context("invalid marketplace settings payload")?;
    let Some(row) = parsed.data.into_iter().next() else {
        return Ok(ListingBatch::default());
    };
    let value = match row.value {
        Value::Null => return Ok(ListingBatch::default()),
        Value::String(s) if s.trim().is_empty() => return Ok(ListingBatch::default()),
        Value::String(s) => serde_json::from_str(&s).context("invalid adoption_details value")?,
        other => other,
    };
    let records = match value {
        Value::Null => return Ok(ListingBatch::default()),
        Value::Array(records) => records,
        _ => return Err(anyhow!("adoption_details is not a listing array")),
    };

    let mut batch = ListingBatch::default();
    for (idx, record) in records.into_iter().enumerate() {
        match serde_json::from_value::<AdoptionPrice>(record) {
            Ok(listing) => batch.listings.push(listing),
            Err(err) => {
                warn!(target = "prices", index = idx, error = %err, "skipping malformed listing");
                batch.malformed += 1;
            }
        }
    }
    Ok(batch)
}
