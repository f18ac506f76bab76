//! Marketplace listing prices: exact fixed-point comparison and display formatting.

use std::collections::BTreeMap;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use bigdecimal::num_bigint::BigInt;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Significant fractional digits kept when formatting.
pub const MAX_FRACTION_DIGITS: usize = 5;

/// Largest accepted `decimals`; a u256 has 78 decimal digits.
pub const MAX_DECIMALS: u32 = 77;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingPrice {
    #[serde(deserialize_with = "string_or_number")]
    pub value: String,
    pub currency: String,
    pub decimals: u32,
}

/// One marketplace listing for a token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdoptionPrice {
    #[serde(rename = "tokenId", deserialize_with = "string_or_number")]
    pub token_id: String,
    pub price: ListingPrice,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s.trim().to_string()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}

/// Parse a non-negative fixed-point integer string.
pub fn parse_fixed_point(value: &str) -> Result<BigInt> {
    let trimmed = value.trim();
    if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return Err(anyhow!("not a non-negative integer: {value:?}"));
    }
    BigInt::from_str(trimmed).map_err(|e| anyhow!("invalid fixed-point value {value:?}: {e}"))
}

/// Render a fixed-point integer as `"<whole>[.<fraction>] <currency>"`.
///
/// The fraction keeps its leading zeros and is truncated (never rounded) to
/// [`MAX_FRACTION_DIGITS`] significant digits, then loses trailing zeros.
pub fn format_price(value: &str, decimals: u32, currency: &str) -> Result<String> {
    if decimals > MAX_DECIMALS {
        return Err(anyhow!("decimals {decimals} exceeds {MAX_DECIMALS}"));
    }
    let amount = parse_fixed_point(value)?;
    let scale = BigInt::from(10u32).pow(decimals);
    let whole = &amount / &scale;
    let remainder = &amount % &scale;

    let padded = format!("{:0>width$}", remainder.to_string(), width = decimals as usize);
    let significant = padded.trim_start_matches('0');
    let leading = padded.len() - significant.len();
    let kept = &significant[..significant.len().min(MAX_FRACTION_DIGITS)];
    let fraction = format!("{}{}", "0".repeat(leading), kept);
    let fraction = fraction.trim_end_matches('0');

    if fraction.is_empty() {
        Ok(format!("{whole} {currency}"))
    } else {
        Ok(format!("{whole}.{fraction} {currency}"))
    }
}

/// Keep the cheapest listing per token, ordered by token id.
///
/// Listings whose value is not a valid fixed-point integer, or whose
/// `decimals` is out of range, are returned separately so the caller can
/// report them.
pub fn lowest_by_token(listings: Vec<AdoptionPrice>) -> (Vec<AdoptionPrice>, Vec<AdoptionPrice>) {
    let mut best: BTreeMap<String, (BigInt, AdoptionPrice)> = BTreeMap::new();
    let mut rejected = Vec::new();
    for listing in listings {
        if listing.price.decimals > MAX_DECIMALS {
            rejected.push(listing);
            continue;
        }
        let Ok(amount) = parse_fixed_point(&listing.price.value) else {
            rejected.push(listing);
            continue;
        };
        let cheaper = best
            .get(&listing.token_id)
            .map_or(true, |(current, _)| amount < *current);
        if cheaper {
            best.insert(listing.token_id.clone(), (amount, listing));
        }
    }
    let mut kept: Vec<AdoptionPrice> = best.into_values().map(|(_, l)| l).collect();
    kept.sort_by_key(|l| l.token_id.parse::<i64>().unwrap_or(i64::MAX));
    (kept, rejected)
}
