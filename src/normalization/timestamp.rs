use std::sync::LazyLock;

use chrono::{DateTime, FixedOffset, Utc};
use regex::Regex;

static TEXTUAL_TS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{4}-\d{2}-\d{2})[ T](\d{2}:\d{2}:\d{2})(?:\.\d+)?(?:\s*([A-Za-z]{1,5}|[+-]\d{2}:?\d{2}))?$")
        .expect("timestamp pattern compiles")
});

/// UTC offset in seconds for zone abbreviations seen in source documents.
fn zone_offset_secs(token: &str) -> Option<i32> {
    let hours = match token.to_ascii_uppercase().as_str() {
        "UTC" | "GMT" | "Z" => 0,
        "EDT" => -4,
        "EST" | "CDT" => -5,
        "CST" | "MDT" => -6,
        "MST" | "PDT" => -7,
        "PST" => -8,
        "BST" | "CET" => 1,
        "CEST" | "EET" => 2,
        "JST" => 9,
        _ => return None,
    };
    Some(hours * 3600)
}

/// Rewrite a trailing zone token into a numeric `+HHMM` offset.
///
/// `"2025-10-11 16:46:41 EDT"` becomes `"2025-10-11 16:46:41 -0400"`; input
/// without a zone is taken as UTC. Unknown abbreviations yield `None`.
pub fn normalize_zone_token(raw: &str) -> Option<String> {
    let caps = TEXTUAL_TS.captures(raw.trim())?;
    let date = caps.get(1)?.as_str();
    let time = caps.get(2)?.as_str();
    let offset = match caps.get(3).map(|m| m.as_str()) {
        None => "+0000".to_string(),
        Some(tok) if tok.starts_with(['+', '-']) => tok.replace(':', ""),
        Some(tok) => {
            let secs = zone_offset_secs(tok)?;
            let sign = if secs < 0 { '-' } else { '+' };
            let abs = secs.abs();
            format!("{sign}{:02}{:02}", abs / 3600, (abs % 3600) / 60)
        }
    };
    Some(format!("{date} {time} {offset}"))
}

/// Parse a creation timestamp from a source document.
pub fn parse_created_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }
    let normalized = normalize_zone_token(trimmed)?;
    DateTime::<FixedOffset>::parse_from_str(&normalized, "%Y-%m-%d %H:%M:%S %z")
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
