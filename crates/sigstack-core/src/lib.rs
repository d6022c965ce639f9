//! Canonical item model and the pure normalizer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "sigstack-core";

/// Canonical persisted item. `id` is store-assigned and immutable;
/// `(source, external_id)` is the dedup key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: i64,
    pub source: String,
    pub external_id: String,
    pub title: String,
    pub url: String,
    pub published_at: Option<DateTime<Utc>>,
    pub fetched_at: DateTime<Utc>,
}

/// Normalized item ready for upsert. No `id` or `fetched_at` yet: the store
/// assigns the former and the caller supplies the latter per upsert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewItem {
    pub source: String,
    pub external_id: String,
    pub title: String,
    pub url: String,
    pub published_at: Option<DateTime<Utc>>,
}

/// Raw candidate record handed off by a source adapter before validation.
/// Every field is optional; the normalizer decides what survives.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub external_id: Option<String>,
    pub title: Option<String>,
    pub url: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
}

fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Maps a raw adapter record into a canonical [`NewItem`], or rejects it.
///
/// Rejection is silent: a record missing a non-empty title or url, or with
/// no resolvable identity, returns `None` and never reaches the store.
/// Identity falls back from the source-native id to the item's url, so
/// sources without native ids (page scrapes) dedup on the link itself.
pub fn normalize(source: &str, record: RawRecord) -> Option<NewItem> {
    let title = record.title.as_deref().and_then(text_or_none)?;
    let url = record.url.as_deref().and_then(text_or_none)?;
    let external_id = record
        .external_id
        .as_deref()
        .and_then(text_or_none)
        .unwrap_or_else(|| url.clone());

    Some(NewItem {
        source: source.to_string(),
        external_id,
        title,
        url,
        published_at: record.published_at,
    })
}
