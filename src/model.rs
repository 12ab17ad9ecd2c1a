use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use sqlx::FromRow;

/// A registered feed endpoint.
#[derive(Debug, Clone, FromRow)]
pub struct FeedSource {
    pub id: i64,
    pub name: String,
    pub feed_url: String,
    pub source_handle: Option<String>,
    pub is_active: bool,
    /// Name was derived rather than configured and may be replaced by the feed title
    pub auto_named: bool,
    pub last_fetched_at: Option<String>,
    pub last_error: Option<String>,
}

/// A normalized entry ready for storage.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedItem {
    pub fingerprint: String,
    pub title: String,
    pub link: String,
    pub summary: String,
    pub published_at: DateTime<Utc>,
    pub source_id: i64,
    pub source_name: String,
}

/// An item as served to readers, joined with its source.
#[derive(Debug, Clone, Serialize, PartialEq, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct StoredItem {
    pub id: String,
    pub title: String,
    pub link: String,
    pub summary: String,
    pub published_at: String,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ItemQuery {
    pub limit: i64,
    pub offset: i64,
    pub source: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub limit: i64,
    pub offset: i64,
    pub total: i64,
    pub has_more: bool,
}

impl Pagination {
    pub fn new(limit: i64, offset: i64, total: i64) -> Self {
        Self {
            limit,
            offset,
            total,
            has_more: offset.saturating_add(limit) < total,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ItemPage {
    pub items: Vec<StoredItem>,
    pub pagination: Pagination,
    pub as_of: DateTime<Utc>,
}

/// Timestamps are persisted in one fixed-width form so that string order is time order.
pub fn format_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}
