use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio::sync::RwLock;

use crate::config::SourceConfig;
use crate::model::{format_timestamp, FeedItem, FeedSource, ItemQuery, StoredItem};
use crate::normalize::fingerprint;

/// Durable storage for sources and normalized items.
///
/// Writes are idempotent: inserting an item whose fingerprint is already
/// stored is a no-op, so overlapping ingestion cycles need no coordination.
#[async_trait]
pub trait ItemStore: Send + Sync {
    /// Registers configured sources, updating existing ones matched by URL.
    async fn sync_sources(&self, configs: &[SourceConfig]) -> anyhow::Result<()>;

    async fn all_sources(&self) -> anyhow::Result<Vec<FeedSource>>;

    async fn active_sources(&self) -> anyhow::Result<Vec<FeedSource>> {
        let sources = self.all_sources().await?;
        Ok(sources.into_iter().filter(|s| s.is_active).collect())
    }

    /// Inserts items in order, skipping known fingerprints. Returns the number of new rows.
    async fn insert_items(&self, items: &[FeedItem]) -> anyhow::Result<u64>;

    /// Stamps `last_fetched_at`, records (or clears) the last error and, for
    /// auto-named sources, adopts the feed's own title.
    async fn record_fetch(
        &self,
        source_id: i64,
        error: Option<&str>,
        feed_title: Option<&str>,
    ) -> anyhow::Result<()>;

    /// Deletes all but the `keep` most recent items of a source. Returns the number deleted.
    async fn prune_source(&self, source_id: i64, keep: i64) -> anyhow::Result<u64>;

    /// Items ordered by publication date descending, ties in insertion order.
    async fn list_items(&self, query: &ItemQuery) -> anyhow::Result<Vec<StoredItem>>;

    async fn count_items(&self, source: Option<&str>) -> anyhow::Result<i64>;
}

struct Row {
    seq: u64,
    item: FeedItem,
}

#[derive(Default)]
struct Inner {
    sources: Vec<FeedSource>,
    rows: Vec<Row>,
    fingerprints: HashSet<String>,
    next_seq: u64,
}

impl Inner {
    fn source(&self, id: i64) -> Option<&FeedSource> {
        self.sources.iter().find(|s| s.id == id)
    }

    /// Rows sorted for reading: newest first, earlier insertion first on ties.
    fn sorted_rows(&self) -> Vec<&Row> {
        let mut rows: Vec<&Row> = self.rows.iter().collect();
        rows.sort_by(|a, b| {
            b.item
                .published_at
                .cmp(&a.item.published_at)
                .then(a.seq.cmp(&b.seq))
        });
        rows
    }

    fn matches(&self, row: &Row, source: Option<&str>) -> bool {
        match source {
            None => true,
            Some(name) => self.source(row.item.source_id).is_some_and(|s| s.name == name),
        }
    }
}

/// In-process [`ItemStore`] for tests and demo mode.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store pre-populated with sample sources and items, used when the
    /// service runs with `demo_data = true`.
    pub async fn with_demo_data() -> anyhow::Result<Self> {
        let store = Self::new();
        let samples: [(&str, &str, &str, &str, &str, i64); 6] = [
            (
                "DataBreaches.net",
                "@DataBreachesNet",
                "Major Healthcare Provider Suffers Data Breach Affecting 2.3M Patients",
                "https://databreaches.net/2024/01/15/major-healthcare-breach",
                "A leading healthcare provider has disclosed a significant data breach that exposed personal health information of over 2.3 million patients.",
                2,
            ),
            (
                "UpGuard",
                "@UpGuardHQ",
                "Financial Services Firm Discloses Ransomware Attack",
                "https://www.upguard.com/breaches/financial-ransomware-attack",
                "A major financial services company has confirmed it was targeted by ransomware actors who gained access to customer account information.",
                6,
            ),
            (
                "HaveIBeenPwned",
                "@haveibeenpwned",
                "Government Agency Database Exposed Online",
                "https://haveibeenpwned.com/Breach/GovAgency2024",
                "A misconfigured database belonging to a government agency was discovered exposed online for several months.",
                12,
            ),
            (
                "IT Pro",
                "@ITProUK",
                "Retail Chain Suffers Point-of-Sale System Breach",
                "https://www.itpro.com/security/retail-pos-breach-2024",
                "A popular retail chain has disclosed that attackers compromised their point-of-sale systems across multiple locations.",
                18,
            ),
            (
                "DataBreachToday",
                "@DataBreachTdy",
                "Cloud Storage Provider Confirms Data Exposure",
                "https://www.databreachtoday.com/cloud-storage-breach",
                "A cloud storage provider has confirmed that a configuration error led to unauthorized access to customer files and metadata.",
                24,
            ),
            (
                "Thales Security",
                "@ThalesCloud",
                "University System Targeted in Sophisticated Phishing Campaign",
                "https://dis-blog.thalesgroup.com/university-phishing-attack",
                "A major university system fell victim to a sophisticated phishing campaign that compromised faculty and student credentials.",
                48,
            ),
        ];

        let configs: Vec<SourceConfig> = samples
            .iter()
            .map(|(name, handle, _, link, _, _)| SourceConfig {
                name: Some(name.to_string()),
                url: format!("{}/feed", link.trim_end_matches('/')),
                handle: Some(handle.to_string()),
                active: false,
            })
            .collect();
        store.sync_sources(&configs).await?;

        let sources = store.all_sources().await?;
        let now = Utc::now();
        let items: Vec<FeedItem> = samples
            .iter()
            .zip(&sources)
            .map(|((_, _, title, link, summary, hours_ago), source)| FeedItem {
                fingerprint: fingerprint(title, link, source.id),
                title: title.to_string(),
                link: link.to_string(),
                summary: summary.to_string(),
                published_at: now - Duration::hours(*hours_ago),
                source_id: source.id,
                source_name: source.name.clone(),
            })
            .collect();
        store.insert_items(&items).await?;

        Ok(store)
    }
}

#[async_trait]
impl ItemStore for MemoryStore {
    async fn sync_sources(&self, configs: &[SourceConfig]) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        for config in configs {
            let name = config.display_name();
            let auto_named = config.is_auto_named();
            if let Some(existing) = inner.sources.iter_mut().find(|s| s.feed_url == config.url) {
                if !(auto_named && existing.auto_named) {
                    existing.name = name;
                }
                existing.auto_named = auto_named;
                existing.source_handle = config.handle.clone();
                existing.is_active = config.active;
                continue;
            }
            let id = inner.sources.iter().map(|s| s.id).max().unwrap_or(0) + 1;
            inner.sources.push(FeedSource {
                id,
                name,
                feed_url: config.url.clone(),
                source_handle: config.handle.clone(),
                is_active: config.active,
                auto_named,
                last_fetched_at: None,
                last_error: None,
            });
        }
        Ok(())
    }

    async fn all_sources(&self) -> anyhow::Result<Vec<FeedSource>> {
        Ok(self.inner.read().await.sources.clone())
    }

    async fn insert_items(&self, items: &[FeedItem]) -> anyhow::Result<u64> {
        let mut inner = self.inner.write().await;
        let mut inserted = 0;
        for item in items {
            if !inner.fingerprints.insert(item.fingerprint.clone()) {
                continue;
            }
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.rows.push(Row {
                seq,
                item: item.clone(),
            });
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn record_fetch(
        &self,
        source_id: i64,
        error: Option<&str>,
        feed_title: Option<&str>,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(source) = inner.sources.iter_mut().find(|s| s.id == source_id) {
            source.last_fetched_at = Some(format_timestamp(&Utc::now()));
            source.last_error = error.map(str::to_string);
            if let Some(title) = feed_title.filter(|_| source.auto_named) {
                source.name = title.to_string();
            }
        }
        Ok(())
    }

    async fn prune_source(&self, source_id: i64, keep: i64) -> anyhow::Result<u64> {
        let mut inner = self.inner.write().await;
        let keep = usize::try_from(keep).unwrap_or(0);
        let doomed: HashSet<u64> = inner
            .sorted_rows()
            .into_iter()
            .filter(|row| row.item.source_id == source_id)
            .skip(keep)
            .map(|row| row.seq)
            .collect();
        if doomed.is_empty() {
            return Ok(0);
        }

        let Inner {
            rows, fingerprints, ..
        } = &mut *inner;
        rows.retain(|row| {
            if doomed.contains(&row.seq) {
                fingerprints.remove(&row.item.fingerprint);
                false
            } else {
                true
            }
        });
        Ok(doomed.len() as u64)
    }

    async fn list_items(&self, query: &ItemQuery) -> anyhow::Result<Vec<StoredItem>> {
        let inner = self.inner.read().await;
        let offset = usize::try_from(query.offset).unwrap_or(0);
        let limit = usize::try_from(query.limit).unwrap_or(0);
        let items = inner
            .sorted_rows()
            .into_iter()
            .filter(|row| inner.matches(row, query.source.as_deref()))
            .skip(offset)
            .take(limit)
            .map(|row| {
                let source = inner.source(row.item.source_id);
                StoredItem {
                    id: row.item.fingerprint.clone(),
                    title: row.item.title.clone(),
                    link: row.item.link.clone(),
                    summary: row.item.summary.clone(),
                    published_at: format_timestamp(&row.item.published_at),
                    source: source
                        .map(|s| s.name.clone())
                        .unwrap_or_else(|| row.item.source_name.clone()),
                    source_handle: source.and_then(|s| s.source_handle.clone()),
                }
            })
            .collect();
        Ok(items)
    }

    async fn count_items(&self, source: Option<&str>) -> anyhow::Result<i64> {
        let inner = self.inner.read().await;
        let count = inner.rows.iter().filter(|row| inner.matches(row, source)).count();
        Ok(count as i64)
    }
}
