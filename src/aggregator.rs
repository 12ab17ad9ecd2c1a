use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tracing::{debug, error, info, warn};

use crate::config::{FetchConfig, IngestConfig};
use crate::fetcher::FeedFetcher;
use crate::model::{FeedItem, FeedSource};
use crate::normalize::normalize;
use crate::parser::parse_feed;
use crate::store::ItemStore;

/// Summary of one ingestion cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub sources_processed: usize,
    pub sources_failed: usize,
    pub items_processed: usize,
    pub items_inserted: u64,
    pub items_pruned: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// What a single source contributed to a cycle.
struct SourceOutcome {
    source_id: i64,
    items: Vec<FeedItem>,
    error: Option<String>,
    feed_title: Option<String>,
}

pub struct Aggregator {
    store: Arc<dyn ItemStore>,
    fetcher: Arc<dyn FeedFetcher>,
    fetch: FetchConfig,
    ingest: IngestConfig,
    in_flight: AtomicUsize,
}

/// Decrements the in-flight counter even if the cycle future is dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Aggregator {
    pub fn new(
        store: Arc<dyn ItemStore>,
        fetcher: Arc<dyn FeedFetcher>,
        fetch: FetchConfig,
        ingest: IngestConfig,
    ) -> Self {
        Self {
            store,
            fetcher,
            fetch,
            ingest,
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn is_refreshing(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) > 0
    }

    /// Fetches every active source in batches, persists the newest merged
    /// items and prunes each processed source.
    ///
    /// Failing sources contribute nothing; only storage errors fail the cycle.
    pub async fn run_cycle(&self) -> anyhow::Result<CycleReport> {
        let _guard = InFlight::enter(&self.in_flight);
        let started_at = Utc::now();

        let sources = self.store.active_sources().await?;
        info!(sources = sources.len(), "starting ingestion cycle");

        let batch_size = self.fetch.batch_size.max(1);
        let mut outcomes = Vec::with_capacity(sources.len());
        for (i, batch) in sources.chunks(batch_size).enumerate() {
            if i > 0 && !self.fetch.batch_pause().is_zero() {
                tokio::time::sleep(self.fetch.batch_pause()).await;
            }
            outcomes.extend(join_all(batch.iter().map(|s| self.process_source(s))).await);
        }

        let sources_failed = outcomes.iter().filter(|o| o.error.is_some()).count();
        let mut merged: Vec<FeedItem> = outcomes
            .iter_mut()
            .flat_map(|o| std::mem::take(&mut o.items))
            .collect();
        let items_processed = merged.len();

        merged.sort_by(|a, b| b.published_at.cmp(&a.published_at));
        merged.truncate(self.ingest.serving_window);
        let items_inserted = self.store.insert_items(&merged).await?;

        let mut items_pruned = 0;
        for outcome in &outcomes {
            self.store
                .record_fetch(
                    outcome.source_id,
                    outcome.error.as_deref(),
                    outcome.feed_title.as_deref(),
                )
                .await?;
            items_pruned += self
                .store
                .prune_source(outcome.source_id, self.ingest.retention_per_source)
                .await?;
        }

        let report = CycleReport {
            sources_processed: outcomes.len(),
            sources_failed,
            items_processed,
            items_inserted,
            items_pruned,
            started_at,
            finished_at: Utc::now(),
        };
        info!(
            sources = report.sources_processed,
            failed = report.sources_failed,
            processed = report.items_processed,
            inserted = report.items_inserted,
            pruned = report.items_pruned,
            "ingestion cycle complete"
        );
        Ok(report)
    }

    async fn process_source(&self, source: &FeedSource) -> SourceOutcome {
        let body = match self.fetcher.fetch(source).await {
            Ok(body) => body,
            Err(e) => {
                warn!(source = %source.name, url = %source.feed_url, error = %e, "feed fetch failed");
                return SourceOutcome {
                    source_id: source.id,
                    items: Vec::new(),
                    error: Some(e.to_string()),
                    feed_title: None,
                };
            }
        };
        let fetched_at = Utc::now();

        let parsed = parse_feed(&body, self.ingest.items_per_feed);
        let items: Vec<FeedItem> = parsed
            .entries
            .iter()
            .filter_map(|raw| match normalize(raw, source, &self.ingest, fetched_at) {
                Ok(item) => Some(item),
                Err(reason) => {
                    debug!(source = %source.name, %reason, "dropping entry");
                    None
                }
            })
            .collect();

        debug!(
            source = %source.name,
            format = ?parsed.format,
            parsed = parsed.entries.len(),
            skipped = parsed.skipped,
            kept = items.len(),
            "feed processed"
        );

        SourceOutcome {
            source_id: source.id,
            items,
            error: None,
            feed_title: parsed.title,
        }
    }
}

/// Runs one cycle immediately, then one every `interval_minutes`.
/// An interval of zero runs nothing.
pub async fn start_background_refresh(aggregator: Arc<Aggregator>, interval_minutes: u64) {
    if interval_minutes == 0 {
        info!("Scheduled refresh disabled");
        return;
    }
    let interval = Duration::from_secs(interval_minutes * 60);

    info!("Starting initial feed fetch");
    if let Err(e) = aggregator.run_cycle().await {
        error!("Initial feed fetch failed: {}", e);
    }

    loop {
        tokio::time::sleep(interval).await;
        info!("Starting scheduled feed refresh");
        if let Err(e) = aggregator.run_cycle().await {
            error!("Scheduled feed refresh failed: {}", e);
        }
    }
}
