use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::aggregator::Aggregator;
use crate::model::{format_timestamp, FeedSource, ItemPage, ItemQuery, Pagination, StoredItem};
use crate::store::ItemStore;

const DEFAULT_LIMIT: i64 = 20;
const MAX_LIMIT: i64 = 100;

pub struct AppState {
    pub store: Arc<dyn ItemStore>,
    pub aggregator: Arc<Aggregator>,
}

// Custom error type
pub struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": self.0.to_string() })),
        )
            .into_response()
    }
}

impl<E: Into<anyhow::Error>> From<E> for AppError {
    fn from(err: E) -> Self {
        AppError(err.into())
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/items", get(items))
        .route("/refresh", post(refresh))
        .route("/refresh/status", get(refresh_status))
        .route("/sources", get(sources))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Reads one page of items, newest first.
///
/// `limit` is clamped to `1..=100` and `offset` to `>= 0`; `total` counts only
/// items matching `source` when a filter is given.
pub async fn list_items(
    store: &dyn ItemStore,
    limit: i64,
    offset: i64,
    source: Option<&str>,
) -> anyhow::Result<ItemPage> {
    let limit = limit.clamp(1, MAX_LIMIT);
    let offset = offset.max(0);
    let query = ItemQuery {
        limit,
        offset,
        source: source.map(str::to_string),
    };

    let items = store.list_items(&query).await?;
    let total = store.count_items(source).await?;

    Ok(ItemPage {
        items,
        pagination: Pagination::new(limit, offset, total),
        as_of: Utc::now(),
    })
}

/// Query parameters are read leniently: anything unparsable falls back to the default.
#[derive(Debug, Deserialize)]
pub struct ItemsQuery {
    pub limit: Option<String>,
    pub offset: Option<String>,
    pub source: Option<String>,
}

impl ItemsQuery {
    fn limit(&self) -> i64 {
        parse_param(self.limit.as_deref()).unwrap_or(DEFAULT_LIMIT)
    }

    fn offset(&self) -> i64 {
        parse_param(self.offset.as_deref()).unwrap_or(0)
    }

    fn source(&self) -> Option<&str> {
        self.source.as_deref().filter(|s| !s.is_empty())
    }
}

fn parse_param(value: Option<&str>) -> Option<i64> {
    value.and_then(|v| v.trim().parse().ok())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ItemsResponse {
    items: Vec<StoredItem>,
    pagination: Pagination,
    timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

// Route handlers
pub async fn items(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ItemsQuery>,
) -> impl IntoResponse {
    let limit = query.limit();
    let offset = query.offset();

    let response = match list_items(&*state.store, limit, offset, query.source()).await {
        Ok(page) => ItemsResponse {
            items: page.items,
            pagination: page.pagination,
            timestamp: format_timestamp(&page.as_of),
            error: None,
        },
        Err(e) => {
            error!("Failed to read items: {:#}", e);
            ItemsResponse {
                items: Vec::new(),
                pagination: Pagination::new(limit.clamp(1, MAX_LIMIT), offset.max(0), 0),
                timestamp: format_timestamp(&Utc::now()),
                error: Some(e.to_string()),
            }
        }
    };

    Json(response)
}

pub async fn refresh(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.aggregator.run_cycle().await {
        Ok(report) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "message": format!(
                    "Processed {} items from {} sources",
                    report.items_processed, report.sources_processed
                ),
                "itemsProcessed": report.items_processed,
                "itemsInserted": report.items_inserted,
                "sourcesProcessed": report.sources_processed,
                "timestamp": format_timestamp(&report.finished_at),
            })),
        ),
        Err(e) => {
            error!("Refresh failed: {:#}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "success": false,
                    "error": e.to_string(),
                    "timestamp": format_timestamp(&Utc::now()),
                })),
            )
        }
    }
}

pub async fn refresh_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({ "refreshing": state.aggregator.is_refreshing() }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SourceView {
    id: i64,
    name: String,
    feed_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    source_handle: Option<String>,
    is_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_fetched_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_error: Option<String>,
}

impl From<FeedSource> for SourceView {
    fn from(source: FeedSource) -> Self {
        Self {
            id: source.id,
            name: source.name,
            feed_url: source.feed_url,
            source_handle: source.source_handle,
            is_active: source.is_active,
            last_fetched_at: source.last_fetched_at,
            last_error: source.last_error,
        }
    }
}

pub async fn sources(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, AppError> {
    let sources: Vec<SourceView> = state
        .store
        .all_sources()
        .await?
        .into_iter()
        .map(SourceView::from)
        .collect();
    Ok(Json(json!({ "sources": sources })))
}

pub async fn health() -> impl IntoResponse {
    "OK"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FetchConfig, IngestConfig, SourceConfig};
    use crate::db::Database;
    use crate::fetcher::{FeedFetcher, FetchError};
    use crate::model::FeedItem;
    use crate::normalize::fingerprint;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use axum::{body::Body, http::Request};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    struct NoopFetcher;

    #[async_trait]
    impl FeedFetcher for NoopFetcher {
        async fn fetch(&self, _source: &FeedSource) -> Result<String, FetchError> {
            Err(FetchError::HttpStatus(503))
        }
    }

    /// A store whose every call fails.
    struct BrokenStore;

    #[async_trait]
    impl ItemStore for BrokenStore {
        async fn sync_sources(&self, _configs: &[SourceConfig]) -> anyhow::Result<()> {
            anyhow::bail!("store offline")
        }
        async fn all_sources(&self) -> anyhow::Result<Vec<FeedSource>> {
            anyhow::bail!("store offline")
        }
        async fn insert_items(&self, _items: &[FeedItem]) -> anyhow::Result<u64> {
            anyhow::bail!("store offline")
        }
        async fn record_fetch(
            &self,
            _source_id: i64,
            _error: Option<&str>,
            _feed_title: Option<&str>,
        ) -> anyhow::Result<()> {
            anyhow::bail!("store offline")
        }
        async fn prune_source(&self, _source_id: i64, _keep: i64) -> anyhow::Result<u64> {
            anyhow::bail!("store offline")
        }
        async fn list_items(&self, _query: &ItemQuery) -> anyhow::Result<Vec<StoredItem>> {
            anyhow::bail!("store offline")
        }
        async fn count_items(&self, _source: Option<&str>) -> anyhow::Result<i64> {
            anyhow::bail!("store offline")
        }
    }

    fn create_app(store: Arc<dyn ItemStore>) -> Router {
        let aggregator = Arc::new(Aggregator::new(
            store.clone(),
            Arc::new(NoopFetcher),
            FetchConfig {
                batch_pause_ms: 0,
                ..FetchConfig::default()
            },
            IngestConfig::default(),
        ));
        router(Arc::new(AppState { store, aggregator }))
    }

    async fn create_test_app() -> (Router, Arc<Database>) {
        let db = Database::new("sqlite::memory:").await.unwrap();
        db.initialize().await.unwrap();
        let db = Arc::new(db);
        (create_app(db.clone()), db)
    }

    async fn setup_test_data(db: &Database) {
        let configs = vec![
            SourceConfig {
                name: Some("Test Feed 1".to_string()),
                url: "https://feed1.com/rss".to_string(),
                handle: Some("@feed1".to_string()),
                active: true,
            },
            SourceConfig {
                name: Some("Test Feed 2".to_string()),
                url: "https://feed2.com/rss".to_string(),
                handle: None,
                active: false,
            },
        ];
        db.sync_sources(&configs).await.unwrap();

        // 20 items on the first source, 5 on the second
        let sources = db.all_sources().await.unwrap();
        let mut items = Vec::new();
        for (source, count) in sources.iter().zip([20i64, 5]) {
            for i in 1..=count {
                let title = format!("{} Article {}", source.name, i);
                let link = format!("https://article{}.com/{}", source.id, i);
                items.push(FeedItem {
                    fingerprint: fingerprint(&title, &link, source.id),
                    title,
                    link,
                    summary: String::new(),
                    published_at: Utc::now() - chrono::Duration::hours(count - i),
                    source_id: source.id,
                    source_name: source.name.clone(),
                });
            }
        }
        db.insert_items(&items).await.unwrap();
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    mod health_tests {
        use super::*;

        #[tokio::test]
        async fn test_health_endpoint() {
            let (app, _db) = create_test_app().await;

            let response = app
                .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::OK);

            let body = response.into_body().collect().await.unwrap().to_bytes();
            assert_eq!(&body[..], b"OK");
        }
    }

    mod items_tests {
        use super::*;

        #[tokio::test]
        async fn test_items_empty_store() {
            let (app, _db) = create_test_app().await;

            let (status, body) = get_json(app, "/items").await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["items"].as_array().unwrap().len(), 0);
            assert_eq!(body["pagination"]["total"], 0);
            assert_eq!(body["pagination"]["hasMore"], false);
            assert!(body.get("error").is_none());
        }

        #[tokio::test]
        async fn test_items_default_page() {
            let (app, db) = create_test_app().await;
            setup_test_data(&db).await;

            let (status, body) = get_json(app, "/items").await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["items"].as_array().unwrap().len(), 20);
            assert_eq!(body["pagination"]["limit"], 20);
            assert_eq!(body["pagination"]["total"], 25);
            assert_eq!(body["pagination"]["hasMore"], true);
            assert!(body["timestamp"].is_string());
        }

        #[tokio::test]
        async fn test_items_fields_are_camel_case() {
            let (app, db) = create_test_app().await;
            setup_test_data(&db).await;

            let (_, body) = get_json(app, "/items?limit=1&source=Test%20Feed%201").await;
            let item = &body["items"][0];
            assert_eq!(item["title"], "Test Feed 1 Article 20");
            assert_eq!(item["source"], "Test Feed 1");
            assert_eq!(item["sourceHandle"], "@feed1");
            assert!(item["publishedAt"].is_string());
            assert_eq!(item["id"].as_str().unwrap().len(), 64);
        }

        #[tokio::test]
        async fn test_items_source_filter() {
            let (app, db) = create_test_app().await;
            setup_test_data(&db).await;

            let (_, body) = get_json(app, "/items?source=Test%20Feed%202&limit=50").await;
            assert_eq!(body["pagination"]["total"], 5);
            let items = body["items"].as_array().unwrap();
            assert_eq!(items.len(), 5);
            assert!(items.iter().all(|i| i["source"] == "Test Feed 2"));
            assert!(items[0].get("sourceHandle").is_none());
        }

        #[tokio::test]
        async fn test_items_limit_is_clamped() {
            let (app, db) = create_test_app().await;
            setup_test_data(&db).await;

            let (_, body) = get_json(app.clone(), "/items?limit=500").await;
            assert_eq!(body["pagination"]["limit"], 100);
            assert_eq!(body["items"].as_array().unwrap().len(), 25);

            let (_, body) = get_json(app, "/items?limit=0&offset=-4").await;
            assert_eq!(body["pagination"]["limit"], 1);
            assert_eq!(body["pagination"]["offset"], 0);
        }

        #[tokio::test]
        async fn test_items_maximal_offset() {
            let (app, db) = create_test_app().await;
            setup_test_data(&db).await;

            let (status, body) = get_json(app, "/items?offset=9223372036854775807").await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["pagination"]["offset"], i64::MAX);
            assert_eq!(body["pagination"]["hasMore"], false);
            assert!(body["items"].as_array().unwrap().is_empty());
        }

        #[tokio::test]
        async fn test_items_unparsable_params_use_defaults() {
            let (app, db) = create_test_app().await;
            setup_test_data(&db).await;

            let (status, body) = get_json(app, "/items?limit=lots&offset=").await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["pagination"]["limit"], 20);
            assert_eq!(body["pagination"]["offset"], 0);
        }

        #[tokio::test]
        async fn test_items_store_failure_degrades() {
            let app = create_app(Arc::new(BrokenStore));

            let (status, body) = get_json(app, "/items?limit=5").await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["items"].as_array().unwrap().len(), 0);
            assert_eq!(body["pagination"]["total"], 0);
            assert_eq!(body["error"], "store offline");
        }
    }

    mod refresh_tests {
        use super::*;

        #[tokio::test]
        async fn test_refresh_endpoint() {
            let (app, db) = create_test_app().await;
            setup_test_data(&db).await;

            let response = app
                .oneshot(
                    Request::builder()
                        .method("POST")
                        .uri("/refresh")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::OK);

            let body = response.into_body().collect().await.unwrap().to_bytes();
            let body: Value = serde_json::from_slice(&body).unwrap();
            assert_eq!(body["success"], true);
            // only the active source is fetched, and it fails
            assert_eq!(body["sourcesProcessed"], 1);
            assert_eq!(body["itemsProcessed"], 0);
            assert_eq!(body["itemsInserted"], 0);
        }

        #[tokio::test]
        async fn test_refresh_reports_store_failure() {
            let app = create_app(Arc::new(BrokenStore));

            let response = app
                .oneshot(
                    Request::builder()
                        .method("POST")
                        .uri("/refresh")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
            let body = response.into_body().collect().await.unwrap().to_bytes();
            let body: Value = serde_json::from_slice(&body).unwrap();
            assert_eq!(body["success"], false);
            assert_eq!(body["error"], "store offline");
        }

        #[tokio::test]
        async fn test_refresh_status_endpoint() {
            let (app, _db) = create_test_app().await;

            let (status, body) = get_json(app, "/refresh/status").await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["refreshing"], false);
        }
    }

    mod sources_tests {
        use super::*;

        #[tokio::test]
        async fn test_sources_lists_inactive_too() {
            let (app, db) = create_test_app().await;
            setup_test_data(&db).await;

            let (status, body) = get_json(app, "/sources").await;
            assert_eq!(status, StatusCode::OK);
            let sources = body["sources"].as_array().unwrap();
            assert_eq!(sources.len(), 2);
            assert_eq!(sources[0]["feedUrl"], "https://feed1.com/rss");
            assert_eq!(sources[0]["isActive"], true);
            assert_eq!(sources[1]["isActive"], false);
            assert!(sources[1].get("lastFetchedAt").is_none());
        }

        #[tokio::test]
        async fn test_sources_store_failure_is_500() {
            let app = create_app(Arc::new(BrokenStore));

            let (status, body) = get_json(app, "/sources").await;
            assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
            assert_eq!(body["error"], "store offline");
        }

        #[tokio::test]
        async fn test_demo_store_serves_items() {
            let store = MemoryStore::with_demo_data().await.unwrap();
            let app = create_app(Arc::new(store));

            let (_, body) = get_json(app, "/items?limit=3").await;
            assert_eq!(body["items"].as_array().unwrap().len(), 3);
            assert_eq!(body["pagination"]["total"], 6);
        }
    }

    mod list_items_tests {
        use super::*;

        #[tokio::test]
        async fn test_page_length_matches_arithmetic() {
            let (_app, db) = create_test_app().await;
            setup_test_data(&db).await;

            for (limit, offset) in [(10, 0), (10, 20), (10, 30), (7, 21)] {
                let page = list_items(&*db, limit, offset, None).await.unwrap();
                let expected = limit.min((25 - offset).max(0));
                assert_eq!(page.items.len() as i64, expected);
                assert_eq!(page.pagination.has_more, offset + limit < 25);
            }
        }

        #[tokio::test]
        async fn test_pages_are_non_increasing() {
            let (_app, db) = create_test_app().await;
            setup_test_data(&db).await;

            let page = list_items(&*db, 100, 0, None).await.unwrap();
            assert!(page
                .items
                .windows(2)
                .all(|w| w[0].published_at >= w[1].published_at));
        }

        #[tokio::test]
        async fn test_maximal_offset_has_no_more() {
            let store = MemoryStore::new();
            let page = list_items(&store, 20, i64::MAX, None).await.unwrap();
            assert!(page.items.is_empty());
            assert!(!page.pagination.has_more);

            let (_app, db) = create_test_app().await;
            setup_test_data(&db).await;
            let page = list_items(&*db, 20, i64::MAX, None).await.unwrap();
            assert!(page.items.is_empty());
            assert_eq!(page.pagination.total, 25);
            assert!(!page.pagination.has_more);
        }
    }

    mod items_query_tests {
        use super::*;

        #[test]
        fn test_items_query_defaults() {
            let query: ItemsQuery = serde_urlencoded::from_str("").unwrap();
            assert_eq!(query.limit(), 20);
            assert_eq!(query.offset(), 0);
            assert_eq!(query.source(), None);
        }

        #[test]
        fn test_items_query_with_values() {
            let query: ItemsQuery =
                serde_urlencoded::from_str("limit=10&offset=30&source=DataBreaches.net").unwrap();
            assert_eq!(query.limit(), 10);
            assert_eq!(query.offset(), 30);
            assert_eq!(query.source(), Some("DataBreaches.net"));
        }

        #[test]
        fn test_items_query_empty_source_is_no_filter() {
            let query: ItemsQuery = serde_urlencoded::from_str("source=").unwrap();
            assert_eq!(query.source(), None);
        }
    }
}
