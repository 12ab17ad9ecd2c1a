use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::Client;
use thiserror::Error;
use tracing::debug;

use crate::config::FetchConfig;
use crate::model::FeedSource;

const FEED_ACCEPT: &str =
    "application/rss+xml, application/atom+xml, application/xml, text/xml;q=0.9, */*;q=0.8";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("server responded with HTTP {0}")]
    HttpStatus(u16),
    #[error("request timed out")]
    Timeout,
    #[error("response body exceeds {0} bytes")]
    TooLarge(usize),
    #[error("response body too small ({0} bytes)")]
    TooSmall(usize),
}

/// Retrieves the raw document behind a source.
#[async_trait]
pub trait FeedFetcher: Send + Sync {
    async fn fetch(&self, source: &FeedSource) -> Result<String, FetchError>;
}

pub struct HttpFetcher {
    client: Client,
    config: FetchConfig,
}

impl HttpFetcher {
    pub fn new(config: &FetchConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(FEED_ACCEPT));

        let client = Client::builder()
            .timeout(config.timeout())
            .user_agent(config.user_agent.as_str())
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    async fn fetch_body(&self, url: &str) -> Result<String, FetchError> {
        let mut response = self.client.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }

        let max = self.config.max_body_bytes;
        if response.content_length().is_some_and(|len| len as usize > max) {
            return Err(FetchError::TooLarge(max));
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if body.len() + chunk.len() > max {
                return Err(FetchError::TooLarge(max));
            }
            body.extend_from_slice(&chunk);
        }

        if body.len() < self.config.min_body_bytes {
            return Err(FetchError::TooSmall(body.len()));
        }

        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}

#[async_trait]
impl FeedFetcher for HttpFetcher {
    async fn fetch(&self, source: &FeedSource) -> Result<String, FetchError> {
        debug!(source = %source.name, url = %source.feed_url, "fetching feed");

        match tokio::time::timeout(self.config.timeout(), self.fetch_body(&source.feed_url)).await
        {
            Ok(Err(FetchError::Network(e))) if e.is_timeout() => Err(FetchError::Timeout),
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SAMPLE_RSS: &str = r#"<?xml version="1.0"?>
        <rss version="2.0"><channel><title>Sample</title>
        <item><title>One</title><link>https://example.com/1</link></item>
        </channel></rss>"#;

    fn test_source(url: String) -> FeedSource {
        FeedSource {
            id: 1,
            name: "Test".to_string(),
            feed_url: url,
            source_handle: None,
            is_active: true,
            auto_named: false,
            last_fetched_at: None,
            last_error: None,
        }
    }

    fn test_config() -> FetchConfig {
        FetchConfig {
            timeout_secs: 1,
            ..FetchConfig::default()
        }
    }

    mod http_fetcher_tests {
        use super::*;

        #[tokio::test]
        async fn test_fetch_success() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/rss"))
                .and(header("accept", FEED_ACCEPT))
                .respond_with(ResponseTemplate::new(200).set_body_string(SAMPLE_RSS))
                .mount(&server)
                .await;

            let fetcher = HttpFetcher::new(&test_config()).unwrap();
            let body = fetcher
                .fetch(&test_source(format!("{}/rss", server.uri())))
                .await
                .unwrap();
            assert!(body.contains("<title>One</title>"));
        }

        #[tokio::test]
        async fn test_fetch_http_error() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/missing"))
                .respond_with(ResponseTemplate::new(404))
                .mount(&server)
                .await;

            let fetcher = HttpFetcher::new(&test_config()).unwrap();
            let result = fetcher
                .fetch(&test_source(format!("{}/missing", server.uri())))
                .await;
            assert!(matches!(result, Err(FetchError::HttpStatus(404))));
        }

        #[tokio::test]
        async fn test_fetch_timeout() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .respond_with(
                    ResponseTemplate::new(200)
                        .set_body_string(SAMPLE_RSS)
                        .set_delay(Duration::from_secs(3)),
                )
                .mount(&server)
                .await;

            let fetcher = HttpFetcher::new(&test_config()).unwrap();
            let result = fetcher.fetch(&test_source(server.uri())).await;
            assert!(matches!(result, Err(FetchError::Timeout)));
        }

        #[tokio::test]
        async fn test_fetch_rejects_tiny_body() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .respond_with(ResponseTemplate::new(200).set_body_string("<html/>"))
                .mount(&server)
                .await;

            let fetcher = HttpFetcher::new(&test_config()).unwrap();
            let result = fetcher.fetch(&test_source(server.uri())).await;
            assert!(matches!(result, Err(FetchError::TooSmall(7))));
        }

        #[tokio::test]
        async fn test_fetch_rejects_oversized_body() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(4096)))
                .mount(&server)
                .await;

            let config = FetchConfig {
                max_body_bytes: 1024,
                ..test_config()
            };
            let fetcher = HttpFetcher::new(&config).unwrap();
            let result = fetcher.fetch(&test_source(server.uri())).await;
            assert!(matches!(result, Err(FetchError::TooLarge(1024))));
        }

        #[tokio::test]
        async fn test_fetch_decodes_invalid_utf8_lossily() {
            let server = MockServer::start().await;
            let mut body = SAMPLE_RSS.as_bytes().to_vec();
            body.extend_from_slice(&[0xFF, 0xFE]);
            Mock::given(method("GET"))
                .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
                .mount(&server)
                .await;

            let fetcher = HttpFetcher::new(&test_config()).unwrap();
            let text = fetcher.fetch(&test_source(server.uri())).await.unwrap();
            assert!(text.ends_with('\u{FFFD}'));
        }

        #[tokio::test]
        async fn test_fetch_connection_refused() {
            let fetcher = HttpFetcher::new(&test_config()).unwrap();
            let result = fetcher
                .fetch(&test_source("http://127.0.0.1:1/rss".to_string()))
                .await;
            assert!(matches!(
                result,
                Err(FetchError::Network(_)) | Err(FetchError::Timeout)
            ));
        }
    }

    mod error_display_tests {
        use super::*;

        #[test]
        fn test_error_messages() {
            assert_eq!(FetchError::HttpStatus(503).to_string(), "server responded with HTTP 503");
            assert_eq!(FetchError::Timeout.to_string(), "request timed out");
            assert_eq!(
                FetchError::TooSmall(12).to_string(),
                "response body too small (12 bytes)"
            );
        }
    }
}
