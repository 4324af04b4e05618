//! Collector transport
//!
//! [`EventsTransport`] is the seam the tracker posts batches through. It only
//! reports the HTTP status; deciding what counts as delivered is left to the
//! tracker. [`HttpTransport`] is the reqwest implementation.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use std::time::Duration;
use tracing::trace;

use crate::config::{CollectorConfig, LibraryConfig};
use crate::errors::{EventsError, EventsResult};
use crate::flush::FlushOptions;

pub const PLATFORM_HEADER: &str = "x-platform";
pub const VERSION_HEADER: &str = "x-version";
pub const PLATFORM: &str = "web";

/// Sends one request body to the collector
#[async_trait]
pub trait EventsTransport: Send + Sync {
    /// POST `body` and return the response status
    async fn post_events(&self, body: Bytes, options: FlushOptions) -> EventsResult<u16>;

    /// Endpoint used in error reports
    fn endpoint(&self) -> &str;
}

/// reqwest-backed collector client
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    headers: HeaderMap,
    teardown_timeout: Duration,
}

impl HttpTransport {
    pub fn new(collector: &CollectorConfig, library: &LibraryConfig) -> EventsResult<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| EventsError::Configuration(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: collector.events_url(),
            headers: build_headers(collector, library)?,
            teardown_timeout: collector.teardown_timeout(),
        })
    }
}

fn header_value(name: &str, value: &str) -> EventsResult<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| EventsError::Configuration(format!("Invalid value for header {}: {}", name, e)))
}

fn build_headers(collector: &CollectorConfig, library: &LibraryConfig) -> EventsResult<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(
        HeaderName::from_static(PLATFORM_HEADER),
        HeaderValue::from_static(PLATFORM),
    );
    headers.insert(
        HeaderName::from_static(VERSION_HEADER),
        header_value(VERSION_HEADER, &library.version)?,
    );

    if let Some(api_key) = &collector.api_key {
        headers.insert(
            AUTHORIZATION,
            header_value("authorization", &format!("Bearer {}", api_key))?,
        );
    }

    for (name, value) in &collector.extra_headers {
        let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
            EventsError::Configuration(format!("Invalid header name {}: {}", name, e))
        })?;
        headers.insert(header_name, header_value(name, value)?);
    }

    Ok(headers)
}

#[async_trait]
impl EventsTransport for HttpTransport {
    async fn post_events(&self, body: Bytes, options: FlushOptions) -> EventsResult<u16> {
        trace!(url = %self.url, bytes = body.len(), teardown = options.teardown, "Posting events");

        let mut request = self
            .client
            .post(&self.url)
            .headers(self.headers.clone())
            .body(body);

        // Shutdown must not hang on a slow collector
        if options.teardown {
            request = request.timeout(self.teardown_timeout);
        }

        let response = request.send().await.map_err(|e| EventsError::Transport {
            endpoint: self.url.clone(),
            message: e.to_string(),
        })?;

        Ok(response.status().as_u16())
    }

    fn endpoint(&self) -> &str {
        &self.url
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn collector(base: String) -> CollectorConfig {
        CollectorConfig {
            endpoint_base: base,
            api_key: Some("rcb_test_key".to_string()),
            teardown_timeout_ms: 200,
            extra_headers: BTreeMap::from([("X-Custom".to_string(), "yes".to_string())]),
        }
    }

    fn library() -> LibraryConfig {
        LibraryConfig {
            name: "purchases-js".to_string(),
            version: "1.2.3".to_string(),
        }
    }

    #[tokio::test]
    async fn test_posts_with_decorated_headers() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/events")
            .match_header("content-type", "application/json")
            .match_header("authorization", "Bearer rcb_test_key")
            .match_header("x-platform", "web")
            .match_header("x-version", "1.2.3")
            .match_header("x-custom", "yes")
            .match_body(r#"{"events":[]}"#)
            .with_status(201)
            .expect(1)
            .create_async()
            .await;

        let transport = HttpTransport::new(&collector(server.url()), &library()).unwrap();
        let status = transport
            .post_events(Bytes::from_static(br#"{"events":[]}"#), FlushOptions::default())
            .await
            .unwrap();

        assert_eq!(status, 201);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_reports_error_statuses() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/events")
            .with_status(503)
            .create_async()
            .await;

        let transport = HttpTransport::new(&collector(server.url()), &library()).unwrap();
        let status = transport
            .post_events(Bytes::from_static(b"{}"), FlushOptions::default())
            .await
            .unwrap();
        assert_eq!(status, 503);
    }

    #[tokio::test]
    async fn test_unreachable_collector_is_transport_error() {
        // Port 9 (discard) is not listening on test hosts
        let transport =
            HttpTransport::new(&collector("http://127.0.0.1:9".to_string()), &library()).unwrap();
        let err = transport
            .post_events(Bytes::from_static(b"{}"), FlushOptions::teardown())
            .await
            .unwrap_err();

        assert!(matches!(err, EventsError::Transport { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_invalid_extra_header_is_rejected() {
        let mut config = collector("http://localhost".to_string());
        config
            .extra_headers
            .insert("bad header".to_string(), "x".to_string());

        let err = HttpTransport::new(&config, &library()).unwrap_err();
        assert!(matches!(err, EventsError::Configuration(_)));
    }
}
