//! Test Utilities Module
//!
//! In-process collector double for deterministic tracker tests. Responses are
//! scripted per request and every request body is recorded.
//!
//! Only compiled when running tests or when the `test_utils` feature is
//! enabled.

#![cfg(any(test, feature = "test_utils"))]

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;

use crate::errors::{EventsError, EventsResult};
use crate::flush::FlushOptions;
use crate::transport::EventsTransport;

const MOCK_ENDPOINT: &str = "mock://collector/v1/events";

/// Scripted outcome of one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockResponse {
    Status(u16),
    /// Request never reaches the collector
    Unreachable,
}

/// A request as the collector saw it
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub body: Value,
    /// Raw body length in bytes
    pub size: usize,
    pub options: FlushOptions,
    pub response: MockResponse,
}

impl RecordedRequest {
    pub fn events(&self) -> Vec<Value> {
        self.body["events"].as_array().cloned().unwrap_or_default()
    }

    pub fn event_names(&self) -> Vec<String> {
        self.events()
            .iter()
            .filter_map(|e| e["event_name"].as_str().map(str::to_string))
            .collect()
    }

    pub fn event_ids(&self) -> Vec<String> {
        self.events()
            .iter()
            .filter_map(|e| e["id"].as_str().map(str::to_string))
            .collect()
    }
}

/// Mock collector transport
///
/// Answers 200 once the script runs out. A request can be held in flight
/// with [`MockTransport::hold_next`] until the returned `Notify` fires.
#[derive(Default)]
pub struct MockTransport {
    script: Mutex<VecDeque<MockResponse>>,
    requests: Mutex<Vec<RecordedRequest>>,
    hold: Mutex<Option<Arc<Notify>>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Transport answering `responses` in order, then 200
    pub fn scripted(responses: impl IntoIterator<Item = MockResponse>) -> Arc<Self> {
        let transport = Self::default();
        transport.script.lock().extend(responses);
        Arc::new(transport)
    }

    pub fn push_response(&self, response: MockResponse) {
        self.script.lock().push_back(response);
    }

    /// Keep the next request in flight until the returned handle is notified
    pub fn hold_next(&self) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        *self.hold.lock() = Some(notify.clone());
        notify
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Event names of every request the collector acknowledged, in order
    pub fn delivered_event_names(&self) -> Vec<String> {
        self.requests
            .lock()
            .iter()
            .filter(|r| matches!(r.response, MockResponse::Status(200 | 201)))
            .flat_map(RecordedRequest::event_names)
            .collect()
    }
}

#[async_trait]
impl EventsTransport for MockTransport {
    async fn post_events(&self, body: Bytes, options: FlushOptions) -> EventsResult<u16> {
        let response = self
            .script
            .lock()
            .pop_front()
            .unwrap_or(MockResponse::Status(200));
        let hold = self.hold.lock().take();

        if let Some(notify) = hold {
            notify.notified().await;
        }

        self.requests.lock().push(RecordedRequest {
            body: serde_json::from_slice(&body)?,
            size: body.len(),
            options,
            response,
        });

        match response {
            MockResponse::Status(status) => Ok(status),
            MockResponse::Unreachable => Err(EventsError::Transport {
                endpoint: MOCK_ENDPOINT.to_string(),
                message: "connection refused".to_string(),
            }),
        }
    }

    fn endpoint(&self) -> &str {
        MOCK_ENDPOINT
    }
}
