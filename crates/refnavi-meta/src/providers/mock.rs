//! Mock provider for testing.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::{ProviderClient, ProviderError, SearchResult};
use crate::ProviderCandidate;

/// A configurable mock response for [`MockProvider`].
#[derive(Clone, Debug)]
#[allow(dead_code)]
pub enum MockResponse {
    /// Simulate a successful search with the given candidates.
    Candidates(Vec<ProviderCandidate>),
    /// Simulate a search that returned zero hits.
    Empty,
    /// Simulate a 429 rate-limit response.
    RateLimited { retry_after: Option<Duration> },
    /// Simulate a transient transport failure.
    Transient(String),
    /// Simulate an unparseable response.
    Malformed(String),
}

/// A hand-rolled mock implementing [`ProviderClient`] for tests.
///
/// Supports:
/// - A fixed response (used for every call), **or**
/// - A sequence of responses (one per call, repeating the last if exhausted).
/// - Optional per-call latency.
/// - Call counting via [`call_count()`](MockProvider::call_count).
pub struct MockProvider {
    name: &'static str,
    /// If non-empty, each call pops the next response.
    responses: Mutex<Vec<MockResponse>>,
    /// Fallback when the sequence is empty (or single-response mode).
    fallback: MockResponse,
    delay: Option<Duration>,
    call_count: AtomicUsize,
}

impl MockProvider {
    /// Create a mock that always returns `response`.
    pub fn new(name: &'static str, response: MockResponse) -> Self {
        Self {
            name,
            responses: Mutex::new(Vec::new()),
            fallback: response,
            delay: None,
            call_count: AtomicUsize::new(0),
        }
    }

    /// Create a mock that returns responses in order, repeating the last one.
    #[allow(dead_code)]
    pub fn with_sequence(name: &'static str, mut responses: Vec<MockResponse>) -> Self {
        assert!(
            !responses.is_empty(),
            "sequence must have at least one response"
        );
        // Reverse so we can pop() from the front cheaply.
        responses.reverse();
        let fallback = responses.first().cloned().unwrap();
        Self {
            name,
            responses: Mutex::new(responses),
            fallback,
            delay: None,
            call_count: AtomicUsize::new(0),
        }
    }

    /// Set simulated network latency per call.
    #[allow(dead_code)]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// How many times `search()` has been called.
    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    fn next_response(&self) -> MockResponse {
        let mut seq = self.responses.lock().unwrap();
        if let Some(resp) = seq.pop() {
            resp
        } else {
            self.fallback.clone()
        }
    }
}

/// Build a candidate with the fields the resolver cares about; the rest stay
/// empty.
#[allow(dead_code)]
pub fn candidate(
    provider: &str,
    title: &str,
    year: Option<i32>,
    authors: &[&str],
) -> ProviderCandidate {
    ProviderCandidate {
        title: title.to_string(),
        abstract_text: None,
        year,
        authors: authors.iter().map(|a| a.to_string()).collect(),
        doi: None,
        citation_count: 0,
        provider: provider.to_string(),
    }
}

impl ProviderClient for MockProvider {
    fn name(&self) -> &str {
        self.name
    }

    fn search<'a>(
        &'a self,
        _title: &'a str,
        _client: &'a reqwest::Client,
        _timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = SearchResult> + Send + 'a>> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        let response = self.next_response();
        let delay = self.delay;

        Box::pin(async move {
            if let Some(d) = delay {
                tokio::time::sleep(d).await;
            }

            match response {
                MockResponse::Candidates(candidates) => Ok(candidates),
                MockResponse::Empty => Ok(vec![]),
                MockResponse::RateLimited { retry_after } => {
                    Err(ProviderError::RateLimited { retry_after })
                }
                MockResponse::Transient(msg) => Err(ProviderError::Transient(msg)),
                MockResponse::Malformed(msg) => Err(ProviderError::Malformed(msg)),
            }
        })
    }
}
