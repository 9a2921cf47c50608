//! Provider client trait and implementations for bibliographic search
//! services. Each implementation owns its own request shape, response field
//! mapping, and rate-limit signalling.

pub mod crossref;
pub mod mock;
pub mod openalex;
pub mod semantic_scholar;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use thiserror::Error;

use crate::ProviderCandidate;

/// Error taxonomy for provider calls.
///
/// `RateLimited` and `Transient` are locally retryable; `NotFound` and
/// `Malformed` are not. None of these ever reaches the resolver's caller —
/// the resolver demotes them all to "this provider yielded nothing".
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("rate limited (429)")]
    RateLimited { retry_after: Option<Duration> },
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("provider returned no results")]
    NotFound,
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited { .. } | ProviderError::Transient(_)
        )
    }
}

pub type SearchResult = Result<Vec<ProviderCandidate>, ProviderError>;

/// A bibliographic search service that can be queried by title.
pub trait ProviderClient: Send + Sync {
    /// The canonical name of this provider (e.g., "Semantic Scholar").
    fn name(&self) -> &str;

    /// Search the provider for works matching the given title, mapping the
    /// response into [`ProviderCandidate`]s in the provider's own ranking
    /// order. An empty list is a valid outcome, distinct from errors only in
    /// that it carries no retry signal.
    fn search<'a>(
        &'a self,
        title: &'a str,
        client: &'a reqwest::Client,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = SearchResult> + Send + 'a>>;
}

/// Map a reqwest transport error into the taxonomy. Timeouts and connection
/// failures are transient; body-decode failures are malformed.
pub(crate) fn classify_transport(e: reqwest::Error) -> ProviderError {
    if e.is_decode() {
        ProviderError::Malformed(e.to_string())
    } else {
        ProviderError::Transient(e.to_string())
    }
}

/// Classify a non-success HTTP status. 429 carries the parsed Retry-After
/// signal; 5xx is transient; 404 means the provider has nothing; remaining
/// client errors indicate a request the provider could not interpret.
pub(crate) fn check_status(resp: &reqwest::Response) -> Result<(), ProviderError> {
    let status = resp.status();
    if status.as_u16() == 429 {
        let retry_after = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        return Err(ProviderError::RateLimited { retry_after });
    }
    if status.as_u16() == 404 {
        return Err(ProviderError::NotFound);
    }
    if status.is_server_error() {
        return Err(ProviderError::Transient(format!("HTTP {}", status)));
    }
    if !status.is_success() {
        return Err(ProviderError::Malformed(format!("HTTP {}", status)));
    }
    Ok(())
}

/// Parse a Retry-After header value (seconds or HTTP-date).
pub(crate) fn parse_retry_after(value: &str) -> Option<Duration> {
    if let Ok(secs) = value.trim().parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    // HTTP-date form (e.g. "Wed, 21 Oct 2015 07:28:00 GMT") — use a
    // conservative fallback rather than parsing the date.
    if value.contains(',') || value.contains("GMT") {
        return Some(Duration::from_secs(5));
    }
    None
}
