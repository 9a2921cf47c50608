use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

pub mod align;
pub mod cache;
pub mod config_file;
pub mod enrich;
pub mod matching;
pub mod providers;
pub mod rate_limit;
pub mod resolver;
pub mod retry;

// Re-export for convenience
pub use align::AlignmentPolicy;
pub use cache::ResultCache;
pub use enrich::{EnrichedRecord, ReferenceRecord, enrich_references};
pub use matching::{normalize_title, query_words, similarity};
pub use providers::{ProviderClient, ProviderError};
pub use rate_limit::ProviderLimiters;
pub use resolver::{ResolutionContext, resolve_batch};
pub use retry::{RetryPolicy, with_retry};

/// One reference to resolve, as handed over by the extraction stage.
///
/// `extracted_title` is best-effort LLM output and may be empty or noisy;
/// `known_year` and `known_authors` are weak priors used only to corroborate
/// candidate matches, never to build queries.
#[derive(Debug, Clone)]
pub struct ReferenceQuery {
    pub raw_citation: String,
    pub extracted_title: String,
    pub known_year: Option<i32>,
    pub known_authors: Vec<String>,
}

/// One search hit from one provider, before validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderCandidate {
    pub title: String,
    pub abstract_text: Option<String>,
    pub year: Option<i32>,
    pub authors: Vec<String>,
    pub doi: Option<String>,
    pub citation_count: u64,
    pub provider: String,
}

/// The outcome of resolving a single reference.
///
/// `Unresolved` is a normal, cacheable result — callers never see provider
/// or transport errors. A `Found` value's `source` is always the name of the
/// provider whose candidate was accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ResolvedMetadata {
    Found {
        title: String,
        #[serde(rename = "abstract")]
        abstract_text: Option<String>,
        year: Option<i32>,
        authors: Vec<String>,
        doi: Option<String>,
        citation_count: u64,
        source: String,
    },
    Unresolved,
}

impl ResolvedMetadata {
    pub fn is_found(&self) -> bool {
        matches!(self, ResolvedMetadata::Found { .. })
    }

    /// The accepting provider's name, if resolved.
    pub fn source(&self) -> Option<&str> {
        match self {
            ResolvedMetadata::Found { source, .. } => Some(source),
            ResolvedMetadata::Unresolved => None,
        }
    }
}

/// Progress events emitted during batch resolution.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    Resolving {
        index: usize,
        total: usize,
        title: String,
    },
    Resolved {
        index: usize,
        total: usize,
        title: String,
        result: Box<ResolvedMetadata>,
    },
}

/// Configuration for the resolution engine.
#[derive(Clone)]
pub struct Config {
    pub s2_api_key: Option<String>,
    pub openalex_key: Option<String>,
    pub crossref_mailto: Option<String>,
    pub disabled_providers: Vec<String>,
    pub num_workers: usize,
    pub request_timeout_secs: u64,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    /// Loose similarity acceptance threshold; candidates above it still need
    /// year/author corroboration. Exact matches (1.0) bypass it entirely.
    pub loose_threshold: f64,
    pub year_tolerance: i32,
    /// Path to the persistent SQLite cache database (optional).
    /// When unset, the cache is in-memory only.
    pub cache_path: Option<PathBuf>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("s2_api_key", &self.s2_api_key.as_ref().map(|_| "***"))
            .field("openalex_key", &self.openalex_key.as_ref().map(|_| "***"))
            .field(
                "crossref_mailto",
                &self.crossref_mailto.as_ref().map(|_| "***"),
            )
            .field("disabled_providers", &self.disabled_providers)
            .field("num_workers", &self.num_workers)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("max_attempts", &self.max_attempts)
            .field("base_delay_ms", &self.base_delay_ms)
            .field("loose_threshold", &self.loose_threshold)
            .field("year_tolerance", &self.year_tolerance)
            .field("cache_path", &self.cache_path)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            s2_api_key: None,
            openalex_key: None,
            crossref_mailto: None,
            disabled_providers: vec![],
            num_workers: 4,
            request_timeout_secs: 20,
            max_attempts: 3,
            base_delay_ms: 500,
            loose_threshold: 0.5,
            year_tolerance: 1,
            cache_path: None,
        }
    }
}

/// Build a [`ResultCache`] from configuration.
///
/// If `cache_path` is set, opens a persistent SQLite-backed cache.
/// Otherwise, returns an in-memory-only cache.
pub fn build_result_cache(cache_path: Option<&Path>) -> Arc<ResultCache> {
    if let Some(path) = cache_path {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match ResultCache::open(path) {
            Ok(cache) => {
                tracing::info!(path = %path.display(), "opened persistent cache");
                return Arc::new(cache);
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to open cache, falling back to in-memory");
            }
        }
    }
    Arc::new(ResultCache::new())
}

/// Resolve a batch of references against the configured providers.
///
/// Each reference is resolved independently through a bounded worker pool;
/// results come back in input order. Progress events are emitted via the
/// callback. The operation can be cancelled via the CancellationToken;
/// cancelled references yield `Unresolved` without caching.
pub async fn resolve_references(
    queries: Vec<ReferenceQuery>,
    config: Config,
    progress: impl Fn(ProgressEvent) + Send + Sync + 'static,
    cancel: CancellationToken,
) -> Vec<ResolvedMetadata> {
    let ctx = Arc::new(ResolutionContext::new(&config));
    resolver::resolve_batch(ctx, queries, progress, cancel).await
}

#[cfg(test)]
mod build_cache_tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    static COUNTER: AtomicU32 = AtomicU32::new(0);

    fn temp_path() -> PathBuf {
        let id = COUNTER.fetch_add(1, Ordering::SeqCst);
        std::env::temp_dir()
            .join(format!(
                "refnavi_build_cache_test_{}_{}",
                std::process::id(),
                id,
            ))
            .join("cache.db")
    }

    #[test]
    fn none_path_returns_in_memory() {
        let cache = build_result_cache(None);
        assert!(!cache.has_persistence());
    }

    #[test]
    fn valid_path_returns_persistent() {
        let path = temp_path();
        let _ = std::fs::remove_file(&path);

        let cache = build_result_cache(Some(&path));
        assert!(cache.has_persistence());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn creates_parent_directory() {
        let path = temp_path();
        if let Some(parent) = path.parent() {
            let _ = std::fs::remove_dir_all(parent);
        }

        let cache = build_result_cache(Some(&path));
        assert!(cache.has_persistence());
        assert!(path.parent().unwrap().exists());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn config_debug_masks_secrets() {
        let config = Config {
            s2_api_key: Some("secret-key".into()),
            ..Default::default()
        };
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("secret-key"));
    }
}
