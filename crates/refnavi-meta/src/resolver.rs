//! Per-reference resolution state machine and batch worker pool.
//!
//! One resolution walks `CacheLookup → ProviderFanout(i) → Validate →
//! Accepted | NextProvider | Exhausted`. Provider fan-out is strictly
//! sequential by priority; an acceptance short-circuits the remaining
//! providers. Errors and empty candidate lists are treated identically —
//! fail open to the next provider. Both terminal states cache their result,
//! so a reference that failed everywhere is never looked up twice.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::OnceCell;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::align::{self, AlignmentPolicy};
use crate::cache::ResultCache;
use crate::matching::{normalize_title, similarity};
use crate::providers::crossref::CrossRef;
use crate::providers::openalex::OpenAlex;
use crate::providers::semantic_scholar::SemanticScholar;
use crate::providers::{ProviderClient, ProviderError};
use crate::rate_limit::ProviderLimiters;
use crate::retry::{RetryPolicy, with_retry};
use crate::{
    Config, ProgressEvent, ProviderCandidate, ReferenceQuery, ResolvedMetadata,
    build_result_cache,
};

/// Everything one resolution needs, held explicitly — no ambient globals.
/// Cheap to share across the worker pool behind an `Arc`.
pub struct ResolutionContext {
    providers: Vec<Arc<dyn ProviderClient>>,
    cache: Arc<ResultCache>,
    limiters: Arc<ProviderLimiters>,
    client: reqwest::Client,
    policy: AlignmentPolicy,
    retry: RetryPolicy,
    timeout: Duration,
    num_workers: usize,
    /// Single-flight table: concurrent resolutions of the same normalized
    /// key share one cell, so exactly one performs the provider fan-out.
    inflight: DashMap<String, Arc<OnceCell<ResolvedMetadata>>>,
}

impl ResolutionContext {
    /// Build a context with the configured provider stack, in priority order.
    pub fn new(config: &Config) -> Self {
        Self::with_providers(config, build_provider_list(config))
    }

    /// Build a context over a custom provider stack (tests, alternate
    /// deployments). Providers are tried in the order given.
    pub fn with_providers(config: &Config, providers: Vec<Arc<dyn ProviderClient>>) -> Self {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(2)
            .pool_idle_timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            providers,
            cache: build_result_cache(config.cache_path.as_deref()),
            limiters: Arc::new(ProviderLimiters::new(
                config.s2_api_key.is_some(),
                config.crossref_mailto.is_some(),
            )),
            client,
            policy: AlignmentPolicy {
                loose_threshold: config.loose_threshold,
                year_tolerance: config.year_tolerance,
            },
            retry: RetryPolicy {
                max_attempts: config.max_attempts,
                base_delay: Duration::from_millis(config.base_delay_ms),
            },
            timeout: Duration::from_secs(config.request_timeout_secs),
            num_workers: config.num_workers.max(1),
            inflight: DashMap::new(),
        }
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    /// Resolve a single reference. Never fails: the worst outcome is
    /// `Unresolved`, itself a cached, normal result.
    pub async fn resolve(&self, query: &ReferenceQuery) -> ResolvedMetadata {
        let key = normalize_title(&query.extracted_title);
        if key.is_empty() {
            // An empty key would alias every title-less reference onto one
            // cache entry; skip both the cache and the providers.
            tracing::debug!(raw = %query.raw_citation, "no extracted title, skipping");
            return ResolvedMetadata::Unresolved;
        }

        if let Some(hit) = self.cache.get(&key) {
            return hit;
        }

        let cell = {
            let entry = self
                .inflight
                .entry(key.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()));
            Arc::clone(entry.value())
        };

        let key_ref = &key;
        let resolved = cell
            .get_or_init(move || async move {
                // Re-check: another task may have completed and removed its
                // cell between our cache miss and the entry above.
                if let Some(hit) = self.cache.get(key_ref) {
                    return hit;
                }
                let resolved = self.fan_out(query).await;
                self.cache.insert(key_ref, &resolved);
                resolved
            })
            .await
            .clone();

        self.inflight.remove(&key);
        resolved
    }

    /// Try each provider in priority order until one yields a validated
    /// candidate.
    async fn fan_out(&self, query: &ReferenceQuery) -> ResolvedMetadata {
        let query_norm = normalize_title(&query.extracted_title);

        for provider in &self.providers {
            let provider = provider.as_ref();
            let name = provider.name();
            let title = query.extracted_title.as_str();
            let client = &self.client;
            let limiters = &*self.limiters;
            let timeout = self.timeout;

            let outcome = with_retry(self.retry, move || async move {
                limiters.acquire(name).await;
                let result = provider.search(title, client, timeout).await;
                if let Err(ProviderError::RateLimited { .. }) = &result {
                    limiters.on_rate_limited(name);
                }
                result
            })
            .await;

            let candidates = match outcome {
                Ok(candidates) => candidates,
                Err(err) => {
                    tracing::debug!(provider = name, error = %err, "provider yielded nothing");
                    continue;
                }
            };
            if candidates.is_empty() {
                tracing::debug!(provider = name, "no candidates");
                continue;
            }

            let best = best_candidate(&candidates, &query_norm);
            if align::is_aligned(best, query, &self.policy) {
                tracing::debug!(provider = name, title = %best.title, "accepted candidate");
                return found_from(best, name);
            }
            tracing::debug!(provider = name, title = %best.title, "best candidate rejected");
        }

        ResolvedMetadata::Unresolved
    }
}

/// The candidate most similar to the query title. Strictly-greater
/// comparison keeps the provider's own ranking on ties.
fn best_candidate<'a>(candidates: &'a [ProviderCandidate], query_norm: &str) -> &'a ProviderCandidate {
    let mut best = &candidates[0];
    let mut best_score = similarity(&normalize_title(&best.title), query_norm);
    for candidate in &candidates[1..] {
        let score = similarity(&normalize_title(&candidate.title), query_norm);
        if score > best_score {
            best = candidate;
            best_score = score;
        }
    }
    best
}

fn found_from(candidate: &ProviderCandidate, source: &str) -> ResolvedMetadata {
    ResolvedMetadata::Found {
        title: candidate.title.clone(),
        abstract_text: candidate.abstract_text.clone(),
        year: candidate.year,
        authors: candidate.authors.clone(),
        doi: candidate.doi.clone(),
        citation_count: candidate.citation_count,
        source: source.to_string(),
    }
}

/// Build the provider stack based on config, in fixed priority order:
/// broadest coverage first.
fn build_provider_list(config: &Config) -> Vec<Arc<dyn ProviderClient>> {
    let enabled = |name: &str| {
        !config
            .disabled_providers
            .iter()
            .any(|d| d.eq_ignore_ascii_case(name))
    };

    let mut providers: Vec<Arc<dyn ProviderClient>> = Vec::new();
    if enabled("Semantic Scholar") {
        providers.push(Arc::new(SemanticScholar {
            api_key: config.s2_api_key.clone(),
        }));
    }
    if enabled("OpenAlex") {
        providers.push(Arc::new(OpenAlex {
            api_key: config.openalex_key.clone(),
        }));
    }
    if enabled("CrossRef") {
        providers.push(Arc::new(CrossRef {
            mailto: config.crossref_mailto.clone(),
        }));
    }
    providers
}

/// A resolution job submitted to the pool.
struct ResolveJob {
    query: ReferenceQuery,
    index: usize,
    total: usize,
    result_tx: oneshot::Sender<ResolvedMetadata>,
    progress: Arc<dyn Fn(ProgressEvent) + Send + Sync>,
}

/// Resolve a batch through a bounded worker pool.
///
/// Resolutions for distinct keys run in parallel, bounded by the context's
/// worker count — a provider-politeness bound, not a CPU bound. Results come
/// back in input order regardless of completion order. Cancelled references
/// yield `Unresolved` without caching.
pub async fn resolve_batch(
    ctx: Arc<ResolutionContext>,
    queries: Vec<ReferenceQuery>,
    progress: impl Fn(ProgressEvent) + Send + Sync + 'static,
    cancel: CancellationToken,
) -> Vec<ResolvedMetadata> {
    let total = queries.len();
    if total == 0 {
        return vec![];
    }

    let progress: Arc<dyn Fn(ProgressEvent) + Send + Sync> = Arc::new(progress);
    let (job_tx, job_rx) = async_channel::unbounded::<ResolveJob>();

    let mut workers = Vec::with_capacity(ctx.num_workers);
    for _ in 0..ctx.num_workers {
        let rx = job_rx.clone();
        let ctx = Arc::clone(&ctx);
        let cancel = cancel.clone();
        workers.push(tokio::spawn(async move {
            while let Ok(job) = rx.recv().await {
                if cancel.is_cancelled() {
                    let _ = job.result_tx.send(ResolvedMetadata::Unresolved);
                    continue;
                }

                (job.progress)(ProgressEvent::Resolving {
                    index: job.index,
                    total: job.total,
                    title: job.query.extracted_title.clone(),
                });

                let resolved = ctx.resolve(&job.query).await;

                (job.progress)(ProgressEvent::Resolved {
                    index: job.index,
                    total: job.total,
                    title: job.query.extracted_title.clone(),
                    result: Box::new(resolved.clone()),
                });
                let _ = job.result_tx.send(resolved);
            }
        }));
    }
    drop(job_rx);

    let mut receivers = Vec::with_capacity(total);
    for (index, query) in queries.into_iter().enumerate() {
        let (result_tx, result_rx) = oneshot::channel();
        let _ = job_tx
            .send(ResolveJob {
                query,
                index,
                total,
                result_tx,
                progress: Arc::clone(&progress),
            })
            .await;
        receivers.push(result_rx);
    }
    job_tx.close();

    let mut results = Vec::with_capacity(total);
    for rx in receivers {
        results.push(rx.await.unwrap_or(ResolvedMetadata::Unresolved));
    }

    for worker in workers {
        let _ = worker.await;
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::mock::{MockProvider, MockResponse, candidate};
    use std::sync::Mutex;

    fn query(title: &str, year: Option<i32>) -> ReferenceQuery {
        ReferenceQuery {
            raw_citation: format!("[1] {title}."),
            extracted_title: title.to_string(),
            known_year: year,
            known_authors: vec![],
        }
    }

    fn ctx_with(providers: Vec<Arc<dyn ProviderClient>>) -> Arc<ResolutionContext> {
        Arc::new(ResolutionContext::with_providers(
            &Config::default(),
            providers,
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn end_to_end_layer_normalization() {
        let p1 = Arc::new(MockProvider::new(
            "provider1",
            MockResponse::Candidates(vec![candidate(
                "provider1",
                "Layer normalization",
                Some(2016),
                &["Jimmy Lei Ba"],
            )]),
        ));
        let ctx = ctx_with(vec![p1.clone() as Arc<dyn ProviderClient>]);

        let resolved = ctx.resolve(&query("Layer Normalization", Some(2016))).await;
        match resolved {
            ResolvedMetadata::Found {
                title,
                year,
                source,
                ..
            } => {
                assert_eq!(title, "Layer normalization");
                assert_eq!(year, Some(2016));
                assert_eq!(source, "provider1");
            }
            other => panic!("expected Found, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn second_resolution_is_pure_cache_hit() {
        let p1 = Arc::new(MockProvider::new(
            "provider1",
            MockResponse::Candidates(vec![candidate(
                "provider1",
                "Layer normalization",
                Some(2016),
                &["Jimmy Lei Ba"],
            )]),
        ));
        let ctx = ctx_with(vec![p1.clone() as Arc<dyn ProviderClient>]);
        let q = query("Layer Normalization", Some(2016));

        let first = ctx.resolve(&q).await;
        let second = ctx.resolve(&q).await;

        assert_eq!(first, second);
        assert_eq!(p1.call_count(), 1, "second resolution must not hit providers");
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_to_second_provider() {
        let p1 = Arc::new(MockProvider::new("provider1", MockResponse::Empty));
        let p2 = Arc::new(MockProvider::new(
            "provider2",
            MockResponse::Candidates(vec![candidate(
                "provider2",
                "Layer Normalization",
                Some(2016),
                &[],
            )]),
        ));
        let ctx = ctx_with(vec![p1.clone() as Arc<dyn ProviderClient>, p2.clone()]);

        let resolved = ctx.resolve(&query("Layer Normalization", Some(2016))).await;
        assert_eq!(resolved.source(), Some("provider2"));
        assert_eq!(p1.call_count(), 1);
        assert_eq!(p2.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_candidate_falls_through() {
        // provider1's best hit is similar but three years off with no author
        // overlap; provider2 has the exact work.
        let p1 = Arc::new(MockProvider::new(
            "provider1",
            MockResponse::Candidates(vec![candidate(
                "provider1",
                "Layer normalization methods",
                Some(2013),
                &["Someone Else"],
            )]),
        ));
        let p2 = Arc::new(MockProvider::new(
            "provider2",
            MockResponse::Candidates(vec![candidate(
                "provider2",
                "Layer Normalization",
                Some(2016),
                &["Jimmy Lei Ba"],
            )]),
        ));
        let ctx = ctx_with(vec![p1.clone() as Arc<dyn ProviderClient>, p2.clone()]);

        let mut q = query("Layer Normalization", Some(2016));
        q.known_authors = vec!["Jimmy Lei Ba".into()];
        let resolved = ctx.resolve(&q).await;
        assert_eq!(resolved.source(), Some("provider2"));
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_caches_unresolved() {
        let p1 = Arc::new(MockProvider::new("provider1", MockResponse::Empty));
        let p2 = Arc::new(MockProvider::new("provider2", MockResponse::Empty));
        let ctx = ctx_with(vec![p1.clone() as Arc<dyn ProviderClient>, p2.clone()]);
        let q = query("A Paper Nobody Indexed", None);

        assert_eq!(ctx.resolve(&q).await, ResolvedMetadata::Unresolved);
        // Repeat: the unresolved outcome must come from cache.
        assert_eq!(ctx.resolve(&q).await, ResolvedMetadata::Unresolved);
        assert_eq!(p1.call_count(), 1);
        assert_eq!(p2.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_fail_open_after_retries() {
        let p1 = Arc::new(MockProvider::new(
            "provider1",
            MockResponse::Transient("connection reset".into()),
        ));
        let p2 = Arc::new(MockProvider::new(
            "provider2",
            MockResponse::Candidates(vec![candidate(
                "provider2",
                "Layer Normalization",
                Some(2016),
                &[],
            )]),
        ));
        let ctx = ctx_with(vec![p1.clone() as Arc<dyn ProviderClient>, p2.clone()]);

        let resolved = ctx.resolve(&query("Layer Normalization", Some(2016))).await;
        assert_eq!(resolved.source(), Some("provider2"));
        // Default policy: three attempts against the failing provider.
        assert_eq!(p1.call_count(), 3);
        assert_eq!(p2.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_exhaustion_fails_open() {
        let p1 = Arc::new(MockProvider::new(
            "provider1",
            MockResponse::RateLimited {
                retry_after: Some(Duration::from_secs(1)),
            },
        ));
        let p2 = Arc::new(MockProvider::new(
            "provider2",
            MockResponse::Candidates(vec![candidate(
                "provider2",
                "Layer Normalization",
                None,
                &[],
            )]),
        ));
        let ctx = ctx_with(vec![p1.clone() as Arc<dyn ProviderClient>, p2.clone()]);

        let resolved = ctx.resolve(&query("Layer Normalization", None)).await;
        assert_eq!(resolved.source(), Some("provider2"));
        assert_eq!(p1.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn best_candidate_wins_over_result_order() {
        let p1 = Arc::new(MockProvider::new(
            "provider1",
            MockResponse::Candidates(vec![
                candidate("provider1", "Layer normalization methods survey", None, &[]),
                candidate("provider1", "Layer normalization", Some(2016), &[]),
            ]),
        ));
        let ctx = ctx_with(vec![p1.clone() as Arc<dyn ProviderClient>]);

        let resolved = ctx.resolve(&query("Layer Normalization", Some(2016))).await;
        match resolved {
            ResolvedMetadata::Found { title, .. } => assert_eq!(title, "Layer normalization"),
            other => panic!("expected Found, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn empty_title_short_circuits() {
        let p1 = Arc::new(MockProvider::new("provider1", MockResponse::Empty));
        let ctx = ctx_with(vec![p1.clone() as Arc<dyn ProviderClient>]);

        let resolved = ctx.resolve(&query("", Some(2016))).await;
        assert_eq!(resolved, ResolvedMetadata::Unresolved);
        assert_eq!(p1.call_count(), 0);
        assert!(ctx.cache().is_empty(), "empty key must not be cached");
    }

    #[tokio::test(start_paused = true)]
    async fn batch_single_flight_dedups_same_key() {
        let p1 = Arc::new(
            MockProvider::new(
                "provider1",
                MockResponse::Candidates(vec![candidate(
                    "provider1",
                    "Layer normalization",
                    Some(2016),
                    &[],
                )]),
            )
            .with_delay(Duration::from_millis(50)),
        );
        let ctx = ctx_with(vec![p1.clone() as Arc<dyn ProviderClient>]);

        // Same normalized key, resolved concurrently by different workers.
        let queries = vec![
            query("Layer Normalization", Some(2016)),
            query("layer NORMALIZATION", Some(2016)),
        ];
        let results = resolve_batch(ctx, queries, |_| {}, CancellationToken::new()).await;

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.is_found()));
        assert_eq!(p1.call_count(), 1, "concurrent same-key fan-out must dedup");
    }

    #[tokio::test(start_paused = true)]
    async fn batch_preserves_input_order() {
        let p1 = Arc::new(MockProvider::new(
            "provider1",
            MockResponse::Candidates(vec![candidate(
                "provider1",
                "Layer normalization",
                Some(2016),
                &[],
            )]),
        ));
        let ctx = ctx_with(vec![p1.clone() as Arc<dyn ProviderClient>]);

        let events: Arc<Mutex<Vec<ProgressEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);

        let queries = vec![
            query("Layer Normalization", Some(2016)),
            query("An Entirely Unrelated Topic", None),
        ];
        let results = resolve_batch(
            ctx,
            queries,
            move |e| sink.lock().unwrap().push(e),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(results.len(), 2);
        assert!(results[0].is_found());
        assert_eq!(results[1], ResolvedMetadata::Unresolved);

        let events = events.lock().unwrap();
        let resolving = events
            .iter()
            .filter(|e| matches!(e, ProgressEvent::Resolving { .. }))
            .count();
        let resolved = events
            .iter()
            .filter(|e| matches!(e, ProgressEvent::Resolved { .. }))
            .count();
        assert_eq!((resolving, resolved), (2, 2));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_batch_yields_uncached_unresolved() {
        let p1 = Arc::new(MockProvider::new(
            "provider1",
            MockResponse::Candidates(vec![candidate(
                "provider1",
                "Layer normalization",
                Some(2016),
                &[],
            )]),
        ));
        let ctx = ctx_with(vec![p1.clone() as Arc<dyn ProviderClient>]);

        let cancel = CancellationToken::new();
        cancel.cancel();

        let results = resolve_batch(
            Arc::clone(&ctx),
            vec![query("Layer Normalization", Some(2016))],
            |_| {},
            cancel,
        )
        .await;

        assert_eq!(results, vec![ResolvedMetadata::Unresolved]);
        assert_eq!(p1.call_count(), 0);
        assert!(ctx.cache().is_empty());
    }

    #[test]
    fn provider_stack_respects_disabled_list() {
        let config = Config {
            disabled_providers: vec!["OpenAlex".into(), "crossref".into()],
            ..Default::default()
        };
        let providers = build_provider_list(&config);
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].name(), "Semantic Scholar");
    }

    #[test]
    fn provider_stack_default_order() {
        let providers = build_provider_list(&Config::default());
        let names: Vec<&str> = providers.iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["Semantic Scholar", "OpenAlex", "CrossRef"]);
    }
}
