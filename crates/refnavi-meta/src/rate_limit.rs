//! Per-provider adaptive pacing.
//!
//! Each provider call waits for its governor permit via `until_ready()`,
//! which spaces requests at the configured rate across all workers. On a
//! 429 the governor is swapped to a slower rate; the reactive backoff itself
//! lives in [`retry`](crate::retry). All bookkeeping is provider-local.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

use crate::providers::{crossref, openalex, semantic_scholar};

/// Type alias for governor's direct rate limiter.
type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Per-provider rate limiter with adaptive rate adjustment via ArcSwap.
///
/// When a 429 is received, the governor is atomically swapped to a slower
/// rate. After a cooldown period (60s) with no 429s, the original rate is
/// restored.
pub struct AdaptiveLimiter {
    limiter: ArcSwap<DirectLimiter>,
    /// Base period between allowed requests.
    base_period: Duration,
    /// Current slowdown factor (1 = normal, 2 = half rate, etc.).
    current_factor: AtomicU32,
    /// Timestamp of the last 429 response.
    last_429: std::sync::Mutex<Option<Instant>>,
}

impl AdaptiveLimiter {
    /// Create a new limiter with the given period between requests.
    pub fn new(period: Duration) -> Self {
        let quota = Quota::with_period(period).expect("period must be > 0");
        let limiter = Arc::new(DirectLimiter::direct(quota));
        Self {
            limiter: ArcSwap::from(limiter),
            base_period: period,
            current_factor: AtomicU32::new(1),
            last_429: std::sync::Mutex::new(None),
        }
    }

    /// Create a limiter allowing `n` requests per second.
    pub fn per_second(n: u32) -> Self {
        let ms = 1000 / n.max(1) as u64;
        Self::new(Duration::from_millis(ms))
    }

    /// Wait until the rate limiter allows a request.
    ///
    /// Blocks the calling future until a token is available, naturally
    /// spacing requests at the configured rate across concurrent callers.
    pub async fn acquire(&self) {
        self.try_decay();
        let limiter = self.limiter.load();
        limiter.until_ready().await;
    }

    /// Called when a 429 is received. Doubles the slowdown factor (cap 16x)
    /// and swaps the governor.
    pub fn on_rate_limited(&self) {
        if let Ok(mut last) = self.last_429.lock() {
            *last = Some(Instant::now());
        }

        let _ = self
            .current_factor
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |f| Some((f * 2).min(16)));

        let factor = self.current_factor.load(Ordering::SeqCst);
        if let Some(scaled) = self.base_period.checked_mul(factor)
            && let Some(quota) = Quota::with_period(scaled)
        {
            let new_limiter = Arc::new(DirectLimiter::direct(quota));
            self.limiter.store(new_limiter);
        }
    }

    /// If 60s have passed since the last 429, restore the original rate.
    fn try_decay(&self) {
        let should_restore = self
            .last_429
            .lock()
            .ok()
            .and_then(|last| last.map(|t| t.elapsed().as_secs() >= 60))
            .unwrap_or(false);

        if should_restore && self.current_factor.load(Ordering::SeqCst) > 1 {
            self.current_factor.store(1, Ordering::SeqCst);
            let quota = Quota::with_period(self.base_period).expect("base period valid");
            let limiter = Arc::new(DirectLimiter::direct(quota));
            self.limiter.store(limiter);
        }
    }
}

/// Collection of per-provider rate limiters.
pub struct ProviderLimiters {
    limiters: HashMap<&'static str, AdaptiveLimiter>,
}

impl Default for ProviderLimiters {
    fn default() -> Self {
        Self::new(false, false)
    }
}

impl ProviderLimiters {
    /// Build rate limiters based on whether API keys/mailto are configured.
    pub fn new(has_s2_api_key: bool, has_crossref_mailto: bool) -> Self {
        let mut limiters = HashMap::new();

        // Semantic Scholar: keyless ~100 req/5min, keyed 1/s (basic tier)
        if has_s2_api_key {
            limiters.insert(semantic_scholar::NAME, AdaptiveLimiter::per_second(1));
        } else {
            // ~0.33/s → 1 request per 3 seconds
            limiters.insert(
                semantic_scholar::NAME,
                AdaptiveLimiter::new(Duration::from_secs(3)),
            );
        }

        // OpenAlex: 10/s without key — light governor so adaptive backoff
        // kicks in if we get 429'd
        limiters.insert(openalex::NAME, AdaptiveLimiter::per_second(10));

        // CrossRef: 1/s anonymous, 3/s in the polite pool
        let crossref_rate = if has_crossref_mailto { 3 } else { 1 };
        limiters.insert(crossref::NAME, AdaptiveLimiter::per_second(crossref_rate));

        Self { limiters }
    }

    /// Get the rate limiter for a given provider, if one exists.
    pub fn get(&self, provider: &str) -> Option<&AdaptiveLimiter> {
        self.limiters.get(provider)
    }

    /// Wait for the provider's permit. Providers without a limiter (mocks,
    /// custom stacks) proceed immediately.
    pub async fn acquire(&self, provider: &str) {
        if let Some(limiter) = self.get(provider) {
            limiter.acquire().await;
        }
    }

    /// Record a 429 for the provider, slowing its governor.
    pub fn on_rate_limited(&self, provider: &str) {
        if let Some(limiter) = self.get(provider) {
            limiter.on_rate_limited();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_factor_1() {
        let limiter = AdaptiveLimiter::per_second(10);
        assert_eq!(limiter.current_factor.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn on_rate_limited_doubles() {
        let limiter = AdaptiveLimiter::per_second(10);
        limiter.on_rate_limited();
        assert_eq!(limiter.current_factor.load(Ordering::SeqCst), 2);
        limiter.on_rate_limited();
        assert_eq!(limiter.current_factor.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn factor_caps_at_16() {
        let limiter = AdaptiveLimiter::per_second(10);
        for _ in 0..10 {
            limiter.on_rate_limited();
        }
        assert_eq!(limiter.current_factor.load(Ordering::SeqCst), 16);
    }

    #[tokio::test]
    async fn acquire_completes() {
        // With a generous rate (10/s), the first acquire should return instantly.
        let limiter = AdaptiveLimiter::per_second(10);
        limiter.acquire().await;
    }

    #[tokio::test]
    async fn decay_restores_after_60s() {
        let limiter = AdaptiveLimiter::per_second(10);
        limiter.on_rate_limited();
        limiter.on_rate_limited();
        assert_eq!(limiter.current_factor.load(Ordering::SeqCst), 4);

        // Manually backdate last_429 to 61 seconds ago
        {
            let mut last = limiter.last_429.lock().unwrap();
            *last = Some(Instant::now() - Duration::from_secs(61));
        }

        // acquire() calls try_decay() internally
        limiter.acquire().await;
        assert_eq!(limiter.current_factor.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn default_has_expected_providers() {
        let limiters = ProviderLimiters::default();
        for name in ["Semantic Scholar", "OpenAlex", "CrossRef"] {
            assert!(limiters.get(name).is_some(), "missing limiter for {name}");
        }
    }

    #[test]
    fn crossref_rate_varies_with_mailto() {
        // Without mailto, CrossRef gets 1/s → base_period = 1000ms
        let without = ProviderLimiters::new(false, false);
        let period_without = without.get("CrossRef").unwrap().base_period;

        // With mailto, CrossRef gets 3/s → base_period = 333ms
        let with = ProviderLimiters::new(false, true);
        let period_with = with.get("CrossRef").unwrap().base_period;

        assert!(
            period_with < period_without,
            "polite pool should have a shorter period (faster rate)"
        );
    }

    #[test]
    fn s2_rate_varies_with_api_key() {
        let keyless = ProviderLimiters::new(false, false);
        let keyed = ProviderLimiters::new(true, false);
        assert!(
            keyed.get("Semantic Scholar").unwrap().base_period
                < keyless.get("Semantic Scholar").unwrap().base_period
        );
    }

    #[test]
    fn unknown_provider_returns_none() {
        let limiters = ProviderLimiters::default();
        assert!(limiters.get("FakeProvider").is_none());
    }

    #[tokio::test]
    async fn acquire_unknown_provider_is_noop() {
        let limiters = ProviderLimiters::default();
        limiters.acquire("provider1").await;
        limiters.on_rate_limited("provider1");
    }
}
