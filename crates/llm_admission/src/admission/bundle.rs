use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use super::{
    ConcurrencyLimiter, ConcurrencyLimiterSettings, ControlConfig, Dimension, TokenLimiter,
    TokenLimiterSettings, lock,
    types::{LimiterSnapshot, RequestMeta},
};

const FTL_EWMA_ALPHA: f64 = 0.2;
const GLOBAL_KEY: &str = "global";
const ABSENT_DIMENSION: &str = "default";

/// The limiter state of one partition key.
#[derive(Debug)]
pub(crate) struct LimiterBundle {
    pub(crate) tokens: TokenLimiter,
    pub(crate) concurrency: ConcurrencyLimiter,
    baseline_ftl: Option<Duration>,
}

impl LimiterBundle {
    fn new(
        tokens: TokenLimiterSettings,
        concurrency: ConcurrencyLimiterSettings,
        now: Instant,
    ) -> Self {
        Self {
            tokens: TokenLimiter::new(tokens, now),
            concurrency: ConcurrencyLimiter::new(concurrency),
            baseline_ftl: None,
        }
    }

    /// Feeds one first-token latency into the smoothed baseline and shrinks the
    /// window when the latency sits more than `threshold` above it. The first
    /// sample only seeds the baseline. Returns whether the window shrank.
    pub(crate) fn observe_first_token(
        &mut self,
        first_token: Duration,
        threshold: Option<Duration>,
    ) -> bool {
        let Some(baseline) = self.baseline_ftl else {
            self.baseline_ftl = Some(first_token);
            return false;
        };

        let ftl = first_token.as_secs_f64();
        let smoothed = FTL_EWMA_ALPHA * ftl + (1.0 - FTL_EWMA_ALPHA) * baseline.as_secs_f64();
        self.baseline_ftl = Some(Duration::from_secs_f64(smoothed));

        let Some(threshold) = threshold else {
            return false;
        };
        let queue_delay = ftl - smoothed;
        if queue_delay > threshold.as_secs_f64() {
            self.concurrency.on_delay_signal();
            return true;
        }
        false
    }

    pub(crate) fn snapshot(&self) -> LimiterSnapshot {
        LimiterSnapshot {
            rate: self.tokens.rate(),
            max_rate: self.tokens.max_rate(),
            bucket: self.tokens.bucket(),
            bucket_cap: self.tokens.bucket_cap(),
            debt: self.tokens.debt(),
            cwnd: self.concurrency.cwnd(),
            inflight: self.concurrency.inflight(),
            baseline_ftl: self.baseline_ftl,
        }
    }
}

/// Builds the partition key: the configured dimensions, in order, joined by `|`.
pub(crate) fn bundle_key(dimensions: &[Dimension], request: &RequestMeta) -> String {
    if dimensions.is_empty() {
        return GLOBAL_KEY.to_owned();
    }
    dimensions
        .iter()
        .map(|dimension| {
            let value = match dimension {
                Dimension::Provider => Some(request.provider.as_str()),
                Dimension::Model => Some(request.model.as_str()),
                Dimension::Tenant => request.tenant.as_deref(),
            };
            value.filter(|v| !v.is_empty()).unwrap_or(ABSENT_DIMENSION)
        })
        .collect::<Vec<_>>()
        .join("|")
}

pub(crate) type SharedBundle = Arc<Mutex<LimiterBundle>>;

/// Lazily created bundles, one per partition key. Entries are never removed.
#[derive(Debug)]
pub(crate) struct BundleRegistry {
    dimensions: Vec<Dimension>,
    tokens: TokenLimiterSettings,
    concurrency: ConcurrencyLimiterSettings,
    bundles: Mutex<HashMap<String, SharedBundle>>,
}

impl BundleRegistry {
    pub(crate) fn new(config: &ControlConfig) -> Self {
        Self {
            dimensions: config.dimensions.clone(),
            tokens: config.token_limiter,
            concurrency: config.concurrency_limiter,
            bundles: Mutex::default(),
        }
    }

    pub(crate) fn resolve(&self, request: &RequestMeta, now: Instant) -> SharedBundle {
        let key = bundle_key(&self.dimensions, request);
        let mut bundles = lock(&self.bundles);
        let bundle = bundles.entry(key).or_insert_with_key(|key| {
            debug!(message = "Creating limiter bundle.", %key);
            Arc::new(Mutex::new(LimiterBundle::new(
                self.tokens,
                self.concurrency,
                now,
            )))
        });
        Arc::clone(bundle)
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.bundles).len()
    }
}
