//! Admit, execute and settle calls against a rate- and capacity-constrained service.

mod bundle;
mod concurrency_limiter;
mod controller;
pub mod error;
pub mod estimator;
pub mod headers;
pub mod internal_event;
pub mod layer;
pub mod retries;
pub mod service;
pub mod signals;
pub mod telemetry;
mod token_limiter;
pub mod types;

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use bon::Builder;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, ensure};

pub use concurrency_limiter::ConcurrencyLimiter;
pub use controller::AdmissionController;
pub use layer::AdmissionLayer;
pub use service::{AdmissionRequest, AdmissionService};
pub use token_limiter::TokenLimiter;

use error::{ConfigError, InvalidSettingSnafu, JsonSnafu};

fn instant_now() -> std::time::Instant {
    tokio::time::Instant::now().into()
}

// Limiter state stays consistent across a panic in another holder: every
// critical section is a handful of float assignments.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// How a cost overrun (actual cost above the admitted estimate) is paid back.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementMode {
    /// Record the shortfall as debt, paid out of future refills before the bucket grows.
    #[default]
    Debt,
    /// Subtract the shortfall from the bucket immediately, letting it go negative.
    AllowNegative,
}

/// A request attribute that can partition limiter state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dimension {
    Provider,
    Model,
    Tenant,
}

/// Bounds of the admission queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Builder, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSettings {
    /// Maximum number of requests waiting for capacity at once. A request that
    /// arrives when the queue is full fails immediately.
    ///
    /// **Default**: 100
    #[builder(default = default_queue_max_size())]
    #[serde(default = "default_queue_max_size")]
    pub(super) max_size: usize,

    /// How long, in milliseconds, a request may wait for token and concurrency
    /// capacity before failing with a queue timeout.
    ///
    /// **Default**: 1000
    #[builder(default = default_queue_timeout_ms())]
    #[serde(default = "default_queue_timeout_ms")]
    pub(super) timeout_ms: u64,
}

const fn default_queue_max_size() -> usize {
    100
}

const fn default_queue_timeout_ms() -> u64 {
    1000
}

/// Longest accepted queue timeout, one day.
const MAX_QUEUE_TIMEOUT_MS: u64 = 24 * 60 * 60 * 1000;

impl QueueSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.min(MAX_QUEUE_TIMEOUT_MS))
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_size: default_queue_max_size(),
            timeout_ms: default_queue_timeout_ms(),
        }
    }
}

/// Token-rate limiter parameters.
///
/// The limiter is a token bucket whose refill rate `r` follows AIMD: it grows by
/// `additive_step` tokens/second per success and is multiplied by `beta`
/// (rate limit) or `beta_soft` (timeout, server error) on loss.
///
/// | Parameter | Default | Description |
/// |-----------|---------|-------------|
/// | `r_init` | 500 | Starting refill rate, tokens/second |
/// | `r_min` | 50 | Floor for multiplicative decrease |
/// | `r_max` | 5000 | Ceiling for additive increase; remote headers may only tighten it |
/// | `bucket_size` | 2000 | Initial bucket capacity and level |
/// | `additive_step` | 50 | Rate increase per success |
/// | `beta` | 0.7 | Decrease factor on rate-limit signals |
/// | `beta_soft` | 0.85 | Decrease factor on timeouts and server errors |
/// | `settlement_mode` | `debt` | How cost overruns are paid back |
///
/// # Example
///
/// ```rust
/// use llm_admission::admission::TokenLimiterSettings;
///
/// let settings = TokenLimiterSettings::builder()
///     .r_init(200.0)
///     .bucket_size(4000.0)
///     .beta(0.5)
///     .build();
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Builder, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenLimiterSettings {
    #[builder(default = default_r_init())]
    #[serde(default = "default_r_init")]
    pub(super) r_init: f64,

    #[builder(default = default_r_min())]
    #[serde(default = "default_r_min")]
    pub(super) r_min: f64,

    #[builder(default = default_r_max())]
    #[serde(default = "default_r_max")]
    pub(super) r_max: f64,

    #[builder(default = default_bucket_size())]
    #[serde(default = "default_bucket_size")]
    pub(super) bucket_size: f64,

    #[builder(default = default_additive_step())]
    #[serde(default = "default_additive_step")]
    pub(super) additive_step: f64,

    /// Multiplicative decrease applied to the rate on an explicit rate-limit signal.
    ///
    /// **Range**: 0 < beta <= 1
    #[builder(default = default_beta())]
    #[serde(default = "default_beta")]
    pub(super) beta: f64,

    /// Multiplicative decrease applied on a soft loss. Usually gentler than `beta`.
    #[builder(default = default_beta_soft())]
    #[serde(default = "default_beta_soft")]
    pub(super) beta_soft: f64,

    #[builder(default)]
    #[serde(default)]
    pub(super) settlement_mode: SettlementMode,
}

const fn default_r_init() -> f64 {
    500.0
}

const fn default_r_min() -> f64 {
    50.0
}

const fn default_r_max() -> f64 {
    5000.0
}

const fn default_bucket_size() -> f64 {
    2000.0
}

const fn default_additive_step() -> f64 {
    50.0
}

const fn default_beta() -> f64 {
    0.7
}

const fn default_beta_soft() -> f64 {
    0.85
}

impl Default for TokenLimiterSettings {
    fn default() -> Self {
        Self {
            r_init: default_r_init(),
            r_min: default_r_min(),
            r_max: default_r_max(),
            bucket_size: default_bucket_size(),
            additive_step: default_additive_step(),
            beta: default_beta(),
            beta_soft: default_beta_soft(),
            settlement_mode: SettlementMode::default(),
        }
    }
}

impl TokenLimiterSettings {
    pub fn get_r_max(&self) -> f64 {
        self.r_max
    }

    pub fn get_settlement_mode(&self) -> SettlementMode {
        self.settlement_mode
    }
}

/// Concurrency window parameters.
///
/// The window `cwnd` grows by one per success and is multiplied by `beta_c` on
/// loss. When both `delay_decrease` and `delay_threshold_ms` are set, a
/// first-token latency that exceeds its smoothed baseline by more than the
/// threshold multiplies the window by `delay_decrease` as well.
#[derive(Clone, Copy, Debug, PartialEq, Builder, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConcurrencyLimiterSettings {
    /// **Default**: 4
    #[builder(default = default_cwnd_init())]
    #[serde(default = "default_cwnd_init")]
    pub(super) cwnd_init: f64,

    /// **Default**: 1
    #[builder(default = default_cwnd_min())]
    #[serde(default = "default_cwnd_min")]
    pub(super) cwnd_min: f64,

    /// **Default**: 64
    #[builder(default = default_cwnd_max())]
    #[serde(default = "default_cwnd_max")]
    pub(super) cwnd_max: f64,

    /// Loss-based multiplicative decrease.
    ///
    /// **Default**: 0.7
    #[builder(default = default_beta_c())]
    #[serde(default = "default_beta_c")]
    pub(super) beta_c: f64,

    /// Delay-based multiplicative decrease. `None` disables delay reaction.
    #[serde(default)]
    pub(super) delay_decrease: Option<f64>,

    /// Queueing delay, in milliseconds above the first-token baseline, that
    /// triggers `delay_decrease`.
    #[serde(default)]
    pub(super) delay_threshold_ms: Option<f64>,
}

const fn default_cwnd_init() -> f64 {
    4.0
}

const fn default_cwnd_min() -> f64 {
    1.0
}

const fn default_cwnd_max() -> f64 {
    64.0
}

const fn default_beta_c() -> f64 {
    0.7
}

impl Default for ConcurrencyLimiterSettings {
    fn default() -> Self {
        Self {
            cwnd_init: default_cwnd_init(),
            cwnd_min: default_cwnd_min(),
            cwnd_max: default_cwnd_max(),
            beta_c: default_beta_c(),
            delay_decrease: None,
            delay_threshold_ms: None,
        }
    }
}

impl ConcurrencyLimiterSettings {
    pub fn get_cwnd_max(&self) -> f64 {
        self.cwnd_max
    }
}

/// Per-provider override of the headers consulted for remote limit synchronization.
///
/// Unset names fall back to the `x-ratelimit-*` defaults in [`headers`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Builder, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitHeaderNames {
    #[serde(default)]
    pub limit_tokens_header: Option<String>,
    #[serde(default)]
    pub remaining_tokens_header: Option<String>,
    #[serde(default)]
    pub window_seconds_header: Option<String>,
    #[serde(default)]
    pub reset_ms_header: Option<String>,
}

/// Configuration of one [`AdmissionController`].
///
/// All values are static for the lifetime of the controller. Every limiter
/// bundle created for a partition key starts from the same limiter settings.
///
/// # Example
///
/// ```rust
/// use llm_admission::admission::{ControlConfig, Dimension, QueueSettings};
///
/// let config = ControlConfig::builder()
///     .queue(QueueSettings::builder().max_size(10).timeout_ms(250).build())
///     .dimensions(vec![Dimension::Provider, Dimension::Model])
///     .build();
/// assert!(config.validate().is_ok());
/// ```
#[derive(Clone, Debug, Default, PartialEq, Builder, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlConfig {
    #[builder(default)]
    #[serde(default)]
    pub(super) queue: QueueSettings,

    #[builder(default)]
    #[serde(default)]
    pub(super) token_limiter: TokenLimiterSettings,

    #[builder(default)]
    #[serde(default)]
    pub(super) concurrency_limiter: ConcurrencyLimiterSettings,

    /// Ordered request attributes forming the bundle partition key. Empty means
    /// one bundle shared by every request.
    #[builder(default)]
    #[serde(default)]
    pub(super) dimensions: Vec<Dimension>,

    /// Header name overrides keyed by provider id.
    #[builder(default)]
    #[serde(default)]
    pub(super) rate_limit_headers: HashMap<String, RateLimitHeaderNames>,
}

impl ControlConfig {
    /// Parses a JSON document using the camelCase option names and validates it.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: ControlConfig = serde_json::from_str(json).context(JsonSnafu)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let tokens = &self.token_limiter;
        let window = &self.concurrency_limiter;

        ensure!(
            self.queue.max_size > 0,
            InvalidSettingSnafu {
                field: "queue.maxSize",
                reason: "must be greater than zero",
            }
        );
        ensure!(
            self.queue.timeout_ms <= MAX_QUEUE_TIMEOUT_MS,
            InvalidSettingSnafu {
                field: "queue.timeoutMs",
                reason: format!("must be at most {MAX_QUEUE_TIMEOUT_MS}"),
            }
        );
        ensure!(
            tokens.r_min >= 0.0 && tokens.r_min <= tokens.r_max,
            InvalidSettingSnafu {
                field: "tokenLimiter.rMin",
                reason: format!("must be within [0, rMax = {}]", tokens.r_max),
            }
        );
        ensure!(
            tokens.bucket_size >= 0.0 && tokens.additive_step >= 0.0,
            InvalidSettingSnafu {
                field: "tokenLimiter.bucketSize",
                reason: "bucket size and additive step must be non-negative",
            }
        );
        for (field, beta) in [
            ("tokenLimiter.beta", tokens.beta),
            ("tokenLimiter.betaSoft", tokens.beta_soft),
            ("concurrencyLimiter.betaC", window.beta_c),
        ] {
            ensure!(
                beta > 0.0 && beta <= 1.0,
                InvalidSettingSnafu {
                    field,
                    reason: format!("must be within (0, 1], got {beta}"),
                }
            );
        }
        ensure!(
            window.cwnd_min >= 0.0 && window.cwnd_min <= window.cwnd_max,
            InvalidSettingSnafu {
                field: "concurrencyLimiter.cwndMin",
                reason: format!("must be within [0, cwndMax = {}]", window.cwnd_max),
            }
        );
        if let Some(decrease) = window.delay_decrease {
            ensure!(
                decrease > 0.0 && decrease <= 1.0,
                InvalidSettingSnafu {
                    field: "concurrencyLimiter.delayDecrease",
                    reason: format!("must be within (0, 1], got {decrease}"),
                }
            );
        }
        if let Some(threshold) = window.delay_threshold_ms {
            ensure!(
                threshold.is_finite() && threshold >= 0.0,
                InvalidSettingSnafu {
                    field: "concurrencyLimiter.delayThresholdMs",
                    reason: format!("must be a non-negative number of milliseconds, got {threshold}"),
                }
            );
        }
        Ok(())
    }

    pub fn queue(&self) -> &QueueSettings {
        &self.queue
    }

    pub fn token_limiter(&self) -> &TokenLimiterSettings {
        &self.token_limiter
    }

    pub fn concurrency_limiter(&self) -> &ConcurrencyLimiterSettings {
        &self.concurrency_limiter
    }

    pub fn dimensions(&self) -> &[Dimension] {
        &self.dimensions
    }

    pub(crate) fn header_names(&self, provider: &str) -> headers::ResolvedHeaderNames {
        headers::ResolvedHeaderNames::resolve(self.rate_limit_headers.get(provider))
    }
}
