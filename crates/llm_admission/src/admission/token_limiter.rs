use std::time::{Duration, Instant};

use snafu::ensure;

use super::{
    SettlementMode, TokenLimiterSettings,
    error::{LimiterError, NoCapacitySnafu},
};

/// Token bucket with an AIMD-controlled refill rate.
///
/// Invariant: `bucket <= bucket_cap`, and `bucket >= 0` unless the settlement
/// mode is [`SettlementMode::AllowNegative`].
#[derive(Clone, Debug)]
pub struct TokenLimiter {
    settings: TokenLimiterSettings,
    bucket: f64,
    bucket_cap: f64,
    rate: f64,
    max_rate: f64,
    debt: f64,
    last_refill: Instant,
}

impl TokenLimiter {
    pub fn new(settings: TokenLimiterSettings, now: Instant) -> Self {
        Self {
            settings,
            bucket: settings.bucket_size,
            bucket_cap: settings.bucket_size,
            rate: settings.r_init,
            max_rate: settings.r_max,
            debt: 0.0,
            last_refill: now,
        }
    }

    /// Adds `rate * elapsed` tokens. In debt mode the new tokens pay down debt
    /// before they reach the bucket.
    pub fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let mut tokens = self.bucket + self.rate * elapsed.as_secs_f64();

        match self.settings.settlement_mode {
            SettlementMode::Debt => {
                if self.debt > 0.0 {
                    let pay = self.debt.min(tokens);
                    self.debt -= pay;
                    tokens -= pay;
                }
                tokens = tokens.max(0.0);
            }
            // A negative bucket is the overrun itself; refill pays it back.
            SettlementMode::AllowNegative => {}
        }

        self.bucket = tokens.min(self.bucket_cap);
        self.last_refill = now;
    }

    pub fn can_acquire(&self, cost: f64) -> bool {
        self.bucket >= cost
    }

    pub fn acquire(&mut self, cost: f64) -> Result<(), LimiterError> {
        ensure!(
            self.can_acquire(cost),
            NoCapacitySnafu {
                limiter: "token",
                requested: cost,
                available: self.bucket,
            }
        );
        self.bucket -= cost;
        Ok(())
    }

    /// Reconciles the admitted estimate with the observed cost.
    pub fn settle(&mut self, predicted: f64, actual: f64) {
        let surplus = predicted - actual;
        if surplus > 0.0 {
            self.bucket = self.bucket_cap.min(self.bucket + surplus);
            return;
        }

        let shortfall = -surplus;
        match self.settings.settlement_mode {
            SettlementMode::Debt => self.debt += shortfall,
            SettlementMode::AllowNegative => self.bucket -= shortfall,
        }
    }

    pub fn on_success(&mut self) {
        self.rate = self.max_rate.min(self.rate + self.settings.additive_step);
    }

    pub fn on_loss(&mut self) {
        self.rate = self.settings.r_min.max(self.rate * self.settings.beta);
    }

    pub fn on_soft_loss(&mut self) {
        self.rate = self.settings.r_min.max(self.rate * self.settings.beta_soft);
    }

    /// Overwrites capacity and level from remaining-capacity headers.
    pub fn apply_remote_limit(&mut self, limit_tokens: Option<f64>, remaining_tokens: Option<f64>) {
        if let Some(limit) = limit_tokens {
            self.bucket_cap = limit;
            self.bucket = self.bucket.min(self.bucket_cap);
        }
        if let Some(remaining) = remaining_tokens {
            self.bucket = remaining.max(0.0).min(self.bucket_cap);
        }
    }

    /// Derives a ceiling of `limit / window` tokens per second. The ceiling only
    /// ever tightens the configured `r_max`; an explicit window wins over the
    /// reset interval.
    pub fn apply_remote_rate(
        &mut self,
        limit_tokens: Option<f64>,
        window_seconds: Option<f64>,
        reset: Option<Duration>,
    ) {
        let window = window_seconds.or_else(|| reset.map(|reset| reset.as_secs_f64()));
        if let (Some(limit), Some(window)) = (limit_tokens, window) {
            if window > 0.0 {
                self.max_rate = self.settings.r_max.min(limit / window);
                self.rate = self.rate.min(self.max_rate);
            }
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn max_rate(&self) -> f64 {
        self.max_rate
    }

    pub fn bucket(&self) -> f64 {
        self.bucket
    }

    pub fn bucket_cap(&self) -> f64 {
        self.bucket_cap
    }

    pub fn debt(&self) -> f64 {
        self.debt
    }
}
