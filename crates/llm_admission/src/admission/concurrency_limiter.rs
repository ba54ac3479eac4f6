use snafu::ensure;

use super::{
    ConcurrencyLimiterSettings,
    error::{LimiterError, NoCapacitySnafu},
};

/// AIMD window over the number of in-flight calls.
#[derive(Clone, Debug)]
pub struct ConcurrencyLimiter {
    settings: ConcurrencyLimiterSettings,
    cwnd: f64,
    inflight: usize,
}

impl ConcurrencyLimiter {
    pub fn new(settings: ConcurrencyLimiterSettings) -> Self {
        Self {
            settings,
            cwnd: settings.cwnd_init,
            inflight: 0,
        }
    }

    fn slots(&self) -> usize {
        self.cwnd.floor().max(0.0) as usize
    }

    pub fn can_acquire(&self) -> bool {
        self.inflight < self.slots()
    }

    pub fn acquire(&mut self) -> Result<(), LimiterError> {
        ensure!(
            self.can_acquire(),
            NoCapacitySnafu {
                limiter: "concurrency",
                requested: (self.inflight + 1) as f64,
                available: self.slots() as f64,
            }
        );
        self.inflight += 1;
        Ok(())
    }

    pub fn release(&mut self) {
        self.inflight = self.inflight.saturating_sub(1);
    }

    pub fn on_success(&mut self) {
        self.cwnd = self.settings.cwnd_max.min(self.cwnd + 1.0);
    }

    pub fn on_loss(&mut self) {
        self.cwnd = self.settings.cwnd_min.max(self.cwnd * self.settings.beta_c);
    }

    /// Queueing-delay reaction; a no-op unless `delay_decrease` is configured.
    pub fn on_delay_signal(&mut self) {
        if let Some(decrease) = self.settings.delay_decrease {
            self.cwnd = self.settings.cwnd_min.max(self.cwnd * decrease);
        }
    }

    pub fn cwnd(&self) -> f64 {
        self.cwnd
    }

    pub fn inflight(&self) -> usize {
        self.inflight
    }
}
