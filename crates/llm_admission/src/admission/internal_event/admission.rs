use std::time::Duration;

use metrics::{counter, gauge, histogram};

use super::InternalEvent;
use crate::admission::types::{Latency, LimiterSnapshot, RequestMeta, Signal};

fn labels(ctx: &RequestMeta) -> [(&'static str, String); 3] {
    [
        ("provider", ctx.provider.clone()),
        ("model", ctx.model.clone()),
        ("tenant", ctx.tenant_or_default().to_owned()),
    ]
}

#[derive(Debug)]
pub struct QueueWaitObserved<'a> {
    pub ctx: &'a RequestMeta,
    pub waited: Duration,
}

impl InternalEvent for QueueWaitObserved<'_> {
    fn emit(self) {
        histogram!("llm_queue_wait_seconds", &labels(self.ctx)).record(self.waited);
        trace!(
            target: "llm_admission::stats",
            provider = %self.ctx.provider,
            model = %self.ctx.model,
            queue_wait_ms = self.waited.as_millis(),
            "Queue wait observed"
        );
    }
}

#[derive(Debug)]
pub struct LimiterStateObserved<'a> {
    pub ctx: &'a RequestMeta,
    pub state: &'a LimiterSnapshot,
}

impl InternalEvent for LimiterStateObserved<'_> {
    fn emit(self) {
        let labels = labels(self.ctx);
        // Gauges, since only the latest value of each bundle matters.
        gauge!("llm_cc_cwnd", &labels).set(self.state.cwnd);
        gauge!("llm_cc_inflight", &labels).set(self.state.inflight as f64);
        gauge!("llm_tr_rate", &labels).set(self.state.rate);
        gauge!("llm_tr_bucket", &labels).set(self.state.bucket);
        gauge!("llm_tr_debt", &labels).set(self.state.debt);

        debug!(
            target: "llm_admission::stats",
            provider = %self.ctx.provider,
            model = %self.ctx.model,
            cwnd = self.state.cwnd,
            inflight = self.state.inflight,
            rate = self.state.rate,
            bucket = self.state.bucket,
            debt = self.state.debt,
            "Limiter state"
        );
    }
}

#[derive(Debug)]
pub struct SignalObserved<'a> {
    pub ctx: &'a RequestMeta,
    pub signal: Signal,
}

impl InternalEvent for SignalObserved<'_> {
    fn emit(self) {
        let [provider, model, tenant] = labels(self.ctx);
        counter!(
            "llm_errors_total",
            &[provider, model, tenant, ("signal", self.signal.name().to_owned())]
        )
        .increment(1);

        match self.signal {
            Signal::RateLimit { retry_after } => warn!(
                target: "llm_admission::stats",
                provider = %self.ctx.provider,
                model = %self.ctx.model,
                retry_after_ms = retry_after.map(|d| d.as_millis()),
                "Rate limited by downstream"
            ),
            Signal::SoftLoss { reason } => warn!(
                target: "llm_admission::stats",
                provider = %self.ctx.provider,
                model = %self.ctx.model,
                ?reason,
                "Soft loss"
            ),
            _ => debug!(
                target: "llm_admission::stats",
                provider = %self.ctx.provider,
                model = %self.ctx.model,
                signal = self.signal.name(),
                "Call failed without congestion signal"
            ),
        }
    }
}

#[derive(Debug)]
pub struct LatencyObserved<'a> {
    pub ctx: &'a RequestMeta,
    pub latency: Latency,
}

impl InternalEvent for LatencyObserved<'_> {
    fn emit(self) {
        let labels = labels(self.ctx);
        if let Some(first_token) = self.latency.first_token {
            histogram!("llm_latency_first_token_seconds", &labels).record(first_token);
        }
        histogram!("llm_latency_total_seconds", &labels).record(self.latency.total);
    }
}

#[derive(Debug)]
pub struct RetryScheduled<'a> {
    pub ctx: &'a RequestMeta,
}

impl InternalEvent for RetryScheduled<'_> {
    fn emit(self) {
        counter!("llm_retries_total", &labels(self.ctx)).increment(1);
    }
}
