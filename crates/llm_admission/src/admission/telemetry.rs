//! Passive observers of controller activity.
//!
//! Every callback is optional and must return promptly: sinks run inline on
//! the admission and completion paths.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use super::{
    internal_event::{
        LatencyObserved, LimiterStateObserved, QueueWaitObserved, RetryScheduled,
        SignalObserved, emit,
    },
    lock,
    types::{Latency, LimiterSnapshot, RequestMeta, Signal},
};

pub trait TelemetrySink: Send + Sync {
    fn on_queue_wait(&self, _waited: Duration, _ctx: &RequestMeta) {}

    fn on_limiter_state(&self, _state: &LimiterSnapshot, _ctx: &RequestMeta) {}

    /// Called with the classified signal of every unsuccessful attempt.
    fn on_error(&self, _signal: Signal, _ctx: &RequestMeta) {}

    fn on_latency(&self, _latency: Latency, _ctx: &RequestMeta) {}

    fn on_retry(&self, _ctx: &RequestMeta) {}
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopTelemetry;

impl TelemetrySink for NoopTelemetry {}

/// Logs queue waits, limiter state and error signals through `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn on_queue_wait(&self, waited: Duration, ctx: &RequestMeta) {
        info!(
            queue_wait_ms = waited.as_millis(),
            provider = %ctx.provider,
            model = %ctx.model,
            "Request admitted"
        );
    }

    fn on_limiter_state(&self, state: &LimiterSnapshot, ctx: &RequestMeta) {
        info!(
            cwnd = state.cwnd,
            inflight = state.inflight,
            rate = format_args!("{:.2}", state.rate),
            bucket = format_args!("{:.1}", state.bucket),
            debt = format_args!("{:.1}", state.debt),
            provider = %ctx.provider,
            model = %ctx.model,
            "Limiter state"
        );
    }

    fn on_error(&self, signal: Signal, ctx: &RequestMeta) {
        warn!(
            signal = signal.name(),
            provider = %ctx.provider,
            model = %ctx.model,
            "Downstream error"
        );
    }
}

/// Records through the `metrics` facade, labelled by provider, model and tenant.
#[derive(Clone, Copy, Debug, Default)]
pub struct MetricsTelemetry;

impl TelemetrySink for MetricsTelemetry {
    fn on_queue_wait(&self, waited: Duration, ctx: &RequestMeta) {
        emit(QueueWaitObserved { ctx, waited });
    }

    fn on_limiter_state(&self, state: &LimiterSnapshot, ctx: &RequestMeta) {
        emit(LimiterStateObserved { ctx, state });
    }

    fn on_error(&self, signal: Signal, ctx: &RequestMeta) {
        emit(SignalObserved { ctx, signal });
    }

    fn on_latency(&self, latency: Latency, ctx: &RequestMeta) {
        emit(LatencyObserved { ctx, latency });
    }

    fn on_retry(&self, ctx: &RequestMeta) {
        emit(RetryScheduled { ctx });
    }
}

/// Forwards every callback to each inner sink, in order.
#[derive(Clone, Default)]
pub struct FanoutTelemetry {
    sinks: Vec<Arc<dyn TelemetrySink>>,
}

impl FanoutTelemetry {
    pub fn new(sinks: Vec<Arc<dyn TelemetrySink>>) -> Self {
        Self { sinks }
    }

    pub fn push(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl TelemetrySink for FanoutTelemetry {
    fn on_queue_wait(&self, waited: Duration, ctx: &RequestMeta) {
        self.sinks.iter().for_each(|s| s.on_queue_wait(waited, ctx));
    }

    fn on_limiter_state(&self, state: &LimiterSnapshot, ctx: &RequestMeta) {
        self.sinks.iter().for_each(|s| s.on_limiter_state(state, ctx));
    }

    fn on_error(&self, signal: Signal, ctx: &RequestMeta) {
        self.sinks.iter().for_each(|s| s.on_error(signal, ctx));
    }

    fn on_latency(&self, latency: Latency, ctx: &RequestMeta) {
        self.sinks.iter().for_each(|s| s.on_latency(latency, ctx));
    }

    fn on_retry(&self, ctx: &RequestMeta) {
        self.sinks.iter().for_each(|s| s.on_retry(ctx));
    }
}

/// Keeps every observation; meant for tests and simulations.
#[derive(Debug, Default)]
pub struct InMemoryTelemetry {
    queue_waits: Mutex<Vec<(Duration, RequestMeta)>>,
    limiter_states: Mutex<Vec<(LimiterSnapshot, RequestMeta)>>,
    errors: Mutex<Vec<(Signal, RequestMeta)>>,
    latencies: Mutex<Vec<(Latency, RequestMeta)>>,
    retries: Mutex<Vec<RequestMeta>>,
}

impl InMemoryTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_waits(&self) -> Vec<(Duration, RequestMeta)> {
        lock(&self.queue_waits).clone()
    }

    pub fn limiter_states(&self) -> Vec<(LimiterSnapshot, RequestMeta)> {
        lock(&self.limiter_states).clone()
    }

    pub fn errors(&self) -> Vec<(Signal, RequestMeta)> {
        lock(&self.errors).clone()
    }

    pub fn latencies(&self) -> Vec<(Latency, RequestMeta)> {
        lock(&self.latencies).clone()
    }

    pub fn retries(&self) -> Vec<RequestMeta> {
        lock(&self.retries).clone()
    }
}

impl TelemetrySink for InMemoryTelemetry {
    fn on_queue_wait(&self, waited: Duration, ctx: &RequestMeta) {
        lock(&self.queue_waits).push((waited, ctx.clone()));
    }

    fn on_limiter_state(&self, state: &LimiterSnapshot, ctx: &RequestMeta) {
        lock(&self.limiter_states).push((*state, ctx.clone()));
    }

    fn on_error(&self, signal: Signal, ctx: &RequestMeta) {
        lock(&self.errors).push((signal, ctx.clone()));
    }

    fn on_latency(&self, latency: Latency, ctx: &RequestMeta) {
        lock(&self.latencies).push((latency, ctx.clone()));
    }

    fn on_retry(&self, ctx: &RequestMeta) {
        lock(&self.retries).push(ctx.clone());
    }
}
