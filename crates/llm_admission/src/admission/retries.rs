use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use bon::Builder;
use futures::FutureExt;
use http::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::time::{Sleep, sleep};
use tower::retry::Policy;

use super::{
    error::{AdmissionError, CallError},
    headers::parse_retry_after,
    service::AdmissionRequest,
    telemetry::{NoopTelemetry, TelemetrySink},
    types::{ErrorKind, RequestMeta, ResponseMeta, RunResult},
};

/// Retry bounds and backoff shape.
///
/// Attempt `n` (1-based) waits `base_delay_ms * n`, moved by a uniform jitter
/// of total width `jitter_ratio * base_delay_ms * n` centered on that value.
/// A `Retry-After` header on the failure replaces the computed delay.
#[derive(Clone, Copy, Debug, PartialEq, Builder, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrySettings {
    /// Attempts made after the first one.
    ///
    /// **Default**: 2
    #[builder(default = default_max_retries())]
    #[serde(default = "default_max_retries")]
    pub(super) max_retries: usize,

    /// **Default**: 200
    #[builder(default = default_base_delay_ms())]
    #[serde(default = "default_base_delay_ms")]
    pub(super) base_delay_ms: u64,

    /// **Default**: 0.5, i.e. +/-25% of the linear delay.
    #[builder(default = default_jitter_ratio())]
    #[serde(default = "default_jitter_ratio")]
    pub(super) jitter_ratio: f64,
}

const fn default_max_retries() -> usize {
    2
}

const fn default_base_delay_ms() -> u64 {
    200
}

const fn default_jitter_ratio() -> f64 {
    0.5
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            jitter_ratio: default_jitter_ratio(),
        }
    }
}

impl RetrySettings {
    pub fn get_max_retries(&self) -> usize {
        self.max_retries
    }

    /// Jittered delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: usize) -> Duration {
        let base = (self.base_delay_ms as f64) * (attempt as f64);
        let spread = base * self.jitter_ratio.max(0.0);
        let jitter = rand::random::<f64>() * spread - spread / 2.0;
        Duration::from_millis((base + jitter).max(0.0).round() as u64)
    }
}

/// Failures that can tell which response, if any, produced them.
pub trait ResponseMetaSource {
    fn response_meta(&self) -> Option<&ResponseMeta>;
}

impl ResponseMetaSource for CallError {
    fn response_meta(&self) -> Option<&ResponseMeta> {
        CallError::response_meta(self)
    }
}

impl ResponseMetaSource for AdmissionError {
    fn response_meta(&self) -> Option<&ResponseMeta> {
        AdmissionError::response_meta(self)
    }
}

/// Decides which failures are worth another attempt.
pub trait RetryLogic<E>: Clone + Send + Sync + 'static {
    fn is_retriable_error(&self, error: &E) -> bool;

    /// Delay requested by the failure itself; `None` falls back to the backoff.
    fn retry_after(&self, _error: &E) -> Option<Duration> {
        None
    }
}

/// Retries rate limits (429), unavailability (503) and timeouts. Everything
/// else, including failures without a response, is final.
#[derive(Clone, Copy, Debug, Default)]
pub struct TransientRetryLogic;

impl<E: ResponseMetaSource> RetryLogic<E> for TransientRetryLogic {
    fn is_retriable_error(&self, error: &E) -> bool {
        error.response_meta().is_some_and(|meta| {
            meta.status == StatusCode::TOO_MANY_REQUESTS
                || meta.status == StatusCode::SERVICE_UNAVAILABLE
                || meta.error_kind == Some(ErrorKind::Timeout)
        })
    }

    fn retry_after(&self, error: &E) -> Option<Duration> {
        parse_retry_after(&error.response_meta()?.headers)
    }
}

/// Runs an async operation until it succeeds, fails permanently or runs out
/// of retries.
#[derive(Clone)]
pub struct Retrier<L = TransientRetryLogic> {
    settings: RetrySettings,
    logic: L,
    telemetry: Arc<dyn TelemetrySink>,
}

impl Retrier {
    pub fn new(settings: RetrySettings) -> Self {
        Self::with_logic(settings, TransientRetryLogic)
    }
}

impl<L> Retrier<L> {
    pub fn with_logic(settings: RetrySettings, logic: L) -> Self {
        Self {
            settings,
            logic,
            telemetry: Arc::new(NoopTelemetry),
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Calls `operation` at most `max_retries + 1` times. The last failure is
    /// returned unchanged once retries are exhausted.
    pub async fn run<T, E, F, Fut>(&self, ctx: &RequestMeta, mut operation: F) -> Result<T, E>
    where
        L: RetryLogic<E>,
        E: fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !self.logic.is_retriable_error(&error) {
                return Err(error);
            }
            if attempt >= self.settings.max_retries {
                error!(message = "Retries exhausted.", %error, attempts = attempt + 1);
                return Err(error);
            }

            attempt += 1;
            let delay = self
                .logic
                .retry_after(&error)
                .unwrap_or_else(|| self.settings.backoff(attempt));
            warn!(message = "Retrying after error.", %error, attempt, delay_ms = delay.as_millis());
            self.telemetry.on_retry(ctx);
            sleep(delay).await;
        }
    }
}

/// Retries `operation` on transient failures with the given settings.
pub async fn with_retries<T, E, F, Fut>(
    settings: RetrySettings,
    telemetry: Arc<dyn TelemetrySink>,
    ctx: &RequestMeta,
    operation: F,
) -> Result<T, E>
where
    E: ResponseMetaSource + fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    Retrier::new(settings)
        .with_telemetry(telemetry)
        .run(ctx, operation)
        .await
}

/// [`tower::retry::Policy`] for [`AdmissionService`](super::AdmissionService)
/// with the same classification and backoff as [`Retrier`].
#[derive(Clone)]
pub struct RetryPolicy<L = TransientRetryLogic> {
    settings: RetrySettings,
    attempt: usize,
    logic: L,
    telemetry: Arc<dyn TelemetrySink>,
}

pub struct RetryPolicyFuture<L> {
    delay: Pin<Box<Sleep>>,
    policy: RetryPolicy<L>,
}

impl RetryPolicy {
    pub fn new(settings: RetrySettings) -> Self {
        Self::with_logic(settings, TransientRetryLogic)
    }
}

impl<L: Clone> RetryPolicy<L> {
    pub fn with_logic(settings: RetrySettings, logic: L) -> Self {
        Self {
            settings,
            attempt: 0,
            logic,
            telemetry: Arc::new(NoopTelemetry),
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    fn build_retry(&self, delay: Duration) -> RetryPolicyFuture<L> {
        let policy = RetryPolicy {
            settings: self.settings,
            attempt: self.attempt + 1,
            logic: self.logic.clone(),
            telemetry: Arc::clone(&self.telemetry),
        };
        RetryPolicyFuture {
            delay: Box::pin(sleep(delay)),
            policy,
        }
    }
}

impl<R, T, L> Policy<AdmissionRequest<R>, RunResult<T>, AdmissionError> for RetryPolicy<L>
where
    R: Clone,
    L: RetryLogic<AdmissionError>,
{
    type Future = RetryPolicyFuture<L>;

    fn retry(
        &self,
        request: &AdmissionRequest<R>,
        result: Result<&RunResult<T>, &AdmissionError>,
    ) -> Option<Self::Future> {
        let error = result.err()?;
        if !self.logic.is_retriable_error(error) {
            return None;
        }
        if self.attempt >= self.settings.max_retries {
            error!(message = "Retries exhausted.", %error, attempts = self.attempt + 1);
            return None;
        }

        let delay = self
            .logic
            .retry_after(error)
            .unwrap_or_else(|| self.settings.backoff(self.attempt + 1));
        warn!(message = "Retrying after error.", %error, attempt = self.attempt + 1, delay_ms = delay.as_millis());
        self.telemetry.on_retry(&request.meta);
        Some(self.build_retry(delay))
    }

    fn clone_request(&self, request: &AdmissionRequest<R>) -> Option<AdmissionRequest<R>> {
        Some(request.clone())
    }
}

// `L` is never pinned; only the boxed `Sleep` is polled.
impl<L> Unpin for RetryPolicyFuture<L> {}

impl<L: Clone> Future for RetryPolicyFuture<L> {
    type Output = RetryPolicy<L>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        std::task::ready!(self.delay.poll_unpin(cx));
        Poll::Ready(self.policy.clone())
    }
}
