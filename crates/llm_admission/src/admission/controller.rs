use std::{
    collections::HashMap,
    fmt,
    future::Future,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use chrono::Utc;
use snafu::ResultExt;
use tokio::{sync::Notify, time::sleep};

use super::{
    ControlConfig,
    bundle::{BundleRegistry, SharedBundle},
    error::{AdmissionError, CallError, LimiterSnafu, QueueOverflowSnafu, QueueTimeoutSnafu},
    estimator::{CostEstimator, EwmaEstimator},
    headers::{MAX_RETRY_AFTER, RemoteLimits},
    instant_now, lock,
    signals::{BasicSignalClassifier, SignalClassifier},
    telemetry::{NoopTelemetry, TelemetrySink},
    types::{CostEstimate, Latency, LimiterSnapshot, RequestMeta, ResponseMeta, RunResult, Signal},
};

/// Upper bound between two capacity checks of a waiting request.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Admits calls against per-partition token and concurrency limiters and feeds
/// each call's outcome back into them.
///
/// A controller is shared by reference (typically behind an `Arc`) between all
/// tasks issuing calls. Every limiter bundle is guarded by its own lock; the
/// queue counter and the rate-limit cool-down are shared by all bundles.
///
/// ```rust
/// use llm_admission::admission::{
///     AdmissionController, ControlConfig,
///     error::CallError,
///     types::{RequestMeta, ResponseMeta, RunResult},
/// };
///
/// # tokio_test::block_on(async {
/// let controller = AdmissionController::new(ControlConfig::default());
/// let request = RequestMeta::builder().provider("sim").model("demo").build();
///
/// let reply = controller
///     .run(request, || async {
///         Ok::<_, CallError>(RunResult::new("hello", ResponseMeta::ok().with_tokens(Some(3), Some(1))))
///     })
///     .await
///     .unwrap();
/// assert_eq!(reply.result, "hello");
/// # });
/// ```
pub struct AdmissionController {
    config: ControlConfig,
    bundles: BundleRegistry,
    estimator: Arc<dyn CostEstimator>,
    classifier: Arc<dyn SignalClassifier>,
    telemetry: Arc<dyn TelemetrySink>,
    queued: AtomicUsize,
    cooldown_until: Mutex<Option<Instant>>,
    released: Notify,
    // Output tokens streamed so far, keyed by request id, for calls in flight.
    streams: Mutex<HashMap<String, Option<u64>>>,
}

impl AdmissionController {
    pub fn new(config: ControlConfig) -> Self {
        Self {
            bundles: BundleRegistry::new(&config),
            config,
            estimator: Arc::new(EwmaEstimator::new()),
            classifier: Arc::new(BasicSignalClassifier),
            telemetry: Arc::new(NoopTelemetry),
            queued: AtomicUsize::new(0),
            cooldown_until: Mutex::new(None),
            released: Notify::new(),
            streams: Mutex::default(),
        }
    }

    pub fn with_estimator(mut self, estimator: Arc<dyn CostEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn SignalClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    pub(crate) fn telemetry(&self) -> &Arc<dyn TelemetrySink> {
        &self.telemetry
    }

    /// Number of requests currently waiting for capacity.
    pub fn queue_len(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// Snapshot of the bundle `request` maps to, creating the bundle if needed.
    pub fn limiter_state(&self, request: &RequestMeta) -> LimiterSnapshot {
        let bundle = self.bundles.resolve(request, instant_now());
        lock(&bundle).snapshot()
    }

    /// Adds `delta` streamed output tokens to the running total of the call
    /// identified by `request_id`. Ids of calls that are not executing are ignored.
    pub fn on_stream_token(&self, request_id: &str, delta: u64) {
        if let Some(total) = lock(&self.streams).get_mut(request_id) {
            *total = Some(total.unwrap_or(0) + delta);
        }
    }

    /// Waits for capacity, executes `call` and settles its outcome.
    ///
    /// Fails with [`AdmissionError::QueueOverflow`] or
    /// [`AdmissionError::QueueTimeout`] without invoking `call`. A failing
    /// `call` is returned as [`AdmissionError::Call`] once the limiters, the
    /// estimator and telemetry have processed it.
    pub async fn run<T, F, Fut>(
        &self,
        mut request: RequestMeta,
        call: F,
    ) -> Result<RunResult<T>, AdmissionError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<RunResult<T>, CallError>>,
    {
        let id = request
            .id
            .get_or_insert_with(|| {
                format!(
                    "req-{}-{:08x}",
                    Utc::now().timestamp_millis(),
                    rand::random::<u32>()
                )
            })
            .clone();

        let bundle = self.bundles.resolve(&request, instant_now());
        let estimate = self.estimator.estimate(&request);

        self.admit(&request, &bundle, estimate.total()).await?;

        let in_flight = InFlight::start(self, &bundle, &id);
        let started_at = instant_now();
        let outcome = call().await;
        let ended_at = instant_now();
        let streamed = in_flight.finish();

        match outcome {
            Ok(RunResult { result, meta }) => {
                let meta = meta.fill_timing(started_at, ended_at);
                self.complete(&request, &bundle, estimate, streamed, &meta);
                Ok(RunResult::new(result, meta))
            }
            Err(error) => {
                let meta = error.settlement_meta(started_at, ended_at);
                self.complete(&request, &bundle, estimate, streamed, &meta);
                Err(AdmissionError::Call { source: error })
            }
        }
    }

    async fn admit(
        &self,
        request: &RequestMeta,
        bundle: &SharedBundle,
        cost: f64,
    ) -> Result<(), AdmissionError> {
        let enqueued_at = instant_now();
        let deadline = enqueued_at + self.config.queue.timeout();
        let _queued = QueueSlot::enter(&self.queued, self.config.queue.max_size)?;

        loop {
            let now = instant_now();
            if now >= deadline {
                let waited = now.saturating_duration_since(enqueued_at);
                debug!(message = "Request timed out in queue.", ?waited, provider = %request.provider);
                return QueueTimeoutSnafu { waited }.fail();
            }

            let cooling = self.cooling_down(now);
            let admitted = {
                let mut bundle = lock(bundle);
                bundle.tokens.refill(now);
                let ready = !cooling
                    && bundle.tokens.can_acquire(cost)
                    && bundle.concurrency.can_acquire();
                if ready {
                    bundle.tokens.acquire(cost).context(LimiterSnafu)?;
                    bundle.concurrency.acquire().context(LimiterSnafu)?;
                }
                ready
            };

            if admitted {
                let waited = now.saturating_duration_since(enqueued_at);
                debug!(message = "Request admitted.", ?waited, cost, provider = %request.provider);
                self.telemetry.on_queue_wait(waited, request);
                return Ok(());
            }

            let tick = POLL_INTERVAL.min(deadline.saturating_duration_since(now));
            if cooling {
                sleep(tick).await;
            } else {
                // Released slots wake waiters early; the tick bounds the wait otherwise.
                let _ = tokio::time::timeout(tick, self.released.notified()).await;
            }
        }
    }

    fn cooling_down(&self, now: Instant) -> bool {
        lock(&self.cooldown_until).is_some_and(|until| now < until)
    }

    fn extend_cooldown(&self, until: Instant) {
        let mut cooldown = lock(&self.cooldown_until);
        *cooldown = Some(cooldown.map_or(until, |current| current.max(until)));
    }

    fn complete(
        &self,
        request: &RequestMeta,
        bundle: &SharedBundle,
        estimate: CostEstimate,
        streamed_output: Option<u64>,
        meta: &ResponseMeta,
    ) {
        let output_tokens = meta
            .output_tokens
            .or(streamed_output)
            .map_or(estimate.output_tokens, |tokens| tokens as f64);
        let input_tokens = meta
            .input_tokens
            .map_or(estimate.input_tokens, |tokens| tokens as f64);
        let actual = input_tokens + output_tokens;
        let delay_threshold = self
            .config
            .concurrency_limiter
            .delay_threshold_ms
            .and_then(|ms| Duration::try_from_secs_f64(ms / 1000.0).ok());

        // Release precedes the estimator and classifier, which may panic.
        let (signal, state) = {
            let mut bundle = lock(bundle);
            bundle.concurrency.release();
            bundle.tokens.settle(estimate.total(), actual);

            self.estimator.settle(request, meta);
            let remote = RemoteLimits::from_headers(
                &meta.headers,
                &self.config.header_names(&request.provider),
            );
            let signal = self.classifier.classify(meta);

            if remote.advertises_capacity() {
                bundle
                    .tokens
                    .apply_remote_limit(remote.limit_tokens, remote.remaining_tokens);
                bundle.tokens.apply_remote_rate(
                    remote.limit_tokens,
                    remote.window_seconds,
                    remote.reset,
                );
            }

            match signal {
                Signal::Success => {
                    if let Some(first_token) = meta.first_token_latency() {
                        if bundle.observe_first_token(first_token, delay_threshold) {
                            debug!(message = "Queueing delay detected.", ?first_token, cwnd = bundle.concurrency.cwnd());
                        }
                    }
                    bundle.tokens.on_success();
                    bundle.concurrency.on_success();
                }
                Signal::RateLimit { .. } => {
                    bundle.tokens.on_loss();
                    bundle.concurrency.on_loss();
                }
                Signal::SoftLoss { .. } => {
                    bundle.tokens.on_soft_loss();
                    bundle.concurrency.on_loss();
                }
                Signal::ClientError | Signal::Unknown => {}
            }
            (signal, bundle.snapshot())
        };

        match signal {
            Signal::RateLimit { retry_after } => {
                warn!(
                    message = "Rate limited by downstream.",
                    ?retry_after,
                    rate = state.rate,
                    cwnd = state.cwnd,
                    provider = %request.provider,
                );
                if let Some(retry_after) = retry_after {
                    let now = instant_now();
                    let until = now
                        .checked_add(retry_after.min(MAX_RETRY_AFTER))
                        .unwrap_or(now);
                    self.extend_cooldown(until);
                }
            }
            Signal::SoftLoss { reason } => {
                warn!(
                    message = "Soft loss from downstream.",
                    ?reason,
                    rate = state.rate,
                    cwnd = state.cwnd,
                    provider = %request.provider,
                );
            }
            _ => {}
        }
        self.released.notify_waiters();

        debug!(
            message = "Call settled.",
            signal = signal.name(),
            predicted = estimate.total(),
            actual,
            rate = state.rate,
            cwnd = state.cwnd,
        );

        self.telemetry.on_limiter_state(&state, request);
        self.telemetry.on_latency(
            Latency {
                first_token: meta.first_token_latency(),
                total: meta.total_latency().unwrap_or_default(),
            },
            request,
        );
        if !signal.is_success() {
            self.telemetry.on_error(signal, request);
        }
    }
}

impl fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionController")
            .field("config", &self.config)
            .field("bundles", &self.bundles.len())
            .field("queued", &self.queue_len())
            .finish_non_exhaustive()
    }
}

/// One position in the admission queue, given back on drop.
struct QueueSlot<'a> {
    queued: &'a AtomicUsize,
}

impl<'a> QueueSlot<'a> {
    // The bound is checked before incrementing, so a rejected request never counts.
    fn enter(queued: &'a AtomicUsize, max_size: usize) -> Result<Self, AdmissionError> {
        if queued
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |len| {
                (len < max_size).then_some(len + 1)
            })
            .is_err()
        {
            return QueueOverflowSnafu { max_size }.fail();
        }
        Ok(Self { queued })
    }
}

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.queued.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A call holding a concurrency slot. Dropped without `finish` (the `run`
/// future was cancelled), it returns the slot without adjusting any limiter.
struct InFlight<'a> {
    controller: &'a AdmissionController,
    bundle: &'a SharedBundle,
    id: &'a str,
    armed: bool,
}

impl<'a> InFlight<'a> {
    fn start(controller: &'a AdmissionController, bundle: &'a SharedBundle, id: &'a str) -> Self {
        lock(&controller.streams).insert(id.to_owned(), None);
        Self {
            controller,
            bundle,
            id,
            armed: true,
        }
    }

    /// Hands the slot over to completion handling and returns the streamed total.
    fn finish(mut self) -> Option<u64> {
        self.armed = false;
        lock(&self.controller.streams).remove(self.id).flatten()
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        lock(&self.controller.streams).remove(self.id);
        lock(self.bundle).concurrency.release();
        self.controller.released.notify_waiters();
        debug!(message = "Call cancelled; concurrency slot released.", id = %self.id);
    }
}

#[cfg(test)]
mod tests {
    use futures::{FutureExt, future::BoxFuture};
    use http::{HeaderValue, StatusCode, header::RETRY_AFTER};
    use tokio::sync::oneshot;

    use super::*;
    use crate::{
        admission::{
            ConcurrencyLimiterSettings, Dimension, QueueSettings, RateLimitHeaderNames,
            telemetry::InMemoryTelemetry,
            types::{ErrorKind, SoftLossReason},
        },
        test_utils::{assert_close, failing_call, ok_call, request, window},
    };

    fn controller(config: ControlConfig) -> (AdmissionController, Arc<InMemoryTelemetry>) {
        let telemetry = Arc::new(InMemoryTelemetry::new());
        let controller = AdmissionController::new(config).with_telemetry(telemetry.clone());
        (controller, telemetry)
    }

    fn held_call(
        rx: oneshot::Receiver<()>,
    ) -> impl FnOnce() -> BoxFuture<'static, Result<RunResult<()>, CallError>> {
        move || {
            async move {
                let _ = rx.await;
                Ok(RunResult::new((), ResponseMeta::ok()))
            }
            .boxed()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn success_grows_both_limiters() {
        let (controller, telemetry) = controller(ControlConfig::default());
        let req = request("sim");

        let reply = controller
            .run(req.clone(), ok_call("done", ResponseMeta::ok()))
            .await
            .unwrap();

        assert_eq!(reply.result, "done");
        assert!(reply.meta.started_at.is_some() && reply.meta.ended_at.is_some());

        let state = controller.limiter_state(&req);
        assert_eq!(state.rate, 550.0);
        assert_eq!(state.cwnd, 5.0);
        assert_eq!(state.inflight, 0);

        assert_eq!(telemetry.queue_waits().len(), 1);
        assert_eq!(telemetry.limiter_states().len(), 1);
        assert_eq!(telemetry.latencies().len(), 1);
        assert!(telemetry.errors().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn overflow_rejects_without_enqueueing() {
        let config = ControlConfig::builder()
            .queue(QueueSettings::builder().max_size(1).timeout_ms(10_000).build())
            .concurrency_limiter(window(1.0))
            .build();
        let (controller, _) = controller(config);
        let controller = Arc::new(controller);

        let (release, rx) = oneshot::channel();
        let holder = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.run(request("sim"), held_call(rx)).await })
        };
        sleep(Duration::from_millis(1)).await;

        let waiter = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move {
                controller
                    .run(request("sim"), ok_call((), ResponseMeta::ok()))
                    .await
            })
        };
        sleep(Duration::from_millis(1)).await;
        assert_eq!(controller.queue_len(), 1);

        let mut called = false;
        let rejected = controller
            .run(request("sim"), || {
                called = true;
                async { Ok::<_, CallError>(RunResult::new((), ResponseMeta::ok())) }
            })
            .await;
        assert!(matches!(
            rejected,
            Err(AdmissionError::QueueOverflow { max_size: 1 })
        ));
        assert!(!called);
        assert_eq!(controller.queue_len(), 1);

        release.send(()).unwrap();
        holder.await.unwrap().unwrap();
        waiter.await.unwrap().unwrap();
        assert_eq!(controller.queue_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_releases_the_queue_position() {
        let config = ControlConfig::builder()
            .queue(QueueSettings::builder().max_size(1).timeout_ms(100).build())
            .concurrency_limiter(window(1.0))
            .build();
        let (controller, _) = controller(config);
        let controller = Arc::new(controller);

        let (release, rx) = oneshot::channel();
        let holder = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.run(request("sim"), held_call(rx)).await })
        };
        sleep(Duration::from_millis(1)).await;

        let timed_out = controller
            .run(request("sim"), ok_call((), ResponseMeta::ok()))
            .await;
        match timed_out {
            Err(AdmissionError::QueueTimeout { waited }) => {
                assert!(waited >= Duration::from_millis(100), "{waited:?}")
            }
            other => panic!("expected a queue timeout, got {other:?}"),
        }
        assert_eq!(controller.queue_len(), 0);

        release.send(()).unwrap();
        holder.await.unwrap().unwrap();
        controller
            .run(request("sim"), ok_call((), ResponseMeta::ok()))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_blocks_every_bundle() {
        let config = ControlConfig::builder()
            .queue(QueueSettings::builder().timeout_ms(5_000).build())
            .dimensions(vec![Dimension::Provider])
            .build();
        let (controller, telemetry) = controller(config);

        let limited = ResponseMeta::new(StatusCode::TOO_MANY_REQUESTS)
            .with_header(RETRY_AFTER, HeaderValue::from_static("1"));
        let err = controller
            .run(request("a"), || async move {
                Err::<RunResult<()>, _>(CallError::response(limited, "slow down"))
            })
            .await
            .unwrap_err();
        assert_eq!(
            err.response_meta().map(|meta| meta.status),
            Some(StatusCode::TOO_MANY_REQUESTS)
        );

        let a = controller.limiter_state(&request("a"));
        assert_close(a.rate, 350.0);
        assert_close(a.cwnd, 2.8);

        let start = tokio::time::Instant::now();
        controller
            .run(request("b"), ok_call((), ResponseMeta::ok()))
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_secs(1));

        let b = controller.limiter_state(&request("b"));
        assert_eq!(b.rate, 550.0);
        assert_eq!(
            telemetry.errors()[0].0,
            Signal::RateLimit {
                retry_after: Some(Duration::from_secs(1))
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn streamed_tokens_settle_when_the_response_has_no_count() {
        let (controller, _) = controller(ControlConfig::default());
        let req = RequestMeta::builder()
            .provider("sim")
            .model("demo")
            .id("stream-1".to_owned())
            .build();

        let c = &controller;
        c.run(req.clone(), || async move {
            c.on_stream_token("stream-1", 200);
            c.on_stream_token("stream-1", 100);
            c.on_stream_token("unknown", 5);
            Ok::<_, CallError>(RunResult::new((), ResponseMeta::ok()))
        })
        .await
        .unwrap();

        // Estimated 128 output tokens, streamed 300.
        let state = controller.limiter_state(&req);
        assert_close(state.debt, 172.0);
        assert_close(state.bucket, 2000.0 - 128.0);

        controller.on_stream_token("stream-1", 10);
        assert!(lock(&controller.streams).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn bundles_are_isolated_per_partition() {
        let config = ControlConfig::builder()
            .dimensions(vec![Dimension::Provider])
            .build();
        let (controller, _) = controller(config);

        controller
            .run(request("a"), ok_call((), ResponseMeta::ok()))
            .await
            .unwrap();

        assert_eq!(controller.limiter_state(&request("a")).rate, 550.0);
        assert_eq!(controller.limiter_state(&request("b")).rate, 500.0);
        assert_eq!(controller.limiter_state(&request("b")).cwnd, 4.0);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_after_successes_lowers_rate_and_window() {
        let (controller, _) = controller(ControlConfig::default());
        let req = request("sim");

        for _ in 0..2 {
            controller
                .run(req.clone(), ok_call((), ResponseMeta::ok()))
                .await
                .unwrap();
        }
        let before = controller.limiter_state(&req);
        assert_eq!(before.rate, 600.0);
        assert_eq!(before.cwnd, 6.0);

        let _ = controller
            .run(req.clone(), || async {
                Err::<RunResult<()>, _>(CallError::response(
                    ResponseMeta::new(StatusCode::TOO_MANY_REQUESTS),
                    "limited",
                ))
            })
            .await;

        let after = controller.limiter_state(&req);
        assert!(after.rate < before.rate);
        assert!(after.cwnd < before.cwnd);
        assert_close(after.rate, 420.0);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_headers_overwrite_bucket_and_ceiling() {
        let (controller, _) = controller(ControlConfig::default());
        let req = request("sim");

        let meta = ResponseMeta::ok()
            .with_header(
                "x-ratelimit-remaining-tokens".parse().unwrap(),
                HeaderValue::from_static("20"),
            )
            .with_header(
                "x-ratelimit-limit-tokens".parse().unwrap(),
                HeaderValue::from_static("100"),
            )
            .with_header(
                "x-ratelimit-window-seconds".parse().unwrap(),
                HeaderValue::from_static("10"),
            );
        controller.run(req.clone(), ok_call((), meta)).await.unwrap();

        let state = controller.limiter_state(&req);
        assert_eq!(state.bucket_cap, 100.0);
        assert_eq!(state.bucket, 20.0);
        assert_eq!(state.max_rate, 10.0);
        assert_eq!(state.rate, 10.0);
    }

    #[tokio::test(start_paused = true)]
    async fn provider_header_overrides_are_case_insensitive() {
        let config = ControlConfig::builder()
            .rate_limit_headers(
                [(
                    "acme".to_owned(),
                    RateLimitHeaderNames::builder()
                        .remaining_tokens_header("X-Acme-Remaining".to_owned())
                        .build(),
                )]
                .into(),
            )
            .build();
        let (controller, _) = controller(config);

        let meta = ResponseMeta::ok().with_header(
            "x-acme-remaining".parse().unwrap(),
            HeaderValue::from_static("7"),
        );
        controller
            .run(request("acme"), ok_call((), meta))
            .await
            .unwrap();

        let state = controller.limiter_state(&request("acme"));
        assert_eq!(state.bucket, 7.0);
        assert_eq!(state.bucket_cap, 2000.0);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failures_are_soft_losses() {
        let (controller, telemetry) = controller(ControlConfig::default());
        let req = request("sim");

        let err = controller
            .run(req.clone(), failing_call::<()>(CallError::transport("connection reset")))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AdmissionError::Call {
                source: CallError::Transport { .. }
            }
        ));

        let state = controller.limiter_state(&req);
        assert_close(state.rate, 425.0);
        assert_close(state.cwnd, 2.8);
        assert_eq!(state.inflight, 0);
        assert_eq!(
            telemetry.errors()[0].0,
            Signal::SoftLoss {
                reason: SoftLossReason::ServerError
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_are_soft_losses_and_client_errors_are_not_losses() {
        let (controller, telemetry) = controller(ControlConfig::default());
        let req = request("sim");

        let _ = controller
            .run(req.clone(), || async {
                Err::<RunResult<()>, _>(CallError::response(
                    ResponseMeta::new(StatusCode::BAD_REQUEST),
                    "bad prompt",
                ))
            })
            .await;
        let state = controller.limiter_state(&req);
        assert_eq!(state.rate, 500.0);
        assert_eq!(state.cwnd, 4.0);
        assert_eq!(telemetry.errors()[0].0, Signal::ClientError);

        let _ = controller
            .run(req.clone(), || async {
                Err::<RunResult<()>, _>(CallError::response(
                    ResponseMeta::new(StatusCode::GATEWAY_TIMEOUT)
                        .with_error_kind(ErrorKind::Timeout),
                    "upstream timeout",
                ))
            })
            .await;
        let state = controller.limiter_state(&req);
        assert_close(state.rate, 425.0);
        assert_eq!(
            telemetry.errors()[1].0,
            Signal::SoftLoss {
                reason: SoftLossReason::Timeout
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn first_token_delay_shrinks_the_window() {
        let config = ControlConfig::builder()
            .concurrency_limiter(
                ConcurrencyLimiterSettings::builder()
                    .delay_decrease(0.5)
                    .delay_threshold_ms(50.0)
                    .build(),
            )
            .build();
        let (controller, _) = controller(config);
        let req = request("sim");

        for first_token_ms in [100, 400] {
            controller
                .run(req.clone(), move || async move {
                    let start = instant_now();
                    let meta = ResponseMeta::ok().with_timing(
                        start,
                        Some(start + Duration::from_millis(first_token_ms)),
                        start + Duration::from_millis(500),
                    );
                    Ok::<_, CallError>(RunResult::new((), meta))
                })
                .await
                .unwrap();
        }

        // Seeded at 100ms (4 -> 5), then 240ms of queueing delay: 5 * 0.5 + 1.
        let state = controller.limiter_state(&req);
        assert_close(state.cwnd, 3.5);
        assert_close(state.baseline_ftl.unwrap().as_secs_f64(), 0.160);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_calls_return_their_slot() {
        let config = ControlConfig::builder()
            .concurrency_limiter(window(1.0))
            .build();
        let (controller, telemetry) = controller(config);
        let req = request("sim");

        let cancelled = tokio::time::timeout(
            Duration::from_millis(50),
            controller.run(req.clone(), || std::future::pending::<Result<RunResult<()>, CallError>>()),
        )
        .await;
        assert!(cancelled.is_err());

        let state = controller.limiter_state(&req);
        assert_eq!(state.inflight, 0);
        assert_eq!(state.cwnd, 1.0);
        assert!(telemetry.limiter_states().is_empty());
        assert!(lock(&controller.streams).is_empty());

        controller
            .run(req, ok_call((), ResponseMeta::ok()))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn zero_queue_timeout_rejects_before_checking_capacity() {
        let config = ControlConfig::builder()
            .queue(QueueSettings::builder().timeout_ms(0).build())
            .build();
        let (controller, _) = controller(config);

        let mut called = false;
        let rejected = controller
            .run(request("sim"), || {
                called = true;
                async { Ok::<_, CallError>(RunResult::new((), ResponseMeta::ok())) }
            })
            .await;
        assert!(matches!(rejected, Err(AdmissionError::QueueTimeout { .. })));
        assert!(!called);
        assert_eq!(controller.queue_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_retry_after_is_capped_and_settles_normally() {
        for value in ["1e20", "10000000000000000000"] {
            let config = ControlConfig::builder()
                .queue(QueueSettings::builder().timeout_ms(100).build())
                .concurrency_limiter(window(1.0))
                .build();
            let (controller, telemetry) = controller(config);
            let req = request("sim");

            let limited = controller
                .run(
                    req.clone(),
                    failing_call::<()>(CallError::response(
                        ResponseMeta::new(StatusCode::TOO_MANY_REQUESTS)
                            .with_header(RETRY_AFTER, HeaderValue::from_static(value)),
                        "limited",
                    )),
                )
                .await;
            assert!(matches!(limited, Err(AdmissionError::Call { .. })), "{value}");
            assert_eq!(controller.limiter_state(&req).inflight, 0, "{value}");
            assert_eq!(telemetry.errors().len(), 1);

            let cooldown = *lock(&controller.cooldown_until);
            assert!(cooldown.unwrap() <= instant_now() + MAX_RETRY_AFTER, "{value}");

            let blocked = controller.run(req, ok_call((), ResponseMeta::ok())).await;
            assert!(matches!(blocked, Err(AdmissionError::QueueTimeout { .. })), "{value}");
        }
    }

    struct PanickingClassifier;

    impl SignalClassifier for PanickingClassifier {
        fn classify(&self, _meta: &ResponseMeta) -> Signal {
            panic!("classifier failure");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn panic_during_settlement_still_returns_the_slot() {
        let config = ControlConfig::builder()
            .concurrency_limiter(window(1.0))
            .build();
        let controller = Arc::new(
            AdmissionController::new(config).with_classifier(Arc::new(PanickingClassifier)),
        );
        let req = request("sim");

        let task = {
            let controller = Arc::clone(&controller);
            let req = req.clone();
            tokio::spawn(async move { controller.run(req, ok_call((), ResponseMeta::ok())).await })
        };
        assert!(task.await.unwrap_err().is_panic());

        assert_eq!(controller.limiter_state(&req).inflight, 0);
        assert_eq!(controller.queue_len(), 0);
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            lock(&self.0).extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn losses_are_logged_without_a_telemetry_sink() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let controller = AdmissionController::new(ControlConfig::default());
        for status in [StatusCode::TOO_MANY_REQUESTS, StatusCode::SERVICE_UNAVAILABLE] {
            let _ = controller
                .run(
                    request("sim"),
                    failing_call::<()>(CallError::response(ResponseMeta::new(status), "failed")),
                )
                .await;
        }
        controller
            .run(request("sim"), ok_call((), ResponseMeta::ok()))
            .await
            .unwrap();

        let output = String::from_utf8(lock(&logs.0).clone()).unwrap();
        assert!(output.contains("Rate limited by downstream."), "{output}");
        assert!(output.contains("Soft loss from downstream."), "{output}");
        assert_eq!(output.matches("WARN").count(), 2, "{output}");
    }
}
