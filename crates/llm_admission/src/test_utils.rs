use futures::future::{Ready, ready};

use crate::admission::{
    ConcurrencyLimiterSettings,
    error::CallError,
    types::{RequestMeta, ResponseMeta, RunResult},
};

pub(crate) fn request(provider: &str) -> RequestMeta {
    RequestMeta::builder().provider(provider).model("demo").build()
}

/// A window that starts at `cwnd_init` slots.
pub(crate) fn window(cwnd_init: f64) -> ConcurrencyLimiterSettings {
    ConcurrencyLimiterSettings::builder()
        .cwnd_init(cwnd_init)
        .build()
}

/// A downstream call that succeeds immediately.
pub(crate) fn ok_call<T>(
    result: T,
    meta: ResponseMeta,
) -> impl FnOnce() -> Ready<Result<RunResult<T>, CallError>> {
    move || ready(Ok(RunResult::new(result, meta)))
}

/// A downstream call that fails immediately.
pub(crate) fn failing_call<T>(error: CallError) -> impl FnOnce() -> Ready<Result<RunResult<T>, CallError>> {
    move || ready(Err(error))
}

#[track_caller]
pub(crate) fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < 1e-9,
        "expected {expected}, got {actual}"
    );
}
