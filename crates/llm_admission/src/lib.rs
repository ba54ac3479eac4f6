//! Admission control for rate- and capacity-constrained LLM APIs
//!
//! Every call goes through an [`AdmissionController`](admission::AdmissionController),
//! which holds it in a bounded queue until two limiters agree to let it through:
//!
//! - a **token-rate limiter**: a token bucket charged with the predicted cost of
//!   the call, refilled at a rate that follows AIMD, with cost overruns paid back
//!   as debt
//! - a **concurrency limiter**: an AIMD window over the number of in-flight calls,
//!   optionally shrunk when first-token latency rises above its baseline
//!
//! When a call completes, its outcome is classified into a congestion signal
//! (success, rate limit, soft loss, client error) and fed back into both
//! limiters. Rate-limit headers advertised by the service tighten the bucket and
//! the rate ceiling, and a `Retry-After` pauses admission for every partition.
//!
//! # Basic Usage
//! ```
//! use llm_admission::admission::{
//!     AdmissionController, ControlConfig,
//!     error::CallError,
//!     types::{RequestMeta, ResponseMeta, RunResult},
//! };
//!
//! # tokio_test::block_on(async {
//! let config = ControlConfig::from_json_str(r#"{ "queue": { "maxSize": 50 } }"#).unwrap();
//! let controller = AdmissionController::new(config);
//!
//! let request = RequestMeta::builder()
//!     .provider("openai")
//!     .model("gpt-4o-mini")
//!     .input_text("Tell me a joke".to_owned())
//!     .build();
//! let reply = controller
//!     .run(request, || async {
//!         Ok::<_, CallError>(RunResult::new("...", ResponseMeta::ok()))
//!     })
//!     .await
//!     .unwrap();
//! # drop(reply);
//! # });
//! ```
//!
//! # Configuration
//! See [`admission::ControlConfig`] for tuning parameters.
//!
//! # Metrics
//! [`admission::telemetry::MetricsTelemetry`] records through the `metrics`
//! facade via the `InternalEvent` trait.
pub mod admission;
#[cfg(test)]
mod test_utils;

#[macro_use]
extern crate tracing;

pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;
