use std::time::{Duration, Instant};

use bon::Builder;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde::{Deserialize, Serialize};

/// Describes one logical call, as seen by the admission controller.
///
/// Immutable for the lifetime of one [`run`](super::AdmissionController::run).
///
/// ```rust
/// use llm_admission::admission::types::RequestMeta;
///
/// let request = RequestMeta::builder()
///     .provider("openai")
///     .model("gpt-4o-mini")
///     .tenant("acme".to_owned())
///     .input_text("Summarize this document".to_owned())
///     .build();
/// assert_eq!(request.tenant_or_default(), "acme");
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Builder, Serialize, Deserialize)]
#[builder(on(String, into))]
pub struct RequestMeta {
    pub provider: String,
    pub model: String,
    pub tenant: Option<String>,
    pub priority: Option<i32>,
    pub max_output_tokens: Option<u64>,
    pub input_text: Option<String>,
    /// Keys streaming-token accounting. Assigned by the controller when absent.
    pub id: Option<String>,
}

impl RequestMeta {
    pub fn tenant_or_default(&self) -> &str {
        self.tenant.as_deref().unwrap_or("default")
    }
}

/// Coarse failure class attached to a response by the downstream adapter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimit,
    Timeout,
    ServerError,
    ClientError,
    Unknown,
}

/// Metadata of one downstream attempt, successful or not.
///
/// Timing fields the adapter leaves empty are backfilled by the controller, so
/// a meta returned from `run` always carries `started_at` and `ended_at`.
#[derive(Clone, Debug)]
pub struct ResponseMeta {
    pub status: StatusCode,
    /// Case-insensitive by construction.
    pub headers: HeaderMap,
    pub error_kind: Option<ErrorKind>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub started_at: Option<Instant>,
    pub first_token_at: Option<Instant>,
    pub ended_at: Option<Instant>,
}

impl ResponseMeta {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            error_kind: None,
            input_tokens: None,
            output_tokens: None,
            started_at: None,
            first_token_at: None,
            ended_at: None,
        }
    }

    pub fn ok() -> Self {
        Self::new(StatusCode::OK)
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_error_kind(mut self, kind: ErrorKind) -> Self {
        self.error_kind = Some(kind);
        self
    }

    pub fn with_tokens(mut self, input: Option<u64>, output: Option<u64>) -> Self {
        self.input_tokens = input;
        self.output_tokens = output;
        self
    }

    pub fn with_timing(
        mut self,
        started_at: Instant,
        first_token_at: Option<Instant>,
        ended_at: Instant,
    ) -> Self {
        self.started_at = Some(started_at);
        self.first_token_at = first_token_at;
        self.ended_at = Some(ended_at);
        self
    }

    pub(crate) fn fill_timing(mut self, started_at: Instant, ended_at: Instant) -> Self {
        self.started_at.get_or_insert(started_at);
        self.ended_at.get_or_insert(ended_at);
        self
    }

    /// Time to first token; `None` unless both instants are known and ordered.
    pub fn first_token_latency(&self) -> Option<Duration> {
        self.first_token_at?.checked_duration_since(self.started_at?)
    }

    pub fn total_latency(&self) -> Option<Duration> {
        Some(self.ended_at?.saturating_duration_since(self.started_at?))
    }
}

/// Predicted cost of a request in tokens.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CostEstimate {
    pub input_tokens: f64,
    pub output_tokens: f64,
}

impl CostEstimate {
    pub fn total(&self) -> f64 {
        self.input_tokens + self.output_tokens
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SoftLossReason {
    Timeout,
    ServerError,
}

/// Congestion signal derived from one completed attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Signal {
    Success,
    RateLimit { retry_after: Option<Duration> },
    SoftLoss { reason: SoftLossReason },
    ClientError,
    Unknown,
}

impl Signal {
    pub const fn name(&self) -> &'static str {
        match self {
            Signal::Success => "success",
            Signal::RateLimit { .. } => "rate_limit",
            Signal::SoftLoss { .. } => "soft_loss",
            Signal::ClientError => "client_error",
            Signal::Unknown => "unknown",
        }
    }

    pub const fn is_success(&self) -> bool {
        matches!(self, Signal::Success)
    }
}

/// What a downstream call yields on success, and what `run` hands back.
#[derive(Clone, Debug)]
pub struct RunResult<T> {
    pub result: T,
    pub meta: ResponseMeta,
}

impl<T> RunResult<T> {
    pub fn new(result: T, meta: ResponseMeta) -> Self {
        Self { result, meta }
    }
}

/// Point-in-time view of one limiter bundle.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LimiterSnapshot {
    pub rate: f64,
    pub max_rate: f64,
    pub bucket: f64,
    pub bucket_cap: f64,
    pub debt: f64,
    pub cwnd: f64,
    pub inflight: usize,
    pub baseline_ftl: Option<Duration>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Latency {
    pub first_token: Option<Duration>,
    pub total: Duration,
}
