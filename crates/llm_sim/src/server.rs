use std::time::Duration;

use bon::Builder;
use http::{HeaderValue, StatusCode, header::RETRY_AFTER};
use llm_admission::admission::{
    error::CallError,
    types::{ErrorKind, ResponseMeta, RunResult},
};
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, sleep};

/// Behaviour of the simulated backend.
///
/// The failure chances are cumulative over one roll per call: a roll below
/// `rate_limit_chance` is a 429, below `rate_limit_chance + server_error_chance`
/// a 503, and so on.
#[derive(Clone, Copy, Debug, PartialEq, Builder, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PseudoLlmConfig {
    #[builder(default)]
    #[serde(default)]
    pub rate_limit_chance: f64,

    #[builder(default)]
    #[serde(default)]
    pub server_error_chance: f64,

    #[builder(default)]
    #[serde(default)]
    pub timeout_chance: f64,

    /// **Default**: 120
    #[builder(default = default_base_first_token_ms())]
    #[serde(default = "default_base_first_token_ms")]
    pub base_first_token_ms: f64,

    /// **Default**: 800
    #[builder(default = default_total_duration_ms())]
    #[serde(default = "default_total_duration_ms")]
    pub total_duration_ms: f64,

    /// **Default**: 120
    #[builder(default = default_output_tokens())]
    #[serde(default = "default_output_tokens")]
    pub output_tokens: u64,

    /// When set, output is reported through the token callback in chunks of
    /// this size and left out of the final response metadata.
    #[serde(default)]
    pub stream_chunk_tokens: Option<u64>,
}

const fn default_base_first_token_ms() -> f64 {
    120.0
}

const fn default_total_duration_ms() -> f64 {
    800.0
}

const fn default_output_tokens() -> u64 {
    120
}

impl Default for PseudoLlmConfig {
    fn default() -> Self {
        Self {
            rate_limit_chance: 0.0,
            server_error_chance: 0.0,
            timeout_chance: 0.0,
            base_first_token_ms: default_base_first_token_ms(),
            total_duration_ms: default_total_duration_ms(),
            output_tokens: default_output_tokens(),
            stream_chunk_tokens: None,
        }
    }
}

/// A fake completion endpoint with jittered latency and random failures.
#[derive(Clone, Debug, Default)]
pub struct PseudoLlmServer {
    config: PseudoLlmConfig,
}

impl PseudoLlmServer {
    pub fn new(config: PseudoLlmConfig) -> Self {
        Self { config }
    }

    pub async fn call(&self, prompt: &str) -> Result<RunResult<String>, CallError> {
        self.call_streaming(prompt, |_| {}).await
    }

    /// Like [`call`](Self::call), reporting output tokens to `on_tokens` as they
    /// are produced when streaming is configured.
    pub async fn call_streaming(
        &self,
        prompt: &str,
        on_tokens: impl Fn(u64),
    ) -> Result<RunResult<String>, CallError> {
        let started = Instant::now();
        let first_token = jitter(self.config.base_first_token_ms);
        let total = jitter(self.config.total_duration_ms);

        sleep(first_token).await;

        let roll = rand::random::<f64>();
        let mut threshold = self.config.rate_limit_chance;
        if roll < threshold {
            let meta = ResponseMeta::new(StatusCode::TOO_MANY_REQUESTS)
                .with_header(RETRY_AFTER, HeaderValue::from_static("1"))
                .with_error_kind(ErrorKind::RateLimit);
            return Err(self.failure(meta, started, "rate limit"));
        }
        threshold += self.config.server_error_chance;
        if roll < threshold {
            let meta = ResponseMeta::new(StatusCode::SERVICE_UNAVAILABLE)
                .with_error_kind(ErrorKind::ServerError);
            return Err(self.failure(meta, started, "server error"));
        }
        threshold += self.config.timeout_chance;
        if roll < threshold {
            let meta = ResponseMeta::new(StatusCode::GATEWAY_TIMEOUT)
                .with_error_kind(ErrorKind::Timeout);
            return Err(self.failure(meta, started, "timeout"));
        }

        let generation = total.saturating_sub(first_token);
        let output_tokens = match self.config.stream_chunk_tokens {
            Some(chunk) if chunk > 0 => {
                let chunks = self.config.output_tokens.div_ceil(chunk).max(1);
                let pause = generation / chunks as u32;
                let mut remaining = self.config.output_tokens;
                while remaining > 0 {
                    sleep(pause).await;
                    let produced = remaining.min(chunk);
                    on_tokens(produced);
                    remaining -= produced;
                }
                None
            }
            _ => {
                sleep(generation).await;
                Some(self.config.output_tokens)
            }
        };

        let input_tokens = (prompt.chars().count() as u64).div_ceil(4).max(1);
        let meta = ResponseMeta::ok()
            .with_tokens(Some(input_tokens), output_tokens)
            .with_timing(
                started.into_std(),
                Some((started + first_token).into_std()),
                Instant::now().into_std(),
            );
        let preview: String = prompt.chars().take(16).collect();
        Ok(RunResult::new(format!("ok:{preview}"), meta))
    }

    fn failure(&self, meta: ResponseMeta, started: Instant, message: &str) -> CallError {
        debug!(message = "Simulated failure.", status = %meta.status, reason = message);
        let meta = meta.with_timing(started.into_std(), None, Instant::now().into_std());
        CallError::response(meta, message)
    }
}

// +/-5% around `ms`.
fn jitter(ms: f64) -> Duration {
    let spread = ms * 0.1;
    let value = ms + (rand::random::<f64>() * spread - spread / 2.0);
    Duration::from_secs_f64(value.max(0.0) / 1000.0)
}
