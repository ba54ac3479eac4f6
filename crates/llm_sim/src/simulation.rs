use std::{fs, path::Path, sync::Arc, time::Duration};

use llm_admission::admission::{
    AdmissionController, ConcurrencyLimiterSettings, ControlConfig, QueueSettings,
    TokenLimiterSettings,
    retries::{RetrySettings, with_retries},
    telemetry::{FanoutTelemetry, InMemoryTelemetry, MetricsTelemetry, TelemetrySink, TracingTelemetry},
    types::{LimiterSnapshot, RequestMeta},
};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use tokio::{task::JoinSet, time::Instant};

use crate::{
    ConfigSnafu, JsonSnafu, ReadConfigSnafu, SimError,
    server::{PseudoLlmConfig, PseudoLlmServer},
};

/// Everything one simulation run needs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SimConfig {
    pub control: ControlConfig,
    pub server: PseudoLlmConfig,
    pub retry: RetrySettings,
    /// Number of requests issued at once.
    pub requests: usize,
    pub provider: String,
    pub model: String,
    pub prompt: String,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            control: ControlConfig::builder()
                .queue(QueueSettings::builder().max_size(100).timeout_ms(1000).build())
                .token_limiter(TokenLimiterSettings::default())
                .concurrency_limiter(
                    ConcurrencyLimiterSettings::builder()
                        .delay_decrease(0.9)
                        .delay_threshold_ms(50.0)
                        .build(),
                )
                .build(),
            server: PseudoLlmConfig::builder()
                .rate_limit_chance(0.1)
                .output_tokens(64)
                .build(),
            retry: RetrySettings::default(),
            requests: 20,
            provider: "sim".to_owned(),
            model: "demo".to_owned(),
            prompt: "hello streaming world".to_owned(),
        }
    }
}

impl SimConfig {
    pub fn from_json_str(json: &str) -> Result<Self, SimError> {
        let config: SimConfig = serde_json::from_str(json).context(JsonSnafu)?;
        config.control.validate().context(ConfigSnafu)?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, SimError> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).context(ReadConfigSnafu { path })?;
        Self::from_json_str(&json)
    }

    fn request(&self, index: usize) -> RequestMeta {
        RequestMeta::builder()
            .provider(self.provider.as_str())
            .model(self.model.as_str())
            .input_text(self.prompt.clone())
            .id(format!("sim-{index}"))
            .build()
    }
}

/// Outcome counts of one run and the limiter state it ended with.
#[derive(Clone, Debug)]
pub struct SimReport {
    pub succeeded: usize,
    pub failed: usize,
    pub rejected: usize,
    pub retries: usize,
    pub state: LimiterSnapshot,
    pub elapsed: Duration,
}

/// Issues `config.requests` concurrent requests against a [`PseudoLlmServer`]
/// through one controller, retrying transient failures.
pub async fn run_simulation(config: SimConfig) -> SimReport {
    let recorded = Arc::new(InMemoryTelemetry::new());
    let telemetry: Arc<dyn TelemetrySink> = Arc::new(
        FanoutTelemetry::default()
            .push(Arc::new(TracingTelemetry))
            .push(Arc::new(MetricsTelemetry))
            .push(recorded.clone()),
    );
    let controller = Arc::new(
        AdmissionController::new(config.control.clone()).with_telemetry(Arc::clone(&telemetry)),
    );
    let server = Arc::new(PseudoLlmServer::new(config.server));
    let started = Instant::now();

    let mut tasks = JoinSet::new();
    for index in 0..config.requests {
        let request = config.request(index);
        let prompt = config.prompt.clone();
        let controller = Arc::clone(&controller);
        let server = Arc::clone(&server);
        let telemetry = Arc::clone(&telemetry);
        let retry = config.retry;

        tasks.spawn(async move {
            with_retries(retry, telemetry, &request, || {
                let controller = Arc::clone(&controller);
                let server = Arc::clone(&server);
                let request = request.clone();
                let prompt = prompt.clone();
                async move {
                    let id = request.id.clone().unwrap_or_default();
                    controller
                        .run(request, || {
                            server.call_streaming(&prompt, |tokens| {
                                controller.on_stream_token(&id, tokens)
                            })
                        })
                        .await
                }
            })
            .await
        });
    }

    let (mut succeeded, mut failed, mut rejected) = (0, 0, 0);
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(reply)) => {
                succeeded += 1;
                debug!(message = "Request completed.", result = %reply.result);
            }
            Ok(Err(error)) if error.is_queue_rejection() => {
                rejected += 1;
                warn!(message = "Request rejected by admission queue.", %error);
            }
            Ok(Err(error)) => {
                failed += 1;
                warn!(message = "Request failed.", %error);
            }
            Err(error) => {
                failed += 1;
                error!(message = "Request task panicked.", %error);
            }
        }
    }

    SimReport {
        succeeded,
        failed,
        rejected,
        retries: recorded.retries().len(),
        state: controller.limiter_state(&config.request(0)),
        elapsed: started.elapsed(),
    }
}
