use std::{env, fmt::Debug, str::FromStr};

use llm_sim::{SimConfig, run_simulation};
use tracing::{info, warn};

const ENV_CONFIG_PATH: &str = "LLM_SIM_CONFIG";
const ENV_REQUESTS: &str = "LLM_SIM_REQUESTS";
const ENV_RATE_LIMIT_CHANCE: &str = "LLM_SIM_RATE_LIMIT_CHANCE";
const ENV_SERVER_ERROR_CHANCE: &str = "LLM_SIM_SERVER_ERROR_CHANCE";
const ENV_TIMEOUT_CHANCE: &str = "LLM_SIM_TIMEOUT_CHANCE";
const ENV_STREAM_CHUNK_TOKENS: &str = "LLM_SIM_STREAM_CHUNK_TOKENS";

fn get_env_var<T: FromStr + Debug>(var_name: &str, default_value: T) -> T
where
    <T as FromStr>::Err: Debug,
{
    env::var(var_name)
        .ok()
        .and_then(|value| match value.parse::<T>() {
            Ok(parsed) => Some(parsed),
            Err(error) => {
                warn!(
                    "Failed to parse env var '{}' (value: '{}'): {:?}. Using default: {:?}",
                    var_name, value, error, default_value
                );
                None
            }
        })
        .unwrap_or(default_value)
}

#[tokio::main]
async fn main() -> Result<(), llm_admission::Error> {
    let default_log_filter = "info,llm_admission=info,llm_sim=info";
    tracing_subscriber::fmt()
        .with_env_filter(env::var("RUST_LOG").unwrap_or_else(|_| default_log_filter.to_string()))
        .init();

    if dotenvy::dotenv().is_ok() {
        info!(".env file loaded.");
    }

    let mut config = match env::var(ENV_CONFIG_PATH) {
        Ok(path) => {
            info!(message = "Loading simulation config.", %path);
            SimConfig::load(path)?
        }
        Err(_) => SimConfig::default(),
    };
    config.requests = get_env_var(ENV_REQUESTS, config.requests);
    config.server.rate_limit_chance =
        get_env_var(ENV_RATE_LIMIT_CHANCE, config.server.rate_limit_chance);
    config.server.server_error_chance =
        get_env_var(ENV_SERVER_ERROR_CHANCE, config.server.server_error_chance);
    config.server.timeout_chance = get_env_var(ENV_TIMEOUT_CHANCE, config.server.timeout_chance);
    if let Ok(chunk) = env::var(ENV_STREAM_CHUNK_TOKENS) {
        config.server.stream_chunk_tokens = chunk.parse().ok();
    }

    info!(
        message = "Starting simulation.",
        requests = config.requests,
        rate_limit_chance = config.server.rate_limit_chance,
    );
    let report = run_simulation(config).await;

    println!(
        "done in {:?}: {} ok, {} failed, {} rejected, {} retries",
        report.elapsed, report.succeeded, report.failed, report.rejected, report.retries
    );
    println!(
        "limiter: rate={:.1}/{:.1} bucket={:.1}/{:.1} debt={:.1} cwnd={:.2} inflight={}",
        report.state.rate,
        report.state.max_rate,
        report.state.bucket,
        report.state.bucket_cap,
        report.state.debt,
        report.state.cwnd,
        report.state.inflight,
    );
    Ok(())
}
