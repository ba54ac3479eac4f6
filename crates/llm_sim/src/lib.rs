//! Simulated LLM backend and load driver for `llm_admission`
//!
//! [`server::PseudoLlmServer`] answers prompts after a jittered first-token
//! delay and fails at configurable rates with 429, 503 and 504 responses.
//! [`simulation::run_simulation`] fires a burst of concurrent requests at it
//! through one [`AdmissionController`](llm_admission::admission::AdmissionController),
//! retrying transient failures, and reports how the limiters settled.
use std::{io, path::PathBuf};

use llm_admission::admission::error::ConfigError;
use snafu::Snafu;

pub mod server;
pub mod simulation;

#[macro_use]
extern crate tracing;

pub use server::{PseudoLlmConfig, PseudoLlmServer};
pub use simulation::{SimConfig, SimReport, run_simulation};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SimError {
    #[snafu(display("Failed to read config file {}: {source}", path.display()))]
    ReadConfig { path: PathBuf, source: io::Error },

    #[snafu(display("Failed to parse simulation config: {source}"))]
    Json { source: serde_json::Error },

    #[snafu(display("Invalid control settings: {source}"))]
    Config { source: ConfigError },
}
