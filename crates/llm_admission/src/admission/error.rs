use std::time::{Duration, Instant};

use http::StatusCode;
use snafu::Snafu;

use crate::Error as CrateError;

use super::types::{ErrorKind, ResponseMeta};

/// Why `run` did not hand back a result.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AdmissionError {
    /// The queue was already full; the request was never enqueued.
    #[snafu(display("Admission queue overflow (max size {max_size})"))]
    QueueOverflow { max_size: usize },

    /// No token and concurrency capacity was found before the deadline.
    #[snafu(display("Admission queue timeout after {waited:?}"))]
    QueueTimeout { waited: Duration },

    /// The downstream call failed. Limiter bookkeeping has already run.
    #[snafu(display("Downstream call failed: {source}"))]
    Call { source: CallError },

    /// A limiter was acquired without capacity.
    #[snafu(display("Limiter misuse: {source}"))]
    Limiter { source: LimiterError },
}

impl AdmissionError {
    pub fn response_meta(&self) -> Option<&ResponseMeta> {
        match self {
            AdmissionError::Call { source } => source.response_meta(),
            _ => None,
        }
    }

    pub const fn is_queue_rejection(&self) -> bool {
        matches!(
            self,
            AdmissionError::QueueOverflow { .. } | AdmissionError::QueueTimeout { .. }
        )
    }
}

/// Failure of a downstream call.
///
/// Either the service answered (and the answer's metadata feeds congestion
/// control), or the call failed before a response existed.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CallError {
    #[snafu(display("Downstream responded with status {}: {message}", meta.status))]
    Response { meta: ResponseMeta, message: String },

    #[snafu(display("Downstream transport error: {source}"))]
    Transport { source: CrateError },
}

impl CallError {
    pub fn response(meta: ResponseMeta, message: impl Into<String>) -> Self {
        CallError::Response {
            meta,
            message: message.into(),
        }
    }

    pub fn transport(source: impl Into<CrateError>) -> Self {
        CallError::Transport {
            source: source.into(),
        }
    }

    pub fn response_meta(&self) -> Option<&ResponseMeta> {
        match self {
            CallError::Response { meta, .. } => Some(meta),
            CallError::Transport { .. } => None,
        }
    }

    /// The metadata completion handling sees for this failure. Errors without a
    /// response count as an unknown server-side failure.
    pub(crate) fn settlement_meta(&self, started_at: Instant, ended_at: Instant) -> ResponseMeta {
        let meta = match self {
            CallError::Response { meta, .. } => {
                let mut meta = meta.clone();
                meta.error_kind.get_or_insert(ErrorKind::Unknown);
                meta
            }
            CallError::Transport { .. } => ResponseMeta::new(StatusCode::INTERNAL_SERVER_ERROR)
                .with_error_kind(ErrorKind::Unknown),
        };
        meta.fill_timing(started_at, ended_at)
    }
}

#[derive(Debug, Snafu, PartialEq)]
#[snafu(visibility(pub(crate)))]
pub enum LimiterError {
    #[snafu(display(
        "{limiter} limiter acquired without capacity (requested {requested}, available {available})"
    ))]
    NoCapacity {
        limiter: &'static str,
        requested: f64,
        available: f64,
    },
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    #[snafu(display("Invalid setting `{field}`: {reason}"))]
    InvalidSetting { field: &'static str, reason: String },

    #[snafu(display("Failed to parse configuration: {source}"))]
    Json { source: serde_json::Error },
}
