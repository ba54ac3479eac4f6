//! Pre-call cost prediction.
//!
//! Input tokens come from sizing the prompt text; output tokens from an EWMA of
//! what previous calls to the same provider, model and tenant produced.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
};

use super::{
    lock,
    types::{CostEstimate, RequestMeta, ResponseMeta},
};

const DEFAULT_OUTPUT_TOKENS: f64 = 128.0;
const EWMA_ALPHA: f64 = 0.2;

/// Predicts the cost of a request and learns from what it actually cost.
pub trait CostEstimator: Send + Sync {
    fn estimate(&self, request: &RequestMeta) -> CostEstimate;

    fn settle(&self, request: &RequestMeta, meta: &ResponseMeta);
}

/// Counts tokens in a prompt.
pub type Tokenizer = Arc<dyn Fn(&str) -> u64 + Send + Sync>;

/// Roughly four characters per token, never less than one for non-empty text.
pub fn approximate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4).max(1)
}

#[derive(Default)]
pub struct EwmaEstimator {
    output_by_key: Mutex<HashMap<String, f64>>,
    tokenizer: Option<Tokenizer>,
}

impl EwmaEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sizes input text with `tokenizer` instead of the character heuristic.
    pub fn with_tokenizer(tokenizer: Tokenizer) -> Self {
        Self {
            output_by_key: Mutex::default(),
            tokenizer: Some(tokenizer),
        }
    }

    fn input_tokens(&self, text: Option<&str>) -> u64 {
        match text {
            None | Some("") => 0,
            Some(text) => match &self.tokenizer {
                Some(tokenizer) => tokenizer(text),
                None => approximate_tokens(text),
            },
        }
    }

    fn key(request: &RequestMeta) -> String {
        format!(
            "{}:{}:{}",
            request.provider,
            request.model,
            request.tenant_or_default()
        )
    }
}

impl fmt::Debug for EwmaEstimator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EwmaEstimator")
            .field("output_by_key", &self.output_by_key)
            .field("custom_tokenizer", &self.tokenizer.is_some())
            .finish()
    }
}

impl CostEstimator for EwmaEstimator {
    fn estimate(&self, request: &RequestMeta) -> CostEstimate {
        let ewma = lock(&self.output_by_key)
            .get(&Self::key(request))
            .copied()
            .unwrap_or(DEFAULT_OUTPUT_TOKENS);
        let output_tokens = match request.max_output_tokens {
            Some(max) if max > 0 => ewma.min(max as f64),
            _ => ewma,
        };

        CostEstimate {
            input_tokens: self.input_tokens(request.input_text.as_deref()) as f64,
            output_tokens,
        }
    }

    fn settle(&self, request: &RequestMeta, meta: &ResponseMeta) {
        let Some(observed) = meta.output_tokens else {
            return;
        };
        let mut outputs = lock(&self.output_by_key);
        let ewma = outputs
            .entry(Self::key(request))
            .or_insert(DEFAULT_OUTPUT_TOKENS);
        *ewma = EWMA_ALPHA * observed as f64 + (1.0 - EWMA_ALPHA) * *ewma;
    }
}
