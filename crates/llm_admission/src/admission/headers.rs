//! Reading congestion hints out of response headers.
//!
//! Lookups go through [`http::HeaderMap`], so header names are matched
//! case-insensitively whatever case the configuration uses.

use std::time::Duration;

use chrono::{DateTime, Utc};
use http::{HeaderMap, header::RETRY_AFTER};

use super::RateLimitHeaderNames;

pub const DEFAULT_LIMIT_TOKENS_HEADER: &str = "x-ratelimit-limit-tokens";
pub const DEFAULT_REMAINING_TOKENS_HEADER: &str = "x-ratelimit-remaining-tokens";
pub const DEFAULT_WINDOW_SECONDS_HEADER: &str = "x-ratelimit-window-seconds";
pub const DEFAULT_RESET_MS_HEADER: &str = "x-ratelimit-reset-ms";

/// Header names for one provider, with defaults filled in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedHeaderNames {
    pub limit_tokens: String,
    pub remaining_tokens: String,
    pub window_seconds: String,
    pub reset_ms: String,
}

impl ResolvedHeaderNames {
    pub fn resolve(overrides: Option<&RateLimitHeaderNames>) -> Self {
        let pick = |custom: Option<&Option<String>>, default: &str| {
            custom
                .and_then(Option::as_deref)
                .unwrap_or(default)
                .to_owned()
        };
        Self {
            limit_tokens: pick(
                overrides.map(|o| &o.limit_tokens_header),
                DEFAULT_LIMIT_TOKENS_HEADER,
            ),
            remaining_tokens: pick(
                overrides.map(|o| &o.remaining_tokens_header),
                DEFAULT_REMAINING_TOKENS_HEADER,
            ),
            window_seconds: pick(
                overrides.map(|o| &o.window_seconds_header),
                DEFAULT_WINDOW_SECONDS_HEADER,
            ),
            reset_ms: pick(
                overrides.map(|o| &o.reset_ms_header),
                DEFAULT_RESET_MS_HEADER,
            ),
        }
    }
}

impl Default for ResolvedHeaderNames {
    fn default() -> Self {
        Self::resolve(None)
    }
}

/// Remote limit values advertised by a response.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RemoteLimits {
    pub limit_tokens: Option<f64>,
    pub remaining_tokens: Option<f64>,
    pub window_seconds: Option<f64>,
    pub reset: Option<Duration>,
}

impl RemoteLimits {
    pub fn from_headers(headers: &HeaderMap, names: &ResolvedHeaderNames) -> Self {
        let integer = |name: &str| header_str(headers, name).and_then(parse_integer);
        Self {
            limit_tokens: integer(&names.limit_tokens),
            remaining_tokens: integer(&names.remaining_tokens),
            window_seconds: integer(&names.window_seconds),
            reset: integer(&names.reset_ms)
                .filter(|ms| *ms >= 0.0)
                .map(|ms| Duration::from_millis(ms as u64)),
        }
    }

    /// Limits are only applied when capacity headers are present.
    pub fn advertises_capacity(&self) -> bool {
        self.limit_tokens.is_some() || self.remaining_tokens.is_some()
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name)?.to_str().ok()
}

// Integer prefix of the value, so "20", "20.7" and "20 tokens" all read as 20.
fn parse_integer(value: &str) -> Option<f64> {
    let value = value.trim();
    let digits_end = value
        .char_indices()
        .find(|&(i, c)| !(c.is_ascii_digit() || (i == 0 && (c == '-' || c == '+'))))
        .map_or(value.len(), |(i, _)| i);
    value[..digits_end].parse::<i64>().ok().map(|n| n as f64)
}

/// Longest delay a `Retry-After` header can impose.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

/// Parses `Retry-After` as delay-seconds or an HTTP date, relative to the wall
/// clock. The result never exceeds [`MAX_RETRY_AFTER`].
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    parse_retry_after_at(headers, Utc::now())
}

pub fn parse_retry_after_at(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(seconds) = value.parse::<f64>() {
        if !seconds.is_finite() {
            return None;
        }
        let delay = Duration::try_from_secs_f64(seconds.max(0.0)).unwrap_or(MAX_RETRY_AFTER);
        return Some(delay.min(MAX_RETRY_AFTER));
    }

    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO).min(MAX_RETRY_AFTER))
}
