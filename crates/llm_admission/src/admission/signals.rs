use http::StatusCode;

use super::{
    headers::parse_retry_after,
    types::{ErrorKind, ResponseMeta, Signal, SoftLossReason},
};

/// Maps the outcome of an attempt to a congestion signal.
pub trait SignalClassifier: Send + Sync {
    fn classify(&self, meta: &ResponseMeta) -> Signal;
}

/// Status-code driven classification:
///
/// | outcome | signal |
/// |---------|--------|
/// | 429 | `RateLimit`, with `Retry-After` when present |
/// | error kind `timeout` | `SoftLoss(Timeout)` |
/// | 5xx | `SoftLoss(ServerError)` |
/// | 4xx | `ClientError` |
/// | anything else | `Success` |
#[derive(Clone, Copy, Debug, Default)]
pub struct BasicSignalClassifier;

impl SignalClassifier for BasicSignalClassifier {
    fn classify(&self, meta: &ResponseMeta) -> Signal {
        if meta.status == StatusCode::TOO_MANY_REQUESTS {
            return Signal::RateLimit {
                retry_after: parse_retry_after(&meta.headers),
            };
        }
        if meta.error_kind == Some(ErrorKind::Timeout) {
            return Signal::SoftLoss {
                reason: SoftLossReason::Timeout,
            };
        }
        if meta.status.as_u16() >= 500 {
            return Signal::SoftLoss {
                reason: SoftLossReason::ServerError,
            };
        }
        if meta.status.as_u16() >= 400 {
            return Signal::ClientError;
        }
        Signal::Success
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use http::{HeaderValue, header::RETRY_AFTER};

    use super::*;

    fn classify(meta: ResponseMeta) -> Signal {
        BasicSignalClassifier.classify(&meta)
    }

    #[test]
    fn too_many_requests_is_a_rate_limit() {
        assert_eq!(
            classify(ResponseMeta::new(StatusCode::TOO_MANY_REQUESTS)),
            Signal::RateLimit { retry_after: None }
        );
        assert_eq!(
            classify(
                ResponseMeta::new(StatusCode::TOO_MANY_REQUESTS)
                    .with_header(RETRY_AFTER, HeaderValue::from_static("2"))
            ),
            Signal::RateLimit {
                retry_after: Some(Duration::from_secs(2))
            }
        );
    }

    #[test]
    fn timeouts_win_over_status() {
        assert_eq!(
            classify(ResponseMeta::new(StatusCode::GATEWAY_TIMEOUT).with_error_kind(ErrorKind::Timeout)),
            Signal::SoftLoss {
                reason: SoftLossReason::Timeout
            }
        );
        assert_eq!(
            classify(ResponseMeta::ok().with_error_kind(ErrorKind::Timeout)),
            Signal::SoftLoss {
                reason: SoftLossReason::Timeout
            }
        );
    }

    #[test]
    fn server_and_client_errors() {
        assert_eq!(
            classify(ResponseMeta::new(StatusCode::SERVICE_UNAVAILABLE)),
            Signal::SoftLoss {
                reason: SoftLossReason::ServerError
            }
        );
        assert_eq!(
            classify(ResponseMeta::new(StatusCode::BAD_REQUEST)),
            Signal::ClientError
        );
        assert_eq!(
            classify(ResponseMeta::new(StatusCode::NOT_FOUND).with_error_kind(ErrorKind::Unknown)),
            Signal::ClientError
        );
    }

    #[test]
    fn everything_else_is_success() {
        assert_eq!(classify(ResponseMeta::ok()), Signal::Success);
        assert_eq!(classify(ResponseMeta::new(StatusCode::NO_CONTENT)), Signal::Success);
        assert_eq!(
            classify(ResponseMeta::new(StatusCode::MOVED_PERMANENTLY)),
            Signal::Success
        );
    }
}
