//! Retry/rate-limit policy for the upstream client facade (spec §4.2).
//! The backoff shape — `tokio_retry::strategy::{ExponentialBackoff, jitter}`
//! wrapped in a small helper function rather than calling
//! `tokio_retry::Retry::spawn` directly — follows the `retry_default` helper
//! in fossas-broker's `subcommand/run.rs`; this version additionally
//! inspects response headers per attempt to classify GitHub's primary vs.
//! secondary rate limits, which the broker's generic retry doesn't need to.

use std::time::Duration;

use tokio_retry::strategy::{jitter, ExponentialBackoff};

use crate::error::{AppError, AppResult};

const NON_RETRYABLE: [u16; 5] = [400, 401, 403, 404, 422];
const MAX_SECONDARY_WAIT_SECS: u64 = 60;
const MAX_PRIMARY_RETRIES: u32 = 3;
const MAX_BACKOFF_RETRIES: u32 = 5;
const BACKOFF_CAP_SECS: u64 = 30;

#[derive(Debug, Clone, Copy)]
pub enum RateLimitSignal {
    Primary { retry_after_secs: u64 },
    Secondary { retry_after_secs: u64 },
}

/// Inspects GitHub's rate-limit headers. `x-ratelimit-remaining: 0` plus
/// `x-ratelimit-reset` signals the primary (per-hour) limit; a `retry-after`
/// header on a 403/429 with no remaining-count header signals the
/// secondary (abuse-detection) limit.
pub fn classify_rate_limit(status: u16, headers: &reqwest::header::HeaderMap) -> Option<RateLimitSignal> {
    if status != 403 && status != 429 {
        return None;
    }
    let header_u64 = |name: &str| -> Option<u64> {
        headers.get(name)?.to_str().ok()?.trim().parse().ok()
    };

    if let Some(remaining) = header_u64("x-ratelimit-remaining") {
        if remaining == 0 {
            let reset_at = header_u64("x-ratelimit-reset").unwrap_or(0);
            let now = chrono::Utc::now().timestamp() as u64;
            let retry_after_secs = reset_at.saturating_sub(now).max(1);
            return Some(RateLimitSignal::Primary { retry_after_secs });
        }
    }
    if let Some(retry_after_secs) = header_u64("retry-after") {
        return Some(RateLimitSignal::Secondary { retry_after_secs });
    }
    None
}

pub fn is_non_retryable(status: u16) -> bool {
    NON_RETRYABLE.contains(&status)
}

/// Runs `attempt` until it succeeds or a terminal condition is hit,
/// applying the primary/secondary rate-limit rules and, for unmarked 5xx
/// responses, exponential backoff with decorrelated jitter capped at 30s.
pub async fn with_retry<F, Fut, T>(mut attempt: F) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, RetryableError>>,
{
    let mut backoff = ExponentialBackoff::from_millis(1000)
        .max_delay(Duration::from_secs(BACKOFF_CAP_SECS))
        .map(jitter);
    let mut primary_retries = 0u32;
    let mut backoff_retries = 0u32;

    loop {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(RetryableError::RateLimited(RateLimitSignal::Primary { retry_after_secs })) => {
                if primary_retries >= MAX_PRIMARY_RETRIES {
                    return Err(AppError::UpstreamRateLimited { retry_after_secs });
                }
                primary_retries += 1;
                tokio::time::sleep(Duration::from_secs(retry_after_secs)).await;
            }
            Err(RetryableError::RateLimited(RateLimitSignal::Secondary { retry_after_secs })) => {
                if retry_after_secs > MAX_SECONDARY_WAIT_SECS {
                    return Err(AppError::UpstreamRateLimited { retry_after_secs });
                }
                tokio::time::sleep(Duration::from_secs(retry_after_secs)).await;
            }
            Err(RetryableError::NonRetryable { status, message }) => {
                return Err(AppError::UpstreamError { status, message });
            }
            Err(RetryableError::Transient { status, message }) => {
                if backoff_retries >= MAX_BACKOFF_RETRIES {
                    return Err(AppError::UpstreamError { status, message });
                }
                backoff_retries += 1;
                let wait = backoff.next().unwrap_or(Duration::from_secs(BACKOFF_CAP_SECS));
                tokio::time::sleep(wait).await;
            }
        }
    }
}

#[derive(Debug)]
pub enum RetryableError {
    RateLimited(RateLimitSignal),
    NonRetryable { status: u16, message: String },
    Transient { status: u16, message: String },
}

impl RetryableError {
    pub fn classify(status: u16, headers: &reqwest::header::HeaderMap, message: String) -> Self {
        if let Some(signal) = classify_rate_limit(status, headers) {
            return RetryableError::RateLimited(signal);
        }
        if is_non_retryable(status) {
            return RetryableError::NonRetryable { status, message };
        }
        RetryableError::Transient { status, message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue};

    #[test]
    fn classifies_primary_rate_limit_from_zero_remaining() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
        headers.insert("x-ratelimit-reset", HeaderValue::from_static("9999999999"));
        let signal = classify_rate_limit(403, &headers);
        assert!(matches!(signal, Some(RateLimitSignal::Primary { .. })));
    }

    #[test]
    fn classifies_secondary_rate_limit_from_retry_after() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("30"));
        let signal = classify_rate_limit(403, &headers);
        assert!(matches!(
            signal,
            Some(RateLimitSignal::Secondary { retry_after_secs: 30 })
        ));
    }

    #[test]
    fn non_rate_limit_403_without_headers_is_none() {
        let headers = HeaderMap::new();
        assert!(classify_rate_limit(403, &headers).is_none());
    }

    #[test]
    fn non_retryable_statuses_match_spec_list() {
        for status in [400, 401, 403, 404, 422] {
            assert!(is_non_retryable(status));
        }
        assert!(!is_non_retryable(500));
        assert!(!is_non_retryable(502));
    }
}
