//! Response classification and backoff schedule for the HTTP exporter.
//!
//! Status handling:
//!
//! | status              | class              |
//! |---------------------|--------------------|
//! | 2xx                 | success            |
//! | 429, 503            | throttled (honors `Retry-After`) |
//! | 408, 502, 504       | retryable          |
//! | 3xx                 | redirect           |
//! | other 4xx           | permanent (client) |
//! | other 5xx           | permanent (server) |

use chrono::{DateTime, Utc};
use http::StatusCode;
use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;

/// Roughly 30 years; stands in for "no deadline".
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// How the exporter reacts to a response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    Success,
    /// Retry after the server's hint, or the backoff schedule if there is none
    Throttled,
    /// Retry on the backoff schedule
    Retryable,
    /// Follow `Location`, then retry on the backoff schedule
    Redirect,
    PermanentClient,
    PermanentServer,
    /// 1xx or out-of-range codes; never retried
    Unexpected,
}

impl ResponseClass {
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Throttled | Self::Retryable | Self::Redirect)
    }
}

pub fn classify_status(status: StatusCode) -> ResponseClass {
    match status.as_u16() {
        200..=299 => ResponseClass::Success,
        429 | 503 => ResponseClass::Throttled,
        408 | 502 | 504 => ResponseClass::Retryable,
        300..=399 => ResponseClass::Redirect,
        400..=499 => ResponseClass::PermanentClient,
        500..=599 => ResponseClass::PermanentServer,
        _ => ResponseClass::Unexpected,
    }
}

/// Exponential backoff with a jittered fraction.
///
/// `max_retries` counts retries only: a policy with `max_retries = k` allows
/// `k + 1` attempts in total.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Cap applied after the multiplier
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction of each delay that is randomized, in `[0, 1]`
    pub jitter: f64,
    /// Cap applied to server-supplied Retry-After hints
    pub max_retry_after: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.5,
            max_retry_after: Duration::from_secs(600),
        }
    }
}

impl RetryPolicy {
    /// A schedule that retries `max_retries` times without sleeping.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            jitter: 0.0,
            max_retry_after: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (1-based). Retry 0 is the initial attempt.
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        if retry == 0 || self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let exponent = (retry - 1).min(63) as i32;
        let delay_ms = (self.base_delay.as_millis() as f64 * self.multiplier.powi(exponent))
            .min(self.max_delay.as_millis() as f64);

        let jitter = self.jitter.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            1.0 - jitter * rand::thread_rng().gen::<f64>()
        } else {
            1.0
        };
        Duration::from_millis((delay_ms * factor) as u64)
    }

    /// Delay before retrying a throttled response.
    pub fn throttle_delay(&self, retry: u32, retry_after: Option<&str>) -> Duration {
        retry_after
            .and_then(|value| parse_retry_after(value, Utc::now(), self.max_retry_after))
            .unwrap_or_else(|| self.delay_for_attempt(retry))
    }
}

/// Parses a `Retry-After` value, either delay-seconds or an HTTP date, capped at `cap`.
/// Dates in the past yield a zero delay.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>, cap: Duration) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds).min(cap));
    }

    let at = DateTime::parse_from_rfc2822(value).ok()?;
    let delay = (at.with_timezone(&Utc) - now)
        .to_std()
        .unwrap_or(Duration::ZERO);
    Some(delay.min(cap))
}

/// `now + timeout`, saturating at a far-future instant instead of overflowing.
pub(crate) fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE)
}
