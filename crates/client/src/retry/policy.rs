//! When and how long to wait before another attempt.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use http::{HeaderValue, Method};

use crate::protocol::ClientError;

/// Facts about the retry being considered.
#[derive(Debug, Clone)]
pub struct RetryContext<'a> {
    /// 1 for the first retry, 2 for the second, and so on
    pub attempt: u32,
    /// Delay already spent waiting between attempts
    pub total_delay: Duration,
    pub method: &'a Method,
}

type DecideFn = dyn Fn(&ClientError, &RetryContext<'_>) -> Option<Duration> + Send + Sync;

/// Decides whether a failed attempt is retried, and after which delay.
///
/// The decision function returns `None` to give up. Independently of what it
/// returns, no more than `max_retries` retries happen and the summed delays
/// never exceed `max_total_delay`.
#[derive(Clone)]
pub struct RetryPolicy {
    decide: Arc<DecideFn>,
    max_retries: u32,
    max_total_delay: Duration,
    statuses: Vec<u16>,
}

impl RetryPolicy {
    /// A policy with a custom decision function and the default limits.
    pub fn new<F>(decide: F) -> Self
    where
        F: Fn(&ClientError, &RetryContext<'_>) -> Option<Duration> + Send + Sync + 'static,
    {
        Self { decide: Arc::new(decide), ..Self::default() }
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn max_total_delay(mut self, max_total_delay: Duration) -> Self {
        self.max_total_delay = max_total_delay;
        self
    }

    /// Response statuses turned into a retryable `ClientError::ResponseStatus`.
    pub fn statuses(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.statuses = statuses.into_iter().collect();
        self
    }

    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.statuses.contains(&status)
    }

    /// Delay before the next attempt, or `None` when the error is final.
    pub fn delay(&self, error: &ClientError, ctx: &RetryContext<'_>) -> Option<Duration> {
        if ctx.attempt > self.max_retries {
            return None;
        }
        let delay = (self.decide)(error, ctx)?;
        (ctx.total_delay + delay <= self.max_total_delay).then_some(delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            decide: Arc::new(|error, ctx| Backoff::default().delay(error, ctx)),
            max_retries: 5,
            max_total_delay: Duration::from_secs(120),
            statuses: vec![500, 502, 503, 504, 429],
        }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("max_total_delay", &self.max_total_delay)
            .field("statuses", &self.statuses)
            .finish_non_exhaustive()
    }
}

/// Exponential backoff for transient failures.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub min: Duration,
    pub factor: u32,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self { min: Duration::from_millis(500), factor: 2, max: Duration::from_secs(30) }
    }
}

impl Backoff {
    /// `min * factor^(attempt - 1)`, capped at `max`.
    pub fn nth(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        self.factor
            .checked_pow(exponent)
            .and_then(|multiplier| self.min.checked_mul(multiplier))
            .map_or(self.max, |delay| delay.min(self.max))
    }

    /// Retries transport failures and retryable statuses, honoring `Retry-After`.
    pub fn delay(&self, error: &ClientError, ctx: &RetryContext<'_>) -> Option<Duration> {
        match error {
            ClientError::Socket { .. }
            | ClientError::UnexpectedEof
            | ClientError::HeadersTimeout(_)
            | ClientError::BodyTimeout(_)
            | ClientError::Closed => Some(self.nth(ctx.attempt)),
            ClientError::ResponseStatus { retry_after: Some(after), .. } => Some((*after).min(self.max)),
            ClientError::ResponseStatus { .. } => Some(self.nth(ctx.attempt)),
            _ => None,
        }
    }
}

/// Delay requested by a `Retry-After` value, in delta-seconds or HTTP-date form.
pub(crate) fn parse_retry_after(value: &HeaderValue) -> Option<Duration> {
    retry_after_from(value, SystemTime::now())
}

/// A date in the past means no delay.
fn retry_after_from(value: &HeaderValue, now: SystemTime) -> Option<Duration> {
    let value = value.to_str().ok()?.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let at = httpdate::parse_http_date(value).ok()?;
    Some(at.duration_since(now).unwrap_or(Duration::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(attempt: u32, total_delay: Duration) -> RetryContext<'static> {
        RetryContext { attempt, total_delay, method: &Method::GET }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let backoff = Backoff::default();
        assert_eq!(backoff.nth(1), Duration::from_millis(500));
        assert_eq!(backoff.nth(2), Duration::from_secs(1));
        assert_eq!(backoff.nth(4), Duration::from_secs(4));
        assert_eq!(backoff.nth(10), Duration::from_secs(30));
        assert_eq!(backoff.nth(100), Duration::from_secs(30));
    }

    #[test]
    fn default_retryable_errors() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(&ClientError::UnexpectedEof, &ctx(1, Duration::ZERO)), Some(Duration::from_millis(500)));
        assert_eq!(policy.delay(&ClientError::Closed, &ctx(3, Duration::ZERO)), Some(Duration::from_secs(2)));
        assert_eq!(policy.delay(&ClientError::parse("bad"), &ctx(1, Duration::ZERO)), None);
        assert_eq!(policy.delay(&ClientError::aborted(), &ctx(1, Duration::ZERO)), None);

        let status = ClientError::ResponseStatus { status: 503, retry_after: Some(Duration::from_secs(7)) };
        assert_eq!(policy.delay(&status, &ctx(1, Duration::ZERO)), Some(Duration::from_secs(7)));
        assert!(policy.is_retryable_status(429));
        assert!(!policy.is_retryable_status(404));
    }

    #[test]
    fn limits() {
        let policy = RetryPolicy::default().max_retries(2).max_total_delay(Duration::from_secs(1));
        assert!(policy.delay(&ClientError::Closed, &ctx(2, Duration::ZERO)).is_some());
        assert!(policy.delay(&ClientError::Closed, &ctx(3, Duration::ZERO)).is_none());
        assert!(policy.delay(&ClientError::Closed, &ctx(1, Duration::from_millis(600))).is_none());
    }

    #[test]
    fn custom_decision() {
        let policy = RetryPolicy::new(|error, _| matches!(error, ClientError::Parse { .. }).then_some(Duration::ZERO));
        assert_eq!(policy.delay(&ClientError::parse("x"), &ctx(1, Duration::ZERO)), Some(Duration::ZERO));
        assert_eq!(policy.delay(&ClientError::Closed, &ctx(1, Duration::ZERO)), None);
    }

    #[test]
    fn retry_after_seconds() {
        assert_eq!(parse_retry_after(&HeaderValue::from_static("120")), Some(Duration::from_secs(120)));
        assert_eq!(parse_retry_after(&HeaderValue::from_static(" 0 ")), Some(Duration::ZERO));
        assert_eq!(parse_retry_after(&HeaderValue::from_static("soon")), None);
    }

    #[test]
    fn retry_after_http_date() {
        // Wed, 21 Oct 2015 07:28:00 GMT
        let date = SystemTime::UNIX_EPOCH + Duration::from_secs(1_445_412_480);
        let value = HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT");

        let now = date - Duration::from_secs(90);
        assert_eq!(retry_after_from(&value, now), Some(Duration::from_secs(90)));
        assert_eq!(retry_after_from(&value, date + Duration::from_secs(5)), Some(Duration::ZERO));
        assert_eq!(parse_retry_after(&value), Some(Duration::ZERO));
    }
}
