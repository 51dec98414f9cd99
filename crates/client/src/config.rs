//! Connection configuration.

use std::time::Duration;

use http::HeaderValue;

use crate::codec::DEFAULT_MAX_HEADER_BYTES;

/// Tunables of one client connection.
///
/// Built with [`ClientConfig::default`] and adjusted with the chained setters:
///
/// ```
/// use std::time::Duration;
/// use micro_client::ClientConfig;
///
/// let config = ClientConfig::default()
///     .pipelining(4)
///     .headers_timeout(Duration::from_secs(10))
///     .authority("example.com");
/// assert_eq!(config.get_pipelining(), 4);
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub(crate) pipelining: usize,
    pub(crate) keep_alive_timeout: Duration,
    pub(crate) keep_alive_max_timeout: Duration,
    pub(crate) keep_alive_timeout_threshold: Duration,
    pub(crate) headers_timeout: Option<Duration>,
    pub(crate) body_timeout: Option<Duration>,
    pub(crate) max_header_size: usize,
    pub(crate) max_response_size: Option<usize>,
    pub(crate) read_buffer_size: usize,
    pub(crate) write_high_water_mark: usize,
    pub(crate) authority: Option<HeaderValue>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            pipelining: 1,
            keep_alive_timeout: Duration::from_secs(4),
            keep_alive_max_timeout: Duration::from_secs(600),
            keep_alive_timeout_threshold: Duration::from_secs(2),
            headers_timeout: Some(Duration::from_secs(300)),
            body_timeout: Some(Duration::from_secs(300)),
            max_header_size: DEFAULT_MAX_HEADER_BYTES,
            max_response_size: None,
            read_buffer_size: 8 * 1024,
            write_high_water_mark: 64 * 1024,
            authority: None,
        }
    }
}

impl ClientConfig {
    /// Maximum number of requests written before their responses arrive, at least 1.
    pub fn pipelining(mut self, depth: usize) -> Self {
        self.pipelining = depth.max(1);
        self
    }

    /// Idle timeout used when the server does not advertise one.
    pub fn keep_alive_timeout(mut self, timeout: Duration) -> Self {
        self.keep_alive_timeout = timeout;
        self
    }

    /// Upper bound for a server advertised idle timeout.
    pub fn keep_alive_max_timeout(mut self, timeout: Duration) -> Self {
        self.keep_alive_max_timeout = timeout;
        self
    }

    /// Subtracted from the server advertised idle timeout to avoid racing its close.
    pub fn keep_alive_timeout_threshold(mut self, threshold: Duration) -> Self {
        self.keep_alive_timeout_threshold = threshold;
        self
    }

    /// Time allowed between the end of a request write and the complete response head; `None` disables it.
    pub fn headers_timeout(mut self, timeout: impl Into<Option<Duration>>) -> Self {
        self.headers_timeout = timeout.into();
        self
    }

    /// Time allowed between two pieces of response body; `None` disables it.
    pub fn body_timeout(mut self, timeout: impl Into<Option<Duration>>) -> Self {
        self.body_timeout = timeout.into();
        self
    }

    pub fn max_header_size(mut self, size: usize) -> Self {
        self.max_header_size = size;
        self
    }

    /// Bounds the body of each response, and the bytes held while a handler is paused.
    pub fn max_response_size(mut self, size: impl Into<Option<usize>>) -> Self {
        self.max_response_size = size.into();
        self
    }

    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(512);
        self
    }

    /// Pending write bytes above which no further request is serialized.
    pub fn write_high_water_mark(mut self, size: usize) -> Self {
        self.write_high_water_mark = size;
        self
    }

    /// `Host` value for requests that do not carry one. Invalid values are ignored.
    pub fn authority(mut self, authority: &str) -> Self {
        self.authority = HeaderValue::from_str(authority).ok();
        self
    }

    pub fn get_pipelining(&self) -> usize {
        self.pipelining
    }

    pub fn get_max_header_size(&self) -> usize {
        self.max_header_size
    }

    pub fn get_max_response_size(&self) -> Option<usize> {
        self.max_response_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.pipelining, 1);
        assert_eq!(config.keep_alive_timeout, Duration::from_secs(4));
        assert_eq!(config.keep_alive_max_timeout, Duration::from_secs(600));
        assert_eq!(config.keep_alive_timeout_threshold, Duration::from_secs(2));
        assert_eq!(config.max_header_size, 16 * 1024);
        assert!(config.authority.is_none());
    }

    #[test]
    fn setters() {
        let config = ClientConfig::default().pipelining(0).headers_timeout(None).max_response_size(1024).authority("a.test:8080");
        assert_eq!(config.get_pipelining(), 1);
        assert_eq!(config.headers_timeout, None);
        assert_eq!(config.get_max_response_size(), Some(1024));
        assert_eq!(config.authority.unwrap(), "a.test:8080");

        assert!(ClientConfig::default().authority("bad\nhost").authority.is_none());
    }
}
