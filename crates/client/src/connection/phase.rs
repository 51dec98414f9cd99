//! Connection phase and the pipelining and keep-alive policy.

use std::fmt;
use std::time::Duration;

use tracing::debug;

use crate::config::ClientConfig;
use crate::protocol::HeadFlags;

/// Below this idle timeout the connection is not reused.
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(1);

/// Lifecycle of a connection.
///
/// ```text
/// Connecting -> Idle <-> Active -> Draining -> Closed
/// ```
///
/// Any phase may jump to `Closed` on a fatal error; keep-alive expiry goes
/// from `Idle` straight to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionPhase {
    Connecting = 0,
    Idle = 1,
    Active = 2,
    Draining = 3,
    Closed = 4,
}

impl ConnectionPhase {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Idle,
            2 => Self::Active,
            3 => Self::Draining,
            _ => Self::Closed,
        }
    }

    /// Returns true if new requests are accepted.
    pub fn is_accepting(self) -> bool {
        matches!(self, Self::Connecting | Self::Idle | Self::Active)
    }
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Idle => "idle",
            Self::Active => "active",
            Self::Draining => "draining",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// What the responses seen so far allow on this connection.
#[derive(Debug, Clone)]
pub struct PipelinePolicy {
    max_depth: usize,
    clamped: bool,
    reusable: bool,
    keep_alive_timeout: Duration,
    default_timeout: Duration,
    max_timeout: Duration,
    threshold: Duration,
}

impl PipelinePolicy {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            max_depth: config.pipelining.max(1),
            clamped: false,
            reusable: true,
            keep_alive_timeout: config.keep_alive_timeout,
            default_timeout: config.keep_alive_timeout,
            max_timeout: config.keep_alive_max_timeout,
            threshold: config.keep_alive_timeout_threshold,
        }
    }

    /// Requests that may be written before their responses arrive.
    pub fn depth(&self) -> usize {
        if self.clamped { 1 } else { self.max_depth }
    }

    /// Returns true while another request may be written on this connection.
    pub fn is_reusable(&self) -> bool {
        self.reusable
    }

    /// Idle time after which the connection is closed.
    pub fn keep_alive_timeout(&self) -> Duration {
        self.keep_alive_timeout
    }

    /// Stops writing further requests; the connection closes once in-flight responses complete.
    pub fn stop_reuse(&mut self) {
        if self.reusable {
            debug!("connection will not be reused");
        }
        self.reusable = false;
    }

    /// Updates the policy from a final response head.
    pub fn observe(&mut self, flags: &HeadFlags) {
        let close_delimited = flags.payload.is_some_and(|p| p.is_until_close());

        if !self.clamped && (!flags.explicit_keep_alive || !flags.keep_alive || close_delimited) {
            debug!(max_depth = self.max_depth, "pipelining clamped to 1");
            self.clamped = true;
        }

        if !flags.keep_alive || close_delimited {
            self.stop_reuse();
        }

        self.keep_alive_timeout = match flags.keep_alive_timeout {
            Some(advertised) => advertised.saturating_sub(self.threshold).min(self.max_timeout),
            None => self.default_timeout,
        };

        if self.keep_alive_timeout < MIN_KEEP_ALIVE {
            debug!(timeout = ?self.keep_alive_timeout, "keep-alive timeout too short");
            self.stop_reuse();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PayloadSize;

    fn flags(keep_alive: bool, explicit: bool, timeout: Option<u64>) -> HeadFlags {
        HeadFlags {
            keep_alive,
            explicit_keep_alive: explicit,
            keep_alive_timeout: timeout.map(Duration::from_secs),
            upgrade: false,
            payload: Some(PayloadSize::Length(0)),
        }
    }

    #[test]
    fn clamp_is_monotonic() {
        let mut policy = PipelinePolicy::new(&ClientConfig::default().pipelining(8));
        assert_eq!(policy.depth(), 8);

        policy.observe(&flags(true, true, None));
        assert_eq!(policy.depth(), 8);

        policy.observe(&flags(true, false, None));
        assert_eq!(policy.depth(), 1);
        assert!(policy.is_reusable());

        policy.observe(&flags(true, true, Some(60)));
        assert_eq!(policy.depth(), 1);
    }

    #[test]
    fn close_stops_reuse() {
        let mut policy = PipelinePolicy::new(&ClientConfig::default().pipelining(4));
        policy.observe(&flags(false, false, None));
        assert_eq!(policy.depth(), 1);
        assert!(!policy.is_reusable());
    }

    #[test]
    fn read_until_close_clamps() {
        let mut policy = PipelinePolicy::new(&ClientConfig::default().pipelining(4));
        let mut until_close = flags(true, true, None);
        until_close.payload = Some(PayloadSize::UntilClose);
        policy.observe(&until_close);
        assert_eq!(policy.depth(), 1);
        assert!(!policy.is_reusable());
    }

    #[test]
    fn keep_alive_timeout_computation() {
        let mut policy = PipelinePolicy::new(&ClientConfig::default());
        assert_eq!(policy.keep_alive_timeout(), Duration::from_secs(4));

        policy.observe(&flags(true, true, Some(10)));
        assert_eq!(policy.keep_alive_timeout(), Duration::from_secs(8));

        policy.observe(&flags(true, true, Some(3600)));
        assert_eq!(policy.keep_alive_timeout(), Duration::from_secs(600));

        policy.observe(&flags(true, true, None));
        assert_eq!(policy.keep_alive_timeout(), Duration::from_secs(4));
        assert!(policy.is_reusable());
    }

    #[test]
    fn short_keep_alive_drains() {
        let mut policy = PipelinePolicy::new(&ClientConfig::default());
        policy.observe(&flags(true, true, Some(2)));
        assert_eq!(policy.keep_alive_timeout(), Duration::ZERO);
        assert!(!policy.is_reusable());
    }

    #[test]
    fn phase_round_trip() {
        for phase in [ConnectionPhase::Connecting, ConnectionPhase::Idle, ConnectionPhase::Active, ConnectionPhase::Draining, ConnectionPhase::Closed] {
            assert_eq!(ConnectionPhase::from_u8(phase as u8), phase);
        }
        assert!(!ConnectionPhase::Draining.is_accepting());
    }
}
