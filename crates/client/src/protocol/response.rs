//! HTTP response head handling implementation.
//!
//! A [`ResponseHead`] is what the parser hands to the demultiplexer once the
//! status line and header section are complete: the raw ordered header list
//! plus the connection-management facts derived from it.

use std::time::Duration;

use http::{StatusCode, Version};

use crate::protocol::{HeaderList, PayloadSize};

/// Status line and headers of a response, with framing and keep-alive flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    version: Version,
    status: StatusCode,
    headers: HeaderList,
    flags: HeadFlags,
}

/// Connection-management facts derived from a response head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeadFlags {
    /// The connection may be reused after this response
    pub keep_alive: bool,
    /// The server advertised keep-alive explicitly (`Connection: keep-alive` or a `Keep-Alive` header)
    pub explicit_keep_alive: bool,
    /// `timeout=` parameter of the `Keep-Alive` header
    pub keep_alive_timeout: Option<Duration>,
    /// The response switches protocols
    pub upgrade: bool,
    /// How the body is delimited
    pub payload: Option<PayloadSize>,
}

impl ResponseHead {
    pub fn new(version: Version, status: StatusCode, headers: HeaderList, flags: HeadFlags) -> Self {
        Self { version, status, headers, flags }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderList {
        &self.headers
    }

    pub fn flags(&self) -> &HeadFlags {
        &self.flags
    }

    pub(crate) fn set_flags(&mut self, flags: HeadFlags) {
        self.flags = flags;
    }

    /// Returns true for 1xx responses other than `101 Switching Protocols`.
    pub fn is_informational(&self) -> bool {
        self.status.is_informational() && self.status != StatusCode::SWITCHING_PROTOCOLS
    }

    pub fn is_keep_alive(&self) -> bool {
        self.flags.keep_alive
    }

    pub fn is_upgrade(&self) -> bool {
        self.flags.upgrade
    }

    pub fn payload_size(&self) -> PayloadSize {
        self.flags.payload.unwrap_or(PayloadSize::Empty)
    }

    /// Returns true if the body framing forbids reading another response after this one.
    pub fn is_close_delimited(&self) -> bool {
        self.payload_size().is_until_close()
    }
}

/// Parses the `timeout=N` parameter of a `Keep-Alive` header value.
pub(crate) fn parse_keep_alive_timeout(value: &[u8]) -> Option<Duration> {
    value
        .split(|b| *b == b',')
        .filter_map(|param| {
            let param = param.trim_ascii();
            let (name, value) = param.split_at(param.iter().position(|b| *b == b'=')?);
            name.trim_ascii().eq_ignore_ascii_case(b"timeout").then_some(&value[1..])
        })
        .find_map(|value| std::str::from_utf8(value.trim_ascii()).ok()?.parse::<u64>().ok())
        .map(Duration::from_secs)
}
