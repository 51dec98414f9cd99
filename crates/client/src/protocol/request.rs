//! HTTP request descriptor.
//!
//! A [`RequestDescriptor`] is everything the connection needs to put a request
//! on the wire: method, target, ordered headers, a body source, and an optional
//! cancellation signal. Header conversion failures are recorded and reported
//! when the descriptor is dispatched, the same way `http::request::Builder`
//! defers its errors to `body()`.

use http::{header, HeaderName, HeaderValue, Method};
use tokio_util::sync::CancellationToken;

use crate::protocol::{ClientError, HeaderList, RequestBody};
use crate::ensure;

/// One request as handed to [`Dispatch::dispatch`](crate::dispatch::Dispatch::dispatch).
#[derive(Debug)]
pub struct RequestDescriptor {
    method: Method,
    path: String,
    headers: HeaderList,
    body: RequestBody,
    idempotent: bool,
    upgrade: Option<String>,
    signal: Option<CancellationToken>,
    invalid: Option<String>,
}

impl RequestDescriptor {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        let idempotent = method.is_idempotent();
        Self {
            method,
            path: path.into(),
            headers: HeaderList::new(),
            body: RequestBody::Empty,
            idempotent,
            upgrade: None,
            signal: None,
            invalid: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn head(path: impl Into<String>) -> Self {
        Self::new(Method::HEAD, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    /// Appends a header field; conversion errors surface at dispatch.
    pub fn header<K, V>(mut self, name: K, value: V) -> Self
    where
        K: TryInto<HeaderName>,
        K::Error: Into<http::Error>,
        V: TryInto<HeaderValue>,
        V::Error: Into<http::Error>,
    {
        if self.invalid.is_some() {
            return self;
        }
        match (name.try_into(), value.try_into()) {
            (Ok(name), Ok(value)) => self.headers.append(name, value),
            (Err(e), _) => self.invalid = Some(format!("invalid header name: {}", e.into())),
            (_, Err(e)) => self.invalid = Some(format!("invalid header value: {}", e.into())),
        }
        self
    }

    pub fn body(mut self, body: impl Into<RequestBody>) -> Self {
        self.body = body.into();
        self
    }

    /// Overrides the idempotency derived from the method.
    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    /// Asks the server to switch to `protocol`; the response is delivered through `on_upgrade`.
    pub fn upgrade(mut self, protocol: impl Into<String>) -> Self {
        self.upgrade = Some(protocol.into());
        self
    }

    /// Attaches an external cancellation signal.
    pub fn signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn headers(&self) -> &HeaderList {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderList {
        &mut self.headers
    }

    pub fn request_body(&self) -> &RequestBody {
        &self.body
    }

    pub(crate) fn take_body(&mut self) -> RequestBody {
        std::mem::take(&mut self.body)
    }

    pub fn is_idempotent(&self) -> bool {
        self.idempotent
    }

    pub fn upgrade_protocol(&self) -> Option<&str> {
        self.upgrade.as_deref()
    }

    /// Returns true if the response may switch protocols (`Upgrade` or `CONNECT`).
    pub fn is_upgrade(&self) -> bool {
        self.upgrade.is_some() || self.method == Method::CONNECT
    }

    pub fn abort_signal(&self) -> Option<&CancellationToken> {
        self.signal.as_ref()
    }

    /// Returns true if the caller asked for the connection to close after this request.
    pub fn wants_close(&self) -> bool {
        self.headers.has_token(header::CONNECTION.as_str(), "close")
    }

    /// Copies the descriptor for another attempt; `None` if the body cannot be replayed.
    pub fn try_clone(&self) -> Option<Self> {
        Some(Self {
            method: self.method.clone(),
            path: self.path.clone(),
            headers: self.headers.clone(),
            body: self.body.try_clone()?,
            idempotent: self.idempotent,
            upgrade: self.upgrade.clone(),
            signal: self.signal.clone(),
            invalid: self.invalid.clone(),
        })
    }

    /// Checks the descriptor before it is accepted by a connection.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::InvalidArgument` if:
    /// - a header failed to convert
    /// - the target is empty or contains whitespace or control bytes
    /// - a connection-managed header (`transfer-encoding`, `keep-alive`, `upgrade`, `expect`) was supplied
    /// - `connection` carries anything other than `close` or `keep-alive`
    /// - `content-length` is malformed or disagrees with a known body length
    pub fn validate(&self) -> Result<(), ClientError> {
        if let Some(reason) = &self.invalid {
            return Err(ClientError::invalid_argument(reason));
        }

        ensure!(!self.path.is_empty(), ClientError::invalid_argument("empty request target"));
        ensure!(
            self.path.bytes().all(|b| b > b' ' && b != 0x7f),
            ClientError::invalid_argument(format!("invalid request target {:?}", self.path))
        );
        ensure!(
            self.method == Method::CONNECT || self.path.starts_with('/') || self.path == "*" || self.path.contains("://"),
            ClientError::invalid_argument(format!("request target {:?} must be origin or absolute form", self.path))
        );

        for (name, value) in self.headers.iter() {
            if MANAGED_HEADERS.contains(&name.as_str()) {
                return Err(ClientError::invalid_argument(format!("{name} header is managed by the connection")));
            }

            if *name == header::CONNECTION {
                let ok = value.as_bytes().split(|b| *b == b',').all(|token| {
                    let token = token.trim_ascii();
                    token.eq_ignore_ascii_case(b"close") || token.eq_ignore_ascii_case(b"keep-alive")
                });
                ensure!(ok, ClientError::invalid_argument("invalid connection header"));
            } else if *name == header::CONTENT_LENGTH {
                let length = parse_content_length(value)
                    .ok_or_else(|| ClientError::invalid_argument("invalid content-length header"))?;
                if let Some(body_length) = self.body.length() {
                    ensure!(
                        body_length == length,
                        ClientError::invalid_argument(format!(
                            "content-length {length} does not match body length {body_length}"
                        ))
                    );
                }
            }
        }

        if let Some(protocol) = &self.upgrade {
            ensure!(!protocol.is_empty(), ClientError::invalid_argument("empty upgrade protocol"));
            ensure!(HeaderValue::from_str(protocol).is_ok(), ClientError::invalid_argument("invalid upgrade protocol"));
        }

        Ok(())
    }

    /// Gives a stream of unknown length the content length declared in the headers.
    pub(crate) fn apply_declared_length(&mut self) {
        let declared = self.declared_content_length();
        if let RequestBody::Stream { length: length @ None, .. } = &mut self.body {
            *length = declared;
        }
    }

    /// Content length declared by the caller, used when a stream does not report one.
    pub(crate) fn declared_content_length(&self) -> Option<u64> {
        self.headers.get(header::CONTENT_LENGTH.as_str()).and_then(parse_content_length)
    }
}

const MANAGED_HEADERS: [&str; 4] = ["transfer-encoding", "keep-alive", "upgrade", "expect"];

fn parse_content_length(value: &HeaderValue) -> Option<u64> {
    value.to_str().ok()?.trim().parse::<u64>().ok()
}
