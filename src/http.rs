use core::fmt;
use std::io;
use std::sync::Arc;

use futures::stream::BoxStream;
use futures::{Stream, StreamExt};

use crate::decoder::RequestBody;
use crate::error::{BoxError, HttpError, HttpResult};
use crate::ws::{self, WsHandler};

pub use hyper::body::Bytes;
pub use hyper::http::{Method, StatusCode, Version};

/// Header names the codec reads or writes itself.
pub mod header {
    pub const CONNECTION: &str = "Connection";
    pub const CONTENT_LENGTH: &str = "Content-Length";
    pub const TRANSFER_ENCODING: &str = "Transfer-Encoding";
    pub const UPGRADE: &str = "Upgrade";
    pub const HOST: &str = "Host";
    pub const CONTENT_TYPE: &str = "Content-Type";
    pub const SEC_WEBSOCKET_KEY: &str = "Sec-WebSocket-Key";
    pub const SEC_WEBSOCKET_ACCEPT: &str = "Sec-WebSocket-Accept";
    pub const SEC_WEBSOCKET_VERSION: &str = "Sec-WebSocket-Version";
}

/// Header fields with case-insensitive names, multiple values per name,
/// and iteration in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Headers::default()
    }

    /// First value of `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn get_all<'a, 'n>(&'a self, name: &'n str) -> impl Iterator<Item = &'a str> + 'n
    where
        'a: 'n,
    {
        self.entries
            .iter()
            .filter(move |(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// True if any comma-separated value of `name` equals `token`, ignoring case.
    pub fn contains_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|value| value.split(','))
            .any(|item| item.trim().eq_ignore_ascii_case(token))
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replaces every value of `name` with `value`, keeping the first entry's position.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter().position(|(key, _)| key.eq_ignore_ascii_case(&name)) {
            Some(index) => {
                self.entries[index] = (name.clone(), value);
                let mut seen = 0;
                self.entries.retain(|(key, _)| {
                    if key.eq_ignore_ascii_case(&name) {
                        seen += 1;
                        seen == 1
                    } else {
                        true
                    }
                });
            }
            None => self.entries.push((name, value)),
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Headers {
            entries: iter.into_iter().map(|(key, value)| (key.into(), value.into())).collect(),
        }
    }
}

/// The keep-alive rule shared by requests and responses.
///
/// HTTP/1.1 keeps the connection unless `Connection: close` is present;
/// HTTP/1.0 closes it unless `Connection: keep-alive` is present.
pub fn should_keep_alive(version: Version, headers: &Headers) -> bool {
    if version == Version::HTTP_11 {
        !headers.contains_token(header::CONNECTION, "close")
    } else if version == Version::HTTP_10 {
        headers.contains_token(header::CONNECTION, "keep-alive")
    } else {
        false
    }
}

pub(crate) fn version_str(version: Version) -> &'static str {
    if version == Version::HTTP_10 {
        "HTTP/1.0"
    } else {
        "HTTP/1.1"
    }
}

/// A message body.
///
/// Request bodies, chunked or with a `Content-Length`, are read lazily from the
/// connection as the handler consumes them.
pub struct Body(Kind);

enum Kind {
    Empty,
    Full(Bytes),
    Request(RequestBody),
    Stream(BoxStream<'static, Result<Bytes, BoxError>>),
}

impl Body {
    /// Create a body from a string or bytes.
    ///
    /// ```rust
    /// # use tern::Body;
    /// let string = Body::new("Hello world!");
    /// let bytes = Body::new(vec![0, 1, 0, 1, 0]);
    /// ```
    pub fn new(data: impl Into<Bytes>) -> Body {
        let data = data.into();
        if data.is_empty() {
            Body::empty()
        } else {
            Body(Kind::Full(data))
        }
    }

    pub fn empty() -> Body {
        Body(Kind::Empty)
    }

    /// A body produced lazily by `stream`; sent with chunked transfer encoding.
    pub fn from_stream<S>(stream: S) -> Body
    where
        S: Stream<Item = Result<Bytes, BoxError>> + Send + 'static,
    {
        Body(Kind::Stream(stream.boxed()))
    }

    /// Create a body from an implementor of [`io::Read`]. It is read on tokio's
    /// blocking pool, so the body must be consumed inside a tokio runtime.
    ///
    /// ```rust,no_run
    /// use tern::{Body, Response, StatusCode};
    /// use std::fs::File;
    ///
    /// let file = File::open("index.html").unwrap();
    /// let response = Response::new(StatusCode::OK)
    ///     .with_header("Content-Type", "text/html")
    ///     .with_body(Body::wrap_reader(file));
    /// ```
    pub fn wrap_reader<R>(reader: R) -> Body
    where
        R: io::Read + Send + 'static,
    {
        Body::from_stream(reader_stream(reader))
    }

    pub(crate) fn from_request(body: RequestBody) -> Body {
        Body(Kind::Request(body))
    }

    /// A handle on the undecoded part of a request body, shared with this body.
    pub fn request_body(&self) -> Option<RequestBody> {
        match &self.0 {
            Kind::Request(body) => Some(body.clone()),
            _ => None,
        }
    }

    /// Length known up front, if any.
    pub fn len(&self) -> Option<usize> {
        match &self.0 {
            Kind::Empty => Some(0),
            Kind::Full(bytes) => Some(bytes.len()),
            Kind::Request(body) => body.declared_length(),
            Kind::Stream(_) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    /// Next piece of the body, or `None` once it is complete.
    pub async fn next_chunk(&mut self) -> HttpResult<Option<Bytes>> {
        if let Kind::Full(bytes) = &self.0 {
            let bytes = bytes.clone();
            self.0 = Kind::Empty;
            return Ok(Some(bytes));
        }

        match &mut self.0 {
            Kind::Empty | Kind::Full(_) => Ok(None),
            Kind::Request(body) => body.next_chunk().await,
            Kind::Stream(stream) => match stream.next().await {
                Some(Ok(bytes)) => Ok(Some(bytes)),
                Some(Err(err)) => Err(HttpError::Body(err.to_string())),
                None => Ok(None),
            },
        }
    }

    /// Collects the whole body.
    pub async fn bytes(mut self) -> HttpResult<Bytes> {
        if let Kind::Full(bytes) = &self.0 {
            return Ok(bytes.clone());
        }

        let mut collected = bytes::BytesMut::new();
        while let Some(chunk) = self.next_chunk().await? {
            collected.extend_from_slice(&chunk);
        }
        Ok(collected.freeze())
    }
}

impl<T> From<T> for Body
where
    Bytes: From<T>,
{
    fn from(data: T) -> Body {
        Body::new(data)
    }
}

impl Default for Body {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Kind::Empty => f.write_str("Body(Empty)"),
            Kind::Full(bytes) => write!(f, "Body({} bytes)", bytes.len()),
            Kind::Request(_) => f.write_str("Body(Request)"),
            Kind::Stream(_) => f.write_str("Body(Stream)"),
        }
    }
}

/// Bytes requested from a wrapped reader per read.
const CAP: usize = 4096;

/// Streams `reader` in pieces of up to [`CAP`] bytes. Each read runs on
/// tokio's blocking pool, so it never stalls a worker thread.
fn reader_stream<R>(reader: R) -> impl Stream<Item = Result<Bytes, BoxError>> + Send
where
    R: io::Read + Send + 'static,
{
    futures::stream::unfold(Some(reader), |reader| async move {
        let mut reader = reader?;
        let read = tokio::task::spawn_blocking(move || {
            let mut buf = vec![0; CAP];
            let read = reader.read(&mut buf).map(|n| {
                buf.truncate(n);
                buf
            });
            (reader, read)
        })
        .await;

        match read {
            Err(err) => Some((Err(err.into()), None)),
            Ok((_, Err(err))) => Some((Err(err.into()), None)),
            Ok((_, Ok(buf))) if buf.is_empty() => None,
            Ok((reader, Ok(buf))) => Some((Ok(Bytes::from(buf)), Some(reader))),
        }
    })
}

/// A decoded HTTP request.
#[derive(Debug)]
pub struct Request {
    pub method: Method,
    pub version: Version,
    /// The request target without its query string, as sent.
    pub path: String,
    /// Decoded query parameters in the order they appeared.
    pub query: Vec<(String, String)>,
    pub headers: Headers,
    pub body: Body,
}

impl Request {
    /// Creates an HTTP/1.1 request; a `?query` suffix on `target` is parsed.
    pub fn new(method: Method, target: &str) -> Self {
        let (path, query) = split_target(target);
        Request {
            method,
            version: Version::HTTP_11,
            path,
            query,
            headers: Headers::new(),
            body: Body::empty(),
        }
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// First value of the query parameter `name`.
    pub fn query_value(&self, name: &str) -> Option<&str> {
        self.query.iter().find(|(key, _)| key == name).map(|(_, value)| value.as_str())
    }

    pub fn should_keep_alive(&self) -> bool {
        should_keep_alive(self.version, &self.headers)
    }

    /// The path and query string as they appear on the request line.
    pub fn target(&self) -> String {
        if self.query.is_empty() {
            return self.path.clone();
        }
        let query = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(self.query.iter())
            .finish();
        format!("{}?{}", self.path, query)
    }
}

pub(crate) fn split_target(target: &str) -> (String, Vec<(String, String)>) {
    match target.split_once('?') {
        Some((path, query)) => (
            path.to_string(),
            url::form_urlencoded::parse(query.as_bytes()).into_owned().collect(),
        ),
        None => (target.to_string(), Vec::new()),
    }
}

/// What follows the head of a response. Exactly one variant is active.
pub enum Payload {
    Empty,
    Bytes(Bytes),
    /// Sent with chunked transfer encoding, or until close for HTTP/1.0.
    Stream(Body),
    /// Switches the connection to WebSocket framing once the head is written.
    WebSocket(Arc<dyn WsHandler>),
}

impl From<Body> for Payload {
    fn from(body: Body) -> Self {
        match body.0 {
            Kind::Empty => Payload::Empty,
            Kind::Full(bytes) => Payload::Bytes(bytes),
            kind => Payload::Stream(Body(kind)),
        }
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Empty => f.write_str("Empty"),
            Payload::Bytes(bytes) => write!(f, "Bytes({})", bytes.len()),
            Payload::Stream(body) => write!(f, "Stream({:?})", body),
            Payload::WebSocket(_) => f.write_str("WebSocket"),
        }
    }
}

/// An HTTP response.
///
/// ```
/// # use tern::{Response, StatusCode};
/// let response = Response::new(StatusCode::NOT_FOUND)
///     .with_header("X-Custom-Foo", "Bar")
///     .with_body("Page not found.");
/// assert_eq!(response.status, StatusCode::NOT_FOUND);
/// ```
#[derive(Debug)]
pub struct Response {
    pub version: Version,
    pub status: StatusCode,
    pub headers: Headers,
    pub payload: Payload,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Response {
            version: Version::HTTP_11,
            status,
            headers: Headers::new(),
            payload: Payload::Empty,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Body>) -> Self {
        self.payload = Payload::from(body.into());
        self
    }

    /// The `101 Switching Protocols` answer to a WebSocket upgrade request.
    ///
    /// # Errors
    /// Returns `WsError::Handshake` if `request` is not a valid upgrade.
    pub fn web_socket(request: &Request, handler: Arc<dyn WsHandler>) -> Result<Self, crate::error::WsError> {
        let accept = ws::verify_upgrade(request)?;
        let mut response = Response::new(StatusCode::SWITCHING_PROTOCOLS)
            .with_header(header::UPGRADE, "websocket")
            .with_header(header::CONNECTION, "Upgrade")
            .with_header(header::SEC_WEBSOCKET_ACCEPT, accept);
        response.version = request.version;
        response.payload = Payload::WebSocket(handler);
        Ok(response)
    }

    pub fn is_web_socket(&self) -> bool {
        matches!(self.payload, Payload::WebSocket(_))
    }

    /// Whether the connection continues after this response is written.
    ///
    /// An HTTP/1.0 response with a streamed payload never does: its body ends
    /// when the connection closes.
    pub fn should_keep_alive(&self) -> bool {
        if self.version == Version::HTTP_10 && matches!(self.payload, Payload::Stream(_)) {
            return false;
        }
        should_keep_alive(self.version, &self.headers)
    }

    /// Collects a fixed or streamed payload; empty for WebSocket upgrades.
    pub async fn body_bytes(self) -> HttpResult<Bytes> {
        match self.payload {
            Payload::Empty | Payload::WebSocket(_) => Ok(Bytes::new()),
            Payload::Bytes(bytes) => Ok(bytes),
            Payload::Stream(body) => body.bytes().await,
        }
    }
}
