//! One accepted connection and its request loop.
//!
//! The loop is an explicit state machine:
//!
//! ```text
//! AwaitingRequest -> Dispatching -> Writing -> AwaitingRequest
//!                                           -> UpgradingWebSocket -> Closed
//!                                           -> Closed
//! ```
//!
//! Each call to [`HttpConnection::step`] performs one transition, which keeps the
//! keep-alive, timeout and upgrade rules testable one at a time.
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{self, FutureExt};
use futures::StreamExt;

use crate::async_socket::AsyncSocket;
use crate::config::ServerConfig;
use crate::decoder::{HttpDecoder, RequestBody};
use crate::encoder::HttpEncoder;
use crate::error::{HttpError, HttpResult, SocketError};
use crate::http::{header, Payload, Request, Response, StatusCode};
use crate::logging::HttpLogging;
use crate::sequence::{ChunkedByteSequence, SharedBytes};
use crate::server::HttpHandler;
use crate::socket::Address;
use crate::ws::{Opcode, WsFrameEncoder, WsFrameSequence, WsHandler};

const UNKNOWN_HOST: &str = "<unknown>";

pub enum ConnectionState {
    AwaitingRequest,
    Dispatching(Request),
    Writing(Response),
    UpgradingWebSocket(Arc<dyn WsHandler>),
    Closed,
}

impl fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::AwaitingRequest => f.write_str("AwaitingRequest"),
            ConnectionState::Dispatching(request) => write!(f, "Dispatching({} {})", request.method, request.path),
            ConnectionState::Writing(response) => write!(f, "Writing({})", response.status),
            ConnectionState::UpgradingWebSocket(_) => f.write_str("UpgradingWebSocket"),
            ConnectionState::Closed => f.write_str("Closed"),
        }
    }
}

/// The requests decoded from one connection's byte sequence.
///
/// Once complete, by a request without keep-alive, a disconnect, a decode
/// failure or a WebSocket upgrade, it yields no further requests.
pub struct HttpRequestSequence {
    bytes: SharedBytes,
    complete: bool,
    unread_body: Option<RequestBody>,
}

impl HttpRequestSequence {
    pub fn new(bytes: SharedBytes) -> Self {
        HttpRequestSequence { bytes, complete: false, unread_body: None }
    }

    /// The next request, or `None` at a clean end of the connection.
    pub async fn next(&mut self) -> HttpResult<Option<Request>> {
        if self.complete {
            return Ok(None);
        }

        // whatever the handler left of the last body precedes the next request
        if let Some(body) = self.unread_body.take() {
            if let Err(err) = body.drain().await {
                self.complete = true;
                return if err.is_disconnect() { Ok(None) } else { Err(err) };
            }
        }

        match HttpDecoder::decode_request(&self.bytes).await {
            Ok(request) => {
                if !request.should_keep_alive() {
                    self.complete = true;
                }
                self.unread_body = request.body.request_body();
                Ok(Some(request))
            }
            Err(err) if err.is_disconnect() => {
                self.complete = true;
                Ok(None)
            }
            Err(err) => {
                self.complete = true;
                Err(err)
            }
        }
    }

    pub fn complete(&mut self) {
        self.complete = true;
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }
}

pub struct HttpConnection {
    hostname: String,
    socket: Arc<AsyncSocket>,
    bytes: SharedBytes,
    requests: HttpRequestSequence,
    handler: Arc<dyn HttpHandler>,
    timeout: Duration,
    logger: Arc<dyn HttpLogging>,
}

impl HttpConnection {
    pub fn new(
        socket: AsyncSocket,
        handler: Arc<dyn HttpHandler>,
        config: &ServerConfig,
        logger: Arc<dyn HttpLogging>,
    ) -> Self {
        let hostname = make_identifier(&socket);
        let socket = Arc::new(socket);
        let bytes = ChunkedByteSequence::new(socket.bytes(config.read_chunk_size))
            .with_line_limit(config.max_header_bytes)
            .shared();

        HttpConnection {
            hostname,
            socket,
            requests: HttpRequestSequence::new(bytes.clone()),
            bytes,
            handler,
            timeout: config.timeout(),
            logger,
        }
    }

    /// Peer IP, or the listening path for Unix-domain peers.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn is_complete(&self) -> bool {
        self.requests.is_complete()
    }

    /// Performs one transition of the request loop.
    pub async fn step(&mut self, state: ConnectionState) -> HttpResult<ConnectionState> {
        match state {
            ConnectionState::AwaitingRequest => match self.requests.next().await? {
                Some(request) => {
                    self.logger
                        .log_info(&format!("{} request: {} {}", self.hostname, request.method, request.target()));
                    Ok(ConnectionState::Dispatching(request))
                }
                None => Ok(ConnectionState::Closed),
            },
            ConnectionState::Dispatching(request) => {
                let response = dispatch(&*self.handler, request, self.timeout, &*self.logger).await;
                Ok(ConnectionState::Writing(response))
            }
            ConnectionState::Writing(response) => {
                let upgrade = match &response.payload {
                    Payload::WebSocket(handler) => Some(handler.clone()),
                    _ => None,
                };
                let keep_alive = response.should_keep_alive();
                self.write_response(response).await?;

                match upgrade {
                    Some(handler) => {
                        self.requests.complete();
                        Ok(ConnectionState::UpgradingWebSocket(handler))
                    }
                    None if keep_alive => Ok(ConnectionState::AwaitingRequest),
                    None => {
                        self.requests.complete();
                        Ok(ConnectionState::Closed)
                    }
                }
            }
            ConnectionState::UpgradingWebSocket(handler) => {
                self.serve_web_socket(handler).await?;
                Ok(ConnectionState::Closed)
            }
            ConnectionState::Closed => Ok(ConnectionState::Closed),
        }
    }

    /// Runs the request loop to completion and closes the socket.
    ///
    /// Failures end this connection only; they are logged, never returned.
    pub async fn run(mut self) {
        self.logger.log_debug(&format!("{} connection open", self.hostname));

        let mut state = ConnectionState::AwaitingRequest;
        while !matches!(state, ConnectionState::Closed) {
            state = match self.step(state).await {
                Ok(next) => next,
                Err(err) if err.is_disconnect() => ConnectionState::Closed,
                Err(HttpError::Socket(SocketError::PoolStopped)) => {
                    self.logger.log_debug(&format!("{} socket pool stopped", self.hostname));
                    ConnectionState::Closed
                }
                Err(err) => {
                    self.logger.log_error(&format!("{} connection error: {}", self.hostname, err));
                    ConnectionState::Closed
                }
            };
        }

        self.close();
        self.logger.log_debug(&format!("{} connection closed", self.hostname));
    }

    pub fn close(&self) {
        if let Err(err) = self.socket.close() {
            self.logger.log_warning(&format!("{} close failed: {}", self.hostname, err));
        }
    }

    async fn write_response(&self, response: Response) -> HttpResult<()> {
        let mut pieces = HttpEncoder::encode_response(response);
        while let Some(piece) = pieces.next().await {
            self.socket.write(&piece?).await?;
        }
        Ok(())
    }

    async fn serve_web_socket(&self, handler: Arc<dyn WsHandler>) -> HttpResult<()> {
        let logger = self.logger.clone();
        let hostname = self.hostname.clone();

        let inbound = WsFrameSequence::new(self.bytes.clone())
            .masked_only()
            .into_stream()
            .take_while(move |frame| {
                if let Err(err) = frame {
                    logger.log_warning(&format!("{} websocket: {}", hostname, err));
                }
                future::ready(frame.is_ok())
            })
            .filter_map(|frame| future::ready(frame.ok()))
            .boxed();

        let mut outbound = handler
            .make_frames(inbound)
            .await
            .map_err(|err| HttpError::Handler(err.to_string()))?;

        while let Some(frame) = outbound.next().await {
            self.socket.write(&WsFrameEncoder::encode_frame(&frame)).await?;
            if frame.opcode == Opcode::Close {
                break;
            }
        }
        Ok(())
    }
}

/// Invokes `handler` under `timeout`, answering failures, panics and timeouts with a 500.
///
/// The response takes the request's version. Unless the handler chose a
/// `Connection` header, the request's keep-alive decision is stamped on it.
pub async fn dispatch(
    handler: &dyn HttpHandler,
    request: Request,
    timeout: Duration,
    logger: &dyn HttpLogging,
) -> Response {
    let version = request.version;
    let keep_alive = request.should_keep_alive();

    let outcome = tokio::time::timeout(timeout, AssertUnwindSafe(handler.handle_request(request)).catch_unwind()).await;

    let mut response = match outcome {
        Ok(Ok(Ok(response))) => response,
        Ok(Ok(Err(err))) => {
            logger.log_error(&HttpError::Handler(err.to_string()).to_string());
            Response::new(StatusCode::INTERNAL_SERVER_ERROR)
        }
        Ok(Err(_)) => {
            logger.log_critical("handler panicked");
            Response::new(StatusCode::INTERNAL_SERVER_ERROR)
        }
        Err(_) => {
            logger.log_error(&HttpError::Timeout(timeout).to_string());
            Response::new(StatusCode::INTERNAL_SERVER_ERROR)
        }
    };

    response.version = version;
    if !response.headers.contains(header::CONNECTION) {
        response.headers.insert(header::CONNECTION, if keep_alive { "keep-alive" } else { "close" });
    }
    response
}

/// Names the peer for log lines. Never fails; degrades to `<unknown>`.
fn make_identifier(socket: &AsyncSocket) -> String {
    let host = match socket.peer_address() {
        // unix peers are unnamed; the listening path identifies them instead
        Ok(Address::Unix(_)) => socket.local_address().map(|address| address.host().to_string()),
        Ok(address) => Ok(address.host().to_string()),
        Err(err) => Err(err),
    };

    match host {
        Ok(host) if !host.is_empty() => host,
        _ => UNKNOWN_HOST.to_string(),
    }
}
