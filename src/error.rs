use std::io;
use thiserror::Error;

/// Failure type returned by request handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors raised by sockets, the socket pool and the byte sequences built on them.
#[derive(Debug, Error)]
pub enum SocketError {
    /// The peer closed the connection, or the socket was closed locally.
    #[error("socket disconnected")]
    Disconnected,

    /// The socket pool stopped while an operation was waiting on it.
    #[error("socket pool stopped")]
    PoolStopped,

    /// The pool's run loop was started twice.
    #[error("socket pool is already running")]
    AlreadyRunning,

    /// A second task tried to wait on a descriptor/interest pair that already has a waiter.
    #[error("socket already has a pending waiter for this interest")]
    AlreadyAwaiting,

    /// A delimited read exceeded the configured line limit.
    #[error("line exceeds {0} bytes")]
    LineTooLong(usize),

    /// The operation makes no sense for this kind of socket.
    #[error("unsupported socket operation: {0}")]
    Unsupported(&'static str),

    /// Registering a descriptor with the poller failed.
    #[error("registration failed: {0}")]
    Registration(io::Error),

    /// The OS readiness call failed.
    #[error("polling failed: {0}")]
    Polling(io::Error),

    /// Error when a mutex lock becomes poisoned due to a panic in another thread
    #[error("mutex lock poisoned")]
    LockPoisoned,

    /// Any other I/O error, including `WouldBlock`.
    #[error("io error: {0}")]
    Io(io::Error),
}

impl SocketError {
    pub fn is_would_block(&self) -> bool {
        matches!(self, SocketError::Io(err) if err.kind() == io::ErrorKind::WouldBlock)
    }

    pub fn is_disconnect(&self) -> bool {
        matches!(self, SocketError::Disconnected)
    }
}

impl From<io::Error> for SocketError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof => SocketError::Disconnected,
            _ => SocketError::Io(err),
        }
    }
}

/// Errors raised while decoding or serving HTTP.
#[derive(Debug, Error)]
pub enum HttpError {
    /// The stream ended cleanly before the first byte of a message.
    #[error("connection closed before a request started")]
    Disconnected,

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("unsupported transfer encoding: {0}")]
    UnsupportedTransferEncoding(String),

    #[error("header section too large")]
    HeaderTooLarge,

    #[error("body stream failed: {0}")]
    Body(String),

    /// A request or WebSocket handler returned an error.
    #[error("handler failed: {0}")]
    Handler(String),

    #[error("handler timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error(transparent)]
    Socket(#[from] SocketError),
}

impl HttpError {
    /// True for conditions that mean "the peer went away" rather than a protocol fault.
    pub fn is_disconnect(&self) -> bool {
        match self {
            HttpError::Disconnected => true,
            HttpError::Socket(err) => err.is_disconnect(),
            _ => false,
        }
    }

    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        HttpError::Malformed(message.into())
    }
}

/// Errors raised by the WebSocket codec and handshake.
#[derive(Debug, Error)]
pub enum WsError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("invalid handshake: {0}")]
    Handshake(String),

    #[error(transparent)]
    Socket(#[from] SocketError),
}

/// Type alias for Results using SocketError as the error type
pub type Result<T> = std::result::Result<T, SocketError>;

/// Type alias for Results using HttpError as the error type
pub type HttpResult<T> = std::result::Result<T, HttpError>;

#[cfg(test)]
mod tests {
    use super::*;

    /// Tests that peer-gone I/O errors collapse into `Disconnected`.
    #[test]
    fn test_socket_error_conversion() {
        let err = SocketError::from(io::Error::new(io::ErrorKind::BrokenPipe, "pipe"));
        assert!(err.is_disconnect());

        let err = SocketError::from(io::Error::new(io::ErrorKind::Other, "test error"));
        assert!(matches!(err, SocketError::Io(_)));
        assert_eq!(err.to_string(), "io error: test error");
    }

    #[test]
    fn test_would_block_detection() {
        let err = SocketError::from(io::Error::from(io::ErrorKind::WouldBlock));
        assert!(err.is_would_block());
        assert!(!SocketError::Disconnected.is_would_block());
    }

    /// Tests which HTTP errors count as a clean disconnect.
    #[test]
    fn test_http_error_disconnect() {
        assert!(HttpError::Disconnected.is_disconnect());
        assert!(HttpError::from(SocketError::Disconnected).is_disconnect());
        assert!(!HttpError::from(SocketError::PoolStopped).is_disconnect());
        assert!(!HttpError::malformed("bad").is_disconnect());
    }
}
