#![allow(clippy::return_self_not_must_use)]
#![doc = include_str!("../README.md")]

//! ## Architecture
//! Leaves first:
//!
//! - [`Socket`]: one non-blocking OS socket (TCP or Unix-domain)
//! - [`SocketPool`]: readiness polling for many sockets; [`PollingSocketPool`] is the mio backend
//! - [`AsyncSocket`]: a socket bound to a pool, with suspending read, write and accept
//! - [`ChunkedByteSequence`]: buffered look-ahead over a socket's byte stream
//! - [`HttpDecoder`] / [`HttpEncoder`]: the HTTP/1.x wire codec
//! - [`WsFrameSequence`] / [`WsFrameEncoder`]: the WebSocket wire codec
//! - [`HttpConnection`]: the per-connection request loop
//! - [`HttpServer`]: accepts connections and routes their requests
//!
//! ## Configuration
//! Server settings can be configured via:
//! - Environment variables (prefixed with `TERN_`)
//! - Configuration file (`config.toml`)
//! - Struct update syntax on [`ServerConfig::default`]

pub use crate::async_socket::AsyncSocket;
pub use crate::config::ServerConfig;
pub use crate::connection::{dispatch, ConnectionState, HttpConnection, HttpRequestSequence};
pub use crate::decoder::{HttpDecoder, RequestBody};
pub use crate::encoder::HttpEncoder;
pub use crate::error::{BoxError, HttpError, HttpResult, SocketError, WsError};
pub use crate::executor::{block_on, BlockingIter, Parker};
pub use crate::http::{header, Body, Bytes, Headers, Method, Payload, Request, Response, StatusCode, Version};
pub use crate::logging::{default_logger, DisabledLogger, HttpLogging, LogLogger};
pub use crate::pool::{PollingSocketPool, SocketPool};
pub use crate::route::Route;
pub use crate::sequence::{ByteStream, ChunkedByteSequence, SharedBytes};
pub use crate::server::{HttpHandler, HttpServer, RoutedHttpHandler};
pub use crate::socket::{Address, Socket};
pub use crate::ws::{
    EchoMessageHandler, MessageFrameHandler, Opcode, WebSocketHttpHandler, WsFrame, WsFrameEncoder, WsFrameSequence,
    WsHandler, WsMessage, WsMessageHandler,
};

pub mod async_socket;
pub mod config;
pub mod connection;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod executor;
pub mod http;
pub mod logging;
pub mod pool;
pub mod route;
pub mod sequence;
pub mod server;
pub mod socket;
pub mod ws;
