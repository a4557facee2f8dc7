use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::async_socket::AsyncSocket;
use crate::config::ServerConfig;
use crate::connection::{dispatch, HttpConnection};
use crate::error::{BoxError, Result, SocketError};
use crate::http::{Request, Response, StatusCode};
use crate::logging::{default_logger, HttpLogging};
use crate::pool::{self, PollingSocketPool, SocketPool};
use crate::route::Route;
use crate::socket::{Address, Socket};
use crate::ws::{WebSocketHttpHandler, WsHandler};

/// Pause after a failed accept, such as when out of descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

/// Answers one request. Errors, like panics and timeouts, are sent as `500`.
///
/// Implemented for async closures:
///
/// ```
/// # use tern::{BoxError, HttpHandler, Request, Response, StatusCode};
/// let handler = |_request: Request| async { Ok::<_, BoxError>(Response::new(StatusCode::ACCEPTED)) };
/// # fn check(_: impl HttpHandler) {}
/// # check(handler);
/// ```
#[async_trait]
pub trait HttpHandler: Send + Sync {
    async fn handle_request(&self, request: Request) -> std::result::Result<Response, BoxError>;
}

#[async_trait]
impl<F, Fut> HttpHandler for F
where
    F: Fn(Request) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<Response, BoxError>> + Send + 'static,
{
    async fn handle_request(&self, request: Request) -> std::result::Result<Response, BoxError> {
        (self)(request).await
    }
}

/// Routes each request to the first appended handler whose [`Route`] matches it.
///
/// Unmatched requests get `404 Not Found`.
#[derive(Default)]
pub struct RoutedHttpHandler {
    routes: RwLock<Vec<(Route, Arc<dyn HttpHandler>)>>,
}

impl RoutedHttpHandler {
    pub fn new() -> Self {
        RoutedHttpHandler::default()
    }

    pub fn append(&self, route: Route, handler: Arc<dyn HttpHandler>) {
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((route, handler));
    }

    pub fn len(&self) -> usize {
        self.routes.read().map(|routes| routes.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn find(&self, request: &Request) -> Result<Option<Arc<dyn HttpHandler>>> {
        let routes = self.routes.read().map_err(|_| SocketError::LockPoisoned)?;
        Ok(routes
            .iter()
            .find(|(route, _)| route.matches(request))
            .map(|(_, handler)| handler.clone()))
    }
}

#[async_trait]
impl HttpHandler for RoutedHttpHandler {
    async fn handle_request(&self, request: Request) -> std::result::Result<Response, BoxError> {
        let handler = self.find(&request)?;
        match handler {
            Some(handler) => handler.handle_request(request).await,
            None => Ok(Response::new(StatusCode::NOT_FOUND)),
        }
    }
}

/// An HTTP/1.1 server accepting connections on one listening socket.
///
/// ```no_run
/// use tern::{BoxError, HttpServer, Request, Response, ServerConfig, StatusCode};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let server = HttpServer::new(ServerConfig::default())?;
///     server.append_handler("GET /hello/*", |_request: Request| async {
///         Ok::<_, BoxError>(Response::new(StatusCode::OK).with_body("Hello World!"))
///     });
///     server.start().await?;
///     Ok(())
/// }
/// ```
///
/// Connections share one [`SocketPool`], run on its own `tern-pool` thread,
/// and each connection is a tokio task. [`stop`](HttpServer::stop) stops the
/// pool, so a stopped server cannot be started again.
pub struct HttpServer {
    config: ServerConfig,
    pool: Arc<dyn SocketPool>,
    logger: Arc<dyn HttpLogging>,
    routes: Arc<RoutedHttpHandler>,
    shutdown: watch::Sender<bool>,
    local_address: Mutex<Option<Address>>,
}

impl HttpServer {
    /// Creates a server with its own socket pool and the `log` facade as sink.
    pub fn new(config: ServerConfig) -> Result<Self> {
        let pool: Arc<dyn SocketPool> = Arc::new(PollingSocketPool::new(config.poll_interval())?);
        let logger = default_logger(&config.log_category);
        let (shutdown, _) = watch::channel(false);

        Ok(HttpServer {
            config,
            pool,
            logger,
            routes: Arc::new(RoutedHttpHandler::new()),
            shutdown,
            local_address: Mutex::new(None),
        })
    }

    pub fn with_pool(mut self, pool: Arc<dyn SocketPool>) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn HttpLogging>) -> Self {
        self.logger = logger;
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<dyn SocketPool> {
        &self.pool
    }

    /// Routes requests matching `route` to `handler`. Routes are tried in the
    /// order they were appended.
    pub fn append_handler(&self, route: impl Into<Route>, handler: impl HttpHandler + 'static) {
        self.routes.append(route.into(), Arc::new(handler));
    }

    /// Upgrades requests matching `route` to WebSocket connections served by `handler`.
    pub fn append_ws_handler(&self, route: impl Into<Route>, handler: Arc<dyn WsHandler>) {
        self.append_handler(route, WebSocketHttpHandler::new(handler));
    }

    /// Answers `request` as a connection would, without any socket involved.
    pub async fn handle_request(&self, request: Request) -> Response {
        dispatch(&*self.routes, request, self.config.timeout(), &*self.logger).await
    }

    /// The address being listened on, once started.
    pub fn local_address(&self) -> Option<Address> {
        self.local_address.lock().ok().and_then(|address| address.clone())
    }

    /// Listens on the configured address and serves until [`stop`](HttpServer::stop).
    ///
    /// A Unix-domain socket file created here is removed on return.
    pub async fn start(&self) -> Result<()> {
        let address = self.config.listen_address()?;
        let result = self.start_on(Socket::listen(&address)?).await;

        if let Address::Unix(path) = &address {
            if let Err(err) = std::fs::remove_file(path) {
                self.logger.log_debug(&format!("could not remove {}: {}", path, err));
            }
        }
        result
    }

    /// Serves connections accepted on `listener` until [`stop`](HttpServer::stop).
    ///
    /// Starts the pool's run loop on its own thread unless it is already running.
    pub async fn start_on(&self, listener: Socket) -> Result<()> {
        let listener = AsyncSocket::new(listener, self.pool.clone())?;
        let address = listener.local_address()?;
        if let Ok(mut local) = self.local_address.lock() {
            *local = Some(address.clone());
        }

        if !self.pool.is_running() {
            pool::spawn(self.pool.clone())?;
        }

        self.logger.log_info(&format!("starting server on {}", address));
        let mut shutdown = self.shutdown.subscribe();

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(socket) => {
                        let handler: Arc<dyn HttpHandler> = self.routes.clone();
                        let connection = HttpConnection::new(socket, handler, &self.config, self.logger.clone());
                        tokio::spawn(connection.run());
                    }
                    Err(SocketError::PoolStopped) => break,
                    Err(err) if err.is_disconnect() => break,
                    Err(err) => {
                        self.logger.log_error(&format!("accept failed: {}", err));
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                _ = shutdown.changed() => {}
            }
        }

        self.logger.log_info(&format!("stopped server on {}", address));
        listener.close()
    }

    /// Stops accepting, and fails every suspended socket operation with
    /// `PoolStopped` so open connections are torn down.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
        self.pool.stop();
    }

    /// Serves on a new multi-threaded tokio runtime with `worker_threads` workers.
    pub fn run_blocking(self) -> Result<()> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.config.worker_threads.max(1))
            .thread_name("tern-worker")
            .enable_all()
            .build()?;
        runtime.block_on(self.start())
    }
}
