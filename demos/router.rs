//! Path-parameter routing with `matchit` behind a single tern handler.
//!
//! The server's own routes match whole segments only; this demo hands every
//! request to one [`HttpHandler`] that looks paths up in a `matchit::Router`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use matchit::Router;
use tern::{BoxError, HttpHandler, HttpServer, Request, Response, ServerConfig, StatusCode};

/// A route handler that also receives the matched path parameters.
type Handler = Box<dyn Fn(&Request, &matchit::Params) -> Response + Send + Sync>;

struct RouterService {
    router: Router<Handler>,
}

impl RouterService {
    /// Routes:
    /// - `/` returns a welcome message
    /// - `/hello/:name` returns a personalized greeting
    /// - `/counter` returns and increments a shared counter
    fn new() -> Result<Self, matchit::InsertError> {
        let mut router: Router<Handler> = Router::new();
        let counter = Arc::new(AtomicU64::new(0));

        router.insert(
            "/",
            Box::new(|_request: &Request, _params: &matchit::Params| {
                Response::new(StatusCode::OK).with_body("Welcome to tern!")
            }),
        )?;

        router.insert(
            "/hello/:name",
            Box::new(|_request: &Request, params: &matchit::Params| {
                let name = params.get("name").unwrap_or("world");
                Response::new(StatusCode::OK).with_body(format!("Hello, {}!", name))
            }),
        )?;

        router.insert(
            "/counter",
            Box::new(move |_request: &Request, _params: &matchit::Params| {
                let count = counter.fetch_add(1, Ordering::SeqCst) + 1;
                Response::new(StatusCode::OK).with_body(format!("Counter: {}", count))
            }),
        )?;

        Ok(RouterService { router })
    }
}

#[async_trait]
impl HttpHandler for RouterService {
    async fn handle_request(&self, request: Request) -> Result<Response, BoxError> {
        match self.router.at(&request.path) {
            Ok(matched) => Ok((matched.value)(&request, &matched.params)),
            Err(_) => Ok(Response::new(StatusCode::NOT_FOUND).with_body("Not Found")),
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ServerConfig { port: 3000, ..ServerConfig::new()? };
    let server = HttpServer::new(config)?;
    server.append_handler("*", RouterService::new()?);

    println!("Server running at http://127.0.0.1:3000");
    println!("Try these routes:");
    println!("  - /");
    println!("  - /hello/your-name");
    println!("  - /counter (increments on each visit)");

    server.run_blocking()?;
    Ok(())
}
