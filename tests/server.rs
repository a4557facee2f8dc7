use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tern::{
    Address, BoxError, DisabledLogger, EchoMessageHandler, HttpServer, MessageFrameHandler, Request, Response,
    ServerConfig, Socket, StatusCode, WsFrame, WsFrameEncoder,
};

const READ_TIMEOUT: Duration = Duration::from_secs(5);

struct Fixture {
    runtime: tokio::runtime::Runtime,
    server: Arc<HttpServer>,
}

impl Fixture {
    fn new() -> Self {
        let config = ServerConfig { timeout_ms: 200, poll_interval_ms: 20, ..ServerConfig::default() };
        let server = HttpServer::new(config).unwrap().with_logger(Arc::new(DisabledLogger));

        server.append_handler("GET /accepted", |_request: Request| async {
            Ok::<_, BoxError>(Response::new(StatusCode::ACCEPTED).with_body("accepted"))
        });
        server.append_handler("GET /gone/*", |_request: Request| async {
            Ok::<_, BoxError>(Response::new(StatusCode::GONE))
        });
        server.append_handler("GET /slow", |_request: Request| async {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Ok::<_, BoxError>(Response::new(StatusCode::OK))
        });
        server.append_handler("POST /echo", |request: Request| async move {
            let body = request.body.bytes().await?;
            Ok::<_, BoxError>(Response::new(StatusCode::OK).with_body(body))
        });
        server.append_ws_handler("GET /socket", Arc::new(MessageFrameHandler::new(EchoMessageHandler)));
        server.append_handler("*", |_request: Request| async {
            Ok::<_, BoxError>(Response::new(StatusCode::ACCEPTED))
        });

        Fixture { runtime: tokio::runtime::Runtime::new().unwrap(), server: Arc::new(server) }
    }

    fn serve(&self, listener: Socket) {
        let server = self.server.clone();
        self.runtime.spawn(async move { server.start_on(listener).await });
    }

    fn serve_tcp(&self) -> TcpStream {
        let listener = Socket::listen(&Address::loopback(0)).unwrap();
        let address = listener.local_address().unwrap();
        self.serve(listener);

        let stream = TcpStream::connect(address.to_string()).unwrap();
        stream.set_read_timeout(Some(READ_TIMEOUT)).unwrap();
        stream
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        self.server.stop();
    }
}

fn unique_socket_path() -> String {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let name = format!("tern-{}-{}.sock", std::process::id(), COUNTER.fetch_add(1, Ordering::SeqCst));
    std::env::temp_dir().join(name).to_string_lossy().into_owned()
}

/// Reads one response: the head as text and a `Content-Length` body.
fn read_response(stream: &mut impl Read) -> (String, Vec<u8>) {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).unwrap();
        head.push(byte[0]);
    }
    let head = String::from_utf8(head).unwrap();

    let length = head
        .lines()
        .find_map(|line| line.strip_prefix("Content-Length: "))
        .map(|length| length.trim().parse::<usize>().unwrap())
        .unwrap_or(0);
    let mut body = vec![0; length];
    stream.read_exact(&mut body).unwrap();
    (head, body)
}

/// Tests the catch-all route over a Unix-domain socket.
#[test]
fn test_unix_socket_request() {
    let fixture = Fixture::new();
    let path = unique_socket_path();
    fixture.serve(Socket::listen(&Address::unix(&path)).unwrap());

    let mut stream = UnixStream::connect(&path).unwrap();
    stream.set_read_timeout(Some(READ_TIMEOUT)).unwrap();
    stream.write_all(b"GET /hello/world HTTP/1.1\r\n\r\n").unwrap();

    let mut status = [0u8; 21];
    stream.read_exact(&mut status).unwrap();
    assert_eq!(&status, b"HTTP/1.1 202 Accepted");

    drop(fixture);
    let _ = std::fs::remove_file(&path);
}

/// Tests two requests answered in order on one keep-alive connection.
#[test]
fn test_keep_alive() {
    let fixture = Fixture::new();
    let mut stream = fixture.serve_tcp();

    stream.write_all(b"GET /accepted HTTP/1.1\r\nHost: localhost\r\n\r\n").unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 202 Accepted\r\n"));
    assert!(head.contains("Connection: keep-alive\r\n"));
    assert_eq!(body, b"accepted");

    stream.write_all(b"GET /gone/fish HTTP/1.1\r\n\r\n").unwrap();
    let (head, _) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 410 Gone\r\n"));
}

/// Tests that an HTTP/1.0 request gets exactly one response before the close.
#[test]
fn test_http_10_closes() {
    let fixture = Fixture::new();
    let mut stream = fixture.serve_tcp();

    stream.write_all(b"GET /accepted HTTP/1.0\r\n\r\nGET /accepted HTTP/1.0\r\n\r\n").unwrap();
    let mut everything = String::new();
    stream.read_to_string(&mut everything).unwrap();

    assert!(everything.starts_with("HTTP/1.0 202 Accepted\r\n"));
    assert!(everything.contains("Connection: close\r\n"));
    assert_eq!(everything.matches("HTTP/1.0").count(), 1);
}

/// Tests that a handler timeout is answered with a 500 and the connection survives it.
#[test]
fn test_handler_timeout() {
    let fixture = Fixture::new();
    let mut stream = fixture.serve_tcp();

    stream.write_all(b"GET /slow HTTP/1.1\r\n\r\n").unwrap();
    let (head, _) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));

    stream.write_all(b"GET /missing/route HTTP/1.1\r\n\r\n").unwrap();
    let (head, _) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 202 Accepted\r\n"));
}

/// Tests a chunked request body arriving over several writes.
#[test]
fn test_chunked_request_body() {
    let fixture = Fixture::new();
    let mut stream = fixture.serve_tcp();

    stream.write_all(b"POST /echo HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n").unwrap();
    for piece in ["5\r\nhel", "lo\r\n", "6\r\n, tern\r\n", "0\r\n\r\n"] {
        std::thread::sleep(Duration::from_millis(10));
        stream.write_all(piece.as_bytes()).unwrap();
    }

    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(body, b"hello, tern");
}

/// Tests the upgrade handshake and an echoed message over TCP.
#[test]
fn test_web_socket_echo() {
    let fixture = Fixture::new();
    let mut stream = fixture.serve_tcp();

    stream
        .write_all(
            b"GET /socket HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
        )
        .unwrap();
    let (head, _) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
    assert!(head.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));

    let hello = WsFrame::text("hello").with_mask([0x12, 0x34, 0x56, 0x78]);
    stream.write_all(&WsFrameEncoder::encode_frame(&hello)).unwrap();
    let mut echoed = [0u8; 7];
    stream.read_exact(&mut echoed).unwrap();
    assert_eq!(&echoed, b"\x81\x05hello");

    let close = WsFrame::close(1000).with_mask([1, 2, 3, 4]);
    stream.write_all(&WsFrameEncoder::encode_frame(&close)).unwrap();
    let mut closed = [0u8; 4];
    stream.read_exact(&mut closed).unwrap();
    assert_eq!(&closed, &[0x88, 0x02, 0x03, 0xE8]);
}

/// Tests that a plain request to a WebSocket route is told to upgrade.
#[test]
fn test_web_socket_requires_upgrade() {
    let fixture = Fixture::new();
    let mut stream = fixture.serve_tcp();

    stream.write_all(b"GET /socket HTTP/1.1\r\n\r\n").unwrap();
    let (head, _) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 426 Upgrade Required\r\n"));
}

/// Tests that stopping the server tears down an idle keep-alive connection.
#[test]
fn test_stop_closes_idle_connections() {
    let fixture = Fixture::new();
    let mut stream = fixture.serve_tcp();

    stream.write_all(b"GET /accepted HTTP/1.1\r\n\r\n").unwrap();
    read_response(&mut stream);

    fixture.server.stop();
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());
}

/// Tests the route table through the server's in-process entry point.
#[test]
fn test_handle_request_statuses() {
    let fixture = Fixture::new();
    let server = fixture.server.clone();

    fixture.runtime.block_on(async move {
        let get = |path: &str| Request::new(tern::Method::GET, path);
        assert_eq!(server.handle_request(get("/accepted")).await.status, StatusCode::ACCEPTED);
        assert_eq!(server.handle_request(get("/gone/away")).await.status, StatusCode::GONE);
        assert_eq!(server.handle_request(get("/slow")).await.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            server.handle_request(Request::new(tern::Method::DELETE, "/accepted")).await.status,
            StatusCode::ACCEPTED
        );
    });
}
