//! HTTP/1.x message encoding.
use bytes::BytesMut;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use hyper::body::Bytes;

use crate::error::HttpResult;
use crate::http::{header, version_str, Headers, Payload, Request, Response, StatusCode, Version};

const CRLF: &[u8] = b"\r\n";
const TERMINAL_CHUNK: &[u8] = b"0\r\n\r\n";

/// Stateless HTTP/1.x encoder.
pub struct HttpEncoder;

impl HttpEncoder {
    /// Status line and headers of `response`, terminated by the blank line.
    ///
    /// `Content-Length` or `Transfer-Encoding` are replaced to match the payload,
    /// and `Connection` to match [`Response::should_keep_alive`]. An upgrade
    /// response keeps its own `Connection: Upgrade`. HTTP/1.0 has no chunked
    /// coding, so a streamed HTTP/1.0 response carries neither framing header
    /// and is delimited by the close.
    pub fn encode_head(response: &Response) -> Bytes {
        let mut headers = response.headers.clone();
        headers.remove(header::CONTENT_LENGTH);
        headers.remove(header::TRANSFER_ENCODING);

        match &response.payload {
            Payload::Empty if forbids_body(response.status) => {}
            Payload::Empty => headers.insert(header::CONTENT_LENGTH, "0"),
            Payload::Bytes(body) => headers.insert(header::CONTENT_LENGTH, body.len().to_string()),
            Payload::Stream(_) if response.version == Version::HTTP_10 => {}
            Payload::Stream(_) => headers.insert(header::TRANSFER_ENCODING, "chunked"),
            Payload::WebSocket(_) => {}
        }

        if !response.is_web_socket() {
            let connection = if response.should_keep_alive() { "keep-alive" } else { "close" };
            headers.insert(header::CONNECTION, connection);
        }

        let status = response.status;
        let line = format!(
            "{} {} {}",
            version_str(response.version),
            status.as_u16(),
            status.canonical_reason().unwrap_or("Unknown")
        );
        encode_message_head(&line, &headers)
    }

    /// The whole response as a stream of byte pieces, ready to be written in order.
    ///
    /// A streamed payload is framed with chunked transfer encoding and ended
    /// by the zero-length terminal chunk, except for HTTP/1.0 where the pieces
    /// go out raw and the connection close ends the body.
    pub fn encode_response(response: Response) -> BoxStream<'static, HttpResult<Bytes>> {
        let head = HttpEncoder::encode_head(&response);
        let chunked = response.version != Version::HTTP_10;

        match response.payload {
            Payload::Empty | Payload::WebSocket(_) => stream::iter(vec![Ok(head)]).boxed(),
            Payload::Bytes(body) => stream::iter(vec![Ok(head), Ok(body)]).boxed(),
            Payload::Stream(body) => {
                let chunks = stream::unfold(Some(body), move |body| async move {
                    let mut body = body?;
                    loop {
                        match body.next_chunk().await {
                            // an empty chunk would read as the terminal one
                            Ok(Some(chunk)) if chunk.is_empty() => continue,
                            Ok(Some(chunk)) if chunked => {
                                return Some((Ok(HttpEncoder::encode_chunk(&chunk)), Some(body)))
                            }
                            Ok(Some(chunk)) => return Some((Ok(chunk), Some(body))),
                            Ok(None) if chunked => return Some((Ok(Bytes::from_static(TERMINAL_CHUNK)), None)),
                            Ok(None) => return None,
                            Err(err) => return Some((Err(err), None)),
                        }
                    }
                });
                stream::iter(vec![Ok(head)]).chain(chunks).boxed()
            }
        }
    }

    /// One non-empty chunk in chunked transfer encoding.
    pub fn encode_chunk(data: &[u8]) -> Bytes {
        let size = format!("{:x}\r\n", data.len());
        let mut chunk = BytesMut::with_capacity(size.len() + data.len() + CRLF.len());
        chunk.extend_from_slice(size.as_bytes());
        chunk.extend_from_slice(data);
        chunk.extend_from_slice(CRLF);
        chunk.freeze()
    }

    /// Encodes a request for the client side, reading its whole body.
    ///
    /// Bodies of known length get `Content-Length`; streamed and chunked
    /// bodies are re-framed as chunked.
    pub async fn encode_request(request: Request) -> HttpResult<Bytes> {
        let target = request.target();
        let Request { method, version, mut headers, mut body, .. } = request;
        headers.remove(header::CONTENT_LENGTH);
        headers.remove(header::TRANSFER_ENCODING);

        let mut payload = BytesMut::new();
        match body.len() {
            Some(0) => {}
            Some(length) => {
                headers.insert(header::CONTENT_LENGTH, length.to_string());
                while let Some(chunk) = body.next_chunk().await? {
                    payload.extend_from_slice(&chunk);
                }
            }
            None => {
                headers.insert(header::TRANSFER_ENCODING, "chunked");
                while let Some(chunk) = body.next_chunk().await? {
                    if !chunk.is_empty() {
                        payload.extend_from_slice(&HttpEncoder::encode_chunk(&chunk));
                    }
                }
                payload.extend_from_slice(TERMINAL_CHUNK);
            }
        }

        let line = format!("{} {} {}", method, target, version_str(version));
        let mut message = BytesMut::from(&encode_message_head(&line, &headers)[..]);
        message.extend_from_slice(&payload);
        Ok(message.freeze())
    }
}

fn forbids_body(status: StatusCode) -> bool {
    status.is_informational() || status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED
}

fn encode_message_head(line: &str, headers: &Headers) -> Bytes {
    let mut head = BytesMut::with_capacity(256);
    head.extend_from_slice(line.as_bytes());
    head.extend_from_slice(CRLF);
    for (name, value) in headers.iter() {
        head.extend_from_slice(name.as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(CRLF);
    }
    head.extend_from_slice(CRLF);
    head.freeze()
}
