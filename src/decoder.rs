//! HTTP/1.x message decoding from a [`ChunkedByteSequence`].
use std::str;
use std::sync::Arc;

use hyper::body::Bytes;

use crate::error::{HttpError, HttpResult, SocketError};
use crate::http::{header, split_target, Body, Headers, Method, Payload, Request, Response, StatusCode, Version};
use crate::sequence::{ChunkedByteSequence, SharedBytes};

const CRLF: &[u8] = b"\r\n";

/// Largest piece handed out by a chunked body at once.
const MAX_PIECE: usize = 64 * 1024;

/// Stateless HTTP/1.x decoder.
pub struct HttpDecoder;

impl HttpDecoder {
    /// Decodes one request from `bytes`.
    ///
    /// The body is not read here; the returned request's body pulls it from
    /// `bytes` on demand, whether it is chunked or has a `Content-Length`.
    ///
    /// # Errors
    /// - `Disconnected` if the stream ended before the first byte of the request
    /// - `Malformed` for a bad request line, a header without a colon, or a
    ///   stream that ends mid-request
    /// - `UnsupportedTransferEncoding` for anything other than chunked
    pub async fn decode_request(bytes: &SharedBytes) -> HttpResult<Request> {
        let mut sequence = bytes.lock().await;

        let line = loop {
            match sequence.next_line(CRLF).await {
                // tolerate stray line breaks between messages
                Ok(Some(line)) if line.is_empty() => continue,
                Ok(Some(line)) => break line,
                Ok(None) => return Err(HttpError::Disconnected),
                Err(err) => return Err(truncated(err)),
            }
        };

        let (method, target, version) = parse_request_line(&line)?;
        let headers = read_headers(&mut sequence).await?;
        let (path, query) = split_target(target);

        let body = match body_framing(&headers)? {
            Framing::None => Body::empty(),
            Framing::Length(0) => Body::empty(),
            Framing::Length(length) => Body::from_request(RequestBody::fixed(bytes.clone(), length)),
            Framing::Chunked => Body::from_request(RequestBody::chunked(bytes.clone())),
        };

        Ok(Request { method, version, path, query, headers, body })
    }

    /// Decodes one response from `bytes`, reading its whole body.
    ///
    /// This is the client side of the codec.
    pub async fn decode_response(bytes: &SharedBytes) -> HttpResult<Response> {
        let mut sequence = bytes.lock().await;

        let line = match sequence.next_line(CRLF).await {
            Ok(Some(line)) => line,
            Ok(None) => return Err(HttpError::Disconnected),
            Err(err) => return Err(truncated(err)),
        };

        let (version, status) = parse_status_line(&line)?;
        let headers = read_headers(&mut sequence).await?;
        let mut response = Response::new(status);
        response.version = version;
        response.headers = headers;

        let bodiless = status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED;
        if bodiless {
            return Ok(response);
        }

        let body = match body_framing(&response.headers)? {
            Framing::Chunked => {
                let mut collected = bytes::BytesMut::new();
                loop {
                    let size = read_chunk_size(&mut sequence).await?;
                    if size == 0 {
                        read_trailers(&mut sequence).await?;
                        break;
                    }
                    collected.extend_from_slice(&read_exact(&mut sequence, size).await?);
                    expect_crlf(&mut sequence).await?;
                }
                collected.freeze()
            }
            Framing::Length(length) => read_exact(&mut sequence, length).await?,
            Framing::None if response.should_keep_alive() => Bytes::new(),
            Framing::None => {
                let mut collected = bytes::BytesMut::new();
                while let Some(piece) = sequence.next_available(MAX_PIECE).await? {
                    collected.extend_from_slice(&piece);
                }
                collected.freeze()
            }
        };

        response.payload = Payload::from(Body::new(body));
        Ok(response)
    }
}

/// A request body read lazily from the connection's byte sequence, framed
/// either by `Content-Length` or by chunked transfer encoding.
///
/// Clones share one decode state, so the connection can drain whatever the
/// handler left unread before decoding the next request. The state advances
/// only after each step completes, so a read abandoned part way, such as by a
/// handler timeout, resumes where it stopped.
#[derive(Clone)]
pub struct RequestBody {
    state: Arc<futures::lock::Mutex<BodyState>>,
    length: Option<usize>,
}

struct BodyState {
    bytes: SharedBytes,
    chunked: bool,
    phase: Phase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Expecting a chunk-size line.
    Size,
    /// Bytes left in the current chunk, or in a fixed-length body.
    Data(usize),
    /// Chunk data is consumed but its CRLF is not.
    Crlf,
    Trailers,
    Finished,
}

impl RequestBody {
    pub(crate) fn chunked(bytes: SharedBytes) -> Self {
        RequestBody::with_phase(bytes, true, Phase::Size, None)
    }

    pub(crate) fn fixed(bytes: SharedBytes, length: usize) -> Self {
        let phase = if length == 0 { Phase::Finished } else { Phase::Data(length) };
        RequestBody::with_phase(bytes, false, phase, Some(length))
    }

    fn with_phase(bytes: SharedBytes, chunked: bool, phase: Phase, length: Option<usize>) -> Self {
        RequestBody {
            state: Arc::new(futures::lock::Mutex::new(BodyState { bytes, chunked, phase })),
            length,
        }
    }

    /// The `Content-Length`, if the body declared one.
    pub fn declared_length(&self) -> Option<usize> {
        self.length
    }

    /// Next piece of body data, or `None` once the body is complete.
    pub async fn next_chunk(&self) -> HttpResult<Option<Bytes>> {
        let mut state = self.state.lock().await;
        let bytes = state.bytes.clone();
        let mut sequence = bytes.lock().await;

        loop {
            let phase = state.phase;
            match phase {
                Phase::Finished => return Ok(None),
                Phase::Crlf => {
                    expect_crlf(&mut sequence).await?;
                    state.phase = Phase::Size;
                }
                Phase::Size => {
                    let size = read_chunk_size(&mut sequence).await?;
                    state.phase = if size == 0 { Phase::Trailers } else { Phase::Data(size) };
                }
                Phase::Trailers => {
                    read_trailers(&mut sequence).await?;
                    state.phase = Phase::Finished;
                }
                Phase::Data(remaining) => {
                    let piece = sequence
                        .next_available(remaining.min(MAX_PIECE))
                        .await
                        .map_err(truncated)?
                        .ok_or_else(|| HttpError::malformed("connection closed inside the body"))?;

                    state.phase = match remaining - piece.len() {
                        0 if state.chunked => Phase::Crlf,
                        0 => Phase::Finished,
                        left => Phase::Data(left),
                    };
                    return Ok(Some(piece));
                }
            }
        }
    }

    /// Consumes the rest of the body.
    pub async fn drain(&self) -> HttpResult<()> {
        while self.next_chunk().await?.is_some() {}
        Ok(())
    }

    pub async fn is_finished(&self) -> bool {
        self.state.lock().await.phase == Phase::Finished
    }
}

enum Framing {
    None,
    Length(usize),
    Chunked,
}

fn body_framing(headers: &Headers) -> HttpResult<Framing> {
    let codings: Vec<&str> = headers
        .get_all(header::TRANSFER_ENCODING)
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|coding| !coding.is_empty())
        .collect();

    if !codings.is_empty() {
        let supported = codings
            .iter()
            .all(|coding| coding.eq_ignore_ascii_case("chunked") || coding.eq_ignore_ascii_case("identity"));
        if !supported {
            return Err(HttpError::UnsupportedTransferEncoding(codings.join(", ")));
        }
        if codings.iter().any(|coding| coding.eq_ignore_ascii_case("chunked")) {
            return Ok(Framing::Chunked);
        }
    }

    match headers.get(header::CONTENT_LENGTH) {
        Some(value) => value
            .trim()
            .parse()
            .map(Framing::Length)
            .map_err(|_| HttpError::malformed(format!("invalid Content-Length: {}", value))),
        None => Ok(Framing::None),
    }
}

/// Maps a byte-sequence failure inside a message to an HTTP error.
fn truncated(err: SocketError) -> HttpError {
    match err {
        SocketError::Disconnected => HttpError::malformed("connection closed mid-message"),
        SocketError::LineTooLong(_) => HttpError::HeaderTooLarge,
        err => HttpError::Socket(err),
    }
}

fn parse_version(version: &str) -> HttpResult<Version> {
    match version {
        "HTTP/1.1" => Ok(Version::HTTP_11),
        "HTTP/1.0" => Ok(Version::HTTP_10),
        other => Err(HttpError::malformed(format!("unsupported version {:?}", other))),
    }
}

fn parse_request_line(line: &[u8]) -> HttpResult<(Method, &str, Version)> {
    let line = str::from_utf8(line).map_err(|_| HttpError::malformed("request line is not valid UTF-8"))?;
    let mut parts = line.split(' ');

    let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(target), Some(version), None) if !target.is_empty() => (method, target, version),
        _ => return Err(HttpError::malformed(format!("invalid request line {:?}", line))),
    };

    let method = Method::from_bytes(method.as_bytes())
        .map_err(|_| HttpError::malformed(format!("invalid method {:?}", method)))?;

    Ok((method, target, parse_version(version)?))
}

fn parse_status_line(line: &[u8]) -> HttpResult<(Version, StatusCode)> {
    let line = str::from_utf8(line).map_err(|_| HttpError::malformed("status line is not valid UTF-8"))?;
    let (version, rest) = line
        .split_once(' ')
        .ok_or_else(|| HttpError::malformed(format!("invalid status line {:?}", line)))?;
    let code = rest.split(' ').next().unwrap_or_default();

    let status = code
        .parse::<u16>()
        .ok()
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| HttpError::malformed(format!("invalid status code {:?}", code)))?;

    Ok((parse_version(version)?, status))
}

async fn read_headers(sequence: &mut ChunkedByteSequence) -> HttpResult<Headers> {
    let mut headers = Headers::new();
    loop {
        let line = sequence
            .next_line(CRLF)
            .await
            .map_err(truncated)?
            .ok_or_else(|| HttpError::malformed("connection closed inside headers"))?;

        if line.is_empty() {
            return Ok(headers);
        }

        let line = str::from_utf8(&line).map_err(|_| HttpError::malformed("header is not valid UTF-8"))?;
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| HttpError::malformed(format!("header without colon: {:?}", line)))?;

        let name = name.trim();
        if name.is_empty() {
            return Err(HttpError::malformed("empty header name"));
        }
        headers.append(name, value.trim());
    }
}

async fn read_exact(sequence: &mut ChunkedByteSequence, length: usize) -> HttpResult<Bytes> {
    if length == 0 {
        return Ok(Bytes::new());
    }
    sequence
        .next_chunk(length)
        .await
        .map_err(truncated)?
        .ok_or_else(|| HttpError::malformed("connection closed before the body"))
}

async fn read_chunk_size(sequence: &mut ChunkedByteSequence) -> HttpResult<usize> {
    let line = sequence
        .next_line(CRLF)
        .await
        .map_err(truncated)?
        .ok_or_else(|| HttpError::malformed("connection closed before a chunk"))?;

    let line = str::from_utf8(&line).map_err(|_| HttpError::malformed("chunk size is not valid UTF-8"))?;
    // chunk extensions follow a ';' and are ignored
    let size = line.split(';').next().unwrap_or_default().trim();
    usize::from_str_radix(size, 16).map_err(|_| HttpError::malformed(format!("invalid chunk size {:?}", size)))
}

async fn read_trailers(sequence: &mut ChunkedByteSequence) -> HttpResult<()> {
    loop {
        let line = sequence
            .next_line(CRLF)
            .await
            .map_err(truncated)?
            .ok_or_else(|| HttpError::malformed("connection closed inside trailers"))?;
        if line.is_empty() {
            return Ok(());
        }
    }
}

async fn expect_crlf(sequence: &mut ChunkedByteSequence) -> HttpResult<()> {
    match read_exact(sequence, CRLF.len()).await? {
        ref delimiter if delimiter[..] == *CRLF => Ok(()),
        _ => Err(HttpError::malformed("chunk data not followed by CRLF")),
    }
}
