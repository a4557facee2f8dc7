//! WebSocket support: RFC 6455 framing over the connection's byte sequence,
//! the upgrade handshake, and the handler traits an upgraded connection drives.
//!
//! Handlers come in two layers. A [`WsHandler`] maps the raw inbound frames to
//! outbound frames. A [`WsMessageHandler`] works on whole messages instead and is
//! adapted to frames by [`MessageFrameHandler`], which also answers pings and
//! echoes the closing handshake.
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::{BufMut, BytesMut};
use futures::channel::mpsc;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use hyper::body::Bytes;
use sha1::{Digest, Sha1};

use crate::error::{BoxError, SocketError, WsError};
use crate::http::{header, Method, Request, Response, StatusCode};
use crate::sequence::{ChunkedByteSequence, SharedBytes};
use crate::server::HttpHandler;

/// Appended to the client key before hashing (RFC 6455 section 1.3).
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Largest payload a single frame may declare.
const MAX_PAYLOAD: u64 = 16 * 1024 * 1024;

pub const CLOSE_NORMAL: u16 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    fn from_u8(value: u8) -> Result<Self, WsError> {
        match value {
            0x0 => Ok(Opcode::Continuation),
            0x1 => Ok(Opcode::Text),
            0x2 => Ok(Opcode::Binary),
            0x8 => Ok(Opcode::Close),
            0x9 => Ok(Opcode::Ping),
            0xA => Ok(Opcode::Pong),
            other => Err(WsError::Malformed(format!("unknown opcode 0x{:X}", other))),
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

/// One WebSocket frame. `payload` is always held unmasked; `mask` records the
/// key it travels with on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsFrame {
    pub fin: bool,
    pub opcode: Opcode,
    pub mask: Option<[u8; 4]>,
    pub payload: Bytes,
}

impl WsFrame {
    /// A final, unmasked frame.
    pub fn new(opcode: Opcode, payload: impl Into<Bytes>) -> Self {
        WsFrame { fin: true, opcode, mask: None, payload: payload.into() }
    }

    pub fn text(text: &str) -> Self {
        WsFrame::new(Opcode::Text, Bytes::copy_from_slice(text.as_bytes()))
    }

    pub fn binary(data: impl Into<Bytes>) -> Self {
        WsFrame::new(Opcode::Binary, data)
    }

    pub fn ping(data: impl Into<Bytes>) -> Self {
        WsFrame::new(Opcode::Ping, data)
    }

    pub fn pong(data: impl Into<Bytes>) -> Self {
        WsFrame::new(Opcode::Pong, data)
    }

    pub fn close(code: u16) -> Self {
        WsFrame::new(Opcode::Close, Bytes::copy_from_slice(&code.to_be_bytes()))
    }

    pub fn with_fin(mut self, fin: bool) -> Self {
        self.fin = fin;
        self
    }

    pub fn with_mask(mut self, mask: [u8; 4]) -> Self {
        self.mask = Some(mask);
        self
    }

    /// Status code carried by a close frame, if any.
    pub fn close_code(&self) -> Option<u16> {
        match (self.opcode, self.payload.get(..2)) {
            (Opcode::Close, Some(code)) => Some(u16::from_be_bytes([code[0], code[1]])),
            _ => None,
        }
    }
}

/// Pull-based decoder of WebSocket frames from a byte sequence.
///
/// A disconnect, even mid-frame, ends the sequence cleanly. A malformed frame
/// is reported once and also ends it, as does a close frame.
pub struct WsFrameSequence {
    bytes: SharedBytes,
    masked_only: bool,
    finished: bool,
}

impl WsFrameSequence {
    pub fn new(bytes: SharedBytes) -> Self {
        WsFrameSequence { bytes, masked_only: false, finished: false }
    }

    /// Rejects unmasked frames, as a server must for client frames.
    pub fn masked_only(mut self) -> Self {
        self.masked_only = true;
        self
    }

    pub async fn try_next(&mut self) -> Result<Option<WsFrame>, WsError> {
        if self.finished {
            return Ok(None);
        }

        let result = self.read_frame().await;
        match &result {
            Ok(Some(frame)) if frame.opcode != Opcode::Close => {}
            _ => self.finished = true,
        }
        result
    }

    pub fn into_stream(self) -> BoxStream<'static, Result<WsFrame, WsError>> {
        stream::unfold(self, |mut frames| async move {
            match frames.try_next().await {
                Ok(Some(frame)) => Some((Ok(frame), frames)),
                Ok(None) => None,
                Err(err) => Some((Err(err), frames)),
            }
        })
        .boxed()
    }

    async fn read_frame(&self) -> Result<Option<WsFrame>, WsError> {
        let mut bytes = self.bytes.lock().await;

        let header = match read(&mut bytes, 2).await? {
            Some(header) => header,
            None => return Ok(None),
        };

        if header[0] & 0x70 != 0 {
            return Err(WsError::Malformed("reserved bits set".into()));
        }
        let fin = header[0] & 0x80 != 0;
        let opcode = Opcode::from_u8(header[0] & 0x0F)?;
        let masked = header[1] & 0x80 != 0;

        if self.masked_only && !masked {
            return Err(WsError::Malformed("client frame is not masked".into()));
        }

        let length = match header[1] & 0x7F {
            126 => match read(&mut bytes, 2).await? {
                Some(length) => u64::from(u16::from_be_bytes([length[0], length[1]])),
                None => return Ok(None),
            },
            127 => match read(&mut bytes, 8).await? {
                Some(length) => {
                    let mut be = [0; 8];
                    be.copy_from_slice(&length);
                    u64::from_be_bytes(be)
                }
                None => return Ok(None),
            },
            length => u64::from(length),
        };

        if opcode.is_control() && (length > 125 || !fin) {
            return Err(WsError::Malformed("control frame fragmented or longer than 125 bytes".into()));
        }
        if length > MAX_PAYLOAD {
            return Err(WsError::Malformed(format!("payload of {} bytes exceeds limit", length)));
        }

        let mask = if masked {
            match read(&mut bytes, 4).await? {
                Some(key) => Some([key[0], key[1], key[2], key[3]]),
                None => return Ok(None),
            }
        } else {
            None
        };

        let payload = match read(&mut bytes, length as usize).await? {
            Some(payload) => payload,
            None => return Ok(None),
        };
        let payload = match mask {
            Some(key) => apply_mask(&payload, key),
            None => payload,
        };

        Ok(Some(WsFrame { fin, opcode, mask, payload }))
    }
}

/// Takes exactly `length` bytes; `None` when the peer has gone.
async fn read(bytes: &mut ChunkedByteSequence, length: usize) -> Result<Option<Bytes>, WsError> {
    if length == 0 {
        return Ok(Some(Bytes::new()));
    }
    match bytes.next_chunk(length).await {
        Ok(chunk) => Ok(chunk),
        Err(SocketError::Disconnected) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn apply_mask(payload: &[u8], key: [u8; 4]) -> Bytes {
    payload
        .iter()
        .enumerate()
        .map(|(i, byte)| byte ^ key[i % 4])
        .collect::<Vec<u8>>()
        .into()
}

pub struct WsFrameEncoder;

impl WsFrameEncoder {
    /// Encodes `frame`, masking the payload only when the frame carries a key.
    pub fn encode_frame(frame: &WsFrame) -> Bytes {
        let length = frame.payload.len();
        let mut out = BytesMut::with_capacity(14 + length);

        let fin = if frame.fin { 0x80 } else { 0 };
        out.put_u8(fin | frame.opcode.as_u8());

        let mask_bit = if frame.mask.is_some() { 0x80 } else { 0 };
        if length < 126 {
            out.put_u8(mask_bit | length as u8);
        } else if length <= usize::from(u16::MAX) {
            out.put_u8(mask_bit | 126);
            out.put_u16(length as u16);
        } else {
            out.put_u8(mask_bit | 127);
            out.put_u64(length as u64);
        }

        match frame.mask {
            Some(key) => {
                out.put_slice(&key);
                out.put_slice(&apply_mask(&frame.payload, key));
            }
            None => out.put_slice(&frame.payload),
        }
        out.freeze()
    }
}

/// `Sec-WebSocket-Accept` value for a client's `Sec-WebSocket-Key`.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Checks that `request` asks for a WebSocket upgrade and returns the accept key.
pub fn verify_upgrade(request: &Request) -> Result<String, WsError> {
    if request.method != Method::GET {
        return Err(WsError::Handshake(format!("upgrade over {}", request.method)));
    }
    if !request.headers.contains_token(header::UPGRADE, "websocket") {
        return Err(WsError::Handshake("missing Upgrade: websocket".into()));
    }
    if !request.headers.contains_token(header::CONNECTION, "upgrade") {
        return Err(WsError::Handshake("missing Connection: Upgrade".into()));
    }
    if request.header(header::SEC_WEBSOCKET_VERSION).map(str::trim) != Some("13") {
        return Err(WsError::Handshake("unsupported Sec-WebSocket-Version".into()));
    }

    let key = request
        .header(header::SEC_WEBSOCKET_KEY)
        .map(str::trim)
        .ok_or_else(|| WsError::Handshake("missing Sec-WebSocket-Key".into()))?;
    match STANDARD.decode(key) {
        Ok(nonce) if nonce.len() == 16 => Ok(accept_key(key)),
        _ => Err(WsError::Handshake(format!("invalid Sec-WebSocket-Key {:?}", key))),
    }
}

/// Drives an upgraded connection: inbound frames in, outbound frames out.
///
/// The connection closes once the returned stream ends or a close frame
/// has been written.
#[async_trait]
pub trait WsHandler: Send + Sync {
    async fn make_frames(&self, frames: BoxStream<'static, WsFrame>) -> Result<BoxStream<'static, WsFrame>, BoxError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsMessage {
    Text(String),
    Data(Bytes),
    Close(u16),
}

impl WsMessage {
    fn into_frame(self) -> WsFrame {
        match self {
            WsMessage::Text(text) => WsFrame::text(&text),
            WsMessage::Data(data) => WsFrame::binary(data),
            WsMessage::Close(code) => WsFrame::close(code),
        }
    }
}

/// A handler working on whole messages; see [`MessageFrameHandler`].
#[async_trait]
pub trait WsMessageHandler: Send + Sync {
    async fn make_messages(
        &self,
        messages: BoxStream<'static, WsMessage>,
    ) -> Result<BoxStream<'static, WsMessage>, BoxError>;
}

/// Adapts a [`WsMessageHandler`] to frames.
///
/// Continuation frames are reassembled into one message. Pings are answered
/// with pongs and a close frame is echoed back, independently of the handler.
pub struct MessageFrameHandler<H> {
    handler: H,
}

impl<H: WsMessageHandler> MessageFrameHandler<H> {
    pub fn new(handler: H) -> Self {
        MessageFrameHandler { handler }
    }
}

struct Assembly {
    frames: BoxStream<'static, WsFrame>,
    control: mpsc::UnboundedSender<WsFrame>,
    partial: Option<(Opcode, BytesMut)>,
}

fn into_message(opcode: Opcode, payload: &[u8]) -> WsMessage {
    match opcode {
        Opcode::Text => WsMessage::Text(String::from_utf8_lossy(payload).into_owned()),
        _ => WsMessage::Data(Bytes::copy_from_slice(payload)),
    }
}

fn assemble_messages(
    frames: BoxStream<'static, WsFrame>,
    control: mpsc::UnboundedSender<WsFrame>,
) -> BoxStream<'static, WsMessage> {
    let assembly = Assembly { frames, control, partial: None };

    stream::unfold(Some(assembly), |assembly| async move {
        let mut assembly = assembly?;
        loop {
            let frame = assembly.frames.next().await?;
            match frame.opcode {
                Opcode::Ping => {
                    // the receiver only goes away with the connection
                    let _ = assembly.control.unbounded_send(WsFrame::pong(frame.payload));
                }
                Opcode::Pong => {}
                Opcode::Close => {
                    let code = frame.close_code().unwrap_or(CLOSE_NORMAL);
                    let _ = assembly.control.unbounded_send(WsFrame::close(code));
                    return Some((WsMessage::Close(code), None));
                }
                Opcode::Text | Opcode::Binary if frame.fin => {
                    return Some((into_message(frame.opcode, &frame.payload), Some(assembly)));
                }
                Opcode::Text | Opcode::Binary => {
                    assembly.partial = Some((frame.opcode, BytesMut::from(&frame.payload[..])));
                }
                Opcode::Continuation => {
                    let (opcode, mut buffer) = match assembly.partial.take() {
                        Some(partial) => partial,
                        None => {
                            log::debug!("Continuation frame without a message start");
                            return None;
                        }
                    };
                    buffer.extend_from_slice(&frame.payload);
                    if frame.fin {
                        return Some((into_message(opcode, &buffer), Some(assembly)));
                    }
                    assembly.partial = Some((opcode, buffer));
                }
            }
        }
    })
    .boxed()
}

#[async_trait]
impl<H: WsMessageHandler> WsHandler for MessageFrameHandler<H> {
    async fn make_frames(&self, frames: BoxStream<'static, WsFrame>) -> Result<BoxStream<'static, WsFrame>, BoxError> {
        let (control, replies_to_peer) = mpsc::unbounded();
        let messages = assemble_messages(frames, control);
        let replies = self.handler.make_messages(messages).await?;
        Ok(stream::select(replies_to_peer, replies.map(WsMessage::into_frame)).boxed())
    }
}

/// Echoes text and data messages back to the peer.
pub struct EchoMessageHandler;

#[async_trait]
impl WsMessageHandler for EchoMessageHandler {
    async fn make_messages(
        &self,
        messages: BoxStream<'static, WsMessage>,
    ) -> Result<BoxStream<'static, WsMessage>, BoxError> {
        // the close handshake is answered by the frame layer
        Ok(messages.filter(|message| futures::future::ready(!matches!(message, WsMessage::Close(_)))).boxed())
    }
}

/// An [`HttpHandler`] that upgrades every request to a WebSocket served by `handler`.
///
/// Requests that are not valid upgrades get `426 Upgrade Required`.
pub struct WebSocketHttpHandler {
    handler: Arc<dyn WsHandler>,
}

impl WebSocketHttpHandler {
    pub fn new(handler: Arc<dyn WsHandler>) -> Self {
        WebSocketHttpHandler { handler }
    }

    pub fn messages<H: WsMessageHandler + 'static>(handler: H) -> Self {
        WebSocketHttpHandler::new(Arc::new(MessageFrameHandler::new(handler)))
    }
}

#[async_trait]
impl HttpHandler for WebSocketHttpHandler {
    async fn handle_request(&self, request: Request) -> Result<Response, BoxError> {
        match Response::web_socket(&request, self.handler.clone()) {
            Ok(response) => Ok(response),
            Err(err) => {
                log::debug!("Rejected WebSocket upgrade: {}", err);
                Ok(Response::new(StatusCode::UPGRADE_REQUIRED)
                    .with_header(header::UPGRADE, "websocket")
                    .with_header(header::SEC_WEBSOCKET_VERSION, "13"))
            }
        }
    }
}
