//! Buffered, forward-only byte sequence used by every decoder.
//!
//! Bytes pulled from the underlying stream beyond what a decode step consumes
//! stay buffered for the next step, so one stream can carry many requests.
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use futures::stream::BoxStream;
use futures::StreamExt;
use hyper::body::Bytes;

use crate::error::{Result, SocketError};

/// A stream of raw chunks; `None` means the peer closed the connection.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// A [`ChunkedByteSequence`] shared between a connection and the bodies or
/// frame sequences decoded from it.
pub type SharedBytes = Arc<futures::lock::Mutex<ChunkedByteSequence>>;

const DEFAULT_LINE_LIMIT: usize = 65_536;

pub struct ChunkedByteSequence {
    source: ByteStream,
    buffer: BytesMut,
    finished: bool,
    line_limit: usize,
}

impl ChunkedByteSequence {
    pub fn new(source: ByteStream) -> Self {
        ChunkedByteSequence {
            source,
            buffer: BytesMut::new(),
            finished: false,
            line_limit: DEFAULT_LINE_LIMIT,
        }
    }

    /// A sequence over in-memory chunks, delivered one chunk per underlying read.
    pub fn from_chunks<I, B>(chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        let chunks: Vec<Result<Bytes>> = chunks.into_iter().map(|chunk| Ok(chunk.into())).collect();
        ChunkedByteSequence::new(futures::stream::iter(chunks).boxed())
    }

    /// Caps the length of a single [`next_line`](Self::next_line).
    pub fn with_line_limit(mut self, limit: usize) -> Self {
        self.line_limit = limit;
        self
    }

    pub fn shared(self) -> SharedBytes {
        Arc::new(futures::lock::Mutex::new(self))
    }

    /// Bytes received but not yet consumed.
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    /// True once the source has ended and every buffered byte was consumed.
    pub fn is_exhausted(&self) -> bool {
        self.finished && self.buffer.is_empty()
    }

    /// Pulls one more chunk into the buffer. Returns `false` at end of stream.
    async fn fill(&mut self) -> Result<bool> {
        if self.finished {
            return Ok(false);
        }

        match self.source.next().await {
            Some(Ok(chunk)) => {
                self.buffer.extend_from_slice(&chunk);
                Ok(true)
            }
            Some(Err(err)) => Err(err),
            None => {
                self.finished = true;
                Ok(false)
            }
        }
    }

    pub async fn next_byte(&mut self) -> Result<Option<u8>> {
        while self.buffer.is_empty() {
            if !self.fill().await? {
                return Ok(None);
            }
        }
        Ok(Some(self.buffer.get_u8()))
    }

    /// Takes exactly `length` bytes.
    ///
    /// Returns `None` if the stream ended before any of them arrived, and
    /// `Disconnected` if it ended part way.
    pub async fn next_chunk(&mut self, length: usize) -> Result<Option<Bytes>> {
        while self.buffer.len() < length {
            if !self.fill().await? {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(SocketError::Disconnected);
            }
        }
        Ok(Some(self.buffer.split_to(length).freeze()))
    }

    /// Takes whatever is buffered, up to `max` bytes, reading once if nothing is.
    pub async fn next_available(&mut self, max: usize) -> Result<Option<Bytes>> {
        while self.buffer.is_empty() {
            if !self.fill().await? {
                return Ok(None);
            }
        }
        let take = max.min(self.buffer.len());
        Ok(Some(self.buffer.split_to(take).freeze()))
    }

    /// Takes bytes up to `delimiter`, consuming the delimiter but not returning it.
    ///
    /// Returns `None` if the stream ended with nothing buffered, and
    /// `Disconnected` if it ended inside a line.
    pub async fn next_line(&mut self, delimiter: &[u8]) -> Result<Option<Bytes>> {
        let mut searched = 0;
        loop {
            if let Some(index) = find(&self.buffer[searched..], delimiter) {
                let line = self.buffer.split_to(searched + index).freeze();
                self.buffer.advance(delimiter.len());
                return Ok(Some(line));
            }

            if self.buffer.len() > self.line_limit {
                return Err(SocketError::LineTooLong(self.line_limit));
            }

            // resume the search where a delimiter could still start
            searched = self.buffer.len().saturating_sub(delimiter.len().saturating_sub(1));

            if !self.fill().await? {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(SocketError::Disconnected);
            }
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    /// Tests that lines split across many reads are reassembled.
    #[test]
    fn test_next_line_across_reads() {
        let mut bytes = ChunkedByteSequence::from_chunks(vec!["GE", "T / HT", "TP/1.1\r", "\nHost: a\r\n\r\n"]);
        block_on(async {
            assert_eq!(bytes.next_line(b"\r\n").await.unwrap().unwrap(), "GET / HTTP/1.1");
            assert_eq!(bytes.next_line(b"\r\n").await.unwrap().unwrap(), "Host: a");
            assert_eq!(bytes.next_line(b"\r\n").await.unwrap().unwrap(), "");
            assert!(bytes.next_line(b"\r\n").await.unwrap().is_none());
        });
    }

    /// Tests that excess bytes from one read stay buffered for the next step.
    #[test]
    fn test_no_bytes_lost_between_steps() {
        let mut bytes = ChunkedByteSequence::from_chunks(vec!["line\r\nabcdef"]);
        block_on(async {
            assert_eq!(bytes.next_line(b"\r\n").await.unwrap().unwrap(), "line");
            assert_eq!(bytes.buffered(), b"abcdef");
            assert_eq!(bytes.next_chunk(2).await.unwrap().unwrap(), "ab");
            assert_eq!(bytes.next_byte().await.unwrap(), Some(b'c'));
            assert_eq!(bytes.next_available(16).await.unwrap().unwrap(), "def");
            assert_eq!(bytes.next_byte().await.unwrap(), None);
            assert!(bytes.is_exhausted());
        });
    }

    /// Tests end-of-stream handling: clean at a boundary, an error mid-chunk.
    #[test]
    fn test_end_of_stream() {
        let mut bytes = ChunkedByteSequence::from_chunks(vec!["abc"]);
        block_on(async {
            assert!(matches!(bytes.next_chunk(5).await, Err(SocketError::Disconnected)));
        });

        let mut bytes = ChunkedByteSequence::from_chunks(Vec::<Bytes>::new());
        block_on(async {
            assert!(bytes.next_chunk(5).await.unwrap().is_none());
            assert!(bytes.next_line(b"\r\n").await.unwrap().is_none());
        });

        let mut bytes = ChunkedByteSequence::from_chunks(vec!["partial"]);
        block_on(async {
            assert!(matches!(bytes.next_line(b"\r\n").await, Err(SocketError::Disconnected)));
        });
    }

    #[test]
    fn test_line_limit() {
        let mut bytes = ChunkedByteSequence::from_chunks(vec!["aaaaaaaa", "aaaaaaaa", "\r\n"]).with_line_limit(10);
        block_on(async {
            assert!(matches!(bytes.next_line(b"\r\n").await, Err(SocketError::LineTooLong(10))));
        });
    }

    /// Tests that source errors surface to the caller.
    #[test]
    fn test_source_error_propagates() {
        let source = futures::stream::iter(vec![Ok(Bytes::from_static(b"a")), Err(SocketError::PoolStopped)]).boxed();
        let mut bytes = ChunkedByteSequence::new(source);
        block_on(async {
            assert!(matches!(bytes.next_chunk(2).await, Err(SocketError::PoolStopped)));
        });
    }
}
