//! Blocking adapters for driving the crate's lazy sequences from a plain thread.
//!
//! Futures that rely on the socket pool work here, since the pool wakes its
//! waiters from its own thread. Futures that need a tokio runtime, such as
//! [`dispatch`](crate::connection::dispatch) with its timer, do not.
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Wake};
use std::thread::{self, Thread};

use futures::{Stream, StreamExt};

/// Blocks the thread that created it until a wake signal is received.
pub struct Parker {
    thread: Thread,
    parked: AtomicBool,
}

impl Parker {
    /// Creates a parker for the current thread.
    pub fn new() -> Arc<Self> {
        Arc::new(Parker {
            thread: thread::current(),
            // start off as parked to ensure wakeups are seen in between polling and parking
            parked: AtomicBool::new(true),
        })
    }

    /// Polls `fut` to completion, parking the thread whenever it is pending.
    ///
    /// Must be called from the thread that created the parker.
    pub fn block_on<F: Future>(self: &Arc<Self>, fut: F) -> F::Output {
        self.parked.store(true, Ordering::Relaxed);

        let waker = self.clone().into();
        let mut cx = Context::from_waker(&waker);

        futures::pin_mut!(fut);
        loop {
            match fut.as_mut().poll(&mut cx) {
                Poll::Ready(output) => return output,
                Poll::Pending => {
                    while self.parked.swap(true, Ordering::Acquire) {
                        thread::park();
                    }
                }
            }
        }
    }
}

impl Wake for Parker {
    fn wake(self: Arc<Self>) {
        if self.parked.swap(false, Ordering::Release) {
            self.thread.unpark();
        }
    }
}

/// Runs `fut` to completion on the current thread.
pub fn block_on<F: Future>(fut: F) -> F::Output {
    Parker::new().block_on(fut)
}

/// Iterates a stream by blocking on each item.
///
/// Each call to `next` parks the calling thread, so the iterator may move
/// between threads.
pub struct BlockingIter<S> {
    stream: S,
}

impl<S: Stream + Unpin> BlockingIter<S> {
    pub fn new(stream: S) -> Self {
        BlockingIter { stream }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S: Stream + Unpin> Iterator for BlockingIter<S> {
    type Item = S::Item;

    fn next(&mut self) -> Option<S::Item> {
        block_on(self.stream.next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::async_socket::AsyncSocket;
    use crate::pool::{self, PollingSocketPool, SocketPool};
    use crate::sequence::ChunkedByteSequence;
    use crate::socket::Socket;
    use crate::ws::{WsFrame, WsFrameEncoder, WsFrameSequence};
    use std::time::Duration;

    /// Tests that the parker wakes when signaled from another thread.
    #[test]
    fn test_parker() {
        let parker = Parker::new();
        let (sender, receiver) = futures::channel::oneshot::channel();

        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            let _ = sender.send("completed");
        });

        assert_eq!(parker.block_on(receiver), Ok("completed"));
    }

    /// Tests blocking iteration of a decoded frame stream.
    #[test]
    fn test_blocking_iter_frames() {
        let chunks = vec![
            WsFrameEncoder::encode_frame(&WsFrame::text("one")),
            WsFrameEncoder::encode_frame(&WsFrame::binary("two")),
        ];
        let frames = WsFrameSequence::new(ChunkedByteSequence::from_chunks(chunks).shared()).into_stream();

        let payloads: Vec<_> = BlockingIter::new(frames).map(|frame| frame.unwrap().payload).collect();
        assert_eq!(payloads, vec!["one", "two"]);
    }

    /// Tests a socket read driven from a plain thread by the pool's wakeups.
    #[test]
    fn test_block_on_socket_read() {
        let pool: Arc<dyn SocketPool> = Arc::new(PollingSocketPool::new(Duration::from_millis(20)).unwrap());
        pool::spawn(pool.clone()).unwrap();

        let (a, b) = Socket::pair().unwrap();
        let a = AsyncSocket::new(a, pool.clone()).unwrap();
        let b = AsyncSocket::new(b, pool.clone()).unwrap();

        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            block_on(a.write(b"from another thread")).unwrap();
        });

        let bytes = block_on(b.read(64)).unwrap();
        assert_eq!(&bytes[..], b"from another thread");
        writer.join().unwrap();
        pool.stop();
    }
}
