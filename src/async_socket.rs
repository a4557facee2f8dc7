use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use futures::StreamExt;
use hyper::body::Bytes;
use mio::Token;

use crate::error::{Result, SocketError};
use crate::pool::{self, Interest, SocketPool};
use crate::sequence::ByteStream;
use crate::socket::{Address, Socket};

/// A [`Socket`] bound to a [`SocketPool`], with operations that suspend
/// instead of returning `WouldBlock`.
///
/// Reads and writes take `&self` so one connection can share the socket
/// between its reading and writing halves.
pub struct AsyncSocket {
    socket: RwLock<Socket>,
    fd: RawFd,
    token: Token,
    pool: Arc<dyn SocketPool>,
    closed: AtomicBool,
}

impl AsyncSocket {
    /// Attaches `socket` to `pool`.
    ///
    /// # Errors
    /// - `Disconnected` if the socket is already closed
    /// - `PoolStopped` if the pool has been stopped
    /// - `Registration` if the poller rejects the descriptor
    pub fn new(socket: Socket, pool: Arc<dyn SocketPool>) -> Result<Self> {
        let fd = socket.raw_fd()?;
        let token = pool.attach(fd)?;

        Ok(AsyncSocket {
            socket: RwLock::new(socket),
            fd,
            token,
            pool,
            closed: AtomicBool::new(false),
        })
    }

    /// Connects to `address`, suspending until the connection is established.
    pub async fn connect(address: &Address, pool: Arc<dyn SocketPool>) -> Result<Self> {
        let socket = AsyncSocket::new(Socket::connect(address)?, pool)?;

        loop {
            let tick = pool::wait(&*socket.pool, socket.token, Interest::Write).await?;

            let connected = {
                let inner = socket.socket.read().map_err(|_| SocketError::LockPoisoned)?;
                match inner.take_error()? {
                    Some(err) => return Err(err.into()),
                    None => match inner.peer_address() {
                        Ok(_) => true,
                        Err(SocketError::Disconnected) => false,
                        Err(err) => return Err(err),
                    },
                }
            };

            if connected {
                return Ok(socket);
            }
            socket.pool.clear_ready(socket.token, Interest::Write, tick);
        }
    }

    pub fn pool(&self) -> &Arc<dyn SocketPool> {
        &self.pool
    }

    /// Performs a non-blocking operation, suspending on the pool while it would block.
    async fn io<T>(&self, interest: Interest, mut f: impl FnMut(&Socket) -> Result<T>) -> Result<T> {
        loop {
            let tick = pool::wait(&*self.pool, self.token, interest).await?;

            let result = {
                let socket = self.socket.read().map_err(|_| SocketError::LockPoisoned)?;
                f(&socket)
            };

            match result {
                Err(err) if err.is_would_block() => {
                    self.pool.clear_ready(self.token, interest, tick);
                }
                result => return result,
            }
        }
    }

    /// Reads up to `max` bytes, suspending until at least one byte is available.
    ///
    /// An orderly close by the peer fails with [`SocketError::Disconnected`].
    pub async fn read(&self, max: usize) -> Result<Bytes> {
        let mut buf = vec![0; max];
        let read = self.io(Interest::Read, |socket| socket.read(&mut buf)).await?;
        buf.truncate(read);
        Ok(Bytes::from(buf))
    }

    /// Writes all of `bytes`, suspending whenever the send buffer is full.
    pub async fn write(&self, bytes: &[u8]) -> Result<()> {
        let mut written = 0;
        while written < bytes.len() {
            let n = self.io(Interest::Write, |socket| socket.write(&bytes[written..])).await?;
            if n == 0 {
                return Err(SocketError::Disconnected);
            }
            written += n;
        }
        Ok(())
    }

    /// Accepts the next connection on a listening socket, attached to the same pool.
    pub async fn accept(&self) -> Result<AsyncSocket> {
        let socket = self.io(Interest::Read, |socket| socket.accept()).await?;
        AsyncSocket::new(socket, self.pool.clone())
    }

    pub fn local_address(&self) -> Result<Address> {
        self.socket.read().map_err(|_| SocketError::LockPoisoned)?.local_address()
    }

    pub fn peer_address(&self) -> Result<Address> {
        self.socket.read().map_err(|_| SocketError::LockPoisoned)?.peer_address()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Detaches from the pool, failing pending waits, and releases the descriptor.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.pool.detach(self.token, self.fd);
        self.socket.write().map_err(|_| SocketError::LockPoisoned)?.close();
        Ok(())
    }

    /// The continuous stream of incoming bytes, read `chunk_size` at a time.
    ///
    /// Ends when the peer disconnects; any other failure is yielded once and
    /// then ends the stream.
    pub fn bytes(self: &Arc<Self>, chunk_size: usize) -> ByteStream {
        futures::stream::unfold(Some(self.clone()), move |socket| async move {
            let socket = socket?;
            match socket.read(chunk_size).await {
                Ok(bytes) => Some((Ok(bytes), Some(socket))),
                Err(SocketError::Disconnected) => None,
                Err(err) => Some((Err(err), None)),
            }
        })
        .boxed()
    }
}

impl Drop for AsyncSocket {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::debug!("Failed to close socket: {}", err);
        }
    }
}
