//! Readiness polling for many non-blocking sockets.
//!
//! The [`SocketPool`] trait is the seam between sockets and the OS readiness
//! facility, and [`PollingSocketPool`] is the mio-backed implementation. One
//! pool thread (see [`spawn`]) runs the poll loop while any number of tasks
//! suspend on it through [`wait`].
//!
//! A pool moves through three states, `IDLE -> RUNNING -> STOPPED`, and never
//! leaves `STOPPED`: once stopped, attaching and waiting fail with
//! [`SocketError::PoolStopped`].
//!
//! Every attached descriptor keeps one readiness word per [`Interest`]. The low
//! bit says the direction is ready; the upper bits count readiness events. A
//! wait hands the observed count back as a [`Tick`], so `clear_ready` can tell
//! whether an event raced in after the failed I/O and must not be lost.
//!
//! Token 0 is reserved for the `mio::Waker` that interrupts the poll call on
//! `stop`. Socket tokens start at 1.
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::os::unix::io::RawFd;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Token};

use crate::error::{Result, SocketError};

/// The direction an operation is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interest {
    Read = 0,
    Write = 1,
}

/// Readiness generation observed by a wait; passed back to [`SocketPool::clear_ready`].
pub type Tick = usize;

/// A readiness-polling engine shared by every socket of a server.
///
/// Sockets are attached once; afterwards any number of tasks can suspend on
/// `(token, interest)` pairs, at most one at a time per pair.
pub trait SocketPool: Send + Sync {
    /// Registers a descriptor and returns the token identifying it.
    fn attach(&self, fd: RawFd) -> Result<Token>;

    /// Removes a descriptor; its pending waiters resolve with `Disconnected`.
    fn detach(&self, token: Token, fd: RawFd);

    /// Resolves once `interest` is ready, registering `cx`'s waker otherwise.
    fn poll_ready(&self, token: Token, interest: Interest, cx: &mut Context<'_>) -> Poll<Result<Tick>>;

    /// Marks `interest` as not ready, unless an event arrived after `tick` was observed.
    fn clear_ready(&self, token: Token, interest: Interest, tick: Tick);

    /// Drops the waiter registered for `(token, interest)`, if any.
    fn cancel(&self, token: Token, interest: Interest);

    /// Runs the poll loop on the calling thread until [`stop`](SocketPool::stop).
    fn run(&self) -> Result<()>;

    /// Stops the poll loop; every pending and future wait fails with `PoolStopped`.
    fn stop(&self);

    fn is_running(&self) -> bool;
}

/// Suspends until `interest` is ready on `token`.
///
/// Dropping the returned future before it resolves cancels the registration.
pub fn wait(pool: &dyn SocketPool, token: Token, interest: Interest) -> Wait<'_> {
    Wait { pool, token, interest, pending: false }
}

/// The wait token returned by [`wait`].
pub struct Wait<'a> {
    pool: &'a dyn SocketPool,
    token: Token,
    interest: Interest,
    pending: bool,
}

impl Future for Wait<'_> {
    type Output = Result<Tick>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let result = self.pool.poll_ready(self.token, self.interest, cx);
        self.pending = result.is_pending();
        result
    }
}

impl Drop for Wait<'_> {
    fn drop(&mut self) {
        if self.pending {
            self.pool.cancel(self.token, self.interest);
        }
    }
}

/// Reserved for the waker that interrupts a blocked poll.
const WAKE_TOKEN: Token = Token(0);

// pool states
const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const STOPPED: u8 = 2;

/// Low bit of a readiness word; the remaining bits count events.
const READY: usize = 1;

/// Per-descriptor readiness and waiters.
struct Source {
    readiness: [AtomicUsize; 2],
    waiters: Mutex<[Option<Waker>; 2]>,
    closed: AtomicBool,
}

impl Source {
    fn new() -> Self {
        // start ready so the first operation is attempted without waiting
        Source {
            readiness: [AtomicUsize::new(READY), AtomicUsize::new(READY)],
            waiters: Mutex::new([None, None]),
            closed: AtomicBool::new(false),
        }
    }

    /// Bumps the event count, sets the ready bit and collects the waiter, if any.
    fn fire(&self, interest: Interest, wakers: &mut Vec<Waker>) {
        let _ = self.readiness[interest as usize].fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
            Some((((cur >> 1).wrapping_add(1)) << 1) | READY)
        });

        if let Ok(mut waiters) = self.waiters.lock() {
            if let Some(waker) = waiters[interest as usize].take() {
                wakers.push(waker);
            }
        }
    }

    fn take_all(&self, wakers: &mut Vec<Waker>) {
        if let Ok(mut waiters) = self.waiters.lock() {
            wakers.extend(waiters.iter_mut().filter_map(Option::take));
        }
    }
}

/// A [`SocketPool`] backed by `mio::Poll` (epoll/kqueue).
///
/// `run` blocks the calling thread in the poll call, bounded by the configured
/// interval so that an idle pool still observes `stop` promptly.
pub struct PollingSocketPool {
    registry: mio::Registry,
    poll: Mutex<Option<mio::Poll>>,
    waker: mio::Waker,
    token: AtomicUsize,
    sources: Mutex<HashMap<Token, Arc<Source>>>,
    state: AtomicU8,
    interval: Duration,
}

impl PollingSocketPool {
    /// Creates an idle pool whose poll call blocks for at most `interval`.
    pub fn new(interval: Duration) -> Result<Self> {
        let poll = mio::Poll::new().map_err(SocketError::Registration)?;
        let registry = poll.registry().try_clone().map_err(SocketError::Registration)?;
        let waker = mio::Waker::new(&registry, WAKE_TOKEN).map_err(SocketError::Registration)?;

        Ok(PollingSocketPool {
            registry,
            poll: Mutex::new(Some(poll)),
            waker,
            token: AtomicUsize::new(WAKE_TOKEN.0 + 1),
            sources: Mutex::new(HashMap::with_capacity(64)),
            state: AtomicU8::new(IDLE),
            interval,
        })
    }

    fn is_stopped(&self) -> bool {
        self.state.load(Ordering::Acquire) == STOPPED
    }

    fn source(&self, token: Token) -> Result<Option<Arc<Source>>> {
        let sources = self.sources.lock().map_err(|_| SocketError::LockPoisoned)?;
        Ok(sources.get(&token).cloned())
    }

    /// Number of attached descriptors.
    pub(crate) fn registered(&self) -> usize {
        self.sources.lock().map(|sources| sources.len()).unwrap_or(0)
    }

    /// One poll call, then every collected waker is woken outside the sources lock.
    fn poll_once(&self, poll: &mut mio::Poll, events: &mut Events, wakers: &mut Vec<Waker>) -> Result<()> {
        if let Err(err) = poll.poll(events, Some(self.interval)) {
            if err.kind() != io::ErrorKind::Interrupted {
                log::error!("Polling error: {}", err);
                return Err(SocketError::Polling(err));
            }
            return Ok(());
        }

        {
            let sources = self.sources.lock().map_err(|_| SocketError::LockPoisoned)?;

            for event in events.iter() {
                if event.token() == WAKE_TOKEN {
                    continue;
                }

                let source = match sources.get(&event.token()) {
                    Some(source) => source,
                    None => continue,
                };

                // errors and hangups resolve both directions; the retried I/O reports them
                if event.is_error() {
                    source.fire(Interest::Read, wakers);
                    source.fire(Interest::Write, wakers);
                    continue;
                }

                if event.is_readable() || event.is_read_closed() {
                    source.fire(Interest::Read, wakers);
                }

                if event.is_writable() || event.is_write_closed() {
                    source.fire(Interest::Write, wakers);
                }
            }
        }

        for waker in wakers.drain(..) {
            waker.wake();
        }

        Ok(())
    }

    /// Marks the pool stopped and wakes every waiter so it observes `PoolStopped`.
    fn shutdown(&self) {
        self.state.store(STOPPED, Ordering::Release);

        let mut wakers = Vec::new();
        if let Ok(sources) = self.sources.lock() {
            for source in sources.values() {
                source.take_all(&mut wakers);
            }
        }

        log::debug!("Socket pool stopped, failing {} waiters", wakers.len());
        for waker in wakers {
            waker.wake();
        }
    }
}

impl SocketPool for PollingSocketPool {
    fn attach(&self, fd: RawFd) -> Result<Token> {
        if self.is_stopped() {
            return Err(SocketError::PoolStopped);
        }

        let token = Token(self.token.fetch_add(1, Ordering::Relaxed));
        let mut sources = self.sources.lock().map_err(|_| SocketError::LockPoisoned)?;

        self.registry
            .register(&mut SourceFd(&fd), token, mio::Interest::READABLE | mio::Interest::WRITABLE)
            .map_err(SocketError::Registration)?;
        sources.insert(token, Arc::new(Source::new()));

        Ok(token)
    }

    fn detach(&self, token: Token, fd: RawFd) {
        let source = match self.sources.lock() {
            Ok(mut sources) => sources.remove(&token),
            Err(_) => None,
        };

        if let Err(err) = self.registry.deregister(&mut SourceFd(&fd)) {
            log::debug!("Failed to deregister {:?}: {}", token, err);
        }

        if let Some(source) = source {
            source.closed.store(true, Ordering::Release);
            let mut wakers = Vec::new();
            source.take_all(&mut wakers);
            for waker in wakers {
                waker.wake();
            }
        }
    }

    fn poll_ready(&self, token: Token, interest: Interest, cx: &mut Context<'_>) -> Poll<Result<Tick>> {
        if self.is_stopped() {
            return Poll::Ready(Err(SocketError::PoolStopped));
        }

        let source = match self.source(token) {
            Ok(Some(source)) => source,
            Ok(None) => return Poll::Ready(Err(SocketError::Disconnected)),
            Err(err) => return Poll::Ready(Err(err)),
        };

        let slot = interest as usize;
        let current = source.readiness[slot].load(Ordering::Acquire);
        if current & READY != 0 {
            return Poll::Ready(Ok(current >> 1));
        }

        {
            let mut waiters = match source.waiters.lock() {
                Ok(waiters) => waiters,
                Err(_) => return Poll::Ready(Err(SocketError::LockPoisoned)),
            };

            match &waiters[slot] {
                Some(existing) if !existing.will_wake(cx.waker()) => {
                    return Poll::Ready(Err(SocketError::AlreadyAwaiting));
                }
                _ => waiters[slot] = Some(cx.waker().clone()),
            }
        }

        // check if anything changed while we were registering our waker
        let current = source.readiness[slot].load(Ordering::Acquire);
        if current & READY != 0 || self.is_stopped() || source.closed.load(Ordering::Acquire) {
            if let Ok(mut waiters) = source.waiters.lock() {
                waiters[slot] = None;
            }
            if self.is_stopped() {
                return Poll::Ready(Err(SocketError::PoolStopped));
            }
            if source.closed.load(Ordering::Acquire) {
                return Poll::Ready(Err(SocketError::Disconnected));
            }
            return Poll::Ready(Ok(current >> 1));
        }

        Poll::Pending
    }

    fn clear_ready(&self, token: Token, interest: Interest, tick: Tick) {
        if let Ok(Some(source)) = self.source(token) {
            let _ = source.readiness[interest as usize].compare_exchange(
                (tick << 1) | READY,
                tick << 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
    }

    fn cancel(&self, token: Token, interest: Interest) {
        if let Ok(Some(source)) = self.source(token) {
            if let Ok(mut waiters) = source.waiters.lock() {
                waiters[interest as usize] = None;
            }
        }
    }

    fn run(&self) -> Result<()> {
        if self
            .state
            .compare_exchange(IDLE, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(if self.is_stopped() { SocketError::PoolStopped } else { SocketError::AlreadyRunning });
        }

        let mut poll = self
            .poll
            .lock()
            .map_err(|_| SocketError::LockPoisoned)?
            .take()
            .ok_or(SocketError::AlreadyRunning)?;

        let mut events = Events::with_capacity(256);
        let mut wakers = Vec::new();
        let mut result = Ok(());

        while !self.is_stopped() {
            if let Err(err) = self.poll_once(&mut poll, &mut events, &mut wakers) {
                result = Err(err);
                break;
            }
            events.clear();
        }

        self.shutdown();
        result
    }

    fn stop(&self) {
        if self.state.swap(STOPPED, Ordering::AcqRel) == STOPPED {
            return;
        }

        if let Err(err) = self.waker.wake() {
            log::warn!("Failed to wake socket pool: {}", err);
        }
        // a pool that never ran has nobody else to fail its waiters
        self.shutdown();
    }

    fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == RUNNING
    }
}

/// Runs `pool` on a dedicated, named thread.
pub fn spawn(pool: Arc<dyn SocketPool>) -> Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name("tern-pool".to_owned())
        .spawn(move || match pool.run() {
            Ok(()) | Err(SocketError::AlreadyRunning) | Err(SocketError::PoolStopped) => {}
            Err(err) => log::error!("Socket pool failed: {}", err),
        })
        .map_err(SocketError::Io)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::Socket;
    use futures::task::noop_waker;
    use std::time::Instant;

    fn pool() -> Arc<PollingSocketPool> {
        Arc::new(PollingSocketPool::new(Duration::from_millis(20)).unwrap())
    }

    /// Tests that attaching a descriptor hands out distinct tokens.
    #[test]
    fn test_attach_tokens() {
        let pool = pool();
        let (a, b) = Socket::pair().unwrap();
        let ta = pool.attach(a.raw_fd().unwrap()).unwrap();
        let tb = pool.attach(b.raw_fd().unwrap()).unwrap();
        assert_ne!(ta, tb);
        assert_ne!(ta, WAKE_TOKEN);
        assert_eq!(pool.registered(), 2);

        pool.detach(ta, a.raw_fd().unwrap());
        assert_eq!(pool.registered(), 1);
    }

    /// Tests that a fresh source is ready and a cleared one pends.
    #[test]
    fn test_poll_ready_and_clear() {
        let pool = pool();
        let (a, _b) = Socket::pair().unwrap();
        let token = pool.attach(a.raw_fd().unwrap()).unwrap();
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        let tick = match pool.poll_ready(token, Interest::Read, &mut cx) {
            Poll::Ready(Ok(tick)) => tick,
            other => panic!("expected ready, got {:?}", other.map(|r| r.is_ok())),
        };

        pool.clear_ready(token, Interest::Read, tick);
        assert!(pool.poll_ready(token, Interest::Read, &mut cx).is_pending());
    }

    /// Tests that a clear with a stale tick does not lose a newer event.
    #[test]
    fn test_stale_clear_is_ignored() {
        let pool = pool();
        let (a, _b) = Socket::pair().unwrap();
        let token = pool.attach(a.raw_fd().unwrap()).unwrap();
        let source = pool.source(token).unwrap().unwrap();

        let mut wakers = Vec::new();
        source.fire(Interest::Read, &mut wakers);
        pool.clear_ready(token, Interest::Read, 0);

        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        assert!(matches!(pool.poll_ready(token, Interest::Read, &mut cx), Poll::Ready(Ok(1))));
    }

    /// Tests that a second, different waiter on the same pair is rejected.
    #[test]
    fn test_second_waiter_rejected() {
        let pool = pool();
        let (a, _b) = Socket::pair().unwrap();
        let token = pool.attach(a.raw_fd().unwrap()).unwrap();

        let first = futures::task::waker(Arc::new(Flag::default()));
        let second = futures::task::waker(Arc::new(Flag::default()));
        if let Poll::Ready(Ok(tick)) = pool.poll_ready(token, Interest::Read, &mut Context::from_waker(&first)) {
            pool.clear_ready(token, Interest::Read, tick);
        }
        assert!(pool.poll_ready(token, Interest::Read, &mut Context::from_waker(&first)).is_pending());
        assert!(matches!(
            pool.poll_ready(token, Interest::Read, &mut Context::from_waker(&second)),
            Poll::Ready(Err(SocketError::AlreadyAwaiting))
        ));

        pool.cancel(token, Interest::Read);
        assert!(pool.poll_ready(token, Interest::Read, &mut Context::from_waker(&second)).is_pending());
    }

    /// Tests that incoming data wakes the waiter registered for reads.
    #[test]
    fn test_run_wakes_reader() {
        let pool = pool();
        let (a, b) = Socket::pair().unwrap();
        let token = pool.attach(a.raw_fd().unwrap()).unwrap();

        let flag = Arc::new(Flag::default());
        let waker = futures::task::waker(flag.clone());
        let mut cx = Context::from_waker(&waker);
        if let Poll::Ready(Ok(tick)) = pool.poll_ready(token, Interest::Read, &mut cx) {
            pool.clear_ready(token, Interest::Read, tick);
        }
        assert!(pool.poll_ready(token, Interest::Read, &mut cx).is_pending());

        let handle = spawn(pool.clone()).unwrap();
        b.write(b"x").unwrap();

        let started = Instant::now();
        while !flag.0.load(Ordering::Acquire) {
            assert!(started.elapsed() < Duration::from_secs(5), "reader was never woken");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(matches!(pool.poll_ready(token, Interest::Read, &mut cx), Poll::Ready(Ok(_))));

        pool.stop();
        handle.join().unwrap();
    }

    /// Tests that stopping the pool fails pending waiters and refuses new work.
    #[test]
    fn test_stop_fails_waiters() {
        let pool = pool();
        let (a, _b) = Socket::pair().unwrap();
        let token = pool.attach(a.raw_fd().unwrap()).unwrap();
        let handle = spawn(pool.clone()).unwrap();

        let flag = Arc::new(Flag::default());
        let waker = futures::task::waker(flag.clone());
        let mut cx = Context::from_waker(&waker);
        if let Poll::Ready(Ok(tick)) = pool.poll_ready(token, Interest::Read, &mut cx) {
            pool.clear_ready(token, Interest::Read, tick);
        }
        assert!(pool.poll_ready(token, Interest::Read, &mut cx).is_pending());

        pool.stop();
        handle.join().unwrap();

        assert!(flag.0.load(Ordering::Acquire));
        assert!(!pool.is_running());
        assert!(matches!(
            pool.poll_ready(token, Interest::Read, &mut cx),
            Poll::Ready(Err(SocketError::PoolStopped))
        ));
        assert!(matches!(pool.attach(a.raw_fd().unwrap()), Err(SocketError::PoolStopped)));
        assert!(matches!(pool.run(), Err(SocketError::PoolStopped)));
    }

    /// Tests that detaching resolves a pending waiter as disconnected.
    #[test]
    fn test_detach_disconnects_waiter() {
        let pool = pool();
        let (a, _b) = Socket::pair().unwrap();
        let fd = a.raw_fd().unwrap();
        let token = pool.attach(fd).unwrap();

        let flag = Arc::new(Flag::default());
        let waker = futures::task::waker(flag.clone());
        let mut cx = Context::from_waker(&waker);
        if let Poll::Ready(Ok(tick)) = pool.poll_ready(token, Interest::Write, &mut cx) {
            pool.clear_ready(token, Interest::Write, tick);
        }
        assert!(pool.poll_ready(token, Interest::Write, &mut cx).is_pending());

        pool.detach(token, fd);
        assert!(flag.0.load(Ordering::Acquire));
        assert!(matches!(
            pool.poll_ready(token, Interest::Write, &mut cx),
            Poll::Ready(Err(SocketError::Disconnected))
        ));
    }

    #[derive(Default)]
    struct Flag(AtomicBool);

    impl futures::task::ArcWake for Flag {
        fn wake_by_ref(arc_self: &Arc<Self>) {
            arc_self.0.store(true, Ordering::Release);
        }
    }
}
