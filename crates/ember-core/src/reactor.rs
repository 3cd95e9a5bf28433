// src/reactor.rs
//! The single event-loop thread.
//!
//! The reactor owns the listener, the self-pipe, the connection table and the
//! timer heap. It only performs non-blocking socket work: accepting, reading
//! request bytes, and flushing responses. Parsing and response composition run
//! on the worker pool. Connection sockets are registered one-shot, so whoever
//! handles an event owns the connection until it re-arms it.

use crate::config::ServerConfig;
use crate::context::ServerContext;
use crate::error::EmberResult;
use crate::http::conn::{Conn, Phase, WriteProgress};
use crate::pool::WorkerPool;
use crate::slab::ConnectionSlab;
use crate::syscalls::{
    self, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP, Epoll, FdStream, Interest,
    empty_event,
};
use crate::timer::TimerHeap;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::{Arc, Mutex, PoisonError, TryLockError};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const LISTEN_TOKEN: u64 = u64::MAX;
const SIGNAL_TOKEN: u64 = u64::MAX - 1;
const MAX_EVENTS: usize = 1024;

/// Byte written to the self-pipe to request a timer sweep.
pub const SIG_TICK: u8 = libc::SIGALRM as u8;
/// Byte written to the self-pipe to stop the reactor.
pub const SIG_STOP: u8 = libc::SIGTERM as u8;

/// Cloneable handle on the write end of the reactor's self-pipe.
#[derive(Debug, Clone)]
pub struct Notifier {
    fd: Arc<OwnedFd>,
}

impl Notifier {
    pub fn send(&self, byte: u8) -> io::Result<()> {
        syscalls::write_byte(self.fd.as_raw_fd(), byte)
    }

    pub fn tick(&self) -> io::Result<()> {
        self.send(SIG_TICK)
    }

    pub fn terminate(&self) -> io::Result<()> {
        self.send(SIG_STOP)
    }
}

/// Everything a timer callback may touch when it evicts a connection.
pub struct Registry {
    slab: ConnectionSlab,
    epoll: Arc<Epoll>,
    ctx: Arc<ServerContext>,
    // slots whose eviction found a worker holding the connection
    deferred: Vec<usize>,
}

impl Registry {
    /// Closes the connection in `token` and releases its slot. Safe to call
    /// on a slot that is already free.
    fn evict(&mut self, token: usize) {
        if !self.slab.is_allocated(token) {
            return;
        }
        let Some(slot) = self.slab.get(token).cloned() else {
            return;
        };
        let socket = match slot.try_lock() {
            Ok(mut conn) => conn.close(),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().close(),
            Err(TryLockError::WouldBlock) => {
                self.deferred.push(token);
                return;
            }
        };
        if let Some(socket) = socket {
            if let Err(e) = self.epoll.delete(socket.as_raw_fd()) {
                warn!("Deregistering slot {} failed: {}", token, e);
            }
        }
        self.slab.free(token);
        self.ctx.metrics.on_close();
        debug!("Closed slot {}", token);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TickSource {
    /// SIGALRM arrives through the self-pipe; re-armed after each sweep.
    Alarm,
    /// The reactor bounds its own wait and sweeps when a tick has elapsed.
    WaitTimeout,
}

enum AfterWrite {
    Rearm(Interest),
    Resubmit,
    Close,
}

pub struct Reactor {
    listener: OwnedFd,
    signal_rx: OwnedFd,
    notifier: Notifier,
    registry: Registry,
    timers: TimerHeap<Registry>,
    pool: WorkerPool,
    tick: Duration,
    idle_timeout: Duration,
    tick_source: TickSource,
    last_sweep: Instant,
}

impl Reactor {
    /// Binds the listener, creates the multiplexer and self-pipe, allocates the
    /// connection table and starts the worker pool.
    pub fn new(config: &ServerConfig, ctx: Arc<ServerContext>) -> EmberResult<Self> {
        config.validate()?;

        let listener = syscalls::create_listen_socket(&config.host, config.port)?;
        let epoll = Arc::new(Epoll::new()?);
        let (signal_rx, signal_tx) = syscalls::create_pipe()?;
        epoll.add(listener.as_raw_fd(), LISTEN_TOKEN, Interest::Read)?;
        epoll.add(signal_rx.as_raw_fd(), SIGNAL_TOKEN, Interest::Read)?;

        let slab = ConnectionSlab::new(
            config.max_connections,
            ctx.read_buffer_size,
            ctx.write_buffer_size,
        );
        let pool = WorkerPool::new(config.pool_config())?;

        Ok(Self {
            listener,
            signal_rx,
            notifier: Notifier {
                fd: Arc::new(signal_tx),
            },
            registry: Registry {
                slab,
                epoll,
                ctx,
                deferred: Vec::new(),
            },
            timers: TimerHeap::with_capacity(config.max_connections),
            pool,
            tick: config.tick(),
            idle_timeout: config.idle_timeout(),
            tick_source: TickSource::WaitTimeout,
            last_sweep: Instant::now(),
        })
    }

    /// Drive sweeps from SIGALRM instead of the wait timeout. The process must
    /// forward SIGALRM to the notifier.
    pub fn use_alarm(&mut self, on: bool) {
        self.tick_source = if on {
            TickSource::Alarm
        } else {
            TickSource::WaitTimeout
        };
    }

    pub fn notifier(&self) -> Notifier {
        self.notifier.clone()
    }

    pub fn local_addr(&self) -> EmberResult<SocketAddr> {
        Ok(syscalls::local_addr(self.listener.as_raw_fd())?)
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.registry.ctx
    }

    /// Runs until a stop byte arrives on the self-pipe. Multiplexer failures
    /// are fatal.
    pub fn run(&mut self) -> EmberResult<()> {
        let mut events = vec![empty_event(); MAX_EVENTS];
        if self.tick_source == TickSource::Alarm {
            syscalls::schedule_alarm(self.alarm_secs());
        }
        info!(addr = ?self.local_addr().ok(), "reactor running");

        let mut stop = false;
        while !stop {
            let n = match self.registry.epoll.wait(&mut events, self.wait_timeout()) {
                Ok(n) => n,
                Err(e) => {
                    error!("epoll_wait failed: {}", e);
                    self.teardown();
                    return Err(e.into());
                }
            };

            let mut sweep = false;
            for ev in events[..n].iter().copied() {
                let token = ev.u64;
                let flags = ev.events;
                match token {
                    LISTEN_TOKEN => self.accept_all(),
                    SIGNAL_TOKEN => {
                        let (tick, terminate) = self.read_signals();
                        sweep |= tick;
                        stop |= terminate;
                    }
                    _ => self.on_conn_event(token as usize, flags),
                }
            }

            if self.tick_source == TickSource::WaitTimeout && self.last_sweep.elapsed() >= self.tick {
                sweep = true;
            }
            if sweep {
                self.sweep();
            }
        }

        info!("reactor stopping");
        self.teardown();
        Ok(())
    }

    fn wait_timeout(&self) -> Option<i32> {
        match self.tick_source {
            TickSource::Alarm => None,
            TickSource::WaitTimeout => {
                let left = self.tick.saturating_sub(self.last_sweep.elapsed());
                Some(left.as_millis().min(i32::MAX as u128) as i32)
            }
        }
    }

    fn alarm_secs(&self) -> u32 {
        self.tick.as_secs().clamp(1, u32::MAX as u64) as u32
    }

    /// Returns (tick requested, stop requested).
    fn read_signals(&mut self) -> (bool, bool) {
        match syscalls::drain_pipe(self.signal_rx.as_raw_fd()) {
            Ok(bytes) => (bytes.contains(&SIG_TICK), bytes.contains(&SIG_STOP)),
            Err(e) => {
                warn!("Reading the signal pipe failed: {}", e);
                (false, false)
            }
        }
    }

    fn sweep(&mut self) {
        let fired = self.timers.tick(&mut self.registry);
        if fired > 0 {
            debug!(fired, "timer sweep");
        }
        self.retry_deferred();
        self.last_sweep = Instant::now();
        if self.tick_source == TickSource::Alarm {
            syscalls::schedule_alarm(self.alarm_secs());
        }
    }

    fn accept_all(&mut self) {
        loop {
            match syscalls::accept_connection(self.listener.as_raw_fd()) {
                Ok(Some((socket, peer))) => self.register(socket, peer),
                Ok(None) => break,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    break;
                }
            }
        }
    }

    fn register(&mut self, socket: OwnedFd, peer: Option<SocketAddr>) {
        let fd = socket.as_raw_fd();
        let token = match self.registry.slab.allocate(socket, peer) {
            Ok(token) => token,
            Err(e) => {
                warn!("Rejecting {:?}: {}", peer, e);
                return;
            }
        };
        self.registry.ctx.metrics.on_accept();

        if let Err(e) = self.registry.epoll.add_oneshot(fd, token as u64, Interest::Read) {
            warn!("Registering {:?} failed: {}", peer, e);
            self.registry.evict(token);
            return;
        }
        self.arm_timer(token, self.idle_timeout);
        debug!("Accepted {:?} into slot {}", peer, token);
    }

    fn arm_timer(&mut self, token: usize, timeout: Duration) {
        self.timers
            .add(token, timeout, move |registry: &mut Registry| registry.evict(token));
    }

    /// Fires the connection's timer now, which evicts it.
    fn close_now(&mut self, token: usize) {
        if !self.timers.do_work(token, &mut self.registry) {
            self.registry.evict(token);
        }
        self.retry_deferred();
    }

    fn retry_deferred(&mut self) {
        let deferred = std::mem::take(&mut self.registry.deferred);
        for token in deferred {
            self.arm_timer(token, self.tick);
        }
    }

    fn on_conn_event(&mut self, token: usize, flags: u32) {
        if !self.registry.slab.is_allocated(token) {
            return;
        }
        if flags & (EPOLLRDHUP | EPOLLHUP | EPOLLERR) != 0 {
            debug!("Slot {} hung up", token);
            self.close_now(token);
        } else if flags & EPOLLIN != 0 {
            self.on_readable(token);
        } else if flags & EPOLLOUT != 0 {
            self.on_writable(token);
        }
    }

    fn slot(&self, token: usize) -> Option<Arc<Mutex<Conn>>> {
        self.registry.slab.get(token).cloned()
    }

    fn on_readable(&mut self, token: usize) {
        let Some(slot) = self.slot(token) else {
            return;
        };
        let read = {
            let mut conn = slot.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(fd) = conn.raw_fd() else {
                return;
            };
            let generation = conn.generation();
            conn.read_from(&mut FdStream::new(fd)).map(|_| generation)
        };

        match read {
            Ok(generation) => {
                if let Err(e) = self.submit(token, slot, generation) {
                    warn!("Cannot queue slot {}: {}", token, e);
                    self.close_now(token);
                    return;
                }
                self.timers.adjust(token, self.idle_timeout);
            }
            Err(e) => {
                debug!("Read on slot {} failed: {}", token, e);
                self.close_now(token);
            }
        }
    }

    /// Hands the connection to a worker, which parses, composes the response
    /// and re-arms the socket for whatever comes next.
    fn submit(&self, token: usize, slot: Arc<Mutex<Conn>>, generation: u64) -> EmberResult<()> {
        let epoll = Arc::clone(&self.registry.epoll);
        let ctx = Arc::clone(&self.registry.ctx);
        self.pool.add_task(move || {
            let mut conn = slot.lock().unwrap_or_else(PoisonError::into_inner);
            if conn.generation() != generation {
                return;
            }
            let Some(fd) = conn.raw_fd() else {
                return;
            };
            let interest = match conn.process(&ctx) {
                Phase::Reading => Interest::Read,
                // Closing also waits for write readiness; the reactor then tears it down
                Phase::Writing | Phase::Closing | Phase::Idle => Interest::Write,
            };
            // Re-armed under the lock so eviction cannot race the registration
            if let Err(e) = epoll.rearm(fd, token as u64, interest) {
                warn!("Re-arming slot {} failed: {}", token, e);
            }
        })
    }

    fn on_writable(&mut self, token: usize) {
        let Some(slot) = self.slot(token) else {
            return;
        };
        let (next, fd, generation) = {
            let mut conn = slot.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(fd) = conn.raw_fd() else {
                return;
            };
            let generation = conn.generation();
            if conn.phase() != Phase::Writing {
                (AfterWrite::Close, fd, generation)
            } else {
                let before = conn.bytes_sent();
                let progress = conn.write_to(&mut FdStream::new(fd));
                self.registry
                    .ctx
                    .metrics
                    .add_bytes(conn.bytes_sent().saturating_sub(before));

                let next = match progress {
                    Ok(WriteProgress::Pending) => AfterWrite::Rearm(Interest::Write),
                    Ok(WriteProgress::Complete) if conn.keep_alive() => {
                        conn.reset_for_next();
                        debug!("Slot {} kept alive", token);
                        if conn.has_buffered_bytes() {
                            AfterWrite::Resubmit
                        } else {
                            AfterWrite::Rearm(Interest::Read)
                        }
                    }
                    Ok(WriteProgress::Complete) => AfterWrite::Close,
                    Err(e) => {
                        debug!("Write on slot {} failed: {}", token, e);
                        AfterWrite::Close
                    }
                };
                (next, fd, generation)
            }
        };

        match next {
            AfterWrite::Close => self.close_now(token),
            AfterWrite::Rearm(interest) => {
                if let Err(e) = self.registry.epoll.rearm(fd, token as u64, interest) {
                    warn!("Re-arming slot {} failed: {}", token, e);
                    self.close_now(token);
                    return;
                }
                self.timers.adjust(token, self.idle_timeout);
            }
            AfterWrite::Resubmit => {
                if let Err(e) = self.submit(token, slot, generation) {
                    warn!("Cannot queue slot {}: {}", token, e);
                    self.close_now(token);
                    return;
                }
                self.timers.adjust(token, self.idle_timeout);
            }
        }
    }

    /// Stops the workers, then closes every remaining connection.
    fn teardown(&mut self) {
        self.pool.shutdown();
        let open: Vec<usize> = self.registry.slab.allocated().collect();
        for token in open {
            self.registry.evict(token);
        }
        self.registry.deferred.clear();
        self.timers.clear();
    }
}
