//! Non-blocking UDP listener running on a pinned thread.
//!
//! `Idle -> Running -> Stopping -> Stopped`. The socket is bound on the
//! caller's thread inside [`UdpListener::start`] so bind failures surface as
//! startup errors; the receive loop then owns it and closes it on exit.
//! Each iteration tries one non-blocking receive: a full, current-version
//! datagram is decoded and handed to the sink, anything else is counted
//! and discarded, and an empty socket costs one CPU pause hint.

use std::fmt;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex, PoisonError};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::affinity::{self, Placement};
use crate::clock;
use crate::executor::{ExecutorError, PinnedExecutor, StopToken, WorkerExit, cpu_relax};
use crate::message::{WIRE_MESSAGE_SIZE, WireMessage};
use crate::ring::Producer;

/// Destination for decoded messages. Runs on the listener thread and must
/// not block. Returns `false` when the message was refused (e.g. ring full).
pub trait MessageSink: Send + 'static {
    fn deliver(&mut self, msg: &WireMessage) -> bool;
}

impl MessageSink for Producer<WireMessage> {
    #[inline]
    fn deliver(&mut self, msg: &WireMessage) -> bool {
        self.try_push(*msg).is_ok()
    }
}

impl<F> MessageSink for F
where
    F: FnMut(&WireMessage) -> bool + Send + 'static,
{
    #[inline]
    fn deliver(&mut self, msg: &WireMessage) -> bool {
        self(msg)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("listener cannot start from state {0}")]
    AlreadyStarted(ListenerState),
    #[error("failed to bind UDP socket on {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to configure UDP socket")]
    Socket(#[source] std::io::Error),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub bind_ip: IpAddr,
    /// 0 picks an ephemeral port, see [`UdpListener::local_addr`].
    pub port: u16,
    pub core: Option<usize>,
}

impl ListenerConfig {
    pub fn new(port: u16) -> Self {
        Self { bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED), port, core: None }
    }

    pub fn pinned_to(mut self, core: Option<usize>) -> Self {
        self.core = core;
        self
    }
}

#[derive(Debug, Default)]
pub struct ListenerStats {
    pub datagrams: AtomicU64,
    pub delivered: AtomicU64,
    pub dropped: AtomicU64,
    pub malformed: AtomicU64,
    pub recv_errors: AtomicU64,
    pub last_recv_mono_ns: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ListenerStatsSnapshot {
    pub datagrams: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub malformed: u64,
    pub recv_errors: u64,
    pub last_recv_mono_ns: u64,
}

impl ListenerStats {
    pub fn snapshot(&self) -> ListenerStatsSnapshot {
        ListenerStatsSnapshot {
            datagrams: self.datagrams.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            recv_errors: self.recv_errors.load(Ordering::Relaxed),
            last_recv_mono_ns: self.last_recv_mono_ns.load(Ordering::Relaxed),
        }
    }
}

pub struct UdpListener<S: MessageSink> {
    config: ListenerConfig,
    // The receive thread takes the sink once it is running. Until then it
    // stays here, so a failed start can be retried.
    sink: Arc<Mutex<Option<S>>>,
    state: ListenerState,
    stats: Arc<ListenerStats>,
    local_addr: Option<SocketAddr>,
    executor: Option<PinnedExecutor>,
}

impl<S: MessageSink> UdpListener<S> {
    /// Rejects an out-of-range core up front; nothing is bound yet.
    pub fn new(config: ListenerConfig, sink: S) -> Result<Self, ListenerError> {
        affinity::check_core(config.core).map_err(ExecutorError::from)?;
        Ok(Self {
            config,
            sink: Arc::new(Mutex::new(Some(sink))),
            state: ListenerState::Idle,
            stats: Arc::new(ListenerStats::default()),
            local_addr: None,
            executor: None,
        })
    }

    pub fn state(&self) -> ListenerState {
        self.state
    }

    /// Running and the receive thread has not exited on its own.
    pub fn is_running(&self) -> bool {
        self.state() == ListenerState::Running
            && self.executor.as_ref().is_some_and(|e| !e.is_finished())
    }

    pub fn stats(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.stats)
    }

    /// Where the receive thread landed; `None` before it has started.
    pub fn placement(&self) -> Option<Placement> {
        self.executor.as_ref().and_then(PinnedExecutor::placement)
    }

    /// Bound address once started (resolves port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn start(&mut self) -> Result<(), ListenerError> {
        self.start_with_token(StopToken::new())
    }

    /// Start observing a caller-owned token, so one shutdown signal can stop
    /// several actors. [`stop`](Self::stop) still sets it and joins.
    pub fn start_with_token(&mut self, token: StopToken) -> Result<(), ListenerError> {
        let state = self.state();
        if state != ListenerState::Idle {
            return Err(ListenerError::AlreadyStarted(state));
        }

        let addr = SocketAddr::new(self.config.bind_ip, self.config.port);
        let socket = UdpSocket::bind(addr).map_err(|source| ListenerError::Bind { addr, source })?;
        socket.set_nonblocking(true).map_err(ListenerError::Socket)?;
        let local = socket.local_addr().map_err(ListenerError::Socket)?;

        let slot = Arc::clone(&self.sink);
        let stats = Arc::clone(&self.stats);
        let executor = PinnedExecutor::spawn_with_token(
            format!("udp-listener-{}", local.port()),
            self.config.core,
            token,
            move |stop| {
                let taken = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
                let Some(mut sink) = taken else {
                    anyhow::bail!("listener sink already consumed");
                };
                receive_loop(&socket, &mut sink, &stats, stop);
                Ok(())
            },
        )?;

        self.local_addr = Some(local);
        self.executor = Some(executor);
        self.state = ListenerState::Running;
        info!(%local, core = ?self.config.core, "udp listener started");
        Ok(())
    }

    /// Signal the receive loop, join it and release the socket.
    pub fn stop(&mut self) {
        if self.state() != ListenerState::Running {
            return;
        }
        self.state = ListenerState::Stopping;
        if let Some(mut executor) = self.executor.take() {
            match executor.stop() {
                Some(WorkerExit::Completed(())) | None => {}
                Some(WorkerExit::Failed(e)) => warn!("listener thread failed: {e:#}"),
                Some(WorkerExit::Panicked(msg)) => warn!("listener thread panicked: {msg}"),
            }
        }
        self.state = ListenerState::Stopped;
        let s = self.stats.snapshot();
        info!(
            datagrams = s.datagrams,
            delivered = s.delivered,
            dropped = s.dropped,
            malformed = s.malformed,
            "udp listener stopped"
        );
    }
}

impl<S: MessageSink> Drop for UdpListener<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn receive_loop<S: MessageSink>(socket: &UdpSocket, sink: &mut S, stats: &ListenerStats, stop: &StopToken) {
    // Room for one extra message so oversized datagrams are seen as such.
    let mut buf = [0u8; WIRE_MESSAGE_SIZE * 2];
    while !stop.is_stopped() {
        match socket.recv_from(&mut buf) {
            Ok((n, _peer)) => {
                stats.datagrams.fetch_add(1, Ordering::Relaxed);
                stats.last_recv_mono_ns.store(clock::mono_ns(), Ordering::Relaxed);
                match WireMessage::decode(&buf[..n]) {
                    Ok(msg) => {
                        if sink.deliver(&msg) {
                            stats.delivered.fetch_add(1, Ordering::Relaxed);
                        } else {
                            stats.dropped.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    Err(_) => {
                        stats.malformed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => cpu_relax(),
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(_) => {
                stats.recv_errors.fetch_add(1, Ordering::Relaxed);
                cpu_relax();
            }
        }
    }
}
