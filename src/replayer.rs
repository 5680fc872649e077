//! Timestamp-paced UDP replay of a capture session.
//!
//! Message `i` is sent at `start + (ts[i] - ts[0]) / speed_factor`. The
//! send thread sleeps until shortly before each deadline and spins on a
//! pause hint for the rest, so messages are never sent early. A failed send
//! aborts the replay; ordering matters more than delivery.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::capture::{self, CaptureError, CapturedMessage};
use crate::executor::{ExecutorError, PinnedExecutor, StopToken, WorkerExit, cpu_relax};

/// Below this much remaining time the sender spins instead of sleeping.
const SPIN_WINDOW: Duration = Duration::from_micros(200);
/// Longest single sleep, bounds how long a stop request can go unnoticed.
const MAX_NAP: Duration = Duration::from_millis(5);

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("speed factor must be finite and positive, got {0}")]
    InvalidSpeed(f64),
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error("failed to open UDP send socket")]
    Socket(#[source] io::Error),
    #[error("sending record {index} to {destination} failed")]
    Send {
        index: usize,
        destination: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("replay already started")]
    AlreadyStarted,
    #[error("replay was never started")]
    NotStarted,
    #[error("replay thread died: {0}")]
    Worker(String),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

#[derive(Debug, Clone)]
pub struct ReplayConfig {
    pub destination: SocketAddr,
    /// 1.0 reproduces recorded spacing, 2.0 halves it, 0.5 doubles it.
    pub speed_factor: f64,
    pub core: Option<usize>,
}

impl ReplayConfig {
    pub fn new(destination: SocketAddr) -> Self {
        Self { destination, speed_factor: 1.0, core: None }
    }

    pub fn with_speed(mut self, speed_factor: f64) -> Self {
        self.speed_factor = speed_factor;
        self
    }

    pub fn pinned_to(mut self, core: Option<usize>) -> Self {
        self.core = core;
        self
    }
}

/// What the send thread did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReplayReport {
    pub total: usize,
    pub sent: usize,
    /// True when every record was sent; false after an early stop.
    pub completed: bool,
    /// Actual send time of each message, relative to replay start.
    pub send_offsets_ns: Vec<u64>,
    pub max_lateness_ns: u64,
}

#[derive(Debug, Default)]
struct Progress {
    sent: AtomicUsize,
    finished: AtomicBool,
}

pub struct UdpReplayer {
    config: ReplayConfig,
    records: Arc<[CapturedMessage]>,
    progress: Arc<Progress>,
    executor: Option<PinnedExecutor<ReplayReport>>,
}

impl UdpReplayer {
    /// Load and validate a capture file. Any bad record rejects the file.
    pub fn load(path: impl AsRef<Path>, config: ReplayConfig) -> Result<Self, ReplayError> {
        let records = capture::load_capture(path)?;
        Self::from_records(records, config)
    }

    pub fn from_records(records: Vec<CapturedMessage>, config: ReplayConfig) -> Result<Self, ReplayError> {
        if !config.speed_factor.is_finite() || config.speed_factor <= 0.0 {
            return Err(ReplayError::InvalidSpeed(config.speed_factor));
        }
        for (index, rec) in records.iter().enumerate() {
            capture::validate_record(&rec.msg)
                .map_err(|defect| CaptureError::InvalidRecord { index, defect })?;
        }
        Ok(Self {
            config,
            records: records.into(),
            progress: Arc::new(Progress::default()),
            executor: None,
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn sent(&self) -> usize {
        self.progress.sent.load(Ordering::Relaxed)
    }

    /// Every record has been sent.
    pub fn finished(&self) -> bool {
        self.progress.finished.load(Ordering::Acquire)
    }

    /// Started and the send thread has not exited yet.
    pub fn is_running(&self) -> bool {
        self.executor.as_ref().is_some_and(|e| !e.is_finished())
    }

    pub fn start(&mut self) -> Result<(), ReplayError> {
        if self.executor.is_some() {
            return Err(ReplayError::AlreadyStarted);
        }
        let destination = self.config.destination;
        let any: IpAddr = match destination {
            SocketAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
            SocketAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
        };
        let socket = UdpSocket::bind((any, 0)).map_err(ReplayError::Socket)?;

        let records = Arc::clone(&self.records);
        let progress = Arc::clone(&self.progress);
        let speed = self.config.speed_factor;
        let executor = PinnedExecutor::spawn("udp-replayer", self.config.core, move |stop| {
            let report = replay_loop(&socket, destination, &records, speed, &progress, stop)?;
            Ok(report)
        })?;
        self.executor = Some(executor);
        info!(%destination, records = self.records.len(), speed, "replay started");
        Ok(())
    }

    /// Block until the whole session has been sent (or the send failed).
    pub fn wait(&mut self) -> Result<ReplayReport, ReplayError> {
        let exit = self.executor.as_mut().ok_or(ReplayError::NotStarted)?.join();
        Self::into_report(exit)
    }

    /// Abandon the remaining records and join the send thread.
    pub fn stop(&mut self) -> Result<ReplayReport, ReplayError> {
        let exit = self.executor.as_mut().ok_or(ReplayError::NotStarted)?.stop();
        Self::into_report(exit)
    }

    fn into_report(exit: Option<WorkerExit<ReplayReport>>) -> Result<ReplayReport, ReplayError> {
        match exit {
            Some(WorkerExit::Completed(report)) => Ok(report),
            Some(WorkerExit::Failed(e)) => Err(match e.downcast::<ReplayError>() {
                Ok(err) => err,
                Err(other) => ReplayError::Worker(format!("{other:#}")),
            }),
            Some(WorkerExit::Panicked(msg)) => Err(ReplayError::Worker(msg)),
            None => Err(ReplayError::Worker("replay thread already joined".to_string())),
        }
    }
}

fn scaled_offset(delta_ns: u64, speed_factor: f64) -> Duration {
    Duration::from_nanos((delta_ns as f64 / speed_factor) as u64)
}

/// Wait until `deadline`. Returns false if stopped first.
fn sleep_until(deadline: Instant, stop: &StopToken) -> bool {
    loop {
        if stop.is_stopped() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        let remaining = deadline - now;
        if remaining > SPIN_WINDOW {
            thread::sleep((remaining - SPIN_WINDOW).min(MAX_NAP));
        } else {
            cpu_relax();
        }
    }
}

fn replay_loop(
    socket: &UdpSocket,
    destination: SocketAddr,
    records: &[CapturedMessage],
    speed_factor: f64,
    progress: &Progress,
    stop: &StopToken,
) -> Result<ReplayReport, ReplayError> {
    let mut report = ReplayReport {
        total: records.len(),
        send_offsets_ns: Vec::with_capacity(records.len()),
        ..ReplayReport::default()
    };
    let first_ts = records.first().map_or(0, |r| r.capture_ts_ns);
    let start = Instant::now();

    for (index, rec) in records.iter().enumerate() {
        // Out-of-order timestamps go out immediately.
        let offset = scaled_offset(rec.capture_ts_ns.saturating_sub(first_ts), speed_factor);
        if !sleep_until(start + offset, stop) {
            break;
        }
        socket
            .send_to(&rec.msg.encode(), destination)
            .map_err(|source| ReplayError::Send { index, destination, source })?;

        let actual = start.elapsed();
        report.send_offsets_ns.push(actual.as_nanos() as u64);
        report.max_lateness_ns = report.max_lateness_ns.max(actual.saturating_sub(offset).as_nanos() as u64);
        report.sent += 1;
        progress.sent.store(report.sent, Ordering::Relaxed);
    }

    report.completed = report.sent == report.total;
    if report.completed {
        progress.finished.store(true, Ordering::Release);
    }
    info!(sent = report.sent, total = report.total, "replay loop exited");
    Ok(report)
}
