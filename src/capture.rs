//! Capture files: a flat, headerless sequence of fixed-size records.
//!
//! Record layout (72 bytes):
//! ```text
//! Offset  Size  Field
//! 0       8     capture_ts_ns (big-endian, relative to session origin)
//! 8       64    WireMessage in wire encoding
//! ```
//! A file whose length is not a multiple of the record size is rejected,
//! as is any record that fails validation. Loading is all-or-nothing.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use thiserror::Error;
use tracing::{info, warn};

use crate::message::{DecodeError, WIRE_MESSAGE_SIZE, WireMessage};

pub const CAPTURE_RECORD_SIZE: usize = 8 + WIRE_MESSAGE_SIZE;

/// A wire message plus the time it was captured.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CapturedMessage {
    pub capture_ts_ns: u64,
    pub msg: WireMessage,
}

impl CapturedMessage {
    pub fn new(capture_ts_ns: u64, msg: WireMessage) -> Self {
        Self { capture_ts_ns, msg }
    }

    pub fn encode(&self) -> [u8; CAPTURE_RECORD_SIZE] {
        let mut out = [0u8; CAPTURE_RECORD_SIZE];
        out[..8].copy_from_slice(&self.capture_ts_ns.to_be_bytes());
        out[8..].copy_from_slice(&self.msg.encode());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() != CAPTURE_RECORD_SIZE {
            return Err(DecodeError::WrongLength { expected: CAPTURE_RECORD_SIZE, actual: bytes.len() });
        }
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&bytes[..8]);
        Ok(Self {
            capture_ts_ns: u64::from_be_bytes(ts),
            msg: WireMessage::decode(&bytes[8..])?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RecordDefect {
    #[error("empty symbol")]
    EmptySymbol,
    #[error("size must be positive")]
    ZeroSize,
    #[error("price must be positive")]
    NonPositivePrice,
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to read capture file {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(
        "capture data is {len} bytes, {trailing} bytes past the last whole {record}-byte record",
        record = CAPTURE_RECORD_SIZE
    )]
    Truncated { len: usize, trailing: usize },
    #[error("record {index} could not be decoded")]
    Decode {
        index: usize,
        #[source]
        source: DecodeError,
    },
    #[error("record {index} is invalid: {defect}")]
    InvalidRecord { index: usize, defect: RecordDefect },
}

/// Replayable records need a symbol, a size and a positive price.
pub fn validate_record(msg: &WireMessage) -> Result<(), RecordDefect> {
    if msg.symbol_trimmed().is_empty() {
        return Err(RecordDefect::EmptySymbol);
    }
    if msg.size == 0 {
        return Err(RecordDefect::ZeroSize);
    }
    // NaN fails this comparison too.
    if !(msg.price > 0.0) {
        return Err(RecordDefect::NonPositivePrice);
    }
    Ok(())
}

pub fn parse_capture(bytes: &[u8]) -> Result<Vec<CapturedMessage>, CaptureError> {
    let trailing = bytes.len() % CAPTURE_RECORD_SIZE;
    if trailing != 0 {
        return Err(CaptureError::Truncated { len: bytes.len(), trailing });
    }
    bytes
        .chunks_exact(CAPTURE_RECORD_SIZE)
        .enumerate()
        .map(|(index, chunk)| {
            let rec = CapturedMessage::decode(chunk).map_err(|source| CaptureError::Decode { index, source })?;
            validate_record(&rec.msg).map_err(|defect| CaptureError::InvalidRecord { index, defect })?;
            Ok(rec)
        })
        .collect()
}

/// Read and validate a whole capture file into memory.
pub fn load_capture(path: impl AsRef<Path>) -> Result<Vec<CapturedMessage>, CaptureError> {
    let path = path.as_ref();
    let bytes = fs::read(path).map_err(|source| CaptureError::Io { path: path.to_path_buf(), source })?;
    parse_capture(&bytes)
}

pub fn write_capture(path: impl AsRef<Path>, records: &[CapturedMessage]) -> io::Result<u64> {
    let mut w = CaptureWriter::create(path)?;
    for rec in records {
        w.append(rec)?;
    }
    w.finish()
}

/// Sequential record writer. Truncates any existing file.
pub struct CaptureWriter {
    w: BufWriter<File>,
    written: u64,
}

impl CaptureWriter {
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).write(true).truncate(true).open(path)?;
        Ok(Self { w: BufWriter::with_capacity(1 << 20, file), written: 0 })
    }

    pub fn append(&mut self, rec: &CapturedMessage) -> io::Result<()> {
        self.w.write_all(&rec.encode())?;
        self.written += 1;
        Ok(())
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn finish(mut self) -> io::Result<u64> {
        self.w.flush()?;
        Ok(self.written)
    }
}

/// Cloneable, non-blocking entry point into a [`CaptureRecorder`].
#[derive(Clone)]
pub struct RecordHandle {
    tx: Sender<CapturedMessage>,
    dropped: Arc<AtomicU64>,
}

impl RecordHandle {
    /// Queue a record; a full queue drops it and counts the drop.
    #[inline]
    pub fn try_record(&self, rec: CapturedMessage) -> bool {
        match self.tx.try_send(rec) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}

/// Background capture writer fed through a bounded channel, so hot-path
/// threads never touch the file.
pub struct CaptureRecorder {
    path: PathBuf,
    handle: Option<RecordHandle>,
    writer: Option<JoinHandle<Result<u64>>>,
    dropped: Arc<AtomicU64>,
}

impl CaptureRecorder {
    /// Open `path` now (so failures surface to the caller) and start the
    /// writer thread.
    pub fn spawn(path: impl Into<PathBuf>, queue_depth: usize) -> Result<Self> {
        let path = path.into();
        let writer = CaptureWriter::create(&path).with_context(|| format!("create capture file {}", path.display()))?;
        let (tx, rx) = bounded::<CapturedMessage>(queue_depth.max(1));
        let dropped = Arc::new(AtomicU64::new(0));

        let thread_path = path.clone();
        let join = thread::Builder::new()
            .name("capture-writer".to_string())
            .spawn(move || writer_thread(writer, rx, &thread_path))
            .context("spawn capture writer thread")?;

        info!(path = %path.display(), "capture recording started");
        Ok(Self {
            path,
            handle: Some(RecordHandle { tx, dropped: Arc::clone(&dropped) }),
            writer: Some(join),
            dropped,
        })
    }

    pub fn handle(&self) -> Option<RecordHandle> {
        self.handle.clone()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Close the queue and wait for the writer to flush. Every cloned
    /// [`RecordHandle`] must already be gone, otherwise this waits for them.
    pub fn finish(mut self) -> Result<u64> {
        self.close()
    }

    fn close(&mut self) -> Result<u64> {
        self.handle = None;
        let Some(join) = self.writer.take() else {
            return Ok(0);
        };
        let written = join.join().map_err(|_| anyhow!("capture writer thread panicked"))??;
        let dropped = self.dropped();
        if dropped > 0 {
            warn!(dropped, "capture queue overflowed, records were not written");
        }
        info!(path = %self.path.display(), written, "capture recording finished");
        Ok(written)
    }
}

impl Drop for CaptureRecorder {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("capture writer error: {e:#}");
        }
    }
}

fn writer_thread(mut w: CaptureWriter, rx: Receiver<CapturedMessage>, path: &Path) -> Result<u64> {
    for rec in rx {
        w.append(&rec).with_context(|| format!("write {}", path.display()))?;
    }
    w.finish().with_context(|| format!("flush {}", path.display()))
}

/// `captures/<LABEL>_YYYY_MM_DD.cap` for today's local date (UTC if the
/// local offset cannot be determined).
pub fn default_capture_path(label: &str) -> PathBuf {
    let now = time::OffsetDateTime::now_local().unwrap_or_else(|_| time::OffsetDateTime::now_utc());
    let d = now.date();
    let fname = format!("{}_{}_{:02}_{:02}.cap", label.to_uppercase(), d.year(), d.month() as u8, d.day());
    let mut p = PathBuf::from("captures");
    p.push(fname);
    p
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageType, Side, layout};

    fn rec(ts: u64, sym: &str, size: u32, price: f64) -> CapturedMessage {
        CapturedMessage::new(
            ts,
            WireMessage::new(MessageType::AddOrder, sym).with_order(ts + 1, Side::Buy, size, price),
        )
    }

    #[test]
    fn write_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("s.cap");
        let records = vec![rec(0, "AAPL", 10, 1.5), rec(1_000, "GOOG", 20, 2.5)];
        assert_eq!(write_capture(&path, &records).unwrap(), 2);
        assert_eq!(fs::metadata(&path).unwrap().len(), 2 * CAPTURE_RECORD_SIZE as u64);
        assert_eq!(load_capture(&path).unwrap(), records);
    }

    #[test]
    fn empty_file_loads_as_empty_session() {
        assert!(parse_capture(&[]).unwrap().is_empty());
    }

    #[test]
    fn trailing_bytes_reject_the_file() {
        let mut bytes = rec(0, "AAPL", 1, 1.0).encode().to_vec();
        bytes.extend_from_slice(&[0u8; 5]);
        assert!(matches!(
            parse_capture(&bytes),
            Err(CaptureError::Truncated { len, trailing: 5 }) if len == CAPTURE_RECORD_SIZE + 5
        ));
    }

    #[test]
    fn invalid_record_reports_its_index() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&rec(0, "AAPL", 1, 1.0).encode());
        bytes.extend_from_slice(&rec(5, "MSFT", 1, 1.0).encode());
        bytes.extend_from_slice(&rec(9, "TSLA", 0, 1.0).encode());
        assert!(matches!(
            parse_capture(&bytes),
            Err(CaptureError::InvalidRecord { index: 2, defect: RecordDefect::ZeroSize })
        ));
    }

    #[test]
    fn each_defect_is_detected() {
        assert_eq!(validate_record(&rec(0, "", 1, 1.0).msg), Err(RecordDefect::EmptySymbol));
        assert_eq!(validate_record(&rec(0, "A", 0, 1.0).msg), Err(RecordDefect::ZeroSize));
        assert_eq!(validate_record(&rec(0, "A", 1, 0.0).msg), Err(RecordDefect::NonPositivePrice));
        assert_eq!(validate_record(&rec(0, "A", 1, -3.0).msg), Err(RecordDefect::NonPositivePrice));
        assert_eq!(validate_record(&rec(0, "A", 1, f64::NAN).msg), Err(RecordDefect::NonPositivePrice));
        assert!(validate_record(&rec(0, "A", 1, 0.01).msg).is_ok());
    }

    #[test]
    fn undecodable_record_reports_its_index() {
        let mut second = rec(5, "MSFT", 1, 1.0).encode();
        second[8 + layout::VERSION] = 0;
        let mut bytes = rec(0, "AAPL", 1, 1.0).encode().to_vec();
        bytes.extend_from_slice(&second);
        assert!(matches!(
            parse_capture(&bytes),
            Err(CaptureError::Decode { index: 1, source: DecodeError::UnsupportedVersion(0) })
        ));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(load_capture(dir.path().join("nope.cap")), Err(CaptureError::Io { .. })));
    }

    #[test]
    fn recorder_writes_everything_queued() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec.cap");
        let recorder = CaptureRecorder::spawn(&path, 1024).unwrap();
        let handle = recorder.handle().unwrap();
        let producer = thread::spawn(move || {
            for i in 0..100u64 {
                while !handle.try_record(rec(i, "AAPL", 1, 1.0)) {
                    thread::yield_now();
                }
            }
        });
        producer.join().unwrap();
        assert_eq!(recorder.finish().unwrap(), 100);
        let loaded = load_capture(&path).unwrap();
        assert_eq!(loaded.len(), 100);
        assert!(loaded.windows(2).all(|w| w[0].capture_ts_ns < w[1].capture_ts_ns));
    }

    #[test]
    fn default_path_shape() {
        let p = default_capture_path("session");
        assert!(p.starts_with("captures"));
        let name = p.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("SESSION_"));
        assert!(name.ends_with(".cap"));
        assert_eq!(name.len(), "SESSION_2026_01_01.cap".len());
    }
}
