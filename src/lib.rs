//! Low-latency market data feed pipeline.
//!
//! This crate provides the pieces used by the `hft_feed` listener binary,
//! the `replayer` and the `generator` tools:
//!
//! - `message`: fixed 64-byte wire message, network/host byte order
//!   conversion and datagram encode/decode
//! - `ring`: lock-free SPSC ring buffer with drop and high-water-mark
//!   counters, split into one producer and one consumer half
//! - `affinity` / `executor`: threads pinned to a CPU core with cooperative
//!   stop and panic containment
//! - `listener`: non-blocking UDP receiver feeding a sink (usually the ring)
//! - `consumer`: pinned busy-poll loop draining the ring into a handler
//! - `replayer`: timestamp-paced UDP replay of a capture session
//! - `capture`: flat capture file format, loading with validation, and a
//!   background recorder
//!
//! Data flows `replayer -> UDP -> listener -> ring -> consumer -> handler`,
//! with each actor on its own thread and the ring as the only shared state.
pub mod affinity;
pub mod capture;
pub mod clock;
pub mod config;
pub mod consumer;
pub mod executor;
pub mod generator;
pub mod listener;
pub mod message;
pub mod replayer;
pub mod ring;
pub mod strategy;
pub mod telemetry;

pub use capture::CapturedMessage;
pub use consumer::{MessageHandler, RingConsumer};
pub use executor::{PinnedExecutor, StopToken};
pub use listener::{MessageSink, UdpListener};
pub use message::{MessageType, Side, WireMessage};
pub use replayer::UdpReplayer;
pub use ring::SpScRingBuffer;
