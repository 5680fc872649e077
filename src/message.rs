//! Canonical market-event record shared by the UDP wire, the ring buffer and
//! capture files.
//!
//! One `WireMessage` occupies exactly one 64-byte cache line. The same
//! layout is used in memory and on the wire; only the multi-byte integer
//! fields change representation between the two (big-endian on the wire,
//! host order in memory). `price` and `symbol` are never byte-swapped.
//!
//! Layout (version 1):
//! ```text
//! Offset  Size  Field
//! 0       1     msg_type (ASCII code, 0 = Unknown)
//! 1       1     side (0 = Buy, 1 = Sell, 255 = Unknown)
//! 2       1     version
//! 3       5     reserved (zero)
//! 8       8     order_id
//! 16      8     symbol (ASCII, zero/space padded)
//! 24      4     size
//! 28      4     reserved (zero)
//! 32      8     price (f64, native representation)
//! 40      8     timestamp_ns
//! 48      8     sequence_number
//! 56      8     reserved (zero)
//! Total: 64 bytes
//! ```

use std::borrow::Cow;
use std::fmt;
use std::mem::{align_of, offset_of, size_of};

use thiserror::Error;

/// Current layout version carried in byte 2 of every message.
pub const WIRE_VERSION: u8 = 1;

/// Bytes per datagram / per in-memory message.
pub const WIRE_MESSAGE_SIZE: usize = 64;

/// Width of the fixed symbol field.
pub const SYMBOL_LEN: usize = 8;

/// Field offsets. Single source of truth for the codec and the layout asserts.
pub mod layout {
    pub const MSG_TYPE: usize = 0;
    pub const SIDE: usize = 1;
    pub const VERSION: usize = 2;
    pub const ORDER_ID: usize = 8;
    pub const SYMBOL: usize = 16;
    pub const SIZE: usize = 24;
    pub const PRICE: usize = 32;
    pub const TIMESTAMP_NS: usize = 40;
    pub const SEQUENCE_NUMBER: usize = 48;
}

/// Message kinds, encoded as their ITCH-style ASCII codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum MessageType {
    AddOrder = b'A',
    /// Add order with market participant attribution.
    AddOrderMp = b'F',
    OrderExecuted = b'E',
    OrderCancel = b'X',
    Trade = b'P',
    /// Reserved for invalid or uninitialised messages.
    #[default]
    Unknown = 0,
}

impl MessageType {
    pub fn from_u8(v: u8) -> Self {
        match v {
            b'A' => Self::AddOrder,
            b'F' => Self::AddOrderMp,
            b'E' => Self::OrderExecuted,
            b'X' => Self::OrderCancel,
            b'P' => Self::Trade,
            _ => Self::Unknown,
        }
    }

    pub fn as_char(self) -> char {
        match self {
            Self::Unknown => '?',
            other => other as u8 as char,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Side {
    Buy = 0,
    Sell = 1,
    #[default]
    Unknown = 255,
}

impl Side {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Buy,
            1 => Self::Sell,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("payload has {actual} bytes, expected {expected}")]
    WrongLength { expected: usize, actual: usize },
    #[error("unsupported wire layout version {0} (expected {expected})", expected = WIRE_VERSION)]
    UnsupportedVersion(u8),
}

/// A single market event. See the module docs for the byte layout.
#[derive(Clone, Copy, PartialEq)]
#[repr(C, align(64))]
pub struct WireMessage {
    pub msg_type: MessageType,
    pub side: Side,
    version: u8,
    _reserved0: [u8; 5],
    pub order_id: u64,
    pub symbol: [u8; SYMBOL_LEN],
    pub size: u32,
    _reserved1: u32,
    pub price: f64,
    pub timestamp_ns: u64,
    pub sequence_number: u64,
    _reserved2: [u8; 8],
}

const _: () = assert!(size_of::<WireMessage>() == WIRE_MESSAGE_SIZE);
const _: () = assert!(align_of::<WireMessage>() == 64);
const _: () = assert!(offset_of!(WireMessage, msg_type) == layout::MSG_TYPE);
const _: () = assert!(offset_of!(WireMessage, side) == layout::SIDE);
const _: () = assert!(offset_of!(WireMessage, version) == layout::VERSION);
const _: () = assert!(offset_of!(WireMessage, order_id) == layout::ORDER_ID);
const _: () = assert!(offset_of!(WireMessage, symbol) == layout::SYMBOL);
const _: () = assert!(offset_of!(WireMessage, size) == layout::SIZE);
const _: () = assert!(offset_of!(WireMessage, price) == layout::PRICE);
const _: () = assert!(offset_of!(WireMessage, timestamp_ns) == layout::TIMESTAMP_NS);
const _: () = assert!(offset_of!(WireMessage, sequence_number) == layout::SEQUENCE_NUMBER);

impl Default for WireMessage {
    fn default() -> Self {
        Self {
            msg_type: MessageType::Unknown,
            side: Side::Unknown,
            version: WIRE_VERSION,
            _reserved0: [0; 5],
            order_id: 0,
            symbol: [0; SYMBOL_LEN],
            size: 0,
            _reserved1: 0,
            price: 0.0,
            timestamp_ns: 0,
            sequence_number: 0,
            _reserved2: [0; 8],
        }
    }
}

impl fmt::Debug for WireMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WireMessage")
            .field("msg_type", &self.msg_type)
            .field("side", &self.side)
            .field("order_id", &self.order_id)
            .field("symbol", &self.symbol_str())
            .field("size", &self.size)
            .field("price", &self.price)
            .field("timestamp_ns", &self.timestamp_ns)
            .field("sequence_number", &self.sequence_number)
            .finish()
    }
}

/// Copy `s` into a zero-padded symbol field, truncating past 8 bytes.
pub fn symbol_bytes(s: &str) -> [u8; SYMBOL_LEN] {
    let mut out = [0u8; SYMBOL_LEN];
    let n = s.len().min(SYMBOL_LEN);
    out[..n].copy_from_slice(&s.as_bytes()[..n]);
    out
}

impl WireMessage {
    pub fn new(msg_type: MessageType, symbol: &str) -> Self {
        Self {
            msg_type,
            symbol: symbol_bytes(symbol),
            ..Self::default()
        }
    }

    pub fn with_order(mut self, order_id: u64, side: Side, size: u32, price: f64) -> Self {
        self.order_id = order_id;
        self.side = side;
        self.size = size;
        self.price = price;
        self
    }

    pub fn with_sequence(mut self, sequence_number: u64, timestamp_ns: u64) -> Self {
        self.sequence_number = sequence_number;
        self.timestamp_ns = timestamp_ns;
        self
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    /// Symbol bytes with trailing zero/space padding removed.
    pub fn symbol_trimmed(&self) -> &[u8] {
        let end = self
            .symbol
            .iter()
            .rposition(|&b| b != 0 && b != b' ')
            .map_or(0, |i| i + 1);
        &self.symbol[..end]
    }

    pub fn symbol_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.symbol_trimmed())
    }

    #[inline]
    pub fn is_add_order(&self) -> bool {
        matches!(self.msg_type, MessageType::AddOrder | MessageType::AddOrderMp)
    }

    #[inline]
    pub fn is_executed(&self) -> bool {
        self.msg_type == MessageType::OrderExecuted
    }

    #[inline]
    pub fn is_canceled(&self) -> bool {
        self.msg_type == MessageType::OrderCancel
    }

    #[inline]
    pub fn is_trade(&self) -> bool {
        self.msg_type == MessageType::Trade
    }

    /// Big-endian wire representation -> host order. Price and symbol untouched.
    #[inline]
    pub fn to_host_order(&mut self) {
        self.order_id = u64::from_be(self.order_id);
        self.size = u32::from_be(self.size);
        self.timestamp_ns = u64::from_be(self.timestamp_ns);
        self.sequence_number = u64::from_be(self.sequence_number);
    }

    /// Host order -> big-endian wire representation. Price and symbol untouched.
    #[inline]
    pub fn to_network_order(&mut self) {
        self.order_id = self.order_id.to_be();
        self.size = self.size.to_be();
        self.timestamp_ns = self.timestamp_ns.to_be();
        self.sequence_number = self.sequence_number.to_be();
    }

    /// Serialize into a datagram payload.
    pub fn encode(&self) -> [u8; WIRE_MESSAGE_SIZE] {
        let mut net = *self;
        net.to_network_order();

        let mut out = [0u8; WIRE_MESSAGE_SIZE];
        out[layout::MSG_TYPE] = net.msg_type as u8;
        out[layout::SIDE] = net.side as u8;
        out[layout::VERSION] = net.version;
        put(&mut out, layout::ORDER_ID, &net.order_id.to_ne_bytes());
        put(&mut out, layout::SYMBOL, &net.symbol);
        put(&mut out, layout::SIZE, &net.size.to_ne_bytes());
        put(&mut out, layout::PRICE, &net.price.to_ne_bytes());
        put(&mut out, layout::TIMESTAMP_NS, &net.timestamp_ns.to_ne_bytes());
        put(&mut out, layout::SEQUENCE_NUMBER, &net.sequence_number.to_ne_bytes());
        out
    }

    /// Parse a datagram payload. Anything other than exactly one full,
    /// current-version message is rejected; unknown type/side bytes decode
    /// to the `Unknown` variants.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() != WIRE_MESSAGE_SIZE {
            return Err(DecodeError::WrongLength {
                expected: WIRE_MESSAGE_SIZE,
                actual: bytes.len(),
            });
        }
        let version = bytes[layout::VERSION];
        if version != WIRE_VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }

        let mut msg = Self {
            msg_type: MessageType::from_u8(bytes[layout::MSG_TYPE]),
            side: Side::from_u8(bytes[layout::SIDE]),
            order_id: u64::from_ne_bytes(take(bytes, layout::ORDER_ID)),
            symbol: take(bytes, layout::SYMBOL),
            size: u32::from_ne_bytes(take(bytes, layout::SIZE)),
            price: f64::from_ne_bytes(take(bytes, layout::PRICE)),
            timestamp_ns: u64::from_ne_bytes(take(bytes, layout::TIMESTAMP_NS)),
            sequence_number: u64::from_ne_bytes(take(bytes, layout::SEQUENCE_NUMBER)),
            ..Self::default()
        };
        msg.to_host_order();
        Ok(msg)
    }
}

#[inline]
fn put(out: &mut [u8; WIRE_MESSAGE_SIZE], off: usize, src: &[u8]) {
    out[off..off + src.len()].copy_from_slice(src);
}

#[inline]
fn take<const N: usize>(bytes: &[u8], off: usize) -> [u8; N] {
    let mut buf = [0u8; N];
    buf.copy_from_slice(&bytes[off..off + N]);
    buf
}
