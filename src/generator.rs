//! Deterministic synthetic capture sessions.
//!
//! The same seed always yields the same records, so a generated file can be
//! regenerated instead of checked in.

use std::io;
use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

use crate::capture::{CaptureWriter, CapturedMessage};
use crate::message::{MessageType, SYMBOL_LEN, Side, WireMessage, symbol_bytes};

pub const DEFAULT_SEED: u64 = 0xDEAD_BEEF;

#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error("at least one symbol is required")]
    NoSymbols,
    #[error("symbol {0:?} must be 1..={max} bytes", max = SYMBOL_LEN)]
    BadSymbol(String),
    #[error("max_gap_ns must be at least 1")]
    ZeroGap,
    #[error("failed to write generated session")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub seed: u64,
    pub count: usize,
    pub symbols: Vec<String>,
    /// Inter-message gaps are drawn from `1..=max_gap_ns`.
    pub max_gap_ns: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            seed: DEFAULT_SEED,
            count: 10_000,
            symbols: vec!["AAPL".into(), "GOOG".into(), "MSFT".into()],
            max_gap_ns: 100,
        }
    }
}

/// Endless stream of AddOrder records; take as many as needed.
pub struct SessionGenerator {
    rng: StdRng,
    symbols: Vec<[u8; SYMBOL_LEN]>,
    max_gap_ns: u64,
    ts_ns: u64,
    seq: u64,
}

impl SessionGenerator {
    pub fn new(config: &GeneratorConfig) -> Result<Self, GeneratorError> {
        if config.symbols.is_empty() {
            return Err(GeneratorError::NoSymbols);
        }
        if config.max_gap_ns == 0 {
            return Err(GeneratorError::ZeroGap);
        }
        let symbols = config
            .symbols
            .iter()
            .map(|s| {
                if s.is_empty() || s.len() > SYMBOL_LEN {
                    Err(GeneratorError::BadSymbol(s.clone()))
                } else {
                    Ok(symbol_bytes(s))
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            rng: StdRng::seed_from_u64(config.seed),
            symbols,
            max_gap_ns: config.max_gap_ns,
            ts_ns: 0,
            seq: 0,
        })
    }
}

impl Iterator for SessionGenerator {
    type Item = CapturedMessage;

    fn next(&mut self) -> Option<CapturedMessage> {
        let symbol = self.symbols[self.rng.gen_range(0..self.symbols.len())];
        let side = if self.rng.gen_bool(0.5) { Side::Buy } else { Side::Sell };
        let order_id = self.rng.gen_range(1..=1_000_000u64);
        let price = f64::from(self.rng.gen_range(100..=10_000u32));
        let size = self.rng.gen_range(1..=1_000u32);

        self.seq += 1;
        let mut msg = WireMessage::new(MessageType::AddOrder, "")
            .with_order(order_id, side, size, price)
            .with_sequence(self.seq, self.ts_ns);
        msg.symbol = symbol;

        self.ts_ns += self.rng.gen_range(1..=self.max_gap_ns);
        Some(CapturedMessage::new(self.ts_ns, msg))
    }
}

pub fn generate(config: &GeneratorConfig) -> Result<Vec<CapturedMessage>, GeneratorError> {
    Ok(SessionGenerator::new(config)?.take(config.count).collect())
}

/// Stream a generated session straight to disk. Returns bytes written.
pub fn generate_to_file(path: impl AsRef<Path>, config: &GeneratorConfig) -> Result<u64, GeneratorError> {
    let mut writer = CaptureWriter::create(path)?;
    for rec in SessionGenerator::new(config)?.take(config.count) {
        writer.append(&rec)?;
    }
    Ok(writer.finish()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{load_capture, validate_record};

    fn small(seed: u64) -> GeneratorConfig {
        GeneratorConfig { seed, count: 500, ..GeneratorConfig::default() }
    }

    #[test]
    fn same_seed_same_session() {
        let a = generate(&small(7)).unwrap();
        let b = generate(&small(7)).unwrap();
        let c = generate(&small(8)).unwrap();
        assert_eq!(a.iter().map(|r| r.encode()).collect::<Vec<_>>(), b.iter().map(|r| r.encode()).collect::<Vec<_>>());
        assert_ne!(a.iter().map(|r| r.encode()).collect::<Vec<_>>(), c.iter().map(|r| r.encode()).collect::<Vec<_>>());
    }

    #[test]
    fn records_are_valid_and_monotonic() {
        let session = generate(&small(DEFAULT_SEED)).unwrap();
        assert_eq!(session.len(), 500);
        for (i, rec) in session.iter().enumerate() {
            validate_record(&rec.msg).unwrap();
            assert!(rec.msg.is_add_order());
            assert_eq!(rec.msg.sequence_number, i as u64 + 1);
            assert!(["AAPL", "GOOG", "MSFT"].contains(&rec.msg.symbol_str().as_ref()));
            assert!((100.0..=10_000.0).contains(&rec.msg.price));
        }
        assert!(session.windows(2).all(|w| w[0].capture_ts_ns < w[1].capture_ts_ns));
    }

    #[test]
    fn rejects_bad_configs() {
        let no_symbols = GeneratorConfig { symbols: vec![], ..GeneratorConfig::default() };
        assert!(matches!(generate(&no_symbols), Err(GeneratorError::NoSymbols)));
        let long = GeneratorConfig { symbols: vec!["TOOLONGSYM".into()], ..GeneratorConfig::default() };
        assert!(matches!(generate(&long), Err(GeneratorError::BadSymbol(_))));
        let zero_gap = GeneratorConfig { max_gap_ns: 0, ..GeneratorConfig::default() };
        assert!(matches!(generate(&zero_gap), Err(GeneratorError::ZeroGap)));
    }

    #[test]
    fn file_output_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gen.cap");
        let written = generate_to_file(&path, &small(1)).unwrap();
        assert_eq!(written, 500);
        let loaded = load_capture(&path).unwrap();
        assert_eq!(loaded.len(), 500);
        assert_eq!(loaded[0].encode(), generate(&small(1)).unwrap()[0].encode());
    }
}
