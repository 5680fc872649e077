//! Example message handlers run on the consumer thread.
//!
//! Both are single-threaded: the consumer thread owns them outright, and
//! [`RingConsumer::stop`](crate::consumer::RingConsumer::stop) hands them
//! back for reporting.

use std::collections::{BTreeMap, HashMap, VecDeque};

use serde::Serialize;

use crate::consumer::MessageHandler;
use crate::message::{SYMBOL_LEN, Side, WireMessage, symbol_bytes};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SymbolStats {
    pub add_orders: u64,
    pub last_price: f64,
}

/// Counts messages per symbol and per side.
#[derive(Debug, Default)]
pub struct SymbolCounter {
    messages: u64,
    buys: u64,
    sells: u64,
    per_symbol: HashMap<[u8; SYMBOL_LEN], SymbolStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SymbolCounterReport {
    pub messages: u64,
    pub buys: u64,
    pub sells: u64,
    pub symbols: BTreeMap<String, SymbolStats>,
}

impl SymbolCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> u64 {
        self.messages
    }

    pub fn buys(&self) -> u64 {
        self.buys
    }

    pub fn sells(&self) -> u64 {
        self.sells
    }

    /// AddOrder count for `symbol` (0 if never seen).
    pub fn add_orders(&self, symbol: &str) -> u64 {
        self.per_symbol
            .get(&symbol_bytes(symbol))
            .map_or(0, |s| s.add_orders)
    }

    pub fn last_price(&self, symbol: &str) -> Option<f64> {
        self.per_symbol.get(&symbol_bytes(symbol)).map(|s| s.last_price)
    }

    pub fn report(&self) -> SymbolCounterReport {
        let symbols = self
            .per_symbol
            .iter()
            .map(|(sym, stats)| {
                let end = sym.iter().position(|&b| b == 0).unwrap_or(SYMBOL_LEN);
                (String::from_utf8_lossy(&sym[..end]).into_owned(), *stats)
            })
            .collect();
        SymbolCounterReport { messages: self.messages, buys: self.buys, sells: self.sells, symbols }
    }
}

impl MessageHandler<WireMessage> for SymbolCounter {
    #[inline]
    fn on_message(&mut self, msg: &WireMessage) {
        self.messages += 1;
        match msg.side {
            Side::Buy => self.buys += 1,
            Side::Sell => self.sells += 1,
            Side::Unknown => {}
        }
        let stats = self.per_symbol.entry(msg.symbol).or_default();
        stats.last_price = msg.price;
        if msg.is_add_order() {
            stats.add_orders += 1;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Signal {
    Buy,
    Sell,
    Hold,
}

/// Moving average over the last `window` prices. Below the average is a
/// buy, above it a sell. Holds until the window is full.
#[derive(Debug)]
pub struct MeanReversion {
    window: usize,
    prices: VecDeque<f64>,
    sum: f64,
    buys: u64,
    sells: u64,
    holds: u64,
}

impl MeanReversion {
    /// A zero window is treated as 1.
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self { window, prices: VecDeque::with_capacity(window + 1), sum: 0.0, buys: 0, sells: 0, holds: 0 }
    }

    pub fn on_price(&mut self, price: f64) -> Signal {
        self.prices.push_back(price);
        self.sum += price;
        if self.prices.len() > self.window {
            if let Some(old) = self.prices.pop_front() {
                self.sum -= old;
            }
        }
        if self.prices.len() < self.window {
            return Signal::Hold;
        }
        let avg = self.sum / self.prices.len() as f64;
        if price < avg {
            Signal::Buy
        } else if price > avg {
            Signal::Sell
        } else {
            Signal::Hold
        }
    }

    pub fn moving_average(&self) -> Option<f64> {
        (self.prices.len() == self.window).then(|| self.sum / self.window as f64)
    }

    /// (buy, sell, hold) signal counts so far.
    pub fn signal_counts(&self) -> (u64, u64, u64) {
        (self.buys, self.sells, self.holds)
    }
}

impl MessageHandler<WireMessage> for MeanReversion {
    #[inline]
    fn on_message(&mut self, msg: &WireMessage) {
        match self.on_price(msg.price) {
            Signal::Buy => self.buys += 1,
            Signal::Sell => self.sells += 1,
            Signal::Hold => self.holds += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;

    fn add(sym: &str, side: Side, price: f64) -> WireMessage {
        WireMessage::new(MessageType::AddOrder, sym).with_order(1, side, 10, price)
    }

    #[test]
    fn counter_tracks_symbols_and_sides() {
        let mut c = SymbolCounter::new();
        c.on_message(&add("AAPL", Side::Buy, 10.0));
        c.on_message(&add("AAPL", Side::Sell, 11.0));
        c.on_message(&add("MSFT", Side::Buy, 20.0));
        c.on_message(&WireMessage::new(MessageType::Trade, "MSFT").with_order(2, Side::Sell, 5, 21.0));

        assert_eq!(c.messages(), 4);
        assert_eq!((c.buys(), c.sells()), (2, 2));
        assert_eq!(c.add_orders("AAPL"), 2);
        assert_eq!(c.add_orders("MSFT"), 1);
        assert_eq!(c.add_orders("GOOG"), 0);
        assert_eq!(c.last_price("AAPL"), Some(11.0));
        assert_eq!(c.last_price("MSFT"), Some(21.0));

        let report = c.report();
        assert_eq!(report.symbols.keys().collect::<Vec<_>>(), ["AAPL", "MSFT"]);
    }

    #[test]
    fn mean_reversion_holds_until_window_fills() {
        let mut s = MeanReversion::new(3);
        assert_eq!(s.on_price(10.0), Signal::Hold);
        assert_eq!(s.on_price(10.0), Signal::Hold);
        assert_eq!(s.moving_average(), None);
        assert_eq!(s.on_price(10.0), Signal::Hold);
        assert_eq!(s.moving_average(), Some(10.0));
        // window 10,10,7 -> avg 9, 7 < 9
        assert_eq!(s.on_price(7.0), Signal::Buy);
        // window 10,7,13 -> avg 10, 13 > 10
        assert_eq!(s.on_price(13.0), Signal::Sell);
    }

    #[test]
    fn mean_reversion_counts_signals_as_handler() {
        let mut s = MeanReversion::new(2);
        for p in [5.0, 5.0, 4.0, 6.0] {
            s.on_message(&add("AAPL", Side::Buy, p));
        }
        assert_eq!(s.signal_counts(), (1, 1, 2));
    }
}
