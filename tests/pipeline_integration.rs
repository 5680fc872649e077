use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::thread;
use std::time::{Duration, Instant};

use hft_feed::capture::{self, CapturedMessage};
use hft_feed::consumer::{MessageHandler, RingConsumer};
use hft_feed::generator::{self, GeneratorConfig};
use hft_feed::listener::{ListenerConfig, UdpListener};
use hft_feed::message::{MessageType, Side, WireMessage};
use hft_feed::replayer::{ReplayConfig, UdpReplayer};
use hft_feed::ring::SpScRingBuffer;
use hft_feed::strategy::SymbolCounter;

fn loopback_listener() -> ListenerConfig {
    ListenerConfig { bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST), port: 0, core: None }
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}

/// Counts per symbol and remembers the arrival order.
#[derive(Default)]
struct Tally {
    counter: SymbolCounter,
    sequences: Vec<u64>,
}

impl MessageHandler<WireMessage> for Tally {
    fn on_message(&mut self, msg: &WireMessage) {
        self.counter.on_message(msg);
        self.sequences.push(msg.sequence_number);
    }
}

fn add_order(sym: &str, seq: u64) -> WireMessage {
    WireMessage::new(MessageType::AddOrder, sym)
        .with_order(seq, Side::Buy, 100, 150.25)
        .with_sequence(seq, seq * 1_000)
}

#[test]
fn ring_of_four_keeps_order_and_refuses_overflow() {
    let mut ring = SpScRingBuffer::<WireMessage>::with_capacity(4).unwrap();
    for (i, sym) in ["AAPL", "GOOG", "MSFT"].into_iter().enumerate() {
        ring.try_push(add_order(sym, i as u64 + 1)).unwrap();
    }
    assert!(ring.is_full());
    assert!(ring.try_push(add_order("IBM", 4)).is_err());
    assert_eq!(ring.dropped(), 1);
    assert_eq!(ring.high_water_mark(), 3);

    let popped: Vec<String> =
        std::iter::from_fn(|| ring.try_pop()).map(|m| m.symbol_str().into_owned()).collect();
    assert_eq!(popped, ["AAPL", "GOOG", "MSFT"]);
    assert!(ring.try_pop().is_none());
    assert_eq!(ring.popped(), 3);
}

#[test]
fn single_datagram_becomes_single_push() {
    let (producer, mut consumer) = SpScRingBuffer::<WireMessage>::with_capacity(16).unwrap().split();
    let mut listener = UdpListener::new(loopback_listener(), producer).unwrap();
    listener.start().unwrap();
    let addr = listener.local_addr().unwrap();

    let tx = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let sent = add_order("AAPL", 42);
    tx.send_to(&sent.encode(), addr).unwrap();

    assert!(wait_until(Duration::from_secs(5), || consumer.pushed() == 1));
    listener.stop();
    let got = consumer.try_pop().unwrap();
    assert_eq!(got.sequence_number, 42);
    assert_eq!(got.symbol_str(), "AAPL");
    assert_eq!(got.price, 150.25);
    assert_eq!(listener.stats().snapshot().delivered, 1);
}

#[test]
fn replayer_to_listener_to_strategy() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.cap");
    let config = GeneratorConfig { seed: 11, count: 300, max_gap_ns: 20_000, ..GeneratorConfig::default() };
    generator::generate_to_file(&path, &config).unwrap();
    let expected = capture::load_capture(&path).unwrap();

    let (producer, consumer) = SpScRingBuffer::<WireMessage>::with_capacity(1024).unwrap().split();
    let ring = consumer.monitor();
    let strategy = RingConsumer::spawn(consumer, None, Tally::default()).unwrap();
    let mut listener = UdpListener::new(loopback_listener(), producer).unwrap();
    listener.start().unwrap();
    let dest = listener.local_addr().unwrap();

    let mut replayer = UdpReplayer::load(&path, ReplayConfig::new(dest).with_speed(2.0)).unwrap();
    replayer.start().unwrap();
    let report = replayer.wait().unwrap();
    assert!(report.completed);
    assert_eq!(report.sent, 300);

    let stats = listener.stats();
    // Loopback UDP is not guaranteed lossless; everything that arrived must
    // make it through the ring.
    wait_until(Duration::from_secs(5), || stats.snapshot().datagrams == 300);
    listener.stop();
    let delivered = stats.snapshot().delivered;
    assert!(delivered > 0);
    assert_eq!(stats.snapshot().malformed, 0);
    assert!(wait_until(Duration::from_secs(5), || ring.popped() == delivered));

    let tally = strategy.stop().unwrap();
    assert_eq!(tally.counter.messages(), delivered);
    assert_eq!(tally.sequences.len() as u64, delivered);

    // Whatever was lost, what arrived is an in-order subset of the capture.
    let mut remaining = expected.iter();
    for &seq in &tally.sequences {
        assert!(
            remaining.any(|r| r.msg.sequence_number == seq),
            "sequence {seq} out of order or not in the capture"
        );
    }
    for sym in ["AAPL", "GOOG", "MSFT"] {
        let want = expected.iter().filter(|r| r.msg.symbol_str() == sym).count() as u64;
        let got = tally.counter.add_orders(sym);
        assert!(got <= want, "{sym}: {got} > {want}");
        if delivered == 300 {
            assert_eq!(got, want, "{sym}");
        }
    }
    let got_total: u64 = ["AAPL", "GOOG", "MSFT"].iter().map(|s| tally.counter.add_orders(s)).sum();
    assert_eq!(got_total, delivered);
}

#[test]
fn replay_pacing_respects_speed_factor() {
    let rx = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let dest: SocketAddr = rx.local_addr().unwrap();
    let records: Vec<CapturedMessage> =
        (0..3u64).map(|i| CapturedMessage::new(i * 1_000_000, add_order("MSFT", i + 1))).collect();

    for (speed, gap_ns) in [(1.0, 1_000_000u64), (2.0, 500_000u64)] {
        let mut replayer =
            UdpReplayer::from_records(records.clone(), ReplayConfig::new(dest).with_speed(speed)).unwrap();
        replayer.start().unwrap();
        let report = replayer.wait().unwrap();
        for (i, &offset) in report.send_offsets_ns.iter().enumerate() {
            assert!(offset >= i as u64 * gap_ns, "message {i} sent early at {offset}ns (speed {speed})");
        }
    }
}

#[test]
fn corrupt_capture_is_rejected_with_index() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.cap");
    let mut records: Vec<CapturedMessage> =
        (0..5u64).map(|i| CapturedMessage::new(i, add_order("GOOG", i + 1))).collect();
    records[3].msg.size = 0;
    capture::write_capture(&path, &records).unwrap();

    let dest: SocketAddr = "127.0.0.1:9".parse().unwrap();
    match UdpReplayer::load(&path, ReplayConfig::new(dest)) {
        Err(hft_feed::replayer::ReplayError::Capture(capture::CaptureError::InvalidRecord { index, .. })) => {
            assert_eq!(index, 3)
        }
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("corrupt capture accepted"),
    }
}
