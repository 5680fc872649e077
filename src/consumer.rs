//! Pinned busy-poll consumer draining the ring into a handler.

use tracing::debug;

use crate::affinity::Placement;
use crate::executor::{ExecutorError, PinnedExecutor, StopToken, cpu_relax};
use crate::ring::{Consumer, RingMonitor};

/// Receives each message popped off the ring, in FIFO order.
pub trait MessageHandler<T>: Send + 'static {
    fn on_message(&mut self, msg: &T);
}

impl<T, F> MessageHandler<T> for F
where
    F: FnMut(&T) + Send + 'static,
{
    #[inline]
    fn on_message(&mut self, msg: &T) {
        self(msg)
    }
}

/// Runs a handler for every message popped from the ring on its own thread.
/// Never blocks; an empty ring costs one pause hint.
pub struct RingConsumer<T, H> {
    monitor: RingMonitor<T>,
    executor: PinnedExecutor<H>,
}

impl<T, H> RingConsumer<T, H>
where
    T: Send + 'static,
    H: MessageHandler<T>,
{
    pub fn spawn(consumer: Consumer<T>, core: Option<usize>, handler: H) -> Result<Self, ExecutorError> {
        Self::spawn_with_token(consumer, core, StopToken::new(), handler)
    }

    pub fn spawn_with_token(
        mut consumer: Consumer<T>,
        core: Option<usize>,
        token: StopToken,
        mut handler: H,
    ) -> Result<Self, ExecutorError> {
        let monitor = consumer.monitor();
        let executor = PinnedExecutor::spawn_with_token("ring-consumer", core, token, move |stop| {
            let mut handled = 0u64;
            while !stop.is_stopped() {
                match consumer.try_pop() {
                    Some(item) => {
                        handler.on_message(&item);
                        handled += 1;
                    }
                    None => cpu_relax(),
                }
            }
            debug!(handled, "ring consumer exiting");
            Ok(handler)
        })?;
        Ok(Self { monitor, executor })
    }

    pub fn monitor(&self) -> &RingMonitor<T> {
        &self.monitor
    }

    pub fn is_finished(&self) -> bool {
        self.executor.is_finished()
    }

    pub fn placement(&self) -> Option<Placement> {
        self.executor.placement()
    }

    /// Stop polling and hand the handler, with whatever it accumulated, back.
    /// Messages still in the ring stay there. `None` if the handler panicked.
    pub fn stop(mut self) -> Option<H> {
        self.executor.stop().and_then(|exit| exit.completed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::SpScRingBuffer;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct Collect(Vec<u64>);

    impl MessageHandler<u64> for Collect {
        fn on_message(&mut self, msg: &u64) {
            self.0.push(*msg);
        }
    }

    fn wait_for_popped<T>(monitor: &RingMonitor<T>, n: u64) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while monitor.popped() < n && Instant::now() < deadline {
            std::thread::yield_now();
        }
    }

    #[test]
    fn drains_in_fifo_order() {
        let (mut producer, consumer) = SpScRingBuffer::<u64>::with_capacity(64).unwrap().split();
        let rc = RingConsumer::spawn(consumer, None, Collect::default()).unwrap();

        let mut refused = 0u64;
        for i in 0..10_000u64 {
            let mut item = i;
            while let Err(back) = producer.try_push(item) {
                item = back;
                refused += 1;
                std::thread::yield_now();
            }
        }
        wait_for_popped(rc.monitor(), 10_000);
        let collected = rc.stop().unwrap();
        assert_eq!(collected.0, (0..10_000).collect::<Vec<_>>());
        assert_eq!(producer.popped(), 10_000);
        // Every refused push is a drop, even when the caller retries it.
        assert_eq!(producer.dropped(), refused);
    }

    #[test]
    fn closures_are_handlers() {
        let (mut producer, consumer) = SpScRingBuffer::<u64>::with_capacity(8).unwrap().split();
        let mut total = 0u64;
        let rc = RingConsumer::spawn(consumer, Some(0), move |v: &u64| total += *v).unwrap();
        for v in [1u64, 2, 3] {
            producer.try_push(v).unwrap();
        }
        wait_for_popped(rc.monitor(), 3);
        assert!(producer.is_empty());
        assert!(rc.stop().is_some());
    }

    #[test]
    fn panicking_handler_yields_none() {
        let (mut producer, consumer) = SpScRingBuffer::<u64>::with_capacity(8).unwrap().split();
        let rc = RingConsumer::spawn(consumer, None, |v: &u64| {
            if *v > 0 {
                panic!("bad handler");
            }
        })
        .unwrap();
        producer.try_push(1).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !rc.is_finished() && Instant::now() < deadline {
            std::thread::yield_now();
        }
        assert!(rc.stop().is_none());
    }
}
