//! Pinned-thread execution: one OS thread per hot-path actor.
//!
//! A [`PinnedExecutor`] owns exactly one thread. The thread binds itself to
//! the requested core, runs the work closure with a [`StopToken`], and
//! converts errors and panics escaping the closure into a [`WorkerExit`]
//! instead of tearing the process down. Dropping the executor stops and
//! joins the thread.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use once_cell::sync::OnceCell;
use thiserror::Error;
use tracing::{debug, error};

use crate::affinity::{self, InvalidCore, Placement};

/// Cooperative cancellation flag, observed once per loop iteration.
#[derive(Debug, Clone, Default)]
pub struct StopToken(Arc<AtomicBool>);

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn stop(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// CPU pause hint for spin loops (`PAUSE` on x86, `YIELD`/`ISB` on ARM).
#[inline(always)]
pub fn cpu_relax() {
    std::hint::spin_loop();
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error(transparent)]
    InvalidCore(#[from] InvalidCore),
    #[error("failed to spawn thread {name}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// How the work closure ended.
#[derive(Debug)]
pub enum WorkerExit<R> {
    Completed(R),
    Failed(anyhow::Error),
    Panicked(String),
}

impl<R> WorkerExit<R> {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    pub fn completed(self) -> Option<R> {
        match self {
            Self::Completed(v) => Some(v),
            _ => None,
        }
    }
}

pub struct PinnedExecutor<R = ()> {
    name: String,
    core: Option<usize>,
    token: StopToken,
    placement: Arc<OnceCell<Placement>>,
    handle: Option<JoinHandle<WorkerExit<R>>>,
}

impl<R: Send + 'static> PinnedExecutor<R> {
    /// Start `work` on a new thread pinned to `core` (`None` = no pinning).
    pub fn spawn<F>(name: impl Into<String>, core: Option<usize>, work: F) -> Result<Self, ExecutorError>
    where
        F: FnOnce(&StopToken) -> anyhow::Result<R> + Send + 'static,
    {
        Self::spawn_with_token(name, core, StopToken::new(), work)
    }

    /// Like [`spawn`](Self::spawn) but observing a caller-supplied token, so
    /// several actors can share one shutdown signal.
    pub fn spawn_with_token<F>(
        name: impl Into<String>,
        core: Option<usize>,
        token: StopToken,
        work: F,
    ) -> Result<Self, ExecutorError>
    where
        F: FnOnce(&StopToken) -> anyhow::Result<R> + Send + 'static,
    {
        let name = name.into();
        affinity::check_core(core)?;

        let thread_token = token.clone();
        let thread_name = name.clone();
        let placement = Arc::new(OnceCell::new());
        let thread_placement = Arc::clone(&placement);
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let placed = match core {
                    Some(core) => affinity::bind_current_thread(core),
                    None => Placement::Unpinned,
                };
                let _ = thread_placement.set(placed);
                match panic::catch_unwind(AssertUnwindSafe(|| work(&thread_token))) {
                    Ok(Ok(value)) => {
                        debug!(thread = %thread_name, "pinned worker finished");
                        WorkerExit::Completed(value)
                    }
                    Ok(Err(e)) => {
                        error!(thread = %thread_name, "pinned worker failed: {e:#}");
                        WorkerExit::Failed(e)
                    }
                    Err(payload) => {
                        let msg = panic_message(payload.as_ref());
                        error!(thread = %thread_name, "pinned worker panicked: {msg}");
                        WorkerExit::Panicked(msg)
                    }
                }
            })
            .map_err(|source| ExecutorError::Spawn { name: name.clone(), source })?;

        Ok(Self { name, core, token, placement, handle: Some(handle) })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn core(&self) -> Option<usize> {
        self.core
    }

    pub fn token(&self) -> &StopToken {
        &self.token
    }

    /// Where the worker thread landed. `None` until the thread has bound
    /// itself, which happens before the work closure runs.
    pub fn placement(&self) -> Option<Placement> {
        self.placement.get().copied()
    }

    /// True once the work closure has returned (or the thread was joined).
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }

    /// Signal the worker and block until it exits. `None` if already joined.
    pub fn stop(&mut self) -> Option<WorkerExit<R>> {
        self.token.stop();
        self.join()
    }

    /// Wait for the worker to return on its own.
    pub fn join(&mut self) -> Option<WorkerExit<R>> {
        let handle = self.handle.take()?;
        Some(match handle.join() {
            Ok(exit) => exit,
            Err(payload) => WorkerExit::Panicked(panic_message(payload.as_ref())),
        })
    }
}

impl<R> Drop for PinnedExecutor<R> {
    fn drop(&mut self) {
        self.token.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::time::{Duration, Instant};

    #[test]
    fn stop_joins_a_spinning_worker() {
        let iterations = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&iterations);
        let mut exec = PinnedExecutor::spawn("spin", None, move |stop| {
            while !stop.is_stopped() {
                seen.fetch_add(1, Ordering::Relaxed);
                cpu_relax();
            }
            Ok(seen.load(Ordering::Relaxed))
        })
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while iterations.load(Ordering::Relaxed) == 0 && Instant::now() < deadline {
            thread::yield_now();
        }
        let exit = exec.stop().unwrap();
        assert!(exit.completed().unwrap() > 0);
        assert!(exec.is_finished());
        assert!(exec.stop().is_none());
    }

    #[test]
    fn pinned_to_core_zero_runs() {
        let mut exec = PinnedExecutor::spawn("core0", Some(0), |_| Ok(7u32)).unwrap();
        assert_eq!(exec.join().unwrap().completed(), Some(7));
        assert_eq!(exec.core(), Some(0));
        match exec.placement() {
            Some(Placement::Pinned { core, .. }) => assert_eq!(core, 0),
            Some(Placement::Boosted | Placement::Unpinned) => {}
            None => panic!("placement not recorded before the work ran"),
        }
    }

    #[test]
    fn placement_is_known_once_work_starts() {
        let mut exec = PinnedExecutor::spawn("free", None, |_| Ok(())).unwrap();
        exec.join().unwrap();
        assert_eq!(exec.placement(), Some(Placement::Unpinned));
    }

    #[test]
    fn invalid_core_is_a_startup_error() {
        let too_big = affinity::available_cores() + 1;
        let err = PinnedExecutor::spawn("bad", Some(too_big), |_| Ok(())).err().unwrap();
        assert!(matches!(err, ExecutorError::InvalidCore(InvalidCore { core, .. }) if core == too_big));
    }

    #[test]
    fn panics_are_contained() {
        let mut exec = PinnedExecutor::spawn("boom", None, |_| -> anyhow::Result<()> { panic!("kaboom") })
            .unwrap();
        match exec.join().unwrap() {
            WorkerExit::Panicked(msg) => assert!(msg.contains("kaboom")),
            other => panic!("unexpected exit {other:?}"),
        }
    }

    #[test]
    fn errors_are_reported() {
        let mut exec =
            PinnedExecutor::<()>::spawn("fail", None, |_| Err(anyhow::anyhow!("socket gone"))).unwrap();
        match exec.join().unwrap() {
            WorkerExit::Failed(e) => assert!(e.to_string().contains("socket gone")),
            other => panic!("unexpected exit {other:?}"),
        }
    }

    #[test]
    fn shared_token_stops_every_worker() {
        let token = StopToken::new();
        let spawn = |name: &str| {
            PinnedExecutor::spawn_with_token(name, None, token.clone(), |stop| {
                while !stop.is_stopped() {
                    thread::sleep(Duration::from_millis(1));
                }
                Ok(())
            })
            .unwrap()
        };
        let mut a = spawn("a");
        let mut b = spawn("b");
        token.stop();
        assert!(a.join().unwrap().is_completed());
        assert!(b.join().unwrap().is_completed());
    }

    #[test]
    fn drop_joins_the_thread() {
        let done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&done);
        let exec = PinnedExecutor::spawn("drop", None, move |stop| {
            while !stop.is_stopped() {
                cpu_relax();
            }
            flag.store(true, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
        drop(exec);
        assert!(done.load(Ordering::SeqCst));
    }
}
