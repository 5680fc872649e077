//! Bind-to-core capability.
//!
//! A core is an index into the CPUs this process may run on, as listed by
//! `core_affinity::get_core_ids`. In a container limited to cpus 4-7, core 0
//! is cpu 4 and core 3 is cpu 7. Validation and binding use the same list.
//!
//! Pinning goes through `core_affinity` (Linux cpusets, Windows affinity
//! masks, macOS affinity tags). When the platform refuses, the thread falls
//! back to a best-effort priority hint: the USER_INTERACTIVE QoS class on
//! Apple targets, a lower nice value on other Unix systems. Neither failure
//! is an error for the caller; the returned [`Placement`] says what happened.

use core_affinity::CoreId;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cpu core {core} is out of range ({available} cores available to this process)")]
pub struct InvalidCore {
    pub core: usize,
    pub available: usize,
}

/// Where the current thread ended up after a bind attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    /// Bound to allowed-set index `core`, which is OS cpu `cpu`.
    Pinned { core: usize, cpu: usize },
    /// Affinity unavailable, scheduling priority raised instead.
    Boosted,
    Unpinned,
}

fn core_ids() -> Vec<CoreId> {
    core_affinity::get_core_ids().unwrap_or_default()
}

pub fn available_cores() -> usize {
    Some(core_ids().len())
        .filter(|&n| n > 0)
        .or_else(|| std::thread::available_parallelism().ok().map(|n| n.get()))
        .unwrap_or(1)
}

/// Reject core indices the process does not have. `None` always passes.
pub fn check_core(core: Option<usize>) -> Result<(), InvalidCore> {
    match core {
        Some(core) => {
            let available = available_cores();
            if core < available { Ok(()) } else { Err(InvalidCore { core, available }) }
        }
        None => Ok(()),
    }
}

/// OS cpu behind allowed-set index `core`.
fn resolve(ids: &[CoreId], core: usize) -> Option<CoreId> {
    ids.get(core).copied()
}

/// Bind the calling thread to `core`, falling back to a priority hint.
pub fn bind_current_thread(core: usize) -> Placement {
    if let Some(id) = resolve(&core_ids(), core) {
        if core_affinity::set_for_current(id) {
            info!(core, cpu = id.id, "thread pinned");
            return Placement::Pinned { core, cpu: id.id };
        }
    }
    if boost_priority() {
        warn!(core, "cpu affinity unavailable, raised thread priority instead");
        Placement::Boosted
    } else {
        warn!(core, "cpu affinity and priority hint both unavailable, running unpinned");
        Placement::Unpinned
    }
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
fn boost_priority() -> bool {
    // SAFETY: only changes the QoS class of the calling thread.
    unsafe {
        libc::pthread_set_qos_class_self_np(libc::qos_class_t::QOS_CLASS_USER_INTERACTIVE, 0) == 0
    }
}

#[cfg(all(unix, not(any(target_os = "macos", target_os = "ios"))))]
fn boost_priority() -> bool {
    // Linux applies PRIO_PROCESS/0 to the calling thread. Needs CAP_SYS_NICE.
    // SAFETY: plain syscall wrapper, no pointers involved.
    unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, -10) == 0 }
}

#[cfg(not(unix))]
fn boost_priority() -> bool {
    false
}
