//! Per-process lifecycle records.
//!
//! A record's state only moves forward: `Starting → Running → Stopping →
//! Destroyed`, with the crash shortcut `Running → Destroyed`. Transitions
//! are idempotent. Records carry a generation so a handle kept across a
//! restart can detect it no longer is the registered record for its name.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use tokio::sync::watch;

use crate::supervisor::backend::BackendKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProcState {
    Starting,
    Running,
    Stopping,
    Destroyed,
}

#[derive(Debug)]
pub struct ProcessRecord {
    pub name: String,
    pub generation: u64,
    pub backend: BackendKind,
    pid: AtomicU32,
    state: watch::Sender<ProcState>,
    stopping: AtomicBool,
}

impl ProcessRecord {
    pub fn new(name: impl Into<String>, generation: u64, backend: BackendKind) -> Self {
        Self {
            name: name.into(),
            generation,
            backend,
            pid: AtomicU32::new(0),
            state: watch::channel(ProcState::Starting).0,
            stopping: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> ProcState {
        *self.state.borrow()
    }

    pub fn pid(&self) -> u32 {
        self.pid.load(Ordering::Acquire)
    }

    pub fn set_pid(&self, pid: u32) {
        self.pid.store(pid, Ordering::Release);
    }

    /// Move the state machine forward. Returns `true` when the state
    /// changed; a repeat or backward transition is a no-op.
    pub fn advance(&self, to: ProcState) -> bool {
        self.state.send_if_modified(|state| {
            if to > *state {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    /// Claim the one shutdown request for this record. Only the first
    /// caller gets `true`; concurrent stops just wait for destruction.
    pub fn begin_stopping(&self) -> bool {
        !self.stopping.swap(true, Ordering::AcqRel)
    }

    /// Wait until this record reaches `Destroyed`.
    pub async fn await_destroyed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state == ProcState::Destroyed).await;
    }
}
