//! The pause gate shared by the step pacer, direct stepping, and the
//! streaming fan-out.
//!
//! The gate only means running-versus-paused. Stopping is tracked by the
//! session state and a [`CancellationToken`]; a cancelled token releases
//! any waiter immediately.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Returned by [`PauseGate::wait_until_open`] when the wait was abandoned
/// because a stop was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("wait cancelled by stop request")]
pub struct Cancelled;

/// Binary run/pause signal. Initially open.
///
/// Every open-to-closed transition bumps a pause counter, so observers
/// that only see the latest watch value can still tell one pause from
/// the next.
#[derive(Debug)]
pub struct PauseGate {
    open: watch::Sender<bool>,
    pauses: AtomicU64,
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseGate {
    /// Create an open gate.
    pub fn new() -> Self {
        Self {
            open: watch::Sender::new(true),
            pauses: AtomicU64::new(0),
        }
    }

    /// Non-blocking query.
    pub fn is_open(&self) -> bool {
        *self.open.borrow()
    }

    /// Close the gate. Returns `true` if this call changed the state.
    pub fn set_closed(&self) -> bool {
        self.set(false)
    }

    /// Open the gate and wake every waiter. Returns `true` if this call
    /// changed the state.
    pub fn set_open(&self) -> bool {
        self.set(true)
    }

    /// Flip the gate. Returns the new open state.
    pub fn toggle(&self) -> bool {
        let mut now_open = false;
        self.open.send_modify(|open| {
            *open = !*open;
            now_open = *open;
            if !now_open {
                self.pauses.fetch_add(1, Ordering::AcqRel);
            }
        });
        now_open
    }

    /// Number of times the gate has closed. Read together with
    /// [`PauseGate::is_open`] it identifies the current pause.
    pub fn pause_count(&self) -> u64 {
        self.pauses.load(Ordering::Acquire)
    }

    fn set(&self, value: bool) -> bool {
        self.open.send_if_modified(|open| {
            if *open == value {
                false
            } else {
                *open = value;
                if !value {
                    self.pauses.fetch_add(1, Ordering::AcqRel);
                }
                true
            }
        })
    }

    /// Watch transitions. The receiver sees `true` for open.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.open.subscribe()
    }

    /// Suspend until the gate is open or `cancel` fires.
    ///
    /// Returns immediately when already open. Cancellation wins over an
    /// open gate so a stopping loop never runs one more tick.
    pub async fn wait_until_open(&self, cancel: &CancellationToken) -> Result<(), Cancelled> {
        if cancel.is_cancelled() {
            return Err(Cancelled);
        }
        let mut rx = self.open.subscribe();
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Cancelled),
            opened = rx.wait_for(|open| *open) => opened.map(|_| ()).map_err(|_closed| Cancelled),
        }
    }
}
