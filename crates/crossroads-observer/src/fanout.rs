//! Streaming fan-out: one snapshot in, one bounded queue push per client.
//!
//! The fan-out is the pacer's [`SnapshotSink`]. Each tick it serializes
//! the snapshot at most once per stream mode and offers the payload to
//! every client queue with `try_send`, so a slow consumer only ever loses
//! its own updates:
//!
//! - a full queue drops that update for that client;
//! - a closed queue removes the subscription;
//! - a snapshot no newer than the client's last delivered one is skipped.
//!
//! Pause notices are driven by pause gate transitions, not ticks. Each
//! client gets at most one notice per close of the gate, keyed by the
//! gate's pause counter so two pauses merged into one watch update still
//! produce two notices.
//!
//! A new session resets delivery state: simulation time restarts, so the
//! last delivered time of the previous session must not suppress it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use axum::extract::ws::Utf8Bytes;
use crossroads_core::gate::PauseGate;
use crossroads_core::pacer::{SnapshotSink, TickUpdate};
use crossroads_core::status::StatusBoard;
use crossroads_types::{SessionId, Snapshot, StreamMessage, StreamMode, SubscriptionId};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A serialized [`StreamMessage`], shared by every client in the same mode.
pub type Payload = Utf8Bytes;

/// Receiving end of one client subscription.
#[derive(Debug)]
pub struct Subscription {
    /// Handle used to unsubscribe.
    pub id: SubscriptionId,
    /// Mode fixed at subscribe time.
    pub mode: StreamMode,
    /// Serialized updates for this client.
    pub updates: mpsc::Receiver<Payload>,
}

#[derive(Debug)]
struct ClientSlot {
    mode: StreamMode,
    tx: mpsc::Sender<Payload>,
    last_delivered: Option<f64>,
    notified_pause: Option<u64>,
}

/// The set of live streaming clients.
#[derive(Debug)]
pub struct FanOut {
    clients: Mutex<HashMap<SubscriptionId, ClientSlot>>,
    last: Mutex<Option<Arc<Snapshot>>>,
    buffer: usize,
    dropped: AtomicU64,
    gate: Arc<PauseGate>,
    status: Arc<StatusBoard>,
}

fn encode(message: &StreamMessage) -> Option<Payload> {
    match serde_json::to_string(message) {
        Ok(json) => Some(Utf8Bytes::from(json)),
        Err(e) => {
            warn!(error = %e, "failed to serialize stream message");
            None
        }
    }
}

impl FanOut {
    /// Fan-out with `buffer` queued updates per client.
    pub fn new(buffer: usize, gate: Arc<PauseGate>, status: Arc<StatusBoard>) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            last: Mutex::new(None),
            buffer: buffer.max(1),
            dropped: AtomicU64::new(0),
            gate,
            status,
        }
    }

    fn clients(&self) -> MutexGuard<'_, HashMap<SubscriptionId, ClientSlot>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn last_snapshot(&self) -> Option<Arc<Snapshot>> {
        self.last.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn pause_notice(&self) -> Option<Payload> {
        let last = self.last_snapshot();
        encode(&StreamMessage::notice(last.as_deref(), "paused", true))
    }

    /// Register a client. A client joining while paused immediately gets
    /// the pause notice for the current pause.
    pub fn subscribe(&self, mode: StreamMode) -> Subscription {
        let (tx, updates) = mpsc::channel(self.buffer);
        let id = SubscriptionId::new();
        let mut slot = ClientSlot {
            mode,
            tx,
            last_delivered: None,
            notified_pause: None,
        };
        if !self.gate.is_open() {
            if let Some(notice) = self.pause_notice()
                && let Err(e) = slot.tx.try_send(notice)
            {
                debug!(error = %e, "pause notice for new client not queued");
            }
            slot.notified_pause = Some(self.gate.pause_count());
        }

        let mut clients = self.clients();
        clients.insert(id, slot);
        info!(subscription = %id, ?mode, clients = clients.len(), "stream client subscribed");
        Subscription { id, mode, updates }
    }

    /// Remove a client. Returns whether it was still registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut clients = self.clients();
        let removed = clients.remove(&id).is_some();
        if removed {
            info!(subscription = %id, clients = clients.len(), "stream client unsubscribed");
        }
        removed
    }

    /// Live client count.
    pub fn client_count(&self) -> usize {
        self.clients().len()
    }

    /// Updates dropped on full client queues since startup.
    pub fn dropped_updates(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// React to a pause gate transition.
    ///
    /// While the gate is closed, sends one notice to every client not yet
    /// notified for the current pause. Opening needs no bookkeeping since
    /// the next close carries a fresh pause count.
    pub fn on_gate_change(&self, open: bool) {
        if open || self.gate.is_open() {
            debug!("pause gate opened, per-tick delivery resumes");
            return;
        }

        let pause = self.gate.pause_count();
        let Some(notice) = self.pause_notice() else {
            return;
        };
        let mut notified: usize = 0;
        self.clients().retain(|id, slot| {
            if slot.notified_pause == Some(pause) {
                return true;
            }
            slot.notified_pause = Some(pause);
            match slot.tx.try_send(notice.clone()) {
                Ok(()) => {
                    notified = notified.saturating_add(1);
                    true
                }
                Err(TrySendError::Full(_)) => {
                    debug!(subscription = %id, "client buffer full, pause notice dropped");
                    true
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(subscription = %id, "client gone, subscription removed");
                    false
                }
            }
        });
        debug!(notified, "pause notices sent");
    }

    /// Forward pause gate transitions to [`FanOut::on_gate_change`] until
    /// `shutdown` fires.
    pub fn watch_gate(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let mut rx = self.gate.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let open = *rx.borrow_and_update();
                        self.on_gate_change(open);
                    }
                }
            }
        })
    }
}

impl SnapshotSink for FanOut {
    fn on_session_start(&self, session_id: SessionId) {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = None;
        let mut clients = self.clients();
        for slot in clients.values_mut() {
            slot.last_delivered = None;
            slot.notified_pause = None;
        }
        debug!(session_id = %session_id, clients = clients.len(), "stream delivery state reset for new session");
    }

    fn on_snapshot(&self, update: &TickUpdate) {
        let snapshot = &update.snapshot;
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(snapshot));

        let mut clients = self.clients();
        if clients.is_empty() {
            return;
        }
        let paused = !self.gate.is_open();
        let message = self.status.current().message;
        let wants = |mode: StreamMode| clients.values().any(|c| c.mode == mode);
        let telemetry = if wants(StreamMode::Telemetry) {
            encode(&StreamMessage::for_mode(
                StreamMode::Telemetry,
                snapshot,
                None,
                &message,
                paused,
            ))
        } else {
            None
        };
        let observation = if wants(StreamMode::Observation) {
            encode(&StreamMessage::for_mode(
                StreamMode::Observation,
                snapshot,
                Some(update.observation.as_ref()),
                &message,
                paused,
            ))
        } else {
            None
        };

        let time = snapshot.simulation_time;
        clients.retain(|id, slot| {
            if slot.last_delivered.is_some_and(|last| time <= last) {
                return true;
            }
            let payload = match slot.mode {
                StreamMode::Telemetry => telemetry.as_ref(),
                StreamMode::Observation => observation.as_ref(),
            };
            let Some(payload) = payload else {
                return true;
            };
            match slot.tx.try_send(payload.clone()) {
                Ok(()) => {
                    slot.last_delivered = Some(time);
                    true
                }
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(subscription = %id, simulation_time = time, "client buffer full, update dropped");
                    true
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(subscription = %id, "client gone, subscription removed");
                    false
                }
            }
        });
    }
}
