//! `EventDispatcher`: correlates framed messages back to pending waiters by
//! ActionID, assembles multi-message EventLists, and forwards everything
//! else to the connection-level subscriber fanout.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::error::{AmiError, Result};
use crate::reaction::Reaction;
use crate::record::{KeyValRecord, is_list_terminal, is_success_response};

/// What a waiter is ultimately fulfilled with.
#[derive(Debug)]
pub enum WaiterOutcome {
    Reaction(Reaction),
    /// The dispatcher shut down with this waiter still outstanding.
    Closed,
    /// `invoke_with_timeout` gave up waiting before a response arrived.
    Timeout(Duration),
}

/// The waiters map and the partials map are always accessed together in
/// the source (`scoped_lock(promise_map_mutex_, event_map_mutex_)` at
/// every call site), so this port collapses them into one lock guarding
/// one struct rather than two locks with a fixed acquisition order —
/// the same guarantee, with no ordering discipline to get wrong.
#[derive(Default)]
struct DispatchState {
    waiters: HashMap<String, oneshot::Sender<WaiterOutcome>>,
    partials: HashMap<String, (KeyValRecord, Vec<KeyValRecord>)>,
}

enum DispatchOutcome {
    Unsolicited(KeyValRecord),
    Fulfill(oneshot::Sender<WaiterOutcome>, WaiterOutcome),
    Pending,
}

pub struct EventDispatcher {
    state: std::sync::Arc<Mutex<DispatchState>>,
    inbox_tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl EventDispatcher {
    pub fn spawn<F>(on_unsolicited: F) -> Self
    where
        F: Fn(KeyValRecord) + Send + Sync + 'static,
    {
        let state = std::sync::Arc::new(Mutex::new(DispatchState::default()));
        let (inbox_tx, mut inbox_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let worker_state = state.clone();
        let worker = tokio::spawn(
            async move {
                while let Some(raw) = inbox_rx.recv().await {
                    Self::dispatch_one(&worker_state, raw, &on_unsolicited);
                }
                // Drained; close out every waiter still outstanding so no
                // caller is left blocked forever.
                let mut guard = worker_state.lock().unwrap();
                for (_, tx) in guard.waiters.drain() {
                    let _ = tx.send(WaiterOutcome::Closed);
                }
                guard.partials.clear();
            }
            .instrument(tracing::info_span!("ami_dispatcher")),
        );

        Self {
            state,
            inbox_tx: Mutex::new(Some(inbox_tx)),
            worker: tokio::sync::Mutex::new(Some(worker)),
        }
    }

    /// Queue a framed message for dispatch. Non-blocking.
    pub fn ingest(&self, message: Vec<u8>) {
        if let Some(tx) = self.inbox_tx.lock().unwrap().as_ref() {
            let _ = tx.send(message);
        }
    }

    /// Register a waiter for `action_id`. Registration MUST happen before
    /// the corresponding action is written to the socket, so the response
    /// can never race ahead of the waiter.
    pub fn open_waiter(&self, action_id: &str) -> Result<oneshot::Receiver<WaiterOutcome>> {
        let mut guard = self.state.lock().unwrap();
        if guard.waiters.contains_key(action_id) {
            return Err(AmiError::DuplicateActionId(action_id.to_owned()));
        }
        let (tx, rx) = oneshot::channel();
        guard.waiters.insert(action_id.to_owned(), tx);
        Ok(rx)
    }

    /// Fulfill `action_id`'s waiter (if still live) with `outcome`, and
    /// drop any in-progress partial EventList for it.
    pub fn fail_waiter(&self, action_id: &str, outcome: WaiterOutcome) {
        let mut guard = self.state.lock().unwrap();
        guard.partials.remove(action_id);
        if let Some(tx) = guard.waiters.remove(action_id) {
            let _ = tx.send(outcome);
        }
    }

    pub fn close_waiter(&self, action_id: &str) {
        self.fail_waiter(action_id, WaiterOutcome::Closed);
    }

    /// Stop accepting new messages and wait for the worker to drain
    /// whatever is already queued, closing any remaining waiters.
    pub async fn shutdown(&self) {
        self.inbox_tx.lock().unwrap().take();
        if let Some(worker) = self.worker.lock().await.take() {
            let _ = worker.await;
        }
    }

    fn dispatch_one(
        state: &Mutex<DispatchState>,
        raw: Vec<u8>,
        on_unsolicited: &(impl Fn(KeyValRecord) + Send + Sync),
    ) {
        let text = String::from_utf8_lossy(&raw);
        let record = KeyValRecord::parse(&text);
        if record.is_empty() {
            tracing::warn!(bytes = raw.len(), "dropping malformed record with no fields");
            return;
        }
        let action_id = record.get("ActionID").map(str::to_owned);

        let outcome = {
            let mut guard = state.lock().unwrap();
            match action_id.as_deref() {
                None => DispatchOutcome::Unsolicited(record),
                Some(id) if !guard.waiters.contains_key(id) => {
                    tracing::warn!(
                        action_id = id,
                        "no waiter registered for ActionID (timed out or never invoked); routing to unsolicited"
                    );
                    DispatchOutcome::Unsolicited(record)
                }
                Some(id) => Self::dispatch_correlated(&mut guard, id, record),
            }
        };

        match outcome {
            DispatchOutcome::Unsolicited(record) => {
                tracing::debug!(action_id = ?record.get("ActionID"), "dispatching record to unsolicited subscribers");
                on_unsolicited(record);
            }
            DispatchOutcome::Fulfill(tx, outcome) => {
                tracing::debug!(?outcome, "fulfilling waiter");
                let _ = tx.send(outcome);
            }
            DispatchOutcome::Pending => {
                tracing::debug!("partial EventList updated, waiter still pending");
            }
        }
    }

    fn dispatch_correlated(
        guard: &mut DispatchState,
        action_id: &str,
        record: KeyValRecord,
    ) -> DispatchOutcome {
        if guard.partials.contains_key(action_id) {
            // Case E/F: a partial EventList is already underway.
            let is_tail = record.get("EventList").is_some_and(is_list_terminal);
            if is_tail {
                let (head, middles) = guard.partials.remove(action_id).expect("checked above");
                let tx = guard.waiters.remove(action_id).expect("checked above");
                return DispatchOutcome::Fulfill(
                    tx,
                    WaiterOutcome::Reaction(Reaction::EventList {
                        head,
                        middles,
                        tail: Some(record),
                    }),
                );
            }
            guard
                .partials
                .get_mut(action_id)
                .expect("checked above")
                .1
                .push(record);
            return DispatchOutcome::Pending;
        }

        match record.get("EventList") {
            // Case B: a plain single-record response.
            None => {
                let tx = guard.waiters.remove(action_id).expect("checked above");
                DispatchOutcome::Fulfill(tx, WaiterOutcome::Reaction(Reaction::Single(record)))
            }
            // Case C: a successful EventList head — start a partial.
            Some(_) if is_success_response(&record) => {
                guard
                    .partials
                    .insert(action_id.to_owned(), (record, Vec::new()));
                DispatchOutcome::Pending
            }
            // Case D: a non-success EventList head completes immediately.
            Some(_) => {
                let tx = guard.waiters.remove(action_id).expect("checked above");
                DispatchOutcome::Fulfill(
                    tx,
                    WaiterOutcome::Reaction(Reaction::EventList {
                        head: record,
                        middles: Vec::new(),
                        tail: None,
                    }),
                )
            }
        }
    }
}
