//! State Store (C6): the single authoritative value described in
//! spec.md §3, mutated exclusively through [`crate::actions::Action`],
//! with change notifications coalesced into one snapshot per batch of
//! synchronous mutations (spec.md §4.6).

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, error};

use crate::actions::{reduce, Action, StoreSettings};
use crate::types::{ActiveSelection, AllowBlockLists, DeviceDetails, Session, ToolStatus, UiPreferencesCache};

/// The store's full value, as described in spec.md §3. Cloning produces
/// an independent snapshot: mutating the clone never affects the live
/// store (copy-on-read of top-level containers).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StoreState {
    pub sessions: Vec<Session>,
    pub active: ActiveSelection,
    pub device_details: HashMap<String, DeviceDetails>,
    pub ui_preferences: UiPreferencesCache,
    pub allow_block: AllowBlockLists,
    pub tool_status: ToolStatus,
    pub status_message: Option<String>,
    pub is_monitoring: bool,
    pub settings: StoreSettings,
}

impl StoreState {
    /// `device_details_stale` exposed at the store level so a caller's
    /// poll loop can decide when to re-run the property probe; the
    /// store itself never schedules timers.
    pub fn device_details_stale(&self, session_id: &str, now: std::time::Duration) -> bool {
        self.device_details
            .get(session_id)
            .map(|d| d.is_stale(now))
            .unwrap_or(true)
    }
}

type Listener = Box<dyn Fn(&StoreState) + Send + Sync>;

struct Subscription {
    id: u64,
    callback: Listener,
}

/// The three keys a host-supplied key/value store persists whenever the
/// corresponding collection changes (spec.md §6).
#[derive(Debug, Clone, PartialEq)]
pub enum PersistedKey {
    AllowList(Vec<String>),
    BlockList(Vec<String>),
    UiPreferencesCache(UiPreferencesCache),
}

/// Single authoritative store. Wrapped in `Arc` because subscribers and
/// the dispatch path both need shared, long-lived access; the dispatch
/// path itself never suspends, so the inner lock is a plain `Mutex`.
pub struct StateStore {
    state: Mutex<StoreState>,
    subscriptions: Mutex<Vec<Subscription>>,
    persist_sink: Mutex<Option<Box<dyn Fn(PersistedKey) + Send + Sync>>>,
    next_listener_id: AtomicU64,
    dirty: AtomicBool,
    flush_pending: AtomicBool,
}

impl StateStore {
    pub fn new() -> Arc<Self> {
        Arc::new(StateStore {
            state: Mutex::new(StoreState::default()),
            subscriptions: Mutex::new(Vec::new()),
            persist_sink: Mutex::new(None),
            next_listener_id: AtomicU64::new(0),
            dirty: AtomicBool::new(false),
            flush_pending: AtomicBool::new(false),
        })
    }

    /// Install the host-provided key/value sink used for the three
    /// persisted keys (spec.md §6). Reads at startup default to empty;
    /// this crate never reads the sink itself, only writes it.
    pub fn set_persist_sink(&self, sink: impl Fn(PersistedKey) + Send + Sync + 'static) {
        *self.persist_sink.lock().unwrap() = Some(Box::new(sink));
    }

    /// Apply one action and schedule a coalesced notification. Multiple
    /// `dispatch` calls within the same cooperative turn collapse into a
    /// single snapshot delivered after a `yield_now` (our stand-in for
    /// "next microtask").
    pub fn dispatch(self: &Arc<Self>, action: Action) {
        let persisted = {
            let mut state = self.state.lock().unwrap();
            let before = state.clone();
            reduce(&mut state, action);
            // is_monitoring is bookkeeping only (spec.md §4.6): a change to
            // it alone must never itself schedule a notification, so it's
            // excluded from the dirty comparison.
            let changed = {
                let mut after_cmp = state.clone();
                after_cmp.is_monitoring = before.is_monitoring;
                after_cmp != before
            };
            if changed {
                self.dirty.store(true, Ordering::SeqCst);
            }
            persistence_delta(&before, &state)
        };
        if let Some(sink) = self.persist_sink.lock().unwrap().as_ref() {
            for key in persisted {
                sink(key);
            }
        }
        self.schedule_flush();
    }

    /// Apply a batch of actions as a single turn; subscribers still see
    /// exactly one snapshot for the whole batch.
    pub fn dispatch_batch(self: &Arc<Self>, actions: impl IntoIterator<Item = Action>) {
        for action in actions {
            self.dispatch(action);
        }
    }

    fn schedule_flush(self: &Arc<Self>) {
        if self.flush_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            this.flush_pending.store(false, Ordering::SeqCst);
            if this.dirty.swap(false, Ordering::SeqCst) {
                this.notify_all();
            }
        });
    }

    fn notify_all(&self) {
        let snapshot = self.state.lock().unwrap().clone();
        let subs = self.subscriptions.lock().unwrap();
        for sub in subs.iter() {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| (sub.callback)(&snapshot)));
            if result.is_err() {
                error!(listener_id = sub.id, "store listener panicked; other listeners still notified");
            }
        }
        debug!(count = subs.len(), "store snapshot delivered");
    }

    /// Subscribe to batched snapshots; returns an id for
    /// [`StateStore::unsubscribe`]. No further snapshots are delivered
    /// to this id once `unsubscribe` returns.
    pub fn subscribe(&self, callback: impl Fn(&StoreState) + Send + Sync + 'static) -> u64 {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.subscriptions.lock().unwrap().push(Subscription {
            id,
            callback: Box::new(callback),
        });
        id
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscriptions.lock().unwrap().retain(|s| s.id != id);
    }

    /// Take an immediate snapshot outside the notification path (e.g.
    /// for a caller's first render before any mutation has happened).
    pub fn snapshot(&self) -> StoreState {
        self.state.lock().unwrap().clone()
    }
}

fn persistence_delta(before: &StoreState, after: &StoreState) -> Vec<PersistedKey> {
    let mut keys = Vec::new();
    if before.allow_block.allowed != after.allow_block.allowed {
        keys.push(PersistedKey::AllowList(after.allow_block.allowed.clone()));
    }
    if before.allow_block.blocked != after.allow_block.blocked {
        keys.push(PersistedKey::BlockList(after.allow_block.blocked.clone()));
    }
    if before.ui_preferences != after.ui_preferences {
        keys.push(PersistedKey::UiPreferencesCache(after.ui_preferences.clone()));
    }
    keys
}
