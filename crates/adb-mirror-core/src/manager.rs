//! Session Manager (C5): registry of active sessions, the codec-fallback
//! add-device loop, the bounded auto-reconnect loop, active-device
//! selection with last-frame replay, and removal.
//!
//! Socket I/O itself is behind the [`SessionConnector`] seam so this
//! module's orchestration logic is exercised without real TCP sockets or
//! a live debug tool, the way the teacher puts a collaborator trait
//! between orchestration and I/O.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::actions::{Action, SessionPatch};
use crate::errors::CoreError;
use crate::protocol::SessionEvent;
use crate::store::StateStore;
use crate::types::{fallback, Codec, ConnState, DeviceIdentity, Session, SessionManagerConfig};

/// Inter-attempt delay for the auto-reconnect loop (spec.md §5).
pub const RECONNECT_DELAY: Duration = Duration::from_millis(1500);

/// A live connection's event stream and outgoing control-frame sink.
pub struct ConnectionHandle {
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
    pub control_tx: mpsc::UnboundedSender<Vec<u8>>,
}

/// Opens the three sockets for one device at a given codec. Real
/// implementations drive [`crate::launcher::AgentLauncher`] and
/// [`crate::protocol`]'s parse state machines over a local TCP listener;
/// tests substitute a fake that simulates success/failure sequences.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(
        &self,
        identity: &DeviceIdentity,
        codec: Codec,
        config: &SessionManagerConfig,
    ) -> Result<ConnectionHandle, CoreError>;

    async fn disconnect(&self, session_id: &str);
}

fn mint_session_id(counter: &AtomicU64) -> String {
    format!("sess-{}", counter.fetch_add(1, Ordering::SeqCst))
}

/// Registry and orchestration logic for all device sessions.
pub struct SessionManager {
    store: Arc<StateStore>,
    connector: Arc<dyn SessionConnector>,
    config: SessionManagerConfig,
    media_sink: mpsc::UnboundedSender<(String, SessionEvent)>,
    session_counter: AtomicU64,
    active_flags: std::sync::Mutex<HashMap<String, bool>>,
}

impl SessionManager {
    /// `media_sink` receives `(session_id, event)` for the active
    /// session only; this is a dedicated real-time channel distinct from
    /// the state store's batched structured-state snapshots, since video
    /// frames arrive far more often than a UI needs metadata updates.
    pub fn new(
        store: Arc<StateStore>,
        connector: Arc<dyn SessionConnector>,
        config: SessionManagerConfig,
        media_sink: mpsc::UnboundedSender<(String, SessionEvent)>,
    ) -> Arc<Self> {
        Arc::new(SessionManager {
            store,
            connector,
            config,
            media_sink,
            session_counter: AtomicU64::new(0),
            active_flags: std::sync::Mutex::new(HashMap::new()),
        })
    }

    /// Mint a session, make it active (pausing whatever was active), and
    /// run the codec-fallback loop against it.
    pub async fn add_device(self: &Arc<Self>, identity: DeviceIdentity) -> Result<String, CoreError> {
        let session_id = mint_session_id(&self.session_counter);
        let session = Session::new(session_id.clone(), identity.clone(), self.config.codec);
        self.store.dispatch(Action::AddDevice(session));
        self.active_flags.lock().unwrap().insert(session_id.clone(), true);

        let previously_active = self.store.snapshot().active.0;
        if let Some(prev) = previously_active.filter(|p| p != &session_id) {
            self.pause(&prev);
        }
        self.store.dispatch(Action::SetActiveDevice(Some(session_id.clone())));

        let mut effective = self.config.codec;
        loop {
            match self.connector.connect(&identity, effective, &self.config).await {
                Ok(handle) => {
                    self.store.dispatch(Action::UpdateDevice(
                        session_id.clone(),
                        SessionPatch {
                            conn_state: Some(ConnState::Connected),
                            effective_codec: Some(effective),
                            ..Default::default()
                        },
                    ));
                    if effective != self.config.codec {
                        self.store.dispatch(Action::SetStatusMessage(format!(
                            "using {effective:?} (fallback from {:?})",
                            self.config.codec
                        )));
                    } else {
                        self.store.dispatch(Action::ClearStatusMessage);
                    }
                    self.spawn_event_pump(session_id.clone(), handle);
                    return Ok(session_id);
                }
                Err(e) => {
                    warn!(session_id = %session_id, codec = ?effective, error = %e, "connect attempt failed");
                    match fallback(effective) {
                        Some(next) => {
                            effective = next;
                            continue;
                        }
                        None => {
                            self.store.dispatch(Action::UpdateDevice(
                                session_id.clone(),
                                SessionPatch {
                                    conn_state: Some(ConnState::Disconnected),
                                    ..Default::default()
                                },
                            ));
                            self.store
                                .dispatch(Action::SetStatusMessage("failed to connect".to_string()));
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    fn pause(&self, session_id: &str) {
        self.active_flags
            .lock()
            .unwrap()
            .insert(session_id.to_string(), false);
        self.store.dispatch(Action::UpdateDevice(
            session_id.to_string(),
            SessionPatch {
                is_paused: Some(true),
                ..Default::default()
            },
        ));
    }

    /// Switch the active slot to `session_id`, pausing whatever was
    /// active, and replay its cached config + key-frame so a downstream
    /// decoder can resume without waiting for the next natural
    /// key-frame.
    pub fn set_active(self: &Arc<Self>, session_id: &str) {
        let snapshot = self.store.snapshot();
        if let Some(prev) = snapshot.active.0.filter(|p| p != session_id) {
            self.pause(&prev);
        }
        self.active_flags
            .lock()
            .unwrap()
            .insert(session_id.to_string(), true);
        self.store.dispatch(Action::UpdateDevice(
            session_id.to_string(),
            SessionPatch {
                is_paused: Some(false),
                ..Default::default()
            },
        ));
        self.store
            .dispatch(Action::SetActiveDevice(Some(session_id.to_string())));

        let refreshed = self.store.snapshot();
        let Some(session) = refreshed
            .sessions
            .iter()
            .find(|s| s.session_id == session_id)
        else {
            return;
        };
        let codec = session.last_codec.unwrap_or(session.effective_codec);
        if let (Some(width), Some(height)) = (session.last_width, session.last_height) {
            let payload = session
                .last_config_blob
                .clone()
                .map(Bytes::from)
                .unwrap_or_default();
            self.emit_media(
                session_id,
                SessionEvent::Video {
                    payload,
                    is_config: true,
                    is_key: false,
                    width: Some(width),
                    height: Some(height),
                    codec,
                },
            );
        }
        if let Some(keyframe) = session.last_keyframe_blob.clone() {
            self.emit_media(
                session_id,
                SessionEvent::Video {
                    payload: Bytes::from(keyframe),
                    is_config: false,
                    is_key: true,
                    width: None,
                    height: None,
                    codec,
                },
            );
        }
    }

    fn emit_media(&self, session_id: &str, event: SessionEvent) {
        let _ = self.media_sink.send((session_id.to_string(), event));
    }

    fn is_active(&self, session_id: &str) -> bool {
        self.active_flags
            .lock()
            .unwrap()
            .get(session_id)
            .copied()
            .unwrap_or(false)
    }

    fn spawn_event_pump(self: &Arc<Self>, session_id: String, mut handle: ConnectionHandle) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = handle.events.recv().await {
                match &event {
                    SessionEvent::Video {
                        payload,
                        is_config,
                        is_key,
                        width,
                        height,
                        codec,
                    } => {
                        let mut patch = SessionPatch::default();
                        if let (Some(w), Some(h)) = (width, height) {
                            patch.last_width = Some(*w);
                            patch.last_height = Some(*h);
                            patch.last_codec = Some(Some(*codec));
                        }
                        if *is_config && !payload.is_empty() {
                            patch.last_config_blob = Some(Some(payload.to_vec()));
                        }
                        if *is_key {
                            patch.last_keyframe_blob = Some(Some(payload.to_vec()));
                        }
                        if patch != SessionPatch::default() {
                            this.store
                                .dispatch(Action::UpdateDevice(session_id.clone(), patch));
                        }
                        if this.is_active(&session_id) {
                            this.emit_media(&session_id, event);
                        }
                    }
                    SessionEvent::Audio { .. } => {
                        if this.is_active(&session_id) {
                            this.emit_media(&session_id, event);
                        }
                    }
                    SessionEvent::Status(text) => {
                        this.store
                            .dispatch(Action::SetStatusMessage(text.clone()));
                    }
                    SessionEvent::Clipboard(_) => {
                        this.emit_media(&session_id, event);
                    }
                    SessionEvent::Error { text, .. } => {
                        warn!(session_id = %session_id, error = %text, "session reported terminal error");
                        this.reconnect(session_id.clone()).await;
                        return;
                    }
                }
            }
            // Channel closed without an explicit Error event: treat the
            // same as an unexpected disconnect.
            this.reconnect(session_id.clone()).await;
        });
    }

    /// Auto-reconnect loop (spec.md §4.5): bounded retries, 1500ms
    /// between attempts, same `effective_codec` throughout. Disposal is
    /// cancel-safe because we re-check `is_disposed` immediately after
    /// waking from the sleep.
    async fn reconnect(self: &Arc<Self>, session_id: String) {
        loop {
            let snapshot = self.store.snapshot();
            let Some(session) = snapshot
                .sessions
                .iter()
                .find(|s| s.session_id == session_id)
                .cloned()
            else {
                return;
            };
            if session.is_disposed {
                return;
            }
            if session.retry_count >= self.config.reconnect_retries {
                info!(session_id = %session_id, "reconnect retries exhausted, removing session");
                self.finish_removal(&session_id, &snapshot);
                return;
            }

            self.store.dispatch(Action::UpdateDevice(
                session_id.clone(),
                SessionPatch {
                    conn_state: Some(ConnState::Reconnecting),
                    is_reconnecting: Some(true),
                    ..Default::default()
                },
            ));
            tokio::time::sleep(RECONNECT_DELAY).await;

            let post_sleep = self.store.snapshot();
            match post_sleep.sessions.iter().find(|s| s.session_id == session_id) {
                Some(s) if s.is_disposed => return,
                None => return,
                _ => {}
            }

            match self
                .connector
                .connect(&session.identity, session.effective_codec, &self.config)
                .await
            {
                Ok(handle) => {
                    self.store.dispatch(Action::UpdateDevice(
                        session_id.clone(),
                        SessionPatch {
                            conn_state: Some(ConnState::Connected),
                            retry_count: Some(0),
                            is_reconnecting: Some(false),
                            ..Default::default()
                        },
                    ));
                    self.spawn_event_pump(session_id.clone(), handle);
                    return;
                }
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "reconnect attempt failed");
                    self.store.dispatch(Action::UpdateDevice(
                        session_id.clone(),
                        SessionPatch {
                            retry_count: Some(session.retry_count + 1),
                            ..Default::default()
                        },
                    ));
                }
            }
        }
    }

    fn finish_removal(self: &Arc<Self>, session_id: &str, snapshot_before: &crate::store::StoreState) {
        let was_active = snapshot_before.active.0.as_deref() == Some(session_id);
        self.store.dispatch(Action::UpdateDevice(
            session_id.to_string(),
            SessionPatch {
                conn_state: Some(ConnState::Disconnected),
                ..Default::default()
            },
        ));
        self.store.dispatch(Action::RemoveDevice(session_id.to_string()));
        self.active_flags.lock().unwrap().remove(session_id);

        let after = self.store.snapshot();
        if was_active {
            if let Some(first) = after.sessions.first() {
                self.set_active(&first.session_id.clone());
            } else {
                self.store
                    .dispatch(Action::SetStatusMessage("empty".to_string()));
            }
        } else if after.sessions.is_empty() {
            self.store
                .dispatch(Action::SetStatusMessage("empty".to_string()));
        }
    }

    /// User-initiated removal: mark disposed, disconnect, drop from the
    /// store, and add the serial to the block list so C4 does not
    /// immediately auto-readd it.
    pub async fn remove_device(self: &Arc<Self>, session_id: &str) {
        let snapshot = self.store.snapshot();
        let Some(session) = snapshot
            .sessions
            .iter()
            .find(|s| s.session_id == session_id)
            .cloned()
        else {
            return;
        };
        self.store.dispatch(Action::UpdateDevice(
            session_id.to_string(),
            SessionPatch {
                is_disposed: Some(true),
                ..Default::default()
            },
        ));
        self.connector.disconnect(session_id).await;
        self.store
            .dispatch(Action::AddBlockListEntry(session.identity.serial.clone()));
        self.store
            .dispatch(Action::RemoveAllowListEntry(session.identity.serial.clone()));
        self.finish_removal(session_id, &snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    struct ScriptedConnector {
        attempts: AtomicUsize,
        /// `true` at index i means the i-th connect attempt succeeds.
        script: Vec<bool>,
        disconnected: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl SessionConnector for ScriptedConnector {
        async fn connect(
            &self,
            _identity: &DeviceIdentity,
            _codec: Codec,
            _config: &SessionManagerConfig,
        ) -> Result<ConnectionHandle, CoreError> {
            let idx = self.attempts.fetch_add(1, Ordering::SeqCst);
            let succeeds = self.script.get(idx).copied().unwrap_or(false);
            if succeeds {
                let (_tx_events, rx_events) = mpsc::unbounded_channel();
                let (tx_ctrl, _rx_ctrl) = mpsc::unbounded_channel();
                Ok(ConnectionHandle {
                    events: rx_events,
                    control_tx: tx_ctrl,
                })
            } else {
                Err(CoreError::CommandFailure("agent exited 1".to_string()))
            }
        }

        async fn disconnect(&self, session_id: &str) {
            self.disconnected.lock().unwrap().push(session_id.to_string());
        }
    }

    fn identity(serial: &str) -> DeviceIdentity {
        DeviceIdentity {
            serial: serial.to_string(),
            display_name: "Pixel".to_string(),
            model: None,
        }
    }

    #[tokio::test]
    async fn codec_fallback_succeeds_on_third_attempt() {
        let store = StateStore::new();
        let connector = Arc::new(ScriptedConnector {
            attempts: AtomicUsize::new(0),
            script: vec![false, false, true],
            disconnected: StdMutex::new(Vec::new()),
        });
        let (tx, _rx) = mpsc::unbounded_channel();
        let config = SessionManagerConfig {
            codec: Codec::Av1,
            ..Default::default()
        };
        let manager = SessionManager::new(store.clone(), connector, config, tx);

        let session_id = manager.add_device(identity("S1")).await.unwrap();
        let snapshot = store.snapshot();
        let session = snapshot
            .sessions
            .iter()
            .find(|s| s.session_id == session_id)
            .unwrap();
        assert_eq!(session.effective_codec, Codec::H264);
        assert_eq!(session.conn_state, ConnState::Connected);
        assert_eq!(
            snapshot.status_message.as_deref(),
            Some("using H264 (fallback from Av1)")
        );
    }

    #[tokio::test]
    async fn codec_fallback_exhaustion_is_an_error() {
        let store = StateStore::new();
        let connector = Arc::new(ScriptedConnector {
            attempts: AtomicUsize::new(0),
            script: vec![false, false, false],
            disconnected: StdMutex::new(Vec::new()),
        });
        let (tx, _rx) = mpsc::unbounded_channel();
        let config = SessionManagerConfig {
            codec: Codec::Av1,
            ..Default::default()
        };
        let manager = SessionManager::new(store.clone(), connector, config, tx);

        let result = manager.add_device(identity("S1")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn remove_device_blocks_serial_and_frees_active_slot() {
        let store = StateStore::new();
        let connector = Arc::new(ScriptedConnector {
            attempts: AtomicUsize::new(0),
            script: vec![true, true],
            disconnected: StdMutex::new(Vec::new()),
        });
        let (tx, _rx) = mpsc::unbounded_channel();
        let config = SessionManagerConfig {
            codec: Codec::H264,
            ..Default::default()
        };
        let manager = SessionManager::new(store.clone(), connector.clone(), config, tx);

        let first = manager.add_device(identity("S1")).await.unwrap();
        let second = manager.add_device(identity("S2")).await.unwrap();
        // S2 became active on add; hand the active slot back to S1 so
        // removal has to move it on to the remaining session.
        manager.set_active(&first);

        manager.remove_device(&first).await;

        let snapshot = store.snapshot();
        assert!(!snapshot.sessions.iter().any(|s| s.session_id == first));
        assert_eq!(snapshot.active.0.as_deref(), Some(second.as_str()));
        assert!(snapshot.allow_block.blocked.contains(&"S1".to_string()));
        assert_eq!(connector.disconnected.lock().unwrap().as_slice(), &[first]);
    }

    #[tokio::test(start_paused = true)]
    async fn auto_reconnect_exhaustion_removes_session() {
        let store = StateStore::new();
        let connector = Arc::new(ScriptedConnector {
            attempts: AtomicUsize::new(0),
            // First attempt (add_device) succeeds with an empty event
            // stream, so the pump immediately sees channel-close and
            // starts reconnecting; both reconnect attempts then fail.
            script: vec![true, false, false],
            disconnected: StdMutex::new(Vec::new()),
        });
        let (tx, _rx) = mpsc::unbounded_channel();
        let config = SessionManagerConfig {
            codec: Codec::H264,
            reconnect_retries: 2,
            ..Default::default()
        };
        let manager = SessionManager::new(store.clone(), connector, config, tx);

        let session_id = manager.add_device(identity("S1")).await.unwrap();

        let seen_states = Arc::new(StdMutex::new(Vec::new()));
        let seen_states_clone = Arc::clone(&seen_states);
        let watched_id = session_id.clone();
        store.subscribe(move |snapshot| {
            if let Some(session) = snapshot.sessions.iter().find(|s| s.session_id == watched_id) {
                seen_states_clone.lock().unwrap().push(session.conn_state);
            }
        });

        for _ in 0..10 {
            tokio::time::advance(RECONNECT_DELAY).await;
            tokio::task::yield_now().await;
        }

        let snapshot = store.snapshot();
        assert!(!snapshot.sessions.iter().any(|s| s.session_id == session_id));
        // The session must be observed as disconnected before it vanishes,
        // not just removed outright (spec.md §8 scenario 5).
        assert_eq!(
            seen_states.lock().unwrap().last(),
            Some(&ConnState::Disconnected)
        );
    }
}
