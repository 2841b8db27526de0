//! Integration scenarios from spec.md §8 that need the full session
//! manager wired to a fake connector, rather than a single module's
//! colocated unit tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use adb_mirror_core::errors::CoreError;
use adb_mirror_core::manager::{ConnectionHandle, SessionConnector, SessionManager};
use adb_mirror_core::protocol::SessionEvent;
use adb_mirror_core::store::StateStore;
use adb_mirror_core::types::{Codec, DeviceIdentity, SessionManagerConfig};

/// Always succeeds; hands the test a sender keyed by serial so it can
/// drive events into a connected session from outside.
struct HandoutConnector {
    senders: Mutex<HashMap<String, mpsc::UnboundedSender<SessionEvent>>>,
}

impl HandoutConnector {
    fn new() -> Arc<Self> {
        Arc::new(HandoutConnector {
            senders: Mutex::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl SessionConnector for HandoutConnector {
    async fn connect(
        &self,
        identity: &DeviceIdentity,
        _codec: Codec,
        _config: &SessionManagerConfig,
    ) -> Result<ConnectionHandle, CoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().unwrap().insert(identity.serial.clone(), tx);
        let (ctrl_tx, _ctrl_rx) = mpsc::unbounded_channel();
        Ok(ConnectionHandle {
            events: rx,
            control_tx: ctrl_tx,
        })
    }

    async fn disconnect(&self, _session_id: &str) {}
}

fn identity(serial: &str) -> DeviceIdentity {
    DeviceIdentity {
        serial: serial.to_string(),
        display_name: "Pixel".to_string(),
        model: None,
    }
}

async fn recv_with_timeout(
    rx: &mut mpsc::UnboundedReceiver<(String, SessionEvent)>,
) -> (String, SessionEvent) {
    tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
        .await
        .expect("expected an event")
        .expect("channel open")
}

#[tokio::test]
async fn scenario_resume_on_tab_switch_replays_config_and_keyframe_only() {
    let store = StateStore::new();
    let connector = HandoutConnector::new();
    let (media_tx, mut media_rx) = mpsc::unbounded_channel();
    let config = SessionManagerConfig {
        codec: Codec::H264,
        ..Default::default()
    };
    let manager = SessionManager::new(store.clone(), connector.clone(), config, media_tx);

    let session_a = manager.add_device(identity("A")).await.unwrap();

    let tx_a = connector
        .senders
        .lock()
        .unwrap()
        .get("A")
        .cloned()
        .unwrap();

    let config_a = Bytes::from_static(b"config-A");
    let keyframe_a = Bytes::from_static(b"keyframe-A");

    tx_a.send(SessionEvent::Video {
        payload: config_a.clone(),
        is_config: true,
        is_key: false,
        width: Some(1920),
        height: Some(1080),
        codec: Codec::H264,
    })
    .unwrap();
    tx_a.send(SessionEvent::Video {
        payload: keyframe_a.clone(),
        is_config: false,
        is_key: true,
        width: None,
        height: None,
        codec: Codec::H264,
    })
    .unwrap();
    tx_a.send(SessionEvent::Video {
        payload: Bytes::from_static(b"p-frame-1"),
        is_config: false,
        is_key: false,
        width: None,
        height: None,
        codec: Codec::H264,
    })
    .unwrap();
    tx_a.send(SessionEvent::Video {
        payload: Bytes::from_static(b"p-frame-2"),
        is_config: false,
        is_key: false,
        width: None,
        height: None,
        codec: Codec::H264,
    })
    .unwrap();

    // Drain A's four live events before switching away.
    for _ in 0..4 {
        let (session_id, _event) = recv_with_timeout(&mut media_rx).await;
        assert_eq!(session_id, session_a);
    }

    // Adding B pauses A and makes B active.
    let _session_b = manager.add_device(identity("B")).await.unwrap();

    // Give A's cache-update dispatch a turn to land before switching back.
    tokio::task::yield_now().await;

    manager.set_active(&session_a);

    let (session_id, first) = recv_with_timeout(&mut media_rx).await;
    assert_eq!(session_id, session_a);
    match first {
        SessionEvent::Video {
            is_config,
            is_key,
            width,
            height,
            payload,
            ..
        } => {
            assert!(is_config);
            assert!(!is_key);
            assert_eq!(width, Some(1920));
            assert_eq!(height, Some(1080));
            assert_eq!(payload, config_a);
        }
        other => panic!("expected config replay, got {other:?}"),
    }

    let (session_id, second) = recv_with_timeout(&mut media_rx).await;
    assert_eq!(session_id, session_a);
    match second {
        SessionEvent::Video {
            is_config,
            is_key,
            payload,
            ..
        } => {
            assert!(!is_config);
            assert!(is_key);
            assert_eq!(payload, keyframe_a);
        }
        other => panic!("expected key-frame replay, got {other:?}"),
    }

    // No further events queued: the P-frames never replay.
    let immediate = media_rx.try_recv();
    assert!(immediate.is_err());
}
