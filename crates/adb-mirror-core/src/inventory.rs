//! Device inventory tracker (C4): parses the debug tool's continuous
//! `track-devices` stream and emits appeared/disappeared events,
//! restarting the tracker process on crash with a 1 s back-off.

use std::collections::HashSet;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::AsyncReadExt;
use tracing::{info, warn};

use crate::adb::AdbTool;
use crate::errors::InventoryError;

const RESTART_BACKOFF: Duration = Duration::from_secs(1);
const MDNS_TLS_DISCRIMINATOR: &str = "._adb-tls-connect._tcp";

static IPV4_PORT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{1,3}\.){3}\d{1,3}:\d+$").expect("static regex is valid"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Usb,
    WifiTcpIp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryDevice {
    pub serial: String,
    pub kind: DeviceKind,
}

fn classify(serial: &str) -> DeviceKind {
    if IPV4_PORT.is_match(serial) {
        DeviceKind::WifiTcpIp
    } else {
        DeviceKind::Usb
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InventoryEvent {
    Appeared(InventoryDevice),
    Disappeared(String),
}

/// Incremental parser for the length-prefixed `track-devices` stream.
/// Each frame is `<4 lowercase-hex bytes><body>`; the body is a
/// newline-separated list of `<serial>\t<state>`. An unparseable hex
/// prefix discards the whole buffer and resyncs on the next bytes fed.
pub struct TrackDevicesParser {
    buf: Vec<u8>,
    known: HashSet<String>,
}

impl Default for TrackDevicesParser {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackDevicesParser {
    pub fn new() -> Self {
        TrackDevicesParser {
            buf: Vec::new(),
            known: HashSet::new(),
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Drain every complete frame currently buffered, producing the
    /// appeared/disappeared events for this update.
    pub fn drain_events(&mut self) -> Vec<InventoryEvent> {
        let mut events = Vec::new();
        loop {
            match self.try_take_frame() {
                Ok(Some(body)) => events.extend(self.apply_body(&body)),
                Ok(None) => break,
                Err(_) => {
                    // Bad hex prefix: discard the buffer and resync.
                    self.buf.clear();
                    break;
                }
            }
        }
        events
    }

    fn try_take_frame(&mut self) -> Result<Option<String>, InventoryError> {
        const PREFIX_LEN: usize = 4;
        if self.buf.len() < PREFIX_LEN {
            return Ok(None);
        }
        let prefix = std::str::from_utf8(&self.buf[..PREFIX_LEN])
            .map_err(|e| InventoryError::BadLengthPrefix(e.to_string()))?;
        let length = usize::from_str_radix(prefix, 16)
            .map_err(|e| InventoryError::BadLengthPrefix(e.to_string()))?;
        let total = PREFIX_LEN + length;
        if self.buf.len() < total {
            return Ok(None);
        }
        let body = String::from_utf8_lossy(&self.buf[PREFIX_LEN..total]).into_owned();
        self.buf.drain(..total);
        Ok(Some(body))
    }

    fn apply_body(&mut self, body: &str) -> Vec<InventoryEvent> {
        let mut current = HashSet::new();
        for line in body.lines() {
            let mut parts = line.splitn(2, '\t');
            let (Some(serial), Some(state)) = (parts.next(), parts.next()) else {
                continue;
            };
            if state != "device" {
                continue;
            }
            if serial.contains(MDNS_TLS_DISCRIMINATOR) {
                continue;
            }
            current.insert(serial.to_string());
        }

        let mut events = Vec::new();
        for serial in current.difference(&self.known) {
            events.push(InventoryEvent::Appeared(InventoryDevice {
                serial: serial.clone(),
                kind: classify(serial),
            }));
        }
        for serial in self.known.difference(&current) {
            events.push(InventoryEvent::Disappeared(serial.clone()));
        }
        self.known = current;
        events
    }
}

/// Owns the long-lived tracker process; exactly one runs at a time, and
/// starting a new one implicitly supersedes any previous instance
/// (the caller is expected to have dropped the prior handle first).
pub struct InventoryTracker {
    adb: AdbTool,
}

impl InventoryTracker {
    pub fn new(adb: AdbTool) -> Self {
        InventoryTracker { adb }
    }

    /// Run the tracker until `enabled` is cleared, restarting the
    /// process on unexpected exit with [`RESTART_BACKOFF`]. Update
    /// handling is serialized by construction: the loop body awaits the
    /// full processing of one chunk (parse + callback) before the next
    /// `read` call, so two updates can never interleave.
    pub async fn run(
        &self,
        enabled: std::sync::Arc<std::sync::atomic::AtomicBool>,
        mut on_event: impl FnMut(InventoryEvent),
    ) {
        use std::sync::atomic::Ordering;

        let mut parser = TrackDevicesParser::new();
        while enabled.load(Ordering::SeqCst) {
            let mut child = match self.adb.spawn_track_devices() {
                Ok(child) => child,
                Err(e) => {
                    warn!(error = %e, "failed to spawn track-devices, backing off");
                    tokio::time::sleep(RESTART_BACKOFF).await;
                    continue;
                }
            };
            info!("inventory tracker started");

            let Some(mut stdout) = child.stdout.take() else {
                tokio::time::sleep(RESTART_BACKOFF).await;
                continue;
            };

            let mut chunk = [0u8; 4096];
            loop {
                match stdout.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => {
                        parser.feed(&chunk[..n]);
                        for event in parser.drain_events() {
                            on_event(event);
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "track-devices read failed");
                        break;
                    }
                }
            }

            let _ = child.wait().await;
            warn!("inventory tracker exited, restarting after back-off");
            if enabled.load(Ordering::SeqCst) {
                tokio::time::sleep(RESTART_BACKOFF).await;
            }
        }
    }
}
