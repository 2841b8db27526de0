//! Core data model: device identity, sessions, device details, UI
//! preferences, and the small value types shared across modules.

use std::collections::HashMap;
use std::time::Duration;

/// Stable identifier for a physical/virtual device as reported by the
/// debug tool. `serial` is either a USB identifier or an `IPv4:port`
/// literal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    pub serial: String,
    pub display_name: String,
    pub model: Option<String>,
}

/// Connection state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
}

/// Video/audio codec, ordered by fallback preference (best first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    Av1,
    H265,
    H264,
}

impl Codec {
    /// Wire magic recognized in `VideoCodecMeta` frames.
    pub fn magic(self) -> u32 {
        match self {
            Codec::H264 => 0x6832_3634,
            Codec::H265 => 0x6832_3635,
            Codec::Av1 => 0x0061_7631,
        }
    }

    /// Classify a codec magic; unrecognized magics default to H.264 per
    /// the framing contract.
    pub fn from_magic(magic: u32) -> Codec {
        match magic {
            0x6832_3634 => Codec::H264,
            0x6832_3635 => Codec::H265,
            0x0061_7631 => Codec::Av1,
            _ => Codec::H264,
        }
    }
}

/// Next codec to try in the fallback chain, or `None` if exhausted.
pub fn fallback(codec: Codec) -> Option<Codec> {
    match codec {
        Codec::Av1 => Some(Codec::H265),
        Codec::H265 => Some(Codec::H264),
        Codec::H264 => None,
    }
}

/// One host-unique session tracked in the store. `session_id` is minted at
/// creation and is never the device serial.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub session_id: String,
    pub identity: DeviceIdentity,
    pub conn_state: ConnState,
    pub is_active: bool,
    pub is_paused: bool,
    pub effective_codec: Codec,
    pub retry_count: u32,
    pub is_reconnecting: bool,
    pub is_disposed: bool,
    pub last_width: Option<u32>,
    pub last_height: Option<u32>,
    pub last_config_blob: Option<Vec<u8>>,
    pub last_keyframe_blob: Option<Vec<u8>>,
    pub last_codec: Option<Codec>,
}

impl Session {
    pub fn new(session_id: impl Into<String>, identity: DeviceIdentity, codec: Codec) -> Self {
        Session {
            session_id: session_id.into(),
            identity,
            conn_state: ConnState::Connecting,
            is_active: false,
            is_paused: false,
            effective_codec: codec,
            retry_count: 0,
            is_reconnecting: false,
            is_disposed: false,
            last_width: None,
            last_height: None,
            last_config_blob: None,
            last_keyframe_blob: None,
            last_codec: None,
        }
    }
}

/// Cached, TTL-bound device metadata assembled by the property probe.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceDetails {
    pub model: String,
    pub manufacturer: String,
    pub os_version: String,
    pub sdk_level: String,
    pub battery_level: Option<u32>,
    pub battery_charging: Option<bool>,
    pub storage_total_bytes: Option<u64>,
    pub storage_used_bytes: Option<u64>,
    pub screen_width: Option<u32>,
    pub screen_height: Option<u32>,
    pub ip_address: Option<String>,
    pub fetched_at: Duration,
}

impl DeviceDetails {
    pub const TTL: Duration = Duration::from_secs(30);

    /// True once `now` is at least [`DeviceDetails::TTL`] past `fetched_at`.
    pub fn is_stale(&self, now: Duration) -> bool {
        now.saturating_sub(self.fetched_at) >= Self::TTL
    }
}

/// Whether the most recent active-session slot is populated; kept as a
/// thin wrapper rather than a bare `Option<String>` so the store can
/// assert the "references an existing session" invariant at the type's
/// single construction site.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveSelection(pub Option<String>);

/// Reported availability of the debug tool / agent binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolStatus {
    #[default]
    Unknown,
    Available,
    Missing,
}

/// Per-device UI knob cache, populated piecemeal as queries return.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UiPreferences {
    pub dark_mode: Option<bool>,
    pub nav_bar_mode: Option<String>,
    pub talkback_enabled: Option<bool>,
    pub font_scale: Option<f32>,
    pub display_density: Option<u32>,
    pub layout_bounds_debug: Option<bool>,
    pub available_nav_modes: Vec<String>,
}

impl UiPreferences {
    /// Merge non-`None`/non-empty fields from `patch` into `self`,
    /// leaving fields `patch` leaves unset untouched.
    pub fn merge(&mut self, patch: UiPreferences) {
        if patch.dark_mode.is_some() {
            self.dark_mode = patch.dark_mode;
        }
        if patch.nav_bar_mode.is_some() {
            self.nav_bar_mode = patch.nav_bar_mode;
        }
        if patch.talkback_enabled.is_some() {
            self.talkback_enabled = patch.talkback_enabled;
        }
        if patch.font_scale.is_some() {
            self.font_scale = patch.font_scale;
        }
        if patch.display_density.is_some() {
            self.display_density = patch.display_density;
        }
        if patch.layout_bounds_debug.is_some() {
            self.layout_bounds_debug = patch.layout_bounds_debug;
        }
        if !patch.available_nav_modes.is_empty() {
            self.available_nav_modes = patch.available_nav_modes;
        }
    }
}

/// Serials the user has explicitly interacted with, persisted across
/// runs via the host-supplied key/value store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowBlockLists {
    pub allowed: Vec<String>,
    pub blocked: Vec<String>,
}

impl AllowBlockLists {
    /// Block-list precedence over allow-list at auto-connect time.
    pub fn may_auto_connect(&self, serial: &str) -> bool {
        if self.blocked.iter().any(|s| s == serial) {
            return false;
        }
        self.allowed.iter().any(|s| s == serial)
    }
}

/// `session_id -> UiPreferences` cache, keyed the way the store exposes
/// it to snapshot consumers.
pub type UiPreferencesCache = HashMap<String, UiPreferences>;

/// Configuration the embedding application constructs and passes in; the
/// core never reads a file or environment variable itself.
#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    pub codec: Codec,
    pub reconnect_retries: u32,
    pub bit_rate: u32,
    pub max_fps: u32,
    pub max_size: u32,
    pub lock_video_orientation: Option<i32>,
    pub audio_enabled: bool,
    pub clipboard_autosync: bool,
    pub adb_path: Option<String>,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        SessionManagerConfig {
            codec: Codec::H264,
            reconnect_retries: 3,
            bit_rate: 8_000_000,
            max_fps: 60,
            max_size: 0,
            lock_video_orientation: None,
            audio_enabled: true,
            clipboard_autosync: true,
            adb_path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_chain_terminates() {
        assert_eq!(fallback(Codec::Av1), Some(Codec::H265));
        assert_eq!(fallback(Codec::H265), Some(Codec::H264));
        assert_eq!(fallback(Codec::H264), None);
    }

    #[test]
    fn unrecognized_magic_defaults_to_h264() {
        assert_eq!(Codec::from_magic(0xDEAD_BEEF), Codec::H264);
    }

    #[test]
    fn device_details_stale_after_ttl() {
        let details = DeviceDetails {
            model: "Pixel 8".into(),
            manufacturer: "Google".into(),
            os_version: "14".into(),
            sdk_level: "34".into(),
            battery_level: Some(80),
            battery_charging: Some(false),
            storage_total_bytes: None,
            storage_used_bytes: None,
            screen_width: None,
            screen_height: None,
            ip_address: None,
            fetched_at: Duration::from_secs(100),
        };
        assert!(!details.is_stale(Duration::from_secs(110)));
        assert!(details.is_stale(Duration::from_secs(130)));
    }

    #[test]
    fn block_takes_precedence_over_allow() {
        let lists = AllowBlockLists {
            allowed: vec!["S1".into()],
            blocked: vec!["S1".into()],
        };
        assert!(!lists.may_auto_connect("S1"));
    }

    #[test]
    fn ui_preferences_merge_leaves_unset_fields_untouched() {
        let mut prefs = UiPreferences {
            dark_mode: Some(true),
            nav_bar_mode: Some("gesture".into()),
            ..Default::default()
        };
        prefs.merge(UiPreferences {
            font_scale: Some(1.2),
            ..Default::default()
        });
        assert_eq!(prefs.dark_mode, Some(true));
        assert_eq!(prefs.nav_bar_mode, Some("gesture".into()));
        assert_eq!(prefs.font_scale, Some(1.2));
    }
}
