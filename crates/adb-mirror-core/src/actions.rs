//! Action/Event Bus (C7): a closed tagged-union action type and the
//! total reducer function that applies it to a [`crate::store::StoreState`].
//! Every clause is idempotent when applied twice to the same state.

use crate::store::StoreState;
use crate::types::{Codec, DeviceDetails, Session, ToolStatus, UiPreferences};

/// Sparse update to an existing [`Session`]; unset fields are left
/// untouched. Mirrors [`UiPreferences::merge`]'s partial-update shape.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionPatch {
    pub conn_state: Option<crate::types::ConnState>,
    pub is_paused: Option<bool>,
    pub effective_codec: Option<Codec>,
    pub retry_count: Option<u32>,
    pub is_reconnecting: Option<bool>,
    pub is_disposed: Option<bool>,
    pub last_width: Option<u32>,
    pub last_height: Option<u32>,
    pub last_config_blob: Option<Option<Vec<u8>>>,
    pub last_keyframe_blob: Option<Option<Vec<u8>>>,
    pub last_codec: Option<Option<Codec>>,
}

impl SessionPatch {
    fn apply(&self, session: &mut Session) {
        if let Some(v) = self.conn_state {
            session.conn_state = v;
        }
        if let Some(v) = self.is_paused {
            session.is_paused = v;
        }
        if let Some(v) = self.effective_codec {
            session.effective_codec = v;
        }
        if let Some(v) = self.retry_count {
            session.retry_count = v;
        }
        if let Some(v) = self.is_reconnecting {
            session.is_reconnecting = v;
        }
        if let Some(v) = self.is_disposed {
            session.is_disposed = v;
        }
        if let Some(v) = self.last_width {
            session.last_width = Some(v);
        }
        if let Some(v) = self.last_height {
            session.last_height = Some(v);
        }
        if let Some(v) = self.last_config_blob.clone() {
            session.last_config_blob = v;
        }
        if let Some(v) = self.last_keyframe_blob.clone() {
            session.last_keyframe_blob = v;
        }
        if let Some(v) = self.last_codec {
            session.last_codec = v;
        }
    }
}

/// Host-wide knobs that live in the store alongside device state; not
/// named as a distinct entity in the data model but needed to carry
/// `UpdateSettings` (spec.md §4.7) somewhere concrete.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreSettings {
    pub preferred_codec: Option<Codec>,
}

/// The closed set of mutations the store accepts (spec.md §4.7).
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    AddDevice(Session),
    RemoveDevice(String),
    UpdateDevice(String, SessionPatch),
    SetActiveDevice(Option<String>),
    UpdateSettings(StoreSettings),
    SetToolAvailability(ToolStatus),
    SetStatusMessage(String),
    ClearStatusMessage,
    SetDeviceDetails(String, DeviceDetails),
    RemoveDeviceDetails(String),
    ClearDeviceDetails,
    SetMonitoring(bool),
    ClearAllDevices,
    Reset,
    SetAllowList(Vec<String>),
    AddAllowListEntry(String),
    RemoveAllowListEntry(String),
    AddBlockListEntry(String),
    RemoveBlockListEntry(String),
    SetUiPreferencesEntry(String, UiPreferences),
    UpdateUiPreferencesEntry(String, UiPreferences),
    SaveUiPreferencesEntry(String),
}

/// Apply `action` to `state` in place. Total: there is no variant this
/// function does not handle, and applying the same action twice in
/// sequence leaves the state identical to applying it once.
pub fn reduce(state: &mut StoreState, action: Action) {
    match action {
        Action::AddDevice(session) => {
            if !state
                .sessions
                .iter()
                .any(|s| s.session_id == session.session_id)
            {
                state.sessions.push(session);
            }
        }
        Action::RemoveDevice(session_id) => {
            state.sessions.retain(|s| s.session_id != session_id);
            state.device_details.remove(&session_id);
            state.ui_preferences.remove(&session_id);
            if state.active.0.as_deref() == Some(session_id.as_str()) {
                state.active.0 = None;
            }
        }
        Action::UpdateDevice(session_id, patch) => {
            if let Some(session) = state
                .sessions
                .iter_mut()
                .find(|s| s.session_id == session_id)
            {
                patch.apply(session);
            }
        }
        Action::SetActiveDevice(session_id) => {
            let exists = match &session_id {
                Some(id) => state.sessions.iter().any(|s| &s.session_id == id),
                None => true,
            };
            if exists {
                for s in state.sessions.iter_mut() {
                    s.is_active = Some(&s.session_id) == session_id.as_ref();
                }
                state.active.0 = session_id;
            }
        }
        Action::UpdateSettings(settings) => {
            state.settings = settings;
        }
        Action::SetToolAvailability(status) => {
            state.tool_status = status;
        }
        Action::SetStatusMessage(text) => {
            state.status_message = Some(text);
        }
        Action::ClearStatusMessage => {
            state.status_message = None;
        }
        Action::SetDeviceDetails(session_id, details) => {
            state.device_details.insert(session_id, details);
        }
        Action::RemoveDeviceDetails(session_id) => {
            state.device_details.remove(&session_id);
        }
        Action::ClearDeviceDetails => {
            state.device_details.clear();
        }
        Action::SetMonitoring(enabled) => {
            state.is_monitoring = enabled;
        }
        Action::ClearAllDevices => {
            state.sessions.clear();
            state.device_details.clear();
            state.ui_preferences.clear();
            state.active.0 = None;
        }
        Action::Reset => {
            *state = StoreState::default();
        }
        Action::SetAllowList(list) => {
            state.allow_block.allowed = list;
        }
        Action::AddAllowListEntry(serial) => {
            if !state.allow_block.allowed.contains(&serial) {
                state.allow_block.allowed.push(serial);
            }
        }
        Action::RemoveAllowListEntry(serial) => {
            state.allow_block.allowed.retain(|s| s != &serial);
        }
        Action::AddBlockListEntry(serial) => {
            if !state.allow_block.blocked.contains(&serial) {
                state.allow_block.blocked.push(serial);
            }
        }
        Action::RemoveBlockListEntry(serial) => {
            state.allow_block.blocked.retain(|s| s != &serial);
        }
        Action::SetUiPreferencesEntry(session_id, prefs) => {
            state.ui_preferences.insert(session_id, prefs);
        }
        Action::UpdateUiPreferencesEntry(session_id, patch) => {
            state
                .ui_preferences
                .entry(session_id)
                .or_default()
                .merge(patch);
        }
        Action::SaveUiPreferencesEntry(_session_id) => {
            // Persistence side-effect lives outside the reducer (the
            // store's dispatch path never suspends); this variant exists
            // so callers have a cue to flush without mutating state.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Codec, ConnState, DeviceIdentity};

    fn sample_session(id: &str) -> Session {
        Session::new(
            id,
            DeviceIdentity {
                serial: format!("serial-{id}"),
                display_name: "Test Device".into(),
                model: None,
            },
            Codec::H264,
        )
    }

    #[test]
    fn add_device_is_idempotent() {
        let mut state = StoreState::default();
        reduce(&mut state, Action::AddDevice(sample_session("a")));
        reduce(&mut state, Action::AddDevice(sample_session("a")));
        assert_eq!(state.sessions.len(), 1);
    }

    #[test]
    fn set_active_device_requires_existing_session() {
        let mut state = StoreState::default();
        reduce(&mut state, Action::AddDevice(sample_session("a")));
        reduce(&mut state, Action::SetActiveDevice(Some("missing".into())));
        assert_eq!(state.active.0, None);

        reduce(&mut state, Action::SetActiveDevice(Some("a".into())));
        assert_eq!(state.active.0, Some("a".into()));
        assert!(state.sessions[0].is_active);
    }

    #[test]
    fn remove_device_clears_active_slot() {
        let mut state = StoreState::default();
        reduce(&mut state, Action::AddDevice(sample_session("a")));
        reduce(&mut state, Action::SetActiveDevice(Some("a".into())));
        reduce(&mut state, Action::RemoveDevice("a".into()));
        assert_eq!(state.active.0, None);
        assert!(state.sessions.is_empty());
    }

    #[test]
    fn update_device_patches_only_named_fields() {
        let mut state = StoreState::default();
        reduce(&mut state, Action::AddDevice(sample_session("a")));
        let patch = SessionPatch {
            conn_state: Some(ConnState::Connected),
            ..Default::default()
        };
        reduce(&mut state, Action::UpdateDevice("a".into(), patch));
        assert_eq!(state.sessions[0].conn_state, ConnState::Connected);
        assert_eq!(state.sessions[0].retry_count, 0);
    }

    #[test]
    fn allow_list_add_remove_round_trips() {
        let mut state = StoreState::default();
        reduce(&mut state, Action::AddAllowListEntry("S1".into()));
        reduce(&mut state, Action::AddAllowListEntry("S1".into()));
        assert_eq!(state.allow_block.allowed, vec!["S1".to_string()]);
        reduce(&mut state, Action::RemoveAllowListEntry("S1".into()));
        assert!(state.allow_block.allowed.is_empty());
    }

    #[test]
    fn ui_preferences_update_merges_without_clobbering() {
        let mut state = StoreState::default();
        reduce(
            &mut state,
            Action::SetUiPreferencesEntry(
                "a".into(),
                UiPreferences {
                    dark_mode: Some(true),
                    ..Default::default()
                },
            ),
        );
        reduce(
            &mut state,
            Action::UpdateUiPreferencesEntry(
                "a".into(),
                UiPreferences {
                    font_scale: Some(1.5),
                    ..Default::default()
                },
            ),
        );
        let prefs = state.ui_preferences.get("a").unwrap();
        assert_eq!(prefs.dark_mode, Some(true));
        assert_eq!(prefs.font_scale, Some(1.5));
    }
}
