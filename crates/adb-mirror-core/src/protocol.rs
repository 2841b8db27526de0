//! Protocol Session (C2): owns the parse state machines for one device's
//! video, audio, and control sockets, and builds the outgoing
//! control-frame byte layouts the agent expects.

use bytes::Bytes;

use crate::errors::CoreError;
use crate::framing::{DeviceMessage, Frame, FrameMode, FramingReader};
use crate::types::Codec;

/// Events the Session Manager subscribes to for one device.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Video {
        payload: Bytes,
        is_config: bool,
        is_key: bool,
        width: Option<u32>,
        height: Option<u32>,
        codec: Codec,
    },
    Audio {
        payload: Bytes,
        is_config: bool,
    },
    Status(String),
    Error {
        text: String,
        cause: Option<String>,
    },
    Clipboard(String),
}

enum VideoState {
    AwaitingName,
    AwaitingMeta,
    Streaming { width: u32, height: u32, codec: Codec },
}

/// Parse state machine for the video socket: `DeviceName` →
/// `VideoCodecMeta` → `MediaPacket` loop, with in-loop re-config
/// detection.
pub struct VideoSession {
    reader: FramingReader,
    state: VideoState,
}

impl Default for VideoSession {
    fn default() -> Self {
        Self::new()
    }
}

/// Sanity bound for a re-config candidate's dimensions (spec.md §4.2).
const RECONFIG_DIMENSION_LIMIT: u32 = 10_000;

impl VideoSession {
    pub fn new() -> Self {
        VideoSession {
            reader: FramingReader::new(FrameMode::DeviceName),
            state: VideoState::AwaitingName,
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.reader.feed(data);
    }

    pub fn poll(&mut self) -> Result<Vec<SessionEvent>, CoreError> {
        let mut events = Vec::new();
        while let Some(frame) = self.reader.poll_frame()? {
            match frame {
                Frame::DeviceName(name) => {
                    events.push(SessionEvent::Status(format!("device name: {name}")));
                    self.state = VideoState::AwaitingMeta;
                    self.reader.set_mode(FrameMode::VideoCodecMeta);
                }
                Frame::VideoCodecMeta { codec, width, height } => {
                    events.push(SessionEvent::Video {
                        payload: Bytes::new(),
                        is_config: true,
                        is_key: false,
                        width: Some(width),
                        height: Some(height),
                        codec,
                    });
                    self.state = VideoState::Streaming { width, height, codec };
                    self.reader.set_mode(FrameMode::MediaPacket);
                }
                Frame::MediaPacket(pkt) => {
                    let VideoState::Streaming { width, height, codec } = self.state else {
                        continue;
                    };
                    if pkt.payload.len() == 12 {
                        if let Some((new_codec, new_w, new_h)) = parse_reconfig_candidate(&pkt.payload)
                        {
                            let in_range = new_w < RECONFIG_DIMENSION_LIMIT
                                && new_h < RECONFIG_DIMENSION_LIMIT;
                            let changed = (new_w, new_h) != (width, height);
                            if in_range && changed {
                                events.push(SessionEvent::Video {
                                    payload: Bytes::new(),
                                    is_config: true,
                                    is_key: false,
                                    width: Some(new_w),
                                    height: Some(new_h),
                                    codec: new_codec,
                                });
                                self.state = VideoState::Streaming {
                                    width: new_w,
                                    height: new_h,
                                    codec: new_codec,
                                };
                                continue;
                            }
                        }
                    }
                    events.push(SessionEvent::Video {
                        payload: pkt.payload,
                        is_config: pkt.is_config,
                        is_key: pkt.is_key_frame,
                        width: None,
                        height: None,
                        codec,
                    });
                }
                _ => {}
            }
        }
        Ok(events)
    }
}

fn parse_reconfig_candidate(payload: &Bytes) -> Option<(Codec, u32, u32)> {
    if payload.len() != 12 {
        return None;
    }
    let magic = u32::from_be_bytes(payload[0..4].try_into().ok()?);
    let width = u32::from_be_bytes(payload[4..8].try_into().ok()?);
    let height = u32::from_be_bytes(payload[8..12].try_into().ok()?);
    Some((Codec::from_magic(magic), width, height))
}

enum AudioState {
    AwaitingMeta,
    Streaming,
}

/// Parse state machine for the audio socket: `AudioCodecMeta` →
/// `MediaPacket` loop. Audio frames carry no key-frame semantics.
pub struct AudioSession {
    reader: FramingReader,
    state: AudioState,
}

impl Default for AudioSession {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSession {
    pub fn new() -> Self {
        AudioSession {
            reader: FramingReader::new(FrameMode::AudioCodecMeta),
            state: AudioState::AwaitingMeta,
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.reader.feed(data);
    }

    pub fn poll(&mut self) -> Result<Vec<SessionEvent>, CoreError> {
        let mut events = Vec::new();
        while let Some(frame) = self.reader.poll_frame()? {
            match frame {
                Frame::AudioCodecMeta { .. } => {
                    events.push(SessionEvent::Audio {
                        payload: Bytes::new(),
                        is_config: true,
                    });
                    self.state = AudioState::Streaming;
                    self.reader.set_mode(FrameMode::MediaPacket);
                }
                Frame::MediaPacket(pkt) => {
                    if matches!(self.state, AudioState::Streaming) {
                        events.push(SessionEvent::Audio {
                            payload: pkt.payload,
                            is_config: pkt.is_config,
                        });
                    }
                }
                _ => {}
            }
        }
        Ok(events)
    }
}

/// Incoming side of the control socket: frames the `DeviceMessage`
/// stream and suppresses duplicate clipboard notifications.
pub struct ControlSession {
    reader: FramingReader,
    last_clipboard: Option<String>,
}

impl Default for ControlSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlSession {
    pub fn new() -> Self {
        ControlSession {
            reader: FramingReader::new(FrameMode::DeviceMessage),
            last_clipboard: None,
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.reader.feed(data);
    }

    pub fn poll(&mut self) -> Result<Vec<SessionEvent>, CoreError> {
        let mut events = Vec::new();
        while let Some(Frame::DeviceMessage(msg)) = self.reader.poll_frame()? {
            match msg {
                DeviceMessage::Clipboard(text) => {
                    if self.last_clipboard.as_deref() != Some(text.as_str()) {
                        events.push(SessionEvent::Clipboard(text.clone()));
                        self.last_clipboard = Some(text);
                    }
                }
                DeviceMessage::AckClipboard(_) | DeviceMessage::UhidOutput { .. } => {
                    // Observability only; not surfaced as session events.
                }
                DeviceMessage::Unknown => {}
            }
        }
        Ok(events)
    }
}

// --- Outgoing control frames (host -> device) -----------------------------

const TAG_INJECT_KEYCODE: u8 = 0;
const TAG_INJECT_TEXT: u8 = 1;
const TAG_INJECT_TOUCH: u8 = 2;
const TAG_INJECT_SCROLL: u8 = 3;
const TAG_EXPAND_NOTIFICATION_PANEL: u8 = 5;
const TAG_EXPAND_SETTINGS_PANEL: u8 = 6;
const TAG_COLLAPSE_PANELS: u8 = 7;
const TAG_SET_CLIPBOARD: u8 = 9;
const TAG_ROTATE_DEVICE: u8 = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchAction {
    Down,
    Up,
    Move,
}

impl TouchAction {
    fn code(self) -> u8 {
        match self {
            TouchAction::Down => 0,
            TouchAction::Up => 1,
            TouchAction::Move => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    Down,
    Up,
}

impl KeyAction {
    fn code(self) -> u8 {
        match self {
            KeyAction::Down => 0,
            KeyAction::Up => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanelAction {
    ExpandNotification,
    ExpandSettings,
    Collapse,
}

/// One finger's touch event, projected onto the device's screen
/// coordinates.
pub fn build_touch_event(
    action: TouchAction,
    pointer_id: u64,
    x: i32,
    y: i32,
    screen_w: u16,
    screen_h: u16,
    pressure: f32,
    action_button: u32,
    buttons: u32,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(32);
    buf.push(TAG_INJECT_TOUCH);
    buf.push(action.code());
    buf.extend_from_slice(&pointer_id.to_be_bytes());
    buf.extend_from_slice(&x.to_be_bytes());
    buf.extend_from_slice(&y.to_be_bytes());
    buf.extend_from_slice(&screen_w.to_be_bytes());
    buf.extend_from_slice(&screen_h.to_be_bytes());
    let pressure_u16 = (pressure.clamp(0.0, 1.0) * 65535.0) as u16;
    buf.extend_from_slice(&pressure_u16.to_be_bytes());
    buf.extend_from_slice(&action_button.to_be_bytes());
    buf.extend_from_slice(&buttons.to_be_bytes());
    buf
}

/// Two simultaneous contact points sharing one action and screen size.
pub fn build_multi_touch_event(
    action: TouchAction,
    points: [(u64, i32, i32); 2],
    screen_w: u16,
    screen_h: u16,
) -> [Vec<u8>; 2] {
    [
        build_touch_event(action, points[0].0, points[0].1, points[0].2, screen_w, screen_h, 1.0, 0, 1),
        build_touch_event(action, points[1].0, points[1].1, points[1].2, screen_w, screen_h, 1.0, 0, 1),
    ]
}

pub fn build_scroll_event(
    x: i32,
    y: i32,
    screen_w: u16,
    screen_h: u16,
    hscroll: f32,
    vscroll: f32,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(21);
    buf.push(TAG_INJECT_SCROLL);
    buf.extend_from_slice(&x.to_be_bytes());
    buf.extend_from_slice(&y.to_be_bytes());
    buf.extend_from_slice(&screen_w.to_be_bytes());
    buf.extend_from_slice(&screen_h.to_be_bytes());
    let hs = (hscroll.clamp(-1.0, 1.0) * 32767.0) as i16;
    let vs = (vscroll.clamp(-1.0, 1.0) * 32767.0) as i16;
    buf.extend_from_slice(&hs.to_be_bytes());
    buf.extend_from_slice(&vs.to_be_bytes());
    buf
}

pub fn build_key_event(action: KeyAction, keycode: i32, repeat: u32, metastate: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(14);
    buf.push(TAG_INJECT_KEYCODE);
    buf.push(action.code());
    buf.extend_from_slice(&keycode.to_be_bytes());
    buf.extend_from_slice(&repeat.to_be_bytes());
    buf.extend_from_slice(&metastate.to_be_bytes());
    buf
}

pub fn build_text_event(text: &str) -> Vec<u8> {
    let bytes = text.as_bytes();
    let mut buf = Vec::with_capacity(5 + bytes.len());
    buf.push(TAG_INJECT_TEXT);
    buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    buf.extend_from_slice(bytes);
    buf
}

pub fn build_clipboard_paste_event(sequence: u64, text: &str, paste: bool) -> Vec<u8> {
    let bytes = text.as_bytes();
    let mut buf = Vec::with_capacity(13 + bytes.len());
    buf.push(TAG_SET_CLIPBOARD);
    buf.extend_from_slice(&sequence.to_be_bytes());
    buf.push(u8::from(paste));
    buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    buf.extend_from_slice(bytes);
    buf
}

pub fn build_rotate_device_event() -> Vec<u8> {
    vec![TAG_ROTATE_DEVICE]
}

pub fn build_panel_event(action: PanelAction) -> Vec<u8> {
    vec![match action {
        PanelAction::ExpandNotification => TAG_EXPAND_NOTIFICATION_PANEL,
        PanelAction::ExpandSettings => TAG_EXPAND_SETTINGS_PANEL,
        PanelAction::Collapse => TAG_COLLAPSE_PANELS,
    }]
}
