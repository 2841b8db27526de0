//! Mode-driven byte-stream framing.
//!
//! The reader owns a growable buffer and a head cursor (mirroring the
//! fixed-header-then-length-prefixed-payload decode pattern used for the
//! tunnel's frame packets); callers tell it what shape to expect next via
//! [`FramingReader::set_mode`] and pull frames with
//! [`FramingReader::poll_frame`]. A partial frame never consumes bytes and
//! never changes the mode.

use bytes::Bytes;

use crate::errors::{CoreError, FramingError};
use crate::types::Codec;

const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;
const COMPACT_THRESHOLD: usize = 1024 * 1024;

/// What shape of frame the reader should look for next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameMode {
    DeviceName,
    VideoCodecMeta,
    AudioCodecMeta,
    MediaPacket,
    DeviceMessage,
}

/// Inner payload of a `DeviceMessage` frame (control socket, incoming).
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceMessage {
    Clipboard(String),
    AckClipboard(u64),
    UhidOutput { id: u16, data: Bytes },
    /// Unrecognized tag; one byte was skipped per the forward-compat rule.
    Unknown,
}

/// A decoded media packet (video or audio socket, `MediaPacket` mode).
#[derive(Debug, Clone, PartialEq)]
pub struct MediaPacket {
    pub pts_raw: u64,
    pub is_config: bool,
    pub is_key_frame: bool,
    pub pts: Option<u64>,
    pub payload: Bytes,
}

const PTS_MASK: u64 = (1u64 << 62) - 1;
const CONFIG_BIT: u64 = 1u64 << 63;
const KEY_FRAME_BIT: u64 = 1u64 << 62;

impl MediaPacket {
    fn decode(pts_raw: u64, payload: Bytes) -> Self {
        let pts_value = pts_raw & PTS_MASK;
        let pts = if pts_value == PTS_MASK {
            None
        } else {
            Some(pts_value)
        };
        MediaPacket {
            pts_raw,
            is_config: pts_raw & CONFIG_BIT != 0,
            is_key_frame: pts_raw & KEY_FRAME_BIT != 0,
            pts,
            payload,
        }
    }
}

/// One complete frame pulled off the stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    DeviceName(String),
    VideoCodecMeta { codec: Codec, width: u32, height: u32 },
    AudioCodecMeta { codec: Codec },
    MediaPacket(MediaPacket),
    DeviceMessage(DeviceMessage),
}

/// Accumulates bytes from one socket and hands out complete frames in
/// arrival order, never re-reading a byte.
pub struct FramingReader {
    buf: Vec<u8>,
    head: usize,
    mode: FrameMode,
}

impl FramingReader {
    pub fn new(initial_mode: FrameMode) -> Self {
        FramingReader {
            buf: Vec::new(),
            head: 0,
            mode: initial_mode,
        }
    }

    pub fn set_mode(&mut self, mode: FrameMode) {
        self.mode = mode;
    }

    pub fn mode(&self) -> FrameMode {
        self.mode
    }

    /// Append freshly-read bytes from the socket.
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    fn remaining(&self) -> &[u8] {
        &self.buf[self.head..]
    }

    fn consume(&mut self, n: usize) {
        self.head += n;
        if self.head >= COMPACT_THRESHOLD && self.head == self.buf.len() {
            self.buf.clear();
            self.head = 0;
        } else if self.head >= COMPACT_THRESHOLD {
            self.buf.drain(0..self.head);
            self.head = 0;
        }
    }

    /// Attempt to decode the next frame in the current mode. Returns
    /// `Ok(None)` when the buffer does not yet hold a complete frame; the
    /// buffer and mode are left untouched in that case.
    pub fn poll_frame(&mut self) -> Result<Option<Frame>, CoreError> {
        match self.mode {
            FrameMode::DeviceName => self.poll_device_name(),
            FrameMode::VideoCodecMeta => self.poll_video_codec_meta(),
            FrameMode::AudioCodecMeta => self.poll_audio_codec_meta(),
            FrameMode::MediaPacket => self.poll_media_packet(),
            FrameMode::DeviceMessage => self.poll_device_message(),
        }
    }

    fn poll_device_name(&mut self) -> Result<Option<Frame>, CoreError> {
        const LEN: usize = 64;
        if self.remaining().len() < LEN {
            return Ok(None);
        }
        let raw = &self.remaining()[..LEN];
        let nul_pos = raw.iter().position(|&b| b == 0).unwrap_or(LEN);
        let name = String::from_utf8_lossy(&raw[..nul_pos]).into_owned();
        self.consume(LEN);
        Ok(Some(Frame::DeviceName(name)))
    }

    fn poll_video_codec_meta(&mut self) -> Result<Option<Frame>, CoreError> {
        const LEN: usize = 12;
        if self.remaining().len() < LEN {
            return Ok(None);
        }
        let raw = &self.remaining()[..LEN];
        let codec_magic = be_u32(&raw[0..4]);
        let width = be_u32(&raw[4..8]);
        let height = be_u32(&raw[8..12]);
        self.consume(LEN);
        Ok(Some(Frame::VideoCodecMeta {
            codec: Codec::from_magic(codec_magic),
            width,
            height,
        }))
    }

    fn poll_audio_codec_meta(&mut self) -> Result<Option<Frame>, CoreError> {
        const LEN: usize = 4;
        if self.remaining().len() < LEN {
            return Ok(None);
        }
        let codec_magic = be_u32(&self.remaining()[..LEN]);
        self.consume(LEN);
        Ok(Some(Frame::AudioCodecMeta {
            codec: Codec::from_magic(codec_magic),
        }))
    }

    fn poll_media_packet(&mut self) -> Result<Option<Frame>, CoreError> {
        const HEADER_LEN: usize = 12;
        if self.remaining().len() < HEADER_LEN {
            return Ok(None);
        }
        let header = &self.remaining()[..HEADER_LEN];
        let pts_raw = be_u64(&header[0..8]);
        let length = be_u32(&header[8..12]) as usize;
        if length > MAX_FRAME_BYTES {
            return Err(FramingError::FrameTooLarge(length).into());
        }
        let total = HEADER_LEN + length;
        if self.remaining().len() < total {
            return Ok(None);
        }
        let payload = Bytes::copy_from_slice(&self.remaining()[HEADER_LEN..total]);
        self.consume(total);
        Ok(Some(Frame::MediaPacket(MediaPacket::decode(
            pts_raw, payload,
        ))))
    }

    fn poll_device_message(&mut self) -> Result<Option<Frame>, CoreError> {
        let buf = self.remaining();
        if buf.is_empty() {
            return Ok(None);
        }
        let tag = buf[0];
        match tag {
            0 => {
                // CLIPBOARD: { text_len: u32, utf8 bytes }
                if buf.len() < 5 {
                    return Ok(None);
                }
                let text_len = be_u32(&buf[1..5]) as usize;
                let total = 5 + text_len;
                if buf.len() < total {
                    return Ok(None);
                }
                let text = String::from_utf8(buf[5..total].to_vec())
                    .map_err(|e| FramingError::MalformedCodecMeta(e.to_string()))?;
                self.consume(total);
                Ok(Some(Frame::DeviceMessage(DeviceMessage::Clipboard(text))))
            }
            1 => {
                // ACK_CLIPBOARD: { sequence: u64 }
                if buf.len() < 9 {
                    return Ok(None);
                }
                let sequence = be_u64(&buf[1..9]);
                self.consume(9);
                Ok(Some(Frame::DeviceMessage(DeviceMessage::AckClipboard(
                    sequence,
                ))))
            }
            2 => {
                // UHID_OUTPUT: { id: u16, data_len: u16, bytes }
                if buf.len() < 5 {
                    return Ok(None);
                }
                let id = be_u16(&buf[1..3]);
                let data_len = be_u16(&buf[3..5]) as usize;
                let total = 5 + data_len;
                if buf.len() < total {
                    return Ok(None);
                }
                let data = Bytes::copy_from_slice(&buf[5..total]);
                self.consume(total);
                Ok(Some(Frame::DeviceMessage(DeviceMessage::UhidOutput {
                    id,
                    data,
                })))
            }
            _ => {
                // Unrecognized tag: skip one byte and continue, lenient
                // to forward-compat extensions.
                self.consume(1);
                Ok(Some(Frame::DeviceMessage(DeviceMessage::Unknown)))
            }
        }
    }
}

fn be_u16(b: &[u8]) -> u16 {
    u16::from_be_bytes([b[0], b[1]])
}

fn be_u32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

fn be_u64(b: &[u8]) -> u64 {
    u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_name_trims_nul_padding() {
        let mut reader = FramingReader::new(FrameMode::DeviceName);
        let mut raw = vec![0u8; 64];
        raw[..7].copy_from_slice(b"Pixel 8");
        reader.feed(&raw);
        let frame = reader.poll_frame().unwrap().unwrap();
        assert_eq!(frame, Frame::DeviceName("Pixel 8".to_string()));
    }

    #[test]
    fn video_codec_meta_parses_known_magic() {
        let mut reader = FramingReader::new(FrameMode::VideoCodecMeta);
        let mut raw = Vec::new();
        raw.extend_from_slice(&0x6832_3634u32.to_be_bytes());
        raw.extend_from_slice(&1920u32.to_be_bytes());
        raw.extend_from_slice(&1080u32.to_be_bytes());
        reader.feed(&raw);
        let frame = reader.poll_frame().unwrap().unwrap();
        assert_eq!(
            frame,
            Frame::VideoCodecMeta {
                codec: Codec::H264,
                width: 1920,
                height: 1080
            }
        );
    }

    #[test]
    fn partial_frame_leaves_buffer_and_mode_untouched() {
        let mut reader = FramingReader::new(FrameMode::AudioCodecMeta);
        reader.feed(&[0x00, 0x61]);
        assert_eq!(reader.poll_frame().unwrap(), None);
        assert_eq!(reader.mode(), FrameMode::AudioCodecMeta);
        reader.feed(&[0x76, 0x31]);
        let frame = reader.poll_frame().unwrap().unwrap();
        assert_eq!(
            frame,
            Frame::AudioCodecMeta {
                codec: Codec::Av1
            }
        );
    }

    #[test]
    fn media_packet_decodes_flags_and_pts() {
        let mut reader = FramingReader::new(FrameMode::MediaPacket);
        let pts_raw = CONFIG_BIT | KEY_FRAME_BIT | 42;
        let mut raw = Vec::new();
        raw.extend_from_slice(&pts_raw.to_be_bytes());
        raw.extend_from_slice(&3u32.to_be_bytes());
        raw.extend_from_slice(&[1, 2, 3]);
        reader.feed(&raw);
        let frame = reader.poll_frame().unwrap().unwrap();
        match frame {
            Frame::MediaPacket(pkt) => {
                assert!(pkt.is_config);
                assert!(pkt.is_key_frame);
                assert_eq!(pkt.pts, Some(42));
                assert_eq!(&pkt.payload[..], &[1, 2, 3]);
            }
            _ => panic!("expected MediaPacket"),
        }
    }

    #[test]
    fn media_packet_no_pts_sentinel() {
        let mut reader = FramingReader::new(FrameMode::MediaPacket);
        let pts_raw = PTS_MASK;
        let mut raw = Vec::new();
        raw.extend_from_slice(&pts_raw.to_be_bytes());
        raw.extend_from_slice(&0u32.to_be_bytes());
        reader.feed(&raw);
        let frame = reader.poll_frame().unwrap().unwrap();
        match frame {
            Frame::MediaPacket(pkt) => {
                assert_eq!(pkt.pts, None);
                assert!(pkt.payload.is_empty());
            }
            _ => panic!("expected MediaPacket"),
        }
    }

    #[test]
    fn oversized_frame_is_fatal() {
        let mut reader = FramingReader::new(FrameMode::MediaPacket);
        let mut raw = Vec::new();
        raw.extend_from_slice(&0u64.to_be_bytes());
        raw.extend_from_slice(&(MAX_FRAME_BYTES as u32 + 1).to_be_bytes());
        reader.feed(&raw);
        let err = reader.poll_frame().unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::ProtocolViolation);
    }

    #[test]
    fn device_message_clipboard_suppressed_duplicate_is_caller_concern() {
        let mut reader = FramingReader::new(FrameMode::DeviceMessage);
        let mut raw = vec![0u8]; // tag CLIPBOARD
        raw.extend_from_slice(&5u32.to_be_bytes());
        raw.extend_from_slice(b"hello");
        reader.feed(&raw);
        let frame = reader.poll_frame().unwrap().unwrap();
        assert_eq!(
            frame,
            Frame::DeviceMessage(DeviceMessage::Clipboard("hello".to_string()))
        );
    }

    #[test]
    fn device_message_unknown_tag_skips_one_byte() {
        let mut reader = FramingReader::new(FrameMode::DeviceMessage);
        reader.feed(&[0xFF, 0x00, 0x61]); // unknown tag, then ACK_CLIPBOARD tag start
        let frame = reader.poll_frame().unwrap().unwrap();
        assert_eq!(frame, Frame::DeviceMessage(DeviceMessage::Unknown));
        assert_eq!(reader.remaining(), &[0x00, 0x61]);
    }

    #[test]
    fn byte_splitting_invariance() {
        let mut whole = Vec::new();
        whole.extend_from_slice(&0x6832_3634u32.to_be_bytes());
        whole.extend_from_slice(&640u32.to_be_bytes());
        whole.extend_from_slice(&480u32.to_be_bytes());

        let mut unsplit = FramingReader::new(FrameMode::VideoCodecMeta);
        unsplit.feed(&whole);
        let expected = unsplit.poll_frame().unwrap().unwrap();

        for chunk_size in 1..=whole.len() {
            let mut reader = FramingReader::new(FrameMode::VideoCodecMeta);
            let mut got = None;
            for chunk in whole.chunks(chunk_size) {
                reader.feed(chunk);
                if let Some(frame) = reader.poll_frame().unwrap() {
                    got = Some(frame);
                }
            }
            assert_eq!(got, Some(expected.clone()), "chunk_size={chunk_size}");
        }
    }
}
