//! Small protocol and device-property helpers (C8): codec-magic
//! recognition from raw bitstream bytes, a key-frame sniffer, an H.264
//! SPS dimension parser, and the parallel device-property probe used to
//! assemble a [`DeviceDetails`].

use std::time::{SystemTime, UNIX_EPOCH};

use tracing::warn;

use crate::adb::{AdbTool, METADATA_TIMEOUT};
use crate::types::{Codec, DeviceDetails};

/// Locate Annex-B start codes (3- or 4-byte `00 00 01`) and return the
/// byte ranges between them, i.e. one NAL/OBU unit per slice, header byte
/// included.
fn nal_units(data: &[u8]) -> Vec<&[u8]> {
    let mut boundaries = Vec::new();
    let mut i = 0;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            boundaries.push((i, i + 3));
            i += 3;
            continue;
        }
        if i + 4 <= data.len() && data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 0 && data[i + 3] == 1
        {
            boundaries.push((i, i + 4));
            i += 4;
            continue;
        }
        i += 1;
    }
    let mut units = Vec::with_capacity(boundaries.len());
    for (idx, &(_, payload_start)) in boundaries.iter().enumerate() {
        let end = boundaries
            .get(idx + 1)
            .map(|&(next_code_start, _)| next_code_start)
            .unwrap_or(data.len());
        if payload_start < end {
            units.push(&data[payload_start..end]);
        }
    }
    units
}

/// Classify a bitstream chunk by inspecting the first NAL/OBU header byte
/// after the first start code.
pub fn sniff_codec(payload: &[u8]) -> Option<Codec> {
    let units = nal_units(payload);
    let header = *units.first()?.first()?;

    let h264_type = header & 0x1F;
    if (1..=9).contains(&h264_type) {
        return Some(Codec::H264);
    }

    let h265_type = (header >> 1) & 0x3F;
    if matches!(h265_type, 32 | 33 | 34) {
        return Some(Codec::H265);
    }

    let forbidden_bit = header & 0x80;
    let obu_type = (header >> 3) & 0x0F;
    if forbidden_bit == 0 && (1..=8).contains(&obu_type) {
        return Some(Codec::Av1);
    }

    None
}

/// H.264 NAL type 5 (IDR) or H.265 NAL types 19/20; AV1 is never
/// classified here.
pub fn is_key_frame(codec: Codec, payload: &[u8]) -> bool {
    match codec {
        Codec::H264 => nal_units(payload)
            .iter()
            .any(|u| u.first().map(|b| b & 0x1F == 5).unwrap_or(false)),
        Codec::H265 => nal_units(payload).iter().any(|u| {
            u.first()
                .map(|b| matches!((b >> 1) & 0x3F, 19 | 20))
                .unwrap_or(false)
        }),
        Codec::Av1 => false,
    }
}

fn unescape_rbsp(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut zero_run = 0u8;
    for &b in data {
        if zero_run >= 2 && b == 0x03 {
            zero_run = 0;
            continue;
        }
        out.push(b);
        zero_run = if b == 0 { zero_run + 1 } else { 0 };
    }
    out
}

struct BitReader<'a> {
    data: &'a [u8],
    bit_pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        BitReader { data, bit_pos: 0 }
    }

    fn read_bit(&mut self) -> Option<u64> {
        let byte_idx = self.bit_pos / 8;
        if byte_idx >= self.data.len() {
            return None;
        }
        let bit_idx = 7 - (self.bit_pos % 8);
        let bit = (self.data[byte_idx] >> bit_idx) & 1;
        self.bit_pos += 1;
        Some(bit as u64)
    }

    fn read_bits(&mut self, n: u32) -> Option<u64> {
        let mut v = 0u64;
        for _ in 0..n {
            v = (v << 1) | self.read_bit()?;
        }
        Some(v)
    }

    /// Exp-Golomb unsigned code (`ue(v)`).
    fn read_ue(&mut self) -> Option<u64> {
        let mut zeros = 0u32;
        while self.read_bit()? == 0 {
            zeros += 1;
            if zeros > 32 {
                return None;
            }
        }
        if zeros == 0 {
            return Some(0);
        }
        let suffix = self.read_bits(zeros)?;
        Some((1u64 << zeros) - 1 + suffix)
    }

    /// Exp-Golomb signed code (`se(v)`).
    fn read_se(&mut self) -> Option<i64> {
        let code = self.read_ue()?;
        let magnitude = ((code + 1) / 2) as i64;
        Some(if code % 2 == 0 { -magnitude } else { magnitude })
    }
}

const HIGH_PROFILES_WITH_CHROMA_INFO: &[u64] =
    &[100, 110, 122, 244, 44, 83, 86, 118, 128, 138, 139, 134, 135];

/// Locate the first SPS (NAL type 7) and decode `pic_width_in_mbs` /
/// `pic_height_in_map_units`, applying cropping. Returns `None` on any
/// parse error rather than panicking; scaling-list support is not
/// implemented, so SPS that set `seq_scaling_matrix_present_flag` also
/// return `None`.
pub fn parse_h264_sps_dimensions(payload: &[u8]) -> Option<(u32, u32)> {
    let units = nal_units(payload);
    let sps = units.iter().find(|u| u.first().map(|b| b & 0x1F == 7).unwrap_or(false))?;
    if sps.len() < 2 {
        return None;
    }
    let rbsp = unescape_rbsp(&sps[1..]);
    let mut r = BitReader::new(&rbsp);

    let profile_idc = r.read_bits(8)?;
    let _constraint_flags = r.read_bits(8)?;
    let _level_idc = r.read_bits(8)?;
    let _sps_id = r.read_ue()?;

    if HIGH_PROFILES_WITH_CHROMA_INFO.contains(&profile_idc) {
        let chroma_format_idc = r.read_ue()?;
        if chroma_format_idc == 3 {
            let _separate_colour_plane_flag = r.read_bits(1)?;
        }
        let _bit_depth_luma_minus8 = r.read_ue()?;
        let _bit_depth_chroma_minus8 = r.read_ue()?;
        let _qpprime_y_zero_transform_bypass_flag = r.read_bits(1)?;
        let seq_scaling_matrix_present_flag = r.read_bits(1)?;
        if seq_scaling_matrix_present_flag == 1 {
            return None;
        }
    }

    let _log2_max_frame_num_minus4 = r.read_ue()?;
    let pic_order_cnt_type = r.read_ue()?;
    if pic_order_cnt_type == 0 {
        let _log2_max_pic_order_cnt_lsb_minus4 = r.read_ue()?;
    } else if pic_order_cnt_type == 1 {
        let _delta_pic_order_always_zero_flag = r.read_bits(1)?;
        let _offset_for_non_ref_pic = r.read_se()?;
        let _offset_for_top_to_bottom_field = r.read_se()?;
        let num_ref_frames_in_pic_order_cnt_cycle = r.read_ue()?;
        for _ in 0..num_ref_frames_in_pic_order_cnt_cycle {
            let _ = r.read_se()?;
        }
    }

    let _max_num_ref_frames = r.read_ue()?;
    let _gaps_in_frame_num_value_allowed_flag = r.read_bits(1)?;
    let pic_width_in_mbs_minus1 = r.read_ue()?;
    let pic_height_in_map_units_minus1 = r.read_ue()?;
    let frame_mbs_only_flag = r.read_bits(1)?;
    if frame_mbs_only_flag == 0 {
        let _mb_adaptive_frame_field_flag = r.read_bits(1)?;
    }
    let _direct_8x8_inference_flag = r.read_bits(1)?;
    let frame_cropping_flag = r.read_bits(1)?;

    let (mut crop_left, mut crop_right, mut crop_top, mut crop_bottom) = (0u64, 0u64, 0u64, 0u64);
    if frame_cropping_flag == 1 {
        crop_left = r.read_ue()?;
        crop_right = r.read_ue()?;
        crop_top = r.read_ue()?;
        crop_bottom = r.read_ue()?;
    }

    let width_mbs = pic_width_in_mbs_minus1 + 1;
    let height_map_units = pic_height_in_map_units_minus1 + 1;
    let frame_height_in_mbs = (2 - frame_mbs_only_flag) * height_map_units;

    let crop_unit_x = 2u64;
    let crop_unit_y = 2 * (2 - frame_mbs_only_flag);

    let width = width_mbs * 16 - crop_unit_x * (crop_left + crop_right);
    let height = frame_height_in_mbs * 16 - crop_unit_y * (crop_top + crop_bottom);

    Some((width as u32, height as u32))
}

/// Parse a `df`-style size with an optional K/M/G suffix into bytes.
pub fn parse_storage_suffix(s: &str) -> Option<u64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let (num_part, multiplier) = match s.chars().last()? {
        'K' | 'k' => (&s[..s.len() - 1], 1024u64),
        'M' | 'm' => (&s[..s.len() - 1], 1024 * 1024),
        'G' | 'g' => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        _ => (s, 1),
    };
    let value: f64 = num_part.parse().ok()?;
    Some((value * multiplier as f64) as u64)
}

fn now_since_epoch() -> std::time::Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

/// Run the fixed set of read-only property queries against `serial` in
/// parallel; any individual query failing falls back to an "Unknown"
/// slot rather than failing the whole probe.
pub async fn probe_device_details(adb: &AdbTool, serial: &str) -> DeviceDetails {
    let (model, manufacturer, os_version, sdk_level, battery, storage, resolution) = tokio::join!(
        query_prop(adb, serial, "ro.product.model"),
        query_prop(adb, serial, "ro.product.manufacturer"),
        query_prop(adb, serial, "ro.build.version.release"),
        query_prop(adb, serial, "ro.build.version.sdk"),
        query_battery(adb, serial),
        query_storage(adb, serial),
        query_resolution(adb, serial),
    );

    DeviceDetails {
        model: model.unwrap_or_else(|| "Unknown".into()),
        manufacturer: manufacturer.unwrap_or_else(|| "Unknown".into()),
        os_version: os_version.unwrap_or_else(|| "Unknown".into()),
        sdk_level: sdk_level.unwrap_or_else(|| "Unknown".into()),
        battery_level: battery.as_ref().map(|(level, _)| *level),
        battery_charging: battery.map(|(_, charging)| charging),
        storage_total_bytes: storage.as_ref().map(|(total, _)| *total),
        storage_used_bytes: storage.map(|(_, used)| used),
        screen_width: resolution.as_ref().map(|(w, _)| *w),
        screen_height: resolution.map(|(_, h)| h),
        ip_address: None,
        fetched_at: now_since_epoch(),
    }
}

async fn query_prop(adb: &AdbTool, serial: &str, prop: &str) -> Option<String> {
    match adb.shell(serial, &["getprop", prop], METADATA_TIMEOUT).await {
        Ok(out) => {
            let trimmed = out.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        Err(e) => {
            warn!(serial, prop, error = %e, "device property query failed");
            None
        }
    }
}

async fn query_battery(adb: &AdbTool, serial: &str) -> Option<(u32, bool)> {
    let out = adb
        .shell(serial, &["dumpsys", "battery"], METADATA_TIMEOUT)
        .await
        .map_err(|e| warn!(serial, error = %e, "battery query failed"))
        .ok()?;

    let mut level = None;
    let mut charging = None;
    for line in out.lines() {
        let line = line.trim();
        if let Some(v) = line.strip_prefix("level:") {
            level = v.trim().parse().ok();
        } else if let Some(v) = line.strip_prefix("AC powered:") {
            charging = Some(v.trim() == "true");
        } else if let Some(v) = line.strip_prefix("USB powered:") {
            if charging != Some(true) {
                charging = Some(v.trim() == "true");
            }
        }
    }
    Some((level?, charging.unwrap_or(false)))
}

async fn query_storage(adb: &AdbTool, serial: &str) -> Option<(u64, u64)> {
    let out = adb
        .shell(serial, &["df", "/data"], METADATA_TIMEOUT)
        .await
        .map_err(|e| warn!(serial, error = %e, "storage query failed"))
        .ok()?;
    let line = out.lines().nth(1)?;
    let cols: Vec<&str> = line.split_whitespace().collect();
    if cols.len() < 3 {
        return None;
    }
    let total = parse_storage_suffix(cols[1])?;
    let used = parse_storage_suffix(cols[2])?;
    Some((total, used))
}

async fn query_resolution(adb: &AdbTool, serial: &str) -> Option<(u32, u32)> {
    let out = adb
        .shell(serial, &["wm", "size"], METADATA_TIMEOUT)
        .await
        .map_err(|e| warn!(serial, error = %e, "resolution query failed"))
        .ok()?;
    let dims = out.rsplit(':').next()?.trim();
    let mut parts = dims.split('x');
    let w: u32 = parts.next()?.trim().parse().ok()?;
    let h: u32 = parts.next()?.trim().parse().ok()?;
    Some((w, h))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h264_idr_nal() -> Vec<u8> {
        let mut data = vec![0, 0, 0, 1];
        data.push(0x65); // nal_ref_idc=3, nal_unit_type=5 (IDR)
        data.extend_from_slice(&[0xAA, 0xBB]);
        data
    }

    #[test]
    fn sniffs_h264_from_idr_nal() {
        assert_eq!(sniff_codec(&h264_idr_nal()), Some(Codec::H264));
    }

    #[test]
    fn recognizes_h264_key_frame() {
        assert!(is_key_frame(Codec::H264, &h264_idr_nal()));
    }

    #[test]
    fn non_idr_h264_is_not_key_frame() {
        let mut data = vec![0, 0, 0, 1];
        data.push(0x61); // nal_unit_type=1, non-IDR slice
        assert!(!is_key_frame(Codec::H264, &data));
    }

    #[test]
    fn av1_never_classified_as_key_frame() {
        assert!(!is_key_frame(Codec::Av1, &[0, 0, 0, 1, 0x0A]));
    }

    #[test]
    fn storage_suffix_parsing() {
        assert_eq!(parse_storage_suffix("512K"), Some(512 * 1024));
        assert_eq!(parse_storage_suffix("2.5M"), Some((2.5 * 1024.0 * 1024.0) as u64));
        assert_eq!(parse_storage_suffix("1G"), Some(1024 * 1024 * 1024));
        assert_eq!(parse_storage_suffix("100"), Some(100));
        assert_eq!(parse_storage_suffix(""), None);
    }

    #[test]
    fn malformed_sps_returns_none_without_panicking() {
        let garbage = vec![0, 0, 0, 1, 0x67, 0xFF, 0xFF];
        assert_eq!(parse_h264_sps_dimensions(&garbage), None);
    }

    #[test]
    fn bit_reader_exp_golomb_roundtrip() {
        // ue(v) codeword for value 4 is "00101" (5 bits).
        let mut r = BitReader::new(&[0b0010_1000]);
        assert_eq!(r.read_ue(), Some(4));
    }
}
