//! RFC 6184 - RTP Payload Format for H.264 Video
//!
//! Keyframe detection over incoming H.264 RTP payloads: single NAL units,
//! STAP-A/B and MTAP16/24 aggregates, and FU-A/B fragmentation units.
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use crate::error::{MediaCoreError, MediaCoreResult};

/// H.264 NAL Unit Type (from RFC 6184)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalUnitType {
    /// Unspecified
    Unspecified = 0,
    /// Non-IDR coded slice
    NonIdrSlice = 1,
    /// IDR (Instantaneous Decoder Refresh) coded slice
    IdrSlice = 5,
    /// SPS (Sequence Parameter Set)
    Sps = 7,
    /// PPS (Picture Parameter Set)
    Pps = 8,
    /// STAP-A aggregation packet
    StapA = 24,
    /// STAP-B aggregation packet
    StapB = 25,
    /// MTAP16 aggregation packet
    Mtap16 = 26,
    /// MTAP24 aggregation packet
    Mtap24 = 27,
    /// FU-A fragmentation unit
    FuA = 28,
    /// FU-B fragmentation unit
    FuB = 29,
    /// Any other value not specially handled by keyframe detection
    Other(u8),
}

impl NalUnitType {
    /// Parse NAL unit type from a NAL header byte.
    pub fn from_byte(byte: u8) -> Self {
        match byte & 0x1F {
            0 => NalUnitType::Unspecified,
            1 => NalUnitType::NonIdrSlice,
            5 => NalUnitType::IdrSlice,
            7 => NalUnitType::Sps,
            8 => NalUnitType::Pps,
            24 => NalUnitType::StapA,
            25 => NalUnitType::StapB,
            26 => NalUnitType::Mtap16,
            27 => NalUnitType::Mtap24,
            28 => NalUnitType::FuA,
            29 => NalUnitType::FuB,
            n => NalUnitType::Other(n),
        }
    }
}

/// Per-aggregate-type layout for STAP/MTAP sub-NAL-unit walking: how many
/// bytes precede the first length field, and how many bytes sit between a
/// sub-unit's length field and its NAL header.
fn aggregate_layout(nalu: u8) -> Option<(usize, usize)> {
    match nalu {
        24 => Some((1, 0)), // STAP-A: no DON, no offset
        25 => Some((3, 0)), // STAP-B: 2-byte DON prefix
        26 => Some((3, 3)), // MTAP16: 2-byte DON prefix + 2-byte DON-diff + 1-byte TS offset
        27 => Some((3, 4)), // MTAP24: 2-byte DON prefix + 2-byte DON-diff + 2-byte TS offset
        _ => None,
    }
}

/// Detect whether an incoming H.264 RTP payload carries (or fragments) a
/// keyframe-bearing NAL unit (IDR for single/FU units, SPS for aggregates).
pub fn is_keyframe(payload: &[u8]) -> MediaCoreResult<bool> {
    if payload.is_empty() {
        return Err(MediaCoreError::NilPacket);
    }

    let nalu = payload[0] & 0x1F;

    if nalu == 0 {
        return Ok(false);
    }

    if nalu <= 23 {
        return Ok(nalu == 5);
    }

    if let Some((start, aggregate_offset)) = aggregate_layout(nalu) {
        let mut pos = start;
        while pos + 2 <= payload.len() {
            let sub_len = u16::from_be_bytes([payload[pos], payload[pos + 1]]) as usize;
            let header_pos = pos + 2 + aggregate_offset;
            let header_byte = *payload.get(header_pos).ok_or_else(|| {
                MediaCoreError::ShortPacket("STAP/MTAP sub-NAL header out of bounds".into())
            })?;
            if header_byte & 0x1F == 7 {
                return Ok(true);
            }
            pos = pos + 2 + aggregate_offset + sub_len;
        }
        return Ok(false);
    }

    if nalu == 28 || nalu == 29 {
        let fu_header = *payload
            .get(1)
            .ok_or_else(|| MediaCoreError::ShortPacket("FU header out of bounds".into()))?;
        let start_bit = (fu_header & 0x80) != 0;
        let inner_type = fu_header & 0x1F;
        return Ok(start_bit && inner_type == 7);
    }

    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unspecified_is_never_keyframe() {
        assert_eq!(is_keyframe(&[0x00]).unwrap(), false);
    }

    #[test]
    fn idr_slice_is_keyframe() {
        assert_eq!(is_keyframe(&[0x65, 0x88, 0x84]).unwrap(), true);
    }

    #[test]
    fn non_idr_slice_is_not_keyframe() {
        assert_eq!(is_keyframe(&[0x41, 0x9A]).unwrap(), false);
    }

    #[test]
    fn stap_a_with_sps_is_keyframe() {
        // STAP-A: [nalu=24][len=3][SPS header 0x67 + 2 bytes]
        let payload = [24, 0x00, 0x03, 0x67, 0xAA, 0xBB];
        assert_eq!(is_keyframe(&payload).unwrap(), true);
    }

    #[test]
    fn stap_a_without_sps_is_not_keyframe() {
        // STAP-A containing only a non-IDR slice (type 1)
        let payload = [24, 0x00, 0x02, 0x41, 0xAA];
        assert_eq!(is_keyframe(&payload).unwrap(), false);
    }

    #[test]
    fn mtap16_with_sps_is_keyframe() {
        // MTAP16: [nalu=26][2-byte DON][2-byte len][2-byte DON-diff][1-byte TS][SPS hdr]
        let payload = [26, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x07, 0xAA];
        assert_eq!(is_keyframe(&payload).unwrap(), true);
    }

    #[test]
    fn fu_a_start_with_sps_inner_type_is_keyframe() {
        // FU indicator + FU header: S=1, type=7 (SPS)
        let payload = [28, 0x80 | 7, 0xAA];
        assert_eq!(is_keyframe(&payload).unwrap(), true);
    }

    #[test]
    fn fu_a_start_with_idr_inner_type_is_not_keyframe() {
        // The fragmentation branch only treats inner type 7 (SPS) as keyframe.
        let payload = [28, 0x80 | 5, 0xAA];
        assert_eq!(is_keyframe(&payload).unwrap(), false);
    }

    #[test]
    fn fu_a_continuation_is_not_keyframe() {
        let payload = [28, 0x00 | 7, 0xAA]; // start bit clear
        assert_eq!(is_keyframe(&payload).unwrap(), false);
    }

    #[test]
    fn truncated_stap_a_is_short_packet() {
        let payload = [24, 0x00, 0xFF]; // claims a length that runs past the buffer
        assert!(matches!(
            is_keyframe(&payload),
            Err(MediaCoreError::ShortPacket(_))
        ));
    }

    #[test]
    fn empty_payload_is_nil_packet() {
        assert!(matches!(is_keyframe(&[]), Err(MediaCoreError::NilPacket)));
    }
}
