//! RFC 7741 - RTP Payload Format for VP8 Video
//!
//! Parses the VP8 payload descriptor far enough to recover the temporal
//! layer id and detect keyframes; this engine never re-packetizes VP8 for
//! sending, only ingests it.
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

/// Parsed VP8 payload descriptor (RFC 7741 Section 4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Vp8Descriptor {
    /// Extended control bits (X) were present.
    pub extended: bool,
    /// Non-reference frame (N).
    pub non_reference: bool,
    /// Start of VP8 partition (S).
    pub start_of_partition: bool,
    /// Partition index (4 bits).
    pub partition_index: u8,
    /// Picture id, if the I bit was set. 7 or 15 bits depending on `picture_id_m_bit`.
    pub picture_id: Option<u16>,
    /// Whether the picture id used the 2-byte (15-bit) form.
    pub picture_id_m_bit: bool,
    /// TL0PICIDX, if the L bit was set.
    pub tl0_pic_idx: Option<u8>,
    /// Temporal layer id, present whenever either the T or K bit was set.
    /// Both bits share the same byte and the same top-two-bit field; this
    /// descriptor does not distinguish which of the two (or both) were set.
    pub tid: Option<u8>,
    /// Key index (bottom 5 bits of the T/K byte), present under the same
    /// condition as `tid`.
    pub key_idx: Option<u8>,
    /// True iff this packet starts a keyframe (payload header's P bit clear
    /// and `start_of_partition` set).
    pub is_keyframe: bool,
}

impl Vp8Descriptor {
    /// Parse a VP8 RTP payload's descriptor.
    pub fn parse(payload: &[u8]) -> MediaCoreResult<Self> {
        if payload.is_empty() {
            return Err(MediaCoreError::NilPacket);
        }

        let byte0 = payload[0];
        let extended = (byte0 & 0x80) != 0;
        let non_reference = (byte0 & 0x20) != 0;
        let start_of_partition = (byte0 & 0x10) != 0;
        let partition_index = byte0 & 0x0F;

        let mut desc = Vp8Descriptor {
            extended,
            non_reference,
            start_of_partition,
            partition_index,
            ..Default::default()
        };

        let mut pos = 1usize;

        if extended {
            let ext_byte = *payload
                .get(pos)
                .ok_or_else(|| MediaCoreError::ShortPacket("missing VP8 extension byte".into()))?;
            pos += 1;

            let i_bit = (ext_byte & 0x80) != 0;
            let l_bit = (ext_byte & 0x40) != 0;
            let t_bit = (ext_byte & 0x20) != 0;
            let k_bit = (ext_byte & 0x10) != 0;

            if i_bit {
                let first = *payload
                    .get(pos)
                    .ok_or_else(|| MediaCoreError::ShortPacket("missing VP8 picture id".into()))?;
                let m_bit = (first & 0x80) != 0;
                desc.picture_id_m_bit = m_bit;
                if m_bit {
                    if payload.len() < pos + 2 {
                        return Err(MediaCoreError::ShortPacket(
                            "truncated 2-byte VP8 picture id".into(),
                        ));
                    }
                    let pic_id =
                        (((first & 0x7F) as u16) << 8) | payload[pos + 1] as u16;
                    desc.picture_id = Some(pic_id);
                    pos += 2;
                } else {
                    desc.picture_id = Some((first & 0x7F) as u16);
                    pos += 1;
                }
            }

            if l_bit {
                let tl0 = *payload
                    .get(pos)
                    .ok_or_else(|| MediaCoreError::ShortPacket("missing VP8 TL0PICIDX".into()))?;
                desc.tl0_pic_idx = Some(tl0);
                pos += 1;
            }

            if t_bit || k_bit {
                // T and K share a single byte: top two bits are the temporal
                // layer id regardless of which of the two flags is set.
                let tk_byte = *payload
                    .get(pos)
                    .ok_or_else(|| MediaCoreError::ShortPacket("missing VP8 TID/KEYIDX byte".into()))?;
                desc.tid = Some((tk_byte >> 6) & 0x03);
                desc.key_idx = Some(tk_byte & 0x1F);
                pos += 1;
            }
        }

        let header_byte = *payload
            .get(pos)
            .ok_or_else(|| MediaCoreError::ShortPacket("missing VP8 payload header".into()))?;
        desc.is_keyframe = (header_byte & 0x01) == 0 && start_of_partition;

        Ok(desc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_keyframe_no_extension() {
        // X=0 S=1, payload header P=0 (keyframe)
        let payload = [0x10, 0x00];
        let desc = Vp8Descriptor::parse(&payload).unwrap();
        assert!(!desc.extended);
        assert!(desc.start_of_partition);
        assert!(desc.is_keyframe);
    }

    #[test]
    fn simple_interframe_no_extension() {
        // payload header P=1 (not keyframe)
        let payload = [0x10, 0x01];
        let desc = Vp8Descriptor::parse(&payload).unwrap();
        assert!(!desc.is_keyframe);
    }

    #[test]
    fn extended_with_one_byte_picture_id() {
        // X=1 S=1; ext byte: I=1 only; picture id 1 byte, m=0
        let payload = [0x90, 0x80, 0x2A, 0x00];
        let desc = Vp8Descriptor::parse(&payload).unwrap();
        assert!(desc.extended);
        assert!(!desc.picture_id_m_bit);
        assert_eq!(desc.picture_id, Some(0x2A));
        assert!(desc.is_keyframe);
    }

    #[test]
    fn extended_with_two_byte_picture_id() {
        // picture id byte has m-bit set -> 2-byte form
        let payload = [0x90, 0x80, 0x80 | 0x01, 0xFF, 0x00];
        let desc = Vp8Descriptor::parse(&payload).unwrap();
        assert!(desc.picture_id_m_bit);
        assert_eq!(desc.picture_id, Some((0x01u16 << 8) | 0xFF));
    }

    #[test]
    fn extended_with_tl0_and_tid() {
        // ext byte: L=1, T=1
        let ext_byte = 0x40 | 0x20;
        let payload = [0x80, ext_byte, 0x05, 0b1100_0000, 0x00];
        let desc = Vp8Descriptor::parse(&payload).unwrap();
        assert_eq!(desc.tl0_pic_idx, Some(0x05));
        assert_eq!(desc.tid, Some(0b11));
    }

    #[test]
    fn k_bit_shares_tid_branch_with_t_bit() {
        // ext byte: K=1 only, same byte layout consumed as the T-bit branch
        let ext_byte = 0x10;
        let payload = [0x80, ext_byte, 0b01_0_00101, 0x00];
        let desc = Vp8Descriptor::parse(&payload).unwrap();
        assert_eq!(desc.tid, Some(0b01));
        assert_eq!(desc.key_idx, Some(0b00101));
    }

    #[test]
    fn truncated_extension_byte_is_short_packet() {
        let payload = [0x80];
        assert!(matches!(
            Vp8Descriptor::parse(&payload),
            Err(MediaCoreError::ShortPacket(_))
        ));
    }

    #[test]
    fn empty_payload_is_nil_packet() {
        assert!(matches!(
            Vp8Descriptor::parse(&[]),
            Err(MediaCoreError::NilPacket)
        ));
    }
}
