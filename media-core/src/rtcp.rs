//! RTCP (RTP Control Protocol) implementation
//!
//! Implements the RFC 3550 packet types the pipeline actually emits or
//! consumes (SR, RR) plus the REMB feedback message used for legacy
//! bandwidth estimation.
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
use crate::nack::NackPair;
use bytes::{BufMut, BytesMut};

/// RTCP packet types (RFC 3550 Section 6, plus the feedback types used by
/// REMB and TWCC).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtcpPacketType {
    /// Sender Report (SR) - 200
    SenderReport = 200,
    /// Receiver Report (RR) - 201
    ReceiverReport = 201,
    /// Source Description (SDES) - 202
    SourceDescription = 202,
    /// Goodbye (BYE) - 203
    Goodbye = 203,
    /// Application Defined (APP) - 204
    ApplicationDefined = 204,
    /// Transport Layer Feedback (e.g. Generic NACK, TWCC) - 205
    TransportSpecificFeedback = 205,
    /// Payload-Specific Feedback (e.g. PLI, REMB) - 206
    PayloadSpecificFeedback = 206,
}

/// RTCP packet header (RFC 3550 Section 6.1).
///
/// `count` doubles as the reception-report/source count for SR/RR/SDES/BYE
/// and as the feedback message format (FMT) for the 205/206 types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcpHeader {
    /// Version (must be 2)
    pub version: u8,
    /// Padding flag
    pub padding: bool,
    /// Reception report count, source count, or FMT
    pub count: u8,
    /// Packet type
    pub packet_type: RtcpPacketType,
    /// Length in 32-bit words minus 1
    pub length: u16,
}

/// RTCP Sender Report (RFC 3550 Section 6.4.1)
#[derive(Debug, Clone)]
pub struct SenderReport {
    /// Header
    pub header: RtcpHeader,
    /// SSRC of sender
    pub ssrc: u32,
    /// NTP timestamp (most significant word)
    pub ntp_timestamp_msw: u32,
    /// NTP timestamp (least significant word)
    pub ntp_timestamp_lsw: u32,
    /// RTP timestamp
    pub rtp_timestamp: u32,
    /// Sender's packet count
    pub sender_packet_count: u32,
    /// Sender's octet count
    pub sender_octet_count: u32,
    /// Reception report blocks (0-31)
    pub reception_reports: Vec<ReceptionReport>,
}

/// RTCP Receiver Report (RFC 3550 Section 6.4.2)
#[derive(Debug, Clone)]
pub struct ReceiverReport {
    /// Header
    pub header: RtcpHeader,
    /// SSRC of receiver
    pub ssrc: u32,
    /// Reception report blocks (0-31)
    pub reception_reports: Vec<ReceptionReport>,
}

/// Reception report block (RFC 3550 Section 6.4.1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceptionReport {
    /// SSRC of source
    pub ssrc: u32,
    /// Fraction lost (8 bits)
    pub fraction_lost: u8,
    /// Cumulative number of packets lost (24 bits, signed)
    pub cumulative_packets_lost: i32,
    /// Extended highest sequence number received
    pub extended_sequence_number: u32,
    /// Interarrival jitter (RFC 3550 Section 6.4.1)
    pub jitter: u32,
    /// Last SR timestamp (LSR): middle 32 bits of the last SR's NTP time
    pub last_sr_timestamp: u32,
    /// Delay since last SR (DLSR), in units of 1/65536 seconds
    pub delay_since_last_sr: u32,
}

/// Receiver Estimated Maximum Bitrate (draft-alvestrand-rmcat-remb),
/// carried as a Payload-Specific Feedback (PT=206, FMT=15) packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Remb {
    /// Header
    pub header: RtcpHeader,
    /// SSRC of the packet sender
    pub sender_ssrc: u32,
    /// Estimated maximum total bitrate, in bits per second
    pub bitrate: u64,
    /// SSRCs this estimate applies to
    pub ssrcs: Vec<u32>,
}

/// FMT value identifying a REMB packet inside a Payload-Specific Feedback
/// RTCP packet.
pub const REMB_FMT: u8 = 15;

const REMB_UNIQUE_IDENTIFIER: [u8; 4] = *b"REMB";

impl RtcpHeader {
    /// Parse RTCP header from bytes
    pub fn parse(data: &[u8]) -> MediaCoreResult<(Self, &[u8])> {
        if data.len() < 4 {
            return Err(MediaCoreError::Unmarshal("RTCP header too short".to_string()));
        }

        let first_byte = data[0];
        let version = (first_byte >> 6) & 0x03;
        if version != 2 {
            return Err(MediaCoreError::Unmarshal(format!(
                "invalid RTCP version: {}",
                version
            )));
        }
        let padding = (first_byte & 0x20) != 0;
        let count = first_byte & 0x1F;

        let packet_type = data[1];
        let length = u16::from_be_bytes([data[2], data[3]]);

        let packet_type_enum = match packet_type {
            200 => RtcpPacketType::SenderReport,
            201 => RtcpPacketType::ReceiverReport,
            202 => RtcpPacketType::SourceDescription,
            203 => RtcpPacketType::Goodbye,
            204 => RtcpPacketType::ApplicationDefined,
            205 => RtcpPacketType::TransportSpecificFeedback,
            206 => RtcpPacketType::PayloadSpecificFeedback,
            other => {
                return Err(MediaCoreError::Unmarshal(format!(
                    "unknown RTCP packet type: {}",
                    other
                )));
            }
        };

        let header = RtcpHeader {
            version,
            padding,
            count,
            packet_type: packet_type_enum,
            length,
        };

        Ok((header, &data[4..]))
    }

    /// Serialize RTCP header to bytes
    pub fn serialize(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(4);

        let mut first_byte = (self.version & 0x03) << 6;
        if self.padding {
            first_byte |= 0x20;
        }
        first_byte |= self.count & 0x1F;

        buf.put_u8(first_byte);
        buf.put_u8(self.packet_type as u8);
        buf.put_u16(self.length);

        buf
    }
}

impl SenderReport {
    /// Build a Sender Report around an already-known NTP/RTP timestamp pair.
    pub fn new(
        ssrc: u32,
        ntp_timestamp_msw: u32,
        ntp_timestamp_lsw: u32,
        rtp_timestamp: u32,
        sender_packet_count: u32,
        sender_octet_count: u32,
        reception_reports: Vec<ReceptionReport>,
    ) -> Self {
        let header = RtcpHeader {
            version: 2,
            padding: false,
            count: reception_reports.len().min(31) as u8,
            packet_type: RtcpPacketType::SenderReport,
            length: 0,
        };

        SenderReport {
            header,
            ssrc,
            ntp_timestamp_msw,
            ntp_timestamp_lsw,
            rtp_timestamp,
            sender_packet_count,
            sender_octet_count,
            reception_reports,
        }
    }

    /// Serialize Sender Report to bytes (RFC 3550 compliant)
    pub fn serialize(&self) -> BytesMut {
        let mut buf = BytesMut::new();

        let header_start = buf.len();
        buf.put_slice(&self.header.serialize());

        buf.put_u32(self.ssrc);
        buf.put_u32(self.ntp_timestamp_msw);
        buf.put_u32(self.ntp_timestamp_lsw);
        buf.put_u32(self.rtp_timestamp);
        buf.put_u32(self.sender_packet_count);
        buf.put_u32(self.sender_octet_count);

        for report in &self.reception_reports {
            put_reception_report(&mut buf, report);
        }

        finalize_length(&mut buf, header_start);
        buf
    }
}

impl ReceiverReport {
    /// Create a new Receiver Report
    pub fn new(ssrc: u32, reception_reports: Vec<ReceptionReport>) -> Self {
        let header = RtcpHeader {
            version: 2,
            padding: false,
            count: reception_reports.len().min(31) as u8,
            packet_type: RtcpPacketType::ReceiverReport,
            length: 0,
        };

        ReceiverReport {
            header,
            ssrc,
            reception_reports,
        }
    }

    /// Serialize Receiver Report to bytes (RFC 3550 compliant)
    pub fn serialize(&self) -> BytesMut {
        let mut buf = BytesMut::new();

        let header_start = buf.len();
        buf.put_slice(&self.header.serialize());

        buf.put_u32(self.ssrc);
        for report in &self.reception_reports {
            put_reception_report(&mut buf, report);
        }

        finalize_length(&mut buf, header_start);
        buf
    }
}

fn put_reception_report(buf: &mut BytesMut, report: &ReceptionReport) {
    buf.put_u32(report.ssrc);
    buf.put_u8(report.fraction_lost);
    let lost_bytes = report.cumulative_packets_lost.to_be_bytes();
    buf.put_u8(lost_bytes[1]);
    buf.put_u8(lost_bytes[2]);
    buf.put_u8(lost_bytes[3]);
    buf.put_u32(report.extended_sequence_number);
    buf.put_u32(report.jitter);
    buf.put_u32(report.last_sr_timestamp);
    buf.put_u32(report.delay_since_last_sr);
}

fn finalize_length(buf: &mut BytesMut, header_start: usize) {
    let total_length = buf.len();
    let length_words = (total_length / 4) - 1;
    buf[header_start + 2..header_start + 4].copy_from_slice(&(length_words as u16).to_be_bytes());
}

impl Remb {
    /// Build a REMB packet estimating `bitrate` bits per second for `ssrcs`.
    pub fn new(sender_ssrc: u32, bitrate: u64, ssrcs: Vec<u32>) -> Self {
        let header = RtcpHeader {
            version: 2,
            padding: false,
            count: REMB_FMT,
            packet_type: RtcpPacketType::PayloadSpecificFeedback,
            length: 0,
        };

        Remb {
            header,
            sender_ssrc,
            bitrate,
            ssrcs,
        }
    }

    /// Serialize to bytes. The mantissa/exponent bitrate encoding matches
    /// the legacy REMB draft: an 18-bit mantissa and a 6-bit exponent such
    /// that `bitrate == mantissa << exponent`.
    pub fn serialize(&self) -> BytesMut {
        let mut buf = BytesMut::new();

        let header_start = buf.len();
        buf.put_slice(&self.header.serialize());

        buf.put_u32(self.sender_ssrc);
        buf.put_u32(0); // media SSRC is unused for REMB
        buf.put_slice(&REMB_UNIQUE_IDENTIFIER);
        buf.put_u8(self.ssrcs.len() as u8);

        let (mantissa, exponent) = encode_remb_bitrate(self.bitrate);
        buf.put_u8((exponent << 2) | ((mantissa >> 16) as u8 & 0x03));
        buf.put_u8((mantissa >> 8) as u8);
        buf.put_u8(mantissa as u8);

        for ssrc in &self.ssrcs {
            buf.put_u32(*ssrc);
        }

        finalize_length(&mut buf, header_start);
        buf
    }
}

/// FMT value identifying a Generic NACK packet inside a Transport-Specific
/// Feedback RTCP packet (RFC 4585 Section 6.2.1).
pub const GENERIC_NACK_FMT: u8 = 1;

/// FMT value identifying a Picture Loss Indication packet inside a
/// Payload-Specific Feedback RTCP packet (RFC 4585 Section 6.3.1).
pub const PLI_FMT: u8 = 1;

/// Generic NACK (RFC 4585 Section 6.2.1): one or more `(packet_id,
/// lost_bitmap)` pairs requesting retransmission of specific sequence
/// numbers on `media_ssrc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenericNack {
    /// Header
    pub header: RtcpHeader,
    /// SSRC of the packet sender (the receiver requesting retransmission)
    pub sender_ssrc: u32,
    /// SSRC of the media source the NACK applies to
    pub media_ssrc: u32,
    /// Coalesced missing-sequence-number pairs
    pub pairs: Vec<NackPair>,
}

impl GenericNack {
    /// Build a Generic NACK requesting retransmission of `pairs` on
    /// `media_ssrc`.
    pub fn new(sender_ssrc: u32, media_ssrc: u32, pairs: Vec<NackPair>) -> Self {
        let header = RtcpHeader {
            version: 2,
            padding: false,
            count: GENERIC_NACK_FMT,
            packet_type: RtcpPacketType::TransportSpecificFeedback,
            length: 0,
        };
        GenericNack {
            header,
            sender_ssrc,
            media_ssrc,
            pairs,
        }
    }

    /// Serialize to bytes.
    pub fn serialize(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        let header_start = buf.len();
        buf.put_slice(&self.header.serialize());

        buf.put_u32(self.sender_ssrc);
        buf.put_u32(self.media_ssrc);
        for pair in &self.pairs {
            buf.put_u16(pair.packet_id);
            buf.put_u16(pair.lost_bitmap);
        }

        finalize_length(&mut buf, header_start);
        buf
    }
}

/// Picture Loss Indication (RFC 4585 Section 6.3.1): requests the media
/// source on `media_ssrc` send a new keyframe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pli {
    /// Header
    pub header: RtcpHeader,
    /// SSRC of the packet sender
    pub sender_ssrc: u32,
    /// SSRC of the media source the request applies to
    pub media_ssrc: u32,
}

impl Pli {
    /// Build a PLI for `media_ssrc`.
    pub fn new(sender_ssrc: u32, media_ssrc: u32) -> Self {
        let header = RtcpHeader {
            version: 2,
            padding: false,
            count: PLI_FMT,
            packet_type: RtcpPacketType::PayloadSpecificFeedback,
            length: 0,
        };
        Pli {
            header,
            sender_ssrc,
            media_ssrc,
        }
    }

    /// Serialize to bytes (always 12 bytes: 4-byte header + 2 SSRCs).
    pub fn serialize(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        let header_start = buf.len();
        buf.put_slice(&self.header.serialize());
        buf.put_u32(self.sender_ssrc);
        buf.put_u32(self.media_ssrc);
        finalize_length(&mut buf, header_start);
        buf
    }
}

fn encode_remb_bitrate(bitrate: u64) -> (u32, u8) {
    let mut exponent = 0u8;
    let mut mantissa = bitrate;
    while mantissa > 0x3FFFF && exponent < 63 {
        mantissa >>= 1;
        exponent += 1;
    }
    (mantissa as u32, exponent)
}

/// RFC 3550 Appendix A.8 transit time: the receiver-clock - sender-clock
/// skew implied by one packet's arrival, in clock-rate units.
pub fn transit_time(arrival_ms: i64, clock_rate: u32, rtp_timestamp: u32) -> i64 {
    arrival_ms * clock_rate as i64 / 1000 - rtp_timestamp as i64
}

/// RFC 3550 Appendix A.8 jitter update: `J += (|D| - J) / 16`, kept as a
/// float so successive small updates don't get lost to integer truncation.
/// Round the result when packing it into a Receiver Report.
pub fn update_jitter(previous_jitter: f64, previous_transit: i64, current_transit: i64) -> f64 {
    let d = (current_transit - previous_transit).unsigned_abs() as f64;
    previous_jitter + (d - previous_jitter) / 16.0
}

/// Pack a DLSR delay (middle-32-bits-of-seconds fixed point) from a
/// millisecond delay, per RFC 3550 Section 6.4.1.
pub fn pack_dlsr(delay_ms: u64) -> u32 {
    (((delay_ms / 1000) << 16) | ((delay_ms % 1000) * 65536 / 1000)) as u32
}
