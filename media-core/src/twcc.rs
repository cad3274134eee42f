//! Transport-Wide Congestion Control responder
//! (draft-holmer-rmcat-transport-wide-cc-extensions-01).
//!
//! Aggregates per-packet arrival timestamps across every SSRC sharing a
//! transport and periodically compresses them into the run-length /
//! status-vector chunk wire format.
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


use crate::rtcp::{RtcpHeader, RtcpPacketType};
use bytes::{BufMut, BytesMut};

/// FMT value identifying a transport-wide congestion control packet inside
/// a Transport Layer Feedback RTCP packet (PT=205).
pub const TRANSPORT_CC_FMT: u8 = 15;

const MIN_PACKETS_BEFORE_SEND: usize = 20;
const MAX_PACKETS_BEFORE_SEND: usize = 100;
const SEND_INTERVAL_NS: i64 = 100_000_000;
const MARKER_SEND_INTERVAL_NS: i64 = 50_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatusSymbol {
    NotReceived = 0,
    SmallDelta = 1,
    LargeDelta = 2,
}

#[derive(Debug, Clone, Copy)]
struct ArrivalEntry {
    ext_tsn: u32,
    arrival_micros: i64,
}

/// Per-transport arrival-time aggregator and TWCC feedback encoder.
pub struct TwccResponder {
    sender_ssrc: u32,
    media_ssrc: u32,
    ext_info: Vec<ArrivalEntry>,
    last_report_ns: Option<i64>,
    cycles: u32,
    last_sn: u16,
    has_sn: bool,
    last_ext_sn_emitted: Option<u32>,
    fb_pkt_count: u8,
}

impl TwccResponder {
    /// Build a responder for one transport. `media_ssrc` identifies the
    /// media stream the feedback is reported against; it must be non-zero
    /// for feedback to ever be sent.
    pub fn new(sender_ssrc: u32, media_ssrc: u32) -> Self {
        TwccResponder {
            sender_ssrc,
            media_ssrc,
            ext_info: Vec::new(),
            last_report_ns: None,
            cycles: 0,
            last_sn: 0,
            has_sn: false,
            last_ext_sn_emitted: None,
            fb_pkt_count: 0,
        }
    }

    /// Record one packet's arrival. Returns the encoded feedback packet if
    /// the accumulated arrivals now warrant sending one.
    pub fn push(&mut self, sn: u16, arrival_ns: i64, marker: bool) -> Option<BytesMut> {
        if self.has_sn && sn < 0x0FFF && self.last_sn > 0xF000 {
            self.cycles = self.cycles.wrapping_add(1 << 16);
        }
        self.last_sn = sn;
        self.has_sn = true;

        let ext_tsn = self.cycles | sn as u32;
        self.ext_info.push(ArrivalEntry {
            ext_tsn,
            arrival_micros: arrival_ns / 1000,
        });

        let delta_ns = match self.last_report_ns {
            None => {
                self.last_report_ns = Some(arrival_ns);
                0
            }
            Some(last) => arrival_ns - last,
        };

        let should_send = self.ext_info.len() > MIN_PACKETS_BEFORE_SEND
            && self.media_ssrc != 0
            && (delta_ns >= SEND_INTERVAL_NS
                || self.ext_info.len() > MAX_PACKETS_BEFORE_SEND
                || (marker && delta_ns >= MARKER_SEND_INTERVAL_NS));

        if !should_send {
            return None;
        }
        self.last_report_ns = Some(arrival_ns);
        self.build_feedback()
    }

    /// Drain the accumulated arrivals into one encoded feedback packet.
    /// Returns `None` if there is nothing new to report (an empty or fully
    /// stale `ext_info`).
    pub fn build_feedback(&mut self) -> Option<BytesMut> {
        if self.ext_info.is_empty() {
            return None;
        }

        self.ext_info.sort_by_key(|e| e.ext_tsn);

        let mut entries: Vec<(u32, Option<i64>)> = Vec::with_capacity(self.ext_info.len());
        for entry in self.ext_info.drain(..) {
            if let Some(last) = self.last_ext_sn_emitted {
                if entry.ext_tsn <= last {
                    continue;
                }
                for gap in (last + 1)..entry.ext_tsn {
                    entries.push((gap, None));
                }
            }
            entries.push((entry.ext_tsn, Some(entry.arrival_micros)));
            self.last_ext_sn_emitted = Some(entry.ext_tsn);
        }

        if entries.is_empty() {
            return None;
        }

        Some(self.encode(&entries))
    }

    fn encode(&mut self, entries: &[(u32, Option<i64>)]) -> BytesMut {
        let base_sn = entries[0].0 as u16;
        let packet_status_count = entries.len() as u16;

        let first_arrival = entries
            .iter()
            .find_map(|(_, a)| *a)
            .expect("at least one entry in a freshly-built feedback has an arrival");
        let ref_time = ((first_arrival / 64_000) as u32) & 0x00FF_FFFF;

        self.fb_pkt_count = self.fb_pkt_count.wrapping_add(1);
        let fb_pkt_count = self.fb_pkt_count;

        let mut symbols = Vec::with_capacity(entries.len());
        let mut deltas = BytesMut::new();
        let mut running_micros = (ref_time as i64) * 64_000;

        for (_, arrival) in entries {
            match arrival {
                None => symbols.push(StatusSymbol::NotReceived),
                Some(arrival_micros) => {
                    let delta = (arrival_micros - running_micros) / 250;
                    if (0..=255).contains(&delta) {
                        symbols.push(StatusSymbol::SmallDelta);
                        deltas.put_u8(delta as u8);
                    } else {
                        symbols.push(StatusSymbol::LargeDelta);
                        let clamped = delta.clamp(i16::MIN as i64, i16::MAX as i64) as i16;
                        deltas.put_i16(clamped);
                    }
                    running_micros = *arrival_micros;
                }
            }
        }

        let mut payload = BytesMut::new();
        payload.put_u32(self.sender_ssrc);
        payload.put_u32(self.media_ssrc);
        payload.put_u16(base_sn);
        payload.put_u16(packet_status_count);
        payload.put_u32((ref_time << 8) | fb_pkt_count as u32);

        for chunk in encode_chunks(&symbols) {
            payload.put_u16(chunk);
        }
        payload.put_slice(&deltas);

        let unpadded_len = 4 + payload.len();
        let pad_size = (4 - unpadded_len % 4) % 4;
        if pad_size > 0 {
            for _ in 0..pad_size - 1 {
                payload.put_u8(0);
            }
            payload.put_u8(pad_size as u8);
        }

        let header = RtcpHeader {
            version: 2,
            padding: pad_size > 0,
            count: TRANSPORT_CC_FMT,
            packet_type: RtcpPacketType::TransportSpecificFeedback,
            length: 0,
        };

        let mut out = BytesMut::new();
        out.put_slice(&header.serialize());
        out.put_slice(&payload);
        let total_words = (out.len() / 4) - 1;
        out[2..4].copy_from_slice(&(total_words as u16).to_be_bytes());
        out
    }
}

/// Chunk-encode a status-symbol stream, greedily preferring a run-length
/// chunk whenever a run of the same symbol exceeds 7, else packing a
/// status-vector chunk (1-bit symbols, 14 wide) that widens its symbol size
/// to 2 bits (7 wide) the moment a large delta appears in its window.
fn encode_chunks(symbols: &[StatusSymbol]) -> Vec<u16> {
    let mut chunks = Vec::new();
    let mut i = 0;
    while i < symbols.len() {
        let run = run_length_at(symbols, i);
        if run > 7 {
            let run = run.min(0x1FFF);
            chunks.push(encode_rle(symbols[i], run as u16));
            i += run;
            continue;
        }

        let remaining = symbols.len() - i;
        let cap14 = remaining.min(14);
        let has_large = symbols[i..i + cap14].iter().any(|s| *s == StatusSymbol::LargeDelta);
        let window = if has_large { remaining.min(7) } else { cap14 };
        chunks.push(encode_sv(&symbols[i..i + window], has_large));
        i += window;
    }
    chunks
}

fn run_length_at(symbols: &[StatusSymbol], start: usize) -> usize {
    let sym = symbols[start];
    let mut run = 1;
    while start + run < symbols.len() && symbols[start + run] == sym {
        run += 1;
    }
    run
}

fn encode_rle(symbol: StatusSymbol, run: u16) -> u16 {
    ((symbol as u16) << 13) | (run & 0x1FFF)
}

fn encode_sv(window: &[StatusSymbol], two_bit: bool) -> u16 {
    let mut field: u16 = 0;
    if two_bit {
        for (idx, sym) in window.iter().enumerate() {
            field |= (*sym as u16) << (12 - 2 * idx);
        }
        0x8000 | 0x4000 | field
    } else {
        for (idx, sym) in window.iter().enumerate() {
            field |= (*sym as u16) << (13 - idx);
        }
        0x8000 | field
    }
}
