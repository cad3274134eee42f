//! Per-SSRC pipeline: write -> stats -> bucket -> unmarshal -> extract -> RTCP.
//!
//! `Buffer` is the engine's single stateful collaborator per RTP stream. It
//! layers codec-aware extraction, RFC 3550 statistics/jitter, NACK tracking
//! and REMB estimation on top of a `Bucket` retransmission ring, and drives
//! the `on_feedback`/`on_twcc`/`on_audio_level` hooks that the rest of the
//! SFU (out of scope here) wires up to actual transport sends.
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

use crate::bucket::Bucket;
use crate::error::{MediaCoreError, MediaCoreResult};
use crate::h264_payload;
use crate::nack::NackQueue;
use crate::pool::Pool;
use crate::rtcp::{self, GenericNack, Pli, ReceiverReport, ReceptionReport, Remb};
use crate::rtp_handler::RtpPacket;
use crate::seq;
use crate::vp8_payload::Vp8Descriptor;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, trace, warn};

/// Lowest REMB estimate this engine will ever emit.
pub const MIN_BITRATE: u64 = 100_000;

/// How many initially-accepted packets are eligible for the base-sn-reset /
/// temporal-layer-probe adjustments in `write`'s step 9.
const PROBE_PACKET_COUNT: u64 = 25;

/// Receiver Report / REMB cadence.
const REPORT_INTERVAL_NS: i64 = 1_000_000_000;

/// Supplies arrival timestamps, shared across every `Buffer` on one
/// transport so TWCC aggregation (outside this crate's `TwccResponder`,
/// which this module just feeds) sees a consistent clock.
pub trait Clock: Send + Sync {
    /// Nanoseconds since some fixed, monotonic epoch.
    fn now_ns(&self) -> i64;
}

/// `Clock` backed by `std::time::Instant`.
pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    /// Build a clock whose epoch is "now".
    pub fn new() -> Self {
        MonotonicClock {
            epoch: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ns(&self) -> i64 {
        self.epoch.elapsed().as_nanos() as i64
    }
}

/// Media kind, drives bucket sizing and which payload parser runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecKind {
    /// Opus, G.711, etc.
    Audio,
    /// VP8, H.264, etc.
    Video,
    /// Unrecognized mime type: no codec-specific parsing runs.
    None,
}

/// Codec identity bound to this `Buffer`.
#[derive(Debug, Clone)]
pub struct Codec {
    /// e.g. `"video/vp8"`, `"video/h264"`, `"audio/opus"`.
    pub mime_type: String,
    /// RTP clock rate in Hz.
    pub clock_rate: u32,
    /// Audio vs video vs unrecognized.
    pub kind: CodecKind,
}

impl Codec {
    fn is_vp8(&self) -> bool {
        self.mime_type.eq_ignore_ascii_case("video/vp8")
    }

    fn is_h264(&self) -> bool {
        self.mime_type.eq_ignore_ascii_case("video/h264")
    }
}

/// Which RTCP feedback mechanisms this stream's codec/transport negotiated.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeedbackCaps {
    /// Generic NACK retransmission requests.
    pub nack: bool,
    /// Legacy REMB bandwidth estimation.
    pub remb: bool,
    /// Transport-wide congestion control.
    pub twcc: bool,
    /// RFC 6464 audio level header extension.
    pub audio_level: bool,
}

/// One-byte RFC 5285 header-extension local ids this stream negotiated.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderExtensionIds {
    /// Local id for the TWCC sequence number extension, if negotiated.
    pub twcc: Option<u8>,
    /// Local id for the RFC 6464 audio level extension, if negotiated.
    pub audio_level: Option<u8>,
}

/// The only externally supplied per-`Buffer` knob.
#[derive(Debug, Clone, Copy)]
pub struct BufferOptions {
    /// Upper clamp for the REMB estimate this stream will ever report.
    pub max_bitrate: u64,
}

impl Default for BufferOptions {
    fn default() -> Self {
        BufferOptions {
            max_bitrate: 2_500_000,
        }
    }
}

/// One accepted RTP packet, enriched with the metadata `read_extended`
/// callers need: cycle-adjusted ordering, arrival time, and (for video)
/// keyframe detection.
#[derive(Debug, Clone)]
pub struct ExtPacket {
    /// True if this packet advanced the stream's head sequence number
    /// (i.e. was not a late/out-of-order arrival).
    pub head: bool,
    /// Wrap-cycle counter in effect when this packet was accepted.
    pub cycle: u32,
    /// Arrival time, nanoseconds since the shared `Clock`'s epoch.
    pub arrival_ns: i64,
    /// The parsed RTP packet.
    pub rtp_packet: RtpPacket,
    /// VP8 payload descriptor, if this stream is VP8 video.
    pub vp8: Option<Vp8Descriptor>,
    /// Keyframe detection result, for VP8 or H.264 video.
    pub is_keyframe: bool,
}

/// RTCP feedback a `Buffer` can emit through `on_feedback`.
#[derive(Debug, Clone)]
pub enum Feedback {
    /// Periodic Receiver Report.
    ReceiverReport(ReceiverReport),
    /// Legacy bandwidth estimate.
    Remb(Remb),
    /// Retransmission request.
    Nack(GenericNack),
    /// Keyframe request.
    Pli(Pli),
}

/// Called with each outbound RTCP feedback packet.
pub type OnFeedbackFn = dyn Fn(Feedback) + Send + Sync;
/// Called with each TWCC-extension-bearing packet's `(sn, arrival_ns, marker)`.
pub type OnTwccFn = dyn Fn(u16, i64, bool) + Send + Sync;
/// Called with each decoded audio-level extension's `(dbov, voice_activity)`.
pub type OnAudioLevelFn = dyn Fn(u8, bool) + Send + Sync;
/// Called exactly once, when `close` runs.
pub type OnCloseFn = dyn Fn() + Send + Sync;

struct State {
    bound: bool,
    codec: Option<Codec>,
    caps: FeedbackCaps,
    ext_ids: HeaderExtensionIds,
    bucket: Option<Bucket>,
    nack_queue: Option<NackQueue>,

    pending_raw: VecDeque<(Vec<u8>, i64)>,
    ext_queue: VecDeque<ExtPacket>,

    seen_first: bool,
    base_sn: u16,
    max_sn: u16,
    cycles: u32,
    last_transit: Option<i64>,

    packet_count: u64,
    last_expected: u32,
    last_received: u32,
    fraction_lost: u8,
    lost_rate: f64,
    jitter: f64,

    last_report_ns: i64,
    /// Bytes received since `last_report_ns`; this is the REMB window
    /// accumulator (spec's `total_byte`), reset every time a periodic
    /// report (and any REMB riding alongside it) is emitted.
    bitrate_accumulator: u64,
}

impl State {
    fn new() -> Self {
        State {
            bound: false,
            codec: None,
            caps: FeedbackCaps::default(),
            ext_ids: HeaderExtensionIds::default(),
            bucket: None,
            nack_queue: None,
            pending_raw: VecDeque::new(),
            ext_queue: VecDeque::new(),
            seen_first: false,
            base_sn: 0,
            max_sn: 0,
            cycles: 0,
            last_transit: None,
            packet_count: 0,
            last_expected: 0,
            last_received: 0,
            fraction_lost: 0,
            lost_rate: 0.0,
            jitter: 0.0,
            last_report_ns: 0,
            bitrate_accumulator: 0,
        }
    }

    fn extended_max(&self) -> u32 {
        self.cycles | self.max_sn as u32
    }
}

/// Per-SSRC RTP buffering and RTCP feedback pipeline.
pub struct Buffer {
    ssrc: u32,
    sender_ssrc: u32,
    pool: Arc<Pool>,
    clock: Arc<dyn Clock>,
    options: BufferOptions,

    state: Mutex<State>,
    notify_read: Notify,
    notify_ext: Notify,

    bitrate: AtomicU64,
    max_temporal_layer: AtomicU8,
    latest_timestamp: AtomicU32,
    latest_timestamp_time: AtomicI64,
    closed: AtomicBool,
    last_sr_ntp: AtomicU64,
    last_sr_rtp: AtomicU32,
    last_sr_arrival_ns: AtomicI64,

    on_feedback: Option<Arc<OnFeedbackFn>>,
    on_twcc: Option<Arc<OnTwccFn>>,
    on_audio_level: Option<Arc<OnAudioLevelFn>>,
    on_close: Option<Arc<OnCloseFn>>,
}

/// Constructor parameters grouped so `Buffer::new` doesn't take an
/// unreadable run of positional callback arguments.
#[derive(Default)]
pub struct BufferHooks {
    /// See [`OnFeedbackFn`].
    pub on_feedback: Option<Arc<OnFeedbackFn>>,
    /// See [`OnTwccFn`].
    pub on_twcc: Option<Arc<OnTwccFn>>,
    /// See [`OnAudioLevelFn`].
    pub on_audio_level: Option<Arc<OnAudioLevelFn>>,
    /// See [`OnCloseFn`].
    pub on_close: Option<Arc<OnCloseFn>>,
}

impl Buffer {
    /// Build an unbound `Buffer`. Writes arriving before `bind` are queued
    /// and drained into the normal pipeline once it runs.
    pub fn new(
        ssrc: u32,
        sender_ssrc: u32,
        pool: Arc<Pool>,
        clock: Arc<dyn Clock>,
        options: BufferOptions,
        hooks: BufferHooks,
    ) -> Self {
        Buffer {
            ssrc,
            sender_ssrc,
            pool,
            clock,
            options,
            state: Mutex::new(State::new()),
            notify_read: Notify::new(),
            notify_ext: Notify::new(),
            bitrate: AtomicU64::new(0),
            max_temporal_layer: AtomicU8::new(0),
            latest_timestamp: AtomicU32::new(0),
            latest_timestamp_time: AtomicI64::new(0),
            closed: AtomicBool::new(false),
            last_sr_ntp: AtomicU64::new(0),
            last_sr_rtp: AtomicU32::new(0),
            last_sr_arrival_ns: AtomicI64::new(0),
            on_feedback: hooks.on_feedback,
            on_twcc: hooks.on_twcc,
            on_audio_level: hooks.on_audio_level,
            on_close: hooks.on_close,
        }
    }

    /// Media SSRC this buffer serves.
    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Current measured receive bitrate, bits per second. Lock-free.
    pub fn bitrate(&self) -> u64 {
        self.bitrate.load(Ordering::Relaxed)
    }

    /// Highest VP8 temporal layer id observed during the initial probe
    /// window. Lock-free.
    pub fn max_temporal_layer(&self) -> u8 {
        self.max_temporal_layer.load(Ordering::Relaxed)
    }

    /// Most recently accepted packet's RTP timestamp. Lock-free.
    pub fn latest_timestamp(&self) -> u32 {
        self.latest_timestamp.load(Ordering::Relaxed)
    }

    /// Arrival time (per the shared `Clock`) of `latest_timestamp`. Lock-free.
    pub fn latest_timestamp_time(&self) -> i64 {
        self.latest_timestamp_time.load(Ordering::Relaxed)
    }

    /// True once `close` has run. Lock-free.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Record a Sender Report's NTP/RTP timestamp pair, arriving out of
    /// band from the RTCP side of the transport. Lock-free.
    pub fn set_sender_report(&self, ntp_timestamp: u64, rtp_timestamp: u32) {
        self.last_sr_ntp.store(ntp_timestamp, Ordering::Relaxed);
        self.last_sr_rtp.store(rtp_timestamp, Ordering::Relaxed);
        self.last_sr_arrival_ns
            .store(self.clock.now_ns(), Ordering::Relaxed);
    }

    /// Delayed-initialization step: binds codec parameters and feedback
    /// capabilities, allocates the `Bucket`'s backing array from the pool,
    /// and drains any packets that arrived before binding through the
    /// normal pipeline.
    pub async fn bind(&self, codec: Codec, caps: FeedbackCaps, ext_ids: HeaderExtensionIds) {
        let backing = match codec.kind {
            CodecKind::Audio => self.pool.acquire_audio(),
            _ => self.pool.acquire_video(),
        };

        let mut state = self.state.lock().await;
        state.bucket = Some(Bucket::new(backing));
        if caps.nack {
            state.nack_queue = Some(NackQueue::new());
        }
        state.codec = Some(codec);
        state.caps = caps;
        state.ext_ids = ext_ids;
        state.bound = true;

        let pending: Vec<(Vec<u8>, i64)> = state.pending_raw.drain(..).collect();
        for (raw, arrival_ns) in pending {
            self.accept_packet(&mut state, &raw, arrival_ns);
        }
    }

    /// Ingest one raw RTP packet. Returns `EndOfStream` only if the buffer
    /// is already closed; every per-packet parse/bucket failure is absorbed
    /// (logged and dropped) per this engine's best-effort contract.
    pub async fn write(&self, raw: &[u8]) -> MediaCoreResult<()> {
        self.write_at(raw, self.clock.now_ns()).await
    }

    /// Like `write`, but with an explicit arrival time. Exposed for
    /// deterministic tests; production callers should use `write`.
    pub async fn write_at(&self, raw: &[u8], arrival_ns: i64) -> MediaCoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MediaCoreError::EndOfStream);
        }
        let mut state = self.state.lock().await;
        if !state.bound {
            state.pending_raw.push_back((raw.to_vec(), arrival_ns));
            self.notify_read.notify_waiters();
            return Ok(());
        }
        self.accept_packet(&mut state, raw, arrival_ns);
        Ok(())
    }

    fn accept_packet(&self, state: &mut State, raw: &[u8], arrival_ns: i64) {
        if raw.len() < 4 {
            debug!(ssrc = self.ssrc, "dropping short RTP packet");
            return;
        }
        let sn = u16::from_be_bytes([raw[2], raw[3]]);

        if !state.seen_first {
            state.base_sn = sn;
            state.max_sn = sn;
            state.last_report_ns = arrival_ns;
            state.seen_first = true;
        }

        let is_head = if sn == state.max_sn {
            !state.bound || state.packet_count == 0
        } else {
            seq::later(sn, state.max_sn)
        };

        if is_head && sn != state.max_sn {
            if sn < state.max_sn {
                state.cycles = state.cycles.wrapping_add(1 << 16);
            }
            if let Some(nq) = state.nack_queue.as_mut() {
                let mut gap = state.max_sn.wrapping_add(1);
                while gap != sn {
                    nq.push(seq::extend(state.cycles, gap));
                    gap = gap.wrapping_add(1);
                }
            }
            state.max_sn = sn;
        } else if !is_head {
            if let Some(nq) = state.nack_queue.as_mut() {
                nq.remove(seq::extend(state.cycles, sn));
            }
        }

        let bucket = match state.bucket.as_mut() {
            Some(b) => b,
            None => return,
        };
        if let Err(err) = bucket.add_packet(raw, sn, is_head) {
            debug!(ssrc = self.ssrc, sn, %err, "dropping packet at bucket insert");
            return;
        }

        let packet = match RtpPacket::parse(raw) {
            Ok(p) => p,
            Err(err) => {
                debug!(ssrc = self.ssrc, sn, %err, "dropping unparseable RTP packet");
                return;
            }
        };

        state.packet_count += 1;
        state.bitrate_accumulator += raw.len() as u64;

        let mut vp8 = None;
        let mut is_keyframe = false;
        let is_video_vp8 = state.codec.as_ref().map(|c| c.is_vp8()).unwrap_or(false);
        let is_video_h264 = state.codec.as_ref().map(|c| c.is_h264()).unwrap_or(false);

        if is_video_vp8 {
            match Vp8Descriptor::parse(&packet.payload) {
                Ok(desc) => {
                    is_keyframe = desc.is_keyframe;
                    vp8 = Some(desc);
                }
                Err(err) => {
                    debug!(ssrc = self.ssrc, sn, %err, "dropping unparseable VP8 payload");
                    return;
                }
            }
        } else if is_video_h264 {
            match h264_payload::is_keyframe(&packet.payload) {
                Ok(kf) => is_keyframe = kf,
                Err(err) => {
                    debug!(ssrc = self.ssrc, sn, %err, "dropping unparseable H264 payload");
                    return;
                }
            }
        }

        if state.packet_count <= PROBE_PACKET_COUNT {
            if seq::earlier(sn, state.base_sn) {
                state.base_sn = sn;
            }
            if let Some(desc) = vp8.as_ref() {
                if let Some(tid) = desc.tid {
                    self.max_temporal_layer.fetch_max(tid, Ordering::Relaxed);
                }
            }
        }

        let ext_packet = ExtPacket {
            head: is_head,
            cycle: state.cycles,
            arrival_ns,
            rtp_packet: packet.clone(),
            vp8,
            is_keyframe,
        };
        state.ext_queue.push_back(ext_packet);
        self.notify_ext.notify_waiters();

        let header = &packet.header;
        let clock_rate = state.codec.as_ref().map(|c| c.clock_rate).unwrap_or(8000);

        let ts_delta = header.timestamp.wrapping_sub(self.latest_timestamp.load(Ordering::Relaxed)) as i32;
        if ts_delta > 0 {
            self.latest_timestamp.store(header.timestamp, Ordering::Relaxed);
            self.latest_timestamp_time.store(arrival_ns, Ordering::Relaxed);
        }

        let arrival_ms = arrival_ns / 1_000_000;
        let transit = rtcp::transit_time(arrival_ms, clock_rate, header.timestamp);
        if let Some(prev) = state.last_transit {
            state.jitter = rtcp::update_jitter(state.jitter, prev, transit);
        }
        state.last_transit = Some(transit);

        if state.caps.twcc {
            if let Some(id) = state.ext_ids.twcc {
                if let Some(data) = header.extension_by_id(id) {
                    if data.len() >= 2 {
                        let twcc_sn = u16::from_be_bytes([data[0], data[1]]);
                        if let Some(cb) = &self.on_twcc {
                            cb(twcc_sn, arrival_ns, header.marker);
                        }
                    }
                }
            }
        }

        if state.caps.audio_level {
            if let Some(id) = state.ext_ids.audio_level {
                if let Some(data) = header.extension_by_id(id) {
                    if let Some(&b) = data.first() {
                        let level = b & 0x7F;
                        let voice_activity = (b & 0x80) != 0;
                        if let Some(cb) = &self.on_audio_level {
                            cb(level, voice_activity);
                        }
                    }
                }
            }
        }

        if state.caps.nack {
            let head_ext = state.extended_max();
            let (pairs, ask_keyframe) = match state.nack_queue.as_mut() {
                Some(nq) => nq.pairs(head_ext),
                None => (Vec::new(), false),
            };
            if !pairs.is_empty() {
                if let Some(cb) = &self.on_feedback {
                    cb(Feedback::Nack(GenericNack::new(self.sender_ssrc, self.ssrc, pairs)));
                }
            }
            if ask_keyframe {
                warn!(ssrc = self.ssrc, "NACK retries exhausted, requesting keyframe");
                if let Some(cb) = &self.on_feedback {
                    cb(Feedback::Pli(Pli::new(self.sender_ssrc, self.ssrc)));
                }
            }
        }

        if arrival_ns - state.last_report_ns >= REPORT_INTERVAL_NS {
            self.emit_periodic_report(state, arrival_ns);
        }

        trace!(ssrc = self.ssrc, sn, is_head, is_keyframe, "accepted packet");
    }

    fn emit_periodic_report(&self, state: &mut State, now_ns: i64) {
        let elapsed_ns = (now_ns - state.last_report_ns).max(1);
        let measured_bitrate =
            (8 * state.bitrate_accumulator as u128 * 1_000_000_000u128 / elapsed_ns as u128) as u64;
        self.bitrate.store(measured_bitrate, Ordering::Relaxed);

        let report = self.build_receiver_report(state, now_ns);
        if let Some(cb) = &self.on_feedback {
            cb(Feedback::ReceiverReport(report));
        }

        if state.caps.remb && !state.caps.twcc {
            let adjusted = adjust_remb_bitrate(measured_bitrate, state.lost_rate, self.options.max_bitrate);
            if let Some(cb) = &self.on_feedback {
                cb(Feedback::Remb(Remb::new(self.sender_ssrc, adjusted, vec![self.ssrc])));
            }
        }

        state.bitrate_accumulator = 0;
        state.last_report_ns = now_ns;
    }

    fn build_receiver_report(&self, state: &mut State, now_ns: i64) -> ReceiverReport {
        let expected = state.extended_max().wrapping_sub(state.base_sn as u32).wrapping_add(1);

        let total_lost: u32 = if state.packet_count == 0 || state.packet_count as u32 >= expected {
            0
        } else {
            expected - state.packet_count as u32
        };

        let expected_interval = expected.wrapping_sub(state.last_expected);
        let received_interval = (state.packet_count as u32).wrapping_sub(state.last_received);
        let lost_interval = expected_interval.wrapping_sub(received_interval);

        if expected_interval > 0 && (lost_interval as i64) > 0 {
            state.fraction_lost = (((lost_interval as u64) << 8) / expected_interval as u64) as u8;
            state.lost_rate = lost_interval as f64 / expected_interval as f64;
        } else {
            state.fraction_lost = 0;
            state.lost_rate = 0.0;
        }
        state.last_expected = expected;
        state.last_received = state.packet_count as u32;

        let last_sr_ntp = self.last_sr_ntp.load(Ordering::Relaxed);
        let last_sr_arrival = self.last_sr_arrival_ns.load(Ordering::Relaxed);
        let last_sr = if last_sr_ntp == 0 {
            0
        } else {
            ((last_sr_ntp >> 16) & 0xFFFF_FFFF) as u32
        };
        let dlsr = if last_sr_arrival == 0 {
            0
        } else {
            let delay_ms = ((now_ns - last_sr_arrival).max(0) / 1_000_000) as u64;
            rtcp::pack_dlsr(delay_ms)
        };

        let reception_report = ReceptionReport {
            ssrc: self.ssrc,
            fraction_lost: state.fraction_lost,
            cumulative_packets_lost: total_lost.min(0x7FFFFF) as i32,
            extended_sequence_number: state.extended_max(),
            jitter: state.jitter.round() as u32,
            last_sr_timestamp: last_sr,
            delay_since_last_sr: dlsr,
        };

        ReceiverReport::new(self.sender_ssrc, vec![reception_report])
    }

    /// Pop the next pending raw packet queued before `bind` drained it.
    /// Blocks until one is available or the buffer closes.
    pub async fn read(&self, dst: &mut [u8]) -> MediaCoreResult<usize> {
        loop {
            let notified = self.notify_read.notified();
            tokio::pin!(notified);
            {
                let mut state = self.state.lock().await;
                if let Some((raw, _)) = state.pending_raw.front() {
                    let len = raw.len();
                    if dst.len() < len {
                        return Err(MediaCoreError::BufferTooSmall {
                            needed: len,
                            got: dst.len(),
                        });
                    }
                    let (raw, _) = state.pending_raw.pop_front().unwrap();
                    dst[..len].copy_from_slice(&raw);
                    return Ok(len);
                }
                if self.closed.load(Ordering::Acquire) {
                    return Err(MediaCoreError::EndOfStream);
                }
            }
            notified.await;
        }
    }

    /// Pop the next extracted packet. Blocks until one is available or the
    /// buffer closes. Packets leave in acceptance order, not RTP sequence
    /// order: a late arrival surfaces late.
    pub async fn read_extended(&self) -> MediaCoreResult<ExtPacket> {
        loop {
            let notified = self.notify_ext.notified();
            tokio::pin!(notified);
            {
                let mut state = self.state.lock().await;
                if let Some(packet) = state.ext_queue.pop_front() {
                    return Ok(packet);
                }
                if self.closed.load(Ordering::Acquire) {
                    return Err(MediaCoreError::EndOfStream);
                }
            }
            notified.await;
        }
    }

    /// Random-access retransmit lookup into the retained ring window.
    pub async fn get_packet(&self, dst: &mut [u8], sn: u16) -> MediaCoreResult<usize> {
        let state = self.state.lock().await;
        state
            .bucket
            .as_ref()
            .ok_or(MediaCoreError::PacketNotFound(sn))?
            .get_packet(dst, sn)
    }

    /// Idempotent close: wakes every blocked `read`/`read_extended`, returns
    /// the bucket's backing array to the pool, and runs `on_close` exactly
    /// once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.notify_read.notify_waiters();
        self.notify_ext.notify_waiters();

        let mut state = self.state.lock().await;
        let kind = state.codec.as_ref().map(|c| c.kind).unwrap_or(CodecKind::Video);
        if let Some(bucket) = state.bucket.take() {
            let backing = bucket.into_backing();
            match kind {
                CodecKind::Audio => self.pool.release_audio(backing),
                _ => self.pool.release_video(backing),
            }
        }
        drop(state);

        if let Some(cb) = &self.on_close {
            cb();
        }
    }
}

/// Pure REMB adjustment formula, factored out for deterministic testing:
/// loss-reactive multiplicative increase/decrease, clamped to
/// `[MIN_BITRATE, max_bitrate]`.
pub fn adjust_remb_bitrate(bitrate: u64, lost_rate: f64, max_bitrate: u64) -> u64 {
    let adjusted = if lost_rate < 0.02 {
        bitrate as f64 * 1.09 + 2000.0
    } else if lost_rate > 0.10 {
        bitrate as f64 * (1.0 - 0.5 * lost_rate)
    } else {
        bitrate as f64
    };
    (adjusted as u64).clamp(MIN_BITRATE, max_bitrate)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rtp_packet(sn: u16, ts: u32) -> Vec<u8> {
        let mut p = vec![0x80, 0x60, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1];
        p[2] = (sn >> 8) as u8;
        p[3] = (sn & 0xFF) as u8;
        p[4..8].copy_from_slice(&ts.to_be_bytes());
        p.extend_from_slice(&[0xAA; 8]);
        p
    }

    fn video_codec() -> Codec {
        Codec {
            mime_type: "audio/opus".to_string(),
            clock_rate: 8000,
            kind: CodecKind::Audio,
        }
    }

    async fn bound_buffer(caps: FeedbackCaps) -> Buffer {
        let pool = Arc::new(Pool::new(32));
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());
        let buffer = Buffer::new(
            12345,
            1,
            pool,
            clock,
            BufferOptions::default(),
            BufferHooks::default(),
        );
        buffer
            .bind(video_codec(), caps, HeaderExtensionIds::default())
            .await;
        buffer
    }

    #[tokio::test]
    async fn sequential_ingestion_tracks_stats_and_allows_retransmit_lookup() {
        let buffer = bound_buffer(FeedbackCaps::default()).await;
        for (i, sn) in (100u16..110).enumerate() {
            buffer
                .write_at(&rtp_packet(sn, i as u32 * 100), i as i64 * 1_000_000)
                .await
                .unwrap();
        }

        let state = buffer.state.lock().await;
        assert_eq!(state.packet_count, 10);
        assert_eq!(state.max_sn, 109);
        assert_eq!(state.base_sn, 100);
        assert!(state.nack_queue.as_ref().map(|q| q.is_empty()).unwrap_or(true));
        drop(state);

        let mut dst = [0u8; 1500];
        let n = buffer.get_packet(&mut dst, 105).await.unwrap();
        assert_eq!(&dst[..n], &rtp_packet(105, 400)[..]);
    }

    #[tokio::test]
    async fn gap_triggers_nack_entries() {
        let caps = FeedbackCaps {
            nack: true,
            ..Default::default()
        };
        let buffer = bound_buffer(caps).await;
        buffer.write_at(&rtp_packet(100, 0), 0).await.unwrap();
        buffer.write_at(&rtp_packet(105, 500), 1_000_000).await.unwrap();

        let mut state = buffer.state.lock().await;
        assert_eq!(state.nack_queue.as_ref().unwrap().len(), 4);
        let head = state.extended_max();
        let (pairs, ask_kf) = state.nack_queue.as_mut().unwrap().pairs(head);
        assert!(!ask_kf);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].packet_id, 101);
        assert_eq!(pairs[0].lost_bitmap, 0b0000_0000_0000_0111);
    }

    #[tokio::test]
    async fn late_packet_fills_gap_and_clears_nack_entry() {
        let caps = FeedbackCaps {
            nack: true,
            ..Default::default()
        };
        let buffer = bound_buffer(caps).await;
        buffer.write_at(&rtp_packet(100, 0), 0).await.unwrap();
        buffer.write_at(&rtp_packet(101, 100), 1_000_000).await.unwrap();
        buffer.write_at(&rtp_packet(103, 300), 2_000_000).await.unwrap();
        buffer.write_at(&rtp_packet(102, 200), 3_000_000).await.unwrap();

        let mut dst = [0u8; 1500];
        let n = buffer.get_packet(&mut dst, 102).await.unwrap();
        assert_eq!(&dst[..n], &rtp_packet(102, 200)[..]);

        let state = buffer.state.lock().await;
        assert!(!state
            .nack_queue
            .as_ref()
            .unwrap()
            .pairs(u32::MAX)
            .0
            .iter()
            .any(|p| p.packet_id == 102));
    }

    #[tokio::test]
    async fn write_after_close_is_end_of_stream() {
        let buffer = bound_buffer(FeedbackCaps::default()).await;
        buffer.close().await;
        assert!(matches!(
            buffer.write_at(&rtp_packet(1, 0), 0).await,
            Err(MediaCoreError::EndOfStream)
        ));
    }

    #[tokio::test]
    async fn unbound_writes_queue_and_drain_on_bind() {
        let pool = Arc::new(Pool::new(32));
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());
        let buffer = Buffer::new(
            1,
            1,
            pool,
            clock,
            BufferOptions::default(),
            BufferHooks::default(),
        );
        buffer.write_at(&rtp_packet(5, 0), 0).await.unwrap();
        buffer.write_at(&rtp_packet(6, 100), 1000).await.unwrap();
        buffer
            .bind(video_codec(), FeedbackCaps::default(), HeaderExtensionIds::default())
            .await;

        let state = buffer.state.lock().await;
        assert_eq!(state.packet_count, 2);
        assert!(state.pending_raw.is_empty());
    }

    #[test]
    fn remb_reacts_to_loss_rate() {
        assert_eq!(adjust_remb_bitrate(1_000_000, 0.15, 2_000_000), 925_000);
        assert_eq!(adjust_remb_bitrate(1_000_000, 0.0, 2_000_000), 1_092_000);
        assert_eq!(adjust_remb_bitrate(1_000_000, 0.05, 2_000_000), 1_000_000);
    }

    #[test]
    fn remb_clamps_to_bounds() {
        assert_eq!(adjust_remb_bitrate(10, 0.0, 2_000_000), MIN_BITRATE);
        assert_eq!(adjust_remb_bitrate(10_000_000, 0.0, 2_000_000), 2_000_000);
    }
}
