//! Per-SSRC RTP buffering and RTCP/TWCC feedback engine for an SFU media
//! plane.
//!
//! This crate covers the media-plane core only:
//! - RTP/RTCP parsing and construction (`rtp_handler`, `rtcp`)
//! - VP8/H.264 payload inspection for keyframe detection (`vp8_payload`,
//!   `h264_payload`)
//! - A fixed-capacity retransmission ring per SSRC (`bucket`)
//! - Generic NACK tracking with keyframe escalation (`nack`)
//! - Transport-wide congestion control feedback encoding (`twcc`)
//! - The `Buffer` pipeline tying the above into one per-SSRC stream, and
//!   the `Factory` registry that hands buffers out by SSRC
//!
//! Packetization for sending, SRTP, ICE/DTLS, and signaling live in other
//! crates; this one only ingests already-decrypted RTP/RTCP.
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

pub mod bucket;
pub mod buffer;
pub mod error;
pub mod factory;
pub mod h264_payload;
pub mod nack;
pub mod pool;
pub mod rtcp;
pub mod rtcp_reader;
pub mod rtp_handler;
pub mod seq;
pub mod twcc;
pub mod vp8_payload;

pub use buffer::{
    Buffer, BufferHooks, BufferOptions, Clock, Codec, CodecKind, ExtPacket, Feedback,
    FeedbackCaps, HeaderExtensionIds, MonotonicClock,
};
pub use bucket::Bucket;
pub use error::{MediaCoreError, MediaCoreResult};
pub use factory::{Factory, FactoryOptions};
pub use nack::{NackPair, NackQueue};
pub use pool::Pool;
pub use rtcp::{
    GenericNack, Pli, ReceiverReport, ReceptionReport, Remb, RtcpHeader, RtcpPacketType,
    SenderReport,
};
pub use rtcp_reader::RtcpReader;
pub use rtp_handler::{ExtensionHeader, RtpHeader, RtpPacket};
pub use twcc::TwccResponder;
pub use vp8_payload::Vp8Descriptor;
