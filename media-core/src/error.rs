//! Error types for the media core engine
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


use thiserror::Error;

/// Result type for media core operations
pub type MediaCoreResult<T> = Result<T, MediaCoreError>;

/// Errors that can occur while buffering and extracting RTP, and while
/// building RTCP/TWCC feedback.
///
/// Packet-level variants (`ShortPacket`, `NilPacket`, `PacketTooOld`,
/// `DuplicatePacket`, `Unmarshal`) are absorbed by the pipeline: `Buffer`
/// logs them and drops the packet rather than propagating them. The rest
/// surface to the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaCoreError {
    /// A payload parser walked past the end of the packet.
    #[error("short packet: {0}")]
    ShortPacket(String),

    /// A parser was handed a zero-length payload.
    #[error("nil packet")]
    NilPacket,

    /// `get_packet` was asked for a sequence number that was never written
    /// or has since been overwritten by ring-buffer wraparound.
    #[error("packet not found: sn={0}")]
    PacketNotFound(u16),

    /// The caller's destination slice is smaller than the stored packet.
    #[error("destination buffer too small: need {needed}, have {got}")]
    BufferTooSmall {
        /// Bytes required to hold the stored packet.
        needed: usize,
        /// Bytes actually available in the caller's destination.
        got: usize,
    },

    /// An out-of-order write fell outside the ring buffer's retained window.
    #[error("packet too old: sn={0}")]
    PacketTooOld(u16),

    /// An out-of-order write landed on a slot already holding the same sn.
    #[error("duplicate packet: sn={0}")]
    DuplicatePacket(u16),

    /// An operation was attempted after `close`.
    #[error("end of stream")]
    EndOfStream,

    /// RTP/RTCP header bytes failed to parse.
    #[error("unmarshal error: {0}")]
    Unmarshal(String),
}

impl MediaCoreError {
    /// True for errors the pipeline absorbs (drops the packet, logs, and
    /// continues) rather than surfaces to a caller.
    pub fn is_absorbed(&self) -> bool {
        matches!(
            self,
            MediaCoreError::ShortPacket(_)
                | MediaCoreError::NilPacket
                | MediaCoreError::PacketTooOld(_)
                | MediaCoreError::DuplicatePacket(_)
                | MediaCoreError::Unmarshal(_)
        )
    }
}
