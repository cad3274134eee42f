//! Selective Retransmission (NACK)
//!
//! Tracks missing extended sequence numbers for one SSRC and turns them
//! into coalesced RTCP Generic NACK pairs, escalating to a keyframe request
//! once a gap has been requested `MAX_NACK_TIMES` times without success.
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


/// Entries beyond this count cause the oldest (smallest ext_sn) to be dropped.
pub const MAX_NACK_CACHE: usize = 100;

/// Attempts at or beyond this count are considered expired and escalate to a
/// keyframe request instead of a further NACK.
pub const MAX_NACK_TIMES: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct NackEntry {
    ext_sn: u32,
    attempt_count: u8,
}

/// One coalesced NACK entry: `packet_id` is the base sequence number; bit
/// `k` of `lost_bitmap` marks that `packet_id + k + 1` is also missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NackPair {
    /// Sequence number of the first missing packet in this pair.
    pub packet_id: u16,
    /// Bitmap of additional missing packets at offsets 1..=16 from `packet_id`.
    pub lost_bitmap: u16,
}

/// Sorted set of missing extended sequence numbers awaiting retransmission.
pub struct NackQueue {
    entries: Vec<NackEntry>,
    /// Highest ext_sn that has already escalated to a keyframe request.
    kf_sn: u32,
}

impl Default for NackQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl NackQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        NackQueue {
            entries: Vec::new(),
            kf_sn: 0,
        }
    }

    /// Number of entries currently tracked.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no sequence numbers are currently tracked as missing.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Highest ext_sn that has already triggered a keyframe escalation.
    pub fn kf_sn(&self) -> u32 {
        self.kf_sn
    }

    /// Record `ext_sn` as missing. A duplicate is a no-op; once the queue
    /// reaches `MAX_NACK_CACHE` the oldest (smallest) entry is evicted to
    /// make room.
    pub fn push(&mut self, ext_sn: u32) {
        let pos = match self.entries.binary_search_by_key(&ext_sn, |e| e.ext_sn) {
            Ok(_) => return,
            Err(pos) => pos,
        };
        self.entries.insert(
            pos,
            NackEntry {
                ext_sn,
                attempt_count: 0,
            },
        );
        if self.entries.len() > MAX_NACK_CACHE {
            self.entries.remove(0);
        }
    }

    /// Stop tracking `ext_sn`, e.g. once a late arrival fills the gap.
    pub fn remove(&mut self, ext_sn: u32) {
        if let Ok(pos) = self.entries.binary_search_by_key(&ext_sn, |e| e.ext_sn) {
            self.entries.remove(pos);
        }
    }

    /// Sweep the queue once, producing the NACK pairs to send this round and
    /// whether a keyframe should be requested.
    ///
    /// `head_ext_sn` is the current extended sequence number of the most
    /// recently accepted packet. An entry within the last 2 sequence numbers
    /// of `head_ext_sn` (inclusive) is treated as not-yet-actually-missing
    /// and left untouched; every other entry either expires into a keyframe
    /// request (after `MAX_NACK_TIMES` attempts) or is retried and coalesced
    /// into the returned pairs.
    pub fn pairs(&mut self, head_ext_sn: u32) -> (Vec<NackPair>, bool) {
        let mut ask_keyframe = false;
        let mut retained = Vec::with_capacity(self.entries.len());
        let mut pending_sns = Vec::new();
        let too_recent_floor = head_ext_sn.saturating_sub(2);

        for entry in self.entries.drain(..) {
            if entry.ext_sn >= too_recent_floor {
                retained.push(entry);
                continue;
            }
            if entry.attempt_count >= MAX_NACK_TIMES {
                if entry.ext_sn > self.kf_sn {
                    self.kf_sn = entry.ext_sn;
                }
                ask_keyframe = true;
                continue;
            }
            pending_sns.push(entry.ext_sn as u16);
            retained.push(NackEntry {
                ext_sn: entry.ext_sn,
                attempt_count: entry.attempt_count + 1,
            });
        }

        self.entries = retained;
        (Self::build_pairs(&pending_sns), ask_keyframe)
    }

    /// Coalesce a sorted run of truncated sequence numbers into 17-wide
    /// `[base, base+16]` pairs, breaking a window whenever the next sn's
    /// unsigned 16-bit distance from the current base exceeds 16.
    fn build_pairs(sns: &[u16]) -> Vec<NackPair> {
        let mut pairs = Vec::new();
        let mut window: Option<(u16, u16)> = None;

        for &sn in sns {
            match window {
                None => window = Some((sn, 0)),
                Some((base, bitmap)) => {
                    let distance = sn.wrapping_sub(base);
                    if distance >= 1 && distance <= 16 {
                        window = Some((base, bitmap | (1 << (distance - 1))));
                    } else {
                        pairs.push(NackPair {
                            packet_id: base,
                            lost_bitmap: bitmap,
                        });
                        window = Some((sn, 0));
                    }
                }
            }
        }

        if let Some((packet_id, lost_bitmap)) = window {
            pairs.push(NackPair {
                packet_id,
                lost_bitmap,
            });
        }

        pairs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_then_remove_restores_prior_state() {
        let mut q = NackQueue::new();
        q.push(10);
        q.push(20);
        q.push(15);
        q.remove(15);
        let (pairs, _) = q.pairs(1000);
        // 10 and 20 are far apart, so two separate pairs.
        assert_eq!(pairs.len(), 2);
    }

    #[test]
    fn push_is_idempotent_on_duplicates() {
        let mut q = NackQueue::new();
        q.push(10);
        q.push(10);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn cache_evicts_oldest_beyond_capacity() {
        let mut q = NackQueue::new();
        for sn in 0..(MAX_NACK_CACHE as u32 + 1) {
            q.push(sn * 100);
        }
        assert_eq!(q.len(), MAX_NACK_CACHE);
        // The smallest (sn=0) should have been evicted.
        let (pairs, _) = q.pairs(u32::MAX);
        assert!(pairs.iter().all(|p| p.packet_id != 0));
    }

    #[test]
    fn gap_coalesces_into_single_pair() {
        let mut q = NackQueue::new();
        for sn in 101..105u32 {
            q.push(sn);
        }
        assert_eq!(q.len(), 4);

        let (pairs, ask_kf) = q.pairs(105);
        assert!(!ask_kf);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].packet_id, 101);
        assert_eq!(pairs[0].lost_bitmap, 0b0000_0000_0000_0111);
        assert_eq!(q.len(), 4);
    }

    #[test]
    fn three_strikes_escalate_to_keyframe() {
        let mut q = NackQueue::new();
        q.push(50);

        for _ in 0..3 {
            let (pairs, ask_kf) = q.pairs(100);
            assert_eq!(pairs.len(), 1);
            assert!(!ask_kf);
        }

        let (pairs, ask_kf) = q.pairs(100);
        assert!(pairs.is_empty());
        assert!(ask_kf);
        assert_eq!(q.kf_sn(), 50);
        assert!(q.is_empty());
    }

    #[test]
    fn window_break_is_wrap_aware() {
        let mut q = NackQueue::new();
        q.push(65530);
        q.push(4); // wraps past 65535; distance from 65530 is 10, same window
        let (pairs, _) = q.pairs(u32::MAX);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].packet_id, 65530);
        assert_eq!(pairs[0].lost_bitmap, 1 << 9);
    }

    #[test]
    fn distant_sn_opens_new_window() {
        let mut q = NackQueue::new();
        q.push(0);
        q.push(20); // distance 20 > 16, must start a new window
        let (pairs, _) = q.pairs(1000);
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].packet_id, 0);
        assert_eq!(pairs[1].packet_id, 20);
    }

    #[test]
    fn entries_at_or_past_head_are_left_untouched() {
        let mut q = NackQueue::new();
        q.push(200);
        let (pairs, ask_kf) = q.pairs(100);
        assert!(pairs.is_empty());
        assert!(!ask_kf);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn entries_within_two_of_head_are_too_recent() {
        let mut q = NackQueue::new();
        q.push(98);
        q.push(99);
        q.push(100);
        q.push(97);
        let (pairs, ask_kf) = q.pairs(100);
        assert!(!ask_kf);
        // 97 is more than 2 behind head=100 and gets NACKed; 98/99/100 don't.
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].packet_id, 97);
        assert_eq!(q.len(), 4);
    }
}
