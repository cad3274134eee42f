//! Shared pool of `Bucket` backing byte arrays.
//!
//! Generalized from a reusable-buffer idea into a size-tiered pool: video
//! streams get a
//! `tracking_packets`-slot backing array, audio a fixed 25-slot one. A
//! `Buffer` borrows one array for the lifetime of its `Bucket` and returns it
//! on close; the pool is the sole arbiter of ownership between loans.
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

use crate::bucket::MAX_PACKET_SIZE;
use std::sync::Mutex;

/// Audio buckets are sized for a short, fixed retransmission window;
/// audio's low bitrate makes a wide video-sized window wasteful.
pub const AUDIO_SLOT_COUNT: usize = 25;

/// Caps how many spare arrays of one tier are kept around after a release,
/// so a burst of short-lived streams doesn't pin memory indefinitely.
const MAX_SPARE_PER_TIER: usize = 64;

/// Size-tiered pool of `Bucket` backing byte arrays.
pub struct Pool {
    video_slots: usize,
    video_spare: Mutex<Vec<Box<[u8]>>>,
    audio_spare: Mutex<Vec<Box<[u8]>>>,
}

impl Pool {
    /// Build a pool whose video tier backs a `tracking_packets`-slot
    /// `Bucket`; the audio tier is always `AUDIO_SLOT_COUNT` slots.
    pub fn new(tracking_packets: u16) -> Self {
        Pool {
            video_slots: (tracking_packets as usize).max(1),
            video_spare: Mutex::new(Vec::new()),
            audio_spare: Mutex::new(Vec::new()),
        }
    }

    /// Number of slots a video `Bucket` backing array holds.
    pub fn video_slot_count(&self) -> usize {
        self.video_slots
    }

    /// Borrow a video-tier backing array, reusing a spare one if available.
    pub fn acquire_video(&self) -> Box<[u8]> {
        Self::acquire(&self.video_spare, self.video_slots)
    }

    /// Borrow an audio-tier backing array, reusing a spare one if available.
    pub fn acquire_audio(&self) -> Box<[u8]> {
        Self::acquire(&self.audio_spare, AUDIO_SLOT_COUNT)
    }

    /// Return a video-tier array for reuse by a later loan.
    pub fn release_video(&self, backing: Box<[u8]>) {
        Self::release(&self.video_spare, backing, self.video_slots);
    }

    /// Return an audio-tier array for reuse by a later loan.
    pub fn release_audio(&self, backing: Box<[u8]>) {
        Self::release(&self.audio_spare, backing, AUDIO_SLOT_COUNT);
    }

    fn acquire(spare: &Mutex<Vec<Box<[u8]>>>, slots: usize) -> Box<[u8]> {
        if let Some(buf) = spare.lock().expect("pool mutex poisoned").pop() {
            return buf;
        }
        vec![0u8; slots * MAX_PACKET_SIZE].into_boxed_slice()
    }

    fn release(spare: &Mutex<Vec<Box<[u8]>>>, backing: Box<[u8]>, slots: usize) {
        if backing.len() != slots * MAX_PACKET_SIZE {
            // Backing array sized for a different tracking_packets config
            // than this pool currently runs; let it drop instead of
            // corrupting tier sizing for future loans.
            return;
        }
        let mut guard = spare.lock().expect("pool mutex poisoned");
        if guard.len() < MAX_SPARE_PER_TIER {
            guard.push(backing);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_gives_correctly_sized_arrays() {
        let pool = Pool::new(100);
        let video = pool.acquire_video();
        assert_eq!(video.len(), 100 * MAX_PACKET_SIZE);
        let audio = pool.acquire_audio();
        assert_eq!(audio.len(), AUDIO_SLOT_COUNT * MAX_PACKET_SIZE);
    }

    #[test]
    fn released_array_is_reused() {
        let pool = Pool::new(10);
        let video = pool.acquire_video();
        let ptr = video.as_ptr();
        pool.release_video(video);
        let reused = pool.acquire_video();
        assert_eq!(reused.as_ptr(), ptr);
    }

    #[test]
    fn spare_cap_drops_excess_releases() {
        let pool = Pool::new(1);
        let mut bufs = Vec::new();
        for _ in 0..MAX_SPARE_PER_TIER + 5 {
            bufs.push(pool.acquire_video());
        }
        for buf in bufs {
            pool.release_video(buf);
        }
        assert_eq!(pool.video_spare.lock().unwrap().len(), MAX_SPARE_PER_TIER);
    }
}
