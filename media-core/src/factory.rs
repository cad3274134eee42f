//! SSRC-keyed registry handing out `Buffer`/`RtcpReader` pairs.
//!
//! Grounded on `media-relay/src/relay_server.rs`'s `RwLock<HashMap<..>>`
//! connection table, generalized to two maps (RTP buffers, RTCP readers)
//! keyed by SSRC instead of socket address, and on
//! `realtime-media-engine/src/stream_manager.rs`'s get-or-create-by-key
//! shape. Buffers self-remove from the map through a `Weak<Factory>`
//! captured in their `on_close` hook, so a closed stream never leaks its
//! entry.
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

use crate::buffer::{Buffer, BufferHooks, BufferOptions, Clock, MonotonicClock};
use crate::pool::Pool;
use crate::rtcp_reader::RtcpReader;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Knobs shared by every `Buffer` a `Factory` creates.
#[derive(Debug, Clone, Copy)]
pub struct FactoryOptions {
    /// Ring-buffer slot count for video streams; audio is always a fixed,
    /// smaller window (see `pool::AUDIO_SLOT_COUNT`).
    pub tracking_packets: u16,
}

impl Default for FactoryOptions {
    fn default() -> Self {
        FactoryOptions {
            tracking_packets: 250,
        }
    }
}

/// Owns the SSRC -> `Buffer` and SSRC -> `RtcpReader` tables for one
/// transport, plus the byte-buffer pool they share.
pub struct Factory {
    pool: Arc<Pool>,
    clock: Arc<dyn Clock>,
    buffers: RwLock<HashMap<u32, Arc<Buffer>>>,
    rtcp_readers: RwLock<HashMap<u32, Arc<RtcpReader>>>,
}

impl Factory {
    /// Build a factory with its own monotonic clock, shared by every
    /// `Buffer` it creates so their arrival timestamps stay comparable
    /// (needed for cross-SSRC TWCC aggregation downstream).
    pub fn new(options: FactoryOptions) -> Arc<Self> {
        Self::with_clock(options, Arc::new(MonotonicClock::new()))
    }

    /// Like `new`, but with an explicit clock. Exposed for tests that need
    /// deterministic arrival times across multiple buffers.
    pub fn with_clock(options: FactoryOptions, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Factory {
            pool: Arc::new(Pool::new(options.tracking_packets)),
            clock,
            buffers: RwLock::new(HashMap::new()),
            rtcp_readers: RwLock::new(HashMap::new()),
        })
    }

    /// Fetch the existing `Buffer` for `ssrc`, or create one. The returned
    /// buffer is unbound; call `bind` on it once the codec is known.
    pub async fn get_or_new_buffer(
        self: &Arc<Self>,
        ssrc: u32,
        sender_ssrc: u32,
        options: BufferOptions,
        mut hooks: BufferHooks,
    ) -> Arc<Buffer> {
        let mut buffers = self.buffers.write().await;
        if let Some(existing) = buffers.get(&ssrc) {
            return existing.clone();
        }

        let user_on_close = hooks.on_close.take();
        let weak_self = Arc::downgrade(self);
        hooks.on_close = Some(Arc::new(move || {
            if let Some(cb) = &user_on_close {
                cb();
            }
            if let Some(factory) = weak_self.upgrade() {
                tokio::spawn(async move {
                    factory.buffers.write().await.remove(&ssrc);
                });
            }
        }));

        let buffer = Arc::new(Buffer::new(
            ssrc,
            sender_ssrc,
            self.pool.clone(),
            self.clock.clone(),
            options,
            hooks,
        ));
        buffers.insert(ssrc, buffer.clone());
        buffer
    }

    /// Fetch the existing `Buffer` for `ssrc`, if one has been created.
    pub async fn get_buffer(&self, ssrc: u32) -> Option<Arc<Buffer>> {
        self.buffers.read().await.get(&ssrc).cloned()
    }

    /// Fetch the existing `RtcpReader` for `ssrc`, or create one.
    pub async fn get_or_new_rtcp_reader(self: &Arc<Self>, ssrc: u32) -> Arc<RtcpReader> {
        let mut readers = self.rtcp_readers.write().await;
        if let Some(existing) = readers.get(&ssrc) {
            return existing.clone();
        }

        let reader = Arc::new(RtcpReader::new());
        let weak_self = Arc::downgrade(self);
        reader
            .set_on_close(Arc::new(move || {
                if let Some(factory) = weak_self.upgrade() {
                    tokio::spawn(async move {
                        factory.rtcp_readers.write().await.remove(&ssrc);
                    });
                }
            }))
            .await;

        readers.insert(ssrc, reader.clone());
        reader
    }

    /// Fetch the existing `RtcpReader` for `ssrc`, if one has been created.
    pub async fn get_rtcp_reader(&self, ssrc: u32) -> Option<Arc<RtcpReader>> {
        self.rtcp_readers.read().await.get(&ssrc).cloned()
    }

    /// Fetch both halves for `ssrc`, if both have been created.
    pub async fn get_pair(&self, ssrc: u32) -> Option<(Arc<Buffer>, Arc<RtcpReader>)> {
        let buffer = self.get_buffer(ssrc).await?;
        let reader = self.get_rtcp_reader(ssrc).await?;
        Some((buffer, reader))
    }

    /// Number of `Buffer`s currently registered.
    pub async fn buffer_count(&self) -> usize {
        self.buffers.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::FeedbackCaps;
    use crate::buffer::{Codec, CodecKind, HeaderExtensionIds};

    #[tokio::test]
    async fn get_or_new_buffer_returns_same_instance_on_repeat_calls() {
        let factory = Factory::new(FactoryOptions::default());
        let a = factory
            .get_or_new_buffer(100, 1, BufferOptions::default(), BufferHooks::default())
            .await;
        let b = factory
            .get_or_new_buffer(100, 1, BufferOptions::default(), BufferHooks::default())
            .await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(factory.buffer_count().await, 1);
    }

    #[tokio::test]
    async fn distinct_ssrcs_get_distinct_buffers() {
        let factory = Factory::new(FactoryOptions::default());
        let a = factory
            .get_or_new_buffer(1, 1, BufferOptions::default(), BufferHooks::default())
            .await;
        let b = factory
            .get_or_new_buffer(2, 1, BufferOptions::default(), BufferHooks::default())
            .await;
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(factory.buffer_count().await, 2);
    }

    #[tokio::test]
    async fn closing_a_buffer_removes_it_from_the_registry() {
        let factory = Factory::new(FactoryOptions::default());
        let buffer = factory
            .get_or_new_buffer(7, 1, BufferOptions::default(), BufferHooks::default())
            .await;
        buffer
            .bind(
                Codec {
                    mime_type: "audio/opus".to_string(),
                    clock_rate: 8000,
                    kind: CodecKind::Audio,
                },
                FeedbackCaps::default(),
                HeaderExtensionIds::default(),
            )
            .await;
        buffer.close().await;

        // on_close hand-off to the registry runs on a spawned task.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        assert!(factory.get_buffer(7).await.is_none());
    }

    #[tokio::test]
    async fn get_pair_requires_both_halves_created() {
        let factory = Factory::new(FactoryOptions::default());
        factory
            .get_or_new_buffer(5, 1, BufferOptions::default(), BufferHooks::default())
            .await;
        assert!(factory.get_pair(5).await.is_none());

        factory.get_or_new_rtcp_reader(5).await;
        assert!(factory.get_pair(5).await.is_some());
    }
}
