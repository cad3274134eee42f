//! Inbound RTCP sink with a swappable dispatch callback.
//!
//! Grounded on the `RwLock`-guarded callback pattern
//! `media-relay/src/relay_server.rs` uses for its connection map: the
//! callback slot is guarded by a read-lock for dispatch so swapping it at
//! runtime (dynamic route wiring) can never race with an in-flight `write`.
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
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Callback invoked with each inbound RTCP packet's raw bytes.
pub type OnPacketFn = dyn Fn(&[u8]) + Send + Sync;

/// Callback invoked exactly once, when an `RtcpReader` closes.
pub type OnCloseFn = dyn Fn() + Send + Sync;

/// Minimal sink for inbound RTCP: dispatches raw bytes to a swappable
/// `on_packet` callback.
pub struct RtcpReader {
    on_packet: RwLock<Option<Arc<OnPacketFn>>>,
    on_close: RwLock<Option<Arc<OnCloseFn>>>,
    closed: AtomicBool,
}

impl RtcpReader {
    /// Build a reader with no callback set.
    pub fn new() -> Self {
        RtcpReader {
            on_packet: RwLock::new(None),
            on_close: RwLock::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Swap the dispatch callback. Safe to call concurrently with `write`:
    /// dispatch takes a read-lock, so a swap only ever waits behind
    /// in-flight dispatches, never races one.
    pub async fn set_on_packet(&self, f: Arc<OnPacketFn>) {
        *self.on_packet.write().await = Some(f);
    }

    /// Set the close hook. Like the other non-`on_packet` callback slots
    /// across this crate, this is meant to be set once before the reader is
    /// used; calling it again after `write`/`close` have started has
    /// undefined ordering against an in-flight close.
    pub async fn set_on_close(&self, f: Arc<OnCloseFn>) {
        *self.on_close.write().await = Some(f);
    }

    /// True once `close` has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Dispatch one inbound RTCP packet's bytes to the current `on_packet`
    /// callback, if any is set.
    pub async fn write(&self, data: &[u8]) -> MediaCoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MediaCoreError::EndOfStream);
        }
        let guard = self.on_packet.read().await;
        if let Some(cb) = guard.as_ref() {
            cb(data);
        }
        Ok(())
    }

    /// Idempotent close: the first caller to observe `closed` transition
    /// runs `on_close` exactly once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(cb) = self.on_close.read().await.as_ref() {
            cb();
        }
    }
}

impl Default for RtcpReader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn dispatches_to_current_callback() {
        let reader = RtcpReader::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        reader
            .set_on_packet(Arc::new(move |_data: &[u8]| {
                count2.fetch_add(1, Ordering::SeqCst);
            }))
            .await;

        reader.write(&[1, 2, 3]).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn write_after_close_is_end_of_stream() {
        let reader = RtcpReader::new();
        reader.close().await;
        assert!(matches!(
            reader.write(&[1]).await,
            Err(MediaCoreError::EndOfStream)
        ));
    }

    #[tokio::test]
    async fn close_runs_hook_exactly_once() {
        let reader = RtcpReader::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        reader
            .set_on_close(Arc::new(move || {
                count2.fetch_add(1, Ordering::SeqCst);
            }))
            .await;

        reader.close().await;
        reader.close().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
