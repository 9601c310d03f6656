//! Media capture handle acquisition.
//!
//! The gateway does not touch codec internals; it only needs an opaque
//! capture handle describing the negotiated input profile. Acquisition can
//! be slow (device negotiation), so the handle is cached by `preload` and
//! reused by `connect`. The cache is process-wide for one logical session
//! and must be invalidated on disconnect.

use std::sync::Arc;

use async_trait::async_trait;

use super::{ConnectionError, ConnectionResult};

/// Opaque capture handle for one media source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaHandle {
    /// Device identifier as reported by the capture layer
    pub device_id: String,
    /// Negotiated sample rate in Hz
    pub sample_rate: u32,
    /// Negotiated channel count
    pub channels: u16,
}

/// Source of media capture handles.
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Acquire a capture handle.
    async fn acquire(&self) -> ConnectionResult<MediaHandle>;

    /// Release a previously acquired handle.
    async fn release(&self, handle: MediaHandle) {
        tracing::debug!(device_id = %handle.device_id, "Released media handle");
    }
}

/// Media source that hands out a fixed capture profile.
///
/// The browser owns the actual device; the gateway only records the profile
/// audio frames are expected to arrive in.
pub struct FixedMediaSource {
    profile: MediaHandle,
}

impl FixedMediaSource {
    pub fn new(profile: MediaHandle) -> Self {
        Self { profile }
    }
}

impl Default for FixedMediaSource {
    fn default() -> Self {
        Self {
            profile: MediaHandle {
                device_id: "client-default".to_string(),
                sample_rate: 24000,
                channels: 1,
            },
        }
    }
}

#[async_trait]
impl MediaSource for FixedMediaSource {
    async fn acquire(&self) -> ConnectionResult<MediaHandle> {
        if self.profile.sample_rate == 0 {
            return Err(ConnectionError::MediaUnavailable(
                "capture profile has zero sample rate".to_string(),
            ));
        }
        Ok(self.profile.clone())
    }
}

/// Single-slot media handle cache shared by preload and connect.
pub struct MediaCache {
    source: Arc<dyn MediaSource>,
    cached: tokio::sync::Mutex<Option<MediaHandle>>,
}

impl MediaCache {
    pub fn new(source: Arc<dyn MediaSource>) -> Self {
        Self {
            source,
            cached: tokio::sync::Mutex::new(None),
        }
    }

    /// Return the cached handle, acquiring one if the slot is empty.
    pub async fn get(&self) -> ConnectionResult<MediaHandle> {
        let mut slot = self.cached.lock().await;
        if let Some(handle) = slot.as_ref() {
            return Ok(handle.clone());
        }

        let handle = self.source.acquire().await?;
        tracing::debug!(device_id = %handle.device_id, "Acquired media handle");
        *slot = Some(handle.clone());
        Ok(handle)
    }

    /// Release and drop the cached handle.
    pub async fn invalidate(&self) {
        if let Some(handle) = self.cached.lock().await.take() {
            self.source.release(handle).await;
        }
    }
}
