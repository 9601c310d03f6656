//! Response generation scheduling.
//!
//! Asking the model to generate a reply is guarded by a single-flight
//! lease: at most one request in flight, a cooldown between acquisitions,
//! and a safety timer in case the matching `response.done` is lost. There
//! is deliberately no queue; for voice UX a conflicting request is not
//! better than no request, so losers are dropped and logged at debug level.

mod lease;

pub use lease::{Lease, SingleFlight};

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::core::connection::ConnectionManager;
use crate::core::protocol::{ClientEvent, ResponseOptions};

/// Tunables for the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Minimum gap between accepted response requests
    pub cooldown: Duration,
    /// Safety release if `response.done` never arrives
    pub safety_release: Duration,
    /// Coalescing window for non-urgent requests
    pub debounce: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_millis(1500),
            safety_release: Duration::from_secs(30),
            debounce: Duration::from_millis(500),
        }
    }
}

struct PendingRequest {
    metadata: Option<serde_json::Value>,
    tag: String,
}

struct SchedulerInner {
    manager: ConnectionManager,
    flight: SingleFlight,
    cooldown: Duration,
    debounce: Duration,
    lease: Mutex<Option<Lease>>,
    debounce_generation: AtomicU64,
    pending: Mutex<Option<PendingRequest>>,
}

/// Single-flight response scheduler. Cheap to clone.
#[derive(Clone)]
pub struct ResponseScheduler {
    inner: Arc<SchedulerInner>,
}

impl ResponseScheduler {
    pub fn new(config: SchedulerConfig, manager: ConnectionManager) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                manager,
                flight: SingleFlight::new(config.safety_release),
                cooldown: config.cooldown,
                debounce: config.debounce,
                lease: Mutex::new(None),
                debounce_generation: AtomicU64::new(0),
                pending: Mutex::new(None),
            }),
        }
    }

    /// Request a model reply now.
    ///
    /// Returns false when the request was suppressed (lease active or
    /// cooldown running) or when the send failed; suppression is not an
    /// error.
    pub async fn request_response(&self, metadata: Option<serde_json::Value>, tag: &str) -> bool {
        let Some(lease) = self.inner.flight.acquire(self.inner.cooldown) else {
            tracing::debug!(tag, "Response request suppressed by single-flight guard");
            return false;
        };
        *self.inner.lease.lock() = Some(lease);

        let event = ClientEvent::ResponseCreate {
            response: metadata.map(|metadata| ResponseOptions {
                metadata: Some(metadata),
            }),
        };
        if let Err(e) = self.inner.manager.send(event).await {
            tracing::warn!(tag, "Failed to send response request: {}", e);
            self.release();
            return false;
        }
        tracing::debug!(tag, "Response requested");
        true
    }

    /// Request a model reply after the debounce window; calls landing
    /// inside one window coalesce into a single send carrying the latest
    /// metadata. For caller-triggered, non-urgent requests such as
    /// language-change reminders.
    pub fn request_response_debounced(&self, metadata: Option<serde_json::Value>, tag: &str) {
        *self.inner.pending.lock() = Some(PendingRequest {
            metadata,
            tag: tag.to_string(),
        });
        let generation = self.inner.debounce_generation.fetch_add(1, Ordering::SeqCst) + 1;

        let scheduler = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(scheduler.inner.debounce).await;
            if scheduler.inner.debounce_generation.load(Ordering::SeqCst) != generation {
                return; // superseded by a newer call
            }
            let pending = scheduler.inner.pending.lock().take();
            if let Some(request) = pending {
                scheduler
                    .request_response(request.metadata, &request.tag)
                    .await;
            }
        });
    }

    /// Release the lease; called when the completion event arrives.
    pub fn release(&self) {
        if let Some(lease) = self.inner.lease.lock().take() {
            lease.release();
        } else {
            self.inner.flight.release();
        }
    }

    /// Cancel the in-flight reply. Sends `response.cancel`, clears the
    /// output buffer when audio is actively playing, and releases the
    /// lease immediately rather than waiting for the safety timer.
    pub async fn cancel_active(&self, output_active: bool) {
        let _ = self.inner.manager.send(ClientEvent::ResponseCancel).await;
        if output_active {
            let _ = self
                .inner
                .manager
                .send(ClientEvent::OutputAudioBufferClear)
                .await;
        }
        self.release();
    }

    /// Whether a response request is currently in flight.
    pub fn is_locked(&self) -> bool {
        self.inner.flight.is_active()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::transport::testing::ScriptedTransport;
    use crate::core::connection::{
        ConnectionConfig, ConnectionManager, ConnectionResult, CredentialProvider,
        EphemeralCredential, FixedMediaSource, RealtimeTransport,
    };
    use crate::core::protocol::ServerEvent;
    use std::time::SystemTime;
    use tokio::sync::mpsc;

    struct StaticCredentials;

    #[async_trait::async_trait]
    impl CredentialProvider for StaticCredentials {
        async fn fetch(&self) -> ConnectionResult<EphemeralCredential> {
            Ok(EphemeralCredential {
                value: "tok".to_string(),
                expires_at: SystemTime::now() + Duration::from_secs(600),
            })
        }
    }

    use crate::core::connection::transport::testing::ScriptedChannel;

    async fn connected_scheduler() -> (
        ResponseScheduler,
        ScriptedChannel,
        mpsc::Receiver<ServerEvent>,
    ) {
        let transport = Arc::new(ScriptedTransport::default());
        let (event_tx, event_rx) = mpsc::channel(64);
        let manager = ConnectionManager::new(
            ConnectionConfig::default(),
            Arc::new(StaticCredentials),
            Arc::new(FixedMediaSource::default()),
            transport.clone() as Arc<dyn RealtimeTransport>,
            event_tx,
        );
        manager.connect().await.unwrap();
        // Keep the harness side alive so the channel stays open.
        let channel = transport.opened.lock().pop().unwrap();
        let scheduler = ResponseScheduler::new(SchedulerConfig::default(), manager);
        (scheduler, channel, event_rx)
    }

    fn count_response_creates(rx: &mut mpsc::Receiver<ClientEvent>) -> usize {
        let mut count = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, ClientEvent::ResponseCreate { .. }) {
                count += 1;
            }
        }
        count
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_inside_cooldown_send_once() {
        let (scheduler, mut channel, _events) = connected_scheduler().await;

        assert!(scheduler.request_response(None, "first").await);
        scheduler.release();
        // Within the 1.5 s cooldown window.
        assert!(!scheduler.request_response(None, "second").await);

        assert_eq!(count_response_creates(&mut channel.sent), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_then_cooldown_elapsed_allows_next() {
        let (scheduler, mut channel, _events) = connected_scheduler().await;

        assert!(scheduler.request_response(None, "first").await);
        scheduler.release();
        tokio::time::advance(Duration::from_millis(1600)).await;
        assert!(scheduler.request_response(None, "second").await);

        assert_eq!(count_response_creates(&mut channel.sent), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_safety_timer_releases_lost_completion() {
        let (scheduler, _channel, _events) = connected_scheduler().await;

        assert!(scheduler.request_response(None, "first").await);
        assert!(scheduler.is_locked());

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(!scheduler.is_locked());
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounced_requests_coalesce() {
        let (scheduler, mut channel, _events) = connected_scheduler().await;

        scheduler.request_response_debounced(None, "reminder");
        scheduler.request_response_debounced(None, "reminder");
        scheduler.request_response_debounced(None, "reminder");

        tokio::time::sleep(Duration::from_millis(700)).await;
        tokio::task::yield_now().await;

        assert_eq!(count_response_creates(&mut channel.sent), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_clears_output_buffer_and_releases() {
        let (scheduler, mut channel, _events) = connected_scheduler().await;

        assert!(scheduler.request_response(None, "first").await);
        scheduler.cancel_active(true).await;
        assert!(!scheduler.is_locked());

        let mut saw_cancel = false;
        let mut saw_clear = false;
        while let Ok(event) = channel.sent.try_recv() {
            match event {
                ClientEvent::ResponseCancel => saw_cancel = true,
                ClientEvent::OutputAudioBufferClear => saw_clear = true,
                _ => {}
            }
        }
        assert!(saw_cancel && saw_clear);
    }
}
