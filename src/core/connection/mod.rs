//! Connection lifecycle management.
//!
//! `ConnectionManager` owns the transport session: credential and media
//! acquisition (with preload caching), the connect/disconnect state machine,
//! the guarded `send` primitive, and the reconnection policy. Everything
//! above this layer talks to the upstream backend through `send` and
//! receives protocol events from the queue the manager feeds.
//!
//! # Reconnection
//!
//! Reconnection is driven by drops from a previously `Connected` state
//! (unexpected channel close or a blocked `send`); failures during the
//! initial `Connecting` phase never self-trigger it. One sequence runs at
//! a time, delays grow as `base * 1.5^(attempt-1)`, and after
//! `max_reconnect_attempts` the counter resets and the manager stays
//! `Disconnected` until the next explicit `connect` or triggering event.

mod credentials;
mod media;
pub(crate) mod transport;

pub use credentials::{
    CredentialCache, CredentialProvider, EphemeralCredential, HttpCredentialProvider,
};
pub use media::{FixedMediaSource, MediaCache, MediaHandle, MediaSource};
pub use transport::{ChannelPair, RealtimeTransport, WsTransport};

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::protocol::{ClientEvent, ServerEvent};

// =============================================================================
// Errors
// =============================================================================

/// Errors produced by the connection layer.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Credential endpoint failed or returned garbage
    #[error("Credential fetch failed: {0}")]
    CredentialFetch(String),

    /// Media capture handle could not be acquired
    #[error("Media device unavailable: {0}")]
    MediaUnavailable(String),

    /// Transport/channel negotiation failed
    #[error("Transport failure: {0}")]
    Transport(String),

    /// Connect attempt exceeded the hard cap
    #[error("Connect attempt timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// Send attempted while the channel is not open
    #[error("Transport channel is not open")]
    ChannelClosed,
}

/// Result type for connection operations.
pub type ConnectionResult<T> = Result<T, ConnectionError>;

// =============================================================================
// Status & Configuration
// =============================================================================

/// Link status of the managed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkStatus {
    /// No transport session
    #[default]
    Disconnected,
    /// Connect attempt in flight
    Connecting,
    /// Channel open and ready
    Connected,
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkStatus::Disconnected => write!(f, "Disconnected"),
            LinkStatus::Connecting => write!(f, "Connecting"),
            LinkStatus::Connected => write!(f, "Connected"),
        }
    }
}

/// Tunables for the connection lifecycle.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Hard cap on one connect attempt
    pub connect_timeout: Duration,
    /// First reconnection delay
    pub reconnect_base_delay: Duration,
    /// Attempts per reconnection sequence before giving up
    pub max_reconnect_attempts: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(8),
            reconnect_base_delay: Duration::from_secs(1),
            max_reconnect_attempts: 3,
        }
    }
}

impl ConnectionConfig {
    /// Delay before the given attempt: `base * 1.5^(attempt-1)`.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let factor = 1.5f64.powi(attempt.saturating_sub(1) as i32);
        self.reconnect_base_delay.mul_f64(factor)
    }
}

/// Bookkeeping for the reconnection policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReconnectState {
    /// Attempts made in the current sequence
    pub attempts: u32,
    /// Whether a sequence is running
    pub in_progress: bool,
    /// When the last attempt started
    pub last_attempt_at: Option<Instant>,
}

/// Callback invoked after a successful reconnection so the previously
/// active agent can be re-activated on the fresh session.
pub type ReactivationHook =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

// =============================================================================
// Connection Manager
// =============================================================================

/// Owns one logical session's transport lifecycle.
///
/// Cheap to clone; clones share state. The design assumes at most one
/// manager per client: the credential and media caches it owns are one
/// session's worth and are invalidated on `disconnect`.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    config: ConnectionConfig,
    credentials: CredentialCache,
    media: MediaCache,
    transport: Arc<dyn RealtimeTransport>,
    status: parking_lot::RwLock<LinkStatus>,
    outbound: parking_lot::Mutex<Option<mpsc::Sender<ClientEvent>>>,
    channel_shutdown: parking_lot::Mutex<Option<CancellationToken>>,
    /// Bumped once per transport instance; stale channel-close callbacks
    /// compare against it and bail
    channel_serial: AtomicU64,
    reconnect: parking_lot::Mutex<ReconnectState>,
    event_tx: mpsc::Sender<ServerEvent>,
    reactivation: parking_lot::Mutex<Option<ReactivationHook>>,
}

impl ConnectionManager {
    /// Build a manager feeding inbound protocol events into `event_tx`.
    pub fn new(
        config: ConnectionConfig,
        credentials: Arc<dyn CredentialProvider>,
        media: Arc<dyn MediaSource>,
        transport: Arc<dyn RealtimeTransport>,
        event_tx: mpsc::Sender<ServerEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                credentials: CredentialCache::new(credentials),
                media: MediaCache::new(media),
                transport,
                status: parking_lot::RwLock::new(LinkStatus::Disconnected),
                outbound: parking_lot::Mutex::new(None),
                channel_shutdown: parking_lot::Mutex::new(None),
                channel_serial: AtomicU64::new(0),
                reconnect: parking_lot::Mutex::new(ReconnectState::default()),
                event_tx,
                reactivation: parking_lot::Mutex::new(None),
            }),
        }
    }

    /// Current link status.
    pub fn status(&self) -> LinkStatus {
        *self.inner.status.read()
    }

    /// Snapshot of the reconnection bookkeeping.
    pub fn reconnect_state(&self) -> ReconnectState {
        *self.inner.reconnect.lock()
    }

    /// Register the hook run after a successful reconnection.
    pub fn set_reactivation_hook(&self, hook: ReactivationHook) {
        *self.inner.reactivation.lock() = Some(hook);
    }

    /// Warm the credential and media caches ahead of `connect`.
    ///
    /// Safe to call redundantly; cache hits return immediately.
    pub async fn preload(&self) -> ConnectionResult<()> {
        let (credential, media) = tokio::join!(self.inner.credentials.get(), self.inner.media.get());
        credential?;
        media?;
        Ok(())
    }

    /// Open the transport session.
    ///
    /// No-op unless the status is `Disconnected`. The whole attempt runs
    /// under a hard timeout; on timeout or failure partial resources are
    /// cleared and the status returns to `Disconnected`.
    pub async fn connect(&self) -> ConnectionResult<()> {
        {
            let mut status = self.inner.status.write();
            if *status != LinkStatus::Disconnected {
                tracing::debug!(status = %*status, "connect() ignored");
                return Ok(());
            }
            *status = LinkStatus::Connecting;
        }

        let timeout = self.inner.config.connect_timeout;
        match tokio::time::timeout(timeout, self.establish()).await {
            Ok(Ok(())) => {
                *self.inner.status.write() = LinkStatus::Connected;
                self.inner.reconnect.lock().attempts = 0;
                tracing::info!("Session connected");
                Ok(())
            }
            Ok(Err(e)) => {
                tracing::error!("Connect failed: {}", e);
                self.clear_channel();
                *self.inner.status.write() = LinkStatus::Disconnected;
                Err(e)
            }
            Err(_) => {
                tracing::error!("Connect exceeded {:?}", timeout);
                self.clear_channel();
                *self.inner.status.write() = LinkStatus::Disconnected;
                Err(ConnectionError::ConnectTimeout(timeout))
            }
        }
    }

    async fn establish(&self) -> ConnectionResult<()> {
        let credential = self.inner.credentials.get().await?;
        let media = self.inner.media.get().await?;
        let pair = self.inner.transport.open(&credential, &media).await?;

        let serial = self.inner.channel_serial.fetch_add(1, Ordering::SeqCst) + 1;
        *self.inner.outbound.lock() = Some(pair.outbound);
        *self.inner.channel_shutdown.lock() = Some(pair.shutdown);

        let manager = self.clone();
        let mut inbound = pair.inbound;
        tokio::spawn(async move {
            while let Some(event) = inbound.recv().await {
                if manager.inner.event_tx.send(event).await.is_err() {
                    // Dispatcher is gone; nothing left to do for this session
                    return;
                }
            }
            manager.on_channel_closed(serial);
        });

        Ok(())
    }

    /// Tear the session down. Idempotent and safe from any status; also
    /// invalidates the credential and media caches.
    pub async fn disconnect(&self) {
        let previous = {
            let mut status = self.inner.status.write();
            std::mem::replace(&mut *status, LinkStatus::Disconnected)
        };
        self.clear_channel();
        self.inner.credentials.invalidate().await;
        self.inner.media.invalidate().await;
        if previous != LinkStatus::Disconnected {
            tracing::info!(from = %previous, "Session disconnected");
        }
    }

    fn clear_channel(&self) {
        if let Some(token) = self.inner.channel_shutdown.lock().take() {
            token.cancel();
        }
        *self.inner.outbound.lock() = None;
    }

    /// The single guarded write path to the upstream session.
    ///
    /// Writes only while the channel is open. A blocked send is logged
    /// and, unless a connect attempt is already in flight, hands the
    /// failure to the reconnection policy instead of silently dropping
    /// the event.
    pub async fn send(&self, event: ClientEvent) -> ConnectionResult<()> {
        let sender = self.inner.outbound.lock().clone();
        if self.status() == LinkStatus::Connected
            && let Some(sender) = sender
            && sender.send(event).await.is_ok()
        {
            return Ok(());
        }

        let status = self.status();
        tracing::warn!(status = %status, "Dropped outbound event: channel not open");
        if status != LinkStatus::Connecting {
            self.spawn_reconnect();
        }
        Err(ConnectionError::ChannelClosed)
    }

    fn on_channel_closed(&self, serial: u64) {
        if self.inner.channel_serial.load(Ordering::SeqCst) != serial {
            return; // superseded channel
        }
        if self.status() != LinkStatus::Connected {
            // Our own teardown, or a failure still inside the connecting
            // phase; the latter must not self-trigger reconnection.
            return;
        }
        tracing::warn!("Transport channel closed unexpectedly");
        self.spawn_reconnect();
    }

    fn spawn_reconnect(&self) {
        {
            let mut state = self.inner.reconnect.lock();
            if state.in_progress {
                tracing::debug!("Reconnection already in progress");
                return;
            }
            state.in_progress = true;
        }
        let manager = self.clone();
        tokio::spawn(async move {
            manager.run_reconnect().await;
        });
    }

    async fn run_reconnect(&self) {
        loop {
            let attempt = {
                let mut state = self.inner.reconnect.lock();
                state.attempts += 1;
                if state.attempts > self.inner.config.max_reconnect_attempts {
                    tracing::warn!(
                        attempts = state.attempts - 1,
                        "Reconnection attempts exhausted"
                    );
                    state.attempts = 0;
                    state.in_progress = false;
                    return;
                }
                state.last_attempt_at = Some(Instant::now());
                state.attempts
            };

            let delay = self.inner.config.reconnect_delay(attempt);
            tracing::info!(
                attempt,
                max = self.inner.config.max_reconnect_attempts,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting"
            );
            tokio::time::sleep(delay).await;

            self.disconnect().await;
            match self.connect().await {
                Ok(()) => {
                    self.inner.reconnect.lock().in_progress = false;
                    tracing::info!(attempt, "Reconnected");
                    let hook = self.inner.reactivation.lock().clone();
                    if let Some(hook) = hook {
                        hook().await;
                    }
                    return;
                }
                Err(e) => {
                    tracing::warn!(attempt, "Reconnection attempt failed: {}", e);
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::transport::testing::{ScriptedTransport, StalledTransport};
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::SystemTime;

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

    fn manager_with(
        transport: Arc<dyn RealtimeTransport>,
    ) -> (ConnectionManager, mpsc::Receiver<ServerEvent>) {
        let (event_tx, event_rx) = mpsc::channel(64);
        let manager = ConnectionManager::new(
            ConnectionConfig::default(),
            Arc::new(StaticCredentials),
            Arc::new(FixedMediaSource::default()),
            transport,
            event_tx,
        );
        (manager, event_rx)
    }

    #[test]
    fn test_reconnect_delay_schedule() {
        let config = ConnectionConfig {
            reconnect_base_delay: Duration::from_millis(1000),
            ..Default::default()
        };
        assert_eq!(config.reconnect_delay(1), Duration::from_millis(1000));
        assert_eq!(config.reconnect_delay(2), Duration::from_millis(1500));
        assert_eq!(config.reconnect_delay(3), Duration::from_millis(2250));
    }

    #[tokio::test]
    async fn test_connect_then_redundant_connect_is_noop() {
        let transport = Arc::new(ScriptedTransport::default());
        let (manager, _events) = manager_with(transport.clone());

        manager.connect().await.unwrap();
        assert_eq!(manager.status(), LinkStatus::Connected);

        manager.connect().await.unwrap();
        assert_eq!(*transport.open_calls.lock(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (manager, _events) = manager_with(Arc::new(ScriptedTransport::default()));
        manager.disconnect().await;
        manager.disconnect().await;
        assert_eq!(manager.status(), LinkStatus::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_returns_to_disconnected() {
        let (manager, _events) = manager_with(Arc::new(StalledTransport));
        let result = manager.connect().await;
        assert!(matches!(result, Err(ConnectionError::ConnectTimeout(_))));
        assert_eq!(manager.status(), LinkStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_send_without_channel_fails_cleanly() {
        let (manager, _events) = manager_with(Arc::new(ScriptedTransport::default()));
        let result = manager.send(ClientEvent::ResponseCancel).await;
        assert!(matches!(result, Err(ConnectionError::ChannelClosed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_caps_attempts_and_resets_counter() {
        let transport = Arc::new(ScriptedTransport::default());
        let (manager, _events) = manager_with(transport.clone());

        manager.connect().await.unwrap();
        // Every later open fails: the sequence should stop at the cap.
        *transport.failures_before_success.lock() = u32::MAX;

        // Drop the harness side of the channel to simulate a network drop.
        transport.opened.lock().clear();

        // Wait for the sequence to run its three attempts and give up.
        for _ in 0..200 {
            tokio::task::yield_now().await;
            tokio::time::sleep(Duration::from_millis(100)).await;
            let state = manager.reconnect_state();
            if !state.in_progress && state.attempts == 0 && *transport.open_calls.lock() > 1 {
                break;
            }
        }

        let state = manager.reconnect_state();
        assert!(!state.in_progress);
        assert_eq!(state.attempts, 0, "counter resets after giving up");
        // 1 initial connect + 3 reconnection attempts
        assert_eq!(*transport.open_calls.lock(), 4);
        assert_eq!(manager.status(), LinkStatus::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reactivation_hook_runs_after_reconnect() {
        let transport = Arc::new(ScriptedTransport::default());
        let (manager, _events) = manager_with(transport.clone());

        let calls = Arc::new(AtomicUsize::new(0));
        let hook_calls = calls.clone();
        manager.set_reactivation_hook(Arc::new(move || {
            let calls = hook_calls.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        }));

        manager.connect().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0, "not run on first connect");

        // Drop the channel; the next open succeeds immediately.
        transport.opened.lock().clear();

        for _ in 0..200 {
            tokio::task::yield_now().await;
            tokio::time::sleep(Duration::from_millis(100)).await;
            if calls.load(Ordering::SeqCst) > 0 {
                break;
            }
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.status(), LinkStatus::Connected);
    }
}
