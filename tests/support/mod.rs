//! Shared test doubles for integration suites.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use parley_gateway::core::connection::{
    ChannelPair, ConnectionResult, CredentialProvider, EphemeralCredential, MediaHandle,
    RealtimeTransport,
};
use parley_gateway::core::protocol::{ClientEvent, ServerEvent};

/// Credential provider that always succeeds.
pub struct StaticCredentials;

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn fetch(&self) -> ConnectionResult<EphemeralCredential> {
        Ok(EphemeralCredential {
            value: "test-token".to_string(),
            expires_at: SystemTime::now() + Duration::from_secs(600),
        })
    }
}

/// Harness side of one opened mock channel.
pub struct HarnessChannel {
    /// Events the gateway sent upstream
    pub sent: mpsc::Receiver<ClientEvent>,
    /// Feed upstream events to the gateway
    pub feed: mpsc::Sender<ServerEvent>,
    /// Tied to the channel's lifetime
    pub shutdown: CancellationToken,
}

/// Transport handing out in-memory channels scripted by the test.
#[derive(Default)]
pub struct MockTransport {
    /// One entry per successful `open`, in order
    pub opened: Mutex<Vec<HarnessChannel>>,
}

impl MockTransport {
    /// Take the most recently opened channel.
    pub fn latest_channel(&self) -> HarnessChannel {
        self.opened.lock().pop().expect("no channel opened")
    }
}

#[async_trait]
impl RealtimeTransport for MockTransport {
    async fn open(
        &self,
        _credential: &EphemeralCredential,
        _media: &MediaHandle,
    ) -> ConnectionResult<ChannelPair> {
        let (outbound_tx, outbound_rx) = mpsc::channel(256);
        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        let shutdown = CancellationToken::new();
        self.opened.lock().push(HarnessChannel {
            sent: outbound_rx,
            feed: inbound_tx,
            shutdown: shutdown.clone(),
        });
        Ok(ChannelPair {
            outbound: outbound_tx,
            inbound: inbound_rx,
            shutdown,
        })
    }
}

/// Receive the next event matching `predicate` within two seconds.
pub async fn expect_sent<F>(channel: &mut HarnessChannel, mut predicate: F) -> ClientEvent
where
    F: FnMut(&ClientEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let event = channel.sent.recv().await.expect("channel closed");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for outbound event")
}
