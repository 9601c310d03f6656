//! Ephemeral credential acquisition and caching.
//!
//! A realtime session is authorized by a short-lived credential minted by an
//! external endpoint. The credential is fetched ahead of time by `preload`,
//! cached until shortly before expiry, and invalidated on disconnect.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::Deserialize;
use url::Url;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::{ConnectionError, ConnectionResult};

/// Leeway subtracted from the expiry when deciding whether a cached
/// credential is still usable. Covers clock skew and handshake latency.
const EXPIRY_LEEWAY: Duration = Duration::from_secs(30);

/// Short-lived token authorizing a single realtime session.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EphemeralCredential {
    /// Opaque token value
    pub value: String,
    /// Absolute expiry time
    #[zeroize(skip)]
    pub expires_at: SystemTime,
}

impl EphemeralCredential {
    /// Whether the credential is still usable, with expiry leeway applied.
    pub fn is_fresh(&self) -> bool {
        match self.expires_at.duration_since(SystemTime::now()) {
            Ok(remaining) => remaining > EXPIRY_LEEWAY,
            Err(_) => false,
        }
    }
}

impl std::fmt::Debug for EphemeralCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never log the token value
        f.debug_struct("EphemeralCredential")
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Source of ephemeral credentials.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Mint a fresh credential.
    async fn fetch(&self) -> ConnectionResult<EphemeralCredential>;
}

/// Wire shape of the credential endpoint response.
#[derive(Debug, Deserialize)]
struct CredentialResponse {
    value: String,
    /// Expiry as unix epoch milliseconds
    expires_at: u64,
}

/// Credential provider backed by an HTTP endpoint returning
/// `{"value": "...", "expires_at": <epoch ms>}`.
pub struct HttpCredentialProvider {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpCredentialProvider {
    pub fn new(endpoint: Url) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self { client, endpoint }
    }
}

#[async_trait]
impl CredentialProvider for HttpCredentialProvider {
    async fn fetch(&self) -> ConnectionResult<EphemeralCredential> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .send()
            .await
            .map_err(|e| ConnectionError::CredentialFetch(e.to_string()))?
            .error_for_status()
            .map_err(|e| ConnectionError::CredentialFetch(e.to_string()))?;

        let body: CredentialResponse = response
            .json()
            .await
            .map_err(|e| ConnectionError::CredentialFetch(format!("invalid body: {e}")))?;

        Ok(EphemeralCredential {
            value: body.value,
            expires_at: UNIX_EPOCH + Duration::from_millis(body.expires_at),
        })
    }
}

/// Single-slot credential cache shared by preload and connect.
pub struct CredentialCache {
    provider: Arc<dyn CredentialProvider>,
    cached: tokio::sync::Mutex<Option<EphemeralCredential>>,
}

impl CredentialCache {
    pub fn new(provider: Arc<dyn CredentialProvider>) -> Self {
        Self {
            provider,
            cached: tokio::sync::Mutex::new(None),
        }
    }

    /// Return the cached credential, fetching a fresh one if the slot is
    /// empty or stale. Safe to call redundantly; a cache hit returns
    /// immediately.
    pub async fn get(&self) -> ConnectionResult<EphemeralCredential> {
        let mut slot = self.cached.lock().await;
        if let Some(credential) = slot.as_ref()
            && credential.is_fresh()
        {
            return Ok(credential.clone());
        }

        let credential = self.provider.fetch().await?;
        tracing::debug!(expires_at = ?credential.expires_at, "Fetched ephemeral credential");
        *slot = Some(credential.clone());
        Ok(credential)
    }

    /// Drop the cached credential so the next `get` re-fetches.
    pub async fn invalidate(&self) {
        self.cached.lock().await.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn far_future_ms() -> u64 {
        (SystemTime::now() + Duration::from_secs(3600))
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64
    }

    struct CountingProvider {
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl CredentialProvider for CountingProvider {
        async fn fetch(&self) -> ConnectionResult<EphemeralCredential> {
            self.calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(EphemeralCredential {
                value: "tok".to_string(),
                expires_at: SystemTime::now() + Duration::from_secs(600),
            })
        }
    }

    #[test]
    fn test_expired_credential_is_not_fresh() {
        let credential = EphemeralCredential {
            value: "tok".to_string(),
            expires_at: SystemTime::now() - Duration::from_secs(1),
        };
        assert!(!credential.is_fresh());

        // Inside the leeway window counts as stale too
        let credential = EphemeralCredential {
            value: "tok".to_string(),
            expires_at: SystemTime::now() + Duration::from_secs(5),
        };
        assert!(!credential.is_fresh());
    }

    #[test]
    fn test_debug_redacts_value() {
        let credential = EphemeralCredential {
            value: "super-secret".to_string(),
            expires_at: SystemTime::now(),
        };
        let rendered = format!("{credential:?}");
        assert!(!rendered.contains("super-secret"));
    }

    #[tokio::test]
    async fn test_cache_hit_skips_provider() {
        let provider = Arc::new(CountingProvider {
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let cache = CredentialCache::new(provider.clone());

        cache.get().await.unwrap();
        cache.get().await.unwrap();
        assert_eq!(provider.calls.load(std::sync::atomic::Ordering::SeqCst), 1);

        cache.invalidate().await;
        cache.get().await.unwrap();
        assert_eq!(provider.calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_http_provider_parses_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "value": "ephemeral-123",
                "expires_at": far_future_ms(),
            })))
            .mount(&server)
            .await;

        let endpoint = Url::parse(&format!("{}/token", server.uri())).unwrap();
        let provider = HttpCredentialProvider::new(endpoint);
        let credential = provider.fetch().await.unwrap();
        assert_eq!(credential.value, "ephemeral-123");
        assert!(credential.is_fresh());
    }

    #[tokio::test]
    async fn test_http_provider_propagates_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let endpoint = Url::parse(&format!("{}/token", server.uri())).unwrap();
        let provider = HttpCredentialProvider::new(endpoint);
        let result = provider.fetch().await;
        assert!(matches!(result, Err(ConnectionError::CredentialFetch(_))));
    }
}
