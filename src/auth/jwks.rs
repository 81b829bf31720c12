//! Signing key store backed by a JWKS endpoint.
//!
//! The key set is replaced wholesale on every fetch. Readers take a cheap
//! `Arc` snapshot, so a lookup never waits on the network and never sees a
//! half-built set.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::DecodingKey;
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// Immutable mapping from `kid` to RSA public key
#[derive(Clone, Default)]
pub struct KeySet {
    keys: HashMap<String, DecodingKey>,
}

impl std::fmt::Debug for KeySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kids: Vec<&String> = self.keys.keys().collect();
        kids.sort();
        f.debug_struct("KeySet").field("kids", &kids).finish()
    }
}

#[derive(Deserialize)]
struct JwksDocument {
    #[serde(default)]
    keys: Vec<Value>,
}

/// Only the members needed to build an RSA verification key
#[derive(Deserialize)]
struct RsaJwk {
    kty: String,
    kid: Option<String>,
    n: Option<String>,
    e: Option<String>,
}

impl KeySet {
    /// Build from a JWKS document, skipping entries that are not usable RSA keys
    pub fn from_jwks(document: &Value) -> Result<Self> {
        let doc = JwksDocument::deserialize(document)
            .map_err(|e| Error::Jwks(format!("not a JWKS document: {e}")))?;

        let mut keys = HashMap::new();
        for entry in doc.keys {
            let jwk: RsaJwk = match serde_json::from_value(entry) {
                Ok(jwk) => jwk,
                Err(e) => {
                    debug!(error = %e, "Skipping malformed JWK entry");
                    continue;
                }
            };
            if jwk.kty != "RSA" {
                continue;
            }
            let (Some(kid), Some(n), Some(e)) = (jwk.kid, jwk.n, jwk.e) else {
                debug!("Skipping RSA JWK without kid, n or e");
                continue;
            };
            match DecodingKey::from_rsa_components(&n, &e) {
                Ok(key) => {
                    keys.insert(kid, key);
                }
                Err(err) => warn!(kid = %kid, error = %err, "Skipping undecodable RSA JWK"),
            }
        }
        Ok(Self { keys })
    }

    /// Key for `kid`
    pub fn get(&self, kid: &str) -> Option<&DecodingKey> {
        self.keys.get(kid)
    }

    /// Number of usable keys
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the set has no usable keys
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Concurrency-safe holder of the current [`KeySet`]
pub struct KeyStore {
    current: RwLock<Arc<KeySet>>,
    jwks_url: Option<String>,
    http: reqwest::Client,
}

impl KeyStore {
    /// Store that fetches from `jwks_url`; empty until [`KeyStore::refresh`]
    pub fn new(jwks_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            current: RwLock::new(Arc::new(KeySet::default())),
            jwks_url: Some(jwks_url.into()),
            http,
        })
    }

    /// Store with a fixed key set and no remote source
    pub fn from_key_set(keys: KeySet) -> Self {
        Self {
            current: RwLock::new(Arc::new(keys)),
            jwks_url: None,
            http: reqwest::Client::new(),
        }
    }

    /// Fetch the JWKS document and swap in the new key set.
    ///
    /// On error the previous set stays in place.
    pub async fn refresh(&self) -> Result<usize> {
        let Some(url) = &self.jwks_url else {
            return Ok(self.snapshot().len());
        };

        debug!(url = %url, "Fetching JWKS");
        let document: Value = self
            .http
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| Error::Jwks(format!("{url}: {e}")))?
            .json()
            .await
            .map_err(|e| Error::Jwks(format!("{url}: {e}")))?;

        let keys = KeySet::from_jwks(&document)?;
        let count = keys.len();
        if count == 0 {
            warn!(url = %url, "JWKS contains no usable RSA keys; every token will be rejected");
        }
        *self.current.write() = Arc::new(keys);
        info!(url = %url, keys = count, "JWKS loaded");
        Ok(count)
    }

    /// Current key set
    pub fn snapshot(&self) -> Arc<KeySet> {
        self.current.read().clone()
    }

    /// Key for `kid` in the current set
    pub fn get(&self, kid: &str) -> Option<DecodingKey> {
        self.current.read().get(kid).cloned()
    }

    /// Refetch every `interval` until `shutdown` fires
    pub fn spawn_refresh(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = store.refresh().await {
                            warn!(error = %e, "JWKS refresh failed, keeping previous keys");
                        }
                    }
                    () = shutdown.cancelled() => break,
                }
            }
        })
    }
}
