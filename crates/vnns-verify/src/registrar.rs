// crates/vnns-verify/src/registrar.rs
//
// VerificationKeyRegistrar: registers a circuit's verifying key with the
// network exactly once, keyed by the content hash of the key image.
//
// Lookup order: in-memory cache, then the record store (a previous run may
// already have registered the key), then the network. Registrations are
// serialized behind one async lock so two callers racing on the same key
// cannot both reach the network.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};

use vnns_core::artifact::{image_digest, CircuitVersion, KeyRegistrationRequest, RegisteredKey};
use vnns_core::crypto::Hash32;
use vnns_core::error::RegistrationError;
use vnns_core::traits::RecordStore;

use crate::session::NetworkSession;

#[derive(Default)]
struct KeyCache {
    by_image: HashMap<Hash32, RegisteredKey>,
    key_hashes: HashSet<Hash32>,
}

impl KeyCache {
    fn insert(&mut self, key: RegisteredKey) {
        self.key_hashes.insert(key.key_hash);
        self.by_image.insert(key.image_digest, key);
    }
}

pub struct VerificationKeyRegistrar {
    session: Arc<NetworkSession>,
    store: Option<Arc<dyn RecordStore>>,
    cache: RwLock<KeyCache>,
    registering: Mutex<()>,
    confirmation_timeout: Duration,
}

impl VerificationKeyRegistrar {
    pub fn new(
        session: Arc<NetworkSession>,
        store: Option<Arc<dyn RecordStore>>,
        confirmation_timeout: Duration,
    ) -> Self {
        Self {
            session,
            store,
            cache: RwLock::new(KeyCache::default()),
            registering: Mutex::new(()),
            confirmation_timeout,
        }
    }

    /// Register `image` under `circuit_version` and return the finalized key hash.
    ///
    /// Suspends until the network reports finalization or the confirmation
    /// timeout elapses. A key that is already known is answered locally.
    pub async fn register(
        &self,
        image: &[u8],
        circuit_version: &CircuitVersion,
    ) -> Result<Hash32, RegistrationError> {
        let digest = image_digest(image);

        if let Some(known) = self.lookup_cached(&digest, circuit_version).await? {
            return Ok(known);
        }

        let _guard = self.registering.lock().await;

        // Another caller may have finished while we waited for the lock.
        if let Some(known) = self.lookup_cached(&digest, circuit_version).await? {
            return Ok(known);
        }

        if let Some(stored) = self.lookup_store(&digest).await {
            check_version(&stored, circuit_version)?;
            tracing::info!(
                "Verifying key {} already registered in a previous run",
                stored.key_hash.truncated()
            );
            let key_hash = stored.key_hash;
            self.cache.write().await.insert(stored);
            return Ok(key_hash);
        }

        let request = KeyRegistrationRequest {
            image: image.to_vec(),
            circuit_version: circuit_version.clone(),
        };

        tracing::info!(
            "Registering verifying key (image {}, circuit {})",
            digest.truncated(),
            circuit_version
        );

        let network = self.session.network()?;
        let finalization =
            match tokio::time::timeout(self.confirmation_timeout, network.register_key(&request))
                .await
            {
                Ok(result) => result?,
                Err(_) => {
                    tracing::warn!(
                        "Key registration not finalized within {:?}",
                        self.confirmation_timeout
                    );
                    return Err(RegistrationError::ConfirmationTimeout {
                        secs: self.confirmation_timeout.as_secs(),
                    });
                }
            };

        let registered = RegisteredKey {
            image_digest: digest,
            key_hash: finalization.statement_hash,
            circuit_version: circuit_version.clone(),
            registered_at: Utc::now(),
        };

        tracing::info!(
            "Verifying key finalized: {}",
            registered.key_hash
        );

        if let Some(store) = &self.store {
            if let Err(e) = store.save_key(&registered).await {
                tracing::warn!("Failed to cache key registration: {}", e);
            }
        }

        let key_hash = registered.key_hash;
        self.cache.write().await.insert(registered);
        Ok(key_hash)
    }

    /// Whether `key_hash` was finalized through this registrar.
    pub async fn is_registered(&self, key_hash: &Hash32) -> bool {
        self.cache.read().await.key_hashes.contains(key_hash)
    }

    async fn lookup_cached(
        &self,
        digest: &Hash32,
        circuit_version: &CircuitVersion,
    ) -> Result<Option<Hash32>, RegistrationError> {
        let cache = self.cache.read().await;
        match cache.by_image.get(digest) {
            Some(known) => {
                check_version(known, circuit_version)?;
                tracing::debug!("Verifying key {} already known", known.key_hash.truncated());
                Ok(Some(known.key_hash))
            }
            None => Ok(None),
        }
    }

    async fn lookup_store(&self, digest: &Hash32) -> Option<RegisteredKey> {
        let store = self.store.as_ref()?;
        match store.load_key(digest).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!("Key registration cache unavailable: {}", e);
                None
            }
        }
    }
}

fn check_version(
    known: &RegisteredKey,
    requested: &CircuitVersion,
) -> Result<(), RegistrationError> {
    if &known.circuit_version != requested {
        return Err(RegistrationError::VersionConflict {
            registered: known.circuit_version.to_string(),
            requested: requested.to_string(),
        });
    }
    Ok(())
}
