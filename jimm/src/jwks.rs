//! JWKS lifecycle: generation, rotation and publication of the RSA signing
//! material backends use to verify minted tokens.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jimm_task::{ShutdownSignal, Task};
use parking_lot::Mutex;
use picky::jose::jwk::{Jwk, JwkSet};
use picky::key::PrivateKey;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::Error;
use crate::secrets::CredentialStore;

const RSA_KEY_BITS: usize = 4096;
const ERROR_CHANNEL_CAPACITY: usize = 16;

/// A published key and the instant after which tokens signed under it stop
/// verifying. Kept in the set until then so rotation stays monotonic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishedKey {
    pub jwk: Jwk,
    #[serde(with = "time::serde::rfc3339")]
    pub expiry: OffsetDateTime,
}

/// The published key set. The first entry is the active signing key;
/// later entries are previous keys retained until their expiry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PublishedJwks {
    pub keys: Vec<PublishedKey>,
}

impl PublishedJwks {
    pub fn active(&self) -> Option<&PublishedKey> {
        self.keys.first()
    }

    pub fn find(&self, kid: &str) -> Option<&PublishedKey> {
        self.keys
            .iter()
            .find(|key| key.jwk.kid.as_deref() == Some(kid))
    }

    /// The set as served on the well-known endpoint, with expired keys gone.
    pub fn to_jwk_set(&self, now: OffsetDateTime) -> JwkSet {
        JwkSet {
            keys: self
                .keys
                .iter()
                .filter(|key| now < key.expiry)
                .map(|key| key.jwk.clone())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotatorState {
    Uninitialized,
    Active,
    Expiring,
    Rotating,
}

/// Periodically regenerates the signing material once it expires.
///
/// Recovery from a partially written bundle is forward-only: the partial
/// state is deleted and fresh material generated on the same tick.
pub struct JwksRotator {
    store: Arc<dyn CredentialStore>,
    rotation_interval: Duration,
    key_lifetime: Duration,
    state: Arc<Mutex<RotatorState>>,
    errors_tx: mpsc::Sender<Error>,
}

impl JwksRotator {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        rotation_interval: Duration,
        key_lifetime: Duration,
    ) -> (Self, mpsc::Receiver<Error>) {
        let (errors_tx, errors_rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);

        let rotator = Self {
            store,
            rotation_interval,
            key_lifetime,
            state: Arc::new(Mutex::new(RotatorState::Uninitialized)),
            errors_tx,
        };

        (rotator, errors_rx)
    }

    pub fn state_handle(&self) -> Arc<Mutex<RotatorState>> {
        Arc::clone(&self.state)
    }

    fn set_state(&self, state: RotatorState) {
        *self.state.lock() = state;
    }

    /// One pass of the rotation state machine. Returns whether a new key was
    /// published. `force` rotates even while the active key is still valid,
    /// retaining it in the published set until its own expiry.
    pub async fn rotate_if_needed(&self, force: bool) -> Result<bool, Error> {
        let state = self.store.jwks_state().await?;
        let now = OffsetDateTime::now_utc();

        if !state.is_complete() {
            if !state.is_empty() {
                warn!("Partially written JWKS material found, cleaning it up before regenerating");
                self.set_state(RotatorState::Rotating);
                self.store.cleanup_jwks().await?;
            }

            self.rotate(PublishedJwks::default(), now).await?;
            return Ok(true);
        }

        let expiry = state.expiry.expect("complete state carries an expiry");

        if !force && now < expiry {
            self.set_state(RotatorState::Active);
            return Ok(false);
        }

        self.set_state(RotatorState::Expiring);

        let retained = state.set.unwrap_or_default();
        self.rotate(retained, now).await?;

        Ok(true)
    }

    async fn rotate(&self, previous: PublishedJwks, now: OffsetDateTime) -> Result<(), Error> {
        self.set_state(RotatorState::Rotating);

        // RSA generation at this size takes a while; keep it off the runtime.
        let private_key = tokio::task::spawn_blocking(|| PrivateKey::generate_rsa(RSA_KEY_BITS))
            .await
            .map_err(|e| Error::internal("key generation task failed").with_source(e))?
            .map_err(|e| Error::internal("RSA key generation failed").with_source(e))?;

        let public_key = private_key
            .to_public_key()
            .map_err(|e| Error::internal("derive public key").with_source(e))?;

        let mut jwk = Jwk::from_public_key(&public_key)
            .map_err(|e| Error::internal("convert public key to JWK").with_source(e))?;

        let kid = Uuid::new_v4();
        jwk.kid = Some(kid.to_string());

        let private_key_pem = private_key
            .to_pem_str()
            .map_err(|e| Error::internal("encode private key").with_source(e))?;

        let expiry = now + self.key_lifetime;

        // New active key first; previous keys stay published until their own
        // expiry, everything already expired is dropped with this write.
        let mut keys = vec![PublishedKey { jwk, expiry }];
        keys.extend(previous.keys.into_iter().filter(|key| now < key.expiry));

        self.store
            .put_jwks(&PublishedJwks { keys }, &SecretString::from(private_key_pem), expiry)
            .await?;

        info!(%kid, %expiry, "Published a new signing key");
        self.set_state(RotatorState::Active);

        Ok(())
    }

    /// Run synchronously during service start so the minter always has a key.
    pub async fn initialize(&self) -> Result<(), Error> {
        self.rotate_if_needed(false).await.map(|_| ())
    }
}

#[async_trait]
impl Task for JwksRotator {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "jwks rotator";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        debug!("Task started");

        let mut interval = tokio::time::interval(self.rotation_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(error) = self.rotate_if_needed(false).await {
                        error!(%error, "Rotation attempt failed");
                        // Bounded channel: observability only, never blocks the rotator.
                        let _ = self.errors_tx.try_send(error);
                    }
                }
                () = shutdown_signal.wait() => {
                    break;
                }
            }
        }

        debug!("Task terminated");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use camino::Utf8Path;

    use super::*;
    use crate::secrets::FileCredentialStore;

    fn store(dir: &tempfile::TempDir) -> Arc<dyn CredentialStore> {
        let data_dir = Utf8Path::from_path(dir.path()).expect("utf-8 temp dir");
        Arc::new(FileCredentialStore::open(data_dir, true).expect("open store"))
    }

    fn rotator(store: Arc<dyn CredentialStore>, key_lifetime: Duration) -> JwksRotator {
        JwksRotator::new(store, Duration::from_secs(3600), key_lifetime).0
    }

    #[tokio::test]
    async fn initial_rotation_publishes_a_complete_bundle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir);
        let rotator = rotator(Arc::clone(&store), Duration::from_secs(3600));

        assert!(rotator.rotate_if_needed(false).await.expect("first tick rotates"));

        let state = store.jwks_state().await.expect("state");
        assert!(state.is_complete());

        let set = state.set.expect("set");
        assert_eq!(set.keys.len(), 1);
        assert!(set.active().expect("active key").jwk.kid.is_some());

        // A second tick with a valid key is a no-op.
        assert!(!rotator.rotate_if_needed(false).await.expect("no-op tick"));
    }

    #[tokio::test]
    async fn forced_rotation_retains_the_previous_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir);
        let rotator = rotator(Arc::clone(&store), Duration::from_secs(3600));

        rotator.rotate_if_needed(false).await.expect("initial");
        let first_kid = store
            .jwks_state()
            .await
            .expect("state")
            .set
            .expect("set")
            .active()
            .expect("active")
            .jwk
            .kid
            .clone();

        rotator.rotate_if_needed(true).await.expect("forced");

        let set = store.jwks_state().await.expect("state").set.expect("set");
        assert_eq!(set.keys.len(), 2, "previous key is retained until its expiry");
        assert_ne!(set.active().expect("active").jwk.kid, first_kid);
        assert!(set.find(first_kid.as_deref().expect("kid")).is_some());
    }

    #[tokio::test]
    async fn partial_state_is_cleaned_up_and_regenerated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir);

        // Simulate a crash between bundle pieces: expiry present, key absent.
        let raw_path = dir.path().join("credentials.json");
        std::fs::write(
            &raw_path,
            serde_json::json!({
                "well_known": { "jwks_expiry": "2020-01-01T00:00:00Z" }
            })
            .to_string(),
        )
        .expect("seed partial state");

        let rotator = rotator(Arc::clone(&store), Duration::from_secs(3600));
        assert!(rotator.rotate_if_needed(false).await.expect("tick"));

        let state = store.jwks_state().await.expect("state");
        assert!(state.is_complete());
        assert!(state.expiry.expect("expiry") > OffsetDateTime::now_utc());
    }

    #[tokio::test]
    async fn expired_keys_are_dropped_from_the_served_set() {
        let now = OffsetDateTime::now_utc();

        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir);
        let rotator = rotator(Arc::clone(&store), Duration::from_secs(3600));
        rotator.rotate_if_needed(false).await.expect("initial");

        let set = store.jwks_state().await.expect("state").set.expect("set");

        assert_eq!(set.to_jwk_set(now).keys.len(), 1);
        assert_eq!(set.to_jwk_set(now + Duration::from_secs(7200)).keys.len(), 0);
    }
}
