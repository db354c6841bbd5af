//! Credential store: controller admin credentials, cloud-credential
//! attributes and the well-known JWKS material.
//!
//! The vault backend is an external collaborator; this file-backed store is
//! the fallback used for single-node deployments and tests. Secret values
//! are sealed with ChaCha20-Poly1305 under a store key generated next to the
//! store file, unless `insecure-secret-storage` forces the plaintext scheme.

use std::collections::HashMap;

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use secrecy::{ExposeSecret as _, SecretString};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{Error, retry_unavailable};
use crate::jwks::PublishedJwks;
use crate::tag::Tag;

/// Admin identity JIMM uses when talking to a backend controller.
#[derive(Clone)]
pub struct ControllerCredentials {
    pub username: String,
    pub password: SecretString,
}

impl core::fmt::Debug for ControllerCredentials {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ControllerCredentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// The three pieces of JWKS material, each individually optional so that a
/// partially written state is observable and can be cleaned up.
#[derive(Debug, Default)]
pub struct JwksState {
    pub set: Option<PublishedJwks>,
    pub private_key_pem: Option<SecretString>,
    pub expiry: Option<OffsetDateTime>,
}

impl JwksState {
    pub fn is_complete(&self) -> bool {
        self.set.is_some() && self.private_key_pem.is_some() && self.expiry.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_none() && self.private_key_pem.is_none() && self.expiry.is_none()
    }
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn controller_credentials(&self, controller: &Tag) -> Result<Option<ControllerCredentials>, Error>;
    async fn put_controller_credentials(
        &self,
        controller: &Tag,
        credentials: ControllerCredentials,
    ) -> Result<(), Error>;
    async fn delete_controller_credentials(&self, controller: &Tag) -> Result<(), Error>;

    async fn cloud_credential(&self, credential: &Tag) -> Result<Option<HashMap<String, String>>, Error>;
    async fn put_cloud_credential(
        &self,
        credential: &Tag,
        attributes: HashMap<String, String>,
    ) -> Result<(), Error>;
    async fn delete_cloud_credential(&self, credential: &Tag) -> Result<(), Error>;

    async fn jwks_state(&self) -> Result<JwksState, Error>;
    /// Publishes set, private key and expiry as a single write.
    async fn put_jwks(
        &self,
        set: &PublishedJwks,
        private_key_pem: &SecretString,
        expiry: OffsetDateTime,
    ) -> Result<(), Error>;
    /// Deletes whatever JWKS material is present, partial or complete.
    async fn cleanup_jwks(&self) -> Result<(), Error>;

    async fn bakery_root_key(&self) -> Result<Option<Vec<u8>>, Error>;
    async fn put_bakery_root_key(&self, key: &[u8]) -> Result<(), Error>;
}

// ----- sealed values ----- //

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "kebab-case")]
enum StoredSecret {
    Plaintext { value: String },
    Chacha20Poly1305 { nonce: String, data: String },
}

mod crypto {
    use anyhow::Context as _;
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
    use chacha20poly1305::{ChaCha20Poly1305, Nonce};
    use zeroize::Zeroizing;

    use super::StoredSecret;

    pub(super) struct StoreCipher {
        cipher: ChaCha20Poly1305,
    }

    impl StoreCipher {
        /// Loads the store key, generating a fresh 256-bit key on first use.
        pub(super) fn load_or_generate(key_path: &camino::Utf8Path) -> anyhow::Result<Self> {
            let key_material: Zeroizing<Vec<u8>> = if key_path.exists() {
                std::fs::read(key_path.as_std_path())
                    .with_context(|| format!("read store key at {key_path}"))?
                    .into()
            } else {
                use rand::RngCore as _;

                let mut key_bytes = Zeroizing::new(vec![0u8; 32]);
                OsRng.fill_bytes(&mut key_bytes);
                std::fs::write(key_path.as_std_path(), &*key_bytes)
                    .with_context(|| format!("write store key at {key_path}"))?;
                key_bytes
            };

            let cipher = ChaCha20Poly1305::new_from_slice(&key_material).context("store key is not 32 bytes")?;

            Ok(Self { cipher })
        }

        pub(super) fn seal(&self, plaintext: &str) -> anyhow::Result<StoredSecret> {
            let nonce = ChaCha20Poly1305::generate_nonce(OsRng);

            let ciphertext = self
                .cipher
                .encrypt(&nonce, plaintext.as_bytes())
                .map_err(|e| anyhow::anyhow!("encryption failed: {e}"))?;

            Ok(StoredSecret::Chacha20Poly1305 {
                nonce: BASE64.encode(nonce),
                data: BASE64.encode(ciphertext),
            })
        }

        pub(super) fn open(&self, sealed: &StoredSecret) -> anyhow::Result<String> {
            match sealed {
                StoredSecret::Plaintext { value } => Ok(value.clone()),
                StoredSecret::Chacha20Poly1305 { nonce, data } => {
                    let nonce = BASE64.decode(nonce).context("malformed nonce")?;
                    let nonce = Nonce::from_slice(&nonce);
                    let ciphertext = BASE64.decode(data).context("malformed ciphertext")?;

                    let plaintext = self
                        .cipher
                        .decrypt(nonce, ciphertext.as_ref())
                        .map_err(|e| anyhow::anyhow!("decryption failed: {e}"))?;

                    String::from_utf8(plaintext).context("decrypted value is not valid UTF-8")
                }
            }
        }
    }
}

// ----- file-backed store ----- //

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    controllers: HashMap<String, StoredControllerCredentials>,
    #[serde(default)]
    clouds: HashMap<String, HashMap<String, StoredSecret>>,
    #[serde(default)]
    well_known: WellKnown,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredControllerCredentials {
    username: String,
    password: StoredSecret,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct WellKnown {
    #[serde(skip_serializing_if = "Option::is_none")]
    jwks: Option<PublishedJwks>,
    #[serde(skip_serializing_if = "Option::is_none")]
    jwks_private_key: Option<StoredSecret>,
    #[serde(with = "time::serde::rfc3339::option", default, skip_serializing_if = "Option::is_none")]
    jwks_expiry: Option<OffsetDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bakery_root: Option<StoredSecret>,
}

enum Sealing {
    Cipher(crypto::StoreCipher),
    /// `insecure-secret-storage`: values land on disk as-is.
    Plaintext,
}

impl Sealing {
    fn seal(&self, plaintext: &str) -> anyhow::Result<StoredSecret> {
        match self {
            Sealing::Cipher(cipher) => cipher.seal(plaintext),
            Sealing::Plaintext => Ok(StoredSecret::Plaintext {
                value: plaintext.to_owned(),
            }),
        }
    }

    fn open(&self, sealed: &StoredSecret) -> anyhow::Result<String> {
        match self {
            Sealing::Cipher(cipher) => cipher.open(sealed),
            Sealing::Plaintext => match sealed {
                StoredSecret::Plaintext { value } => Ok(value.clone()),
                StoredSecret::Chacha20Poly1305 { .. } => {
                    anyhow::bail!("sealed value found but the store runs in plaintext mode")
                }
            },
        }
    }
}

pub struct FileCredentialStore {
    path: Utf8PathBuf,
    sealing: Sealing,
    // Serializes read-modify-write cycles on the store file.
    write_lock: tokio::sync::Mutex<()>,
}

impl FileCredentialStore {
    pub fn open(data_dir: &Utf8Path, insecure_secret_storage: bool) -> anyhow::Result<Self> {
        let path = data_dir.join("credentials.json");

        let sealing = if insecure_secret_storage {
            warn!("Secret storage is running in PLAINTEXT mode, do not use in production");
            Sealing::Plaintext
        } else {
            let key_path = data_dir.join("credentials.key");
            Sealing::Cipher(crypto::StoreCipher::load_or_generate(&key_path)?)
        };

        Ok(Self {
            path,
            sealing,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    async fn load(&self) -> Result<StoreFile, Error> {
        match tokio::fs::read_to_string(self.path.as_std_path()).await {
            Ok(contents) => serde_json::from_str(&contents)
                .map_err(|e| Error::internal("corrupted credential store").with_source(e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StoreFile::default()),
            Err(e) => Err(Error::unavailable("credential store unreachable").with_source(e)),
        }
    }

    /// Writes through a temporary file and renames so readers observe either
    /// the previous state or the whole new one.
    async fn save(&self, store: &StoreFile) -> Result<(), Error> {
        let contents =
            serde_json::to_vec_pretty(store).map_err(|e| Error::internal("serialize credential store").with_source(e))?;

        let tmp_path = self.path.with_extension("json.tmp");

        tokio::fs::write(tmp_path.as_std_path(), &contents)
            .await
            .map_err(|e| Error::unavailable("credential store unreachable").with_source(e))?;

        tokio::fs::rename(tmp_path.as_std_path(), self.path.as_std_path())
            .await
            .map_err(|e| Error::unavailable("credential store unreachable").with_source(e))
    }

    fn seal(&self, plaintext: &str) -> Result<StoredSecret, Error> {
        self.sealing
            .seal(plaintext)
            .map_err(|e| Error::internal("failed to seal secret").with_source(e))
    }

    fn open_sealed(&self, sealed: &StoredSecret) -> Result<String, Error> {
        self.sealing
            .open(sealed)
            .map_err(|e| Error::internal("failed to open sealed secret").with_source(e))
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn controller_credentials(&self, controller: &Tag) -> Result<Option<ControllerCredentials>, Error> {
        let store = retry_unavailable(|| self.load()).await?;

        store
            .controllers
            .get(&controller.to_string())
            .map(|stored| {
                Ok(ControllerCredentials {
                    username: stored.username.clone(),
                    password: SecretString::from(self.open_sealed(&stored.password)?),
                })
            })
            .transpose()
    }

    async fn put_controller_credentials(
        &self,
        controller: &Tag,
        credentials: ControllerCredentials,
    ) -> Result<(), Error> {
        let _guard = self.write_lock.lock().await;
        let mut store = retry_unavailable(|| self.load()).await?;

        let stored = StoredControllerCredentials {
            username: credentials.username,
            password: self.seal(credentials.password.expose_secret())?,
        };
        store.controllers.insert(controller.to_string(), stored);

        retry_unavailable(|| self.save(&store)).await
    }

    async fn delete_controller_credentials(&self, controller: &Tag) -> Result<(), Error> {
        let _guard = self.write_lock.lock().await;
        let mut store = retry_unavailable(|| self.load()).await?;
        store.controllers.remove(&controller.to_string());
        retry_unavailable(|| self.save(&store)).await
    }

    async fn cloud_credential(&self, credential: &Tag) -> Result<Option<HashMap<String, String>>, Error> {
        let store = retry_unavailable(|| self.load()).await?;

        store
            .clouds
            .get(&credential.to_string())
            .map(|attributes| {
                attributes
                    .iter()
                    .map(|(name, sealed)| Ok((name.clone(), self.open_sealed(sealed)?)))
                    .collect::<Result<HashMap<_, _>, Error>>()
            })
            .transpose()
    }

    async fn put_cloud_credential(
        &self,
        credential: &Tag,
        attributes: HashMap<String, String>,
    ) -> Result<(), Error> {
        let _guard = self.write_lock.lock().await;
        let mut store = retry_unavailable(|| self.load()).await?;

        let sealed = attributes
            .iter()
            .map(|(name, value)| Ok((name.clone(), self.seal(value)?)))
            .collect::<Result<HashMap<_, _>, Error>>()?;
        store.clouds.insert(credential.to_string(), sealed);

        retry_unavailable(|| self.save(&store)).await
    }

    async fn delete_cloud_credential(&self, credential: &Tag) -> Result<(), Error> {
        let _guard = self.write_lock.lock().await;
        let mut store = retry_unavailable(|| self.load()).await?;
        store.clouds.remove(&credential.to_string());
        retry_unavailable(|| self.save(&store)).await
    }

    async fn jwks_state(&self) -> Result<JwksState, Error> {
        let store = retry_unavailable(|| self.load()).await?;

        let private_key_pem = store
            .well_known
            .jwks_private_key
            .as_ref()
            .map(|sealed| Ok::<_, Error>(SecretString::from(self.open_sealed(sealed)?)))
            .transpose()?;

        Ok(JwksState {
            set: store.well_known.jwks,
            private_key_pem,
            expiry: store.well_known.jwks_expiry,
        })
    }

    async fn put_jwks(
        &self,
        set: &PublishedJwks,
        private_key_pem: &SecretString,
        expiry: OffsetDateTime,
    ) -> Result<(), Error> {
        let _guard = self.write_lock.lock().await;
        let mut store = retry_unavailable(|| self.load()).await?;

        store.well_known.jwks = Some(set.clone());
        store.well_known.jwks_private_key = Some(self.seal(private_key_pem.expose_secret())?);
        store.well_known.jwks_expiry = Some(expiry);

        retry_unavailable(|| self.save(&store)).await
    }

    async fn cleanup_jwks(&self) -> Result<(), Error> {
        let _guard = self.write_lock.lock().await;
        let mut store = retry_unavailable(|| self.load()).await?;

        store.well_known.jwks = None;
        store.well_known.jwks_private_key = None;
        store.well_known.jwks_expiry = None;

        retry_unavailable(|| self.save(&store)).await
    }

    async fn bakery_root_key(&self) -> Result<Option<Vec<u8>>, Error> {
        use base64::Engine as _;

        let store = retry_unavailable(|| self.load()).await?;

        store
            .well_known
            .bakery_root
            .as_ref()
            .map(|sealed| {
                let encoded = self.open_sealed(sealed)?;
                base64::engine::general_purpose::STANDARD
                    .decode(&encoded)
                    .map_err(|e| Error::internal("corrupted bakery root key").with_source(e))
            })
            .transpose()
    }

    async fn put_bakery_root_key(&self, key: &[u8]) -> Result<(), Error> {
        use base64::Engine as _;

        let _guard = self.write_lock.lock().await;
        let mut store = retry_unavailable(|| self.load()).await?;

        let encoded = base64::engine::general_purpose::STANDARD.encode(key);
        store.well_known.bakery_root = Some(self.seal(&encoded)?);

        retry_unavailable(|| self.save(&store)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store(dir: &tempfile::TempDir, insecure: bool) -> FileCredentialStore {
        let data_dir = Utf8Path::from_path(dir.path()).expect("utf-8 temp dir");
        FileCredentialStore::open(data_dir, insecure).expect("open store")
    }

    #[tokio::test]
    async fn controller_credentials_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir, false);
        let controller = Tag::controller(uuid::Uuid::new_v4());

        assert!(store.controller_credentials(&controller).await.expect("get").is_none());

        store
            .put_controller_credentials(
                &controller,
                ControllerCredentials {
                    username: "admin".to_owned(),
                    password: SecretString::from("hunter2".to_owned()),
                },
            )
            .await
            .expect("put");

        let fetched = store
            .controller_credentials(&controller)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(fetched.username, "admin");
        assert_eq!(fetched.password.expose_secret(), "hunter2");

        store.delete_controller_credentials(&controller).await.expect("delete");
        assert!(store.controller_credentials(&controller).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn passwords_are_not_stored_in_clear() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir, false);
        let controller = Tag::controller(uuid::Uuid::new_v4());

        store
            .put_controller_credentials(
                &controller,
                ControllerCredentials {
                    username: "admin".to_owned(),
                    password: SecretString::from("very-secret-password".to_owned()),
                },
            )
            .await
            .expect("put");

        let raw = std::fs::read_to_string(dir.path().join("credentials.json")).expect("read raw store");
        assert!(!raw.contains("very-secret-password"));
    }

    #[tokio::test]
    async fn empty_cloud_credential_is_distinct_from_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir, true);
        let credential = Tag::new(crate::tag::Kind::Credential, "aws/alice/default");

        assert!(store.cloud_credential(&credential).await.expect("get").is_none());

        store
            .put_cloud_credential(&credential, HashMap::new())
            .await
            .expect("put");

        let fetched = store.cloud_credential(&credential).await.expect("get");
        assert_eq!(fetched, Some(HashMap::new()));
    }

    #[tokio::test]
    async fn jwks_bundle_is_written_and_cleaned_as_a_unit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir, true);

        assert!(store.jwks_state().await.expect("get").is_empty());

        let set = PublishedJwks::default();
        let expiry = OffsetDateTime::now_utc() + std::time::Duration::from_secs(3600);

        store
            .put_jwks(&set, &SecretString::from("fake pem".to_owned()), expiry)
            .await
            .expect("put");

        let state = store.jwks_state().await.expect("get");
        assert!(state.is_complete());

        store.cleanup_jwks().await.expect("cleanup");
        assert!(store.jwks_state().await.expect("get").is_empty());
    }
}
