//! Capability token minting.
//!
//! Tokens are short-lived RS256 JWTs carrying the session's access map;
//! backends verify them against the published JWKS instead of calling back
//! into the gateway on every request.

use std::sync::Arc;
use std::time::Duration;

use picky::jose::jws::RawJws;
use picky::key::PrivateKey;
use secrecy::ExposeSecret as _;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::access::AccessMap;
use crate::error::Error;
use crate::jwks::PublishedJwks;
use crate::secrets::CredentialStore;
use crate::tag::Tag;

const LEEWAY_SECS: u16 = 60; // 1 minute

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub iss: String,
    /// Tag of the authenticated principal.
    pub sub: String,
    /// Controller tag of the routed backend.
    pub aud: String,
    pub exp: i64,
    pub iat: i64,
    pub nbf: i64,
    pub jti: Uuid,
    pub access: AccessMap,
}

pub struct JwtMinter {
    store: Arc<dyn CredentialStore>,
    issuer: String,
    expiry: Duration,
    access_map_limit: usize,
}

impl JwtMinter {
    pub fn new(store: Arc<dyn CredentialStore>, issuer: String, expiry: Duration, access_map_limit: usize) -> Self {
        Self {
            store,
            issuer,
            expiry,
            access_map_limit,
        }
    }

    /// Mints a token for `user` towards `controller` carrying `access`.
    ///
    /// The private key is fetched from the credential store on every mint so
    /// a rotation is picked up immediately. Oversized access maps are
    /// rejected before signing: the token rides a WebSocket handshake and
    /// must not blow up its headers.
    pub async fn mint(&self, controller: &Tag, user: &Tag, access: &AccessMap) -> Result<String, Error> {
        use picky::jose::jws::JwsAlg;
        use picky::jose::jwt::CheckedJwtSig;

        if access.len() > self.access_map_limit {
            return Err(Error::invalid(format!(
                "access map carries {} entries, limit is {}",
                access.len(),
                self.access_map_limit,
            )));
        }

        let state = self.store.jwks_state().await?;

        let (set, private_key_pem) = match (state.set, state.private_key_pem) {
            (Some(set), Some(pem)) => (set, pem),
            _ => return Err(Error::unavailable("no signing key available")),
        };

        let kid = set
            .active()
            .and_then(|key| key.jwk.kid.clone())
            .ok_or_else(|| Error::internal("published key set has no active key"))?;

        let private_key = PrivateKey::from_pem_str(private_key_pem.expose_secret())
            .map_err(|e| Error::internal("stored private key is unreadable").with_source(e))?;

        let now = OffsetDateTime::now_utc().unix_timestamp();
        let expiry_secs = i64::try_from(self.expiry.as_secs())
            .map_err(|e| Error::invalid("jwt expiry overflows").with_source(e))?;

        let claims = Claims {
            iss: self.issuer.clone(),
            sub: user.to_string(),
            aud: controller.to_string(),
            exp: now + expiry_secs,
            iat: now,
            nbf: now,
            jti: Uuid::new_v4(),
            access: access.clone(),
        };

        let mut jwt_sig = CheckedJwtSig::new(JwsAlg::RS256, claims);
        jwt_sig.header.kid = Some(kid);

        jwt_sig
            .encode(&private_key)
            .map_err(|e| Error::internal("sign capability token").with_source(e))
    }
}

/// Decodes and verifies a token against a published key set, the way a
/// backend controller would. Also exercised by the mint→verify tests.
pub fn verify(token: &str, published: &PublishedJwks, now: OffsetDateTime) -> Result<Claims, Error> {
    use picky::jose::jwt::{JwtDate, JwtSig, JwtValidator};

    let raw_jws = RawJws::decode(token).map_err(|e| Error::unauthorized("malformed token").with_source(e))?;

    let kid = raw_jws
        .header
        .kid
        .clone()
        .ok_or_else(|| Error::unauthorized("token carries no key ID"))?;

    let key = published
        .find(&kid)
        .filter(|key| now < key.expiry)
        .ok_or_else(|| Error::unauthorized(format!("key not found: {kid}")))?;

    let public_key = key
        .jwk
        .to_public_key()
        .map_err(|e| Error::internal("published JWK is unreadable").with_source(e))?;

    let jwt = raw_jws
        .verify(&public_key)
        .map(JwtSig::from)
        .map_err(|e| Error::unauthorized("token signature mismatch").with_source(e))?;

    let date = JwtDate::new_with_leeway(now.unix_timestamp(), LEEWAY_SECS);
    let validator = JwtValidator::strict(date);

    let claims = jwt
        .validate::<Claims>(&validator)
        .map_err(|e| Error::unauthorized("token validation failed").with_source(e))?
        .state
        .claims;

    Ok(claims)
}

#[cfg(test)]
mod tests {
    use camino::Utf8Path;

    use super::*;
    use crate::jwks::JwksRotator;
    use crate::secrets::FileCredentialStore;

    async fn minted_environment() -> (Arc<dyn CredentialStore>, JwtMinter, JwksRotator) {
        let dir = tempfile::tempdir().expect("tempdir");
        let data_dir = Utf8Path::from_path(dir.path()).expect("utf-8 temp dir").to_path_buf();
        // Leak the directory so the store outlives this helper in tests.
        std::mem::forget(dir);

        let store: Arc<dyn CredentialStore> = Arc::new(FileCredentialStore::open(&data_dir, true).expect("open store"));

        let (rotator, _errors) = JwksRotator::new(
            Arc::clone(&store),
            Duration::from_secs(3600),
            Duration::from_secs(3600),
        );
        rotator.initialize().await.expect("initial rotation");

        let minter = JwtMinter::new(
            Arc::clone(&store),
            "jimm.example".to_owned(),
            Duration::from_secs(86400),
            1024,
        );

        (store, minter, rotator)
    }

    fn access_map() -> AccessMap {
        let mut access = AccessMap::new();
        access.insert(Tag::model(Uuid::new_v4()), "read");
        access
    }

    #[tokio::test]
    async fn mint_verify_round_trip() {
        let (store, minter, _rotator) = minted_environment().await;

        let controller = Tag::controller(Uuid::new_v4());
        let alice = Tag::user("alice@canonical.com");
        let access = access_map();

        let token = minter.mint(&controller, &alice, &access).await.expect("mint");

        let published = store.jwks_state().await.expect("state").set.expect("set");
        let claims = verify(&token, &published, OffsetDateTime::now_utc()).expect("verify");

        assert_eq!(claims.iss, "jimm.example");
        assert_eq!(claims.sub, alice.to_string());
        assert_eq!(claims.aud, controller.to_string());
        assert_eq!(claims.access, access);
    }

    #[tokio::test]
    async fn empty_access_map_still_mints_a_valid_token() {
        let (store, minter, _rotator) = minted_environment().await;

        let token = minter
            .mint(&Tag::controller(Uuid::new_v4()), &Tag::user("alice@canonical.com"), &AccessMap::new())
            .await
            .expect("mint");

        let published = store.jwks_state().await.expect("state").set.expect("set");
        let claims = verify(&token, &published, OffsetDateTime::now_utc()).expect("verify");
        assert!(claims.access.is_empty());
    }

    #[tokio::test]
    async fn oversized_access_maps_are_rejected() {
        let (_store, minter, _rotator) = minted_environment().await;

        let minter = JwtMinter {
            access_map_limit: 2,
            ..minter
        };

        let mut access = AccessMap::new();
        for _ in 0..3 {
            access.insert(Tag::model(Uuid::new_v4()), "read");
        }

        let error = minter
            .mint(&Tag::controller(Uuid::new_v4()), &Tag::user("alice@canonical.com"), &access)
            .await
            .expect_err("too many entries");
        assert_eq!(error.kind(), crate::error::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn token_survives_rotation_until_its_key_expires() {
        let (store, minter, rotator) = minted_environment().await;

        let token = minter
            .mint(&Tag::controller(Uuid::new_v4()), &Tag::user("alice@canonical.com"), &access_map())
            .await
            .expect("mint");

        // Forced rotation retains the previous key in the published set.
        rotator.rotate_if_needed(true).await.expect("rotate");

        let published = store.jwks_state().await.expect("state").set.expect("set");
        assert_eq!(published.keys.len(), 2);

        verify(&token, &published, OffsetDateTime::now_utc()).expect("still verifiable");

        // Past the original key's expiry it is gone from the set.
        let after_expiry = OffsetDateTime::now_utc() + Duration::from_secs(7200);
        let error = verify(&token, &published, after_expiry).expect_err("key expired");
        assert!(error.message().contains("key not found"));
    }

    #[tokio::test]
    async fn mint_without_signing_key_is_unavailable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data_dir = Utf8Path::from_path(dir.path()).expect("utf-8 temp dir");
        let store: Arc<dyn CredentialStore> = Arc::new(FileCredentialStore::open(data_dir, true).expect("open store"));

        let minter = JwtMinter::new(store, "jimm.example".to_owned(), Duration::from_secs(86400), 1024);

        let error = minter
            .mint(&Tag::controller(Uuid::new_v4()), &Tag::user("alice@canonical.com"), &AccessMap::new())
            .await
            .expect_err("no key yet");
        assert_eq!(error.kind(), crate::error::ErrorKind::Unavailable);
    }
}
