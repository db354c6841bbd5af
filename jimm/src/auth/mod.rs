//! Authentication seam between the RPC proxy and the identity providers.
//!
//! Two flows coexist behind the [`Authenticator`] capability: the legacy
//! macaroon flow, and the OIDC browser/device flow whose handshake is an
//! external collaborator (we consume the session it establishes). The proxy
//! only ever sees a verified principal or a structured `unauthorized` error.

pub mod identity;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::bakery::{Bakery, Macaroon};
use crate::error::Error;
use crate::auth::identity::{Identity, IdentityResolver};

/// Credential material a client may present inside its `Login` request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoginParams {
    /// Principal the client claims, e.g. `user-alice@canonical.com`.
    #[serde(rename = "auth-tag", default)]
    pub auth_tag: Option<String>,

    /// Discharge macaroons for the legacy flow.
    #[serde(default)]
    pub macaroons: Vec<Macaroon>,

    /// Opaque session reference established by the browser-login collaborator.
    #[serde(rename = "session-token", default)]
    pub session_token: Option<String>,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Yields the verified identity behind a login request, or a structured
    /// authentication error.
    async fn authenticate(&self, params: &LoginParams) -> Result<Identity, Error>;
}

/// Legacy flow: the login request carries macaroons minted by this gateway's
/// bakery with a `declared username` fact.
pub struct MacaroonAuthenticator {
    bakery: Arc<Bakery>,
    resolver: IdentityResolver,
}

impl MacaroonAuthenticator {
    pub fn new(bakery: Arc<Bakery>, resolver: IdentityResolver) -> Self {
        Self { bakery, resolver }
    }
}

#[async_trait]
impl Authenticator for MacaroonAuthenticator {
    async fn authenticate(&self, params: &LoginParams) -> Result<Identity, Error> {
        let macaroon = params
            .macaroons
            .first()
            .ok_or_else(|| Error::unauthorized("no credentials presented"))?;

        self.bakery.verify(macaroon)?;

        let username = Bakery::declared(macaroon, "username")
            .ok_or_else(|| Error::unauthorized("macaroon declares no username"))?;

        self.resolver.resolve(username)
    }
}

/// Session flow: the collaborator has already verified the principal and
/// handed the session to the proxy; the login request only names it.
///
/// The session verification callback keeps the OIDC machinery out of this
/// crate while the tests and the HTTP layer can plug their own.
pub struct SessionAuthenticator {
    resolver: IdentityResolver,
    verify: Box<dyn Fn(&str) -> Result<String, Error> + Send + Sync>,
}

impl SessionAuthenticator {
    pub fn new(
        resolver: IdentityResolver,
        verify: impl Fn(&str) -> Result<String, Error> + Send + Sync + 'static,
    ) -> Self {
        Self {
            resolver,
            verify: Box::new(verify),
        }
    }
}

#[async_trait]
impl Authenticator for SessionAuthenticator {
    async fn authenticate(&self, params: &LoginParams) -> Result<Identity, Error> {
        let token = params
            .session_token
            .as_deref()
            .ok_or_else(|| Error::unauthorized("no credentials presented"))?;

        let username = (self.verify)(token)?;

        self.resolver.resolve(&username)
    }
}

/// Tries each flow in turn; the first one the request carries material for wins.
pub struct AuthenticatorStack {
    authenticators: Vec<Box<dyn Authenticator>>,
}

impl AuthenticatorStack {
    pub fn new(authenticators: Vec<Box<dyn Authenticator>>) -> Self {
        Self { authenticators }
    }
}

#[async_trait]
impl Authenticator for AuthenticatorStack {
    async fn authenticate(&self, params: &LoginParams) -> Result<Identity, Error> {
        let mut last_error = Error::unauthorized("no credentials presented");

        for authenticator in &self.authenticators {
            match authenticator.authenticate(params).await {
                Ok(identity) => return Ok(identity),
                Err(error) => last_error = error,
            }
        }

        Err(last_error)
    }
}
