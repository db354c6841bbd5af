#[macro_use]
extern crate tracing;

pub mod access;
pub mod api;
pub mod auth;
pub mod bakery;
pub mod config;
pub mod dialer;
pub mod error;
pub mod http;
pub mod jwks;
pub mod jwt;
pub mod listener;
pub mod log;
pub mod proxy;
pub mod rebac;
pub mod registry;
pub mod secrets;
pub mod session;
pub mod tag;
pub mod tls;
pub mod watcher;

use std::sync::Arc;

use jimm_task::ShutdownSignal;

/// Shared handles threaded through the HTTP handlers and session tasks.
#[derive(Clone)]
pub struct JimmState {
    pub conf_handle: config::ConfHandle,
    pub authorizer: rebac::Authorizer,
    pub secrets: Arc<dyn secrets::CredentialStore>,
    pub minter: Arc<jwt::JwtMinter>,
    pub authenticator: Arc<dyn auth::Authenticator>,
    pub dialer: Arc<dialer::ControllerDialer>,
    pub bakery: Arc<bakery::Bakery>,
    pub resolver: auth::identity::IdentityResolver,
    pub sessions: session::SessionRegistryHandle,
    pub models: registry::ModelDirectory,
    pub entities: watcher::EntityCache,
    pub start_time: time::OffsetDateTime,
    pub shutdown_signal: ShutdownSignal,
}

pub fn make_http_service(state: JimmState) -> axum::Router {
    api::make_router(state)
}

impl JimmState {
    /// State over in-process stores for the HTTP integration tests; no
    /// listener, watcher or rotation task runs. The returned rotator lets a
    /// test publish signing material on demand.
    pub async fn mock(conf_file_json: &str) -> anyhow::Result<(JimmState, jwks::JwksRotator)> {
        use anyhow::Context as _;

        let conf_file: config::dto::ConfFile = serde_json::from_str(conf_file_json).context("mock config")?;
        let conf = config::Conf::from_conf_file(&conf_file)?;

        let secrets: Arc<dyn secrets::CredentialStore> =
            Arc::new(secrets::FileCredentialStore::open(&conf.data_dir, true)?);

        let authorizer = rebac::Authorizer::from_conf(&conf)?;
        authorizer.reconcile_admins(&conf.controller_admins).await?;

        let (rotator, _errors) = jwks::JwksRotator::new(
            Arc::clone(&secrets),
            conf.jwks_rotation_interval,
            conf.jwks_key_lifetime,
        );

        let minter = Arc::new(jwt::JwtMinter::new(
            Arc::clone(&secrets),
            conf.public_dns_name.clone(),
            conf.jwt_expiry,
            conf.jwt_access_map_limit,
        ));

        let bakery = Arc::new(
            bakery::Bakery::load_or_generate(secrets.as_ref(), conf.public_dns_name.clone(), conf.macaroon_expiry)
                .await?,
        );

        let resolver = auth::identity::IdentityResolver::new();
        let authenticator: Arc<dyn auth::Authenticator> = Arc::new(auth::MacaroonAuthenticator::new(
            Arc::clone(&bakery),
            resolver.clone(),
        ));

        let registry = registry::ControllerRegistry::from_conf(&conf.controllers);
        let dialer = Arc::new(dialer::ControllerDialer::new(
            registry,
            conf.insecure_skip_verify,
            conf.disable_connection_cache,
        ));

        let (sessions, sessions_rx) = session::session_registry_channel();
        jimm_task::spawn_task(
            session::SessionRegistryTask::new(sessions_rx),
            ShutdownSignal::never(),
        )
        .detach();

        let state = JimmState {
            conf_handle: config::ConfHandle::from_conf(conf),
            authorizer,
            secrets,
            minter,
            authenticator,
            dialer,
            bakery,
            resolver,
            sessions,
            models: registry::ModelDirectory::default(),
            entities: watcher::EntityCache::default(),
            start_time: time::OffsetDateTime::now_utc(),
            shutdown_signal: ShutdownSignal::never(),
        };

        Ok((state, rotator))
    }
}
