use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use jimm_task::{ChildTask, ShutdownHandle, ShutdownSignal, Task};
use secrecy::SecretString;
use time::OffsetDateTime;
use tokio::runtime::{self, Runtime};

use jimm::JimmState;
use jimm::auth::identity::IdentityResolver;
use jimm::auth::{Authenticator, AuthenticatorStack, MacaroonAuthenticator, SessionAuthenticator};
use jimm::bakery::Bakery;
use jimm::config::ConfHandle;
use jimm::dialer::ControllerDialer;
use jimm::error::Error;
use jimm::jwks::JwksRotator;
use jimm::jwt::JwtMinter;
use jimm::listener::GatewayListener;
use jimm::log;
use jimm::rebac::Authorizer;
use jimm::registry::{ControllerRegistry, ModelDirectory};
use jimm::secrets::{ControllerCredentials, CredentialStore, FileCredentialStore};
use jimm::session::{SessionRegistryTask, session_registry_channel};
use jimm::tag::Tag;
use jimm::watcher::{EntityCache, WatcherTask, watcher_bus};

pub const SERVICE_NAME: &str = "jimm";

/// How long running tasks get to drain after the stop order.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
/// How long the runtime gets to tear down whatever is left.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(3);

pub struct JimmService {
    conf_handle: ConfHandle,
    running: Option<Running>,
}

struct Running {
    shutdown: ShutdownHandle,
    runtime: Runtime,
}

impl JimmService {
    pub fn load(conf_handle: ConfHandle) -> anyhow::Result<Self> {
        let conf = conf_handle.get_conf();

        log::init(conf.log_directive.as_deref()).context("failed to setup logger")?;

        info!(service = SERVICE_NAME, version = env!("CARGO_PKG_VERSION"));

        if conf.insecure_secret_storage || conf.insecure_skip_verify {
            warn!("Insecure options are enabled; never run production traffic with this configuration");
        }

        Ok(JimmService {
            conf_handle,
            running: None,
        })
    }

    pub fn start(&mut self) -> anyhow::Result<()> {
        anyhow::ensure!(self.running.is_none(), "service is already started");

        let runtime = runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to create runtime")?;

        // Socket binding and the first key rotation happen before start
        // returns, so a broken configuration fails loudly here.
        let task_set = runtime.block_on(build_tasks(self.conf_handle.clone()))?;

        let TaskSet {
            children, shutdown, ..
        } = task_set;

        for (name, child) in children {
            runtime.spawn(watch_task(name, child));
        }

        info!("Service started");

        self.running = Some(Running { shutdown, runtime });

        Ok(())
    }

    pub fn stop(&mut self) {
        let Some(Running { shutdown, runtime }) = self.running.take() else {
            info!("Service is not running; nothing to stop");
            return;
        };

        info!("Shutdown requested");
        shutdown.signal();

        let drained = runtime.block_on(tokio::time::timeout(DRAIN_TIMEOUT, shutdown.all_closed()));
        if drained.is_err() {
            warn!("Some tasks did not drain in time; aborting them");
        }

        runtime.shutdown_timeout(TEARDOWN_TIMEOUT);

        info!("Service stopped");
    }
}

/// Logs how one supervised task ended, under its name.
async fn watch_task(name: &'static str, child: ChildTask<anyhow::Result<()>>) {
    match child.join().await {
        Ok(Ok(())) => debug!(task = name, "Task finished"),
        Ok(Err(error)) => error!(task = name, error = format!("{error:#}"), "Task failed"),
        Err(join_error) if join_error.is_cancelled() => debug!(task = name, "Task cancelled"),
        Err(join_error) => error!(task = name, %join_error, "Task panicked"),
    }
}

struct TaskSet {
    children: Vec<(&'static str, ChildTask<anyhow::Result<()>>)>,
    shutdown: ShutdownHandle,
    signal: ShutdownSignal,
}

impl TaskSet {
    fn new() -> Self {
        let (shutdown, signal) = ShutdownHandle::new();

        Self {
            children: Vec::new(),
            shutdown,
            signal,
        }
    }

    fn launch<T>(&mut self, task: T)
    where
        T: Task<Output = anyhow::Result<()>> + 'static,
    {
        let child = jimm_task::spawn_task(task, self.signal.clone());
        self.children.push((T::NAME, child));
    }
}

async fn build_tasks(conf_handle: ConfHandle) -> anyhow::Result<TaskSet> {
    let conf = conf_handle.get_conf();
    let mut tasks = TaskSet::new();

    let secrets: Arc<dyn CredentialStore> =
        Arc::new(FileCredentialStore::open(&conf.data_dir, conf.insecure_secret_storage)?);

    let authorizer = Authorizer::from_conf(&conf)?;
    authorizer
        .reconcile_admins(&conf.controller_admins)
        .await
        .context("failed to reconcile controller admins")?;

    seed_controller_credentials(&conf, secrets.as_ref())
        .await
        .context("failed to seed controller credentials")?;

    // One synchronous rotation so the minter always has a key to sign with.
    let (rotator, mut rotator_errors) = JwksRotator::new(
        Arc::clone(&secrets),
        conf.jwks_rotation_interval,
        conf.jwks_key_lifetime,
    );
    rotator.initialize().await.context("initial key rotation failed")?;

    ChildTask::spawn(async move {
        while let Some(error) = rotator_errors.recv().await {
            warn!(%error, "Key rotation reported an error");
        }
    })
    .detach();

    let minter = Arc::new(JwtMinter::new(
        Arc::clone(&secrets),
        conf.public_dns_name.clone(),
        conf.jwt_expiry,
        conf.jwt_access_map_limit,
    ));

    let bakery = Arc::new(
        Bakery::load_or_generate(secrets.as_ref(), conf.public_dns_name.clone(), conf.macaroon_expiry)
            .await
            .context("failed to load the bakery key")?,
    );

    let resolver = IdentityResolver::new();

    let mut authenticators: Vec<Box<dyn Authenticator>> = vec![Box::new(MacaroonAuthenticator::new(
        Arc::clone(&bakery),
        resolver.clone(),
    ))];

    // The browser flow is owned by the OIDC collaborator; until its session
    // store is wired in, session tokens are rejected with a clear message.
    if conf.oidc.is_some() {
        authenticators.push(Box::new(SessionAuthenticator::new(resolver.clone(), |_| {
            Err(Error::unauthorized("browser session store is not configured"))
        })));
    }

    let authenticator: Arc<dyn Authenticator> = Arc::new(AuthenticatorStack::new(authenticators));

    let registry = ControllerRegistry::from_conf(&conf.controllers);
    let dialer = Arc::new(ControllerDialer::new(
        registry.clone(),
        conf.insecure_skip_verify,
        conf.disable_connection_cache,
    ));

    let models = ModelDirectory::default();
    let entities = EntityCache::default();
    let bus = watcher_bus();

    let (sessions, sessions_rx) = session_registry_channel();

    let state = JimmState {
        conf_handle: conf_handle.clone(),
        authorizer,
        secrets: Arc::clone(&secrets),
        minter,
        authenticator,
        dialer: Arc::clone(&dialer),
        bakery,
        resolver,
        sessions,
        models: models.clone(),
        entities: entities.clone(),
        start_time: OffsetDateTime::now_utc(),
        shutdown_signal: tasks.signal.clone(),
    };

    let listener = GatewayListener::init_and_bind(conf.bind_addr, state).context("failed to bind listener")?;
    tasks.launch(listener);

    tasks.launch(rotator);
    tasks.launch(SessionRegistryTask::new(sessions_rx));

    for controller in registry.all() {
        tasks.launch(WatcherTask {
            controller,
            dialer: Arc::clone(&dialer),
            secrets: Arc::clone(&secrets),
            cache: entities.clone(),
            models: models.clone(),
            bus: bus.clone(),
        });
    }

    Ok(tasks)
}

/// Bootstrap admin credentials named in the configuration land in the
/// credential store once; later rotations happen through the store only.
async fn seed_controller_credentials(
    conf: &jimm::config::Conf,
    secrets: &dyn CredentialStore,
) -> Result<(), Error> {
    use secrecy::ExposeSecret as _;

    for controller in &conf.controllers {
        let (Some(username), Some(password)) = (&controller.admin_username, &controller.admin_password) else {
            continue;
        };

        let tag = Tag::controller(controller.uuid);

        if secrets.controller_credentials(&tag).await?.is_none() {
            info!(controller = %tag, "Seeding admin credentials from the configuration");
            secrets
                .put_controller_credentials(
                    &tag,
                    ControllerCredentials {
                        username: username.clone(),
                        password: SecretString::from(password.expose_secret().to_owned()),
                    },
                )
                .await?;
        }
    }

    Ok(())
}
