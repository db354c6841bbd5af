//! Backend controller dialing: candidate racing, TLS verification against
//! the controller's own CA, and the opt-out idle connection cache.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use futures::StreamExt as _;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio_tungstenite::MaybeTlsStream;
use url::Url;

use crate::error::Error;
use crate::proxy::transport::{MessageStream, from_backend_ws};
use crate::registry::{ControllerDescriptor, ControllerRegistry};
use crate::tag::Tag;

/// Parallel dial attempts per controller.
const DIAL_CONCURRENCY: usize = 4;
/// Head start each attempt gets over the next candidate.
const DIAL_STAGGER: Duration = Duration::from_millis(50);
const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

pub type BackendWs = tokio_tungstenite::WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct ControllerDialer {
    registry: ControllerRegistry,
    insecure_skip_verify: bool,
    /// Idle connections put back by cleanly finished sessions, keyed by
    /// controller tag. `None` when the cache is disabled by configuration.
    cache: Option<Mutex<HashMap<Tag, Vec<CachedConnection>>>>,
}

struct CachedConnection {
    path: String,
    stream: MessageStream,
}

impl ControllerDialer {
    pub fn new(registry: ControllerRegistry, insecure_skip_verify: bool, disable_cache: bool) -> Self {
        Self {
            registry,
            insecure_skip_verify,
            cache: (!disable_cache).then(|| Mutex::new(HashMap::new())),
        }
    }

    pub fn registry(&self) -> &ControllerRegistry {
        &self.registry
    }

    /// Returns a connected message stream towards `controller` for the given
    /// API path, reusing an idle cached connection when one exists.
    pub async fn dial(&self, controller: &Tag, path: &str) -> Result<MessageStream, Error> {
        if let Some(cache) = &self.cache {
            let cached = {
                let mut cache = cache.lock();
                cache.get_mut(controller).and_then(|idle| {
                    idle.iter()
                        .position(|connection| connection.path == path)
                        .map(|index| idle.swap_remove(index))
                })
            };

            if let Some(connection) = cached {
                debug!(%controller, path, "Reusing idle backend connection");
                return Ok(connection.stream);
            }
        }

        let descriptor = self
            .registry
            .get(controller)
            .ok_or_else(|| Error::not_found(format!("unknown controller {controller}")))?;

        let candidates = descriptor.candidate_addresses();
        if candidates.is_empty() {
            return Err(Error::not_found(format!("{controller} has no address")));
        }

        let attempts = futures::stream::iter(candidates.into_iter().enumerate().map(|(index, address)| {
            let descriptor = Arc::clone(&descriptor);
            let stagger = DIAL_STAGGER * u32::try_from(index).unwrap_or(u32::MAX);
            async move {
                tokio::time::sleep(stagger).await;
                let result = self.attempt(&descriptor, &address, path).await;
                (address, result)
            }
        }))
        .buffer_unordered(DIAL_CONCURRENCY);

        let race = async {
            let mut attempts = std::pin::pin!(attempts);
            let mut last_error = None;

            // First successful handshake wins; dropping the stream afterwards
            // aborts the attempts still in flight.
            while let Some((address, result)) = attempts.next().await {
                match result {
                    Ok(ws) => {
                        debug!(%controller, address, path, "Connected to backend");
                        return Ok(from_backend_ws(ws));
                    }
                    Err(error) => {
                        debug!(%controller, address, error = format!("{error:#}"), "Dial attempt failed");
                        last_error = Some(error);
                    }
                }
            }

            Err(Error::unavailable(format!("could not reach {controller}")).with_source(
                last_error.unwrap_or_else(|| anyhow::anyhow!("no dial attempt was made")),
            ))
        };

        tokio::time::timeout(DIAL_TIMEOUT, race)
            .await
            .map_err(|_| Error::timeout(format!("dialing {controller} timed out")))?
    }

    async fn attempt(&self, descriptor: &ControllerDescriptor, address: &str, path: &str) -> anyhow::Result<BackendWs> {
        let url = to_websocket_url(address, path)?;

        let host = url.host_str().context("address has no host")?.to_owned();
        let port = url.port_or_known_default().unwrap_or(443);

        let tcp = TcpStream::connect((host.as_str(), port))
            .await
            .with_context(|| format!("TCP connect to {host}:{port}"))?;

        let stream = match url.scheme() {
            "wss" => {
                let config = crate::tls::build_client_config(descriptor.ca_cert_pem.as_deref(), self.insecure_skip_verify)?;
                let server_name = descriptor.tls_server_name.as_deref().unwrap_or(&host);
                let tls = crate::tls::connect(Arc::new(config), server_name, tcp).await?;
                MaybeTlsStream::Rustls(tls)
            }
            // Plain WebSocket, test deployments only.
            "ws" => MaybeTlsStream::Plain(tcp),
            unsupported => anyhow::bail!("unsupported scheme: {unsupported}"),
        };

        let (ws, _response) = tokio_tungstenite::client_async(url.as_str(), stream)
            .await
            .context("WebSocket handshake")?;

        Ok(ws)
    }

    /// Hands a connection back for reuse after a cleanly finished session.
    pub fn release(&self, controller: &Tag, path: &str, stream: MessageStream) {
        if let Some(cache) = &self.cache {
            cache.lock().entry(controller.clone()).or_default().push(CachedConnection {
                path: path.to_owned(),
                stream,
            });
        }
    }

    /// Drops every cached connection for `controller`. Called on any
    /// authentication error from the backend so a rotated admin credential
    /// is picked up by the next dial.
    pub fn evict(&self, controller: &Tag) {
        if let Some(cache) = &self.cache {
            if cache.lock().remove(controller).is_some() {
                debug!(%controller, "Evicted cached backend connections");
            }
        }
    }
}

/// `host:port` dials as `wss://host:port`; explicit `ws://` / `wss://`
/// prefixes are honored as-is.
fn to_websocket_url(address: &str, path: &str) -> anyhow::Result<Url> {
    let base = if address.contains("://") {
        address.to_owned()
    } else {
        format!("wss://{address}")
    };

    let mut url = base.parse::<Url>().with_context(|| format!("invalid address {address}"))?;

    anyhow::ensure!(
        matches!(url.scheme(), "ws" | "wss"),
        "unsupported scheme: {}",
        url.scheme(),
    );

    url.set_path(path);
    Ok(url)
}
