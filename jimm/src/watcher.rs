//! Long-lived change-stream subscriptions: one task per registered backend,
//! folding entity deltas into an in-memory cache and republishing them on a
//! process-wide bus.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use backoff::ExponentialBackoff;
use backoff::backoff::Backoff as _;
use jimm_task::{ShutdownSignal, Task};
use parking_lot::RwLock;
use secrecy::ExposeSecret as _;
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::dialer::ControllerDialer;
use crate::proxy::rpc::RpcMessage;
use crate::proxy::transport::{Frame, MessageStream};
use crate::registry::{ControllerDescriptor, ModelDirectory};
use crate::secrets::CredentialStore;
use crate::tag::Tag;

const BUS_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum EntityChange {
    Upsert { tag: Tag, data: Value },
    Delete { tag: Tag },
    /// The subscription dropped; cached state for this controller was thrown
    /// away and is being rebuilt from the next snapshot.
    Invalidated { controller: Tag },
}

pub type WatcherBus = broadcast::Sender<EntityChange>;

pub fn watcher_bus() -> WatcherBus {
    broadcast::channel(BUS_CAPACITY).0
}

#[derive(Clone)]
struct CachedEntity {
    controller: Tag,
    data: Value,
}

/// Entity state folded out of every backend's change stream.
#[derive(Clone, Default)]
pub struct EntityCache {
    inner: Arc<RwLock<HashMap<Tag, CachedEntity>>>,
}

impl EntityCache {
    pub fn get(&self, tag: &Tag) -> Option<Value> {
        self.inner.read().get(tag).map(|entity| entity.data.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    fn upsert(&self, tag: Tag, controller: Tag, data: Value) {
        self.inner.write().insert(tag, CachedEntity { controller, data });
    }

    fn delete(&self, tag: &Tag) {
        self.inner.write().remove(tag);
    }

    fn invalidate_controller(&self, controller: &Tag) {
        self.inner.write().retain(|_, entity| entity.controller != *controller);
    }
}

pub struct WatcherTask {
    pub controller: Arc<ControllerDescriptor>,
    pub dialer: Arc<ControllerDialer>,
    pub secrets: Arc<dyn CredentialStore>,
    pub cache: EntityCache,
    pub models: ModelDirectory,
    pub bus: WatcherBus,
}

#[async_trait]
impl Task for WatcherTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "backend watcher";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        debug!(controller = %self.controller.tag, "Task started");

        let mut backoff = reconnect_backoff();

        loop {
            let subscription = tokio::select! {
                result = self.subscribe() => result,
                () = shutdown_signal.wait() => break,
            };

            match subscription {
                Ok(mut stream) => {
                    backoff.reset();

                    let outcome = tokio::select! {
                        result = self.pump(&mut stream) => result,
                        () = shutdown_signal.wait() => break,
                    };

                    if let Err(error) = outcome {
                        warn!(controller = %self.controller.tag, error = format!("{error:#}"), "Change stream lost");
                    }
                }
                Err(error) => {
                    warn!(controller = %self.controller.tag, error = format!("{error:#}"), "Subscription failed");
                }
            }

            // Stale state must not serve reads while we are blind.
            self.cache.invalidate_controller(&self.controller.tag);
            let _ = self.bus.send(EntityChange::Invalidated {
                controller: self.controller.tag.clone(),
            });

            let delay = backoff.next_backoff().unwrap_or(Duration::from_secs(120));
            debug!(controller = %self.controller.tag, ?delay, "Reconnecting after backoff");

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = shutdown_signal.wait() => break,
            }
        }

        debug!(controller = %self.controller.tag, "Task terminated");

        Ok(())
    }
}

impl WatcherTask {
    /// Dials the backend, logs in with the stored admin credentials and
    /// opens the all-entities watch.
    async fn subscribe(&self) -> anyhow::Result<Subscription> {
        let credentials = self
            .secrets
            .controller_credentials(&self.controller.tag)
            .await
            .context("fetch admin credentials")?
            .context("no admin credentials stored for this controller")?;

        let mut stream = self
            .dialer
            .dial(&self.controller.tag, "/api")
            .await
            .context("dial backend")?;

        let mut next_id = 0u64;

        let login = RpcMessage {
            request_id: bump(&mut next_id),
            type_: "Admin".to_owned(),
            version: 3,
            request: "Login".to_owned(),
            params: Some(serde_json::json!({
                "auth-tag": format!("user-{}", credentials.username),
                "credentials": credentials.password.expose_secret(),
            })),
            ..RpcMessage::default()
        };

        let reply = call(&mut stream, login).await.context("backend login")?;
        if reply.is_error() {
            // A rejected credential poisons any cached connection too.
            self.dialer.evict(&self.controller.tag);
            anyhow::bail!("backend rejected the watcher login: {}", reply.error);
        }

        let watch_all = RpcMessage {
            request_id: bump(&mut next_id),
            type_: "Client".to_owned(),
            version: 6,
            request: "WatchAll".to_owned(),
            ..RpcMessage::default()
        };

        let reply = call(&mut stream, watch_all).await.context("open watch")?;
        if reply.is_error() {
            anyhow::bail!("backend rejected the watch: {}", reply.error);
        }

        let watcher_id = reply
            .response
            .as_ref()
            .and_then(|response| response.get("watcher-id"))
            .and_then(Value::as_str)
            .context("watch reply carries no watcher-id")?
            .to_owned();

        info!(controller = %self.controller.tag, watcher_id, "Subscribed to the change stream");

        Ok(Subscription {
            stream,
            watcher_id,
            next_id,
        })
    }

    /// Requests deltas forever, folding each batch into the cache.
    async fn pump(&self, subscription: &mut Subscription) -> anyhow::Result<()> {
        loop {
            let next = RpcMessage {
                request_id: bump(&mut subscription.next_id),
                type_: "AllWatcher".to_owned(),
                id: subscription.watcher_id.clone(),
                request: "Next".to_owned(),
                ..RpcMessage::default()
            };

            let reply = call(&mut subscription.stream, next).await.context("watch next")?;
            if reply.is_error() {
                anyhow::bail!("watch errored: {}", reply.error);
            }

            let deltas = reply
                .response
                .as_ref()
                .and_then(|response| response.get("deltas"))
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();

            for delta in &deltas {
                self.apply_delta(delta);
            }

            trace!(controller = %self.controller.tag, batch = deltas.len(), "Applied deltas");
        }
    }

    /// One delta is a `[kind, verb, body]` triple.
    fn apply_delta(&self, delta: &Value) {
        let Some([kind, verb, body]) = delta.as_array().and_then(|parts| <&[Value; 3]>::try_from(parts.as_slice()).ok())
        else {
            trace!(?delta, "Skipping malformed delta");
            return;
        };

        let (Some(kind), Some(verb)) = (kind.as_str(), verb.as_str()) else {
            return;
        };

        let Some(tag) = entity_tag(kind, body) else {
            trace!(kind, "Skipping delta for untracked entity kind");
            return;
        };

        if tag.kind() == crate::tag::Kind::Model {
            if let Some(uuid) = tag.uuid() {
                match verb {
                    "remove" => self.models.forget(uuid),
                    _ => self.models.record(uuid, self.controller.tag.clone()),
                }
            }
        }

        match verb {
            "remove" => {
                self.cache.delete(&tag);
                let _ = self.bus.send(EntityChange::Delete { tag });
            }
            _ => {
                self.cache.upsert(tag.clone(), self.controller.tag.clone(), body.clone());
                let _ = self.bus.send(EntityChange::Upsert {
                    tag,
                    data: body.clone(),
                });
            }
        }
    }
}

struct Subscription {
    stream: MessageStream,
    watcher_id: String,
    next_id: u64,
}

fn bump(next_id: &mut u64) -> u64 {
    *next_id += 1;
    *next_id
}

/// Sequential request/reply over the watcher's own connection. Server-pushed
/// requests that interleave are ignored.
async fn call(stream: &mut MessageStream, request: RpcMessage) -> anyhow::Result<RpcMessage> {
    let request_id = request.request_id;

    stream
        .sink
        .send_text(request.encode())
        .await
        .map_err(|e| anyhow::anyhow!("send failed: {e}"))?;

    loop {
        let frame = stream
            .source
            .recv()
            .await
            .map_err(|e| anyhow::anyhow!("receive failed: {e}"))?;

        match frame {
            None => anyhow::bail!("connection closed"),
            Some(Frame::Close { reason, .. }) => anyhow::bail!("connection closed: {reason}"),
            Some(Frame::Text(text)) => {
                let message = RpcMessage::decode(&text).context("malformed frame")?;
                if !message.is_request() && message.request_id == request_id {
                    return Ok(message);
                }
            }
        }
    }
}

fn entity_tag(kind: &str, body: &Value) -> Option<Tag> {
    match kind {
        "model" => {
            let uuid = body
                .get("model-uuid")
                .or_else(|| body.get("uuid"))
                .and_then(Value::as_str)?;
            Some(Tag::model(Uuid::parse_str(uuid).ok()?))
        }
        "applicationOffer" | "offer" => {
            let id = body
                .get("offer-uuid")
                .or_else(|| body.get("offer-url"))
                .and_then(Value::as_str)?;
            Some(Tag::offer(id))
        }
        _ => None,
    }
}

fn reconnect_backoff() -> ExponentialBackoff {
    backoff::ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_secs(1))
        .with_max_interval(Duration::from_secs(120))
        .with_max_elapsed_time(None)
        .build()
}
