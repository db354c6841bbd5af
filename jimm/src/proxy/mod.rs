//! The RPC proxy: one task per client WebSocket, intercepting the login,
//! relaying requests to the routed backend and driving the
//! permission-upgrade re-login loop.

pub mod facade;
pub mod rpc;
pub mod transport;

use std::cmp;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use jimm_task::{ChildTask, ShutdownSignal};
use tokio::sync::{mpsc, oneshot};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::access::AccessMap;
use crate::auth::identity::Identity;
use crate::auth::{Authenticator, LoginParams};
use crate::error::Error;
use crate::jwt::JwtMinter;
use crate::rebac::{Authorizer, Relation};
use crate::tag::{Kind, Tag};

use self::rpc::{ACCESS_REQUIRED_CODE, RpcMessage};
use self::transport::{Frame, MessageSink, MessageSource, MessageStream};

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
pub const CLOSE_OVERFLOW: u16 = 1008;
pub const CLOSE_BAD_GATEWAY: u16 = 1014;

pub const INVALID_RPC_CLOSE_TEXT: &str = "received invalid RPC message";

/// Per-direction write queue bound. A client that stops reading while the
/// backend keeps answering hits this and the session closes with 1008.
const WRITE_QUEUE_CAPACITY: usize = 64;

/// Opens the backend leg once the login has been intercepted and routed.
#[async_trait]
pub trait BackendConnector: Send + Sync {
    async fn connect(&self) -> Result<MessageStream, Error>;

    /// Hands a healthy backend leg back after a cleanly finished session.
    fn release(&self, stream: MessageStream) {
        drop(stream);
    }

    /// Backend rejected our authentication; cached connections are stale.
    fn evict(&self) {}
}

/// Where this session was routed from the URL path.
#[derive(Debug, Clone)]
pub struct Route {
    pub controller: Tag,
    /// Set for `/model/<uuid>/...` connections.
    pub model: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub jimm_controller_uuid: Uuid,
    pub jimm_tag: Tag,
    pub public_dns_name: String,
    pub reply_timeout: Duration,
}

#[derive(TypedBuilder)]
pub struct ProxySession {
    config: SessionConfig,
    route: Route,
    authorizer: Authorizer,
    minter: Arc<JwtMinter>,
    authenticator: Arc<dyn Authenticator>,
    connector: Arc<dyn BackendConnector>,
    /// Registry entry to annotate once the principal is known.
    #[builder(default)]
    session_registry: Option<(crate::session::SessionRegistryHandle, Uuid)>,
}

// ----- write pumps ----- //

struct WriterHandle {
    text_tx: mpsc::Sender<String>,
    close_tx: Option<oneshot::Sender<(u16, String)>>,
    task: Option<ChildTask<Option<Box<dyn MessageSink>>>>,
}

enum WriteRejected {
    QueueFull,
    PeerGone,
}

impl WriterHandle {
    fn spawn(mut sink: Box<dyn MessageSink>) -> Self {
        let (text_tx, mut text_rx) = mpsc::channel::<String>(WRITE_QUEUE_CAPACITY);
        let (close_tx, mut close_rx) = oneshot::channel::<(u16, String)>();

        let task = ChildTask::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    close = &mut close_rx => {
                        return match close {
                            Ok((code, reason)) => {
                                // Frames enqueued before the close still go out.
                                while let Ok(text) = text_rx.try_recv() {
                                    if sink.send_text(text).await.is_err() {
                                        return None;
                                    }
                                }
                                let _ = sink.close(code, reason).await;
                                None
                            }
                            // Close handle dropped without a close frame:
                            // drain the queue, then hand the sink back for reuse.
                            Err(_) => {
                                while let Some(text) = text_rx.recv().await {
                                    if sink.send_text(text).await.is_err() {
                                        return None;
                                    }
                                }
                                Some(sink)
                            }
                        };
                    }
                    text = text_rx.recv() => {
                        match text {
                            Some(text) => {
                                if sink.send_text(text).await.is_err() {
                                    return None;
                                }
                            }
                            None => return Some(sink),
                        }
                    }
                }
            }
        });

        Self {
            text_tx,
            close_tx: Some(close_tx),
            task: Some(task),
        }
    }

    /// Shuts the pump down without a close frame and recovers the sink.
    async fn into_sink(self) -> Option<Box<dyn MessageSink>> {
        let Self {
            text_tx,
            close_tx,
            task,
        } = self;

        drop(text_tx);
        drop(close_tx);

        match task {
            Some(task) => task.join().await.ok().flatten(),
            None => None,
        }
    }

    fn enqueue(&self, message: &RpcMessage) -> Result<(), WriteRejected> {
        self.enqueue_text(message.encode())
    }

    fn enqueue_text(&self, text: String) -> Result<(), WriteRejected> {
        self.text_tx.try_send(text).map_err(|error| match error {
            mpsc::error::TrySendError::Full(_) => WriteRejected::QueueFull,
            mpsc::error::TrySendError::Closed(_) => WriteRejected::PeerGone,
        })
    }

    fn close(&mut self, code: u16, reason: impl Into<String>) {
        if let Some(close_tx) = self.close_tx.take() {
            let _ = close_tx.send((code, reason.into()));
        }

        // Let the pump deliver the close frame instead of aborting it.
        if let Some(task) = self.task.take() {
            task.detach();
        }
    }
}

// ----- session bookkeeping ----- //

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallKind {
    /// The intercepted login forwarded on behalf of the client; its reply is
    /// rewritten to present this gateway as the controller.
    InitialLogin,
    Forwarded,
}

struct PendingCall {
    request: RpcMessage,
    kind: CallKind,
}

struct Replay {
    login_id: u64,
    original_request: RpcMessage,
    original_error: RpcMessage,
}

#[derive(Default)]
struct SessionState {
    principal: Option<Identity>,
    access: AccessMap,
    captured_login: Option<RpcMessage>,
    pending: HashMap<u64, PendingCall>,
    /// Requests already retried once after an elevation, keyed by request id,
    /// carrying the first `access required` error for re-surfacing.
    retried: HashMap<u64, RpcMessage>,
    max_request_id: u64,
    /// `Some` while a captured-login replay is in flight: the client pump is
    /// paused and backend replies are buffered until the replay settles.
    replay: Option<Replay>,
    buffered: Vec<RpcMessage>,
}

impl SessionState {
    fn allocate_internal_id(&mut self) -> u64 {
        self.max_request_id += 1;
        self.max_request_id
    }
}

/// Why the session ends; drives the close frames both ways.
enum SessionEnd {
    ClientClosed,
    BackendClosed { code: Option<u16>, reason: String },
    Protocol { code: u16, reason: String },
    ClientOverflow,
    Shutdown,
}

struct DeadlineEntry {
    deadline: tokio::time::Instant,
    request_id: u64,
}

impl PartialEq for DeadlineEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.request_id == other.request_id
    }
}

impl Eq for DeadlineEntry {}

impl PartialOrd for DeadlineEntry {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DeadlineEntry {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        // Soonest deadline on top of the heap.
        match self.deadline.cmp(&other.deadline) {
            cmp::Ordering::Less => cmp::Ordering::Greater,
            cmp::Ordering::Equal => self.request_id.cmp(&other.request_id),
            cmp::Ordering::Greater => cmp::Ordering::Less,
        }
    }
}

impl ProxySession {
    /// Drives the session until either side goes away. Owns every piece of
    /// per-session state; dropping the returned future cancels all in-flight
    /// backend waits.
    #[instrument(skip_all, fields(controller = %self.route.controller))]
    pub async fn run(self, client: MessageStream, mut shutdown_signal: ShutdownSignal) {
        let MessageStream {
            source: mut client_rx,
            sink: client_sink,
        } = client;

        let mut client_tx = WriterHandle::spawn(client_sink);
        let mut backend_rx: Option<Box<dyn MessageSource>> = None;
        let mut backend_tx: Option<WriterHandle> = None;

        let mut st = SessionState::default();

        let mut deadlines = BinaryHeap::<DeadlineEntry>::new();
        let reply_sleep = tokio::time::sleep_until(tokio::time::Instant::now());
        tokio::pin!(reply_sleep);
        (&mut reply_sleep).await; // Consume initial sleep.

        let end = loop {
            // Re-arm the reply timeout with the soonest deadline.
            if let Some(next) = deadlines.peek() {
                if reply_sleep.is_elapsed() || next.deadline < reply_sleep.deadline() {
                    reply_sleep.as_mut().reset(next.deadline);
                }
            }

            let step = tokio::select! {
                frame = client_rx.recv(), if st.replay.is_none() => {
                    match frame {
                        Err(_) | Ok(None) | Ok(Some(Frame::Close { .. })) => Err(SessionEnd::ClientClosed),
                        Ok(Some(Frame::Text(text))) => {
                            self.on_client_text(&mut st, &client_tx, &mut backend_rx, &mut backend_tx, text)
                                .await
                        }
                    }
                }
                frame = async { backend_rx.as_mut().expect("branch is guarded").recv().await }, if backend_rx.is_some() => {
                    match frame {
                        Err(error) => Err(SessionEnd::BackendClosed { code: None, reason: error.to_string() }),
                        Ok(None) => Err(SessionEnd::BackendClosed { code: None, reason: String::new() }),
                        Ok(Some(Frame::Close { code, reason })) => Err(SessionEnd::BackendClosed { code, reason }),
                        Ok(Some(Frame::Text(text))) => {
                            self.on_backend_text(&mut st, &client_tx, backend_tx.as_ref(), text).await
                        }
                    }
                }
                () = &mut reply_sleep, if !deadlines.is_empty() => {
                    self.on_deadline(&mut st, &client_tx, &mut deadlines)
                }
                () = shutdown_signal.wait() => Err(SessionEnd::Shutdown),
            };

            match step {
                Ok(()) => {
                    // Register deadlines for calls forwarded by this step.
                    for id in st.pending.keys() {
                        if !deadlines.iter().any(|entry| entry.request_id == *id) {
                            deadlines.push(DeadlineEntry {
                                deadline: tokio::time::Instant::now() + self.config.reply_timeout,
                                request_id: *id,
                            });
                        }
                    }
                }
                Err(end) => break end,
            }
        };

        self.finish(&mut st, &mut client_tx, backend_rx, backend_tx, end).await;
    }

    async fn finish(
        &self,
        st: &mut SessionState,
        client_tx: &mut WriterHandle,
        backend_rx: Option<Box<dyn MessageSource>>,
        backend_tx: Option<WriterHandle>,
        end: SessionEnd,
    ) {
        // A replay that never settled surfaces as unavailability, not silence.
        if let Some(replay) = st.replay.take() {
            let reply = RpcMessage::error_reply(
                replay.original_request.request_id,
                &Error::unavailable("backend closed during re-login"),
            );
            let _ = client_tx.enqueue(&reply);
        }

        match end {
            SessionEnd::ClientClosed => {
                debug!("Client closed the session");

                // A healthy backend leg goes back to the connection cache;
                // the next session to this controller re-logs-in over it.
                if let (Some(backend_rx), Some(backend_tx)) = (backend_rx, backend_tx) {
                    if st.pending.is_empty() {
                        if let Some(sink) = backend_tx.into_sink().await {
                            self.connector.release(MessageStream {
                                source: backend_rx,
                                sink,
                            });
                        }
                    } else {
                        let mut backend_tx = backend_tx;
                        backend_tx.close(CLOSE_NORMAL, "");
                    }
                }
            }
            SessionEnd::BackendClosed { code, reason } => {
                debug!(?code, reason, "Backend closed the session");
                match code {
                    Some(CLOSE_NORMAL) => client_tx.close(CLOSE_NORMAL, reason),
                    _ => client_tx.close(CLOSE_BAD_GATEWAY, reason),
                }
            }
            SessionEnd::Protocol { code, reason } => {
                debug!(code, reason, "Protocol violation");
                client_tx.close(code, reason);
                if let Some(mut backend_tx) = backend_tx {
                    backend_tx.close(CLOSE_NORMAL, "");
                }
            }
            SessionEnd::ClientOverflow => {
                warn!("Client reply queue overflowed");
                client_tx.close(CLOSE_OVERFLOW, "reply queue overflow");
                if let Some(mut backend_tx) = backend_tx {
                    backend_tx.close(CLOSE_NORMAL, "");
                }
            }
            SessionEnd::Shutdown => {
                client_tx.close(CLOSE_NORMAL, "gateway shutting down");
                if let Some(mut backend_tx) = backend_tx {
                    backend_tx.close(CLOSE_NORMAL, "");
                }
            }
        }
    }

    // ----- client to backend ----- //

    async fn on_client_text(
        &self,
        st: &mut SessionState,
        client_tx: &WriterHandle,
        backend_rx: &mut Option<Box<dyn MessageSource>>,
        backend_tx: &mut Option<WriterHandle>,
        text: String,
    ) -> Result<(), SessionEnd> {
        let Ok(message) = RpcMessage::decode(&text) else {
            return Err(protocol_violation(INVALID_RPC_CLOSE_TEXT));
        };

        if !message.is_well_formed() {
            return Err(protocol_violation(INVALID_RPC_CLOSE_TEXT));
        }

        if st.principal.is_none() {
            if !message.is_login() {
                let reply = RpcMessage::error_reply(message.request_id, &Error::unauthorized("not logged in"));
                return send_to_client(client_tx, &reply);
            }

            return self.intercept_login(st, client_tx, backend_rx, backend_tx, message).await;
        }

        // The client answering a backend-initiated request: relay without
        // registering a pending call, no reply is owed for it.
        if !message.is_request() {
            let backend_tx = backend_tx.as_ref().expect("authenticated sessions have a backend");
            return send_to_backend(backend_tx, &message);
        }

        // Relation management is terminated here, never forwarded.
        if message.type_ == facade::FACADE_TYPE {
            let principal = st.principal.as_ref().expect("checked above").tag.clone();

            let reply = match facade::dispatch(&self.authorizer, &principal, &message).await {
                Ok(response) => RpcMessage {
                    request_id: message.request_id,
                    response: Some(response),
                    ..RpcMessage::default()
                },
                Err(error) => RpcMessage::error_reply(message.request_id, &error),
            };

            return send_to_client(client_tx, &reply);
        }

        // Re-login over an established session refreshes the captured copy.
        if message.is_login() {
            st.captured_login = Some(message.clone());
        }

        if st.pending.contains_key(&message.request_id) {
            return Err(protocol_violation("duplicate request id"));
        }

        st.max_request_id = st.max_request_id.max(message.request_id);
        st.pending.insert(
            message.request_id,
            PendingCall {
                request: message.clone(),
                kind: CallKind::Forwarded,
            },
        );

        let backend_tx = backend_tx.as_ref().expect("authenticated sessions have a backend");
        send_to_backend(backend_tx, &message)
    }

    /// Login interception: resolve the identity, build the initial access
    /// map, capture the login verbatim, mint the capability token, dial the
    /// routed backend and forward the augmented login.
    async fn intercept_login(
        &self,
        st: &mut SessionState,
        client_tx: &WriterHandle,
        backend_rx: &mut Option<Box<dyn MessageSource>>,
        backend_tx: &mut Option<WriterHandle>,
        message: RpcMessage,
    ) -> Result<(), SessionEnd> {
        let params: LoginParams = message
            .params
            .clone()
            .map(serde_json::from_value)
            .transpose()
            .ok()
            .flatten()
            .unwrap_or_default();

        let identity = match self.authenticator.authenticate(&params).await {
            Ok(identity) => identity,
            Err(error) => {
                info!(%error, "Login rejected");
                let reply = RpcMessage::error_reply(message.request_id, &error);
                return send_to_client(client_tx, &reply);
            }
        };

        let access = match self.initial_access_map(&identity).await {
            Ok(access) => access,
            Err(error) => {
                let reply = RpcMessage::error_reply(message.request_id, &error);
                return send_to_client(client_tx, &reply);
            }
        };

        let token = match self.minter.mint(&self.route.controller, &identity.tag, &access).await {
            Ok(token) => token,
            Err(error) => {
                error!(%error, "Could not mint the capability token");
                let reply = RpcMessage::error_reply(message.request_id, &error);
                return send_to_client(client_tx, &reply);
            }
        };

        info!(principal = %identity.tag, "Login intercepted");

        if let Some((registry, session_id)) = &self.session_registry {
            let _ = registry.set_principal(*session_id, identity.tag.clone()).await;
        }

        st.principal = Some(identity);
        st.access = access;
        st.captured_login = Some(message.clone());
        st.max_request_id = st.max_request_id.max(message.request_id);

        let forwarded = splice_token(&message, &token);

        let backend = match self.connector.connect().await {
            Ok(backend) => backend,
            Err(error) => {
                warn!(%error, "Backend unreachable");
                return Err(SessionEnd::BackendClosed {
                    code: None,
                    reason: error.to_string(),
                });
            }
        };

        *backend_rx = Some(backend.source);
        let writer = WriterHandle::spawn(backend.sink);

        st.pending.insert(
            forwarded.request_id,
            PendingCall {
                request: forwarded.clone(),
                kind: CallKind::InitialLogin,
            },
        );

        let result = send_to_backend(&writer, &forwarded);
        *backend_tx = Some(writer);
        result
    }

    /// The initial access map: `superuser` over this gateway for its admins,
    /// the strongest model access the principal holds when routing to a
    /// model, nothing more.
    async fn initial_access_map(&self, identity: &Identity) -> Result<AccessMap, Error> {
        let mut access = AccessMap::new();

        if self.authorizer.is_jimm_admin(&identity.tag).await? {
            access.insert(self.config.jimm_tag.clone(), "superuser");
        }

        if let Some(model) = self.route.model {
            let model_tag = Tag::model(model);

            let level = if self.authorizer.check(&identity.tag, Relation::Administrator, &model_tag).await? {
                Some("admin")
            } else if self.authorizer.check(&identity.tag, Relation::Writer, &model_tag).await? {
                Some("write")
            } else if self.authorizer.check(&identity.tag, Relation::Reader, &model_tag).await? {
                Some("read")
            } else {
                None
            };

            if let Some(level) = level {
                access.insert(model_tag, level);
            }
        }

        Ok(access)
    }

    // ----- backend to client ----- //

    async fn on_backend_text(
        &self,
        st: &mut SessionState,
        client_tx: &WriterHandle,
        backend_tx: Option<&WriterHandle>,
        text: String,
    ) -> Result<(), SessionEnd> {
        let Ok(message) = RpcMessage::decode(&text) else {
            return Err(protocol_violation(INVALID_RPC_CLOSE_TEXT));
        };

        if !message.is_well_formed() {
            return Err(protocol_violation(INVALID_RPC_CLOSE_TEXT));
        }

        // Backend-initiated requests cross unchanged.
        if message.is_request() {
            return send_to_client(client_tx, &message);
        }

        // Replies settle one at a time; a completed replay flushes whatever
        // was buffered behind it through the same path.
        let mut queue = VecDeque::from([message]);

        while let Some(message) = queue.pop_front() {
            let flushed = self.on_backend_reply(st, client_tx, backend_tx, message).await?;
            if flushed {
                queue.extend(st.buffered.drain(..));
            }
        }

        Ok(())
    }

    /// Handles one backend reply. Returns whether a replay settled and the
    /// buffered replies behind it should be flushed.
    async fn on_backend_reply(
        &self,
        st: &mut SessionState,
        client_tx: &WriterHandle,
        backend_tx: Option<&WriterHandle>,
        message: RpcMessage,
    ) -> Result<bool, SessionEnd> {
        if let Some(replay) = &st.replay {
            if message.request_id != replay.login_id {
                // The replay serializes the session: hold everything else.
                st.buffered.push(message);
                return Ok(false);
            }

            let replay = st.replay.take().expect("checked above");

            if message.is_error() {
                warn!(error = message.error, "Re-login failed, surfacing the original error");
                send_to_client(client_tx, &replay.original_error)?;
                return Ok(true);
            }

            // Replay acknowledged: retry the original request exactly once.
            debug!(request_id = replay.original_request.request_id, "Re-login complete, retrying");
            st.retried
                .insert(replay.original_request.request_id, replay.original_error);
            st.pending.insert(
                replay.original_request.request_id,
                PendingCall {
                    request: replay.original_request.clone(),
                    kind: CallKind::Forwarded,
                },
            );

            let backend_tx = backend_tx.expect("replay implies a backend");
            send_to_backend(backend_tx, &replay.original_request)?;
            return Ok(true);
        }

        let Some(pending) = st.pending.remove(&message.request_id) else {
            // Stale reply, e.g. after a synthesized timeout. Drop it.
            debug!(request_id = message.request_id, "Dropping unsolicited reply");
            return Ok(false);
        };

        if message.error_code == ACCESS_REQUIRED_CODE {
            self.on_access_required(st, client_tx, backend_tx, pending, message).await?;
            return Ok(false);
        }

        let reply = match pending.kind {
            CallKind::InitialLogin if message.is_error() => {
                // Whatever we reused or minted, the backend did not take it.
                self.connector.evict();
                message
            }
            CallKind::InitialLogin => self.rewrite_login_reply(message),
            CallKind::Forwarded => {
                st.retried.remove(&message.request_id);
                self.filter_list_reply(st, &pending.request, message).await
            }
        };

        send_to_client(client_tx, &reply)?;
        Ok(false)
    }

    /// The permission-upgrade loop of the session state machine.
    async fn on_access_required(
        &self,
        st: &mut SessionState,
        client_tx: &WriterHandle,
        backend_tx: Option<&WriterHandle>,
        pending: PendingCall,
        message: RpcMessage,
    ) -> Result<(), SessionEnd> {
        let principal = st.principal.as_ref().expect("relaying implies a principal").clone();

        // A retry that hits the wall again surfaces the first error.
        if let Some(original_error) = st.retried.remove(&message.request_id) {
            debug!(request_id = message.request_id, "Retry demanded another upgrade, giving up");
            return send_to_client(client_tx, &original_error);
        }

        let Some(info) = message.error_info.clone() else {
            return send_to_client(client_tx, &message);
        };

        // Verify the demanded grants before widening the token. Unknown
        // levels are opaque: they merge unchecked and the backend remains
        // the judge of what they mean.
        let mut requested = AccessMap::new();
        for (raw_tag, level) in &info {
            let Ok(tag) = raw_tag.parse::<Tag>() else {
                return send_to_client(client_tx, &message);
            };
            let Some(level) = level.as_str() else {
                return send_to_client(client_tx, &message);
            };

            if Relation::from_access_level(level).is_some() {
                let held = self
                    .authorizer
                    .check_access_level(&principal.tag, level, &tag)
                    .await
                    .unwrap_or(false);

                if !held {
                    debug!(%tag, level, "Demanded access is not held, surfacing the error");
                    return send_to_client(client_tx, &message);
                }
            }

            requested.insert(tag, level);
        }

        st.access.merge_max(&requested);

        let token = match self
            .minter
            .mint(&self.route.controller, &principal.tag, &st.access)
            .await
        {
            Ok(token) => token,
            Err(error) => {
                error!(%error, "Could not re-mint after an upgrade");
                let reply = RpcMessage::error_reply(message.request_id, &error);
                return send_to_client(client_tx, &reply);
            }
        };

        let captured = st.captured_login.clone().expect("relaying implies a captured login");
        let login_id = st.allocate_internal_id();

        let mut replay_login = splice_token(&captured, &token);
        replay_login.request_id = login_id;

        info!(request_id = pending.request.request_id, "Access map extended, replaying login");

        st.replay = Some(Replay {
            login_id,
            original_request: pending.request,
            original_error: message,
        });

        let backend_tx = backend_tx.expect("upgrade implies a backend");
        send_to_backend(backend_tx, &replay_login)
    }

    /// Presents this gateway as the controller the client spoke to.
    fn rewrite_login_reply(&self, mut message: RpcMessage) -> RpcMessage {
        let Some(response) = message.response.as_mut().and_then(|value| value.as_object_mut()) else {
            return message;
        };

        response.insert(
            "controller-tag".to_owned(),
            serde_json::json!(format!("controller-{}", self.config.jimm_controller_uuid)),
        );
        response.insert("servers".to_owned(), serde_json::Value::Null);
        response.insert(
            "public-dns-name".to_owned(),
            serde_json::json!(self.config.public_dns_name),
        );

        message
    }

    /// Hides entities the principal cannot see from list replies.
    async fn filter_list_reply(&self, st: &SessionState, request: &RpcMessage, mut message: RpcMessage) -> RpcMessage {
        let principal = match &st.principal {
            Some(principal) => principal.tag.clone(),
            None => return message,
        };

        match request.request.as_str() {
            "ListModels" | "ListModelSummaries" => {
                let allowed = match self.authorizer.list_objects(&principal, Relation::Reader, Kind::Model).await {
                    Ok(models) => models.iter().map(|tag| tag.id().to_owned()).collect::<HashSet<_>>(),
                    Err(error) => {
                        warn!(%error, "Could not list visible models, leaving the reply unfiltered");
                        return message;
                    }
                };

                if let Some(entries) = list_entries(&mut message, &["user-models", "results", "models"]) {
                    entries.retain(|entry| {
                        model_uuid_of(entry).map(|uuid| allowed.contains(uuid)).unwrap_or(false)
                    });
                }
            }
            "ListApplicationOffers" | "FindApplicationOffers" => {
                let allowed = match self.authorizer.list_objects(&principal, Relation::Reader, Kind::Offer).await {
                    Ok(offers) => offers.iter().map(|tag| tag.id().to_owned()).collect::<HashSet<_>>(),
                    Err(error) => {
                        warn!(%error, "Could not list visible offers, leaving the reply unfiltered");
                        return message;
                    }
                };

                if let Some(entries) = list_entries(&mut message, &["results"]) {
                    entries.retain(|entry| offer_id_of(entry).map(|id| allowed.contains(id)).unwrap_or(false));
                }
            }
            _ => {}
        }

        message
    }

    fn on_deadline(
        &self,
        st: &mut SessionState,
        client_tx: &WriterHandle,
        deadlines: &mut BinaryHeap<DeadlineEntry>,
    ) -> Result<(), SessionEnd> {
        let now = tokio::time::Instant::now();

        while let Some(next) = deadlines.peek() {
            if next.deadline > now {
                break;
            }

            let entry = deadlines.pop().expect("peeked just above");

            if st.pending.remove(&entry.request_id).is_some() {
                warn!(request_id = entry.request_id, "Backend reply timed out");
                st.retried.remove(&entry.request_id);
                send_to_client(client_tx, &RpcMessage::timeout_reply(entry.request_id))?;
            }
        }

        Ok(())
    }
}

// ----- helpers ----- //

fn protocol_violation(reason: &str) -> SessionEnd {
    SessionEnd::Protocol {
        code: CLOSE_PROTOCOL_ERROR,
        reason: reason.to_owned(),
    }
}

fn send_to_client(client_tx: &WriterHandle, message: &RpcMessage) -> Result<(), SessionEnd> {
    client_tx.enqueue(message).map_err(|rejected| match rejected {
        WriteRejected::QueueFull => SessionEnd::ClientOverflow,
        WriteRejected::PeerGone => SessionEnd::ClientClosed,
    })
}

fn send_to_backend(backend_tx: &WriterHandle, message: &RpcMessage) -> Result<(), SessionEnd> {
    backend_tx.enqueue(message).map_err(|rejected| match rejected {
        WriteRejected::QueueFull => SessionEnd::ClientOverflow,
        WriteRejected::PeerGone => SessionEnd::BackendClosed {
            code: None,
            reason: "backend write failed".to_owned(),
        },
    })
}

/// The minted token rides the login params as a base64 field named `token`.
fn splice_token(login: &RpcMessage, token: &str) -> RpcMessage {
    let mut forwarded = login.clone();

    let mut params = match forwarded.params.take() {
        Some(serde_json::Value::Object(params)) => params,
        _ => serde_json::Map::new(),
    };

    params.insert("token".to_owned(), serde_json::json!(BASE64.encode(token)));
    forwarded.params = Some(serde_json::Value::Object(params));

    forwarded
}

fn list_entries<'a>(
    message: &'a mut RpcMessage,
    candidates: &[&str],
) -> Option<&'a mut Vec<serde_json::Value>> {
    let response = message.response.as_mut()?.as_object_mut()?;

    let key = candidates
        .iter()
        .find(|key| matches!(response.get(**key), Some(serde_json::Value::Array(_))))?;

    response.get_mut(*key)?.as_array_mut()
}

fn model_uuid_of(entry: &serde_json::Value) -> Option<&str> {
    entry
        .pointer("/model/uuid")
        .or_else(|| entry.pointer("/uuid"))
        .and_then(|value| value.as_str())
}

fn offer_id_of(entry: &serde_json::Value) -> Option<&str> {
    entry
        .pointer("/result/offer-uuid")
        .or_else(|| entry.pointer("/offer-uuid"))
        .or_else(|| entry.pointer("/offer-url"))
        .and_then(|value| value.as_str())
}
