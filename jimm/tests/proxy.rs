//! End-to-end exercises of the proxy session state machine over in-process
//! transports, with a scripted backend on the far side.

#![allow(unused_crate_dependencies)]
#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use camino::Utf8Path;
use parking_lot::Mutex;
use time::OffsetDateTime;
use uuid::Uuid;

use jimm::auth::identity::IdentityResolver;
use jimm::auth::MacaroonAuthenticator;
use jimm::bakery::Bakery;
use jimm::error::Error;
use jimm::jwks::{JwksRotator, PublishedJwks};
use jimm::jwt::JwtMinter;
use jimm::proxy::rpc::RpcMessage;
use jimm::proxy::transport::{channel_pair, Frame, MessageStream};
use jimm::proxy::{BackendConnector, ProxySession, Route, SessionConfig};
use jimm::rebac::memory::MemoryBackend;
use jimm::rebac::{Authorizer, Relation, RelationStore, Tuple};
use jimm::secrets::{CredentialStore, FileCredentialStore};
use jimm::tag::{Kind, Tag};

const JIMM_UUID: &str = "11111111-1111-1111-1111-111111111111";
const BACKEND_UUID: &str = "22222222-2222-2222-2222-222222222222";

struct TestEnv {
    authorizer: Authorizer,
    minter: Arc<JwtMinter>,
    secrets: Arc<dyn CredentialStore>,
    bakery: Arc<Bakery>,
    jimm_tag: Tag,
    backend_tag: Tag,
}

impl TestEnv {
    async fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let data_dir = Utf8Path::from_path(dir.path()).expect("utf-8 temp dir").to_path_buf();
        std::mem::forget(dir);

        let secrets: Arc<dyn CredentialStore> = Arc::new(FileCredentialStore::open(&data_dir, true).expect("store"));

        let (rotator, _errors) = JwksRotator::new(
            Arc::clone(&secrets),
            Duration::from_secs(3600),
            Duration::from_secs(3600),
        );
        rotator.initialize().await.expect("initial rotation");

        let minter = Arc::new(JwtMinter::new(
            Arc::clone(&secrets),
            "jimm.example".to_owned(),
            Duration::from_secs(86400),
            1024,
        ));

        let jimm_tag = Tag::controller(Uuid::parse_str(JIMM_UUID).unwrap());
        let authorizer = Authorizer::new(RelationStore::new(Arc::new(MemoryBackend::new())), jimm_tag.clone());

        let bakery = Arc::new(Bakery::new_ephemeral(
            "jimm.example".to_owned(),
            Duration::from_secs(900),
        ));

        Self {
            authorizer,
            minter,
            secrets,
            bakery,
            jimm_tag,
            backend_tag: Tag::controller(Uuid::parse_str(BACKEND_UUID).unwrap()),
        }
    }

    async fn grant(&self, object: Tag, relation: Relation, target: Tag) {
        self.authorizer
            .store()
            .add_relation(&[Tuple::new(object, relation, target)])
            .await
            .expect("seed tuple");
    }

    async fn published(&self) -> PublishedJwks {
        self.secrets.jwks_state().await.expect("state").set.expect("set")
    }

    /// Spawns a session routed to `model`; returns the client's endpoint and
    /// the backend's endpoint.
    fn spawn_session(&self, model: Option<Uuid>, reply_timeout: Duration) -> (MessageStream, MessageStream) {
        let (client_peer, client_side) = channel_pair(64);
        let (backend_side, backend_peer) = channel_pair(64);

        let session = ProxySession::builder()
            .config(SessionConfig {
                jimm_controller_uuid: Uuid::parse_str(JIMM_UUID).unwrap(),
                jimm_tag: self.jimm_tag.clone(),
                public_dns_name: "jimm.example".to_owned(),
                reply_timeout,
            })
            .route(Route {
                controller: self.backend_tag.clone(),
                model,
            })
            .authorizer(self.authorizer.clone())
            .minter(Arc::clone(&self.minter))
            .authenticator(Arc::new(MacaroonAuthenticator::new(
                Arc::clone(&self.bakery),
                IdentityResolver::new(),
            )))
            .connector(Arc::new(OneShotConnector(Mutex::new(Some(backend_side)))))
            .build();

        tokio::spawn(session.run(client_side, jimm_task::ShutdownSignal::never()));

        (client_peer, backend_peer)
    }

    fn login_message(&self, request_id: u64, username: &str) -> RpcMessage {
        let macaroon = self
            .bakery
            .mint("login".to_owned(), [format!("declared username {username}")]);

        RpcMessage {
            request_id,
            type_: "Admin".to_owned(),
            request: "Login".to_owned(),
            params: Some(serde_json::json!({"macaroons": [macaroon]})),
            ..RpcMessage::default()
        }
    }
}

struct OneShotConnector(Mutex<Option<MessageStream>>);

#[async_trait]
impl BackendConnector for OneShotConnector {
    async fn connect(&self) -> Result<MessageStream, Error> {
        self.0
            .lock()
            .take()
            .ok_or_else(|| Error::unavailable("backend already taken"))
    }
}

async fn send(stream: &mut MessageStream, message: &RpcMessage) {
    stream.sink.send_text(message.encode()).await.expect("send");
}

async fn recv(stream: &mut MessageStream) -> RpcMessage {
    match recv_frame(stream).await {
        Frame::Text(text) => RpcMessage::decode(&text).expect("well-formed frame"),
        frame => panic!("expected a text frame, got {frame:?}"),
    }
}

async fn recv_frame(stream: &mut MessageStream) -> Frame {
    tokio::time::timeout(Duration::from_secs(10), stream.source.recv())
        .await
        .expect("frame within deadline")
        .expect("transport healthy")
        .expect("peer still connected")
}

async fn assert_silent(stream: &mut MessageStream) {
    let outcome = tokio::time::timeout(Duration::from_millis(200), stream.source.recv()).await;
    assert!(outcome.is_err(), "expected no traffic, got {outcome:?}");
}

fn token_of(login: &RpcMessage) -> String {
    let encoded = login.params.as_ref().unwrap()["token"].as_str().expect("token field");
    String::from_utf8(BASE64.decode(encoded).expect("base64 token")).expect("utf-8 token")
}

/// Drives the backend half of a successful login exchange and returns the
/// claims carried by the minted token.
async fn accept_login(env: &TestEnv, backend: &mut MessageStream) -> jimm::jwt::Claims {
    let login = recv(backend).await;
    assert!(login.is_login(), "expected the forwarded login, got {login:?}");

    let claims = jimm::jwt::verify(&token_of(&login), &env.published().await, OffsetDateTime::now_utc())
        .expect("token verifies against the published set");

    let reply = RpcMessage {
        request_id: login.request_id,
        response: Some(serde_json::json!({
            "public-dns-name": "backend.example",
            "servers": [[{"value": "10.0.0.1", "port": 17070}]],
            "controller-tag": format!("controller-{BACKEND_UUID}"),
        })),
        ..RpcMessage::default()
    };
    send(backend, &reply).await;

    claims
}

#[tokio::test]
async fn happy_login_rewrites_controller_identity() {
    let env = TestEnv::new().await;
    env.grant(
        Tag::user("alice@canonical.com"),
        Relation::Administrator,
        env.jimm_tag.clone(),
    )
    .await;

    let (mut client, mut backend) = env.spawn_session(None, Duration::from_secs(300));

    send(&mut client, &env.login_message(1, "alice")).await;

    let claims = accept_login(&env, &mut backend).await;
    assert_eq!(claims.sub, "user-alice@canonical.com");
    assert_eq!(claims.aud, format!("controller-{BACKEND_UUID}"));
    assert_eq!(claims.access.get(&env.jimm_tag), Some("superuser"));

    let reply = recv(&mut client).await;
    assert_eq!(reply.request_id, 1);

    let response = reply.response.expect("login response");
    assert_eq!(response["public-dns-name"], "jimm.example");
    assert_eq!(response["servers"], serde_json::Value::Null);
    assert_eq!(response["controller-tag"], format!("controller-{JIMM_UUID}"));
}

#[tokio::test]
async fn permission_upgrade_replays_login_and_retries_once() {
    let env = TestEnv::new().await;
    let model_tag = Tag::new(Kind::Model, "m-1");
    env.grant(Tag::user("alice@canonical.com"), Relation::Reader, model_tag.clone())
        .await;

    let (mut client, mut backend) = env.spawn_session(None, Duration::from_secs(300));

    send(&mut client, &env.login_message(1, "alice")).await;
    accept_login(&env, &mut backend).await;
    let _ = recv(&mut client).await; // login reply

    let request = RpcMessage {
        request_id: 2,
        type_: "ModelManager".to_owned(),
        request: "ModelInfo".to_owned(),
        params: Some(serde_json::json!({"uuid": "m-1"})),
        ..RpcMessage::default()
    };
    send(&mut client, &request).await;

    let forwarded = recv(&mut backend).await;
    assert_eq!(forwarded.request_id, 2);

    // The backend demands read on the model before answering.
    let denial = RpcMessage {
        request_id: 2,
        error: "access required".to_owned(),
        error_code: "access required".to_owned(),
        error_info: Some(
            serde_json::from_value(serde_json::json!({"model-m-1": "read"})).unwrap(),
        ),
        ..RpcMessage::default()
    };
    send(&mut backend, &denial).await;

    // The captured login is replayed with a fresh id and a widened token.
    let replayed = recv(&mut backend).await;
    assert!(replayed.is_login());
    assert_eq!(replayed.request_id, 3);

    let claims = jimm::jwt::verify(
        &token_of(&replayed),
        &env.published().await,
        OffsetDateTime::now_utc(),
    )
    .expect("re-minted token verifies");
    assert_eq!(claims.access.get(&model_tag), Some("read"));

    send(
        &mut backend,
        &RpcMessage {
            request_id: 3,
            response: Some(serde_json::json!({})),
            ..RpcMessage::default()
        },
    )
    .await;

    // The original request is retried exactly once, then answered.
    let retried = recv(&mut backend).await;
    assert_eq!(retried.request_id, 2);
    assert_eq!(retried.request, "ModelInfo");

    send(
        &mut backend,
        &RpcMessage {
            request_id: 2,
            response: Some(serde_json::json!({"name": "m-1"})),
            ..RpcMessage::default()
        },
    )
    .await;

    let reply = recv(&mut client).await;
    assert_eq!(reply.request_id, 2);
    assert_eq!(reply.response.expect("data")["name"], "m-1");

    // Exactly one reply for request 2: nothing else is in flight.
    assert_silent(&mut client).await;
}

#[tokio::test]
async fn upgrade_denied_forwards_the_error_unchanged() {
    let env = TestEnv::new().await;
    // No grant on model-m-1 for alice.

    let (mut client, mut backend) = env.spawn_session(None, Duration::from_secs(300));

    send(&mut client, &env.login_message(1, "alice")).await;
    accept_login(&env, &mut backend).await;
    let _ = recv(&mut client).await;

    send(
        &mut client,
        &RpcMessage {
            request_id: 2,
            type_: "ModelManager".to_owned(),
            request: "ModelInfo".to_owned(),
            params: Some(serde_json::json!({"uuid": "m-1"})),
            ..RpcMessage::default()
        },
    )
    .await;

    let _ = recv(&mut backend).await;

    let denial = RpcMessage {
        request_id: 2,
        error: "access required".to_owned(),
        error_code: "access required".to_owned(),
        error_info: Some(serde_json::from_value(serde_json::json!({"model-m-1": "read"})).unwrap()),
        ..RpcMessage::default()
    };
    send(&mut backend, &denial).await;

    // The client sees the backend error verbatim and no replay happens.
    let reply = recv(&mut client).await;
    assert_eq!(reply, denial);
    assert_silent(&mut backend).await;
}

#[tokio::test]
async fn second_demand_surfaces_the_original_error() {
    let env = TestEnv::new().await;
    let model_tag = Tag::new(Kind::Model, "m-1");
    env.grant(Tag::user("alice@canonical.com"), Relation::Reader, model_tag)
        .await;

    let (mut client, mut backend) = env.spawn_session(None, Duration::from_secs(300));

    send(&mut client, &env.login_message(1, "alice")).await;
    accept_login(&env, &mut backend).await;
    let _ = recv(&mut client).await;

    send(
        &mut client,
        &RpcMessage {
            request_id: 2,
            type_: "ModelManager".to_owned(),
            request: "ModelInfo".to_owned(),
            ..RpcMessage::default()
        },
    )
    .await;
    let _ = recv(&mut backend).await;

    let first_denial = RpcMessage {
        request_id: 2,
        error: "access required".to_owned(),
        error_code: "access required".to_owned(),
        error_info: Some(serde_json::from_value(serde_json::json!({"model-m-1": "read"})).unwrap()),
        ..RpcMessage::default()
    };
    send(&mut backend, &first_denial).await;

    let replayed = recv(&mut backend).await;
    send(
        &mut backend,
        &RpcMessage {
            request_id: replayed.request_id,
            response: Some(serde_json::json!({})),
            ..RpcMessage::default()
        },
    )
    .await;

    let retried = recv(&mut backend).await;
    assert_eq!(retried.request_id, 2);

    // The retry hits another wall: no second replay, the first error surfaces.
    let second_denial = RpcMessage {
        request_id: 2,
        error: "access required".to_owned(),
        error_code: "access required".to_owned(),
        error_info: Some(serde_json::from_value(serde_json::json!({"model-m-1": "write"})).unwrap()),
        ..RpcMessage::default()
    };
    send(&mut backend, &second_denial).await;

    let reply = recv(&mut client).await;
    assert_eq!(reply, first_denial);
    assert_silent(&mut backend).await;
}

#[tokio::test]
async fn malformed_rpc_closes_with_1002() {
    let env = TestEnv::new().await;
    let (mut client, _backend) = env.spawn_session(None, Duration::from_secs(300));

    send(
        &mut client,
        &RpcMessage {
            request_id: 0,
            type_: "x".to_owned(),
            request: "y".to_owned(),
            ..RpcMessage::default()
        },
    )
    .await;

    match recv_frame(&mut client).await {
        Frame::Close { code, reason } => {
            assert_eq!(code, Some(1002));
            assert_eq!(reason, "received invalid RPC message");
        }
        frame => panic!("expected a close frame, got {frame:?}"),
    }
}

#[tokio::test]
async fn unanswered_requests_time_out_and_the_session_continues() {
    let env = TestEnv::new().await;
    let (mut client, mut backend) = env.spawn_session(None, Duration::from_millis(200));

    send(&mut client, &env.login_message(1, "alice")).await;
    accept_login(&env, &mut backend).await;
    let _ = recv(&mut client).await;

    send(
        &mut client,
        &RpcMessage {
            request_id: 2,
            type_: "Client".to_owned(),
            request: "FullStatus".to_owned(),
            ..RpcMessage::default()
        },
    )
    .await;
    let _ = recv(&mut backend).await;

    // The backend never answers request 2.
    let reply = recv(&mut client).await;
    assert_eq!(reply.request_id, 2);
    assert_eq!(reply.error_code, "timeout");

    // The session is still usable afterwards.
    send(
        &mut client,
        &RpcMessage {
            request_id: 3,
            type_: "Client".to_owned(),
            request: "FullStatus".to_owned(),
            ..RpcMessage::default()
        },
    )
    .await;
    let forwarded = recv(&mut backend).await;
    assert_eq!(forwarded.request_id, 3);

    send(
        &mut backend,
        &RpcMessage {
            request_id: 3,
            response: Some(serde_json::json!({"ok": true})),
            ..RpcMessage::default()
        },
    )
    .await;
    assert_eq!(recv(&mut client).await.request_id, 3);

    // A stale reply for the timed-out request is swallowed, not forwarded.
    send(
        &mut backend,
        &RpcMessage {
            request_id: 2,
            response: Some(serde_json::json!({"late": true})),
            ..RpcMessage::default()
        },
    )
    .await;
    assert_silent(&mut client).await;
}

#[tokio::test]
async fn backend_loss_during_replay_surfaces_unavailable_and_closes() {
    let env = TestEnv::new().await;
    let model_tag = Tag::new(Kind::Model, "m-1");
    env.grant(Tag::user("alice@canonical.com"), Relation::Reader, model_tag)
        .await;

    let (mut client, mut backend) = env.spawn_session(None, Duration::from_secs(300));

    send(&mut client, &env.login_message(1, "alice")).await;
    accept_login(&env, &mut backend).await;
    let _ = recv(&mut client).await;

    send(
        &mut client,
        &RpcMessage {
            request_id: 2,
            type_: "ModelManager".to_owned(),
            request: "ModelInfo".to_owned(),
            ..RpcMessage::default()
        },
    )
    .await;
    let _ = recv(&mut backend).await;

    send(
        &mut backend,
        &RpcMessage {
            request_id: 2,
            error: "access required".to_owned(),
            error_code: "access required".to_owned(),
            error_info: Some(serde_json::from_value(serde_json::json!({"model-m-1": "read"})).unwrap()),
            ..RpcMessage::default()
        },
    )
    .await;

    // The replay goes out, then the backend disappears.
    let _ = recv(&mut backend).await;
    drop(backend);

    let reply = recv(&mut client).await;
    assert_eq!(reply.request_id, 2);
    assert_eq!(reply.error_code, "unavailable");

    match recv_frame(&mut client).await {
        Frame::Close { code, .. } => assert_eq!(code, Some(1014)),
        frame => panic!("expected a close frame, got {frame:?}"),
    }
}

#[tokio::test]
async fn concurrent_replies_correlate_by_request_id() {
    let env = TestEnv::new().await;
    let (mut client, mut backend) = env.spawn_session(None, Duration::from_secs(300));

    send(&mut client, &env.login_message(1, "alice")).await;
    accept_login(&env, &mut backend).await;
    let _ = recv(&mut client).await;

    for id in [2u64, 3, 4] {
        send(
            &mut client,
            &RpcMessage {
                request_id: id,
                type_: "Client".to_owned(),
                request: "FullStatus".to_owned(),
                ..RpcMessage::default()
            },
        )
        .await;
        assert_eq!(recv(&mut backend).await.request_id, id);
    }

    // Replies come back out of order and keep their ids.
    for id in [4u64, 2, 3] {
        send(
            &mut backend,
            &RpcMessage {
                request_id: id,
                response: Some(serde_json::json!({"id": id})),
                ..RpcMessage::default()
            },
        )
        .await;
    }

    for expected in [4u64, 2, 3] {
        let reply = recv(&mut client).await;
        assert_eq!(reply.request_id, expected);
        assert_eq!(reply.response.unwrap()["id"], expected);
    }
}

#[tokio::test]
async fn requests_before_login_are_rejected() {
    let env = TestEnv::new().await;
    let (mut client, _backend) = env.spawn_session(None, Duration::from_secs(300));

    send(
        &mut client,
        &RpcMessage {
            request_id: 1,
            type_: "Client".to_owned(),
            request: "FullStatus".to_owned(),
            ..RpcMessage::default()
        },
    )
    .await;

    let reply = recv(&mut client).await;
    assert_eq!(reply.request_id, 1);
    assert_eq!(reply.error_code, "unauthorized");
}

#[tokio::test]
async fn list_models_replies_are_filtered_by_visibility() {
    let env = TestEnv::new().await;
    let visible = Tag::new(Kind::Model, "aaaaaaaa-aaaa-4aaa-8aaa-aaaaaaaaaaaa");
    env.grant(Tag::user("alice@canonical.com"), Relation::Reader, visible.clone())
        .await;

    let (mut client, mut backend) = env.spawn_session(None, Duration::from_secs(300));

    send(&mut client, &env.login_message(1, "alice")).await;
    accept_login(&env, &mut backend).await;
    let _ = recv(&mut client).await;

    send(
        &mut client,
        &RpcMessage {
            request_id: 2,
            type_: "ModelManager".to_owned(),
            request: "ListModels".to_owned(),
            ..RpcMessage::default()
        },
    )
    .await;
    let _ = recv(&mut backend).await;

    send(
        &mut backend,
        &RpcMessage {
            request_id: 2,
            response: Some(serde_json::json!({
                "user-models": [
                    {"model": {"name": "visible", "uuid": visible.id()}},
                    {"model": {"name": "hidden", "uuid": "bbbbbbbb-bbbb-4bbb-8bbb-bbbbbbbbbbbb"}},
                ],
            })),
            ..RpcMessage::default()
        },
    )
    .await;

    let reply = recv(&mut client).await;
    let models = reply.response.unwrap()["user-models"].as_array().unwrap().clone();
    assert_eq!(models.len(), 1);
    assert_eq!(models[0]["model"]["name"], "visible");
}
