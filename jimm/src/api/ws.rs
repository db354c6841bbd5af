//! Client-facing WebSocket endpoints: `/api` routes to the default
//! controller, `/model/<uuid>/...` to the controller hosting the model.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Path, State};
use axum::response::Response;
use tokio::sync::Notify;
use tracing::Instrument as _;
use uuid::Uuid;

use crate::JimmState;
use crate::dialer::ControllerDialer;
use crate::error::Error;
use crate::http::HttpError;
use crate::proxy::transport::{MessageStream, from_client_ws};
use crate::proxy::{BackendConnector, ProxySession, Route, SessionConfig};
use crate::session::SessionInfo;
use crate::tag::Tag;

pub(crate) async fn api_handler(
    State(state): State<JimmState>,
    ConnectInfo(client_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Result<Response, HttpError> {
    let controller = state
        .dialer
        .registry()
        .default_controller()
        .ok_or_else(|| HttpError::not_found("no controller registered"))?;

    let route = Route {
        controller: controller.tag.clone(),
        model: None,
    };

    Ok(ws.on_upgrade(move |socket| {
        handle_session(state, route, "/api".to_owned(), client_addr, socket)
            .instrument(info_span!("session", client = %client_addr))
    }))
}

pub(crate) async fn model_handler(
    State(state): State<JimmState>,
    ConnectInfo(client_addr): ConnectInfo<SocketAddr>,
    Path((uuid, rest)): Path<(String, String)>,
    ws: WebSocketUpgrade,
) -> Result<Response, HttpError> {
    // 8-4-4-4-12 hex only; the relaxed forms uuid parsing accepts elsewhere
    // are not valid in the URL space.
    let model = match Uuid::try_parse(&uuid) {
        Ok(model) if uuid.len() == 36 => model,
        _ => return Err(HttpError::bad_request("malformed model uuid")),
    };

    let controller = match state.models.controller_for(model) {
        Some(controller) => controller,
        // Before the watcher has seen the model, a single-backend
        // deployment can still route it unambiguously.
        None => match state.dialer.registry().all().as_slice() {
            [only] => only.tag.clone(),
            _ => return Err(HttpError::not_found("model not found")),
        },
    };

    let route = Route {
        controller,
        model: Some(model),
    };
    let path = format!("/model/{uuid}/{rest}");

    Ok(ws.on_upgrade(move |socket| {
        handle_session(state, route, path, client_addr, socket)
            .instrument(info_span!("session", client = %client_addr, model = %uuid))
    }))
}

async fn handle_session(state: JimmState, route: Route, path: String, client_addr: SocketAddr, socket: WebSocket) {
    let conf = state.conf_handle.get_conf();

    let info = SessionInfo::new(client_addr, route.controller.clone());
    let session_id = info.id;
    let notify_kill = Arc::new(Notify::new());

    if let Err(error) = state.sessions.new_session(info, Arc::clone(&notify_kill)).await {
        error!(error = format!("{error:#}"), "Couldn't register the session");
        return;
    }

    let session = ProxySession::builder()
        .config(SessionConfig {
            jimm_controller_uuid: conf.controller_uuid,
            jimm_tag: conf.controller_tag.clone(),
            public_dns_name: conf.public_dns_name.clone(),
            reply_timeout: conf.backend_reply_timeout,
        })
        .route(route.clone())
        .authorizer(state.authorizer.clone())
        .minter(Arc::clone(&state.minter))
        .authenticator(Arc::clone(&state.authenticator))
        .connector(Arc::new(DialerConnector {
            dialer: Arc::clone(&state.dialer),
            controller: route.controller,
            path,
        }))
        .session_registry(Some((state.sessions.clone(), session_id)))
        .build();

    let client = from_client_ws(socket);

    tokio::select! {
        () = session.run(client, state.shutdown_signal.clone()) => {}
        () = notify_kill.notified() => {
            debug!("Session killed through the registry");
        }
    }

    let _ = state.sessions.remove_session(session_id).await;
}

/// Adapts the controller dialer to one session's routed backend.
struct DialerConnector {
    dialer: Arc<ControllerDialer>,
    controller: Tag,
    path: String,
}

#[async_trait]
impl BackendConnector for DialerConnector {
    async fn connect(&self) -> Result<MessageStream, Error> {
        self.dialer.dial(&self.controller, &self.path).await
    }

    fn release(&self, stream: MessageStream) {
        self.dialer.release(&self.controller, &self.path, stream);
    }

    fn evict(&self) {
        self.dialer.evict(&self.controller);
    }
}
