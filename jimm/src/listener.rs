use std::net::SocketAddr;

use anyhow::Context as _;
use async_trait::async_trait;
use jimm_task::{ChildTask, ShutdownSignal, Task};
use tap::prelude::*;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::Instrument as _;

use crate::JimmState;

pub struct GatewayListener {
    addr: SocketAddr,
    listener: TcpListener,
    state: JimmState,
}

impl GatewayListener {
    pub fn init_and_bind(addr: SocketAddr, state: JimmState) -> anyhow::Result<Self> {
        info!(%addr, "Initiating listener…");

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4().context("failed to create IPv4 TCP socket")?
        } else {
            TcpSocket::new_v6().context("failed to create IPv6 TCP socket")?
        };
        socket.bind(addr).context("failed to bind TCP socket")?;

        let listener = socket
            .listen(64)
            .context("failed to listen with the bound TCP socket")?;

        info!(%addr, "Listener started successfully");

        Ok(Self { addr, listener, state })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[instrument("listener", skip(self), fields(port = self.addr.port()))]
    async fn serve(self) -> anyhow::Result<()> {
        let tls = self.state.conf_handle.get_conf().tls.clone();

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let state = self.state.clone();
                    let tls = tls.clone();

                    let fut = async move {
                        let result = match tls {
                            Some(tls) => match tls.acceptor.accept(stream).await {
                                Ok(tls_stream) => handle_http_peer(tls_stream, state, peer_addr).await,
                                Err(error) => Err(anyhow::Error::new(error).context("TLS handshake failed")),
                            },
                            None => handle_http_peer(stream, state, peer_addr).await,
                        };

                        if let Err(error) = result {
                            debug!(error = format!("{error:#}"), "Peer failure");
                        }
                    }
                    .instrument(info_span!("peer", client = %peer_addr));

                    ChildTask::spawn(fut).detach();
                }
                Err(error) => {
                    error!(%error, "Failed to accept connection");
                }
            }
        }
    }
}

#[async_trait]
impl Task for GatewayListener {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "gateway listener";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        tokio::select! {
            result = self.serve() => result,
            () = shutdown_signal.wait() => Ok(()),
        }
    }
}

async fn handle_http_peer<I>(io: I, state: JimmState, peer_addr: SocketAddr) -> anyhow::Result<()>
where
    I: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    use axum::extract::connect_info::ConnectInfo;

    let app = crate::make_http_service(state)
        .layer(axum::Extension(ConnectInfo(peer_addr)))
        .pipe(hyper_util::service::TowerToHyperService::new);

    hyper_util::server::conn::auto::Builder::new(hyper_util::rt::TokioExecutor::new())
        .serve_connection_with_upgrades(hyper_util::rt::TokioIo::new(io), app)
        .await
        .map_err(|error| anyhow::anyhow!("HTTP server: {error}"))
}
