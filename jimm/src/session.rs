//! Registry of live proxy sessions, one actor for the whole process.

use core::fmt;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use jimm_task::{ShutdownSignal, Task};
use time::OffsetDateTime;
use tokio::sync::{Notify, mpsc, oneshot};
use uuid::Uuid;

use crate::tag::Tag;

#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub client_addr: SocketAddr,
    pub controller: Tag,
    /// Set once the login interception resolved a principal.
    pub principal: Option<Tag>,
    #[serde(with = "time::serde::rfc3339")]
    pub start_timestamp: OffsetDateTime,
}

impl SessionInfo {
    pub fn new(client_addr: SocketAddr, controller: Tag) -> Self {
        Self {
            id: Uuid::new_v4(),
            client_addr,
            controller,
            principal: None,
            start_timestamp: OffsetDateTime::now_utc(),
        }
    }
}

pub type RunningSessions = HashMap<Uuid, SessionInfo>;

#[must_use]
pub enum KillResult {
    Success,
    NotFound,
}

enum SessionRegistryMessage {
    New {
        info: SessionInfo,
        notify_kill: Arc<Notify>,
    },
    SetPrincipal {
        id: Uuid,
        principal: Tag,
    },
    Remove {
        id: Uuid,
    },
    Kill {
        id: Uuid,
        channel: oneshot::Sender<KillResult>,
    },
    GetRunning {
        channel: oneshot::Sender<RunningSessions>,
    },
    GetCount {
        channel: oneshot::Sender<usize>,
    },
}

impl fmt::Debug for SessionRegistryMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionRegistryMessage::New { info, notify_kill: _ } => {
                f.debug_struct("New").field("info", info).finish_non_exhaustive()
            }
            SessionRegistryMessage::SetPrincipal { id, principal } => f
                .debug_struct("SetPrincipal")
                .field("id", id)
                .field("principal", principal)
                .finish(),
            SessionRegistryMessage::Remove { id } => f.debug_struct("Remove").field("id", id).finish(),
            SessionRegistryMessage::Kill { id, channel: _ } => {
                f.debug_struct("Kill").field("id", id).finish_non_exhaustive()
            }
            SessionRegistryMessage::GetRunning { channel: _ } => f.debug_struct("GetRunning").finish_non_exhaustive(),
            SessionRegistryMessage::GetCount { channel: _ } => f.debug_struct("GetCount").finish_non_exhaustive(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SessionRegistryHandle(mpsc::Sender<SessionRegistryMessage>);

impl SessionRegistryHandle {
    pub async fn new_session(&self, info: SessionInfo, notify_kill: Arc<Notify>) -> anyhow::Result<()> {
        self.0
            .send(SessionRegistryMessage::New { info, notify_kill })
            .await
            .ok()
            .context("couldn't send New message")
    }

    pub async fn set_principal(&self, id: Uuid, principal: Tag) -> anyhow::Result<()> {
        self.0
            .send(SessionRegistryMessage::SetPrincipal { id, principal })
            .await
            .ok()
            .context("couldn't send SetPrincipal message")
    }

    pub async fn remove_session(&self, id: Uuid) -> anyhow::Result<()> {
        self.0
            .send(SessionRegistryMessage::Remove { id })
            .await
            .ok()
            .context("couldn't send Remove message")
    }

    pub async fn kill_session(&self, id: Uuid) -> anyhow::Result<KillResult> {
        let (tx, rx) = oneshot::channel();
        self.0
            .send(SessionRegistryMessage::Kill { id, channel: tx })
            .await
            .ok()
            .context("couldn't send Kill message")?;
        rx.await.context("couldn't receive kill result")
    }

    pub async fn get_running_sessions(&self) -> anyhow::Result<RunningSessions> {
        let (tx, rx) = oneshot::channel();
        self.0
            .send(SessionRegistryMessage::GetRunning { channel: tx })
            .await
            .ok()
            .context("couldn't send GetRunning message")?;
        rx.await.context("couldn't receive running session list")
    }

    pub async fn get_session_count(&self) -> anyhow::Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.0
            .send(SessionRegistryMessage::GetCount { channel: tx })
            .await
            .ok()
            .context("couldn't send GetCount message")?;
        rx.await.context("couldn't receive session count")
    }
}

pub struct SessionRegistryReceiver(mpsc::Receiver<SessionRegistryMessage>);

pub fn session_registry_channel() -> (SessionRegistryHandle, SessionRegistryReceiver) {
    let (tx, rx) = mpsc::channel(64);
    (SessionRegistryHandle(tx), SessionRegistryReceiver(rx))
}

pub struct SessionRegistryTask {
    rx: SessionRegistryReceiver,
    running: RunningSessions,
    notify_kill: HashMap<Uuid, Arc<Notify>>,
}

impl SessionRegistryTask {
    pub fn new(rx: SessionRegistryReceiver) -> Self {
        Self {
            rx,
            running: HashMap::new(),
            notify_kill: HashMap::new(),
        }
    }

    fn handle(&mut self, message: SessionRegistryMessage) {
        match message {
            SessionRegistryMessage::New { info, notify_kill } => {
                self.notify_kill.insert(info.id, notify_kill);
                self.running.insert(info.id, info);
            }
            SessionRegistryMessage::SetPrincipal { id, principal } => {
                if let Some(info) = self.running.get_mut(&id) {
                    info.principal = Some(principal);
                }
            }
            SessionRegistryMessage::Remove { id } => {
                self.running.remove(&id);
                self.notify_kill.remove(&id);
            }
            SessionRegistryMessage::Kill { id, channel } => {
                let result = match self.notify_kill.get(&id) {
                    Some(notify_kill) => {
                        notify_kill.notify_waiters();
                        KillResult::Success
                    }
                    None => KillResult::NotFound,
                };
                let _ = channel.send(result);
            }
            SessionRegistryMessage::GetRunning { channel } => {
                let _ = channel.send(self.running.clone());
            }
            SessionRegistryMessage::GetCount { channel } => {
                let _ = channel.send(self.running.len());
            }
        }
    }
}

#[async_trait]
impl Task for SessionRegistryTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "session registry";

    async fn run(mut self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        debug!("Task started");

        loop {
            tokio::select! {
                message = self.rx.0.recv() => {
                    let Some(message) = message else {
                        warn!("All senders are dead");
                        break;
                    };

                    trace!(?message, "Received message");
                    self.handle(message);
                }
                () = shutdown_signal.wait() => {
                    break;
                }
            }
        }

        debug!("Task is stopping; kill all running sessions");

        for notify_kill in self.notify_kill.values() {
            notify_kill.notify_waiters();
        }

        debug!("Task terminated");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_query_and_kill() {
        let (handle, rx) = session_registry_channel();
        let task = SessionRegistryTask::new(rx);
        let _task = jimm_task::spawn_task(task, jimm_task::ShutdownSignal::never());

        let controller = Tag::controller(Uuid::new_v4());
        let info = SessionInfo::new("127.0.0.1:50000".parse().expect("addr"), controller);
        let id = info.id;

        let notify = Arc::new(Notify::new());
        let killed = {
            let notify = Arc::clone(&notify);
            tokio::spawn(async move { notify.notified().await })
        };

        handle.new_session(info, notify).await.expect("register");
        assert_eq!(handle.get_session_count().await.expect("count"), 1);

        handle
            .set_principal(id, Tag::user("alice@canonical.com"))
            .await
            .expect("set principal");
        let running = handle.get_running_sessions().await.expect("list");
        assert_eq!(
            running.get(&id).and_then(|info| info.principal.clone()),
            Some(Tag::user("alice@canonical.com")),
        );

        assert!(matches!(handle.kill_session(id).await.expect("kill"), KillResult::Success));
        killed.await.expect("kill notification delivered");

        handle.remove_session(id).await.expect("remove");
        assert_eq!(handle.get_session_count().await.expect("count"), 0);
        assert!(matches!(
            handle.kill_session(id).await.expect("kill"),
            KillResult::NotFound
        ));
    }
}
