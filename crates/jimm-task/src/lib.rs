//! Cooperative supervision for the service's long-lived tasks: a stop order
//! broadcast over a watch channel, and child handles that cannot outlive
//! their owner by accident.

use std::future::Future;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};

/// A long-lived unit of work that stops when told to.
///
/// `NAME` identifies the task in supervision logs.
#[async_trait]
pub trait Task {
    type Output: Send;

    const NAME: &'static str;

    async fn run(self, shutdown_signal: ShutdownSignal) -> Self::Output;
}

/// Spawns `task` onto the runtime, wired to the given stop signal.
pub fn spawn_task<T>(task: T, shutdown_signal: ShutdownSignal) -> ChildTask<T::Output>
where
    T: Task + 'static,
{
    ChildTask::spawn(task.run(shutdown_signal))
}

/// Broadcasts the stop order to every [`ShutdownSignal`].
#[derive(Debug)]
pub struct ShutdownHandle {
    stopping: watch::Sender<bool>,
}

impl ShutdownHandle {
    pub fn new() -> (Self, ShutdownSignal) {
        let (stopping, listener) = watch::channel(false);
        (Self { stopping }, ShutdownSignal { listener })
    }

    /// Orders every listening task to stop.
    pub fn signal(&self) {
        self.stopping.send_replace(true);
    }

    /// Completes once no task holds a signal anymore.
    pub async fn all_closed(&self) {
        self.stopping.closed().await;
    }
}

/// One task's view of the stop order.
#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    listener: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// A signal that never fires, for detached helpers and tests.
    pub fn never() -> Self {
        let (stopping, listener) = watch::channel(false);
        // The sender is kept alive forever, so the order never comes.
        std::mem::forget(stopping);
        Self { listener }
    }

    /// Waits for the stop order. Completes immediately when the order was
    /// already given, or when the [`ShutdownHandle`] is gone entirely.
    pub async fn wait(&mut self) {
        let _ = self.listener.wait_for(|stopping| *stopping).await;
    }
}

/// Handle on a spawned task, aborted when the handle is dropped so an owner
/// going away never leaks its children.
#[must_use]
pub struct ChildTask<T> {
    handle: Option<JoinHandle<T>>,
}

impl<T: Send + 'static> ChildTask<T> {
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        Self {
            handle: Some(tokio::spawn(future)),
        }
    }

    pub async fn join(mut self) -> Result<T, JoinError> {
        let handle = self.handle.take().expect("present until join or detach");
        handle.await
    }

    pub fn abort(&self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }

    /// Severs the abort-on-drop tie; the task keeps running on its own.
    pub fn detach(mut self) {
        drop(self.handle.take());
    }
}

impl<T> From<JoinHandle<T>> for ChildTask<T> {
    fn from(handle: JoinHandle<T>) -> Self {
        Self { handle: Some(handle) }
    }
}

impl<T> Drop for ChildTask<T> {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Waiter;

    #[async_trait]
    impl Task for Waiter {
        type Output = &'static str;

        const NAME: &'static str = "waiter";

        async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
            shutdown_signal.wait().await;
            "stopped"
        }
    }

    #[tokio::test]
    async fn tasks_observe_the_stop_order() {
        let (handle, signal) = ShutdownHandle::new();
        let child = spawn_task(Waiter, signal);

        handle.signal();

        assert_eq!(child.join().await.expect("join"), "stopped");
    }

    #[tokio::test]
    async fn late_subscribers_see_an_already_given_order() {
        let (handle, mut signal) = ShutdownHandle::new();
        handle.signal();

        // Must not hang: the order predates the wait.
        signal.wait().await;
    }

    #[tokio::test]
    async fn dropping_the_child_aborts_the_task() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let child = ChildTask::spawn(async move {
            let _tx = tx;
            std::future::pending::<()>().await;
        });
        drop(child);

        // The sender only drops when the task is torn down.
        assert!(rx.await.is_err());
    }
}
