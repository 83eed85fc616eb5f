use log::error;
use std::future::Future;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// A spawned loop with a cooperative stop signal.
///
/// `stop()` returns only once the task has finished, so nothing the task
/// does can happen after it. Dropping without `stop()` aborts the task.
pub(crate) struct StoppableTask {
    name: &'static str,
    stop: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl StoppableTask {
    pub(crate) fn spawn<F, Fut>(name: &'static str, body: F) -> Self
    where
        F: FnOnce(oneshot::Receiver<()>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let join = tokio::spawn(body(rx));
        Self {
            name,
            stop: Some(tx),
            join: Some(join),
        }
    }

    pub(crate) async fn stop(mut self) {
        if let Some(tx) = self.stop.take() {
            let _ = tx.send(());
        }
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                if e.is_panic() {
                    error!("{} task panicked", self.name);
                }
            }
        }
    }
}

impl Drop for StoppableTask {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            join.abort();
        }
    }
}
