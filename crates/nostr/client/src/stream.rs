//! Receiver streams that own the tasks feeding them.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Sleep;

/// Buffer between producer tasks and the consumer of a [`TaskStream`].
pub(crate) const STREAM_BUFFER: usize = 256;

type DropHook = Box<dyn FnOnce() + Send>;

/// A stream of items produced by background tasks.
///
/// Dropping the stream aborts every task it owns, so a consumer that stops
/// early cancels the whole pipeline. An optional deadline ends the stream
/// regardless of what the producers are doing.
pub struct TaskStream<T> {
    rx: mpsc::Receiver<T>,
    tasks: Vec<JoinHandle<()>>,
    deadline: Option<Pin<Box<Sleep>>>,
    on_drop: Option<DropHook>,
}

impl<T> TaskStream<T> {
    pub(crate) fn new(rx: mpsc::Receiver<T>) -> Self {
        Self {
            rx,
            tasks: Vec::new(),
            deadline: None,
            on_drop: None,
        }
    }

    pub(crate) fn with_task(mut self, task: JoinHandle<()>) -> Self {
        self.tasks.push(task);
        self
    }

    pub(crate) fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.deadline = timeout.map(|timeout| Box::pin(tokio::time::sleep(timeout)));
        self
    }

    pub(crate) fn on_drop(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_drop = Some(Box::new(hook));
        self
    }

    fn shutdown(&mut self) {
        self.rx.close();
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl<T> Stream for TaskStream<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let this = self.get_mut();
        if let Some(deadline) = this.deadline.as_mut()
            && deadline.as_mut().poll(cx).is_ready()
        {
            this.deadline = None;
            this.shutdown();
            return Poll::Ready(None);
        }
        this.rx.poll_recv(cx)
    }
}

impl<T> Drop for TaskStream<T> {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(hook) = self.on_drop.take() {
            hook();
        }
    }
}

impl<T> std::fmt::Debug for TaskStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskStream")
            .field("tasks", &self.tasks.len())
            .field("has_deadline", &self.deadline.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test(start_paused = true)]
    async fn deadline_ends_stream_and_aborts_producers() {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let producer = tokio::spawn(async move {
            let mut n = 0u32;
            loop {
                if tx.send(n).await.is_err() {
                    break;
                }
                n += 1;
                tokio::time::sleep(Duration::from_millis(400)).await;
            }
        });
        let mut stream = TaskStream::new(rx)
            .with_task(producer)
            .with_timeout(Some(Duration::from_secs(1)));

        let mut received = Vec::new();
        while let Some(n) = stream.next().await {
            received.push(n);
        }
        assert_eq!(received, vec![0, 1, 2]);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn drop_runs_hook_and_aborts_tasks() {
        let (_tx, rx) = mpsc::channel::<()>(1);
        let hooked = Arc::new(AtomicBool::new(false));
        let hook_flag = Arc::clone(&hooked);
        let task = tokio::spawn(std::future::pending::<()>());
        let abort = task.abort_handle();

        let stream = TaskStream::new(rx)
            .with_task(task)
            .on_drop(move || hook_flag.store(true, Ordering::SeqCst));
        drop(stream);
        for _ in 0..10 {
            if abort.is_finished() {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert!(hooked.load(Ordering::SeqCst));
        assert!(abort.is_finished());
    }
}
