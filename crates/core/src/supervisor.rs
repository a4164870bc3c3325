// Structured concurrency: cancellation scopes with first-error collection

use anyhow::anyhow;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// A cancellation scope owning a set of concurrently running tasks.
///
/// Killing a scope cancels it and every scope derived from it with
/// [`Supervisor::child`]. The first error reported by a task (or the
/// first explicit kill) is kept and returned by [`Supervisor::wait`].
/// Cancellation is cooperative: tasks observe it through
/// [`Supervisor::cancelled`] and are always allowed to finish.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

struct Inner {
    token: CancellationToken,
    tracker: TaskTracker,
    error: Mutex<Option<anyhow::Error>>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::with_token(CancellationToken::new())
    }

    fn with_token(token: CancellationToken) -> Self {
        Self {
            inner: Arc::new(Inner {
                token,
                tracker: TaskTracker::new(),
                error: Mutex::new(None),
            }),
        }
    }

    /// Nested scope, cancelled whenever this one is
    pub fn child(&self) -> Self {
        Self::with_token(self.inner.token.child_token())
    }

    /// Spawn a task into this scope. An error or panic kills the scope.
    pub fn spawn<F>(&self, name: impl Into<String>, task: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        let supervisor = self.clone();

        self.inner.tracker.spawn(async move {
            match AssertUnwindSafe(task).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::debug!(task = %name, "Task failed: {:#}", err);
                    supervisor.kill(err);
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    tracing::error!(task = %name, "Task panicked: {}", message);
                    supervisor.kill(anyhow!("task {} panicked: {}", name, message));
                }
            }
        });
    }

    /// Record `err` (unless an earlier error exists) and cancel the scope
    pub fn kill(&self, err: anyhow::Error) {
        if let Ok(mut slot) = self.inner.error.lock() {
            if slot.is_none() {
                *slot = Some(err);
            }
        }
        self.inner.token.cancel();
    }

    /// Cancel the scope without recording an error
    pub fn cancel(&self) {
        self.inner.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Resolves once the scope (or any ancestor) is cancelled
    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await
    }

    pub fn token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    /// Number of tasks still running in this scope
    pub fn active_tasks(&self) -> usize {
        self.inner.tracker.len()
    }

    /// Whether both handles refer to the same scope
    pub fn same_scope(&self, other: &Supervisor) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Wait for every spawned task to finish, then hand out the first error.
    ///
    /// The error is returned only once; later calls see `Ok(())`.
    pub async fn wait(&self) -> anyhow::Result<()> {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.tracker.reopen();

        let error = self
            .inner
            .error
            .lock()
            .map(|mut slot| slot.take())
            .unwrap_or(None);

        match error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("cancelled", &self.is_cancelled())
            .field("active_tasks", &self.active_tasks())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
