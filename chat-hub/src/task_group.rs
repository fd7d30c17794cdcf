//! Structured concurrency for a small set of cooperating operations.
//!
//! A [`TaskGroup`] runs every operation against one shared
//! [`CancellationToken`]. The first operation to fail records its error and
//! cancels the token, so siblings blocked in a `select!` on
//! [`CancellationToken::cancelled`] stop early. [`TaskGroup::wait`] joins all
//! of them and hands back that single error; later failures are discarded.
//!
//! Both halves of a connection pump and the interactive client's read/send
//! pair are expressed as two operations on one group.

use std::{
    future::Future,
    sync::{Arc, Mutex, PoisonError},
};

use tokio_util::{sync::CancellationToken, task::TaskTracker};

pub struct TaskGroup<E> {
    token: CancellationToken,
    tracker: TaskTracker,
    first_error: Arc<Mutex<Option<E>>>,
}

impl<E> TaskGroup<E>
where
    E: Send + 'static,
{
    pub fn new() -> Self {
        Self::from_token(CancellationToken::new())
    }

    /// Creates a group whose token is also cancelled when `parent` is.
    pub fn with_parent(parent: &CancellationToken) -> Self {
        Self::from_token(parent.child_token())
    }

    fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            tracker: TaskTracker::new(),
            first_error: Arc::new(Mutex::new(None)),
        }
    }

    /// The token shared by every operation in the group.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Launches `op` on the runtime with a clone of the group token.
    ///
    /// An `Err` from the operation is kept only if no other operation has
    /// failed yet, and cancels the token either way. A panic also cancels
    /// the token so siblings are not left running.
    pub fn spawn<F, Fut>(&self, op: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
    {
        let token = self.token.clone();
        let first_error = Arc::clone(&self.first_error);
        let operation = op(token.clone());

        self.tracker.spawn(async move {
            let on_panic = token.clone().drop_guard();
            let result = operation.await;
            on_panic.disarm();

            if let Err(err) = result {
                record_first(&first_error, err);
                token.cancel();
            }
        });
    }

    /// Waits for every spawned operation, then cancels the token and returns
    /// the first recorded error.
    pub async fn wait(self) -> Result<(), E> {
        self.tracker.close();
        self.tracker.wait().await;
        self.token.cancel();

        let first = self
            .first_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl<E> Default for TaskGroup<E>
where
    E: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

fn record_first<E>(slot: &Mutex<Option<E>>, err: E) {
    let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
    if slot.is_none() {
        *slot = Some(err);
    }
}
