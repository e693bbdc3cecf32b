//! Hierarchical task lifetimes.
//!
//! A [`Lifetime`] is a cancellation scope plus the set of tasks spawned into
//! it. Nested lifetimes are cancelled with their parent, and every task of a
//! nested lifetime also counts toward each ancestor, so terminating a parent
//! waits for the whole subtree to finish its cleanup.

use std::future::Future;

use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

#[derive(Debug, Clone)]
pub struct Lifetime {
    token: CancellationToken,
    tracker: TaskTracker,
    ancestors: Vec<TaskTracker>,
}

impl Lifetime {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            tracker: TaskTracker::new(),
            ancestors: Vec::new(),
        }
    }

    /// Create a child scope, cancelled whenever `self` is.
    pub fn nested(&self) -> Self {
        let mut ancestors = self.ancestors.clone();
        ancestors.push(self.tracker.clone());
        Self {
            token: self.token.child_token(),
            tracker: TaskTracker::new(),
            ancestors,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_alive(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// Spawn a task owned by this scope.
    ///
    /// The task receives the scope's token and is expected to return promptly
    /// once it fires, after releasing whatever it holds.
    pub fn spawn<F, Fut>(&self, task: F) -> JoinHandle<()>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut future: BoxFuture<'static, ()> =
            Box::pin(self.tracker.track_future(task(self.token.clone())));
        for tracker in &self.ancestors {
            future = Box::pin(tracker.track_future(future));
        }
        tokio::spawn(future)
    }

    /// Request cancellation of this scope and all nested scopes.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Cancel and wait until every task in this scope and its children returned.
    ///
    /// Idempotent.
    pub async fn terminate(&self) {
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Number of tasks of this scope (including nested ones) still running.
    pub fn running(&self) -> usize {
        self.tracker.len()
    }
}

impl Default for Lifetime {
    fn default() -> Self {
        Self::new()
    }
}
