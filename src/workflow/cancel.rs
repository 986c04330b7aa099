//! Cooperative cancellation for runs and in-flight tasks

use std::sync::{Arc, Mutex, Weak};
use tokio::sync::watch;

#[derive(Debug)]
struct Inner {
    sender: watch::Sender<bool>,
    children: Mutex<Vec<Weak<Inner>>>,
}

impl Inner {
    fn cancel(&self) {
        self.sender.send_replace(true);
        let children = std::mem::take(&mut *self.children.lock().unwrap_or_else(|e| e.into_inner()));
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel();
        }
    }
}

/// Cancellation token shared between the caller, the runner and task workers
#[derive(Debug, Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
    receiver: watch::Receiver<bool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                sender,
                children: Mutex::new(Vec::new()),
            }),
            receiver,
        }
    }

    /// A token that fires with this one but can also be cancelled on its own.
    ///
    /// Cancelling the child leaves the parent untouched.
    pub fn child(&self) -> Self {
        let child = Self::new();
        {
            let mut children = self.inner.children.lock().unwrap_or_else(|e| e.into_inner());
            children.retain(|c| c.strong_count() > 0);
            children.push(Arc::downgrade(&child.inner));
        }
        if self.is_cancelled() {
            child.cancel();
        }
        child
    }

    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Wait until cancelled
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        while !*receiver.borrow_and_update() {
            if receiver.changed().await.is_err() {
                // Sender gone without cancelling: never resolves
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Run `future` unless the token fires first
pub async fn with_cancellation<F, T>(token: &CancellationToken, future: F) -> Option<T>
where
    F: std::future::Future<Output = T>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => None,
        result = future => Some(result),
    }
}
