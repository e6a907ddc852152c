use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;

/// Counted group of background tasks.
///
/// Completion is counted when a task's future finishes, panics, or is
/// dropped by the runtime.
#[derive(Debug, Default)]
pub struct TaskGroup {
    started: AtomicUsize,
    completed: AtomicUsize,
    notify: Notify,
}

struct Completion(Arc<TaskGroup>);

impl Drop for Completion {
    fn drop(&mut self) {
        self.0.completed.fetch_add(1, Ordering::AcqRel);
        self.0.notify.notify_waiters();
    }
}

impl TaskGroup {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn spawn<F>(self: &Arc<Self>, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.started.fetch_add(1, Ordering::AcqRel);
        let completion = Completion(Arc::clone(self));
        tokio::spawn(async move {
            let _completion = completion;
            task.await;
        });
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::Acquire)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::Acquire)
    }

    pub fn outstanding(&self) -> usize {
        self.started().saturating_sub(self.completed())
    }

    /// Wait until every task started so far has completed.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.notify.notified();
            if self.outstanding() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Wait for outstanding tasks up to `deadline`. Returns `false` if tasks
    /// were still running when the deadline passed; those are abandoned.
    pub async fn shutdown(&self, deadline: Duration) -> bool {
        tokio::time::timeout(deadline, self.wait_idle()).await.is_ok()
    }
}

/// Delta keys being handled by this process.
#[derive(Debug, Clone, Default)]
pub struct ActiveRequests {
    keys: Arc<Mutex<HashSet<String>>>,
}

/// Membership of a key in [`ActiveRequests`], released on drop.
#[derive(Debug)]
pub struct Claim {
    keys: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl ActiveRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key`, or `None` if it is already claimed.
    pub fn claim(&self, key: impl Into<String>) -> Option<Claim> {
        let key = key.into();
        let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        if !keys.insert(key.clone()) {
            return None;
        }
        Some(Claim {
            keys: Arc::clone(&self.keys),
            key,
        })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner).contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner).remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[test]
    fn test_claim_is_exclusive_until_dropped() {
        let active = ActiveRequests::new();
        let claim = active.claim("key").unwrap();
        assert!(active.claim("key").is_none());
        assert!(active.claim("other").is_some());
        assert!(active.contains("key"));

        drop(claim);
        assert!(!active.contains("key"));
        assert!(active.claim("key").is_some());
    }

    #[test]
    fn test_instances_do_not_share_keys() {
        let a = ActiveRequests::new();
        let b = ActiveRequests::new();
        let _claim = a.claim("key").unwrap();
        assert!(b.claim("key").is_some());
    }

    #[tokio::test]
    async fn test_wait_idle() {
        let group = TaskGroup::new();
        group.wait_idle().await;

        let (tx, rx) = oneshot::channel::<()>();
        group.spawn(async move {
            let _ = rx.await;
        });
        assert_eq!(group.outstanding(), 1);
        assert!(!group.shutdown(Duration::from_millis(20)).await);

        tx.send(()).unwrap();
        assert!(group.shutdown(Duration::from_secs(5)).await);
        assert_eq!(group.started(), 1);
        assert_eq!(group.completed(), 1);
    }

    #[tokio::test]
    async fn test_panicking_task_completes() {
        let group = TaskGroup::new();
        group.spawn(async {
            panic!("boom");
        });
        assert!(group.shutdown(Duration::from_secs(5)).await);
        assert_eq!(group.outstanding(), 0);
    }
}
