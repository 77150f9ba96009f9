//! Keyed, cancellable delayed tasks.
//!
//! Scheduling a key that is already scheduled replaces the pending task.
//! A task removes its own entry once it has run.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::AbortHandle;

struct Entry {
    generation: u64,
    handle: AbortHandle,
}

pub struct Scheduler<K> {
    tasks: Arc<Mutex<HashMap<K, Entry>>>,
    next_generation: AtomicU64,
}

impl<K> Default for Scheduler<K> {
    fn default() -> Self {
        Self {
            tasks: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
        }
    }
}

impl<K> Scheduler<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` after `delay` unless cancelled first.
    pub fn schedule<F>(&self, key: K, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let tasks = Arc::clone(&self.tasks);
        let own_key = key.clone();

        // Held across the spawn so the task cannot remove its entry before it
        // is inserted.
        let mut guard = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut tasks = tasks.lock().unwrap_or_else(PoisonError::into_inner);
                if tasks.get(&own_key).is_some_and(|e| e.generation == generation) {
                    tasks.remove(&own_key);
                }
            }
            task.await;
        })
        .abort_handle();
        if let Some(previous) = guard.insert(key, Entry { generation, handle }) {
            previous.handle.abort();
        }
    }

    /// Cancel the task scheduled under `key`. Returns whether one was pending.
    pub fn cancel(&self, key: &K) -> bool {
        let entry = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        match entry {
            Some(entry) => {
                entry.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel every pending task.
    pub fn cancel_all(&self) {
        let drained: Vec<Entry> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        for entry in drained {
            entry.handle.abort();
        }
    }

    pub fn is_scheduled(&self, key: &K) -> bool {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    /// Number of pending tasks.
    pub fn len(&self) -> usize {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> std::pin::Pin<Box<dyn Future<Output = ()> + Send>>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let make = move || {
            let c = Arc::clone(&c);
            Box::pin(async move {
                c.fetch_add(1, Ordering::SeqCst);
            }) as std::pin::Pin<Box<dyn Future<Output = ()> + Send>>
        };
        (count, make)
    }

    #[tokio::test]
    async fn test_task_runs_after_delay() {
        let scheduler = Scheduler::new();
        let (count, make) = counter();
        scheduler.schedule("a", Duration::from_millis(20), make());
        assert!(scheduler.is_scheduled(&"a"));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_scheduled(&"a"));
    }

    #[tokio::test]
    async fn test_cancel_prevents_run() {
        let scheduler = Scheduler::new();
        let (count, make) = counter();
        scheduler.schedule("a", Duration::from_millis(30), make());
        assert!(scheduler.cancel(&"a"));
        assert!(!scheduler.cancel(&"a"));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_reschedule_replaces_pending() {
        let scheduler = Scheduler::new();
        let (count, make) = counter();
        scheduler.schedule("a", Duration::from_millis(30), make());
        scheduler.schedule("a", Duration::from_millis(30), make());
        assert_eq!(scheduler.len(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_all() {
        let scheduler = Scheduler::new();
        let (count, make) = counter();
        scheduler.schedule(1, Duration::from_millis(30), make());
        scheduler.schedule(2, Duration::from_millis(30), make());
        scheduler.cancel_all();
        assert!(scheduler.is_empty());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
