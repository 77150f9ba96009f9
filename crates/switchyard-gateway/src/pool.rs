//! Reuse of per-connection allocations across connection churn.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

/// An object that can be returned to an [`ObjectPool`].
pub trait Poolable: Default + Send {
    /// Return the object to its freshly-created state.
    fn reset(&mut self);
}

/// Bounded free list of reusable objects.
pub struct ObjectPool<T: Poolable> {
    free: Mutex<Vec<T>>,
    capacity: usize,
    created: AtomicUsize,
}

impl<T: Poolable> ObjectPool<T> {
    /// A pool keeping at most `capacity` idle objects.
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            created: AtomicUsize::new(0),
        }
    }

    /// Take an idle object or create a new one.
    pub fn get(&self) -> T {
        let reused = self
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        reused.unwrap_or_else(|| {
            self.created.fetch_add(1, Ordering::Relaxed);
            T::default()
        })
    }

    /// Reset `item` and keep it for reuse, unless the pool is full.
    pub fn put(&self, mut item: T) {
        item.reset();
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        if free.len() < self.capacity {
            free.push(item);
        }
    }

    /// Number of idle objects.
    pub fn idle(&self) -> usize {
        self.free.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Number of objects created because the pool was empty.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }
}

/// Largest buffer kept when a connection's buffers return to the pool.
const MAX_RETAINED_BUFFER: usize = 64 * 1024;

/// I/O scratch space of one connection: the reader's packet body buffer and
/// the writer's frame buffer. The gateway takes a set per accepted socket
/// and returns it once both tasks have finished.
#[derive(Default)]
pub struct ConnectionBuffers {
    /// Packet body scratch space.
    pub read: Vec<u8>,
    /// Outgoing frame assembly space.
    pub write: Vec<u8>,
}

fn recycle(buf: &mut Vec<u8>) {
    buf.clear();
    if buf.capacity() > MAX_RETAINED_BUFFER {
        buf.shrink_to(MAX_RETAINED_BUFFER);
    }
}

impl Poolable for ConnectionBuffers {
    fn reset(&mut self) {
        recycle(&mut self.read);
        recycle(&mut self.write);
    }
}
