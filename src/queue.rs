//! Bounded work queues and worker thread groups.
//!
//! Every producer/consumer pair in the pipeline talks through a
//! [`WorkQueue`]: a bounded queue whose `push` exerts backpressure and whose
//! `stop`/`cancel` unblock all waiters so failures propagate instead of
//! deadlocking.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

struct QueueState<T> {
    items: VecDeque<T>,
    stopped: bool,
}

/// Bounded multi-producer/multi-consumer queue with cooperative shutdown.
pub struct WorkQueue<T> {
    capacity: usize,
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> WorkQueue<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        WorkQueue {
            capacity,
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                stopped: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Enqueue an item, blocking while the queue is full. Returns `false`
    /// if the queue was stopped, in which case the item is dropped.
    pub fn push(&self, item: T) -> bool {
        let mut state = self.state.lock();
        while state.items.len() >= self.capacity && !state.stopped {
            self.not_full.wait(&mut state);
        }
        if state.stopped {
            return false;
        }
        state.items.push_back(item);
        drop(state);
        self.not_empty.notify_one();
        true
    }

    /// Dequeue an item, blocking while the queue is empty. Returns `None`
    /// once the queue is stopped and drained.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Some(item);
            }
            if state.stopped {
                return None;
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// Signal end-of-stream: consumers drain the remaining items and then
    /// observe `None`; further pushes are refused.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        state.stopped = true;
        drop(state);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Abort: drop all queued items and stop.
    pub fn cancel(&self) {
        let mut state = self.state.lock();
        state.stopped = true;
        state.items.clear();
        drop(state);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }
}

/// A pool of threads draining a [`WorkQueue`].
///
/// The handler's first error is retained and returned from [`stop`]; once a
/// worker fails, the queue is cancelled so producers unblock promptly.
///
/// [`stop`]: WorkerGroup::stop
pub struct WorkerGroup<T: Send + 'static> {
    name: &'static str,
    queue: Arc<WorkQueue<T>>,
    error: Arc<Mutex<Option<Error>>>,
    handles: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> WorkerGroup<T> {
    pub fn new<F>(name: &'static str, threads: usize, capacity: usize, handler: F) -> Self
    where
        F: Fn(T) -> Result<()> + Send + Sync + 'static,
    {
        assert!(threads > 0);
        let queue = Arc::new(WorkQueue::new(capacity));
        let error: Arc<Mutex<Option<Error>>> = Arc::new(Mutex::new(None));
        let handler = Arc::new(handler);

        let mut handles = Vec::with_capacity(threads);
        for i in 0..threads {
            let queue = Arc::clone(&queue);
            let error = Arc::clone(&error);
            let handler = Arc::clone(&handler);
            let handle = std::thread::Builder::new()
                .name(format!("{}-{}", name, i))
                .spawn(move || {
                    while let Some(item) = queue.pop() {
                        if let Err(e) = handler(item) {
                            log::error!("{} worker failed: {}", name, e);
                            let mut slot = error.lock();
                            if slot.is_none() {
                                *slot = Some(e);
                            }
                            queue.cancel();
                            break;
                        }
                    }
                })
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }

        WorkerGroup {
            name,
            queue,
            error,
            handles,
        }
    }

    /// Enqueue an item for the pool.
    pub fn push(&self, item: T) -> bool {
        self.queue.push(item)
    }

    /// Drop queued work and unblock everything without waiting for it.
    pub fn cancel(&self) {
        self.queue.cancel();
    }

    /// Flush remaining work, join the threads and surface the first worker
    /// error, if any.
    pub fn stop(mut self) -> Result<()> {
        self.queue.stop();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                return Err(Error::Internal(format!("{} worker panicked", self.name)));
            }
        }
        match self.error.lock().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl<T: Send + 'static> Drop for WorkerGroup<T> {
    fn drop(&mut self) {
        // Dropped without `stop` (an abort path): discard queued work and
        // reap the threads rather than leaking them.
        if !self.handles.is_empty() {
            self.queue.cancel();
            for handle in self.handles.drain(..) {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn fifo_until_stopped() {
        let q = WorkQueue::new(4);
        assert!(q.push(1));
        assert!(q.push(2));
        q.stop();
        assert!(!q.push(3));
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn cancel_discards_items() {
        let q: WorkQueue<u32> = WorkQueue::new(4);
        q.push(7);
        q.cancel();
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn push_blocks_on_full() {
        let q = Arc::new(WorkQueue::new(1));
        q.push(1u32);
        let q2 = Arc::clone(&q);
        let producer = std::thread::spawn(move || q2.push(2));
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(q.pop(), Some(1));
        assert!(producer.join().unwrap());
        assert_eq!(q.pop(), Some(2));
    }

    #[test]
    fn worker_group_processes_everything() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);
        let group = WorkerGroup::new("test", 3, 8, move |n: usize| {
            seen2.fetch_add(n, Ordering::Relaxed);
            Ok(())
        });
        for i in 0..100 {
            assert!(group.push(i));
        }
        group.stop().unwrap();
        assert_eq!(seen.load(Ordering::Relaxed), 99 * 100 / 2);
    }

    #[test]
    fn worker_group_surfaces_error() {
        let group = WorkerGroup::new("test-err", 1, 4, |n: usize| {
            if n == 3 {
                Err(Error::Internal("boom".into()))
            } else {
                Ok(())
            }
        });
        for i in 0..8 {
            group.push(i);
        }
        assert!(group.stop().is_err());
    }
}
