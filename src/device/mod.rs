//! Device abstraction and the per-bin processing pipeline.
//!
//! The accelerator is reached through a thin façade: a context with
//! validated limits, an in-order asynchronous command queue owned by a
//! dispatch thread, and waitable events. Kernel bodies are data-parallel
//! functions executed by the queue thread; the pipeline never calls them
//! directly, so a backend driving a real compute API slots in behind the
//! same façade.

mod marching;
mod mesh_filter;
mod mls;
mod octree;
mod pipeline;

pub use marching::{tables, MarchingTables, RawMesh};
pub use mesh_filter::MeshFragment;
pub use mls::{FieldProgram, MlsProgram};
pub use octree::SplatOctree;
pub use pipeline::DevicePipeline;

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};
use crate::queue::WorkQueue;

/// Device properties the pipeline sizes itself against.
#[derive(Debug, Clone, Copy)]
pub struct DeviceContext {
    /// Maximum slab image width in grid corners.
    pub max_slab_width: u64,
    /// Maximum slab image height in grid corners.
    pub max_slab_height: u64,
    /// Splat capacity of the device working set.
    pub max_splats: u64,
}

impl DeviceContext {
    /// The host executor: slab limits mirror a typical accelerator image
    /// size so bin footprints stay device-shaped.
    pub fn host() -> Self {
        DeviceContext {
            max_slab_width: 8192,
            max_slab_height: 8192,
            max_splats: 16 << 20,
        }
    }

    /// Check that a bin with `max_cells` cells can fit the slab images.
    pub fn validate(&self, max_cells: u64, max_device_splats: u64) -> Result<()> {
        // A degenerate worst case is a single-cell-thick slab using all
        // cells in one plane.
        if max_cells > self.max_slab_width * self.max_slab_height {
            return Err(Error::InvalidDevice(format!(
                "max-cells {} exceeds the device slab of {}x{} corners",
                max_cells, self.max_slab_width, self.max_slab_height
            )));
        }
        if max_device_splats > self.max_splats {
            return Err(Error::InvalidDevice(format!(
                "max-device-splats {} exceeds the device capacity {}",
                max_device_splats, self.max_splats
            )));
        }
        Ok(())
    }
}

/// Command outcome as stored on events; the error is pre-rendered so it can
/// be shared by every event that observes a poisoned queue.
type CmdResult = std::result::Result<(), String>;

#[derive(Default)]
struct EventState {
    done: Mutex<Option<CmdResult>>,
    cond: Condvar,
}

/// Completion token for one enqueued command.
#[derive(Clone, Default)]
pub struct Event {
    state: Arc<EventState>,
}

impl Event {
    fn complete(&self, result: CmdResult) {
        let mut done = self.state.done.lock();
        *done = Some(result);
        drop(done);
        self.state.cond.notify_all();
    }

    /// Block until the command has executed; surfaces its failure.
    pub fn wait(&self) -> Result<()> {
        let mut done = self.state.done.lock();
        while done.is_none() {
            self.state.cond.wait(&mut done);
        }
        match done.as_ref().expect("checked above") {
            Ok(()) => Ok(()),
            Err(msg) => Err(Error::Device(msg.clone())),
        }
    }
}

type Command = Box<dyn FnOnce() -> Result<()> + Send>;

/// In-order asynchronous command queue owned by one dispatch thread.
///
/// Once a command fails, the queue is poisoned: queued and future commands
/// are dropped, their events complete with the original error, and
/// [`finish`] reports it.
///
/// [`finish`]: DeviceQueue::finish
pub struct DeviceQueue {
    queue: Arc<WorkQueue<(Command, Event)>>,
    poisoned: Arc<Mutex<Option<String>>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl DeviceQueue {
    pub fn new(name: &str) -> Self {
        let queue: Arc<WorkQueue<(Command, Event)>> = Arc::new(WorkQueue::new(4));
        let poisoned: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

        let queue2 = Arc::clone(&queue);
        let poisoned2 = Arc::clone(&poisoned);
        let thread = std::thread::Builder::new()
            .name(format!("device-{}", name))
            .spawn(move || {
                while let Some((command, event)) = queue2.pop() {
                    let failure = poisoned2.lock().clone();
                    if let Some(msg) = failure {
                        event.complete(Err(msg));
                        continue;
                    }
                    match command() {
                        Ok(()) => event.complete(Ok(())),
                        Err(e) => {
                            let msg = e.to_string();
                            *poisoned2.lock() = Some(msg.clone());
                            event.complete(Err(msg));
                        }
                    }
                }
            })
            .expect("failed to spawn device queue thread");

        DeviceQueue {
            queue,
            poisoned,
            thread: Some(thread),
        }
    }

    /// Submit a command; commands run in submission order.
    pub fn enqueue<F>(&self, command: F) -> Event
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let event = Event::default();
        if !self.queue.push((Box::new(command), event.clone())) {
            event.complete(Err("device queue stopped".to_owned()));
        }
        event
    }

    /// Drain the queue and surface any recorded failure.
    pub fn finish(&self) -> Result<()> {
        self.enqueue(|| Ok(())).wait()?;
        match self.poisoned.lock().as_ref() {
            Some(msg) => Err(Error::Device(msg.clone())),
            None => Ok(()),
        }
    }
}

impl Drop for DeviceQueue {
    fn drop(&mut self) {
        self.queue.stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn commands_run_in_order() {
        let queue = DeviceQueue::new("test");
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..16 {
            let log = Arc::clone(&log);
            queue.enqueue(move || {
                log.lock().push(i);
                Ok(())
            });
        }
        queue.finish().unwrap();
        assert_eq!(*log.lock(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn failure_poisons_the_queue() {
        let queue = DeviceQueue::new("test-poison");
        let ran = Arc::new(AtomicUsize::new(0));
        queue.enqueue(|| Err(Error::Device("kernel launch failed".into())));
        let ran2 = Arc::clone(&ran);
        let after = queue.enqueue(move || {
            ran2.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });
        assert!(after.wait().is_err());
        assert!(queue.finish().is_err());
        assert_eq!(ran.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn event_wait_after_completion() {
        let queue = DeviceQueue::new("test-event");
        let event = queue.enqueue(|| Ok(()));
        queue.finish().unwrap();
        event.wait().unwrap();
        event.wait().unwrap(); // idempotent
    }

    #[test]
    fn context_validation() {
        let ctx = DeviceContext::host();
        assert!(ctx.validate(1 << 20, 1 << 20).is_ok());
        assert!(ctx
            .validate(ctx.max_slab_width * ctx.max_slab_height + 1, 1)
            .is_err());
        assert!(ctx.validate(64, u64::MAX).is_err());
    }
}
