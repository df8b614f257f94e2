//! Tagged message passing between ranks.
//!
//! The scatter, gather, progress and statistics channels all multiplex one
//! group-wide communicator by message tag, with receives that may select a
//! specific source or any source. The in-process implementation runs each
//! rank on its own thread; a message-passing backend (e.g. MPI) slots in
//! behind the same trait and the same byte format.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

/// Message tags of the wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    /// Worker to root: one byte of demand.
    ScatterNeedWork,
    /// Root to worker: bin count followed by that many serialized bins.
    ScatterHasWork,
    /// Worker to root: one serialized fragment.
    GatherFragment,
    /// Worker to root: (splat delta, pass id).
    ProgressDelta,
    /// Any to root, once at shutdown: a statistics snapshot.
    StatsBlob,
}

/// Group communicator handle owned by one rank.
pub trait Comm: Send + Sync {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;

    /// Send a message; buffered, does not rendezvous.
    fn send(&self, dest: usize, tag: Tag, payload: &[u8]) -> Result<()>;

    /// Receive the next message with `tag`, optionally from a specific
    /// source. Blocks; fails with [`Error::Cancelled`] after an abort.
    fn recv(&self, source: Option<usize>, tag: Tag) -> Result<(usize, Vec<u8>)>;

    /// Like [`recv`], but gives up after `timeout` and returns `None` so
    /// the caller can report a stall and keep waiting.
    ///
    /// [`recv`]: Comm::recv
    fn recv_timeout(
        &self,
        source: Option<usize>,
        tag: Tag,
        timeout: Duration,
    ) -> Result<Option<(usize, Vec<u8>)>>;

    /// Broadcast a fatal abort: every blocked or future channel operation
    /// in the group fails with [`Error::Cancelled`].
    fn abort(&self);

    fn is_aborted(&self) -> bool;
}

struct Inbox {
    messages: Mutex<VecDeque<(usize, Tag, Vec<u8>)>>,
    arrived: Condvar,
}

/// Pull the first queued message matching the tag and source filter.
fn take_match(
    messages: &mut VecDeque<(usize, Tag, Vec<u8>)>,
    source: Option<usize>,
    tag: Tag,
) -> Option<(usize, Vec<u8>)> {
    let slot = messages
        .iter()
        .position(|&(src, t, _)| t == tag && source.map_or(true, |s| s == src))?;
    let (src, _, payload) = messages.remove(slot).expect("slot just found");
    Some((src, payload))
}

struct Shared {
    inboxes: Vec<Inbox>,
    aborted: AtomicBool,
}

/// In-process communicator: ranks are threads of one process sharing an
/// inbox table.
pub struct LocalComm {
    shared: Arc<Shared>,
    rank: usize,
}

impl LocalComm {
    /// Create a group of `size` rank handles.
    pub fn group(size: usize) -> Vec<LocalComm> {
        assert!(size > 0);
        let shared = Arc::new(Shared {
            inboxes: (0..size)
                .map(|_| Inbox {
                    messages: Mutex::new(VecDeque::new()),
                    arrived: Condvar::new(),
                })
                .collect(),
            aborted: AtomicBool::new(false),
        });
        (0..size)
            .map(|rank| LocalComm {
                shared: Arc::clone(&shared),
                rank,
            })
            .collect()
    }
}

impl Comm for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.inboxes.len()
    }

    fn send(&self, dest: usize, tag: Tag, payload: &[u8]) -> Result<()> {
        if self.is_aborted() {
            return Err(Error::Cancelled);
        }
        let inbox = &self.shared.inboxes[dest];
        inbox
            .messages
            .lock()
            .push_back((self.rank, tag, payload.to_vec()));
        inbox.arrived.notify_all();
        Ok(())
    }

    fn recv(&self, source: Option<usize>, tag: Tag) -> Result<(usize, Vec<u8>)> {
        let inbox = &self.shared.inboxes[self.rank];
        let mut messages = inbox.messages.lock();
        loop {
            if self.is_aborted() {
                return Err(Error::Cancelled);
            }
            if let Some(message) = take_match(&mut messages, source, tag) {
                return Ok(message);
            }
            inbox.arrived.wait(&mut messages);
        }
    }

    fn recv_timeout(
        &self,
        source: Option<usize>,
        tag: Tag,
        timeout: Duration,
    ) -> Result<Option<(usize, Vec<u8>)>> {
        let deadline = Instant::now() + timeout;
        let inbox = &self.shared.inboxes[self.rank];
        let mut messages = inbox.messages.lock();
        loop {
            if self.is_aborted() {
                return Err(Error::Cancelled);
            }
            if let Some(message) = take_match(&mut messages, source, tag) {
                return Ok(Some(message));
            }
            if inbox.arrived.wait_until(&mut messages, deadline).timed_out() {
                return Ok(None);
            }
        }
    }

    fn abort(&self) {
        self.shared.aborted.store(true, Ordering::SeqCst);
        for inbox in &self.shared.inboxes {
            // Take the lock so sleeping receivers cannot miss the wakeup.
            let _guard = inbox.messages.lock();
            inbox.arrived.notify_all();
        }
    }

    fn is_aborted(&self) -> bool {
        self.shared.aborted.load(Ordering::SeqCst)
    }
}
