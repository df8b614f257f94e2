//! Progress aggregation across ranks.
//!
//! Workers batch per-bin splat counts into `(delta, pass)` updates on the
//! progress channel; the root aggregates them into decile log checkpoints.
//! An optional stall interval makes the aggregator warn when no update has
//! arrived for the configured time; it never forces termination.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::comm::{Comm, Tag};
use crate::error::Result;
use crate::serialize::Reader;

/// Pass marker on the progress channel signalling a worker's sync.
const PROGRESS_DONE: u32 = u32::MAX;

/// Worker-side progress reporting, batched so the channel stays quiet.
pub struct ProgressSender {
    comm: Arc<dyn Comm>,
    root: usize,
    pass: u32,
    pending: u64,
    batch: u64,
}

impl ProgressSender {
    pub fn new(comm: Arc<dyn Comm>, root: usize, pass: u32, total: u64) -> Self {
        ProgressSender {
            comm,
            root,
            pass,
            pending: 0,
            // Flush roughly every half percent of the run.
            batch: (total / 200).max(1),
        }
    }

    pub fn add(&mut self, delta: u64) -> Result<()> {
        self.pending += delta;
        if self.pending >= self.batch {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.pending == 0 {
            return Ok(());
        }
        let mut payload = Vec::with_capacity(12);
        payload.extend_from_slice(&self.pending.to_le_bytes());
        payload.extend_from_slice(&self.pass.to_le_bytes());
        self.pending = 0;
        self.comm.send(self.root, Tag::ProgressDelta, &payload)
    }

    /// Flush the remainder and mark this worker finished for the pass.
    pub fn sync(mut self) -> Result<()> {
        self.flush()?;
        let mut payload = Vec::with_capacity(12);
        payload.extend_from_slice(&0u64.to_le_bytes());
        payload.extend_from_slice(&PROGRESS_DONE.to_le_bytes());
        self.comm.send(self.root, Tag::ProgressDelta, &payload)
    }
}

/// Root-side progress aggregation for one pass: logs decile checkpoints
/// and returns once every worker has synced.
///
/// With `stall_warning` set, a warning is logged whenever that much time
/// passes without any update; the run is never terminated for stalling.
pub fn aggregate_progress(
    comm: &dyn Comm,
    num_workers: usize,
    total_splats: u64,
    pass: u32,
    stall_warning: Option<Duration>,
) -> Result<()> {
    let mut done = 0;
    let mut processed = 0u64;
    let mut next_decile = 1u64;
    let mut last_update = Instant::now();
    while done < num_workers {
        let message = match stall_warning {
            Some(interval) => {
                let Some(message) = comm.recv_timeout(None, Tag::ProgressDelta, interval)? else {
                    log::warn!(
                        "pass {}: no progress for {:.0?} ({} / {} splats)",
                        pass + 1,
                        last_update.elapsed(),
                        processed,
                        total_splats
                    );
                    continue;
                };
                message
            }
            None => comm.recv(None, Tag::ProgressDelta)?,
        };
        last_update = Instant::now();

        let (_, payload) = message;
        let mut r = Reader::new(&payload);
        let delta = r.u64()?;
        let p = r.u32()?;
        if p == PROGRESS_DONE {
            done += 1;
            continue;
        }
        processed += delta;
        while total_splats > 0 && processed * 10 >= total_splats * next_decile {
            log::info!(
                "pass {}: {}% ({} / {} splats)",
                pass + 1,
                next_decile * 10,
                processed,
                total_splats
            );
            next_decile += 1;
        }
    }
    Ok(())
}
