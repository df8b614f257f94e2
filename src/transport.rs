//! Work and result movement between ranks: the demand-driven bin scatter
//! channel, the fragment gather channel, and the one-shot statistics
//! collection at shutdown. Progress aggregation rides its own channel in
//! [`crate::progress`].

use std::sync::Arc;

use crate::bucket::Bin;
use crate::buffer::{Allocation, CircularBuffer};
use crate::comm::{Comm, Tag};
use crate::device::MeshFragment;
use crate::error::{Error, Result};
use crate::queue::WorkerGroup;
use crate::serialize::{
    fragment_bytes, read_bin, read_fragment, write_bin, write_fragment, Reader,
};
use crate::stats::{Registry, Snapshot};

/// Root side of the scatter channel. Never pushes unrequested work: each
/// batch waits for a worker's demand byte, which load-balances across
/// heterogeneous workers.
pub struct Scatter<C: Comm + ?Sized> {
    comm: Arc<C>,
}

impl<C: Comm + ?Sized> Scatter<C> {
    pub fn new(comm: Arc<C>) -> Self {
        Scatter { comm }
    }

    /// Hand a batch of bins to the next idle worker.
    pub fn send_bins(&self, bins: &[Bin]) -> Result<()> {
        if bins.is_empty() {
            return Ok(());
        }
        let (worker, _) = self.comm.recv(None, Tag::ScatterNeedWork)?;
        let mut payload = Vec::new();
        payload.extend_from_slice(&(bins.len() as u64).to_le_bytes());
        for bin in bins {
            write_bin(bin, &mut payload);
        }
        self.comm.send(worker, Tag::ScatterHasWork, &payload)
    }

    /// Shut the workers down: answer each one's next demand with an empty
    /// batch.
    pub fn stop(&self, num_workers: usize) -> Result<()> {
        for _ in 0..num_workers {
            let (worker, _) = self.comm.recv(None, Tag::ScatterNeedWork)?;
            self.comm
                .send(worker, Tag::ScatterHasWork, &0u64.to_le_bytes())?;
        }
        Ok(())
    }
}

/// Worker side of the scatter channel: request one batch, blocking until
/// the root responds. `None` signals shutdown for this pass.
pub fn request_work(comm: &dyn Comm, root: usize) -> Result<Option<Vec<Bin>>> {
    comm.send(root, Tag::ScatterNeedWork, &[1u8])?;
    let (_, payload) = comm.recv(Some(root), Tag::ScatterHasWork)?;
    let mut r = Reader::new(&payload);
    let count = r.u64()?;
    if count == 0 {
        return Ok(None);
    }
    let mut bins = Vec::with_capacity(count as usize);
    for _ in 0..count {
        bins.push(read_bin(&mut r)?);
    }
    if !r.is_empty() {
        return Err(Error::Internal("trailing bytes after scatter batch".into()));
    }
    Ok(Some(bins))
}

enum GatherItem {
    Fragment(Allocation),
    Done,
}

/// Worker side of the gather channel: fragments are serialized into a
/// backpressured ring and marshalled to the root by a dedicated thread, so
/// the device pipeline never stalls on the transport.
pub struct GatherGroup {
    ring: Arc<CircularBuffer>,
    group: WorkerGroup<GatherItem>,
}

impl GatherGroup {
    pub fn new(comm: Arc<dyn Comm>, root: usize, buffer_bytes: usize) -> Self {
        let ring = Arc::new(CircularBuffer::new("gather", buffer_bytes));
        let ring2 = Arc::clone(&ring);
        let group = WorkerGroup::new("gather", 1, 8, move |item: GatherItem| {
            let result = match item {
                GatherItem::Fragment(alloc) => {
                    let result = comm.send(root, Tag::GatherFragment, alloc.as_slice());
                    ring2.free(alloc);
                    result
                }
                GatherItem::Done => comm.send(root, Tag::GatherFragment, &[]),
            };
            if result.is_err() {
                // The marshal thread is about to die; anything blocked on
                // ring space would otherwise wait forever.
                ring2.stop();
            }
            result
        });
        GatherGroup { ring, group }
    }

    /// Serialize and enqueue one fragment. Blocks on the ring while earlier
    /// fragments are still in flight.
    pub fn send(&self, fragment: &MeshFragment) -> Result<()> {
        let size = fragment_bytes(fragment);
        let mut alloc = self.ring.allocate(size, 1)?;
        debug_assert_eq!(alloc.len(), size);
        write_fragment(fragment, alloc.as_mut_slice());
        if !self.group.push(GatherItem::Fragment(alloc)) {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    /// Flush in-flight fragments and send the end-of-worker marker.
    pub fn stop(self) -> Result<()> {
        self.group.push(GatherItem::Done);
        self.group.stop()
    }

    /// Drop queued fragments on abort and unblock ring waiters.
    pub fn cancel(&self) {
        self.group.cancel();
        self.ring.stop();
    }
}

/// Root side of the gather channel: run on a dedicated thread, feeding each
/// received fragment to the sink until every worker has sent its
/// end-of-worker marker.
pub fn receive_fragments<F>(comm: &dyn Comm, num_workers: usize, mut sink: F) -> Result<()>
where
    F: FnMut(MeshFragment) -> Result<()>,
{
    let mut done = 0;
    while done < num_workers {
        let (_, payload) = comm.recv(None, Tag::GatherFragment)?;
        if payload.is_empty() {
            done += 1;
            continue;
        }
        sink(read_fragment(&payload)?)?;
    }
    Ok(())
}

/// Shutdown statistics collection: every non-root rank sends `local`; the
/// root merges all received snapshots into `target`.
///
/// With the in-process communicator all ranks already share one registry,
/// so workers send an empty snapshot; a multi-process backend sends its
/// whole registry here.
pub fn collect_stats(
    comm: &dyn Comm,
    root: usize,
    local: &Snapshot,
    target: &Registry,
) -> Result<()> {
    if comm.rank() == root {
        for _ in 0..comm.size() - 1 {
            let (_, payload) = comm.recv(None, Tag::StatsBlob)?;
            target.merge(&Snapshot::decode(&payload)?);
        }
    } else {
        comm.send(root, Tag::StatsBlob, &local.encode())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::ChunkId;
    use crate::comm::LocalComm;
    use crate::grid::Grid;
    use std::time::Duration;

    fn test_bin(tag: u64) -> Bin {
        Bin {
            ranges: vec![(tag, tag + 10)],
            num_splats: 10,
            grid: Grid::new([0.0; 3], 0.5, [(0, 8); 3]),
            chunk: ChunkId::default(),
        }
    }

    fn test_fragment(n: u32) -> MeshFragment {
        MeshFragment {
            vertices: vec![[n as f32, 0.0, 0.0]; n as usize + 1],
            num_internal: 1,
            external_keys: vec![n as u64; n as usize],
            triangles: vec![[0, 0, 0]],
            chunk: ChunkId::default(),
        }
    }

    #[test]
    fn scatter_round_trip_and_shutdown() {
        let mut group = LocalComm::group(2);
        let worker = Arc::new(group.pop().unwrap());
        let root = Arc::new(group.pop().unwrap());

        let worker_thread = std::thread::spawn(move || {
            let mut seen = Vec::new();
            while let Some(bins) = request_work(worker.as_ref(), 0).unwrap() {
                seen.extend(bins);
            }
            seen
        });

        let scatter = Scatter::new(root);
        scatter.send_bins(&[test_bin(0), test_bin(100)]).unwrap();
        scatter.send_bins(&[test_bin(200)]).unwrap();
        scatter.stop(1).unwrap();

        let seen = worker_thread.join().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[2], test_bin(200));
    }

    #[test]
    fn demand_driven_scatter_is_fair() {
        // Two workers, one 10x slower: the fast one must take the lion's
        // share and the slow one must never block the fast one.
        let mut group = LocalComm::group(3);
        let w2 = Arc::new(group.pop().unwrap());
        let w1 = Arc::new(group.pop().unwrap());
        let root = Arc::new(group.pop().unwrap());

        let spawn_worker = |comm: Arc<LocalComm>, delay: Duration| {
            std::thread::spawn(move || {
                let mut count = 0usize;
                while request_work(comm.as_ref(), 0).unwrap().is_some() {
                    std::thread::sleep(delay);
                    count += 1;
                }
                count
            })
        };
        let fast = spawn_worker(w1, Duration::from_millis(1));
        let slow = spawn_worker(w2, Duration::from_millis(10));

        let scatter = Scatter::new(root);
        for i in 0..40 {
            scatter.send_bins(&[test_bin(i)]).unwrap();
        }
        scatter.stop(2).unwrap();

        let fast_count = fast.join().unwrap();
        let slow_count = slow.join().unwrap();
        assert_eq!(fast_count + slow_count, 40);
        assert!(
            fast_count > slow_count * 2,
            "fast worker got {} of 40, slow {}",
            fast_count,
            slow_count
        );
    }

    #[test]
    fn gather_delivers_fragments_then_markers() {
        let mut group = LocalComm::group(2);
        let worker: Arc<dyn Comm> = Arc::new(group.pop().unwrap());
        let root = group.pop().unwrap();

        let sender = std::thread::spawn(move || {
            let gather = GatherGroup::new(worker, 0, 1 << 16);
            for i in 0..20 {
                gather.send(&test_fragment(i)).unwrap();
            }
            gather.stop().unwrap();
        });

        let mut got = Vec::new();
        receive_fragments(&root, 1, |frag| {
            got.push(frag);
            Ok(())
        })
        .unwrap();
        sender.join().unwrap();

        assert_eq!(got.len(), 20);
        for (i, frag) in got.iter().enumerate() {
            assert_eq!(*frag, test_fragment(i as u32));
        }
    }

    #[test]
    fn stats_blob_merges_on_root() {
        let mut group = LocalComm::group(2);
        let worker = group.pop().unwrap();
        let root = group.pop().unwrap();

        let worker_reg = Registry::default();
        worker_reg.counter("bins").add(7);
        let snap = worker_reg.snapshot();
        let t = std::thread::spawn(move || collect_stats(&worker, 0, &snap, &Registry::default()));

        let target = Registry::default();
        target.counter("bins").add(1);
        collect_stats(&root, 0, &Snapshot::default(), &target).unwrap();
        t.join().unwrap().unwrap();
        assert_eq!(target.counter("bins").total(), 8);
    }
}
