//! Per-bin device pipeline: upload, octree build, slab scan with marching
//! tetrahedra, mesh filtering, and hand-off to the gather channel.

use std::sync::Arc;

use crate::bucket::Bin;
use crate::error::Result;
use crate::splat::Splat;
use crate::stats;
use crate::transport::GatherGroup;

use super::marching;
use super::mesh_filter;
use super::mls::FieldProgram;
use super::{DeviceQueue, Event, SplatOctree};

/// One accelerator's processing pipeline. Bins are enqueued as command
/// chains on the device queue; the caller overlaps loading the next batch
/// with the device working on the current one.
pub struct DevicePipeline {
    queue: DeviceQueue,
    field: Arc<dyn FieldProgram>,
}

impl DevicePipeline {
    pub fn new(name: &str, field: Arc<dyn FieldProgram>) -> Self {
        // Table construction is part of program initialization, not of the
        // first bin's latency.
        marching::tables();
        DevicePipeline {
            queue: DeviceQueue::new(name),
            field,
        }
    }

    /// Submit one bin. `bin_splats` is the bin's splat working set, already
    /// gathered from the batch buffer (the upload copy). The fragment, if
    /// any triangles survive, is pushed onto the gather channel.
    ///
    /// The returned event completes when the fragment has been handed off;
    /// waiting on it surfaces device failures for this bin.
    pub fn process_bin(
        &self,
        bin: Bin,
        bin_splats: Vec<Splat>,
        gather: Arc<GatherGroup>,
    ) -> Event {
        let field = Arc::clone(&self.field);
        self.queue.enqueue(move || {
            let _t = stats::Timed::new("device.bin");
            let grid = bin.grid;
            let segments = [(0u32, bin_splats.len() as u32)];

            let octree = SplatOctree::build(&bin_splats, &segments, &grid);
            let raw = marching::extract(&grid, field.as_ref(), &bin_splats, &octree);
            let fragment = mesh_filter::filter(&raw, bin.chunk);

            stats::counter("device.vertices").add(fragment.num_vertices() as u64);
            stats::counter("device.triangles").add(fragment.triangles.len() as u64);
            if fragment.is_empty() {
                return Ok(());
            }
            gather.send(&fragment)
        })
    }

    /// Drain the queue, surfacing any recorded device failure.
    pub fn finish(&self) -> Result<()> {
        self.queue.finish()
    }
}
