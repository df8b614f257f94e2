//! Worker-side batch loading: streaming a batch's splats into one
//! contiguous host buffer drawn from a backpressured ring.

use std::sync::Arc;

use crate::buffer::{Allocation, CircularBuffer};
use crate::error::{Error, Result};
use crate::splat::Splat;
use crate::splats::{IdRange, SplatSet};

use super::Bin;

/// A batch resident in host memory: the union of the batch's splat ranges
/// laid out contiguously, plus per-bin views into that buffer.
pub struct LoadedBatch {
    alloc: Allocation,
    bins: Vec<Bin>,
    /// Merged ranges with their start offset (in splats) in the buffer.
    union: Vec<(IdRange, u32)>,
    num_splats: usize,
}

impl LoadedBatch {
    pub fn bins(&self) -> &[Bin] {
        &self.bins
    }

    /// All splats of the batch, in id order.
    pub fn splats(&self) -> &[Splat] {
        let bytes = self.num_splats * std::mem::size_of::<Splat>();
        bytemuck::cast_slice(&self.alloc.as_slice()[..bytes])
    }

    /// Contiguous `(start, len)` segments of [`splats`] belonging to a bin.
    ///
    /// [`splats`]: LoadedBatch::splats
    pub fn bin_segments(&self, bin: &Bin) -> Vec<(u32, u32)> {
        let mut segments = Vec::with_capacity(bin.ranges.len());
        for &(first, last) in &bin.ranges {
            // Each bin range is contained in exactly one merged range.
            let slot = self
                .union
                .partition_point(|&((ufirst, _), _)| ufirst <= first)
                - 1;
            let ((ufirst, ulast), offset) = self.union[slot];
            debug_assert!(ufirst <= first && last <= ulast);
            segments.push((offset + (first - ufirst) as u32, (last - first) as u32));
        }
        segments
    }
}

/// Streams batches of bins into device-feedable host buffers.
pub struct BucketLoader<'a, S> {
    splats: &'a S,
    ring: Arc<CircularBuffer>,
}

impl<'a, S: SplatSet> BucketLoader<'a, S> {
    pub fn new(splats: &'a S, ring: Arc<CircularBuffer>) -> Self {
        BucketLoader { splats, ring }
    }

    /// Pull the batch's splats from the set into one contiguous buffer.
    /// Blocks on the ring until the device frees earlier batches.
    pub fn load(&self, bins: Vec<Bin>) -> Result<LoadedBatch> {
        assert!(!bins.is_empty());

        // Merge all bin ranges; bins inside a batch frequently share splats
        // near their mutual boundaries.
        let mut ranges: Vec<IdRange> = bins.iter().flat_map(|b| b.ranges.iter().copied()).collect();
        ranges.sort_unstable();
        let mut union: Vec<(IdRange, u32)> = Vec::with_capacity(ranges.len());
        for range in ranges {
            match union.last_mut() {
                Some(((_, last), _)) if *last >= range.0 => {
                    if range.1 > *last {
                        *last = range.1;
                    }
                }
                _ => union.push((range, 0)),
            }
        }
        let mut acc = 0u32;
        for ((first, last), off) in union.iter_mut() {
            *off = acc;
            acc += (*last - *first) as u32;
        }
        let num_splats = acc as usize;

        let mut alloc = self
            .ring
            .allocate(num_splats.max(1) * std::mem::size_of::<Splat>(), 1)?;

        {
            let out: &mut [Splat] = bytemuck::cast_slice_mut(
                &mut alloc.as_mut_slice()[..num_splats * std::mem::size_of::<Splat>()],
            );
            let mut stream = self
                .splats
                .splat_stream_ranges(union.iter().map(|&(r, _)| r).collect());
            let mut cursor = 0usize;
            while let Some((_, splat)) = stream.next()? {
                if cursor >= num_splats {
                    return Err(Error::Internal(
                        "splat stream returned more splats than the batch ranges hold".into(),
                    ));
                }
                out[cursor] = splat;
                cursor += 1;
            }
            if cursor != num_splats {
                return Err(Error::Internal(format!(
                    "batch ranges hold {} splats but the stream yielded {}",
                    num_splats, cursor
                )));
            }
        }

        Ok(LoadedBatch {
            alloc,
            bins,
            union,
            num_splats,
        })
    }

    /// Return a batch's buffer to the ring. Batches must be unloaded in the
    /// order they were loaded.
    pub fn unload(&self, batch: LoadedBatch) {
        self.ring.free(batch.alloc);
    }
}
