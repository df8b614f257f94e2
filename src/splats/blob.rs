//! Precomputed blob index over a base splat set.
//!
//! A single bounding-and-binning pass computes, for every finite splat, the
//! bucket range its bounding cube covers at a fixed base bucket size.
//! Adjacent splats with identical ranges coalesce into blobs, which makes
//! later bucketing passes enumerate orders of magnitude fewer records than
//! splats. The same pass derives the exact finite-splat count and the world
//! bounding grid.

use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::grid::{div_down, Grid};
use crate::splat::{Splat, SplatId};
use crate::stats;

use super::{BlobInfo, BlobStream, IdRange, SplatSet, SplatStream};

/// Splats buffered per parallel binning batch.
const BATCH_SIZE: usize = 1 << 20;

#[derive(Clone, Copy)]
struct Bbox {
    min: [f32; 3],
    max: [f32; 3],
}

impl Bbox {
    fn empty() -> Self {
        Bbox {
            min: [f32::INFINITY; 3],
            max: [f32::NEG_INFINITY; 3],
        }
    }

    fn add_splat(mut self, splat: &Splat) -> Self {
        for axis in 0..3 {
            self.min[axis] = self.min[axis].min(splat.position[axis] - splat.radius);
            self.max[axis] = self.max[axis].max(splat.position[axis] + splat.radius);
        }
        self
    }

    fn merge(mut self, other: Bbox) -> Self {
        for axis in 0..3 {
            self.min[axis] = self.min[axis].min(other.min[axis]);
            self.max[axis] = self.max[axis].max(other.max[axis]);
        }
        self
    }

    fn is_empty(&self) -> bool {
        self.min[0] > self.max[0]
    }
}

/// A splat set extended with a precomputed blob index and bounding grid.
///
/// Blob enumeration hits the fast path (pure integer scaling of the index)
/// whenever the requested grid has its reference at the origin, the same
/// spacing as the index, a lower extent divisible by the base bucket size,
/// and a bucket size that is a multiple of the base.
pub struct IndexedSplats<S> {
    base: S,
    blobs: Vec<BlobInfo>,
    bounding_grid: Grid,
    bucket_size: u64,
    num_splats: u64,
}

impl<S: SplatSet> IndexedSplats<S> {
    /// Run the bounding-and-binning pass over `base`.
    ///
    /// Fails with [`Error::EmptyInput`] when no finite splat exists and
    /// propagates I/O failures from the underlying stream.
    pub fn build(base: S, spacing: f32, bucket_size: u64) -> Result<Self> {
        assert!(bucket_size > 0);
        assert!(spacing > 0.0);
        let _t = stats::Timed::new("blobset.build");

        // Reference at the world origin; extents follow once the bbox is
        // known. Bucket coordinates during the pass are global.
        let ref_grid = Grid::new([0.0; 3], spacing, [(0, 0); 3]);

        let mut blobs: Vec<BlobInfo> = Vec::new();
        let mut bbox = Bbox::empty();
        let mut num_splats = 0u64;

        let mut stream = base.splat_stream();
        let mut batch: Vec<(SplatId, Splat)> = Vec::with_capacity(BATCH_SIZE.min(1 << 14));
        loop {
            batch.clear();
            while batch.len() < BATCH_SIZE {
                match stream.next()? {
                    Some(item) => batch.push(item),
                    None => break,
                }
            }
            if batch.is_empty() {
                break;
            }

            let ranges: Vec<([i64; 3], [i64; 3])> = batch
                .par_iter()
                .map(|(_, splat)| ref_grid.splat_buckets_global(splat, bucket_size))
                .collect();
            bbox = bbox.merge(
                batch
                    .par_iter()
                    .fold(Bbox::empty, |acc, (_, splat)| acc.add_splat(splat))
                    .reduce(Bbox::empty, Bbox::merge),
            );

            for ((id, _), &(lower, upper)) in batch.iter().zip(&ranges) {
                match blobs.last_mut() {
                    Some(last)
                        if last.lower == lower
                            && last.upper == upper
                            && last.last_splat == *id =>
                    {
                        last.last_splat += 1;
                    }
                    _ => blobs.push(BlobInfo {
                        first_splat: *id,
                        last_splat: *id + 1,
                        lower,
                        upper,
                    }),
                }
            }
            num_splats += batch.len() as u64;
        }
        drop(stream);

        let non_finite = base.max_splats() - num_splats;
        stats::counter("blobset.nonfinite").add(non_finite);
        if non_finite > 0 {
            log::warn!("input contains {} splat(s) with non-finite values", non_finite);
        }
        if bbox.is_empty() {
            return Err(Error::EmptyInput);
        }

        let mut extents = [(0i64, 0i64); 3];
        for axis in 0..3 {
            let lo = (bbox.min[axis] / spacing).floor() as i64;
            // One past the cell containing the maximum, so a bound that
            // lands exactly on a cell boundary still gets its cell.
            let hi = (bbox.max[axis] / spacing).floor() as i64 + 1;
            // Align the lower extent to the bucket size so the index data
            // stays valid for any grid that keeps this alignment.
            let lo = div_down(lo, bucket_size as i64) * bucket_size as i64;
            extents[axis] = (lo, hi.max(lo + 1));
        }
        let bounding_grid = Grid::new([0.0; 3], spacing, extents);

        stats::counter("blobset.blobs").add(blobs.len() as u64);
        log::debug!(
            "blob index: {} blobs over {} splats",
            blobs.len(),
            num_splats
        );

        Ok(IndexedSplats {
            base,
            blobs,
            bounding_grid,
            bucket_size,
            num_splats,
        })
    }

    /// Bounding grid computed by the binning pass: origin reference, the
    /// requested spacing, lower extents aligned to the base bucket size.
    pub fn bounding_grid(&self) -> &Grid {
        &self.bounding_grid
    }

    /// Exact number of finite splats.
    pub fn num_splats(&self) -> u64 {
        self.num_splats
    }

    pub fn num_blobs(&self) -> usize {
        self.blobs.len()
    }

    fn fast_path(&self, grid: &Grid, bucket_size: u64) -> bool {
        if bucket_size % self.bucket_size != 0 {
            return false;
        }
        if grid.spacing() != self.bounding_grid.spacing() {
            return false;
        }
        for axis in 0..3 {
            if grid.reference()[axis] != 0.0
                || grid.extent(axis).0 % self.bucket_size as i64 != 0
            {
                return false;
            }
        }
        true
    }
}

/// Fast-path stream: blob records rescaled by integer arithmetic.
struct ScaledBlobStream<'a> {
    blobs: &'a [BlobInfo],
    cur: usize,
    /// Grid lower extent in base-bucket units.
    offset: [i64; 3],
    /// Requested bucket size over the index bucket size.
    ratio: i64,
}

impl BlobStream for ScaledBlobStream<'_> {
    fn next(&mut self) -> Result<Option<BlobInfo>> {
        let Some(raw) = self.blobs.get(self.cur) else {
            return Ok(None);
        };
        self.cur += 1;
        let mut blob = *raw;
        for axis in 0..3 {
            blob.lower[axis] = div_down(raw.lower[axis] - self.offset[axis], self.ratio);
            blob.upper[axis] = div_down(raw.upper[axis] - self.offset[axis], self.ratio);
        }
        Ok(Some(blob))
    }
}

impl<S: SplatSet> SplatSet for IndexedSplats<S> {
    fn max_splats(&self) -> u64 {
        self.num_splats
    }

    fn splat_stream_ranges(&self, ranges: Vec<IdRange>) -> Box<dyn SplatStream + '_> {
        self.base.splat_stream_ranges(ranges)
    }

    fn blob_stream(&self, grid: &Grid, bucket_size: u64) -> Box<dyn BlobStream + '_> {
        assert!(bucket_size > 0);
        if self.fast_path(grid, bucket_size) {
            let mut offset = [0i64; 3];
            for axis in 0..3 {
                offset[axis] = grid.extent(axis).0 / self.bucket_size as i64;
            }
            Box::new(ScaledBlobStream {
                blobs: &self.blobs,
                cur: 0,
                offset,
                ratio: (bucket_size / self.bucket_size) as i64,
            })
        } else {
            self.base.blob_stream(grid, bucket_size)
        }
    }
}
