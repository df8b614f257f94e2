//! Recursive spatial bucketing: carving the bounding grid into bins whose
//! splat load and cell footprint fit the device working set.

mod collector;
mod loader;

pub use collector::BucketCollector;
pub use loader::{BucketLoader, LoadedBatch};

use crate::error::{Error, Result};
use crate::grid::{div_up, Grid};
use crate::splats::{IdRange, SplatSet};
use crate::stats;

/// Hard ceiling on bucket recursion; exceeding it means the blob overlap
/// structure is pathological.
const MAX_DEPTH: usize = 64;

/// Identifier of one output file: generation plus integer chunk coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ChunkId {
    pub gen: u32,
    pub coords: [u32; 3],
}

/// One unit of work for a device worker: a set of splat-id ranges plus the
/// target sub-grid, tagged with the chunk that receives its mesh.
#[derive(Debug, Clone, PartialEq)]
pub struct Bin {
    /// Merged, ordered, disjoint splat-id ranges.
    pub ranges: Vec<IdRange>,
    /// Total splats across `ranges`.
    pub num_splats: u64,
    /// Target sub-grid in global cell coordinates.
    pub grid: Grid,
    pub chunk: ChunkId,
}

/// Bucketer knobs. `micro_size` is the pow-of-two edge (in cells) of the
/// smallest cuboid the recursion will consider indivisible.
#[derive(Debug, Clone, Copy)]
pub struct BucketParams {
    pub max_splats: u64,
    pub max_cells: u64,
    pub max_split: u64,
    pub micro_size: u64,
}

impl BucketParams {
    pub fn validate(&self) -> Result<()> {
        if !self.micro_size.is_power_of_two() {
            return Err(Error::InvalidOption(format!(
                "microblock size {} is not a power of two",
                self.micro_size
            )));
        }
        if self.max_split < 2 {
            return Err(Error::InvalidOption("max-split must be at least 2".into()));
        }
        if self.micro_size.pow(3) > self.max_cells {
            return Err(Error::InvalidOption(format!(
                "microblock of {} cells exceeds max-cells {}",
                self.micro_size.pow(3),
                self.max_cells
            )));
        }
        if self.max_splats == 0 {
            return Err(Error::InvalidOption("max-device-splats must be positive".into()));
        }
        Ok(())
    }
}

/// Blob record in microblock coordinates relative to the bounding grid.
#[derive(Clone, Copy)]
struct MicroBlob {
    range: IdRange,
    lower: [i64; 3],
    upper: [i64; 3],
}

struct BucketState<'a, F> {
    grid: &'a Grid,
    params: &'a BucketParams,
    blobs: &'a [MicroBlob],
    emit: &'a mut F,
    overflow_warned: bool,
}

/// Partition the bounding grid into bins and feed them to `emit` in
/// depth-first traversal order. When `chunk_cells` is nonzero the traversal
/// is truncated at the chunk granularity first and each bin inherits the
/// chunk coordinate of its containing chunk cell.
pub fn bucket<S: SplatSet, F>(
    splats: &S,
    grid: &Grid,
    chunk_cells: u64,
    generation: u32,
    params: &BucketParams,
    mut emit: F,
) -> Result<()>
where
    F: FnMut(Bin) -> Result<()>,
{
    params.validate()?;
    let _t = stats::Timed::new("bucket.compute");

    // Express every blob in microblocks once up front.
    let mut blobs = Vec::new();
    let mut stream = splats.blob_stream(grid, params.micro_size);
    while let Some(blob) = stream.next()? {
        blobs.push(MicroBlob {
            range: (blob.first_splat, blob.last_splat),
            lower: blob.lower,
            upper: blob.upper,
        });
    }
    drop(stream);

    let micro_counts = [
        div_up(grid.num_cells(0) as i64, params.micro_size as i64),
        div_up(grid.num_cells(1) as i64, params.micro_size as i64),
        div_up(grid.num_cells(2) as i64, params.micro_size as i64),
    ];

    let mut state = BucketState {
        grid,
        params,
        blobs: &blobs,
        emit: &mut emit,
        overflow_warned: false,
    };

    let all: Vec<u32> = (0..blobs.len() as u32).collect();
    if chunk_cells == 0 {
        let region = [(0, micro_counts[0]), (0, micro_counts[1]), (0, micro_counts[2])];
        let chunk = ChunkId {
            gen: generation,
            coords: [0; 3],
        };
        return recurse(&mut state, region, &all, chunk, 0);
    }

    if chunk_cells % params.micro_size != 0 {
        return Err(Error::InvalidOption(format!(
            "chunk-cells {} is not a multiple of the microblock size {}",
            chunk_cells, params.micro_size
        )));
    }
    let chunk_micro = (chunk_cells / params.micro_size) as i64;
    let chunk_counts = [
        div_up(micro_counts[0], chunk_micro),
        div_up(micro_counts[1], chunk_micro),
        div_up(micro_counts[2], chunk_micro),
    ];

    for cz in 0..chunk_counts[2] {
        for cy in 0..chunk_counts[1] {
            for cx in 0..chunk_counts[0] {
                let coords = [cx, cy, cz];
                let mut region = [(0i64, 0i64); 3];
                for axis in 0..3 {
                    let lo = coords[axis] * chunk_micro;
                    region[axis] = (lo, (lo + chunk_micro).min(micro_counts[axis]));
                }
                let subset: Vec<u32> = all
                    .iter()
                    .copied()
                    .filter(|&b| intersects(&blobs[b as usize], &region))
                    .collect();
                if subset.is_empty() {
                    continue;
                }
                let chunk = ChunkId {
                    gen: generation,
                    coords: [cx as u32, cy as u32, cz as u32],
                };
                recurse(&mut state, region, &subset, chunk, 0)?;
            }
        }
    }
    Ok(())
}

#[inline]
fn intersects(blob: &MicroBlob, region: &[(i64, i64); 3]) -> bool {
    (0..3).all(|axis| blob.upper[axis] >= region[axis].0 && blob.lower[axis] < region[axis].1)
}

/// Cells actually covered by a microblock region, clamped to the grid.
fn region_cells(grid: &Grid, micro_size: u64, region: &[(i64, i64); 3]) -> [(i64, i64); 3] {
    let mut out = [(0i64, 0i64); 3];
    for axis in 0..3 {
        let (ext_lo, ext_hi) = grid.extent(axis);
        let lo = ext_lo + region[axis].0 * micro_size as i64;
        let hi = (ext_lo + region[axis].1 * micro_size as i64).min(ext_hi);
        out[axis] = (lo, hi);
    }
    out
}

fn recurse<F>(
    state: &mut BucketState<'_, F>,
    region: [(i64, i64); 3],
    subset: &[u32],
    chunk: ChunkId,
    depth: usize,
) -> Result<()>
where
    F: FnMut(Bin) -> Result<()>,
{
    if depth > MAX_DEPTH {
        let cells = region_cells(state.grid, state.params.micro_size, &region);
        return Err(Error::BucketExplosion {
            depth,
            region: cells,
        });
    }
    if subset.is_empty() {
        return Ok(());
    }

    let num_splats: u64 = subset
        .iter()
        .map(|&b| {
            let r = state.blobs[b as usize].range;
            r.1 - r.0
        })
        .sum();
    let cells = region_cells(state.grid, state.params.micro_size, &region);
    let num_cells: u64 = cells.iter().map(|&(lo, hi)| (hi - lo) as u64).product();
    let single_micro = region.iter().all(|&(lo, hi)| hi - lo <= 1);

    let fits_cells = num_cells <= state.params.max_cells;
    let fits_splats = num_splats <= state.params.max_splats;

    if fits_cells && (fits_splats || single_micro) {
        if !fits_splats {
            stats::counter("bucket.overflow").add(1);
            if !state.overflow_warned {
                log::warn!(
                    "bin of {} splats exceeds max-device-splats {} and cannot be split further \
                     (region x[{},{}] y[{},{}] z[{},{}])",
                    num_splats,
                    state.params.max_splats,
                    cells[0].0,
                    cells[0].1,
                    cells[1].0,
                    cells[1].1,
                    cells[2].0,
                    cells[2].1
                );
                state.overflow_warned = true;
            }
        }
        let bin = make_bin(state, &cells, subset, num_splats, chunk);
        stats::counter("bucket.bins").add(1);
        stats::counter("bucket.splats").add(num_splats);
        return (state.emit)(bin);
    }

    // Split each axis into up to max_split roughly-equal microblock runs.
    let mut pieces = [1i64; 3];
    for axis in 0..3 {
        let size = region[axis].1 - region[axis].0;
        pieces[axis] = size.min(state.params.max_split as i64).max(1);
    }

    let mut child_subset = Vec::with_capacity(subset.len());
    for pz in 0..pieces[2] {
        for py in 0..pieces[1] {
            for px in 0..pieces[0] {
                let p = [px, py, pz];
                let mut child = [(0i64, 0i64); 3];
                for axis in 0..3 {
                    let (lo, hi) = region[axis];
                    let size = hi - lo;
                    child[axis] = (
                        lo + size * p[axis] / pieces[axis],
                        lo + size * (p[axis] + 1) / pieces[axis],
                    );
                }
                child_subset.clear();
                child_subset.extend(
                    subset
                        .iter()
                        .copied()
                        .filter(|&b| intersects(&state.blobs[b as usize], &child)),
                );
                if child_subset.is_empty() {
                    continue;
                }
                let subset_copy = std::mem::take(&mut child_subset);
                recurse(state, child, &subset_copy, chunk, depth + 1)?;
                child_subset = subset_copy;
            }
        }
    }
    Ok(())
}

fn make_bin<F>(
    state: &BucketState<'_, F>,
    cells: &[(i64, i64); 3],
    subset: &[u32],
    num_splats: u64,
    chunk: ChunkId,
) -> Bin {
    let mut ranges: Vec<IdRange> = Vec::new();
    for &b in subset {
        let range = state.blobs[b as usize].range;
        match ranges.last_mut() {
            Some(last) if last.1 == range.0 => last.1 = range.1,
            _ => ranges.push(range),
        }
    }
    let grid = state.grid.sub_grid(
        [cells[0].0, cells[1].0, cells[2].0],
        [cells[0].1, cells[1].1, cells[2].1],
    );
    Bin {
        ranges,
        num_splats,
        grid,
        chunk,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::splat::Splat;
    use crate::splats::{IndexedSplats, VectorSet};
    use glam::Vec3;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn params(max_splats: u64) -> BucketParams {
        BucketParams {
            max_splats,
            max_cells: 1 << 18,
            max_split: 2,
            micro_size: 4,
        }
    }

    fn random_indexed(n: usize, seed: u64) -> IndexedSplats<VectorSet> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut set = VectorSet::default();
        for _ in 0..n {
            let pos = Vec3::new(
                rng.gen_range(-6.0..6.0),
                rng.gen_range(-6.0..6.0),
                rng.gen_range(-6.0..6.0),
            );
            set.push(Splat::new(pos, Vec3::Z, rng.gen_range(0.05..0.4)));
        }
        IndexedSplats::build(set, 0.25, 4).unwrap()
    }

    #[test]
    fn bins_respect_limits_and_cover_all_splats() {
        let splats = random_indexed(4000, 11);
        let grid = *splats.bounding_grid();
        let p = params(500);

        let mut bins = Vec::new();
        bucket(&splats, &grid, 0, 0, &p, |bin| {
            bins.push(bin);
            Ok(())
        })
        .unwrap();

        assert!(!bins.is_empty());
        let mut covered = vec![false; 4000];
        for bin in &bins {
            assert!(bin.num_splats <= p.max_splats);
            assert!(bin.grid.total_cells() <= p.max_cells);
            let total: u64 = bin.ranges.iter().map(|r| r.1 - r.0).sum();
            assert_eq!(total, bin.num_splats);
            for &(a, b) in &bin.ranges {
                for id in a..b {
                    covered[id as usize] = true;
                }
            }
        }
        // Every finite splat appears in at least one bin.
        assert!(covered.iter().all(|&c| c));
    }

    #[test]
    fn oversized_single_location_is_accepted_with_overflow() {
        // 50 splats stacked at one point can never be split apart.
        let mut set = VectorSet::default();
        for _ in 0..50 {
            set.push(Splat::new(Vec3::splat(0.5), Vec3::Z, 0.1));
        }
        let splats = IndexedSplats::build(set, 0.25, 4).unwrap();
        let grid = *splats.bounding_grid();

        let mut bins = Vec::new();
        bucket(&splats, &grid, 0, 0, &params(10), |bin| {
            bins.push(bin);
            Ok(())
        })
        .unwrap();
        assert_eq!(bins.len(), 1);
        assert_eq!(bins[0].num_splats, 50);
    }

    #[test]
    fn chunked_traversal_assigns_chunk_coords() {
        let splats = random_indexed(1000, 5);
        let grid = *splats.bounding_grid();
        let p = params(200);

        let mut bins = Vec::new();
        bucket(&splats, &grid, 16, 3, &p, |bin| {
            bins.push(bin);
            Ok(())
        })
        .unwrap();

        let chunks: std::collections::BTreeSet<ChunkId> =
            bins.iter().map(|b| b.chunk).collect();
        assert!(chunks.len() > 1, "expected multiple chunks");
        assert!(chunks.iter().all(|c| c.gen == 3));

        // Each bin's cells stay inside its chunk's cell region.
        for bin in &bins {
            for axis in 0..3 {
                let (lo, hi) = bin.grid.extent(axis);
                let chunk_lo = grid.extent(axis).0 + bin.chunk.coords[axis] as i64 * 16;
                assert!(lo >= chunk_lo && hi <= chunk_lo + 16);
            }
        }
    }

    #[test]
    fn sub_grids_partition_cells() {
        let splats = random_indexed(2000, 23);
        let grid = *splats.bounding_grid();
        let p = params(300);

        let mut bins = Vec::new();
        bucket(&splats, &grid, 0, 0, &p, |bin| {
            bins.push(bin);
            Ok(())
        })
        .unwrap();

        // Bins never overlap in cell space.
        for (i, a) in bins.iter().enumerate() {
            for b in &bins[i + 1..] {
                let overlap = (0..3).all(|axis| {
                    let (alo, ahi) = a.grid.extent(axis);
                    let (blo, bhi) = b.grid.extent(axis);
                    alo < bhi && blo < ahi
                });
                assert!(!overlap, "bins overlap in cell space");
            }
        }
    }

    #[test]
    fn rejects_bad_parameters() {
        let p = BucketParams {
            max_splats: 100,
            max_cells: 8,
            max_split: 2,
            micro_size: 4, // 64 cells > max_cells
        };
        assert!(p.validate().is_err());

        let p = BucketParams {
            max_splats: 100,
            max_cells: 1 << 12,
            max_split: 2,
            micro_size: 3,
        };
        assert!(p.validate().is_err());
    }
}
