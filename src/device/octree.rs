//! Octree of splat references over one bin's corner lattice.
//!
//! Each splat is entered at the level where its support covers at most two
//! cells per axis, in every level cell it overlaps. A lookup at a corner
//! walks one cell per level, so enumeration cost is O(levels) plus the
//! matching references. The build is sort-based: per-level (Morton code,
//! splat reference) pairs are sorted and compacted into cell descriptors.

use rayon::prelude::*;

use crate::grid::Grid;
use crate::splat::Splat;

/// Spread the low 21 bits of `v` so there are two zero bits between each.
#[inline]
fn spread3(v: u64) -> u64 {
    let mut x = v & 0x1f_ffff;
    x = (x | (x << 32)) & 0x1f00000000ffff;
    x = (x | (x << 16)) & 0x1f0000ff0000ff;
    x = (x | (x << 8)) & 0x100f00f00f00f00f;
    x = (x | (x << 4)) & 0x10c30c30c30c30c3;
    x = (x | (x << 2)) & 0x1249249249249249;
    x
}

/// 3D Morton code of a (local, non-negative) cell coordinate.
#[inline]
pub fn morton3(x: u64, y: u64, z: u64) -> u64 {
    spread3(x) | (spread3(y) << 1) | (spread3(z) << 2)
}

struct Level {
    shift: u32,
    /// Sorted, unique Morton codes of the occupied level cells.
    codes: Vec<u64>,
    /// Start of each code's reference run; one extra terminating entry.
    starts: Vec<u32>,
    /// Splat references (indices into the batch splat buffer), grouped by
    /// cell.
    refs: Vec<u32>,
}

/// Per-bin spatial acceleration structure over splat supports.
pub struct SplatOctree {
    levels: Vec<Level>,
}

impl SplatOctree {
    /// Build over the given bin grid. `segments` selects this bin's splats
    /// from the batch buffer as `(start, len)` runs.
    pub fn build(splats: &[Splat], segments: &[(u32, u32)], grid: &Grid) -> SplatOctree {
        // Corner lattice size; corners are offset by the grid's lower
        // extent so all local coordinates are non-negative.
        let corners = [
            grid.num_vertices(0),
            grid.num_vertices(1),
            grid.num_vertices(2),
        ];
        let max_dim = corners.iter().copied().max().unwrap_or(1);
        let num_levels = (64 - (max_dim.max(2) - 1).leading_zeros()).max(1);

        // Each entry: (level, morton, ref). A splat lands in at most eight
        // cells of its level.
        let entries: Vec<(u32, u64, u32)> = segments
            .par_iter()
            .flat_map_iter(|&(start, len)| {
                (start..start + len).flat_map(|r| {
                    let splat = &splats[r as usize];
                    splat_entries(splat, grid, &corners, num_levels, r)
                })
            })
            .collect();

        let mut levels = Vec::with_capacity(num_levels as usize);
        for level in 0..num_levels {
            let mut pairs: Vec<(u64, u32)> = entries
                .par_iter()
                .filter(|&&(l, _, _)| l == level)
                .map(|&(_, code, r)| (code, r))
                .collect();
            pairs.par_sort_unstable();

            let mut codes = Vec::new();
            let mut starts = Vec::new();
            let mut refs = Vec::with_capacity(pairs.len());
            for (code, r) in pairs {
                if codes.last() != Some(&code) {
                    codes.push(code);
                    starts.push(refs.len() as u32);
                }
                refs.push(r);
            }
            starts.push(refs.len() as u32);
            levels.push(Level {
                shift: level,
                codes,
                starts,
                refs,
            });
        }
        SplatOctree { levels }
    }

    /// Enumerate the references of every splat whose support may reach the
    /// corner at local coordinates `corner`.
    #[inline]
    pub fn visit<F: FnMut(u32)>(&self, corner: [u64; 3], mut f: F) {
        for level in &self.levels {
            if level.codes.is_empty() {
                continue;
            }
            let code = morton3(
                corner[0] >> level.shift,
                corner[1] >> level.shift,
                corner[2] >> level.shift,
            );
            if let Ok(slot) = level.codes.binary_search(&code) {
                let lo = level.starts[slot] as usize;
                let hi = level.starts[slot + 1] as usize;
                for &r in &level.refs[lo..hi] {
                    f(r);
                }
            }
        }
    }

    #[cfg(test)]
    fn total_refs(&self) -> usize {
        self.levels.iter().map(|l| l.refs.len()).sum()
    }
}

/// Level and level-cell range of one splat; yields one entry per covered
/// level cell.
fn splat_entries(
    splat: &Splat,
    grid: &Grid,
    corners: &[u64; 3],
    num_levels: u32,
    r: u32,
) -> Vec<(u32, u64, u32)> {
    let spacing = grid.spacing();
    let mut lo = [0u64; 3];
    let mut hi = [0u64; 3];
    for axis in 0..3 {
        let ext_lo = grid.extent(axis).0;
        let lo_w = (splat.position[axis] - splat.radius - grid.reference()[axis]) / spacing;
        let hi_w = (splat.position[axis] + splat.radius - grid.reference()[axis]) / spacing;
        let lo_c = (lo_w.ceil() as i64 - ext_lo).max(0);
        let hi_c = (hi_w.floor() as i64 - ext_lo).min(corners[axis] as i64 - 1);
        if lo_c > hi_c {
            return Vec::new(); // support misses this bin's corner lattice
        }
        lo[axis] = lo_c as u64;
        hi[axis] = hi_c as u64;
    }

    // Smallest level where the corner range spans at most two cells per
    // axis.
    let mut level = 0u32;
    while level + 1 < num_levels
        && (0..3).any(|a| (hi[a] >> level) - (lo[a] >> level) > 1)
    {
        level += 1;
    }

    let mut out = Vec::with_capacity(8);
    for z in (lo[2] >> level)..=(hi[2] >> level) {
        for y in (lo[1] >> level)..=(hi[1] >> level) {
            for x in (lo[0] >> level)..=(hi[0] >> level) {
                out.push((level, morton3(x, y, z), r));
            }
        }
    }
    out
}
