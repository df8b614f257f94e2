//! Slab-streamed marching tetrahedra.
//!
//! Each cell is decomposed into six tetrahedra sharing the main diagonal.
//! The triangulation tables are built once at startup by enumerating all
//! 256 corner sign configurations, rotating every tetrahedron into a
//! canonical orientation and recording which of the 19 cell edges carry
//! interpolated vertices.
//!
//! Extraction walks the target grid one z-slab at a time: two slab images
//! hold the field at consecutive corner planes, and the cells between them
//! run the count/scan/compact/count/scan/generate stage chain with vertex
//! and index ids carried across slab pairs so they are consistent within
//! the bin.

use std::sync::OnceLock;

use rayon::prelude::*;

use crate::grid::Grid;
use crate::splat::Splat;

use super::mls::FieldProgram;
use super::SplatOctree;

pub const NUM_EDGES: usize = 19;
pub const NUM_TETRAHEDRA: usize = 6;
const NUM_CUBES: usize = 256;

/// Cell corner `k` sits at offsets `(k & 1, (k >> 1) & 1, (k >> 2) & 1)`.
const EDGE_VERTICES: [[u8; 2]; NUM_EDGES] = [
    [0, 1],
    [0, 2],
    [0, 3],
    [1, 3],
    [2, 3],
    [0, 4],
    [0, 5],
    [1, 5],
    [4, 5],
    [0, 6],
    [2, 6],
    [4, 6],
    [0, 7],
    [1, 7],
    [2, 7],
    [3, 7],
    [4, 7],
    [5, 7],
    [6, 7],
];

/// Six tetrahedra around the 0-7 diagonal.
const TET_VERTICES: [[u8; 4]; NUM_TETRAHEDRA] = [
    [0, 7, 1, 3],
    [0, 7, 3, 2],
    [0, 7, 2, 6],
    [0, 7, 6, 4],
    [0, 7, 4, 5],
    [0, 7, 5, 1],
];

fn find_edge(v0: u8, v1: u8) -> u8 {
    let (v0, v1) = if v0 > v1 { (v1, v0) } else { (v0, v1) };
    for (i, e) in EDGE_VERTICES.iter().enumerate() {
        if e[0] == v0 && e[1] == v1 {
            return i as u8;
        }
    }
    unreachable!("no edge between corners {} and {}", v0, v1);
}

fn permutation_parity(items: &[(u8, bool)]) -> u32 {
    let mut parity = 0;
    for i in 0..items.len() {
        for j in i + 1..items.len() {
            if items[i] > items[j] {
                parity ^= 1;
            }
        }
    }
    parity
}

fn next_permutation(items: &mut [(u8, bool)]) -> bool {
    if items.len() < 2 {
        return false;
    }
    let mut i = items.len() - 1;
    while i > 0 && items[i - 1] >= items[i] {
        i -= 1;
    }
    if i == 0 {
        items.reverse();
        return false;
    }
    let mut j = items.len() - 1;
    while items[j] <= items[i - 1] {
        j -= 1;
    }
    items.swap(i - 1, j);
    items[i..].reverse();
    true
}

/// Per-configuration triangulation data.
pub struct MarchingTables {
    /// `(vertex_count, index_count)` per corner configuration.
    pub count: [(u8, u8); NUM_CUBES],
    /// `(vertex_start, index_start)` per configuration, one extra entry.
    pub start: [(u16, u16); NUM_CUBES + 1],
    /// Edge id of every interpolated vertex, grouped by configuration and
    /// ordered by edge id.
    pub vertex_edges: Vec<u8>,
    /// Local vertex indices of the emitted triangles, grouped by
    /// configuration.
    pub indices: Vec<u8>,
}

fn make_tables() -> MarchingTables {
    let mut vertex_edges = Vec::new();
    let mut indices = Vec::new();
    let mut count = [(0u8, 0u8); NUM_CUBES];
    let mut start = [(0u16, 0u16); NUM_CUBES + 1];

    for code in 0..NUM_CUBES {
        start[code] = (vertex_edges.len() as u16, indices.len() as u16);

        // Triangle corners recorded as edge ids, compacted below.
        let mut triangles: Vec<u8> = Vec::new();
        for tet in &TET_VERTICES {
            let mut tvtxs: [(u8, bool); 4] = [(0, false); 4];
            let mut outside = 0;
            for (k, &v) in tet.iter().enumerate() {
                let o = code & (1 << v) != 0;
                outside += o as u32;
                tvtxs[k] = (v, o);
            }
            let mut base_parity = permutation_parity(&tvtxs);

            // Flip inside/outside so that at most two corners are outside;
            // the winding flips with it.
            if outside > 2 {
                base_parity ^= 1;
                for t in tvtxs.iter_mut() {
                    t.1 = !t.1;
                }
            }

            // Rotate (never reflect) the tetrahedron into one of the
            // canonical configurations: no corner outside, corner 0
            // outside, corners (0, 1) outside.
            tvtxs.sort_unstable();
            loop {
                if permutation_parity(&tvtxs) == base_parity {
                    let [t0, t1, t2, t3] = [tvtxs[0].0, tvtxs[1].0, tvtxs[2].0, tvtxs[3].0];
                    let mut mask = 0u32;
                    for (k, t) in tvtxs.iter().enumerate() {
                        mask |= (t.1 as u32) << k;
                    }
                    if mask == 0 {
                        break;
                    } else if mask == 1 {
                        triangles.push(find_edge(t0, t1));
                        triangles.push(find_edge(t0, t3));
                        triangles.push(find_edge(t0, t2));
                        break;
                    } else if mask == 3 {
                        triangles.push(find_edge(t0, t2));
                        triangles.push(find_edge(t1, t2));
                        triangles.push(find_edge(t1, t3));

                        triangles.push(find_edge(t1, t3));
                        triangles.push(find_edge(t0, t3));
                        triangles.push(find_edge(t0, t2));
                        break;
                    }
                }
                if !next_permutation(&mut tvtxs) {
                    break;
                }
            }
        }

        // Assign local indices to the edges in use, ordered by edge id.
        let mut edge_compact = [0u8; NUM_EDGES];
        let mut pool = 0u8;
        for edge in 0..NUM_EDGES as u8 {
            if triangles.contains(&edge) {
                edge_compact[edge as usize] = pool;
                pool += 1;
                vertex_edges.push(edge);
            }
        }
        for &edge in &triangles {
            indices.push(edge_compact[edge as usize]);
        }

        count[code] = (
            (vertex_edges.len() as u16 - start[code].0) as u8,
            (indices.len() as u16 - start[code].1) as u8,
        );
    }
    start[NUM_CUBES] = (vertex_edges.len() as u16, indices.len() as u16);

    MarchingTables {
        count,
        start,
        vertex_edges,
        indices,
    }
}

/// The shared triangulation tables, built on first use.
pub fn tables() -> &'static MarchingTables {
    static TABLES: OnceLock<MarchingTables> = OnceLock::new();
    TABLES.get_or_init(make_tables)
}

/// One interpolated isosurface vertex with its welding identity.
#[derive(Debug, Clone, Copy)]
pub struct MeshVertex {
    pub pos: [f32; 3],
    /// Canonical key of the grid edge carrying this vertex; identical
    /// across neighboring bins that share the edge.
    pub key: u64,
    /// True when the edge lies in one of the bin's boundary face planes.
    pub boundary: bool,
}

/// Per-bin mesh before welding: one vertex per (cell, edge) emission and
/// triangles indexing them bin-locally.
#[derive(Debug, Default)]
pub struct RawMesh {
    pub vertices: Vec<MeshVertex>,
    pub triangles: Vec<[u32; 3]>,
}

/// Canonical key of the grid edge from global corner `a` to `b`.
///
/// The lexicographically smaller endpoint is packed with 20 bits per axis
/// (two's complement, masked) together with a 3-bit direction code, so any
/// bin containing the edge derives the same bit pattern. Grids are
/// validated to span fewer than 2^20 cells per axis.
#[inline]
fn edge_key(a: [i64; 3], b: [i64; 3]) -> u64 {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let dir = [(hi[0] - lo[0]) as u64, (hi[1] - lo[1]) as u64, (hi[2] - lo[2]) as u64];
    debug_assert!(dir.iter().all(|&d| d <= 1));
    let dir_code = dir[0] | (dir[1] << 1) | (dir[2] << 2);
    const MASK: u64 = (1 << 20) - 1;
    (dir_code << 60)
        | ((lo[0] as u64 & MASK) << 40)
        | ((lo[1] as u64 & MASK) << 20)
        | (lo[2] as u64 & MASK)
}

/// Exclusive prefix scan; returns the offsets and the total.
fn exclusive_scan(values: &[u32]) -> (Vec<u32>, u32) {
    let mut offsets = Vec::with_capacity(values.len());
    let mut acc = 0u32;
    for &v in values {
        offsets.push(acc);
        acc += v;
    }
    (offsets, acc)
}

/// Extract the isosurface of `field` over the bin grid.
///
/// `splats`/`octree` are handed through to the field program; the returned
/// mesh has bin-local vertex ids assigned in stage order.
pub fn extract(
    grid: &Grid,
    field: &dyn FieldProgram,
    splats: &[Splat],
    octree: &SplatOctree,
) -> RawMesh {
    let tables = tables();
    let width = grid.num_vertices(0) as usize;
    let height = grid.num_vertices(1) as usize;
    let depth = grid.num_vertices(2) as usize;
    let cells_x = width - 1;
    let cells_y = height - 1;
    let ext = [grid.extent(0), grid.extent(1), grid.extent(2)];

    let mut prev = vec![f32::NAN; width * height];
    let mut curr = vec![f32::NAN; width * height];
    let mut mesh = RawMesh::default();
    // Carry-in so ids stay consistent across slab pairs.
    let mut vertex_base = 0u32;

    field.eval_slab(splats, octree, grid, 0, &mut curr);

    for z_plane in 1..depth {
        std::mem::swap(&mut prev, &mut curr);
        field.eval_slab(splats, octree, grid, z_plane as u64, &mut curr);
        let cell_z = (z_plane - 1) as i64;

        // Stage 1: flag cells whose corners straddle the isosurface.
        let codes: Vec<u8> = (0..cells_x * cells_y)
            .into_par_iter()
            .map(|cell| {
                let x = cell % cells_x;
                let y = cell / cells_x;
                cell_code(&prev, &curr, width, x, y)
            })
            .collect();
        let occupied: Vec<u32> = codes
            .par_iter()
            .map(|&code| (tables.count[code as usize].1 > 0) as u32)
            .collect();

        // Stage 2: scan + compact into a dense cell list.
        let (offsets, compacted) = exclusive_scan(&occupied);
        if compacted == 0 {
            continue;
        }
        let mut cells = vec![0u32; compacted as usize];
        for (cell, (&occ, &off)) in occupied.iter().zip(&offsets).enumerate() {
            if occ != 0 {
                cells[off as usize] = cell as u32;
            }
        }

        // Stage 3: per-cell element counts, scanned with carry-in.
        let counts: Vec<(u32, u32)> = cells
            .par_iter()
            .map(|&cell| {
                let (nv, ni) = tables.count[codes[cell as usize] as usize];
                (nv as u32, ni as u32)
            })
            .collect();
        let (vertex_offsets, slab_vertices) =
            exclusive_scan(&counts.iter().map(|c| c.0).collect::<Vec<_>>());
        let (index_offsets, slab_indices) =
            exclusive_scan(&counts.iter().map(|c| c.1).collect::<Vec<_>>());

        // Stage 4: generate vertices and triangles at their final offsets.
        let base = vertex_base;
        let mut slab_mesh_vertices = vec![
            MeshVertex {
                pos: [0.0; 3],
                key: 0,
                boundary: false
            };
            slab_vertices as usize
        ];
        let mut slab_triangles = vec![[0u32; 3]; (slab_indices / 3) as usize];

        // Parallel generation: each compacted cell writes disjoint ranges.
        let vertex_ptr = SlicePtr(slab_mesh_vertices.as_mut_ptr());
        let triangle_ptr = SlicePtr(slab_triangles.as_mut_ptr());
        cells
            .par_iter()
            .enumerate()
            .for_each(|(slot, &cell)| {
                let code = codes[cell as usize] as usize;
                let x = (cell as usize % cells_x) as i64;
                let y = (cell as usize / cells_x) as i64;
                let (vstart, istart) = tables.start[code];
                let (nv, ni) = tables.count[code];

                // Corner values and global corner coordinates.
                let mut values = [0.0f32; 8];
                let mut corners = [[0i64; 3]; 8];
                for k in 0..8 {
                    let dx = (k & 1) as i64;
                    let dy = ((k >> 1) & 1) as i64;
                    let dz = ((k >> 2) & 1) as i64;
                    let ix = (x + dx) as usize;
                    let iy = (y + dy) as usize;
                    let slab = if dz == 0 { &prev } else { &curr };
                    values[k] = slab[iy * width + ix];
                    corners[k] = [
                        ext[0].0 + x + dx,
                        ext[1].0 + y + dy,
                        ext[2].0 + cell_z + dz,
                    ];
                }

                let vertex_out = vertex_offsets[slot] as usize;
                for (i, &edge) in tables.vertex_edges
                    [vstart as usize..vstart as usize + nv as usize]
                    .iter()
                    .enumerate()
                {
                    let [a, b] = EDGE_VERTICES[edge as usize];
                    let (a, b) = (a as usize, b as usize);
                    let va = values[a];
                    let vb = values[b];
                    let t = va / (va - vb);
                    let t = if t.is_finite() { t.clamp(0.0, 1.0) } else { 0.5 };
                    let pa = grid.vertex_world(corners[a]);
                    let pb = grid.vertex_world(corners[b]);
                    let pos = pa + (pb - pa) * t;
                    let boundary = (0..3).any(|axis| {
                        corners[a][axis] == corners[b][axis]
                            && (corners[a][axis] == ext[axis].0
                                || corners[a][axis] == ext[axis].1)
                    });
                    unsafe {
                        *vertex_ptr.get().add(vertex_out + i) = MeshVertex {
                            pos: pos.to_array(),
                            key: edge_key(corners[a], corners[b]),
                            boundary,
                        };
                    }
                }

                let index_out = index_offsets[slot] as usize;
                debug_assert_eq!(index_out % 3, 0);
                for tri in 0..(ni as usize / 3) {
                    let mut out = [0u32; 3];
                    for c in 0..3 {
                        let local =
                            tables.indices[istart as usize + tri * 3 + c] as u32;
                        out[c] = base + vertex_offsets[slot] + local;
                    }
                    unsafe {
                        *triangle_ptr.get().add(index_out / 3 + tri) = out;
                    }
                }
            });

        mesh.vertices.extend_from_slice(&slab_mesh_vertices);
        mesh.triangles.extend_from_slice(&slab_triangles);
        vertex_base += slab_vertices;
    }
    mesh
}

/// Shared mutable output pointer for the generation stage; every cell
/// writes a disjoint range determined by the element scan.
#[derive(Clone, Copy)]
struct SlicePtr<T>(*mut T);
unsafe impl<T> Send for SlicePtr<T> {}
unsafe impl<T> Sync for SlicePtr<T> {}

impl<T> SlicePtr<T> {
    fn get(self) -> *mut T {
        self.0
    }
}

/// Corner configuration of the cell at `(x, y)` between two slabs, or 0
/// (never occupied) when any corner lacks field support.
#[inline]
fn cell_code(prev: &[f32], curr: &[f32], width: usize, x: usize, y: usize) -> u8 {
    let mut code = 0u16;
    for k in 0..8usize {
        let dx = k & 1;
        let dy = (k >> 1) & 1;
        let dz = (k >> 2) & 1;
        let slab = if dz == 0 { prev } else { curr };
        let v = slab[(y + dy) * width + (x + dx)];
        if v.is_nan() {
            return 0;
        }
        if v > 0.0 {
            code |= 1 << k;
        }
    }
    code as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mls::MlsProgram;
    use glam::Vec3;

    #[test]
    fn table_shape() {
        let t = tables();
        assert_eq!(t.count[0], (0, 0));
        assert_eq!(t.count[255], (0, 0));
        // One corner outside: each of the six tetrahedra contains corner 0,
        // so six triangles appear over the seven edges touching corner 0.
        assert_eq!(t.count[1], (7, 18));
        assert_eq!(t.count[254], (7, 18));
        // Starts are consistent with counts.
        for code in 0..NUM_CUBES {
            assert_eq!(
                t.start[code].0 + t.count[code].0 as u16,
                t.start[code + 1].0
            );
            assert_eq!(
                t.start[code].1 + t.count[code].1 as u16,
                t.start[code + 1].1
            );
            // Index counts are whole triangles referencing listed vertices.
            assert_eq!(t.count[code].1 % 3, 0);
            let (vstart, istart) = t.start[code];
            for i in 0..t.count[code].1 {
                let local = t.indices[(istart + i as u16) as usize];
                assert!(local < t.count[code].0, "index out of range");
            }
            // Vertex edges are unique and ascending within a code.
            let edges = &t.vertex_edges[vstart as usize..(vstart + t.count[code].0 as u16) as usize];
            assert!(edges.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn complementary_codes_match_counts() {
        let t = tables();
        for code in 0..NUM_CUBES {
            let inv = 255 - code;
            assert_eq!(t.count[code], t.count[inv]);
        }
    }

    fn sphere_splats(center: Vec3, radius: f32, n: usize) -> Vec<Splat> {
        // Deterministic spiral point distribution over the sphere.
        let mut splats = Vec::with_capacity(n);
        let golden = std::f32::consts::PI * (3.0 - 5.0f32.sqrt());
        for i in 0..n {
            let y = 1.0 - 2.0 * (i as f32 + 0.5) / n as f32;
            let r = (1.0 - y * y).sqrt();
            let theta = golden * i as f32;
            let normal = Vec3::new(r * theta.cos(), y, r * theta.sin());
            splats.push(Splat::new(center + normal * radius, normal, radius * 0.9));
        }
        splats
    }

    /// Count how many triangles reference each undirected welded edge; a
    /// closed surface has every edge shared by exactly two triangles.
    fn check_closed(mesh: &RawMesh) {
        use rustc_hash::FxHashMap;
        // Weld by key first.
        let mut key_to_id: FxHashMap<u64, u32> = FxHashMap::default();
        let mut remap = Vec::with_capacity(mesh.vertices.len());
        for v in &mesh.vertices {
            let next = key_to_id.len() as u32;
            remap.push(*key_to_id.entry(v.key).or_insert(next));
        }
        let mut edge_count: FxHashMap<(u32, u32), u32> = FxHashMap::default();
        let mut real_triangles = 0;
        for t in &mesh.triangles {
            let [a, b, c] = [remap[t[0] as usize], remap[t[1] as usize], remap[t[2] as usize]];
            if a == b || b == c || a == c {
                continue; // degenerate after welding; dropped downstream
            }
            real_triangles += 1;
            for (u, v) in [(a, b), (b, c), (c, a)] {
                let e = (u.min(v), u.max(v));
                *edge_count.entry(e).or_insert(0) += 1;
            }
        }
        assert!(real_triangles > 0);
        for (&e, &n) in &edge_count {
            assert_eq!(n, 2, "edge {:?} referenced {} times", e, n);
        }
    }

    #[test]
    fn sphere_extraction_is_closed() {
        let grid = Grid::new([0.0; 3], 0.25, [(0, 24); 3]);
        let splats = sphere_splats(Vec3::splat(3.0), 1.2, 400);
        let segments = [(0u32, splats.len() as u32)];
        let octree = SplatOctree::build(&splats, &segments, &grid);
        let program = MlsProgram::default();

        let mesh = extract(&grid, &program, &splats, &octree);
        assert!(!mesh.vertices.is_empty());
        check_closed(&mesh);

        // All vertices near the sphere surface.
        for v in &mesh.vertices {
            let d = (Vec3::from_array(v.pos) - Vec3::splat(3.0)).length();
            assert!((d - 1.2).abs() < 0.4, "vertex at distance {}", d);
        }
    }

    #[test]
    fn neighboring_bins_agree_on_shared_edge_keys() {
        let base = Grid::new([0.0; 3], 0.25, [(0, 24); 3]);
        let splats = sphere_splats(Vec3::splat(3.0), 1.2, 400);
        let segments = [(0u32, splats.len() as u32)];
        let program = MlsProgram::default();

        // Split the grid into left/right halves along x.
        let left = base.sub_grid([0, 0, 0], [12, 24, 24]);
        let right = base.sub_grid([12, 0, 0], [24, 24, 24]);
        let left_tree = SplatOctree::build(&splats, &segments, &left);
        let right_tree = SplatOctree::build(&splats, &segments, &right);
        let left_mesh = extract(&left, &program, &splats, &left_tree);
        let right_mesh = extract(&right, &program, &splats, &right_tree);

        let left_keys: std::collections::HashMap<u64, [f32; 3]> = left_mesh
            .vertices
            .iter()
            .filter(|v| v.boundary)
            .map(|v| (v.key, v.pos))
            .collect();
        let right_boundary: Vec<&MeshVertex> =
            right_mesh.vertices.iter().filter(|v| v.boundary).collect();
        assert!(!right_boundary.is_empty());

        // Every boundary vertex on the shared face must appear on the other
        // side with the same key; positions agree up to evaluation-order
        // rounding (the weld keeps whichever copy arrives first).
        let mut shared = 0;
        for v in &right_boundary {
            // Keys on the x = 12 plane only; other boundary faces are the
            // outer box.
            if (v.pos[0] - 3.0).abs() < 1e-6 {
                let other = left_keys.get(&v.key);
                assert!(other.is_some(), "key {:x} missing on the left side", v.key);
                let other = other.unwrap();
                for axis in 0..3 {
                    assert!((other[axis] - v.pos[axis]).abs() < 1e-4);
                }
                shared += 1;
            }
        }
        assert!(shared > 0, "expected shared vertices on the cut plane");
    }
}
