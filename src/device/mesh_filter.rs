//! Post-extraction mesh filtering: weld duplicate edge vertices, sort the
//! result into an `[internal | external]` layout and drop degenerate
//! triangles.

use rustc_hash::FxHashMap;

use crate::bucket::ChunkId;

use super::marching::RawMesh;

/// One bin's mesh output, ready for transport to the assembler.
///
/// Vertices are laid out `[internal | external]`; only the external suffix
/// may be merged with neighboring bins' fragments, keyed by the canonical
/// grid-edge keys in `external_keys` (parallel to the suffix).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeshFragment {
    pub vertices: Vec<[f32; 3]>,
    pub num_internal: u32,
    pub external_keys: Vec<u64>,
    pub triangles: Vec<[u32; 3]>,
    pub chunk: ChunkId,
}

impl MeshFragment {
    pub fn num_vertices(&self) -> usize {
        self.vertices.len()
    }

    pub fn num_external(&self) -> usize {
        self.external_keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triangles.is_empty()
    }

    /// Bytes of the fragment's wire form; used to size gather allocations.
    pub fn host_bytes(&self) -> usize {
        crate::serialize::fragment_bytes(self)
    }
}

/// Weld a raw per-cell mesh into a fragment for `chunk`.
pub fn filter(mesh: &RawMesh, chunk: ChunkId) -> MeshFragment {
    // Weld: one vertex per distinct edge key, first emission wins.
    let mut key_to_welded: FxHashMap<u64, u32> = FxHashMap::default();
    let mut welded_pos: Vec<[f32; 3]> = Vec::new();
    let mut welded_key: Vec<u64> = Vec::new();
    let mut welded_ext: Vec<bool> = Vec::new();
    let mut remap = Vec::with_capacity(mesh.vertices.len());
    for v in &mesh.vertices {
        let id = *key_to_welded.entry(v.key).or_insert_with(|| {
            welded_pos.push(v.pos);
            welded_key.push(v.key);
            welded_ext.push(v.boundary);
            (welded_pos.len() - 1) as u32
        });
        remap.push(id);
    }

    // Partition: internal vertices first, externals after, both keeping
    // their welded order.
    let num_internal = welded_ext.iter().filter(|&&e| !e).count() as u32;
    let mut final_id = vec![0u32; welded_pos.len()];
    let mut next_internal = 0u32;
    let mut next_external = num_internal;
    for (i, &ext) in welded_ext.iter().enumerate() {
        if ext {
            final_id[i] = next_external;
            next_external += 1;
        } else {
            final_id[i] = next_internal;
            next_internal += 1;
        }
    }

    let mut vertices = vec![[0.0f32; 3]; welded_pos.len()];
    let mut external_keys = vec![0u64; welded_pos.len() - num_internal as usize];
    for (i, pos) in welded_pos.iter().enumerate() {
        vertices[final_id[i] as usize] = *pos;
        if welded_ext[i] {
            external_keys[(final_id[i] - num_internal) as usize] = welded_key[i];
        }
    }

    let mut triangles = Vec::with_capacity(mesh.triangles.len());
    for t in &mesh.triangles {
        let a = final_id[remap[t[0] as usize] as usize];
        let b = final_id[remap[t[1] as usize] as usize];
        let c = final_id[remap[t[2] as usize] as usize];
        if a == b && b == c {
            continue; // fully collapsed by welding
        }
        triangles.push([a, b, c]);
    }

    MeshFragment {
        vertices,
        num_internal,
        external_keys,
        triangles,
        chunk,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::marching::{MeshVertex, RawMesh};

    fn vx(pos: [f32; 3], key: u64, boundary: bool) -> MeshVertex {
        MeshVertex { pos, key, boundary }
    }

    #[test]
    fn welds_by_key_and_partitions() {
        let mesh = RawMesh {
            vertices: vec![
                vx([0.0, 0.0, 0.0], 10, false),
                vx([1.0, 0.0, 0.0], 20, true),
                vx([0.0, 1.0, 0.0], 30, false),
                // duplicate emission of key 20 from the neighboring cell
                vx([1.0, 0.0, 0.0], 20, true),
                vx([1.0, 1.0, 0.0], 40, true),
            ],
            triangles: vec![[0, 1, 2], [3, 4, 2]],
        };
        let frag = filter(&mesh, ChunkId::default());

        assert_eq!(frag.num_vertices(), 4);
        assert_eq!(frag.num_internal, 2);
        assert_eq!(frag.external_keys, vec![20, 40]);
        // Internal prefix, external suffix.
        assert_eq!(frag.vertices[0], [0.0, 0.0, 0.0]);
        assert_eq!(frag.vertices[1], [0.0, 1.0, 0.0]);
        assert_eq!(frag.vertices[2], [1.0, 0.0, 0.0]);
        assert_eq!(frag.vertices[3], [1.0, 1.0, 0.0]);
        // Both triangles reference the single welded copy of key 20.
        assert_eq!(frag.triangles, vec![[0, 2, 1], [2, 3, 1]]);
    }

    #[test]
    fn drops_fully_collapsed_triangles() {
        let mesh = RawMesh {
            vertices: vec![
                vx([0.5, 0.0, 0.0], 7, false),
                vx([0.5, 0.0, 0.0], 7, false),
                vx([0.5, 0.0, 0.0], 7, false),
                vx([0.0, 0.5, 0.0], 8, false),
            ],
            triangles: vec![[0, 1, 2], [0, 1, 3]],
        };
        let frag = filter(&mesh, ChunkId::default());
        assert_eq!(frag.num_vertices(), 2);
        // The all-identical triangle goes; the two-identical one stays.
        assert_eq!(frag.triangles.len(), 1);
        assert_eq!(frag.triangles[0], [0, 0, 1]);
    }

    #[test]
    fn empty_mesh_gives_empty_fragment() {
        let frag = filter(&RawMesh::default(), ChunkId::default());
        assert!(frag.is_empty());
        assert_eq!(frag.num_vertices(), 0);
        assert_eq!(frag.num_internal, 0);
    }
}
