//! Out-of-core mesh assembly.
//!
//! Fragments arrive in any order on the root. Each one has its external
//! vertices welded against a per-chunk key map, its triangles remapped to
//! global vertex ids and unioned into a component structure, and its data
//! appended to two temp spill streams by a background writer. Finalization
//! prunes small components and streams the spill back out as one PLY file
//! per chunk.

mod namer;

pub use namer::OutputNamer;

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::bucket::ChunkId;
use crate::device::MeshFragment;
use crate::error::{Error, Result};
use crate::ply::MeshWriter;
use crate::queue::WorkerGroup;
use crate::stats;

const SPILL_MAGIC: &[u8] = b"splatmesh spill 1\n";
const SPILL_COMPLETE: &[u8] = b"complete";

const VERTICES_FILE: &str = "vertices.bin";
const TRIANGLES_FILE: &str = "triangles.bin";
const INDEX_FILE: &str = "fragments.idx";

/// Union-find over global vertex ids with size-ranked unions; roots carry
/// their component's vertex count for pruning.
struct UnionFind {
    parent: Vec<u32>,
    count: Vec<u32>,
}

impl UnionFind {
    fn new() -> Self {
        UnionFind {
            parent: Vec::new(),
            count: Vec::new(),
        }
    }

    fn with_singletons(n: u64) -> Self {
        UnionFind {
            parent: (0..n as u32).collect(),
            count: vec![1; n as usize],
        }
    }

    fn make(&mut self) -> u32 {
        let id = self.parent.len() as u32;
        self.parent.push(id);
        self.count.push(1);
        id
    }

    fn find(&mut self, mut x: u32) -> u32 {
        while self.parent[x as usize] != x {
            // Path halving.
            let grand = self.parent[self.parent[x as usize] as usize];
            self.parent[x as usize] = grand;
            x = grand;
        }
        x
    }

    fn union(&mut self, a: u32, b: u32) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra == rb {
            return;
        }
        let (big, small) = if self.count[ra as usize] >= self.count[rb as usize] {
            (ra, rb)
        } else {
            (rb, ra)
        };
        self.parent[small as usize] = big;
        self.count[big as usize] += self.count[small as usize];
    }

    fn component_size(&mut self, x: u32) -> u32 {
        let root = self.find(x);
        self.count[root as usize]
    }
}

/// Index entry for one spilled fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FragmentRecord {
    chunk: ChunkId,
    vertex_offset: u64,
    vertex_count: u64,
    triangle_offset: u64,
    triangle_count: u64,
}

struct SpillWriters {
    vertices: BufWriter<File>,
    triangles: BufWriter<File>,
}

struct WriteItem {
    vertices: Vec<[f32; 3]>,
    triangles: Vec<[u32; 3]>,
}

/// Temp spill location; files are removed on drop unless the spill has been
/// kept for resume.
struct Spill {
    dir: PathBuf,
    keep: bool,
}

impl Spill {
    fn vertices_path(&self) -> PathBuf {
        self.dir.join(VERTICES_FILE)
    }
    fn triangles_path(&self) -> PathBuf {
        self.dir.join(TRIANGLES_FILE)
    }
    fn index_path(&self) -> PathBuf {
        self.dir.join(INDEX_FILE)
    }
}

impl Drop for Spill {
    fn drop(&mut self) {
        if !self.keep {
            for path in [
                self.vertices_path(),
                self.triangles_path(),
                self.index_path(),
            ] {
                let _ = std::fs::remove_file(path);
            }
        }
    }
}

/// Mesher tuning.
#[derive(Debug, Clone)]
pub struct MesherOptions {
    /// Component vertex-count fraction below which components are pruned.
    pub prune_threshold: f64,
    /// Comment lines for the output PLY headers.
    pub comments: Vec<String>,
}

impl Default for MesherOptions {
    fn default() -> Self {
        MesherOptions {
            prune_threshold: 0.0,
            comments: Vec::new(),
        }
    }
}

/// The root-side out-of-core mesher.
pub struct OocMesher {
    options: MesherOptions,
    spill: Spill,
    writers: Arc<Mutex<SpillWriters>>,
    write_group: Option<WorkerGroup<WriteItem>>,
    union: UnionFind,
    /// External-key welding state, per chunk: bins in different chunks
    /// never share vertex keys, so a key on a chunk boundary deliberately
    /// yields one vertex per chunk.
    chunk_keys: FxHashMap<ChunkId, FxHashMap<u64, u32>>,
    records: Vec<FragmentRecord>,
    next_vertex: u64,
    next_triangle: u64,
}

/// Typical spill item size used to convert the mesh staging byte limit
/// into a write-queue depth.
const SPILL_ITEM_BYTES: usize = 1 << 20;

impl OocMesher {
    /// Open a mesher spilling into `temp_dir` (created if missing).
    /// `mem_bytes` bounds the fragment data staged between the receive
    /// thread and the spill writer.
    pub fn new(
        temp_dir: impl Into<PathBuf>,
        options: MesherOptions,
        mem_bytes: usize,
    ) -> Result<OocMesher> {
        let dir = temp_dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
        let spill = Spill {
            dir,
            keep: false,
        };
        let vertices = File::create(spill.vertices_path())
            .map_err(|e| Error::io(spill.vertices_path(), e))?;
        let triangles = File::create(spill.triangles_path())
            .map_err(|e| Error::io(spill.triangles_path(), e))?;
        let writers = Arc::new(Mutex::new(SpillWriters {
            vertices: BufWriter::new(vertices),
            triangles: BufWriter::new(triangles),
        }));

        let vertices_path = spill.vertices_path();
        let writers2 = Arc::clone(&writers);
        // A dedicated thread issues the large sequential spill writes so
        // the fragment receive path never stalls on disk. The queue depth
        // approximates the byte limit at the typical item size.
        let depth = (mem_bytes / SPILL_ITEM_BYTES).clamp(4, 256);
        let write_group = WorkerGroup::new("spill", 1, depth, move |item: WriteItem| {
            let mut w = writers2.lock();
            w.vertices
                .write_all(bytemuck::cast_slice(&item.vertices))
                .and_then(|_| w.triangles.write_all(bytemuck::cast_slice(&item.triangles)))
                .map_err(|e| Error::io(&vertices_path, e))
        });

        Ok(OocMesher {
            options,
            spill,
            writers,
            write_group: Some(write_group),
            union: UnionFind::new(),
            chunk_keys: FxHashMap::default(),
            records: Vec::new(),
            next_vertex: 0,
            next_triangle: 0,
        })
    }

    /// Total vertices welded so far.
    pub fn num_vertices(&self) -> u64 {
        self.next_vertex
    }

    /// Ingest one fragment: weld externals, union triangle components,
    /// spill the new vertices and remapped triangles.
    pub fn add_fragment(&mut self, fragment: MeshFragment) -> Result<()> {
        let key_map = self.chunk_keys.entry(fragment.chunk).or_default();

        let num_internal = fragment.num_internal as usize;
        let mut global = Vec::with_capacity(fragment.vertices.len());
        let mut fresh = Vec::with_capacity(fragment.vertices.len());
        for pos in &fragment.vertices[..num_internal] {
            let id = self.union.make();
            fresh.push(*pos);
            global.push(id);
        }
        for (pos, key) in fragment.vertices[num_internal..]
            .iter()
            .zip(&fragment.external_keys)
        {
            let id = match key_map.entry(*key) {
                std::collections::hash_map::Entry::Occupied(e) => *e.get(),
                std::collections::hash_map::Entry::Vacant(e) => {
                    let id = self.union.make();
                    fresh.push(*pos);
                    e.insert(id);
                    id
                }
            };
            global.push(id);
        }

        let mut triangles = Vec::with_capacity(fragment.triangles.len());
        for t in &fragment.triangles {
            let t = [
                global[t[0] as usize],
                global[t[1] as usize],
                global[t[2] as usize],
            ];
            self.union.union(t[0], t[1]);
            self.union.union(t[0], t[2]);
            triangles.push(t);
        }

        let record = FragmentRecord {
            chunk: fragment.chunk,
            vertex_offset: self.next_vertex,
            vertex_count: fresh.len() as u64,
            triangle_offset: self.next_triangle,
            triangle_count: triangles.len() as u64,
        };
        self.next_vertex += record.vertex_count;
        self.next_triangle += record.triangle_count;
        self.records.push(record);
        stats::counter("mesher.fragments").add(1);

        let group = self
            .write_group
            .as_ref()
            .expect("mesher already finalized");
        if !group.push(WriteItem {
            vertices: fresh,
            triangles,
        }) {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    /// Flush the spill, seal the index sidecar, prune and write the output
    /// files. Returns the number of files written. With `keep_spill` the
    /// temp files survive for a later resume.
    pub fn finalize(mut self, namer: &OutputNamer, keep_spill: bool) -> Result<usize> {
        let _t = stats::Timed::new("mesher.finalize");
        let group = self.write_group.take().expect("mesher already finalized");
        group.stop()?;
        {
            let mut w = self.writers.lock();
            w.vertices
                .flush()
                .and_then(|_| w.triangles.flush())
                .map_err(|e| Error::io(self.spill.vertices_path(), e))?;
        }
        write_index(
            &self.spill.index_path(),
            &self.records,
            self.next_vertex,
            self.next_triangle,
        )?;

        let files = write_output(
            &self.spill,
            &self.records,
            &mut self.union,
            self.next_vertex,
            &self.options,
            namer,
        )?;
        if keep_spill {
            self.spill.keep = true;
        }
        Ok(files)
    }

    /// Resume a previous run from its sealed spill directory, skipping
    /// straight to finalization. The spill is removed on success.
    pub fn resume(
        spill_dir: impl Into<PathBuf>,
        options: MesherOptions,
        namer: &OutputNamer,
    ) -> Result<usize> {
        let _t = stats::Timed::new("mesher.resume");
        let spill = Spill {
            dir: spill_dir.into(),
            keep: true, // only delete once the resume succeeds
        };
        let (records, total_vertices, total_triangles) = read_index(&spill.index_path())?;

        // Rebuild the component structure by replaying the triangle spill.
        let mut union = UnionFind::with_singletons(total_vertices);
        {
            let path = spill.triangles_path();
            let file = File::open(&path).map_err(|e| Error::io(&path, e))?;
            let mut reader = BufReader::new(file);
            let mut buf = [0u8; 12];
            for _ in 0..total_triangles {
                reader
                    .read_exact(&mut buf)
                    .map_err(|e| Error::io(&path, e))?;
                let t: [u32; 3] = bytemuck::pod_read_unaligned(&buf);
                union.union(t[0], t[1]);
                union.union(t[0], t[2]);
            }
        }

        let mut spill = spill;
        let files = write_output(&spill, &records, &mut union, total_vertices, &options, namer)?;
        spill.keep = false;
        Ok(files)
    }
}

fn write_index(
    path: &Path,
    records: &[FragmentRecord],
    total_vertices: u64,
    total_triangles: u64,
) -> Result<()> {
    let err = |e| Error::io(path, e);
    let file = File::create(path).map_err(err)?;
    let mut out = BufWriter::new(file);
    out.write_all(SPILL_MAGIC).map_err(err)?;
    out.write_u32::<LittleEndian>(records.len() as u32)
        .map_err(err)?;
    for rec in records {
        out.write_u32::<LittleEndian>(rec.chunk.gen).map_err(err)?;
        for c in rec.chunk.coords {
            out.write_u32::<LittleEndian>(c).map_err(err)?;
        }
        for v in [
            rec.vertex_offset,
            rec.vertex_count,
            rec.triangle_offset,
            rec.triangle_count,
        ] {
            out.write_u64::<LittleEndian>(v).map_err(err)?;
        }
    }
    out.write_all(SPILL_COMPLETE).map_err(err)?;
    out.write_u64::<LittleEndian>(total_vertices).map_err(err)?;
    out.write_u64::<LittleEndian>(total_triangles).map_err(err)?;
    out.flush().map_err(err)
}

fn read_index(path: &Path) -> Result<(Vec<FragmentRecord>, u64, u64)> {
    let corrupt = |msg: &str| {
        Error::io(
            path,
            std::io::Error::new(std::io::ErrorKind::InvalidData, msg.to_owned()),
        )
    };
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    let mut r = BufReader::new(file);

    let mut magic = vec![0u8; SPILL_MAGIC.len()];
    r.read_exact(&mut magic)
        .map_err(|_| corrupt("truncated spill index"))?;
    if magic != SPILL_MAGIC {
        return Err(corrupt("not a spill index"));
    }
    let count = r
        .read_u32::<LittleEndian>()
        .map_err(|_| corrupt("truncated spill index"))?;
    let mut records = Vec::with_capacity(count as usize);
    let mut expected_vertex = 0u64;
    let mut expected_triangle = 0u64;
    for _ in 0..count {
        let gen = r
            .read_u32::<LittleEndian>()
            .map_err(|_| corrupt("truncated record"))?;
        let mut coords = [0u32; 3];
        for c in coords.iter_mut() {
            *c = r
                .read_u32::<LittleEndian>()
                .map_err(|_| corrupt("truncated record"))?;
        }
        let mut vals = [0u64; 4];
        for v in vals.iter_mut() {
            *v = r
                .read_u64::<LittleEndian>()
                .map_err(|_| corrupt("truncated record"))?;
        }
        let rec = FragmentRecord {
            chunk: ChunkId { gen, coords },
            vertex_offset: vals[0],
            vertex_count: vals[1],
            triangle_offset: vals[2],
            triangle_count: vals[3],
        };
        if rec.vertex_offset != expected_vertex || rec.triangle_offset != expected_triangle {
            return Err(corrupt("spill index records are not contiguous"));
        }
        expected_vertex += rec.vertex_count;
        expected_triangle += rec.triangle_count;
        records.push(rec);
    }
    let mut marker = vec![0u8; SPILL_COMPLETE.len()];
    r.read_exact(&mut marker)
        .map_err(|_| corrupt("spill index has no completion marker"))?;
    if marker != SPILL_COMPLETE {
        return Err(corrupt("spill index has no completion marker"));
    }
    let total_vertices = r
        .read_u64::<LittleEndian>()
        .map_err(|_| corrupt("truncated totals"))?;
    let total_triangles = r
        .read_u64::<LittleEndian>()
        .map_err(|_| corrupt("truncated totals"))?;
    if total_vertices != expected_vertex || total_triangles != expected_triangle {
        return Err(corrupt("spill index totals do not match records"));
    }
    Ok((records, total_vertices, total_triangles))
}

/// Stream the spill back out, chunk by chunk in sorted chunk order,
/// pruning components below the threshold.
fn write_output(
    spill: &Spill,
    records: &[FragmentRecord],
    union: &mut UnionFind,
    total_vertices: u64,
    options: &MesherOptions,
    namer: &OutputNamer,
) -> Result<usize> {
    let threshold = (options.prune_threshold * total_vertices as f64).floor() as u64;

    let mut by_chunk: BTreeMap<ChunkId, Vec<&FragmentRecord>> = BTreeMap::new();
    for rec in records {
        by_chunk.entry(rec.chunk).or_default().push(rec);
    }

    let vertices_path = spill.vertices_path();
    let triangles_path = spill.triangles_path();
    let vfile = File::open(&vertices_path).map_err(|e| Error::io(&vertices_path, e))?;
    let tfile = File::open(&triangles_path).map_err(|e| Error::io(&triangles_path, e))?;
    let mut vreader = BufReader::new(vfile);
    let mut treader = BufReader::new(tfile);

    // Per-chunk local ids; entries are only valid for the chunk currently
    // being written.
    let mut local_id = vec![0u32; total_vertices as usize];

    let mut files_written = 0usize;
    let mut pruned_triangles = 0u64;
    for (chunk, recs) in &by_chunk {
        // Count pass.
        let mut num_vertices = 0u64;
        for rec in recs {
            for id in rec.vertex_offset..rec.vertex_offset + rec.vertex_count {
                if u64::from(union.component_size(id as u32)) >= threshold {
                    num_vertices += 1;
                }
            }
        }
        let mut num_triangles = 0u64;
        for &rec in recs {
            for_each_triangle(&mut treader, &triangles_path, rec, |t| {
                if u64::from(union.component_size(t[0])) >= threshold {
                    num_triangles += 1;
                } else {
                    pruned_triangles += 1;
                }
                Ok(())
            })?;
        }
        if num_vertices == 0 && num_triangles == 0 {
            continue;
        }

        let path = namer.path(*chunk);
        let mut writer = MeshWriter::create(&path, num_vertices, num_triangles, &options.comments)?;

        // Vertex pass: assign chunk-local ids in stream order.
        let mut next_local = 0u32;
        for rec in recs {
            vreader
                .seek(SeekFrom::Start(rec.vertex_offset * 12))
                .map_err(|e| Error::io(&vertices_path, e))?;
            let mut buf = [0u8; 12];
            for id in rec.vertex_offset..rec.vertex_offset + rec.vertex_count {
                vreader
                    .read_exact(&mut buf)
                    .map_err(|e| Error::io(&vertices_path, e))?;
                if u64::from(union.component_size(id as u32)) >= threshold {
                    local_id[id as usize] = next_local;
                    next_local += 1;
                    writer.write_vertex(bytemuck::pod_read_unaligned(&buf))?;
                }
            }
        }

        // Triangle pass.
        for &rec in recs {
            for_each_triangle(&mut treader, &triangles_path, rec, |t| {
                if u64::from(union.component_size(t[0])) >= threshold {
                    writer.write_triangle([
                        local_id[t[0] as usize],
                        local_id[t[1] as usize],
                        local_id[t[2] as usize],
                    ])?;
                }
                Ok(())
            })?;
        }
        writer.finish()?;
        files_written += 1;
        log::info!("wrote {}", path.display());
    }
    stats::counter("mesher.pruned_triangles").add(pruned_triangles);
    stats::counter("mesher.files").add(files_written as u64);
    Ok(files_written)
}

fn for_each_triangle<F>(
    reader: &mut BufReader<File>,
    path: &Path,
    rec: &FragmentRecord,
    mut f: F,
) -> Result<()>
where
    F: FnMut([u32; 3]) -> Result<()>,
{
    reader
        .seek(SeekFrom::Start(rec.triangle_offset * 12))
        .map_err(|e| Error::io(path, e))?;
    let mut buf = [0u8; 12];
    for _ in 0..rec.triangle_count {
        reader.read_exact(&mut buf).map_err(|e| Error::io(path, e))?;
        f(bytemuck::pod_read_unaligned(&buf))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(
        chunk: ChunkId,
        internal: &[[f32; 3]],
        external: &[([f32; 3], u64)],
        triangles: &[[u32; 3]],
    ) -> MeshFragment {
        let mut vertices: Vec<[f32; 3]> = internal.to_vec();
        vertices.extend(external.iter().map(|&(p, _)| p));
        MeshFragment {
            vertices,
            num_internal: internal.len() as u32,
            external_keys: external.iter().map(|&(_, k)| k).collect(),
            triangles: triangles.to_vec(),
            chunk,
        }
    }

    #[test]
    fn union_find_sizes() {
        let mut uf = UnionFind::new();
        for _ in 0..6 {
            uf.make();
        }
        uf.union(0, 1);
        uf.union(2, 3);
        uf.union(0, 3);
        assert_eq!(uf.component_size(1), 4);
        assert_eq!(uf.component_size(4), 1);
        uf.union(4, 5);
        assert_eq!(uf.component_size(5), 2);
    }

    #[test]
    fn welds_external_vertices_across_fragments() {
        let dir = tempfile::tempdir().unwrap();
        let mut mesher = OocMesher::new(dir.path().join("spill"), MesherOptions::default(), 1 << 22).unwrap();

        // Two fragments sharing an edge via keys 100 and 101.
        let a = fragment(
            ChunkId::default(),
            &[[0.0, 0.0, 0.0]],
            &[([1.0, 0.0, 0.0], 100), ([1.0, 1.0, 0.0], 101)],
            &[[0, 1, 2]],
        );
        let b = fragment(
            ChunkId::default(),
            &[[2.0, 0.0, 0.0]],
            &[([1.0, 0.0, 0.0], 100), ([1.0, 1.0, 0.0], 101)],
            &[[0, 1, 2]],
        );
        mesher.add_fragment(a).unwrap();
        mesher.add_fragment(b).unwrap();
        assert_eq!(mesher.num_vertices(), 4); // not 6

        let out = dir.path().join("out.ply");
        let namer = OutputNamer::Single(out.clone());
        assert_eq!(mesher.finalize(&namer, false).unwrap(), 1);

        let (vertices, triangles) = crate::ply::read_mesh(&out).unwrap();
        assert_eq!(vertices.len(), 4);
        assert_eq!(triangles.len(), 2);
        // Exactly one copy of each shared vertex.
        assert_eq!(
            vertices.iter().filter(|v| **v == [1.0, 0.0, 0.0]).count(),
            1
        );
        // Both triangles reference the same welded pair.
        let shared: std::collections::HashSet<u32> = triangles[0]
            .iter()
            .copied()
            .collect::<std::collections::HashSet<_>>()
            .intersection(&triangles[1].iter().copied().collect())
            .copied()
            .collect();
        assert_eq!(shared.len(), 2);
    }

    #[test]
    fn prunes_small_components() {
        let dir = tempfile::tempdir().unwrap();
        let options = MesherOptions {
            prune_threshold: 0.5,
            ..Default::default()
        };
        let mut mesher = OocMesher::new(dir.path().join("spill"), options, 1 << 22).unwrap();

        // Big component: 6 vertices; small component: 3.
        let big = fragment(
            ChunkId::default(),
            &[
                [0.0, 0.0, 0.0],
                [1.0, 0.0, 0.0],
                [0.0, 1.0, 0.0],
                [1.0, 1.0, 0.0],
                [2.0, 0.0, 0.0],
                [2.0, 1.0, 0.0],
            ],
            &[],
            &[[0, 1, 2], [1, 3, 2], [1, 4, 3], [4, 5, 3]],
        );
        let small = fragment(
            ChunkId::default(),
            &[[9.0, 0.0, 0.0], [10.0, 0.0, 0.0], [9.0, 1.0, 0.0]],
            &[],
            &[[0, 1, 2]],
        );
        mesher.add_fragment(big).unwrap();
        mesher.add_fragment(small).unwrap();

        let out = dir.path().join("out.ply");
        mesher
            .finalize(&OutputNamer::Single(out.clone()), false)
            .unwrap();
        let (vertices, triangles) = crate::ply::read_mesh(&out).unwrap();
        assert_eq!(vertices.len(), 6);
        assert_eq!(triangles.len(), 4);
        assert!(vertices.iter().all(|v| v[0] < 9.0));
    }

    #[test]
    fn chunks_write_separate_files_without_cross_welding() {
        let dir = tempfile::tempdir().unwrap();
        let mut mesher = OocMesher::new(dir.path().join("spill"), MesherOptions::default(), 1 << 22).unwrap();

        let c0 = ChunkId {
            gen: 0,
            coords: [0, 0, 0],
        };
        let c1 = ChunkId {
            gen: 0,
            coords: [1, 0, 0],
        };
        // The same key bit pattern in two chunks must stay two vertices.
        let a = fragment(c0, &[[0.0, 0.0, 0.0]], &[([1.0, 0.0, 0.0], 7)], &[[0, 1, 1]]);
        let b = fragment(c1, &[[2.0, 0.0, 0.0]], &[([1.0, 0.0, 0.0], 7)], &[[0, 1, 1]]);
        mesher.add_fragment(a).unwrap();
        mesher.add_fragment(b).unwrap();
        assert_eq!(mesher.num_vertices(), 4);

        let namer = OutputNamer::Chunked(dir.path().join("mesh"));
        assert_eq!(mesher.finalize(&namer, false).unwrap(), 2);
        assert!(dir.path().join("mesh_0000_0000_0000_0000.ply").exists());
        assert!(dir.path().join("mesh_0000_0001_0000_0000.ply").exists());
    }

    #[test]
    fn resume_reproduces_identical_output() {
        let dir = tempfile::tempdir().unwrap();
        let spill = dir.path().join("spill");
        let mut mesher = OocMesher::new(&spill, MesherOptions::default(), 1 << 22).unwrap();
        for i in 0..10u32 {
            let base = i as f32;
            mesher
                .add_fragment(fragment(
                    ChunkId::default(),
                    &[[base, 0.0, 0.0], [base + 0.5, 0.0, 0.0]],
                    &[([base, 1.0, 0.0], 1000 + i as u64)],
                    &[[0, 1, 2]],
                ))
                .unwrap();
        }

        let first = dir.path().join("first.ply");
        mesher
            .finalize(&OutputNamer::Single(first.clone()), true)
            .unwrap();

        let second = dir.path().join("second.ply");
        OocMesher::resume(
            &spill,
            MesherOptions::default(),
            &OutputNamer::Single(second.clone()),
        )
        .unwrap();

        assert_eq!(
            std::fs::read(&first).unwrap(),
            std::fs::read(&second).unwrap()
        );
        // The spill is removed after a successful resume.
        assert!(!spill.join(VERTICES_FILE).exists());
    }

    #[test]
    fn resume_rejects_unsealed_spill() {
        let dir = tempfile::tempdir().unwrap();
        let spill = dir.path().join("spill");
        std::fs::create_dir_all(&spill).unwrap();
        std::fs::write(spill.join(VERTICES_FILE), b"").unwrap();
        std::fs::write(spill.join(TRIANGLES_FILE), b"").unwrap();
        // Index present but truncated before the completion marker.
        let mut index = Vec::new();
        index.extend_from_slice(SPILL_MAGIC);
        index.extend_from_slice(&0u32.to_le_bytes());
        std::fs::write(spill.join(INDEX_FILE), index).unwrap();

        let err = OocMesher::resume(
            &spill,
            MesherOptions::default(),
            &OutputNamer::Single(dir.path().join("o.ply")),
        );
        assert!(err.is_err());
    }

    #[test]
    fn dropping_without_finalize_cleans_the_spill() {
        let dir = tempfile::tempdir().unwrap();
        let spill = dir.path().join("spill");
        {
            let mut mesher = OocMesher::new(&spill, MesherOptions::default(), 1 << 22).unwrap();
            mesher
                .add_fragment(fragment(
                    ChunkId::default(),
                    &[[0.0; 3], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
                    &[],
                    &[[0, 1, 2]],
                ))
                .unwrap();
            // Dropped mid-run, as an abort would.
        }
        assert!(!spill.join(VERTICES_FILE).exists());
        assert!(!spill.join(INDEX_FILE).exists());
    }
}
