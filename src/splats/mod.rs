//! Splat sets: stores of splats supporting streaming enumeration and
//! bucket-footprint ("blob") iteration.
//!
//! A splat set is an ordered collection of splats with stable 64-bit ids.
//! Iteration never yields non-finite splats; blob counts reflect that
//! filtering. The file-backed set streams raw bytes through a small pool of
//! large buffers filled by a dedicated reader thread.

mod blob;

pub use blob::IndexedSplats;

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::grid::Grid;
use crate::ply::SplatFile;
use crate::queue::WorkQueue;
use crate::splat::{make_splat_id, split_splat_id, Splat, SplatId, SPLAT_ID_MASK};

/// Half-open range of splat ids.
pub type IdRange = (SplatId, SplatId);

/// Range covering every possible splat id.
pub const RANGE_ALL: IdRange = (0, u64::MAX);

/// Default byte size of one raw read buffer for file-backed streaming.
pub const READ_BUFFER_SIZE: usize = 128 * 1024 * 1024;

/// Number of pooled read buffers per stream.
const READ_BUFFER_COUNT: usize = 2;

/// Metadata for a maximal run of consecutive splat ids whose bounding boxes
/// cover the same inclusive bucket range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobInfo {
    /// First splat id in the blob.
    pub first_splat: SplatId,
    /// One past the last splat id in the blob.
    pub last_splat: SplatId,
    /// Inclusive lower corner of the bucket range.
    pub lower: [i64; 3],
    /// Inclusive upper corner of the bucket range.
    pub upper: [i64; 3],
}

impl BlobInfo {
    #[inline]
    pub fn num_splats(&self) -> u64 {
        self.last_splat - self.first_splat
    }
}

/// Pull-based stream of finite splats with their ids.
pub trait SplatStream: Send {
    fn next(&mut self) -> Result<Option<(SplatId, Splat)>>;
}

/// Pull-based stream of blobs for one `(grid, bucket_size)` request.
pub trait BlobStream: Send {
    fn next(&mut self) -> Result<Option<BlobInfo>>;
}

/// Common interface of splat stores.
pub trait SplatSet: Send + Sync {
    /// Upper bound on the ids enumerated by [`splat_stream`], suitable for
    /// memory allocation. Includes non-finite splats.
    ///
    /// [`splat_stream`]: SplatSet::splat_stream
    fn max_splats(&self) -> u64;

    /// Stream the finite splats of an ordered list of id ranges.
    fn splat_stream_ranges(&self, ranges: Vec<IdRange>) -> Box<dyn SplatStream + '_>;

    /// Stream every finite splat in the set.
    fn splat_stream(&self) -> Box<dyn SplatStream + '_> {
        self.splat_stream_ranges(vec![RANGE_ALL])
    }

    /// Enumerate blobs for buckets of `bucket_size` cells on `grid`. Bucket
    /// coordinates are relative to the grid's lower extent.
    fn blob_stream(&self, grid: &Grid, bucket_size: u64) -> Box<dyn BlobStream + '_>;
}

/// Fallback blob stream: one blob per finite splat, computed on the fly.
struct PerSplatBlobStream<'a> {
    splats: Box<dyn SplatStream + 'a>,
    grid: Grid,
    bucket_size: u64,
}

impl BlobStream for PerSplatBlobStream<'_> {
    fn next(&mut self) -> Result<Option<BlobInfo>> {
        Ok(self.splats.next()?.map(|(id, splat)| {
            let (lower, upper) = self.grid.splat_buckets(&splat, self.bucket_size);
            BlobInfo {
                first_splat: id,
                last_splat: id + 1,
                lower,
                upper,
            }
        }))
    }
}

/// In-memory splat set; ids are vector positions. Mainly used by tests and
/// small-input paths.
#[derive(Default)]
pub struct VectorSet {
    splats: Vec<Splat>,
}

impl VectorSet {
    pub fn from_splats(splats: Vec<Splat>) -> Self {
        VectorSet { splats }
    }

    pub fn push(&mut self, splat: Splat) {
        self.splats.push(splat);
    }
}

struct VectorSplatStream<'a> {
    splats: &'a [Splat],
    ranges: Vec<IdRange>,
    range_idx: usize,
    cur: u64,
}

impl SplatStream for VectorSplatStream<'_> {
    fn next(&mut self) -> Result<Option<(SplatId, Splat)>> {
        while self.range_idx < self.ranges.len() {
            let end = self.ranges[self.range_idx].1.min(self.splats.len() as u64);
            while self.cur < end {
                let id = self.cur;
                self.cur += 1;
                let splat = self.splats[id as usize];
                if splat.is_finite() {
                    return Ok(Some((id, splat)));
                }
            }
            self.range_idx += 1;
            if self.range_idx < self.ranges.len() {
                self.cur = self.ranges[self.range_idx].0;
            }
        }
        Ok(None)
    }
}

impl SplatSet for VectorSet {
    fn max_splats(&self) -> u64 {
        self.splats.len() as u64
    }

    fn splat_stream_ranges(&self, ranges: Vec<IdRange>) -> Box<dyn SplatStream + '_> {
        let cur = ranges.first().map_or(0, |r| r.0);
        Box::new(VectorSplatStream {
            splats: &self.splats,
            ranges,
            range_idx: 0,
            cur,
        })
    }

    fn blob_stream(&self, grid: &Grid, bucket_size: u64) -> Box<dyn BlobStream + '_> {
        assert!(bucket_size > 0);
        Box::new(PerSplatBlobStream {
            splats: self.splat_stream(),
            grid: *grid,
            bucket_size,
        })
    }
}

/// One filled read buffer travelling from the reader thread to the stream.
struct RawChunk {
    first: SplatId,
    count: usize,
    file: usize,
    buffer: Vec<u8>,
}

/// Splat set backed by one or more on-disk PLY files. Splat ids encode the
/// file index in their upper bits.
pub struct FileSet {
    files: Arc<Vec<SplatFile>>,
    total: u64,
    buffer_size: usize,
    radius_scale: f32,
}

impl FileSet {
    pub fn new() -> Self {
        FileSet {
            files: Arc::new(Vec::new()),
            total: 0,
            buffer_size: READ_BUFFER_SIZE,
            radius_scale: 1.0,
        }
    }

    /// Shrink the pooled read buffers (tests and tiny inputs).
    pub fn with_buffer_size(mut self, bytes: usize) -> Self {
        self.buffer_size = bytes;
        self
    }

    /// Multiply every streamed splat's radius. Applied at ingestion so
    /// bucket footprints, the device octree and the field kernel all see
    /// the same support.
    pub fn with_radius_scale(mut self, scale: f32) -> Self {
        assert!(scale.is_finite() && scale > 0.0);
        self.radius_scale = scale;
        self
    }

    /// Append a file to the set. Must not be called while a stream exists.
    pub fn add_file(&mut self, file: SplatFile) -> Result<()> {
        if file.size() > SPLAT_ID_MASK {
            return Err(Error::InvalidOption(format!(
                "{} has too many vertices for one file",
                file.path().display()
            )));
        }
        self.total += file.size();
        Arc::get_mut(&mut self.files)
            .expect("cannot add files while a stream is active")
            .push(file);
        Ok(())
    }

    pub fn num_files(&self) -> usize {
        self.files.len()
    }
}

impl Default for FileSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Reader-thread body: walk the ranges, fill pooled buffers with large raw
/// reads and hand them downstream.
fn read_ranges(
    files: Arc<Vec<SplatFile>>,
    ranges: Vec<IdRange>,
    pool: Arc<WorkQueue<Vec<u8>>>,
    out: Arc<WorkQueue<Result<RawChunk>>>,
    buffer_size: usize,
) {
    let mut handle: Option<(usize, crate::ply::SplatFileHandle<'_>)> = None;
    for &(range_first, range_last) in &ranges {
        let mut first = range_first;
        while first < range_last {
            let (file_id, start) = split_splat_id(first);
            if file_id >= files.len() {
                break;
            }
            let file = &files[file_id];
            let max_splats = (buffer_size / file.vertex_size()) as u64;
            if max_splats == 0 {
                let _ = out.push(Err(Error::InvalidOption(format!(
                    "read buffer smaller than one vertex of {}",
                    file.path().display()
                ))));
                return;
            }
            let file_size = file.size();
            let mut end = (start + max_splats).min(file_size);
            if split_splat_id(range_last).0 == file_id {
                end = end.min(range_last & SPLAT_ID_MASK);
            }

            if start < end {
                let need_new = handle.as_ref().map_or(true, |(id, _)| *id != file_id);
                if need_new {
                    handle = None; // close the previous handle first
                    match file.handle() {
                        Ok(h) => handle = Some((file_id, h)),
                        Err(e) => {
                            let _ = out.push(Err(e));
                            return;
                        }
                    }
                }
                let Some(mut buffer) = pool.pop() else {
                    return; // consumer went away
                };
                let bytes = (end - start) as usize * file.vertex_size();
                buffer.resize(bytes, 0);
                let (_, h) = handle.as_mut().expect("handle was just opened");
                if let Err(e) = h.read_raw(start, end, &mut buffer) {
                    let _ = out.push(Err(e));
                    return;
                }
                let chunk = RawChunk {
                    first,
                    count: (end - start) as usize,
                    file: file_id,
                    buffer,
                };
                if !out.push(Ok(chunk)) {
                    return;
                }
                first += end - start;
            }
            if end == file_size {
                first = make_splat_id(file_id + 1, 0);
            }
        }
    }
    out.stop();
}

struct FileSplatStream {
    files: Arc<Vec<SplatFile>>,
    pool: Arc<WorkQueue<Vec<u8>>>,
    chunks: Arc<WorkQueue<Result<RawChunk>>>,
    reader: Option<std::thread::JoinHandle<()>>,
    current: Option<RawChunk>,
    cursor: usize,
    radius_scale: f32,
}

impl SplatStream for FileSplatStream {
    fn next(&mut self) -> Result<Option<(SplatId, Splat)>> {
        loop {
            if let Some(chunk) = &self.current {
                if self.cursor < chunk.count {
                    let idx = self.cursor;
                    self.cursor += 1;
                    let mut splat = self.files[chunk.file].decode(&chunk.buffer, idx);
                    splat.radius *= self.radius_scale;
                    if splat.is_finite() {
                        return Ok(Some((chunk.first + idx as u64, splat)));
                    }
                    continue;
                }
                // Recycle the exhausted buffer.
                let chunk = self.current.take().expect("chunk checked above");
                self.pool.push(chunk.buffer);
            }
            match self.chunks.pop() {
                Some(Ok(chunk)) => {
                    self.current = Some(chunk);
                    self.cursor = 0;
                }
                Some(Err(e)) => return Err(e),
                None => return Ok(None),
            }
        }
    }
}

impl Drop for FileSplatStream {
    fn drop(&mut self) {
        // Unblock the reader whether it is pushing chunks or waiting for a
        // pooled buffer, then reap it.
        self.chunks.cancel();
        self.pool.cancel();
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

impl SplatSet for FileSet {
    fn max_splats(&self) -> u64 {
        self.total
    }

    fn splat_stream_ranges(&self, ranges: Vec<IdRange>) -> Box<dyn SplatStream + '_> {
        let pool = Arc::new(WorkQueue::new(READ_BUFFER_COUNT + 1));
        // Cap pool buffers at what the largest file could need so tiny
        // inputs do not pay for full-size buffers.
        let max_bytes = self
            .files
            .iter()
            .map(|f| f.size() as usize * f.vertex_size())
            .max()
            .unwrap_or(0)
            .min(self.buffer_size)
            .max(64);
        for _ in 0..READ_BUFFER_COUNT {
            pool.push(Vec::with_capacity(max_bytes));
        }
        let chunks = Arc::new(WorkQueue::new(READ_BUFFER_COUNT));

        let files = Arc::clone(&self.files);
        let pool2 = Arc::clone(&pool);
        let chunks2 = Arc::clone(&chunks);
        let buffer_size = max_bytes;
        let reader = std::thread::Builder::new()
            .name("splat-reader".to_owned())
            .spawn(move || read_ranges(files, ranges, pool2, chunks2, buffer_size))
            .expect("failed to spawn reader thread");

        Box::new(FileSplatStream {
            files: Arc::clone(&self.files),
            pool,
            chunks,
            reader: Some(reader),
            current: None,
            cursor: 0,
            radius_scale: self.radius_scale,
        })
    }

    fn blob_stream(&self, grid: &Grid, bucket_size: u64) -> Box<dyn BlobStream + '_> {
        assert!(bucket_size > 0);
        Box::new(PerSplatBlobStream {
            splats: self.splat_stream(),
            grid: *grid,
            bucket_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn grid16() -> Grid {
        Grid::new([0.0; 3], 1.0, [(0, 16); 3])
    }

    fn collect(stream: &mut dyn SplatStream) -> Vec<(SplatId, Splat)> {
        let mut out = Vec::new();
        while let Some(item) = stream.next().unwrap() {
            out.push(item);
        }
        out
    }

    #[test]
    fn vector_set_filters_non_finite() {
        let mut set = VectorSet::default();
        set.push(Splat::new(Vec3::splat(1.0), Vec3::Z, 0.5));
        set.push(Splat::new(Vec3::new(f32::NAN, 0.0, 0.0), Vec3::Z, 0.5));
        set.push(Splat::new(Vec3::splat(2.0), Vec3::Z, 0.5));

        let got = collect(&mut *set.splat_stream());
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].0, 0);
        assert_eq!(got[1].0, 2);
    }

    #[test]
    fn vector_set_range_stream() {
        let splats: Vec<Splat> = (0..10)
            .map(|i| Splat::new(Vec3::splat(i as f32), Vec3::Z, 0.5))
            .collect();
        let set = VectorSet::from_splats(splats);
        let got = collect(&mut *set.splat_stream_ranges(vec![(2, 4), (7, 9)]));
        let ids: Vec<SplatId> = got.iter().map(|&(id, _)| id).collect();
        assert_eq!(ids, vec![2, 3, 7, 8]);
    }

    #[test]
    fn per_splat_blobs_match_bucket_ranges() {
        let mut set = VectorSet::default();
        let splat = Splat::new(Vec3::new(4.5, 4.5, 4.5), Vec3::Z, 1.0);
        set.push(splat);
        let grid = grid16();
        let mut blobs = set.blob_stream(&grid, 4);
        let blob = blobs.next().unwrap().unwrap();
        assert_eq!((blob.first_splat, blob.last_splat), (0, 1));
        assert_eq!((blob.lower, blob.upper), grid.splat_buckets(&splat, 4));
        assert!(blobs.next().unwrap().is_none());
    }

    #[test]
    fn file_set_streams_across_files() {
        let dir = tempfile::tempdir().unwrap();
        let first: Vec<Splat> = (0..300)
            .map(|i| Splat::new(Vec3::new(i as f32 * 0.01, 0.0, 0.0), Vec3::Z, 0.1))
            .collect();
        let mut second = first.clone();
        second[5].position[0] = f32::INFINITY;

        let path_a = dir.path().join("a.ply");
        let path_b = dir.path().join("b.ply");
        crate::ply::write_splats(&path_a, &first).unwrap();
        crate::ply::write_splats(&path_b, &second).unwrap();

        let mut set = FileSet::new().with_buffer_size(1024);
        set.add_file(SplatFile::open(&path_a).unwrap()).unwrap();
        set.add_file(SplatFile::open(&path_b).unwrap()).unwrap();
        assert_eq!(set.max_splats(), 600);

        let got = collect(&mut *set.splat_stream());
        assert_eq!(got.len(), 599);
        // Ids carry the file index in the upper bits.
        assert_eq!(got[0].0, 0);
        assert_eq!(got[300].0, make_splat_id(1, 0));
        assert!(got.iter().all(|&(id, _)| id != make_splat_id(1, 5)));
    }

    #[test]
    fn file_set_range_stream_single_file_portion() {
        let dir = tempfile::tempdir().unwrap();
        let splats: Vec<Splat> = (0..50)
            .map(|i| Splat::new(Vec3::new(i as f32, 0.0, 0.0), Vec3::Z, 0.5))
            .collect();
        let path = dir.path().join("s.ply");
        crate::ply::write_splats(&path, &splats).unwrap();

        let mut set = FileSet::new().with_buffer_size(256);
        set.add_file(SplatFile::open(&path).unwrap()).unwrap();

        let got = collect(&mut *set.splat_stream_ranges(vec![(10, 20), (30, 35)]));
        assert_eq!(got.len(), 15);
        assert_eq!(got[0].0, 10);
        assert_eq!(got[14].0, 34);
    }

    #[test]
    fn dropping_stream_early_does_not_hang() {
        let dir = tempfile::tempdir().unwrap();
        let splats: Vec<Splat> = (0..5000)
            .map(|i| Splat::new(Vec3::new(i as f32 * 1e-3, 0.0, 0.0), Vec3::Z, 0.1))
            .collect();
        let path = dir.path().join("big.ply");
        crate::ply::write_splats(&path, &splats).unwrap();

        let mut set = FileSet::new().with_buffer_size(512);
        set.add_file(SplatFile::open(&path).unwrap()).unwrap();

        let mut stream = set.splat_stream();
        stream.next().unwrap();
        drop(stream); // reader must unwind even with chunks in flight
    }
}
