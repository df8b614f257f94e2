//! Fixed little-endian wire encoding of bins, fragments and progress
//! updates.
//!
//! Every field has a fixed primitive layout with no padding; bulk arrays
//! are copied as raw little-endian words. The same bytes travel between
//! ranks and through the gather ring, so encoders write into caller-owned
//! buffers.

use byteorder::{ByteOrder, LittleEndian};

use crate::bucket::{Bin, ChunkId};
use crate::device::MeshFragment;
use crate::error::{Error, Result};
use crate::grid::Grid;

/// Consuming reader over a received message.
pub struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Reader { buf }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() < n {
            return Err(Error::Internal(format!(
                "truncated message: wanted {} bytes, have {}",
                n,
                self.buf.len()
            )));
        }
        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(head)
    }

    pub fn u32(&mut self) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    pub fn u64(&mut self) -> Result<u64> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    pub fn i64(&mut self) -> Result<i64> {
        Ok(LittleEndian::read_i64(self.take(8)?))
    }

    pub fn f32(&mut self) -> Result<f32> {
        Ok(LittleEndian::read_f32(self.take(4)?))
    }
}

/// Append-only writer; bins and fragments know their exact size so callers
/// can pre-allocate.
pub struct Writer<'a> {
    buf: &'a mut Vec<u8>,
}

impl<'a> Writer<'a> {
    pub fn new(buf: &'a mut Vec<u8>) -> Self {
        Writer { buf }
    }

    pub fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn f32(&mut self, v: f32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }
}

fn write_chunk(w: &mut Writer<'_>, chunk: ChunkId) {
    w.u32(chunk.gen);
    for c in chunk.coords {
        w.u32(c);
    }
}

fn read_chunk(r: &mut Reader<'_>) -> Result<ChunkId> {
    let gen = r.u32()?;
    let coords = [r.u32()?, r.u32()?, r.u32()?];
    Ok(ChunkId { gen, coords })
}

/// Encoded size of a bin.
pub fn bin_bytes(bin: &Bin) -> usize {
    // grid: 3 f32 + f32 + 6 i64; chunk: 4 u32; splats: u64; ranges: u32 + n * 16
    16 + 48 + 16 + 8 + 4 + bin.ranges.len() * 16
}

pub fn write_bin(bin: &Bin, out: &mut Vec<u8>) {
    out.reserve(bin_bytes(bin));
    let mut w = Writer::new(out);
    for v in bin.grid.reference() {
        w.f32(v);
    }
    w.f32(bin.grid.spacing());
    for axis in 0..3 {
        let (lo, hi) = bin.grid.extent(axis);
        w.i64(lo);
        w.i64(hi);
    }
    write_chunk(&mut w, bin.chunk);
    w.u64(bin.num_splats);
    w.u32(bin.ranges.len() as u32);
    for &(first, last) in &bin.ranges {
        w.u64(first);
        w.u64(last);
    }
}

pub fn read_bin(r: &mut Reader<'_>) -> Result<Bin> {
    let reference = [r.f32()?, r.f32()?, r.f32()?];
    let spacing = r.f32()?;
    let mut extents = [(0i64, 0i64); 3];
    for e in extents.iter_mut() {
        *e = (r.i64()?, r.i64()?);
    }
    let chunk = read_chunk(r)?;
    let num_splats = r.u64()?;
    let num_ranges = r.u32()? as usize;
    let mut ranges = Vec::with_capacity(num_ranges);
    for _ in 0..num_ranges {
        ranges.push((r.u64()?, r.u64()?));
    }
    if !spacing.is_finite() || spacing <= 0.0 {
        return Err(Error::Internal("bin with invalid grid spacing".into()));
    }
    Ok(Bin {
        ranges,
        num_splats,
        grid: Grid::new(reference, spacing, extents),
        chunk,
    })
}

/// Encoded size of a fragment.
pub fn fragment_bytes(frag: &MeshFragment) -> usize {
    16 + 12 + frag.vertices.len() * 12 + frag.external_keys.len() * 8 + frag.triangles.len() * 12
}

/// Serialize a fragment into `out`, which must be exactly
/// [`fragment_bytes`] long.
pub fn write_fragment(frag: &MeshFragment, out: &mut [u8]) {
    debug_assert_eq!(out.len(), fragment_bytes(frag));
    let mut buf = Vec::with_capacity(fragment_bytes(frag));
    {
        let mut w = Writer::new(&mut buf);
        write_chunk(&mut w, frag.chunk);
        w.u32(frag.vertices.len() as u32);
        w.u32(frag.num_internal);
        w.u32(frag.triangles.len() as u32);
        w.bytes(bytemuck::cast_slice(&frag.vertices));
        w.bytes(bytemuck::cast_slice(&frag.external_keys));
        w.bytes(bytemuck::cast_slice(&frag.triangles));
    }
    out.copy_from_slice(&buf);
}

pub fn read_fragment(bytes: &[u8]) -> Result<MeshFragment> {
    let mut r = Reader::new(bytes);
    let chunk = read_chunk(&mut r)?;
    let num_vertices = r.u32()? as usize;
    let num_internal = r.u32()?;
    let num_triangles = r.u32()? as usize;
    if (num_internal as usize) > num_vertices {
        return Err(Error::Internal(
            "fragment internal count exceeds vertex count".into(),
        ));
    }
    let num_external = num_vertices - num_internal as usize;

    let mut vertices = vec![[0f32; 3]; num_vertices];
    bytemuck::cast_slice_mut::<[f32; 3], u8>(&mut vertices)
        .copy_from_slice(r.take(num_vertices * 12)?);
    let mut external_keys = vec![0u64; num_external];
    bytemuck::cast_slice_mut::<u64, u8>(&mut external_keys)
        .copy_from_slice(r.take(num_external * 8)?);
    let mut triangles = vec![[0u32; 3]; num_triangles];
    bytemuck::cast_slice_mut::<[u32; 3], u8>(&mut triangles)
        .copy_from_slice(r.take(num_triangles * 12)?);
    if !r.is_empty() {
        return Err(Error::Internal("trailing bytes after fragment".into()));
    }
    Ok(MeshFragment {
        vertices,
        num_internal,
        external_keys,
        triangles,
        chunk,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_bin() -> Bin {
        Bin {
            ranges: vec![(3, 17), (40, 64)],
            num_splats: 38,
            grid: Grid::new([0.0, 0.0, 0.0], 0.25, [(-8, 24), (0, 16), (8, 40)]),
            chunk: ChunkId {
                gen: 2,
                coords: [1, 0, 3],
            },
        }
    }

    #[test]
    fn bin_round_trip() {
        let bin = sample_bin();
        let mut bytes = Vec::new();
        write_bin(&bin, &mut bytes);
        assert_eq!(bytes.len(), bin_bytes(&bin));

        let mut r = Reader::new(&bytes);
        let back = read_bin(&mut r).unwrap();
        assert!(r.is_empty());
        assert_eq!(back, bin);
    }

    #[test]
    fn fragment_round_trip() {
        let frag = MeshFragment {
            vertices: vec![[0.0, 1.0, 2.0], [3.0, 4.0, 5.0], [6.0, 7.0, 8.0]],
            num_internal: 1,
            external_keys: vec![0xdead_beef, 42],
            triangles: vec![[0, 1, 2]],
            chunk: ChunkId {
                gen: 0,
                coords: [0, 0, 1],
            },
        };
        let mut bytes = vec![0u8; fragment_bytes(&frag)];
        write_fragment(&frag, &mut bytes);
        let back = read_fragment(&bytes).unwrap();
        assert_eq!(back, frag);
    }

    #[test]
    fn corrupt_messages_are_rejected() {
        let bin = sample_bin();
        let mut bytes = Vec::new();
        write_bin(&bin, &mut bytes);
        bytes.truncate(bytes.len() - 1);
        assert!(read_bin(&mut Reader::new(&bytes)).is_err());

        assert!(read_fragment(&[1, 2, 3]).is_err());
    }
}
