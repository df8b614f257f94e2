//! Binary little-endian PLY input and output.
//!
//! The reader gives random access to the raw vertex records of a splat
//! file so the streaming layer can read large ranges with a single I/O and
//! parse splats out of the buffer. The writer streams an indexed triangle
//! mesh and cleans up partial output if it is dropped before `finish`.

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

use crate::error::{Error, Result};
use crate::splat::Splat;

/// Names of the vertex properties a splat file must provide, in the order
/// they land in [`Splat`].
const SPLAT_FIELDS: [&str; 7] = ["x", "y", "z", "nx", "ny", "nz", "radius"];

fn format_error(path: &Path, msg: impl Into<String>) -> Error {
    Error::io(
        path,
        io::Error::new(io::ErrorKind::InvalidData, msg.into()),
    )
}

fn scalar_size(type_name: &str) -> Option<usize> {
    match type_name {
        "char" | "int8" | "uchar" | "uint8" => Some(1),
        "short" | "int16" | "ushort" | "uint16" => Some(2),
        "int" | "int32" | "uint" | "uint32" | "float" | "float32" => Some(4),
        "double" | "float64" => Some(8),
        _ => None,
    }
}

/// Metadata for one splat PLY file: vertex count, record layout and the
/// byte offset of the payload.
pub struct SplatFile {
    path: PathBuf,
    num_vertices: u64,
    vertex_size: usize,
    data_offset: u64,
    /// Byte offset of each of the seven splat fields inside a record.
    field_offsets: [usize; 7],
}

impl SplatFile {
    /// Parse the header of a splat file. The vertex element must be the
    /// first element and the seven splat fields must be `float32`.
    pub fn open(path: impl Into<PathBuf>) -> Result<SplatFile> {
        let path = path.into();
        let file = File::open(&path).map_err(|e| Error::io(&path, e))?;
        let mut reader = BufReader::new(file);

        let mut line = String::new();
        let mut read_line = |reader: &mut BufReader<File>, line: &mut String| -> Result<u64> {
            line.clear();
            let n = reader
                .read_line(line)
                .map_err(|e| Error::io(&path, e))?;
            if n == 0 {
                return Err(format_error(&path, "unexpected end of header"));
            }
            Ok(n as u64)
        };

        let mut header_len = read_line(&mut reader, &mut line)?;
        if line.trim_end() != "ply" {
            return Err(format_error(&path, "not a PLY file"));
        }
        header_len += read_line(&mut reader, &mut line)?;
        if line.trim_end() != "format binary_little_endian 1.0" {
            return Err(format_error(
                &path,
                "only binary little-endian PLY is supported",
            ));
        }

        let mut num_vertices: Option<u64> = None;
        let mut vertex_size = 0usize;
        let mut field_offsets: [Option<usize>; 7] = [None; 7];
        // True while parsing properties of the leading vertex element.
        let mut in_vertex_element = false;
        let mut seen_element = false;

        loop {
            header_len += read_line(&mut reader, &mut line)?;
            let trimmed = line.trim_end();
            let mut tokens = trimmed.split_whitespace();
            match tokens.next() {
                Some("comment") | Some("obj_info") => continue,
                Some("end_header") => break,
                Some("element") => {
                    let name = tokens
                        .next()
                        .ok_or_else(|| format_error(&path, "malformed element line"))?;
                    let count: u64 = tokens
                        .next()
                        .and_then(|t| t.parse().ok())
                        .ok_or_else(|| format_error(&path, "malformed element count"))?;
                    if name == "vertex" {
                        if seen_element {
                            return Err(format_error(
                                &path,
                                "vertex element must be the first element",
                            ));
                        }
                        num_vertices = Some(count);
                        in_vertex_element = true;
                    } else {
                        if !seen_element && num_vertices.is_none() {
                            return Err(format_error(
                                &path,
                                "vertex element must be the first element",
                            ));
                        }
                        in_vertex_element = false;
                    }
                    seen_element = true;
                }
                Some("property") => {
                    if !in_vertex_element {
                        continue;
                    }
                    let type_name = tokens
                        .next()
                        .ok_or_else(|| format_error(&path, "malformed property line"))?;
                    if type_name == "list" {
                        return Err(format_error(
                            &path,
                            "list properties are not supported on vertices",
                        ));
                    }
                    let prop_name = tokens
                        .next()
                        .ok_or_else(|| format_error(&path, "malformed property line"))?;
                    let size = scalar_size(type_name).ok_or_else(|| {
                        format_error(&path, format!("unknown property type {}", type_name))
                    })?;
                    if let Some(slot) = SPLAT_FIELDS.iter().position(|&f| f == prop_name) {
                        if !matches!(type_name, "float" | "float32") {
                            return Err(format_error(
                                &path,
                                format!("property {} must be float32", prop_name),
                            ));
                        }
                        field_offsets[slot] = Some(vertex_size);
                    }
                    vertex_size += size;
                }
                _ => return Err(format_error(&path, format!("unexpected header line: {}", trimmed))),
            }
        }

        let num_vertices = num_vertices
            .ok_or_else(|| format_error(&path, "no vertex element"))?;
        let mut offsets = [0usize; 7];
        for (i, off) in field_offsets.iter().enumerate() {
            offsets[i] = off.ok_or_else(|| {
                format_error(&path, format!("missing vertex property {}", SPLAT_FIELDS[i]))
            })?;
        }

        Ok(SplatFile {
            path,
            num_vertices,
            vertex_size,
            data_offset: header_len,
            field_offsets: offsets,
        })
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of vertex records (including non-finite ones).
    #[inline]
    pub fn size(&self) -> u64 {
        self.num_vertices
    }

    /// Bytes per vertex record.
    #[inline]
    pub fn vertex_size(&self) -> usize {
        self.vertex_size
    }

    /// Open an independent handle for reading; each reader thread owns its
    /// own handle so concurrent reads need no locking.
    pub fn handle(&self) -> Result<SplatFileHandle<'_>> {
        let file = File::open(&self.path).map_err(|e| Error::io(&self.path, e))?;
        Ok(SplatFileHandle { owner: self, file })
    }

    /// Decode the splat at `index` within a raw buffer previously filled by
    /// [`SplatFileHandle::read_raw`].
    #[inline]
    pub fn decode(&self, raw: &[u8], index: usize) -> Splat {
        let base = index * self.vertex_size;
        let record = &raw[base..base + self.vertex_size];
        let f = |slot: usize| LittleEndian::read_f32(&record[self.field_offsets[slot]..]);
        Splat {
            position: [f(0), f(1), f(2)],
            normal: [f(3), f(4), f(5)],
            radius: f(6),
        }
    }
}

/// Per-thread read handle over one splat file.
pub struct SplatFileHandle<'a> {
    owner: &'a SplatFile,
    file: File,
}

impl SplatFileHandle<'_> {
    /// Read the raw records `[first, last)` into `out`, which must hold
    /// `(last - first) * vertex_size` bytes.
    pub fn read_raw(&mut self, first: u64, last: u64, out: &mut [u8]) -> Result<()> {
        debug_assert!(first <= last && last <= self.owner.num_vertices);
        let bytes = (last - first) as usize * self.owner.vertex_size;
        debug_assert!(out.len() >= bytes);
        let offset = self.owner.data_offset + first * self.owner.vertex_size as u64;
        self.file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.file.read_exact(&mut out[..bytes]))
            .map_err(|e| Error::io(&self.owner.path, e))
    }
}

/// Streaming writer for an indexed triangle mesh.
///
/// Vertex and triangle counts are fixed up front (the binary header needs
/// them); `finish` must be called for the file to be kept, otherwise the
/// partial output is removed on drop.
pub struct MeshWriter {
    path: PathBuf,
    out: Option<BufWriter<File>>,
    num_vertices: u64,
    num_triangles: u64,
    written_vertices: u64,
    written_triangles: u64,
}

impl MeshWriter {
    pub fn create(
        path: impl Into<PathBuf>,
        num_vertices: u64,
        num_triangles: u64,
        comments: &[String],
    ) -> Result<MeshWriter> {
        let path = path.into();
        let file = File::create(&path).map_err(|e| Error::io(&path, e))?;
        let mut out = BufWriter::new(file);

        let mut header = String::new();
        header.push_str("ply\nformat binary_little_endian 1.0\n");
        for comment in comments {
            header.push_str("comment ");
            header.push_str(comment);
            header.push('\n');
        }
        header.push_str(&format!("element vertex {}\n", num_vertices));
        header.push_str("property float32 x\nproperty float32 y\nproperty float32 z\n");
        header.push_str(&format!("element face {}\n", num_triangles));
        header.push_str("property list uint8 uint32 vertex_indices\n");
        header.push_str("end_header\n");
        out.write_all(header.as_bytes())
            .map_err(|e| Error::io(&path, e))?;

        Ok(MeshWriter {
            path,
            out: Some(out),
            num_vertices,
            num_triangles,
            written_vertices: 0,
            written_triangles: 0,
        })
    }

    pub fn write_vertex(&mut self, position: [f32; 3]) -> Result<()> {
        debug_assert!(self.written_vertices < self.num_vertices);
        let out = self.out.as_mut().expect("writer already finished");
        let mut buf = [0u8; 12];
        LittleEndian::write_f32_into(&position, &mut buf);
        out.write_all(&buf).map_err(|e| Error::io(&self.path, e))?;
        self.written_vertices += 1;
        Ok(())
    }

    pub fn write_triangle(&mut self, indices: [u32; 3]) -> Result<()> {
        debug_assert!(self.written_vertices == self.num_vertices);
        debug_assert!(self.written_triangles < self.num_triangles);
        let out = self.out.as_mut().expect("writer already finished");
        let mut buf = [0u8; 13];
        buf[0] = 3;
        LittleEndian::write_u32_into(&indices, &mut buf[1..]);
        out.write_all(&buf).map_err(|e| Error::io(&self.path, e))?;
        self.written_triangles += 1;
        Ok(())
    }

    /// Flush and keep the file. Fails if the promised counts were not met.
    pub fn finish(mut self) -> Result<()> {
        if self.written_vertices != self.num_vertices
            || self.written_triangles != self.num_triangles
        {
            return Err(Error::Internal(format!(
                "mesh writer for {} closed early: {}/{} vertices, {}/{} triangles",
                self.path.display(),
                self.written_vertices,
                self.num_vertices,
                self.written_triangles,
                self.num_triangles
            )));
        }
        let mut out = self.out.take().expect("writer already finished");
        out.flush().map_err(|e| Error::io(&self.path, e))?;
        Ok(())
    }
}

impl Drop for MeshWriter {
    fn drop(&mut self) {
        if self.out.take().is_some() {
            // Unwinding past an unfinished writer: remove the partial file.
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Read back an indexed triangle mesh written by [`MeshWriter`].
///
/// Only the exact layout the writer produces is supported; this is a
/// verification aid, not a general PLY importer.
pub fn read_mesh(path: impl Into<PathBuf>) -> Result<(Vec<[f32; 3]>, Vec<[u32; 3]>)> {
    let path = path.into();
    let bytes = std::fs::read(&path).map_err(|e| Error::io(&path, e))?;
    let header_end = bytes
        .windows(11)
        .position(|w| w == b"end_header\n")
        .ok_or_else(|| format_error(&path, "missing end_header"))?
        + 11;
    let header = std::str::from_utf8(&bytes[..header_end])
        .map_err(|_| format_error(&path, "header is not UTF-8"))?;

    let mut num_vertices = None;
    let mut num_faces = None;
    for line in header.lines() {
        let mut tokens = line.split_whitespace();
        if tokens.next() == Some("element") {
            match (tokens.next(), tokens.next().and_then(|t| t.parse::<u64>().ok())) {
                (Some("vertex"), Some(n)) => num_vertices = Some(n),
                (Some("face"), Some(n)) => num_faces = Some(n),
                _ => return Err(format_error(&path, "malformed element line")),
            }
        }
    }
    let num_vertices =
        num_vertices.ok_or_else(|| format_error(&path, "no vertex element"))? as usize;
    let num_faces = num_faces.ok_or_else(|| format_error(&path, "no face element"))? as usize;

    let mut body = &bytes[header_end..];
    if body.len() != num_vertices * 12 + num_faces * 13 {
        return Err(format_error(&path, "payload size mismatch"));
    }
    let mut vertices = Vec::with_capacity(num_vertices);
    for _ in 0..num_vertices {
        let mut v = [0f32; 3];
        LittleEndian::read_f32_into(&body[..12], &mut v);
        vertices.push(v);
        body = &body[12..];
    }
    let mut triangles = Vec::with_capacity(num_faces);
    for _ in 0..num_faces {
        if body[0] != 3 {
            return Err(format_error(&path, "non-triangle face"));
        }
        let mut t = [0u32; 3];
        LittleEndian::read_u32_into(&body[1..13], &mut t);
        triangles.push(t);
        body = &body[13..];
    }
    Ok((vertices, triangles))
}

/// Write splats as a binary PLY file with the canonical seven-field layout.
/// Used by fixtures and tooling; the reconstruction pipeline itself only
/// reads splat files.
pub fn write_splats(path: impl Into<PathBuf>, splats: &[Splat]) -> Result<()> {
    let path = path.into();
    let file = File::create(&path).map_err(|e| Error::io(&path, e))?;
    let mut out = BufWriter::new(file);
    let mut header = String::new();
    header.push_str("ply\nformat binary_little_endian 1.0\n");
    header.push_str(&format!("element vertex {}\n", splats.len()));
    for field in SPLAT_FIELDS {
        header.push_str(&format!("property float32 {}\n", field));
    }
    header.push_str("end_header\n");
    out.write_all(header.as_bytes())
        .map_err(|e| Error::io(&path, e))?;
    for splat in splats {
        for v in splat
            .position
            .iter()
            .chain(splat.normal.iter())
            .chain(std::iter::once(&splat.radius))
        {
            out.write_f32::<LittleEndian>(*v)
                .map_err(|e| Error::io(&path, e))?;
        }
    }
    out.flush().map_err(|e| Error::io(&path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn sample_splats() -> Vec<Splat> {
        vec![
            Splat::new(Vec3::new(0.5, 1.0, -2.0), Vec3::Z, 0.25),
            Splat::new(Vec3::new(-1.0, 0.0, 3.5), Vec3::X, 1.5),
            Splat::new(Vec3::new(f32::NAN, 0.0, 0.0), Vec3::Y, 1.0),
        ]
    }

    #[test]
    fn splat_file_layout_and_decode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("splats.ply");
        let splats = sample_splats();
        write_splats(&path, &splats).unwrap();

        let file = SplatFile::open(&path).unwrap();
        assert_eq!(file.size(), 3);
        assert_eq!(file.vertex_size(), 28);

        let mut raw = vec![0u8; 3 * file.vertex_size()];
        file.handle().unwrap().read_raw(0, 3, &mut raw).unwrap();
        assert_eq!(file.decode(&raw, 0), splats[0]);
        assert_eq!(file.decode(&raw, 1), splats[1]);
        assert!(!file.decode(&raw, 2).is_finite());

        // Partial read of the tail.
        let mut tail = vec![0u8; file.vertex_size()];
        file.handle().unwrap().read_raw(1, 2, &mut tail).unwrap();
        assert_eq!(file.decode(&tail, 0), splats[1]);
    }

    #[test]
    fn rejects_missing_radius() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.ply");
        std::fs::write(
            &path,
            b"ply\nformat binary_little_endian 1.0\nelement vertex 0\n\
              property float32 x\nproperty float32 y\nproperty float32 z\n\
              end_header\n",
        )
        .unwrap();
        assert!(SplatFile::open(&path).is_err());
    }

    #[test]
    fn tolerates_extra_properties() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("extra.ply");
        let mut contents = Vec::new();
        contents.extend_from_slice(
            b"ply\nformat binary_little_endian 1.0\ncomment made up\n\
              element vertex 1\nproperty uchar quality\n",
        );
        for field in SPLAT_FIELDS {
            contents.extend_from_slice(format!("property float32 {}\n", field).as_bytes());
        }
        contents.extend_from_slice(b"end_header\n");
        contents.push(7); // quality byte
        for v in [1.0f32, 2.0, 3.0, 0.0, 0.0, 1.0, 0.5] {
            contents.extend_from_slice(&v.to_le_bytes());
        }
        std::fs::write(&path, contents).unwrap();

        let file = SplatFile::open(&path).unwrap();
        assert_eq!(file.vertex_size(), 29);
        let mut raw = vec![0u8; 29];
        file.handle().unwrap().read_raw(0, 1, &mut raw).unwrap();
        let splat = file.decode(&raw, 0);
        assert_eq!(splat.position, [1.0, 2.0, 3.0]);
        assert_eq!(splat.radius, 0.5);
    }

    #[test]
    fn mesh_writer_round_trip_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mesh.ply");
        let mut writer =
            MeshWriter::create(&path, 3, 1, &["generated by splatmesh".to_owned()]).unwrap();
        writer.write_vertex([0.0, 0.0, 0.0]).unwrap();
        writer.write_vertex([1.0, 0.0, 0.0]).unwrap();
        writer.write_vertex([0.0, 1.0, 0.0]).unwrap();
        writer.write_triangle([0, 1, 2]).unwrap();
        writer.finish().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let header_end = bytes
            .windows(11)
            .position(|w| w == b"end_header\n")
            .unwrap()
            + 11;
        assert_eq!(bytes.len(), header_end + 3 * 12 + 13);
        assert_eq!(bytes[header_end + 3 * 12], 3);
    }

    #[test]
    fn unfinished_writer_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.ply");
        {
            let mut writer = MeshWriter::create(&path, 2, 0, &[]).unwrap();
            writer.write_vertex([0.0; 3]).unwrap();
            // Dropped before finish.
        }
        assert!(!path.exists());
    }
}
