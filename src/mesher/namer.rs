//! Output file naming for single-file and chunked runs.

use std::path::PathBuf;

use crate::bucket::ChunkId;

/// Maps a chunk id to its output path.
#[derive(Debug, Clone)]
pub enum OutputNamer {
    /// Every chunk goes to one file (only valid when chunking is off).
    Single(PathBuf),
    /// `<base>_GGGG_XXXX_YYYY_ZZZZ.ply`: the generation is always four
    /// digits; coordinate fields start at four digits and widen as needed.
    Chunked(PathBuf),
}

impl OutputNamer {
    pub fn path(&self, chunk: ChunkId) -> PathBuf {
        match self {
            OutputNamer::Single(path) => path.clone(),
            OutputNamer::Chunked(base) => {
                let mut name = base.as_os_str().to_owned();
                name.push(format!(
                    "_{:04}_{:04}_{:04}_{:04}.ply",
                    chunk.gen, chunk.coords[0], chunk.coords[1], chunk.coords[2]
                ));
                PathBuf::from(name)
            }
        }
    }
}
