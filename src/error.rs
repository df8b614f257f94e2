//! Error types surfaced by the reconstruction pipeline.

use std::fmt;
use std::io;
use std::path::PathBuf;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that abort a reconstruction run.
///
/// Every variant is fatal: the pipeline has no idempotent retry unit, so
/// errors unwind through the scoped queue/buffer/file holders and the run
/// exits with status 1.
#[derive(Debug)]
pub enum Error {
    /// File open/read/write failure, including temp spill exhaustion.
    Io { path: PathBuf, source: io::Error },

    /// Command-line validation failure, raised before any work starts.
    InvalidOption(String),

    /// The device cannot satisfy the configured working set.
    InvalidDevice(String),

    /// Every input splat was non-finite.
    EmptyInput,

    /// The bucketer exceeded its recursion ceiling, indicating pathological
    /// blob overlap.
    BucketExplosion {
        depth: usize,
        region: [(i64, i64); 3],
    },

    /// Accelerator failure while processing a bin.
    Device(String),

    /// A circular buffer cannot hold even a single element; the memory
    /// configuration is inconsistent with the bin limits.
    MemoryPressure {
        buffer: &'static str,
        requested: usize,
        capacity: usize,
    },

    /// A run was cancelled by an abort broadcast from another rank.
    Cancelled,

    /// Invariant violation that should be unreachable with a correct
    /// bucketer (e.g. incompatible chunk metadata for one chunk id).
    Internal(String),
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io { path, source } => {
                write!(f, "I/O error on {}: {}", path.display(), source)
            }
            Error::InvalidOption(msg) => write!(f, "invalid option: {}", msg),
            Error::InvalidDevice(msg) => write!(f, "invalid device: {}", msg),
            Error::EmptyInput => write!(f, "input does not contain any finite splats"),
            Error::BucketExplosion { depth, region } => write!(
                f,
                "bucket recursion exceeded depth {} in region x[{},{}] y[{},{}] z[{},{}]",
                depth,
                region[0].0,
                region[0].1,
                region[1].0,
                region[1].1,
                region[2].0,
                region[2].1
            ),
            Error::Device(msg) => write!(f, "device error: {}", msg),
            Error::MemoryPressure {
                buffer,
                requested,
                capacity,
            } => write!(
                f,
                "buffer {} of {} bytes cannot hold a single {}-byte element",
                buffer, capacity, requested
            ),
            Error::Cancelled => write!(f, "run cancelled by abort"),
            Error::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}
