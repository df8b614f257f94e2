//! Out-of-core watertight surface reconstruction from splat clouds.
//!
//! The pipeline turns indexed sets of oriented disk samples into on-disk
//! triangle meshes: a blob index accelerates spatial bucketing of the
//! input, bins of splats are scattered to device workers that extract a
//! moving-least-squares isosurface with marching tetrahedra, and the root
//! welds the returned mesh fragments out-of-core into one PLY file per
//! output chunk.

pub mod bucket;
pub mod buffer;
pub mod comm;
pub mod device;
pub mod error;
pub mod grid;
pub mod mesher;
pub mod pipeline;
pub mod ply;
pub mod progress;
pub mod queue;
pub mod serialize;
pub mod splat;
pub mod splats;
pub mod stats;
pub mod transport;

pub use error::{Error, Result};
pub use pipeline::{resume, run, RunConfig};
