//! The reconstruction driver: wires splat sets, bucketer, transport,
//! device workers and the mesher into one pipelined run.
//!
//! Ranks are threads over the in-process communicator: rank 0 drives
//! bucketing, scatter, fragment receive and assembly; each worker rank owns
//! one device pipeline. All cross-rank traffic uses the wire protocol, so a
//! message-passing backend changes the communicator, not the pipeline.

use std::path::PathBuf;
use std::sync::Arc;

use crate::bucket::{bucket, BucketCollector, BucketLoader, BucketParams};
use crate::buffer::CircularBuffer;
use crate::comm::{Comm, LocalComm};
use crate::device::{DeviceContext, DevicePipeline, MlsProgram};
use crate::error::{Error, Result};
use crate::grid::Grid;
use crate::mesher::{MesherOptions, OocMesher, OutputNamer};
use crate::ply::SplatFile;
use crate::progress::{aggregate_progress, ProgressSender};
use crate::splats::{FileSet, IndexedSplats};
use crate::stats;
use crate::transport::{
    collect_stats, receive_fragments, request_work, GatherGroup, Scatter,
};

/// Upper bound on grid corners per axis, imposed by the 20-bit coordinate
/// fields of the external vertex keys.
const MAX_GRID_CELLS: u64 = (1 << 20) - 1;

/// Currently a single reconstruction pass; the pass id is plumbed through
/// the scatter, gather and progress channels so multi-pass algorithms
/// compose without protocol changes.
const NUM_PASSES: u32 = 1;

/// A full run configuration, validated before any work starts.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub inputs: Vec<PathBuf>,
    pub output: PathBuf,
    /// World units per grid cell.
    pub spacing: f32,
    /// Splats per scattered batch.
    pub max_load_splats: u64,
    /// Splats per bin (device working set).
    pub max_device_splats: u64,
    /// Cells per bin.
    pub max_cells: u64,
    /// Maximum splits per axis at each bucket recursion.
    pub max_split: u64,
    /// Microblock edge in cells (power of two).
    pub microblock: u64,
    /// Root-side mesh receive buffer, bytes.
    pub mem_mesh: usize,
    /// Worker-side gather buffer, bytes.
    pub mem_gather: usize,
    /// Output chunk edge in cells; 0 writes a single file.
    pub chunk_cells: u64,
    /// Component prune threshold as a fraction of total vertices.
    pub prune_threshold: f64,
    /// Spill directory for the out-of-core assembly.
    pub tmp_dir: PathBuf,
    /// Number of device workers.
    pub workers: usize,
    /// Input splat radius multiplier, applied at ingestion; the scaled
    /// radius is the MLS support everywhere downstream.
    pub radius_scale: f32,
    /// Log a warning when no progress arrives for this long; never forces
    /// termination. Off by default.
    pub stall_warning: Option<std::time::Duration>,
    /// Keep the sealed spill after a successful run (checkpoint for
    /// `resume`); normally temp files are deleted on completion.
    pub keep_spill: bool,
}

impl RunConfig {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::InvalidOption(msg));
        if self.inputs.is_empty() {
            return invalid("at least one input file is required".into());
        }
        if !(self.spacing.is_finite() && self.spacing > 0.0) {
            return invalid(format!("spacing {} must be positive", self.spacing));
        }
        if !(0.0..=1.0).contains(&self.prune_threshold) {
            return invalid(format!(
                "prune-threshold {} must lie in [0, 1]",
                self.prune_threshold
            ));
        }
        if self.max_load_splats < self.max_device_splats {
            return invalid(format!(
                "max-load-splats {} must be at least max-device-splats {}",
                self.max_load_splats, self.max_device_splats
            ));
        }
        if self.workers == 0 {
            return invalid("at least one worker is required".into());
        }
        if !(self.radius_scale.is_finite() && self.radius_scale > 0.0) {
            return invalid(format!(
                "radius-scale {} must be positive",
                self.radius_scale
            ));
        }
        if self.stall_warning.is_some_and(|d| d.is_zero()) {
            return invalid("stall-warning-secs must be positive".into());
        }
        if self.chunk_cells != 0 && self.chunk_cells % self.microblock != 0 {
            return invalid(format!(
                "chunk-cells {} must be a multiple of the microblock size {}",
                self.chunk_cells, self.microblock
            ));
        }
        self.bucket_params().validate()?;
        DeviceContext::host().validate(self.max_cells, self.max_device_splats)?;
        Ok(())
    }

    fn bucket_params(&self) -> BucketParams {
        BucketParams {
            max_splats: self.max_device_splats,
            max_cells: self.max_cells,
            max_split: self.max_split,
            micro_size: self.microblock,
        }
    }

    fn namer(&self) -> OutputNamer {
        if self.chunk_cells == 0 {
            OutputNamer::Single(self.output.clone())
        } else {
            OutputNamer::Chunked(self.output.clone())
        }
    }

    fn mesher_options(&self) -> MesherOptions {
        MesherOptions {
            prune_threshold: self.prune_threshold,
            comments: vec![format!(
                "generated by splatmesh {} (spacing {})",
                env!("CARGO_PKG_VERSION"),
                self.spacing
            )],
        }
    }
}

/// Resume a crashed run from its sealed spill directory.
pub fn resume(config: &RunConfig, spill: &PathBuf) -> Result<usize> {
    OocMesher::resume(spill, config.mesher_options(), &config.namer())
}

/// Run the full reconstruction. Returns the number of output files.
pub fn run(config: &RunConfig) -> Result<usize> {
    config.validate()?;
    let _t = stats::Timed::new("run.time");

    let splats = {
        let _t = stats::Timed::new("blobs.time");
        let mut set = FileSet::new().with_radius_scale(config.radius_scale);
        for input in &config.inputs {
            set.add_file(SplatFile::open(input)?)?;
        }
        IndexedSplats::build(set, config.spacing, config.microblock)?
    };
    let grid = *splats.bounding_grid();
    for axis in 0..3 {
        if grid.num_cells(axis) > MAX_GRID_CELLS {
            return Err(Error::InvalidOption(format!(
                "grid spans {} cells on axis {}; raise --spacing (limit {})",
                grid.num_cells(axis),
                axis,
                MAX_GRID_CELLS
            )));
        }
    }
    log::info!(
        "indexed {} splats ({} blobs), grid {}x{}x{} cells",
        splats.num_splats(),
        splats.num_blobs(),
        grid.num_cells(0),
        grid.num_cells(1),
        grid.num_cells(2)
    );

    let mut comms = LocalComm::group(1 + config.workers);
    let worker_comms: Vec<LocalComm> = comms.drain(1..).collect();
    let root_comm = Arc::new(comms.pop().expect("root comm"));

    let mut files_written = 0usize;
    std::thread::scope(|scope| -> Result<()> {
        let mut worker_handles = Vec::new();
        for comm in worker_comms {
            let splats = &splats;
            let handle = scope.spawn(move || worker_rank(comm, splats, config));
            worker_handles.push(handle);
        }

        let root_result = root_rank(Arc::clone(&root_comm), &splats, &grid, config);

        // On a root failure, make sure the workers unblock before joining.
        if root_result.is_err() && !root_comm.is_aborted() {
            root_comm.abort();
        }
        // Keep the most informative failure: a real error from any rank
        // beats the Cancelled errors the abort broadcast induces elsewhere.
        let mut first_error: Option<Error> = None;
        let mut record = |e: Error| {
            let cancelled = matches!(e, Error::Cancelled);
            match &first_error {
                None => first_error = Some(e),
                Some(Error::Cancelled) if !cancelled => first_error = Some(e),
                _ => {}
            }
        };
        let mut files = None;
        match root_result {
            Ok(n) => files = Some(n),
            Err(e) => record(e),
        }
        for handle in worker_handles {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => record(e),
                Err(_) => record(Error::Internal("worker rank panicked".into())),
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                files_written = files.unwrap_or(0);
                Ok(())
            }
        }
    })?;

    Ok(files_written)
}

/// Rank 0: bucketing, scatter, receive, assembly.
fn root_rank(
    comm: Arc<LocalComm>,
    splats: &IndexedSplats<FileSet>,
    grid: &Grid,
    config: &RunConfig,
) -> Result<usize> {
    let num_workers = config.workers;
    let total_splats = splats.num_splats();
    let mut mesher = OocMesher::new(&config.tmp_dir, config.mesher_options(), config.mem_mesh)?;

    for pass in 0..NUM_PASSES {
        let _t = stats::Timed::new("pass.time");
        log::info!("pass {}/{}", pass + 1, NUM_PASSES);

        // The receiver owns the mesher for the duration of the pass and
        // hands it back through its join result.
        let receiver = {
            let comm = Arc::clone(&comm);
            let mut mesher = mesher;
            std::thread::Builder::new()
                .name("receiver".to_owned())
                .spawn(move || -> Result<OocMesher> {
                    receive_fragments(comm.as_ref(), num_workers, |frag| {
                        mesher.add_fragment(frag)
                    })?;
                    Ok(mesher)
                })
                .expect("failed to spawn receiver thread")
        };
        let progress = {
            let comm = Arc::clone(&comm);
            let stall_warning = config.stall_warning;
            std::thread::Builder::new()
                .name("progress".to_owned())
                .spawn(move || {
                    aggregate_progress(comm.as_ref(), num_workers, total_splats, pass, stall_warning)
                })
                .expect("failed to spawn progress thread")
        };

        let scatter = Scatter::new(Arc::clone(&comm));
        let mut collector = BucketCollector::new(config.max_load_splats, |bins| {
            stats::counter("scatter.batches").add(1);
            scatter.send_bins(&bins)
        });
        let bucket_result = bucket(
            splats,
            grid,
            config.chunk_cells,
            pass,
            &config.bucket_params(),
            |bin| collector.add(bin),
        )
        .and_then(|_| collector.flush())
        .and_then(|_| scatter.stop(num_workers));

        if let Err(e) = bucket_result {
            // Workers and the receiver must unwind before we surface the
            // failure; the abort fails their next channel call.
            comm.abort();
            let _ = receiver.join();
            let _ = progress.join();
            return Err(e);
        }
        mesher = receiver
            .join()
            .map_err(|_| Error::Internal("receiver thread panicked".into()))??;
        progress
            .join()
            .map_err(|_| Error::Internal("progress thread panicked".into()))??;
    }

    collect_stats(
        comm.as_ref(),
        0,
        &stats::Snapshot::default(),
        stats::registry(),
    )?;
    mesher.finalize(&config.namer(), config.keep_spill)
}

/// Worker rank: demand work, load, run the device pipeline, gather.
fn worker_rank(
    comm: LocalComm,
    splats: &IndexedSplats<FileSet>,
    config: &RunConfig,
) -> Result<()> {
    let comm: Arc<LocalComm> = Arc::new(comm);
    let result = worker_pass(&comm, splats, config);
    if result.is_err() && !comm.is_aborted() {
        // Fatal on this rank: broadcast so the root and the other workers
        // unwind instead of waiting for us.
        comm.abort();
        return result;
    }
    if result.is_ok() {
        collect_stats(
            comm.as_ref(),
            0,
            &stats::Snapshot::default(),
            stats::registry(),
        )?;
    }
    result
}

fn worker_pass(
    comm: &Arc<LocalComm>,
    splats: &IndexedSplats<FileSet>,
    config: &RunConfig,
) -> Result<()> {
    let load_bytes = (2 * config.max_load_splats as usize)
        .max(16)
        .saturating_mul(std::mem::size_of::<crate::splat::Splat>());
    let ring = Arc::new(CircularBuffer::new("load", load_bytes));
    let loader = BucketLoader::new(splats, Arc::clone(&ring));
    let pipeline = DevicePipeline::new(
        &format!("worker{}", comm.rank()),
        Arc::new(MlsProgram::default()),
    );

    for pass in 0..NUM_PASSES {
        let gather = Arc::new(GatherGroup::new(
            Arc::clone(comm) as Arc<dyn Comm>,
            0,
            config.mem_gather,
        ));
        let mut progress = ProgressSender::new(
            Arc::clone(comm) as Arc<dyn Comm>,
            0,
            pass,
            splats.num_splats(),
        );

        while let Some(bins) = request_work(comm.as_ref(), 0)? {
            stats::counter("worker.batches").add(1);
            let batch = loader.load(bins)?;
            let mut events = Vec::with_capacity(batch.bins().len());
            for bin in batch.bins().to_vec() {
                // Upload: gather this bin's working set out of the batch
                // buffer.
                let mut bin_splats =
                    Vec::with_capacity(bin.num_splats as usize);
                for (start, len) in batch.bin_segments(&bin) {
                    bin_splats.extend_from_slice(
                        &batch.splats()[start as usize..(start + len) as usize],
                    );
                }
                let splat_count = bin.num_splats;
                events.push((
                    pipeline.process_bin(bin, bin_splats, Arc::clone(&gather)),
                    splat_count,
                ));
            }
            loader.unload(batch);
            for (event, splat_count) in events {
                event.wait()?;
                progress.add(splat_count)?;
            }
        }

        pipeline.finish()?;
        Arc::into_inner(gather)
            .ok_or_else(|| Error::Internal("gather group still referenced".into()))?
            .stop()?;
        progress.sync()?;
    }
    Ok(())
}
