use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use splatmesh::pipeline::{resume, run, RunConfig};
use splatmesh::stats;

/// Watertight surface reconstruction from splat clouds.
#[derive(Parser, Debug)]
#[command(name = "splatmesh", version, about)]
struct Cli {
    /// Input PLY files with x/y/z/nx/ny/nz/radius float vertices
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Output file (single-file mode) or basename (chunked mode)
    #[arg(short, long, value_name = "FILE")]
    output: PathBuf,

    /// World units per grid cell
    #[arg(long, default_value_t = 0.01)]
    spacing: f32,

    /// Splats per scattered batch
    #[arg(long, default_value_t = 20_000_000)]
    max_load_splats: u64,

    /// Splats per device bin
    #[arg(long, default_value_t = 1_000_000)]
    max_device_splats: u64,

    /// Cells per device bin
    #[arg(long, default_value_t = 1 << 22)]
    max_cells: u64,

    /// Maximum splits per axis at each bucket recursion
    #[arg(long, default_value_t = 2)]
    max_split: u64,

    /// Microblock edge in cells (power of two)
    #[arg(long, default_value_t = 8)]
    microblock: u64,

    /// Root-side mesh receive buffer, bytes
    #[arg(long, default_value_t = 512 << 20)]
    mem_mesh: usize,

    /// Worker-side gather buffer, bytes
    #[arg(long, default_value_t = 256 << 20)]
    mem_gather: usize,

    /// Output chunk edge in cells (0 = single output file)
    #[arg(long, default_value_t = 0)]
    chunk_cells: u64,

    /// Prune components below this fraction of total vertices
    #[arg(long, default_value_t = 0.02)]
    prune_threshold: f64,

    /// Input splat radius multiplier (sets the MLS support)
    #[arg(long, default_value_t = 1.0)]
    radius_scale: f32,

    /// Warn when no progress arrives for this many seconds (never aborts)
    #[arg(long, value_name = "SECS")]
    stall_warning_secs: Option<u64>,

    /// Spill directory for the out-of-core assembly
    #[arg(long, value_name = "DIR")]
    tmp_dir: Option<PathBuf>,

    /// Number of device workers
    #[arg(long, default_value_t = 1)]
    workers: usize,

    /// Keep the sealed spill directory after a successful run
    #[arg(long)]
    keep_spill: bool,

    /// Skip to finalization from an existing sealed spill directory
    #[arg(long, value_name = "DIR")]
    resume: Option<PathBuf>,

    /// Write a JSON statistics snapshot on exit
    #[arg(long, value_name = "FILE")]
    stats_output: Option<PathBuf>,

    /// Log level (overrides RUST_LOG): error, warn, info, debug, trace
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(cli.log_level.clone()),
    )
    .init();

    let tmp_dir = cli
        .tmp_dir
        .clone()
        .unwrap_or_else(|| std::env::temp_dir().join("splatmesh-spill"));
    let config = RunConfig {
        inputs: cli.inputs.clone(),
        output: cli.output.clone(),
        spacing: cli.spacing,
        max_load_splats: cli.max_load_splats,
        max_device_splats: cli.max_device_splats,
        max_cells: cli.max_cells,
        max_split: cli.max_split,
        microblock: cli.microblock,
        mem_mesh: cli.mem_mesh,
        mem_gather: cli.mem_gather,
        chunk_cells: cli.chunk_cells,
        prune_threshold: cli.prune_threshold,
        tmp_dir,
        workers: cli.workers,
        radius_scale: cli.radius_scale,
        stall_warning: cli
            .stall_warning_secs
            .map(std::time::Duration::from_secs),
        keep_spill: cli.keep_spill,
    };

    let result = match &cli.resume {
        Some(spill) => resume(&config, spill),
        None => run(&config),
    };

    if let Some(path) = &cli.stats_output {
        let snapshot = stats::registry().snapshot();
        let written = std::fs::File::create(path)
            .map_err(|e| e.to_string())
            .and_then(|f| serde_json::to_writer_pretty(f, &snapshot).map_err(|e| e.to_string()));
        if let Err(e) = written {
            log::warn!("could not write statistics to {}: {}", path.display(), e);
        }
    }

    match result {
        Ok(0) => {
            log::warn!("no output files written");
            ExitCode::SUCCESS
        }
        Ok(n) => {
            log::info!(
                "{} output file{} written",
                n,
                if n == 1 { "" } else { "s" }
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
