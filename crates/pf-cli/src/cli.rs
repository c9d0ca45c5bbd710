use clap::{Parser, ValueEnum};

use pf_engine::WorkerCountHint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum WorkersArg {
    /// `std::thread::available_parallelism()` worker threads.
    Auto,
    /// No OS threads; step a single cooperative worker from the tick loop.
    Single,
}

pub fn default_grid_side() -> u32 {
    48
}

#[derive(Debug, Clone, Parser)]
#[command(name = "pf-cli", version, about = "Demo driver for the pathfinding engine core")]
pub struct Cli {
    /// Grid width in cells.
    #[arg(long, env = "PF_WIDTH", default_value_t = default_grid_side())]
    pub width: u32,

    /// Grid height in cells.
    #[arg(long, env = "PF_HEIGHT", default_value_t = default_grid_side())]
    pub height: u32,

    /// Worker scheduling mode.
    #[arg(long, value_enum, default_value_t = WorkersArg::Auto)]
    pub workers: WorkersArg,

    /// Pin the worker thread count instead of using `--workers auto`.
    #[arg(long, conflicts_with = "workers")]
    pub worker_count: Option<usize>,

    /// Number of demo path requests to submit.
    #[arg(short = 'n', long, default_value_t = 8)]
    pub paths: usize,

    /// Per-iteration search budget, in microseconds.
    #[arg(long, default_value_t = 500)]
    pub tick_budget_us: u64,

    /// Carve a wall down the middle column, splitting the grid into two
    /// flood-fill areas, to exercise the "no route" path.
    #[arg(long, default_value_t = false)]
    pub split_areas: bool,
}

impl Cli {
    pub fn worker_hint(&self) -> WorkerCountHint {
        if let Some(n) = self.worker_count {
            return WorkerCountHint::Fixed(n);
        }
        match self.workers {
            WorkersArg::Auto => WorkerCountHint::Auto,
            WorkersArg::Single => WorkerCountHint::Single,
        }
    }
}
