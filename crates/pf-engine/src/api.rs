use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How many search-worker threads to run, mirroring the teacher's
/// `PinMode`-style small config enum (`client-engine/src/api.rs`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerCountHint {
    /// Use `std::thread::available_parallelism()`.
    Auto,
    /// Use exactly this many worker threads.
    Fixed(usize),
    /// No OS threads at all; step a single cooperative worker from `tick`.
    Single,
}

/// Engine-wide configuration (spec.md §4.9's `Initialize`, §4.6's rate
/// limit, §4.7's area budget).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Search worker thread count.
    pub workers: WorkerCountHint,
    /// Per-iteration search budget; re-read live on every yield.
    pub search_tick_budget: Duration,
    /// Minimum interval between graph-update flushes, if rate-limited.
    pub graph_update_min_interval: Option<Duration>,
    /// Highest area id the bit-packed representation can hold.
    pub max_area_index: u32,
    /// Components smaller than this are candidates for collapsing into
    /// `max_area_index`.
    pub min_area_size: usize,
    /// Results farther than this from the query point are rejected by
    /// `get_nearest`.
    pub max_nearest_node_distance: f32,
    /// If set, `get_nearest` stops scanning further graphs once a graph
    /// returns a node within this distance.
    pub prioritize_graphs_limit: Option<f32>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            workers: WorkerCountHint::Auto,
            search_tick_budget: Duration::from_micros(500),
            graph_update_min_interval: None,
            max_area_index: 65_535,
            min_area_size: 1,
            max_nearest_node_distance: f32::INFINITY,
            prioritize_graphs_limit: None,
        }
    }
}

/// Broadcast event stream payload, mirroring the teacher's `EngineEvent`
/// (`client-engine/src/api.rs`) generalized from job lifecycle to path
/// and scan lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum EngineEvent {
    Started,
    ScanStarted,
    ScanCompleted { duration_ms: u64 },
    PathStarted { path_id: u16 },
    PathReturned { path_id: u16, errored: bool, duration_ms: u64 },
    GraphsUpdated,
    Overflow65k,
    Warning { message: String },
    Terminated,
}

/// Point-in-time snapshot of engine state, mirroring the teacher's
/// `StatusSnapshot`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StatusSnapshot {
    pub terminated: bool,
    pub worker_count: usize,
    pub queued_paths: usize,
    pub graph_count: usize,
}
