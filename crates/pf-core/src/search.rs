use std::time::Instant;

use crate::handles::{NodeIndex, PathId};

/// Per-node transient state a search writes while it runs (spec.md §3,
/// `PathHandler`'s entry shape).
///
/// `visited_path_id` disambiguates stale entries from a previous search
/// without clearing the array: a node belongs to the current search iff
/// `visited_path_id` equals the path's id.
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeSearchState {
    pub g: f32,
    pub h: f32,
    pub f: f32,
    pub parent: NodeIndex,
    pub visited_path_id: PathId,
}

/// Per-worker scratch memory, indexed by [`NodeIndex`], holding the
/// transient state of whichever search that worker is currently running.
///
/// Grown on demand (never shrunk) when the node-index range expands; the
/// owning engine only ever calls [`PathHandler::grow_to`] while every
/// worker is quiesced (spec.md §4.4).
pub struct PathHandler {
    nodes: Vec<NodeSearchState>,
}

impl PathHandler {
    pub fn new() -> Self {
        PathHandler { nodes: Vec::new() }
    }

    /// Ensure the table covers at least `max_index + 1` entries.
    pub fn grow_to(&mut self, max_index: i32) {
        let needed = (max_index.max(0) as usize) + 1;
        if needed > self.nodes.len() {
            self.nodes.resize(needed, NodeSearchState::default());
        }
    }

    pub fn capacity_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn get(&self, index: NodeIndex) -> NodeSearchState {
        self.nodes
            .get(index.get() as usize)
            .copied()
            .unwrap_or_default()
    }

    pub fn get_mut(&mut self, index: NodeIndex) -> &mut NodeSearchState {
        let idx = index.get() as usize;
        if idx >= self.nodes.len() {
            self.nodes.resize(idx + 1, NodeSearchState::default());
        }
        &mut self.nodes[idx]
    }

    /// True if `index` was touched by the search currently tagged `path_id`.
    pub fn visited(&self, index: NodeIndex, path_id: PathId) -> bool {
        self.get(index).visited_path_id == path_id
    }

    /// Zero every entry's `visited_path_id`. Called once, from a `WorkItem`,
    /// the moment `PathIdGenerator` wraps — otherwise a stale marker left
    /// over from 65536 searches ago could coincidentally equal the next
    /// reused id and be misread as "already visited this search".
    pub fn reset_visited(&mut self) {
        for entry in &mut self.nodes {
            entry.visited_path_id = PathId::NONE;
        }
    }
}

impl Default for PathHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// The search-algorithm inner loop (A*/Dijkstra/etc). Out of scope for the
/// engine core (spec.md §1) — the engine only ever calls these five
/// methods, in this order, on whatever a caller boxed up and attached to a
/// `Path`. `pf-demo` provides the one concrete implementation in this
/// workspace.
pub trait PathSearch: Send {
    /// Resolve start/end positions to node indices using `handler`'s owning
    /// graph. Called once, before `prepare`. `path_id` is this search's
    /// freshly-allocated id — implementations that tag `PathHandler` entries
    /// with `NodeSearchState::visited_path_id` need it to tell "visited by
    /// this search" apart from a stale entry left by a previous one.
    fn prepare_base(&mut self, handler: &mut PathHandler, path_id: PathId);

    /// Validate the request (e.g. start/end resolved, reachable areas
    /// match). Returns `true` if the path is already done (invalid request)
    /// — in which case `initialize` is skipped entirely.
    fn prepare(&mut self) -> bool;

    /// Seed the open set. Called once, only if `prepare` returned `false`.
    /// Receives `handler` so implementations can write the seed's initial
    /// `g`/`h`/`f` into the shared per-node scratch table.
    fn initialize(&mut self, handler: &mut PathHandler);

    /// Run search iterations until `target_tick` or completion, whichever
    /// comes first. Returns `true` once the search is fully done. `handler`
    /// is the same per-worker scratch table across every call for a given
    /// search, re-locked by the caller each time — this is where the open
    /// set's g/h/f/parent state actually lives.
    fn calculate_step(&mut self, handler: &mut PathHandler, target_tick: Instant) -> bool;

    fn is_done(&self) -> bool;

    /// Release any scratch state tied to this run. Called exactly once, at
    /// the end of `drive_search`/`CooperativeWorker::step` — before the
    /// path is pushed onto the return pipeline, not after.
    fn cleanup(&mut self);
}
