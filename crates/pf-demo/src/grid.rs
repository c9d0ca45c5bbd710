use std::sync::{Arc, Mutex};

use pf_core::{AreaId, Graph, GraphUpdate, NearestInfo, Node, NodeIndex, Point3, ThreadingClass, UpdateTarget};

/// A single grid cell's persistent state.
struct Cell {
    walkable: bool,
    penalty: u32,
    area: AreaId,
}

/// Decides a cell's terrain from its grid coordinates, applied fresh on
/// every [`GridGraph::scan`] — the "rebuild from source" step spec.md §6
/// describes, standing in for a navmesh/heightmap loader.
type TerrainFn = Box<dyn Fn(i32, i32) -> (bool, u32) + Send + Sync>;

struct Inner {
    width: i32,
    height: i32,
    cell_size: f32,
    graph_index: u8,
    terrain: TerrainFn,
    cells: Vec<Cell>,
}

impl Inner {
    fn index_of(&self, x: i32, y: i32) -> NodeIndex {
        NodeIndex::new(y * self.width + x + 1)
    }

    fn to_coords(&self, index: NodeIndex) -> Option<(i32, i32)> {
        let raw = index.get() - 1;
        if raw < 0 || raw >= self.width * self.height {
            return None;
        }
        Some((raw % self.width, raw / self.width))
    }

    fn position_of(&self, x: i32, y: i32) -> Point3 {
        Point3::new(x as f32 * self.cell_size, 0.0, y as f32 * self.cell_size)
    }

    fn cell(&self, x: i32, y: i32) -> &Cell {
        &self.cells[(y * self.width + x) as usize]
    }

    fn cell_mut(&mut self, x: i32, y: i32) -> &mut Cell {
        &mut self.cells[(y * self.width + x) as usize]
    }

    fn node_at(&self, x: i32, y: i32) -> Node {
        let cell = self.cell(x, y);
        Node {
            index: self.index_of(x, y),
            area: cell.area,
            walkable: cell.walkable,
            penalty: cell.penalty,
            graph_index: self.graph_index,
            position: self.position_of(x, y),
        }
    }

    /// Resolve an [`UpdateTarget`] to the set of in-bounds grid coordinates
    /// it covers.
    fn resolve(&self, target: &UpdateTarget) -> Vec<(i32, i32)> {
        match target {
            UpdateTarget::Nodes(nodes) => nodes.iter().filter_map(|&n| self.to_coords(n)).collect(),
            UpdateTarget::Bounds { min, max } => {
                let mut out = Vec::new();
                for y in 0..self.height {
                    for x in 0..self.width {
                        let pos = self.position_of(x, y);
                        if pos.x >= min.x && pos.x <= max.x && pos.z >= min.z && pos.z <= max.z {
                            out.push((x, y));
                        }
                    }
                }
                out
            }
        }
    }
}

/// A bounded grid `Graph` implementation — the demo collaborator spec.md §1
/// places out of the engine's core.
///
/// Cheap to clone: every handle shares the same backing [`Inner`] behind an
/// `Arc<Mutex<_>>`, so a caller can hand one clone to [`pf_engine::Engine`]
/// (boxed as `dyn Graph`) while keeping another to resolve positions for its
/// own [`crate::astar::AStarSearch`] instances — mirroring how a real graph
/// generator is shared between the engine and whatever issues path
/// requests against it.
#[derive(Clone)]
pub struct GridGraph {
    inner: Arc<Mutex<Inner>>,
}

impl GridGraph {
    pub fn new(
        width: i32,
        height: i32,
        cell_size: f32,
        graph_index: u8,
        terrain: impl Fn(i32, i32) -> (bool, u32) + Send + Sync + 'static,
    ) -> Self {
        let cells = (0..(width * height) as usize)
            .map(|_| Cell { walkable: false, penalty: 0, area: AreaId::NONE })
            .collect();
        GridGraph {
            inner: Arc::new(Mutex::new(Inner {
                width,
                height,
                cell_size,
                graph_index,
                terrain: Box::new(terrain),
                cells,
            })),
        }
    }

    /// Resolve a world position to the grid cell it falls in, regardless of
    /// that cell's walkability — used by `AStarSearch::prepare_base` to
    /// turn a start/end position into a `NodeIndex` before walkability and
    /// reachability are checked in `prepare`.
    pub fn node_at_position(&self, pos: Point3) -> Option<NodeIndex> {
        let inner = self.inner.lock().expect("grid mutex poisoned");
        let x = (pos.x / inner.cell_size).round() as i32;
        let y = (pos.z / inner.cell_size).round() as i32;
        if x < 0 || y < 0 || x >= inner.width || y >= inner.height {
            None
        } else {
            Some(inner.index_of(x, y))
        }
    }

    /// Build a [`GridUpdate`] that flips walkability for the given cells,
    /// classified [`ThreadingClass::MainThread`] since it must land before
    /// the flood fill it triggers runs.
    pub fn set_walkable_update(&self, cells: &[(i32, i32)], walkable: bool) -> GridUpdate {
        let inner = self.inner.lock().expect("grid mutex poisoned");
        let nodes = cells.iter().map(|&(x, y)| inner.index_of(x, y)).collect();
        GridUpdate::SetWalkable { target: UpdateTarget::Nodes(nodes), walkable }
    }

    /// Build a [`GridUpdate`] that adds `bonus` to the traversal penalty of
    /// the given cells, classified
    /// [`ThreadingClass::MainThreadInitAsyncBody`]: the body can lag behind
    /// a blocked window since a stale penalty only biases the heuristic,
    /// it doesn't break correctness.
    pub fn rebias_penalty_update(&self, cells: &[(i32, i32)], bonus: u32) -> GridUpdate {
        let inner = self.inner.lock().expect("grid mutex poisoned");
        let nodes = cells.iter().map(|&(x, y)| inner.index_of(x, y)).collect();
        GridUpdate::RebiasPenalty { target: UpdateTarget::Nodes(nodes), bonus }
    }

    /// Build a [`GridUpdate`] that only logs a snapshot, classified
    /// [`ThreadingClass::AsyncThread`] since it never touches node state.
    pub fn export_snapshot_update(&self) -> GridUpdate {
        GridUpdate::ExportSnapshot
    }
}

impl Graph for GridGraph {
    fn scan(&mut self, progress: &mut dyn FnMut(f32)) {
        let mut inner = self.inner.lock().expect("grid mutex poisoned");
        let height = inner.height;
        for y in 0..height {
            for x in 0..inner.width {
                let (walkable, penalty) = (inner.terrain)(x, y);
                let cell = inner.cell_mut(x, y);
                cell.walkable = walkable;
                cell.penalty = penalty;
                cell.area = AreaId::NONE;
            }
            progress((y + 1) as f32 / height.max(1) as f32);
        }
    }

    fn get_nodes(&self, visitor: &mut dyn FnMut(Node) -> bool) {
        let inner = self.inner.lock().expect("grid mutex poisoned");
        for y in 0..inner.height {
            for x in 0..inner.width {
                if !visitor(inner.node_at(x, y)) {
                    return;
                }
            }
        }
    }

    fn get_nearest(
        &self,
        pos: Point3,
        constraint: Option<&dyn Fn(NodeIndex) -> bool>,
    ) -> Option<NearestInfo> {
        self.nearest(pos, constraint, false)
    }

    fn get_nearest_force(
        &self,
        pos: Point3,
        constraint: Option<&dyn Fn(NodeIndex) -> bool>,
    ) -> Option<NearestInfo> {
        self.nearest(pos, constraint, true)
    }

    fn threading_class(&self, update: &dyn GraphUpdate) -> ThreadingClass {
        match update.as_any().downcast_ref::<GridUpdate>() {
            Some(GridUpdate::SetWalkable { .. }) => ThreadingClass::MainThread,
            Some(GridUpdate::RebiasPenalty { .. }) => ThreadingClass::MainThreadInitAsyncBody,
            Some(GridUpdate::ExportSnapshot) => ThreadingClass::AsyncThread,
            None => ThreadingClass::MainThread,
        }
    }

    fn update_area_init(&mut self, update: &dyn GraphUpdate) -> anyhow::Result<()> {
        let Some(update) = update.as_any().downcast_ref::<GridUpdate>() else {
            return Ok(());
        };
        if let GridUpdate::RebiasPenalty { target, .. } = update {
            let inner = self.inner.lock().expect("grid mutex poisoned");
            tracing::trace!(cells = inner.resolve(target).len(), "penalty rebias init");
        }
        Ok(())
    }

    fn update_area(&mut self, update: &dyn GraphUpdate) -> anyhow::Result<()> {
        let Some(update) = update.as_any().downcast_ref::<GridUpdate>() else {
            anyhow::bail!("GridGraph received a foreign GraphUpdate implementation");
        };
        let mut inner = self.inner.lock().expect("grid mutex poisoned");
        match update {
            GridUpdate::SetWalkable { target, walkable } => {
                for (x, y) in inner.resolve(target) {
                    let cell = inner.cell_mut(x, y);
                    cell.walkable = *walkable;
                    cell.area = AreaId::NONE;
                }
            }
            GridUpdate::RebiasPenalty { target, bonus } => {
                for (x, y) in inner.resolve(target) {
                    let cell = inner.cell_mut(x, y);
                    cell.penalty = cell.penalty.saturating_add(*bonus);
                }
            }
            GridUpdate::ExportSnapshot => {
                tracing::info!(width = inner.width, height = inner.height, "grid snapshot exported");
            }
        }
        Ok(())
    }

    fn node(&self, index: NodeIndex) -> Option<Node> {
        let inner = self.inner.lock().expect("grid mutex poisoned");
        let (x, y) = inner.to_coords(index)?;
        Some(inner.node_at(x, y))
    }

    fn set_node_area(&mut self, index: NodeIndex, area: AreaId) {
        let mut inner = self.inner.lock().expect("grid mutex poisoned");
        if let Some((x, y)) = inner.to_coords(index) {
            inner.cell_mut(x, y).area = area;
        }
    }

    fn neighbours(&self, index: NodeIndex, out: &mut Vec<NodeIndex>) {
        let inner = self.inner.lock().expect("grid mutex poisoned");
        let Some((x, y)) = inner.to_coords(index) else {
            return;
        };
        for dy in -1..=1 {
            for dx in -1..=1 {
                if dx == 0 && dy == 0 {
                    continue;
                }
                let (nx, ny) = (x + dx, y + dy);
                if nx >= 0 && ny >= 0 && nx < inner.width && ny < inner.height {
                    out.push(inner.index_of(nx, ny));
                }
            }
        }
    }

    fn max_node_index(&self) -> i32 {
        let inner = self.inner.lock().expect("grid mutex poisoned");
        inner.width * inner.height
    }
}

impl GridGraph {
    fn nearest(
        &self,
        pos: Point3,
        constraint: Option<&dyn Fn(NodeIndex) -> bool>,
        force: bool,
    ) -> Option<NearestInfo> {
        let inner = self.inner.lock().expect("grid mutex poisoned");
        let mut best: Option<(NodeIndex, Point3, f32)> = None;
        for y in 0..inner.height {
            for x in 0..inner.width {
                let node = inner.node_at(x, y);
                if !force && !node.walkable {
                    continue;
                }
                if let Some(constraint) = constraint {
                    if !constraint(node.index) {
                        continue;
                    }
                }
                let distance = pos.distance(node.position);
                let better = match &best {
                    None => true,
                    Some((_, _, best_distance)) => distance < *best_distance,
                };
                if better {
                    best = Some((node.index, node.position, distance));
                }
            }
        }
        best.map(|(node, position, _)| NearestInfo {
            node,
            clamped_position: position,
            constrained_node: constraint.map(|_| node),
            constrained_position: constraint.map(|_| position),
        })
    }
}

/// The one concrete [`GraphUpdate`] this demo ships, covering all three
/// [`ThreadingClass`] values so `GridGraph::threading_class` has something
/// real to classify.
#[derive(Debug, Clone)]
pub enum GridUpdate {
    /// Flip walkability for a set of cells; always requires a flood fill.
    SetWalkable { target: UpdateTarget, walkable: bool },
    /// Add to the traversal penalty of a set of cells.
    RebiasPenalty { target: UpdateTarget, bonus: u32 },
    /// No mutation; just exercises the async-thread-only classification.
    ExportSnapshot,
}

impl GraphUpdate for GridUpdate {
    fn target(&self) -> &UpdateTarget {
        const EMPTY: UpdateTarget = UpdateTarget::Nodes(Vec::new());
        match self {
            GridUpdate::SetWalkable { target, .. } => target,
            GridUpdate::RebiasPenalty { target, .. } => target,
            GridUpdate::ExportSnapshot => &EMPTY,
        }
    }

    fn requires_flood_fill(&self) -> bool {
        matches!(self, GridUpdate::SetWalkable { .. })
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
