use std::any::Any;

use crate::handles::{AreaId, NodeIndex, Point3};

/// A single node as seen from outside the graph that owns it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Node {
    pub index: NodeIndex,
    pub area: AreaId,
    pub walkable: bool,
    pub penalty: u32,
    pub graph_index: u8,
    pub position: Point3,
}

/// Result of a nearest-node query (spec.md §4.10).
#[derive(Debug, Clone, Copy)]
pub struct NearestInfo {
    pub node: NodeIndex,
    pub clamped_position: Point3,
    pub constrained_node: Option<NodeIndex>,
    pub constrained_position: Option<Point3>,
}

impl NearestInfo {
    pub fn distance_to(&self, from: Point3) -> f32 {
        from.distance(self.clamped_position)
    }
}

/// Which thread a graph update must run on, per spec.md §4.6: the graph
/// itself decides, via [`Graph::threading_class`], because only it knows
/// whether its internal structures can be touched off the main thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadingClass {
    /// Must run entirely on the main thread, inside the blocked window.
    MainThread,
    /// `Graph::update_area_init` runs on the main thread (inside the
    /// blocked window); `Graph::update_area` then runs on the async
    /// graph-update thread.
    MainThreadInitAsyncBody,
    /// Runs entirely on the async graph-update thread.
    AsyncThread,
}

/// What a [`GraphUpdate`] applies to: either an axis-aligned region or an
/// explicit set of nodes (spec.md §3, `GraphUpdateObject`).
#[derive(Debug, Clone)]
pub enum UpdateTarget {
    Bounds { min: Point3, max: Point3 },
    Nodes(Vec<NodeIndex>),
}

/// An immutable, once-consumed graph mutation request.
///
/// The engine never interprets the mutation payload itself — it only reads
/// [`GraphUpdate::target`] and [`GraphUpdate::requires_flood_fill`] for
/// scheduling, and hands the update back to the owning [`Graph`] via
/// [`Graph::update_area_init`]/[`Graph::update_area`]. Concrete update types
/// downcast through [`GraphUpdate::as_any`] to recover their payload.
pub trait GraphUpdate: Any + Send + Sync {
    fn target(&self) -> &UpdateTarget;
    fn requires_flood_fill(&self) -> bool;
    fn as_any(&self) -> &dyn Any;
}

/// The external collaborator that owns node storage for one graph instance.
///
/// Scan, graph generation, and persistence are out of scope for the engine
/// core (spec.md §1) — this trait is the narrow seam the engine calls
/// across. All mutation methods are only ever invoked while every
/// `SearchWorker` is quiesced (spec.md §5).
pub trait Graph: Send + Sync {
    /// Rebuild from source. May take a long time; called only during
    /// `Engine::scan` while quiesced. `progress` is called with a value in
    /// `0.0..=1.0`.
    fn scan(&mut self, progress: &mut dyn FnMut(f32));

    /// Visit every live node; the visitor returns `false` to stop early.
    fn get_nodes(&self, visitor: &mut dyn FnMut(Node) -> bool);

    /// Nearest node to `pos` passing `constraint`, if any.
    fn get_nearest(
        &self,
        pos: Point3,
        constraint: Option<&dyn Fn(NodeIndex) -> bool>,
    ) -> Option<NearestInfo>;

    /// Exhaustive nearest-node query, used when [`Graph::get_nearest`]'s
    /// spatial-index shortcut misses a node that satisfies the constraint.
    fn get_nearest_force(
        &self,
        pos: Point3,
        constraint: Option<&dyn Fn(NodeIndex) -> bool>,
    ) -> Option<NearestInfo>;

    /// Classify an update so the scheduler knows which thread(s) it runs on.
    fn threading_class(&self, update: &dyn GraphUpdate) -> ThreadingClass;

    /// Main-thread half of a [`ThreadingClass::MainThreadInitAsyncBody`]
    /// update; a no-op for updates that don't need one.
    fn update_area_init(&mut self, update: &dyn GraphUpdate) -> anyhow::Result<()>;

    /// Apply the update body. Runs on the main thread for
    /// [`ThreadingClass::MainThread`], on the async thread otherwise.
    fn update_area(&mut self, update: &dyn GraphUpdate) -> anyhow::Result<()>;

    fn node(&self, index: NodeIndex) -> Option<Node>;
    fn set_node_area(&mut self, index: NodeIndex, area: AreaId);
    fn neighbours(&self, index: NodeIndex, out: &mut Vec<NodeIndex>);
    fn max_node_index(&self) -> i32;
}
