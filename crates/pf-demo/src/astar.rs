//! A concrete `PathSearch` implementation (spec.md §6's `Path.prepareBase/
//! prepare/initialize/calculateStep/isDone/cleanup`): grid A* with a
//! straight-line heuristic, time-sliced across `calculate_step` calls.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

use pf_core::{NodeIndex, PathHandler, PathId, PathSearch, Point3};

use crate::grid::GridGraph;

/// An open-set entry ordered by `f` (ascending), the classic A* priority.
/// `BinaryHeap` is a max-heap, so the `Ord` impl below reverses the
/// comparison to pop the smallest `f` first.
struct OpenEntry {
    f: f32,
    node: NodeIndex,
}

impl PartialEq for OpenEntry {
    fn eq(&self, other: &Self) -> bool {
        self.f == other.f
    }
}
impl Eq for OpenEntry {}
impl PartialOrd for OpenEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for OpenEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.f.partial_cmp(&self.f).unwrap_or(Ordering::Equal)
    }
}

/// A single grid A* search. Constructed with start/end world positions and
/// handed to `Engine::start_path` boxed as `dyn PathSearch`; the engine
/// never inspects its fields directly.
pub struct AStarSearch {
    graph: GridGraph,
    start_pos: Point3,
    end_pos: Point3,
    start: Option<NodeIndex>,
    end: Option<NodeIndex>,
    path_id: PathId,
    open: BinaryHeap<OpenEntry>,
    done: bool,
    found: bool,
    result: Vec<NodeIndex>,
    iterations: u64,
}

impl AStarSearch {
    pub fn new(graph: GridGraph, start_pos: Point3, end_pos: Point3) -> Self {
        AStarSearch {
            graph,
            start_pos,
            end_pos,
            start: None,
            end: None,
            path_id: PathId::NONE,
            open: BinaryHeap::new(),
            done: false,
            found: false,
            result: Vec::new(),
            iterations: 0,
        }
    }

    /// The resolved node sequence from start to end, in order. Empty until
    /// `is_done()` and only meaningful if the search actually found a route
    /// (see [`AStarSearch::found`]).
    pub fn result(&self) -> &[NodeIndex] {
        &self.result
    }

    pub fn found(&self) -> bool {
        self.found
    }

    fn heuristic(&self, node: NodeIndex) -> f32 {
        match self.graph.node(node) {
            Some(n) => n.position.distance(self.end_pos),
            None => f32::INFINITY,
        }
    }
}

impl PathSearch for AStarSearch {
    fn prepare_base(&mut self, _handler: &mut PathHandler, path_id: PathId) {
        self.path_id = path_id;
        self.start = self.graph.node_at_position(self.start_pos);
        self.end = self.graph.node_at_position(self.end_pos);
    }

    fn prepare(&mut self) -> bool {
        match (self.start, self.end) {
            (Some(start), Some(end)) => {
                let start_walkable = self.graph.node(start).is_some_and(|n| n.walkable);
                let end_walkable = self.graph.node(end).is_some_and(|n| n.walkable);
                if !start_walkable || !end_walkable {
                    self.done = true;
                    return true;
                }
                let start_area = self.graph.node(start).map(|n| n.area);
                let end_area = self.graph.node(end).map(|n| n.area);
                if start_area != end_area {
                    // Flood-fill areas differ: unreachable without running
                    // a single search step (spec.md §4.7's rationale).
                    self.done = true;
                    return true;
                }
                false
            }
            _ => {
                self.done = true;
                true
            }
        }
    }

    fn initialize(&mut self, handler: &mut PathHandler) {
        let Some(start) = self.start else { return };
        let h = self.heuristic(start);
        let entry = handler.get_mut(start);
        entry.g = 0.0;
        entry.h = h;
        entry.f = h;
        entry.parent = NodeIndex::NONE;
        entry.visited_path_id = self.path_id;
        self.open.push(OpenEntry { f: h, node: start });
    }

    fn calculate_step(&mut self, handler: &mut PathHandler, target_tick: Instant) -> bool {
        let (Some(start), Some(end)) = (self.start, self.end) else {
            self.done = true;
            return true;
        };

        loop {
            if self.open.is_empty() {
                self.done = true;
                self.found = false;
                return true;
            }

            let current = self.open.pop().expect("checked non-empty").node;
            if current == end {
                self.done = true;
                self.found = true;
                self.reconstruct(handler, start, end);
                return true;
            }

            let current_g = handler.get(current).g;
            let mut neighbours = Vec::new();
            self.graph.neighbours(current, &mut neighbours);
            for next in neighbours {
                let Some(node) = self.graph.node(next) else { continue };
                if !node.walkable {
                    continue;
                }
                let step_cost = 1.0 + node.penalty as f32;
                let tentative_g = current_g + step_cost;
                let visited = handler.visited(next, self.path_id);
                let next_g = if visited { handler.get(next).g } else { f32::INFINITY };
                if tentative_g < next_g {
                    let h = self.heuristic(next);
                    let entry = handler.get_mut(next);
                    entry.g = tentative_g;
                    entry.h = h;
                    entry.f = tentative_g + h;
                    entry.parent = current;
                    entry.visited_path_id = self.path_id;
                    self.open.push(OpenEntry { f: tentative_g + h, node: next });
                }
            }

            self.iterations += 1;
            if self.iterations % 32 == 0 && Instant::now() >= target_tick {
                return false;
            }
        }
    }

    fn is_done(&self) -> bool {
        self.done
    }

    fn cleanup(&mut self) {
        self.open.clear();
    }
}

impl AStarSearch {
    /// Walk `PathHandler`'s parent chain from `end` back to `start`.
    fn reconstruct(&mut self, handler: &PathHandler, start: NodeIndex, end: NodeIndex) {
        let mut path = vec![end];
        let mut current = end;
        while current != start {
            let parent = handler.get(current).parent;
            if parent.is_none() {
                break;
            }
            current = parent;
            path.push(current);
        }
        path.reverse();
        self.result = path;
    }
}
