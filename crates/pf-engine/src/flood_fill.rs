use pf_core::{AreaId, Graph, NodeIndex};

/// Runs flood fill over a set of graphs, assigning connected-component
/// area ids to every walkable node (spec.md §4.7).
///
/// `max_area_index` is the highest area id the bit-packed representation
/// can hold; components smaller than `min_area_size` are candidates for
/// collapsing into it once the counter would otherwise exceed that ceiling.
pub(crate) struct FloodFiller {
    max_area_index: u32,
    min_area_size: usize,
}

/// Emitted when a too-small component couldn't be relabeled into
/// `MaxAreaIndex` because none was available to sacrifice. The partition
/// produced is still valid; this is purely informational.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoSmallComponentAvailable {
    pub area_id: u32,
}

impl FloodFiller {
    pub(crate) fn new(max_area_index: u32, min_area_size: usize) -> Self {
        FloodFiller {
            max_area_index,
            min_area_size,
        }
    }

    /// Re-assigns every walkable node's area across all `graphs`. Returns
    /// the warnings raised for components that couldn't be relabeled.
    ///
    /// Takes trait-object references rather than owned `Box<dyn Graph>`s so
    /// the engine can run this against graphs it only ever holds behind
    /// `Arc<Mutex<..>>` (locked for the duration of the call, inside the
    /// blocked window) without an extra layer of boxing.
    pub(crate) fn run(&self, graphs: &mut [&mut dyn Graph]) -> Vec<NoSmallComponentAvailable> {
        for graph in graphs.iter_mut() {
            zero_areas(&mut **graph);
        }

        let mut warnings = Vec::new();
        let mut next_area: u32 = 1;
        // Remembers (graph_index, area_id, size) for small components seen
        // so far, in the order they were assigned — "most recent" per
        // spec.md §4.7 step 3 is the last entry.
        let mut small_components: Vec<(usize, u32, usize)> = Vec::new();

        for graph_index in 0..graphs.len() {
            let mut live_nodes = Vec::new();
            graphs[graph_index].get_nodes(&mut |node| {
                live_nodes.push(node.index);
                true
            });

            for seed in live_nodes {
                let already_assigned = match graphs[graph_index].node(seed) {
                    Some(node) => !node.walkable || node.area != AreaId::NONE,
                    None => true,
                };
                if already_assigned {
                    continue;
                }

                let area_id = if next_area >= self.max_area_index {
                    match small_components.pop() {
                        Some((small_graph, reused_id, _)) => {
                            relabel_area(&mut *graphs[small_graph], reused_id, self.max_area_index);
                            reused_id
                        }
                        None => {
                            warnings.push(NoSmallComponentAvailable {
                                area_id: next_area,
                            });
                            next_area -= 1;
                            next_area
                        }
                    }
                } else {
                    next_area
                };

                let size = spread(&mut *graphs[graph_index], seed, AreaId(area_id));

                if area_id == next_area {
                    next_area += 1;
                }
                if size < self.min_area_size {
                    small_components.push((graph_index, area_id, size));
                }
            }
        }

        warnings
    }
}

fn zero_areas(graph: &mut dyn Graph) {
    let mut live = Vec::new();
    graph.get_nodes(&mut |node| {
        live.push(node.index);
        true
    });
    for index in live {
        graph.set_node_area(index, AreaId::NONE);
    }
}

/// Relabels every node currently carrying area `from` to area `to` —
/// the "collapse this small component into MaxAreaIndex" step.
fn relabel_area(graph: &mut dyn Graph, from: u32, to: u32) {
    let mut matching = Vec::new();
    graph.get_nodes(&mut |node| {
        if node.area == AreaId(from) {
            matching.push(node.index);
        }
        true
    });
    for index in matching {
        graph.set_node_area(index, AreaId(to));
    }
}

/// Explicit work-stack BFS/DFS from `seed`, assigning `area` to every
/// walkable node reachable through walkable neighbours. Returns the
/// component's size.
fn spread(graph: &mut dyn Graph, seed: NodeIndex, area: AreaId) -> usize {
    let mut stack = vec![seed];
    let mut size = 0;
    let mut neighbours = Vec::new();

    graph.set_node_area(seed, area);

    while let Some(index) = stack.pop() {
        size += 1;
        neighbours.clear();
        graph.neighbours(index, &mut neighbours);
        for next in neighbours.drain(..) {
            let Some(node) = graph.node(next) else {
                continue;
            };
            if !node.walkable || node.area != AreaId::NONE {
                continue;
            }
            graph.set_node_area(next, area);
            stack.push(next);
        }
    }

    size
}
