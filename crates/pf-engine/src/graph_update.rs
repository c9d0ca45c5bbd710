use std::collections::VecDeque;
use std::time::{Duration, Instant};

use pf_core::{Graph, GraphUpdate, ThreadingClass};

/// An update still waiting to be classified against its target graph.
struct QueuedUpdate {
    graph_index: usize,
    update: Box<dyn GraphUpdate>,
}

/// A classified update paired with the index of the graph it targets (an
/// engine holds a `Vec<Arc<Mutex<Box<dyn Graph>>>>`; the scheduler only
/// ever sees indices into it) and the [`ThreadingClass`] it was routed
/// under, so the caller knows which half(s) of `update_area_init`/
/// `update_area` still need to run and on which thread.
pub(crate) struct PendingUpdate {
    pub(crate) graph_index: usize,
    pub(crate) update: Box<dyn GraphUpdate>,
    pub(crate) classification: ThreadingClass,
}

/// Batches graph-update requests, rate-limits flushes, and routes each
/// update to the main-thread (`Regular`) or async-thread (`Async`)
/// sub-queue once it's classified (spec.md §4.6).
///
/// Classification happens at flush time, not at enqueue time, because it
/// depends on a capability query against the *current* target graph —
/// mirrors `client-engine/src/backend.rs` deferring its
/// recoverable/terminal classification until the response is in hand
/// rather than guessing ahead of the request.
pub(crate) struct GraphUpdateScheduler {
    min_interval: Option<Duration>,
    last_flush_at: Option<Instant>,
    delayed_trigger_at: Option<Instant>,
    pending: VecDeque<QueuedUpdate>,
    regular_ready: VecDeque<PendingUpdate>,
    async_ready: VecDeque<PendingUpdate>,
    flood_fill_pending: bool,
}

impl GraphUpdateScheduler {
    pub(crate) fn new(min_interval: Option<Duration>) -> Self {
        GraphUpdateScheduler {
            min_interval,
            last_flush_at: None,
            delayed_trigger_at: None,
            pending: VecDeque::new(),
            regular_ready: VecDeque::new(),
            async_ready: VecDeque::new(),
            flood_fill_pending: false,
        }
    }

    /// Enqueue an update. `delay` mirrors spec.md's "delayed-by-t-seconds"
    /// entry point; `None` means immediate (subject to rate-limit
    /// coalescing same as everything else).
    pub(crate) fn enqueue(
        &mut self,
        graph_index: usize,
        update: Box<dyn GraphUpdate>,
        delay: Option<Duration>,
        now: Instant,
    ) {
        if update.requires_flood_fill() {
            self.flood_fill_pending = true;
        }
        self.pending.push_back(QueuedUpdate { graph_index, update });

        let target = now + delay.unwrap_or(Duration::ZERO);
        match self.delayed_trigger_at {
            Some(existing) if existing <= target => {}
            _ => self.delayed_trigger_at = Some(target),
        }
    }

    /// True once the scheduler thinks a flush is due: no pending items,
    /// or the rate limit isn't engaged, or the rate-limit window has
    /// elapsed since the last flush.
    pub(crate) fn should_flush(&self, now: Instant) -> bool {
        if self.pending.is_empty() {
            return false;
        }
        let Some(trigger) = self.delayed_trigger_at else {
            return true;
        };
        if now < trigger {
            return false;
        }
        match (self.min_interval, self.last_flush_at) {
            (Some(interval), Some(last)) => now.duration_since(last) >= interval,
            _ => true,
        }
    }

    /// `Flush()` from spec.md §4.6: bypasses the rate limit entirely.
    pub(crate) fn force_flush_due(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Classify every pending update against its target graph and move it
    /// into the regular or async ready queue. Call this once
    /// `should_flush`/`force_flush_due` says to proceed.
    pub(crate) fn classify_and_route(&mut self, graphs: &[&dyn Graph], now: Instant) {
        while let Some(item) = self.pending.pop_front() {
            let classification = graphs
                .get(item.graph_index)
                .map(|g| g.threading_class(item.update.as_ref()))
                .unwrap_or(ThreadingClass::MainThread);
            let pending = PendingUpdate {
                graph_index: item.graph_index,
                update: item.update,
                classification,
            };
            match classification {
                ThreadingClass::AsyncThread => self.async_ready.push_back(pending),
                ThreadingClass::MainThread | ThreadingClass::MainThreadInitAsyncBody => {
                    self.regular_ready.push_back(pending)
                }
            }
        }
        self.last_flush_at = Some(now);
        self.delayed_trigger_at = None;
    }

    /// Async items must drain before any further main-thread updates in
    /// the same flush, to preserve per-graph enqueue order.
    pub(crate) fn take_async(&mut self) -> Vec<PendingUpdate> {
        self.async_ready.drain(..).collect()
    }

    pub(crate) fn take_regular(&mut self) -> Vec<PendingUpdate> {
        self.regular_ready.drain(..).collect()
    }

    pub(crate) fn take_flood_fill_pending(&mut self) -> bool {
        std::mem::take(&mut self.flood_fill_pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pf_core::{Node, NodeIndex, UpdateTarget};
    use std::any::Any;

    struct TestUpdate {
        flood_fill: bool,
        target: UpdateTarget,
    }
    impl GraphUpdate for TestUpdate {
        fn target(&self) -> &UpdateTarget {
            &self.target
        }
        fn requires_flood_fill(&self) -> bool {
            self.flood_fill
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn test_update(flood_fill: bool) -> Box<TestUpdate> {
        Box::new(TestUpdate {
            flood_fill,
            target: UpdateTarget::Nodes(Vec::new()),
        })
    }

    struct TestGraph {
        class: ThreadingClass,
    }
    impl Graph for TestGraph {
        fn scan(&mut self, _progress: &mut dyn FnMut(f32)) {}
        fn get_nodes(&self, _visitor: &mut dyn FnMut(Node) -> bool) {}
        fn get_nearest(
            &self,
            _pos: pf_core::Point3,
            _constraint: Option<&dyn Fn(NodeIndex) -> bool>,
        ) -> Option<pf_core::NearestInfo> {
            None
        }
        fn get_nearest_force(
            &self,
            _pos: pf_core::Point3,
            _constraint: Option<&dyn Fn(NodeIndex) -> bool>,
        ) -> Option<pf_core::NearestInfo> {
            None
        }
        fn threading_class(&self, _update: &dyn GraphUpdate) -> ThreadingClass {
            self.class
        }
        fn update_area_init(&mut self, _update: &dyn GraphUpdate) -> anyhow::Result<()> {
            Ok(())
        }
        fn update_area(&mut self, _update: &dyn GraphUpdate) -> anyhow::Result<()> {
            Ok(())
        }
        fn node(&self, _index: NodeIndex) -> Option<Node> {
            None
        }
        fn set_node_area(&mut self, _index: NodeIndex, _area: pf_core::AreaId) {}
        fn neighbours(&self, _index: NodeIndex, _out: &mut Vec<NodeIndex>) {}
        fn max_node_index(&self) -> i32 {
            0
        }
    }

    fn graphs(class: ThreadingClass) -> Vec<Box<dyn Graph>> {
        vec![Box::new(TestGraph { class })]
    }

    fn refs(graphs: &[Box<dyn Graph>]) -> Vec<&dyn Graph> {
        graphs.iter().map(|g| {
            let r: &dyn Graph = g;
            r
        }).collect()
    }

    #[test]
    fn classifies_into_regular_or_async() {
        let now = Instant::now();
        let mut sched = GraphUpdateScheduler::new(None);
        sched.enqueue(0, test_update(false), None, now);
        assert!(sched.should_flush(now));
        let owned = graphs(ThreadingClass::AsyncThread);
        sched.classify_and_route(&refs(&owned), now);
        assert_eq!(sched.take_async().len(), 1);
        assert!(sched.take_regular().is_empty());
    }

    #[test]
    fn main_thread_updates_go_to_regular() {
        let now = Instant::now();
        let mut sched = GraphUpdateScheduler::new(None);
        sched.enqueue(0, test_update(false), None, now);
        let owned = graphs(ThreadingClass::MainThread);
        sched.classify_and_route(&refs(&owned), now);
        assert_eq!(sched.take_regular().len(), 1);
        assert!(sched.take_async().is_empty());
    }

    #[test]
    fn rate_limit_coalesces_enqueues_within_the_window() {
        let start = Instant::now();
        let mut sched = GraphUpdateScheduler::new(Some(Duration::from_millis(100)));
        sched.enqueue(0, test_update(false), None, start);
        // Not enough time has passed and no prior flush yet, so this one
        // is still allowed through (no baseline to rate-limit against).
        assert!(sched.should_flush(start));
        let owned = graphs(ThreadingClass::MainThread);
        sched.classify_and_route(&refs(&owned), start);

        let soon = start + Duration::from_millis(10);
        sched.enqueue(0, test_update(false), None, soon);
        assert!(!sched.should_flush(soon), "within min_interval of the last flush");

        let later = start + Duration::from_millis(150);
        assert!(sched.should_flush(later));
    }

    #[test]
    fn flood_fill_flag_is_sticky_until_taken() {
        let now = Instant::now();
        let mut sched = GraphUpdateScheduler::new(None);
        sched.enqueue(0, test_update(true), None, now);
        assert!(sched.take_flood_fill_pending());
        assert!(!sched.take_flood_fill_pending(), "flag clears once taken");
    }

    #[test]
    fn force_flush_bypasses_rate_limit() {
        let start = Instant::now();
        let mut sched = GraphUpdateScheduler::new(Some(Duration::from_secs(10)));
        sched.enqueue(0, test_update(false), None, start);
        let owned = graphs(ThreadingClass::MainThread);
        sched.classify_and_route(&refs(&owned), start);
        sched.take_regular();

        sched.enqueue(0, test_update(false), None, start);
        assert!(!sched.should_flush(start));
        assert!(sched.force_flush_due());
    }

    #[test]
    fn main_thread_init_async_body_updates_also_go_to_regular_with_their_classification() {
        let now = Instant::now();
        let mut sched = GraphUpdateScheduler::new(None);
        sched.enqueue(0, test_update(false), None, now);
        let owned = graphs(ThreadingClass::MainThreadInitAsyncBody);
        sched.classify_and_route(&refs(&owned), now);
        let regular = sched.take_regular();
        assert_eq!(regular.len(), 1);
        assert_eq!(regular[0].classification, ThreadingClass::MainThreadInitAsyncBody);
    }
}
