use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, watch, Notify};

use pf_core::{
    EngineError, Graph, GraphUpdate, NearestInfo, NodeIndex, Path, PathHandler, PathId,
    PathOutcome, PathSearch, PathState, Point3, ThreadingClass,
};

use crate::api::{EngineConfig, EngineEvent, StatusSnapshot, WorkerCountHint};
use crate::flood_fill::FloodFiller;
use crate::graph_update::{GraphUpdateScheduler, PendingUpdate};
use crate::node_alloc::NodeIndexAllocator;
use crate::path_id::PathIdGenerator;
use crate::queue::PathQueue;
use crate::return_pipeline::ReturnPipeline;
use crate::work_items::{WorkItem, WorkItemRunner};
use crate::worker::{self, CooperativeWorker, PostSearchHook, TickBudget};

type SharedGraph = Arc<Mutex<Box<dyn Graph>>>;

/// Reentrancy ceiling for `wait_for_path` (spec.md §8 Boundaries).
const WAIT_FOR_PATH_WARN_DEPTH: usize = 5;

/// Per-tick / per-drain return budget (spec.md §4.8).
const RETURN_DRAIN_BUDGET: Duration = Duration::from_millis(1);
const RETURN_DRAIN_MIN_PATHS: usize = 5;

/// Bounds how long a single blocked window spends running `WorkItem`s
/// before unblocking (spec.md §2: "execute WorkItems until a yield point,
/// then unblock PathQueue"). A `Resumable` item left incomplete when the
/// budget runs out simply stays at the front of the queue and picks up on
/// the next `PerformBlocking` window.
const WORK_ITEM_YIELD_BUDGET: Duration = Duration::from_millis(2);

#[derive(Default)]
struct Listeners {
    on_awake_settings: Vec<Arc<dyn Fn() + Send + Sync>>,
    on_graph_pre_scan: Vec<Arc<dyn Fn(usize) + Send + Sync>>,
    on_graph_post_scan: Vec<Arc<dyn Fn(usize) + Send + Sync>>,
    on_path_pre_search: Vec<Arc<dyn Fn(&Path) + Send + Sync>>,
    on_path_post_search: Vec<Arc<dyn Fn(&Path) + Send + Sync>>,
    on_pre_scan: Vec<Arc<dyn Fn() + Send + Sync>>,
    on_post_scan: Vec<Arc<dyn Fn() + Send + Sync>>,
    on_late_post_scan: Vec<Arc<dyn Fn() + Send + Sync>>,
    on_graphs_updated: Vec<Arc<dyn Fn() + Send + Sync>>,
    on_65k_overflow: Vec<Arc<dyn Fn() + Send + Sync>>,
    on_heuristic_recompute: Vec<Arc<dyn Fn() + Send + Sync>>,
}

/// Drives a graph's `SeparateThread`/`MainThreadInitAsyncBody` update
/// bodies on their own OS thread, woken via a `tokio::sync::Notify` +
/// `AtomicBool` pending flag — a direct structural copy of the teacher's
/// `EngineInner { stop_requested: AtomicBool, notify: Notify }`
/// (`client-engine/src/engine.rs`), generalized from "stop requested" to
/// "async update batch pending".
/// One update's async-thread work. `run_init` is `false` when the update's
/// `update_area_init` half already ran on the main thread
/// (`ThreadingClass::MainThreadInitAsyncBody`) and only the body still
/// needs to run here; `true` for `ThreadingClass::AsyncThread` updates,
/// whose init and body both run on this thread.
struct AsyncJob {
    graph_index: usize,
    update: Box<dyn GraphUpdate>,
    run_init: bool,
}

struct AsyncUpdateThread {
    pending: Arc<Mutex<VecDeque<AsyncJob>>>,
    notify: Arc<Notify>,
    stop: Arc<AtomicBool>,
    drained: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl AsyncUpdateThread {
    fn spawn(graphs: Vec<SharedGraph>) -> Self {
        let pending: Arc<Mutex<VecDeque<AsyncJob>>> = Arc::new(Mutex::new(VecDeque::new()));
        let notify = Arc::new(Notify::new());
        let stop = Arc::new(AtomicBool::new(false));
        let drained = Arc::new((Mutex::new(true), Condvar::new()));

        let p = pending.clone();
        let n = notify.clone();
        let s = stop.clone();
        let d = drained.clone();

        let handle = thread::Builder::new()
            .name("pf-graph-update-async".into())
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                    .expect("failed to build async graph-update runtime");
                runtime.block_on(async move {
                    loop {
                        n.notified().await;
                        if s.load(Ordering::Acquire) {
                            return;
                        }
                        loop {
                            let item = p.lock().expect("pending mutex poisoned").pop_front();
                            let Some(job) = item else {
                                break;
                            };
                            if let Some(graph) = graphs.get(job.graph_index) {
                                let mut guard = graph.lock().expect("graph mutex poisoned");
                                if job.run_init {
                                    if let Err(err) = guard.update_area_init(job.update.as_ref()) {
                                        tracing::warn!(
                                            graph_index = job.graph_index,
                                            %err,
                                            "async graph update init failed"
                                        );
                                        continue;
                                    }
                                }
                                if let Err(err) = guard.update_area(job.update.as_ref()) {
                                    tracing::warn!(
                                        graph_index = job.graph_index,
                                        %err,
                                        "async graph update failed"
                                    );
                                }
                            }
                        }
                        let (lock, cv) = &*d;
                        *lock.lock().expect("drained mutex poisoned") = true;
                        cv.notify_all();
                    }
                });
            })
            .expect("failed to spawn async graph-update thread");

        AsyncUpdateThread {
            pending,
            notify,
            stop,
            drained,
            handle: Some(handle),
        }
    }

    fn submit(&self, jobs: Vec<AsyncJob>) {
        if jobs.is_empty() {
            return;
        }
        {
            let (lock, _) = &*self.drained;
            *lock.lock().expect("drained mutex poisoned") = false;
        }
        {
            let mut pending = self.pending.lock().expect("pending mutex poisoned");
            pending.extend(jobs);
        }
        self.notify.notify_one();
    }

    fn wait_until_drained(&self) {
        let (lock, cv) = &*self.drained;
        let mut guard = lock.lock().expect("drained mutex poisoned");
        while !*guard {
            guard = cv.wait(guard).expect("drained mutex poisoned");
        }
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.notify.notify_one();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

enum Workers {
    Threaded {
        handles: Vec<JoinHandle<()>>,
        handlers: Vec<Arc<Mutex<PathHandler>>>,
    },
    Cooperative(CooperativeWorker),
}

/// Top-level engine lifecycle (spec.md §4.9): owns every subsystem and
/// exposes the public surface from spec.md §6.
pub struct Engine {
    config: EngineConfig,
    graphs: Vec<SharedGraph>,
    queue: Arc<PathQueue>,
    returns: Arc<ReturnPipeline>,
    node_alloc: NodeIndexAllocator,
    path_ids: PathIdGenerator,
    overflow_flag: Arc<AtomicBool>,
    work_items: WorkItemRunner,
    graph_updates: GraphUpdateScheduler,
    flood_filler: FloodFiller,
    tick_budget: TickBudget,
    workers: Workers,
    async_updates: Option<AsyncUpdateThread>,
    safe_update: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    listeners: Listeners,
    wait_depth: Cell<usize>,
    tearing_down: Cell<bool>,
    events: broadcast::Sender<EngineEvent>,
    status: watch::Sender<StatusSnapshot>,
}

fn worker_count(hint: WorkerCountHint) -> usize {
    match hint {
        WorkerCountHint::Single => 0,
        WorkerCountHint::Fixed(n) => n,
        WorkerCountHint::Auto => thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
    }
}

impl Engine {
    /// `Initialize` (spec.md §4.9): compute worker count, allocate
    /// `PathHandler`s, size the queue, start worker threads plus the async
    /// update thread — or, when the worker count resolves to 0, a single
    /// cooperative worker and no threads at all.
    pub fn initialize(config: EngineConfig, graphs: Vec<Box<dyn Graph>>) -> Self {
        let graphs: Vec<SharedGraph> = graphs.into_iter().map(|g| Arc::new(Mutex::new(g))).collect();
        let n_workers = worker_count(config.workers);
        let queue = Arc::new(PathQueue::new(n_workers.max(1)));
        let returns = Arc::new(ReturnPipeline::new());
        let tick_budget = worker::tick_budget(config.search_tick_budget);
        let post_search: PostSearchHook = Arc::new(|_path| {});

        let workers = if n_workers == 0 {
            Workers::Cooperative(CooperativeWorker::new(Arc::new(Mutex::new(PathHandler::new()))))
        } else {
            let mut handles = Vec::with_capacity(n_workers);
            let mut handlers = Vec::with_capacity(n_workers);
            for id in 0..n_workers {
                let handler = Arc::new(Mutex::new(PathHandler::new()));
                handlers.push(handler.clone());
                handles.push(worker::spawn(
                    id,
                    queue.clone(),
                    returns.clone(),
                    handler,
                    tick_budget.clone(),
                    post_search.clone(),
                ));
            }
            Workers::Threaded { handles, handlers }
        };

        let async_updates = if graphs.is_empty() {
            None
        } else {
            Some(AsyncUpdateThread::spawn(graphs.clone()))
        };

        let overflow_flag = Arc::new(AtomicBool::new(false));
        let mut path_ids = PathIdGenerator::new();
        path_ids.register_overflow(overflow_callback(overflow_flag.clone()));

        let (events, _) = broadcast::channel(256);
        let (status, _) = watch::channel(StatusSnapshot::default());

        let engine = Engine {
            config: config.clone(),
            graphs,
            queue,
            returns,
            node_alloc: NodeIndexAllocator::new(),
            path_ids,
            overflow_flag,
            work_items: WorkItemRunner::new(),
            graph_updates: GraphUpdateScheduler::new(config.graph_update_min_interval),
            flood_filler: FloodFiller::new(config.max_area_index, config.min_area_size),
            tick_budget,
            workers,
            async_updates,
            safe_update: Mutex::new(None),
            listeners: Listeners::default(),
            wait_depth: Cell::new(0),
            tearing_down: Cell::new(false),
            events,
            status,
        };
        let _ = engine.events.send(EngineEvent::Started);
        engine
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> watch::Receiver<StatusSnapshot> {
        self.status.subscribe()
    }

    fn publish_status(&self) {
        let worker_count = match &self.workers {
            Workers::Threaded { handles, .. } => handles.len(),
            Workers::Cooperative(_) => 1,
        };
        let _ = self.status.send(StatusSnapshot {
            terminated: self.queue.is_terminating(),
            worker_count,
            queued_paths: self.queue.len(),
            graph_count: self.graphs.len(),
        });
    }

    // -- hooks ---------------------------------------------------------

    pub fn on_awake_settings(&mut self, f: impl Fn() + Send + Sync + 'static) {
        self.listeners.on_awake_settings.push(Arc::new(f));
    }
    pub fn on_graph_pre_scan(&mut self, f: impl Fn(usize) + Send + Sync + 'static) {
        self.listeners.on_graph_pre_scan.push(Arc::new(f));
    }
    pub fn on_graph_post_scan(&mut self, f: impl Fn(usize) + Send + Sync + 'static) {
        self.listeners.on_graph_post_scan.push(Arc::new(f));
    }
    pub fn on_path_pre_search(&mut self, f: impl Fn(&Path) + Send + Sync + 'static) {
        self.listeners.on_path_pre_search.push(Arc::new(f));
    }
    pub fn on_path_post_search(&mut self, f: impl Fn(&Path) + Send + Sync + 'static) {
        self.listeners.on_path_post_search.push(Arc::new(f));
    }
    pub fn on_pre_scan(&mut self, f: impl Fn() + Send + Sync + 'static) {
        self.listeners.on_pre_scan.push(Arc::new(f));
    }
    pub fn on_post_scan(&mut self, f: impl Fn() + Send + Sync + 'static) {
        self.listeners.on_post_scan.push(Arc::new(f));
    }
    pub fn on_late_post_scan(&mut self, f: impl Fn() + Send + Sync + 'static) {
        self.listeners.on_late_post_scan.push(Arc::new(f));
    }
    pub fn on_graphs_updated(&mut self, f: impl Fn() + Send + Sync + 'static) {
        self.listeners.on_graphs_updated.push(Arc::new(f));
    }
    /// Zero-or-many user listeners invoked in addition to the mandatory
    /// node-reset `WorkItem` the engine always enqueues on wrap (Open
    /// Question (b): the reset must happen unconditionally, not only when
    /// a caller bothers to register a listener).
    pub fn on_65k_overflow(&mut self, f: impl Fn() + Send + Sync + 'static) {
        self.listeners.on_65k_overflow.push(Arc::new(f));
    }
    /// Runs whenever a `WorkItem` marked [`WorkItem::dirtying_heuristic`]
    /// completes: exactly once per blocked window that owed a recompute,
    /// before `PathQueue` unblocks (spec.md §4.5, glossary "Heuristic
    /// embedding"). Zero-or-many listeners, same snapshot-before-iteration
    /// discipline as the other hook lists.
    pub fn on_heuristic_recompute(&mut self, f: impl Fn() + Send + Sync + 'static) {
        self.listeners.on_heuristic_recompute.push(Arc::new(f));
    }

    /// `RegisterSafeUpdate`: guaranteed to run exactly once during the next
    /// blocked window, then cleared. The slot is guarded by `safe_update`'s
    /// mutex so a concurrent register during `Block()` can't race the
    /// append (spec.md §9 Open Question (c)).
    pub fn register_safe_update(&self, f: impl FnOnce() + Send + 'static) {
        *self.safe_update.lock().expect("safe_update mutex poisoned") = Some(Box::new(f));
    }

    // -- path submission -------------------------------------------------

    /// `StartPath`. Allocates a fresh id, pushes onto `PathQueue`.
    pub fn start_path(
        &mut self,
        search: Box<dyn PathSearch>,
        callback: Option<Box<dyn FnOnce(PathOutcome) + Send>>,
        push_to_front: bool,
    ) -> Result<Arc<Path>, EngineError> {
        if self.tearing_down.get() || self.queue.is_terminating() {
            return Err(EngineError::Terminated);
        }
        if self.graphs.is_empty() {
            return Err(EngineError::NoGraphs);
        }
        let id = self.allocate_path_id();
        let path = Arc::new(Path::new(id, search, callback));
        for listener in &self.listeners.on_path_pre_search {
            listener(&path);
        }
        if push_to_front {
            self.queue.push_front(path.clone())?;
        } else {
            self.queue.push(path.clone())?;
        }
        let _ = self.events.send(EngineEvent::PathStarted { path_id: id.0 });
        Ok(path)
    }

    fn allocate_path_id(&mut self) -> PathId {
        let id = self.path_ids.allocate();
        if self.overflow_flag.swap(false, Ordering::SeqCst) {
            self.handle_overflow();
        }
        id
    }

    fn handle_overflow(&mut self) {
        let handlers: Vec<Arc<Mutex<PathHandler>>> = match &self.workers {
            Workers::Threaded { handlers, .. } => handlers.clone(),
            Workers::Cooperative(_) => Vec::new(),
        };
        self.work_items.enqueue(WorkItem::one_shot(move || {
            for handler in &handlers {
                handler.lock().expect("handler mutex poisoned").reset_visited();
            }
        }));
        for listener in self.listeners.on_65k_overflow.clone() {
            listener();
        }
        self.path_ids.register_overflow(overflow_callback(self.overflow_flag.clone()));
        let _ = self.events.send(EngineEvent::Overflow65k);
    }

    /// `WaitForPath`: block until `p` reaches `ReturnQueue`, then drain
    /// returns. Warns (doesn't deadlock) past reentrancy depth 5; no-ops
    /// with an error during teardown.
    pub fn wait_for_path(&mut self, path: &Arc<Path>) -> Result<(), EngineError> {
        if self.tearing_down.get() {
            return Err(EngineError::Teardown);
        }
        if path.state() == PathState::Created {
            return Err(EngineError::PathNotStarted);
        }

        let depth = self.wait_depth.get() + 1;
        self.wait_depth.set(depth);
        if depth > WAIT_FOR_PATH_WARN_DEPTH {
            tracing::warn!(depth, "wait_for_path re-entered past the recommended depth");
        }

        // Termination still has to land the path via the return pipeline
        // (worker.rs errors it out and pushes it), so keep pumping drains
        // rather than giving up the moment `is_terminating` is observed.
        while path.state() < PathState::ReturnQueue {
            self.drain_returns(Duration::from_millis(1));
            thread::sleep(Duration::from_millis(1));
        }
        self.drain_returns(RETURN_DRAIN_BUDGET);

        self.wait_depth.set(self.wait_depth.get() - 1);
        Ok(())
    }

    /// `Tick`: advance the cooperative worker one step (if any), attempt
    /// `PerformBlocking` opportunistically, then unconditionally drain
    /// returns with a time budget.
    pub fn tick(&mut self) {
        if let Workers::Cooperative(worker) = &mut self.workers {
            let hook: PostSearchHook = Arc::new(|_path| {});
            worker.step(&self.queue, &self.returns, &self.tick_budget, &hook);
        }

        self.perform_blocking_opportunistic();
        self.drain_returns(RETURN_DRAIN_BUDGET);
        self.publish_status();
    }

    fn perform_blocking_opportunistic(&mut self) {
        if !self.queue.all_receivers_blocked() {
            return;
        }
        self.queue.block();
        self.drain_returns(Duration::from_millis(1));

        if let Some(callback) = self
            .safe_update
            .lock()
            .expect("safe_update mutex poisoned")
            .take()
        {
            callback();
        }

        self.run_work_items_to_yield();
        if self.work_items.take_heuristic_dirty() {
            for listener in self.listeners.on_heuristic_recompute.clone() {
                listener();
            }
        }
        self.maybe_flush_graph_updates();
        self.queue.unblock();
    }

    fn run_work_items_to_yield(&mut self) {
        let deadline = Instant::now() + WORK_ITEM_YIELD_BUDGET;
        while self.work_items.run_step(false) {
            if Instant::now() >= deadline {
                break;
            }
        }
    }

    /// Drain `ReturnPipeline` with a time budget, returning at least
    /// `RETURN_DRAIN_MIN_PATHS` regardless (spec.md §4.8).
    fn drain_returns(&mut self, budget: Duration) {
        let drained = self.returns.drain();
        if drained.is_empty() {
            return;
        }
        let deadline = Instant::now() + budget;
        for (i, path) in drained.into_iter().enumerate() {
            for listener in &self.listeners.on_path_post_search {
                listener(&path);
            }
            path.advance_state(PathState::Returned);
            let errored = path.is_errored();
            let duration_ms = path.elapsed_since_queued().as_millis() as u64;
            path.fire_callback();
            let _ = self.events.send(EngineEvent::PathReturned {
                path_id: path.id.0,
                errored,
                duration_ms,
            });
            if i + 1 >= RETURN_DRAIN_MIN_PATHS && Instant::now() >= deadline {
                break;
            }
        }
    }

    // -- graph updates ---------------------------------------------------

    pub fn update_graphs(
        &mut self,
        graph_index: usize,
        update: Box<dyn GraphUpdate>,
        delay: Option<Duration>,
    ) {
        self.graph_updates.enqueue(graph_index, update, delay, Instant::now());
    }

    /// `FlushGraphUpdates`: bypasses the rate limit. A no-op if nothing is
    /// pending, matching spec.md §8's idempotence property. Like `scan` and
    /// `flood_fill`, this opens its own blocked window rather than relying
    /// on `tick` to find one, since a caller may invoke it outside the tick
    /// loop entirely.
    pub fn flush_graph_updates(&mut self) {
        if !self.graph_updates.force_flush_due() {
            return;
        }
        self.queue.block();
        while !self.queue.all_receivers_blocked() {
            thread::sleep(Duration::from_millis(1));
        }
        self.apply_flush();
        self.queue.unblock();
    }

    fn maybe_flush_graph_updates(&mut self) {
        if self.graph_updates.should_flush(Instant::now()) {
            self.apply_flush();
        }
    }

    /// Classify and apply everything the scheduler has queued. Async-only
    /// updates ship to the async thread first and are waited out before any
    /// main-thread update runs, so per-graph enqueue order holds even
    /// across the main/async split (spec.md §4.6). `MainThreadInitAsyncBody`
    /// updates run their `update_area_init` half here, then their body is
    /// handed to the async thread without waiting for it.
    fn apply_flush(&mut self) {
        {
            let guards: Vec<_> = self
                .graphs
                .iter()
                .map(|g| g.lock().expect("graph mutex poisoned"))
                .collect();
            let refs: Vec<&dyn Graph> = guards
                .iter()
                .map(|g| {
                    let r: &dyn Graph = g;
                    r
                })
                .collect();
            self.graph_updates.classify_and_route(&refs, Instant::now());
        }

        let async_only = self.graph_updates.take_async();
        if !async_only.is_empty() {
            if let Some(async_updates) = &self.async_updates {
                let jobs = async_only
                    .into_iter()
                    .map(|item| AsyncJob {
                        graph_index: item.graph_index,
                        update: item.update,
                        run_init: true,
                    })
                    .collect();
                async_updates.submit(jobs);
                async_updates.wait_until_drained();
            }
        }

        let mut deferred_bodies = Vec::new();
        for item in self.graph_updates.take_regular() {
            let Some(graph) = self.graphs.get(item.graph_index) else {
                continue;
            };
            let init_result = {
                let mut guard = graph.lock().expect("graph mutex poisoned");
                guard.update_area_init(item.update.as_ref())
            };
            if let Err(err) = init_result {
                tracing::warn!(graph_index = item.graph_index, %err, "graph update init failed");
                continue;
            }
            match item.classification {
                ThreadingClass::MainThread => {
                    let mut guard = graph.lock().expect("graph mutex poisoned");
                    if let Err(err) = guard.update_area(item.update.as_ref()) {
                        tracing::warn!(graph_index = item.graph_index, %err, "graph update failed");
                    }
                }
                ThreadingClass::MainThreadInitAsyncBody => {
                    deferred_bodies.push(AsyncJob {
                        graph_index: item.graph_index,
                        update: item.update,
                        run_init: false,
                    });
                }
                ThreadingClass::AsyncThread => {
                    unreachable!("async-classified updates never land in take_regular")
                }
            }
        }

        if !deferred_bodies.is_empty() {
            if let Some(async_updates) = &self.async_updates {
                async_updates.submit(deferred_bodies);
            }
        }

        if self.graph_updates.take_flood_fill_pending() {
            self.run_flood_fill();
        }

        for listener in self.listeners.on_graphs_updated.clone() {
            listener();
        }
        let _ = self.events.send(EngineEvent::GraphsUpdated);
    }

    /// `FloodFill()` from the engine-to-caller surface (spec.md §6): quiesce,
    /// run the flood fill, unblock. Distinct from the flood fill an
    /// in-progress graph-update flush or `scan` triggers internally, which
    /// call [`Engine::run_flood_fill`] directly since they already hold the
    /// blocked window.
    pub fn flood_fill(&mut self) {
        self.queue.block();
        while !self.queue.all_receivers_blocked() {
            thread::sleep(Duration::from_millis(1));
        }
        self.run_flood_fill();
        self.queue.unblock();
    }

    // -- scan --------------------------------------------------------------

    /// `Scan`: quiesce, destroy all existing nodes, invoke each graph's
    /// scanner, re-assign graph indices, run post-scan hooks, flood-fill,
    /// unblock.
    pub fn scan(&mut self) {
        let started_at = Instant::now();
        let _ = self.events.send(EngineEvent::ScanStarted);

        self.queue.block();
        while !self.queue.all_receivers_blocked() {
            thread::sleep(Duration::from_millis(1));
        }

        for listener in &self.listeners.on_pre_scan {
            listener();
        }

        for (index, graph) in self.graphs.iter().enumerate() {
            for listener in &self.listeners.on_graph_pre_scan {
                listener(index);
            }
            let mut guard = graph.lock().expect("graph mutex poisoned");
            guard.scan(&mut |_progress| {});
            drop(guard);
            for listener in &self.listeners.on_graph_post_scan {
                listener(index);
            }
        }

        let max_index = self
            .graphs
            .iter()
            .map(|g| g.lock().expect("graph mutex poisoned").max_node_index())
            .max()
            .unwrap_or(0);
        self.node_alloc = NodeIndexAllocator::new();
        for _ in 0..max_index {
            self.node_alloc.allocate();
        }

        if let Workers::Threaded { handlers, .. } = &self.workers {
            for handler in handlers {
                handler.lock().expect("handler mutex poisoned").grow_to(max_index);
            }
        }

        for listener in &self.listeners.on_post_scan {
            listener();
        }

        self.run_flood_fill();

        for listener in &self.listeners.on_late_post_scan {
            listener();
        }

        self.queue.unblock();
        let _ = self.events.send(EngineEvent::ScanCompleted {
            duration_ms: started_at.elapsed().as_millis() as u64,
        });
    }

    fn run_flood_fill(&mut self) {
        let mut guards: Vec<_> = self
            .graphs
            .iter()
            .map(|g| g.lock().expect("graph mutex poisoned"))
            .collect();
        let mut refs: Vec<&mut dyn Graph> = guards
            .iter_mut()
            .map(|g| {
                let r: &mut dyn Graph = g;
                r
            })
            .collect();
        let warnings = self.flood_filler.run(&mut refs);
        drop(refs);
        drop(guards);
        for warning in warnings {
            tracing::warn!(area_id = warning.area_id, "no small component available to relabel");
            let _ = self.events.send(EngineEvent::Warning {
                message: format!("flood fill: area {} had no small component to relabel", warning.area_id),
            });
        }
    }

    // -- nearest -------------------------------------------------------------

    /// `GetNearest` (spec.md §4.10).
    pub fn get_nearest(
        &self,
        pos: Point3,
        constraint: Option<&dyn Fn(NodeIndex) -> bool>,
        forced: bool,
    ) -> Option<(usize, NearestInfo)> {
        let mut best: Option<(usize, NearestInfo, f32)> = None;

        for (index, graph) in self.graphs.iter().enumerate() {
            let guard = graph.lock().expect("graph mutex poisoned");
            let info = if forced {
                guard.get_nearest_force(pos, constraint)
            } else {
                guard.get_nearest(pos, constraint)
            };
            drop(guard);

            let Some(info) = info else { continue };
            let distance = info.distance_to(pos);
            if distance > self.config.max_nearest_node_distance {
                continue;
            }

            let better = match &best {
                None => true,
                Some((_, _, best_distance)) => distance < *best_distance,
            };
            if better {
                best = Some((index, info, distance));
            }

            if let Some(limit) = self.config.prioritize_graphs_limit {
                if distance <= limit {
                    break;
                }
            }
        }

        best.map(|(index, info, _)| (index, info))
    }

    // -- destroy -------------------------------------------------------------

    /// `Destroy`: terminate the queue, signal the async update thread,
    /// join workers with a short timeout (best-effort on stable Rust: we
    /// join unconditionally, since there is no portable timed join), drain
    /// returns one last time, and clear callback registries.
    ///
    /// Anything still sitting in `PathQueue` at the moment of termination
    /// never reaches a worker (spec.md §5: "queued paths are drained as
    /// errored"), so it's pulled out here and routed to the return
    /// pipeline errored before the final drain fires its callback.
    pub fn destroy(mut self) {
        self.tearing_down.set(true);
        self.queue.terminate();

        for path in self.queue.drain_remaining() {
            path.advance_state(PathState::Processing);
            path.set_error("engine terminated while queued");
            path.advance_state(PathState::ReturnQueue);
            self.returns.push(path);
        }

        // Destroy is the last blocked window this engine will ever have:
        // anything still sitting in the WorkItemRunner won't get another
        // tick to finish on, so drain it to completion right now rather
        // than silently dropping it. This calls run_step with force=false —
        // a Resumable item is entitled to take more than one step, and
        // `force=true` means "the very next call must finish it" (spec.md
        // §4.5), which isn't a promise destroy can make on some other
        // item's behalf.
        while !self.work_items.is_empty() {
            self.work_items.run_step(false);
        }

        if let Some(mut async_updates) = self.async_updates.take() {
            async_updates.shutdown();
        }

        if let Workers::Threaded { handles, .. } = &mut self.workers {
            for handle in handles.drain(..) {
                let _ = handle.join();
            }
        }

        self.drain_returns(Duration::from_millis(5));
        *self.safe_update.lock().expect("safe_update mutex poisoned") = None;
        self.listeners = Listeners::default();
        let _ = self.events.send(EngineEvent::Terminated);
    }
}

fn overflow_callback(flag: Arc<AtomicBool>) -> Box<dyn FnOnce() + Send> {
    Box::new(move || {
        flag.store(true, Ordering::SeqCst);
    })
}

/// End-to-end coverage of the six concrete scenarios against `pf-demo`'s
/// grid graph and plain test doubles, one module per scenario plus the
/// supporting stubs each needs.
#[cfg(test)]
mod tests {
    use super::*;
    use pf_core::{AreaId, Node, UpdateTarget};
    use std::sync::atomic::AtomicUsize;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    struct Immediate;
    impl PathSearch for Immediate {
        fn prepare_base(&mut self, _handler: &mut PathHandler, _path_id: PathId) {}
        fn prepare(&mut self) -> bool {
            true
        }
        fn initialize(&mut self, _handler: &mut PathHandler) {}
        fn calculate_step(&mut self, _handler: &mut PathHandler, _target_tick: Instant) -> bool {
            true
        }
        fn is_done(&self) -> bool {
            true
        }
        fn cleanup(&mut self) {}
    }

    struct StubGraph;
    impl Graph for StubGraph {
        fn scan(&mut self, _progress: &mut dyn FnMut(f32)) {}
        fn get_nodes(&self, _visitor: &mut dyn FnMut(Node) -> bool) {}
        fn get_nearest(
            &self,
            _pos: Point3,
            _constraint: Option<&dyn Fn(NodeIndex) -> bool>,
        ) -> Option<NearestInfo> {
            None
        }
        fn get_nearest_force(
            &self,
            _pos: Point3,
            _constraint: Option<&dyn Fn(NodeIndex) -> bool>,
        ) -> Option<NearestInfo> {
            None
        }
        fn threading_class(&self, _update: &dyn GraphUpdate) -> ThreadingClass {
            ThreadingClass::MainThread
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
        fn set_node_area(&mut self, _index: NodeIndex, _area: AreaId) {}
        fn neighbours(&self, _index: NodeIndex, _out: &mut Vec<NodeIndex>) {}
        fn max_node_index(&self) -> i32 {
            0
        }
    }

    // Scenario 1: P1, P2, P3(front), P4 -> P3, P1, P2, P4.
    #[test]
    fn fifo_with_one_front_priority_slot_end_to_end() {
        init_tracing();
        let config = EngineConfig { workers: WorkerCountHint::Single, ..Default::default() };
        let mut engine = Engine::initialize(config, vec![Box::new(StubGraph)]);
        let order: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));

        let push = |engine: &mut Engine, label: u8, front: bool| {
            let order = order.clone();
            engine
                .start_path(
                    Box::new(Immediate),
                    Some(Box::new(move |_outcome: PathOutcome| order.lock().unwrap().push(label))),
                    front,
                )
                .unwrap();
        };
        push(&mut engine, 1, false);
        push(&mut engine, 2, false);
        push(&mut engine, 3, true);
        push(&mut engine, 4, false);

        for _ in 0..20 {
            engine.tick();
        }

        assert_eq!(*order.lock().unwrap(), vec![3, 1, 2, 4]);
        engine.destroy();
    }

    // Scenario 2: a worker spinning on a long search; a graph update applied
    // concurrently must never observe the worker mid-step.
    #[test]
    fn graph_update_never_applies_while_a_worker_is_executing() {
        init_tracing();

        struct LongSearch {
            executing: Arc<AtomicBool>,
            remaining: usize,
        }
        impl PathSearch for LongSearch {
            fn prepare_base(&mut self, _handler: &mut PathHandler, _path_id: PathId) {}
            fn prepare(&mut self) -> bool {
                false
            }
            fn initialize(&mut self, _handler: &mut PathHandler) {}
            fn calculate_step(&mut self, _handler: &mut PathHandler, _target_tick: Instant) -> bool {
                self.executing.store(true, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(1));
                self.remaining -= 1;
                let done = self.remaining == 0;
                self.executing.store(false, Ordering::SeqCst);
                done
            }
            fn is_done(&self) -> bool {
                self.remaining == 0
            }
            fn cleanup(&mut self) {}
        }

        struct ProbeUpdate;
        impl GraphUpdate for ProbeUpdate {
            fn target(&self) -> &UpdateTarget {
                const EMPTY: UpdateTarget = UpdateTarget::Nodes(Vec::new());
                &EMPTY
            }
            fn requires_flood_fill(&self) -> bool {
                false
            }
            fn as_any(&self) -> &dyn std::any::Any {
                self
            }
        }

        struct ProbeGraph {
            executing: Arc<AtomicBool>,
        }
        impl Graph for ProbeGraph {
            fn scan(&mut self, _progress: &mut dyn FnMut(f32)) {}
            fn get_nodes(&self, _visitor: &mut dyn FnMut(Node) -> bool) {}
            fn get_nearest(
                &self,
                _pos: Point3,
                _constraint: Option<&dyn Fn(NodeIndex) -> bool>,
            ) -> Option<NearestInfo> {
                None
            }
            fn get_nearest_force(
                &self,
                _pos: Point3,
                _constraint: Option<&dyn Fn(NodeIndex) -> bool>,
            ) -> Option<NearestInfo> {
                None
            }
            fn threading_class(&self, _update: &dyn GraphUpdate) -> ThreadingClass {
                ThreadingClass::MainThread
            }
            fn update_area_init(&mut self, _update: &dyn GraphUpdate) -> anyhow::Result<()> {
                Ok(())
            }
            fn update_area(&mut self, _update: &dyn GraphUpdate) -> anyhow::Result<()> {
                assert!(
                    !self.executing.load(Ordering::SeqCst),
                    "graph update ran while a worker was mid-search"
                );
                Ok(())
            }
            fn node(&self, _index: NodeIndex) -> Option<Node> {
                None
            }
            fn set_node_area(&mut self, _index: NodeIndex, _area: AreaId) {}
            fn neighbours(&self, _index: NodeIndex, _out: &mut Vec<NodeIndex>) {}
            fn max_node_index(&self) -> i32 {
                0
            }
        }

        let executing = Arc::new(AtomicBool::new(false));
        let config = EngineConfig { workers: WorkerCountHint::Fixed(1), ..Default::default() };
        let mut engine =
            Engine::initialize(config, vec![Box::new(ProbeGraph { executing: executing.clone() })]);

        engine
            .start_path(
                Box::new(LongSearch { executing: executing.clone(), remaining: 20 }),
                None,
                false,
            )
            .unwrap();

        // Give the worker a moment to pick the path up and start spinning.
        thread::sleep(Duration::from_millis(5));

        engine.update_graphs(0, Box::new(ProbeUpdate), None);
        // Blocks until the worker quiesces, then applies — the assertion
        // inside ProbeGraph::update_area is what this scenario checks.
        engine.flush_graph_updates();

        engine.destroy();
    }

    // Scenario 3 (reduced scale; flood_fill.rs covers the 70,000-component
    // case directly): scan assigns a positive, shared area to each connected
    // component and leaves unwalkable nodes at area 0.
    #[test]
    fn scan_assigns_positive_areas_and_same_area_to_each_connected_component() {
        init_tracing();
        // A 5x1 strip with the middle cell walled off: two components of 2.
        let grid = pf_demo::GridGraph::new(5, 1, 1.0, 0, |x, _y| (x != 2, 0));
        let mut engine = Engine::initialize(EngineConfig::default(), vec![Box::new(grid.clone())]);
        engine.scan();

        let wall = grid.node(NodeIndex::new(3)).unwrap();
        assert!(!wall.walkable);
        assert_eq!(wall.area, AreaId::NONE);

        let left_a = grid.node(NodeIndex::new(1)).unwrap();
        let left_b = grid.node(NodeIndex::new(2)).unwrap();
        let right_a = grid.node(NodeIndex::new(4)).unwrap();
        let right_b = grid.node(NodeIndex::new(5)).unwrap();
        for n in [&left_a, &left_b, &right_a, &right_b] {
            assert_ne!(n.area, AreaId::NONE);
        }
        assert_eq!(left_a.area, left_b.area);
        assert_eq!(right_a.area, right_b.area);
        assert_ne!(left_a.area, right_a.area);

        engine.destroy();
    }

    // Scenario 4: 65,536 allocations wrap the id counter exactly once; the
    // 65,536th request is the wrap and comes back as id 1.
    #[test]
    fn path_id_wraps_after_65536_allocations_and_fires_overflow_once() {
        init_tracing();
        let config = EngineConfig { workers: WorkerCountHint::Single, ..Default::default() };
        let mut engine = Engine::initialize(config, vec![Box::new(StubGraph)]);

        let overflow_count = Arc::new(AtomicUsize::new(0));
        {
            let overflow_count = overflow_count.clone();
            engine.on_65k_overflow(move || {
                overflow_count.fetch_add(1, Ordering::SeqCst);
            });
        }

        let mut last_id = None;
        for _ in 0..65_536u32 {
            let path = engine.start_path(Box::new(Immediate), None, false).unwrap();
            engine.tick();
            last_id = Some(path.id);
        }

        assert_eq!(overflow_count.load(Ordering::SeqCst), 1);
        assert_eq!(last_id.unwrap().0, 1);

        engine.destroy();
    }

    // Scenario 5: 5 paths enqueued but never popped, then torn down; all 5
    // callbacks must still fire, errored.
    #[test]
    fn destroy_errors_all_paths_still_sitting_in_the_queue() {
        init_tracing();
        let config = EngineConfig { workers: WorkerCountHint::Single, ..Default::default() };
        let mut engine = Engine::initialize(config, vec![Box::new(StubGraph)]);

        let fired: Arc<Mutex<Vec<(u8, bool)>>> = Arc::new(Mutex::new(Vec::new()));
        for label in 1u8..=5 {
            let fired = fired.clone();
            engine
                .start_path(
                    Box::new(Immediate),
                    Some(Box::new(move |outcome: PathOutcome| {
                        fired.lock().unwrap().push((label, outcome.error.is_some()));
                    })),
                    false,
                )
                .unwrap();
        }

        // No tick has run, so every path above is still sitting in the queue.
        engine.destroy();

        let fired = fired.lock().unwrap();
        assert_eq!(fired.len(), 5);
        assert!(fired.iter().all(|&(_, errored)| errored));
    }

    // Scenario 6: graph A (distance 0.9) checked before graph B (distance
    // 0.5); prioritizeGraphsLimit = 1.0 means A wins even though B is closer.
    #[test]
    fn get_nearest_stops_at_the_first_graph_within_the_priority_limit() {
        init_tracing();

        struct FixedDistanceGraph {
            distance: f32,
        }
        impl Graph for FixedDistanceGraph {
            fn scan(&mut self, _progress: &mut dyn FnMut(f32)) {}
            fn get_nodes(&self, _visitor: &mut dyn FnMut(Node) -> bool) {}
            fn get_nearest(
                &self,
                pos: Point3,
                _constraint: Option<&dyn Fn(NodeIndex) -> bool>,
            ) -> Option<NearestInfo> {
                Some(NearestInfo {
                    node: NodeIndex::new(1),
                    clamped_position: Point3::new(pos.x + self.distance, pos.y, pos.z),
                    constrained_node: None,
                    constrained_position: None,
                })
            }
            fn get_nearest_force(
                &self,
                pos: Point3,
                constraint: Option<&dyn Fn(NodeIndex) -> bool>,
            ) -> Option<NearestInfo> {
                self.get_nearest(pos, constraint)
            }
            fn threading_class(&self, _update: &dyn GraphUpdate) -> ThreadingClass {
                ThreadingClass::MainThread
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
            fn set_node_area(&mut self, _index: NodeIndex, _area: AreaId) {}
            fn neighbours(&self, _index: NodeIndex, _out: &mut Vec<NodeIndex>) {}
            fn max_node_index(&self) -> i32 {
                1
            }
        }

        let config = EngineConfig {
            workers: WorkerCountHint::Single,
            prioritize_graphs_limit: Some(1.0),
            ..Default::default()
        };
        let graph_a = FixedDistanceGraph { distance: 0.9 };
        let graph_b = FixedDistanceGraph { distance: 0.5 };
        let engine = Engine::initialize(config, vec![Box::new(graph_a), Box::new(graph_b)]);

        let (index, info) = engine.get_nearest(Point3::ZERO, None, false).unwrap();
        assert_eq!(index, 0, "graph A must win: checked first and already within the priority limit");
        assert!((info.distance_to(Point3::ZERO) - 0.9).abs() < 1e-4);

        engine.destroy();
    }

    // A WorkItem::dirtying_heuristic() completing must fire on_heuristic_recompute
    // exactly once per blocked window, before the window unblocks.
    #[test]
    fn a_dirtying_work_item_triggers_exactly_one_heuristic_recompute() {
        init_tracing();
        let config = EngineConfig { workers: WorkerCountHint::Single, ..Default::default() };
        let mut engine = Engine::initialize(config, vec![Box::new(StubGraph)]);

        let recomputes = Arc::new(AtomicUsize::new(0));
        {
            let recomputes = recomputes.clone();
            engine.on_heuristic_recompute(move || {
                recomputes.fetch_add(1, Ordering::SeqCst);
            });
        }

        engine.work_items.enqueue(WorkItem::one_shot(|| {}).dirtying_heuristic());
        engine.tick();
        assert_eq!(recomputes.load(Ordering::SeqCst), 1);

        // A later blocked window with nothing dirtying it must not re-fire.
        engine.tick();
        assert_eq!(recomputes.load(Ordering::SeqCst), 1);

        engine.destroy();
    }

    // A plain (non-dirtying) WorkItem must never trip the recompute hook.
    #[test]
    fn a_plain_work_item_never_triggers_heuristic_recompute() {
        init_tracing();
        let config = EngineConfig { workers: WorkerCountHint::Single, ..Default::default() };
        let mut engine = Engine::initialize(config, vec![Box::new(StubGraph)]);

        let recomputes = Arc::new(AtomicUsize::new(0));
        {
            let recomputes = recomputes.clone();
            engine.on_heuristic_recompute(move || {
                recomputes.fetch_add(1, Ordering::SeqCst);
            });
        }

        engine.work_items.enqueue(WorkItem::one_shot(|| {}));
        engine.tick();
        assert_eq!(recomputes.load(Ordering::SeqCst), 0);

        engine.destroy();
    }

    // destroy() is the engine's last blocked window; a Resumable work item
    // still mid-flight must be driven to completion there, one step at a
    // time, rather than dropped.
    #[test]
    fn destroy_drains_a_still_in_progress_resumable_work_item() {
        init_tracing();
        let config = EngineConfig { workers: WorkerCountHint::Single, ..Default::default() };
        let mut engine = Engine::initialize(config, vec![Box::new(StubGraph)]);

        let finished = Arc::new(AtomicBool::new(false));
        let f = finished.clone();
        let mut steps_left = 3;
        engine.work_items.enqueue(WorkItem::resumable(
            || {},
            move || {
                steps_left -= 1;
                let done = steps_left == 0;
                if done {
                    f.store(true, Ordering::SeqCst);
                }
                done
            },
        ));

        // No tick has run, so the item is still sitting unstarted.
        engine.destroy();

        assert!(finished.load(Ordering::SeqCst), "destroy must drain pending work items before tearing down");
    }

    // PathReturned's duration_ms must reflect real queued-to-returned
    // latency, not a hardcoded placeholder.
    #[test]
    fn path_returned_event_reports_real_elapsed_time() {
        init_tracing();

        struct Slow;
        impl PathSearch for Slow {
            fn prepare_base(&mut self, _handler: &mut PathHandler, _path_id: PathId) {}
            fn prepare(&mut self) -> bool {
                false
            }
            fn initialize(&mut self, _handler: &mut PathHandler) {}
            fn calculate_step(&mut self, _handler: &mut PathHandler, _target_tick: Instant) -> bool {
                thread::sleep(Duration::from_millis(5));
                true
            }
            fn is_done(&self) -> bool {
                true
            }
            fn cleanup(&mut self) {}
        }

        let config = EngineConfig { workers: WorkerCountHint::Single, ..Default::default() };
        let mut engine = Engine::initialize(config, vec![Box::new(StubGraph)]);
        let mut events = engine.subscribe();

        engine.start_path(Box::new(Slow), None, false).unwrap();
        for _ in 0..10 {
            engine.tick();
        }

        let mut duration_ms = None;
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::PathReturned { duration_ms: d, .. } = event {
                duration_ms = Some(d);
            }
        }
        assert!(
            duration_ms.unwrap_or(0) >= 5,
            "PathReturned must report the real queued-to-returned latency, not a hardcoded 0"
        );

        engine.destroy();
    }
}
