use std::cell::Cell;

/// A unit of deferred main-thread work (spec.md §4.6, Design Notes §9).
///
/// `OneShot` runs to completion the moment it's picked up. `Resumable`
/// supports work that has to be sliced across several ticks: `init` runs
/// once, then `step` runs repeatedly (each call reporting whether it's
/// done) until it returns `true`.
///
/// Either shape can be marked [`WorkItem::dirtying_heuristic`]: when such an
/// item completes, the heuristic embedding's pivot distances are stale and
/// one recompute is owed before the engine unblocks (spec.md §4.5, glossary
/// "Heuristic embedding").
pub enum WorkItem {
    OneShot {
        task: Box<dyn FnOnce() + Send>,
        dirties_heuristic: bool,
    },
    Resumable {
        init: Option<Box<dyn FnOnce() + Send>>,
        step: Box<dyn FnMut() -> bool + Send>,
        dirties_heuristic: bool,
    },
}

impl WorkItem {
    pub fn one_shot(f: impl FnOnce() + Send + 'static) -> Self {
        WorkItem::OneShot { task: Box::new(f), dirties_heuristic: false }
    }

    pub fn resumable(
        init: impl FnOnce() + Send + 'static,
        step: impl FnMut() -> bool + Send + 'static,
    ) -> Self {
        WorkItem::Resumable {
            init: Some(Box::new(init)),
            step: Box::new(step),
            dirties_heuristic: false,
        }
    }

    /// Mark this item as changing graph connectivity or edge costs. When it
    /// completes, `WorkItemRunner` sets a sticky dirty flag the engine reads
    /// once per blocked window and clears, triggering a single heuristic
    /// recompute before `PathQueue` unblocks.
    pub fn dirtying_heuristic(mut self) -> Self {
        match &mut self {
            WorkItem::OneShot { dirties_heuristic, .. } => *dirties_heuristic = true,
            WorkItem::Resumable { dirties_heuristic, .. } => *dirties_heuristic = true,
        }
        self
    }
}

thread_local! {
    static RUNNING: Cell<bool> = const { Cell::new(false) };
}

/// Runs `WorkItem`s serially on the main thread. Spec.md §4.6 forbids a
/// work item from enqueuing and waiting on another synchronously from
/// inside its own execution — that would deadlock the single runner — so
/// `WorkItemRunner` detects reentrant calls to `run_step` and panics
/// rather than silently wedging.
#[derive(Default)]
pub(crate) struct WorkItemRunner {
    queue: std::collections::VecDeque<WorkItem>,
    heuristic_dirty: bool,
}

impl WorkItemRunner {
    pub(crate) fn new() -> Self {
        WorkItemRunner {
            queue: std::collections::VecDeque::new(),
            heuristic_dirty: false,
        }
    }

    pub(crate) fn enqueue(&mut self, item: WorkItem) {
        self.queue.push_back(item);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// True once, the first time it's read after a `dirtying_heuristic` item
    /// has completed; clears on read, same sticky-flag shape as
    /// `GraphUpdateScheduler::take_flood_fill_pending`.
    pub(crate) fn take_heuristic_dirty(&mut self) -> bool {
        std::mem::take(&mut self.heuristic_dirty)
    }

    /// Run the front item one step. Returns `true` if the queue advanced
    /// (an item completed or made progress) so callers can keep draining
    /// within a time budget, `false` if there was nothing to do.
    ///
    /// `force=true` means this is the last chance this item gets to run: a
    /// `Resumable` item whose `step` still reports "not done" under force is
    /// a fatal logic error (spec.md §4.5) and this asserts rather than
    /// silently leaving it stranded.
    pub(crate) fn run_step(&mut self, force: bool) -> bool {
        let was_running = RUNNING.with(|r| r.replace(true));
        assert!(
            !was_running,
            "work item re-entered the runner from its own execution"
        );
        let result = self.run_step_inner(force);
        RUNNING.with(|r| r.set(was_running));
        result
    }

    fn run_step_inner(&mut self, force: bool) -> bool {
        let Some(front) = self.queue.front_mut() else {
            return false;
        };
        match front {
            WorkItem::OneShot { .. } => {
                let item = self.queue.pop_front().expect("front just matched");
                if let WorkItem::OneShot { task, dirties_heuristic } = item {
                    task();
                    if dirties_heuristic {
                        self.heuristic_dirty = true;
                    }
                }
                true
            }
            WorkItem::Resumable { init, step, dirties_heuristic } => {
                if let Some(init) = init.take() {
                    init();
                }
                let done = step();
                assert!(
                    done || !force,
                    "work item returned incomplete under force=true (spec.md §4.5: \
                     an incomplete return is a fatal logic error)"
                );
                if done {
                    let dirties = *dirties_heuristic;
                    self.queue.pop_front();
                    if dirties {
                        self.heuristic_dirty = true;
                    }
                }
                true
            }
        }
    }
}
