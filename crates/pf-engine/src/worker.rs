use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use pf_core::{Path, PathHandler, PathState};

use crate::queue::{PathQueue, Terminated};
use crate::return_pipeline::ReturnPipeline;

/// Shared, live-tunable per-iteration search budget (spec.md §4.2: "the
/// worker re-reads the engine's max-frame-time budget on every yield").
pub type TickBudget = Arc<AtomicU64>;

pub(crate) fn tick_budget(initial: Duration) -> TickBudget {
    Arc::new(AtomicU64::new(initial.as_nanos() as u64))
}

fn read_budget(budget: &TickBudget) -> Duration {
    Duration::from_nanos(budget.load(Ordering::Relaxed))
}

/// A hook run after a search completes or errors out, before the path is
/// pushed to the return pipeline. Spec.md §6: `onPathPreSearch`/
/// `onPathPostSearch` listeners run on the worker thread and must be
/// reentrant.
pub(crate) type PostSearchHook = Arc<dyn Fn(&Path) + Send + Sync>;

/// Runs one search to completion (or to an engine-wide termination),
/// honoring the Prepare-short-circuit and mid-search-termination edge
/// cases from spec.md §4.2.
fn drive_search(
    path: &Path,
    handler: &Mutex<PathHandler>,
    queue: &PathQueue,
    budget: &TickBudget,
) {
    path.with_search(|search| search.prepare_base(&mut handler.lock().expect("handler mutex poisoned"), path.id));
    let already_done = path.with_search(|search| search.prepare());

    if !already_done {
        path.with_search(|search| search.initialize(&mut handler.lock().expect("handler mutex poisoned")));
        loop {
            if queue.is_terminating() {
                path.set_error("engine terminated during search");
                break;
            }
            let target_tick = Instant::now() + read_budget(budget);
            let done = path.with_search(|search| {
                search.calculate_step(&mut handler.lock().expect("handler mutex poisoned"), target_tick)
            });
            if done {
                break;
            }
            thread::yield_now();
        }
    }

    path.with_search(|search| search.cleanup());
}

fn finish_path(
    path: Arc<Path>,
    started_at: Instant,
    post_search: &PostSearchHook,
    returns: &ReturnPipeline,
) {
    path.set_duration(started_at.elapsed());
    post_search(&path);
    returns.push(path.clone());
    path.advance_state(PathState::ReturnQueue);
}

/// Spawn one OS-thread search worker. It parks on `queue.pop_blocking`
/// between searches and exits cleanly once the queue is terminated.
///
/// An unhandled panic inside a search is caught, the path is returned
/// errored, and the whole engine is terminated (spec.md §7: "fatal worker
/// errors" must not retry silently).
pub(crate) fn spawn(
    id: usize,
    queue: Arc<PathQueue>,
    returns: Arc<ReturnPipeline>,
    handler: Arc<Mutex<PathHandler>>,
    budget: TickBudget,
    post_search: PostSearchHook,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name(format!("pf-search-worker-{id}"))
        .spawn(move || {
            loop {
                let path = match queue.pop_blocking() {
                    Ok(path) => path,
                    Err(Terminated) => {
                        tracing::debug!(worker = id, "queue terminated, exiting");
                        return;
                    }
                };
                path.advance_state(PathState::Processing);
                let started_at = Instant::now();

                let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                    drive_search(&path, &handler, &queue, &budget);
                }));

                if outcome.is_err() {
                    tracing::error!(worker = id, path = %path.id.0, "search worker panicked");
                    path.set_error("search worker panicked");
                    queue.terminate();
                }

                finish_path(path, started_at, &post_search, &returns);
            }
        })
        .expect("failed to spawn search worker thread")
}

/// The single-worker fallback used when threads are unavailable (spec.md
/// §4.9, §5: "when M = 0, a single cooperative worker is stepped by the
/// host tick"). Each call to [`CooperativeWorker::step`] advances at most
/// one search by one `calculate_step`, returning whether it made progress.
pub(crate) struct CooperativeWorker {
    handler: Arc<Mutex<PathHandler>>,
    current: Option<InFlight>,
    reported_block: bool,
}

struct InFlight {
    path: Arc<Path>,
    started_at: Instant,
    prepared: bool,
}

impl CooperativeWorker {
    pub(crate) fn new(handler: Arc<Mutex<PathHandler>>) -> Self {
        CooperativeWorker {
            handler,
            current: None,
            reported_block: false,
        }
    }

    /// Advance by one slice. Returns `true` if it did anything (picked up
    /// a path, stepped a search, or finished one).
    pub(crate) fn step(
        &mut self,
        queue: &PathQueue,
        returns: &ReturnPipeline,
        budget: &TickBudget,
        post_search: &PostSearchHook,
    ) -> bool {
        if self.current.is_none() {
            match queue.pop_non_blocking(self.reported_block) {
                Ok(Some(path)) => {
                    self.reported_block = false;
                    path.advance_state(PathState::Processing);
                    self.current = Some(InFlight {
                        path,
                        started_at: Instant::now(),
                        prepared: false,
                    });
                }
                Ok(None) => {
                    self.reported_block = true;
                    return false;
                }
                Err(Terminated) => {
                    self.reported_block = false;
                    return false;
                }
            }
        }

        let Some(in_flight) = self.current.as_mut() else {
            return false;
        };

        if !in_flight.prepared {
            in_flight
                .path
                .with_search(|s| s.prepare_base(&mut self.handler.lock().expect("handler mutex poisoned"), in_flight.path.id));
            let already_done = in_flight.path.with_search(|s| s.prepare());
            in_flight.prepared = true;
            if !already_done {
                in_flight
                    .path
                    .with_search(|s| s.initialize(&mut self.handler.lock().expect("handler mutex poisoned")));
                return true;
            }
        } else if queue.is_terminating() {
            in_flight.path.set_error("engine terminated during search");
        } else {
            let target_tick = Instant::now() + read_budget(budget);
            let done = in_flight.path.with_search(|s| {
                s.calculate_step(&mut self.handler.lock().expect("handler mutex poisoned"), target_tick)
            });
            if !done {
                return true;
            }
        }

        let in_flight = self.current.take().expect("checked above");
        in_flight.path.with_search(|s| s.cleanup());
        finish_path(in_flight.path, in_flight.started_at, post_search, returns);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pf_core::{PathId, PathSearch};
    use std::sync::atomic::AtomicBool;

    struct Scripted {
        steps_remaining: usize,
        done_immediately: bool,
        initialized: Arc<AtomicBool>,
        cleaned_up: Arc<AtomicBool>,
    }
    impl PathSearch for Scripted {
        fn prepare_base(&mut self, _handler: &mut PathHandler, _path_id: pf_core::PathId) {}
        fn prepare(&mut self) -> bool {
            self.done_immediately
        }
        fn initialize(&mut self, _handler: &mut PathHandler) {
            self.initialized.store(true, Ordering::SeqCst);
        }
        fn calculate_step(&mut self, _handler: &mut PathHandler, _target_tick: Instant) -> bool {
            if self.steps_remaining == 0 {
                true
            } else {
                self.steps_remaining -= 1;
                self.steps_remaining == 0
            }
        }
        fn is_done(&self) -> bool {
            self.steps_remaining == 0
        }
        fn cleanup(&mut self) {
            self.cleaned_up.store(true, Ordering::SeqCst);
        }
    }

    fn noop_hook() -> PostSearchHook {
        Arc::new(|_path| {})
    }

    #[test]
    fn threaded_worker_completes_a_search_and_returns_it() {
        let queue = Arc::new(PathQueue::new(1));
        let returns = Arc::new(ReturnPipeline::new());
        let budget = tick_budget(Duration::from_millis(1));
        let handler = Arc::new(Mutex::new(PathHandler::new()));
        let handle = spawn(0, queue.clone(), returns.clone(), handler, budget, noop_hook());

        let search = Scripted {
            steps_remaining: 3,
            done_immediately: false,
            initialized: Arc::new(AtomicBool::new(false)),
            cleaned_up: Arc::new(AtomicBool::new(false)),
        };
        let cleaned_up = search.cleaned_up.clone();
        let path = Arc::new(Path::new(PathId(1), Box::new(search), None));
        queue.push(path.clone()).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while returns.is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        queue.terminate();
        handle.join().unwrap();

        let drained = returns.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].id, path.id);
        assert_eq!(drained[0].state(), PathState::ReturnQueue);
        assert!(cleaned_up.load(Ordering::SeqCst));
    }

    #[test]
    fn prepare_short_circuit_skips_initialize() {
        let queue = Arc::new(PathQueue::new(1));
        let returns = Arc::new(ReturnPipeline::new());
        let budget = tick_budget(Duration::from_millis(1));
        let handler = Arc::new(Mutex::new(PathHandler::new()));
        let handle = spawn(0, queue.clone(), returns.clone(), handler, budget, noop_hook());

        let initialized = Arc::new(AtomicBool::new(false));
        let search = Scripted {
            steps_remaining: 0,
            done_immediately: true,
            initialized: initialized.clone(),
            cleaned_up: Arc::new(AtomicBool::new(false)),
        };
        let path = Arc::new(Path::new(PathId(2), Box::new(search), None));
        queue.push(path).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while returns.is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        queue.terminate();
        handle.join().unwrap();

        assert!(!initialized.load(Ordering::SeqCst));
    }

    #[test]
    fn panicking_search_terminates_the_engine_and_still_returns_errored() {
        struct Panicky;
        impl PathSearch for Panicky {
            fn prepare_base(&mut self, _handler: &mut PathHandler, _path_id: pf_core::PathId) {}
            fn prepare(&mut self) -> bool {
                false
            }
            fn initialize(&mut self, _handler: &mut PathHandler) {}
            fn calculate_step(&mut self, _handler: &mut PathHandler, _target_tick: Instant) -> bool {
                panic!("boom");
            }
            fn is_done(&self) -> bool {
                false
            }
            fn cleanup(&mut self) {}
        }

        let queue = Arc::new(PathQueue::new(1));
        let returns = Arc::new(ReturnPipeline::new());
        let budget = tick_budget(Duration::from_millis(1));
        let handler = Arc::new(Mutex::new(PathHandler::new()));
        let handle = spawn(0, queue.clone(), returns.clone(), handler, budget, noop_hook());

        let path = Arc::new(Path::new(PathId(3), Box::new(Panicky), None));
        queue.push(path).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while returns.is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        handle.join().unwrap();

        assert!(queue.is_terminating());
        let drained = returns.drain();
        assert_eq!(drained.len(), 1);
        assert!(drained[0].is_errored());
    }

    #[test]
    fn cooperative_worker_drives_a_search_to_completion() {
        let queue = PathQueue::new(1);
        let returns = ReturnPipeline::new();
        let budget = tick_budget(Duration::from_millis(1));
        let hook = noop_hook();

        let search = Scripted {
            steps_remaining: 2,
            done_immediately: false,
            initialized: Arc::new(AtomicBool::new(false)),
            cleaned_up: Arc::new(AtomicBool::new(false)),
        };
        let path = Arc::new(Path::new(PathId(4), Box::new(search), None));
        queue.push(path.clone()).unwrap();

        let mut worker = CooperativeWorker::new(Arc::new(Mutex::new(PathHandler::new())));
        let mut iterations = 0;
        while returns.is_empty() && iterations < 1000 {
            worker.step(&queue, &returns, &budget, &hook);
            iterations += 1;
        }

        let drained = returns.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].id, path.id);
    }

    #[test]
    fn cooperative_worker_reports_blocked_state_via_all_receivers_blocked() {
        let queue = PathQueue::new(1);
        let returns = ReturnPipeline::new();
        let budget = tick_budget(Duration::from_millis(1));
        let hook = noop_hook();
        let mut worker = CooperativeWorker::new(Arc::new(Mutex::new(PathHandler::new())));

        assert!(!worker.step(&queue, &returns, &budget, &hook));
        assert!(queue.all_receivers_blocked());
    }
}
