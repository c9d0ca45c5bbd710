use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use pf_core::{EngineError, Path, PathState};

/// The queue has been terminated; the receiver should exit its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Terminated;

struct QueueState {
    fifo: VecDeque<Arc<Path>>,
    receiver_count: usize,
    blocked_count: usize,
    blocking: bool,
    terminating: bool,
}

/// Bounded multi-producer/multi-consumer queue of pending path searches,
/// with the three-state control protocol (open / blocking / terminating)
/// described in spec.md §4.1.
///
/// This is the *only* synchronization primitive shared between the main
/// thread and the search workers — graph-mutation safety is derived
/// entirely from [`PathQueue::all_receivers_blocked`] being observable by
/// the main thread once it calls [`PathQueue::block`].
pub(crate) struct PathQueue {
    state: Mutex<QueueState>,
    cv: Condvar,
}

impl PathQueue {
    /// `receiver_count` is the number of workers (threaded or the single
    /// cooperative worker) that will call `pop_blocking`/`pop_non_blocking`.
    pub(crate) fn new(receiver_count: usize) -> Self {
        PathQueue {
            state: Mutex::new(QueueState {
                fifo: VecDeque::new(),
                receiver_count,
                blocked_count: 0,
                blocking: false,
                terminating: false,
            }),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn push(&self, path: Arc<Path>) -> Result<(), EngineError> {
        let mut state = self.state.lock().expect("queue mutex poisoned");
        if state.terminating {
            return Err(EngineError::Terminated);
        }
        path.advance_state(PathState::Queued);
        state.fifo.push_back(path);
        drop(state);
        self.cv.notify_all();
        Ok(())
    }

    /// Insert at the head — one slot's worth of priority over the FIFO.
    pub(crate) fn push_front(&self, path: Arc<Path>) -> Result<(), EngineError> {
        let mut state = self.state.lock().expect("queue mutex poisoned");
        if state.terminating {
            return Err(EngineError::Terminated);
        }
        path.advance_state(PathState::Queued);
        state.fifo.push_front(path);
        drop(state);
        self.cv.notify_all();
        Ok(())
    }

    /// Park until a path is available and the queue isn't blocking, or
    /// until termination. While the queue is blocking, an available path
    /// is deliberately ignored — that's what gives the main thread a
    /// quiescence window.
    pub(crate) fn pop_blocking(&self) -> Result<Arc<Path>, Terminated> {
        let mut state = self.state.lock().expect("queue mutex poisoned");
        loop {
            if state.terminating {
                return Err(Terminated);
            }
            if !state.blocking {
                if let Some(path) = state.fifo.pop_front() {
                    return Ok(path);
                }
            }
            state.blocked_count += 1;
            state = self.cv.wait(state).expect("queue mutex poisoned");
            state.blocked_count -= 1;
        }
    }

    /// Non-parking variant for the cooperative (threadless) worker. The
    /// caller simulates "parked" across repeated tick-driven calls by
    /// passing `already_reported_block = true` on every call after the
    /// first that returned `None`.
    pub(crate) fn pop_non_blocking(
        &self,
        already_reported_block: bool,
    ) -> Result<Option<Arc<Path>>, Terminated> {
        let mut state = self.state.lock().expect("queue mutex poisoned");
        if state.terminating {
            if already_reported_block {
                state.blocked_count = state.blocked_count.saturating_sub(1);
            }
            return Err(Terminated);
        }
        if !state.blocking {
            if let Some(path) = state.fifo.pop_front() {
                if already_reported_block {
                    state.blocked_count = state.blocked_count.saturating_sub(1);
                }
                return Ok(Some(path));
            }
        }
        if !already_reported_block {
            state.blocked_count += 1;
        }
        Ok(None)
    }

    pub(crate) fn block(&self) {
        self.state.lock().expect("queue mutex poisoned").blocking = true;
    }

    pub(crate) fn unblock(&self) {
        let mut state = self.state.lock().expect("queue mutex poisoned");
        state.blocking = false;
        drop(state);
        self.cv.notify_all();
    }

    pub(crate) fn all_receivers_blocked(&self) -> bool {
        let state = self.state.lock().expect("queue mutex poisoned");
        if state.receiver_count == 0 {
            true
        } else {
            state.blocked_count == state.receiver_count
        }
    }

    /// One-way: marks terminating, wakes every parked receiver. All
    /// subsequent pops return `Err(Terminated)`.
    pub(crate) fn terminate(&self) {
        let mut state = self.state.lock().expect("queue mutex poisoned");
        state.terminating = true;
        drop(state);
        self.cv.notify_all();
    }

    pub(crate) fn is_terminating(&self) -> bool {
        self.state.lock().expect("queue mutex poisoned").terminating
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().expect("queue mutex poisoned").fifo.len()
    }

    /// Take everything still sitting in the fifo, in order. Meant to be
    /// called after [`PathQueue::terminate`] — once `terminating` is set no
    /// further `pop_*` call will remove an entry, so this is the only way
    /// queued-but-never-popped paths get a chance to return (spec.md §5:
    /// "queued paths are drained as errored").
    pub(crate) fn drain_remaining(&self) -> Vec<Arc<Path>> {
        self.state.lock().expect("queue mutex poisoned").fifo.drain(..).collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
