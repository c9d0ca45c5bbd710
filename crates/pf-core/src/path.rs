use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::handles::PathId;
use crate::search::PathSearch;

/// A path's lifecycle state. Transitions strictly increase; see spec.md §4.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PathState {
    Created,
    Queued,
    Processing,
    ReturnQueue,
    Returned,
}

/// What a completed path's callback receives.
#[derive(Debug, Clone)]
pub struct PathOutcome {
    pub id: PathId,
    pub error: Option<String>,
    pub duration: Duration,
}

struct PathInner {
    state: PathState,
    error: Option<String>,
    duration: Option<Duration>,
    search: Box<dyn PathSearch>,
    callback: Option<Box<dyn FnOnce(PathOutcome) + Send>>,
}

/// A single path search request.
///
/// Shared between the requester and the engine via `Arc<Path>` — Rust's
/// ordinary reference counting plays the role spec.md §3's "owning-engine
/// ref-count" describes; the path is simply dropped once both sides are
/// done with it, the last drop happening after `Returned`.
pub struct Path {
    pub id: PathId,
    queued_at: Instant,
    inner: Mutex<PathInner>,
}

impl Path {
    pub fn new(
        id: PathId,
        search: Box<dyn PathSearch>,
        callback: Option<Box<dyn FnOnce(PathOutcome) + Send>>,
    ) -> Self {
        Path {
            id,
            queued_at: Instant::now(),
            inner: Mutex::new(PathInner {
                state: PathState::Created,
                error: None,
                duration: None,
                search,
                callback,
            }),
        }
    }

    pub fn state(&self) -> PathState {
        self.inner.lock().expect("path mutex poisoned").state
    }

    /// Wall-clock time since this path was constructed (effectively since
    /// `Queued`, since `Engine::start_path` builds and enqueues a `Path` in
    /// the same call). This is the end-to-end latency spec.md §3's
    /// `duration` field describes for the `PathReturned` event, distinct
    /// from [`Path::set_duration`]'s worker-measured search-only time.
    pub fn elapsed_since_queued(&self) -> Duration {
        self.queued_at.elapsed()
    }

    pub fn error(&self) -> Option<String> {
        self.inner.lock().expect("path mutex poisoned").error.clone()
    }

    pub fn is_errored(&self) -> bool {
        self.error().is_some()
    }

    /// Advance to `next`. Panics on a backward or skipped-forward
    /// transition — a bug in the engine, never a caller mistake.
    pub fn advance_state(&self, next: PathState) {
        let mut inner = self.inner.lock().expect("path mutex poisoned");
        assert!(
            next > inner.state,
            "path {:?}: illegal transition {:?} -> {:?}",
            self.id,
            inner.state,
            next
        );
        inner.state = next;
    }

    pub fn set_error(&self, message: impl Into<String>) {
        self.inner.lock().expect("path mutex poisoned").error = Some(message.into());
    }

    pub fn set_duration(&self, duration: Duration) {
        self.inner.lock().expect("path mutex poisoned").duration = Some(duration);
    }

    /// Run `f` against the boxed search algorithm. The engine only ever
    /// calls this from the one worker thread that owns this path at a
    /// given time, so the lock is never contended.
    pub fn with_search<R>(&self, f: impl FnOnce(&mut dyn PathSearch) -> R) -> R {
        let mut inner = self.inner.lock().expect("path mutex poisoned");
        f(inner.search.as_mut())
    }

    /// Consume the registered callback (if any) and invoke it with the
    /// path's final outcome. Idempotent: a second call is a no-op.
    pub fn fire_callback(&self) {
        let (callback, outcome) = {
            let mut inner = self.inner.lock().expect("path mutex poisoned");
            let callback = inner.callback.take();
            let outcome = PathOutcome {
                id: self.id,
                error: inner.error.clone(),
                duration: inner.duration.unwrap_or_default(),
            };
            (callback, outcome)
        };
        if let Some(callback) = callback {
            callback(outcome);
        }
    }
}

impl std::fmt::Debug for Path {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Path")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}
