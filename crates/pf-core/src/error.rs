/// Errors the engine surfaces directly to callers (spec.md §7, "Caller errors").
///
/// These never corrupt engine state — they're rejected before anything is
/// enqueued or mutated.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// `start_path` called before any graph has been registered.
    #[error("cannot start a path: engine has no graphs")]
    NoGraphs,

    /// `wait_for_path` called on a path that was never started.
    #[error("wait_for_path called on a path that hasn't started")]
    PathNotStarted,

    /// The engine has terminated (a worker panicked, or `destroy` ran) and
    /// is rejecting all new work.
    #[error("engine is terminated and accepting no new paths")]
    Terminated,

    /// A caller invoked a mutating API during `Engine::destroy`.
    #[error("engine is tearing down")]
    Teardown,
}
