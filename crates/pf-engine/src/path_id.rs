use pf_core::PathId;

/// 16-bit rolling path identifier generator (spec.md §4.3).
///
/// Main-thread-only. `0` is reserved as the "invalid/sentinel" id and is
/// never handed out: on wrap, the overflow callback fires and the counter
/// is reset straight to `1`.
pub(crate) struct PathIdGenerator {
    next: u16,
    overflow: Option<Box<dyn FnOnce() + Send>>,
}

impl PathIdGenerator {
    pub(crate) fn new() -> Self {
        PathIdGenerator {
            next: 1,
            overflow: None,
        }
    }

    /// Register the (single) callback to run on the next 65k-wrap. Per
    /// spec.md §4.3, the callback is cleared once fired so subscribers can
    /// decide whether to re-register for the next wrap.
    pub(crate) fn register_overflow(&mut self, callback: Box<dyn FnOnce() + Send>) {
        self.overflow = Some(callback);
    }

    /// Allocate the next id, firing and clearing the overflow callback if
    /// this allocation wrapped the counter.
    pub(crate) fn allocate(&mut self) -> PathId {
        let id = self.next;
        self.next = match self.next.wrapping_add(1) {
            0 => {
                if let Some(callback) = self.overflow.take() {
                    callback();
                }
                1
            }
            n => n,
        };
        PathId(id)
    }
}

impl Default for PathIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
