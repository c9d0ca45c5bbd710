use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use pf_core::Path;

struct Node {
    path: Arc<Path>,
    next: *mut Node,
}

/// Lock-free LIFO stack workers push completed paths onto, and the main
/// thread drains on its own schedule (spec.md §4.5).
///
/// A worker finishing a search must never block on the main thread, so
/// pushes are a single `compare_exchange` loop rather than going through
/// `PathQueue`'s mutex. Order among returned paths is not meaningful to
/// callers — each carries its own id and callback — so LIFO draining is
/// fine.
pub(crate) struct ReturnPipeline {
    head: AtomicPtr<Node>,
}

unsafe impl Send for ReturnPipeline {}
unsafe impl Sync for ReturnPipeline {}

impl ReturnPipeline {
    pub(crate) fn new() -> Self {
        ReturnPipeline {
            head: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    /// Push a completed path. Never blocks.
    pub(crate) fn push(&self, path: Arc<Path>) {
        let node = Box::into_raw(Box::new(Node {
            path,
            next: std::ptr::null_mut(),
        }));
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            unsafe {
                (*node).next = head;
            }
            match self.head.compare_exchange_weak(
                head,
                node,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    /// Atomically take the whole stack, returning it as a `Vec` in
    /// push-to-pop (most-recent-first) order.
    pub(crate) fn drain(&self) -> Vec<Arc<Path>> {
        let mut head = self.head.swap(std::ptr::null_mut(), Ordering::AcqRel);
        let mut out = Vec::new();
        while !head.is_null() {
            let node = unsafe { Box::from_raw(head) };
            head = node.next;
            out.push(node.path);
        }
        out
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }
}

impl Default for ReturnPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ReturnPipeline {
    fn drop(&mut self) {
        // Free anything left undrained.
        let _ = self.drain();
    }
}
