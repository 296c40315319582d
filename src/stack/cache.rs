//! Shared, deduplicating store of captured stacks.

use std::collections::HashMap;
use std::sync::Arc;

use crate::stack::{StackCapture, StackId};
use crate::sync::atomics::StatCounter;
use crate::sync::mutex::Mutex;

/// Deduplicates allocation and free stacks by identity.
///
/// Every block record holds an `Arc` to its stacks; a hot allocation site
/// therefore costs one capture in memory no matter how many live blocks it
/// produced. Entries are counted per [`save`](Self::save), so clones kept by
/// reports do not pin them.
pub struct StackCaptureCache {
    stacks: Mutex<HashMap<StackId, CachedStack>>,
    saved: StatCounter,
    hits: StatCounter,
}

struct CachedStack {
    stack: Arc<StackCapture>,
    /// Outstanding references handed out by `save`.
    refs: usize,
}

impl StackCaptureCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self {
            stacks: Mutex::new(HashMap::new()),
            saved: StatCounter::new(),
            hits: StatCounter::new(),
        }
    }

    /// Store a capture, returning the shared copy for its identity.
    pub fn save(&self, capture: StackCapture) -> Arc<StackCapture> {
        self.saved.increment();
        let mut stacks = self.stacks.lock();
        if let Some(existing) = stacks.get_mut(&capture.stack_id()) {
            self.hits.increment();
            existing.refs += 1;
            return Arc::clone(&existing.stack);
        }
        let shared = Arc::new(capture);
        stacks.insert(
            shared.stack_id(),
            CachedStack {
                stack: Arc::clone(&shared),
                refs: 1,
            },
        );
        shared
    }

    /// Give back one reference obtained from [`save`](Self::save). The entry
    /// is dropped with its last reference.
    pub fn release(&self, stack: Arc<StackCapture>) {
        let mut stacks = self.stacks.lock();
        let id = stack.stack_id();
        let Some(cached) = stacks
            .get_mut(&id)
            .filter(|cached| Arc::ptr_eq(&cached.stack, &stack))
        else {
            return;
        };
        cached.refs -= 1;
        if cached.refs == 0 {
            stacks.remove(&id);
        }
    }

    /// Look up a stored capture.
    pub fn get(&self, id: StackId) -> Option<Arc<StackCapture>> {
        self.stacks
            .lock()
            .get(&id)
            .map(|cached| Arc::clone(&cached.stack))
    }

    /// Number of distinct stacks held.
    pub fn len(&self) -> usize {
        self.stacks.lock().len()
    }

    /// Whether the cache holds nothing.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Saves answered by an existing entry.
    pub fn hits(&self) -> u64 {
        self.hits.get()
    }

    /// Total saves.
    pub fn saves(&self) -> u64 {
        self.saved.get()
    }
}

impl Default for StackCaptureCache {
    fn default() -> Self {
        Self::new()
    }
}
