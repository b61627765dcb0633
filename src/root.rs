// State owned by the root of a scope tree
//
// Every node of a tree, isolated nodes included, holds an Arc to the same
// Root. That single allocation is what makes the queues "shared by
// reference": any node may enqueue, and only the digest and the async
// scheduler drain.
//
// Locks in here are never held while user code runs. Drains pop one entry
// at a time so that a task may enqueue more work into the queue being drained.

use crate::arena::{WatcherArena, WatcherId};
use crate::config::ScopeConfig;
use crate::error::{Phase, ScopeError};
use crate::executor::{EventLoop, Scheduler, TimerHandle};
use crate::scope::Scope;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Body of an in-cycle task.
pub(crate) type TaskBody = Box<dyn FnOnce(&Scope) + Send>;

/// Deferred work with no arguments (coalesced tasks and post-cycle hooks).
pub(crate) type Job = Box<dyn FnOnce() + Send>;

/// An in-cycle task and the scope it runs against.
pub(crate) struct AsyncTask {
    pub(crate) scope: Scope,
    pub(crate) body: TaskBody,
}

pub(crate) struct Root {
    pub(crate) config: ScopeConfig,
    pub(crate) scheduler: Arc<dyn Scheduler>,
    /// Set when the builder created the scheduler itself; the same loop as
    /// `scheduler`, kept concrete so callers can drive it.
    pub(crate) event_loop: Option<Arc<EventLoop>>,
    pub(crate) watchers: WatcherArena,
    phase: Mutex<Option<Phase>>,
    /// Last watcher found dirty; a clean re-check of it ends the pass early.
    last_dirty_watcher: Mutex<Option<WatcherId>>,
    pub(crate) async_queue: Mutex<VecDeque<AsyncTask>>,
    pub(crate) apply_async_queue: Mutex<VecDeque<Job>>,
    pub(crate) apply_async_timer: Mutex<Option<TimerHandle>>,
    pub(crate) post_digest_queue: Mutex<VecDeque<Job>>,
}

impl Root {
    pub(crate) fn new(
        config: ScopeConfig,
        scheduler: Arc<dyn Scheduler>,
        event_loop: Option<Arc<EventLoop>>,
    ) -> Self {
        Self {
            config,
            scheduler,
            event_loop,
            watchers: WatcherArena::new(),
            phase: Mutex::new(None),
            last_dirty_watcher: Mutex::new(None),
            async_queue: Mutex::new(VecDeque::new()),
            apply_async_queue: Mutex::new(VecDeque::new()),
            apply_async_timer: Mutex::new(None),
            post_digest_queue: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn phase(&self) -> Option<Phase> {
        *self.phase.lock()
    }

    /// Claim the tree for `phase`. The returned guard releases it on drop,
    /// including during unwinding.
    pub(crate) fn begin_phase(&self, phase: Phase) -> Result<PhaseGuard<'_>, ScopeError> {
        let mut current = self.phase.lock();
        if let Some(active) = *current {
            return Err(ScopeError::PhaseInProgress(active));
        }
        *current = Some(phase);
        Ok(PhaseGuard { root: self })
    }

    fn clear_phase(&self) {
        *self.phase.lock() = None;
    }

    pub(crate) fn last_dirty_watcher(&self) -> Option<WatcherId> {
        *self.last_dirty_watcher.lock()
    }

    pub(crate) fn set_last_dirty_watcher(&self, id: Option<WatcherId>) {
        *self.last_dirty_watcher.lock() = id;
    }

    pub(crate) fn has_pending_async(&self) -> bool {
        !self.async_queue.lock().is_empty()
    }
}

/// RAII guard for the tree's phase.
///
/// Dropping it (normally or during a panic) clears the phase so the tree stays
/// usable after a failed digest or a panicking apply body.
pub(crate) struct PhaseGuard<'a> {
    root: &'a Root,
}

impl PhaseGuard<'_> {
    /// Clear the phase now instead of at the end of the scope.
    pub(crate) fn release(self) {
        drop(self);
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        self.root.clear_phase();
    }
}
