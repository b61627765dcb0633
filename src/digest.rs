//! The convergence loop.
//!
//! A digest repeatedly walks a subtree, re-evaluating every watcher and running
//! the reactions of those whose value changed, until a full pass finds nothing
//! dirty and no in-cycle task is waiting:
//!
//! ```ignore
//! let scope = Scope::new();
//! scope.set("name", "Jane");
//! scope.watch(
//!     |scope| scope.get("name"),
//!     |new, _, scope| scope.set("upper", new.as_str().unwrap_or("").to_uppercase()),
//! );
//!
//! scope.digest()?;
//! assert_eq!(scope.get("upper").as_str(), Some("JANE"));
//! ```
//!
//! Reactions that keep changing what other watchers see make the tree
//! oscillate; the digest gives up after
//! [`max_iterations`](crate::ScopeConfig::max_iterations) passes.
//!
//! Within a pass the root remembers the last watcher that was found dirty. When
//! the walk comes back around to that watcher and it is clean, everything after
//! it was already clean on the previous pass, so the pass ends early.

use crate::arena::{Observation, WatcherId};
use crate::error::{Phase, ScopeError, isolate};
use crate::scope::Scope;

/// Outcome of checking a single watcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Check {
    Clean,
    Dirty,
    /// Clean, and the last watcher found dirty: the rest of the pass is clean.
    ShortCircuit,
}

impl Scope {
    /// Run a digest over this scope and its descendants.
    ///
    /// Drains the in-cycle queue and re-runs passes until nothing is dirty,
    /// then runs the post-digest hooks. A pending coalesced flush is pulled
    /// into this digest.
    ///
    /// # Errors
    ///
    /// - [`ScopeError::PhaseInProgress`] if a digest or apply is already
    ///   running on this tree. Nothing is evaluated in that case.
    /// - [`ScopeError::MaxIterationsExceeded`] if the subtree was still dirty
    ///   after the configured number of passes. Post-digest hooks still run.
    pub fn digest(&self) -> Result<(), ScopeError> {
        let root = self.node.root.clone();
        let phase = root.begin_phase(Phase::Cycle)?;
        root.set_last_dirty_watcher(None);

        // Marker cleared only after the drain: apply_async from a batch task
        // joins this batch.
        let pending_flush = *root.apply_async_timer.lock();
        if let Some(timer) = pending_flush {
            cov_mark::hit!(coalesced_flush_pulled_forward);
            root.scheduler.cancel(timer);
            self.drain_apply_async();
            root.apply_async_timer.lock().take();
        }

        let limit = root.config.max_iterations;
        let mut iterations = 0;
        tracing::debug!(scope = %self.id(), "digest started");
        loop {
            self.drain_async_queue();
            let dirty = self.digest_once();
            iterations += 1;

            let pending = dirty || root.has_pending_async();
            if !pending {
                break;
            }
            if iterations >= limit {
                phase.release();
                tracing::debug!(scope = %self.id(), iterations, "digest did not converge");
                self.drain_post_digest();
                return Err(ScopeError::MaxIterationsExceeded { limit });
            }
        }

        phase.release();
        tracing::debug!(scope = %self.id(), iterations, "digest finished");
        self.drain_post_digest();
        Ok(())
    }

    /// One pass over the subtree. Returns true if any watcher was dirty.
    fn digest_once(&self) -> bool {
        let mut dirty = false;
        self.every_scope(&mut |scope| match scope.check_watchers() {
            Check::Clean => true,
            Check::Dirty => {
                dirty = true;
                true
            }
            Check::ShortCircuit => false,
        });
        tracing::trace!(scope = %self.id(), dirty, "pass finished");
        dirty
    }

    /// Check every watcher registered on this node, in registration order.
    ///
    /// The registry is re-read on every step, so watchers registered by a
    /// reaction on this node are checked later in the same walk, and removed
    /// watchers are skipped.
    fn check_watchers(&self) -> Check {
        self.compact_watchers();

        let mut outcome = Check::Clean;
        let mut index = 0;
        loop {
            let slot = self.node.watchers.lock().get(index).copied();
            let Some(slot) = slot else {
                break;
            };
            index += 1;
            let Some(id) = slot else {
                continue;
            };
            match self.check_watcher(id) {
                Check::Clean => {}
                Check::Dirty => outcome = Check::Dirty,
                Check::ShortCircuit => return Check::ShortCircuit,
            }
        }
        outcome
    }

    fn check_watcher(&self, id: WatcherId) -> Check {
        let root = &self.node.root;

        let Some(new) = isolate("watch function", || root.watchers.evaluate(id, self)).flatten()
        else {
            return Check::Clean;
        };

        match root.watchers.observe(id, &new) {
            Some(Observation::Changed { old }) => {
                root.set_last_dirty_watcher(Some(id));
                isolate("listener function", || {
                    root.watchers.react(id, &new, &old, self);
                });
                Check::Dirty
            }
            Some(Observation::Unchanged) if root.last_dirty_watcher() == Some(id) => {
                cov_mark::hit!(digest_short_circuit);
                Check::ShortCircuit
            }
            // Unchanged, or removed by its own evaluator
            _ => Check::Clean,
        }
    }
}
