// Watcher arena - storage for watcher metadata
//
// Every tree owns one arena (through its Root). A scope's registry only keeps
// WatcherIds; the evaluator, reaction, comparison mode and last observed value
// live here.
//
// Slots are reused by the slab, so every id also carries the serial number the
// watcher was created with. An id whose serial does not match the occupant of
// its slot is stale and every accessor returns None for it.
//
// Callbacks are taken out of the arena while they run (see CallbackGuard), so
// a running evaluator or reaction may freely register or remove watchers,
// including itself.

use crate::scope::{Scope, ScopeId};
use crate::value::{CompareMode, Value};
use parking_lot::{Mutex, RwLock};
use slab::Slab;
use std::sync::atomic::{AtomicU32, Ordering};

/// Evaluator of a watcher: derives the watched value from its scope.
pub(crate) type Evaluator = Box<dyn FnMut(&Scope) -> Value + Send>;

/// Reaction of a watcher: `(new, old, scope)`.
pub(crate) type Reaction = Box<dyn FnMut(&Value, &Value, &Scope) + Send>;

/// Identifier of a watcher in its tree's arena.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct WatcherId {
    index: u32,
    serial: u32,
}

impl WatcherId {
    /// Convert to usize for slab indexing
    fn index(self) -> usize {
        self.index as usize
    }
}

/// Result of comparing a freshly evaluated value with the stored one.
#[derive(Debug)]
pub(crate) enum Observation {
    /// Equal under the watcher's comparison mode.
    Unchanged,
    /// Different; the new value has been stored. `old` is the previous stored
    /// value, or the new value itself on the first observation.
    Changed { old: Value },
}

/// Metadata for a watcher stored in the arena.
pub(crate) struct WatcherMetadata {
    serial: u32,
    owner: ScopeId,
    mode: CompareMode,
    evaluator: Mutex<Option<Evaluator>>,
    reaction: Mutex<Option<Reaction>>,
    /// `None` until the first digest observes a value, so that even
    /// `Value::Undefined` counts as a change the first time.
    last: Mutex<Option<Value>>,
}

impl WatcherMetadata {
    pub(crate) fn new(
        owner: ScopeId,
        mode: CompareMode,
        evaluator: Evaluator,
        reaction: Reaction,
    ) -> Self {
        Self {
            serial: 0,
            owner,
            mode,
            evaluator: Mutex::new(Some(evaluator)),
            reaction: Mutex::new(Some(reaction)),
            last: Mutex::new(None),
        }
    }

    /// Compare `new` with the stored value and store it if it changed.
    fn observe(&self, new: &Value) -> Observation {
        let mut last = self.last.lock();
        match last.as_ref() {
            Some(old) if self.mode.are_equal(new, old) => Observation::Unchanged,
            previous => {
                let old = previous.cloned().unwrap_or_else(|| new.clone());
                *last = Some(self.mode.snapshot(new));
                Observation::Changed { old }
            }
        }
    }
}

fn evaluator_slot(meta: &WatcherMetadata) -> &Mutex<Option<Evaluator>> {
    &meta.evaluator
}

fn reaction_slot(meta: &WatcherMetadata) -> &Mutex<Option<Reaction>> {
    &meta.reaction
}

/// Guard that restores a callback to the arena on drop (even on panic).
///
/// If the watcher was removed while its callback ran, the slot is gone (or
/// holds a different serial) and the callback is simply dropped.
struct CallbackGuard<'a, C> {
    arena: &'a WatcherArena,
    id: WatcherId,
    slot: fn(&WatcherMetadata) -> &Mutex<Option<C>>,
    callback: Option<C>,
}

impl<C> Drop for CallbackGuard<'_, C> {
    fn drop(&mut self) {
        let mut leftover = self.callback.take();
        if leftover.is_some() {
            let slot = self.slot;
            self.arena.with(self.id, |meta| {
                let mut stored = slot(meta).lock();
                if stored.is_none() {
                    *stored = leftover.take();
                }
            });
        }
        // Dropped outside the arena lock: user closures may own scopes.
        drop(leftover);
    }
}

/// Slab of every watcher registered anywhere in one tree.
pub(crate) struct WatcherArena {
    slots: RwLock<Slab<WatcherMetadata>>,
    next_serial: AtomicU32,
}

impl WatcherArena {
    pub(crate) fn new() -> Self {
        Self {
            slots: RwLock::new(Slab::new()),
            next_serial: AtomicU32::new(1),
        }
    }

    /// Insert a watcher and return its id
    pub(crate) fn insert(&self, mut metadata: WatcherMetadata) -> WatcherId {
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        metadata.serial = serial;
        let mut slots = self.slots.write();
        let entry = slots.vacant_entry();
        let index = entry.key() as u32;
        entry.insert(metadata);
        WatcherId { index, serial }
    }

    /// Remove a watcher. Returns false if it was already gone.
    pub(crate) fn remove(&self, id: WatcherId) -> bool {
        let removed = {
            let mut slots = self.slots.write();
            let live = slots
                .get(id.index())
                .is_some_and(|meta| meta.serial == id.serial);
            live.then(|| slots.remove(id.index()))
        };
        // Dropped outside the arena lock: user closures may own scopes.
        removed.is_some()
    }

    /// Access the watcher metadata with a closure (read-only)
    ///
    /// Returns None if the watcher has been removed (stale access).
    fn with<F, R>(&self, id: WatcherId, f: F) -> Option<R>
    where
        F: FnOnce(&WatcherMetadata) -> R,
    {
        let slots = self.slots.read();
        slots
            .get(id.index())
            .filter(|meta| meta.serial == id.serial)
            .map(f)
    }

    #[cfg(test)]
    fn contains(&self, id: WatcherId) -> bool {
        self.with(id, |_| ()).is_some()
    }

    /// Scope the watcher was registered on.
    pub(crate) fn owner(&self, id: WatcherId) -> Option<ScopeId> {
        self.with(id, |meta| meta.owner)
    }

    /// Number of live watchers in the tree.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.slots.read().len()
    }

    /// Take a callback out of the arena and run it with the arena unlocked.
    ///
    /// Returns None if the watcher no longer exists or its callback is already
    /// running further up the stack.
    fn run_callback<C, R>(
        &self,
        id: WatcherId,
        slot: fn(&WatcherMetadata) -> &Mutex<Option<C>>,
        run: impl FnOnce(&mut C) -> R,
    ) -> Option<R> {
        let callback = self.with(id, |meta| slot(meta).lock().take()).flatten()?;
        // Arena lock released - the callback may register or remove watchers
        let mut guard = CallbackGuard {
            arena: self,
            id,
            slot,
            callback: Some(callback),
        };
        guard.callback.as_mut().map(run)
    }

    /// Run the evaluator against `scope`.
    pub(crate) fn evaluate(&self, id: WatcherId, scope: &Scope) -> Option<Value> {
        self.run_callback(id, evaluator_slot, |evaluator| evaluator(scope))
    }

    /// Run the reaction with `(new, old, scope)`.
    pub(crate) fn react(&self, id: WatcherId, new: &Value, old: &Value, scope: &Scope) {
        self.run_callback(id, reaction_slot, |reaction| reaction(new, old, scope));
    }

    /// Compare `new` against the watcher's last value, storing it on change.
    pub(crate) fn observe(&self, id: WatcherId, new: &Value) -> Option<Observation> {
        self.with(id, |meta| meta.observe(new))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    fn metadata(mode: CompareMode) -> WatcherMetadata {
        WatcherMetadata::new(
            ScopeId::for_tests(0),
            mode,
            Box::new(|_| Value::Undefined),
            Box::new(|_, _, _| {}),
        )
    }

    #[test]
    fn stale_access_returns_none() {
        let arena = WatcherArena::new();
        let id = arena.insert(metadata(CompareMode::Reference));

        assert!(arena.remove(id));
        assert!(!arena.remove(id));

        assert!(arena.observe(id, &Value::Null).is_none());
        assert!(arena.owner(id).is_none());
    }

    #[test]
    fn reused_slot_does_not_alias_stale_id() {
        let arena = WatcherArena::new();
        let first = arena.insert(metadata(CompareMode::Reference));
        arena.remove(first);

        let second = arena.insert(metadata(CompareMode::Reference));
        assert_eq!(first.index, second.index);
        assert_ne!(first, second);
        assert!(!arena.contains(first));
        assert!(arena.contains(second));
    }

    #[test]
    fn first_observation_is_a_change_even_for_undefined() {
        let arena = WatcherArena::new();
        let id = arena.insert(metadata(CompareMode::Reference));

        match arena.observe(id, &Value::Undefined) {
            Some(Observation::Changed { old }) => assert!(old.is_undefined()),
            other => panic!("expected change, got {other:?}"),
        }
        assert!(matches!(
            arena.observe(id, &Value::Undefined),
            Some(Observation::Unchanged)
        ));
    }

    #[test]
    fn deep_observation_stores_detached_copy() {
        let arena = WatcherArena::new();
        let id = arena.insert(metadata(CompareMode::Deep));
        let list = Value::list([1, 2]);

        arena.observe(id, &list);
        list.as_list().unwrap().push(3);

        match arena.observe(id, &list) {
            Some(Observation::Changed { old }) => assert_eq!(old.as_list().unwrap().len(), 2),
            other => panic!("expected change, got {other:?}"),
        }
    }

    #[test]
    fn callback_restored_after_panic() {
        let arena = WatcherArena::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let id = arena.insert(WatcherMetadata::new(
            ScopeId::for_tests(0),
            CompareMode::Reference,
            Box::new(|_| Value::Undefined),
            Box::new(move |_, _, _| {
                if calls_clone.fetch_add(1, Ordering::Relaxed) == 0 {
                    panic!("first reaction fails");
                }
            }),
        ));

        let scope = Scope::new();
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            arena.react(id, &Value::Null, &Value::Null, &scope);
        }));
        assert!(outcome.is_err());

        arena.react(id, &Value::Null, &Value::Null, &scope);
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }
}
