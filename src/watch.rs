//! Watcher registration.
//!
//! A watcher pairs an evaluator, which derives a [`Value`] from a scope, with
//! a reaction that runs whenever a digest finds the derived value changed:
//!
//! ```ignore
//! let remover = scope.watch(
//!     |scope| scope.get("user"),
//!     |new, old, _| println!("{old:?} -> {new:?}"),
//! );
//! scope.digest()?;
//! remover.remove();
//! ```
//!
//! Besides plain watchers this module provides
//! - [`Scope::watch_group`]: one listener over several evaluators, called at
//!   most once per digest with all of their values.
//! - [`Scope::watch_collection`]: shallow change detection for the items of a
//!   list or the entries of a map.

use crate::arena::{WatcherId, WatcherMetadata};
use crate::scope::{Scope, ScopeNode};
use crate::value::{CompareMode, Map, Value};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Boxed evaluator, as taken by [`Scope::watch_group`].
pub type WatchFn = Box<dyn FnMut(&Scope) -> Value + Send>;

/// Deregisters what a `watch*` call registered.
///
/// Removing is idempotent and may happen at any time, including from inside a
/// watcher's own evaluator or reaction during a digest.
#[derive(Clone)]
pub struct WatchRemover {
    kind: RemoverKind,
}

#[derive(Clone)]
enum RemoverKind {
    /// Returned when watching a destroyed scope.
    Inert,
    Watcher {
        scope: Weak<ScopeNode>,
        id: WatcherId,
    },
    /// Cleared to stop pending group listener calls.
    Flag(Arc<AtomicBool>),
    Group(Vec<WatchRemover>),
}

impl WatchRemover {
    fn inert() -> Self {
        Self {
            kind: RemoverKind::Inert,
        }
    }

    /// Deregister the watcher(s).
    pub fn remove(&self) {
        match &self.kind {
            RemoverKind::Inert => {}
            RemoverKind::Watcher { scope, id } => {
                if let Some(scope) = Scope::upgrade(scope) {
                    scope.remove_watcher(*id);
                }
            }
            RemoverKind::Flag(active) => active.store(false, Ordering::Relaxed),
            RemoverKind::Group(members) => members.iter().for_each(WatchRemover::remove),
        }
    }

    /// True while anything registered by this remover can still run.
    pub fn is_active(&self) -> bool {
        match &self.kind {
            RemoverKind::Inert => false,
            RemoverKind::Watcher { scope, id } => Scope::upgrade(scope)
                .is_some_and(|scope| scope.node.root.watchers.owner(*id) == Some(scope.id())),
            RemoverKind::Flag(active) => active.load(Ordering::Relaxed),
            RemoverKind::Group(members) => members.iter().any(WatchRemover::is_active),
        }
    }
}

impl std::fmt::Debug for WatchRemover {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchRemover")
            .field("active", &self.is_active())
            .finish()
    }
}

impl Scope {
    /// Watch the value derived by `evaluator`, comparing by reference.
    ///
    /// `reaction` receives `(new, old, scope)`. On the first digest after
    /// registration it always runs, with `old` equal to `new`.
    ///
    /// Both closures live as long as the watcher. Capturing a [`Scope`] of
    /// this tree in them keeps the tree alive; use
    /// [`WeakScope`](crate::WeakScope) or the `scope` argument instead.
    pub fn watch<E, R>(&self, evaluator: E, reaction: R) -> WatchRemover
    where
        E: FnMut(&Scope) -> Value + Send + 'static,
        R: FnMut(&Value, &Value, &Scope) + Send + 'static,
    {
        self.watch_with(evaluator, reaction, CompareMode::Reference)
    }

    /// Watch by structure instead of identity.
    ///
    /// In-place mutations of a watched list or map count as changes.
    pub fn watch_deep<E, R>(&self, evaluator: E, reaction: R) -> WatchRemover
    where
        E: FnMut(&Scope) -> Value + Send + 'static,
        R: FnMut(&Value, &Value, &Scope) + Send + 'static,
    {
        self.watch_with(evaluator, reaction, CompareMode::Deep)
    }

    /// Register an evaluator with no reaction.
    ///
    /// The evaluator still runs on every pass and still keeps a digest dirty
    /// while its value changes.
    pub fn watch_only<E>(&self, evaluator: E) -> WatchRemover
    where
        E: FnMut(&Scope) -> Value + Send + 'static,
    {
        self.watch_with(evaluator, |_, _, _| {}, CompareMode::Reference)
    }

    /// Watch with an explicit [`CompareMode`].
    pub fn watch_with<E, R>(&self, evaluator: E, reaction: R, mode: CompareMode) -> WatchRemover
    where
        E: FnMut(&Scope) -> Value + Send + 'static,
        R: FnMut(&Value, &Value, &Scope) + Send + 'static,
    {
        if self.is_destroyed() {
            tracing::warn!(scope = %self.id(), "watch registered on a destroyed scope; ignoring");
            return WatchRemover::inert();
        }

        let metadata =
            WatcherMetadata::new(self.id(), mode, Box::new(evaluator), Box::new(reaction));
        let id = self.node.root.watchers.insert(metadata);
        self.register_watcher(id);
        WatchRemover {
            kind: RemoverKind::Watcher {
                scope: self.downgrade(),
                id,
            },
        }
    }

    /// Watch several values with one listener.
    ///
    /// Every evaluator is registered as its own watcher. When any of them
    /// changes, `listener` is queued with [`eval_async`](Scope::eval_async) and
    /// runs once for all changes found before it runs, receiving the latest
    /// value and the value before the last change of every member. On its
    /// first call both slices are the new values.
    ///
    /// With no evaluators the listener is called exactly once, on the next
    /// digest, unless the remover is used first.
    pub fn watch_group<L>(&self, evaluators: Vec<WatchFn>, listener: L) -> WatchRemover
    where
        L: FnMut(&[Value], &[Value], &Scope) + Send + 'static,
    {
        let active = Arc::new(AtomicBool::new(true));
        let listener = Arc::new(Mutex::new(listener));

        if evaluators.is_empty() {
            let should_call = active.clone();
            self.eval_async(move |scope| {
                if should_call.load(Ordering::Relaxed) {
                    let mut listener = listener.lock();
                    (*listener)(&[], &[], scope);
                }
            });
            return WatchRemover {
                kind: RemoverKind::Flag(active),
            };
        }

        let state = Arc::new(Mutex::new(GroupState {
            new: vec![Value::Undefined; evaluators.len()],
            old: vec![Value::Undefined; evaluators.len()],
            scheduled: false,
            first_run: true,
        }));

        let mut members: Vec<WatchRemover> = evaluators
            .into_iter()
            .enumerate()
            .map(|(index, evaluator)| {
                let state = state.clone();
                let listener = listener.clone();
                let active = active.clone();
                self.watch(evaluator, move |new, old, scope| {
                    let schedule = {
                        let mut state = state.lock();
                        state.new[index] = new.clone();
                        state.old[index] = old.clone();
                        !std::mem::replace(&mut state.scheduled, true)
                    };
                    if schedule {
                        let state = state.clone();
                        let listener = listener.clone();
                        let active = active.clone();
                        scope.eval_async(move |scope| {
                            run_group_listener(&state, &listener, &active, scope);
                        });
                    }
                })
            })
            .collect();
        members.push(WatchRemover {
            kind: RemoverKind::Flag(active),
        });

        WatchRemover {
            kind: RemoverKind::Group(members),
        }
    }

    /// Watch the shallow contents of a list or map.
    ///
    /// A change is detected when the value switches between being a list, a
    /// map and a scalar, when a list's length or any item changes, or when a
    /// map gains, loses or replaces an entry. Items are compared by reference
    /// with NaN equal to NaN, so reassigning an identical item is not a
    /// change. Scalars compare like [`watch`](Scope::watch).
    ///
    /// `listener` receives the new value and a shallow copy of the value seen
    /// by its previous call (the new value itself on the first call).
    pub fn watch_collection<E, L>(&self, mut evaluator: E, mut listener: L) -> WatchRemover
    where
        E: FnMut(&Scope) -> Value + Send + 'static,
        L: FnMut(&Value, &Value, &Scope) + Send + 'static,
    {
        let state = Arc::new(Mutex::new(CollectionState {
            new: Value::Undefined,
            snapshot: Snapshot::Scalar(Value::Undefined),
            changes: 0,
            very_old: None,
        }));

        let observed = state.clone();
        let count_changes = move |scope: &Scope| {
            let new = evaluator(scope);
            let mut state = observed.lock();
            state.record(new);
            Value::Number(state.changes as f64)
        };

        let on_change = move |_: &Value, _: &Value, scope: &Scope| {
            let (new, old) = {
                let state = state.lock();
                let old = state.very_old.clone().unwrap_or_else(|| state.new.clone());
                (state.new.clone(), old)
            };
            listener(&new, &old, scope);
            state.lock().very_old = Some(new.shallow_clone());
        };

        self.watch(count_changes, on_change)
    }
}

struct GroupState {
    new: Vec<Value>,
    old: Vec<Value>,
    scheduled: bool,
    first_run: bool,
}

fn run_group_listener<L>(
    state: &Mutex<GroupState>,
    listener: &Mutex<L>,
    active: &AtomicBool,
    scope: &Scope,
) where
    L: FnMut(&[Value], &[Value], &Scope),
{
    let (new, old) = {
        let mut state = state.lock();
        state.scheduled = false;
        let old = if std::mem::take(&mut state.first_run) {
            state.new.clone()
        } else {
            state.old.clone()
        };
        (state.new.clone(), old)
    };
    if active.load(Ordering::Relaxed) {
        let mut listener = listener.lock();
        (*listener)(&new, &old, scope);
    }
}

/// What a collection watcher last saw, kept detached from the live value.
enum Snapshot {
    Scalar(Value),
    List(Vec<Value>),
    Map(IndexMap<String, Value>),
}

struct CollectionState {
    new: Value,
    snapshot: Snapshot,
    /// Bumped on every detected change; this is the value the underlying
    /// watcher compares.
    changes: u64,
    very_old: Option<Value>,
}

impl CollectionState {
    fn record(&mut self, new: Value) {
        match &new {
            Value::List(list) => self.record_list(list.to_vec()),
            Value::Map(map) => self.record_map(map),
            scalar => {
                let unchanged = matches!(
                    &self.snapshot,
                    Snapshot::Scalar(old) if CompareMode::Reference.are_equal(scalar, old)
                );
                if !unchanged {
                    self.changes += 1;
                }
                self.snapshot = Snapshot::Scalar(scalar.clone());
            }
        }
        self.new = new;
    }

    fn record_list(&mut self, items: Vec<Value>) {
        if !matches!(self.snapshot, Snapshot::List(_)) {
            self.changes += 1;
            self.snapshot = Snapshot::List(Vec::new());
        }
        let Snapshot::List(old) = &mut self.snapshot else {
            return;
        };

        if old.len() != items.len() {
            self.changes += 1;
            old.resize(items.len(), Value::Undefined);
        }
        for (slot, item) in old.iter_mut().zip(items) {
            if !slot.identical(&item) {
                self.changes += 1;
                *slot = item;
            }
        }
    }

    fn record_map(&mut self, map: &Map) {
        if !matches!(self.snapshot, Snapshot::Map(_)) {
            self.changes += 1;
            self.snapshot = Snapshot::Map(IndexMap::new());
        }
        let Snapshot::Map(old) = &mut self.snapshot else {
            return;
        };

        let entries = map.entries();
        let new_len = entries.len();
        for (key, value) in entries {
            match old.get_mut(&key) {
                Some(slot) if slot.identical(&value) => {}
                Some(slot) => {
                    self.changes += 1;
                    *slot = value;
                }
                None => {
                    self.changes += 1;
                    old.insert(key, value);
                }
            }
        }

        if old.len() > new_len {
            self.changes += 1;
            old.retain(|key, _| map.contains_key(key));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn remover_stops_future_reactions() {
        let scope = Scope::new();
        scope.set("aValue", "abc");
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let remover = scope.watch(
            |scope| scope.get("aValue"),
            move |_, _, _| {
                count_clone.fetch_add(1, Ordering::Relaxed);
            },
        );

        scope.digest().unwrap();
        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert!(remover.is_active());

        scope.set("aValue", "def");
        remover.remove();
        remover.remove();
        assert!(!remover.is_active());

        scope.digest().unwrap();
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn watching_destroyed_scope_is_inert() {
        let scope = Scope::new().new_child();
        scope.destroy();

        let remover = scope.watch_only(|_| Value::Null);
        assert!(!remover.is_active());
        assert_eq!(scope.watcher_count(), 0);
        remover.remove();
    }

    #[test]
    fn deep_watch_sees_in_place_mutation() {
        let scope = Scope::new();
        scope.set("aValue", Value::list([1, 2, 3]));
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        scope.watch_deep(
            |scope| scope.get("aValue"),
            move |_, _, _| {
                count_clone.fetch_add(1, Ordering::Relaxed);
            },
        );

        scope.digest().unwrap();
        assert_eq!(count.load(Ordering::Relaxed), 1);

        scope.get("aValue").as_list().unwrap().push(4);
        scope.digest().unwrap();
        assert_eq!(count.load(Ordering::Relaxed), 2);
    }
}
