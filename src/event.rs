//! Events along the scope tree.
//!
//! [`Scope::emit`] travels upwards from a scope through its ancestors,
//! [`Scope::broadcast`] travels downwards through its whole subtree (isolated
//! children included). Listeners are registered per scope and event name with
//! [`Scope::on`]:
//!
//! ```ignore
//! let child = scope.new_child();
//! scope.on("saved", |event, args| {
//!     println!("{} from {} with {args:?}", event.name(), event.target_scope().id());
//! });
//! child.emit("saved", &[Value::from(42)]);
//! ```
//!
//! Unlike watcher callbacks, listeners are not isolated: a panicking listener
//! unwinds into the `emit`/`broadcast` call.

use crate::scope::{Scope, ScopeNode};
use crate::value::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// A registered event listener.
pub(crate) type Listener = Arc<dyn Fn(&mut ScopeEvent, &[Value]) + Send + Sync>;

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub(crate) struct ListenerId(u64);

/// One entry in a scope's listener list. Removed listeners leave a `None`.
pub(crate) type ListenerSlot = (ListenerId, Listener);

/// The event object handed to every listener of one `emit` or `broadcast`.
pub struct ScopeEvent {
    name: String,
    target_scope: Scope,
    current_scope: Option<Scope>,
    default_prevented: bool,
    propagation_stopped: bool,
    stoppable: bool,
}

impl ScopeEvent {
    fn new(name: &str, target_scope: Scope, stoppable: bool) -> Self {
        Self {
            name: name.to_owned(),
            target_scope,
            current_scope: None,
            default_prevented: false,
            propagation_stopped: false,
            stoppable,
        }
    }

    /// Name the event was fired with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Scope `emit` or `broadcast` was called on.
    pub fn target_scope(&self) -> &Scope {
        &self.target_scope
    }

    /// Scope whose listeners are running. `None` once dispatch has finished.
    pub fn current_scope(&self) -> Option<&Scope> {
        self.current_scope.as_ref()
    }

    /// Stop an emitted event from reaching further ancestors.
    ///
    /// Listeners on the current scope still run. Has no effect on broadcasts.
    pub fn stop_propagation(&mut self) {
        if self.stoppable {
            self.propagation_stopped = true;
        }
    }

    /// True if a listener stopped propagation.
    pub fn is_propagation_stopped(&self) -> bool {
        self.propagation_stopped
    }

    /// Flag the event; the flag is only read by whoever fired it.
    pub fn prevent_default(&mut self) {
        self.default_prevented = true;
    }

    /// True if any listener called [`prevent_default`](Self::prevent_default).
    pub fn is_default_prevented(&self) -> bool {
        self.default_prevented
    }
}

impl fmt::Debug for ScopeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeEvent")
            .field("name", &self.name)
            .field("target_scope", &self.target_scope.id())
            .field("current_scope", &self.current_scope.as_ref().map(Scope::id))
            .field("default_prevented", &self.default_prevented)
            .field("propagation_stopped", &self.propagation_stopped)
            .finish()
    }
}

/// Unregisters a listener added with [`Scope::on`]. Idempotent.
#[derive(Clone)]
pub struct ListenerRemover {
    scope: Weak<ScopeNode>,
    name: String,
    id: ListenerId,
}

impl ListenerRemover {
    /// Remove the listener.
    ///
    /// Safe to call from inside a listener while the event is being
    /// dispatched; no other listener is skipped as a result.
    pub fn remove(&self) {
        let Some(scope) = Scope::upgrade(&self.scope) else {
            return;
        };
        let removed = {
            let mut listeners = scope.node.listeners.lock();
            listeners
                .get_mut(&self.name)
                .and_then(|slots| {
                    slots
                        .iter_mut()
                        .find(|slot| slot.as_ref().is_some_and(|(id, _)| *id == self.id))
                })
                .and_then(Option::take)
        };
        // Dropped outside the lock: the closure may own scopes.
        drop(removed);
    }
}

impl fmt::Debug for ListenerRemover {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRemover")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Scope {
    /// Listen for events named `name` reaching this scope.
    ///
    /// The listener receives the event and the extra arguments passed to
    /// `emit` or `broadcast`. It is kept until removed; capture a
    /// [`WeakScope`](crate::WeakScope) rather than a [`Scope`] of the same
    /// tree, which would keep the tree alive.
    pub fn on<F>(&self, name: &str, listener: F) -> ListenerRemover
    where
        F: Fn(&mut ScopeEvent, &[Value]) + Send + Sync + 'static,
    {
        let id = ListenerId(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed));
        self.node
            .listeners
            .lock()
            .entry(name.to_owned())
            .or_default()
            .push(Some((id, Arc::new(listener))));
        ListenerRemover {
            scope: self.downgrade(),
            name: name.to_owned(),
            id,
        }
    }

    /// Fire `name` on this scope, then on each ancestor up to the root.
    ///
    /// Stops after the scope on which a listener called
    /// [`ScopeEvent::stop_propagation`].
    pub fn emit(&self, name: &str, args: &[Value]) -> ScopeEvent {
        let mut event = ScopeEvent::new(name, self.clone(), true);
        let mut next = Some(self.clone());
        while let Some(scope) = next {
            event.current_scope = Some(scope.clone());
            scope.fire(&mut event, args);
            if event.propagation_stopped {
                break;
            }
            next = scope.parent();
        }
        event.current_scope = None;
        event
    }

    /// Fire `name` on this scope and every descendant, parents first.
    pub fn broadcast(&self, name: &str, args: &[Value]) -> ScopeEvent {
        let mut event = ScopeEvent::new(name, self.clone(), false);
        self.every_scope(&mut |scope| {
            event.current_scope = Some(scope.clone());
            scope.fire(&mut event, args);
            true
        });
        event.current_scope = None;
        event
    }

    /// Run this scope's listeners for `event`, in registration order.
    ///
    /// Tombstones of removed listeners are dropped as they are reached, so a
    /// listener removing itself or another listener never causes a skip.
    fn fire(&self, event: &mut ScopeEvent, args: &[Value]) {
        let mut index = 0;
        loop {
            let listener = {
                let mut listeners = self.node.listeners.lock();
                let Some(slots) = listeners.get_mut(event.name.as_str()) else {
                    return;
                };
                match slots.get(index) {
                    None => return,
                    Some(None) => {
                        slots.remove(index);
                        continue;
                    }
                    Some(Some((_, listener))) => listener.clone(),
                }
            };
            listener(&mut *event, args);
            index += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn listeners_are_registered_per_scope() {
        let scope = Scope::new();
        let child = scope.new_child();
        let isolated = scope.new_isolated_child();

        scope.on("someEvent", |_, _| {});
        child.on("someEvent", |_, _| {});
        isolated.on("someEvent", |_, _| {});

        for current in [&scope, &child, &isolated] {
            assert_eq!(current.node.listeners.lock()["someEvent"].len(), 1);
        }
    }

    #[test]
    fn listeners_receive_event_and_arguments() {
        for emit in [true, false] {
            let scope = Scope::new();
            let seen = Arc::new(Mutex::new(Vec::new()));
            let seen_clone = seen.clone();
            scope.on("someEvent", move |event, args| {
                seen_clone.lock().push((event.name().to_owned(), args.to_vec()));
            });

            let args = [Value::from("and"), Value::list(["additional"])];
            if emit {
                scope.emit("someEvent", &args);
            } else {
                scope.broadcast("someEvent", &args);
            }

            assert_eq!(*seen.lock(), [("someEvent".to_owned(), args.to_vec())]);
        }
    }

    #[test]
    fn other_event_names_are_ignored() {
        let scope = Scope::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        scope.on("someEvent", move |_, _| {
            count_clone.fetch_add(1, Ordering::Relaxed);
        });

        scope.emit("someOtherEvent", &[]);
        scope.broadcast("someOtherEvent", &[]);
        assert_eq!(count.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn emit_travels_up_and_sets_scopes() {
        let parent = Scope::new();
        let child = parent.new_child();
        let scopes = Arc::new(Mutex::new(Vec::new()));

        for scope in [&parent, &child] {
            let scopes = scopes.clone();
            scope.on("someEvent", move |event, _| {
                let current = event.current_scope().map(Scope::id);
                scopes.lock().push((event.target_scope().id(), current));
            });
        }

        let event = child.emit("someEvent", &[]);

        assert_eq!(
            *scopes.lock(),
            [
                (child.id(), Some(child.id())),
                (child.id(), Some(parent.id()))
            ]
        );
        assert!(event.current_scope().is_none());
    }

    #[test]
    fn stop_propagation_only_affects_emit() {
        let parent = Scope::new();
        let child = parent.new_child();
        let parent_calls = Arc::new(AtomicUsize::new(0));
        let child_calls = Arc::new(AtomicUsize::new(0));

        let calls = parent_calls.clone();
        parent.on("someEvent", move |_, _| {
            calls.fetch_add(1, Ordering::Relaxed);
        });
        child.on("someEvent", |event, _| event.stop_propagation());
        let calls = child_calls.clone();
        child.on("someEvent", move |_, _| {
            calls.fetch_add(1, Ordering::Relaxed);
        });

        let event = child.emit("someEvent", &[]);
        assert!(event.is_propagation_stopped());
        assert_eq!(parent_calls.load(Ordering::Relaxed), 0);
        assert_eq!(child_calls.load(Ordering::Relaxed), 1);

        parent.on("someEvent", |event, _| event.stop_propagation());
        let event = parent.broadcast("someEvent", &[]);
        assert!(!event.is_propagation_stopped());
        assert_eq!(child_calls.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn prevent_default_is_reported() {
        let scope = Scope::new();
        scope.on("someEvent", |event, _| event.prevent_default());

        assert!(scope.emit("someEvent", &[]).is_default_prevented());
        assert!(scope.broadcast("someEvent", &[]).is_default_prevented());
    }

    #[test]
    fn removed_listener_is_not_called() {
        let scope = Scope::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let remover = scope.on("someEvent", move |_, _| {
            count_clone.fetch_add(1, Ordering::Relaxed);
        });

        remover.remove();
        remover.remove();
        scope.emit("someEvent", &[]);
        assert_eq!(count.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn self_removal_does_not_skip_next_listener() {
        let scope = Scope::new();
        let next_calls = Arc::new(AtomicUsize::new(0));

        let remover: Arc<Mutex<Option<ListenerRemover>>> = Arc::new(Mutex::new(None));
        let own = remover.clone();
        *remover.lock() = Some(scope.on("someEvent", move |_, _| {
            if let Some(remover) = own.lock().as_ref() {
                remover.remove();
            }
        }));
        let calls = next_calls.clone();
        scope.on("someEvent", move |_, _| {
            calls.fetch_add(1, Ordering::Relaxed);
        });

        scope.emit("someEvent", &[]);
        assert_eq!(next_calls.load(Ordering::Relaxed), 1);

        scope.emit("someEvent", &[]);
        assert_eq!(next_calls.load(Ordering::Relaxed), 2);
        assert_eq!(scope.node.listeners.lock()["someEvent"].len(), 1);
    }

    #[test]
    fn listener_panic_reaches_caller() {
        let scope = Scope::new();
        scope.on("someEvent", |_, _| panic!("listener failed"));

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            scope.emit("someEvent", &[]);
        }));
        assert!(outcome.is_err());
    }
}
