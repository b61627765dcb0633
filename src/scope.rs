use crate::arena::WatcherId;
use crate::config::{ScopeBuilder, ScopeConfig};
use crate::error::Phase;
use crate::event::ListenerSlot;
use crate::executor::{EventLoop, Scheduler};
use crate::hash::FastHashMap;
use crate::root::Root;
use crate::value::Value;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a scope.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, PartialOrd, Ord)]
pub struct ScopeId(u64);

impl ScopeId {
    fn next() -> Self {
        Self(NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[cfg(test)]
    pub(crate) fn for_tests(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scope#{}", self.0)
    }
}

/// Storage behind a [`Scope`] handle.
pub(crate) struct ScopeNode {
    pub(crate) id: ScopeId,
    pub(crate) root: Arc<Root>,
    isolated: bool,
    /// Structural parent: digests and `emit` travel along this edge.
    parent: Option<Weak<ScopeNode>>,
    /// Lookups that miss the own state continue here. None for roots and
    /// isolated scopes.
    delegate: Option<Weak<ScopeNode>>,
    state: RwLock<IndexMap<String, Value>>,
    pub(crate) children: RwLock<Vec<Scope>>,
    /// Registration order; removed watchers leave a `None` tombstone so that
    /// indices stay stable while a digest walks the registry.
    pub(crate) watchers: Mutex<Vec<Option<WatcherId>>>,
    pub(crate) listeners: Mutex<FastHashMap<String, Vec<Option<ListenerSlot>>>>,
    destroyed: AtomicBool,
}

/// Handle to a node of a scope tree.
///
/// Cloning the handle is cheap and yields the same node. A tree stays alive
/// as long as a handle to its root exists; children are owned by their
/// parents.
///
/// # State
/// Each scope owns an ordered bag of named [`Value`]s. A normal child reads
/// through to the scope it was created from when a key is missing locally,
/// while writes always land on the scope they are issued against:
///
/// ```ignore
/// let parent = Scope::new();
/// let child = parent.new_child();
///
/// parent.set("name", "Joe");
/// assert_eq!(child.get("name").as_str(), Some("Joe"));
///
/// child.set("name", "Jill");                              // shadows
/// assert_eq!(parent.get("name").as_str(), Some("Joe"));  // parent untouched
/// ```
///
/// An isolated child starts empty and never reads through, but it still takes
/// part in its tree's digests, async queues and post-digest hooks.
///
/// # Callbacks
/// Watchers, listeners and queued tasks are stored in the tree. A callback
/// that captures a `Scope` of the same tree keeps that tree alive forever;
/// capture a [`WeakScope`] instead, or use the scope argument the callback
/// is given.
#[derive(Clone)]
pub struct Scope {
    pub(crate) node: Arc<ScopeNode>,
}

impl Scope {
    /// Create a root scope with default settings.
    pub fn new() -> Self {
        ScopeBuilder::new().build()
    }

    /// Start configuring a root scope.
    pub fn builder() -> ScopeBuilder {
        ScopeBuilder::new()
    }

    pub(crate) fn new_root(
        config: ScopeConfig,
        scheduler: Arc<dyn Scheduler>,
        event_loop: Option<Arc<EventLoop>>,
    ) -> Self {
        let root = Arc::new(Root::new(config, scheduler, event_loop));
        let scope = Self::from_parts(root, false, None, None);
        tracing::trace!(scope = %scope.id(), "root scope created");
        scope
    }

    fn from_parts(
        root: Arc<Root>,
        isolated: bool,
        parent: Option<Weak<ScopeNode>>,
        delegate: Option<Weak<ScopeNode>>,
    ) -> Self {
        Self {
            node: Arc::new(ScopeNode {
                id: ScopeId::next(),
                root,
                isolated,
                parent,
                delegate,
                state: RwLock::new(IndexMap::new()),
                children: RwLock::new(Vec::new()),
                watchers: Mutex::new(Vec::new()),
                listeners: Mutex::new(FastHashMap::default()),
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    /// A handle that does not keep this scope alive.
    pub fn weak(&self) -> WeakScope {
        WeakScope(self.downgrade())
    }

    pub(crate) fn downgrade(&self) -> Weak<ScopeNode> {
        Arc::downgrade(&self.node)
    }

    pub(crate) fn upgrade(node: &Weak<ScopeNode>) -> Option<Scope> {
        node.upgrade().map(|node| Scope { node })
    }

    // =========================================================================
    // Tree structure
    // =========================================================================

    /// Create a child that reads through to this scope's state.
    pub fn new_child(&self) -> Scope {
        self.new_child_with(false, None)
    }

    /// Create a child with its own, empty state.
    pub fn new_isolated_child(&self) -> Scope {
        self.new_child_with(true, None)
    }

    /// Create a child, optionally isolated, optionally attached under a
    /// different structural parent.
    ///
    /// Lookups of a non-isolated child read through to `self` even when
    /// `parent` is given. The child joins `parent`'s tree: it is digested,
    /// receives events and shares queues with `parent`'s root.
    pub fn new_child_with(&self, isolated: bool, parent: Option<&Scope>) -> Scope {
        let parent = parent.unwrap_or(self);
        let child = Self::from_parts(
            parent.node.root.clone(),
            isolated,
            Some(parent.downgrade()),
            (!isolated).then(|| self.downgrade()),
        );
        parent.node.children.write().push(child.clone());
        tracing::trace!(
            scope = %child.id(),
            parent = %parent.id(),
            isolated,
            "child scope created"
        );
        child
    }

    /// Detach this scope from the tree.
    ///
    /// The scope is removed from its parent's children and all of its watchers
    /// are deregistered, so later digests never see it again. Handles stay
    /// valid, but the scope no longer takes part in its tree.
    pub fn destroy(&self) {
        if let Some(parent) = self.parent() {
            parent.node.children.write().retain(|child| !child.ptr_eq(self));
        }

        let registry = std::mem::take(&mut *self.node.watchers.lock());
        let root = &self.node.root;
        for id in registry.into_iter().flatten() {
            root.watchers.remove(id);
        }
        root.set_last_dirty_watcher(None);

        self.node.destroyed.store(true, Ordering::Release);
        tracing::trace!(scope = %self.id(), "scope destroyed");
    }

    /// True once [`destroy`](Scope::destroy) has been called.
    pub fn is_destroyed(&self) -> bool {
        self.node.destroyed.load(Ordering::Acquire)
    }

    /// This scope's identity.
    pub fn id(&self) -> ScopeId {
        self.node.id
    }

    /// True if both handles refer to the same scope.
    pub fn ptr_eq(&self, other: &Scope) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
    }

    /// Structural parent, if any.
    pub fn parent(&self) -> Option<Scope> {
        self.node.parent.as_ref().and_then(Scope::upgrade)
    }

    /// Topmost reachable ancestor (the scope itself for a root).
    pub fn root(&self) -> Scope {
        let mut current = self.clone();
        while let Some(parent) = current.parent() {
            current = parent;
        }
        current
    }

    /// True if this scope has no structural parent.
    pub fn is_root(&self) -> bool {
        self.node.parent.is_none()
    }

    /// True if this scope does not read through to another scope's state.
    pub fn is_isolated(&self) -> bool {
        self.node.isolated
    }

    /// Current children, in creation order.
    pub fn children(&self) -> Vec<Scope> {
        self.node.children.read().clone()
    }

    /// Tree-wide settings.
    pub fn config(&self) -> &ScopeConfig {
        &self.node.root.config
    }

    /// The event loop the builder created for this tree.
    ///
    /// Present only when no scheduler was passed to the builder. Deferred
    /// digests and coalesced flushes wait in this loop until it is driven with
    /// [`EventLoop::run_due`] or [`EventLoop::run_until_idle`].
    pub fn event_loop(&self) -> Option<Arc<EventLoop>> {
        self.node.root.event_loop.clone()
    }

    /// The phase the tree is currently in, if any.
    pub fn phase(&self) -> Option<Phase> {
        self.node.root.phase()
    }

    /// Number of watchers registered on this scope (not its children).
    pub fn watcher_count(&self) -> usize {
        self.node.watchers.lock().iter().flatten().count()
    }

    /// Visit this scope and its descendants in preorder, parents first.
    ///
    /// Stops as soon as `f` returns false; the children of the scope for which
    /// it returned false are not visited. Returns false if the walk stopped
    /// early.
    pub(crate) fn every_scope(&self, f: &mut dyn FnMut(&Scope) -> bool) -> bool {
        if !f(self) {
            return false;
        }
        let children = self.children();
        children.iter().all(|child| child.every_scope(f))
    }

    pub(crate) fn register_watcher(&self, id: WatcherId) {
        self.node.watchers.lock().push(Some(id));
        // A new watcher has never been evaluated, so the current lap cannot end
        // before reaching it.
        self.node.root.set_last_dirty_watcher(None);
    }

    /// Deregister `id` from this scope. Idempotent.
    pub(crate) fn remove_watcher(&self, id: WatcherId) {
        let found = {
            let mut registry = self.node.watchers.lock();
            match registry.iter_mut().find(|slot| **slot == Some(id)) {
                Some(slot) => {
                    *slot = None;
                    true
                }
                None => false,
            }
        };
        if found {
            let root = &self.node.root;
            root.watchers.remove(id);
            root.set_last_dirty_watcher(None);
        }
    }

    /// Drop the tombstones left by removed watchers.
    pub(crate) fn compact_watchers(&self) {
        let mut registry = self.node.watchers.lock();
        if registry.iter().any(Option::is_none) {
            cov_mark::hit!(watcher_tombstones_compacted);
            registry.retain(Option::is_some);
        }
    }

    // =========================================================================
    // State
    // =========================================================================

    /// Look up `key` here, then along the read-through chain.
    ///
    /// Returns [`Value::Undefined`] if no scope in the chain has the key.
    pub fn get(&self, key: &str) -> Value {
        self.lookup(key).unwrap_or_default()
    }

    fn lookup(&self, key: &str) -> Option<Value> {
        let mut node = Some(self.node.clone());
        while let Some(current) = node {
            if let Some(value) = current.state.read().get(key) {
                return Some(value.clone());
            }
            node = current.delegate.as_ref().and_then(Weak::upgrade);
        }
        None
    }

    /// Look up `key` on this scope only.
    pub fn get_own(&self, key: &str) -> Option<Value> {
        self.node.state.read().get(key).cloned()
    }

    /// True if `key` resolves here or along the read-through chain.
    pub fn has(&self, key: &str) -> bool {
        self.lookup(key).is_some()
    }

    /// True if `key` is set on this scope itself.
    pub fn has_own(&self, key: &str) -> bool {
        self.node.state.read().contains_key(key)
    }

    /// Set `key` on this scope, shadowing any inherited value.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.node.state.write().insert(key.into(), value.into());
    }

    /// Remove `key` from this scope, uncovering any inherited value.
    pub fn remove(&self, key: &str) -> Option<Value> {
        self.node.state.write().shift_remove(key)
    }

    /// Own keys in insertion order.
    pub fn keys(&self) -> Vec<String> {
        self.node.state.read().keys().cloned().collect()
    }

    /// Apply `f` to the number stored under `key` (own or inherited) and store
    /// the result on this scope. Missing or non-numeric values count as 0.
    pub fn update_number(&self, key: &str, f: impl FnOnce(f64) -> f64) -> f64 {
        let current = self.get(key).as_f64().unwrap_or(0.0);
        let next = f(current);
        self.set(key, next);
        next
    }
}

/// Non-owning handle to a scope, for capturing in callbacks.
///
/// ```ignore
/// let target = root.weak();
/// child.on("saved", move |_, _| {
///     if let Some(root) = target.upgrade() {
///         root.set("dirty", false);
///     }
/// });
/// ```
#[derive(Clone)]
pub struct WeakScope(Weak<ScopeNode>);

impl WeakScope {
    /// The scope, if any handle to it (or to an owning ancestor) still exists.
    pub fn upgrade(&self) -> Option<Scope> {
        Scope::upgrade(&self.0)
    }
}

impl fmt::Debug for WeakScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakScope")
            .field("alive", &(self.0.strong_count() > 0))
            .finish()
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Scope {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Scope {}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.id())
            .field("isolated", &self.is_isolated())
            .field("destroyed", &self.is_destroyed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::CompareMode;

    #[test]
    fn child_reads_through_to_parent() {
        let parent = Scope::new();
        let child = parent.new_child();

        parent.set("aValue", Value::list([1, 2, 3]));
        assert_eq!(child.get("aValue"), Value::list([1, 2, 3]));
        assert!(child.has("aValue"));
        assert!(!child.has_own("aValue"));
    }

    #[test]
    fn weak_handle_does_not_keep_scope_alive() {
        let scope = Scope::new();
        let weak = scope.weak();
        assert!(weak.upgrade().unwrap().ptr_eq(&scope));

        drop(scope);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn parent_does_not_see_child_state() {
        let parent = Scope::new();
        let child = parent.new_child();

        child.set("aValue", 1);
        assert!(parent.get("aValue").is_undefined());
    }

    #[test]
    fn values_defined_later_on_parent_are_visible() {
        let parent = Scope::new();
        let child = parent.new_child();

        parent.set("aValue", 1);
        assert_eq!(child.get("aValue").as_f64(), Some(1.0));
    }

    #[test]
    fn child_mutates_shared_container_in_place() {
        let parent = Scope::new();
        let child = parent.new_child();

        parent.set("aValue", Value::list([1, 2, 3]));
        child.get("aValue").as_list().unwrap().push(4);

        assert_eq!(parent.get("aValue"), Value::list([1, 2, 3, 4]));
    }

    #[test]
    fn assignment_shadows_parent() {
        let parent = Scope::new();
        let child = parent.new_child();

        parent.set("name", "Joe");
        child.set("name", "Jill");

        assert_eq!(child.get("name").as_str(), Some("Jill"));
        assert_eq!(parent.get("name").as_str(), Some("Joe"));

        child.remove("name");
        assert_eq!(child.get("name").as_str(), Some("Joe"));
    }

    #[test]
    fn nested_member_writes_do_not_shadow() {
        let parent = Scope::new();
        let child = parent.new_child();

        parent.set("user", Value::map([("name", "Joe")]));
        child.get("user").as_map().unwrap().insert("name", "Jill");

        let user = parent.get("user");
        assert_eq!(user.as_map().unwrap().get("name").unwrap().as_str(), Some("Jill"));
    }

    #[test]
    fn isolated_child_does_not_read_through() {
        let parent = Scope::new();
        let child = parent.new_isolated_child();

        parent.set("aValue", "abc");
        assert!(child.get("aValue").is_undefined());
        assert!(child.is_isolated());
        assert!(Arc::ptr_eq(&child.node.root, &parent.node.root));
    }

    #[test]
    fn keeps_a_record_of_children() {
        let parent = Scope::new();
        let child1 = parent.new_child();
        let child2 = parent.new_child();
        let grandchild = child2.new_child();

        assert_eq!(parent.children(), vec![child1.clone(), child2.clone()]);
        assert_eq!(child2.children(), vec![grandchild.clone()]);
        assert!(child1.children().is_empty());
        assert_eq!(grandchild.root(), parent);
        assert_eq!(grandchild.parent(), Some(child2));
    }

    #[test]
    fn alternate_parent_owns_child_but_not_lookups() {
        let prototype_parent = Scope::new();
        let hierarchy_parent = Scope::new();
        let child = prototype_parent.new_child_with(false, Some(&hierarchy_parent));

        prototype_parent.set("value", 1);
        assert_eq!(child.get("value").as_f64(), Some(1.0));

        assert_eq!(child.parent(), Some(hierarchy_parent.clone()));
        assert!(prototype_parent.children().is_empty());
        assert_eq!(hierarchy_parent.children(), vec![child.clone()]);
        assert!(Arc::ptr_eq(&child.node.root, &hierarchy_parent.node.root));
    }

    #[test]
    fn destroy_detaches_and_clears_watchers() {
        let parent = Scope::new();
        let child = parent.new_child();
        let remover = child.watch(|scope: &Scope| scope.get("x"), |_, _, _| {});
        assert_eq!(child.watcher_count(), 1);

        child.destroy();
        child.destroy();

        assert!(child.is_destroyed());
        assert!(parent.children().is_empty());
        assert_eq!(child.watcher_count(), 0);
        assert_eq!(parent.node.root.watchers.len(), 0);
        remover.remove();
    }

    #[test]
    fn destroying_root_only_clears_watchers() {
        let root = Scope::new();
        let child = root.new_child();
        root.watch_with(|scope: &Scope| scope.get("x"), |_, _, _| {}, CompareMode::Deep);

        root.destroy();

        assert_eq!(root.watcher_count(), 0);
        assert_eq!(root.children(), vec![child]);
    }

    #[test]
    fn update_number_counts_from_zero() {
        let scope = Scope::new();
        assert_eq!(scope.update_number("counter", |n| n + 1.0), 1.0);
        assert_eq!(scope.update_number("counter", |n| n + 1.0), 2.0);
    }

    #[test]
    fn keys_keep_insertion_order() {
        let scope = Scope::new();
        scope.set("b", 1);
        scope.set("a", 2);
        scope.set("b", 3);
        assert_eq!(scope.keys(), ["b", "a"]);
    }
}
