#![deny(missing_docs)]

//! Hierarchical dirty-checking scopes.
//!
//! A [`Scope`] is a mutable bag of named [`Value`]s arranged in a tree. Watchers
//! derive values from scopes; a digest re-evaluates them, compares against the
//! last seen value and runs reactions until nothing changes any more. Nothing
//! is tracked automatically: changes are found by looking.
//!
//! # Quick Start
//!
//! ```ignore
//! use scopewatch::{Scope, Value};
//!
//! let scope = Scope::new();
//! scope.set("first", "Jane");
//! scope.set("last", "Doe");
//!
//! scope.watch(
//!     |scope| {
//!         let first = scope.get("first");
//!         let last = scope.get("last");
//!         Value::from(format!("{} {}", first.as_str().unwrap_or(""), last.as_str().unwrap_or("")))
//!     },
//!     |new, _, scope| scope.set("full", new.clone()),
//! );
//!
//! scope.apply(|scope| scope.set("first", "John"))?;
//! assert_eq!(scope.get("full").as_str(), Some("John Doe"));
//! ```
//!
//! # Core Types
//!
//! - [`Scope`] - A node of the tree. Holds state, watchers and event listeners.
//! - [`Value`] - Dynamically typed state. [`List`] and [`Map`] are shared and
//!   mutable in place.
//! - [`CompareMode`] - Reference (identity) or deep (structural) comparison.
//! - [`ScopeError`] - The two ways a digest can fail.
//!
//! # Scopes
//!
//! ```ignore
//! let root = Scope::new();
//! let child = root.new_child();             // reads through to root
//! let isolated = root.new_isolated_child(); // own state only
//!
//! root.set("a", 1);
//! child.get("a");     // 1
//! isolated.get("a");  // Undefined
//!
//! child.destroy();    // detached, watchers gone
//! ```
//!
//! # Digests
//!
//! ```ignore
//! scope.digest()?;                        // this scope and its descendants
//! scope.apply(|scope| scope.set("a", 2))?; // run, then digest from the root
//! ```
//!
//! A digest fails with [`ScopeError::MaxIterationsExceeded`] when watchers keep
//! changing each other's values (see [`ScopeBuilder::max_iterations`]), and with
//! [`ScopeError::PhaseInProgress`] when started from inside another one.
//!
//! Panics in evaluators, reactions and queued tasks are caught, logged with
//! `tracing` and do not stop the digest.
//!
//! # Deferred Work
//!
//! ```ignore
//! scope.eval_async(|scope| { ... });  // later in this digest, or schedule one
//! scope.apply_async(|scope| { ... }); // batched into one later apply
//! scope.post_digest(|| { ... });      // after the next digest finishes
//! ```
//!
//! Timers go through the tree's [`Scheduler`]. [`EventLoop`] is the default;
//! [`ManualScheduler`] gives tests full control over time. A default loop does
//! not run by itself:
//!
//! ```ignore
//! let scope = Scope::new();
//! scope.apply_async(|scope| scope.set("a", 1));
//! if let Some(event_loop) = scope.event_loop() {
//!     event_loop.run_until_idle(); // flush + digest happen here
//! }
//! ```
//!
//! # Events
//!
//! ```ignore
//! let remover = root.on("changed", |event, args| { ... });
//! child.emit("changed", &[Value::from(1)]);  // child, then ancestors
//! root.broadcast("changed", &[]);            // root, then all descendants
//! remover.remove();
//! ```

// Internal modules
pub(crate) mod arena;
mod async_queue;
mod config;
mod digest;
mod error;
mod event;
mod executor;
mod hash;
mod phase;
mod root;
mod scope;
mod value;
mod watch;

// Core types
pub use scope::{Scope, ScopeId, WeakScope};
pub use value::{CompareMode, List, Map, Value};
pub use watch::{WatchFn, WatchRemover};

pub use event::{ListenerRemover, ScopeEvent};

// Configuration and errors
pub use config::{DEFAULT_MAX_ITERATIONS, ScopeBuilder, ScopeConfig};
pub use error::{Phase, ScopeError};

// Timer integration (for custom event loops)
pub use executor::{EventLoop, Macrotask, ManualScheduler, Scheduler, TimerHandle};
