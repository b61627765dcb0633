use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use thiserror::Error;

/// The convergence phase a tree is currently executing.
///
/// Only one phase may be active per tree. Starting a second one fails with
/// [`ScopeError::PhaseInProgress`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    /// A digest cycle is walking the tree.
    Cycle,
    /// An `apply` body is running (a digest follows it).
    Apply,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Cycle => f.write_str("digest"),
            Phase::Apply => f.write_str("apply"),
        }
    }
}

/// Fatal failures of the convergence engine.
///
/// Observer failures (panicking watchers, reactions and queued tasks) are never
/// reported through this type; they are logged and the pass continues.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScopeError {
    /// The digest was still dirty after the configured number of passes.
    #[error("Max iterations exceeded: still dirty after {limit} passes")]
    MaxIterationsExceeded {
        /// The iteration ceiling that was reached.
        limit: usize,
    },

    /// A cycle or apply was started while another one was running.
    #[error("{0} already in progress")]
    PhaseInProgress(Phase),
}

/// Run an observer callback, logging a panic instead of propagating it.
///
/// Returns None if `f` panicked. `origin` names the kind of callback in the
/// log record ("watch function", "listener", "eval_async task", ...).
pub(crate) fn isolate<R>(origin: &'static str, f: impl FnOnce() -> R) -> Option<R> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(payload) => {
            tracing::error!(
                origin,
                reason = panic_message(payload.as_ref()),
                "observer failed; continuing"
            );
            None
        }
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "<non-string panic payload>"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_error_names_the_running_phase() {
        let err = ScopeError::PhaseInProgress(Phase::Cycle);
        assert_eq!(err.to_string(), "digest already in progress");

        let err = ScopeError::PhaseInProgress(Phase::Apply);
        assert_eq!(err.to_string(), "apply already in progress");
    }

    #[test]
    fn isolate_swallows_panics() {
        assert_eq!(isolate("test", || 7), Some(7));
        assert_eq!(isolate("test", || -> i32 { panic!("boom") }), None);
    }

    #[test]
    fn panic_message_reads_both_payload_kinds() {
        let literal = panic::catch_unwind(|| panic!("literal")).unwrap_err();
        assert_eq!(panic_message(literal.as_ref()), "literal");

        let formatted = panic::catch_unwind(|| panic!("value {}", 3)).unwrap_err();
        assert_eq!(panic_message(formatted.as_ref()), "value 3");
    }

    #[test]
    fn iteration_error_mentions_limit() {
        let err = ScopeError::MaxIterationsExceeded { limit: 10 };
        let message = err.to_string();
        assert!(message.starts_with("Max iterations exceeded"));
        assert!(message.contains("10"));
    }
}
