use crate::executor::{EventLoop, Scheduler};
use crate::scope::Scope;
use std::fmt;
use std::sync::Arc;

/// Default number of passes a digest may run before giving up.
pub const DEFAULT_MAX_ITERATIONS: usize = 10;

/// Tree-wide settings, fixed when the root scope is built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScopeConfig {
    /// Passes a single digest may run while still dirty before failing with
    /// [`ScopeError::MaxIterationsExceeded`](crate::ScopeError::MaxIterationsExceeded).
    pub max_iterations: usize,
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }
}

/// Builder for configuring a root scope.
///
/// # Example
///
/// ```ignore
/// // Defaults: 10 iterations, a fresh EventLoop
/// let scope = Scope::builder().build();
///
/// // Deterministic timers for tests
/// let clock = Arc::new(ManualScheduler::new());
/// let scope = Scope::builder()
///     .max_iterations(20)
///     .scheduler(clock.clone())
///     .build();
/// ```
pub struct ScopeBuilder {
    config: ScopeConfig,
    scheduler: Option<Arc<dyn Scheduler>>,
}

impl Default for ScopeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeBuilder {
    /// Create a builder with default settings.
    ///
    /// Defaults:
    /// - `max_iterations`: 10
    /// - `scheduler`: a new [`EventLoop`]
    pub fn new() -> Self {
        Self {
            config: ScopeConfig::default(),
            scheduler: None,
        }
    }

    /// Set the digest iteration ceiling. Values below 1 are raised to 1.
    pub fn max_iterations(mut self, limit: usize) -> Self {
        self.config.max_iterations = limit.max(1);
        self
    }

    /// Set the scheduler used for deferred digests and coalesced flushes.
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Build the root scope.
    ///
    /// Without an explicit scheduler the tree gets its own [`EventLoop`],
    /// reachable through [`Scope::event_loop`].
    pub fn build(self) -> Scope {
        match self.scheduler {
            Some(scheduler) => Scope::new_root(self.config, scheduler, None),
            None => {
                let event_loop = Arc::new(EventLoop::new());
                Scope::new_root(self.config, event_loop.clone(), Some(event_loop))
            }
        }
    }
}

impl fmt::Debug for ScopeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeBuilder")
            .field("config", &self.config)
            .field("custom_scheduler", &self.scheduler.is_some())
            .finish()
    }
}
