use crate::error::{Phase, ScopeError};
use crate::scope::Scope;
use std::panic::{self, AssertUnwindSafe};

impl Scope {
    /// Run `body` against this scope and return its value.
    ///
    /// No phase is entered and no digest runs.
    pub fn eval<R>(&self, body: impl FnOnce(&Scope) -> R) -> R {
        body(self)
    }

    /// Run `body` against this scope, then digest the whole tree.
    ///
    /// The tree is in [`Phase::Apply`] while `body` runs. The digest happens
    /// even if `body` panics; the panic is resumed once it has finished.
    ///
    /// ```ignore
    /// scope.apply(|scope| scope.set("aValue", "someOtherValue"))?;
    /// ```
    ///
    /// # Errors
    ///
    /// [`ScopeError::PhaseInProgress`] if a digest or apply is already running
    /// (`body` is not called), otherwise whatever the root digest returns.
    pub fn apply<R>(&self, body: impl FnOnce(&Scope) -> R) -> Result<R, ScopeError> {
        let root = self.node.root.clone();
        let phase = root.begin_phase(Phase::Apply)?;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| body(self)));
        phase.release();

        let digest = self.root().digest();
        match outcome {
            Ok(value) => digest.map(|()| value),
            Err(payload) => panic::resume_unwind(payload),
        }
    }
}
