// Deferred work queued on a tree's Root
//
// Three queues, all FIFO, all drained one entry at a time with the lock
// released in between so a task may enqueue more work:
//
// - in-cycle (eval_async): drained at the start of every digest pass
// - coalesced (apply_async): flushed together by one scheduled macrotask, or
//   pulled into whichever digest starts first
// - post-cycle (post_digest): drained once a digest has finished
//
// Macrotasks handed to the scheduler only hold a Weak reference to the scope
// that scheduled them; if the tree is gone by the time they run, they do
// nothing.

use crate::error::isolate;
use crate::root::AsyncTask;
use crate::scope::{Scope, ScopeNode};
use std::sync::Weak;
use std::time::Duration;

impl Scope {
    /// Queue `body` to run against this scope during a digest.
    ///
    /// The task runs at the start of the next pass of a digest that is already
    /// running, or of the next digest. If nothing is running, a digest of the
    /// root is scheduled on the tree's [`Scheduler`](crate::Scheduler).
    /// Panics in `body` are logged and do not stop the digest.
    pub fn eval_async(&self, body: impl FnOnce(&Scope) + Send + 'static) {
        let root = &self.node.root;
        if root.phase().is_none() && !root.has_pending_async() {
            let weak = self.downgrade();
            root.scheduler.schedule(
                Duration::ZERO,
                Box::new(move || digest_pending_async(&weak)),
            );
        }
        root.async_queue.lock().push_back(AsyncTask {
            scope: self.clone(),
            body: Box::new(body),
        });
    }

    /// Queue `body` to run in a batch with other coalesced tasks.
    ///
    /// The first task of a batch schedules one macrotask that runs the whole
    /// batch inside [`apply`](Scope::apply). A digest that starts before then
    /// runs the batch itself and cancels the macrotask.
    pub fn apply_async(&self, body: impl FnOnce(&Scope) + Send + 'static) {
        let root = &self.node.root;
        let scope = self.clone();
        root.apply_async_queue
            .lock()
            .push_back(Box::new(move || scope.eval(body)));

        let mut timer = root.apply_async_timer.lock();
        if timer.is_none() {
            let weak = self.downgrade();
            *timer = Some(root.scheduler.schedule(
                Duration::ZERO,
                Box::new(move || flush_on_timer(&weak)),
            ));
        }
    }

    /// Run every queued coalesced task now and forget the pending flush.
    ///
    /// Normally called by the scheduled macrotask; calling it directly does
    /// not cancel that macrotask, which then finds an empty batch.
    pub fn flush_apply_async(&self) {
        self.drain_apply_async();
        self.node.root.apply_async_timer.lock().take();
    }

    /// Run `hook` once the current (or next) digest has finished.
    ///
    /// Hooks run after the phase has been cleared, in registration order, and
    /// also run when the digest gave up after too many iterations.
    pub fn post_digest(&self, hook: impl FnOnce() + Send + 'static) {
        self.node
            .root
            .post_digest_queue
            .lock()
            .push_back(Box::new(hook));
    }

    pub(crate) fn drain_async_queue(&self) {
        let root = &self.node.root;
        loop {
            let task = root.async_queue.lock().pop_front();
            let Some(AsyncTask { scope, body }) = task else {
                break;
            };
            isolate("eval_async task", || body(&scope));
        }
    }

    pub(crate) fn drain_apply_async(&self) {
        let root = &self.node.root;
        let mut flushed = 0usize;
        loop {
            let job = root.apply_async_queue.lock().pop_front();
            let Some(job) = job else {
                break;
            };
            isolate("apply_async task", job);
            flushed += 1;
        }
        tracing::trace!(scope = %self.id(), flushed, "coalesced tasks flushed");
    }

    pub(crate) fn drain_post_digest(&self) {
        let root = &self.node.root;
        loop {
            let hook = root.post_digest_queue.lock().pop_front();
            let Some(hook) = hook else {
                break;
            };
            isolate("post_digest hook", hook);
        }
    }
}

fn digest_pending_async(node: &Weak<ScopeNode>) {
    let Some(scope) = Scope::upgrade(node) else {
        return;
    };
    if !scope.node.root.has_pending_async() {
        return;
    }
    if let Err(err) = scope.root().digest() {
        tracing::error!(%err, "scheduled digest failed");
    }
}

fn flush_on_timer(node: &Weak<ScopeNode>) {
    let Some(scope) = Scope::upgrade(node) else {
        return;
    };
    if let Err(err) = scope.root().apply(|root| root.flush_apply_async()) {
        tracing::error!(%err, "scheduled coalesced flush failed");
    }
}
