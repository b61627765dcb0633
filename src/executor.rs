//! Macrotask scheduling for deferred digests
//!
//! The engine never touches wall-clock timers directly. Whenever it needs work
//! to happen "on a later turn" it hands a [`Macrotask`] to the tree's
//! [`Scheduler`]:
//!
//! - `eval_async` schedules a zero-delay digest when nothing else will run
//!   the in-cycle queue.
//! - `apply_async` schedules one coalesced flush per batch, and cancels it
//!   again if a digest pulls the batch forward.
//!
//! Two schedulers ship with the crate. Both keep a timer queue ordered by
//! deadline and then by submission order, and run tasks on the thread that
//! drives them:
//!
//! - [`EventLoop`] uses the real clock. Call [`EventLoop::run_due`] from an
//!   existing loop, or [`EventLoop::run_until_idle`] to block until every
//!   pending task has run.
//! - [`ManualScheduler`] uses a virtual clock that only moves when told to,
//!   which makes timer-driven behavior deterministic in tests.
//!
//! ```ignore
//! let clock = Arc::new(ManualScheduler::new());
//! let scope = Scope::builder().scheduler(clock.clone()).build();
//!
//! scope.apply_async(|scope| scope.set("value", 2));
//! clock.run_until_idle(); // flush + digest happen here
//! ```

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// A unit of deferred work.
pub type Macrotask = Box<dyn FnOnce() + Send>;

/// Handle returned by [`Scheduler::schedule`], used to cancel the task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

/// Capability to run work on a later turn of the same logical thread.
pub trait Scheduler: Send + Sync {
    /// Run `task` once `delay` has elapsed.
    fn schedule(&self, delay: Duration, task: Macrotask) -> TimerHandle;

    /// Forget a task that has not run yet. Unknown handles are ignored.
    fn cancel(&self, handle: TimerHandle);
}

/// Timer queue shared by both schedulers, generic over the clock's instant type.
struct TimerQueue<T> {
    next_handle: u64,
    tasks: BTreeMap<(T, TimerHandle), Macrotask>,
}

impl<T: Ord + Copy> TimerQueue<T> {
    fn new() -> Self {
        Self {
            next_handle: 0,
            tasks: BTreeMap::new(),
        }
    }

    fn push(&mut self, deadline: T, task: Macrotask) -> TimerHandle {
        let handle = TimerHandle(self.next_handle);
        self.next_handle += 1;
        self.tasks.insert((deadline, handle), task);
        handle
    }

    fn cancel(&mut self, handle: TimerHandle) -> bool {
        let key = self.tasks.keys().find(|(_, h)| *h == handle).copied();
        key.and_then(|key| self.tasks.remove(&key)).is_some()
    }

    /// Remove the earliest task whose deadline is not after `now`.
    fn pop_due(&mut self, now: T) -> Option<Macrotask> {
        let (&(deadline, _), _) = self.tasks.first_key_value()?;
        if deadline > now {
            return None;
        }
        self.tasks.pop_first().map(|(_, task)| task)
    }

    fn next_deadline(&self) -> Option<T> {
        self.tasks.keys().next().map(|(deadline, _)| *deadline)
    }

    fn len(&self) -> usize {
        self.tasks.len()
    }
}

/// Real-clock scheduler driven by the caller's thread.
///
/// Tasks never run on their own; something has to call [`run_due`] or
/// [`run_until_idle`]. The queue lock is released while a task runs, so tasks
/// may schedule or cancel further tasks.
///
/// [`run_due`]: EventLoop::run_due
/// [`run_until_idle`]: EventLoop::run_until_idle
pub struct EventLoop {
    queue: Mutex<TimerQueue<Instant>>,
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop {
    /// Create an empty event loop.
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(TimerQueue::new()),
        }
    }

    /// Run every task whose deadline has passed. Returns the number run.
    pub fn run_due(&self) -> usize {
        let mut ran = 0;
        loop {
            let task = self.queue.lock().pop_due(Instant::now());
            let Some(task) = task else {
                break;
            };
            task();
            ran += 1;
        }
        ran
    }

    /// Run tasks, sleeping until each deadline, until the queue is empty.
    ///
    /// Returns the number of tasks run.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        loop {
            ran += self.run_due();
            let next = self.queue.lock().next_deadline();
            let Some(deadline) = next else {
                break;
            };
            let wait = deadline.saturating_duration_since(Instant::now());
            if !wait.is_zero() {
                std::thread::sleep(wait);
            }
        }
        ran
    }

    /// Number of tasks waiting to run.
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }
}

impl Scheduler for EventLoop {
    fn schedule(&self, delay: Duration, task: Macrotask) -> TimerHandle {
        self.queue.lock().push(Instant::now() + delay, task)
    }

    fn cancel(&self, handle: TimerHandle) {
        self.queue.lock().cancel(handle);
    }
}

struct ManualState {
    now: Duration,
    queue: TimerQueue<Duration>,
}

/// Scheduler with a virtual clock that only advances on request.
///
/// Elapsed time is measured from the scheduler's creation. Tasks scheduled
/// with a zero delay run on the next [`advance`](ManualScheduler::advance),
/// including `advance(Duration::ZERO)`.
pub struct ManualScheduler {
    state: Mutex<ManualState>,
}

impl Default for ManualScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualScheduler {
    /// Create a scheduler whose clock reads zero.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ManualState {
                now: Duration::ZERO,
                queue: TimerQueue::new(),
            }),
        }
    }

    /// Current virtual time.
    pub fn now(&self) -> Duration {
        self.state.lock().now
    }

    /// Move the clock forward by `by`, running every task that becomes due
    /// (including tasks those tasks schedule within the window), in deadline
    /// order. Returns the number of tasks run.
    pub fn advance(&self, by: Duration) -> usize {
        let target = self.state.lock().now + by;
        let mut ran = 0;
        loop {
            let task = {
                let mut state = self.state.lock();
                match state.queue.next_deadline() {
                    Some(deadline) if deadline <= target => {
                        state.now = state.now.max(deadline);
                        let now = state.now;
                        state.queue.pop_due(now)
                    }
                    _ => {
                        state.now = target;
                        None
                    }
                }
            };
            let Some(task) = task else {
                break;
            };
            task();
            ran += 1;
        }
        ran
    }

    /// Jump the clock from deadline to deadline until no task is left.
    ///
    /// Returns the number of tasks run.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        loop {
            let next = self.state.lock().queue.next_deadline();
            let Some(deadline) = next else {
                break;
            };
            let by = deadline.saturating_sub(self.now());
            ran += self.advance(by);
        }
        ran
    }

    /// Number of tasks waiting to run.
    pub fn pending(&self) -> usize {
        self.state.lock().queue.len()
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, task: Macrotask) -> TimerHandle {
        let mut state = self.state.lock();
        let deadline = state.now + delay;
        state.queue.push(deadline, task)
    }

    fn cancel(&self, handle: TimerHandle) {
        self.state.lock().queue.cancel(handle);
    }
}
