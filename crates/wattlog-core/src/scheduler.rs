//! Cancellable, self-rescheduling repeating task.
//!
//! A [`RepeatingTask`] runs a [`TickHandler`] on a dedicated background thread
//! once per interval between [`start`](RepeatingTask::start) and
//! [`stop`](RepeatingTask::stop).
//!
//! Guarantees:
//! - `start` while running and `stop` while stopped are no-ops.
//! - Once `stop` returns on a thread other than the tick thread, no tick is
//!   running and none will run. Called from inside a tick, `stop` only
//!   prevents the next one.
//! - A slow tick delays the next deadline instead of causing a burst of
//!   catch-up ticks.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::error::{EnergyError, Result};
use crate::types::SessionWindow;

/// Default name of the background thread.
pub const DEFAULT_THREAD_NAME: &str = "wattlog-sampler";

/// The body run on every tick.
pub trait TickHandler: Send + Sync + 'static {
    /// Runs one tick.
    fn on_tick(&self);
}

impl<F> TickHandler for F
where
    F: Fn() + Send + Sync + 'static,
{
    fn on_tick(&self) {
        self();
    }
}

/// Lifecycle state of a [`RepeatingTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Not ticking. Initial state, and the state after `stop`.
    Stopped,
    /// Ticking once per interval.
    Running,
}

#[derive(Debug)]
struct Control {
    state: TaskState,
    /// Bumped on every start so a worker from an earlier session never ticks again.
    generation: u64,
    /// A next tick is scheduled.
    armed: bool,
    in_tick: bool,
    tick_thread: Option<ThreadId>,
    ticks: u64,
    window: Option<SessionWindow>,
}

impl Control {
    const fn new() -> Self {
        Self {
            state: TaskState::Stopped,
            generation: 0,
            armed: false,
            in_tick: false,
            tick_thread: None,
            ticks: 0,
            window: None,
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.state == TaskState::Running && self.generation == generation
    }

    /// Enters a new running generation with a fresh window, returning the
    /// window it replaced.
    fn begin(&mut self) -> Option<SessionWindow> {
        self.generation += 1;
        self.state = TaskState::Running;
        self.armed = true;
        self.window.replace(SessionWindow::open())
    }

    /// Undoes [`begin`](Self::begin) after the worker failed to spawn.
    fn revert_begin(&mut self, previous_window: Option<SessionWindow>) {
        self.state = TaskState::Stopped;
        self.armed = false;
        self.window = previous_window;
    }
}

struct Shared {
    interval: Duration,
    handler: Arc<dyn TickHandler>,
    control: Mutex<Control>,
    wake: Condvar,
}

impl Shared {
    /// Marks the task stopped, returning the generation that was stopped.
    ///
    /// Waits for an in-flight tick unless called from the tick thread.
    fn stop(&self) -> Option<u64> {
        let mut control = self.control.lock();
        if control.state == TaskState::Stopped {
            return None;
        }

        control.state = TaskState::Stopped;
        control.armed = false;
        if let Some(window) = control.window.as_mut() {
            window.close();
        }
        self.wake.notify_all();

        let on_tick_thread = control.tick_thread == Some(thread::current().id());
        if !on_tick_thread {
            while control.in_tick {
                self.wake.wait(&mut control);
            }
        }
        Some(control.generation)
    }

    fn run(&self, generation: u64) {
        let mut deadline = Instant::now() + self.interval;

        loop {
            let mut control = self.control.lock();
            loop {
                if !control.is_current(generation) {
                    return;
                }
                if self.wake.wait_until(&mut control, deadline).timed_out() {
                    break;
                }
            }
            if !control.is_current(generation) {
                return;
            }
            control.armed = false;
            control.in_tick = true;
            control.tick_thread = Some(thread::current().id());
            drop(control);

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.handler.on_tick()));

            let mut control = self.control.lock();
            control.in_tick = false;
            control.tick_thread = None;
            control.ticks += 1;
            self.wake.notify_all();
            if outcome.is_err() {
                warn!(tick = control.ticks, "tick handler panicked; continuing");
            }
            if !control.is_current(generation) {
                return;
            }
            control.armed = true;
            drop(control);

            let now = Instant::now();
            deadline += self.interval;
            if deadline <= now {
                deadline = now + self.interval;
            }
        }
    }
}

/// A repeating task driven by a background thread.
pub struct RepeatingTask {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
    thread_name: String,
}

struct Worker {
    generation: u64,
    handle: JoinHandle<()>,
}

impl std::fmt::Debug for RepeatingTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepeatingTask")
            .field("interval", &self.shared.interval)
            .field("thread_name", &self.thread_name)
            .field("control", &*self.shared.control.lock())
            .finish_non_exhaustive()
    }
}

impl RepeatingTask {
    /// Creates a stopped task that will run `handler` every `interval`.
    ///
    /// # Errors
    ///
    /// Returns `EnergyError::InvalidConfig` if `interval` is zero.
    pub fn new<H: TickHandler>(interval: Duration, handler: Arc<H>) -> Result<Self> {
        if interval.is_zero() {
            return Err(EnergyError::InvalidConfig(
                "tick interval must be greater than 0".to_string(),
            ));
        }

        Ok(Self::build(interval, handler))
    }

    /// Builds a task from an interval already known to be non-zero.
    pub(crate) fn build<H: TickHandler>(interval: Duration, handler: Arc<H>) -> Self {
        Self {
            shared: Arc::new(Shared {
                interval,
                handler,
                control: Mutex::new(Control::new()),
                wake: Condvar::new(),
            }),
            worker: Mutex::new(None),
            thread_name: DEFAULT_THREAD_NAME.to_string(),
        }
    }

    /// Sets the name of the background thread.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Starts ticking. A no-op if already running.
    ///
    /// The first tick fires one interval after this call.
    ///
    /// # Errors
    ///
    /// Returns `EnergyError::Spawn` if the background thread cannot be created.
    pub fn start(&self) -> Result<()> {
        self.start_with(|| {})
    }

    /// Starts ticking, running `prepare` once the worker exists but before it
    /// can tick. A no-op if already running; `prepare` is then not called.
    ///
    /// `prepare` runs with the task's state locked and must not call back
    /// into this task.
    ///
    /// # Errors
    ///
    /// Returns `EnergyError::Spawn` if the background thread cannot be
    /// created. `prepare` is not called and the previous window is kept.
    pub fn start_with(&self, prepare: impl FnOnce()) -> Result<()> {
        let mut worker = self.worker.lock();

        if self.is_running() {
            debug!(thread = %self.thread_name, "task already running");
            return Ok(());
        }

        // A worker stopped from inside its own tick may still be unwinding.
        if let Some(previous) = worker.take() {
            join_worker(previous.handle);
        }

        // Hold the state lock until the new worker is registered so it cannot
        // tick before `prepare` has run.
        let mut control = self.shared.control.lock();
        let previous_window = control.begin();
        let generation = control.generation;

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(self.thread_name.clone())
            .spawn(move || shared.run(generation));

        match spawned {
            Ok(handle) => {
                prepare();
                drop(control);
                *worker = Some(Worker { generation, handle });
                info!(
                    thread = %self.thread_name,
                    interval = ?self.shared.interval,
                    "repeating task started"
                );
                Ok(())
            }
            Err(e) => {
                control.revert_begin(previous_window);
                warn!(thread = %self.thread_name, error = %e, "failed to spawn task thread");
                Err(EnergyError::Spawn(e))
            }
        }
    }

    /// Stops ticking. A no-op if not running.
    ///
    /// Returns once any in-flight tick has finished, unless called from the
    /// tick itself.
    pub fn stop(&self) {
        let Some(generation) = self.shared.stop() else {
            debug!(thread = %self.thread_name, "task not running");
            return;
        };

        // Skip reaping if a concurrent start holds the slot; the next start or
        // drop joins the thread instead.
        if let Some(mut worker) = self.worker.try_lock() {
            let reap = worker.as_ref().is_some_and(|w| {
                w.generation == generation && w.handle.thread().id() != thread::current().id()
            });
            if reap {
                if let Some(w) = worker.take() {
                    join_worker(w.handle);
                }
            }
        }

        let control = self.shared.control.lock();
        info!(
            thread = %self.thread_name,
            ticks = control.ticks,
            duration_ms = control.window.and_then(|w| w.duration()).map(|d| d.as_millis()),
            "repeating task stopped"
        );
    }

    /// Returns a handle that can stop this task from anywhere, including
    /// from inside its own tick handler.
    #[must_use]
    pub fn handle(&self) -> TaskHandle {
        TaskHandle {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> TaskState {
        self.shared.control.lock().state
    }

    /// Returns true while running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == TaskState::Running
    }

    /// Returns true while a next tick is scheduled.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.shared.control.lock().armed
    }

    /// The configured tick interval.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.shared.interval
    }

    /// Name of the background thread.
    #[must_use]
    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }

    /// Ticks completed over the lifetime of this task.
    #[must_use]
    pub fn tick_count(&self) -> u64 {
        self.shared.control.lock().ticks
    }

    /// Start and end of the most recent session, if any.
    #[must_use]
    pub fn window(&self) -> Option<SessionWindow> {
        self.shared.control.lock().window
    }
}

impl Drop for RepeatingTask {
    fn drop(&mut self) {
        self.stop();
        if let Some(worker) = self.worker.get_mut().take() {
            join_worker(worker.handle);
        }
    }
}

/// A weak handle used to stop a [`RepeatingTask`] from inside its own tick.
#[derive(Clone)]
pub struct TaskHandle {
    shared: Weak<Shared>,
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("alive", &(self.shared.strong_count() > 0))
            .finish()
    }
}

impl TaskHandle {
    /// Stops the task. A no-op if it is not running or has been dropped.
    pub fn stop(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.stop();
        }
    }

    /// Returns true while the task is alive and running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared
            .upgrade()
            .is_some_and(|shared| shared.control.lock().state == TaskState::Running)
    }
}

fn join_worker(handle: JoinHandle<()>) {
    if handle.thread().id() == thread::current().id() {
        return;
    }
    if handle.join().is_err() {
        warn!("sampling thread exited with a panic");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::OnceLock;

    fn counter() -> (Arc<AtomicU64>, Arc<impl Fn() + Send + Sync + 'static>) {
        let count = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&count);
        let handler = Arc::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (count, handler)
    }

    #[test]
    fn test_zero_interval_rejected() {
        let (_, handler) = counter();
        let err = RepeatingTask::new(Duration::ZERO, handler).expect_err("should reject");
        assert!(matches!(err, EnergyError::InvalidConfig(_)));
    }

    #[test]
    fn test_initial_state() {
        let (_, handler) = counter();
        let task = RepeatingTask::new(Duration::from_millis(10), handler).expect("valid");

        assert_eq!(task.state(), TaskState::Stopped);
        assert!(!task.is_armed());
        assert_eq!(task.tick_count(), 0);
        assert!(task.window().is_none());
        assert_eq!(task.thread_name(), DEFAULT_THREAD_NAME);
    }

    #[test]
    fn test_ticks_roughly_once_per_interval() {
        let (count, handler) = counter();
        let task = RepeatingTask::new(Duration::from_millis(100), handler).expect("valid");

        task.start().expect("start");
        assert!(task.is_running());
        assert!(task.is_armed());
        thread::sleep(Duration::from_millis(1000));
        task.stop();

        let ticks = count.load(Ordering::SeqCst);
        assert!((8..=12).contains(&ticks), "got {ticks} ticks");
        assert_eq!(task.tick_count(), ticks);
    }

    #[test]
    fn test_double_start_does_not_double_rate() {
        let (count, handler) = counter();
        let task = RepeatingTask::new(Duration::from_millis(50), handler).expect("valid");

        task.start().expect("start");
        task.start().expect("second start is a no-op");
        thread::sleep(Duration::from_millis(500));
        task.stop();

        let ticks = count.load(Ordering::SeqCst);
        assert!((8..=11).contains(&ticks), "got {ticks} ticks");
    }

    #[test]
    fn test_stop_without_start_is_noop() {
        let (count, handler) = counter();
        let task = RepeatingTask::new(Duration::from_millis(10), handler).expect("valid");

        task.stop();
        task.stop();

        assert_eq!(task.state(), TaskState::Stopped);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_no_ticks_after_stop() {
        let (count, handler) = counter();
        let task = RepeatingTask::new(Duration::from_millis(10), handler).expect("valid");

        task.start().expect("start");
        thread::sleep(Duration::from_millis(60));
        task.stop();
        let after_stop = count.load(Ordering::SeqCst);

        thread::sleep(Duration::from_millis(60));
        task.stop();

        assert_eq!(count.load(Ordering::SeqCst), after_stop);
        assert!(!task.is_armed());
    }

    #[test]
    fn test_stop_waits_for_in_flight_tick() {
        let started = Arc::new(AtomicU64::new(0));
        let finished = Arc::new(AtomicU64::new(0));
        let (s, f) = (Arc::clone(&started), Arc::clone(&finished));
        let handler = Arc::new(move || {
            s.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(100));
            f.fetch_add(1, Ordering::SeqCst);
        });
        let task = RepeatingTask::new(Duration::from_millis(10), handler).expect("valid");

        task.start().expect("start");
        // Land inside the first (slow) tick.
        thread::sleep(Duration::from_millis(40));
        task.stop();

        let done = finished.load(Ordering::SeqCst);
        assert_eq!(started.load(Ordering::SeqCst), done);

        thread::sleep(Duration::from_millis(150));
        assert_eq!(started.load(Ordering::SeqCst), done);
        assert_eq!(finished.load(Ordering::SeqCst), done);
    }

    #[test]
    fn test_stop_from_inside_tick() {
        let slot: Arc<OnceLock<TaskHandle>> = Arc::new(OnceLock::new());
        let count = Arc::new(AtomicU64::new(0));
        let (s, c) = (Arc::clone(&slot), Arc::clone(&count));
        let handler = Arc::new(move || {
            if c.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
                if let Some(handle) = s.get() {
                    handle.stop();
                }
            }
        });
        let task = RepeatingTask::new(Duration::from_millis(10), handler).expect("valid");
        slot.set(task.handle()).expect("slot empty");

        task.start().expect("start");
        thread::sleep(Duration::from_millis(150));

        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(!task.is_running());
        assert!(!task.handle().is_running());
        assert!(task.window().is_some_and(|w| w.is_closed()));
    }

    #[test]
    fn test_restart_after_stop() {
        let (count, handler) = counter();
        let task = RepeatingTask::new(Duration::from_millis(10), handler).expect("valid");

        task.start().expect("start");
        thread::sleep(Duration::from_millis(50));
        task.stop();
        let first = task.window().expect("window");
        assert!(first.is_closed());

        task.start().expect("restart");
        let second = task.window().expect("window");
        assert!(!second.is_closed());
        thread::sleep(Duration::from_millis(50));
        task.stop();

        assert!(count.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn test_panicking_tick_keeps_running() {
        let count = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&count);
        let handler = Arc::new(move || {
            let n = c.fetch_add(1, Ordering::SeqCst);
            assert!(n != 0, "first tick fails");
        });
        let task = RepeatingTask::new(Duration::from_millis(10), handler).expect("valid");

        task.start().expect("start");
        thread::sleep(Duration::from_millis(80));
        task.stop();

        assert!(count.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn test_window_records_duration() {
        let (_, handler) = counter();
        let task = RepeatingTask::new(Duration::from_millis(10), handler).expect("valid");

        task.start().expect("start");
        thread::sleep(Duration::from_millis(30));
        task.stop();

        let duration = task.window().and_then(|w| w.duration()).expect("closed window");
        assert!(duration >= Duration::from_millis(30));
    }

    #[test]
    fn test_start_with_prepares_once_per_start() {
        let (_, handler) = counter();
        let task = RepeatingTask::new(Duration::from_millis(10), handler).expect("valid");
        let prepared = AtomicU64::new(0);

        task.start_with(|| {
            prepared.fetch_add(1, Ordering::SeqCst);
        })
        .expect("start");
        task.start_with(|| {
            prepared.fetch_add(1, Ordering::SeqCst);
        })
        .expect("already running");
        assert_eq!(prepared.load(Ordering::SeqCst), 1);

        task.stop();
        task.start_with(|| {
            prepared.fetch_add(1, Ordering::SeqCst);
        })
        .expect("restart");
        task.stop();
        assert_eq!(prepared.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_prepare_runs_before_first_tick() {
        let count = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&count);
        let handler = Arc::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let task = RepeatingTask::new(Duration::from_millis(1), handler).expect("valid");

        let seen = AtomicU64::new(u64::MAX);
        task.start_with(|| {
            thread::sleep(Duration::from_millis(20));
            seen.store(count.load(Ordering::SeqCst), Ordering::SeqCst);
        })
        .expect("start");
        task.stop();

        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failed_spawn_restores_previous_window() {
        let mut control = Control::new();
        let mut first = SessionWindow::open();
        first.close();
        control.window = Some(first);

        let previous = control.begin();
        assert_eq!(control.state, TaskState::Running);
        assert!(control.window.is_some_and(|w| !w.is_closed()));

        control.revert_begin(previous);
        assert_eq!(control.state, TaskState::Stopped);
        assert!(!control.armed);
        let restored = control.window.expect("previous window");
        assert_eq!(restored.duration(), first.duration());
        assert_eq!(restored.start_time(), first.start_time());
    }

    #[test]
    fn test_drop_stops_task() {
        let (count, handler) = counter();
        let task = RepeatingTask::new(Duration::from_millis(10), handler).expect("valid");
        let handle = task.handle();

        task.start().expect("start");
        drop(task);
        let after_drop = count.load(Ordering::SeqCst);

        thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), after_drop);
        assert!(!handle.is_running());
    }
}
