//! Background task scheduler for transaction housekeeping.
//!
//! Runs heartbeats, coordinator sweeps, apply-notification resends and commit
//! requests off the caller's thread. Three kinds of work are supported:
//!
//! - one-shot tasks, run as soon as a worker is free
//! - delayed tasks, run once after a delay
//! - periodic tasks, run every interval until they return [`Repeat::Stop`]
//!   or their [`TaskHandle`] is cancelled
//!
//! Ready tasks run in priority order, FIFO within a priority. A panicking task
//! is logged and counted as completed; it never takes a worker down.

use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use strata_core::{StrataError, StrataResult};
use tracing::{debug, error};

/// Priority levels for background work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskPriority {
    /// Sweeps and resends
    Low = 0,
    /// Heartbeats
    Normal = 1,
    /// Commit and abort requests
    High = 2,
}

/// What a periodic task wants after a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repeat {
    /// Run again after the interval
    Continue,
    /// Never run again
    Stop,
}

/// Error returned when the task queue is full or the scheduler is shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackpressureError;

impl std::fmt::Display for BackpressureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "background scheduler queue is full")
    }
}

impl std::error::Error for BackpressureError {}

impl From<BackpressureError> for StrataError {
    fn from(e: BackpressureError) -> Self {
        StrataError::internal(e.to_string())
    }
}

/// Cancellation handle for a scheduled task.
///
/// Cancelling is idempotent. A task that is already running finishes its
/// current run; a periodic task is not rescheduled afterwards.
#[derive(Debug, Clone, Default)]
pub struct TaskHandle {
    cancelled: Arc<AtomicBool>,
}

impl TaskHandle {
    /// Prevent any further run of the task
    pub fn cancel(&self) {
        self.cancelled.store(true, AtomicOrdering::Release);
    }

    /// Whether [`TaskHandle::cancel`] was called
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(AtomicOrdering::Acquire)
    }
}

/// Scheduler metrics snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Number of ready tasks waiting for a worker.
    pub queue_depth: usize,
    /// Number of delayed or periodic tasks waiting for their time.
    pub scheduled_tasks: usize,
    /// Number of tasks currently being executed by workers.
    pub active_tasks: usize,
    /// Total number of task runs completed since scheduler creation.
    pub tasks_completed: u64,
    /// Number of worker threads.
    pub worker_count: usize,
}

enum Work {
    Once(Box<dyn FnOnce() + Send>),
    Periodic {
        interval: Duration,
        task: Box<dyn FnMut() -> Repeat + Send>,
    },
}

struct TaskEnvelope {
    priority: TaskPriority,
    sequence: u64,
    handle: TaskHandle,
    work: Work,
}

impl Eq for TaskEnvelope {}

impl PartialEq for TaskEnvelope {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

// Higher priority first, then lower sequence (older) first
impl Ord for TaskEnvelope {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then(other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for TaskEnvelope {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct TimerEntry {
    due: Instant,
    envelope: TaskEnvelope,
}

impl Eq for TimerEntry {}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.envelope.sequence == other.envelope.sequence
    }
}

// Earliest deadline first
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then(other.envelope.sequence.cmp(&self.envelope.sequence))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct Queues {
    ready: BinaryHeap<TaskEnvelope>,
    timers: BinaryHeap<TimerEntry>,
}

impl Queues {
    /// Move every timer whose deadline passed into the ready heap.
    fn promote_due(&mut self, now: Instant, inner: &SchedulerInner) {
        while self.timers.peek().map_or(false, |t| t.due <= now) {
            if let Some(entry) = self.timers.pop() {
                inner.scheduled.fetch_sub(1, AtomicOrdering::Release);
                if entry.envelope.handle.is_cancelled() {
                    continue;
                }
                self.ready.push(entry.envelope);
                inner.queue_depth.fetch_add(1, AtomicOrdering::Release);
            }
        }
    }
}

struct SchedulerInner {
    queues: Mutex<Queues>,
    work_ready: Condvar,
    drain_cond: Condvar,
    shutdown: AtomicBool,
    sequence: AtomicU64,
    queue_depth: AtomicUsize,
    scheduled: AtomicUsize,
    active_tasks: AtomicUsize,
    max_queue_depth: usize,
    tasks_completed: AtomicU64,
}

impl SchedulerInner {
    fn check_capacity(&self) -> Result<(), BackpressureError> {
        // Reject after shutdown; workers have been joined, task would never run
        if self.shutdown.load(AtomicOrdering::Acquire) {
            return Err(BackpressureError);
        }
        let depth = self.queue_depth.load(AtomicOrdering::Acquire)
            + self.scheduled.load(AtomicOrdering::Acquire);
        if depth >= self.max_queue_depth {
            return Err(BackpressureError);
        }
        Ok(())
    }

    fn envelope(&self, priority: TaskPriority, handle: TaskHandle, work: Work) -> TaskEnvelope {
        TaskEnvelope {
            priority,
            sequence: self.sequence.fetch_add(1, AtomicOrdering::Relaxed),
            handle,
            work,
        }
    }

    fn push_timer(&self, due: Instant, envelope: TaskEnvelope) {
        {
            let mut queues = self.queues.lock();
            queues.timers.push(TimerEntry { due, envelope });
            self.scheduled.fetch_add(1, AtomicOrdering::Release);
        }
        // Wake a waiter so it recomputes its deadline
        self.work_ready.notify_one();
    }
}

/// A background task scheduler with priority ordering and timers.
///
/// Tasks are executed by a fixed pool of worker threads. Higher-priority tasks
/// run first; within the same priority, tasks are executed in FIFO order.
/// Workers also fire delayed and periodic tasks when their deadline passes.
pub struct BackgroundScheduler {
    inner: Arc<SchedulerInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    num_threads: usize,
}

impl BackgroundScheduler {
    /// Create a new scheduler with the given number of worker threads.
    ///
    /// Workers are named `strata-bg-0`, `strata-bg-1`, etc.
    pub fn new(num_threads: usize, max_queue_depth: usize) -> StrataResult<Self> {
        if num_threads == 0 {
            return Err(StrataError::invalid_input(
                "background scheduler needs at least one worker",
            ));
        }
        let inner = Arc::new(SchedulerInner {
            queues: Mutex::new(Queues::default()),
            work_ready: Condvar::new(),
            drain_cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
            sequence: AtomicU64::new(0),
            queue_depth: AtomicUsize::new(0),
            scheduled: AtomicUsize::new(0),
            active_tasks: AtomicUsize::new(0),
            max_queue_depth,
            tasks_completed: AtomicU64::new(0),
        });

        let mut workers = Vec::with_capacity(num_threads);
        for i in 0..num_threads {
            let inner_clone = Arc::clone(&inner);
            let handle = std::thread::Builder::new()
                .name(format!("strata-bg-{}", i))
                .spawn(move || worker_loop(&inner_clone))
                .map_err(|e| {
                    StrataError::internal(format!("failed to spawn background worker: {}", e))
                })?;
            workers.push(handle);
        }

        Ok(Self {
            inner,
            workers: Mutex::new(workers),
            num_threads,
        })
    }

    /// Submit a task to run as soon as a worker is free.
    ///
    /// Returns `Err(BackpressureError)` if the queue is at capacity or
    /// the scheduler has been shut down.
    pub fn submit(
        &self,
        priority: TaskPriority,
        work: impl FnOnce() + Send + 'static,
    ) -> Result<(), BackpressureError> {
        self.inner.check_capacity()?;
        let envelope =
            self.inner
                .envelope(priority, TaskHandle::default(), Work::Once(Box::new(work)));
        {
            let mut queues = self.inner.queues.lock();
            queues.ready.push(envelope);
            self.inner.queue_depth.fetch_add(1, AtomicOrdering::Release);
        }
        self.inner.work_ready.notify_one();
        Ok(())
    }

    /// Run `work` once after `delay`.
    pub fn schedule_after(
        &self,
        priority: TaskPriority,
        delay: Duration,
        work: impl FnOnce() + Send + 'static,
    ) -> Result<TaskHandle, BackpressureError> {
        self.inner.check_capacity()?;
        let handle = TaskHandle::default();
        let envelope = self
            .inner
            .envelope(priority, handle.clone(), Work::Once(Box::new(work)));
        self.inner.push_timer(Instant::now() + delay, envelope);
        Ok(handle)
    }

    /// Run `task` every `interval`, first after one interval.
    ///
    /// The next run is scheduled when the current one finishes, so runs of
    /// one periodic task never overlap.
    pub fn schedule_periodic(
        &self,
        priority: TaskPriority,
        interval: Duration,
        task: impl FnMut() -> Repeat + Send + 'static,
    ) -> Result<TaskHandle, BackpressureError> {
        self.inner.check_capacity()?;
        let handle = TaskHandle::default();
        let envelope = self.inner.envelope(
            priority,
            handle.clone(),
            Work::Periodic {
                interval,
                task: Box::new(task),
            },
        );
        self.inner.push_timer(Instant::now() + interval, envelope);
        Ok(handle)
    }

    /// Block until all ready and in-flight tasks have completed.
    ///
    /// Timers that are not yet due are not waited for. Workers remain
    /// running after drain completes.
    pub fn drain(&self) {
        let mut queues = self.inner.queues.lock();
        while self.inner.queue_depth.load(AtomicOrdering::Acquire) > 0
            || self.inner.active_tasks.load(AtomicOrdering::Acquire) > 0
        {
            self.inner.drain_cond.wait(&mut queues);
        }
    }

    /// Shut down the scheduler: signal workers to exit and join all threads.
    ///
    /// Workers finish the ready tasks before exiting; pending timers are dropped.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, AtomicOrdering::Release);

        // Lock before notifying: a worker between its shutdown check and
        // its wait holds this lock, so it cannot miss the wakeup.
        {
            let mut queues = self.inner.queues.lock();
            let dropped = queues.timers.len();
            queues.timers.clear();
            self.inner.scheduled.store(0, AtomicOrdering::Release);
            if dropped > 0 {
                debug!(target: "strata::scheduler", dropped, "Dropped pending timers on shutdown");
            }
            self.inner.work_ready.notify_all();
        }

        let current = std::thread::current().id();
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            // A task shutting down its own scheduler must not join itself
            if handle.thread().id() == current {
                continue;
            }
            let _ = handle.join();
        }
    }

    /// Whether [`BackgroundScheduler::shutdown`] was called
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(AtomicOrdering::Acquire)
    }

    /// Return a snapshot of scheduler metrics.
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            queue_depth: self.inner.queue_depth.load(AtomicOrdering::Relaxed),
            scheduled_tasks: self.inner.scheduled.load(AtomicOrdering::Relaxed),
            active_tasks: self.inner.active_tasks.load(AtomicOrdering::Relaxed),
            tasks_completed: self.inner.tasks_completed.load(AtomicOrdering::Relaxed),
            worker_count: self.num_threads,
        }
    }
}

impl Drop for BackgroundScheduler {
    fn drop(&mut self) {
        // Signal only; workers exit on their own once the ready queue is empty.
        self.inner.shutdown.store(true, AtomicOrdering::Release);
        let _queues = self.inner.queues.lock();
        self.inner.work_ready.notify_all();
    }
}

impl std::fmt::Debug for BackgroundScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundScheduler")
            .field("stats", &self.stats())
            .finish()
    }
}

/// RAII guard that decrements `active_tasks` and notifies drain waiters on drop.
///
/// Keeps the bookkeeping right even if a task panics; otherwise `drain()`
/// would hang forever.
struct ActiveTaskGuard<'a> {
    inner: &'a SchedulerInner,
}

impl<'a> Drop for ActiveTaskGuard<'a> {
    fn drop(&mut self) {
        let prev_active = self.inner.active_tasks.fetch_sub(1, AtomicOrdering::Release);
        self.inner
            .tasks_completed
            .fetch_add(1, AtomicOrdering::Relaxed);

        // Lock before notifying: drain() holds this lock while checking
        // its condition, so the notification cannot be lost.
        if prev_active == 1 && self.inner.queue_depth.load(AtomicOrdering::Acquire) == 0 {
            let _queues = self.inner.queues.lock();
            self.inner.drain_cond.notify_all();
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("(non-string panic)")
}

fn worker_loop(inner: &SchedulerInner) {
    loop {
        let task = {
            let mut queues = inner.queues.lock();
            loop {
                queues.promote_due(Instant::now(), inner);
                if let Some(task) = queues.ready.pop() {
                    inner.queue_depth.fetch_sub(1, AtomicOrdering::Release);
                    inner.active_tasks.fetch_add(1, AtomicOrdering::Release);
                    break task;
                }
                if inner.shutdown.load(AtomicOrdering::Acquire) {
                    return;
                }
                match queues.timers.peek().map(|t| t.due) {
                    Some(due) => {
                        inner.work_ready.wait_until(&mut queues, due);
                    }
                    None => inner.work_ready.wait(&mut queues),
                }
            }
        };

        let _guard = ActiveTaskGuard { inner };
        let TaskEnvelope {
            priority,
            handle,
            work,
            ..
        } = task;
        if handle.is_cancelled() {
            continue;
        }

        // Execute outside the lock; catch_unwind keeps the worker alive
        match work {
            Work::Once(work) => {
                if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(work)) {
                    error!(
                        target: "strata::scheduler",
                        panic = panic_message(e.as_ref()),
                        "Background task panicked"
                    );
                }
            }
            Work::Periodic { interval, mut task } => {
                let outcome =
                    std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| task()));
                match outcome {
                    Ok(Repeat::Continue)
                        if !handle.is_cancelled()
                            && !inner.shutdown.load(AtomicOrdering::Acquire) =>
                    {
                        let envelope =
                            inner.envelope(priority, handle, Work::Periodic { interval, task });
                        inner.push_timer(Instant::now() + interval, envelope);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(
                            target: "strata::scheduler",
                            panic = panic_message(e.as_ref()),
                            "Periodic task panicked; not rescheduling"
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Barrier};

    fn scheduler(threads: usize, depth: usize) -> BackgroundScheduler {
        BackgroundScheduler::new(threads, depth).unwrap()
    }

    /// Occupy the single worker until the returned barrier is waited on.
    fn block_worker(scheduler: &BackgroundScheduler) -> Arc<Barrier> {
        let barrier = Arc::new(Barrier::new(2));
        let b = Arc::clone(&barrier);
        scheduler
            .submit(TaskPriority::Low, move || {
                b.wait();
            })
            .unwrap();
        std::thread::sleep(Duration::from_millis(50));
        barrier
    }

    #[test]
    fn test_submit_and_drain() {
        let scheduler = scheduler(2, 4096);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let c = Arc::clone(&counter);
            scheduler
                .submit(TaskPriority::Normal, move || {
                    c.fetch_add(1, AtomicOrdering::Relaxed);
                })
                .unwrap();
        }
        scheduler.drain();
        assert_eq!(counter.load(AtomicOrdering::Relaxed), 10);
        scheduler.shutdown();
    }

    #[test]
    fn test_zero_workers_rejected() {
        assert!(BackgroundScheduler::new(0, 16).is_err());
    }

    #[test]
    fn test_priority_ordering() {
        let scheduler = scheduler(1, 4096);
        let barrier = block_worker(&scheduler);
        let order = Arc::new(Mutex::new(Vec::new()));
        for (priority, name) in [
            (TaskPriority::Low, "low"),
            (TaskPriority::Normal, "normal"),
            (TaskPriority::High, "high"),
        ] {
            let o = Arc::clone(&order);
            scheduler
                .submit(priority, move || o.lock().push(name))
                .unwrap();
        }
        barrier.wait();
        scheduler.drain();
        assert_eq!(*order.lock(), vec!["high", "normal", "low"]);
        scheduler.shutdown();
    }

    #[test]
    fn test_backpressure() {
        let scheduler = scheduler(1, 2);
        let barrier = block_worker(&scheduler);
        scheduler.submit(TaskPriority::Normal, || {}).unwrap();
        scheduler
            .schedule_after(TaskPriority::Normal, Duration::from_secs(60), || {})
            .unwrap();
        assert_eq!(
            scheduler.submit(TaskPriority::Normal, || {}),
            Err(BackpressureError)
        );
        barrier.wait();
        scheduler.drain();
        scheduler.shutdown();
    }

    #[test]
    fn test_schedule_after_runs_later() {
        let scheduler = scheduler(1, 64);
        let ran = Arc::new(AtomicBool::new(false));
        let r = Arc::clone(&ran);
        let start = Instant::now();
        scheduler
            .schedule_after(TaskPriority::Normal, Duration::from_millis(40), move || {
                r.store(true, AtomicOrdering::SeqCst);
            })
            .unwrap();
        assert!(!ran.load(AtomicOrdering::SeqCst));
        while !ran.load(AtomicOrdering::SeqCst) {
            assert!(start.elapsed() < Duration::from_secs(5));
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(start.elapsed() >= Duration::from_millis(40));
        scheduler.shutdown();
    }

    #[test]
    fn test_cancelled_timer_never_runs() {
        let scheduler = scheduler(1, 64);
        let ran = Arc::new(AtomicBool::new(false));
        let r = Arc::clone(&ran);
        let handle = scheduler
            .schedule_after(TaskPriority::Normal, Duration::from_millis(30), move || {
                r.store(true, AtomicOrdering::SeqCst);
            })
            .unwrap();
        handle.cancel();
        assert!(handle.is_cancelled());
        std::thread::sleep(Duration::from_millis(100));
        assert!(!ran.load(AtomicOrdering::SeqCst));
        scheduler.shutdown();
    }

    #[test]
    fn test_periodic_until_stop() {
        let scheduler = scheduler(2, 64);
        let runs = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&runs);
        scheduler
            .schedule_periodic(TaskPriority::Normal, Duration::from_millis(5), move || {
                if r.fetch_add(1, AtomicOrdering::SeqCst) + 1 >= 3 {
                    Repeat::Stop
                } else {
                    Repeat::Continue
                }
            })
            .unwrap();
        let start = Instant::now();
        while runs.load(AtomicOrdering::SeqCst) < 3 {
            assert!(start.elapsed() < Duration::from_secs(5));
            std::thread::sleep(Duration::from_millis(5));
        }
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(runs.load(AtomicOrdering::SeqCst), 3);
        assert_eq!(scheduler.stats().scheduled_tasks, 0);
        scheduler.shutdown();
    }

    #[test]
    fn test_periodic_cancel() {
        let scheduler = scheduler(1, 64);
        let runs = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&runs);
        let handle = scheduler
            .schedule_periodic(TaskPriority::Normal, Duration::from_millis(5), move || {
                r.fetch_add(1, AtomicOrdering::SeqCst);
                Repeat::Continue
            })
            .unwrap();
        let start = Instant::now();
        while runs.load(AtomicOrdering::SeqCst) == 0 {
            assert!(start.elapsed() < Duration::from_secs(5));
            std::thread::sleep(Duration::from_millis(2));
        }
        handle.cancel();
        std::thread::sleep(Duration::from_millis(30));
        let after_cancel = runs.load(AtomicOrdering::SeqCst);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(runs.load(AtomicOrdering::SeqCst), after_cancel);
        scheduler.shutdown();
    }

    #[test]
    fn test_shutdown_drains_ready_and_drops_timers() {
        let scheduler = scheduler(1, 4096);
        let barrier = block_worker(&scheduler);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let c = Arc::clone(&counter);
            scheduler
                .submit(TaskPriority::Normal, move || {
                    c.fetch_add(1, AtomicOrdering::Relaxed);
                })
                .unwrap();
        }
        let c = Arc::clone(&counter);
        scheduler
            .schedule_after(TaskPriority::Normal, Duration::from_secs(60), move || {
                c.fetch_add(100, AtomicOrdering::Relaxed);
            })
            .unwrap();
        barrier.wait();
        scheduler.shutdown();
        assert_eq!(counter.load(AtomicOrdering::Relaxed), 5);
        assert!(scheduler.is_shutdown());
    }

    #[test]
    fn test_submit_after_shutdown_rejected() {
        let scheduler = scheduler(2, 4096);
        scheduler.shutdown();
        assert!(scheduler.submit(TaskPriority::Normal, || {}).is_err());
        assert!(scheduler
            .schedule_periodic(TaskPriority::Normal, Duration::from_millis(1), || {
                Repeat::Continue
            })
            .is_err());
        // Idempotent
        scheduler.shutdown();
    }

    #[test]
    fn test_task_panic_does_not_hang_drain() {
        let scheduler = scheduler(2, 4096);
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler
            .submit(TaskPriority::Normal, || panic!("intentional test panic"))
            .unwrap();
        for _ in 0..5 {
            let c = Arc::clone(&counter);
            scheduler
                .submit(TaskPriority::Normal, move || {
                    c.fetch_add(1, AtomicOrdering::Relaxed);
                })
                .unwrap();
        }
        scheduler.drain();
        assert_eq!(counter.load(AtomicOrdering::Relaxed), 5);
        assert_eq!(scheduler.stats().tasks_completed, 6);
        scheduler.shutdown();
    }

    #[test]
    fn test_concurrent_submits() {
        let scheduler = Arc::new(scheduler(2, 4096));
        let counter = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let s = Arc::clone(&scheduler);
                let c = Arc::clone(&counter);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let c = Arc::clone(&c);
                        s.submit(TaskPriority::Normal, move || {
                            c.fetch_add(1, AtomicOrdering::Relaxed);
                        })
                        .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        scheduler.drain();
        assert_eq!(counter.load(AtomicOrdering::Relaxed), 400);
        assert_eq!(scheduler.stats().tasks_completed, 400);
        scheduler.shutdown();
    }
}
