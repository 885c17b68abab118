//! Bounded Worker Pool
//!
//! Background steps run on a fixed set of OS threads fed from a channel.
//! Submitting returns a [`TaskHandle`] immediately; work beyond the pool
//! bound waits in the queue and counts as running.
//!
//! Cancellation is best-effort: the task's [`CancelToken`] is raised and the
//! handle stops reporting the task as live. A unit that ignores the token
//! keeps its worker busy until it returns; its result is discarded.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use log::{debug, error, warn};

use crate::error::{ExecutionError, ProcessLivenessError};
use crate::executables::CancelToken;

/// Work executed on a pool thread.
pub type Job = Box<dyn FnOnce(&CancelToken) -> Result<(), ExecutionError> + Send + 'static>;

#[derive(Debug, Clone)]
enum TaskState {
    Queued,
    Running,
    Finished(Result<(), ExecutionError>),
    Cancelled,
    /// The worker dropped the task without reporting a result.
    Abandoned,
}

#[derive(Debug)]
struct TaskSlot {
    state: Mutex<TaskState>,
    cancel: CancelToken,
}

/// Cancellable handle to a task submitted to the pool.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    step_id: String,
    slot: Arc<TaskSlot>,
}

impl TaskHandle {
    fn new(step_id: &str) -> Self {
        Self {
            step_id: step_id.to_string(),
            slot: Arc::new(TaskSlot {
                state: Mutex::new(TaskState::Queued),
                cancel: CancelToken::new(),
            }),
        }
    }

    /// Step this task runs.
    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    /// True while the task is queued or executing.
    pub fn is_running(&self) -> Result<bool, ProcessLivenessError> {
        match &*self.state()? {
            TaskState::Queued | TaskState::Running => Ok(true),
            TaskState::Finished(_) | TaskState::Cancelled => Ok(false),
            TaskState::Abandoned => Err(self.liveness_error("worker exited without reporting a result")),
        }
    }

    /// The task's result once it has finished; `None` while pending or after cancellation.
    pub fn result_or_error(&self) -> Option<Result<(), ExecutionError>> {
        match &*self.state().ok()? {
            TaskState::Finished(result) => Some(result.clone()),
            _ => None,
        }
    }

    /// Cancels the task.
    ///
    /// Returns true if the task was still live.
    pub fn cancel(&self) -> bool {
        self.slot.cancel.cancel();
        match self.state() {
            Ok(mut state) => match *state {
                TaskState::Queued | TaskState::Running => {
                    *state = TaskState::Cancelled;
                    true
                }
                _ => false,
            },
            Err(e) => {
                warn!("{}", e);
                false
            }
        }
    }

    /// True once `cancel()` has been called.
    pub fn is_cancelled(&self) -> bool {
        self.slot.cancel.is_cancelled()
    }

    fn state(&self) -> Result<MutexGuard<'_, TaskState>, ProcessLivenessError> {
        self.slot
            .state
            .lock()
            .map_err(|_| self.liveness_error("task state lock poisoned"))
    }

    fn liveness_error(&self, reason: &str) -> ProcessLivenessError {
        ProcessLivenessError {
            step_id: self.step_id.clone(),
            reason: reason.to_string(),
        }
    }
}

/// Marks a task abandoned if it is dropped before reporting.
struct QueuedTask {
    handle: TaskHandle,
    job: Option<Job>,
}

impl QueuedTask {
    fn execute(mut self) {
        let Some(job) = self.job.take() else {
            return;
        };

        {
            let Ok(mut state) = self.handle.slot.state.lock() else {
                return;
            };
            match *state {
                TaskState::Queued => *state = TaskState::Running,
                _ => {
                    debug!("Skipping task for '{}': no longer queued", self.handle.step_id);
                    return;
                }
            }
        }

        let cancel = self.handle.slot.cancel.clone();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| job(&cancel)));

        let Ok(mut state) = self.handle.slot.state.lock() else {
            return;
        };
        if matches!(*state, TaskState::Running) {
            *state = match outcome {
                Ok(result) => TaskState::Finished(result),
                Err(_) => {
                    error!("Worker task for '{}' panicked", self.handle.step_id);
                    TaskState::Abandoned
                }
            };
        }
    }
}

impl Drop for QueuedTask {
    fn drop(&mut self) {
        if self.job.is_none() {
            return;
        }
        if let Ok(mut state) = self.handle.slot.state.lock() {
            if matches!(*state, TaskState::Queued) {
                *state = TaskState::Abandoned;
            }
        }
    }
}

/// Fixed-size pool of worker threads.
pub struct WorkerPool {
    sender: Option<Sender<QueuedTask>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Starts `size` worker threads (at least one).
    pub fn new(size: usize) -> std::io::Result<Self> {
        let size = size.max(1);
        let (sender, receiver) = channel::<QueuedTask>();
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..size)
            .map(|index| {
                let receiver = Arc::clone(&receiver);
                thread::Builder::new()
                    .name(format!("crossflow-worker-{}", index))
                    .spawn(move || worker_loop(&receiver))
            })
            .collect::<std::io::Result<Vec<_>>>()?;

        debug!("Worker pool started with {} threads", size);

        Ok(Self {
            sender: Some(sender),
            workers,
        })
    }

    /// Number of worker threads.
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Queues a job and returns its handle.
    pub fn submit(&self, step_id: &str, job: Job) -> TaskHandle {
        let handle = TaskHandle::new(step_id);
        let task = QueuedTask {
            handle: handle.clone(),
            job: Some(job),
        };

        match &self.sender {
            // A failed send drops the task, which marks it abandoned.
            Some(sender) => {
                if sender.send(task).is_err() {
                    error!("Worker pool is gone; task for '{}' was not queued", step_id);
                }
            }
            None => drop(task),
        }

        handle
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the channel lets idle workers exit. Busy workers are left
        // detached: a unit that ignores cancellation must not hang shutdown.
        self.sender.take();
        debug!("Worker pool closed ({} threads)", self.workers.len());
    }
}

fn worker_loop(receiver: &Mutex<Receiver<QueuedTask>>) {
    loop {
        let task = {
            let guard = match receiver.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.recv()
        };

        match task {
            Ok(task) => task.execute(),
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::Phase;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    fn wait_until(handle: &TaskHandle) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.is_running().unwrap() {
            assert!(Instant::now() < deadline, "task did not finish");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn failure(step_id: &str) -> ExecutionError {
        ExecutionError {
            step_id: step_id.to_string(),
            phase: Phase::Current,
            class_name: "Unit".to_string(),
            method: "run".to_string(),
            message: "boom".to_string(),
        }
    }

    #[test]
    fn test_submit_and_finish() {
        let pool = WorkerPool::new(2).unwrap();
        let handle = pool.submit("s1", Box::new(|_| Ok(())));

        wait_until(&handle);
        assert_eq!(handle.result_or_error(), Some(Ok(())));
        assert_eq!(handle.step_id(), "s1");
    }

    #[test]
    fn test_error_is_captured() {
        let pool = WorkerPool::new(1).unwrap();
        let handle = pool.submit("s1", Box::new(|_| Err(failure("s1"))));

        wait_until(&handle);
        assert_eq!(handle.result_or_error(), Some(Err(failure("s1"))));
    }

    #[test]
    fn test_pool_bound_limits_concurrency() {
        let pool = WorkerPool::new(2).unwrap();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<TaskHandle> = (0..6)
            .map(|i| {
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                pool.submit(
                    &format!("s{}", i),
                    Box::new(move |_| {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(30));
                        active.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    }),
                )
            })
            .collect();

        for handle in &handles {
            wait_until(handle);
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.size(), 2);
    }

    #[test]
    fn test_cancel_running_task() {
        let pool = WorkerPool::new(1).unwrap();
        let handle = pool.submit(
            "s1",
            Box::new(|cancel| {
                cancel.sleep(Duration::from_secs(30));
                Ok(())
            }),
        );

        thread::sleep(Duration::from_millis(20));
        assert!(handle.cancel());
        assert!(handle.is_cancelled());
        assert!(!handle.is_running().unwrap());
        assert!(handle.result_or_error().is_none());

        // Second cancel is a no-op.
        assert!(!handle.cancel());
    }

    #[test]
    fn test_cancel_queued_task_never_runs() {
        let pool = WorkerPool::new(1).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));

        let blocker = pool.submit(
            "blocker",
            Box::new(|cancel| {
                cancel.sleep(Duration::from_millis(100));
                Ok(())
            }),
        );
        let counter = Arc::clone(&ran);
        let queued = pool.submit(
            "queued",
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        assert!(queued.is_running().unwrap());
        assert!(queued.cancel());
        wait_until(&blocker);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panicking_job_reports_liveness_error() {
        let pool = WorkerPool::new(1).unwrap();
        let handle = pool.submit("s1", Box::new(|_| panic!("unit exploded")));

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match handle.is_running() {
                Err(e) => {
                    assert_eq!(e.step_id, "s1");
                    break;
                }
                Ok(_) => {
                    assert!(Instant::now() < deadline, "panic was not observed");
                    thread::sleep(Duration::from_millis(5));
                }
            }
        }

        // The worker thread survives the panic.
        let next = pool.submit("s2", Box::new(|_| Ok(())));
        wait_until(&next);
        assert_eq!(next.result_or_error(), Some(Ok(())));
    }
}
