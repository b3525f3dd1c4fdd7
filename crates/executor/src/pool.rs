//! Worker pools: the Executor Provider boundary. A top-level task occupies
//! one worker for the duration of its `run`; each subtask inside a group
//! occupies one worker of (possibly) a different pool.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::TaskError;

/// A handle to one submitted job. Mirrors a cancellable future: `poll`
/// returns `Some` once the job has produced a result, `cancel` asks the
/// worker to stop waiting on it (cooperative — the underlying thread is not
/// forcibly interrupted, matching the spec's cooperative cancellation
/// model).
pub struct SubtaskHandle {
    result_rx: crossbeam_channel::Receiver<Result<(), TaskError>>,
    cancelled: Arc<AtomicBool>,
}

impl SubtaskHandle {
    /// Non-blocking check for a finished result.
    pub fn poll(&self) -> Option<Result<(), TaskError>> {
        self.result_rx.try_recv().ok()
    }

    /// Marks this handle cancelled. The job itself keeps running to
    /// completion in the background; callers should stop waiting on it.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// A pool of workers a job can be submitted to. `submit` must not block the
/// caller; the job runs on a worker thread and reports its result through
/// the returned [`SubtaskHandle`].
pub trait WorkerPool: Send + Sync {
    fn submit(&self, job: Box<dyn FnOnce() -> Result<(), TaskError> + Send>) -> SubtaskHandle;
}

/// A fixed-size thread pool, grounded in the spawn-a-worker-thread-per-job
/// pattern used to run tasks: a bounded set of long-lived worker threads
/// pulling jobs off a shared channel.
pub struct ThreadPoolWorkerPool {
    job_tx: crossbeam_channel::Sender<Job>,
    _workers: Vec<std::thread::JoinHandle<()>>,
}

type Job = Box<dyn FnOnce() + Send>;

impl ThreadPoolWorkerPool {
    pub fn new(name: &str, threads: usize) -> Self {
        let (job_tx, job_rx) = crossbeam_channel::unbounded::<Job>();
        let workers = (0..threads.max(1))
            .map(|i| {
                let job_rx = job_rx.clone();
                std::thread::Builder::new()
                    .name(format!("{name}-{i}"))
                    .spawn(move || {
                        while let Ok(job) = job_rx.recv() {
                            job();
                        }
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self { job_tx, _workers: workers }
    }
}

impl WorkerPool for ThreadPoolWorkerPool {
    fn submit(&self, job: Box<dyn FnOnce() -> Result<(), TaskError> + Send>) -> SubtaskHandle {
        let (result_tx, result_rx) = crossbeam_channel::bounded(1);
        let cancelled = Arc::new(AtomicBool::new(false));

        let wrapped: Job = Box::new(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(job))
                .unwrap_or_else(|payload| Err(TaskError::Panic(panic_message(payload))));
            let _ = result_tx.send(result);
        });

        // an unbounded job channel never fails to send
        self.job_tx.send(wrapped).expect("worker pool channel closed");

        SubtaskHandle { result_rx, cancelled }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    match payload.downcast::<&'static str>() {
        Ok(s) => s.to_string(),
        Err(payload) => match payload.downcast::<String>() {
            Ok(s) => *s,
            Err(_) => "Box<dyn Any>".to_string(),
        },
    }
}

/// Supplies worker pools keyed by task type. The default implementation
/// lazily creates one shared pool per task type tag the first time it's
/// asked for.
pub trait ExecutorProvider: Send + Sync {
    fn pool_for(&self, task_type: &str) -> Arc<dyn WorkerPool>;
}

pub struct DefaultExecutorProvider {
    pools: dashmap::DashMap<String, Arc<dyn WorkerPool>>,
    threads_per_pool: usize,
}

impl DefaultExecutorProvider {
    pub fn new(threads_per_pool: usize) -> Self {
        Self {
            pools: dashmap::DashMap::new(),
            threads_per_pool,
        }
    }
}

impl Default for DefaultExecutorProvider {
    fn default() -> Self {
        Self::new(4)
    }
}

impl ExecutorProvider for DefaultExecutorProvider {
    fn pool_for(&self, task_type: &str) -> Arc<dyn WorkerPool> {
        self.pools
            .entry(task_type.to_string())
            .or_insert_with(|| {
                Arc::new(ThreadPoolWorkerPool::new(task_type, self.threads_per_pool))
            })
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_runs_job_and_reports_result() {
        let pool = ThreadPoolWorkerPool::new("test", 2);
        let handle = pool.submit(Box::new(|| Ok(())));
        let result = loop {
            if let Some(r) = handle.poll() {
                break r;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        };
        assert!(result.is_ok());
    }

    #[test]
    fn panicking_job_is_caught_as_task_error() {
        let pool = ThreadPoolWorkerPool::new("test-panic", 1);
        let handle = pool.submit(Box::new(|| panic!("boom")));
        let result = loop {
            if let Some(r) = handle.poll() {
                break r;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        };
        assert!(matches!(result, Err(TaskError::Panic(_))));
    }

    #[test]
    fn default_provider_reuses_pool_per_task_type() {
        let provider = DefaultExecutorProvider::new(1);
        let a = provider.pool_for("demo");
        let b = provider.pool_for("demo");
        assert!(Arc::ptr_eq(&a, &b));
    }
}
