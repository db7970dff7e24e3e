//! This module provides bounded task pooling features.

use std::any::Any;
use std::num::NonZeroUsize;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::{self, BoxFuture, Future, FutureExt};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinError;

pub use future::RemoteHandle;

type Job = BoxFuture<'static, ()>;

/// Error returned when a task is sent to a pool which is not running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("task pool is not running")]
pub struct Stopped;

/// A fixed-size pool of workers consuming asynchronous tasks from a shared queue.
///
/// Each worker pulls the next task only once its current one has completed, so a pool started with a single worker
/// processes tasks strictly in the order they were sent.
///
/// # Forget tasks
/// Tasks can just be pushed and forgotten using [`Pool::forget()`] method (tasks must return `()`).
///
/// # Keep a handle on tasks
/// Tasks returning any `T: Send` can be pushed while keeping a remote handle on their result using [`Pool::execute()`].
///
/// # Example
/// ```
/// # tokio_test::block_on(async {
/// # use fetchpool::task::Pool;
/// let mut pool = Pool::default();
/// pool.start(3.try_into().unwrap());
///
/// for i in 0..=5 {
///     pool.forget(async move { println!("Hello from task #{i}!") }).unwrap();
/// }
///
/// pool.close().await;
/// # })
/// ```
#[derive(Debug, Default)]
pub struct Pool {
    /// The pool of workers.
    workers: Vec<Worker>,
    /// The sending part of the queue shared by the workers.
    sender: Option<mpsc::UnboundedSender<Job>>,
}

impl Pool {
    /// Start a pool with `size` workers.
    ///
    /// # Panics
    /// This method panics if the pool is already running, ie. when called more than once without stopping the pool in between.
    pub fn start(&mut self, size: NonZeroUsize) {
        assert!(!self.is_running(), "task pool already running");

        let (sender, receiver) = mpsc::unbounded_channel();
        let receiver = Arc::new(Mutex::new(receiver));

        static WORKER_ID: AtomicUsize = AtomicUsize::new(0);
        let size = size.get();
        let id = WORKER_ID.fetch_add(size, Ordering::Relaxed);

        self.workers = (0..size).map(|i| Worker::spawn(id.wrapping_add(i), Arc::clone(&receiver))).collect();
        self.sender = Some(sender);
    }

    /// Whether the pool currently accepts tasks.
    #[inline]
    pub fn is_running(&self) -> bool {
        self.sender.is_some()
    }

    /// Number of running workers.
    #[inline]
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Send a task and keep a remote handle on its result.
    ///
    /// ```
    /// # tokio_test::block_on(async {
    /// # use fetchpool::task::Pool;
    /// # let mut pool = Pool::default();
    /// # pool.start(2.try_into().unwrap());
    /// let handle = pool.execute(async { 6 * 7 }).unwrap();
    ///
    /// assert_eq!(handle.await, 42);
    /// # })
    /// ```
    ///
    /// **Dropping the remote handle cancels the task.** Call `handle.forget()` to let it complete in the background.
    ///
    /// A panic inside the task is resumed when the handle is awaited.
    pub fn execute<T: Send + 'static>(
        &self,
        future: impl Future<Output = T> + Send + 'static,
    ) -> Result<RemoteHandle<T>, Stopped> {
        let (remote, handle) = future.remote_handle();

        self.forget(remote)?;

        Ok(handle)
    }

    /// Send a task and forget it.
    ///
    /// ```
    /// # use fetchpool::task::{Pool, Stopped};
    /// let pool = Pool::default();
    ///
    /// assert_eq!(pool.forget(async { println!("Hello world!") }), Err(Stopped));
    /// ```
    #[inline]
    pub fn forget(&self, future: impl Future<Output = ()> + Send + 'static) -> Result<(), Stopped> {
        let sender = self.sender.as_ref().ok_or(Stopped)?;

        sender.send(future.boxed()).map_err(|_| Stopped)
    }

    /// Stop current pool of workers, waiting for all pending tasks to complete.
    ///
    /// Once stopped, the pool can be started again with any number of workers.
    pub async fn stop(&mut self) {
        drop(self.sender.take());
        let workers = std::mem::take(&mut self.workers);

        let ids: Vec<_> = workers.iter().map(|worker| worker.id).collect();

        for (id, result) in ids.into_iter().zip(future::join_all(workers).await) {
            if let Err(err) = result {
                tracing::warn!("Worker {id} did not shut down cleanly: {err}");
            }
        }
    }

    /// Close current pool of workers, waiting for all pending tasks to complete.
    ///
    /// Once closed, the pool cannot be used since it is consumed.
    pub async fn close(mut self) {
        self.stop().await
    }
}

#[derive(Debug)]
struct Worker {
    id: usize,
    handle: tokio::task::JoinHandle<()>,
}

impl Worker {
    fn spawn(id: usize, receiver: Arc<Mutex<mpsc::UnboundedReceiver<Job>>>) -> Worker {
        tracing::debug!("Starting worker {id}...");

        Worker {
            id,
            handle: tokio::spawn(async move {
                let mut executed = 0usize;

                loop {
                    // the lock is released before the job runs so that idle workers can pick up the next one
                    let job = receiver.lock().await.recv().await;

                    let Some(job) = job else {
                        tracing::debug!("Queue drained after {executed} tasks, shutting down worker {id}.");
                        break;
                    };

                    tracing::trace!("Executing task on worker {id}...");

                    if let Err(payload) = AssertUnwindSafe(job).catch_unwind().await {
                        tracing::warn!("Task panicked on worker {id}: {}", panic_message(&*payload));
                    }

                    executed += 1;
                }
            }),
        }
    }
}

impl Future for Worker {
    type Output = Result<(), JoinError>;

    #[inline]
    fn poll(mut self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<Self::Output> {
        self.handle.poll_unpin(cx)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// Failure of a single task run by a [`Runner`].
#[derive(Debug, Error)]
pub enum TaskError<E> {
    /// The operation returned an error.
    #[error("task failed: {0}")]
    Failed(E),
    /// The operation panicked.
    #[error("task panicked: {0}")]
    Panicked(String),
}

/// Every task failure of a [`Runner`] batch, keyed by dispatch index.
#[derive(Debug, Error)]
#[error("{} of {} tasks failed", .failures.len(), .total)]
pub struct RunError<E> {
    total: usize,
    failures: Vec<(usize, TaskError<E>)>,
}

impl<E> RunError<E> {
    /// Number of tasks in the batch.
    #[inline]
    pub fn total(&self) -> usize {
        self.total
    }

    /// Failed tasks in dispatch order.
    #[inline]
    pub fn failures(&self) -> &[(usize, TaskError<E>)] {
        &self.failures
    }

    #[inline]
    pub fn into_failures(self) -> Vec<(usize, TaskError<E>)> {
        self.failures
    }
}

/// Bounded-parallelism batch runner.
///
/// A fresh [`Pool`] of `workers` workers is started for each batch and closed once every task has completed.
/// All tasks are always run: failures and panics are collected rather than aborting the batch.
///
/// ```
/// # tokio_test::block_on(async {
/// # use fetchpool::task::Runner;
/// let runner = Runner::new(4.try_into().unwrap());
///
/// let squares = runner.try_run(0..5u32, |i| async move { Ok::<_, String>(i * i) }).await.unwrap();
///
/// assert_eq!(squares, [0, 1, 4, 9, 16]);
/// # })
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Runner {
    workers: NonZeroUsize,
}

impl Runner {
    pub const fn new(workers: NonZeroUsize) -> Self {
        Self { workers }
    }

    #[inline]
    pub fn workers(&self) -> NonZeroUsize {
        self.workers
    }

    /// Apply an infallible synchronous `operation` to every task, waiting for all of them to complete.
    ///
    /// Each worker hands its task over to tokio's blocking thread pool, so that up to `workers` operations actually run in
    /// parallel whatever the number of runtime threads, and blocking operations never stall the runtime.
    ///
    /// The batch fails on panics, or when a blocking task got cancelled by a runtime shutdown.
    pub async fn run<T, F>(&self, tasks: impl IntoIterator<Item = T>, operation: F) -> Result<(), RunError<JoinError>>
    where
        T: Send + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        let operation = Arc::new(operation);

        self.try_run(tasks, move |task| {
            let operation = Arc::clone(&operation);

            async move {
                match tokio::task::spawn_blocking(move || operation(task)).await {
                    Ok(()) => Ok(()),
                    // resumed so that the panic is reported as such by the caller
                    Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
                    Err(err) => Err(err),
                }
            }
        })
        .await
        .map(drop)
    }

    /// Apply an asynchronous fallible `operation` to every task, waiting for all of them to complete.
    ///
    /// Results are returned in dispatch order when every task succeeded.
    pub async fn try_run<T, R, E, F, Fut>(
        &self,
        tasks: impl IntoIterator<Item = T>,
        operation: F,
    ) -> Result<Vec<R>, RunError<E>>
    where
        T: Send + 'static,
        R: Send + 'static,
        E: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        let mut pool = Pool::default();
        pool.start(self.workers);

        let operation = Arc::new(operation);

        let pending: Vec<_> = tasks
            .into_iter()
            .map(|task| {
                let operation = Arc::clone(&operation);

                // no way the pool gets stopped before being closed below
                pool.execute(async move {
                    // the operation is called from within the guarded future so that a synchronous panic is caught too
                    match AssertUnwindSafe(async move { operation(task).await }).catch_unwind().await {
                        Ok(Ok(value)) => Ok(value),
                        Ok(Err(err)) => Err(TaskError::Failed(err)),
                        Err(payload) => Err(TaskError::Panicked(panic_message(&*payload))),
                    }
                })
                .expect("task pool is running")
            })
            .collect();

        let total = pending.len();

        tracing::debug!("Dispatched {total} tasks to {} workers", self.workers);

        let outcomes = future::join_all(pending).await;

        pool.close().await;

        let mut values = Vec::with_capacity(total);
        let mut failures = vec![];

        for (index, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                Ok(value) => values.push(value),
                Err(err) => failures.push((index, err)),
            }
        }

        if failures.is_empty() {
            Ok(values)
        } else {
            Err(RunError { total, failures })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use super::*;

    fn workers(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    #[tokio::test]
    async fn test_pool_restart() {
        let mut pool = Pool::default();
        assert!(!pool.is_running());

        pool.start(workers(2));
        assert_eq!(pool.size(), 2);
        assert_eq!(pool.execute(async { "first" }).unwrap().await, "first");

        pool.stop().await;
        assert!(!pool.is_running());
        assert_eq!(pool.size(), 0);
        assert_eq!(pool.forget(async {}), Err(Stopped));

        pool.start(workers(1));
        assert_eq!(pool.execute(async { "second" }).unwrap().await, "second");
        pool.close().await;
    }

    #[tokio::test]
    #[should_panic(expected = "already running")]
    async fn test_pool_double_start() {
        let mut pool = Pool::default();
        pool.start(workers(1));
        pool.start(workers(1));
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_pool_survives_panicking_task() {
        let mut pool = Pool::default();
        pool.start(workers(1));

        pool.forget(async { panic!("boom") }).unwrap();
        assert_eq!(pool.execute(async { 1 }).unwrap().await, 1);

        pool.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_run_exactly_once() {
        let seen = Arc::new(StdMutex::new(vec![]));

        let sink = Arc::clone(&seen);
        Runner::new(workers(8))
            .run(0..100u32, move |i| sink.lock().unwrap().push(i))
            .await
            .unwrap();

        let mut seen = seen.lock().unwrap().clone();
        seen.sort_unstable();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_run_single_worker_keeps_order() {
        let seen = Arc::new(StdMutex::new(vec![]));

        let sink = Arc::clone(&seen);
        Runner::new(workers(1))
            .run(0..100u32, move |i| sink.lock().unwrap().push(i))
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_run_empty() {
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&calls);
        Runner::new(workers(8))
            .run(std::iter::empty::<u32>(), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_try_run_bounded_concurrency() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let (a, p) = (Arc::clone(&active), Arc::clone(&peak));
        let results = Runner::new(workers(3))
            .try_run(0..30u32, move |i| {
                let (active, peak) = (Arc::clone(&a), Arc::clone(&p));
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, Infallible>(i)
                }
            })
            .await
            .unwrap();

        assert_eq!(results, (0..30).collect::<Vec<_>>());
        assert!((1..=3).contains(&peak.load(Ordering::SeqCst)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_blocking_operations_use_every_worker() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let (a, p) = (Arc::clone(&active), Arc::clone(&peak));
        Runner::new(workers(8))
            .run(0..16u32, move |_| {
                let now = a.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(100));
                a.fetch_sub(1, Ordering::SeqCst);
            })
            .await
            .unwrap();

        // more blocking operations in flight than runtime threads, but never more than workers
        assert_eq!(peak.load(Ordering::SeqCst), 8);
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_try_run_collects_all_failures() {
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&calls);
        let err = Runner::new(workers(4))
            .try_run(0..10u32, move |i| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if i % 2 == 1 {
                        Err(format!("odd {i}"))
                    } else {
                        Ok(i)
                    }
                }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 10);
        assert_eq!(err.total(), 10);
        assert_eq!(err.to_string(), "5 of 10 tasks failed");

        let indices: Vec<_> = err.failures().iter().map(|(index, _)| *index).collect();
        assert_eq!(indices, [1, 3, 5, 7, 9]);
        assert!(matches!(&err.failures()[0].1, TaskError::Failed(msg) if msg == "odd 1"));
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_run_reports_panics() {
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&calls);
        let err = Runner::new(workers(2))
            .run(0..5u32, move |i| {
                if i == 3 {
                    panic!("boom {i}");
                }
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 4);

        match err.into_failures().as_slice() {
            [(3, TaskError::Panicked(msg))] => assert_eq!(msg, "boom 3"),
            other => panic!("unexpected failures: {other:?}"),
        }
    }
}
