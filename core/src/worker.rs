// PQWork
// Copyright 2023 Julio Merino
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not
// use this file except in compliance with the License.  You may obtain a copy
// of the License at:
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS, WITHOUT
// WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.  See the
// License for the specific language governing permissions and limitations
// under the License.

//! Single-threaded background worker triggered by an interval or on demand.
//!
//! A `Worker` owns a background task that runs an execution function once per trigger, never
//! overlapping executions.  Triggers come from a fixed interval (with the default input), from
//! `trigger` (also with the default input) or from `trigger_with_input`.
//!
//! Panics in the execution function are caught and treated as errors.  After any error, the
//! worker sleeps for a back-off period before accepting more work.

use crate::db::{Db, TxExecutor};
use futures::Future;
use futures::future::{BoxFuture, FutureExt};
use futures::lock::Mutex;
use log::{debug, warn};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Default number of pending triggers a worker accepts before dropping new ones.
const DEFAULT_QUEUE_DEPTH: usize = 10;

/// Default time to sleep after a failed execution.
const DEFAULT_ERROR_BACKOFF: Duration = Duration::from_secs(10);

/// Worker errors.
#[derive(Debug, PartialEq, thiserror::Error)]
pub enum WorkerError {
    /// The execution function reported an error.
    #[error("{0}")]
    Failed(String),

    /// The execution function panicked.
    #[error("Panicked: {0}")]
    Panicked(String),

    /// The execution function did not finish within its time limit.
    #[error("Timed out after {0:?}")]
    TimedOut(Duration),

    /// The worker has been stopped and accepts no more triggers.
    #[error("Worker is stopped")]
    Stopped,

    /// The caller gave up waiting for the worker to accept a trigger.
    #[error("Trigger cancelled")]
    Cancelled,
}

/// Result type for this module.
pub type WorkerResult<T> = Result<T, WorkerError>;

/// Extracts a printable message from the payload of a caught panic.
pub fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "Unknown panic payload".to_owned()
    }
}

/// Awaits `fut` and returns its output, or the panic message if polling it panicked.
pub async fn catch_panic<F, T>(fut: F) -> Result<T, String>
where
    F: Future<Output = T>,
{
    AssertUnwindSafe(fut).catch_unwind().await.map_err(panic_message)
}

/// Execution function of a worker.
pub type Exec<I> = Arc<dyn Fn(I) -> BoxFuture<'static, WorkerResult<()>> + Send + Sync>;

/// Transformation applied to an execution function before every run.
pub type Middleware<I> = Arc<dyn Fn(Exec<I>) -> Exec<I> + Send + Sync>;

/// Middleware that fails executions taking longer than `limit`.
pub fn with_time_limit<I: Send + 'static>(limit: Duration) -> Middleware<I> {
    Arc::new(move |next: Exec<I>| -> Exec<I> {
        Arc::new(move |input: I| -> BoxFuture<'static, WorkerResult<()>> {
            let next = next.clone();
            async move {
                match tokio::time::timeout(limit, next(input)).await {
                    Ok(result) => result,
                    Err(_) => Err(WorkerError::TimedOut(limit)),
                }
            }
            .boxed()
        })
    })
}

/// Input of a worker whose executions run inside a database transaction.
///
/// The transaction is only available while running under `in_transaction`.
pub struct TxInput<I> {
    /// The input given to the worker.
    input: I,

    /// Transaction opened for the execution, if any.
    tx: Option<Arc<Mutex<TxExecutor>>>,
}

impl<I: Default> Default for TxInput<I> {
    fn default() -> Self {
        Self::new(I::default())
    }
}

impl<I> TxInput<I> {
    /// Wraps `input` for a transactional worker.
    pub fn new(input: I) -> Self {
        Self { input, tx: None }
    }

    /// Returns the input given to the worker.
    pub fn input(&self) -> &I {
        &self.input
    }

    /// Returns the transaction the execution runs in.
    pub fn tx(&self) -> Option<Arc<Mutex<TxExecutor>>> {
        self.tx.clone()
    }
}

/// Middleware that runs executions inside a fresh transaction on `db`.
///
/// The transaction commits if the execution succeeds and rolls back otherwise.
pub fn in_transaction<I: Send + 'static>(db: Arc<dyn Db>) -> Middleware<TxInput<I>> {
    Arc::new(move |next: Exec<TxInput<I>>| -> Exec<TxInput<I>> {
        let db = db.clone();
        Arc::new(move |mut input: TxInput<I>| -> BoxFuture<'static, WorkerResult<()>> {
            let db = db.clone();
            let next = next.clone();
            async move {
                let tx = db.begin().await.map_err(|e| WorkerError::Failed(e.to_string()))?;
                let tx = Arc::from(Mutex::new(tx));
                input.tx = Some(tx.clone());

                next(input).await?;
                let tx = Arc::try_unwrap(tx).map_err(|_| {
                    WorkerError::Failed("Execution leaked its transaction".to_owned())
                })?;
                tx.into_inner().commit().await.map_err(|e| WorkerError::Failed(e.to_string()))
            }
            .boxed()
        })
    })
}

/// Applies the `middleware` chain to `exec`.
///
/// Each middleware wraps the result of the previous ones, so the last one ends up outermost.
fn apply_middleware<I>(exec: &Exec<I>, middleware: &[Middleware<I>]) -> Exec<I> {
    middleware.iter().fold(exec.clone(), |exec, m| m(exec))
}

/// Configuration options for a worker.
#[derive(Clone, Debug)]
pub struct WorkerOptions {
    /// Name of the worker for logging purposes.
    pub name: String,

    /// Period at which to run the worker with the default input.  If none, the worker only runs
    /// on explicit triggers.
    pub interval: Option<Duration>,

    /// Number of pending triggers to accept before dropping new ones.
    pub queue_depth: usize,

    /// Time to sleep after a failed execution.
    pub error_backoff: Duration,
}

impl WorkerOptions {
    /// Creates options for a worker called `name` that only runs on explicit triggers.
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            interval: None,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            error_backoff: DEFAULT_ERROR_BACKOFF,
        }
    }

    /// Makes the worker also run every `interval`.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }
}

/// Runs `exec` wrapped by `middleware` on `input` and turns panics into errors.
async fn execute<I>(exec: &Exec<I>, middleware: &[Middleware<I>], input: I) -> WorkerResult<()> {
    let exec = apply_middleware(exec, middleware);
    match catch_panic(async move { exec(input).await }).await {
        Ok(result) => result,
        Err(msg) => Err(WorkerError::Panicked(msg)),
    }
}

/// Body of the background task of a worker.
async fn run<I: Default + Send + 'static>(
    opts: WorkerOptions,
    exec: Exec<I>,
    middleware: Vec<Middleware<I>>,
    mut control_rx: mpsc::Receiver<I>,
    stop: CancellationToken,
) {
    let mut ticker = opts.interval.map(|period| {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });

    loop {
        let input = match ticker.as_mut() {
            Some(ticker) => tokio::select! {
                biased;

                () = stop.cancelled() => break,
                input = control_rx.recv() => match input {
                    Some(input) => input,
                    None => break,
                },
                _ = ticker.tick() => I::default(),
            },

            None => tokio::select! {
                biased;

                () = stop.cancelled() => break,
                input = control_rx.recv() => match input {
                    Some(input) => input,
                    None => break,
                },
            },
        };

        if let Err(e) = execute(&exec, &middleware, input).await {
            warn!("Worker {}: {}; backing off for {:?}", opts.name, e, opts.error_backoff);
            tokio::select! {
                () = stop.cancelled() => break,
                () = tokio::time::sleep(opts.error_backoff) => (),
            }
        }
    }

    // Triggers accepted before the stop still run, but no new ones get in.
    control_rx.close();
    while let Some(input) = control_rx.recv().await {
        if let Err(e) = execute(&exec, &middleware, input).await {
            warn!("Worker {}: {}", opts.name, e);
        }
    }

    debug!("Worker {}: stopped", opts.name);
}

/// A background worker that runs inputs of type `I`.
///
/// Dropping the worker stops it.
pub struct Worker<I> {
    /// Name of the worker for logging purposes.
    name: String,

    /// Communication channel with the background task.
    control_tx: mpsc::Sender<I>,

    /// Token to terminate the background task.
    stop: CancellationToken,
}

impl<I> Drop for Worker<I> {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

impl<I: Default + Send + 'static> Worker<I> {
    /// Creates a new worker configured by `opts` that runs `exec` wrapped by `middleware`, and
    /// starts its background task.
    pub fn new<F, Fut>(opts: WorkerOptions, exec: F, middleware: Vec<Middleware<I>>) -> Self
    where
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = WorkerResult<()>> + Send + 'static,
    {
        let exec: Exec<I> = Arc::new(move |input| exec(input).boxed());
        let (control_tx, control_rx) = mpsc::channel(opts.queue_depth.max(1));
        let stop = CancellationToken::new();
        let name = opts.name.clone();
        tokio::spawn(run(opts, exec, middleware, control_rx, stop.clone()));
        Self { name, control_tx, stop }
    }

    /// Requests a run with the default input without blocking.
    ///
    /// If the worker already has too many pending triggers, the request is dropped.
    pub fn trigger(&self) -> WorkerResult<()> {
        if self.stop.is_cancelled() {
            return Err(WorkerError::Stopped);
        }
        match self.control_tx.try_send(I::default()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("Worker {}: dropping trigger because the queue is full", self.name);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(WorkerError::Stopped),
        }
    }

    /// Requests a run with `input`, waiting until the worker accepts the request or until
    /// `lifetime` is cancelled.
    pub async fn trigger_with_input(
        &self,
        lifetime: &CancellationToken,
        input: I,
    ) -> WorkerResult<()> {
        tokio::select! {
            biased;

            () = self.stop.cancelled() => Err(WorkerError::Stopped),
            () = lifetime.cancelled() => Err(WorkerError::Cancelled),
            result = self.control_tx.send(input) => result.map_err(|_| WorkerError::Stopped),
        }
    }

    /// Stops the worker.  Triggers accepted before this call still run, but new ones are rejected
    /// and the worker cannot be restarted.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Returns true if the worker has been stopped.
    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::Semaphore;

    /// Maximum time to wait for any asynchronous event in these tests.  Must be longer than any
    /// back-off period used by tests that run with paused time.
    const TIMEOUT: Duration = Duration::from_secs(60);

    /// Waits until `cond` is true, yielding in between checks.
    async fn wait_for<C: Fn() -> bool>(cond: C) {
        tokio::time::timeout(TIMEOUT, async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
    }

    /// Creates a worker that records all the inputs it sees.
    fn recording_worker(opts: WorkerOptions) -> (Worker<u32>, Arc<Mutex<Vec<u32>>>) {
        let seen = Arc::from(Mutex::new(vec![]));
        let worker = {
            let seen = seen.clone();
            Worker::new(
                opts,
                move |input| {
                    let seen = seen.clone();
                    async move {
                        seen.lock().unwrap().push(input);
                        Ok(())
                    }
                },
                vec![],
            )
        };
        (worker, seen)
    }

    #[test]
    fn test_panic_message() {
        assert_eq!("static", panic_message(Box::new("static")));
        assert_eq!("owned", panic_message(Box::new("owned".to_owned())));
        assert_eq!("Unknown panic payload", panic_message(Box::new(5)));
    }

    #[tokio::test]
    async fn test_catch_panic() {
        assert_eq!(Ok(3), catch_panic(async { 3 }).await);
        assert_eq!(
            Err("boom".to_owned()),
            catch_panic(async {
                panic!("boom");
            })
            .await
            .map(|()| ())
        );
    }

    #[tokio::test]
    async fn test_trigger_runs_with_default_input() {
        let (worker, seen) = recording_worker(WorkerOptions::new("test"));
        worker.trigger().unwrap();
        wait_for(|| seen.lock().unwrap().len() == 1).await;
        assert_eq!(vec![0], *seen.lock().unwrap());
    }

    #[tokio::test]
    async fn test_trigger_with_input() {
        let (worker, seen) = recording_worker(WorkerOptions::new("test"));
        let lifetime = CancellationToken::new();
        for i in 1..=3 {
            worker.trigger_with_input(&lifetime, i).await.unwrap();
        }
        wait_for(|| seen.lock().unwrap().len() == 3).await;
        assert_eq!(vec![1, 2, 3], *seen.lock().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval() {
        let opts = WorkerOptions::new("test").with_interval(Duration::from_secs(60));
        let (_worker, seen) = recording_worker(opts);

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert!(seen.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_secs(60 * 3)).await;
        assert_eq!(vec![0, 0, 0], *seen.lock().unwrap());
    }

    #[tokio::test]
    async fn test_trigger_never_blocks_and_drops_excess() {
        let gate = Arc::from(Semaphore::new(0));
        let runs = Arc::from(AtomicUsize::new(0));
        let worker = {
            let gate = gate.clone();
            let runs = runs.clone();
            Worker::new(
                WorkerOptions::new("slow"),
                move |_: u32| {
                    let gate = gate.clone();
                    let runs = runs.clone();
                    async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        gate.acquire().await.unwrap().forget();
                        Ok(())
                    }
                },
                vec![],
            )
        };

        // Get the worker stuck in its first execution so that the queue fills up.
        worker.trigger().unwrap();
        wait_for(|| runs.load(Ordering::SeqCst) == 1).await;

        for _ in 0..(DEFAULT_QUEUE_DEPTH + 1) {
            worker.trigger().unwrap();
        }

        gate.add_permits(100);
        wait_for(|| runs.load(Ordering::SeqCst) == DEFAULT_QUEUE_DEPTH + 1).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(DEFAULT_QUEUE_DEPTH + 1, runs.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_from_panics_after_backoff() {
        let done = Arc::from(Mutex::new(vec![]));
        let worker = {
            let done = done.clone();
            Worker::new(
                WorkerOptions::new("panicky"),
                move |input: u32| {
                    let done = done.clone();
                    async move {
                        if input == 1 {
                            panic!("Cannot handle 1");
                        }
                        done.lock().unwrap().push((input, Instant::now()));
                        Ok(())
                    }
                },
                vec![],
            )
        };

        let start = Instant::now();
        let lifetime = CancellationToken::new();
        worker.trigger_with_input(&lifetime, 1).await.unwrap();
        worker.trigger_with_input(&lifetime, 2).await.unwrap();
        wait_for(|| !done.lock().unwrap().is_empty()).await;

        let done = done.lock().unwrap();
        assert_eq!(2, done[0].0);
        assert!(done[0].1 - start >= DEFAULT_ERROR_BACKOFF);
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_back_off() {
        let runs = Arc::from(Mutex::new(vec![]));
        let worker = {
            let runs = runs.clone();
            let opts = WorkerOptions {
                error_backoff: Duration::from_secs(5),
                ..WorkerOptions::new("failing")
            };
            Worker::new(
                opts,
                move |_: u32| {
                    let runs = runs.clone();
                    async move {
                        runs.lock().unwrap().push(Instant::now());
                        Err(WorkerError::Failed("Always fails".to_owned()))
                    }
                },
                vec![],
            )
        };

        let start = Instant::now();
        worker.trigger().unwrap();
        worker.trigger().unwrap();
        wait_for(|| runs.lock().unwrap().len() == 2).await;

        let runs = runs.lock().unwrap();
        assert!(runs[0] - start < Duration::from_secs(5));
        assert!(runs[1] - runs[0] >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_stop_is_terminal() {
        let (worker, seen) = recording_worker(WorkerOptions::new("test"));
        assert!(!worker.is_stopped());
        worker.stop();
        assert!(worker.is_stopped());

        assert_eq!(Err(WorkerError::Stopped), worker.trigger());
        let lifetime = CancellationToken::new();
        assert_eq!(Err(WorkerError::Stopped), worker.trigger_with_input(&lifetime, 5).await);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(seen.lock().unwrap().is_empty());
    }

    /// Creates a worker whose executions block until `gate` has permits.  Returns the worker
    /// and the inputs of the executions that started.
    fn gated_worker(
        opts: WorkerOptions,
        gate: Arc<Semaphore>,
    ) -> (Worker<u32>, Arc<Mutex<Vec<u32>>>) {
        let started = Arc::from(Mutex::new(vec![]));
        let worker = {
            let started = started.clone();
            Worker::new(
                opts,
                move |input: u32| {
                    let gate = gate.clone();
                    let started = started.clone();
                    async move {
                        started.lock().unwrap().push(input);
                        gate.acquire().await.unwrap().forget();
                        Ok(())
                    }
                },
                vec![],
            )
        };
        (worker, started)
    }

    #[tokio::test]
    async fn test_stop_runs_already_accepted_triggers() {
        let gate = Arc::from(Semaphore::new(0));
        let (worker, started) = gated_worker(WorkerOptions::new("test"), gate.clone());

        let lifetime = CancellationToken::new();
        worker.trigger_with_input(&lifetime, 1).await.unwrap();
        wait_for(|| started.lock().unwrap().len() == 1).await;
        worker.trigger_with_input(&lifetime, 2).await.unwrap();
        worker.trigger_with_input(&lifetime, 3).await.unwrap();

        worker.stop();
        assert_eq!(Err(WorkerError::Stopped), worker.trigger_with_input(&lifetime, 4).await);

        gate.add_permits(100);
        wait_for(|| started.lock().unwrap().len() == 3).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(vec![1, 2, 3], *started.lock().unwrap());
    }

    #[tokio::test]
    async fn test_trigger_with_input_gives_up_on_cancellation() {
        let gate = Arc::from(Semaphore::new(0));
        let opts = WorkerOptions { queue_depth: 1, ..WorkerOptions::new("test") };
        let (worker, started) = gated_worker(opts, gate.clone());

        let lifetime = CancellationToken::new();
        worker.trigger_with_input(&lifetime, 1).await.unwrap();
        wait_for(|| started.lock().unwrap().len() == 1).await;
        worker.trigger_with_input(&lifetime, 2).await.unwrap();

        let waiting = {
            let lifetime = lifetime.clone();
            async move { worker.trigger_with_input(&lifetime, 3).await }
        };
        let canceller = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            lifetime.cancel();
        };
        let (result, ()) = tokio::join!(waiting, canceller);
        assert_eq!(Err(WorkerError::Cancelled), result);

        gate.add_permits(100);
        wait_for(|| started.lock().unwrap().len() == 2).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(vec![1, 2], *started.lock().unwrap());
    }

    #[tokio::test]
    async fn test_middleware_order_and_reapplication() {
        let log = Arc::from(Mutex::new(vec![]));

        let recorder = |name: &'static str, log: Arc<Mutex<Vec<String>>>| -> Middleware<u32> {
            Arc::new(move |next: Exec<u32>| -> Exec<u32> {
                log.lock().unwrap().push(format!("apply {}", name));
                let log = log.clone();
                Arc::new(move |input: u32| -> BoxFuture<'static, WorkerResult<()>> {
                    let next = next.clone();
                    let log = log.clone();
                    async move {
                        log.lock().unwrap().push(format!("enter {}", name));
                        next(input).await
                    }
                    .boxed()
                })
            })
        };

        let worker = {
            let log = log.clone();
            let exec_log = log.clone();
            Worker::new(
                WorkerOptions::new("test"),
                move |input: u32| {
                    let log = exec_log.clone();
                    async move {
                        log.lock().unwrap().push(format!("exec {}", input));
                        Ok(())
                    }
                },
                vec![recorder("inner", log.clone()), recorder("outer", log)],
            )
        };

        let lifetime = CancellationToken::new();
        worker.trigger_with_input(&lifetime, 1).await.unwrap();
        worker.trigger_with_input(&lifetime, 2).await.unwrap();
        wait_for(|| log.lock().unwrap().len() == 10).await;

        let mut exp = vec![];
        for i in 1..=2 {
            exp.extend([
                "apply inner".to_owned(),
                "apply outer".to_owned(),
                "enter outer".to_owned(),
                "enter inner".to_owned(),
                format!("exec {}", i),
            ]);
        }
        assert_eq!(exp, *log.lock().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_time_limit() {
        let slow: Exec<u64> = Arc::new(|secs| {
            async move {
                tokio::time::sleep(Duration::from_secs(secs)).await;
                Ok(())
            }
            .boxed()
        });
        let limited = with_time_limit(Duration::from_secs(5))(slow);

        assert_eq!(Ok(()), limited(4).await);
        assert_eq!(Err(WorkerError::TimedOut(Duration::from_secs(5))), limited(6).await);
    }
}
