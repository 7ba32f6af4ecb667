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

//! Registry of queue workers and the background tasks that feed them.

use crate::db;
use crate::driver::context::{ExecFn, JobContext, Middleware, apply_middleware};
use crate::driver::{Client, Queue, WORKQUEUE_CHANNEL};
use crate::model::{ClaimedJob, ExecError, ExecResult};
use futures::FutureExt;
use futures::future::BoxFuture;
use log::{debug, info, warn};
use pqwork_core::bus::Subscription;
use pqwork_core::driver::{DriverError, DriverResult};
use pqwork_core::env::get_optional_var;
use pqwork_core::worker::{Worker, WorkerError, WorkerOptions, catch_panic};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Default period between sweeps of all queues.
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Default period between deletions of expired jobs.
const DEFAULT_CLEAN_INTERVAL: Duration = Duration::from_secs(60);

/// Default time to wait for the wake-up listener to become ready.
const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of jobs of a queue that may run at once.
const DEFAULT_CONCURRENCY: usize = 1;

/// Default time to keep completed jobs around.
const DEFAULT_RETAIN_RESULTS_FOR: Duration = Duration::from_secs(5 * 60);

/// Configuration options for the registry.
#[derive(Clone, Debug, PartialEq)]
pub struct RegistryOptions {
    /// Period at which all queues are checked for jobs regardless of notifications.
    pub sweep_interval: Duration,

    /// Period at which jobs past their retention period are deleted.
    pub clean_interval: Duration,

    /// Maximum time to wait for the wake-up listener to start during creation.
    pub ready_timeout: Duration,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            clean_interval: DEFAULT_CLEAN_INTERVAL,
            ready_timeout: DEFAULT_READY_TIMEOUT,
        }
    }
}

impl RegistryOptions {
    /// Creates a new set of options from environment variables whose name is prefixed with the
    /// given `prefix`.
    ///
    /// This will use variables such as `<prefix>_SWEEP_INTERVAL`, `<prefix>_CLEAN_INTERVAL` and
    /// `<prefix>_READY_TIMEOUT`.  All of them are optional.
    pub fn from_env(prefix: &str) -> Result<Self, String> {
        Ok(Self {
            sweep_interval: get_optional_var::<Duration>(prefix, "SWEEP_INTERVAL")?
                .unwrap_or(DEFAULT_SWEEP_INTERVAL),
            clean_interval: get_optional_var::<Duration>(prefix, "CLEAN_INTERVAL")?
                .unwrap_or(DEFAULT_CLEAN_INTERVAL),
            ready_timeout: get_optional_var::<Duration>(prefix, "READY_TIMEOUT")?
                .unwrap_or(DEFAULT_READY_TIMEOUT),
        })
    }
}

/// Configuration options for a single queue.
#[derive(Clone, Debug, PartialEq)]
pub struct QueueOptions {
    /// Maximum number of jobs of this queue running at once in this process.
    pub concurrency: usize,

    /// Time to keep completed jobs, and their results, before deleting them.
    pub retain_results_for: Duration,

    /// If set, jobs claimed longer ago than this and never completed are returned to the queue
    /// on every sweep.  This must be longer than any job can run or jobs will run twice.
    pub requeue_stale_after: Option<Duration>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            retain_results_for: DEFAULT_RETAIN_RESULTS_FOR,
            requeue_stale_after: None,
        }
    }
}

impl QueueOptions {
    /// Creates a new set of options from environment variables whose name is prefixed with the
    /// given `prefix`.
    ///
    /// This will use variables such as `<prefix>_CONCURRENCY`, `<prefix>_RETAIN_RESULTS_FOR` and
    /// `<prefix>_REQUEUE_STALE_AFTER`.  All of them are optional.
    pub fn from_env(prefix: &str) -> Result<Self, String> {
        Ok(Self {
            concurrency: get_optional_var::<usize>(prefix, "CONCURRENCY")?
                .unwrap_or(DEFAULT_CONCURRENCY),
            retain_results_for: get_optional_var::<Duration>(prefix, "RETAIN_RESULTS_FOR")?
                .unwrap_or(DEFAULT_RETAIN_RESULTS_FOR),
            requeue_stale_after: get_optional_var::<Duration>(prefix, "REQUEUE_STALE_AFTER")?,
        })
    }
}

/// Type-erased operations on a registered queue.
trait QueueRunner: Send + Sync {
    /// Claims and starts jobs until the queue is empty or its concurrency limit is reached.
    fn drain(self: Arc<Self>) -> BoxFuture<'static, ()>;

    /// Requeues stale jobs, if configured to, and then drains the queue.
    fn sweep(self: Arc<Self>) -> BoxFuture<'static, DriverResult<()>>;
}

/// Runs the jobs of a single queue whose arguments are of type `T`.
struct QueueWorker<T> {
    /// Name of the queue.
    name: String,

    /// Client to reach the backing services.
    client: Client,

    /// Configuration of the queue.
    opts: QueueOptions,

    /// Function that runs the jobs.
    exec: ExecFn<T>,

    /// Middleware to wrap `exec` with before every job.
    middleware: Vec<Middleware<T>>,

    /// Gate that bounds the number of jobs running at once.
    gate: Arc<Semaphore>,
}

impl<T: DeserializeOwned + Send + 'static> QueueWorker<T> {
    /// Claims the oldest pending job in a transaction of its own.
    async fn claim(&self) -> DriverResult<Option<ClaimedJob>> {
        let now = self.client.clock().now_utc();
        let mut tx = self.client.db().begin().await?;
        let job = db::claim_job(tx.ex(), &self.name, now).await?;
        tx.commit().await?;
        Ok(job)
    }

    /// Records the completion of job `id` with its optional `result`.
    async fn complete(&self, id: Uuid, result: Option<Vec<u8>>) -> DriverResult<()> {
        let now = self.client.clock().now_utc();
        let retain_until = self.client.clock().now_plus(self.opts.retain_results_for);
        let mut tx = self.client.db().begin().await?;
        db::complete_job(tx.ex(), id, result.as_deref(), now, retain_until).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Runs the claimed `job` through the middleware chain and records its completion.
    ///
    /// Completion is best-effort: if it cannot be recorded, the job stays claimed.
    async fn run(&self, job: ClaimedJob) {
        let result: ExecResult = match serde_json::from_str::<T>(&job.json) {
            Ok(arg) => {
                let ctx = JobContext {
                    id: job.id,
                    queue: self.name.clone(),
                    client: self.client.clone(),
                    tx: None,
                };
                let exec = apply_middleware(&self.exec, &self.middleware);
                match catch_panic(async move { exec(ctx, arg).await }).await {
                    Ok(result) => result,
                    Err(msg) => Err(ExecError::Failed(format!("Panicked: {}", msg))),
                }
            }
            Err(e) => Err(ExecError::Failed(format!("Invalid job argument: {}", e))),
        };

        let stored = match result {
            Ok(stored) => {
                info!("Job {}: finished", job.id);
                stored
            }
            Err(ExecError::Failed(msg)) => {
                warn!("Job {}: failed: {}", job.id, msg);
                None
            }
            Err(ExecError::FailedWithResult(stored, msg)) => {
                warn!("Job {}: failed: {}", job.id, msg);
                Some(stored)
            }
        };

        match catch_panic(self.complete(job.id, stored)).await {
            Ok(Ok(())) => (),
            Ok(Err(e)) => warn!("Job {}: cannot record completion: {}", job.id, e),
            Err(msg) => warn!("Job {}: panicked while recording completion: {}", job.id, msg),
        }
    }
}

impl<T: DeserializeOwned + Send + 'static> QueueRunner for QueueWorker<T> {
    fn drain(self: Arc<Self>) -> BoxFuture<'static, ()> {
        async move {
            loop {
                let Ok(permit) = self.gate.clone().try_acquire_owned() else {
                    // The jobs in flight drain the queue again when they finish.
                    break;
                };

                let job = match catch_panic(self.claim()).await {
                    Ok(Ok(Some(job))) => job,
                    Ok(Ok(None)) => break,
                    Ok(Err(e)) => {
                        warn!("Queue {}: cannot claim job: {}", self.name, e);
                        break;
                    }
                    Err(msg) => {
                        warn!("Queue {}: panicked while claiming job: {}", self.name, msg);
                        break;
                    }
                };
                info!("Job {}: claimed from {}", job.id, self.name);

                let this = self.clone();
                tokio::spawn(async move {
                    this.run(job).await;
                    drop(permit);
                    this.drain().await;
                });
            }
        }
        .boxed()
    }

    fn sweep(self: Arc<Self>) -> BoxFuture<'static, DriverResult<()>> {
        async move {
            if let Some(stale_after) = self.opts.requeue_stale_after {
                let cutoff = self.client.clock().now_utc() - stale_after;
                let mut ex = self.client.db().ex().await?;
                let requeued = db::requeue_stale(&mut ex, &self.name, cutoff).await?;
                drop(ex);
                if requeued > 0 {
                    warn!("Queue {}: requeued {} stale jobs", self.name, requeued);
                }
            }
            self.drain().await;
            Ok(())
        }
        .boxed()
    }
}

/// State shared between the registry and its background tasks.
struct Shared {
    /// Client to reach the backing services.
    client: Client,

    /// Registered queues keyed by name.
    queues: RwLock<HashMap<String, Arc<dyn QueueRunner>>>,
}

impl Shared {
    /// Drains the queue `name` in the background if it is registered.
    async fn wake(&self, name: &str) {
        let runner = self.queues.read().await.get(name).cloned();
        match runner {
            Some(runner) => {
                tokio::spawn(runner.drain());
            }
            None => debug!("Ignoring wake-up for unregistered queue {}", name),
        }
    }

    /// Sweeps all registered queues.
    async fn sweep(&self) -> DriverResult<()> {
        let runners: Vec<Arc<dyn QueueRunner>> =
            self.queues.read().await.values().cloned().collect();

        let mut failed = 0;
        for runner in runners {
            if let Err(e) = runner.sweep().await {
                warn!("Queue sweep failed: {}", e);
                failed += 1;
            }
        }
        if failed > 0 {
            return Err(DriverError::BackendError(format!("Failed to sweep {} queues", failed)));
        }
        Ok(())
    }

    /// Deletes the jobs whose retention period is over.
    async fn clean(&self) -> DriverResult<u64> {
        let now = self.client.clock().now_utc();
        let mut ex = self.client.db().ex().await?;
        let deleted = db::delete_expired(&mut ex, now).await?;
        if deleted > 0 {
            debug!("Deleted {} expired jobs", deleted);
        }
        Ok(deleted)
    }
}

/// Forwards work-queue wake-ups from `sub` to the registered queues until `stop` is cancelled.
async fn listen(shared: Arc<Shared>, mut sub: Subscription, stop: CancellationToken) {
    loop {
        tokio::select! {
            () = stop.cancelled() => break,
            payload = sub.recv() => match payload {
                Some(name) => shared.wake(&name).await,
                None => {
                    warn!("Work queue subscription closed; relying on sweeps only");
                    break;
                }
            },
        }
    }
}

/// Converts a driver error into a worker error.
fn to_worker_error(e: DriverError) -> WorkerError {
    WorkerError::Failed(e.to_string())
}

/// Explicit registry of the queues this process runs jobs for.
///
/// The registry listens for wake-ups on the bus, sweeps all queues periodically to catch jobs
/// whose notifications were lost, and deletes expired jobs.  Dropping the registry stops these
/// background tasks but lets jobs in flight finish.
pub struct Registry {
    /// State shared with the background tasks.
    shared: Arc<Shared>,

    /// Periodic backstop that drains all queues.
    sweeper: Worker<()>,

    /// Periodic deletion of expired jobs.
    cleaner: Worker<()>,

    /// Token to stop the wake-up listener.
    listener: CancellationToken,
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.listener.cancel();
    }
}

impl Registry {
    /// Creates a new registry that uses `client` to reach the backing services.
    ///
    /// Returns once the registry is listening for wake-ups, which requires the database to be
    /// reachable.  Fails if that does not happen within `opts.ready_timeout`.
    pub async fn new(client: Client, opts: RegistryOptions) -> DriverResult<Self> {
        let shared = Arc::from(Shared { client, queues: RwLock::new(HashMap::default()) });

        let mut sub = shared.client.bus().subscribe(WORKQUEUE_CHANNEL).await?;
        match tokio::time::timeout(opts.ready_timeout, sub.ready()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(DriverError::BackendError(format!(
                    "Not listening for queue wake-ups after {:?}",
                    opts.ready_timeout
                )));
            }
        }
        let listener = CancellationToken::new();
        tokio::spawn(listen(shared.clone(), sub, listener.clone()));

        let sweeper = {
            let shared = shared.clone();
            Worker::new(
                WorkerOptions::new("queue-sweeper").with_interval(opts.sweep_interval),
                move |()| {
                    let shared = shared.clone();
                    async move { shared.sweep().await.map_err(to_worker_error) }
                },
                vec![],
            )
        };

        let cleaner = {
            let shared = shared.clone();
            Worker::new(
                WorkerOptions::new("queue-cleaner").with_interval(opts.clean_interval),
                move |()| {
                    let shared = shared.clone();
                    async move { shared.clean().await.map(|_| ()).map_err(to_worker_error) }
                },
                vec![],
            )
        };

        Ok(Self { shared, sweeper, cleaner, listener })
    }

    /// Registers the queue `name` whose jobs take arguments of type `T` and run with `exec`,
    /// wrapped by `middleware`, and returns a producer handle for it.
    ///
    /// Jobs already waiting in the queue start running right away.
    pub async fn register_queue<T, F, Fut>(
        &self,
        name: &str,
        opts: QueueOptions,
        exec: F,
        middleware: Vec<Middleware<T>>,
    ) -> DriverResult<Queue<T>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fn(JobContext, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ExecResult> + Send + 'static,
    {
        if name.is_empty() {
            return Err(DriverError::InvalidInput("Queue name cannot be empty".to_owned()));
        }
        if opts.concurrency == 0 {
            return Err(DriverError::InvalidInput(format!(
                "Concurrency for queue {} must be at least 1",
                name
            )));
        }

        let exec: ExecFn<T> = Arc::new(move |ctx, arg| exec(ctx, arg).boxed());
        let worker = Arc::from(QueueWorker {
            name: name.to_owned(),
            client: self.shared.client.clone(),
            gate: Arc::from(Semaphore::new(opts.concurrency)),
            opts,
            exec,
            middleware,
        });

        {
            let mut queues = self.shared.queues.write().await;
            if queues.contains_key(name) {
                return Err(DriverError::AlreadyExists(format!(
                    "Queue {} is already registered",
                    name
                )));
            }
            queues.insert(name.to_owned(), worker.clone());
        }
        debug!("Registered queue {}", name);

        tokio::spawn(worker.drain());
        Ok(self.shared.client.queue(name))
    }

    /// Returns the client this registry uses.
    pub fn client(&self) -> &Client {
        &self.shared.client
    }

    /// Sweeps all registered queues now instead of waiting for the next periodic sweep.
    pub async fn sweep(&self) -> DriverResult<()> {
        self.shared.sweep().await
    }

    /// Deletes the jobs whose retention period is over and returns how many were deleted.
    pub async fn clean(&self) -> DriverResult<u64> {
        self.shared.clean().await
    }

    /// Stops the background tasks of the registry.  Jobs in flight keep running to completion.
    pub fn stop(&self) {
        self.listener.cancel();
        self.sweeper.stop();
        self.cleaner.stop();
    }
}
