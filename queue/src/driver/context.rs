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

//! Execution context of jobs and the middleware that can wrap them.

use crate::driver::Client;
use crate::model::{ExecError, ExecResult};
use futures::FutureExt;
use futures::future::BoxFuture;
use futures::lock::Mutex;
use pqwork_core::db::TxExecutor;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Information about the job being executed.
#[derive(Clone)]
pub struct JobContext {
    /// Identifier of the job.
    pub(super) id: Uuid,

    /// Name of the queue the job came from.
    pub(super) queue: String,

    /// Client to reach the backing services.
    pub(super) client: Client,

    /// Transaction opened for the job by `in_transaction`, if any.
    pub(super) tx: Option<Arc<Mutex<TxExecutor>>>,
}

impl JobContext {
    /// Returns the identifier of the job.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Returns the name of the queue the job came from.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Returns the client to reach the backing services, which can be used to add more jobs.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Returns the transaction the job runs in, if the queue uses `in_transaction`.
    pub fn tx(&self) -> Option<Arc<Mutex<TxExecutor>>> {
        self.tx.clone()
    }
}

/// Type-erased function that runs jobs with arguments of type `T`.
pub type ExecFn<T> = Arc<dyn Fn(JobContext, T) -> BoxFuture<'static, ExecResult> + Send + Sync>;

/// Transformation applied to the function that runs a job.  Re-applied before every job.
pub type Middleware<T> = Arc<dyn Fn(ExecFn<T>) -> ExecFn<T> + Send + Sync>;

/// Applies the `middleware` chain to `exec`.
///
/// Each middleware wraps the result of the previous ones, so the last one ends up outermost.
pub(super) fn apply_middleware<T>(exec: &ExecFn<T>, middleware: &[Middleware<T>]) -> ExecFn<T> {
    middleware.iter().fold(exec.clone(), |exec, m| m(exec))
}

/// Middleware that fails jobs taking longer than `limit`.
///
/// The job is abandoned at its next suspension point and recorded as failed.
pub fn with_time_limit<T: Send + 'static>(limit: Duration) -> Middleware<T> {
    Arc::new(move |next: ExecFn<T>| -> ExecFn<T> {
        Arc::new(move |ctx: JobContext, arg: T| -> BoxFuture<'static, ExecResult> {
            let next = next.clone();
            async move {
                match tokio::time::timeout(limit, next(ctx, arg)).await {
                    Ok(result) => result,
                    Err(_) => Err(ExecError::Failed(format!("Timed out after {:?}", limit))),
                }
            }
            .boxed()
        })
    })
}

/// Middleware that runs jobs inside a fresh transaction exposed through `JobContext::tx`.
///
/// The transaction commits if the job succeeds and rolls back otherwise.  Jobs added to other
/// queues within this transaction only wake up their workers after the commit.
pub fn in_transaction<T: Send + 'static>() -> Middleware<T> {
    Arc::new(|next: ExecFn<T>| -> ExecFn<T> {
        Arc::new(move |mut ctx: JobContext, arg: T| -> BoxFuture<'static, ExecResult> {
            let next = next.clone();
            async move {
                let tx = Arc::from(Mutex::new(ctx.client.db().begin().await?));
                ctx.tx = Some(tx.clone());

                let result = next(ctx, arg).await;
                if result.is_ok() {
                    let tx = Arc::try_unwrap(tx).map_err(|_| {
                        ExecError::Failed("Job leaked its transaction".to_owned())
                    })?;
                    tx.into_inner().commit().await?;
                }
                result
            }
            .boxed()
        })
    })
}
