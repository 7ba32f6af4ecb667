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

//! Client-side handles to add jobs and to query their state.

use crate::db;
use crate::model::JobStatus;
use derivative::Derivative;
use log::warn;
use pqwork_core::bus::NotificationBus;
use pqwork_core::clocks::Clock;
use pqwork_core::db::{Db, TxExecutor};
use pqwork_core::driver::{DriverError, DriverResult};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::Arc;
use uuid::Uuid;

/// Name of the bus channel on which queue wake-ups travel.  The payload is the queue name.
pub const WORKQUEUE_CHANNEL: &str = "workqueue";

/// Shared handle to the queue's backing services.
///
/// This is cheap to clone: all clones share the same database, clock and bus.
#[derive(Clone)]
pub struct Client {
    /// The database holding the jobs.
    db: Arc<dyn Db>,

    /// The clock used to stamp job state changes.
    clock: Arc<dyn Clock>,

    /// The bus used to wake up workers.
    bus: NotificationBus,
}

impl Client {
    /// Creates a new client backed by `db`, `clock` and `bus`.
    pub fn new(db: Arc<dyn Db>, clock: Arc<dyn Clock>, bus: NotificationBus) -> Self {
        Self { db, clock, bus }
    }

    /// Returns the database holding the jobs.
    pub fn db(&self) -> &Arc<dyn Db> {
        &self.db
    }

    /// Returns the clock used to stamp job state changes.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Returns the bus used to wake up workers.
    pub fn bus(&self) -> &NotificationBus {
        &self.bus
    }

    /// Gets a producer handle for the queue called `name` that takes arguments of type `T`.
    ///
    /// The queue does not need to be registered in this process.
    pub fn queue<T>(&self, name: &str) -> Queue<T> {
        Queue { name: name.to_owned(), client: self.clone(), _data: PhantomData }
    }

    /// Wakes up the workers of queue `name` in all processes.
    pub async fn notify(&self, name: &str) -> DriverResult<()> {
        self.bus.publish(WORKQUEUE_CHANNEL, name).await
    }

    /// Gets the status of the job `id`.
    pub async fn get_status(&self, id: Uuid) -> DriverResult<JobStatus> {
        let mut ex = self.db.ex().await?;
        Ok(db::get_status(&mut ex, id).await?)
    }

    /// Gets the result stored by the job `id`.
    ///
    /// Returns `NotFound` if the job does not exist, has not stored a result yet, or has
    /// finished without one.
    pub async fn get_result(&self, id: Uuid) -> DriverResult<Vec<u8>> {
        let mut ex = self.db.ex().await?;
        match db::get_result(&mut ex, id).await? {
            Some(result) => Ok(result),
            None => Err(DriverError::NotFound(format!("Job {} has no result", id))),
        }
    }

    /// Gets the result stored by the job `id` and deserializes it from JSON.
    pub async fn get_result_json<V: DeserializeOwned>(&self, id: Uuid) -> DriverResult<V> {
        let result = self.get_result(id).await?;
        serde_json::from_slice(&result).map_err(|e| {
            DriverError::BackendError(format!("Result of job {} is not valid JSON: {}", id, e))
        })
    }
}

/// Producer handle for a queue whose jobs take arguments of type `T`.
#[derive(Derivative)]
#[derivative(Clone(bound = ""))]
pub struct Queue<T> {
    /// Name of the queue.
    name: String,

    /// Client to reach the backing services.
    client: Client,

    /// The type of the job arguments.
    _data: PhantomData<fn(T)>,
}

impl<T> Queue<T> {
    /// Returns the name of the queue.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wakes up the workers of this queue in all processes.
    pub async fn notify(&self) -> DriverResult<()> {
        self.client.notify(&self.name).await
    }
}

impl<T: Serialize> Queue<T> {
    /// Adds a job with argument `arg` as part of the transaction `tx`.
    ///
    /// The job only becomes visible, and workers are only woken up, once `tx` commits.
    pub async fn add(&self, tx: &mut TxExecutor, arg: &T) -> DriverResult<Uuid> {
        let json = serde_json::to_string(arg).map_err(|e| {
            DriverError::InvalidInput(format!("Cannot serialize argument for {}: {}", self.name, e))
        })?;

        let id = db::put_new_job(tx.ex(), &self.name, &json, self.client.clock.now_utc()).await?;

        let client = self.client.clone();
        let name = self.name.clone();
        tx.on_commit(move || async move {
            if let Err(e) = client.notify(&name).await {
                warn!("Cannot wake up workers for queue {}: {}; relying on sweeps", name, e);
            }
        });

        Ok(id)
    }
}
