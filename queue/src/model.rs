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

//! Generic data types for the queue.
//!
//! Jobs move through `created -> claimed -> completed -> deleted` and never go back, except when
//! a queue opts into requeuing stale claims.  Job arguments are stored as JSON and results as
//! opaque bytes: the queue never looks into either.

use pqwork_core::db::DbError;
use pqwork_core::driver::DriverError;
use time::OffsetDateTime;
use uuid::Uuid;

/// Snapshot of the state of a job.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JobStatus {
    /// Unique identifier of the job.
    pub id: Uuid,

    /// Name of the queue the job belongs to.
    pub queue: String,

    /// Rank of the job among the not-yet-started jobs of its queue, starting at 1.  Jobs created
    /// at the same time share the same rank.  Zero once the job has started.
    pub position: u64,

    /// When the job was added.
    pub created_at: OffsetDateTime,

    /// When the job was claimed by a worker, if it has been.
    pub started_at: Option<OffsetDateTime>,

    /// When the job finished running, if it has.
    pub completed_at: Option<OffsetDateTime>,
}

impl JobStatus {
    /// Returns true if the job has finished running.
    pub fn is_done(&self) -> bool {
        self.completed_at.is_some()
    }
}

/// A job that has just been claimed for execution.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClaimedJob {
    /// Unique identifier of the job.
    pub id: Uuid,

    /// Serialized job argument.
    pub json: String,
}

/// Error type returned by the closures used to run jobs.
#[derive(Debug, PartialEq, thiserror::Error)]
pub enum ExecError {
    /// Indicates that the job failed without producing a result.
    #[error("{0}")]
    Failed(String),

    /// Indicates that the job failed but produced a partial result worth keeping.
    #[error("{1}")]
    FailedWithResult(Vec<u8>, String),
}

impl From<DbError> for ExecError {
    fn from(value: DbError) -> Self {
        ExecError::Failed(value.to_string())
    }
}

impl From<DriverError> for ExecError {
    fn from(value: DriverError) -> Self {
        ExecError::Failed(value.to_string())
    }
}

/// Result type returned by the closures used to run jobs.  Successful jobs may produce a result
/// that is stored alongside the job until it expires.
pub type ExecResult = Result<Option<Vec<u8>>, ExecError>;
