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

//! Database abstraction to track the jobs of all queues.

use crate::model::{ClaimedJob, JobStatus};
#[cfg(feature = "postgres")]
use pqwork_core::db::postgres;
#[cfg(any(feature = "sqlite", test))]
use pqwork_core::db::sqlite::{self, build_optional_timestamp, build_timestamp, unpack_timestamp};
use pqwork_core::db::{DbError, DbResult, Executor};
use sqlx::Row;
use time::OffsetDateTime;
use uuid::Uuid;


/// Converts a row count as returned by the database into an unsigned integer.
fn count_as_u64(count: i64) -> DbResult<u64> {
    u64::try_from(count)
        .map_err(|_| DbError::DataIntegrityError(format!("Invalid row count {}", count)))
}

/// Verifies that an update statement touched exactly one row.
fn ensure_one_update(affected: u64) -> DbResult<()> {
    match affected {
        0 => Err(DbError::NotFound),
        1 => Ok(()),
        n => Err(DbError::BackendError(format!("Update affected {} rows instead of 1", n))),
    }
}

/// Initializes the database schema.
pub async fn init_schema(ex: &mut Executor) -> DbResult<()> {
    match ex {
        #[cfg(feature = "postgres")]
        Executor::Postgres(ex) => postgres::run_schema(ex, include_str!("postgres.sql")).await,

        #[cfg(any(feature = "sqlite", test))]
        Executor::Sqlite(ex) => sqlite::run_schema(ex, include_str!("sqlite.sql")).await,

        #[allow(unreachable_patterns)]
        _ => unreachable!(),
    }
}

/// Inserts a new job with the serialized argument `json` into `queue` and returns its
/// identifier.
pub(crate) async fn put_new_job(
    ex: &mut Executor,
    queue: &str,
    json: &str,
    created_at: OffsetDateTime,
) -> DbResult<Uuid> {
    let id = Uuid::new_v4();
    match ex {
        #[cfg(feature = "postgres")]
        Executor::Postgres(ex) => {
            let query_str = "
                INSERT INTO work_queue (id, queue_name, job_arg, created_at)
                VALUES ($1, $2, $3, $4)
            ";
            sqlx::query(query_str)
                .bind(id)
                .bind(queue)
                .bind(json)
                .bind(created_at)
                .execute(&mut **ex)
                .await
                .map_err(postgres::map_sqlx_error)?;
        }

        #[cfg(any(feature = "sqlite", test))]
        Executor::Sqlite(ex) => {
            let (created_sec, created_nsec) = unpack_timestamp(created_at)?;

            let query_str = "
                INSERT INTO work_queue (id, queue_name, job_arg, created_sec, created_nsec)
                VALUES (?, ?, ?, ?, ?)
            ";
            sqlx::query(query_str)
                .bind(id)
                .bind(queue)
                .bind(json)
                .bind(created_sec)
                .bind(created_nsec)
                .execute(&mut **ex)
                .await
                .map_err(sqlite::map_sqlx_error)?;
        }

        #[allow(unreachable_patterns)]
        _ => unreachable!(),
    }
    Ok(id)
}

/// Marks the oldest not-yet-started job of `queue` as started at `now` and returns it.
///
/// Rows locked by concurrent claimants are skipped, so two callers never get the same job.  The
/// caller should commit the enclosing transaction right away to release the row lock.
pub(crate) async fn claim_job(
    ex: &mut Executor,
    queue: &str,
    now: OffsetDateTime,
) -> DbResult<Option<ClaimedJob>> {
    match ex {
        #[cfg(feature = "postgres")]
        Executor::Postgres(ex) => {
            let query_str = "
                UPDATE work_queue SET started_at = $2
                WHERE id = (
                    SELECT id FROM work_queue
                    WHERE queue_name = $1 AND started_at IS NULL
                    ORDER BY created_at
                    LIMIT 1
                    FOR UPDATE SKIP LOCKED
                )
                RETURNING id, job_arg
            ";
            let row = sqlx::query(query_str)
                .bind(queue)
                .bind(now)
                .fetch_optional(&mut **ex)
                .await
                .map_err(postgres::map_sqlx_error)?;
            match row {
                Some(row) => {
                    let id: Uuid = row.try_get("id").map_err(postgres::map_sqlx_error)?;
                    let json: String = row.try_get("job_arg").map_err(postgres::map_sqlx_error)?;
                    Ok(Some(ClaimedJob { id, json }))
                }
                None => Ok(None),
            }
        }

        // SQLite serializes all writers so a single update is already exclusive.
        #[cfg(any(feature = "sqlite", test))]
        Executor::Sqlite(ex) => {
            let (now_sec, now_nsec) = unpack_timestamp(now)?;

            let query_str = "
                UPDATE work_queue SET started_sec = ?, started_nsec = ?
                WHERE id = (
                    SELECT id FROM work_queue
                    WHERE queue_name = ? AND started_sec IS NULL
                    ORDER BY created_sec, created_nsec
                    LIMIT 1
                )
                RETURNING id, job_arg
            ";
            let row = sqlx::query(query_str)
                .bind(now_sec)
                .bind(now_nsec)
                .bind(queue)
                .fetch_optional(&mut **ex)
                .await
                .map_err(sqlite::map_sqlx_error)?;
            match row {
                Some(row) => {
                    let id: Uuid = row.try_get("id").map_err(sqlite::map_sqlx_error)?;
                    let json: String = row.try_get("job_arg").map_err(sqlite::map_sqlx_error)?;
                    Ok(Some(ClaimedJob { id, json }))
                }
                None => Ok(None),
            }
        }

        #[allow(unreachable_patterns)]
        _ => unreachable!(),
    }
}

/// Records the completion of the claimed job `id` at `completed_at`, storing its optional
/// `result` until `retain_until`.
pub(crate) async fn complete_job(
    ex: &mut Executor,
    id: Uuid,
    result: Option<&[u8]>,
    completed_at: OffsetDateTime,
    retain_until: OffsetDateTime,
) -> DbResult<()> {
    let affected = match ex {
        #[cfg(feature = "postgres")]
        Executor::Postgres(ex) => {
            let query_str = "
                UPDATE work_queue
                SET result = $2, completed_at = $3, retain_until = $4
                WHERE id = $1 AND started_at IS NOT NULL AND completed_at IS NULL
            ";
            let done = sqlx::query(query_str)
                .bind(id)
                .bind(result)
                .bind(completed_at)
                .bind(retain_until)
                .execute(&mut **ex)
                .await
                .map_err(postgres::map_sqlx_error)?;
            done.rows_affected()
        }

        #[cfg(any(feature = "sqlite", test))]
        Executor::Sqlite(ex) => {
            let (completed_sec, completed_nsec) = unpack_timestamp(completed_at)?;
            let (retain_until_sec, retain_until_nsec) = unpack_timestamp(retain_until)?;

            let query_str = "
                UPDATE work_queue
                SET
                    result = ?,
                    completed_sec = ?, completed_nsec = ?,
                    retain_until_sec = ?, retain_until_nsec = ?
                WHERE id = ? AND started_sec IS NOT NULL AND completed_sec IS NULL
            ";
            let done = sqlx::query(query_str)
                .bind(result)
                .bind(completed_sec)
                .bind(completed_nsec)
                .bind(retain_until_sec)
                .bind(retain_until_nsec)
                .bind(id)
                .execute(&mut **ex)
                .await
                .map_err(sqlite::map_sqlx_error)?;
            done.rows_affected()
        }

        #[allow(unreachable_patterns)]
        _ => unreachable!(),
    };
    ensure_one_update(affected)
}

/// Computes the position of a job given how many unstarted jobs are ahead of it.
fn position(started: bool, ahead: i64) -> DbResult<u64> {
    if started { Ok(0) } else { Ok(count_as_u64(ahead)? + 1) }
}

/// Gets the current status of the job `id`.
pub(crate) async fn get_status(ex: &mut Executor, id: Uuid) -> DbResult<JobStatus> {
    match ex {
        #[cfg(feature = "postgres")]
        Executor::Postgres(ex) => {
            let query_str = "
                SELECT
                    queue_name, created_at, started_at, completed_at,
                    (
                        SELECT COUNT(*) FROM work_queue AS o
                        WHERE
                            o.queue_name = w.queue_name
                            AND o.started_at IS NULL
                            AND o.created_at < w.created_at
                    ) AS ahead
                FROM work_queue AS w
                WHERE id = $1
            ";
            let row = sqlx::query(query_str)
                .bind(id)
                .fetch_optional(&mut **ex)
                .await
                .map_err(postgres::map_sqlx_error)?
                .ok_or(DbError::NotFound)?;

            let queue: String = row.try_get("queue_name").map_err(postgres::map_sqlx_error)?;
            let created_at: OffsetDateTime =
                row.try_get("created_at").map_err(postgres::map_sqlx_error)?;
            let started_at: Option<OffsetDateTime> =
                row.try_get("started_at").map_err(postgres::map_sqlx_error)?;
            let completed_at: Option<OffsetDateTime> =
                row.try_get("completed_at").map_err(postgres::map_sqlx_error)?;
            let ahead: i64 = row.try_get("ahead").map_err(postgres::map_sqlx_error)?;

            Ok(JobStatus {
                id,
                queue,
                position: position(started_at.is_some(), ahead)?,
                created_at,
                started_at,
                completed_at,
            })
        }

        #[cfg(any(feature = "sqlite", test))]
        Executor::Sqlite(ex) => {
            let query_str = "
                SELECT
                    queue_name,
                    created_sec, created_nsec,
                    started_sec, started_nsec,
                    completed_sec, completed_nsec,
                    (
                        SELECT COUNT(*) FROM work_queue AS o
                        WHERE
                            o.queue_name = w.queue_name
                            AND o.started_sec IS NULL
                            AND (
                                o.created_sec < w.created_sec
                                OR (o.created_sec = w.created_sec
                                    AND o.created_nsec < w.created_nsec)
                            )
                    ) AS ahead
                FROM work_queue AS w
                WHERE id = ?
            ";
            let row = sqlx::query(query_str)
                .bind(id)
                .fetch_optional(&mut **ex)
                .await
                .map_err(sqlite::map_sqlx_error)?
                .ok_or(DbError::NotFound)?;

            let queue: String = row.try_get("queue_name").map_err(sqlite::map_sqlx_error)?;
            let created_sec: i64 = row.try_get("created_sec").map_err(sqlite::map_sqlx_error)?;
            let created_nsec: i64 = row.try_get("created_nsec").map_err(sqlite::map_sqlx_error)?;
            let started_sec: Option<i64> =
                row.try_get("started_sec").map_err(sqlite::map_sqlx_error)?;
            let started_nsec: Option<i64> =
                row.try_get("started_nsec").map_err(sqlite::map_sqlx_error)?;
            let completed_sec: Option<i64> =
                row.try_get("completed_sec").map_err(sqlite::map_sqlx_error)?;
            let completed_nsec: Option<i64> =
                row.try_get("completed_nsec").map_err(sqlite::map_sqlx_error)?;
            let ahead: i64 = row.try_get("ahead").map_err(sqlite::map_sqlx_error)?;

            let started_at = build_optional_timestamp(started_sec, started_nsec)?;
            Ok(JobStatus {
                id,
                queue,
                position: position(started_at.is_some(), ahead)?,
                created_at: build_timestamp(created_sec, created_nsec)?,
                started_at,
                completed_at: build_optional_timestamp(completed_sec, completed_nsec)?,
            })
        }

        #[allow(unreachable_patterns)]
        _ => unreachable!(),
    }
}

/// Gets the result stored by the job `id`, if any.
pub(crate) async fn get_result(ex: &mut Executor, id: Uuid) -> DbResult<Option<Vec<u8>>> {
    match ex {
        #[cfg(feature = "postgres")]
        Executor::Postgres(ex) => {
            let query_str = "SELECT result FROM work_queue WHERE id = $1";
            let row = sqlx::query(query_str)
                .bind(id)
                .fetch_optional(&mut **ex)
                .await
                .map_err(postgres::map_sqlx_error)?
                .ok_or(DbError::NotFound)?;
            row.try_get("result").map_err(postgres::map_sqlx_error)
        }

        #[cfg(any(feature = "sqlite", test))]
        Executor::Sqlite(ex) => {
            let query_str = "SELECT result FROM work_queue WHERE id = ?";
            let row = sqlx::query(query_str)
                .bind(id)
                .fetch_optional(&mut **ex)
                .await
                .map_err(sqlite::map_sqlx_error)?
                .ok_or(DbError::NotFound)?;
            row.try_get("result").map_err(sqlite::map_sqlx_error)
        }

        #[allow(unreachable_patterns)]
        _ => unreachable!(),
    }
}

/// Deletes all completed jobs whose retention period ended before `now` and returns how many
/// were deleted.
pub(crate) async fn delete_expired(ex: &mut Executor, now: OffsetDateTime) -> DbResult<u64> {
    match ex {
        #[cfg(feature = "postgres")]
        Executor::Postgres(ex) => {
            let query_str = "DELETE FROM work_queue WHERE retain_until < $1";
            let done = sqlx::query(query_str)
                .bind(now)
                .execute(&mut **ex)
                .await
                .map_err(postgres::map_sqlx_error)?;
            Ok(done.rows_affected())
        }

        #[cfg(any(feature = "sqlite", test))]
        Executor::Sqlite(ex) => {
            let (now_sec, now_nsec) = unpack_timestamp(now)?;

            let query_str = "
                DELETE FROM work_queue
                WHERE
                    retain_until_sec < ?
                    OR (retain_until_sec = ? AND retain_until_nsec < ?)
            ";
            let done = sqlx::query(query_str)
                .bind(now_sec)
                .bind(now_sec)
                .bind(now_nsec)
                .execute(&mut **ex)
                .await
                .map_err(sqlite::map_sqlx_error)?;
            Ok(done.rows_affected())
        }

        #[allow(unreachable_patterns)]
        _ => unreachable!(),
    }
}

/// Returns the jobs of `queue` that were claimed before `started_before` and never completed to
/// the unclaimed state.  Returns how many jobs were requeued.
pub(crate) async fn requeue_stale(
    ex: &mut Executor,
    queue: &str,
    started_before: OffsetDateTime,
) -> DbResult<u64> {
    match ex {
        #[cfg(feature = "postgres")]
        Executor::Postgres(ex) => {
            let query_str = "
                UPDATE work_queue SET started_at = NULL
                WHERE queue_name = $1 AND completed_at IS NULL AND started_at < $2
            ";
            let done = sqlx::query(query_str)
                .bind(queue)
                .bind(started_before)
                .execute(&mut **ex)
                .await
                .map_err(postgres::map_sqlx_error)?;
            Ok(done.rows_affected())
        }

        #[cfg(any(feature = "sqlite", test))]
        Executor::Sqlite(ex) => {
            let (before_sec, before_nsec) = unpack_timestamp(started_before)?;

            let query_str = "
                UPDATE work_queue SET started_sec = NULL, started_nsec = NULL
                WHERE
                    queue_name = ?
                    AND completed_sec IS NULL
                    AND (started_sec < ? OR (started_sec = ? AND started_nsec < ?))
            ";
            let done = sqlx::query(query_str)
                .bind(queue)
                .bind(before_sec)
                .bind(before_sec)
                .bind(before_nsec)
                .execute(&mut **ex)
                .await
                .map_err(sqlite::map_sqlx_error)?;
            Ok(done.rows_affected())
        }

        #[allow(unreachable_patterns)]
        _ => unreachable!(),
    }
}
