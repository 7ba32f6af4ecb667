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

//! Common utilities to interact with an SQLite database.
//!
//! SQLite has no native notification channels, so `SqliteDb` delivers notifications to listeners
//! living in the same process only.

use crate::db::{Db, DbError, DbResult, Executor, Listener, Notification, TxExecutor};
use async_trait::async_trait;
use log::warn;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{Sqlite, SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions};
use sqlx::Transaction;
use std::collections::HashSet;
use std::ops::{Deref, DerefMut};
use std::str::FromStr;
use time::OffsetDateTime;
use tokio::sync::broadcast;

/// Maximum number of notifications that can be pending delivery to a slow listener before the
/// listener is considered broken.
const NOTIFICATIONS_CAPACITY: usize = 1024;

/// Takes a raw SQLx error `e` and converts it to our generic error type.
pub fn map_sqlx_error(e: sqlx::Error) -> DbError {
    match e {
        sqlx::Error::ColumnDecode { source, .. } => DbError::DataIntegrityError(source.to_string()),
        sqlx::Error::PoolTimedOut => DbError::Unavailable,
        sqlx::Error::RowNotFound => DbError::NotFound,
        e if e.to_string().contains("FOREIGN KEY constraint failed") => DbError::NotFound,
        e if e.to_string().contains("UNIQUE constraint failed") => DbError::AlreadyExists,
        e => DbError::BackendError(e.to_string()),
    }
}

/// Creates a new connection to the database identified by `conn_str`.
///
/// The pool holds a single connection at all times: SQLite serializes writers anyway, and in-memory
/// databases vanish as soon as their last connection closes.
pub async fn connect(conn_str: &str) -> DbResult<SqliteDb> {
    let options = SqliteConnectOptions::from_str(conn_str).map_err(map_sqlx_error)?;
    let pool = SqlitePoolOptions::new()
        .min_connections(1)
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .map_err(map_sqlx_error)?;
    let (notifications, _) = broadcast::channel(NOTIFICATIONS_CAPACITY);
    Ok(SqliteDb { pool, notifications })
}

/// A generic database executor implementation for SQLite.
///
/// Queries run against the underlying connection, which is reachable via `Deref`.
#[derive(Debug)]
pub enum SqliteExecutor {
    /// An executor backed by a pool.  Operations issued via this executor aren't guaranteed to
    /// happen on the same connection.
    PoolExec(PoolConnection<Sqlite>),

    /// An executor backed by a transaction.
    TxExec(Transaction<'static, Sqlite>),
}

impl SqliteExecutor {
    /// Commits the transaction if this executor is backed by one.
    pub(super) async fn commit(self) -> DbResult<()> {
        match self {
            SqliteExecutor::PoolExec(_) => {
                Err(DbError::BackendError("Cannot commit a non-transactional executor".to_owned()))
            }
            SqliteExecutor::TxExec(tx) => tx.commit().await.map_err(map_sqlx_error),
        }
    }
}

impl Deref for SqliteExecutor {
    type Target = SqliteConnection;

    fn deref(&self) -> &Self::Target {
        match self {
            SqliteExecutor::PoolExec(conn) => conn,
            SqliteExecutor::TxExec(tx) => tx,
        }
    }
}

impl DerefMut for SqliteExecutor {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self {
            SqliteExecutor::PoolExec(conn) => conn,
            SqliteExecutor::TxExec(tx) => tx,
        }
    }
}

/// An in-process notification listener.
struct SqliteListener {
    /// Stream of all notifications published on the database.
    rx: broadcast::Receiver<Notification>,

    /// Channels this listener cares about.
    channels: HashSet<String>,
}

#[async_trait]
impl Listener for SqliteListener {
    async fn recv(&mut self) -> DbResult<Notification> {
        loop {
            match self.rx.recv().await {
                Ok(n) if self.channels.contains(&n.channel) => return Ok(n),
                Ok(_) => (),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    return Err(DbError::BackendError(format!(
                        "Listener fell behind by {} notifications",
                        n
                    )));
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(DbError::BackendError("Notifications source is gone".to_owned()));
                }
            }
        }
    }
}

/// A database instance backed by an SQLite database.
pub struct SqliteDb {
    /// Shared SQLite connection pool.  This is a cloneable type that all concurrent
    /// transactions can use concurrently.
    pool: SqlitePool,

    /// Fan-out point for notifications published via `notify`.
    notifications: broadcast::Sender<Notification>,
}

impl SqliteDb {
    /// Returns an executor of the specific type used by this database.
    pub async fn typed_ex(&self) -> DbResult<SqliteExecutor> {
        let conn = self.pool.acquire().await.map_err(map_sqlx_error)?;
        Ok(SqliteExecutor::PoolExec(conn))
    }
}

impl Drop for SqliteDb {
    fn drop(&mut self) {
        if !self.pool.is_closed() {
            warn!("Dropping connection without having called close() first");
        }
    }
}

#[async_trait]
impl Db for SqliteDb {
    async fn ex(&self) -> DbResult<Executor> {
        let ex = self.typed_ex().await?;
        Ok(Executor::Sqlite(ex))
    }

    async fn begin(&self) -> DbResult<TxExecutor> {
        let tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        Ok(TxExecutor::new(Executor::Sqlite(SqliteExecutor::TxExec(tx))))
    }

    async fn notify(&self, channel: &str, payload: &str) -> DbResult<()> {
        let n = Notification { channel: channel.to_owned(), payload: payload.to_owned() };
        // Sending only fails when nobody is listening, in which case the notification is lost
        // just like it would be in PostgreSQL.
        let _ = self.notifications.send(n);
        Ok(())
    }

    async fn listen(&self, channels: &[String]) -> DbResult<Box<dyn Listener>> {
        Ok(Box::new(SqliteListener {
            rx: self.notifications.subscribe(),
            channels: channels.iter().cloned().collect(),
        }))
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// Helper function to initialize the database with a schema.
pub async fn run_schema(e: &mut SqliteExecutor, schema: &str) -> DbResult<()> {
    sqlx::raw_sql(schema).execute(&mut **e).await.map_err(map_sqlx_error)?;
    Ok(())
}

/// Converts a timestamp as extracted from the database into an `OffsetDateTime`.
///
/// The input parameters must both be positive.  The reason why their types are `i64`s instead of
/// the `u64` you would expect is because the numeric types exposed by sqlx and SQLite are all
/// signed.  We could simply cast the types and accept negative representations in the database,
/// but that would pose difficulties when attempting to compare timestamps via relation operators
/// in SQL queries.
pub fn build_timestamp(timestamp_sec: i64, timestamp_nsec: i64) -> DbResult<OffsetDateTime> {
    if timestamp_sec < 0 || timestamp_nsec < 0 {
        return Err(DbError::DataIntegrityError(format!(
            "Timestamp cannot have negative quantities: sec={}, nsec={}",
            timestamp_sec, timestamp_nsec
        )));
    }

    match OffsetDateTime::from_unix_timestamp_nanos(
        (i128::from(timestamp_sec) * 1_000_000_000) + (i128::from(timestamp_nsec)),
    ) {
        Ok(timestamp) => Ok(timestamp),
        Err(e) => Err(DbError::DataIntegrityError(format!("Invalid timestamp: {}", e))),
    }
}

/// Converts an optional timestamp as extracted from the database.  Both parts must be either
/// present or absent.
pub fn build_optional_timestamp(
    timestamp_sec: Option<i64>,
    timestamp_nsec: Option<i64>,
) -> DbResult<Option<OffsetDateTime>> {
    match (timestamp_sec, timestamp_nsec) {
        (Some(sec), Some(nsec)) => Ok(Some(build_timestamp(sec, nsec)?)),
        (None, None) => Ok(None),
        (sec, nsec) => Err(DbError::DataIntegrityError(format!(
            "Inconsistent timestamp parts: sec={:?}, nsec={:?}",
            sec, nsec
        ))),
    }
}

/// Converts a timestamp into the seconds and nanoseconds pair needed by the database.
///
/// The timestamp must be positive because `build_timestamp` also expects it to be positive when
/// recovering its values from the database.
pub fn unpack_timestamp(ts: OffsetDateTime) -> DbResult<(i64, i64)> {
    let nanos = ts.unix_timestamp_nanos();
    if nanos < 0 {
        return Err(DbError::BackendError(format!(
            "Cannot store a negative timestamp into the database: {}",
            ts
        )));
    }
    match (i64::try_from(nanos / 1_000_000_000), i64::try_from(nanos % 1_000_000_000)) {
        (Ok(sec), Ok(nsec)) => Ok((sec, nsec)),
        _ => Err(DbError::BackendError(format!("Timestamp out of range: {}", ts))),
    }
}

/// Test utilities for the SQLite connection.
#[cfg(any(feature = "testutils", test))]
pub mod testutils {
    use super::*;

    /// Initializes the test database.
    pub async fn setup() -> SqliteDb {
        let _can_fail = env_logger::builder().is_test(true).try_init();
        connect(":memory:").await.unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::testutils::*;
    use super::*;
    use crate::db::tests::{generate_db_ro_concurrent_tests, generate_db_rw_tests};
    use std::sync::Arc;
    use std::time::Duration;

    generate_db_ro_concurrent_tests!({
        let db: Arc<dyn Db> = Arc::from(setup().await);
        db
    });

    generate_db_rw_tests!({
        let db: Arc<dyn Db> = Arc::from(setup().await);
        db
    });

    #[tokio::test]
    async fn test_listener_lagging_is_an_error() {
        let db = setup().await;
        let mut listener = db.listen(&["chan".to_owned()]).await.unwrap();
        for i in 0..(NOTIFICATIONS_CAPACITY + 1) {
            db.notify("chan", &i.to_string()).await.unwrap();
        }
        match listener.recv().await {
            Err(DbError::BackendError(e)) => assert!(e.contains("fell behind")),
            e => panic!("Must have failed with a BackendError but got: {:?}", e),
        }
        db.close().await;
    }

    #[tokio::test]
    async fn test_listener_ignores_other_channels() {
        let db = setup().await;
        let mut listener = db.listen(&["wanted".to_owned()]).await.unwrap();
        db.notify("unwanted", "1").await.unwrap();
        assert!(
            tokio::time::timeout(Duration::from_millis(10), listener.recv()).await.is_err(),
            "Notification for another channel was delivered"
        );
        db.close().await;
    }

    #[test]
    fn test_build_unpack_timestamp_zero() {
        let d = OffsetDateTime::from_unix_timestamp(0).unwrap();
        let (secs, nsecs) = unpack_timestamp(d).unwrap();
        assert_eq!(0, secs);
        assert_eq!(0, nsecs);
        assert_eq!(Ok(d), build_timestamp(secs, nsecs));
    }

    #[test]
    fn test_build_unpack_timestamp_nsecs_precision() {
        let d = OffsetDateTime::from_unix_timestamp_nanos(1234567899876543215i128).unwrap();
        let (secs, nsecs) = unpack_timestamp(d).unwrap();
        assert_eq!(1234567899i64, secs);
        assert_eq!(876543215i64, nsecs);
        assert_eq!(Ok(d), build_timestamp(secs, nsecs));
    }

    #[test]
    fn test_unpack_timestamp_negative() {
        let d = OffsetDateTime::from_unix_timestamp(-1).unwrap();
        unpack_timestamp(d).unwrap_err();
    }

    #[test]
    fn test_build_timestamp_negative() {
        match build_timestamp(-1, 0) {
            Err(DbError::DataIntegrityError(_)) => (),
            e => panic!("Must have failed with a DataIntegrityError but got: {:?}", e),
        }

        match build_timestamp(0, -1) {
            Err(DbError::DataIntegrityError(_)) => (),
            e => panic!("Must have failed with a DataIntegrityError but got: {:?}", e),
        }
    }

    #[test]
    fn test_build_optional_timestamp() {
        assert_eq!(Ok(None), build_optional_timestamp(None, None));
        assert_eq!(
            Ok(Some(OffsetDateTime::from_unix_timestamp(5).unwrap())),
            build_optional_timestamp(Some(5), Some(0))
        );
        match build_optional_timestamp(Some(5), None) {
            Err(DbError::DataIntegrityError(_)) => (),
            e => panic!("Must have failed with a DataIntegrityError but got: {:?}", e),
        }
    }
}
