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

//! Generic abstraction to access different database systems.
//!
//! The facilities in this module provide an abstraction over different database systems such as
//! PostgreSQL and SQLite.  The PostgreSQL backend is for production use and the SQLite backend is
//! primarily intended to support unit tests.
//!
//! Besides queries and transactions, databases also expose a channel-based notification
//! primitive.  PostgreSQL implements it with `LISTEN`/`NOTIFY`; SQLite has no such thing, so its
//! backend delivers notifications within the process only.  Either way, notifications are
//! best-effort: they can be lost while a listener reconnects.

use async_trait::async_trait;
use futures::Future;
use futures::future::{BoxFuture, FutureExt};

#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod sqlite;

/// Database errors.  Any unexpected errors that come from the database are classified as
/// `BackendError`, but errors we know about have more specific types.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum DbError {
    /// Indicates that a request to create an entry failed because it already exists.
    #[error("Already exists")]
    AlreadyExists,

    /// Catch-all error type for unexpected database errors.
    #[error("Database error: {0}")]
    BackendError(String),

    /// Indicates a failure processing the data that already exists in the database.
    #[error("Data integrity error: {0}")]
    DataIntegrityError(String),

    /// Indicates that a requested entry does not exist.
    #[error("Entity not found")]
    NotFound,

    /// Indicates that the database is not available (maybe because of too many active concurrent
    /// connections).
    #[error("Unavailable")]
    Unavailable,
}

/// Result type for this module.
pub type DbResult<T> = Result<T, DbError>;

/// A notification received on one of the channels a `Listener` subscribed to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Notification {
    /// Name of the channel the notification was published on, as seen by the database.
    pub channel: String,

    /// Raw payload of the notification.
    pub payload: String,
}

/// A live subscription to a set of notification channels.
///
/// Errors returned by `recv` mean that the subscription is broken and that the listener must be
/// discarded.  Notifications published while no listener is active are lost.
#[async_trait]
pub trait Listener: Send {
    /// Waits for the next notification on any of the subscribed channels.
    async fn recv(&mut self) -> DbResult<Notification>;
}

/// A database executor that can talk to multiple database implementations.
///
/// This type provides a generic mechanism to access a typed instance of a database, which is needed
/// by sqlx to offer type safety guarantees during query compilation.  Users of this type are forced
/// to destructure it and issue different calls for each database.
///
/// Note that this can wrap an executor that talks directly to a pool or to an open transaction.
pub enum Executor {
    /// A PostgreSQL executor that can be used in `sqlx` operations.
    #[cfg(feature = "postgres")]
    Postgres(postgres::PostgresExecutor),

    /// A SQLite executor that can be used in `sqlx` operations.
    #[cfg(feature = "sqlite")]
    Sqlite(sqlite::SqliteExecutor),
}

/// Deferred action to run once a transaction commits.
type CommitHook = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// A wrapper for a database executor backed by an open transaction.
///
/// Dropping the executor without calling `commit` rolls back the transaction and discards any
/// hooks registered with `on_commit`.
pub struct TxExecutor {
    /// The executor backed by the open transaction.
    ex: Executor,

    /// Actions to run, in registration order, after a successful commit.
    on_commit: Vec<CommitHook>,
}

impl TxExecutor {
    /// Wraps a transaction-backed executor.
    #[allow(unused)]
    fn new(ex: Executor) -> Self {
        Self { ex, on_commit: vec![] }
    }

    /// Returns the executor wrapped by this transaction.
    ///
    /// This would be better called `executor` but this method is used so frequently that it makes
    /// call sites too verbose.
    pub fn ex(&mut self) -> &mut Executor {
        &mut self.ex
    }

    /// Registers `hook` to run after this transaction commits.
    ///
    /// Hooks never run if the transaction is rolled back or if the commit fails.  Use these to
    /// publish side effects that must not become visible before the data they refer to.
    pub fn on_commit<F, Fut>(&mut self, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_commit.push(Box::new(move || hook().boxed()));
    }

    /// Commits the transaction and then runs the registered commit hooks.
    pub async fn commit(self) -> DbResult<()> {
        match self.ex {
            #[cfg(feature = "postgres")]
            Executor::Postgres(e) => e.commit().await?,

            #[cfg(feature = "sqlite")]
            Executor::Sqlite(e) => e.commit().await?,
        }

        for hook in self.on_commit {
            hook().await;
        }
        Ok(())
    }
}

/// Abstraction over the database connection.
#[async_trait]
pub trait Db: Send + Sync {
    /// Obtains an executor for direct access to the pool.
    ///
    /// This would be better called `executor` but this method is used so frequently that it makes
    /// call sites too verbose.
    async fn ex(&self) -> DbResult<Executor>;

    /// Begins a transaction.
    ///
    /// It is the responsibility of the caller to call `commit` on the returned executor.  Otherwise
    /// the transaction is rolled back on drop.
    async fn begin(&self) -> DbResult<TxExecutor>;

    /// Publishes `payload` on the notification `channel`.
    ///
    /// This happens outside of any transaction so the notification is visible immediately.
    async fn notify(&self, channel: &str, payload: &str) -> DbResult<()>;

    /// Opens a new listener subscribed to all of the given `channels`.
    async fn listen(&self, channels: &[String]) -> DbResult<Box<dyn Listener>>;

    /// Closes the connection pool.
    async fn close(&self);
}

/// Macros to help instantiate tests for multiple database systems.
#[cfg(any(test, feature = "testutils"))]
pub mod testutils {
    pub use paste::paste;

    /// Instantiates the `module::name` test for the database configured by `setup`.
    ///
    /// The `extra` metadata parameter can be used to tag the generated tests.
    #[macro_export]
    macro_rules! generate_one_test [
        ( $name:ident, $setup:expr, $module:path $(, #[$extra:meta] )? ) => {
            #[tokio::test(flavor = "multi_thread")]
            $(#[$extra])?
            async fn $name() {
                $crate::db::testutils::paste! {
                    $module :: [< $name >]($setup).await;
                }
            }
        }
    ];

    pub use generate_one_test;

    /// Instantiates a collection of tests for a specific database system.
    ///
    /// The database implementation to run the tests against is determined by the `setup`
    /// expression, which needs to return the database to use.  The returned database should also
    /// have been initialized with the desired schema.
    ///
    /// The `extra` metadata parameter can be used to tag the generated tests.
    #[macro_export]
    macro_rules! generate_tests [
        ( #[$extra:meta], $setup:expr, $module:path $(, $name:ident)+ ) => {
            $(
                $crate::db::testutils::generate_one_test!($name, $setup, $module, #[$extra]);
            )+
        };

        ( $setup:expr, $module:path $(, $name:ident)+ ) => {
            $(
                $crate::db::testutils::generate_one_test!($name, $setup, $module);
            )+
        };
    ];

    pub use generate_tests;
}
