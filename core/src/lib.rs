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

//! Building blocks for database-backed background processing.
//!
//! Services built on top of this crate follow a layered architecture and should structure their
//! code to have these modules as well:
//!
//! 1.  `model`: This is the base layer, providing high-level data types that represent concepts in
//!     the domain of the application.  There should be no logic in here.
//!
//! 1.  `db`: This is the persistence layer.  Services provide free functions that take an
//!     `Executor` and issue the queries for every supported database.
//!
//! 1.  `driver`: This is the business logic layer.  Services provide their own driver types to
//!     encapsulate all of the in-memory state required by the app and to coordinate access to the
//!     database.
//!
//! On top of the layers, this crate offers the concurrency primitives that the queue needs:
//!
//! *   `demux`: fans out one stream of values to many independent consumers.
//! *   `bus`: a publish/subscribe bus layered over the database's native notification channels.
//! *   `worker`: a single-threaded background worker triggered by an interval or on demand.
//!
//! There are result and error types in every layer, such as `DbResult` and `DbError`.  Errors can
//! transparently float to the top of the app using the `?` operator.

// Keep these in sync with other top-level files.
#![warn(anonymous_parameters, bad_style, clippy::missing_docs_in_private_items, missing_docs)]
#![warn(unused, unused_extern_crates, unused_import_braces, unused_qualifications)]
#![warn(unsafe_code)]

pub mod bus;
pub mod clocks;
pub mod db;
pub mod demux;
pub mod driver;
pub mod env;
pub mod worker;
