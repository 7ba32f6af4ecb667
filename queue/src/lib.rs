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

//! A persistent, notification-driven job queue.
//!
//! This crate provides facilities to implement a persistent job queue backed by a database.
//!
//! Producers use a `driver::Queue` handle, obtained from a `driver::Client`, to add jobs from
//! within their own transactions.  Workers wake up when the transaction commits thanks to a
//! notification published on the database's notification bus.
//!
//! Consumers register their queues with a `driver::Registry`, which claims jobs from the database
//! using row-level locks so that any number of processes can share the same queues safely.  The
//! registry also sweeps all queues periodically because notifications can be lost, and it
//! deletes jobs whose results have outlived their retention period.
//!
//! Jobs run at most once: a job that fails is still recorded as completed.

// Keep these in sync with other top-level files.
#![warn(anonymous_parameters, bad_style, clippy::missing_docs_in_private_items, missing_docs)]
#![warn(unused, unused_extern_crates, unused_import_braces, unused_qualifications)]
#![warn(unsafe_code)]

pub mod db;
pub mod driver;
pub mod model;
