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

//! Provides the queue client and the registry of queue workers.

mod client;
pub use client::{Client, Queue, WORKQUEUE_CHANNEL};

mod context;
pub use context::{ExecFn, JobContext, Middleware, in_transaction, with_time_limit};

mod registry;
pub use registry::{QueueOptions, Registry, RegistryOptions};
