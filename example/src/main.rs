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

//! Entry point to the sample launcher.
//!
//! Counts the words of every command-line argument by running one job per argument through a
//! queue backed by PostgreSQL.  The database is configured with `PGSQL_PROD_*` variables; the
//! bus, the registry and the queue accept optional `BUS_*`, `REGISTRY_*` and `WORDCOUNT_*`
//! variables.

// Keep these in sync with other top-level files.
#![warn(anonymous_parameters, bad_style, clippy::missing_docs_in_private_items, missing_docs)]
#![warn(unused, unused_extern_crates, unused_import_braces, unused_qualifications)]
#![warn(unsafe_code)]

use log::info;
use pqwork_core::bus::{BusOptions, NotificationBus};
use pqwork_core::clocks::SystemClock;
use pqwork_core::db::Db;
use pqwork_core::db::postgres::{PostgresDb, PostgresOptions};
use pqwork_queue::db::init_schema;
use pqwork_queue::driver::{
    Client, JobContext, QueueOptions, Registry, RegistryOptions, with_time_limit,
};
use pqwork_queue::model::{ExecError, ExecResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

/// Name of the queue that counts words.
const QUEUE_NAME: &str = "wordcount";

/// Maximum time a single job may run.
const JOB_TIME_LIMIT: Duration = Duration::from_secs(10);

/// Period at which to poll for job completion.
const POLL_PERIOD: Duration = Duration::from_millis(100);

/// Result of a word-count job.
#[derive(Deserialize, Serialize)]
struct WordCount {
    /// The text that was processed.
    text: String,

    /// Number of whitespace-separated words in `text`.
    words: usize,
}

/// Counts the words in `text`.
async fn count_words(ctx: JobContext, text: String) -> ExecResult {
    info!("Job {}: counting words", ctx.id());
    let count = WordCount { words: text.split_whitespace().count(), text };
    let json = serde_json::to_vec(&count).map_err(|e| ExecError::Failed(e.to_string()))?;
    Ok(Some(json))
}

/// Adds one job per entry in `texts` and prints their results as they complete.
async fn run(texts: Vec<String>) -> Result<(), Box<dyn Error>> {
    let db_opts = PostgresOptions::from_env("PGSQL_PROD")?;
    let db: Arc<dyn Db> = Arc::from(PostgresDb::connect(db_opts)?);
    init_schema(&mut db.ex().await?).await?;

    let bus = NotificationBus::new(db.clone(), BusOptions::from_env("BUS")?);
    let client = Client::new(db.clone(), Arc::from(SystemClock::default()), bus);
    let registry = Registry::new(client.clone(), RegistryOptions::from_env("REGISTRY")?).await?;
    let queue = registry
        .register_queue(
            QUEUE_NAME,
            QueueOptions::from_env("WORDCOUNT")?,
            count_words,
            vec![with_time_limit(JOB_TIME_LIMIT)],
        )
        .await?;

    let mut ids = Vec::with_capacity(texts.len());
    let mut tx = db.begin().await?;
    for text in &texts {
        ids.push(queue.add(&mut tx, text).await?);
    }
    tx.commit().await?;

    for id in ids {
        while !client.get_status(id).await?.is_done() {
            tokio::time::sleep(POLL_PERIOD).await;
        }
        match client.get_result_json::<WordCount>(id).await {
            Ok(count) => println!("{}: {} words", count.text, count.words),
            Err(e) => println!("Job {} failed: {}", id, e),
        }
    }

    registry.stop();
    client.bus().close();
    db.close().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let texts: Vec<String> = env::args().skip(1).collect();
    if texts.is_empty() {
        return Err("Usage: pqwork-example text1 [.. textN]".into());
    }
    run(texts).await
}
