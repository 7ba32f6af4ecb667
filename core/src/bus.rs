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

//! Publish/subscribe bus layered over the database's notification channels.
//!
//! The bus keeps a single database listener subscribed to every channel that has ever been
//! subscribed to through it, and fans out incoming payloads to local subscribers via a `Demux`
//! per channel.  The listener is re-established whenever it fails or whenever the set of channel
//! names changes.
//!
//! Delivery is at-most-once: notifications published while the listener is reconnecting are
//! lost.  Callers must use the bus to reduce latency, never as the only means to learn about
//! work.

use crate::db::{Db, Notification};
use crate::demux::{DEFAULT_BUFFER, Demux, DemuxOptions};
use crate::driver::{DriverError, DriverResult};
use crate::env::get_optional_var;
use log::{debug, warn};
use regex::Regex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::sync::{Notify, RwLock, mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Prefix prepended to all channel names on the wire to avoid clashes with other applications
/// that share the database.
pub const CHANNEL_PREFIX: &str = "pqchan_";

/// Default value for the `reconnect_delay` configuration property.
const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Valid channel names.
static CHANNEL_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[A-Za-z_0-9]+$").expect("Hardcoded regex must be valid"));

/// Ensures that `channel` is a valid channel name.
fn validate_channel(channel: &str) -> DriverResult<()> {
    if !CHANNEL_NAME_RE.is_match(channel) {
        return Err(DriverError::InvalidInput(format!("Invalid channel name '{}'", channel)));
    }
    Ok(())
}

/// Configuration for the notification bus.
#[derive(Clone, Debug, PartialEq)]
pub struct BusOptions {
    /// Capacity of every subscriber's buffer.
    pub buffer: usize,

    /// Whether subscribers that fall behind miss notifications instead of stalling the bus.
    pub lossy: bool,

    /// Time to wait before re-establishing a failed listener.
    pub reconnect_delay: Duration,
}

impl Default for BusOptions {
    fn default() -> Self {
        Self { buffer: DEFAULT_BUFFER, lossy: false, reconnect_delay: DEFAULT_RECONNECT_DELAY }
    }
}

impl BusOptions {
    /// Creates a new set of options from environment variables whose name is prefixed with the
    /// given `prefix`.
    ///
    /// This will use variables such as `<prefix>_BUFFER`, `<prefix>_LOSSY` and
    /// `<prefix>_RECONNECT_DELAY`.  All of them are optional.
    pub fn from_env(prefix: &str) -> Result<Self, String> {
        Ok(Self {
            buffer: get_optional_var::<usize>(prefix, "BUFFER")?.unwrap_or(DEFAULT_BUFFER),
            lossy: get_optional_var::<bool>(prefix, "LOSSY")?.unwrap_or(false),
            reconnect_delay: get_optional_var::<Duration>(prefix, "RECONNECT_DELAY")?
                .unwrap_or(DEFAULT_RECONNECT_DELAY),
        })
    }
}

/// State shared between the bus handles and the background listener task.
struct Inner {
    /// Database providing the notification primitive.
    db: Arc<dyn Db>,

    /// Configuration of the bus.
    opts: BusOptions,

    /// Local fan-out points keyed by unprefixed channel name.
    outputs: RwLock<HashMap<String, Arc<Demux<String>>>>,

    /// Signal to tell the listener task that `outputs` gained new channel names.
    names_changed: Notify,

    /// Unprefixed channel names the current database listener is subscribed to.
    active: watch::Sender<HashSet<String>>,

    /// Token to terminate the listener task and all subscriptions.
    shutdown: CancellationToken,
}

impl Inner {
    /// Delivers `n` to the local subscribers of its channel, if any.
    async fn dispatch(&self, n: Notification) {
        let Some(channel) = n.channel.strip_prefix(CHANNEL_PREFIX) else {
            debug!("Ignoring notification on foreign channel {}", n.channel);
            return;
        };

        let demux = self.outputs.read().await.get(channel).cloned();
        match demux {
            Some(demux) => demux.send(n.payload).await,
            None => debug!("Ignoring notification on unknown channel {}", channel),
        }
    }

    /// Waits for `delay` unless the bus is shut down first.  Returns false on shutdown.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            () = self.shutdown.cancelled() => false,
            () = tokio::time::sleep(delay) => true,
        }
    }

    /// Body of the background listener task.
    async fn run(self: Arc<Self>) {
        'reconnect: loop {
            // Register interest in name changes before reading the names so that no subscription
            // can slip in between.
            let changed = self.names_changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            let names: HashSet<String> = self.outputs.read().await.keys().cloned().collect();
            if names.is_empty() {
                tokio::select! {
                    () = self.shutdown.cancelled() => break 'reconnect,
                    () = changed.as_mut() => continue 'reconnect,
                }
            }

            let wire_names: Vec<String> =
                names.iter().map(|name| format!("{}{}", CHANNEL_PREFIX, name)).collect();
            let mut listener = match self.db.listen(&wire_names).await {
                Ok(listener) => listener,
                Err(e) => {
                    warn!(
                        "Failed to listen for notifications; retrying in {:?}: {}",
                        self.opts.reconnect_delay, e
                    );
                    self.active.send_replace(HashSet::default());
                    if !self.pause(self.opts.reconnect_delay).await {
                        break 'reconnect;
                    }
                    continue 'reconnect;
                }
            };
            debug!("Listening for notifications on {} channels", names.len());
            self.active.send_replace(names);

            loop {
                tokio::select! {
                    () = self.shutdown.cancelled() => break 'reconnect,

                    () = changed.as_mut() => continue 'reconnect,

                    result = listener.recv() => match result {
                        Ok(n) => self.dispatch(n).await,
                        Err(e) => {
                            warn!(
                                "Lost notifications listener; reconnecting in {:?}: {}",
                                self.opts.reconnect_delay, e
                            );
                            self.active.send_replace(HashSet::default());
                            if !self.pause(self.opts.reconnect_delay).await {
                                break 'reconnect;
                            }
                            continue 'reconnect;
                        }
                    },
                }
            }
        }

        self.active.send_replace(HashSet::default());
        debug!("Notification bus stopped");
    }
}

/// A subscription to a single channel of the bus.
///
/// Dropping the subscription unregisters it.
pub struct Subscription {
    /// Unprefixed name of the channel this subscription is for.
    channel: String,

    /// Stream of payloads published on the channel.
    rx: mpsc::Receiver<String>,

    /// Token that keeps this subscription registered until cancelled.
    lifetime: CancellationToken,

    /// Channel names the bus is currently listening on.
    active: watch::Receiver<HashSet<String>>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.lifetime.cancel();
    }
}

impl Subscription {
    /// Returns the name of the channel this subscription is for.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Waits for the next payload.  Returns `None` once the subscription has been cancelled or
    /// the bus has been closed, after all buffered payloads have been consumed.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Waits for the next payload and deserializes it from JSON.
    pub async fn recv_json<V: DeserializeOwned>(&mut self) -> Option<DriverResult<V>> {
        let payload = self.recv().await?;
        Some(serde_json::from_str(&payload).map_err(|e| {
            DriverError::InvalidInput(format!("Invalid JSON payload on {}: {}", self.channel, e))
        }))
    }

    /// Waits until the bus is actively listening on this subscription's channel.
    ///
    /// Notifications published before this returns may or may not be delivered.
    pub async fn ready(&mut self) -> DriverResult<()> {
        let channel = &self.channel;
        tokio::select! {
            biased;

            () = self.lifetime.cancelled() => {
                Err(DriverError::BackendError("Subscription was cancelled".to_owned()))
            }
            result = self.active.wait_for(|names| names.contains(channel)) => match result {
                Ok(_) => Ok(()),
                Err(_) => Err(DriverError::BackendError("Notification bus is gone".to_owned())),
            },
        }
    }

    /// Cancels this subscription.  Payloads that were already buffered remain readable.
    pub fn cancel(&self) {
        self.lifetime.cancel();
    }
}

/// Publish/subscribe bus over the database's notification channels.
///
/// This is a cheap handle that can be cloned freely.  The background listener task keeps running
/// until `close` is called.
#[derive(Clone)]
pub struct NotificationBus {
    /// Shared state.
    inner: Arc<Inner>,
}

impl NotificationBus {
    /// Creates a new bus on top of `db` and starts its background listener task.
    ///
    /// No database connection is held until the first subscription happens.
    pub fn new(db: Arc<dyn Db>, opts: BusOptions) -> Self {
        let (active, _) = watch::channel(HashSet::default());
        let inner = Arc::from(Inner {
            db,
            opts,
            outputs: RwLock::new(HashMap::default()),
            names_changed: Notify::new(),
            active,
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(inner.clone().run());
        Self { inner }
    }

    /// Publishes `payload` on `channel`.
    pub async fn publish(&self, channel: &str, payload: &str) -> DriverResult<()> {
        validate_channel(channel)?;
        let wire_name = format!("{}{}", CHANNEL_PREFIX, channel);
        self.inner.db.notify(&wire_name, payload).await?;
        Ok(())
    }

    /// Publishes the JSON serialization of `value` on `channel`.
    pub async fn publish_json<V: Serialize + Sync>(
        &self,
        channel: &str,
        value: &V,
    ) -> DriverResult<()> {
        let payload = serde_json::to_string(value)
            .map_err(|e| DriverError::InvalidInput(format!("Cannot serialize payload: {}", e)))?;
        self.publish(channel, &payload).await
    }

    /// Subscribes to `channel`.
    ///
    /// Channels stay subscribed at the database level for the lifetime of the bus even after all
    /// of their local subscriptions are gone.
    pub async fn subscribe(&self, channel: &str) -> DriverResult<Subscription> {
        validate_channel(channel)?;
        if self.inner.shutdown.is_cancelled() {
            return Err(DriverError::BackendError("Notification bus is closed".to_owned()));
        }

        let demux = {
            let mut outputs = self.inner.outputs.write().await;
            match outputs.get(channel) {
                Some(demux) => demux.clone(),
                None => {
                    let demux = Arc::from(Demux::new(DemuxOptions {
                        lossy: self.inner.opts.lossy,
                        buffer: self.inner.opts.buffer,
                    }));
                    outputs.insert(channel.to_owned(), demux.clone());
                    self.inner.names_changed.notify_waiters();
                    demux
                }
            }
        };

        let lifetime = self.inner.shutdown.child_token();
        let rx = demux.receive(lifetime.clone()).await;
        Ok(Subscription {
            channel: channel.to_owned(),
            rx,
            lifetime,
            active: self.inner.active.subscribe(),
        })
    }

    /// Stops the background listener task and cancels all subscriptions.
    pub fn close(&self) {
        self.inner.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_channel() {
        validate_channel("abc").unwrap();
        validate_channel("Some_Queue_123").unwrap();
        for name in ["", "with space", "with-dash", "dot.ted", "semi;colon", "ñ"] {
            match validate_channel(name) {
                Err(DriverError::InvalidInput(e)) => assert!(e.contains("Invalid channel name")),
                e => panic!("Must have failed with InvalidInput for '{}' but got {:?}", name, e),
            }
        }
    }

    #[test]
    fn test_bus_options_from_env_defaults() {
        temp_env::with_vars(
            [("BUS_BUFFER", None::<&str>), ("BUS_LOSSY", None), ("BUS_RECONNECT_DELAY", None)],
            || {
                assert_eq!(BusOptions::default(), BusOptions::from_env("BUS").unwrap());
            },
        );
    }

    #[test]
    fn test_bus_options_from_env_all_present() {
        temp_env::with_vars(
            [
                ("BUS_BUFFER", Some("17")),
                ("BUS_LOSSY", Some("true")),
                ("BUS_RECONNECT_DELAY", Some("250ms")),
            ],
            || {
                assert_eq!(
                    BusOptions {
                        buffer: 17,
                        lossy: true,
                        reconnect_delay: Duration::from_millis(250),
                    },
                    BusOptions::from_env("BUS").unwrap()
                );
            },
        );
    }

    #[test]
    fn test_bus_options_from_env_bad_value() {
        temp_env::with_var("BUS_LOSSY", Some("maybe"), || {
            let err = BusOptions::from_env("BUS").unwrap_err();
            assert!(err.contains("BUS_LOSSY"));
        });
    }
}

#[cfg(all(test, feature = "sqlite"))]
mod sqlite_tests {
    use super::*;
    use crate::db::sqlite::testutils::setup;
    use crate::db::{DbError, DbResult, Executor, Listener, TxExecutor};
    use async_trait::async_trait;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Maximum time to wait for any asynchronous event in these tests.
    const TIMEOUT: Duration = Duration::from_secs(10);

    /// Options to make tests that reconnect quick.
    fn fast_opts() -> BusOptions {
        BusOptions { reconnect_delay: Duration::from_millis(1), ..Default::default() }
    }

    /// Waits for the next payload on `sub` with a timeout.
    async fn recv(sub: &mut Subscription) -> Option<String> {
        tokio::time::timeout(TIMEOUT, sub.recv()).await.unwrap()
    }

    /// Creates a subscription to `channel` and waits for it to be ready.
    async fn subscribe_ready(bus: &NotificationBus, channel: &str) -> Subscription {
        let mut sub = bus.subscribe(channel).await.unwrap();
        tokio::time::timeout(TIMEOUT, sub.ready()).await.unwrap().unwrap();
        sub
    }

    #[tokio::test]
    async fn test_publish_and_subscribe() {
        let db: Arc<dyn Db> = Arc::from(setup().await);
        let bus = NotificationBus::new(db.clone(), fast_opts());

        let mut sub = subscribe_ready(&bus, "chan").await;
        assert_eq!("chan", sub.channel());
        bus.publish("chan", "first").await.unwrap();
        bus.publish("chan", "second").await.unwrap();
        assert_eq!(Some("first".to_owned()), recv(&mut sub).await);
        assert_eq!(Some("second".to_owned()), recv(&mut sub).await);

        bus.close();
        db.close().await;
    }

    #[tokio::test]
    async fn test_many_subscribers_and_channels() {
        let db: Arc<dyn Db> = Arc::from(setup().await);
        let bus = NotificationBus::new(db.clone(), fast_opts());

        let mut sub_a1 = subscribe_ready(&bus, "a").await;
        let mut sub_a2 = subscribe_ready(&bus, "a").await;
        let mut sub_b = subscribe_ready(&bus, "b").await;
        // Subscribing to b re-establishes the listener so wait for both channels again.
        tokio::time::timeout(TIMEOUT, sub_a1.ready()).await.unwrap().unwrap();

        bus.publish("b", "for b").await.unwrap();
        bus.publish("a", "for a").await.unwrap();
        assert_eq!(Some("for a".to_owned()), recv(&mut sub_a1).await);
        assert_eq!(Some("for a".to_owned()), recv(&mut sub_a2).await);
        assert_eq!(Some("for b".to_owned()), recv(&mut sub_b).await);
        assert!(
            tokio::time::timeout(Duration::from_millis(10), sub_b.recv()).await.is_err(),
            "Channel b received a notification for a"
        );

        bus.close();
        db.close().await;
    }

    #[tokio::test]
    async fn test_foreign_channels_are_ignored() {
        let db: Arc<dyn Db> = Arc::from(setup().await);
        let bus = NotificationBus::new(db.clone(), fast_opts());

        let mut sub = subscribe_ready(&bus, "chan").await;
        db.notify("chan", "unprefixed").await.unwrap();
        bus.publish("chan", "prefixed").await.unwrap();
        assert_eq!(Some("prefixed".to_owned()), recv(&mut sub).await);

        bus.close();
        db.close().await;
    }

    #[tokio::test]
    async fn test_invalid_channel_names() {
        let db: Arc<dyn Db> = Arc::from(setup().await);
        let bus = NotificationBus::new(db.clone(), fast_opts());

        match bus.subscribe("no-dashes").await {
            Err(DriverError::InvalidInput(_)) => (),
            Err(e) => panic!("Must have failed with InvalidInput but got {:?}", e),
            Ok(_) => panic!("Must have failed"),
        }
        assert_eq!(
            Err(DriverError::InvalidInput("Invalid channel name ''".to_owned())),
            bus.publish("", "payload").await
        );

        bus.close();
        db.close().await;
    }

    #[tokio::test]
    async fn test_json_payloads() {
        #[derive(Debug, Deserialize, PartialEq, Serialize)]
        struct Message {
            id: u32,
            text: String,
        }

        let db: Arc<dyn Db> = Arc::from(setup().await);
        let bus = NotificationBus::new(db.clone(), fast_opts());

        let mut sub = subscribe_ready(&bus, "json").await;
        let msg = Message { id: 5, text: "hello".to_owned() };
        bus.publish_json("json", &msg).await.unwrap();
        bus.publish("json", "not json").await.unwrap();

        let got = tokio::time::timeout(TIMEOUT, sub.recv_json::<Message>()).await.unwrap();
        assert_eq!(Some(Ok(msg)), got);
        match tokio::time::timeout(TIMEOUT, sub.recv_json::<Message>()).await.unwrap() {
            Some(Err(DriverError::InvalidInput(e))) => assert!(e.contains("Invalid JSON")),
            e => panic!("Must have failed with InvalidInput but got {:?}", e),
        }

        bus.close();
        db.close().await;
    }

    #[tokio::test]
    async fn test_cancel_subscription() {
        let db: Arc<dyn Db> = Arc::from(setup().await);
        let bus = NotificationBus::new(db.clone(), fast_opts());

        let mut sub1 = subscribe_ready(&bus, "chan").await;
        let mut sub2 = subscribe_ready(&bus, "chan").await;
        sub1.cancel();
        assert_eq!(None, recv(&mut sub1).await);

        bus.publish("chan", "still here").await.unwrap();
        assert_eq!(Some("still here".to_owned()), recv(&mut sub2).await);

        bus.close();
        db.close().await;
    }

    #[tokio::test]
    async fn test_close_ends_subscriptions() {
        let db: Arc<dyn Db> = Arc::from(setup().await);
        let bus = NotificationBus::new(db.clone(), fast_opts());

        let mut sub = subscribe_ready(&bus, "chan").await;
        bus.close();
        assert_eq!(None, recv(&mut sub).await);
        sub.ready().await.unwrap_err();
        match bus.subscribe("chan").await {
            Err(DriverError::BackendError(e)) => assert!(e.contains("closed")),
            Err(e) => panic!("Must have failed with BackendError but got {:?}", e),
            Ok(_) => panic!("Must have failed"),
        }

        db.close().await;
    }

    /// A database whose first `listen` calls fail.
    struct FlakyDb {
        /// The database to delegate to.
        inner: Arc<dyn Db>,

        /// Number of `listen` calls that still have to fail.
        failures: AtomicUsize,

        /// Total number of `listen` calls.
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Db for FlakyDb {
        async fn ex(&self) -> DbResult<Executor> {
            self.inner.ex().await
        }

        async fn begin(&self) -> DbResult<TxExecutor> {
            self.inner.begin().await
        }

        async fn notify(&self, channel: &str, payload: &str) -> DbResult<()> {
            self.inner.notify(channel, payload).await
        }

        async fn listen(&self, channels: &[String]) -> DbResult<Box<dyn Listener>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let failed = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failed {
                return Err(DbError::Unavailable);
            }
            self.inner.listen(channels).await
        }

        async fn close(&self) {
            self.inner.close().await
        }
    }

    #[tokio::test]
    async fn test_reconnect_after_listen_failures() {
        let sqlite: Arc<dyn Db> = Arc::from(setup().await);
        let db = Arc::from(FlakyDb {
            inner: sqlite.clone(),
            failures: AtomicUsize::new(3),
            calls: AtomicUsize::new(0),
        });
        let bus = NotificationBus::new(db.clone(), fast_opts());

        let mut sub = subscribe_ready(&bus, "chan").await;
        assert!(db.calls.load(Ordering::SeqCst) >= 4);
        bus.publish("chan", "made it").await.unwrap();
        assert_eq!(Some("made it".to_owned()), recv(&mut sub).await);

        bus.close();
        sqlite.close().await;
    }
}
