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

//! Fan-out of a single stream of values to many independent consumers.

use log::debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

/// Default number of values that a consumer can have pending before it is considered full.
pub const DEFAULT_BUFFER: usize = 5;

/// Configuration for a `Demux`.
#[derive(Clone, Debug, PartialEq)]
pub struct DemuxOptions {
    /// Whether `send` skips consumers with a full buffer instead of waiting for them.
    pub lossy: bool,

    /// Capacity of every consumer's buffer.  Values below 1 are treated as 1.
    pub buffer: usize,
}

impl Default for DemuxOptions {
    fn default() -> Self {
        Self { lossy: false, buffer: DEFAULT_BUFFER }
    }
}

/// A registered consumer.
struct Output<T> {
    /// Unique identifier of this consumer within its demux.
    id: u64,

    /// Sending side of the consumer's buffer.  Dropping it closes the consumer's stream.
    tx: mpsc::Sender<T>,

    /// Token that ends this consumer's registration when cancelled.
    lifetime: CancellationToken,
}

/// Type of the shared list of consumers.
type Outputs<T> = Mutex<Vec<Output<T>>>;

/// Broadcasts values to all currently-registered consumers.
///
/// In blocking mode, `send` waits until every consumer has accepted the value, which means that
/// a consumer that stops reading without ending its lifetime stalls all senders.  In lossy mode,
/// consumers whose buffers are full miss the value instead.
pub struct Demux<T> {
    /// Registered consumers.  The lock is held during a whole broadcast so that every value is
    /// delivered to a consistent set of consumers.
    outputs: Arc<Outputs<T>>,

    /// Identifier to assign to the next consumer.
    next_id: AtomicU64,

    /// Configuration of this demux.
    opts: DemuxOptions,
}

impl<T: Clone + Send + 'static> Demux<T> {
    /// Creates a new demux without consumers.
    pub fn new(opts: DemuxOptions) -> Self {
        Self { outputs: Arc::from(Mutex::new(vec![])), next_id: AtomicU64::new(0), opts }
    }

    /// Sends `value` to all consumers.  This is a no-op if there are none.
    pub async fn send(&self, value: T) {
        let mut outputs = self.outputs.lock().await;
        outputs.retain(|o| !o.lifetime.is_cancelled() && !o.tx.is_closed());

        for output in outputs.iter() {
            if self.opts.lossy {
                if let Err(mpsc::error::TrySendError::Full(_)) = output.tx.try_send(value.clone())
                {
                    debug!("Dropping value for full consumer {}", output.id);
                }
            } else {
                tokio::select! {
                    _ = output.tx.send(value.clone()) => (),
                    () = output.lifetime.cancelled() => {
                        debug!("Consumer {} went away while sending", output.id);
                    }
                }
            }
        }
    }

    /// Registers a new consumer and returns the stream of values it will receive.
    ///
    /// The consumer is removed, and its stream closed, once `lifetime` is cancelled.  Values that
    /// were already buffered can still be read after that.
    pub async fn receive(&self, lifetime: CancellationToken) -> mpsc::Receiver<T> {
        let (tx, rx) = mpsc::channel(self.opts.buffer.max(1));
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.outputs.lock().await.push(Output { id, tx, lifetime: lifetime.clone() });

        let outputs: Weak<Outputs<T>> = Arc::downgrade(&self.outputs);
        tokio::spawn(async move {
            lifetime.cancelled().await;
            if let Some(outputs) = outputs.upgrade() {
                outputs.lock().await.retain(|o| o.id != id);
            }
        });

        rx
    }

    /// Returns the number of registered consumers.
    pub async fn len(&self) -> usize {
        self.outputs.lock().await.len()
    }

    /// Returns true if there are no registered consumers.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Maximum time to wait for background cleanups to happen.
    const TIMEOUT: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn test_send_without_consumers() {
        let demux = Demux::new(DemuxOptions::default());
        demux.send(1).await;
        assert!(demux.is_empty().await);
    }

    #[tokio::test]
    async fn test_send_reaches_all_consumers_in_order() {
        let demux = Demux::new(DemuxOptions::default());
        let lifetime = CancellationToken::new();
        let mut rx1 = demux.receive(lifetime.clone()).await;
        let mut rx2 = demux.receive(lifetime.clone()).await;
        assert_eq!(2, demux.len().await);

        for i in 0..3 {
            demux.send(i).await;
        }
        for i in 0..3 {
            assert_eq!(Some(i), rx1.recv().await);
            assert_eq!(Some(i), rx2.recv().await);
        }
    }

    #[tokio::test]
    async fn test_cancel_removes_and_closes_consumer() {
        let demux = Demux::new(DemuxOptions::default());
        let lifetime1 = CancellationToken::new();
        let lifetime2 = CancellationToken::new();
        let mut rx1 = demux.receive(lifetime1.clone()).await;
        let mut rx2 = demux.receive(lifetime2.clone()).await;

        demux.send("before").await;
        lifetime1.cancel();

        assert_eq!(Some("before"), rx1.recv().await);
        assert_eq!(None, tokio::time::timeout(TIMEOUT, rx1.recv()).await.unwrap());
        assert_eq!(1, demux.len().await);

        demux.send("after").await;
        assert_eq!(Some("before"), rx2.recv().await);
        assert_eq!(Some("after"), rx2.recv().await);
    }

    #[tokio::test]
    async fn test_lossy_drops_values_for_full_consumers() {
        let demux = Demux::new(DemuxOptions { lossy: true, buffer: 1 });
        let lifetime = CancellationToken::new();
        let mut slow = demux.receive(lifetime.clone()).await;
        let mut fast = demux.receive(lifetime.clone()).await;

        demux.send(1).await;
        assert_eq!(Some(1), fast.recv().await);
        demux.send(2).await;
        assert_eq!(Some(2), fast.recv().await);

        assert_eq!(Some(1), slow.recv().await);
        assert!(slow.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_blocking_waits_for_slow_consumer() {
        let demux = Arc::from(Demux::new(DemuxOptions { lossy: false, buffer: 0 }));
        let lifetime = CancellationToken::new();
        let mut rx = demux.receive(lifetime.clone()).await;

        demux.send(1).await;
        let handle = {
            let demux = demux.clone();
            tokio::spawn(async move { demux.send(2).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!handle.is_finished());

        assert_eq!(Some(1), rx.recv().await);
        tokio::time::timeout(TIMEOUT, handle).await.unwrap().unwrap();
        assert_eq!(Some(2), rx.recv().await);
    }

    #[tokio::test]
    async fn test_blocking_skips_consumer_that_goes_away() {
        let demux = Arc::from(Demux::new(DemuxOptions { lossy: false, buffer: 1 }));
        let lifetime = CancellationToken::new();
        let _rx = demux.receive(lifetime.clone()).await;

        demux.send(1).await;
        let handle = {
            let demux = demux.clone();
            tokio::spawn(async move { demux.send(2).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!handle.is_finished());

        lifetime.cancel();
        tokio::time::timeout(TIMEOUT, handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_pruned_on_send() {
        let demux = Demux::new(DemuxOptions::default());
        let rx = demux.receive(CancellationToken::new()).await;
        drop(rx);
        demux.send(1).await;
        assert!(demux.is_empty().await);
    }
}
