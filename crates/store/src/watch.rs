//! Watchers: one subscriber's bounded queues, delivery loop and lifecycle.
//!
//! Each watcher has two queues. The store try-sends raw internal events into
//! the input queue under its lock; a spawned delivery loop filters them
//! through the watcher's selectors and forwards matches to the output
//! channel, where consumer backpressure is allowed to block. Mutators never
//! wait on a watcher: a full input queue terminates it instead.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};

use lookout_core::{InternalEvent, Selectors, WatchEvent};
use metrics::counter;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::Shared;

pub(crate) struct Watcher<T> {
    id: u64,
    input: mpsc::Sender<Arc<dyn InternalEvent<T>>>,
    done: watch::Sender<bool>,
    stopped: AtomicBool,
    registry: Weak<RwLock<Shared<T>>>,
}

impl<T> Watcher<T> {
    /// Non-blocking enqueue. `false` means the input queue is full and the
    /// watcher must be terminated.
    pub(crate) fn add(&self, event: Arc<dyn InternalEvent<T>>) -> bool {
        self.input.try_send(event).is_ok()
    }

    /// Signal the delivery loop to exit. Idempotent, and never touches the
    /// store registry, so it is safe under the store lock.
    pub(crate) fn terminate(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            let _ = self.done.send(true);
        }
    }

    /// Terminate and deregister. Must not be called while holding the store
    /// lock.
    fn stop(&self) {
        self.terminate();
        if let Some(state) = self.registry.upgrade() {
            state.write().unwrap().watchers.remove(&self.id);
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Watcher<T> {
    pub(crate) fn spawn(
        id: u64,
        selectors: Selectors,
        input_cap: usize,
        registry: Weak<RwLock<Shared<T>>>,
    ) -> (Arc<Self>, WatchHandle<T>) {
        let (input_tx, input_rx) = mpsc::channel(input_cap);
        let (out_tx, out_rx) = mpsc::channel(crate::WATCH_CHAN_SIZE);
        let (done_tx, done_rx) = watch::channel(false);
        tokio::spawn(deliver(id, selectors, input_rx, out_tx, done_rx));
        let watcher = Arc::new(Self {
            id,
            input: input_tx,
            done: done_tx,
            stopped: AtomicBool::new(false),
            registry,
        });
        let handle = WatchHandle { rx: Some(out_rx), watcher: Arc::clone(&watcher) };
        (watcher, handle)
    }
}

/// Pull internal events, project them through this watcher's selectors, and
/// forward matches downstream. Exits on the done signal, on input closure, or
/// when the consumer goes away; dropping `out` on exit closes the consumer
/// channel exactly once.
async fn deliver<T: Clone + Send + Sync + 'static>(
    id: u64,
    selectors: Selectors,
    mut input: mpsc::Receiver<Arc<dyn InternalEvent<T>>>,
    out: mpsc::Sender<WatchEvent<T>>,
    mut done: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = done.changed() => break,
            maybe = input.recv() => {
                let Some(event) = maybe else { break };
                let Some(watch_event) = event.to_watch_event(&selectors) else { continue };
                // Stay responsive to stop while blocked on a slow consumer.
                tokio::select! {
                    _ = done.changed() => break,
                    res = out.send(watch_event) => {
                        if res.is_err() {
                            break;
                        }
                        counter!("watch_events_delivered_total", 1u64);
                    }
                }
            }
        }
    }
    debug!(watcher = id, "watcher: delivery loop exiting");
}

/// Consumer side of a watch: the event channel plus a stop handle. Dropping
/// the handle stops the watcher.
pub struct WatchHandle<T> {
    // Some until into_channel detaches it.
    rx: Option<mpsc::Receiver<WatchEvent<T>>>,
    watcher: Arc<Watcher<T>>,
}

impl<T> std::fmt::Debug for WatchHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchHandle")
            .field("rx", &self.rx.is_some())
            .finish()
    }
}

impl<T> WatchHandle<T> {
    /// Next event, or `None` once the watcher has terminated and drained.
    pub async fn recv(&mut self) -> Option<WatchEvent<T>> {
        match self.rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    /// Non-blocking poll, for consumers that drain opportunistically.
    pub fn try_recv(&mut self) -> std::result::Result<WatchEvent<T>, mpsc::error::TryRecvError> {
        match self.rx.as_mut() {
            Some(rx) => rx.try_recv(),
            None => Err(mpsc::error::TryRecvError::Disconnected),
        }
    }

    /// Detach the raw event channel. The watcher keeps running until the
    /// store stops, its queues overflow, or the returned receiver is
    /// dropped; explicit stop is no longer available after detaching.
    pub fn into_channel(mut self) -> mpsc::Receiver<WatchEvent<T>> {
        self.rx.take().expect("receiver is present until into_channel consumes the handle")
    }

    /// Stop watching. Idempotent; the event channel closes once the delivery
    /// loop exits.
    pub fn stop(&self) {
        self.watcher.stop();
    }
}

impl<T> Drop for WatchHandle<T> {
    fn drop(&mut self) {
        // A handle consumed by into_channel gave up ownership of the stream.
        if self.rx.is_some() {
            self.watcher.stop();
        }
    }
}
