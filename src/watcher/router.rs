//! Event delivery to subscribers.
//!
//! Filtered events are queued from the notification threads and handed to
//! subscriber callbacks on one dedicated delivery thread, so slow callbacks
//! never hold up the OS notification queue. A single queue keeps delivery
//! FIFO per primitive watch.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;

use super::error::{WatchError, WatchResult};
use super::event::WatchEvent;

/// Subscriber callback for one root watch.
pub type Callback = Box<dyn Fn(WatchEvent) + Send + 'static>;

/// Connection between one root watch and its callback.
///
/// Cancelling waits for an in-flight callback of this subscription to finish,
/// so once `cancel` returns nothing more is delivered to it.
pub struct Subscription {
    root: PathBuf,
    active: AtomicBool,
    callback: Mutex<Option<Callback>>,
}

impl Subscription {
    pub fn new(root: impl Into<PathBuf>, callback: Callback) -> Arc<Self> {
        Arc::new(Self {
            root: root.into(),
            active: AtomicBool::new(true),
            callback: Mutex::new(Some(callback)),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Blocks while this subscription's callback is running.
    pub fn cancel(&self) {
        self.active.store(false, Ordering::Release);
        self.callback.lock().take();
    }

    /// Invoke the callback. Panics are contained and logged.
    fn deliver(&self, event: WatchEvent) -> bool {
        let guard = self.callback.lock();
        let Some(callback) = guard.as_ref() else {
            return false;
        };

        if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
            tracing::error!(
                "[router] subscriber callback for {} panicked",
                self.root.display()
            );
            return false;
        }
        true
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("root", &self.root)
            .field("active", &self.is_active())
            .finish()
    }
}

pub(crate) enum Dispatch {
    Event {
        subscription: Arc<Subscription>,
        event: WatchEvent,
    },
    Shutdown,
}

/// Sending half of the delivery queue.
#[derive(Clone)]
pub(crate) struct Router {
    tx: Sender<Dispatch>,
}

impl Router {
    /// Start the delivery thread.
    pub(crate) fn spawn() -> WatchResult<(Router, JoinHandle<()>)> {
        let (tx, rx) = unbounded();
        let handle = thread::Builder::new()
            .name("treewatch-delivery".to_string())
            .spawn(move || {
                let delivered = DeliveryStage.run(rx);
                crate::debug_event!("router", "stopped", "{delivered} events delivered");
            })
            .map_err(|e| WatchError::WorkerFailed {
                reason: e.to_string(),
            })?;
        Ok((Router { tx }, handle))
    }

    /// Queue an event for delivery. Never blocks.
    pub(crate) fn route(&self, subscription: &Arc<Subscription>, event: WatchEvent) {
        if !subscription.is_active() {
            return;
        }
        let dispatch = Dispatch::Event {
            subscription: Arc::clone(subscription),
            event,
        };
        if self.tx.send(dispatch).is_err() {
            crate::debug_event!("router", "dropped", "delivery thread has stopped");
        }
    }

    /// Ask the delivery thread to exit once queued events are drained.
    pub(crate) fn shutdown(&self) {
        let _ = self.tx.send(Dispatch::Shutdown);
    }

    #[cfg(test)]
    pub(crate) fn detached() -> (Router, Receiver<Dispatch>) {
        let (tx, rx) = unbounded();
        (Router { tx }, rx)
    }
}

/// Consumes the delivery queue on the delivery thread.
struct DeliveryStage;

impl DeliveryStage {
    /// Returns the number of events handed to callbacks.
    fn run(&self, rx: Receiver<Dispatch>) -> usize {
        let mut delivered = 0;
        for dispatch in rx {
            match dispatch {
                Dispatch::Event {
                    subscription,
                    event,
                } => {
                    if subscription.deliver(event) {
                        delivered += 1;
                    }
                }
                Dispatch::Shutdown => break,
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watcher::event::EventType;
    use std::time::Duration;

    fn event(kind: EventType, source: &str) -> WatchEvent {
        WatchEvent::new(kind.code(), PathBuf::from("/root"), PathBuf::from(source))
    }

    fn collecting_subscription() -> (Arc<Subscription>, crossbeam_channel::Receiver<WatchEvent>) {
        let (tx, rx) = unbounded();
        let subscription = Subscription::new(
            "/root",
            Box::new(move |event| {
                let _ = tx.send(event);
            }),
        );
        (subscription, rx)
    }

    #[test]
    fn test_delivery_preserves_order() {
        let (router, handle) = Router::spawn().unwrap();
        let (subscription, rx) = collecting_subscription();

        for i in 0..50 {
            router.route(&subscription, event(EventType::Modify, &format!("/root/{i}")));
        }
        router.shutdown();
        handle.join().unwrap();

        let sources: Vec<_> = rx.try_iter().map(|e| e.source).collect();
        let expected: Vec<_> = (0..50).map(|i| PathBuf::from(format!("/root/{i}"))).collect();
        assert_eq!(sources, expected);
    }

    #[test]
    fn test_cancelled_subscription_receives_nothing() {
        let (router, rx_dispatch) = Router::detached();
        let (subscription, rx) = collecting_subscription();

        // Queued before cancellation, delivered after it
        router.route(&subscription, event(EventType::Create, "/root/a"));
        subscription.cancel();
        router.route(&subscription, event(EventType::Create, "/root/b"));

        router.shutdown();
        let delivered = DeliveryStage.run(rx_dispatch);

        assert_eq!(delivered, 0);
        assert!(rx.try_recv().is_err());
        assert!(!subscription.is_active());
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        let (router, handle) = Router::spawn().unwrap();
        let panicking = Subscription::new("/bad", Box::new(|_| panic!("subscriber bug")));
        let (healthy, rx) = collecting_subscription();

        router.route(&panicking, event(EventType::Create, "/bad/x"));
        router.route(&healthy, event(EventType::Create, "/root/y"));

        let received = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(received.source, PathBuf::from("/root/y"));

        router.shutdown();
        handle.join().unwrap();
    }
}
