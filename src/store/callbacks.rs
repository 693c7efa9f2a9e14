//! Per-id callback fan-out for `ChainStore::put` (spec.md §4.1).
//!
//! One worker task per registered id, fed by a bounded channel so a slow
//! callback backs up only its own queue, never the writer — the
//! "callbacks must not block the writer" contract in spec.md §4.1. This is
//! the new design called for by spec.md §9's "single-writer tasks with
//! message passing" redesign flag, applied to fan-out rather than just the
//! write path itself.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::warn;

use crate::wire::Beacon;

pub type CallbackId = String;

/// A single delivery to a registered callback.
#[derive(Clone, Debug)]
pub struct Delivery {
    pub beacon: Beacon,
    pub closed: bool,
}

/// A registered callback: an async closure invoked once per delivery.
pub type Callback = Arc<dyn Fn(Delivery) + Send + Sync + 'static>;

const CALLBACK_QUEUE_DEPTH: usize = 64;

struct Worker {
    sender: mpsc::Sender<Delivery>,
}

/// Maintains the id → callback mapping described in spec.md §4.1.
pub struct CallbackRegistry {
    workers: Mutex<HashMap<CallbackId, Worker>>,
}

impl Default for CallbackRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self {
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Registers `callback` under `id`. If `id` was already registered, the
    /// old callback is invoked once with `closed=true` as a drain signal
    /// before being replaced (spec.md §4.1).
    pub fn register(&self, id: CallbackId, callback: Callback) {
        let (tx, mut rx) = mpsc::channel::<Delivery>(CALLBACK_QUEUE_DEPTH);
        let worker_callback = callback;
        tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                let closed = delivery.closed;
                worker_callback(delivery);
                if closed {
                    break;
                }
            }
        });

        let old = {
            let mut workers = self.workers.lock();
            workers.insert(id, Worker { sender: tx })
        };
        if let Some(old) = old {
            // Drain signal to the replaced worker; ignore a full/closed
            // channel, the old worker is being torn down regardless.
            let _ = old.sender.try_send(Delivery {
                beacon: Beacon {
                    round: 0,
                    previous_sig: Vec::new(),
                    signature: Vec::new(),
                },
                closed: true,
            });
        }
    }

    /// Closes the worker channel for `id` (spec.md §4.1 `RemoveCallback`).
    pub fn remove(&self, id: &str) {
        let worker = self.workers.lock().remove(id);
        if let Some(worker) = worker {
            let _ = worker.sender.try_send(Delivery {
                beacon: Beacon {
                    round: 0,
                    previous_sig: Vec::new(),
                    signature: Vec::new(),
                },
                closed: true,
            });
        }
    }

    /// Fans a newly-stored beacon (round > 0 only, per spec.md §4.1) out to
    /// every registered callback, queued per id.
    pub fn dispatch(&self, beacon: &Beacon) {
        if beacon.round == 0 {
            return;
        }
        let workers = self.workers.lock();
        for (id, worker) in workers.iter() {
            if worker
                .sender
                .try_send(Delivery {
                    beacon: beacon.clone(),
                    closed: false,
                })
                .is_err()
            {
                warn!(callback_id = %id, "callback queue full or closed, delivery dropped");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn beacon(round: u64) -> Beacon {
        Beacon {
            round,
            previous_sig: Vec::new(),
            signature: vec![round as u8],
        }
    }

    #[tokio::test]
    async fn dispatch_invokes_registered_callback_once() {
        let registry = CallbackRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        registry.register(
            "a".into(),
            Arc::new(move |delivery: Delivery| {
                assert!(!delivery.closed);
                count2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        registry.dispatch(&beacon(1));
        // allow the worker task to run
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn round_zero_is_never_dispatched() {
        let registry = CallbackRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        registry.register("a".into(), Arc::new(move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        }));
        registry.dispatch(&beacon(0));
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn replacing_a_callback_sends_a_closed_drain_signal() {
        let registry = CallbackRegistry::new();
        let seen_closed = Arc::new(AtomicUsize::new(0));
        let seen_closed2 = seen_closed.clone();
        registry.register(
            "a".into(),
            Arc::new(move |delivery: Delivery| {
                if delivery.closed {
                    seen_closed2.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );
        registry.register("a".into(), Arc::new(|_| {}));
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(seen_closed.load(Ordering::SeqCst), 1);
    }
}
