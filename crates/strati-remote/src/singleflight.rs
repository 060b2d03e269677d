//! Keyed coalescing of concurrent identical operations.
//!
//! The first caller under a key becomes the leader and runs the work inline;
//! everyone else arriving while the leader runs parks on a oneshot channel
//! and receives a clone of the leader's result. The leader's future is never
//! spawned, so it may borrow from the caller's stack.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use tokio::sync::oneshot;

/// Outcome of a coalesced call.
#[derive(Debug)]
pub enum Flight<T> {
    /// This caller ran the work itself.
    Led(T),
    /// Another caller ran the work; this is a clone of its result.
    Shared(T),
    /// The leading caller went away before producing a result.
    Abandoned,
}

pub struct Group<T> {
    calls: Mutex<HashMap<String, Vec<oneshot::Sender<T>>>>,
}

impl<T: Clone> Group<T> {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Run `f` under `key`, or wait for the in-flight leader's result.
    pub async fn do_call<F, Fut>(&self, key: &str, f: F) -> Flight<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let waiter = {
            let mut calls = self.calls.lock().expect("singleflight lock poisoned");
            if let Some(waiters) = calls.get_mut(key) {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                Some(rx)
            } else {
                calls.insert(key.to_string(), Vec::new());
                None
            }
        };

        if let Some(rx) = waiter {
            return match rx.await {
                Ok(value) => Flight::Shared(value),
                Err(_) => Flight::Abandoned,
            };
        }

        // The guard keeps the key from leaking waiters if this future is
        // dropped mid-flight: dropping the senders wakes every waiter with
        // `Abandoned`.
        let guard = LeaderGuard {
            group: self,
            key: Some(key.to_string()),
        };
        let value = f().await;
        for tx in guard.finish() {
            let _ = tx.send(value.clone());
        }
        Flight::Led(value)
    }
}

impl<T: Clone> Default for Group<T> {
    fn default() -> Self {
        Self::new()
    }
}

struct LeaderGuard<'a, T> {
    group: &'a Group<T>,
    key: Option<String>,
}

impl<T> LeaderGuard<'_, T> {
    fn finish(mut self) -> Vec<oneshot::Sender<T>> {
        let key = self.key.take().expect("leader guard finished twice");
        self.group
            .calls
            .lock()
            .expect("singleflight lock poisoned")
            .remove(&key)
            .unwrap_or_default()
    }
}

impl<T> Drop for LeaderGuard<'_, T> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            let _ = self
                .group
                .calls
                .lock()
                .expect("singleflight lock poisoned")
                .remove(&key);
        }
    }
}
