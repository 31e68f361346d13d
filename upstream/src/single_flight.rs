use crate::errors::{ApiError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Deduplicates concurrent work by key: the first caller for a key installs
/// an in-flight entry and runs the work, later callers join the same outcome.
///
/// The work runs on its own spawned task. That keeps two guarantees:
/// - a joiner (including the installer) being cancelled never cancels the
///   work, so remaining joiners still observe the result;
/// - callers blocking on the flight can never starve the task that has to
///   complete it.
pub struct SingleFlight<K, T> {
    inflight: Arc<Mutex<HashMap<K, broadcast::Sender<Result<T>>>>>,
}

impl<K, T> SingleFlight<K, T>
where
    K: Eq + Hash + Clone + Send + 'static,
    T: Clone + Send + 'static,
{
    pub fn new() -> Self {
        SingleFlight {
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Runs `work` under `key`, or joins an in-flight run of the same key.
    pub async fn run<Fut>(&self, key: K, work: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let mut rx = {
            let mut map = self.inflight.lock();
            if let Some(tx) = map.get(&key) {
                tx.subscribe()
            } else {
                let (tx, rx) = broadcast::channel(1);
                map.insert(key.clone(), tx);
                let guard = FlightGuard {
                    inflight: Arc::clone(&self.inflight),
                    key: Some(key),
                };
                tokio::spawn(async move {
                    let outcome = work.await;
                    // remove before broadcasting so late arrivals either join
                    // this flight or start a fresh one, never a stale entry
                    if let Some(tx) = guard.finish() {
                        let _ = tx.send(outcome);
                    }
                });
                rx
            }
        };

        match rx.recv().await {
            Ok(outcome) => outcome,
            Err(_) => Err(ApiError::FlightDropped),
        }
    }

    #[cfg(test)]
    pub fn inflight_len(&self) -> usize {
        self.inflight.lock().len()
    }
}

impl<K, T> Default for SingleFlight<K, T>
where
    K: Eq + Hash + Clone + Send + 'static,
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Removes the in-flight entry exactly once, even if the work panics.
struct FlightGuard<K: Eq + Hash, T> {
    inflight: Arc<Mutex<HashMap<K, broadcast::Sender<Result<T>>>>>,
    key: Option<K>,
}

impl<K: Eq + Hash, T> FlightGuard<K, T> {
    fn finish(mut self) -> Option<broadcast::Sender<Result<T>>> {
        let key = self.key.take()?;
        self.inflight.lock().remove(&key)
    }
}

impl<K: Eq + Hash, T> Drop for FlightGuard<K, T> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.inflight.lock().remove(&key);
        }
    }
}
