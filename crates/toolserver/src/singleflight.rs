//! Coalesces concurrent requests for the same keyed work into one execution.

use dashmap::{mapref::entry::Entry, DashMap};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::{future::Future, hash::Hash, sync::Arc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("in-flight task ended without a result")]
pub struct FlightAborted;

type Flight<V> = Shared<BoxFuture<'static, Result<V, FlightAborted>>>;

/// Map from key to the in-progress completion handle for that key.
///
/// The first caller spawns the work on its own task; later callers attach to
/// the same handle. The entry is removed when the work finishes, whatever the
/// outcome, so the next call starts fresh.
pub struct SingleFlight<K, V> {
    flights: Arc<DashMap<K, Flight<V>>>,
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            flights: Arc::new(DashMap::new()),
        }
    }
}

impl<K: Eq + Hash, V> std::fmt::Debug for SingleFlight<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleFlight")
            .field("in_flight", &self.flights.len())
            .finish()
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        self.flights.contains_key(key)
    }

    pub async fn run<F>(&self, key: K, work: F) -> Result<V, FlightAborted>
    where
        F: Future<Output = V> + Send + 'static,
    {
        let flight = match self.flights.entry(key.clone()) {
            Entry::Occupied(existing) => existing.get().clone(),
            Entry::Vacant(slot) => {
                let landing = Landing {
                    flights: Arc::clone(&self.flights),
                    key,
                };
                let handle = tokio::spawn(async move {
                    let _landing = landing;
                    work.await
                });
                let flight = async move {
                    handle.await.map_err(|err| {
                        tracing::error!(error = %err, "singleflight task failed");
                        FlightAborted
                    })
                }
                .boxed()
                .shared();
                slot.insert(flight.clone());
                flight
            }
        };
        flight.await
    }
}

/// Removes the flight's entry when the spawned work ends, including on panic.
struct Landing<K: Eq + Hash, V> {
    flights: Arc<DashMap<K, Flight<V>>>,
    key: K,
}

impl<K: Eq + Hash, V> Drop for Landing<K, V> {
    fn drop(&mut self) {
        self.flights.remove(&self.key);
    }
}
