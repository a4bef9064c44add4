/// Request coalescing: concurrent calls sharing a key run one unit of work.
///
/// The work runs as a spawned task, so it finishes (and writes whatever it caches)
/// even when every caller has gone away. The task clears its own map entry on
/// completion. The map lock is held only to look up, insert, or remove an entry.
/// An entry older than the lease is replaced rather than joined, so a stuck flight
/// cannot block a key forever.

use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

type FlightMap<T> = Arc<Mutex<HashMap<String, Flight<T>>>>;

struct Flight<T> {
    id: u64,
    started: Instant,
    future: Shared<BoxFuture<'static, T>>,
}

pub struct SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    flights: FlightMap<T>,
    next_id: AtomicU64,
    lease: Duration,
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(lease: Duration) -> Self {
        SingleFlight {
            flights: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
            lease,
        }
    }

    /// Run `work` for `key`, or join an in-flight run of the same key.
    ///
    /// `work` is only invoked when this caller becomes the leader. Dropping the
    /// returned future does not cancel the work.
    pub async fn run<F, Fut>(&self, key: &str, work: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let future = {
            let mut flights = self.flights.lock().await;
            let existing = flights
                .get(key)
                .filter(|f| f.started.elapsed() < self.lease)
                .map(|f| f.future.clone());

            match existing {
                Some(joined) => {
                    tracing::trace!(key = %key, "Joining in-flight request");
                    joined
                }
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let future = self.spawn_flight(key.to_string(), id, work());
                    flights.insert(
                        key.to_string(),
                        Flight {
                            id,
                            started: Instant::now(),
                            future: future.clone(),
                        },
                    );
                    future
                }
            }
        };

        future.await
    }

    fn spawn_flight<Fut>(&self, key: String, id: u64, work: Fut) -> Shared<BoxFuture<'static, T>>
    where
        Fut: Future<Output = T> + Send + 'static,
    {
        let flights = Arc::clone(&self.flights);
        let handle = tokio::spawn(async move {
            let output = work.await;
            let mut flights = flights.lock().await;
            if flights.get(&key).map(|f| f.id) == Some(id) {
                flights.remove(&key);
            }
            output
        });

        handle
            .map(|joined| match joined {
                Ok(output) => output,
                // The task is never aborted, so a join error carries the work's panic.
                Err(e) => std::panic::resume_unwind(e.into_panic()),
            })
            .boxed()
            .shared()
    }

    #[cfg(test)]
    pub(crate) async fn in_flight(&self) -> usize {
        self.flights.lock().await.len()
    }
}
