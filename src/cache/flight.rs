//! Per-path single-flight coordination.
//!
//! The first caller for a key spawns the fetch as a detached task; later
//! callers for the same key await a shared handle to that task.  The task
//! keeps running when the caller that started it is cancelled, as long as
//! another caller is still waiting.  When the last waiter goes away before
//! the task finishes, the task is aborted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::task::AbortHandle;
use tracing::{debug, trace};

use crate::upstream::{FetchError, Fetched};

type FetchResult = Result<Fetched, FetchError>;
type SharedFetch = Shared<BoxFuture<'static, FetchResult>>;

struct Flight {
    id: u64,
    result: SharedFetch,
    waiters: usize,
    abort: AbortHandle,
}

#[derive(Default)]
struct Flights {
    next_id: u64,
    by_key: HashMap<String, Flight>,
}

#[derive(Clone, Default)]
pub struct FlightGroup {
    inner: Arc<Mutex<Flights>>,
}

impl FlightGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Await the flight for `key`, starting it with `start` if none is in
    /// progress.  Every caller joined to one flight receives the same result.
    pub async fn run<F>(&self, key: &str, start: F) -> FetchResult
    where
        F: FnOnce() -> BoxFuture<'static, FetchResult>,
    {
        let (result, _waiter) = self.join(key, start);
        result.await
    }

    /// Number of keys with a fetch in progress.
    #[cfg(test)]
    pub fn in_flight(&self) -> usize {
        lock(&self.inner).by_key.len()
    }

    fn join<F>(&self, key: &str, start: F) -> (SharedFetch, Waiter)
    where
        F: FnOnce() -> BoxFuture<'static, FetchResult>,
    {
        let mut flights = lock(&self.inner);

        if let Some(flight) = flights.by_key.get_mut(key) {
            flight.waiters += 1;
            trace!(key, waiters = flight.waiters, "joined in-flight fetch");
            let waiter = Waiter {
                inner: self.inner.clone(),
                key: key.to_string(),
                id: flight.id,
            };
            return (flight.result.clone(), waiter);
        }

        let id = flights.next_id;
        flights.next_id += 1;

        let fetch = start();
        let inner = self.inner.clone();
        let owned_key = key.to_string();
        let handle = tokio::spawn(async move {
            let result = fetch.await;
            // Retire before the result becomes visible, so a caller arriving
            // afterwards starts from the store instead of this flight.
            let mut flights = lock(&inner);
            if flights.by_key.get(&owned_key).is_some_and(|f| f.id == id) {
                flights.by_key.remove(&owned_key);
            }
            result
        });
        let abort = handle.abort_handle();
        let result = handle
            .map(|joined| {
                joined.unwrap_or_else(|e| Err(FetchError::Incomplete(e.to_string())))
            })
            .boxed()
            .shared();

        debug!(key, "starting origin fetch");
        flights.by_key.insert(
            key.to_string(),
            Flight {
                id,
                result: result.clone(),
                waiters: 1,
                abort,
            },
        );

        let waiter = Waiter {
            inner: self.inner.clone(),
            key: key.to_string(),
            id,
        };
        (result, waiter)
    }
}

/// Registration of one caller on a flight; dropping it leaves the flight.
struct Waiter {
    inner: Arc<Mutex<Flights>>,
    key: String,
    id: u64,
}

impl Drop for Waiter {
    fn drop(&mut self) {
        let mut flights = lock(&self.inner);
        let Some(flight) = flights.by_key.get_mut(&self.key) else {
            return;
        };
        if flight.id != self.id {
            return;
        }
        flight.waiters -= 1;
        if flight.waiters == 0 {
            if let Some(flight) = flights.by_key.remove(&self.key) {
                debug!(key = %self.key, "all waiters gone, aborting origin fetch");
                flight.abort.abort();
            }
        }
    }
}

fn lock(inner: &Mutex<Flights>) -> MutexGuard<'_, Flights> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}
