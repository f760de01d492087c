//! Single-flight coalescing of concurrent fetches.
//!
//! [`Coalescer::run`] guarantees that among concurrent callers sharing a key,
//! exactly one fetch executes. The first caller registers the flight; everyone
//! who arrives while it is running awaits the same shared result.
//!
//! The fetch runs on its own Tokio task, so dropping any awaiting future
//! (including the one that started the flight) never cancels the fetch for the
//! remaining waiters. The task removes its table entry when it finishes,
//! whatever the outcome, so the table only ever holds running fetches.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde_json::Value;
use tracing::debug;

use crate::error::RemoteError;

/// Outcome broadcast to every waiter of a flight.
pub type FlightResult = Result<Value, RemoteError>;

type SharedFlight = Shared<BoxFuture<'static, FlightResult>>;

struct Flight {
    id: u64,
    result: SharedFlight,
}

// Removes the flight's entry on completion, panic included. The id check keeps
// a finished flight from removing a newer one registered under the same key.
struct Landing {
    flights: Arc<DashMap<String, Flight>>,
    key: String,
    id: u64,
}

impl Drop for Landing {
    fn drop(&mut self) {
        self.flights.remove_if(&self.key, |_, flight| flight.id == self.id);
    }
}

/// Table of in-flight fetches keyed by cache key.
///
/// # Examples
///
/// ```rust,no_run
/// use callcache::flight::Coalescer;
/// use serde_json::json;
///
/// # async fn example() {
/// let coalescer = Coalescer::new();
/// let value = coalescer
///     .run("IUserApi.GetUser(id:42)", || async { Ok(json!({ "id": 42 })) })
///     .await
///     .unwrap();
/// assert_eq!(value["id"], 42);
/// # }
/// ```
#[derive(Default)]
pub struct Coalescer {
    flights: Arc<DashMap<String, Flight>>,
    next_id: AtomicU64,
}

impl Coalescer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `fetch` for `key` unless a fetch for `key` is already in flight,
    /// in which case the running fetch's result is awaited instead.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn run<F, Fut>(&self, key: &str, fetch: F) -> FlightResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FlightResult> + Send + 'static,
    {
        let result = match self.flights.entry(key.to_owned()) {
            Entry::Occupied(entry) => {
                debug!(key, "joining in-flight fetch");
                entry.get().result.clone()
            }
            Entry::Vacant(entry) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let landing = Landing {
                    flights: Arc::clone(&self.flights),
                    key: key.to_owned(),
                    id,
                };
                let operation = fetch();
                let task = tokio::spawn(async move {
                    let _landing = landing;
                    operation.await
                });
                let result = async move {
                    task.await
                        .unwrap_or_else(|e| Err(RemoteError::Aborted(e.to_string())))
                }
                .boxed()
                .shared();

                debug!(key, flight = id, "starting fetch");
                entry.insert(Flight {
                    id,
                    result: result.clone(),
                });
                result
            }
        };

        result.await
    }

    /// Number of fetches currently running.
    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }
}
