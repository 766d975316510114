// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Request coalescing keyed by cache fingerprint
//!
//! The first caller for a key becomes the leader: its work is spawned onto the
//! runtime and every caller, leader included, waits on a broadcast of the one
//! result. Because the work runs in its own task, a caller that gives up
//! (timeout, dropped future) never cancels it.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlightRole {
    /// Started the shared work
    Leader,
    /// Joined work another caller started
    Follower,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlightError {
    #[error("In-flight work ended without producing a result")]
    Abandoned,

    #[error("Timed out after {0:?} waiting for in-flight work")]
    TimedOut(Duration),
}

struct Flight<T> {
    id: u64,
    sender: broadcast::Sender<T>,
}

type FlightMap<K, T> = Arc<Mutex<HashMap<K, Flight<T>>>>;

/// Deregisters a flight when its work finishes or is torn down
///
/// Deregistration happens before the result is published, so a caller
/// arriving afterwards starts a fresh flight instead of subscribing to a
/// channel that will never send again.
struct FlightGuard<K: Eq + Hash, T> {
    key: Option<K>,
    id: u64,
    flights: FlightMap<K, T>,
}

impl<K: Eq + Hash, T> FlightGuard<K, T> {
    fn take_sender(&mut self) -> Option<broadcast::Sender<T>> {
        let key = self.key.take()?;
        let mut flights = self.flights.lock();
        // A newer flight may have taken over the key
        if flights.get(&key).map(|flight| flight.id) != Some(self.id) {
            return None;
        }
        flights.remove(&key).map(|flight| flight.sender)
    }

    fn complete(mut self, value: T) {
        if let Some(sender) = self.take_sender() {
            // No receivers left is fine: every caller gave up
            let _ = sender.send(value);
        }
    }
}

impl<K: Eq + Hash, T> Drop for FlightGuard<K, T> {
    fn drop(&mut self) {
        // Dropping the sender wakes waiters with `Closed`
        self.take_sender();
    }
}

/// Coalesces concurrent work for the same key
pub struct SingleFlight<K, T> {
    flights: FlightMap<K, T>,
    next_id: AtomicU64,
}

impl<K, T> Default for SingleFlight<K, T> {
    fn default() -> Self {
        Self {
            flights: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<K, T> SingleFlight<K, T>
where
    K: Eq + Hash + Clone + Send + 'static,
    T: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` for `key` unless a run is already in flight, then wait for
    /// the shared result
    ///
    /// `work` is only invoked by the leader. `wait_timeout` bounds how long
    /// this caller waits; the work itself keeps running.
    pub async fn execute<F, Fut>(
        &self,
        key: K,
        work: F,
        wait_timeout: Option<Duration>,
    ) -> Result<(T, FlightRole), FlightError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (mut receiver, leader_id) = {
            let mut flights = self.flights.lock();
            match flights.get(&key) {
                Some(flight) => (flight.sender.subscribe(), None),
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let (sender, receiver) = broadcast::channel(1);
                    flights.insert(key.clone(), Flight { id, sender });
                    (receiver, Some(id))
                }
            }
        };

        let role = match leader_id {
            Some(id) => {
                let guard = FlightGuard {
                    key: Some(key),
                    id,
                    flights: Arc::clone(&self.flights),
                };
                let fut = work();
                tokio::spawn(async move {
                    let value = fut.await;
                    guard.complete(value);
                });
                FlightRole::Leader
            }
            None => {
                drop(work);
                FlightRole::Follower
            }
        };

        let outcome = match wait_timeout {
            Some(limit) => tokio::time::timeout(limit, receiver.recv())
                .await
                .map_err(|_| FlightError::TimedOut(limit))?,
            None => receiver.recv().await,
        };

        outcome
            .map(|value| (value, role))
            .map_err(|_| FlightError::Abandoned)
    }

    pub fn in_flight_count(&self) -> usize {
        self.flights.lock().len()
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        self.flights.lock().contains_key(key)
    }

    /// Callers currently waiting on `key`, leader included
    pub fn waiters(&self, key: &K) -> usize {
        self.flights
            .lock()
            .get(key)
            .map(|flight| flight.sender.receiver_count())
            .unwrap_or(0)
    }
}
