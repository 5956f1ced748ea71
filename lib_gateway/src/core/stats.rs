//! Best-effort daily online statistics shared across the fleet.
//!
//! Two counters per local calendar day (`M-D-YY`): the highest distinct-session
//! online count seen by any instance, and the number of public connection opens.
//! Updates run detached with a short timeout and only ever log on failure.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Local};
use futures_util::future::BoxFuture;
use tracing::{debug, warn};

use crate::core::error::HubError;

/// Shared counter store used for daily statistics.
pub trait StatsStore: Send + Sync + 'static {
    /// Raise today's max-online counter to `online` if it is higher.
    fn record_max_online<'a>(&'a self, day: &'a str, online: usize)
        -> BoxFuture<'a, Result<(), HubError>>;

    /// Increment today's connection-open counter.
    fn incr_total_opens<'a>(&'a self, day: &'a str) -> BoxFuture<'a, Result<(), HubError>>;
}

/// Day key in local time, e.g. `3-7-25`.
pub fn day_key(now: DateTime<Local>) -> String {
    now.format("%-m-%-d-%y").to_string()
}

/// Fires both counter updates in a detached task.
pub(crate) fn spawn_online_stats(store: Arc<dyn StatsStore>, online: usize, limit: Duration) {
    tokio::spawn(async move {
        let day = day_key(Local::now());

        match tokio::time::timeout(limit, store.record_max_online(&day, online)).await {
            Ok(Ok(())) => debug!(day = %day, online, "max-online updated"),
            Ok(Err(e)) => warn!(day = %day, error = %e, "failed to update max-online"),
            Err(_) => warn!(day = %day, "max-online update timed out"),
        }

        match tokio::time::timeout(limit, store.incr_total_opens(&day)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(day = %day, error = %e, "failed to increment total opens"),
            Err(_) => warn!(day = %day, "total-opens update timed out"),
        }
    });
}

/// Process-local `StatsStore` for single-instance runs and tests.
#[derive(Default)]
pub struct MemoryStatsStore {
    max_online: Mutex<HashMap<String, usize>>,
    total_opens: Mutex<HashMap<String, u64>>,
}

impl MemoryStatsStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Today's max-online value for `day`.
    pub fn max_online(&self, day: &str) -> usize {
        let map = self.max_online.lock().unwrap_or_else(PoisonError::into_inner);
        map.get(day).copied().unwrap_or(0)
    }

    /// Today's total opens for `day`.
    pub fn total_opens(&self, day: &str) -> u64 {
        let map = self.total_opens.lock().unwrap_or_else(PoisonError::into_inner);
        map.get(day).copied().unwrap_or(0)
    }
}

impl StatsStore for MemoryStatsStore {
    fn record_max_online<'a>(
        &'a self,
        day: &'a str,
        online: usize,
    ) -> BoxFuture<'a, Result<(), HubError>> {
        Box::pin(async move {
            let mut map = self.max_online.lock().unwrap_or_else(PoisonError::into_inner);
            let current = map.entry(day.to_string()).or_insert(0);
            if online > *current {
                *current = online;
            }
            Ok(())
        })
    }

    fn incr_total_opens<'a>(&'a self, day: &'a str) -> BoxFuture<'a, Result<(), HubError>> {
        Box::pin(async move {
            let mut map = self.total_opens.lock().unwrap_or_else(PoisonError::into_inner);
            *map.entry(day.to_string()).or_insert(0) += 1;
            Ok(())
        })
    }
}
