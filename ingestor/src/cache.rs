//! Read-through mapping from sensor serial number to sensor id.
//!
//! The whole mapping is loaded up front and swapped wholesale on every
//! refresh, so readers see either the previous or the next snapshot and a
//! failed refresh leaves the previous one serving.

use crate::db::SensorDirectory;
use crate::errors::Result;
use crate::metrics::{CACHE_REFRESH_FAILURES_TOTAL, SENSOR_CACHE_SIZE};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

pub struct SensorCache<D> {
    directory: D,
    mapping: RwLock<HashMap<String, i32>>,
}

impl<D: SensorDirectory> SensorCache<D> {
    /// Builds the cache with a full load. Fails if that load fails, so an
    /// ingestor never starts serving with an empty cache.
    pub async fn new(directory: D) -> Result<Self> {
        let cache = Self {
            directory,
            mapping: RwLock::new(HashMap::new()),
        };
        cache.refresh().await?;
        Ok(cache)
    }

    pub fn get(&self, serial_number: &str) -> Option<i32> {
        self.read().get(serial_number).copied()
    }

    /// Copy of the current mapping; the lock is released before returning.
    pub fn get_all(&self) -> HashMap<String, i32> {
        self.read().clone()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Reloads the mapping from the directory and swaps it in.
    pub async fn refresh(&self) -> Result<usize> {
        let mapping = self.directory.sensor_ids().await?;
        let loaded = mapping.len();

        *self
            .mapping
            .write()
            .unwrap_or_else(PoisonError::into_inner) = mapping;

        SENSOR_CACHE_SIZE.set(loaded as i64);
        info!("Sensor cache refreshed: {} sensors loaded", loaded);
        Ok(loaded)
    }

    /// Refreshes every `interval` until `shutdown` fires. Failures are logged
    /// and the stale mapping keeps serving.
    pub async fn run_refresh_loop(&self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; construction already loaded.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Sensor cache refresh loop stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh().await {
                        CACHE_REFRESH_FAILURES_TOTAL.inc();
                        error!("Sensor cache refresh failed, keeping stale mapping: {}", e);
                    }
                }
            }
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, i32>> {
        self.mapping.read().unwrap_or_else(PoisonError::into_inner)
    }
}
