//! In-memory stand-ins for the relational store.

use crate::db::{MeasurementSink, SensorDirectory, SensorRegistry};
use crate::errors::{Error, Result};
use crate::model::MeasurementRecord;
use async_trait::async_trait;
use broker::routing::SensorRegistration;
use chrono::{DateTime, Utc};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Enforces the same `(sensor_id, time)` uniqueness as the real table.
#[derive(Default)]
pub struct MemoryStore {
    sensors: Mutex<HashMap<String, i32>>,
    rows: Mutex<BTreeMap<(i32, DateTime<Utc>), f64>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn with_sensors(serials: &[&str]) -> Arc<Self> {
        let store = Arc::new(Self::default());
        for serial in serials {
            store.register(serial);
        }
        store
    }

    pub fn register(&self, serial: &str) -> i32 {
        let mut sensors = self.sensors.lock().unwrap();
        let next_id = sensors.len() as i32 + 1;
        *sensors.entry(serial.to_string()).or_insert(next_id)
    }

    pub fn sensor_id(&self, serial: &str) -> Option<i32> {
        self.sensors.lock().unwrap().get(serial).copied()
    }

    pub fn row_count(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    pub fn rows_for(&self, sensor_id: i32) -> usize {
        self.rows
            .lock()
            .unwrap()
            .keys()
            .filter(|(id, _)| *id == sensor_id)
            .count()
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl SensorDirectory for MemoryStore {
    async fn sensor_ids(&self) -> Result<HashMap<String, i32>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Error::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(self.sensors.lock().unwrap().clone())
    }
}

#[async_trait]
impl MeasurementSink for MemoryStore {
    async fn write_measurements(&self, records: &[MeasurementRecord]) -> Result<u64> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Database(sqlx::Error::PoolTimedOut));
        }

        let known: Vec<i32> = self.sensors.lock().unwrap().values().copied().collect();
        if let Some(orphan) = records.iter().find(|r| !known.contains(&r.sensor_id)) {
            return Err(Error::Validation(format!(
                "foreign key violation for sensor {}",
                orphan.sensor_id
            )));
        }

        let mut rows = self.rows.lock().unwrap();
        let mut inserted = 0;
        for record in records {
            if let Entry::Vacant(entry) = rows.entry((record.sensor_id, record.time)) {
                entry.insert(record.measurement);
                inserted += 1;
            }
        }
        Ok(inserted)
    }
}

#[async_trait]
impl SensorRegistry for MemoryStore {
    async fn register_sensor(&self, registration: &SensorRegistration) -> Result<bool> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Database(sqlx::Error::PoolTimedOut));
        }
        let existed = self.sensor_id(&registration.serial_number).is_some();
        self.register(&registration.serial_number);
        Ok(!existed)
    }
}
