use crate::cache::SensorCache;
use crate::db::{MeasurementSink, SensorDirectory};
use crate::errors::{Error, Result};
use crate::metrics::{
    BATCH_SIZE, DB_FAILURES_TOTAL, E2E_LATENCY_SECONDS, MEASUREMENTS_PROCESSED_TOTAL,
    MESSAGES_RECEIVED_TOTAL, PHASE_DB_WRITE, PHASE_RESOLVE, PHASE_TOTAL,
    PROCESSING_DURATION_SECONDS, UNRESOLVED_BATCHES_TOTAL,
};
use crate::model::MeasurementRecord;
use broker::routing::SensorMeasurement;
use broker::AckType;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Turns decoded measurement batches into deduplicated rows.
pub struct MeasurementPipeline<D, S> {
    cache: Arc<SensorCache<D>>,
    sink: S,
}

struct DeviceStats {
    count: u64,
    oldest: DateTime<Utc>,
}

impl<D, S> MeasurementPipeline<D, S>
where
    D: SensorDirectory,
    S: MeasurementSink,
{
    pub fn new(cache: Arc<SensorCache<D>>, sink: S) -> Self {
        Self { cache, sink }
    }

    /// Handles one stream delivery. Unknown serial numbers and database
    /// failures both ask for redelivery of the whole batch.
    pub async fn handle_batch(&self, batch: Vec<SensorMeasurement>) -> AckType {
        let start = Instant::now();
        MESSAGES_RECEIVED_TOTAL.inc();
        BATCH_SIZE.observe(batch.len() as f64);

        let stats = device_stats(&batch);
        let result = self.ingest(&batch).await;

        PROCESSING_DURATION_SECONDS
            .with_label_values(&[PHASE_TOTAL])
            .observe(start.elapsed().as_secs_f64());

        // Once per device per batch, using its oldest sample as the worst case.
        let completed = Utc::now();
        for (serial, device) in &stats {
            let latency = (completed - device.oldest)
                .to_std()
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0);
            E2E_LATENCY_SECONDS
                .with_label_values(&[*serial])
                .observe(latency);
        }

        let status = if result.is_ok() { "success" } else { "error" };
        for (serial, device) in &stats {
            MEASUREMENTS_PROCESSED_TOTAL
                .with_label_values(&[status, *serial])
                .inc_by(device.count as f64);
        }

        match result {
            Ok(inserted) => {
                debug!(
                    "Batch of {} measurements stored ({} new rows)",
                    batch.len(),
                    inserted
                );
                AckType::Ack
            }
            Err(Error::UnknownSensor(serial)) => {
                UNRESOLVED_BATCHES_TOTAL.inc();
                warn!(
                    "Requeueing batch of {}: sensor {} not in cache yet",
                    batch.len(),
                    serial
                );
                AckType::NackRequeue
            }
            Err(e) => {
                DB_FAILURES_TOTAL.inc();
                error!("Error writing batch of {} measurements: {}", batch.len(), e);
                AckType::NackRequeue
            }
        }
    }

    /// Resolves every sample against a cache snapshot and writes the batch.
    /// Nothing is written if any serial number is unknown.
    pub async fn ingest(&self, batch: &[SensorMeasurement]) -> Result<u64> {
        let resolve_start = Instant::now();
        let sensor_ids = self.cache.get_all();
        let records = resolve(batch, &sensor_ids)?;
        PROCESSING_DURATION_SECONDS
            .with_label_values(&[PHASE_RESOLVE])
            .observe(resolve_start.elapsed().as_secs_f64());

        let write_start = Instant::now();
        let inserted = self.sink.write_measurements(&records).await?;
        PROCESSING_DURATION_SECONDS
            .with_label_values(&[PHASE_DB_WRITE])
            .observe(write_start.elapsed().as_secs_f64());

        Ok(inserted)
    }
}

pub fn resolve(
    batch: &[SensorMeasurement],
    sensor_ids: &HashMap<String, i32>,
) -> Result<Vec<MeasurementRecord>> {
    batch
        .iter()
        .map(|m| {
            let sensor_id = sensor_ids
                .get(&m.serial)
                .copied()
                .ok_or_else(|| Error::UnknownSensor(m.serial.clone()))?;
            Ok(MeasurementRecord {
                time: m.timestamp,
                sensor_id,
                measurement: m.value,
            })
        })
        .collect()
}

fn device_stats(batch: &[SensorMeasurement]) -> HashMap<&str, DeviceStats> {
    let mut stats: HashMap<&str, DeviceStats> = HashMap::new();
    for m in batch {
        stats
            .entry(m.serial.as_str())
            .and_modify(|device| {
                device.count += 1;
                device.oldest = device.oldest.min(m.timestamp);
            })
            .or_insert(DeviceStats {
                count: 1,
                oldest: m.timestamp,
            });
    }
    stats
}
