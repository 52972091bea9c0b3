use crate::errors::Result;
use crate::model::{MeasurementPoint, MeasurementRecord, SensorRecord};
use async_trait::async_trait;
use broker::routing::SensorRegistration;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Rows per insert statement, bounding statement size for large batches.
pub const MEASUREMENT_CHUNK_SIZE: usize = 25_000;

const INSERT_MEASUREMENTS: &str = r#"
    INSERT INTO sensor_measurement (time, sensor_id, measurement)
    SELECT * FROM UNNEST($1::timestamptz[], $2::int[], $3::float8[])
        AS t(time, sensor_id, measurement)
    ON CONFLICT (sensor_id, time) DO NOTHING
    "#;

pub async fn make_pool(database_url: &str) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations completed");

    Ok(pool)
}

/// Source of the serial number to sensor id mapping.
#[async_trait]
pub trait SensorDirectory: Send + Sync {
    async fn sensor_ids(&self) -> Result<HashMap<String, i32>>;
}

/// Idempotent bulk writer for measurement rows.
#[async_trait]
pub trait MeasurementSink: Send + Sync {
    /// Writes `records`, silently skipping any `(sensor_id, time)` already
    /// stored. Returns the number of rows actually inserted.
    async fn write_measurements(&self, records: &[MeasurementRecord]) -> Result<u64>;
}

#[async_trait]
pub trait SensorRegistry: Send + Sync {
    /// Returns `false` when the serial number was already registered.
    async fn register_sensor(&self, registration: &SensorRegistration) -> Result<bool>;
}

#[async_trait]
impl SensorDirectory for PgPool {
    async fn sensor_ids(&self) -> Result<HashMap<String, i32>> {
        let rows: Vec<(String, i32)> = sqlx::query_as("SELECT serial_number, id FROM sensor")
            .fetch_all(self)
            .await?;
        Ok(rows.into_iter().collect())
    }
}

#[async_trait]
impl MeasurementSink for PgPool {
    async fn write_measurements(&self, records: &[MeasurementRecord]) -> Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut tx = self.begin().await?;
        let mut inserted = 0;

        for chunk in records.chunks(MEASUREMENT_CHUNK_SIZE) {
            let times: Vec<DateTime<Utc>> = chunk.iter().map(|r| r.time).collect();
            let sensor_ids: Vec<i32> = chunk.iter().map(|r| r.sensor_id).collect();
            let measurements: Vec<f64> = chunk.iter().map(|r| r.measurement).collect();

            let result = sqlx::query(INSERT_MEASUREMENTS)
                .bind(&times)
                .bind(&sensor_ids)
                .bind(&measurements)
                .execute(&mut *tx)
                .await?;
            inserted += result.rows_affected();
        }

        tx.commit().await?;
        debug!(
            "Inserted {} of {} measurements into sensor_measurement",
            inserted,
            records.len()
        );
        Ok(inserted)
    }
}

#[async_trait]
impl SensorRegistry for PgPool {
    async fn register_sensor(&self, registration: &SensorRegistration) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO sensor (serial_number, sample_frequency) VALUES ($1, $2)
             ON CONFLICT (serial_number) DO NOTHING",
        )
        .bind(&registration.serial_number)
        .bind(registration.sample_frequency)
        .execute(self)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl<T: SensorDirectory + ?Sized> SensorDirectory for Arc<T> {
    async fn sensor_ids(&self) -> Result<HashMap<String, i32>> {
        (**self).sensor_ids().await
    }
}

#[async_trait]
impl<T: MeasurementSink + ?Sized> MeasurementSink for Arc<T> {
    async fn write_measurements(&self, records: &[MeasurementRecord]) -> Result<u64> {
        (**self).write_measurements(records).await
    }
}

#[async_trait]
impl<T: SensorRegistry + ?Sized> SensorRegistry for Arc<T> {
    async fn register_sensor(&self, registration: &SensorRegistration) -> Result<bool> {
        (**self).register_sensor(registration).await
    }
}

pub async fn list_sensors(pool: &PgPool) -> Result<Vec<SensorRecord>> {
    let sensors = sqlx::query_as::<_, SensorRecord>(
        "SELECT id, serial_number, sample_frequency FROM sensor ORDER BY serial_number",
    )
    .fetch_all(pool)
    .await?;
    Ok(sensors)
}

pub async fn get_sensor(pool: &PgPool, serial_number: &str) -> Result<Option<SensorRecord>> {
    let sensor = sqlx::query_as::<_, SensorRecord>(
        "SELECT id, serial_number, sample_frequency FROM sensor WHERE serial_number = $1",
    )
    .bind(serial_number)
    .fetch_optional(pool)
    .await?;
    Ok(sensor)
}

/// Removes a sensor together with all of its measurements. Returns `false`
/// when no such sensor exists.
pub async fn delete_sensor(pool: &PgPool, serial_number: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM sensor WHERE serial_number = $1")
        .bind(serial_number)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn ping(pool: &PgPool) -> Result<()> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// Latest-first measurements of one sensor within an optional time window.
pub async fn query_measurements(
    pool: &PgPool,
    serial_number: &str,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    limit: usize,
    offset: usize,
) -> Result<Vec<MeasurementPoint>> {
    let points = sqlx::query_as::<_, MeasurementPoint>(
        "SELECT m.time, m.measurement
         FROM sensor_measurement m
         JOIN sensor s ON s.id = m.sensor_id
         WHERE s.serial_number = $1
           AND ($2::timestamptz IS NULL OR m.time >= $2)
           AND ($3::timestamptz IS NULL OR m.time <= $3)
         ORDER BY m.time DESC
         LIMIT $4 OFFSET $5",
    )
    .bind(serial_number)
    .bind(start)
    .bind(end)
    .bind(limit as i64)
    .bind(offset as i64)
    .fetch_all(pool)
    .await?;
    Ok(points)
}
