use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Row of the `sensor_measurement` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct MeasurementRecord {
    pub time: DateTime<Utc>,
    pub sensor_id: i32,
    pub measurement: f64,
}

/// Row of the `sensor` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct SensorRecord {
    pub id: i32,
    pub serial_number: String,
    pub sample_frequency: f64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct MeasurementPoint {
    pub time: DateTime<Utc>,
    pub measurement: f64,
}

/// REST API response wrapper
#[derive(Debug, Serialize)]
pub struct MeasurementResponse {
    pub serial_number: String,
    pub data: Vec<MeasurementPoint>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}
