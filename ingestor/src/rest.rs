use crate::db;
use crate::model::{MeasurementResponse, SensorRecord};
use crate::validate::validate_serial_number;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use broker::amqp::Publisher;
use broker::routing::{sensor_key_with, KeyKind, SensorCommand, EXCHANGE_IOT, KNOWN_COMMANDS};
use broker::Encoding;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use sqlx::PgPool;
use std::collections::HashMap;
use tracing::{error, info, warn};

const DEFAULT_LIMIT: usize = 100;
const MAX_LIMIT: usize = 1000;

#[derive(Clone)]
struct AppState {
    pool: PgPool,
    publisher: Publisher,
}

#[derive(Debug, Deserialize)]
pub struct MeasurementQuery {
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    limit: Option<usize>,
    offset: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    command: String,
    #[serde(default)]
    params: HashMap<String, Value>,
}

pub fn create_router(pool: PgPool, publisher: Publisher) -> Router {
    let state = AppState { pool, publisher };

    Router::new()
        .route("/ready", get(readiness))
        .route("/api/v1/sensors", get(get_sensors))
        .route(
            "/api/v1/sensors/:serial",
            get(get_sensor).delete(delete_sensor),
        )
        .route("/api/v1/sensors/:serial/measurements", get(get_measurements))
        .route("/api/v1/sensors/:serial/commands", post(post_command))
        .with_state(state)
}

async fn get_sensors(State(state): State<AppState>) -> Result<Json<Vec<SensorRecord>>, AppError> {
    let sensors = db::list_sensors(&state.pool).await?;
    Ok(Json(sensors))
}

async fn get_sensor(
    State(state): State<AppState>,
    Path(serial): Path<String>,
) -> Result<Json<SensorRecord>, AppError> {
    match db::get_sensor(&state.pool, &serial).await? {
        Some(sensor) => Ok(Json(sensor)),
        None => Err(AppError::NotFound(format!("Sensor {} not found", serial))),
    }
}

/// Deletes the sensor and, through the cascade, its measurements. The
/// ingestor cache forgets it on its next refresh.
async fn delete_sensor(
    State(state): State<AppState>,
    Path(serial): Path<String>,
) -> Result<StatusCode, AppError> {
    if !db::delete_sensor(&state.pool, &serial).await? {
        return Err(AppError::NotFound(format!("Sensor {} not found", serial)));
    }
    info!(serial = %serial, "Deleted sensor and its measurements");
    Ok(StatusCode::NO_CONTENT)
}

async fn readiness(State(state): State<AppState>) -> Result<&'static str, AppError> {
    let database = db::ping(&state.pool).await;
    check_ready(database, state.publisher.is_connected())?;
    Ok("OK")
}

fn check_ready(database: crate::errors::Result<()>, broker_connected: bool) -> Result<(), AppError> {
    if let Err(e) = database {
        warn!("Readiness check failed: {}", e);
        return Err(AppError::Unavailable("Database pool not ready"));
    }
    if !broker_connected {
        return Err(AppError::Unavailable("Messaging system not ready"));
    }
    Ok(())
}

async fn get_measurements(
    State(state): State<AppState>,
    Path(serial): Path<String>,
    Query(params): Query<MeasurementQuery>,
) -> Result<Json<MeasurementResponse>, AppError> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
    let offset = params.offset.unwrap_or(0);

    let data = db::query_measurements(
        &state.pool,
        &serial,
        params.start,
        params.end,
        limit,
        offset,
    )
    .await?;

    Ok(Json(MeasurementResponse {
        serial_number: serial,
        total: data.len(),
        data,
        limit,
        offset,
    }))
}

async fn post_command(
    State(state): State<AppState>,
    Path(serial): Path<String>,
    Json(request): Json<CommandRequest>,
) -> Result<StatusCode, AppError> {
    let (routing_key, command) = build_command(&serial, request)?;

    state
        .publisher
        .publish(EXCHANGE_IOT, &routing_key, Encoding::MessagePack, &command)
        .await?;

    info!(serial = %serial, "Published {} command", command.command);
    Ok(StatusCode::ACCEPTED)
}

/// Checks a command request and turns it into its routing key and message.
fn build_command(
    serial: &str,
    request: CommandRequest,
) -> Result<(String, SensorCommand), AppError> {
    validate_serial_number(serial).map_err(|e| AppError::BadRequest(e.to_string()))?;

    if !KNOWN_COMMANDS.contains(&request.command.as_str()) {
        return Err(AppError::BadRequest(format!(
            "Unknown command {}, expected one of {:?}",
            request.command, KNOWN_COMMANDS
        )));
    }

    let routing_key = sensor_key_with(serial, KeyKind::Commands, &request.command);
    let mut command = SensorCommand::new(serial, &request.command);
    command.params = request.params;
    Ok((routing_key, command))
}

#[derive(Debug)]
enum AppError {
    BadRequest(String),
    NotFound(String),
    Unavailable(&'static str),
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::BadRequest(message) => (StatusCode::BAD_REQUEST, message).into_response(),
            AppError::NotFound(message) => (StatusCode::NOT_FOUND, message).into_response(),
            AppError::Unavailable(message) => {
                (StatusCode::SERVICE_UNAVAILABLE, message).into_response()
            }
            AppError::Internal(e) => {
                error!("API error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Internal server error: {}", e),
                )
                    .into_response()
            }
        }
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::Internal(err.into())
    }
}
