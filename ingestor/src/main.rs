use axum::{http::StatusCode, routing::get, Router};
use broker::amqp::Broker;
use broker::routing::{
    sensor_binding, KeyKind, SensorLog, SensorMeasurement, SensorRegistration, ANY_SENSOR,
    EXCHANGE_IOT, QUEUE_MEASUREMENTS_STREAM, QUEUE_SENSOR_LOGS, QUEUE_SENSOR_REGISTRY,
};
use broker::stream::RedeliveryPolicy;
use broker::{stream, Encoding, QueueDurability, QueueKind, QueueTopology};
use ingestor::cache::SensorCache;
use ingestor::config::Config;
use ingestor::logs::{handle_log, LogFileWriter};
use ingestor::pipeline::MeasurementPipeline;
use ingestor::registry::handle_registration;
use ingestor::{db, metrics, rest};
use std::fmt::Display;
use std::sync::Arc;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const PIPELINE_TASK: &str = "Measurement pipeline";
const REGISTRY_TASK: &str = "Registry consumer";
const LOGS_TASK: &str = "Log consumer";
const SERVER_TASK: &str = "HTTP server";
const REFRESH_TASK: &str = "Cache refresh loop";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();

    info!("Starting IoT Ingestor");
    info!("AMQP broker: {}", config.rabbitmq_url.split('@').last().unwrap_or("***"));
    info!("Stream endpoint: {}:{}", config.stream.host, config.stream.port);
    info!("HTTP server: {}", config.http_addr);
    info!("Database: {}", config.database_host());

    or_exit(metrics::init_metrics(), "register metrics");

    let pool = or_exit(db::make_pool(&config.database_url).await, "connect to database");

    let cache = Arc::new(or_exit(
        SensorCache::new(pool.clone()).await,
        "load sensor cache",
    ));

    let shutdown = CancellationToken::new();

    let refresh_cache = cache.clone();
    let refresh_shutdown = shutdown.clone();
    let refresh_interval = config.cache_refresh;
    let refresh_handle = tokio::spawn(async move {
        refresh_cache
            .run_refresh_loop(refresh_interval, refresh_shutdown)
            .await;
    });

    let connection_name = format!("ingestor-{}", uuid::Uuid::new_v4());
    let broker = or_exit(
        Broker::connect(&config.rabbitmq_url, &connection_name, config.prefetch).await,
        "connect to AMQP broker",
    );
    or_exit(
        broker.declare_exchange(EXCHANGE_IOT).await,
        "declare exchange",
    );

    // The stream is declared over AMQP and read through the stream protocol.
    let measurements = QueueTopology::new(
        EXCHANGE_IOT,
        QUEUE_MEASUREMENTS_STREAM,
        &sensor_binding(ANY_SENSOR, KeyKind::Measurements),
        QueueDurability::Durable,
        QueueKind::Stream,
    )
    .with_max_length_bytes(config.stream_max_bytes);
    or_exit(
        broker.declare_topology(&measurements).await,
        "declare measurement stream",
    );

    let environment = or_exit(
        stream::connect(&config.stream).await,
        "connect to stream endpoint",
    );

    let pipeline = Arc::new(MeasurementPipeline::new(cache.clone(), pool.clone()));
    let pipeline_handle = or_exit(
        stream::subscribe_stream(
            &environment,
            QUEUE_MEASUREMENTS_STREAM,
            &config.stream_consumer_name,
            Encoding::Json,
            RedeliveryPolicy::new(config.redelivery_budget)
                .on_exhausted(|_| metrics::DROPPED_BATCHES_TOTAL.inc()),
            move |batch: Vec<SensorMeasurement>| {
                let pipeline = pipeline.clone();
                async move { pipeline.handle_batch(batch).await }
            },
            shutdown.clone(),
        )
        .await,
        "subscribe to measurement stream",
    );

    let registry = QueueTopology::new(
        EXCHANGE_IOT,
        QUEUE_SENSOR_REGISTRY,
        &sensor_binding(ANY_SENSOR, KeyKind::Registry),
        QueueDurability::Durable,
        QueueKind::Classic,
    );
    let registry_pool = pool.clone();
    let registry_handle = or_exit(
        broker
            .subscribe(
                &registry,
                Encoding::MessagePack,
                move |registration: SensorRegistration| {
                    let pool = registry_pool.clone();
                    async move { handle_registration(&pool, registration).await }
                },
                shutdown.clone(),
            )
            .await,
        "subscribe to sensor registry",
    );

    let logs = QueueTopology::new(
        EXCHANGE_IOT,
        QUEUE_SENSOR_LOGS,
        &sensor_binding(ANY_SENSOR, KeyKind::Logs),
        QueueDurability::Durable,
        QueueKind::Quorum,
    );
    let writer = LogFileWriter::new(&config.sensor_log_file);
    info!("Writing device logs to {}", config.sensor_log_file);
    let logs_handle = or_exit(
        broker
            .subscribe(
                &logs,
                Encoding::MessagePack,
                move |log: SensorLog| {
                    let writer = writer.clone();
                    async move { handle_log(&writer, log).await }
                },
                shutdown.clone(),
            )
            .await,
        "subscribe to sensor logs",
    );

    let publisher = or_exit(broker.publisher().await, "open publisher channel");

    // Build HTTP app with REST API and metrics endpoint
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .merge(rest::create_router(pool.clone(), publisher));

    let listener = or_exit(
        tokio::net::TcpListener::bind(&config.http_addr).await,
        "bind HTTP listener",
    );

    info!("HTTP server listening on {}", config.http_addr);

    let server_shutdown = shutdown.clone();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
            .unwrap_or_else(|e| {
                error!("HTTP server error: {}", e);
            });
    });

    let mut pipeline_handle = pipeline_handle;
    let mut registry_handle = registry_handle;
    let mut logs_handle = logs_handle;
    let mut server_handle = server_handle;

    let stopped = tokio::select! {
        res = &mut pipeline_handle => Some(task_exited(PIPELINE_TASK, res)),
        res = &mut registry_handle => Some(task_exited(REGISTRY_TASK, res)),
        res = &mut logs_handle => Some(task_exited(LOGS_TASK, res)),
        res = &mut server_handle => Some(task_exited(SERVER_TASK, res)),
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            None
        }
    };

    info!("Shutting down");
    shutdown.cancel();

    // Consumers settle their last delivery and release their channels before
    // the connections they run on are closed.
    let tasks = [
        (PIPELINE_TASK, pipeline_handle),
        (REGISTRY_TASK, registry_handle),
        (LOGS_TASK, logs_handle),
        (SERVER_TASK, server_handle),
        (REFRESH_TASK, refresh_handle),
    ];
    drain_tasks(tasks, stopped).await;

    // The stream consumer closed its own connection when its task exited.
    drop(environment);
    if let Err(e) = broker.close().await {
        error!("Error closing AMQP connection: {}", e);
    }
    pool.close().await;
    info!("Shutdown complete");
}

/// Waits for every task except `stopped`, whose result was already taken.
/// Returns how many did not exit cleanly.
async fn drain_tasks<const N: usize>(
    tasks: [(&'static str, JoinHandle<()>); N],
    stopped: Option<&str>,
) -> usize {
    let mut failed = 0;
    for (name, handle) in tasks {
        if stopped == Some(name) {
            continue;
        }
        if let Err(e) = handle.await {
            error!("{} did not exit cleanly: {}", name, e);
            failed += 1;
        }
    }
    failed
}

/// Reports a task that ended before shutdown was requested.
fn task_exited(name: &'static str, result: Result<(), JoinError>) -> &'static str {
    match result {
        Ok(()) => error!("{} terminated", name),
        Err(e) => error!("{} terminated abnormally: {}", name, e),
    }
    name
}

async fn metrics_handler() -> Result<String, StatusCode> {
    metrics::gather_metrics().map_err(|e| {
        error!("Failed to encode metrics: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

/// Unwraps a startup step, exiting the process when it failed.
fn or_exit<T, E: Display>(result: Result<T, E>, step: &str) -> T {
    match result {
        Ok(value) => value,
        Err(e) => {
            error!("Failed to {}: {}", step, e);
            std::process::exit(1);
        }
    }
}
