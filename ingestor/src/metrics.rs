use lazy_static::lazy_static;
use prometheus::{
    exponential_buckets, Counter, CounterVec, Encoder, Histogram, HistogramOpts, HistogramVec,
    IntGauge, Opts, Registry, TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref MESSAGES_RECEIVED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "sensor_measurements_messages_received_total",
        "Total measurement batches received from the stream"
    ))
    .unwrap();
    pub static ref MEASUREMENTS_PROCESSED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            "sensor_measurements_processed_total",
            "Total sensor measurements processed"
        ),
        &["status", "serial"]
    )
    .unwrap();
    pub static ref BATCH_SIZE: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "sensor_measurements_batch_size",
            "Number of measurements in each batch"
        )
        .buckets(exponential_buckets(1.0, 2.0, 20).unwrap())
    )
    .unwrap();
    pub static ref PROCESSING_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "sensor_measurements_processing_duration_seconds",
            "Time taken to process a batch of measurements"
        )
        .buckets(exponential_buckets(0.001, 2.0, 15).unwrap()),
        &["phase"]
    )
    .unwrap();
    pub static ref E2E_LATENCY_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "sensor_measurements_e2e_latency_seconds",
            "Time from the oldest sample of a device in a batch to processing complete"
        )
        .buckets(exponential_buckets(0.01, 2.0, 12).unwrap()),
        &["serial"]
    )
    .unwrap();
    pub static ref DB_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "sensor_measurements_db_errors_total",
        "Total database write failures"
    ))
    .unwrap();
    pub static ref UNRESOLVED_BATCHES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "sensor_measurements_unresolved_batches_total",
        "Total batches requeued because a serial number was not in the sensor cache"
    ))
    .unwrap();
    pub static ref DROPPED_BATCHES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "sensor_measurements_dropped_batches_total",
        "Total batches given up after redelivery kept failing for the whole budget"
    ))
    .unwrap();
    pub static ref SENSOR_CACHE_SIZE: IntGauge = IntGauge::with_opts(Opts::new(
        "sensor_cache_size",
        "Sensors currently held by the identity cache"
    ))
    .unwrap();
    pub static ref CACHE_REFRESH_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "sensor_cache_refresh_failures_total",
        "Total failed sensor cache refreshes"
    ))
    .unwrap();
}

pub const PHASE_RESOLVE: &str = "resolve";
pub const PHASE_DB_WRITE: &str = "db_write";
pub const PHASE_TOTAL: &str = "total";

pub fn init_metrics() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(MESSAGES_RECEIVED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(MEASUREMENTS_PROCESSED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(BATCH_SIZE.clone()))?;
    REGISTRY.register(Box::new(PROCESSING_DURATION_SECONDS.clone()))?;
    REGISTRY.register(Box::new(E2E_LATENCY_SECONDS.clone()))?;
    REGISTRY.register(Box::new(DB_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(UNRESOLVED_BATCHES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DROPPED_BATCHES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(SENSOR_CACHE_SIZE.clone()))?;
    REGISTRY.register(Box::new(CACHE_REFRESH_FAILURES_TOTAL.clone()))?;
    Ok(())
}

pub fn gather_metrics() -> prometheus::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}
