use crate::signal::Signal;
use crate::state::{ControlSignals, PowerState};
use async_trait::async_trait;
use broker::amqp::Publisher;
use broker::routing::{sensor_key, KeyKind, SensorLog, SensorMeasurement, EXCHANGE_IOT};
use broker::Encoding;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_BATCH_INTERVAL: Duration = Duration::from_secs(1);

const MIN_SAMPLE_PERIOD: Duration = Duration::from_millis(1);
const MAX_SAMPLE_PERIOD: Duration = Duration::from_secs(3600);

/// Outbound side of a device.
#[async_trait]
pub trait DevicePublisher: Send + Sync {
    async fn publish_measurements(
        &self,
        serial_number: &str,
        batch: &[SensorMeasurement],
    ) -> broker::Result<()>;

    async fn publish_log(&self, log: &SensorLog) -> broker::Result<()>;
}

#[async_trait]
impl DevicePublisher for Publisher {
    async fn publish_measurements(
        &self,
        serial_number: &str,
        batch: &[SensorMeasurement],
    ) -> broker::Result<()> {
        self.publish(
            EXCHANGE_IOT,
            &sensor_key(serial_number, KeyKind::Measurements),
            Encoding::Json,
            &batch,
        )
        .await
    }

    async fn publish_log(&self, log: &SensorLog) -> broker::Result<()> {
        self.publish(
            EXCHANGE_IOT,
            &sensor_key(&log.serial_number, KeyKind::Logs),
            Encoding::MessagePack,
            log,
        )
        .await
    }
}

#[async_trait]
impl<T: DevicePublisher + ?Sized> DevicePublisher for Arc<T> {
    async fn publish_measurements(
        &self,
        serial_number: &str,
        batch: &[SensorMeasurement],
    ) -> broker::Result<()> {
        (**self).publish_measurements(serial_number, batch).await
    }

    async fn publish_log(&self, log: &SensorLog) -> broker::Result<()> {
        (**self).publish_log(log).await
    }
}

/// Period of the sampling timer for `frequency` Hz.
pub fn sample_period(frequency: f64) -> Duration {
    let secs = 1.0 / frequency;
    if secs.is_nan() {
        return MAX_SAMPLE_PERIOD;
    }
    Duration::from_secs_f64(
        secs.clamp(MIN_SAMPLE_PERIOD.as_secs_f64(), MAX_SAMPLE_PERIOD.as_secs_f64()),
    )
}

fn timer(period: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// The device control loop. It alone owns the sampling and batch timers.
pub struct Emitter<P> {
    serial_number: String,
    publisher: P,
    signals: ControlSignals,
    signal: Signal,
    batch_interval: Duration,
    buffer: Vec<SensorMeasurement>,
}

impl<P: DevicePublisher> Emitter<P> {
    pub fn new(
        serial_number: &str,
        publisher: P,
        signals: ControlSignals,
        signal: Signal,
        batch_interval: Duration,
    ) -> Self {
        Self {
            serial_number: serial_number.to_string(),
            publisher,
            signals,
            signal,
            batch_interval,
            buffer: Vec::new(),
        }
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        let started_at = Utc::now();
        let start = Instant::now();

        let mut sampling: Option<Interval> = None;
        let mut batching: Option<Interval> = None;
        if *self.signals.power.borrow_and_update() == PowerState::Awake {
            sampling = Some(timer(self.current_period()));
            batching = Some(timer(self.batch_interval));
        }
        self.signals.sample_frequency.borrow_and_update();

        info!(
            serial = %self.serial_number,
            "Emitting every {:?}, publishing every {:?}",
            self.current_period(),
            self.batch_interval
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.flush().await;
                    info!(serial = %self.serial_number, "Emission loop stopped");
                    return;
                }
                _ = next_tick(&mut sampling) => {
                    self.take_sample(started_at, start.elapsed());
                }
                _ = next_tick(&mut batching) => {
                    self.flush().await;
                }
                changed = self.signals.power.changed() => {
                    if changed.is_err() {
                        warn!(serial = %self.serial_number, "State machine gone, stopping emission");
                        self.flush().await;
                        return;
                    }
                    let power = *self.signals.power.borrow_and_update();
                    match power {
                        PowerState::Asleep => {
                            sampling = None;
                            batching = None;
                            self.flush().await;
                        }
                        PowerState::Awake => {
                            sampling = Some(timer(self.current_period()));
                            batching = Some(timer(self.batch_interval));
                        }
                    }
                    debug!(serial = %self.serial_number, "Timers updated for {:?}", power);
                }
                changed = self.signals.sample_frequency.changed() => {
                    if changed.is_err() {
                        warn!(serial = %self.serial_number, "State machine gone, stopping emission");
                        self.flush().await;
                        return;
                    }
                    let frequency = *self.signals.sample_frequency.borrow_and_update();
                    // While asleep the new rate is picked up on the next awake.
                    if sampling.is_some() {
                        sampling = Some(timer(sample_period(frequency)));
                        debug!(serial = %self.serial_number, "Sampling timer recreated at {} Hz", frequency);
                    }
                }
            }
        }
    }

    fn current_period(&self) -> Duration {
        sample_period(*self.signals.sample_frequency.borrow())
    }

    fn take_sample(&mut self, started_at: DateTime<Utc>, elapsed: Duration) {
        let offset = chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero());
        self.buffer.push(SensorMeasurement {
            serial: self.serial_number.clone(),
            timestamp: started_at + offset,
            value: self.signal.sample(elapsed.as_secs_f64()),
        });
    }

    async fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }

        let batch = std::mem::take(&mut self.buffer);
        match self
            .publisher
            .publish_measurements(&self.serial_number, &batch)
            .await
        {
            Ok(()) => debug!(serial = %self.serial_number, "Published {} measurements", batch.len()),
            Err(e) => warn!(
                serial = %self.serial_number,
                "Dropping batch of {} measurements: {}",
                batch.len(),
                e
            ),
        }
    }
}

/// Drains queued device logs to the broker until `shutdown` fires or every
/// logger is dropped.
pub async fn forward_logs<P: DevicePublisher>(
    publisher: P,
    mut logs: mpsc::Receiver<SensorLog>,
    shutdown: CancellationToken,
) {
    loop {
        let log = tokio::select! {
            _ = shutdown.cancelled() => return,
            log = logs.recv() => match log {
                Some(log) => log,
                None => return,
            },
        };

        if let Err(e) = publisher.publish_log(&log).await {
            warn!(serial = %log.serial_number, "Could not forward log: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{DeviceLogger, StateMachine};
    use broker::routing::{
        SensorCommand, COMMAND_AWAKE, COMMAND_CHANGE_SAMPLE_FREQUENCY, COMMAND_SLEEP,
        PARAM_SAMPLE_FREQUENCY,
    };
    use std::sync::Mutex;
    use tokio::task::JoinHandle;
    use tokio::time::sleep;

    #[derive(Default)]
    struct RecordingPublisher {
        batches: Mutex<Vec<Vec<SensorMeasurement>>>,
        logs: Mutex<Vec<SensorLog>>,
    }

    impl RecordingPublisher {
        fn batch_sizes(&self) -> Vec<usize> {
            self.batches.lock().unwrap().iter().map(Vec::len).collect()
        }
    }

    #[async_trait]
    impl DevicePublisher for RecordingPublisher {
        async fn publish_measurements(
            &self,
            _serial_number: &str,
            batch: &[SensorMeasurement],
        ) -> broker::Result<()> {
            self.batches.lock().unwrap().push(batch.to_vec());
            Ok(())
        }

        async fn publish_log(&self, log: &SensorLog) -> broker::Result<()> {
            self.logs.lock().unwrap().push(log.clone());
            Ok(())
        }
    }

    struct Device {
        machine: StateMachine,
        publisher: Arc<RecordingPublisher>,
        shutdown: CancellationToken,
        handle: JoinHandle<()>,
    }

    fn start(frequency: f64) -> Device {
        let (logger, _logs) = DeviceLogger::channel("dev-1", 64);
        let (machine, signals) = StateMachine::new(frequency, logger);
        let publisher = Arc::new(RecordingPublisher::default());
        let shutdown = CancellationToken::new();
        let emitter = Emitter::new(
            "dev-1",
            publisher.clone(),
            signals,
            Signal::accelerometer(),
            DEFAULT_BATCH_INTERVAL,
        );
        let handle = tokio::spawn(emitter.run(shutdown.clone()));
        Device {
            machine,
            publisher,
            shutdown,
            handle,
        }
    }

    fn frequency_command(frequency: f64) -> SensorCommand {
        let mut command = SensorCommand::new("dev-1", COMMAND_CHANGE_SAMPLE_FREQUENCY);
        command
            .params
            .insert(PARAM_SAMPLE_FREQUENCY.to_string(), serde_json::json!(frequency));
        command
    }

    #[test]
    fn test_sample_period() {
        assert_eq!(sample_period(10.0), Duration::from_millis(100));
        assert_eq!(sample_period(1e9), MIN_SAMPLE_PERIOD);
        assert_eq!(sample_period(0.0), MAX_SAMPLE_PERIOD);
        assert_eq!(sample_period(f64::NAN), MAX_SAMPLE_PERIOD);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batches_published_every_interval() {
        let device = start(10.0);

        sleep(Duration::from_millis(2050)).await;

        let sizes = device.publisher.batch_sizes();
        assert_eq!(sizes.len(), 2);
        assert!(sizes.iter().all(|n| (9..=11).contains(n)), "{:?}", sizes);

        let batches = device.publisher.batches.lock().unwrap().clone();
        let first = &batches[0];
        assert!(first.iter().all(|m| m.serial == "dev-1"));
        assert!(first.windows(2).all(|w| w[0].timestamp < w[1].timestamp));

        device.shutdown.cancel();
        device.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_buffer_not_published() {
        let device = start(0.1);

        sleep(Duration::from_millis(3500)).await;

        assert!(device.publisher.batch_sizes().is_empty());

        device.shutdown.cancel();
        device.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_stops_emission_until_awake() {
        let device = start(10.0);
        sleep(Duration::from_millis(1050)).await;
        assert_eq!(device.publisher.batch_sizes().len(), 1);

        device
            .machine
            .handle_command(&SensorCommand::new("dev-1", COMMAND_SLEEP));
        sleep(Duration::from_millis(5000)).await;
        let while_asleep = device.publisher.batch_sizes();
        sleep(Duration::from_millis(5000)).await;
        assert_eq!(device.publisher.batch_sizes(), while_asleep);

        device
            .machine
            .handle_command(&SensorCommand::new("dev-1", COMMAND_AWAKE));
        sleep(Duration::from_millis(1050)).await;
        assert_eq!(device.publisher.batch_sizes().len(), while_asleep.len() + 1);

        device.shutdown.cancel();
        device.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_frequency_change_recreates_sampling_timer() {
        let device = start(10.0);
        sleep(Duration::from_millis(1050)).await;

        device.machine.handle_command(&frequency_command(50.0));
        sleep(Duration::from_millis(1000)).await;

        let sizes = device.publisher.batch_sizes();
        assert_eq!(sizes.len(), 2);
        assert!((45..=51).contains(&sizes[1]), "{:?}", sizes);

        device.shutdown.cancel();
        device.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_frequency_change_while_asleep_applies_on_awake() {
        let device = start(10.0);
        device
            .machine
            .handle_command(&SensorCommand::new("dev-1", COMMAND_SLEEP));
        device.machine.handle_command(&frequency_command(20.0));
        sleep(Duration::from_millis(3000)).await;
        assert!(device.publisher.batch_sizes().is_empty());

        device
            .machine
            .handle_command(&SensorCommand::new("dev-1", COMMAND_AWAKE));
        sleep(Duration::from_millis(1050)).await;

        let sizes = device.publisher.batch_sizes();
        assert_eq!(sizes.len(), 1);
        assert!((19..=21).contains(&sizes[0]), "{:?}", sizes);

        device.shutdown.cancel();
        device.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_buffer() {
        let device = start(10.0);
        sleep(Duration::from_millis(550)).await;

        device.shutdown.cancel();
        device.handle.await.unwrap();

        let sizes = device.publisher.batch_sizes();
        assert_eq!(sizes.len(), 1);
        assert!((4..=6).contains(&sizes[0]), "{:?}", sizes);
    }

    #[tokio::test]
    async fn test_logs_forwarded_in_order() {
        let (logger, logs) = DeviceLogger::channel("dev-1", 8);
        let publisher = Arc::new(RecordingPublisher::default());
        let shutdown = CancellationToken::new();

        logger.info("one");
        logger.warning("two");
        drop(logger);

        forward_logs(publisher.clone(), logs, shutdown).await;

        let forwarded = publisher.logs.lock().unwrap();
        let messages: Vec<&str> = forwarded.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(messages, vec!["one", "two"]);
    }
}
