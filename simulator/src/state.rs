//! Command state of one device.
//!
//! Commands arrive on the consumer task while sampling runs on the emission
//! loop. The two only meet through `watch` channels: a handler replaces the
//! latest target value and the loop picks it up on its own turn.

use crate::errors::{Error, Result};
use broker::routing::{
    LogLevel, SensorCommand, SensorLog, COMMAND_AWAKE, COMMAND_CHANGE_SAMPLE_FREQUENCY,
    COMMAND_SLEEP, PARAM_SAMPLE_FREQUENCY,
};
use broker::AckType;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    Awake,
    Asleep,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    Applied,
    /// The device was already in the requested state.
    AlreadyInState,
    /// Known command with unusable parameters.
    Rejected(String),
    Unknown,
}

impl CommandOutcome {
    pub fn ack_type(&self) -> AckType {
        match self {
            CommandOutcome::Applied
            | CommandOutcome::AlreadyInState
            | CommandOutcome::Rejected(_) => AckType::Ack,
            CommandOutcome::Unknown => AckType::NackDiscard,
        }
    }
}

/// Receiving ends the emission loop waits on.
pub struct ControlSignals {
    pub power: watch::Receiver<PowerState>,
    pub sample_frequency: watch::Receiver<f64>,
}

pub struct StateMachine {
    power: watch::Sender<PowerState>,
    sample_frequency: watch::Sender<f64>,
    logger: DeviceLogger,
}

impl StateMachine {
    /// Starts `Awake` at `sample_frequency` Hz.
    pub fn new(sample_frequency: f64, logger: DeviceLogger) -> (Self, ControlSignals) {
        let (power, power_rx) = watch::channel(PowerState::Awake);
        let (frequency, frequency_rx) = watch::channel(sample_frequency);

        let machine = Self {
            power,
            sample_frequency: frequency,
            logger,
        };
        let signals = ControlSignals {
            power: power_rx,
            sample_frequency: frequency_rx,
        };
        (machine, signals)
    }

    pub fn power_state(&self) -> PowerState {
        *self.power.borrow()
    }

    pub fn sample_frequency(&self) -> f64 {
        *self.sample_frequency.borrow()
    }

    pub fn handle_command(&self, command: &SensorCommand) -> CommandOutcome {
        match command.command.as_str() {
            COMMAND_SLEEP => self.set_power(PowerState::Asleep),
            COMMAND_AWAKE => self.set_power(PowerState::Awake),
            COMMAND_CHANGE_SAMPLE_FREQUENCY => self.change_sample_frequency(&command.params),
            other => {
                self.logger
                    .warning(format!("Discarding unknown command {:?}", other));
                CommandOutcome::Unknown
            }
        }
    }

    fn set_power(&self, target: PowerState) -> CommandOutcome {
        let changed = self.power.send_if_modified(|state| {
            if *state == target {
                return false;
            }
            *state = target;
            true
        });

        match (changed, target) {
            (true, PowerState::Asleep) => {
                self.logger.info("Sensor is set to sleep");
                CommandOutcome::Applied
            }
            (true, PowerState::Awake) => {
                self.logger.info("Sensor is awake from sleep");
                CommandOutcome::Applied
            }
            (false, PowerState::Asleep) => {
                self.logger.info("Sensor is already in a sleep state");
                CommandOutcome::AlreadyInState
            }
            (false, PowerState::Awake) => {
                self.logger.info("Sensor is already in an awake state");
                CommandOutcome::AlreadyInState
            }
        }
    }

    fn change_sample_frequency(
        &self,
        params: &HashMap<String, serde_json::Value>,
    ) -> CommandOutcome {
        let frequency = match parse_sample_frequency(params) {
            Ok(frequency) => frequency,
            Err(e) => {
                self.logger.warning(format!("Rejected frequency change: {}", e));
                return CommandOutcome::Rejected(e.to_string());
            }
        };

        self.sample_frequency.send_replace(frequency);

        if self.power_state() == PowerState::Asleep {
            self.logger.info(format!(
                "Sample frequency changed to {} [Hz], applied once the sensor is awake",
                frequency
            ));
        } else {
            self.logger
                .info(format!("Sample frequency changed to {} [Hz]", frequency));
        }
        CommandOutcome::Applied
    }
}

pub fn parse_sample_frequency(params: &HashMap<String, serde_json::Value>) -> Result<f64> {
    let value = params.get(PARAM_SAMPLE_FREQUENCY).ok_or_else(|| {
        Error::Validation(format!("missing parameter {}", PARAM_SAMPLE_FREQUENCY))
    })?;

    let frequency = value.as_f64().ok_or_else(|| {
        Error::Validation(format!("{} is not a number: {}", PARAM_SAMPLE_FREQUENCY, value))
    })?;

    if !frequency.is_finite() || frequency <= 0.0 {
        return Err(Error::Validation(format!(
            "{} must be positive, got {}",
            PARAM_SAMPLE_FREQUENCY, frequency
        )));
    }
    Ok(frequency)
}

/// Traces device events locally and queues them for forwarding to the broker.
///
/// Forwarding is best effort: when the queue is full the record is dropped.
#[derive(Clone)]
pub struct DeviceLogger {
    serial_number: String,
    tx: mpsc::Sender<SensorLog>,
}

impl DeviceLogger {
    pub fn channel(serial_number: &str, capacity: usize) -> (Self, mpsc::Receiver<SensorLog>) {
        let (tx, rx) = mpsc::channel(capacity);
        let logger = Self {
            serial_number: serial_number.to_string(),
            tx,
        };
        (logger, rx)
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message.into());
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.log(LogLevel::Warning, message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message.into());
    }

    fn log(&self, level: LogLevel, message: String) {
        match level {
            LogLevel::Info => info!(serial = %self.serial_number, "{}", message),
            LogLevel::Warning => warn!(serial = %self.serial_number, "{}", message),
            LogLevel::Error => error!(serial = %self.serial_number, "{}", message),
        }

        let record = SensorLog {
            serial_number: self.serial_number.clone(),
            timestamp: Utc::now(),
            level,
            message,
        };
        if let Err(mpsc::error::TrySendError::Full(dropped)) = self.tx.try_send(record) {
            warn!(
                serial = %self.serial_number,
                "Log forwarding queue full, dropping: {}", dropped.message
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn machine(frequency: f64) -> (StateMachine, ControlSignals, mpsc::Receiver<SensorLog>) {
        let (logger, logs) = DeviceLogger::channel("dev-1", 16);
        let (machine, signals) = StateMachine::new(frequency, logger);
        (machine, signals, logs)
    }

    fn command(name: &str) -> SensorCommand {
        SensorCommand::new("dev-1", name)
    }

    fn frequency_command(value: serde_json::Value) -> SensorCommand {
        let mut command = command(COMMAND_CHANGE_SAMPLE_FREQUENCY);
        command
            .params
            .insert(PARAM_SAMPLE_FREQUENCY.to_string(), value);
        command
    }

    #[test]
    fn test_initial_state() {
        let (machine, signals, _logs) = machine(10.0);

        assert_eq!(machine.power_state(), PowerState::Awake);
        assert_eq!(machine.sample_frequency(), 10.0);
        assert_eq!(*signals.power.borrow(), PowerState::Awake);
    }

    #[test]
    fn test_sleep_then_awake() {
        let (machine, mut signals, _logs) = machine(10.0);

        assert_eq!(
            machine.handle_command(&command(COMMAND_SLEEP)),
            CommandOutcome::Applied
        );
        assert!(signals.power.has_changed().unwrap());
        assert_eq!(*signals.power.borrow_and_update(), PowerState::Asleep);

        assert_eq!(
            machine.handle_command(&command(COMMAND_AWAKE)),
            CommandOutcome::Applied
        );
        assert_eq!(*signals.power.borrow_and_update(), PowerState::Awake);
    }

    #[test]
    fn test_repeated_sleep_is_noop() {
        let (machine, mut signals, _logs) = machine(10.0);
        machine.handle_command(&command(COMMAND_SLEEP));
        signals.power.borrow_and_update();

        let outcome = machine.handle_command(&command(COMMAND_SLEEP));

        assert_eq!(outcome, CommandOutcome::AlreadyInState);
        assert_eq!(outcome.ack_type(), AckType::Ack);
        assert!(!signals.power.has_changed().unwrap());
    }

    #[test]
    fn test_awake_when_awake_is_noop() {
        let (machine, signals, _logs) = machine(10.0);

        assert_eq!(
            machine.handle_command(&command(COMMAND_AWAKE)),
            CommandOutcome::AlreadyInState
        );
        assert!(!signals.power.has_changed().unwrap());
    }

    #[test]
    fn test_change_sample_frequency() {
        let (machine, mut signals, _logs) = machine(10.0);

        let outcome = machine.handle_command(&frequency_command(json!(25.5)));

        assert_eq!(outcome, CommandOutcome::Applied);
        assert_eq!(machine.sample_frequency(), 25.5);
        assert_eq!(*signals.sample_frequency.borrow_and_update(), 25.5);
    }

    #[test]
    fn test_integer_frequency_accepted() {
        let (machine, _signals, _logs) = machine(10.0);

        machine.handle_command(&frequency_command(json!(4)));

        assert_eq!(machine.sample_frequency(), 4.0);
    }

    #[test]
    fn test_change_frequency_while_asleep() {
        let (machine, _signals, _logs) = machine(10.0);
        machine.handle_command(&command(COMMAND_SLEEP));

        let outcome = machine.handle_command(&frequency_command(json!(50.0)));

        assert_eq!(outcome, CommandOutcome::Applied);
        assert_eq!(machine.sample_frequency(), 50.0);
        assert_eq!(machine.power_state(), PowerState::Asleep);
    }

    #[test]
    fn test_invalid_frequency_rejected() {
        let (machine, signals, _logs) = machine(10.0);

        for value in [json!(0), json!(-3.0), json!("fast"), json!(null)] {
            let outcome = machine.handle_command(&frequency_command(value));
            assert!(matches!(outcome, CommandOutcome::Rejected(_)));
            assert_eq!(outcome.ack_type(), AckType::Ack);
        }

        let missing = machine.handle_command(&command(COMMAND_CHANGE_SAMPLE_FREQUENCY));
        assert!(matches!(missing, CommandOutcome::Rejected(_)));

        assert_eq!(machine.sample_frequency(), 10.0);
        assert!(!signals.sample_frequency.has_changed().unwrap());
    }

    #[test]
    fn test_unknown_command_discarded() {
        let (machine, _signals, _logs) = machine(10.0);

        let outcome = machine.handle_command(&command("selfDestruct"));

        assert_eq!(outcome, CommandOutcome::Unknown);
        assert_eq!(outcome.ack_type(), AckType::NackDiscard);
        assert_eq!(machine.power_state(), PowerState::Awake);
    }

    #[test]
    fn test_latest_frequency_wins() {
        let (machine, mut signals, _logs) = machine(10.0);

        machine.handle_command(&frequency_command(json!(20.0)));
        machine.handle_command(&frequency_command(json!(30.0)));

        assert_eq!(*signals.sample_frequency.borrow_and_update(), 30.0);
        assert!(!signals.sample_frequency.has_changed().unwrap());
    }

    #[test]
    fn test_state_changes_forwarded_as_logs() {
        let (machine, _signals, mut logs) = machine(10.0);

        machine.handle_command(&command(COMMAND_SLEEP));
        machine.handle_command(&frequency_command(json!(-1.0)));

        let first = logs.try_recv().unwrap();
        assert_eq!(first.level, LogLevel::Info);
        assert_eq!(first.serial_number, "dev-1");
        assert_eq!(first.message, "Sensor is set to sleep");

        let second = logs.try_recv().unwrap();
        assert_eq!(second.level, LogLevel::Warning);
    }

    #[test]
    fn test_full_log_queue_drops_records() {
        let (logger, mut logs) = DeviceLogger::channel("dev-1", 1);

        logger.info("kept");
        logger.info("dropped");

        assert_eq!(logs.try_recv().unwrap().message, "kept");
        assert!(logs.try_recv().is_err());
    }
}
