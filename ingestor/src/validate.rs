use crate::errors::{Error, Result};
use broker::routing::{self, SensorRegistration};

/// Validates a device registration before it reaches the sensor table
pub fn validate_registration(registration: &SensorRegistration) -> Result<()> {
    validate_serial_number(&registration.serial_number)?;

    let frequency = registration.sample_frequency;
    if !frequency.is_finite() || frequency <= 0.0 {
        return Err(Error::Validation(format!(
            "Sample frequency {} must be a positive number",
            frequency
        )));
    }

    Ok(())
}

pub fn validate_serial_number(serial_number: &str) -> Result<()> {
    routing::validate_serial_number(serial_number).map_err(|e| Error::Validation(e.to_string()))
}
