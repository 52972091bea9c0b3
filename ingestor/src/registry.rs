use crate::db::SensorRegistry;
use crate::validate::validate_registration;
use broker::routing::SensorRegistration;
use broker::AckType;
use tracing::{error, info, warn};

/// Stores one device registration.
///
/// The identity cache is not touched; a new sensor becomes resolvable on the
/// cache's next refresh.
pub async fn handle_registration<R: SensorRegistry>(
    registry: &R,
    registration: SensorRegistration,
) -> AckType {
    if let Err(e) = validate_registration(&registration) {
        warn!("Discarding registration: {}", e);
        return AckType::NackDiscard;
    }

    match registry.register_sensor(&registration).await {
        Ok(true) => {
            info!(
                serial = %registration.serial_number,
                "Registered sensor at {} Hz", registration.sample_frequency
            );
            AckType::Ack
        }
        Ok(false) => {
            info!(serial = %registration.serial_number, "Sensor already registered");
            AckType::Ack
        }
        Err(e) => {
            error!(
                serial = %registration.serial_number,
                "Failed to register sensor: {}", e
            );
            AckType::NackRequeue
        }
    }
}
