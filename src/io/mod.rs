//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `serial` - AT-command transport over the LoRa modem serial port
//! - `mqtt` - client for the cloud broker (commands in, telemetry out)

pub mod mqtt;
pub mod serial;

// Re-export commonly used types
pub use mqtt::{start_mqtt_link, MqttLink, TelemetrySink};
pub use serial::{SerialConnection, SerialLink, TransportError};
