//! Gateway enrollment lifecycle
//!
//! Registration binds the process-configured gateway id to the cloud and
//! persists the enrollment record; unregistration clears it. The stored
//! record gates every node operation and the poller.

use crate::domain::types::{CommandResponse, RegisterRequest};
use crate::infra::config::Config;
use crate::infra::storage::GatewayStore;
use crate::io::mqtt::MqttLink;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// How long registration waits for the broker link before giving up
const CONNECT_WAIT: Duration = Duration::from_secs(10);

/// Check the id the cloud sent against the one this process serves.
fn validate_registration(configured: &str, received: Option<&str>) -> Result<(), &'static str> {
    match received {
        None | Some("") => Err("Missing gateway ID"),
        Some(id) if id != configured => Err("Gateway ID mismatch"),
        Some(_) => Ok(()),
    }
}

pub struct GatewayController {
    gateway_id: String,
    store: Arc<GatewayStore>,
    mqtt: Arc<MqttLink>,
}

impl GatewayController {
    pub fn new(config: &Config, store: Arc<GatewayStore>, mqtt: Arc<MqttLink>) -> Self {
        Self { gateway_id: config.gateway_id().to_string(), store, mqtt }
    }

    fn connection_status(&self) -> &'static str {
        if self.mqtt.is_connected() {
            "connected"
        } else {
            "disconnected"
        }
    }

    pub async fn register(&self, data: Value) -> CommandResponse {
        let request: RegisterRequest =
            serde_json::from_value(data).unwrap_or(RegisterRequest { gateway_id: None });

        if let Err(message) = validate_registration(&self.gateway_id, request.gateway_id.as_deref())
        {
            error!(message = %message, "gateway_registration_rejected");
            return CommandResponse::fail(message).with("status", self.connection_status());
        }

        // Registration is only meaningful with a live broker link; give the
        // event loop one bounded chance to (re)connect.
        if !self.mqtt.await_connected(CONNECT_WAIT).await {
            return CommandResponse::fail("Failed to connect to MQTT broker")
                .with("status", "disconnected");
        }

        self.store.enroll(&self.gateway_id);
        self.mqtt.publish_status("connected").await;
        info!(gateway_id = %self.gateway_id, "gateway_registered");

        CommandResponse::ok("Gateway registered successfully")
            .with("gateway_id", &self.gateway_id)
            .with("status", "connected")
    }

    pub async fn unregister(&self) -> CommandResponse {
        self.store.unenroll();
        if self.mqtt.is_connected() {
            self.mqtt.publish_status("disconnected").await;
        }
        info!(gateway_id = %self.gateway_id, "gateway_unregistered");

        CommandResponse::ok("Gateway unregistered successfully").with("status", "disconnected")
    }

    /// Current enrollment and link state; reads without locking and has no
    /// side effects.
    pub fn status(&self) -> CommandResponse {
        let connected = self.mqtt.is_connected();
        CommandResponse::ok("Gateway status")
            .with("is_enrolled", self.store.is_enrolled())
            .with("gateway_id", &self.gateway_id)
            .with("status", self.connection_status())
            .with("mqtt_connected", connected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_registration_accepts_matching_id() {
        assert!(validate_registration("G100101", Some("G100101")).is_ok());
    }

    #[test]
    fn test_validate_registration_missing_id() {
        assert_eq!(validate_registration("G100101", None), Err("Missing gateway ID"));
        assert_eq!(validate_registration("G100101", Some("")), Err("Missing gateway ID"));
    }

    #[test]
    fn test_validate_registration_mismatch() {
        assert_eq!(validate_registration("G100101", Some("G999999")), Err("Gateway ID mismatch"));
    }
}
