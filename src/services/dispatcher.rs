//! Command dispatch from the cloud to the controllers
//!
//! Consumes decoded commands off the MQTT channel one at a time, so two
//! commands arriving together serialise in arrival order. Each command is
//! bracketed by the arbiter pause signal and always answered on the
//! response topic with its correlation id echoed, unknown actions included.

use crate::domain::types::{
    Command, CommandResponse, NodeRequest, RelayRequest, ResponseEnvelope,
    ACTION_ENROLL_NODE, ACTION_REGISTER_GATEWAY, ACTION_RELAY_CONTROL, ACTION_UNENROLL_NODE,
    ACTION_UNREGISTER_GATEWAY,
};
use crate::io::mqtt::MqttLink;
use crate::services::arbiter::Arbiter;
use crate::services::gateway::GatewayController;
use crate::services::node::NodeController;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::info;

fn unknown_action(action: &str) -> CommandResponse {
    CommandResponse::fail(format!("Unknown action: {}", action))
}

fn missing_fields() -> CommandResponse {
    CommandResponse::fail("Missing required fields")
}

pub struct CommandDispatcher {
    arbiter: Arc<Arbiter>,
    gateway: Arc<GatewayController>,
    nodes: Arc<NodeController>,
    mqtt: Arc<MqttLink>,
}

impl CommandDispatcher {
    pub fn new(
        arbiter: Arc<Arbiter>,
        gateway: Arc<GatewayController>,
        nodes: Arc<NodeController>,
        mqtt: Arc<MqttLink>,
    ) -> Self {
        Self { arbiter, gateway, nodes, mqtt }
    }

    /// Process commands until shutdown or the channel closes.
    pub async fn run(
        self,
        mut command_rx: mpsc::Receiver<Command>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("command_dispatcher_started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("command_dispatcher_shutdown");
                        return;
                    }
                }
                command = command_rx.recv() => {
                    let Some(command) = command else {
                        info!("command_channel_closed");
                        return;
                    };
                    self.handle(command).await;
                }
            }
        }
    }

    async fn handle(&self, command: Command) {
        info!(
            action = %command.action,
            correlation_id = ?command.correlation_id,
            "command_received"
        );

        let response = {
            // Stand the poller down for the whole command, whatever the
            // handler outcome.
            let _pause = self.arbiter.pause();
            self.dispatch(&command).await
        };

        let envelope = ResponseEnvelope {
            action: command.action,
            correlation_id: command.correlation_id,
            response,
        };
        self.mqtt.publish_response(&envelope).await;
    }

    async fn dispatch(&self, command: &Command) -> CommandResponse {
        match command.action.as_str() {
            ACTION_REGISTER_GATEWAY => self.gateway.register(command.data.clone()).await,
            ACTION_UNREGISTER_GATEWAY => self.gateway.unregister().await,
            ACTION_ENROLL_NODE => {
                match serde_json::from_value::<NodeRequest>(command.data.clone()) {
                    Ok(request) => self.nodes.enroll(request).await,
                    Err(_) => missing_fields(),
                }
            }
            ACTION_UNENROLL_NODE => {
                match serde_json::from_value::<NodeRequest>(command.data.clone()) {
                    Ok(request) => self.nodes.unenroll(request).await,
                    Err(_) => missing_fields(),
                }
            }
            ACTION_RELAY_CONTROL => {
                match serde_json::from_value::<RelayRequest>(command.data.clone()) {
                    Ok(request) => self.nodes.control_relay(request).await,
                    Err(_) => missing_fields(),
                }
            }
            other => unknown_action(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_action_message() {
        let response = unknown_action("REBOOT_GATEWAY");
        assert!(!response.success);
        assert_eq!(response.message, "Unknown action: REBOOT_GATEWAY");
    }

    #[test]
    fn test_missing_fields_message() {
        let response = missing_fields();
        assert!(!response.success);
        assert_eq!(response.message, "Missing required fields");
    }

    #[test]
    fn test_relay_request_rejects_incomplete_data() {
        // The dispatcher maps a deserialization failure to missing_fields
        let incomplete = serde_json::json!({"nodeId": "N201001"});
        assert!(serde_json::from_value::<RelayRequest>(incomplete).is_err());

        let complete = serde_json::json!({
            "nodeId": "N201001", "relayNumber": 1, "relayState": "1", "state": "20"
        });
        assert!(serde_json::from_value::<RelayRequest>(complete).is_ok());
    }
}
