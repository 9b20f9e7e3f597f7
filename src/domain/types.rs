//! Shared types for the gateway bridge
//!
//! Canonical data model used across storage, serial exchanges and MQTT:
//! - `GatewayEnrollment` - persisted enrollment record (singleton)
//! - `NodeRecord` - one enrolled node in the roster
//! - `Command` / `CommandResponse` / `ResponseEnvelope` - cloud command schema
//! - status / sensor payloads published to the broker

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// Command actions accepted on gateway/<id>/command
pub const ACTION_REGISTER_GATEWAY: &str = "REGISTER_GATEWAY";
pub const ACTION_UNREGISTER_GATEWAY: &str = "UNREGISTER_GATEWAY";
pub const ACTION_ENROLL_NODE: &str = "ENROLL_NODE";
pub const ACTION_UNENROLL_NODE: &str = "UNENROLL_NODE";
pub const ACTION_RELAY_CONTROL: &str = "RELAY_CONTROL";

/// Persisted gateway enrollment record.
///
/// Invariant: `is_enrolled` holds exactly when both `gateway_id` and
/// `enrolled_at` are present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayEnrollment {
    pub gateway_id: Option<String>,
    pub is_enrolled: bool,
    pub enrolled_at: Option<DateTime<Utc>>,
}

impl GatewayEnrollment {
    pub fn enrolled(gateway_id: &str) -> Self {
        Self {
            gateway_id: Some(gateway_id.to_string()),
            is_enrolled: true,
            enrolled_at: Some(Utc::now()),
        }
    }
}

/// One enrolled node, keyed by `(node_id, gateway_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: String,
    pub gateway_id: String,
    pub relay1_state: String,
    pub relay2_state: String,
    pub timestamp: DateTime<Utc>,
}

impl NodeRecord {
    pub fn new(node_id: &str, gateway_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            gateway_id: gateway_id.to_string(),
            relay1_state: "0".to_string(),
            relay2_state: "0".to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// A decoded command from the cloud.
///
/// `action` stays a plain string so unknown actions can still be answered
/// with a structured error instead of failing to deserialize.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub action: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

/// Payload for ENROLL_NODE and UNENROLL_NODE.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeRequest {
    #[serde(rename = "nodeId")]
    pub node_id: String,
    pub state: String,
}

/// Payload for RELAY_CONTROL.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayRequest {
    #[serde(rename = "nodeId")]
    pub node_id: String,
    #[serde(rename = "relayNumber")]
    pub relay_number: u8,
    #[serde(rename = "relayState")]
    pub relay_state: String,
    pub state: String,
}

/// Payload for REGISTER_GATEWAY.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    #[serde(default)]
    pub gateway_id: Option<String>,
}

/// Structured handler result, published inside a [`ResponseEnvelope`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    pub success: bool,
    pub message: String,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl CommandResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self { success: true, message: message.into(), extra: Map::new() }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self { success: false, message: message.into(), extra: Map::new() }
    }

    /// Attach an extra top-level field to the response.
    pub fn with(mut self, key: &str, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.extra.insert(key.to_string(), value);
        self
    }
}

/// Envelope published on `gateway/<id>/response`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub action: String,
    pub correlation_id: Option<String>,
    pub response: CommandResponse,
}

/// Retained payload on `gateway/<id>/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayStatusPayload {
    pub status: String,
    pub gateway_id: String,
    pub timestamp: DateTime<Utc>,
}

impl GatewayStatusPayload {
    pub fn now(status: &str, gateway_id: &str) -> Self {
        Self {
            status: status.to_string(),
            gateway_id: gateway_id.to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// Retained payload on `sensor_data/<gateway_id>/<node_id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorDataPayload {
    pub gateway_id: String,
    pub node_id: String,
    pub sensor_data: String,
    pub timestamp: DateTime<Utc>,
}
