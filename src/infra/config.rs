//! Configuration loading from the environment
//!
//! The bridge is deployed as a single process configured entirely through
//! environment variables (see the deployment unit files). Command line flags
//! `--gateway-id` and `--serial-port` override the environment.

use std::env;
use std::str::FromStr;
use tracing::warn;

const DEFAULT_GATEWAY_ID: &str = "G100101";
const DEFAULT_SERIAL_PORT: &str = "/dev/ttyUSB0";
const DEFAULT_SERIAL_BAUDRATE: u32 = 115_200;
const DEFAULT_MQTT_BROKER: &str = "localhost";
const DEFAULT_MQTT_PORT: u16 = 1883;
const DEFAULT_MQTT_KEEPALIVE_SECS: u64 = 60;
const DEFAULT_GATEWAY_STATUS_FILE: &str = "gateway-status.json";
const DEFAULT_NODE_LIST_FILE: &str = "node-list.json";

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    gateway_id: String,
    serial_port: String,
    serial_baudrate: u32,
    mqtt_broker: String,
    mqtt_port: u16,
    mqtt_keepalive_secs: u64,
    mqtt_client_id: String,
    /// Whether MQTT_CLIENT_ID was set explicitly; an explicit id survives
    /// a later --gateway-id override
    mqtt_client_id_explicit: bool,
    mqtt_username: Option<String>,
    mqtt_password: Option<String>,
    mqtt_tls_enabled: bool,
    mqtt_tls_insecure: bool,
    gateway_status_file: String,
    node_list_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gateway_id: DEFAULT_GATEWAY_ID.to_string(),
            serial_port: DEFAULT_SERIAL_PORT.to_string(),
            serial_baudrate: DEFAULT_SERIAL_BAUDRATE,
            mqtt_broker: DEFAULT_MQTT_BROKER.to_string(),
            mqtt_port: DEFAULT_MQTT_PORT,
            mqtt_keepalive_secs: DEFAULT_MQTT_KEEPALIVE_SECS,
            mqtt_client_id: normalize_client_id(None, DEFAULT_GATEWAY_ID),
            mqtt_client_id_explicit: false,
            mqtt_username: None,
            mqtt_password: None,
            mqtt_tls_enabled: false,
            mqtt_tls_insecure: false,
            gateway_status_file: DEFAULT_GATEWAY_STATUS_FILE.to_string(),
            node_list_file: DEFAULT_NODE_LIST_FILE.to_string(),
        }
    }
}

/// Read a numeric variable, warning and falling back on a parse failure.
fn env_parse<T: FromStr + Copy>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key = %key, value = %raw, "config_invalid_numeric_value");
            default
        }),
        Err(_) => default,
    }
}

fn env_bool(key: &str) -> bool {
    match env::var(key) {
        Ok(raw) => matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => false,
    }
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

/// Force the `gateway_` client id prefix the broker ACLs expect.
fn normalize_client_id(configured: Option<String>, gateway_id: &str) -> String {
    let id = configured.unwrap_or_else(|| format!("gateway_{}", gateway_id));
    if id.starts_with("gateway_") {
        id
    } else {
        format!("gateway_{}", id)
    }
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Self {
        let gateway_id =
            env_opt("GATEWAY_ID").unwrap_or_else(|| DEFAULT_GATEWAY_ID.to_string());
        let configured_client_id = env_opt("MQTT_CLIENT_ID");
        let mqtt_client_id_explicit = configured_client_id.is_some();
        let mqtt_client_id = normalize_client_id(configured_client_id, &gateway_id);

        Self {
            serial_port: env_opt("SERIAL_PORT")
                .unwrap_or_else(|| DEFAULT_SERIAL_PORT.to_string()),
            serial_baudrate: env_parse("SERIAL_BAUDRATE", DEFAULT_SERIAL_BAUDRATE),
            mqtt_broker: env_opt("MQTT_BROKER")
                .unwrap_or_else(|| DEFAULT_MQTT_BROKER.to_string()),
            mqtt_port: env_parse("MQTT_PORT", DEFAULT_MQTT_PORT),
            mqtt_keepalive_secs: env_parse("MQTT_KEEPALIVE", DEFAULT_MQTT_KEEPALIVE_SECS),
            mqtt_client_id,
            mqtt_client_id_explicit,
            mqtt_username: env_opt("MQTT_USERNAME"),
            mqtt_password: env_opt("MQTT_PASSWORD"),
            mqtt_tls_enabled: env_bool("MQTT_TLS_ENABLED"),
            mqtt_tls_insecure: env_bool("MQTT_TLS_INSECURE"),
            gateway_status_file: DEFAULT_GATEWAY_STATUS_FILE.to_string(),
            node_list_file: DEFAULT_NODE_LIST_FILE.to_string(),
            gateway_id,
        }
    }

    /// Apply a command line override for the gateway id. The derived MQTT
    /// client id follows the new gateway id unless MQTT_CLIENT_ID was set
    /// explicitly.
    pub fn with_gateway_id(mut self, gateway_id: Option<String>) -> Self {
        if let Some(id) = gateway_id {
            if !self.mqtt_client_id_explicit {
                self.mqtt_client_id = normalize_client_id(None, &id);
            }
            self.gateway_id = id;
        }
        self
    }

    /// Apply a command line override for the serial device.
    pub fn with_serial_port(mut self, serial_port: Option<String>) -> Self {
        if let Some(port) = serial_port {
            self.serial_port = port;
        }
        self
    }

    // Getters for all config fields
    pub fn gateway_id(&self) -> &str {
        &self.gateway_id
    }

    pub fn serial_port(&self) -> &str {
        &self.serial_port
    }

    pub fn serial_baudrate(&self) -> u32 {
        self.serial_baudrate
    }

    pub fn mqtt_broker(&self) -> &str {
        &self.mqtt_broker
    }

    pub fn mqtt_port(&self) -> u16 {
        self.mqtt_port
    }

    pub fn mqtt_keepalive_secs(&self) -> u64 {
        self.mqtt_keepalive_secs
    }

    pub fn mqtt_client_id(&self) -> &str {
        &self.mqtt_client_id
    }

    pub fn mqtt_username(&self) -> Option<&str> {
        self.mqtt_username.as_deref()
    }

    pub fn mqtt_password(&self) -> Option<&str> {
        self.mqtt_password.as_deref()
    }

    pub fn mqtt_tls_enabled(&self) -> bool {
        self.mqtt_tls_enabled
    }

    pub fn mqtt_tls_insecure(&self) -> bool {
        self.mqtt_tls_insecure
    }

    pub fn gateway_status_file(&self) -> &str {
        &self.gateway_status_file
    }

    pub fn node_list_file(&self) -> &str {
        &self.node_list_file
    }

    /// Builder method for tests to redirect the store files
    #[cfg(test)]
    pub fn with_store_files(mut self, gateway_status: &str, node_list: &str) -> Self {
        self.gateway_status_file = gateway_status.to_string();
        self.node_list_file = node_list.to_string();
        self
    }
}
