//! MQTT link to the cloud broker
//!
//! Owns the rumqttc client for the whole process. The event loop task keeps
//! the connection alive, routes command publishes to the dispatcher channel
//! and republishes the retained `connected` status after every reconnect.
//! The broker publishes the retained last-will `disconnected` status if the
//! process is lost without a clean shutdown.

use crate::domain::types::{
    Command, GatewayStatusPayload, ResponseEnvelope, SensorDataPayload,
};
use crate::infra::config::Config;
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, LastWill, MqttOptions, Packet, QoS,
    TlsConfiguration, Transport,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Delay before the event loop re-polls after a connection error
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
/// Telemetry publish attempts while the link is down
const SENSOR_PUBLISH_ATTEMPTS: usize = 3;
/// Backoff between telemetry publish attempts
const SENSOR_PUBLISH_RETRY_DELAY: Duration = Duration::from_secs(2);

pub fn command_topic(gateway_id: &str) -> String {
    format!("gateway/{}/command", gateway_id)
}

pub fn status_topic(gateway_id: &str) -> String {
    format!("gateway/{}/status", gateway_id)
}

pub fn response_topic(gateway_id: &str) -> String {
    format!("gateway/{}/response", gateway_id)
}

pub fn sensor_topic(gateway_id: &str, node_id: &str) -> String {
    format!("sensor_data/{}/{}", gateway_id, node_id)
}

/// Sink for sensor readings - enables mock implementations for testing
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    /// Publish one sensor sample, returns whether the broker took it
    async fn publish_sensor_data(&self, node_id: &str, sensor_data: &str) -> bool;
}

pub struct MqttLink {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    gateway_id: String,
}

/// Build the client, spawn the event loop task and hand back the link.
pub fn start_mqtt_link(
    config: &Config,
    command_tx: mpsc::Sender<Command>,
    shutdown: watch::Receiver<bool>,
) -> Arc<MqttLink> {
    let gateway_id = config.gateway_id().to_string();

    let mut options =
        MqttOptions::new(config.mqtt_client_id(), config.mqtt_broker(), config.mqtt_port());
    options.set_keep_alive(Duration::from_secs(config.mqtt_keepalive_secs()));
    options.set_clean_session(true);

    if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
        options.set_credentials(username, password);
    }

    if config.mqtt_tls_enabled() {
        options.set_transport(Transport::tls_with_config(tls_configuration(
            config.mqtt_tls_insecure(),
        )));
    }

    let will_payload = serde_json::to_vec(&GatewayStatusPayload::now("disconnected", &gateway_id))
        .unwrap_or_default();
    options.set_last_will(LastWill::new(
        status_topic(&gateway_id),
        will_payload,
        QoS::AtLeastOnce,
        true,
    ));

    let (client, eventloop) = AsyncClient::new(options, 100);
    let link = Arc::new(MqttLink {
        client,
        connected: Arc::new(AtomicBool::new(false)),
        gateway_id,
    });

    info!(
        broker = %config.mqtt_broker(),
        port = %config.mqtt_port(),
        client_id = %config.mqtt_client_id(),
        tls = config.mqtt_tls_enabled(),
        "mqtt_link_starting"
    );

    let loop_link = link.clone();
    tokio::spawn(async move {
        run_event_loop(eventloop, loop_link, command_tx, shutdown).await;
    });

    link
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    link: Arc<MqttLink>,
    command_tx: mpsc::Sender<Command>,
    mut shutdown: watch::Receiver<bool>,
) {
    let command_topic = command_topic(&link.gateway_id);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("mqtt_shutdown");
                    return;
                }
            }
            result = eventloop.poll() => match result {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        link.connected.store(true, Ordering::SeqCst);
                        info!("mqtt_connected");
                        link.subscribe_and_announce().await;
                    } else {
                        error!(code = ?ack.code, "mqtt_connection_refused");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    if publish.topic == command_topic {
                        route_command(&publish.payload, &command_tx);
                    } else {
                        debug!(topic = %publish.topic, "mqtt_publish_ignored");
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    link.connected.store(false, Ordering::SeqCst);
                    warn!("mqtt_disconnect_received");
                }
                Ok(_) => {}
                Err(e) => {
                    link.connected.store(false, Ordering::SeqCst);
                    error!(error = %e, "mqtt_connection_error");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
    }
}

/// Decode a command payload; malformed JSON is logged and dropped.
fn decode_command(payload: &[u8]) -> Option<Command> {
    match serde_json::from_slice(payload) {
        Ok(command) => Some(command),
        Err(e) => {
            warn!(error = %e, "mqtt_command_malformed");
            None
        }
    }
}

fn route_command(payload: &[u8], command_tx: &mpsc::Sender<Command>) {
    let Some(command) = decode_command(payload) else {
        return;
    };

    debug!(action = %command.action, "mqtt_command_received");
    if let Err(e) = command_tx.try_send(command) {
        match e {
            TrySendError::Full(cmd) => {
                // Commands are not durably queued; past the buffer they drop
                warn!(action = %cmd.action, "mqtt_command_dropped_queue_full");
            }
            TrySendError::Closed(_) => warn!("mqtt_command_channel_closed"),
        }
    }
}

impl MqttLink {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Wait for the event loop to report a live connection.
    pub async fn await_connected(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.is_connected() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        self.is_connected()
    }

    async fn subscribe_and_announce(&self) {
        for topic in [command_topic(&self.gateway_id), status_topic(&self.gateway_id)] {
            if let Err(e) = self.client.subscribe(topic.as_str(), QoS::AtLeastOnce).await {
                error!(topic = %topic, error = %e, "mqtt_subscribe_failed");
            } else {
                info!(topic = %topic, "mqtt_subscribed");
            }
        }
        self.publish_status("connected").await;
    }

    /// Publish the retained gateway status.
    pub async fn publish_status(&self, status: &str) -> bool {
        let payload = GatewayStatusPayload::now(status, &self.gateway_id);
        let Ok(json) = serde_json::to_vec(&payload) else {
            return false;
        };

        match self
            .client
            .publish(status_topic(&self.gateway_id), QoS::AtLeastOnce, true, json)
            .await
        {
            Ok(()) => {
                info!(status = %status, "gateway_status_published");
                true
            }
            Err(e) => {
                error!(error = %e, "gateway_status_publish_failed");
                false
            }
        }
    }

    /// Publish a command response with its echoed correlation id.
    /// Best-effort: a lost response is logged, never retried.
    pub async fn publish_response(&self, envelope: &ResponseEnvelope) -> bool {
        let Ok(json) = serde_json::to_vec(envelope) else {
            return false;
        };

        match self
            .client
            .publish(response_topic(&self.gateway_id), QoS::AtLeastOnce, false, json)
            .await
        {
            Ok(()) => {
                info!(action = %envelope.action, "command_response_published");
                true
            }
            Err(e) => {
                error!(action = %envelope.action, error = %e, "command_response_publish_failed");
                false
            }
        }
    }
}

#[async_trait]
impl TelemetrySink for MqttLink {
    /// Publish one retained sensor sample, waiting out a dropped
    /// connection for up to three attempts before giving up on it.
    async fn publish_sensor_data(&self, node_id: &str, sensor_data: &str) -> bool {
        let payload = SensorDataPayload {
            gateway_id: self.gateway_id.clone(),
            node_id: node_id.to_string(),
            sensor_data: sensor_data.to_string(),
            timestamp: chrono::Utc::now(),
        };
        let Ok(json) = serde_json::to_vec(&payload) else {
            return false;
        };

        for attempt in 1..=SENSOR_PUBLISH_ATTEMPTS {
            if self.is_connected() {
                match self
                    .client
                    .publish(
                        sensor_topic(&self.gateway_id, node_id),
                        QoS::AtLeastOnce,
                        true,
                        json.clone(),
                    )
                    .await
                {
                    Ok(()) => {
                        info!(node_id = %node_id, "sensor_data_published");
                        return true;
                    }
                    Err(e) => {
                        warn!(node_id = %node_id, attempt, error = %e, "sensor_publish_failed")
                    }
                }
            } else {
                warn!(node_id = %node_id, attempt, "sensor_publish_skipped_disconnected");
            }

            if attempt < SENSOR_PUBLISH_ATTEMPTS {
                tokio::time::sleep(SENSOR_PUBLISH_RETRY_DELAY).await;
            }
        }

        error!(node_id = %node_id, "sensor_data_dropped");
        false
    }
}

/// Certificate verifier that accepts any certificate, for brokers with
/// self-signed certificates behind MQTT_TLS_INSECURE.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

fn tls_configuration(insecure: bool) -> TlsConfiguration {
    let config = if insecure {
        warn!("mqtt_tls_certificate_verification_disabled");
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth()
    } else {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        rustls::ClientConfig::builder().with_root_certificates(roots).with_no_client_auth()
    };
    TlsConfiguration::Rustls(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_builders() {
        assert_eq!(command_topic("G100101"), "gateway/G100101/command");
        assert_eq!(status_topic("G100101"), "gateway/G100101/status");
        assert_eq!(response_topic("G100101"), "gateway/G100101/response");
        assert_eq!(sensor_topic("G100101", "N201001"), "sensor_data/G100101/N201001");
    }

    #[test]
    fn test_decode_command_valid() {
        let payload = br#"{"action":"ENROLL_NODE","data":{"nodeId":"N201001","state":"10"},"correlation_id":"c1"}"#;
        let command = decode_command(payload).unwrap();
        assert_eq!(command.action, "ENROLL_NODE");
        assert_eq!(command.correlation_id.as_deref(), Some("c1"));
    }

    #[test]
    fn test_decode_command_malformed_dropped() {
        assert!(decode_command(b"not json").is_none());
        assert!(decode_command(b"{\"data\":{}}").is_none());
    }

    #[test]
    fn test_status_payload_shape() {
        let payload = GatewayStatusPayload::now("disconnected", "G100101");
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["status"], "disconnected");
        assert_eq!(json["gateway_id"], "G100101");
        assert!(json["timestamp"].is_string());
    }
}
