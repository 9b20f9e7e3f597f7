//! Node operations: enroll, unenroll, relay control
//!
//! Every operation raises the pause signal, gives the poller a short grace
//! to stand down, takes the serial permit with a deadline and runs one
//! request/response exchange against the addressed node. Replies carrying
//! a foreign node id or an unexpected status are ignored and the wait
//! continues until the per-operation deadline.

use crate::domain::codec::{
    self, ReplyFrame, STATUS_ENROLL_ACCEPT, STATUS_ENROLL_REJECT, STATUS_RELAY_ACCEPT,
    STATUS_RELAY_REJECT, STATUS_UNENROLL_ACCEPT, STATUS_UNENROLL_REJECT,
};
use crate::domain::types::{CommandResponse, NodeRequest, RelayRequest};
use crate::infra::config::Config;
use crate::infra::storage::{GatewayStore, NodeStore};
use crate::io::serial::{SerialLink, TransportError};
use crate::services::arbiter::{Arbiter, PAUSE_GRACE};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

/// Deadline on taking the serial permit away from the poller
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(8);
/// Reply deadline for an enroll exchange
const ENROLL_DEADLINE: Duration = Duration::from_secs(7);
/// Reply deadline for unenroll and relay exchanges
const CONTROL_DEADLINE: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
enum ExchangeFailure {
    #[error("serial port busy")]
    Busy,
    #[error("timeout waiting for node response")]
    Timeout,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

enum ExchangeOutcome {
    Accepted,
    Rejected,
}

enum ReplyVerdict {
    Accepted,
    Rejected,
    Unrelated,
}

/// Classify one decoded reply against the node we addressed.
fn classify_reply(frame: &ReplyFrame, node_id: &str, accept: &str, reject: &str) -> ReplyVerdict {
    if frame.node_id != node_id {
        return ReplyVerdict::Unrelated;
    }
    if frame.status == accept {
        ReplyVerdict::Accepted
    } else if frame.status == reject {
        ReplyVerdict::Rejected
    } else {
        ReplyVerdict::Unrelated
    }
}

/// `00` addresses relay 1, `01` relay 2.
fn relay_code(relay_number: u8) -> Option<&'static str> {
    match relay_number {
        1 => Some("00"),
        2 => Some("01"),
        _ => None,
    }
}

pub struct NodeController {
    gateway_id: String,
    arbiter: Arc<Arbiter>,
    link: SerialLink,
    roster: Arc<NodeStore>,
    gateway: Arc<GatewayStore>,
}

impl NodeController {
    pub fn new(
        config: &Config,
        arbiter: Arc<Arbiter>,
        link: SerialLink,
        roster: Arc<NodeStore>,
        gateway: Arc<GatewayStore>,
    ) -> Self {
        Self {
            gateway_id: config.gateway_id().to_string(),
            arbiter,
            link,
            roster,
            gateway,
        }
    }

    pub async fn enroll(&self, request: NodeRequest) -> CommandResponse {
        if request.node_id.is_empty() || request.state.is_empty() {
            return CommandResponse::fail("Missing required fields");
        }
        if !self.gateway.is_enrolled() {
            return CommandResponse::fail("Gateway not enrolled");
        }
        if self.roster.exists(&request.node_id) {
            return CommandResponse::fail("Node already exists");
        }

        let message = format!("{}{}{}", request.node_id, self.gateway_id, request.state);
        match self
            .exchange_with_node(
                &request.node_id,
                &message,
                ENROLL_DEADLINE,
                STATUS_ENROLL_ACCEPT,
                STATUS_ENROLL_REJECT,
            )
            .await
        {
            Ok(ExchangeOutcome::Accepted) => {
                let record = self.roster.insert(&request.node_id);
                info!(node_id = %request.node_id, "node_enrolled");
                CommandResponse::ok("Node enrolled successfully").with("data", record)
            }
            Ok(ExchangeOutcome::Rejected) => {
                CommandResponse::fail("Node enrollment rejected by device")
            }
            Err(failure) => failure_response(failure),
        }
    }

    pub async fn unenroll(&self, request: NodeRequest) -> CommandResponse {
        if request.node_id.is_empty() || request.state.is_empty() {
            return CommandResponse::fail("Missing required fields");
        }
        if !self.gateway.is_enrolled() {
            return CommandResponse::fail("Gateway not enrolled");
        }

        let message = format!("{}{}{}", request.node_id, self.gateway_id, request.state);
        match self
            .exchange_with_node(
                &request.node_id,
                &message,
                CONTROL_DEADLINE,
                STATUS_UNENROLL_ACCEPT,
                STATUS_UNENROLL_REJECT,
            )
            .await
        {
            Ok(ExchangeOutcome::Accepted) => {
                self.roster.remove(&request.node_id);
                info!(node_id = %request.node_id, "node_unenrolled");
                CommandResponse::ok("Node unenrolled successfully")
            }
            Ok(ExchangeOutcome::Rejected) => {
                CommandResponse::fail("Node unenrollment rejected by device")
            }
            Err(failure) => failure_response(failure),
        }
    }

    pub async fn control_relay(&self, request: RelayRequest) -> CommandResponse {
        if request.node_id.is_empty() || request.state.is_empty() {
            return CommandResponse::fail("Missing required fields");
        }
        if !self.gateway.is_enrolled() {
            return CommandResponse::fail("Gateway not enrolled");
        }
        let Some(code) = relay_code(request.relay_number) else {
            return CommandResponse::fail("Invalid relay number");
        };

        let message = format!(
            "{}{}{}{}{}",
            request.node_id, self.gateway_id, request.state, code, request.relay_state
        );
        match self
            .exchange_with_node(
                &request.node_id,
                &message,
                CONTROL_DEADLINE,
                STATUS_RELAY_ACCEPT,
                STATUS_RELAY_REJECT,
            )
            .await
        {
            Ok(ExchangeOutcome::Accepted) => {
                self.roster.set_relay(&request.node_id, request.relay_number, &request.relay_state);
                info!(
                    node_id = %request.node_id,
                    relay = request.relay_number,
                    state = %request.relay_state,
                    "relay_state_updated"
                );
                CommandResponse::ok(format!(
                    "Relay {} state updated successfully",
                    request.relay_number
                ))
                .with("nodeId", &request.node_id)
                .with("relayNumber", request.relay_number)
                .with("state", &request.relay_state)
            }
            Ok(ExchangeOutcome::Rejected) => {
                CommandResponse::fail("Relay control rejected by device")
            }
            Err(failure) => failure_response(failure),
        }
    }

    /// One radio round trip under the arbiter: pause the poller, take the
    /// permit, open the port, send, and wait for an authoritative reply.
    /// The pause guard, permit and port all release on every exit path.
    async fn exchange_with_node(
        &self,
        node_id: &str,
        message: &str,
        deadline: Duration,
        accept: &str,
        reject: &str,
    ) -> Result<ExchangeOutcome, ExchangeFailure> {
        let _pause = self.arbiter.pause();
        tokio::time::sleep(PAUSE_GRACE).await;

        let _permit = self
            .arbiter
            .acquire(ACQUIRE_TIMEOUT)
            .await
            .map_err(|_| ExchangeFailure::Busy)?;

        let mut conn = self.link.open().await?;
        let limit = Instant::now() + deadline;

        let mut ascii = match conn.exchange(&codec::encode(message), deadline).await {
            Ok(ascii) => ascii,
            Err(TransportError::Timeout) => return Err(ExchangeFailure::Timeout),
            Err(e) => return Err(e.into()),
        };

        loop {
            match ReplyFrame::parse(&ascii) {
                Some(frame) => match classify_reply(&frame, node_id, accept, reject) {
                    ReplyVerdict::Accepted => return Ok(ExchangeOutcome::Accepted),
                    ReplyVerdict::Rejected => return Ok(ExchangeOutcome::Rejected),
                    ReplyVerdict::Unrelated => {}
                },
                None => warn!(payload = %ascii, "radio_reply_malformed"),
            }

            // Inconclusive frame: keep listening until the deadline
            let remaining = limit.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ExchangeFailure::Timeout);
            }
            ascii = match conn.next_frame(remaining).await {
                Ok(ascii) => ascii,
                Err(TransportError::Timeout) => return Err(ExchangeFailure::Timeout),
                Err(e) => return Err(e.into()),
            };
        }
    }
}

fn failure_response(failure: ExchangeFailure) -> CommandResponse {
    match failure {
        ExchangeFailure::Busy => CommandResponse::fail("Serial port busy"),
        ExchangeFailure::Timeout => CommandResponse::fail("Timeout waiting for node response"),
        ExchangeFailure::Transport(e) => CommandResponse::fail(format!("Serial port error: {}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(node_id: &str, status: &str) -> ReplyFrame {
        ReplyFrame {
            node_id: node_id.to_string(),
            gateway_id: "G100101".to_string(),
            status: status.to_string(),
            body: String::new(),
        }
    }

    #[test]
    fn test_classify_reply_accept_and_reject() {
        let accepted = frame("N201001", STATUS_ENROLL_ACCEPT);
        assert!(matches!(
            classify_reply(&accepted, "N201001", STATUS_ENROLL_ACCEPT, STATUS_ENROLL_REJECT),
            ReplyVerdict::Accepted
        ));

        let rejected = frame("N201001", STATUS_ENROLL_REJECT);
        assert!(matches!(
            classify_reply(&rejected, "N201001", STATUS_ENROLL_ACCEPT, STATUS_ENROLL_REJECT),
            ReplyVerdict::Rejected
        ));
    }

    #[test]
    fn test_classify_reply_ignores_foreign_node() {
        let foreign = frame("N999999", STATUS_ENROLL_ACCEPT);
        assert!(matches!(
            classify_reply(&foreign, "N201001", STATUS_ENROLL_ACCEPT, STATUS_ENROLL_REJECT),
            ReplyVerdict::Unrelated
        ));
    }

    #[test]
    fn test_classify_reply_ignores_unexpected_status() {
        let relay_status = frame("N201001", STATUS_RELAY_ACCEPT);
        assert!(matches!(
            classify_reply(&relay_status, "N201001", STATUS_ENROLL_ACCEPT, STATUS_ENROLL_REJECT),
            ReplyVerdict::Unrelated
        ));
    }

    #[test]
    fn test_relay_code_mapping() {
        assert_eq!(relay_code(1), Some("00"));
        assert_eq!(relay_code(2), Some("01"));
        assert_eq!(relay_code(0), None);
        assert_eq!(relay_code(3), None);
    }

    #[test]
    fn test_failure_messages() {
        assert_eq!(failure_response(ExchangeFailure::Busy).message, "Serial port busy");
        assert_eq!(
            failure_response(ExchangeFailure::Timeout).message,
            "Timeout waiting for node response"
        );
        assert!(!failure_response(ExchangeFailure::Busy).success);
    }

    #[test]
    fn test_relay_message_layout() {
        // node id, gateway id, state, relay code, relay state, no delimiters
        let message = format!("{}{}{}{}{}", "N201001", "G100101", "20", "01", "1");
        assert_eq!(message, "N201001G10010120011");
        assert_eq!(codec::encode(&message).len(), 2 * message.len());
    }
}
