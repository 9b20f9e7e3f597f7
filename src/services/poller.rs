//! Periodic sensor polling over the enrolled node roster
//!
//! A single long-running loop. Each pass takes the serial permit once,
//! opens the port once, and visits every node in roster order. The pause
//! signal is re-checked between nodes and between read slices, so a
//! command handler preempts the loop within one checkpoint; a preempted
//! pass is truncated, the next pass starts from the top of the roster.

use crate::domain::codec::{self, ReplyFrame, STATUS_SENSOR_POLL};
use crate::infra::config::Config;
use crate::infra::storage::{GatewayStore, NodeStore};
use crate::io::mqtt::TelemetrySink;
use crate::io::serial::{SerialConnection, SerialLink, TransportError};
use crate::services::arbiter::Arbiter;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Backoff while the pause signal is raised
const PAUSE_BACKOFF: Duration = Duration::from_millis(500);
/// Backoff while the gateway is unenrolled or the roster is empty
const IDLE_DELAY: Duration = Duration::from_secs(5);
/// Deadline on taking the serial permit; commands have priority, so lose fast
const ACQUIRE_TIMEOUT: Duration = Duration::from_millis(500);
/// Per-node reply deadline
const REPLY_DEADLINE: Duration = Duration::from_secs(5);
/// Wait before the single per-node retry
const RETRY_DELAY: Duration = Duration::from_secs(2);
/// Spacing between nodes within one pass
const INTER_NODE_DELAY: Duration = Duration::from_secs(2);
/// Spacing between passes
const PASS_DELAY: Duration = Duration::from_secs(1);
/// Read slice length; bounds how long a raised pause goes unobserved
const READ_SLICE: Duration = Duration::from_millis(100);

/// Reply to one sensor poll, or the reason there was none.
enum SampleOutcome {
    Values(String),
    Preempted,
}

/// Drop the id header and the 2-character state code, keeping the
/// comma-separated sensor values.
fn extract_sensor_values(ascii: &str, node_id: &str) -> Option<String> {
    let frame = ReplyFrame::parse(ascii)?;
    if frame.node_id != node_id {
        return None;
    }
    Some(frame.body)
}

pub struct NodePoller {
    gateway_id: String,
    arbiter: Arc<Arbiter>,
    link: SerialLink,
    roster: Arc<NodeStore>,
    gateway: Arc<GatewayStore>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl NodePoller {
    pub fn new(
        config: &Config,
        arbiter: Arc<Arbiter>,
        link: SerialLink,
        roster: Arc<NodeStore>,
        gateway: Arc<GatewayStore>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            gateway_id: config.gateway_id().to_string(),
            arbiter,
            link,
            roster,
            gateway,
            telemetry,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("node_poller_started");

        loop {
            if *shutdown.borrow() {
                info!("node_poller_shutdown");
                return;
            }

            if self.arbiter.is_paused() {
                debug!("node_poll_paused");
                idle(&mut shutdown, PAUSE_BACKOFF).await;
                continue;
            }

            if !self.gateway.is_enrolled() {
                debug!("node_poll_skipped_gateway_unenrolled");
                idle(&mut shutdown, IDLE_DELAY).await;
                continue;
            }

            let nodes = self.roster.all();
            if nodes.is_empty() {
                debug!("node_poll_roster_empty");
                idle(&mut shutdown, IDLE_DELAY).await;
                continue;
            }

            let Ok(permit) = self.arbiter.acquire(ACQUIRE_TIMEOUT).await else {
                continue;
            };

            let mut conn = match self.link.open().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "node_poll_port_open_failed");
                    drop(permit);
                    idle(&mut shutdown, PASS_DELAY).await;
                    continue;
                }
            };

            for (index, node) in nodes.iter().enumerate() {
                if self.arbiter.is_paused() {
                    info!("node_poll_preempted");
                    break;
                }
                if *shutdown.borrow() {
                    break;
                }

                self.poll_node(&mut conn, &node.node_id).await;

                if index + 1 < nodes.len() && self.spaced_wait(&mut shutdown).await {
                    break;
                }
            }

            // Release the port and the permit before the inter-pass sleep
            drop(conn);
            drop(permit);
            debug!("node_poll_pass_complete");
            idle(&mut shutdown, PASS_DELAY).await;
        }
    }

    /// Poll one node, retrying once after a short wait on failure.
    async fn poll_node(&self, conn: &mut SerialConnection, node_id: &str) {
        for attempt in 1..=2 {
            match self.request_sample(conn, node_id).await {
                Ok(SampleOutcome::Values(values)) => {
                    info!(node_id = %node_id, sensor_data = %values, "sensor_data_received");
                    self.telemetry.publish_sensor_data(node_id, &values).await;
                    return;
                }
                Ok(SampleOutcome::Preempted) => return,
                Err(e) => {
                    warn!(node_id = %node_id, attempt, error = %e, "node_poll_failed");
                    // Back off before the retry, bailing out if preempted
                    if attempt == 1 {
                        let limit = Instant::now() + RETRY_DELAY;
                        while Instant::now() < limit {
                            if self.arbiter.is_paused() {
                                return;
                            }
                            tokio::time::sleep(READ_SLICE).await;
                        }
                    }
                }
            }
        }
    }

    /// One sensor request. Reads in short slices so a raised pause is
    /// observed mid-wait, not just between nodes.
    async fn request_sample(
        &self,
        conn: &mut SerialConnection,
        node_id: &str,
    ) -> Result<SampleOutcome, TransportError> {
        if self.arbiter.is_paused() {
            return Ok(SampleOutcome::Preempted);
        }

        let message = format!("{}{}{}", node_id, self.gateway_id, STATUS_SENSOR_POLL);
        conn.send_payload(&codec::encode(&message)).await?;

        let limit = Instant::now() + REPLY_DEADLINE;
        loop {
            if self.arbiter.is_paused() {
                return Ok(SampleOutcome::Preempted);
            }
            let remaining = limit.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Timeout);
            }

            if let Some(ascii) = conn.poll_frame(remaining.min(READ_SLICE)).await? {
                match extract_sensor_values(&ascii, node_id) {
                    Some(values) => return Ok(SampleOutcome::Values(values)),
                    // Foreign or malformed frame: keep waiting for ours
                    None => debug!(payload = %ascii, "node_poll_frame_ignored"),
                }
            }
        }
    }

    /// Inter-node spacing that still observes pause and shutdown while the
    /// permit is held. Returns whether the current pass should stop.
    async fn spaced_wait(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let limit = Instant::now() + INTER_NODE_DELAY;
        loop {
            if self.arbiter.is_paused() || *shutdown.borrow() {
                return true;
            }
            let remaining = limit.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            if idle(shutdown, remaining.min(READ_SLICE)).await {
                return true;
            }
        }
    }
}

/// Sleep unless shutdown fires first; returns whether we are shutting down.
async fn idle(shutdown: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = shutdown.changed() => *shutdown.borrow(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_sensor_values() {
        // header N201001 G100101, state 10, then the readings
        let ascii = "N201001G1001011025.5,60.2,1";
        assert_eq!(extract_sensor_values(ascii, "N201001").as_deref(), Some("25.5,60.2,1"));
    }

    #[test]
    fn test_extract_sensor_values_strips_state_code() {
        let values = extract_sensor_values("N201001G10010110", "N201001").unwrap();
        assert_eq!(values, "");
    }

    #[test]
    fn test_extract_sensor_values_foreign_node() {
        assert!(extract_sensor_values("N999999G1001011025.5", "N201001").is_none());
    }

    #[test]
    fn test_extract_sensor_values_short_frame() {
        assert!(extract_sensor_values("N201001G10010", "N201001").is_none());
    }

    #[test]
    fn test_poll_request_layout() {
        let message = format!("{}{}{}", "N201001", "G100101", STATUS_SENSOR_POLL);
        assert_eq!(message, "N201001G10010110");
    }
}
