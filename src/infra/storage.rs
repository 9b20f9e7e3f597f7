//! Persistent JSON stores for gateway enrollment and the node roster
//!
//! Both files are read once at startup and rewritten whole on every
//! mutation. Writes go to a temp file in the same directory followed by a
//! rename, so a crash mid-write never leaves a torn file. A failed write is
//! logged and the in-memory state keeps the mutation; a failed read falls
//! back to the empty state (unenrolled / empty roster).

use crate::domain::types::{GatewayEnrollment, NodeRecord};
use parking_lot::RwLock;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to write {path}: {source}")]
    Write { path: String, source: std::io::Error },
}

fn write_atomic(path: &Path, json: &str) -> Result<(), StorageError> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).map_err(|source| StorageError::Write {
        path: tmp.display().to_string(),
        source,
    })?;
    fs::rename(&tmp, path).map_err(|source| StorageError::Write {
        path: path.display().to_string(),
        source,
    })
}

fn read_json<T: serde::de::DeserializeOwned + Default>(path: &Path) -> T {
    if !path.exists() {
        return T::default();
    }
    match fs::read_to_string(path).map_err(anyhow::Error::from).and_then(|content| {
        serde_json::from_str(&content).map_err(anyhow::Error::from)
    }) {
        Ok(value) => value,
        Err(e) => {
            error!(path = %path.display(), error = %e, "storage_read_failed");
            T::default()
        }
    }
}

/// Singleton gateway enrollment record (`gateway-status.json`).
pub struct GatewayStore {
    path: PathBuf,
    state: RwLock<GatewayEnrollment>,
}

impl GatewayStore {
    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let state = read_json(&path);
        Self { path, state: RwLock::new(state) }
    }

    pub fn is_enrolled(&self) -> bool {
        self.state.read().is_enrolled
    }

    pub fn gateway_id(&self) -> Option<String> {
        self.state.read().gateway_id.clone()
    }

    pub fn snapshot(&self) -> GatewayEnrollment {
        self.state.read().clone()
    }

    pub fn enroll(&self, gateway_id: &str) -> GatewayEnrollment {
        let enrollment = GatewayEnrollment::enrolled(gateway_id);
        *self.state.write() = enrollment.clone();
        self.persist(&enrollment);
        info!(gateway_id = %gateway_id, "gateway_enrollment_saved");
        enrollment
    }

    pub fn unenroll(&self) {
        let enrollment = GatewayEnrollment::default();
        *self.state.write() = enrollment.clone();
        self.persist(&enrollment);
        info!("gateway_enrollment_cleared");
    }

    fn persist(&self, state: &GatewayEnrollment) {
        let result = serde_json::to_string_pretty(state)
            .map_err(StorageError::from)
            .and_then(|json| write_atomic(&self.path, &json));
        if let Err(e) = result {
            error!(error = %e, "gateway_store_write_failed");
        }
    }
}

/// Node roster (`node-list.json`).
///
/// The file holds a flat list that may include nodes owned by other
/// gateways; reads filter on the owning gateway id, writes keep foreign
/// records intact.
pub struct NodeStore {
    path: PathBuf,
    gateway_id: String,
    nodes: RwLock<Vec<NodeRecord>>,
}

impl NodeStore {
    pub fn load<P: AsRef<Path>>(path: P, gateway_id: &str) -> Self {
        let path = path.as_ref().to_path_buf();
        let nodes: Vec<NodeRecord> = read_json(&path);
        Self { path, gateway_id: gateway_id.to_string(), nodes: RwLock::new(nodes) }
    }

    /// All nodes owned by this gateway, in roster order.
    pub fn all(&self) -> Vec<NodeRecord> {
        self.nodes.read().iter().filter(|n| n.gateway_id == self.gateway_id).cloned().collect()
    }

    pub fn exists(&self, node_id: &str) -> bool {
        self.nodes
            .read()
            .iter()
            .any(|n| n.node_id == node_id && n.gateway_id == self.gateway_id)
    }

    /// Add a node with both relays off. Replaces any record with the same
    /// `(node_id, gateway_id)` key so a repeated enroll cannot duplicate.
    pub fn insert(&self, node_id: &str) -> NodeRecord {
        let record = NodeRecord::new(node_id, &self.gateway_id);
        {
            let mut nodes = self.nodes.write();
            nodes.retain(|n| !(n.node_id == node_id && n.gateway_id == self.gateway_id));
            nodes.push(record.clone());
            self.persist(&nodes);
        }
        info!(node_id = %node_id, "node_saved");
        record
    }

    pub fn remove(&self, node_id: &str) -> bool {
        let mut nodes = self.nodes.write();
        let before = nodes.len();
        nodes.retain(|n| !(n.node_id == node_id && n.gateway_id == self.gateway_id));
        if nodes.len() == before {
            return false;
        }
        self.persist(&nodes);
        info!(node_id = %node_id, "node_removed");
        true
    }

    /// Update `relay1_state` or `relay2_state` for a node.
    pub fn set_relay(&self, node_id: &str, relay_number: u8, state: &str) -> bool {
        let mut nodes = self.nodes.write();
        let Some(node) = nodes
            .iter_mut()
            .find(|n| n.node_id == node_id && n.gateway_id == self.gateway_id)
        else {
            return false;
        };

        match relay_number {
            1 => node.relay1_state = state.to_string(),
            2 => node.relay2_state = state.to_string(),
            _ => return false,
        }
        node.timestamp = chrono::Utc::now();
        self.persist(&nodes);
        info!(node_id = %node_id, relay = relay_number, state = %state, "relay_state_saved");
        true
    }

    fn persist(&self, nodes: &[NodeRecord]) {
        let result = serde_json::to_string_pretty(nodes)
            .map_err(StorageError::from)
            .and_then(|json| write_atomic(&self.path, &json));
        if let Err(e) = result {
            error!(error = %e, "node_store_write_failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_gateway_store_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gateway-status.json");

        let store = GatewayStore::load(&path);
        assert!(!store.is_enrolled());

        store.enroll("G100101");
        assert!(store.is_enrolled());
        assert_eq!(store.gateway_id().as_deref(), Some("G100101"));

        // A fresh store sees the persisted record
        let reloaded = GatewayStore::load(&path);
        assert!(reloaded.is_enrolled());
        assert_eq!(reloaded.gateway_id().as_deref(), Some("G100101"));

        reloaded.unenroll();
        let empty = GatewayStore::load(&path);
        assert!(!empty.is_enrolled());
        assert!(empty.gateway_id().is_none());
    }

    #[test]
    fn test_gateway_store_corrupt_file_reverts_to_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gateway-status.json");
        fs::write(&path, "{not valid json").unwrap();

        let store = GatewayStore::load(&path);
        assert!(!store.is_enrolled());
    }

    #[test]
    fn test_node_store_insert_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("node-list.json");

        let store = NodeStore::load(&path, "G100101");
        store.insert("N201001");
        store.insert("N201001");

        assert_eq!(store.all().len(), 1);
        assert!(store.exists("N201001"));

        let reloaded = NodeStore::load(&path, "G100101");
        assert_eq!(reloaded.all().len(), 1);
    }

    #[test]
    fn test_node_store_remove() {
        let dir = tempdir().unwrap();
        let store = NodeStore::load(dir.path().join("node-list.json"), "G100101");

        store.insert("N201001");
        assert!(store.remove("N201001"));
        assert!(!store.exists("N201001"));
        assert!(!store.remove("N201001"));
    }

    #[test]
    fn test_node_store_set_relay() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("node-list.json");
        let store = NodeStore::load(&path, "G100101");

        store.insert("N201001");
        assert!(store.set_relay("N201001", 2, "1"));

        let node = &store.all()[0];
        assert_eq!(node.relay1_state, "0");
        assert_eq!(node.relay2_state, "1");

        assert!(!store.set_relay("N999999", 1, "1"));
        assert!(!store.set_relay("N201001", 3, "1"));
    }

    #[test]
    fn test_node_store_keeps_foreign_gateway_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("node-list.json");

        let ours = NodeStore::load(&path, "G100101");
        ours.insert("N201001");

        let theirs = NodeStore::load(&path, "G200202");
        theirs.insert("N300001");
        assert_eq!(theirs.all().len(), 1);

        // Removing through the second store leaves the first gateway's node
        theirs.remove("N300001");
        let reloaded = NodeStore::load(&path, "G100101");
        assert_eq!(reloaded.all().len(), 1);
    }

    #[test]
    fn test_node_store_preserves_roster_order() {
        let dir = tempdir().unwrap();
        let store = NodeStore::load(dir.path().join("node-list.json"), "G100101");

        store.insert("N201003");
        store.insert("N201001");
        store.insert("N201002");

        let ids: Vec<String> = store.all().into_iter().map(|n| n.node_id).collect();
        assert_eq!(ids, ["N201003", "N201001", "N201002"]);
    }
}
