//! Integration tests for the persistent stores

use lora_gateway_bridge::infra::{GatewayStore, NodeStore};
use tempfile::tempdir;

#[test]
fn test_enrollment_survives_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("gateway-status.json");

    {
        let store = GatewayStore::load(&path);
        assert!(!store.is_enrolled());
        store.enroll("G100101");
    }

    let store = GatewayStore::load(&path);
    assert!(store.is_enrolled());
    let snapshot = store.snapshot();
    assert_eq!(snapshot.gateway_id.as_deref(), Some("G100101"));
    assert!(snapshot.enrolled_at.is_some());
}

#[test]
fn test_unenroll_clears_persisted_record() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("gateway-status.json");

    GatewayStore::load(&path).enroll("G100101");
    GatewayStore::load(&path).unenroll();

    let snapshot = GatewayStore::load(&path).snapshot();
    assert!(!snapshot.is_enrolled);
    assert!(snapshot.gateway_id.is_none());
    assert!(snapshot.enrolled_at.is_none());
}

#[test]
fn test_roster_uniqueness_across_enroll_sequences() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("node-list.json");

    let store = NodeStore::load(&path, "G100101");
    store.insert("N201001");
    store.insert("N201002");
    // Repeat of the first enroll must not duplicate
    store.insert("N201001");
    store.remove("N201002");
    store.insert("N201002");

    let reloaded = NodeStore::load(&path, "G100101");
    let nodes = reloaded.all();
    assert_eq!(nodes.len(), 2);

    let mut ids: Vec<&str> = nodes.iter().map(|n| n.node_id.as_str()).collect();
    ids.sort_unstable();
    assert_eq!(ids, ["N201001", "N201002"]);
}

#[test]
fn test_relay_state_survives_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("node-list.json");

    {
        let store = NodeStore::load(&path, "G100101");
        store.insert("N201001");
        store.set_relay("N201001", 1, "1");
        store.set_relay("N201001", 2, "1");
        store.set_relay("N201001", 2, "0");
    }

    let nodes = NodeStore::load(&path, "G100101").all();
    assert_eq!(nodes[0].relay1_state, "1");
    assert_eq!(nodes[0].relay2_state, "0");
}

#[test]
fn test_corrupt_files_fall_back_to_empty_state() {
    let dir = tempdir().unwrap();
    let gateway_path = dir.path().join("gateway-status.json");
    let roster_path = dir.path().join("node-list.json");
    std::fs::write(&gateway_path, "][").unwrap();
    std::fs::write(&roster_path, "{\"wrong\": \"shape\"}").unwrap();

    assert!(!GatewayStore::load(&gateway_path).is_enrolled());
    assert!(NodeStore::load(&roster_path, "G100101").all().is_empty());
}

#[test]
fn test_rewrite_leaves_no_temp_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("node-list.json");

    let store = NodeStore::load(&path, "G100101");
    store.insert("N201001");

    let entries: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(entries, ["node-list.json"]);
}
