use std::collections::HashSet;

use colombier::lifecycle::{ExportEngine, LifecycleError};
use colombier::model::{RecordId, SNAPSHOT_VERSION};

mod common;
use common::{add_owner, open_store, seed_register};

#[test]
fn export_contains_only_the_owners_graph() {
    let (_dir, store) = open_store();
    let alice = add_owner(&store, "alice");
    let bob = add_owner(&store, "bob");
    let alice_rows = seed_register(&store, alice.id, "A");
    let bob_rows = seed_register(&store, bob.id, "B");

    let snapshot = ExportEngine::new(store.clone())
        .export_snapshot(alice.id)
        .expect("export");

    assert_eq!(snapshot.metadata.owner_id, alice.id);
    assert_eq!(snapshot.metadata.owner_name, "alice");
    assert_eq!(snapshot.metadata.version, SNAPSHOT_VERSION);
    assert_eq!(snapshot.owner.id, alice.id);

    let couple_ids: HashSet<RecordId> = snapshot.couples.iter().map(|c| c.id).collect();
    assert!(snapshot.couples.iter().all(|c| c.owner_id == alice.id));
    assert!(snapshot.eggs.iter().all(|e| couple_ids.contains(&e.couple_id)));
    assert!(snapshot
        .pigeonneaux
        .iter()
        .all(|p| couple_ids.contains(&p.couple_id)));
    assert!(snapshot.health_records.iter().all(|h| h.owner_id == alice.id));
    assert!(snapshot.sales.iter().all(|s| s.owner_id == alice.id));
    assert!(snapshot.notifications.iter().all(|n| n.owner_id == alice.id));
    assert!(snapshot.preferences.iter().all(|p| p.owner_id == alice.id));

    let bob_couples: HashSet<RecordId> = bob_rows.couples.iter().map(|c| c.id).collect();
    assert!(couple_ids.is_disjoint(&bob_couples));

    assert_eq!(snapshot.couples.len(), alice_rows.couples.len());
    assert_eq!(snapshot.eggs.len(), alice_rows.eggs.len());
    assert_eq!(snapshot.pigeonneaux.len(), alice_rows.pigeonneaux.len());
    assert_eq!(snapshot.health_records.len(), alice_rows.health_records.len());
    assert_eq!(snapshot.sales.len(), alice_rows.sales.len());
    assert_eq!(snapshot.notifications.len(), alice_rows.notifications.len());
    assert_eq!(snapshot.preferences.len(), 1);
}

#[test]
fn statistics_match_collection_lengths() {
    let (_dir, store) = open_store();
    let owner = add_owner(&store, "carol");
    seed_register(&store, owner.id, "C");

    let snapshot = ExportEngine::new(store)
        .export_snapshot(owner.id)
        .expect("export");
    let stats = snapshot.statistics;
    assert_eq!(stats, snapshot.count_collections());
    assert_eq!(stats.couples, 2);
    assert_eq!(stats.eggs, 2);
    assert_eq!(stats.pigeonneaux, 3);
    assert_eq!(stats.health_records, 2);
    assert_eq!(stats.sales, 1);
    assert_eq!(stats.notifications, 2);
    assert_eq!(stats.preferences, 1);
}

#[test]
fn owner_without_data_exports_empty_collections() {
    let (_dir, store) = open_store();
    let owner = add_owner(&store, "dave");

    let snapshot = ExportEngine::new(store)
        .export_snapshot(owner.id)
        .expect("export");
    assert!(snapshot.couples.is_empty());
    assert!(snapshot.notifications.is_empty());
    assert_eq!(snapshot.statistics.couples, 0);
}

#[test]
fn unknown_owner_is_reported() {
    let (_dir, store) = open_store();
    let err = ExportEngine::new(store)
        .export_snapshot(4242)
        .expect_err("missing owner");
    assert!(matches!(err, LifecycleError::OwnerNotFound(4242)));
    assert_eq!(err.code(), "OWNER_NOT_FOUND");
}

#[test]
fn snapshot_json_uses_camel_case_keys() {
    let (_dir, store) = open_store();
    let owner = add_owner(&store, "erin");
    seed_register(&store, owner.id, "E");

    let snapshot = ExportEngine::new(store)
        .export_snapshot(owner.id)
        .expect("export");
    let json = serde_json::to_value(&snapshot).expect("json");
    assert_eq!(json["metadata"]["ownerName"], "erin");
    assert!(json["healthRecords"].is_array());
    assert!(json["pigeonneaux"][0]["coupleId"].is_u64());
    assert_eq!(json["statistics"]["pigeonneaux"], 3);
}
