use std::fs;

use chrono::{Duration, Utc};
use tempfile::TempDir;

use colombier::config::BackupConfig;
use colombier::lifecycle::{BackupStorage, ExportEngine, Lifecycle, LifecycleError, RestoreOptions};
use colombier::model::{RecordId, Snapshot};
use colombier::store::Store;
use colombier::validation::{backup_filename, parse_backup_filename};

mod common;
use common::{add_owner, backup_config_in, config_in, open_store, seed_register};

fn snapshot_of(store: &Store, owner_id: RecordId) -> Snapshot {
    ExportEngine::new(store.clone())
        .export_snapshot(owner_id)
        .expect("export")
}

#[test]
fn listings_never_cross_owners() {
    let (_dir, store) = open_store();
    let alice = add_owner(&store, "alice");
    let bob = add_owner(&store, "bob");
    let alice_snapshot = snapshot_of(&store, alice.id);
    let bob_snapshot = snapshot_of(&store, bob.id);

    for per_owner_subfolder in [true, false] {
        let root = TempDir::new().expect("tempdir");
        let backups = BackupStorage::new(backup_config_in(&root, per_owner_subfolder));
        backups.write_backup(alice.id, &alice_snapshot).expect("write");
        backups.write_backup(alice.id, &alice_snapshot).expect("write");
        backups.write_backup(bob.id, &bob_snapshot).expect("write");

        let listed = backups.list_backups(alice.id).expect("list");
        assert_eq!(listed.len(), 2);
        for file in &listed {
            assert_eq!(file.owner_id, alice.id);
            let parsed = parse_backup_filename(&file.filename).expect("name");
            assert_eq!(parsed.owner_id, alice.id);
        }
        assert_eq!(backups.list_backups(bob.id).expect("list").len(), 1);
    }
}

#[test]
fn owner_ids_with_shared_digits_stay_isolated() {
    let root = TempDir::new().expect("tempdir");
    let (_dir, store) = open_store();
    let owner = add_owner(&store, "one");
    let snapshot = snapshot_of(&store, owner.id);
    let backups = BackupStorage::new(backup_config_in(&root, false));

    backups.write_backup(1, &snapshot).expect("write");
    backups.write_backup(12, &snapshot).expect("write");

    assert_eq!(backups.list_backups(1).expect("list").len(), 1);
    assert_eq!(backups.list_backups(12).expect("list").len(), 1);
}

#[test]
fn saved_backup_restores_into_the_owner() {
    let dir = TempDir::new().expect("tempdir");
    let store = Store::open(dir.path().join("register")).expect("store");
    let owner = add_owner(&store, "saver");
    seed_register(&store, owner.id, "S");
    let lifecycle = Lifecycle::new(store.clone(), &config_in(&dir));

    let file = lifecycle.save_backup(owner.id).expect("save");
    assert!(file.filename.starts_with(&format!("backup_user{}_", owner.id)));
    assert!(file.size_bytes > 0);
    assert!(lifecycle
        .backups
        .owner_dir(owner.id)
        .join(&file.filename)
        .is_file());

    let result = lifecycle
        .restore_from_backup(
            owner.id,
            &file.filename,
            RestoreOptions {
                clear_existing: true,
                skip_notifications: false,
            },
        )
        .expect("restore");
    assert_eq!(result.imported.couples, 2);
    assert_eq!(result.cleared_couples, 2);
    assert_eq!(snapshot_of(&store, owner.id).statistics.couples, 2);
}

#[test]
fn another_owners_backup_reads_as_not_found() {
    let root = TempDir::new().expect("tempdir");
    let (_dir, store) = open_store();
    let alice = add_owner(&store, "alice");
    let backups = BackupStorage::new(backup_config_in(&root, false));
    let file = backups
        .write_backup(alice.id, &snapshot_of(&store, alice.id))
        .expect("write");

    let err = backups
        .read_backup(alice.id + 1, &file.filename)
        .expect_err("foreign backup");
    assert!(matches!(err, LifecycleError::BackupNotFound { .. }));
    assert!(backups.read_backup(alice.id, &file.filename).is_ok());
}

#[test]
fn traversal_and_malformed_names_are_rejected() {
    let root = TempDir::new().expect("tempdir");
    let backups = BackupStorage::new(backup_config_in(&root, true));
    let name = backup_filename(2, Utc::now());

    for filename in [
        format!("../user_2/{}", name),
        format!("..\\{}", name),
        "backup_user1_..json".to_string(),
        "/etc/passwd".to_string(),
        "notes.json".to_string(),
    ] {
        let err = backups.read_backup(1, &filename).expect_err("rejected");
        assert!(
            matches!(err, LifecycleError::BackupNotFound { .. }),
            "{} gave {:?}",
            filename,
            err
        );
        assert!(backups.delete_backup(1, &filename).is_err());
    }
}

#[test]
fn unreadable_contents_are_reported_as_corrupt() {
    let root = TempDir::new().expect("tempdir");
    let backups = BackupStorage::new(backup_config_in(&root, true));
    let dir = backups.ensure_directory(5).expect("dir");

    let garbage = backup_filename(5, Utc::now() - Duration::minutes(5));
    fs::write(dir.join(&garbage), b"{ not json").expect("write");
    let err = backups.read_backup(5, &garbage).expect_err("corrupt");
    assert!(matches!(err, LifecycleError::BackupCorrupt { .. }));
    assert_eq!(err.code(), "BACKUP_CORRUPT");

    let (_dir, store) = open_store();
    let owner = add_owner(&store, "future");
    let mut future = snapshot_of(&store, owner.id);
    future.metadata.version = "2.0".to_string();
    let future_name = backup_filename(5, Utc::now() - Duration::minutes(1));
    fs::write(
        dir.join(&future_name),
        serde_json::to_vec_pretty(&future).expect("json"),
    )
    .expect("write");
    let err = backups.read_backup(5, &future_name).expect_err("version");
    assert!(matches!(err, LifecycleError::InvalidSnapshotFormat(_)));
}

#[test]
fn unwritable_root_reports_persist_failure() {
    let dir = TempDir::new().expect("tempdir");
    let (_store_dir, store) = open_store();
    let owner = add_owner(&store, "blocked");
    let snapshot = snapshot_of(&store, owner.id);
    let blocker = dir.path().join("not-a-directory");
    fs::write(&blocker, b"plain file").expect("write");

    for per_owner_subfolder in [true, false] {
        let backups = BackupStorage::new(BackupConfig {
            root: blocker.to_string_lossy().into_owned(),
            per_owner_subfolder,
            max_backups_per_user: 0,
            retention_days: 0,
        });
        let err = backups
            .write_backup(owner.id, &snapshot)
            .expect_err("root is a file");
        assert!(matches!(err, LifecycleError::BackupPersistFailed { .. }));
        assert_eq!(err.code(), "BACKUP_PERSIST_FAILED");
    }
}

#[test]
fn retention_keeps_the_newest_backups() {
    let root = TempDir::new().expect("tempdir");
    let (_dir, store) = open_store();
    let owner = add_owner(&store, "keeper");
    let snapshot = snapshot_of(&store, owner.id);
    let backups = BackupStorage::new(BackupConfig {
        max_backups_per_user: 2,
        ..backup_config_in(&root, true)
    });

    let mut written = Vec::new();
    for _ in 0..4 {
        written.push(backups.write_backup(owner.id, &snapshot).expect("write"));
    }

    let listed = backups.list_backups(owner.id).expect("list");
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].filename, written[3].filename);
    assert_eq!(listed[1].filename, written[2].filename);
    assert!(listed[0].created_at >= listed[1].created_at);
}

#[test]
fn retention_drops_backups_past_the_age_limit() {
    let root = TempDir::new().expect("tempdir");
    let (_dir, store) = open_store();
    let owner = add_owner(&store, "aging");
    let snapshot = snapshot_of(&store, owner.id);
    let backups = BackupStorage::new(BackupConfig {
        retention_days: 30,
        ..backup_config_in(&root, true)
    });

    let dir = backups.ensure_directory(owner.id).expect("dir");
    let body = serde_json::to_vec_pretty(&snapshot).expect("json");
    let stale = backup_filename(owner.id, Utc::now() - Duration::days(40));
    let recent = backup_filename(owner.id, Utc::now() - Duration::days(3));
    fs::write(dir.join(&stale), &body).expect("write");
    fs::write(dir.join(&recent), &body).expect("write");

    let fresh = backups.write_backup(owner.id, &snapshot).expect("write");

    let names: Vec<String> = backups
        .list_backups(owner.id)
        .expect("list")
        .into_iter()
        .map(|f| f.filename)
        .collect();
    assert_eq!(names, vec![fresh.filename, recent]);
}

#[test]
fn delete_removes_only_the_named_backup() {
    let root = TempDir::new().expect("tempdir");
    let (_dir, store) = open_store();
    let owner = add_owner(&store, "deleter");
    let snapshot = snapshot_of(&store, owner.id);
    let backups = BackupStorage::new(backup_config_in(&root, true));

    let first = backups.write_backup(owner.id, &snapshot).expect("write");
    let second = backups.write_backup(owner.id, &snapshot).expect("write");

    backups.delete_backup(owner.id, &first.filename).expect("delete");
    let listed = backups.list_backups(owner.id).expect("list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].filename, second.filename);

    let err = backups
        .delete_backup(owner.id, &first.filename)
        .expect_err("already gone");
    assert!(matches!(err, LifecycleError::BackupNotFound { .. }));
}

#[test]
fn administrators_can_list_every_owner() {
    let (_dir, store) = open_store();
    let alice = add_owner(&store, "alice");
    let bob = add_owner(&store, "bob");

    for per_owner_subfolder in [true, false] {
        let root = TempDir::new().expect("tempdir");
        let backups = BackupStorage::new(backup_config_in(&root, per_owner_subfolder));
        backups
            .write_backup(alice.id, &snapshot_of(&store, alice.id))
            .expect("write");
        backups
            .write_backup(bob.id, &snapshot_of(&store, bob.id))
            .expect("write");

        let all = backups.list_all_backups().expect("list all");
        assert_eq!(all.len(), 2);
        assert!(all.iter().any(|f| f.owner_id == alice.id));
        assert!(all.iter().any(|f| f.owner_id == bob.id));
    }
}
