//! Test utilities & fixtures.
//! Builds throwaway registers in temp dirs with a small but complete breeding graph.
#![allow(dead_code)]

use chrono::{Duration, NaiveDate, Utc};
use tempfile::TempDir;

use colombier::config::{BackupConfig, Config};
use colombier::model::{
    Couple, Egg, HealthRecord, HealthTarget, Notification, Pigeonneau, Preference, RecordId, Role,
    Sale, User,
};
use colombier::store::Store;

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
}

/// Fresh store under its own temp dir. Keep the `TempDir` alive for the test.
pub fn open_store() -> (TempDir, Store) {
    let dir = TempDir::new().expect("tempdir");
    let store = Store::open(dir.path().join("register")).expect("open store");
    (dir, store)
}

pub fn add_owner(store: &Store, username: &str) -> User {
    store
        .put_user(User::new(username, Role::User))
        .expect("create owner")
}

/// Config whose backup root lives inside `dir`.
pub fn config_in(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.storage.data_dir = dir.path().to_string_lossy().into_owned();
    config.backup = backup_config_in(dir, true);
    config
}

pub fn backup_config_in(dir: &TempDir, per_owner_subfolder: bool) -> BackupConfig {
    BackupConfig {
        root: dir.path().join("backups").to_string_lossy().into_owned(),
        per_owner_subfolder,
        max_backups_per_user: 0,
        retention_days: 0,
    }
}

/// Rows created by [`seed_register`].
pub struct Seeded {
    pub couples: Vec<Couple>,
    pub eggs: Vec<Egg>,
    pub pigeonneaux: Vec<Pigeonneau>,
    pub health_records: Vec<HealthRecord>,
    pub sales: Vec<Sale>,
    pub notifications: Vec<Notification>,
}

/// Two couples, two clutches, three squabs (two hatched from recorded eggs),
/// health records on a couple and a squab, one sale, one preference and two
/// notifications.
pub fn seed_register(store: &Store, owner_id: RecordId, prefix: &str) -> Seeded {
    let mut first = Couple::new(owner_id, &format!("{}1", prefix));
    first.breed = Some("Mondain".to_string());
    first.male_ring = Some(format!("FR-2025-{}-001", prefix));
    let first = store.insert_couple(first).expect("couple");
    let second = store
        .insert_couple(Couple::new(owner_id, &format!("{}2", prefix)))
        .expect("couple");

    let mut clutch = Egg::new(first.id, date(2026, 3, 2));
    clutch.egg2_laid_date = Some(date(2026, 3, 4));
    clutch.success1 = true;
    clutch.success2 = true;
    let clutch = store.insert_egg(clutch).expect("egg");
    let other_clutch = store
        .insert_egg(Egg::new(second.id, date(2026, 3, 10)))
        .expect("egg");

    let mut squab_a = Pigeonneau::new(first.id, date(2026, 3, 20));
    squab_a.egg_record_id = Some(clutch.id);
    let squab_a = store.insert_pigeonneau(squab_a).expect("pigeonneau");
    let mut squab_b = Pigeonneau::new(first.id, date(2026, 3, 21));
    squab_b.egg_record_id = Some(clutch.id);
    let squab_b = store.insert_pigeonneau(squab_b).expect("pigeonneau");
    let squab_c = store
        .insert_pigeonneau(Pigeonneau::new(second.id, date(2026, 4, 1)))
        .expect("pigeonneau");

    let couple_health = store
        .insert_health_record(HealthRecord::new(
            owner_id,
            HealthTarget::Couple,
            first.id,
            "Paramyxovirose vaccine",
            date(2026, 2, 1),
        ))
        .expect("health");
    let squab_health = store
        .insert_health_record(HealthRecord::new(
            owner_id,
            HealthTarget::Pigeonneau,
            squab_c.id,
            "Trichomonose",
            date(2026, 4, 15),
        ))
        .expect("health");

    let sale = store
        .insert_sale(Sale::new(owner_id, date(2026, 5, 1), 2, 12.5))
        .expect("sale");
    store
        .put_preference(Preference {
            owner_id,
            key: "language".to_string(),
            value: "fr".to_string(),
        })
        .expect("preference");

    let now = Utc::now();
    let mut read = Notification::new(owner_id, "Hatching", "Egg hatched", now - Duration::days(2));
    read.mark_read(now - Duration::days(1));
    let read = store.insert_notification(read).expect("notification");
    let unread = store
        .insert_notification(Notification::new(owner_id, "Vaccine", "Booster due", now))
        .expect("notification");

    Seeded {
        couples: vec![first, second],
        eggs: vec![clutch, other_clutch],
        pigeonneaux: vec![squab_a, squab_b, squab_c],
        health_records: vec![couple_health, squab_health],
        sales: vec![sale],
        notifications: vec![read, unread],
    }
}
