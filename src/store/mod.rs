//! Sled-backed persistence for the breeding register.
//!
//! Every register row lives in the primary tree under a `table:` prefix and a
//! zero-padded id, so prefix scans come back in id order. Audit logs and
//! archive execution logs live in a separate logs tree.
//!
//! Multi-row writes go through [`Store::transaction`], which stages the writes in
//! a [`StoreTxn`] and applies them to the primary tree as one atomic batch.

mod errors;
mod txn;

pub use errors::StoreError;
pub use txn::{CascadeCounts, StoreTxn};

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::IVec;

use crate::model::{
    ArchiveExecutionLog, ArchivedNotification, ArchivedPushNotification, AuditLog, Couple, Egg,
    HealthRecord, Notification, PasswordResetCode, Pigeonneau, Preference, PushNotification,
    RecordId, Sale, User,
};

const TREE_PRIMARY: &str = "colombier";
const TREE_LOGS: &str = "colombier_logs";

pub(crate) const USERS: &str = "users:";
pub(crate) const COUPLES: &str = "couples:";
pub(crate) const EGGS: &str = "eggs:";
pub(crate) const PIGEONNEAUX: &str = "pigeonneaux:";
pub(crate) const HEALTH: &str = "health:";
pub(crate) const SALES: &str = "sales:";
pub(crate) const PREFERENCES: &str = "prefs:";
pub(crate) const NOTIFICATIONS: &str = "notifications:";
pub(crate) const PUSH: &str = "push:";
pub(crate) const ARCHIVED_NOTIFICATIONS: &str = "archived_notifications:";
pub(crate) const ARCHIVED_PUSH: &str = "archived_push:";
pub(crate) const RESET_CODES: &str = "reset_codes:";
const AUDIT: &str = "audit:";
const ARCHIVE_RUNS: &str = "archive_runs:";

/// Helper builder so tests can easily create throwaway stores with custom paths.
pub struct StoreBuilder {
    path: PathBuf,
    temporary: bool,
}

impl StoreBuilder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            temporary: false,
        }
    }

    /// Delete the database files when the last handle is dropped.
    pub fn temporary(mut self) -> Self {
        self.temporary = true;
        self
    }

    pub fn open(self) -> Result<Store, StoreError> {
        std::fs::create_dir_all(&self.path)?;
        let db = sled::Config::new()
            .path(&self.path)
            .temporary(self.temporary)
            .open()?;
        Store::from_db(db)
    }
}

/// Handle to the register database. Cloning is cheap and shares the same trees.
#[derive(Clone)]
pub struct Store {
    db: sled::Db,
    primary: sled::Tree,
    logs: sled::Tree,
}

impl Store {
    /// Open (or create) the register rooted at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        StoreBuilder::new(path.as_ref()).open()
    }

    fn from_db(db: sled::Db) -> Result<Self, StoreError> {
        let primary = db.open_tree(TREE_PRIMARY)?;
        let logs = db.open_tree(TREE_LOGS)?;
        Ok(Self { db, primary, logs })
    }

    pub(crate) fn key(prefix: &str, id: RecordId) -> Vec<u8> {
        format!("{}{:020}", prefix, id).into_bytes()
    }

    pub(crate) fn preference_key(owner_id: RecordId, key: &str) -> Vec<u8> {
        format!("{}{:020}:{}", PREFERENCES, owner_id, key).into_bytes()
    }

    pub(crate) fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
        Ok(bincode::serialize(value)?)
    }

    fn deserialize<T: DeserializeOwned>(bytes: IVec) -> Result<T, StoreError> {
        Ok(bincode::deserialize::<T>(&bytes)?)
    }

    /// Allocate a fresh primary key. Ids are never reused, gaps are expected.
    pub(crate) fn next_id(&self) -> Result<RecordId, StoreError> {
        Ok(self.db.generate_id()? + 1)
    }

    pub(crate) fn primary(&self) -> &sled::Tree {
        &self.primary
    }

    fn get_in<T: DeserializeOwned>(tree: &sled::Tree, key: &[u8]) -> Result<Option<T>, StoreError> {
        match tree.get(key)? {
            Some(bytes) => Ok(Some(Self::deserialize(bytes)?)),
            None => Ok(None),
        }
    }

    fn scan_in<T: DeserializeOwned>(tree: &sled::Tree, prefix: &str) -> Result<Vec<T>, StoreError> {
        let mut rows = Vec::new();
        for entry in tree.scan_prefix(prefix.as_bytes()) {
            let (_, bytes) = entry?;
            rows.push(Self::deserialize(bytes)?);
        }
        Ok(rows)
    }

    pub(crate) fn get_row<T: DeserializeOwned>(
        &self,
        prefix: &str,
        id: RecordId,
    ) -> Result<Option<T>, StoreError> {
        Self::get_in(&self.primary, &Self::key(prefix, id))
    }

    pub(crate) fn scan<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>, StoreError> {
        Self::scan_in(&self.primary, prefix)
    }

    pub(crate) fn contains(&self, prefix: &str, id: RecordId) -> Result<bool, StoreError> {
        Ok(self.primary.contains_key(Self::key(prefix, id))?)
    }

    fn count(&self, tree: &sled::Tree, prefix: &str) -> Result<u64, StoreError> {
        let mut total = 0u64;
        for entry in tree.scan_prefix(prefix.as_bytes()) {
            entry?;
            total += 1;
        }
        Ok(total)
    }

    /// Run `f` against a staged transaction and commit only if it succeeds.
    ///
    /// Returning `Err` from `f` discards every staged write.
    pub fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut StoreTxn<'_>) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut txn = StoreTxn::new(self);
        let value = f(&mut txn)?;
        txn.commit()?;
        Ok(value)
    }

    // ----- users -----

    /// Insert a new user (zero id) or update an existing one.
    ///
    /// Ids are only ever handed out by the allocator, so a non-zero id must
    /// already belong to a stored user.
    pub fn put_user(&self, mut user: User) -> Result<User, StoreError> {
        if user.id == 0 {
            user.id = self.next_id()?;
        } else if !self.contains(USERS, user.id)? {
            return Err(StoreError::NotFound(format!("user #{}", user.id)));
        }
        self.primary
            .insert(Self::key(USERS, user.id), Self::serialize(&user)?)?;
        self.primary.flush()?;
        Ok(user)
    }

    pub fn get_user(&self, id: RecordId) -> Result<Option<User>, StoreError> {
        self.get_row(USERS, id)
    }

    pub fn list_users(&self) -> Result<Vec<User>, StoreError> {
        self.scan(USERS)
    }

    // ----- register graph -----

    pub fn insert_couple(&self, couple: Couple) -> Result<Couple, StoreError> {
        self.transaction(|tx| tx.insert_couple(couple))
    }

    pub fn get_couple(&self, id: RecordId) -> Result<Option<Couple>, StoreError> {
        self.get_row(COUPLES, id)
    }

    pub fn list_couples_by_owner(&self, owner_id: RecordId) -> Result<Vec<Couple>, StoreError> {
        Ok(self
            .scan::<Couple>(COUPLES)?
            .into_iter()
            .filter(|c| c.owner_id == owner_id)
            .collect())
    }

    /// Delete a couple together with its eggs and pigeonneaux.
    pub fn delete_couple(&self, id: RecordId) -> Result<CascadeCounts, StoreError> {
        self.transaction(|tx| tx.delete_couple_cascade(id))
    }

    pub fn insert_egg(&self, egg: Egg) -> Result<Egg, StoreError> {
        self.transaction(|tx| tx.insert_egg(egg))
    }

    pub fn get_egg(&self, id: RecordId) -> Result<Option<Egg>, StoreError> {
        self.get_row(EGGS, id)
    }

    pub fn list_eggs_for_couples(
        &self,
        couple_ids: &HashSet<RecordId>,
    ) -> Result<Vec<Egg>, StoreError> {
        Ok(self
            .scan::<Egg>(EGGS)?
            .into_iter()
            .filter(|e| couple_ids.contains(&e.couple_id))
            .collect())
    }

    pub fn insert_pigeonneau(&self, pigeonneau: Pigeonneau) -> Result<Pigeonneau, StoreError> {
        self.transaction(|tx| tx.insert_pigeonneau(pigeonneau))
    }

    pub fn list_pigeonneaux_for_couples(
        &self,
        couple_ids: &HashSet<RecordId>,
    ) -> Result<Vec<Pigeonneau>, StoreError> {
        Ok(self
            .scan::<Pigeonneau>(PIGEONNEAUX)?
            .into_iter()
            .filter(|p| couple_ids.contains(&p.couple_id))
            .collect())
    }

    pub fn insert_health_record(&self, record: HealthRecord) -> Result<HealthRecord, StoreError> {
        self.transaction(|tx| tx.insert_health_record(record))
    }

    pub fn list_health_records_by_owner(
        &self,
        owner_id: RecordId,
    ) -> Result<Vec<HealthRecord>, StoreError> {
        Ok(self
            .scan::<HealthRecord>(HEALTH)?
            .into_iter()
            .filter(|h| h.owner_id == owner_id)
            .collect())
    }

    pub fn insert_sale(&self, sale: Sale) -> Result<Sale, StoreError> {
        self.transaction(|tx| tx.insert_sale(sale))
    }

    pub fn list_sales_by_owner(&self, owner_id: RecordId) -> Result<Vec<Sale>, StoreError> {
        Ok(self
            .scan::<Sale>(SALES)?
            .into_iter()
            .filter(|s| s.owner_id == owner_id)
            .collect())
    }

    pub fn put_preference(&self, preference: Preference) -> Result<(), StoreError> {
        self.transaction(|tx| tx.put_preference(preference))
    }

    pub fn list_preferences_by_owner(
        &self,
        owner_id: RecordId,
    ) -> Result<Vec<Preference>, StoreError> {
        let prefix = format!("{}{:020}:", PREFERENCES, owner_id);
        self.scan(&prefix)
    }

    // ----- notifications -----

    pub fn insert_notification(&self, notification: Notification) -> Result<Notification, StoreError> {
        self.transaction(|tx| tx.insert_notification(notification))
    }

    pub fn get_notification(&self, id: RecordId) -> Result<Option<Notification>, StoreError> {
        self.get_row(NOTIFICATIONS, id)
    }

    pub fn list_notifications(&self) -> Result<Vec<Notification>, StoreError> {
        self.scan(NOTIFICATIONS)
    }

    pub fn list_notifications_by_owner(
        &self,
        owner_id: RecordId,
    ) -> Result<Vec<Notification>, StoreError> {
        Ok(self
            .list_notifications()?
            .into_iter()
            .filter(|n| n.owner_id == owner_id)
            .collect())
    }

    pub fn insert_push_notification(
        &self,
        push: PushNotification,
    ) -> Result<PushNotification, StoreError> {
        self.transaction(|tx| tx.insert_push_notification(push))
    }

    pub fn get_push_notification(
        &self,
        id: RecordId,
    ) -> Result<Option<PushNotification>, StoreError> {
        self.get_row(PUSH, id)
    }

    pub fn list_push_notifications(&self) -> Result<Vec<PushNotification>, StoreError> {
        self.scan(PUSH)
    }

    pub fn get_archived_notification(
        &self,
        original_id: RecordId,
    ) -> Result<Option<ArchivedNotification>, StoreError> {
        self.get_row(ARCHIVED_NOTIFICATIONS, original_id)
    }

    pub fn list_archived_notifications(&self) -> Result<Vec<ArchivedNotification>, StoreError> {
        self.scan(ARCHIVED_NOTIFICATIONS)
    }

    pub fn list_archived_push_notifications(
        &self,
    ) -> Result<Vec<ArchivedPushNotification>, StoreError> {
        self.scan(ARCHIVED_PUSH)
    }

    // ----- password reset codes -----

    pub fn insert_reset_code(
        &self,
        mut code: PasswordResetCode,
    ) -> Result<PasswordResetCode, StoreError> {
        if code.id == 0 {
            code.id = self.next_id()?;
        }
        self.primary
            .insert(Self::key(RESET_CODES, code.id), Self::serialize(&code)?)?;
        self.primary.flush()?;
        Ok(code)
    }

    pub fn list_reset_codes(&self) -> Result<Vec<PasswordResetCode>, StoreError> {
        self.scan(RESET_CODES)
    }

    // ----- logs tree -----

    pub fn insert_audit_log(&self, mut entry: AuditLog) -> Result<AuditLog, StoreError> {
        if entry.id == 0 {
            entry.id = self.next_id()?;
        }
        self.logs
            .insert(Self::key(AUDIT, entry.id), Self::serialize(&entry)?)?;
        self.logs.flush()?;
        Ok(entry)
    }

    pub fn list_audit_logs(&self) -> Result<Vec<AuditLog>, StoreError> {
        Self::scan_in(&self.logs, AUDIT)
    }

    /// Delete the given audit log ids in one batch; returns how many existed.
    pub fn delete_audit_logs(&self, ids: &[RecordId]) -> Result<u64, StoreError> {
        let mut batch = sled::Batch::default();
        let mut deleted = 0u64;
        for id in ids {
            let key = Self::key(AUDIT, *id);
            if self.logs.contains_key(&key)? {
                batch.remove(key);
                deleted += 1;
            }
        }
        self.logs.apply_batch(batch)?;
        self.logs.flush()?;
        Ok(deleted)
    }

    pub fn insert_archive_log(
        &self,
        mut entry: ArchiveExecutionLog,
    ) -> Result<ArchiveExecutionLog, StoreError> {
        if entry.id == 0 {
            entry.id = self.next_id()?;
        }
        self.logs
            .insert(Self::key(ARCHIVE_RUNS, entry.id), Self::serialize(&entry)?)?;
        self.logs.flush()?;
        Ok(entry)
    }

    /// Archive execution logs, newest first.
    pub fn list_archive_logs(&self) -> Result<Vec<ArchiveExecutionLog>, StoreError> {
        let mut logs: Vec<ArchiveExecutionLog> = Self::scan_in(&self.logs, ARCHIVE_RUNS)?;
        logs.reverse();
        Ok(logs)
    }

    // ----- counts for reporting -----

    pub fn count_notifications(&self) -> Result<u64, StoreError> {
        self.count(&self.primary, NOTIFICATIONS)
    }

    pub fn count_archived_notifications(&self) -> Result<u64, StoreError> {
        self.count(&self.primary, ARCHIVED_NOTIFICATIONS)
    }

    pub fn count_push_notifications(&self) -> Result<u64, StoreError> {
        self.count(&self.primary, PUSH)
    }

    pub fn count_archived_push_notifications(&self) -> Result<u64, StoreError> {
        self.count(&self.primary, ARCHIVED_PUSH)
    }

    pub fn count_audit_logs(&self) -> Result<u64, StoreError> {
        self.count(&self.logs, AUDIT)
    }

    pub fn count_reset_codes(&self) -> Result<u64, StoreError> {
        self.count(&self.primary, RESET_CODES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Role;
    use chrono::{NaiveDate, Utc};
    use tempfile::tempdir;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 4, d).unwrap()
    }

    #[test]
    fn put_user_only_updates_allocated_ids() {
        let tmp = tempdir().unwrap();
        let store = Store::open(tmp.path()).unwrap();
        let mut forged = User::new("forged", Role::User);
        forged.id = 7;
        assert!(matches!(
            store.put_user(forged).unwrap_err(),
            StoreError::NotFound(_)
        ));

        let mut alice = store.put_user(User::new("alice", Role::User)).unwrap();
        let bob = store.put_user(User::new("bob", Role::User)).unwrap();
        assert_ne!(alice.id, bob.id);

        alice.email = Some("alice@colombier.test".to_string());
        let updated = store.put_user(alice.clone()).unwrap();
        assert_eq!(updated.id, alice.id);
        assert_eq!(store.list_users().unwrap().len(), 2);
        assert_eq!(
            store.get_user(alice.id).unwrap().unwrap().email.as_deref(),
            Some("alice@colombier.test")
        );
    }

    #[test]
    fn egg_requires_existing_couple() {
        let tmp = tempdir().unwrap();
        let store = Store::open(tmp.path()).unwrap();
        let err = store.insert_egg(Egg::new(999, date(1))).unwrap_err();
        assert!(matches!(
            err,
            StoreError::DanglingReference { parent: "couple", parent_id: 999, .. }
        ));
    }

    #[test]
    fn delete_couple_cascades_to_children() {
        let tmp = tempdir().unwrap();
        let store = Store::open(tmp.path()).unwrap();
        let owner = store.put_user(User::new("alice", Role::User)).unwrap();
        let couple = store.insert_couple(Couple::new(owner.id, "A1")).unwrap();
        let egg = store.insert_egg(Egg::new(couple.id, date(2))).unwrap();
        let mut squab = Pigeonneau::new(couple.id, date(20));
        squab.egg_record_id = Some(egg.id);
        store.insert_pigeonneau(squab).unwrap();

        let counts = store.delete_couple(couple.id).unwrap();
        assert_eq!(counts, CascadeCounts { couples: 1, eggs: 1, pigeonneaux: 1 });

        let ids: HashSet<RecordId> = [couple.id].into_iter().collect();
        assert!(store.get_couple(couple.id).unwrap().is_none());
        assert!(store.list_eggs_for_couples(&ids).unwrap().is_empty());
        assert!(store.list_pigeonneaux_for_couples(&ids).unwrap().is_empty());
    }

    #[test]
    fn failed_transaction_writes_nothing() {
        let tmp = tempdir().unwrap();
        let store = Store::open(tmp.path()).unwrap();
        let owner = store.put_user(User::new("bob", Role::User)).unwrap();

        let result: Result<(), StoreError> = store.transaction(|tx| {
            tx.insert_couple(Couple::new(owner.id, "B1"))?;
            tx.insert_couple(Couple::new(owner.id, ""))?;
            Ok(())
        });
        assert!(matches!(result, Err(StoreError::InvalidRecord { .. })));
        assert!(store.list_couples_by_owner(owner.id).unwrap().is_empty());
    }

    #[test]
    fn preferences_upsert_by_key() {
        let tmp = tempdir().unwrap();
        let store = Store::open(tmp.path()).unwrap();
        for value in ["fr", "en"] {
            store
                .put_preference(Preference {
                    owner_id: 3,
                    key: "lang".to_string(),
                    value: value.to_string(),
                })
                .unwrap();
        }
        let prefs = store.list_preferences_by_owner(3).unwrap();
        assert_eq!(prefs.len(), 1);
        assert_eq!(prefs[0].value, "en");
        assert!(store.list_preferences_by_owner(30).unwrap().is_empty());
    }

    #[test]
    fn archive_logs_listed_newest_first() {
        let tmp = tempdir().unwrap();
        let store = Store::open(tmp.path()).unwrap();
        for kind in [crate::model::ArchiveType::Notifications, crate::model::ArchiveType::Full] {
            store
                .insert_archive_log(ArchiveExecutionLog {
                    id: 0,
                    archive_type: kind,
                    archived_count: 0,
                    deleted_count: 0,
                    duration_ms: 1,
                    status: crate::model::ArchiveStatus::Success,
                    error_message: None,
                    executed_at: Utc::now(),
                    executed_by: None,
                })
                .unwrap();
        }
        let logs = store.list_archive_logs().unwrap();
        assert_eq!(logs[0].archive_type, crate::model::ArchiveType::Full);
    }
}
