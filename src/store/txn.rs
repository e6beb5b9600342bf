use std::collections::HashSet;

use chrono::{DateTime, Utc};
use log::debug;

use super::{
    Store, StoreError, ARCHIVED_NOTIFICATIONS, ARCHIVED_PUSH, COUPLES, EGGS, HEALTH,
    NOTIFICATIONS, PIGEONNEAUX, PUSH, RESET_CODES, SALES, USERS,
};
use crate::model::{
    Archived, ArchivedNotification, Couple, Egg, HealthRecord, Notification, Pigeonneau,
    Preference, PushNotification, RecordId, Sale,
};
use crate::validation::validate_label;

/// Rows removed by a cascading couple delete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CascadeCounts {
    pub couples: usize,
    pub eggs: usize,
    pub pigeonneaux: usize,
}

/// Staged writes against the primary tree.
///
/// Reads see committed state; writes are buffered in a [`sled::Batch`] and only
/// become visible when the owning [`Store::transaction`] commits. Foreign keys are
/// checked against committed rows plus the rows staged in this transaction.
pub struct StoreTxn<'a> {
    store: &'a Store,
    batch: sled::Batch,
    writes: usize,
    staged_couples: HashSet<RecordId>,
    staged_eggs: HashSet<RecordId>,
    removed_couples: HashSet<RecordId>,
    removed_eggs: HashSet<RecordId>,
}

impl<'a> StoreTxn<'a> {
    pub(super) fn new(store: &'a Store) -> Self {
        Self {
            store,
            batch: sled::Batch::default(),
            writes: 0,
            staged_couples: HashSet::new(),
            staged_eggs: HashSet::new(),
            removed_couples: HashSet::new(),
            removed_eggs: HashSet::new(),
        }
    }

    pub(super) fn commit(self) -> Result<usize, StoreError> {
        let tree = self.store.primary();
        tree.apply_batch(self.batch)?;
        tree.flush()?;
        debug!("store transaction committed {} writes", self.writes);
        Ok(self.writes)
    }

    /// Number of writes staged so far.
    pub fn staged_writes(&self) -> usize {
        self.writes
    }

    fn stage<T: serde::Serialize>(&mut self, key: Vec<u8>, value: &T) -> Result<(), StoreError> {
        self.batch.insert(key, Store::serialize(value)?);
        self.writes += 1;
        Ok(())
    }

    fn unstage(&mut self, key: Vec<u8>) {
        self.batch.remove(key);
        self.writes += 1;
    }

    fn couple_exists(&self, id: RecordId) -> Result<bool, StoreError> {
        if self.staged_couples.contains(&id) {
            return Ok(true);
        }
        Ok(!self.removed_couples.contains(&id) && self.store.contains(COUPLES, id)?)
    }

    fn egg_exists(&self, id: RecordId) -> Result<bool, StoreError> {
        if self.staged_eggs.contains(&id) {
            return Ok(true);
        }
        Ok(!self.removed_eggs.contains(&id) && self.store.contains(EGGS, id)?)
    }

    fn owner_exists(&self, id: RecordId) -> Result<bool, StoreError> {
        self.store.contains(USERS, id)
    }

    /// Insert a couple under a freshly allocated id.
    pub fn insert_couple(&mut self, mut couple: Couple) -> Result<Couple, StoreError> {
        validate_label("nest number", &couple.nest_number).map_err(|source| {
            StoreError::InvalidRecord {
                entity: "couple",
                source,
            }
        })?;
        if !self.owner_exists(couple.owner_id)? {
            return Err(StoreError::DanglingReference {
                entity: "couple",
                parent: "owner",
                parent_id: couple.owner_id,
            });
        }
        couple.id = self.store.next_id()?;
        self.stage(Store::key(COUPLES, couple.id), &couple)?;
        self.staged_couples.insert(couple.id);
        Ok(couple)
    }

    pub fn insert_egg(&mut self, mut egg: Egg) -> Result<Egg, StoreError> {
        if !self.couple_exists(egg.couple_id)? {
            return Err(StoreError::DanglingReference {
                entity: "egg",
                parent: "couple",
                parent_id: egg.couple_id,
            });
        }
        egg.id = self.store.next_id()?;
        self.stage(Store::key(EGGS, egg.id), &egg)?;
        self.staged_eggs.insert(egg.id);
        Ok(egg)
    }

    pub fn insert_pigeonneau(&mut self, mut pigeonneau: Pigeonneau) -> Result<Pigeonneau, StoreError> {
        if !self.couple_exists(pigeonneau.couple_id)? {
            return Err(StoreError::DanglingReference {
                entity: "pigeonneau",
                parent: "couple",
                parent_id: pigeonneau.couple_id,
            });
        }
        if let Some(egg_id) = pigeonneau.egg_record_id {
            if !self.egg_exists(egg_id)? {
                return Err(StoreError::DanglingReference {
                    entity: "pigeonneau",
                    parent: "egg",
                    parent_id: egg_id,
                });
            }
        }
        pigeonneau.id = self.store.next_id()?;
        self.stage(Store::key(PIGEONNEAUX, pigeonneau.id), &pigeonneau)?;
        Ok(pigeonneau)
    }

    pub fn insert_health_record(&mut self, mut record: HealthRecord) -> Result<HealthRecord, StoreError> {
        validate_label("product", &record.product).map_err(|source| StoreError::InvalidRecord {
            entity: "health record",
            source,
        })?;
        record.id = self.store.next_id()?;
        self.stage(Store::key(HEALTH, record.id), &record)?;
        Ok(record)
    }

    pub fn insert_sale(&mut self, mut sale: Sale) -> Result<Sale, StoreError> {
        sale.id = self.store.next_id()?;
        self.stage(Store::key(SALES, sale.id), &sale)?;
        Ok(sale)
    }

    /// Insert or replace the preference identified by `(owner_id, key)`.
    pub fn put_preference(&mut self, preference: Preference) -> Result<(), StoreError> {
        validate_label("preference key", &preference.key).map_err(|source| {
            StoreError::InvalidRecord {
                entity: "preference",
                source,
            }
        })?;
        let key = Store::preference_key(preference.owner_id, &preference.key);
        self.stage(key, &preference)
    }

    pub fn insert_notification(&mut self, mut notification: Notification) -> Result<Notification, StoreError> {
        notification.id = self.store.next_id()?;
        self.stage(Store::key(NOTIFICATIONS, notification.id), &notification)?;
        Ok(notification)
    }

    pub fn insert_push_notification(
        &mut self,
        mut push: PushNotification,
    ) -> Result<PushNotification, StoreError> {
        push.id = self.store.next_id()?;
        self.stage(Store::key(PUSH, push.id), &push)?;
        Ok(push)
    }

    /// Stage removal of a couple and every egg and pigeonneau that belongs to it.
    pub fn delete_couple_cascade(&mut self, couple_id: RecordId) -> Result<CascadeCounts, StoreError> {
        let mut counts = CascadeCounts::default();
        if !self.couple_exists(couple_id)? {
            return Ok(counts);
        }

        for egg in self.store.scan::<Egg>(EGGS)? {
            if egg.couple_id == couple_id && self.removed_eggs.insert(egg.id) {
                self.unstage(Store::key(EGGS, egg.id));
                counts.eggs += 1;
            }
        }
        for pigeonneau in self.store.scan::<Pigeonneau>(PIGEONNEAUX)? {
            if pigeonneau.couple_id == couple_id {
                self.unstage(Store::key(PIGEONNEAUX, pigeonneau.id));
                counts.pigeonneaux += 1;
            }
        }

        self.unstage(Store::key(COUPLES, couple_id));
        self.removed_couples.insert(couple_id);
        self.staged_couples.remove(&couple_id);
        counts.couples = 1;
        Ok(counts)
    }

    /// Cascade-delete every committed couple owned by `owner_id`.
    pub fn clear_owner_couples(&mut self, owner_id: RecordId) -> Result<CascadeCounts, StoreError> {
        let mut total = CascadeCounts::default();
        for couple in self.store.list_couples_by_owner(owner_id)? {
            let counts = self.delete_couple_cascade(couple.id)?;
            total.couples += counts.couples;
            total.eggs += counts.eggs;
            total.pigeonneaux += counts.pigeonneaux;
        }
        debug!(
            "staged removal of {} couples for owner #{}",
            total.couples, owner_id
        );
        Ok(total)
    }

    /// Move a live notification into the archive table.
    ///
    /// Both writes land in the same batch, so the row is never visible in both
    /// tables. The archive key is the original id.
    pub fn archive_notification(
        &mut self,
        notification: Notification,
        reason: &str,
        archived_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let original_id = notification.id;
        let archived = Archived {
            id: self.store.next_id()?,
            original_id,
            archived_at: archived_at.max(notification.created_at),
            archive_reason: reason.to_string(),
            record: notification,
        };
        self.stage(Store::key(ARCHIVED_NOTIFICATIONS, original_id), &archived)?;
        self.unstage(Store::key(NOTIFICATIONS, original_id));
        Ok(())
    }

    pub fn archive_push_notification(
        &mut self,
        push: PushNotification,
        reason: &str,
        archived_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let original_id = push.id;
        let archived = Archived {
            id: self.store.next_id()?,
            original_id,
            archived_at: archived_at.max(push.created_at),
            archive_reason: reason.to_string(),
            record: push,
        };
        self.stage(Store::key(ARCHIVED_PUSH, original_id), &archived)?;
        self.unstage(Store::key(PUSH, original_id));
        Ok(())
    }

    /// Put an archived notification back into the live table under its original id.
    ///
    /// Returns `false` without touching anything if a live row with that id
    /// already exists.
    pub fn unarchive_notification(&mut self, archived: ArchivedNotification) -> Result<bool, StoreError> {
        let original_id = archived.original_id;
        if self.store.contains(NOTIFICATIONS, original_id)? {
            return Ok(false);
        }
        let mut live = archived.record;
        live.id = original_id;
        self.stage(Store::key(NOTIFICATIONS, original_id), &live)?;
        self.unstage(Store::key(ARCHIVED_NOTIFICATIONS, original_id));
        Ok(true)
    }

    pub fn delete_reset_code(&mut self, id: RecordId) {
        self.unstage(Store::key(RESET_CODES, id));
    }
}
