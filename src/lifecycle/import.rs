//! Import/restore engine.
//!
//! A snapshot is replayed into a destination owner inside a single store
//! transaction. New primary keys are allocated for every row and three remap
//! tables (couples, eggs, pigeonneaux) rewrite the foreign keys that pointed at
//! the snapshot's ids:
//!
//! 1. optionally clear the owner's couples (cascading to eggs and pigeonneaux)
//! 2. couples, recording `old -> new`
//! 3. eggs through the couple remap; eggs whose couple is absent are skipped
//! 4. pigeonneaux through the couple remap (required) and egg remap (optional)
//! 5. health records (targets remapped when resolvable) and sales
//! 6. preferences, then notifications unless skipped
//!
//! Restores for the same owner are serialised with [`OwnerLocks`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use log::{debug, info, warn};
use serde::Serialize;

use super::LifecycleError;
use crate::metrics;
use crate::model::{HealthTarget, RecordId, Snapshot};
use crate::store::{CascadeCounts, Store, StoreError, StoreTxn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreOptions {
    /// Delete the destination owner's couples (and their children) first.
    pub clear_existing: bool,
    /// Leave the snapshot's notifications out of the replay.
    pub skip_notifications: bool,
}

/// Which phase of a restore failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportStep {
    Validate,
    ClearExisting,
    Couples,
    Eggs,
    Pigeonneaux,
    HealthRecords,
    Sales,
    Preferences,
    Notifications,
    Commit,
}

impl fmt::Display for ImportStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ImportStep::Validate => "validate",
            ImportStep::ClearExisting => "clear existing",
            ImportStep::Couples => "couples",
            ImportStep::Eggs => "eggs",
            ImportStep::Pigeonneaux => "pigeonneaux",
            ImportStep::HealthRecords => "health records",
            ImportStep::Sales => "sales",
            ImportStep::Preferences => "preferences",
            ImportStep::Notifications => "notifications",
            ImportStep::Commit => "commit",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportCounts {
    pub couples: usize,
    pub eggs: usize,
    pub pigeonneaux: usize,
    pub health_records: usize,
    pub sales: usize,
    pub preferences: usize,
    pub notifications: usize,
}

impl ImportCounts {
    fn total(&self) -> usize {
        self.couples
            + self.eggs
            + self.pigeonneaux
            + self.health_records
            + self.sales
            + self.preferences
            + self.notifications
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportResult {
    /// Rows actually inserted, per collection.
    pub imported: ImportCounts,
    /// Rows left out: orphans, or notifications when skipped.
    pub skipped: ImportCounts,
    /// Rows removed by `clear_existing`.
    pub cleared_couples: usize,
    pub cleared_eggs: usize,
    pub cleared_pigeonneaux: usize,
    /// Health records whose target was not part of the snapshot.
    pub detached_health_targets: usize,
    /// Owner the snapshot was exported from.
    pub source_owner_id: RecordId,
    pub source_owner_name: String,
    /// True when the snapshot came from a different owner than the destination.
    pub cross_owner: bool,
}

/// Per-owner restore locks. Owners never contend with each other.
#[derive(Debug, Default)]
pub struct OwnerLocks {
    locks: Mutex<HashMap<RecordId, Arc<Mutex<()>>>>,
}

impl OwnerLocks {
    pub fn lock_for(&self, owner_id: RecordId) -> Arc<Mutex<()>> {
        let mut map = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        map.entry(owner_id).or_default().clone()
    }

    /// Hand back a lock obtained from [`lock_for`](Self::lock_for). The entry is
    /// dropped once no other restore holds or waits on it.
    pub fn release(&self, owner_id: RecordId, lock: Arc<Mutex<()>>) {
        let mut map = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        drop(lock);
        if map
            .get(&owner_id)
            .map_or(false, |entry| Arc::strong_count(entry) == 1)
        {
            map.remove(&owner_id);
        }
    }

    /// Owners with a restore in flight.
    pub fn tracked_owners(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

/// Store failure tagged with the restore phase it happened in.
struct StepError {
    step: ImportStep,
    source: StoreError,
}

impl From<StoreError> for StepError {
    fn from(source: StoreError) -> Self {
        StepError {
            step: ImportStep::Commit,
            source,
        }
    }
}

fn at(step: ImportStep) -> impl Fn(StoreError) -> StepError {
    move |source| StepError { step, source }
}

#[derive(Default)]
struct RemapTables {
    couples: HashMap<RecordId, RecordId>,
    eggs: HashMap<RecordId, RecordId>,
    pigeonneaux: HashMap<RecordId, RecordId>,
}

#[derive(Clone)]
pub struct ImportEngine {
    store: Store,
    locks: Arc<OwnerLocks>,
}

impl ImportEngine {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            locks: Arc::new(OwnerLocks::default()),
        }
    }

    /// Replay `snapshot` into `owner_id`.
    ///
    /// The destination need not be the snapshot's original owner; the result
    /// reports the source owner and flags cross-owner restores so the caller
    /// can warn about them.
    pub fn restore_snapshot(
        &self,
        owner_id: RecordId,
        snapshot: &Snapshot,
        options: RestoreOptions,
    ) -> Result<ImportResult, LifecycleError> {
        if !snapshot.has_supported_version() {
            return Err(LifecycleError::InvalidSnapshotFormat(format!(
                "unsupported snapshot version '{}'",
                snapshot.metadata.version
            )));
        }
        match self.store.get_user(owner_id) {
            Ok(Some(_)) => {}
            Ok(None) => return Err(LifecycleError::OwnerNotFound(owner_id)),
            Err(source) => {
                return Err(LifecycleError::ImportFailed {
                    step: ImportStep::Validate,
                    source,
                })
            }
        }

        let source_owner_id = snapshot.metadata.owner_id;
        let cross_owner = source_owner_id != owner_id;
        if cross_owner {
            warn!(
                target: "security",
                "Cross-owner restore: snapshot of owner #{} ({}) into owner #{}",
                source_owner_id, snapshot.metadata.owner_name, owner_id
            );
        }

        let lock = self.locks.lock_for(owner_id);
        let started = Instant::now();
        let outcome = {
            let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            self.store
                .transaction(|tx| replay(tx, owner_id, snapshot, options))
        };
        self.locks.release(owner_id, lock);

        match outcome {
            Ok(mut result) => {
                result.source_owner_id = source_owner_id;
                result.source_owner_name = snapshot.metadata.owner_name.clone();
                result.cross_owner = cross_owner;
                let orphans = (result.skipped.eggs + result.skipped.pigeonneaux) as u64;
                metrics::observe_restore(started, orphans);
                info!(
                    "Restored {} rows into owner #{} from snapshot of owner #{} ({} skipped, {} couples cleared)",
                    result.imported.total(),
                    owner_id,
                    source_owner_id,
                    result.skipped.total(),
                    result.cleared_couples
                );
                Ok(result)
            }
            Err(StepError { step, source }) => {
                metrics::inc_restore_failed();
                warn!(
                    "Restore into owner #{} rolled back during {}: {}",
                    owner_id, step, source
                );
                Err(LifecycleError::ImportFailed { step, source })
            }
        }
    }
}

fn replay(
    tx: &mut StoreTxn<'_>,
    owner_id: RecordId,
    snapshot: &Snapshot,
    options: RestoreOptions,
) -> Result<ImportResult, StepError> {
    let mut imported = ImportCounts::default();
    let mut skipped = ImportCounts::default();
    let mut remap = RemapTables::default();
    let mut detached_health_targets = 0usize;

    let cleared = if options.clear_existing {
        tx.clear_owner_couples(owner_id)
            .map_err(at(ImportStep::ClearExisting))?
    } else {
        CascadeCounts::default()
    };

    for couple in &snapshot.couples {
        let mut row = couple.clone();
        row.owner_id = owner_id;
        let inserted = tx.insert_couple(row).map_err(at(ImportStep::Couples))?;
        remap.couples.insert(couple.id, inserted.id);
        imported.couples += 1;
    }

    for egg in &snapshot.eggs {
        let Some(&couple_id) = remap.couples.get(&egg.couple_id) else {
            warn!(
                "Skipping egg #{}: couple #{} is not in the snapshot",
                egg.id, egg.couple_id
            );
            skipped.eggs += 1;
            continue;
        };
        let mut row = egg.clone();
        row.couple_id = couple_id;
        let inserted = tx.insert_egg(row).map_err(at(ImportStep::Eggs))?;
        remap.eggs.insert(egg.id, inserted.id);
        imported.eggs += 1;
    }

    for pigeonneau in &snapshot.pigeonneaux {
        let Some(&couple_id) = remap.couples.get(&pigeonneau.couple_id) else {
            warn!(
                "Skipping pigeonneau #{}: couple #{} is not in the snapshot",
                pigeonneau.id, pigeonneau.couple_id
            );
            skipped.pigeonneaux += 1;
            continue;
        };
        let mut row = pigeonneau.clone();
        row.couple_id = couple_id;
        row.egg_record_id = pigeonneau
            .egg_record_id
            .and_then(|old| remap.eggs.get(&old).copied());
        if pigeonneau.egg_record_id.is_some() && row.egg_record_id.is_none() {
            debug!(
                "Pigeonneau #{}: egg #{:?} not restored, dropping reference",
                pigeonneau.id, pigeonneau.egg_record_id
            );
        }
        let inserted = tx
            .insert_pigeonneau(row)
            .map_err(at(ImportStep::Pigeonneaux))?;
        remap.pigeonneaux.insert(pigeonneau.id, inserted.id);
        imported.pigeonneaux += 1;
    }

    for record in &snapshot.health_records {
        let mut row = record.clone();
        row.owner_id = owner_id;
        let table = match record.target_type {
            HealthTarget::Couple => &remap.couples,
            HealthTarget::Pigeonneau => &remap.pigeonneaux,
        };
        row.target_id = record.target_id.and_then(|old| table.get(&old).copied());
        if record.target_id.is_some() && row.target_id.is_none() {
            detached_health_targets += 1;
        }
        tx.insert_health_record(row)
            .map_err(at(ImportStep::HealthRecords))?;
        imported.health_records += 1;
    }

    for sale in &snapshot.sales {
        let mut row = sale.clone();
        row.owner_id = owner_id;
        tx.insert_sale(row).map_err(at(ImportStep::Sales))?;
        imported.sales += 1;
    }

    for preference in &snapshot.preferences {
        let mut row = preference.clone();
        row.owner_id = owner_id;
        tx.put_preference(row).map_err(at(ImportStep::Preferences))?;
        imported.preferences += 1;
    }

    if options.skip_notifications {
        skipped.notifications = snapshot.notifications.len();
    } else {
        for notification in &snapshot.notifications {
            let mut row = notification.clone();
            row.owner_id = owner_id;
            tx.insert_notification(row)
                .map_err(at(ImportStep::Notifications))?;
            imported.notifications += 1;
        }
    }

    debug!(
        "Restore staged {} writes for owner #{}",
        tx.staged_writes(),
        owner_id
    );

    Ok(ImportResult {
        imported,
        skipped,
        cleared_couples: cleared.couples,
        cleared_eggs: cleared.eggs,
        cleared_pigeonneaux: cleared.pigeonneaux,
        detached_health_targets,
        source_owner_id: 0,
        source_owner_name: String::new(),
        cross_owner: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_owner_shares_one_lock() {
        let locks = OwnerLocks::default();
        let a = locks.lock_for(7);
        let b = locks.lock_for(7);
        let c = locks.lock_for(8);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn released_locks_leave_the_map() {
        let locks = OwnerLocks::default();
        let first = locks.lock_for(3);
        let second = locks.lock_for(3);
        locks.release(3, first);
        assert_eq!(locks.tracked_owners(), 1);
        locks.release(3, second);
        assert_eq!(locks.tracked_owners(), 0);

        let other = locks.lock_for(4);
        locks.release(4, other);
        assert_eq!(locks.tracked_owners(), 0);
    }

    #[test]
    fn step_labels() {
        assert_eq!(ImportStep::ClearExisting.to_string(), "clear existing");
        assert_eq!(ImportStep::HealthRecords.to_string(), "health records");
    }
}
