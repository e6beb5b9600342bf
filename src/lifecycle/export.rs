//! Export engine: one owner's register as a self-contained [`Snapshot`].

use std::collections::HashSet;

use chrono::Utc;
use log::{debug, info};

use super::LifecycleError;
use crate::metrics;
use crate::model::{RecordId, Snapshot, SnapshotMetadata, User, SNAPSHOT_VERSION};
use crate::store::{Store, StoreError};

#[derive(Clone)]
pub struct ExportEngine {
    store: Store,
}

impl ExportEngine {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Collect everything reachable from `owner_id`.
    ///
    /// Couples are selected by owner, eggs and pigeonneaux by the resulting
    /// couple-id set, and the remaining collections by owner directly. Nothing
    /// is written. Any read failure aborts the whole export.
    pub fn export_snapshot(&self, owner_id: RecordId) -> Result<Snapshot, LifecycleError> {
        let owner = match self.store.get_user(owner_id) {
            Ok(Some(owner)) => owner,
            Ok(None) => return Err(LifecycleError::OwnerNotFound(owner_id)),
            Err(e) => {
                metrics::inc_export_failed();
                return Err(LifecycleError::ExportFailed(e));
            }
        };

        let snapshot = self.collect(owner).map_err(|e| {
            metrics::inc_export_failed();
            LifecycleError::ExportFailed(e)
        })?;

        metrics::inc_export();
        info!(
            "Exported owner #{} ({}): {} couples, {} eggs, {} pigeonneaux, {} health records, {} sales, {} notifications",
            owner_id,
            snapshot.metadata.owner_name,
            snapshot.statistics.couples,
            snapshot.statistics.eggs,
            snapshot.statistics.pigeonneaux,
            snapshot.statistics.health_records,
            snapshot.statistics.sales,
            snapshot.statistics.notifications,
        );
        Ok(snapshot)
    }

    fn collect(&self, owner: User) -> Result<Snapshot, StoreError> {
        let owner_id = owner.id;
        let couples = self.store.list_couples_by_owner(owner_id)?;
        let couple_ids: HashSet<RecordId> = couples.iter().map(|c| c.id).collect();
        debug!("owner #{} owns couples {:?}", owner_id, couple_ids);

        let eggs = self.store.list_eggs_for_couples(&couple_ids)?;
        let pigeonneaux = self.store.list_pigeonneaux_for_couples(&couple_ids)?;
        let health_records = self.store.list_health_records_by_owner(owner_id)?;
        let sales = self.store.list_sales_by_owner(owner_id)?;
        let notifications = self.store.list_notifications_by_owner(owner_id)?;
        let preferences = self.store.list_preferences_by_owner(owner_id)?;

        let mut snapshot = Snapshot {
            metadata: SnapshotMetadata {
                version: SNAPSHOT_VERSION.to_string(),
                exported_at: Utc::now(),
                owner_id,
                owner_name: owner.username.clone(),
            },
            owner,
            couples,
            eggs,
            pigeonneaux,
            health_records,
            sales,
            notifications,
            preferences,
            statistics: Default::default(),
        };
        snapshot.statistics = snapshot.count_collections();
        Ok(snapshot)
    }
}
