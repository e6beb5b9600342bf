//! Archive engine: ages notifications out of the live tables and purges stale
//! audit logs and password reset codes.
//!
//! Thresholds (defaults in days):
//! * notifications: read and created more than 30 days ago are archived
//! * push notifications: status `read` and read more than 60 days ago are archived
//! * audit logs: older than 365 days are deleted
//! * reset codes: expired or used are deleted
//!
//! Each collection is moved in one atomic batch, so a row is never live and
//! archived at the same time. Every run leaves one [`ArchiveExecutionLog`] row.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Instant;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;

use super::{days_before, LifecycleError};
use crate::config::ArchiveConfig;
use crate::metrics;
use crate::model::{
    ArchiveExecutionLog, ArchiveStatus, ArchiveType, ArchivedNotification, PushStatus, RecordId,
};
use crate::store::{Store, StoreError};

/// Phase of an archive run, reported on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveStep {
    Notifications,
    PushNotifications,
    AuditLogs,
    ResetCodes,
    Restore,
    Reporting,
}

impl fmt::Display for ArchiveStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ArchiveStep::Notifications => "notifications",
            ArchiveStep::PushNotifications => "push notifications",
            ArchiveStep::AuditLogs => "audit logs",
            ArchiveStep::ResetCodes => "reset codes",
            ArchiveStep::Restore => "restore",
            ArchiveStep::Reporting => "reporting",
        };
        f.write_str(label)
    }
}

impl ArchiveStep {
    fn archive_type(self) -> ArchiveType {
        match self {
            ArchiveStep::PushNotifications => ArchiveType::PushNotifications,
            ArchiveStep::AuditLogs => ArchiveType::AuditLogs,
            ArchiveStep::ResetCodes => ArchiveType::ResetCodes,
            _ => ArchiveType::Notifications,
        }
    }
}

/// Rows moved to an archive table and rows deleted outright.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ArchiveOutcome {
    pub archived: u64,
    pub deleted: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FullArchiveReport {
    pub notifications_archived: u64,
    pub push_notifications_archived: u64,
    pub audit_logs_deleted: u64,
    pub reset_codes_deleted: u64,
    pub duration_ms: u64,
}

impl FullArchiveReport {
    pub fn total_archived(&self) -> u64 {
        self.notifications_archived + self.push_notifications_archived
    }

    pub fn total_deleted(&self) -> u64 {
        self.audit_logs_deleted + self.reset_codes_deleted
    }
}

/// Live and archived row counts plus the most recent run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveStats {
    pub active_notifications: u64,
    pub archived_notifications: u64,
    pub active_push_notifications: u64,
    pub archived_push_notifications: u64,
    pub audit_logs: u64,
    pub reset_codes: u64,
    pub last_run: Option<ArchiveExecutionLog>,
}

#[derive(Clone)]
pub struct ArchiveEngine {
    store: Store,
    policy: ArchiveConfig,
}

impl ArchiveEngine {
    pub fn new(store: Store, policy: ArchiveConfig) -> Self {
        Self { store, policy }
    }

    pub fn archive_old_notifications(&self) -> Result<ArchiveOutcome, LifecycleError> {
        self.run_single(ArchiveStep::Notifications)
    }

    pub fn archive_old_push_notifications(&self) -> Result<ArchiveOutcome, LifecycleError> {
        self.run_single(ArchiveStep::PushNotifications)
    }

    pub fn clean_old_audit_logs(&self) -> Result<ArchiveOutcome, LifecycleError> {
        self.run_single(ArchiveStep::AuditLogs)
    }

    pub fn clean_expired_reset_codes(&self) -> Result<ArchiveOutcome, LifecycleError> {
        self.run_single(ArchiveStep::ResetCodes)
    }

    /// Run every step in order, stopping at the first failure.
    ///
    /// Exactly one execution-log row is written either way. A failed run records
    /// the counts of the steps that did complete and names the failing step.
    pub fn run_full_archive(
        &self,
        executed_by: Option<&str>,
    ) -> Result<FullArchiveReport, LifecycleError> {
        let started = Instant::now();
        let now = Utc::now();
        let mut report = FullArchiveReport::default();
        let mut failure: Option<(ArchiveStep, StoreError)> = None;

        for step in [
            ArchiveStep::Notifications,
            ArchiveStep::PushNotifications,
            ArchiveStep::AuditLogs,
            ArchiveStep::ResetCodes,
        ] {
            match self.execute(step, now) {
                Ok(outcome) => match step {
                    ArchiveStep::Notifications => report.notifications_archived = outcome.archived,
                    ArchiveStep::PushNotifications => {
                        report.push_notifications_archived = outcome.archived
                    }
                    ArchiveStep::AuditLogs => report.audit_logs_deleted = outcome.deleted,
                    _ => report.reset_codes_deleted = outcome.deleted,
                },
                Err(e) => {
                    failure = Some((step, e));
                    break;
                }
            }
        }
        report.duration_ms = started.elapsed().as_millis() as u64;

        let (status, error_message) = match &failure {
            Some((step, e)) => (ArchiveStatus::Failed, Some(format!("{}: {}", step, e))),
            None => (ArchiveStatus::Success, None),
        };
        let logged = self.record_run(ArchiveExecutionLog {
            id: 0,
            archive_type: ArchiveType::Full,
            archived_count: report.total_archived(),
            deleted_count: report.total_deleted(),
            duration_ms: report.duration_ms,
            status,
            error_message,
            executed_at: now,
            executed_by: executed_by.map(str::to_string),
        });

        if let Some((step, source)) = failure {
            if let Err(e) = logged {
                warn!("Could not record failed archive run: {}", e);
            }
            error!("Full archive run failed during {}: {}", step, source);
            return Err(LifecycleError::ArchiveRunFailed { step, source });
        }
        logged.map_err(|source| LifecycleError::ArchiveRunFailed {
            step: ArchiveStep::Reporting,
            source,
        })?;

        info!(
            "Full archive run: {} notifications, {} push notifications archived; {} audit logs, {} reset codes deleted ({} ms)",
            report.notifications_archived,
            report.push_notifications_archived,
            report.audit_logs_deleted,
            report.reset_codes_deleted,
            report.duration_ms
        );
        Ok(report)
    }

    /// Move archived notifications back to the live table under their original ids.
    ///
    /// Unknown ids and ids whose live row already exists are skipped; repeated
    /// ids count once. Returns how many rows were restored.
    pub fn restore_archived_notifications(&self, ids: &[RecordId]) -> Result<u64, LifecycleError> {
        let unique: BTreeSet<RecordId> = ids.iter().copied().collect();
        let to_restore_err = |source| LifecycleError::ArchiveRunFailed {
            step: ArchiveStep::Restore,
            source,
        };

        let mut candidates = Vec::with_capacity(unique.len());
        for id in unique {
            match self.store.get_archived_notification(id).map_err(to_restore_err)? {
                Some(archived) => candidates.push(archived),
                None => debug!("Archived notification #{} not found, skipping", id),
            }
        }

        let restored = self
            .store
            .transaction(|tx| {
                let mut restored = 0u64;
                for archived in candidates {
                    let id = archived.original_id;
                    if tx.unarchive_notification(archived)? {
                        restored += 1;
                    } else {
                        warn!("Notification #{} is already live, leaving archive copy", id);
                    }
                }
                Ok::<u64, StoreError>(restored)
            })
            .map_err(to_restore_err)?;

        info!("Restored {} archived notifications", restored);
        Ok(restored)
    }

    pub fn get_archive_stats(&self) -> Result<ArchiveStats, LifecycleError> {
        self.stats().map_err(|source| LifecycleError::ArchiveRunFailed {
            step: ArchiveStep::Reporting,
            source,
        })
    }

    /// Most recent execution-log rows first.
    pub fn list_execution_logs(&self, limit: usize) -> Result<Vec<ArchiveExecutionLog>, LifecycleError> {
        let mut logs = self
            .store
            .list_archive_logs()
            .map_err(|source| LifecycleError::ArchiveRunFailed {
                step: ArchiveStep::Reporting,
                source,
            })?;
        logs.truncate(limit);
        Ok(logs)
    }

    /// Archived notifications, most recently archived first.
    pub fn list_archived_notifications(
        &self,
        owner_id: Option<RecordId>,
        limit: usize,
    ) -> Result<Vec<ArchivedNotification>, LifecycleError> {
        let mut rows: Vec<ArchivedNotification> = self
            .store
            .list_archived_notifications()
            .map_err(|source| LifecycleError::ArchiveRunFailed {
                step: ArchiveStep::Reporting,
                source,
            })?
            .into_iter()
            .filter(|a| owner_id.map_or(true, |owner| a.record.owner_id == owner))
            .collect();
        rows.sort_by(|a, b| {
            b.archived_at
                .cmp(&a.archived_at)
                .then_with(|| b.original_id.cmp(&a.original_id))
        });
        rows.truncate(limit);
        Ok(rows)
    }

    fn stats(&self) -> Result<ArchiveStats, StoreError> {
        Ok(ArchiveStats {
            active_notifications: self.store.count_notifications()?,
            archived_notifications: self.store.count_archived_notifications()?,
            active_push_notifications: self.store.count_push_notifications()?,
            archived_push_notifications: self.store.count_archived_push_notifications()?,
            audit_logs: self.store.count_audit_logs()?,
            reset_codes: self.store.count_reset_codes()?,
            last_run: self.store.list_archive_logs()?.into_iter().next(),
        })
    }

    /// One step invoked on its own, with its own execution-log row.
    fn run_single(&self, step: ArchiveStep) -> Result<ArchiveOutcome, LifecycleError> {
        let started = Instant::now();
        let now = Utc::now();
        let result = self.execute(step, now);
        let duration_ms = started.elapsed().as_millis() as u64;

        let (outcome, status, error_message) = match &result {
            Ok(outcome) => (*outcome, ArchiveStatus::Success, None),
            Err(e) => (
                ArchiveOutcome::default(),
                ArchiveStatus::Failed,
                Some(e.to_string()),
            ),
        };
        let logged = self.record_run(ArchiveExecutionLog {
            id: 0,
            archive_type: step.archive_type(),
            archived_count: outcome.archived,
            deleted_count: outcome.deleted,
            duration_ms,
            status,
            error_message,
            executed_at: now,
            executed_by: None,
        });

        match result {
            Ok(outcome) => {
                logged.map_err(|source| LifecycleError::ArchiveRunFailed {
                    step: ArchiveStep::Reporting,
                    source,
                })?;
                info!(
                    "Archive {}: {} archived, {} deleted",
                    step, outcome.archived, outcome.deleted
                );
                Ok(outcome)
            }
            Err(source) => {
                if let Err(e) = logged {
                    warn!("Could not record failed archive step: {}", e);
                }
                Err(LifecycleError::ArchiveRunFailed { step, source })
            }
        }
    }

    fn record_run(&self, entry: ArchiveExecutionLog) -> Result<ArchiveExecutionLog, StoreError> {
        metrics::observe_archive_run(
            entry.status == ArchiveStatus::Failed,
            entry.archived_count,
        );
        self.store.insert_archive_log(entry)
    }

    fn execute(&self, step: ArchiveStep, now: DateTime<Utc>) -> Result<ArchiveOutcome, StoreError> {
        match step {
            ArchiveStep::Notifications => Ok(ArchiveOutcome {
                archived: self.archive_notifications(now)?,
                deleted: 0,
            }),
            ArchiveStep::PushNotifications => Ok(ArchiveOutcome {
                archived: self.archive_push_notifications(now)?,
                deleted: 0,
            }),
            ArchiveStep::AuditLogs => Ok(ArchiveOutcome {
                archived: 0,
                deleted: self.delete_audit_logs(now)?,
            }),
            ArchiveStep::ResetCodes => Ok(ArchiveOutcome {
                archived: 0,
                deleted: self.delete_reset_codes(now)?,
            }),
            ArchiveStep::Restore | ArchiveStep::Reporting => Ok(ArchiveOutcome::default()),
        }
    }

    fn archive_notifications(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let days = self.policy.notification_days;
        let Some(cutoff) = days_before(now, days) else {
            return Ok(0);
        };
        let reason = format!("auto_archive_{}_days", days);

        let aged: Vec<_> = self
            .store
            .list_notifications()?
            .into_iter()
            .filter(|n| n.read && n.created_at < cutoff)
            .collect();
        debug!("{} notifications older than {}", aged.len(), cutoff);

        self.store.transaction(|tx| {
            let mut moved = 0u64;
            for notification in aged {
                tx.archive_notification(notification, &reason, now)?;
                moved += 1;
            }
            Ok::<u64, StoreError>(moved)
        })
    }

    fn archive_push_notifications(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let days = self.policy.push_notification_days;
        let Some(cutoff) = days_before(now, days) else {
            return Ok(0);
        };
        let reason = format!("auto_archive_{}_days", days);

        let aged: Vec<_> = self
            .store
            .list_push_notifications()?
            .into_iter()
            .filter(|p| {
                p.status == PushStatus::Read && p.read_at.unwrap_or(p.created_at) < cutoff
            })
            .collect();
        debug!("{} push notifications read before {}", aged.len(), cutoff);

        self.store.transaction(|tx| {
            let mut moved = 0u64;
            for push in aged {
                tx.archive_push_notification(push, &reason, now)?;
                moved += 1;
            }
            Ok::<u64, StoreError>(moved)
        })
    }

    fn delete_audit_logs(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let Some(cutoff) = days_before(now, self.policy.audit_log_days) else {
            return Ok(0);
        };
        let stale: Vec<RecordId> = self
            .store
            .list_audit_logs()?
            .into_iter()
            .filter(|entry| entry.created_at < cutoff)
            .map(|entry| entry.id)
            .collect();
        self.store.delete_audit_logs(&stale)
    }

    fn delete_reset_codes(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let stale: Vec<RecordId> = self
            .store
            .list_reset_codes()?
            .into_iter()
            .filter(|code| code.used || code.expires_at < now)
            .map(|code| code.id)
            .collect();

        self.store.transaction(|tx| {
            for id in &stale {
                tx.delete_reset_code(*id);
            }
            Ok::<u64, StoreError>(stale.len() as u64)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Notification, Role, User};
    use crate::store::PUSH;
    use chrono::Duration;
    use tempfile::TempDir;

    /// Store with one archivable notification and an undecodable push row.
    fn store_with_broken_push() -> (TempDir, Store) {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(tmp.path()).unwrap();
        let owner = store.put_user(User::new("breeder", Role::User)).unwrap();
        let created = Utc::now() - Duration::days(40);
        let mut row = Notification::new(owner.id, "Ponte", "Nouvelle ponte", created);
        row.mark_read(created + Duration::hours(1));
        store.insert_notification(row).unwrap();
        store
            .primary()
            .insert(Store::key(PUSH, 999_999), vec![0xff])
            .unwrap();
        (tmp, store)
    }

    #[test]
    fn failed_full_run_logs_partial_counts_once() {
        let (_tmp, store) = store_with_broken_push();
        let engine = ArchiveEngine::new(store.clone(), ArchiveConfig::default());

        let err = engine.run_full_archive(Some("cron")).unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::ArchiveRunFailed {
                step: ArchiveStep::PushNotifications,
                ..
            }
        ));
        assert_eq!(err.code(), "ARCHIVE_RUN_FAILED");
        // the notifications step committed before the failure
        assert_eq!(store.count_archived_notifications().unwrap(), 1);
        assert_eq!(store.count_notifications().unwrap(), 0);

        let logs = engine.list_execution_logs(10).unwrap();
        assert_eq!(logs.len(), 1);
        let run = &logs[0];
        assert_eq!(run.archive_type, ArchiveType::Full);
        assert_eq!(run.status, ArchiveStatus::Failed);
        assert_eq!(run.archived_count, 1);
        assert_eq!(run.deleted_count, 0);
        assert_eq!(run.executed_by.as_deref(), Some("cron"));
        let message = run.error_message.as_deref().unwrap();
        assert!(message.starts_with("push notifications: "), "{}", message);
    }

    #[test]
    fn failed_single_step_logs_its_own_row() {
        let (_tmp, store) = store_with_broken_push();
        let engine = ArchiveEngine::new(store, ArchiveConfig::default());

        let err = engine.archive_old_push_notifications().unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::ArchiveRunFailed {
                step: ArchiveStep::PushNotifications,
                ..
            }
        ));
        let logs = engine.list_execution_logs(10).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].archive_type, ArchiveType::PushNotifications);
        assert_eq!(logs[0].status, ArchiveStatus::Failed);
        assert_eq!(logs[0].archived_count, 0);
        assert!(logs[0].error_message.is_some());
    }

    #[test]
    fn thresholds_past_the_calendar_archive_nothing() {
        let (_tmp, store) = store_with_broken_push();
        let engine = ArchiveEngine::new(
            store.clone(),
            ArchiveConfig {
                notification_days: 1_000_000_000_000,
                push_notification_days: 1_000_000_000_000,
                audit_log_days: 1_000_000_000_000,
            },
        );
        assert_eq!(engine.archive_old_notifications().unwrap().archived, 0);
        assert_eq!(engine.clean_old_audit_logs().unwrap().deleted, 0);
        assert_eq!(store.count_notifications().unwrap(), 1);
    }

    #[test]
    fn step_labels_and_types() {
        assert_eq!(ArchiveStep::PushNotifications.to_string(), "push notifications");
        assert_eq!(ArchiveStep::AuditLogs.archive_type(), ArchiveType::AuditLogs);
        assert_eq!(ArchiveStep::ResetCodes.archive_type(), ArchiveType::ResetCodes);
    }

    #[test]
    fn report_totals() {
        let report = FullArchiveReport {
            notifications_archived: 2,
            push_notifications_archived: 3,
            audit_logs_deleted: 4,
            reset_codes_deleted: 1,
            duration_ms: 0,
        };
        assert_eq!(report.total_archived(), 5);
        assert_eq!(report.total_deleted(), 5);
    }
}
