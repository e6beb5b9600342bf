//! Process-wide lifecycle counters.
//! Cheap relaxed atomics; read through [`snapshot`] by the CLI `stats` output and tests.
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

static EXPORTS: AtomicU64 = AtomicU64::new(0);
static EXPORT_FAILURES: AtomicU64 = AtomicU64::new(0);
static RESTORES: AtomicU64 = AtomicU64::new(0);
static RESTORE_FAILURES: AtomicU64 = AtomicU64::new(0);
static ORPHANS_SKIPPED: AtomicU64 = AtomicU64::new(0);
static BACKUPS_WRITTEN: AtomicU64 = AtomicU64::new(0);
static BACKUPS_PRUNED: AtomicU64 = AtomicU64::new(0);
static ARCHIVE_RUNS: AtomicU64 = AtomicU64::new(0);
static ARCHIVE_FAILURES: AtomicU64 = AtomicU64::new(0);
static ROWS_ARCHIVED: AtomicU64 = AtomicU64::new(0);
static RESTORE_LATENCY_SUM_MS: AtomicU64 = AtomicU64::new(0);

pub fn inc_export() {
    EXPORTS.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_export_failed() {
    EXPORT_FAILURES.fetch_add(1, Ordering::Relaxed);
}

pub fn observe_restore(started: Instant, orphans_skipped: u64) {
    let ms = started.elapsed().as_millis() as u64;
    RESTORES.fetch_add(1, Ordering::Relaxed);
    RESTORE_LATENCY_SUM_MS.fetch_add(ms, Ordering::Relaxed);
    ORPHANS_SKIPPED.fetch_add(orphans_skipped, Ordering::Relaxed);
}

pub fn inc_restore_failed() {
    RESTORE_FAILURES.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_backup_written() {
    BACKUPS_WRITTEN.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_backup_pruned() {
    BACKUPS_PRUNED.fetch_add(1, Ordering::Relaxed);
}

pub fn observe_archive_run(failed: bool, archived: u64) {
    ARCHIVE_RUNS.fetch_add(1, Ordering::Relaxed);
    if failed {
        ARCHIVE_FAILURES.fetch_add(1, Ordering::Relaxed);
    }
    ROWS_ARCHIVED.fetch_add(archived, Ordering::Relaxed);
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct Snapshot {
    pub exports: u64,
    pub export_failures: u64,
    pub restores: u64,
    pub restore_failures: u64,
    pub restore_latency_avg_ms: Option<u64>,
    pub orphans_skipped: u64,
    pub backups_written: u64,
    pub backups_pruned: u64,
    pub archive_runs: u64,
    pub archive_failures: u64,
    pub rows_archived: u64,
}

pub fn snapshot() -> Snapshot {
    let restores = RESTORES.load(Ordering::Relaxed);
    let latency_sum = RESTORE_LATENCY_SUM_MS.load(Ordering::Relaxed);
    Snapshot {
        exports: EXPORTS.load(Ordering::Relaxed),
        export_failures: EXPORT_FAILURES.load(Ordering::Relaxed),
        restores,
        restore_failures: RESTORE_FAILURES.load(Ordering::Relaxed),
        restore_latency_avg_ms: if restores > 0 {
            Some(latency_sum / restores)
        } else {
            None
        },
        orphans_skipped: ORPHANS_SKIPPED.load(Ordering::Relaxed),
        backups_written: BACKUPS_WRITTEN.load(Ordering::Relaxed),
        backups_pruned: BACKUPS_PRUNED.load(Ordering::Relaxed),
        archive_runs: ARCHIVE_RUNS.load(Ordering::Relaxed),
        archive_failures: ARCHIVE_FAILURES.load(Ordering::Relaxed),
        rows_archived: ROWS_ARCHIVED.load(Ordering::Relaxed),
    }
}
