//! Register entities as seen by the lifecycle core.
//!
//! Rows are persisted by [`crate::store::Store`] (bincode values in sled) and
//! exported inside a [`Snapshot`] as camelCase JSON. None of these types use
//! `skip_serializing_if`, since the bincode row encoding is positional.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Primary key type shared by every table.
pub type RecordId = u64;

/// Schema version written into new snapshots.
pub const SNAPSHOT_VERSION: &str = "1.0";

/// Snapshot versions the import engine knows how to replay.
pub const SUPPORTED_SNAPSHOT_VERSIONS: &[&str] = &["1.0"];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Admin,
}

/// Owner of a register. Only ever read by the lifecycle core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: RecordId,
    pub username: String,
    pub email: Option<String>,
    pub role: Role,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(username: &str, role: Role) -> Self {
        Self {
            id: 0,
            username: username.to_string(),
            email: None,
            role,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CoupleStatus {
    Active,
    Reproduction,
    Inactive,
}

/// Breeding pair, root of the per-owner graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Couple {
    pub id: RecordId,
    pub owner_id: RecordId,
    pub nest_number: String,
    pub breed: Option<String>,
    pub formation_date: Option<NaiveDate>,
    pub male_ring: Option<String>,
    pub female_ring: Option<String>,
    pub status: CoupleStatus,
    pub notes: Option<String>,
}

impl Couple {
    pub fn new(owner_id: RecordId, nest_number: &str) -> Self {
        Self {
            id: 0,
            owner_id,
            nest_number: nest_number.to_string(),
            breed: None,
            formation_date: None,
            male_ring: None,
            female_ring: None,
            status: CoupleStatus::Active,
            notes: None,
        }
    }
}

/// Clutch record: up to two eggs laid by one couple.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Egg {
    pub id: RecordId,
    pub couple_id: RecordId,
    pub egg1_laid_date: NaiveDate,
    pub egg2_laid_date: Option<NaiveDate>,
    pub hatch_date1: Option<NaiveDate>,
    pub hatch_date2: Option<NaiveDate>,
    pub success1: bool,
    pub success2: bool,
    pub notes: Option<String>,
}

impl Egg {
    pub fn new(couple_id: RecordId, egg1_laid_date: NaiveDate) -> Self {
        Self {
            id: 0,
            couple_id,
            egg1_laid_date,
            egg2_laid_date: None,
            hatch_date1: None,
            hatch_date2: None,
            success1: false,
            success2: false,
            notes: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PigeonneauStatus {
    Alive,
    Sold,
    Dead,
}

/// Squab raised by a couple, optionally linked to the clutch it hatched from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Pigeonneau {
    pub id: RecordId,
    pub couple_id: RecordId,
    pub egg_record_id: Option<RecordId>,
    pub birth_date: NaiveDate,
    pub weaning_date: Option<NaiveDate>,
    pub sale_date: Option<NaiveDate>,
    pub sale_price: Option<f64>,
    pub status: PigeonneauStatus,
    pub notes: Option<String>,
}

impl Pigeonneau {
    pub fn new(couple_id: RecordId, birth_date: NaiveDate) -> Self {
        Self {
            id: 0,
            couple_id,
            egg_record_id: None,
            birth_date,
            weaning_date: None,
            sale_date: None,
            sale_price: None,
            status: PigeonneauStatus::Alive,
            notes: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HealthTarget {
    Couple,
    Pigeonneau,
}

/// Treatment or vaccination applied to a couple or a squab.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealthRecord {
    pub id: RecordId,
    pub owner_id: RecordId,
    pub target_type: HealthTarget,
    pub target_id: Option<RecordId>,
    pub product: String,
    pub treatment_date: NaiveDate,
    pub next_due_date: Option<NaiveDate>,
    pub notes: Option<String>,
}

impl HealthRecord {
    pub fn new(
        owner_id: RecordId,
        target_type: HealthTarget,
        target_id: RecordId,
        product: &str,
        treatment_date: NaiveDate,
    ) -> Self {
        Self {
            id: 0,
            owner_id,
            target_type,
            target_id: Some(target_id),
            product: product.to_string(),
            treatment_date,
            next_due_date: None,
            notes: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Sale {
    pub id: RecordId,
    pub owner_id: RecordId,
    pub date: NaiveDate,
    pub quantity: u32,
    pub unit_price: f64,
    pub amount: f64,
    pub buyer: Option<String>,
}

impl Sale {
    pub fn new(owner_id: RecordId, date: NaiveDate, quantity: u32, unit_price: f64) -> Self {
        Self {
            id: 0,
            owner_id,
            date,
            quantity,
            unit_price,
            amount: unit_price * f64::from(quantity),
            buyer: None,
        }
    }
}

/// Per-owner key/value setting. Unique on `(owner_id, key)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Preference {
    pub owner_id: RecordId,
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: RecordId,
    pub owner_id: RecordId,
    pub kind: String,
    pub title: String,
    pub message: String,
    pub read: bool,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
}

impl Notification {
    pub fn new(owner_id: RecordId, title: &str, message: &str, created_at: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            owner_id,
            kind: "info".to_string(),
            title: title.to_string(),
            message: message.to_string(),
            read: false,
            created_at,
            read_at: None,
        }
    }

    pub fn mark_read(&mut self, at: DateTime<Utc>) {
        self.read = true;
        self.read_at = Some(at);
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PushStatus {
    Pending,
    Sent,
    Read,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PushNotification {
    pub id: RecordId,
    pub owner_id: RecordId,
    pub title: String,
    pub body: String,
    pub status: PushStatus,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
}

impl PushNotification {
    pub fn new(owner_id: RecordId, title: &str, body: &str, created_at: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            owner_id,
            title: title.to_string(),
            body: body.to_string(),
            status: PushStatus::Pending,
            created_at,
            sent_at: None,
            read_at: None,
        }
    }
}

/// Archive-table row: the live record verbatim plus archival bookkeeping.
///
/// Archive rows are keyed by `original_id`, so a live row can have at most one
/// archived copy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Archived<T> {
    pub id: RecordId,
    pub original_id: RecordId,
    pub archived_at: DateTime<Utc>,
    pub archive_reason: String,
    pub record: T,
}

pub type ArchivedNotification = Archived<Notification>;
pub type ArchivedPushNotification = Archived<PushNotification>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuditLog {
    pub id: RecordId,
    pub owner_id: Option<RecordId>,
    pub action: String,
    pub details: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AuditLog {
    pub fn new(owner_id: Option<RecordId>, action: &str, created_at: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            owner_id,
            action: action.to_string(),
            details: None,
            created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PasswordResetCode {
    pub id: RecordId,
    pub user_id: RecordId,
    pub code: String,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveType {
    Full,
    Notifications,
    PushNotifications,
    AuditLogs,
    ResetCodes,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveStatus {
    Success,
    Failed,
}

/// One row per archival run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveExecutionLog {
    pub id: RecordId,
    pub archive_type: ArchiveType,
    pub archived_count: u64,
    pub deleted_count: u64,
    pub duration_ms: u64,
    pub status: ArchiveStatus,
    pub error_message: Option<String>,
    pub executed_at: DateTime<Utc>,
    pub executed_by: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    pub version: String,
    pub exported_at: DateTime<Utc>,
    pub owner_id: RecordId,
    pub owner_name: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotStatistics {
    pub couples: usize,
    pub eggs: usize,
    pub pigeonneaux: usize,
    pub health_records: usize,
    pub sales: usize,
    pub notifications: usize,
    pub preferences: usize,
}

/// Self-contained export of one owner's register.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub metadata: SnapshotMetadata,
    pub owner: User,
    #[serde(default)]
    pub couples: Vec<Couple>,
    #[serde(default)]
    pub eggs: Vec<Egg>,
    #[serde(default)]
    pub pigeonneaux: Vec<Pigeonneau>,
    #[serde(default)]
    pub health_records: Vec<HealthRecord>,
    #[serde(default)]
    pub sales: Vec<Sale>,
    #[serde(default)]
    pub notifications: Vec<Notification>,
    #[serde(default)]
    pub preferences: Vec<Preference>,
    #[serde(default)]
    pub statistics: SnapshotStatistics,
}

impl Snapshot {
    /// Counts derived from the collections actually present.
    pub fn count_collections(&self) -> SnapshotStatistics {
        SnapshotStatistics {
            couples: self.couples.len(),
            eggs: self.eggs.len(),
            pigeonneaux: self.pigeonneaux.len(),
            health_records: self.health_records.len(),
            sales: self.sales.len(),
            notifications: self.notifications.len(),
            preferences: self.preferences.len(),
        }
    }

    pub fn has_supported_version(&self) -> bool {
        SUPPORTED_SNAPSHOT_VERSIONS.contains(&self.metadata.version.as_str())
    }
}
