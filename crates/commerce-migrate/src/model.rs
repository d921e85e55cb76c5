//! Domain types shared by the collector, staging store and migrator.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{FailureClass, MigrateError, Result};

/// Identifier of a record on the source platform.
pub type SourceId = i64;

/// Identifier of an entity on the destination platform.
pub type DestinationId = i64;

/// Raw record as returned by the source API.
pub type RawRecord = Value;

/// Category of source record, each with its own staging table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Customer,
    Order,
    Subscription,
}

impl EntityKind {
    /// All kinds, in migration dependency order.
    pub const ALL: [EntityKind; 3] = [
        EntityKind::Customer,
        EntityKind::Order,
        EntityKind::Subscription,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Customer => "customer",
            EntityKind::Order => "order",
            EntityKind::Subscription => "subscription",
        }
    }

    /// Staging table holding records of this kind.
    pub fn table_name(&self) -> &'static str {
        match self {
            EntityKind::Customer => "staged_customers",
            EntityKind::Order => "staged_orders",
            EntityKind::Subscription => "staged_subscriptions",
        }
    }

    /// Path segment used by the source platform's list endpoints.
    pub fn plural(&self) -> &'static str {
        match self {
            EntityKind::Customer => "customers",
            EntityKind::Order => "orders",
            EntityKind::Subscription => "subscriptions",
        }
    }

    /// Orders and subscriptions are owned by a customer.
    pub fn is_dependent(&self) -> bool {
        !matches!(self, EntityKind::Customer)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "customer" | "customers" => Ok(EntityKind::Customer),
            "order" | "orders" => Ok(EntityKind::Order),
            "subscription" | "subscriptions" => Ok(EntityKind::Subscription),
            other => Err(MigrateError::Config(format!(
                "Unknown entity kind '{}' (expected customer, order or subscription)",
                other
            ))),
        }
    }
}

/// A raw source record persisted locally prior to migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedRecord {
    pub kind: EntityKind,
    pub source_id: SourceId,
    /// Owning customer for orders and subscriptions.
    pub parent_id: Option<SourceId>,
    pub payload: Value,
    pub fetched_at: DateTime<Utc>,
    pub migrated: bool,
    pub migrated_at: Option<DateTime<Utc>>,
}

impl StagedRecord {
    /// Build a fresh, unmigrated record from a raw source payload.
    ///
    /// Fails when the payload has no integer `id`.
    pub fn from_raw(kind: EntityKind, payload: RawRecord, fetched_at: DateTime<Utc>) -> Result<Self> {
        let source_id = extract_id(&payload, "id").ok_or_else(|| {
            MigrateError::invalid_payload(kind, "record has no integer 'id' field")
        })?;
        let parent_id = if kind.is_dependent() {
            extract_parent_id(&payload)
        } else {
            None
        };

        Ok(Self {
            kind,
            source_id,
            parent_id,
            payload,
            fetched_at,
            migrated: false,
            migrated_at: None,
        })
    }
}

/// Read an integer id that may be encoded as a JSON number or numeric string.
pub fn extract_id(value: &Value, field: &str) -> Option<i64> {
    match value.get(field)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Owning customer id of an order or subscription payload.
///
/// Sources disagree on the shape: `customer_id: 7`, `customer: 7` and
/// `customer: {"id": 7}` are all seen in the wild.
pub fn extract_parent_id(payload: &Value) -> Option<SourceId> {
    if let Some(id) = extract_id(payload, "customer_id") {
        return Some(id);
    }
    match payload.get("customer")? {
        Value::Object(_) => extract_id(payload.get("customer")?, "id"),
        _ => extract_id(payload, "customer"),
    }
}

/// Durable per-kind collection checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionProgress {
    pub entity_kind: EntityKind,
    /// Last page fully staged; 0 when nothing has been committed yet.
    pub last_completed_page: i64,
    pub total_collected: i64,
    pub updated_at: DateTime<Utc>,
}

impl CollectionProgress {
    pub fn new(entity_kind: EntityKind) -> Self {
        Self {
            entity_kind,
            last_completed_page: 0,
            total_collected: 0,
            updated_at: Utc::now(),
        }
    }

    /// Page the next forward collection run starts from.
    pub fn next_page(&self) -> i64 {
        self.last_completed_page + 1
    }
}

/// One-time mapping from a source record to its destination entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityLink {
    pub entity_kind: EntityKind,
    pub source_id: SourceId,
    pub destination_id: DestinationId,
    pub created_at: DateTime<Utc>,
}

impl IdentityLink {
    pub fn new(entity_kind: EntityKind, source_id: SourceId, destination_id: DestinationId) -> Self {
        Self {
            entity_kind,
            source_id,
            destination_id,
            created_at: Utc::now(),
        }
    }
}

/// Result of an insert-if-absent on the identity link table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    Inserted,
    /// A link was already present; carries its destination id.
    Existing(DestinationId),
}

/// Outcome of one `collect` invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionSummary {
    pub entity_kind: EntityKind,
    pub start_page: i64,
    pub last_completed_page: i64,
    pub pages_fetched: i64,
    pub records_collected: i64,
    /// Records dropped because they carried no usable id.
    pub records_rejected: i64,
    pub total_collected: i64,
    /// An empty page was observed.
    pub exhausted: bool,
    /// Stopped by cancellation or the page limit before exhaustion.
    pub stopped: bool,
    pub duration_seconds: f64,
}

/// Created/updated/skipped/failed counts for one entity kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordCounts {
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl RecordCounts {
    pub fn total(&self) -> usize {
        self.created + self.updated + self.skipped + self.failed
    }

    pub fn add(&mut self, other: &RecordCounts) {
        self.created += other.created;
        self.updated += other.updated;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

/// A record that could not be migrated.
///
/// Also persisted by the staging store until the record migrates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordFailure {
    pub kind: EntityKind,
    pub source_id: SourceId,
    pub class: String,
    pub message: String,
    pub failed_at: DateTime<Utc>,
}

impl RecordFailure {
    pub fn new(kind: EntityKind, source_id: SourceId, error: &MigrateError) -> Self {
        let class = match error.class() {
            FailureClass::Transient => "transient",
            FailureClass::Record => match error {
                MigrateError::Conflict { .. } => "conflict",
                MigrateError::Validation { .. } => "validation",
                _ => "record",
            },
            FailureClass::Systemic => "systemic",
        };
        Self {
            kind,
            source_id,
            class: class.to_string(),
            message: error.to_string(),
            failed_at: Utc::now(),
        }
    }
}

/// Per-batch migration report. Counters live only in memory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MigrationBatchResult {
    pub run_id: String,
    /// Staged rows fetched for this batch.
    pub fetched: usize,
    pub customers: RecordCounts,
    pub orders: RecordCounts,
    pub subscriptions: RecordCounts,
    pub failures: Vec<RecordFailure>,
    /// Highest source id seen; cursor for the next batch.
    pub last_source_id: Option<SourceId>,
}

impl MigrationBatchResult {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            ..Default::default()
        }
    }

    pub fn counts_mut(&mut self, kind: EntityKind) -> &mut RecordCounts {
        match kind {
            EntityKind::Customer => &mut self.customers,
            EntityKind::Order => &mut self.orders,
            EntityKind::Subscription => &mut self.subscriptions,
        }
    }

    pub fn counts(&self, kind: EntityKind) -> &RecordCounts {
        match kind {
            EntityKind::Customer => &self.customers,
            EntityKind::Order => &self.orders,
            EntityKind::Subscription => &self.subscriptions,
        }
    }

    /// Record a per-record failure and bump the failed counter.
    pub fn record_failure(
        &mut self,
        kind: EntityKind,
        source_id: SourceId,
        error: &MigrateError,
    ) -> &RecordFailure {
        self.counts_mut(kind).failed += 1;
        let index = self.failures.len();
        self.failures.push(RecordFailure::new(kind, source_id, error));
        &self.failures[index]
    }

    /// Fold another result into this one.
    pub fn merge(&mut self, other: MigrationBatchResult) {
        self.customers.add(&other.customers);
        self.orders.add(&other.orders);
        self.subscriptions.add(&other.subscriptions);
        self.failures.extend(other.failures);
        self.last_source_id = match (self.last_source_id, other.last_source_id) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }

    /// Nothing left to migrate.
    pub fn is_empty(&self) -> bool {
        self.fetched == 0
    }

    /// Share of fetched primary records that failed.
    pub fn failure_ratio(&self) -> f64 {
        if self.fetched == 0 {
            return 0.0;
        }
        self.counts(EntityKind::Customer).failed as f64 / self.fetched as f64
    }
}

/// Staging counters for one entity kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KindStats {
    pub kind: EntityKind,
    pub staged: i64,
    pub migrated: i64,
    pub pending: i64,
    pub linked: i64,
    /// Records with an outstanding failure from their last attempt.
    pub failed: i64,
    pub last_failure: Option<RecordFailure>,
    pub progress: Option<CollectionProgress>,
}

/// A hole in the staged source ids: nothing staged strictly between
/// `after` and `before`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdGap {
    pub after: SourceId,
    pub before: SourceId,
    pub missing: i64,
}

impl IdGap {
    pub fn new(after: SourceId, before: SourceId) -> Self {
        Self {
            after,
            before,
            missing: before - after - 1,
        }
    }
}

/// Snapshot of the staging store for the operator surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingStats {
    pub backend: String,
    pub kinds: Vec<KindStats>,
}
