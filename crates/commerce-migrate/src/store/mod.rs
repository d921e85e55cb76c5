//! Durable staging store for collected records, progress and identity links.
//!
//! The [`StagingStore`] trait is the only path through which the collector
//! and migrator touch persistent state. Two backends are provided:
//!
//! - **SQLite**: [`SqliteStagingStore`] in `sqlite.rs`, the default local store
//! - **PostgreSQL**: [`PgStagingStore`] in `postgres.rs`
//!
//! Callers hold an `Arc<dyn StagingStore>` and never depend on the concrete type.

mod postgres;
mod sqlite;

pub use postgres::PgStagingStore;
pub use sqlite::SqliteStagingStore;

pub use crate::model::LinkOutcome;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::config::{StagingBackendKind, StagingConfig};
use crate::error::Result;
use crate::model::{
    CollectionProgress, DestinationId, EntityKind, IdGap, IdentityLink, RecordFailure, SourceId,
    StagedRecord, StagingStats,
};

/// Persistence interface for staged records, collection progress and identity links.
///
/// Implementations must be `Send + Sync` to be shared across migration workers.
#[async_trait]
pub trait StagingStore: Send + Sync {
    /// Create tables and indexes. Idempotent.
    async fn init_schema(&self) -> Result<()>;

    /// Insert or overwrite records keyed on `(kind, source_id)`.
    ///
    /// Overwrites `payload`, `parent_id` and `fetched_at`; the `migrated`
    /// flag of an existing row is preserved. Returns the number of rows written.
    async fn upsert_batch(&self, kind: EntityKind, records: &[StagedRecord]) -> Result<usize>;

    /// Upsert one page of records and advance progress to `page` atomically.
    ///
    /// Fails with `ProgressRegression` when `page` is not beyond the last
    /// committed page; in that case nothing is written.
    async fn commit_page(
        &self,
        kind: EntityKind,
        page: i64,
        records: &[StagedRecord],
    ) -> Result<CollectionProgress>;

    /// Current collection checkpoint, if any page was ever committed.
    async fn load_progress(&self, kind: EntityKind) -> Result<Option<CollectionProgress>>;

    /// Set the checkpoint to `page` unconditionally. Operator override only.
    async fn reset_progress(&self, kind: EntityKind, page: i64) -> Result<CollectionProgress>;

    /// Up to `limit` unmigrated rows, ascending by `source_id`.
    async fn fetch_unmigrated(&self, kind: EntityKind, limit: usize) -> Result<Vec<StagedRecord>> {
        self.fetch_unmigrated_after(kind, None, limit).await
    }

    /// Up to `limit` unmigrated rows with `source_id > after`, ascending.
    async fn fetch_unmigrated_after(
        &self,
        kind: EntityKind,
        after: Option<SourceId>,
        limit: usize,
    ) -> Result<Vec<StagedRecord>>;

    /// All rows of `kind` owned by customer `parent_id`, ascending by `source_id`.
    async fn fetch_by_parent(&self, kind: EntityKind, parent_id: SourceId)
        -> Result<Vec<StagedRecord>>;

    async fn get(&self, kind: EntityKind, source_id: SourceId) -> Result<Option<StagedRecord>>;

    /// Flag rows as migrated and clear their recorded failures.
    /// Re-marking keeps the original `migrated_at`.
    async fn mark_migrated(&self, kind: EntityKind, source_ids: &[SourceId]) -> Result<usize>;

    async fn lookup_link(&self, kind: EntityKind, source_id: SourceId)
        -> Result<Option<DestinationId>>;

    /// Insert a link if none exists for `(kind, source_id)`. Never overwrites.
    async fn insert_link(&self, link: &IdentityLink) -> Result<LinkOutcome>;

    async fn count_staged(&self, kind: EntityKind) -> Result<i64>;

    /// Persist the latest failure of one record, replacing any earlier one.
    async fn record_failure(&self, failure: &RecordFailure) -> Result<()>;

    /// Outstanding failures of `kind`, newest first.
    async fn list_failures(&self, kind: EntityKind, limit: usize) -> Result<Vec<RecordFailure>>;

    /// Lowest and highest staged source id, or `None` when nothing is staged.
    async fn id_range(&self, kind: EntityKind) -> Result<Option<(SourceId, SourceId)>>;

    /// Consecutive staged ids that are more than `min_jump` apart, ascending.
    async fn id_gaps(&self, kind: EntityKind, min_jump: i64) -> Result<Vec<IdGap>>;

    /// Per-kind counters for the operator surface.
    async fn stats(&self) -> Result<StagingStats>;

    /// Delete staged rows, progress and recorded failures, and identity
    /// links when `include_links`.
    async fn purge(&self, include_links: bool) -> Result<()>;

    /// Get the backend type name for logging/debugging.
    fn backend_type(&self) -> &'static str;
}

/// Open the backend selected by `config`.
pub async fn open_store(config: &StagingConfig) -> Result<Arc<dyn StagingStore>> {
    let store: Arc<dyn StagingStore> = match config.backend {
        StagingBackendKind::Sqlite => {
            Arc::new(SqliteStagingStore::open(std::path::Path::new(&config.path))?)
        }
        StagingBackendKind::Postgres => Arc::new(PgStagingStore::connect(config).await?),
    };
    info!("Using {} staging store", store.backend_type());
    Ok(store)
}
