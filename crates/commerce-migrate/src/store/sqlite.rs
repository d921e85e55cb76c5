//! SQLite-backed implementation of [`StagingStore`].
//!
//! Uses a single `Mutex<Connection>` for thread safety. Timestamps are stored
//! as RFC 3339 text and payloads as JSON text.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use super::{LinkOutcome, StagingStore};
use crate::error::{MigrateError, Result};
use crate::model::{
    CollectionProgress, DestinationId, EntityKind, IdGap, IdentityLink, KindStats, RecordFailure,
    SourceId, StagedRecord, StagingStats,
};

/// Idempotent DDL for the staging tables.
const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS staged_customers (
    source_id INTEGER PRIMARY KEY,
    parent_id INTEGER,
    payload TEXT NOT NULL,
    fetched_at TEXT NOT NULL,
    migrated INTEGER NOT NULL DEFAULT 0,
    migrated_at TEXT
);

CREATE TABLE IF NOT EXISTS staged_orders (
    source_id INTEGER PRIMARY KEY,
    parent_id INTEGER,
    payload TEXT NOT NULL,
    fetched_at TEXT NOT NULL,
    migrated INTEGER NOT NULL DEFAULT 0,
    migrated_at TEXT
);

CREATE TABLE IF NOT EXISTS staged_subscriptions (
    source_id INTEGER PRIMARY KEY,
    parent_id INTEGER,
    payload TEXT NOT NULL,
    fetched_at TEXT NOT NULL,
    migrated INTEGER NOT NULL DEFAULT 0,
    migrated_at TEXT
);

CREATE TABLE IF NOT EXISTS collection_progress (
    entity_kind TEXT PRIMARY KEY,
    last_completed_page INTEGER NOT NULL DEFAULT 0 CHECK (last_completed_page >= 0),
    total_collected INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS identity_links (
    entity_kind TEXT NOT NULL,
    source_id INTEGER NOT NULL,
    destination_id INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (entity_kind, source_id)
);

CREATE TABLE IF NOT EXISTS migration_failures (
    entity_kind TEXT NOT NULL,
    source_id INTEGER NOT NULL,
    class TEXT NOT NULL,
    message TEXT NOT NULL,
    failed_at TEXT NOT NULL,
    PRIMARY KEY (entity_kind, source_id)
);

CREATE INDEX IF NOT EXISTS idx_migration_failures_recent ON migration_failures (entity_kind, failed_at);
CREATE INDEX IF NOT EXISTS idx_staged_customers_unmigrated ON staged_customers (migrated, source_id);
CREATE INDEX IF NOT EXISTS idx_staged_orders_unmigrated ON staged_orders (migrated, source_id);
CREATE INDEX IF NOT EXISTS idx_staged_subscriptions_unmigrated ON staged_subscriptions (migrated, source_id);
CREATE INDEX IF NOT EXISTS idx_staged_orders_parent ON staged_orders (parent_id);
CREATE INDEX IF NOT EXISTS idx_staged_subscriptions_parent ON staged_subscriptions (parent_id);
";

/// Columns read back for a staged row, in select order.
const RECORD_COLUMNS: &str = "source_id, parent_id, payload, fetched_at, migrated, migrated_at";

type RawRow = (i64, Option<i64>, String, String, bool, Option<String>);

/// SQLite-backed staging store.
///
/// Create with [`SqliteStagingStore::open`] for file-backed persistence
/// or [`SqliteStagingStore::in_memory`] for tests.
pub struct SqliteStagingStore {
    conn: Mutex<Connection>,
}

impl SqliteStagingStore {
    /// Open or create a staging database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(CREATE_TABLES)?;
        info!("Opened SQLite staging store at {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory staging store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquire the connection lock.
    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| MigrateError::Storage("staging connection lock poisoned".into()))
    }

    fn upsert_rows(conn: &Connection, kind: EntityKind, records: &[StagedRecord]) -> Result<usize> {
        let sql = format!(
            "INSERT INTO {} (source_id, parent_id, payload, fetched_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (source_id) DO UPDATE SET
                parent_id = excluded.parent_id,
                payload = excluded.payload,
                fetched_at = excluded.fetched_at",
            kind.table_name()
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let mut written = 0;
        for record in records {
            let payload = serde_json::to_string(&record.payload)?;
            written += stmt.execute(params![
                record.source_id,
                record.parent_id,
                payload,
                format_ts(&record.fetched_at),
            ])?;
        }
        Ok(written)
    }

    fn read_progress(conn: &Connection, kind: EntityKind) -> Result<Option<CollectionProgress>> {
        let row = conn
            .query_row(
                "SELECT last_completed_page, total_collected, updated_at
                 FROM collection_progress WHERE entity_kind = ?1",
                params![kind.as_str()],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(page, total, updated_at)| {
            Ok(CollectionProgress {
                entity_kind: kind,
                last_completed_page: page,
                total_collected: total,
                updated_at: parse_ts(&updated_at)?,
            })
        })
        .transpose()
    }

    fn write_progress(conn: &Connection, progress: &CollectionProgress) -> Result<()> {
        conn.execute(
            "INSERT INTO collection_progress (entity_kind, last_completed_page, total_collected, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (entity_kind) DO UPDATE SET
                last_completed_page = excluded.last_completed_page,
                total_collected = excluded.total_collected,
                updated_at = excluded.updated_at",
            params![
                progress.entity_kind.as_str(),
                progress.last_completed_page,
                progress.total_collected,
                format_ts(&progress.updated_at),
            ],
        )?;
        Ok(())
    }

    fn query_records(
        conn: &Connection,
        kind: EntityKind,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<StagedRecord>> {
        let mut stmt = conn.prepare_cached(sql)?;
        let rows = stmt
            .query_map(params, |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            })?
            .collect::<std::result::Result<Vec<RawRow>, _>>()?;

        rows.into_iter().map(|raw| to_record(kind, raw)).collect()
    }

    fn read_failures(conn: &Connection, kind: EntityKind, limit: usize) -> Result<Vec<RecordFailure>> {
        let mut stmt = conn.prepare_cached(
            "SELECT source_id, class, message, failed_at FROM migration_failures
             WHERE entity_kind = ?1 ORDER BY failed_at DESC, source_id DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![kind.as_str(), limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(source_id, class, message, failed_at)| {
                Ok(RecordFailure {
                    kind,
                    source_id,
                    class,
                    message,
                    failed_at: parse_ts(&failed_at)?,
                })
            })
            .collect()
    }

    fn count(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> Result<i64> {
        Ok(conn.query_row(sql, params, |row| row.get(0))?)
    }
}

#[async_trait]
impl StagingStore for SqliteStagingStore {
    async fn init_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(())
    }

    async fn upsert_batch(&self, kind: EntityKind, records: &[StagedRecord]) -> Result<usize> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let written = Self::upsert_rows(&tx, kind, records)?;
        tx.commit()?;
        Ok(written)
    }

    async fn commit_page(
        &self,
        kind: EntityKind,
        page: i64,
        records: &[StagedRecord],
    ) -> Result<CollectionProgress> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;

        let current = Self::read_progress(&tx, kind)?.unwrap_or_else(|| CollectionProgress::new(kind));
        if page <= current.last_completed_page {
            return Err(MigrateError::ProgressRegression {
                kind,
                last_completed: current.last_completed_page,
                attempted: page,
            });
        }

        Self::upsert_rows(&tx, kind, records)?;

        let progress = CollectionProgress {
            entity_kind: kind,
            last_completed_page: page,
            total_collected: current.total_collected + records.len() as i64,
            updated_at: Utc::now(),
        };
        Self::write_progress(&tx, &progress)?;
        tx.commit()?;

        debug!("{}: committed page {} ({} records)", kind, page, records.len());
        Ok(progress)
    }

    async fn load_progress(&self, kind: EntityKind) -> Result<Option<CollectionProgress>> {
        let conn = self.lock_conn()?;
        Self::read_progress(&conn, kind)
    }

    async fn reset_progress(&self, kind: EntityKind, page: i64) -> Result<CollectionProgress> {
        if page < 0 {
            return Err(MigrateError::Config(format!(
                "progress page must not be negative, got {}",
                page
            )));
        }
        let conn = self.lock_conn()?;
        let mut progress =
            Self::read_progress(&conn, kind)?.unwrap_or_else(|| CollectionProgress::new(kind));
        progress.last_completed_page = page;
        progress.updated_at = Utc::now();
        Self::write_progress(&conn, &progress)?;
        Ok(progress)
    }

    async fn fetch_unmigrated_after(
        &self,
        kind: EntityKind,
        after: Option<SourceId>,
        limit: usize,
    ) -> Result<Vec<StagedRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let conn = self.lock_conn()?;
        let sql = format!(
            "SELECT {} FROM {} WHERE migrated = 0 AND source_id > ?1 ORDER BY source_id LIMIT ?2",
            RECORD_COLUMNS,
            kind.table_name()
        );
        Self::query_records(
            &conn,
            kind,
            &sql,
            params![after.unwrap_or(i64::MIN), limit as i64],
        )
    }

    async fn fetch_by_parent(
        &self,
        kind: EntityKind,
        parent_id: SourceId,
    ) -> Result<Vec<StagedRecord>> {
        let conn = self.lock_conn()?;
        let sql = format!(
            "SELECT {} FROM {} WHERE parent_id = ?1 ORDER BY source_id",
            RECORD_COLUMNS,
            kind.table_name()
        );
        Self::query_records(&conn, kind, &sql, params![parent_id])
    }

    async fn get(&self, kind: EntityKind, source_id: SourceId) -> Result<Option<StagedRecord>> {
        let conn = self.lock_conn()?;
        let sql = format!(
            "SELECT {} FROM {} WHERE source_id = ?1",
            RECORD_COLUMNS,
            kind.table_name()
        );
        Ok(Self::query_records(&conn, kind, &sql, params![source_id])?
            .into_iter()
            .next())
    }

    async fn mark_migrated(&self, kind: EntityKind, source_ids: &[SourceId]) -> Result<usize> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let now = format_ts(&Utc::now());
        let mut updated = 0;
        {
            let sql = format!(
                "UPDATE {} SET migrated = 1, migrated_at = COALESCE(migrated_at, ?1)
                 WHERE source_id = ?2",
                kind.table_name()
            );
            let mut stmt = tx.prepare_cached(&sql)?;
            let mut clear = tx.prepare_cached(
                "DELETE FROM migration_failures WHERE entity_kind = ?1 AND source_id = ?2",
            )?;
            for id in source_ids {
                updated += stmt.execute(params![now, id])?;
                clear.execute(params![kind.as_str(), id])?;
            }
        }
        tx.commit()?;
        Ok(updated)
    }

    async fn lookup_link(
        &self,
        kind: EntityKind,
        source_id: SourceId,
    ) -> Result<Option<DestinationId>> {
        let conn = self.lock_conn()?;
        Ok(conn
            .query_row(
                "SELECT destination_id FROM identity_links WHERE entity_kind = ?1 AND source_id = ?2",
                params![kind.as_str(), source_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    async fn insert_link(&self, link: &IdentityLink) -> Result<LinkOutcome> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let inserted = tx.execute(
            "INSERT INTO identity_links (entity_kind, source_id, destination_id, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (entity_kind, source_id) DO NOTHING",
            params![
                link.entity_kind.as_str(),
                link.source_id,
                link.destination_id,
                format_ts(&link.created_at),
            ],
        )?;

        let outcome = if inserted == 1 {
            LinkOutcome::Inserted
        } else {
            let existing: i64 = tx.query_row(
                "SELECT destination_id FROM identity_links WHERE entity_kind = ?1 AND source_id = ?2",
                params![link.entity_kind.as_str(), link.source_id],
                |row| row.get(0),
            )?;
            LinkOutcome::Existing(existing)
        };
        tx.commit()?;
        Ok(outcome)
    }

    async fn count_staged(&self, kind: EntityKind) -> Result<i64> {
        let conn = self.lock_conn()?;
        Self::count(
            &conn,
            &format!("SELECT COUNT(*) FROM {}", kind.table_name()),
            [],
        )
    }

    async fn record_failure(&self, failure: &RecordFailure) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO migration_failures (entity_kind, source_id, class, message, failed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (entity_kind, source_id) DO UPDATE SET
                class = excluded.class,
                message = excluded.message,
                failed_at = excluded.failed_at",
            params![
                failure.kind.as_str(),
                failure.source_id,
                failure.class,
                failure.message,
                format_ts(&failure.failed_at),
            ],
        )?;
        Ok(())
    }

    async fn list_failures(&self, kind: EntityKind, limit: usize) -> Result<Vec<RecordFailure>> {
        let conn = self.lock_conn()?;
        Self::read_failures(&conn, kind, limit)
    }

    async fn id_range(&self, kind: EntityKind) -> Result<Option<(SourceId, SourceId)>> {
        let conn = self.lock_conn()?;
        let (min, max): (Option<i64>, Option<i64>) = conn.query_row(
            &format!("SELECT MIN(source_id), MAX(source_id) FROM {}", kind.table_name()),
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(min.zip(max))
    }

    async fn id_gaps(&self, kind: EntityKind, min_jump: i64) -> Result<Vec<IdGap>> {
        let conn = self.lock_conn()?;
        let sql = format!(
            "SELECT prev_id, source_id FROM (
                SELECT source_id, LAG(source_id) OVER (ORDER BY source_id) AS prev_id FROM {}
             ) WHERE prev_id IS NOT NULL AND source_id - prev_id > ?1
             ORDER BY source_id",
            kind.table_name()
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let gaps = stmt
            .query_map(params![min_jump], |row| {
                Ok(IdGap::new(row.get(0)?, row.get(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(gaps)
    }

    async fn stats(&self) -> Result<StagingStats> {
        let conn = self.lock_conn()?;
        let mut kinds = Vec::with_capacity(EntityKind::ALL.len());
        for kind in EntityKind::ALL {
            let staged = Self::count(
                &conn,
                &format!("SELECT COUNT(*) FROM {}", kind.table_name()),
                [],
            )?;
            let migrated = Self::count(
                &conn,
                &format!("SELECT COUNT(*) FROM {} WHERE migrated = 1", kind.table_name()),
                [],
            )?;
            let linked = Self::count(
                &conn,
                "SELECT COUNT(*) FROM identity_links WHERE entity_kind = ?1",
                params![kind.as_str()],
            )?;
            let failed = Self::count(
                &conn,
                "SELECT COUNT(*) FROM migration_failures WHERE entity_kind = ?1",
                params![kind.as_str()],
            )?;
            kinds.push(KindStats {
                kind,
                staged,
                migrated,
                pending: staged - migrated,
                linked,
                failed,
                last_failure: Self::read_failures(&conn, kind, 1)?.into_iter().next(),
                progress: Self::read_progress(&conn, kind)?,
            });
        }
        Ok(StagingStats {
            backend: self.backend_type().to_string(),
            kinds,
        })
    }

    async fn purge(&self, include_links: bool) -> Result<()> {
        let mut conn = self.lock_conn()?;
        // Overwrite freed pages instead of leaving payloads in the file.
        conn.pragma_update(None, "secure_delete", true)?;
        {
            let tx = conn.transaction()?;
            for kind in EntityKind::ALL {
                tx.execute(&format!("DELETE FROM {}", kind.table_name()), [])?;
            }
            tx.execute("DELETE FROM collection_progress", [])?;
            tx.execute("DELETE FROM migration_failures", [])?;
            if include_links {
                tx.execute("DELETE FROM identity_links", [])?;
            }
            tx.commit()?;
        }
        conn.execute_batch("VACUUM")?;
        info!(
            "Purged staged data{}",
            if include_links { " and identity links" } else { "" }
        );
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "sqlite"
    }
}

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| MigrateError::Storage(format!("invalid timestamp '{}': {}", raw, e)))
}

fn to_record(kind: EntityKind, raw: RawRow) -> Result<StagedRecord> {
    let (source_id, parent_id, payload, fetched_at, migrated, migrated_at) = raw;
    Ok(StagedRecord {
        kind,
        source_id,
        parent_id,
        payload: serde_json::from_str(&payload)?,
        fetched_at: parse_ts(&fetched_at)?,
        migrated,
        migrated_at: migrated_at.as_deref().map(parse_ts).transpose()?,
    })
}
