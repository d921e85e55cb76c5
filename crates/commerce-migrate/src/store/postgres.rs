//! PostgreSQL-backed staging store.
//!
//! Stores staged records in schema-qualified tables with `JSONB` payloads.
//! Preferred over SQLite when several operators or hosts share one staging
//! database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use serde_json::Value;
use tokio_postgres::config::SslMode;
use tokio_postgres::{Config as PgConfig, NoTls, Row, Transaction};
use tracing::{debug, info};

use super::{LinkOutcome, StagingStore};
use crate::config::StagingConfig;
use crate::error::{MigrateError, Result};
use crate::model::{
    CollectionProgress, DestinationId, EntityKind, IdGap, IdentityLink, KindStats, RecordFailure,
    SourceId, StagedRecord, StagingStats,
};

/// PostgreSQL staging store.
pub struct PgStagingStore {
    pool: Pool,
    schema: String,
}

impl PgStagingStore {
    /// Wrap an existing pool.
    pub fn new(pool: Pool, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }

    /// Build a pool from configuration and verify connectivity.
    pub async fn connect(config: &StagingConfig) -> Result<Self> {
        let mut pg_config = PgConfig::new();
        pg_config.host(&config.host);
        pg_config.port(config.port);
        pg_config.dbname(&config.database);
        pg_config.user(&config.user);
        pg_config.password(&config.password);
        pg_config.ssl_mode(parse_ssl_mode(&config.ssl_mode)?);

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };

        let mgr = Manager::from_config(pg_config, NoTls, mgr_config);
        let pool = Pool::builder(mgr)
            .max_size(config.max_connections)
            .build()
            .map_err(|e| MigrateError::Storage(format!("Failed to create pool: {}", e)))?;

        // Test connection
        let client = pool.get().await?;
        client.simple_query("SELECT 1").await?;

        info!(
            "Connected to PostgreSQL staging store: {}:{}/{}",
            config.host, config.port, config.database
        );

        Ok(Self::new(pool, config.schema.clone()))
    }

    fn table(&self, kind: EntityKind) -> String {
        format!("{}.{}", self.schema, kind.table_name())
    }

    async fn read_progress(
        client: &Transaction<'_>,
        schema: &str,
        kind: EntityKind,
    ) -> Result<Option<CollectionProgress>> {
        let row = client
            .query_opt(
                &format!(
                    "SELECT last_completed_page, total_collected, updated_at
                     FROM {}.collection_progress WHERE entity_kind = $1",
                    schema
                ),
                &[&kind.as_str()],
            )
            .await?;

        Ok(row.map(|r| CollectionProgress {
            entity_kind: kind,
            last_completed_page: r.get(0),
            total_collected: r.get(1),
            updated_at: r.get(2),
        }))
    }

    async fn write_progress(
        client: &Transaction<'_>,
        schema: &str,
        progress: &CollectionProgress,
    ) -> Result<()> {
        client
            .execute(
                &format!(
                    "INSERT INTO {}.collection_progress
                        (entity_kind, last_completed_page, total_collected, updated_at)
                     VALUES ($1, $2, $3, $4)
                     ON CONFLICT (entity_kind) DO UPDATE SET
                        last_completed_page = EXCLUDED.last_completed_page,
                        total_collected = EXCLUDED.total_collected,
                        updated_at = EXCLUDED.updated_at",
                    schema
                ),
                &[
                    &progress.entity_kind.as_str(),
                    &progress.last_completed_page,
                    &progress.total_collected,
                    &progress.updated_at,
                ],
            )
            .await?;
        Ok(())
    }

    async fn upsert_rows(
        client: &Transaction<'_>,
        table: &str,
        records: &[StagedRecord],
    ) -> Result<usize> {
        let stmt = client
            .prepare(&format!(
                "INSERT INTO {} (source_id, parent_id, payload, fetched_at)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (source_id) DO UPDATE SET
                    parent_id = EXCLUDED.parent_id,
                    payload = EXCLUDED.payload,
                    fetched_at = EXCLUDED.fetched_at",
                table
            ))
            .await?;

        let mut written = 0;
        for record in records {
            written += client
                .execute(
                    &stmt,
                    &[
                        &record.source_id,
                        &record.parent_id,
                        &record.payload,
                        &record.fetched_at,
                    ],
                )
                .await?;
        }
        Ok(written as usize)
    }

    async fn read_failures(
        client: &Transaction<'_>,
        schema: &str,
        kind: EntityKind,
        limit: usize,
    ) -> Result<Vec<RecordFailure>> {
        let rows = client
            .query(
                &format!(
                    "SELECT source_id, class, message, failed_at FROM {}.migration_failures
                     WHERE entity_kind = $1 ORDER BY failed_at DESC, source_id DESC LIMIT $2",
                    schema
                ),
                &[&kind.as_str(), &(limit as i64)],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|r| RecordFailure {
                kind,
                source_id: r.get(0),
                class: r.get(1),
                message: r.get(2),
                failed_at: r.get(3),
            })
            .collect())
    }
}

#[async_trait]
impl StagingStore for PgStagingStore {
    async fn init_schema(&self) -> Result<()> {
        let conn = self.pool.get().await?;

        conn.execute(
            &format!("CREATE SCHEMA IF NOT EXISTS {}", self.schema),
            &[],
        )
        .await?;

        for kind in EntityKind::ALL {
            let table = self.table(kind);
            conn.execute(
                &format!(
                    "CREATE TABLE IF NOT EXISTS {} (
                        source_id BIGINT PRIMARY KEY,
                        parent_id BIGINT,
                        payload JSONB NOT NULL,
                        fetched_at TIMESTAMPTZ NOT NULL,
                        migrated BOOLEAN NOT NULL DEFAULT FALSE,
                        migrated_at TIMESTAMPTZ
                    )",
                    table
                ),
                &[],
            )
            .await?;

            conn.execute(
                &format!(
                    "CREATE INDEX IF NOT EXISTS idx_{}_unmigrated ON {} (migrated, source_id)",
                    kind.table_name(),
                    table
                ),
                &[],
            )
            .await?;

            if kind.is_dependent() {
                conn.execute(
                    &format!(
                        "CREATE INDEX IF NOT EXISTS idx_{}_parent ON {} (parent_id)",
                        kind.table_name(),
                        table
                    ),
                    &[],
                )
                .await?;
            }
        }

        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {}.collection_progress (
                    entity_kind TEXT PRIMARY KEY,
                    last_completed_page BIGINT NOT NULL DEFAULT 0 CHECK (last_completed_page >= 0),
                    total_collected BIGINT NOT NULL DEFAULT 0,
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )",
                self.schema
            ),
            &[],
        )
        .await?;

        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {}.identity_links (
                    entity_kind TEXT NOT NULL,
                    source_id BIGINT NOT NULL,
                    destination_id BIGINT NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    PRIMARY KEY (entity_kind, source_id)
                )",
                self.schema
            ),
            &[],
        )
        .await?;

        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {}.migration_failures (
                    entity_kind TEXT NOT NULL,
                    source_id BIGINT NOT NULL,
                    class TEXT NOT NULL,
                    message TEXT NOT NULL,
                    failed_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    PRIMARY KEY (entity_kind, source_id)
                )",
                self.schema
            ),
            &[],
        )
        .await?;

        conn.execute(
            &format!(
                "CREATE INDEX IF NOT EXISTS idx_migration_failures_recent
                 ON {}.migration_failures (entity_kind, failed_at)",
                self.schema
            ),
            &[],
        )
        .await?;

        Ok(())
    }

    async fn upsert_batch(&self, kind: EntityKind, records: &[StagedRecord]) -> Result<usize> {
        let mut conn = self.pool.get().await?;
        let tx = conn.transaction().await?;
        let written = Self::upsert_rows(&tx, &self.table(kind), records).await?;
        tx.commit().await?;
        Ok(written)
    }

    async fn commit_page(
        &self,
        kind: EntityKind,
        page: i64,
        records: &[StagedRecord],
    ) -> Result<CollectionProgress> {
        let mut conn = self.pool.get().await?;
        let tx = conn.transaction().await?;

        // Row lock so two collectors for one kind cannot interleave commits.
        tx.execute(
            &format!(
                "INSERT INTO {}.collection_progress (entity_kind) VALUES ($1)
                 ON CONFLICT (entity_kind) DO NOTHING",
                self.schema
            ),
            &[&kind.as_str()],
        )
        .await?;
        let row = tx
            .query_one(
                &format!(
                    "SELECT last_completed_page, total_collected
                     FROM {}.collection_progress WHERE entity_kind = $1 FOR UPDATE",
                    self.schema
                ),
                &[&kind.as_str()],
            )
            .await?;
        let last_completed: i64 = row.get(0);
        let total: i64 = row.get(1);

        if page <= last_completed {
            return Err(MigrateError::ProgressRegression {
                kind,
                last_completed,
                attempted: page,
            });
        }

        Self::upsert_rows(&tx, &self.table(kind), records).await?;

        let progress = CollectionProgress {
            entity_kind: kind,
            last_completed_page: page,
            total_collected: total + records.len() as i64,
            updated_at: Utc::now(),
        };
        Self::write_progress(&tx, &self.schema, &progress).await?;
        tx.commit().await?;

        debug!("{}: committed page {} ({} records)", kind, page, records.len());
        Ok(progress)
    }

    async fn load_progress(&self, kind: EntityKind) -> Result<Option<CollectionProgress>> {
        let mut conn = self.pool.get().await?;
        let tx = conn.transaction().await?;
        let progress = Self::read_progress(&tx, &self.schema, kind).await?;
        tx.commit().await?;
        Ok(progress)
    }

    async fn reset_progress(&self, kind: EntityKind, page: i64) -> Result<CollectionProgress> {
        if page < 0 {
            return Err(MigrateError::Config(format!(
                "progress page must not be negative, got {}",
                page
            )));
        }
        let mut conn = self.pool.get().await?;
        let tx = conn.transaction().await?;
        let mut progress = Self::read_progress(&tx, &self.schema, kind)
            .await?
            .unwrap_or_else(|| CollectionProgress::new(kind));
        progress.last_completed_page = page;
        progress.updated_at = Utc::now();
        Self::write_progress(&tx, &self.schema, &progress).await?;
        tx.commit().await?;
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
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT source_id, parent_id, payload, fetched_at, migrated, migrated_at
                     FROM {} WHERE NOT migrated AND source_id > $1
                     ORDER BY source_id LIMIT $2",
                    self.table(kind)
                ),
                &[&after.unwrap_or(i64::MIN), &(limit as i64)],
            )
            .await?;
        Ok(rows.iter().map(|r| to_record(kind, r)).collect())
    }

    async fn fetch_by_parent(
        &self,
        kind: EntityKind,
        parent_id: SourceId,
    ) -> Result<Vec<StagedRecord>> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT source_id, parent_id, payload, fetched_at, migrated, migrated_at
                     FROM {} WHERE parent_id = $1 ORDER BY source_id",
                    self.table(kind)
                ),
                &[&parent_id],
            )
            .await?;
        Ok(rows.iter().map(|r| to_record(kind, r)).collect())
    }

    async fn get(&self, kind: EntityKind, source_id: SourceId) -> Result<Option<StagedRecord>> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                &format!(
                    "SELECT source_id, parent_id, payload, fetched_at, migrated, migrated_at
                     FROM {} WHERE source_id = $1",
                    self.table(kind)
                ),
                &[&source_id],
            )
            .await?;
        Ok(row.as_ref().map(|r| to_record(kind, r)))
    }

    async fn mark_migrated(&self, kind: EntityKind, source_ids: &[SourceId]) -> Result<usize> {
        if source_ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.pool.get().await?;
        let tx = conn.transaction().await?;
        let ids: Vec<i64> = source_ids.to_vec();
        let updated = tx
            .execute(
                &format!(
                    "UPDATE {} SET migrated = TRUE, migrated_at = COALESCE(migrated_at, NOW())
                     WHERE source_id = ANY($1)",
                    self.table(kind)
                ),
                &[&ids],
            )
            .await?;
        tx.execute(
            &format!(
                "DELETE FROM {}.migration_failures WHERE entity_kind = $1 AND source_id = ANY($2)",
                self.schema
            ),
            &[&kind.as_str(), &ids],
        )
        .await?;
        tx.commit().await?;
        Ok(updated as usize)
    }

    async fn lookup_link(
        &self,
        kind: EntityKind,
        source_id: SourceId,
    ) -> Result<Option<DestinationId>> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                &format!(
                    "SELECT destination_id FROM {}.identity_links
                     WHERE entity_kind = $1 AND source_id = $2",
                    self.schema
                ),
                &[&kind.as_str(), &source_id],
            )
            .await?;
        Ok(row.map(|r| r.get(0)))
    }

    async fn insert_link(&self, link: &IdentityLink) -> Result<LinkOutcome> {
        let conn = self.pool.get().await?;
        let inserted = conn
            .query_opt(
                &format!(
                    "INSERT INTO {}.identity_links (entity_kind, source_id, destination_id, created_at)
                     VALUES ($1, $2, $3, $4)
                     ON CONFLICT (entity_kind, source_id) DO NOTHING
                     RETURNING destination_id",
                    self.schema
                ),
                &[
                    &link.entity_kind.as_str(),
                    &link.source_id,
                    &link.destination_id,
                    &link.created_at,
                ],
            )
            .await?;
        if inserted.is_some() {
            return Ok(LinkOutcome::Inserted);
        }

        let row = conn
            .query_one(
                &format!(
                    "SELECT destination_id FROM {}.identity_links
                     WHERE entity_kind = $1 AND source_id = $2",
                    self.schema
                ),
                &[&link.entity_kind.as_str(), &link.source_id],
            )
            .await?;
        Ok(LinkOutcome::Existing(row.get(0)))
    }

    async fn count_staged(&self, kind: EntityKind) -> Result<i64> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_one(&format!("SELECT COUNT(*) FROM {}", self.table(kind)), &[])
            .await?;
        Ok(row.get(0))
    }

    async fn record_failure(&self, failure: &RecordFailure) -> Result<()> {
        let conn = self.pool.get().await?;
        conn.execute(
            &format!(
                "INSERT INTO {}.migration_failures (entity_kind, source_id, class, message, failed_at)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (entity_kind, source_id) DO UPDATE SET
                    class = EXCLUDED.class,
                    message = EXCLUDED.message,
                    failed_at = EXCLUDED.failed_at",
                self.schema
            ),
            &[
                &failure.kind.as_str(),
                &failure.source_id,
                &failure.class,
                &failure.message,
                &failure.failed_at,
            ],
        )
        .await?;
        Ok(())
    }

    async fn list_failures(&self, kind: EntityKind, limit: usize) -> Result<Vec<RecordFailure>> {
        let mut conn = self.pool.get().await?;
        let tx = conn.transaction().await?;
        let failures = Self::read_failures(&tx, &self.schema, kind, limit).await?;
        tx.commit().await?;
        Ok(failures)
    }

    async fn id_range(&self, kind: EntityKind) -> Result<Option<(SourceId, SourceId)>> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_one(
                &format!("SELECT MIN(source_id), MAX(source_id) FROM {}", self.table(kind)),
                &[],
            )
            .await?;
        let min: Option<i64> = row.get(0);
        let max: Option<i64> = row.get(1);
        Ok(min.zip(max))
    }

    async fn id_gaps(&self, kind: EntityKind, min_jump: i64) -> Result<Vec<IdGap>> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT prev_id, source_id FROM (
                        SELECT source_id, LAG(source_id) OVER (ORDER BY source_id) AS prev_id
                        FROM {}
                     ) AS ordered
                     WHERE prev_id IS NOT NULL AND source_id - prev_id > $1
                     ORDER BY source_id",
                    self.table(kind)
                ),
                &[&min_jump],
            )
            .await?;
        Ok(rows.iter().map(|r| IdGap::new(r.get(0), r.get(1))).collect())
    }

    async fn stats(&self) -> Result<StagingStats> {
        let mut conn = self.pool.get().await?;
        let tx = conn.transaction().await?;
        let mut kinds = Vec::with_capacity(EntityKind::ALL.len());
        for kind in EntityKind::ALL {
            let row = tx
                .query_one(
                    &format!(
                        "SELECT COUNT(*), COUNT(*) FILTER (WHERE migrated) FROM {}",
                        self.table(kind)
                    ),
                    &[],
                )
                .await?;
            let staged: i64 = row.get(0);
            let migrated: i64 = row.get(1);
            let linked: i64 = tx
                .query_one(
                    &format!(
                        "SELECT COUNT(*) FROM {}.identity_links WHERE entity_kind = $1",
                        self.schema
                    ),
                    &[&kind.as_str()],
                )
                .await?
                .get(0);
            let failed: i64 = tx
                .query_one(
                    &format!(
                        "SELECT COUNT(*) FROM {}.migration_failures WHERE entity_kind = $1",
                        self.schema
                    ),
                    &[&kind.as_str()],
                )
                .await?
                .get(0);
            let last_failure = Self::read_failures(&tx, &self.schema, kind, 1)
                .await?
                .into_iter()
                .next();
            kinds.push(KindStats {
                kind,
                staged,
                migrated,
                pending: staged - migrated,
                linked,
                failed,
                last_failure,
                progress: Self::read_progress(&tx, &self.schema, kind).await?,
            });
        }
        tx.commit().await?;
        Ok(StagingStats {
            backend: self.backend_type().to_string(),
            kinds,
        })
    }

    async fn purge(&self, include_links: bool) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let tx = conn.transaction().await?;
        for kind in EntityKind::ALL {
            tx.execute(&format!("TRUNCATE {}", self.table(kind)), &[])
                .await?;
        }
        tx.execute(
            &format!(
                "TRUNCATE {0}.collection_progress, {0}.migration_failures",
                self.schema
            ),
            &[],
        )
        .await?;
        if include_links {
            tx.execute(&format!("TRUNCATE {}.identity_links", self.schema), &[])
                .await?;
        }
        tx.commit().await?;
        info!(
            "Purged staged data{}",
            if include_links { " and identity links" } else { "" }
        );
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "postgres"
    }
}

fn to_record(kind: EntityKind, row: &Row) -> StagedRecord {
    let payload: Value = row.get(2);
    let fetched_at: DateTime<Utc> = row.get(3);
    StagedRecord {
        kind,
        source_id: row.get(0),
        parent_id: row.get(1),
        payload,
        fetched_at,
        migrated: row.get(4),
        migrated_at: row.get(5),
    }
}

fn parse_ssl_mode(mode: &str) -> Result<SslMode> {
    match mode.to_lowercase().as_str() {
        "disable" => Ok(SslMode::Disable),
        "prefer" | "" => Ok(SslMode::Prefer),
        other => Err(MigrateError::Config(format!(
            "staging.ssl_mode '{}' is not supported (use disable or prefer)",
            other
        ))),
    }
}
