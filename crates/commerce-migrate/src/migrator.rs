//! Phase 2: idempotent, customer-centric migration to the destination.

use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::destination::DestinationApi;
use crate::error::{FailureClass, MigrateError, Result};
use crate::identity::IdentityMapper;
use crate::mapper::{
    is_active_customer, map_customer, map_order, map_subscription_record, MapperSettings,
};
use crate::model::{
    DestinationId, EntityKind, MigrationBatchResult, RecordCounts, RecordFailure, SourceId,
    StagedRecord,
};
use crate::retry::RetryPolicy;
use crate::store::StagingStore;

/// What happened to one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Created,
    /// Already linked, or an unlinked destination entity was found and adopted.
    Updated,
    Skipped,
}

impl Outcome {
    fn count(self, counts: &mut RecordCounts) {
        match self {
            Outcome::Created => counts.created += 1,
            Outcome::Updated => counts.updated += 1,
            Outcome::Skipped => counts.skipped += 1,
        }
    }
}

/// Why a run loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// No unmigrated customers left beyond the cursor.
    Completed,
    Cancelled,
    BatchLimit,
    /// A batch's customer failure ratio exceeded the configured maximum.
    FailureThreshold,
    /// A systemic failure stopped the run; see [`MigrateError::Aborted`].
    Aborted,
}

/// Totals across all batches of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationRunSummary {
    pub run_id: String,
    pub kind: EntityKind,
    pub batches: usize,
    pub fetched: usize,
    pub customers: RecordCounts,
    pub orders: RecordCounts,
    pub subscriptions: RecordCounts,
    pub failures: Vec<RecordFailure>,
    pub stop_reason: StopReason,
    pub dry_run: bool,
    pub duration_seconds: f64,
}

impl MigrationRunSummary {
    pub(crate) fn new(run_id: String, kind: EntityKind, dry_run: bool) -> Self {
        Self {
            run_id,
            kind,
            batches: 0,
            fetched: 0,
            customers: RecordCounts::default(),
            orders: RecordCounts::default(),
            subscriptions: RecordCounts::default(),
            failures: Vec::new(),
            stop_reason: StopReason::Completed,
            dry_run,
            duration_seconds: 0.0,
        }
    }

    fn absorb(&mut self, batch: MigrationBatchResult) {
        self.batches += 1;
        self.fetched += batch.fetched;
        self.customers.add(&batch.customers);
        self.orders.add(&batch.orders);
        self.subscriptions.add(&batch.subscriptions);
        self.failures.extend(batch.failures);
    }

    pub fn failed(&self) -> usize {
        self.customers.failed + self.orders.failed + self.subscriptions.failed
    }
}

/// Everything one customer unit needs; cheap to clone into worker tasks.
#[derive(Clone)]
struct UnitContext {
    store: Arc<dyn StagingStore>,
    destination: Arc<dyn DestinationApi>,
    identity: Arc<IdentityMapper>,
    settings: Arc<MapperSettings>,
    retry: RetryPolicy,
    skip_inactive: bool,
}

/// Migrates staged customers together with their orders and subscriptions.
///
/// Per customer the order is fixed: link lookup, reconciliation lookup by
/// external reference, create, link, dependents, mark migrated. A crash at
/// any point leaves the customer unmigrated and a re-run resumes it without
/// creating duplicates.
pub struct Migrator {
    ctx: UnitContext,
    workers: usize,
    dry_run: bool,
    max_failure_ratio: Option<f64>,
    cancel: CancellationToken,
}

impl Migrator {
    pub fn new(
        store: Arc<dyn StagingStore>,
        destination: Arc<dyn DestinationApi>,
        settings: MapperSettings,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            ctx: UnitContext {
                identity: Arc::new(IdentityMapper::new(store.clone())),
                store,
                destination,
                settings: Arc::new(settings),
                retry,
                skip_inactive: false,
            },
            workers: 1,
            dry_run: false,
            max_failure_ratio: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Number of customers migrated concurrently.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Report what would be migrated without writing anything.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Stop between batches once `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Leave customers without orders, subscriptions or revenue unmigrated.
    pub fn with_skip_inactive(mut self, skip: bool) -> Self {
        self.ctx.skip_inactive = skip;
        self
    }

    /// Stop a run when a batch's customer failure ratio exceeds `ratio`.
    pub fn with_max_failure_ratio(mut self, ratio: Option<f64>) -> Self {
        self.max_failure_ratio = ratio;
        self
    }

    /// Migrate the first `batch_size` unmigrated customers.
    pub async fn migrate_batch(&self, batch_size: usize) -> Result<MigrationBatchResult> {
        self.migrate_batch_after(None, batch_size).await
    }

    /// Migrate up to `batch_size` unmigrated customers with `source_id > after`.
    ///
    /// A systemic failure comes back as [`MigrateError::Aborted`] carrying
    /// what the batch completed before it.
    pub async fn migrate_batch_after(
        &self,
        after: Option<SourceId>,
        batch_size: usize,
    ) -> Result<MigrationBatchResult> {
        let started = Instant::now();
        let run_id = new_run_id();
        let mut result = MigrationBatchResult::new(run_id.clone());
        match self.customer_batch(&mut result, after, batch_size).await {
            Ok(()) => Ok(result),
            Err(e) => {
                let summary =
                    MigrationRunSummary::new(run_id, EntityKind::Customer, self.dry_run);
                Err(abort_run(summary, result, started, e))
            }
        }
    }

    /// Migrate batches until nothing is left, cancellation, `max_batches`,
    /// or the failure threshold.
    ///
    /// Batches advance by source-id cursor, so customers that fail and stay
    /// unmigrated are not fetched again within the same run. A systemic
    /// failure ends the run with [`MigrateError::Aborted`], whose summary
    /// still counts everything migrated up to that point.
    pub async fn run(
        &self,
        batch_size: usize,
        max_batches: Option<usize>,
    ) -> Result<MigrationRunSummary> {
        let started = Instant::now();
        let run_id = new_run_id();
        let mut summary = MigrationRunSummary::new(run_id.clone(), EntityKind::Customer, self.dry_run);
        info!(
            "Starting migration run {} (batch size {}, {} workers{})",
            run_id,
            batch_size,
            self.workers,
            if self.dry_run { ", dry run" } else { "" }
        );

        let mut after = None;
        loop {
            if let Some(reason) = self.should_stop(summary.batches, max_batches) {
                summary.stop_reason = reason;
                break;
            }

            let mut batch = MigrationBatchResult::new(run_id.clone());
            if let Err(e) = self.customer_batch(&mut batch, after, batch_size).await {
                return Err(abort_run(summary, batch, started, e));
            }
            if batch.is_empty() {
                summary.stop_reason = StopReason::Completed;
                break;
            }

            after = batch.last_source_id;
            let ratio = batch.failure_ratio();
            summary.absorb(batch);

            if let Some(max) = self.max_failure_ratio {
                if ratio > max {
                    warn!(
                        "Batch failure ratio {:.2} exceeds {:.2}, stopping run",
                        ratio, max
                    );
                    summary.stop_reason = StopReason::FailureThreshold;
                    break;
                }
            }
        }

        summary.duration_seconds = started.elapsed().as_secs_f64();
        info!(
            "Run {} finished ({:?}): {} batches, customers {} created / {} updated / {} skipped / {} failed",
            run_id,
            summary.stop_reason,
            summary.batches,
            summary.customers.created,
            summary.customers.updated,
            summary.customers.skipped,
            summary.customers.failed
        );
        Ok(summary)
    }

    /// Retry unmigrated orders or subscriptions whose customer is already linked.
    pub async fn migrate_dependents_batch(
        &self,
        kind: EntityKind,
        batch_size: usize,
    ) -> Result<MigrationBatchResult> {
        check_dependent(kind)?;
        let started = Instant::now();
        let run_id = new_run_id();
        let mut result = MigrationBatchResult::new(run_id.clone());
        match self.dependent_batch(&mut result, kind, None, batch_size).await {
            Ok(()) => Ok(result),
            Err(e) => {
                let summary = MigrationRunSummary::new(run_id, kind, self.dry_run);
                Err(abort_run(summary, result, started, e))
            }
        }
    }

    /// Cursor-driven loop over [`Migrator::migrate_dependents_batch`].
    pub async fn run_dependents(
        &self,
        kind: EntityKind,
        batch_size: usize,
        max_batches: Option<usize>,
    ) -> Result<MigrationRunSummary> {
        check_dependent(kind)?;
        let started = Instant::now();
        let run_id = new_run_id();
        let mut summary = MigrationRunSummary::new(run_id.clone(), kind, self.dry_run);

        let mut after = None;
        loop {
            if let Some(reason) = self.should_stop(summary.batches, max_batches) {
                summary.stop_reason = reason;
                break;
            }
            let mut batch = MigrationBatchResult::new(run_id.clone());
            if let Err(e) = self.dependent_batch(&mut batch, kind, after, batch_size).await {
                return Err(abort_run(summary, batch, started, e));
            }
            if batch.is_empty() {
                summary.stop_reason = StopReason::Completed;
                break;
            }
            after = batch.last_source_id;
            summary.absorb(batch);
        }

        summary.duration_seconds = started.elapsed().as_secs_f64();
        info!(
            "Dependent run {} for {} finished ({:?}) after {} batches",
            run_id, kind, summary.stop_reason, summary.batches
        );
        Ok(summary)
    }

    fn should_stop(&self, batches: usize, max_batches: Option<usize>) -> Option<StopReason> {
        if self.cancel.is_cancelled() {
            info!("Cancellation requested, stopping before next batch");
            return Some(StopReason::Cancelled);
        }
        match max_batches {
            Some(max) if batches >= max => Some(StopReason::BatchLimit),
            _ => None,
        }
    }

    /// Fill `result` with one batch of customers. On `Err` the result still
    /// holds every unit that finished.
    async fn customer_batch(
        &self,
        result: &mut MigrationBatchResult,
        after: Option<SourceId>,
        batch_size: usize,
    ) -> Result<()> {
        let records = self
            .ctx
            .store
            .fetch_unmigrated_after(EntityKind::Customer, after, batch_size)
            .await?;
        result.fetched = records.len();
        result.last_source_id = records.last().map(|r| r.source_id);
        if records.is_empty() {
            return Ok(());
        }

        if self.dry_run {
            result.customers.skipped = records.len();
            info!("Dry run: would migrate {} customers", records.len());
            return Ok(());
        }

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let abort = CancellationToken::new();
        let mut ids = Vec::with_capacity(records.len());
        let mut handles = Vec::with_capacity(records.len());

        for record in records {
            if abort.is_cancelled() {
                break;
            }
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| MigrateError::Cancelled)?;
            let ctx = self.ctx.clone();
            let abort = abort.clone();
            let source_id = record.source_id;
            let handle = tokio::spawn(async move {
                let mut report = MigrationBatchResult::default();
                let outcome = ctx.migrate_customer(record, &mut report).await;
                if outcome.is_err() {
                    abort.cancel();
                }
                drop(permit);
                (report, outcome)
            });
            ids.push(source_id);
            handles.push(handle);
        }

        let mut systemic: Option<MigrateError> = None;
        for (source_id, joined) in ids.into_iter().zip(join_all(handles).await) {
            match joined {
                Ok((report, outcome)) => {
                    result.merge(report);
                    if let Err(e) = outcome {
                        error!("Customer {}: systemic failure: {}", source_id, e);
                        systemic.get_or_insert(e);
                    }
                }
                Err(e) => {
                    error!("Customer {}: worker task failed: {}", source_id, e);
                    systemic.get_or_insert(MigrateError::Storage(format!(
                        "worker for customer {} did not complete: {}",
                        source_id, e
                    )));
                }
            }
        }
        if let Some(e) = systemic {
            return Err(e);
        }

        info!(
            "Batch {}: {} customers ({} created, {} updated, {} skipped, {} failed), {} orders, {} subscriptions",
            result.run_id,
            result.fetched,
            result.customers.created,
            result.customers.updated,
            result.customers.skipped,
            result.customers.failed,
            result.orders.total(),
            result.subscriptions.total()
        );
        Ok(())
    }

    async fn dependent_batch(
        &self,
        result: &mut MigrationBatchResult,
        kind: EntityKind,
        after: Option<SourceId>,
        batch_size: usize,
    ) -> Result<()> {
        let records = self
            .ctx
            .store
            .fetch_unmigrated_after(kind, after, batch_size)
            .await?;
        result.fetched = records.len();
        result.last_source_id = records.last().map(|r| r.source_id);

        for record in &records {
            if self.dry_run {
                result.counts_mut(kind).skipped += 1;
                continue;
            }
            let parent = match record.parent_id {
                Some(parent) => self.ctx.identity.lookup(EntityKind::Customer, parent).await?,
                None => None,
            };
            let Some(customer_dest) = parent else {
                debug!(
                    "{} {}: owning customer not migrated yet, skipping",
                    kind, record.source_id
                );
                result.counts_mut(kind).skipped += 1;
                continue;
            };
            match self.ctx.migrate_dependent(record, customer_dest).await {
                Ok(outcome) => outcome.count(result.counts_mut(kind)),
                Err(e) if e.class() == FailureClass::Systemic => return Err(e),
                Err(e) => {
                    warn!("{} {}: {}", kind, record.source_id, e);
                    self.ctx
                        .record_failure(result, kind, record.source_id, &e)
                        .await?;
                }
            }
        }

        if !records.is_empty() {
            info!(
                "Dependent batch {}: {} {} fetched, {} created, {} skipped, {} failed",
                result.run_id,
                result.fetched,
                kind.plural(),
                result.counts(kind).created,
                result.counts(kind).skipped,
                result.counts(kind).failed
            );
        }
        Ok(())
    }
}

impl UnitContext {
    /// Migrate one customer and its dependents into `report`.
    ///
    /// Record-level failures are counted and persisted; only systemic
    /// failures come back as `Err`, with `report` holding whatever the unit
    /// completed first.
    async fn migrate_customer(
        &self,
        record: StagedRecord,
        report: &mut MigrationBatchResult,
    ) -> Result<()> {
        let source_id = record.source_id;

        let orders = self.store.fetch_by_parent(EntityKind::Order, source_id).await?;
        let subscriptions = self
            .store
            .fetch_by_parent(EntityKind::Subscription, source_id)
            .await?;

        if self.skip_inactive
            && !is_active_customer(&record, !orders.is_empty(), !subscriptions.is_empty())
        {
            debug!("Customer {}: inactive, skipping", source_id);
            report.customers.skipped += 1;
            return Ok(());
        }

        let customer_dest = match self.resolve_customer(&record, &subscriptions).await {
            Ok((dest, outcome)) => {
                outcome.count(&mut report.customers);
                dest
            }
            Err(e) if e.class() == FailureClass::Systemic => return Err(e),
            Err(e) => {
                warn!("Customer {}: {}", source_id, e);
                return self
                    .record_failure(report, EntityKind::Customer, source_id, &e)
                    .await;
            }
        };

        for dependent in orders.iter().chain(subscriptions.iter()) {
            let kind = dependent.kind;
            if dependent.migrated {
                report.counts_mut(kind).skipped += 1;
                continue;
            }
            match self.migrate_dependent(dependent, customer_dest).await {
                Ok(outcome) => outcome.count(report.counts_mut(kind)),
                Err(e) if e.class() == FailureClass::Systemic => return Err(e),
                Err(e) => {
                    warn!("{} {} (customer {}): {}", kind, dependent.source_id, source_id, e);
                    self.record_failure(report, kind, dependent.source_id, &e)
                        .await?;
                }
            }
        }

        self.store
            .mark_migrated(EntityKind::Customer, &[source_id])
            .await?;
        debug!("Customer {} migrated as {}", source_id, customer_dest);
        Ok(())
    }

    /// Count a record failure and keep it in the staging store until the
    /// record migrates.
    async fn record_failure(
        &self,
        report: &mut MigrationBatchResult,
        kind: EntityKind,
        source_id: SourceId,
        error: &MigrateError,
    ) -> Result<()> {
        let failure = report.record_failure(kind, source_id, error);
        self.store.record_failure(failure).await
    }

    /// Destination id for a customer, creating it only when neither a link
    /// nor a previously created entity exists.
    async fn resolve_customer(
        &self,
        record: &StagedRecord,
        subscriptions: &[StagedRecord],
    ) -> Result<(DestinationId, Outcome)> {
        let source_id = record.source_id;
        let request = map_customer(record, subscriptions, &self.settings)?;
        let destination = &self.destination;

        if let Some(dest) = self.identity.lookup(EntityKind::Customer, source_id).await? {
            let operation = format!("update customer {}", source_id);
            self.retry
                .run(&operation, || destination.update_customer(dest, &request))
                .await?;
            return Ok((dest, Outcome::Updated));
        }

        let external_ref = self.settings.external_ref(EntityKind::Customer, source_id);
        let operation = format!("find customer {}", external_ref);
        let found = self
            .retry
            .run(&operation, || destination.find_customer_by_ref(&external_ref))
            .await?;

        let (dest, outcome) = match found {
            Some(dest) => {
                info!(
                    "Customer {}: adopting unlinked destination customer {}",
                    source_id, dest
                );
                (dest, Outcome::Updated)
            }
            None => {
                let operation = format!("create customer {}", source_id);
                let dest = self
                    .retry
                    .run(&operation, || destination.create_customer(&request))
                    .await?;
                (dest, Outcome::Created)
            }
        };

        self.identity
            .create(EntityKind::Customer, source_id, dest)
            .await?;
        Ok((dest, outcome))
    }

    /// Migrate one order or subscription under an already-resolved customer.
    async fn migrate_dependent(
        &self,
        record: &StagedRecord,
        customer_dest: DestinationId,
    ) -> Result<Outcome> {
        let kind = record.kind;
        let source_id = record.source_id;

        if self.identity.lookup(kind, source_id).await?.is_some() {
            self.store.mark_migrated(kind, &[source_id]).await?;
            return Ok(Outcome::Skipped);
        }

        let destination = &self.destination;
        let (dest, outcome) = match kind {
            EntityKind::Order => {
                let request = map_order(record, &self.settings)?;
                let external_ref = self.settings.external_ref(kind, source_id);
                let found = self
                    .retry
                    .run(&format!("find order {}", external_ref), || {
                        destination.find_order_by_ref(customer_dest, &external_ref)
                    })
                    .await?;
                match found {
                    Some(dest) => (dest, Outcome::Updated),
                    None => {
                        let dest = self
                            .retry
                            .run(&format!("create order {}", source_id), || {
                                destination.create_order(customer_dest, &request)
                            })
                            .await?;
                        (dest, Outcome::Created)
                    }
                }
            }
            EntityKind::Subscription => {
                let request = map_subscription_record(record, &self.settings)?;
                let namespace = &request.metafield.namespace;
                let key = &request.metafield.key;
                let found = self
                    .retry
                    .run(&format!("find subscription record {}", source_id), || {
                        destination.find_subscription_record(customer_dest, namespace, key)
                    })
                    .await?;
                match found {
                    Some(dest) => (dest, Outcome::Updated),
                    None => {
                        let dest = self
                            .retry
                            .run(&format!("create subscription record {}", source_id), || {
                                destination.create_subscription_record(customer_dest, &request)
                            })
                            .await?;
                        (dest, Outcome::Created)
                    }
                }
            }
            EntityKind::Customer => {
                return Err(MigrateError::invalid_payload(
                    kind,
                    "customers are migrated as units, not as dependents",
                ))
            }
        };

        self.identity.create(kind, source_id, dest).await?;
        self.store.mark_migrated(kind, &[source_id]).await?;
        debug!("{} {} migrated as {}", kind, source_id, dest);
        Ok(outcome)
    }
}

fn new_run_id() -> String {
    Uuid::new_v4().to_string()
}

fn check_dependent(kind: EntityKind) -> Result<()> {
    if kind.is_dependent() {
        return Ok(());
    }
    Err(MigrateError::Config(format!(
        "{} records are not dependents; use migrate instead",
        kind
    )))
}

/// Fold the interrupted batch into `summary` and wrap the systemic failure.
fn abort_run(
    mut summary: MigrationRunSummary,
    partial: MigrationBatchResult,
    started: Instant,
    error: MigrateError,
) -> MigrateError {
    if !partial.is_empty() {
        summary.absorb(partial);
    }
    summary.stop_reason = StopReason::Aborted;
    summary.duration_seconds = started.elapsed().as_secs_f64();
    error!(
        "Run {} aborted after {} batches ({} customers created, {} failed): {}",
        summary.run_id,
        summary.batches,
        summary.customers.created,
        summary.failed(),
        error
    );
    MigrateError::aborted(summary, error)
}
