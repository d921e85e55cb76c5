//! Read-only reconciliation of the staging store against the source.
//!
//! Page-based collection can miss records when the source shifts page
//! contents under concurrent inserts. The auditor compares totals, can
//! re-read a page interval to list the ids that never reached staging, and
//! can scan the staged ids for suspicious holes without touching the source.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{MigrateError, Result};
use crate::model::{extract_id, CollectionProgress, EntityKind, IdGap, RawRecord, SourceId};
use crate::retry::RetryPolicy;
use crate::source::SourceApi;
use crate::store::StagingStore;

/// Source-reported total versus staged count for one kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub kind: EntityKind,
    pub source_reported: Option<u64>,
    pub staged: i64,
    /// `source_reported - staged`; positive means records are missing.
    pub difference: Option<i64>,
    pub progress: Option<CollectionProgress>,
}

impl ReconciliationReport {
    /// True when the source reported a total and staging holds at least that many.
    pub fn is_complete(&self) -> bool {
        matches!(self.difference, Some(d) if d <= 0)
    }
}

/// Result of re-reading one page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageAudit {
    pub page: i64,
    pub api_count: usize,
    pub missing: usize,
}

/// Result of re-reading a page interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageAuditReport {
    pub kind: EntityKind,
    pub start_page: i64,
    pub end_page: i64,
    pub pages: Vec<PageAudit>,
    pub missing_ids: Vec<SourceId>,
    pub api_errors: Vec<String>,
    /// Raw payloads of the missing records, for restaging.
    #[serde(skip)]
    pub missing_records: Vec<RawRecord>,
}

/// Smallest jump between consecutive staged ids reported by default.
pub const DEFAULT_GAP_THRESHOLD: i64 = 1000;

/// Holes in the staged id sequence of one kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdGapReport {
    pub kind: EntityKind,
    pub staged: i64,
    pub min_id: Option<SourceId>,
    pub max_id: Option<SourceId>,
    pub threshold: i64,
    /// Ids between `min_id` and `max_id` that are not staged, over all holes.
    pub missing_in_span: i64,
    /// Holes where consecutive staged ids jump by more than `threshold`.
    pub gaps: Vec<IdGap>,
}

impl IdGapReport {
    pub fn has_gaps(&self) -> bool {
        !self.gaps.is_empty()
    }
}

pub struct Auditor {
    source: Arc<dyn SourceApi>,
    store: Arc<dyn StagingStore>,
    retry: RetryPolicy,
}

impl Auditor {
    pub fn new(source: Arc<dyn SourceApi>, store: Arc<dyn StagingStore>, retry: RetryPolicy) -> Self {
        Self {
            source,
            store,
            retry,
        }
    }

    /// Compare the source-reported total with what is staged.
    pub async fn reconcile(&self, kind: EntityKind) -> Result<ReconciliationReport> {
        let source = self.source.clone();
        let source_reported = self
            .retry
            .run(&format!("count {}", kind.plural()), move || {
                let source = source.clone();
                async move { source.reported_total(kind).await }
            })
            .await?;
        let staged = self.store.count_staged(kind).await?;
        let progress = self.store.load_progress(kind).await?;

        let difference = source_reported.map(|total| total as i64 - staged);
        match difference {
            Some(d) if d > 0 => warn!(
                "{}: source reports {} records, {} staged ({} missing)",
                kind,
                source_reported.unwrap_or_default(),
                staged,
                d
            ),
            Some(_) => info!("{}: {} staged, source total matched", kind, staged),
            None => warn!("{}: source did not report a total ({} staged)", kind, staged),
        }

        Ok(ReconciliationReport {
            kind,
            source_reported,
            staged,
            difference,
            progress,
        })
    }

    /// Re-read pages `start_page..=end_page` and list ids absent from staging.
    ///
    /// Pages that fail after retries are reported in `api_errors`; the
    /// audit carries on with the next page. Collection progress is never
    /// touched.
    pub async fn audit_pages(
        &self,
        kind: EntityKind,
        start_page: i64,
        end_page: i64,
        page_size: usize,
    ) -> Result<PageAuditReport> {
        if start_page < 1 || end_page < start_page {
            return Err(MigrateError::Config(format!(
                "invalid page interval {}..{}",
                start_page, end_page
            )));
        }
        if page_size == 0 {
            return Err(MigrateError::Config("page size must be at least 1".into()));
        }

        let mut report = PageAuditReport {
            kind,
            start_page,
            end_page,
            pages: Vec::new(),
            missing_ids: Vec::new(),
            api_errors: Vec::new(),
            missing_records: Vec::new(),
        };

        for page in start_page..=end_page {
            let source = self.source.clone();
            let fetched = self
                .retry
                .run(&format!("audit {} page {}", kind.plural(), page), move || {
                    let source = source.clone();
                    async move { source.list_page(kind, page, page_size).await }
                })
                .await;

            let records = match fetched {
                Ok(page_data) => page_data.records,
                Err(e) => {
                    warn!("{}: audit of page {} failed: {}", kind, page, e);
                    report.api_errors.push(format!("page {}: {}", page, e));
                    continue;
                }
            };

            let mut missing = 0;
            for raw in &records {
                let Some(id) = extract_id(raw, "id") else {
                    continue;
                };
                if self.store.get(kind, id).await?.is_none() {
                    missing += 1;
                    report.missing_ids.push(id);
                    report.missing_records.push(raw.clone());
                }
            }

            info!(
                "{}: audit page {} returned {} records, {} not staged",
                kind,
                page,
                records.len(),
                missing
            );
            report.pages.push(PageAudit {
                page,
                api_count: records.len(),
                missing,
            });
        }

        report.missing_ids.sort_unstable();
        report.missing_ids.dedup();
        Ok(report)
    }
    /// Find jumps wider than `threshold` between consecutive staged ids.
    ///
    /// Reads staging only. Source ids are assigned sequentially, so a wide
    /// jump usually marks a page range the forward run skipped.
    pub async fn id_gaps(&self, kind: EntityKind, threshold: i64) -> Result<IdGapReport> {
        if threshold < 1 {
            return Err(MigrateError::Config(format!(
                "gap threshold must be at least 1, got {}",
                threshold
            )));
        }

        let staged = self.store.count_staged(kind).await?;
        let range = self.store.id_range(kind).await?;
        let gaps = self.store.id_gaps(kind, threshold).await?;
        let missing_in_span = range
            .map(|(min, max)| max - min + 1 - staged)
            .unwrap_or(0);

        if gaps.is_empty() {
            info!(
                "{}: {} staged, no id jumps above {} ({} ids missing inside the span)",
                kind, staged, threshold, missing_in_span
            );
        } else {
            for gap in &gaps {
                warn!(
                    "{}: no records staged between {} and {} ({} ids)",
                    kind, gap.after, gap.before, gap.missing
                );
            }
        }

        Ok(IdGapReport {
            kind,
            staged,
            min_id: range.map(|(min, _)| min),
            max_id: range.map(|(_, max)| max),
            threshold,
            missing_in_span,
            gaps,
        })
    }
}
