//! # commerce-migrate
//!
//! Two-phase migration engine for moving a storefront's customers, orders
//! and subscriptions from one commerce platform to another.
//!
//! - **Collection** pages through the source API into a durable staging
//!   store, committing each page together with its progress checkpoint so
//!   an interrupted run resumes exactly where it stopped
//! - **Migration** replays staged customers onto the destination as units
//!   (customer, then its orders and subscriptions), recording identity links
//!   so re-runs never create duplicates
//! - **Auditing** reconciles staged counts against the source, re-reads
//!   page intervals to find records the forward run missed, and flags wide
//!   holes in the staged id sequence
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use commerce_migrate::{
//!     open_store, Collector, Config, EntityKind, MapperSettings, Migrator,
//!     RestDestinationClient, RestSourceClient, RetryPolicy,
//! };
//!
//! #[tokio::main]
//! async fn main() -> commerce_migrate::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let store = open_store(&config.staging).await?;
//!     store.init_schema().await?;
//!     let retry = RetryPolicy::from_config(&config.retry);
//!
//!     let source = Arc::new(RestSourceClient::new(&config.source, &config.retry)?);
//!     let collector = Collector::new(source, store.clone(), retry.clone());
//!     collector.collect(EntityKind::Customer, 1000, None).await?;
//!
//!     let destination = Arc::new(RestDestinationClient::new(&config.destination, &config.retry)?);
//!     let migrator = Migrator::new(
//!         store,
//!         destination,
//!         MapperSettings::from_config(&config.migration),
//!         retry,
//!     );
//!     let summary = migrator.run(50, None).await?;
//!     println!("Created {} customers", summary.customers.created);
//!     Ok(())
//! }
//! ```

pub mod audit;
pub mod collector;
pub mod config;
pub mod destination;
pub mod error;
mod http;
pub mod identity;
pub mod mapper;
pub mod migrator;
pub mod model;
pub mod ratelimit;
pub mod retry;
pub mod source;
pub mod store;

// Re-exports for convenient access
pub use audit::{Auditor, IdGapReport, PageAudit, PageAuditReport, ReconciliationReport};
pub use collector::Collector;
pub use config::{Config, MigrationConfig, StagingBackendKind, StagingConfig};
pub use destination::{DestinationApi, RestDestinationClient};
pub use error::{FailureClass, MigrateError, Result};
pub use identity::IdentityMapper;
pub use mapper::MapperSettings;
pub use migrator::{MigrationRunSummary, Migrator, StopReason};
pub use model::{
    CollectionProgress, CollectionSummary, EntityKind, IdGap, IdentityLink, MigrationBatchResult,
    RecordCounts, RecordFailure, StagedRecord, StagingStats,
};
pub use retry::RetryPolicy;
pub use source::{RestSourceClient, SourceApi, SourcePage};
pub use store::{open_store, PgStagingStore, SqliteStagingStore, StagingStore};
