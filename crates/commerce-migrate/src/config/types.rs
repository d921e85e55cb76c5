//! Configuration type definitions.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Source platform API.
    pub source: SourceConfig,

    /// Destination platform API.
    pub destination: DestinationConfig,

    /// Local staging store.
    #[serde(default)]
    pub staging: StagingConfig,

    /// Phase 1 behavior.
    #[serde(default)]
    pub collection: CollectionConfig,

    /// Phase 2 behavior.
    #[serde(default)]
    pub migration: MigrationConfig,

    /// Retry and timeout policy shared by both phases.
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Source platform (page-based REST API) configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// API base URL, e.g. `https://api.cratejoy.com/v1`.
    pub base_url: String,

    /// Basic auth user.
    #[serde(default)]
    pub api_key: String,

    /// Basic auth password.
    #[serde(default)]
    pub api_secret: String,

    /// Index of the first page as understood by the API (default: 0).
    #[serde(default)]
    pub page_base: i64,

    /// Request rate ceiling; 0 disables throttling (default: 2.0).
    #[serde(default = "default_rps")]
    pub requests_per_second: f64,
}

impl fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key)
            .field("api_secret", &"[REDACTED]")
            .field("page_base", &self.page_base)
            .field("requests_per_second", &self.requests_per_second)
            .finish()
    }
}

/// Destination platform (Admin REST API) configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    /// Shop domain, e.g. `example.myshopify.com`.
    pub shop_domain: String,

    /// Admin API access token.
    #[serde(default)]
    pub access_token: String,

    /// Admin API version (default: "2023-10").
    #[serde(default = "default_api_version")]
    pub api_version: String,

    /// Request rate ceiling; 0 disables throttling (default: 2.0).
    #[serde(default = "default_rps")]
    pub requests_per_second: f64,
}

impl fmt::Debug for DestinationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DestinationConfig")
            .field("shop_domain", &self.shop_domain)
            .field("access_token", &"[REDACTED]")
            .field("api_version", &self.api_version)
            .field("requests_per_second", &self.requests_per_second)
            .finish()
    }
}

/// Staging store backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagingBackendKind {
    /// Local SQLite file.
    #[default]
    Sqlite,

    /// PostgreSQL database.
    Postgres,
}

/// Staging store configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct StagingConfig {
    #[serde(default)]
    pub backend: StagingBackendKind,

    /// SQLite database file (default: "staging.db").
    #[serde(default = "default_staging_path")]
    pub path: String,

    #[serde(default)]
    pub host: String,

    /// Database port (default: 5432).
    #[serde(default = "default_pg_port")]
    pub port: u16,

    #[serde(default)]
    pub database: String,

    #[serde(default)]
    pub user: String,

    #[serde(default)]
    pub password: String,

    /// Schema holding the staging tables (default: "public").
    #[serde(default = "default_public_schema")]
    pub schema: String,

    /// SSL mode (default: "prefer").
    #[serde(default = "default_prefer")]
    pub ssl_mode: String,

    /// Pool size (default: 8).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            backend: StagingBackendKind::default(),
            path: default_staging_path(),
            host: String::new(),
            port: default_pg_port(),
            database: String::new(),
            user: String::new(),
            password: String::new(),
            schema: default_public_schema(),
            ssl_mode: default_prefer(),
            max_connections: default_max_connections(),
        }
    }
}

impl fmt::Debug for StagingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StagingConfig")
            .field("backend", &self.backend)
            .field("path", &self.path)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("schema", &self.schema)
            .field("ssl_mode", &self.ssl_mode)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

/// Phase 1 (collection) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionConfig {
    /// Records requested per page (default: 1000).
    #[serde(default = "default_collection_batch")]
    pub batch_size: usize,

    /// Maximum pages fetched per invocation. Unbounded if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_limit: Option<u32>,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            batch_size: default_collection_batch(),
            page_limit: None,
        }
    }
}

/// Phase 2 (migration) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Customers per batch (default: 50).
    #[serde(default = "default_migration_batch")]
    pub batch_size: usize,

    /// Customers migrated concurrently (default: 4).
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Tag applied to every destination entity this tool creates (default: "cj-import").
    #[serde(default = "default_provenance_tag")]
    pub provenance_tag: String,

    /// Metafield namespace (default: "migration").
    #[serde(default = "default_metafield_namespace")]
    pub metafield_namespace: String,

    /// Metafield key holding customer subscription history (default: "subscription_history").
    #[serde(default = "default_metafield_key")]
    pub metafield_key: String,

    /// Leave customers without orders, subscriptions or revenue unmigrated.
    #[serde(default)]
    pub skip_inactive_customers: bool,

    /// Stop a run once a batch's customer failure share exceeds this value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_failure_ratio: Option<f64>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            batch_size: default_migration_batch(),
            workers: default_workers(),
            provenance_tag: default_provenance_tag(),
            metafield_namespace: default_metafield_namespace(),
            metafield_key: default_metafield_key(),
            skip_inactive_customers: false,
            max_failure_ratio: None,
        }
    }
}

/// Retry and timeout configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts per external call, including the first (default: 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First backoff delay in milliseconds (default: 500).
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Backoff ceiling in milliseconds (default: 30000).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Per-call timeout in seconds (default: 30).
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

// Default value functions for serde
fn default_rps() -> f64 {
    2.0
}

fn default_api_version() -> String {
    "2023-10".to_string()
}

fn default_staging_path() -> String {
    "staging.db".to_string()
}

fn default_pg_port() -> u16 {
    5432
}

fn default_public_schema() -> String {
    "public".to_string()
}

fn default_prefer() -> String {
    "prefer".to_string()
}

fn default_max_connections() -> usize {
    8
}

fn default_collection_batch() -> usize {
    1000
}

fn default_migration_batch() -> usize {
    50
}

fn default_workers() -> usize {
    4
}

fn default_provenance_tag() -> String {
    "cj-import".to_string()
}

fn default_metafield_namespace() -> String {
    "migration".to_string()
}

fn default_metafield_key() -> String {
    "subscription_history".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_request_timeout_secs() -> u64 {
    30
}
