//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::error::Result;
use std::path::Path;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }
}

impl StagingConfig {
    /// Build a connection string for tokio-postgres.
    pub fn connection_string(&self) -> String {
        format!(
            "host={} port={} dbname={} user={} password={} sslmode={}",
            self.host, self.port, self.database, self.user, self.password, self.ssl_mode
        )
    }
}

impl DestinationConfig {
    /// Admin REST API root for this shop.
    pub fn admin_base_url(&self) -> String {
        let domain = self
            .shop_domain
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/');
        format!("https://{}/admin/api/{}", domain, self.api_version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
source:
  base_url: https://api.example.com/v1
  api_key: key
  api_secret: secret
destination:
  shop_domain: example.myshopify.com
  access_token: shpat_123
"#;

    #[test]
    fn test_defaults_applied() {
        let config = Config::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.source.page_base, 0);
        assert_eq!(config.source.requests_per_second, 2.0);
        assert_eq!(config.destination.api_version, "2023-10");
        assert_eq!(config.staging.backend, StagingBackendKind::Sqlite);
        assert_eq!(config.staging.path, "staging.db");
        assert_eq!(config.collection.batch_size, 1000);
        assert_eq!(config.migration.batch_size, 50);
        assert_eq!(config.migration.workers, 4);
        assert_eq!(config.migration.provenance_tag, "cj-import");
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.request_timeout().as_secs(), 30);
    }

    #[test]
    fn test_postgres_staging_parsed() {
        let yaml = format!(
            "{}staging:\n  backend: postgres\n  host: db\n  database: staging\n  user: migrate\n  password: pw\n",
            MINIMAL
        );
        let config = Config::from_yaml(&yaml).unwrap();
        assert_eq!(config.staging.backend, StagingBackendKind::Postgres);
        assert!(config
            .staging
            .connection_string()
            .contains("dbname=staging"));
    }

    #[test]
    fn test_invalid_yaml_rejected() {
        assert!(Config::from_yaml("source: [").is_err());
    }

    #[test]
    fn test_admin_base_url() {
        let config = Config::from_yaml(MINIMAL).unwrap();
        assert_eq!(
            config.destination.admin_base_url(),
            "https://example.myshopify.com/admin/api/2023-10"
        );
    }
}
