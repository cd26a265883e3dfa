//! Configuration for the tenant store
//!
//! `ConnectionConfig` mirrors the `postgres-conf.json` resource. `PersistConfig`
//! bundles it with the module-level settings and is assembled with a builder.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};

use crate::error::{PersistError, Result};

/// Default location of the connection configuration resource
pub const DEFAULT_CONFIG_PATH: &str = "postgres-conf.json";

/// Port used by the embedded/test database when no configuration exists
pub const EMBEDDED_POSTGRES_PORT: u16 = 6000;

/// Delete template run on tenant teardown. `myuniversity` and `mymodule` are
/// replaced literally with the tenant schema and the module name.
pub const DEFAULT_DELETE_TEMPLATE: &str = include_str!("templates/delete_tenant.sql");

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5432
}

fn default_database() -> String {
    "postgres".to_string()
}

fn default_pool_size() -> u32 {
    5
}

fn default_connection_timeout() -> u64 {
    10_000
}

/// Database connection settings
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_database")]
    pub database: String,
    pub username: String,
    pub password: String,
    /// Maximum connections per tenant pool
    #[serde(rename = "maxPoolSize", default = "default_pool_size")]
    pub max_pool_size: u32,
    /// Pool acquire timeout in milliseconds
    #[serde(rename = "connectionTimeout", default = "default_connection_timeout")]
    pub connection_timeout_ms: u64,
    /// Idle connection timeout in milliseconds
    #[serde(rename = "idleTimeout", default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_ms: Option<u64>,
}

// Credentials never reach the logs.
impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"***")
            .field("max_pool_size", &self.max_pool_size)
            .field("connection_timeout_ms", &self.connection_timeout_ms)
            .field("idle_timeout_ms", &self.idle_timeout_ms)
            .finish()
    }
}

impl ConnectionConfig {
    /// Settings used in embedded/test mode when no configuration file exists
    pub fn embedded_defaults() -> Self {
        Self {
            host: default_host(),
            port: EMBEDDED_POSTGRES_PORT,
            database: default_database(),
            username: "username".to_string(),
            password: "password".to_string(),
            max_pool_size: default_pool_size(),
            connection_timeout_ms: default_connection_timeout(),
            idle_timeout_ms: None,
        }
    }

    /// Parse a configuration document
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| PersistError::configuration(format!("Invalid connection configuration: {}", e)))
    }

    /// Load the configuration file at `path`
    ///
    /// Returns `Ok(None)` when the file does not exist; a file that exists but
    /// cannot be read or parsed is a configuration error.
    pub fn load(path: impl AsRef<Path>) -> Result<Option<Self>> {
        let path = path.as_ref();
        log::info!("Loading PostgreSQL configuration from {}", path.display());

        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_json(&contents).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PersistError::configuration(format!(
                "Unable to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Override fields from `DB_*` variables provided by `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("DB_HOST") {
            self.host = host;
        }
        if let Some(port) = lookup("DB_PORT") {
            self.port = port
                .parse()
                .map_err(|_| PersistError::configuration(format!("DB_PORT is not a port: {}", port)))?;
        }
        if let Some(database) = lookup("DB_DATABASE") {
            self.database = database;
        }
        if let Some(username) = lookup("DB_USERNAME") {
            self.username = username;
        }
        if let Some(password) = lookup("DB_PASSWORD") {
            self.password = password;
        }
        if let Some(size) = lookup("DB_MAXPOOLSIZE") {
            self.max_pool_size = size.parse().map_err(|_| {
                PersistError::configuration(format!("DB_MAXPOOLSIZE is not a number: {}", size))
            })?;
        }
        Ok(())
    }

    /// Override fields from the process environment
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Same settings with different credentials
    pub fn with_credentials(&self, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            ..self.clone()
        }
    }

    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.database)
            .username(&self.username)
            .password(&self.password)
    }

    pub fn pool_options(&self) -> PgPoolOptions {
        PgPoolOptions::new()
            .max_connections(self.max_pool_size)
            .acquire_timeout(Duration::from_millis(self.connection_timeout_ms))
            .idle_timeout(self.idle_timeout_ms.map(Duration::from_millis))
    }
}

/// Configuration for the tenant store
#[derive(Debug, Clone)]
pub struct PersistConfig {
    /// Connection settings, `None` when no configuration resource was found
    pub connection: Option<ConnectionConfig>,
    /// Embedded/test mode: fall back to built-in connection defaults
    pub embedded: bool,
    /// Name of the module owning the tenant tables
    pub module_name: String,
    /// Directory holding `templates/db_scripts/create_table.json` and `create_view.json`
    pub resources_root: PathBuf,
    /// Script run on tenant deletion
    pub delete_template: String,
}

impl PersistConfig {
    /// Create a new configuration builder
    pub fn builder(module_name: impl Into<String>) -> PersistConfigBuilder {
        PersistConfigBuilder::new(module_name)
    }

    /// Connection settings to use, honoring embedded mode
    pub fn resolve_connection(&self) -> Result<ConnectionConfig> {
        match (&self.connection, self.embedded) {
            (Some(connection), _) => Ok(connection.clone()),
            (None, true) => Ok(ConnectionConfig::embedded_defaults()),
            (None, false) => Err(PersistError::configuration(format!(
                "No {} found and not in embedded mode, can not connect to any database",
                DEFAULT_CONFIG_PATH
            ))),
        }
    }
}

/// Builder for PersistConfig
#[derive(Debug)]
pub struct PersistConfigBuilder {
    connection: Option<ConnectionConfig>,
    embedded: bool,
    module_name: String,
    resources_root: PathBuf,
    delete_template: String,
}

impl PersistConfigBuilder {
    pub fn new(module_name: impl Into<String>) -> Self {
        Self {
            connection: None,
            embedded: false,
            module_name: module_name.into(),
            resources_root: PathBuf::from("."),
            delete_template: DEFAULT_DELETE_TEMPLATE.to_string(),
        }
    }

    /// Set the connection settings
    pub fn connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = Some(connection);
        self
    }

    /// Load connection settings from a JSON file; a missing file leaves them unset
    pub fn config_file(mut self, path: impl AsRef<Path>) -> Result<Self> {
        self.connection = ConnectionConfig::load(path)?;
        Ok(self)
    }

    /// Enable or disable embedded/test mode (default: false)
    pub fn embedded(mut self, enabled: bool) -> Self {
        self.embedded = enabled;
        self
    }

    /// Set the directory descriptor resources are read from (default: ".")
    pub fn resources_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.resources_root = root.into();
        self
    }

    /// Replace the tenant delete template
    pub fn delete_template(mut self, template: impl Into<String>) -> Self {
        self.delete_template = template.into();
        self
    }

    pub fn build(self) -> PersistConfig {
        PersistConfig {
            connection: self.connection,
            embedded: self.embedded,
            module_name: self.module_name,
            resources_root: self.resources_root,
            delete_template: self.delete_template,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn sample() -> ConnectionConfig {
        ConnectionConfig::from_json(
            r#"{
                "host": "db.internal",
                "port": 5433,
                "database": "okapi",
                "username": "folio_admin",
                "password": "secret",
                "maxPoolSize": 8
            }"#,
        )
        .unwrap()
    }

    // =========================================================================
    // ConnectionConfig Tests
    // =========================================================================

    #[test]
    fn test_parse_full_config() {
        let config = sample();
        assert_eq!(config.host, "db.internal");
        assert_eq!(config.port, 5433);
        assert_eq!(config.database, "okapi");
        assert_eq!(config.username, "folio_admin");
        assert_eq!(config.password, "secret");
        assert_eq!(config.max_pool_size, 8);
        assert_eq!(config.connection_timeout_ms, 10_000);
        assert!(config.idle_timeout_ms.is_none());
    }

    #[test]
    fn test_parse_applies_defaults() {
        let config =
            ConnectionConfig::from_json(r#"{"username": "u", "password": "p"}"#).unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 5432);
        assert_eq!(config.database, "postgres");
        assert_eq!(config.max_pool_size, 5);
    }

    #[test]
    fn test_parse_rejects_missing_credentials() {
        let result = ConnectionConfig::from_json(r#"{"host": "x"}"#);
        assert!(matches!(result, Err(PersistError::Configuration(_))));
    }

    #[test]
    fn test_load_missing_file_is_none() {
        let result = ConnectionConfig::load("/definitely/not/here/postgres-conf.json").unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_debug_hides_password() {
        let debug_str = format!("{:?}", sample());
        assert!(debug_str.contains("folio_admin"));
        assert!(!debug_str.contains("secret"));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [("DB_HOST", "override"), ("DB_PORT", "7000")]
            .into_iter()
            .collect();
        let mut config = sample();
        config
            .apply_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.host, "override");
        assert_eq!(config.port, 7000);
        assert_eq!(config.database, "okapi");
    }

    #[test]
    fn test_env_override_bad_port() {
        let mut config = sample();
        let result = config.apply_overrides(|key| (key == "DB_PORT").then(|| "abc".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn test_with_credentials_keeps_endpoint() {
        let tenant = sample().with_credentials("test_lib", "test_lib");
        assert_eq!(tenant.host, "db.internal");
        assert_eq!(tenant.username, "test_lib");
        assert_eq!(tenant.password, "test_lib");
    }

    // =========================================================================
    // PersistConfig Tests
    // =========================================================================

    #[test]
    fn test_resolve_without_config_fails() {
        let config = PersistConfig::builder("mod-items").build();
        assert!(matches!(
            config.resolve_connection(),
            Err(PersistError::Configuration(_))
        ));
    }

    #[test]
    fn test_resolve_embedded_defaults() {
        let config = PersistConfig::builder("mod-items").embedded(true).build();
        let connection = config.resolve_connection().unwrap();
        assert_eq!(connection.port, EMBEDDED_POSTGRES_PORT);
        assert_eq!(connection.username, "username");
    }

    #[test]
    fn test_explicit_connection_wins_over_embedded() {
        let config = PersistConfig::builder("mod-items")
            .embedded(true)
            .connection(sample())
            .build();
        assert_eq!(config.resolve_connection().unwrap().host, "db.internal");
    }

    #[test]
    fn test_default_delete_template_has_placeholders() {
        let config = PersistConfig::builder("mod-items").build();
        assert!(config.delete_template.contains("myuniversity"));
        assert_eq!(config.module_name, "mod-items");
        assert_eq!(config.resources_root, PathBuf::from("."));
    }
}
