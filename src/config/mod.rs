use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::error::DbError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub environment: Environment,
    pub database: DatabaseConfig,
    pub middleware: MiddlewareConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Environment {
    Development,
    Staging,
    Production,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
    /// Seconds to wait when acquiring a pooled connection
    pub connection_timeout: u64,
}

/// Which built-in handlers `install_defaults` registers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiddlewareConfig {
    pub query_logging: bool,
    pub slow_query_warning: bool,
    pub slow_query_threshold_ms: u64,
    pub read_only: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the config from an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let environment = match lookup("SQLM_ENV").as_deref() {
            Some("production") | Some("prod") => Environment::Production,
            Some("staging") | Some("stage") => Environment::Staging,
            _ => Environment::Development,
        };

        // Set defaults based on environment, then override with specific env vars
        Self::preset(environment).with_overrides(lookup)
    }

    pub fn preset(environment: Environment) -> Self {
        match environment {
            Environment::Production => Self::production(),
            Environment::Staging => Self::staging(),
            Environment::Development => Self::development(),
        }
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        // Database overrides
        if let Some(v) = lookup("DATABASE_URL") {
            self.database.url = Some(v).filter(|url| !url.is_empty());
        }
        if let Some(v) = lookup("DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = v.parse().unwrap_or(self.database.max_connections);
        }
        if let Some(v) = lookup("DATABASE_CONNECTION_TIMEOUT") {
            self.database.connection_timeout = v.parse().unwrap_or(self.database.connection_timeout);
        }

        // Middleware overrides
        if let Some(v) = lookup("SQLM_QUERY_LOGGING") {
            self.middleware.query_logging = v.parse().unwrap_or(self.middleware.query_logging);
        }
        if let Some(v) = lookup("SQLM_SLOW_QUERY_WARNING") {
            self.middleware.slow_query_warning = v.parse().unwrap_or(self.middleware.slow_query_warning);
        }
        if let Some(v) = lookup("SQLM_SLOW_QUERY_THRESHOLD_MS") {
            self.middleware.slow_query_threshold_ms =
                v.parse().unwrap_or(self.middleware.slow_query_threshold_ms);
        }
        if let Some(v) = lookup("SQLM_READ_ONLY") {
            self.middleware.read_only = v.parse().unwrap_or(self.middleware.read_only);
        }

        self
    }

    fn development() -> Self {
        Self {
            environment: Environment::Development,
            database: DatabaseConfig {
                url: None,
                max_connections: 10,
                connection_timeout: 30,
            },
            middleware: MiddlewareConfig {
                query_logging: true,
                slow_query_warning: true,
                slow_query_threshold_ms: 100,
                read_only: false,
            },
        }
    }

    fn staging() -> Self {
        Self {
            environment: Environment::Staging,
            database: DatabaseConfig {
                url: None,
                max_connections: 20,
                connection_timeout: 10,
            },
            middleware: MiddlewareConfig {
                query_logging: true,
                slow_query_warning: true,
                slow_query_threshold_ms: 500,
                read_only: false,
            },
        }
    }

    fn production() -> Self {
        Self {
            environment: Environment::Production,
            database: DatabaseConfig {
                url: None,
                max_connections: 50,
                connection_timeout: 5,
            },
            middleware: MiddlewareConfig {
                query_logging: false,
                slow_query_warning: true,
                slow_query_threshold_ms: 1000,
                read_only: false,
            },
        }
    }
}

impl DatabaseConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout)
    }

    /// The configured URL, validated
    pub fn require_url(&self) -> Result<&str, DbError> {
        let url = self.url.as_deref().ok_or(DbError::ConfigMissing("DATABASE_URL"))?;
        validate_url(url)?;
        Ok(url)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        AppConfig::development().database
    }
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        AppConfig::development().middleware
    }
}

/// Reject anything that is not a postgres:// or postgresql:// URL
pub fn validate_url(database_url: &str) -> Result<url::Url, DbError> {
    let url = url::Url::parse(database_url).map_err(|_| DbError::InvalidDatabaseUrl)?;
    match url.scheme() {
        "postgres" | "postgresql" => Ok(url),
        _ => Err(DbError::InvalidDatabaseUrl),
    }
}

/// Database URL with any password masked, for logs
pub fn redact_url(database_url: &str) -> String {
    match url::Url::parse(database_url) {
        Ok(mut url) => {
            if url.password().is_some() {
                // Only fails for cannot-be-a-base URLs, which have no password
                let _ = url.set_password(Some("***"));
            }
            url.to_string()
        }
        Err(_) => "<invalid url>".to_string(),
    }
}

// Global singleton config - initialized once at startup
pub static CONFIG: Lazy<AppConfig> = Lazy::new(AppConfig::from_env);

// Convenience function for accessing config
pub fn config() -> &'static AppConfig {
    &CONFIG
}
