//! Store configuration management

use std::env;

use anyhow::{Context, Result};

use crate::dialect::DatabaseDriver;
use crate::filter::sql::FieldPolicy;
use crate::mapper::CoercionPolicy;

/// Store configuration loaded from environment variables
#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    /// Relational database URL, e.g. `sqlite://data/store.db`
    pub database_url: String,

    /// Dialect of `database_url`
    pub driver: DatabaseDriver,

    /// Maximum connection pool size
    pub max_connections: u32,

    /// MongoDB connection string, when a document backend is used
    pub mongodb_uri: Option<String>,

    /// MongoDB database name
    pub mongodb_database: String,

    /// Fail reads whose values cannot be coerced instead of logging them
    pub strict_coercion: bool,

    /// Reject filter and update fields the entity does not declare
    pub validate_fields: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://data/store.db".to_string(),
            driver: DatabaseDriver::Sqlite,
            max_connections: 10,
            mongodb_uri: None,
            mongodb_database: "dbstore".to_string(),
            strict_coercion: false,
            validate_fields: false,
        }
    }
}

impl StoreConfig {
    /// Load configuration from environment variables, after a `.env` file
    /// if one is present
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let driver = match env::var("DATABASE_DRIVER") {
            Ok(value) => value
                .parse()
                .with_context(|| format!("Invalid DATABASE_DRIVER `{}`", value))?,
            Err(_) => defaults.driver,
        };

        let max_connections = match env::var("DATABASE_MAX_CONNECTIONS") {
            Ok(value) => value.parse().context("Invalid DATABASE_MAX_CONNECTIONS")?,
            Err(_) => defaults.max_connections,
        };

        Ok(Self {
            database_url: env::var("DATABASE_URL").unwrap_or(defaults.database_url),

            driver,

            max_connections,

            mongodb_uri: env::var("MONGODB_URI").ok(),

            mongodb_database: env::var("MONGODB_DATABASE").unwrap_or(defaults.mongodb_database),

            strict_coercion: env::var("STORE_STRICT_COERCION")
                .map(|v| parse_flag(&v))
                .unwrap_or(false),

            validate_fields: env::var("STORE_VALIDATE_FIELDS")
                .map(|v| parse_flag(&v))
                .unwrap_or(false),
        })
    }

    pub fn coercion_policy(&self) -> CoercionPolicy {
        if self.strict_coercion {
            CoercionPolicy::Strict
        } else {
            CoercionPolicy::Lenient
        }
    }

    pub fn field_policy(&self) -> FieldPolicy {
        if self.validate_fields {
            FieldPolicy::Validate
        } else {
            FieldPolicy::Trust
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}
