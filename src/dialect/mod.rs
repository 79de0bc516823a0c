//! SQL dialects.
//!
//! Each supported database implements [`Dialect`] once: placeholder style,
//! identifier quoting, row limiting, case-insensitive matching and its
//! default upsert strategy. Everything that emits SQL text goes through this
//! trait instead of branching on the driver.

pub mod upsert;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::value::Value;

pub use upsert::{Merge, OnConflict, OnDuplicateKey, ReplaceInto, UpsertParts, UpsertStrategy};

/// Supported relational databases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseDriver {
    Oracle,
    Postgres,
    #[serde(rename = "mysql")]
    MySql,
    Sqlite,
    #[serde(rename = "mariadb")]
    MariaDb,
}

impl DatabaseDriver {
    pub const ALL: [DatabaseDriver; 5] = [
        DatabaseDriver::Oracle,
        DatabaseDriver::Postgres,
        DatabaseDriver::MySql,
        DatabaseDriver::Sqlite,
        DatabaseDriver::MariaDb,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseDriver::Oracle => "oracle",
            DatabaseDriver::Postgres => "postgres",
            DatabaseDriver::MySql => "mysql",
            DatabaseDriver::Sqlite => "sqlite",
            DatabaseDriver::MariaDb => "mariadb",
        }
    }

    /// The dialect implementing this driver's SQL flavour.
    pub fn dialect(&self) -> &'static dyn Dialect {
        match self {
            DatabaseDriver::Oracle => &Oracle,
            DatabaseDriver::Postgres => &Postgres,
            DatabaseDriver::MySql => &MySql,
            DatabaseDriver::Sqlite => &Sqlite,
            DatabaseDriver::MariaDb => &MariaDb,
        }
    }
}

impl fmt::Display for DatabaseDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatabaseDriver {
    type Err = StoreError;

    /// Case-insensitive, surrounding whitespace ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        DatabaseDriver::ALL
            .into_iter()
            .find(|d| d.as_str() == normalized)
            .ok_or_else(|| StoreError::UnsupportedDialect(s.trim().to_string()))
    }
}

/// A parameterized SQL statement.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Statement {
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// SQL capabilities of one database.
pub trait Dialect: Send + Sync + fmt::Debug {
    fn driver(&self) -> DatabaseDriver;

    /// Bind placeholder for the 1-based parameter `index`.
    fn placeholder(&self, index: usize) -> String;

    /// Identifier as it must appear in statement text. Plain identifiers
    /// are left alone; anything else is quoted.
    fn quote_identifier(&self, ident: &str) -> String {
        quote_if_needed(ident, '"', '"')
    }

    /// Row-limiting clause, with a leading space.
    fn limit_offset(&self, limit: i64, offset: i64) -> String {
        if offset > 0 {
            format!(" LIMIT {} OFFSET {}", limit, offset)
        } else {
            format!(" LIMIT {}", limit)
        }
    }

    /// True when `ilike` has to be rewritten as `UPPER(field) LIKE UPPER(?)`.
    fn emulates_case_insensitive_match(&self) -> bool {
        true
    }

    /// Whether an upsert can target an explicit multi-column conflict key.
    fn supports_composite_conflict_key(&self) -> bool {
        true
    }

    /// Strategy used when a store does not pick one.
    fn default_upsert(&self) -> &'static dyn UpsertStrategy;
}

impl dyn Dialect + '_ {
    /// Build an insert-or-update statement with the default strategy.
    pub fn build_upsert(&self, parts: &UpsertParts<'_>) -> StoreResult<Statement> {
        self.default_upsert().build(self, parts)
    }
}

/// Consecutive bind placeholders for one statement.
#[derive(Debug)]
pub struct Placeholders<'d> {
    dialect: &'d dyn Dialect,
    next: usize,
}

impl<'d> Placeholders<'d> {
    /// Numbering continues after `offset` parameters already bound.
    pub fn starting_after(dialect: &'d dyn Dialect, offset: usize) -> Self {
        Self {
            dialect,
            next: offset + 1,
        }
    }

    pub fn next_placeholder(&mut self) -> String {
        let placeholder = self.dialect.placeholder(self.next);
        self.next += 1;
        placeholder
    }

    /// Parameters numbered so far, including the starting offset.
    pub fn count(&self) -> usize {
        self.next - 1
    }
}

const RESERVED: &[&str] = &[
    "all", "and", "as", "asc", "by", "case", "check", "column", "default", "delete", "desc",
    "distinct", "from", "group", "having", "in", "index", "insert", "into", "is", "join", "key",
    "like", "limit", "not", "null", "offset", "on", "or", "order", "select", "set", "table",
    "to", "union", "update", "user", "values", "where",
];

fn is_plain_identifier(ident: &str) -> bool {
    let mut chars = ident.chars();
    let starts_well = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    starts_well
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !RESERVED.contains(&ident.to_ascii_lowercase().as_str())
}

/// Quote `ident` unless it is a plain, non-reserved identifier.
pub fn quote_if_needed(ident: &str, open: char, close: char) -> String {
    if is_plain_identifier(ident) {
        return ident.to_string();
    }
    let escaped = ident.replace(close, &format!("{close}{close}"));
    format!("{open}{escaped}{close}")
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Sqlite;

impl Dialect for Sqlite {
    fn driver(&self) -> DatabaseDriver {
        DatabaseDriver::Sqlite
    }

    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn default_upsert(&self) -> &'static dyn UpsertStrategy {
        &OnConflict
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Postgres;

impl Dialect for Postgres {
    fn driver(&self) -> DatabaseDriver {
        DatabaseDriver::Postgres
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${}", index)
    }

    fn emulates_case_insensitive_match(&self) -> bool {
        false
    }

    fn default_upsert(&self) -> &'static dyn UpsertStrategy {
        &OnConflict
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MySql;

impl Dialect for MySql {
    fn driver(&self) -> DatabaseDriver {
        DatabaseDriver::MySql
    }

    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn quote_identifier(&self, ident: &str) -> String {
        quote_if_needed(ident, '`', '`')
    }

    /// `ON DUPLICATE KEY` fires on whichever unique index collides.
    fn supports_composite_conflict_key(&self) -> bool {
        false
    }

    fn default_upsert(&self) -> &'static dyn UpsertStrategy {
        &OnDuplicateKey
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MariaDb;

impl Dialect for MariaDb {
    fn driver(&self) -> DatabaseDriver {
        DatabaseDriver::MariaDb
    }

    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn quote_identifier(&self, ident: &str) -> String {
        quote_if_needed(ident, '`', '`')
    }

    fn supports_composite_conflict_key(&self) -> bool {
        false
    }

    fn default_upsert(&self) -> &'static dyn UpsertStrategy {
        &OnDuplicateKey
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Oracle;

impl Dialect for Oracle {
    fn driver(&self) -> DatabaseDriver {
        DatabaseDriver::Oracle
    }

    fn placeholder(&self, index: usize) -> String {
        format!(":{}", index)
    }

    fn limit_offset(&self, limit: i64, offset: i64) -> String {
        format!(" OFFSET {} ROWS FETCH NEXT {} ROWS ONLY", offset, limit)
    }

    fn default_upsert(&self) -> &'static dyn UpsertStrategy {
        &Merge
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_parse_driver() {
        assert_eq!(" Postgres ".parse::<DatabaseDriver>().unwrap(), DatabaseDriver::Postgres);
        assert_eq!("MARIADB".parse::<DatabaseDriver>().unwrap(), DatabaseDriver::MariaDb);
        assert_eq!("sqlite".parse::<DatabaseDriver>().unwrap(), DatabaseDriver::Sqlite);
    }

    #[test]
    fn test_parse_unknown_driver() {
        let err = "mssql".parse::<DatabaseDriver>().unwrap_err();
        assert_matches!(err, StoreError::UnsupportedDialect(_));
        assert_eq!(err.to_string(), "unsupported database driver: mssql");
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(Sqlite.placeholder(3), "?");
        assert_eq!(Postgres.placeholder(3), "$3");
        assert_eq!(Oracle.placeholder(3), ":3");
    }

    #[test]
    fn test_quote_identifier() {
        assert_eq!(Sqlite.quote_identifier("created_at"), "created_at");
        assert_eq!(Sqlite.quote_identifier("order"), "\"order\"");
        assert_eq!(MySql.quote_identifier("full name"), "`full name`");
        assert_eq!(Postgres.quote_identifier("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn test_limit_offset() {
        assert_eq!(Sqlite.limit_offset(10, 0), " LIMIT 10");
        assert_eq!(MySql.limit_offset(10, 20), " LIMIT 10 OFFSET 20");
        assert_eq!(Oracle.limit_offset(10, 20), " OFFSET 20 ROWS FETCH NEXT 10 ROWS ONLY");
    }

    #[test]
    fn test_dialect_lookup() {
        for driver in DatabaseDriver::ALL {
            assert_eq!(driver.dialect().driver(), driver);
        }
        assert!(!DatabaseDriver::Postgres.dialect().emulates_case_insensitive_match());
        assert!(DatabaseDriver::MySql.dialect().emulates_case_insensitive_match());
    }
}
