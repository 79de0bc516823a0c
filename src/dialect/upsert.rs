//! Insert-or-update statement strategies.
//!
//! A strategy turns one entity's columns and its conflict key into a single
//! statement. The update set is the same for every strategy: all inserted
//! columns except the conflict columns and the insert-only columns (primary
//! key, creation timestamp), for single and composite keys alike.

use std::fmt;

use super::{DatabaseDriver, Dialect, Placeholders, Statement};
use crate::error::{StoreError, StoreResult};
use crate::value::Value;

/// Input of an upsert statement.
#[derive(Debug, Clone, Copy)]
pub struct UpsertParts<'a> {
    pub table: &'a str,
    /// Inserted columns, in statement order.
    pub columns: &'a [(&'static str, Value)],
    /// Columns identifying an existing row.
    pub conflict: &'a [&'static str],
    /// Columns written on insert but never overwritten.
    pub insert_only: &'a [&'static str],
}

impl<'a> UpsertParts<'a> {
    /// Columns overwritten when a row already exists.
    pub fn update_columns(&self) -> Vec<&'a (&'static str, Value)> {
        self.columns
            .iter()
            .filter(|(key, _)| !self.conflict.contains(key) && !self.insert_only.contains(key))
            .collect()
    }

    /// Value bound for a column, null when the column is not inserted.
    pub fn value_of(&self, key: &str) -> Value {
        self.columns
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.clone())
            .unwrap_or(Value::Null)
    }

    fn insert_list(&self, dialect: &dyn Dialect) -> String {
        self.columns
            .iter()
            .map(|(key, _)| dialect.quote_identifier(key))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn conflict_list(&self, dialect: &dyn Dialect) -> String {
        self.conflict
            .iter()
            .map(|key| dialect.quote_identifier(key))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Builds an insert-or-update statement for the drivers it supports.
pub trait UpsertStrategy: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn supports(&self, driver: DatabaseDriver) -> bool;

    /// True when a conflicting row is deleted and re-inserted rather than
    /// updated in place.
    fn replaces_row(&self) -> bool {
        false
    }

    /// Statement text and parameters. Called only for supported drivers with
    /// a non-empty column list and conflict key.
    fn render(&self, dialect: &dyn Dialect, parts: &UpsertParts<'_>) -> Statement;

    fn build(&self, dialect: &dyn Dialect, parts: &UpsertParts<'_>) -> StoreResult<Statement> {
        let driver = dialect.driver();
        if !self.supports(driver) {
            return Err(StoreError::UnsupportedDialect(format!(
                "{} does not support {} upserts",
                driver,
                self.name()
            )));
        }
        if parts.conflict.is_empty() {
            return Err(StoreError::validation("upsert needs at least one conflict column"));
        }
        if parts.columns.is_empty() {
            return Err(StoreError::validation("upsert needs at least one column"));
        }
        if parts.conflict.len() > 1 && !dialect.supports_composite_conflict_key() {
            tracing::debug!(
                driver = %driver,
                conflict = ?parts.conflict,
                "Composite conflict key relies on a matching unique index"
            );
        }
        Ok(self.render(dialect, parts))
    }
}

fn values_list(placeholders: &mut Placeholders<'_>, count: usize) -> String {
    (0..count)
        .map(|_| placeholders.next_placeholder())
        .collect::<Vec<_>>()
        .join(", ")
}

fn column_values(parts: &UpsertParts<'_>) -> Vec<Value> {
    parts.columns.iter().map(|(_, v)| v.clone()).collect()
}

/// `INSERT … ON DUPLICATE KEY UPDATE c = VALUES(c)` (MySQL, MariaDB).
#[derive(Debug, Clone, Copy, Default)]
pub struct OnDuplicateKey;

impl UpsertStrategy for OnDuplicateKey {
    fn name(&self) -> &'static str {
        "ON DUPLICATE KEY"
    }

    fn supports(&self, driver: DatabaseDriver) -> bool {
        matches!(driver, DatabaseDriver::MySql | DatabaseDriver::MariaDb)
    }

    fn render(&self, dialect: &dyn Dialect, parts: &UpsertParts<'_>) -> Statement {
        let mut placeholders = Placeholders::starting_after(dialect, 0);
        let values = values_list(&mut placeholders, parts.columns.len());

        let mut assignments: Vec<String> = parts
            .update_columns()
            .into_iter()
            .map(|(key, _)| {
                let col = dialect.quote_identifier(key);
                format!("{col} = VALUES({col})")
            })
            .collect();
        if assignments.is_empty() {
            // Nothing to overwrite; a no-op assignment keeps the statement valid.
            let col = dialect.quote_identifier(parts.conflict[0]);
            assignments.push(format!("{col} = {col}"));
        }

        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) ON DUPLICATE KEY UPDATE {}",
            dialect.quote_identifier(parts.table),
            parts.insert_list(dialect),
            values,
            assignments.join(", ")
        );
        Statement::new(sql, column_values(parts))
    }
}

/// `INSERT … ON CONFLICT (k1, k2) DO UPDATE SET c = excluded.c`
/// (PostgreSQL, SQLite).
#[derive(Debug, Clone, Copy, Default)]
pub struct OnConflict;

impl UpsertStrategy for OnConflict {
    fn name(&self) -> &'static str {
        "ON CONFLICT"
    }

    fn supports(&self, driver: DatabaseDriver) -> bool {
        matches!(driver, DatabaseDriver::Postgres | DatabaseDriver::Sqlite)
    }

    fn render(&self, dialect: &dyn Dialect, parts: &UpsertParts<'_>) -> Statement {
        let mut placeholders = Placeholders::starting_after(dialect, 0);
        let values = values_list(&mut placeholders, parts.columns.len());

        let assignments: Vec<String> = parts
            .update_columns()
            .into_iter()
            .map(|(key, _)| {
                let col = dialect.quote_identifier(key);
                format!("{col} = excluded.{col}")
            })
            .collect();
        let action = if assignments.is_empty() {
            "DO NOTHING".to_string()
        } else {
            format!("DO UPDATE SET {}", assignments.join(", "))
        };

        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) {}",
            dialect.quote_identifier(parts.table),
            parts.insert_list(dialect),
            values,
            parts.conflict_list(dialect),
            action
        );
        Statement::new(sql, column_values(parts))
    }
}

/// `REPLACE INTO …`: deletes the conflicting row and inserts a new one.
///
/// This is not a partial update. Every column of the old row that is not in
/// the inserted column list is lost (reset to its default). Delete triggers
/// and cascades fire, and an auto-increment key may change.
/// Never chosen by default; opt in with `SqlStore::with_upsert_strategy`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplaceInto;

impl UpsertStrategy for ReplaceInto {
    fn name(&self) -> &'static str {
        "REPLACE INTO"
    }

    fn supports(&self, driver: DatabaseDriver) -> bool {
        matches!(
            driver,
            DatabaseDriver::MySql | DatabaseDriver::MariaDb | DatabaseDriver::Sqlite
        )
    }

    fn replaces_row(&self) -> bool {
        true
    }

    fn render(&self, dialect: &dyn Dialect, parts: &UpsertParts<'_>) -> Statement {
        let mut placeholders = Placeholders::starting_after(dialect, 0);
        let sql = format!(
            "REPLACE INTO {} ({}) VALUES ({})",
            dialect.quote_identifier(parts.table),
            parts.insert_list(dialect),
            values_list(&mut placeholders, parts.columns.len())
        );
        Statement::new(sql, column_values(parts))
    }
}

/// `MERGE INTO … USING (SELECT … FROM dual)` (Oracle).
///
/// Binds three lists taken from the same entity, in this order: the
/// conflict values joined against, the update set, the insert values.
#[derive(Debug, Clone, Copy, Default)]
pub struct Merge;

impl UpsertStrategy for Merge {
    fn name(&self) -> &'static str {
        "MERGE"
    }

    fn supports(&self, driver: DatabaseDriver) -> bool {
        driver == DatabaseDriver::Oracle
    }

    fn render(&self, dialect: &dyn Dialect, parts: &UpsertParts<'_>) -> Statement {
        let mut placeholders = Placeholders::starting_after(dialect, 0);
        let mut params = Vec::new();

        let source: Vec<String> = parts
            .conflict
            .iter()
            .map(|key| {
                params.push(parts.value_of(key));
                format!("{} AS {}", placeholders.next_placeholder(), dialect.quote_identifier(key))
            })
            .collect();
        let join: Vec<String> = parts
            .conflict
            .iter()
            .map(|key| {
                let col = dialect.quote_identifier(key);
                format!("tgt.{col} = src.{col}")
            })
            .collect();

        let mut sql = format!(
            "MERGE INTO {} tgt USING (SELECT {} FROM dual) src ON ({})",
            dialect.quote_identifier(parts.table),
            source.join(", "),
            join.join(" AND ")
        );

        let updates: Vec<String> = parts
            .update_columns()
            .into_iter()
            .map(|(key, value)| {
                params.push(value.clone());
                format!("tgt.{} = {}", dialect.quote_identifier(key), placeholders.next_placeholder())
            })
            .collect();
        if !updates.is_empty() {
            sql.push_str(&format!(" WHEN MATCHED THEN UPDATE SET {}", updates.join(", ")));
        }

        let inserts = values_list(&mut placeholders, parts.columns.len());
        params.extend(column_values(parts));
        sql.push_str(&format!(
            " WHEN NOT MATCHED THEN INSERT ({}) VALUES ({})",
            parts.insert_list(dialect),
            inserts
        ));

        Statement::new(sql, params)
    }
}
