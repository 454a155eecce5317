// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Durable relational store backed by SQLite.
//!
//! `rusqlite::Connection` is not `Sync`, so a single connection lives behind
//! a mutex. All multi-row writes go through [`Database::transaction`], which
//! commits on `Ok` and rolls back on `Err`, so other readers never observe a
//! partial write.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, OptionalExtension, Params, Row, Transaction};

use crate::error::{NimbusError, NimbusResult, StoreError};

/// A named schema change applied once, in order.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub service: &'static str,
    pub description: &'static str,
    pub sql: &'static str,
}

/// Narrow query helpers shared by plain connections and transactions.
pub trait ConnectionExt {
    /// Execute a single-row insert and return the new row id.
    fn insert_one<P: Params>(&self, context: &str, sql: &str, params: P) -> Result<i64, StoreError>;

    /// Query at most one row.
    fn query_single<T, P, F>(&self, context: &str, sql: &str, params: P, map: F) -> Result<Option<T>, StoreError>
    where
        P: Params,
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>;

    /// Query every matching row.
    fn query_all<T, P, F>(&self, context: &str, sql: &str, params: P, map: F) -> Result<Vec<T>, StoreError>
    where
        P: Params,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>;
}

impl ConnectionExt for Connection {
    fn insert_one<P: Params>(&self, context: &str, sql: &str, params: P) -> Result<i64, StoreError> {
        self.execute(sql, params).map_err(StoreError::query(context))?;
        Ok(self.last_insert_rowid())
    }

    fn query_single<T, P, F>(&self, context: &str, sql: &str, params: P, map: F) -> Result<Option<T>, StoreError>
    where
        P: Params,
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.query_row(sql, params, map)
            .optional()
            .map_err(StoreError::query(context))
    }

    fn query_all<T, P, F>(&self, context: &str, sql: &str, params: P, map: F) -> Result<Vec<T>, StoreError>
    where
        P: Params,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        let mut stmt = self.prepare(sql).map_err(StoreError::query(context))?;
        let rows = stmt
            .query_map(params, map)
            .map_err(StoreError::query(context))?;
        rows.collect::<rusqlite::Result<Vec<T>>>()
            .map_err(StoreError::query(context))
    }
}

/// Handle to the durable store.
#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(|source| StoreError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_connection(conn, path)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|source| StoreError::Open {
            path: ":memory:".into(),
            source,
        })?;
        Self::from_connection(conn, Path::new(":memory:"))
    }

    fn from_connection(conn: Connection, path: &Path) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(|source| StoreError::Open {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock cannot leave a transaction open:
        // dropping the Transaction rolls it back.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply every migration not yet recorded, in the given order.
    pub fn migrate(&self, migrations: &[Migration]) -> Result<(), StoreError> {
        let mut conn = self.lock();

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS migration (
                id           integer primary key autoincrement,
                service      text not null,
                description  text not null,
                applied_on   integer not null,
                UNIQUE(service, description)
            );",
        )
        .map_err(StoreError::query("creating migration table"))?;

        for migration in migrations {
            let applied = conn
                .query_single(
                    "checking migration",
                    "SELECT id FROM migration WHERE service = ?1 AND description = ?2",
                    rusqlite::params![migration.service, migration.description],
                    |row| row.get::<_, i64>(0),
                )?
                .is_some();

            if applied {
                tracing::debug!(
                    service = migration.service,
                    description = migration.description,
                    "Migration already applied"
                );
                continue;
            }

            let to_err = |source| StoreError::Migration {
                service: migration.service,
                description: migration.description,
                source,
            };

            let tx = conn.transaction().map_err(to_err)?;
            tx.execute_batch(migration.sql).map_err(to_err)?;
            tx.execute(
                "INSERT INTO migration (service, description, applied_on) VALUES (?1, ?2, ?3)",
                rusqlite::params![
                    migration.service,
                    migration.description,
                    chrono::Utc::now().timestamp_millis()
                ],
            )
            .map_err(to_err)?;
            tx.commit().map_err(to_err)?;

            tracing::info!(
                service = migration.service,
                description = migration.description,
                "Applied migration"
            );
        }

        Ok(())
    }

    /// Run read-only work against the connection.
    pub fn read<T>(&self, f: impl FnOnce(&Connection) -> NimbusResult<T>) -> NimbusResult<T> {
        let conn = self.lock();
        f(&conn)
    }

    /// Run `f` inside a transaction: commit if it returns `Ok`, roll back
    /// otherwise.
    pub fn transaction<T>(
        &self,
        context: &str,
        f: impl FnOnce(&Transaction<'_>) -> NimbusResult<T>,
    ) -> NimbusResult<T> {
        let mut conn = self.lock();
        let tx = conn
            .transaction()
            .map_err(StoreError::query(format!("begin {context}")))?;

        match f(&tx) {
            Ok(value) => {
                tx.commit()
                    .map_err(StoreError::query(format!("commit {context}")))?;
                Ok(value)
            }
            Err(err) => {
                tracing::warn!(context = %context, error = %err, "Rolling back transaction");
                if let Err(rollback_err) = tx.rollback() {
                    tracing::error!(context = %context, error = %rollback_err, "Rollback failed");
                }
                Err(err)
            }
        }
    }
}

impl From<rusqlite::Error> for NimbusError {
    fn from(source: rusqlite::Error) -> Self {
        StoreError::Query {
            context: "sqlite".to_string(),
            source,
        }
        .into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIGRATIONS: &[Migration] = &[Migration {
        service: "Test",
        description: "Create item table",
        sql: "CREATE TABLE item (id integer primary key autoincrement, name text not null unique);",
    }];

    fn db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.migrate(MIGRATIONS).unwrap();
        db
    }

    fn count(db: &Database) -> i64 {
        db.read(|conn| {
            Ok(conn
                .query_single("count", "SELECT COUNT(*) FROM item", [], |r| r.get(0))?
                .unwrap_or(0))
        })
        .unwrap()
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let db = db();
        db.migrate(MIGRATIONS).unwrap();
        let applied: i64 = db
            .read(|conn| {
                Ok(conn
                    .query_single("count", "SELECT COUNT(*) FROM migration", [], |r| r.get(0))?
                    .unwrap_or(0))
            })
            .unwrap();
        assert_eq!(applied, 1);
    }

    #[test]
    fn test_transaction_commits() {
        let db = db();
        let id = db
            .transaction("insert", |tx| {
                Ok(tx.insert_one("insert", "INSERT INTO item (name) VALUES (?1)", ["a"])?)
            })
            .unwrap();
        assert_eq!(id, 1);
        assert_eq!(count(&db), 1);
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let db = db();
        let result = db.transaction("insert", |tx| {
            tx.insert_one("insert", "INSERT INTO item (name) VALUES (?1)", ["a"])?;
            // Unique violation on the second row aborts the whole unit.
            tx.insert_one("insert", "INSERT INTO item (name) VALUES (?1)", ["a"])?;
            Ok(())
        });
        assert!(result.is_err());
        assert_eq!(count(&db), 0);
    }

    #[test]
    fn test_query_all_orders_rows() {
        let db = db();
        db.transaction("insert", |tx| {
            for name in ["c", "a", "b"] {
                tx.insert_one("insert", "INSERT INTO item (name) VALUES (?1)", [name])?;
            }
            Ok(())
        })
        .unwrap();

        let names: Vec<String> = db
            .read(|conn| {
                Ok(conn.query_all("list", "SELECT name FROM item ORDER BY name", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(names, vec!["a", "b", "c"]);
    }
}
