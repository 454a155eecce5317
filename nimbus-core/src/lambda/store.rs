// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Persistent, versioned storage for functions, layers and event sources.
//!
//! Metadata lives in the durable store; unpacked code lives under the data
//! path:
//!
//! ```text
//! {data}/lambda/functions/{name}/{version}/content   function code
//! {data}/lambda/functions/{name}/{version}/layers    unpacked layers (/opt)
//! {data}/lambda/layers/{name}/{version}/content.zip  layer archive
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, Row};
use uuid::Uuid;

use crate::db::{ConnectionExt, Database, Migration};
use crate::error::{NimbusError, NimbusResult, StoreError};
use crate::lambda::archive;
use crate::lambda::model::{
    function_version_dir, layer_archive_path, EventSource, Function, LambdaLayer, NewFunction,
};
use crate::types::{FunctionName, LayerName, LayerRef, MemorySize, Runtime, Timeout};

/// Schema for the function/layer store.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        service: "Lambda",
        description: "Create Runtime Table",
        sql: "CREATE TABLE IF NOT EXISTS lambda_runtime (
                id    integer primary key autoincrement,
                name  text not null unique
            );",
    },
    Migration {
        service: "Lambda",
        description: "Create Layer Tables",
        sql: "CREATE TABLE IF NOT EXISTS lambda_layer (
                id           integer primary key autoincrement,
                name         text not null,
                version      integer not null,
                description  text not null,
                created_on   integer not null,
                code_size    integer not null,
                code_sha256  text not null,
                UNIQUE(name, version)
            );

            CREATE TABLE IF NOT EXISTS lambda_layer_runtime (
                id                 integer primary key autoincrement,
                lambda_layer_id    integer not null,
                lambda_runtime_id  integer not null,
                FOREIGN KEY(lambda_layer_id) REFERENCES lambda_layer(id),
                FOREIGN KEY(lambda_runtime_id) REFERENCES lambda_runtime(id)
            );",
    },
    Migration {
        service: "Lambda",
        description: "Create Function Tables",
        sql: "CREATE TABLE IF NOT EXISTS lambda_function (
                id                integer primary key autoincrement,
                name              text not null,
                version           integer not null,
                description       text not null,
                handler           text not null,
                role              text not null,
                dead_letter_arn   text,
                memory_size       integer not null,
                runtime           text not null,
                timeout           integer not null,
                code_sha256       text not null,
                code_size         integer not null,
                last_modified_on  integer not null,
                UNIQUE(name, version)
            );

            CREATE TABLE IF NOT EXISTS lambda_function_environment (
                id           integer primary key autoincrement,
                function_id  integer not null,
                key          text not null,
                value        text not null,
                UNIQUE(function_id, key),
                FOREIGN KEY(function_id) REFERENCES lambda_function(id)
            );

            CREATE TABLE IF NOT EXISTS lambda_function_tag (
                id           integer primary key autoincrement,
                function_id  integer not null,
                key          text not null,
                value        text not null,
                UNIQUE(function_id, key),
                FOREIGN KEY(function_id) REFERENCES lambda_function(id)
            );

            CREATE TABLE IF NOT EXISTS lambda_function_layer (
                id             integer primary key autoincrement,
                function_id    integer not null,
                position       integer not null,
                layer_name     text not null,
                layer_version  integer not null,
                FOREIGN KEY(function_id) REFERENCES lambda_function(id)
            );",
    },
    Migration {
        service: "Lambda",
        description: "Create Event Source Table",
        sql: "CREATE TABLE IF NOT EXISTS lambda_event_source (
                id                integer primary key autoincrement,
                uuid              text not null unique,
                arn               text not null,
                function_name     text not null,
                batch_size        integer not null,
                enabled           integer not null,
                last_modified_on  integer not null
            );",
    },
];

const FUNCTION_COLUMNS: &str = "id, name, version, description, handler, role, dead_letter_arn, \
     memory_size, runtime, timeout, code_sha256, code_size, last_modified_on";

const LAYER_COLUMNS: &str =
    "id, name, version, description, created_on, code_size, code_sha256";

/// Result of an environment upsert: exactly the keys that were written.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EnvironmentDiff {
    pub added: BTreeMap<String, String>,
    pub changed: BTreeMap<String, String>,
    pub removed: Vec<String>,
}

impl EnvironmentDiff {
    /// Diff `current` against the `target` environment.
    pub fn between(current: &BTreeMap<String, String>, target: &BTreeMap<String, String>) -> Self {
        let mut diff = Self::default();
        for (key, value) in target {
            match current.get(key) {
                None => {
                    diff.added.insert(key.clone(), value.clone());
                }
                Some(old) if old != value => {
                    diff.changed.insert(key.clone(), value.clone());
                }
                Some(_) => {}
            }
        }
        diff.removed = current
            .keys()
            .filter(|key| !target.contains_key(*key))
            .cloned()
            .collect();
        diff
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }

    /// Number of row writes needed to apply this diff.
    pub fn writes(&self) -> usize {
        self.added.len() + self.changed.len() + self.removed.len()
    }
}

/// Raw `lambda_function` row before validation.
struct FunctionRow {
    id: i64,
    name: String,
    version: u32,
    description: String,
    handler: String,
    role: String,
    dead_letter_arn: Option<String>,
    memory_size: u32,
    runtime: String,
    timeout: u32,
    code_sha256: String,
    code_size: i64,
    last_modified_on: i64,
}

impl FunctionRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            version: row.get(2)?,
            description: row.get(3)?,
            handler: row.get(4)?,
            role: row.get(5)?,
            dead_letter_arn: row.get(6)?,
            memory_size: row.get(7)?,
            runtime: row.get(8)?,
            timeout: row.get(9)?,
            code_sha256: row.get(10)?,
            code_size: row.get(11)?,
            last_modified_on: row.get(12)?,
        })
    }
}

struct LayerRow {
    id: i64,
    name: String,
    version: u32,
    description: String,
    created_on: i64,
    code_size: i64,
    code_sha256: String,
}

impl LayerRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            version: row.get(2)?,
            description: row.get(3)?,
            created_on: row.get(4)?,
            code_size: row.get(5)?,
            code_sha256: row.get(6)?,
        })
    }
}

fn malformed(message: impl Into<String>) -> NimbusError {
    StoreError::Malformed {
        message: message.into(),
    }
    .into()
}

fn timestamp(millis: i64) -> NimbusResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| malformed(format!("invalid timestamp {millis}")))
}

fn key_values(conn: &Connection, table: &str, function_id: i64) -> NimbusResult<BTreeMap<String, String>> {
    let sql = format!("SELECT key, value FROM {table} WHERE function_id = ?1");
    let pairs: Vec<(String, String)> = conn.query_all(table, &sql, [function_id], |r| {
        Ok((r.get(0)?, r.get(1)?))
    })?;
    Ok(pairs.into_iter().collect())
}

/// Attach environment, tags and layer references to a function row.
fn hydrate_function(conn: &Connection, row: FunctionRow) -> NimbusResult<Function> {
    let environment = key_values(conn, "lambda_function_environment", row.id)?;
    let tags = key_values(conn, "lambda_function_tag", row.id)?;

    let layer_rows: Vec<(String, u32)> = conn.query_all(
        "function layers",
        "SELECT layer_name, layer_version FROM lambda_function_layer
            WHERE function_id = ?1 ORDER BY position",
        [row.id],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;
    let layers = layer_rows
        .into_iter()
        .map(|(name, version)| Ok(LayerRef::new(LayerName::new(name)?, version)))
        .collect::<NimbusResult<Vec<_>>>()?;

    Ok(Function {
        id: row.id,
        name: FunctionName::new(row.name)?,
        version: row.version,
        description: row.description,
        handler: row.handler,
        role: row.role,
        dead_letter_arn: row.dead_letter_arn,
        memory_size: MemorySize::from_mb(row.memory_size)?,
        timeout: Timeout::from_secs(row.timeout)?,
        runtime: Runtime::new(row.runtime)?,
        code_sha256: row.code_sha256,
        code_size: row.code_size,
        last_modified: timestamp(row.last_modified_on)?,
        layers,
        environment,
        tags,
    })
}

fn hydrate_layer(conn: &Connection, row: LayerRow) -> NimbusResult<LambdaLayer> {
    let runtimes: Vec<String> = conn.query_all(
        "layer runtimes",
        "SELECT r.name FROM lambda_runtime AS r
            INNER JOIN lambda_layer_runtime AS llr ON r.id = llr.lambda_runtime_id
            WHERE llr.lambda_layer_id = ?1 ORDER BY r.name",
        [row.id],
        |r| r.get(0),
    )?;

    Ok(LambdaLayer {
        id: row.id,
        name: LayerName::new(row.name)?,
        version: row.version,
        description: row.description,
        compatible_runtimes: runtimes
            .into_iter()
            .map(Runtime::new)
            .collect::<Result<_, _>>()?,
        code_sha256: row.code_sha256,
        code_size: row.code_size,
        created_on: timestamp(row.created_on)?,
    })
}

fn load_layer(conn: &Connection, name: &LayerName, version: u32) -> NimbusResult<Option<LambdaLayer>> {
    let sql = format!("SELECT {LAYER_COLUMNS} FROM lambda_layer WHERE name = ?1 AND version = ?2");
    conn.query_single("layer version", &sql, rusqlite::params![name.as_str(), version], LayerRow::from_row)?
        .map(|row| hydrate_layer(conn, row))
        .transpose()
}

fn runtime_id(conn: &Connection, runtime: &Runtime) -> NimbusResult<Option<i64>> {
    Ok(conn.query_single(
        "runtime",
        "SELECT id FROM lambda_runtime WHERE name = ?1",
        [runtime.as_str()],
        |r| r.get(0),
    )?)
}

/// Function and layer store.
#[derive(Debug)]
pub struct FunctionStore {
    db: Arc<Database>,
    data_path: PathBuf,
    /// Serialises version allocation so concurrent deploys of one name
    /// cannot race for the same version number.
    deploy_lock: Mutex<()>,
}

impl FunctionStore {
    pub fn new(db: Arc<Database>, data_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            data_path: data_path.into(),
            deploy_lock: Mutex::new(()),
        }
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    /// Make sure every runtime in `runtimes` has a runtime record.
    pub fn seed_runtimes(&self, runtimes: &[Runtime]) -> NimbusResult<()> {
        self.db.transaction("seed runtimes", |tx| {
            for runtime in runtimes {
                tx.execute(
                    "INSERT OR IGNORE INTO lambda_runtime (name) VALUES (?1)",
                    [runtime.as_str()],
                )
                .map_err(StoreError::query("seed runtime"))?;
            }
            Ok(())
        })
    }

    pub fn runtime_exists(&self, runtime: &Runtime) -> NimbusResult<bool> {
        self.db.read(|conn| Ok(runtime_id(conn, runtime)?.is_some()))
    }

    /// Deploy a new version of a function.
    ///
    /// The runtime must be known and every referenced layer must exist and
    /// declare the function's runtime as compatible. Files are unpacked
    /// before the rows are written; if anything fails the version directory
    /// is removed and no row is committed.
    pub fn deploy(&self, new: NewFunction, code: &[u8]) -> NimbusResult<Function> {
        let _guard = self
            .deploy_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let layers = self.db.read(|conn| {
            if runtime_id(conn, &new.runtime)?.is_none() {
                return Err(NimbusError::RuntimeNotFound {
                    runtime: new.runtime.to_string(),
                });
            }

            let mut layers = Vec::with_capacity(new.layers.len());
            for layer_ref in &new.layers {
                let layer = load_layer(conn, &layer_ref.name, layer_ref.version)?.ok_or_else(|| {
                    NimbusError::LayerNotFound {
                        name: layer_ref.name.to_string(),
                        version: layer_ref.version.to_string(),
                    }
                })?;

                if !layer.supports(&new.runtime) {
                    return Err(NimbusError::IncompatibleLayer {
                        layer: layer.name.to_string(),
                        version: layer.version,
                        runtime: new.runtime.to_string(),
                    });
                }
                layers.push(layer);
            }
            Ok(layers)
        })?;

        let version = self.latest_version(&new.name)?.unwrap_or(0) + 1;
        let version_dir = function_version_dir(&self.data_path, &new.name, version);

        tracing::info!(
            function = %new.name,
            version = version,
            runtime = %new.runtime,
            layers = layers.len(),
            "Deploying function"
        );

        let result = self.write_version(&new, version, &version_dir, &layers, code);
        if result.is_err() {
            if let Err(e) = std::fs::remove_dir_all(&version_dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(
                        path = %version_dir.display(),
                        error = %e,
                        "Unable to clean up failed deploy"
                    );
                }
            }
        }
        result
    }

    fn write_version(
        &self,
        new: &NewFunction,
        version: u32,
        version_dir: &Path,
        layers: &[LambdaLayer],
        code: &[u8],
    ) -> NimbusResult<Function> {
        if version_dir.exists() {
            // Left over from a crashed deploy that never committed.
            std::fs::remove_dir_all(version_dir)
                .map_err(|e| NimbusError::io(format!("clearing {}", version_dir.display()), e))?;
        }

        archive::unpack(code, &version_dir.join("content"))?;

        let layers_dir = version_dir.join("layers");
        std::fs::create_dir_all(&layers_dir)
            .map_err(|e| NimbusError::io(format!("creating {}", layers_dir.display()), e))?;
        for layer in layers {
            archive::unpack_file(&layer.archive_path(&self.data_path), &layers_dir)?;
        }

        let last_modified = Utc::now();
        let code_sha256 = archive::digest(code);
        let code_size = code.len() as i64;

        let id = self.db.transaction("deploy function", |tx| {
            let id = tx.insert_one(
                "insert function",
                "INSERT INTO lambda_function (name, version, description, handler, role,
                        dead_letter_arn, memory_size, runtime, timeout, code_sha256, code_size,
                        last_modified_on)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                rusqlite::params![
                    new.name.as_str(),
                    version,
                    new.description,
                    new.handler,
                    new.role,
                    new.dead_letter_arn,
                    new.memory_size.megabytes(),
                    new.runtime.as_str(),
                    new.timeout.seconds(),
                    code_sha256,
                    code_size,
                    last_modified.timestamp_millis(),
                ],
            )?;

            for (key, value) in &new.tags {
                tx.insert_one(
                    "insert function tag",
                    "INSERT INTO lambda_function_tag (function_id, key, value) VALUES (?1, ?2, ?3)",
                    rusqlite::params![id, key, value],
                )?;
            }

            for (key, value) in &new.environment {
                tx.insert_one(
                    "insert function environment",
                    "INSERT INTO lambda_function_environment (function_id, key, value)
                        VALUES (?1, ?2, ?3)",
                    rusqlite::params![id, key, value],
                )?;
            }

            for (position, layer) in new.layers.iter().enumerate() {
                tx.insert_one(
                    "insert function layer",
                    "INSERT INTO lambda_function_layer (function_id, position, layer_name, layer_version)
                        VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![id, position as i64, layer.name.as_str(), layer.version],
                )?;
            }

            Ok(id)
        })?;

        tracing::info!(function = %new.name, version = version, "Function deployed");

        Ok(Function {
            id,
            name: new.name.clone(),
            version,
            description: new.description.clone(),
            handler: new.handler.clone(),
            role: new.role.clone(),
            dead_letter_arn: new.dead_letter_arn.clone(),
            memory_size: new.memory_size,
            timeout: new.timeout,
            runtime: new.runtime.clone(),
            code_sha256,
            code_size,
            // Stored with millisecond precision.
            last_modified: timestamp(last_modified.timestamp_millis())?,
            layers: new.layers.clone(),
            environment: new.environment.clone(),
            tags: new.tags.clone(),
        })
    }

    /// Highest version deployed for `name`, if any.
    pub fn latest_version(&self, name: &FunctionName) -> NimbusResult<Option<u32>> {
        self.db.read(|conn| {
            Ok(conn
                .query_single(
                    "latest function version",
                    "SELECT MAX(version) FROM lambda_function WHERE name = ?1",
                    [name.as_str()],
                    |r| r.get::<_, Option<u32>>(0),
                )?
                .flatten())
        })
    }

    /// The highest version of `name`.
    pub fn latest_by_name(&self, name: &FunctionName) -> NimbusResult<Function> {
        let sql = format!(
            "SELECT {FUNCTION_COLUMNS} FROM lambda_function WHERE name = ?1
                ORDER BY version DESC LIMIT 1"
        );
        self.db.read(|conn| {
            let row = conn
                .query_single("latest function", &sql, [name.as_str()], FunctionRow::from_row)?
                .ok_or_else(|| NimbusError::FunctionNotFound {
                    name: name.to_string(),
                })?;
            hydrate_function(conn, row)
        })
    }

    /// A specific version of `name`.
    pub fn version(&self, name: &FunctionName, version: u32) -> NimbusResult<Function> {
        let sql = format!(
            "SELECT {FUNCTION_COLUMNS} FROM lambda_function WHERE name = ?1 AND version = ?2"
        );
        self.db.read(|conn| {
            let row = conn
                .query_single(
                    "function version",
                    &sql,
                    rusqlite::params![name.as_str(), version],
                    FunctionRow::from_row,
                )?
                .ok_or_else(|| NimbusError::FunctionNotFound {
                    name: format!("{name}:{version}"),
                })?;
            hydrate_function(conn, row)
        })
    }

    /// Every version of `name`, ascending. Empty if the name is unknown.
    pub fn versions_by_name(&self, name: &FunctionName) -> NimbusResult<Vec<Function>> {
        let sql = format!(
            "SELECT {FUNCTION_COLUMNS} FROM lambda_function WHERE name = ?1 ORDER BY version"
        );
        self.db.read(|conn| {
            conn.query_all("function versions", &sql, [name.as_str()], FunctionRow::from_row)?
                .into_iter()
                .map(|row| hydrate_function(conn, row))
                .collect()
        })
    }

    /// The latest version of every deployed function, ordered by name.
    pub fn latest_functions(&self) -> NimbusResult<Vec<Function>> {
        let sql = format!(
            "SELECT {FUNCTION_COLUMNS} FROM lambda_function AS f
                WHERE f.version = (SELECT MAX(version) FROM lambda_function WHERE name = f.name)
                ORDER BY f.name"
        );
        self.db.read(|conn| {
            conn.query_all("latest functions", &sql, [], FunctionRow::from_row)?
                .into_iter()
                .map(|row| hydrate_function(conn, row))
                .collect()
        })
    }

    /// Layers referenced by `function`, in reference order.
    pub fn layers_for_function(&self, function: &Function) -> NimbusResult<Vec<LambdaLayer>> {
        self.db.read(|conn| {
            function
                .layers
                .iter()
                .map(|layer_ref| {
                    load_layer(conn, &layer_ref.name, layer_ref.version)?.ok_or_else(|| {
                        NimbusError::LayerNotFound {
                            name: layer_ref.name.to_string(),
                            version: layer_ref.version.to_string(),
                        }
                    })
                })
                .collect()
        })
    }

    /// Replace the stored environment of `function` with `target`, writing
    /// only the keys that were added, changed or removed.
    pub fn upsert_environment(
        &self,
        function: &Function,
        target: &BTreeMap<String, String>,
    ) -> NimbusResult<EnvironmentDiff> {
        let current = self
            .db
            .read(|conn| key_values(conn, "lambda_function_environment", function.id))?;
        let diff = EnvironmentDiff::between(&current, target);

        if diff.is_empty() {
            tracing::debug!(function = %function.name, "Environment unchanged");
            return Ok(diff);
        }

        self.db.transaction("upsert environment", |tx| {
            for (key, value) in &diff.added {
                tx.insert_one(
                    "insert environment",
                    "INSERT INTO lambda_function_environment (function_id, key, value)
                        VALUES (?1, ?2, ?3)",
                    rusqlite::params![function.id, key, value],
                )?;
            }

            for (key, value) in &diff.changed {
                tx.execute(
                    "UPDATE lambda_function_environment SET value = ?3
                        WHERE function_id = ?1 AND key = ?2",
                    rusqlite::params![function.id, key, value],
                )
                .map_err(StoreError::query("update environment"))?;
            }

            for key in &diff.removed {
                tx.execute(
                    "DELETE FROM lambda_function_environment WHERE function_id = ?1 AND key = ?2",
                    rusqlite::params![function.id, key],
                )
                .map_err(StoreError::query("delete environment"))?;
            }

            tx.execute(
                "UPDATE lambda_function SET last_modified_on = ?2 WHERE id = ?1",
                rusqlite::params![function.id, Utc::now().timestamp_millis()],
            )
            .map_err(StoreError::query("touch function"))?;

            Ok(())
        })?;

        tracing::info!(
            function = %function.name,
            version = function.version,
            added = diff.added.len(),
            changed = diff.changed.len(),
            removed = diff.removed.len(),
            "Environment updated"
        );

        Ok(diff)
    }

    /// Publish a new version of a layer.
    pub fn publish_layer(
        &self,
        name: &LayerName,
        description: &str,
        compatible_runtimes: &[Runtime],
        content: &[u8],
    ) -> NimbusResult<LambdaLayer> {
        let _guard = self
            .deploy_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let runtime_ids = self.db.read(|conn| {
            compatible_runtimes
                .iter()
                .map(|runtime| {
                    runtime_id(conn, runtime)?.ok_or_else(|| NimbusError::RuntimeNotFound {
                        runtime: runtime.to_string(),
                    })
                })
                .collect::<NimbusResult<Vec<i64>>>()
        })?;

        let version = self
            .db
            .read(|conn| {
                Ok(conn
                    .query_single(
                        "latest layer version",
                        "SELECT MAX(version) FROM lambda_layer WHERE name = ?1",
                        [name.as_str()],
                        |r| r.get::<_, Option<u32>>(0),
                    )?
                    .flatten())
            })?
            .unwrap_or(0)
            + 1;

        let archive_path = layer_archive_path(&self.data_path, name, version);
        if let Some(parent) = archive_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| NimbusError::io(format!("creating {}", parent.display()), e))?;
        }
        std::fs::write(&archive_path, content)
            .map_err(|e| NimbusError::io(format!("writing {}", archive_path.display()), e))?;

        let created_on = timestamp(Utc::now().timestamp_millis())?;
        let code_sha256 = archive::digest(content);
        let code_size = content.len() as i64;

        let result = self.db.transaction("publish layer", |tx| {
            let id = tx.insert_one(
                "insert layer",
                "INSERT INTO lambda_layer (name, version, description, created_on, code_size, code_sha256)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    name.as_str(),
                    version,
                    description,
                    created_on.timestamp_millis(),
                    code_size,
                    code_sha256,
                ],
            )?;

            for runtime_id in &runtime_ids {
                tx.insert_one(
                    "insert layer runtime",
                    "INSERT INTO lambda_layer_runtime (lambda_layer_id, lambda_runtime_id)
                        VALUES (?1, ?2)",
                    rusqlite::params![id, runtime_id],
                )?;
            }
            Ok(id)
        });

        let id = match result {
            Ok(id) => id,
            Err(e) => {
                if let Err(cleanup) = std::fs::remove_file(&archive_path) {
                    tracing::warn!(
                        path = %archive_path.display(),
                        error = %cleanup,
                        "Unable to clean up failed layer publish"
                    );
                }
                return Err(e);
            }
        };

        tracing::info!(layer = %name, version = version, "Layer published");

        let mut compatible_runtimes = compatible_runtimes.to_vec();
        compatible_runtimes.sort();
        compatible_runtimes.dedup();

        Ok(LambdaLayer {
            id,
            name: name.clone(),
            version,
            description: description.to_string(),
            compatible_runtimes,
            code_sha256,
            code_size,
            created_on,
        })
    }

    pub fn layer_version(&self, name: &LayerName, version: u32) -> NimbusResult<LambdaLayer> {
        self.db.read(|conn| {
            load_layer(conn, name, version)?.ok_or_else(|| NimbusError::LayerNotFound {
                name: name.to_string(),
                version: version.to_string(),
            })
        })
    }

    /// Every version of a layer, ascending.
    pub fn layer_versions(&self, name: &LayerName) -> NimbusResult<Vec<LambdaLayer>> {
        let sql = format!("SELECT {LAYER_COLUMNS} FROM lambda_layer WHERE name = ?1 ORDER BY version");
        self.db.read(|conn| {
            conn.query_all("layer versions", &sql, [name.as_str()], LayerRow::from_row)?
                .into_iter()
                .map(|row| hydrate_layer(conn, row))
                .collect()
        })
    }

    /// Persist a new queue subscription for an existing function.
    pub fn create_event_source(
        &self,
        arn: &str,
        function: &FunctionName,
        batch_size: u32,
    ) -> NimbusResult<EventSource> {
        // Fails with FunctionNotFound for unknown targets.
        self.latest_by_name(function)?;

        let source = EventSource {
            id: Uuid::new_v4(),
            arn: arn.to_string(),
            function: function.clone(),
            batch_size,
            enabled: true,
            last_modified: timestamp(Utc::now().timestamp_millis())?,
        };

        self.db.transaction("create event source", |tx| {
            tx.insert_one(
                "insert event source",
                "INSERT INTO lambda_event_source (uuid, arn, function_name, batch_size, enabled,
                        last_modified_on)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    source.id.to_string(),
                    source.arn,
                    source.function.as_str(),
                    source.batch_size,
                    source.enabled,
                    source.last_modified.timestamp_millis(),
                ],
            )?;
            Ok(())
        })?;

        tracing::info!(
            event_source = %source.id,
            queue_arn = %source.arn,
            function = %source.function,
            "Event source created"
        );

        Ok(source)
    }

    pub fn event_source(&self, id: &Uuid) -> NimbusResult<EventSource> {
        self.db
            .read(|conn| {
                Ok(conn.query_single(
                    "event source",
                    "SELECT uuid, arn, function_name, batch_size, enabled, last_modified_on
                        FROM lambda_event_source WHERE uuid = ?1",
                    [id.to_string()],
                    event_source_row,
                )?)
            })?
            .ok_or_else(|| NimbusError::EventSourceNotFound { id: id.to_string() })?
            .try_into()
    }

    /// Every persisted event source, in creation order.
    pub fn event_sources(&self) -> NimbusResult<Vec<EventSource>> {
        self.db
            .read(|conn| {
                Ok(conn.query_all(
                    "event sources",
                    "SELECT uuid, arn, function_name, batch_size, enabled, last_modified_on
                        FROM lambda_event_source ORDER BY id",
                    [],
                    event_source_row,
                )?)
            })?
            .into_iter()
            .map(EventSource::try_from)
            .collect()
    }
}

type EventSourceRow = (String, String, String, u32, bool, i64);

fn event_source_row(r: &Row<'_>) -> rusqlite::Result<EventSourceRow> {
    Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?))
}

impl TryFrom<EventSourceRow> for EventSource {
    type Error = NimbusError;

    fn try_from(row: EventSourceRow) -> Result<Self, Self::Error> {
        let (id, arn, function, batch_size, enabled, last_modified) = row;
        Ok(Self {
            id: Uuid::parse_str(&id).map_err(|e| malformed(format!("event source id {id}: {e}")))?,
            arn,
            function: FunctionName::new(function)?,
            batch_size,
            enabled,
            last_modified: timestamp(last_modified)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lambda::archive::zip_of;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: FunctionStore,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.migrate(MIGRATIONS).unwrap();
        let store = FunctionStore::new(db, dir.path());
        store
            .seed_runtimes(&[rt("python3.6"), rt("python3.8")])
            .unwrap();
        Fixture { _dir: dir, store }
    }

    fn rt(name: &str) -> Runtime {
        Runtime::new(name).unwrap()
    }

    fn fname(name: &str) -> FunctionName {
        FunctionName::new(name).unwrap()
    }

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn hello(runtime: &str) -> NewFunction {
        NewFunction::new(fname("hello"), "app.handler", rt(runtime))
    }

    #[test]
    fn test_deploy_increments_versions() {
        let f = fixture();
        let first = f.store.deploy(hello("python3.8"), &zip_of(&[("app.py", "v1")])).unwrap();
        let second = f.store.deploy(hello("python3.8"), &zip_of(&[("app.py", "v2")])).unwrap();
        let third = f.store.deploy(hello("python3.8"), &zip_of(&[("app.py", "v3")])).unwrap();

        assert_eq!((first.version, second.version, third.version), (1, 2, 3));
        assert_ne!(first.code_sha256, second.code_sha256);
        assert_eq!(f.store.latest_by_name(&fname("hello")).unwrap().version, 3);
        assert_eq!(f.store.versions_by_name(&fname("hello")).unwrap().len(), 3);
    }

    #[test]
    fn test_deploy_unpacks_code_per_version() {
        let f = fixture();
        let function = f
            .store
            .deploy(hello("python3.8"), &zip_of(&[("app.py", "print(1)")]))
            .unwrap();
        let content = function.content_path(f.store.data_path());
        assert_eq!(std::fs::read_to_string(content.join("app.py")).unwrap(), "print(1)");
        assert!(function.layers_path(f.store.data_path()).is_dir());
    }

    #[test]
    fn test_deploy_persists_environment_and_tags() {
        let f = fixture();
        let mut new = hello("python3.8");
        new.environment = env(&[("STAGE", "dev")]);
        new.tags = env(&[("team", "core")]);
        new.memory_size = MemorySize::from_mb(256).unwrap();
        f.store.deploy(new, &zip_of(&[("app.py", "")])).unwrap();

        let stored = f.store.latest_by_name(&fname("hello")).unwrap();
        assert_eq!(stored.environment, env(&[("STAGE", "dev")]));
        assert_eq!(stored.tags, env(&[("team", "core")]));
        assert_eq!(stored.memory_size.megabytes(), 256);
    }

    #[test]
    fn test_deploy_unknown_runtime() {
        let f = fixture();
        let result = f.store.deploy(hello("ruby2.7"), &zip_of(&[("app.rb", "")]));
        assert!(matches!(result, Err(NimbusError::RuntimeNotFound { .. })));
        assert!(f.store.latest_version(&fname("hello")).unwrap().is_none());
    }

    #[test]
    fn test_deploy_invalid_archive_leaves_nothing_behind() {
        let f = fixture();
        let result = f.store.deploy(hello("python3.8"), b"not a zip");
        assert!(matches!(result, Err(NimbusError::Archive { .. })));
        assert!(f.store.versions_by_name(&fname("hello")).unwrap().is_empty());
        let dir = function_version_dir(f.store.data_path(), &fname("hello"), 1);
        assert!(!dir.exists());
    }

    #[test]
    fn test_latest_by_name_not_found() {
        let f = fixture();
        assert!(matches!(
            f.store.latest_by_name(&fname("missing")),
            Err(NimbusError::FunctionNotFound { .. })
        ));
    }

    #[test]
    fn test_layer_compatibility_is_enforced() {
        let f = fixture();
        let lib = LayerName::new("libA").unwrap();
        let layer = f
            .store
            .publish_layer(&lib, "shared", &[rt("python3.8")], &zip_of(&[("python/liba.py", "")]))
            .unwrap();
        assert_eq!(layer.version, 1);

        let mut ok = hello("python3.8");
        ok.layers = vec![layer.layer_ref()];
        let function = f.store.deploy(ok, &zip_of(&[("app.py", "")])).unwrap();
        assert!(function
            .layers_path(f.store.data_path())
            .join("python/liba.py")
            .is_file());
        assert_eq!(f.store.layers_for_function(&function).unwrap(), vec![layer.clone()]);

        let mut incompatible = hello("python3.6");
        incompatible.layers = vec![layer.layer_ref()];
        let result = f.store.deploy(incompatible, &zip_of(&[("app.py", "")]));
        assert!(matches!(result, Err(NimbusError::IncompatibleLayer { .. })));

        let mut missing = hello("python3.8");
        missing.layers = vec![LayerRef::new(lib, 2)];
        let result = f.store.deploy(missing, &zip_of(&[("app.py", "")]));
        assert!(matches!(result, Err(NimbusError::LayerNotFound { .. })));

        // Only the compatible deploy committed.
        assert_eq!(f.store.versions_by_name(&fname("hello")).unwrap().len(), 1);
    }

    #[test]
    fn test_publish_layer_versions() {
        let f = fixture();
        let lib = LayerName::new("libA").unwrap();
        let v1 = f.store.publish_layer(&lib, "one", &[rt("python3.8")], &zip_of(&[("a", "1")])).unwrap();
        let v2 = f
            .store
            .publish_layer(&lib, "two", &[rt("python3.8"), rt("python3.6")], &zip_of(&[("a", "2")]))
            .unwrap();

        assert_eq!((v1.version, v2.version), (1, 2));
        assert!(v2.archive_path(f.store.data_path()).is_file());
        assert_eq!(f.store.layer_versions(&lib).unwrap().len(), 2);

        let stored = f.store.layer_version(&lib, 2).unwrap();
        assert_eq!(stored.compatible_runtimes, vec![rt("python3.6"), rt("python3.8")]);
        assert_eq!(stored.description, "two");
    }

    #[test]
    fn test_publish_layer_unknown_runtime() {
        let f = fixture();
        let lib = LayerName::new("libA").unwrap();
        let result = f.store.publish_layer(&lib, "", &[rt("go1.x")], &zip_of(&[("a", "")]));
        assert!(matches!(result, Err(NimbusError::RuntimeNotFound { .. })));
        assert!(f.store.layer_versions(&lib).unwrap().is_empty());
    }

    #[test]
    fn test_failed_layer_publish_removes_archive() {
        let f = fixture();
        f.store
            .db
            .transaction("install trigger", |tx| {
                tx.execute_batch(
                    "CREATE TRIGGER reject_layer_runtime BEFORE INSERT ON lambda_layer_runtime
                        BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
                )
                .unwrap();
                Ok(())
            })
            .unwrap();

        let lib = LayerName::new("libA").unwrap();
        let result = f.store.publish_layer(&lib, "", &[rt("python3.8")], &zip_of(&[("a", "")]));
        assert!(result.is_err());
        assert!(f.store.layer_versions(&lib).unwrap().is_empty());
        assert!(!layer_archive_path(f.store.data_path(), &lib, 1).exists());
    }

    #[test]
    fn test_upsert_environment_applies_diff() {
        let f = fixture();
        let mut new = hello("python3.8");
        new.environment = env(&[("KEEP", "1"), ("CHANGE", "old"), ("DROP", "x")]);
        let function = f.store.deploy(new, &zip_of(&[("app.py", "")])).unwrap();

        let target = env(&[("KEEP", "1"), ("CHANGE", "new"), ("ADD", "y")]);
        let diff = f.store.upsert_environment(&function, &target).unwrap();
        assert_eq!(diff.added, env(&[("ADD", "y")]));
        assert_eq!(diff.changed, env(&[("CHANGE", "new")]));
        assert_eq!(diff.removed, vec!["DROP".to_string()]);

        let stored = f.store.latest_by_name(&fname("hello")).unwrap();
        assert_eq!(stored.environment, target);
        assert_eq!(stored.version, 1);
    }

    #[test]
    fn test_upsert_environment_is_idempotent() {
        let f = fixture();
        let function = f.store.deploy(hello("python3.8"), &zip_of(&[("app.py", "")])).unwrap();
        let target = env(&[("A", "1")]);

        let first = f.store.upsert_environment(&function, &target).unwrap();
        assert_eq!(first.writes(), 1);

        let before = f.store.latest_by_name(&fname("hello")).unwrap();
        let second = f.store.upsert_environment(&function, &target).unwrap();
        assert!(second.is_empty());
        assert_eq!(second.writes(), 0);
        let after = f.store.latest_by_name(&fname("hello")).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_latest_functions() {
        let f = fixture();
        f.store.deploy(hello("python3.8"), &zip_of(&[("a", "")])).unwrap();
        f.store.deploy(hello("python3.8"), &zip_of(&[("a", "2")])).unwrap();
        f.store
            .deploy(NewFunction::new(fname("other"), "h", rt("python3.6")), &zip_of(&[("a", "")]))
            .unwrap();

        let latest = f.store.latest_functions().unwrap();
        let summary: Vec<(&str, u32)> = latest.iter().map(|f| (f.name.as_str(), f.version)).collect();
        assert_eq!(summary, vec![("hello", 2), ("other", 1)]);
    }

    #[test]
    fn test_event_sources_round_trip() {
        let f = fixture();
        f.store.deploy(hello("python3.8"), &zip_of(&[("a", "")])).unwrap();
        let arn = "arn:aws:sqs:us-west-2:271828182845:orders";

        let created = f.store.create_event_source(arn, &fname("hello"), 5).unwrap();
        assert_eq!(f.store.event_source(&created.id).unwrap(), created);
        assert_eq!(f.store.event_sources().unwrap(), vec![created]);

        let missing = f.store.create_event_source(arn, &fname("nobody"), 5);
        assert!(matches!(missing, Err(NimbusError::FunctionNotFound { .. })));
        assert!(matches!(
            f.store.event_source(&Uuid::new_v4()),
            Err(NimbusError::EventSourceNotFound { .. })
        ));
    }
}
