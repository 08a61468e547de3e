//! SQLite persistence for BOM versions and work sessions.
//!
//! `bom_versions` is append-only: a row is never updated once written.
//! `work_sessions` is upserted on every session transition.

use bomwatch_model::{
    AssemblyKey, BomChangeSet, BomItem, BomSnapshot, BomVersion, ItemChange, SessionState,
    WorkSession,
};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{
    params, Connection, ErrorCode, OpenFlags, OptionalExtension, Row, TransactionBehavior,
};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use tracing::{debug, info};

use crate::backoff::RetryPolicy;
use crate::error::{MonitorError, Result};
use crate::sessions::SessionStore;

/// Amounts are compared at the same precision the content hash uses.
const AMOUNT_SCALE: f64 = 1_000_000.0;

pub struct Db {
    path: PathBuf,
    allocation_policy: RetryPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMetadata {
    pub extracted_by: String,
    pub extracted_at: DateTime<Utc>,
    /// Project recorded on the row when it differs from the key's, e.g. one
    /// supplied by the machine directory.
    pub project_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssemblyKeySummary {
    pub assembly_key: String,
    pub file_path: String,
    pub version_count: u32,
    pub latest_version: u32,
    pub last_extracted_at: String,
}

impl Db {
    pub fn new(path: PathBuf) -> Result<Self> {
        let db = Self {
            path,
            allocation_policy: RetryPolicy::version_allocation(),
        };
        db.init_schema()?;
        Ok(db)
    }

    pub fn with_allocation_policy(mut self, policy: RetryPolicy) -> Self {
        self.allocation_policy = policy;
        self
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Appends the next version for `key`. The number is allocated and the row
    /// inserted inside one IMMEDIATE transaction; a concurrent writer that
    /// wins the same number makes this attempt retry.
    pub fn create_version(
        &self,
        key: &AssemblyKey,
        snapshot: &BomSnapshot,
        metadata: &VersionMetadata,
    ) -> Result<BomVersion> {
        let assembly_key = key.to_string();
        let items_json = serde_json::to_string(&snapshot.items)
            .map_err(|err| MonitorError::Storage(format!("Failed to serialize BOM items: {}", err)))?;
        let id = ulid::Ulid::new().to_string();
        let extracted_at = timestamp_text(metadata.extracted_at);
        let project_id = metadata
            .project_id
            .clone()
            .or_else(|| key.project_id.clone());

        let mut conn = self.open()?;
        let version_number =
            allocate_with_retry(&self.allocation_policy, &assembly_key, |_attempt| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let current: Option<u32> = tx.query_row(
                    "SELECT MAX(version_number) FROM bom_versions WHERE assembly_key = ?1",
                    params![assembly_key],
                    |row| row.get(0),
                )?;
                let next = current.unwrap_or(0) + 1;
                tx.execute(
                    "INSERT INTO bom_versions \
                        (id, assembly_key, project_id, machine_id, file_path, version_number, \
                         items, item_count, content_hash, extracted_by, extracted_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    params![
                        id,
                        assembly_key,
                        project_id,
                        key.machine_id,
                        key.file_path,
                        next,
                        items_json,
                        snapshot.items.len() as i64,
                        snapshot.content_hash,
                        metadata.extracted_by,
                        extracted_at
                    ],
                )?;
                tx.commit()?;
                Ok(next)
            })?;

        info!(
            assembly_key = %assembly_key,
            version = version_number,
            items = snapshot.items.len(),
            "Created BOM version"
        );

        Ok(BomVersion {
            id,
            assembly_key,
            project_id,
            machine_id: key.machine_id,
            file_path: key.file_path.clone(),
            version_number,
            items: snapshot.items.clone(),
            content_hash: snapshot.content_hash.clone(),
            extracted_by: metadata.extracted_by.clone(),
            extracted_at: metadata.extracted_at,
        })
    }

    pub fn versions(&self, assembly_key: &str) -> Result<Vec<BomVersion>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, assembly_key, project_id, machine_id, file_path, version_number, \
                        items, content_hash, extracted_by, extracted_at \
                 FROM bom_versions WHERE assembly_key = ?1 ORDER BY version_number ASC",
            )?;
            let rows = stmt.query_map(params![assembly_key], version_from_row)?;
            let mut versions = Vec::new();
            for row in rows {
                versions.push(row?);
            }
            Ok(versions)
        })
    }

    pub fn version(&self, assembly_key: &str, version_number: u32) -> Result<Option<BomVersion>> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT id, assembly_key, project_id, machine_id, file_path, version_number, \
                        items, content_hash, extracted_by, extracted_at \
                 FROM bom_versions WHERE assembly_key = ?1 AND version_number = ?2",
                params![assembly_key, version_number],
                version_from_row,
            )
            .optional()
            .map_err(MonitorError::from)
        })
    }

    pub fn latest_hash(&self, assembly_key: &str) -> Result<Option<String>> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT content_hash FROM bom_versions WHERE assembly_key = ?1 \
                 ORDER BY version_number DESC LIMIT 1",
                params![assembly_key],
                |row| row.get(0),
            )
            .optional()
            .map_err(MonitorError::from)
        })
    }

    pub fn assembly_keys(&self) -> Result<Vec<AssemblyKeySummary>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT assembly_key, MAX(file_path), COUNT(*), MAX(version_number), MAX(extracted_at) \
                 FROM bom_versions GROUP BY assembly_key ORDER BY assembly_key ASC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(AssemblyKeySummary {
                    assembly_key: row.get(0)?,
                    file_path: row.get(1)?,
                    version_count: row.get(2)?,
                    latest_version: row.get(3)?,
                    last_extracted_at: row.get(4)?,
                })
            })?;
            let mut keys = Vec::new();
            for row in rows {
                keys.push(row?);
            }
            Ok(keys)
        })
    }

    /// Item-level difference going from version `from` to version `to`.
    pub fn compare(&self, assembly_key: &str, from: u32, to: u32) -> Result<BomChangeSet> {
        let before = self.require_version(assembly_key, from)?;
        let after = self.require_version(assembly_key, to)?;
        Ok(diff_items(&before.items, &after.items))
    }

    fn require_version(&self, assembly_key: &str, version: u32) -> Result<BomVersion> {
        self.version(assembly_key, version)?
            .ok_or_else(|| MonitorError::VersionNotFound {
                assembly_key: assembly_key.to_string(),
                version,
            })
    }

    pub fn upsert_session(&self, session: &WorkSession) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO work_sessions \
                    (id, file_path, project_id, machine_id, engineer, start_time, end_time, \
                     last_save_at, save_count, state, duration_secs) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11) \
                 ON CONFLICT(id) DO UPDATE SET \
                    project_id = excluded.project_id, \
                    machine_id = excluded.machine_id, \
                    end_time = excluded.end_time, \
                    last_save_at = excluded.last_save_at, \
                    save_count = excluded.save_count, \
                    state = excluded.state, \
                    duration_secs = excluded.duration_secs",
                params![
                    session.id,
                    session.file_path,
                    session.project_id,
                    session.machine_id,
                    session.engineer,
                    timestamp_text(session.start_time),
                    session.end_time.map(timestamp_text),
                    session.last_save_at.map(timestamp_text),
                    session.save_count,
                    session.state.as_str(),
                    session.duration().map(|value| value.num_seconds())
                ],
            )?;
            debug!(session_id = %session.id, state = session.state.as_str(), "Persisted work session");
            Ok(())
        })
    }

    /// Most recent sessions first.
    pub fn list_sessions(&self, limit: usize) -> Result<Vec<WorkSession>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, file_path, project_id, machine_id, engineer, start_time, end_time, \
                        last_save_at, save_count, state \
                 FROM work_sessions ORDER BY start_time DESC, id DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], session_from_row)?;
            let mut sessions = Vec::new();
            for row in rows {
                sessions.push(row?);
            }
            Ok(sessions)
        })
    }

    fn init_schema(&self) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "BEGIN;
                 CREATE TABLE IF NOT EXISTS bom_versions (
                    id TEXT PRIMARY KEY,
                    assembly_key TEXT NOT NULL,
                    project_id TEXT,
                    machine_id INTEGER,
                    file_path TEXT NOT NULL,
                    version_number INTEGER NOT NULL,
                    items TEXT NOT NULL,
                    item_count INTEGER NOT NULL DEFAULT 0,
                    content_hash TEXT NOT NULL,
                    extracted_by TEXT NOT NULL,
                    extracted_at TEXT NOT NULL,
                    UNIQUE (assembly_key, version_number)
                 );
                 CREATE INDEX IF NOT EXISTS idx_bom_versions_key
                    ON bom_versions (assembly_key, version_number DESC);
                 CREATE TABLE IF NOT EXISTS work_sessions (
                    id TEXT PRIMARY KEY,
                    file_path TEXT NOT NULL,
                    project_id TEXT,
                    machine_id INTEGER,
                    engineer TEXT NOT NULL,
                    start_time TEXT NOT NULL,
                    end_time TEXT,
                    last_save_at TEXT,
                    save_count INTEGER NOT NULL DEFAULT 0,
                    state TEXT NOT NULL,
                    duration_secs INTEGER
                 );
                 CREATE INDEX IF NOT EXISTS idx_work_sessions_start
                    ON work_sessions (start_time DESC);
                 COMMIT;",
            )?;
            Ok(())
        })
    }

    fn with_connection<T>(&self, op: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.open()?;
        op(&mut conn)
    }

    fn open(&self) -> Result<Connection> {
        if let Some(parent) = self.path.parent() {
            fs_err::create_dir_all(parent).map_err(|err| {
                MonitorError::Storage(format!("Failed to create data dir: {}", err))
            })?;
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let conn = Connection::open_with_flags(&self.path, flags)
            .map_err(|err| MonitorError::Storage(format!("Failed to open sqlite db: {}", err)))?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;

        Ok(conn)
    }
}

impl SessionStore for Db {
    fn upsert_session(&self, session: &WorkSession) -> Result<()> {
        Db::upsert_session(self, session)
    }
}

/// Runs one allocation attempt per call of `op`. Unique-constraint and busy
/// failures are retried; once the budget is spent they surface as
/// [`MonitorError::VersionConflict`].
pub fn allocate_with_retry<T>(
    policy: &RetryPolicy,
    assembly_key: &str,
    op: impl FnMut(u32) -> rusqlite::Result<T>,
) -> Result<T> {
    policy
        .run("version allocation", op, is_contention)
        .map_err(|err| {
            if is_contention(&err) {
                MonitorError::VersionConflict {
                    assembly_key: assembly_key.to_string(),
                    attempts: policy.max_attempts.max(1),
                }
            } else {
                MonitorError::from(err)
            }
        })
}

fn is_contention(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::ConstraintViolation)
            | Some(ErrorCode::DatabaseBusy)
            | Some(ErrorCode::DatabaseLocked)
    )
}

/// Matches items by `(level, part_number)`. Repeated identifiers pair up in
/// order; leftovers on either side are additions or removals.
pub fn diff_items(before: &[BomItem], after: &[BomItem]) -> BomChangeSet {
    let mut remaining: BTreeMap<(u32, &str), VecDeque<&BomItem>> = BTreeMap::new();
    for item in before {
        remaining.entry(item.identifier()).or_default().push_back(item);
    }

    let mut changes = BomChangeSet::default();
    for item in after {
        let previous = remaining
            .get_mut(&item.identifier())
            .and_then(|queue| queue.pop_front());
        match previous {
            Some(previous) => {
                let fields = changed_fields(previous, item);
                if !fields.is_empty() {
                    changes.changed.push(ItemChange {
                        before: previous.clone(),
                        after: item.clone(),
                        fields,
                    });
                }
            }
            None => changes.added.push(item.clone()),
        }
    }
    changes.removed = remaining
        .into_values()
        .flatten()
        .cloned()
        .collect();

    changes
        .added
        .sort_by(|a, b| a.identifier().cmp(&b.identifier()));
    changes
        .changed
        .sort_by(|a, b| a.after.identifier().cmp(&b.after.identifier()));
    changes
}

fn changed_fields(before: &BomItem, after: &BomItem) -> Vec<&'static str> {
    let mut fields = Vec::new();
    if !same_amount(before.quantity, after.quantity) {
        fields.push("quantity");
    }
    if before.description != after.description {
        fields.push("description");
    }
    if before.material != after.material {
        fields.push("material");
    }
    let mass_equal = match (before.mass, after.mass) {
        (Some(a), Some(b)) => same_amount(a, b),
        (None, None) => true,
        _ => false,
    };
    if !mass_equal {
        fields.push("mass");
    }
    fields
}

fn same_amount(a: f64, b: f64) -> bool {
    (a * AMOUNT_SCALE).round() == (b * AMOUNT_SCALE).round()
}

fn version_from_row(row: &Row<'_>) -> rusqlite::Result<BomVersion> {
    let items_json: String = row.get(6)?;
    let items: Vec<BomItem> = serde_json::from_str(&items_json)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(err)))?;
    Ok(BomVersion {
        id: row.get(0)?,
        assembly_key: row.get(1)?,
        project_id: row.get(2)?,
        machine_id: row.get(3)?,
        file_path: row.get(4)?,
        version_number: row.get(5)?,
        items,
        content_hash: row.get(7)?,
        extracted_by: row.get(8)?,
        extracted_at: timestamp_column(row, 9)?,
    })
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<WorkSession> {
    let state: String = row.get(9)?;
    let state = SessionState::from_str(&state).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            9,
            Type::Text,
            format!("unknown session state: {}", state).into(),
        )
    })?;
    Ok(WorkSession {
        id: row.get(0)?,
        file_path: row.get(1)?,
        project_id: row.get(2)?,
        machine_id: row.get(3)?,
        engineer: row.get(4)?,
        start_time: timestamp_column(row, 5)?,
        end_time: optional_timestamp_column(row, 6)?,
        last_save_at: optional_timestamp_column(row, 7)?,
        save_count: row.get(8)?,
        state,
    })
}

fn timestamp_column(row: &Row<'_>, index: usize) -> rusqlite::Result<DateTime<Utc>> {
    let value: String = row.get(index)?;
    parse_rfc3339(&value).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            index,
            Type::Text,
            format!("invalid timestamp: {}", value).into(),
        )
    })
}

fn optional_timestamp_column(row: &Row<'_>, index: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let value: Option<String> = row.get(index)?;
    match value {
        Some(_) => timestamp_column(row, index).map(Some),
        None => Ok(None),
    }
}

/// Fixed-width UTC timestamps so text ordering in SQL matches time ordering.
fn timestamp_text(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
