//! SQLite-backed aggregation store
//!
//! Groups live in a single `error_groups` table keyed by a unique fingerprint.
//! Counters are advanced by one `UPDATE` statement that does the hourly/daily
//! windowing in SQL, inside an immediate transaction so concurrent writers to
//! the same fingerprint serialize on the database lock. Timestamps are stored
//! as integer milliseconds since the Unix epoch.
//!
//! The `*_sync` functions take a plain connection and are the unit of work;
//! [`SqliteStore`] runs them on the blocking thread pool.

use crate::aggregator::group::{ErrorGroup, GroupOrder, GroupQuery, NewErrorGroup, OccurrenceUpdate};
use crate::aggregator::store::{AggregationStore, StoreFuture};
use crate::error::StoreError;
use crate::events::{Context, ExceptionKind, Level, RequestMeta, StackFrame, Timestamp};
use crate::severity;
use chrono::{DateTime, Utc};
use log::debug;
use rusqlite::types::Type;
use rusqlite::{named_params, params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const HOUR_MS: i64 = 3_600_000;
const DAY_MS: i64 = 86_400_000;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS error_groups (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    fingerprint TEXT NOT NULL UNIQUE,
    classification TEXT NOT NULL,
    exception_kind TEXT NOT NULL DEFAULT 'other',
    message TEXT NOT NULL,
    source_file TEXT,
    source_line INTEGER,
    environment TEXT NOT NULL,
    level TEXT NOT NULL,
    severity_score INTEGER NOT NULL DEFAULT 1,
    context TEXT NOT NULL DEFAULT '{}',
    stack_frames TEXT NOT NULL DEFAULT '[]',
    request_url TEXT,
    request_method TEXT,
    client_ip TEXT,
    user_id TEXT,
    first_occurred_at INTEGER NOT NULL,
    last_occurred_at INTEGER NOT NULL,
    occurrence_count INTEGER NOT NULL DEFAULT 1,
    hourly_count INTEGER NOT NULL DEFAULT 1,
    daily_count INTEGER NOT NULL DEFAULT 1,
    is_resolved INTEGER NOT NULL DEFAULT 0,
    resolved_at INTEGER,
    notification_sent INTEGER NOT NULL DEFAULT 0,
    last_notification_at INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_error_groups_class_env ON error_groups(classification, environment);
CREATE INDEX IF NOT EXISTS idx_error_groups_level_env ON error_groups(level, environment, created_at);
CREATE INDEX IF NOT EXISTS idx_error_groups_severity ON error_groups(severity_score, environment);
CREATE INDEX IF NOT EXISTS idx_error_groups_count ON error_groups(occurrence_count, environment);
CREATE INDEX IF NOT EXISTS idx_error_groups_last ON error_groups(last_occurred_at, environment);
CREATE INDEX IF NOT EXISTS idx_error_groups_resolved ON error_groups(is_resolved);
";

const SELECT_COLUMNS: &str = "fingerprint, classification, exception_kind, message, source_file,
    source_line, environment, level, severity_score, context, stack_frames, request_url,
    request_method, client_ip, user_id, first_occurred_at, last_occurred_at, occurrence_count,
    hourly_count, daily_count, is_resolved, resolved_at, notification_sent, last_notification_at";

const UPDATE_OCCURRENCE: &str = "
UPDATE error_groups SET
    occurrence_count = occurrence_count + :n,
    hourly_count = CASE WHEN :at - last_occurred_at > :hour THEN :n ELSE hourly_count + :n END,
    daily_count = CASE WHEN :at - last_occurred_at > :day THEN :n ELSE daily_count + :n END,
    last_occurred_at = MAX(last_occurred_at, :at),
    level = :level,
    severity_score = :severity,
    context = :context,
    stack_frames = CASE WHEN stack_frames = '[]' THEN :frames ELSE stack_frames END,
    request_url = COALESCE(:url, request_url),
    request_method = COALESCE(:method, request_method),
    client_ip = COALESCE(:client_ip, client_ip),
    user_id = COALESCE(:user_id, user_id),
    is_resolved = CASE WHEN :reopen THEN 0 ELSE is_resolved END,
    resolved_at = CASE WHEN :reopen THEN NULL ELSE resolved_at END,
    updated_at = :now
WHERE fingerprint = :fingerprint";

/// Create the table and indexes if they do not exist
pub fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

fn to_millis(ts: Timestamp) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(idx: usize, ms: i64) -> rusqlite::Result<Timestamp> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn count_column(row: &Row, idx: usize) -> rusqlite::Result<u64> {
    let value: i64 = row.get(idx)?;
    u64::try_from(value).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(idx, value))
}

fn row_to_group(row: &Row) -> rusqlite::Result<ErrorGroup> {
    let kind: String = row.get(2)?;
    let level: String = row.get(7)?;
    let severity: i64 = row.get(8)?;
    let resolved_at: Option<i64> = row.get(21)?;
    let last_notification_at: Option<i64> = row.get(23)?;

    Ok(ErrorGroup {
        fingerprint: row.get(0)?,
        classification: row.get(1)?,
        exception_kind: kind.parse().unwrap_or_default(),
        message: row.get(3)?,
        source_file: row.get(4)?,
        source_line: row.get(5)?,
        environment: row.get(6)?,
        level: Level::parse_lenient(&level),
        severity_score: severity.clamp(severity::MIN_SCORE as i64, severity::MAX_SCORE as i64) as u8,
        context: json_column::<Context>(row, 9)?,
        stack_frames: json_column::<Vec<StackFrame>>(row, 10)?,
        request: RequestMeta {
            url: row.get(11)?,
            method: row.get(12)?,
            client_ip: row.get(13)?,
            user_id: row.get(14)?,
        },
        first_occurred_at: from_millis(15, row.get(15)?)?,
        last_occurred_at: from_millis(16, row.get(16)?)?,
        occurrence_count: count_column(row, 17)?,
        hourly_count: count_column(row, 18)?,
        daily_count: count_column(row, 19)?,
        is_resolved: row.get(20)?,
        resolved_at: resolved_at.map(|ms| from_millis(21, ms)).transpose()?,
        notification_sent: row.get(22)?,
        last_notification_at: last_notification_at
            .map(|ms| from_millis(23, ms))
            .transpose()?,
    })
}

/// Look up one group by fingerprint
pub fn find_by_fingerprint_sync(
    conn: &Connection,
    fingerprint: &str,
) -> Result<Option<ErrorGroup>, StoreError> {
    let sql = format!("SELECT {} FROM error_groups WHERE fingerprint = ?1", SELECT_COLUMNS);
    Ok(conn
        .query_row(&sql, params![fingerprint], row_to_group)
        .optional()?)
}

/// Apply an occurrence batch inside an already-open transaction
fn apply_occurrence_in_tx(
    conn: &Connection,
    fingerprint: &str,
    update: &OccurrenceUpdate,
) -> Result<Option<ErrorGroup>, StoreError> {
    // The write lock is held, so reading the row here cannot race another writer.
    let current: Option<(String, String, i64)> = conn
        .query_row(
            "SELECT context, exception_kind, occurrence_count FROM error_groups WHERE fingerprint = ?1",
            params![fingerprint],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    let Some((stored_context, kind, count)) = current else {
        return Ok(None);
    };

    let mut context: Context = serde_json::from_str(&stored_context)?;
    context.extend(update.context.iter().map(|(k, v)| (k.clone(), v.clone())));
    let kind: ExceptionKind = kind.parse().unwrap_or_default();
    let new_count = u64::try_from(count).unwrap_or(0) + update.count;
    let score = severity::score(update.level, kind, new_count);
    let frames = if update.stack_frames.is_empty() {
        "[]".to_string()
    } else {
        serde_json::to_string(&update.stack_frames)?
    };
    let request = update.request.clone().unwrap_or_default();

    conn.execute(
        UPDATE_OCCURRENCE,
        named_params! {
            ":n": update.count as i64,
            ":at": to_millis(update.at),
            ":hour": HOUR_MS,
            ":day": DAY_MS,
            ":level": update.level.as_str(),
            ":severity": score,
            ":context": serde_json::to_string(&context)?,
            ":frames": frames,
            ":url": request.url,
            ":method": request.method,
            ":client_ip": request.client_ip,
            ":user_id": request.user_id,
            ":reopen": update.reopen_resolved,
            ":now": to_millis(Utc::now()),
            ":fingerprint": fingerprint,
        },
    )?;

    find_by_fingerprint_sync(conn, fingerprint)
}

/// Atomically apply a batch of occurrences to an existing group
pub fn record_occurrence_sync(
    conn: &mut Connection,
    fingerprint: &str,
    update: &OccurrenceUpdate,
) -> Result<Option<ErrorGroup>, StoreError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let group = apply_occurrence_in_tx(&tx, fingerprint, update)?;
    tx.commit()?;
    Ok(group)
}

/// Insert a new group, or record one occurrence if it already exists
pub fn create_sync(conn: &mut Connection, group: &NewErrorGroup) -> Result<ErrorGroup, StoreError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let request = group.request.clone().unwrap_or_default();
    let at = to_millis(group.at);

    let inserted = tx.execute(
        "INSERT INTO error_groups (
            fingerprint, classification, exception_kind, message, source_file, source_line,
            environment, level, severity_score, context, stack_frames, request_url,
            request_method, client_ip, user_id, first_occurred_at, last_occurred_at,
            created_at, updated_at
         ) VALUES (
            :fingerprint, :classification, :kind, :message, :file, :line,
            :environment, :level, :severity, :context, :frames, :url,
            :method, :client_ip, :user_id, :at, :at, :at, :at
         )
         ON CONFLICT(fingerprint) DO NOTHING",
        named_params! {
            ":fingerprint": group.fingerprint,
            ":classification": group.classification,
            ":kind": group.exception_kind.as_str(),
            ":message": group.message,
            ":file": group.source_file,
            ":line": group.source_line,
            ":environment": group.environment,
            ":level": group.level.as_str(),
            ":severity": severity::score(group.level, group.exception_kind, 1),
            ":context": serde_json::to_string(&group.context)?,
            ":frames": serde_json::to_string(&group.stack_frames)?,
            ":url": request.url,
            ":method": request.method,
            ":client_ip": request.client_ip,
            ":user_id": request.user_id,
            ":at": at,
        },
    )?;

    let stored = if inserted == 0 {
        debug!(target: "errwatch::internal", "Group {} already exists, recording occurrence", group.fingerprint);
        apply_occurrence_in_tx(&tx, &group.fingerprint, &group.as_update())?
    } else {
        find_by_fingerprint_sync(&tx, &group.fingerprint)?
    };
    tx.commit()?;

    stored.ok_or_else(|| StoreError::Database(format!("group {} vanished after write", group.fingerprint)))
}

/// Mark a group resolved
pub fn mark_resolved_sync(conn: &Connection, fingerprint: &str, at: Timestamp) -> Result<bool, StoreError> {
    let changed = conn.execute(
        "UPDATE error_groups SET is_resolved = 1, resolved_at = ?2, updated_at = ?2 WHERE fingerprint = ?1",
        params![fingerprint, to_millis(at)],
    )?;
    Ok(changed > 0)
}

/// Record that a notification was initiated for a group
pub fn record_notification_sent_sync(
    conn: &Connection,
    fingerprint: &str,
    at: Timestamp,
) -> Result<bool, StoreError> {
    let changed = conn.execute(
        "UPDATE error_groups SET notification_sent = 1, last_notification_at = ?2, updated_at = ?2
         WHERE fingerprint = ?1",
        params![fingerprint, to_millis(at)],
    )?;
    Ok(changed > 0)
}

/// List groups matching a query
pub fn list_sync(conn: &Connection, query: &GroupQuery) -> Result<Vec<ErrorGroup>, StoreError> {
    let mut clauses: Vec<&str> = Vec::new();
    let mut values: Vec<rusqlite::types::Value> = Vec::new();

    if let Some(env) = &query.environment {
        clauses.push("environment = ?");
        values.push(env.clone().into());
    }
    if query.unresolved_only {
        clauses.push("is_resolved = 0");
    }
    if let Some(min) = query.min_severity {
        clauses.push("severity_score >= ?");
        values.push(i64::from(min).into());
    }
    if let Some(min) = query.min_occurrences {
        clauses.push("occurrence_count >= ?");
        values.push((min.min(i64::MAX as u64) as i64).into());
    }
    if let Some(since) = query.since {
        clauses.push("last_occurred_at >= ?");
        values.push(to_millis(since).into());
    }

    let mut sql = format!("SELECT {} FROM error_groups", SELECT_COLUMNS);
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(match query.order {
        GroupOrder::LastOccurred => " ORDER BY last_occurred_at DESC",
        GroupOrder::OccurrenceCount => " ORDER BY occurrence_count DESC, last_occurred_at DESC",
        GroupOrder::HourlyCount => " ORDER BY hourly_count DESC, last_occurred_at DESC",
    });
    if let Some(limit) = query.limit {
        sql.push_str(" LIMIT ?");
        values.push((limit.min(i64::MAX as usize) as i64).into());
    }

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(values), row_to_group)?;
    let mut groups = Vec::new();
    for row in rows {
        groups.push(row?);
    }
    Ok(groups)
}

/// Delete resolved groups whose resolution is older than `cutoff`
pub fn delete_resolved_before_sync(conn: &Connection, cutoff: Timestamp) -> Result<u64, StoreError> {
    let deleted = conn.execute(
        "DELETE FROM error_groups WHERE is_resolved = 1 AND resolved_at IS NOT NULL AND resolved_at < ?1",
        params![to_millis(cutoff)],
    )?;
    Ok(deleted as u64)
}

/// Aggregation store persisted in a SQLite database
#[derive(Debug, Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a database file and ensure the schema exists
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::from_connection(conn)
    }

    /// Private in-memory database, mainly for tests
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Unavailable("sqlite connection lock poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("blocking store task failed: {}", e)))?
    }
}

impl AggregationStore for SqliteStore {
    fn find_by_fingerprint<'a>(&'a self, fingerprint: &'a str) -> StoreFuture<'a, Option<ErrorGroup>> {
        let fingerprint = fingerprint.to_string();
        Box::pin(async move { self.run(move |conn| find_by_fingerprint_sync(conn, &fingerprint)).await })
    }

    fn create<'a>(&'a self, group: NewErrorGroup) -> StoreFuture<'a, ErrorGroup> {
        Box::pin(async move { self.run(move |conn| create_sync(conn, &group)).await })
    }

    fn record_occurrence<'a>(
        &'a self,
        fingerprint: &'a str,
        update: OccurrenceUpdate,
    ) -> StoreFuture<'a, Option<ErrorGroup>> {
        let fingerprint = fingerprint.to_string();
        Box::pin(async move {
            self.run(move |conn| record_occurrence_sync(conn, &fingerprint, &update))
                .await
        })
    }

    fn mark_resolved<'a>(&'a self, fingerprint: &'a str, at: Timestamp) -> StoreFuture<'a, bool> {
        let fingerprint = fingerprint.to_string();
        Box::pin(async move { self.run(move |conn| mark_resolved_sync(conn, &fingerprint, at)).await })
    }

    fn record_notification_sent<'a>(
        &'a self,
        fingerprint: &'a str,
        at: Timestamp,
    ) -> StoreFuture<'a, bool> {
        let fingerprint = fingerprint.to_string();
        Box::pin(async move {
            self.run(move |conn| record_notification_sent_sync(conn, &fingerprint, at))
                .await
        })
    }

    fn list<'a>(&'a self, query: GroupQuery) -> StoreFuture<'a, Vec<ErrorGroup>> {
        Box::pin(async move { self.run(move |conn| list_sync(conn, &query)).await })
    }

    fn delete_resolved_before<'a>(&'a self, cutoff: Timestamp) -> StoreFuture<'a, u64> {
        Box::pin(async move { self.run(move |conn| delete_resolved_before_sync(conn, cutoff)).await })
    }
}
