//! rollcall-store — SQLite persistence for identities and attendance.
//!
//! Connections are handed out from a small idle pool through
//! [`PooledConnection`], which returns the connection on drop so it is released
//! on every path, including errors. One check-in per identity and day is
//! enforced by a `UNIQUE (identity_id, day)` constraint with a conflict-ignoring
//! insert, not by read-then-write.

mod migrations;

use chrono::{NaiveDate, NaiveDateTime, Utc};
use rollcall_core::store::{AttendanceStore, InsertOutcome, StoreError};
use rollcall_core::types::{
    AttendanceLogEntry, AttendanceRecord, AttendanceStatus, Embedding, EnrolledFace, Identity,
    IdentitySummary,
};
use rusqlite::{params, Connection, OptionalExtension};
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

const DAY_FORMAT: &str = "%Y-%m-%d";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";
const TIMESTAMP_PARSE: &str = "%Y-%m-%d %H:%M:%S%.f";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_MAX_IDLE: usize = 4;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("could not create database directory {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("schema: {0}")]
    Schema(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<DbError> for StoreError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::Corrupt(msg) => StoreError::Corrupt(msg),
            DbError::CreateDir { .. } => StoreError::Unavailable(err.to_string()),
            other => StoreError::Backend(Box::new(other)),
        }
    }
}

/// SQLite-backed [`AttendanceStore`].
pub struct SqliteStore {
    path: PathBuf,
    idle: Mutex<Vec<Connection>>,
    max_idle: usize,
}

/// A connection borrowed from the store; goes back to the idle pool on drop.
pub struct PooledConnection<'a> {
    store: &'a SqliteStore,
    conn: Option<Connection>,
}

impl Deref for PooledConnection<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection is held until drop")
    }
}

impl DerefMut for PooledConnection<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection is held until drop")
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let mut idle = self.store.idle_guard();
            if idle.len() < self.store.max_idle {
                idle.push(conn);
            }
        }
    }
}

impl SqliteStore {
    /// Open (or create) the database at `path` and apply pending migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DbError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| DbError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let mut conn = open_connection(&path)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        migrations::run_migrations(&mut conn)?;
        tracing::info!(path = %path.display(), journal_mode = %mode, "attendance database opened");

        Ok(Self {
            path,
            idle: Mutex::new(vec![conn]),
            max_idle: DEFAULT_MAX_IDLE,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Borrow a connection for one unit of work.
    pub fn acquire(&self) -> Result<PooledConnection<'_>, DbError> {
        let pooled = self.idle_guard().pop();
        let conn = match pooled {
            Some(conn) => conn,
            None => {
                tracing::debug!("idle pool empty; opening a new connection");
                open_connection(&self.path)?
            }
        };
        Ok(PooledConnection {
            store: self,
            conn: Some(conn),
        })
    }

    fn idle_guard(&self) -> MutexGuard<'_, Vec<Connection>> {
        match self.idle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn enrolled(&self) -> Result<Vec<EnrolledFace>, DbError> {
        let conn = self.acquire()?;
        let mut stmt = conn.prepare(
            "SELECT id, full_name, embedding FROM identities WHERE embedding IS NOT NULL",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, full_name, blob)| {
                let embedding = Embedding::from_le_bytes(&blob)
                    .ok_or_else(|| DbError::Corrupt(format!("embedding blob for {id}")))?;
                Ok(EnrolledFace {
                    id,
                    full_name,
                    embedding,
                })
            })
            .collect()
    }

    fn attendance_on(&self, identity_id: &str, day: NaiveDate) -> Result<Option<AttendanceStatus>, DbError> {
        let conn = self.acquire()?;
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM attendance WHERE identity_id = ?1 AND day = ?2",
                params![identity_id, day.format(DAY_FORMAT).to_string()],
                |row| row.get(0),
            )
            .optional()?;
        status.map(|s| parse_status(&s)).transpose()
    }

    fn insert_if_absent(&self, record: &AttendanceRecord) -> Result<InsertOutcome, DbError> {
        let mut conn = self.acquire()?;
        let tx = conn.transaction()?;
        let day = record.day().format(DAY_FORMAT).to_string();

        let inserted = tx.execute(
            "INSERT INTO attendance (identity_id, day, check_in_time, confidence, status)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (identity_id, day) DO NOTHING",
            params![
                record.identity_id,
                day,
                record.check_in_time.format(TIMESTAMP_FORMAT).to_string(),
                record.confidence as f64,
                record.status.as_str(),
            ],
        )?;

        let outcome = if inserted == 1 {
            InsertOutcome::Inserted
        } else {
            let stored: String = tx.query_row(
                "SELECT status FROM attendance WHERE identity_id = ?1 AND day = ?2",
                params![record.identity_id, day],
                |row| row.get(0),
            )?;
            InsertOutcome::AlreadyRecorded(parse_status(&stored)?)
        };
        tx.commit()?;

        Ok(outcome)
    }

    fn upsert(&self, identity: &Identity) -> Result<(), DbError> {
        let mut conn = self.acquire()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO identities (id, full_name, department, image_path, embedding, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
             ON CONFLICT (id) DO UPDATE SET
                 full_name = excluded.full_name,
                 department = excluded.department,
                 image_path = excluded.image_path,
                 embedding = excluded.embedding,
                 updated_at = excluded.updated_at",
            params![
                identity.id,
                identity.full_name,
                identity.department,
                identity.image_path,
                identity.embedding.as_ref().map(Embedding::to_le_bytes),
                Utc::now().to_rfc3339(),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn identities(&self) -> Result<Vec<IdentitySummary>, DbError> {
        let conn = self.acquire()?;
        let mut stmt = conn.prepare(
            "SELECT id, full_name, department, image_path, embedding IS NOT NULL
             FROM identities
             ORDER BY created_at DESC, rowid DESC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(IdentitySummary {
                    id: row.get(0)?,
                    full_name: row.get(1)?,
                    department: row.get(2)?,
                    image_path: row.get(3)?,
                    is_verified: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn recent(&self, limit: usize) -> Result<Vec<AttendanceLogEntry>, DbError> {
        let conn = self.acquire()?;
        let mut stmt = conn.prepare(
            "SELECT a.identity_id, i.full_name, i.department, a.check_in_time, a.confidence, a.status
             FROM attendance a
             JOIN identities i ON a.identity_id = i.id
             ORDER BY a.check_in_time DESC, a.id DESC
             LIMIT ?1",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map([limit], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, f64>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(identity_id, full_name, department, time, confidence, status)| {
                Ok(AttendanceLogEntry {
                    identity_id,
                    full_name,
                    department,
                    check_in_time: parse_timestamp(&time)?,
                    confidence: confidence as f32,
                    status: parse_status(&status)?,
                })
            })
            .collect()
    }
}

impl AttendanceStore for SqliteStore {
    fn list_enrolled_embeddings(&self) -> Result<Vec<EnrolledFace>, StoreError> {
        Ok(self.enrolled()?)
    }

    fn find_attendance(
        &self,
        identity_id: &str,
        day: NaiveDate,
    ) -> Result<Option<AttendanceStatus>, StoreError> {
        Ok(self.attendance_on(identity_id, day)?)
    }

    fn insert_attendance(&self, record: &AttendanceRecord) -> Result<InsertOutcome, StoreError> {
        Ok(self.insert_if_absent(record)?)
    }

    fn upsert_identity(&self, identity: &Identity) -> Result<(), StoreError> {
        Ok(self.upsert(identity)?)
    }

    fn list_identities(&self) -> Result<Vec<IdentitySummary>, StoreError> {
        Ok(self.identities()?)
    }

    fn recent_attendance(&self, limit: usize) -> Result<Vec<AttendanceLogEntry>, StoreError> {
        Ok(self.recent(limit)?)
    }
}

fn open_connection(path: &Path) -> Result<Connection, DbError> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(conn)
}

fn parse_status(value: &str) -> Result<AttendanceStatus, DbError> {
    AttendanceStatus::parse(value).ok_or_else(|| DbError::Corrupt(format!("unknown attendance status '{value}'")))
}

fn parse_timestamp(value: &str) -> Result<NaiveDateTime, DbError> {
    NaiveDateTime::parse_from_str(value, TIMESTAMP_PARSE)
        .map_err(|err| DbError::Corrupt(format!("invalid check-in time '{value}': {err}")))
}
