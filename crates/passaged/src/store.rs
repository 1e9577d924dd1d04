//! SQLite attendance ledger — students lookup plus an append-only
//! audit trail of gate attempts.
//!
//! The dedup invariant (at most one verified entry per student per
//! calendar day) is enforced twice: a check-then-insert inside an
//! immediate transaction, and a partial unique index as the backstop
//! against writers outside that transaction.

use chrono::{DateTime, SecondsFormat, Utc};
use passage_core::{day_key, GateLogEntry, Student};
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use std::path::Path;
use thiserror::Error;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS students (
  student_id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  email TEXT,
  department TEXT,
  year INTEGER,
  face_embedding BLOB
);

CREATE TABLE IF NOT EXISTS gate_logs (
  id TEXT PRIMARY KEY,
  student_id TEXT,
  timestamp TEXT NOT NULL,
  day TEXT NOT NULL,
  confidence REAL NOT NULL CHECK (confidence BETWEEN 0.0 AND 1.0),
  verified INTEGER NOT NULL CHECK (verified IN (0, 1)),
  gate_location TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_gate_logs_verified_once_per_day
  ON gate_logs(student_id, day) WHERE verified = 1;

CREATE INDEX IF NOT EXISTS idx_gate_logs_timestamp
  ON gate_logs(timestamp);
";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database: {0}")]
    Database(#[from] tokio_rusqlite::Error),
}

/// Outcome of the transactional mark-attendance write.
#[derive(Debug)]
pub enum MarkWrite {
    Inserted(GateLogEntry),
    /// A verified entry for (student, day) already existed — either
    /// found by the pre-check or surfaced by the unique index when a
    /// concurrent writer won the race.
    Already(GateLogEntry),
}

/// Clone-safe handle to the ledger database.
#[derive(Clone)]
pub struct Store {
    conn: tokio_rusqlite::Connection,
}

impl Store {
    /// Open (or create) the database at `path` and apply the schema.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = tokio_rusqlite::Connection::open(path).await?;
        Self::init(conn).await
    }

    /// In-memory database, for tests and diagnostics.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = tokio_rusqlite::Connection::open_in_memory().await?;
        Self::init(conn).await
    }

    async fn init(conn: tokio_rusqlite::Connection) -> Result<Self, StoreError> {
        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }

    /// Insert a student row. `face_embedding` is opaque here; its
    /// presence is what `enrolled` reports on lookup.
    pub async fn insert_student(
        &self,
        student: &Student,
        face_embedding: Option<Vec<u8>>,
    ) -> Result<(), StoreError> {
        let s = student.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO students (student_id, name, email, department, year, face_embedding)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![s.student_id, s.name, s.email, s.department, s.year, face_embedding],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn find_student(&self, student_id: &str) -> Result<Option<Student>, StoreError> {
        let student_id = student_id.to_owned();
        let student = self
            .conn
            .call(move |conn| {
                let row = conn
                    .query_row(
                        "SELECT student_id, name, email, department, year,
                                face_embedding IS NOT NULL
                         FROM students WHERE student_id = ?1",
                        params![student_id],
                        |row| {
                            Ok(Student {
                                student_id: row.get(0)?,
                                name: row.get(1)?,
                                email: row.get(2)?,
                                department: row.get(3)?,
                                year: row.get(4)?,
                                enrolled: row.get(5)?,
                            })
                        },
                    )
                    .optional()?;
                Ok(row)
            })
            .await?;
        Ok(student)
    }

    /// Verified entry for `student_id` on the calendar day of `now`,
    /// if one exists. The day boundary is computed per call — "today"
    /// must reflect request time.
    pub async fn verified_entry_today(
        &self,
        student_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<GateLogEntry>, StoreError> {
        let student_id = student_id.to_owned();
        let day = day_key(now).to_string();
        let entry = self
            .conn
            .call(move |conn| {
                let row = conn
                    .query_row(
                        "SELECT id, student_id, timestamp, confidence, verified, gate_location
                         FROM gate_logs
                         WHERE student_id = ?1 AND day = ?2 AND verified = 1",
                        params![student_id, day],
                        entry_from_row,
                    )
                    .optional()?;
                Ok(row)
            })
            .await?;
        Ok(entry)
    }

    /// Append a verified=false audit row for a failed attempt.
    /// `student_id` stays unset when no identity is known.
    pub async fn record_failed_attempt(
        &self,
        student_id: Option<String>,
        confidence: f64,
        gate_location: String,
        now: DateTime<Utc>,
    ) -> Result<GateLogEntry, StoreError> {
        let entry = GateLogEntry::new(student_id, now, confidence, false, gate_location);
        let row = entry.clone();
        self.conn
            .call(move |conn| {
                insert_entry(conn, &row)?;
                Ok(())
            })
            .await?;
        Ok(entry)
    }

    /// Transactional check-then-insert of a verified entry.
    ///
    /// Two concurrent marks for the same student on the same day must
    /// not both succeed: the loser observes the winner's row and gets
    /// it back as [`MarkWrite::Already`].
    pub async fn mark_attendance(
        &self,
        student_id: &str,
        confidence: f64,
        gate_location: String,
        now: DateTime<Utc>,
    ) -> Result<MarkWrite, StoreError> {
        let entry = GateLogEntry::new(
            Some(student_id.to_owned()),
            now,
            confidence,
            true,
            gate_location,
        );
        let day = entry.day().to_string();
        let result = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let student_id = entry.student_id.clone();
                let existing = tx
                    .query_row(
                        "SELECT id, student_id, timestamp, confidence, verified, gate_location
                         FROM gate_logs
                         WHERE student_id = ?1 AND day = ?2 AND verified = 1",
                        params![student_id, day],
                        entry_from_row,
                    )
                    .optional()?;
                if let Some(existing) = existing {
                    tx.commit()?;
                    return Ok(MarkWrite::Already(existing));
                }
                match insert_entry(&tx, &entry) {
                    Ok(()) => {
                        tx.commit()?;
                        Ok(MarkWrite::Inserted(entry))
                    }
                    Err(err) if is_unique_violation(&err) => {
                        // Lost the race to another writer; hand back its row.
                        let winner = tx.query_row(
                            "SELECT id, student_id, timestamp, confidence, verified, gate_location
                             FROM gate_logs
                             WHERE student_id = ?1 AND day = ?2 AND verified = 1",
                            params![student_id, day],
                            entry_from_row,
                        )?;
                        tx.commit()?;
                        Ok(MarkWrite::Already(winner))
                    }
                    Err(err) => Err(err.into()),
                }
            })
            .await?;
        Ok(result)
    }

    /// Most recent attempts, newest first. Backs the audit listing
    /// endpoint; the dashboard rendering itself lives elsewhere.
    pub async fn recent_entries(&self, limit: u32) -> Result<Vec<GateLogEntry>, StoreError> {
        let entries = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, student_id, timestamp, confidence, verified, gate_location
                     FROM gate_logs ORDER BY timestamp DESC, id LIMIT ?1",
                )?;
                let rows = stmt
                    .query_map(params![limit], entry_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(entries)
    }
}

fn insert_entry(conn: &rusqlite::Connection, entry: &GateLogEntry) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO gate_logs (id, student_id, timestamp, day, confidence, verified, gate_location)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            entry.id,
            entry.student_id,
            // Fixed-width so ORDER BY timestamp is chronological.
            entry.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
            entry.day().to_string(),
            entry.confidence,
            entry.verified,
            entry.gate_location,
        ],
    )?;
    Ok(())
}

fn entry_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<GateLogEntry> {
    let raw_ts: String = row.get(2)?;
    let timestamp = DateTime::parse_from_rfc3339(&raw_ts)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?
        .with_timezone(&Utc);
    Ok(GateLogEntry {
        id: row.get(0)?,
        student_id: row.get(1)?,
        timestamp,
        confidence: row.get(3)?,
        verified: row.get(4)?,
        gate_location: row.get(5)?,
    })
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::ConstraintViolation)
    )
}
