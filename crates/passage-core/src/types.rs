use chrono::{DateTime, NaiveDate, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity record for a student known to the campus.
///
/// Owned by the enrollment workflow (admin side); this core only reads
/// it. `enrolled` reflects whether a face embedding exists for the
/// student in the external vector store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Student {
    pub student_id: String,
    pub name: String,
    pub email: Option<String>,
    pub department: Option<String>,
    pub year: Option<i32>,
    pub enrolled: bool,
}

/// Face embedding vector produced by the external extraction service.
///
/// Opaque to this system: it is forwarded to the external
/// nearest-neighbor search and never compared locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

/// Audit record of one verification attempt at a physical gate,
/// successful or not. Append-only from this core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateLogEntry {
    pub id: String,
    /// Unset when the attempt produced no identity at all.
    pub student_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Always finite and within [0, 1] — sanitized before construction.
    pub confidence: f64,
    pub verified: bool,
    pub gate_location: String,
}

impl GateLogEntry {
    pub fn new(
        student_id: Option<String>,
        timestamp: DateTime<Utc>,
        confidence: f64,
        verified: bool,
        gate_location: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            student_id,
            // Storage keeps microsecond precision; truncate up front so
            // an entry compares equal to its persisted round trip.
            timestamp: timestamp.trunc_subsecs(6),
            confidence,
            verified,
            gate_location,
        }
    }

    /// Calendar day this entry counts toward for the dedup invariant.
    pub fn day(&self) -> NaiveDate {
        day_key(self.timestamp)
    }
}

/// Calendar-day key for attendance dedup: the date part of the UTC
/// timestamp, not a rolling 24 h window.
pub fn day_key(timestamp: DateTime<Utc>) -> NaiveDate {
    timestamp.date_naive()
}

/// Candidate identity returned by the similarity search, with its
/// confidence already sanitized into [0, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub student_id: String,
    pub confidence: f64,
}

/// Result of one `/gate/verify` classification.
///
/// Constructed per request and consumed immediately to build the HTTP
/// response; never persisted.
#[derive(Debug, Clone)]
pub enum VerificationOutcome {
    /// Accepted match, attendance not yet marked today.
    Matched { student: Student, confidence: f64 },
    /// Accepted match, but a verified entry already exists today.
    AlreadyMarked {
        student: Student,
        confidence: f64,
        prior: GateLogEntry,
    },
    /// The search returned a nominal match below the acceptance floor.
    RejectedLowConfidence { confidence: f64 },
    /// No usable identity. `face_detected` distinguishes "the search
    /// found nothing" (audited) from "no face in the image" (not
    /// audited, and worded differently at the gate).
    NoMatch { face_detected: bool },
}

impl VerificationOutcome {
    pub fn verified(&self) -> bool {
        matches!(
            self,
            VerificationOutcome::Matched { .. } | VerificationOutcome::AlreadyMarked { .. }
        )
    }
}

/// Result of one explicit mark-attendance commit.
#[derive(Debug, Clone)]
pub enum MarkOutcome {
    Marked {
        student: Student,
        entry: GateLogEntry,
    },
    /// A verified entry for (student, today) already exists; echoed
    /// back unmodified instead of inserting a duplicate.
    AlreadyMarked { existing: GateLogEntry },
    UnknownStudent,
}
