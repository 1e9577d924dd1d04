//! passage-core — Domain types and decision policy for campus gate
//! verification.
//!
//! Embedding extraction and vector similarity search live in external
//! services; this crate owns only the types crossing those boundaries
//! and the pure rules that turn a raw similarity score into a
//! verified/unverified attendance decision.

pub mod confidence;
pub mod types;

pub use types::{
    day_key, Candidate, Embedding, GateLogEntry, MarkOutcome, Student, VerificationOutcome,
};
