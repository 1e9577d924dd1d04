//! Verification decision and attendance-dedup orchestration.
//!
//! `verify` is the read/classify path the kiosk polls with camera
//! frames; `mark_attendance` is the explicit commit triggered by an
//! operator. The split is deliberate: the kiosk shows the matched
//! identity to a human before anything is written.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use passage_core::confidence::{sanitize_manual_confidence, NO_MATCH_CONFIDENCE};
use passage_core::{MarkOutcome, VerificationOutcome};
use thiserror::Error;

use crate::gateway::{GatewayError, ProbeOutcome, SimilarityGateway};
use crate::store::{MarkWrite, Store, StoreError};

#[derive(Error, Debug)]
pub enum PolicyError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct VerificationPolicy {
    gateway: Arc<dyn SimilarityGateway>,
    store: Store,
    /// Acceptance floor for the sanitized top-1 confidence. Looser
    /// than the search's retrieval threshold on purpose; the two are
    /// configured independently.
    accept_floor: f64,
}

impl VerificationPolicy {
    pub fn new(gateway: Arc<dyn SimilarityGateway>, store: Store, accept_floor: f64) -> Self {
        Self {
            gateway,
            store,
            accept_floor,
        }
    }

    /// Classify one probe image.
    ///
    /// Writes a verified=false audit row for no-match and
    /// low-confidence attempts. Writes nothing when no face was
    /// detected (the attempt never reached the matcher) and nothing
    /// on the verified path — marking is a separate call.
    pub async fn verify(
        &self,
        image: Vec<u8>,
        gate_location: &str,
        now: DateTime<Utc>,
    ) -> Result<VerificationOutcome, PolicyError> {
        let candidate = match self.gateway.probe(image).await? {
            ProbeOutcome::NoFace => {
                tracing::debug!(gate_location, "no face detected in probe image");
                return Ok(VerificationOutcome::NoMatch {
                    face_detected: false,
                });
            }
            ProbeOutcome::NoMatch => {
                self.store
                    .record_failed_attempt(None, NO_MATCH_CONFIDENCE, gate_location.into(), now)
                    .await?;
                tracing::info!(gate_location, "no match for probe face");
                return Ok(VerificationOutcome::NoMatch {
                    face_detected: true,
                });
            }
            ProbeOutcome::Candidate(c) => c,
        };

        if candidate.confidence < self.accept_floor {
            tracing::info!(
                student_id = %candidate.student_id,
                confidence = candidate.confidence,
                floor = self.accept_floor,
                "low-confidence match rejected"
            );
            self.store
                .record_failed_attempt(
                    Some(candidate.student_id),
                    candidate.confidence,
                    gate_location.into(),
                    now,
                )
                .await?;
            return Ok(VerificationOutcome::RejectedLowConfidence {
                confidence: candidate.confidence,
            });
        }

        let Some(student) = self.store.find_student(&candidate.student_id).await? else {
            // Vector index knows an id the relational store does not
            // (stale index after a deletion). The gate must not hard
            // fail on that; audit it as a plain failed attempt.
            tracing::warn!(
                student_id = %candidate.student_id,
                "matcher returned a student id with no student row"
            );
            self.store
                .record_failed_attempt(None, candidate.confidence, gate_location.into(), now)
                .await?;
            return Ok(VerificationOutcome::NoMatch {
                face_detected: true,
            });
        };

        match self
            .store
            .verified_entry_today(&student.student_id, now)
            .await?
        {
            Some(prior) => {
                tracing::info!(
                    student_id = %student.student_id,
                    prior_time = %prior.timestamp,
                    "verified, attendance already marked today"
                );
                Ok(VerificationOutcome::AlreadyMarked {
                    student,
                    confidence: candidate.confidence,
                    prior,
                })
            }
            None => {
                tracing::info!(
                    student_id = %student.student_id,
                    confidence = candidate.confidence,
                    "verified, awaiting mark"
                );
                Ok(VerificationOutcome::Matched {
                    student,
                    confidence: candidate.confidence,
                })
            }
        }
    }

    /// Explicit attendance commit. Re-validates the student and
    /// re-checks the per-day dedup condition — the `verify` snapshot
    /// may be stale by the time the operator taps.
    pub async fn mark_attendance(
        &self,
        student_id: &str,
        confidence: Option<f64>,
        gate_location: &str,
        now: DateTime<Utc>,
    ) -> Result<MarkOutcome, PolicyError> {
        let Some(student) = self.store.find_student(student_id).await? else {
            tracing::warn!(student_id, "mark requested for unknown student");
            return Ok(MarkOutcome::UnknownStudent);
        };

        let confidence = sanitize_manual_confidence(confidence);
        match self
            .store
            .mark_attendance(student_id, confidence, gate_location.into(), now)
            .await?
        {
            MarkWrite::Inserted(entry) => {
                tracing::info!(
                    student_id,
                    confidence,
                    gate_location,
                    "attendance marked"
                );
                Ok(MarkOutcome::Marked { student, entry })
            }
            MarkWrite::Already(existing) => {
                tracing::info!(
                    student_id,
                    prior_time = %existing.timestamp,
                    "attendance already marked today"
                );
                Ok(MarkOutcome::AlreadyMarked { existing })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use passage_core::confidence::ACCEPT_FLOOR;
    use passage_core::{Candidate, Student};

    struct FakeGateway(ProbeOutcome);

    #[async_trait]
    impl SimilarityGateway for FakeGateway {
        async fn probe(&self, _image: Vec<u8>) -> Result<ProbeOutcome, GatewayError> {
            Ok(self.0.clone())
        }
    }

    fn candidate(id: &str, confidence: f64) -> ProbeOutcome {
        ProbeOutcome::Candidate(Candidate {
            student_id: id.into(),
            confidence,
        })
    }

    async fn policy_with(probe: ProbeOutcome, students: &[&str]) -> (VerificationPolicy, Store) {
        let store = Store::open_in_memory().await.unwrap();
        for id in students {
            store
                .insert_student(
                    &Student {
                        student_id: (*id).into(),
                        name: "Test Student".into(),
                        email: None,
                        department: Some("CS".into()),
                        year: Some(3),
                        enrolled: true,
                    },
                    Some(vec![0u8; 8]),
                )
                .await
                .unwrap();
        }
        let policy = VerificationPolicy::new(Arc::new(FakeGateway(probe)), store.clone(), ACCEPT_FLOOR);
        (policy, store)
    }

    fn morning() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 9, 3, 0).unwrap()
    }

    #[tokio::test]
    async fn test_match_above_floor_verifies_without_writing() {
        let (policy, store) = policy_with(candidate("S100", 0.82), &["S100"]).await;

        let outcome = policy.verify(vec![1], "Main Gate", morning()).await.unwrap();
        let VerificationOutcome::Matched { student, confidence } = outcome else {
            panic!("expected Matched, got {outcome:?}");
        };
        assert_eq!(student.student_id, "S100");
        assert_eq!(confidence, 0.82);
        // Read/classify path only — no audit row yet.
        assert!(store.recent_entries(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_verify_reports_already_marked_today() {
        let (policy, store) = policy_with(candidate("S100", 0.82), &["S100"]).await;
        store
            .mark_attendance("S100", 0.9, "Main Gate".into(), morning())
            .await
            .unwrap();

        let later = Utc.with_ymd_and_hms(2025, 6, 1, 15, 0, 0).unwrap();
        let outcome = policy.verify(vec![1], "Main Gate", later).await.unwrap();
        let VerificationOutcome::AlreadyMarked { prior, .. } = outcome else {
            panic!("expected AlreadyMarked, got {outcome:?}");
        };
        assert_eq!(prior.timestamp, morning());
    }

    #[tokio::test]
    async fn test_low_confidence_rejected_and_audited() {
        let (policy, store) = policy_with(candidate("S100", 0.42), &["S100"]).await;

        let outcome = policy.verify(vec![1], "Main Gate", morning()).await.unwrap();
        assert!(matches!(
            outcome,
            VerificationOutcome::RejectedLowConfidence { confidence } if confidence == 0.42
        ));

        let entries = store.recent_entries(10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].verified);
        assert_eq!(entries[0].confidence, 0.42);
        assert_eq!(entries[0].student_id.as_deref(), Some("S100"));
    }

    #[tokio::test]
    async fn test_no_match_audited_with_zero_confidence() {
        let (policy, store) = policy_with(ProbeOutcome::NoMatch, &[]).await;

        let outcome = policy.verify(vec![1], "East Gate", morning()).await.unwrap();
        assert!(matches!(
            outcome,
            VerificationOutcome::NoMatch { face_detected: true }
        ));

        let entries = store.recent_entries(10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].confidence, 0.0);
        assert!(entries[0].student_id.is_none());
        assert_eq!(entries[0].gate_location, "East Gate");
    }

    #[tokio::test]
    async fn test_no_face_writes_nothing() {
        let (policy, store) = policy_with(ProbeOutcome::NoFace, &[]).await;

        let outcome = policy.verify(vec![1], "Main Gate", morning()).await.unwrap();
        assert!(matches!(
            outcome,
            VerificationOutcome::NoMatch {
                face_detected: false
            }
        ));
        assert!(store.recent_entries(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_index_id_treated_as_no_match() {
        // Matcher returns an id with no student row behind it.
        let (policy, store) = policy_with(candidate("GHOST", 0.91), &[]).await;

        let outcome = policy.verify(vec![1], "Main Gate", morning()).await.unwrap();
        assert!(matches!(
            outcome,
            VerificationOutcome::NoMatch { face_detected: true }
        ));
        assert_eq!(store.recent_entries(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_mark_then_mark_again_same_day() {
        let (policy, store) = policy_with(candidate("S100", 0.82), &["S100"]).await;

        let first = policy
            .mark_attendance("S100", Some(0.82), "Main Gate", morning())
            .await
            .unwrap();
        let MarkOutcome::Marked { entry, .. } = first else {
            panic!("first mark must insert");
        };
        assert_eq!(entry.confidence, 0.82);

        let second = policy
            .mark_attendance("S100", Some(0.82), "Main Gate", morning())
            .await
            .unwrap();
        let MarkOutcome::AlreadyMarked { existing } = second else {
            panic!("second mark must dedup");
        };
        assert_eq!(existing.id, entry.id);
        assert_eq!(store.recent_entries(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_mark_without_confidence_uses_manual_default() {
        let (policy, _store) = policy_with(ProbeOutcome::NoMatch, &["S100"]).await;

        let outcome = policy
            .mark_attendance("S100", None, "Main Gate", morning())
            .await
            .unwrap();
        let MarkOutcome::Marked { entry, .. } = outcome else {
            panic!("expected Marked");
        };
        assert_eq!(entry.confidence, 0.9);
    }

    #[tokio::test]
    async fn test_mark_unknown_student() {
        let (policy, store) = policy_with(ProbeOutcome::NoMatch, &[]).await;

        let outcome = policy
            .mark_attendance("S999", Some(0.8), "Main Gate", morning())
            .await
            .unwrap();
        assert!(matches!(outcome, MarkOutcome::UnknownStudent));
        assert!(store.recent_entries(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mark_with_non_finite_confidence_falls_back() {
        let (policy, _store) = policy_with(ProbeOutcome::NoMatch, &["S100"]).await;

        let outcome = policy
            .mark_attendance("S100", Some(f64::NAN), "Main Gate", morning())
            .await
            .unwrap();
        let MarkOutcome::Marked { entry, .. } = outcome else {
            panic!("expected Marked");
        };
        assert_eq!(entry.confidence, 0.9);
    }
}
