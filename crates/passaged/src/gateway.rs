//! Client for the external face subsystem: embedding extraction and
//! vector nearest-neighbor search.
//!
//! All computer vision happens on the other side of this boundary.
//! The gateway's own job is small: drive the two HTTP calls and
//! sanitize whatever similarity score comes back.

use async_trait::async_trait;
use passage_core::confidence::sanitize_similarity;
use passage_core::{Candidate, Embedding};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("face service request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Result of probing one image against the enrolled gallery.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    /// The extractor reported no face in the image. An expected
    /// outcome at a gate, not a fault.
    NoFace,
    /// A face was extracted but the search produced no candidate.
    NoMatch,
    /// Top-1 candidate, confidence already sanitized into [0, 1].
    Candidate(Candidate),
}

/// Boundary to the external embedding/matching subsystem.
#[async_trait]
pub trait SimilarityGateway: Send + Sync {
    async fn probe(&self, image: Vec<u8>) -> Result<ProbeOutcome, GatewayError>;
}

#[derive(Deserialize)]
struct ExtractResponse {
    success: bool,
    embedding: Option<Vec<f32>>,
}

#[derive(Serialize)]
struct MatchRequest<'a> {
    embedding: &'a [f32],
    threshold: f64,
    top_k: usize,
}

#[derive(Deserialize)]
struct MatchRow {
    student_id: String,
    similarity: f64,
}

#[derive(Deserialize)]
struct MatchResponse {
    matches: Vec<MatchRow>,
}

/// reqwest-backed gateway talking to the AI microservice.
pub struct HttpSimilarityGateway {
    client: reqwest::Client,
    base_url: String,
    /// Advisory retrieval threshold forwarded to the search. Distinct
    /// from the acceptance floor the policy layer applies afterwards.
    match_threshold: f64,
}

impl HttpSimilarityGateway {
    pub fn new(base_url: String, match_threshold: f64) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            match_threshold,
        }
    }

    /// `None` means the extractor found no face; transport and HTTP
    /// status errors propagate as faults.
    async fn extract_embedding(&self, image: Vec<u8>) -> Result<Option<Embedding>, GatewayError> {
        let part = reqwest::multipart::Part::bytes(image)
            .file_name("face.jpg")
            .mime_str("image/jpeg")?;
        let form = reqwest::multipart::Form::new().part("image", part);

        let body: ExtractResponse = self
            .client
            .post(format!("{}/extract-embedding", self.base_url))
            .multipart(form)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        match body.embedding {
            Some(values) if body.success => Ok(Some(Embedding { values })),
            _ => Ok(None),
        }
    }

    async fn match_embedding(&self, embedding: &Embedding) -> Result<Vec<MatchRow>, GatewayError> {
        let body: MatchResponse = self
            .client
            .post(format!("{}/match-embedding", self.base_url))
            .json(&MatchRequest {
                embedding: &embedding.values,
                threshold: self.match_threshold,
                top_k: 1,
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(body.matches)
    }
}

#[async_trait]
impl SimilarityGateway for HttpSimilarityGateway {
    async fn probe(&self, image: Vec<u8>) -> Result<ProbeOutcome, GatewayError> {
        let Some(embedding) = self.extract_embedding(image).await? else {
            return Ok(ProbeOutcome::NoFace);
        };
        tracing::debug!(dims = embedding.values.len(), "embedding extracted");

        let rows = self.match_embedding(&embedding).await?;
        Ok(top_candidate(rows))
    }
}

/// Reduce the search result to this system's probe outcome. The
/// similarity score is sanitized here so nothing downstream ever sees
/// NaN or an out-of-range value.
fn top_candidate(rows: Vec<MatchRow>) -> ProbeOutcome {
    let Some(top) = rows.into_iter().next() else {
        return ProbeOutcome::NoMatch;
    };
    let confidence = sanitize_similarity(top.similarity);
    if !top.similarity.is_finite() {
        tracing::warn!(
            student_id = %top.student_id,
            raw = ?top.similarity,
            "non-finite similarity from search, coerced"
        );
    }
    ProbeOutcome::Candidate(Candidate {
        student_id: top.student_id,
        confidence,
    })
}
