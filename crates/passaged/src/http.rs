//! HTTP surface of the gate daemon.
//!
//! Expected negative outcomes (no face, no match, low confidence,
//! already marked) are 200 bodies — they are normal gate operation,
//! not faults. 400/404 cover caller mistakes; dependency failures are
//! 500 with a generic message and a server-side error log.

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Multipart, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use passage_core::{GateLogEntry, MarkOutcome, Student, VerificationOutcome};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::policy::{PolicyError, VerificationPolicy};
use crate::store::Store;

#[derive(Clone)]
pub struct AppState {
    pub policy: Arc<VerificationPolicy>,
    pub store: Store,
    pub default_gate_location: String,
}

pub fn router(state: AppState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/gate/verify", post(gate_verify))
        .route("/gate/mark-attendance", post(gate_mark_attendance))
        .route("/gate/logs", get(gate_logs))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(&'static str),
    Internal(PolicyError),
}

impl From<PolicyError> for ApiError {
    fn from(err: PolicyError) -> Self {
        ApiError::Internal(err)
    }
}

impl From<crate::store::StoreError> for ApiError {
    fn from(err: crate::store::StoreError) -> Self {
        ApiError::Internal(PolicyError::Store(err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
            }
            ApiError::NotFound(message) => {
                (StatusCode::NOT_FOUND, Json(json!({ "error": message }))).into_response()
            }
            ApiError::Internal(err) => {
                tracing::error!(error = %err, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "verification failed" })),
                )
                    .into_response()
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VerifyResponse {
    pub verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub student_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub attendance_already_marked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attendance_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct MarkRequest {
    /// Required; optional here only so its absence maps to 400 rather
    /// than a body-deserialization rejection.
    pub student_id: Option<String>,
    pub confidence: Option<f64>,
    pub gate_location: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StudentSummary {
    pub student_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MarkResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub student: Option<StudentSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_entry: Option<GateLogEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub existing_entry: Option<GateLogEntry>,
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn gate_verify(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<VerifyResponse>, ApiError> {
    let mut image: Option<Vec<u8>> = None;
    let mut gate_location: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("malformed multipart body: {e}")))?
    {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("image") => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("unreadable image field: {e}")))?;
                image = Some(bytes.to_vec());
            }
            Some("gate_location") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("unreadable gate_location: {e}")))?;
                if !text.trim().is_empty() {
                    gate_location = Some(text);
                }
            }
            _ => {}
        }
    }

    verify_impl(&state, image, gate_location).await.map(Json)
}

async fn gate_mark_attendance(
    State(state): State<AppState>,
    Json(req): Json<MarkRequest>,
) -> Result<Json<MarkResponse>, ApiError> {
    mark_impl(&state, req).await.map(Json)
}

#[derive(Deserialize)]
struct LogsQuery {
    limit: Option<u32>,
}

async fn gate_logs(
    State(state): State<AppState>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Vec<GateLogEntry>>, ApiError> {
    let limit = query.limit.unwrap_or(50).min(500);
    let entries = state.store.recent_entries(limit).await?;
    Ok(Json(entries))
}

/// Body of the verify endpoint, separated from multipart parsing so
/// the decision-to-response mapping is testable without HTTP plumbing.
pub async fn verify_impl(
    state: &AppState,
    image: Option<Vec<u8>>,
    gate_location: Option<String>,
) -> Result<VerifyResponse, ApiError> {
    let image = image.ok_or_else(|| ApiError::BadRequest("no image provided".into()))?;
    if image.is_empty() {
        return Err(ApiError::BadRequest("empty image field".into()));
    }
    let gate_location = gate_location.unwrap_or_else(|| state.default_gate_location.clone());

    let now = Utc::now();
    let outcome = state.policy.verify(image, &gate_location, now).await?;
    Ok(verify_response(outcome, now))
}

fn verify_response(outcome: VerificationOutcome, now: DateTime<Utc>) -> VerifyResponse {
    let blank = VerifyResponse {
        verified: false,
        student_id: None,
        name: None,
        email: None,
        department: None,
        year: None,
        confidence: 0.0,
        message: None,
        timestamp: now,
        attendance_already_marked: false,
        attendance_time: None,
    };

    match outcome {
        VerificationOutcome::Matched {
            student,
            confidence,
        } => with_student(blank, student, confidence),
        VerificationOutcome::AlreadyMarked {
            student,
            confidence,
            prior,
        } => {
            let mut resp = with_student(blank, student, confidence);
            resp.attendance_already_marked = true;
            resp.attendance_time = Some(prior.timestamp);
            resp.message = Some("Attendance already marked today".into());
            resp
        }
        VerificationOutcome::RejectedLowConfidence { confidence } => VerifyResponse {
            confidence,
            message: Some("Face not recognized - low confidence".into()),
            ..blank
        },
        VerificationOutcome::NoMatch { face_detected } => VerifyResponse {
            message: Some(
                if face_detected {
                    "Face not recognized"
                } else {
                    "No face detected in image"
                }
                .into(),
            ),
            ..blank
        },
    }
}

fn with_student(mut resp: VerifyResponse, student: Student, confidence: f64) -> VerifyResponse {
    resp.verified = true;
    resp.student_id = Some(student.student_id);
    resp.name = Some(student.name);
    resp.email = student.email;
    resp.department = student.department;
    resp.year = student.year;
    resp.confidence = confidence;
    resp
}

/// Body of the mark-attendance endpoint.
pub async fn mark_impl(state: &AppState, req: MarkRequest) -> Result<MarkResponse, ApiError> {
    let student_id = req
        .student_id
        .as_deref()
        .map(str::trim)
        .unwrap_or_default();
    if student_id.is_empty() {
        return Err(ApiError::BadRequest("student_id is required".into()));
    }
    let gate_location = req
        .gate_location
        .filter(|g| !g.trim().is_empty())
        .unwrap_or_else(|| state.default_gate_location.clone());

    let outcome = state
        .policy
        .mark_attendance(student_id, req.confidence, &gate_location, Utc::now())
        .await?;

    match outcome {
        MarkOutcome::UnknownStudent => Err(ApiError::NotFound("student not found")),
        MarkOutcome::Marked { student, entry } => Ok(MarkResponse {
            success: true,
            message: "Attendance marked successfully".into(),
            student: Some(StudentSummary {
                student_id: student.student_id,
                name: student.name,
                department: student.department,
            }),
            log_entry: Some(entry),
            existing_entry: None,
        }),
        MarkOutcome::AlreadyMarked { existing } => Ok(MarkResponse {
            success: false,
            message: "Attendance already marked today".into(),
            student: None,
            log_entry: None,
            existing_entry: Some(existing),
        }),
    }
}
