//! Thin HTTP client for the gate daemon.
//!
//! The kiosk never runs inference and never touches the ledger; it
//! only drives `/gate/verify` and `/gate/mark-attendance` and maps the
//! responses into state-machine inputs.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fsm::{MatchedStudent, VerifyReply};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("gate daemon request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("gate daemon returned {status}: {message}")]
    Status { status: u16, message: String },
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    verified: bool,
    #[serde(default)]
    student_id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    attendance_already_marked: bool,
    #[serde(default)]
    attendance_time: Option<String>,
}

#[derive(Serialize)]
struct MarkRequest<'a> {
    student_id: &'a str,
    confidence: f64,
    gate_location: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct MarkReply {
    pub success: bool,
    pub message: String,
}

pub struct GateClient {
    client: reqwest::Client,
    base_url: String,
    gate_location: String,
}

impl GateClient {
    pub fn new(base_url: String, gate_location: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            gate_location,
        }
    }

    pub async fn verify(&self, image: Vec<u8>) -> Result<VerifyReply, ClientError> {
        let part = reqwest::multipart::Part::bytes(image)
            .file_name("frame.jpg")
            .mime_str("image/jpeg")?;
        let form = reqwest::multipart::Form::new()
            .part("image", part)
            .text("gate_location", self.gate_location.clone());

        let resp = self
            .client
            .post(format!("{}/gate/verify", self.base_url))
            .multipart(form)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ClientError::Status {
                status: status.as_u16(),
                message: error_message(resp).await,
            });
        }
        let body: VerifyResponse = resp.json().await?;
        Ok(reply_from(body))
    }

    pub async fn mark_attendance(
        &self,
        student_id: &str,
        confidence: f64,
    ) -> Result<MarkReply, ClientError> {
        let resp = self
            .client
            .post(format!("{}/gate/mark-attendance", self.base_url))
            .json(&MarkRequest {
                student_id,
                confidence,
                gate_location: &self.gate_location,
            })
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ClientError::Status {
                status: status.as_u16(),
                message: error_message(resp).await,
            });
        }
        Ok(resp.json().await?)
    }

    pub async fn health(&self) -> Result<serde_json::Value, ClientError> {
        let resp = self
            .client
            .get(format!("{}/health", self.base_url))
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }
}

/// Pull the daemon's `{"error": ...}` body if there is one.
async fn error_message(resp: reqwest::Response) -> String {
    match resp.json::<serde_json::Value>().await {
        Ok(body) => body
            .get("error")
            .and_then(|v| v.as_str())
            .unwrap_or("verification failed")
            .to_string(),
        Err(_) => "verification failed".to_string(),
    }
}

fn reply_from(body: VerifyResponse) -> VerifyReply {
    if body.verified {
        if let (Some(student_id), Some(name)) = (body.student_id, body.name) {
            let student = MatchedStudent {
                student_id,
                name,
                confidence: body.confidence,
            };
            if body.attendance_already_marked {
                return VerifyReply::AlreadyMarked {
                    student,
                    attendance_time: body.attendance_time,
                };
            }
            return VerifyReply::Matched(student);
        }
    }
    VerifyReply::NotRecognized {
        message: body
            .message
            .unwrap_or_else(|| "Student not found".to_string()),
    }
}
