use std::net::SocketAddr;
use std::path::PathBuf;

use passage_core::confidence::{ACCEPT_FLOOR, MATCH_THRESHOLD};

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Socket the HTTP server binds (default: 0.0.0.0:8080).
    pub bind_addr: SocketAddr,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Base URL of the external embedding/matching service.
    pub ai_service_url: String,
    /// Advisory similarity threshold sent to the external search.
    pub match_threshold: f64,
    /// Local acceptance floor applied to the returned candidate.
    pub accept_floor: f64,
    /// Gate location recorded when the request names none.
    pub default_gate_location: String,
    /// Upper bound on the multipart request body, in bytes.
    pub max_body_bytes: usize,
}

impl Config {
    /// Load configuration from `PASSAGE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("passage");

        let db_path = std::env::var("PASSAGE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("gate.db"));

        Self {
            bind_addr: std::env::var("PASSAGE_BIND")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8080))),
            db_path,
            ai_service_url: std::env::var("PASSAGE_AI_SERVICE_URL")
                .unwrap_or_else(|_| "http://localhost:8000".to_string()),
            match_threshold: env_f64("PASSAGE_MATCH_THRESHOLD", MATCH_THRESHOLD),
            accept_floor: env_f64("PASSAGE_ACCEPT_FLOOR", ACCEPT_FLOOR),
            default_gate_location: std::env::var("PASSAGE_GATE_LOCATION")
                .unwrap_or_else(|_| "Main Gate".to_string()),
            max_body_bytes: env_usize("PASSAGE_MAX_BODY_BYTES", 8 * 1024 * 1024),
        }
    }
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
