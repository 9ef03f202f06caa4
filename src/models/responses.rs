// Response DTOs for the setup API.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::installer::RunSnapshot;

#[derive(Debug, Serialize)]
pub struct InstallationSuccess {
    pub status: &'static str,
    pub schema_version: String,
    pub duration_seconds: f64,
}

#[derive(Debug, Serialize)]
pub struct InstallationFailed {
    pub status: &'static str,
    pub step: &'static str,
    pub error: String,
}

/// Body for `GET /setup/status` and the 409 conflict response. Empty fields
/// are omitted; timestamps are RFC3339.
#[derive(Debug, Serialize)]
pub struct StatusPayload {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl StatusPayload {
    pub fn idle() -> Self {
        Self {
            status: "idle",
            step: None,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn from_snapshot(snapshot: Option<RunSnapshot>) -> Self {
        match snapshot {
            None => Self::idle(),
            Some(s) => Self {
                status: s.state.as_str(),
                step: s.step.map(|step| step.as_str()),
                error: s.error.filter(|e| !e.is_empty()),
                started_at: Some(s.started_at),
                finished_at: s.finished_at,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::installer::{RunState, Step};

    #[test]
    fn idle_payload_serializes_to_status_only() {
        let json = serde_json::to_value(StatusPayload::idle()).unwrap();
        assert_eq!(json, serde_json::json!({"status": "idle"}));
    }

    #[test]
    fn running_payload_includes_step_and_start_time() {
        let snapshot = RunSnapshot {
            state: RunState::Running,
            step: Some(Step::LockDb),
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        };
        let json = serde_json::to_value(StatusPayload::from_snapshot(Some(snapshot))).unwrap();

        assert_eq!(json["status"], "running");
        assert_eq!(json["step"], "LOCK_DB");
        assert!(json.get("error").is_none());
        assert!(json.get("finished_at").is_none());
        let started = json["started_at"].as_str().unwrap();
        assert!(started.contains('T'), "RFC3339 timestamp: {}", started);
    }

    #[test]
    fn failed_payload_carries_step_error_and_times() {
        let snapshot = RunSnapshot {
            state: RunState::Failed,
            step: Some(Step::ApplyMigrations),
            error: Some("migration 002 failed".to_string()),
            started_at: Utc::now(),
            finished_at: Some(Utc::now()),
        };
        let json = serde_json::to_value(StatusPayload::from_snapshot(Some(snapshot))).unwrap();

        assert_eq!(json["status"], "failed");
        assert_eq!(json["step"], "APPLY_MIGRATIONS");
        assert_eq!(json["error"], "migration 002 failed");
        assert!(json["finished_at"].is_string());
    }

    #[test]
    fn success_response_shape() {
        let json = serde_json::to_value(InstallationSuccess {
            status: "SUCCESS",
            schema_version: "002".to_string(),
            duration_seconds: 1.25,
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "status": "SUCCESS",
                "schema_version": "002",
                "duration_seconds": 1.25
            })
        );
    }
}
