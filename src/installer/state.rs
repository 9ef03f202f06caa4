// Run-state tracking and the single-flight gate.

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

/// Pipeline step labels, published to the status endpoint while a run is in
/// flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Initializing,
    DownloadBundle,
    ExtractBundle,
    VerifyChecksum,
    ParseManifest,
    ConnectDb,
    LockDb,
    ApplyBaseline,
    ApplyMigrations,
    PostCheck,
}

impl Step {
    pub const fn as_str(self) -> &'static str {
        match self {
            Step::Initializing => "INITIALIZING",
            Step::DownloadBundle => "DOWNLOAD_BUNDLE",
            Step::ExtractBundle => "EXTRACT_BUNDLE",
            Step::VerifyChecksum => "VERIFY_CHECKSUM",
            Step::ParseManifest => "PARSE_MANIFEST",
            Step::ConnectDb => "CONNECT_DB",
            Step::LockDb => "LOCK_DB",
            Step::ApplyBaseline => "APPLY_BASELINE",
            Step::ApplyMigrations => "APPLY_MIGRATIONS",
            Step::PostCheck => "POST_CHECK",
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Success,
    Failed,
}

impl RunState {
    pub const fn as_str(self) -> &'static str {
        match self {
            RunState::Running => "running",
            RunState::Success => "success",
            RunState::Failed => "failed",
        }
    }
}

/// Owned copy of the current run status. `None` from
/// [`RunTracker::snapshot`] means no run has ever occurred (idle).
#[derive(Debug, Clone)]
pub struct RunSnapshot {
    pub state: RunState,
    pub step: Option<Step>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Serializes all status mutations behind one mutex; readers only ever get
/// copies.
#[derive(Debug, Default)]
pub struct RunTracker {
    inner: Mutex<Option<RunSnapshot>>,
}

impl RunTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically claim the single-flight slot. Returns false when a run is
    /// already in progress.
    pub async fn try_start(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if matches!(inner.as_ref(), Some(s) if s.state == RunState::Running) {
            return false;
        }
        *inner = Some(RunSnapshot {
            state: RunState::Running,
            step: Some(Step::Initializing),
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        });
        true
    }

    /// Set the current step label; no-op unless a run is in progress.
    pub async fn update_step(&self, step: Step) {
        let mut inner = self.inner.lock().await;
        if let Some(status) = inner.as_mut() {
            if status.state == RunState::Running {
                status.step = Some(step);
            }
        }
    }

    pub async fn finalize_success(
        &self,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) {
        let mut inner = self.inner.lock().await;
        *inner = Some(RunSnapshot {
            state: RunState::Success,
            step: None,
            error: None,
            started_at,
            finished_at: Some(finished_at),
        });
    }

    pub async fn finalize_failure(
        &self,
        step: Step,
        error: String,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) {
        let mut inner = self.inner.lock().await;
        *inner = Some(RunSnapshot {
            state: RunState::Failed,
            step: Some(step),
            error: Some(error),
            started_at,
            finished_at: Some(finished_at),
        });
    }

    pub async fn snapshot(&self) -> Option<RunSnapshot> {
        self.inner.lock().await.clone()
    }
}
