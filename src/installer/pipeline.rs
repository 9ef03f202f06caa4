// Pipeline orchestrator.
//
// Drives the ordered installation pipeline, publishing the current step to
// the run-state tracker and attributing every failure to the step it
// happened in. The whole run executes on a spawned task, so a dropped HTTP
// request can never cancel it halfway: the advisory unlock and the status
// finalization always run.

use anyhow::Result;
use chrono::Utc;
use log::{error, info};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs;
use uuid::Uuid;

use crate::bundle::{archive, checksum, fetch, manifest};
use crate::bundle::manifest::Manifest;
use crate::config::Config;
use crate::database::{Database, InstallSession, MigrationRecord};
use crate::installer::state::{RunSnapshot, RunTracker, Step};

/// A pipeline failure attributed to the step it occurred in.
#[derive(Debug, Clone)]
pub struct StepFailure {
    pub step: Step,
    pub error: String,
}

impl StepFailure {
    pub fn new(step: Step, error: impl Into<String>) -> Self {
        Self {
            step,
            error: error.into(),
        }
    }

    fn from_err(step: Step, err: anyhow::Error) -> Self {
        Self::new(step, format!("{:#}", err))
    }
}

impl std::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.step, self.error)
    }
}

/// Outcome of a full installation run. `Ok` carries the reported schema
/// version (the last applied or skipped-successful migration).
#[derive(Debug)]
pub struct InstallationResult {
    pub outcome: Result<String, StepFailure>,
    pub duration: Duration,
}

pub struct Installer {
    config: Arc<Config>,
    database: Arc<dyn Database>,
    client: reqwest::Client,
    tracker: RunTracker,
}

impl Installer {
    pub fn new(config: Arc<Config>, database: Arc<dyn Database>) -> Self {
        Self {
            config,
            database,
            client: reqwest::Client::new(),
            tracker: RunTracker::new(),
        }
    }

    /// Claim the single-flight slot; false when a run is already in flight.
    pub async fn try_start(&self) -> bool {
        self.tracker.try_start().await
    }

    pub async fn status(&self) -> Option<RunSnapshot> {
        self.tracker.snapshot().await
    }

    /// Run the pipeline to completion. The caller must have claimed the gate
    /// with [`Installer::try_start`] first.
    pub async fn run_installation(self: Arc<Self>) -> InstallationResult {
        let this = Arc::clone(&self);
        let handle = tokio::spawn(async move { this.run_to_completion().await });
        match handle.await {
            Ok(result) => result,
            Err(join_err) => {
                // The pipeline task aborted; record a terminal state so the
                // gate reopens.
                let snapshot = self.tracker.snapshot().await;
                let step = snapshot
                    .as_ref()
                    .and_then(|s| s.step)
                    .unwrap_or(Step::Initializing);
                let started_at = snapshot.map(|s| s.started_at).unwrap_or_else(Utc::now);
                let failure =
                    StepFailure::new(step, format!("installation task aborted: {}", join_err));
                self.tracker
                    .finalize_failure(failure.step, failure.error.clone(), started_at, Utc::now())
                    .await;
                InstallationResult {
                    outcome: Err(failure),
                    duration: Duration::default(),
                }
            }
        }
    }

    async fn run_to_completion(&self) -> InstallationResult {
        let started_at = Utc::now();
        let started = Instant::now();

        let outcome = self.execute().await;
        let finished_at = Utc::now();

        match &outcome {
            Ok(version) => {
                info!(
                    "[PHASE: setup] [STEP: POST_CHECK] Installation succeeded (schema_version={}, duration_ms={})",
                    version,
                    started.elapsed().as_millis()
                );
                self.tracker.finalize_success(started_at, finished_at).await;
            }
            Err(failure) => {
                error!(
                    "[PHASE: setup] [STEP: {}] Installation failed: {}",
                    failure.step, failure.error
                );
                self.tracker
                    .finalize_failure(
                        failure.step,
                        failure.error.clone(),
                        started_at,
                        finished_at,
                    )
                    .await;
            }
        }

        InstallationResult {
            outcome,
            duration: started.elapsed(),
        }
    }

    async fn execute(&self) -> Result<String, StepFailure> {
        let correlation_id = Uuid::new_v4().simple().to_string();
        info!(
            "[PHASE: setup] [STEP: INITIALIZING] Installation run started (correlation_id={})",
            correlation_id
        );

        let http = &self.config.http;
        if http.bundle_url.trim().is_empty() || !self.config.db.is_complete() {
            return Err(StepFailure::new(
                Step::ConnectDb,
                "BUNDLE_URL or database connection is not configured",
            ));
        }

        fs::create_dir_all(&http.work_dir)
            .await
            .map_err(|e| {
                StepFailure::new(
                    Step::DownloadBundle,
                    format!("failed to create work dir: {}", e),
                )
            })?;

        self.tracker.update_step(Step::DownloadBundle).await;
        let bundle_path = http.work_dir.join("db-bundle.zip");
        fetch::download_bundle(&self.client, &http.bundle_url, &bundle_path)
            .await
            .map_err(|e| StepFailure::from_err(Step::DownloadBundle, e))?;

        self.tracker.update_step(Step::ExtractBundle).await;
        let extract_dir = http.work_dir.join("bundle");
        if extract_dir.exists() {
            fs::remove_dir_all(&extract_dir).await.map_err(|e| {
                StepFailure::new(
                    Step::ExtractBundle,
                    format!("failed to clean extract dir: {}", e),
                )
            })?;
        }
        archive::extract_zip(&bundle_path, &extract_dir)
            .map_err(|e| StepFailure::from_err(Step::ExtractBundle, e))?;

        let base_dir = archive::resolve_base_dir(&extract_dir)
            .map_err(|e| StepFailure::from_err(Step::ParseManifest, e))?;

        self.tracker.update_step(Step::VerifyChecksum).await;
        let checksums = checksum::load_checksums(&base_dir)
            .map_err(|e| StepFailure::from_err(Step::VerifyChecksum, e))?;
        checksum::verify_checksums(&base_dir, &checksums)
            .map_err(|e| StepFailure::from_err(Step::VerifyChecksum, e))?;

        self.tracker.update_step(Step::ParseManifest).await;
        let manifest = manifest::load_manifest(&base_dir)
            .map_err(|e| StepFailure::from_err(Step::ParseManifest, e))?;
        manifest
            .validate(&checksums)
            .map_err(|e| StepFailure::from_err(Step::ParseManifest, e))?;

        self.tracker.update_step(Step::ConnectDb).await;
        let mut session = self
            .database
            .session()
            .await
            .map_err(|e| StepFailure::from_err(Step::ConnectDb, e))?;
        session
            .ping()
            .await
            .map_err(|e| StepFailure::from_err(Step::ConnectDb, e))?;

        self.tracker.update_step(Step::LockDb).await;
        let lock_key = http.advisory_lock_key;
        session
            .acquire_lock(lock_key)
            .await
            .map_err(|e| StepFailure::from_err(Step::LockDb, e))?;
        info!(
            "[PHASE: setup] [STEP: LOCK_DB] Advisory lock acquired (key={})",
            lock_key
        );

        let outcome = self
            .apply_bundle(session.as_mut(), &base_dir, &manifest)
            .await;

        // Best-effort release on every exit path. The run owns its task, so a
        // cancelled request cannot reach this point with the lock still held.
        if let Err(unlock_err) = session.release_lock(lock_key).await {
            error!(
                "[PHASE: setup] [STEP: LOCK_DB] Failed to release advisory lock: {:#}",
                unlock_err
            );
        } else {
            info!(
                "[PHASE: setup] [STEP: LOCK_DB] Advisory lock released (key={})",
                lock_key
            );
        }

        outcome
    }

    async fn apply_bundle(
        &self,
        session: &mut dyn InstallSession,
        base_dir: &Path,
        manifest: &Manifest,
    ) -> Result<String, StepFailure> {
        let force = self.config.http.force;
        let skip_smoke = self.config.http.skip_smoke;

        self.tracker.update_step(Step::ApplyBaseline).await;
        let fresh = session.is_fresh().await.map_err(|e| {
            StepFailure::from_err(Step::ApplyBaseline, e.context("failed to detect database state"))
        })?;

        if fresh {
            info!("[PHASE: setup] [STEP: APPLY_BASELINE] Fresh database detected, applying baseline");
            let baseline_sql = fs::read_to_string(base_dir.join(&manifest.baseline))
                .await
                .map_err(|e| {
                    StepFailure::new(
                        Step::ApplyBaseline,
                        format!("failed to read baseline: {}", e),
                    )
                })?;
            session.execute_batch(&baseline_sql).await.map_err(|e| {
                StepFailure::new(
                    Step::ApplyBaseline,
                    format!("failed to apply baseline: {:#}", e),
                )
            })?;
            session.ensure_ledger().await.map_err(|e| {
                StepFailure::new(
                    Step::ApplyBaseline,
                    format!("failed to ensure migrations table: {:#}", e),
                )
            })?;
            info!("[PHASE: setup] [STEP: APPLY_BASELINE] Baseline applied successfully");
        }

        self.tracker.update_step(Step::ApplyMigrations).await;
        let mut last_version = String::new();
        for migration in &manifest.migrations {
            let prior = session
                .get_migration(&migration.version)
                .await
                .map_err(|e| {
                    StepFailure::new(
                        Step::ApplyMigrations,
                        format!("failed to check migration {}: {:#}", migration.version, e),
                    )
                })?;

            let sql_bytes = fs::read(base_dir.join(&migration.file)).await.map_err(|e| {
                StepFailure::new(
                    Step::ApplyMigrations,
                    format!("failed to read migration {}: {}", migration.version, e),
                )
            })?;
            let file_checksum = checksum::sha256_hex(&sql_bytes);

            if let Some(prior) = &prior {
                if prior.success && !force {
                    info!(
                        "[PHASE: setup] [STEP: APPLY_MIGRATIONS] Migration already applied, skipping (version={})",
                        migration.version
                    );
                    last_version = migration.version.clone();
                    continue;
                }
                // Re-applying (force, or a previously failed attempt) is only
                // safe when the content has not drifted under the version.
                if prior.checksum != file_checksum {
                    return Err(StepFailure::new(
                        Step::ApplyMigrations,
                        format!(
                            "checksum mismatch for migration {}: recorded={}, file={}",
                            migration.version, prior.checksum, file_checksum
                        ),
                    ));
                }
            }

            let sql = String::from_utf8(sql_bytes).map_err(|_| {
                StepFailure::new(
                    Step::ApplyMigrations,
                    format!("migration {} is not valid UTF-8", migration.version),
                )
            })?;

            info!(
                "[PHASE: setup] [STEP: APPLY_MIGRATIONS] Applying migration (version={}, name={}, tx={})",
                migration.version, migration.name, migration.transaction
            );

            let migration_started = Instant::now();
            let exec_result = if migration.transaction {
                session.execute_in_transaction(&sql).await
            } else {
                session.execute_batch(&sql).await
            };
            let elapsed_ms = migration_started.elapsed().as_millis() as i64;

            let record = MigrationRecord {
                version: migration.version.clone(),
                name: migration.name.clone(),
                checksum: file_checksum,
                applied_at: Utc::now(),
                execution_time_ms: elapsed_ms,
                success: exec_result.is_ok(),
                error: exec_result.as_ref().err().map(|e| format!("{:#}", e)),
            };
            // The ledger write happens regardless of the migration outcome; a
            // failed write is logged but never masks the migration's result.
            if let Err(ledger_err) = session.record_migration(&record).await {
                error!(
                    "[PHASE: setup] [STEP: APPLY_MIGRATIONS] Failed to record migration (version={}): {:#}",
                    migration.version, ledger_err
                );
            }

            if let Err(exec_err) = exec_result {
                return Err(StepFailure::new(
                    Step::ApplyMigrations,
                    format!("migration {} failed: {:#}", migration.version, exec_err),
                ));
            }

            last_version = migration.version.clone();
            info!(
                "[PHASE: setup] [STEP: APPLY_MIGRATIONS] Migration applied (version={}, ms={})",
                migration.version, elapsed_ms
            );
        }

        if !skip_smoke && !manifest.checks.smoke.is_empty() {
            self.tracker.update_step(Step::PostCheck).await;
            let smoke_sql = fs::read_to_string(base_dir.join(&manifest.checks.smoke))
                .await
                .map_err(|e| {
                    StepFailure::new(
                        Step::PostCheck,
                        format!("failed to read smoke check: {}", e),
                    )
                })?;
            session.execute_batch(&smoke_sql).await.map_err(|e| {
                StepFailure::new(Step::PostCheck, format!("smoke check failed: {:#}", e))
            })?;
            info!("[PHASE: setup] [STEP: POST_CHECK] Smoke check passed");
        }

        Ok(last_version)
    }
}
