//! Shared test fixtures: bundle zips, throwaway HTTP servers, and an
//! in-memory database stub that counts executions deterministically.

use anyhow::Result;
use async_trait::async_trait;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

use crate::bundle::checksum::sha256_hex;
use crate::config::{Config, DbConfig, HttpConfig};
use crate::database::{Database, InstallSession, MigrationRecord};

/// Build a zip archive from (entry name, content) pairs.
pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let cursor = std::io::Cursor::new(Vec::new());
    let mut writer = zip::ZipWriter::new(cursor);
    for (name, content) in entries {
        let opts = zip::write::FileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .unix_permissions(0o644);
        writer.start_file(*name, opts).unwrap();
        writer.write_all(content).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// Build a complete bundle zip: the given manifest, a checksums.json derived
/// from `files`, and the files themselves.
pub fn bundle_zip(manifest_json: &str, files: &[(&str, &str)]) -> Vec<u8> {
    let checksums: BTreeMap<&str, String> = files
        .iter()
        .map(|(name, content)| (*name, sha256_hex(content.as_bytes())))
        .collect();
    let checksums_json = serde_json::to_string(&checksums).unwrap();

    let mut entries: Vec<(&str, &[u8])> = vec![
        ("manifest.json", manifest_json.as_bytes()),
        ("checksums.json", checksums_json.as_bytes()),
    ];
    for (name, content) in files {
        entries.push((name, content.as_bytes()));
    }
    zip_bytes(&entries)
}

/// Serve `bytes` at `/bundle.zip` on an ephemeral local port; anything else
/// is a 404. Returns the base URL.
pub async fn serve_bytes(bytes: Vec<u8>) -> String {
    let app = Router::new().route(
        "/bundle.zip",
        get(move || {
            let body = bytes.clone();
            async move { body }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{}", addr)
}

/// Config pointing at a local bundle URL with complete (dummy) DB settings.
pub fn test_config(bundle_url: String, work_dir: &Path, force: bool, skip_smoke: bool) -> Config {
    Config {
        http: HttpConfig {
            port: 0,
            bundle_url,
            work_dir: work_dir.to_path_buf(),
            advisory_lock_key: 42,
            force,
            skip_smoke,
        },
        db: DbConfig {
            host: "localhost".to_string(),
            port: "5432".to_string(),
            user: "hris".to_string(),
            password: "secret".to_string(),
            name: "hris".to_string(),
            ssl_mode: "disable".to_string(),
            schema: "public".to_string(),
        },
    }
}

/// A successful ledger row whose checksum matches `sql`.
pub fn successful_record(version: &str, name: &str, sql: &str) -> MigrationRecord {
    MigrationRecord {
        version: version.to_string(),
        name: name.to_string(),
        checksum: sha256_hex(sql.as_bytes()),
        applied_at: Utc::now(),
        execution_time_ms: 7,
        success: true,
        error: None,
    }
}

/// Shared state behind [`StubDatabase`]: an in-memory ledger plus atomic
/// counters for every interaction the pipeline can have with the database.
#[derive(Default)]
pub struct StubState {
    pub fresh: AtomicBool,
    pub ledger: Mutex<HashMap<String, MigrationRecord>>,
    pub executed: Mutex<Vec<String>>,
    pub batch_executions: AtomicU32,
    pub tx_executions: AtomicU32,
    pub ensure_ledger_calls: AtomicU32,
    pub locks_acquired: AtomicU32,
    pub locks_released: AtomicU32,
    pub fail_on_sql: Mutex<Option<String>>,
    /// When set, `ping` blocks until a permit is added — lets tests hold a
    /// run mid-pipeline.
    pub ping_gate: Mutex<Option<Arc<Semaphore>>>,
}

impl StubState {
    /// A database with no ledger table yet.
    pub fn fresh_database() -> Arc<Self> {
        let state = Self::default();
        state.fresh.store(true, Ordering::SeqCst);
        Arc::new(state)
    }

    /// A database whose ledger already contains `rows`.
    pub fn installed_database(rows: Vec<MigrationRecord>) -> Arc<Self> {
        let state = Self::default();
        {
            let mut ledger = state.ledger.lock().unwrap();
            for row in rows {
                ledger.insert(row.version.clone(), row);
            }
        }
        Arc::new(state)
    }

    /// Make any executed SQL containing `pattern` fail like a syntax error.
    pub fn fail_matching(&self, pattern: &str) {
        *self.fail_on_sql.lock().unwrap() = Some(pattern.to_string());
    }

    /// Park the next `ping` until a permit is added to the returned gate.
    pub fn gate_ping(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.ping_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    pub fn executed_sql(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    pub fn ledger_row(&self, version: &str) -> Option<MigrationRecord> {
        self.ledger.lock().unwrap().get(version).cloned()
    }
}

pub struct StubDatabase {
    pub state: Arc<StubState>,
}

#[async_trait]
impl Database for StubDatabase {
    async fn session(&self) -> Result<Box<dyn InstallSession>> {
        Ok(Box::new(StubSession {
            state: Arc::clone(&self.state),
        }))
    }
}

struct StubSession {
    state: Arc<StubState>,
}

impl StubSession {
    fn run_sql(&self, sql: &str) -> Result<()> {
        self.state.executed.lock().unwrap().push(sql.to_string());
        let pattern = self.state.fail_on_sql.lock().unwrap().clone();
        if let Some(pattern) = pattern {
            if sql.contains(&pattern) {
                anyhow::bail!("syntax error at or near \"{}\"", pattern);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl InstallSession for StubSession {
    async fn ping(&mut self) -> Result<()> {
        let gate = self.state.ping_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.acquire().await.unwrap().forget();
        }
        Ok(())
    }

    async fn acquire_lock(&mut self, _key: i64) -> Result<()> {
        self.state.locks_acquired.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn release_lock(&mut self, _key: i64) -> Result<()> {
        self.state.locks_released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn is_fresh(&mut self) -> Result<bool> {
        Ok(self.state.fresh.load(Ordering::SeqCst))
    }

    async fn ensure_ledger(&mut self) -> Result<()> {
        self.state.ensure_ledger_calls.fetch_add(1, Ordering::SeqCst);
        self.state.fresh.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn get_migration(&mut self, version: &str) -> Result<Option<MigrationRecord>> {
        Ok(self.state.ledger.lock().unwrap().get(version).cloned())
    }

    async fn record_migration(&mut self, record: &MigrationRecord) -> Result<()> {
        self.state
            .ledger
            .lock()
            .unwrap()
            .insert(record.version.clone(), record.clone());
        Ok(())
    }

    async fn execute_batch(&mut self, sql: &str) -> Result<()> {
        self.state.batch_executions.fetch_add(1, Ordering::SeqCst);
        self.run_sql(sql)
    }

    async fn execute_in_transaction(&mut self, sql: &str) -> Result<()> {
        self.state.tx_executions.fetch_add(1, Ordering::SeqCst);
        self.run_sql(sql)
    }
}
