use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use crate::agents::state::RunState;
use crate::cli::PersistenceBackend;
use crate::config::RuntimeConfig;

/// Append and read-by-session of run snapshots. Appending a run id that is
/// already stored replaces it, so the last write is the one read back.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn append(&self, state: &RunState) -> Result<()>;

    /// Up to `limit` most recent runs for a session, oldest first.
    async fn list_by_session(&self, session_id: &str, limit: usize) -> Result<Vec<RunState>>;
}

/// Runs kept per session by the in-memory store before the oldest are evicted.
pub const MEMORY_RUNS_PER_SESSION: usize = 100;

#[derive(Debug)]
pub struct MemoryRunStore {
    runs: Mutex<HashMap<String, Vec<RunState>>>,
    max_runs_per_session: usize,
}

impl MemoryRunStore {
    pub fn with_capacity(max_runs_per_session: usize) -> Self {
        Self {
            runs: Mutex::new(HashMap::new()),
            max_runs_per_session: max_runs_per_session.max(1),
        }
    }
}

impl Default for MemoryRunStore {
    fn default() -> Self {
        Self::with_capacity(MEMORY_RUNS_PER_SESSION)
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn append(&self, state: &RunState) -> Result<()> {
        let mut runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        let session = runs.entry(state.request.session_id.clone()).or_default();
        match session.iter_mut().find(|r| r.run_id == state.run_id) {
            Some(existing) => *existing = state.clone(),
            None => session.push(state.clone()),
        }
        let overflow = session.len().saturating_sub(self.max_runs_per_session);
        if overflow > 0 {
            session.drain(..overflow);
        }
        Ok(())
    }

    async fn list_by_session(&self, session_id: &str, limit: usize) -> Result<Vec<RunState>> {
        let runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        let Some(session) = runs.get(session_id) else {
            return Ok(Vec::new());
        };
        let skip = session.len().saturating_sub(limit);
        Ok(session.iter().skip(skip).cloned().collect())
    }
}

pub struct SqliteRunStore {
    pool: SqlitePool,
}

impl SqliteRunStore {
    pub async fn open(db_url: &str) -> Result<Self> {
        ensure_parent_dir_for_sqlite_url(db_url)?;
        let options = SqliteConnectOptions::from_str(db_url)
            .context("invalid sqlite database url")?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .context("failed to open sqlite run database")?;
        let store = Self { pool };
        store
            .migrate()
            .await
            .context("failed to run sqlite run-store migrations")?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL UNIQUE,
                session_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                state_json TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_runs_session ON runs(session_id, id)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl RunStore for SqliteRunStore {
    async fn append(&self, state: &RunState) -> Result<()> {
        let json = serde_json::to_string(state).context("failed to serialize run state")?;
        sqlx::query(
            "INSERT INTO runs (run_id, session_id, created_at, state_json)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(run_id) DO UPDATE SET state_json = excluded.state_json",
        )
        .bind(state.run_id.to_string())
        .bind(&state.request.session_id)
        .bind(state.started_at.to_rfc3339())
        .bind(json)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to persist run '{}'", state.run_id))?;
        Ok(())
    }

    async fn list_by_session(&self, session_id: &str, limit: usize) -> Result<Vec<RunState>> {
        let rows = sqlx::query_scalar::<_, String>(
            "SELECT state_json FROM (
                SELECT id, state_json FROM runs WHERE session_id = ? ORDER BY id DESC LIMIT ?
             ) ORDER BY id ASC",
        )
        .bind(session_id)
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to load runs for session '{session_id}'"))?;

        rows.iter()
            .map(|row| serde_json::from_str::<RunState>(row).context("failed to decode persisted run state"))
            .collect()
    }
}

pub async fn build_run_store(cfg: &RuntimeConfig) -> Result<Arc<dyn RunStore>> {
    match cfg.persistence_backend {
        PersistenceBackend::Memory => Ok(Arc::new(MemoryRunStore::default())),
        PersistenceBackend::Sqlite => Ok(Arc::new(SqliteRunStore::open(&cfg.db_url).await?)),
    }
}

pub fn ensure_parent_dir_for_sqlite_url(db_url: &str) -> Result<()> {
    let Some(db_path) = sqlite_path_from_url(db_url) else {
        return Ok(());
    };

    if let Some(parent) = db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).with_context(|| {
            format!(
                "failed to create directory for sqlite database: {}",
                parent.display()
            )
        })?;
    }

    Ok(())
}

pub fn sqlite_path_from_url(db_url: &str) -> Option<PathBuf> {
    if !db_url.starts_with("sqlite://") {
        return None;
    }

    let path_with_params = db_url.trim_start_matches("sqlite://");
    let path_without_params = path_with_params
        .split_once('?')
        .map(|(path, _)| path)
        .unwrap_or(path_with_params);

    if path_without_params.is_empty() || path_without_params == ":memory:" {
        return None;
    }

    Some(Path::new(path_without_params).to_path_buf())
}

pub async fn run_migrate(cfg: &RuntimeConfig) -> Result<()> {
    if cfg.persistence_backend != PersistenceBackend::Sqlite {
        println!("Persistence backend is memory; nothing to migrate.");
        return Ok(());
    }
    SqliteRunStore::open(&cfg.db_url).await?;
    println!(
        "Sqlite run store is up to date ({}).",
        crate::config::display_db_url(cfg)
    );
    Ok(())
}

pub async fn run_runs_list(
    cfg: &RuntimeConfig,
    session_id_override: Option<String>,
    recent: usize,
) -> Result<()> {
    let session_id = session_id_override.unwrap_or_else(|| cfg.session_id.clone());
    let store = build_run_store(cfg).await?;
    let runs = store.list_by_session(&session_id, recent.max(1)).await?;

    if runs.is_empty() {
        println!("No runs found for session '{session_id}'.");
        return Ok(());
    }

    println!("Runs for session '{session_id}':");
    for run in runs {
        let failed = run.failed_steps().count();
        println!(
            "- {} [{}] intent={} steps={} failed={} :: {}",
            run.run_id,
            run.started_at.to_rfc3339(),
            run.routing.intent.as_deref().unwrap_or("default"),
            run.steps().len(),
            failed,
            crate::tools::execute_bash::truncate_text(run.request.input.trim(), 60).0
        );
    }
    Ok(())
}

pub async fn run_runs_last(cfg: &RuntimeConfig, session_id_override: Option<String>) -> Result<()> {
    let session_id = session_id_override.unwrap_or_else(|| cfg.session_id.clone());
    let store = build_run_store(cfg).await?;
    let runs = store.list_by_session(&session_id, 1).await?;
    match runs.last().and_then(|run| run.artifact.as_deref()) {
        Some(artifact) => println!("{artifact}"),
        None => println!("No runs found for session '{session_id}'."),
    }
    Ok(())
}
