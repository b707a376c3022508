//! Durable keeper state.
//!
//! Everything the reconciler needs to resume after a process restart lives in one
//! versioned JSON record. Writes go to `state.json.tmp`, are fsynced, then renamed
//! over `state.json`, so a reader sees either the previous or the new file.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::core::provider::{RunId, WorkflowRun};
use crate::core::reconciler::RunPhase;
use crate::core::vault::{Account, AccountBook};
use crate::platform::{NativePlatform, Platform};

pub const SCHEMA_VERSION: u32 = 2;

/// Cancelled run ids remembered so a run still reported as in progress is not adopted again.
const CANCELLING_LIMIT: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("state file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("state file is corrupt: {0}")]
    Corrupt(String),

    #[error("state file schema v{0} is newer than supported v{supported}", supported = SCHEMA_VERSION)]
    UnsupportedVersion(u64),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryRef {
    pub full_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub url: String,
    pub discovered_at: DateTime<Utc>,
    pub run_id: RunId,
}

/// Counters and bookkeeping mutated only by the reconciler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerState {
    pub uptime_start: Option<DateTime<Utc>>,
    pub total_restarts: u64,
    pub consecutive_failures: u32,
    pub last_action: Option<String>,
    pub last_error: Option<String>,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub last_restart_reason: Option<String>,
    pub last_restart_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedState {
    pub schema_version: u32,
    pub credentials: AccountBook,
    pub active_repo: Option<RepositoryRef>,
    pub phase: RunPhase,
    /// Cleared by an explicit stop; while false the tick never dispatches.
    pub auto_dispatch: bool,
    pub active_run_id: Option<RunId>,
    pub dispatched_at: Option<DateTime<Utc>>,
    /// Newest first, bounded.
    pub runs: Vec<WorkflowRun>,
    /// Newest first, bounded, unique by url.
    pub sessions: Vec<Session>,
    pub current_session: Option<String>,
    pub cancelling: Vec<RunId>,
    pub reconciler: ReconcilerState,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            credentials: AccountBook::default(),
            active_repo: None,
            phase: RunPhase::Idle,
            auto_dispatch: true,
            active_run_id: None,
            dispatched_at: None,
            runs: Vec::new(),
            sessions: Vec::new(),
            current_session: None,
            cancelling: Vec::new(),
            reconciler: ReconcilerState::default(),
        }
    }
}

impl PersistedState {
    /// Both an active account and a repository are selected.
    pub fn is_configured(&self) -> bool {
        self.credentials.active_account().is_some() && self.active_repo.is_some()
    }

    /// Insert or refresh a run, keep the history newest-first and bounded, and drop
    /// sessions whose run aged out.
    pub fn record_run(&mut self, run: WorkflowRun, limit: usize) {
        match self.runs.iter_mut().find(|r| r.id == run.id) {
            Some(existing) => *existing = run,
            None => self.runs.push(run),
        }
        self.runs
            .sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        self.runs.truncate(limit.max(1));

        let runs = &self.runs;
        self.sessions
            .retain(|s| runs.iter().any(|r| r.id == s.run_id));
    }

    /// Make `session` current. Returns false when its url is already in the history.
    pub fn record_session(&mut self, session: Session, limit: usize) -> bool {
        self.current_session = Some(session.url.clone());
        if self.sessions.iter().any(|s| s.url == session.url) {
            return false;
        }
        self.sessions.insert(0, session);
        self.sessions.truncate(limit.max(1));
        true
    }

    pub fn mark_cancelling(&mut self, id: RunId) {
        if !self.cancelling.contains(&id) {
            self.cancelling.insert(0, id);
            self.cancelling.truncate(CANCELLING_LIMIT);
        }
    }

    /// Forget the tracked run and its session; history is kept.
    pub fn clear_tracking(&mut self) {
        self.active_run_id = None;
        self.dispatched_at = None;
        self.current_session = None;
    }
}

/// Layout written before accounts, phases and run history existed.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LegacyState {
    github_tokens: BTreeMap<String, String>,
    active_account: Option<String>,
    active_repo: Option<String>,
    last_run_id: Option<RunId>,
    sshx_urls: Vec<serde_json::Value>,
    total_restarts: u64,
    last_restart_reason: Option<String>,
    last_restart_time: Option<String>,
}

fn parse_legacy_time(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

impl From<LegacyState> for PersistedState {
    fn from(legacy: LegacyState) -> Self {
        let owner = legacy
            .active_account
            .clone()
            .or_else(|| legacy.github_tokens.keys().next().cloned());
        let accounts = legacy
            .github_tokens
            .into_iter()
            .map(|(login, encrypted_token)| Account {
                is_owner: owner.as_deref() == Some(login.as_str()),
                label: login.clone(),
                id: login,
                encrypted_token,
                added_at: None,
            })
            .collect::<Vec<_>>();
        let active = legacy
            .active_account
            .filter(|id| accounts.iter().any(|a| &a.id == id))
            .or_else(|| accounts.first().map(|a| a.id.clone()));

        if !legacy.sshx_urls.is_empty() {
            info!(
                "Dropping {} legacy session entries without run ids",
                legacy.sshx_urls.len()
            );
        }

        let mut state = PersistedState {
            credentials: AccountBook { accounts, active },
            active_repo: legacy
                .active_repo
                .filter(|r| !r.is_empty())
                .map(|full_name| RepositoryRef { full_name }),
            reconciler: ReconcilerState {
                total_restarts: legacy.total_restarts,
                last_restart_at: legacy
                    .last_restart_time
                    .as_deref()
                    .and_then(parse_legacy_time),
                last_restart_reason: legacy.last_restart_reason,
                ..Default::default()
            },
            ..Default::default()
        };
        if let Some(run_id) = legacy.last_run_id {
            state.active_run_id = Some(run_id);
            state.phase = RunPhase::Running;
        }
        state
    }
}

pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join("state.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        self.path.with_extension("json.tmp")
    }

    /// Load the persisted state, or the default when nothing was saved yet.
    /// Older schemas are upgraded and written back immediately.
    pub fn load(&self) -> Result<PersistedState, StoreError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(PersistedState::default());
            }
            Err(e) => return Err(e.into()),
        };

        let value: serde_json::Value =
            serde_json::from_str(&content).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        if !value.is_object() {
            return Err(StoreError::Corrupt("top-level value is not an object".into()));
        }

        match value.get("schema_version").and_then(|v| v.as_u64()) {
            Some(version) if version > SCHEMA_VERSION as u64 => {
                Err(StoreError::UnsupportedVersion(version))
            }
            Some(version) if version == SCHEMA_VERSION as u64 => {
                serde_json::from_value(value).map_err(|e| StoreError::Corrupt(e.to_string()))
            }
            _ => {
                let legacy: LegacyState = serde_json::from_value(value)
                    .map_err(|e| StoreError::Corrupt(e.to_string()))?;
                let state = PersistedState::from(legacy);
                info!(
                    "Upgrading state file {} to schema v{}",
                    self.path.display(),
                    SCHEMA_VERSION
                );
                if let Err(e) = self.save(&state) {
                    warn!("Could not write upgraded state file: {}", e);
                }
                Ok(state)
            }
        }
    }

    /// Atomically replace the state file.
    pub fn save(&self, state: &PersistedState) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(state)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        self.write_atomic(content.as_bytes())
    }

    fn write_atomic(&self, contents: &[u8]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let tmp_path = self.tmp_path();
        {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(contents)?;
            file.sync_all()?;
        }
        NativePlatform::restrict_file_permissions(&tmp_path);
        fs::rename(&tmp_path, &self.path)?;
        sync_parent_dir(&self.path);
        Ok(())
    }
}

/// Persist the rename itself; best effort.
#[cfg(unix)]
fn sync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent()
        && let Ok(dir) = fs::File::open(parent)
    {
        let _ = dir.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) {}
