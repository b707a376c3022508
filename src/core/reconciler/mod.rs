//! The control loop that keeps one workflow run (and its session) alive.
//!
//! All mutation of [`PersistedState`] happens under `state`; a tick holds it for its
//! whole (bounded) sequence of provider calls, and every facade operation takes the same
//! lock, so a manual `stop` can never interleave with an automatic dispatch. A `stop`
//! raised while a tick is in flight flips `stop_requested` first, which the tick checks
//! before dispatching anything.

mod phase;
#[cfg(test)]
mod tests;

pub use phase::{RunPhase, can_transition};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::config::KeeperConfig;
use crate::core::extractor::SessionExtractor;
use crate::core::provider::{
    DispatchInputs, ProviderError, RepositorySummary, RunId, RunStatus, RunTarget,
    WorkflowProvider, WorkflowRun,
};
use crate::core::store::{PersistedState, RepositoryRef, Session, StateStore, StoreError};
use crate::core::vault::{AccessToken, AccountSummary, CredentialVault, VaultError};

pub const DEFAULT_RESTART_REASON: &str = "Manual restart via API";

pub const DEFAULT_REPO_DESCRIPTION: &str = "Remote session host kept alive by vmkeeper";

/// Workflow pushed when the operator does not supply one: installs sshx and serves
/// a session until the job times out.
pub const WORKFLOW_TEMPLATE: &str = include_str!("../../../templates/vm-worker.yml");

const WORKFLOW_COMMIT_MESSAGE: &str = "Add/update vmkeeper worker workflow";

#[derive(Debug, thiserror::Error)]
pub enum FacadeError {
    #[error("no active account and repository configured")]
    NotConfigured,

    #[error("invalid repository name '{0}', expected owner/name")]
    InvalidRepository(String),

    #[error("invalid repository name '{0}', use letters, digits, '-', '_' or '.'")]
    InvalidName(String),

    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Completed,
    /// Another tick still held the gate.
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub active_account: Option<String>,
    pub active_repo: Option<String>,
    pub run_state: RunPhase,
    pub auto_dispatch: bool,
    pub active_run_id: Option<RunId>,
    pub current_session_url: Option<String>,
    pub uptime_secs: Option<i64>,
    pub restart_count: u64,
    pub consecutive_failures: u32,
    pub last_action: Option<String>,
    pub last_error: Option<String>,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub last_restart_reason: Option<String>,
    pub last_restart_at: Option<DateTime<Utc>>,
}

impl StatusReport {
    pub fn from_state(state: &PersistedState, now: DateTime<Utc>) -> Self {
        let r = &state.reconciler;
        Self {
            active_account: state.credentials.active.clone(),
            active_repo: state.active_repo.as_ref().map(|r| r.full_name.clone()),
            run_state: state.phase,
            auto_dispatch: state.auto_dispatch,
            active_run_id: state.active_run_id,
            current_session_url: state.current_session.clone(),
            uptime_secs: r
                .uptime_start
                .map(|start| (now - start).num_seconds().max(0)),
            restart_count: r.total_restarts,
            consecutive_failures: r.consecutive_failures,
            last_action: r.last_action.clone(),
            last_error: r.last_error.clone(),
            last_poll_at: r.last_poll_at,
            last_restart_reason: r.last_restart_reason.clone(),
            last_restart_at: r.last_restart_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryReport {
    pub runs: Vec<WorkflowRun>,
    pub sessions: Vec<Session>,
}

impl HistoryReport {
    pub fn from_state(state: &PersistedState, limit: usize) -> Self {
        Self {
            runs: state.runs.iter().take(limit).cloned().collect(),
            sessions: state.sessions.iter().take(limit).cloned().collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub workflow_id: String,
    pub poll_interval: Duration,
    pub stall_timeout: Duration,
    pub degraded_threshold: u32,
    pub run_list_limit: usize,
    pub run_history_limit: usize,
    pub session_history_limit: usize,
}

impl ReconcilerSettings {
    pub fn from_config(config: &KeeperConfig) -> Self {
        Self {
            workflow_id: config.workflow_id.clone(),
            poll_interval: config.poll_interval(),
            stall_timeout: config.stall_timeout(),
            degraded_threshold: config.degraded_threshold,
            run_list_limit: config.run_list_limit.max(1),
            run_history_limit: config.run_history_limit,
            session_history_limit: config.session_history_limit,
        }
    }
}

/// One path segment of a repository name: ASCII alphanumerics, `-`, `_` or `.`.
pub fn is_valid_repository_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// `owner/name`, both parts valid repository names.
pub fn is_valid_repository(full_name: &str) -> bool {
    match full_name.split_once('/') {
        Some((owner, name)) => is_valid_repository_name(owner) && is_valid_repository_name(name),
        None => false,
    }
}

pub struct Reconciler {
    state: Mutex<PersistedState>,
    tick_gate: Mutex<()>,
    stop_requested: AtomicBool,
    published: watch::Sender<PersistedState>,
    store: StateStore,
    vault: CredentialVault,
    provider: Arc<dyn WorkflowProvider>,
    extractor: SessionExtractor,
    settings: ReconcilerSettings,
}

impl Reconciler {
    /// Load persisted state and build the reconciler. The loop resumes from whatever
    /// phase was last persisted.
    pub fn open(
        config: &KeeperConfig,
        store: StateStore,
        vault: CredentialVault,
        provider: Arc<dyn WorkflowProvider>,
    ) -> anyhow::Result<Self> {
        let state = store.load()?;
        let extractor = SessionExtractor::new(&config.session)?;
        info!(
            "Reconciler state loaded from {} (phase: {}, restarts: {})",
            store.path().display(),
            state.phase,
            state.reconciler.total_restarts
        );
        let (published, _) = watch::channel(state.clone());
        Ok(Self {
            state: Mutex::new(state),
            tick_gate: Mutex::new(()),
            stop_requested: AtomicBool::new(false),
            published,
            store,
            vault,
            provider,
            extractor,
            settings: ReconcilerSettings::from_config(config),
        })
    }

    /// Drive ticks on a fixed interval until `shutdown` fires. A tick already in
    /// progress runs to completion first.
    pub async fn run_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.settings.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            "Reconciler loop started (every {}s)",
            self.settings.poll_interval.as_secs()
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }
        info!("Reconciler loop stopped");
    }

    pub async fn tick(&self) -> TickOutcome {
        self.tick_at(Utc::now()).await
    }

    pub(crate) async fn tick_at(&self, now: DateTime<Utc>) -> TickOutcome {
        let Ok(_gate) = self.tick_gate.try_lock() else {
            debug!("Previous tick still running, skipping");
            return TickOutcome::Skipped;
        };
        let mut state = self.state.lock().await;
        state.reconciler.last_poll_at = Some(now);

        if state.phase == RunPhase::Degraded {
            debug!("Degraded, waiting for operator");
        } else {
            let result = self.drive(&mut state, now).await;
            self.settle(&mut state, result);
        }

        if let Err(e) = self.persist(&mut state) {
            error!("Failed to persist keeper state: {}", e);
        }
        TickOutcome::Completed
    }

    async fn drive(&self, state: &mut PersistedState, now: DateTime<Utc>) -> Result<(), FacadeError> {
        if !state.is_configured() {
            if state.phase != RunPhase::Idle {
                state.clear_tracking();
                self.transition(state, RunPhase::Idle, "Waiting for account and repository");
            }
            return Ok(());
        }
        let (token, repo) = self.credentials(state)?;
        let target = RunTarget {
            token: token.expose(),
            repo: &repo,
        };

        match state.phase {
            RunPhase::Idle if state.auto_dispatch => self.launch(state, &target, now, None).await,
            RunPhase::Idle | RunPhase::Degraded => Ok(()),
            RunPhase::Restarting => self.launch(state, &target, now, None).await,
            RunPhase::Starting => self.poll_starting(state, &target, now).await,
            RunPhase::Running | RunPhase::Sessioned => self.poll_run(state, &target, now).await,
        }
    }

    /// Fold the outcome of one drive step into the failure bookkeeping.
    fn settle(&self, state: &mut PersistedState, result: Result<(), FacadeError>) {
        match result {
            Ok(()) => state.reconciler.consecutive_failures = 0,
            Err(err) => self.record_failure(state, &err),
        }
    }

    fn record_failure(&self, state: &mut PersistedState, err: &FacadeError) {
        state.reconciler.last_error = Some(err.to_string());
        match err {
            FacadeError::Provider(ProviderError::Auth(_)) => {
                self.degrade(state, "Provider rejected the active account's token");
            }
            FacadeError::Provider(ProviderError::NotFound(_)) => {
                self.degrade(state, "Repository or workflow not found");
            }
            FacadeError::Vault(_) => {
                self.degrade(state, "Active account's token cannot be used");
            }
            FacadeError::Store(e) => {
                error!("State store failure: {}", e);
            }
            FacadeError::NotConfigured
            | FacadeError::InvalidRepository(_)
            | FacadeError::InvalidName(_) => {}
            FacadeError::Provider(e) => {
                state.reconciler.consecutive_failures += 1;
                let failures = state.reconciler.consecutive_failures;
                warn!(
                    "Provider call failed ({}/{}): {}",
                    failures, self.settings.degraded_threshold, e
                );
                if failures >= self.settings.degraded_threshold {
                    self.degrade(state, format!("{} consecutive provider failures", failures));
                }
            }
        }
    }

    fn degrade(&self, state: &mut PersistedState, reason: impl Into<String>) {
        let reason = reason.into();
        error!("Automatic dispatch paused: {}", reason);
        self.transition(state, RunPhase::Degraded, reason);
    }

    fn transition(&self, state: &mut PersistedState, to: RunPhase, action: impl Into<String>) {
        let action = action.into();
        let from = state.phase;
        if !can_transition(from, to) {
            warn!("Unexpected phase change {} -> {}", from, to);
        }
        if from != to {
            info!("{} -> {}: {}", from, to, action);
        } else {
            info!("{}", action);
        }
        state.phase = to;
        state.reconciler.last_action = Some(action);
    }

    fn begin_restart(&self, state: &mut PersistedState, reason: impl Into<String>, now: DateTime<Utc>) {
        let reason = reason.into();
        state.reconciler.total_restarts += 1;
        state.reconciler.last_restart_reason = Some(reason.clone());
        state.reconciler.last_restart_at = Some(now);
        state.clear_tracking();
        self.transition(state, RunPhase::Restarting, reason);
    }

    /// Count a restart and launch its replacement. A pending stop wins: nothing is
    /// counted and the tracked run is left for the stop to clear.
    async fn relaunch(
        &self,
        state: &mut PersistedState,
        target: &RunTarget<'_>,
        reason: impl Into<String>,
        now: DateTime<Utc>,
        skip: Option<RunId>,
    ) -> Result<(), FacadeError> {
        if self.stop_requested.load(Ordering::SeqCst) {
            info!("Stop pending, not restarting");
            return Ok(());
        }
        self.begin_restart(state, reason, now);
        self.launch(state, target, now, skip).await
    }

    fn persist(&self, state: &mut PersistedState) -> Result<(), StoreError> {
        self.store.save(state)?;
        self.published.send_replace(state.clone());
        Ok(())
    }

    fn credentials(&self, state: &PersistedState) -> Result<(AccessToken, String), FacadeError> {
        let repo = state
            .active_repo
            .as_ref()
            .map(|r| r.full_name.clone())
            .ok_or(FacadeError::NotConfigured)?;
        let token = self.vault.active_token(&state.credentials)?;
        Ok((token, repo))
    }

    /// Ensure exactly one run exists: adopt a live run if the provider already has one,
    /// otherwise dispatch. `skip` is a run just cancelled that may still look live.
    async fn launch(
        &self,
        state: &mut PersistedState,
        target: &RunTarget<'_>,
        now: DateTime<Utc>,
        skip: Option<RunId>,
    ) -> Result<(), FacadeError> {
        if self.stop_requested.load(Ordering::SeqCst) {
            info!("Stop pending, not dispatching");
            return Ok(());
        }

        let runs = self
            .provider
            .list_runs(target, &self.settings.workflow_id, self.settings.run_list_limit)
            .await?;
        let mut live: Vec<WorkflowRun> = runs
            .into_iter()
            .filter(|r| !r.is_terminal() && !state.cancelling.contains(&r.id) && Some(r.id) != skip)
            .collect();
        if !live.is_empty() {
            let adopted = live.remove(0);
            for extra in live {
                warn!("Cancelling surplus run {}", extra.id);
                if let Err(e) = self.cancel_quietly(state, target, extra.id).await {
                    warn!("Could not cancel surplus run {}: {}", extra.id, e);
                }
            }
            state.reconciler.uptime_start.get_or_insert(now);
            self.track(state, adopted.clone());
            state.dispatched_at = Some(adopted.created_at);
            self.transition(
                state,
                RunPhase::Running,
                format!("Adopted existing run {}", adopted.id),
            );
            return Ok(());
        }

        let previous = state.phase;
        state.clear_tracking();
        state.dispatched_at = Some(now);
        state.reconciler.uptime_start.get_or_insert(now);
        self.transition(state, RunPhase::Starting, "Dispatching workflow run");
        if let Err(e) = self.persist(state) {
            state.phase = previous;
            state.dispatched_at = None;
            return Err(e.into());
        }

        match self
            .provider
            .dispatch_run(target, &self.settings.workflow_id, &DispatchInputs::new())
            .await
        {
            Ok(run_id) => {
                state.active_run_id = Some(run_id);
                match self.provider.get_run(target, run_id).await {
                    Ok(run) => state.record_run(run, self.settings.run_history_limit),
                    Err(e) => warn!("Could not fetch dispatched run {}: {}", run_id, e),
                }
                self.transition(state, RunPhase::Running, format!("Run {} dispatched", run_id));
                self.cancel_surplus(state, target, run_id, skip).await;
                Ok(())
            }
            Err(ProviderError::RunNotVisible) => {
                info!("Dispatch accepted, waiting for the run to appear");
                Ok(())
            }
            Err(e) => {
                state.phase = previous;
                state.dispatched_at = None;
                Err(e.into())
            }
        }
    }

    /// A dispatch retried after a lost acknowledgement leaves a second run behind;
    /// cancel every live run other than `keep`.
    async fn cancel_surplus(
        &self,
        state: &mut PersistedState,
        target: &RunTarget<'_>,
        keep: RunId,
        skip: Option<RunId>,
    ) {
        let runs = match self
            .provider
            .list_runs(target, &self.settings.workflow_id, self.settings.run_list_limit)
            .await
        {
            Ok(runs) => runs,
            Err(e) => {
                warn!("Could not check for surplus runs: {}", e);
                return;
            }
        };
        let surplus: Vec<RunId> = runs
            .into_iter()
            .filter(|r| {
                !r.is_terminal()
                    && r.id != keep
                    && Some(r.id) != skip
                    && !state.cancelling.contains(&r.id)
            })
            .map(|r| r.id)
            .collect();
        for run_id in surplus {
            warn!("Cancelling surplus run {}", run_id);
            if let Err(e) = self.cancel_quietly(state, target, run_id).await {
                warn!("Could not cancel surplus run {}: {}", run_id, e);
            }
        }
    }

    fn track(&self, state: &mut PersistedState, run: WorkflowRun) {
        state.active_run_id = Some(run.id);
        state.current_session = None;
        state.record_run(run, self.settings.run_history_limit);
    }

    /// Dispatch went out but the run id is unknown: look for it, or give up after the
    /// stall timeout.
    async fn poll_starting(
        &self,
        state: &mut PersistedState,
        target: &RunTarget<'_>,
        now: DateTime<Utc>,
    ) -> Result<(), FacadeError> {
        if state.active_run_id.is_some() {
            return self.poll_run(state, target, now).await;
        }

        let runs = self
            .provider
            .list_runs(target, &self.settings.workflow_id, self.settings.run_list_limit)
            .await?;
        let found = runs
            .into_iter()
            .find(|r| !r.is_terminal() && !state.cancelling.contains(&r.id));
        if let Some(run) = found {
            let run_id = run.id;
            self.track(state, run);
            self.transition(state, RunPhase::Running, format!("Run {} located", run_id));
            return self.poll_run(state, target, now).await;
        }

        if self.stalled(state.dispatched_at, now) {
            return self
                .relaunch(state, target, "Watchdog: dispatched run never appeared", now, None)
                .await;
        }
        Ok(())
    }

    fn stalled(&self, since: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match since {
            Some(since) => (now - since).to_std().unwrap_or_default() > self.settings.stall_timeout,
            None => true,
        }
    }

    async fn poll_run(
        &self,
        state: &mut PersistedState,
        target: &RunTarget<'_>,
        now: DateTime<Utc>,
    ) -> Result<(), FacadeError> {
        let Some(run_id) = state.active_run_id else {
            return self
                .relaunch(state, target, "Lost track of the active run", now, None)
                .await;
        };

        let run = match self.provider.get_run(target, run_id).await {
            Ok(run) => run,
            Err(ProviderError::NotFound(_)) => {
                let reason = format!("Run {} no longer exists", run_id);
                return self.relaunch(state, target, reason, now, Some(run_id)).await;
            }
            Err(e) => return Err(e.into()),
        };
        state.record_run(run.clone(), self.settings.run_history_limit);

        if run.is_terminal() {
            let reason = format!("Auto-restart: previous run {}", run.conclusion_label());
            return self.relaunch(state, target, reason, now, Some(run_id)).await;
        }
        if state.phase == RunPhase::Starting {
            self.transition(state, RunPhase::Running, format!("Run {} located", run_id));
        }

        if run.status == RunStatus::InProgress {
            let log = self.provider.get_run_log(target, run_id).await?;
            if let Some(url) = self.extractor.extract(&log) {
                if state.current_session.as_deref() != Some(url.as_str()) {
                    let session = Session {
                        url: url.clone(),
                        discovered_at: now,
                        run_id,
                    };
                    state.record_session(session, self.settings.session_history_limit);
                    self.transition(
                        state,
                        RunPhase::Sessioned,
                        format!("Session available for run {}: {}", run_id, url),
                    );
                }
                return Ok(());
            }
        }

        if state.phase == RunPhase::Running && self.stalled(Some(run.created_at), now) {
            warn!(
                "Run {} produced no session within {}s",
                run_id,
                self.settings.stall_timeout.as_secs()
            );
            self.cancel_quietly(state, target, run_id).await?;
            let reason = format!(
                "Watchdog: no session after {}s",
                self.settings.stall_timeout.as_secs()
            );
            return self.relaunch(state, target, reason, now, Some(run_id)).await;
        }
        Ok(())
    }

    /// Cancel a run, treating "already gone" as success.
    async fn cancel_quietly(
        &self,
        state: &mut PersistedState,
        target: &RunTarget<'_>,
        run_id: RunId,
    ) -> Result<(), ProviderError> {
        match self.provider.cancel_run(target, run_id).await {
            Ok(()) => {
                info!("Cancelled run {}", run_id);
                state.mark_cancelling(run_id);
                Ok(())
            }
            Err(ProviderError::NotFound(_)) | Err(ProviderError::AlreadyTerminal(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Best-effort cancel of the tracked run before the account or repository changes
    /// under it.
    async fn release_run(&self, state: &mut PersistedState, why: &str) {
        if let Some(run_id) = state.active_run_id
            && let Ok((token, repo)) = self.credentials(state)
        {
            let target = RunTarget {
                token: token.expose(),
                repo: &repo,
            };
            if let Err(e) = self.cancel_quietly(state, &target, run_id).await {
                warn!("Could not cancel run {}: {}", run_id, e);
            }
        }
        state.clear_tracking();
        state.reconciler.uptime_start = None;
        state.reconciler.consecutive_failures = 0;
        if state.phase != RunPhase::Idle {
            self.transition(state, RunPhase::Idle, why);
        }
    }

    fn finish(&self, state: &mut PersistedState, result: Result<(), FacadeError>) -> Result<(), FacadeError> {
        let failed = match result {
            Ok(()) => {
                state.reconciler.consecutive_failures = 0;
                None
            }
            Err(err) => {
                self.record_failure(state, &err);
                Some(err)
            }
        };
        let persisted = self.persist(state);
        match (failed, persisted) {
            (Some(err), Err(e)) => {
                error!("Failed to persist keeper state: {}", e);
                Err(err)
            }
            (Some(err), Ok(())) => Err(err),
            (None, persisted) => Ok(persisted?),
        }
    }

    pub async fn start(&self) -> Result<StartOutcome, FacadeError> {
        let mut state = self.state.lock().await;
        if !state.is_configured() {
            return Err(FacadeError::NotConfigured);
        }
        if state.phase.is_active() {
            info!("Start requested while {}, nothing to do", state.phase);
            return Ok(StartOutcome::AlreadyRunning);
        }

        state.auto_dispatch = true;
        state.reconciler.consecutive_failures = 0;
        if state.phase == RunPhase::Degraded {
            state.clear_tracking();
            self.transition(&mut state, RunPhase::Idle, "Resumed by operator");
        }
        let result = match self.credentials(&state) {
            Ok((token, repo)) => {
                let target = RunTarget {
                    token: token.expose(),
                    repo: &repo,
                };
                self.launch(&mut state, &target, Utc::now(), None).await
            }
            Err(e) => Err(e),
        };
        self.finish(&mut state, result)?;
        Ok(StartOutcome::Started)
    }

    /// Cancel the current run and go idle. Automatic dispatch stays off until the next
    /// `start` or `restart`.
    pub async fn stop(&self) -> Result<(), FacadeError> {
        self.stop_requested.store(true, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        let result = self.stop_locked(&mut state).await;
        self.stop_requested.store(false, Ordering::SeqCst);
        result
    }

    async fn stop_locked(&self, state: &mut PersistedState) -> Result<(), FacadeError> {
        if !state.is_configured() && state.active_run_id.is_none() {
            return Err(FacadeError::NotConfigured);
        }
        if let Some(run_id) = state.active_run_id {
            match self.credentials(state) {
                Ok((token, repo)) => {
                    let target = RunTarget {
                        token: token.expose(),
                        repo: &repo,
                    };
                    if let Err(e) = self.cancel_quietly(state, &target, run_id).await {
                        warn!("Could not cancel run {}: {}", run_id, e);
                        state.reconciler.last_error = Some(e.to_string());
                    }
                }
                Err(e) => warn!("Cannot cancel run {}: {}", run_id, e),
            }
        }
        state.auto_dispatch = false;
        state.clear_tracking();
        state.reconciler.uptime_start = None;
        state.reconciler.consecutive_failures = 0;
        self.transition(state, RunPhase::Idle, "Stopped by operator");
        self.persist(state)?;
        Ok(())
    }

    /// Cancel the current run (if any) and dispatch a fresh one. Also the way out of
    /// `Degraded`.
    pub async fn restart(&self, reason: Option<&str>) -> Result<(), FacadeError> {
        let mut state = self.state.lock().await;
        if !state.is_configured() {
            return Err(FacadeError::NotConfigured);
        }
        let reason = reason
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or(DEFAULT_RESTART_REASON);
        let result = self.restart_locked(&mut state, reason).await;
        self.finish(&mut state, result)
    }

    async fn restart_locked(&self, state: &mut PersistedState, reason: &str) -> Result<(), FacadeError> {
        let (token, repo) = self.credentials(state)?;
        let target = RunTarget {
            token: token.expose(),
            repo: &repo,
        };
        let now = Utc::now();
        let previous = state.active_run_id;
        if let Some(run_id) = previous {
            self.cancel_quietly(state, &target, run_id).await?;
        }
        state.auto_dispatch = true;
        state.reconciler.consecutive_failures = 0;
        self.relaunch(state, &target, reason, now, previous).await
    }

    pub async fn add_account(&self, token: &str) -> Result<AccountSummary, FacadeError> {
        let mut state = self.state.lock().await;
        let summary = self
            .vault
            .add_account(&mut state.credentials, self.provider.as_ref(), token)
            .await?;
        self.persist(&mut state)?;
        Ok(summary)
    }

    pub fn list_accounts(&self) -> Vec<AccountSummary> {
        self.published.borrow().credentials.summaries()
    }

    pub async fn switch_account(&self, id: &str) -> Result<(), FacadeError> {
        let mut state = self.state.lock().await;
        if state.credentials.get(id).is_none() {
            return Err(VaultError::NotFound(id.to_string()).into());
        }
        if state.credentials.active.as_deref() == Some(id) {
            return Ok(());
        }
        self.release_run(&mut state, &format!("Switched to account {}", id))
            .await;
        state.credentials.set_active(id)?;
        info!("Active account is now {}", id);
        self.persist(&mut state)?;
        Ok(())
    }

    pub async fn remove_account(&self, id: &str) -> Result<(), FacadeError> {
        let mut state = self.state.lock().await;
        if state.credentials.get(id).is_none() {
            return Err(VaultError::NotFound(id.to_string()).into());
        }
        if state.credentials.active.as_deref() == Some(id) {
            self.release_run(&mut state, &format!("Removed account {}", id))
                .await;
        }
        state.credentials.remove(id)?;
        info!("Removed account {}", id);
        self.persist(&mut state)?;
        Ok(())
    }

    pub async fn select_repository(&self, full_name: &str) -> Result<(), FacadeError> {
        let full_name = full_name.trim();
        if !is_valid_repository(full_name) {
            return Err(FacadeError::InvalidRepository(full_name.to_string()));
        }
        let mut state = self.state.lock().await;
        if state.active_repo.as_ref().map(|r| r.full_name.as_str()) == Some(full_name) {
            return Ok(());
        }
        self.release_run(&mut state, &format!("Switched to repository {}", full_name))
            .await;
        state.active_repo = Some(RepositoryRef {
            full_name: full_name.to_string(),
        });
        info!("Active repository is now {}", full_name);
        self.persist(&mut state)?;
        Ok(())
    }

    /// Token of the active account as of the last persisted state.
    fn published_token(&self) -> Result<AccessToken, FacadeError> {
        let snapshot = self.published.borrow();
        Ok(self.vault.active_token(&snapshot.credentials)?)
    }

    pub async fn list_repositories(&self, limit: usize) -> Result<Vec<RepositorySummary>, FacadeError> {
        let token = self.published_token()?;
        Ok(self.provider.list_repositories(token.expose(), limit).await?)
    }

    /// Create a repository for the active account, push the worker workflow into it
    /// and make it the active repository. Without a name one is generated.
    pub async fn create_repository(&self, name: Option<&str>) -> Result<String, FacadeError> {
        let name = match name.map(str::trim).filter(|n| !n.is_empty()) {
            Some(name) => name.to_string(),
            None => format!("vmkeeper-{}", Utc::now().format("%Y%m%d-%H%M%S")),
        };
        if !is_valid_repository_name(&name) {
            return Err(FacadeError::InvalidName(name));
        }
        let token = self.published_token()?;
        let full_name = self
            .provider
            .create_repository(token.expose(), &name, DEFAULT_REPO_DESCRIPTION)
            .await?;
        info!("Created repository {}", full_name);
        self.push_workflow_to(&token, &full_name, None).await?;
        self.select_repository(&full_name).await?;
        Ok(full_name)
    }

    /// Push `content` (or the built-in template) as the workflow file of the active
    /// repository. Returns the path written.
    pub async fn push_workflow(&self, content: Option<&str>) -> Result<String, FacadeError> {
        let (token, repo) = {
            let snapshot = self.published.borrow();
            self.credentials(&snapshot)?
        };
        self.push_workflow_to(&token, &repo, content).await
    }

    async fn push_workflow_to(
        &self,
        token: &AccessToken,
        repo: &str,
        content: Option<&str>,
    ) -> Result<String, FacadeError> {
        let path = format!(".github/workflows/{}", self.settings.workflow_id);
        let target = RunTarget {
            token: token.expose(),
            repo,
        };
        self.provider
            .push_file(
                &target,
                &path,
                content.unwrap_or(WORKFLOW_TEMPLATE),
                WORKFLOW_COMMIT_MESSAGE,
            )
            .await?;
        info!("Pushed {} to {}", path, repo);
        Ok(path)
    }

    pub async fn reset_counters(&self) -> Result<(), FacadeError> {
        let mut state = self.state.lock().await;
        state.reconciler.total_restarts = 0;
        state.reconciler.last_restart_reason = None;
        state.reconciler.last_restart_at = None;
        state.reconciler.consecutive_failures = 0;
        state.reconciler.last_error = None;
        info!("Restart counters reset");
        self.persist(&mut state)?;
        Ok(())
    }

    /// Status as of the last persisted state; never waits on an in-flight tick.
    pub fn get_status(&self) -> StatusReport {
        StatusReport::from_state(&self.published.borrow(), Utc::now())
    }

    pub fn get_history(&self, limit: usize) -> HistoryReport {
        HistoryReport::from_state(&self.published.borrow(), limit)
    }
}
