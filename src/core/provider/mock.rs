//! Scripted in-memory provider used by unit tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use super::{
    DispatchInputs, Identity, ProviderError, RepositorySummary, RunConclusion, RunId, RunStatus,
    RunTarget, WorkflowProvider, WorkflowRun,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    ValidateToken,
    Dispatch,
    ListRuns,
    GetRun,
    CancelRun,
    GetRunLog,
    ListRepos,
    CreateRepo,
    PushFile,
}

#[derive(Default)]
struct MockState {
    runs: BTreeMap<RunId, WorkflowRun>,
    logs: HashMap<RunId, String>,
    tokens: HashMap<String, String>,
    failures: HashMap<Op, VecDeque<ProviderError>>,
    calls: HashMap<Op, usize>,
    seen_tokens: HashSet<String>,
    next_id: RunId,
    now: Option<DateTime<Utc>>,
    hide_dispatched: bool,
    lost_acks: usize,
    repos: Vec<RepositorySummary>,
    files: HashMap<(String, String), String>,
}

pub struct MockProvider {
    state: Mutex<MockState>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                next_id: 100,
                ..Default::default()
            }),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    fn enter(&self, op: Op, token: &str) -> Result<(), ProviderError> {
        self.with(|s| {
            *s.calls.entry(op).or_default() += 1;
            if op != Op::ValidateToken {
                s.seen_tokens.insert(token.to_string());
            }
            match s.failures.get_mut(&op).and_then(VecDeque::pop_front) {
                Some(err) => Err(err),
                None => Ok(()),
            }
        })
    }

    pub fn accept_token(&self, token: &str, login: &str) {
        self.with(|s| s.tokens.insert(token.to_string(), login.to_string()));
    }

    pub fn fail_next(&self, op: Op, err: ProviderError) {
        self.with(|s| s.failures.entry(op).or_default().push_back(err));
    }

    pub fn calls(&self, op: Op) -> usize {
        self.with(|s| s.calls.get(&op).copied().unwrap_or(0))
    }

    /// Whether `token` authenticated any run-scoped call.
    pub fn saw_token(&self, token: &str) -> bool {
        self.with(|s| s.seen_tokens.contains(token))
    }

    /// Creation time stamped on runs created from now on.
    pub fn set_now(&self, now: DateTime<Utc>) {
        self.with(|s| s.now = Some(now));
    }

    /// Accept dispatches without ever reporting the created run back.
    pub fn hide_dispatched_runs(&self, hide: bool) {
        self.with(|s| s.hide_dispatched = hide);
    }

    /// The next dispatch creates its run but reports a network failure, as when the
    /// response is lost after the provider accepted the request.
    pub fn lose_next_dispatch_ack(&self) {
        self.with(|s| s.lost_acks += 1);
    }

    pub fn add_run(&self, status: RunStatus) -> RunId {
        self.with(|s| {
            let id = s.next_id;
            s.next_id += 1;
            let created_at = s.now.unwrap_or_else(Utc::now);
            s.runs.insert(
                id,
                WorkflowRun {
                    id,
                    number: id - 99,
                    status,
                    conclusion: None,
                    created_at,
                },
            );
            id
        })
    }

    pub fn set_status(&self, id: RunId, status: RunStatus) {
        self.with(|s| {
            if let Some(run) = s.runs.get_mut(&id) {
                run.status = status;
            }
        });
    }

    pub fn complete_run(&self, id: RunId, conclusion: RunConclusion) {
        self.with(|s| {
            if let Some(run) = s.runs.get_mut(&id) {
                run.status = RunStatus::Completed;
                run.conclusion = Some(conclusion);
            }
        });
    }

    pub fn remove_run(&self, id: RunId) {
        self.with(|s| s.runs.remove(&id));
    }

    pub fn set_log(&self, id: RunId, text: &str) {
        self.with(|s| s.logs.insert(id, text.to_string()));
    }

    pub fn run(&self, id: RunId) -> Option<WorkflowRun> {
        self.with(|s| s.runs.get(&id).cloned())
    }

    pub fn non_terminal_count(&self) -> usize {
        self.with(|s| s.runs.values().filter(|r| !r.is_terminal()).count())
    }

    pub fn latest_run_id(&self) -> Option<RunId> {
        self.with(|s| s.runs.keys().next_back().copied())
    }

    pub fn add_repository(&self, full_name: &str) {
        self.with(|s| {
            s.repos.push(RepositorySummary {
                full_name: full_name.to_string(),
                private: false,
                description: None,
                updated_at: Some(s.now.unwrap_or_else(Utc::now)),
            })
        });
    }

    /// Content last pushed to `path` in `repo`.
    pub fn file(&self, repo: &str, path: &str) -> Option<String> {
        self.with(|s| s.files.get(&(repo.to_string(), path.to_string())).cloned())
    }
}

#[async_trait]
impl WorkflowProvider for MockProvider {
    async fn validate_token(&self, token: &str) -> Result<Identity, ProviderError> {
        self.enter(Op::ValidateToken, token)?;
        self.with(|s| match s.tokens.get(token) {
            Some(login) => Ok(Identity {
                login: login.clone(),
            }),
            None => Err(ProviderError::Auth("HTTP 401: Bad credentials".into())),
        })
    }

    async fn dispatch_run(
        &self,
        target: &RunTarget<'_>,
        _workflow_id: &str,
        _inputs: &DispatchInputs,
    ) -> Result<RunId, ProviderError> {
        self.enter(Op::Dispatch, target.token)?;
        let id = self.add_run(RunStatus::Queued);
        let lost = self.with(|s| {
            let lost = s.lost_acks > 0;
            s.lost_acks = s.lost_acks.saturating_sub(1);
            lost
        });
        if lost {
            return Err(ProviderError::Network("connection reset".into()));
        }
        if self.with(|s| s.hide_dispatched) {
            return Err(ProviderError::RunNotVisible);
        }
        Ok(id)
    }

    async fn list_runs(
        &self,
        target: &RunTarget<'_>,
        _workflow_id: &str,
        limit: usize,
    ) -> Result<Vec<WorkflowRun>, ProviderError> {
        self.enter(Op::ListRuns, target.token)?;
        Ok(self.with(|s| s.runs.values().rev().take(limit).cloned().collect()))
    }

    async fn get_run(
        &self,
        target: &RunTarget<'_>,
        run_id: RunId,
    ) -> Result<WorkflowRun, ProviderError> {
        self.enter(Op::GetRun, target.token)?;
        self.with(|s| s.runs.get(&run_id).cloned())
            .ok_or_else(|| ProviderError::NotFound(format!("run {}", run_id)))
    }

    async fn cancel_run(&self, target: &RunTarget<'_>, run_id: RunId) -> Result<(), ProviderError> {
        self.enter(Op::CancelRun, target.token)?;
        self.with(|s| match s.runs.get_mut(&run_id) {
            None => Err(ProviderError::NotFound(format!("run {}", run_id))),
            Some(run) if run.is_terminal() => Err(ProviderError::AlreadyTerminal(run_id)),
            Some(run) => {
                run.status = RunStatus::Completed;
                run.conclusion = Some(RunConclusion::Cancelled);
                Ok(())
            }
        })
    }

    async fn get_run_log(
        &self,
        target: &RunTarget<'_>,
        run_id: RunId,
    ) -> Result<String, ProviderError> {
        self.enter(Op::GetRunLog, target.token)?;
        Ok(self.with(|s| s.logs.get(&run_id).cloned().unwrap_or_default()))
    }

    async fn list_repositories(
        &self,
        token: &str,
        limit: usize,
    ) -> Result<Vec<RepositorySummary>, ProviderError> {
        self.enter(Op::ListRepos, token)?;
        Ok(self.with(|s| s.repos.iter().rev().take(limit).cloned().collect()))
    }

    async fn create_repository(
        &self,
        token: &str,
        name: &str,
        description: &str,
    ) -> Result<String, ProviderError> {
        self.enter(Op::CreateRepo, token)?;
        self.with(|s| {
            let login = s
                .tokens
                .get(token)
                .cloned()
                .ok_or_else(|| ProviderError::Auth("HTTP 401: Bad credentials".into()))?;
            let full_name = format!("{}/{}", login, name);
            if s.repos.iter().any(|r| r.full_name == full_name) {
                return Err(ProviderError::Rejected(format!(
                    "HTTP 422: name {} already exists on this account",
                    name
                )));
            }
            s.repos.push(RepositorySummary {
                full_name: full_name.clone(),
                private: false,
                description: Some(description.to_string()),
                updated_at: Some(s.now.unwrap_or_else(Utc::now)),
            });
            Ok(full_name)
        })
    }

    async fn push_file(
        &self,
        target: &RunTarget<'_>,
        path: &str,
        content: &str,
        _message: &str,
    ) -> Result<(), ProviderError> {
        self.enter(Op::PushFile, target.token)?;
        self.with(|s| {
            s.files.insert(
                (target.repo.to_string(), path.to_string()),
                content.to_string(),
            )
        });
        Ok(())
    }
}
