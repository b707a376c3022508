use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, USER_AGENT};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::core::config::KeeperConfig;

use super::{
    DispatchInputs, Identity, ProviderError, RepositorySummary, RunConclusion, RunId, RunStatus,
    RunTarget, WorkflowProvider, WorkflowRun,
};

// ── GitHub REST payloads ──

#[derive(Deserialize)]
struct UserResponse {
    login: String,
}

#[derive(Deserialize)]
struct RunsResponse {
    workflow_runs: Vec<RunPayload>,
}

#[derive(Deserialize)]
struct RunPayload {
    id: RunId,
    run_number: u64,
    status: Option<String>,
    conclusion: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<RunPayload> for WorkflowRun {
    fn from(p: RunPayload) -> Self {
        WorkflowRun {
            id: p.id,
            number: p.run_number,
            status: RunStatus::from_status(p.status.as_deref().unwrap_or("queued")),
            conclusion: p.conclusion.as_deref().map(RunConclusion::from_conclusion),
            created_at: p.created_at,
        }
    }
}

#[derive(Deserialize)]
struct JobsResponse {
    jobs: Vec<JobPayload>,
}

#[derive(Deserialize)]
struct JobPayload {
    id: u64,
}

#[derive(Deserialize)]
struct RepositoryPayload {
    full_name: String,
    #[serde(default)]
    private: bool,
    description: Option<String>,
    updated_at: Option<DateTime<Utc>>,
}

impl From<RepositoryPayload> for RepositorySummary {
    fn from(p: RepositoryPayload) -> Self {
        RepositorySummary {
            full_name: p.full_name,
            private: p.private,
            description: p.description,
            updated_at: p.updated_at,
        }
    }
}

#[derive(Deserialize)]
struct CreatedRepository {
    full_name: String,
}

#[derive(Deserialize)]
struct ContentPayload {
    sha: String,
}

/// Tunables for [`GitHubProvider`]; built from the keeper config.
#[derive(Debug, Clone)]
pub struct GitHubProviderOptions {
    pub base_url: String,
    pub git_ref: String,
    pub request_timeout: Duration,
    pub log_timeout: Duration,
    pub settle_delay: Duration,
    pub lookup_attempts: u32,
}

impl GitHubProviderOptions {
    pub fn from_config(config: &KeeperConfig) -> Self {
        Self {
            base_url: config.api_base_url.clone(),
            git_ref: config.git_ref.clone(),
            request_timeout: config.request_timeout(),
            log_timeout: config.log_timeout(),
            settle_delay: Duration::from_millis(config.dispatch.settle_delay_ms),
            lookup_attempts: config.dispatch.lookup_attempts,
        }
    }
}

// ── GitHub Actions provider ──

pub struct GitHubProvider {
    options: GitHubProviderOptions,
    client: Client,
}

/// Runs created this long before our dispatch are still considered ours (clock skew).
const DISPATCH_SKEW_SECS: i64 = 10;

impl GitHubProvider {
    pub fn new(options: GitHubProviderOptions) -> Self {
        Self {
            options,
            client: Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.options.base_url.trim_end_matches('/'), path)
    }

    fn request(&self, builder: RequestBuilder, token: &str, timeout: Duration) -> RequestBuilder {
        builder
            .header(AUTHORIZATION, format!("Bearer {}", token))
            .header(ACCEPT, "application/vnd.github+json")
            .header(USER_AGENT, "vmkeeper")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .timeout(timeout)
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, ProviderError> {
        let res = builder.send().await.map_err(transport_error)?;
        if res.status().is_success() {
            Ok(res)
        } else {
            Err(error_from_response(res).await)
        }
    }

    async fn find_dispatched_run(
        &self,
        target: &RunTarget<'_>,
        workflow_id: &str,
        dispatched_at: DateTime<Utc>,
    ) -> Result<RunId, ProviderError> {
        let not_before = dispatched_at - chrono::Duration::seconds(DISPATCH_SKEW_SECS);
        for attempt in 0..self.options.lookup_attempts {
            tokio::time::sleep(self.options.settle_delay).await;
            match self.list_runs(target, workflow_id, 5).await {
                Ok(runs) => {
                    if let Some(run) = runs
                        .iter()
                        .find(|r| !r.is_terminal() && r.created_at >= not_before)
                    {
                        return Ok(run.id);
                    }
                    debug!(
                        "Dispatched run not visible yet on {} (attempt {})",
                        target.repo,
                        attempt + 1
                    );
                }
                Err(e) => warn!("Run lookup after dispatch failed: {}", e),
            }
        }
        Err(ProviderError::RunNotVisible)
    }
}

fn transport_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Network(format!("request timed out: {}", e))
    } else if e.is_decode() {
        ProviderError::InvalidResponse(e.to_string())
    } else {
        ProviderError::Network(e.to_string())
    }
}

async fn error_from_response(res: Response) -> ProviderError {
    let status = res.status();
    let headers = res.headers().clone();
    let body = res.text().await.unwrap_or_default();
    classify_status(status, &headers, &body)
}

/// Map a non-success HTTP response onto the provider error taxonomy.
pub(crate) fn classify_status(status: StatusCode, headers: &HeaderMap, body: &str) -> ProviderError {
    let detail = format!("HTTP {}: {}", status.as_u16(), truncate(body, 200));
    match status.as_u16() {
        429 => ProviderError::RateLimited {
            retry_after: retry_after(headers),
        },
        // GitHub signals primary rate limits as 403 with an exhausted quota.
        403 if header_str(headers, "x-ratelimit-remaining") == Some("0") => {
            ProviderError::RateLimited {
                retry_after: retry_after(headers),
            }
        }
        401 | 403 => ProviderError::Auth(detail),
        404 | 410 | 422 => ProviderError::NotFound(detail),
        408 => ProviderError::Network(detail),
        s if s >= 500 => ProviderError::Network(detail),
        _ => ProviderError::InvalidResponse(detail),
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    if let Some(secs) = header_str(headers, "retry-after").and_then(|v| v.trim().parse().ok()) {
        return Some(Duration::from_secs(secs));
    }
    let reset: i64 = header_str(headers, "x-ratelimit-reset")?.trim().parse().ok()?;
    let wait = reset - Utc::now().timestamp();
    Some(Duration::from_secs(wait.max(0) as u64))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[async_trait]
impl WorkflowProvider for GitHubProvider {
    async fn validate_token(&self, token: &str) -> Result<Identity, ProviderError> {
        let req = self.request(
            self.client.get(self.url("/user")),
            token,
            self.options.request_timeout,
        );
        let user: UserResponse = self
            .send(req)
            .await?
            .json()
            .await
            .map_err(transport_error)?;
        Ok(Identity { login: user.login })
    }

    async fn dispatch_run(
        &self,
        target: &RunTarget<'_>,
        workflow_id: &str,
        inputs: &DispatchInputs,
    ) -> Result<RunId, ProviderError> {
        let mut body = serde_json::json!({ "ref": self.options.git_ref });
        if !inputs.is_empty() {
            body["inputs"] = serde_json::json!(inputs);
        }
        let path = format!(
            "/repos/{}/actions/workflows/{}/dispatches",
            target.repo, workflow_id
        );
        let dispatched_at = Utc::now();
        let req = self.request(
            self.client.post(self.url(&path)).json(&body),
            target.token,
            self.options.request_timeout,
        );
        self.send(req).await?;
        debug!("Dispatched {} on {}", workflow_id, target.repo);

        self.find_dispatched_run(target, workflow_id, dispatched_at)
            .await
    }

    async fn list_runs(
        &self,
        target: &RunTarget<'_>,
        workflow_id: &str,
        limit: usize,
    ) -> Result<Vec<WorkflowRun>, ProviderError> {
        let path = format!(
            "/repos/{}/actions/workflows/{}/runs",
            target.repo, workflow_id
        );
        let per_page = limit.clamp(1, 100).to_string();
        let req = self.request(
            self.client
                .get(self.url(&path))
                .query(&[("per_page", per_page.as_str())]),
            target.token,
            self.options.request_timeout,
        );
        let parsed: RunsResponse = self
            .send(req)
            .await?
            .json()
            .await
            .map_err(transport_error)?;
        let mut runs: Vec<WorkflowRun> = parsed.workflow_runs.into_iter().map(Into::into).collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        runs.truncate(limit);
        Ok(runs)
    }

    async fn get_run(
        &self,
        target: &RunTarget<'_>,
        run_id: RunId,
    ) -> Result<WorkflowRun, ProviderError> {
        let path = format!("/repos/{}/actions/runs/{}", target.repo, run_id);
        let req = self.request(
            self.client.get(self.url(&path)),
            target.token,
            self.options.request_timeout,
        );
        let run: RunPayload = self
            .send(req)
            .await?
            .json()
            .await
            .map_err(transport_error)?;
        Ok(run.into())
    }

    async fn cancel_run(&self, target: &RunTarget<'_>, run_id: RunId) -> Result<(), ProviderError> {
        let path = format!("/repos/{}/actions/runs/{}/cancel", target.repo, run_id);
        let req = self.request(
            self.client.post(self.url(&path)),
            target.token,
            self.options.request_timeout,
        );
        let res = req.send().await.map_err(transport_error)?;
        match res.status() {
            s if s.is_success() => Ok(()),
            // 409: "Cannot cancel a workflow run that is completed."
            StatusCode::CONFLICT => Err(ProviderError::AlreadyTerminal(run_id)),
            _ => Err(error_from_response(res).await),
        }
    }

    async fn get_run_log(
        &self,
        target: &RunTarget<'_>,
        run_id: RunId,
    ) -> Result<String, ProviderError> {
        let path = format!(
            "/repos/{}/actions/runs/{}/jobs?per_page=100",
            target.repo, run_id
        );
        let req = self.request(
            self.client.get(self.url(&path)),
            target.token,
            self.options.request_timeout,
        );
        let parsed: JobsResponse = self
            .send(req)
            .await?
            .json()
            .await
            .map_err(transport_error)?;

        let mut job_ids: Vec<u64> = parsed.jobs.into_iter().map(|j| j.id).collect();
        job_ids.sort_unstable();

        let mut log = String::new();
        for job_id in job_ids {
            let path = format!("/repos/{}/actions/jobs/{}/logs", target.repo, job_id);
            let req = self.request(
                self.client.get(self.url(&path)),
                target.token,
                self.options.log_timeout,
            );
            match self.send(req).await {
                Ok(res) => {
                    let text = res.text().await.map_err(transport_error)?;
                    // The last job's tail is left as-is: it may still be mid-write.
                    if !log.is_empty() && !log.ends_with('\n') {
                        log.push('\n');
                    }
                    log.push_str(&text);
                }
                // Job logs are published lazily; a missing log contributes nothing yet.
                Err(ProviderError::NotFound(_)) => {
                    debug!("Log for job {} of run {} not available yet", job_id, run_id)
                }
                Err(e) => return Err(e),
            }
        }
        Ok(log)
    }

    async fn list_repositories(
        &self,
        token: &str,
        limit: usize,
    ) -> Result<Vec<RepositorySummary>, ProviderError> {
        let per_page = limit.clamp(1, 100).to_string();
        let req = self.request(
            self.client.get(self.url("/user/repos")).query(&[
                ("affiliation", "owner"),
                ("sort", "updated"),
                ("per_page", per_page.as_str()),
            ]),
            token,
            self.options.request_timeout,
        );
        let parsed: Vec<RepositoryPayload> = self
            .send(req)
            .await?
            .json()
            .await
            .map_err(transport_error)?;
        let mut repos: Vec<RepositorySummary> = parsed.into_iter().map(Into::into).collect();
        repos.truncate(limit);
        Ok(repos)
    }

    async fn create_repository(
        &self,
        token: &str,
        name: &str,
        description: &str,
    ) -> Result<String, ProviderError> {
        let body = serde_json::json!({
            "name": name,
            "description": description,
            "private": false,
            "auto_init": true,
        });
        let req = self.request(
            self.client.post(self.url("/user/repos")).json(&body),
            token,
            self.options.request_timeout,
        );
        let res = req.send().await.map_err(transport_error)?;
        match res.status() {
            s if s.is_success() => {
                let created: CreatedRepository = res.json().await.map_err(transport_error)?;
                debug!("Created repository {}", created.full_name);
                Ok(created.full_name)
            }
            // 422: "name already exists on this account"
            StatusCode::UNPROCESSABLE_ENTITY => {
                let body = res.text().await.unwrap_or_default();
                Err(ProviderError::Rejected(format!(
                    "HTTP 422: {}",
                    truncate(&body, 200)
                )))
            }
            _ => Err(error_from_response(res).await),
        }
    }

    async fn push_file(
        &self,
        target: &RunTarget<'_>,
        path: &str,
        content: &str,
        message: &str,
    ) -> Result<(), ProviderError> {
        let url = self.url(&format!("/repos/{}/contents/{}", target.repo, path));
        let git_ref = self.options.git_ref.as_str();

        // Replacing an existing file requires its current blob sha
        let lookup = self.request(
            self.client.get(&url).query(&[("ref", git_ref)]),
            target.token,
            self.options.request_timeout,
        );
        let sha = match self.send(lookup).await {
            Ok(res) => {
                let existing: ContentPayload = res.json().await.map_err(transport_error)?;
                Some(existing.sha)
            }
            Err(ProviderError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };

        let mut body = serde_json::json!({
            "message": message,
            "content": base64::engine::general_purpose::STANDARD.encode(content),
            "branch": git_ref,
        });
        if let Some(sha) = sha {
            body["sha"] = serde_json::json!(sha);
        }
        let req = self.request(
            self.client.put(&url).json(&body),
            target.token,
            self.options.request_timeout,
        );
        self.send(req).await?;
        debug!("Pushed {} to {}", path, target.repo);
        Ok(())
    }
}
