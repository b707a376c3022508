//! Retry policy for provider calls.
//!
//! `RateLimited` and `Network` failures are retried with exponential backoff
//! (capped, with +/-25% jitter); every other error propagates on the first attempt.
//! Repository creation is never retried: a lost response would turn the retry into
//! a name conflict.

use async_trait::async_trait;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use super::{
    DispatchInputs, Identity, ProviderError, RepositorySummary, RunId, RunTarget,
    WorkflowProvider, WorkflowRun,
};
use crate::core::config::RetryConfig;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`, capped at
    /// `max_delay`, then jittered by +/-25%.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;
        let raw_ms = base_ms
            .saturating_mul(2u64.saturating_pow(attempt))
            .min(max_ms);
        let jitter_range = raw_ms / 4;
        let jitter = if jitter_range > 0 {
            let offset = rand::thread_rng().gen_range(0..=jitter_range * 2);
            offset as i64 - jitter_range as i64
        } else {
            0
        };
        Duration::from_millis((raw_ms as i64 + jitter).max(0) as u64)
    }

    /// A provider-supplied retry-after wins over the computed backoff, still capped.
    fn delay_for(&self, attempt: u32, err: &ProviderError) -> Duration {
        let backoff = self.backoff_delay(attempt);
        match err {
            ProviderError::RateLimited {
                retry_after: Some(after),
            } => (*after).max(backoff).min(self.max_delay),
            _ => backoff,
        }
    }

    pub async fn run<T, F, Fut>(&self, op: &str, mut call: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt + 1 < self.max_attempts => {
                    let delay = self.delay_for(attempt, &err);
                    warn!(
                        "Provider call {} failed (attempt {}/{}): {}; retrying in {:?}",
                        op,
                        attempt + 1,
                        self.max_attempts,
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Decorates any [`WorkflowProvider`] with a [`RetryPolicy`].
pub struct RetryingProvider {
    inner: Arc<dyn WorkflowProvider>,
    policy: RetryPolicy,
}

impl RetryingProvider {
    pub fn new(inner: Arc<dyn WorkflowProvider>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl WorkflowProvider for RetryingProvider {
    async fn validate_token(&self, token: &str) -> Result<Identity, ProviderError> {
        let inner = &self.inner;
        self.policy
            .run("validate_token", move || inner.validate_token(token))
            .await
    }

    async fn dispatch_run(
        &self,
        target: &RunTarget<'_>,
        workflow_id: &str,
        inputs: &DispatchInputs,
    ) -> Result<RunId, ProviderError> {
        let inner = &self.inner;
        self.policy
            .run("dispatch_run", move || {
                inner.dispatch_run(target, workflow_id, inputs)
            })
            .await
    }

    async fn list_runs(
        &self,
        target: &RunTarget<'_>,
        workflow_id: &str,
        limit: usize,
    ) -> Result<Vec<WorkflowRun>, ProviderError> {
        let inner = &self.inner;
        self.policy
            .run("list_runs", move || inner.list_runs(target, workflow_id, limit))
            .await
    }

    async fn get_run(
        &self,
        target: &RunTarget<'_>,
        run_id: RunId,
    ) -> Result<WorkflowRun, ProviderError> {
        let inner = &self.inner;
        self.policy
            .run("get_run", move || inner.get_run(target, run_id))
            .await
    }

    async fn cancel_run(&self, target: &RunTarget<'_>, run_id: RunId) -> Result<(), ProviderError> {
        let inner = &self.inner;
        self.policy
            .run("cancel_run", move || inner.cancel_run(target, run_id))
            .await
    }

    async fn get_run_log(
        &self,
        target: &RunTarget<'_>,
        run_id: RunId,
    ) -> Result<String, ProviderError> {
        let inner = &self.inner;
        self.policy
            .run("get_run_log", move || inner.get_run_log(target, run_id))
            .await
    }

    async fn list_repositories(
        &self,
        token: &str,
        limit: usize,
    ) -> Result<Vec<RepositorySummary>, ProviderError> {
        let inner = &self.inner;
        self.policy
            .run("list_repositories", move || inner.list_repositories(token, limit))
            .await
    }

    async fn create_repository(
        &self,
        token: &str,
        name: &str,
        description: &str,
    ) -> Result<String, ProviderError> {
        self.inner.create_repository(token, name, description).await
    }

    async fn push_file(
        &self,
        target: &RunTarget<'_>,
        path: &str,
        content: &str,
        message: &str,
    ) -> Result<(), ProviderError> {
        let inner = &self.inner;
        self.policy
            .run("push_file", move || {
                inner.push_file(target, path, content, message)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::provider::mock::{MockProvider, Op};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    const TARGET: RunTarget<'static> = RunTarget {
        token: "tok",
        repo: "octo/vm",
    };

    #[test]
    fn backoff_grows_exponentially_within_jitter() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
        };
        for _ in 0..20 {
            let d0 = policy.backoff_delay(0).as_millis();
            let d2 = policy.backoff_delay(2).as_millis();
            assert!((750..=1250).contains(&d0), "attempt 0: {}", d0);
            assert!((3000..=5000).contains(&d2), "attempt 2: {}", d2);
        }
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(4000),
        };
        for _ in 0..20 {
            assert!(policy.backoff_delay(30).as_millis() <= 5000);
        }
    }

    #[test]
    fn retry_after_is_honored_but_capped() {
        let policy = fast_policy(3);
        let err = ProviderError::RateLimited {
            retry_after: Some(Duration::from_secs(60)),
        };
        assert_eq!(policy.delay_for(0, &err), Duration::from_millis(5));
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let mock = Arc::new(MockProvider::new());
        let run = mock.add_run(crate::core::provider::RunStatus::InProgress);
        mock.fail_next(Op::GetRun, ProviderError::Network("reset".into()));
        mock.fail_next(
            Op::GetRun,
            ProviderError::RateLimited { retry_after: None },
        );
        let provider = RetryingProvider::new(mock.clone(), fast_policy(4));

        let fetched = provider.get_run(&TARGET, run).await.unwrap();
        assert_eq!(fetched.id, run);
        assert_eq!(mock.calls(Op::GetRun), 3);
    }

    #[tokio::test]
    async fn retry_budget_is_bounded() {
        let mock = Arc::new(MockProvider::new());
        for _ in 0..5 {
            mock.fail_next(Op::ListRuns, ProviderError::Network("down".into()));
        }
        let provider = RetryingProvider::new(mock.clone(), fast_policy(3));

        let res = provider.list_runs(&TARGET, "vm-worker.yml", 5).await;
        assert!(matches!(res, Err(ProviderError::Network(_))));
        assert_eq!(mock.calls(Op::ListRuns), 3);
    }

    #[tokio::test]
    async fn auth_and_not_found_are_not_retried() {
        let mock = Arc::new(MockProvider::new());
        mock.fail_next(Op::GetRun, ProviderError::Auth("401".into()));
        mock.fail_next(Op::CancelRun, ProviderError::NotFound("run".into()));
        let provider = RetryingProvider::new(mock.clone(), fast_policy(4));

        assert!(matches!(
            provider.get_run(&TARGET, 1).await,
            Err(ProviderError::Auth(_))
        ));
        assert!(matches!(
            provider.cancel_run(&TARGET, 1).await,
            Err(ProviderError::NotFound(_))
        ));
        assert_eq!(mock.calls(Op::GetRun), 1);
        assert_eq!(mock.calls(Op::CancelRun), 1);
    }

    #[tokio::test]
    async fn repository_creation_is_attempted_once() {
        let mock = Arc::new(MockProvider::new());
        mock.accept_token("tok", "octo");
        mock.fail_next(Op::CreateRepo, ProviderError::Network("reset".into()));
        mock.fail_next(Op::PushFile, ProviderError::Network("reset".into()));
        let provider = RetryingProvider::new(mock.clone(), fast_policy(3));

        assert!(matches!(
            provider.create_repository("tok", "vm", "desc").await,
            Err(ProviderError::Network(_))
        ));
        assert_eq!(mock.calls(Op::CreateRepo), 1);

        provider
            .push_file(&TARGET, ".github/workflows/vm-worker.yml", "on: push", "msg")
            .await
            .unwrap();
        assert_eq!(mock.calls(Op::PushFile), 2);
    }
}
