
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use super::{Reconciler, RunPhase};
use crate::core::config::{KeeperConfig, SessionPatternConfig};
use crate::core::provider::mock::MockProvider;
use crate::core::provider::{RetryPolicy, RetryingProvider, WorkflowProvider};
use crate::core::store::StateStore;
use crate::core::vault::CredentialVault;

pub(super) const TOKEN: &str = "ghp_keeper_test";
pub(super) const LOGIN: &str = "octocat";
pub(super) const REPO: &str = "octocat/vm";

pub(super) fn test_config() -> KeeperConfig {
    KeeperConfig {
        stall_timeout_secs: 300,
        degraded_threshold: 3,
        session: SessionPatternConfig {
            scheme: "wss".to_string(),
            host: "tunnel.example".to_string(),
            path_prefix: "/".to_string(),
            allow_bare_host: false,
        },
        ..KeeperConfig::default()
    }
}

pub(super) fn open(dir: &Path, mock: &Arc<MockProvider>) -> Reconciler {
    open_with(dir, mock.clone())
}

fn open_with(dir: &Path, provider: Arc<dyn WorkflowProvider>) -> Reconciler {
    Reconciler::open(
        &test_config(),
        StateStore::in_dir(dir),
        CredentialVault::new("test-secret").unwrap(),
        provider,
    )
    .unwrap()
}

pub(super) struct Harness {
    pub dir: TempDir,
    pub mock: Arc<MockProvider>,
    pub keeper: Reconciler,
}

impl Harness {
    /// Fresh keeper with nothing configured.
    pub fn empty() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockProvider::new());
        mock.accept_token(TOKEN, LOGIN);
        let keeper = open(dir.path(), &mock);
        Self { dir, mock, keeper }
    }

    /// Like [`Harness::empty`], but provider calls go through a retry layer with no
    /// backoff.
    pub fn with_retries(max_attempts: u32) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockProvider::new());
        mock.accept_token(TOKEN, LOGIN);
        let policy = RetryPolicy {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        };
        let keeper = open_with(
            dir.path(),
            Arc::new(RetryingProvider::new(mock.clone(), policy)),
        );
        Self { dir, mock, keeper }
    }

    /// Keeper with an active account and repository, still `Idle`.
    pub async fn configured() -> Self {
        let h = Self::empty();
        h.keeper.add_account(TOKEN).await.unwrap();
        h.keeper.select_repository(REPO).await.unwrap();
        h
    }

    /// Configured keeper that has ticked once and tracks a queued run.
    pub async fn running() -> Self {
        let h = Self::configured().await;
        h.keeper.tick().await;
        assert_eq!(h.phase(), RunPhase::Running);
        h
    }

    pub fn phase(&self) -> RunPhase {
        self.keeper.get_status().run_state
    }

    pub fn active_run(&self) -> u64 {
        self.keeper.get_status().active_run_id.unwrap()
    }

    /// Simulate a process restart on the same data directory.
    pub fn reopen(self) -> Self {
        let Harness { dir, mock, keeper } = self;
        drop(keeper);
        let keeper = open(dir.path(), &mock);
        Self { dir, mock, keeper }
    }

    pub async fn tick_after(&self, secs: i64) {
        let at: DateTime<Utc> = Utc::now() + chrono::Duration::seconds(secs);
        self.keeper.tick_at(at).await;
    }
}
