use anyhow::{Context, Result};
use console::style;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::CliFlags;
use crate::core::config::KeeperConfig;
use crate::core::lifecycle::{LifecycleManager, ReconcilerTask};
use crate::core::provider::{
    GitHubProvider, GitHubProviderOptions, RetryPolicy, RetryingProvider, WorkflowProvider,
};
use crate::core::reconciler::Reconciler;
use crate::core::store::StateStore;
use crate::core::terminal::{print_link, print_status, print_step};
use crate::core::vault::{CredentialVault, process_secret};
use crate::interfaces::web::ApiServer;
use crate::interfaces::web::auth::is_loopback_host;
use crate::platform::{NativePlatform, Platform};

/// Apply `--api-host/--api-port/--token` on top of `config.toml`.
pub(crate) fn apply_overrides(config: &mut KeeperConfig, flags: &CliFlags) {
    if let Some(host) = &flags.api_host {
        config.api.host = host.clone();
    }
    if let Some(port) = flags.api_port {
        config.api.port = port;
    }
    if let Some(token) = &flags.token {
        config.api.token = Some(token.clone());
    }
}

/// Foreground daemon: reconciler loop plus the HTTP facade, until Ctrl+C.
pub async fn run_daemon(data_dir: &Path, flags: &CliFlags) -> Result<()> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("cannot create data directory {}", data_dir.display()))?;
    NativePlatform::restrict_dir_permissions(data_dir);

    let mut config = KeeperConfig::load(data_dir).await?;
    apply_overrides(&mut config, flags);
    let log_tx = crate::logging::init(&config.log_level);

    info!("vmkeeper {} starting", env!("CARGO_PKG_VERSION"));
    if !is_loopback_host(&config.api.host) && config.api.token.is_none() {
        warn!(
            "API bound to {} without a token; every request will be rejected",
            config.api.host
        );
    }

    let vault = CredentialVault::new(&process_secret())?;
    let github: Arc<dyn WorkflowProvider> =
        Arc::new(GitHubProvider::new(GitHubProviderOptions::from_config(&config)));
    let provider = Arc::new(RetryingProvider::new(
        github,
        RetryPolicy::from_config(&config.retry),
    ));
    let reconciler = Arc::new(Reconciler::open(
        &config,
        StateStore::in_dir(data_dir),
        vault,
        provider,
    )?);

    let shutdown = CancellationToken::new();
    let mut lifecycle = LifecycleManager::new();
    lifecycle.attach(Arc::new(Mutex::new(ReconcilerTask::new(
        reconciler.clone(),
        shutdown.child_token(),
    ))));
    lifecycle.attach(Arc::new(Mutex::new(ApiServer::new(
        reconciler.clone(),
        log_tx,
        config.api.clone(),
        shutdown.child_token(),
    ))));
    lifecycle.start().await?;

    print_step("vmkeeper is running");
    print_status("Data directory", &data_dir.display().to_string());
    print_status("Workflow", &config.workflow_id);
    print_link(
        "API",
        &format!("http://{}:{}", config.api.host, config.api.port),
    );
    println!(
        "\n  Press {} to stop.\n",
        style("Ctrl+C").bold().yellow()
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    shutdown.cancel();
    lifecycle.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_replace_only_given_values() {
        let mut config = KeeperConfig::default();
        let flags = CliFlags {
            api_port: Some(18001),
            token: Some("s3cret".to_string()),
            ..CliFlags::default()
        };
        apply_overrides(&mut config, &flags);
        assert_eq!(config.api.host, "127.0.0.1");
        assert_eq!(config.api.port, 18001);
        assert_eq!(config.api.token.as_deref(), Some("s3cret"));
    }
}
