pub(crate) mod auth;
mod handlers;
mod router;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{
    extract::State,
    response::sse::{Event, Sse},
};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::Stream;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::config::ApiConfig;
use crate::core::lifecycle::LifecycleComponent;
use crate::core::reconciler::Reconciler;

pub use router::build_api_router;

/// How long in-flight requests get to finish once shutdown starts.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// JSON facade over the reconciler for dashboards, bots and the `vmkeeper` CLI.
pub struct ApiServer {
    reconciler: Arc<Reconciler>,
    log_tx: tokio::sync::broadcast::Sender<String>,
    api: ApiConfig,
    shutdown: CancellationToken,
    shutdown_grace: Duration,
    local_addr: Option<SocketAddr>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) reconciler: Arc<Reconciler>,
    pub(crate) log_tx: tokio::sync::broadcast::Sender<String>,
    pub(crate) api_host: String,
    pub(crate) api_port: u16,
    pub(crate) api_token: Option<String>,
}

impl ApiServer {
    pub fn new(
        reconciler: Arc<Reconciler>,
        log_tx: tokio::sync::broadcast::Sender<String>,
        api: ApiConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            reconciler,
            log_tx,
            api,
            shutdown,
            shutdown_grace: SHUTDOWN_GRACE,
            local_addr: None,
            handle: None,
        }
    }

    /// Address the server is listening on, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

// --- SSE Logs (used by router) ---

async fn sse_logs_endpoint(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.log_tx.subscribe();
    let stream = BroadcastStream::new(receiver).map(|msg| match msg {
        Ok(log) => Ok(Event::default().data(log)),
        Err(_) => Ok(Event::default().data("Log stream lagged")),
    });

    Sse::new(stream)
}

#[async_trait]
impl LifecycleComponent for ApiServer {
    async fn on_init(&mut self) -> Result<()> {
        info!("API Server Interface initializing...");
        Ok(())
    }

    async fn on_start(&mut self) -> Result<()> {
        let addr = format!("{}:{}", self.api.host, self.api.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind API server on {}", addr))?;
        let bound = listener.local_addr()?;
        self.local_addr = Some(bound);

        let state = AppState {
            reconciler: self.reconciler.clone(),
            log_tx: self.log_tx.clone(),
            api_host: self.api.host.clone(),
            api_port: self.api.port,
            api_token: self.api.token.clone(),
        };
        let app = router::build_api_router(state);
        let shutdown = self.shutdown.clone();

        info!("API Server running at http://{bound}");
        self.handle = Some(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
            {
                tracing::error!("API Server crashed: {}", e);
            }
        }));
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        info!("API Server Interface shutting down...");
        self.shutdown.cancel();
        if let Some(mut handle) = self.handle.take() {
            // Open SSE streams never end on their own
            if tokio::time::timeout(self.shutdown_grace, &mut handle)
                .await
                .is_err()
            {
                warn!(
                    "API Server did not drain within {}s, aborting",
                    self.shutdown_grace.as_secs()
                );
                handle.abort();
            }
        }
        Ok(())
    }
}
