//! Orchestration layer for the story harvester
//!
//! This module wires the running system together:
//! 1. Logs in the primary identity and every configured alternate
//! 2. Starts the download workers, the status line and the scheduler
//! 3. Waits for Ctrl-C (or the scheduler giving up)
//! 4. Shuts down in order: scheduler, workers, status, logout
//!
//! On Ctrl-C the workers finish only the fetches already in flight; whatever
//! is still queued is dropped and picked up again on the next run.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::harvest::api::HttpSession;
use crate::harvest::config_loader::{AccountsConfig, AppConfig};
use crate::harvest::download_engine::{DownloadEngine, DownloadError, DownloadStats};
use crate::harvest::identity::{selector_from_config, IdentityPool};
use crate::harvest::queue::work_queue;
use crate::harvest::scheduler::HarvestScheduler;
use crate::harvest::shutdown::shutdown_channel;
use crate::harvest::source::{Session, SourceError};
use crate::harvest::status::StatusReporter;

/// Error types for the orchestration layer
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Login failed for {username}: {source}")]
    Login {
        username: String,
        #[source]
        source: SourceError,
    },

    #[error("Download engine error: {0}")]
    Download(#[from] DownloadError),

    #[error("Status task error: {0}")]
    TaskJoin(String),
}

/// Result type for orchestration operations
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// What a finished run leaves behind
#[derive(Debug, Clone)]
pub struct HarvestSummary {
    pub stats: DownloadStats,
    pub failures: usize,
    pub accounts_tracked: usize,
}

pub struct Orchestrator {
    app_config: AppConfig,
    accounts: AccountsConfig,
}

impl Orchestrator {
    pub fn new(app_config: AppConfig, accounts: AccountsConfig) -> Self {
        Self { app_config, accounts }
    }

    fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.app_config.rate.fetch_timeout_secs)
    }

    /// Log in every configured identity. Any failure is fatal; identities
    /// that already logged in are released before returning the error.
    pub async fn login(&self) -> OrchestratorResult<IdentityPool> {
        let timeout = self.fetch_timeout();
        let primary: Arc<dyn Session> =
            match HttpSession::login(&self.accounts.api, &self.accounts.primary, timeout).await {
                Ok(session) => Arc::new(session),
                Err(source) => {
                    return Err(OrchestratorError::Login {
                        username: self.accounts.primary.username.clone(),
                        source,
                    });
                }
            };

        let mut alternates: Vec<Arc<dyn Session>> = Vec::new();
        for credentials in &self.accounts.alternates {
            if credentials.is_placeholder() {
                warn!("Skipping unconfigured alternate account");
                continue;
            }

            match HttpSession::login(&self.accounts.api, credentials, timeout).await {
                Ok(session) => alternates.push(Arc::new(session)),
                Err(source) => {
                    error!("Alternate login failed, releasing sessions: {}", source);
                    let pool = IdentityPool::new(
                        primary,
                        alternates,
                        selector_from_config(&self.app_config.rate.identity_policy),
                    );
                    logout_all(&pool).await;
                    return Err(OrchestratorError::Login {
                        username: credentials.username.clone(),
                        source,
                    });
                }
            }
        }

        info!(alternates = alternates.len(), "All identities logged in");
        Ok(IdentityPool::new(
            primary,
            alternates,
            selector_from_config(&self.app_config.rate.identity_policy),
        ))
    }

    /// Log in and harvest until Ctrl-C.
    pub async fn run(&self) -> OrchestratorResult<HarvestSummary> {
        let identities = self.login().await?;
        self.run_with(identities, ctrl_c()).await
    }

    /// Harvest with already logged-in identities until `stop` resolves.
    pub async fn run_with<F>(&self, identities: IdentityPool, stop: F) -> OrchestratorResult<HarvestSummary>
    where
        F: Future<Output = ()>,
    {
        let identities = Arc::new(identities);
        let (sender, receiver) = work_queue(self.app_config.pools.queue_capacity);

        let engine = match DownloadEngine::new(
            self.app_config
                .download_engine_config(&self.accounts.api.user_agent),
        ) {
            Ok(engine) => Arc::new(engine),
            Err(e) => {
                logout_all(&identities).await;
                return Err(e.into());
            }
        };
        let (trigger, shutdown) = shutdown_channel();
        let workers = engine.start(receiver.clone(), shutdown.clone());

        let (status_trigger, status_shutdown) = shutdown_channel();
        let status = self.app_config.status.enabled.then(|| {
            StatusReporter::new(
                receiver.clone(),
                Arc::clone(&engine),
                Duration::from_millis(self.app_config.status.refresh_interval_ms),
            )
            .spawn(status_shutdown)
        });
        drop(receiver);

        let scheduler = HarvestScheduler::new(
            self.app_config.scheduler_config(),
            Arc::clone(&identities),
            sender,
            shutdown,
        );

        let scheduler_run = scheduler.run();
        tokio::pin!(scheduler_run);
        tokio::pin!(stop);

        let watermarks = tokio::select! {
            watermarks = &mut scheduler_run => watermarks,
            _ = &mut stop => {
                info!("Shutdown requested, stopping scheduler and workers");
                trigger.trigger();
                scheduler_run.await
            }
        };

        info!("Waiting for download workers");
        workers.drain().await;

        status_trigger.trigger();
        let status_result = match status {
            Some(handle) => handle
                .await
                .map_err(|e| OrchestratorError::TaskJoin(e.to_string())),
            None => Ok(()),
        };

        logout_all(&identities).await;
        status_result?;

        let failures = engine.failures();
        for failure in &failures {
            warn!(
                owner = %failure.owner_handle,
                failed_at = %failure.failed_at,
                attempts = failure.attempts,
                "Unrecovered download {}: {}",
                failure.source_url,
                failure.error
            );
        }

        let stats = engine.stats();
        info!(
            downloaded = stats.downloaded,
            skipped = stats.skipped,
            failed = stats.failed,
            bytes = stats.bytes_downloaded,
            "Harvest finished"
        );

        Ok(HarvestSummary {
            stats,
            failures: failures.len(),
            accounts_tracked: watermarks.len(),
        })
    }
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Unable to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Log out every identity; errors are logged and otherwise ignored.
pub async fn logout_all(identities: &IdentityPool) {
    for session in identities.all() {
        if let Err(e) = session.logout().await {
            warn!("Logout failed for {}: {}", session.handle(), e);
        }
    }
}
