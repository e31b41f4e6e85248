use crate::runtime::config::SyncConfig;
use crate::runtime::telemetry::spawn_metrics_reporter;
use crate::sync::engine::SyncEngine;
use anyhow::{anyhow, bail, Result};
use std::sync::Arc;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Drives a [`SyncEngine`] on a background task and handles OS signals for
/// graceful shutdowns.
pub struct Runner {
    engine: Arc<SyncEngine>,
    shutdown: CancellationToken,
    loop_task: Option<JoinHandle<Result<()>>>,
    reporter: Option<JoinHandle<()>>,
}

impl Runner {
    pub fn new(engine: SyncEngine) -> Self {
        Self {
            engine: Arc::new(engine),
            shutdown: CancellationToken::new(),
            loop_task: None,
            reporter: None,
        }
    }

    /// Connects the engine described by `config` and wraps it.
    pub async fn connect(config: SyncConfig) -> Result<Self> {
        Ok(Self::new(SyncEngine::connect(config).await?))
    }

    /// Returns a clone of the root shutdown token so external callers can integrate
    /// with their own signal handlers or cancellation strategies.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn engine(&self) -> Arc<SyncEngine> {
        self.engine.clone()
    }

    pub fn is_running(&self) -> bool {
        self.loop_task.is_some()
    }

    /// Spawns the sync loop and the metrics reporter.
    ///
    /// A runner cannot be restarted once it has stopped, since stopping closes
    /// the engine's database.
    pub fn start(&mut self) -> Result<()> {
        if self.loop_task.is_some() {
            return Ok(());
        }
        if self.engine.database().is_closed() {
            bail!("runner has already stopped; its sync database is closed");
        }
        if self.shutdown.is_cancelled() {
            self.shutdown = CancellationToken::new();
        }

        let engine = self.engine.clone();
        let token = self.shutdown.clone();
        self.loop_task = Some(tokio::spawn(async move { engine.run(token).await }));
        self.reporter = Some(spawn_metrics_reporter(
            self.engine.telemetry(),
            self.shutdown.clone(),
            self.engine.config().metrics_interval(),
        ));
        Ok(())
    }

    /// Cancels the loop and waits for the batch in flight to finish.
    pub async fn stop(&mut self) -> Result<()> {
        self.shutdown.cancel();
        let Some(task) = self.loop_task.take() else {
            return Ok(());
        };
        let joined = task.await;
        self.finish(joined).await
    }

    /// Runs until a Ctrl-C (SIGINT) is received, the shutdown token is
    /// cancelled elsewhere, or the sync loop exits on its own.
    pub async fn run_until_ctrl_c(&mut self) -> Result<()> {
        self.start()?;
        tracing::info!("runner started; waiting for Ctrl-C (SIGINT) to initiate shutdown");

        let Some(mut task) = self.loop_task.take() else {
            return Ok(());
        };

        let joined = tokio::select! {
            _ = signal::ctrl_c() => {
                tracing::info!("Ctrl-C received; shutting down runner");
                None
            }
            _ = self.shutdown.cancelled() => {
                tracing::info!("runner shutdown token cancelled");
                None
            }
            joined = &mut task => {
                tracing::warn!("sync loop exited before shutdown was requested");
                Some(joined)
            }
        };

        self.shutdown.cancel();
        let joined = match joined {
            Some(joined) => joined,
            None => task.await,
        };
        self.finish(joined).await
    }

    async fn finish(
        &mut self,
        joined: std::result::Result<Result<()>, tokio::task::JoinError>,
    ) -> Result<()> {
        self.shutdown.cancel();
        if let Some(reporter) = self.reporter.take() {
            if let Err(err) = reporter.await {
                tracing::warn!(error = %err, "metrics reporter did not shut down cleanly");
            }
        }
        self.engine.database().close().await;

        match joined {
            Ok(result) => result,
            Err(err) => Err(anyhow!("sync loop task failed: {err}")),
        }
    }
}
