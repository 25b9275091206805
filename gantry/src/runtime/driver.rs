use std::any::type_name;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::DriverConfig;
use crate::coordinator::Coordinator;
use crate::error::Result;
use crate::job::ExternalJob;
use crate::persistence::PersistenceGateway;

use super::shutdown::ShutdownToken;

/// Calls [`Coordinator::track`] on a fixed interval until shut down.
///
/// A failed pass is logged and the loop keeps going; consistency errors are
/// logged at `error` since they will not clear up by themselves.
pub struct TrackingDriver<G: PersistenceGateway + 'static> {
    coordinator: Arc<Coordinator<G>>,
    config: DriverConfig,
    shutdown_token: ShutdownToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<G: PersistenceGateway + 'static> fmt::Debug for TrackingDriver<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackingDriver")
            .field("config", &self.config)
            .field("gateway_type", &type_name::<G>())
            .field("shutdown_cancelled", &self.shutdown_token.is_cancelled())
            .finish()
    }
}

fn log_pass(result: &Result<Vec<ExternalJob>>) {
    match result {
        Ok(changed) => tracing::debug!(changed = changed.len(), "tracking pass finished"),
        Err(err) if err.is_consistency() => {
            tracing::error!(error = %err, "tracking pass hit a consistency error")
        }
        Err(err) => tracing::warn!(error = %err, "tracking pass failed"),
    }
}

impl<G: PersistenceGateway + 'static> TrackingDriver<G> {
    pub fn new(coordinator: Arc<Coordinator<G>>, config: DriverConfig) -> Self {
        Self {
            coordinator,
            config,
            shutdown_token: ShutdownToken::new(),
            handle: Mutex::new(None),
        }
    }

    pub fn coordinator(&self) -> &Arc<Coordinator<G>> {
        &self.coordinator
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown_token.clone()
    }

    /// Run a single tracking pass in the caller's task.
    pub async fn run_once(&self) -> Result<Vec<ExternalJob>> {
        let result = self.coordinator.track().await;
        log_pass(&result);
        result
    }

    /// Spawn the tracking loop. Calling this while the loop runs is a no-op.
    pub async fn start(&self) {
        let mut guard = self.handle.lock().await;
        if guard.as_ref().is_some_and(|handle| !handle.is_finished()) {
            tracing::warn!("tracking driver already running");
            return;
        }

        let coordinator = Arc::clone(&self.coordinator);
        let interval = Duration::from_millis(self.config.track_interval_ms);
        let shutdown = self.shutdown_token.clone();

        *guard = Some(tokio::spawn(async move {
            tracing::info!(interval_ms = interval.as_millis() as u64, "tracking driver started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("tracking driver shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        log_pass(&coordinator.track().await);
                    }
                }
            }
        }));
    }

    /// Stop the loop, waiting up to `shutdown_grace_ms` for an in-flight pass.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.shutdown_token.cancel();

        let handle = self.handle.lock().await.take();
        let Some(handle) = handle else {
            return Ok(());
        };

        let grace = Duration::from_millis(self.config.shutdown_grace_ms);
        match tokio::time::timeout(grace, handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("tracking task failed: {:?}", e),
            Err(_) => tracing::warn!("tracking task timed out during shutdown"),
        }

        tracing::info!("tracking driver shutdown complete");
        Ok(())
    }
}
