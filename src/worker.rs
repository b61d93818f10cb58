use crate::core::{PendingError, Result};
use crate::reconciler::{PassStatus, Reconciler};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{Level, event};

/// Background task running reconciler passes at a fixed interval.
pub struct ReconcileWorker {
    passes: watch::Receiver<u64>,
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl ReconcileWorker {
    /// Number of passes that ran to completion so far.
    pub fn completed_passes(&self) -> u64 {
        *self.passes.borrow()
    }

    /// Receiver notified after every completed pass.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.passes.clone()
    }

    /// Signals the worker to stop and waits for the current pass to finish.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }

        if let Some(join_handle) = self.join_handle.take() {
            join_handle
                .await
                .map_err(|err| PendingError::Worker(format!("reconcile worker join: {}", err)))?;
        }
        Ok(())
    }
}

impl Drop for ReconcileWorker {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

/// Spawns a task that calls [`Reconciler::run_pass`] every `interval`.
pub fn spawn_reconcile_worker(
    reconciler: Arc<Reconciler>,
    interval: Duration,
) -> Result<ReconcileWorker> {
    if interval.is_zero() {
        return Err(PendingError::InvalidConfig(
            "reconcile interval must be > 0".to_string(),
        ));
    }

    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let (passes_tx, passes) = watch::channel(0_u64);

    let join_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut stop_rx => {
                    break;
                }
                _ = sleep(interval) => {
                    match reconciler.run_pass().await {
                        Ok(PassStatus::Completed) => {
                            passes_tx.send_modify(|count| *count += 1);
                        }
                        Ok(PassStatus::AlreadyRunning) => {}
                        Err(err) => {
                            event!(Level::ERROR, error = %err, "reconciler pass failed");
                        }
                    }
                }
            }
        }
        event!(Level::DEBUG, "reconcile worker stopped");
    });

    Ok(ReconcileWorker {
        passes,
        stop_tx: Some(stop_tx),
        join_handle: Some(join_handle),
    })
}
