//! Scheduled reconciliation in the background.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};

use super::coordinator::SyncCoordinator;

/// How often and how long reconciliation passes run.
#[derive(Debug, Clone, Copy)]
pub struct ReconcileSchedule {
  pub interval: Duration,
  pub timeout: Duration,
  /// Periodic expired-entry sweep; None leaves expiry to lazy reads
  pub sweep_interval: Option<Duration>,
}

/// Handle to a running reconciliation task.
#[derive(Debug)]
pub struct Reconciler {
  stop_tx: Option<oneshot::Sender<()>>,
  task: JoinHandle<()>,
}

impl Reconciler {
  /// Spawn the loop. The first pass runs immediately.
  pub fn start(coordinator: Arc<SyncCoordinator>, schedule: ReconcileSchedule) -> Self {
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
      let mut passes = tokio::time::interval(schedule.interval);
      passes.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
      let sweep_enabled = schedule.sweep_interval.is_some();
      let mut sweeps =
        tokio::time::interval(schedule.sweep_interval.unwrap_or(Duration::from_secs(3600)));
      sweeps.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

      loop {
        tokio::select! {
          _ = &mut stop_rx => break,
          _ = passes.tick() => {
            match coordinator.perform_initial_sync(schedule.timeout).await {
              Ok(report) => debug!(
                success = report.success,
                synced = report.synced_resources,
                "reconciliation pass done"
              ),
              Err(SyncError::SyncAlreadyInProgress) => {
                debug!("reconciliation pass skipped, another is running");
              }
              Err(error) => warn!(error = %error, "reconciliation pass failed"),
            }
          }
          _ = sweeps.tick(), if sweep_enabled => {
            coordinator.cache().purge_expired();
          }
        }
      }
      info!("reconciler stopped");
    });

    Self {
      stop_tx: Some(stop_tx),
      task,
    }
  }

  /// Signal the loop to stop and wait for it. A pass in flight finishes first.
  pub async fn stop(mut self) -> Result<()> {
    if let Some(stop_tx) = self.stop_tx.take() {
      let _ = stop_tx.send(());
    }
    self
      .task
      .await
      .map_err(|e| SyncError::Config(format!("reconciler task join failed: {}", e)))
  }
}
