//! Periodic age-based deletion of expired rows.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::Store;

const TICK_PERIOD: Duration = Duration::from_secs(3600);

/// Hourly cleaner deleting rows older than the retention horizon. One
/// catch-up pass runs at spawn to cover downtime.
pub struct RetentionCleaner {
    shutdown_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RetentionCleaner {
    /// Spawn the cleanup loop. Returns `None` when retention is disabled
    /// (`retention_days <= 0`).
    pub fn spawn(store: Arc<Store>, retention_days: i64) -> Option<Self> {
        if retention_days <= 0 {
            return None;
        }
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            tracing::info!(retention_days, "retention cleaner started");
            run_pass(&store, retention_days).await;

            let mut tick = tokio::time::interval(TICK_PERIOD);
            tick.tick().await; // the immediate tick; the catch-up pass just ran
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = tick.tick() => run_pass(&store, retention_days).await,
                }
            }
            tracing::info!("retention cleaner stopped");
        });

        Some(Self {
            shutdown_tx,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Signal the loop and wait for it to finish. Idempotent.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self
            .handle
            .lock()
            .expect("retention handle mutex poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn run_pass(store: &Store, retention_days: i64) {
    let cutoff = Utc::now() - chrono::Duration::days(retention_days);
    match store.delete_older_than(cutoff).await {
        Ok(deleted) if deleted > 0 => {
            tracing::info!(deleted, %cutoff, "retention removed expired logs");
        }
        Ok(_) => {}
        Err(e) => tracing::error!(error = %e, "retention cleanup failed"),
    }
}
