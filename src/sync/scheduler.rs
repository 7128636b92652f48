use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::manager::{SyncEngine, SyncState};
use crate::state::Connectivity;

/// Messages to control the sync scheduler
#[derive(Debug)]
pub enum SyncSchedulerMessage {
    /// Caller asked for a drain right now
    SyncNow,
    /// App closing
    Shutdown,
}

/// Handle for the background task that triggers drains
pub struct SyncScheduler {
    sender: mpsc::Sender<SyncSchedulerMessage>,
    handle: JoinHandle<()>,
}

impl SyncScheduler {
    /// Ask for a drain. Ignored if one is already queued.
    pub fn sync_now(&self) {
        let _ = self.sender.try_send(SyncSchedulerMessage::SyncNow);
    }

    /// Stop the scheduler and wait for it to finish its current drain
    pub async fn shutdown(self) {
        let _ = self.sender.send(SyncSchedulerMessage::Shutdown).await;
        let _ = self.handle.await;
    }
}

/// Start the sync scheduler.
///
/// Drains the queue whenever the device comes back online, when asked to
/// via [`SyncScheduler::sync_now`], and every `retry_interval` while the last
/// drain left work behind. A drain already pending at startup runs at once
/// if the device is online.
pub fn start_sync_scheduler(
    engine: Arc<SyncEngine>,
    connectivity: Connectivity,
    retry_interval: Option<Duration>,
) -> SyncScheduler {
    let (tx, rx) = mpsc::channel(8);
    let online_rx = connectivity.subscribe();

    let handle = tokio::spawn(async move {
        sync_scheduler_loop(engine, online_rx, rx, retry_interval).await;
    });

    // Initial drain for work left over from a previous run
    let _ = tx.try_send(SyncSchedulerMessage::SyncNow);

    SyncScheduler { sender: tx, handle }
}

async fn run_sync(engine: &SyncEngine, reason: &str) {
    log::info!("Sync scheduler: running drain ({})", reason);
    match engine.sync().await {
        Ok(report) => {
            if let Some(skip) = report.skipped {
                log::debug!("Sync scheduler: drain skipped: {:?}", skip);
            }
        }
        Err(e) => log::error!("Sync scheduler: drain failed: {}", e),
    }
}

/// Main scheduler loop
async fn sync_scheduler_loop(
    engine: Arc<SyncEngine>,
    mut online_rx: watch::Receiver<bool>,
    mut receiver: mpsc::Receiver<SyncSchedulerMessage>,
    retry_interval: Option<Duration>,
) {
    log::info!("Sync scheduler started");
    let mut was_online = *online_rx.borrow_and_update();

    loop {
        let retry_due = async {
            match retry_interval {
                Some(interval) => tokio::time::sleep(interval).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            changed = online_rx.changed() => {
                if changed.is_err() {
                    log::info!("Sync scheduler: connectivity source dropped, shutting down");
                    break;
                }
                let online = *online_rx.borrow_and_update();
                if online && !was_online {
                    run_sync(&engine, "back online").await;
                }
                was_online = online;
            }

            _ = retry_due => {
                let status = engine.status();
                if was_online && (status.status == SyncState::Error || status.pending_changes > 0) {
                    run_sync(&engine, "retry").await;
                }
            }

            msg = receiver.recv() => {
                match msg {
                    Some(SyncSchedulerMessage::SyncNow) => {
                        run_sync(&engine, "requested").await;
                    }
                    Some(SyncSchedulerMessage::Shutdown) | None => {
                        log::info!("Sync scheduler: shutting down");
                        break;
                    }
                }
            }
        }
    }
}
