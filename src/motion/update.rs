use crate::motion::manager::MotionManager;
use chrono::Local;
use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Spawn the controller update loop on `handle`.
///
/// One iteration refreshes connections, advances calibrations and runs a
/// queued video conversion. A `ConvertVideoStart` wakes the loop early.
/// Iterations run on the blocking pool since a conversion transcodes a full
/// frame and may wait for the tracking pass of that frame.
pub fn spawn_update(
    manager: Arc<MotionManager>,
    cancel: CancellationToken,
    handle: &Handle,
) -> JoinHandle<()> {
    info!(
        "Spawning motion update task at {} Hz",
        manager.settings().update_rate_hz
    );
    handle.spawn(async move {
        run_update_loop(manager, cancel).await;
        info!("Motion update task finished");
    })
}

async fn run_update_loop(manager: Arc<MotionManager>, cancel: CancellationToken) {
    let period = manager.update_period();
    let mut ticks: u64 = 0;
    let mut conversions = manager.conversions_completed();
    let mut last_stats_time = Local::now();
    let stats_interval = chrono::Duration::seconds(30);

    loop {
        let started = Instant::now();
        let tick = Arc::clone(&manager);
        if let Err(e) = tokio::task::spawn_blocking(move || tick.update_tick()).await {
            error!("Motion update tick failed: {}", e);
            break;
        }
        ticks += 1;

        let now = Local::now();
        if now - last_stats_time > stats_interval {
            let completed = manager.conversions_completed();
            let elapsed_seconds = (now - last_stats_time).num_seconds().max(1);
            info!(
                "Motion stats: {} updates, {} conversions in {} seconds ({:.2} updates/sec)",
                ticks,
                completed.saturating_sub(conversions),
                elapsed_seconds,
                ticks as f64 / elapsed_seconds as f64
            );
            ticks = 0;
            conversions = completed;
            last_stats_time = now;
        }

        let wait = period.saturating_sub(started.elapsed());
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Motion update loop cancelled");
                break;
            }
            _ = manager.woken() => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }
}
