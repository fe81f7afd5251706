use crate::camera::device::CameraDevice;
use chrono::Local;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Spawn the capture loop on `handle`. It runs until `cancel` fires.
///
/// Each tick pulls and encodes a frame, so it runs on the blocking pool.
pub fn spawn_capture(
    device: Arc<CameraDevice>,
    cancel: CancellationToken,
    handle: &Handle,
) -> JoinHandle<()> {
    info!("Spawning camera capture task");
    handle.spawn(async move {
        run_capture_loop(device, cancel).await;
        info!("Camera capture task finished");
    })
}

async fn run_capture_loop(device: Arc<CameraDevice>, cancel: CancellationToken) {
    let mut ticks: u64 = 0;
    let mut last_frame = 0u64;
    let mut last_stats_time = Local::now();
    let stats_interval = chrono::Duration::seconds(30);

    loop {
        let tick = Arc::clone(&device);
        let wait = match tokio::task::spawn_blocking(move || tick.capture_tick()).await {
            Ok(wait) => wait,
            Err(e) => {
                error!("Capture tick failed: {}", e);
                break;
            }
        };
        ticks += 1;

        let now = Local::now();
        if now - last_stats_time > stats_interval {
            let frame = device.with_state(|s| s.frame_number).unwrap_or(0);
            let delivered = frame.saturating_sub(last_frame);
            let elapsed_seconds = (now - last_stats_time).num_seconds().max(1);
            info!(
                "Capture stats: {} ticks, {} frames in {} seconds ({:.2} fps)",
                ticks,
                delivered,
                elapsed_seconds,
                delivered as f64 / elapsed_seconds as f64
            );
            ticks = 0;
            last_frame = frame;
            last_stats_time = now;
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Capture loop cancelled");
                break;
            }
            _ = tokio::time::sleep(wait) => {}
        }
    }
}
