use color_eyre::{eyre::eyre, Result};
use eyemotion::camera::types::{CameraFormat, CameraResolution};
use eyemotion::camera::CameraDevice;
use eyemotion::guest::{GuestMemory, HeapMemory, RecordingQueue};
use eyemotion::motion::convert::{ConvertAttributes, OutputFormat, FLAG_DRAW_MARKERS, OUTPUT_ALIGN};
use eyemotion::motion::types::{DONT_CARE_HUE, DONT_TRACK_HUE};
use eyemotion::motion::MotionManager;
use eyemotion::persistence::{self, PeripheralSettings};
use eyemotion::{HostBindings, PeripheralHub};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

const SCRIPT_FRAMES: u32 = 90;
const EVENT_QUEUE: u64 = 1;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let settings_path = persistence::ensure_default().await?;
    let settings = PeripheralSettings::load_from(&settings_path).await?;
    info!("Using settings from {}", settings_path.display());

    let memory = Arc::new(HeapMemory::new());
    let events = Arc::new(RecordingQueue::new());
    let bindings = HostBindings::from_settings(&settings, memory.clone(), events.clone());
    let hub = PeripheralHub::spawn(settings, bindings, &Handle::current());

    let camera = hub.camera().clone();
    let motion = hub.motion().clone();
    let guest_memory: Arc<dyn GuestMemory> = memory.clone();
    let script = tokio::task::spawn_blocking(move || run_guest_script(&camera, &motion, guest_memory.as_ref()));

    tokio::select! {
        res = script => match res {
            Ok(Ok(())) => info!("Guest script finished"),
            Ok(Err(e)) => error!("Guest script failed: {}", e),
            Err(e) => error!("Guest script panicked: {}", e),
        },
        _ = tokio::signal::ctrl_c() => warn!("Interrupted, shutting down"),
    }

    info!(
        "{} events delivered to queue {}",
        events.events_for(EVENT_QUEUE).len(),
        EVENT_QUEUE
    );
    hub.shutdown().await;
    Ok(())
}

/// A short guest session against the running peripherals
fn run_guest_script(camera: &CameraDevice, motion: &MotionManager, memory: &dyn GuestMemory) -> Result<()> {
    let guest = |what: &str, e: eyemotion::GuestError| eyre!("{} failed: {}", what, e);

    camera.initialize().map_err(|e| guest("Camera init", e))?;
    camera
        .subscribe(EVENT_QUEUE, 0x10, u64::MAX)
        .map_err(|e| guest("Event subscribe", e))?;

    let opened = camera.open(
        0,
        CameraFormat::Rgba.to_guest(),
        CameraResolution::Vga.to_guest(),
        30,
    );
    let info = match opened {
        Ok(info) => Some(info),
        Err(e) => {
            warn!("No camera available ({}), continuing with controllers only", e);
            None
        }
    };
    if info.is_some() {
        camera.start(0).map_err(|e| guest("Camera start", e))?;
    }

    motion.init(1).map_err(|e| guest("Controller init", e))?;
    let hues = motion
        .track_hues(&[DONT_CARE_HUE, DONT_TRACK_HUE, DONT_TRACK_HUE, DONT_TRACK_HUE])
        .map_err(|e| guest("Track hues", e))?;
    info!("Controller 0 tracks hue {}", hues[0]);

    std::thread::sleep(motion.update_period() * 2);
    match motion.calibrate(0) {
        Ok(()) => info!("Calibrating controller 0"),
        Err(e) => warn!("Calibration not possible: {}", e),
    }

    let output = match &info {
        Some(info) => {
            let size = OutputFormat::Rgba.output_size(info.stream.width, info.stream.height) as u32;
            let addr = memory
                .alloc(size, OUTPUT_ALIGN)
                .ok_or_else(|| eyre!("Out of guest memory for conversion output"))?;
            motion
                .prepare_video_convert(ConvertAttributes {
                    output_format: OutputFormat::Rgba,
                    flags: FLAG_DRAW_MARKERS,
                    output_addr: addr,
                    ..ConvertAttributes::default()
                })
                .map_err(|e| guest("Prepare video convert", e))?;
            Some(addr)
        }
        None => None,
    };

    let period = Duration::from_millis(33);
    for _ in 0..SCRIPT_FRAMES {
        std::thread::sleep(period);
        let Some(info) = &info else {
            continue;
        };
        let read = match camera.read(0) {
            Ok(read) => read,
            Err(e) => {
                warn!("Read failed: {}", e);
                continue;
            }
        };
        if read.frame_number == 0 {
            continue;
        }
        if output.is_some() && read.frame_number % 30 == 0 {
            let source = info.buffers[read.buffer_index.unwrap_or(0)].addr;
            motion
                .convert_video_start(source)
                .map_err(|e| guest("Convert start", e))?;
            motion
                .convert_video_finish()
                .map_err(|e| guest("Convert finish", e))?;
        }
        if let Some(index) = read.buffer_index {
            camera
                .read_complete(0, index as u32)
                .map_err(|e| guest("Read complete", e))?;
        }
    }

    let (status, state) = motion.get_state(0, 0, 0).map_err(|e| guest("Get state", e))?;
    info!(
        "Controller 0: {:?}, buttons {:#06x}, position {:?}",
        status, state.pad.digital_buttons, state.pos
    );
    if let Ok((_, color)) = motion.get_environment_lighting_color() {
        info!("Environment lighting {:?}", color);
    }

    if info.is_some() {
        camera.stop(0).map_err(|e| guest("Camera stop", e))?;
        camera.close(0).map_err(|e| guest("Camera close", e))?;
    }
    if let Some(addr) = output {
        memory.free(addr);
    }
    motion.end().map_err(|e| guest("Controller end", e))?;
    camera.shutdown().map_err(|e| guest("Camera shutdown", e))?;
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
