//! Context object owning the peripheral singletons and their workers
//!
//! Each hub is independent: it holds its own camera device, controller
//! manager and frame exchange, and spawns the capture, update and tracking
//! workers on the runtime it is given. Dropping the hub cancels them.

use crate::camera::backend::CameraBackend;
use crate::camera::capture::spawn_capture;
use crate::camera::device::CameraDevice;
use crate::camera::frame::FrameExchange;
use crate::guest::{EventQueue, GuestMemory};
use crate::motion::backend::{GamepadInput, InputBackend, InputBackendKind, PointerFeed, SimulatedTrackedDevice};
use crate::motion::manager::MotionManager;
use crate::motion::tracker::{spawn_tracker, HueCentroidSegmenter, HueSegmenter};
use crate::motion::update::spawn_update;
use crate::persistence::{PeripheralSettings, Snapshot};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Host-side collaborators handed to a hub
pub struct HostBindings {
    pub memory: Arc<dyn GuestMemory>,
    pub events: Arc<dyn EventQueue>,
    pub camera: Option<Box<dyn CameraBackend>>,
    pub input: InputBackend,
    pub segmenter: Box<dyn HueSegmenter>,
}

impl HostBindings {
    /// Backends as selected in `settings`
    pub fn from_settings(
        settings: &PeripheralSettings,
        memory: Arc<dyn GuestMemory>,
        events: Arc<dyn EventQueue>,
    ) -> Self {
        let motion = &settings.motion;
        let input = match motion.backend {
            InputBackendKind::Null => InputBackend::Null,
            InputBackendKind::Real => InputBackend::Real(Box::new(SimulatedTrackedDevice::new(
                motion.real_calibration_polls,
            ))),
            InputBackendKind::Gamepad => InputBackend::Gamepad(GamepadInput::spawn(motion.gamepad_deadzone)),
            InputBackendKind::Pointer => InputBackend::Pointer(PointerFeed::new()),
            InputBackendKind::Aiming => InputBackend::Aiming(PointerFeed::new()),
        };
        if !settings.camera.device.is_empty() {
            debug!("Camera device hint: {}", settings.camera.device);
        }
        Self {
            memory,
            events,
            camera: settings.camera.handler.create(),
            input,
            segmenter: Box::new(HueCentroidSegmenter::new(&settings.tracking)),
        }
    }
}

pub struct PeripheralHub {
    settings: PeripheralSettings,
    camera: Arc<CameraDevice>,
    motion: Arc<MotionManager>,
    frames: Arc<FrameExchange>,
    cancel: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl PeripheralHub {
    /// Build the devices and start capture, update and tracking workers on `handle`
    pub fn spawn(settings: PeripheralSettings, bindings: HostBindings, handle: &Handle) -> Self {
        if let Err(e) = settings.validate() {
            warn!("Starting with questionable settings: {}", e);
        }
        info!(
            "Starting peripherals: {:?} camera ({:?}), {:?} controllers",
            settings.camera.model,
            settings.camera.handler,
            bindings.input.kind()
        );

        let cancel = CancellationToken::new();
        let frames = Arc::new(FrameExchange::new());
        let camera = CameraDevice::new(
            settings.camera.model,
            bindings.camera,
            bindings.memory.clone(),
            bindings.events,
            frames.clone(),
            handle.clone(),
        );
        let motion = Arc::new(MotionManager::new(
            settings.motion.clone(),
            settings.tracking.clone(),
            settings.mapping.clone(),
            bindings.input,
            frames.clone(),
            bindings.memory,
            cancel.child_token(),
        ));

        let workers = vec![
            spawn_capture(camera.clone(), cancel.child_token(), handle),
            spawn_update(motion.clone(), cancel.child_token(), handle),
            spawn_tracker(
                motion.clone(),
                frames.clone(),
                bindings.segmenter,
                settings.tracking.clone(),
                cancel.child_token(),
                handle,
            ),
        ];

        Self {
            settings,
            camera,
            motion,
            frames,
            cancel,
            workers,
        }
    }

    pub fn camera(&self) -> &Arc<CameraDevice> {
        &self.camera
    }

    pub fn motion(&self) -> &Arc<MotionManager> {
        &self.motion
    }

    pub fn frames(&self) -> &Arc<FrameExchange> {
        &self.frames
    }

    pub fn settings(&self) -> &PeripheralSettings {
        &self.settings
    }

    /// Emulation pause: the capture worker idles and holds back attach events
    pub fn set_paused(&self, paused: bool) {
        info!("Peripherals {}", if paused { "paused" } else { "resumed" });
        self.camera.set_paused(paused);
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot::capture(&self.camera, &self.motion)
    }

    pub fn restore(&self, snapshot: &Snapshot) {
        snapshot.restore(&self.camera, &self.motion);
    }

    /// Cancel all workers and wait for them to finish
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        for worker in self.workers.drain(..) {
            if let Err(e) = worker.await {
                warn!("Peripheral worker ended abnormally: {}", e);
            }
        }
        info!("Peripherals stopped");
    }
}

impl Drop for PeripheralHub {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
