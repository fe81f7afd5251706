//! Host input backends for the motion controllers
//!
//! The manager talks to exactly one [`InputBackend`] at a time. Every variant
//! answers the same four questions: which host devices are connected, which
//! host buttons they hold, where their pointer is, and how hard they should
//! rumble. The real tracked device additionally exposes sensors and the
//! calibration handshake through [`TrackedDevice`].

use crate::motion::types::HOST_PAD_PORTS;
use gilrs::{Axis, Button, Event, Gilrs};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Which host input class drives the controllers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum InputBackendKind {
    #[default]
    Null,
    /// Physical tracked controller with its own sensors
    Real,
    /// Any gamepad gilrs can see
    Gamepad,
    /// Host mouse pointer
    Pointer,
    /// Light-gun style aiming device
    Aiming,
}

impl InputBackendKind {
    /// Pad-class backends occupy host pad ports in reverse order
    pub fn is_pad_class(self) -> bool {
        matches!(self, InputBackendKind::Real | InputBackendKind::Gamepad)
    }

    /// Host device index serving controller `slot`
    pub fn device_for_slot(self, slot: usize) -> usize {
        if self.is_pad_class() {
            HOST_PAD_PORTS - 1 - slot
        } else {
            slot
        }
    }
}

/// Host-side buttons any backend can report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HostButton {
    A,
    B,
    X,
    Y,
    Start,
    Select,
    LeftBumper,
    RightBumper,
    LeftTrigger,
    RightTrigger,
    LeftStick,
    RightStick,
    DPadUp,
    DPadDown,
    DPadLeft,
    DPadRight,
    Guide,
    MouseLeft,
    MouseRight,
    MouseMiddle,
    Mouse4,
    Mouse5,
    /// Buttons of the real controller, reported under their own names
    Move,
    Triangle,
    Circle,
    Cross,
    Square,
    T,
}

/// Snapshot of one host device's buttons
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PadInput {
    pub pressed: BTreeSet<HostButton>,
    /// Analog trigger in [0, 1]
    pub trigger: f32,
    /// Left stick in [-1, 1], y up
    pub stick: (f32, f32),
}

/// Raw pointer position in backend units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PointerPosition {
    pub x: i32,
    pub y: i32,
    pub max_x: i32,
    pub max_y: i32,
}

/// Sensor pass-through from a real controller
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SensorReading {
    /// Orientation quaternion (x, y, z, w)
    pub orientation: [f32; 4],
    /// Acceleration in g
    pub accel: [f32; 3],
    /// Angular velocity in rad/s
    pub gyro: [f32; 3],
    pub temperature: f32,
}

/// Physical motion controller driver
pub trait TrackedDevice: Send {
    fn name(&self) -> &str;

    /// Host port indices with a controller present
    fn connected(&mut self) -> Vec<usize>;

    fn buttons(&self, device: usize) -> Option<PadInput>;

    fn sensors(&self, device: usize) -> Option<SensorReading>;

    fn set_sphere_color(&mut self, device: usize, rgb: (f32, f32, f32));

    fn set_rumble(&mut self, device: usize, intensity: u8);

    /// Ask the device to run its own calibration
    fn request_calibration(&mut self, device: usize);

    /// Whether the last requested calibration finished successfully
    fn calibration_succeeded(&self, device: usize) -> bool;
}

/// The active host input backend
pub enum InputBackend {
    Null,
    Real(Box<dyn TrackedDevice>),
    Gamepad(GamepadInput),
    Pointer(PointerFeed),
    Aiming(PointerFeed),
}

impl std::fmt::Debug for InputBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InputBackend::Real(device) => write!(f, "Real({})", device.name()),
            other => write!(f, "{:?}", other.kind()),
        }
    }
}

impl InputBackend {
    pub fn kind(&self) -> InputBackendKind {
        match self {
            InputBackend::Null => InputBackendKind::Null,
            InputBackend::Real(_) => InputBackendKind::Real,
            InputBackend::Gamepad(_) => InputBackendKind::Gamepad,
            InputBackend::Pointer(_) => InputBackendKind::Pointer,
            InputBackend::Aiming(_) => InputBackendKind::Aiming,
        }
    }

    /// Host device indices currently connected
    pub fn update_connections(&mut self) -> Vec<usize> {
        match self {
            InputBackend::Null => Vec::new(),
            InputBackend::Real(device) => device.connected(),
            InputBackend::Gamepad(pads) => pads.connected(),
            InputBackend::Pointer(feed) | InputBackend::Aiming(feed) => feed.connected(),
        }
    }

    pub fn get_buttons(&self, device: usize) -> Option<PadInput> {
        match self {
            InputBackend::Null => None,
            InputBackend::Real(d) => d.buttons(device),
            InputBackend::Gamepad(pads) => pads.buttons(device),
            InputBackend::Pointer(feed) | InputBackend::Aiming(feed) => feed.buttons(device),
        }
    }

    pub fn get_position(&self, device: usize) -> Option<PointerPosition> {
        match self {
            InputBackend::Null | InputBackend::Real(_) => None,
            InputBackend::Gamepad(pads) => pads.position(device),
            InputBackend::Pointer(feed) | InputBackend::Aiming(feed) => feed.position(device),
        }
    }

    pub fn set_rumble(&mut self, device: usize, intensity: u8) {
        let kind = self.kind();
        match self {
            InputBackend::Real(d) => d.set_rumble(device, intensity),
            _ => debug!("Rumble {} on device {} ignored by {:?}", intensity, device, kind),
        }
    }

    pub fn sensors(&self, device: usize) -> Option<SensorReading> {
        match self {
            InputBackend::Real(d) => d.sensors(device),
            _ => None,
        }
    }

    pub fn tracked(&mut self) -> Option<&mut dyn TrackedDevice> {
        match self {
            InputBackend::Real(d) => Some(d.as_mut()),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Gamepad fallback
// ---------------------------------------------------------------------------

/// Range gamepad sticks are reported in as pointer positions
pub const STICK_EXTENT: i32 = 255;

#[derive(Debug, Clone, Default)]
struct PadSnapshot {
    name: String,
    input: PadInput,
}

/// Generic gamepads through gilrs, polled on a dedicated thread
#[derive(Debug)]
pub struct GamepadInput {
    pads: Arc<Mutex<Vec<PadSnapshot>>>,
    stop: Arc<AtomicBool>,
    poller: Option<JoinHandle<()>>,
}

impl GamepadInput {
    pub fn spawn(deadzone: f32) -> Self {
        let pads = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));
        let thread_pads = Arc::clone(&pads);
        let thread_stop = Arc::clone(&stop);

        info!("Spawning gamepad poller (deadzone {})", deadzone);
        let poller = std::thread::Builder::new()
            .name("gamepad-poller".to_string())
            .spawn(move || poll_gamepads(thread_pads, thread_stop, deadzone))
            .map_err(|e| error!("Failed to spawn gamepad poller: {}", e))
            .ok();

        Self { pads, stop, poller }
    }

    fn connected(&self) -> Vec<usize> {
        let count = self.pads.lock().map(|p| p.len()).unwrap_or(0);
        (0..count.min(HOST_PAD_PORTS))
            .map(|i| HOST_PAD_PORTS - 1 - i)
            .collect()
    }

    fn snapshot(&self, device: usize) -> Option<PadSnapshot> {
        let index = (HOST_PAD_PORTS - 1).checked_sub(device)?;
        self.pads.lock().ok()?.get(index).cloned()
    }

    fn buttons(&self, device: usize) -> Option<PadInput> {
        self.snapshot(device).map(|s| s.input)
    }

    fn position(&self, device: usize) -> Option<PointerPosition> {
        let snapshot = self.snapshot(device)?;
        let (sx, sy) = snapshot.input.stick;
        let scale = |v: f32| ((v + 1.0) * 0.5 * STICK_EXTENT as f32).round() as i32;
        Some(PointerPosition {
            x: scale(sx),
            y: scale(-sy),
            max_x: STICK_EXTENT,
            max_y: STICK_EXTENT,
        })
    }
}

impl Drop for GamepadInput {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(poller) = self.poller.take() {
            if poller.join().is_err() {
                warn!("Gamepad poller panicked");
            }
        }
    }
}

fn poll_gamepads(pads: Arc<Mutex<Vec<PadSnapshot>>>, stop: Arc<AtomicBool>, deadzone: f32) {
    let mut gilrs = match Gilrs::new() {
        Ok(g) => {
            info!("Successfully initialized gilrs");
            g
        }
        Err(e) => {
            warn!("Failed to initialize gilrs, gamepad backend stays empty: {}", e);
            return;
        }
    };

    while !stop.load(Ordering::SeqCst) {
        while let Some(Event { id, event, .. }) = gilrs.next_event() {
            debug!("Gamepad {:?}: {:?}", id, event);
        }

        let snapshots: Vec<PadSnapshot> = gilrs
            .gamepads()
            .filter(|(_, pad)| pad.is_connected())
            .take(HOST_PAD_PORTS)
            .map(|(_, pad)| {
                let pressed = GILRS_BUTTONS
                    .iter()
                    .filter(|b| pad.is_pressed(**b))
                    .filter_map(|b| map_button(*b))
                    .collect();
                let trigger = pad
                    .button_data(Button::RightTrigger2)
                    .map(|d| d.value())
                    .unwrap_or(0.0);
                PadSnapshot {
                    name: pad.name().to_string(),
                    input: PadInput {
                        pressed,
                        trigger,
                        stick: (
                            apply_deadzone(pad.value(Axis::LeftStickX), deadzone),
                            apply_deadzone(pad.value(Axis::LeftStickY), deadzone),
                        ),
                    },
                }
            })
            .collect();

        if let Ok(mut shared) = pads.lock() {
            if shared.len() != snapshots.len() {
                let names: Vec<&str> = snapshots.iter().map(|s| s.name.as_str()).collect();
                info!("Gamepads connected: {} {:?}", snapshots.len(), names);
            }
            *shared = snapshots;
        }
        std::thread::sleep(Duration::from_millis(4));
    }
    debug!("Gamepad poller stopped");
}

const GILRS_BUTTONS: [Button; 17] = [
    Button::South,
    Button::East,
    Button::West,
    Button::North,
    Button::Start,
    Button::Select,
    Button::LeftTrigger,
    Button::RightTrigger,
    Button::LeftTrigger2,
    Button::RightTrigger2,
    Button::LeftThumb,
    Button::RightThumb,
    Button::DPadUp,
    Button::DPadDown,
    Button::DPadLeft,
    Button::DPadRight,
    Button::Mode,
];

fn map_button(button: Button) -> Option<HostButton> {
    match button {
        Button::South => Some(HostButton::A),
        Button::East => Some(HostButton::B),
        Button::West => Some(HostButton::Y),
        Button::North => Some(HostButton::X),
        Button::Start => Some(HostButton::Start),
        Button::Select => Some(HostButton::Select),
        Button::LeftTrigger => Some(HostButton::LeftBumper),
        Button::RightTrigger => Some(HostButton::RightBumper),
        Button::LeftTrigger2 => Some(HostButton::LeftTrigger),
        Button::RightTrigger2 => Some(HostButton::RightTrigger),
        Button::LeftThumb => Some(HostButton::LeftStick),
        Button::RightThumb => Some(HostButton::RightStick),
        Button::DPadUp => Some(HostButton::DPadUp),
        Button::DPadDown => Some(HostButton::DPadDown),
        Button::DPadLeft => Some(HostButton::DPadLeft),
        Button::DPadRight => Some(HostButton::DPadRight),
        Button::Mode => Some(HostButton::Guide),
        _ => None,
    }
}

/// Zero out small stick values and rescale the rest to the full range
pub fn apply_deadzone(value: f32, deadzone: f32) -> f32 {
    if value.abs() < deadzone {
        0.0
    } else {
        let sign = if value < 0.0 { -1.0 } else { 1.0 };
        sign * (value.abs() - deadzone) / (1.0 - deadzone)
    }
}

// ---------------------------------------------------------------------------
// Pointer / aiming devices
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
struct PointerDevice {
    position: PointerPosition,
    pressed: BTreeSet<HostButton>,
}

/// Pointer state fed by the host window; cloning shares the state
#[derive(Debug, Clone, Default)]
pub struct PointerFeed {
    devices: Arc<Mutex<BTreeMap<usize, PointerDevice>>>,
}

impl PointerFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `device` visible with a pointer range of `max_x` x `max_y`
    pub fn connect(&self, device: usize, max_x: i32, max_y: i32) {
        if let Ok(mut devices) = self.devices.lock() {
            let entry = devices.entry(device).or_default();
            entry.position.max_x = max_x;
            entry.position.max_y = max_y;
            info!("Pointer device {} connected ({}x{})", device, max_x, max_y);
        }
    }

    pub fn disconnect(&self, device: usize) {
        if let Ok(mut devices) = self.devices.lock() {
            if devices.remove(&device).is_some() {
                info!("Pointer device {} disconnected", device);
            }
        }
    }

    pub fn move_to(&self, device: usize, x: i32, y: i32) {
        if let Ok(mut devices) = self.devices.lock() {
            if let Some(entry) = devices.get_mut(&device) {
                entry.position.x = x.clamp(0, entry.position.max_x);
                entry.position.y = y.clamp(0, entry.position.max_y);
            }
        }
    }

    pub fn set_button(&self, device: usize, button: HostButton, pressed: bool) {
        if let Ok(mut devices) = self.devices.lock() {
            if let Some(entry) = devices.get_mut(&device) {
                if pressed {
                    entry.pressed.insert(button);
                } else {
                    entry.pressed.remove(&button);
                }
            }
        }
    }

    fn connected(&self) -> Vec<usize> {
        self.devices
            .lock()
            .map(|d| d.keys().copied().collect())
            .unwrap_or_default()
    }

    fn buttons(&self, device: usize) -> Option<PadInput> {
        let devices = self.devices.lock().ok()?;
        let entry = devices.get(&device)?;
        let trigger = if entry.pressed.contains(&HostButton::MouseRight) {
            1.0
        } else {
            0.0
        };
        Some(PadInput {
            pressed: entry.pressed.clone(),
            trigger,
            stick: (0.0, 0.0),
        })
    }

    fn position(&self, device: usize) -> Option<PointerPosition> {
        self.devices.lock().ok()?.get(&device).map(|d| d.position)
    }
}

// ---------------------------------------------------------------------------
// Simulated tracked device
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
struct SimulatedController {
    input: PadInput,
    sensors: SensorReading,
    color: (f32, f32, f32),
    rumble: u8,
    calibration_polls: Option<u32>,
}

/// In-process stand-in for a physical tracked controller. Calibration
/// requests succeed after a configurable number of connection polls.
#[derive(Debug, Clone)]
pub struct SimulatedTrackedDevice {
    controllers: Arc<Mutex<BTreeMap<usize, SimulatedController>>>,
    calibration_polls: u32,
}

impl SimulatedTrackedDevice {
    pub fn new(calibration_polls: u32) -> Self {
        Self {
            controllers: Arc::new(Mutex::new(BTreeMap::new())),
            calibration_polls,
        }
    }

    pub fn plug(&self, device: usize) {
        if let Ok(mut c) = self.controllers.lock() {
            c.entry(device).or_insert_with(|| SimulatedController {
                sensors: SensorReading {
                    orientation: [0.0, 0.0, 0.0, 1.0],
                    accel: [0.0, 1.0, 0.0],
                    ..SensorReading::default()
                },
                ..SimulatedController::default()
            });
        }
    }

    pub fn unplug(&self, device: usize) {
        if let Ok(mut c) = self.controllers.lock() {
            c.remove(&device);
        }
    }

    pub fn press(&self, device: usize, button: HostButton, pressed: bool) {
        if let Ok(mut c) = self.controllers.lock() {
            if let Some(ctrl) = c.get_mut(&device) {
                if pressed {
                    ctrl.input.pressed.insert(button);
                } else {
                    ctrl.input.pressed.remove(&button);
                }
            }
        }
    }

    pub fn sphere_color(&self, device: usize) -> Option<(f32, f32, f32)> {
        self.controllers.lock().ok()?.get(&device).map(|c| c.color)
    }

    pub fn rumble(&self, device: usize) -> Option<u8> {
        self.controllers.lock().ok()?.get(&device).map(|c| c.rumble)
    }

    /// Whether a calibration was requested on `device` since it was plugged
    pub fn calibration_requested(&self, device: usize) -> bool {
        self.controllers
            .lock()
            .ok()
            .and_then(|c| c.get(&device).map(|ctrl| ctrl.calibration_polls.is_some()))
            .unwrap_or(false)
    }
}

impl TrackedDevice for SimulatedTrackedDevice {
    fn name(&self) -> &str {
        "simulated"
    }

    fn connected(&mut self) -> Vec<usize> {
        let Ok(mut c) = self.controllers.lock() else {
            return Vec::new();
        };
        for ctrl in c.values_mut() {
            if let Some(polls) = ctrl.calibration_polls.as_mut() {
                *polls = polls.saturating_sub(1);
            }
        }
        c.keys().copied().collect()
    }

    fn buttons(&self, device: usize) -> Option<PadInput> {
        self.controllers.lock().ok()?.get(&device).map(|c| c.input.clone())
    }

    fn sensors(&self, device: usize) -> Option<SensorReading> {
        self.controllers.lock().ok()?.get(&device).map(|c| c.sensors)
    }

    fn set_sphere_color(&mut self, device: usize, rgb: (f32, f32, f32)) {
        if let Ok(mut c) = self.controllers.lock() {
            if let Some(ctrl) = c.get_mut(&device) {
                ctrl.color = rgb;
            }
        }
    }

    fn set_rumble(&mut self, device: usize, intensity: u8) {
        if let Ok(mut c) = self.controllers.lock() {
            if let Some(ctrl) = c.get_mut(&device) {
                ctrl.rumble = intensity;
            }
        }
    }

    fn request_calibration(&mut self, device: usize) {
        let polls = self.calibration_polls;
        if let Ok(mut c) = self.controllers.lock() {
            if let Some(ctrl) = c.get_mut(&device) {
                ctrl.calibration_polls = Some(polls);
            }
        }
    }

    fn calibration_succeeded(&self, device: usize) -> bool {
        self.controllers
            .lock()
            .ok()
            .and_then(|c| c.get(&device).and_then(|ctrl| ctrl.calibration_polls))
            == Some(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pad_class_maps_slots_in_reverse() {
        assert_eq!(InputBackendKind::Real.device_for_slot(0), 6);
        assert_eq!(InputBackendKind::Gamepad.device_for_slot(3), 3);
        assert_eq!(InputBackendKind::Pointer.device_for_slot(0), 0);
        assert_eq!(InputBackendKind::Aiming.device_for_slot(2), 2);
    }

    #[test]
    fn deadzone_rescales() {
        assert_eq!(apply_deadzone(0.05, 0.1), 0.0);
        assert!((apply_deadzone(0.55, 0.1) - 0.5).abs() < 1e-6);
        assert!((apply_deadzone(-1.0, 0.1) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn pointer_feed_clamps_and_reports() {
        let feed = PointerFeed::new();
        let mut backend = InputBackend::Pointer(feed.clone());
        assert!(backend.update_connections().is_empty());

        feed.connect(0, 800, 600);
        feed.move_to(0, 900, -5);
        feed.set_button(0, HostButton::MouseLeft, true);

        assert_eq!(backend.update_connections(), vec![0]);
        let pos = backend.get_position(0).unwrap();
        assert_eq!((pos.x, pos.y), (800, 0));
        assert!(backend
            .get_buttons(0)
            .unwrap()
            .pressed
            .contains(&HostButton::MouseLeft));
        assert!(backend.get_position(1).is_none());
    }

    #[test]
    fn simulated_calibration_needs_polls() {
        let mut device = SimulatedTrackedDevice::new(2);
        device.plug(6);
        device.request_calibration(6);
        assert!(!device.calibration_succeeded(6));
        device.connected();
        device.connected();
        assert!(device.calibration_succeeded(6));
    }
}
