//! Motion controller vocabulary: per-controller state, guest-visible result
//! records, hue handling and the logical button set.

use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Controllers the subsystem can manage at once
pub const MAX_CONTROLLERS: usize = 4;

/// Host pad ports a controller slot can map onto
pub const HOST_PAD_PORTS: usize = 7;

/// Hue sentinel: stop tracking this controller
pub const DONT_TRACK_HUE: u32 = 2 << 24;
/// Hue sentinel: pick a hue automatically
pub const DONT_CARE_HUE: u32 = 4 << 24;
/// Hue sentinel: keep whatever is assigned
pub const DONT_CHANGE_HUE: u32 = 8 << 24;

/// Hues handed out by automatic assignment, per controller slot
pub const DEFAULT_HUES: [u32; MAX_CONTROLLERS] = [240, 120, 0, 300];

pub const CALIBRATION_OCCURRED: u64 = 1 << 0;
pub const CALIBRATION_SUCCEEDED: u64 = 1 << 1;

/// Physical sphere radius used for distance and world-scale estimates
pub const SPHERE_RADIUS_MM: f32 = 22.5;

/// Fully saturated, full value HSV colour for `hue` degrees
pub fn hue_to_rgb(hue: f32) -> (f32, f32, f32) {
    let h = hue.rem_euclid(360.0) / 60.0;
    let x = 1.0 - (h % 2.0 - 1.0).abs();
    match h as u32 {
        0 => (1.0, x, 0.0),
        1 => (x, 1.0, 0.0),
        2 => (0.0, 1.0, x),
        3 => (0.0, x, 1.0),
        4 => (x, 0.0, 1.0),
        _ => (1.0, 0.0, x),
    }
}

/// Hue in degrees plus saturation and value of an RGB colour in [0,1]
pub fn rgb_to_hsv(r: f32, g: f32, b: f32) -> (f32, f32, f32) {
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;
    let hue = if delta <= f32::EPSILON {
        0.0
    } else if max == r {
        60.0 * ((g - b) / delta).rem_euclid(6.0)
    } else if max == g {
        60.0 * ((b - r) / delta + 2.0)
    } else {
        60.0 * ((r - g) / delta + 4.0)
    };
    let saturation = if max <= f32::EPSILON { 0.0 } else { delta / max };
    (hue, saturation, max)
}

/// Logical controller buttons in guest bit order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GemButton {
    Select,
    T,
    Move,
    Start,
    Triangle,
    Circle,
    Cross,
    Square,
}

impl GemButton {
    pub const ALL: [GemButton; 8] = [
        GemButton::Select,
        GemButton::T,
        GemButton::Move,
        GemButton::Start,
        GemButton::Triangle,
        GemButton::Circle,
        GemButton::Cross,
        GemButton::Square,
    ];

    pub fn bit(self) -> u16 {
        match self {
            GemButton::Select => 1 << 0,
            GemButton::T => 1 << 1,
            GemButton::Move => 1 << 2,
            GemButton::Start => 1 << 3,
            GemButton::Triangle => 1 << 4,
            GemButton::Circle => 1 << 5,
            GemButton::Cross => 1 << 6,
            GemButton::Square => 1 << 7,
        }
    }
}

/// Status code returned next to state queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ControllerStatus {
    #[default]
    Ok,
    NotConnected,
    SphereNotCalibrated,
    SphereCalibrating,
    HueNotSet,
    NoVideo,
}

impl ControllerStatus {
    pub fn to_guest(self) -> u32 {
        match self {
            ControllerStatus::Ok => 0,
            ControllerStatus::NotConnected => 1,
            ControllerStatus::SphereNotCalibrated => 2,
            ControllerStatus::SphereCalibrating => 3,
            ControllerStatus::HueNotSet => 5,
            ControllerStatus::NoVideo => 6,
        }
    }
}

/// Connection state of one controller slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Ready,
}

/// Configuration-side state of one controller, guarded by the manager lock
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerState {
    pub status: ConnectionStatus,
    /// 1-based host port, 0 while disconnected
    pub port: u32,
    pub ext_status: u32,
    pub ext_id: u32,
    pub calibrated: bool,
    pub calibration_flags: u64,
    pub is_calibrating: bool,
    pub calibration_start: Option<Instant>,
    /// The tracked device confirmed the current calibration request
    pub calibration_confirmed: bool,
    pub enabled_magnetometer: bool,
    pub enabled_tracking: bool,
    pub enabled_led: bool,
    pub hue_set: bool,
    pub hue: u32,
    pub rgb: (f32, f32, f32),
    pub rumble: u8,
}

impl Default for ControllerState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            port: 0,
            ext_status: 0,
            ext_id: 0,
            calibrated: false,
            calibration_flags: 0,
            is_calibrating: false,
            calibration_start: None,
            calibration_confirmed: false,
            enabled_magnetometer: false,
            enabled_tracking: false,
            enabled_led: true,
            hue_set: false,
            hue: 0,
            rgb: (0.0, 0.0, 0.0),
            rumble: 0,
        }
    }
}

impl ControllerState {
    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Ready
    }

    /// Reset everything but the connection owned by the update worker
    pub fn reset_keep_connection(&mut self) {
        let (status, port) = (self.status, self.port);
        *self = ControllerState {
            status,
            port,
            ..ControllerState::default()
        };
    }

    /// Status a state query reports for this controller
    pub fn query_status(&self) -> ControllerStatus {
        if !self.is_connected() {
            ControllerStatus::NotConnected
        } else if self.is_calibrating {
            ControllerStatus::SphereCalibrating
        } else if !self.calibrated {
            ControllerStatus::SphereNotCalibrated
        } else if !self.hue_set {
            ControllerStatus::HueNotSet
        } else {
            ControllerStatus::Ok
        }
    }
}

/// Screen-side tracking result, written by the tracking worker
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TrackedPosition {
    /// Sphere centre in image pixels
    pub x: f32,
    pub y: f32,
    pub radius: f32,
    pub radius_valid: bool,
    /// Estimated camera distance in millimetres
    pub distance: f32,
    /// Camera frame the result was computed from
    pub frame_number: u64,
}

/// Digital and analog pad data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PadData {
    pub digital_buttons: u16,
    pub analog_t: u16,
}

/// External port accessory data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtData {
    pub status: u32,
    pub digital1: u32,
    pub digital2: u32,
    pub analog_right_x: u32,
    pub analog_right_y: u32,
    pub analog_left_x: u32,
    pub analog_left_y: u32,
}

/// Full pose record returned by `GetState`
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GemState {
    /// Position in millimetres relative to the camera, w = 1
    pub pos: [f32; 4],
    pub vel: [f32; 4],
    pub accel: [f32; 4],
    /// Orientation quaternion (x, y, z, w)
    pub quat: [f32; 4],
    pub angvel: [f32; 4],
    pub angaccel: [f32; 4],
    pub handle_pos: [f32; 4],
    pub pad: PadData,
    pub ext: ExtData,
    /// Microseconds since `Init`
    pub timestamp: u64,
    pub temperature: f32,
    pub camera_pitch_angle: f32,
    pub tracking_flags: u32,
}

/// Screen-space record returned by `GetImageState`
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ImageState {
    pub frame_timestamp: u64,
    pub timestamp: u64,
    /// Image coordinates in pixels, may lie just outside the frame
    pub u: f32,
    pub v: f32,
    pub r: f32,
    /// Normalised projection onto the image plane
    pub projection_x: f32,
    pub projection_y: f32,
    pub distance: f32,
    pub visible: bool,
    pub r_valid: bool,
}

/// Sensor record returned by `GetInertialState`
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct InertialState {
    pub accelerometer: [f32; 4],
    pub gyro: [f32; 4],
    pub accelerometer_bias: [f32; 4],
    pub gyro_bias: [f32; 4],
    pub pad: PadData,
    pub ext: ExtData,
    pub timestamp: u64,
    pub counter: u32,
    pub temperature: f32,
}

/// Result of `GetInfo`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GemInfo {
    pub max_connect: u32,
    pub now_connect: u32,
    pub status: [ConnectionStatus; MAX_CONTROLLERS],
    pub port: [u32; MAX_CONTROLLERS],
}

/// Which instant a state query is about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateFlag {
    CurrentTime,
    LatestImageTime,
    FutureAdjusted,
}

impl StateFlag {
    pub fn from_guest(value: u32) -> Option<Self> {
        match value {
            0 => Some(StateFlag::CurrentTime),
            1 => Some(StateFlag::LatestImageTime),
            2 => Some(StateFlag::FutureAdjusted),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_hues_map_to_primaries() {
        assert_eq!(hue_to_rgb(0.0), (1.0, 0.0, 0.0));
        assert_eq!(hue_to_rgb(120.0), (0.0, 1.0, 0.0));
        assert_eq!(hue_to_rgb(240.0), (0.0, 0.0, 1.0));
        assert_eq!(hue_to_rgb(300.0), (1.0, 0.0, 1.0));
        assert_eq!(hue_to_rgb(360.0), (1.0, 0.0, 0.0));
    }

    #[test]
    fn hsv_recovers_hue() {
        for hue in [0.0f32, 45.0, 120.0, 200.0, 240.0, 330.0] {
            let (r, g, b) = hue_to_rgb(hue);
            let (h, s, v) = rgb_to_hsv(r, g, b);
            assert!((h - hue).abs() < 0.01, "{} vs {}", h, hue);
            assert_eq!((s, v), (1.0, 1.0));
        }
    }

    #[test]
    fn status_precedence() {
        let mut state = ControllerState::default();
        assert_eq!(state.query_status(), ControllerStatus::NotConnected);
        state.status = ConnectionStatus::Ready;
        assert_eq!(state.query_status(), ControllerStatus::SphereNotCalibrated);
        state.is_calibrating = true;
        assert_eq!(state.query_status(), ControllerStatus::SphereCalibrating);
        state.is_calibrating = false;
        state.calibrated = true;
        assert_eq!(state.query_status(), ControllerStatus::HueNotSet);
        state.hue_set = true;
        assert_eq!(state.query_status(), ControllerStatus::Ok);
    }
}
