//! Motion controller subsystem
//!
//! [`manager::MotionManager`] holds per-controller state and serves the guest
//! calls. Two workers run next to it: [`update`] for connections, calibration
//! and video conversion, and [`tracker`] for sphere segmentation on camera frames.

pub mod backend;
pub mod convert;
pub mod manager;
pub mod tracker;
pub mod types;
pub mod update;

pub use backend::{
    GamepadInput, HostButton, InputBackend, InputBackendKind, PointerFeed, SimulatedTrackedDevice,
    TrackedDevice,
};
pub use convert::{ConvertAttributes, OutputFormat};
pub use manager::{ConvertPhase, MotionManager};
pub use tracker::{HueCentroidSegmenter, HueSegmenter};
pub use types::{ControllerStatus, GemState, ImageState, InertialState};
