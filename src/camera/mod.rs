pub mod backend;
pub mod capture;
pub mod device;
pub mod frame;
pub mod types;

pub use backend::{CameraBackend, CameraHandler, PatternCamera, PatternControl, PatternSphere};
pub use device::{CameraDevice, CameraInfo, ReadResult};
pub use frame::{FrameDescriptor, FrameExchange};
pub use types::{CameraAttribute, CameraEvent, CameraFormat, CameraModel, CameraResolution, ReadMode};
