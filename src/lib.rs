//! Emulated camera and motion-controller peripherals
//!
//! A [`hub::PeripheralHub`] owns one virtual camera, one controller manager and
//! the workers that feed them. Guest calls go straight to
//! [`camera::CameraDevice`] and [`motion::MotionManager`].

pub mod camera;
pub mod error;
pub mod guest;
pub mod hub;
pub mod mapping;
pub mod motion;
pub mod persistence;

pub use error::{GuestError, GuestResult};
pub use hub::{HostBindings, PeripheralHub};
