//! Input fusion layer
//!
//! Stateless functions that turn whatever the active host backend reports into
//! the uniform controller state the guest sees: remapped buttons in
//! [`buttons`], image/world coordinates and orientation in [`position`].

pub mod buttons;
pub mod position;

pub use buttons::{map_buttons, Binding, ButtonMap, MappingSettings};
pub use position::{FusedPose, PoseParams};

use thiserror::Error;

/// Errors raised while validating remap tables
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MappingError {
    #[error("mapping '{0}' has no bindings")]
    Empty(String),

    #[error("mapping '{name}' binds host button {host} twice")]
    DuplicateHost { name: String, host: String },
}
