//! Pointer/tracker position to image, world and orientation

use crate::motion::backend::PointerPosition;
use crate::motion::types::SPHERE_RADIUS_MM;
use serde::{Deserialize, Serialize};

/// Focal length in pixels at 640 px image width
pub const FOCAL_LENGTH_PX: f32 = 554.0;

/// Knobs for pose synthesis, part of the `[motion]` settings
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq)]
#[serde(default)]
pub struct PoseParams {
    /// Maximum synthesized yaw/pitch in degrees
    pub cone_angle_deg: f32,
    /// Sphere radius in pixels (at 640 px width) reported for untracked backends
    pub virtual_radius_px: f32,
    /// Report border positions just outside the image
    pub push_border: bool,
}

impl Default for PoseParams {
    fn default() -> Self {
        Self {
            cone_angle_deg: 30.0,
            virtual_radius_px: 20.0,
            push_border: true,
        }
    }
}

/// Everything the fusion layer derives for one controller
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FusedPose {
    /// Image coordinates in pixels
    pub u: f32,
    pub v: f32,
    pub radius: f32,
    /// Camera-relative position in millimetres, w = 1
    pub world: [f32; 4],
    /// Orientation quaternion (x, y, z, w)
    pub quat: [f32; 4],
    pub distance: f32,
    pub valid: bool,
}

/// Map one pointer axis onto `extent` image pixels
fn axis_to_image(value: i32, max: i32, extent: u32, push_border: bool) -> f32 {
    if max <= 0 {
        return extent as f32 / 2.0;
    }
    if push_border {
        if value <= 0 {
            return -1.0;
        }
        if value >= max {
            return extent as f32;
        }
    }
    value.clamp(0, max) as f32 * extent as f32 / max as f32
}

/// Raw pointer to image pixel coordinates
pub fn pointer_to_image(pos: &PointerPosition, width: u32, height: u32, push_border: bool) -> (f32, f32) {
    (
        axis_to_image(pos.x, pos.max_x, width, push_border),
        axis_to_image(pos.y, pos.max_y, height, push_border),
    )
}

/// Pointer deflection in [-1, 1] from the centre, y up
pub fn pointer_deflection(pos: &PointerPosition) -> (f32, f32) {
    let norm = |v: i32, max: i32| {
        if max <= 0 {
            0.0
        } else {
            (2.0 * v as f32 / max as f32 - 1.0).clamp(-1.0, 1.0)
        }
    };
    (norm(pos.x, pos.max_x), -norm(pos.y, pos.max_y))
}

/// Validity heuristic for untracked backends: a pointer pinned to the extent
/// has left the window.
pub fn pointer_in_bounds(pos: &PointerPosition) -> bool {
    pos.x > 0 && pos.y > 0 && pos.x < pos.max_x && pos.y < pos.max_y
}

/// Camera distance of a sphere seen with `radius` pixels
pub fn distance_from_radius(radius: f32, width: u32) -> f32 {
    if radius <= 0.0 {
        return 0.0;
    }
    let focal = FOCAL_LENGTH_PX * width as f32 / 640.0;
    focal * SPHERE_RADIUS_MM / radius
}

/// Centered world coordinates, scaled by the px/mm factor the sphere radius implies
pub fn image_to_world(u: f32, v: f32, radius: f32, width: u32, height: u32) -> [f32; 4] {
    if radius <= 0.0 {
        return [0.0, 0.0, 0.0, 1.0];
    }
    let px_per_mm = radius / SPHERE_RADIUS_MM;
    [
        (u - width as f32 / 2.0) / px_per_mm,
        (height as f32 / 2.0 - v) / px_per_mm,
        distance_from_radius(radius, width),
        1.0,
    ]
}

/// Yaw/pitch quaternion for a 2D deflection bounded by `cone_deg`
pub fn stick_orientation(sx: f32, sy: f32, cone_deg: f32) -> [f32; 4] {
    let yaw = (sx.clamp(-1.0, 1.0) * cone_deg).to_radians();
    let pitch = (sy.clamp(-1.0, 1.0) * cone_deg).to_radians();
    let (sy2, cy2) = (yaw / 2.0).sin_cos();
    let (sp2, cp2) = (pitch / 2.0).sin_cos();
    // yaw about y, then pitch about x
    [sp2 * cy2, sy2 * cp2, -sy2 * sp2, cp2 * cy2]
}

/// Pose for a pointer-class or gamepad backend
pub fn pose_from_pointer(pos: &PointerPosition, width: u32, height: u32, params: &PoseParams) -> FusedPose {
    let (u, v) = pointer_to_image(pos, width, height, params.push_border);
    let radius = params.virtual_radius_px * width as f32 / 640.0;
    let (sx, sy) = pointer_deflection(pos);
    FusedPose {
        u,
        v,
        radius,
        world: image_to_world(u, v, radius, width, height),
        quat: stick_orientation(sx, sy, params.cone_angle_deg),
        distance: distance_from_radius(radius, width),
        valid: pointer_in_bounds(pos),
    }
}

/// Pose for the real tracked device: tracker position plus sensor orientation
pub fn pose_from_tracker(
    x: f32,
    y: f32,
    radius: f32,
    radius_valid: bool,
    orientation: Option<[f32; 4]>,
    width: u32,
    height: u32,
) -> FusedPose {
    FusedPose {
        u: x,
        v: y,
        radius,
        world: image_to_world(x, y, radius, width, height),
        quat: orientation.unwrap_or([0.0, 0.0, 0.0, 1.0]),
        distance: distance_from_radius(radius, width),
        valid: radius_valid,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pointer(x: i32, y: i32) -> PointerPosition {
        PointerPosition {
            x,
            y,
            max_x: 1000,
            max_y: 1000,
        }
    }

    #[test]
    fn border_positions_are_pushed_out() {
        assert_eq!(pointer_to_image(&pointer(0, 500), 640, 480, true), (-1.0, 240.0));
        assert_eq!(pointer_to_image(&pointer(1000, 1000), 640, 480, true), (640.0, 480.0));
        assert_eq!(pointer_to_image(&pointer(0, 0), 640, 480, false), (0.0, 0.0));
    }

    #[test]
    fn extent_clears_validity() {
        assert!(pointer_in_bounds(&pointer(500, 500)));
        assert!(!pointer_in_bounds(&pointer(1000, 500)));
        assert!(!pointer_in_bounds(&pointer(500, 0)));
    }

    #[test]
    fn centre_maps_to_origin() {
        let world = image_to_world(320.0, 240.0, 22.5, 640, 480);
        assert_eq!(&world[..2], &[0.0, 0.0]);
        assert!((world[2] - FOCAL_LENGTH_PX).abs() < 1e-3);

        let right = image_to_world(330.0, 240.0, 22.5, 640, 480);
        assert!((right[0] - 10.0).abs() < 1e-4);
    }

    #[test]
    fn orientation_stays_in_cone() {
        assert_eq!(stick_orientation(0.0, 0.0, 30.0), [0.0, 0.0, 0.0, 1.0]);
        let q = stick_orientation(1.0, 0.0, 30.0);
        let yaw = 2.0 * q[1].atan2(q[3]);
        assert!((yaw.to_degrees() - 30.0).abs() < 1e-3);
        let norm: f32 = q.iter().map(|c| c * c).sum();
        assert!((norm - 1.0).abs() < 1e-5);
    }
}
