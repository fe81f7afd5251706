//! Host camera handlers
//!
//! A [`CameraBackend`] is the raw host driver the virtual device delegates to.
//! Two handlers ship with the crate: [`NullCamera`] (never attaches) and
//! [`PatternCamera`], a synthetic source drawing coloured spheres over a grey
//! ramp so the tracking path can be exercised without hardware.

use crate::camera::types::CameraFormat;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Connection/stream state reported by a host handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendState {
    Closed,
    Open,
    Running,
    /// The device went away underneath an open stream
    Disconnected,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("camera device unavailable: {0}")]
    Unavailable(String),

    #[error("camera is not running")]
    NotRunning,

    #[error("camera disconnected")]
    Disconnected,

    #[error("destination too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },
}

/// What the device controller asks a handler to stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamRequest {
    pub format: CameraFormat,
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
}

/// Raw host camera driver
pub trait CameraBackend: Send {
    fn name(&self) -> &str;

    fn open(&mut self, request: &StreamRequest) -> Result<(), BackendError>;

    fn start(&mut self) -> Result<(), BackendError>;

    fn stop(&mut self) -> Result<(), BackendError>;

    fn close(&mut self) -> Result<(), BackendError>;

    fn state(&self) -> BackendState;

    /// Copy the next frame into `dst`, returning the byte count, or `None` when
    /// no new frame is ready.
    fn get_frame(&mut self, dst: &mut [u8]) -> Result<Option<usize>, BackendError>;

    fn set_mirrored(&mut self, _mirrored: bool) {}

    fn set_led(&mut self, _on: bool) {}
}

/// Host camera handler selected in the settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum CameraHandler {
    /// No camera: the device never reports attached
    #[default]
    Null,
    /// Synthetic frames from [`PatternCamera`]
    Pattern,
}

impl CameraHandler {
    pub fn create(self) -> Option<Box<dyn CameraBackend>> {
        match self {
            CameraHandler::Null => None,
            CameraHandler::Pattern => Some(Box::new(PatternCamera::new())),
        }
    }
}

/// Handler that refuses to open
#[derive(Debug, Default)]
pub struct NullCamera;

impl CameraBackend for NullCamera {
    fn name(&self) -> &str {
        "null"
    }

    fn open(&mut self, _request: &StreamRequest) -> Result<(), BackendError> {
        Err(BackendError::Unavailable("null camera".to_string()))
    }

    fn start(&mut self) -> Result<(), BackendError> {
        Err(BackendError::NotRunning)
    }

    fn stop(&mut self) -> Result<(), BackendError> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), BackendError> {
        Ok(())
    }

    fn state(&self) -> BackendState {
        BackendState::Closed
    }

    fn get_frame(&mut self, _dst: &mut [u8]) -> Result<Option<usize>, BackendError> {
        Err(BackendError::NotRunning)
    }
}

/// A coloured ball drawn by [`PatternCamera`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PatternSphere {
    /// Hue in degrees
    pub hue: f32,
    /// Centre in normalised image coordinates
    pub x: f32,
    pub y: f32,
    /// Radius in pixels at 640 px image width
    pub radius: f32,
    /// Horizontal drift per frame, normalised
    pub drift: f32,
}

/// Shared switches for a running [`PatternCamera`]
#[derive(Debug, Clone, Default)]
pub struct PatternControl {
    unplugged: Arc<AtomicBool>,
    refuse_start: Arc<AtomicBool>,
}

impl PatternControl {
    /// Simulate the device being pulled mid-stream
    pub fn unplug(&self) {
        self.unplugged.store(true, Ordering::SeqCst);
    }

    pub fn replug(&self) {
        self.unplugged.store(false, Ordering::SeqCst);
    }

    /// Make the next `start()` leave the stream in the open state
    pub fn refuse_start(&self, refuse: bool) {
        self.refuse_start.store(refuse, Ordering::SeqCst);
    }

    fn is_unplugged(&self) -> bool {
        self.unplugged.load(Ordering::SeqCst)
    }
}

/// Synthetic camera producing any supported format
pub struct PatternCamera {
    state: BackendState,
    request: Option<StreamRequest>,
    spheres: Vec<PatternSphere>,
    sequence: u64,
    mirrored: bool,
    control: PatternControl,
}

impl Default for PatternCamera {
    fn default() -> Self {
        Self::new()
    }
}

impl PatternCamera {
    pub fn new() -> Self {
        Self::with_spheres(vec![PatternSphere {
            hue: 240.0,
            x: 0.5,
            y: 0.5,
            radius: 24.0,
            drift: 0.0,
        }])
    }

    pub fn with_spheres(spheres: Vec<PatternSphere>) -> Self {
        Self {
            state: BackendState::Closed,
            request: None,
            spheres,
            sequence: 0,
            mirrored: false,
            control: PatternControl::default(),
        }
    }

    pub fn control(&self) -> PatternControl {
        self.control.clone()
    }

    /// Render the current scene as packed RGB
    fn render_rgb(&self, width: u32, height: u32) -> Vec<u8> {
        let (w, h) = (width as usize, height as usize);
        let mut rgb = vec![0u8; w * h * 3];
        let scale = width as f32 / 640.0;

        for y in 0..h {
            // Desaturated ramp so the background never matches a hue
            let shade = (32 + (y * 64) / h.max(1)) as u8;
            for x in 0..w {
                let i = (y * w + x) * 3;
                rgb[i] = shade;
                rgb[i + 1] = shade;
                rgb[i + 2] = shade;
            }
        }

        for sphere in &self.spheres {
            let drift = (sphere.x + sphere.drift * self.sequence as f32).rem_euclid(1.0);
            let cx = drift * width as f32;
            let cy = sphere.y * height as f32;
            let r = sphere.radius * scale;
            let (cr, cg, cb) = hue_to_rgb8(sphere.hue);
            let x0 = (cx - r).floor().max(0.0) as usize;
            let x1 = ((cx + r).ceil() as usize).min(w);
            let y0 = (cy - r).floor().max(0.0) as usize;
            let y1 = ((cy + r).ceil() as usize).min(h);
            for y in y0..y1 {
                for x in x0..x1 {
                    let dx = x as f32 + 0.5 - cx;
                    let dy = y as f32 + 0.5 - cy;
                    if dx * dx + dy * dy <= r * r {
                        let i = (y * w + x) * 3;
                        rgb[i] = cr;
                        rgb[i + 1] = cg;
                        rgb[i + 2] = cb;
                    }
                }
            }
        }

        if self.mirrored {
            for row in rgb.chunks_exact_mut(w * 3) {
                let pixels: Vec<[u8; 3]> = row
                    .chunks_exact(3)
                    .rev()
                    .map(|p| [p[0], p[1], p[2]])
                    .collect();
                for (dst, src) in row.chunks_exact_mut(3).zip(pixels) {
                    dst.copy_from_slice(&src);
                }
            }
        }
        rgb
    }
}

impl CameraBackend for PatternCamera {
    fn name(&self) -> &str {
        "pattern"
    }

    fn open(&mut self, request: &StreamRequest) -> Result<(), BackendError> {
        if self.control.is_unplugged() {
            return Err(BackendError::Unavailable("pattern camera unplugged".to_string()));
        }
        info!(
            "Pattern camera open: {:?} {}x{} @ {}fps",
            request.format, request.width, request.height, request.framerate
        );
        self.request = Some(*request);
        self.state = BackendState::Open;
        Ok(())
    }

    fn start(&mut self) -> Result<(), BackendError> {
        match self.state {
            BackendState::Open | BackendState::Running => {
                if self.control.refuse_start.load(Ordering::SeqCst) {
                    warn!("Pattern camera refused to start");
                    return Ok(());
                }
                self.state = BackendState::Running;
                Ok(())
            }
            _ => Err(BackendError::NotRunning),
        }
    }

    fn stop(&mut self) -> Result<(), BackendError> {
        if self.state == BackendState::Running {
            self.state = BackendState::Open;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), BackendError> {
        self.state = BackendState::Closed;
        self.request = None;
        Ok(())
    }

    fn state(&self) -> BackendState {
        if self.control.is_unplugged() && self.state != BackendState::Closed {
            return BackendState::Disconnected;
        }
        self.state
    }

    fn get_frame(&mut self, dst: &mut [u8]) -> Result<Option<usize>, BackendError> {
        match self.state() {
            BackendState::Running => {}
            BackendState::Disconnected => return Err(BackendError::Disconnected),
            _ => return Err(BackendError::NotRunning),
        }
        let Some(request) = self.request else {
            return Err(BackendError::NotRunning);
        };
        let needed = request.format.frame_size(request.width, request.height) as usize;
        if dst.len() < needed {
            return Err(BackendError::BufferTooSmall {
                needed,
                available: dst.len(),
            });
        }

        let rgb = self.render_rgb(request.width, request.height);
        encode_rgb(&rgb, request.width, request.height, request.format, &mut dst[..needed]);
        self.sequence += 1;
        debug!("Pattern camera frame {}", self.sequence);
        Ok(Some(needed))
    }

    fn set_mirrored(&mut self, mirrored: bool) {
        self.mirrored = mirrored;
    }
}

/// Fully saturated hue as 8-bit RGB
pub fn hue_to_rgb8(hue: f32) -> (u8, u8, u8) {
    let (r, g, b) = crate::motion::types::hue_to_rgb(hue);
    (
        (r * 255.0).round() as u8,
        (g * 255.0).round() as u8,
        (b * 255.0).round() as u8,
    )
}

fn luma(r: u8, g: u8, b: u8) -> u8 {
    (0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32).round() as u8
}

fn chroma(r: u8, g: u8, b: u8) -> (u8, u8) {
    let (r, g, b) = (r as f32, g as f32, b as f32);
    let u = -0.169 * r - 0.331 * g + 0.5 * b + 128.0;
    let v = 0.5 * r - 0.419 * g - 0.081 * b + 128.0;
    (u.round().clamp(0.0, 255.0) as u8, v.round().clamp(0.0, 255.0) as u8)
}

/// Pack an RGB image into a camera wire format.
///
/// `Jpg` carries the uncompressed RGB payload.
fn encode_rgb(rgb: &[u8], width: u32, height: u32, format: CameraFormat, dst: &mut [u8]) {
    let (w, h) = (width as usize, height as usize);
    let px = |x: usize, y: usize| {
        let i = (y * w + x) * 3;
        (rgb[i], rgb[i + 1], rgb[i + 2])
    };
    match format {
        CameraFormat::Jpg => dst.copy_from_slice(&rgb[..w * h * 3]),
        CameraFormat::Rgba => {
            for (i, p) in rgb.chunks_exact(3).enumerate() {
                dst[i * 4..i * 4 + 4].copy_from_slice(&[p[0], p[1], p[2], 255]);
            }
        }
        CameraFormat::Raw8 | CameraFormat::Raw10 => {
            // GRBG mosaic
            for y in 0..h {
                for x in 0..w {
                    let (r, g, b) = px(x, y);
                    let sample = match (y & 1, x & 1) {
                        (0, 1) => r,
                        (1, 0) => b,
                        _ => g,
                    };
                    if format == CameraFormat::Raw8 {
                        dst[y * w + x] = sample;
                    } else {
                        let wide = (sample as u16) << 2;
                        let i = (y * w + x) * 2;
                        dst[i..i + 2].copy_from_slice(&wide.to_le_bytes());
                    }
                }
            }
        }
        CameraFormat::Yuv422 | CameraFormat::VY1UY0 => {
            for y in 0..h {
                for x in (0..w.saturating_sub(1)).step_by(2) {
                    let (r0, g0, b0) = px(x, y);
                    let (r1, g1, b1) = px(x + 1, y);
                    let (u0, v0) = chroma(r0, g0, b0);
                    let (u1, v1) = chroma(r1, g1, b1);
                    let u = ((u0 as u16 + u1 as u16) / 2) as u8;
                    let v = ((v0 as u16 + v1 as u16) / 2) as u8;
                    let y0 = luma(r0, g0, b0);
                    let y1 = luma(r1, g1, b1);
                    let i = (y * w + x) * 2;
                    let quad = if format == CameraFormat::Yuv422 {
                        [y0, u, y1, v]
                    } else {
                        [v, y1, u, y0]
                    };
                    dst[i..i + 4].copy_from_slice(&quad);
                }
            }
        }
        CameraFormat::Yuv420 => {
            let (y_plane, chroma_planes) = dst.split_at_mut(w * h);
            let (u_plane, v_plane) = chroma_planes.split_at_mut((w / 2) * (h / 2));
            for y in 0..h {
                for x in 0..w {
                    let (r, g, b) = px(x, y);
                    y_plane[y * w + x] = luma(r, g, b);
                }
            }
            for cy in 0..h / 2 {
                for cx in 0..w / 2 {
                    let (r, g, b) = px(cx * 2, cy * 2);
                    let (u, v) = chroma(r, g, b);
                    u_plane[cy * (w / 2) + cx] = u;
                    v_plane[cy * (w / 2) + cx] = v;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(format: CameraFormat) -> StreamRequest {
        StreamRequest {
            format,
            width: 64,
            height: 48,
            framerate: 30,
        }
    }

    #[test]
    fn pattern_fills_exact_frame_size_for_every_format() {
        for format in [
            CameraFormat::Jpg,
            CameraFormat::Raw8,
            CameraFormat::Yuv422,
            CameraFormat::Raw10,
            CameraFormat::Rgba,
            CameraFormat::Yuv420,
            CameraFormat::VY1UY0,
        ] {
            let mut cam = PatternCamera::new();
            cam.open(&request(format)).unwrap();
            cam.start().unwrap();
            let mut buf = vec![0u8; format.frame_size(64, 48) as usize];
            let written = cam.get_frame(&mut buf).unwrap();
            assert_eq!(written, Some(buf.len()), "{:?}", format);
        }
    }

    #[test]
    fn unplug_reports_disconnected() {
        let mut cam = PatternCamera::new();
        let control = cam.control();
        cam.open(&request(CameraFormat::Rgba)).unwrap();
        cam.start().unwrap();
        control.unplug();
        assert_eq!(cam.state(), BackendState::Disconnected);
        let mut buf = vec![0u8; 64 * 48 * 4];
        assert_eq!(cam.get_frame(&mut buf), Err(BackendError::Disconnected));
        control.replug();
        assert_eq!(cam.state(), BackendState::Running);
    }

    #[test]
    fn sphere_is_drawn_in_its_hue() {
        let mut cam = PatternCamera::new();
        cam.open(&request(CameraFormat::Rgba)).unwrap();
        cam.start().unwrap();
        let mut buf = vec![0u8; 64 * 48 * 4];
        cam.get_frame(&mut buf).unwrap();
        let centre = (24 * 64 + 32) * 4;
        assert_eq!(&buf[centre..centre + 3], &[0, 0, 255]);
    }
}
