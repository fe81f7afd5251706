//! Video conversion for the motion subsystem
//!
//! A guest hands over a camera frame and receives it transcoded into one of
//! the output layouts below, optionally with gains applied and a marker drawn
//! at every tracked controller. Sizes are exact: a buffer that does not match
//! the expected byte count is rejected before anything is written.

use crate::camera::types::CameraFormat;
use crate::error::GuestError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Draw a marker at each controller's last screen position
pub const FLAG_DRAW_MARKERS: u32 = 1 << 0;

/// Output buffers must be aligned to this many bytes
pub const OUTPUT_ALIGN: u32 = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum OutputFormat {
    #[default]
    NoVideoOutput,
    Rgba,
    /// Packed 4:2:2, Y0 U Y1 V
    Yuyv,
    Yuv444Planar,
    Yuv422Planar,
    Yuv420Planar,
    /// RGBA at half width and height
    RgbaHalf,
}

impl OutputFormat {
    pub fn from_guest(value: u32) -> Option<Self> {
        match value {
            0 => Some(OutputFormat::NoVideoOutput),
            1 => Some(OutputFormat::Rgba),
            2 => Some(OutputFormat::Yuyv),
            3 => Some(OutputFormat::Yuv444Planar),
            4 => Some(OutputFormat::Yuv422Planar),
            5 => Some(OutputFormat::Yuv420Planar),
            6 => Some(OutputFormat::RgbaHalf),
            _ => None,
        }
    }

    /// Exact byte count of one converted frame
    pub fn output_size(self, width: u32, height: u32) -> usize {
        let (w, h) = (width as usize, height as usize);
        match self {
            OutputFormat::NoVideoOutput => 0,
            OutputFormat::Rgba => w * h * 4,
            OutputFormat::Yuyv => w * h * 2,
            OutputFormat::Yuv444Planar => w * h * 3,
            OutputFormat::Yuv422Planar => w * h * 2,
            OutputFormat::Yuv420Planar => w * h * 3 / 2,
            OutputFormat::RgbaHalf => (w / 2) * (h / 2) * 4,
        }
    }
}

/// Settings from `PrepareVideoConvert`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvertAttributes {
    pub output_format: OutputFormat,
    pub flags: u32,
    pub gain: f32,
    pub red_gain: f32,
    pub green_gain: f32,
    pub blue_gain: f32,
    pub alpha: u8,
    /// Guest address the converted frame is written to
    pub output_addr: u32,
}

impl Default for ConvertAttributes {
    fn default() -> Self {
        Self {
            output_format: OutputFormat::NoVideoOutput,
            flags: 0,
            gain: 1.0,
            red_gain: 1.0,
            green_gain: 1.0,
            blue_gain: 1.0,
            alpha: 255,
            output_addr: 0,
        }
    }
}

impl ConvertAttributes {
    /// Reject out-of-range gains and misaligned output buffers
    pub fn validate(&self) -> Result<(), GuestError> {
        let gains = [self.gain, self.red_gain, self.green_gain, self.blue_gain];
        if gains.iter().any(|g| !(0.0..=2.0).contains(g)) {
            return Err(GuestError::Param);
        }
        if self.output_format != OutputFormat::NoVideoOutput {
            if self.output_addr == 0 {
                return Err(GuestError::Param);
            }
            if self.output_addr % OUTPUT_ALIGN != 0 {
                return Err(GuestError::InvalidAlignment);
            }
        }
        Ok(())
    }

    pub fn draws_markers(&self) -> bool {
        self.flags & FLAG_DRAW_MARKERS != 0
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConvertError {
    #[error("cannot convert from {0:?}")]
    UnsupportedSource(CameraFormat),

    #[error("source holds {actual} bytes, expected {expected}")]
    SourceSize { expected: usize, actual: usize },

    #[error("output holds {actual} bytes, expected {expected}")]
    OutputSize { expected: usize, actual: usize },
}

fn clamp_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let (y, u, v) = (y as f32, u as f32 - 128.0, v as f32 - 128.0);
    [
        clamp_u8(y + 1.402 * v),
        clamp_u8(y - 0.344 * u - 0.714 * v),
        clamp_u8(y + 1.772 * u),
    ]
}

fn rgb_to_y(p: [u8; 3]) -> u8 {
    clamp_u8(0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32)
}

fn rgb_to_uv(p: [u8; 3]) -> (u8, u8) {
    let (r, g, b) = (p[0] as f32, p[1] as f32, p[2] as f32);
    (
        clamp_u8(-0.169 * r - 0.331 * g + 0.5 * b + 128.0),
        clamp_u8(0.5 * r - 0.419 * g - 0.081 * b + 128.0),
    )
}

/// Whether a camera format can feed the converter
pub fn is_supported_source(format: CameraFormat) -> bool {
    matches!(
        format,
        CameraFormat::Raw8 | CameraFormat::Yuv422 | CameraFormat::VY1UY0 | CameraFormat::Rgba
    )
}

/// Decode a camera frame to packed RGB, one `[r, g, b]` per pixel
pub fn decode_rgb(
    src: &[u8],
    format: CameraFormat,
    width: u32,
    height: u32,
) -> Result<Vec<[u8; 3]>, ConvertError> {
    if !is_supported_source(format) {
        return Err(ConvertError::UnsupportedSource(format));
    }
    let expected = format.frame_size(width, height) as usize;
    if src.len() != expected {
        return Err(ConvertError::SourceSize {
            expected,
            actual: src.len(),
        });
    }

    let (w, h) = (width as usize, height as usize);
    let mut rgb = vec![[0u8; 3]; w * h];
    match format {
        CameraFormat::Rgba => {
            for (dst, px) in rgb.iter_mut().zip(src.chunks_exact(4)) {
                *dst = [px[0], px[1], px[2]];
            }
        }
        CameraFormat::Yuv422 | CameraFormat::VY1UY0 => {
            for (i, quad) in src.chunks_exact(4).enumerate() {
                let (y0, u, y1, v) = if format == CameraFormat::Yuv422 {
                    (quad[0], quad[1], quad[2], quad[3])
                } else {
                    (quad[3], quad[2], quad[1], quad[0])
                };
                rgb[i * 2] = yuv_to_rgb(y0, u, v);
                if let Some(next) = rgb.get_mut(i * 2 + 1) {
                    *next = yuv_to_rgb(y1, u, v);
                }
            }
        }
        CameraFormat::Raw8 => {
            // GRBG mosaic, each 2x2 cell shares one averaged colour
            for by in (0..h).step_by(2) {
                for bx in (0..w).step_by(2) {
                    let at = |dx: usize, dy: usize| {
                        let x = (bx + dx).min(w - 1);
                        let y = (by + dy).min(h - 1);
                        src[y * w + x] as u16
                    };
                    let g = ((at(0, 0) + at(1, 1)) / 2) as u8;
                    let r = at(1, 0) as u8;
                    let b = at(0, 1) as u8;
                    for dy in 0..2 {
                        for dx in 0..2 {
                            let (x, y) = (bx + dx, by + dy);
                            if x < w && y < h {
                                rgb[y * w + x] = [r, g, b];
                            }
                        }
                    }
                }
            }
        }
        _ => return Err(ConvertError::UnsupportedSource(format)),
    }
    Ok(rgb)
}

fn apply_gains(rgb: &mut [[u8; 3]], attrs: &ConvertAttributes) {
    let gains = [
        attrs.gain * attrs.red_gain,
        attrs.gain * attrs.green_gain,
        attrs.gain * attrs.blue_gain,
    ];
    if gains.iter().all(|g| (*g - 1.0).abs() < f32::EPSILON) {
        return;
    }
    for px in rgb.iter_mut() {
        for (c, g) in px.iter_mut().zip(gains) {
            *c = clamp_u8(*c as f32 * g);
        }
    }
}

/// Small white cross centred on each marker
fn draw_markers(rgb: &mut [[u8; 3]], width: usize, height: usize, markers: &[(f32, f32)]) {
    const ARM: i32 = 4;
    for &(mx, my) in markers {
        let (cx, cy) = (mx.round() as i32, my.round() as i32);
        for d in -ARM..=ARM {
            for (x, y) in [(cx + d, cy), (cx, cy + d)] {
                if x >= 0 && y >= 0 && (x as usize) < width && (y as usize) < height {
                    rgb[y as usize * width + x as usize] = [255, 255, 255];
                }
            }
        }
    }
}

/// Convert `src` into `dst`.
///
/// Both buffers must match the exact size for their format at
/// `width` x `height`; otherwise nothing is written.
pub fn transcode(
    src: &[u8],
    src_format: CameraFormat,
    width: u32,
    height: u32,
    dst: &mut [u8],
    attrs: &ConvertAttributes,
    markers: &[(f32, f32)],
) -> Result<(), ConvertError> {
    let expected = attrs.output_format.output_size(width, height);
    if dst.len() != expected {
        return Err(ConvertError::OutputSize {
            expected,
            actual: dst.len(),
        });
    }
    let mut rgb = decode_rgb(src, src_format, width, height)?;
    if attrs.output_format == OutputFormat::NoVideoOutput {
        return Ok(());
    }

    let (w, h) = (width as usize, height as usize);
    apply_gains(&mut rgb, attrs);
    if attrs.draws_markers() {
        draw_markers(&mut rgb, w, h, markers);
    }

    match attrs.output_format {
        OutputFormat::NoVideoOutput => {}
        OutputFormat::Rgba => {
            for (out, px) in dst.chunks_exact_mut(4).zip(&rgb) {
                out.copy_from_slice(&[px[0], px[1], px[2], attrs.alpha]);
            }
        }
        OutputFormat::RgbaHalf => {
            let hw = w / 2;
            for y in 0..h / 2 {
                for x in 0..hw {
                    let mut sum = [0u16; 3];
                    for (dx, dy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                        let p = rgb[(y * 2 + dy) * w + x * 2 + dx];
                        for c in 0..3 {
                            sum[c] += p[c] as u16;
                        }
                    }
                    let i = (y * hw + x) * 4;
                    dst[i..i + 4].copy_from_slice(&[
                        (sum[0] / 4) as u8,
                        (sum[1] / 4) as u8,
                        (sum[2] / 4) as u8,
                        attrs.alpha,
                    ]);
                }
            }
        }
        OutputFormat::Yuyv => {
            for (i, pair) in rgb.chunks_exact(2).enumerate() {
                let (u0, v0) = rgb_to_uv(pair[0]);
                let (u1, v1) = rgb_to_uv(pair[1]);
                dst[i * 4..i * 4 + 4].copy_from_slice(&[
                    rgb_to_y(pair[0]),
                    ((u0 as u16 + u1 as u16) / 2) as u8,
                    rgb_to_y(pair[1]),
                    ((v0 as u16 + v1 as u16) / 2) as u8,
                ]);
            }
        }
        OutputFormat::Yuv444Planar | OutputFormat::Yuv422Planar | OutputFormat::Yuv420Planar => {
            let (sx, sy) = match attrs.output_format {
                OutputFormat::Yuv444Planar => (1, 1),
                OutputFormat::Yuv422Planar => (2, 1),
                _ => (2, 2),
            };
            let (y_plane, chroma) = dst.split_at_mut(w * h);
            for (out, px) in y_plane.iter_mut().zip(&rgb) {
                *out = rgb_to_y(*px);
            }
            let (cw, ch) = (w / sx, h / sy);
            let (u_plane, v_plane) = chroma.split_at_mut(cw * ch);
            for cy in 0..ch {
                for cx in 0..cw {
                    let mut sum = (0u32, 0u32);
                    for dy in 0..sy {
                        for dx in 0..sx {
                            let (u, v) = rgb_to_uv(rgb[(cy * sy + dy) * w + cx * sx + dx]);
                            sum.0 += u as u32;
                            sum.1 += v as u32;
                        }
                    }
                    let n = (sx * sy) as u32;
                    u_plane[cy * cw + cx] = (sum.0 / n) as u8;
                    v_plane[cy * cw + cx] = (sum.1 / n) as u8;
                }
            }
        }
    }
    Ok(())
}

/// Mean colour of a frame in [0, 1], used as the environment lighting estimate
pub fn mean_color(src: &[u8], format: CameraFormat, width: u32, height: u32) -> Option<[f32; 3]> {
    let rgb = decode_rgb(src, format, width, height).ok()?;
    if rgb.is_empty() {
        return None;
    }
    let mut sum = [0u64; 3];
    for px in &rgb {
        for c in 0..3 {
            sum[c] += px[c] as u64;
        }
    }
    let n = rgb.len() as f32 * 255.0;
    Some([sum[0] as f32 / n, sum[1] as f32 / n, sum[2] as f32 / n])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rgba_frame(w: usize, h: usize, px: [u8; 4]) -> Vec<u8> {
        px.iter().copied().cycle().take(w * h * 4).collect()
    }

    fn attrs(format: OutputFormat) -> ConvertAttributes {
        ConvertAttributes {
            output_format: format,
            output_addr: 0x1000,
            ..ConvertAttributes::default()
        }
    }

    #[test]
    fn wrong_output_size_writes_nothing() {
        let src = rgba_frame(8, 4, [10, 20, 30, 255]);
        for format in [
            OutputFormat::Rgba,
            OutputFormat::Yuyv,
            OutputFormat::Yuv444Planar,
            OutputFormat::Yuv422Planar,
            OutputFormat::Yuv420Planar,
            OutputFormat::RgbaHalf,
        ] {
            let size = format.output_size(8, 4);
            for len in [size - 1, size + 1] {
                let mut dst = vec![0xAB; len];
                let err = transcode(&src, CameraFormat::Rgba, 8, 4, &mut dst, &attrs(format), &[]);
                assert!(matches!(err, Err(ConvertError::OutputSize { .. })), "{:?}", format);
                assert!(dst.iter().all(|b| *b == 0xAB));
            }
        }
    }

    #[test]
    fn wrong_source_size_writes_nothing() {
        let src = vec![0u8; 8 * 4 * 4 - 1];
        let mut dst = vec![0xAB; OutputFormat::Rgba.output_size(8, 4)];
        let err = transcode(&src, CameraFormat::Rgba, 8, 4, &mut dst, &attrs(OutputFormat::Rgba), &[]);
        assert!(matches!(err, Err(ConvertError::SourceSize { .. })));
        assert!(dst.iter().all(|b| *b == 0xAB));
    }

    #[test]
    fn raw8_demosaic_averages_cells() {
        // G R / B G cells
        let src = vec![100, 200, 100, 200, 50, 120, 50, 120];
        let rgb = decode_rgb(&src, CameraFormat::Raw8, 4, 2).unwrap();
        assert_eq!(rgb[0], [200, 110, 50]);
        assert_eq!(rgb[5], [200, 110, 50]);
    }

    #[test]
    fn rgba_to_planar_420_uses_standard_weights() {
        let src = rgba_frame(4, 4, [255, 255, 255, 255]);
        let mut dst = vec![0u8; OutputFormat::Yuv420Planar.output_size(4, 4)];
        transcode(&src, CameraFormat::Rgba, 4, 4, &mut dst, &attrs(OutputFormat::Yuv420Planar), &[]).unwrap();
        assert!(dst[..16].iter().all(|y| *y == 255));
        assert!(dst[16..].iter().all(|c| (*c as i32 - 128).abs() <= 1));
    }

    #[test]
    fn gains_and_alpha_apply() {
        let src = rgba_frame(2, 2, [100, 100, 100, 255]);
        let mut dst = vec![0u8; 16];
        let attrs = ConvertAttributes {
            red_gain: 2.0,
            blue_gain: 0.0,
            alpha: 7,
            ..attrs(OutputFormat::Rgba)
        };
        transcode(&src, CameraFormat::Rgba, 2, 2, &mut dst, &attrs, &[]).unwrap();
        assert_eq!(&dst[..4], &[200, 100, 0, 7]);
    }

    #[test]
    fn markers_are_drawn() {
        let src = rgba_frame(16, 16, [0, 0, 0, 255]);
        let mut dst = vec![0u8; 16 * 16 * 4];
        let attrs = ConvertAttributes {
            flags: FLAG_DRAW_MARKERS,
            ..attrs(OutputFormat::Rgba)
        };
        transcode(&src, CameraFormat::Rgba, 16, 16, &mut dst, &attrs, &[(8.0, 8.0)]).unwrap();
        let at = |x: usize, y: usize| dst[(y * 16 + x) * 4];
        assert_eq!(at(8, 8), 255);
        assert_eq!(at(12, 8), 255);
        assert_eq!(at(0, 0), 0);
    }

    #[test]
    fn attributes_validate_alignment_and_gain() {
        let mut a = attrs(OutputFormat::Rgba);
        assert_eq!(a.validate(), Ok(()));
        a.output_addr = 0x1010;
        assert_eq!(a.validate(), Err(GuestError::InvalidAlignment));
        a.output_addr = 0x1000;
        a.gain = 2.5;
        assert_eq!(a.validate(), Err(GuestError::Param));
    }
}
