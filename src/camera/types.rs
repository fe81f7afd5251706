//! Guest-visible camera vocabulary: formats, resolutions, models, attributes, events

use crate::error::{GuestError, GuestResult};
use serde::{Deserialize, Serialize};

/// Pixel formats a guest can request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CameraFormat {
    Jpg,
    Raw8,
    Yuv422,
    Raw10,
    Rgba,
    Yuv420,
    VY1UY0,
}

impl CameraFormat {
    pub fn from_guest(value: u32) -> Option<Self> {
        match value {
            1 => Some(CameraFormat::Jpg),
            2 => Some(CameraFormat::Raw8),
            3 => Some(CameraFormat::Yuv422),
            4 => Some(CameraFormat::Raw10),
            5 => Some(CameraFormat::Rgba),
            6 => Some(CameraFormat::Yuv420),
            7 => Some(CameraFormat::VY1UY0),
            _ => None,
        }
    }

    pub fn to_guest(self) -> u32 {
        match self {
            CameraFormat::Jpg => 1,
            CameraFormat::Raw8 => 2,
            CameraFormat::Yuv422 => 3,
            CameraFormat::Raw10 => 4,
            CameraFormat::Rgba => 5,
            CameraFormat::Yuv420 => 6,
            CameraFormat::VY1UY0 => 7,
        }
    }

    /// Exact frame size in bytes for this format at `width` x `height`
    pub fn frame_size(self, width: u32, height: u32) -> u32 {
        let pixels = width * height;
        match self {
            // Uncompressed worst case, the guest sizes its buffer for it
            CameraFormat::Jpg => pixels * 3,
            CameraFormat::Raw8 => pixels,
            CameraFormat::Raw10 => pixels * 2,
            CameraFormat::Yuv422 | CameraFormat::VY1UY0 => pixels * 2,
            CameraFormat::Rgba => pixels * 4,
            CameraFormat::Yuv420 => pixels * 3 / 2,
        }
    }
}

/// Frame sizes the guest can request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CameraResolution {
    /// 640x480
    Vga,
    /// 320x240
    Qvga,
    /// 640x360
    Wga,
}

impl CameraResolution {
    pub fn from_guest(value: u32) -> Option<Self> {
        match value {
            1 => Some(CameraResolution::Vga),
            2 => Some(CameraResolution::Qvga),
            3 => Some(CameraResolution::Wga),
            _ => None,
        }
    }

    pub fn to_guest(self) -> u32 {
        match self {
            CameraResolution::Vga => 1,
            CameraResolution::Qvga => 2,
            CameraResolution::Wga => 3,
        }
    }

    pub fn dimensions(self) -> (u32, u32) {
        match self {
            CameraResolution::Vga => (640, 480),
            CameraResolution::Qvga => (320, 240),
            CameraResolution::Wga => (640, 360),
        }
    }
}

/// Size of a guest buffer for `format` at `resolution`, validated against nothing
/// but the enum ranges.
pub fn buffer_size(format: u32, resolution: u32) -> GuestResult<u32> {
    let format = CameraFormat::from_guest(format).ok_or(GuestError::FormatUnknown)?;
    let resolution = CameraResolution::from_guest(resolution).ok_or(GuestError::ResolutionUnknown)?;
    let (width, height) = resolution.dimensions();
    Ok(format.frame_size(width, height))
}

/// Virtual device model presented to the guest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum CameraModel {
    EyeToy,
    #[default]
    PlayStationEye,
    Uvc,
}

const EYETOY_FORMATS: &[CameraFormat] = &[
    CameraFormat::Jpg,
    CameraFormat::Raw8,
    CameraFormat::Yuv422,
    CameraFormat::Rgba,
];
const EYE_FORMATS: &[CameraFormat] = &[
    CameraFormat::Raw8,
    CameraFormat::Yuv422,
    CameraFormat::Raw10,
    CameraFormat::Rgba,
    CameraFormat::Yuv420,
    CameraFormat::VY1UY0,
];
const UVC_FORMATS: &[CameraFormat] = &[
    CameraFormat::Jpg,
    CameraFormat::Yuv422,
    CameraFormat::Rgba,
    CameraFormat::Yuv420,
    CameraFormat::VY1UY0,
];

const EYETOY_VGA_FPS: &[u32] = &[30, 25, 20, 15, 12, 10, 7, 5, 3, 2];
const EYETOY_QVGA_FPS: &[u32] = &[60, 50, 30, 25, 20, 15, 12, 10, 7, 5, 3, 2];
const EYE_VGA_FPS: &[u32] = &[60, 50, 40, 30, 25, 20, 15, 12, 10, 7, 5, 3, 2];
const EYE_QVGA_FPS: &[u32] = &[
    187, 150, 137, 125, 120, 100, 90, 75, 60, 50, 40, 30, 25, 20, 15, 12, 10, 7, 5, 3, 2,
];
const UVC_FPS: &[u32] = &[30, 25, 20, 15, 10, 5];

impl CameraModel {
    /// Device type value reported to the guest
    pub fn guest_type(self) -> u32 {
        match self {
            CameraModel::EyeToy => 1,
            CameraModel::PlayStationEye => 2,
            CameraModel::Uvc => 3,
        }
    }

    /// 16-byte device GUID reported to the guest, derived from the model
    pub fn guid(self) -> [u8; 16] {
        let mut guid = [0u8; 16];
        guid[0] = b'E';
        guid[1] = b'M';
        guid[15] = self.guest_type() as u8;
        guid
    }

    pub fn formats(self) -> &'static [CameraFormat] {
        match self {
            CameraModel::EyeToy => EYETOY_FORMATS,
            CameraModel::PlayStationEye => EYE_FORMATS,
            CameraModel::Uvc => UVC_FORMATS,
        }
    }

    /// Supported framerates for a resolution, empty if the resolution is unsupported
    pub fn framerates(self, resolution: CameraResolution) -> &'static [u32] {
        match (self, resolution) {
            (CameraModel::EyeToy, CameraResolution::Vga) => EYETOY_VGA_FPS,
            (CameraModel::EyeToy, CameraResolution::Qvga) => EYETOY_QVGA_FPS,
            (CameraModel::PlayStationEye, CameraResolution::Vga) => EYE_VGA_FPS,
            (CameraModel::PlayStationEye, CameraResolution::Qvga) => EYE_QVGA_FPS,
            (CameraModel::Uvc, _) => UVC_FPS,
            _ => &[],
        }
    }

    /// Check a raw (format, resolution, framerate) request against this model.
    ///
    /// Constraints are checked in order so each violation maps to one kind.
    pub fn validate(
        self,
        format: u32,
        resolution: u32,
        framerate: u32,
    ) -> GuestResult<(CameraFormat, CameraResolution)> {
        let format = CameraFormat::from_guest(format)
            .filter(|f| self.formats().contains(f))
            .ok_or(GuestError::FormatUnknown)?;
        let resolution = CameraResolution::from_guest(resolution)
            .filter(|r| !self.framerates(*r).is_empty())
            .ok_or(GuestError::ResolutionUnknown)?;
        if !self.framerates(resolution).contains(&framerate) {
            return Err(GuestError::BadFramerate);
        }
        Ok((format, resolution))
    }
}

/// How frames reach the guest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ReadMode {
    /// Frames are staged on the host and copied on `Read()`
    #[default]
    FunctionCall,
    /// Frames are written straight into one of two guest buffers
    Direct,
}

impl ReadMode {
    pub fn from_guest(value: u32) -> Option<Self> {
        match value {
            0 => Some(ReadMode::FunctionCall),
            1 => Some(ReadMode::Direct),
            _ => None,
        }
    }

    pub fn to_guest(self) -> u32 {
        match self {
            ReadMode::FunctionCall => 0,
            ReadMode::Direct => 1,
        }
    }

    pub fn buffer_count(self) -> usize {
        match self {
            ReadMode::FunctionCall => 1,
            ReadMode::Direct => 2,
        }
    }
}

/// Attribute identifiers in guest numbering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CameraAttribute {
    Gain,
    RedBlueGain,
    Saturation,
    Exposure,
    Brightness,
    Aec,
    Agc,
    Awb,
    Abc,
    Led,
    AudioGain,
    Qs,
    NonZeroCoeffs,
    YuvFlag,
    JpegFlag,
    BacklightComp,
    MirrorFlag,
    MeasuredQs,
    Flag422,
    UsbLoad,
    Gamma,
    GreenGain,
    AgcLimit,
    Denoise,
    FrameRateAdjust,
    PixelOutlierFilter,
    AgcLow,
    AgcHigh,
    DeviceLocation,
    FormatCap,
    FormatIndex,
    NumFrame,
    FrameIndex,
    FrameSize,
    IntervalType,
    IntervalIndex,
    IntervalValue,
    ColorMatching,
    PowerLineFrequency,
    DeviceId,
    DeviceCap,
    DeviceSpeed,
    UvcRequestCode,
    UvcRequestData,
    DeviceId2,
    ReadMode,
    GamePid,
    PBuffer,
    ReadFinish,
}

const SENSOR_ATTRIBUTES: [CameraAttribute; 29] = [
    CameraAttribute::Gain,
    CameraAttribute::RedBlueGain,
    CameraAttribute::Saturation,
    CameraAttribute::Exposure,
    CameraAttribute::Brightness,
    CameraAttribute::Aec,
    CameraAttribute::Agc,
    CameraAttribute::Awb,
    CameraAttribute::Abc,
    CameraAttribute::Led,
    CameraAttribute::AudioGain,
    CameraAttribute::Qs,
    CameraAttribute::NonZeroCoeffs,
    CameraAttribute::YuvFlag,
    CameraAttribute::JpegFlag,
    CameraAttribute::BacklightComp,
    CameraAttribute::MirrorFlag,
    CameraAttribute::MeasuredQs,
    CameraAttribute::Flag422,
    CameraAttribute::UsbLoad,
    CameraAttribute::Gamma,
    CameraAttribute::GreenGain,
    CameraAttribute::AgcLimit,
    CameraAttribute::Denoise,
    CameraAttribute::FrameRateAdjust,
    CameraAttribute::PixelOutlierFilter,
    CameraAttribute::AgcLow,
    CameraAttribute::AgcHigh,
    CameraAttribute::DeviceLocation,
];

const UVC_ATTRIBUTES: [CameraAttribute; 16] = [
    CameraAttribute::FormatCap,
    CameraAttribute::FormatIndex,
    CameraAttribute::NumFrame,
    CameraAttribute::FrameIndex,
    CameraAttribute::FrameSize,
    CameraAttribute::IntervalType,
    CameraAttribute::IntervalIndex,
    CameraAttribute::IntervalValue,
    CameraAttribute::ColorMatching,
    CameraAttribute::PowerLineFrequency,
    CameraAttribute::DeviceId,
    CameraAttribute::DeviceCap,
    CameraAttribute::DeviceSpeed,
    CameraAttribute::UvcRequestCode,
    CameraAttribute::UvcRequestData,
    CameraAttribute::DeviceId2,
];

const DRIVER_ATTRIBUTES: [CameraAttribute; 4] = [
    CameraAttribute::ReadMode,
    CameraAttribute::GamePid,
    CameraAttribute::PBuffer,
    CameraAttribute::ReadFinish,
];

impl CameraAttribute {
    pub fn from_guest(id: u32) -> Option<Self> {
        match id {
            0..=28 => SENSOR_ATTRIBUTES.get(id as usize).copied(),
            100..=115 => UVC_ATTRIBUTES.get((id - 100) as usize).copied(),
            300..=303 => DRIVER_ATTRIBUTES.get((id - 300) as usize).copied(),
            _ => None,
        }
    }

    pub fn to_guest(self) -> u32 {
        if let Some(i) = SENSOR_ATTRIBUTES.iter().position(|a| *a == self) {
            return i as u32;
        }
        if let Some(i) = UVC_ATTRIBUTES.iter().position(|a| *a == self) {
            return 100 + i as u32;
        }
        DRIVER_ATTRIBUTES
            .iter()
            .position(|a| *a == self)
            .map(|i| 300 + i as u32)
            .unwrap_or(u32::MAX)
    }

    /// Every attribute the table knows, in guest id order
    pub fn all() -> impl Iterator<Item = CameraAttribute> {
        SENSOR_ATTRIBUTES
            .into_iter()
            .chain(UVC_ATTRIBUTES)
            .chain(DRIVER_ATTRIBUTES)
    }
}

/// Seed values for the attribute table, per model
pub fn default_attribute(model: CameraModel, attribute: CameraAttribute) -> (u32, u32) {
    let eye = model == CameraModel::PlayStationEye;
    match attribute {
        CameraAttribute::Gain => (if eye { 0 } else { 32 }, 0),
        CameraAttribute::RedBlueGain => (64, 64),
        CameraAttribute::Saturation => (64, 0),
        CameraAttribute::Exposure => (0x1e, 0),
        CameraAttribute::Aec | CameraAttribute::Agc | CameraAttribute::Awb => (1, 0),
        CameraAttribute::Led => (1, 0),
        CameraAttribute::MirrorFlag => (u32::from(eye), 0),
        CameraAttribute::UsbLoad => (4, 0),
        CameraAttribute::Gamma => (1, 0),
        CameraAttribute::GreenGain => (64, 0),
        CameraAttribute::AgcLimit => (4, 0),
        CameraAttribute::PixelOutlierFilter => (1, 0),
        CameraAttribute::AgcLow => (48, 0),
        CameraAttribute::AgcHigh => (64, 0),
        CameraAttribute::PowerLineFrequency => (if model == CameraModel::Uvc { 2 } else { 0 }, 0),
        CameraAttribute::ReadMode => (ReadMode::FunctionCall.to_guest(), 0),
        _ => (0, 0),
    }
}

/// Event types posted to subscribed queues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CameraEvent {
    Attach,
    Detach,
    FrameUpdate,
    Open,
    Close,
    Start,
    Stop,
    Reset,
}

impl CameraEvent {
    pub fn to_guest(self) -> u64 {
        match self {
            CameraEvent::Attach => 0,
            CameraEvent::Detach => 1,
            CameraEvent::FrameUpdate => 2,
            CameraEvent::Open => 3,
            CameraEvent::Close => 4,
            CameraEvent::Start => 5,
            CameraEvent::Stop => 6,
            CameraEvent::Reset => 7,
        }
    }

    /// Subscriber mask bit, `None` for events that ignore the mask
    pub fn mask_bit(self) -> Option<u64> {
        match self {
            CameraEvent::Attach | CameraEvent::Detach => None,
            CameraEvent::FrameUpdate => Some(1 << 0),
            CameraEvent::Open => Some(1 << 1),
            CameraEvent::Close => Some(1 << 2),
            CameraEvent::Start => Some(1 << 3),
            CameraEvent::Stop => Some(1 << 4),
            CameraEvent::Reset => Some(1 << 5),
        }
    }

    pub fn accepted_by(self, mask: u64) -> bool {
        self.mask_bit().map_or(true, |bit| mask & bit != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attribute_ids_round_trip() {
        for attribute in CameraAttribute::all() {
            assert_eq!(CameraAttribute::from_guest(attribute.to_guest()), Some(attribute));
        }
        assert_eq!(CameraAttribute::from_guest(29), None);
        assert_eq!(CameraAttribute::from_guest(116), None);
        assert_eq!(CameraAttribute::from_guest(304), None);
    }

    #[test]
    fn validation_reports_first_violated_constraint() {
        let eye = CameraModel::PlayStationEye;
        assert_eq!(eye.validate(0, 1, 60), Err(GuestError::FormatUnknown));
        assert_eq!(eye.validate(1, 1, 60), Err(GuestError::FormatUnknown));
        assert_eq!(eye.validate(2, 3, 60), Err(GuestError::ResolutionUnknown));
        assert_eq!(eye.validate(2, 1, 187), Err(GuestError::BadFramerate));
        assert_eq!(
            eye.validate(2, 2, 187),
            Ok((CameraFormat::Raw8, CameraResolution::Qvga))
        );
        assert!(CameraModel::Uvc.validate(1, 3, 30).is_ok());
    }

    #[test]
    fn buffer_sizes_match_formats() {
        assert_eq!(buffer_size(2, 1), Ok(640 * 480));
        assert_eq!(buffer_size(5, 2), Ok(320 * 240 * 4));
        assert_eq!(buffer_size(6, 1), Ok(640 * 480 * 3 / 2));
        assert_eq!(buffer_size(9, 1), Err(GuestError::FormatUnknown));
        assert_eq!(buffer_size(3, 0), Err(GuestError::ResolutionUnknown));
    }

    #[test]
    fn lifecycle_events_respect_mask() {
        assert!(CameraEvent::Attach.accepted_by(0));
        assert!(!CameraEvent::FrameUpdate.accepted_by(0));
        assert!(CameraEvent::FrameUpdate.accepted_by(1));
        assert!(CameraEvent::Stop.accepted_by(1 << 4));
    }
}
