//! Guest-visible error taxonomy
//!
//! Every guest-facing call validates synchronously and returns exactly one
//! [`GuestError`] kind. Backend failures never surface here; the capture and
//! update workers absorb them.

use thiserror::Error;

/// Result type for guest-facing calls
pub type GuestResult<T> = Result<T, GuestError>;

/// Error kinds shared by the camera and motion controller call surfaces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum GuestError {
    #[error("already initialized")]
    AlreadyInitialized,

    #[error("not initialized")]
    NotInitialized,

    #[error("device already open")]
    AlreadyOpen,

    #[error("device not open")]
    NotOpen,

    #[error("device not found")]
    DeviceNotFound,

    #[error("device deactivated")]
    DeviceDeactivated,

    #[error("stream not started")]
    NotStarted,

    #[error("unknown pixel format")]
    FormatUnknown,

    #[error("unknown resolution")]
    ResolutionUnknown,

    #[error("unsupported framerate")]
    BadFramerate,

    #[error("timed out")]
    Timeout,

    #[error("busy")]
    Busy,

    #[error("fatal internal error")]
    Fatal,

    #[error("invalid parameter")]
    Param,

    #[error("invalid alignment")]
    InvalidAlignment,

    #[error("video conversion not started")]
    ConvertNotStarted,

    #[error("video conversion not finished")]
    ConvertNotFinished,

    #[error("external port write not finished")]
    WriteNotFinished,

    #[error("controller not calibrated")]
    NotCalibrated,

    #[error("controller not connected")]
    NotConnected,

    #[error("controller subsystem uninitialized")]
    Uninitialized,

    #[error("no tracked hue set")]
    NotAHue,
}

impl GuestError {
    /// Guest code for the camera call family
    pub fn camera_code(self) -> u32 {
        match self {
            GuestError::AlreadyInitialized => 0x8014_0801,
            GuestError::NotInitialized | GuestError::Uninitialized => 0x8014_0803,
            GuestError::Param
            | GuestError::InvalidAlignment
            | GuestError::NotAHue => 0x8014_0804,
            GuestError::AlreadyOpen => 0x8014_0805,
            GuestError::NotOpen => 0x8014_0806,
            GuestError::DeviceNotFound | GuestError::NotConnected => 0x8014_0807,
            GuestError::DeviceDeactivated => 0x8014_0808,
            GuestError::NotStarted | GuestError::ConvertNotStarted => 0x8014_0809,
            GuestError::FormatUnknown => 0x8014_080a,
            GuestError::ResolutionUnknown => 0x8014_080b,
            GuestError::BadFramerate => 0x8014_080c,
            GuestError::Timeout => 0x8014_080d,
            GuestError::Busy
            | GuestError::ConvertNotFinished
            | GuestError::WriteNotFinished => 0x8014_080e,
            GuestError::Fatal | GuestError::NotCalibrated => 0x8014_080f,
        }
    }

    /// Guest code for the motion controller call family
    pub fn gem_code(self) -> u32 {
        match self {
            GuestError::Fatal | GuestError::DeviceDeactivated => 0x8012_1801,
            GuestError::AlreadyInitialized => 0x8012_1802,
            GuestError::Uninitialized | GuestError::NotInitialized => 0x8012_1803,
            GuestError::Param
            | GuestError::FormatUnknown
            | GuestError::ResolutionUnknown
            | GuestError::BadFramerate
            | GuestError::AlreadyOpen
            | GuestError::NotOpen => 0x8012_1804,
            GuestError::InvalidAlignment => 0x8012_1805,
            GuestError::Busy | GuestError::Timeout => 0x8012_1806,
            GuestError::NotStarted => 0x8012_1807,
            GuestError::ConvertNotFinished => 0x8012_1808,
            GuestError::ConvertNotStarted => 0x8012_1809,
            GuestError::WriteNotFinished => 0x8012_180a,
            GuestError::NotAHue => 0x8012_180b,
            GuestError::NotConnected | GuestError::DeviceNotFound => 0x8012_180c,
            GuestError::NotCalibrated => 0x8012_180d,
        }
    }
}

/// Collapse a guest call result into the 32-bit code the guest sees
pub fn camera_result<T>(result: &GuestResult<T>) -> u32 {
    match result {
        Ok(_) => 0,
        Err(e) => e.camera_code(),
    }
}

/// Same as [`camera_result`] for the motion controller family
pub fn gem_result<T>(result: &GuestResult<T>) -> u32 {
    match result {
        Ok(_) => 0,
        Err(e) => e.gem_code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_maps_to_zero() {
        assert_eq!(camera_result(&Ok::<(), GuestError>(())), 0);
        assert_eq!(gem_result(&Ok::<u8, GuestError>(3)), 0);
    }

    #[test]
    fn camera_codes_are_in_family() {
        for e in [
            GuestError::AlreadyOpen,
            GuestError::FormatUnknown,
            GuestError::BadFramerate,
            GuestError::Fatal,
        ] {
            assert_eq!(e.camera_code() & 0xFFFF_FF00, 0x8014_0800);
        }
        assert_eq!(GuestError::ConvertNotFinished.gem_code(), 0x8012_1808);
    }
}
