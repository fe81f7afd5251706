mod common;

use common::{harness, harness_with_workers, wait_until};
use eyemotion::camera::PatternCamera;
use eyemotion::guest::GuestMemory;
use eyemotion::motion::convert::{self, ConvertAttributes, ConvertError, OutputFormat};
use eyemotion::motion::types::{
    GemButton, CALIBRATION_OCCURRED, CALIBRATION_SUCCEEDED, DEFAULT_HUES, DONT_CARE_HUE, DONT_TRACK_HUE,
};
use eyemotion::motion::{ControllerStatus, HostButton, InputBackend, PointerFeed, SimulatedTrackedDevice};
use eyemotion::camera::CameraFormat;
use eyemotion::persistence::PeripheralSettings;
use eyemotion::GuestError;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(3);

#[test]
fn hues_round_trip_and_auto_assignment_avoids_collisions() {
    let h = harness(PeripheralSettings::default(), None, InputBackend::Null);
    let motion = h.hub.motion();
    motion.init(4).unwrap();

    let resolved = motion
        .track_hues(&[100, DONT_CARE_HUE, DONT_TRACK_HUE, DONT_CARE_HUE])
        .unwrap();
    assert_eq!(resolved[0], 100);
    assert_eq!(resolved[2], DONT_TRACK_HUE);
    assert!(DEFAULT_HUES.contains(&resolved[1]));
    assert!(DEFAULT_HUES.contains(&resolved[3]));
    assert_ne!(resolved[1], resolved[3]);

    assert_eq!(motion.get_tracker_hue(0), Ok(100));
    assert_eq!(motion.get_tracker_hue(1), Ok(resolved[1]));
    assert_eq!(motion.get_tracker_hue(2), Err(GuestError::NotAHue));
    assert_eq!(motion.get_all_trackable_hues().unwrap().iter().filter(|t| **t).count(), 360);
}

#[test]
fn forced_color_replaces_tracked_hue() {
    let h = harness(PeripheralSettings::default(), None, InputBackend::Null);
    let motion = h.hub.motion();
    motion.init(1).unwrap();

    let resolved = motion
        .track_hues(&[DONT_CARE_HUE, DONT_TRACK_HUE, DONT_TRACK_HUE, DONT_TRACK_HUE])
        .unwrap();
    assert_eq!(resolved[0], DEFAULT_HUES[0]);

    motion.force_color(0, 1.0, 0.0, 0.0).unwrap();
    assert_eq!(motion.get_rgb(0), Ok((1.0, 0.0, 0.0)));
    assert_eq!(motion.get_tracker_hue(0), Err(GuestError::NotAHue));
    assert_eq!(motion.force_color(0, 1.5, 0.0, 0.0), Err(GuestError::Param));
}

#[test]
fn calibration_holds_for_the_dwell_time() {
    let mut settings = PeripheralSettings::default();
    settings.motion.calibration_dwell_ms = 200;
    let feed = PointerFeed::new();
    let h = harness(settings, None, InputBackend::Pointer(feed.clone()));
    let motion = h.hub.motion();
    motion.init(1).unwrap();

    assert_eq!(motion.calibrate(0), Err(GuestError::NotConnected));
    feed.connect(0, 1000, 1000);
    assert!(wait_until(WAIT, || motion.get_info().map(|i| i.now_connect == 1).unwrap_or(false)));

    let started = Instant::now();
    motion.calibrate(0).unwrap();
    assert_eq!(
        motion.get_state(0, 0, 0).unwrap().0,
        ControllerStatus::SphereCalibrating
    );
    assert!(wait_until(WAIT, || {
        motion.get_state(0, 0, 0).map(|(s, _)| s != ControllerStatus::SphereCalibrating).unwrap_or(false)
    }));
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_eq!(motion.get_state(0, 0, 0).unwrap().0, ControllerStatus::HueNotSet);
    assert_eq!(
        motion.get_status_flags(0),
        Ok(CALIBRATION_OCCURRED | CALIBRATION_SUCCEEDED)
    );
}

#[test]
fn pointer_drives_buttons_and_image_position() {
    let feed = PointerFeed::new();
    let h = harness(PeripheralSettings::default(), None, InputBackend::Pointer(feed.clone()));
    let motion = h.hub.motion();
    motion.init(1).unwrap();
    feed.connect(0, 1000, 1000);
    assert!(wait_until(WAIT, || motion.get_info().map(|i| i.now_connect == 1).unwrap_or(false)));
    motion
        .track_hues(&[DONT_CARE_HUE, DONT_TRACK_HUE, DONT_TRACK_HUE, DONT_TRACK_HUE])
        .unwrap();

    feed.move_to(0, 250, 750);
    feed.set_button(0, HostButton::MouseLeft, true);

    let (_, state) = motion.get_state(0, 0, 0).unwrap();
    assert_eq!(state.pad.digital_buttons & GemButton::T.bit(), GemButton::T.bit());
    assert_eq!(state.pad.analog_t, 255);

    let (_, image) = motion.get_image_state(0).unwrap();
    assert_eq!((image.u, image.v), (160.0, 360.0));
    assert!(image.visible);

    feed.move_to(0, 1000, 500);
    let (_, image) = motion.get_image_state(0).unwrap();
    assert_eq!(image.u, 640.0);
    assert!(!image.visible);
}

#[test]
fn video_conversion_runs_once_and_finish_returns() {
    let h = harness(
        PeripheralSettings::default(),
        Some(Box::new(PatternCamera::new())),
        InputBackend::Null,
    );
    let camera = h.hub.camera();
    let motion = h.hub.motion();
    camera.initialize().unwrap();
    let info = camera.open(0, 5, 2, 60).unwrap();
    camera.start(0).unwrap();
    motion.init(1).unwrap();
    assert!(wait_until(WAIT, || camera.read(0).map(|r| r.frame_number > 0).unwrap_or(false)));

    let size = OutputFormat::Yuyv.output_size(320, 240) as u32;
    let output = h.memory.alloc(size, convert::OUTPUT_ALIGN).unwrap();
    motion
        .prepare_video_convert(ConvertAttributes {
            output_format: OutputFormat::Yuyv,
            output_addr: output,
            ..ConvertAttributes::default()
        })
        .unwrap();

    assert_eq!(motion.convert_video_finish(), Err(GuestError::ConvertNotStarted));
    motion.convert_video_start(info.buffers[0].addr).unwrap();
    motion.convert_video_finish().unwrap();
    assert_eq!(motion.conversions_completed(), 1);
    assert_eq!(motion.convert_video_finish(), Err(GuestError::ConvertNotStarted));

    let converted = h.memory.read(output, size as usize).unwrap();
    assert!(converted.iter().any(|b| *b != 0));
}

#[test]
fn transcode_rejects_mismatched_buffers() {
    let src = vec![0u8; 8 * 8 * 4];
    let mut dst = vec![7u8; 10];
    let attrs = ConvertAttributes {
        output_format: OutputFormat::Rgba,
        output_addr: 0x1000,
        ..ConvertAttributes::default()
    };
    assert!(matches!(
        convert::transcode(&src, CameraFormat::Rgba, 8, 8, &mut dst, &attrs, &[]),
        Err(ConvertError::OutputSize { .. })
    ));
    assert!(dst.iter().all(|b| *b == 7));
}

#[test]
fn tracked_sphere_is_located_in_camera_frames() {
    let device = SimulatedTrackedDevice::new(1);
    device.plug(6);
    let h = harness(
        PeripheralSettings::default(),
        Some(Box::new(PatternCamera::new())),
        InputBackend::Real(Box::new(device.clone())),
    );
    let camera = h.hub.camera();
    let motion = h.hub.motion();
    camera.initialize().unwrap();
    camera.open(0, 5, 2, 60).unwrap();
    camera.start(0).unwrap();
    motion.init(1).unwrap();
    assert!(wait_until(WAIT, || motion.get_info().map(|i| i.now_connect == 1).unwrap_or(false)));
    assert_eq!(motion.get_info().unwrap().port[0], 7);

    motion
        .track_hues(&[240, DONT_TRACK_HUE, DONT_TRACK_HUE, DONT_TRACK_HUE])
        .unwrap();
    let (r, g, b) = device.sphere_color(6).unwrap();
    assert!(b > 0.99 && r < 0.01 && g < 0.01);

    assert!(wait_until(WAIT, || {
        motion.tracked_position(0).map(|p| p.radius_valid).unwrap_or(false)
    }));
    let position = motion.tracked_position(0).unwrap();
    assert!((position.x - 160.0).abs() < 1.5);
    assert!((position.y - 120.0).abs() < 1.5);
    assert!((position.radius - 12.0).abs() < 1.0);

    let (status, image) = motion.get_image_state(0).unwrap();
    assert_eq!(status, ControllerStatus::SphereNotCalibrated);
    assert!(image.visible);
}

#[test]
fn marker_conversion_uses_the_current_tracking_pass() {
    let device = SimulatedTrackedDevice::new(1);
    device.plug(6);
    let h = harness(
        PeripheralSettings::default(),
        Some(Box::new(PatternCamera::new())),
        InputBackend::Real(Box::new(device.clone())),
    );
    let camera = h.hub.camera();
    let motion = h.hub.motion();
    camera.initialize().unwrap();
    let info = camera.open(0, 5, 2, 60).unwrap();
    camera.start(0).unwrap();
    motion.init(1).unwrap();
    assert!(wait_until(WAIT, || motion.get_info().map(|i| i.now_connect == 1).unwrap_or(false)));

    motion
        .track_hues(&[240, DONT_TRACK_HUE, DONT_TRACK_HUE, DONT_TRACK_HUE])
        .unwrap();
    let hues_set_at = camera.read(0).map(|r| r.frame_number).unwrap_or(0);
    assert!(wait_until(WAIT, || {
        camera.read(0).map(|r| r.frame_number > hues_set_at + 1).unwrap_or(false)
    }));

    let size = OutputFormat::Rgba.output_size(320, 240) as u32;
    let output = h.memory.alloc(size, convert::OUTPUT_ALIGN).unwrap();
    motion
        .prepare_video_convert(ConvertAttributes {
            output_format: OutputFormat::Rgba,
            flags: convert::FLAG_DRAW_MARKERS,
            output_addr: output,
            ..ConvertAttributes::default()
        })
        .unwrap();
    camera.read(0).unwrap();
    motion.convert_video_start(info.buffers[0].addr).unwrap();
    motion.convert_video_finish().unwrap();

    let converted = h.memory.read(output, size as usize).unwrap();
    let white = converted
        .chunks_exact(4)
        .filter(|px| px[..3] == [255, 255, 255])
        .count();
    assert!(white >= 9, "marker cross missing, {} white pixels", white);
}

#[test]
fn frame_work_leaves_the_async_runtime_responsive() {
    let device = SimulatedTrackedDevice::new(1);
    device.plug(6);
    let h = harness_with_workers(
        PeripheralSettings::default(),
        Some(Box::new(PatternCamera::new())),
        InputBackend::Real(Box::new(device.clone())),
        1,
    );
    let camera = h.hub.camera();
    let motion = h.hub.motion();
    camera.initialize().unwrap();
    camera.open(0, 5, 1, 30).unwrap();
    camera.start(0).unwrap();
    motion.init(1).unwrap();
    motion
        .track_hues(&[240, DONT_TRACK_HUE, DONT_TRACK_HUE, DONT_TRACK_HUE])
        .unwrap();
    assert!(wait_until(WAIT, || camera.read(0).map(|r| r.frame_number > 3).unwrap_or(false)));

    let longest_gap = h.rt.block_on(h.rt.spawn(async {
        let mut longest = Duration::ZERO;
        let mut last = Instant::now();
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            longest = longest.max(last.elapsed());
            last = Instant::now();
        }
        longest
    }));
    let longest_gap = longest_gap.unwrap();
    assert!(longest_gap < Duration::from_millis(250), "timer stalled for {:?}", longest_gap);
}
