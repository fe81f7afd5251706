use crate::camera::frame::{FrameDescriptor, FrameExchange};
use crate::camera::types::CameraFormat;
use crate::motion::convert::decode_rgb;
use crate::motion::manager::MotionManager;
use crate::motion::types::{rgb_to_hsv, MAX_CONTROLLERS};
use crate::persistence::TrackingSettings;
use chrono::Local;
use statum::{machine, state};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Number of histogram buckets, one per hue degree
pub const HUE_BUCKETS: usize = 360;

/// What the segmenter should look for on behalf of one controller
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct HueTarget {
    pub active: bool,
    pub hue: f32,
    pub hue_threshold: f32,
    pub saturation_threshold: f32,
}

/// A hue-matching blob fit to a circle, in image pixels
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Blob {
    pub x: f32,
    pub y: f32,
    pub radius: f32,
    pub valid: bool,
}

/// Per-frame segmentation result
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentOutput {
    pub blobs: [Option<Blob>; MAX_CONTROLLERS],
    /// Saturated pixel count per hue degree
    pub histogram: Vec<u32>,
    pub total_pixels: u64,
}

/// Image hue-segmentation routine
pub trait HueSegmenter: Send {
    /// Locate one blob per active target in `frame`.
    ///
    /// Returns `None` when the frame cannot be interpreted.
    fn segment(
        &mut self,
        frame: &[u8],
        format: CameraFormat,
        width: u32,
        height: u32,
        targets: &[HueTarget; MAX_CONTROLLERS],
    ) -> Option<SegmentOutput>;
}

/// Reference segmenter: centroid of all matching pixels, radius from area
#[derive(Debug, Clone)]
pub struct HueCentroidSegmenter {
    pub min_radius: f32,
    pub max_radius: f32,
    pub value_threshold: f32,
}

impl HueCentroidSegmenter {
    pub fn new(settings: &TrackingSettings) -> Self {
        Self {
            min_radius: settings.min_radius_px,
            max_radius: settings.max_radius_px,
            value_threshold: settings.value_threshold,
        }
    }
}

/// Angular distance between two hues in degrees
pub fn hue_distance(a: f32, b: f32) -> f32 {
    let d = (a - b).rem_euclid(360.0);
    d.min(360.0 - d)
}

impl HueSegmenter for HueCentroidSegmenter {
    fn segment(
        &mut self,
        frame: &[u8],
        format: CameraFormat,
        width: u32,
        height: u32,
        targets: &[HueTarget; MAX_CONTROLLERS],
    ) -> Option<SegmentOutput> {
        let rgb = decode_rgb(frame, format, width, height).ok()?;
        let w = width as usize;
        let mut histogram = vec![0u32; HUE_BUCKETS];
        // (sum x, sum y, count) per target
        let mut sums = [(0f64, 0f64, 0u64); MAX_CONTROLLERS];

        for (i, px) in rgb.iter().enumerate() {
            let (h, s, v) = rgb_to_hsv(
                px[0] as f32 / 255.0,
                px[1] as f32 / 255.0,
                px[2] as f32 / 255.0,
            );
            if v < self.value_threshold {
                continue;
            }
            if s >= 0.25 {
                histogram[(h.round() as usize) % HUE_BUCKETS] += 1;
            }
            for (target, sum) in targets.iter().zip(sums.iter_mut()) {
                if target.active
                    && s >= target.saturation_threshold
                    && hue_distance(h, target.hue) <= target.hue_threshold
                {
                    sum.0 += (i % w) as f64 + 0.5;
                    sum.1 += (i / w) as f64 + 0.5;
                    sum.2 += 1;
                }
            }
        }

        let mut blobs = [None; MAX_CONTROLLERS];
        for ((target, sum), blob) in targets.iter().zip(sums).zip(blobs.iter_mut()) {
            if !target.active || sum.2 == 0 {
                continue;
            }
            let n = sum.2 as f64;
            let radius = (n / std::f64::consts::PI).sqrt() as f32;
            *blob = Some(Blob {
                x: (sum.0 / n) as f32,
                y: (sum.1 / n) as f32,
                radius,
                valid: radius >= self.min_radius && radius <= self.max_radius,
            });
        }

        Some(SegmentOutput {
            blobs,
            histogram,
            total_pixels: rgb.len() as u64,
        })
    }
}

/// One frame queued for segmentation
#[derive(Debug, Clone)]
pub struct FrameJob {
    pub descriptor: FrameDescriptor,
    pub data: Arc<Vec<u8>>,
    pub targets: [HueTarget; MAX_CONTROLLERS],
}

/// Segmentation result waiting to be published
#[derive(Debug, Clone)]
pub struct PassResult {
    pub descriptor: FrameDescriptor,
    pub output: Option<SegmentOutput>,
}

#[state]
#[derive(Debug, Clone)]
pub enum TrackingState {
    Waiting,
    Segmenting(FrameJob),
    Publishing(PassResult),
}

#[machine]
pub struct TrackingPass<S: TrackingState> {
    manager: Arc<MotionManager>,
    frames: Arc<FrameExchange>,
    segmenter: Box<dyn HueSegmenter>,
    settings: TrackingSettings,
    last_frame: u64,
}

impl TrackingPass<Waiting> {
    pub fn create(
        manager: Arc<MotionManager>,
        frames: Arc<FrameExchange>,
        segmenter: Box<dyn HueSegmenter>,
        settings: TrackingSettings,
    ) -> Self {
        info!("Creating tracking worker with settings: {:?}", settings);
        Self::new(manager, frames, segmenter, settings, 0)
    }

    /// Sleep until a new frame is published. Frames arriving while the
    /// tracked backend is inactive complete a pass immediately.
    pub async fn wait_for_frame(
        mut self,
        cancel: &CancellationToken,
    ) -> Option<TrackingPass<Segmenting>> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = self.frames.next_frame() => {}
            }

            let (descriptor, data) = self.frames.latest();
            if descriptor.frame_number == self.last_frame || data.is_empty() {
                continue;
            }
            self.last_frame = descriptor.frame_number;

            if !self.manager.tracking_active() {
                self.manager.publish_tracking(&descriptor, None);
                continue;
            }

            let targets = self.manager.tracking_targets(&self.settings);
            debug!("Tracking frame {}", descriptor.frame_number);
            return Some(self.transition_with(FrameJob {
                descriptor,
                data,
                targets,
            }));
        }
    }
}

impl TrackingPass<Segmenting> {
    pub fn segment(mut self) -> TrackingPass<Publishing> {
        let Some(job) = self.get_state_data().cloned() else {
            return self.transition_with(PassResult {
                descriptor: FrameDescriptor::default(),
                output: None,
            });
        };

        let output = match job.descriptor.format {
            Some(format) => self.segmenter.segment(
                &job.data,
                format,
                job.descriptor.width,
                job.descriptor.height,
                &job.targets,
            ),
            None => None,
        };
        if output.is_none() {
            debug!("Frame {} could not be segmented", job.descriptor.frame_number);
        }
        self.transition_with(PassResult {
            descriptor: job.descriptor,
            output,
        })
    }
}

impl TrackingPass<Publishing> {
    pub fn publish(self) -> TrackingPass<Waiting> {
        if let Some(result) = self.get_state_data() {
            self.manager.publish_tracking(&result.descriptor, result.output.as_ref());
        }
        self.transition()
    }
}

/// Spawn the tracking worker on `handle`
pub fn spawn_tracker(
    manager: Arc<MotionManager>,
    frames: Arc<FrameExchange>,
    segmenter: Box<dyn HueSegmenter>,
    settings: TrackingSettings,
    cancel: CancellationToken,
    handle: &Handle,
) -> JoinHandle<()> {
    let pass = TrackingPass::create(manager, frames, segmenter, settings);
    info!("Spawning tracking task");
    handle.spawn(async move {
        run_tracking_loop(pass, cancel).await;
        info!("Tracking task finished");
    })
}

async fn run_tracking_loop(mut pass: TrackingPass<Waiting>, cancel: CancellationToken) {
    let mut passes: u64 = 0;
    let mut last_stats_time = Local::now();
    let stats_interval = chrono::Duration::seconds(30);

    loop {
        let Some(segmenting) = pass.wait_for_frame(&cancel).await else {
            debug!("Tracking loop cancelled");
            break;
        };
        let publishing = match tokio::task::spawn_blocking(move || segmenting.segment()).await {
            Ok(publishing) => publishing,
            Err(e) => {
                error!("Segmentation pass failed: {}", e);
                break;
            }
        };
        pass = publishing.publish();
        passes += 1;

        let now = Local::now();
        if now - last_stats_time > stats_interval {
            let elapsed_seconds = (now - last_stats_time).num_seconds().max(1);
            info!(
                "Tracking stats: {} passes in {} seconds ({:.2}/sec)",
                passes,
                elapsed_seconds,
                passes as f64 / elapsed_seconds as f64
            );
            passes = 0;
            last_stats_time = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with_square(w: usize, h: usize, rgb: [u8; 3], x0: usize, y0: usize, side: usize) -> Vec<u8> {
        let mut data = vec![0u8; w * h * 4];
        for y in 0..h {
            for x in 0..w {
                let i = (y * w + x) * 4;
                let px = if (x0..x0 + side).contains(&x) && (y0..y0 + side).contains(&y) {
                    rgb
                } else {
                    [90, 90, 90]
                };
                data[i..i + 4].copy_from_slice(&[px[0], px[1], px[2], 255]);
            }
        }
        data
    }

    fn target(hue: f32) -> HueTarget {
        HueTarget {
            active: true,
            hue,
            hue_threshold: 10.0,
            saturation_threshold: 0.4,
        }
    }

    #[test]
    fn hue_distance_wraps() {
        assert_eq!(hue_distance(350.0, 10.0), 20.0);
        assert_eq!(hue_distance(0.0, 180.0), 180.0);
    }

    #[test]
    fn centroid_finds_square() {
        let frame = frame_with_square(64, 48, [0, 0, 255], 10, 20, 8);
        let mut seg = HueCentroidSegmenter {
            min_radius: 1.0,
            max_radius: 30.0,
            value_threshold: 0.2,
        };
        let targets = [target(240.0), target(120.0), HueTarget::default(), HueTarget::default()];
        let out = seg.segment(&frame, CameraFormat::Rgba, 64, 48, &targets).unwrap();

        let blob = out.blobs[0].unwrap();
        assert!((blob.x - 14.0).abs() < 1e-3);
        assert!((blob.y - 24.0).abs() < 1e-3);
        assert!((blob.radius - (64.0f32 / std::f32::consts::PI).sqrt()).abs() < 1e-3);
        assert!(blob.valid);
        assert!(out.blobs[1].is_none());
        assert_eq!(out.histogram[240], 64);
        assert_eq!(out.total_pixels, 64 * 48);
    }

    #[test]
    fn radius_outside_bounds_is_invalid() {
        let frame = frame_with_square(64, 48, [255, 0, 0], 0, 0, 40);
        let mut seg = HueCentroidSegmenter {
            min_radius: 1.0,
            max_radius: 5.0,
            value_threshold: 0.2,
        };
        let targets = [target(0.0), HueTarget::default(), HueTarget::default(), HueTarget::default()];
        let out = seg.segment(&frame, CameraFormat::Rgba, 64, 48, &targets).unwrap();
        assert!(!out.blobs[0].unwrap().valid);
    }
}
