//! Motion controller manager
//!
//! Owns the per-controller state and answers every guest-facing controller
//! call. The update worker ([`crate::motion::update`]) drives connection
//! refresh, calibration and video conversion through the `*_tick` methods;
//! the tracking worker writes positions through [`MotionManager::publish_tracking`].
//!
//! Lock layout, always taken in this order and never more than one of the
//! first three at a time during polling calls:
//!
//! - `config`: hue/RGB/rumble/calibration/connection for all controllers
//! - `backend`: the active host input backend
//! - `tracking`: positions, radii and the hue histogram from the tracker
//! - `convert`: the single in-flight video conversion, with its own condvar

use crate::camera::frame::{FrameDescriptor, FrameExchange};
use crate::error::{GuestError, GuestResult};
use crate::guest::GuestMemory;
use crate::mapping::buttons::{map_buttons, ButtonMap, MappingSettings};
use crate::mapping::position::{distance_from_radius, pose_from_pointer, pose_from_tracker, FusedPose};
use crate::motion::backend::{InputBackend, InputBackendKind, PadInput};
use crate::motion::convert::{self, ConvertAttributes, OutputFormat};
use crate::motion::tracker::{HueTarget, SegmentOutput, HUE_BUCKETS};
use crate::motion::types::*;
use crate::persistence::{MotionSettings, TrackingSettings};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Work memory the guest reserves for the subsystem
const MEMORY_BASE: u32 = 0x10_0000;
const MEMORY_PER_CONTROLLER: u32 = 0x1_0000;

/// Poll interval of a blocked `ConvertVideoFinish`
const FINISH_POLL: Duration = Duration::from_millis(20);

/// Longest a marker conversion waits for the current frame's tracking pass
const MARKER_PASS_WAIT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub(crate) struct ManagerState {
    pub(crate) initialized: bool,
    pub(crate) max_connect: u32,
    pub(crate) controllers: [ControllerState; MAX_CONTROLLERS],
    pub(crate) convert_attributes: ConvertAttributes,
    pub(crate) init_time: Option<Instant>,
}

impl Default for ManagerState {
    fn default() -> Self {
        Self {
            initialized: false,
            max_connect: 0,
            controllers: Default::default(),
            convert_attributes: ConvertAttributes::default(),
            init_time: None,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct TrackerOutput {
    pub(crate) positions: [TrackedPosition; MAX_CONTROLLERS],
    pub(crate) histogram: Vec<u32>,
    pub(crate) total_pixels: u64,
    pub(crate) last_frame: u64,
    pub(crate) passes: u64,
}

impl Default for TrackerOutput {
    fn default() -> Self {
        Self {
            positions: Default::default(),
            histogram: vec![0; HUE_BUCKETS],
            total_pixels: 0,
            last_frame: 0,
            passes: 0,
        }
    }
}

/// Progress of the single in-flight video conversion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConvertPhase {
    #[default]
    Idle,
    /// Waiting for the update worker
    Pending,
    /// Pending when a snapshot was taken; completes on the first tick after restore
    Restored,
    /// Worker finished, waiting for `ConvertVideoFinish`
    Done,
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ConvertSlot {
    pub(crate) phase: ConvertPhase,
    pub(crate) source_addr: u32,
    pub(crate) completed: u64,
}

/// The controller manager
pub struct MotionManager {
    settings: MotionSettings,
    tracking_settings: TrackingSettings,
    mapping: MappingSettings,
    kind: InputBackendKind,
    frames: std::sync::Arc<FrameExchange>,
    memory: std::sync::Arc<dyn GuestMemory>,
    cancel: CancellationToken,

    config: Mutex<ManagerState>,
    backend: Mutex<InputBackend>,
    tracking: Mutex<TrackerOutput>,
    tracking_done: Condvar,
    convert: Mutex<ConvertSlot>,
    convert_done: Condvar,
    wake: Notify,
    inertial_counter: AtomicU32,
}

fn poisoned<T>(e: std::sync::PoisonError<T>) -> GuestError {
    error!("Motion manager lock poisoned: {}", e);
    GuestError::Fatal
}

impl MotionManager {
    pub fn new(
        settings: MotionSettings,
        tracking_settings: TrackingSettings,
        mapping: MappingSettings,
        backend: InputBackend,
        frames: std::sync::Arc<FrameExchange>,
        memory: std::sync::Arc<dyn GuestMemory>,
        cancel: CancellationToken,
    ) -> Self {
        let kind = backend.kind();
        info!("Creating motion manager with {:?} backend", kind);
        if let Err(e) = mapping.validate() {
            warn!("Button mapping is not valid, some buttons stay unmapped: {}", e);
        }
        Self {
            settings,
            tracking_settings,
            mapping,
            kind,
            frames,
            memory,
            cancel,
            config: Mutex::new(ManagerState::default()),
            backend: Mutex::new(backend),
            tracking: Mutex::new(TrackerOutput::default()),
            tracking_done: Condvar::new(),
            convert: Mutex::new(ConvertSlot::default()),
            convert_done: Condvar::new(),
            wake: Notify::new(),
            inertial_counter: AtomicU32::new(0),
        }
    }

    pub fn backend_kind(&self) -> InputBackendKind {
        self.kind
    }

    pub fn settings(&self) -> &MotionSettings {
        &self.settings
    }

    fn lock_config(&self) -> GuestResult<MutexGuard<'_, ManagerState>> {
        self.config.lock().map_err(poisoned)
    }

    fn lock_backend(&self) -> GuestResult<MutexGuard<'_, InputBackend>> {
        self.backend.lock().map_err(poisoned)
    }

    fn lock_tracking(&self) -> GuestResult<MutexGuard<'_, TrackerOutput>> {
        self.tracking.lock().map_err(poisoned)
    }

    fn check_init(state: &ManagerState) -> GuestResult<()> {
        if state.initialized {
            Ok(())
        } else {
            Err(GuestError::Uninitialized)
        }
    }

    fn check_id(state: &ManagerState, id: u32) -> GuestResult<usize> {
        Self::check_init(state)?;
        if id >= state.max_connect {
            return Err(GuestError::Param);
        }
        Ok(id as usize)
    }

    fn timestamp_us(state: &ManagerState) -> u64 {
        state
            .init_time
            .map(|t| t.elapsed().as_micros() as u64)
            .unwrap_or(0)
    }

    fn button_map(&self) -> ButtonMap {
        self.mapping.for_kind(self.kind).cloned().unwrap_or_default()
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    pub fn init(&self, max_connect: u32) -> GuestResult<()> {
        if max_connect == 0 || max_connect as usize > MAX_CONTROLLERS {
            return Err(GuestError::Param);
        }
        let mut state = self.lock_config()?;
        if state.initialized {
            return Err(GuestError::AlreadyInitialized);
        }
        *state = ManagerState {
            initialized: true,
            max_connect,
            init_time: Some(Instant::now()),
            ..ManagerState::default()
        };
        drop(state);

        *self.lock_tracking()? = TrackerOutput::default();
        if let Ok(mut slot) = self.convert.lock() {
            *slot = ConvertSlot::default();
        }
        info!("Motion controllers initialized (max {})", max_connect);
        self.wake.notify_one();
        Ok(())
    }

    pub fn end(&self) -> GuestResult<()> {
        let mut state = self.lock_config()?;
        Self::check_init(&state)?;
        *state = ManagerState::default();
        drop(state);

        if let Ok(mut slot) = self.convert.lock() {
            slot.phase = ConvertPhase::Idle;
        }
        self.convert_done.notify_all();
        info!("Motion controllers shut down");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.config.lock().map(|s| s.initialized).unwrap_or(false)
    }

    pub fn get_memory_size(&self, max_connect: u32) -> GuestResult<u32> {
        if max_connect == 0 || max_connect as usize > MAX_CONTROLLERS {
            return Err(GuestError::Param);
        }
        Ok(MEMORY_BASE + max_connect * MEMORY_PER_CONTROLLER)
    }

    pub fn get_info(&self) -> GuestResult<GemInfo> {
        let state = self.lock_config()?;
        Self::check_init(&state)?;
        let mut info = GemInfo {
            max_connect: state.max_connect,
            ..GemInfo::default()
        };
        for (i, ctrl) in state.controllers.iter().enumerate() {
            info.status[i] = ctrl.status;
            info.port[i] = ctrl.port;
            if i < state.max_connect as usize && ctrl.is_connected() {
                info.now_connect += 1;
            }
        }
        Ok(info)
    }

    /// Reset one controller to defaults, keeping its connection
    pub fn reset(&self, id: u32) -> GuestResult<()> {
        let mut state = self.lock_config()?;
        let slot = Self::check_id(&state, id)?;
        state.controllers[slot].reset_keep_connection();
        drop(state);
        self.lock_tracking()?.positions[slot] = TrackedPosition::default();
        debug!("Controller {} reset", slot);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Calibration
    // ---------------------------------------------------------------------

    pub fn calibrate(&self, id: u32) -> GuestResult<()> {
        let mut state = self.lock_config()?;
        let slot = Self::check_id(&state, id)?;
        let ctrl = &mut state.controllers[slot];
        if !ctrl.is_connected() {
            return Err(GuestError::NotConnected);
        }
        if ctrl.is_calibrating {
            return Err(GuestError::Busy);
        }
        ctrl.is_calibrating = true;
        ctrl.calibration_start = Some(Instant::now());
        ctrl.calibration_confirmed = false;
        ctrl.calibrated = false;

        if self.kind == InputBackendKind::Real {
            let mut backend = self.lock_backend()?;
            if let Some(device) = backend.tracked() {
                device.request_calibration(self.kind.device_for_slot(slot));
            }
        }
        info!("Controller {} calibrating", slot);
        Ok(())
    }

    pub fn invalidate_calibration(&self, id: u32) -> GuestResult<()> {
        let mut state = self.lock_config()?;
        let slot = Self::check_id(&state, id)?;
        let ctrl = &mut state.controllers[slot];
        ctrl.calibrated = false;
        ctrl.calibration_flags = 0;
        ctrl.enabled_magnetometer = false;
        debug!("Controller {} calibration invalidated", slot);
        Ok(())
    }

    pub fn get_status_flags(&self, id: u32) -> GuestResult<u64> {
        let state = self.lock_config()?;
        let slot = Self::check_id(&state, id)?;
        Ok(state.controllers[slot].calibration_flags)
    }

    pub fn clear_status_flags(&self, id: u32, mask: u64) -> GuestResult<()> {
        let mut state = self.lock_config()?;
        let slot = Self::check_id(&state, id)?;
        state.controllers[slot].calibration_flags &= !mask;
        Ok(())
    }

    pub fn enable_magnetometer(&self, id: u32, enable: bool) -> GuestResult<()> {
        let mut state = self.lock_config()?;
        let slot = Self::check_id(&state, id)?;
        let ctrl = &mut state.controllers[slot];
        if !ctrl.is_connected() {
            return Err(GuestError::NotConnected);
        }
        if !ctrl.calibrated {
            return Err(GuestError::NotCalibrated);
        }
        ctrl.enabled_magnetometer = enable;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Colour and hue
    // ---------------------------------------------------------------------

    fn push_sphere_color(&self, slot: usize, rgb: (f32, f32, f32)) {
        if self.kind != InputBackendKind::Real {
            return;
        }
        if let Ok(mut backend) = self.backend.lock() {
            if let Some(device) = backend.tracked() {
                device.set_sphere_color(self.kind.device_for_slot(slot), rgb);
            }
        }
    }

    pub fn force_color(&self, id: u32, r: f32, g: f32, b: f32) -> GuestResult<()> {
        if [r, g, b].iter().any(|c| !(0.0..=1.0).contains(c)) {
            return Err(GuestError::Param);
        }
        let mut state = self.lock_config()?;
        let slot = Self::check_id(&state, id)?;
        let ctrl = &mut state.controllers[slot];
        ctrl.rgb = (r, g, b);
        ctrl.hue_set = false;
        ctrl.enabled_tracking = false;
        drop(state);

        self.push_sphere_color(slot, (r, g, b));
        debug!("Controller {} colour forced to ({}, {}, {})", slot, r, g, b);
        Ok(())
    }

    pub fn get_rgb(&self, id: u32) -> GuestResult<(f32, f32, f32)> {
        let state = self.lock_config()?;
        let slot = Self::check_id(&state, id)?;
        Ok(state.controllers[slot].rgb)
    }

    pub fn get_tracker_hue(&self, id: u32) -> GuestResult<u32> {
        let state = self.lock_config()?;
        let slot = Self::check_id(&state, id)?;
        let ctrl = &state.controllers[slot];
        if !ctrl.enabled_tracking || !ctrl.hue_set || ctrl.hue > 359 {
            return Err(GuestError::NotAHue);
        }
        Ok(ctrl.hue)
    }

    fn crowded_hues(&self) -> [bool; HUE_BUCKETS] {
        let mut crowded = [false; HUE_BUCKETS];
        if let Ok(tracking) = self.tracking.lock() {
            if tracking.total_pixels > 0 {
                let limit = self.tracking_settings.crowded_fraction * tracking.total_pixels as f32;
                for (flag, count) in crowded.iter_mut().zip(&tracking.histogram) {
                    *flag = *count as f32 >= limit;
                }
            }
        }
        crowded
    }

    /// Resolve requested hues. Sentinels auto-assign, stop or keep tracking.
    pub fn track_hues(&self, requested: &[u32; MAX_CONTROLLERS]) -> GuestResult<[u32; MAX_CONTROLLERS]> {
        for hue in requested {
            let sentinel = matches!(*hue, DONT_TRACK_HUE | DONT_CARE_HUE | DONT_CHANGE_HUE);
            if !sentinel && *hue > 359 {
                return Err(GuestError::Param);
            }
        }
        let crowded = self.crowded_hues();

        let mut state = self.lock_config()?;
        Self::check_init(&state)?;

        let mut resolved = [DONT_TRACK_HUE; MAX_CONTROLLERS];
        let mut recolored = Vec::new();
        for slot in 0..MAX_CONTROLLERS {
            let hue = match requested[slot] {
                DONT_TRACK_HUE => None,
                DONT_CHANGE_HUE => {
                    let ctrl = &state.controllers[slot];
                    if ctrl.hue_set {
                        resolved[slot] = ctrl.hue;
                    }
                    continue;
                }
                DONT_CARE_HUE => {
                    let taken: Vec<u32> = requested
                        .iter()
                        .copied()
                        .filter(|h| *h <= 359)
                        .chain(resolved[..slot].iter().copied().filter(|h| *h <= 359))
                        .collect();
                    let pick = (0..MAX_CONTROLLERS)
                        .map(|k| DEFAULT_HUES[(slot + k) % MAX_CONTROLLERS])
                        .find(|h| !taken.contains(h) && !crowded[*h as usize])
                        .unwrap_or(DEFAULT_HUES[slot]);
                    Some(pick)
                }
                explicit => Some(explicit),
            };

            let ctrl = &mut state.controllers[slot];
            match hue {
                Some(hue) => {
                    ctrl.hue = hue;
                    ctrl.hue_set = true;
                    ctrl.enabled_tracking = true;
                    ctrl.rgb = hue_to_rgb(hue as f32);
                    resolved[slot] = hue;
                    recolored.push((slot, ctrl.rgb));
                }
                None => {
                    ctrl.hue_set = false;
                    ctrl.enabled_tracking = false;
                }
            }
        }
        drop(state);

        for (slot, rgb) in recolored {
            self.push_sphere_color(slot, rgb);
        }
        debug!("Tracked hues resolved to {:?}", resolved);
        Ok(resolved)
    }

    pub fn get_all_trackable_hues(&self) -> GuestResult<[bool; HUE_BUCKETS]> {
        Self::check_init(&*self.lock_config()?)?;
        let crowded = self.crowded_hues();
        let mut trackable = [true; HUE_BUCKETS];
        for (t, c) in trackable.iter_mut().zip(crowded) {
            *t = !c;
        }
        Ok(trackable)
    }

    // ---------------------------------------------------------------------
    // Rumble
    // ---------------------------------------------------------------------

    pub fn set_rumble(&self, id: u32, intensity: u8) -> GuestResult<()> {
        let mut state = self.lock_config()?;
        let slot = Self::check_id(&state, id)?;
        state.controllers[slot].rumble = intensity;
        drop(state);
        self.lock_backend()?
            .set_rumble(self.kind.device_for_slot(slot), intensity);
        Ok(())
    }

    pub fn get_rumble(&self, id: u32) -> GuestResult<u8> {
        let state = self.lock_config()?;
        let slot = Self::check_id(&state, id)?;
        Ok(state.controllers[slot].rumble)
    }

    // ---------------------------------------------------------------------
    // State queries
    // ---------------------------------------------------------------------

    fn frame_geometry(&self) -> (u32, u32) {
        let desc = self.frames.descriptor();
        (desc.width.max(1), desc.height.max(1))
    }

    /// Fuse backend input and tracker output for one controller slot
    fn fuse(&self, slot: usize) -> GuestResult<(PadInput, FusedPose, Option<[f32; 4]>)> {
        let device = self.kind.device_for_slot(slot);
        let (input, pointer, sensors) = {
            let backend = self.lock_backend()?;
            (
                backend.get_buttons(device).unwrap_or_default(),
                backend.get_position(device),
                backend.sensors(device),
            )
        };
        let (width, height) = self.frame_geometry();
        let orientation = sensors.map(|s| s.orientation);

        let pose = if self.kind == InputBackendKind::Real {
            let tracked = self.lock_tracking()?.positions[slot];
            pose_from_tracker(
                tracked.x,
                tracked.y,
                tracked.radius,
                tracked.radius_valid,
                orientation,
                width,
                height,
            )
        } else if let Some(pointer) = pointer {
            pose_from_pointer(&pointer, width, height, &self.settings.pose)
        } else {
            FusedPose {
                quat: [0.0, 0.0, 0.0, 1.0],
                ..FusedPose::default()
            }
        };
        let accel = sensors.map(|s| [s.accel[0], s.accel[1], s.accel[2], 0.0]);
        Ok((input, pose, accel))
    }

    pub fn get_state(&self, id: u32, flag: u32, _time_us: u64) -> GuestResult<(ControllerStatus, GemState)> {
        StateFlag::from_guest(flag).ok_or(GuestError::Param)?;
        let (ctrl, timestamp) = {
            let state = self.lock_config()?;
            let slot = Self::check_id(&state, id)?;
            (state.controllers[slot].clone(), Self::timestamp_us(&state))
        };
        let status = ctrl.query_status();
        if status == ControllerStatus::NotConnected {
            return Ok((status, GemState::default()));
        }

        let (input, pose, accel) = self.fuse(id as usize)?;
        let pad = map_buttons(&self.button_map(), &input);
        let gem = GemState {
            pos: pose.world,
            handle_pos: pose.world,
            quat: pose.quat,
            accel: accel.unwrap_or([0.0; 4]),
            pad,
            ext: ExtData {
                status: ctrl.ext_status,
                ..ExtData::default()
            },
            timestamp,
            temperature: 25.0,
            tracking_flags: u32::from(pose.valid && ctrl.enabled_tracking),
            ..GemState::default()
        };
        Ok((status, gem))
    }

    pub fn get_image_state(&self, id: u32) -> GuestResult<(ControllerStatus, ImageState)> {
        let (ctrl, timestamp) = {
            let state = self.lock_config()?;
            let slot = Self::check_id(&state, id)?;
            (state.controllers[slot].clone(), Self::timestamp_us(&state))
        };
        let status = ctrl.query_status();
        if status == ControllerStatus::NotConnected {
            return Ok((status, ImageState::default()));
        }

        let (_, pose, _) = self.fuse(id as usize)?;
        let (width, height) = self.frame_geometry();
        let desc = self.frames.descriptor();
        let frame_timestamp = desc
            .timestamp
            .map(|t| timestamp.saturating_sub(t.elapsed().as_micros() as u64))
            .unwrap_or(0);
        let visible = pose.valid && ctrl.enabled_tracking;
        Ok((
            status,
            ImageState {
                frame_timestamp,
                timestamp,
                u: pose.u,
                v: pose.v,
                r: pose.radius,
                projection_x: pose.u / width as f32 - 0.5,
                projection_y: pose.v / height as f32 - 0.5,
                distance: pose.distance,
                visible,
                r_valid: visible,
            },
        ))
    }

    pub fn get_inertial_state(&self, id: u32, flag: u32, _index: u32) -> GuestResult<(ControllerStatus, InertialState)> {
        StateFlag::from_guest(flag).ok_or(GuestError::Param)?;
        let (ctrl, timestamp) = {
            let state = self.lock_config()?;
            let slot = Self::check_id(&state, id)?;
            (state.controllers[slot].clone(), Self::timestamp_us(&state))
        };
        let status = ctrl.query_status();
        if status == ControllerStatus::NotConnected {
            return Ok((status, InertialState::default()));
        }

        let device = self.kind.device_for_slot(id as usize);
        let (input, sensors) = {
            let backend = self.lock_backend()?;
            (
                backend.get_buttons(device).unwrap_or_default(),
                backend.sensors(device),
            )
        };
        let (accelerometer, gyro, temperature) = match sensors {
            Some(s) => (
                [s.accel[0], s.accel[1], s.accel[2], 0.0],
                [s.gyro[0], s.gyro[1], s.gyro[2], 0.0],
                s.temperature,
            ),
            // at rest, gravity along +y
            None => ([0.0, 1.0, 0.0, 0.0], [0.0; 4], 25.0),
        };
        Ok((
            status,
            InertialState {
                accelerometer,
                gyro,
                pad: map_buttons(&self.button_map(), &input),
                ext: ExtData {
                    status: ctrl.ext_status,
                    ..ExtData::default()
                },
                timestamp,
                counter: self.inertial_counter.fetch_add(1, Ordering::Relaxed),
                temperature,
                ..InertialState::default()
            },
        ))
    }

    pub fn get_camera_state(&self) -> GuestResult<FrameDescriptor> {
        Self::check_init(&*self.lock_config()?)?;
        Ok(self.frames.descriptor())
    }

    pub fn get_environment_lighting_color(&self) -> GuestResult<(ControllerStatus, [f32; 3])> {
        Self::check_init(&*self.lock_config()?)?;
        let (desc, data) = self.frames.latest();
        let color = desc
            .format
            .filter(|_| !data.is_empty())
            .and_then(|format| convert::mean_color(&data, format, desc.width, desc.height));
        Ok(match color {
            Some(c) => (ControllerStatus::Ok, c),
            None => (ControllerStatus::NoVideo, [0.0; 3]),
        })
    }

    // ---------------------------------------------------------------------
    // Video conversion
    // ---------------------------------------------------------------------

    pub fn prepare_video_convert(&self, attributes: ConvertAttributes) -> GuestResult<()> {
        attributes.validate()?;
        let mut state = self.lock_config()?;
        Self::check_init(&state)?;
        state.convert_attributes = attributes;
        debug!("Video conversion prepared: {:?}", attributes);
        Ok(())
    }

    pub fn convert_video_start(&self, source_addr: u32) -> GuestResult<()> {
        Self::check_init(&*self.lock_config()?)?;
        if source_addr == 0 {
            return Err(GuestError::Param);
        }
        if source_addr % convert::OUTPUT_ALIGN != 0 {
            return Err(GuestError::InvalidAlignment);
        }
        let mut slot = self.convert.lock().map_err(poisoned)?;
        if matches!(slot.phase, ConvertPhase::Pending | ConvertPhase::Restored) {
            return Err(GuestError::ConvertNotFinished);
        }
        slot.phase = ConvertPhase::Pending;
        slot.source_addr = source_addr;
        drop(slot);

        self.wake.notify_one();
        debug!("Video conversion queued from {:#x}", source_addr);
        Ok(())
    }

    /// Block until the queued conversion has run
    pub fn convert_video_finish(&self) -> GuestResult<()> {
        Self::check_init(&*self.lock_config()?)?;
        let mut slot = self.convert.lock().map_err(poisoned)?;
        if slot.phase == ConvertPhase::Idle {
            return Err(GuestError::ConvertNotStarted);
        }
        while matches!(slot.phase, ConvertPhase::Pending | ConvertPhase::Restored) {
            if self.cancel.is_cancelled() {
                warn!("Video conversion abandoned at shutdown");
                return Err(GuestError::Fatal);
            }
            let (guard, _) = self
                .convert_done
                .wait_timeout(slot, FINISH_POLL)
                .map_err(poisoned)?;
            slot = guard;
        }
        slot.phase = ConvertPhase::Idle;
        Ok(())
    }

    /// Conversions completed since start
    pub fn conversions_completed(&self) -> u64 {
        self.convert.lock().map(|s| s.completed).unwrap_or(0)
    }

    fn marker_positions(&self) -> Vec<(f32, f32)> {
        let (active, max) = match self.config.lock() {
            Ok(state) => (
                state
                    .controllers
                    .iter()
                    .map(|c| c.is_connected() && c.enabled_tracking)
                    .collect::<Vec<_>>(),
                state.max_connect as usize,
            ),
            Err(_) => return Vec::new(),
        };
        (0..max.min(MAX_CONTROLLERS))
            .filter(|slot| active[*slot])
            .filter_map(|slot| self.fuse(slot).ok())
            .filter(|(_, pose, _)| pose.valid)
            .map(|(_, pose, _)| (pose.u, pose.v))
            .collect()
    }

    fn transcode_into_guest(&self, source_addr: u32) {
        let attrs = match self.config.lock() {
            Ok(state) => state.convert_attributes,
            Err(_) => return,
        };
        if attrs.output_format == OutputFormat::NoVideoOutput {
            debug!("No video output requested, conversion is a no-op");
            return;
        }
        let desc = self.frames.descriptor();
        let Some(format) = desc.format else {
            warn!("Video conversion requested without an open camera");
            return;
        };
        if !convert::is_supported_source(format) {
            warn!("Camera format {:?} cannot be converted", format);
            return;
        }
        let src_len = format.frame_size(desc.width, desc.height) as usize;
        let Some(src) = self.memory.read(source_addr, src_len) else {
            warn!("Could not read {} source bytes at {:#x}", src_len, source_addr);
            return;
        };
        let mut dst = vec![0u8; attrs.output_format.output_size(desc.width, desc.height)];
        let markers = if attrs.draws_markers() {
            if self.tracking_active()
                && !self.wait_for_pass(desc.frame_number.saturating_sub(1), MARKER_PASS_WAIT)
            {
                debug!(
                    "No tracking pass for frame {} yet, drawing last known markers",
                    desc.frame_number
                );
            }
            self.marker_positions()
        } else {
            Vec::new()
        };
        match convert::transcode(&src, format, desc.width, desc.height, &mut dst, &attrs, &markers) {
            Ok(()) => {
                if !self.memory.write(attrs.output_addr, &dst) {
                    warn!("Converted frame did not fit at {:#x}", attrs.output_addr);
                }
            }
            Err(e) => warn!("Video conversion failed: {}", e),
        }
    }

    /// Run the queued conversion, if any
    pub fn conversion_tick(&self) {
        let (phase, source_addr) = match self.convert.lock() {
            Ok(slot) => (slot.phase, slot.source_addr),
            Err(_) => return,
        };
        match phase {
            ConvertPhase::Pending => self.transcode_into_guest(source_addr),
            ConvertPhase::Restored => debug!("Completing conversion restored from snapshot"),
            ConvertPhase::Idle | ConvertPhase::Done => return,
        }
        if let Ok(mut slot) = self.convert.lock() {
            slot.phase = ConvertPhase::Done;
            slot.completed += 1;
        }
        self.convert_done.notify_all();
    }

    // ---------------------------------------------------------------------
    // Update worker
    // ---------------------------------------------------------------------

    pub fn update_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.settings.update_rate_hz.max(1) as f64)
    }

    pub(crate) async fn woken(&self) {
        self.wake.notified().await;
    }

    /// Recompute which controller slots have a host device behind them
    pub fn connection_tick(&self) {
        let connected = match self.backend.lock() {
            Ok(mut backend) => backend.update_connections(),
            Err(_) => return,
        };
        let Ok(mut state) = self.config.lock() else {
            return;
        };
        if !state.initialized {
            return;
        }
        let max = state.max_connect as usize;
        for (slot, ctrl) in state.controllers.iter_mut().enumerate() {
            let device = self.kind.device_for_slot(slot);
            let ready = slot < max && connected.contains(&device);
            let status = if ready {
                ConnectionStatus::Ready
            } else {
                ConnectionStatus::Disconnected
            };
            if ctrl.status != status {
                info!("Controller {} {:?} (host device {})", slot, status, device);
                ctrl.status = status;
                ctrl.port = if ready { device as u32 + 1 } else { 0 };
                if !ready {
                    ctrl.is_calibrating = false;
                }
            }
        }
    }

    /// Finish calibrations whose dwell has elapsed
    pub fn calibration_tick(&self) {
        let Ok(mut state) = self.config.lock() else {
            return;
        };
        let dwell = Duration::from_millis(self.settings.calibration_dwell_ms);
        for slot in 0..MAX_CONTROLLERS {
            if !state.controllers[slot].is_calibrating {
                continue;
            }
            if self.kind == InputBackendKind::Real && !state.controllers[slot].calibration_confirmed {
                let device = self.kind.device_for_slot(slot);
                if let Ok(mut backend) = self.backend.lock() {
                    if let Some(tracked) = backend.tracked() {
                        state.controllers[slot].calibration_confirmed =
                            tracked.calibration_succeeded(device);
                    }
                }
            }

            let ctrl = &mut state.controllers[slot];
            let elapsed = ctrl.calibration_start.map(|t| t.elapsed()).unwrap_or(dwell);
            if elapsed < dwell {
                continue;
            }
            if self.kind == InputBackendKind::Real && !ctrl.calibration_confirmed {
                warn!("Controller {} did not confirm calibration in time", slot);
            }
            ctrl.is_calibrating = false;
            ctrl.calibration_start = None;
            ctrl.calibrated = true;
            ctrl.calibration_flags |= CALIBRATION_OCCURRED | CALIBRATION_SUCCEEDED;
            ctrl.enabled_tracking = true;
            info!("Controller {} calibrated", slot);
        }
    }

    /// One update-worker iteration
    pub fn update_tick(&self) {
        self.connection_tick();
        self.calibration_tick();
        self.conversion_tick();
    }

    // ---------------------------------------------------------------------
    // Tracking worker
    // ---------------------------------------------------------------------

    /// Whether frames should be segmented at all
    pub fn tracking_active(&self) -> bool {
        self.kind == InputBackendKind::Real && self.is_initialized()
    }

    pub fn tracking_targets(&self, settings: &TrackingSettings) -> [HueTarget; MAX_CONTROLLERS] {
        let mut targets = [HueTarget::default(); MAX_CONTROLLERS];
        if let Ok(state) = self.config.lock() {
            for (target, ctrl) in targets.iter_mut().zip(&state.controllers) {
                *target = HueTarget {
                    active: ctrl.is_connected() && ctrl.enabled_tracking && ctrl.hue_set,
                    hue: ctrl.hue as f32,
                    hue_threshold: settings.hue_threshold_deg,
                    saturation_threshold: settings.saturation_threshold,
                };
            }
        }
        targets
    }

    /// Store one tracking pass and release anyone waiting for it
    pub fn publish_tracking(&self, frame: &FrameDescriptor, output: Option<&SegmentOutput>) {
        let Ok(mut tracking) = self.tracking.lock() else {
            return;
        };
        if let Some(output) = output {
            for (position, blob) in tracking.positions.iter_mut().zip(&output.blobs) {
                match blob {
                    Some(blob) => {
                        *position = TrackedPosition {
                            x: blob.x,
                            y: blob.y,
                            radius: blob.radius,
                            radius_valid: blob.valid,
                            distance: distance_from_radius(blob.radius, frame.width),
                            frame_number: frame.frame_number,
                        };
                    }
                    None => position.radius_valid = false,
                }
            }
            tracking.histogram.clone_from(&output.histogram);
            tracking.total_pixels = output.total_pixels;
        }
        tracking.last_frame = frame.frame_number;
        tracking.passes += 1;
        drop(tracking);
        self.tracking_done.notify_all();
    }

    /// Wait until a tracking pass for a frame newer than `after_frame` finished
    pub(crate) fn wait_for_pass(&self, after_frame: u64, timeout: Duration) -> bool {
        let Ok(tracking) = self.tracking.lock() else {
            return false;
        };
        self.tracking_done
            .wait_timeout_while(tracking, timeout, |t| {
                t.last_frame <= after_frame && !self.cancel.is_cancelled()
            })
            .map(|(t, _)| t.last_frame > after_frame)
            .unwrap_or(false)
    }

    pub fn tracked_position(&self, id: u32) -> GuestResult<TrackedPosition> {
        let state = self.lock_config()?;
        let slot = Self::check_id(&state, id)?;
        drop(state);
        Ok(self.lock_tracking()?.positions[slot])
    }

    // ---------------------------------------------------------------------
    // Snapshot hooks
    // ---------------------------------------------------------------------

    pub(crate) fn export_state(&self) -> (ManagerState, TrackerOutput, ConvertSlot) {
        (
            self.config.lock().map(|s| s.clone()).unwrap_or_default(),
            self.tracking.lock().map(|t| t.clone()).unwrap_or_default(),
            self.convert.lock().map(|c| *c).unwrap_or_default(),
        )
    }

    pub(crate) fn import_state(&self, state: ManagerState, tracking: TrackerOutput, convert: ConvertSlot) {
        if let Ok(mut s) = self.config.lock() {
            *s = state;
        }
        if let Ok(mut t) = self.tracking.lock() {
            *t = tracking;
        }
        if let Ok(mut c) = self.convert.lock() {
            *c = convert;
        }
        self.wake.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guest::HeapMemory;
    use crate::motion::backend::{PointerFeed, SimulatedTrackedDevice};
    use std::sync::Arc;

    fn manager_with(backend: InputBackend, dwell_ms: u64) -> MotionManager {
        let settings = MotionSettings {
            calibration_dwell_ms: dwell_ms,
            ..MotionSettings::default()
        };
        MotionManager::new(
            settings,
            TrackingSettings::default(),
            MappingSettings::default(),
            backend,
            Arc::new(FrameExchange::new()),
            Arc::new(HeapMemory::new()),
            CancellationToken::new(),
        )
    }

    #[test]
    fn init_rules() {
        let m = manager_with(InputBackend::Null, 500);
        assert_eq!(m.get_rgb(0), Err(GuestError::Uninitialized));
        assert_eq!(m.init(0), Err(GuestError::Param));
        assert_eq!(m.init(5), Err(GuestError::Param));
        m.init(2).unwrap();
        assert_eq!(m.init(2), Err(GuestError::AlreadyInitialized));
        assert_eq!(m.get_rgb(2), Err(GuestError::Param));
        m.end().unwrap();
        assert_eq!(m.end(), Err(GuestError::Uninitialized));
    }

    fn real_manager(device: &SimulatedTrackedDevice, dwell_ms: u64) -> MotionManager {
        device.plug(6);
        let m = manager_with(InputBackend::Real(Box::new(device.clone())), dwell_ms);
        m.init(1).unwrap();
        m.connection_tick();
        m
    }

    fn calibration_view(m: &MotionManager) -> (bool, bool, bool) {
        let state = m.config.lock().unwrap();
        let ctrl = &state.controllers[0];
        (ctrl.is_calibrating, ctrl.calibration_confirmed, ctrl.calibrated)
    }

    #[test]
    fn real_device_confirms_calibration_before_dwell_ends() {
        let device = SimulatedTrackedDevice::new(2);
        let m = real_manager(&device, 200);
        assert!(!device.calibration_requested(6));
        m.calibrate(0).unwrap();
        assert!(device.calibration_requested(6));

        m.calibration_tick();
        assert_eq!(calibration_view(&m), (true, false, false));

        m.connection_tick();
        m.connection_tick();
        m.calibration_tick();
        assert_eq!(calibration_view(&m), (true, true, false));
        assert_eq!(m.calibrate(0), Err(GuestError::Busy));

        std::thread::sleep(Duration::from_millis(220));
        m.calibration_tick();
        assert_eq!(calibration_view(&m), (false, true, true));
        assert_eq!(
            m.get_status_flags(0),
            Ok(CALIBRATION_OCCURRED | CALIBRATION_SUCCEEDED)
        );
    }

    #[test]
    fn unconfirmed_real_calibration_still_completes_after_dwell() {
        let device = SimulatedTrackedDevice::new(1000);
        let m = real_manager(&device, 50);
        m.calibrate(0).unwrap();
        m.connection_tick();
        m.calibration_tick();
        assert_eq!(calibration_view(&m), (true, false, false));

        std::thread::sleep(Duration::from_millis(70));
        m.calibration_tick();
        assert_eq!(calibration_view(&m), (false, false, true));
        assert_eq!(
            m.get_status_flags(0),
            Ok(CALIBRATION_OCCURRED | CALIBRATION_SUCCEEDED)
        );
    }

    #[test]
    fn explicit_hue_round_trips() {
        let m = manager_with(InputBackend::Null, 500);
        m.init(4).unwrap();
        let res = m
            .track_hues(&[45, DONT_TRACK_HUE, DONT_CARE_HUE, 359])
            .unwrap();
        assert_eq!(res[0], 45);
        assert_eq!(m.get_tracker_hue(0), Ok(45));
        assert_eq!(m.get_tracker_hue(1), Err(GuestError::NotAHue));
        assert!(DEFAULT_HUES.contains(&res[2]));
        assert_eq!(m.get_tracker_hue(3), Ok(359));
        assert_eq!(m.track_hues(&[360, 0, 0, 0]), Err(GuestError::Param));
    }

    #[test]
    fn dont_change_keeps_previous_hue() {
        let m = manager_with(InputBackend::Null, 500);
        m.init(1).unwrap();
        m.track_hues(&[200, DONT_TRACK_HUE, DONT_TRACK_HUE, DONT_TRACK_HUE]).unwrap();
        let res = m
            .track_hues(&[DONT_CHANGE_HUE, DONT_TRACK_HUE, DONT_TRACK_HUE, DONT_TRACK_HUE])
            .unwrap();
        assert_eq!(res[0], 200);
        assert_eq!(m.get_tracker_hue(0), Ok(200));
    }

    #[test]
    fn calibrate_requires_connection() {
        let m = manager_with(InputBackend::Null, 500);
        m.init(1).unwrap();
        m.connection_tick();
        assert_eq!(m.calibrate(0), Err(GuestError::NotConnected));
    }

    #[test]
    fn calibration_dwell_then_flags() {
        let feed = PointerFeed::new();
        feed.connect(0, 100, 100);
        let m = manager_with(InputBackend::Pointer(feed), 30);
        m.init(1).unwrap();
        m.connection_tick();

        m.calibrate(0).unwrap();
        assert_eq!(m.calibrate(0), Err(GuestError::Busy));
        assert_eq!(m.get_state(0, 0, 0).unwrap().0, ControllerStatus::SphereCalibrating);

        std::thread::sleep(Duration::from_millis(40));
        m.calibration_tick();
        let (status, _) = m.get_state(0, 0, 0).unwrap();
        assert_eq!(status, ControllerStatus::HueNotSet);
        assert_eq!(
            m.get_status_flags(0),
            Ok(CALIBRATION_OCCURRED | CALIBRATION_SUCCEEDED)
        );
        m.clear_status_flags(0, CALIBRATION_OCCURRED).unwrap();
        assert_eq!(m.get_status_flags(0), Ok(CALIBRATION_SUCCEEDED));
    }

    #[test]
    fn convert_start_checks() {
        let m = manager_with(InputBackend::Null, 500);
        assert_eq!(m.convert_video_start(0x1000), Err(GuestError::Uninitialized));
        m.init(1).unwrap();
        assert_eq!(m.convert_video_finish(), Err(GuestError::ConvertNotStarted));
        assert_eq!(m.convert_video_start(0), Err(GuestError::Param));
        assert_eq!(m.convert_video_start(0x1040), Err(GuestError::InvalidAlignment));
        m.convert_video_start(0x1000).unwrap();
        assert_eq!(m.convert_video_start(0x1000), Err(GuestError::ConvertNotFinished));
        m.conversion_tick();
        m.convert_video_finish().unwrap();
        assert_eq!(m.conversions_completed(), 1);
        assert_eq!(m.convert_video_finish(), Err(GuestError::ConvertNotStarted));
    }

    #[test]
    fn rumble_is_stored() {
        let m = manager_with(InputBackend::Null, 500);
        m.init(1).unwrap();
        m.set_rumble(0, 200).unwrap();
        assert_eq!(m.get_rumble(0), Ok(200));
    }
}
