//! Virtual camera device controller
//!
//! Owns the device state machine, the guest-visible buffers, the attribute
//! table and the subscriber set. Guest calls land on the public methods; the
//! capture worker drives [`CameraDevice::capture_tick`].
//!
//! # Locking
//!
//! ```text
//! flags (atomics)    init / open / streaming / attached / dirty, polled lock-free
//! state  (Mutex)     buffers, attributes, counters; taken before the backend
//!                    lock when a guest call needs both
//! backend (Mutex)    host handler; the capture side takes it alone
//! subscribers (Mutex) independent, so Subscribe never orders against capture
//! ```

use crate::camera::backend::{BackendError, BackendState, CameraBackend, StreamRequest};
use crate::camera::frame::FrameExchange;
use crate::camera::types::{
    default_attribute, CameraAttribute, CameraEvent, CameraFormat, CameraModel, CameraResolution,
    ReadMode,
};
use crate::error::{GuestError, GuestResult};
use crate::guest::{EventQueue, GuestMemory};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

/// Wait used by the capture loop while there is nothing to capture
pub const IDLE_INTERVAL: Duration = Duration::from_millis(5);

/// Minimum spacing between two automatic re-open attempts
const REOPEN_BACKOFF: Duration = Duration::from_millis(250);

/// Guest allocations for frame buffers are page aligned
const BUFFER_ALIGN: u32 = 4096;

/// One guest-visible frame buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDescriptor {
    pub addr: u32,
    pub size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BufferSlot {
    pub(crate) addr: u32,
    pub(crate) size: u32,
    pub(crate) locked: bool,
}

/// Stream parameters fixed at `Open`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    pub format: CameraFormat,
    pub resolution: CameraResolution,
    pub framerate: u32,
    pub width: u32,
    pub height: u32,
    pub bytesize: u32,
    /// Read mode the buffers were allocated for
    pub read_mode: ReadMode,
}

impl StreamConfig {
    fn request(&self) -> StreamRequest {
        StreamRequest {
            format: self.format,
            width: self.width,
            height: self.height,
            framerate: self.framerate,
        }
    }

    fn frame_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.framerate.max(1) as f64)
    }
}

/// Result of a successful `Open`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraInfo {
    pub stream: StreamConfig,
    pub read_mode: ReadMode,
    pub buffers: Vec<BufferDescriptor>,
}

/// Result of `Read`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadResult {
    pub frame_number: u64,
    pub bytes_read: u32,
    /// Microseconds since `Start`
    pub timestamp_us: u64,
    /// Locked slot in direct mode
    pub buffer_index: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Subscriber {
    pub(crate) source: u64,
    pub(crate) mask: u64,
    /// Attachment value this subscriber was last told about
    pub(crate) announced: Option<bool>,
}

#[derive(Debug)]
pub(crate) struct DeviceState {
    /// Read mode attribute, applied at the next `Open`
    pub(crate) read_mode: ReadMode,
    pub(crate) stream: Option<StreamConfig>,
    pub(crate) buffers: Vec<BufferSlot>,
    pub(crate) write_index: usize,
    pub(crate) last_written: Option<usize>,
    pub(crate) frame_number: u64,
    pub(crate) bytes_read: u32,
    pub(crate) timestamp_us: u64,
    pub(crate) start_time: Option<Instant>,
    pub(crate) attributes: BTreeMap<CameraAttribute, (u32, u32)>,
    capture_buf: Vec<u8>,
}

impl DeviceState {
    fn empty() -> Self {
        Self {
            read_mode: ReadMode::FunctionCall,
            stream: None,
            buffers: Vec::new(),
            write_index: 0,
            last_written: None,
            frame_number: 0,
            bytes_read: 0,
            timestamp_us: 0,
            start_time: None,
            attributes: BTreeMap::new(),
            capture_buf: Vec::new(),
        }
    }

    /// Forget everything tied to an open stream, keep attributes and read mode
    fn reset_stream(&mut self) {
        self.stream = None;
        self.buffers.clear();
        self.write_index = 0;
        self.last_written = None;
        self.frame_number = 0;
        self.bytes_read = 0;
        self.timestamp_us = 0;
        self.start_time = None;
        self.capture_buf = Vec::new();
    }

    /// Read mode of the open stream
    fn stream_mode(&self) -> ReadMode {
        self.stream.map(|c| c.read_mode).unwrap_or(self.read_mode)
    }

    /// Slot the next captured frame goes to, never a locked one
    fn write_slot(&self) -> Option<usize> {
        let n = self.buffers.len();
        (0..n)
            .map(|i| (self.write_index + i) % n)
            .find(|&i| !self.buffers[i].locked)
    }
}

/// The virtual camera
pub struct CameraDevice {
    model: CameraModel,
    memory: Arc<dyn GuestMemory>,
    events: Arc<dyn EventQueue>,
    frames: Arc<FrameExchange>,
    backend: Option<Mutex<Box<dyn CameraBackend>>>,
    executor: Handle,

    initialized: AtomicBool,
    open: AtomicBool,
    streaming: AtomicBool,
    attached: AtomicBool,
    dirty: AtomicBool,
    paused: AtomicBool,
    reopen_pending: AtomicBool,
    last_reopen: Mutex<Option<Instant>>,

    state: Mutex<DeviceState>,
    subscribers: Mutex<BTreeMap<u64, Subscriber>>,
}

impl CameraDevice {
    pub fn new(
        model: CameraModel,
        backend: Option<Box<dyn CameraBackend>>,
        memory: Arc<dyn GuestMemory>,
        events: Arc<dyn EventQueue>,
        frames: Arc<FrameExchange>,
        executor: Handle,
    ) -> Arc<Self> {
        info!(
            "Creating camera device: model={:?}, handler={}",
            model,
            backend.as_ref().map(|b| b.name()).unwrap_or("none")
        );
        Arc::new(Self {
            model,
            memory,
            events,
            frames,
            backend: backend.map(Mutex::new),
            executor,
            initialized: AtomicBool::new(false),
            open: AtomicBool::new(false),
            streaming: AtomicBool::new(false),
            attached: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            reopen_pending: AtomicBool::new(false),
            last_reopen: Mutex::new(None),
            state: Mutex::new(DeviceState::empty()),
            subscribers: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn model(&self) -> CameraModel {
        self.model
    }

    /// Guest device type of the emulated model
    pub fn get_type(&self, dev_num: u32) -> GuestResult<u32> {
        self.check_ready(dev_num)?;
        Ok(self.model.guest_type())
    }

    pub fn get_device_guid(&self, dev_num: u32) -> GuestResult<[u8; 16]> {
        self.check_ready(dev_num)?;
        Ok(self.model.guid())
    }

    fn lock_state(&self) -> GuestResult<MutexGuard<'_, DeviceState>> {
        self.state.lock().map_err(|e| {
            error!("Camera state lock poisoned: {}", e);
            GuestError::Fatal
        })
    }

    fn with_backend<T>(&self, f: impl FnOnce(&mut dyn CameraBackend) -> T) -> Option<T> {
        let backend = self.backend.as_ref()?;
        match backend.lock() {
            Ok(mut guard) => Some(f(guard.as_mut())),
            Err(e) => {
                error!("Camera backend lock poisoned: {}", e);
                None
            }
        }
    }

    fn check_ready(&self, dev_num: u32) -> GuestResult<()> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(GuestError::NotInitialized);
        }
        if dev_num != 0 {
            return Err(GuestError::Param);
        }
        Ok(())
    }

    fn check_open(&self, dev_num: u32) -> GuestResult<()> {
        self.check_ready(dev_num)?;
        if !self.open.load(Ordering::SeqCst) {
            return Err(GuestError::NotOpen);
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Guest calls
    // ---------------------------------------------------------------------

    pub fn initialize(&self) -> GuestResult<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Err(GuestError::AlreadyInitialized);
        }
        {
            let mut state = self.lock_state()?;
            *state = DeviceState::empty();
            for attribute in CameraAttribute::all() {
                state
                    .attributes
                    .insert(attribute, default_attribute(self.model, attribute));
            }
        }
        self.attached.store(self.backend.is_some(), Ordering::SeqCst);
        self.dirty.store(true, Ordering::SeqCst);
        self.initialized.store(true, Ordering::SeqCst);
        info!(
            "Camera initialized (model {:?}, attached: {})",
            self.model,
            self.backend.is_some()
        );
        Ok(())
    }

    pub fn shutdown(&self) -> GuestResult<()> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(GuestError::NotInitialized);
        }
        if self.open.load(Ordering::SeqCst) {
            self.close(0)?;
        }
        *self.lock_state()? = DeviceState::empty();
        self.initialized.store(false, Ordering::SeqCst);
        info!("Camera shut down");
        Ok(())
    }

    pub fn get_buffer_size(&self, format: u32, resolution: u32) -> GuestResult<u32> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(GuestError::NotInitialized);
        }
        let format = CameraFormat::from_guest(format)
            .filter(|f| self.model.formats().contains(f))
            .ok_or(GuestError::FormatUnknown)?;
        let resolution = CameraResolution::from_guest(resolution)
            .filter(|r| !self.model.framerates(*r).is_empty())
            .ok_or(GuestError::ResolutionUnknown)?;
        let (width, height) = resolution.dimensions();
        Ok(format.frame_size(width, height))
    }

    pub fn open(
        &self,
        dev_num: u32,
        format: u32,
        resolution: u32,
        framerate: u32,
    ) -> GuestResult<CameraInfo> {
        self.check_ready(dev_num)?;
        if self.open.load(Ordering::SeqCst) {
            return Err(GuestError::AlreadyOpen);
        }
        let (format, resolution) = self.model.validate(format, resolution, framerate)?;
        if !self.attached.load(Ordering::SeqCst) {
            return Err(GuestError::DeviceNotFound);
        }

        let mut state = self.lock_state()?;
        let read_mode = state.read_mode;
        let (width, height) = resolution.dimensions();
        let stream = StreamConfig {
            format,
            resolution,
            framerate,
            width,
            height,
            bytesize: format.frame_size(width, height),
            read_mode,
        };

        let mut buffers = Vec::with_capacity(read_mode.buffer_count());
        for _ in 0..read_mode.buffer_count() {
            match self.memory.alloc(stream.bytesize, BUFFER_ALIGN) {
                Some(addr) => buffers.push(BufferSlot {
                    addr,
                    size: stream.bytesize,
                    locked: false,
                }),
                None => {
                    error!("Guest allocation of {} bytes failed", stream.bytesize);
                    for slot in &buffers {
                        self.memory.free(slot.addr);
                    }
                    return Err(GuestError::Fatal);
                }
            }
        }

        let opened = self
            .with_backend(|b| b.open(&stream.request()))
            .unwrap_or_else(|| Err(BackendError::Unavailable("no backend".to_string())));
        if let Err(e) = opened {
            warn!("Camera backend refused to open: {}", e);
            for slot in &buffers {
                self.memory.free(slot.addr);
            }
            return Err(GuestError::DeviceNotFound);
        }
        let mirrored = state
            .attributes
            .get(&CameraAttribute::MirrorFlag)
            .map(|(v, _)| *v != 0)
            .unwrap_or(false);
        self.with_backend(|b| b.set_mirrored(mirrored));

        state.reset_stream();
        state.stream = Some(stream);
        state.buffers = buffers;
        state.capture_buf = vec![0; stream.bytesize as usize];
        self.frames.configure(format, width, height);

        let info = CameraInfo {
            stream,
            read_mode,
            buffers: state
                .buffers
                .iter()
                .map(|s| BufferDescriptor {
                    addr: s.addr,
                    size: s.size,
                })
                .collect(),
        };
        drop(state);

        self.open.store(true, Ordering::SeqCst);
        info!(
            "Camera opened: {:?} {}x{} @ {}fps, {:?}, {} buffer(s) of {} bytes",
            format,
            width,
            height,
            framerate,
            read_mode,
            info.buffers.len(),
            stream.bytesize
        );
        self.notify(CameraEvent::Open, 0, 0);
        Ok(info)
    }

    pub fn close(&self, dev_num: u32) -> GuestResult<()> {
        self.check_open(dev_num)?;

        // A queued re-open checks `open` under the state lock
        let mut state = self.lock_state()?;
        if self.streaming.swap(false, Ordering::SeqCst) {
            if let Some(Err(e)) = self.with_backend(|b| b.stop()) {
                warn!("Camera backend stop failed: {}", e);
            }
        }
        if let Some(Err(e)) = self.with_backend(|b| b.close()) {
            warn!("Camera backend close failed: {}", e);
        }
        for slot in state.buffers.drain(..) {
            if !self.memory.free(slot.addr) {
                warn!("Guest buffer {:#x} was already gone", slot.addr);
            }
        }
        state.reset_stream();
        self.open.store(false, Ordering::SeqCst);
        drop(state);

        self.frames.clear();
        info!("Camera closed");
        self.notify(CameraEvent::Close, 0, 0);
        Ok(())
    }

    pub fn start(&self, dev_num: u32) -> GuestResult<()> {
        self.check_open(dev_num)?;
        if self.streaming.load(Ordering::SeqCst) {
            return Ok(());
        }

        let running = self
            .with_backend(|b| {
                if let Err(e) = b.start() {
                    warn!("Camera backend failed to start: {}", e);
                }
                b.state() == BackendState::Running
            })
            .unwrap_or(false);
        if !running {
            return Err(GuestError::DeviceNotFound);
        }

        {
            let mut state = self.lock_state()?;
            state.start_time = Some(Instant::now());
            state.frame_number = 0;
            state.bytes_read = 0;
            state.timestamp_us = 0;
            state.last_written = None;
        }
        self.streaming.store(true, Ordering::SeqCst);
        info!("Camera streaming started");
        self.notify(CameraEvent::Start, 0, 0);
        Ok(())
    }

    pub fn stop(&self, dev_num: u32) -> GuestResult<()> {
        self.check_open(dev_num)?;
        if !self.streaming.swap(false, Ordering::SeqCst) {
            return Err(GuestError::NotStarted);
        }
        if let Some(Err(e)) = self.with_backend(|b| b.stop()) {
            warn!("Camera backend stop failed: {}", e);
        }
        info!("Camera streaming stopped");
        self.notify(CameraEvent::Stop, 0, 0);
        Ok(())
    }

    /// Restart the host stream without touching guest buffers
    pub fn reset(&self, dev_num: u32) -> GuestResult<()> {
        self.check_open(dev_num)?;
        let streaming = self.streaming.load(Ordering::SeqCst);
        self.with_backend(|b| {
            if streaming {
                if let Err(e) = b.stop() {
                    warn!("Camera backend stop failed: {}", e);
                }
                if let Err(e) = b.start() {
                    warn!("Camera backend restart failed: {}", e);
                }
            }
        });
        info!("Camera reset (streaming: {})", streaming);
        self.notify(CameraEvent::Reset, 0, 0);
        Ok(())
    }

    pub fn read(&self, dev_num: u32) -> GuestResult<ReadResult> {
        self.check_open(dev_num)?;
        if !self.streaming.load(Ordering::SeqCst) {
            return Err(GuestError::NotStarted);
        }

        let mut state = self.lock_state()?;
        let mut result = ReadResult {
            frame_number: state.frame_number,
            bytes_read: state.bytes_read,
            timestamp_us: state.timestamp_us,
            buffer_index: None,
        };

        match state.stream_mode() {
            ReadMode::FunctionCall => {
                if state.frame_number > 0 {
                    let (_, data) = self.frames.latest();
                    if let Some(slot) = state.buffers.first() {
                        let len = data.len().min(slot.size as usize);
                        if !self.memory.write(slot.addr, &data[..len]) {
                            warn!("Copying frame into guest buffer {:#x} failed", slot.addr);
                        }
                    }
                }
            }
            ReadMode::Direct => {
                if let Some(index) = state.last_written {
                    state.buffers[index].locked = true;
                    result.buffer_index = Some(index);
                }
            }
        }
        debug!(
            "Camera read: frame {} ({} bytes) slot {:?}",
            result.frame_number, result.bytes_read, result.buffer_index
        );
        Ok(result)
    }

    /// Release a direct-mode slot. Releasing twice is harmless.
    pub fn read_complete(&self, dev_num: u32, buffer_index: u32) -> GuestResult<()> {
        self.check_open(dev_num)?;
        let mut state = self.lock_state()?;
        let slot = state
            .buffers
            .get_mut(buffer_index as usize)
            .ok_or(GuestError::Param)?;
        slot.locked = false;
        Ok(())
    }

    pub fn get_attribute(&self, dev_num: u32, id: u32) -> GuestResult<(u32, u32)> {
        self.check_ready(dev_num)?;
        let attribute = CameraAttribute::from_guest(id).ok_or(GuestError::Param)?;
        let state = self.lock_state()?;
        Ok(state.attributes.get(&attribute).copied().unwrap_or((0, 0)))
    }

    pub fn set_attribute(&self, dev_num: u32, id: u32, v1: u32, v2: u32) -> GuestResult<()> {
        self.check_ready(dev_num)?;
        let attribute = CameraAttribute::from_guest(id).ok_or(GuestError::Param)?;

        let mut state = self.lock_state()?;
        match attribute {
            CameraAttribute::ReadMode => {
                let mode = ReadMode::from_guest(v1).ok_or(GuestError::Param)?;
                if self.open.load(Ordering::SeqCst) && mode != state.read_mode {
                    debug!("Read mode change to {:?} applies at next open", mode);
                }
                state.read_mode = mode;
            }
            CameraAttribute::MirrorFlag => {
                drop(state);
                self.with_backend(|b| b.set_mirrored(v1 != 0));
                state = self.lock_state()?;
            }
            CameraAttribute::Led => {
                drop(state);
                self.with_backend(|b| b.set_led(v1 != 0));
                state = self.lock_state()?;
            }
            _ => {}
        }
        state.attributes.insert(attribute, (v1, v2));
        debug!("Camera attribute {:?} = ({}, {})", attribute, v1, v2);
        Ok(())
    }

    /// Register `queue_key`; the next capture tick tells it the attachment state
    pub fn subscribe(&self, queue_key: u64, source: u64, mask: u64) -> GuestResult<()> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(GuestError::NotInitialized);
        }
        let mut subscribers = self.subscribers.lock().map_err(|_| GuestError::Fatal)?;
        subscribers.insert(
            queue_key,
            Subscriber {
                source,
                mask,
                announced: None,
            },
        );
        drop(subscribers);
        self.dirty.store(true, Ordering::SeqCst);
        debug!("Camera subscriber {:#x} registered (mask {:#x})", queue_key, mask);
        Ok(())
    }

    pub fn unsubscribe(&self, queue_key: u64) -> GuestResult<()> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(GuestError::NotInitialized);
        }
        let mut subscribers = self.subscribers.lock().map_err(|_| GuestError::Fatal)?;
        if subscribers.remove(&queue_key).is_none() {
            debug!("Unsubscribe for unknown queue {:#x}", queue_key);
        }
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn is_started(&self) -> bool {
        self.streaming.load(Ordering::SeqCst)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    // ---------------------------------------------------------------------
    // Capture side
    // ---------------------------------------------------------------------

    /// Post `event` to every announced subscriber whose mask accepts it
    fn notify(&self, event: CameraEvent, arg0: u64, arg1: u64) {
        let Ok(subscribers) = self.subscribers.lock() else {
            return;
        };
        for (key, sub) in subscribers.iter() {
            if sub.announced.is_some() && event.accepted_by(sub.mask) {
                if !self.events.send(*key, sub.source, event.to_guest(), arg0, arg1) {
                    debug!("Queue {:#x} rejected {:?}", key, event);
                }
            }
        }
    }

    /// Tell every subscriber with a stale view the current attachment state
    fn announce_attachment(&self) {
        let attached = self.attached.load(Ordering::SeqCst);
        let event = if attached {
            CameraEvent::Attach
        } else {
            CameraEvent::Detach
        };
        let Ok(mut subscribers) = self.subscribers.lock() else {
            return;
        };
        for (key, sub) in subscribers.iter_mut() {
            if sub.announced != Some(attached) {
                self.events.send(*key, sub.source, event.to_guest(), 0, 0);
                sub.announced = Some(attached);
                debug!("Announced {:?} to queue {:#x}", event, key);
            }
        }
    }

    fn mark_attached(&self, attached: bool) {
        if self.attached.swap(attached, Ordering::SeqCst) != attached {
            info!("Camera {}", if attached { "attached" } else { "detached" });
            self.dirty.store(true, Ordering::SeqCst);
        }
    }

    /// One capture-loop iteration. Returns how long to sleep before the next.
    pub fn capture_tick(self: &Arc<Self>) -> Duration {
        let tick_start = Instant::now();
        let paused = self.paused.load(Ordering::SeqCst);

        if !paused && self.dirty.swap(false, Ordering::SeqCst) {
            self.announce_attachment();
        }

        if !self.initialized.load(Ordering::SeqCst) || paused || self.backend.is_none() {
            return IDLE_INTERVAL;
        }
        if !self.open.load(Ordering::SeqCst) || self.reopen_pending.load(Ordering::SeqCst) {
            return IDLE_INTERVAL;
        }

        let backend_state = self
            .with_backend(|b| b.state())
            .unwrap_or(BackendState::Closed);
        if matches!(backend_state, BackendState::Disconnected | BackendState::Closed) {
            self.mark_attached(false);
            self.schedule_reopen();
            return IDLE_INTERVAL;
        }

        if !self.streaming.load(Ordering::SeqCst) {
            return IDLE_INTERVAL;
        }

        let (stream, mut buf) = {
            let Ok(mut state) = self.state.lock() else {
                return IDLE_INTERVAL;
            };
            match state.stream {
                Some(stream) if stream.framerate > 0 => (stream, std::mem::take(&mut state.capture_buf)),
                _ => return IDLE_INTERVAL,
            }
        };
        if buf.len() < stream.bytesize as usize {
            buf.resize(stream.bytesize as usize, 0);
        }

        let pulled = self
            .with_backend(|b| b.get_frame(&mut buf))
            .unwrap_or(Err(BackendError::NotRunning));

        let delivered = {
            let Ok(mut state) = self.state.lock() else {
                return IDLE_INTERVAL;
            };
            let delivered = match pulled {
                Ok(Some(bytes)) => self.store_frame(&mut state, &buf[..bytes.min(buf.len())]),
                Ok(None) | Err(BackendError::NotRunning) => None,
                Err(BackendError::Disconnected) => {
                    drop(state);
                    self.mark_attached(false);
                    self.schedule_reopen();
                    self.put_back_buffer(buf);
                    return IDLE_INTERVAL;
                }
                Err(e) => {
                    debug!("Frame pull failed, treating as no frame: {}", e);
                    None
                }
            };
            state.capture_buf = buf;
            delivered
        };

        if let Some((slot, bytes, timestamp_us)) = delivered {
            let arg0 = ((slot as u64) << 32) | bytes as u64;
            self.notify(CameraEvent::FrameUpdate, arg0, timestamp_us);
        }

        stream.frame_period().saturating_sub(tick_start.elapsed())
    }

    fn put_back_buffer(&self, buf: Vec<u8>) {
        if let Ok(mut state) = self.state.lock() {
            state.capture_buf = buf;
        }
    }

    /// Account a pulled frame. Returns (slot, bytes, relative timestamp).
    fn store_frame(&self, state: &mut DeviceState, frame: &[u8]) -> Option<(usize, u32, u64)> {
        let slot = match state.stream_mode() {
            ReadMode::FunctionCall => 0,
            ReadMode::Direct => {
                let Some(slot) = state.write_slot() else {
                    debug!("Both direct buffers locked, dropping frame");
                    return None;
                };
                let target = state.buffers[slot];
                let len = frame.len().min(target.size as usize);
                if !self.memory.write(target.addr, &frame[..len]) {
                    warn!("Direct write to guest buffer {:#x} failed", target.addr);
                    return None;
                }
                state.last_written = Some(slot);
                let next = (slot + 1) % state.buffers.len();
                state.write_index = if state.buffers[next].locked { slot } else { next };
                slot
            }
        };

        state.frame_number += 1;
        state.bytes_read = frame.len() as u32;
        state.timestamp_us = state
            .start_time
            .map(|t| t.elapsed().as_micros() as u64)
            .unwrap_or(0);
        self.frames.publish(state.frame_number, frame.to_vec());
        Some((slot, state.bytes_read, state.timestamp_us))
    }

    /// Best-effort re-open (and re-start) of a lost host stream, run on the
    /// backend's execution context.
    pub(crate) fn schedule_reopen(self: &Arc<Self>) {
        if let Ok(mut last) = self.last_reopen.lock() {
            if last.is_some_and(|t| t.elapsed() < REOPEN_BACKOFF) {
                return;
            }
            *last = Some(Instant::now());
        }
        if self.reopen_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(request) = self
            .state
            .lock()
            .ok()
            .and_then(|s| s.stream.map(|c| c.request()))
        else {
            self.reopen_pending.store(false, Ordering::SeqCst);
            return;
        };

        let device = Arc::clone(self);
        self.executor.spawn_blocking(move || {
            device.reopen_backend(&request);
            device.reopen_pending.store(false, Ordering::SeqCst);
        });
    }

    fn reopen_backend(&self, request: &StreamRequest) {
        let Ok(state) = self.state.lock() else {
            return;
        };
        let current = state.stream.map(|c| c.request());
        if !self.open.load(Ordering::SeqCst) || current.as_ref() != Some(request) {
            debug!("Camera closed before the queued re-open ran, dropping it");
            return;
        }
        let restart = self.streaming.load(Ordering::SeqCst);
        let outcome = self.with_backend(|b| {
            if let Err(e) = b.close() {
                debug!("Closing the lost camera stream failed: {}", e);
            }
            b.open(request)?;
            if restart {
                b.start()?;
            }
            Ok::<BackendState, BackendError>(b.state())
        });
        drop(state);
        match outcome {
            Some(Ok(BackendState::Running)) => {
                info!("Camera backend recovered and streaming again");
                self.mark_attached(true);
            }
            Some(Ok(BackendState::Open)) if !restart => {
                info!("Camera backend re-opened");
                self.mark_attached(true);
            }
            Some(Ok(state)) => warn!("Camera backend re-open left it in {:?}", state),
            Some(Err(e)) => debug!("Camera backend re-open failed: {}", e),
            None => {}
        }
    }

    /// Snapshot hooks live in the persistence module
    pub(crate) fn flags(&self) -> DeviceFlags {
        DeviceFlags {
            initialized: self.initialized.load(Ordering::SeqCst),
            open: self.open.load(Ordering::SeqCst),
            streaming: self.streaming.load(Ordering::SeqCst),
            attached: self.attached.load(Ordering::SeqCst),
            dirty: self.dirty.load(Ordering::SeqCst),
        }
    }

    pub(crate) fn with_state<T>(&self, f: impl FnOnce(&mut DeviceState) -> T) -> GuestResult<T> {
        let mut state = self.lock_state()?;
        Ok(f(&mut state))
    }

    pub(crate) fn subscribers_snapshot(&self) -> Vec<(u64, Subscriber)> {
        self.subscribers
            .lock()
            .map(|s| s.iter().map(|(k, v)| (*k, *v)).collect())
            .unwrap_or_default()
    }

    pub(crate) fn restore_flags(self: &Arc<Self>, flags: DeviceFlags, subscribers: Vec<(u64, Subscriber)>) {
        if let Ok(mut subs) = self.subscribers.lock() {
            *subs = subscribers.into_iter().collect();
        }
        if let Ok(mut state) = self.state.lock() {
            let size = state.stream.map(|s| s.bytesize as usize).unwrap_or(0);
            state.capture_buf = vec![0; size];
            if let Some(stream) = state.stream {
                self.frames.configure(stream.format, stream.width, stream.height);
            }
            if flags.streaming && state.start_time.is_none() {
                state.start_time = Some(Instant::now());
            }
        }
        self.initialized.store(flags.initialized, Ordering::SeqCst);
        self.open.store(flags.open, Ordering::SeqCst);
        self.streaming.store(flags.streaming, Ordering::SeqCst);
        self.attached.store(flags.attached && self.backend.is_some(), Ordering::SeqCst);
        self.dirty.store(flags.dirty, Ordering::SeqCst);
        if flags.open && self.backend.is_some() {
            self.schedule_reopen();
        }
    }
}

/// Scalar device flags as stored in a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct DeviceFlags {
    pub(crate) initialized: bool,
    pub(crate) open: bool,
    pub(crate) streaming: bool,
    pub(crate) attached: bool,
    pub(crate) dirty: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::backend::PatternCamera;
    use crate::guest::{HeapMemory, RecordingQueue};

    struct Rig {
        _rt: tokio::runtime::Runtime,
        memory: Arc<HeapMemory>,
        events: Arc<RecordingQueue>,
        device: Arc<CameraDevice>,
    }

    fn rig(backend: Option<Box<dyn CameraBackend>>) -> Rig {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let memory = Arc::new(HeapMemory::new());
        let events = Arc::new(RecordingQueue::new());
        let device = CameraDevice::new(
            CameraModel::PlayStationEye,
            backend,
            memory.clone(),
            events.clone(),
            Arc::new(FrameExchange::new()),
            rt.handle().clone(),
        );
        Rig {
            _rt: rt,
            memory,
            events,
            device,
        }
    }

    #[test]
    fn full_lifecycle_from_clean_state() {
        let r = rig(Some(Box::new(PatternCamera::new())));
        let d = &r.device;
        d.initialize().unwrap();
        assert_eq!(d.initialize(), Err(GuestError::AlreadyInitialized));
        let info = d.open(0, 2, 2, 60).unwrap();
        assert_eq!(d.open(0, 2, 2, 60), Err(GuestError::AlreadyOpen));
        assert_eq!(info.buffers.len(), 1);
        assert_eq!(info.buffers[0].size, d.get_buffer_size(2, 2).unwrap());
        d.start(0).unwrap();
        d.stop(0).unwrap();
        assert_eq!(d.stop(0), Err(GuestError::NotStarted));
        d.close(0).unwrap();
        assert_eq!(d.close(0), Err(GuestError::NotOpen));
        assert_eq!(r.memory.live_blocks(), 0);
        d.shutdown().unwrap();
        assert_eq!(d.shutdown(), Err(GuestError::NotInitialized));
    }

    #[test]
    fn open_validates_before_allocating() {
        let r = rig(Some(Box::new(PatternCamera::new())));
        let d = &r.device;
        assert_eq!(d.open(0, 2, 1, 60), Err(GuestError::NotInitialized));
        d.initialize().unwrap();
        assert_eq!(d.open(1, 2, 1, 60), Err(GuestError::Param));
        assert_eq!(d.open(0, 1, 1, 60), Err(GuestError::FormatUnknown));
        assert_eq!(d.open(0, 2, 9, 60), Err(GuestError::ResolutionUnknown));
        assert_eq!(d.open(0, 2, 1, 187), Err(GuestError::BadFramerate));
        assert_eq!(r.memory.live_blocks(), 0);
    }

    #[test]
    fn open_without_backend_is_device_not_found() {
        let r = rig(None);
        r.device.initialize().unwrap();
        assert!(!r.device.is_attached());
        assert_eq!(r.device.open(0, 2, 1, 60), Err(GuestError::DeviceNotFound));
    }

    #[test]
    fn direct_mode_locks_and_never_overwrites_locked_slot() {
        let r = rig(Some(Box::new(PatternCamera::new())));
        let d = &r.device;
        d.initialize().unwrap();
        d.set_attribute(0, 300, 1, 0).unwrap();
        let info = d.open(0, 5, 2, 60).unwrap();
        assert_eq!(info.buffers.len(), 2);
        d.start(0).unwrap();

        d.capture_tick();
        let first = d.read(0).unwrap();
        assert_eq!(first.frame_number, 1);
        let locked = first.buffer_index.unwrap();

        for _ in 0..3 {
            d.capture_tick();
        }
        let state_ok = d
            .with_state(|s| s.buffers[locked].locked && s.last_written != Some(locked))
            .unwrap();
        assert!(state_ok);

        d.read_complete(0, locked as u32).unwrap();
        d.read_complete(0, locked as u32).unwrap();
        assert_eq!(d.read_complete(0, 2), Err(GuestError::Param));
        assert!(d.with_state(|s| s.buffers.iter().all(|b| !b.locked)).unwrap());
    }

    #[test]
    fn function_call_read_copies_into_guest_buffer() {
        let r = rig(Some(Box::new(PatternCamera::new())));
        let d = &r.device;
        d.initialize().unwrap();
        let info = d.open(0, 5, 2, 60).unwrap();
        assert_eq!(d.read(0), Err(GuestError::NotStarted));
        d.start(0).unwrap();
        d.capture_tick();
        let res = d.read(0).unwrap();
        assert_eq!(res.bytes_read, 320 * 240 * 4);
        let pixel = r.memory.read(info.buffers[0].addr + 3, 1).unwrap();
        assert_eq!(pixel, vec![255]);
    }

    #[test]
    fn attributes_reject_unknown_ids_and_bad_read_mode() {
        let r = rig(Some(Box::new(PatternCamera::new())));
        let d = &r.device;
        assert_eq!(d.get_attribute(0, 0), Err(GuestError::NotInitialized));
        d.initialize().unwrap();
        assert_eq!(d.get_attribute(0, 16), Ok((1, 0)));
        assert_eq!(d.get_attribute(0, 200), Err(GuestError::Param));
        assert_eq!(d.set_attribute(0, 300, 7, 0), Err(GuestError::Param));
        d.set_attribute(0, 4, 12, 34).unwrap();
        assert_eq!(d.get_attribute(0, 4), Ok((12, 34)));
    }

    #[test]
    fn read_mode_change_waits_for_next_open() {
        let r = rig(Some(Box::new(PatternCamera::new())));
        let d = &r.device;
        d.initialize().unwrap();
        let info = d.open(0, 5, 2, 60).unwrap();
        assert_eq!(info.buffers.len(), 1);
        d.start(0).unwrap();

        d.set_attribute(0, 300, 1, 0).unwrap();
        assert_eq!(d.get_attribute(0, 300), Ok((1, 0)));
        d.capture_tick();
        let res = d.read(0).unwrap();
        assert_eq!(res.frame_number, 1);
        assert_eq!(res.buffer_index, None);
        assert_eq!(d.with_state(|s| s.buffers.len()).unwrap(), 1);

        d.close(0).unwrap();
        let info = d.open(0, 5, 2, 60).unwrap();
        assert_eq!(info.read_mode, ReadMode::Direct);
        assert_eq!(info.stream.read_mode, ReadMode::Direct);
        assert_eq!(info.buffers.len(), 2);
    }

    #[test]
    fn start_fails_when_backend_cannot_run() {
        let camera = PatternCamera::new();
        let control = camera.control();
        let r = rig(Some(Box::new(camera)));
        let d = &r.device;
        d.initialize().unwrap();
        d.open(0, 5, 2, 60).unwrap();

        control.refuse_start(true);
        assert_eq!(d.start(0), Err(GuestError::DeviceNotFound));
        assert!(!d.is_started());
        assert_eq!(d.read(0), Err(GuestError::NotStarted));

        control.refuse_start(false);
        d.start(0).unwrap();
        assert!(d.is_started());
    }

    #[test]
    fn close_drops_a_queued_reopen() {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let camera = PatternCamera::new();
        let control = camera.control();
        let events = Arc::new(RecordingQueue::new());
        let d = CameraDevice::new(
            CameraModel::PlayStationEye,
            Some(Box::new(camera)),
            Arc::new(HeapMemory::new()),
            events.clone(),
            Arc::new(FrameExchange::new()),
            rt.handle().clone(),
        );
        d.initialize().unwrap();
        d.subscribe(0x10, 0xAA, u64::MAX).unwrap();
        d.open(0, 5, 2, 60).unwrap();
        d.start(0).unwrap();
        d.capture_tick();

        // Occupy the only blocking thread so the re-open stays queued
        let (release, gate) = std::sync::mpsc::channel::<()>();
        let blocker = rt.spawn_blocking(move || {
            let _ = gate.recv();
        });

        control.unplug();
        d.capture_tick();
        assert!(!d.is_attached());
        assert!(d.reopen_pending.load(Ordering::SeqCst));
        control.replug();
        d.close(0).unwrap();

        release.send(()).unwrap();
        rt.block_on(async {
            blocker.await.unwrap();
            tokio::task::spawn_blocking(|| ()).await.unwrap();
        });
        assert!(!d.reopen_pending.load(Ordering::SeqCst));
        assert_eq!(d.with_backend(|b| b.state()), Some(BackendState::Closed));
        assert!(!d.is_attached());

        d.capture_tick();
        let attaches = count_events(&events, CameraEvent::Attach);
        assert_eq!(attaches, 1);
    }

    fn count_events(events: &RecordingQueue, event: CameraEvent) -> usize {
        events
            .events_for(0x10)
            .iter()
            .filter(|e| e.event_type == event.to_guest())
            .count()
    }

    #[test]
    fn subscriber_gets_attach_before_frames() {
        let r = rig(Some(Box::new(PatternCamera::new())));
        let d = &r.device;
        d.initialize().unwrap();
        d.open(0, 2, 2, 60).unwrap();
        d.start(0).unwrap();
        d.subscribe(0x10, 0xAA, 1).unwrap();
        d.capture_tick();
        d.capture_tick();

        let events = r.events.events_for(0x10);
        assert_eq!(events[0].event_type, CameraEvent::Attach.to_guest());
        assert_eq!(events[0].source, 0xAA);
        assert!(events[1..]
            .iter()
            .all(|e| e.event_type == CameraEvent::FrameUpdate.to_guest()));
        assert_eq!(events.len(), 3);
    }
}
