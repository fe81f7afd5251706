#![allow(dead_code)]

use eyemotion::camera::CameraBackend;
use eyemotion::guest::{HeapMemory, QueuedEvent, RecordingQueue};
use eyemotion::motion::{HueCentroidSegmenter, InputBackend};
use eyemotion::persistence::PeripheralSettings;
use eyemotion::{HostBindings, PeripheralHub};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Runtime;

pub const QUEUE: u64 = 0x51;
pub const SOURCE: u64 = 0xCAFE;

/// A running hub on its own multi-thread runtime
pub struct Harness {
    pub hub: PeripheralHub,
    pub memory: Arc<HeapMemory>,
    pub events: Arc<RecordingQueue>,
    pub rt: Runtime,
}

pub fn harness(
    settings: PeripheralSettings,
    camera: Option<Box<dyn CameraBackend>>,
    input: InputBackend,
) -> Harness {
    harness_with_workers(settings, camera, input, 2)
}

pub fn harness_with_workers(
    settings: PeripheralSettings,
    camera: Option<Box<dyn CameraBackend>>,
    input: InputBackend,
    workers: usize,
) -> Harness {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .enable_all()
        .build()
        .unwrap();
    let memory = Arc::new(HeapMemory::new());
    let events = Arc::new(RecordingQueue::new());
    let bindings = HostBindings {
        memory: memory.clone(),
        events: events.clone(),
        camera,
        input,
        segmenter: Box::new(HueCentroidSegmenter::new(&settings.tracking)),
    };
    let hub = PeripheralHub::spawn(settings, bindings, rt.handle());
    Harness {
        hub,
        memory,
        events,
        rt,
    }
}

/// Poll `f` every few milliseconds until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    f()
}

pub fn events_of_type(events: &[QueuedEvent], event_type: u64) -> usize {
    events.iter().filter(|e| e.event_type == event_type).count()
}
