//! Seams towards the surrounding emulator
//!
//! The peripheral pipeline never touches guest memory or guest event queues
//! directly. It goes through [`GuestMemory`] and [`EventQueue`], which the
//! emulator core implements. [`HeapMemory`] and [`RecordingQueue`] are
//! in-process stand-ins used by the headless harness and the tests.

use std::collections::BTreeMap;
use std::sync::Mutex;
use tracing::{debug, warn};

/// Guest virtual-memory allocator and accessor
pub trait GuestMemory: Send + Sync {
    /// Allocate `size` bytes aligned to `align`, returning the guest address
    fn alloc(&self, size: u32, align: u32) -> Option<u32>;

    /// Release an allocation made by [`GuestMemory::alloc`]
    fn free(&self, addr: u32) -> bool;

    /// Copy `data` to guest memory at `addr`
    fn write(&self, addr: u32, data: &[u8]) -> bool;

    /// Copy `len` bytes starting at `addr` out of guest memory
    fn read(&self, addr: u32, len: usize) -> Option<Vec<u8>>;
}

/// Guest event-queue delivery primitive
pub trait EventQueue: Send + Sync {
    /// Post an event to the queue identified by `queue_key`.
    ///
    /// Returns false when the queue no longer exists or is full.
    fn send(&self, queue_key: u64, source: u64, event_type: u64, arg0: u64, arg1: u64) -> bool;
}

const HEAP_BASE: u32 = 0x3000_0000;

#[derive(Debug, Default)]
struct HeapInner {
    next: u32,
    blocks: BTreeMap<u32, Vec<u8>>,
}

/// Bump allocator over host vectors, good enough for a single emulated process
#[derive(Debug)]
pub struct HeapMemory {
    inner: Mutex<HeapInner>,
}

impl Default for HeapMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapMemory {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HeapInner {
                next: HEAP_BASE,
                blocks: BTreeMap::new(),
            }),
        }
    }

    /// Number of live allocations
    pub fn live_blocks(&self) -> usize {
        self.inner.lock().map(|h| h.blocks.len()).unwrap_or(0)
    }

    /// Size of the allocation starting at `addr`
    pub fn block_size(&self, addr: u32) -> Option<usize> {
        let heap = self.inner.lock().ok()?;
        heap.blocks.get(&addr).map(Vec::len)
    }

    fn locate(blocks: &BTreeMap<u32, Vec<u8>>, addr: u32, len: usize) -> Option<(u32, usize)> {
        let (&base, block) = blocks.range(..=addr).next_back()?;
        let offset = (addr - base) as usize;
        if offset + len <= block.len() {
            Some((base, offset))
        } else {
            None
        }
    }
}

impl GuestMemory for HeapMemory {
    fn alloc(&self, size: u32, align: u32) -> Option<u32> {
        if size == 0 {
            return None;
        }
        let align = align.max(1);
        let mut heap = self.inner.lock().ok()?;
        let addr = heap.next.checked_add(align - 1)? / align * align;
        heap.next = addr.checked_add(size)?;
        heap.blocks.insert(addr, vec![0; size as usize]);
        debug!("Guest alloc {:#x} ({} bytes)", addr, size);
        Some(addr)
    }

    fn free(&self, addr: u32) -> bool {
        match self.inner.lock() {
            Ok(mut heap) => heap.blocks.remove(&addr).is_some(),
            Err(_) => false,
        }
    }

    fn write(&self, addr: u32, data: &[u8]) -> bool {
        let Ok(mut heap) = self.inner.lock() else {
            return false;
        };
        match Self::locate(&heap.blocks, addr, data.len()) {
            Some((base, offset)) => {
                if let Some(block) = heap.blocks.get_mut(&base) {
                    block[offset..offset + data.len()].copy_from_slice(data);
                    return true;
                }
                false
            }
            None => {
                warn!("Guest write outside of any allocation: {:#x}+{}", addr, data.len());
                false
            }
        }
    }

    fn read(&self, addr: u32, len: usize) -> Option<Vec<u8>> {
        let heap = self.inner.lock().ok()?;
        let (base, offset) = Self::locate(&heap.blocks, addr, len)?;
        heap.blocks
            .get(&base)
            .map(|block| block[offset..offset + len].to_vec())
    }
}

/// One event captured by [`RecordingQueue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedEvent {
    pub queue_key: u64,
    pub source: u64,
    pub event_type: u64,
    pub arg0: u64,
    pub arg1: u64,
}

/// Event queue that records every delivery in order
#[derive(Debug, Default)]
pub struct RecordingQueue {
    events: Mutex<Vec<QueuedEvent>>,
}

impl RecordingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// All events delivered so far, oldest first
    pub fn events(&self) -> Vec<QueuedEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Events delivered to one queue key
    pub fn events_for(&self, queue_key: u64) -> Vec<QueuedEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.queue_key == queue_key)
            .collect()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

impl EventQueue for RecordingQueue {
    fn send(&self, queue_key: u64, source: u64, event_type: u64, arg0: u64, arg1: u64) -> bool {
        match self.events.lock() {
            Ok(mut events) => {
                events.push(QueuedEvent {
                    queue_key,
                    source,
                    event_type,
                    arg0,
                    arg1,
                });
                true
            }
            Err(_) => false,
        }
    }
}
