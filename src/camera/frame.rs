//! Shared frame descriptor
//!
//! The capture loop publishes every delivered frame here; the tracking worker
//! and the video converter read it without knowing anything about the camera
//! device controller.

use crate::camera::types::CameraFormat;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::sync::Notify;
use tracing::debug;

/// Latest frame metadata as seen by consumers of the camera
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameDescriptor {
    pub width: u32,
    pub height: u32,
    pub bytesize: u32,
    pub format: Option<CameraFormat>,
    /// Frame counter of the last delivered frame, 0 before the first one
    pub frame_number: u64,
    /// Host time the last frame was delivered
    pub timestamp: Option<Instant>,
}

impl Default for FrameDescriptor {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            bytesize: 0,
            format: None,
            frame_number: 0,
            timestamp: None,
        }
    }
}

#[derive(Debug, Default)]
struct Latest {
    descriptor: FrameDescriptor,
    data: Arc<Vec<u8>>,
}

/// Single-writer, many-reader handoff between capture and its consumers
#[derive(Debug, Default)]
pub struct FrameExchange {
    latest: RwLock<Latest>,
    wake: Notify,
}

impl FrameExchange {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called at `Open` with the stream geometry, before any frame exists
    pub fn configure(&self, format: CameraFormat, width: u32, height: u32) {
        if let Ok(mut latest) = self.latest.write() {
            latest.descriptor = FrameDescriptor {
                width,
                height,
                bytesize: format.frame_size(width, height),
                format: Some(format),
                frame_number: 0,
                timestamp: None,
            };
            latest.data = Arc::new(Vec::new());
        }
    }

    /// Overwrite the descriptor with a freshly delivered frame and wake the tracker
    pub fn publish(&self, frame_number: u64, data: Vec<u8>) {
        if let Ok(mut latest) = self.latest.write() {
            latest.descriptor.frame_number = frame_number;
            latest.descriptor.bytesize = data.len() as u32;
            latest.descriptor.timestamp = Some(Instant::now());
            latest.data = Arc::new(data);
        }
        self.wake.notify_one();
    }

    /// Called at `Close`
    pub fn clear(&self) {
        if let Ok(mut latest) = self.latest.write() {
            *latest = Latest::default();
        }
        debug!("Frame descriptor cleared");
    }

    pub fn descriptor(&self) -> FrameDescriptor {
        self.latest
            .read()
            .map(|l| l.descriptor)
            .unwrap_or_default()
    }

    /// Descriptor plus the bytes of the newest frame
    pub fn latest(&self) -> (FrameDescriptor, Arc<Vec<u8>>) {
        match self.latest.read() {
            Ok(l) => (l.descriptor, Arc::clone(&l.data)),
            Err(_) => (FrameDescriptor::default(), Arc::new(Vec::new())),
        }
    }

    /// Resolves once a frame has been published since the last wake.
    ///
    /// One permit is stored, so a frame published while the consumer is busy
    /// is not lost.
    pub async fn next_frame(&self) {
        self.wake.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_overwrites_and_clear_resets() {
        let exchange = FrameExchange::new();
        exchange.configure(CameraFormat::Raw8, 320, 240);
        assert_eq!(exchange.descriptor().bytesize, 320 * 240);
        assert_eq!(exchange.descriptor().frame_number, 0);

        exchange.publish(7, vec![1; 320 * 240]);
        let (desc, data) = exchange.latest();
        assert_eq!(desc.frame_number, 7);
        assert_eq!(data.len(), 320 * 240);
        assert!(desc.timestamp.is_some());

        exchange.clear();
        assert_eq!(exchange.descriptor().format, None);
    }

    #[tokio::test]
    async fn published_frame_wakes_a_late_waiter() {
        let exchange = FrameExchange::new();
        exchange.publish(1, vec![0; 4]);
        tokio::time::timeout(std::time::Duration::from_secs(1), exchange.next_frame())
            .await
            .expect("stored permit should wake the waiter");
    }
}
