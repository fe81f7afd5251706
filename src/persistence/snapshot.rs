//! Savestate of the guest-visible peripheral state
//!
//! The layout is versioned and forward compatible: unknown fields are ignored
//! and missing ones fall back to defaults. Tables are stored as lists of
//! entries so the TOML stays readable.

use crate::camera::device::{BufferSlot, CameraDevice, DeviceFlags, StreamConfig, Subscriber};
use crate::camera::types::{CameraAttribute, CameraFormat, CameraResolution, ReadMode};
use crate::motion::convert::ConvertAttributes;
use crate::motion::manager::{ConvertPhase, ConvertSlot, ManagerState, MotionManager, TrackerOutput};
use crate::motion::types::{ConnectionStatus, ControllerState, TrackedPosition, MAX_CONTROLLERS};
use chrono::{DateTime, Local};
use color_eyre::eyre::{eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub const SNAPSHOT_VERSION: u32 = 1;

/// Guest-supplied 64-bit words (queue keys, event masks, flag sets) as hex
/// strings, since TOML integers stop at `i64::MAX`. Plain integers are still
/// accepted when reading.
mod guest_word {
    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{:#018x}", value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        deserializer.deserialize_any(WordVisitor)
    }

    struct WordVisitor;

    impl<'de> Visitor<'de> for WordVisitor {
        type Value = u64;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a 64-bit word as hex string or integer")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<u64, E> {
            Ok(v)
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<u64, E> {
            u64::try_from(v).map_err(|_| E::custom(format!("negative guest word {}", v)))
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<u64, E> {
            let parsed = match v.strip_prefix("0x").or_else(|| v.strip_prefix("0X")) {
                Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
                None => v.parse(),
            };
            parsed.map_err(|e| E::custom(format!("bad guest word {:?}: {}", v, e)))
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(default)]
pub struct BufferEntry {
    pub addr: u32,
    pub size: u32,
    pub locked: bool,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttributeEntry {
    pub attribute: CameraAttribute,
    pub value1: u32,
    pub value2: u32,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(default)]
pub struct SubscriberEntry {
    #[serde(with = "guest_word")]
    pub queue_key: u64,
    #[serde(with = "guest_word")]
    pub source: u64,
    #[serde(with = "guest_word")]
    pub mask: u64,
    pub announced: Option<bool>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default)]
#[serde(default)]
pub struct CameraSnapshot {
    pub initialized: bool,
    pub open: bool,
    pub streaming: bool,
    pub attached: bool,
    pub dirty: bool,
    pub read_mode: ReadMode,
    /// Read mode the open stream's buffers were allocated for
    pub stream_read_mode: Option<ReadMode>,
    pub format: Option<CameraFormat>,
    pub resolution: Option<CameraResolution>,
    pub framerate: u32,
    pub buffers: Vec<BufferEntry>,
    pub write_index: u32,
    pub last_written: Option<u32>,
    pub frame_number: u64,
    pub bytes_read: u32,
    pub timestamp_us: u64,
    pub attributes: Vec<AttributeEntry>,
    pub subscribers: Vec<SubscriberEntry>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default)]
#[serde(default)]
pub struct ControllerSnapshot {
    pub status: ConnectionStatus,
    pub port: u32,
    pub ext_status: u32,
    pub ext_id: u32,
    pub calibrated: bool,
    #[serde(with = "guest_word")]
    pub calibration_flags: u64,
    pub is_calibrating: bool,
    pub calibration_confirmed: bool,
    pub enabled_magnetometer: bool,
    pub enabled_tracking: bool,
    pub enabled_led: bool,
    pub hue_set: bool,
    pub hue: u32,
    pub rgb: (f32, f32, f32),
    pub rumble: u8,
    pub tracked: TrackedPosition,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default)]
#[serde(default)]
pub struct MotionSnapshot {
    pub initialized: bool,
    pub max_connect: u32,
    pub controllers: Vec<ControllerSnapshot>,
    pub convert_attributes: ConvertAttributes,
    pub convert_phase: ConvertPhase,
    pub convert_source: u32,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default)]
#[serde(default)]
pub struct Snapshot {
    pub version: u32,
    pub saved_at: Option<DateTime<Local>>,
    pub camera: CameraSnapshot,
    pub motion: MotionSnapshot,
}

impl CameraSnapshot {
    fn capture(device: &CameraDevice) -> Self {
        let flags = device.flags();
        let mut snap = device
            .with_state(|s| CameraSnapshot {
                read_mode: s.read_mode,
                stream_read_mode: s.stream.map(|c| c.read_mode),
                format: s.stream.map(|c| c.format),
                resolution: s.stream.map(|c| c.resolution),
                framerate: s.stream.map(|c| c.framerate).unwrap_or(0),
                buffers: s
                    .buffers
                    .iter()
                    .map(|b| BufferEntry {
                        addr: b.addr,
                        size: b.size,
                        locked: b.locked,
                    })
                    .collect(),
                write_index: s.write_index as u32,
                last_written: s.last_written.map(|i| i as u32),
                frame_number: s.frame_number,
                bytes_read: s.bytes_read,
                timestamp_us: s.timestamp_us,
                attributes: s
                    .attributes
                    .iter()
                    .map(|(attribute, (value1, value2))| AttributeEntry {
                        attribute: *attribute,
                        value1: *value1,
                        value2: *value2,
                    })
                    .collect(),
                ..CameraSnapshot::default()
            })
            .unwrap_or_else(|e| {
                warn!("Camera state unavailable for snapshot: {}", e);
                CameraSnapshot::default()
            });

        snap.initialized = flags.initialized;
        snap.open = flags.open;
        snap.streaming = flags.streaming;
        snap.attached = flags.attached;
        snap.dirty = flags.dirty;
        snap.subscribers = device
            .subscribers_snapshot()
            .into_iter()
            .map(|(queue_key, s)| SubscriberEntry {
                queue_key,
                source: s.source,
                mask: s.mask,
                announced: s.announced,
            })
            .collect();
        snap
    }

    fn stream(&self) -> Option<StreamConfig> {
        let (format, resolution) = (self.format?, self.resolution?);
        let (width, height) = resolution.dimensions();
        Some(StreamConfig {
            format,
            resolution,
            framerate: self.framerate,
            width,
            height,
            bytesize: format.frame_size(width, height),
            read_mode: self.stream_read_mode.unwrap_or(self.read_mode),
        })
    }

    fn restore(&self, device: &Arc<CameraDevice>) {
        let stream = self.stream();
        let restored = device.with_state(|s| {
            s.read_mode = self.read_mode;
            s.stream = stream;
            s.buffers = self
                .buffers
                .iter()
                .map(|b| BufferSlot {
                    addr: b.addr,
                    size: b.size,
                    locked: b.locked,
                })
                .collect();
            s.write_index = self.write_index as usize;
            s.last_written = self.last_written.map(|i| i as usize);
            s.frame_number = self.frame_number;
            s.bytes_read = self.bytes_read;
            s.timestamp_us = self.timestamp_us;
            s.start_time = self
                .streaming
                .then(|| Instant::now().checked_sub(Duration::from_micros(self.timestamp_us)))
                .flatten();
            for entry in &self.attributes {
                s.attributes
                    .insert(entry.attribute, (entry.value1, entry.value2));
            }
        });
        if let Err(e) = restored {
            warn!("Camera state could not be restored: {}", e);
            return;
        }

        let flags = DeviceFlags {
            initialized: self.initialized,
            open: self.open && stream.is_some(),
            streaming: self.streaming && stream.is_some(),
            attached: self.attached,
            dirty: self.dirty,
        };
        let subscribers = self
            .subscribers
            .iter()
            .map(|s| {
                (
                    s.queue_key,
                    Subscriber {
                        source: s.source,
                        mask: s.mask,
                        announced: s.announced,
                    },
                )
            })
            .collect();
        device.restore_flags(flags, subscribers);
    }
}

impl MotionSnapshot {
    fn capture(manager: &MotionManager) -> Self {
        let (state, tracking, convert) = manager.export_state();
        MotionSnapshot {
            initialized: state.initialized,
            max_connect: state.max_connect,
            controllers: state
                .controllers
                .iter()
                .zip(tracking.positions)
                .map(|(c, tracked)| ControllerSnapshot {
                    status: c.status,
                    port: c.port,
                    ext_status: c.ext_status,
                    ext_id: c.ext_id,
                    calibrated: c.calibrated,
                    calibration_flags: c.calibration_flags,
                    is_calibrating: c.is_calibrating,
                    calibration_confirmed: c.calibration_confirmed,
                    enabled_magnetometer: c.enabled_magnetometer,
                    enabled_tracking: c.enabled_tracking,
                    enabled_led: c.enabled_led,
                    hue_set: c.hue_set,
                    hue: c.hue,
                    rgb: c.rgb,
                    rumble: c.rumble,
                    tracked,
                })
                .collect(),
            convert_attributes: state.convert_attributes,
            convert_phase: convert.phase,
            convert_source: convert.source_addr,
        }
    }

    fn restore(&self, manager: &MotionManager) {
        let mut state = ManagerState {
            initialized: self.initialized,
            max_connect: self.max_connect.min(MAX_CONTROLLERS as u32),
            convert_attributes: self.convert_attributes,
            init_time: self.initialized.then(Instant::now),
            ..ManagerState::default()
        };
        let mut tracking = TrackerOutput::default();

        for (slot, c) in self.controllers.iter().take(MAX_CONTROLLERS).enumerate() {
            state.controllers[slot] = ControllerState {
                status: c.status,
                port: c.port,
                ext_status: c.ext_status,
                ext_id: c.ext_id,
                calibrated: c.calibrated,
                calibration_flags: c.calibration_flags,
                is_calibrating: c.is_calibrating,
                // dwell restarts from the restore point
                calibration_start: c.is_calibrating.then(Instant::now),
                calibration_confirmed: c.calibration_confirmed,
                enabled_magnetometer: c.enabled_magnetometer,
                enabled_tracking: c.enabled_tracking,
                enabled_led: c.enabled_led,
                hue_set: c.hue_set,
                hue: c.hue,
                rgb: c.rgb,
                rumble: c.rumble,
            };
            tracking.positions[slot] = c.tracked;
        }

        let phase = match self.convert_phase {
            ConvertPhase::Pending | ConvertPhase::Restored => ConvertPhase::Restored,
            other => other,
        };
        let convert = ConvertSlot {
            phase,
            source_addr: self.convert_source,
            completed: 0,
        };
        manager.import_state(state, tracking, convert);
    }
}

impl Snapshot {
    pub fn capture(camera: &CameraDevice, motion: &MotionManager) -> Self {
        Snapshot {
            version: SNAPSHOT_VERSION,
            saved_at: Some(Local::now()),
            camera: CameraSnapshot::capture(camera),
            motion: MotionSnapshot::capture(motion),
        }
    }

    pub fn restore(&self, camera: &Arc<CameraDevice>, motion: &MotionManager) {
        if self.version > SNAPSHOT_VERSION {
            warn!(
                "Snapshot version {} is newer than {}, restoring known fields only",
                self.version, SNAPSHOT_VERSION
            );
        }
        self.camera.restore(camera);
        self.motion.restore(motion);
        info!(
            "Snapshot restored (saved {})",
            self.saved_at
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "at an unknown time".to_string())
        );
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| eyre!("Failed to serialize snapshot: {}", e))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| eyre!("Failed to parse snapshot: {}", e))
    }

    pub async fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create snapshot directory: {}", e))?;
        }
        tokio::fs::write(path, self.to_toml()?)
            .await
            .map_err(|e| eyre!("Failed to write snapshot file: {}", e))
    }

    pub async fn load_from(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read snapshot file: {}", e))?;
        Self::from_toml(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_and_missing_fields_are_tolerated() {
        let text = r#"
            version = 7
            future_field = "ignored"

            [camera]
            initialized = true
            format = "Rgba"

            [motion]
            max_connect = 2
            convert_phase = "Pending"
        "#;
        let snap = Snapshot::from_toml(text).unwrap();
        assert_eq!(snap.version, 7);
        assert!(snap.camera.initialized);
        assert_eq!(snap.camera.format, Some(CameraFormat::Rgba));
        assert_eq!(snap.camera.resolution, None);
        assert_eq!(snap.motion.max_connect, 2);
        assert_eq!(snap.motion.convert_phase, ConvertPhase::Pending);
        assert!(snap.motion.controllers.is_empty());
    }

    #[test]
    fn toml_keeps_tables_as_entries() {
        let snap = Snapshot {
            version: SNAPSHOT_VERSION,
            camera: CameraSnapshot {
                attributes: vec![AttributeEntry {
                    attribute: CameraAttribute::Gain,
                    value1: 3,
                    value2: 0,
                }],
                subscribers: vec![SubscriberEntry {
                    queue_key: 9,
                    source: 1,
                    mask: 0xff,
                    announced: Some(true),
                }],
                ..CameraSnapshot::default()
            },
            ..Snapshot::default()
        };
        let text = snap.to_toml().unwrap();
        assert!(text.contains("[[camera.attributes]]"));
        assert_eq!(Snapshot::from_toml(&text).unwrap(), snap);
    }

    #[test]
    fn high_bit_queue_keys_and_masks_survive() {
        let snap = Snapshot {
            version: SNAPSHOT_VERSION,
            camera: CameraSnapshot {
                subscribers: vec![SubscriberEntry {
                    queue_key: 0x8000_0000_0000_0001,
                    source: u64::MAX - 1,
                    mask: u64::MAX,
                    announced: None,
                }],
                ..CameraSnapshot::default()
            },
            motion: MotionSnapshot {
                controllers: vec![ControllerSnapshot {
                    calibration_flags: 1 << 63,
                    ..ControllerSnapshot::default()
                }],
                ..MotionSnapshot::default()
            },
            ..Snapshot::default()
        };
        let text = snap.to_toml().unwrap();
        assert!(text.contains("0xffffffffffffffff"));
        assert_eq!(Snapshot::from_toml(&text).unwrap(), snap);
    }

    #[test]
    fn integer_guest_words_still_load() {
        let text = r#"
            [[camera.subscribers]]
            queue_key = 12
            source = "0x10"
            mask = "255"
        "#;
        let snap = Snapshot::from_toml(text).unwrap();
        let sub = snap.camera.subscribers[0];
        assert_eq!((sub.queue_key, sub.source, sub.mask), (12, 16, 255));
    }
}
