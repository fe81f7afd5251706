//! Backend-specific button remap tables

use crate::mapping::MappingError;
use crate::motion::backend::{HostButton, InputBackendKind, PadInput};
use crate::motion::types::{GemButton, PadData};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

/// One host button driving one logical controller button
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct Binding {
    pub host: HostButton,
    pub gem: GemButton,
}

impl Binding {
    pub const fn new(host: HostButton, gem: GemButton) -> Self {
        Self { host, gem }
    }
}

/// Named remap table for one backend class
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default)]
#[serde(default)]
pub struct ButtonMap {
    pub name: String,
    pub bindings: Vec<Binding>,
}

impl ButtonMap {
    fn from_table(name: &str, table: &[(HostButton, GemButton)]) -> Self {
        Self {
            name: name.to_string(),
            bindings: table.iter().map(|(h, g)| Binding::new(*h, *g)).collect(),
        }
    }

    pub fn gamepad_default() -> Self {
        Self::from_table(
            "Gamepad",
            &[
                (HostButton::A, GemButton::Cross),
                (HostButton::B, GemButton::Circle),
                (HostButton::X, GemButton::Triangle),
                (HostButton::Y, GemButton::Square),
                (HostButton::Start, GemButton::Start),
                (HostButton::Select, GemButton::Select),
                (HostButton::RightBumper, GemButton::Move),
                (HostButton::RightTrigger, GemButton::T),
            ],
        )
    }

    pub fn pointer_default() -> Self {
        Self::from_table(
            "Pointer",
            &[
                (HostButton::MouseLeft, GemButton::T),
                (HostButton::MouseRight, GemButton::Move),
                (HostButton::MouseMiddle, GemButton::Cross),
                (HostButton::Mouse4, GemButton::Start),
                (HostButton::Mouse5, GemButton::Select),
            ],
        )
    }

    pub fn aiming_default() -> Self {
        Self::from_table(
            "Aiming",
            &[
                (HostButton::MouseLeft, GemButton::T),
                (HostButton::MouseRight, GemButton::Move),
                (HostButton::MouseMiddle, GemButton::Start),
                (HostButton::Mouse4, GemButton::Select),
                (HostButton::Mouse5, GemButton::Cross),
            ],
        )
    }

    pub fn real_default() -> Self {
        Self::from_table(
            "Tracked controller",
            &[
                (HostButton::Move, GemButton::Move),
                (HostButton::T, GemButton::T),
                (HostButton::Triangle, GemButton::Triangle),
                (HostButton::Circle, GemButton::Circle),
                (HostButton::Cross, GemButton::Cross),
                (HostButton::Square, GemButton::Square),
                (HostButton::Start, GemButton::Start),
                (HostButton::Select, GemButton::Select),
            ],
        )
    }

    pub fn validate(&self) -> Result<(), MappingError> {
        if self.bindings.is_empty() {
            return Err(MappingError::Empty(self.name.clone()));
        }
        let mut seen = BTreeSet::new();
        for binding in &self.bindings {
            if !seen.insert(binding.host) {
                return Err(MappingError::DuplicateHost {
                    name: self.name.clone(),
                    host: format!("{:?}", binding.host),
                });
            }
        }
        Ok(())
    }
}

/// Remap tables for every backend class, `[mapping]` in the settings file
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct MappingSettings {
    pub real: ButtonMap,
    pub gamepad: ButtonMap,
    pub pointer: ButtonMap,
    pub aiming: ButtonMap,
}

impl Default for MappingSettings {
    fn default() -> Self {
        Self {
            real: ButtonMap::real_default(),
            gamepad: ButtonMap::gamepad_default(),
            pointer: ButtonMap::pointer_default(),
            aiming: ButtonMap::aiming_default(),
        }
    }
}

impl MappingSettings {
    pub fn for_kind(&self, kind: InputBackendKind) -> Option<&ButtonMap> {
        match kind {
            InputBackendKind::Null => None,
            InputBackendKind::Real => Some(&self.real),
            InputBackendKind::Gamepad => Some(&self.gamepad),
            InputBackendKind::Pointer => Some(&self.pointer),
            InputBackendKind::Aiming => Some(&self.aiming),
        }
    }

    pub fn validate(&self) -> Result<(), MappingError> {
        self.real.validate()?;
        self.gamepad.validate()?;
        self.pointer.validate()?;
        self.aiming.validate()
    }
}

/// Fold a host button snapshot into guest pad data
pub fn map_buttons(map: &ButtonMap, input: &PadInput) -> PadData {
    let mut digital = 0u16;
    for binding in &map.bindings {
        if input.pressed.contains(&binding.host) {
            digital |= binding.gem.bit();
        }
    }

    let mut analog_t = (input.trigger.clamp(0.0, 1.0) * 255.0).round() as u16;
    if digital & GemButton::T.bit() != 0 && analog_t == 0 {
        analog_t = 255;
    }
    if analog_t > 0 {
        digital |= GemButton::T.bit();
    }

    if digital != 0 {
        debug!("{} buttons -> {:#06x} (T {})", map.name, digital, analog_t);
    }
    PadData {
        digital_buttons: digital,
        analog_t,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pressed(buttons: &[HostButton]) -> PadInput {
        PadInput {
            pressed: buttons.iter().copied().collect(),
            ..PadInput::default()
        }
    }

    #[test]
    fn defaults_are_valid() {
        assert_eq!(MappingSettings::default().validate(), Ok(()));
    }

    #[test]
    fn duplicate_host_is_rejected() {
        let mut map = ButtonMap::gamepad_default();
        map.bindings.push(Binding::new(HostButton::A, GemButton::Square));
        assert!(matches!(
            map.validate(),
            Err(MappingError::DuplicateHost { .. })
        ));
    }

    #[test]
    fn gamepad_buttons_remap() {
        let map = ButtonMap::gamepad_default();
        let pad = map_buttons(&map, &pressed(&[HostButton::A, HostButton::Start]));
        assert_eq!(
            pad.digital_buttons,
            GemButton::Cross.bit() | GemButton::Start.bit()
        );
        assert_eq!(pad.analog_t, 0);
    }

    #[test]
    fn trigger_drives_t_both_ways() {
        let map = ButtonMap::pointer_default();
        let pad = map_buttons(&map, &pressed(&[HostButton::MouseLeft]));
        assert_eq!(pad.digital_buttons, GemButton::T.bit());
        assert_eq!(pad.analog_t, 255);

        let input = PadInput {
            trigger: 0.5,
            ..PadInput::default()
        };
        let pad = map_buttons(&map, &input);
        assert_eq!(pad.analog_t, 128);
        assert_eq!(pad.digital_buttons, GemButton::T.bit());
    }

    #[test]
    fn settings_survive_toml() {
        let settings = MappingSettings::default();
        let text = toml::to_string_pretty(&settings).unwrap();
        let back: MappingSettings = toml::from_str(&text).unwrap();
        assert_eq!(back, settings);
    }
}
