//! Encodes commands for the write-control characteristic.

use crate::attributes::CharacteristicId;

/// Actuation command written to [`CharacteristicId::WRITE_CONTROL`].
///
/// Encoded as `[intensity, speed]`, where intensity is forced to zero while the output is
/// disabled and speed is sent as a two's complement byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlCommand {
    pub intensity: u8,
    pub speed: i8,
    pub enabled: bool,
}

impl ControlCommand {
    pub fn characteristic(&self) -> CharacteristicId {
        CharacteristicId::WRITE_CONTROL
    }

    pub fn encode(&self) -> Vec<u8> {
        let intensity = if self.enabled { self.intensity } else { 0 };
        vec![intensity, self.speed as u8]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_output_sends_zero_intensity() {
        let cmd = ControlCommand {
            intensity: 80,
            speed: -10,
            enabled: false,
        };
        assert_eq!(cmd.encode(), vec![0, 0xf6]);
    }

    #[test]
    fn enabled_output_sends_intensity() {
        let cmd = ControlCommand {
            intensity: 80,
            speed: 7,
            enabled: true,
        };
        assert_eq!(cmd.encode(), vec![80, 7]);
        assert_eq!(cmd.characteristic(), CharacteristicId::WRITE_CONTROL);
    }
}
