//! Decodes raw characteristic values into typed sensor readings.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};

use crate::{
    attributes::CharacteristicId,
    error::{GattError, Result},
    event::GattEvent,
};

/// Signed fixed-point value in hundredths, as sent by the peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedPoint(i16);

impl FixedPoint {
    pub const fn new(raw: i16) -> Self {
        Self(raw)
    }

    pub const fn raw(&self) -> i16 {
        self.0
    }

    pub fn as_f64(&self) -> f64 {
        f64::from(self.0) / 100.0
    }
}

// Integer part, then the remainder printed as-is: 100 -> "1.0", 256 -> "2.56", 105 -> "1.5".
impl fmt::Display for FixedPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = i32::from(self.0);
        let sign = if value < 0 { "-" } else { "" };
        let magnitude = value.abs();
        write!(f, "{sign}{}.{}", magnitude / 100, magnitude % 100)
    }
}

/// A typed reading from one of the sensor characteristics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorReading {
    Roll(FixedPoint),
    Pitch(FixedPoint),
    Temperature(FixedPoint),
}

impl SensorReading {
    /// Decodes `payload` read from characteristic `id`.
    ///
    /// Returns `Ok(None)` when `id` is not a sensor characteristic. Only the first two bytes
    /// (little-endian) are significant.
    pub fn decode(id: CharacteristicId, payload: &[u8]) -> Result<Option<Self>> {
        let wrap: fn(FixedPoint) -> Self = if id == CharacteristicId::ROLL {
            Self::Roll
        } else if id == CharacteristicId::PITCH {
            Self::Pitch
        } else if id == CharacteristicId::TEMPERATURE {
            Self::Temperature
        } else {
            return Ok(None);
        };

        if payload.len() < 2 {
            return Err(GattError::PayloadTooShort(payload.len()));
        }
        Ok(Some(wrap(FixedPoint(LittleEndian::read_i16(payload)))))
    }

    /// Inverse of [`SensorReading::decode`].
    pub fn encode(&self) -> [u8; 2] {
        let mut payload = [0u8; 2];
        LittleEndian::write_i16(&mut payload, self.value().raw());
        payload
    }

    pub fn characteristic(&self) -> CharacteristicId {
        match self {
            Self::Roll(_) => CharacteristicId::ROLL,
            Self::Pitch(_) => CharacteristicId::PITCH,
            Self::Temperature(_) => CharacteristicId::TEMPERATURE,
        }
    }

    pub fn value(&self) -> FixedPoint {
        match self {
            Self::Roll(v) | Self::Pitch(v) | Self::Temperature(v) => *v,
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            Self::Roll(_) | Self::Pitch(_) => "\u{b0}",
            Self::Temperature(_) => "\u{2103}",
        }
    }
}

impl fmt::Display for SensorReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Roll(_) => "roll",
            Self::Pitch(_) => "pitch",
            Self::Temperature(_) => "temperature",
        };
        write!(f, "{label} {} {}", self.value(), self.unit())
    }
}

/// A typed event derived from a characteristic update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorEvent {
    Reading(SensorReading),
    DoubleTap,
}

impl SensorEvent {
    /// Converts a characteristic update into a sensor event. Other events, unknown
    /// characteristics and short sensor payloads yield `None`.
    pub fn from_gatt(event: &GattEvent) -> Option<Self> {
        let GattEvent::CharacteristicUpdated(id, value) = event else {
            return None;
        };
        if *id == CharacteristicId::DOUBLE_TAP {
            return Some(Self::DoubleTap);
        }
        match SensorReading::decode(*id, value) {
            Ok(reading) => reading.map(Self::Reading),
            Err(e) => {
                log::debug!("Dropping update for {id}: {e}");
                None
            }
        }
    }
}
