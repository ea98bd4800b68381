//! GATT attribute identifiers exposed by the sensor peripheral.

use std::fmt;

use uuid::{uuid, Uuid};

/// Service UUID grouping the temperature, roll and pitch characteristics.
pub const SENSOR_SERVICE_UUID: Uuid = uuid!("42821a40-e477-11e2-82d0-0002a5d5c51b");

/// Characteristic UUID for the temperature measurement (read).
pub const TEMPERATURE_CHAR_UUID: Uuid = uuid!("a32e5520-e477-11e2-a9e3-0002a5d5c51b");

/// Characteristic UUID for the pitch measurement (read).
pub const PITCH_CHAR_UUID: Uuid = uuid!("cd20c480-e48b-11e2-840b-0002a5d5c51b");

/// Characteristic UUID for the roll measurement (read).
pub const ROLL_CHAR_UUID: Uuid = uuid!("01c50b60-e48c-11e2-a073-0002a5d5c51b");

/// Service UUID for the double tap characteristic.
pub const DOUBLE_TAP_SERVICE_UUID: Uuid = uuid!("02366e80-cf3a-11e1-9ab4-0002a5d5c51b");

/// Characteristic UUID for double tap events (notify).
pub const DOUBLE_TAP_CHAR_UUID: Uuid = uuid!("e23e78a0-cf4a-11e1-8ffc-0002a5d5c51b");

/// Service UUID for the write-control characteristic.
pub const CONTROL_SERVICE_UUID: Uuid = uuid!("8263e608-cf3a-11e1-9ab4-0002a5d5c51b");

/// Characteristic UUID used to actuate the device (write).
pub const CONTROL_CHAR_UUID: Uuid = uuid!("340a1b80-cf4b-11e1-ac36-0002a5d5c51b");

/// Standard client characteristic configuration descriptor.
pub const CLIENT_CHARACTERISTIC_CONFIG_UUID: Uuid =
    uuid!("00002902-0000-1000-8000-00805f9b34fb");

const HEART_RATE_SERVICE_UUID: Uuid = uuid!("0000180d-0000-1000-8000-00805f9b34fb");
const DEVICE_INFORMATION_SERVICE_UUID: Uuid = uuid!("0000180a-0000-1000-8000-00805f9b34fb");
const HEART_RATE_MEASUREMENT_UUID: Uuid = uuid!("00002a37-0000-1000-8000-00805f9b34fb");
const MANUFACTURER_NAME_UUID: Uuid = uuid!("00002a29-0000-1000-8000-00805f9b34fb");

/// Human readable names for known attributes.
const ATTRIBUTE_NAMES: &[(Uuid, &str)] = &[
    (HEART_RATE_SERVICE_UUID, "Heart Rate Service"),
    (DEVICE_INFORMATION_SERVICE_UUID, "Device Information Service"),
    (SENSOR_SERVICE_UUID, "Sensor Service"),
    (DOUBLE_TAP_SERVICE_UUID, "Double Tap Service"),
    (CONTROL_SERVICE_UUID, "Control Service"),
    (HEART_RATE_MEASUREMENT_UUID, "Heart Rate Measurement"),
    (MANUFACTURER_NAME_UUID, "Manufacturer Name String"),
    (TEMPERATURE_CHAR_UUID, "temperature measurement"),
    (PITCH_CHAR_UUID, "pitch measurement"),
    (ROLL_CHAR_UUID, "roll measurement"),
    (DOUBLE_TAP_CHAR_UUID, "double tap notification"),
    (CONTROL_CHAR_UUID, "write control"),
    (
        CLIENT_CHARACTERISTIC_CONFIG_UUID,
        "Client Characteristic Configuration",
    ),
];

/// Returns the human readable name of a known attribute.
pub fn lookup(uuid: &Uuid) -> Option<&'static str> {
    ATTRIBUTE_NAMES
        .iter()
        .find(|(known, _)| known == uuid)
        .map(|(_, name)| *name)
}

/// Opaque identifier of a characteristic endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CharacteristicId(Uuid);

impl CharacteristicId {
    pub const ROLL: Self = Self(ROLL_CHAR_UUID);
    pub const PITCH: Self = Self(PITCH_CHAR_UUID);
    pub const TEMPERATURE: Self = Self(TEMPERATURE_CHAR_UUID);
    pub const DOUBLE_TAP: Self = Self(DOUBLE_TAP_CHAR_UUID);
    pub const WRITE_CONTROL: Self = Self(CONTROL_CHAR_UUID);

    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub const fn uuid(&self) -> Uuid {
        self.0
    }

    /// Service the characteristic lives in, for the characteristics this crate knows about.
    pub fn service(&self) -> Option<Uuid> {
        if [Self::ROLL, Self::PITCH, Self::TEMPERATURE].contains(self) {
            Some(SENSOR_SERVICE_UUID)
        } else if *self == Self::DOUBLE_TAP {
            Some(DOUBLE_TAP_SERVICE_UUID)
        } else if *self == Self::WRITE_CONTROL {
            Some(CONTROL_SERVICE_UUID)
        } else {
            None
        }
    }

    pub fn name(&self) -> Option<&'static str> {
        lookup(&self.0)
    }
}

impl From<Uuid> for CharacteristicId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for CharacteristicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name} ({})", self.0),
            None => write!(f, "{}", self.0),
        }
    }
}
