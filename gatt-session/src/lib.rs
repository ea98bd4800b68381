//! GATT client sessions for the roll/pitch/temperature sensor peripheral.
//!
//! A [`GattSession`] wraps one connection made through a [`BleAdapter`], tracks its
//! [`ConnectionState`] and publishes [`GattEvent`]s on an async stream. [`SensorEvent`] turns
//! raw characteristic updates into typed readings. [`bluez::BluezAdapter`] provides the
//! adapter on Linux.

pub mod attributes;
pub mod bluez;
pub mod control;
pub mod error;
pub mod event;
pub mod link;
pub mod reading;
pub mod registry;
pub mod session;

pub use bluer::Address;
pub use attributes::CharacteristicId;
pub use control::ControlCommand;
pub use error::{GattError, Result};
pub use event::GattEvent;
pub use link::{parse_address, BleAdapter, ConnectionState, GattCallback, GattLink};
pub use reading::{FixedPoint, SensorEvent, SensorReading};
pub use registry::GattClient;
pub use session::GattSession;
