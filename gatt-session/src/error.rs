//! Defines the error classes reported by sessions and adapters.

use bluer::Address;

use crate::attributes::CharacteristicId;

/// Errors surfaced by [`crate::GattSession`] and the adapter seam.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GattError {
    /// The platform adapter is missing or powered off. Fatal to the session.
    #[error("Bluetooth adapter unavailable")]
    AdapterUnavailable,

    /// The remote device could not be resolved; the caller may retry.
    #[error("device {0} not found")]
    DeviceNotFound(String),

    /// The stack refused an operation. Logged and dropped by the session.
    #[error("operation on {id} rejected: {reason}")]
    OperationRejected {
        id: CharacteristicId,
        reason: String,
    },

    /// An operation was attempted while the session is not connected.
    #[error("not connected")]
    Disconnected,

    /// The address was empty or not of the form `AA:BB:CC:DD:EE:FF`.
    #[error("invalid device address {0:?}")]
    InvalidAddress(String),

    /// The session is linked to `bound` and cannot be pointed at another device.
    #[error("session belongs to {bound}, not {requested}")]
    AddressMismatch { bound: Address, requested: Address },

    /// The session was closed and can no longer be used.
    #[error("session closed")]
    Closed,

    #[error("payload of {0} bytes is too short for a sensor reading")]
    PayloadTooShort(usize),
}

impl GattError {
    pub(crate) fn rejected(id: CharacteristicId, reason: impl ToString) -> Self {
        GattError::OperationRejected {
            id,
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, GattError>;
