//! Events delivered to session consumers.

use crate::attributes::CharacteristicId;

/// Notification emitted on a session's event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattEvent {
    Connected,
    Disconnected,
    ServicesDiscovered,
    /// A read completed or a notification arrived.
    CharacteristicUpdated(CharacteristicId, Vec<u8>),
    WriteCompleted(CharacteristicId),
}
