//! Session event surface
//!
//! Both sessions expose their observable state as a stream of
//! [`SessionEvent`]s delivered over an unbounded channel. Consumers
//! register via the sessions' `subscribe()` and receive an event after each
//! state mutation; `Notice` events carry the user-visible messages that a
//! presentation layer would show as a toast.

use crate::adapter::ConnectionState;
use crate::peripheral::{PeripheralId, PeripheralRecord};
use uuid::Uuid;

/// Events emitted by the scan and connection sessions
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A timed discovery window opened
    ScanStarted {
        /// Clamped window length in seconds
        seconds: u64,
    },

    /// Once-a-second progress report while a scan is running
    ScanTick {
        /// Whole seconds left in the discovery window
        remaining_secs: u64,
    },

    /// A peripheral was seen for the first time this session
    PeripheralDiscovered {
        /// Snapshot of the new record
        record: PeripheralRecord,
    },

    /// A known peripheral re-advertised and its record was merge-updated
    PeripheralUpdated {
        /// Snapshot of the updated record
        record: PeripheralRecord,
    },

    /// The discovery window closed (timeout or explicit stop)
    ScanFinished,

    /// The connection session's state or display text changed
    ConnectionStateChanged {
        /// New state
        state: ConnectionState,
        /// Sub-phase text for display (e.g. "Reading services"); `None`
        /// means the state name itself is the display text
        detail: Option<String>,
    },

    /// The session's busy flag flipped
    BusyChanged {
        /// Whether an operation is now in flight
        busy: bool,
    },

    /// A service identifier was appended to the catalog
    ServiceDiscovered {
        /// The newly catalogued service
        service_id: Uuid,
    },

    /// Service enumeration finished for the active connection
    ServicesEnumerated {
        /// Full catalog contents in discovery order
        services: Vec<Uuid>,
    },

    /// A characteristic write committed
    CharacteristicWritten {
        /// Owning service
        service_id: Uuid,
        /// Written characteristic
        characteristic_id: Uuid,
        /// Committed value as lowercase hex
        value_hex: String,
        /// Committed value as best-effort UTF-8
        value_text: String,
    },

    /// User-visible message (the toast channel)
    Notice {
        /// Message text
        message: String,
    },
}

impl SessionEvent {
    /// Create a notice event
    pub fn notice(message: impl Into<String>) -> Self {
        SessionEvent::Notice {
            message: message.into(),
        }
    }

    /// Check if this is a user-visible notice
    pub fn is_notice(&self) -> bool {
        matches!(self, SessionEvent::Notice { .. })
    }

    /// Get the peripheral identity if this is a discovery event
    pub fn peripheral_id(&self) -> Option<&PeripheralId> {
        match self {
            SessionEvent::PeripheralDiscovered { record } => Some(record.id()),
            SessionEvent::PeripheralUpdated { record } => Some(record.id()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peripheral::Advertisement;

    #[test]
    fn test_notice_constructor() {
        let event = SessionEvent::notice("No services found");
        assert!(event.is_notice());
        match event {
            SessionEvent::Notice { message } => assert_eq!(message, "No services found"),
            _ => panic!("expected notice"),
        }
    }

    #[test]
    fn test_peripheral_id_extraction() {
        let record = PeripheralRecord::from_advertisement(
            &Advertisement::new(PeripheralId::from("aa:bb")),
            0,
        );
        let event = SessionEvent::PeripheralDiscovered { record };
        assert_eq!(event.peripheral_id().map(PeripheralId::as_str), Some("aa:bb"));

        let tick = SessionEvent::ScanTick { remaining_secs: 3 };
        assert!(tick.peripheral_id().is_none());
    }
}
