//! Characteristic I/O
//!
//! Performs a single typed write against a characteristic of the connected
//! peripheral. Values cross this boundary as hex text and come back as the
//! value the transport reports committed, rendered through the byte codec.

use crate::adapter::GattLink;
use crate::codec;
use crate::error::Result;
use crate::events::SessionEvent;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Committed characteristic value in its raw and display forms
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenValue {
    /// Raw committed bytes
    pub bytes: Vec<u8>,
    /// Lowercase hex rendering
    pub hex: String,
    /// Best-effort UTF-8 rendering (empty when not valid UTF-8)
    pub text: String,
}

impl WrittenValue {
    fn from_bytes(bytes: Vec<u8>) -> Self {
        let hex = codec::to_hex(&bytes);
        let text = codec::to_display_text(&bytes);
        Self { bytes, hex, text }
    }
}

/// Single-write characteristic I/O against a borrowed transport handle
#[derive(Clone)]
pub struct CharacteristicIo {
    event_tx: mpsc::UnboundedSender<SessionEvent>,
}

impl CharacteristicIo {
    /// Create an I/O helper emitting on the given event channel
    pub fn new(event_tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { event_tx }
    }

    /// Decode `hex_text` and write it to the characteristic.
    ///
    /// Empty input is "nothing to write": the call is a no-op and returns
    /// `None`. Malformed hex is rejected before any transport call.
    /// Otherwise returns the committed value, which may differ from the
    /// requested one if the peripheral coerces it.
    pub async fn write(
        &self,
        link: &Arc<dyn GattLink>,
        service_id: Uuid,
        characteristic_id: Uuid,
        hex_text: &str,
    ) -> Result<Option<WrittenValue>> {
        let requested = codec::from_hex(hex_text)?;
        if requested.is_empty() {
            debug!("Empty write value for {}, nothing to do", characteristic_id);
            return Ok(None);
        }

        let committed = link
            .write_characteristic(service_id, characteristic_id, &requested)
            .await
            .map_err(|e| {
                warn!("Characteristic write failed: {}", e);
                e
            })?;

        let value = WrittenValue::from_bytes(committed);
        debug!(
            "Wrote characteristic {} on {}: committed {}",
            characteristic_id,
            service_id,
            value.hex
        );
        let _ = self.event_tx.send(SessionEvent::CharacteristicWritten {
            service_id,
            characteristic_id,
            value_hex: value.hex.clone(),
            value_text: value.text.clone(),
        });

        Ok(Some(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SessionError;
    use crate::testing::MockLink;
    use tokio::sync::mpsc::unbounded_channel;

    fn uuid(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    #[tokio::test]
    async fn test_empty_value_is_a_no_op() {
        let (tx, _rx) = unbounded_channel();
        let io = CharacteristicIo::new(tx);
        let mock = MockLink::connected("aa:bb");
        let link: Arc<dyn GattLink> = mock.clone();

        let written = io.write(&link, uuid(1), uuid(2), "").await.expect("no-op");
        assert!(written.is_none());
        assert!(mock.writes().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_hex_rejected_before_transport() {
        let (tx, _rx) = unbounded_channel();
        let io = CharacteristicIo::new(tx);
        let mock = MockLink::connected("aa:bb");
        let link: Arc<dyn GattLink> = mock.clone();

        let result = io.write(&link, uuid(1), uuid(2), "abc").await;
        assert!(matches!(result, Err(SessionError::MalformedInput(_))));
        assert!(mock.writes().is_empty());
    }

    #[tokio::test]
    async fn test_write_reports_committed_value() {
        let (tx, mut rx) = unbounded_channel();
        let io = CharacteristicIo::new(tx);
        let mock = MockLink::connected("aa:bb");
        // the peripheral coerces the written value
        mock.set_committed(vec![0x41, 0x42]);
        let link: Arc<dyn GattLink> = mock.clone();

        let written = io
            .write(&link, uuid(1), uuid(2), "ff00")
            .await
            .expect("write")
            .expect("value committed");

        assert_eq!(written.bytes, vec![0x41, 0x42]);
        assert_eq!(written.hex, "4142");
        assert_eq!(written.text, "AB");
        assert_eq!(mock.writes(), vec![(uuid(1), uuid(2), vec![0xff, 0x00])]);

        let event = rx.try_recv().expect("written event");
        match event {
            SessionEvent::CharacteristicWritten { value_hex, .. } => {
                assert_eq!(value_hex, "4142")
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_transport_failure_surfaces_as_gatt_error() {
        let (tx, _rx) = unbounded_channel();
        let io = CharacteristicIo::new(tx);
        let mock = MockLink::connected("aa:bb");
        mock.fail_next_write("write not permitted");
        let link: Arc<dyn GattLink> = mock.clone();

        let result = io.write(&link, uuid(1), uuid(2), "01").await;
        assert!(matches!(result, Err(SessionError::Gatt(_))));
    }
}
