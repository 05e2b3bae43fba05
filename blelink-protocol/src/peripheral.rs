//! Discovered peripheral bookkeeping
//!
//! A [`PeripheralRecord`] is the in-memory representation of one peripheral
//! observed during a scan. Records are keyed by the adapter-assigned
//! identity and merge-updated in place as repeated advertisements arrive;
//! they are never evicted while the owning scan session is alive.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Stable, adapter-assigned identity of a peripheral.
///
/// Opaque to this crate; equality and hashing on the identity are the
/// de-duplication contract for the discovery feed and the retarget check.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeripheralId(String);

impl PeripheralId {
    /// Create an identity from its adapter-level string form
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The adapter-level string form
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeripheralId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// One advertisement broadcast observed by the adapter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Advertisement {
    /// Identity of the broadcasting peripheral
    pub id: PeripheralId,
    /// Signal strength in dBm, when the adapter reports it
    pub rssi: Option<i16>,
    /// Advertised device name
    pub local_name: Option<String>,
    /// Advertised manufacturer tag
    pub manufacturer: Option<String>,
}

impl Advertisement {
    /// Create an advertisement carrying only the peripheral identity
    pub fn new(id: PeripheralId) -> Self {
        Self {
            id,
            rssi: None,
            local_name: None,
            manufacturer: None,
        }
    }

    /// Set the reported signal strength
    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }

    /// Set the advertised device name
    pub fn with_local_name(mut self, name: impl Into<String>) -> Self {
        self.local_name = Some(name.into());
        self
    }

    /// Set the advertised manufacturer tag
    pub fn with_manufacturer(mut self, manufacturer: impl Into<String>) -> Self {
        self.manufacturer = Some(manufacturer.into());
        self
    }
}

/// In-memory record of one discovered peripheral
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeripheralRecord {
    id: PeripheralId,
    /// Most recently reported signal strength in dBm
    pub rssi: Option<i16>,
    /// Most recently advertised device name
    pub local_name: Option<String>,
    /// Most recently advertised manufacturer tag
    pub manufacturer: Option<String>,
    /// UNIX timestamp (seconds) of the last advertisement seen
    pub last_seen: u64,
}

impl PeripheralRecord {
    /// Create a record from the first advertisement seen for this identity
    pub fn from_advertisement(advertisement: &Advertisement, seen_at: u64) -> Self {
        Self {
            id: advertisement.id.clone(),
            rssi: advertisement.rssi,
            local_name: advertisement.local_name.clone(),
            manufacturer: advertisement.manufacturer.clone(),
            last_seen: seen_at,
        }
    }

    /// The identity this record was created with; never changes
    pub fn id(&self) -> &PeripheralId {
        &self.id
    }

    /// Merge a newer advertisement into this record (last write wins).
    ///
    /// The identity is left untouched; every other field is overwritten in
    /// place.
    pub fn merge(&mut self, advertisement: &Advertisement, seen_at: u64) {
        self.rssi = advertisement.rssi;
        self.local_name = advertisement.local_name.clone();
        self.manufacturer = advertisement.manufacturer.clone();
        self.last_seen = seen_at;
    }

    /// Name to show for this peripheral, falling back to the identity when
    /// no name was advertised
    pub fn display_name(&self) -> String {
        self.local_name
            .clone()
            .unwrap_or_else(|| format!("BLE Device {}", self.id))
    }
}

/// Get current UNIX timestamp in seconds
pub(crate) fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn advertisement(id: &str) -> Advertisement {
        Advertisement::new(PeripheralId::from(id))
            .with_rssi(-60)
            .with_local_name("Thermo")
            .with_manufacturer("0x004c")
    }

    #[test]
    fn test_record_from_first_advertisement() {
        let record = PeripheralRecord::from_advertisement(&advertisement("aa:bb"), 100);
        assert_eq!(record.id().as_str(), "aa:bb");
        assert_eq!(record.rssi, Some(-60));
        assert_eq!(record.local_name.as_deref(), Some("Thermo"));
        assert_eq!(record.last_seen, 100);
    }

    #[test]
    fn test_merge_last_write_wins() {
        let mut record = PeripheralRecord::from_advertisement(&advertisement("aa:bb"), 100);

        let update = Advertisement::new(PeripheralId::from("aa:bb")).with_rssi(-42);
        record.merge(&update, 101);

        assert_eq!(record.rssi, Some(-42));
        // fields absent from the newer advertisement are overwritten too
        assert_eq!(record.local_name, None);
        assert_eq!(record.manufacturer, None);
        assert_eq!(record.last_seen, 101);
    }

    #[test]
    fn test_merge_preserves_identity() {
        let mut record = PeripheralRecord::from_advertisement(&advertisement("aa:bb"), 100);
        record.merge(&advertisement("aa:bb"), 101);
        assert_eq!(record.id(), &PeripheralId::from("aa:bb"));
    }

    #[test]
    fn test_display_name_fallback() {
        let record = PeripheralRecord::from_advertisement(
            &Advertisement::new(PeripheralId::from("aa:bb")),
            0,
        );
        assert_eq!(record.display_name(), "BLE Device aa:bb");

        let named = PeripheralRecord::from_advertisement(&advertisement("aa:bb"), 0);
        assert_eq!(named.display_name(), "Thermo");
    }

    #[test]
    fn test_record_serialization() {
        let record = PeripheralRecord::from_advertisement(&advertisement("aa:bb"), 7);
        let json = serde_json::to_string(&record).expect("should serialize");
        let recovered: PeripheralRecord = serde_json::from_str(&json).expect("should deserialize");

        assert_eq!(recovered.id(), record.id());
        assert_eq!(recovered.rssi, record.rssi);
        assert_eq!(recovered.last_seen, record.last_seen);
    }
}
