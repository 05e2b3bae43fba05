//! Adapter boundary
//!
//! Defines the capability this crate consumes from the platform BLE stack:
//! broadcast scanning and GATT connections. The sessions only ever see
//! these traits; the one concrete implementation lives in
//! [`bluetooth`](self::bluetooth), and [`crate::testing`] substitutes a
//! deterministic fake for unit testing the session state machines without
//! radio hardware.

pub mod bluetooth;

use crate::error::Result;
use crate::peripheral::{Advertisement, PeripheralId};
use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Stream of advertisements produced by an in-flight broadcast scan
pub type AdvertisementStream = Pin<Box<dyn Stream<Item = Advertisement> + Send>>;

/// Antenna power hint for a broadcast scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PowerMode {
    /// Conserve power at the cost of discovery latency
    #[default]
    LowPower,
    /// Platform default tradeoff
    Balanced,
    /// Fastest discovery, highest drain
    HighPower,
}

/// Settings for one broadcast scan request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanSettings {
    /// Restrict discovery to peripherals advertising one of these services.
    /// Empty means unrestricted.
    pub service_filter: Vec<Uuid>,
    /// Antenna power hint
    pub power_mode: PowerMode,
    /// Whether repeated broadcasts from an already-seen peripheral
    /// re-trigger the advertisement feed
    pub rescan_duplicates: bool,
}

impl ScanSettings {
    /// Unrestricted low-power scan that keeps reporting repeat broadcasts
    pub fn broadcast() -> Self {
        Self {
            service_filter: Vec::new(),
            power_mode: PowerMode::LowPower,
            rescan_duplicates: true,
        }
    }
}

/// Connection state reported by the adapter and mirrored by the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No transport handle is open
    Disconnected,
    /// A connection attempt is in flight
    Connecting,
    /// The transport handle is live
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
        }
    }
}

/// Platform BLE capability consumed by the sessions
#[async_trait]
pub trait BleAdapter: Send + Sync {
    /// Whether the radio is present and enabled
    async fn is_enabled(&self) -> bool;

    /// Issue a broadcast scan request.
    ///
    /// Suspends until the scan is active on the adapter, then returns the
    /// advertisement feed. The feed keeps streaming until
    /// [`stop_broadcast_scan`](Self::stop_broadcast_scan) is called or the
    /// adapter ends the scan on its own.
    async fn start_broadcast_scan(&self, settings: &ScanSettings) -> Result<AdvertisementStream>;

    /// Terminate the in-flight broadcast scan. No-op when none is running.
    async fn stop_broadcast_scan(&self) -> Result<()>;

    /// Connect to a previously discovered peripheral.
    ///
    /// Suspends until the adapter reports terminal success or failure, or
    /// the timeout expires ([`SessionError::ConnectionTimedOut`]).
    /// Intermediate states are mirrored into `progress` for display.
    ///
    /// [`SessionError::ConnectionTimedOut`]: crate::error::SessionError::ConnectionTimedOut
    async fn connect(
        &self,
        target: &PeripheralId,
        timeout: Duration,
        progress: mpsc::UnboundedSender<ConnectionState>,
    ) -> Result<Arc<dyn GattLink>>;
}

/// Live transport handle to a connected peripheral's GATT server.
///
/// Exclusively owned by the connection session that created it; catalog and
/// characteristic operations borrow it per call and must not retain it.
#[async_trait]
pub trait GattLink: Send + Sync {
    /// Identity of the connected peripheral
    fn peripheral(&self) -> &PeripheralId;

    /// Current transport state
    fn state(&self) -> ConnectionState;

    /// Subscribe to transport state changes, delivered in adapter order.
    ///
    /// A `Disconnected` event on this feed is the signal that the
    /// peripheral dropped the connection.
    fn state_feed(&self) -> mpsc::UnboundedReceiver<ConnectionState>;

    /// Enumerate all services exposed by the GATT server
    async fn list_services(&self) -> Result<Vec<Uuid>>;

    /// Write a characteristic value and return the value the peripheral
    /// reports as committed (which may differ from the requested value)
    async fn write_characteristic(
        &self,
        service_id: Uuid,
        characteristic_id: Uuid,
        value: &[u8],
    ) -> Result<Vec<u8>>;

    /// Tear down the transport. Safe to call more than once.
    async fn disconnect(&self) -> Result<()>;
}
