//! BLE scan and connection orchestration
//!
//! This library discovers nearby BLE peripherals, establishes a GATT
//! connection to a selected one, enumerates its services, and performs
//! typed characteristic writes. The platform radio stack is consumed
//! through the injected [`BleAdapter`] capability; presentation concerns
//! reach the library only through the sessions' event streams and
//! commands.
//!
//! The two session types carry all temporal behavior: [`ScanSession`] owns
//! the timed, cancellable discovery window with its de-duplicated
//! peripheral feed, and [`ConnectionSession`] owns the
//! connect/enumerate/write/disconnect lifecycle including automatic
//! teardown when the peripheral drops the link.

pub mod adapter;
pub mod characteristic;
pub mod codec;
pub mod connection;
pub mod events;
pub mod peripheral;
pub mod scan;
pub mod services;
pub mod testing;

mod error;

pub use adapter::{
    bluetooth::BtleplugAdapter, AdvertisementStream, BleAdapter, ConnectionState, GattLink,
    PowerMode, ScanSettings,
};
pub use characteristic::{CharacteristicIo, WrittenValue};
pub use connection::{ConnectionConfig, ConnectionSession, CONNECT_TIMEOUT_SECS};
pub use error::{Result, SessionError};
pub use events::SessionEvent;
pub use peripheral::{Advertisement, PeripheralId, PeripheralRecord};
pub use scan::{
    ScanConfig, ScanSession, SCAN_SECONDS_DEFAULT, SCAN_SECONDS_MAX, SCAN_SECONDS_MIN,
};
pub use services::ServiceCatalog;
