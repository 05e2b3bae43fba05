//! btleplug-backed adapter
//!
//! The one concrete [`BleAdapter`] implementation, driving the
//! cross-platform btleplug central role. Peripherals observed during a
//! scan are cached so a later connect can resolve the opaque identity back
//! to a platform peripheral handle.

use crate::adapter::{
    AdvertisementStream, BleAdapter, ConnectionState, GattLink, ScanSettings,
};
use crate::error::{Result, SessionError};
use crate::peripheral::{Advertisement, PeripheralId};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Manager as _, Peripheral as _, PeripheralProperties,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

fn adapter_error(e: btleplug::Error) -> SessionError {
    SessionError::Adapter(e.to_string())
}

/// BLE adapter backed by the platform's btleplug central
pub struct BtleplugAdapter {
    adapter: Option<Adapter>,
    /// Peripherals seen during scans, keyed by their opaque identity
    seen: Arc<RwLock<HashMap<PeripheralId, Peripheral>>>,
}

impl BtleplugAdapter {
    /// Create an adapter bound to the first Bluetooth controller on the
    /// system. Succeeds with a disabled adapter when none is present.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await.map_err(adapter_error)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(adapter_error)?
            .into_iter()
            .next();

        match &adapter {
            Some(adapter) => match adapter.adapter_info().await {
                Ok(adapter_info) => info!("Using Bluetooth adapter {}", adapter_info),
                Err(e) => debug!("Could not read adapter info: {}", e),
            },
            None => warn!("No Bluetooth adapter found"),
        }

        Ok(Self {
            adapter,
            seen: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    fn require_adapter(&self) -> Result<&Adapter> {
        self.adapter.as_ref().ok_or(SessionError::AdapterUnavailable)
    }
}

#[async_trait]
impl BleAdapter for BtleplugAdapter {
    async fn is_enabled(&self) -> bool {
        self.adapter.is_some()
    }

    async fn start_broadcast_scan(&self, settings: &ScanSettings) -> Result<AdvertisementStream> {
        let adapter = self.require_adapter()?;

        // btleplug exposes no antenna power control; the power hint only
        // reaches platforms whose backend honors it
        adapter
            .start_scan(ScanFilter {
                services: settings.service_filter.clone(),
            })
            .await
            .map_err(adapter_error)?;
        debug!("Broadcast scan active");

        let events = adapter.events().await.map_err(adapter_error)?;
        let adapter = adapter.clone();
        let seen = self.seen.clone();
        let rescan_duplicates = settings.rescan_duplicates;

        let stream = events.filter_map(move |event| {
            let adapter = adapter.clone();
            let seen = seen.clone();
            async move {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) => id,
                    CentralEvent::DeviceUpdated(id) if rescan_duplicates => id,
                    _ => return None,
                };
                let peripheral = adapter.peripheral(&id).await.ok()?;
                let properties = peripheral.properties().await.ok()??;
                let advertisement =
                    advertisement_from(PeripheralId::new(id.to_string()), &properties);
                seen.write()
                    .await
                    .insert(advertisement.id.clone(), peripheral);
                Some(advertisement)
            }
        });

        Ok(Box::pin(stream))
    }

    async fn stop_broadcast_scan(&self) -> Result<()> {
        let Some(adapter) = self.adapter.as_ref() else {
            return Ok(());
        };
        adapter.stop_scan().await.map_err(adapter_error)?;
        debug!("Broadcast scan stopped");
        Ok(())
    }

    async fn connect(
        &self,
        target: &PeripheralId,
        timeout: Duration,
        progress: mpsc::UnboundedSender<ConnectionState>,
    ) -> Result<Arc<dyn GattLink>> {
        let adapter = self.require_adapter()?;
        let peripheral = self.seen.read().await.get(target).cloned().ok_or_else(|| {
            SessionError::ConnectionFailed(format!("peripheral {} has not been discovered", target))
        })?;

        let _ = progress.send(ConnectionState::Connecting);
        match tokio::time::timeout(timeout, peripheral.connect()).await {
            Err(_elapsed) => {
                // abandon the half-open attempt so a retry starts clean
                if let Err(e) = peripheral.disconnect().await {
                    debug!("Disconnect after timed-out attempt failed: {}", e);
                }
                let _ = progress.send(ConnectionState::Disconnected);
                Err(SessionError::ConnectionTimedOut)
            }
            Ok(Err(e)) => {
                let _ = progress.send(ConnectionState::Disconnected);
                Err(SessionError::ConnectionFailed(e.to_string()))
            }
            Ok(Ok(())) => {
                peripheral
                    .discover_services()
                    .await
                    .map_err(|e| SessionError::ConnectionFailed(e.to_string()))?;
                let _ = progress.send(ConnectionState::Connected);
                let link =
                    BtleplugLink::spawn(target.clone(), peripheral, adapter.clone()).await?;
                info!("Connected to {}", target);
                Ok(link)
            }
        }
    }
}

/// Transport handle over a connected btleplug peripheral
pub struct BtleplugLink {
    id: PeripheralId,
    peripheral: Peripheral,
    state: Mutex<ConnectionState>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ConnectionState>>>,
}

impl BtleplugLink {
    /// Wrap a connected peripheral and watch the adapter event stream for
    /// its disconnect
    async fn spawn(
        id: PeripheralId,
        peripheral: Peripheral,
        adapter: Adapter,
    ) -> Result<Arc<Self>> {
        let mut events = adapter.events().await.map_err(adapter_error)?;

        let link = Arc::new(Self {
            id,
            peripheral,
            state: Mutex::new(ConnectionState::Connected),
            subscribers: Mutex::new(Vec::new()),
        });

        let platform_id = link.peripheral.id();
        let weak = Arc::downgrade(&link);
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let Some(link) = weak.upgrade() else {
                    break;
                };
                match event {
                    CentralEvent::DeviceDisconnected(id) if id == platform_id => {
                        debug!("Adapter reported disconnect of {}", link.id);
                        link.set_state(ConnectionState::Disconnected);
                        break;
                    }
                    CentralEvent::DeviceConnected(id) if id == platform_id => {
                        link.set_state(ConnectionState::Connected);
                    }
                    _ => {}
                }
            }
        });

        Ok(link)
    }

    fn set_state(&self, next: ConnectionState) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == next {
                return;
            }
            *state = next;
        }
        self.subscribers
            .lock()
            .unwrap()
            .retain(|tx| tx.send(next).is_ok());
    }
}

#[async_trait]
impl GattLink for BtleplugLink {
    fn peripheral(&self) -> &PeripheralId {
        &self.id
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    fn state_feed(&self) -> mpsc::UnboundedReceiver<ConnectionState> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    async fn list_services(&self) -> Result<Vec<Uuid>> {
        self.peripheral
            .discover_services()
            .await
            .map_err(|e| SessionError::Gatt(e.to_string()))?;
        Ok(self
            .peripheral
            .services()
            .into_iter()
            .map(|service| service.uuid)
            .collect())
    }

    async fn write_characteristic(
        &self,
        service_id: Uuid,
        characteristic_id: Uuid,
        value: &[u8],
    ) -> Result<Vec<u8>> {
        let characteristic = self
            .peripheral
            .services()
            .into_iter()
            .filter(|service| service.uuid == service_id)
            .flat_map(|service| service.characteristics.into_iter())
            .find(|characteristic| characteristic.uuid == characteristic_id)
            .ok_or_else(|| {
                SessionError::Gatt(format!(
                    "characteristic {} not found under service {}",
                    characteristic_id, service_id
                ))
            })?;

        self.peripheral
            .write(&characteristic, value, WriteType::WithResponse)
            .await
            .map_err(|e| SessionError::Gatt(e.to_string()))?;

        // report what the peripheral actually committed when it can be
        // read back
        if characteristic.properties.contains(CharPropFlags::READ) {
            match self.peripheral.read(&characteristic).await {
                Ok(committed) => return Ok(committed),
                Err(e) => debug!("Read-back after write failed: {}", e),
            }
        }
        Ok(value.to_vec())
    }

    async fn disconnect(&self) -> Result<()> {
        match self.peripheral.is_connected().await {
            Ok(true) => {
                self.peripheral
                    .disconnect()
                    .await
                    .map_err(|e| SessionError::Gatt(e.to_string()))?;
            }
            Ok(false) => {}
            Err(e) => debug!("Could not query connection state: {}", e),
        }
        self.set_state(ConnectionState::Disconnected);
        Ok(())
    }
}

/// Map btleplug advertisement properties into the crate's advertisement
fn advertisement_from(id: PeripheralId, properties: &PeripheralProperties) -> Advertisement {
    let mut advertisement = Advertisement::new(id);
    advertisement.rssi = properties.rssi;
    advertisement.local_name = properties.local_name.clone();
    advertisement.manufacturer = properties
        .manufacturer_data
        .keys()
        .min()
        .map(|company_id| format!("{:#06x}", company_id));
    advertisement
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advertisement_mapping() {
        let mut properties = PeripheralProperties::default();
        properties.rssi = Some(-58);
        properties.local_name = Some("Thermo".to_string());
        properties.manufacturer_data.insert(0x004c, vec![0x01]);
        properties.manufacturer_data.insert(0x5254, vec![0x02]);

        let advertisement =
            advertisement_from(PeripheralId::from("hci0/dev_AA_BB"), &properties);
        assert_eq!(advertisement.rssi, Some(-58));
        assert_eq!(advertisement.local_name.as_deref(), Some("Thermo"));
        // lowest company id wins so repeated advertisements stay stable
        assert_eq!(advertisement.manufacturer.as_deref(), Some("0x004c"));
    }

    #[test]
    fn test_advertisement_mapping_empty_properties() {
        let advertisement =
            advertisement_from(PeripheralId::from("hci0/dev_AA_BB"), &PeripheralProperties::default());
        assert_eq!(advertisement.rssi, None);
        assert_eq!(advertisement.local_name, None);
        assert_eq!(advertisement.manufacturer, None);
    }
}
