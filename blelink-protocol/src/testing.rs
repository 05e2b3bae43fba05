//! Deterministic test doubles for the adapter boundary
//!
//! [`MockAdapter`] and [`MockLink`] substitute for the platform BLE stack
//! so the session state machines can be unit tested without radio
//! hardware. Advertisements are pushed by the test, connection outcomes
//! are scripted, and peripheral-initiated disconnects are simulated with
//! [`MockLink::remote_disconnect`].

use crate::adapter::{
    AdvertisementStream, BleAdapter, ConnectionState, GattLink, ScanSettings,
};
use crate::error::{Result, SessionError};
use crate::peripheral::{Advertisement, PeripheralId};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Scripted outcome of the next connection attempt
#[derive(Debug, Clone)]
pub enum MockConnect {
    /// Produce a connected [`MockLink`]
    Succeed,
    /// Report expiry of the connection timeout
    Timeout,
    /// Report an adapter-level failure with the given reason
    Fail(String),
}

/// Fake BLE adapter with scripted behavior
pub struct MockAdapter {
    enabled: AtomicBool,
    connect_behavior: Mutex<MockConnect>,
    feed: Mutex<Option<mpsc::UnboundedSender<Advertisement>>>,
    next_services: Mutex<Vec<Uuid>>,
    next_list_error: Mutex<Option<String>>,
    last_link: Mutex<Option<Arc<MockLink>>>,
    scan_count: AtomicUsize,
    stop_count: AtomicUsize,
    connect_count: AtomicUsize,
}

impl MockAdapter {
    /// Create an enabled adapter whose connects succeed
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            enabled: AtomicBool::new(true),
            connect_behavior: Mutex::new(MockConnect::Succeed),
            feed: Mutex::new(None),
            next_services: Mutex::new(Vec::new()),
            next_list_error: Mutex::new(None),
            last_link: Mutex::new(None),
            scan_count: AtomicUsize::new(0),
            stop_count: AtomicUsize::new(0),
            connect_count: AtomicUsize::new(0),
        })
    }

    /// Toggle the simulated radio
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Script the outcome of subsequent connection attempts
    pub fn set_connect_behavior(&self, behavior: MockConnect) {
        *self.connect_behavior.lock().unwrap() = behavior;
    }

    /// Services the next created link will report
    pub fn set_next_services(&self, services: Vec<Uuid>) {
        *self.next_services.lock().unwrap() = services;
    }

    /// Make the next created link fail its first enumeration
    pub fn set_next_list_error(&self, message: &str) {
        *self.next_list_error.lock().unwrap() = Some(message.to_string());
    }

    /// Deliver an advertisement into the running scan feed.
    ///
    /// Returns whether a feed was open to receive it; a `false` result
    /// means the broadcast arrived after the scan ended and was dropped,
    /// exactly like a late callback from real hardware.
    pub fn push_advertisement(&self, advertisement: Advertisement) -> bool {
        match self.feed.lock().unwrap().as_ref() {
            Some(tx) => tx.send(advertisement).is_ok(),
            None => false,
        }
    }

    /// Number of scan requests issued
    pub fn scan_count(&self) -> usize {
        self.scan_count.load(Ordering::SeqCst)
    }

    /// Number of scan terminations issued
    pub fn stop_count(&self) -> usize {
        self.stop_count.load(Ordering::SeqCst)
    }

    /// Number of connection attempts issued
    pub fn connect_count(&self) -> usize {
        self.connect_count.load(Ordering::SeqCst)
    }

    /// The most recently created link, if any
    pub fn last_link(&self) -> Option<Arc<MockLink>> {
        self.last_link.lock().unwrap().clone()
    }
}

#[async_trait]
impl BleAdapter for MockAdapter {
    async fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    async fn start_broadcast_scan(&self, _settings: &ScanSettings) -> Result<AdvertisementStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.feed.lock().unwrap() = Some(tx);
        self.scan_count.fetch_add(1, Ordering::SeqCst);

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|advertisement| (advertisement, rx))
        });
        Ok(Box::pin(stream))
    }

    async fn stop_broadcast_scan(&self) -> Result<()> {
        if self.feed.lock().unwrap().take().is_some() {
            self.stop_count.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn connect(
        &self,
        target: &PeripheralId,
        _timeout: Duration,
        progress: mpsc::UnboundedSender<ConnectionState>,
    ) -> Result<Arc<dyn GattLink>> {
        self.connect_count.fetch_add(1, Ordering::SeqCst);
        let _ = progress.send(ConnectionState::Connecting);

        let behavior = self.connect_behavior.lock().unwrap().clone();
        match behavior {
            MockConnect::Timeout => {
                let _ = progress.send(ConnectionState::Disconnected);
                Err(SessionError::ConnectionTimedOut)
            }
            MockConnect::Fail(reason) => {
                let _ = progress.send(ConnectionState::Disconnected);
                Err(SessionError::ConnectionFailed(reason))
            }
            MockConnect::Succeed => {
                let link = MockLink::connected(target.as_str());
                link.set_services(self.next_services.lock().unwrap().clone());
                if let Some(message) = self.next_list_error.lock().unwrap().take() {
                    link.fail_next_list(&message);
                }
                *self.last_link.lock().unwrap() = Some(link.clone());
                let _ = progress.send(ConnectionState::Connected);
                Ok(link)
            }
        }
    }
}

/// Fake transport handle with scripted GATT behavior
pub struct MockLink {
    id: PeripheralId,
    state: Mutex<ConnectionState>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ConnectionState>>>,
    services: Mutex<Vec<Uuid>>,
    list_error: Mutex<Option<String>>,
    write_error: Mutex<Option<String>>,
    committed: Mutex<Option<Vec<u8>>>,
    writes: Mutex<Vec<(Uuid, Uuid, Vec<u8>)>>,
    disconnects: AtomicUsize,
}

impl MockLink {
    /// Create a link already in the `Connected` state
    pub fn connected(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: PeripheralId::from(id),
            state: Mutex::new(ConnectionState::Connected),
            subscribers: Mutex::new(Vec::new()),
            services: Mutex::new(Vec::new()),
            list_error: Mutex::new(None),
            write_error: Mutex::new(None),
            committed: Mutex::new(None),
            writes: Mutex::new(Vec::new()),
            disconnects: AtomicUsize::new(0),
        })
    }

    /// Script the service list this link reports
    pub fn set_services(&self, services: Vec<Uuid>) {
        *self.services.lock().unwrap() = services;
    }

    /// Make the next enumeration fail with the given message
    pub fn fail_next_list(&self, message: &str) {
        *self.list_error.lock().unwrap() = Some(message.to_string());
    }

    /// Make the next write fail with the given message
    pub fn fail_next_write(&self, message: &str) {
        *self.write_error.lock().unwrap() = Some(message.to_string());
    }

    /// Script the committed value reported for writes (defaults to echoing
    /// the requested value)
    pub fn set_committed(&self, value: Vec<u8>) {
        *self.committed.lock().unwrap() = Some(value);
    }

    /// Every write issued against this link, in order
    pub fn writes(&self) -> Vec<(Uuid, Uuid, Vec<u8>)> {
        self.writes.lock().unwrap().clone()
    }

    /// Number of disconnect calls issued against this link
    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// Simulate a peripheral-initiated connection drop
    pub fn remote_disconnect(&self) {
        self.set_state(ConnectionState::Disconnected);
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
impl GattLink for MockLink {
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
        if let Some(message) = self.list_error.lock().unwrap().take() {
            return Err(SessionError::Gatt(message));
        }
        Ok(self.services.lock().unwrap().clone())
    }

    async fn write_characteristic(
        &self,
        service_id: Uuid,
        characteristic_id: Uuid,
        value: &[u8],
    ) -> Result<Vec<u8>> {
        if let Some(message) = self.write_error.lock().unwrap().take() {
            return Err(SessionError::Gatt(message));
        }
        self.writes
            .lock()
            .unwrap()
            .push((service_id, characteristic_id, value.to_vec()));
        Ok(self
            .committed
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| value.to_vec()))
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.set_state(ConnectionState::Disconnected);
        Ok(())
    }
}
