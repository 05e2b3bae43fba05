//! Connection session
//!
//! Owns the lifecycle of a single GATT connection: connect with timeout,
//! progress reporting, service enumeration handoff, characteristic writes,
//! and automatic teardown when the peripheral drops the link. The session
//! is long-lived and re-targeted as the user selects different
//! peripherals; at most one transport handle is ever open.

use crate::adapter::{BleAdapter, ConnectionState, GattLink};
use crate::characteristic::{CharacteristicIo, WrittenValue};
use crate::error::{Result, SessionError};
use crate::events::SessionEvent;
use crate::peripheral::PeripheralRecord;
use crate::services::ServiceCatalog;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Fixed bound on one connection attempt, in seconds
pub const CONNECT_TIMEOUT_SECS: u64 = 15;

/// Configuration for the connection session
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Bound on one connection attempt
    pub connect_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
        }
    }
}

/// Scoped busy-flag acquisition; release is guaranteed on every exit path
struct BusyGuard {
    flag: Arc<AtomicBool>,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
}

impl BusyGuard {
    fn acquire(
        flag: &Arc<AtomicBool>,
        event_tx: &mpsc::UnboundedSender<SessionEvent>,
    ) -> Option<Self> {
        if flag
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return None;
        }
        let _ = event_tx.send(SessionEvent::BusyChanged { busy: true });
        Some(Self {
            flag: flag.clone(),
            event_tx: event_tx.clone(),
        })
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
        let _ = self.event_tx.send(SessionEvent::BusyChanged { busy: false });
    }
}

/// Lifecycle of a single GATT connection over an injected adapter
pub struct ConnectionSession {
    adapter: Arc<dyn BleAdapter>,
    config: ConnectionConfig,
    target: Arc<RwLock<Option<PeripheralRecord>>>,
    link: Arc<RwLock<Option<Arc<dyn GattLink>>>>,
    state: Arc<RwLock<ConnectionState>>,
    status: Arc<RwLock<String>>,
    busy: Arc<AtomicBool>,
    catalog: ServiceCatalog,
    io: CharacteristicIo,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
    event_rx: Arc<RwLock<mpsc::UnboundedReceiver<SessionEvent>>>,
}

impl ConnectionSession {
    /// Create a disconnected session with the given configuration
    pub fn new(adapter: Arc<dyn BleAdapter>, config: ConnectionConfig) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            adapter,
            config,
            target: Arc::new(RwLock::new(None)),
            link: Arc::new(RwLock::new(None)),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            status: Arc::new(RwLock::new(ConnectionState::Disconnected.to_string())),
            busy: Arc::new(AtomicBool::new(false)),
            catalog: ServiceCatalog::new(event_tx.clone()),
            io: CharacteristicIo::new(event_tx.clone()),
            event_tx,
            event_rx: Arc::new(RwLock::new(event_rx)),
        }
    }

    /// Create a disconnected session with default configuration
    pub fn with_defaults(adapter: Arc<dyn BleAdapter>) -> Self {
        Self::new(adapter, ConnectionConfig::default())
    }

    /// Get a receiver for session events
    pub async fn subscribe(&self) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();

        // Forward events
        let event_rx = self.event_rx.clone();
        tokio::spawn(async move {
            let mut rx_lock = event_rx.write().await;
            while let Some(event) = rx_lock.recv().await {
                if tx.send(event).is_err() {
                    break;
                }
            }
        });

        rx
    }

    /// Current connection state
    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Display text for the current state, including sub-phases such as
    /// "Reading services"
    pub async fn status_text(&self) -> String {
        self.status.read().await.clone()
    }

    /// Whether an operation is in flight
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Whether the session is doing anything of interest to a user:
    /// busy, connecting, or connected
    pub async fn is_engaged(&self) -> bool {
        self.is_busy() || *self.state.read().await != ConnectionState::Disconnected
    }

    /// The currently targeted peripheral, if one was selected
    pub async fn target(&self) -> Option<PeripheralRecord> {
        self.target.read().await.clone()
    }

    /// Known services of the active connection, in discovery order
    pub async fn services(&self) -> Vec<Uuid> {
        self.catalog.services().await
    }

    /// Select the peripheral this session operates on.
    ///
    /// When the new peripheral differs (by adapter-level identity) from the
    /// current target while a connection is open, the old connection is
    /// closed before the target is swapped. Returns whether the target
    /// actually changed.
    pub async fn retarget(&self, peripheral: PeripheralRecord) -> Result<bool> {
        let changed = {
            let target = self.target.read().await;
            target.as_ref().map(|t| t.id() != peripheral.id()).unwrap_or(true)
        };

        if changed && self.link.read().await.is_some() {
            info!("Retargeting to {}, closing open connection", peripheral.id());
            self.close().await?;
        }

        *self.target.write().await = Some(peripheral);
        Ok(changed)
    }

    /// Open a connection to the targeted peripheral.
    ///
    /// No-op when busy or when the session is not `Disconnected`. The
    /// attempt is bounded by the configured timeout; on success the service
    /// catalog is populated within the same busy window, and the transport
    /// state feed is watched so a peripheral-initiated drop tears the
    /// session down automatically.
    pub async fn open(&self) -> Result<()> {
        let Some(_guard) = BusyGuard::acquire(&self.busy, &self.event_tx) else {
            debug!("Open requested while busy, ignoring");
            return Ok(());
        };
        if *self.state.read().await != ConnectionState::Disconnected {
            debug!("Open requested while already connected, ignoring");
            return Ok(());
        }

        // drop any stale handle before dialing
        self.close_inner().await;

        let Some(target) = self.target.read().await.clone() else {
            warn!("Open requested with no peripheral selected");
            return Ok(());
        };

        self.apply_state(ConnectionState::Connecting, None).await;
        info!("Connecting to {} ({})", target.id(), target.display_name());

        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        self.spawn_progress_mirror(progress_rx);

        match self
            .adapter
            .connect(target.id(), self.config.connect_timeout, progress_tx)
            .await
        {
            Ok(link) => {
                debug!("Connected to {}, state={}", target.id(), link.state());
                *self.link.write().await = Some(link.clone());
                self.spawn_link_watcher(link.state_feed());
                self.apply_state(ConnectionState::Connected, None).await;

                self.apply_state(ConnectionState::Connected, Some("Reading services"))
                    .await;
                match self.catalog.enumerate(&link).await {
                    Ok(services) => {
                        let _ = self
                            .event_tx
                            .send(SessionEvent::ServicesEnumerated { services });
                    }
                    Err(e) => {
                        // the connection stands even when the catalog
                        // could not be populated
                        warn!("Service enumeration failed: {}", e);
                        let _ = self.event_tx.send(SessionEvent::notice(e.user_message()));
                    }
                }
                self.apply_state(link.state(), None).await;
            }
            Err(SessionError::ConnectionTimedOut) => {
                let message = format!(
                    "Connection attempt cancelled after {} seconds",
                    self.config.connect_timeout.as_secs()
                );
                info!("{}", message);
                let _ = self.event_tx.send(SessionEvent::notice(message));
                self.apply_state(ConnectionState::Disconnected, None).await;
            }
            Err(e) => {
                info!("Connection to {} failed: {}", target.id(), e);
                let _ = self.event_tx.send(SessionEvent::notice(e.user_message()));
                self.apply_state(ConnectionState::Disconnected, None).await;
            }
        }

        Ok(())
    }

    /// Close the open connection and clear the service catalog.
    ///
    /// No-op when no transport handle exists; always safe to call again.
    pub async fn close(&self) -> Result<()> {
        if self.link.read().await.is_none() {
            return Ok(());
        }
        let _guard = BusyGuard::acquire(&self.busy, &self.event_tx);
        self.close_inner().await;
        Ok(())
    }

    /// Write `hex_text` to a characteristic of the connected peripheral.
    ///
    /// Empty input is a no-op returning `None`. Transport failures are
    /// reported as a notice and returned as
    /// [`SessionError::Gatt`]; they do not close the connection.
    pub async fn write_characteristic(
        &self,
        service_id: Uuid,
        characteristic_id: Uuid,
        hex_text: &str,
    ) -> Result<Option<WrittenValue>> {
        let Some(link) = self.link.read().await.clone() else {
            return Err(SessionError::invalid_state("no open connection"));
        };

        let _guard = BusyGuard::acquire(&self.busy, &self.event_tx);
        let result = self.io.write(&link, service_id, characteristic_id, hex_text).await;
        if let Err(e) = &result {
            let _ = self.event_tx.send(SessionEvent::notice(e.user_message()));
        }
        result
    }

    /// Tear down the link, catalog and state without touching the busy flag
    async fn close_inner(&self) {
        let link = self.link.write().await.take();
        if let Some(link) = link {
            debug!("Closing connection to {}, state={}", link.peripheral(), link.state());
            if let Err(e) = link.disconnect().await {
                warn!("Error closing connection: {}", e);
            }
        }
        self.catalog.clear().await;
        self.apply_state(ConnectionState::Disconnected, None).await;
    }

    /// Mirror adapter connect progress into the display status
    fn spawn_progress_mirror(&self, mut progress_rx: mpsc::UnboundedReceiver<ConnectionState>) {
        let status = self.status.clone();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            while let Some(progress) = progress_rx.recv().await {
                let text = progress.to_string();
                let mut current = status.write().await;
                if *current != text {
                    *current = text;
                    drop(current);
                    let _ = event_tx.send(SessionEvent::ConnectionStateChanged {
                        state: progress,
                        detail: None,
                    });
                }
            }
        });
    }

    /// Watch the transport state feed; a `Disconnected` event always tears
    /// the session down, no matter what preceded it
    fn spawn_link_watcher(&self, mut feed: mpsc::UnboundedReceiver<ConnectionState>) {
        let link_slot = self.link.clone();
        let catalog = self.catalog.clone();
        let state = self.state.clone();
        let status = self.status.clone();
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            while let Some(link_state) = feed.recv().await {
                if link_state != ConnectionState::Disconnected {
                    apply_state_to(&state, &status, &event_tx, link_state, None).await;
                    continue;
                }

                info!("Transport reported disconnect");
                let taken = link_slot.write().await.take();
                if let Some(link) = taken {
                    if let Err(e) = link.disconnect().await {
                        debug!("Ignoring error from post-drop disconnect: {}", e);
                    }
                    let _ = event_tx.send(SessionEvent::notice("Device disconnected"));
                }
                catalog.clear().await;
                apply_state_to(&state, &status, &event_tx, ConnectionState::Disconnected, None)
                    .await;
                break;
            }
        });
    }

    async fn apply_state(&self, next: ConnectionState, detail: Option<&str>) {
        apply_state_to(&self.state, &self.status, &self.event_tx, next, detail).await;
    }
}

/// Set state and display text, emitting a change event only when something
/// actually changed
async fn apply_state_to(
    state: &Arc<RwLock<ConnectionState>>,
    status: &Arc<RwLock<String>>,
    event_tx: &mpsc::UnboundedSender<SessionEvent>,
    next: ConnectionState,
    detail: Option<&str>,
) {
    let text = detail.map(str::to_string).unwrap_or_else(|| next.to_string());

    let mut current_state = state.write().await;
    let mut current_status = status.write().await;
    if *current_state == next && *current_status == text {
        return;
    }
    *current_state = next;
    *current_status = text;
    drop(current_status);
    drop(current_state);

    let _ = event_tx.send(SessionEvent::ConnectionStateChanged {
        state: next,
        detail: detail.map(str::to_string),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peripheral::{Advertisement, PeripheralId};
    use crate::testing::{MockAdapter, MockConnect};

    fn record(id: &str) -> PeripheralRecord {
        PeripheralRecord::from_advertisement(&Advertisement::new(PeripheralId::from(id)), 0)
    }

    fn uuid(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    fn notices(events: &[SessionEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Notice { message } => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    /// Collect events until the busy flag releases, i.e. the end of one
    /// caller-initiated operation
    async fn collect_until_idle(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            let done = matches!(event, SessionEvent::BusyChanged { busy: false });
            events.push(event);
            if done {
                break;
            }
        }
        events
    }

    #[tokio::test]
    async fn test_open_connects_and_enumerates() {
        let adapter = MockAdapter::new();
        adapter.set_next_services(vec![uuid(1), uuid(2)]);
        let session = ConnectionSession::with_defaults(adapter.clone());
        let mut rx = session.subscribe().await;

        session.retarget(record("aa:bb")).await.expect("retarget");
        session.open().await.expect("open");

        assert_eq!(session.state().await, ConnectionState::Connected);
        assert!(!session.is_busy());
        assert_eq!(session.services().await, vec![uuid(1), uuid(2)]);

        let events = collect_until_idle(&mut rx).await;
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::ServicesEnumerated { services } if services.len() == 2)));
    }

    #[tokio::test]
    async fn test_open_without_target_stays_disconnected() {
        let adapter = MockAdapter::new();
        let session = ConnectionSession::with_defaults(adapter);

        session.open().await.expect("open is a no-op");
        assert_eq!(session.state().await, ConnectionState::Disconnected);
        assert!(!session.is_busy());
    }

    #[tokio::test]
    async fn test_timeout_emits_single_cancellation_notice() {
        let adapter = MockAdapter::new();
        adapter.set_connect_behavior(MockConnect::Timeout);
        let session = ConnectionSession::with_defaults(adapter);
        let mut rx = session.subscribe().await;

        session.retarget(record("aa:bb")).await.expect("retarget");
        session.open().await.expect("open");

        assert_eq!(session.state().await, ConnectionState::Disconnected);
        assert!(!session.is_busy());

        let cancelled: Vec<_> = notices(&collect_until_idle(&mut rx).await)
            .into_iter()
            .filter(|m| m.contains("cancelled after 15 seconds"))
            .collect();
        assert_eq!(cancelled.len(), 1);
    }

    #[tokio::test]
    async fn test_failure_notice_names_the_reason() {
        let adapter = MockAdapter::new();
        adapter.set_connect_behavior(MockConnect::Fail("out of range".to_string()));
        let session = ConnectionSession::with_defaults(adapter);
        let mut rx = session.subscribe().await;

        session.retarget(record("aa:bb")).await.expect("retarget");
        session.open().await.expect("open");

        assert_eq!(session.state().await, ConnectionState::Disconnected);
        let all = notices(&collect_until_idle(&mut rx).await);
        assert!(all.iter().any(|m| m.contains("out of range")));
    }

    #[tokio::test]
    async fn test_overlapping_opens_produce_one_link() {
        let adapter = MockAdapter::new();
        let session = Arc::new(ConnectionSession::with_defaults(adapter.clone()));
        session.retarget(record("aa:bb")).await.expect("retarget");

        let first = {
            let session = session.clone();
            tokio::spawn(async move { session.open().await })
        };
        let second = {
            let session = session.clone();
            tokio::spawn(async move { session.open().await })
        };
        first.await.expect("join").expect("open");
        second.await.expect("join").expect("open");

        assert_eq!(adapter.connect_count(), 1);
        assert_eq!(session.state().await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_enumeration_failure_keeps_connection() {
        let adapter = MockAdapter::new();
        adapter.set_next_list_error("attribute read rejected");
        let session = ConnectionSession::with_defaults(adapter);
        let mut rx = session.subscribe().await;

        session.retarget(record("aa:bb")).await.expect("retarget");
        session.open().await.expect("open");

        assert_eq!(session.state().await, ConnectionState::Connected);
        assert!(session.services().await.is_empty());
        assert!(notices(&collect_until_idle(&mut rx).await)
            .iter()
            .any(|m| m.contains("attribute read rejected")));
    }

    #[tokio::test]
    async fn test_empty_enumeration_reports_no_services() {
        let adapter = MockAdapter::new();
        let session = ConnectionSession::with_defaults(adapter);
        let mut rx = session.subscribe().await;

        session.retarget(record("aa:bb")).await.expect("retarget");
        session.open().await.expect("open");

        assert_eq!(session.state().await, ConnectionState::Connected);
        let all = notices(&collect_until_idle(&mut rx).await);
        assert_eq!(
            all.iter().filter(|m| m.contains("No services found")).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_remote_disconnect_tears_down() {
        let adapter = MockAdapter::new();
        adapter.set_next_services(vec![uuid(1)]);
        let session = ConnectionSession::with_defaults(adapter.clone());
        let mut rx = session.subscribe().await;

        session.retarget(record("aa:bb")).await.expect("retarget");
        session.open().await.expect("open");
        assert_eq!(session.state().await, ConnectionState::Connected);
        collect_until_idle(&mut rx).await;

        let link = adapter.last_link().expect("link");
        link.remote_disconnect();

        // the watcher reacts on its own scheduling step
        let mut saw_disconnect_notice = false;
        while let Some(event) = rx.recv().await {
            match event {
                SessionEvent::Notice { message } if message == "Device disconnected" => {
                    saw_disconnect_notice = true;
                }
                SessionEvent::ConnectionStateChanged {
                    state: ConnectionState::Disconnected,
                    ..
                } => break,
                _ => {}
            }
        }
        assert!(saw_disconnect_notice);
        assert_eq!(session.state().await, ConnectionState::Disconnected);
        assert!(session.services().await.is_empty());
        assert!(!session.is_busy());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let adapter = MockAdapter::new();
        let session = ConnectionSession::with_defaults(adapter.clone());

        session.retarget(record("aa:bb")).await.expect("retarget");
        session.open().await.expect("open");

        session.close().await.expect("first close");
        session.close().await.expect("second close");
        session.close().await.expect("third close");

        assert_eq!(session.state().await, ConnectionState::Disconnected);
        assert!(session.services().await.is_empty());
        assert!(!session.is_busy());
    }

    #[tokio::test]
    async fn test_retarget_same_identity_keeps_link() {
        let adapter = MockAdapter::new();
        let session = ConnectionSession::with_defaults(adapter.clone());

        session.retarget(record("aa:bb")).await.expect("retarget");
        session.open().await.expect("open");
        let link = adapter.last_link().expect("link");

        let changed = session.retarget(record("aa:bb")).await.expect("retarget");
        assert!(!changed);
        assert_eq!(session.state().await, ConnectionState::Connected);
        assert_eq!(link.disconnect_count(), 0);
    }

    #[tokio::test]
    async fn test_retarget_different_identity_closes_first() {
        let adapter = MockAdapter::new();
        let session = ConnectionSession::with_defaults(adapter.clone());

        session.retarget(record("aa:bb")).await.expect("retarget");
        session.open().await.expect("open");
        let link = adapter.last_link().expect("link");

        let changed = session.retarget(record("cc:dd")).await.expect("retarget");
        assert!(changed);
        assert_eq!(session.state().await, ConnectionState::Disconnected);
        assert!(link.disconnect_count() >= 1);
        assert_eq!(
            session.target().await.expect("target").id(),
            &PeripheralId::from("cc:dd")
        );
    }

    #[tokio::test]
    async fn test_write_without_connection_is_invalid_state() {
        let adapter = MockAdapter::new();
        let session = ConnectionSession::with_defaults(adapter);

        let result = session.write_characteristic(uuid(1), uuid(2), "01").await;
        assert!(matches!(result, Err(SessionError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_write_empty_value_is_no_op() {
        let adapter = MockAdapter::new();
        let session = ConnectionSession::with_defaults(adapter.clone());

        session.retarget(record("aa:bb")).await.expect("retarget");
        session.open().await.expect("open");

        let written = session
            .write_characteristic(uuid(1), uuid(2), "")
            .await
            .expect("no-op");
        assert!(written.is_none());
        assert!(adapter.last_link().expect("link").writes().is_empty());
        assert!(!session.is_busy());
    }

    #[tokio::test]
    async fn test_write_returns_committed_value() {
        let adapter = MockAdapter::new();
        let session = ConnectionSession::with_defaults(adapter.clone());

        session.retarget(record("aa:bb")).await.expect("retarget");
        session.open().await.expect("open");

        let written = session
            .write_characteristic(uuid(1), uuid(2), "4142")
            .await
            .expect("write")
            .expect("committed");
        assert_eq!(written.bytes, vec![0x41, 0x42]);
        assert!(!session.is_busy());
    }
}
