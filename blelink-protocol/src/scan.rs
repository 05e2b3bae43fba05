//! Scan session
//!
//! Owns the timed discovery window: issues the broadcast scan to the
//! adapter, applies a countdown, merge-updates the de-duplicated set of
//! discovered peripherals, and exposes cancellation. At most one window is
//! open at a time; starting while scanning is a no-op.

use crate::adapter::{BleAdapter, ScanSettings};
use crate::error::{Result, SessionError};
use crate::events::SessionEvent;
use crate::peripheral::{current_timestamp, Advertisement, PeripheralRecord};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::{interval, sleep_until, Instant};
use tracing::{debug, info, warn};

/// Shortest accepted discovery window in seconds
pub const SCAN_SECONDS_MIN: u64 = 1;

/// Longest accepted discovery window in seconds
pub const SCAN_SECONDS_MAX: u64 = 60;

/// Window length used when the caller does not pick one
pub const SCAN_SECONDS_DEFAULT: u64 = 15;

/// Configuration for the scan session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Lower clamp bound for requested window lengths, in seconds
    pub min_secs: u64,
    /// Upper clamp bound for requested window lengths, in seconds
    pub max_secs: u64,
    /// Default window length, in seconds
    pub default_secs: u64,
    /// Discovery request settings handed to the adapter
    pub settings: ScanSettings,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            min_secs: SCAN_SECONDS_MIN,
            max_secs: SCAN_SECONDS_MAX,
            default_secs: SCAN_SECONDS_DEFAULT,
            settings: ScanSettings::broadcast(),
        }
    }
}

impl ScanConfig {
    /// Clamp a requested window length into the configured bounds
    pub fn clamp_secs(&self, requested: u64) -> u64 {
        requested.clamp(self.min_secs, self.max_secs)
    }
}

/// Timed discovery session over an injected adapter
pub struct ScanSession {
    adapter: Arc<dyn BleAdapter>,
    config: ScanConfig,
    discovered: Arc<RwLock<Vec<PeripheralRecord>>>,
    scanning: Arc<AtomicBool>,
    stop_tx: Arc<RwLock<Option<oneshot::Sender<()>>>>,
    stop_time: Arc<RwLock<Option<Instant>>>,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
    event_rx: Arc<RwLock<mpsc::UnboundedReceiver<SessionEvent>>>,
}

impl ScanSession {
    /// Create an idle session with the given configuration
    pub fn new(adapter: Arc<dyn BleAdapter>, config: ScanConfig) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            adapter,
            config,
            discovered: Arc::new(RwLock::new(Vec::new())),
            scanning: Arc::new(AtomicBool::new(false)),
            stop_tx: Arc::new(RwLock::new(None)),
            stop_time: Arc::new(RwLock::new(None)),
            event_tx,
            event_rx: Arc::new(RwLock::new(event_rx)),
        }
    }

    /// Create an idle session with default configuration
    pub fn with_defaults(adapter: Arc<dyn BleAdapter>) -> Self {
        Self::new(adapter, ScanConfig::default())
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

    /// Whether a discovery window is currently open
    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    /// Whole seconds left in the current window, zero when idle
    pub async fn remaining_secs(&self) -> u64 {
        match *self.stop_time.read().await {
            Some(stop_at) => stop_at.saturating_duration_since(Instant::now()).as_secs(),
            None => 0,
        }
    }

    /// Snapshot of every peripheral discovered by this session, in
    /// discovery order
    pub async fn discovered(&self) -> Vec<PeripheralRecord> {
        self.discovered.read().await.clone()
    }

    /// Open a discovery window of roughly `requested_secs` seconds
    /// (clamped into the configured bounds).
    ///
    /// No-op while a window is already open. When the radio is disabled a
    /// notice is emitted instead of starting. The call returns once the
    /// adapter acknowledges the scan; advertisements then stream in on a
    /// background task until the window elapses or [`stop`](Self::stop) is
    /// called.
    pub async fn start(&self, requested_secs: u64) -> Result<()> {
        if self.scanning.load(Ordering::SeqCst) {
            debug!("Scan already running, ignoring start request");
            return Ok(());
        }

        if !self.adapter.is_enabled().await {
            warn!("Scan requested while the adapter is disabled");
            let _ = self
                .event_tx
                .send(SessionEvent::notice(SessionError::AdapterUnavailable.user_message()));
            return Ok(());
        }

        if self
            .scanning
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        let seconds = self.config.clamp_secs(requested_secs);
        let window = Duration::from_secs(seconds);
        info!("Beginning device scan, timeout={}s", seconds);

        let stream = match self.adapter.start_broadcast_scan(&self.config.settings).await {
            Ok(stream) => stream,
            Err(e) => {
                self.scanning.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let deadline = Instant::now() + window;
        *self.stop_time.write().await = Some(deadline);

        let (stop_tx, stop_rx) = oneshot::channel();
        *self.stop_tx.write().await = Some(stop_tx);

        let _ = self.event_tx.send(SessionEvent::ScanStarted { seconds });

        self.spawn_scan_window(stream, deadline, stop_rx);
        Ok(())
    }

    /// Close the current discovery window. No-op while idle.
    pub async fn stop(&self) {
        if let Some(stop_tx) = self.stop_tx.write().await.take() {
            debug!("Stopping device scan");
            let _ = stop_tx.send(());
        }
    }

    /// Spawn the task owning one discovery window
    fn spawn_scan_window(
        &self,
        mut stream: crate::adapter::AdvertisementStream,
        deadline: Instant,
        mut stop_rx: oneshot::Receiver<()>,
    ) {
        let adapter = self.adapter.clone();
        let discovered = self.discovered.clone();
        let scanning = self.scanning.clone();
        let stop_tx = self.stop_tx.clone();
        let stop_time = self.stop_time.clone();
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            let mut tick = interval(Duration::from_secs(1));

            loop {
                tokio::select! {
                    maybe_adv = stream.next() => {
                        match maybe_adv {
                            Some(advertisement) => {
                                Self::apply_advertisement(&discovered, &event_tx, advertisement)
                                    .await;
                            }
                            None => {
                                debug!("Advertisement feed ended by adapter");
                                break;
                            }
                        }
                    }
                    _ = tick.tick() => {
                        let remaining = deadline
                            .saturating_duration_since(Instant::now())
                            .as_secs();
                        let _ = event_tx.send(SessionEvent::ScanTick {
                            remaining_secs: remaining,
                        });
                    }
                    _ = sleep_until(deadline) => {
                        // expected termination path, not an error
                        debug!("Scan window elapsed");
                        break;
                    }
                    _ = &mut stop_rx => {
                        debug!("Scan cancelled");
                        break;
                    }
                }
            }

            if let Err(e) = adapter.stop_broadcast_scan().await {
                warn!("Failed to stop broadcast scan cleanly: {}", e);
            }

            *stop_time.write().await = None;
            let _ = stop_tx.write().await.take();
            scanning.store(false, Ordering::SeqCst);
            let _ = event_tx.send(SessionEvent::ScanFinished);
            info!("Device scan finished");
        });
    }

    /// Merge-update the discovered set with one advertisement
    async fn apply_advertisement(
        discovered: &Arc<RwLock<Vec<PeripheralRecord>>>,
        event_tx: &mpsc::UnboundedSender<SessionEvent>,
        advertisement: Advertisement,
    ) {
        let seen_at = current_timestamp();
        let mut records = discovered.write().await;

        if let Some(existing) = records.iter_mut().find(|r| r.id() == &advertisement.id) {
            existing.merge(&advertisement, seen_at);
            let record = existing.clone();
            drop(records);
            debug!("Updated peripheral {}", record.id());
            let _ = event_tx.send(SessionEvent::PeripheralUpdated { record });
        } else {
            let record = PeripheralRecord::from_advertisement(&advertisement, seen_at);
            records.push(record.clone());
            drop(records);
            info!(
                "Discovered peripheral {} ({})",
                record.id(),
                record.display_name()
            );
            let _ = event_tx.send(SessionEvent::PeripheralDiscovered { record });
        }
    }
}
