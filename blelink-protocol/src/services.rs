//! Service catalog
//!
//! Tracks the de-duplicated set of service identifiers enumerated on the
//! active connection, preserving first-discovery order for display. The
//! catalog is cleared in full whenever the owning connection closes.

use crate::adapter::GattLink;
use crate::error::Result;
use crate::events::SessionEvent;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// De-duplicated, ordered set of known service identifiers
#[derive(Clone)]
pub struct ServiceCatalog {
    services: Arc<RwLock<Vec<Uuid>>>,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
}

impl ServiceCatalog {
    /// Create an empty catalog emitting on the given event channel
    pub fn new(event_tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self {
            services: Arc::new(RwLock::new(Vec::new())),
            event_tx,
        }
    }

    /// Request the full service list from the transport handle and append
    /// every identifier not already known.
    ///
    /// An empty result is reported with a "no services found" notice but is
    /// not an error. Protocol-level failures propagate as
    /// [`SessionError::Gatt`](crate::error::SessionError::Gatt).
    pub async fn enumerate(&self, link: &Arc<dyn GattLink>) -> Result<Vec<Uuid>> {
        let listed = link.list_services().await.map_err(|e| {
            warn!("Service enumeration failed: {}", e);
            e
        })?;
        debug!("Adapter listed {} services", listed.len());

        let mut services = self.services.write().await;
        for service_id in listed {
            if services.contains(&service_id) {
                continue;
            }
            services.push(service_id);
            let _ = self
                .event_tx
                .send(SessionEvent::ServiceDiscovered { service_id });
        }

        let snapshot = services.clone();
        drop(services);

        if snapshot.is_empty() {
            info!("No services found on {}", link.peripheral());
            let _ = self.event_tx.send(SessionEvent::notice("No services found"));
        }

        Ok(snapshot)
    }

    /// Current catalog contents in discovery order
    pub async fn services(&self) -> Vec<Uuid> {
        self.services.read().await.clone()
    }

    /// Number of known services
    pub async fn len(&self) -> usize {
        self.services.read().await.len()
    }

    /// Whether the catalog is empty
    pub async fn is_empty(&self) -> bool {
        self.services.read().await.is_empty()
    }

    /// Drop every known service identifier
    pub async fn clear(&self) {
        let mut services = self.services.write().await;
        if !services.is_empty() {
            debug!("Clearing {} catalogued services", services.len());
        }
        services.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockLink;
    use tokio::sync::mpsc::unbounded_channel;

    fn uuid(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    #[test]
    fn test_enumerate_appends_in_discovery_order() {
        tokio_test::block_on(async {
            let (tx, _rx) = unbounded_channel();
            let catalog = ServiceCatalog::new(tx);
            let link = MockLink::connected("aa:bb");
            link.set_services(vec![uuid(2), uuid(1)]);
            let link: Arc<dyn GattLink> = link;

            let services = catalog.enumerate(&link).await.expect("enumeration");
            assert_eq!(services, vec![uuid(2), uuid(1)]);
        });
    }

    #[test]
    fn test_enumerate_twice_does_not_duplicate() {
        tokio_test::block_on(async {
            let (tx, _rx) = unbounded_channel();
            let catalog = ServiceCatalog::new(tx);
            let link = MockLink::connected("aa:bb");
            link.set_services(vec![uuid(1), uuid(2)]);
            let link: Arc<dyn GattLink> = link;

            catalog.enumerate(&link).await.expect("first enumeration");
            let services = catalog.enumerate(&link).await.expect("second enumeration");
            assert_eq!(services.len(), 2);
        });
    }

    #[test]
    fn test_empty_enumeration_emits_single_notice() {
        tokio_test::block_on(async {
            let (tx, mut rx) = unbounded_channel();
            let catalog = ServiceCatalog::new(tx);
            let link = MockLink::connected("aa:bb");
            let link: Arc<dyn GattLink> = link;

            let services = catalog.enumerate(&link).await.expect("enumeration");
            assert!(services.is_empty());

            let mut notices = 0;
            while let Ok(event) = rx.try_recv() {
                if event.is_notice() {
                    notices += 1;
                }
            }
            assert_eq!(notices, 1);
        });
    }

    #[test]
    fn test_clear_empties_catalog() {
        tokio_test::block_on(async {
            let (tx, _rx) = unbounded_channel();
            let catalog = ServiceCatalog::new(tx);
            let link = MockLink::connected("aa:bb");
            link.set_services(vec![uuid(1)]);
            let link: Arc<dyn GattLink> = link;

            catalog.enumerate(&link).await.expect("enumeration");
            assert_eq!(catalog.len().await, 1);

            catalog.clear().await;
            assert!(catalog.is_empty().await);
        });
    }

    #[test]
    fn test_enumeration_failure_propagates() {
        tokio_test::block_on(async {
            let (tx, _rx) = unbounded_channel();
            let catalog = ServiceCatalog::new(tx);
            let link = MockLink::connected("aa:bb");
            link.fail_next_list("attribute read rejected");
            let link: Arc<dyn GattLink> = link;

            let result = catalog.enumerate(&link).await;
            assert!(result.is_err());
            assert!(catalog.is_empty().await);
        });
    }
}
