//! Scan Controller
//!
//! Owns scan start/stop idempotency and `ensure_peer_available`, the bounded
//! wait the Send Orchestrator uses before giving up on a target. Built around
//! the [`BleHostAdapter`] trait instead of a concrete `btleplug::Adapter` so
//! it can run against a mock host in tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use crate::address::Address;
use crate::concurrency::{Condition, ShutdownSignal};
use crate::config::BleTransportConfig;
use crate::error::BleTransportError;
use crate::host::BleHostAdapter;
use crate::registry::PeerRegistry;

/// Scan Controller. Start/stop are idempotent; a single `scanning` flag
/// behind the `scan` lock in the mutex hierarchy tracks whether a scan is
/// currently in flight.
pub struct ScanController {
    config: BleTransportConfig,
    host: Arc<dyn BleHostAdapter>,
    registry: Arc<PeerRegistry>,
    shutdown: Arc<ShutdownSignal>,
    scanning: AtomicBool,
    /// Broadcast whenever `mark_discovered` records a new address, so
    /// `ensure_peer_available` wakes without waiting out a full round.
    discovery_signal: Condition,
}

impl ScanController {
    pub fn new(
        config: BleTransportConfig,
        host: Arc<dyn BleHostAdapter>,
        registry: Arc<PeerRegistry>,
        shutdown: Arc<ShutdownSignal>,
    ) -> Self {
        Self {
            config,
            host,
            registry,
            shutdown,
            scanning: AtomicBool::new(false),
            discovery_signal: Condition::new(),
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    /// Start scanning, filtered by the configured service UUID unless
    /// disabled. A second call while already scanning is a no-op.
    pub async fn start(&self) -> Result<(), BleTransportError> {
        if self.scanning.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let filter_uuid = self
            .config
            .scan_filter_by_service_uuid
            .then_some(self.config.service_uuid);
        if let Err(err) = self.host.start_scan(filter_uuid).await {
            self.scanning.store(false, Ordering::SeqCst);
            return Err(err);
        }
        info!("scan started");
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), BleTransportError> {
        if !self.scanning.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.host.stop_scan().await?;
        debug!("scan stopped");
        Ok(())
    }

    /// Record a freshly advertised device and wake anyone waiting in
    /// `ensure_peer_available`.
    pub async fn on_advertised(&self, address: Address) {
        if self.registry.mark_discovered(&address).await {
            debug!(%address, "peer discovered");
        }
        self.discovery_signal.broadcast();
    }

    /// Bounded wait for a peer to appear in the discovered-peers list: up to
    /// `scan_retry_rounds` rounds of `scan_round_timeout`, separated by
    /// `scan_retry_delay`, restarting the scan each round if it is not
    /// already running. `address = None` waits for *any* peer (used by
    /// `send_multicast` with no live targets).
    pub async fn ensure_peer_available(&self, address: Option<&Address>) -> Result<(), BleTransportError> {
        if self.shutdown.is_finished() {
            return Err(BleTransportError::Cancelled);
        }
        self.start().await?;

        // Check before ever waiting: a peer already discovered from an
        // earlier scan (or by another in-flight sender) must return
        // immediately rather than burning a full scan round.
        let already_found = match address {
            Some(addr) => self.registry.is_discovered(addr).await,
            None => !self.registry.discovered_peers().await.is_empty(),
        };
        if already_found {
            return Ok(());
        }

        for round in 0..self.config.scan_retry_rounds {
            if self.shutdown.is_finished() {
                return Err(BleTransportError::Cancelled);
            }
            // The match check is async (it reads the registry), so it can't
            // live inside `wait_for`'s synchronous predicate: wait for the
            // next discovery broadcast or the round timeout, then check.
            self.discovery_signal
                .wait_signal(self.config.scan_round_timeout)
                .await;

            if self.shutdown.is_finished() {
                return Err(BleTransportError::Cancelled);
            }
            let found = match address {
                Some(addr) => self.registry.is_discovered(addr).await,
                None => !self.registry.discovered_peers().await.is_empty(),
            };
            if found {
                return Ok(());
            }

            debug!(round, "scan round exhausted, no match yet");
            if round + 1 < self.config.scan_retry_rounds {
                tokio::time::sleep(self.config.scan_retry_delay).await;
            }
        }

        let found = match address {
            Some(addr) => self.registry.is_discovered(addr).await,
            None => !self.registry.discovered_peers().await.is_empty(),
        };
        if found {
            Ok(())
        } else {
            Err(BleTransportError::NoPeers)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::tests_support::MockHostAdapter;

    fn addr(s: &str) -> Address {
        Address::new(s).unwrap()
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let host = Arc::new(MockHostAdapter::new());
        let registry = Arc::new(PeerRegistry::new(BleTransportConfig::default()));
        let shutdown = Arc::new(crate::concurrency::ShutdownSignal::new());
        let scan = ScanController::new(BleTransportConfig::default(), host.clone(), registry, shutdown);
        scan.start().await.unwrap();
        scan.start().await.unwrap();
        assert_eq!(host.scan_start_calls(), 1);
    }

    #[tokio::test]
    async fn ensure_peer_available_succeeds_once_discovered() {
        let host = Arc::new(MockHostAdapter::new());
        let registry = Arc::new(PeerRegistry::new(BleTransportConfig::default()));
        let shutdown = Arc::new(crate::concurrency::ShutdownSignal::new());
        let scan = Arc::new(ScanController::new(
            BleTransportConfig::default()
                .with_scan_filter_by_service_uuid(false),
            host,
            registry,
            shutdown,
        ));

        let target = addr("AA:BB:CC:DD:EE:09");
        let scan2 = scan.clone();
        let target2 = target.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            scan2.on_advertised(target2).await;
        });

        scan.ensure_peer_available(Some(&target)).await.unwrap();
    }

    #[tokio::test]
    async fn ensure_peer_available_times_out_when_nobody_appears() {
        let mut config = BleTransportConfig::default();
        config.scan_retry_rounds = 1;
        config.scan_round_timeout = std::time::Duration::from_millis(10);
        config.scan_retry_delay = std::time::Duration::from_millis(1);

        let host = Arc::new(MockHostAdapter::new());
        let registry = Arc::new(PeerRegistry::new(config.clone()));
        let shutdown = Arc::new(crate::concurrency::ShutdownSignal::new());
        let scan = ScanController::new(config, host, registry, shutdown);

        let result = scan.ensure_peer_available(Some(&addr("AA:BB:CC:DD:EE:10"))).await;
        assert!(matches!(result, Err(BleTransportError::NoPeers)));
    }

    #[tokio::test]
    async fn ensure_peer_available_returns_immediately_for_already_discovered_peer() {
        // Regression: a repeat call for a peer discovered by an earlier
        // scan must not wait out a full scan round before noticing.
        let mut config = BleTransportConfig::default();
        config.scan_round_timeout = std::time::Duration::from_secs(5);
        config.scan_retry_rounds = 1;

        let host = Arc::new(MockHostAdapter::new());
        let registry = Arc::new(PeerRegistry::new(config.clone()));
        let shutdown = Arc::new(crate::concurrency::ShutdownSignal::new());
        let scan = Arc::new(ScanController::new(config, host, registry, shutdown));

        let target = addr("AA:BB:CC:DD:EE:12");
        scan.on_advertised(target.clone()).await;

        let started = std::time::Instant::now();
        tokio::time::timeout(
            std::time::Duration::from_millis(200),
            scan.ensure_peer_available(Some(&target)),
        )
        .await
        .expect("first ensure_peer_available did not return promptly")
        .unwrap();
        assert!(started.elapsed() < std::time::Duration::from_millis(200));

        let started2 = std::time::Instant::now();
        tokio::time::timeout(
            std::time::Duration::from_millis(200),
            scan.ensure_peer_available(Some(&target)),
        )
        .await
        .expect("second ensure_peer_available did not return promptly")
        .unwrap();
        assert!(started2.elapsed() < std::time::Duration::from_millis(200));
    }

    #[tokio::test]
    async fn ensure_peer_available_is_cancelled_after_shutdown() {
        let host = Arc::new(MockHostAdapter::new());
        let registry = Arc::new(PeerRegistry::new(BleTransportConfig::default()));
        let shutdown = Arc::new(crate::concurrency::ShutdownSignal::new());
        shutdown.trigger();
        let scan = ScanController::new(BleTransportConfig::default(), host, registry, shutdown);

        let result = scan.ensure_peer_available(Some(&addr("AA:BB:CC:DD:EE:11"))).await;
        assert!(matches!(result, Err(BleTransportError::Cancelled)));
    }
}
