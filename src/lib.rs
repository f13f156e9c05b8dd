//! BLE GATT client transport for a constrained RESTful IoT stack
//! (OCF/CoAP-over-BLE).
//!
//! `Transport` is the public API: bytes in, bytes out, over a single GATT
//! service with a request characteristic (write) and a response
//! characteristic (notify). Everything below it — scanning, connection
//! lifecycle, bonding, discovery, MTU negotiation, CCCD enablement, and
//! notification reassembly — is internal.

mod address;
mod concurrency;
mod config;
mod error;
mod host;
mod orchestrator;
mod peer;
mod receive;
mod registry;
mod scan;

pub use address::Address;
pub use config::BleTransportConfig;
pub use error::{TransportError, TransportResult};
pub use host::{BleHostAdapter, BtleplugHostAdapter};
pub use orchestrator::{ErrorCallback, ReceivedCallback};

/// In-memory host adapter and host-event types for driving a [`Transport`]
/// in tests without a real Bluetooth stack. Only built with the
/// `test-util` feature (the `tests/` integration suite enables it via
/// `required-features`).
#[cfg(any(test, feature = "test-util"))]
pub mod test_support {
    pub use crate::host::tests_support::MockHostAdapter;
    pub use crate::host::{ConnectionStatus, HostEvent, OpStatus, UnrecoverableReason};
}

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

use concurrency::ShutdownSignal;
use orchestrator::SendOrchestrator;
use registry::PeerRegistry;
use scan::ScanController;

/// The BLE GATT client transport.
///
/// Construction (`Transport::new`) wires the Scan Controller, Peer
/// Registry, and Send Orchestrator together over a given [`BleHostAdapter`]
/// but does not start anything — call [`Transport::initialize`] first.
pub struct Transport {
    host: Arc<dyn BleHostAdapter>,
    registry: Arc<PeerRegistry>,
    scan: Arc<ScanController>,
    orchestrator: Arc<SendOrchestrator>,
    shutdown: Arc<ShutdownSignal>,
    initialized: AtomicBool,
}

impl Transport {
    /// Build a transport over the given host adapter and configuration.
    /// Does not touch the radio; call [`Self::initialize`] to start.
    pub fn new(config: BleTransportConfig, host: Arc<dyn BleHostAdapter>) -> Self {
        let registry = Arc::new(PeerRegistry::new(config.clone()));
        let shutdown = Arc::new(ShutdownSignal::new());
        let scan = Arc::new(ScanController::new(
            config.clone(),
            host.clone(),
            registry.clone(),
            shutdown.clone(),
        ));
        let orchestrator = Arc::new(SendOrchestrator::new(
            config,
            host.clone(),
            registry.clone(),
            scan.clone(),
            shutdown.clone(),
        ));

        Self {
            host,
            registry,
            scan,
            orchestrator,
            shutdown,
            initialized: AtomicBool::new(false),
        }
    }

    /// Convenience constructor backed by a real `btleplug` adapter.
    pub async fn with_btleplug(config: BleTransportConfig) -> error::TransportResult<Self> {
        let host = BtleplugHostAdapter::new(config.clone())
            .await
            .map_err(|_| TransportError::NotSupported)?;
        Ok(Self::new(config, Arc::new(host)))
    }

    /// Create the peer registry's lists, spawn the host-event dispatch
    /// task, and start scanning. Idempotent: a second call is a no-op.
    pub async fn initialize(&self) -> error::TransportResult<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let Some(mut events) = self.host.take_events() else {
            return Err(TransportError::NotSupported);
        };
        let orchestrator = self.orchestrator.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            // Each event is handled on its own task: host callbacks may
            // arrive on any thread, and some handlers (bonding,
            // pre-discovery sleep) block for seconds at a time, so they
            // must not stall delivery of unrelated events.
            while !shutdown.is_finished() {
                match events.recv().await {
                    Some(event) => {
                        let orchestrator = orchestrator.clone();
                        tokio::spawn(async move { orchestrator.handle_host_event(event).await });
                    }
                    None => break,
                }
            }
        });

        self.scan.start().await?;
        info!("BLE GATT transport initialized");
        Ok(())
    }

    /// Unblock every waiter, stop scanning, and disconnect all sessions.
    /// After `terminate` returns, sends return `NotSupported`.
    pub async fn terminate(&self) {
        self.shutdown.trigger();
        let _ = self.scan.stop().await;
        for address in self.registry.discovered_peers().await {
            if let Some(session) = self.registry.session_for(&address).await {
                let _ = self.host.disconnect(session).await;
                let _ = self.host.close(session).await;
            }
        }
        info!("BLE GATT transport terminated");
    }

    pub async fn send_unicast(&self, address: Address, data: Vec<u8>) -> error::TransportResult<()> {
        self.orchestrator.send_unicast(address, data).await
    }

    pub async fn send_multicast(&self, data: Vec<u8>) -> error::TransportResult<()> {
        self.orchestrator.send_multicast(data).await
    }

    pub async fn set_received_cb(&self, cb: ReceivedCallback) {
        self.orchestrator.set_received_cb(cb).await;
    }

    pub async fn set_error_cb(&self, cb: ErrorCallback) {
        self.orchestrator.set_error_cb(cb).await;
    }

    pub async fn set_target_uuids(
        &self,
        service: uuid::Uuid,
        request: uuid::Uuid,
        response: uuid::Uuid,
    ) {
        self.orchestrator
            .set_target_uuids(service, request, response)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use host::tests_support::MockHostAdapter;
    use std::sync::Mutex;
    use std::time::Duration;

    fn config() -> BleTransportConfig {
        let service = uuid::Uuid::new_v4();
        let request = uuid::Uuid::new_v4();
        let response = uuid::Uuid::new_v4();
        let mut config = BleTransportConfig::new(service, request, response);
        config.scan_round_timeout = Duration::from_millis(20);
        config.scan_retry_rounds = 3;
        config.scan_retry_delay = Duration::from_millis(5);
        config.bond_timeout = Duration::from_millis(50);
        config.write_timeout = Duration::from_millis(200);
        config.pre_discovery_delay = Duration::from_millis(1);
        config
    }

    #[tokio::test]
    async fn initialize_is_idempotent() {
        let host = Arc::new(MockHostAdapter::new());
        let transport = Transport::new(config(), host.clone());
        transport.initialize().await.unwrap();
        transport.initialize().await.unwrap();
        assert_eq!(host.scan_start_calls(), 1);
    }

    #[tokio::test]
    async fn send_to_nonexistent_peer_times_out_as_no_peers() {
        let host = Arc::new(MockHostAdapter::new());
        let transport = Transport::new(config(), host);
        transport.initialize().await.unwrap();

        let address = Address::new("AA:BB:CC:DD:EE:20").unwrap();
        let result = transport.send_unicast(address, vec![1, 2, 3]).await;
        assert_eq!(result, Err(TransportError::NoPeers));
    }

    #[tokio::test]
    async fn empty_payload_is_invalid_param() {
        let host = Arc::new(MockHostAdapter::new());
        let transport = Transport::new(config(), host);
        transport.initialize().await.unwrap();

        let address = Address::new("AA:BB:CC:DD:EE:21").unwrap();
        let result = transport.send_unicast(address, vec![]).await;
        assert_eq!(result, Err(TransportError::InvalidParam));
    }

    #[tokio::test]
    async fn cold_unicast_completes_full_handshake() {
        let host = Arc::new(MockHostAdapter::new());
        let transport = Transport::new(config(), host.clone());
        transport.initialize().await.unwrap();

        let address = Address::new("AA:BB:CC:DD:EE:22").unwrap();
        host.emit(host::HostEvent::DeviceAdvertised {
            address: address.clone(),
            tx_power: None,
        });

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            transport.send_unicast(address.clone(), vec![1, 2, 3, 4]),
        )
        .await
        .expect("send did not complete in time");

        assert_eq!(result, Ok(()));
        assert!(host.write_calls() >= 1);

        let record = transport
            .registry
            .get(&address)
            .await
            .expect("peer record must exist after a completed handshake");
        assert_eq!(record.bond_state, peer::BondState::Bonded);
    }

    #[tokio::test]
    async fn notifications_reach_the_received_callback() {
        let host = Arc::new(MockHostAdapter::new());
        let transport = Transport::new(config(), host.clone());
        transport.initialize().await.unwrap();

        let received: Arc<Mutex<Vec<(Address, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
        let received2 = received.clone();
        transport
            .set_received_cb(Arc::new(move |address, data| {
                received2.lock().unwrap().push((address, data));
            }))
            .await;

        let address = Address::new("AA:BB:CC:DD:EE:23").unwrap();
        host.emit(host::HostEvent::DeviceAdvertised {
            address: address.clone(),
            tx_power: None,
        });

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            transport.send_unicast(address.clone(), vec![9, 9]),
        )
        .await
        .expect("send did not complete in time");
        assert_eq!(result, Ok(()));

        // The mock's subscribe path does not itself emit notifications, so
        // simulate the peer notifying a response on the response characteristic.
        let response_uuid = transport.orchestrator.target_uuids().await.response;
        if let Some(session) = transport.registry.session_for(&address).await {
            host.emit(host::HostEvent::CharacteristicNotified {
                session,
                characteristic: response_uuid,
                data: vec![7, 7, 7],
            });
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        let recorded = received.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].0, address);
        assert_eq!(recorded[0].1, vec![7, 7, 7]);
    }

    #[tokio::test]
    async fn cold_unicast_completes_well_under_its_bounded_waits() {
        // Regression test: the per-step conditions (bond/descriptor/write)
        // must return as soon as the matching host event arrives, not only
        // once their bound elapses. Set every bound far larger than the
        // mock's near-instant responses and assert the send still finishes
        // quickly — if a wait ever degenerates into a plain sleep-for-bound,
        // this blows past the outer assertion deadline.
        let mut cfg = config();
        cfg.bond_timeout = Duration::from_secs(5);
        cfg.write_timeout = Duration::from_secs(5);

        let host = Arc::new(MockHostAdapter::new());
        let transport = Transport::new(cfg, host.clone());
        transport.initialize().await.unwrap();

        let address = Address::new("AA:BB:CC:DD:EE:25").unwrap();
        host.emit(host::HostEvent::DeviceAdvertised {
            address: address.clone(),
            tx_power: None,
        });

        let started = tokio::time::Instant::now();
        let result = tokio::time::timeout(
            Duration::from_millis(500),
            transport.send_unicast(address, vec![1, 2, 3]),
        )
        .await
        .expect("send did not complete within 500ms despite 5s bounds on its waits");
        assert_eq!(result, Ok(()));
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn disconnect_during_write_completes_send_failed_promptly() {
        let mut cfg = config();
        cfg.write_timeout = Duration::from_secs(5);

        let host = Arc::new(MockHostAdapter::new());
        host.suppress_write_completion();
        let transport = Arc::new(Transport::new(cfg, host.clone()));
        transport.initialize().await.unwrap();

        let address = Address::new("AA:BB:CC:DD:EE:26").unwrap();
        host.emit(host::HostEvent::DeviceAdvertised {
            address: address.clone(),
            tx_power: None,
        });

        let transport2 = transport.clone();
        let address2 = address.clone();
        let sender = tokio::spawn(async move {
            transport2.send_unicast(address2, vec![1, 2, 3]).await
        });

        // Give the handshake time to reach the characteristic write (which
        // the mock leaves pending), then disconnect out from under it.
        tokio::time::sleep(Duration::from_millis(100)).await;
        if let Some(session) = transport.registry.session_for(&address).await {
            host.emit(host::HostEvent::ConnectionStateChanged {
                address: address.clone(),
                session,
                status: host::ConnectionStatus::Unrecoverable(
                    host::UnrecoverableReason::Failure,
                ),
                connected: false,
            });
        }

        let result = tokio::time::timeout(Duration::from_millis(300), sender)
            .await
            .expect("send was not unblocked promptly by the disconnect")
            .unwrap();
        assert_eq!(result, Err(TransportError::SendFailed));
    }

    #[tokio::test]
    async fn write_accepted_but_never_acknowledged_fails_the_send() {
        // Regression: the host accepts the characteristic write but never
        // fires `CharacteristicWritten`, and nothing disconnects either.
        // `write_pipeline`'s bounded wait must time out and fail the send
        // itself instead of leaving `send_state` stuck at `Sending` forever,
        // which would otherwise hang the unbounded `completion.wait`.
        let mut cfg = config();
        cfg.write_timeout = Duration::from_millis(50);

        let host = Arc::new(MockHostAdapter::new());
        host.suppress_write_completion();
        let transport = Arc::new(Transport::new(cfg, host.clone()));
        transport.initialize().await.unwrap();

        let address = Address::new("AA:BB:CC:DD:EE:27").unwrap();
        host.emit(host::HostEvent::DeviceAdvertised {
            address: address.clone(),
            tx_power: None,
        });

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            transport.send_unicast(address, vec![1, 2, 3]),
        )
        .await
        .expect("send did not resolve after the write-ack timeout elapsed");
        assert_eq!(result, Err(TransportError::SendFailed));
    }

    #[tokio::test]
    async fn terminate_unblocks_pending_sends() {
        let host = Arc::new(MockHostAdapter::new());
        let transport = Arc::new(Transport::new(config(), host));
        transport.initialize().await.unwrap();

        let address = Address::new("AA:BB:CC:DD:EE:24").unwrap();
        // Nobody ever advertises this address, so ensure_peer_available will
        // be retrying scan rounds when terminate fires.
        let transport2 = transport.clone();
        let sender = tokio::spawn(async move {
            transport2.send_unicast(address, vec![1]).await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        transport.terminate().await;

        let result = tokio::time::timeout(Duration::from_secs(1), sender)
            .await
            .expect("send task did not finish after terminate")
            .unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn terminate_unblocks_a_send_parked_in_the_write_pipeline_promptly() {
        // Regression: a send parked in `write_pipeline`'s bounded
        // characteristic-written wait must be released by `terminate()` in
        // O(1), not only once `write_timeout` itself elapses. Before
        // `wait_for_cancellable` existed, `terminate()` never broadcast this
        // per-peer condition and the predicate never checked
        // `shutdown.is_finished()`, so this wait would run out the full
        // (here, deliberately long) bound regardless of `terminate()`.
        let mut cfg = config();
        cfg.write_timeout = Duration::from_secs(5);

        let host = Arc::new(MockHostAdapter::new());
        host.suppress_write_completion();
        let transport = Arc::new(Transport::new(cfg, host.clone()));
        transport.initialize().await.unwrap();

        let address = Address::new("AA:BB:CC:DD:EE:28").unwrap();
        host.emit(host::HostEvent::DeviceAdvertised {
            address: address.clone(),
            tx_power: None,
        });

        let transport2 = transport.clone();
        let sender =
            tokio::spawn(async move { transport2.send_unicast(address, vec![1, 2, 3]).await });

        // Give the handshake time to reach the characteristic write (which
        // the mock leaves pending), then terminate out from under it.
        tokio::time::sleep(Duration::from_millis(100)).await;
        transport.terminate().await;

        let result = tokio::time::timeout(Duration::from_millis(500), sender)
            .await
            .expect("terminate did not unblock the parked send promptly")
            .unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn each_send_gets_its_own_retry_budget_not_just_the_first() {
        // Regression: `retried_write` lives on a `PeerContext` cached for the
        // transport's lifetime, so it must be reset at the start of every
        // `write_pipeline` run. Before that reset existed, only the first
        // send to ever fail a write against this peer got its one retry;
        // every later send that also failed would exhaust `write_timeout`
        // without a retry and fail outright.
        let host = Arc::new(MockHostAdapter::new());
        let transport = Arc::new(Transport::new(config(), host.clone()));
        transport.initialize().await.unwrap();

        let address = Address::new("AA:BB:CC:DD:EE:29").unwrap();
        host.emit(host::HostEvent::DeviceAdvertised {
            address: address.clone(),
            tx_power: None,
        });

        host.fail_next_write();
        let first = tokio::time::timeout(
            Duration::from_secs(2),
            transport.send_unicast(address.clone(), vec![1]),
        )
        .await
        .expect("first send did not complete in time");
        assert_eq!(first, Ok(()), "first send must succeed via its one retry");

        host.fail_next_write();
        let second = tokio::time::timeout(
            Duration::from_secs(2),
            transport.send_unicast(address, vec![2]),
        )
        .await
        .expect("second send did not complete in time");
        assert_eq!(
            second,
            Ok(()),
            "second send must also get its own retry, not find the budget already spent"
        );
    }
}
