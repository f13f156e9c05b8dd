//! Send Orchestrator
//!
//! Drives unicast/multicast sends and every host callback that can affect a
//! send in flight: connection-state transitions, service discovery, MTU
//! negotiation, the CCCD-enable sub-protocol, and characteristic-write
//! completion. Built around the same per-peer state machine and
//! callback-upcall shape as a connection-oriented transport, but driven by
//! [`HostEvent`]s from a [`BleHostAdapter`] instead of being coupled
//! directly to `btleplug`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::address::Address;
use crate::concurrency::{Condition, ShutdownSignal};
use crate::config::{BleTransportConfig, CCCD_DESCRIPTOR_UUID, ENABLE_NOTIFICATION_VALUE};
use crate::error::{BleTransportError, TransportError};
use crate::host::{BleHostAdapter, ConnectionStatus, HostEvent, OpStatus, SessionId};
use crate::peer::{BondState, ConnectionState, SendState};
use crate::receive::DataReceivedCallback;
use crate::registry::PeerRegistry;
use crate::scan::ScanController;

pub type ReceivedCallback = DataReceivedCallback;
pub type ErrorCallback = Arc<dyn Fn(Address, Vec<u8>, TransportError) + Send + Sync>;

/// The three UUIDs a send targets; replaceable at runtime via
/// `set_target_uuids`.
#[derive(Debug, Clone, Copy)]
pub struct TargetUuids {
    pub service: Uuid,
    pub request: Uuid,
    pub response: Uuid,
}

/// Per-peer ephemeral coordination state: one condition per suspension
/// point in the connect/bond/discover/write pipeline, plus the one-shot
/// write-retry flag.
///
/// Each condition is paired with a `_done` flag: the flag is cleared right
/// before a waiter starts waiting and set (by the matching host-event
/// handler) immediately before the broadcast. `Condition::wait_for`'s
/// predicate reads the flag, so a signal that arrives lets the waiter
/// return immediately instead of always burning the full bound — the
/// predicate can't be `|| false`, since that would never be satisfied by a
/// broadcast and would turn every bounded wait into a plain sleep.
struct PeerContext {
    descriptor_written: Condition,
    descriptor_done: AtomicBool,
    characteristic_written: Condition,
    characteristic_done: AtomicBool,
    bonded: Condition,
    bonded_done: AtomicBool,
    retried_write: AtomicBool,
}

impl PeerContext {
    fn new() -> Self {
        Self {
            descriptor_written: Condition::new(),
            descriptor_done: AtomicBool::new(false),
            characteristic_written: Condition::new(),
            characteristic_done: AtomicBool::new(false),
            bonded: Condition::new(),
            bonded_done: AtomicBool::new(false),
            retried_write: AtomicBool::new(false),
        }
    }
}

/// Tracks completion of the current send: `completion_count` vs.
/// `expected_count`.
struct SendCompletion {
    completion_count: AtomicUsize,
    expected_count: AtomicUsize,
    condition: Condition,
}

impl SendCompletion {
    fn new() -> Self {
        Self {
            completion_count: AtomicUsize::new(0),
            expected_count: AtomicUsize::new(0),
            condition: Condition::new(),
        }
    }

    fn reset(&self, expected: usize) {
        self.completion_count.store(0, Ordering::SeqCst);
        self.expected_count.store(expected, Ordering::SeqCst);
    }

    fn complete_one(&self) {
        self.completion_count.fetch_add(1, Ordering::SeqCst);
        self.condition.broadcast();
    }

    /// Wait for every expected completion or a `terminate()`. Returns `false`
    /// if interrupted by shutdown.
    async fn wait(&self, shutdown: &ShutdownSignal) -> bool {
        if shutdown.is_finished() {
            return false;
        }
        tokio::select! {
            _ = self.condition.wait_until(|| {
                self.completion_count.load(Ordering::SeqCst) >= self.expected_count.load(Ordering::SeqCst)
            }) => !shutdown.is_finished(),
            _ = shutdown.wait_forever() => false,
        }
    }
}

/// Send Orchestrator. Owns the `send` lock at the top of the mutex
/// hierarchy and every piece of state a send or a host callback touches.
pub struct SendOrchestrator {
    config: BleTransportConfig,
    host: Arc<dyn BleHostAdapter>,
    registry: Arc<PeerRegistry>,
    scan: Arc<ScanController>,
    shutdown: Arc<ShutdownSignal>,

    send_mutex: Mutex<()>,
    completion: SendCompletion,
    target_uuids: RwLock<TargetUuids>,
    pending_payload: RwLock<HashMap<Address, Vec<u8>>>,
    peer_contexts: RwLock<HashMap<Address, Arc<PeerContext>>>,

    received_cb: RwLock<Option<ReceivedCallback>>,
    error_cb: RwLock<Option<ErrorCallback>>,
}

impl SendOrchestrator {
    pub fn new(
        config: BleTransportConfig,
        host: Arc<dyn BleHostAdapter>,
        registry: Arc<PeerRegistry>,
        scan: Arc<ScanController>,
        shutdown: Arc<ShutdownSignal>,
    ) -> Self {
        let target_uuids = TargetUuids {
            service: config.service_uuid,
            request: config.request_characteristic_uuid,
            response: config.response_characteristic_uuid,
        };
        Self {
            config,
            host,
            registry,
            scan,
            shutdown,
            send_mutex: Mutex::new(()),
            completion: SendCompletion::new(),
            target_uuids: RwLock::new(target_uuids),
            pending_payload: RwLock::new(HashMap::new()),
            peer_contexts: RwLock::new(HashMap::new()),
            received_cb: RwLock::new(None),
            error_cb: RwLock::new(None),
        }
    }

    pub async fn set_received_cb(&self, cb: ReceivedCallback) {
        *self.received_cb.write().await = Some(cb);
    }

    pub async fn set_error_cb(&self, cb: ErrorCallback) {
        *self.error_cb.write().await = Some(cb);
    }

    pub async fn set_target_uuids(&self, service: Uuid, request: Uuid, response: Uuid) {
        // Deliberately does not clear the CCCD-enabled set: entries keyed
        // by the old response UUID stay valid for peers still configured
        // with it.
        *self.target_uuids.write().await = TargetUuids {
            service,
            request,
            response,
        };
    }

    pub async fn target_uuids(&self) -> TargetUuids {
        *self.target_uuids.read().await
    }

    async fn peer_context(&self, address: &Address) -> Arc<PeerContext> {
        if let Some(ctx) = self.peer_contexts.read().await.get(address) {
            return ctx.clone();
        }
        let mut contexts = self.peer_contexts.write().await;
        contexts
            .entry(address.clone())
            .or_insert_with(|| Arc::new(PeerContext::new()))
            .clone()
    }

    // ------------------------------------------------------------------
    // Public sends
    // ------------------------------------------------------------------

    pub async fn send_unicast(&self, address: Address, payload: Vec<u8>) -> Result<(), TransportError> {
        if self.shutdown.is_finished() {
            return Err(TransportError::NotSupported);
        }
        if payload.is_empty() {
            return Err(TransportError::InvalidParam);
        }

        let _guard = self.send_mutex.lock().await;
        self.completion.reset(1);

        if let Err(err) = self.scan.ensure_peer_available(Some(&address)).await {
            return Err(err.into());
        }
        let _ = self.scan.stop().await;

        self.pending_payload
            .write()
            .await
            .insert(address.clone(), payload);
        self.deliver_to(&address).await;

        let completed = self.completion.wait(&self.shutdown).await;
        let _ = self.scan.start().await;
        self.pending_payload.write().await.remove(&address);

        if !completed {
            return Err(TransportError::NotSupported);
        }
        if self.peer_send_succeeded(&address).await {
            Ok(())
        } else {
            Err(TransportError::SendFailed)
        }
    }

    pub async fn send_multicast(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        if self.shutdown.is_finished() {
            return Err(TransportError::NotSupported);
        }
        if payload.is_empty() {
            return Err(TransportError::InvalidParam);
        }

        let _guard = self.send_mutex.lock().await;

        if let Err(err) = self.scan.ensure_peer_available(None).await {
            return Err(err.into());
        }
        let _ = self.scan.stop().await;

        let targets = self.registry.discovered_peers().await;
        self.completion.reset(targets.len().max(1));

        {
            let mut pending = self.pending_payload.write().await;
            for address in &targets {
                pending.insert(address.clone(), payload.clone());
            }
        }
        for address in &targets {
            self.deliver_to(address).await;
        }

        let completed = self.completion.wait(&self.shutdown).await;
        let _ = self.scan.start().await;

        {
            let mut pending = self.pending_payload.write().await;
            for address in &targets {
                pending.remove(address);
            }
        }

        if !completed {
            return Err(TransportError::NotSupported);
        }

        let mut any_ok = false;
        for address in &targets {
            if self.peer_send_succeeded(address).await {
                any_ok = true;
            }
        }
        if any_ok {
            Ok(())
        } else {
            Err(TransportError::SendFailed)
        }
    }

    /// Reads and resets one peer's terminal send state: `Sent` or
    /// `MtuNegotiated` means success; anything else failed.
    async fn peer_send_succeeded(&self, address: &Address) -> bool {
        let ok = matches!(
            self.registry.get(address).await.map(|p| p.send_state),
            Some(SendState::Sent) | Some(SendState::MtuNegotiated)
        );
        self.registry
            .update(address, |p| p.set_send_state(SendState::Idle))
            .await;
        ok
    }

    // ------------------------------------------------------------------
    // deliver_to / write pipeline
    // ------------------------------------------------------------------

    async fn deliver_to(&self, address: &Address) {
        let peer = self.registry.get_or_create(address).await;
        match peer.connection_state {
            ConnectionState::Disconnected => match self.host.connect(address, false).await {
                Ok(_session) => {
                    self.registry
                        .set_connection_state(address, ConnectionState::Connecting)
                        .await;
                }
                Err(err) => self.fail_send(address, err).await,
            },
            ConnectionState::Connecting | ConnectionState::Connected => {
                // Discovery/MTU/CCCD pipeline is mid-flight; its completion
                // callback will drive the write.
            }
            ConnectionState::ServiceConnected => {
                if let Some(session) = self.registry.session_for(address).await {
                    self.run_cccd_then_write(address, session).await;
                } else {
                    warn!(%address, "ServiceConnected peer has no live session; reconnecting");
                    self.registry
                        .set_connection_state(address, ConnectionState::Disconnected)
                        .await;
                    if let Err(err) = self.host.connect(address, false).await {
                        self.fail_send(address, err).await;
                    }
                }
            }
        }
    }

    async fn run_cccd_then_write(&self, address: &Address, session: SessionId) {
        let response_uuid = self.target_uuids().await.response;
        if !self.registry.is_cccd_enabled(address, response_uuid).await {
            let ctx = self.peer_context(address).await;
            ctx.descriptor_done.store(false, Ordering::SeqCst);
            let _ = self.host.set_notify(session, response_uuid, true).await;
            if let Err(err) = self
                .host
                .write_descriptor(
                    session,
                    response_uuid,
                    CCCD_DESCRIPTOR_UUID,
                    ENABLE_NOTIFICATION_VALUE.to_vec(),
                )
                .await
            {
                self.fail_send(address, err).await;
                return;
            }

            let write_timeout = self.config.write_timeout;
            ctx.descriptor_written
                .wait_for_cancellable(write_timeout, &self.shutdown, || {
                    ctx.descriptor_done.load(Ordering::SeqCst)
                })
                .await;

            if !self.registry.is_cccd_enabled(address, response_uuid).await {
                self.fail_send(
                    address,
                    BleTransportError::CccdWriteFailed {
                        address: address.to_string(),
                        reason: "descriptor write did not complete in time".into(),
                    },
                )
                .await;
                return;
            }
        }
        self.write_pipeline(address, session).await;
    }

    async fn write_pipeline(&self, address: &Address, session: SessionId) {
        let already_sending = self
            .registry
            .get(address)
            .await
            .map(|p| p.send_state == SendState::Sending)
            .unwrap_or(false);
        if already_sending {
            return;
        }
        self.registry
            .update(address, |p| p.set_send_state(SendState::Sending))
            .await;

        let payload = self.pending_payload.read().await.get(address).cloned();
        let Some(payload) = payload else {
            return;
        };
        let request_uuid = self.target_uuids().await.request;

        // One retry per send attempt, not one per peer for the transport's
        // lifetime: `peer_context` caches one `PeerContext` per address for
        // as long as the transport lives, so `retried_write` must be
        // cleared here rather than only ever set once by the first send
        // that ever failed a write to this peer.
        let ctx = self.peer_context(address).await;
        ctx.retried_write.store(false, Ordering::SeqCst);

        if let Err(err) = self
            .host
            .write_characteristic(session, request_uuid, payload)
            .await
        {
            self.registry
                .update(address, |p| p.set_send_state(SendState::SendFailed))
                .await;
            self.invoke_error_cb(address, err.into()).await;
            self.completion.complete_one();
            return;
        }

        ctx.characteristic_done.store(false, Ordering::SeqCst);
        let write_timeout = self.config.write_timeout;
        let completed = ctx
            .characteristic_written
            .wait_for_cancellable(write_timeout, &self.shutdown, || {
                ctx.characteristic_done.load(Ordering::SeqCst)
            })
            .await;

        if !completed {
            self.fail_send(
                address,
                BleTransportError::CharacteristicWriteFailed {
                    address: address.to_string(),
                    reason: "characteristic write did not complete in time".into(),
                },
            )
            .await;
        }
    }

    async fn fail_send(&self, address: &Address, err: BleTransportError) {
        self.registry
            .update(address, |p| p.set_send_state(SendState::SendFailed))
            .await;
        self.invoke_error_cb(address, err.into()).await;
        // Unblock any wait currently parked inside `run_cccd_then_write` /
        // `write_pipeline` for this same peer (e.g. a disconnect racing an
        // in-flight write) instead of leaving it to burn its full bound
        // before `send_unicast` can even reach `completion.wait`.
        if let Some(ctx) = self.peer_contexts.read().await.get(address) {
            ctx.descriptor_done.store(true, Ordering::SeqCst);
            ctx.descriptor_written.broadcast();
            ctx.characteristic_done.store(true, Ordering::SeqCst);
            ctx.characteristic_written.broadcast();
        }
        self.completion.complete_one();
    }

    async fn invoke_error_cb(&self, address: &Address, err: TransportError) {
        let payload = self
            .pending_payload
            .read()
            .await
            .get(address)
            .cloned()
            .unwrap_or_default();
        if let Some(cb) = self.error_cb.read().await.clone() {
            cb(address.clone(), payload, err);
        }
    }

    // ------------------------------------------------------------------
    // Host event dispatch
    // ------------------------------------------------------------------

    pub async fn handle_host_event(&self, event: HostEvent) {
        match event {
            HostEvent::DeviceAdvertised { address, .. } => {
                self.scan.on_advertised(address).await;
            }
            HostEvent::ConnectionStateChanged {
                address,
                session,
                status,
                connected,
            } => {
                if connected {
                    self.on_connected(address, session).await;
                } else {
                    self.on_disconnected(address, session, status).await;
                }
            }
            HostEvent::ServicesDiscovered { session, status } => {
                if let Some(address) = self.registry.address_for_session(session).await {
                    self.on_services_discovered(address, session, status).await;
                }
            }
            HostEvent::MtuChanged {
                session,
                mtu,
                status,
            } => {
                if let Some(address) = self.registry.address_for_session(session).await {
                    self.on_mtu_changed(address, session, mtu, status).await;
                }
            }
            HostEvent::CharacteristicWritten {
                session,
                characteristic,
                status,
            } => {
                if let Some(address) = self.registry.address_for_session(session).await {
                    self.on_characteristic_written(address, session, characteristic, status)
                        .await;
                }
            }
            HostEvent::DescriptorWritten {
                session,
                characteristic,
                status,
                ..
            } => {
                if let Some(address) = self.registry.address_for_session(session).await {
                    self.on_descriptor_written(address, characteristic, status).await;
                }
            }
            HostEvent::CharacteristicNotified {
                session,
                characteristic,
                data,
            } => {
                self.on_notified(session, characteristic, data).await;
            }
            HostEvent::BondStateChanged { address, new, .. } => {
                self.registry
                    .update(&address, |p| p.bond_state = new)
                    .await;
                if new == BondState::Bonded {
                    let ctx = self.peer_context(&address).await;
                    ctx.bonded_done.store(true, Ordering::SeqCst);
                    ctx.bonded.broadcast();
                }
            }
        }
    }

    async fn on_connected(&self, address: Address, session: SessionId) {
        if let Some(prior) = self.registry.put_session(&address, session).await {
            let _ = self.host.disconnect(prior).await;
            let _ = self.host.close(prior).await;
        }
        self.registry
            .set_connection_state(&address, ConnectionState::Connected)
            .await;

        if self.host.bond_state(&address).await != BondState::Bonded {
            let ctx = self.peer_context(&address).await;
            ctx.bonded_done.store(false, Ordering::SeqCst);
            let bond_timeout = self.config.bond_timeout;
            let _ = self.host.create_bond(&address).await;
            ctx.bonded
                .wait_for_cancellable(bond_timeout, &self.shutdown, || {
                    ctx.bonded_done.load(Ordering::SeqCst)
                })
                .await;
            if self.host.bond_state(&address).await != BondState::Bonded {
                warn!(%address, "bonding did not complete within timeout; continuing without it");
            }
        }

        let pre_discovery_delay = self.config.pre_discovery_delay;
        tokio::time::sleep(pre_discovery_delay).await;

        if let Err(err) = self.host.discover_services(session).await {
            self.fail_send(&address, err).await;
        }
    }

    async fn on_disconnected(&self, address: Address, session: SessionId, status: ConnectionStatus) {
        self.registry.clear_cccd(&address).await;
        self.registry
            .set_connection_state(&address, ConnectionState::Disconnected)
            .await;
        let _ = self.host.close(session).await;
        self.registry.remove_session(&address).await;

        match status {
            ConnectionStatus::GattError => {
                debug!(%address, "recoverable disconnect, reconnecting");
                if let Err(err) = self.host.connect(&address, true).await {
                    self.fail_send(&address, err).await;
                }
            }
            ConnectionStatus::Unrecoverable(reason) => {
                self.fail_send(
                    &address,
                    BleTransportError::ConnectionFailed {
                        address: address.to_string(),
                        reason: format!("{reason:?}"),
                    },
                )
                .await;
            }
            ConnectionStatus::Success | ConnectionStatus::Other => {
                if let Some(ctx) = self.peer_contexts.read().await.get(&address) {
                    ctx.descriptor_done.store(true, Ordering::SeqCst);
                    ctx.descriptor_written.broadcast();
                    ctx.characteristic_done.store(true, Ordering::SeqCst);
                    ctx.characteristic_written.broadcast();
                }
                self.completion.complete_one();
            }
        }
    }

    async fn on_services_discovered(&self, address: Address, session: SessionId, status: OpStatus) {
        if !status.success {
            self.fail_send(
                &address,
                BleTransportError::ServiceDiscoveryFailed {
                    address: address.to_string(),
                    reason: format!("status {}", status.raw_code),
                },
            )
            .await;
            return;
        }
        let mtu = self.config.ceiling_mtu;
        if let Err(err) = self.host.request_mtu(session, mtu).await {
            self.fail_send(&address, err).await;
        }
    }

    async fn on_mtu_changed(&self, address: Address, session: SessionId, mtu: u16, status: OpStatus) {
        if !status.success {
            self.fail_send(
                &address,
                BleTransportError::MtuNegotiationFailed {
                    address: address.to_string(),
                    reason: format!("status {}", status.raw_code),
                },
            )
            .await;
            return;
        }
        let usable_mtu = mtu.saturating_sub(3).max(1);
        self.registry
            .update(&address, |p| p.mtu_size = usable_mtu)
            .await;

        // A disconnect can race an in-flight MTU negotiation. Re-check
        // connection state here, right before the CCCD/write pipeline
        // would touch the (possibly already torn-down) session, instead
        // of proceeding on stale information.
        let still_connected = self
            .registry
            .get(&address)
            .await
            .map(|p| p.connection_state != ConnectionState::Disconnected)
            .unwrap_or(false);
        if !still_connected {
            debug!(%address, "MTU callback raced a disconnect; not proceeding to CCCD/write");
            return;
        }

        let has_payload = self.pending_payload.read().await.contains_key(&address);
        if has_payload {
            self.run_cccd_then_write(&address, session).await;
        } else {
            self.registry
                .set_connection_state(&address, ConnectionState::ServiceConnected)
                .await;
            self.registry
                .update(&address, |p| p.set_send_state(SendState::MtuNegotiated))
                .await;
        }
    }

    async fn on_characteristic_written(
        &self,
        address: Address,
        session: SessionId,
        characteristic: Uuid,
        status: OpStatus,
    ) {
        let request_uuid = self.target_uuids().await.request;
        if characteristic != request_uuid {
            return;
        }
        let ctx = self.peer_context(&address).await;

        if status.success {
            self.registry
                .update(&address, |p| p.set_send_state(SendState::Sent))
                .await;
            self.registry
                .set_connection_state(&address, ConnectionState::ServiceConnected)
                .await;
            ctx.characteristic_done.store(true, Ordering::SeqCst);
            ctx.characteristic_written.broadcast();
            self.completion.complete_one();
            return;
        }

        let already_retried = ctx.retried_write.swap(true, Ordering::SeqCst);
        if !already_retried {
            let payload = self.pending_payload.read().await.get(&address).cloned();
            if let Some(payload) = payload {
                if self
                    .host
                    .write_characteristic(session, request_uuid, payload)
                    .await
                    .is_ok()
                {
                    return;
                }
            }
        }

        self.registry
            .update(&address, |p| p.set_send_state(SendState::SendFailed))
            .await;
        self.invoke_error_cb(
            &address,
            BleTransportError::CharacteristicWriteFailed {
                address: address.to_string(),
                reason: format!("status {}", status.raw_code),
            }
            .into(),
        )
        .await;
        ctx.characteristic_done.store(true, Ordering::SeqCst);
        ctx.characteristic_written.broadcast();
        self.completion.complete_one();
    }

    async fn on_descriptor_written(&self, address: Address, characteristic: Uuid, status: OpStatus) {
        if status.is_ok_after_bonding() {
            self.registry
                .mark_cccd_enabled(&address, characteristic)
                .await;
        } else {
            warn!(%address, "CCCD write failed with status {}", status.raw_code);
        }
        let ctx = self.peer_context(&address).await;
        ctx.descriptor_done.store(true, Ordering::SeqCst);
        ctx.descriptor_written.broadcast();
    }

    async fn on_notified(&self, session: SessionId, characteristic: Uuid, data: Vec<u8>) {
        let Some(address) = self.registry.address_for_session(session).await else {
            debug!("notification for unknown session, dropping");
            return;
        };
        if let Some(cb) = self.received_cb.read().await.clone() {
            cb(address, data);
        } else {
            debug!(%characteristic, "notification received with no received_cb registered");
        }
    }
}
