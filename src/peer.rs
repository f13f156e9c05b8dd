//! Per-peer connection, send, and bond state tracked by the Peer Registry.

use std::time::Instant;

use crate::address::Address;
use crate::config::BleTransportConfig;

/// Connection lifecycle for a peer, as tracked by the Send Orchestrator and
/// the connection-state host callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Services discovered, MTU negotiated, response CCCD enabled: fully
    /// ready to write.
    ServiceConnected,
}

/// Per-peer send progress, driven by `write_pipeline`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    Idle,
    Sending,
    Sent,
    SendFailed,
    /// MTU negotiated but no payload was pending; a terminal "ready" state
    /// equivalent to `Sent` for completion purposes.
    MtuNegotiated,
}

/// Bonding state, mirrored from the host's bond-state callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BondState {
    None,
    Bonding,
    Bonded,
}

/// A peer record. Created on first scan sighting or first send; persists
/// until the transport terminates, surviving disconnects.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub address: Address,
    pub connection_state: ConnectionState,
    pub send_state: SendState,
    pub bond_state: BondState,
    /// Negotiated ATT MTU, default 23, bounded by the configured ceiling.
    pub mtu_size: u16,
    pub auto_connect_flag: bool,
    pub last_connection_state_change: Instant,
    pub last_send_state_change: Instant,
}

impl PeerRecord {
    pub fn new(address: Address, config: &BleTransportConfig) -> Self {
        let now = Instant::now();
        Self {
            address,
            connection_state: ConnectionState::Disconnected,
            send_state: SendState::Idle,
            bond_state: BondState::None,
            mtu_size: config.default_mtu,
            auto_connect_flag: false,
            last_connection_state_change: now,
            last_send_state_change: now,
        }
    }

    pub fn set_connection_state(&mut self, state: ConnectionState) {
        self.connection_state = state;
        self.last_connection_state_change = Instant::now();
    }

    pub fn set_send_state(&mut self, state: SendState) {
        self.send_state = state;
        self.last_send_state_change = Instant::now();
    }

    /// `ServiceConnected` implies a usable MTU. The CCCD half of that
    /// invariant lives with the registry, which holds the CCCD-enabled set.
    pub fn has_usable_mtu(&self) -> bool {
        self.mtu_size >= crate::config::DEFAULT_MTU
    }

    pub fn is_warm(&self) -> bool {
        matches!(self.connection_state, ConnectionState::ServiceConnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> Address {
        Address::new("AA:BB:CC:DD:EE:FF").unwrap()
    }

    #[test]
    fn new_peer_starts_disconnected_idle() {
        let config = BleTransportConfig::default();
        let peer = PeerRecord::new(addr(), &config);
        assert_eq!(peer.connection_state, ConnectionState::Disconnected);
        assert_eq!(peer.send_state, SendState::Idle);
        assert_eq!(peer.bond_state, BondState::None);
        assert_eq!(peer.mtu_size, 23);
        assert!(!peer.is_warm());
    }

    #[test]
    fn service_connected_peer_is_warm() {
        let config = BleTransportConfig::default();
        let mut peer = PeerRecord::new(addr(), &config);
        peer.set_connection_state(ConnectionState::ServiceConnected);
        assert!(peer.is_warm());
        assert!(peer.has_usable_mtu());
    }
}
