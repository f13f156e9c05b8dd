//! Peer Registry
//!
//! Holds every piece of per-peer state the Send Orchestrator and Scan
//! Controller share: the peer map itself, the discovered-peers list, the
//! live-session table, and the CCCD-enabled set. Each is its own lock so the
//! mutex hierarchy documented in [`crate::concurrency`] is enforceable by
//! construction rather than by convention: a caller that needs two of these
//! tables has to acquire two distinct locks in the documented order, not one
//! lock guarding everything.

use std::collections::{HashMap, HashSet};

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::address::Address;
use crate::config::BleTransportConfig;
use crate::host::SessionId;
use crate::peer::{ConnectionState, PeerRecord};

/// Peer Registry: per-peer records plus the three auxiliary tables named in
/// the mutex hierarchy: `live_session`, `cccd_set`, `discovered_peers`.
#[derive(Debug)]
pub struct PeerRegistry {
    config: BleTransportConfig,
    peer_registry: RwLock<HashMap<Address, PeerRecord>>,
    live_session: RwLock<HashMap<Address, SessionId>>,
    cccd_set: RwLock<HashSet<(Address, Uuid)>>,
    discovered_peers: RwLock<Vec<Address>>,
}

impl PeerRegistry {
    pub fn new(config: BleTransportConfig) -> Self {
        Self {
            config,
            peer_registry: RwLock::new(HashMap::new()),
            live_session: RwLock::new(HashMap::new()),
            cccd_set: RwLock::new(HashSet::new()),
            discovered_peers: RwLock::new(Vec::new()),
        }
    }

    /// Record a peer seen during scanning, creating its record on first
    /// sighting. Returns `true` if this is a newly seen address.
    pub async fn mark_discovered(&self, address: &Address) -> bool {
        {
            let mut peers = self.peer_registry.write().await;
            peers
                .entry(address.clone())
                .or_insert_with(|| PeerRecord::new(address.clone(), &self.config));
        }
        let mut discovered = self.discovered_peers.write().await;
        if discovered.iter().any(|a| a == address) {
            false
        } else {
            discovered.push(address.clone());
            true
        }
    }

    pub async fn discovered_peers(&self) -> Vec<Address> {
        self.discovered_peers.read().await.clone()
    }

    pub async fn is_discovered(&self, address: &Address) -> bool {
        self.discovered_peers
            .read()
            .await
            .iter()
            .any(|a| a == address)
    }

    /// Fetch a clone of a peer's record, creating it first if unseen (a
    /// send can target an address never observed while scanning, e.g. a
    /// previously bonded device).
    pub async fn get_or_create(&self, address: &Address) -> PeerRecord {
        let mut peers = self.peer_registry.write().await;
        peers
            .entry(address.clone())
            .or_insert_with(|| PeerRecord::new(address.clone(), &self.config))
            .clone()
    }

    pub async fn get(&self, address: &Address) -> Option<PeerRecord> {
        self.peer_registry.read().await.get(address).cloned()
    }

    pub async fn update<F>(&self, address: &Address, mutate: F)
    where
        F: FnOnce(&mut PeerRecord),
    {
        let mut peers = self.peer_registry.write().await;
        let record = peers
            .entry(address.clone())
            .or_insert_with(|| PeerRecord::new(address.clone(), &self.config));
        mutate(record);
    }

    pub async fn set_connection_state(&self, address: &Address, state: ConnectionState) {
        self.update(address, |record| record.set_connection_state(state))
            .await;
    }

    /// Any peer currently at or past `ServiceConnected` counts as "warm" for
    /// the purposes of skipping reconnection.
    pub async fn is_warm(&self, address: &Address) -> bool {
        self.peer_registry
            .read()
            .await
            .get(address)
            .map(PeerRecord::is_warm)
            .unwrap_or(false)
    }

    // --- live_session table ------------------------------------------------

    /// Replace the session for `address`, returning the prior one if any so
    /// the caller can tear it down first: a fresh connection for an address
    /// that already had a live session must close the stale session instead
    /// of leaking it.
    pub async fn put_session(&self, address: &Address, session: SessionId) -> Option<SessionId> {
        self.live_session
            .write()
            .await
            .insert(address.clone(), session)
    }

    pub async fn session_for(&self, address: &Address) -> Option<SessionId> {
        self.live_session.read().await.get(address).copied()
    }

    /// Reverse lookup used by the receive path: which address does this
    /// session belong to.
    pub async fn address_for_session(&self, session: SessionId) -> Option<Address> {
        self.live_session
            .read()
            .await
            .iter()
            .find(|(_, s)| **s == session)
            .map(|(address, _)| address.clone())
    }

    pub async fn remove_session(&self, address: &Address) -> Option<SessionId> {
        self.live_session.write().await.remove(address)
    }

    // --- cccd_set ------------------------------------------------------------

    pub async fn mark_cccd_enabled(&self, address: &Address, characteristic: Uuid) {
        self.cccd_set
            .write()
            .await
            .insert((address.clone(), characteristic));
    }

    pub async fn is_cccd_enabled(&self, address: &Address, characteristic: Uuid) -> bool {
        self.cccd_set
            .read()
            .await
            .contains(&(address.clone(), characteristic))
    }

    /// Clear CCCD-enabled state on disconnect: a fresh connection must
    /// re-enable notifications.
    pub async fn clear_cccd(&self, address: &Address) {
        self.cccd_set
            .write()
            .await
            .retain(|(a, _)| a != address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Address {
        Address::new(s).unwrap()
    }

    #[tokio::test]
    async fn mark_discovered_is_idempotent() {
        let registry = PeerRegistry::new(BleTransportConfig::default());
        let a = addr("AA:BB:CC:DD:EE:01");
        assert!(registry.mark_discovered(&a).await);
        assert!(!registry.mark_discovered(&a).await);
        assert_eq!(registry.discovered_peers().await, vec![a]);
    }

    #[tokio::test]
    async fn session_replacement_returns_prior_handle() {
        let registry = PeerRegistry::new(BleTransportConfig::default());
        let a = addr("AA:BB:CC:DD:EE:02");
        let s1 = crate::host::SessionId::new_for_test();
        let s2 = crate::host::SessionId::new_for_test();
        assert!(registry.put_session(&a, s1).await.is_none());
        let prior = registry.put_session(&a, s2).await;
        assert_eq!(prior, Some(s1));
        assert_eq!(registry.session_for(&a).await, Some(s2));
    }

    #[tokio::test]
    async fn cccd_state_clears_on_disconnect() {
        let registry = PeerRegistry::new(BleTransportConfig::default());
        let a = addr("AA:BB:CC:DD:EE:03");
        let characteristic = Uuid::new_v4();
        registry.mark_cccd_enabled(&a, characteristic).await;
        assert!(registry.is_cccd_enabled(&a, characteristic).await);
        registry.clear_cccd(&a).await;
        assert!(!registry.is_cccd_enabled(&a, characteristic).await);
    }

    #[tokio::test]
    async fn warm_peers_are_service_connected() {
        let registry = PeerRegistry::new(BleTransportConfig::default());
        let a = addr("AA:BB:CC:DD:EE:04");
        assert!(!registry.is_warm(&a).await);
        registry
            .set_connection_state(&a, ConnectionState::ServiceConnected)
            .await;
        assert!(registry.is_warm(&a).await);
    }
}
