//! BLE transport configuration

use std::time::Duration;

use uuid::Uuid;

/// Standard Client Characteristic Configuration Descriptor UUID (`0x2902`).
pub const CCCD_DESCRIPTOR_UUID: Uuid = Uuid::from_u128(0x0000_2902_0000_1000_8000_00805f9b34fb);

/// Standard two-byte value that enables notifications on a CCCD.
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

/// Default ATT MTU before negotiation.
pub const DEFAULT_MTU: u16 = 23;

/// Ceiling MTU we will ever request or accept.
pub const CEILING_MTU: u16 = 517;

/// Configuration for the BLE GATT transport.
///
/// `service_uuid`/`request_characteristic_uuid`/`response_characteristic_uuid`
/// can be replaced at runtime via `Transport::set_target_uuids`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BleTransportConfig {
    /// Target GATT service UUID.
    pub service_uuid: Uuid,
    /// Characteristic we write requests to.
    pub request_characteristic_uuid: Uuid,
    /// Characteristic the peer notifies responses on.
    pub response_characteristic_uuid: Uuid,

    /// MTU requested during negotiation (bounded by `ceiling_mtu`).
    pub default_mtu: u16,
    /// Never request or accept an MTU above this value.
    pub ceiling_mtu: u16,

    /// Filter scans by `service_uuid` when the host supports it.
    pub scan_filter_by_service_uuid: bool,

    /// Bound on `create_bond` completion.
    pub bond_timeout: Duration,
    /// Bound on CCCD write and characteristic write completion.
    pub write_timeout: Duration,
    /// Length of one scan round in `ensure_peer_available`.
    pub scan_round_timeout: Duration,
    /// Number of scan rounds `ensure_peer_available` will wait through.
    pub scan_retry_rounds: u32,
    /// Inter-round delay between scan rounds.
    pub scan_retry_delay: Duration,
    /// Delay inserted before `discover_services` after a fresh connection,
    /// guarding against hosts that drop discovery requests issued immediately
    /// after bonding.
    pub pre_discovery_delay: Duration,
}

impl Default for BleTransportConfig {
    fn default() -> Self {
        Self {
            service_uuid: Uuid::nil(),
            request_characteristic_uuid: Uuid::nil(),
            response_characteristic_uuid: Uuid::nil(),
            default_mtu: DEFAULT_MTU,
            ceiling_mtu: CEILING_MTU,
            scan_filter_by_service_uuid: true,
            bond_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            scan_round_timeout: Duration::from_secs(2),
            scan_retry_rounds: 5,
            scan_retry_delay: Duration::from_secs(1),
            pre_discovery_delay: Duration::from_secs(1),
        }
    }
}

impl BleTransportConfig {
    /// Build a configuration targeting the given service/request/response
    /// characteristics, with all other fields defaulted.
    pub fn new(service_uuid: Uuid, request_uuid: Uuid, response_uuid: Uuid) -> Self {
        Self {
            service_uuid,
            request_characteristic_uuid: request_uuid,
            response_characteristic_uuid: response_uuid,
            ..Self::default()
        }
    }

    pub fn with_ceiling_mtu(mut self, mtu: u16) -> Self {
        self.ceiling_mtu = mtu;
        self
    }

    pub fn with_scan_filter_by_service_uuid(mut self, enabled: bool) -> Self {
        self.scan_filter_by_service_uuid = enabled;
        self
    }

    pub fn with_auto_reconnect_timeouts(
        mut self,
        bond_timeout: Duration,
        write_timeout: Duration,
    ) -> Self {
        self.bond_timeout = bond_timeout;
        self.write_timeout = write_timeout;
        self
    }

    /// Clamp a negotiated MTU into `[default_mtu, ceiling_mtu]`.
    pub fn clamp_mtu(&self, mtu: u16) -> u16 {
        mtu.clamp(self.default_mtu, self.ceiling_mtu)
    }
}
