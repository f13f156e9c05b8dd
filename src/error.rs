//! Error types for the BLE GATT transport
//!
//! `BleTransportError` is the internal, detailed error produced by host adapter
//! calls and the send orchestrator. `TransportError` is the small, stable
//! result type exposed across the public transport API boundary.

use thiserror::Error;

// ----------------------------------------------------------------------------
// Internal error type
// ----------------------------------------------------------------------------

/// Errors surfaced internally while driving a send or the scan/connection
/// state machine. These map onto `TransportError` at the API boundary.
#[derive(Error, Debug, Clone)]
pub enum BleTransportError {
    #[error("no BLE adapter available")]
    AdapterUnavailable,

    #[error("BLE radio is disabled")]
    AdapterDisabled,

    #[error("peer not found: {address}")]
    PeerNotFound { address: String },

    #[error("connection to {address} failed: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("connection to {address} timed out")]
    ConnectionTimeout { address: String },

    #[error("failed to discover services for {address}: {reason}")]
    ServiceDiscoveryFailed { address: String, reason: String },

    #[error("MTU negotiation failed for {address}: {reason}")]
    MtuNegotiationFailed { address: String, reason: String },

    #[error("characteristic not found: {uuid}")]
    CharacteristicNotFound { uuid: String },

    #[error("descriptor not found: {uuid}")]
    DescriptorNotFound { uuid: String },

    #[error("failed to write CCCD for {address}: {reason}")]
    CccdWriteFailed { address: String, reason: String },

    #[error("failed to write characteristic for {address}: {reason}")]
    CharacteristicWriteFailed { address: String, reason: String },

    #[error("no peers available")]
    NoPeers,

    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    #[error("transport has been terminated")]
    NotSupported,

    #[error("send was cancelled")]
    Cancelled,
}

// ----------------------------------------------------------------------------
// Public API result type
// ----------------------------------------------------------------------------

/// Result returned across the public transport API.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// Scan exhausted without finding the target (or any) peer.
    #[error("no peers found")]
    NoPeers,
    /// Called after `terminate`, or the BLE adapter is disabled.
    #[error("transport not supported")]
    NotSupported,
    /// Null address/payload, or an address longer than 17 characters.
    #[error("invalid parameter")]
    InvalidParam,
    /// Connect, discover, MTU, CCCD, or characteristic write failed terminally.
    #[error("send failed")]
    SendFailed,
}

pub type TransportResult<T> = Result<T, TransportError>;

impl From<&BleTransportError> for TransportError {
    fn from(err: &BleTransportError) -> Self {
        match err {
            BleTransportError::NoPeers => TransportError::NoPeers,
            BleTransportError::NotSupported | BleTransportError::Cancelled => {
                TransportError::NotSupported
            }
            BleTransportError::InvalidParam(_) => TransportError::InvalidParam,
            // AdapterDisabled maps to SendFailed at the API boundary but is
            // reported separately in logs, since it's worth distinguishing
            // "radio is off" from a one-off send failure when debugging.
            _ => TransportError::SendFailed,
        }
    }
}

impl From<BleTransportError> for TransportError {
    fn from(err: BleTransportError) -> Self {
        (&err).into()
    }
}
