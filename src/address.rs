//! BLE device addresses
//!
//! Peers are identified by a MAC-like address string, mirroring the
//! `BluetoothDevice` address format used by the underlying platform BLE host.
//! Unlike `bitchat_core::PeerId` this is not a cryptographic identity — it is
//! whatever the host adapter hands back for a peripheral.

use std::fmt;
use std::str::FromStr;

use crate::error::BleTransportError;

/// Maximum length of a BLE address string; anything longer is rejected as
/// `InvalidParam`. `"AA:BB:CC:DD:EE:FF"` is exactly 17.
pub const MAX_ADDRESS_LEN: usize = 17;

/// A BLE device address, validated on construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(String);

impl Address {
    /// Build an address from a raw string, rejecting empty or over-long input.
    pub fn new(raw: impl Into<String>) -> Result<Self, BleTransportError> {
        let raw = raw.into();
        if raw.is_empty() || raw.len() > MAX_ADDRESS_LEN {
            return Err(BleTransportError::InvalidParam(format!(
                "address must be 1-{MAX_ADDRESS_LEN} characters, got {}",
                raw.len()
            )));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Address {
    type Err = BleTransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::new(s)
    }
}

impl AsRef<str> for Address {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_standard_mac_address() {
        let addr = Address::new("AA:BB:CC:DD:EE:FF").unwrap();
        assert_eq!(addr.as_str(), "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn rejects_empty_address() {
        assert!(Address::new("").is_err());
    }

    #[test]
    fn rejects_overlong_address() {
        assert!(Address::new("AA:BB:CC:DD:EE:FF:00").is_err());
    }
}
