//! Receive path: notification payloads handed up to the caller.
//!
//! `on_notified` resolves a session back to a peer address and hands the
//! bytes to the registered `data_received` callback. The callback must be
//! fast — it runs on whatever task pumped the notification off the host
//! adapter's event stream and must not block it; any buffering or
//! reassembly belongs to the upper layer, not here.

use std::sync::Arc;

use crate::address::Address;

/// Upcall signature for `set_received_cb`. Takes the notifying peer's
/// address and the raw notification payload.
pub type DataReceivedCallback = Arc<dyn Fn(Address, Vec<u8>) + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn callback_receives_address_and_bytes() {
        let seen: Arc<Mutex<Vec<(Address, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let cb: DataReceivedCallback = Arc::new(move |address, data| {
            seen2.lock().unwrap().push((address, data));
        });

        let address = Address::new("AA:BB:CC:DD:EE:11").unwrap();
        cb(address.clone(), vec![1, 2, 3]);

        let recorded = seen.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].0, address);
        assert_eq!(recorded[0].1, vec![1, 2, 3]);
    }
}
