//! Sender blacklist.

use std::collections::HashSet;
use std::sync::Mutex;

use crate::address::Address;

/// Addresses whose packets are dropped on sight.
#[derive(Debug, Default)]
pub struct Blacklist {
    addresses: Mutex<HashSet<Address>>,
}

impl Blacklist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an address. Returns `false` if it was already listed.
    pub fn add(&self, address: Address) -> bool {
        self.addresses.lock().unwrap().insert(address)
    }

    /// Remove an address. Returns `false` if it was not listed.
    pub fn remove(&self, address: &Address) -> bool {
        self.addresses.lock().unwrap().remove(address)
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.addresses.lock().unwrap().contains(address)
    }

    pub fn len(&self) -> usize {
        self.addresses.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the listed addresses, for status reporting.
    pub fn snapshot(&self) -> Vec<Address> {
        self.addresses.lock().unwrap().iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::ADDRESS_SIZE;

    #[test]
    fn test_add_contains_remove() {
        let blacklist = Blacklist::new();
        let address = Address::from_raw([0xAB; ADDRESS_SIZE]);

        assert!(!blacklist.contains(&address));
        assert!(blacklist.add(address));
        assert!(!blacklist.add(address));
        assert!(blacklist.contains(&address));
        assert!(blacklist.remove(&address));
        assert!(!blacklist.contains(&address));
    }
}
