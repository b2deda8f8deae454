//! Node identity and network namespace value types.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Size of a node address in bytes (an ed25519 public key).
pub const ADDRESS_SIZE: usize = 32;

/// Fixed-size byte form of an address, used as routing-table key and wire field.
pub type RawAddress = [u8; ADDRESS_SIZE];

/// The cryptographic identity of a node on the overlay.
///
/// Addresses are compared and ordered by their raw bytes; the ordering is what
/// makes the handshake tie-break deterministic on both ends of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address(RawAddress);

impl Address {
    /// Create an address from its raw byte form.
    pub fn from_raw(raw: RawAddress) -> Self {
        Self(raw)
    }

    /// Get the raw byte form of the address.
    pub fn raw(&self) -> RawAddress {
        self.0
    }

    /// Borrow the raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<RawAddress> for Address {
    fn from(raw: RawAddress) -> Self {
        Self(raw)
    }
}

impl From<Address> for RawAddress {
    fn from(address: Address) -> Self {
        address.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // abbreviated form for logs
        write!(f, "{}…", hex::encode(&self.0[..4]))
    }
}

/// A 4-byte namespace tag disambiguating otherwise-identical overlays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkId(u32);

impl NetworkId {
    /// Create a network id from a 4-character ASCII tag.
    pub fn new(tag: [u8; 4]) -> Self {
        Self(u32::from_be_bytes(tag))
    }

    /// Get the numeric value carried on the wire.
    pub fn value(&self) -> u32 {
        self.0
    }
}

impl From<u32> for NetworkId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.to_be_bytes() {
            if byte.is_ascii_graphic() {
                write!(f, "{}", byte as char)?;
            } else {
                write!(f, "?")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_conversion_roundtrip() {
        let raw: RawAddress = [7u8; ADDRESS_SIZE];
        let address = Address::from_raw(raw);
        assert_eq!(address.raw(), raw);
        assert_eq!(RawAddress::from(address), raw);
    }

    #[test]
    fn test_address_ordering() {
        let low = Address::from_raw([0x01; ADDRESS_SIZE]);
        let high = Address::from_raw([0xFF; ADDRESS_SIZE]);
        assert!(low < high);
        assert_eq!(low, Address::from_raw([0x01; ADDRESS_SIZE]));
    }

    #[test]
    fn test_network_id_display() {
        let id = NetworkId::new(*b"TEST");
        assert_eq!(format!("{}", id), "TEST");
        assert_eq!(id, NetworkId::from(id.value()));
    }
}
