//! Packet signing and verification.
//!
//! A node's identity is an ed25519 keypair; its [`Address`] is the public key.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

use crate::address::Address;

/// Size of a packet signature in bytes.
pub const SIGNATURE_SIZE: usize = 64;

/// The signing identity of the local node.
pub struct Identity {
    signing_key: SigningKey,
    address: Address,
}

impl Identity {
    /// Generate a fresh random identity.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let address = Address::from_raw(signing_key.verifying_key().to_bytes());
        Self {
            signing_key,
            address,
        }
    }

    /// Construct an identity from existing key material.
    pub fn from_secret(secret: [u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(&secret);
        let address = Address::from_raw(signing_key.verifying_key().to_bytes());
        Self {
            signing_key,
            address,
        }
    }

    /// The public address derived from this identity.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Sign an arbitrary byte buffer.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing_key.sign(message).to_bytes().to_vec()
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("address", &self.address)
            .finish()
    }
}

/// Verify a signature over a byte buffer against a sender address.
pub fn verify(address: &Address, message: &[u8], signature: &[u8]) -> bool {
    let key = match VerifyingKey::from_bytes(&address.raw()) {
        Ok(key) => key,
        Err(_) => return false,
    };

    let signature = match Signature::from_slice(signature) {
        Ok(signature) => signature,
        Err(_) => return false,
    };

    key.verify(message, &signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify_roundtrip() {
        let identity = Identity::generate();
        let signature = identity.sign(b"hello mesh");

        assert_eq!(signature.len(), SIGNATURE_SIZE);
        assert!(verify(&identity.address(), b"hello mesh", &signature));
    }

    #[test]
    fn test_verify_rejects_tampered_message() {
        let identity = Identity::generate();
        let signature = identity.sign(b"hello mesh");

        assert!(!verify(&identity.address(), b"hello mess", &signature));
    }

    #[test]
    fn test_verify_rejects_wrong_sender() {
        let alice = Identity::generate();
        let mallory = Identity::generate();
        let signature = alice.sign(b"payload");

        assert!(!verify(&mallory.address(), b"payload", &signature));
    }

    #[test]
    fn test_deterministic_from_secret() {
        let a = Identity::from_secret([9u8; 32]);
        let b = Identity::from_secret([9u8; 32]);
        assert_eq!(a.address(), b.address());
    }
}
