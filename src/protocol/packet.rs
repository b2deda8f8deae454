//! The packet envelope sent around the overlay.
//!
//! A packet is a fixed set of routing fields followed by an opaque payload and
//! an ed25519 signature. The signature covers a deterministic encoding of every
//! field except the signature itself and is always verified against `sender`.

use bytes::BufMut;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::address::{Address, NetworkId, RawAddress, ADDRESS_SIZE};
use crate::config::PROTOCOL_VERSION;
use crate::crypto::{self, Identity};

/// Flag bit: deliver to the immediate connection only, never route.
const FLAG_DIRECT: u8 = 0b0000_0001;
/// Flag bit: fan out to every connected peer.
const FLAG_BROADCAST: u8 = 0b0000_0010;
/// Flag bit: a correlated response is expected.
const FLAG_EXCHANGE: u8 = 0b0000_0100;

/// The atomic unit of communication on the overlay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    version: u8,
    flags: u8,
    ttl: u8,
    service: u16,
    channel: u16,
    message_num: u16,
    network: u32,
    sender: RawAddress,
    target: Option<RawAddress>,
    payload: Vec<u8>,
    signature: Vec<u8>,
}

impl Packet {
    /// Create a packet originated by `sender` on the given network.
    pub fn new(sender: Address, network: NetworkId) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            flags: 0,
            ttl: 0,
            service: 0,
            channel: 0,
            message_num: 0,
            network: network.value(),
            sender: sender.raw(),
            target: None,
            payload: Vec::new(),
            signature: Vec::new(),
        }
    }

    // -- getters --------------------------------------------------------

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn is_direct(&self) -> bool {
        self.flags & FLAG_DIRECT != 0
    }

    pub fn is_broadcast(&self) -> bool {
        self.flags & FLAG_BROADCAST != 0
    }

    pub fn is_exchange(&self) -> bool {
        self.flags & FLAG_EXCHANGE != 0
    }

    pub fn ttl(&self) -> u8 {
        self.ttl
    }

    pub fn service(&self) -> u16 {
        self.service
    }

    pub fn channel(&self) -> u16 {
        self.channel
    }

    pub fn message_num(&self) -> u16 {
        self.message_num
    }

    pub fn network(&self) -> u32 {
        self.network
    }

    pub fn sender_raw(&self) -> &RawAddress {
        &self.sender
    }

    pub fn sender(&self) -> Address {
        Address::from_raw(self.sender)
    }

    pub fn target_raw(&self) -> Option<&RawAddress> {
        self.target.as_ref()
    }

    pub fn target(&self) -> Option<Address> {
        self.target.map(Address::from_raw)
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    // -- setters --------------------------------------------------------

    pub fn set_direct(&mut self, set: bool) {
        self.set_flag(FLAG_DIRECT, set);
    }

    pub fn set_broadcast(&mut self, set: bool) {
        self.set_flag(FLAG_BROADCAST, set);
    }

    pub fn set_exchange(&mut self, set: bool) {
        self.set_flag(FLAG_EXCHANGE, set);
    }

    pub fn set_ttl(&mut self, ttl: u8) {
        self.ttl = ttl;
    }

    pub fn set_service(&mut self, service: u16) {
        self.service = service;
    }

    pub fn set_channel(&mut self, channel: u16) {
        self.channel = channel;
    }

    pub fn set_message_num(&mut self, message_num: u16) {
        self.message_num = message_num;
    }

    pub fn set_target(&mut self, target: Address) {
        self.target = Some(target.raw());
    }

    pub fn clear_target(&mut self) {
        self.target = None;
    }

    pub fn set_payload(&mut self, payload: Vec<u8>) {
        self.payload = payload;
    }

    fn set_flag(&mut self, flag: u8, set: bool) {
        if set {
            self.flags |= flag;
        } else {
            self.flags &= !flag;
        }
    }

    // -- signing --------------------------------------------------------

    /// Deterministic encoding of every field except the signature.
    ///
    /// The TTL is excluded as well so that a forwarded packet remains
    /// verifiable after each hop decrements it.
    fn signing_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + 2 * ADDRESS_SIZE + self.payload.len());
        buf.put_u8(self.version);
        buf.put_u8(self.flags);
        buf.put_u16(self.service);
        buf.put_u16(self.channel);
        buf.put_u16(self.message_num);
        buf.put_u32(self.network);
        buf.put_slice(&self.sender);
        match &self.target {
            Some(target) => {
                buf.put_u8(1);
                buf.put_slice(target);
            }
            None => buf.put_u8(0),
        }
        buf.put_slice(&self.payload);
        buf
    }

    /// Sign the packet with the local identity.
    pub fn sign(&mut self, identity: &Identity) {
        self.signature = identity.sign(&self.signing_bytes());
    }

    /// Verify the signature against the packet's sender address.
    pub fn verify(&self) -> bool {
        crypto::verify(&self.sender(), &self.signing_bytes(), &self.signature)
    }

    // -- echo suppression ----------------------------------------------

    /// Identity of the packet for loop/duplicate suppression.
    ///
    /// Derived from (sender, flags, service, channel, message_num): the
    /// fields that stay fixed while a packet travels, regardless of TTL
    /// decrements. The flags are included because an exchange response
    /// reuses the request's message number; without them a node's reply
    /// would be indistinguishable from its own earlier request.
    pub fn echo_id(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.sender);
        hasher.update([self.flags]);
        hasher.update(self.service.to_be_bytes());
        hasher.update(self.channel.to_be_bytes());
        hasher.update(self.message_num.to_be_bytes());
        hasher.finalize().into()
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {} {}:{}:{} {}{}{} ttl={}",
            self.sender(),
            self.target()
                .map(|t| t.to_string())
                .unwrap_or_else(|| "*".into()),
            self.service,
            self.channel,
            self.message_num,
            if self.is_direct() { 'D' } else { 'R' },
            if self.is_broadcast() { 'B' } else { 'U' },
            if self.is_exchange() { 'X' } else { 'N' },
            self.ttl,
        )
    }
}
