//! Wire framing for packets.
//!
//! Each frame opens with a fixed header followed by the bincode body:
//!
//! ```text
//! +-------+---------+-----------+------------------+
//! | magic | version | body len  | bincode(Packet)  |
//! | 4 B   | 1 B     | 4 B (BE)  | body len bytes   |
//! +-------+---------+-----------+------------------+
//! ```
//!
//! The magic rejects stray connections speaking something else entirely;
//! the version byte rejects peers running an incompatible packet layout
//! before a single body byte is interpreted. Any header error is fatal for
//! the connection, there is no resynchronization.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::config::{MAX_MESSAGE_SIZE, NETWORK_MAGIC, PROTOCOL_VERSION};
use crate::error::{MeshError, MeshResult};
use crate::protocol::Packet;

const HEADER_SIZE: usize = 9;

/// Codec turning a byte stream into [`Packet`]s and back.
///
/// Stateless: an incomplete frame is left untouched in the read buffer and
/// re-examined from the header on the next call.
#[derive(Debug, Default, Clone, Copy)]
pub struct PacketCodec;

impl PacketCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = MeshError;

    fn decode(&mut self, src: &mut BytesMut) -> MeshResult<Option<Packet>> {
        if src.len() < HEADER_SIZE {
            src.reserve(HEADER_SIZE - src.len());
            return Ok(None);
        }

        let mut header = &src[..HEADER_SIZE];
        let magic = header.get_u32().to_be_bytes();
        if magic != NETWORK_MAGIC {
            return Err(MeshError::InvalidMagic {
                expected: NETWORK_MAGIC,
                actual: magic,
            });
        }

        let version = header.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(MeshError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                actual: version,
            });
        }

        let body_len = header.get_u32() as usize;
        if body_len > MAX_MESSAGE_SIZE {
            return Err(MeshError::MessageTooLarge {
                size: body_len,
                max: MAX_MESSAGE_SIZE,
            });
        }

        if src.len() < HEADER_SIZE + body_len {
            src.reserve(HEADER_SIZE + body_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let body = src.split_to(body_len);
        Ok(Some(bincode::deserialize(&body)?))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = MeshError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> MeshResult<()> {
        let body = bincode::serialize(&packet)?;
        if body.len() > MAX_MESSAGE_SIZE {
            return Err(MeshError::MessageTooLarge {
                size: body.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        dst.reserve(HEADER_SIZE + body.len());
        dst.put_slice(&NETWORK_MAGIC);
        dst.put_u8(PROTOCOL_VERSION);
        dst.put_u32(body.len() as u32);
        dst.put_slice(&body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::NetworkId;
    use crate::crypto::Identity;

    fn sample_packet() -> Packet {
        let identity = Identity::generate();
        let mut packet = Packet::new(identity.address(), NetworkId::new(*b"TEST"));
        packet.set_service(7);
        packet.set_channel(9);
        packet.set_ttl(40);
        packet.set_target(identity.address());
        packet.set_payload(b"framed".to_vec());
        packet.sign(&identity);
        packet
    }

    fn valid_header(body_len: u32) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_slice(&NETWORK_MAGIC);
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u32(body_len);
        buf
    }

    #[test]
    fn test_roundtrip() {
        let mut codec = PacketCodec::new();
        let original = sample_packet();

        let mut buf = BytesMut::new();
        codec.encode(original.clone(), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, original);
        assert!(decoded.verify());
    }

    #[test]
    fn test_incomplete_header_yields_nothing() {
        let mut codec = PacketCodec::new();
        let mut buf = BytesMut::new();
        buf.put_slice(&NETWORK_MAGIC);
        buf.put_u8(PROTOCOL_VERSION);

        assert!(codec.decode(&mut buf).unwrap().is_none());
        // the partial header stays buffered for the next read
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn test_incomplete_body_yields_nothing() {
        let mut codec = PacketCodec::new();
        let mut buf = valid_header(100);
        buf.put_slice(&[0u8; 50]);

        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_frame_arriving_byte_by_byte() {
        let mut codec = PacketCodec::new();
        let packet = sample_packet();
        let mut wire = BytesMut::new();
        codec.encode(packet.clone(), &mut wire).unwrap();

        let mut buf = BytesMut::new();
        let mut decoded = None;
        for byte in wire {
            buf.put_u8(byte);
            if let Some(found) = codec.decode(&mut buf).unwrap() {
                decoded = Some(found);
            }
        }
        assert_eq!(decoded, Some(packet));
    }

    #[test]
    fn test_invalid_magic_rejected() {
        let mut codec = PacketCodec::new();
        let mut buf = BytesMut::new();
        buf.put_slice(b"HTTP");
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u32(10);

        let result = codec.decode(&mut buf);
        assert!(matches!(result, Err(MeshError::InvalidMagic { .. })));
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let mut codec = PacketCodec::new();
        let mut buf = BytesMut::new();
        buf.put_slice(&NETWORK_MAGIC);
        buf.put_u8(PROTOCOL_VERSION + 1);
        buf.put_u32(10);

        let result = codec.decode(&mut buf);
        assert!(matches!(
            result,
            Err(MeshError::VersionMismatch { actual, .. }) if actual == PROTOCOL_VERSION + 1
        ));
    }

    #[test]
    fn test_oversize_frame_rejected() {
        let mut codec = PacketCodec::new();
        let mut buf = valid_header((MAX_MESSAGE_SIZE + 1) as u32);

        let result = codec.decode(&mut buf);
        assert!(matches!(result, Err(MeshError::MessageTooLarge { .. })));
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut codec = PacketCodec::new();
        let mut buf = BytesMut::new();

        let first = sample_packet();
        let second = sample_packet();
        codec.encode(first.clone(), &mut buf).unwrap();
        codec.encode(second.clone(), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), first);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), second);
        assert!(buf.is_empty());
    }
}
