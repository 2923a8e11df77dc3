//! LLUDP datagram framing
//!
//! This module reproduces the exact on-wire layout: header flags, big-endian
//! sequence number, extra-header length, the banded message number, the
//! (optionally zerocoded) body and the trailing appended-ack block.

use crate::networking::packets::{MessageId, Packet, PacketFrequency};
use crate::networking::{NetworkError, NetworkResult};
use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};

pub mod packet_buffer;
pub mod zerocode;

pub use packet_buffer::PacketBuffer;

/// flags + sequence + extra header length
pub const HEADER_SIZE: usize = 6;

/// Smallest valid datagram: header plus a one byte message number
pub const MIN_PACKET_SIZE: usize = HEADER_SIZE + 1;

/// Receive buffer size; nothing larger is ever produced or accepted
pub const MAX_PACKET_SIZE: usize = 4096;

/// An ack block carries at most this many sequence numbers
pub const MAX_APPENDED_ACKS: usize = u8::MAX as usize;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PacketFlags: u8 {
        const ZEROCODED = 0x80;
        const RELIABLE = 0x40;
        const RESENT = 0x20;
        const ACK = 0x10;
    }
}

/// Header fields of a decoded datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub flags: PacketFlags,
    pub sequence: u32,
}

impl PacketHeader {
    pub fn is_reliable(&self) -> bool {
        self.flags.contains(PacketFlags::RELIABLE)
    }

    pub fn is_resent(&self) -> bool {
        self.flags.contains(PacketFlags::RESENT)
    }
}

/// A datagram split into its header, message number, body and appended acks.
/// The body is already zero-decoded.
#[derive(Debug, Clone)]
pub struct DecodedPacket {
    pub header: PacketHeader,
    pub message_id: MessageId,
    pub payload: Bytes,
    pub acks: Vec<u32>,
}

impl DecodedPacket {
    /// Decode the body as a specific message type
    pub fn decode<P: Packet>(&self) -> NetworkResult<P> {
        if self.message_id != P::message_id() {
            return Err(NetworkError::malformed(format!(
                "Packet type mismatch: expected {} ({}), got {}",
                P::name(),
                P::message_id(),
                self.message_id
            )));
        }
        let mut buffer = PacketBuffer::new(&self.payload);
        P::decode_body(&mut buffer)
    }

    pub fn is(&self, id: MessageId) -> bool {
        self.message_id == id
    }
}

/// Stateless encoder/decoder for LLUDP datagrams
pub struct PacketCodec;

impl PacketCodec {
    /// Frame an already-serialized message body.
    ///
    /// Acks are not appended here; the transmit loop appends as many as fit into
    /// the remaining budget with [`PacketCodec::append_acks`].
    pub fn encode(
        message_id: MessageId,
        body: &[u8],
        sequence: u32,
        reliable: bool,
        zerocoded: bool,
    ) -> NetworkResult<BytesMut> {
        let mut flags = PacketFlags::empty();
        if reliable {
            flags |= PacketFlags::RELIABLE;
        }

        let mut content = BytesMut::with_capacity(4 + body.len());
        Self::write_message_number(&mut content, message_id);
        content.extend_from_slice(body);

        let mut buffer = BytesMut::with_capacity(HEADER_SIZE + content.len());
        if zerocoded {
            let encoded = zerocode::encode(&content);
            // Zerocoding can grow a body with no zero runs; send it plain then
            if encoded.len() < content.len() {
                flags |= PacketFlags::ZEROCODED;
                Self::write_header(&mut buffer, flags, sequence);
                buffer.extend_from_slice(&encoded);
            } else {
                Self::write_header(&mut buffer, flags, sequence);
                buffer.extend_from_slice(&content);
            }
        } else {
            Self::write_header(&mut buffer, flags, sequence);
            buffer.extend_from_slice(&content);
        }

        if buffer.len() > MAX_PACKET_SIZE {
            return Err(NetworkError::SerializationFailure {
                message: "datagram",
                reason: format!(
                    "{} encodes to {} bytes, limit is {}",
                    message_id,
                    buffer.len(),
                    MAX_PACKET_SIZE
                ),
            });
        }

        Ok(buffer)
    }

    /// Append an ack block and set the ACK flag. Returns how many acks were written.
    pub fn append_acks(buffer: &mut BytesMut, acks: &[u32]) -> usize {
        let count = acks.len().min(MAX_APPENDED_ACKS);
        if count == 0 || buffer.is_empty() {
            return 0;
        }
        for ack in &acks[..count] {
            buffer.put_u32(*ack);
        }
        buffer.put_u8(count as u8);
        buffer[0] |= PacketFlags::ACK.bits();
        count
    }

    /// How many acks fit into a datagram of `len` bytes without passing `budget`
    pub fn ack_capacity(len: usize, budget: usize) -> usize {
        (budget.saturating_sub(len + 1) / 4).min(MAX_APPENDED_ACKS)
    }

    /// Flag an already-framed datagram as a retransmission
    pub fn mark_resent(buffer: &mut [u8]) {
        if let Some(flags) = buffer.first_mut() {
            *flags |= PacketFlags::RESENT.bits();
        }
    }

    /// Parse a raw datagram
    pub fn decode(data: &[u8]) -> NetworkResult<DecodedPacket> {
        if data.len() < MIN_PACKET_SIZE {
            return Err(NetworkError::malformed(format!(
                "Packet too short for header: {} bytes",
                data.len()
            )));
        }
        if data.len() > MAX_PACKET_SIZE {
            return Err(NetworkError::malformed(format!(
                "Packet larger than receive buffer: {} bytes",
                data.len()
            )));
        }

        let flags = PacketFlags::from_bits_truncate(data[0]);
        let sequence = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
        let body_start = HEADER_SIZE + data[5] as usize;

        // The ack block hangs off the end: N big-endian sequence numbers, then N
        let mut body_end = data.len();
        let mut acks = Vec::new();
        if flags.contains(PacketFlags::ACK) {
            let count = data[data.len() - 1] as usize;
            let block = count * 4 + 1;
            if block > data.len() || data.len() - block < body_start {
                return Err(NetworkError::malformed(format!(
                    "Ack block of {} entries does not fit in {} bytes",
                    count,
                    data.len()
                )));
            }
            body_end = data.len() - block;
            acks = data[body_end..data.len() - 1]
                .chunks_exact(4)
                .map(|chunk| u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .collect();
        }

        if body_start >= body_end {
            return Err(NetworkError::malformed("Extra header runs past the message body"));
        }

        let content = if flags.contains(PacketFlags::ZEROCODED) {
            Bytes::from(zerocode::decode(&data[body_start..body_end])?)
        } else {
            Bytes::copy_from_slice(&data[body_start..body_end])
        };

        let mut buffer = PacketBuffer::new(&content);
        let message_id = Self::read_message_number(&mut buffer)?;
        let payload = content.slice(buffer.position()..);

        Ok(DecodedPacket {
            header: PacketHeader { flags, sequence },
            message_id,
            payload,
            acks,
        })
    }

    /// Format: [flags:1] [sequence:4 BE] [extra:1]
    fn write_header(buffer: &mut BytesMut, flags: PacketFlags, sequence: u32) {
        buffer.put_u8(flags.bits());
        buffer.put_u32(sequence);
        buffer.put_u8(0);
    }

    fn write_message_number(buffer: &mut BytesMut, id: MessageId) {
        match id.frequency {
            PacketFrequency::High => buffer.put_u8(id.number as u8),
            PacketFrequency::Medium => {
                buffer.put_u8(0xFF);
                buffer.put_u8(id.number as u8);
            }
            PacketFrequency::Low => {
                buffer.put_u8(0xFF);
                buffer.put_u8(0xFF);
                buffer.put_u16(id.number);
            }
            PacketFrequency::Fixed => {
                buffer.put_u8(0xFF);
                buffer.put_u8(0xFF);
                buffer.put_u8(0xFF);
                buffer.put_u8(id.number as u8);
            }
        }
    }

    fn read_message_number(buffer: &mut PacketBuffer<'_>) -> NetworkResult<MessageId> {
        let first = buffer.get_u8()?;
        if first != 0xFF {
            return Ok(MessageId::new(PacketFrequency::High, first as u16));
        }
        let second = buffer.get_u8()?;
        if second != 0xFF {
            return Ok(MessageId::new(PacketFrequency::Medium, second as u16));
        }
        // Low numbers never start with 0xFF, so a third 0xFF means Fixed
        if buffer.peek_u8() == Some(0xFF) {
            buffer.get_u8()?;
            let number = buffer.get_u8()?;
            return Ok(MessageId::new(PacketFrequency::Fixed, number as u16));
        }
        let number = buffer.get_u16_be()?;
        Ok(MessageId::new(PacketFrequency::Low, number))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::networking::packets::{KillObject, PacketAck, StartPingCheck, UseCircuitCode};
    use uuid::Uuid;

    fn frame<P: Packet>(packet: &P, sequence: u32, reliable: bool) -> BytesMut {
        let mut body = BytesMut::new();
        packet.encode_body(&mut body).unwrap();
        PacketCodec::encode(P::message_id(), &body, sequence, reliable, P::ZEROCODED).unwrap()
    }

    #[test]
    fn test_header_layout() {
        let ping = StartPingCheck { ping_id: 7, oldest_unacked: 0 };
        let data = frame(&ping, 0x01020304, true);
        assert_eq!(data[0], PacketFlags::RELIABLE.bits());
        assert_eq!(&data[1..5], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(data[5], 0);
        // High frequency: one byte message number
        assert_eq!(data[6], 1);
    }

    #[test]
    fn test_message_number_bands() {
        let cases = [
            (MessageId::new(PacketFrequency::High, 12), vec![12u8]),
            (MessageId::new(PacketFrequency::Medium, 9), vec![0xFF, 9]),
            (MessageId::new(PacketFrequency::Low, 261), vec![0xFF, 0xFF, 0x01, 0x05]),
            (MessageId::new(PacketFrequency::Fixed, 251), vec![0xFF, 0xFF, 0xFF, 251]),
        ];
        for (id, expected) in cases {
            let data = PacketCodec::encode(id, &[0xAA], 1, false, false).unwrap();
            assert_eq!(&data[HEADER_SIZE..HEADER_SIZE + expected.len()], expected.as_slice());
            let decoded = PacketCodec::decode(&data).unwrap();
            assert_eq!(decoded.message_id, id);
            assert_eq!(&decoded.payload[..], &[0xAA]);
        }
    }

    #[test]
    fn test_appended_acks_trail_the_body() {
        let ping = StartPingCheck { ping_id: 3, oldest_unacked: 9 };
        let mut data = frame(&ping, 42, false);
        let body_len = data.len();
        assert_eq!(PacketCodec::append_acks(&mut data, &[5, 0x0A0B0C0D]), 2);

        assert_eq!(data.len(), body_len + 9);
        assert_eq!(data[data.len() - 1], 2);
        assert_eq!(&data[data.len() - 5..data.len() - 1], &[0x0A, 0x0B, 0x0C, 0x0D]);

        let decoded = PacketCodec::decode(&data).unwrap();
        assert!(decoded.header.flags.contains(PacketFlags::ACK));
        assert_eq!(decoded.acks, vec![5, 0x0A0B0C0D]);
        let ping: StartPingCheck = decoded.decode().unwrap();
        assert_eq!(ping.ping_id, 3);
        assert_eq!(ping.oldest_unacked, 9);
    }

    #[test]
    fn test_zerocoded_round_trip_with_acks() {
        let code = UseCircuitCode {
            code: 0x100,
            session_id: Uuid::nil(),
            agent_id: Uuid::from_u128(1),
        };
        let mut body = BytesMut::new();
        code.encode_body(&mut body).unwrap();
        let mut data = PacketCodec::encode(UseCircuitCode::message_id(), &body, 1, true, true).unwrap();
        assert!(data[0] & PacketFlags::ZEROCODED.bits() != 0);
        assert!(data.len() < HEADER_SIZE + 4 + body.len());
        PacketCodec::append_acks(&mut data, &[0, 1]);

        let decoded = PacketCodec::decode(&data).unwrap();
        assert_eq!(decoded.acks, vec![0, 1]);
        let parsed: UseCircuitCode = decoded.decode().unwrap();
        assert_eq!(parsed.code, 0x100);
        assert_eq!(parsed.agent_id, Uuid::from_u128(1));
    }

    #[test]
    fn test_undersized_datagram_is_malformed() {
        for len in 0..MIN_PACKET_SIZE {
            let data = vec![0u8; len];
            assert!(matches!(
                PacketCodec::decode(&data),
                Err(NetworkError::MalformedPacket { .. })
            ));
        }
    }

    #[test]
    fn test_oversized_ack_count_is_malformed() {
        let mut data = PacketCodec::encode(KillObject::message_id(), &[0], 1, false, false).unwrap();
        data[0] |= PacketFlags::ACK.bits();
        data.put_u8(200);
        assert!(matches!(
            PacketCodec::decode(&data),
            Err(NetworkError::MalformedPacket { .. })
        ));
    }

    #[test]
    fn test_extra_header_past_end_is_malformed() {
        let mut data = PacketCodec::encode(KillObject::message_id(), &[0], 1, false, false).unwrap();
        data[5] = 40;
        assert!(PacketCodec::decode(&data).is_err());
    }

    #[test]
    fn test_truncated_low_message_number() {
        let data = [0u8, 0, 0, 0, 1, 0, 0xFF, 0xFF, 0x01];
        assert!(PacketCodec::decode(&data).is_err());
    }

    #[test]
    fn test_mark_resent() {
        let mut data = frame(&PacketAck { packets: vec![1] }, 4, true);
        PacketCodec::mark_resent(&mut data);
        let decoded = PacketCodec::decode(&data).unwrap();
        assert!(decoded.header.is_resent());
        assert!(decoded.header.is_reliable());
    }

    #[test]
    fn test_ack_capacity() {
        assert_eq!(PacketCodec::ack_capacity(1400, 1500), 24);
        assert_eq!(PacketCodec::ack_capacity(1500, 1500), 0);
        assert_eq!(PacketCodec::ack_capacity(10, 10_000), MAX_APPENDED_ACKS);
    }
}
