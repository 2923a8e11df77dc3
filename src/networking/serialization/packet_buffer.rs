//! Bounds-checked reader for LLUDP message bodies

use crate::networking::{NetworkError, NetworkResult};
use uuid::Uuid;

/// Cursor over a decoded message body.
///
/// Every read is checked; running off the end yields `MalformedPacket` instead of
/// the zero-fill a lenient reader would produce, so a truncated datagram can never
/// be mistaken for a valid one.
pub struct PacketBuffer<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> PacketBuffer<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.position)
    }

    pub fn remaining_bytes(&self) -> &'a [u8] {
        &self.data[self.position..]
    }

    pub fn has_remaining(&self) -> bool {
        self.position < self.data.len()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Check if we have at least n bytes remaining
    pub fn check_remaining(&self, n: usize) -> NetworkResult<()> {
        if self.remaining() < n {
            Err(NetworkError::malformed(format!(
                "Not enough data: need {}, have {}",
                n,
                self.remaining()
            )))
        } else {
            Ok(())
        }
    }

    pub fn get_bytes_slice(&mut self, len: usize) -> NetworkResult<&'a [u8]> {
        self.check_remaining(len)?;
        let slice = &self.data[self.position..self.position + len];
        self.position += len;
        Ok(slice)
    }

    fn get_array<const N: usize>(&mut self) -> NetworkResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.get_bytes_slice(N)?);
        Ok(out)
    }

    pub fn get_u8(&mut self) -> NetworkResult<u8> {
        Ok(self.get_array::<1>()?[0])
    }

    pub fn get_bool(&mut self) -> NetworkResult<bool> {
        Ok(self.get_u8()? != 0)
    }

    pub fn get_u16_le(&mut self) -> NetworkResult<u16> {
        Ok(u16::from_le_bytes(self.get_array()?))
    }

    /// Big-endian; only message numbers and header fields use this order
    pub fn get_u16_be(&mut self) -> NetworkResult<u16> {
        Ok(u16::from_be_bytes(self.get_array()?))
    }

    pub fn get_u32_le(&mut self) -> NetworkResult<u32> {
        Ok(u32::from_le_bytes(self.get_array()?))
    }

    pub fn get_u32_be(&mut self) -> NetworkResult<u32> {
        Ok(u32::from_be_bytes(self.get_array()?))
    }

    pub fn get_u64_le(&mut self) -> NetworkResult<u64> {
        Ok(u64::from_le_bytes(self.get_array()?))
    }

    pub fn get_f32(&mut self) -> NetworkResult<f32> {
        Ok(f32::from_bits(self.get_u32_le()?))
    }

    pub fn get_uuid(&mut self) -> NetworkResult<Uuid> {
        Ok(Uuid::from_bytes(self.get_array()?))
    }

    /// Get a variable-length field with 1-byte length prefix
    pub fn get_variable1(&mut self) -> NetworkResult<Vec<u8>> {
        let len = self.get_u8()? as usize;
        Ok(self.get_bytes_slice(len)?.to_vec())
    }

    /// Get a variable-length field with 2-byte length prefix
    pub fn get_variable2(&mut self) -> NetworkResult<Vec<u8>> {
        let len = self.get_u16_le()? as usize;
        Ok(self.get_bytes_slice(len)?.to_vec())
    }

    /// Peek at next byte without advancing position
    pub fn peek_u8(&self) -> Option<u8> {
        self.data.get(self.position).copied()
    }
}
