//! Protocol field types and their wire encodings
//!
//! Body fields are little-endian; UUIDs are 16 raw bytes; variable fields carry
//! a one or two byte length prefix and variable blocks a one byte count.

use crate::networking::serialization::PacketBuffer;
use crate::networking::{NetworkError, NetworkResult};
use bytes::{BufMut, BytesMut};
use uuid::Uuid;

/// 3D Vector (12 bytes: 3 x F32)
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LLVector3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl LLVector3 {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn zero() -> Self {
        Self::default()
    }

    pub const ENCODED_LEN: usize = 12;

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_f32_le(self.x);
        buf.put_f32_le(self.y);
        buf.put_f32_le(self.z);
    }

    pub fn decode(buf: &mut PacketBuffer<'_>) -> NetworkResult<Self> {
        Ok(Self::new(buf.get_f32()?, buf.get_f32()?, buf.get_f32()?))
    }
}

/// Write helpers shared by the generated message bodies
pub trait BufMutExt {
    fn put_uuid(&mut self, id: &Uuid);
    fn put_bool(&mut self, value: bool);
    fn put_variable1(&mut self, field: &'static str, data: &[u8]) -> NetworkResult<()>;
    fn put_variable2(&mut self, field: &'static str, data: &[u8]) -> NetworkResult<()>;
    fn put_block_count(&mut self, block: &'static str, count: usize) -> NetworkResult<()>;
}

impl BufMutExt for BytesMut {
    fn put_uuid(&mut self, id: &Uuid) {
        self.put_slice(id.as_bytes());
    }

    fn put_bool(&mut self, value: bool) {
        self.put_u8(value as u8);
    }

    fn put_variable1(&mut self, field: &'static str, data: &[u8]) -> NetworkResult<()> {
        let len = u8::try_from(data.len()).map_err(|_| too_long(field, data.len(), u8::MAX as usize))?;
        self.put_u8(len);
        self.put_slice(data);
        Ok(())
    }

    fn put_variable2(&mut self, field: &'static str, data: &[u8]) -> NetworkResult<()> {
        let len = u16::try_from(data.len()).map_err(|_| too_long(field, data.len(), u16::MAX as usize))?;
        self.put_u16_le(len);
        self.put_slice(data);
        Ok(())
    }

    fn put_block_count(&mut self, block: &'static str, count: usize) -> NetworkResult<()> {
        let count = u8::try_from(count).map_err(|_| too_long(block, count, u8::MAX as usize))?;
        self.put_u8(count);
        Ok(())
    }
}

fn too_long(field: &'static str, len: usize, max: usize) -> NetworkError {
    NetworkError::SerializationFailure {
        message: field,
        reason: format!("{} exceeds the limit of {}", len, max),
    }
}

/// Null-terminated UTF-8 for string fields carried in variable blocks
pub fn to_variable(s: &str) -> Vec<u8> {
    let mut data = s.as_bytes().to_vec();
    data.push(0);
    data
}

pub fn from_variable(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}
