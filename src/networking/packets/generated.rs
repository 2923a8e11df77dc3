//! Protocol message definitions
//!
//! Numbers and flags follow the LLUDP message template.

use super::types::*;
use super::{Packet, PacketFrequency};
use crate::networking::circuit::lanes::OutboundLane;
use crate::networking::serialization::PacketBuffer;
use crate::networking::NetworkResult;
use bytes::{BufMut, BytesMut};
use uuid::Uuid;

fn decode_blocks<T>(
    buf: &mut PacketBuffer<'_>,
    mut decode: impl FnMut(&mut PacketBuffer<'_>) -> NetworkResult<T>,
) -> NetworkResult<Vec<T>> {
    let count = buf.get_u8()? as usize;
    let mut blocks = Vec::with_capacity(count);
    for _ in 0..count {
        blocks.push(decode(buf)?);
    }
    Ok(blocks)
}

/// UseCircuitCode - first packet from a peer, binds a circuit code to its endpoint
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UseCircuitCode {
    pub code: u32,
    pub session_id: Uuid,
    pub agent_id: Uuid,
}

impl Packet for UseCircuitCode {
    const ID: u16 = 3;
    const FREQUENCY: PacketFrequency = PacketFrequency::Low;
    const RELIABLE: bool = true;
    const ZEROCODED: bool = false;

    fn name() -> &'static str { "UseCircuitCode" }

    fn encode_body(&self, buf: &mut BytesMut) -> NetworkResult<()> {
        buf.put_u32_le(self.code);
        buf.put_uuid(&self.session_id);
        buf.put_uuid(&self.agent_id);
        Ok(())
    }

    fn decode_body(buf: &mut PacketBuffer<'_>) -> NetworkResult<Self> {
        Ok(Self {
            code: buf.get_u32_le()?,
            session_id: buf.get_uuid()?,
            agent_id: buf.get_uuid()?,
        })
    }
}

/// RegionHandshake - region description sent once a circuit is bound
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RegionHandshake {
    pub region_flags: u32,
    pub sim_access: u8,
    pub sim_name: String,
    pub sim_owner: Uuid,
    pub is_estate_manager: bool,
    pub water_height: f32,
    pub billable_factor: f32,
    pub cache_id: Uuid,
    pub region_id: Uuid,
    pub product_sku: String,
    pub product_name: String,
}

impl Packet for RegionHandshake {
    const ID: u16 = 148;
    const FREQUENCY: PacketFrequency = PacketFrequency::Low;
    const RELIABLE: bool = true;
    const ZEROCODED: bool = true;

    fn name() -> &'static str { "RegionHandshake" }

    fn encode_body(&self, buf: &mut BytesMut) -> NetworkResult<()> {
        buf.put_u32_le(self.region_flags);
        buf.put_u8(self.sim_access);
        buf.put_variable1("SimName", &to_variable(&self.sim_name))?;
        buf.put_uuid(&self.sim_owner);
        buf.put_bool(self.is_estate_manager);
        buf.put_f32_le(self.water_height);
        buf.put_f32_le(self.billable_factor);
        buf.put_uuid(&self.cache_id);
        // Terrain textures and height bands are left at their defaults
        for _ in 0..8 {
            buf.put_uuid(&Uuid::nil());
        }
        for _ in 0..8 {
            buf.put_f32_le(0.0);
        }
        buf.put_uuid(&self.region_id);
        buf.put_i32_le(0);
        buf.put_i32_le(1);
        buf.put_variable1("ColoName", &[])?;
        buf.put_variable1("ProductSKU", &to_variable(&self.product_sku))?;
        buf.put_variable1("ProductName", &to_variable(&self.product_name))?;
        buf.put_block_count("RegionInfo4", 0)
    }

    fn decode_body(buf: &mut PacketBuffer<'_>) -> NetworkResult<Self> {
        let region_flags = buf.get_u32_le()?;
        let sim_access = buf.get_u8()?;
        let sim_name = from_variable(&buf.get_variable1()?);
        let sim_owner = buf.get_uuid()?;
        let is_estate_manager = buf.get_bool()?;
        let water_height = buf.get_f32()?;
        let billable_factor = buf.get_f32()?;
        let cache_id = buf.get_uuid()?;
        buf.get_bytes_slice(8 * 16 + 8 * 4)?;
        let region_id = buf.get_uuid()?;
        buf.get_bytes_slice(8)?;
        buf.get_variable1()?;
        let product_sku = from_variable(&buf.get_variable1()?);
        let product_name = from_variable(&buf.get_variable1()?);
        let extra_info = buf.get_u8()? as usize;
        buf.get_bytes_slice(extra_info * 16)?;
        Ok(Self {
            region_flags,
            sim_access,
            sim_name,
            sim_owner,
            is_estate_manager,
            water_height,
            billable_factor,
            cache_id,
            region_id,
            product_sku,
            product_name,
        })
    }
}

/// RegionHandshakeReply - client acknowledges the region handshake
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RegionHandshakeReply {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub flags: u32,
}

impl Packet for RegionHandshakeReply {
    const ID: u16 = 149;
    const FREQUENCY: PacketFrequency = PacketFrequency::Low;
    const RELIABLE: bool = true;
    const ZEROCODED: bool = true;

    fn name() -> &'static str { "RegionHandshakeReply" }

    fn encode_body(&self, buf: &mut BytesMut) -> NetworkResult<()> {
        buf.put_uuid(&self.agent_id);
        buf.put_uuid(&self.session_id);
        buf.put_u32_le(self.flags);
        Ok(())
    }

    fn decode_body(buf: &mut PacketBuffer<'_>) -> NetworkResult<Self> {
        Ok(Self {
            agent_id: buf.get_uuid()?,
            session_id: buf.get_uuid()?,
            flags: buf.get_u32_le()?,
        })
    }
}

/// CompleteAgentMovement - the viewer is ready for the scene
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CompleteAgentMovement {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub circuit_code: u32,
}

impl Packet for CompleteAgentMovement {
    const ID: u16 = 249;
    const FREQUENCY: PacketFrequency = PacketFrequency::Low;
    const RELIABLE: bool = true;
    const ZEROCODED: bool = false;

    fn name() -> &'static str { "CompleteAgentMovement" }

    fn encode_body(&self, buf: &mut BytesMut) -> NetworkResult<()> {
        buf.put_uuid(&self.agent_id);
        buf.put_uuid(&self.session_id);
        buf.put_u32_le(self.circuit_code);
        Ok(())
    }

    fn decode_body(buf: &mut PacketBuffer<'_>) -> NetworkResult<Self> {
        Ok(Self {
            agent_id: buf.get_uuid()?,
            session_id: buf.get_uuid()?,
            circuit_code: buf.get_u32_le()?,
        })
    }
}

/// PacketAck - dedicated acknowledgement packet
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PacketAck {
    pub packets: Vec<u32>,
}

impl Packet for PacketAck {
    const ID: u16 = 251;
    const FREQUENCY: PacketFrequency = PacketFrequency::Fixed;
    const RELIABLE: bool = false;
    const ZEROCODED: bool = false;
    const LANE: Option<OutboundLane> = Some(OutboundLane::High);

    fn name() -> &'static str { "PacketAck" }

    fn encode_body(&self, buf: &mut BytesMut) -> NetworkResult<()> {
        buf.put_block_count("Packets", self.packets.len())?;
        for id in &self.packets {
            buf.put_u32_le(*id);
        }
        Ok(())
    }

    fn decode_body(buf: &mut PacketBuffer<'_>) -> NetworkResult<Self> {
        Ok(Self {
            packets: decode_blocks(buf, |b| b.get_u32_le())?,
        })
    }
}

/// StartPingCheck - latency probe
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StartPingCheck {
    pub ping_id: u8,
    pub oldest_unacked: u32,
}

impl Packet for StartPingCheck {
    const ID: u16 = 1;
    const FREQUENCY: PacketFrequency = PacketFrequency::High;
    const RELIABLE: bool = false;
    const ZEROCODED: bool = false;

    fn name() -> &'static str { "StartPingCheck" }

    fn encode_body(&self, buf: &mut BytesMut) -> NetworkResult<()> {
        buf.put_u8(self.ping_id);
        buf.put_u32_le(self.oldest_unacked);
        Ok(())
    }

    fn decode_body(buf: &mut PacketBuffer<'_>) -> NetworkResult<Self> {
        Ok(Self {
            ping_id: buf.get_u8()?,
            oldest_unacked: buf.get_u32_le()?,
        })
    }
}

/// CompletePingCheck - echo of a StartPingCheck id
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CompletePingCheck {
    pub ping_id: u8,
}

impl Packet for CompletePingCheck {
    const ID: u16 = 2;
    const FREQUENCY: PacketFrequency = PacketFrequency::High;
    const RELIABLE: bool = false;
    const ZEROCODED: bool = false;

    fn name() -> &'static str { "CompletePingCheck" }

    fn encode_body(&self, buf: &mut BytesMut) -> NetworkResult<()> {
        buf.put_u8(self.ping_id);
        Ok(())
    }

    fn decode_body(buf: &mut PacketBuffer<'_>) -> NetworkResult<Self> {
        Ok(Self { ping_id: buf.get_u8()? })
    }
}

/// CloseCircuit - peer is tearing the circuit down
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CloseCircuit;

impl Packet for CloseCircuit {
    const ID: u16 = 253;
    const FREQUENCY: PacketFrequency = PacketFrequency::Fixed;
    const RELIABLE: bool = false;
    const ZEROCODED: bool = false;

    fn name() -> &'static str { "CloseCircuit" }

    fn encode_body(&self, _buf: &mut BytesMut) -> NetworkResult<()> {
        Ok(())
    }

    fn decode_body(_buf: &mut PacketBuffer<'_>) -> NetworkResult<Self> {
        Ok(Self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LogoutRequest {
    pub agent_id: Uuid,
    pub session_id: Uuid,
}

impl Packet for LogoutRequest {
    const ID: u16 = 252;
    const FREQUENCY: PacketFrequency = PacketFrequency::Low;
    const RELIABLE: bool = true;
    const ZEROCODED: bool = false;

    fn name() -> &'static str { "LogoutRequest" }

    fn encode_body(&self, buf: &mut BytesMut) -> NetworkResult<()> {
        buf.put_uuid(&self.agent_id);
        buf.put_uuid(&self.session_id);
        Ok(())
    }

    fn decode_body(buf: &mut PacketBuffer<'_>) -> NetworkResult<Self> {
        Ok(Self {
            agent_id: buf.get_uuid()?,
            session_id: buf.get_uuid()?,
        })
    }
}

/// LogoutReply - its acknowledgement ends the circuit
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LogoutReply {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub item_ids: Vec<Uuid>,
}

impl Packet for LogoutReply {
    const ID: u16 = 253;
    const FREQUENCY: PacketFrequency = PacketFrequency::Low;
    const RELIABLE: bool = true;
    const ZEROCODED: bool = true;
    const LANE: Option<OutboundLane> = Some(OutboundLane::High);

    fn name() -> &'static str { "LogoutReply" }

    fn encode_body(&self, buf: &mut BytesMut) -> NetworkResult<()> {
        buf.put_uuid(&self.agent_id);
        buf.put_uuid(&self.session_id);
        // The block must carry at least one entry
        if self.item_ids.is_empty() {
            buf.put_u8(1);
            buf.put_uuid(&Uuid::nil());
        } else {
            buf.put_block_count("InventoryData", self.item_ids.len())?;
            for id in &self.item_ids {
                buf.put_uuid(id);
            }
        }
        Ok(())
    }

    fn decode_body(buf: &mut PacketBuffer<'_>) -> NetworkResult<Self> {
        let agent_id = buf.get_uuid()?;
        let session_id = buf.get_uuid()?;
        let item_ids = decode_blocks(buf, |b| b.get_uuid())?
            .into_iter()
            .filter(|id| !id.is_nil())
            .collect();
        Ok(Self { agent_id, session_id, item_ids })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChatFromViewer {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub message: String,
    pub chat_type: u8,
    pub channel: i32,
}

impl Packet for ChatFromViewer {
    const ID: u16 = 80;
    const FREQUENCY: PacketFrequency = PacketFrequency::Low;
    const RELIABLE: bool = true;
    const ZEROCODED: bool = false;

    fn name() -> &'static str { "ChatFromViewer" }

    fn encode_body(&self, buf: &mut BytesMut) -> NetworkResult<()> {
        buf.put_uuid(&self.agent_id);
        buf.put_uuid(&self.session_id);
        buf.put_variable2("Message", &to_variable(&self.message))?;
        buf.put_u8(self.chat_type);
        buf.put_i32_le(self.channel);
        Ok(())
    }

    fn decode_body(buf: &mut PacketBuffer<'_>) -> NetworkResult<Self> {
        Ok(Self {
            agent_id: buf.get_uuid()?,
            session_id: buf.get_uuid()?,
            message: from_variable(&buf.get_variable2()?),
            chat_type: buf.get_u8()?,
            channel: buf.get_u32_le()? as i32,
        })
    }
}

/// ImprovedInstantMessage - routed further by its dialog byte
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ImprovedInstantMessage {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub from_group: bool,
    pub to_agent_id: Uuid,
    pub parent_estate_id: u32,
    pub region_id: Uuid,
    pub position: LLVector3,
    pub offline: u8,
    pub dialog: u8,
    pub id: Uuid,
    pub timestamp: u32,
    pub from_agent_name: String,
    pub message: String,
    pub binary_bucket: Vec<u8>,
}

impl ImprovedInstantMessage {
    /// Offset of the dialog byte within the body
    pub(crate) const DIALOG_OFFSET: usize = 16 + 16 + 1 + 16 + 4 + 16 + LLVector3::ENCODED_LEN + 1;
}

impl Packet for ImprovedInstantMessage {
    const ID: u16 = 254;
    const FREQUENCY: PacketFrequency = PacketFrequency::Low;
    const RELIABLE: bool = true;
    const ZEROCODED: bool = true;

    fn name() -> &'static str { "ImprovedInstantMessage" }

    fn encode_body(&self, buf: &mut BytesMut) -> NetworkResult<()> {
        buf.put_uuid(&self.agent_id);
        buf.put_uuid(&self.session_id);
        buf.put_bool(self.from_group);
        buf.put_uuid(&self.to_agent_id);
        buf.put_u32_le(self.parent_estate_id);
        buf.put_uuid(&self.region_id);
        self.position.encode(buf);
        buf.put_u8(self.offline);
        buf.put_u8(self.dialog);
        buf.put_uuid(&self.id);
        buf.put_u32_le(self.timestamp);
        buf.put_variable1("FromAgentName", &to_variable(&self.from_agent_name))?;
        buf.put_variable2("Message", &to_variable(&self.message))?;
        buf.put_variable2("BinaryBucket", &self.binary_bucket)
    }

    fn decode_body(buf: &mut PacketBuffer<'_>) -> NetworkResult<Self> {
        Ok(Self {
            agent_id: buf.get_uuid()?,
            session_id: buf.get_uuid()?,
            from_group: buf.get_bool()?,
            to_agent_id: buf.get_uuid()?,
            parent_estate_id: buf.get_u32_le()?,
            region_id: buf.get_uuid()?,
            position: LLVector3::decode(buf)?,
            offline: buf.get_u8()?,
            dialog: buf.get_u8()?,
            id: buf.get_uuid()?,
            timestamp: buf.get_u32_le()?,
            from_agent_name: from_variable(&buf.get_variable1()?),
            message: from_variable(&buf.get_variable2()?),
            binary_bucket: buf.get_variable2()?,
        })
    }
}

/// Layout shared by GenericMessage and GodlikeMessage
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MethodCall {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub transaction_id: Uuid,
    pub method: String,
    pub invoice: Uuid,
    pub params: Vec<Vec<u8>>,
}

impl MethodCall {
    fn encode(&self, buf: &mut BytesMut) -> NetworkResult<()> {
        buf.put_uuid(&self.agent_id);
        buf.put_uuid(&self.session_id);
        buf.put_uuid(&self.transaction_id);
        buf.put_variable1("Method", &to_variable(&self.method))?;
        buf.put_uuid(&self.invoice);
        buf.put_block_count("ParamList", self.params.len())?;
        for param in &self.params {
            buf.put_variable1("Parameter", param)?;
        }
        Ok(())
    }

    fn decode(buf: &mut PacketBuffer<'_>) -> NetworkResult<Self> {
        Ok(Self {
            agent_id: buf.get_uuid()?,
            session_id: buf.get_uuid()?,
            transaction_id: buf.get_uuid()?,
            method: from_variable(&buf.get_variable1()?),
            invoice: buf.get_uuid()?,
            params: decode_blocks(buf, |b| b.get_variable1())?,
        })
    }

    /// Read only the method name, for routing
    pub(crate) fn peek_method(payload: &[u8]) -> NetworkResult<String> {
        let mut buf = PacketBuffer::new(payload);
        buf.get_bytes_slice(48)?;
        Ok(from_variable(&buf.get_variable1()?))
    }

    pub fn param_strings(&self) -> Vec<String> {
        self.params.iter().map(|p| from_variable(p)).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GenericMessage(pub MethodCall);

impl Packet for GenericMessage {
    const ID: u16 = 261;
    const FREQUENCY: PacketFrequency = PacketFrequency::Low;
    const RELIABLE: bool = true;
    const ZEROCODED: bool = true;

    fn name() -> &'static str { "GenericMessage" }

    fn encode_body(&self, buf: &mut BytesMut) -> NetworkResult<()> {
        self.0.encode(buf)
    }

    fn decode_body(buf: &mut PacketBuffer<'_>) -> NetworkResult<Self> {
        MethodCall::decode(buf).map(Self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GodlikeMessage(pub MethodCall);

impl Packet for GodlikeMessage {
    const ID: u16 = 259;
    const FREQUENCY: PacketFrequency = PacketFrequency::Low;
    const RELIABLE: bool = true;
    const ZEROCODED: bool = true;

    fn name() -> &'static str { "GodlikeMessage" }

    fn encode_body(&self, buf: &mut BytesMut) -> NetworkResult<()> {
        self.0.encode(buf)
    }

    fn decode_body(buf: &mut PacketBuffer<'_>) -> NetworkResult<Self> {
        MethodCall::decode(buf).map(Self)
    }
}

/// Full state of one object inside an ObjectUpdate
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ObjectUpdateBlock {
    pub local_id: u32,
    pub state: u8,
    pub full_id: Uuid,
    pub crc: u32,
    pub pcode: u8,
    pub material: u8,
    pub click_action: u8,
    pub scale: LLVector3,
    pub object_data: Vec<u8>,
    pub parent_id: u32,
    pub update_flags: u32,
    pub texture_entry: Vec<u8>,
    pub name_value: Vec<u8>,
}

impl ObjectUpdateBlock {
    const FIXED_LEN: usize = 4 + 1 + 16 + 4 + 1 + 1 + 1 + LLVector3::ENCODED_LEN + 1 + 4 + 4 + 2 + 2;

    pub fn encoded_len(&self) -> usize {
        Self::FIXED_LEN + self.object_data.len() + self.texture_entry.len() + self.name_value.len()
    }

    fn encode(&self, buf: &mut BytesMut) -> NetworkResult<()> {
        buf.put_u32_le(self.local_id);
        buf.put_u8(self.state);
        buf.put_uuid(&self.full_id);
        buf.put_u32_le(self.crc);
        buf.put_u8(self.pcode);
        buf.put_u8(self.material);
        buf.put_u8(self.click_action);
        self.scale.encode(buf);
        buf.put_variable1("ObjectData", &self.object_data)?;
        buf.put_u32_le(self.parent_id);
        buf.put_u32_le(self.update_flags);
        buf.put_variable2("TextureEntry", &self.texture_entry)?;
        buf.put_variable2("NameValue", &self.name_value)
    }

    fn decode(buf: &mut PacketBuffer<'_>) -> NetworkResult<Self> {
        Ok(Self {
            local_id: buf.get_u32_le()?,
            state: buf.get_u8()?,
            full_id: buf.get_uuid()?,
            crc: buf.get_u32_le()?,
            pcode: buf.get_u8()?,
            material: buf.get_u8()?,
            click_action: buf.get_u8()?,
            scale: LLVector3::decode(buf)?,
            object_data: buf.get_variable1()?,
            parent_id: buf.get_u32_le()?,
            update_flags: buf.get_u32_le()?,
            texture_entry: buf.get_variable2()?,
            name_value: buf.get_variable2()?,
        })
    }
}

/// Region handle + time dilation + block count
pub const OBJECT_UPDATE_HEADER_LEN: usize = 8 + 2 + 1;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ObjectUpdate {
    pub region_handle: u64,
    pub time_dilation: u16,
    pub objects: Vec<ObjectUpdateBlock>,
}

impl ObjectUpdate {
    pub fn encoded_len(&self) -> usize {
        OBJECT_UPDATE_HEADER_LEN + self.objects.iter().map(ObjectUpdateBlock::encoded_len).sum::<usize>()
    }
}

impl Packet for ObjectUpdate {
    const ID: u16 = 12;
    const FREQUENCY: PacketFrequency = PacketFrequency::High;
    const RELIABLE: bool = true;
    const ZEROCODED: bool = true;
    const LANE: Option<OutboundLane> = Some(OutboundLane::Object);

    fn name() -> &'static str { "ObjectUpdate" }

    fn encode_body(&self, buf: &mut BytesMut) -> NetworkResult<()> {
        buf.put_u64_le(self.region_handle);
        buf.put_u16_le(self.time_dilation);
        buf.put_block_count("ObjectData", self.objects.len())?;
        for object in &self.objects {
            object.encode(buf)?;
        }
        Ok(())
    }

    fn decode_body(buf: &mut PacketBuffer<'_>) -> NetworkResult<Self> {
        Ok(Self {
            region_handle: buf.get_u64_le()?,
            time_dilation: buf.get_u16_le()?,
            objects: decode_blocks(buf, ObjectUpdateBlock::decode)?,
        })
    }
}

/// Motion-only state of one object
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TerseUpdateBlock {
    pub local_id: u32,
    pub motion: Vec<u8>,
    pub texture_entry: Vec<u8>,
}

impl TerseUpdateBlock {
    pub fn encoded_len(&self) -> usize {
        1 + 4 + self.motion.len() + 2 + self.texture_entry.len()
    }

    fn encode(&self, buf: &mut BytesMut) -> NetworkResult<()> {
        let mut data = Vec::with_capacity(4 + self.motion.len());
        data.extend_from_slice(&self.local_id.to_le_bytes());
        data.extend_from_slice(&self.motion);
        buf.put_variable1("Data", &data)?;
        buf.put_variable2("TextureEntry", &self.texture_entry)
    }

    fn decode(buf: &mut PacketBuffer<'_>) -> NetworkResult<Self> {
        let data = buf.get_variable1()?;
        let mut inner = PacketBuffer::new(&data);
        let local_id = inner.get_u32_le()?;
        Ok(Self {
            local_id,
            motion: inner.remaining_bytes().to_vec(),
            texture_entry: buf.get_variable2()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ImprovedTerseObjectUpdate {
    pub region_handle: u64,
    pub time_dilation: u16,
    pub objects: Vec<TerseUpdateBlock>,
}

impl Packet for ImprovedTerseObjectUpdate {
    const ID: u16 = 15;
    const FREQUENCY: PacketFrequency = PacketFrequency::High;
    const RELIABLE: bool = false;
    const ZEROCODED: bool = false;
    const LANE: Option<OutboundLane> = Some(OutboundLane::Object);

    fn name() -> &'static str { "ImprovedTerseObjectUpdate" }

    fn encode_body(&self, buf: &mut BytesMut) -> NetworkResult<()> {
        buf.put_u64_le(self.region_handle);
        buf.put_u16_le(self.time_dilation);
        buf.put_block_count("ObjectData", self.objects.len())?;
        for object in &self.objects {
            object.encode(buf)?;
        }
        Ok(())
    }

    fn decode_body(buf: &mut PacketBuffer<'_>) -> NetworkResult<Self> {
        Ok(Self {
            region_handle: buf.get_u64_le()?,
            time_dilation: buf.get_u16_le()?,
            objects: decode_blocks(buf, TerseUpdateBlock::decode)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KillObject {
    pub ids: Vec<u32>,
}

impl Packet for KillObject {
    const ID: u16 = 16;
    const FREQUENCY: PacketFrequency = PacketFrequency::High;
    const RELIABLE: bool = true;
    const ZEROCODED: bool = false;
    const LANE: Option<OutboundLane> = Some(OutboundLane::Object);

    fn name() -> &'static str { "KillObject" }

    fn encode_body(&self, buf: &mut BytesMut) -> NetworkResult<()> {
        buf.put_block_count("ObjectData", self.ids.len())?;
        for id in &self.ids {
            buf.put_u32_le(*id);
        }
        Ok(())
    }

    fn decode_body(buf: &mut PacketBuffer<'_>) -> NetworkResult<Self> {
        Ok(Self {
            ids: decode_blocks(buf, |b| b.get_u32_le())?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ObjectPropertiesBlock {
    pub object_id: Uuid,
    pub owner_id: Uuid,
    pub creator_id: Uuid,
    pub creation_date: u64,
    pub name: String,
    pub description: String,
}

impl ObjectPropertiesBlock {
    pub fn encoded_len(&self) -> usize {
        16 * 3 + 8 + 2 + self.name.len() + 2 + self.description.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ObjectProperties {
    pub objects: Vec<ObjectPropertiesBlock>,
}

impl Packet for ObjectProperties {
    const ID: u16 = 9;
    const FREQUENCY: PacketFrequency = PacketFrequency::Medium;
    const RELIABLE: bool = true;
    const ZEROCODED: bool = true;
    const LANE: Option<OutboundLane> = Some(OutboundLane::Object);

    fn name() -> &'static str { "ObjectProperties" }

    fn encode_body(&self, buf: &mut BytesMut) -> NetworkResult<()> {
        buf.put_block_count("ObjectData", self.objects.len())?;
        for object in &self.objects {
            buf.put_uuid(&object.object_id);
            buf.put_uuid(&object.owner_id);
            buf.put_uuid(&object.creator_id);
            buf.put_u64_le(object.creation_date);
            buf.put_variable1("Name", &to_variable(&object.name))?;
            buf.put_variable1("Description", &to_variable(&object.description))?;
        }
        Ok(())
    }

    fn decode_body(buf: &mut PacketBuffer<'_>) -> NetworkResult<Self> {
        let objects = decode_blocks(buf, |b| {
            Ok(ObjectPropertiesBlock {
                object_id: b.get_uuid()?,
                owner_id: b.get_uuid()?,
                creator_id: b.get_uuid()?,
                creation_date: b.get_u64_le()?,
                name: from_variable(&b.get_variable1()?),
                description: from_variable(&b.get_variable1()?),
            })
        })?;
        Ok(Self { objects })
    }
}

/// EnableSimulator - tells a viewer about a neighbour; event queue only
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EnableSimulator {
    pub handle: u64,
    pub ip: u32,
    pub port: u16,
}

impl Packet for EnableSimulator {
    const ID: u16 = 151;
    const FREQUENCY: PacketFrequency = PacketFrequency::Low;
    const RELIABLE: bool = true;
    const ZEROCODED: bool = false;
    const EVENT_QUEUE: bool = true;

    fn name() -> &'static str { "EnableSimulator" }

    fn encode_body(&self, buf: &mut BytesMut) -> NetworkResult<()> {
        buf.put_u64_le(self.handle);
        buf.put_u32(self.ip);
        buf.put_u16(self.port);
        Ok(())
    }

    fn decode_body(buf: &mut PacketBuffer<'_>) -> NetworkResult<Self> {
        Ok(Self {
            handle: buf.get_u64_le()?,
            ip: buf.get_u32_be()?,
            port: buf.get_u16_be()?,
        })
    }
}

/// DisableSimulator - a neighbour simulator is going away
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DisableSimulator;

impl Packet for DisableSimulator {
    const ID: u16 = 152;
    const FREQUENCY: PacketFrequency = PacketFrequency::Low;
    const RELIABLE: bool = false;
    const ZEROCODED: bool = false;

    fn name() -> &'static str { "DisableSimulator" }

    fn encode_body(&self, _buf: &mut BytesMut) -> NetworkResult<()> {
        Ok(())
    }

    fn decode_body(_buf: &mut PacketBuffer<'_>) -> NetworkResult<Self> {
        Ok(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip<P: Packet>(packet: &P) -> P {
        let mut buf = BytesMut::new();
        packet.encode_body(&mut buf).unwrap();
        let mut reader = PacketBuffer::new(&buf);
        let decoded = P::decode_body(&mut reader).unwrap();
        assert!(!reader.has_remaining(), "{} left trailing bytes", P::name());
        decoded
    }

    #[test]
    fn test_object_update_encoded_len_matches_wire() {
        let update = ObjectUpdate {
            region_handle: 1,
            time_dilation: 0xFFFF,
            objects: vec![ObjectUpdateBlock {
                local_id: 17,
                full_id: Uuid::from_u128(17),
                object_data: vec![1; 60],
                texture_entry: vec![2; 40],
                name_value: b"Name STRING RW SV box\0".to_vec(),
                ..Default::default()
            }],
        };
        let mut buf = BytesMut::new();
        update.encode_body(&mut buf).unwrap();
        assert_eq!(buf.len(), update.encoded_len());
        assert_eq!(round_trip(&update), update);
    }

    #[test]
    fn test_terse_block_prefixes_local_id() {
        let update = ImprovedTerseObjectUpdate {
            region_handle: 5,
            time_dilation: 1,
            objects: vec![TerseUpdateBlock {
                local_id: 0x01020304,
                motion: vec![9; 44],
                texture_entry: Vec::new(),
            }],
        };
        let mut buf = BytesMut::new();
        update.encode_body(&mut buf).unwrap();
        // handle + dilation + count + data length, then the local id
        assert_eq!(&buf[12..16], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(buf.len(), OBJECT_UPDATE_HEADER_LEN + update.objects[0].encoded_len());
        assert_eq!(round_trip(&update), update);
    }

    #[test]
    fn test_instant_message_dialog_offset() {
        let im = ImprovedInstantMessage {
            dialog: 19,
            message: "hi".into(),
            ..Default::default()
        };
        let mut buf = BytesMut::new();
        im.encode_body(&mut buf).unwrap();
        assert_eq!(buf[ImprovedInstantMessage::DIALOG_OFFSET], 19);
        assert_eq!(round_trip(&im).message, "hi");
    }

    #[test]
    fn test_method_name_peek() {
        let msg = GenericMessage(MethodCall {
            method: "autopilot".into(),
            params: vec![to_variable("1"), to_variable("2")],
            ..Default::default()
        });
        let mut buf = BytesMut::new();
        msg.encode_body(&mut buf).unwrap();
        assert_eq!(MethodCall::peek_method(&buf).unwrap(), "autopilot");
        assert_eq!(round_trip(&msg).0.param_strings(), vec!["1", "2"]);
    }

    #[test]
    fn test_logout_reply_always_carries_a_block() {
        let reply = LogoutReply::default();
        assert!(round_trip(&reply).item_ids.is_empty());
    }

    #[test]
    fn test_region_handshake_round_trip() {
        let handshake = RegionHandshake {
            sim_name: "Test Region".into(),
            region_id: Uuid::from_u128(99),
            water_height: 20.0,
            ..Default::default()
        };
        assert_eq!(round_trip(&handshake), handshake);
    }
}
