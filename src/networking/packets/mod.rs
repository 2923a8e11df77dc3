//! LLUDP message definitions
//!
//! Every message type declares its number, frequency band, default reliability,
//! zerocoding, whether it only travels over the event queue, and the outbound
//! lane it is classified into unless a sender tags it explicitly.

use crate::networking::circuit::lanes::OutboundLane;
use crate::networking::serialization::PacketBuffer;
use crate::networking::NetworkResult;
use bytes::BytesMut;
use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

pub mod generated;
pub mod types;

// Re-export all generated packets
pub use generated::*;
pub use types::*;

/// Packet frequency determines the message number encoding size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PacketFrequency {
    /// One byte message number
    High = 0,
    /// `0xFF` + one byte
    Medium = 1,
    /// `0xFF 0xFF` + two bytes
    Low = 2,
    /// `0xFF 0xFF 0xFF` + one byte
    Fixed = 3,
}

/// Message number together with its frequency band
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId {
    pub frequency: PacketFrequency,
    pub number: u16,
}

impl MessageId {
    pub const fn new(frequency: PacketFrequency, number: u16) -> Self {
        Self { frequency, number }
    }

    /// Name of the message if it is one this crate knows
    pub fn name(&self) -> &'static str {
        lookup(*self).map(|info| info.name).unwrap_or("Unknown")
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {}", self.frequency, self.number)
    }
}

/// Core trait implemented by every protocol message
pub trait Packet: fmt::Debug + Send + Sync + Sized + 'static {
    /// Message number within its frequency band
    const ID: u16;

    const FREQUENCY: PacketFrequency;

    /// Whether this message is sent reliably by default
    const RELIABLE: bool;

    const ZEROCODED: bool;

    /// Only deliverable over the event queue, never raw UDP
    const EVENT_QUEUE: bool = false;

    /// Lane override; frequency decides otherwise
    const LANE: Option<OutboundLane> = None;

    fn name() -> &'static str;

    fn encode_body(&self, buf: &mut BytesMut) -> NetworkResult<()>;

    fn decode_body(buf: &mut PacketBuffer<'_>) -> NetworkResult<Self>;

    fn message_id() -> MessageId {
        MessageId::new(Self::FREQUENCY, Self::ID)
    }

    fn default_lane() -> OutboundLane {
        Self::LANE.unwrap_or_else(|| OutboundLane::for_frequency(Self::FREQUENCY))
    }
}

/// Object-safe view of a message body, serialized lazily by the transmit loop
pub trait MessageBody: fmt::Debug + Send + Sync {
    fn body_id(&self) -> MessageId;
    fn body_name(&self) -> &'static str;
    fn body_zerocoded(&self) -> bool;
    fn encode(&self, buf: &mut BytesMut) -> NetworkResult<()>;
}

impl<P: Packet> MessageBody for P {
    fn body_id(&self) -> MessageId {
        <P as Packet>::message_id()
    }

    fn body_name(&self) -> &'static str {
        <P as Packet>::name()
    }

    fn body_zerocoded(&self) -> bool {
        P::ZEROCODED
    }

    fn encode(&self, buf: &mut BytesMut) -> NetworkResult<()> {
        self.encode_body(buf)
    }
}

/// Send-completion callback that fires exactly once.
///
/// `true` means acknowledged (or handed to the socket for unreliable traffic).
/// Dropping a handle that never fired reports `false`.
pub struct CompletionHandle {
    callback: Option<Box<dyn FnOnce(bool) + Send>>,
}

impl CompletionHandle {
    pub fn new(callback: impl FnOnce(bool) + Send + 'static) -> Self {
        Self {
            callback: Some(Box::new(callback)),
        }
    }

    pub fn fire(mut self, success: bool) {
        if let Some(callback) = self.callback.take() {
            callback(success);
        }
    }
}

impl Drop for CompletionHandle {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            callback(false);
        }
    }
}

impl fmt::Debug for CompletionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionHandle")
            .field("pending", &self.callback.is_some())
            .finish()
    }
}

/// A message on its way out through a circuit
#[derive(Debug)]
pub struct OutgoingMessage {
    body: Box<dyn MessageBody>,
    reliable: bool,
    event_queue: bool,
    default_lane: OutboundLane,
    lane: Option<OutboundLane>,
    completion: Option<CompletionHandle>,
}

impl OutgoingMessage {
    pub fn new<P: Packet>(packet: P) -> Self {
        Self {
            body: Box::new(packet),
            reliable: P::RELIABLE,
            event_queue: P::EVENT_QUEUE,
            default_lane: P::default_lane(),
            lane: None,
            completion: None,
        }
    }

    /// Override the type's default reliability
    pub fn reliable(mut self, reliable: bool) -> Self {
        self.reliable = reliable;
        self
    }

    /// Tag the message with an explicit outbound lane
    pub fn with_lane(mut self, lane: OutboundLane) -> Self {
        self.lane = Some(lane);
        self
    }

    pub fn on_complete(mut self, callback: impl FnOnce(bool) + Send + 'static) -> Self {
        self.completion = Some(CompletionHandle::new(callback));
        self
    }

    pub fn is_reliable(&self) -> bool {
        self.reliable
    }

    pub fn is_event_queue(&self) -> bool {
        self.event_queue
    }

    /// The lane this message is classified into
    pub fn lane(&self) -> OutboundLane {
        self.lane.unwrap_or(self.default_lane)
    }

    pub fn message_id(&self) -> MessageId {
        self.body.body_id()
    }

    pub fn name(&self) -> &'static str {
        self.body.body_name()
    }

    pub fn zerocoded(&self) -> bool {
        self.body.body_zerocoded()
    }

    pub fn encode_body(&self, buf: &mut BytesMut) -> NetworkResult<()> {
        self.body.encode(buf)
    }

    pub(crate) fn take_completion(&mut self) -> Option<CompletionHandle> {
        self.completion.take()
    }

    /// Report the outcome now, consuming the message
    pub fn complete(mut self, success: bool) {
        if let Some(handle) = self.completion.take() {
            handle.fire(success);
        }
    }
}

/// Static description of a known message
#[derive(Debug, Clone)]
pub struct PacketInfo {
    pub name: &'static str,
    pub id: MessageId,
    pub reliable: bool,
    pub zerocoded: bool,
    pub event_queue: bool,
}

static PACKET_REGISTRY: OnceLock<HashMap<MessageId, PacketInfo>> = OnceLock::new();

fn registry() -> &'static HashMap<MessageId, PacketInfo> {
    PACKET_REGISTRY.get_or_init(|| {
        let mut registry = HashMap::new();
        register_packet::<UseCircuitCode>(&mut registry);
        register_packet::<RegionHandshake>(&mut registry);
        register_packet::<RegionHandshakeReply>(&mut registry);
        register_packet::<CompleteAgentMovement>(&mut registry);
        register_packet::<PacketAck>(&mut registry);
        register_packet::<StartPingCheck>(&mut registry);
        register_packet::<CompletePingCheck>(&mut registry);
        register_packet::<CloseCircuit>(&mut registry);
        register_packet::<LogoutRequest>(&mut registry);
        register_packet::<LogoutReply>(&mut registry);
        register_packet::<ChatFromViewer>(&mut registry);
        register_packet::<ImprovedInstantMessage>(&mut registry);
        register_packet::<GenericMessage>(&mut registry);
        register_packet::<GodlikeMessage>(&mut registry);
        register_packet::<ObjectUpdate>(&mut registry);
        register_packet::<ImprovedTerseObjectUpdate>(&mut registry);
        register_packet::<KillObject>(&mut registry);
        register_packet::<ObjectProperties>(&mut registry);
        register_packet::<EnableSimulator>(&mut registry);
        register_packet::<DisableSimulator>(&mut registry);
        registry
    })
}

fn register_packet<P: Packet>(registry: &mut HashMap<MessageId, PacketInfo>) {
    let info = PacketInfo {
        name: P::name(),
        id: P::message_id(),
        reliable: P::RELIABLE,
        zerocoded: P::ZEROCODED,
        event_queue: P::EVENT_QUEUE,
    };
    registry.insert(info.id, info);
}

/// Look up packet information by message id
pub fn lookup(id: MessageId) -> Option<&'static PacketInfo> {
    registry().get(&id)
}
