//! Outbound priority lanes
//!
//! Every lane has its own FIFO and its own count of reliable packets that are
//! in flight. A lane whose in-flight count reaches the congestion cap is skipped
//! by the transmit loop until acknowledgements bring it back under the cap.

use crate::networking::packets::{OutgoingMessage, PacketFrequency};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

pub const LANE_COUNT: usize = 10;

/// Lanes in drain priority order, highest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OutboundLane {
    High,
    Medium,
    Low,
    Object,
    TextureStart,
    Texture,
    Asset,
    LandLayer,
    WindLayer,
    GenericLayer,
}

impl OutboundLane {
    pub const ALL: [OutboundLane; LANE_COUNT] = [
        OutboundLane::High,
        OutboundLane::Medium,
        OutboundLane::Low,
        OutboundLane::Object,
        OutboundLane::TextureStart,
        OutboundLane::Texture,
        OutboundLane::Asset,
        OutboundLane::LandLayer,
        OutboundLane::WindLayer,
        OutboundLane::GenericLayer,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Lane for messages that carry no explicit tag
    pub fn for_frequency(frequency: PacketFrequency) -> Self {
        match frequency {
            PacketFrequency::High | PacketFrequency::Fixed => OutboundLane::High,
            PacketFrequency::Medium => OutboundLane::Medium,
            PacketFrequency::Low => OutboundLane::Low,
        }
    }
}

impl fmt::Display for OutboundLane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Per-lane FIFOs, owned by the transmit loop
#[derive(Debug, Default)]
pub(crate) struct LaneQueues {
    queues: [VecDeque<OutgoingMessage>; LANE_COUNT],
}

impl LaneQueues {
    pub fn push(&mut self, message: OutgoingMessage) {
        let lane = message.lane();
        self.queues[lane.index()].push_back(message);
    }

    pub fn pop(&mut self, lane: OutboundLane) -> Option<OutgoingMessage> {
        self.queues[lane.index()].pop_front()
    }

    pub fn len(&self, lane: OutboundLane) -> usize {
        self.queues[lane.index()].len()
    }

    /// Remove every queued message, in lane order
    pub fn drain_all(&mut self) -> Vec<OutgoingMessage> {
        self.queues.iter_mut().flat_map(|queue| queue.drain(..)).collect()
    }
}

/// Reliable packets currently awaiting an ack, per lane
#[derive(Debug, Default)]
pub(crate) struct InFlight {
    counts: [AtomicUsize; LANE_COUNT],
}

impl InFlight {
    pub fn get(&self, lane: OutboundLane) -> usize {
        self.counts[lane.index()].load(Ordering::Acquire)
    }

    pub fn increment(&self, lane: OutboundLane) {
        self.counts[lane.index()].fetch_add(1, Ordering::AcqRel);
    }

    pub fn decrement(&self, lane: OutboundLane) {
        let _ = self.counts[lane.index()].fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
            Some(n.saturating_sub(1))
        });
    }

    pub fn reset(&self) {
        for count in &self.counts {
            count.store(0, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::networking::packets::{ChatFromViewer, KillObject, StartPingCheck};

    #[test]
    fn test_priority_order_matches_index() {
        for (i, lane) in OutboundLane::ALL.iter().enumerate() {
            assert_eq!(lane.index(), i);
        }
        assert!(OutboundLane::High < OutboundLane::Object);
    }

    #[test]
    fn test_queues_are_fifo_per_lane() {
        let mut queues = LaneQueues::default();
        queues.push(OutgoingMessage::new(KillObject { ids: vec![1] }));
        queues.push(OutgoingMessage::new(ChatFromViewer::default()));
        queues.push(OutgoingMessage::new(KillObject { ids: vec![2] }));
        queues.push(OutgoingMessage::new(StartPingCheck::default()));

        assert_eq!(queues.len(OutboundLane::Object), 2);
        assert_eq!(queues.len(OutboundLane::Low), 1);
        assert_eq!(queues.len(OutboundLane::High), 1);

        let drained = queues.drain_all();
        let names: Vec<_> = drained.iter().map(|m| m.name()).collect();
        assert_eq!(names, vec!["StartPingCheck", "ChatFromViewer", "KillObject", "KillObject"]);
        assert!(queues.drain_all().is_empty());
    }

    #[test]
    fn test_in_flight_never_underflows() {
        let in_flight = InFlight::default();
        in_flight.decrement(OutboundLane::Texture);
        assert_eq!(in_flight.get(OutboundLane::Texture), 0);
        in_flight.increment(OutboundLane::Texture);
        in_flight.increment(OutboundLane::Texture);
        in_flight.decrement(OutboundLane::Texture);
        assert_eq!(in_flight.get(OutboundLane::Texture), 1);
        in_flight.reset();
        assert_eq!(in_flight.get(OutboundLane::Texture), 0);
    }
}
