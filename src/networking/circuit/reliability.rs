//! Acknowledgement and retransmission bookkeeping for one circuit

use super::lanes::OutboundLane;
use crate::networking::packets::CompletionHandle;
use crate::networking::pool::PooledBuffer;
use crate::networking::serialization::PacketCodec;
use bytes::{Bytes, BytesMut};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::ops::{Deref, DerefMut};
use std::time::{Duration, Instant};

/// Serialized datagram kept for retransmission
#[derive(Debug)]
pub(crate) enum PacketData {
    Owned(BytesMut),
    Pooled(PooledBuffer),
}

impl Deref for PacketData {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            PacketData::Owned(data) => data,
            PacketData::Pooled(data) => data,
        }
    }
}

impl DerefMut for PacketData {
    fn deref_mut(&mut self) -> &mut [u8] {
        match self {
            PacketData::Owned(data) => data,
            PacketData::Pooled(data) => data,
        }
    }
}

/// A reliable packet waiting for its ack
#[derive(Debug)]
pub(crate) struct OutboundRecord {
    pub data: PacketData,
    pub lane: OutboundLane,
    pub last_sent: Instant,
    pub resends: u32,
    pub exhausted: bool,
    pub completion: Option<CompletionHandle>,
}

impl OutboundRecord {
    pub fn complete(mut self, success: bool) {
        if let Some(handle) = self.completion.take() {
            handle.fire(success);
        }
    }
}

/// Outcome of one retransmission scan
#[derive(Debug, Default)]
pub(crate) struct ResendScan {
    pub datagrams: Vec<Bytes>,
    /// (sequence, resends) of records that just ran out of retries
    pub exhausted: Vec<(u32, u32)>,
}

/// Unacknowledged reliable packets ordered by sequence number
#[derive(Debug, Default)]
pub(crate) struct UnackedTable {
    records: BTreeMap<u32, OutboundRecord>,
    bytes: usize,
}

impl UnackedTable {
    pub fn insert(&mut self, sequence: u32, record: OutboundRecord) {
        self.bytes += record.data.len();
        if let Some(old) = self.records.insert(sequence, record) {
            self.bytes -= old.data.len();
        }
    }

    pub fn remove(&mut self, sequence: u32) -> Option<OutboundRecord> {
        let record = self.records.remove(&sequence)?;
        self.bytes -= record.data.len();
        Some(record)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn oldest(&self) -> Option<u32> {
        self.records.keys().next().copied()
    }

    pub fn drain(&mut self) -> Vec<OutboundRecord> {
        self.bytes = 0;
        std::mem::take(&mut self.records).into_values().collect()
    }

    /// Mark every record idle for `timeout` as resent and hand back its bytes.
    /// Records that already used up `max_resends` stay put until the circuit dies.
    pub fn collect_resends(&mut self, now: Instant, timeout: Duration, max_resends: u32) -> ResendScan {
        let mut scan = ResendScan::default();
        for (sequence, record) in self.records.iter_mut() {
            if now.saturating_duration_since(record.last_sent) < timeout {
                continue;
            }
            if record.resends >= max_resends {
                if !record.exhausted {
                    record.exhausted = true;
                    scan.exhausted.push((*sequence, record.resends));
                }
                continue;
            }
            record.resends += 1;
            record.last_sent = now;
            PacketCodec::mark_resent(&mut record.data);
            scan.datagrams.push(Bytes::copy_from_slice(&record.data));
        }
        scan
    }
}

/// Recently seen reliable sequence numbers, for duplicate suppression
#[derive(Debug)]
pub(crate) struct DuplicateWindow {
    order: VecDeque<u32>,
    seen: HashSet<u32>,
    capacity: usize,
}

impl DuplicateWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Returns false if the sequence was already inside the window
    pub fn insert(&mut self, sequence: u32) -> bool {
        if !self.seen.insert(sequence) {
            return false;
        }
        self.order.push_back(sequence);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }
}

/// Lock-free FIFO of inbound sequence numbers we still owe an ack for
#[derive(Debug)]
pub(crate) struct AckQueue {
    tx: Sender<u32>,
    rx: Receiver<u32>,
}

impl AckQueue {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    pub fn push(&self, sequence: u32) {
        // Both ends live in self, so the channel cannot be disconnected
        let _ = self.tx.send(sequence);
    }

    pub fn take(&self, max: usize) -> Vec<u32> {
        self.rx.try_iter().take(max).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }
}

/// Single outstanding ping and the latency it last measured
#[derive(Debug, Default)]
pub(crate) struct PingTracker {
    next_id: u8,
    outstanding: Option<(u8, Instant)>,
    latency: Option<Duration>,
}

impl PingTracker {
    /// Allocate the next ping id, unless one is still unanswered.
    /// A ping unanswered for `give_up` is forgotten.
    pub fn start(&mut self, now: Instant, give_up: Duration) -> Option<u8> {
        if let Some((_, sent)) = self.outstanding {
            if now.saturating_duration_since(sent) < give_up {
                return None;
            }
        }
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.outstanding = Some((id, now));
        Some(id)
    }

    /// Half the round trip of a matching echo
    pub fn complete(&mut self, id: u8, now: Instant) -> Option<Duration> {
        match self.outstanding {
            Some((expected, sent)) if expected == id => {
                self.outstanding = None;
                let latency = now.saturating_duration_since(sent) / 2;
                self.latency = Some(latency);
                Some(latency)
            }
            _ => None,
        }
    }

    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }
}
