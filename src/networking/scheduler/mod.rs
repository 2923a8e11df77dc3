//! Per-agent object update scheduling
//!
//! The scene reports object changes through [`ObjectUpdateScheduler::schedule_update`].
//! A dedicated thread drains the pending set periodically: kills are batched,
//! objects whose serial or selection changed get a full update, everything
//! else a terse one, and the blocks are packed into MTU-bounded messages that
//! go out on the object lane.

use crate::networking::circuit::{Circuit, OutboundLane};
use crate::networking::packets::{
    ImprovedTerseObjectUpdate, KillObject, ObjectProperties, ObjectPropertiesBlock, ObjectUpdate,
    ObjectUpdateBlock, OutgoingMessage, TerseUpdateBlock, OBJECT_UPDATE_HEADER_LEN,
};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, trace};
use uuid::Uuid;

mod packing;

use packing::{pack, pack_properties};

/// One object change relevant to this agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectUpdateRecord {
    pub local_id: u32,
    /// Bumped by the scene whenever the full state changes
    pub serial: u64,
    pub physical: bool,
    pub killed: bool,
    /// Selected by this circuit's agent
    pub selected: bool,
}

impl ObjectUpdateRecord {
    pub fn changed(local_id: u32, serial: u64) -> Self {
        Self {
            local_id,
            serial,
            physical: false,
            killed: false,
            selected: false,
        }
    }

    pub fn killed(local_id: u32) -> Self {
        Self {
            killed: true,
            ..Self::changed(local_id, 0)
        }
    }

    pub fn physical(mut self, physical: bool) -> Self {
        self.physical = physical;
        self
    }

    pub fn selected(mut self, selected: bool) -> Self {
        self.selected = selected;
        self
    }
}

/// Current object state, supplied by the scene
pub trait SceneObjects: Send + Sync {
    fn region_handle(&self) -> u64;

    fn time_dilation(&self) -> u16 {
        u16::MAX
    }

    fn full_update(&self, local_id: u32) -> Option<ObjectUpdateBlock>;

    fn terse_update(&self, local_id: u32) -> Option<TerseUpdateBlock>;

    fn properties(&self, local_id: u32) -> Option<ObjectPropertiesBlock>;

    /// Everything the agent should see on arrival
    fn visible_objects(&self, agent_id: Uuid) -> Vec<ObjectUpdateRecord>;
}

/// Scene without objects, for running the transport on its own
#[derive(Debug, Default)]
pub struct EmptyScene {
    pub region_handle: u64,
}

impl SceneObjects for EmptyScene {
    fn region_handle(&self) -> u64 {
        self.region_handle
    }

    fn full_update(&self, _local_id: u32) -> Option<ObjectUpdateBlock> {
        None
    }

    fn terse_update(&self, _local_id: u32) -> Option<TerseUpdateBlock> {
        None
    }

    fn properties(&self, _local_id: u32) -> Option<ObjectPropertiesBlock> {
        None
    }

    fn visible_objects(&self, _agent_id: Uuid) -> Vec<ObjectUpdateRecord> {
        Vec::new()
    }
}

/// Where scheduled updates go; a circuit in production
pub trait UpdateSink: Send + Sync {
    fn send_update(&self, message: OutgoingMessage);

    /// Queued plus in-flight packets on the object lane
    fn object_backlog(&self) -> usize;
}

impl UpdateSink for Circuit {
    fn send_update(&self, message: OutgoingMessage) {
        self.send_message(message);
    }

    fn object_backlog(&self) -> usize {
        self.lane_backlog(OutboundLane::Object)
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Body bytes per object packet
    pub mtu_budget: usize,
    pub kill_batch: usize,
    /// Object lane backlog at which a drain cycle is skipped
    pub congestion_cap: usize,
    pub drain_interval: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            mtu_budget: 1400,
            kill_batch: 250,
            congestion_cap: 100,
            drain_interval: Duration::from_millis(100),
        }
    }
}

/// What one drain cycle produced
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// The object lane was congested; nothing was taken
    pub skipped: bool,
    pub kill_packets: usize,
    pub full_packets: usize,
    pub terse_packets: usize,
    pub oversized: usize,
}

#[derive(Debug, Clone, Copy)]
struct PendingRecord {
    record: ObjectUpdateRecord,
    force_full: bool,
}

#[derive(Debug, Default)]
struct PendingUpdates {
    records: HashMap<u32, PendingRecord>,
    physical: VecDeque<u32>,
    other: VecDeque<u32>,
}

impl PendingUpdates {
    fn push(&mut self, record: ObjectUpdateRecord, force_full: bool) {
        match self.records.entry(record.local_id) {
            Entry::Occupied(mut entry) => {
                let force_full = force_full || entry.get().force_full;
                entry.insert(PendingRecord { record, force_full });
            }
            Entry::Vacant(entry) => {
                entry.insert(PendingRecord { record, force_full });
                if record.physical {
                    self.physical.push_back(record.local_id);
                } else {
                    self.other.push_back(record.local_id);
                }
            }
        }
    }

    fn take(&mut self, physical: bool) -> Vec<PendingRecord> {
        let order = if physical {
            std::mem::take(&mut self.physical)
        } else {
            std::mem::take(&mut self.other)
        };
        order
            .into_iter()
            .filter_map(|id| self.records.remove(&id))
            .collect()
    }

    fn len(&self) -> usize {
        self.records.len()
    }
}

/// What this agent was last sent
#[derive(Debug, Default)]
struct SentState {
    serials: HashMap<u32, u64>,
    selected: HashSet<u32>,
}

#[derive(Debug)]
enum Signal {
    Wake,
    Stop,
}

pub struct ObjectUpdateScheduler {
    agent_id: Uuid,
    scene: Arc<dyn SceneObjects>,
    options: SchedulerOptions,
    pending: Mutex<PendingUpdates>,
    sent: Mutex<SentState>,
    signal_tx: Sender<Signal>,
    signal_rx: Receiver<Signal>,
    stopped: AtomicBool,
}

impl std::fmt::Debug for ObjectUpdateScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectUpdateScheduler")
            .field("agent_id", &self.agent_id)
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}

impl ObjectUpdateScheduler {
    pub fn new(agent_id: Uuid, scene: Arc<dyn SceneObjects>, options: SchedulerOptions) -> Self {
        let (signal_tx, signal_rx) = unbounded();
        Self {
            agent_id,
            scene,
            options,
            pending: Mutex::new(PendingUpdates::default()),
            sent: Mutex::new(SentState::default()),
            signal_tx,
            signal_rx,
            stopped: AtomicBool::new(false),
        }
    }

    /// Queue an object change; a newer record for the same object replaces the older one
    pub fn schedule_update(&self, record: ObjectUpdateRecord) {
        self.pending.lock().push(record, false);
    }

    /// Queue a full update of everything visible to the agent
    pub fn schedule_first_update(&self) {
        let visible = self.scene.visible_objects(self.agent_id);
        debug!("First update for agent {}: {} objects", self.agent_id, visible.len());
        {
            let mut pending = self.pending.lock();
            for record in visible {
                pending.push(record, true);
            }
        }
        let _ = self.signal_tx.send(Signal::Wake);
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        let _ = self.signal_tx.send(Signal::Stop);
    }

    /// Drain loop; runs on the scheduler thread until stopped
    pub fn run(&self, sink: Arc<dyn UpdateSink>) {
        debug!("Object update loop started for agent {}", self.agent_id);
        while !self.stopped.load(Ordering::Acquire) {
            match self.signal_rx.recv_timeout(self.options.drain_interval) {
                Ok(Signal::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                Ok(Signal::Wake) | Err(RecvTimeoutError::Timeout) => {}
            }
            if self.stopped.load(Ordering::Acquire) {
                break;
            }
            if panic::catch_unwind(AssertUnwindSafe(|| self.drain(&sink))).is_err() {
                error!("Object update drain panicked for agent {}", self.agent_id);
            }
        }
        debug!("Object update loop stopped for agent {}", self.agent_id);
    }

    /// Turn pending records into messages on `sink`
    pub fn drain(&self, sink: &Arc<dyn UpdateSink>) -> DrainReport {
        let mut report = DrainReport::default();
        let backlog = sink.object_backlog();
        if backlog >= self.options.congestion_cap {
            trace!("Object lane backlog {} for agent {}, holding updates", backlog, self.agent_id);
            report.skipped = true;
            return report;
        }

        let (physical, other) = {
            let mut pending = self.pending.lock();
            (pending.take(true), pending.take(false))
        };
        if physical.is_empty() && other.is_empty() {
            return report;
        }

        let mut kills = Vec::new();
        let mut sent = self.sent.lock();
        for (is_physical, batch) in [(true, physical), (false, other)] {
            let mut fulls = Vec::new();
            let mut terses = Vec::new();
            for PendingRecord { record, force_full } in batch {
                let id = record.local_id;
                if record.killed {
                    kills.push(id);
                    sent.serials.remove(&id);
                    sent.selected.remove(&id);
                    continue;
                }

                let was_selected = sent.selected.contains(&id);
                let selection_changed = record.selected != was_selected;
                let serial_changed = sent.serials.get(&id) != Some(&record.serial);

                if force_full || serial_changed || selection_changed {
                    let Some(block) = self.scene.full_update(id) else {
                        debug!("Object {} vanished before its update", id);
                        continue;
                    };
                    sent.serials.insert(id, record.serial);
                    if record.selected {
                        sent.selected.insert(id);
                    } else {
                        sent.selected.remove(&id);
                    }
                    let properties = if record.selected && !was_selected {
                        self.scene.properties(id)
                    } else {
                        None
                    };
                    fulls.push((block, properties));
                } else if let Some(block) = self.scene.terse_update(id) {
                    terses.push((block, ()));
                }
            }
            self.send_full_updates(sink, fulls, &mut report);
            self.send_terse_updates(sink, terses, is_physical, &mut report);
        }
        drop(sent);

        for ids in kills.chunks(self.options.kill_batch.max(1)) {
            sink.send_update(OutgoingMessage::new(KillObject { ids: ids.to_vec() }));
            report.kill_packets += 1;
        }
        report
    }

    fn send_full_updates(
        &self,
        sink: &Arc<dyn UpdateSink>,
        fulls: Vec<(ObjectUpdateBlock, Option<ObjectPropertiesBlock>)>,
        report: &mut DrainReport,
    ) {
        let (batches, oversized) = pack(fulls, OBJECT_UPDATE_HEADER_LEN, self.options.mtu_budget, "ObjectUpdate");
        report.oversized += oversized;
        for batch in batches {
            let (objects, properties): (Vec<_>, Vec<_>) = batch.into_iter().unzip();
            let properties: Vec<_> = properties.into_iter().flatten().collect();
            let mut message = OutgoingMessage::new(ObjectUpdate {
                region_handle: self.scene.region_handle(),
                time_dilation: self.scene.time_dilation(),
                objects,
            });
            if !properties.is_empty() {
                // Properties must never reach the viewer before their object
                let sink = Arc::clone(sink);
                let budget = self.options.mtu_budget;
                message = message.on_complete(move |delivered| {
                    if !delivered {
                        return;
                    }
                    for objects in pack_properties(properties, budget) {
                        sink.send_update(OutgoingMessage::new(ObjectProperties { objects }));
                    }
                });
            }
            sink.send_update(message);
            report.full_packets += 1;
        }
    }

    fn send_terse_updates(
        &self,
        sink: &Arc<dyn UpdateSink>,
        terses: Vec<(TerseUpdateBlock, ())>,
        physical: bool,
        report: &mut DrainReport,
    ) {
        let (batches, oversized) = pack(
            terses,
            OBJECT_UPDATE_HEADER_LEN,
            self.options.mtu_budget,
            "ImprovedTerseObjectUpdate",
        );
        report.oversized += oversized;
        for batch in batches {
            let update = ImprovedTerseObjectUpdate {
                region_handle: self.scene.region_handle(),
                time_dilation: self.scene.time_dilation(),
                objects: batch.into_iter().map(|(block, _)| block).collect(),
            };
            // Physical motion goes unreliable
            sink.send_update(OutgoingMessage::new(update).reliable(!physical));
            report.terse_packets += 1;
        }
    }
}
