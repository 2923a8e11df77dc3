//! Circuit engine for LLUDP connections
//!
//! Each circuit is one logical connection to a viewer or a neighbouring
//! simulator, handling sequence numbering, acknowledgement, retransmission,
//! ping measurement, priority lanes and termination.
//!
//! Everything time-dependent takes an explicit `Instant`. The transmit loop
//! passes `Instant::now()`; tests pass whatever clock they need.

use crate::networking::handlers::{Dispatch, DispatchTable};
use crate::networking::packets::{
    CloseCircuit, CompleteAgentMovement, CompletePingCheck, LogoutReply, LogoutRequest, MessageId,
    OutgoingMessage, Packet, PacketAck, RegionHandshakeReply, StartPingCheck, UseCircuitCode,
};
use crate::networking::pool::BufferPool;
use crate::networking::serialization::{DecodedPacket, PacketCodec, MAX_APPENDED_ACKS};
use crate::networking::{NetworkError, NetworkResult};
use bytes::{Bytes, BytesMut};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub mod lanes;
mod reliability;
pub mod role;

pub use lanes::OutboundLane;
pub use role::{AgentCircuit, CircuitRole, SimulatorCircuit};

use lanes::{InFlight, LaneQueues};
use reliability::{AckQueue, DuplicateWindow, OutboundRecord, PacketData, PingTracker, UnackedTable};

/// Messages acknowledged the moment they arrive instead of through the ack queue
const IMMEDIATE_ACK: [MessageId; 4] = [
    MessageId::new(UseCircuitCode::FREQUENCY, UseCircuitCode::ID),
    MessageId::new(CompleteAgentMovement::FREQUENCY, CompleteAgentMovement::ID),
    MessageId::new(LogoutRequest::FREQUENCY, LogoutRequest::ID),
    MessageId::new(RegionHandshakeReply::FREQUENCY, RegionHandshakeReply::ID),
];

/// Tunables for one circuit
#[derive(Debug, Clone)]
pub struct CircuitOptions {
    /// Reliable packets a lane may have in flight before it is skipped
    pub congestion_cap: usize,
    /// Datagram size appended acks may grow a packet to
    pub datagram_budget: usize,
    pub resend_timeout: Duration,
    pub max_resends: u32,
    /// Statistics and retransmission scan period
    pub housekeeping_interval: Duration,
    pub ping_interval: Duration,
    /// An unanswered ping is forgotten after this long
    pub ping_give_up: Duration,
    pub receive_timeout: Duration,
    pub logout_timeout: Duration,
    /// How long the transmit loop sleeps with nothing to send
    pub idle_wait: Duration,
    pub duplicate_window: usize,
}

impl Default for CircuitOptions {
    fn default() -> Self {
        Self {
            congestion_cap: 100,
            datagram_budget: 1500,
            resend_timeout: Duration::from_secs(3),
            max_resends: 3,
            housekeeping_interval: Duration::from_secs(1),
            ping_interval: Duration::from_secs(5),
            ping_give_up: Duration::from_secs(30),
            receive_timeout: Duration::from_secs(60),
            logout_timeout: Duration::from_secs(10),
            idle_wait: Duration::from_secs(1),
            duplicate_window: 256,
        }
    }
}

/// Who is expected on the other end of a circuit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitIdentity {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    /// Address the handshake must come from, if pinned
    pub expected_address: Option<IpAddr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitKind {
    /// Viewer-facing circuit
    Agent,
    /// Neighbouring simulator
    Simulator,
}

/// Circuit state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Created,
    Running,
    Closing,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Stopped locally
    Stopped,
    /// Nothing heard from the peer within the receive timeout
    TimedOut,
    /// The logout reply was acknowledged
    LoggedOut,
    /// The logout reply was never acknowledged
    LogoutTimeout,
    ClosedByPeer,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TerminationReason::Stopped => "stopped",
            TerminationReason::TimedOut => "timed out",
            TerminationReason::LoggedOut => "logged out",
            TerminationReason::LogoutTimeout => "logout reply unacknowledged",
            TerminationReason::ClosedByPeer => "closed by peer",
        };
        f.write_str(text)
    }
}

/// Per-lane queue depth and in-flight count
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaneStats {
    pub lane: OutboundLane,
    pub queued: usize,
    pub in_flight: usize,
}

/// Point-in-time statistics for telemetry
#[derive(Debug, Clone)]
pub struct CircuitStats {
    pub code: u32,
    pub state: CircuitState,
    pub packets_in: u64,
    pub packets_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub resends: u64,
    pub unacked_packets: usize,
    pub unacked_bytes: usize,
    pub pending_acks: usize,
    pub latency: Option<Duration>,
    pub lanes: Vec<LaneStats>,
}

#[derive(Debug)]
enum TransmitCommand {
    Send(OutgoingMessage),
    Wake,
    Stop,
}

#[derive(Debug, Default)]
struct Counters {
    packets_in: AtomicU64,
    packets_out: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    resends: AtomicU64,
}

#[derive(Debug)]
struct Timers {
    next_housekeeping: Instant,
    next_ping: Instant,
}

#[derive(Debug, Default)]
struct LogoutState {
    requested: bool,
    sequence: Option<u32>,
    sent_at: Option<Instant>,
}

type TerminateCallback = Box<dyn FnOnce(TerminationReason) + Send>;

/// One logical connection sharing the simulator's UDP socket
pub struct Circuit {
    code: u32,
    identity: CircuitIdentity,
    options: CircuitOptions,
    role: Box<dyn CircuitRole>,
    dispatch: DispatchTable,

    endpoint: RwLock<Option<SocketAddr>>,
    state: RwLock<CircuitState>,
    reason: OnceLock<TerminationReason>,
    subscribers: Mutex<Vec<TerminateCallback>>,

    next_sequence: AtomicU32,
    commands_tx: Sender<TransmitCommand>,
    commands_rx: Receiver<TransmitCommand>,
    wake_pending: AtomicBool,
    lanes: Mutex<LaneQueues>,
    in_flight: InFlight,
    unacked: Mutex<UnackedTable>,
    acks: AckQueue,
    received: Mutex<DuplicateWindow>,
    ping: Mutex<PingTracker>,
    last_received: Mutex<Instant>,
    timers: Mutex<Timers>,
    logout: Mutex<LogoutState>,
    counters: Counters,

    /// Channel for sending datagrams to the transport
    outbound: mpsc::UnboundedSender<(Bytes, SocketAddr)>,
    pool: Arc<BufferPool>,
    transmit_thread: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Circuit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Circuit")
            .field("code", &self.code)
            .field("kind", &self.role.kind())
            .field("endpoint", &*self.endpoint.read())
            .field("state", &*self.state.read())
            .finish()
    }
}

impl Circuit {
    pub fn new(
        code: u32,
        identity: CircuitIdentity,
        role: Box<dyn CircuitRole>,
        options: CircuitOptions,
        outbound: mpsc::UnboundedSender<(Bytes, SocketAddr)>,
        pool: Arc<BufferPool>,
    ) -> Arc<Self> {
        let now = Instant::now();
        let dispatch = role.register_handlers(DispatchTable::builder()).build();
        let (commands_tx, commands_rx) = unbounded();
        Arc::new(Self {
            code,
            identity,
            received: Mutex::new(DuplicateWindow::new(options.duplicate_window)),
            timers: Mutex::new(Timers {
                next_housekeeping: now + options.housekeeping_interval,
                next_ping: now + options.ping_interval,
            }),
            options,
            role,
            dispatch,
            endpoint: RwLock::new(None),
            state: RwLock::new(CircuitState::Created),
            reason: OnceLock::new(),
            subscribers: Mutex::new(Vec::new()),
            next_sequence: AtomicU32::new(1),
            commands_tx,
            commands_rx,
            wake_pending: AtomicBool::new(false),
            lanes: Mutex::new(LaneQueues::default()),
            in_flight: InFlight::default(),
            unacked: Mutex::new(UnackedTable::default()),
            acks: AckQueue::new(),
            ping: Mutex::new(PingTracker::default()),
            last_received: Mutex::new(now),
            logout: Mutex::new(LogoutState::default()),
            counters: Counters::default(),
            outbound,
            pool,
            transmit_thread: Mutex::new(None),
        })
    }

    pub fn code(&self) -> u32 {
        self.code
    }

    pub fn kind(&self) -> CircuitKind {
        self.role.kind()
    }

    pub fn identity(&self) -> &CircuitIdentity {
        &self.identity
    }

    pub fn options(&self) -> &CircuitOptions {
        &self.options
    }

    pub fn endpoint(&self) -> Option<SocketAddr> {
        *self.endpoint.read()
    }

    /// Attach the remote endpoint learned from the handshake
    pub fn bind(&self, endpoint: SocketAddr) {
        *self.endpoint.write() = Some(endpoint);
    }

    pub fn state(&self) -> CircuitState {
        *self.state.read()
    }

    /// True once termination has begun
    pub fn is_closing(&self) -> bool {
        matches!(self.state(), CircuitState::Closing | CircuitState::Terminated)
    }

    pub fn termination_reason(&self) -> Option<TerminationReason> {
        self.reason.get().copied()
    }

    pub fn latency(&self) -> Option<Duration> {
        self.ping.lock().latency()
    }

    /// Spawn the transmit loop and the role's workers. Calling it again is a no-op.
    pub fn start(self: &Arc<Self>) -> NetworkResult<()> {
        {
            let mut state = self.state.write();
            if *state != CircuitState::Created {
                return Ok(());
            }
            *state = CircuitState::Running;
        }

        let circuit = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("circuit-{}", self.code))
            .spawn(move || circuit.run_transmit_loop())?;
        *self.transmit_thread.lock() = Some(handle);

        self.role.on_start(self)?;
        info!(
            "Circuit {} started ({:?}, endpoint {:?})",
            self.code,
            self.kind(),
            self.endpoint()
        );
        Ok(())
    }

    /// Terminate and wait for the worker threads to finish
    pub fn stop(&self) {
        self.terminate(TerminationReason::Stopped);

        let handle = self.transmit_thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                error!("Transmit thread of circuit {} panicked", self.code);
            }
        }
        self.role.join();
    }

    /// Subscribe to termination. Fires immediately if the circuit is already gone.
    pub fn on_terminate(&self, callback: impl FnOnce(TerminationReason) + Send + 'static) {
        let mut subscribers = self.subscribers.lock();
        if let Some(reason) = self.reason.get().copied() {
            drop(subscribers);
            callback(reason);
        } else {
            subscribers.push(Box::new(callback));
        }
    }

    /// Queue a message for transmission
    pub fn send_message(&self, mut message: OutgoingMessage) {
        if self.is_closing() && message.is_reliable() {
            debug!("Circuit {} closing, failing {}", self.code, message.name());
            message.complete(false);
            return;
        }

        if message.is_event_queue() {
            self.role.deliver_event_queue(message);
            return;
        }

        // Unreliable traffic counts as sent once it is handed over
        let handed_over = if message.is_reliable() {
            None
        } else {
            message.take_completion()
        };
        let _ = self.commands_tx.send(TransmitCommand::Send(message));
        if let Some(handle) = handed_over {
            handle.fire(true);
        }
    }

    pub fn send<P: Packet>(&self, packet: P) {
        self.send_message(OutgoingMessage::new(packet));
    }

    /// Send the logout reply whose ack ends this circuit
    pub fn send_logout_reply(&self, message: OutgoingMessage) {
        self.logout.lock().requested = true;
        self.send_message(message.with_lane(OutboundLane::High));
    }

    /// Queued plus in-flight packets on a lane
    pub fn lane_backlog(&self, lane: OutboundLane) -> usize {
        self.lanes.lock().len(lane) + self.in_flight.get(lane)
    }

    pub fn stats(&self) -> CircuitStats {
        let (unacked_packets, unacked_bytes) = {
            let table = self.unacked.lock();
            (table.len(), table.bytes())
        };
        let lanes = {
            let queues = self.lanes.lock();
            OutboundLane::ALL
                .iter()
                .map(|&lane| LaneStats {
                    lane,
                    queued: queues.len(lane),
                    in_flight: self.in_flight.get(lane),
                })
                .collect()
        };
        CircuitStats {
            code: self.code,
            state: self.state(),
            packets_in: self.counters.packets_in.load(Ordering::Relaxed),
            packets_out: self.counters.packets_out.load(Ordering::Relaxed),
            bytes_in: self.counters.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.counters.bytes_out.load(Ordering::Relaxed),
            resends: self.counters.resends.load(Ordering::Relaxed),
            unacked_packets,
            unacked_bytes,
            pending_acks: self.acks.len(),
            latency: self.latency(),
            lanes,
        }
    }

    /// Handle one inbound datagram addressed to this circuit
    pub fn packet_received(&self, source: SocketAddr, packet: DecodedPacket, now: Instant) {
        if self.is_closing() {
            return;
        }

        *self.last_received.lock() = now;
        self.counters.packets_in.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_in
            .fetch_add(packet.payload.len() as u64, Ordering::Relaxed);

        for ack in &packet.acks {
            self.acknowledge(*ack);
        }

        if packet.header.is_reliable() {
            let sequence = packet.header.sequence;
            let fresh = self.received.lock().insert(sequence);
            if IMMEDIATE_ACK.contains(&packet.message_id) {
                self.send_control(&PacketAck {
                    packets: vec![sequence],
                });
            } else {
                self.acks.push(sequence);
                self.wake();
            }
            if !fresh {
                debug!(
                    "Duplicate {} #{} on circuit {}",
                    packet.message_id.name(),
                    sequence,
                    self.code
                );
                return;
            }
        }

        if let Err(e) = self.handle_packet(source, &packet, now) {
            warn!(
                "Failed to handle {} on circuit {}: {}",
                packet.message_id.name(),
                self.code,
                e
            );
        }
    }

    fn handle_packet(&self, source: SocketAddr, packet: &DecodedPacket, now: Instant) -> NetworkResult<()> {
        let id = packet.message_id;
        if id == PacketAck::message_id() {
            let ack: PacketAck = packet.decode()?;
            for sequence in ack.packets {
                self.acknowledge(sequence);
            }
        } else if id == StartPingCheck::message_id() {
            let ping: StartPingCheck = packet.decode()?;
            self.send_control(&CompletePingCheck { ping_id: ping.ping_id });
        } else if id == CompletePingCheck::message_id() {
            let pong: CompletePingCheck = packet.decode()?;
            if let Some(latency) = self.ping.lock().complete(pong.ping_id, now) {
                debug!("Circuit {} latency {:?}", self.code, latency);
            }
        } else if id == CloseCircuit::message_id() {
            info!("Circuit {} closed by {}", self.code, source);
            self.terminate(TerminationReason::ClosedByPeer);
        } else if self.dispatch.dispatch(self, packet)? == Dispatch::Unhandled {
            debug!("Ignoring {} from {}", id.name(), source);
        }
        Ok(())
    }

    /// Retire an unacked record. Unknown sequence numbers are ignored.
    fn acknowledge(&self, sequence: u32) {
        let record = self.unacked.lock().remove(sequence);
        let Some(record) = record else {
            return;
        };
        self.in_flight.decrement(record.lane);
        record.complete(true);
        self.wake();

        let is_logout = self.logout.lock().sequence == Some(sequence);
        if is_logout {
            self.terminate(TerminationReason::LoggedOut);
        }
    }

    /// Begin termination. Only the first call has any effect.
    pub fn terminate(&self, reason: TerminationReason) {
        {
            let mut state = self.state.write();
            if matches!(*state, CircuitState::Closing | CircuitState::Terminated) {
                return;
            }
            *state = CircuitState::Closing;
        }

        match reason {
            TerminationReason::TimedOut | TerminationReason::LogoutTimeout => {
                warn!("Circuit {} terminating: {}", self.code, reason)
            }
            _ => info!("Circuit {} terminating: {}", self.code, reason),
        }

        let subscribers = {
            let mut subscribers = self.subscribers.lock();
            let _ = self.reason.set(reason);
            std::mem::take(&mut *subscribers)
        };
        for callback in subscribers {
            callback(reason);
        }

        let records = self.unacked.lock().drain();
        self.in_flight.reset();
        let failed = records.len();
        for record in records {
            record.complete(false);
        }
        let queued = self.lanes.lock().drain_all();
        for message in queued {
            message.complete(false);
        }
        self.fail_pending_commands();
        self.role.on_terminate();

        *self.state.write() = CircuitState::Terminated;
        let _ = self.commands_tx.send(TransmitCommand::Stop);
        debug!("Circuit {} failed {} unacked packets", self.code, failed);
    }

    fn wake(&self) {
        if !self.wake_pending.swap(true, Ordering::AcqRel) {
            let _ = self.commands_tx.send(TransmitCommand::Wake);
        }
    }

    fn run_transmit_loop(self: Arc<Self>) {
        debug!("Transmit loop started for circuit {}", self.code);
        loop {
            let wait = if self.has_sendable_work() {
                Duration::ZERO
            } else {
                self.options.idle_wait
            };
            match self.commands_rx.recv_timeout(wait) {
                Ok(command) => {
                    if !self.absorb(command) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            match panic::catch_unwind(AssertUnwindSafe(|| self.transmit_cycle(Instant::now()))) {
                Ok(true) => {}
                Ok(false) => break,
                Err(_) => error!("Transmit cycle panicked on circuit {}", self.code),
            }
        }
        self.fail_pending_commands();
        debug!("Transmit loop stopped for circuit {}", self.code);
    }

    /// One pass of the transmit loop. Returns false once the circuit is closing.
    pub fn transmit_cycle(&self, now: Instant) -> bool {
        if self.is_closing() {
            self.fail_pending_commands();
            return false;
        }
        while let Ok(command) = self.commands_rx.try_recv() {
            if !self.absorb(command) {
                return false;
            }
        }

        self.check_timeouts(now);
        if self.is_closing() {
            return false;
        }

        self.drain_lanes(now);
        self.flush_acks();
        self.housekeeping(now);
        !self.is_closing()
    }

    fn absorb(&self, command: TransmitCommand) -> bool {
        match command {
            TransmitCommand::Send(message) => {
                if self.is_closing() {
                    message.complete(false);
                } else {
                    self.lanes.lock().push(message);
                }
                true
            }
            TransmitCommand::Wake => {
                self.wake_pending.store(false, Ordering::Release);
                true
            }
            TransmitCommand::Stop => false,
        }
    }

    fn fail_pending_commands(&self) {
        for command in self.commands_rx.try_iter() {
            if let TransmitCommand::Send(message) = command {
                message.complete(false);
            }
        }
    }

    fn has_sendable_work(&self) -> bool {
        let lanes = self.lanes.lock();
        OutboundLane::ALL
            .iter()
            .any(|&lane| lanes.len(lane) > 0 && self.in_flight.get(lane) < self.options.congestion_cap)
    }

    /// Drain lanes in priority order until each is empty or at its cap
    fn drain_lanes(&self, now: Instant) -> usize {
        let mut sent = 0;
        loop {
            let mut progressed = false;
            for lane in OutboundLane::ALL {
                while self.in_flight.get(lane) < self.options.congestion_cap {
                    if self.is_closing() {
                        return sent;
                    }
                    let message = self.lanes.lock().pop(lane);
                    let Some(message) = message else {
                        break;
                    };
                    self.transmit_message(message, now);
                    sent += 1;
                    progressed = true;
                }
            }
            if !progressed {
                return sent;
            }
        }
    }

    fn transmit_message(&self, mut message: OutgoingMessage, now: Instant) {
        let lane = message.lane();
        let mut body = BytesMut::with_capacity(256);
        if let Err(e) = message.encode_body(&mut body) {
            warn!("Skipping {} on circuit {}: {}", message.name(), self.code, e);
            message.complete(false);
            return;
        }

        let sequence = self.next_sequence.fetch_add(1, Ordering::AcqRel);
        let reliable = message.is_reliable();
        let mut datagram =
            match PacketCodec::encode(message.message_id(), &body, sequence, reliable, message.zerocoded()) {
                Ok(datagram) => datagram,
                Err(e) => {
                    warn!("Skipping {} on circuit {}: {}", message.name(), self.code, e);
                    message.complete(false);
                    return;
                }
            };

        let room = PacketCodec::ack_capacity(datagram.len(), self.options.datagram_budget);
        if room > 0 && !self.acks.is_empty() {
            let acks = self.acks.take(room);
            PacketCodec::append_acks(&mut datagram, &acks);
        }

        if message.message_id() == LogoutReply::message_id() {
            let mut logout = self.logout.lock();
            if logout.requested && logout.sequence.is_none() {
                logout.sequence = Some(sequence);
                logout.sent_at = Some(now);
            }
        }

        if reliable {
            let data = if lane == OutboundLane::Object {
                let mut buffer = self.pool.acquire();
                buffer.fill(&datagram);
                PacketData::Pooled(buffer)
            } else {
                PacketData::Owned(datagram.clone())
            };
            let record = OutboundRecord {
                data,
                lane,
                last_sent: now,
                resends: 0,
                exhausted: false,
                completion: message.take_completion(),
            };
            // Termination drains the table under this lock after marking the circuit Closing
            let mut unacked = self.unacked.lock();
            if self.is_closing() {
                drop(unacked);
                record.complete(false);
                return;
            }
            unacked.insert(sequence, record);
            self.in_flight.increment(lane);
            self.emit(datagram.freeze());
            return;
        }

        let _guard = self.unacked.lock();
        if !self.is_closing() {
            self.emit(datagram.freeze());
        }
    }

    /// Frame and send an unreliable control packet right away, bypassing the lanes
    fn send_control<P: Packet>(&self, packet: &P) {
        let mut body = BytesMut::new();
        let framed = packet.encode_body(&mut body).and_then(|_| {
            let sequence = self.next_sequence.fetch_add(1, Ordering::AcqRel);
            PacketCodec::encode(P::message_id(), &body, sequence, false, P::ZEROCODED)
        });
        match framed {
            Ok(datagram) => self.emit(datagram.freeze()),
            Err(e) => warn!("Failed to send {} on circuit {}: {}", P::name(), self.code, e),
        }
    }

    fn emit(&self, datagram: Bytes) {
        let Some(endpoint) = self.endpoint() else {
            debug!("Circuit {} has no endpoint yet, dropping datagram", self.code);
            return;
        };
        let len = datagram.len() as u64;
        if self.outbound.send((datagram, endpoint)).is_err() {
            warn!("Transport gone, circuit {} cannot send", self.code);
            return;
        }
        self.counters.packets_out.fetch_add(1, Ordering::Relaxed);
        self.counters.bytes_out.fetch_add(len, Ordering::Relaxed);
    }

    /// Send whatever acks did not fit into outgoing packets
    fn flush_acks(&self) {
        while !self.acks.is_empty() {
            let packets = self.acks.take(MAX_APPENDED_ACKS);
            if packets.is_empty() {
                break;
            }
            self.send_control(&PacketAck { packets });
        }
    }

    fn housekeeping(&self, now: Instant) {
        let (stats_due, ping_due) = {
            let mut timers = self.timers.lock();
            let stats_due = now >= timers.next_housekeeping;
            if stats_due {
                timers.next_housekeeping = now + self.options.housekeeping_interval;
            }
            let ping_due = now >= timers.next_ping;
            if ping_due {
                timers.next_ping = now + self.options.ping_interval;
            }
            (stats_due, ping_due)
        };

        if stats_due {
            debug!("Circuit stats: {:?}", self.stats());
            self.resend_expired(now);
        }
        if ping_due {
            let ping_id = self.ping.lock().start(now, self.options.ping_give_up);
            if let Some(ping_id) = ping_id {
                let oldest_unacked = self.unacked.lock().oldest().unwrap_or(0);
                self.send_control(&StartPingCheck {
                    ping_id,
                    oldest_unacked,
                });
            }
        }
    }

    fn resend_expired(&self, now: Instant) {
        let scan = self
            .unacked
            .lock()
            .collect_resends(now, self.options.resend_timeout, self.options.max_resends);
        for (sequence, resends) in scan.exhausted {
            // Left for the receive timeout to clean up
            warn!(
                "Circuit {}: {}",
                self.code,
                NetworkError::RetransmitExhausted { sequence, resends }
            );
        }
        if !scan.datagrams.is_empty() {
            debug!("Circuit {} resending {} packets", self.code, scan.datagrams.len());
        }
        for datagram in scan.datagrams {
            self.counters.resends.fetch_add(1, Ordering::Relaxed);
            self.emit(datagram);
        }
    }

    fn check_timeouts(&self, now: Instant) {
        let silent = now.saturating_duration_since(*self.last_received.lock());
        if silent >= self.options.receive_timeout {
            warn!("{}", NetworkError::CircuitTimeout { code: self.code });
            self.terminate(TerminationReason::TimedOut);
            return;
        }

        let logout_sent = self.logout.lock().sent_at;
        if let Some(sent) = logout_sent {
            if now.saturating_duration_since(sent) >= self.options.logout_timeout {
                warn!("{}", NetworkError::LogoutTimeout { code: self.code });
                self.terminate(TerminationReason::LogoutTimeout);
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::networking::packets::{ChatFromViewer, KillObject, ObjectUpdate};

    type Outcomes = Arc<Mutex<Vec<(u32, bool)>>>;

    fn tracked(outcomes: &Outcomes, tag: u32, message: OutgoingMessage) -> OutgoingMessage {
        let outcomes = Arc::clone(outcomes);
        message.on_complete(move |ok| outcomes.lock().push((tag, ok)))
    }

    #[test]
    fn test_acks_complete_each_send_once() {
        let (circuit, mut rx) = circuit();
        let outcomes: Outcomes = Arc::default();
        for tag in 1..=5 {
            circuit.send_message(tracked(&outcomes, tag, OutgoingMessage::new(ChatFromViewer::default())));
        }
        let now = Instant::now();
        circuit.transmit_cycle(now);
        let sequences: Vec<u32> = sent(&mut rx).iter().map(|p| p.header.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3, 4, 5]);
        assert_eq!(circuit.stats().unacked_packets, 5);

        // Out of order, with a repeat and an unknown sequence
        circuit.packet_received(peer(), inbound(&PacketAck { packets: vec![4, 2] }, 1, false, &[5]), now);
        circuit.packet_received(peer(), inbound(&PacketAck { packets: vec![1, 3, 2, 99] }, 2, false, &[]), now);

        let mut seen = outcomes.lock().clone();
        seen.sort();
        assert_eq!(seen, vec![(1, true), (2, true), (3, true), (4, true), (5, true)]);
        assert_eq!(circuit.stats().unacked_packets, 0);
        assert_eq!(circuit.lane_backlog(OutboundLane::Low), 0);
    }

    #[test]
    fn test_message_popped_before_termination_is_not_sent() {
        let (circuit, mut rx) = circuit();
        let outcomes: Outcomes = Arc::default();
        let reliable = tracked(&outcomes, 1, OutgoingMessage::new(KillObject { ids: vec![7] }));
        let unreliable = OutgoingMessage::new(ChatFromViewer::default()).reliable(false);

        circuit.terminate(TerminationReason::Stopped);
        let now = Instant::now();
        circuit.transmit_message(reliable, now);
        circuit.transmit_message(unreliable, now);

        assert_eq!(*outcomes.lock(), vec![(1, false)]);
        assert!(sent(&mut rx).is_empty());
        assert_eq!(circuit.stats().unacked_packets, 0);
        assert_eq!(circuit.stats().lanes[OutboundLane::Object.index()].in_flight, 0);
    }

    #[test]
    fn test_scenario_partial_ack_then_silence() {
        let (circuit, mut rx) = circuit();
        let outcomes: Outcomes = Arc::default();
        for tag in 1..=3 {
            circuit.send_message(tracked(&outcomes, tag, OutgoingMessage::new(ChatFromViewer::default())));
        }
        let start = Instant::now();
        circuit.transmit_cycle(start);
        assert_eq!(sent(&mut rx).len(), 3);

        circuit.packet_received(peer(), inbound(&StartPingCheck::default(), 10, false, &[2]), start);
        assert_eq!(*outcomes.lock(), vec![(2, true)]);
        assert_eq!(circuit.stats().unacked_packets, 2);
        sent(&mut rx);

        assert!(!circuit.transmit_cycle(start + Duration::from_secs(61)));
        assert_eq!(circuit.state(), CircuitState::Terminated);
        assert_eq!(circuit.termination_reason(), Some(TerminationReason::TimedOut));

        let mut seen = outcomes.lock().clone();
        seen.sort();
        assert_eq!(seen, vec![(1, false), (2, true), (3, false)]);
        assert!(sent(&mut rx).is_empty());
    }

    #[test]
    fn test_congestion_cap_delays_but_never_drops() {
        let options = CircuitOptions {
            congestion_cap: 3,
            ..CircuitOptions::default()
        };
        let (circuit, mut rx) = circuit_with(Box::new(SimulatorCircuit::new()), options);
        for id in 0..10 {
            circuit.send(KillObject { ids: vec![id] });
        }
        let now = Instant::now();
        circuit.transmit_cycle(now);
        let first = sent(&mut rx);
        assert_eq!(first.len(), 3);
        assert_eq!(circuit.stats().lanes[OutboundLane::Object.index()].in_flight, 3);
        assert_eq!(circuit.lane_backlog(OutboundLane::Object), 10);

        let mut delivered = first.len();
        let mut sequences: Vec<u32> = first.iter().map(|p| p.header.sequence).collect();
        let mut inbound_seq = 100;
        while delivered < 10 {
            circuit.packet_received(peer(), inbound(&PacketAck { packets: sequences.clone() }, inbound_seq, false, &[]), now);
            inbound_seq += 1;
            circuit.transmit_cycle(now);
            let batch = sent(&mut rx);
            assert!(circuit.stats().lanes[OutboundLane::Object.index()].in_flight <= 3);
            sequences = batch.iter().map(|p| p.header.sequence).collect();
            delivered += batch.len();
        }
        assert_eq!(delivered, 10);
    }

    #[test]
    fn test_higher_lanes_drain_first() {
        let (circuit, mut rx) = circuit();
        circuit.send(KillObject { ids: vec![1] });
        circuit.send(ChatFromViewer::default());
        circuit.send(StartPingCheck::default());
        circuit.transmit_cycle(Instant::now());
        let names: Vec<_> = sent(&mut rx).iter().map(|p| p.message_id.name()).collect();
        assert_eq!(names, vec!["StartPingCheck", "ChatFromViewer", "KillObject"]);
    }

    #[test]
    fn test_retransmission_is_bounded() {
        let (circuit, mut rx) = circuit();
        let outcomes: Outcomes = Arc::default();
        circuit.send_message(tracked(&outcomes, 1, OutgoingMessage::new(ChatFromViewer::default())));
        let start = Instant::now();
        circuit.transmit_cycle(start);
        let original = sent(&mut rx);
        assert_eq!(original.len(), 1);
        let sequence = original[0].header.sequence;

        let mut resent = 0;
        for step in 1..=10u64 {
            // Keep the circuit alive while the packet goes unacked
            circuit.packet_received(peer(), inbound(&StartPingCheck::default(), 1000 + step as u32, false, &[]), start + Duration::from_secs(step * 4));
            circuit.transmit_cycle(start + Duration::from_secs(step * 4));
            resent += sent(&mut rx)
                .iter()
                .filter(|p| p.header.is_resent() && p.header.sequence == sequence)
                .count();
        }
        assert!(resent >= 1);
        assert_eq!(resent, circuit.options().max_resends as usize);
        // Exhaustion alone never fails the send
        assert!(outcomes.lock().is_empty());
        assert_eq!(circuit.stats().unacked_packets, 1);

        circuit.terminate(TerminationReason::Stopped);
        assert_eq!(*outcomes.lock(), vec![(1, false)]);
    }

    #[test]
    fn test_termination_fails_pending_and_stops_sending() {
        let (circuit, mut rx) = circuit();
        let outcomes: Outcomes = Arc::default();
        for tag in 1..=4 {
            circuit.send_message(tracked(&outcomes, tag, OutgoingMessage::new(ChatFromViewer::default())));
        }
        circuit.transmit_cycle(Instant::now());
        sent(&mut rx);
        // Queued but never transmitted
        circuit.send_message(tracked(&outcomes, 5, OutgoingMessage::new(ChatFromViewer::default())));

        let reasons = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&reasons);
        circuit.on_terminate(move |reason| seen.lock().push(reason));

        circuit.terminate(TerminationReason::Stopped);
        circuit.terminate(TerminationReason::TimedOut);
        assert_eq!(*reasons.lock(), vec![TerminationReason::Stopped]);

        let failures = outcomes.lock().iter().filter(|(_, ok)| !ok).count();
        assert_eq!(failures, 5);

        circuit.send_message(tracked(&outcomes, 6, OutgoingMessage::new(ChatFromViewer::default())));
        assert_eq!(outcomes.lock().last(), Some(&(6, false)));
        assert!(!circuit.transmit_cycle(Instant::now()));
        assert!(sent(&mut rx).is_empty());

        // Late subscribers still hear about it
        let late = Arc::clone(&reasons);
        circuit.on_terminate(move |reason| late.lock().push(reason));
        assert_eq!(reasons.lock().len(), 2);
    }

    #[test]
    fn test_unreliable_send_completes_on_handover() {
        let (circuit, _rx) = circuit();
        let outcomes: Outcomes = Arc::default();
        circuit.send_message(tracked(&outcomes, 1, OutgoingMessage::new(StartPingCheck::default())));
        assert_eq!(*outcomes.lock(), vec![(1, true)]);
    }

    #[test]
    fn test_acks_piggyback_then_flush() {
        let (circuit, mut rx) = circuit();
        let now = Instant::now();
        circuit.packet_received(peer(), inbound(&ChatFromViewer::default(), 40, true, &[]), now);
        circuit.packet_received(peer(), inbound(&ChatFromViewer::default(), 41, true, &[]), now);
        circuit.send(KillObject { ids: vec![1] });
        circuit.transmit_cycle(now);
        let packets = sent(&mut rx);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].acks, vec![40, 41]);

        circuit.packet_received(peer(), inbound(&ChatFromViewer::default(), 42, true, &[]), now);
        circuit.transmit_cycle(now);
        let packets = sent(&mut rx);
        assert_eq!(packets.len(), 1);
        let ack: PacketAck = packets[0].decode().unwrap();
        assert_eq!(ack.packets, vec![42]);
    }

    #[test]
    fn test_whitelisted_messages_ack_immediately_and_duplicates_are_dropped() {
        let (circuit, mut rx) = circuit();
        let now = Instant::now();
        let handshake = UseCircuitCode { code: 7, ..Default::default() };
        circuit.packet_received(peer(), inbound(&handshake, 3, true, &[]), now);
        let packets = sent(&mut rx);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].decode::<PacketAck>().unwrap().packets, vec![3]);

        // The repeat is acked again but not processed twice
        circuit.packet_received(peer(), inbound(&handshake, 3, true, &[]), now);
        assert_eq!(sent(&mut rx).len(), 1);
        assert_eq!(circuit.stats().packets_in, 2);
    }

    #[test]
    fn test_ping_round_trip() {
        let (circuit, mut rx) = circuit();
        let start = Instant::now();
        let probe_at = start + Duration::from_secs(5);
        circuit.transmit_cycle(probe_at);
        let ping = sent(&mut rx)
            .into_iter()
            .find(|p| p.is(StartPingCheck::message_id()))
            .unwrap();
        let ping: StartPingCheck = ping.decode().unwrap();

        circuit.packet_received(
            peer(),
            inbound(&CompletePingCheck { ping_id: ping.ping_id }, 9, false, &[]),
            probe_at + Duration::from_millis(300),
        );
        assert_eq!(circuit.latency(), Some(Duration::from_millis(150)));

        // And a peer's probe is echoed
        circuit.packet_received(peer(), inbound(&StartPingCheck { ping_id: 77, oldest_unacked: 0 }, 10, false, &[]), probe_at);
        let echo = sent(&mut rx);
        assert_eq!(echo[0].decode::<CompletePingCheck>().unwrap().ping_id, 77);
    }

    #[test]
    fn test_logout_reply_ack_terminates() {
        let (circuit, mut rx) = circuit();
        let now = Instant::now();
        circuit.send_logout_reply(OutgoingMessage::new(LogoutReply::default()));
        circuit.transmit_cycle(now);
        let reply = sent(&mut rx).remove(0);
        assert!(reply.is(LogoutReply::message_id()));

        circuit.packet_received(peer(), inbound(&PacketAck { packets: vec![reply.header.sequence] }, 5, false, &[]), now);
        assert_eq!(circuit.termination_reason(), Some(TerminationReason::LoggedOut));
    }

    #[test]
    fn test_unacked_logout_reply_times_out() {
        let (circuit, mut rx) = circuit();
        let now = Instant::now();
        circuit.send_logout_reply(OutgoingMessage::new(LogoutReply::default()));
        circuit.transmit_cycle(now);
        sent(&mut rx);
        circuit.packet_received(peer(), inbound(&StartPingCheck::default(), 1, false, &[]), now + Duration::from_secs(9));
        circuit.transmit_cycle(now + Duration::from_secs(9));
        assert!(!circuit.is_closing());
        circuit.transmit_cycle(now + Duration::from_secs(11));
        assert_eq!(circuit.termination_reason(), Some(TerminationReason::LogoutTimeout));
    }

    #[test]
    fn test_close_circuit_from_peer() {
        let (circuit, _rx) = circuit();
        circuit.packet_received(peer(), inbound(&CloseCircuit, 1, false, &[]), Instant::now());
        assert_eq!(circuit.termination_reason(), Some(TerminationReason::ClosedByPeer));
    }

    #[test]
    fn test_oversized_message_is_skipped() {
        let (circuit, mut rx) = circuit();
        let outcomes: Outcomes = Arc::default();
        let huge = ObjectUpdate {
            objects: (0..60)
                .map(|i| crate::networking::packets::ObjectUpdateBlock {
                    local_id: i,
                    object_data: vec![0xAB; 200],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        circuit.send_message(tracked(&outcomes, 1, OutgoingMessage::new(huge)));
        circuit.send(ChatFromViewer::default());
        assert!(circuit.transmit_cycle(Instant::now()));
        assert_eq!(*outcomes.lock(), vec![(1, false)]);
        let names: Vec<_> = sent(&mut rx).iter().map(|p| p.message_id.name()).collect();
        assert_eq!(names, vec!["ChatFromViewer"]);
    }
}
