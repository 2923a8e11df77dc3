//! Circuit manager - owns the socket, the registry and the handshake
//!
//! Inbound datagrams are demultiplexed by source endpoint. Traffic from an
//! unknown endpoint is only accepted if it is a `UseCircuitCode` handshake
//! for a pre-registered circuit whose identity matches; everything else is
//! dropped.

use crate::config::TransportSettings;
use crate::networking::circuit::{AgentCircuit, Circuit, CircuitIdentity, CircuitKind, CircuitRole, SimulatorCircuit};
use crate::networking::packets::{ChatFromViewer, ImprovedInstantMessage, MethodCall, OutgoingMessage, Packet, UseCircuitCode};
use crate::networking::pool::BufferPool;
use crate::networking::registry::CircuitRegistry;
use crate::networking::scheduler::{ObjectUpdateScheduler, SceneObjects};
use crate::networking::serialization::PacketCodec;
use crate::networking::transport::UdpTransport;
use crate::networking::{NetworkError, NetworkResult};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Work handed from circuits to the backing services
#[derive(Debug)]
pub enum ServiceEvent {
    Chat {
        agent_id: Uuid,
        chat: ChatFromViewer,
    },
    InstantMessage {
        agent_id: Uuid,
        message: ImprovedInstantMessage,
    },
    Method {
        agent_id: Uuid,
        godlike: bool,
        call: MethodCall,
    },
    /// A message that may only reach the agent over its event queue
    EventQueue {
        agent_id: Uuid,
        message: OutgoingMessage,
    },
}

/// Chat, instant messaging and event-queue delivery behind the circuits
#[async_trait]
pub trait MessageService: Send + Sync {
    async fn chat(&self, agent_id: Uuid, chat: ChatFromViewer);

    async fn instant_message(&self, agent_id: Uuid, message: ImprovedInstantMessage);

    async fn method(&self, agent_id: Uuid, godlike: bool, call: MethodCall);

    /// Deliver over the event queue. Without one the message fails.
    async fn event_queue(&self, agent_id: Uuid, message: OutgoingMessage) {
        debug!("No event queue for agent {}, dropping {}", agent_id, message.name());
        message.complete(false);
    }
}

/// Service that only logs what it receives
#[derive(Debug, Default)]
pub struct LoggingMessageService;

#[async_trait]
impl MessageService for LoggingMessageService {
    async fn chat(&self, agent_id: Uuid, chat: ChatFromViewer) {
        info!("Chat from {} on channel {}: {}", agent_id, chat.channel, chat.message);
    }

    async fn instant_message(&self, agent_id: Uuid, message: ImprovedInstantMessage) {
        info!(
            "Instant message from {} to {} (dialog {})",
            agent_id, message.to_agent_id, message.dialog
        );
    }

    async fn method(&self, agent_id: Uuid, godlike: bool, call: MethodCall) {
        info!(
            "{} method '{}' from {} with {} params",
            if godlike { "Godlike" } else { "Generic" },
            call.method,
            agent_id,
            call.params.len()
        );
    }
}

type SchedulerMap = RwLock<HashMap<Uuid, Arc<ObjectUpdateScheduler>>>;

pub struct CircuitManager {
    transport: UdpTransport,
    registry: Arc<CircuitRegistry>,
    schedulers: Arc<SchedulerMap>,
    settings: TransportSettings,
    scene: Arc<dyn SceneObjects>,
    service: Arc<dyn MessageService>,
    pool: Arc<BufferPool>,

    /// Channel from agent circuits to the service task
    services_tx: mpsc::UnboundedSender<ServiceEvent>,
    services_rx: Mutex<Option<mpsc::UnboundedReceiver<ServiceEvent>>>,
    service_task: Mutex<Option<JoinHandle<()>>>,

    /// Held while an endpoint is bound so racing handshakes register once
    handshake: Mutex<()>,
}

impl std::fmt::Debug for CircuitManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitManager")
            .field("local_addr", &self.transport.local_addr())
            .field("circuits", &self.registry.len())
            .finish()
    }
}

impl CircuitManager {
    /// Bind the socket. Nothing is received until [`start`](Self::start).
    pub async fn bind(
        settings: TransportSettings,
        scene: Arc<dyn SceneObjects>,
        service: Arc<dyn MessageService>,
    ) -> NetworkResult<Arc<Self>> {
        let transport = UdpTransport::bind(settings.network.bind_address).await?;
        let pool = Arc::new(BufferPool::new(
            settings.network.pool_capacity,
            settings.network.pool_buffer_size,
            Duration::from_millis(settings.network.pool_wait_ms),
        ));
        let (services_tx, services_rx) = mpsc::unbounded_channel();

        Ok(Arc::new(Self {
            transport,
            registry: Arc::new(CircuitRegistry::new()),
            schedulers: Arc::new(RwLock::new(HashMap::new())),
            settings,
            scene,
            service,
            pool,
            services_tx,
            services_rx: Mutex::new(Some(services_rx)),
            service_task: Mutex::new(None),
            handshake: Mutex::new(()),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    pub fn registry(&self) -> &Arc<CircuitRegistry> {
        &self.registry
    }

    /// Start the receive tasks and the service task
    pub fn start(self: &Arc<Self>) {
        if let Some(rx) = self.services_rx.lock().take() {
            let service = Arc::clone(&self.service);
            *self.service_task.lock() = Some(tokio::spawn(Self::run_services(service, rx)));
        }

        let manager: Weak<Self> = Arc::downgrade(self);
        self.transport.start(
            self.settings.network.receivers,
            Arc::new(move |data: Bytes, source: SocketAddr| {
                let Some(manager) = manager.upgrade() else {
                    return;
                };
                let result = panic::catch_unwind(AssertUnwindSafe(|| manager.handle_datagram(&data, source)));
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e @ NetworkError::HandshakeMismatch { .. })) => warn!("Dropping datagram from {}: {}", source, e),
                    Ok(Err(e)) => debug!("Dropping datagram from {}: {}", source, e),
                    Err(_) => error!("Receive handler panicked on datagram from {}", source),
                }
            }),
        );
        info!("Circuit manager listening on {}", self.local_addr());
    }

    async fn run_services(service: Arc<dyn MessageService>, mut rx: mpsc::UnboundedReceiver<ServiceEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                ServiceEvent::Chat { agent_id, chat } => service.chat(agent_id, chat).await,
                ServiceEvent::InstantMessage { agent_id, message } => service.instant_message(agent_id, message).await,
                ServiceEvent::Method { agent_id, godlike, call } => service.method(agent_id, godlike, call).await,
                ServiceEvent::EventQueue { agent_id, message } => service.event_queue(agent_id, message).await,
            }
        }
        debug!("Service channel closed");
    }

    /// Route one inbound datagram
    pub fn handle_datagram(&self, data: &[u8], source: SocketAddr) -> NetworkResult<()> {
        let packet = PacketCodec::decode(data)?;

        if let Some(circuit) = self.registry.by_endpoint(source) {
            circuit.packet_received(source, packet, Instant::now());
            return Ok(());
        }

        if !packet.is(UseCircuitCode::message_id()) {
            return Err(NetworkError::unknown_endpoint(source));
        }
        let request: UseCircuitCode = packet.decode()?;
        let circuit = self.handshake(source, &request)?;

        // The handshake itself is acknowledged straight away
        circuit.packet_received(source, packet, Instant::now());
        circuit.send(self.settings.region.handshake(request.agent_id));
        Ok(())
    }

    fn handshake(&self, source: SocketAddr, request: &UseCircuitCode) -> NetworkResult<Arc<Circuit>> {
        let _guard = self.handshake.lock();

        // Lost the race to another receive task
        if let Some(circuit) = self.registry.by_endpoint(source) {
            return Ok(circuit);
        }

        let code = request.code;
        let circuit = self.registry.by_code(code).ok_or_else(|| NetworkError::UnknownCircuit {
            endpoint: format!("{} (code {})", source, code),
        })?;
        if circuit.is_closing() {
            return Err(NetworkError::CircuitClosed { code });
        }

        let identity = circuit.identity();
        if identity.session_id != request.session_id || identity.agent_id != request.agent_id {
            return Err(NetworkError::HandshakeMismatch {
                code,
                reason: "session or agent id does not match".to_string(),
            });
        }
        if let Some(expected) = identity.expected_address {
            if expected.is_ipv4() != source.ip().is_ipv4() {
                return Err(NetworkError::HandshakeMismatch {
                    code,
                    reason: format!("address family of {} does not match {}", source.ip(), expected),
                });
            }
            if expected != source.ip() {
                return Err(NetworkError::HandshakeMismatch {
                    code,
                    reason: format!("{} is not the expected address {}", source.ip(), expected),
                });
            }
        }

        let circuit = self.registry.bind(code, source)?;
        circuit.start()?;
        info!("Circuit {} bound to {} for agent {}", code, source, request.agent_id);
        Ok(circuit)
    }

    /// Register a circuit that will be bound by its first handshake
    pub fn add_circuit(&self, code: u32, identity: CircuitIdentity, kind: CircuitKind) -> NetworkResult<Arc<Circuit>> {
        let agent_id = identity.agent_id;
        let mut agent_scheduler = None;
        let role: Box<dyn CircuitRole> = match kind {
            CircuitKind::Agent => {
                let scheduler = Arc::new(ObjectUpdateScheduler::new(
                    agent_id,
                    Arc::clone(&self.scene),
                    self.settings.scheduler_options(),
                ));
                agent_scheduler = Some(Arc::clone(&scheduler));
                Box::new(AgentCircuit::new(identity.clone(), self.services_tx.clone(), scheduler))
            }
            CircuitKind::Simulator => Box::new(SimulatorCircuit::new()),
        };

        let circuit = Circuit::new(
            code,
            identity,
            role,
            self.settings.circuit.options(),
            self.transport.sender(),
            Arc::clone(&self.pool),
        );
        self.registry.insert(Arc::clone(&circuit))?;
        let own_scheduler = agent_scheduler.as_ref().map(Arc::downgrade);
        if let Some(scheduler) = agent_scheduler {
            self.schedulers.write().insert(agent_id, scheduler);
        }

        let registry = Arc::downgrade(&self.registry);
        let schedulers = Arc::downgrade(&self.schedulers);
        circuit.on_terminate(move |reason| {
            if let Some(registry) = registry.upgrade() {
                if registry.remove(code).is_some() {
                    debug!("Circuit {} deregistered ({})", code, reason);
                }
            }
            if let (Some(own), Some(schedulers)) = (&own_scheduler, schedulers.upgrade()) {
                let mut schedulers = schedulers.write();
                // A newer circuit for the same agent may have replaced this entry
                let current = schedulers.get(&agent_id).map(Arc::as_ptr);
                if current.is_some_and(|current| std::ptr::eq(current, own.as_ptr())) {
                    schedulers.remove(&agent_id);
                }
            }
        });

        debug!("Circuit {} added ({:?}, agent {})", code, kind, agent_id);
        Ok(circuit)
    }

    /// Stop a circuit and wait for its threads
    pub fn remove_circuit(&self, code: u32) -> Option<Arc<Circuit>> {
        let circuit = self.registry.by_code(code)?;
        circuit.stop();
        Some(circuit)
    }

    /// Object update scheduler of an agent's circuit
    pub fn scheduler(&self, agent_id: Uuid) -> Option<Arc<ObjectUpdateScheduler>> {
        self.schedulers.read().get(&agent_id).cloned()
    }

    pub fn send_to_agent(&self, agent_id: Uuid, message: OutgoingMessage) -> NetworkResult<()> {
        let circuit = self.registry.by_agent(agent_id).ok_or_else(|| NetworkError::UnknownCircuit {
            endpoint: format!("agent {}", agent_id),
        })?;
        if circuit.is_closing() && message.is_reliable() {
            message.complete(false);
            return Err(NetworkError::CircuitClosed { code: circuit.code() });
        }
        circuit.send_message(message);
        Ok(())
    }

    /// Stop every circuit, then the transport and service tasks
    pub async fn shutdown(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let stopped = tokio::task::spawn_blocking(move || {
            let circuits = manager.registry.all();
            for circuit in &circuits {
                circuit.stop();
            }
            circuits.len()
        })
        .await;
        match stopped {
            Ok(count) => info!("Stopped {} circuits", count),
            Err(e) => error!("Circuit shutdown failed: {}", e),
        }

        self.transport.shutdown();
        if let Some(task) = self.service_task.lock().take() {
            task.abort();
        }
    }
}
