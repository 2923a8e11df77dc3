//! Agent-facing and simulator-facing circuit behaviour
//!
//! Both kinds share the transport engine in [`Circuit`]; a role only decides
//! which inbound messages are handled, where event-queue traffic goes, and
//! which extra workers run alongside the transmit loop.

use super::{Circuit, CircuitIdentity, CircuitKind};
use crate::networking::handlers::{agent_handlers, simulator_handlers, DispatchTableBuilder};
use crate::networking::manager::ServiceEvent;
use crate::networking::packets::OutgoingMessage;
use crate::networking::scheduler::{ObjectUpdateScheduler, UpdateSink};
use crate::networking::NetworkResult;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc;
use tracing::{error, warn};

pub trait CircuitRole: Send + Sync {
    fn kind(&self) -> CircuitKind;

    /// Add this role's handlers; called once while the circuit is built
    fn register_handlers(&self, builder: DispatchTableBuilder) -> DispatchTableBuilder;

    /// Take a message that may only travel over the event queue
    fn deliver_event_queue(&self, message: OutgoingMessage);

    fn on_start(&self, _circuit: &Arc<Circuit>) -> NetworkResult<()> {
        Ok(())
    }

    /// Signal workers to stop; must not block
    fn on_terminate(&self) {}

    /// Wait for workers after termination
    fn join(&self) {}
}

/// Viewer-facing circuit with its object-update scheduler
pub struct AgentCircuit {
    identity: CircuitIdentity,
    services: mpsc::UnboundedSender<ServiceEvent>,
    scheduler: Arc<ObjectUpdateScheduler>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AgentCircuit {
    pub fn new(
        identity: CircuitIdentity,
        services: mpsc::UnboundedSender<ServiceEvent>,
        scheduler: Arc<ObjectUpdateScheduler>,
    ) -> Self {
        Self {
            identity,
            services,
            scheduler,
            worker: Mutex::new(None),
        }
    }

    pub fn scheduler(&self) -> &Arc<ObjectUpdateScheduler> {
        &self.scheduler
    }
}

impl CircuitRole for AgentCircuit {
    fn kind(&self) -> CircuitKind {
        CircuitKind::Agent
    }

    fn register_handlers(&self, builder: DispatchTableBuilder) -> DispatchTableBuilder {
        agent_handlers::register(
            builder,
            agent_handlers::AgentContext {
                agent_id: self.identity.agent_id,
                session_id: self.identity.session_id,
                services: self.services.clone(),
                scheduler: Arc::clone(&self.scheduler),
            },
        )
    }

    fn deliver_event_queue(&self, message: OutgoingMessage) {
        let event = ServiceEvent::EventQueue {
            agent_id: self.identity.agent_id,
            message,
        };
        // A returned event drops its message, which reports failure
        if self.services.send(event).is_err() {
            warn!("No event queue for agent {}", self.identity.agent_id);
        }
    }

    fn on_start(&self, circuit: &Arc<Circuit>) -> NetworkResult<()> {
        let scheduler = Arc::clone(&self.scheduler);
        let sink: Arc<dyn UpdateSink> = Arc::clone(circuit) as Arc<dyn UpdateSink>;
        let handle = thread::Builder::new()
            .name(format!("objects-{}", circuit.code()))
            .spawn(move || scheduler.run(sink))?;
        *self.worker.lock() = Some(handle);
        Ok(())
    }

    fn on_terminate(&self) {
        self.scheduler.stop();
    }

    fn join(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                error!("Object update thread for agent {} panicked", self.identity.agent_id);
            }
        }
    }
}

/// Circuit to a neighbouring simulator
#[derive(Debug, Default)]
pub struct SimulatorCircuit;

impl SimulatorCircuit {
    pub fn new() -> Self {
        Self
    }
}

impl CircuitRole for SimulatorCircuit {
    fn kind(&self) -> CircuitKind {
        CircuitKind::Simulator
    }

    fn register_handlers(&self, builder: DispatchTableBuilder) -> DispatchTableBuilder {
        simulator_handlers::register(builder)
    }

    fn deliver_event_queue(&self, message: OutgoingMessage) {
        warn!("{} has no event queue on a simulator circuit", message.name());
        message.complete(false);
    }
}
