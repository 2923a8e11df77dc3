//! Circuit registry keyed by circuit code, remote endpoint and agent
//!
//! All three maps live behind one lock so a circuit is never visible under
//! one key and missing under another.

use crate::networking::circuit::Circuit;
use crate::networking::{NetworkError, NetworkResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Default)]
struct Maps {
    by_code: HashMap<u32, Arc<Circuit>>,
    endpoints: HashMap<SocketAddr, u32>,
    agents: HashMap<Uuid, u32>,
}

#[derive(Default)]
pub struct CircuitRegistry {
    maps: RwLock<Maps>,
}

impl std::fmt::Debug for CircuitRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let maps = self.maps.read();
        f.debug_struct("CircuitRegistry")
            .field("circuits", &maps.by_code.len())
            .field("bound", &maps.endpoints.len())
            .finish()
    }
}

impl CircuitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an unbound circuit under its code and agent
    pub fn insert(&self, circuit: Arc<Circuit>) -> NetworkResult<()> {
        let mut maps = self.maps.write();
        let code = circuit.code();
        if maps.by_code.contains_key(&code) {
            return Err(NetworkError::Transport {
                reason: format!("circuit code {} already registered", code),
            });
        }
        let agent_id = circuit.identity().agent_id;
        if !agent_id.is_nil() {
            maps.agents.insert(agent_id, code);
        }
        maps.by_code.insert(code, circuit);
        Ok(())
    }

    /// Attach an endpoint to a registered circuit.
    ///
    /// Fails if the code is unknown or the endpoint already belongs to
    /// another circuit.
    pub fn bind(&self, code: u32, endpoint: SocketAddr) -> NetworkResult<Arc<Circuit>> {
        let mut maps = self.maps.write();
        let circuit = maps
            .by_code
            .get(&code)
            .cloned()
            .ok_or_else(|| NetworkError::UnknownCircuit {
                endpoint: format!("code {}", code),
            })?;
        match maps.endpoints.get(&endpoint) {
            Some(&owner) if owner != code => {
                return Err(NetworkError::HandshakeMismatch {
                    code,
                    reason: format!("{} is bound to circuit {}", endpoint, owner),
                });
            }
            _ => {}
        }
        if let Some(previous) = circuit.endpoint() {
            maps.endpoints.remove(&previous);
        }
        maps.endpoints.insert(endpoint, code);
        circuit.bind(endpoint);
        Ok(circuit)
    }

    /// Drop a circuit from every map. Returns it only on the first call.
    pub fn remove(&self, code: u32) -> Option<Arc<Circuit>> {
        let mut maps = self.maps.write();
        let circuit = maps.by_code.remove(&code)?;
        if let Some(endpoint) = circuit.endpoint() {
            if maps.endpoints.get(&endpoint) == Some(&code) {
                maps.endpoints.remove(&endpoint);
            }
        }
        let agent_id = circuit.identity().agent_id;
        if maps.agents.get(&agent_id) == Some(&code) {
            maps.agents.remove(&agent_id);
        }
        Some(circuit)
    }

    pub fn by_code(&self, code: u32) -> Option<Arc<Circuit>> {
        self.maps.read().by_code.get(&code).cloned()
    }

    pub fn by_endpoint(&self, endpoint: SocketAddr) -> Option<Arc<Circuit>> {
        let maps = self.maps.read();
        let code = maps.endpoints.get(&endpoint)?;
        maps.by_code.get(code).cloned()
    }

    pub fn by_agent(&self, agent_id: Uuid) -> Option<Arc<Circuit>> {
        let maps = self.maps.read();
        let code = maps.agents.get(&agent_id)?;
        maps.by_code.get(code).cloned()
    }

    pub fn len(&self) -> usize {
        self.maps.read().by_code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all(&self) -> Vec<Arc<Circuit>> {
        self.maps.read().by_code.values().cloned().collect()
    }
}
