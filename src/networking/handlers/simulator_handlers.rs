//! Handlers for circuits between neighbouring simulators

use super::DispatchTableBuilder;
use crate::networking::circuit::TerminationReason;
use crate::networking::packets::DisableSimulator;
use tracing::info;

pub fn register(builder: DispatchTableBuilder) -> DispatchTableBuilder {
    builder.on::<DisableSimulator, _>(|circuit, _| {
        info!("Neighbour on circuit {} is shutting down", circuit.code());
        circuit.terminate(TerminationReason::ClosedByPeer);
        Ok(())
    })
}
