//! Inbound message dispatch
//!
//! A [`DispatchTable`] is built once when a circuit is created and never
//! changes afterwards. Typed registration decodes the message body before the
//! handler runs. Instant messages are routed a second time by their dialog byte,
//! generic and godlike messages by their method name.

use crate::networking::circuit::Circuit;
use crate::networking::packets::{
    GenericMessage, GodlikeMessage, ImprovedInstantMessage, MessageId, MethodCall, Packet,
};
use crate::networking::serialization::DecodedPacket;
use crate::networking::{NetworkError, NetworkResult};
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

pub mod agent_handlers;
pub mod simulator_handlers;

type Handler = Box<dyn Fn(&Circuit, &DecodedPacket) -> NetworkResult<()> + Send + Sync>;
type TypedHandler<P> = Box<dyn Fn(&Circuit, P) -> NetworkResult<()> + Send + Sync>;

/// What happened to an inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Handled,
    Unhandled,
}

enum Route {
    Direct(Handler),
    InstantMessage(HashMap<u8, TypedHandler<ImprovedInstantMessage>>),
    Method(HashMap<String, TypedHandler<MethodCall>>),
}

#[derive(Default)]
pub struct DispatchTable {
    routes: HashMap<MessageId, Route>,
}

impl DispatchTable {
    pub fn builder() -> DispatchTableBuilder {
        DispatchTableBuilder::default()
    }

    pub fn handles(&self, id: MessageId) -> bool {
        self.routes.contains_key(&id)
    }

    pub fn dispatch(&self, circuit: &Circuit, packet: &DecodedPacket) -> NetworkResult<Dispatch> {
        let Some(route) = self.routes.get(&packet.message_id) else {
            debug!("No handler for {} ({})", packet.message_id.name(), packet.message_id);
            return Ok(Dispatch::Unhandled);
        };

        match route {
            Route::Direct(handler) => handler(circuit, packet)?,
            Route::InstantMessage(dialogs) => {
                let dialog = packet
                    .payload
                    .get(ImprovedInstantMessage::DIALOG_OFFSET)
                    .copied()
                    .ok_or_else(|| NetworkError::malformed("Instant message too short for dialog"))?;
                let Some(handler) = dialogs.get(&dialog) else {
                    debug!("No handler for instant message dialog {}", dialog);
                    return Ok(Dispatch::Unhandled);
                };
                handler(circuit, packet.decode()?)?;
            }
            Route::Method(methods) => {
                let method = MethodCall::peek_method(&packet.payload)?.to_lowercase();
                let Some(handler) = methods.get(&method) else {
                    debug!("No handler for {} method '{}'", packet.message_id.name(), method);
                    return Ok(Dispatch::Unhandled);
                };
                let call = if packet.is(GodlikeMessage::message_id()) {
                    packet.decode::<GodlikeMessage>()?.0
                } else {
                    packet.decode::<GenericMessage>()?.0
                };
                handler(circuit, call)?;
            }
        }
        Ok(Dispatch::Handled)
    }
}

impl fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.routes.keys().map(|id| id.name()).collect();
        names.sort_unstable();
        f.debug_struct("DispatchTable").field("messages", &names).finish()
    }
}

#[derive(Default)]
pub struct DispatchTableBuilder {
    routes: HashMap<MessageId, Route>,
}

impl DispatchTableBuilder {
    /// Register a handler that receives the decoded message
    pub fn on<P, F>(mut self, handler: F) -> Self
    where
        P: Packet,
        F: Fn(&Circuit, P) -> NetworkResult<()> + Send + Sync + 'static,
    {
        let route = Route::Direct(Box::new(move |circuit, packet| handler(circuit, packet.decode::<P>()?)));
        self.routes.insert(P::message_id(), route);
        self
    }

    /// Register a handler for one instant-message dialog type
    pub fn on_dialog<F>(mut self, dialog: u8, handler: F) -> Self
    where
        F: Fn(&Circuit, ImprovedInstantMessage) -> NetworkResult<()> + Send + Sync + 'static,
    {
        let route = self
            .routes
            .entry(ImprovedInstantMessage::message_id())
            .or_insert_with(|| Route::InstantMessage(HashMap::new()));
        if let Route::InstantMessage(dialogs) = route {
            dialogs.insert(dialog, Box::new(handler));
        }
        self
    }

    /// Register a handler for a GenericMessage method (case-insensitive)
    pub fn on_generic<F>(self, method: &str, handler: F) -> Self
    where
        F: Fn(&Circuit, MethodCall) -> NetworkResult<()> + Send + Sync + 'static,
    {
        self.on_method(GenericMessage::message_id(), method, handler)
    }

    /// Register a handler for a GodlikeMessage method (case-insensitive)
    pub fn on_godlike<F>(self, method: &str, handler: F) -> Self
    where
        F: Fn(&Circuit, MethodCall) -> NetworkResult<()> + Send + Sync + 'static,
    {
        self.on_method(GodlikeMessage::message_id(), method, handler)
    }

    fn on_method<F>(mut self, id: MessageId, method: &str, handler: F) -> Self
    where
        F: Fn(&Circuit, MethodCall) -> NetworkResult<()> + Send + Sync + 'static,
    {
        let route = self.routes.entry(id).or_insert_with(|| Route::Method(HashMap::new()));
        if let Route::Method(methods) = route {
            methods.insert(method.to_lowercase(), Box::new(handler));
        }
        self
    }

    pub fn build(self) -> DispatchTable {
        DispatchTable { routes: self.routes }
    }
}
