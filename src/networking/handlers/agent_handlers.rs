//! Handlers for viewer-facing circuits
//!
//! Session bookkeeping is handled here; chat, instant messages and method
//! calls are forwarded to the backing message service.

use super::DispatchTableBuilder;
use crate::networking::manager::ServiceEvent;
use crate::networking::packets::{
    ChatFromViewer, CompleteAgentMovement, LogoutReply, LogoutRequest, OutgoingMessage,
    RegionHandshakeReply,
};
use crate::networking::scheduler::ObjectUpdateScheduler;
use crate::networking::{NetworkError, NetworkResult};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Instant message dialogs forwarded to the message service
pub const FORWARDED_DIALOGS: [u8; 3] = [
    0,  // MessageFromAgent
    41, // StartTyping
    42, // StopTyping
];

pub const GENERIC_METHODS: [&str; 1] = ["autopilot"];

pub const GODLIKE_METHODS: [&str; 2] = ["kickestate", "refreshmapvisibility"];

pub struct AgentContext {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub services: mpsc::UnboundedSender<ServiceEvent>,
    pub scheduler: Arc<ObjectUpdateScheduler>,
}

impl AgentContext {
    fn owns(&self, agent_id: Uuid, session_id: Uuid, message: &str) -> bool {
        let owned = agent_id == self.agent_id && session_id == self.session_id;
        if !owned {
            warn!("{} for agent {} carries a foreign session, dropping", message, self.agent_id);
        }
        owned
    }

    fn forward(&self, event: ServiceEvent) -> NetworkResult<()> {
        self.services.send(event).map_err(|_| NetworkError::Transport {
            reason: "message service stopped".to_string(),
        })
    }
}

pub fn register(builder: DispatchTableBuilder, context: AgentContext) -> DispatchTableBuilder {
    let ctx = Arc::new(context);

    let mut builder = builder
        .on::<LogoutRequest, _>({
            let ctx = Arc::clone(&ctx);
            move |circuit, request| {
                if !ctx.owns(request.agent_id, request.session_id, "LogoutRequest") {
                    return Ok(());
                }
                info!("Agent {} logging out", ctx.agent_id);
                circuit.send_logout_reply(OutgoingMessage::new(LogoutReply {
                    agent_id: ctx.agent_id,
                    session_id: ctx.session_id,
                    item_ids: Vec::new(),
                }));
                Ok(())
            }
        })
        .on::<CompleteAgentMovement, _>({
            let ctx = Arc::clone(&ctx);
            move |circuit, movement| {
                if !ctx.owns(movement.agent_id, movement.session_id, "CompleteAgentMovement") {
                    return Ok(());
                }
                info!("Agent {} arrived on circuit {}", ctx.agent_id, circuit.code());
                ctx.scheduler.schedule_first_update();
                Ok(())
            }
        })
        .on::<RegionHandshakeReply, _>({
            let ctx = Arc::clone(&ctx);
            move |circuit, reply| {
                debug!(
                    "Agent {} replied to region handshake on circuit {} (flags {:#x})",
                    ctx.agent_id,
                    circuit.code(),
                    reply.flags
                );
                Ok(())
            }
        })
        .on::<ChatFromViewer, _>({
            let ctx = Arc::clone(&ctx);
            move |_, chat| {
                if !ctx.owns(chat.agent_id, chat.session_id, "ChatFromViewer") {
                    return Ok(());
                }
                ctx.forward(ServiceEvent::Chat {
                    agent_id: ctx.agent_id,
                    chat,
                })
            }
        });

    for dialog in FORWARDED_DIALOGS {
        let ctx = Arc::clone(&ctx);
        builder = builder.on_dialog(dialog, move |_, message| {
            if !ctx.owns(message.agent_id, message.session_id, "ImprovedInstantMessage") {
                return Ok(());
            }
            ctx.forward(ServiceEvent::InstantMessage {
                agent_id: ctx.agent_id,
                message,
            })
        });
    }

    for method in GENERIC_METHODS {
        let ctx = Arc::clone(&ctx);
        builder = builder.on_generic(method, move |_, call| {
            if !ctx.owns(call.agent_id, call.session_id, "GenericMessage") {
                return Ok(());
            }
            ctx.forward(ServiceEvent::Method {
                agent_id: ctx.agent_id,
                godlike: false,
                call,
            })
        });
    }

    for method in GODLIKE_METHODS {
        let ctx = Arc::clone(&ctx);
        builder = builder.on_godlike(method, move |_, call| {
            if !ctx.owns(call.agent_id, call.session_id, "GodlikeMessage") {
                return Ok(());
            }
            ctx.forward(ServiceEvent::Method {
                agent_id: ctx.agent_id,
                godlike: true,
                call,
            })
        });
    }

    builder
}
