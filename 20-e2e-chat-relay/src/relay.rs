//! Relay dispatch: turns one inbound session event into outbound deliveries.
//!
//! The dispatcher never inspects payloads. Whatever a session sends is
//! rebroadcast unchanged to the other joined members of its room.

use clap::ValueEnum;
use tracing::{debug, info, warn};

use crate::{
    message::{ChatMessage, ClientEvent, PublicKey, ServerEvent},
    registry::{RoomRegistry, SessionId},
};

/// How the relay treats the room name carried by `JOIN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum RoomPolicy {
    /// Ignore the requested name; sessions stay in the room assigned on connect.
    #[default]
    Assigned,
    /// Move the session into the requested room when one is given.
    Requested,
}

#[derive(Debug)]
pub enum Inbound {
    Connected,
    Event(ClientEvent),
    /// A frame that failed schema validation, with the parser's reason.
    Malformed(String),
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub to: SessionId,
    pub event: ServerEvent,
}

impl Delivery {
    fn new(to: SessionId, event: ServerEvent) -> Self {
        Self { to, event }
    }
}

#[derive(Debug)]
pub struct Relay {
    registry: RoomRegistry,
    policy: RoomPolicy,
}

impl Relay {
    pub fn new(registry: RoomRegistry, policy: RoomPolicy) -> Self {
        Self { registry, policy }
    }

    /// Sessions currently connected, joined or not.
    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    pub fn handle(&mut self, session: &SessionId, inbound: Inbound) -> Vec<Delivery> {
        match inbound {
            Inbound::Connected => self.on_connect(session),
            Inbound::Event(ClientEvent::Join(requested)) => self.on_join(session, requested),
            Inbound::Event(ClientEvent::Message(message)) => self.on_message(session, message),
            Inbound::Event(ClientEvent::PublicKey(key)) => self.on_public_key(session, key),
            Inbound::Malformed(reason) => self.on_malformed(session, reason),
            Inbound::Disconnected => self.on_disconnect(session),
        }
    }

    fn on_connect(&mut self, session: &SessionId) -> Vec<Delivery> {
        let room = self.registry.connect(session.clone());
        debug!(%session, room, "session assigned");
        Vec::new()
    }

    fn on_join(&mut self, session: &SessionId, requested: Option<String>) -> Vec<Delivery> {
        let requested = match self.policy {
            RoomPolicy::Assigned => None,
            RoomPolicy::Requested => requested.filter(|room| !room.trim().is_empty()),
        };

        let Some(outcome) = self.registry.join(session, requested.as_deref()) else {
            warn!(%session, "join from unknown session");
            return Vec::new();
        };
        info!(%session, room = %outcome.room, "session joined room");

        let mut deliveries = Vec::new();
        if let Some(left) = &outcome.left {
            deliveries.extend(self.broadcast(left, session, ServerEvent::UserDisconnected));
        }
        deliveries.push(Delivery::new(
            session.clone(),
            ServerEvent::RoomJoined(outcome.room.clone()),
        ));
        deliveries.extend(self.broadcast(&outcome.room, session, ServerEvent::NewConnection));
        deliveries
    }

    fn on_message(&mut self, session: &SessionId, message: ChatMessage) -> Vec<Delivery> {
        debug!(%session, bytes = message.text.len(), "relaying message");
        self.broadcast_from(session, ServerEvent::Message(message))
    }

    fn on_public_key(&mut self, session: &SessionId, key: PublicKey) -> Vec<Delivery> {
        debug!(%session, key = %key, "relaying public key");
        self.broadcast_from(session, ServerEvent::PublicKey(key))
    }

    fn on_malformed(&mut self, session: &SessionId, reason: String) -> Vec<Delivery> {
        warn!(%session, %reason, "rejected malformed frame");
        vec![Delivery::new(
            session.clone(),
            ServerEvent::Error(format!("malformed frame: {reason}")),
        )]
    }

    fn on_disconnect(&mut self, session: &SessionId) -> Vec<Delivery> {
        match self.registry.disconnect(session) {
            Some(room) => {
                info!(%session, %room, "session left room");
                self.broadcast(&room, session, ServerEvent::UserDisconnected)
            }
            None => Vec::new(),
        }
    }

    /// Broadcast into the sender's current room.
    fn broadcast_from(&self, session: &SessionId, event: ServerEvent) -> Vec<Delivery> {
        match self.registry.room_of(session) {
            Some(room) => self.broadcast(room, session, event),
            None => {
                warn!(%session, "event from unknown session");
                Vec::new()
            }
        }
    }

    fn broadcast(&self, room: &str, sender: &SessionId, event: ServerEvent) -> Vec<Delivery> {
        self.registry
            .members_except(room, sender)
            .into_iter()
            .map(|to| Delivery::new(to, event.clone()))
            .collect()
    }
}
